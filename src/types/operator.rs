//! # Query Operators
//!
//! Operators supported by the `find` read path over the secondary index.
//! Equality and the range operators evaluate against the value sort order;
//! the regex pair evaluates against string-like values only.
//!
//! Query paths bind an operator and its operands into an
//! [`OperatorMatcher`] once, so regex operands compile a single time no
//! matter how many candidate values the index walk visits.

use eyre::{ensure, Result};
use regex::Regex;

use super::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanOrEquals,
    LessThan,
    LessThanOrEquals,
    Between,
    Regex,
    NotRegex,
}

impl Operator {
    /// Number of operand values the operator consumes.
    pub fn arity(&self) -> usize {
        match self {
            Operator::Between => 2,
            _ => 1,
        }
    }

    /// Binds the operator to its operands, validating arity and compiling
    /// regex operands.
    ///
    /// BETWEEN is inclusive of the low bound and exclusive of the high
    /// bound. The regex operators only ever match string-like stored
    /// values: REGEX fails on a number, and NOT_REGEX therefore matches it.
    pub fn bind(self, operands: &[Value]) -> Result<OperatorMatcher> {
        ensure!(
            operands.len() == self.arity(),
            "operator {:?} takes {} value(s), got {}",
            self,
            self.arity(),
            operands.len()
        );
        let regex = match self {
            Operator::Regex | Operator::NotRegex => Some(compile_regex(&operands[0])?),
            _ => None,
        };
        Ok(OperatorMatcher {
            operator: self,
            operands: operands.to_vec(),
            regex,
        })
    }
}

/// An operator bound to its operands, ready to test stored values.
#[derive(Debug, Clone)]
pub struct OperatorMatcher {
    operator: Operator,
    operands: Vec<Value>,
    regex: Option<Regex>,
}

impl OperatorMatcher {
    pub fn operator(&self) -> Operator {
        self.operator
    }

    pub fn matches(&self, stored: &Value) -> bool {
        match self.operator {
            Operator::Equals => stored == &self.operands[0],
            Operator::NotEquals => stored != &self.operands[0],
            Operator::GreaterThan => stored > &self.operands[0],
            Operator::GreaterThanOrEquals => stored >= &self.operands[0],
            Operator::LessThan => stored < &self.operands[0],
            Operator::LessThanOrEquals => stored <= &self.operands[0],
            Operator::Between => stored >= &self.operands[0] && stored < &self.operands[1],
            Operator::Regex => self.regex_matches(stored),
            Operator::NotRegex => !self.regex_matches(stored),
        }
    }

    fn regex_matches(&self, stored: &Value) -> bool {
        let regex = self
            .regex
            .as_ref()
            .unwrap_or_else(|| unreachable!("regex operator bound without a compiled pattern"));
        match stored.as_text() {
            Some(text) => regex.is_match(text),
            None => false,
        }
    }
}

fn compile_regex(pattern: &Value) -> Result<Regex> {
    let pattern_text = match pattern.as_text() {
        Some(text) => text.to_string(),
        // A non-string operand cannot be a pattern; match its display form
        // literally, the way stringifying drivers hand it over.
        None => regex::escape(&pattern.to_string()),
    };
    Regex::new(&pattern_text)
        .map_err(|e| eyre::eyre!("invalid regex operand '{}': {}", pattern_text, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(op: Operator, stored: &Value, operands: &[Value]) -> bool {
        op.bind(operands).unwrap().matches(stored)
    }

    #[test]
    fn range_operators_follow_value_order() {
        let stored = Value::Integer(5);
        assert!(matches(Operator::GreaterThan, &stored, &[Value::Integer(4)]));
        assert!(matches(
            Operator::LessThanOrEquals,
            &stored,
            &[Value::Long(5)]
        ));
        assert!(!matches(Operator::LessThan, &stored, &[Value::Double(5.0)]));
    }

    #[test]
    fn between_is_inclusive_exclusive() {
        let bounds = [Value::Integer(1), Value::Integer(3)];
        assert!(matches(Operator::Between, &Value::Integer(1), &bounds));
        assert!(matches(Operator::Between, &Value::Integer(2), &bounds));
        assert!(!matches(Operator::Between, &Value::Integer(3), &bounds));
    }

    #[test]
    fn regex_only_touches_string_like_values() {
        let pattern = [Value::String("^foo.*".to_string())];
        assert!(matches(
            Operator::Regex,
            &Value::String("foobar".to_string()),
            &pattern
        ));
        assert!(!matches(Operator::Regex, &Value::Integer(1), &pattern));
        assert!(matches(Operator::NotRegex, &Value::Integer(1), &pattern));
    }

    #[test]
    fn wrong_arity_is_an_error() {
        assert!(Operator::Between.bind(&[Value::Integer(1)]).is_err());
        assert!(Operator::Equals.bind(&[]).is_err());
    }

    #[test]
    fn invalid_regex_is_an_error() {
        assert!(Operator::Regex
            .bind(&[Value::String("(".to_string())])
            .is_err());
    }
}
