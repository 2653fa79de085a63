//! # Version Registry and Change Notification
//!
//! The engine tracks, per token, the version of the newest write that
//! touched it, and notifies registered atomic operations when a watched
//! token moves. Together these give atomic operations their optimistic
//! concurrency: observe a token's version at read time, validate it at
//! commit time, and learn about conflicts in between.
//!
//! ## No Missed Notifications
//!
//! `publish` bumps the token versions first and drains listeners second;
//! `observe` registers the listener first and checks the version second.
//! Whatever the interleaving, a write either arrives after registration
//! (the drain finds the listener) or before the check (the observer
//! notifies itself). An operation can therefore never stay open past a
//! conflicting write, even with writers racing registration.
//!
//! Notification is one-way and absorbing: the first notification flips
//! the operation's `open` flag; later ones are no-ops. Dead listeners
//! (dropped operations) fall out on the next drain via their weak
//! references.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};

use super::locks::Token;
use crate::types::Revision;

/// Shared flag block between an atomic operation and the registry.
#[derive(Debug, Default)]
pub struct OperationState {
    open: AtomicBool,
    notified: AtomicBool,
}

impl OperationState {
    pub fn new_open() -> Arc<Self> {
        Arc::new(Self {
            open: AtomicBool::new(true),
            notified: AtomicBool::new(false),
        })
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn was_notified(&self) -> bool {
        self.notified.load(Ordering::Acquire)
    }

    /// Closes without a notification (commit or abort).
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    /// Flips open -> closed because a watched token changed. Absorbing;
    /// only the first call observes the transition.
    pub fn notify(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            self.notified.store(true, Ordering::Release);
        }
    }
}

#[derive(Default)]
pub struct TokenRegistry {
    versions: RwLock<HashMap<Token, i64>>,
    listeners: Mutex<HashMap<Token, Vec<Weak<OperationState>>>>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The version of the newest write that touched `token` (0 when
    /// nothing has).
    pub fn version_of(&self, token: &Token) -> i64 {
        self.versions.read().get(token).copied().unwrap_or(0)
    }

    /// Registers `state` as a listener on `token`, then re-checks the
    /// version: a write that slipped in between the caller's observation
    /// and this registration notifies immediately.
    pub fn observe(&self, token: Token, state: &Arc<OperationState>, observed: i64) {
        self.listeners
            .lock()
            .entry(token.clone())
            .or_default()
            .push(Arc::downgrade(state));
        if self.version_of(&token) > observed {
            state.notify();
        }
    }

    /// Records that `revision` touched `tokens` and notifies every
    /// listener watching any of them.
    pub fn publish(&self, revision: &Revision, tokens: &[Token]) {
        {
            let mut versions = self.versions.write();
            for token in tokens {
                versions.insert(token.clone(), revision.version);
            }
        }
        let drained: Vec<Weak<OperationState>> = {
            let mut listeners = self.listeners.lock();
            tokens
                .iter()
                .filter_map(|token| listeners.remove(token))
                .flatten()
                .collect()
        };
        for weak in drained {
            if let Some(state) = weak.upgrade() {
                state.notify();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Value, Write};

    fn revision(version: i64) -> Revision {
        Revision::stamp(Write::add("foo", Value::Integer(0), 1), version)
    }

    #[test]
    fn publish_notifies_registered_listeners_once() {
        let registry = TokenRegistry::new();
        let state = OperationState::new_open();
        let token = Token::Field("foo".into(), 1);
        registry.observe(token.clone(), &state, 0);
        assert!(state.is_open());

        registry.publish(&revision(5), &[token.clone()]);
        assert!(!state.is_open());
        assert!(state.was_notified());

        // A second publish is a no-op for an already-notified state.
        registry.publish(&revision(6), &[token]);
        assert!(state.was_notified());
    }

    #[test]
    fn late_registration_self_notifies() {
        let registry = TokenRegistry::new();
        let token = Token::Field("foo".into(), 1);
        registry.publish(&revision(9), &[token.clone()]);

        let state = OperationState::new_open();
        registry.observe(token, &state, 3);
        assert!(!state.is_open(), "observer SHOULD notice the missed write");
    }

    #[test]
    fn unrelated_tokens_do_not_notify() {
        let registry = TokenRegistry::new();
        let state = OperationState::new_open();
        registry.observe(Token::Key("foo".into()), &state, 0);
        registry.publish(&revision(2), &[Token::Key("bar".into())]);
        assert!(state.is_open());
    }

    #[test]
    fn versions_default_to_zero_and_track_publishes() {
        let registry = TokenRegistry::new();
        let token = Token::Record(4);
        assert_eq!(registry.version_of(&token), 0);
        registry.publish(&revision(11), &[token.clone()]);
        assert_eq!(registry.version_of(&token), 11);
    }
}
