//! # Engine Storage Scenario Tests
//!
//! End-to-end scenarios over a full engine (buffer + database +
//! transporter), specifically:
//! 1. Durability across stop/start cycles, with and without a forced
//!    sync
//! 2. Overlay correctness: reads compose the buffer over the database
//!    identically before and after transport
//! 3. Historical reads answer as of a version
//! 4. Restart after a torn flush rebalances the block families
//!
//! ## Background
//!
//! The buffer acknowledges a write once it is fsynced; transport moves
//! aged prefixes into sealed blocks and truncates only after the
//! database acknowledges its own sync. Every scenario here would catch a
//! hole in that pipeline as either lost data or a double-observed write.

use std::path::Path;

use stratadb::db::FamilyKind;
use stratadb::{Config, Database, Engine, Operator, Store, Value};
use tempfile::tempdir;

fn engine(root: &Path) -> Engine {
    let config = Config::new(root.join("buffer"), root.join("database"));
    let engine = Engine::new(&config).unwrap();
    engine.start().unwrap();
    engine
}

mod durability_tests {
    use super::*;

    #[test]
    fn writes_survive_restart_without_a_sync() {
        let dir = tempdir().unwrap();
        {
            let engine = engine(dir.path());
            engine.add("name", Value::String("ada".into()), 1).unwrap();
            engine.stop();
        }
        let engine = engine(dir.path());
        assert_eq!(
            engine.select("name", 1, None).unwrap(),
            vec![Value::String("ada".into())],
            "an acknowledged write SHOULD replay from the buffer"
        );
    }

    #[test]
    fn writes_survive_restart_after_transport() {
        let dir = tempdir().unwrap();
        {
            let engine = engine(dir.path());
            for i in 0..25 {
                engine.add("n", Value::Integer(i), 1).unwrap();
            }
            engine.trigger_sync().unwrap();
            assert_eq!(engine.backlog(), 0, "sync SHOULD drain the buffer");
            engine.stop();
        }
        let engine = engine(dir.path());
        assert_eq!(engine.select("n", 1, None).unwrap().len(), 25);
    }

    #[test]
    fn versions_stay_monotonic_across_restart() {
        let dir = tempdir().unwrap();
        {
            let engine = engine(dir.path());
            engine.add("k", Value::Integer(1), 1).unwrap();
            engine.remove("k", Value::Integer(1), 1).unwrap();
            engine.stop();
        }
        let engine = engine(dir.path());
        // A write stamped with a reused version would fold before the
        // old remove and vanish.
        engine.add("k", Value::Integer(1), 1).unwrap();
        assert_eq!(engine.select("k", 1, None).unwrap(), vec![Value::Integer(1)]);
    }
}

mod overlay_tests {
    use super::*;

    #[test]
    fn reads_are_identical_before_and_after_transport() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        engine.add("age", Value::Integer(30), 1).unwrap();
        engine.add("age", Value::Integer(40), 2).unwrap();
        engine.remove("age", Value::Integer(30), 1).unwrap();
        engine.add("age", Value::Integer(35), 1).unwrap();

        let before_select = engine.select("age", 1, None).unwrap();
        let before_find = engine
            .find("age", Operator::GreaterThanOrEquals, &[Value::Integer(35)], None)
            .unwrap()
            .iter()
            .collect::<Vec<_>>();

        engine.trigger_sync().unwrap();

        assert_eq!(engine.select("age", 1, None).unwrap(), before_select);
        assert_eq!(
            engine
                .find("age", Operator::GreaterThanOrEquals, &[Value::Integer(35)], None)
                .unwrap()
                .iter()
                .collect::<Vec<_>>(),
            before_find
        );
    }

    #[test]
    fn search_composes_buffer_over_database() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        engine
            .add("bio", Value::String("storage engines in rust".into()), 1)
            .unwrap();
        engine.trigger_sync().unwrap();
        engine
            .add("bio", Value::String("storage for graphs".into()), 2)
            .unwrap();

        let both = engine.search("bio", "storage").unwrap();
        assert_eq!(both.iter().collect::<Vec<_>>(), vec![1, 2]);
        let narrowed = engine.search("bio", "storage rust").unwrap();
        assert_eq!(narrowed.iter().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn historical_reads_answer_as_of_a_version() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        engine.add("k", Value::Integer(1), 7).unwrap();
        engine.add("k", Value::Integer(2), 7).unwrap();
        engine.remove("k", Value::Integer(1), 7).unwrap();

        // The present view holds exactly one survivor; some historical
        // version held both.
        assert_eq!(engine.select("k", 7, None).unwrap(), vec![Value::Integer(2)]);
        let mut saw_both = false;
        for version in 1..100 {
            let at = engine.select("k", 7, Some(version)).unwrap();
            if at.len() == 2 {
                saw_both = true;
            }
        }
        assert!(saw_both, "some as-of view SHOULD hold both values");
    }
}

mod rebalance_tests {
    use super::*;

    #[test]
    fn restart_after_torn_flush_rebalances_the_families() {
        let dir = tempdir().unwrap();
        let database_dir = dir.path().join("db");
        {
            let database = Database::new(&database_dir, 1024);
            database.start().unwrap();
            database
                .accept(stratadb::Revision::stamp(
                    stratadb::Write::add("k", Value::Integer(1), 1),
                    1,
                ))
                .unwrap();
            database.trigger_sync().unwrap();
            database.stop();
        }

        // Simulate the torn flush: one family's directory disappears.
        std::fs::remove_dir_all(database_dir.join("csb")).unwrap();
        std::fs::create_dir_all(database_dir.join("csb")).unwrap();

        let database = Database::new(&database_dir, 1024);
        database.start().unwrap();
        assert_eq!(database.block_count(FamilyKind::Primary), 1);
        assert_eq!(database.block_count(FamilyKind::Secondary), 1);
        assert_eq!(database.block_count(FamilyKind::Search), 1);
    }

    #[test]
    fn engine_restarts_cleanly_after_a_torn_database_flush() {
        let dir = tempdir().unwrap();
        {
            let engine = engine(dir.path());
            engine.add("k", Value::Integer(1), 1).unwrap();
            engine.trigger_sync().unwrap();
            engine.stop();
        }

        let csb = dir
            .path()
            .join("database")
            .join("default")
            .join("csb");
        std::fs::remove_dir_all(&csb).unwrap();
        std::fs::create_dir_all(&csb).unwrap();

        let engine = engine(dir.path());
        assert!(engine.is_running());
        // The torn block's data is gone with the imbalance, but the
        // engine accepts writes again and indexes them everywhere.
        engine.add("k", Value::Integer(2), 1).unwrap();
        assert!(engine
            .find("k", Operator::Equals, &[Value::Integer(2)], None)
            .unwrap()
            .contains(1));
    }
}

mod environment_tests {
    use super::*;

    #[test]
    fn environments_isolate_their_directories() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().join("buffer"), dir.path().join("database"));

        let staging = Engine::for_environment(&config, "staging").unwrap();
        staging.start().unwrap();
        staging.add("k", Value::Integer(1), 1).unwrap();

        let prod = Engine::for_environment(&config, "prod").unwrap();
        prod.start().unwrap();
        assert!(prod.select("k", 1, None).unwrap().is_empty());
        assert_eq!(staging.environment(), "staging");
    }

    #[test]
    fn environment_names_are_sanitized_to_directory_safe_forms() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().join("buffer"), dir.path().join("database"));
        let engine =
            Engine::for_environment(&config, "$_%&test_@envir==--onment*_*").unwrap();
        assert_eq!(engine.environment(), "_test_environment_");
        assert!(engine
            .buffer_directory()
            .ends_with(Path::new("buffer").join("_test_environment_")));
    }

    #[test]
    fn nested_buffer_and_database_directories_are_rejected() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path(), dir.path().join("database"));
        assert!(Engine::new(&config).is_err());
        let same = Config::new(dir.path().join("x"), dir.path().join("x"));
        assert!(Engine::new(&same).is_err());
    }
}
