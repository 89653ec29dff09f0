//! Runtime configuration tests
//!
//! Snapshot publishing and stream-client reconciliation on refresh.
//! Run with: cargo test --test runtime_config_tests

mod common;

use std::sync::{Arc, Mutex as StdMutex};

use common::*;
use incidentd::core::Severity;
use incidentd::db::{Database, RuleRow, RuntimeTables, SourceRow};
use incidentd::runtime::SourceLauncher;

#[derive(Default)]
struct RecordingLauncher {
    launched: StdMutex<Vec<i64>>,
    stopped: StdMutex<Vec<i64>>,
}

impl SourceLauncher for RecordingLauncher {
    fn launch(&self, source: Arc<SourceRow>) {
        self.launched.lock().unwrap().push(source.id);
    }

    fn stop(&self, source_id: i64) {
        self.stopped.lock().unwrap().push(source_id);
    }
}

fn icinga_source(id: i64, name: &str) -> SourceRow {
    SourceRow {
        id,
        name: name.to_string(),
        kind: "icinga2".to_string(),
        base_url: Some("https://icinga.example:5665".to_string()),
        auth_user: Some("root".to_string()),
        auth_pass: Some("pw".to_string()),
        insecure_tls: false,
        listener_password: None,
    }
}

#[tokio::test]
async fn refresh_reconciles_stream_clients() {
    let h = harness(RuntimeTables::default()).await;
    let launcher = RecordingLauncher::default();

    // A new source appears.
    let mut tables = RuntimeTables::default();
    tables.sources.push(icinga_source(1, "primary"));
    h.db.seed_runtime(tables).await;
    h.runtime.refresh(Some(&launcher)).await.unwrap();
    assert_eq!(*launcher.launched.lock().unwrap(), vec![1]);
    assert!(launcher.stopped.lock().unwrap().is_empty());

    // Unchanged source: nothing happens.
    h.runtime.refresh(Some(&launcher)).await.unwrap();
    assert_eq!(*launcher.launched.lock().unwrap(), vec![1]);

    // Changed source: restarted.
    let mut tables = RuntimeTables::default();
    tables.sources.push(icinga_source(1, "renamed"));
    h.db.seed_runtime(tables).await;
    h.runtime.refresh(Some(&launcher)).await.unwrap();
    assert_eq!(*launcher.launched.lock().unwrap(), vec![1, 1]);
    assert_eq!(*launcher.stopped.lock().unwrap(), vec![1]);

    // Removed source: stopped.
    h.db.seed_runtime(RuntimeTables::default()).await;
    h.runtime.refresh(Some(&launcher)).await.unwrap();
    assert_eq!(*launcher.stopped.lock().unwrap(), vec![1, 1]);
}

#[tokio::test]
async fn new_rules_apply_to_subsequent_events_only_after_refresh() {
    let h = harness(RuntimeTables::default()).await;

    h.engine
        .process_event(state_event(1, "h1", Severity::Crit, 100))
        .await
        .unwrap();
    let incident = &h.db.incidents().await[0];
    assert!(incident.rules_matched.is_empty(), "no rules configured yet");

    // A rule appears in the database but is not yet published.
    let mut tables = RuntimeTables::default();
    tables.rules.push(RuleRow {
        id: 7,
        name: "late arrival".to_string(),
        active: true,
        object_filter: None,
        timeperiod_id: None,
    });
    h.db.seed_runtime(tables).await;

    h.engine
        .process_event(state_event(1, "h1", Severity::Warning, 110))
        .await
        .unwrap();
    assert!(
        h.db.incidents().await[0].rules_matched.is_empty(),
        "stale snapshot still in effect"
    );

    h.runtime.refresh(None).await.unwrap();
    h.engine
        .process_event(state_event(1, "h1", Severity::Crit, 120))
        .await
        .unwrap();
    assert!(h.db.incidents().await[0].rules_matched.contains(&7));
}

#[tokio::test]
async fn failed_load_keeps_the_previous_snapshot() {
    // A database that fails the table load after the first success.
    struct FlakyDb {
        inner: Arc<incidentd::MemoryDatabase>,
        fail: StdMutex<bool>,
    }

    #[async_trait::async_trait]
    impl Database for FlakyDb {
        async fn begin(
            &self,
        ) -> Result<Box<dyn incidentd::db::DbTransaction>, incidentd::core::DbError> {
            self.inner.begin().await
        }

        async fn load_runtime_tables(
            &self,
        ) -> Result<RuntimeTables, incidentd::core::DbError> {
            if *self.fail.lock().unwrap() {
                return Err(incidentd::core::DbError::Io("connection lost".into()));
            }
            self.inner.load_runtime_tables().await
        }

        async fn restore_muted_objects(
            &self,
        ) -> Result<Vec<incidentd::Object>, incidentd::core::DbError> {
            self.inner.restore_muted_objects().await
        }

        async fn load_open_incidents(
            &self,
        ) -> Result<Vec<(incidentd::Incident, incidentd::Object)>, incidentd::core::DbError>
        {
            self.inner.load_open_incidents().await
        }

        async fn update_notified(
            &self,
            history_id: i64,
            state: incidentd::db::NotifiedState,
            sent_at: Option<chrono::DateTime<chrono::Utc>>,
        ) -> Result<(), incidentd::core::DbError> {
            self.inner.update_notified(history_id, state, sent_at).await
        }
    }

    let memory = Arc::new(incidentd::MemoryDatabase::new());
    let mut tables = RuntimeTables::default();
    tables.rules.push(RuleRow {
        id: 1,
        name: "stable".to_string(),
        active: true,
        object_filter: None,
        timeperiod_id: None,
    });
    memory.seed_runtime(tables).await;

    let db = Arc::new(FlakyDb {
        inner: memory,
        fail: StdMutex::new(false),
    });
    let runtime = incidentd::RuntimeCache::new(Arc::clone(&db) as Arc<dyn Database>);

    runtime.refresh(None).await.unwrap();
    assert!(runtime.read().await.rule(1).is_some());

    *db.fail.lock().unwrap() = true;
    assert!(runtime.refresh(None).await.is_err());
    assert!(
        runtime.read().await.rule(1).is_some(),
        "previous snapshot survives a failed load"
    );
}
