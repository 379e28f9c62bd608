//! Background worker hosting the scheduled and manual run paths.
//!
//! Two loops run side by side and never share a run:
//! - the scheduled loop runs at a fixed daily UTC time, or at a fixed
//!   interval starting immediately when no time is configured;
//! - the manual loop polls the trigger document, diffs each read against
//!   the previous one and hands the write to the [`TriggerGate`].

use std::{sync::Arc, time::Duration as StdDuration};

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde_json::Value;

use super::{
    coordinator::RunCoordinator,
    model::RunTrigger,
    trigger::{Admission, TriggerGate, TriggerWrite},
};
use crate::{
    config::RetentionConfig,
    db::{DocumentStore, Fields, timestamp_value},
    object_store::ObjectStoreConnector,
};

/// Starts the retention worker.
///
/// Runs until the returned future is dropped; callers typically race it
/// against a shutdown signal.
pub async fn start_retention_worker(
    store: Arc<dyn DocumentStore>,
    connector: Arc<dyn ObjectStoreConnector>,
    config: RetentionConfig,
) {
    if !config.enabled {
        tracing::info!("Retention worker disabled by configuration");
        return;
    }

    let dry_run_msg = if config.safety.dry_run {
        " (DRY RUN)"
    } else {
        ""
    };

    tracing::info!(
        interval_hours = config.interval_hours,
        run_at_utc = config.run_at_utc.as_deref().unwrap_or("-"),
        trigger_poll_secs = config.trigger_poll_secs,
        chats = %config.collections.chats,
        announcements = %config.collections.announcements,
        prefixes = ?config.object_store.prefixes,
        dry_run = config.safety.dry_run,
        "Starting retention worker{}",
        dry_run_msg
    );

    let coordinator = Arc::new(RunCoordinator::new(
        store.clone(),
        connector,
        config.clone(),
    ));

    tokio::join!(
        scheduled_loop(store.clone(), coordinator.clone(), &config),
        manual_loop(store, coordinator, &config),
    );
}

async fn scheduled_loop(
    store: Arc<dyn DocumentStore>,
    coordinator: Arc<RunCoordinator>,
    config: &RetentionConfig,
) {
    let bookkeeping = SettingsBookkeeping {
        store,
        collection: config.documents.config_collection.clone(),
        doc_id: config.documents.settings_doc.clone(),
    };

    loop {
        if let Some(run_at) = config.run_at() {
            let wait = delay_until(run_at, coordinator.clock().now());
            tracing::debug!(wait_secs = wait.as_secs(), "Next scheduled cleanup");
            tokio::time::sleep(wait).await;
        }

        bookkeeping.started(coordinator.clock().now()).await;
        match coordinator.run(&RunTrigger::Scheduled).await {
            Ok(report) => {
                // Phase errors are recorded in the audit entry; the run itself completed.
                if let Some(summary) = report.error_summary() {
                    tracing::warn!(errors = %summary, "Scheduled cleanup finished with phase errors");
                }
                bookkeeping.completed(coordinator.clock().now()).await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Error running scheduled cleanup");
                bookkeeping
                    .failed(&e.to_string(), coordinator.clock().now())
                    .await;
            }
        }

        if config.run_at().is_none() {
            tokio::time::sleep(config.interval()).await;
        }
    }
}

async fn manual_loop(
    store: Arc<dyn DocumentStore>,
    coordinator: Arc<RunCoordinator>,
    config: &RetentionConfig,
) {
    let Some(poll) = config.trigger_poll_interval() else {
        tracing::info!("Manual cleanup triggers disabled by configuration");
        return;
    };

    let gate = TriggerGate::new(store, &config.documents);
    let mut previous = read_snapshot(&gate).await;
    let mut ticker = tokio::time::interval(poll);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let current = match gate.snapshot().await {
            Ok(current) => current,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to poll manual trigger document");
                continue;
            }
        };
        if current == previous {
            continue;
        }

        let write = TriggerWrite {
            before: previous.take(),
            after: current.clone(),
        };
        previous = current;

        match gate.admit(&write, coordinator.clock().now()).await {
            Ok(Admission::Admitted(claim)) => {
                let error = match coordinator.run(&claim.run_trigger()).await {
                    Ok(report) => {
                        if let Some(summary) = report.error_summary() {
                            tracing::warn!(errors = %summary, "Manual cleanup finished with phase errors");
                        }
                        None
                    }
                    Err(e) => Some(e.to_string()),
                };
                if let Err(e) = gate
                    .complete(claim, error.as_deref(), coordinator.clock().now())
                    .await
                {
                    tracing::error!(error = %e, "Failed to release manual trigger");
                }
                // Our own claim and release writes are not trigger requests.
                previous = read_snapshot(&gate).await;
            }
            Ok(Admission::Rejected(reason)) => {
                tracing::debug!(reason = ?reason, "Manual trigger write ignored");
            }
            Err(e) => {
                tracing::error!(error = %e, "Manual trigger not started");
            }
        }
    }
}

async fn read_snapshot(gate: &TriggerGate) -> Option<Fields> {
    match gate.snapshot().await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read manual trigger document");
            None
        }
    }
}

/// Time from `now` until the next occurrence of `run_at` (UTC). A run time
/// equal to `now` is scheduled for the following day.
pub fn delay_until(run_at: NaiveTime, now: DateTime<Utc>) -> StdDuration {
    let today = now.date_naive().and_time(run_at).and_utc();
    let next = if today > now {
        today
    } else {
        today + Duration::days(1)
    };
    (next - now).to_std().unwrap_or_default()
}

/// Best-effort `lastScheduled*` fields on the settings document.
struct SettingsBookkeeping {
    store: Arc<dyn DocumentStore>,
    collection: String,
    doc_id: String,
}

impl SettingsBookkeeping {
    async fn started(&self, now: DateTime<Utc>) {
        self.write([
            ("lastScheduledRun", timestamp_value(now)),
            ("lastScheduledStatus", Value::from("running")),
        ])
        .await;
    }

    async fn completed(&self, now: DateTime<Utc>) {
        self.write([
            ("lastScheduledStatus", Value::from("completed")),
            ("lastScheduledCompletedAt", timestamp_value(now)),
        ])
        .await;
    }

    async fn failed(&self, error: &str, now: DateTime<Utc>) {
        self.write([
            ("lastScheduledStatus", Value::from("error")),
            ("lastScheduledError", Value::from(error)),
            ("lastScheduledErrorAt", timestamp_value(now)),
        ])
        .await;
    }

    async fn write<const N: usize>(&self, entries: [(&str, Value); N]) {
        let fields: Fields = entries
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect();
        if let Err(e) = self.store.merge(&self.collection, &self.doc_id, fields).await {
            tracing::warn!(error = %e, "Failed to update scheduled run bookkeeping");
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rstest::rstest;

    use super::*;
    use crate::{
        db::MemoryDocumentStore, object_store::UnavailableConnector, retention::FixedClock,
    };

    #[rstest]
    #[case::later_today(1, 30, 2, 0, 30 * 60)]
    #[case::already_passed(3, 0, 2, 0, 23 * 3600)]
    #[case::exactly_now(2, 0, 2, 0, 24 * 3600)]
    fn test_delay_until(
        #[case] now_h: u32,
        #[case] now_m: u32,
        #[case] at_h: u32,
        #[case] at_m: u32,
        #[case] expected_secs: u64,
    ) {
        let now = Utc.with_ymd_and_hms(2026, 6, 15, now_h, now_m, 0).unwrap();
        let run_at = NaiveTime::from_hms_opt(at_h, at_m, 0).unwrap();
        assert_eq!(delay_until(run_at, now).as_secs(), expected_secs);
    }

    #[tokio::test]
    async fn test_bookkeeping_records_failure() {
        let store = Arc::new(MemoryDocumentStore::new());
        let bookkeeping = SettingsBookkeeping {
            store: store.clone(),
            collection: "app_config".into(),
            doc_id: "cleanup_settings".into(),
        };
        let now = Utc.with_ymd_and_hms(2026, 6, 15, 2, 0, 0).unwrap();

        bookkeeping.started(now).await;
        bookkeeping.failed("object storage: timeout", now).await;

        let doc = store
            .get("app_config", "cleanup_settings")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.data["lastScheduledStatus"], "error");
        assert_eq!(doc.data["lastScheduledError"], "object storage: timeout");
        assert!(doc.data.contains_key("lastScheduledRun"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_picks_up_manual_trigger() {
        let store = Arc::new(MemoryDocumentStore::new());
        let mut config = RetentionConfig::default();
        config.run_at_utc = Some("02:00".into());
        config.trigger_poll_secs = 1;

        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2026, 6, 15, 3, 0, 0).unwrap(),
        ));
        let coordinator = Arc::new(
            RunCoordinator::new(store.clone(), Arc::new(UnavailableConnector), config.clone())
                .with_clock(clock),
        );

        let gate = TriggerGate::new(store.clone(), &config.documents);
        let scenario = async {
            // Let the loop take its initial snapshot before the request lands.
            tokio::time::sleep(StdDuration::from_millis(10)).await;
            gate.request(false, false, Utc::now()).await.unwrap();
            tokio::time::sleep(StdDuration::from_secs(3)).await;

            let doc = gate.snapshot().await.unwrap().unwrap();
            assert_eq!(doc["processing"], false);
            assert_eq!(doc["lastResult"], "success");
            assert_eq!(store.len("cleanup_logs"), 1);

            // Nothing new was requested, so no second run.
            tokio::time::sleep(StdDuration::from_secs(3)).await;
            assert_eq!(store.len("cleanup_logs"), 1);
        };

        let loop_store: Arc<dyn DocumentStore> = store.clone();
        tokio::select! {
            _ = manual_loop(loop_store, coordinator.clone(), &config) => {
                panic!("manual loop returned while triggers are enabled");
            }
            _ = scenario => {}
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_loop_ignores_request_while_processing() {
        let store = Arc::new(MemoryDocumentStore::new());
        let mut config = RetentionConfig::default();
        config.trigger_poll_secs = 1;

        let coordinator = Arc::new(
            RunCoordinator::new(store.clone(), Arc::new(UnavailableConnector), config.clone())
                .with_clock(Arc::new(FixedClock::new(
                    Utc.with_ymd_and_hms(2026, 6, 15, 3, 0, 0).unwrap(),
                ))),
        );
        // A run left `processing` set, so the request must not start another.
        store
            .merge(
                "app_config",
                "test_cleanup_trigger",
                [("processing".to_string(), Value::Bool(true))]
                    .into_iter()
                    .collect(),
            )
            .await
            .unwrap();

        let gate = TriggerGate::new(store.clone(), &config.documents);
        let scenario = async {
            tokio::time::sleep(StdDuration::from_millis(10)).await;
            gate.request(false, false, Utc::now()).await.unwrap();
            tokio::time::sleep(StdDuration::from_secs(3)).await;

            let doc = gate.snapshot().await.unwrap().unwrap();
            assert_eq!(doc["processing"], true);
            assert_eq!(doc["triggerRequested"], true);
            assert_eq!(store.len("cleanup_logs"), 0);
        };

        let loop_store: Arc<dyn DocumentStore> = store.clone();
        tokio::select! {
            _ = manual_loop(loop_store, coordinator.clone(), &config) => {
                panic!("manual loop returned while triggers are enabled");
            }
            _ = scenario => {}
        }
    }

    fn credentials() -> Fields {
        [
            ("accountId", "acct"),
            ("bucketName", "school-media"),
            ("accessKeyId", "AKIDEXAMPLE"),
            ("secretAccessKey", "secret"),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), Value::from(value)))
        .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_run_with_phase_errors_is_completed() {
        let store = Arc::new(MemoryDocumentStore::new());
        let config = RetentionConfig::default();
        store
            .merge("app_config", "r2_settings", credentials())
            .await
            .unwrap();
        let coordinator = Arc::new(
            RunCoordinator::new(store.clone(), Arc::new(UnavailableConnector), config.clone())
                .with_clock(Arc::new(FixedClock::new(
                    Utc.with_ymd_and_hms(2026, 6, 15, 3, 0, 0).unwrap(),
                ))),
        );

        let scenario = async {
            tokio::time::sleep(StdDuration::from_secs(1)).await;

            let audit = store.list_recent("cleanup_logs", 1).await.unwrap();
            assert_eq!(audit[0].data["success"], false);

            let settings = store
                .get("app_config", "cleanup_settings")
                .await
                .unwrap()
                .unwrap();
            assert_eq!(settings.data["lastScheduledStatus"], "completed");
            assert!(settings.data.contains_key("lastScheduledCompletedAt"));
            assert!(!settings.data.contains_key("lastScheduledError"));
        };

        let loop_store: Arc<dyn DocumentStore> = store.clone();
        tokio::select! {
            _ = scheduled_loop(loop_store, coordinator.clone(), &config) => {
                panic!("scheduled loop returned");
            }
            _ = scenario => {}
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_run_with_phase_errors_reports_success() {
        let store = Arc::new(MemoryDocumentStore::new());
        let mut config = RetentionConfig::default();
        config.trigger_poll_secs = 1;
        store
            .merge("app_config", "r2_settings", credentials())
            .await
            .unwrap();
        let coordinator = Arc::new(
            RunCoordinator::new(store.clone(), Arc::new(UnavailableConnector), config.clone())
                .with_clock(Arc::new(FixedClock::new(
                    Utc.with_ymd_and_hms(2026, 6, 15, 3, 0, 0).unwrap(),
                ))),
        );

        let gate = TriggerGate::new(store.clone(), &config.documents);
        let scenario = async {
            tokio::time::sleep(StdDuration::from_millis(10)).await;
            gate.request(true, false, Utc::now()).await.unwrap();
            tokio::time::sleep(StdDuration::from_secs(3)).await;

            let audit = store.list_recent("cleanup_logs", 1).await.unwrap();
            assert_eq!(audit[0].data["success"], false);

            let doc = gate.snapshot().await.unwrap().unwrap();
            assert_eq!(doc["processing"], false);
            assert_eq!(doc["lastResult"], "success");
            assert!(doc.get("lastError").is_none_or(Value::is_null));
        };

        let loop_store: Arc<dyn DocumentStore> = store.clone();
        tokio::select! {
            _ = manual_loop(loop_store, coordinator.clone(), &config) => {
                panic!("manual loop returned while triggers are enabled");
            }
            _ = scenario => {}
        }
    }

    #[tokio::test]
    async fn test_manual_loop_returns_when_disabled() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::new());
        let mut config = RetentionConfig::default();
        config.trigger_poll_secs = 0;
        let coordinator = Arc::new(RunCoordinator::new(
            store.clone(),
            Arc::new(UnavailableConnector),
            config.clone(),
        ));

        manual_loop(store, coordinator, &config).await;
    }
}
