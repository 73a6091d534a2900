use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;

/// Background task that deactivates plan assignments whose end date has passed.
///
/// This is the only date-driven change to an assignment: entitlement checks
/// trust the `active` flag.
pub async fn run_expiry_job(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let today = chrono::Local::now().date_naive();
        match engine.expire_subscriptions(today).await {
            Ok(0) => debug!("expiry: nothing lapsed before {today}"),
            Ok(n) => info!("expiry: deactivated {n} plan assignments ended before {today}"),
            Err(e) => warn!("expiry job failed: {e}"),
        }
    }
}

/// Background task that rewrites the event log once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => {
                metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
                info!("compacted event log after {appends} appends");
            }
            Err(e) => warn!("compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use chrono::NaiveDate;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("gymdesk_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn expiry_job_deactivates_lapsed_assignment() {
        let path = test_wal_path("expiry_job.wal");
        let engine = Arc::new(Engine::new(path, Arc::new(NotifyHub::new())).unwrap());

        let plan = engine
            .create_plan(Plan {
                id: Ulid::new(),
                name: "Monthly".into(),
                description: None,
                price: 20_000,
                duration_days: 30,
                may_reserve_courts: true,
                may_reserve_classes: false,
            })
            .await
            .unwrap();
        let member = engine
            .register_member(
                Ulid::new(),
                MemberProfile {
                    national_id: "12.345.678-5".into(),
                    first_name: "Ana".into(),
                    last_name: "Rojas".into(),
                    second_last_name: None,
                    email: "ana@example.com".into(),
                    phone: None,
                    birth_date: None,
                    fitness: Default::default(),
                },
            )
            .await
            .unwrap();
        // Started long ago, so it has lapsed whatever today is.
        let start = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        engine.assign_plan(member.id, plan.id, start, 20_000).await.unwrap();
        assert!(engine
            .resolve_entitlement(member.id, Capability::CourtBooking)
            .await
            .unwrap());

        let job = tokio::spawn(run_expiry_job(engine.clone(), Duration::from_secs(3600)));
        // The first tick fires immediately.
        for _ in 0..50 {
            if !engine
                .resolve_entitlement(member.id, Capability::CourtBooking)
                .await
                .unwrap()
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        job.abort();

        assert!(!engine
            .resolve_entitlement(member.id, Capability::CourtBooking)
            .await
            .unwrap());
    }
}
