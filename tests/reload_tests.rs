mod test_harness;

use std::time::Duration;

use chrono::{TimeZone, Utc};
use gram_lite::registry::{JobKey, JobPhase, JobRecord};
use gram_lite::store::{FileStore, JobStore};
use test_harness::{within, TestEnv, GRACE_PERIOD};

fn persisted(uniq1: u64, uniq2: u64, restart: JobPhase) -> JobRecord {
    let mut record = JobRecord::new(JobKey::new(uniq1, uniq2));
    record.phase = JobPhase::Stop;
    record.restart_phase = restart;
    record
}

#[tokio::test]
async fn test_load_all_restores_jobs_at_restart_phase() {
    let env = TestEnv::new();

    let mut first = persisted(1, 2, JobPhase::Poll2);
    first.lrm_job_id = Some("77.0,77.1".to_string());
    first.last_event_at = Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
    let mut second = persisted(3, 4, JobPhase::StageIn);
    second.created_at = Utc.with_ymd_and_hms(2024, 2, 1, 8, 30, 0).unwrap();
    env.store.save(&first).unwrap();
    env.store.save(&second).unwrap();

    let manager = env.manager();
    let restored = manager.load_all().await.unwrap();
    assert_eq!(restored, vec![first.key, second.key]);

    for key in &restored {
        assert!(manager.exists(key));
        assert_eq!(manager.reference_count(key), Some(0));
    }
    assert_eq!(manager.status(&first.key).unwrap().phase, JobPhase::Poll2);
    assert_eq!(manager.status(&second.key).unwrap().phase, JobPhase::StageIn);

    assert_eq!(manager.resolve_lrm_id("77.0").unwrap(), first.key);
    assert_eq!(manager.resolve_lrm_id("77.1").unwrap(), first.key);
    assert_eq!(manager.last_event_floor(), Some(second.created_at));
}

#[tokio::test]
async fn test_load_all_skips_foreign_and_corrupt_files() {
    let env = TestEnv::new();
    env.store.save(&persisted(1, 1, JobPhase::Poll2)).unwrap();

    let dir = env.dir.path();
    std::fs::write(dir.join("job.testhost.5.5"), b"{ not json").unwrap();
    std::fs::write(dir.join("job.testhost.6.6.tmp"), b"partial").unwrap();
    std::fs::write(dir.join("job.testhost.7.7x"), b"{}").unwrap();
    std::fs::write(dir.join("job.otherhost.8.8"), b"{}").unwrap();

    let manager = env.manager();
    let restored = manager.load_all().await.unwrap();
    assert_eq!(restored, vec![JobKey::new(1, 1)]);
    assert_eq!(manager.requests().len(), 1);
}

#[tokio::test]
async fn test_load_all_without_state_dir_is_empty() {
    let env = TestEnv::with_config(|config| config.with_state_dir("/nonexistent/gram/state"));
    let manager = env.manager();

    assert!(manager.load_all().await.unwrap().is_empty());
    assert!(manager.last_event_floor().is_none());
}

#[tokio::test]
async fn test_restored_poll_wait_job_swaps_out_when_idle() {
    let env = TestEnv::new();
    let record = persisted(1, 2, JobPhase::Poll2);
    env.store.save(&record).unwrap();

    let manager = env.manager();
    manager.load_all().await.unwrap();
    manager
        .acquire(&record.key, "restart")
        .await
        .unwrap()
        .release()
        .unwrap();

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(!manager.exists(&record.key));

    let saved = env.store.load(&record.key).unwrap();
    assert_eq!(saved.restart_phase, JobPhase::Poll2);
}

#[tokio::test]
async fn test_service_restart_resumes_submitted_job() {
    let env = TestEnv::new();

    let key = {
        let service = env.service();
        service.start().await.unwrap();
        service.submit_job("5501.pbs").await.unwrap()
    };
    assert!(env.state_file_exists(&key));

    let service = env.service();
    let restored = service.start().await.unwrap();
    assert_eq!(restored, vec![key]);
    let manager = service.manager();
    assert_eq!(manager.resolve_lrm_id("5501.pbs").unwrap(), key);
    assert_eq!(manager.status(&key).unwrap().phase, JobPhase::Poll2);
}

#[tokio::test]
async fn test_empty_start_drains_after_grace_period() {
    let env = TestEnv::new();
    let service = env.service();

    assert!(service.start().await.unwrap().is_empty());
    within(GRACE_PERIOD * 10, service.manager().wait_drained()).await;
}

#[test]
fn test_state_file_names_follow_default_layout() {
    let config = gram_lite::config::ManagerConfig::new("node9", "alice");
    let store = FileStore::from_config(&config);
    assert_eq!(
        store.path_for(&JobKey::new(10, 20)),
        std::path::PathBuf::from("/usr/local/gram/tmp/gram_job_state/alice.node9.10.20")
    );
}
