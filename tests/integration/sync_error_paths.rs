use std::sync::Arc;
use std::time::Duration;

use mailbridge::cache::HotCache;
use mailbridge::job_queue::JobQueueHandle;
use mailbridge::session_pool::SessionPool;
use mailbridge::storage::Storage;
use mailbridge::sync::SyncOrchestrator;

async fn temp_storage() -> Storage {
    let file = tempfile::NamedTempFile::new().unwrap();
    let path = file.into_temp_path();
    let url = format!("sqlite://{}?mode=rwc", path.display());
    std::mem::forget(path);
    Storage::connect(&url).await.unwrap()
}

#[tokio::test]
async fn full_sync_without_a_registered_session_fails_and_records_error_progress() {
    let storage = Arc::new(temp_storage().await);
    let cache = Arc::new(HotCache::new());
    let pool = Arc::new(SessionPool::new(Duration::from_secs(25), Duration::from_secs(30)));
    let queue = JobQueueHandle::spawn();

    let orchestrator = SyncOrchestrator::new("alice", pool, storage, cache.clone(), queue);

    let result = orchestrator.sync().await;
    assert!(result.is_err());

    let progress: mailbridge::sync::SyncProgress =
        cache.get(&HotCache::sync_progress_key("alice")).unwrap();
    assert_eq!(progress.percent, 0);
}
