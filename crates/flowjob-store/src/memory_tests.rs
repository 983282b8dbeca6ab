use super::*;
use crate::contract_tests as contract;
use crate::job::{ExceptionInfo, JobType};
use chrono::Duration;

#[tokio::test]
async fn test_insert_and_get() {
    contract::insert_and_get(&MemoryJobStore::new()).await;
}

#[tokio::test]
async fn test_find_due_orders_and_limits() {
    contract::find_due_orders_and_limits(&MemoryJobStore::new()).await;
}

#[tokio::test]
async fn test_lock_is_version_conditioned() {
    contract::lock_is_version_conditioned(&MemoryJobStore::new()).await;
}

#[tokio::test]
async fn test_expired_lock_is_acquirable() {
    contract::expired_lock_is_acquirable(&MemoryJobStore::new()).await;
}

#[tokio::test]
async fn test_delete_requires_current_version() {
    contract::delete_requires_current_version(&MemoryJobStore::new()).await;
}

#[tokio::test]
async fn test_reschedule_clears_lock() {
    contract::reschedule_clears_lock(&MemoryJobStore::new()).await;
}

#[tokio::test]
async fn test_dead_letter_and_resubmit() {
    contract::dead_letter_and_resubmit(&MemoryJobStore::new()).await;
}

#[tokio::test]
async fn test_apply_is_atomic() {
    contract::apply_is_atomic(&MemoryJobStore::new()).await;
}

#[tokio::test]
async fn test_exclusivity_respects_live_locks() {
    contract::exclusivity_respects_live_locks(&MemoryJobStore::new()).await;
}

#[tokio::test]
async fn test_insert_then_delete_in_one_batch() {
    let store = MemoryJobStore::new();
    let job = JobRecord::new(JobType::Message, serde_json::json!(null));
    store
        .apply(vec![
            JobWrite::Insert(job.clone()),
            JobWrite::Delete {
                id: job.id,
                expected_version: 0,
            },
        ])
        .await
        .unwrap();
    assert_eq!(store.active_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_next_due_at_includes_lock_expiry() {
    let store = MemoryJobStore::new();
    let now = Utc::now();
    let job = JobRecord::new(JobType::Timer, serde_json::json!(null)).due_at(now);
    store.insert(job.clone()).await.unwrap();
    store
        .try_lock(job.id, 0, "node-a", now + Duration::seconds(30))
        .await
        .unwrap();

    let next = store.next_due_at(now).await.unwrap().unwrap();
    assert!(next > now + Duration::seconds(30));
}

#[tokio::test]
async fn test_next_due_at_skips_already_due() {
    let store = MemoryJobStore::new();
    let now = Utc::now();
    store
        .insert(JobRecord::new(JobType::Timer, serde_json::json!(null)).due_at(now - Duration::seconds(1)))
        .await
        .unwrap();
    assert!(store.next_due_at(now).await.unwrap().is_none());
}

#[tokio::test]
async fn test_dead_letters_oldest_first() {
    let store = MemoryJobStore::new();
    let mut ids = Vec::new();
    for _ in 0..3 {
        let job = JobRecord::new(JobType::Timer, serde_json::json!(null));
        ids.push(job.id);
        store.insert(job.clone()).await.unwrap();
        store
            .move_to_dead_letter(job.id, 0, ExceptionInfo::new("x"))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }

    let dead = store.dead_letters(2).await.unwrap();
    assert_eq!(dead.len(), 2);
    assert_eq!(dead[0].job.id, ids[0]);
    assert_eq!(dead[1].job.id, ids[1]);
}
