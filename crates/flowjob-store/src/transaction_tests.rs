use super::*;
use crate::job::JobType;
use crate::memory::MemoryJobStore;
use chrono::Duration;
use futures::FutureExt;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
struct CountingListener {
    calls: AtomicUsize,
}

impl JobAddedListener for CountingListener {
    fn job_was_added(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

fn setup() -> (Arc<MemoryJobStore>, Arc<CountingListener>, UnitOfWork) {
    let store = Arc::new(MemoryJobStore::new());
    let listener = Arc::new(CountingListener::default());
    let uow = UnitOfWork::new(store.clone()).with_listener(listener.clone());
    (store, listener, uow)
}

fn job() -> JobRecord {
    JobRecord::new(JobType::AsyncContinuation, serde_json::json!({"activity": "a1"}))
}

#[tokio::test]
async fn test_commit_applies_writes_and_notifies_once() {
    let (store, listener, uow) = setup();
    let mut tx = uow.begin();
    tx.insert_job(job());
    tx.insert_job(job());
    assert_eq!(listener.calls.load(Ordering::SeqCst), 0);

    tx.commit().await.unwrap();
    assert_eq!(store.active_count().await.unwrap(), 2);
    assert_eq!(listener.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_rollback_discards_writes_and_hooks() {
    let (store, listener, uow) = setup();
    let fired = Arc::new(AtomicUsize::new(0));

    let mut tx = uow.begin();
    tx.insert_job(job());
    let counter = fired.clone();
    tx.on_commit(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    tx.rollback();

    assert_eq!(store.active_count().await.unwrap(), 0);
    assert_eq!(listener.calls.load(Ordering::SeqCst), 0);
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_dropped_transaction_discards() {
    let (store, listener, uow) = setup();
    {
        let mut tx = uow.begin();
        tx.insert_job(job());
    }
    assert_eq!(store.active_count().await.unwrap(), 0);
    assert_eq!(listener.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_future_job_does_not_notify() {
    let (store, listener, uow) = setup();
    let mut tx = uow.begin();
    tx.insert_job(job().delayed(Duration::hours(1)));
    tx.commit().await.unwrap();

    assert_eq!(store.active_count().await.unwrap(), 1);
    assert_eq!(listener.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failed_commit_skips_hooks() {
    let (store, listener, uow) = setup();
    let existing = job();
    store.insert(existing.clone()).await.unwrap();

    let mut tx = uow.begin();
    tx.insert_job(job());
    tx.delete_job(existing.id, 42);
    let err = tx.commit().await.unwrap_err();

    assert!(err.is_conflict());
    assert_eq!(store.active_count().await.unwrap(), 1);
    assert_eq!(listener.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_hooks_run_in_registration_order() {
    let (_store, _listener, uow) = setup();
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let mut tx = uow.begin();
    for n in 0..3 {
        let order = order.clone();
        tx.on_commit(move || order.lock().push(n));
    }
    tx.commit().await.unwrap();

    assert_eq!(*order.lock(), vec![0, 1, 2]);
}

#[tokio::test]
async fn test_run_in_transaction_commits_on_ok() {
    let (store, listener, uow) = setup();
    let id = uow
        .run_in_transaction(|tx| {
            async move { Ok::<_, StoreError>(tx.insert_job(job())) }.boxed()
        })
        .await
        .unwrap();

    assert!(store.get(id).await.unwrap().is_some());
    assert_eq!(listener.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_run_in_transaction_rolls_back_on_err() {
    let (store, listener, uow) = setup();
    let result: Result<(), StoreError> = uow
        .run_in_transaction(|tx| {
            async move {
                let id = tx.insert_job(job());
                Err(StoreError::NotFound(id))
            }
            .boxed()
        })
        .await;

    assert!(result.is_err());
    assert_eq!(store.active_count().await.unwrap(), 0);
    assert_eq!(listener.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_without_listener_commits_silently() {
    let store = Arc::new(MemoryJobStore::new());
    let uow = UnitOfWork::new(store.clone());
    let mut tx = uow.begin();
    tx.insert_job(job());
    tx.commit().await.unwrap();
    assert_eq!(store.active_count().await.unwrap(), 1);
}
