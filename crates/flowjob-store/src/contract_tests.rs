//! Behaviour every [`JobStore`] implementation must share.

use chrono::{Duration, Utc};
use serde_json::json;

use crate::error::StoreError;
use crate::job::{ExceptionInfo, JobRecord, JobType};
use crate::store::{ExclusivityFilter, JobStore, JobWrite, LockOutcome};

fn timer() -> JobRecord {
    JobRecord::new(JobType::Timer, json!({"timer": "t1"}))
}

pub async fn insert_and_get(store: &dyn JobStore) {
    let job = timer().with_correlation_id("proc-1").with_retries(5);
    store.insert(job.clone()).await.unwrap();

    let loaded = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(loaded.id, job.id);
    assert_eq!(loaded.job_type, JobType::Timer);
    assert_eq!(loaded.payload, json!({"timer": "t1"}));
    assert_eq!(loaded.correlation_id.as_deref(), Some("proc-1"));
    assert_eq!(loaded.retries_remaining, 5);
    assert_eq!(store.active_count().await.unwrap(), 1);

    let duplicate = store.insert(job).await;
    assert!(matches!(duplicate, Err(StoreError::AlreadyExists(_))));
}

pub async fn find_due_orders_and_limits(store: &dyn JobStore) {
    let now = Utc::now();
    let later = timer().due_at(now - Duration::seconds(1));
    let earlier = timer().due_at(now - Duration::seconds(10));
    let future = timer().due_at(now + Duration::hours(1));
    for job in [later.clone(), earlier.clone(), future.clone()] {
        store.insert(job).await.unwrap();
    }

    let due = store
        .find_due(now, 10, &ExclusivityFilter::Disabled)
        .await
        .unwrap();
    let ids: Vec<_> = due.iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![earlier.id, later.id]);

    let limited = store
        .find_due(now, 1, &ExclusivityFilter::Disabled)
        .await
        .unwrap();
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].id, earlier.id);

    let next = store.next_due_at(now).await.unwrap().unwrap();
    assert_eq!(next.timestamp_millis(), future.due_at.timestamp_millis());
}

pub async fn lock_is_version_conditioned(store: &dyn JobStore) {
    let now = Utc::now();
    let job = timer();
    store.insert(job.clone()).await.unwrap();

    let first = store
        .try_lock(job.id, job.version, "node-a", now + Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(first, LockOutcome::Acquired { version: job.version + 1 });

    let second = store
        .try_lock(job.id, job.version, "node-b", now + Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(second, LockOutcome::Conflict);

    let locked = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(locked.lock_owner.as_deref(), Some("node-a"));
    assert!(store
        .find_due(now, 10, &ExclusivityFilter::Disabled)
        .await
        .unwrap()
        .is_empty());
}

pub async fn expired_lock_is_acquirable(store: &dyn JobStore) {
    let now = Utc::now();
    let job = timer().due_at(now - Duration::seconds(5));
    store.insert(job.clone()).await.unwrap();
    store
        .try_lock(job.id, 0, "crashed-node", now - Duration::seconds(1))
        .await
        .unwrap();

    let due = store
        .find_due(now, 10, &ExclusivityFilter::Disabled)
        .await
        .unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].version, 1);

    let outcome = store
        .try_lock(job.id, 1, "node-b", now + Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(outcome, LockOutcome::Acquired { version: 2 });
}

pub async fn delete_requires_current_version(store: &dyn JobStore) {
    let job = timer();
    store.insert(job.clone()).await.unwrap();
    store
        .try_lock(job.id, 0, "node-a", Utc::now() + Duration::minutes(5))
        .await
        .unwrap();

    let stale = store.delete(job.id, 0).await;
    assert!(matches!(stale, Err(StoreError::Conflict(_))));
    assert!(store.get(job.id).await.unwrap().is_some());

    store.delete(job.id, 1).await.unwrap();
    assert!(store.get(job.id).await.unwrap().is_none());

    let gone = store.delete(job.id, 2).await;
    assert!(matches!(gone, Err(StoreError::Conflict(_))));
}

pub async fn reschedule_clears_lock(store: &dyn JobStore) {
    let now = Utc::now();
    let job = timer();
    store.insert(job.clone()).await.unwrap();
    store
        .try_lock(job.id, 0, "node-a", now + Duration::minutes(5))
        .await
        .unwrap();

    let retry_at = now + Duration::seconds(10);
    store
        .reschedule_after_failure(job.id, 1, retry_at, 2, ExceptionInfo::new("boom"))
        .await
        .unwrap();

    let loaded = store.get(job.id).await.unwrap().unwrap();
    assert!(loaded.lock_owner.is_none());
    assert!(loaded.lock_expires_at.is_none());
    assert_eq!(loaded.retries_remaining, 2);
    assert_eq!(loaded.failures, 1);
    assert_eq!(loaded.version, 2);
    assert_eq!(loaded.due_at.timestamp_millis(), retry_at.timestamp_millis());
    assert_eq!(loaded.last_exception.unwrap().message, "boom");
}

pub async fn dead_letter_and_resubmit(store: &dyn JobStore) {
    let job = timer().with_retries(1);
    store.insert(job.clone()).await.unwrap();
    store
        .try_lock(job.id, 0, "node-a", Utc::now() + Duration::minutes(5))
        .await
        .unwrap();
    store
        .move_to_dead_letter(job.id, 1, ExceptionInfo::new("fatal").with_detail("trace"))
        .await
        .unwrap();

    assert!(store.get(job.id).await.unwrap().is_none());
    assert_eq!(store.active_count().await.unwrap(), 0);

    let dead = store.dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].job.id, job.id);
    assert_eq!(dead[0].job.retries_remaining, 0);
    assert_eq!(dead[0].exception().unwrap().message, "fatal");
    assert_eq!(dead[0].exception().unwrap().detail.as_deref(), Some("trace"));

    let revived = store.resubmit_dead_letter(job.id, 3).await.unwrap();
    assert_eq!(revived.retries_remaining, 3);
    assert!(revived.lock_owner.is_none());
    assert!(store.dead_letters(10).await.unwrap().is_empty());
    assert_eq!(store.active_count().await.unwrap(), 1);

    let missing = store.resubmit_dead_letter(job.id, 3).await;
    assert!(matches!(missing, Err(StoreError::NotFound(_))));
}

pub async fn apply_is_atomic(store: &dyn JobStore) {
    let existing = timer();
    store.insert(existing.clone()).await.unwrap();

    let fresh = timer();
    let result = store
        .apply(vec![
            JobWrite::Insert(fresh.clone()),
            JobWrite::Delete {
                id: existing.id,
                expected_version: 7,
            },
        ])
        .await;
    assert!(matches!(result, Err(StoreError::Conflict(id)) if id == existing.id));
    assert!(store.get(fresh.id).await.unwrap().is_none());
    assert!(store.get(existing.id).await.unwrap().is_some());

    store
        .apply(vec![
            JobWrite::Insert(fresh.clone()),
            JobWrite::Delete {
                id: existing.id,
                expected_version: 0,
            },
        ])
        .await
        .unwrap();
    assert!(store.get(fresh.id).await.unwrap().is_some());
    assert!(store.get(existing.id).await.unwrap().is_none());
}

pub async fn exclusivity_respects_live_locks(store: &dyn JobStore) {
    let now = Utc::now();
    let running = timer()
        .with_correlation_id("proc-1")
        .exclusive()
        .due_at(now - Duration::seconds(3));
    let sibling = timer()
        .with_correlation_id("proc-1")
        .exclusive()
        .due_at(now - Duration::seconds(2));
    let other = timer()
        .with_correlation_id("proc-2")
        .exclusive()
        .due_at(now - Duration::seconds(1));
    for job in [running.clone(), sibling.clone(), other.clone()] {
        store.insert(job).await.unwrap();
    }
    store
        .try_lock(running.id, 0, "node-a", now + Duration::minutes(5))
        .await
        .unwrap();

    let enforced = store
        .find_due(now, 10, &ExclusivityFilter::enforced())
        .await
        .unwrap();
    let ids: Vec<_> = enforced.iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![other.id]);

    let disabled = store
        .find_due(now, 10, &ExclusivityFilter::Disabled)
        .await
        .unwrap();
    assert_eq!(disabled.len(), 2);

    let in_flight = store
        .find_due(now, 10, &ExclusivityFilter::with_in_flight([("proc-2".to_string(), true)]))
        .await
        .unwrap();
    assert!(in_flight.is_empty());
}
