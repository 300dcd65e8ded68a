//! Reconciliation sweeps against the memory store and queue

mod common;

use chrono::{Duration, Utc};
use common::{Harness, HarnessBuilder};
use cinecore_types::{EncodingJob, EncodingStatus, Lane, MediaId};
use media_processor::reconcile::{
    check_media_states, check_missing_profiles, check_pending_states, check_running_states,
    run_sweep,
};
use media_processor::store::JobStore;

async fn queued_media(token: &str) -> (Harness, MediaId) {
    let h = HarnessBuilder::new()
        .configure(|c| {
            c.encoding.chunked_encoding = false;
            c.reconcile.running_stale_secs = 60;
        })
        .build();
    h.standard_profiles().await;
    let id = h.upload(token).await;
    h.pipeline.media_init(&id).await.unwrap();
    (h, id)
}

async fn job_for(h: &Harness, id: &MediaId, profile_id: i32) -> EncodingJob {
    h.store
        .jobs_for_media(id)
        .await
        .unwrap()
        .into_iter()
        .find(|j| j.profile_id == profile_id)
        .unwrap()
}

#[tokio::test]
async fn test_stale_running_job_is_replaced_once() {
    let (h, id) = queued_media("stale").await;
    let mut job = job_for(&h, &id, 2).await;
    let task_id = job.task_id.clone().unwrap();
    job.start(task_id.clone(), "gone-worker").unwrap();
    job.updated_at = Utc::now() - Duration::hours(2);
    h.store.update_job(&job).await.unwrap();

    let report = check_running_states(&h.pipeline).await.unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.changed, 1);
    assert_eq!(report.errors, 0);

    assert!(h.store.get_job(job.id).await.unwrap().is_none());
    let replacement = job_for(&h, &id, 2).await;
    assert_ne!(replacement.id, job.id);
    assert_eq!(replacement.status, EncodingStatus::Pending);
    assert_ne!(replacement.task_id.as_deref(), Some(task_id.as_str()));
    assert_eq!(h.store.job_count().await, 3);

    // the old task is gone, the new one is queued
    let queued = h.queue.queued(Lane::Long);
    assert!(queued.iter().all(|t| t.task_id != task_id));
    assert!(queued
        .iter()
        .any(|t| Some(&t.task_id) == replacement.task_id.as_ref()));

    // a second pass finds nothing to do
    let again = check_running_states(&h.pipeline).await.unwrap();
    assert_eq!(again.changed, 0);
}

#[tokio::test]
async fn test_recent_running_job_is_left_alone() {
    let (h, id) = queued_media("fresh").await;
    let mut job = job_for(&h, &id, 1).await;
    job.start(job.task_id.clone().unwrap(), "busy-worker").unwrap();
    h.store.update_job(&job).await.unwrap();

    let report = check_running_states(&h.pipeline).await.unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.changed, 0);
    assert_eq!(
        h.store.get_job(job.id).await.unwrap().unwrap().status,
        EncodingStatus::Running
    );
}

#[tokio::test]
async fn test_pending_job_without_task_is_requeued() {
    let (h, id) = queued_media("orphan").await;

    let report = check_pending_states(&h.pipeline).await.unwrap();
    assert_eq!(report.examined, 3);
    assert_eq!(report.changed, 0);

    let lost = job_for(&h, &id, 3).await;
    let kept = job_for(&h, &id, 1).await;
    h.queue.drop_task(lost.task_id.as_deref().unwrap());

    let report = check_pending_states(&h.pipeline).await.unwrap();
    assert_eq!(report.changed, 1);

    assert!(h.store.get_job(lost.id).await.unwrap().is_none());
    let replacement = job_for(&h, &id, 3).await;
    assert_ne!(replacement.id, lost.id);
    assert_eq!(replacement.status, EncodingStatus::Pending);
    assert_eq!(h.store.get_job(kept.id).await.unwrap().unwrap().id, kept.id);
    assert_eq!(h.queue.queued(Lane::Long).len(), 3);
}

#[tokio::test]
async fn test_missing_profile_is_encoded_once_media_settles() {
    let (h, id) = queued_media("gap").await;
    let missing = job_for(&h, &id, 2).await;
    h.store.delete_job(missing.id).await.unwrap();
    h.queue.drop_task(missing.task_id.as_deref().unwrap());

    // just touched, still inside the settle window
    let report = check_missing_profiles(&h.pipeline).await.unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.changed, 0);

    let mut media = h.media(&id).await;
    media.updated_at = Utc::now() - Duration::hours(1);
    h.store.save_media(&media).await.unwrap();

    let report = check_missing_profiles(&h.pipeline).await.unwrap();
    assert_eq!(report.changed, 1);
    let profiles: Vec<i32> = h
        .store
        .jobs_for_media(&id)
        .await
        .unwrap()
        .iter()
        .map(|j| j.profile_id)
        .collect();
    assert!(profiles.contains(&2));
    assert_eq!(profiles.len(), 3);

    let report = check_missing_profiles(&h.pipeline).await.unwrap();
    assert_eq!(report.changed, 0);
}

#[tokio::test]
async fn test_missing_profile_settle_ignores_running_window() {
    let h = HarnessBuilder::new()
        .configure(|c| {
            c.encoding.chunked_encoding = false;
            c.reconcile.running_stale_secs = 86_400;
            c.reconcile.missing_profiles_settle_secs = 60;
        })
        .build();
    h.standard_profiles().await;
    let id = h.upload("settle").await;
    h.pipeline.media_init(&id).await.unwrap();
    let missing = job_for(&h, &id, 1).await;
    h.store.delete_job(missing.id).await.unwrap();
    h.queue.drop_task(missing.task_id.as_deref().unwrap());

    let mut media = h.media(&id).await;
    media.updated_at = Utc::now() - Duration::minutes(5);
    h.store.save_media(&media).await.unwrap();

    let report = check_missing_profiles(&h.pipeline).await.unwrap();
    assert_eq!(report.changed, 1);
    assert_eq!(h.store.job_count().await, 3);
}

#[tokio::test]
async fn test_stale_job_of_inactive_profile_is_dropped() {
    let (h, id) = queued_media("retired").await;
    let mut profile = h.store.get_profile(2).await.unwrap().unwrap();
    profile.active = false;
    h.store.save_profile(&profile).await.unwrap();

    let mut job = job_for(&h, &id, 2).await;
    job.start(job.task_id.clone().unwrap(), "gone-worker").unwrap();
    job.updated_at = Utc::now() - Duration::hours(2);
    h.store.update_job(&job).await.unwrap();

    let report = check_running_states(&h.pipeline).await.unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.changed, 0);
    assert_eq!(report.errors, 0);

    assert!(h.store.get_job(job.id).await.unwrap().is_none());
    let profiles: Vec<i32> = h
        .store
        .jobs_for_media(&id)
        .await
        .unwrap()
        .iter()
        .map(|j| j.profile_id)
        .collect();
    assert!(!profiles.contains(&2));
    assert_eq!(profiles.len(), 2);
}

#[tokio::test]
async fn test_media_state_sweep_repairs_stale_aggregate() {
    let (h, id) = queued_media("drift").await;
    h.drain(Lane::Long).await;
    assert_eq!(h.media(&id).await.encoding_status, EncodingStatus::Success);

    // success media are settled and not looked at
    let report = check_media_states(&h.pipeline).await.unwrap();
    assert_eq!(report.examined, 0);

    let mut media = h.media(&id).await;
    media.encoding_status = EncodingStatus::Running;
    h.store.save_media(&media).await.unwrap();

    let report = check_media_states(&h.pipeline).await.unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.changed, 1);
    assert_eq!(h.media(&id).await.encoding_status, EncodingStatus::Success);
}

#[tokio::test]
async fn test_run_sweep_ignores_other_tasks() {
    let (h, _) = queued_media("names").await;
    assert!(run_sweep(&h.pipeline, cinecore_types::TaskName::EncodeMedia)
        .await
        .is_none());
    let report = run_sweep(&h.pipeline, cinecore_types::TaskName::CheckPendingStates)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.examined, 3);
}
