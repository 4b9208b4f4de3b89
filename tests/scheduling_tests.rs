
use test_harness::{launcher, one_task_job, retrying_task_job, start_task, test_engine};

use sched_core::{JobId, JobPriority, JobStatus, OnTaskError, TaskOutcome};

/// Test that only schedulable jobs make it into the batch.
#[test]
fn test_batch_skips_unschedulable_jobs() {
    let t = test_engine();
    let pending = t
        .engine
        .submit_job(one_task_job())
        .expect("submission succeeds");

    let paused = t
        .engine
        .submit_job(one_task_job())
        .expect("submission succeeds");
    assert!(t.engine.pause_job(paused).expect("pause succeeds"));

    let parked = retrying_task_job(1, OnTaskError::PauseTask);
    let parked_task = parked.task_id(0);
    let in_error = t.engine.submit_job(parked).expect("submission succeeds");
    start_task(&t.engine, parked_task, launcher(1));
    t.engine
        .task_terminated_with_result(parked_task, 1, TaskOutcome::failure("boom"))
        .expect("result settles");
    assert_eq!(t.engine.job_status(in_error), Some(JobStatus::InError));

    let killed = t
        .engine
        .submit_job(one_task_job())
        .expect("submission succeeds");
    t.engine.kill_job(killed, "gone").expect("kill succeeds");

    let batch = t.engine.lock_jobs_to_schedule(false);

    let ids: Vec<JobId> = batch.guards().iter().map(|guard| guard.id()).collect();
    assert_eq!(ids, vec![pending]);
}

/// Test that a paused scheduler only serves jobs already in progress.
#[test]
fn test_paused_scheduler_only_serves_jobs_in_progress() {
    let t = test_engine();
    let pending = t
        .engine
        .submit_job(one_task_job())
        .expect("submission succeeds");

    let running_job = one_task_job();
    let running_task = running_job.task_id(0);
    let running = t
        .engine
        .submit_job(running_job)
        .expect("submission succeeds");
    start_task(&t.engine, running_task, launcher(1));

    let stalled_job = retrying_task_job(2, OnTaskError::Continue);
    let stalled_task = stalled_job.task_id(0);
    let stalled = t
        .engine
        .submit_job(stalled_job)
        .expect("submission succeeds");
    start_task(&t.engine, stalled_task, launcher(2));
    t.engine
        .task_terminated_with_result(stalled_task, 1, TaskOutcome::failure("boom"))
        .expect("result settles");
    assert_eq!(t.engine.job_status(stalled), Some(JobStatus::Stalled));

    let batch = t.engine.lock_jobs_to_schedule(true);

    let mut ids: Vec<JobId> = batch.guards().iter().map(|guard| guard.id()).collect();
    ids.sort_by_key(|id| id.to_string());
    let mut expected = vec![running, stalled];
    expected.sort_by_key(|id| id.to_string());
    assert_eq!(ids, expected);
    assert!(!ids.contains(&pending));
}

/// Test that a contended higher-priority job abandons the whole pass.
#[test]
fn test_contended_higher_priority_abandons_pass() {
    let t = test_engine();
    t.engine
        .submit_job(one_task_job())
        .expect("submission succeeds");
    let mut urgent = one_task_job();
    urgent.priority = JobPriority::Highest;
    let urgent = t.engine.submit_job(urgent).expect("submission succeeds");

    // Someone else is working on the urgent job right now.
    let held = t.engine.registry().lock(urgent).expect("job is live");
    let batch = t.engine.lock_jobs_to_schedule(false);
    assert!(batch.is_empty());
    drop(held);

    // With the urgent job reachable again the pass takes everything.
    let batch = t.engine.lock_jobs_to_schedule(false);
    assert_eq!(batch.len(), 2);
}

/// Test that a contended lower-priority job does not block the pass.
#[test]
fn test_contended_lower_priority_keeps_batch() {
    let t = test_engine();
    let mut urgent = one_task_job();
    urgent.priority = JobPriority::Highest;
    let urgent = t.engine.submit_job(urgent).expect("submission succeeds");
    let mut background = one_task_job();
    background.priority = JobPriority::Low;
    let background = t
        .engine
        .submit_job(background)
        .expect("submission succeeds");

    let held = t.engine.registry().lock(background).expect("job is live");
    let batch = t.engine.lock_jobs_to_schedule(false);

    let ids: Vec<JobId> = batch.guards().iter().map(|guard| guard.id()).collect();
    assert_eq!(ids, vec![urgent]);
    drop(held);
}

/// Test that batch guards feed straight into task dispatch.
#[test]
fn test_batch_guards_dispatch_directly() {
    let t = test_engine();
    let job = one_task_job();
    let task_id = job.task_id(0);
    let id = t.engine.submit_job(job).expect("submission succeeds");

    let mut batch = t.engine.lock_jobs_to_schedule(false);
    assert_eq!(batch.len(), 1);
    t.engine
        .task_started(&mut batch.guards_mut()[0], task_id, launcher(1))
        .expect("task starts");
    drop(batch);

    assert_eq!(t.engine.job_status(id), Some(JobStatus::Running));
    assert_eq!(t.engine.running_task_count(), 1);
}

/// Test that parallel submitters and finishers stay consistent.
#[test]
fn test_concurrent_jobs_complete_independently() {
    let t = test_engine();

    std::thread::scope(|scope| {
        for worker in 0..4u64 {
            let engine = &t.engine;
            scope.spawn(move || {
                for _ in 0..10 {
                    let job = one_task_job();
                    let task_id = job.task_id(0);
                    engine.submit_job(job).expect("submission succeeds");
                    start_task(engine, task_id, launcher(worker));
                    engine
                        .task_terminated_with_result(task_id, 1, TaskOutcome::success("ok"))
                        .expect("result settles");
                }
            });
        }
    });

    assert_eq!(t.engine.registry().len(), 0);
    assert_eq!(t.engine.running_task_count(), 0);
    assert_eq!(t.gateway.commit_count("new_job"), 40);
    assert_eq!(t.gateway.commit_count("task_finished"), 40);
}
