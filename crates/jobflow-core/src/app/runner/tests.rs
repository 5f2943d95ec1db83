use std::collections::HashMap;
use std::sync::atomic::AtomicU32;
use std::sync::Mutex;

use async_trait::async_trait;
use rstest::rstest;
use serde_json::json;
use ulid::Ulid;

use super::*;
use crate::domain::{
    AroundHook, ContextSnapshot, DependencyWait, ErrorHook, Hook, OnTimeout, OutputField,
    TaskRetry, TaskThrottle,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Acquire(String),
    Release(String),
    Reschedule(Duration),
}

/// Queue double that records coordination calls and answers polls from a
/// table the test controls.
#[derive(Default)]
struct RecordingQueue {
    events: Mutex<Vec<Event>>,
    dispatched: Mutex<Vec<(JobId, UnitOfWork)>>,
    states: Mutex<HashMap<JobId, JobState>>,
    contexts: Mutex<HashMap<JobId, ContextSnapshot>>,
}

impl RecordingQueue {
    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn dispatched(&self) -> Vec<(JobId, UnitOfWork)> {
        self.dispatched.lock().unwrap().clone()
    }

    /// Finish every dispatched child by running its body result through
    /// `output` and storing the resulting context.
    fn complete_children(&self, output: impl Fn(&UnitOfWork) -> Option<TaskOutput>) {
        for (id, unit) in self.dispatched() {
            let mut snapshot = unit.context.clone();
            if let Some(out) = output(&unit) {
                snapshot.task_outputs.push(out);
            }
            self.states.lock().unwrap().insert(id, JobState::Succeeded);
            self.contexts.lock().unwrap().insert(id, snapshot);
        }
    }
}

#[async_trait]
impl Queue for RecordingQueue {
    async fn acquire_permit(&self, semaphore: &Semaphore, _holder: JobId) -> Result<bool, QueueError> {
        self.events
            .lock()
            .unwrap()
            .push(Event::Acquire(semaphore.concurrency_key.clone()));
        Ok(true)
    }

    async fn release_permit(&self, semaphore: &Semaphore, _holder: JobId) -> Result<bool, QueueError> {
        self.events
            .lock()
            .unwrap()
            .push(Event::Release(semaphore.concurrency_key.clone()));
        Ok(true)
    }

    async fn dispatch_batch(&self, units: Vec<UnitOfWork>) -> Result<Vec<JobId>, QueueError> {
        let mut ids = Vec::new();
        for unit in units {
            let id = JobId::from(Ulid::new());
            self.states.lock().unwrap().insert(id, JobState::Pending);
            self.dispatched.lock().unwrap().push((id, unit));
            ids.push(id);
        }
        Ok(ids)
    }

    async fn poll_statuses(&self, ids: &[JobId]) -> Result<HashMap<JobId, JobState>, QueueError> {
        let states = self.states.lock().unwrap();
        ids.iter()
            .map(|id| {
                states
                    .get(id)
                    .map(|s| (*id, *s))
                    .ok_or(QueueError::UnknownJob(*id))
            })
            .collect()
    }

    async fn fetch_completed_context(&self, id: JobId) -> Result<ContextSnapshot, QueueError> {
        self.contexts
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(QueueError::NotCompleted(id))
    }

    async fn reschedule_current(&self, _unit: UnitOfWork, delay: Duration) -> Result<(), QueueError> {
        self.events.lock().unwrap().push(Event::Reschedule(delay));
        Ok(())
    }
}

fn runner(workflow: Workflow, queue: Arc<RecordingQueue>) -> Runner {
    runner_with(workflow, queue, EngineConfig::default())
}

fn runner_with(workflow: Workflow, queue: Arc<RecordingQueue>, config: EngineConfig) -> Runner {
    Runner::new(Arc::new(workflow), queue, JobId::from(Ulid::new()), config)
}

fn log() -> Arc<Mutex<Vec<String>>> {
    Arc::new(Mutex::new(Vec::new()))
}

fn push(log: &Arc<Mutex<Vec<String>>>, entry: &str) {
    log.lock().unwrap().push(entry.to_string());
}

fn entries(log: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
    log.lock().unwrap().clone()
}

#[tokio::test]
async fn downstream_task_reads_upstream_output() {
    let workflow = Workflow::builder("Chain")
        .task(
            Task::builder("a")
                .output(OutputField::new("x", "Integer"))
                .body(|_| Ok(json!({"x": 1})))
                .build(),
        )
        .task(
            Task::builder("b")
                .depends_on(["a"])
                .output(OutputField::new("y", "Integer"))
                .body(|ctx| {
                    let x: i64 = ctx.output().first("a")?.get_as("x")?;
                    Ok(json!({"y": x + 1}))
                })
                .build(),
        )
        .build()
        .unwrap();

    let mut ctx = Context::default();
    let outcome = runner(workflow, Arc::default()).run(&mut ctx).await.unwrap();

    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(ctx.output().first("b").unwrap().data["y"], json!(2));
    assert_eq!(ctx.completed_tasks(), ["a", "b"]);
    assert_eq!(ctx.current_task_name(), None);
}

#[tokio::test]
async fn inline_map_records_one_output_per_element() {
    let workflow = Workflow::builder("Map")
        .task(
            Task::builder("double")
                .each(|_| Ok(vec![json!(1), json!(2), json!(3)]))
                .output(OutputField::new("v", "Integer"))
                .body(|ctx| {
                    let n: i64 = ctx.each_value_as()?;
                    Ok(json!({"v": n * 2}))
                })
                .build(),
        )
        .build()
        .unwrap();

    let mut ctx = Context::default();
    runner(workflow, Arc::default()).run(&mut ctx).await.unwrap();

    let values: Vec<(usize, serde_json::Value)> = ctx
        .output()
        .get("double")
        .into_iter()
        .map(|o| (o.index(), o.data["v"].clone()))
        .collect();
    assert_eq!(values, vec![(0, json!(2)), (1, json!(4)), (2, json!(6))]);
}

#[rstest]
#[case::enabled(true, "X")]
#[case::disabled(false, "real")]
#[tokio::test]
async fn dry_run_skips_guarded_blocks(#[case] dry_run: bool, #[case] expected: &str) {
    let workflow = Workflow::builder("Dry")
        .dry_run(dry_run)
        .task(
            Task::builder("t")
                .output(OutputField::new("r", "String"))
                .body(|ctx| {
                    let r = ctx.skip_in_dry_run_or("call", "X".to_string(), || "real".to_string());
                    Ok(json!({"r": r}))
                })
                .build(),
        )
        .build()
        .unwrap();

    let mut ctx = Context::default();
    runner(workflow, Arc::default()).run(&mut ctx).await.unwrap();

    assert_eq!(ctx.output().first("t").unwrap().data["r"], json!(expected));
    assert!(!ctx.is_dry_run());
}

#[tokio::test]
async fn false_condition_skips_body_and_hooks() {
    let calls = log();
    let (c1, c2, c3) = (calls.clone(), calls.clone(), calls.clone());
    let workflow = Workflow::builder("Cond")
        .task(
            Task::builder("t")
                .condition(|_| false)
                .output(OutputField::new("v", "Integer"))
                .body(move |_| {
                    push(&c1, "body");
                    Ok(json!({"v": 1}))
                })
                .build(),
        )
        .before(Hook::global(move |_| {
            push(&c2, "before");
            Ok(())
        }))
        .after(Hook::global(move |_| {
            push(&c3, "after");
            Ok(())
        }))
        .build()
        .unwrap();

    let mut ctx = Context::default();
    runner(workflow, Arc::default()).run(&mut ctx).await.unwrap();

    assert!(entries(&calls).is_empty());
    assert!(ctx.output().is_empty());
    assert!(ctx.is_completed("t"));
}

fn around(log: &Arc<Mutex<Vec<String>>>, label: &'static str) -> AroundHook {
    let log = Arc::clone(log);
    AroundHook::global(move |_ctx, mut next| {
        let log = Arc::clone(&log);
        Box::pin(async move {
            push(&log, &format!("{label}-enter"));
            next.call().await?;
            push(&log, &format!("{label}-exit"));
            Ok(())
        })
    })
}

fn plain(log: &Arc<Mutex<Vec<String>>>, label: &'static str) -> Hook {
    let log = Arc::clone(log);
    Hook::global(move |_| {
        push(&log, label);
        Ok(())
    })
}

#[tokio::test]
async fn hooks_wrap_the_body_in_registration_order() {
    let calls = log();
    let body_log = calls.clone();
    let workflow = Workflow::builder("Hooks")
        .task(
            Task::builder("t")
                .body(move |_| {
                    push(&body_log, "body");
                    Ok(json!(null))
                })
                .build(),
        )
        .before(plain(&calls, "B1"))
        .before(plain(&calls, "B2"))
        .around(around(&calls, "A1"))
        .around(around(&calls, "A2"))
        .after(plain(&calls, "F1"))
        .after(plain(&calls, "F2"))
        .build()
        .unwrap();

    runner(workflow, Arc::default())
        .run(&mut Context::default())
        .await
        .unwrap();

    assert_eq!(
        entries(&calls),
        vec![
            "B1", "B2", "A1-enter", "A2-enter", "body", "A2-exit", "A1-exit", "F1", "F2"
        ]
    );
}

#[tokio::test]
async fn around_hook_that_skips_the_body_is_a_control_error() {
    let errors = log();
    let e = errors.clone();
    let workflow = Workflow::builder("Lazy")
        .task(Task::builder("t").body(|_| Ok(json!(null))).build())
        .around(AroundHook::global(|_ctx, _next| Box::pin(async { Ok(()) })))
        .on_error(ErrorHook::global(move |_, _| {
            push(&e, "error");
            Ok(())
        }))
        .build()
        .unwrap();

    let mut ctx = Context::default();
    let err = runner(workflow, Arc::default()).run(&mut ctx).await.unwrap_err();

    assert!(matches!(err, WorkflowError::HookNotInvoked { task } if task == "t"));
    assert!(entries(&errors).is_empty());
    assert!(!ctx.is_completed("t"));
}

#[tokio::test]
async fn around_hook_calling_twice_is_rejected() {
    let workflow = Workflow::builder("Twice")
        .task(Task::builder("t").body(|_| Ok(json!(null))).build())
        .around(AroundHook::global(|_ctx, mut next| {
            Box::pin(async move {
                next.call().await?;
                next.call().await?;
                Ok(())
            })
        }))
        .build()
        .unwrap();

    let err = runner(workflow, Arc::default())
        .run(&mut Context::default())
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::HookAlreadyInvoked { .. }));
}

#[rstest]
#[case::recovers(2, 2, true)]
#[case::exhausts(1, 5, false)]
#[tokio::test(start_paused = true)]
async fn body_is_retried_up_to_the_limit(
    #[case] retries: u32,
    #[case] failures: u32,
    #[case] succeeds: bool,
) {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);
    let workflow = Workflow::builder("Retry")
        .task(
            Task::builder("flaky")
                .retry(TaskRetry::new(retries).with_base_delay(Duration::from_millis(10)))
                .body(move |_| {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if n <= failures {
                        Err(format!("attempt {n} failed").into())
                    } else {
                        Ok(json!(null))
                    }
                })
                .build(),
        )
        .build()
        .unwrap();

    let result = runner(workflow, Arc::default())
        .run(&mut Context::default())
        .await;

    if succeeds {
        assert_eq!(result.unwrap(), RunOutcome::Completed);
        assert_eq!(attempts.load(Ordering::SeqCst), failures + 1);
    } else {
        let err = result.unwrap_err();
        assert!(matches!(err, WorkflowError::TaskFailed { attempts: 2, .. }));
        assert_eq!(attempts.load(Ordering::SeqCst), retries + 1);
    }
}

#[tokio::test]
async fn throttle_permit_is_released_when_the_body_fails() {
    let queue = Arc::new(RecordingQueue::default());
    let workflow = Workflow::builder("Throttled")
        .task(
            Task::builder("call_api")
                .throttle(TaskThrottle::new(1))
                .body(|_| Err("rate limited".into()))
                .build(),
        )
        .build()
        .unwrap();

    let err = runner(workflow, queue.clone())
        .run(&mut Context::default())
        .await
        .unwrap_err();

    assert!(err.is_task_level());
    let key = "Throttled:call_api".to_string();
    assert_eq!(queue.events(), vec![Event::Acquire(key.clone()), Event::Release(key)]);
}

#[tokio::test]
async fn explicit_throttle_key_is_shared() {
    let queue = Arc::new(RecordingQueue::default());
    let workflow = Workflow::builder("Shared")
        .task(
            Task::builder("a")
                .throttle(TaskThrottle::new(2).with_key("external-api"))
                .body(|_| Ok(json!(null)))
                .build(),
        )
        .build()
        .unwrap();

    runner(workflow, queue.clone())
        .run(&mut Context::default())
        .await
        .unwrap();
    assert_eq!(
        queue.events(),
        vec![
            Event::Acquire("external-api".into()),
            Event::Release("external-api".into())
        ]
    );
}

fn fan_out(on_timeout: OnTimeout) -> Workflow {
    Workflow::builder("FanOut")
        .task(
            Task::builder("square")
                .each(|_| Ok(vec![json!(2), json!(3)]))
                .concurrency_limit(1)
                .output(OutputField::new("sq", "Integer"))
                .body(|ctx| {
                    let n: i64 = ctx.each_value_as()?;
                    Ok(json!({"sq": n * n}))
                })
                .build(),
        )
        .task(
            Task::builder("sum")
                .depends_on(["square"])
                .dependency_wait(DependencyWait {
                    poll_timeout: Duration::from_secs(3),
                    poll_interval: Duration::from_secs(1),
                    reschedule_delay: Duration::from_secs(10),
                    on_timeout,
                })
                .output(OutputField::new("total", "Integer"))
                .body(|ctx| {
                    let mut total = 0;
                    for out in ctx.output().get("square") {
                        total += out.get_as::<i64>("sq")?;
                    }
                    Ok(json!({"total": total}))
                })
                .build(),
        )
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn dispatched_map_submits_one_child_per_element() {
    let queue = Arc::new(RecordingQueue::default());
    let runner = runner(fan_out(OnTimeout::Fail), queue.clone());
    let mut ctx = Context::default();

    let err = runner.run(&mut ctx).await.unwrap_err();
    assert!(matches!(
        err,
        WorkflowError::DependencyTimeout { ref dependency, .. } if dependency == "square"
    ));

    let dispatched = queue.dispatched();
    assert_eq!(dispatched.len(), 2);
    for (index, (_, unit)) in dispatched.iter().enumerate() {
        let state = unit.context.each_state.as_ref().unwrap();
        assert_eq!(state.index, index);
        assert_eq!(state.parent_job_id, runner.job_id());
        let semaphore = unit.concurrency.as_ref().unwrap();
        assert_eq!(semaphore.concurrency_key, "FanOut:square:each");
        assert_eq!(semaphore.concurrency_limit, Some(1));
    }
    assert_eq!(ctx.job_status().with_state("square", JobState::Pending).len(), 2);
    assert!(ctx.is_completed("square"));
}

#[tokio::test(start_paused = true)]
async fn timeout_with_reschedule_suspends_the_run() {
    let queue = Arc::new(RecordingQueue::default());
    let mut ctx = Context::default();

    let outcome = runner(fan_out(OnTimeout::Reschedule), queue.clone())
        .run(&mut ctx)
        .await
        .unwrap();

    assert_eq!(outcome, RunOutcome::Suspended { delay: Duration::from_secs(10) });
    assert_eq!(queue.events(), vec![Event::Reschedule(Duration::from_secs(10))]);
    assert_eq!(ctx.current_task_name(), Some("sum"));
    assert!(!ctx.is_completed("sum"));
}

#[tokio::test(start_paused = true)]
async fn resumed_run_merges_child_outputs_without_redispatching() {
    let queue = Arc::new(RecordingQueue::default());
    let runner = runner(fan_out(OnTimeout::Reschedule), queue.clone());
    let mut ctx = Context::default();
    runner.run(&mut ctx).await.unwrap();

    let workflow = runner.workflow();
    let square = workflow.fetch_task("square").unwrap();
    queue.complete_children(|unit| {
        let child = Context::from_snapshot(unit.context.clone());
        let value = square.invoke(&child).unwrap();
        square.shape_output(child.each_index(), value).unwrap()
    });

    // resume from the serialized context, as the queue would
    let mut resumed = Context::deserialize(&ctx.serialize().unwrap()).unwrap();
    let outcome = runner.run(&mut resumed).await.unwrap();

    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(queue.dispatched().len(), 2);
    assert_eq!(resumed.output().get("square").len(), 2);
    assert_eq!(resumed.output().first("sum").unwrap().data["total"], json!(13));
    assert!(resumed.job_status().finished("square"));
}

#[tokio::test]
async fn each_iteration_context_runs_only_its_body() {
    let hooks = log();
    let workflow = Workflow::builder("FanOut")
        .task(
            Task::builder("square")
                .each(|_| Ok(vec![json!(2), json!(3)]))
                .concurrency_limit(1)
                .output(OutputField::new("sq", "Integer"))
                .body(|ctx| {
                    let n: i64 = ctx.each_value_as()?;
                    Ok(json!({"sq": n * n}))
                })
                .build(),
        )
        .task(Task::builder("after_map").body(|_| Err("must not run".into())).build())
        .before(plain(&hooks, "before"))
        .build()
        .unwrap();

    let mut ctx = Context::default().for_each_iteration(EachState {
        parent_job_id: JobId::from(Ulid::new()),
        task_name: "square".into(),
        index: 1,
        value: json!(3),
    });
    let outcome = runner(workflow, Arc::default()).run(&mut ctx).await.unwrap();

    assert_eq!(outcome, RunOutcome::Completed);
    let out = ctx.output().get_at("square", 1).unwrap();
    assert_eq!(out.data["sq"], json!(9));
    assert!(entries(&hooks).is_empty());
}

#[tokio::test]
async fn resumed_inline_map_skips_elements_that_finished() {
    let seen = log();
    let failed_once = Arc::new(AtomicBool::new(false));
    let (s, f) = (seen.clone(), Arc::clone(&failed_once));
    let workflow = Workflow::builder("Notify")
        .task(
            Task::builder("send")
                .each(|_| Ok(vec![json!(1), json!(2), json!(3)]))
                .body(move |ctx| {
                    let n: i64 = ctx.each_value_as()?;
                    push(&s, &n.to_string());
                    if n == 3 && !f.swap(true, Ordering::SeqCst) {
                        return Err("mail server down".into());
                    }
                    Ok(json!(null))
                })
                .build(),
        )
        .build()
        .unwrap();
    let runner = runner(workflow, Arc::default());

    let mut ctx = Context::default();
    assert!(runner.run(&mut ctx).await.is_err());
    assert!(ctx.is_each_completed("send", 1));
    assert!(!ctx.is_each_completed("send", 2));

    let mut resumed = Context::deserialize(&ctx.serialize().unwrap()).unwrap();
    runner.run(&mut resumed).await.unwrap();

    assert_eq!(entries(&seen), vec!["1", "2", "3", "3"]);
    assert!(resumed.is_completed("send"));
}

#[tokio::test]
async fn failed_map_iteration_does_not_run_error_hooks() {
    let errors = log();
    let e = errors.clone();
    let workflow = Workflow::builder("FanOut")
        .task(
            Task::builder("square")
                .each(|_| Ok(vec![json!(1)]))
                .concurrency_limit(1)
                .body(|_| Err("bad element".into()))
                .build(),
        )
        .on_error(ErrorHook::global(move |_, _| {
            push(&e, "error");
            Ok(())
        }))
        .build()
        .unwrap();

    let mut ctx = Context::default().for_each_iteration(EachState {
        parent_job_id: JobId::from(Ulid::new()),
        task_name: "square".into(),
        index: 0,
        value: json!(1),
    });
    let err = runner(workflow, Arc::default()).run(&mut ctx).await.unwrap_err();

    assert!(matches!(err, WorkflowError::TaskFailed { .. }));
    assert!(entries(&errors).is_empty());
}

#[tokio::test]
async fn failure_keeps_earlier_outputs_and_notifies_error_hooks() {
    let errors = log();
    let e = errors.clone();
    let workflow = Workflow::builder("Partial")
        .task(
            Task::builder("a")
                .output(OutputField::new("v", "Integer"))
                .body(|_| Ok(json!({"v": 1})))
                .build(),
        )
        .task(
            Task::builder("b")
                .depends_on(["a"])
                .body(|_| Err("boom".into()))
                .build(),
        )
        .on_error(ErrorHook::for_tasks(["b"], move |ctx, err| {
            let task = ctx.current_task_name().unwrap_or_default();
            push(&e, &format!("{task}:{}", err.is_task_level()));
            Ok(())
        }))
        .build()
        .unwrap();

    let mut ctx = Context::default();
    let err = runner(workflow, Arc::default()).run(&mut ctx).await.unwrap_err();

    assert!(matches!(err, WorkflowError::TaskFailed { ref task, .. } if task == "b"));
    assert_eq!(ctx.output().first("a").unwrap().data["v"], json!(1));
    assert_eq!(entries(&errors), vec!["b:true"]);
}

#[tokio::test]
async fn rerun_skips_tasks_that_already_completed() {
    let a_runs = Arc::new(AtomicU32::new(0));
    let b_runs = Arc::new(AtomicU32::new(0));
    let (a, b) = (Arc::clone(&a_runs), Arc::clone(&b_runs));
    let workflow = Workflow::builder("Resume")
        .task(
            Task::builder("a")
                .body(move |_| {
                    a.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(null))
                })
                .build(),
        )
        .task(
            Task::builder("b")
                .body(move |_| {
                    if b.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err("first try fails".into())
                    } else {
                        Ok(json!(null))
                    }
                })
                .build(),
        )
        .build()
        .unwrap();
    let runner = runner(workflow, Arc::default());

    let mut ctx = Context::default();
    assert!(runner.run(&mut ctx).await.is_err());
    runner.run(&mut ctx).await.unwrap();

    assert_eq!(a_runs.load(Ordering::SeqCst), 1);
    assert_eq!(b_runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn dependency_declared_later_has_not_run() {
    let workflow = Workflow::builder("Forward")
        .task(
            Task::builder("b")
                .depends_on(["a"])
                .body(|_| Ok(json!(null)))
                .build(),
        )
        .task(Task::builder("a").body(|_| Ok(json!(null))).build())
        .build()
        .unwrap();

    let err = runner(workflow, Arc::default())
        .run(&mut Context::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        WorkflowError::DependencyNotFinished { ref task, ref dependency } if task == "b" && dependency == "a"
    ));
}

#[tokio::test(start_paused = true)]
async fn dependency_wait_falls_back_to_engine_config() {
    let queue = Arc::new(RecordingQueue::default());
    let workflow = Workflow::builder("Cfg")
        .task(
            Task::builder("m")
                .each(|_| Ok(vec![json!(1)]))
                .concurrency_limit(1)
                .body(|_| Ok(json!(null)))
                .build(),
        )
        .task(Task::builder("n").depends_on(["m"]).body(|_| Ok(json!(null))).build())
        .build()
        .unwrap();
    let config = EngineConfig {
        dependency_poll_timeout_ms: 0,
        dependency_reschedule_delay_ms: 250,
        ..EngineConfig::default()
    };

    let outcome = runner_with(workflow, queue.clone(), config)
        .run(&mut Context::default())
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Suspended { delay: Duration::from_millis(250) });
}
