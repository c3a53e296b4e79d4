//! Routes execution-engine job events to the work items of a plan and fans
//! them out to benchmark observers.

use crate::command::JobParams;
use crate::planner::{Plan, WorkItem, WorkItemStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Callbacks for benchmark progress. Every method defaults to a no-op.
///
/// Implementations may be called from any engine callback thread. A returned
/// error or a panic is logged by the bridge and does not reach the other
/// observers.
pub trait BenchmarkObserver: Send + Sync {
    fn on_start(&self, _plan: &Plan) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_task_start(&self, _plan: &Plan, _item: &WorkItem) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_task_finish(&self, _plan: &Plan, _item: &WorkItem, _elapsed: f64) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_task_message(&self, _plan: &Plan, _item: &WorkItem, _payload: &Value) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_task_break(&self, _plan: &Plan, _item: &WorkItem, _elapsed: f64) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_finish(&self, _plan: &Plan) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    Start,
    Finish,
    Message,
    Break,
    BatchFinish,
}

/// One notification from the execution engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    #[serde(default)]
    pub job_name: String,
    /// Absent on batch-level events.
    #[serde(default)]
    pub params: Option<JobParams>,
    pub kind: JobEventKind,
    #[serde(default)]
    pub elapsed_secs: Option<f64>,
    #[serde(default)]
    pub payload: Option<Value>,
}

impl JobEvent {
    pub fn for_job(job_name: impl Into<String>, params: JobParams, kind: JobEventKind) -> Self {
        Self {
            job_name: job_name.into(),
            params: Some(params),
            kind,
            elapsed_secs: None,
            payload: None,
        }
    }

    pub fn batch_finish() -> Self {
        Self {
            job_name: String::new(),
            params: None,
            kind: JobEventKind::BatchFinish,
            elapsed_secs: None,
            payload: None,
        }
    }

    pub fn with_elapsed(mut self, secs: f64) -> Self {
        self.elapsed_secs = Some(secs);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Delivered to every observer; `failures` counts the ones that errored or panicked.
    Delivered { failures: usize },
    /// No work item matched the event.
    Dropped,
}

pub struct LifecycleBridge {
    plan: Arc<Plan>,
    observers: Vec<Arc<dyn BenchmarkObserver>>,
}

impl LifecycleBridge {
    pub fn new(plan: Arc<Plan>) -> Self {
        Self {
            plan,
            observers: Vec::new(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn BenchmarkObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn plan(&self) -> &Arc<Plan> {
        &self.plan
    }

    pub fn notify_start(&self) -> DispatchOutcome {
        let plan = &*self.plan;
        self.fan_out("on_start", |o| o.on_start(plan))
    }

    pub fn dispatch(&self, event: &JobEvent) -> DispatchOutcome {
        let plan = &*self.plan;
        if event.kind == JobEventKind::BatchFinish {
            info!("benchmark {} finished", plan.name);
            return self.fan_out("on_finish", |o| o.on_finish(plan));
        }

        let item = event
            .params
            .as_ref()
            .and_then(|p| plan.find(&p.player, p.seed, &p.task_id));
        let Some(item) = item else {
            warn!(
                "no work item matches job {} ({:?} event), dropping it",
                event.job_name, event.kind
            );
            return DispatchOutcome::Dropped;
        };

        let elapsed = event.elapsed_secs.unwrap_or_default();
        match event.kind {
            JobEventKind::Start => {
                item.set_status(WorkItemStatus::Running);
                self.fan_out("on_task_start", |o| o.on_task_start(plan, item))
            }
            JobEventKind::Finish => {
                item.set_status(WorkItemStatus::Succeed);
                self.fan_out("on_task_finish", |o| o.on_task_finish(plan, item, elapsed))
            }
            JobEventKind::Break => {
                item.set_status(WorkItemStatus::Failed);
                self.fan_out("on_task_break", |o| o.on_task_break(plan, item, elapsed))
            }
            JobEventKind::Message => {
                let payload = event.payload.clone().unwrap_or(Value::Null);
                self.fan_out("on_task_message", |o| o.on_task_message(plan, item, &payload))
            }
            JobEventKind::BatchFinish => DispatchOutcome::Delivered { failures: 0 },
        }
    }

    fn fan_out<F>(&self, hook: &str, call: F) -> DispatchOutcome
    where
        F: Fn(&dyn BenchmarkObserver) -> anyhow::Result<()>,
    {
        let mut failures = 0;
        for observer in &self.observers {
            match catch_unwind(AssertUnwindSafe(|| call(observer.as_ref()))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    error!("observer failed in {}: {:#}", hook, e);
                }
                Err(panic) => {
                    failures += 1;
                    error!("observer panicked in {}: {}", hook, panic_message(&panic));
                }
            }
        }
        DispatchOutcome::Delivered { failures }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Writes every lifecycle notification to the log.
#[derive(Debug, Default)]
pub struct LoggingObserver;

impl BenchmarkObserver for LoggingObserver {
    fn on_start(&self, plan: &Plan) -> anyhow::Result<()> {
        info!("benchmark {} started with {} jobs", plan.name, plan.items().len());
        Ok(())
    }

    fn on_task_start(&self, _plan: &Plan, item: &WorkItem) -> anyhow::Result<()> {
        info!("job {} started", item.id());
        Ok(())
    }

    fn on_task_finish(&self, _plan: &Plan, item: &WorkItem, elapsed: f64) -> anyhow::Result<()> {
        info!("job {} finished in {:.3}s", item.id(), elapsed);
        Ok(())
    }

    fn on_task_message(&self, _plan: &Plan, item: &WorkItem, payload: &Value) -> anyhow::Result<()> {
        info!("job {} reported {}", item.id(), payload);
        Ok(())
    }

    fn on_task_break(&self, _plan: &Plan, item: &WorkItem, elapsed: f64) -> anyhow::Result<()> {
        warn!("job {} broke after {:.3}s", item.id(), elapsed);
        Ok(())
    }

    fn on_finish(&self, plan: &Plan) -> anyhow::Result<()> {
        info!("benchmark {} finished", plan.name);
        Ok(())
    }
}
