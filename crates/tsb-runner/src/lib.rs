//! Orchestration core for time-series forecasting benchmarks.
//!
//! A benchmark pairs catalog tasks with players and seeds, turns every pair
//! into a shell job for an execution engine, and routes the engine's
//! lifecycle events back to observers.

pub mod command;
pub mod config;
pub mod engine;
pub mod env;
pub mod error;
mod fsutil;
pub mod lifecycle;
pub mod planner;
pub mod players;
pub mod report;
pub mod tasks;

pub use command::{Backend, CommandSynthesizer, JobParams, JobSubmission, Machine};
pub use config::{BenchmarkConfig, LoggingConfig};
pub use engine::{replay_events, BatchDirEngine, BatchHandle, ExecutionEngine, ReplaySummary};
pub use env::{Environment, Requirements};
pub use error::{Error, Result};
pub use lifecycle::{BenchmarkObserver, DispatchOutcome, JobEvent, JobEventKind, LifecycleBridge, LoggingObserver};
pub use planner::{plan, Constraints, Plan, WorkItem, WorkItemStatus};
pub use players::{load_player, Player, PlayerRegistry};
pub use report::{make_report, Report};
pub use tasks::{
    select_task_configs, JsonlCatalog, JsonlPartitions, PartitionSource, Task, TaskCatalog,
    TaskConfig, TaskFilter, TaskKind, TaskSelection,
};

use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Fully resolved inputs of one benchmark run.
#[derive(Debug, Clone)]
pub struct BenchmarkDef {
    pub name: String,
    pub desc: String,
    pub players: Vec<Arc<Player>>,
    pub task_configs: Vec<Arc<TaskConfig>>,
    pub seeds: Vec<u64>,
    pub constraints: Constraints,
    pub backend: Backend,
    pub bootstrap_script: PathBuf,
    pub manager_home: Option<PathBuf>,
    pub working_dir: PathBuf,
}

impl BenchmarkDef {
    /// Resolves a loaded config against a catalog and the built-in players.
    pub fn from_config(
        cfg: &BenchmarkConfig,
        catalog: &dyn TaskCatalog,
        registry: &PlayerRegistry,
    ) -> Result<Self> {
        let players = registry.select(&cfg.players, &cfg.base_dir)?;
        let task_configs = select_task_configs(catalog, &cfg.tasks)?;
        let bootstrap_script = cfg
            .bootstrap_script
            .clone()
            .unwrap_or_else(|| cfg.base_dir.join("runpy.sh"));
        Ok(Self {
            name: cfg.name.clone(),
            desc: cfg.desc.clone(),
            players,
            task_configs,
            seeds: cfg.seeds.clone(),
            constraints: cfg.constraints.clone(),
            backend: cfg.backend.clone(),
            bootstrap_script,
            manager_home: cfg.manager_home.clone(),
            working_dir: cfg.working_dir.clone(),
        })
    }

    pub fn batches_root(&self) -> PathBuf {
        self.working_dir.join("batches")
    }
}

/// Plans a benchmark and drives it through an execution engine.
pub struct Benchmark<E: ExecutionEngine> {
    def: BenchmarkDef,
    synthesizer: CommandSynthesizer,
    engine: E,
}

impl<E: ExecutionEngine> Benchmark<E> {
    /// Checks everything that can be checked before planning: a non-empty
    /// selection, a bootstrap script on disk, and a manager home for managed players.
    pub fn new(def: BenchmarkDef, engine: E) -> Result<Self> {
        if def.players.is_empty() {
            return Err(Error::config("player selection is empty"));
        }
        if def.task_configs.is_empty() {
            return Err(Error::config("task selection is empty"));
        }
        if def.seeds.is_empty() {
            return Err(Error::config("random_states is empty"));
        }
        if !def.bootstrap_script.is_file() {
            return Err(Error::config(format!(
                "bootstrap script not found: {}",
                def.bootstrap_script.display()
            )));
        }
        def.backend.validate()?;
        let synthesizer = CommandSynthesizer::new(
            def.bootstrap_script.clone(),
            def.manager_home.clone(),
            def.batches_root().join(&def.name),
        );
        synthesizer.check_players(&def.players)?;
        Ok(Self {
            def,
            synthesizer,
            engine,
        })
    }

    pub fn def(&self) -> &BenchmarkDef {
        &self.def
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Expands the work items and synthesizes one job per item.
    pub fn plan(&self) -> Result<Arc<Plan>> {
        let d = &self.def;
        let items = planner::plan(&d.task_configs, &d.players, &d.seeds, &d.constraints);
        let jobs = items
            .iter()
            .map(|item| self.synthesizer.synthesize(item, &d.backend))
            .collect::<Result<Vec<_>>>()?;
        info!("planned {} jobs for benchmark {}", jobs.len(), d.name);
        Ok(Arc::new(Plan::new(d.name.clone(), d.desc.clone(), items, jobs)))
    }

    pub fn submit(&self, plan: &Plan) -> Result<BatchHandle> {
        self.engine.submit_batch(&plan.name, plan.jobs())
    }

    /// Starts the batch and notifies the bridge's observers.
    pub fn start(&self, batch: &BatchHandle, bridge: &LifecycleBridge) -> Result<()> {
        self.engine.start(batch)?;
        bridge.notify_start();
        Ok(())
    }

    pub fn stop(&self, batch: &BatchHandle) -> Result<()> {
        self.engine.stop(batch)
    }

    pub fn bridge(&self, plan: Arc<Plan>) -> LifecycleBridge {
        LifecycleBridge::new(plan)
    }
}
