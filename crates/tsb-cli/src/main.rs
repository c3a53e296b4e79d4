use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tsb_runner::tasks::DataSize;
use tsb_runner::{
    BatchDirEngine, Benchmark, BenchmarkConfig, BenchmarkDef, ExecutionEngine, JsonlCatalog,
    LoggingObserver, Plan, Player, PlayerRegistry, TaskCatalog, TaskFilter, TaskKind,
};

#[derive(Parser)]
#[command(name = "tsb", version = "0.3.0", about = "Time-series forecasting benchmark runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the resolved players, tasks, seeds and backend of a benchmark.
    Describe {
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Print every job the benchmark would submit.
    Plan {
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Hand the batch to the engine and start it.
    Submit {
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Stop {
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Replay an engine event log through the lifecycle bridge.
    Events {
        config: PathBuf,
        #[arg(long)]
        events: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Tasks {
        #[arg(long)]
        catalog: PathBuf,
        #[arg(long)]
        kind: Vec<TaskKind>,
        #[arg(long)]
        size: Vec<DataSize>,
        #[arg(long)]
        id: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    Players {
        #[arg(long)]
        players_dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error(error_code(&err), format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Describe { config, json } => {
            let cfg = BenchmarkConfig::load(&config)?;
            with_logging(&cfg.logging.level, || {
                let bench = load_benchmark(&cfg)?;
                let plan = bench.plan()?;
                let def = bench.def();
                if json {
                    return Ok(Some(json!({
                        "ok": true,
                        "command": "describe",
                        "summary": describe_to_json(def, &plan),
                    })));
                }
                print_describe(def, &plan);
                Ok(None)
            })
        }
        Commands::Plan { config, json } => {
            let cfg = BenchmarkConfig::load(&config)?;
            with_logging(&cfg.logging.level, || {
                let plan = load_benchmark(&cfg)?.plan()?;
                if json {
                    return Ok(Some(json!({
                        "ok": true,
                        "command": "plan",
                        "name": plan.name,
                        "jobs": plan.jobs(),
                    })));
                }
                for job in plan.jobs() {
                    println!("job: {}", job.name);
                    println!("  command: {}", job.command);
                    println!("  working_dir: {}", job.working_dir.display());
                    for asset in &job.assets {
                        println!("  asset: {}", asset.display());
                    }
                }
                Ok(None)
            })
        }
        Commands::Submit { config, json } => {
            let cfg = BenchmarkConfig::load(&config)?;
            with_logging(&cfg.logging.level, || {
                let bench = load_benchmark(&cfg)?;
                let plan = bench.plan()?;
                let bridge = bench
                    .bridge(plan.clone())
                    .with_observer(Arc::new(LoggingObserver));
                let batch = bench.submit(&plan)?;
                bench.start(&batch, &bridge)?;
                if json {
                    return Ok(Some(json!({
                        "ok": true,
                        "command": "submit",
                        "batch": batch,
                        "jobs": plan.jobs().len(),
                    })));
                }
                println!("batch: {}", batch.name);
                println!("batch_dir: {}", batch.dir.display());
                println!("jobs: {}", plan.jobs().len());
                println!("resumed: {}", batch.resumed);
                Ok(None)
            })
        }
        Commands::Stop { config, json } => {
            let cfg = BenchmarkConfig::load(&config)?;
            with_logging(&cfg.logging.level, || {
                let engine = BatchDirEngine::new(cfg.batches_root(), cfg.backend.clone());
                let batch = engine.open(&cfg.name)?;
                engine.stop(&batch)?;
                if json {
                    return Ok(Some(json!({
                        "ok": true,
                        "command": "stop",
                        "batch": batch,
                    })));
                }
                println!("stopped: {}", batch.name);
                Ok(None)
            })
        }
        Commands::Events {
            config,
            events,
            json,
        } => {
            let cfg = BenchmarkConfig::load(&config)?;
            with_logging(&cfg.logging.level, || {
                let bench = load_benchmark(&cfg)?;
                let plan = bench.plan()?;
                let bridge = bench
                    .bridge(plan.clone())
                    .with_observer(Arc::new(LoggingObserver));
                let summary = tsb_runner::replay_events(&events, &bridge)?;
                let statuses: Vec<Value> = plan
                    .items()
                    .iter()
                    .map(|i| json!({"id": i.id(), "status": i.status().to_string()}))
                    .collect();
                if json {
                    return Ok(Some(json!({
                        "ok": true,
                        "command": "events",
                        "summary": summary,
                        "finished": plan.is_finished(),
                        "items": statuses,
                    })));
                }
                println!("dispatched: {}", summary.dispatched);
                println!("dropped: {}", summary.dropped);
                println!("observer_failures: {}", summary.observer_failures);
                println!("malformed: {}", summary.malformed);
                for item in plan.items() {
                    println!("{}: {}", item.id(), item.status());
                }
                Ok(None)
            })
        }
        Commands::Tasks {
            catalog,
            kind,
            size,
            id,
            json,
        } => with_logging("info", || {
            let catalog = JsonlCatalog::load(&catalog)?;
            let filter = TaskFilter {
                task_kinds: kind,
                data_sizes: size,
                ids: id,
            };
            let mut rows = Vec::new();
            for task_id in catalog.list(&filter) {
                let config = catalog.resolve(&task_id)?;
                rows.push(json!({
                    "id": config.id,
                    "task": config.task,
                    "data_size": config.data_size,
                    "horizon": config.horizon,
                    "dataset_id": config.dataset_id,
                }));
            }
            if json {
                return Ok(Some(json!({"ok": true, "command": "tasks", "tasks": rows})));
            }
            for row in &rows {
                println!(
                    "{}\t{}\t{}\thorizon={}",
                    row["id"].as_str().unwrap_or_default(),
                    row["task"].as_str().unwrap_or_default(),
                    row["data_size"].as_str().unwrap_or_default(),
                    row["horizon"]
                );
            }
            Ok(None)
        }),
        Commands::Players { players_dir, json } => with_logging("info", || {
            let registry = PlayerRegistry::load_builtins(&players_dir)?;
            let players: Vec<Value> = registry.builtins().iter().map(|p| player_to_json(p)).collect();
            if json {
                return Ok(Some(json!({"ok": true, "command": "players", "players": players})));
            }
            for p in registry.builtins() {
                println!("{}\t{}\t{}", p.name(), p.env.venv_kind(), p.base_dir().display());
            }
            Ok(None)
        }),
    }
}

fn load_benchmark(cfg: &BenchmarkConfig) -> Result<Benchmark<BatchDirEngine>> {
    let catalog_path = cfg
        .catalog
        .as_deref()
        .ok_or_else(|| tsb_runner::Error::config("benchmark config has no 'catalog'"))?;
    let catalog = JsonlCatalog::load(catalog_path)?;
    let registry = match cfg.players_dir.as_deref() {
        Some(dir) => PlayerRegistry::load_builtins(dir)?,
        None => PlayerRegistry::default(),
    };
    let def = BenchmarkDef::from_config(cfg, &catalog, &registry)?;
    let engine = BatchDirEngine::new(def.batches_root(), def.backend.clone());
    Ok(Benchmark::new(def, engine)?)
}

/// Runs `f` with a fmt subscriber installed for the current thread only.
/// `RUST_LOG` takes precedence over the configured level.
fn with_logging<T>(level: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::with_default(subscriber, f)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn error_code(err: &anyhow::Error) -> &'static str {
    match err.downcast_ref::<tsb_runner::Error>() {
        Some(e @ tsb_runner::Error::Configuration(_)) | Some(e @ tsb_runner::Error::Resolution(_)) => {
            e.code()
        }
        _ => "command_failed",
    }
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Describe { json, .. }
        | Commands::Plan { json, .. }
        | Commands::Submit { json, .. }
        | Commands::Stop { json, .. }
        | Commands::Events { json, .. }
        | Commands::Tasks { json, .. }
        | Commands::Players { json, .. } => *json,
    }
}

fn player_to_json(player: &Player) -> Value {
    json!({
        "name": player.name(),
        "base_dir": player.base_dir().display().to_string(),
        "exec_file": player.exec_file.display().to_string(),
        "env": player.env,
        "tasks": player.tasks,
        "random": player.random,
    })
}

fn describe_to_json(def: &BenchmarkDef, plan: &Plan) -> Value {
    json!({
        "name": def.name,
        "desc": def.desc,
        "players": def.players.iter().map(|p| player_to_json(p)).collect::<Vec<_>>(),
        "tasks": def.task_configs.iter().map(|t| t.id.clone()).collect::<Vec<_>>(),
        "seeds": def.seeds,
        "constraints": def.constraints,
        "backend": def.backend,
        "working_dir": def.working_dir.display().to_string(),
        "manager_home": def.manager_home.as_ref().map(|p| p.display().to_string()),
        "items": plan.items().len(),
    })
}

fn print_describe(def: &BenchmarkDef, plan: &Plan) {
    println!("benchmark: {}", def.name);
    if !def.desc.is_empty() {
        println!("desc: {}", def.desc);
    }
    let names: Vec<&str> = def.players.iter().map(|p| p.name()).collect();
    println!("players: {}", names.join(", "));
    let tasks: Vec<&str> = def.task_configs.iter().map(|t| t.id.as_str()).collect();
    println!("tasks: {}", tasks.join(", "));
    println!("seeds: {:?}", def.seeds);
    if let Some(n) = def.constraints.max_trials {
        println!("max_trials: {}", n);
    }
    if let Some(m) = &def.constraints.reward_metric {
        println!("reward_metric: {}", m);
    }
    println!("backend: {}", def.backend.as_str());
    println!("working_dir: {}", display(&def.working_dir));
    if let Some(home) = &def.manager_home {
        println!("manager_home: {}", display(home));
    }
    println!("items: {}", plan.items().len());
}

fn display(path: &Path) -> String {
    path.display().to_string()
}
