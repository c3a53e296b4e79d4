//! Benchmark configuration file loading.
//!
//! The YAML file is first read as an untyped value so every missing required
//! field can be reported at once, then deserialized into typed structs. All
//! relative paths resolve against the directory holding the file.

use crate::command::Backend;
use crate::error::{Error, Result};
use crate::fsutil::{read_to_string, resolve_against, sha256_bytes};
use crate::planner::Constraints;
use crate::tasks::TaskSelection;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

pub const DEFAULT_SEED: u64 = 8086;
pub const SEED_UPPER_BOUND: u64 = 65536;
const DEFAULT_WORKING_DIR_NAME: &str = "tsbenchmark-data-dir";

const REQUIRED_FIELDS: &[&str] = &["/name", "/players", "/tasks", "/backend/kind"];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    name: String,
    #[serde(default)]
    desc: String,
    players: Vec<String>,
    tasks: TaskSelection,
    #[serde(default)]
    random_states: Option<Vec<u64>>,
    #[serde(default)]
    n_random_states: Option<usize>,
    #[serde(default)]
    constraints: Constraints,
    #[serde(default)]
    working_dir: Option<PathBuf>,
    #[serde(default)]
    manager_home: Option<PathBuf>,
    #[serde(default)]
    catalog: Option<PathBuf>,
    #[serde(default)]
    players_dir: Option<PathBuf>,
    #[serde(default)]
    bootstrap_script: Option<PathBuf>,
    backend: Backend,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkConfig {
    pub name: String,
    pub desc: String,
    /// Built-in player names or player directories, in selection order.
    pub players: Vec<String>,
    pub tasks: TaskSelection,
    pub seeds: Vec<u64>,
    pub constraints: Constraints,
    pub working_dir: PathBuf,
    pub manager_home: Option<PathBuf>,
    pub catalog: Option<PathBuf>,
    pub players_dir: Option<PathBuf>,
    pub bootstrap_script: Option<PathBuf>,
    pub backend: Backend,
    pub logging: LoggingConfig,
    /// Directory that relative player paths resolve against.
    pub base_dir: PathBuf,
}

impl BenchmarkConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = read_to_string(path)?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let base_dir = if base_dir.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            base_dir
        };
        let base_dir = base_dir
            .canonicalize()
            .map_err(|e| Error::io(&base_dir, e))?;
        Self::from_yaml_str(&raw, &base_dir)
    }

    pub fn from_yaml_str(raw: &str, base_dir: &Path) -> Result<Self> {
        let value: Value = serde_yaml::from_str(raw)?;
        validate_required_fields(&value)?;
        let parsed: RawConfig = serde_json::from_value(value)
            .map_err(|e| Error::config(format!("invalid benchmark config: {}", e)))?;
        parsed.backend.validate()?;
        if parsed.name.contains(['/', '\\']) {
            return Err(Error::config(format!(
                "benchmark name must not contain path separators: {}",
                parsed.name
            )));
        }

        let seeds = select_seeds(&parsed.name, parsed.random_states, parsed.n_random_states)?;
        let resolve = |p: Option<PathBuf>| p.map(|p| resolve_against(base_dir, &p));
        let working_dir = match parsed.working_dir {
            Some(dir) => resolve_against(base_dir, &dir),
            None => default_working_dir(),
        };

        Ok(Self {
            name: parsed.name,
            desc: parsed.desc,
            players: parsed.players,
            tasks: parsed.tasks,
            seeds,
            constraints: parsed.constraints,
            working_dir,
            manager_home: resolve(parsed.manager_home),
            catalog: resolve(parsed.catalog),
            players_dir: resolve(parsed.players_dir),
            bootstrap_script: resolve(parsed.bootstrap_script),
            backend: parsed.backend,
            logging: parsed.logging,
            base_dir: base_dir.to_path_buf(),
        })
    }

    /// `<working_dir>/batches`, the parent of every batch directory.
    pub fn batches_root(&self) -> PathBuf {
        self.working_dir.join("batches")
    }

    pub fn batches_data_dir(&self) -> PathBuf {
        self.batches_root().join(&self.name)
    }
}

fn default_working_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) if !home.is_empty() => PathBuf::from(home).join(DEFAULT_WORKING_DIR_NAME),
        _ => std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(DEFAULT_WORKING_DIR_NAME),
    }
}

fn validate_required_fields(value: &Value) -> Result<()> {
    let mut missing = Vec::new();
    for pointer in REQUIRED_FIELDS {
        let is_missing = match value.pointer(pointer) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.trim().is_empty(),
            Some(Value::Array(a)) => a.is_empty(),
            _ => false,
        };
        if is_missing {
            missing.push(*pointer);
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::config(format!(
            "missing required fields: {}",
            missing.join(", ")
        )))
    }
}

/// Explicit seeds win; a count draws that many distinct seeds from a generator
/// keyed by the benchmark name, so the same config always plans the same seeds.
fn select_seeds(name: &str, explicit: Option<Vec<u64>>, count: Option<usize>) -> Result<Vec<u64>> {
    match (explicit, count) {
        (Some(_), Some(_)) => Err(Error::config(
            "random_states and n_random_states are mutually exclusive",
        )),
        (Some(seeds), None) => {
            if seeds.is_empty() {
                return Err(Error::config("random_states is empty"));
            }
            let mut seen = BTreeSet::new();
            for seed in &seeds {
                if !seen.insert(*seed) {
                    return Err(Error::config(format!("duplicate random state: {}", seed)));
                }
            }
            Ok(seeds)
        }
        (None, Some(n)) => {
            if n == 0 || n as u64 > SEED_UPPER_BOUND {
                return Err(Error::config(format!(
                    "n_random_states must be between 1 and {}",
                    SEED_UPPER_BOUND
                )));
            }
            Ok(random_seeds(name, n))
        }
        (None, None) => Ok(vec![DEFAULT_SEED]),
    }
}

pub fn random_seeds(name: &str, n: usize) -> Vec<u64> {
    let mut rng = StdRng::from_seed(sha256_bytes(name.as_bytes()));
    let mut seen = BTreeSet::new();
    let mut seeds = Vec::with_capacity(n);
    while seeds.len() < n {
        let seed = rng.gen_range(0..SEED_UPPER_BOUND);
        if seen.insert(seed) {
            seeds.push(seed);
        }
    }
    seeds
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{TaskFilter, TaskKind};

    const MINIMAL: &str = "name: bench\nplayers: [plain_player]\ntasks:\n  ids: [694826]\nbackend:\n  kind: local\n";

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = BenchmarkConfig::from_yaml_str(MINIMAL, Path::new("/cfg")).expect("config");
        assert_eq!(cfg.name, "bench");
        assert_eq!(cfg.seeds, vec![DEFAULT_SEED]);
        assert_eq!(cfg.constraints, Constraints::default());
        assert_eq!(cfg.backend, Backend::Local);
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(
            cfg.tasks,
            TaskSelection::Ids {
                ids: vec!["694826".to_string()]
            }
        );
        assert!(cfg.working_dir.ends_with(DEFAULT_WORKING_DIR_NAME));
    }

    #[test]
    fn tasks_with_ids_and_filter_is_rejected() {
        let yaml = "name: bench\nplayers: [plain_player]\ntasks:\n  ids: [694826]\n  filter:\n    data_sizes: [large]\nbackend:\n  kind: local\n";
        let err = BenchmarkConfig::from_yaml_str(yaml, Path::new("/cfg")).expect_err("must fail");
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("not both"), "{}", err);
    }

    #[test]
    fn all_missing_fields_are_reported_together() {
        let err = BenchmarkConfig::from_yaml_str("desc: nothing\nplayers: []\n", Path::new("/cfg"))
            .expect_err("must fail");
        let msg = err.to_string();
        for field in REQUIRED_FIELDS {
            assert!(msg.contains(field), "{} not in {}", field, msg);
        }
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn full_config_resolves_relative_paths() {
        let yaml = r#"
name: bench
desc: nightly
players: [plain_player, ./mine/arima]
tasks:
  filter:
    task_kinds: [univariate-forecast]
    data_sizes: [small]
random_states: [8086, 8087]
constraints:
  max_trials: 10
  reward_metric: null
working_dir: ./data
manager_home: /opt/miniconda3
catalog: catalog.jsonl
players_dir: players
bootstrap_script: scripts/runpy.sh
backend:
  kind: remote
  machines:
    - hostname: 10.0.0.2
      username: tsb
      ssh_rsa_file: ~/.ssh/id_rsa
logging:
  level: debug
"#;
        let cfg = BenchmarkConfig::from_yaml_str(yaml, Path::new("/cfg")).expect("config");
        assert_eq!(cfg.seeds, vec![8086, 8087]);
        assert_eq!(cfg.constraints.max_trials, Some(10));
        assert_eq!(cfg.constraints.reward_metric, None);
        assert_eq!(cfg.working_dir, PathBuf::from("/cfg/data"));
        assert_eq!(cfg.batches_data_dir(), PathBuf::from("/cfg/data/batches/bench"));
        assert_eq!(cfg.manager_home, Some(PathBuf::from("/opt/miniconda3")));
        assert_eq!(cfg.catalog, Some(PathBuf::from("/cfg/catalog.jsonl")));
        assert_eq!(cfg.players_dir, Some(PathBuf::from("/cfg/players")));
        assert_eq!(cfg.bootstrap_script, Some(PathBuf::from("/cfg/scripts/runpy.sh")));
        assert_eq!(cfg.logging.level, "debug");
        match &cfg.backend {
            Backend::Remote { machines } => {
                assert_eq!(machines[0].port, 22);
                assert_eq!(machines[0].hostname, "10.0.0.2");
            }
            other => panic!("expected remote backend, got {:?}", other),
        }
        assert_eq!(
            cfg.tasks,
            TaskSelection::Filter {
                filter: TaskFilter {
                    task_kinds: vec![TaskKind::UnivariateForecast],
                    data_sizes: vec![crate::tasks::DataSize::Small],
                    ids: vec![],
                }
            }
        );
    }

    #[test]
    fn unknown_backend_is_configuration_error() {
        let yaml = MINIMAL.replace("kind: local", "kind: k8s");
        let err = BenchmarkConfig::from_yaml_str(&yaml, Path::new("/cfg")).expect_err("must fail");
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn seed_sources_are_exclusive_and_unique() {
        let both = format!("{}random_states: [1]\nn_random_states: 2\n", MINIMAL);
        assert!(BenchmarkConfig::from_yaml_str(&both, Path::new("/cfg")).is_err());
        let dup = format!("{}random_states: [1, 1]\n", MINIMAL);
        let err = BenchmarkConfig::from_yaml_str(&dup, Path::new("/cfg")).expect_err("dup");
        assert!(err.to_string().contains("duplicate random state"));
        let zero = format!("{}n_random_states: 0\n", MINIMAL);
        assert!(BenchmarkConfig::from_yaml_str(&zero, Path::new("/cfg")).is_err());
    }

    #[test]
    fn random_seed_count_is_reproducible() {
        let yaml = format!("{}n_random_states: 5\n", MINIMAL);
        let a = BenchmarkConfig::from_yaml_str(&yaml, Path::new("/cfg")).expect("a");
        let b = BenchmarkConfig::from_yaml_str(&yaml, Path::new("/cfg")).expect("b");
        assert_eq!(a.seeds.len(), 5);
        assert_eq!(a.seeds, b.seeds);
        let unique: BTreeSet<_> = a.seeds.iter().collect();
        assert_eq!(unique.len(), 5);
        assert!(a.seeds.iter().all(|s| *s < SEED_UPPER_BOUND));
        assert_ne!(random_seeds("bench", 5), random_seeds("other", 5));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let yaml = format!("{}conda_home: /opt/conda\n", MINIMAL);
        let err = BenchmarkConfig::from_yaml_str(&yaml, Path::new("/cfg")).expect_err("must fail");
        assert!(err.to_string().contains("conda_home"), "{}", err);
    }
}
