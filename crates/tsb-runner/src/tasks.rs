//! Task configurations, per-run task instances and the dataset catalog.

use crate::error::{Error, Result};
use crate::fsutil::read_to_string;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    UnivariateForecast,
    MultivariateForecast,
    UnivariateBinaryclass,
    UnivariateMulticlass,
    MultivariateBinaryclass,
    MultivariateMulticlass,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::UnivariateForecast => "univariate-forecast",
            TaskKind::MultivariateForecast => "multivariate-forecast",
            TaskKind::UnivariateBinaryclass => "univariate-binaryclass",
            TaskKind::UnivariateMulticlass => "univariate-multiclass",
            TaskKind::MultivariateBinaryclass => "multivariate-binaryclass",
            TaskKind::MultivariateMulticlass => "multivariate-multiclass",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| Error::config(format!("unknown task kind: {}", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSize {
    Small,
    Medium,
    Large,
}

impl DataSize {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSize::Small => "small",
            DataSize::Medium => "medium",
            DataSize::Large => "large",
        }
    }
}

impl FromStr for DataSize {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| Error::config(format!("unknown data size: {}", s)))
    }
}

/// Immutable description of one forecasting task, as stored in the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(deserialize_with = "string_or_number")]
    pub dataset_id: String,
    pub date_name: String,
    #[serde(default)]
    pub series_name: Vec<String>,
    #[serde(default)]
    pub covariables_name: Vec<String>,
    pub task: TaskKind,
    pub horizon: u32,
    pub data_size: DataSize,
    #[serde(default)]
    pub shape: Vec<usize>,
    #[serde(default = "default_dtformat")]
    pub dtformat: String,
}

fn default_dtformat() -> String {
    "%Y-%m-%d".to_string()
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, found {}",
            other
        ))),
    }
}

fn string_or_number_vec<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let values = Vec::<Value>::deserialize(deserializer)?;
    values
        .into_iter()
        .map(|v| match v {
            Value::String(s) => Ok(s),
            Value::Number(n) => Ok(n.to_string()),
            other => Err(serde::de::Error::custom(format!(
                "expected string or number id, found {}",
                other
            ))),
        })
        .collect()
}

fn opt_string_or_number_vec<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    string_or_number_vec(deserializer).map(Some)
}

/// Rows of one split, one JSON object per row.
pub type Partition = Vec<Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Test => "test",
        }
    }
}

/// Loads the rows of a task split. Called at most once per split per task.
pub trait PartitionSource {
    fn load(&self, config: &TaskConfig, split: Split) -> Result<Partition>;
}

/// Reads `<root>/<task id>/{train,test}.jsonl`.
pub struct JsonlPartitions {
    root: PathBuf,
}

impl JsonlPartitions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl PartitionSource for JsonlPartitions {
    fn load(&self, config: &TaskConfig, split: Split) -> Result<Partition> {
        let path = self
            .root
            .join(&config.id)
            .join(format!("{}.jsonl", split.as_str()));
        read_jsonl(&path)
    }
}

/// A task configuration bound to the parameters of one run.
#[derive(Debug)]
pub struct Task {
    config: Arc<TaskConfig>,
    pub seed: Option<u64>,
    pub max_trials: Option<u32>,
    pub reward_metric: Option<String>,
    pub created_at: DateTime<Utc>,
    train: OnceLock<Partition>,
    test: OnceLock<Partition>,
}

impl Task {
    pub fn new(
        config: Arc<TaskConfig>,
        seed: Option<u64>,
        max_trials: Option<u32>,
        reward_metric: Option<String>,
    ) -> Self {
        Self {
            config,
            seed,
            max_trials,
            reward_metric,
            created_at: Utc::now(),
            train: OnceLock::new(),
            test: OnceLock::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    pub fn kind(&self) -> TaskKind {
        self.config.task
    }

    pub fn train(&self, source: &dyn PartitionSource) -> Result<&Partition> {
        cached_partition(&self.train, &self.config, Split::Train, source)
    }

    pub fn test(&self, source: &dyn PartitionSource) -> Result<&Partition> {
        cached_partition(&self.test, &self.config, Split::Test, source)
    }
}

fn cached_partition<'a>(
    cell: &'a OnceLock<Partition>,
    config: &TaskConfig,
    split: Split,
    source: &dyn PartitionSource,
) -> Result<&'a Partition> {
    if let Some(rows) = cell.get() {
        return Ok(rows);
    }
    let rows = source.load(config, split)?;
    Ok(cell.get_or_init(|| rows))
}

/// Extracts a numeric column from partition rows; rows without a number are skipped.
pub fn column_values(rows: &[Value], column: &str) -> Vec<f64> {
    rows.iter()
        .filter_map(|row| row.get(column).and_then(Value::as_f64))
        .collect()
}

/// Conjunctive filter over the catalog. Empty components do not restrict.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskFilter {
    #[serde(default)]
    pub task_kinds: Vec<TaskKind>,
    #[serde(default)]
    pub data_sizes: Vec<DataSize>,
    #[serde(default, deserialize_with = "string_or_number_vec")]
    pub ids: Vec<String>,
}

impl TaskFilter {
    pub fn matches(&self, config: &TaskConfig) -> bool {
        (self.task_kinds.is_empty() || self.task_kinds.contains(&config.task))
            && (self.data_sizes.is_empty() || self.data_sizes.contains(&config.data_size))
            && (self.ids.is_empty() || self.ids.iter().any(|id| id == &config.id))
    }
}

/// Read side of the dataset catalog.
pub trait TaskCatalog {
    fn resolve(&self, task_id: &str) -> Result<Arc<TaskConfig>>;
    fn list(&self, filter: &TaskFilter) -> Vec<String>;
}

/// Catalog backed by a JSONL file, one task configuration per line.
#[derive(Debug, Clone, Default)]
pub struct JsonlCatalog {
    configs: Vec<Arc<TaskConfig>>,
}

impl JsonlCatalog {
    pub fn load(path: &Path) -> Result<Self> {
        let rows = read_jsonl(path)?;
        let mut configs = Vec::with_capacity(rows.len());
        for row in rows {
            let config: TaskConfig = serde_json::from_value(row)?;
            configs.push(config);
        }
        Self::from_configs(configs)
    }

    pub fn from_configs(configs: Vec<TaskConfig>) -> Result<Self> {
        let mut seen = BTreeSet::new();
        for c in &configs {
            if !seen.insert(c.id.clone()) {
                return Err(Error::config(format!("duplicate task id in catalog: {}", c.id)));
            }
        }
        Ok(Self {
            configs: configs.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}

impl TaskCatalog for JsonlCatalog {
    fn resolve(&self, task_id: &str) -> Result<Arc<TaskConfig>> {
        self.configs
            .iter()
            .find(|c| c.id == task_id)
            .cloned()
            .ok_or_else(|| Error::Resolution(task_id.to_string()))
    }

    fn list(&self, filter: &TaskFilter) -> Vec<String> {
        self.configs
            .iter()
            .filter(|c| filter.matches(c))
            .map(|c| c.id.clone())
            .collect()
    }
}

/// How a benchmark picks its tasks from the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged, try_from = "RawTaskSelection")]
pub enum TaskSelection {
    Ids { ids: Vec<String> },
    Filter { filter: TaskFilter },
}

/// Wire form of a selection; exactly one of the keys must be present.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTaskSelection {
    #[serde(default, deserialize_with = "opt_string_or_number_vec")]
    ids: Option<Vec<String>>,
    #[serde(default)]
    filter: Option<TaskFilter>,
}

impl TryFrom<RawTaskSelection> for TaskSelection {
    type Error = String;

    fn try_from(raw: RawTaskSelection) -> std::result::Result<Self, Self::Error> {
        match (raw.ids, raw.filter) {
            (Some(ids), None) => Ok(TaskSelection::Ids { ids }),
            (None, Some(filter)) => Ok(TaskSelection::Filter { filter }),
            (Some(_), Some(_)) => Err("tasks takes either 'ids' or 'filter', not both".to_string()),
            (None, None) => Err("tasks needs 'ids' or 'filter'".to_string()),
        }
    }
}

/// Resolves a selection into task configurations, in selection order.
pub fn select_task_configs(
    catalog: &dyn TaskCatalog,
    selection: &TaskSelection,
) -> Result<Vec<Arc<TaskConfig>>> {
    let ids = match selection {
        TaskSelection::Ids { ids } => ids.clone(),
        TaskSelection::Filter { filter } => catalog.list(filter),
    };
    if ids.is_empty() {
        return Err(Error::config("task selection is empty"));
    }
    let mut seen = BTreeSet::new();
    for id in &ids {
        if !seen.insert(id.as_str()) {
            return Err(Error::config(format!("duplicate task id in selection: {}", id)));
        }
    }
    ids.iter().map(|id| catalog.resolve(id)).collect()
}

fn read_jsonl(path: &Path) -> Result<Vec<Value>> {
    let data = read_to_string(path)?;
    let mut rows = Vec::new();
    for line in data.lines() {
        if line.trim().is_empty() {
            continue;
        }
        rows.push(serde_json::from_str(line)?);
    }
    Ok(rows)
}

#[cfg(test)]
pub(crate) fn sample_config(id: &str, kind: TaskKind) -> TaskConfig {
    TaskConfig {
        id: id.to_string(),
        dataset_id: format!("ds_{}", id),
        date_name: "date".to_string(),
        series_name: vec!["value".to_string()],
        covariables_name: vec![],
        task: kind,
        horizon: 7,
        data_size: DataSize::Small,
        shape: vec![120, 2],
        dtformat: default_dtformat(),
    }
}
