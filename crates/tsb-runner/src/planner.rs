//! Expansion of task configurations, players and seeds into work items.

use crate::command::JobSubmission;
use crate::players::Player;
use crate::tasks::{Task, TaskConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Run parameters applied to every task. `None` propagates as "unset".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraints {
    #[serde(default)]
    pub max_trials: Option<u32>,
    #[serde(default)]
    pub reward_metric: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    #[default]
    Pending,
    Running,
    Succeed,
    Failed,
}

impl WorkItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeed | Self::Failed)
    }
}

impl fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeed => "succeed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One schedulable unit: a task instance paired with a player.
#[derive(Debug)]
pub struct WorkItem {
    pub task: Task,
    pub player: Arc<Player>,
    status: Mutex<WorkItemStatus>,
}

impl WorkItem {
    pub fn new(task: Task, player: Arc<Player>) -> Self {
        Self {
            task,
            player,
            status: Mutex::new(WorkItemStatus::Pending),
        }
    }

    /// `{player}_{task}_{seed}`; a missing seed renders as `none`.
    pub fn id(&self) -> String {
        work_item_id(self.player.name(), self.task.id(), self.task.seed)
    }

    pub fn seed(&self) -> Option<u64> {
        self.task.seed
    }

    pub fn status(&self) -> WorkItemStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_status(&self, status: WorkItemStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    pub fn matches(&self, player: &str, seed: Option<u64>, task_id: &str) -> bool {
        self.player.name() == player && self.task.seed == seed && self.task.id() == task_id
    }
}

pub fn work_item_id(player: &str, task_id: &str, seed: Option<u64>) -> String {
    match seed {
        Some(seed) => format!("{}_{}_{}", player, task_id, seed),
        None => format!("{}_{}_none", player, task_id),
    }
}

/// Enumerates task configs (outer), players (middle) and seeds (inner).
///
/// Players restricted to other task kinds are skipped. Seedless players get
/// exactly one item per task config with `seed = None`.
///
/// # Panics
///
/// Panics if two items share an identity, which can only happen when the
/// caller passes duplicate players, task configs or seeds.
pub fn plan(
    task_configs: &[Arc<TaskConfig>],
    players: &[Arc<Player>],
    seeds: &[u64],
    constraints: &Constraints,
) -> Vec<WorkItem> {
    let mut items = Vec::new();
    let mut seen = BTreeSet::new();
    for config in task_configs {
        for player in players {
            if !player.supports(config.task) {
                debug!(
                    "skip {} for {} because of not supported this task type",
                    config.id,
                    player.name()
                );
                continue;
            }
            let player_seeds: Vec<Option<u64>> = if player.random {
                seeds.iter().copied().map(Some).collect()
            } else {
                vec![None]
            };
            for seed in player_seeds {
                let task = Task::new(
                    Arc::clone(config),
                    seed,
                    constraints.max_trials,
                    constraints.reward_metric.clone(),
                );
                let item = WorkItem::new(task, Arc::clone(player));
                let id = item.id();
                assert!(seen.insert(id.clone()), "duplicate work item id: {}", id);
                items.push(item);
            }
        }
    }
    items
}

/// The ordered work items of one benchmark run plus their job submissions.
#[derive(Debug)]
pub struct Plan {
    pub name: String,
    pub desc: String,
    items: Vec<WorkItem>,
    jobs: Vec<JobSubmission>,
}

impl Plan {
    pub fn new(
        name: impl Into<String>,
        desc: impl Into<String>,
        items: Vec<WorkItem>,
        jobs: Vec<JobSubmission>,
    ) -> Self {
        Self {
            name: name.into(),
            desc: desc.into(),
            items,
            jobs,
        }
    }

    pub fn items(&self) -> &[WorkItem] {
        &self.items
    }

    pub fn jobs(&self) -> &[JobSubmission] {
        &self.jobs
    }

    pub fn get(&self, work_item_id: &str) -> Option<&WorkItem> {
        self.items.iter().find(|item| item.id() == work_item_id)
    }

    pub fn find(&self, player: &str, seed: Option<u64>, task_id: &str) -> Option<&WorkItem> {
        self.items
            .iter()
            .find(|item| item.matches(player, seed, task_id))
    }

    pub fn is_finished(&self) -> bool {
        self.items.iter().all(|item| item.status().is_terminal())
    }
}
