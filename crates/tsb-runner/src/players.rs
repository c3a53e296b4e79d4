//! Player definitions and the registry that merges built-in players with
//! user-selected ones.
//!
//! A player lives in its own directory; the directory's leaf name is the
//! player's name and `player.yaml` inside it describes the entry point and the
//! runtime environment.

use crate::env::{Environment, EnvironmentSpec};
use crate::error::{Error, Result};
use crate::fsutil::{normalize_path, read_to_string, resolve_against};
use crate::tasks::TaskKind;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub const PLAYER_MANIFEST: &str = "player.yaml";
const DEFAULT_EXEC_FILE: &str = "exec.py";

#[derive(Debug, Clone, PartialEq)]
pub struct Player {
    base_dir: PathBuf,
    pub exec_file: PathBuf,
    pub env: Environment,
    /// Supported task kinds; `None` supports every kind.
    pub tasks: Option<BTreeSet<TaskKind>>,
    /// Seedless players run once per task with no seed.
    pub random: bool,
}

impl Player {
    pub fn new(base_dir: impl Into<PathBuf>, exec_file: impl Into<PathBuf>, env: Environment) -> Self {
        Self {
            base_dir: normalize_path(&base_dir.into()),
            exec_file: exec_file.into(),
            env,
            tasks: None,
            random: true,
        }
    }

    pub fn with_tasks(mut self, kinds: impl IntoIterator<Item = TaskKind>) -> Self {
        self.tasks = Some(kinds.into_iter().collect());
        self
    }

    pub fn seedless(mut self) -> Self {
        self.random = false;
        self
    }

    pub fn name(&self) -> &str {
        self.base_dir
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn exec_path(&self) -> PathBuf {
        self.base_dir.join(&self.exec_file)
    }

    pub fn supports(&self, kind: TaskKind) -> bool {
        self.tasks.as_ref().map_or(true, |kinds| kinds.contains(&kind))
    }
}

#[derive(Debug, Deserialize)]
struct PlayerManifest {
    #[serde(default)]
    exec_file: Option<String>,
    env: EnvironmentSpec,
    #[serde(default)]
    tasks: Option<Vec<TaskKind>>,
    #[serde(default = "default_random")]
    random: bool,
}

fn default_random() -> bool {
    true
}

/// Loads a player from `<dir>/player.yaml`.
pub fn load_player(dir: &Path) -> Result<Player> {
    let config_file = dir.join(PLAYER_MANIFEST);
    if !config_file.is_file() {
        return Err(Error::config(format!(
            "player manifest not found: {}",
            config_file.display()
        )));
    }
    let raw = read_to_string(&config_file)?;
    let manifest: PlayerManifest = serde_yaml::from_str(&raw).map_err(|e| {
        Error::config(format!("malformed player manifest {}: {}", config_file.display(), e))
    })?;
    let env = manifest.env.into_environment().map_err(|e| match e {
        Error::Configuration(msg) => {
            Error::config(format!("{} in {}", msg, config_file.display()))
        }
        other => other,
    })?;
    let base_dir = dir
        .canonicalize()
        .map_err(|e| Error::io(dir, e))?;
    let exec_file = manifest
        .exec_file
        .unwrap_or_else(|| DEFAULT_EXEC_FILE.to_string());
    let mut player = Player::new(base_dir, exec_file, env);
    if let Some(kinds) = manifest.tasks {
        player = player.with_tasks(kinds);
    }
    player.random = manifest.random;
    Ok(player)
}

fn put_player(players: &mut Vec<Arc<Player>>, player: Arc<Player>) -> Result<()> {
    if players.iter().any(|p| p.name() == player.name()) {
        return Err(Error::config(format!(
            "duplicate player name: {}",
            player.name()
        )));
    }
    players.push(player);
    Ok(())
}

/// Built-in players plus the logic for picking the players of one benchmark.
#[derive(Debug, Clone, Default)]
pub struct PlayerRegistry {
    builtins: Vec<Arc<Player>>,
}

impl PlayerRegistry {
    /// Loads every sub-directory of `dir` as a built-in player, in file-name order.
    pub fn load_builtins(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(Error::config(format!(
                "players dir not found: {}",
                dir.display()
            )));
        }
        debug!("default players dir is at {}", dir.display());
        let mut builtins = Vec::new();
        let walker = walkdir::WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name();
        for entry in walker {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(dir).to_path_buf();
                Error::io(path, e.into())
            })?;
            if !entry.file_type().is_dir() {
                continue;
            }
            debug!("detected player at {}", entry.path().display());
            put_player(&mut builtins, Arc::new(load_player(entry.path())?))?;
        }
        Ok(Self { builtins })
    }

    pub fn from_players(players: Vec<Player>) -> Result<Self> {
        let mut builtins = Vec::new();
        for p in players {
            put_player(&mut builtins, Arc::new(p))?;
        }
        Ok(Self { builtins })
    }

    pub fn builtins(&self) -> &[Arc<Player>] {
        &self.builtins
    }

    pub fn get(&self, name: &str) -> Option<Arc<Player>> {
        self.builtins.iter().find(|p| p.name() == name).cloned()
    }

    /// Resolves each entry as a built-in name, otherwise as a player directory
    /// relative to `base`. The selection keeps entry order.
    pub fn select(&self, entries: &[String], base: &Path) -> Result<Vec<Arc<Player>>> {
        if entries.is_empty() {
            return Err(Error::config("player selection is empty"));
        }
        let mut selected = Vec::new();
        for entry in entries {
            let player = match self.get(entry) {
                Some(builtin) => builtin,
                None => {
                    let dir = resolve_against(base, Path::new(entry));
                    info!("read player from dir {}", dir.display());
                    Arc::new(load_player(&dir)?)
                }
            };
            put_player(&mut selected, player)?;
        }
        Ok(selected)
    }
}

#[cfg(test)]
pub(crate) fn existing_player(base_dir: &str) -> Player {
    Player::new(
        base_dir,
        "exec.py",
        Environment::Existing {
            executable: PathBuf::from("/usr/bin/python3"),
        },
    )
}
