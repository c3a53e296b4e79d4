//! Turns work items into job submissions for the execution engine.
//!
//! Every command is the bootstrap script followed by environment flags and the
//! player's entry script. On the local backend paths point at the player's
//! own files; on the remote backend the bootstrap script and the player
//! directory are shipped as assets into `<job working dir>/resources/`.

use crate::env::{Environment, Requirements};
use crate::error::{Error, Result};
use crate::fsutil::{posix, shell_quote};
use crate::planner::WorkItem;
use crate::players::Player;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

pub const RESOURCES_DIR: &str = "resources";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub hostname: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_rsa_file: Option<PathBuf>,
}

fn default_ssh_port() -> u16 {
    22
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backend {
    Local,
    Remote { machines: Vec<Machine> },
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Local => "local",
            Backend::Remote { .. } => "remote",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Backend::Local => Ok(()),
            Backend::Remote { machines } if machines.is_empty() => Err(Error::config(
                "remote backend requires at least one machine",
            )),
            Backend::Remote { .. } => Ok(()),
        }
    }
}

/// Parameters attached to a job; the engine hands them back with every event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobParams {
    pub work_item_id: String,
    pub player: String,
    pub task_id: String,
    pub seed: Option<u64>,
    pub trial_budget: Option<u32>,
    pub reward_metric: Option<String>,
}

impl JobParams {
    pub fn for_item(item: &WorkItem) -> Self {
        Self {
            work_item_id: item.id(),
            player: item.player.name().to_string(),
            task_id: item.task.id().to_string(),
            seed: item.task.seed,
            trial_budget: item.task.max_trials,
            reward_metric: item.task.reward_metric.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSubmission {
    pub name: String,
    pub params: JobParams,
    pub command: String,
    pub working_dir: PathBuf,
    /// Local files the engine copies into `<working_dir>/resources/` before running.
    pub assets: Vec<PathBuf>,
}

/// Where the job sees the player's files.
enum PathLayout<'a> {
    Local,
    Remote { working_dir: &'a Path },
}

impl PathLayout<'_> {
    fn player_file(&self, player: &Player, rel: &Path) -> PathBuf {
        match self {
            PathLayout::Local => player.base_dir().join(rel),
            PathLayout::Remote { working_dir } => working_dir
                .join(RESOURCES_DIR)
                .join(player.name())
                .join(rel),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandSynthesizer {
    bootstrap_script: PathBuf,
    manager_home: Option<PathBuf>,
    batch_data_dir: PathBuf,
}

impl CommandSynthesizer {
    pub fn new(
        bootstrap_script: impl Into<PathBuf>,
        manager_home: Option<PathBuf>,
        batch_data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            bootstrap_script: bootstrap_script.into(),
            manager_home,
            batch_data_dir: batch_data_dir.into(),
        }
    }

    pub fn batch_data_dir(&self) -> &Path {
        &self.batch_data_dir
    }

    /// Fails when any player needs a managed environment but no manager home is set.
    pub fn check_players(&self, players: &[Arc<Player>]) -> Result<()> {
        if self.manager_home.is_none() {
            if let Some(p) = players.iter().find(|p| p.env.is_managed()) {
                return Err(Error::config(format!(
                    "'manager_home' can not be empty because player '{}' uses a managed virtual env",
                    p.name()
                )));
            }
        }
        Ok(())
    }

    pub fn synthesize(&self, item: &WorkItem, backend: &Backend) -> Result<JobSubmission> {
        let name = item.id();
        let working_dir = self.batch_data_dir.join(&name);
        let player = &item.player;
        let layout = match backend {
            Backend::Local => PathLayout::Local,
            Backend::Remote { .. } => PathLayout::Remote {
                working_dir: &working_dir,
            },
        };

        let mut parts = self.bootstrap_prefix(backend);
        parts.extend(self.env_flags(player, &layout)?);
        parts.push(format!(
            "--entry-script={}",
            posix(&layout.player_file(player, &player.exec_file))
        ));
        let command = shell_join(&parts);
        info!("command of job {} is {}", name, command);

        let assets = match backend {
            Backend::Local => Vec::new(),
            Backend::Remote { .. } => vec![
                self.bootstrap_script.clone(),
                player.base_dir().to_path_buf(),
            ],
        };

        Ok(JobSubmission {
            params: JobParams::for_item(item),
            name,
            command,
            working_dir,
            assets,
        })
    }

    fn bootstrap_prefix(&self, backend: &Backend) -> Vec<String> {
        let script = match backend {
            Backend::Local => posix(&self.bootstrap_script),
            Backend::Remote { .. } => {
                let file_name = self
                    .bootstrap_script
                    .file_name()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_default();
                format!("{}/{}", RESOURCES_DIR, file_name)
            }
        };
        vec!["/bin/bash".to_string(), "-x".to_string(), script]
    }

    fn env_flags(&self, player: &Player, layout: &PathLayout<'_>) -> Result<Vec<String>> {
        let venv_kind = format!("--venv-kind={}", player.env.venv_kind());
        match &player.env {
            Environment::Existing { executable } => Ok(vec![
                venv_kind,
                format!("--runtime-executable={}", posix(executable)),
            ]),
            Environment::Managed { name, requirements } => {
                let manager_home = self.manager_home.as_ref().ok_or_else(|| {
                    Error::config(format!(
                        "player '{}' uses a managed virtual env but 'manager_home' is not set",
                        player.name()
                    ))
                })?;
                let mut flags = vec![
                    venv_kind,
                    format!("--manager-home={}", posix(manager_home)),
                    format!("--env-name={}", name),
                    format!("--requirements-kind={}", requirements.kind()),
                ];
                let file = posix(&layout.player_file(player, requirements.file()));
                match requirements {
                    Requirements::Plain {
                        runtime_version, ..
                    } => {
                        flags.push(format!("--requirements-file={}", file));
                        flags.push(format!("--target-runtime-version={}", runtime_version));
                    }
                    Requirements::Manifest { .. } => {
                        flags.push(format!("--manifest-file={}", file));
                    }
                }
                Ok(flags)
            }
        }
    }
}

fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::{plan, Constraints};
    use crate::players::existing_player;
    use crate::tasks::{sample_config, TaskKind};

    fn item_for(player: Player) -> WorkItem {
        let tasks = vec![Arc::new(sample_config("694826", TaskKind::UnivariateForecast))];
        plan(&tasks, &[Arc::new(player)], &[8086], &Constraints::default())
            .pop()
            .expect("one item")
    }

    fn managed_player(requirements: Requirements) -> Player {
        Player::new(
            "/players/prophet",
            "exec.py",
            Environment::Managed {
                name: "tsb_prophet".to_string(),
                requirements,
            },
        )
    }

    fn synth(manager_home: Option<&str>) -> CommandSynthesizer {
        CommandSynthesizer::new(
            "/opt/tsb/runpy.sh",
            manager_home.map(PathBuf::from),
            "/data/batches/bench",
        )
    }

    fn remote() -> Backend {
        Backend::Remote {
            machines: vec![Machine {
                hostname: "10.0.0.2".to_string(),
                port: 22,
                username: "tsb".to_string(),
                password: None,
                ssh_rsa_file: None,
            }],
        }
    }

    #[test]
    fn existing_runtime_local() {
        let item = item_for(existing_player("/players/plain_player"));
        let job = synth(None).synthesize(&item, &Backend::Local).expect("job");
        assert_eq!(job.name, "plain_player_694826_8086");
        assert_eq!(
            job.command,
            "/bin/bash -x /opt/tsb/runpy.sh --venv-kind=custom \
             --runtime-executable=/usr/bin/python3 \
             --entry-script=/players/plain_player/exec.py"
        );
        assert_eq!(
            job.working_dir,
            PathBuf::from("/data/batches/bench/plain_player_694826_8086")
        );
        assert!(job.assets.is_empty());
        assert_eq!(job.params.seed, Some(8086));
        assert_eq!(job.params.player, "plain_player");
        assert_eq!(job.params.task_id, "694826");
    }

    #[test]
    fn existing_runtime_remote_ships_player_dir() {
        let item = item_for(existing_player("/players/plain_player"));
        let job = synth(None).synthesize(&item, &remote()).expect("job");
        assert_eq!(
            job.command,
            "/bin/bash -x resources/runpy.sh --venv-kind=custom \
             --runtime-executable=/usr/bin/python3 \
             --entry-script=/data/batches/bench/plain_player_694826_8086/resources/plain_player/exec.py"
        );
        assert_eq!(
            job.assets,
            vec![
                PathBuf::from("/opt/tsb/runpy.sh"),
                PathBuf::from("/players/plain_player")
            ]
        );
    }

    #[test]
    fn plain_requirements_local_and_remote_share_flags() {
        let item = item_for(managed_player(Requirements::Plain {
            file: PathBuf::from("requirements.txt"),
            runtime_version: "3.8".to_string(),
        }));
        let s = synth(Some("/opt/miniconda3"));
        let local = s.synthesize(&item, &Backend::Local).expect("local");
        let remote = s.synthesize(&item, &remote()).expect("remote");
        assert_eq!(
            local.command,
            "/bin/bash -x /opt/tsb/runpy.sh --venv-kind=managed --manager-home=/opt/miniconda3 \
             --env-name=tsb_prophet --requirements-kind=plain \
             --requirements-file=/players/prophet/requirements.txt \
             --target-runtime-version=3.8 --entry-script=/players/prophet/exec.py"
        );
        let wd = "/data/batches/bench/prophet_694826_8086/resources/prophet";
        assert!(remote
            .command
            .contains(&format!("--requirements-file={}/requirements.txt", wd)));
        assert!(remote.command.contains(&format!("--entry-script={}/exec.py", wd)));
        for flag in ["--venv-kind=managed", "--requirements-kind=plain", "--target-runtime-version=3.8"] {
            assert!(local.command.contains(flag), "{}", flag);
            assert!(remote.command.contains(flag), "{}", flag);
        }
        assert!(!remote.command.contains("/players/prophet"));
    }

    #[test]
    fn manifest_requirements_have_no_runtime_version() {
        let item = item_for(managed_player(Requirements::Manifest {
            file: PathBuf::from("env.yaml"),
        }));
        let job = synth(Some("/opt/miniconda3"))
            .synthesize(&item, &Backend::Local)
            .expect("job");
        assert!(job.command.contains("--requirements-kind=manifest"));
        assert!(job.command.contains("--manifest-file=/players/prophet/env.yaml"));
        assert!(!job.command.contains("--target-runtime-version"));
        assert!(!job.command.contains("--requirements-file"));
    }

    #[test]
    fn manifest_requirements_remote_point_into_resources() {
        let item = item_for(managed_player(Requirements::Manifest {
            file: PathBuf::from("env.yaml"),
        }));
        let job = synth(Some("/opt/miniconda3"))
            .synthesize(&item, &remote())
            .expect("job");
        let wd = "/data/batches/bench/prophet_694826_8086/resources/prophet";
        assert!(job.command.starts_with("/bin/bash -x resources/runpy.sh "));
        assert!(job.command.contains("--requirements-kind=manifest"));
        assert!(job.command.contains(&format!("--manifest-file={}/env.yaml", wd)));
        assert!(job.command.contains(&format!("--entry-script={}/exec.py", wd)));
        assert!(!job.command.contains("--target-runtime-version"));
        assert!(!job.command.contains("/players/prophet"));
        assert_eq!(
            job.assets,
            vec![
                PathBuf::from("/opt/tsb/runpy.sh"),
                PathBuf::from("/players/prophet")
            ]
        );
    }

    #[test]
    fn managed_without_manager_home_fails() {
        let player = Arc::new(managed_player(Requirements::Manifest {
            file: PathBuf::from("env.yaml"),
        }));
        let s = synth(None);
        let err = s.check_players(&[player.clone()]).expect_err("must fail");
        assert!(matches!(err, Error::Configuration(_)));
        assert!(s
            .check_players(&[Arc::new(existing_player("/p/custom"))])
            .is_ok());

        let item = item_for((*player).clone());
        assert!(matches!(
            s.synthesize(&item, &Backend::Local),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn paths_with_spaces_are_quoted() {
        let mut player = existing_player("/players/my player");
        player.env = Environment::Existing {
            executable: PathBuf::from("/opt/py 3/bin/python"),
        };
        let job = synth(None)
            .synthesize(&item_for(player), &Backend::Local)
            .expect("job");
        assert!(job
            .command
            .contains("'--runtime-executable=/opt/py 3/bin/python'"));
        assert!(job
            .command
            .contains("'--entry-script=/players/my player/exec.py'"));
    }

    #[test]
    fn remote_backend_needs_machines() {
        let err = Backend::Remote { machines: vec![] }
            .validate()
            .expect_err("must fail");
        assert!(matches!(err, Error::Configuration(_)));
        assert!(remote().validate().is_ok());
    }

    #[test]
    fn unknown_backend_kind_does_not_parse() {
        let parsed: std::result::Result<Backend, _> = serde_yaml::from_str("kind: k8s\n");
        assert!(parsed.is_err());
        let local: Backend = serde_yaml::from_str("kind: local\n").expect("local");
        assert_eq!(local, Backend::Local);
    }
}
