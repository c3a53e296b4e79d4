//! Execution engine seam and the batch-directory hand-off engine.
//!
//! The batch-directory engine does not run anything itself. It writes the
//! batch description and a run-control file that an external scheduler
//! watches, stages the job assets, and reads the scheduler's event log back.

use crate::command::{Backend, JobSubmission, RESOURCES_DIR};
use crate::error::{Error, Result};
use crate::fsutil::{atomic_write_json_pretty, ensure_dir, read_to_string, sha256_hex};
use crate::lifecycle::{DispatchOutcome, JobEvent, LifecycleBridge};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const BATCH_FILE: &str = "batch.json";
pub const RUN_CONTROL_FILE: &str = "run_control.json";

const STAGING_EXCLUDES: &[&str] = &[".git", "__pycache__", ".ipynb_checkpoints"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchHandle {
    pub name: String,
    pub dir: PathBuf,
    /// True when the batch already existed with the same jobs.
    pub resumed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Submitted,
    Running,
    Stopped,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Submitted => "submitted",
            BatchStatus::Running => "running",
            BatchStatus::Stopped => "stopped",
        }
    }
}

/// Runs job submissions somewhere and reports back through a [`LifecycleBridge`].
pub trait ExecutionEngine {
    fn submit_batch(&self, name: &str, jobs: &[JobSubmission]) -> Result<BatchHandle>;
    fn start(&self, batch: &BatchHandle) -> Result<()>;
    fn stop(&self, batch: &BatchHandle) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct BatchDirEngine {
    /// Parent of all batch directories, i.e. `<working_dir>/batches`.
    root: PathBuf,
    backend: Backend,
}

impl BatchDirEngine {
    pub fn new(root: impl Into<PathBuf>, backend: Backend) -> Self {
        Self {
            root: root.into(),
            backend,
        }
    }

    pub fn batch_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Handle for a batch submitted earlier, e.g. by another process.
    pub fn open(&self, name: &str) -> Result<BatchHandle> {
        let dir = self.batch_dir(name);
        if !dir.join(BATCH_FILE).is_file() {
            return Err(Error::config(format!(
                "batch {} has not been submitted (no {} in {})",
                name,
                BATCH_FILE,
                dir.display()
            )));
        }
        Ok(BatchHandle {
            name: name.to_string(),
            dir,
            resumed: true,
        })
    }

    pub fn status(&self, batch: &BatchHandle) -> Result<Option<BatchStatus>> {
        let path = batch.dir.join(RUN_CONTROL_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        let value: Value = serde_json::from_str(&read_to_string(&path)?)?;
        let status = value
            .pointer("/status")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?;
        Ok(status)
    }

    fn write_run_control(&self, batch: &BatchHandle, status: BatchStatus) -> Result<()> {
        let payload = json!({
            "schema_version": "run_control_v1",
            "batch": batch.name,
            "status": status.as_str(),
            "updated_at": Utc::now().to_rfc3339(),
        });
        atomic_write_json_pretty(&batch.dir.join(RUN_CONTROL_FILE), &payload)
    }

    fn existing_jobs(path: &Path) -> Result<(BTreeSet<String>, Option<String>)> {
        let value: Value = serde_json::from_str(&read_to_string(path)?)?;
        let fingerprint = value
            .pointer("/fingerprint")
            .and_then(Value::as_str)
            .map(str::to_string);
        let names = value
            .pointer("/jobs")
            .and_then(Value::as_array)
            .map(|jobs| {
                jobs.iter()
                    .filter_map(|j| j.pointer("/name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok((names, fingerprint))
    }
}

impl ExecutionEngine for BatchDirEngine {
    fn submit_batch(&self, name: &str, jobs: &[JobSubmission]) -> Result<BatchHandle> {
        let dir = self.batch_dir(name);
        let batch_file = dir.join(BATCH_FILE);
        let names: BTreeSet<String> = jobs.iter().map(|j| j.name.clone()).collect();
        let fingerprint = jobs_fingerprint(jobs);

        if batch_file.is_file() {
            let (existing, previous) = Self::existing_jobs(&batch_file)?;
            if existing != names {
                return Err(Error::config(format!(
                    "batch {} already exists with a different job set; pick another benchmark name",
                    name
                )));
            }
            if previous.as_deref() != Some(fingerprint.as_str()) {
                warn!("commands of batch {} changed since it was submitted", name);
            }
            info!("batch {} already submitted, resuming it", name);
            return Ok(BatchHandle {
                name: name.to_string(),
                dir,
                resumed: true,
            });
        }

        ensure_dir(&dir)?;
        for job in jobs {
            ensure_dir(&job.working_dir)?;
            stage_assets(&job.assets, &job.working_dir.join(RESOURCES_DIR))?;
        }
        let machines = match &self.backend {
            Backend::Local => Vec::new(),
            Backend::Remote { machines } => machines.clone(),
        };
        let batch = json!({
            "schema_version": "batch_v1",
            "name": name,
            "backend": self.backend.as_str(),
            "machines": machines,
            "jobs": jobs,
            "fingerprint": fingerprint,
            "created_at": Utc::now().to_rfc3339(),
        });
        atomic_write_json_pretty(&batch_file, &batch)?;
        let handle = BatchHandle {
            name: name.to_string(),
            dir,
            resumed: false,
        };
        self.write_run_control(&handle, BatchStatus::Submitted)?;
        info!(
            "submitted batch {} with {} jobs at {}",
            name,
            jobs.len(),
            handle.dir.display()
        );
        Ok(handle)
    }

    fn start(&self, batch: &BatchHandle) -> Result<()> {
        self.write_run_control(batch, BatchStatus::Running)?;
        info!("started batch {}", batch.name);
        Ok(())
    }

    fn stop(&self, batch: &BatchHandle) -> Result<()> {
        self.write_run_control(batch, BatchStatus::Stopped)?;
        info!("stopped batch {}", batch.name);
        Ok(())
    }
}

fn jobs_fingerprint(jobs: &[JobSubmission]) -> String {
    let mut lines: Vec<String> = jobs
        .iter()
        .map(|j| format!("{}\t{}", j.name, j.command))
        .collect();
    lines.sort();
    sha256_hex(lines.join("\n").as_bytes())
}

/// Copies files and directories into `dest`, keeping their leaf names.
fn stage_assets(assets: &[PathBuf], dest: &Path) -> Result<()> {
    for asset in assets {
        let Some(leaf) = asset.file_name() else {
            continue;
        };
        let target = dest.join(leaf);
        if asset.is_dir() {
            copy_dir_filtered(asset, &target, STAGING_EXCLUDES)?;
        } else if asset.is_file() {
            ensure_dir(dest)?;
            fs::copy(asset, &target).map_err(|e| Error::io(asset, e))?;
        } else {
            return Err(Error::config(format!(
                "job asset not found: {}",
                asset.display()
            )));
        }
        debug!("staged {} to {}", asset.display(), target.display());
    }
    Ok(())
}

fn copy_dir_filtered(src: &Path, dst: &Path, exclude: &[&str]) -> Result<()> {
    let walker = walkdir::WalkDir::new(src).into_iter().filter_entry(|e| {
        let rel = e.path().strip_prefix(src).unwrap_or(e.path());
        !exclude.iter().any(|ex| rel.starts_with(ex))
    });
    for entry in walker {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(src).to_path_buf();
            Error::io(path, e.into())
        })?;
        let Ok(rel) = entry.path().strip_prefix(src) else {
            continue;
        };
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            ensure_dir(&target)?;
        } else if entry.file_type().is_symlink() {
            if let Some(parent) = target.parent() {
                ensure_dir(parent)?;
            }
            match fs::canonicalize(entry.path()) {
                Ok(real) if real.is_dir() => copy_dir_filtered(&real, &target, exclude)?,
                Ok(real) if real.is_file() => {
                    fs::copy(&real, &target).map_err(|e| Error::io(&real, e))?;
                }
                Ok(_) => {}
                Err(_) => warn!("skip broken symlink {}", entry.path().display()),
            }
        } else {
            if let Some(parent) = target.parent() {
                ensure_dir(parent)?;
            }
            fs::copy(entry.path(), &target).map_err(|e| Error::io(entry.path(), e))?;
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
    pub dispatched: usize,
    pub dropped: usize,
    pub observer_failures: usize,
    pub malformed: usize,
}

/// Feeds a JSONL event log, one [`JobEvent`] per line, through the bridge.
/// Unparseable lines are skipped and counted.
pub fn replay_events(path: &Path, bridge: &LifecycleBridge) -> Result<ReplaySummary> {
    let data = read_to_string(path)?;
    let mut summary = ReplaySummary::default();
    for (idx, line) in data.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let event: JobEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(e) => {
                warn!("skip malformed event at {}:{}: {}", path.display(), idx + 1, e);
                summary.malformed += 1;
                continue;
            }
        };
        match bridge.dispatch(&event) {
            DispatchOutcome::Delivered { failures } => {
                summary.dispatched += 1;
                summary.observer_failures += failures;
            }
            DispatchOutcome::Dropped => summary.dropped += 1,
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandSynthesizer, Machine};
    use crate::fsutil::{atomic_write_bytes, scratch_dir};
    use crate::planner::{plan, Constraints, Plan, WorkItemStatus};
    use crate::players::existing_player;
    use crate::tasks::{sample_config, TaskKind};
    use std::sync::Arc;

    fn jobs_for(root: &Path, player_dir: &Path, backend: &Backend) -> Vec<JobSubmission> {
        let tasks = vec![Arc::new(sample_config("694826", TaskKind::UnivariateForecast))];
        let players = vec![Arc::new(existing_player(player_dir.to_str().expect("utf8")))];
        let items = plan(&tasks, &players, &[8086, 8087], &Constraints::default());
        let synth = CommandSynthesizer::new(root.join("runpy.sh"), None, root.join("batches").join("bench"));
        items
            .iter()
            .map(|i| synth.synthesize(i, backend).expect("job"))
            .collect()
    }

    fn fixture(tag: &str) -> (PathBuf, PathBuf) {
        let root = scratch_dir(tag);
        atomic_write_bytes(&root.join("runpy.sh"), b"#!/bin/bash\n").expect("script");
        let player_dir = root.join("players").join("plain_player");
        atomic_write_bytes(&player_dir.join("exec.py"), b"print(1)\n").expect("exec");
        atomic_write_bytes(&player_dir.join("__pycache__").join("x.pyc"), b"0").expect("pyc");
        (root, player_dir)
    }

    #[test]
    fn submit_writes_batch_and_run_control() {
        let (root, player_dir) = fixture("engine_submit");
        let jobs = jobs_for(&root, &player_dir, &Backend::Local);
        let engine = BatchDirEngine::new(root.join("batches"), Backend::Local);

        let handle = engine.submit_batch("bench", &jobs).expect("submit");
        assert!(!handle.resumed);
        let batch: Value =
            serde_json::from_str(&fs::read_to_string(handle.dir.join(BATCH_FILE)).expect("read"))
                .expect("json");
        assert_eq!(batch["backend"], "local");
        assert_eq!(batch["jobs"].as_array().expect("jobs").len(), 2);
        assert_eq!(batch["jobs"][0]["name"], "plain_player_694826_8086");
        assert_eq!(engine.status(&handle).expect("status"), Some(BatchStatus::Submitted));
        assert!(jobs[0].working_dir.is_dir());

        engine.start(&handle).expect("start");
        assert_eq!(engine.status(&handle).expect("status"), Some(BatchStatus::Running));
        engine.stop(&handle).expect("stop");
        assert_eq!(engine.status(&handle).expect("status"), Some(BatchStatus::Stopped));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn resubmitting_same_jobs_resumes_and_different_jobs_fail() {
        let (root, player_dir) = fixture("engine_resume");
        let jobs = jobs_for(&root, &player_dir, &Backend::Local);
        let engine = BatchDirEngine::new(root.join("batches"), Backend::Local);
        engine.submit_batch("bench", &jobs).expect("submit");

        let again = engine.submit_batch("bench", &jobs).expect("resubmit");
        assert!(again.resumed);

        let err = engine.submit_batch("bench", &jobs[..1]).expect_err("must fail");
        assert!(matches!(err, Error::Configuration(_)));

        assert!(engine.open("bench").expect("open").resumed);
        assert!(engine.open("other").is_err());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn remote_batch_stages_assets_and_records_machines() {
        let (root, player_dir) = fixture("engine_remote");
        let backend = Backend::Remote {
            machines: vec![Machine {
                hostname: "10.0.0.2".to_string(),
                port: 2222,
                username: "tsb".to_string(),
                password: None,
                ssh_rsa_file: None,
            }],
        };
        let jobs = jobs_for(&root, &player_dir, &backend);
        let engine = BatchDirEngine::new(root.join("batches"), backend);
        let handle = engine.submit_batch("bench", &jobs).expect("submit");

        let resources = jobs[0].working_dir.join(RESOURCES_DIR);
        assert!(resources.join("runpy.sh").is_file());
        assert!(resources.join("plain_player").join("exec.py").is_file());
        assert!(!resources.join("plain_player").join("__pycache__").exists());

        let batch: Value =
            serde_json::from_str(&fs::read_to_string(handle.dir.join(BATCH_FILE)).expect("read"))
                .expect("json");
        assert_eq!(batch["backend"], "remote");
        assert_eq!(batch["machines"][0]["port"], 2222);
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn staging_follows_symlinks_and_skips_broken_ones() {
        use std::os::unix::fs::symlink;

        let root = scratch_dir("engine_symlink");
        let shared = root.join("shared_models");
        atomic_write_bytes(&shared.join("weights.bin"), b"w").expect("weights");
        atomic_write_bytes(&root.join("common.py"), b"x = 1\n").expect("common");
        let player_dir = root.join("players").join("linked");
        atomic_write_bytes(&player_dir.join("exec.py"), b"print(1)\n").expect("exec");
        symlink(&shared, player_dir.join("models")).expect("dir link");
        symlink(root.join("common.py"), player_dir.join("common.py")).expect("file link");
        symlink(root.join("missing"), player_dir.join("dangling")).expect("broken link");

        let dest = root.join("resources");
        stage_assets(&[player_dir.clone()], &dest).expect("stage");
        let staged = dest.join("linked");
        assert!(staged.join("exec.py").is_file());
        assert!(staged.join("models").join("weights.bin").is_file());
        assert_eq!(
            fs::read_to_string(staged.join("common.py")).expect("read"),
            "x = 1\n"
        );
        assert!(!staged.join("dangling").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn replay_counts_dispatched_dropped_and_malformed() {
        let (root, player_dir) = fixture("engine_replay");
        let jobs = jobs_for(&root, &player_dir, &Backend::Local);
        let tasks = vec![Arc::new(sample_config("694826", TaskKind::UnivariateForecast))];
        let players = vec![Arc::new(existing_player(player_dir.to_str().expect("utf8")))];
        let items = plan(&tasks, &players, &[8086, 8087], &Constraints::default());
        let plan = Arc::new(Plan::new("bench", "", items, jobs.clone()));
        let bridge = LifecycleBridge::new(plan.clone());

        let mut log = String::new();
        for job in &jobs {
            let event = JobEvent::for_job(&job.name, job.params.clone(), crate::lifecycle::JobEventKind::Finish);
            log.push_str(&serde_json::to_string(&event).expect("event"));
            log.push('\n');
        }
        log.push_str("{not json\n");
        let mut ghost = jobs[0].params.clone();
        ghost.player = "ghost".to_string();
        let ghost = JobEvent::for_job("ghost", ghost, crate::lifecycle::JobEventKind::Start);
        log.push_str(&serde_json::to_string(&ghost).expect("ghost"));
        log.push('\n');
        log.push_str(&serde_json::to_string(&JobEvent::batch_finish()).expect("batch"));
        let path = root.join("events.jsonl");
        atomic_write_bytes(&path, log.as_bytes()).expect("write log");

        let summary = replay_events(&path, &bridge).expect("replay");
        assert_eq!(
            summary,
            ReplaySummary {
                dispatched: 3,
                dropped: 1,
                observer_failures: 0,
                malformed: 1,
            }
        );
        assert!(plan.items().iter().all(|i| i.status() == WorkItemStatus::Succeed));
        assert!(plan.is_finished());
        let _ = fs::remove_dir_all(root);
    }
}
