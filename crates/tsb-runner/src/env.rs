//! Runtime environment descriptors for players.
//!
//! A player either points at an interpreter that already exists on the
//! execution host, or asks for a managed (conda-style) environment built from
//! a requirements manifest. The requirements only exist on the managed arm.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Environment {
    /// Interpreter already installed on the execution host.
    Existing { executable: PathBuf },
    /// Environment created by the manager under `<manager_home>/envs/<name>`.
    Managed {
        name: String,
        requirements: Requirements,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Requirements {
    /// pip-style requirements list plus the interpreter version to create.
    Plain {
        file: PathBuf,
        runtime_version: String,
    },
    /// Self-describing environment manifest.
    Manifest { file: PathBuf },
}

impl Environment {
    pub fn venv_kind(&self) -> &'static str {
        match self {
            Environment::Existing { .. } => "custom",
            Environment::Managed { .. } => "managed",
        }
    }

    pub fn requirements(&self) -> Option<&Requirements> {
        match self {
            Environment::Existing { .. } => None,
            Environment::Managed { requirements, .. } => Some(requirements),
        }
    }

    pub fn is_managed(&self) -> bool {
        matches!(self, Environment::Managed { .. })
    }

    /// Files inside the player directory the environment depends on.
    pub fn manifest_file(&self) -> Option<&Path> {
        self.requirements().map(Requirements::file)
    }
}

impl Requirements {
    pub fn kind(&self) -> &'static str {
        match self {
            Requirements::Plain { .. } => "plain",
            Requirements::Manifest { .. } => "manifest",
        }
    }

    pub fn file(&self) -> &Path {
        match self {
            Requirements::Plain { file, .. } | Requirements::Manifest { file } => file,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct EnvironmentSpec {
    venv: KindSpec,
    #[serde(default)]
    requirements: Option<KindSpec>,
}

#[derive(Debug, Deserialize)]
struct KindSpec {
    kind: String,
    #[serde(default)]
    config: serde_json::Map<String, Value>,
}

impl KindSpec {
    fn required_str(&self, key: &str, owner: &str) -> Result<String> {
        self.config
            .get(key)
            .and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| Error::config(format!("{} '{}' requires config.{}", owner, self.kind, key)))
    }

    /// Like `required_str`, but a bare YAML number is refused: `3.10` would
    /// otherwise arrive as the float 3.1.
    fn required_version(&self, key: &str, owner: &str) -> Result<String> {
        if let Some(Value::Number(n)) = self.config.get(key) {
            return Err(Error::config(format!(
                "{} config.{} must be a quoted string such as \"3.10\", found number {}",
                owner, key, n
            )));
        }
        self.required_str(key, owner)
    }
}

impl EnvironmentSpec {
    /// Converts the loosely typed `env` block of a player manifest into a
    /// descriptor, rejecting unknown kinds and misplaced requirements.
    pub(crate) fn into_environment(self) -> Result<Environment> {
        match self.venv.kind.as_str() {
            "custom_python" | "custom" => {
                if self.requirements.is_some() {
                    return Err(Error::config(
                        "env.requirements is only valid for managed environments",
                    ));
                }
                let executable = self.venv.required_str("py_executable", "venv")?;
                Ok(Environment::Existing {
                    executable: PathBuf::from(executable),
                })
            }
            "conda" | "managed" => {
                let name = self.venv.required_str("name", "venv")?;
                let reqs = self.requirements.ok_or_else(|| {
                    Error::config(format!(
                        "managed environment '{}' is missing env.requirements",
                        name
                    ))
                })?;
                let requirements = match reqs.kind.as_str() {
                    "requirements_txt" | "plain" => Requirements::Plain {
                        file: PathBuf::from(reqs.required_str("file_name", "requirements")?),
                        runtime_version: reqs.required_version("py_version", "requirements")?,
                    },
                    "conda_yaml" | "manifest" => Requirements::Manifest {
                        file: PathBuf::from(reqs.required_str("file_name", "requirements")?),
                    },
                    other => {
                        return Err(Error::config(format!(
                            "unsupported requirements kind: {}",
                            other
                        )))
                    }
                };
                Ok(Environment::Managed { name, requirements })
            }
            other => Err(Error::config(format!("unsupported venv kind: {}", other))),
        }
    }
}
