//! Deploy errors and the stage they happened in

use crate::app::AppError;
use crate::builders::BuildError;
use crate::git::VcsError;
use crate::lock::LockError;
use crate::procfile::ProcfileError;
use crate::proxy::ProxyConfigError;
use crate::settings::SettingsError;
use crate::supervisor::SupervisorConfigError;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Stage of the deploy pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployStage {
    Received,
    Building,
    Configuring,
    Activating,
    Running,
    Failed,
    Stopped,
}

impl fmt::Display for DeployStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeployStage::Received => "RECEIVED",
            DeployStage::Building => "BUILDING",
            DeployStage::Configuring => "CONFIGURING",
            DeployStage::Activating => "ACTIVATING",
            DeployStage::Running => "RUNNING",
            DeployStage::Failed => "FAILED",
            DeployStage::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

/// Machine-readable error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeployErrorCode {
    InvalidApp,
    ManifestParse,
    NoWorkers,
    NoBuilder,
    Build,
    HookFailed,
    ProxyConfig,
    SupervisorConfig,
    LockContention,
    SettingsFile,
    Vcs,
    Activation,
}

impl DeployErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployErrorCode::InvalidApp => "INVALID_APP",
            DeployErrorCode::ManifestParse => "MANIFEST_PARSE",
            DeployErrorCode::NoWorkers => "NO_WORKERS",
            DeployErrorCode::NoBuilder => "NO_BUILDER",
            DeployErrorCode::Build => "BUILD",
            DeployErrorCode::HookFailed => "HOOK_FAILED",
            DeployErrorCode::ProxyConfig => "PROXY_CONFIG",
            DeployErrorCode::SupervisorConfig => "SUPERVISOR_CONFIG",
            DeployErrorCode::LockContention => "LOCK_CONTENTION",
            DeployErrorCode::SettingsFile => "SETTINGS_FILE",
            DeployErrorCode::Vcs => "VCS",
            DeployErrorCode::Activation => "ACTIVATION",
        }
    }
}

/// Why a deploy failed
#[derive(Debug, Error)]
pub enum DeployErrorKind {
    #[error(transparent)]
    App(#[from] AppError),

    #[error("Procfile error: {0}")]
    Manifest(#[from] ProcfileError),

    #[error("no Procfile found in {0}")]
    MissingManifest(String),

    #[error("Procfile declares no workers")]
    NoWorkers,

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Proxy(#[from] ProxyConfigError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorConfigError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Vcs(#[from] VcsError),

    #[error("activation failed: {0}")]
    Activation(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DeployErrorKind {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        DeployErrorKind::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A failed deploy: the stage it failed in and the underlying diagnostic
#[derive(Debug, Error)]
#[error("deploy of '{app}' failed during {stage}: {kind}")]
pub struct DeployError {
    pub app: String,
    pub stage: DeployStage,
    #[source]
    pub kind: DeployErrorKind,
}

impl DeployError {
    pub fn new(app: impl Into<String>, stage: DeployStage, kind: impl Into<DeployErrorKind>) -> Self {
        Self {
            app: app.into(),
            stage,
            kind: kind.into(),
        }
    }

    pub fn code(&self) -> DeployErrorCode {
        match &self.kind {
            DeployErrorKind::App(_) => DeployErrorCode::InvalidApp,
            DeployErrorKind::Manifest(_) | DeployErrorKind::MissingManifest(_) => {
                DeployErrorCode::ManifestParse
            }
            DeployErrorKind::NoWorkers => DeployErrorCode::NoWorkers,
            DeployErrorKind::Build(BuildError::NoBuilder) => DeployErrorCode::NoBuilder,
            DeployErrorKind::Build(BuildError::Hook { .. }) => DeployErrorCode::HookFailed,
            DeployErrorKind::Build(_) => DeployErrorCode::Build,
            DeployErrorKind::Proxy(_) => DeployErrorCode::ProxyConfig,
            DeployErrorKind::Supervisor(_) => DeployErrorCode::SupervisorConfig,
            DeployErrorKind::Lock(LockError::Contention { .. }) => DeployErrorCode::LockContention,
            DeployErrorKind::Lock(_) => DeployErrorCode::Activation,
            DeployErrorKind::Settings(_) => DeployErrorCode::SettingsFile,
            DeployErrorKind::Vcs(_) => DeployErrorCode::Vcs,
            DeployErrorKind::Activation(_) | DeployErrorKind::Io { .. } => {
                DeployErrorCode::Activation
            }
        }
    }

    /// True when another deploy of the same app holds the lock
    pub fn is_lock_contention(&self) -> bool {
        self.code() == DeployErrorCode::LockContention
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_display() {
        assert_eq!(DeployStage::Building.to_string(), "BUILDING");
        assert_eq!(DeployStage::Failed.to_string(), "FAILED");
    }

    #[test]
    fn test_error_message_names_stage() {
        let err = DeployError::new("blog", DeployStage::Building, BuildError::NoBuilder);
        let message = err.to_string();
        assert!(message.contains("blog"));
        assert!(message.contains("BUILDING"));
        assert!(message.contains("no builder"));
        assert_eq!(err.code(), DeployErrorCode::NoBuilder);
    }

    #[test]
    fn test_lock_contention_code() {
        let err = DeployError::new(
            "blog",
            DeployStage::Received,
            LockError::Contention { app: "blog".into() },
        );
        assert!(err.is_lock_contention());
        assert_eq!(err.code().as_str(), "LOCK_CONTENTION");
    }

    #[test]
    fn test_code_serializes_screaming_snake_case() {
        let json = serde_json::to_string(&DeployErrorCode::SupervisorConfig).unwrap();
        assert_eq!(json, "\"SUPERVISOR_CONFIG\"");
        let json = serde_json::to_string(&DeployStage::Activating).unwrap();
        assert_eq!(json, "\"activating\"");
    }
}
