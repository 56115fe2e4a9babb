//! Backing services attached to apps (PostgreSQL, Redis, S3-compatible storage)
//!
//! Provisioning happens elsewhere; launchpad only records the connection URL
//! an operator attaches and exposes it to the app's environment. Each attached
//! addon is a settings file under `apps/<app>/addons/<kind>`.

use crate::app::App;
use crate::env::Env;
use crate::settings::{self, SettingsError};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum AddonError {
    #[error("unknown addon '{0}' (known: postgres, redis, storage)")]
    UnknownKind(String),

    #[error("invalid {kind} URL {url:?}: must be a single line")]
    InvalidUrl { kind: AddonType, url: String },

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error("addon I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Add-on types supported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddonType {
    Postgres,
    Redis,
    /// S3-compatible object storage
    Storage,
}

impl AddonType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddonType::Postgres => "postgres",
            AddonType::Redis => "redis",
            AddonType::Storage => "storage",
        }
    }

    /// Variables that receive the connection URL
    pub fn env_vars(&self) -> &'static [&'static str] {
        match self {
            AddonType::Postgres => &["DATABASE_URL"],
            AddonType::Redis => &["REDIS_URL"],
            AddonType::Storage => &["S3_ENDPOINT", "AWS_ENDPOINT_URL"],
        }
    }
}

impl fmt::Display for AddonType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AddonType {
    type Err = AddonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(AddonType::Postgres),
            "redis" => Ok(AddonType::Redis),
            "storage" | "s3" => Ok(AddonType::Storage),
            other => Err(AddonError::UnknownKind(other.to_string())),
        }
    }
}

/// The addon kinds this platform knows about, fixed at startup
#[derive(Debug, Clone)]
pub struct AddonRegistry {
    kinds: Vec<AddonType>,
}

impl Default for AddonRegistry {
    fn default() -> Self {
        Self::new(vec![AddonType::Postgres, AddonType::Redis, AddonType::Storage])
    }
}

impl AddonRegistry {
    pub fn new(kinds: Vec<AddonType>) -> Self {
        Self { kinds }
    }

    pub fn kinds(&self) -> &[AddonType] {
        &self.kinds
    }

    pub fn resolve(&self, name: &str) -> Result<AddonType, AddonError> {
        let kind: AddonType = name.parse()?;
        if self.kinds.contains(&kind) {
            Ok(kind)
        } else {
            Err(AddonError::UnknownKind(name.to_string()))
        }
    }

    /// Record `url` for addon `kind` of `app`, replacing any previous one
    pub fn attach(&self, app: &App, kind: &str, url: &str) -> Result<AddonType, AddonError> {
        let kind = self.resolve(kind)?;
        if url.contains(['\n', '\r']) {
            return Err(AddonError::InvalidUrl {
                kind,
                url: url.to_string(),
            });
        }
        let vars: Vec<(&str, &str)> = kind.env_vars().iter().map(|var| (*var, url)).collect();
        settings::write_settings(&app.addons_path().join(kind.as_str()), vars, '=')?;
        info!(app = %app.name(), addon = %kind, "Addon attached");
        Ok(kind)
    }

    /// Forget addon `kind`. Returns false if it was not attached.
    pub fn detach(&self, app: &App, kind: &str) -> Result<bool, AddonError> {
        let kind = self.resolve(kind)?;
        let path = app.addons_path().join(kind.as_str());
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path)?;
        info!(app = %app.name(), addon = %kind, "Addon detached");
        Ok(true)
    }

    /// Attached addons, in registry order
    pub fn attached(&self, app: &App) -> Vec<AddonType> {
        self.kinds
            .iter()
            .copied()
            .filter(|kind| app.addons_path().join(kind.as_str()).is_file())
            .collect()
    }

    /// Variables contributed by every attached addon. A malformed addon
    /// file contributes nothing.
    pub fn env_vars(&self, app: &App) -> Env {
        let mut env = Env::new();
        for kind in self.attached(app) {
            let path = app.addons_path().join(kind.as_str());
            match settings::parse_settings(&path, Default::default()) {
                Ok(vars) => env.merge(vars),
                Err(e) => warn!(app = %app.name(), addon = %kind, error = %e, "Ignoring addon settings"),
            }
        }
        env
    }
}
