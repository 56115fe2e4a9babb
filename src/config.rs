use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Platform configuration, loaded once at startup and passed to every component
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Filesystem layout
    #[serde(default)]
    pub paths: PathsConfig,

    /// Deploy pipeline settings
    #[serde(default)]
    pub deploy: DeployConfig,

    /// Reverse proxy (nginx) settings
    #[serde(default)]
    pub proxy: NginxConfig,

    /// Process supervisor (uwsgi emperor) settings
    #[serde(default)]
    pub supervisor: UwsgiConfig,
}

/// Directory layout. Only `root` is required; every other directory
/// defaults to a child of it.
#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    /// Platform root directory (default: /home/launchpad)
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Per-app directories (default: <root>/apps)
    pub apps: Option<PathBuf>,

    /// Bare git repositories (default: <root>/repos)
    pub repos: Option<PathBuf>,

    /// Live nginx configuration and certificates (default: <root>/nginx)
    pub nginx: Option<PathBuf>,

    /// Proxy cache directories (default: <root>/cache)
    pub cache: Option<PathBuf>,

    /// Rendered uwsgi units (default: <root>/uwsgi-available)
    pub uwsgi_available: Option<PathBuf>,

    /// Live uwsgi units watched by the emperor (default: <root>/uwsgi-enabled)
    pub uwsgi_enabled: Option<PathBuf>,

    /// ACME challenge webroot (default: <root>/acme)
    pub acme_www: Option<PathBuf>,

    /// Staging area for rendered configuration (default: <root>/staging)
    pub staging: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            apps: None,
            repos: None,
            nginx: None,
            cache: None,
            uwsgi_available: None,
            uwsgi_enabled: None,
            acme_www: None,
            staging: None,
        }
    }
}

impl PathsConfig {
    /// Layout rooted at `root` with every directory defaulted
    pub fn rooted(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    fn or_child(&self, value: &Option<PathBuf>, child: &str) -> PathBuf {
        value.clone().unwrap_or_else(|| self.root.join(child))
    }

    pub fn apps(&self) -> PathBuf {
        self.or_child(&self.apps, "apps")
    }

    pub fn repos(&self) -> PathBuf {
        self.or_child(&self.repos, "repos")
    }

    pub fn nginx(&self) -> PathBuf {
        self.or_child(&self.nginx, "nginx")
    }

    pub fn cache(&self) -> PathBuf {
        self.or_child(&self.cache, "cache")
    }

    pub fn uwsgi_available(&self) -> PathBuf {
        self.or_child(&self.uwsgi_available, "uwsgi-available")
    }

    pub fn uwsgi_enabled(&self) -> PathBuf {
        self.or_child(&self.uwsgi_enabled, "uwsgi-enabled")
    }

    pub fn acme_www(&self) -> PathBuf {
        self.or_child(&self.acme_www, "acme")
    }

    pub fn staging(&self) -> PathBuf {
        self.or_child(&self.staging, "staging")
    }

    /// Every directory the platform expects to exist
    pub fn all_dirs(&self) -> Vec<PathBuf> {
        vec![
            self.apps(),
            self.repos(),
            self.nginx(),
            self.cache(),
            self.uwsgi_available(),
            self.uwsgi_enabled(),
            self.acme_www(),
            self.staging(),
        ]
    }
}

/// What to do when another deploy of the same app holds the lock
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    /// Wait until the running deploy finishes
    #[default]
    Block,
    /// Fail immediately with a "deploy in progress" error
    Reject,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeployConfig {
    /// Behaviour on lock contention (default: block)
    #[serde(default)]
    pub lock_mode: LockMode,

    /// Abort builds running longer than this (default: no limit)
    pub build_timeout_secs: Option<u64>,

    /// System user that runs app workers
    #[serde(default = "default_user")]
    pub user: String,

    /// System group that runs app workers
    #[serde(default = "default_user")]
    pub group: String,

    /// Remove the app's live units before writing new ones so the
    /// supervisor restarts them (default: true)
    #[serde(default = "default_true")]
    pub auto_restart: bool,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            lock_mode: LockMode::default(),
            build_timeout_secs: None,
            user: default_user(),
            group: default_user(),
            auto_restart: true,
        }
    }
}

impl DeployConfig {
    pub fn build_timeout(&self) -> Option<Duration> {
        self.build_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NginxConfig {
    /// Command run after proxy configuration changes, e.g. ["nginx", "-s", "reload"]
    #[serde(default)]
    pub reload_command: Vec<String>,

    /// Listen suffix for TLS servers (default: "443 ssl")
    #[serde(default = "default_ssl_listen")]
    pub ssl_listen: String,

    /// Generate a self-signed certificate when an app has none (default: true)
    #[serde(default = "default_true")]
    pub self_signed_certs: bool,
}

impl Default for NginxConfig {
    fn default() -> Self {
        Self {
            reload_command: Vec::new(),
            ssl_listen: default_ssl_listen(),
            self_signed_certs: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct UwsgiConfig {
    /// Command run after unit changes (the uwsgi emperor usually needs none)
    #[serde(default)]
    pub reload_command: Vec<String>,

    /// Maximum log size before rotation, in bytes (default: 1048576)
    #[serde(default = "default_log_maxsize")]
    pub log_maxsize: u64,
}

impl Default for UwsgiConfig {
    fn default() -> Self {
        Self {
            reload_command: Vec::new(),
            log_maxsize: default_log_maxsize(),
        }
    }
}

fn default_root() -> PathBuf {
    PathBuf::from("/home/launchpad")
}

fn default_user() -> String {
    "launchpad".to_string()
}

fn default_true() -> bool {
    true
}

fn default_ssl_listen() -> String {
    "443 ssl".to_string()
}

fn default_log_maxsize() -> u64 {
    1_048_576
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration rooted at `root` with defaults everywhere else
    pub fn rooted(root: impl Into<PathBuf>) -> Self {
        Self {
            paths: PathsConfig::rooted(root),
            ..Self::default()
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if !self.paths.root.is_absolute() {
            errors.push(format!(
                "paths.root must be absolute (got {})",
                self.paths.root.display()
            ));
        }
        if self.deploy.build_timeout_secs == Some(0) {
            errors.push("deploy.build_timeout_secs must be greater than 0".to_string());
        }
        if self.deploy.user.is_empty() || self.deploy.group.is_empty() {
            errors.push("deploy.user and deploy.group must not be empty".to_string());
        }
        if self.proxy.ssl_listen.trim().is_empty() {
            errors.push("proxy.ssl_listen must not be empty".to_string());
        }
        if self.supervisor.log_maxsize == 0 {
            errors.push("supervisor.log_maxsize must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Create every platform directory
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in self.paths.all_dirs() {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}
