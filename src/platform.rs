//! Programmatic surface over apps, their settings and deploys

use crate::addons::{AddonError, AddonType};
use crate::app::{self, App, AppError};
use crate::config::Config;
use crate::deploy::{self, DeployReport, Deployer};
use crate::env::Env;
use crate::error::DeployError;
use crate::lock::LockError;
use crate::procfile::{Procfile, ProcfileError};
use crate::settings::{self, Settings, SettingsError};
use crate::supervisor::{self, SupervisorConfigError};
use crate::tls;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error(transparent)]
    App(#[from] AppError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Manifest(#[from] ProcfileError),

    #[error("no Procfile in {0}")]
    MissingManifest(String),

    #[error(transparent)]
    Scaling(#[from] SupervisorConfigError),

    #[error("invalid setting '{0}': expected KEY=VALUE")]
    InvalidSetting(String),

    #[error("'{app}' has no worker named '{kind}'")]
    UnknownWorker { app: String, kind: String },

    #[error(transparent)]
    Addon(#[from] AddonError),

    #[error(transparent)]
    Deploy(#[from] DeployError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> PlatformError + '_ {
    move |source| PlatformError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Split `KEY=VALUE`, rejecting empty keys and keys with whitespace
pub fn parse_assignment(raw: &str) -> Result<(String, String), PlatformError> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| PlatformError::InvalidSetting(raw.to_string()))?;
    let key = key.trim();
    check_setting(key, value)?;
    Ok((key.to_string(), value.to_string()))
}

/// A setting must fit on one `KEY=VALUE` line of the `ENV` file
fn check_setting(key: &str, value: &str) -> Result<(), PlatformError> {
    let line_break = |s: &str| s.contains(['\n', '\r']);
    if key.is_empty()
        || key.contains('=')
        || key.chars().any(char::is_whitespace)
        || line_break(value)
    {
        return Err(PlatformError::InvalidSetting(format!(
            "{}={}",
            key.escape_debug(),
            value.escape_debug()
        )));
    }
    Ok(())
}

/// Apps, settings and deploys under one configuration
#[derive(Clone)]
pub struct Platform {
    deployer: Deployer,
}

impl Platform {
    pub fn new(config: Arc<Config>) -> Self {
        Self::with_deployer(Deployer::new(config))
    }

    pub fn with_deployer(deployer: Deployer) -> Self {
        Self { deployer }
    }

    pub fn deployer(&self) -> &Deployer {
        &self.deployer
    }

    pub fn config(&self) -> &Config {
        self.deployer.config()
    }

    /// An app that already exists
    pub fn app(&self, name: &str) -> Result<App, AppError> {
        App::existing(name, &self.config().paths)
    }

    pub fn create(&self, name: &str) -> Result<App, AppError> {
        let app = App::new(name, &self.config().paths)?;
        app.create()?;
        Ok(app)
    }

    pub fn list_apps(&self) -> Result<Vec<App>, PlatformError> {
        let apps_dir = self.config().paths.apps();
        app::list_apps(&self.config().paths).map_err(io_error(&apps_dir))
    }

    /// Remove an app with its repository and live configuration. The `data`
    /// directory survives when `keep_data` is set.
    pub async fn destroy(&self, name: &str, keep_data: bool) -> Result<(), PlatformError> {
        let app = self.app(name)?;
        let paths = &self.config().paths;
        let _lock = self.deployer.lock(&app).await?;

        let (cert, key) = tls::certificate_paths(&paths.nginx(), name);
        let mut doomed = vec![
            paths.nginx().join(format!("{}.conf", name)),
            paths.nginx().join(format!("{}.sock", name)),
            cert,
            key,
            tls::issued_names_path(&paths.nginx(), name),
        ];
        for dir in [paths.uwsgi_enabled(), paths.uwsgi_available()] {
            for file in deploy::owned_units(paths, &dir, name).map_err(io_error(&dir))? {
                doomed.push(dir.join(file));
            }
        }
        for path in doomed.iter().filter(|p| p.exists()) {
            std::fs::remove_file(path).map_err(io_error(path))?;
        }

        for dir in [
            paths.cache().join(name),
            paths.staging().join(name),
            app.repo_path().to_path_buf(),
        ] {
            if dir.exists() {
                std::fs::remove_dir_all(&dir).map_err(io_error(&dir))?;
            }
        }

        let data = app.data_path();
        for entry in std::fs::read_dir(app.app_path()).map_err(io_error(app.app_path()))? {
            let path = entry.map_err(io_error(app.app_path()))?.path();
            if keep_data && path == data {
                continue;
            }
            let removed = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            removed.map_err(io_error(&path))?;
        }
        if !keep_data {
            std::fs::remove_dir(app.app_path()).map_err(io_error(app.app_path()))?;
        }

        if let Err(e) = self.deployer.reload_all().await {
            warn!(app = %name, error = %e, "Reload after destroy failed");
        }
        info!(app = %name, keep_data, "App destroyed");
        Ok(())
    }

    /// Operator settings from the app's `ENV` file
    pub fn get_environment(&self, name: &str) -> Result<Env, PlatformError> {
        let app = self.app(name)?;
        Ok(settings::parse_settings(&app.settings_file(), Settings::new())?.into())
    }

    /// Environment of the last successful deploy
    pub fn live_environment(&self, name: &str) -> Result<Env, PlatformError> {
        let app = self.app(name)?;
        Ok(settings::parse_settings(&app.live_env_file(), Settings::new())?.into())
    }

    /// Set variables in `ENV` under the app lock. Returns the new settings.
    pub async fn set_environment<K, V>(
        &self,
        name: &str,
        pairs: impl IntoIterator<Item = (K, V)>,
    ) -> Result<Env, PlatformError>
    where
        K: Into<String>,
        V: ToString,
    {
        let pairs = pairs
            .into_iter()
            .map(|(key, value)| {
                let (key, value): (String, String) = (key.into(), value.to_string());
                check_setting(&key, &value)?;
                Ok((key, value))
            })
            .collect::<Result<Vec<_>, PlatformError>>()?;
        let app = self.app(name)?;
        let _lock = self.deployer.lock(&app).await?;

        let mut env: Env = settings::parse_settings(&app.settings_file(), Settings::new())?.into();
        for (key, value) in pairs {
            info!(app = %name, key = %key, "Setting variable");
            env.set(key, value);
        }
        settings::write_settings(&app.settings_file(), &env, '=')?;
        Ok(env)
    }

    /// Remove variables from `ENV` under the app lock. Returns the keys that
    /// were present.
    pub async fn unset_environment<S: AsRef<str>>(
        &self,
        name: &str,
        keys: &[S],
    ) -> Result<Vec<String>, PlatformError> {
        let app = self.app(name)?;
        let _lock = self.deployer.lock(&app).await?;

        let mut env: Env = settings::parse_settings(&app.settings_file(), Settings::new())?.into();
        let mut removed = Vec::new();
        for key in keys {
            let key = key.as_ref();
            if env.remove(key).is_some() {
                info!(app = %name, key = %key, "Unset variable");
                removed.push(key.to_string());
            } else {
                warn!(app = %name, key = %key, "Variable not set");
            }
        }
        if !removed.is_empty() {
            settings::write_settings(&app.settings_file(), &env, '=')?;
        }
        Ok(removed)
    }

    /// Attach an addon under the app lock
    pub async fn attach_addon(
        &self,
        name: &str,
        kind: &str,
        url: &str,
    ) -> Result<AddonType, PlatformError> {
        let app = self.app(name)?;
        let _lock = self.deployer.lock(&app).await?;
        Ok(self.deployer.addons().attach(&app, kind, url)?)
    }

    /// Detach an addon under the app lock. Returns false if it was not
    /// attached.
    pub async fn detach_addon(&self, name: &str, kind: &str) -> Result<bool, PlatformError> {
        let app = self.app(name)?;
        let _lock = self.deployer.lock(&app).await?;
        Ok(self.deployer.addons().detach(&app, kind)?)
    }

    /// The Procfile of the current checkout
    pub fn get_manifest(&self, name: &str) -> Result<Procfile, PlatformError> {
        let app = self.app(name)?;
        let src = app.src_path();
        let path = Procfile::locate(&src)
            .ok_or_else(|| PlatformError::MissingManifest(src.display().to_string()))?;
        Ok(Procfile::from_file(&path)?)
    }

    pub async fn deploy(&self, name: &str, revision: &str) -> Result<DeployReport, DeployError> {
        self.deploy_ref(name, revision, "").await
    }

    pub async fn deploy_ref(
        &self,
        name: &str,
        revision: &str,
        refname: &str,
    ) -> Result<DeployReport, DeployError> {
        self.deployer.deploy(name, revision, refname).await
    }

    pub async fn stop(&self, name: &str) -> Result<(), DeployError> {
        self.deployer.stop(name).await.map(|_| ())
    }

    pub async fn restart(&self, name: &str) -> Result<DeployReport, DeployError> {
        self.deployer.restart(name).await
    }

    /// Change instance counts and restart. Every kind must be a worker of the
    /// current Procfile.
    pub async fn scale(
        &self,
        name: &str,
        counts: &[(String, u32)],
    ) -> Result<DeployReport, PlatformError> {
        let app = self.app(name)?;
        let manifest = self.get_manifest(name)?;
        for (kind, _) in counts {
            if !manifest.processes().any(|(worker, _)| worker == kind) {
                return Err(PlatformError::UnknownWorker {
                    app: name.to_string(),
                    kind: kind.clone(),
                });
            }
        }

        {
            let _lock = self.deployer.lock(&app).await?;
            let mut scaling = supervisor::read_scaling(&app.scaling_file())?;
            for (kind, count) in counts {
                info!(app = %name, kind = %kind, count, "Scaling worker");
                scaling.insert(kind.clone(), *count);
            }
            settings::write_settings(&app.scaling_file(), &scaling, ':')?;
        }

        Ok(self.deployer.restart(name).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn platform(dir: &TempDir) -> Platform {
        Platform::new(Arc::new(Config::rooted(dir.path())))
    }

    #[test]
    fn test_parse_assignment() {
        assert_eq!(
            parse_assignment("DATABASE_URL=postgres://db/x?a=b").unwrap(),
            ("DATABASE_URL".to_string(), "postgres://db/x?a=b".to_string())
        );
        assert_eq!(parse_assignment("EMPTY=").unwrap().1, "");
        assert!(parse_assignment("NOVALUE").is_err());
        assert!(parse_assignment("=x").is_err());
        assert!(parse_assignment("BAD KEY=x").is_err());
    }

    #[tokio::test]
    async fn test_set_and_unset_environment() {
        let dir = TempDir::new().unwrap();
        let platform = platform(&dir);
        platform.create("blog").unwrap();

        platform
            .set_environment("blog", [("NGINX_SERVER_NAME", "blog.example.com"), ("DEBUG", "1")])
            .await
            .unwrap();
        let env = platform.get_environment("blog").unwrap();
        assert_eq!(env.get("NGINX_SERVER_NAME"), Some("blog.example.com"));
        assert_eq!(env.get("DEBUG"), Some("1"));

        let removed = platform
            .unset_environment("blog", &["DEBUG", "MISSING"])
            .await
            .unwrap();
        assert_eq!(removed, vec!["DEBUG"]);
        assert!(!platform.get_environment("blog").unwrap().contains("DEBUG"));
    }

    #[tokio::test]
    async fn test_line_breaks_never_reach_env_file() {
        let dir = TempDir::new().unwrap();
        let platform = platform(&dir);
        platform.create("blog").unwrap();
        platform
            .set_environment("blog", [("DATABASE_URL", "postgres://db")])
            .await
            .unwrap();

        let rejected = [
            ("MOTD", "hello\nworld"),
            ("MOTD", "hello\r"),
            ("BAD\nKEY", "x"),
            ("A=B", "x"),
        ];
        for (key, value) in rejected {
            assert!(matches!(
                platform.set_environment("blog", [(key, value), ("OTHER", "1")]).await,
                Err(PlatformError::InvalidSetting(_))
            ));
        }
        assert!(parse_assignment("MOTD=hello\nworld").is_err());

        let env = platform.get_environment("blog").unwrap();
        assert_eq!(env.get("DATABASE_URL"), Some("postgres://db"));
        assert!(!env.contains("OTHER"));
    }

    #[tokio::test]
    async fn test_addon_changes_take_app_lock() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::rooted(dir.path());
        config.deploy.lock_mode = crate::config::LockMode::Reject;
        let platform = Platform::new(Arc::new(config));
        let app = platform.create("blog").unwrap();

        {
            let _held = crate::lock::AppLock::try_acquire("blog", &app.lock_file()).unwrap();
            assert!(matches!(
                platform.attach_addon("blog", "redis", "redis://cache").await,
                Err(PlatformError::Lock(_))
            ));
            assert!(matches!(
                platform.detach_addon("blog", "redis").await,
                Err(PlatformError::Lock(_))
            ));
        }

        assert_eq!(
            platform.attach_addon("blog", "redis", "redis://cache").await.unwrap(),
            AddonType::Redis
        );
        assert!(platform.detach_addon("blog", "redis").await.unwrap());
        assert!(!platform.detach_addon("blog", "redis").await.unwrap());
    }

    #[tokio::test]
    async fn test_set_environment_keeps_malformed_file() {
        let dir = TempDir::new().unwrap();
        let platform = platform(&dir);
        let app = platform.create("blog").unwrap();
        std::fs::write(app.settings_file(), "GOOD=1\nthis is not a setting\n").unwrap();

        assert!(matches!(
            platform.set_environment("blog", [("A", "b")]).await,
            Err(PlatformError::Settings(_))
        ));
        assert!(std::fs::read_to_string(app.settings_file())
            .unwrap()
            .contains("this is not a setting"));
    }

    #[test]
    fn test_unknown_app() {
        let dir = TempDir::new().unwrap();
        let platform = platform(&dir);
        assert!(matches!(
            platform.get_environment("ghost"),
            Err(PlatformError::App(AppError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_scale_rejects_unknown_worker() {
        let dir = TempDir::new().unwrap();
        let platform = platform(&dir);
        let app = platform.create("blog").unwrap();
        std::fs::create_dir_all(app.src_path()).unwrap();
        std::fs::write(app.src_path().join("Procfile"), "web: ./server\nrelease: ./migrate\n").unwrap();

        for kind in ["worker", "release"] {
            assert!(matches!(
                platform.scale("blog", &[(kind.to_string(), 2)]).await,
                Err(PlatformError::UnknownWorker { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_destroy_keeps_data_on_request() {
        let dir = TempDir::new().unwrap();
        let platform = platform(&dir);
        let app = platform.create("blog").unwrap();
        std::fs::write(app.data_path().join("db.sqlite"), "x").unwrap();
        let unit = platform.config().paths.uwsgi_enabled().join("blog_web.1.ini");
        std::fs::create_dir_all(unit.parent().unwrap()).unwrap();
        std::fs::write(&unit, "[uwsgi]\n").unwrap();

        platform.destroy("blog", true).await.unwrap();
        assert!(app.data_path().join("db.sqlite").exists());
        assert!(!app.src_path().exists());
        assert!(!unit.exists());

        platform.destroy("blog", false).await.unwrap();
        assert!(!app.app_path().exists());
    }
}
