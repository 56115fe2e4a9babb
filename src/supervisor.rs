//! uWSGI emperor vassals for app workers
//!
//! Every Procfile process becomes one INI file per instance, named
//! `<app>_<kind>.<n>.ini`. Lifecycle hooks never get a unit and `static`
//! workers are served by nginx directly.

use crate::app::App;
use crate::config::{DeployConfig, PathsConfig, UwsgiConfig};
use crate::env::Env;
use crate::procfile::{CronField, CronSchedule, Procfile};
use crate::settings::{self, SettingsError};
use indexmap::IndexMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Variables never copied into units
const EXCLUDED_ENV: &[&str] = &["NGINX_ACL"];

const ACCESS_LOG_FORMAT: &str = "%%(addr) - %%(user) [%%(ltime)] \"%%(method) %%(uri) %%(proto)\" \
%%(status) %%(size) \"%%(referer)\" \"%%(uagent)\" %%(msecs)ms";

#[derive(Debug, Error)]
pub enum SupervisorConfigError {
    #[error("malformed setting {name}='{value}': expected an integer")]
    InvalidSetting { name: &'static str, value: String },

    #[error("malformed SCALING entry {kind}:{value}")]
    InvalidScaling { kind: String, value: String },

    #[error("cron worker '{0}' has no valid schedule")]
    InvalidSchedule(String),

    #[error("{0} must be set for workers listening over HTTP")]
    MissingVariable(&'static str),

    #[error("UWSGI_INCLUDE_FILE: {0}")]
    IncludeFile(#[source] SettingsError),

    #[error(transparent)]
    Scaling(SettingsError),
}

/// Ordered uwsgi directives. Keys may repeat and order is preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UwsgiSettings {
    values: Vec<(String, String)>,
}

impl UwsgiSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: impl Into<String>, value: impl ToString) {
        self.values.push((key.into(), value.to_string()));
    }

    pub fn extend<K, V>(&mut self, items: impl IntoIterator<Item = (K, V)>)
    where
        K: Into<String>,
        V: ToString,
    {
        for (key, value) in items {
            self.add(key, value);
        }
    }

    /// First value for `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Every value for `key`, in order
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> {
        self.values
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn render(&self) -> String {
        let mut out = String::from("[uwsgi]\n");
        for (key, value) in &self.values {
            out.push_str(key);
            out.push_str(" = ");
            out.push_str(value);
            out.push('\n');
        }
        out
    }
}

/// How a worker is run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    /// Any process that binds `PORT` itself
    Web,
    Wsgi,
    Jwsgi,
    Rwsgi,
    Cron,
    Static,
    /// Background process
    Generic,
}

impl WorkerKind {
    pub fn classify(name: &str, command: &str) -> Self {
        match name {
            "web" => WorkerKind::Web,
            "wsgi" => WorkerKind::Wsgi,
            "jwsgi" => WorkerKind::Jwsgi,
            "rwsgi" => WorkerKind::Rwsgi,
            "static" => WorkerKind::Static,
            "cron" => WorkerKind::Cron,
            _ if matches!(CronSchedule::detect(command), Some(Ok(_))) => WorkerKind::Cron,
            _ => WorkerKind::Generic,
        }
    }
}

/// One supervised process instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unit {
    pub app: String,
    pub kind: String,
    pub ordinal: u32,
    pub settings: UwsgiSettings,
}

impl Unit {
    pub fn file_name(&self) -> String {
        unit_file_name(&self.app, &self.kind, self.ordinal)
    }

    pub fn content(&self) -> String {
        self.settings.render()
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}.{}", self.app, self.kind, self.ordinal)
    }
}

pub fn unit_file_name(app: &str, kind: &str, ordinal: u32) -> String {
    format!("{}_{}.{}.ini", app, kind, ordinal)
}

/// True if `file_name` is a unit of `app`
pub fn is_unit_of(app: &str, file_name: &str) -> bool {
    file_name
        .strip_prefix(app)
        .and_then(|rest| rest.strip_prefix('_'))
        .is_some_and(|rest| rest.ends_with(".ini"))
}

/// Rendered units for one app, plus the instance counts they came from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub app: String,
    pub units: Vec<Unit>,
    pub scaling: IndexMap<String, u32>,
}

impl SupervisorConfig {
    /// `(file name, content)` for every unit
    pub fn files(&self) -> Vec<(String, String)> {
        self.units
            .iter()
            .map(|unit| (unit.file_name(), unit.content()))
            .collect()
    }
}

/// Read a `SCALING` file (`kind:count` per line). Missing file means no overrides.
pub fn read_scaling(path: &Path) -> Result<IndexMap<String, u32>, SupervisorConfigError> {
    let raw = settings::parse_settings_with(path, IndexMap::new(), ':')
        .map_err(SupervisorConfigError::Scaling)?;
    raw.into_iter()
        .map(|(kind, value)| match value.trim().parse::<u32>() {
            Ok(count) => Ok((kind, count)),
            Err(_) => Err(SupervisorConfigError::InvalidScaling { kind, value }),
        })
        .collect()
}

/// Renders uwsgi units under the configured paths
pub struct SupervisorConfigurator<'a> {
    paths: &'a PathsConfig,
    deploy: &'a DeployConfig,
    uwsgi: &'a UwsgiConfig,
}

impl<'a> SupervisorConfigurator<'a> {
    pub fn new(paths: &'a PathsConfig, deploy: &'a DeployConfig, uwsgi: &'a UwsgiConfig) -> Self {
        Self {
            paths,
            deploy,
            uwsgi,
        }
    }

    /// Render units for every non-hook worker, using instance counts from
    /// the app's `SCALING` file (default 1).
    pub fn render(
        &self,
        app: &App,
        env: &Env,
        manifest: &Procfile,
    ) -> Result<SupervisorConfig, SupervisorConfigError> {
        let overrides = read_scaling(&app.scaling_file())?;
        self.render_scaled(app, env, manifest, &overrides)
    }

    /// Like [`SupervisorConfigurator::render`] with explicit instance counts
    pub fn render_scaled(
        &self,
        app: &App,
        env: &Env,
        manifest: &Procfile,
        overrides: &IndexMap<String, u32>,
    ) -> Result<SupervisorConfig, SupervisorConfigError> {
        let mut config = SupervisorConfig {
            app: app.name().to_string(),
            ..SupervisorConfig::default()
        };

        for (name, command) in manifest.processes() {
            let kind = WorkerKind::classify(name, command);
            if kind == WorkerKind::Static {
                info!(app = %app.name(), "nginx serving static files only");
                continue;
            }

            let count = overrides.get(name).copied().unwrap_or(1);
            config.scaling.insert(name.to_string(), count);

            for ordinal in 1..=count {
                let settings = self.unit_settings(app, env, name, command, kind, ordinal)?;
                let unit = Unit {
                    app: app.name().to_string(),
                    kind: name.to_string(),
                    ordinal,
                    settings,
                };
                debug!(unit = %unit, directives = unit.settings.len(), "Rendered unit");
                config.units.push(unit);
            }
        }

        Ok(config)
    }

    fn unit_settings(
        &self,
        app: &App,
        env: &Env,
        name: &str,
        command: &str,
        kind: WorkerKind,
        ordinal: u32,
    ) -> Result<UwsgiSettings, SupervisorConfigError> {
        let mut settings = self.base_settings(app, env, name, kind, ordinal)?;

        match kind {
            WorkerKind::Cron => {
                let schedule = CronSchedule::detect(command)
                    .and_then(Result::ok)
                    .ok_or_else(|| SupervisorConfigError::InvalidSchedule(name.to_string()))?;
                info!(app = %app.name(), worker = %name, "uwsgi scheduled cron job");
                settings.add("cron", uwsgi_cron(&schedule));
            }
            WorkerKind::Wsgi | WorkerKind::Jwsgi | WorkerKind::Rwsgi => {
                settings.add("module", command);
                settings.add("threads", env.get_or("UWSGI_THREADS", "4"));
                match kind {
                    WorkerKind::Wsgi => {
                        settings.add("plugin", "python3");
                        if env.contains("UWSGI_ASYNCIO") {
                            let tasks = int_setting(env, "UWSGI_ASYNCIO", 0)?;
                            settings.add("plugin", "asyncio_python3");
                            settings.add("async", tasks);
                        }
                    }
                    WorkerKind::Jwsgi => {
                        settings.add("plugin", "jvm");
                        settings.add("plugin", "jwsgi");
                    }
                    _ => {
                        settings.add("plugin", "rack");
                        settings.add("plugin", "rbrequire");
                        settings.add("plugin", "post-buffering");
                    }
                }

                if kind != WorkerKind::Rwsgi && env.contains("NGINX_SERVER_NAME") {
                    let socket = self.paths.nginx().join(format!("{}.sock", app.name()));
                    settings.add("socket", socket.display());
                    settings.add("chmod-socket", "664");
                } else {
                    settings.add("http", http_address(env)?);
                }
            }
            WorkerKind::Web | WorkerKind::Generic => {
                settings.add("attach-daemon", command);
            }
            WorkerKind::Static => {}
        }

        self.add_env(&mut settings, app, env, name)?;
        Ok(settings)
    }

    fn base_settings(
        &self,
        app: &App,
        env: &Env,
        name: &str,
        kind: WorkerKind,
        ordinal: u32,
    ) -> Result<UwsgiSettings, SupervisorConfigError> {
        let log_file = app.log_path().join(name);
        let log_file = format!("{}.{}.log", log_file.display(), ordinal);
        let user = &self.deploy.user;
        let group = &self.deploy.group;

        let mut settings = UwsgiSettings::new();
        settings.add("chdir", app.src_path().display());
        settings.add("uid", user);
        settings.add("gid", group);
        settings.add("master", "true");
        settings.add("project", app.name());
        settings.add("max-requests", int_setting(env, "UWSGI_MAX_REQUESTS", 1024)?);
        settings.add("listen", int_setting(env, "UWSGI_LISTEN", 16)?);
        settings.add("processes", int_setting(env, "UWSGI_PROCESSES", 1)?);
        settings.add("procname-prefix", format!("{}:{}:", app.name(), name));
        settings.add(
            "enable-threads",
            env.get_or("UWSGI_ENABLE_THREADS", "true").to_lowercase(),
        );
        settings.add(
            "log-x-forwarded-for",
            env.get_or("UWSGI_LOG_X_FORWARDED_FOR", "false").to_lowercase(),
        );
        settings.add(
            "log-maxsize",
            int_setting(env, "UWSGI_LOG_MAXSIZE", self.uwsgi.log_maxsize as i64)?,
        );
        settings.add("logfile-chown", format!("{}:{}", user, group));
        settings.add("logfile-chmod", "640");
        settings.add("logto2", &log_file);
        settings.add("log-backupname", format!("{}.old", log_file));

        if matches!(kind, WorkerKind::Web | WorkerKind::Wsgi) {
            settings.add("log-format", ACCESS_LOG_FORMAT);
        }

        let venv = app.env_path();
        if venv.join("pyvenv.cfg").exists() {
            settings.add("virtualenv", venv.display());
        }

        if env.contains("UWSGI_IDLE") {
            let idle = int_setting(env, "UWSGI_IDLE", 0)?;
            settings.add("idle", idle);
            settings.add("cheap", "True");
            settings.add("die-on-idle", "True");
        }

        Ok(settings)
    }

    fn add_env(
        &self,
        settings: &mut UwsgiSettings,
        app: &App,
        env: &Env,
        name: &str,
    ) -> Result<(), SupervisorConfigError> {
        if let Some(include) = env.get("UWSGI_INCLUDE_FILE").filter(|f| !f.is_empty()) {
            let path = include_path(app, include);
            let extra = settings::parse_settings(&path, IndexMap::new())
                .map_err(SupervisorConfigError::IncludeFile)?;
            settings.extend(extra);
        }

        for (key, value) in env.iter() {
            if !EXCLUDED_ENV.contains(&key) {
                settings.add("env", format!("{}={}", key, value));
            }
        }
        settings.add("env", format!("PROC_TYPE={}", name));
        Ok(())
    }
}

fn include_path(app: &App, include: &str) -> PathBuf {
    let path = Path::new(include);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        app.src_path().join(path)
    }
}

fn int_setting(env: &Env, name: &'static str, default: i64) -> Result<i64, SupervisorConfigError> {
    env.get_int(name, default)
        .map_err(|_| SupervisorConfigError::InvalidSetting {
            name,
            value: env.get_or(name, "").to_string(),
        })
}

fn http_address(env: &Env) -> Result<String, SupervisorConfigError> {
    let bind = env.get_or("BIND_ADDRESS", "127.0.0.1");
    let port = env
        .get("PORT")
        .ok_or(SupervisorConfigError::MissingVariable("PORT"))?;
    Ok(format!("{}:{}", bind, port))
}

/// uwsgi's cron syntax: `-1` for any, `-N` for every N
fn uwsgi_cron(schedule: &CronSchedule) -> String {
    let mut parts: Vec<String> = schedule
        .fields
        .iter()
        .map(|field| match field {
            CronField::Any => "-1".to_string(),
            CronField::Every(n) => format!("-{}", n),
            CronField::At(n) => n.to_string(),
        })
        .collect();
    parts.push(schedule.command.clone());
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        config: Config,
        app: App,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let config = Config::rooted(dir.path());
        let app = App::new("blog", &config.paths).unwrap();
        app.create().unwrap();
        Fixture {
            _dir: dir,
            config,
            app,
        }
    }

    fn render(f: &Fixture, env: &Env, procfile: &str) -> Result<SupervisorConfig, SupervisorConfigError> {
        let manifest = Procfile::parse(procfile).unwrap();
        SupervisorConfigurator::new(&f.config.paths, &f.config.deploy, &f.config.supervisor)
            .render(&f.app, env, &manifest)
    }

    #[test]
    fn test_settings_keep_order_and_repeats() {
        let mut settings = UwsgiSettings::new();
        settings.add("module", "app:main");
        settings.add("plugin", "jvm");
        settings.extend([("plugin", "jwsgi"), ("chdir", "/app")]);

        assert_eq!(settings.get("plugin"), Some("jvm"));
        assert_eq!(settings.get_all("plugin").collect::<Vec<_>>(), vec!["jvm", "jwsgi"]);
        assert_eq!(
            settings.render(),
            "[uwsgi]\nmodule = app:main\nplugin = jvm\nplugin = jwsgi\nchdir = /app\n"
        );
    }

    #[test]
    fn test_hooks_and_static_have_no_units() {
        let f = fixture();
        let env = Env::from_pairs([("PORT", "5000")]);
        let config = render(
            &f,
            &env,
            "prebuild: make\nbuild: make all\npostbuild: echo\nrelease: ./migrate\nprerun: true\nstatic: public\nweb: ./server",
        )
        .unwrap();

        let names: Vec<_> = config.units.iter().map(Unit::file_name).collect();
        assert_eq!(names, vec!["blog_web.1.ini"]);
        assert_eq!(config.scaling.get("web"), Some(&1));
        assert!(!config.scaling.contains_key("static"));
    }

    #[test]
    fn test_base_directives_come_first() {
        let f = fixture();
        let env = Env::from_pairs([("PORT", "5000"), ("NGINX_ACL", "deny all;")]);
        let config = render(&f, &env, "web: ./server --port $PORT").unwrap();
        let unit = &config.units[0];
        let keys: Vec<_> = unit.settings.iter().map(|(k, _)| k).collect();

        assert_eq!(&keys[..5], &["chdir", "uid", "gid", "master", "project"]);
        assert_eq!(unit.settings.get("uid"), Some("launchpad"));
        assert_eq!(unit.settings.get("attach-daemon"), Some("./server --port $PORT"));
        assert_eq!(unit.settings.get("max-requests"), Some("1024"));
        assert!(unit.settings.get("logto2").unwrap().ends_with("log/web.1.log"));

        let envs: Vec<_> = unit.settings.get_all("env").collect();
        assert_eq!(envs, vec!["PORT=5000", "PROC_TYPE=web"]);

        let attach = keys.iter().position(|k| *k == "attach-daemon").unwrap();
        let first_env = keys.iter().position(|k| *k == "env").unwrap();
        assert!(attach < first_env);
    }

    #[test]
    fn test_wsgi_socket_under_nginx() {
        let f = fixture();
        let env = Env::from_pairs([("NGINX_SERVER_NAME", "blog.example.com"), ("UWSGI_ASYNCIO", "8")]);
        let config = render(&f, &env, "wsgi: blog.app:application").unwrap();
        let settings = &config.units[0].settings;

        assert_eq!(settings.get("module"), Some("blog.app:application"));
        assert_eq!(
            settings.get_all("plugin").collect::<Vec<_>>(),
            vec!["python3", "asyncio_python3"]
        );
        assert_eq!(settings.get("async"), Some("8"));
        assert!(settings.get("socket").unwrap().ends_with("nginx/blog.sock"));
        assert!(settings.get("http").is_none());
        assert!(settings.get("log-format").is_some());
    }

    #[test]
    fn test_wsgi_http_without_nginx() {
        let f = fixture();
        let env = Env::from_pairs([("PORT", "8000"), ("BIND_ADDRESS", "127.0.0.1")]);
        let config = render(&f, &env, "wsgi: app:application").unwrap();
        assert_eq!(config.units[0].settings.get("http"), Some("127.0.0.1:8000"));

        let err = render(&f, &Env::new(), "wsgi: app:application").unwrap_err();
        assert!(matches!(err, SupervisorConfigError::MissingVariable("PORT")));
    }

    #[test]
    fn test_jwsgi_and_rwsgi_plugins() {
        let f = fixture();
        let env = Env::from_pairs([("PORT", "8000")]);
        let config = render(&f, &env, "jwsgi: app.Main\nworker: ./queue").unwrap();
        assert_eq!(
            config.units[0].settings.get_all("plugin").collect::<Vec<_>>(),
            vec!["jvm", "jwsgi"]
        );
        assert_eq!(config.units[1].settings.get("attach-daemon"), Some("./queue"));

        let config = render(&f, &env, "rwsgi: config.ru").unwrap();
        assert_eq!(
            config.units[0].settings.get_all("plugin").collect::<Vec<_>>(),
            vec!["rack", "rbrequire", "post-buffering"]
        );
    }

    #[test]
    fn test_cron_translation() {
        let f = fixture();
        let config = render(&f, &Env::new(), "cron: */5 * 1 * * ./cleanup --all *").unwrap();
        assert_eq!(
            config.units[0].settings.get("cron"),
            Some("-5 -1 1 -1 -1 ./cleanup --all *")
        );

        let config = render(&f, &Env::new(), "nightly: 0 3 * * * ./backup").unwrap();
        assert_eq!(config.units[0].settings.get("cron"), Some("0 3 -1 -1 -1 ./backup"));
    }

    #[test]
    fn test_scaling_file() {
        let f = fixture();
        std::fs::write(f.app.scaling_file(), "web:3\nworker:0\n").unwrap();
        let env = Env::from_pairs([("PORT", "5000")]);
        let config = render(&f, &env, "web: ./server\nworker: ./queue").unwrap();

        let names: Vec<_> = config.units.iter().map(Unit::file_name).collect();
        assert_eq!(names, vec!["blog_web.1.ini", "blog_web.2.ini", "blog_web.3.ini"]);
        assert_eq!(config.scaling.get("worker"), Some(&0));

        std::fs::write(f.app.scaling_file(), "web:many\n").unwrap();
        let err = render(&f, &env, "web: ./server").unwrap_err();
        assert!(matches!(err, SupervisorConfigError::InvalidScaling { .. }));
    }

    #[test]
    fn test_idle_and_include_file() {
        let f = fixture();
        std::fs::write(f.app.src_path().join("uwsgi.ini"), "harakiri=30\n").unwrap();
        let env = Env::from_pairs([
            ("PORT", "5000"),
            ("UWSGI_IDLE", "60"),
            ("UWSGI_INCLUDE_FILE", "uwsgi.ini"),
        ]);
        let config = render(&f, &env, "web: ./server").unwrap();
        let settings = &config.units[0].settings;
        assert_eq!(settings.get("idle"), Some("60"));
        assert_eq!(settings.get("die-on-idle"), Some("True"));
        assert_eq!(settings.get("harakiri"), Some("30"));

        let env = Env::from_pairs([("PORT", "5000"), ("UWSGI_IDLE", "soon")]);
        let err = render(&f, &env, "web: ./server").unwrap_err();
        assert!(matches!(err, SupervisorConfigError::InvalidSetting { name: "UWSGI_IDLE", .. }));
    }

    #[test]
    fn test_unit_ownership() {
        assert!(is_unit_of("blog", "blog_web.1.ini"));
        assert!(!is_unit_of("blog", "blogger_web.1.ini"));
        assert!(!is_unit_of("blog", "blog.conf"));
    }
}
