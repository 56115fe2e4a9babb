//! Deploy orchestration
//!
//! A deploy walks one app through `RECEIVED -> BUILDING -> CONFIGURING ->
//! ACTIVATING -> RUNNING`. Any error moves it to `FAILED` and leaves the
//! previously live configuration in place. Rendered files are staged first
//! and only swapped into the live directories during activation; the
//! `REVISION` record is written last.

use crate::addons::AddonRegistry;
use crate::app::{list_apps, App, RevisionRecord};
use crate::builders::{self, BuildContext, BuildError, BuildResult, Builder, BuilderRegistry, SourceTree};
use crate::config::{Config, PathsConfig};
use crate::env::Env;
use crate::error::{DeployError, DeployErrorKind, DeployStage};
use crate::events::{Event, Progress};
use crate::git::{GitCheckout, SourceControl};
use crate::lock::{AppLock, LockError};
use crate::procfile::Procfile;
use crate::proxy::{ProxyConfig, ProxyConfigurator};
use crate::settings;
use crate::supervisor::{self, SupervisorConfig, SupervisorConfigurator};
use crate::tls;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1";
const DEFAULT_IPV4_ADDRESS: &str = "0.0.0.0";
const DEFAULT_IPV6_ADDRESS: &str = "[::]";

/// Outcome of a deploy, restart or scale
#[derive(Debug, Clone, Serialize)]
pub struct DeployReport {
    pub app: String,
    pub deploy_id: String,
    pub revision: String,
    pub builder: String,
    /// Every state entered, in order
    pub transitions: Vec<DeployStage>,
    pub final_stage: DeployStage,
    /// Supervisor unit files now live
    pub units: Vec<String>,
    pub duration_secs: f64,
}

/// Tracks the current stage so failures carry it
struct Run<'a> {
    app: &'a str,
    progress: &'a Progress,
    stage: DeployStage,
    transitions: Vec<DeployStage>,
}

impl<'a> Run<'a> {
    fn new(app: &'a str, progress: &'a Progress) -> Self {
        let mut run = Self {
            app,
            progress,
            stage: DeployStage::Received,
            transitions: Vec::new(),
        };
        run.enter(DeployStage::Received);
        run
    }

    fn enter(&mut self, stage: DeployStage) {
        info!(app = %self.app, from = %self.stage, to = %stage, "Deploy state change");
        self.stage = stage;
        self.transitions.push(stage);
        self.progress.emit(self.app, Event::Stage(stage));
    }

    fn fail(&self, kind: impl Into<DeployErrorKind>) -> DeployError {
        DeployError::new(self.app, self.stage, kind)
    }
}

/// What a successful pipeline produced
struct Outcome {
    builder: String,
    units: Vec<String>,
}

/// Freshly rendered configuration for one app
struct Rendered {
    proxy: ProxyConfig,
    supervisor: SupervisorConfig,
}

/// A staged file and the live paths it replaces
struct StagedFile {
    staged: PathBuf,
    targets: Vec<PathBuf>,
}

/// Drives deploys for every app under one [`Config`]
#[derive(Clone)]
pub struct Deployer {
    config: Arc<Config>,
    builders: Arc<BuilderRegistry>,
    addons: AddonRegistry,
    source: Arc<dyn SourceControl>,
    progress: Progress,
}

impl Deployer {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            builders: Arc::new(BuilderRegistry::default()),
            addons: AddonRegistry::default(),
            source: Arc::new(GitCheckout),
            progress: Progress::silent(),
        }
    }

    pub fn with_source<S: SourceControl + 'static>(mut self, source: S) -> Self {
        self.source = Arc::new(source);
        self
    }

    pub fn with_builders(mut self, builders: BuilderRegistry) -> Self {
        self.builders = Arc::new(builders);
        self
    }

    pub fn with_addons(mut self, addons: AddonRegistry) -> Self {
        self.addons = addons;
        self
    }

    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn builders(&self) -> &BuilderRegistry {
        &self.builders
    }

    pub fn addons(&self) -> &AddonRegistry {
        &self.addons
    }

    /// Take the per-app lock in the configured mode
    pub async fn lock(&self, app: &App) -> Result<AppLock, LockError> {
        AppLock::acquire(app.name(), &app.lock_file(), self.config.deploy.lock_mode).await
    }

    /// Build and activate `revision` of `name`
    pub async fn deploy(
        &self,
        name: &str,
        revision: &str,
        refname: &str,
    ) -> Result<DeployReport, DeployError> {
        let started = Instant::now();
        let deploy_id = uuid::Uuid::new_v4().to_string();
        let mut run = Run::new(name, &self.progress);
        info!(app = %name, revision = %revision, deploy_id = %deploy_id, "Deploy received");

        let result = self.locked_deploy(&mut run, revision, refname, &deploy_id).await;
        self.finish(run, result, deploy_id, revision, started)
    }

    /// Re-render and reactivate the running revision. It is only rebuilt
    /// when `src` holds another revision, as after a failed deploy.
    pub async fn restart(&self, name: &str) -> Result<DeployReport, DeployError> {
        let started = Instant::now();
        let deploy_id = uuid::Uuid::new_v4().to_string();
        let mut run = Run::new(name, &self.progress);

        let result = self.locked_restart(&mut run, &deploy_id).await;
        let revision = result
            .as_ref()
            .ok()
            .map(|(revision, _)| revision.clone())
            .unwrap_or_default();
        self.finish(run, result.map(|(_, outcome)| outcome), deploy_id, &revision, started)
    }

    /// Disable every supervisor unit of `name` and reload the supervisor.
    ///
    /// The nginx site and `REVISION` stay put so a restart can bring the app
    /// back.
    pub async fn stop(&self, name: &str) -> Result<DeployStage, DeployError> {
        let fail = |kind: DeployErrorKind| DeployError::new(name, DeployStage::Running, kind);
        let app = App::existing(name, &self.config.paths).map_err(|e| fail(e.into()))?;
        let _lock = self.lock(&app).await.map_err(|e| fail(e.into()))?;

        let enabled = self.config.paths.uwsgi_enabled();
        let mut removed = 0;
        let units = owned_units(&self.config.paths, &enabled, name)
            .map_err(|e| fail(DeployErrorKind::io(&enabled, e)))?;
        for file in units {
            let path = enabled.join(&file);
            std::fs::remove_file(&path).map_err(|e| fail(DeployErrorKind::io(&path, e)))?;
            removed += 1;
        }
        reload("uwsgi", &self.config.supervisor.reload_command)
            .await
            .map_err(|e| fail(DeployErrorKind::Activation(e)))?;

        info!(app = %name, units = removed, "App stopped");
        self.progress.emit(name, Event::Stage(DeployStage::Stopped));
        Ok(DeployStage::Stopped)
    }

    /// Environment a builder and the app's workers see, before port and
    /// listen defaults are filled in.
    ///
    /// Later sources override earlier ones: platform defaults, builder
    /// contributions, attached addons, then the app's `ENV` file.
    pub fn assemble_env(&self, app: &App, builder: Option<&dyn Builder>) -> Env {
        let mut env = Env::new();
        env.set("APP", app.name());
        env.set("HOME", self.config.paths.root.display());
        env.set("USER", &self.config.deploy.user);
        env.set("PATH", std::env::var("PATH").unwrap_or_default());
        env.set("PWD", app.src_path().display());
        env.set("VIRTUAL_ENV", app.env_path().display());
        if let Some(builder) = builder {
            env.merge(&builder.env(app, &env));
        }
        env.merge(&self.addons.env_vars(app));
        env.parse_settings(&app.settings_file());
        env
    }

    /// Fill in `PORT` and the listen addresses unless the app set them.
    ///
    /// A redeploy keeps the port recorded in `LIVE_ENV` so the proxy target
    /// does not move.
    pub fn finalize_env(&self, app: &App, env: &mut Env) -> std::io::Result<()> {
        if !env.contains("PORT") {
            let live = settings::load_settings(&app.live_env_file());
            match live.get("PORT").filter(|p| p.parse::<u16>().is_ok()) {
                Some(port) => env.set("PORT", port),
                None => {
                    let port = free_port()?;
                    debug!(app = %app.name(), port, "Picked a free port");
                    env.set("PORT", port);
                }
            }
        }
        env.set_default("BIND_ADDRESS", DEFAULT_BIND_ADDRESS);
        env.set_default("NGINX_IPV4_ADDRESS", DEFAULT_IPV4_ADDRESS);
        if !env.get_bool("DISABLE_IPV6", false) {
            env.set_default("NGINX_IPV6_ADDRESS", DEFAULT_IPV6_ADDRESS);
        }
        Ok(())
    }

    fn finish(
        &self,
        mut run: Run<'_>,
        result: Result<Outcome, DeployError>,
        deploy_id: String,
        revision: &str,
        started: Instant,
    ) -> Result<DeployReport, DeployError> {
        match result {
            Ok(outcome) => {
                let duration_secs = started.elapsed().as_secs_f64();
                info!(
                    app = %run.app,
                    deploy_id = %deploy_id,
                    builder = %outcome.builder,
                    duration_secs,
                    "App is running"
                );
                Ok(DeployReport {
                    app: run.app.to_string(),
                    deploy_id,
                    revision: revision.to_string(),
                    builder: outcome.builder,
                    final_stage: run.stage,
                    transitions: run.transitions,
                    units: outcome.units,
                    duration_secs,
                })
            }
            Err(e) => {
                error!(
                    app = %run.app,
                    deploy_id = %deploy_id,
                    stage = %e.stage,
                    code = e.code().as_str(),
                    error = %e,
                    "Deploy failed"
                );
                run.enter(DeployStage::Failed);
                Err(e)
            }
        }
    }

    async fn locked_deploy(
        &self,
        run: &mut Run<'_>,
        revision: &str,
        refname: &str,
        deploy_id: &str,
    ) -> Result<Outcome, DeployError> {
        let app = App::new(run.app, &self.config.paths).map_err(|e| run.fail(e))?;
        app.create().map_err(|e| run.fail(e))?;
        let _lock = self.lock(&app).await.map_err(|e| run.fail(e))?;

        let result = self.pipeline(run, &app, revision, refname, deploy_id).await;
        self.clear_staging(&app);
        result
    }

    async fn pipeline(
        &self,
        run: &mut Run<'_>,
        app: &App,
        revision: &str,
        refname: &str,
        deploy_id: &str,
    ) -> Result<Outcome, DeployError> {
        run.enter(DeployStage::Building);
        self.checkout(app, revision).await.map_err(|e| run.fail(e))?;

        let manifest = load_manifest(app).map_err(|e| run.fail(e))?;
        let src = app.src_path();
        let builder = self
            .builders
            .select(&SourceTree::new(&src, &manifest))
            .map_err(|e| run.fail(e))?;
        let mut env = self.assemble_env(app, Some(builder));
        let build = self
            .build_revision(app, &manifest, builder, &env)
            .await
            .map_err(|e| run.fail(e))?;

        run.enter(DeployStage::Configuring);
        self.finalize_env(app, &mut env)
            .map_err(|e| run.fail(DeployErrorKind::io(&app.live_env_file(), e)))?;
        let rendered = self.render(app, &env, &manifest).map_err(|e| run.fail(e))?;
        let staged = self.stage(app, &rendered).map_err(|e| run.fail(e))?;

        run.enter(DeployStage::Activating);
        self.hook(app, &manifest, "release", &env)
            .await
            .map_err(|e| run.fail(e))?;
        self.hook(app, &manifest, "prerun", &env)
            .await
            .map_err(|e| run.fail(e))?;
        self.activate(app, &rendered, &staged)
            .await
            .map_err(|e| run.fail(e))?;
        self.record(app, &env, &rendered, revision, refname, deploy_id, &build.builder)
            .map_err(|e| run.fail(e))?;

        run.enter(DeployStage::Running);
        Ok(Outcome {
            builder: build.builder,
            units: rendered.supervisor.units.iter().map(|u| u.file_name()).collect(),
        })
    }

    async fn locked_restart(
        &self,
        run: &mut Run<'_>,
        deploy_id: &str,
    ) -> Result<(String, Outcome), DeployError> {
        let app = App::existing(run.app, &self.config.paths).map_err(|e| run.fail(e))?;
        let _lock = self.lock(&app).await.map_err(|e| run.fail(e))?;
        let current = app.current_revision().ok_or_else(|| {
            run.fail(DeployErrorKind::Activation(format!(
                "'{}' has no deployed revision",
                app.name()
            )))
        })?;

        let result = self.reconfigure(run, &app, &current, deploy_id).await;
        self.clear_staging(&app);
        result.map(|outcome| (current.revision, outcome))
    }

    async fn reconfigure(
        &self,
        run: &mut Run<'_>,
        app: &App,
        current: &RevisionRecord,
        deploy_id: &str,
    ) -> Result<Outcome, DeployError> {
        if app.checked_out().as_deref() != Some(current.revision.as_str()) {
            self.restore(run, app, current).await?;
        }

        run.enter(DeployStage::Configuring);
        let manifest = load_manifest(app).map_err(|e| run.fail(e))?;
        let mut env = self.assemble_env(app, self.builders.get(&current.builder));
        self.finalize_env(app, &mut env)
            .map_err(|e| run.fail(DeployErrorKind::io(&app.live_env_file(), e)))?;
        let rendered = self.render(app, &env, &manifest).map_err(|e| run.fail(e))?;
        let staged = self.stage(app, &rendered).map_err(|e| run.fail(e))?;

        run.enter(DeployStage::Activating);
        self.activate(app, &rendered, &staged)
            .await
            .map_err(|e| run.fail(e))?;
        self.record(
            app,
            &env,
            &rendered,
            &current.revision,
            &current.refname,
            deploy_id,
            &current.builder,
        )
        .map_err(|e| run.fail(e))?;

        run.enter(DeployStage::Running);
        Ok(Outcome {
            builder: current.builder.clone(),
            units: rendered.supervisor.units.iter().map(|u| u.file_name()).collect(),
        })
    }

    /// Check the running revision back out and rebuild it. Needed after a
    /// failed deploy left its own revision in `src`.
    async fn restore(
        &self,
        run: &mut Run<'_>,
        app: &App,
        current: &RevisionRecord,
    ) -> Result<(), DeployError> {
        run.enter(DeployStage::Building);
        warn!(
            app = %app.name(),
            revision = %current.revision,
            checked_out = ?app.checked_out(),
            "Source tree is not the running revision, restoring it"
        );
        self.checkout(app, &current.revision)
            .await
            .map_err(|e| run.fail(e))?;

        let manifest = load_manifest(app).map_err(|e| run.fail(e))?;
        let builder = match self.builders.get(&current.builder) {
            Some(builder) => builder,
            None => {
                let src = app.src_path();
                self.builders
                    .select(&SourceTree::new(&src, &manifest))
                    .map_err(|e| run.fail(e))?
            }
        };
        let env = self.assemble_env(app, Some(builder));
        self.build_revision(app, &manifest, builder, &env)
            .await
            .map_err(|e| run.fail(e))?;
        Ok(())
    }

    /// Replace `src` with `revision`. The checkout marker is cleared first so
    /// an interrupted checkout is never taken for a good one.
    async fn checkout(&self, app: &App, revision: &str) -> Result<(), DeployErrorKind> {
        app.mark_checkout(None)?;
        self.source.checkout(app, revision).await?;
        app.mark_checkout(Some(revision))?;
        Ok(())
    }

    /// `prebuild` hook, build, `postbuild` hook
    async fn build_revision(
        &self,
        app: &App,
        manifest: &Procfile,
        builder: &dyn Builder,
        env: &Env,
    ) -> Result<BuildResult, BuildError> {
        self.hook(app, manifest, "prebuild", env).await?;
        let ctx = BuildContext {
            app,
            manifest,
            env,
            progress: &self.progress,
        };
        let build = self.build(builder, &ctx).await?;
        self.hook(app, manifest, "postbuild", env).await?;
        Ok(build)
    }

    async fn build(
        &self,
        builder: &dyn Builder,
        ctx: &BuildContext<'_>,
    ) -> Result<BuildResult, BuildError> {
        match self.config.deploy.build_timeout() {
            Some(limit) => tokio::time::timeout(limit, self.builders.build(builder, ctx))
                .await
                .map_err(|_| BuildError::Timeout {
                    builder: builder.name().to_string(),
                    secs: limit.as_secs(),
                })?,
            None => self.builders.build(builder, ctx).await,
        }
    }

    async fn hook(
        &self,
        app: &App,
        manifest: &Procfile,
        name: &str,
        env: &Env,
    ) -> Result<(), BuildError> {
        let command = manifest.get(name);
        if command.is_empty() {
            return Ok(());
        }
        builders::run_hook(app, name, command, env, &self.progress).await?;
        Ok(())
    }

    fn render(&self, app: &App, env: &Env, manifest: &Procfile) -> Result<Rendered, DeployErrorKind> {
        let proxy =
            ProxyConfigurator::new(&self.config.paths, &self.config.proxy).render(app, env, manifest)?;
        let supervisor = SupervisorConfigurator::new(
            &self.config.paths,
            &self.config.deploy,
            &self.config.supervisor,
        )
        .render(app, env, manifest)?;

        if proxy.is_routed() {
            self.progress.emit(
                app.name(),
                Event::Message(format!("nginx will map {} to {}", app.name(), proxy.server_names.join(", "))),
            );
        }
        for (kind, count) in &supervisor.scaling {
            self.progress.emit(
                app.name(),
                Event::Message(format!("spawning {} {} worker(s)", count, kind)),
            );
        }
        Ok(Rendered { proxy, supervisor })
    }

    /// Write rendered files under `staging/<app>/`
    fn stage(&self, app: &App, rendered: &Rendered) -> Result<Vec<StagedFile>, DeployErrorKind> {
        let paths = &self.config.paths;
        let root = self.staging_dir(app);
        self.clear_staging(app);

        let mut staged = Vec::new();
        let nginx_dir = root.join("nginx");
        std::fs::create_dir_all(&nginx_dir).map_err(|e| DeployErrorKind::io(&nginx_dir, e))?;
        let file = nginx_dir.join(rendered.proxy.file_name());
        std::fs::write(&file, &rendered.proxy.content).map_err(|e| DeployErrorKind::io(&file, e))?;
        staged.push(StagedFile {
            staged: file,
            targets: vec![paths.nginx().join(rendered.proxy.file_name())],
        });

        let uwsgi_dir = root.join("uwsgi");
        std::fs::create_dir_all(&uwsgi_dir).map_err(|e| DeployErrorKind::io(&uwsgi_dir, e))?;
        for (name, content) in rendered.supervisor.files() {
            let file = uwsgi_dir.join(&name);
            std::fs::write(&file, content).map_err(|e| DeployErrorKind::io(&file, e))?;
            staged.push(StagedFile {
                staged: file,
                targets: vec![paths.uwsgi_available().join(&name), paths.uwsgi_enabled().join(&name)],
            });
        }

        debug!(app = %app.name(), files = staged.len(), path = %root.display(), "Configuration staged");
        Ok(staged)
    }

    /// Swap staged files into place and reload. A failed reload restores
    /// every file it touched.
    async fn activate(
        &self,
        app: &App,
        rendered: &Rendered,
        staged: &[StagedFile],
    ) -> Result<(), DeployErrorKind> {
        let paths = &self.config.paths;
        let name = app.name();

        let mut new_certificate = false;
        if rendered.proxy.is_routed() && self.config.proxy.self_signed_certs {
            new_certificate =
                tls::ensure_self_signed(&paths.nginx(), name, &rendered.proxy.server_names)?;
        }
        if let Some(cache) = &rendered.proxy.cache_path {
            std::fs::create_dir_all(cache).map_err(|e| DeployErrorKind::io(cache, e))?;
        }

        let live: Vec<String> = rendered.supervisor.units.iter().map(|u| u.file_name()).collect();
        let mut stale = Vec::new();
        for dir in [paths.uwsgi_available(), paths.uwsgi_enabled()] {
            for file in owned_units(paths, &dir, name).map_err(|e| DeployErrorKind::io(&dir, e))? {
                if !live.contains(&file) {
                    stale.push(dir.join(file));
                }
            }
        }

        let mut backups = Backups::default();
        let swapped = self.swap(&mut backups, staged, &stale);
        let reloaded = match swapped {
            Ok(0) if !new_certificate => {
                info!(app = %name, "Configuration unchanged, skipping reload");
                return Ok(());
            }
            Ok(changed) => {
                info!(app = %name, files = changed, "Configuration swapped in");
                self.reload_all().await
            }
            Err(e) => Err(e.to_string()),
        };

        if let Err(message) = reloaded {
            warn!(app = %name, error = %message, "Activation failed, restoring previous configuration");
            backups.restore();
            if let Err(e) = self.reload_all().await {
                warn!(app = %name, error = %e, "Reload after rollback failed");
            }
            return Err(DeployErrorKind::Activation(message));
        }
        Ok(())
    }

    /// Promote staged files and remove stale units, returning how many live
    /// files changed
    fn swap(
        &self,
        backups: &mut Backups,
        staged: &[StagedFile],
        stale: &[PathBuf],
    ) -> Result<usize, DeployErrorKind> {
        let mut changed = 0;
        for file in staged {
            let content =
                std::fs::read(&file.staged).map_err(|e| DeployErrorKind::io(&file.staged, e))?;
            for target in &file.targets {
                let current = std::fs::read(target).ok();
                if !self.config.deploy.auto_restart && current.as_deref() == Some(&content[..]) {
                    continue;
                }
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| DeployErrorKind::io(parent, e))?;
                }
                backups.save(target, current);
                settings::write_atomic(target, &content).map_err(|e| DeployErrorKind::io(target, e))?;
                changed += 1;
            }
        }
        for path in stale {
            backups.save(path, std::fs::read(path).ok());
            std::fs::remove_file(path).map_err(|e| DeployErrorKind::io(path, e))?;
            debug!(path = %path.display(), "Removed stale unit");
            changed += 1;
        }
        Ok(changed)
    }

    pub(crate) async fn reload_all(&self) -> Result<(), String> {
        reload("nginx", &self.config.proxy.reload_command).await?;
        reload("uwsgi", &self.config.supervisor.reload_command).await
    }

    /// Persist the env, instance counts and, last, the revision record
    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        app: &App,
        env: &Env,
        rendered: &Rendered,
        revision: &str,
        refname: &str,
        deploy_id: &str,
        builder: &str,
    ) -> Result<(), DeployErrorKind> {
        settings::write_settings(&app.live_env_file(), env, '=')?;
        settings::write_settings(&app.scaling_file(), &rendered.supervisor.scaling, ':')?;
        app.write_revision(&RevisionRecord {
            revision: revision.to_string(),
            refname: refname.to_string(),
            deploy_id: deploy_id.to_string(),
            builder: builder.to_string(),
            deployed_at: chrono::Utc::now(),
        })?;
        Ok(())
    }

    fn staging_dir(&self, app: &App) -> PathBuf {
        self.config.paths.staging().join(app.name())
    }

    fn clear_staging(&self, app: &App) {
        let dir = self.staging_dir(app);
        if dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                warn!(app = %app.name(), path = %dir.display(), error = %e, "Failed to clear staging");
            }
        }
    }
}

/// Previous contents of every live file an activation touched
#[derive(Default)]
struct Backups {
    saved: Vec<(PathBuf, Option<Vec<u8>>)>,
}

impl Backups {
    fn save(&mut self, path: &Path, previous: Option<Vec<u8>>) {
        if !self.saved.iter().any(|(p, _)| p == path) {
            self.saved.push((path.to_path_buf(), previous));
        }
    }

    fn restore(self) {
        for (path, previous) in self.saved.into_iter().rev() {
            let result = match previous {
                Some(content) => settings::write_atomic(&path, &content),
                None if path.exists() => std::fs::remove_file(&path),
                None => Ok(()),
            };
            if let Err(e) = result {
                warn!(path = %path.display(), error = %e, "Failed to restore file");
            }
        }
    }
}

/// Locate and parse the app's Procfile, rejecting one with no workers
pub fn load_manifest(app: &App) -> Result<Procfile, DeployErrorKind> {
    let src = app.src_path();
    let path = Procfile::locate(&src)
        .ok_or_else(|| DeployErrorKind::MissingManifest(src.display().to_string()))?;
    let manifest = Procfile::from_file(&path)?;
    if manifest.is_empty() {
        return Err(DeployErrorKind::NoWorkers);
    }
    Ok(manifest)
}

/// Unit files of `app` in `dir`, sorted. Units of another app whose name
/// extends this one (`blog_api` for `blog`) are left out.
pub(crate) fn owned_units(paths: &PathsConfig, dir: &Path, app: &str) -> std::io::Result<Vec<String>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let prefix = format!("{}_", app);
    let longer: Vec<String> = list_apps(paths)?
        .into_iter()
        .map(|other| other.name().to_string())
        .filter(|other| other.starts_with(&prefix))
        .collect();

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if supervisor::is_unit_of(app, &name)
            && !longer.iter().any(|other| supervisor::is_unit_of(other, &name))
        {
            files.push(name);
        }
    }
    files.sort();
    Ok(files)
}

/// Run a configured reload command. An empty command is a no-op.
async fn reload(what: &str, command: &[String]) -> Result<(), String> {
    let Some((program, args)) = command.split_first() else {
        return Ok(());
    };
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| format!("{} reload: failed to run {}: {}", what, program, e))?;
    if output.status.success() {
        debug!(command = %command.join(" "), "{} reloaded", what);
        Ok(())
    } else {
        Err(format!(
            "{} reload `{}` exited with {}: {}",
            what,
            command.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }
}

fn free_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind((DEFAULT_BIND_ADDRESS, 0))?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn deployer(dir: &TempDir) -> (Deployer, App) {
        let config = Arc::new(Config::rooted(dir.path()));
        let app = App::new("blog", &config.paths).unwrap();
        app.create().unwrap();
        (Deployer::new(config), app)
    }

    #[test]
    fn test_env_precedence() {
        let dir = TempDir::new().unwrap();
        let (deployer, app) = deployer(&dir);
        std::fs::write(app.settings_file(), "USER=override\nDEBUG=1\n").unwrap();
        deployer
            .addons()
            .attach(&app, "redis", "redis://cache:6379")
            .unwrap();

        let env = deployer.assemble_env(&app, None);
        assert_eq!(env.get("APP"), Some("blog"));
        assert_eq!(env.get("USER"), Some("override"));
        assert_eq!(env.get("DEBUG"), Some("1"));
        assert_eq!(env.get("REDIS_URL"), Some("redis://cache:6379"));
    }

    #[test]
    fn test_port_reused_from_live_env() {
        let dir = TempDir::new().unwrap();
        let (deployer, app) = deployer(&dir);
        std::fs::write(app.live_env_file(), "PORT=5123\n").unwrap();

        let mut env = Env::new();
        deployer.finalize_env(&app, &mut env).unwrap();
        assert_eq!(env.get("PORT"), Some("5123"));
        assert_eq!(env.get("BIND_ADDRESS"), Some("127.0.0.1"));
        assert_eq!(env.get("NGINX_IPV6_ADDRESS"), Some("[::]"));
    }

    #[test]
    fn test_port_picked_and_ipv6_disabled() {
        let dir = TempDir::new().unwrap();
        let (deployer, app) = deployer(&dir);

        let mut env = Env::from_pairs([("DISABLE_IPV6", "true")]);
        deployer.finalize_env(&app, &mut env).unwrap();
        assert!(env.get_int("PORT", 0).unwrap() > 0);
        assert!(!env.contains("NGINX_IPV6_ADDRESS"));
    }

    #[test]
    fn test_owned_units() {
        let dir = TempDir::new().unwrap();
        let (deployer, _) = deployer(&dir);
        let paths = &deployer.config().paths;
        App::new("blog_api", paths).unwrap().create().unwrap();
        let units = dir.path().join("units");
        std::fs::create_dir_all(&units).unwrap();
        for file in [
            "blog_web.1.ini",
            "blog_queue_worker.2.ini",
            "blog_api_web.1.ini",
            "other_web.1.ini",
        ] {
            std::fs::write(units.join(file), "").unwrap();
        }

        assert_eq!(
            owned_units(paths, &units, "blog").unwrap(),
            vec!["blog_queue_worker.2.ini", "blog_web.1.ini"]
        );
        assert_eq!(
            owned_units(paths, &units, "blog_api").unwrap(),
            vec!["blog_api_web.1.ini"]
        );
    }

    #[test]
    fn test_missing_and_empty_manifest() {
        let dir = TempDir::new().unwrap();
        let (_, app) = deployer(&dir);
        assert!(matches!(
            load_manifest(&app),
            Err(DeployErrorKind::MissingManifest(_))
        ));

        std::fs::write(app.src_path().join("Procfile"), "# nothing here\n").unwrap();
        assert!(matches!(load_manifest(&app), Err(DeployErrorKind::NoWorkers)));
    }

    #[tokio::test]
    async fn test_reload_commands() {
        assert!(reload("nginx", &[]).await.is_ok());
        assert!(reload("nginx", &["true".to_string()]).await.is_ok());
        let err = reload("uwsgi", &["false".to_string()]).await.unwrap_err();
        assert!(err.contains("uwsgi reload"));
    }
}
