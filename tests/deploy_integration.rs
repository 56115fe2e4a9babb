//! End-to-end deploys against throw-away platform roots
//!
//! Sources come from a plain directory and builds go through the Procfile
//! `build` hook or the static builder, so no language toolchain, nginx or
//! uwsgi is needed.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use launchpad::app::App;
use launchpad::config::{Config, LockMode};
use launchpad::deploy::Deployer;
use launchpad::error::{DeployErrorCode, DeployStage};
use launchpad::events::{Event, Progress};
use launchpad::git::DirectorySource;
use launchpad::lock::AppLock;
use launchpad::platform::Platform;
use tempfile::TempDir;

struct Fixture {
    root: TempDir,
    source: TempDir,
}

impl Fixture {
    fn new(procfile: &str) -> Self {
        let fixture = Self {
            root: TempDir::new().unwrap(),
            source: TempDir::new().unwrap(),
        };
        fixture.write_source("Procfile", procfile);
        fixture
    }

    fn write_source(&self, name: &str, content: &str) {
        let path = self.source.path().join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn config(&self) -> Config {
        Config::rooted(self.root.path())
    }

    fn platform_with(&self, config: Config) -> Platform {
        let deployer = Deployer::new(Arc::new(config))
            .with_source(DirectorySource::new(self.source.path()));
        Platform::with_deployer(deployer)
    }

    fn platform(&self) -> Platform {
        self.platform_with(self.config())
    }

    fn app(&self) -> App {
        App::new("blog", &self.config().paths).unwrap()
    }

    fn nginx_conf(&self) -> PathBuf {
        self.config().paths.nginx().join("blog.conf")
    }

    fn enabled(&self, unit: &str) -> PathBuf {
        self.config().paths.uwsgi_enabled().join(unit)
    }

    fn available(&self, unit: &str) -> PathBuf {
        self.config().paths.uwsgi_available().join(unit)
    }
}

fn read(path: &Path) -> Vec<u8> {
    std::fs::read(path).unwrap_or_else(|e| panic!("{}: {}", path.display(), e))
}

const HAPPY_PATH: [DeployStage; 5] = [
    DeployStage::Received,
    DeployStage::Building,
    DeployStage::Configuring,
    DeployStage::Activating,
    DeployStage::Running,
];

#[tokio::test]
async fn test_static_site_reaches_running() {
    let fixture = Fixture::new("static: public\n");
    fixture.write_source("public/index.html", "<h1>hello</h1>\n");
    let platform = fixture.platform();
    platform.create("blog").unwrap();
    platform
        .set_environment("blog", [("NGINX_SERVER_NAME", "blog.example.com")])
        .await
        .unwrap();

    let report = platform.deploy("blog", "r1").await.unwrap();

    assert_eq!(report.transitions, HAPPY_PATH);
    assert_eq!(report.final_stage, DeployStage::Running);
    assert_eq!(report.builder, "Static");
    assert!(report.units.is_empty());

    let conf = String::from_utf8(read(&fixture.nginx_conf())).unwrap();
    assert!(conf.contains("server_name blog.example.com;"));
    assert!(conf.contains(&fixture.app().src_path().join("public").display().to_string()));

    let nginx = fixture.config().paths.nginx();
    assert!(nginx.join("blog.crt").exists());
    assert!(nginx.join("blog.key").exists());

    let record = fixture.app().current_revision().unwrap();
    assert_eq!(record.revision, "r1");
    assert_eq!(record.builder, "Static");
    assert_eq!(record.deploy_id, report.deploy_id);
    assert!(!fixture.config().paths.staging().join("blog").exists());
}

#[tokio::test]
async fn test_redeploy_renders_identical_files() {
    let fixture = Fixture::new("build: echo built > built.txt\nweb: ./server --port $PORT\n");
    let platform = fixture.platform();

    let first = platform.deploy("blog", "r1").await.unwrap();
    assert_eq!(first.builder, "Procfile");
    assert_eq!(first.units, vec!["blog_web.1.ini"]);
    assert!(fixture.app().src_path().join("built.txt").exists());

    let conf = read(&fixture.nginx_conf());
    let unit = read(&fixture.enabled("blog_web.1.ini"));
    assert_eq!(unit, read(&fixture.available("blog_web.1.ini")));
    let port = platform.live_environment("blog").unwrap().get("PORT").unwrap().to_string();

    platform.deploy("blog", "r1").await.unwrap();

    assert_eq!(read(&fixture.nginx_conf()), conf);
    assert_eq!(read(&fixture.enabled("blog_web.1.ini")), unit);
    assert_eq!(platform.live_environment("blog").unwrap().get("PORT"), Some(port.as_str()));
}

#[tokio::test]
async fn test_failed_build_keeps_live_configuration() {
    let fixture = Fixture::new("build: true\nweb: ./server\n");
    let platform = fixture.platform();
    platform.deploy("blog", "r1").await.unwrap();
    let unit = read(&fixture.enabled("blog_web.1.ini"));
    let live_env = read(&fixture.app().live_env_file());

    fixture.write_source("Procfile", "build: exit 3\nweb: ./server\nworker: ./queue\n");
    let err = platform.deploy("blog", "r2").await.unwrap_err();

    assert_eq!(err.stage, DeployStage::Building);
    assert_eq!(err.code(), DeployErrorCode::Build);
    assert_eq!(read(&fixture.enabled("blog_web.1.ini")), unit);
    assert!(!fixture.enabled("blog_worker.1.ini").exists());
    assert_eq!(read(&fixture.app().live_env_file()), live_env);
    assert_eq!(fixture.app().current_revision().unwrap().revision, "r1");
}

#[tokio::test]
async fn test_failed_hook_is_reported() {
    let fixture = Fixture::new("prebuild: echo nope >&2; exit 1\nstatic: .\n");
    let err = fixture.platform().deploy("blog", "r1").await.unwrap_err();

    assert_eq!(err.stage, DeployStage::Building);
    assert_eq!(err.code(), DeployErrorCode::HookFailed);
    assert!(err.to_string().contains("prebuild"));
    assert!(fixture.app().current_revision().is_none());
}

#[tokio::test]
async fn test_release_hook_runs_in_checkout() {
    let fixture = Fixture::new("release: echo $APP > released.txt\nweb: ./server\n");
    let report = fixture.platform().deploy("blog", "r1").await.unwrap();

    assert_eq!(report.builder, "Generic");
    let released = fixture.app().src_path().join("released.txt");
    assert_eq!(std::fs::read_to_string(released).unwrap().trim(), "blog");
}

#[tokio::test]
async fn test_bad_manifests_abort() {
    let fixture = Fixture::new("web ./server\n");
    let err = fixture.platform().deploy("blog", "r1").await.unwrap_err();
    assert_eq!(err.stage, DeployStage::Building);
    assert_eq!(err.code(), DeployErrorCode::ManifestParse);

    fixture.write_source("Procfile", "# nothing yet\n");
    let err = fixture.platform().deploy("blog", "r1").await.unwrap_err();
    assert_eq!(err.code(), DeployErrorCode::NoWorkers);

    fixture.write_source("Procfile", "worker: ./queue\n");
    let err = fixture.platform().deploy("blog", "r1").await.unwrap_err();
    assert_eq!(err.code(), DeployErrorCode::NoBuilder);
    assert!(!fixture.nginx_conf().exists());
}

#[tokio::test]
async fn test_concurrent_deploys_are_serialized() {
    let fixture = Fixture::new("build: sleep 0.2\nweb: ./server\n");
    let stages = Arc::new(Mutex::new(Vec::new()));
    let seen = stages.clone();
    let deployer = Deployer::new(Arc::new(fixture.config()))
        .with_source(DirectorySource::new(fixture.source.path()))
        .with_progress(Progress::new(move |_app, event| {
            if let Event::Stage(stage) = event {
                seen.lock().unwrap().push(*stage);
            }
        }));

    let (first, second) = tokio::join!(
        deployer.deploy("blog", "r1", "refs/heads/main"),
        deployer.deploy("blog", "r2", "refs/heads/main"),
    );
    first.unwrap();
    second.unwrap();

    let stages: Vec<DeployStage> = stages
        .lock()
        .unwrap()
        .iter()
        .copied()
        .filter(|s| *s != DeployStage::Received)
        .collect();
    assert_eq!(stages, [&HAPPY_PATH[1..], &HAPPY_PATH[1..]].concat());
}

#[tokio::test]
async fn test_reject_mode_fails_fast() {
    let fixture = Fixture::new("static: .\n");
    let mut config = fixture.config();
    config.deploy.lock_mode = LockMode::Reject;
    let platform = fixture.platform_with(config);
    let app = platform.create("blog").unwrap();

    let _held = AppLock::try_acquire("blog", &app.lock_file()).unwrap();
    let err = platform.deploy("blog", "r1").await.unwrap_err();

    assert!(err.is_lock_contention());
    assert_eq!(err.stage, DeployStage::Received);
}

#[tokio::test]
async fn test_failed_reload_rolls_back() {
    let fixture = Fixture::new("build: true\nweb: ./server\n");
    fixture.platform().deploy("blog", "r1").await.unwrap();
    let unit = read(&fixture.enabled("blog_web.1.ini"));

    let mut config = fixture.config();
    config.proxy.reload_command = vec!["true".to_string()];
    config.supervisor.reload_command = vec!["false".to_string()];
    let platform = fixture.platform_with(config);
    platform.set_environment("blog", [("GREETING", "hi")]).await.unwrap();
    fixture.write_source("Procfile", "build: true\nweb: ./server\nworker: ./queue\n");

    let err = platform.deploy("blog", "r2").await.unwrap_err();

    assert_eq!(err.stage, DeployStage::Activating);
    assert_eq!(err.code(), DeployErrorCode::Activation);
    assert_eq!(read(&fixture.enabled("blog_web.1.ini")), unit);
    assert!(!fixture.enabled("blog_worker.1.ini").exists());
    assert!(!fixture.available("blog_worker.1.ini").exists());
    assert_eq!(fixture.app().current_revision().unwrap().revision, "r1");
}

#[tokio::test]
async fn test_removed_workers_lose_their_units() {
    let fixture = Fixture::new("build: true\nweb: ./server\nworker: ./queue\n");
    let platform = fixture.platform();
    platform.deploy("blog", "r1").await.unwrap();
    assert!(fixture.enabled("blog_worker.1.ini").exists());

    fixture.write_source("Procfile", "build: true\nweb: ./server\n");
    let report = platform.deploy("blog", "r2").await.unwrap();

    assert_eq!(report.units, vec!["blog_web.1.ini"]);
    assert!(!fixture.enabled("blog_worker.1.ini").exists());
    assert!(!fixture.available("blog_worker.1.ini").exists());
}

#[tokio::test]
async fn test_stop_and_restart() {
    let fixture = Fixture::new("build: true\nweb: ./server\n");
    let platform = fixture.platform();
    platform.deploy("blog", "r1").await.unwrap();

    platform.stop("blog").await.unwrap();
    assert!(!fixture.enabled("blog_web.1.ini").exists());
    assert!(fixture.available("blog_web.1.ini").exists());
    assert!(fixture.nginx_conf().exists());

    let report = platform.restart("blog").await.unwrap();
    assert_eq!(
        report.transitions,
        [
            DeployStage::Received,
            DeployStage::Configuring,
            DeployStage::Activating,
            DeployStage::Running,
        ]
    );
    assert_eq!(report.revision, "r1");
    assert_eq!(report.builder, "Procfile");
    assert!(fixture.enabled("blog_web.1.ini").exists());
}

#[tokio::test]
async fn test_restart_requires_a_deploy() {
    let fixture = Fixture::new("static: .\n");
    let platform = fixture.platform();
    platform.create("blog").unwrap();

    let err = platform.restart("blog").await.unwrap_err();
    assert_eq!(err.code(), DeployErrorCode::Activation);
}

#[tokio::test]
async fn test_restart_after_failed_deploy_restores_running_revision() {
    let fixture = Fixture::new("build: true\nweb: ./server\n");
    fixture.write_source("r1/Procfile", "build: echo r1 > built.txt\nweb: ./server\n");
    fixture.write_source("r2/Procfile", "build: exit 3\nweb: ./server\nworker: ./queue\n");
    let platform = fixture.platform();
    platform.deploy("blog", "r1").await.unwrap();
    platform.deploy("blog", "r2").await.unwrap_err();

    let src = fixture.app().src_path();
    assert!(std::fs::read_to_string(src.join("Procfile")).unwrap().contains("worker"));
    assert_eq!(fixture.app().checked_out().as_deref(), Some("r2"));

    let report = platform.restart("blog").await.unwrap();

    assert_eq!(report.revision, "r1");
    assert_eq!(report.transitions, HAPPY_PATH);
    assert_eq!(report.units, vec!["blog_web.1.ini"]);
    assert!(!fixture.enabled("blog_worker.1.ini").exists());
    assert!(!fixture.available("blog_worker.1.ini").exists());
    assert!(!std::fs::read_to_string(src.join("Procfile")).unwrap().contains("worker"));
    assert_eq!(std::fs::read_to_string(src.join("built.txt")).unwrap().trim(), "r1");
    assert_eq!(fixture.app().checked_out().as_deref(), Some("r1"));
}

#[tokio::test]
async fn test_build_timeout_fails_the_deploy() {
    let fixture = Fixture::new("build: true\nweb: ./server\n");
    let mut config = fixture.config();
    config.deploy.build_timeout_secs = Some(1);
    let platform = fixture.platform_with(config);
    platform.deploy("blog", "r1").await.unwrap();
    let conf = read(&fixture.nginx_conf());
    let unit = read(&fixture.enabled("blog_web.1.ini"));

    fixture.write_source("Procfile", "build: sleep 5\nweb: ./server\nworker: ./queue\n");
    let started = Instant::now();
    let err = platform.deploy("blog", "r2").await.unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(err.stage, DeployStage::Building);
    assert_eq!(err.code(), DeployErrorCode::Build);
    assert!(err.to_string().contains("timed out after 1s"));
    assert_eq!(read(&fixture.nginx_conf()), conf);
    assert_eq!(read(&fixture.enabled("blog_web.1.ini")), unit);
    assert!(!fixture.enabled("blog_worker.1.ini").exists());
    assert_eq!(fixture.app().current_revision().unwrap().revision, "r1");
}

#[tokio::test]
async fn test_scale_rewrites_units() {
    let fixture = Fixture::new("build: true\nweb: ./server\nworker: ./queue\n");
    let platform = fixture.platform();
    platform.deploy("blog", "r1").await.unwrap();

    let report = platform.scale("blog", &[("worker".to_string(), 3)]).await.unwrap();

    assert_eq!(
        report.units,
        vec![
            "blog_web.1.ini",
            "blog_worker.1.ini",
            "blog_worker.2.ini",
            "blog_worker.3.ini"
        ]
    );
    assert!(fixture.enabled("blog_worker.3.ini").exists());
    let scaling = std::fs::read_to_string(fixture.app().scaling_file()).unwrap();
    assert!(scaling.contains("worker:3"));

    platform.scale("blog", &[("worker".to_string(), 0)]).await.unwrap();
    assert!(!fixture.enabled("blog_worker.1.ini").exists());
}

#[tokio::test]
async fn test_addon_url_reaches_units() {
    let fixture = Fixture::new("build: true\nweb: ./server\n");
    let platform = fixture.platform();
    let app = platform.create("blog").unwrap();
    platform
        .deployer()
        .addons()
        .attach(&app, "postgres", "postgres://db.internal/blog")
        .unwrap();

    platform.deploy("blog", "r1").await.unwrap();

    let unit = String::from_utf8(read(&fixture.enabled("blog_web.1.ini"))).unwrap();
    assert!(unit.contains("env = DATABASE_URL=postgres://db.internal/blog"));
}
