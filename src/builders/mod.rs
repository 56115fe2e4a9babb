//! Build strategies, one per language ecosystem
//!
//! Each builder answers two questions: does it recognise a source tree
//! ([`Builder::accept`], a pure check of the files present), and how to build
//! it ([`Builder::build`]). The registry tries builders in a fixed order and
//! the first one that accepts wins:
//!
//! 1. Procfile `build` hook (the app builds itself)
//! 2. Python (`requirements.txt`, `pyproject.toml`)
//! 3. Ruby (`Gemfile`)
//! 4. Node (`package.json`)
//! 5. Clojure (`project.clj`, `deps.edn`)
//! 6. Go (`go.mod`, `Godeps/`, `*.go`)
//! 7. Rust (`Cargo.toml`)
//! 8. PHP (`composer.json`)
//! 9. Generic (Procfile has `release` and `web`)
//! 10. Static (Procfile has a `static` worker)

mod clojure;
mod generic;
mod go;
mod node;
mod php;
mod python;
mod ruby;
mod rust;

pub use clojure::ClojureBuilder;
pub use generic::{GenericBuilder, ProcfileBuilder, StaticBuilder};
pub use go::GoBuilder;
pub use node::NodeBuilder;
pub use php::PhpBuilder;
pub use python::PythonBuilder;
pub use ruby::RubyBuilder;
pub use rust::RustBuilder;

use crate::app::App;
use crate::env::Env;
use crate::events::{Event, Progress};
use crate::procfile::Procfile;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Number of trailing output lines kept in error diagnostics
const DIAGNOSTIC_LINES: usize = 40;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("no builder accepted the source tree")]
    NoBuilder,

    #[error("{builder} build needs missing binaries: {}", missing.join(", "))]
    MissingBinaries {
        builder: String,
        missing: Vec<String>,
    },

    #[error("{builder} build failed: `{command}` {status}\n{output}")]
    Command {
        builder: String,
        command: String,
        status: String,
        output: String,
    },

    #[error("{name} hook failed: `{command}` {status}\n{output}")]
    Hook {
        name: String,
        command: String,
        status: String,
        output: String,
    },

    #[error("{builder} build timed out after {secs}s")]
    Timeout { builder: String, secs: u64 },

    #[error("{builder} build I/O error: {source}")]
    Io {
        builder: String,
        #[source]
        source: std::io::Error,
    },
}

/// What a builder looks at when deciding whether it applies
#[derive(Debug, Clone, Copy)]
pub struct SourceTree<'a> {
    pub path: &'a Path,
    pub manifest: &'a Procfile,
}

impl<'a> SourceTree<'a> {
    pub fn new(path: &'a Path, manifest: &'a Procfile) -> Self {
        Self { path, manifest }
    }

    /// True if any of `files` exists at the top of the tree
    pub fn has_any(&self, files: &[&str]) -> bool {
        files.iter().any(|f| self.path.join(f).exists())
    }

    /// True if a top-level file has the given extension
    pub fn has_extension(&self, ext: &str) -> bool {
        std::fs::read_dir(self.path)
            .map(|entries| {
                entries.flatten().any(|entry| {
                    let path = entry.path();
                    path.is_file() && path.extension().is_some_and(|e| e == ext)
                })
            })
            .unwrap_or(false)
    }
}

/// Everything a build needs
pub struct BuildContext<'a> {
    pub app: &'a App,
    pub manifest: &'a Procfile,
    /// Environment for build commands (platform defaults, builder
    /// contributions, addons and operator settings)
    pub env: &'a Env,
    pub progress: &'a Progress,
}

impl BuildContext<'_> {
    pub fn src_path(&self) -> PathBuf {
        self.app.src_path()
    }

    /// Run a shell command in the checkout on behalf of `builder`
    pub async fn shell(&self, builder: &str, command: &str) -> Result<Vec<String>, BuildError> {
        self.shell_in(builder, command, &self.src_path()).await
    }

    pub async fn shell_in(
        &self,
        builder: &str,
        command: &str,
        cwd: &Path,
    ) -> Result<Vec<String>, BuildError> {
        exec(self.app.name(), command, cwd, self.env, self.progress)
            .await
            .map_err(|failure| failure.into_build_error(builder, command))
    }

    pub fn emit(&self, event: Event) {
        self.progress.emit(self.app.name(), event);
    }
}

/// Outcome of a successful build
#[derive(Debug, Clone)]
pub struct BuildResult {
    pub builder: String,
    pub duration_secs: f64,
    pub logs: Vec<String>,
}

/// A build strategy
#[async_trait]
pub trait Builder: Send + Sync {
    fn name(&self) -> &'static str;

    /// Binaries that must be on the PATH for [`Builder::build`] to work
    fn requirements(&self) -> &'static [&'static str] {
        &[]
    }

    /// Whether this builder applies to the tree. Must not touch anything.
    fn accept(&self, tree: &SourceTree<'_>) -> bool;

    /// Variables the app needs at build and run time. `base` is the
    /// platform environment they are layered on.
    fn env(&self, _app: &App, _base: &Env) -> Env {
        Env::new()
    }

    /// Build the app. Running it twice for the same revision must leave
    /// the build artifacts usable.
    async fn build(&self, ctx: &BuildContext<'_>) -> Result<Vec<String>, BuildError>;
}

/// Ordered list of builders
pub struct BuilderRegistry {
    builders: Vec<Box<dyn Builder>>,
}

impl Default for BuilderRegistry {
    fn default() -> Self {
        Self::new(vec![
            Box::new(ProcfileBuilder),
            Box::new(PythonBuilder),
            Box::new(RubyBuilder),
            Box::new(NodeBuilder),
            Box::new(ClojureBuilder),
            Box::new(GoBuilder),
            Box::new(RustBuilder),
            Box::new(PhpBuilder),
            Box::new(GenericBuilder),
            Box::new(StaticBuilder),
        ])
    }
}

impl BuilderRegistry {
    pub fn new(builders: Vec<Box<dyn Builder>>) -> Self {
        Self { builders }
    }

    /// Builder names in priority order
    pub fn names(&self) -> Vec<&'static str> {
        self.builders.iter().map(|b| b.name()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&dyn Builder> {
        self.builders
            .iter()
            .find(|b| b.name() == name)
            .map(|b| b.as_ref())
    }

    /// First builder accepting the tree
    pub fn select(&self, tree: &SourceTree<'_>) -> Result<&dyn Builder, BuildError> {
        self.builders
            .iter()
            .find(|b| b.accept(tree))
            .map(|b| b.as_ref())
            .ok_or(BuildError::NoBuilder)
    }

    /// Run `builder` after checking its required binaries are present
    pub async fn build(
        &self,
        builder: &dyn Builder,
        ctx: &BuildContext<'_>,
    ) -> Result<BuildResult, BuildError> {
        let start = Instant::now();
        let name = builder.name();

        check_binaries(name, builder.requirements(), ctx.env)?;

        ctx.emit(Event::Detected {
            builder: name.to_string(),
        });
        info!(app = %ctx.app.name(), builder = %name, "Starting build");

        let logs = builder.build(ctx).await?;
        let duration_secs = start.elapsed().as_secs_f64();

        info!(app = %ctx.app.name(), builder = %name, duration_secs, "Build completed");
        Ok(BuildResult {
            builder: name.to_string(),
            duration_secs,
            logs,
        })
    }
}

/// Fail with [`BuildError::MissingBinaries`] unless every binary is on the PATH
pub fn check_binaries(builder: &str, binaries: &[&str], env: &Env) -> Result<(), BuildError> {
    let missing: Vec<String> = binaries
        .iter()
        .filter(|bin| find_binary(bin, env).is_none())
        .map(|bin| bin.to_string())
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(BuildError::MissingBinaries {
            builder: builder.to_string(),
            missing,
        })
    }
}

/// Locate `name` on the PATH of `env`, falling back to the process PATH
pub fn find_binary(name: &str, env: &Env) -> Option<PathBuf> {
    let path_var = env
        .get("PATH")
        .map(str::to_string)
        .or_else(|| std::env::var("PATH").ok())?;

    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// `PATH` with `dirs` prepended to the one in `env` (or the process PATH)
pub fn prepend_path(dirs: &[PathBuf], env: &Env) -> String {
    let current = env
        .get("PATH")
        .map(str::to_string)
        .or_else(|| std::env::var("PATH").ok())
        .unwrap_or_default();

    let mut parts: Vec<String> = dirs.iter().map(|d| d.display().to_string()).collect();
    if !current.is_empty() {
        parts.push(current);
    }
    parts.join(":")
}

/// Run a Procfile hook (`prebuild`, `postbuild`, ...) in the checkout
pub async fn run_hook(
    app: &App,
    name: &str,
    command: &str,
    env: &Env,
    progress: &Progress,
) -> Result<Vec<String>, BuildError> {
    progress.emit(
        app.name(),
        Event::RunningHook {
            name: name.to_string(),
        },
    );
    exec(app.name(), command, &app.src_path(), env, progress)
        .await
        .map_err(|failure| match failure {
            ExecFailure::Status { status, output } => BuildError::Hook {
                name: name.to_string(),
                command: command.to_string(),
                status,
                output,
            },
            ExecFailure::Io(source) => BuildError::Io {
                builder: name.to_string(),
                source,
            },
        })
}

enum ExecFailure {
    Status { status: String, output: String },
    Io(std::io::Error),
}

impl ExecFailure {
    fn into_build_error(self, builder: &str, command: &str) -> BuildError {
        match self {
            ExecFailure::Status { status, output } => BuildError::Command {
                builder: builder.to_string(),
                command: command.to_string(),
                status,
                output,
            },
            ExecFailure::Io(source) => BuildError::Io {
                builder: builder.to_string(),
                source,
            },
        }
    }
}

/// Run `command` through `sh -c`, streaming output lines as progress events
async fn exec(
    app: &str,
    command: &str,
    cwd: &Path,
    env: &Env,
    progress: &Progress,
) -> Result<Vec<String>, ExecFailure> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(cwd)
        .envs(env.iter())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(app = %app, command = %command, cwd = %cwd.display(), "Running");

    let mut child = cmd.spawn().map_err(ExecFailure::Io)?;
    let mut logs = Vec::new();

    if let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) {
        let mut stdout_reader = BufReader::new(stdout).lines();
        let mut stderr_reader = BufReader::new(stderr).lines();
        let mut stdout_open = true;
        let mut stderr_open = true;

        while stdout_open || stderr_open {
            tokio::select! {
                line = stdout_reader.next_line(), if stdout_open => {
                    match line {
                        Ok(Some(line)) => {
                            progress.emit(app, Event::Output(line.clone()));
                            logs.push(line);
                        }
                        Ok(None) => stdout_open = false,
                        Err(e) => {
                            warn!("Error reading stdout: {}", e);
                            stdout_open = false;
                        }
                    }
                }
                line = stderr_reader.next_line(), if stderr_open => {
                    match line {
                        Ok(Some(line)) => {
                            progress.emit(app, Event::Output(line.clone()));
                            logs.push(line);
                        }
                        Ok(None) => stderr_open = false,
                        Err(e) => {
                            warn!("Error reading stderr: {}", e);
                            stderr_open = false;
                        }
                    }
                }
            }
        }
    }

    let status = child.wait().await.map_err(ExecFailure::Io)?;
    if status.success() {
        return Ok(logs);
    }

    let status = match status.code() {
        Some(code) => format!("exited with code {}", code),
        None => "was terminated by a signal".to_string(),
    };
    let skip = logs.len().saturating_sub(DIAGNOSTIC_LINES);
    Err(ExecFailure::Status {
        status,
        output: logs[skip..].join("\n"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathsConfig;
    use std::fs;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    fn select_for(files: &[&str], procfile: &str) -> Result<&'static str, BuildError> {
        let dir = TempDir::new().unwrap();
        for file in files {
            let path = dir.path().join(file);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            if file.ends_with('/') {
                fs::create_dir_all(&path).unwrap();
            } else {
                fs::write(&path, "").unwrap();
            }
        }
        let manifest = Procfile::parse(procfile).unwrap();
        let registry = BuilderRegistry::default();
        let tree = SourceTree::new(dir.path(), &manifest);
        registry.select(&tree).map(|b| b.name())
    }

    #[test]
    fn test_priority_order() {
        assert_eq!(
            BuilderRegistry::default().names(),
            vec![
                "Procfile", "Python", "Ruby", "Node", "Clojure", "Go", "Rust", "PHP", "Generic",
                "Static"
            ]
        );
    }

    #[test]
    fn test_detects_each_ecosystem() {
        assert_eq!(select_for(&["requirements.txt"], "web: x").unwrap(), "Python");
        assert_eq!(select_for(&["pyproject.toml"], "web: x").unwrap(), "Python");
        assert_eq!(select_for(&["Gemfile"], "web: x").unwrap(), "Ruby");
        assert_eq!(select_for(&["package.json"], "web: x").unwrap(), "Node");
        assert_eq!(select_for(&["deps.edn"], "web: x").unwrap(), "Clojure");
        assert_eq!(select_for(&["project.clj"], "web: x").unwrap(), "Clojure");
        assert_eq!(select_for(&["main.go"], "web: x").unwrap(), "Go");
        assert_eq!(select_for(&["go.mod"], "web: x").unwrap(), "Go");
        assert_eq!(select_for(&["Godeps/"], "web: x").unwrap(), "Go");
        assert_eq!(select_for(&["Cargo.toml"], "web: x").unwrap(), "Rust");
        assert_eq!(select_for(&["composer.json"], "web: x").unwrap(), "PHP");
    }

    #[test]
    fn test_node_wins_over_stray_go_file() {
        assert_eq!(
            select_for(&["package.json", "tools.go"], "web: node server.js").unwrap(),
            "Node"
        );
    }

    #[test]
    fn test_python_wins_over_node() {
        assert_eq!(
            select_for(&["requirements.txt", "package.json"], "web: x").unwrap(),
            "Python"
        );
    }

    #[test]
    fn test_build_hook_takes_precedence() {
        assert_eq!(
            select_for(&["package.json"], "build: make\nweb: ./server").unwrap(),
            "Procfile"
        );
    }

    #[test]
    fn test_generic_and_static_fallbacks() {
        assert_eq!(
            select_for(&[], "release: ./migrate\nweb: ./server").unwrap(),
            "Generic"
        );
        assert_eq!(select_for(&[], "static: public").unwrap(), "Static");
    }

    #[test]
    fn test_no_builder() {
        assert!(matches!(
            select_for(&["README.md"], "web: ./server"),
            Err(BuildError::NoBuilder)
        ));
    }

    #[test]
    fn test_accept_does_not_touch_tree() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("package.json"), "{}").unwrap();
        let manifest = Procfile::parse("web: x").unwrap();
        let tree = SourceTree::new(dir.path(), &manifest);

        for builder in BuilderRegistry::default().builders.iter() {
            builder.accept(&tree);
        }
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().flatten().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_missing_binaries() {
        let env = Env::from_pairs([("PATH", "/nonexistent")]);
        let err = check_binaries("Rust", &["cargo", "rustc"], &env).unwrap_err();
        match err {
            BuildError::MissingBinaries { missing, .. } => {
                assert_eq!(missing, vec!["cargo", "rustc"]);
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn test_prepend_path() {
        let env = Env::from_pairs([("PATH", "/usr/bin")]);
        let path = prepend_path(&[PathBuf::from("/app/env/bin")], &env);
        assert_eq!(path, "/app/env/bin:/usr/bin");
    }

    #[tokio::test]
    async fn test_hook_output_and_failure() {
        let dir = TempDir::new().unwrap();
        let app = App::new("blog", &PathsConfig::rooted(dir.path())).unwrap();
        app.create().unwrap();

        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let progress = Progress::new(move |_, event| {
            if let Event::Output(line) = event {
                sink.lock().unwrap().push(line.clone());
            }
        });
        let env = Env::from_pairs([("GREETING", "hello")]);

        let logs = run_hook(&app, "prebuild", "echo $GREETING; echo oops >&2", &env, &progress)
            .await
            .unwrap();
        assert!(logs.contains(&"hello".to_string()));
        assert!(logs.contains(&"oops".to_string()));
        assert_eq!(lines.lock().unwrap().len(), 2);

        let err = run_hook(&app, "postbuild", "echo broken; exit 3", &env, &progress)
            .await
            .unwrap_err();
        match err {
            BuildError::Hook { name, status, output, .. } => {
                assert_eq!(name, "postbuild");
                assert!(status.contains('3'));
                assert!(output.contains("broken"));
            }
            other => panic!("unexpected: {other}"),
        }
    }
}
