//! Git push-to-deploy plumbing
//!
//! Each app has a bare repository under `repos/<app>.git` whose
//! `post-receive` hook feeds the pushed refs back to `launchpad git-hook`.
//! Deploys then bring the app's `src` checkout to the pushed revision
//! through a [`SourceControl`] implementation.

use crate::app::App;
use async_trait::async_trait;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Revision git reports for a ref that did not exist or was deleted
const NULL_REVISION: &str = "0000000000000000000000000000000000000000";

#[derive(Debug, Error)]
pub enum VcsError {
    #[error("malformed push line {line_number}: '{line}' (expected '<old> <new> <ref>')")]
    MalformedPushLine { line_number: usize, line: String },

    #[error("`git {args}` failed: {output}")]
    Git { args: String, output: String },

    #[error("no repository for app '{0}'")]
    MissingRepo(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One ref update of a push
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushUpdate {
    pub old: String,
    pub new: String,
    pub refname: String,
}

impl PushUpdate {
    /// True when the push deleted the ref
    pub fn is_delete(&self) -> bool {
        self.new == NULL_REVISION
    }

    /// Branch name for `refs/heads/*` refs
    pub fn branch(&self) -> Option<&str> {
        self.refname.strip_prefix("refs/heads/")
    }
}

/// Parse the `<old> <new> <ref>` lines git hands to `post-receive`
pub fn parse_push<R: BufRead>(reader: R) -> Result<Vec<PushUpdate>, VcsError> {
    let mut updates = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(|source| VcsError::Io {
            path: PathBuf::from("<stdin>"),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        let [old, new, refname] = parts[..] else {
            return Err(VcsError::MalformedPushLine {
                line_number: index + 1,
                line,
            });
        };
        if !is_revision(old) || !is_revision(new) {
            return Err(VcsError::MalformedPushLine {
                line_number: index + 1,
                line,
            });
        }

        updates.push(PushUpdate {
            old: old.to_string(),
            new: new.to_string(),
            refname: refname.to_string(),
        });
    }
    Ok(updates)
}

fn is_revision(s: &str) -> bool {
    !s.is_empty() && s.len() <= 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Brings an app's checkout to a given revision
#[async_trait]
pub trait SourceControl: Send + Sync {
    async fn checkout(&self, app: &App, revision: &str) -> Result<(), VcsError>;
}

/// Checkout from the app's bare repository with the `git` binary
#[derive(Debug, Default, Clone)]
pub struct GitCheckout;

#[async_trait]
impl SourceControl for GitCheckout {
    async fn checkout(&self, app: &App, revision: &str) -> Result<(), VcsError> {
        let repo = app.repo_path();
        if !repo.exists() {
            return Err(VcsError::MissingRepo(app.name().to_string()));
        }
        let src = app.src_path();

        if !src.join(".git").exists() {
            info!(app = %app.name(), "Cloning repository");
            std::fs::create_dir_all(&src).map_err(|source| VcsError::Io {
                path: src.clone(),
                source,
            })?;
            git(
                app.app_path(),
                &[
                    "clone",
                    "--quiet",
                    &repo.to_string_lossy(),
                    &src.to_string_lossy(),
                ],
            )
            .await?;
        }

        info!(app = %app.name(), revision = %revision, "Checking out revision");
        git(&src, &["fetch", "--quiet", "origin"]).await?;
        git(&src, &["reset", "--hard", revision]).await?;
        git(&src, &["submodule", "init"]).await?;
        git(&src, &["submodule", "update"]).await?;
        Ok(())
    }
}

/// Source taken from a plain directory instead of a repository. The
/// directory is copied over the app's checkout; `.git` is skipped. A
/// subdirectory named after the revision is used instead when present.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl SourceControl for DirectorySource {
    async fn checkout(&self, app: &App, revision: &str) -> Result<(), VcsError> {
        let from = match self.root.join(revision) {
            dir if !revision.is_empty() && dir.is_dir() => dir,
            _ => self.root.clone(),
        };
        let to = app.src_path();
        debug!(app = %app.name(), revision = %revision, from = %from.display(), "Copying source tree");
        tokio::task::spawn_blocking(move || {
            if to.exists() {
                std::fs::remove_dir_all(&to).map_err(|source| VcsError::Io {
                    path: to.clone(),
                    source,
                })?;
            }
            copy_tree(&from, &to)
        })
        .await
        .map_err(|e| VcsError::Io {
            path: self.root.clone(),
            source: std::io::Error::new(std::io::ErrorKind::Other, e),
        })?
    }
}

fn copy_tree(from: &Path, to: &Path) -> Result<(), VcsError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| VcsError::Io { path, source }
    };
    std::fs::create_dir_all(to).map_err(io_err(to))?;
    for entry in std::fs::read_dir(from).map_err(io_err(from))? {
        let entry = entry.map_err(io_err(from))?;
        let path = entry.path();
        if entry.file_name() == ".git" {
            continue;
        }
        let target = to.join(entry.file_name());
        if entry.file_type().map_err(io_err(&path))?.is_dir() {
            copy_tree(&path, &target)?;
        } else {
            std::fs::copy(&path, &target).map_err(io_err(&path))?;
        }
    }
    Ok(())
}

/// Create the app's bare repository and its `post-receive` hook.
///
/// `exe` is the launchpad binary the hook calls back into; `config` is
/// exported as `LAUNCHPAD_CONFIG` for it when set. Existing repositories
/// only get their hook rewritten.
pub async fn setup_repo(app: &App, exe: &Path, config: Option<&Path>) -> Result<(), VcsError> {
    let repo = app.repo_path();
    if !repo.join("HEAD").exists() {
        info!(app = %app.name(), path = %repo.display(), "Creating git repository");
        if let Some(parent) = repo.parent() {
            std::fs::create_dir_all(parent).map_err(|source| VcsError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let parent = repo.parent().unwrap_or(Path::new("/"));
        git(parent, &["init", "--quiet", "--bare", &repo.to_string_lossy()]).await?;
    }

    let hook_path = repo.join("hooks/post-receive");
    let io_err = |source| VcsError::Io {
        path: hook_path.clone(),
        source,
    };
    if let Some(hooks) = hook_path.parent() {
        std::fs::create_dir_all(hooks).map_err(io_err)?;
    }
    std::fs::write(&hook_path, hook_script(app.name(), exe, config)).map_err(io_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&hook_path, std::fs::Permissions::from_mode(0o755))
            .map_err(io_err)?;
    }
    Ok(())
}

/// Body of the `post-receive` hook
pub fn hook_script(app: &str, exe: &Path, config: Option<&Path>) -> String {
    let exe = shell_words::quote(&exe.to_string_lossy()).into_owned();
    let app = shell_words::quote(app).into_owned();
    let export = match config {
        Some(path) => format!(
            "export LAUNCHPAD_CONFIG={}\n",
            shell_words::quote(&path.to_string_lossy())
        ),
        None => String::new(),
    };
    format!(
        "#!/usr/bin/env bash\nset -e\nset -o pipefail\n{}cat | {} git-hook {}\n",
        export, exe, app
    )
}

/// Commit the bare repository's `HEAD` points at
pub async fn head_revision(app: &App) -> Result<String, VcsError> {
    let repo = app.repo_path();
    if !repo.exists() {
        return Err(VcsError::MissingRepo(app.name().to_string()));
    }
    git(repo, &["rev-parse", "HEAD"]).await
}

/// Serve a push over the current stdin/stdout (`git-receive-pack`)
pub async fn receive_pack(app: &App) -> Result<ExitStatus, VcsError> {
    pack_command("git-receive-pack", app).await
}

/// Serve a fetch over the current stdin/stdout (`git-upload-pack`)
pub async fn upload_pack(app: &App) -> Result<ExitStatus, VcsError> {
    pack_command("git-upload-pack", app).await
}

async fn pack_command(command: &str, app: &App) -> Result<ExitStatus, VcsError> {
    let repo = app.repo_path();
    if !repo.exists() {
        return Err(VcsError::MissingRepo(app.name().to_string()));
    }
    Command::new(command)
        .arg(repo)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await
        .map_err(|source| VcsError::Io {
            path: repo.to_path_buf(),
            source,
        })
}

/// Run git in `cwd`. Hooks run with `GIT_DIR` set, which must not leak
/// into commands aimed at the checkout.
async fn git(cwd: &Path, args: &[&str]) -> Result<String, VcsError> {
    debug!(cwd = %cwd.display(), args = ?args, "git");
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .env_remove("GIT_DIR")
        .env_remove("GIT_WORK_TREE")
        .env_remove("GIT_QUARANTINE_PATH")
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| VcsError::Io {
            path: cwd.to_path_buf(),
            source,
        })?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(VcsError::Git {
            args: args.join(" "),
            output: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathsConfig;
    use std::io::Cursor;
    use tempfile::TempDir;

    const OLD: &str = "0000000000000000000000000000000000000000";
    const NEW: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";

    #[test]
    fn test_parse_push() {
        let input = format!("{OLD} {NEW} refs/heads/main\n\n{NEW} {OLD} refs/heads/old\n");
        let updates = parse_push(Cursor::new(input)).unwrap();

        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].new, NEW);
        assert_eq!(updates[0].branch(), Some("main"));
        assert!(!updates[0].is_delete());
        assert!(updates[1].is_delete());
    }

    #[test]
    fn test_parse_push_malformed() {
        let err = parse_push(Cursor::new(format!("{OLD} {NEW}\n"))).unwrap_err();
        assert!(matches!(err, VcsError::MalformedPushLine { line_number: 1, .. }));

        let err = parse_push(Cursor::new(format!("{OLD} {NEW} refs/heads/main\nnot-a-rev {NEW} x\n")))
            .unwrap_err();
        assert!(matches!(err, VcsError::MalformedPushLine { line_number: 2, .. }));
    }

    #[test]
    fn test_hook_script() {
        let script = hook_script(
            "blog",
            Path::new("/usr/local/bin/launchpad"),
            Some(Path::new("/etc/launchpad/config.toml")),
        );
        assert!(script.starts_with("#!/usr/bin/env bash\n"));
        assert!(script.contains("export LAUNCHPAD_CONFIG=/etc/launchpad/config.toml\n"));
        assert!(script.ends_with("cat | /usr/local/bin/launchpad git-hook blog\n"));

        let script = hook_script("blog", Path::new("/opt/my tools/launchpad"), None);
        assert!(script.contains("'/opt/my tools/launchpad' git-hook blog"));
        assert!(!script.contains("LAUNCHPAD_CONFIG"));
    }

    #[tokio::test]
    async fn test_directory_source_replaces_checkout() {
        let dir = TempDir::new().unwrap();
        let app = App::new("blog", &PathsConfig::rooted(dir.path().join("root"))).unwrap();
        app.create().unwrap();
        std::fs::write(app.src_path().join("stale.txt"), "old").unwrap();

        let source = dir.path().join("source");
        std::fs::create_dir_all(source.join("public")).unwrap();
        std::fs::create_dir_all(source.join(".git")).unwrap();
        std::fs::write(source.join("Procfile"), "static: public\n").unwrap();
        std::fs::write(source.join("public/index.html"), "hi").unwrap();

        DirectorySource::new(&source).checkout(&app, "local").await.unwrap();

        assert!(app.src_path().join("Procfile").exists());
        assert!(app.src_path().join("public/index.html").exists());
        assert!(!app.src_path().join("stale.txt").exists());
        assert!(!app.src_path().join(".git").exists());
    }

    #[tokio::test]
    async fn test_directory_source_picks_revision_dir() {
        let dir = TempDir::new().unwrap();
        let app = App::new("blog", &PathsConfig::rooted(dir.path().join("root"))).unwrap();
        app.create().unwrap();

        let source = dir.path().join("source");
        for rev in ["r1", "r2"] {
            std::fs::create_dir_all(source.join(rev)).unwrap();
            std::fs::write(source.join(rev).join("Procfile"), format!("web: ./{}\n", rev)).unwrap();
        }
        let source = DirectorySource::new(&source);

        source.checkout(&app, "r2").await.unwrap();
        let procfile = app.src_path().join("Procfile");
        assert_eq!(std::fs::read_to_string(&procfile).unwrap(), "web: ./r2\n");
        source.checkout(&app, "r1").await.unwrap();
        assert_eq!(std::fs::read_to_string(&procfile).unwrap(), "web: ./r1\n");
        assert!(!app.src_path().join("r2").exists());
    }

    #[tokio::test]
    async fn test_checkout_without_repo() {
        let dir = TempDir::new().unwrap();
        let app = App::new("blog", &PathsConfig::rooted(dir.path())).unwrap();
        let err = GitCheckout.checkout(&app, NEW).await.unwrap_err();
        assert!(matches!(err, VcsError::MissingRepo(_)));
    }
}
