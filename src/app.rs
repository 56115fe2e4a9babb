//! Applications and their on-disk layout

use crate::config::PathsConfig;
use crate::settings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid app name '{0}': use letters, digits, '.', '_' or '-'")]
    InvalidName(String),

    #[error("app '{0}' not found")]
    NotFound(String),

    #[error("I/O error for app '{app}': {source}")]
    Io {
        app: String,
        #[source]
        source: std::io::Error,
    },
}

/// Record of the revision an app is currently running, written after a
/// successful deploy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionRecord {
    pub revision: String,
    pub refname: String,
    pub deploy_id: String,
    pub builder: String,
    pub deployed_at: chrono::DateTime<chrono::Utc>,
}

/// A deployed (or deployable) application.
///
/// The name is validated once and maps to the same set of paths for the
/// app's whole lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct App {
    name: String,
    app_path: PathBuf,
    repo_path: PathBuf,
}

impl App {
    pub fn new(name: &str, paths: &PathsConfig) -> Result<Self, AppError> {
        validate_name(name)?;
        Ok(Self {
            name: name.to_string(),
            app_path: paths.apps().join(name),
            repo_path: paths.repos().join(format!("{}.git", name)),
        })
    }

    /// Like [`App::new`] but fails if the app directory does not exist
    pub fn existing(name: &str, paths: &PathsConfig) -> Result<Self, AppError> {
        let app = Self::new(name, paths)?;
        if !app.exists() {
            return Err(AppError::NotFound(name.to_string()));
        }
        Ok(app)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exists(&self) -> bool {
        self.app_path.is_dir()
    }

    /// Root of the app's directory tree
    pub fn app_path(&self) -> &Path {
        &self.app_path
    }

    /// Bare repository receiving pushes
    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Checked-out source tree
    pub fn src_path(&self) -> PathBuf {
        self.app_path.join("src")
    }

    /// Build artifacts (virtualenv, node_modules prefix, toolchains)
    pub fn env_path(&self) -> PathBuf {
        self.app_path.join("env")
    }

    /// Persistent data, kept across redeploys
    pub fn data_path(&self) -> PathBuf {
        self.app_path.join("data")
    }

    pub fn log_path(&self) -> PathBuf {
        self.app_path.join("log")
    }

    /// Operator settings
    pub fn settings_file(&self) -> PathBuf {
        self.app_path.join("ENV")
    }

    /// Environment snapshot of the last successful deploy
    pub fn live_env_file(&self) -> PathBuf {
        self.app_path.join("LIVE_ENV")
    }

    /// Worker instance counts (`kind:count`)
    pub fn scaling_file(&self) -> PathBuf {
        self.app_path.join("SCALING")
    }

    pub fn revision_file(&self) -> PathBuf {
        self.app_path.join("REVISION")
    }

    /// Revision currently checked out in `src`, which may be a failed one
    pub fn checkout_file(&self) -> PathBuf {
        self.app_path.join("CHECKOUT")
    }

    pub fn addons_path(&self) -> PathBuf {
        self.app_path.join("addons")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.app_path.join(".deploy.lock")
    }

    /// Create the app's directory tree. Existing directories are kept.
    pub fn create(&self) -> Result<(), AppError> {
        for dir in [
            self.app_path.clone(),
            self.src_path(),
            self.env_path(),
            self.data_path(),
            self.log_path(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|source| self.io(source))?;
        }
        info!(app = %self.name, path = %self.app_path.display(), "App directory ready");
        Ok(())
    }

    /// Revision currently running, if any
    pub fn current_revision(&self) -> Option<RevisionRecord> {
        let content = std::fs::read_to_string(self.revision_file()).ok()?;
        serde_json::from_str(&content).ok()
    }

    pub fn write_revision(&self, record: &RevisionRecord) -> Result<(), AppError> {
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| self.io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        settings::write_atomic(&self.revision_file(), &json).map_err(|source| self.io(source))
    }

    /// Revision in `src`. None when unknown or when a checkout was interrupted.
    pub fn checked_out(&self) -> Option<String> {
        let content = std::fs::read_to_string(self.checkout_file()).ok()?;
        Some(content.trim().to_string()).filter(|rev| !rev.is_empty())
    }

    /// Record the revision in `src`. `None` marks it unknown.
    pub fn mark_checkout(&self, revision: Option<&str>) -> Result<(), AppError> {
        let path = self.checkout_file();
        match revision {
            Some(revision) => settings::write_atomic(&path, format!("{}\n", revision).as_bytes()),
            None if path.exists() => std::fs::remove_file(&path),
            None => Ok(()),
        }
        .map_err(|source| self.io(source))
    }

    pub(crate) fn io(&self, source: std::io::Error) -> AppError {
        AppError::Io {
            app: self.name.clone(),
            source,
        }
    }
}

fn validate_name(name: &str) -> Result<(), AppError> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(AppError::InvalidName(name.to_string()))
    }
}

/// Normalize a name received over the wire (`'blog.git'`, `/blog`) to an app name
pub fn sanitize_app_name(raw: &str) -> String {
    raw.trim_matches(|c: char| c == '\'' || c == '"' || c == '/' || c.is_whitespace())
        .trim_end_matches(".git")
        .to_string()
}

/// All apps, sorted by name
pub fn list_apps(paths: &PathsConfig) -> std::io::Result<Vec<App>> {
    let apps_dir = paths.apps();
    if !apps_dir.exists() {
        return Ok(Vec::new());
    }

    let mut names = Vec::new();
    for entry in std::fs::read_dir(&apps_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();

    Ok(names
        .iter()
        .filter_map(|name| App::new(name, paths).ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_valid_names() {
        let paths = PathsConfig::rooted("/srv");
        for name in ["blog", "my-app", "api_v2", "site.example.com", "A1"] {
            assert!(App::new(name, &paths).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn test_invalid_names() {
        let paths = PathsConfig::rooted("/srv");
        for name in ["", "../etc", "a/b", "with space", ".hidden", "semi;colon"] {
            assert!(
                matches!(App::new(name, &paths), Err(AppError::InvalidName(_))),
                "{name:?} should be invalid"
            );
        }
    }

    #[test]
    fn test_paths_are_stable() {
        let paths = PathsConfig::rooted("/srv");
        let app = App::new("blog", &paths).unwrap();
        assert_eq!(app.app_path(), Path::new("/srv/apps/blog"));
        assert_eq!(app.repo_path(), Path::new("/srv/repos/blog.git"));
        assert_eq!(app.src_path(), PathBuf::from("/srv/apps/blog/src"));
        assert_eq!(app.settings_file(), PathBuf::from("/srv/apps/blog/ENV"));
        assert_eq!(App::new("blog", &paths).unwrap(), app);
    }

    #[test]
    fn test_create_and_list() {
        let dir = TempDir::new().unwrap();
        let paths = PathsConfig::rooted(dir.path());

        for name in ["zeta", "alpha"] {
            App::new(name, &paths).unwrap().create().unwrap();
        }

        let names: Vec<_> = list_apps(&paths)
            .unwrap()
            .iter()
            .map(|a| a.name().to_string())
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert!(App::existing("alpha", &paths).is_ok());
        assert!(matches!(App::existing("nope", &paths), Err(AppError::NotFound(_))));
    }

    #[test]
    fn test_revision_record_roundtrip() {
        let dir = TempDir::new().unwrap();
        let paths = PathsConfig::rooted(dir.path());
        let app = App::new("blog", &paths).unwrap();
        app.create().unwrap();
        assert!(app.current_revision().is_none());

        let record = RevisionRecord {
            revision: "abc123".to_string(),
            refname: "refs/heads/main".to_string(),
            deploy_id: "d1".to_string(),
            builder: "Python".to_string(),
            deployed_at: chrono::Utc::now(),
        };
        app.write_revision(&record).unwrap();
        assert_eq!(app.current_revision(), Some(record));
    }

    #[test]
    fn test_checkout_marker() {
        let dir = TempDir::new().unwrap();
        let app = App::new("blog", &PathsConfig::rooted(dir.path())).unwrap();
        app.create().unwrap();
        assert_eq!(app.checked_out(), None);

        app.mark_checkout(Some("abc123")).unwrap();
        assert_eq!(app.checked_out().as_deref(), Some("abc123"));

        app.mark_checkout(None).unwrap();
        assert_eq!(app.checked_out(), None);
        app.mark_checkout(None).unwrap();
    }

    #[test]
    fn test_sanitize_app_name() {
        assert_eq!(sanitize_app_name("'blog.git'"), "blog");
        assert_eq!(sanitize_app_name("/blog"), "blog");
        assert_eq!(sanitize_app_name("blog"), "blog");
    }
}
