//! Procfile parsing
//!
//! A Procfile declares one worker per line as `name: command`. Some names are
//! reserved:
//! - `web`, `wsgi`, `jwsgi`, `rwsgi` serve HTTP
//! - `prebuild`, `build`, `postbuild`, `release`, `prerun` are lifecycle hooks
//! - `static` names a directory served directly by the proxy
//!
//! A worker whose command starts with five schedule fields
//! (`minute hour day-of-month month day-of-week`) is periodic.

use indexmap::IndexMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Worker names that serve HTTP traffic
pub const WEB_WORKERS: &[&str] = &["web", "wsgi", "jwsgi", "rwsgi"];

/// Worker names that are run once by the deployer and never supervised
pub const HOOKS: &[&str] = &["prebuild", "build", "postbuild", "release", "prerun"];

/// Locations searched for the Procfile, relative to the checkout
const PROCFILE_LOCATIONS: &[&str] = &[".launchpad/Procfile", "Procfile"];

#[derive(Debug, Error)]
pub enum ProcfileError {
    #[error("misformatted Procfile entry '{line}' at line {line_number}")]
    Malformed { line_number: usize, line: String },

    #[error("invalid worker name '{name}' at line {line_number}")]
    InvalidName { line_number: usize, name: String },

    #[error("duplicate worker '{name}' at line {line_number}")]
    Duplicate { line_number: usize, name: String },

    #[error("invalid schedule for worker '{name}': {reason}")]
    InvalidSchedule { name: String, reason: String },

    #[error("found both 'web' and 'wsgi'-style workers")]
    ConflictingWebWorkers,

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One field of a periodic schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronField {
    /// `*`
    Any,
    /// `*/N`
    Every(u32),
    /// `N`
    At(u32),
}

impl fmt::Display for CronField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CronField::Any => write!(f, "*"),
            CronField::Every(n) => write!(f, "*/{}", n),
            CronField::At(n) => write!(f, "{}", n),
        }
    }
}

/// Field names and inclusive ranges, in schedule order
const CRON_FIELDS: [(&str, u32, u32); 5] = [
    ("minute", 0, 59),
    ("hour", 0, 23),
    ("day-of-month", 1, 31),
    ("month", 1, 12),
    ("day-of-week", 0, 7),
];

/// A periodic worker: five schedule fields plus the command to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    pub fields: [CronField; 5],
    pub command: String,
}

impl CronSchedule {
    /// Split `command` into a schedule if it starts with five schedule-shaped
    /// fields followed by a command. Returns `None` when it does not look like
    /// a schedule at all, and an error message when a field is out of range.
    pub fn detect(command: &str) -> Option<Result<Self, String>> {
        let mut rest = command.trim_start();
        let mut raw = Vec::with_capacity(5);

        for _ in 0..5 {
            let end = rest.find(char::is_whitespace)?;
            let token = &rest[..end];
            if !looks_like_field(token) {
                return None;
            }
            raw.push(token);
            rest = rest[end..].trim_start();
        }

        if rest.is_empty() {
            return None;
        }

        let mut fields = [CronField::Any; 5];
        for (i, token) in raw.iter().enumerate() {
            let (name, min, max) = CRON_FIELDS[i];
            fields[i] = match parse_field(token) {
                Some(field) => field,
                None => return Some(Err(format!("{} field '{}' is not a number", name, token))),
            };
            match fields[i] {
                CronField::Any => {}
                CronField::Every(n) if n == 0 || n > max => {
                    return Some(Err(format!("{} step '{}' is out of range", name, token)));
                }
                CronField::At(n) if n < min || n > max => {
                    return Some(Err(format!(
                        "{} '{}' is out of range {}-{}",
                        name, token, min, max
                    )));
                }
                _ => {}
            }
        }

        Some(Ok(Self {
            fields,
            command: rest.to_string(),
        }))
    }
}

fn looks_like_field(token: &str) -> bool {
    let digits = token.strip_prefix("*/").unwrap_or(token);
    token == "*" || (!digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()))
}

fn parse_field(token: &str) -> Option<CronField> {
    if token == "*" {
        return Some(CronField::Any);
    }
    if let Some(step) = token.strip_prefix("*/") {
        return step.parse().ok().map(CronField::Every);
    }
    token.parse().ok().map(CronField::At)
}

fn valid_worker_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Parsed Procfile: worker name to command, in declaration order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Procfile {
    workers: IndexMap<String, String>,
}

impl Procfile {
    /// Parse Procfile text
    pub fn parse(text: &str) -> Result<Self, ProcfileError> {
        let mut workers = IndexMap::new();

        for (index, raw) in text.split('\n').enumerate() {
            let line_number = index + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((name, command)) = line.split_once(':') else {
                return Err(ProcfileError::Malformed {
                    line_number,
                    line: line.to_string(),
                });
            };
            let name = name.trim();
            let command = command.trim();

            if !valid_worker_name(name) {
                return Err(ProcfileError::InvalidName {
                    line_number,
                    name: name.to_string(),
                });
            }
            if workers.contains_key(name) {
                return Err(ProcfileError::Duplicate {
                    line_number,
                    name: name.to_string(),
                });
            }

            match CronSchedule::detect(command) {
                Some(Err(reason)) => {
                    return Err(ProcfileError::InvalidSchedule {
                        name: name.to_string(),
                        reason,
                    })
                }
                None if name == "cron" => {
                    return Err(ProcfileError::InvalidSchedule {
                        name: name.to_string(),
                        reason: format!("'{}' does not start with five schedule fields", command),
                    })
                }
                _ => {}
            }

            workers.insert(name.to_string(), command.to_string());
        }

        let has_wsgi = ["wsgi", "jwsgi", "rwsgi"]
            .iter()
            .any(|k| workers.contains_key(*k));
        if has_wsgi && workers.contains_key("web") {
            return Err(ProcfileError::ConflictingWebWorkers);
        }

        debug!(count = workers.len(), "Parsed Procfile");
        Ok(Self { workers })
    }

    /// Read and parse a Procfile from disk
    pub fn from_file(path: &Path) -> Result<Self, ProcfileError> {
        let text = std::fs::read_to_string(path).map_err(|source| ProcfileError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Locate the Procfile inside a checkout
    pub fn locate(src_dir: &Path) -> Option<PathBuf> {
        PROCFILE_LOCATIONS
            .iter()
            .map(|rel| src_dir.join(rel))
            .find(|path| path.is_file())
    }

    pub fn workers(&self) -> &IndexMap<String, String> {
        &self.workers
    }

    /// Command for `name`, or the empty string when absent
    pub fn get(&self, name: &str) -> &str {
        self.workers.get(name).map(String::as_str).unwrap_or("")
    }

    pub fn contains(&self, name: &str) -> bool {
        self.workers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Workers that serve HTTP traffic
    pub fn web_workers(&self) -> IndexMap<&str, &str> {
        self.workers
            .iter()
            .filter(|(name, _)| WEB_WORKERS.contains(&name.as_str()))
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect()
    }

    pub fn has_web_worker(&self) -> bool {
        WEB_WORKERS.iter().any(|name| self.workers.contains_key(*name))
    }

    /// Workers that are not lifecycle hooks
    pub fn processes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.workers
            .iter()
            .filter(|(name, _)| !HOOKS.contains(&name.as_str()))
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Schedule of a periodic worker
    pub fn schedule(&self, name: &str) -> Option<CronSchedule> {
        self.workers
            .get(name)
            .and_then(|command| CronSchedule::detect(command))
            .and_then(Result::ok)
    }

    pub fn prebuild(&self) -> &str {
        self.get("prebuild")
    }

    pub fn build(&self) -> &str {
        self.get("build")
    }

    pub fn postbuild(&self) -> &str {
        self.get("postbuild")
    }

    pub fn release(&self) -> &str {
        self.get("release")
    }

    pub fn prerun(&self) -> &str {
        self.get("prerun")
    }
}
