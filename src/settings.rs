//! Settings files: flat `key=value` files with shell-style variable expansion
//!
//! Used for the per-app `ENV` file, the `LIVE_ENV` snapshot, addon env files,
//! and (with a `:` separator) the `SCALING` file.
//!
//! Parsing is all-or-nothing: one malformed line invalidates the whole file.

use indexmap::IndexMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Ordered key/value pairs read from or written to a settings file
pub type Settings = IndexMap<String, String>;

/// Errors raised while reading or writing a settings file
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("malformed setting '{line}' at line {line_number} of {path}")]
    Malformed {
        path: PathBuf,
        line_number: usize,
        line: String,
    },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Expand `$NAME` and `${NAME}` references against `env`.
///
/// Unknown names are left untouched unless `default` is given, in which case
/// the default replaces the whole token. Substituted text is not expanded again.
pub fn expand_vars<S: AsRef<str>>(
    template: &str,
    env: &IndexMap<String, S>,
    default: Option<&str>,
) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        let (name, token_len) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .char_indices()
                .find(|(_, c)| !(c.is_alphanumeric() || *c == '_'))
                .map(|(i, _)| i)
                .unwrap_or(after.len());
            (&after[..end], end)
        };

        if token_len == 0 {
            out.push('$');
            rest = after;
            continue;
        }

        let token = &rest[pos..pos + 1 + token_len];
        match env.get(name) {
            Some(value) => out.push_str(value.as_ref()),
            None => out.push_str(default.unwrap_or(token)),
        }
        rest = &rest[pos + 1 + token_len..];
    }

    out.push_str(rest);
    out
}

/// Parse settings text, expanding each value against `seed` plus the lines
/// already read. Returns the accumulated settings (seed included).
pub fn parse_settings_str(
    text: &str,
    seed: Settings,
    separator: char,
    origin: &Path,
) -> Result<Settings, SettingsError> {
    let mut env = seed;

    for (index, line) in text.split('\n').enumerate() {
        if line.starts_with('#') || line.trim().is_empty() {
            continue;
        }

        let Some((key, value)) = line.split_once(separator) else {
            return Err(SettingsError::Malformed {
                path: origin.to_path_buf(),
                line_number: index + 1,
                line: line.to_string(),
            });
        };

        let key = key.trim();
        if key.is_empty() {
            return Err(SettingsError::Malformed {
                path: origin.to_path_buf(),
                line_number: index + 1,
                line: line.to_string(),
            });
        }

        let value = expand_vars(value.trim(), &env, None);
        env.insert(key.to_string(), value);
    }

    Ok(env)
}

/// Parse a `key=value` settings file. A missing file yields the seed unchanged.
pub fn parse_settings(path: &Path, seed: Settings) -> Result<Settings, SettingsError> {
    parse_settings_with(path, seed, '=')
}

/// Parse a settings file using a custom key/value separator.
pub fn parse_settings_with(
    path: &Path,
    seed: Settings,
    separator: char,
) -> Result<Settings, SettingsError> {
    if !path.exists() {
        return Ok(seed);
    }

    let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let settings = parse_settings_str(&text, seed, separator, path)?;
    debug!(path = %path.display(), count = settings.len(), "Parsed settings file");
    Ok(settings)
}

/// Load a settings file, treating any error as an empty file.
///
/// The failure is logged; callers get "no configuration" instead of a
/// partially applied one.
pub fn load_settings(path: &Path) -> Settings {
    match parse_settings(path, Settings::new()) {
        Ok(settings) => settings,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring settings file");
            Settings::new()
        }
    }
}

/// Render settings sorted by key.
pub fn render_settings<K, V>(bag: impl IntoIterator<Item = (K, V)>, separator: char) -> String
where
    K: AsRef<str>,
    V: std::fmt::Display,
{
    let mut entries: Vec<(String, String)> = bag
        .into_iter()
        .map(|(k, v)| (k.as_ref().to_string(), v.to_string()))
        .collect();
    entries.sort();

    let mut out = String::new();
    for (key, value) in entries {
        out.push_str(&key);
        out.push(separator);
        out.push_str(&value);
        out.push('\n');
    }
    out
}

/// Write settings sorted by key, creating parent directories as needed.
///
/// Values are written verbatim, so reading the file back gives the same
/// settings as long as no value still holds a `$NAME` that was left
/// unexpanded because `NAME` came later in the source. Sorting can move
/// `NAME` ahead of it, and the re-read then expands the reference.
pub fn write_settings<K, V>(
    path: &Path,
    bag: impl IntoIterator<Item = (K, V)>,
    separator: char,
) -> Result<(), SettingsError>
where
    K: AsRef<str>,
    V: std::fmt::Display,
{
    let content = render_settings(bag, separator);
    write_atomic(path, content.as_bytes()).map_err(|source| SettingsError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Replace `path` with `content` through a temporary file and a single rename.
pub fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
