//! Ordered application environment with typed accessors

use crate::settings::{self, Settings};
use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Values considered true by [`Env::get_bool`]
const TRUTHY: &[&str] = &["1", "on", "true", "enabled", "yes", "y"];

/// Ordered, case-sensitive key/value environment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Env {
    vars: IndexMap<String, String>,
}

impl Env {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: ToString,
    {
        let mut env = Self::new();
        for (k, v) in pairs {
            env.set(k, v);
        }
        env
    }

    /// Set a value, replacing any existing one (keeps the original position)
    pub fn set(&mut self, key: impl Into<String>, value: impl ToString) {
        self.vars.insert(key.into(), value.to_string());
    }

    /// Set a value only if the key is not defined yet. Returns true if it was set.
    pub fn set_default(&mut self, key: impl Into<String>, value: impl ToString) -> bool {
        let key = key.into();
        if self.vars.contains_key(&key) {
            return false;
        }
        self.vars.insert(key, value.to_string());
        true
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.vars.shift_remove(key)
    }

    /// Merge `other` into this environment, overriding existing keys
    pub fn merge<K, V>(&mut self, other: impl IntoIterator<Item = (K, V)>)
    where
        K: Into<String>,
        V: ToString,
    {
        for (k, v) in other {
            self.set(k, v);
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    /// Integer value of `key`, `default` when absent. A present but
    /// non-numeric value is an error.
    pub fn get_int(&self, key: &str, default: i64) -> Result<i64, std::num::ParseIntError> {
        match self.get(key) {
            Some(value) => value.trim().parse(),
            None => Ok(default),
        }
    }

    /// Boolean value of `key`, `default` when absent.
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(value) => {
                let value = value.trim().to_ascii_lowercase();
                TRUTHY.contains(&value.as_str())
            }
            None => default,
        }
    }

    pub fn get_path(&self, key: &str, default: impl Into<PathBuf>) -> PathBuf {
        match self.get(key) {
            Some(value) => PathBuf::from(value),
            None => default.into(),
        }
    }

    /// Layer a settings file on top of this environment.
    ///
    /// Values are expanded against the current environment. A malformed
    /// file is logged and contributes nothing.
    pub fn parse_settings(&mut self, path: &Path) {
        match settings::parse_settings(path, self.vars.clone()) {
            Ok(vars) => self.vars = vars,
            Err(e) => warn!(path = %path.display(), error = %e, "Ignoring malformed settings file"),
        }
    }

    /// Expand `$VAR` references in `template` against this environment
    pub fn expand(&self, template: &str) -> String {
        settings::expand_vars(template, &self.vars, None)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn as_settings(&self) -> &Settings {
        &self.vars
    }
}

impl From<Settings> for Env {
    fn from(vars: Settings) -> Self {
        Self { vars }
    }
}

impl<'a> IntoIterator for &'a Env {
    type Item = (&'a String, &'a String);
    type IntoIter = indexmap::map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.vars.iter()
    }
}
