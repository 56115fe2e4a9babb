//! Progress events surfaced to whoever is driving a deploy
//!
//! Builders and the deployer report what they are doing through a
//! [`Progress`] handle; the CLI decides how to display it.

use crate::error::DeployStage;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The deploy moved to a new state
    Stage(DeployStage),
    /// A builder accepted the source tree
    Detected { builder: String },
    CreatingBuildEnv,
    InstallingDependencies,
    Compiling,
    /// A Procfile hook is about to run
    RunningHook { name: String },
    /// One line of toolchain or hook output
    Output(String),
    /// Free-form status message
    Message(String),
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Stage(stage) => write!(f, "{}", stage),
            Event::Detected { builder } => write!(f, "{} app detected", builder),
            Event::CreatingBuildEnv => write!(f, "Creating build environment"),
            Event::InstallingDependencies => write!(f, "Installing dependencies"),
            Event::Compiling => write!(f, "Compiling project"),
            Event::RunningHook { name } => write!(f, "Running {}", name),
            Event::Output(line) => write!(f, "{}", line),
            Event::Message(message) => write!(f, "{}", message),
        }
    }
}

/// Callback invoked for each event, with the app name
pub type EventCallback = dyn Fn(&str, &Event) + Send + Sync;

/// Cheap, cloneable handle for emitting progress events
#[derive(Clone, Default)]
pub struct Progress {
    callback: Option<Arc<EventCallback>>,
}

impl Progress {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&str, &Event) + Send + Sync + 'static,
    {
        Self {
            callback: Some(Arc::new(callback)),
        }
    }

    /// A handle that drops every event
    pub fn silent() -> Self {
        Self::default()
    }

    pub fn emit(&self, app: &str, event: Event) {
        if let Some(callback) = &self.callback {
            callback(app, &event);
        }
    }
}

impl fmt::Debug for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Progress")
            .field("callback", &self.callback.is_some())
            .finish()
    }
}
