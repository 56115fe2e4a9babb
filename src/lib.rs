//! Launchpad - push-to-deploy for a single host
//!
//! A `git push` to the host lands in a bare repository whose `post-receive`
//! hook hands each pushed revision to the [`deploy::Deployer`]. A deploy:
//! - Checks the revision out and reads its `Procfile`
//! - Picks the first builder that accepts the source tree and builds it
//! - Assembles the app environment from defaults, builder, addons and `ENV`
//! - Renders an nginx site and one uwsgi vassal per worker instance
//! - Swaps the rendered files into place and reloads nginx and uwsgi
//!
//! [`platform::Platform`] wraps the deployer with the operations the CLI
//! exposes (apps, settings, scaling).

pub mod addons;
pub mod app;
pub mod builders;
pub mod config;
pub mod deploy;
pub mod env;
pub mod error;
pub mod events;
pub mod git;
pub mod lock;
pub mod platform;
pub mod procfile;
pub mod proxy;
pub mod settings;
pub mod supervisor;
pub mod tls;

/// Package name
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Package version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
