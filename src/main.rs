//! launchpad - host-side agent
//!
//! Usage:
//!   launchpad [--config <path>] <command> [args]
//!
//! Invoked by operators for app management and by git (over SSH and from
//! `post-receive` hooks) for pushes.

use anyhow::{bail, Context, Result};
use launchpad::app::sanitize_app_name;
use launchpad::config::Config;
use launchpad::deploy::{DeployReport, Deployer};
use launchpad::events::{Event, Progress};
use launchpad::git;
use launchpad::platform::{parse_assignment, Platform};
use launchpad::supervisor;
use launchpad::{PKG_NAME, VERSION};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

const DEFAULT_CONFIG_PATH: &str = "/etc/launchpad/config.toml";

#[derive(Debug)]
enum Command {
    GitHook { app: String },
    GitReceivePack { app: String },
    GitUploadPack { app: String },
    Deploy { app: String, revision: Option<String> },
    Apps,
    Create { app: String },
    Destroy { app: String, keep_data: bool },
    Config { app: String },
    ConfigGet { app: String, key: String },
    ConfigSet { app: String, pairs: Vec<String> },
    ConfigUnset { app: String, keys: Vec<String> },
    Ps { app: String },
    PsScale { app: String, counts: Vec<String> },
    Stop { app: String },
    Restart { app: String },
    AddonsAttach { app: String, kind: String, url: String },
    AddonsDetach { app: String, kind: String },
    Help,
    Version,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("launchpad=info".parse().expect("valid log directive")),
        )
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let config_flag = take_flag(&mut args, "--config");
    let command = parse_command(&args)?;

    match command {
        Command::Help => {
            print_help();
            return Ok(());
        }
        Command::Version => {
            println!("{} {}", PKG_NAME, VERSION);
            return Ok(());
        }
        _ => {}
    }

    let (config, config_path) = load_config(config_flag)?;
    config
        .ensure_dirs()
        .context("Failed to create platform directories")?;
    let config = Arc::new(config);
    let deployer = Deployer::new(config.clone()).with_progress(console_progress());
    let platform = Platform::with_deployer(deployer);

    match command {
        Command::GitHook { app } => handle_git_hook(&platform, &app).await,
        Command::GitReceivePack { app } => {
            handle_receive_pack(&platform, &app, config_path.as_deref()).await
        }
        Command::GitUploadPack { app } => {
            let app = platform.app(&sanitize_app_name(&app))?;
            exit_with(git::upload_pack(&app).await?)
        }
        Command::Deploy { app, revision } => handle_deploy(&platform, &app, revision).await,
        Command::Apps => handle_apps(&platform),
        Command::Create { app } => {
            let app = platform.create(&app)?;
            println!("-----> Created {}", app.name());
            Ok(())
        }
        Command::Destroy { app, keep_data } => {
            platform.destroy(&app, keep_data).await?;
            println!("-----> Destroyed {}", app);
            Ok(())
        }
        Command::Config { app } => {
            for (key, value) in platform.get_environment(&app)?.iter() {
                println!("{}={}", key, value);
            }
            Ok(())
        }
        Command::ConfigGet { app, key } => {
            if let Some(value) = platform.get_environment(&app)?.get(&key) {
                println!("{}", value);
            }
            Ok(())
        }
        Command::ConfigSet { app, pairs } => {
            let pairs = pairs
                .iter()
                .map(|raw| parse_assignment(raw))
                .collect::<Result<Vec<_>, _>>()?;
            platform.set_environment(&app, pairs).await?;
            restart_if_deployed(&platform, &app).await
        }
        Command::ConfigUnset { app, keys } => {
            let removed = platform.unset_environment(&app, keys.as_slice()).await?;
            if removed.is_empty() {
                return Ok(());
            }
            restart_if_deployed(&platform, &app).await
        }
        Command::Ps { app } => handle_ps(&platform, &app),
        Command::PsScale { app, counts } => {
            let counts = parse_counts(&counts)?;
            let report = platform.scale(&app, &counts).await?;
            print_report(&report);
            Ok(())
        }
        Command::Stop { app } => {
            platform.stop(&app).await?;
            println!("-----> {} stopped", app);
            Ok(())
        }
        Command::Restart { app } => {
            let report = platform.restart(&app).await?;
            print_report(&report);
            Ok(())
        }
        Command::AddonsAttach { app, kind, url } => {
            let kind = platform.attach_addon(&app, &kind, &url).await?;
            println!("-----> Attached {} to {}", kind, app);
            restart_if_deployed(&platform, &app).await
        }
        Command::AddonsDetach { app, kind } => {
            if platform.detach_addon(&app, &kind).await? {
                println!("-----> Detached {} from {}", kind, app);
                restart_if_deployed(&platform, &app).await
            } else {
                println!("-----> {} has no {} addon", app, kind);
                Ok(())
            }
        }
        Command::Help | Command::Version => Ok(()),
    }
}

/// Remove `flag <value>` from `args`, returning the value
fn take_flag(args: &mut Vec<String>, flag: &str) -> Option<PathBuf> {
    let index = args.iter().position(|a| a == flag)?;
    args.remove(index);
    if index < args.len() {
        Some(PathBuf::from(args.remove(index)))
    } else {
        None
    }
}

fn parse_command(args: &[String]) -> Result<Command> {
    let Some(name) = args.first() else {
        return Ok(Command::Help);
    };
    let rest = &args[1..];
    let app = || -> Result<String> {
        rest.first()
            .cloned()
            .with_context(|| format!("usage: launchpad {} <app>", name))
    };

    let command = match name.as_str() {
        "help" | "--help" | "-h" => Command::Help,
        "version" | "--version" | "-V" => Command::Version,
        "git-hook" => Command::GitHook { app: app()? },
        "git-receive-pack" => Command::GitReceivePack { app: app()? },
        "git-upload-pack" => Command::GitUploadPack { app: app()? },
        "deploy" => Command::Deploy {
            app: app()?,
            revision: rest.get(1).cloned(),
        },
        "apps" => Command::Apps,
        "create" => Command::Create { app: app()? },
        "destroy" => Command::Destroy {
            app: app()?,
            keep_data: rest.iter().any(|a| a == "--keep-data"),
        },
        "config" => Command::Config { app: app()? },
        "config:get" => Command::ConfigGet {
            app: app()?,
            key: rest
                .get(1)
                .cloned()
                .context("usage: launchpad config:get <app> KEY")?,
        },
        "config:set" => Command::ConfigSet {
            app: app()?,
            pairs: rest[1..].to_vec(),
        },
        "config:unset" => Command::ConfigUnset {
            app: app()?,
            keys: rest[1..].to_vec(),
        },
        "ps" => Command::Ps { app: app()? },
        "ps:scale" => Command::PsScale {
            app: app()?,
            counts: rest[1..].to_vec(),
        },
        "stop" => Command::Stop { app: app()? },
        "restart" => Command::Restart { app: app()? },
        "addons:attach" => match rest {
            [app, kind, url, ..] => Command::AddonsAttach {
                app: app.clone(),
                kind: kind.clone(),
                url: url.clone(),
            },
            _ => bail!("usage: launchpad addons:attach <app> <kind> <url>"),
        },
        "addons:detach" => match rest {
            [app, kind, ..] => Command::AddonsDetach {
                app: app.clone(),
                kind: kind.clone(),
            },
            _ => bail!("usage: launchpad addons:detach <app> <kind>"),
        },
        other => bail!("unknown command '{}' (see 'launchpad help')", other),
    };
    Ok(command)
}

/// Config file from `--config`, then `LAUNCHPAD_CONFIG`, then the system
/// default. A missing file falls back to defaults rooted at `LAUNCHPAD_ROOT`.
fn load_config(flag: Option<PathBuf>) -> Result<(Config, Option<PathBuf>)> {
    let path = flag
        .or_else(|| std::env::var_os("LAUNCHPAD_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    if path.exists() {
        let config = Config::load(&path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
        debug!(path = %path.display(), "Configuration loaded");
        return Ok((config, Some(path)));
    }

    let config = match std::env::var_os("LAUNCHPAD_ROOT") {
        Some(root) => Config::rooted(PathBuf::from(root)),
        None => Config::default(),
    };
    config.validate()?;
    debug!(root = %config.paths.root.display(), "No configuration file, using defaults");
    Ok((config, None))
}

fn console_progress() -> Progress {
    Progress::new(|_app, event| match event {
        Event::Output(line) => println!("       {}", line),
        other => println!("-----> {}", other),
    })
}

async fn handle_git_hook(platform: &Platform, app: &str) -> Result<()> {
    let updates = git::parse_push(std::io::stdin().lock())?;
    for update in updates {
        if update.is_delete() {
            info!(app = %app, refname = %update.refname, "Ignoring deleted ref");
            continue;
        }
        let report = platform
            .deploy_ref(app, &update.new, &update.refname)
            .await?;
        print_report(&report);
    }
    Ok(())
}

async fn handle_receive_pack(
    platform: &Platform,
    app: &str,
    config_path: Option<&std::path::Path>,
) -> Result<()> {
    let app = platform.create(&sanitize_app_name(app))?;
    let exe = std::env::current_exe().context("Failed to locate the launchpad binary")?;
    git::setup_repo(&app, &exe, config_path).await?;
    exit_with(git::receive_pack(&app).await?)
}

async fn handle_deploy(platform: &Platform, app: &str, revision: Option<String>) -> Result<()> {
    let revision = match revision {
        Some(revision) => revision,
        None => git::head_revision(&platform.app(app)?).await?,
    };
    let report = platform.deploy(app, &revision).await?;
    print_report(&report);
    Ok(())
}

fn handle_apps(platform: &Platform) -> Result<()> {
    for app in platform.list_apps()? {
        let marker = if app.current_revision().is_some() { "*" } else { " " };
        println!("{}{}", marker, app.name());
    }
    Ok(())
}

fn handle_ps(platform: &Platform, name: &str) -> Result<()> {
    let app = platform.app(name)?;
    let manifest = platform.get_manifest(name)?;
    let scaling = supervisor::read_scaling(&app.scaling_file())?;
    for (kind, command) in manifest.processes() {
        let count = scaling.get(kind).copied().unwrap_or(1);
        println!("{}: {} x {}", kind, count, command);
    }
    Ok(())
}

fn parse_counts(raw: &[String]) -> Result<Vec<(String, u32)>> {
    if raw.is_empty() {
        bail!("usage: launchpad ps:scale <app> kind=N...");
    }
    raw.iter()
        .map(|item| {
            let (kind, count) = parse_assignment(item)?;
            let count = count
                .trim()
                .parse::<u32>()
                .with_context(|| format!("invalid count for '{}': {}", kind, count))?;
            Ok((kind, count))
        })
        .collect()
}

async fn restart_if_deployed(platform: &Platform, name: &str) -> Result<()> {
    if platform.app(name)?.current_revision().is_none() {
        return Ok(());
    }
    let report = platform.restart(name).await?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &DeployReport) {
    info!(
        app = %report.app,
        deploy_id = %report.deploy_id,
        revision = %report.revision,
        stage = %report.final_stage,
        duration_secs = report.duration_secs,
        "Deploy finished"
    );
    println!(
        "-----> {} {} ({}, {} unit(s), {:.1}s)",
        report.app,
        report.final_stage,
        report.builder,
        report.units.len(),
        report.duration_secs
    );
}

fn exit_with(status: std::process::ExitStatus) -> Result<()> {
    if !status.success() {
        std::process::exit(status.code().unwrap_or(1));
    }
    Ok(())
}

fn print_help() {
    println!(
        r#"
launchpad - push-to-deploy agent

USAGE:
    launchpad [--config <path>] <command> [args]

COMMANDS:
    apps                              List apps (* = deployed)
    create <app>                      Create an app
    destroy <app> [--keep-data]       Remove an app and its configuration
    deploy <app> [revision]           Deploy a revision (default: repository HEAD)
    stop <app>                        Stop all workers
    restart <app>                     Re-render and reload the current revision

    config <app>                      Show ENV settings
    config:get <app> KEY              Show one setting
    config:set <app> KEY=VALUE...     Set settings and restart
    config:unset <app> KEY...         Remove settings and restart

    ps <app>                          Show workers and instance counts
    ps:scale <app> kind=N...          Change instance counts and restart

    addons:attach <app> <kind> <url>  Attach postgres, redis or storage
    addons:detach <app> <kind>        Detach an addon

    git-receive-pack <app>            Serve a push (used over SSH)
    git-upload-pack <app>             Serve a fetch (used over SSH)
    git-hook <app>                    Deploy pushed refs (post-receive hook)

ENVIRONMENT:
    LAUNCHPAD_CONFIG                  Config file (default: {})
    LAUNCHPAD_ROOT                    Platform root when no config file exists
    RUST_LOG                          Log filter (logs go to stderr)
"#,
        DEFAULT_CONFIG_PATH
    );
}
