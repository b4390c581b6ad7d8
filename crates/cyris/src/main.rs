//! CyRIS - Cyber Range Instantiation System
//!
//! Turns a declarative range description into running VMs on isolated
//! virtual networks, customized with training content, and tears the
//! whole thing down again.

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use color_eyre::Result;

use cyris::config::Config;
use cyris::config_cmd;
use cyris::errors;
use cyris::range::{create, destroy, list, ssh_info, status};
use cyris::validate;

/// Cyber range instantiation from declarative YAML descriptions.
///
/// cyris builds base images, clones them into per-range VMs, wires up
/// isolated networks with forwarding policy, runs training content tasks
/// over SSH, and automates teardown.
#[derive(Parser)]
#[command(version)]
struct Cli {
    /// Configuration file (default: config.yml, /etc/cyris/config.yml)
    #[clap(long, global = true)]
    config: Option<Utf8PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available cyris commands.
#[derive(Subcommand)]
enum Commands {
    /// Create a range from a description file
    Create(create::CreateOpts),

    /// List ranges with status
    List(list::ListOpts),

    /// Show one range's VMs, addresses, reachability and tasks
    Status(status::StatusOpts),

    /// Tear down a range's VMs, networks and rules
    Destroy(destroy::DestroyOpts),

    /// Remove a destroyed range's metadata and directory
    #[clap(name = "rm")]
    Remove(destroy::RmOpts),

    /// Check environment readiness
    Validate(validate::ValidateOpts),

    /// Print the effective configuration
    #[clap(name = "config-show")]
    ConfigShow(config_cmd::ConfigShowOpts),

    /// Seed a commented configuration file
    #[clap(name = "config-init")]
    ConfigInit(config_cmd::ConfigInitOpts),

    /// Print SSH snippets for a range's entry points
    #[clap(name = "ssh-info")]
    SshInfo(ssh_info::SshInfoOpts),
}

/// Install and configure the tracing/logging system.
///
/// Structured logging goes to stderr, filtered by RUST_LOG (default
/// 'info'), with the error layer wired in for report capture.
fn install_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let format = fmt::format().without_time().with_target(false).compact();

    let fmt_layer = fmt::layer()
        .event_format(format)
        .with_writer(std::io::stderr);
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

fn main() -> Result<()> {
    install_tracing();
    color_eyre::install()?;

    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(report) => {
            eprintln!("Error: {:#}", report);
            errors::exit_code_for(&report)
        }
    };
    std::process::exit(code)
}

fn run(cli: Cli) -> Result<i32> {
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Create(opts) => {
            let outcome = create::run(&config, opts)?;
            Ok(match outcome {
                create::CreateOutcome::Success => 0,
                create::CreateOutcome::Partial => 2,
            })
        }
        Commands::List(opts) => {
            list::run(&config, opts)?;
            Ok(0)
        }
        Commands::Status(opts) => {
            status::run(&config, opts)?;
            Ok(0)
        }
        Commands::Destroy(opts) => {
            destroy::run(&config, opts)?;
            Ok(0)
        }
        Commands::Remove(opts) => {
            destroy::run_rm(&config, opts)?;
            Ok(0)
        }
        Commands::Validate(opts) => {
            validate::run(&config, opts)?;
            Ok(0)
        }
        Commands::ConfigShow(opts) => {
            config_cmd::run_show(&config, opts)?;
            Ok(0)
        }
        Commands::ConfigInit(opts) => {
            config_cmd::run_init(opts)?;
            Ok(0)
        }
        Commands::SshInfo(opts) => {
            ssh_info::run(&config, opts)?;
            Ok(0)
        }
    }
}
