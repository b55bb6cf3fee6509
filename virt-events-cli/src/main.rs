//! Domain Event Watcher CLI
//!
//! Command-line front end for the virt-events library. It adds:
//! - TOML configuration of watches and output
//! - Text or JSON event lines with timestamps
//! - Per-watch delivery counts
//! - A demo mode that drives the test domain through its lifecycle

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use virt_events::{CallbackId, Connection};

mod callbacks;
mod config;
mod demo;
mod report;
mod state;

use config::{AppConfig, OutputFormat, WatchConfig};
use state::WatchState;

/// Domain event watcher - print hypervisor domain events as they happen
#[derive(Parser, Debug)]
#[command(name = "virt-events-cli")]
#[command(about = "Watch hypervisor domain events", long_about = None)]
#[command(version)]
struct Args {
    /// Connection URI (test:///default or test:///empty)
    #[arg(long, value_name = "URI")]
    uri: Option<String>,

    /// Path to configuration file (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Event kind to watch (can be repeated); replaces the config's watches
    #[arg(short, long, value_name = "KIND")]
    event: Vec<String>,

    /// Only report events for this domain (applies to --event watches)
    #[arg(short, long, value_name = "NAME")]
    domain: Option<String>,

    /// Event loop iterations before exiting (0 = run until killed)
    #[arg(short = 'n', long, value_name = "COUNT")]
    iterations: Option<u64>,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,

    /// Cycle the "test" domain through its lifecycle while watching
    #[arg(long)]
    demo: bool,

    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.verbose, args.quiet);

    log::info!("Domain event watcher v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Using virt-events library v{}", virt_events::VERSION);

    let config = build_config(&args)?;
    watch(&config, args.demo)
}

/// Merge the optional config file with command-line overrides
fn build_config(args: &Args) -> Result<AppConfig> {
    let mut config = match &args.config {
        Some(path) => {
            log::info!("Loading configuration from: {:?}", path);
            config::load_config(path)?
        }
        None => AppConfig::default(),
    };

    if let Some(uri) = &args.uri {
        config.connection.uri = uri.clone();
    }
    if !args.event.is_empty() {
        config.watches = args
            .event
            .iter()
            .map(|event| WatchConfig::new(event, args.domain.clone()))
            .collect();
    }
    if config.watches.is_empty() {
        config.watches.push(WatchConfig::new("lifecycle", args.domain.clone()));
    }
    if let Some(iterations) = args.iterations {
        config.pump.iterations = iterations;
    }
    if args.json {
        config.output.format = OutputFormat::Json;
    }

    config.validate()?;
    Ok(config)
}

fn watch(config: &AppConfig, with_demo: bool) -> Result<()> {
    virt_events::event_register_default_impl().context("Failed to set up the event loop")?;
    let conn = Connection::open(&config.connection.uri)
        .with_context(|| format!("Failed to connect to {}", config.connection.uri))?;

    let mut registrations: Vec<(CallbackId, Arc<WatchState>)> = Vec::new();
    for watch in &config.watches {
        let event_id = watch.event_id()?;
        let domain = match &watch.domain {
            Some(name) => Some(
                conn.lookup_domain_by_name(name)
                    .with_context(|| format!("Domain '{}' not found", name))?,
            ),
            None => None,
        };

        let state = Arc::new(WatchState::new(watch.label(), config.output.format));
        let id = conn
            .domain_event_register(domain.as_ref(), event_id, callbacks::print_event, state.clone())
            .with_context(|| format!("Failed to watch {}", watch.label()))?;
        log::info!("Watching {} (callback {})", watch.label(), id);
        registrations.push((id, state));
    }

    let mut demo = if with_demo {
        Some(demo::Demo::start(&conn, "test")?)
    } else {
        None
    };

    let iterations = config.pump.iterations;
    let mut done = 0u64;
    while iterations == 0 || done < iterations {
        if let Some(demo) = demo.as_mut() {
            demo.check()?;
        }
        virt_events::event_run_default_impl().context("Event loop iteration failed")?;
        done += 1;
    }
    log::debug!("Ran {} event loop iterations", done);

    if let Some(demo) = demo {
        demo.finish()?;
    }

    for (id, state) in &registrations {
        if let Err(e) = conn.domain_event_deregister(*id) {
            log::warn!("Failed to remove watch {}: {}", state.label, e);
        }
    }

    let states: Vec<&WatchState> = registrations.iter().map(|(_, state)| state.as_ref()).collect();
    eprintln!("{}", report::summary(&states));

    conn.close()?;
    Ok(())
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}
