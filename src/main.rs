use std::path::PathBuf;
use std::sync::mpsc::channel;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use astrace::lifecycle::{self, TraceTemplate};
use astrace::settings::Settings;
use astrace::sink::PartitionedJsonlSink;
use astrace::supervisor::TraceSupervisor;
use astrace::xmla::client::XmlaProvider;

#[derive(Debug, Parser)]
#[command(about = "Records Analysis Services extended events to JSONL files")]
struct Command {
    /// Path to the settings file.
    #[arg(short, long, default_value = "astrace.toml")]
    config: PathBuf,
    #[arg(short, long)]
    verbose: bool,
    #[command(subcommand)]
    action: Option<Action>,
}

#[derive(Debug, Subcommand)]
enum Action {
    /// Create the trace and record its events until interrupted (default).
    Run,
    /// Validate the settings, the template, and the connection string.
    Check,
    /// Delete the template's trace from the server, without recording.
    Teardown,
}

fn run(settings: Settings) -> Result<()> {
    let template = TraceTemplate::load(&settings.capture.template_path)?;
    let provider = XmlaProvider::from_connection_string(&settings.engine.connection_string)?;
    let sink = PartitionedJsonlSink::new(&settings.capture.output_root);
    let mut supervisor = TraceSupervisor::new(provider, template, sink);

    // Installed before the trace exists server-side.
    let (stop_tx, stop_rx) = channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .context("failed to set the Ctrl-C handler")?;

    println!(
        "Recording trace '{}' to {}",
        supervisor.trace_id(),
        settings.capture.output_root.display()
    );
    println!("Press Ctrl-C to stop");
    supervisor.run_until(stop_rx)?;
    info!("trace service exited");
    Ok(())
}

fn check(settings: Settings) -> Result<()> {
    let template = TraceTemplate::load(&settings.capture.template_path)?;
    XmlaProvider::from_connection_string(&settings.engine.connection_string)?;
    println!("trace id: {}", template.trace_id());
    println!("output root: {}", settings.capture.output_root.display());
    println!("Settings are valid");
    Ok(())
}

fn teardown(settings: Settings) -> Result<()> {
    let template = TraceTemplate::load(&settings.capture.template_path)?;
    let provider = XmlaProvider::from_connection_string(&settings.engine.connection_string)?;
    lifecycle::delete_trace(&provider, template.trace_id());
    println!("Requested deletion of trace '{}'", template.trace_id());
    Ok(())
}

fn main() -> Result<()> {
    let opts = Command::parse();

    let default_filter = if opts.verbose {
        "astrace=debug"
    } else {
        "astrace=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let settings = Settings::load(&opts.config)
        .with_context(|| format!("failed to load settings from {}", opts.config.display()))?;
    info!(path = %opts.config.display(), "settings loaded");

    match opts.action.unwrap_or(Action::Run) {
        Action::Run => run(settings),
        Action::Check => check(settings),
        Action::Teardown => teardown(settings),
    }
}
