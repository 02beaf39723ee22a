use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;

use borg_steward::config::{self, EnvOverlay};
use borg_steward::orchestrator::Orchestrator;
use borg_steward::runner::{CommandRunner, DryRunRunner, ProcessRunner};
use borg_steward::supervisor::CredentialSource;
use borg_steward::telemetry::{self, LogFormat};
use tracing::{error, info};

/// Token sources in the order they are tried.
const TOKEN_VARS: [&str; 2] = ["SUPERVISOR_TOKEN", "HASSIO_TOKEN"];

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Backup,
    Restore,
}

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Options document (JSON, or TOML when the file ends in .toml)
    #[arg(long, default_value = "/data/options.json")]
    options: PathBuf,
    /// Force the run mode; otherwise restore_mode / RESTORE_MODE decide
    #[arg(long, value_enum)]
    mode: Option<Mode>,
    /// Log output format: text or json (defaults to LOG_FORMAT)
    #[arg(long)]
    log_format: Option<String>,
    /// Log the external commands instead of running them
    #[arg(long)]
    dry_run: bool,
}

fn main() {
    // A missing .env file is normal.
    let _ = dotenv::dotenv();
    let args = Args::parse();
    std::process::exit(run(args));
}

fn run(args: Args) -> i32 {
    let loaded = config::load(&args.options);

    let debug = loaded
        .as_ref()
        .ok()
        .and_then(|raw| raw.borg_backup_debug)
        .unwrap_or(false);
    let format_env = std::env::var("LOG_FORMAT").ok();
    let format = LogFormat::parse(args.log_format.as_deref().or(format_env.as_deref()));
    if let Err(e) = telemetry::init_logging(telemetry::default_level(debug), format) {
        eprintln!("{e}");
    }

    let mut overlay = EnvOverlay::from_pairs(std::env::vars());
    if let Some(mode) = args.mode {
        let restore = matches!(mode, Mode::Restore);
        overlay.restore_mode = Some(restore.to_string());
    }

    let credentials = TOKEN_VARS
        .iter()
        .map(|name| CredentialSource::new(*name, std::env::var(name).ok()))
        .collect();
    let runner: Arc<dyn CommandRunner> = if args.dry_run {
        Arc::new(DryRunRunner)
    } else {
        Arc::new(ProcessRunner)
    };

    let outcome = Orchestrator::new(runner, credentials).run_loaded(loaded, &overlay);
    let history: Vec<&str> = outcome.history.iter().map(|s| s.as_str()).collect();
    match outcome.error.as_ref() {
        None => info!(states = %history.join(" -> "), "run finished"),
        Some(e) => error!(
            states = %history.join(" -> "),
            exit_code = outcome.exit_code,
            "run failed: {e}"
        ),
    }
    outcome.exit_code
}
