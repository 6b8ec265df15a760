use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

use profile_rotator::config::{self, Configuration, Overrides};
use profile_rotator::error::Error;
use profile_rotator::events::ExitReason;
use profile_rotator::pool;
use profile_rotator::remote::MirrorConnector;
use profile_rotator::selection::{self, SelectionMode};
use profile_rotator::tasks::rotator::{self, RotatorSettings, TokioSleeper};

#[derive(Debug, Parser)]
#[command(
    name = "profile-rotator",
    version,
    about = "Rotate the profile photo through a local image pool"
)]
struct Args {
    /// Optional YAML config; environment variables and flags take precedence
    #[arg(short, long, value_name = "FILE", env = "ROTATOR_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long, value_name = "ID", env = "API_ID")]
    api_id: Option<u32>,
    #[arg(long, value_name = "HASH", env = "API_HASH", hide_env_values = true)]
    api_hash: Option<String>,
    /// Session token or session name
    #[arg(long, value_name = "SESSION", env = "SESSION", hide_env_values = true)]
    session: Option<String>,
    #[arg(long, value_name = "DIR", env = "IMAGES_DIR")]
    images_dir: Option<PathBuf>,
    /// Seconds between rotations
    #[arg(long = "interval", value_name = "SECONDS", env = "INTERVAL")]
    interval_secs: Option<u64>,
    /// Delete older profile photos after each upload (yes/true/1)
    #[arg(
        long,
        value_name = "FLAG",
        env = "DELETE_OLD",
        action = ArgAction::Set,
        value_parser = parse_flag_arg
    )]
    delete_old: Option<bool>,
    /// Number of most recent profile photos to keep
    #[arg(long, value_name = "COUNT", env = "KEEP")]
    keep: Option<usize>,
    /// sequential or random
    #[arg(long, value_name = "MODE", env = "SELECTION")]
    selection: Option<SelectionMode>,
    #[arg(long, value_name = "SEED", env = "SELECTION_SEED")]
    selection_seed: Option<u64>,
    /// Root directory of the published profile photo mirror
    #[arg(long, value_name = "DIR", env = "MIRROR_DIR")]
    mirror_dir: Option<PathBuf>,
    /// Print the pool and the first N selections, then exit
    #[arg(long, value_name = "ITERATIONS")]
    plan: Option<usize>,
    /// Run a single rotation cycle and exit
    #[arg(long)]
    once: bool,
    /// Increase log verbosity (repeatable)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,
}

fn parse_flag_arg(value: &str) -> Result<bool, String> {
    Ok(config::parse_flag(value))
}

fn init_tracing(verbosity: u8) -> Result<()> {
    let mut filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let level = match verbosity {
        0 => None,
        1 => Some("debug"),
        _ => Some("trace"),
    };
    if let Some(level) = level {
        filter = filter.add_directive(format!("profile_rotator={level}").parse()?);
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let Args {
        config,
        api_id,
        api_hash,
        session,
        images_dir,
        interval_secs,
        delete_old,
        keep,
        selection,
        selection_seed,
        mirror_dir,
        plan,
        once,
        verbose,
    } = Args::parse();
    init_tracing(verbose)?;

    let base = match &config {
        Some(path) => Configuration::from_yaml_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => Configuration::default(),
    };
    let cfg = base.with_overrides(Overrides {
        api_id,
        api_hash,
        session,
        images_directory: images_dir,
        interval_secs,
        delete_old,
        keep,
        selection,
        selection_seed,
        mirror_directory: mirror_dir,
    });

    if let Some(iterations) = plan {
        run_plan(&cfg, iterations);
        return Ok(ExitCode::SUCCESS);
    }

    let cfg = cfg.validated().context("invalid configuration values")?;
    tracing::info!("effective configuration:\n{cfg:#?}");

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!("ctrl-c handler failed: {err}");
                return;
            }
            tracing::info!("ctrl-c received; initiating shutdown");
            cancel.cancel();
        });
    }

    #[cfg(unix)]
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = sigterm.recv() => {
                            tracing::info!("SIGTERM received; initiating shutdown");
                            cancel.cancel();
                        }
                    }
                }
                Err(err) => tracing::warn!("failed to register SIGTERM handler: {err}"),
            }
        });
    }

    // The pool is read once; images added later need a restart.
    let candidates = pool::list_candidates(&cfg.images_directory);
    let connector = MirrorConnector::new(&cfg.mirror_directory);
    let mut settings = RotatorSettings::from(&cfg);
    if once {
        settings.max_cycles = Some(1);
    }

    let reason = rotator::run(
        &connector,
        &cfg.credentials(),
        candidates,
        settings,
        TokioSleeper,
        cancel,
    )
    .await
    .context("identity session failed")?;

    if reason == ExitReason::EmptyPool {
        let err = Error::EmptyPool(cfg.images_directory.clone());
        tracing::error!("{err}; add images and restart");
    }
    Ok(ExitCode::from(reason.exit_code()))
}

fn run_plan(cfg: &Configuration, iterations: usize) {
    let candidates = pool::list_candidates(&cfg.images_directory);

    println!(
        "# rotation plan\n# images: {}\n# strategy: {}\n# iterations: {}\n# seed: {}\n",
        candidates.len(),
        cfg.selection,
        iterations,
        cfg.selection_seed
            .map_or_else(|| "(random)".to_string(), |s| s.to_string())
    );

    if candidates.is_empty() {
        println!(
            "(no images discovered under {})",
            cfg.images_directory.display()
        );
        return;
    }

    let order = selection::plan(&candidates, cfg.selection, cfg.selection_seed, iterations);
    println!("# planned order:");
    for (idx, path) in order.iter().enumerate() {
        println!("  {:>4}: {}", idx + 1, path.display());
    }
}
