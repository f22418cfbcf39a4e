use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use torgate_supervisor::hypervisor::QemuController;
use torgate_supervisor::netadapter::platform_adapter;
use torgate_supervisor::ringlog::RingLog;
use torgate_supervisor::{Config, LifecycleEngine, SupervisorError};
use tracing_subscriber::EnvFilter;

const VM_CONSOLE_LINES: usize = 512;

#[derive(Parser)]
#[command(name = "torgate")]
#[command(about = "Route all host traffic through an isolated Tor VM")]
struct Cli {
    /// Configuration file (JSON). Defaults apply when absent.
    #[arg(long, default_value = "/etc/torgate/config.json")]
    config: PathBuf,

    /// Acceleration backend override: kvm, hvf, whpx, or tcg.
    #[arg(long)]
    accel: Option<String>,

    #[arg(long)]
    verbose: bool,

    /// Run the hypervisor without a display.
    #[arg(long)]
    headless: bool,

    /// Delete the VM state disk before launch.
    #[arg(long)]
    clean: bool,

    /// Take over from a dead instance (stale control socket / pidfile).
    #[arg(long)]
    replace: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "debug,torgate=trace"
    } else {
        "info,torgate=debug"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "torgate exited with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), SupervisorError> {
    let mut config = if cli.config.exists() {
        Config::load(&cli.config).await?
    } else {
        tracing::info!(path = %cli.config.display(), "no config file; using defaults");
        Config::default()
    };

    if let Some(accel) = cli.accel {
        config.accel = accel;
    }
    if cli.verbose {
        config.verbose = true;
    }
    if cli.headless {
        config.headless = true;
    }
    config.validate()?;

    let pidfile = config.qmp_socket_path.with_extension("pid");
    claim_instance(&config, &pidfile, cli.replace).await?;

    if cli.clean && config.state_disk_path.exists() {
        tracing::info!(disk = %config.state_disk_path.display(), "removing vm state disk");
        tokio::fs::remove_file(&config.state_disk_path).await?;
    }

    let console = Arc::new(RingLog::new(VM_CONSOLE_LINES));
    console.set_observer(|line| tracing::debug!(target: "torgate::console", "{line}"));

    let net = platform_adapter();
    let hypervisor = Arc::new(QemuController::new(console));
    let engine = LifecycleEngine::new(config, net, hypervisor);

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received; shutting down");
            let _ = cancel_tx.send(true);
        }
    });

    let result = engine.run(cancel_rx).await;
    let _ = tokio::fs::remove_file(&pidfile).await;
    result
}

/// Refuse to start next to a previous instance unless `--replace` clears
/// its leftovers. A live instance still owns the routing diversion; two
/// engines must never share it.
async fn claim_instance(
    config: &Config,
    pidfile: &Path,
    replace: bool,
) -> Result<(), SupervisorError> {
    if pidfile.exists() {
        if !replace {
            return Err(SupervisorError::ConfigValidation(format!(
                "{} exists; another instance may be running (use --replace)",
                pidfile.display()
            )));
        }
        tracing::warn!(pidfile = %pidfile.display(), "replacing leftover instance state");
        let _ = tokio::fs::remove_file(pidfile).await;
        let _ = tokio::fs::remove_file(&config.qmp_socket_path).await;
    }
    if let Some(dir) = pidfile.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    tokio::fs::write(pidfile, std::process::id().to_string()).await?;
    Ok(())
}
