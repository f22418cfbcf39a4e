use clap::Parser;
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "torgate-tun")]
#[command(about = "Userspace TCP/SOCKS gateway over an inherited tunnel fd")]
struct Cli {
    /// File descriptor of the point-to-point tunnel device, inherited
    /// from the launching service.
    #[arg(long)]
    fd: i32,

    /// Upstream SOCKS5 endpoint for TCP flows.
    #[arg(long, default_value = "127.0.0.1:9050")]
    socks: SocketAddr,

    /// Upstream UDP resolver for DNS relay.
    #[arg(long, default_value = "127.0.0.1:9053")]
    dns: SocketAddr,

    #[arg(long)]
    verbose: bool,
}

#[cfg(unix)]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    use std::os::fd::{FromRawFd, OwnedFd};
    use std::sync::Arc;
    use torgate_tunnel::Gateway;
    use torgate_tunnel::device::FdTun;

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

    if cli.fd < 0 {
        return Err(format!("invalid tunnel fd {}", cli.fd).into());
    }
    // The launcher hands us ownership of this descriptor.
    let fd = unsafe { OwnedFd::from_raw_fd(cli.fd) };
    let tun = Arc::new(FdTun::new(fd)?);

    tracing::info!(socks = %cli.socks, dns = %cli.dns, "tunnel gateway starting");
    Gateway::new(tun, cli.socks, cli.dns).run().await?;
    Ok(())
}

#[cfg(not(unix))]
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = Cli::parse();
    Err("the tunnel gateway requires a unix host".into())
}
