//! Forward a local port to a ready pod behind a Kubernetes service.
//!
//! ```text
//! kube-portforward --namespace default --service web --remote-port 8080
//! ```
//!
//! Runs until Ctrl-C or until the tunnel fails. Log verbosity follows
//! `RUST_LOG`.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use kube_portforward::{PortForwardRequest, TunnelOptions, read_with_options};
use tracing::{Level, info};

/// Forward a local port to a ready pod behind a Kubernetes service
#[derive(Parser, Debug)]
#[command(name = "kube-portforward", version, about, long_about = None)]
struct Args {
    /// kubectl config file (default: $HOME/.kube/config)
    #[arg(long = "kube-config", value_name = "PATH")]
    kube_config: Option<PathBuf>,

    /// Namespace where the service is located
    #[arg(short = 'n', long = "namespace")]
    namespace: String,

    /// Service to port forward
    #[arg(short = 's', long = "service")]
    service: String,

    /// Local bind port (default: a random free port)
    #[arg(short = 'l', long = "local-port")]
    local_port: Option<u16>,

    /// Remote port on the pod
    #[arg(short = 'r', long = "remote-port")]
    remote_port: u16,

    /// Local address to listen on
    #[arg(long = "address", default_value = "127.0.0.1")]
    address: IpAddr,

    /// Seconds to wait for the tunnel to become ready
    #[arg(long = "ready-timeout", default_value_t = 10)]
    ready_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    let mut request = PortForwardRequest {
        kube_config: args.kube_config,
        namespace: args.namespace,
        service: args.service,
        local_port: args.local_port,
        remote_port: args.remote_port,
        port_forwarded: false,
    };

    let options = TunnelOptions::default()
        .bind_address(args.address)
        .ready_timeout(Duration::from_secs(args.ready_timeout));

    let mut active = read_with_options(&mut request, options).await?;

    info!(
        "Forwarding {} -> {} (Ctrl-C to stop)",
        active.session.local_addr(),
        active.session.target()
    );

    active.session.wait().await?;
    info!("Port forward closed");

    Ok(())
}
