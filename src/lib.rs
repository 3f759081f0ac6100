#![deny(missing_docs)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Port-forward a local port to a ready pod behind a Kubernetes service.
//!
//! `kubectl port-forward svc/...` picks a pod for you; this crate does the same
//! resolution as a library so a host process can open, supervise and close the
//! tunnel itself.
//!
//! # Features
//!
//! - **Service resolution**: Service selector → running pods → numeric or named
//!   target port, first match wins
//! - **Supervised tunnel**: readiness is awaited with a bounded timeout, close is
//!   idempotent, and forwarding errors come back through `wait`
//! - **Interrupt handling**: Ctrl-C closes the active tunnel and disarms its
//!   watcher
//!
//! # Usage
//!
//! ```ignore
//! use kube_portforward::{PortForwardRequest, read};
//!
//! let mut request = PortForwardRequest::new("default", "web", 8080);
//! let mut active = read(&mut request).await?;
//! assert!(request.port_forwarded);
//!
//! println!("listening on {}", active.session.local_addr());
//! active.session.wait().await?;
//! ```

mod cluster;
mod config;
mod error;
mod forward;
mod resolve;
mod signal;
mod tunnel;

pub use cluster::{Cluster, KubeCluster};
pub use config::{connect, kubeconfig_path};
pub use error::{BoxError, Error, Result};
pub use forward::{ActiveForward, PortForward, PortForwardRequest, read, read_with_options};
pub use resolve::{
    PodPhase, ResolvedTarget, fetch_service, label_selector, match_port, resolve, select_pods,
};
pub use signal::SignalWatcher;
pub use tunnel::{
    BoxStream, DEFAULT_READY_TIMEOUT, Dialer, ForwardStream, KubeDialer, PortPair, SessionHandle,
    TunnelManager, TunnelOptions, TunnelSession, TunnelState, portforward_path,
};
