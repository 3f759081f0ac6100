//! Tunnel lifecycle: dialing the pod, forwarding local connections, and
//! stopping the forwarding loop.
//!
//! # How It Works
//!
//! 1. [`TunnelManager::start`] spawns the forwarding loop
//! 2. The loop dials the pod once through its `portforward` subresource, then
//!    binds the local listener and reports readiness with the bound address
//! 3. The first accepted local connection gets the stream from step 2; each
//!    later one dials a new stream. Both are relayed in both directions until
//!    either side closes
//! 4. [`TunnelSession::close`] cancels the loop; [`TunnelSession::wait`]
//!    surfaces whatever error ended it
//!
//! A session moves `Idle -> Forwarding -> Closed` (or straight from `Idle` to
//! `Closed`). `Closed` is terminal.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::error::{BoxError, Error, Result};
use crate::resolve::ResolvedTarget;

/// Default time to wait for the forwarding loop to become ready.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// A bidirectional byte stream to a pod port.
pub trait ForwardStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ForwardStream for T {}

/// Boxed stream returned by a [`Dialer`].
pub type BoxStream = Box<dyn ForwardStream>;

/// Opens streams to a pod port through the cluster API.
pub trait Dialer: Send + Sync + 'static {
    /// Opens a new stream to the target's port.
    ///
    /// Implementations make a single attempt per call.
    fn dial(
        &self,
        target: &ResolvedTarget,
    ) -> impl Future<Output = std::result::Result<BoxStream, BoxError>> + Send;
}

/// Path of a pod's `portforward` subresource.
#[must_use]
pub fn portforward_path(namespace: &str, pod: &str) -> String {
    format!("/api/v1/namespaces/{namespace}/pods/{pod}/portforward")
}

/// [`Dialer`] backed by a live `kube` client.
#[derive(Clone)]
pub struct KubeDialer {
    client: Client,
}

impl KubeDialer {
    /// Creates a dialer on top of an existing client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl Dialer for KubeDialer {
    async fn dial(&self, target: &ResolvedTarget) -> std::result::Result<BoxStream, BoxError> {
        tracing::debug!(
            "dialing {}?ports={}",
            portforward_path(&target.namespace, &target.pod),
            target.port
        );

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &target.namespace);
        let mut forwarder = pods.portforward(&target.pod, &[target.port]).await?;

        let stream = forwarder
            .take_stream(target.port)
            .ok_or_else(|| format!("no stream for port {} on pod {}", target.port, target.pod))?;

        let pod = target.pod.clone();
        tokio::spawn(async move {
            if let Err(e) = forwarder.join().await {
                tracing::warn!("port forward to pod {pod} ended with error: {e}");
            }
        });

        Ok(Box::new(stream))
    }
}

/// Local and remote ports of a tunnel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortPair {
    /// Local port; `0` asks the OS for an ephemeral port.
    pub local: u16,
    /// Port on the pod.
    pub remote: u16,
}

impl PortPair {
    /// Creates a pair, binding an ephemeral local port when `local` is `None`.
    #[must_use]
    pub fn new(local: Option<u16>, remote: u16) -> Self {
        Self {
            local: local.unwrap_or(0),
            remote,
        }
    }
}

impl fmt::Display for PortPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.local, self.remote)
    }
}

/// Options for starting tunnels.
#[derive(Clone, Debug)]
pub struct TunnelOptions {
    /// Address the local listener binds to.
    pub bind_address: IpAddr,

    /// How long [`TunnelManager::start`] waits for the loop to become ready.
    pub ready_timeout: Duration,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }
}

impl TunnelOptions {
    /// Sets the local bind address.
    #[must_use]
    pub fn bind_address(mut self, address: impl Into<IpAddr>) -> Self {
        self.bind_address = address.into();
        self
    }

    /// Sets the readiness timeout.
    #[must_use]
    pub fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }
}

/// Lifecycle state of a [`TunnelSession`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TunnelState {
    /// Started but not yet ready.
    Idle,
    /// Accepting and relaying local connections.
    Forwarding,
    /// Stopped. Terminal.
    Closed,
}

impl TunnelState {
    /// Whether the session may move from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Forwarding | Self::Closed) | (Self::Forwarding, Self::Closed)
        )
    }
}

/// State shared between a session, its handles and its forwarding loop.
struct Shared {
    state: watch::Sender<TunnelState>,
    stop: CancellationToken,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: watch::Sender::new(TunnelState::Idle),
            stop: CancellationToken::new(),
        }
    }

    fn state(&self) -> TunnelState {
        *self.state.borrow()
    }

    /// Applies a transition if it is allowed, returning whether it happened.
    fn advance(&self, next: TunnelState) -> bool {
        self.state.send_if_modified(|state| {
            if state.can_transition_to(next) {
                *state = next;
                true
            } else {
                false
            }
        })
    }

    fn close(&self) {
        self.stop.cancel();
        if self.advance(TunnelState::Closed) {
            tracing::debug!("port forward session closed");
        }
    }

    async fn closed(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|state| *state == TunnelState::Closed).await;
    }
}

/// Cloneable handle that can observe and close a session.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
}

impl SessionHandle {
    /// Requests the forwarding loop to stop. Safe to call any number of times.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Current state of the session.
    #[must_use]
    pub fn state(&self) -> TunnelState {
        self.shared.state()
    }

    /// Completes once the session is closed.
    pub async fn closed(&self) {
        self.shared.closed().await;
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("state", &self.state())
            .finish()
    }
}

/// A running port-forward tunnel.
pub struct TunnelSession {
    shared: Arc<Shared>,
    task: Option<JoinHandle<Result<()>>>,
    local_addr: SocketAddr,
    remote_port: u16,
    target: ResolvedTarget,
}

impl TunnelSession {
    /// Address the local listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Local port, resolved when an ephemeral port was requested.
    #[must_use]
    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Port on the pod.
    #[must_use]
    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    /// Pod the tunnel forwards to.
    #[must_use]
    pub fn target(&self) -> &ResolvedTarget {
        &self.target
    }

    /// Current state of the session.
    #[must_use]
    pub fn state(&self) -> TunnelState {
        self.shared.state()
    }

    /// Returns a handle for closing the session from elsewhere.
    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Requests the forwarding loop to stop. A second call is a no-op.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Waits for the forwarding loop to exit and returns its error, if any.
    ///
    /// Once the loop has been waited on, later calls return `Ok(())`.
    ///
    /// # Errors
    ///
    /// The error that ended the forwarding loop.
    pub async fn wait(&mut self) -> Result<()> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };

        match task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(Error::Forward(e.into())),
        }
    }
}

impl fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelSession")
            .field("local_addr", &self.local_addr)
            .field("remote_port", &self.remote_port)
            .field("target", &self.target)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Starts and owns the dialer for port-forward tunnels.
pub struct TunnelManager<D> {
    dialer: Arc<D>,
    options: TunnelOptions,
}

impl<D: Dialer> TunnelManager<D> {
    /// Creates a manager with default options.
    #[must_use]
    pub fn new(dialer: D) -> Self {
        Self::with_options(dialer, TunnelOptions::default())
    }

    /// Creates a manager with explicit options.
    #[must_use]
    pub fn with_options(dialer: D, options: TunnelOptions) -> Self {
        Self {
            dialer: Arc::new(dialer),
            options,
        }
    }

    /// Dialer used for new connections.
    #[must_use]
    pub fn dialer(&self) -> &D {
        &self.dialer
    }

    /// Options used for new tunnels.
    #[must_use]
    pub fn options(&self) -> &TunnelOptions {
        &self.options
    }

    /// Starts forwarding `ports.local` to `ports.remote` on the target pod.
    ///
    /// Returns once the pod has been dialed and the local listener is bound;
    /// the loop keeps running in the background until the session is closed or
    /// the pod goes away.
    ///
    /// # Errors
    ///
    /// [`Error::Dialer`] if the pod cannot be dialed,
    /// [`Error::SessionInit`] if `ports.remote` is not the target's port or the
    /// local port cannot be bound, and [`Error::ReadyTimeout`] if the loop does
    /// not become ready in time. The session is closed before any of these is
    /// returned.
    pub async fn start(&self, target: ResolvedTarget, ports: PortPair) -> Result<TunnelSession> {
        if ports.remote != target.port {
            return Err(Error::SessionInit(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("remote port {} does not match target {target}", ports.remote),
            )));
        }

        tracing::debug!("port forwarding {ports} to {target}");

        let shared = Arc::new(Shared::new());
        let bind = SocketAddr::new(self.options.bind_address, ports.local);
        let (ready_tx, ready_rx) = oneshot::channel();

        let task = tokio::spawn(run(
            Arc::clone(&self.dialer),
            target.clone(),
            bind,
            Arc::clone(&shared),
            ready_tx,
        ));

        let mut session = TunnelSession {
            shared,
            task: Some(task),
            local_addr: bind,
            remote_port: ports.remote,
            target,
        };

        match await_ready(ready_rx, self.options.ready_timeout).await {
            Ok(Some(addr)) if session.shared.advance(TunnelState::Forwarding) => {
                session.local_addr = addr;
                tracing::info!("Forwarding from {addr} -> {}", session.target);
                Ok(session)
            }
            Ok(_) => {
                session.close();
                let err = session.wait().await.err().unwrap_or_else(|| {
                    Error::SessionInit(io::Error::other("forwarding loop exited before ready"))
                });
                Err(err)
            }
            Err(e) => {
                session.close();
                Err(e)
            }
        }
    }
}

/// Waits for the readiness signal.
///
/// `Ok(None)` means the loop exited without ever becoming ready.
async fn await_ready(
    ready: oneshot::Receiver<SocketAddr>,
    timeout: Duration,
) -> Result<Option<SocketAddr>> {
    match tokio::time::timeout(timeout, ready).await {
        Ok(Ok(addr)) => Ok(Some(addr)),
        Ok(Err(_)) => Ok(None),
        Err(_) => Err(Error::ReadyTimeout(timeout)),
    }
}

/// Background task: runs the loop and marks the session closed when it ends.
async fn run<D: Dialer>(
    dialer: Arc<D>,
    target: ResolvedTarget,
    bind: SocketAddr,
    shared: Arc<Shared>,
    ready: oneshot::Sender<SocketAddr>,
) -> Result<()> {
    let result = forward_loop(dialer.as_ref(), &target, bind, &shared.stop, ready).await;

    if let Err(e) = &result {
        tracing::error!("port forward to {target} failed: {e}");
    }

    shared.close();
    result
}

async fn forward_loop<D: Dialer>(
    dialer: &D,
    target: &ResolvedTarget,
    bind: SocketAddr,
    stop: &CancellationToken,
    ready: oneshot::Sender<SocketAddr>,
) -> Result<()> {
    // Readiness is only reported once the pod has answered.
    let mut primed = tokio::select! {
        () = stop.cancelled() => return Ok(()),
        dialed = dialer.dial(target) => Some(dialed.map_err(Error::Dialer)?),
    };

    let listener = TcpListener::bind(bind).await.map_err(Error::SessionInit)?;
    let local = listener.local_addr().map_err(Error::SessionInit)?;

    if ready.send(local).is_err() {
        tracing::debug!("port forward start abandoned before ready");
        return Ok(());
    }

    let mut relays = JoinSet::new();

    loop {
        tokio::select! {
            () = stop.cancelled() => {
                tracing::debug!("stopping port forward on {local}");
                break;
            }

            (socket, peer) = next_connection(|| listener.accept()) => {
                tracing::debug!("Handling connection for {} from {peer}", target.port);

                let upstream = match primed.take() {
                    Some(stream) => stream,
                    None => tokio::select! {
                        () = stop.cancelled() => break,
                        dialed = dialer.dial(target) => dialed.map_err(Error::Forward)?,
                    },
                };

                relays.spawn(relay(socket, upstream, peer));
            }

            Some(_) = relays.join_next(), if !relays.is_empty() => {}
        }
    }

    relays.shutdown().await;
    Ok(())
}

/// Accepts the next local connection.
///
/// Accept errors such as running out of file descriptors are logged and
/// retried after [`ACCEPT_BACKOFF`]; they never end the forwarding loop.
async fn next_connection<F, Fut, T>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(conn) => return conn,
            Err(e) => {
                tracing::warn!("failed to accept local connection: {e}");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

/// Copies bytes both ways between a local connection and the pod.
async fn relay(mut local: TcpStream, mut upstream: BoxStream, peer: SocketAddr) {
    match tokio::io::copy_bidirectional(&mut local, &mut upstream).await {
        Ok((sent, received)) => {
            tracing::debug!("connection from {peer} done: {sent} bytes sent, {received} received");
        }

        Err(e) => {
            tracing::debug!("connection from {peer} ended: {e}");
        }
    }
}
