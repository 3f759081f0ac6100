//! Service to pod resolution.
//!
//! Resolution walks from a service to a single running pod and container port:
//!
//! 1. Fetches the service by namespace and name
//! 2. Builds an equality label selector from the service's selector map
//! 3. Lists the pods matching that selector
//! 4. Picks the first running pod whose resolved target port equals the
//!    requested remote port
//!
//! Named target ports are looked up across the pod's containers, in container
//! order and then port order.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::core::v1::{Container, Pod, Service, ServicePort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::cluster::Cluster;
use crate::error::{Error, Result};

/// Lifecycle phase of a pod.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PodPhase {
    /// Accepted but not all containers are running.
    Pending,
    /// Bound to a node with at least one container running.
    Running,
    /// All containers terminated successfully.
    Succeeded,
    /// All containers terminated, at least one in failure.
    Failed,
    /// Phase missing or not recognised.
    Unknown,
}

impl PodPhase {
    /// Reads the phase from a pod's status. A missing phase is `Unknown`.
    #[must_use]
    pub fn of(pod: &Pod) -> Self {
        pod.status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .and_then(|p| p.parse().ok())
            .unwrap_or(Self::Unknown)
    }
}

impl FromStr for PodPhase {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(Self::Pending),
            "Running" => Ok(Self::Running),
            "Succeeded" => Ok(Self::Succeeded),
            "Failed" => Ok(Self::Failed),
            "Unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown pod phase {other:?}")),
        }
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Unknown => "Unknown",
        };

        f.write_str(s)
    }
}

/// The pod and container port selected for forwarding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedTarget {
    /// Namespace of the pod.
    pub namespace: String,
    /// Name of the pod.
    pub pod: String,
    /// Container port on the pod.
    pub port: u16,
}

impl fmt::Display for ResolvedTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.namespace, self.pod, self.port)
    }
}

/// Resolves `namespace/service` to the first running pod exposing `remote_port`.
///
/// # Errors
///
/// Returns the first failure from any stage: [`Error::MissingField`],
/// [`Error::NotFound`], [`Error::Api`], [`Error::NoSelector`],
/// [`Error::NoPodsFound`], [`Error::NoBackingPods`] or [`Error::NoReadyPod`].
pub async fn resolve<C: Cluster>(
    cluster: &C,
    namespace: &str,
    service: &str,
    remote_port: u16,
) -> Result<ResolvedTarget> {
    let svc = fetch_service(cluster, namespace, service).await?;
    let pods = select_pods(cluster, &svc).await?;
    match_port(&svc, &pods, remote_port)
}

/// Fetches the service, validating the inputs first.
///
/// # Errors
///
/// [`Error::MissingField`] for empty inputs, otherwise whatever the cluster
/// reports.
pub async fn fetch_service<C: Cluster>(
    cluster: &C,
    namespace: &str,
    name: &str,
) -> Result<Service> {
    if namespace.is_empty() {
        return Err(Error::MissingField("namespace"));
    }

    if name.is_empty() {
        return Err(Error::MissingField("service"));
    }

    tracing::info!("Getting service {name} in namespace {namespace}");
    cluster.get_service(namespace, name).await
}

/// Lists the pods backing a service.
///
/// # Errors
///
/// [`Error::NoSelector`] if the service selects nothing, [`Error::NoPodsFound`]
/// if the listing fails and [`Error::NoBackingPods`] if it comes back empty.
pub async fn select_pods<C: Cluster>(cluster: &C, svc: &Service) -> Result<Vec<Pod>> {
    let namespace = svc.metadata.namespace.clone().unwrap_or_default();
    let name = svc.metadata.name.clone().unwrap_or_default();

    let selector = svc
        .spec
        .as_ref()
        .and_then(|spec| spec.selector.as_ref())
        .and_then(label_selector);

    let Some(selector) = selector else {
        return Err(Error::NoSelector { namespace, name });
    };

    tracing::info!("Getting pods with selector {selector}");
    let pods = cluster
        .list_pods(&namespace, &selector)
        .await
        .map_err(|source| Error::NoPodsFound {
            selector: selector.clone(),
            source,
        })?;

    if pods.is_empty() {
        return Err(Error::NoBackingPods { namespace, name });
    }

    tracing::debug!("{} pods match {selector}", pods.len());
    Ok(pods)
}

/// Joins a selector map into `k1=v1,k2=v2`, ordered by key.
///
/// Returns `None` for an empty map: an empty selector would match every pod in
/// the namespace.
#[must_use]
pub fn label_selector(labels: &BTreeMap<String, String>) -> Option<String> {
    if labels.is_empty() {
        return None;
    }

    let pairs: Vec<String> = labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
    Some(pairs.join(","))
}

/// Picks the first running pod, and the first service port on it, that resolves
/// to `remote_port`.
///
/// # Errors
///
/// [`Error::NoReadyPod`] carrying the last non-running phase seen, or no phase
/// when every pod was running but none exposed the port.
pub fn match_port(svc: &Service, pods: &[Pod], remote_port: u16) -> Result<ResolvedTarget> {
    let ports: &[ServicePort] = svc
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_deref())
        .unwrap_or_default();

    let mut last_phase = None;

    for pod in pods {
        let phase = PodPhase::of(pod);

        if phase != PodPhase::Running {
            tracing::debug!(
                "skipping pod {} in phase {phase}",
                pod.metadata.name.as_deref().unwrap_or_default()
            );
            last_phase = Some(phase);
            continue;
        }

        let containers: &[Container] = pod
            .spec
            .as_ref()
            .map(|spec| spec.containers.as_slice())
            .unwrap_or_default();

        for port in ports {
            if target_port(port, containers) == Some(i32::from(remote_port)) {
                let pod_name = pod.metadata.name.clone().unwrap_or_default();
                tracing::info!("Found pod {pod_name} with remote port {remote_port}");

                return Ok(ResolvedTarget {
                    namespace: pod
                        .metadata
                        .namespace
                        .clone()
                        .or_else(|| svc.metadata.namespace.clone())
                        .unwrap_or_default(),
                    pod: pod_name,
                    port: remote_port,
                });
            }
        }
    }

    Err(Error::NoReadyPod {
        remote_port,
        last_phase,
    })
}

/// Resolves a service port's target against a pod's containers.
///
/// A missing `targetPort` defaults to the service port, as the API server does.
fn target_port(port: &ServicePort, containers: &[Container]) -> Option<i32> {
    match &port.target_port {
        None => Some(port.port),
        Some(IntOrString::Int(n)) => Some(*n),
        Some(IntOrString::String(s)) => match s.parse::<i32>() {
            Ok(n) => Some(n),
            Err(_) => named_port(s, containers),
        },
    }
}

/// Finds the first container port with the given name.
fn named_port(name: &str, containers: &[Container]) -> Option<i32> {
    containers
        .iter()
        .flat_map(|c| c.ports.iter().flatten())
        .find(|p| p.name.as_deref() == Some(name))
        .map(|p| p.container_port)
}
