//! Read-only access to the cluster objects that resolution needs.

use std::future::Future;

use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::ListParams;
use kube::{Api, Client};

use crate::error::{BoxError, Error, Result};

/// Cluster API operations consumed by service resolution.
///
/// Implementations make a single attempt per call. Bounding the call duration is
/// the implementation's concern.
pub trait Cluster: Send + Sync {
    /// Fetches a service, failing with [`Error::NotFound`] when it is absent and
    /// [`Error::Api`] on any other failure.
    fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Service>> + Send;

    /// Lists the pods in `namespace` matching an equality label selector.
    fn list_pods(
        &self,
        namespace: &str,
        selector: &str,
    ) -> impl Future<Output = std::result::Result<Vec<Pod>, BoxError>> + Send;
}

/// [`Cluster`] backed by a live `kube` client.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    /// Wraps an existing client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl Cluster for KubeCluster {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);

        match services.get_opt(name).await {
            Ok(Some(svc)) => Ok(svc),
            Ok(None) => Err(Error::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            }),
            Err(e) => Err(Error::Api(e.into())),
        }
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &str,
    ) -> std::result::Result<Vec<Pod>, BoxError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods.list(&ListParams::default().labels(selector)).await?;
        Ok(list.items)
    }
}
