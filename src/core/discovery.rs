//! Running-member discovery
//!
//! The etcd members are pods whose addresses change whenever they are
//! rescheduled. [`Discovery`] answers "which members are running right now";
//! [`KubeDiscovery`] asks the in-cluster Kubernetes API.

use crate::core::Endpoint;
use crate::core::error::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use tracing::debug;

/// Service-account credentials mounted into every pod
const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

const RUNNING_PHASE: &str = "Running";

/// One running member of the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub name: String,
    pub endpoint: Endpoint,
}

#[async_trait]
pub trait Discovery: Send + Sync {
    /// Lists members matching `selector` that are in the running phase.
    async fn list_running_members(&self, selector: &str) -> Result<Vec<Member>>;

    /// Same as [`Discovery::list_running_members`], endpoints only, order kept.
    async fn list_running_endpoints(&self, selector: &str) -> Result<Vec<Endpoint>> {
        Ok(self
            .list_running_members(selector)
            .await?
            .into_iter()
            .map(|m| m.endpoint)
            .collect())
    }
}

/// Pod list response, reduced to the fields we read
#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    metadata: PodMetadata,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Debug, Deserialize)]
struct PodMetadata {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodStatus {
    #[serde(default)]
    phase: String,
    #[serde(default)]
    pod_ip: Option<String>,
}

/// Keeps running pods that have an address, in response order.
fn running_members(list: PodList, client_port: u16) -> Vec<Member> {
    list.items
        .into_iter()
        .filter(|pod| pod.status.phase == RUNNING_PHASE)
        .filter_map(|pod| {
            let ip: IpAddr = pod.status.pod_ip.as_deref()?.parse().ok()?;
            Some(Member {
                name: pod.metadata.name,
                endpoint: SocketAddr::new(ip, client_port),
            })
        })
        .collect()
}

/// Kubernetes API client using the pod's service account
pub struct KubeDiscovery {
    client: reqwest::Client,
    base_url: String,
    token: String,
    namespace: String,
    client_port: u16,
}

impl KubeDiscovery {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        token: impl Into<String>,
        namespace: impl Into<String>,
        client_port: u16,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            token: token.into(),
            namespace: namespace.into(),
            client_port,
        }
    }

    /// Builds a client from the service-account mount and the
    /// `KUBERNETES_SERVICE_HOST`/`KUBERNETES_SERVICE_PORT` variables.
    ///
    /// # Errors
    ///
    /// Returns `Err` when not running inside a pod or the credentials are
    /// unreadable.
    pub fn in_cluster(namespace: impl Into<String>, client_port: u16) -> Result<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| Error::Discovery("KUBERNETES_SERVICE_HOST is not set".to_string()))?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());

        let dir = Path::new(SERVICE_ACCOUNT_DIR);
        let token = std::fs::read_to_string(dir.join("token"))?;
        let ca = std::fs::read(dir.join("ca.crt"))?;
        let ca = reqwest::Certificate::from_pem(&ca)?;

        let client = reqwest::Client::builder()
            .add_root_certificate(ca)
            .build()?;

        // IPv6 service hosts need brackets in the URL
        let host = if host.contains(':') {
            format!("[{host}]")
        } else {
            host
        };

        Ok(Self::new(
            client,
            format!("https://{host}:{port}"),
            token.trim(),
            namespace,
            client_port,
        ))
    }

    fn pods_url(&self) -> String {
        format!("{}/api/v1/namespaces/{}/pods", self.base_url, self.namespace)
    }
}

#[async_trait]
impl Discovery for KubeDiscovery {
    async fn list_running_members(&self, selector: &str) -> Result<Vec<Member>> {
        let response = self
            .client
            .get(self.pods_url())
            .bearer_auth(&self.token)
            .query(&[("labelSelector", selector)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Discovery(format!(
                "listing pods in {} failed with {status}: {}",
                self.namespace,
                body.trim()
            )));
        }

        let list: PodList = response.json().await?;
        let total = list.items.len();
        let members = running_members(list, self.client_port);
        debug!(selector, total, running = members.len(), "listed members");
        Ok(members)
    }
}
