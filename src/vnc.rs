use std::sync::Arc;

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::Value;

use crate::cluster::Cluster;

/// Where a console session must connect on the hypervisor side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleTarget {
    pub node: String,
    pub port: u64,
    pub password: String,
}

/// An established forwarding on the proxy.
#[derive(Debug, Clone)]
pub struct VncForwarding {
    pub host: String,
    pub port: u16,
    pub password: String,
}

/// The external VNC authentication proxy. Token contents are opaque to
/// the core; only the proxy and the viewer interpret them.
#[async_trait]
pub trait VncProxy: Send + Sync {
    async fn request_forwarding(&self, target: &ConsoleTarget) -> anyhow::Result<VncForwarding>;
    async fn request_novnc_forwarding(&self, target: &ConsoleTarget) -> anyhow::Result<String>;
    async fn issue_token(&self, target: &ConsoleTarget) -> anyhow::Result<String>;
}

/// Builds console targets from instance data and hands them to the proxy.
pub struct ConsoleBroker {
    proxy: Arc<dyn VncProxy>,
}

impl ConsoleBroker {
    pub fn new(proxy: Arc<dyn VncProxy>) -> Self {
        ConsoleBroker { proxy }
    }

    /// Resolves the instance's primary node and console port and asks the
    /// proxy for a classic VNC forwarding. Each request gets a fresh
    /// one-shot password.
    pub async fn vnc_forwarding(
        &self,
        cluster: &Cluster,
        instance: &str,
    ) -> anyhow::Result<VncForwarding> {
        let target = self.console_target(cluster, instance).await?;
        self.proxy.request_forwarding(&target).await
    }

    /// Like [`vnc_forwarding`](Self::vnc_forwarding) but for the
    /// websocket-based viewer; the proxy answers with the viewer URL.
    pub async fn novnc_forwarding(
        &self,
        cluster: &Cluster,
        instance: &str,
    ) -> anyhow::Result<String> {
        let target = self.console_target(cluster, instance).await?;
        self.proxy.request_novnc_forwarding(&target).await
    }

    pub async fn console_token(
        &self,
        cluster: &Cluster,
        instance: &str,
    ) -> anyhow::Result<String> {
        let target = self.console_target(cluster, instance).await?;
        self.proxy.issue_token(&target).await
    }

    async fn console_target(
        &self,
        cluster: &Cluster,
        instance: &str,
    ) -> anyhow::Result<ConsoleTarget> {
        let info = cluster.get_instance_info(instance).await?;
        let node = info
            .get("pnode")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("instance {} has no primary node", instance))?;
        let port = info
            .get("network_port")
            .and_then(Value::as_u64)
            .ok_or_else(|| anyhow::anyhow!("instance {} exposes no console port", instance))?;
        Ok(ConsoleTarget {
            node: node.to_owned(),
            port,
            password: random_password(),
        })
    }
}

fn random_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect()
}
