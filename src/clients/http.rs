//! JSON-over-HTTP implementations of the client contracts
//!
//! Every endpoint answers `{"ok": <value>}` or
//! `{"error": {"kind": ..., "message": ...}}`; error kinds are mapped back
//! onto [`crate::Error`] so callers can tell timeouts and missing namespaces
//! apart from other upstream failures.

use crate::ccs::ArakoonConfig;
use crate::clients::{
    AlbaNode, BackendClient, ClientFactory, ClusterNodeConfig, DtlConfig, DtlConfigMode,
    HostAgent, MdsClient, MdsNodeConfig, MdsRole, RouterTarget, StorageRouterClient, VolumeInfo,
};
use crate::common::{ProcessIdentity, Result};
use crate::dal::{BackendInfo, StorageRouter};
use crate::Error;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

impl From<&Error> for ErrorBody {
    fn from(e: &Error) -> Self {
        Self {
            kind: e.kind().to_string(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Envelope<T> {
    Ok(T),
    Error(ErrorBody),
}

/// Request bodies of the host agent API, shared with the server side
pub mod agent {
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeMap;

    #[derive(Debug, Serialize, Deserialize)]
    pub struct PathsRequest {
        pub paths: Vec<String>,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct PathRequest {
        pub path: String,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct ServiceRequest {
        pub name: String,
        #[serde(default)]
        pub params: BTreeMap<String, String>,
    }
}

#[derive(Clone)]
struct RpcTransport {
    client: reqwest::Client,
    base: String,
}

impl RpcTransport {
    fn new(base: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base })
    }

    async fn call<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized + Sync,
        Resp: DeserializeOwned,
    {
        self.call_inner(path, body, None).await
    }

    async fn call_with_timeout<Req, Resp>(
        &self,
        path: &str,
        body: &Req,
        timeout: Duration,
    ) -> Result<Resp>
    where
        Req: Serialize + ?Sized + Sync,
        Resp: DeserializeOwned,
    {
        self.call_inner(path, body, Some(timeout)).await
    }

    async fn call_inner<Req, Resp>(
        &self,
        path: &str,
        body: &Req,
        timeout: Option<Duration>,
    ) -> Result<Resp>
    where
        Req: Serialize + ?Sized + Sync,
        Resp: DeserializeOwned,
    {
        let url = format!("{}{}", self.base, path);
        let mut request = self.client.post(&url).json(body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let envelope: Envelope<Resp> = request.send().await?.json().await?;
        match envelope {
            Envelope::Ok(value) => Ok(value),
            Envelope::Error(e) => Err(Error::from_kind(&e.kind, e.message)),
        }
    }
}

pub struct HttpMdsClient {
    rpc: RpcTransport,
}

impl HttpMdsClient {
    pub fn new(ip: &str, port: u16, timeout: Duration) -> Result<Self> {
        Ok(Self {
            rpc: RpcTransport::new(format!("http://{}:{}/mds", ip, port), timeout)?,
        })
    }
}

#[async_trait]
impl MdsClient for HttpMdsClient {
    async fn list_namespaces(&self) -> Result<Vec<String>> {
        self.rpc.call("/namespaces/list", &json!({})).await
    }

    async fn create_namespace(&self, volume_id: &str) -> Result<()> {
        self.rpc
            .call("/namespaces/create", &json!({ "volume_id": volume_id }))
            .await
    }

    async fn remove_namespace(&self, volume_id: &str) -> Result<()> {
        self.rpc
            .call("/namespaces/remove", &json!({ "volume_id": volume_id }))
            .await
    }

    async fn get_role(&self, volume_id: &str) -> Result<MdsRole> {
        self.rpc
            .call("/role/get", &json!({ "volume_id": volume_id }))
            .await
    }

    async fn set_role(&self, volume_id: &str, role: MdsRole) -> Result<()> {
        self.rpc
            .call("/role/set", &json!({ "volume_id": volume_id, "role": role }))
            .await
    }

    async fn catch_up(&self, volume_id: &str, dry_run: bool) -> Result<u64> {
        self.rpc
            .call(
                "/catch-up",
                &json!({ "volume_id": volume_id, "dry_run": dry_run }),
            )
            .await
    }
}

pub struct HttpStorageRouterClient {
    rpc: RpcTransport,
}

impl HttpStorageRouterClient {
    pub fn new(target: &RouterTarget, timeout: Duration) -> Result<Self> {
        Ok(Self {
            rpc: RpcTransport::new(
                format!("http://{}:{}/vrouter", target.ip, target.port),
                timeout,
            )?,
        })
    }
}

#[async_trait]
impl StorageRouterClient for HttpStorageRouterClient {
    async fn info_volume(&self, volume_id: &str) -> Result<VolumeInfo> {
        self.rpc
            .call("/volumes/info", &json!({ "volume_id": volume_id }))
            .await
    }

    async fn list_volumes(&self, router_id: Option<&str>) -> Result<Vec<String>> {
        self.rpc
            .call("/volumes/list", &json!({ "router_id": router_id }))
            .await
    }

    async fn update_metadata_backend_config(
        &self,
        volume_id: &str,
        config: &[MdsNodeConfig],
        req_timeout: Duration,
    ) -> Result<()> {
        self.rpc
            .call_with_timeout(
                "/volumes/metadata-backend-config",
                &json!({
                    "volume_id": volume_id,
                    "config": config,
                    "req_timeout_secs": req_timeout.as_secs(),
                }),
                req_timeout,
            )
            .await
    }

    async fn get_node_configs(&self) -> Result<Vec<ClusterNodeConfig>> {
        self.rpc.call("/registry/get", &json!({})).await
    }

    async fn set_node_configs(&self, configs: &[ClusterNodeConfig]) -> Result<()> {
        self.rpc
            .call("/registry/set", &json!({ "configs": configs }))
            .await
    }

    async fn erase_node_configs(&self) -> Result<()> {
        self.rpc.call("/registry/erase", &json!({})).await
    }

    async fn update_cluster_node_configs(&self, router_id: &str, timeout: Duration) -> Result<()> {
        self.rpc
            .call_with_timeout(
                "/registry/reload",
                &json!({ "router_id": router_id }),
                timeout,
            )
            .await
    }

    async fn set_manual_dtl_config(
        &self,
        volume_id: &str,
        config: Option<&DtlConfig>,
    ) -> Result<()> {
        self.rpc
            .call(
                "/volumes/dtl/set",
                &json!({ "volume_id": volume_id, "config": config }),
            )
            .await
    }

    async fn get_dtl_config(&self, volume_id: &str) -> Result<Option<DtlConfig>> {
        self.rpc
            .call("/volumes/dtl/get", &json!({ "volume_id": volume_id }))
            .await
    }

    async fn get_dtl_config_mode(&self, volume_id: &str) -> Result<DtlConfigMode> {
        self.rpc
            .call("/volumes/dtl/mode", &json!({ "volume_id": volume_id }))
            .await
    }

    async fn destroy_filesystem(&self) -> Result<()> {
        self.rpc.call("/filesystem/destroy", &json!({})).await
    }
}

pub struct HttpBackendClient {
    rpc: RpcTransport,
}

impl HttpBackendClient {
    pub fn new(backend: &BackendInfo, timeout: Duration) -> Result<Self> {
        Ok(Self {
            rpc: RpcTransport::new(
                format!(
                    "http://{}:{}/alba",
                    backend.connection.host, backend.connection.port
                ),
                timeout,
            )?,
        })
    }
}

#[async_trait]
impl BackendClient for HttpBackendClient {
    async fn get_arakoon_config(&self, backend_id: &str) -> Result<ArakoonConfig> {
        self.rpc
            .call("/backends/arakoon-config", &json!({ "backend_id": backend_id }))
            .await
    }

    async fn list_alba_nodes(&self, backend_id: &str) -> Result<Vec<AlbaNode>> {
        self.rpc
            .call("/backends/nodes", &json!({ "backend_id": backend_id }))
            .await
    }
}

pub struct HttpHostAgent {
    rpc: RpcTransport,
}

impl HttpHostAgent {
    pub fn new(ip: &str, port: u16, timeout: Duration) -> Result<Self> {
        Ok(Self {
            rpc: RpcTransport::new(format!("http://{}:{}/agent", ip, port), timeout)?,
        })
    }

    async fn service_call<Resp: DeserializeOwned>(&self, path: &str, name: &str) -> Result<Resp> {
        self.rpc
            .call(
                path,
                &agent::ServiceRequest {
                    name: name.to_string(),
                    params: BTreeMap::new(),
                },
            )
            .await
    }
}

#[async_trait]
impl HostAgent for HttpHostAgent {
    async fn ping(&self) -> Result<()> {
        self.rpc.call("/ping", &json!({})).await
    }

    async fn create_dirs(&self, paths: &[String]) -> Result<()> {
        self.rpc
            .call(
                "/dirs/create",
                &agent::PathsRequest {
                    paths: paths.to_vec(),
                },
            )
            .await
    }

    async fn remove_dirs(&self, paths: &[String]) -> Result<()> {
        self.rpc
            .call(
                "/dirs/remove",
                &agent::PathsRequest {
                    paths: paths.to_vec(),
                },
            )
            .await
    }

    async fn dir_exists(&self, path: &str) -> Result<bool> {
        self.rpc
            .call(
                "/dirs/exists",
                &agent::PathRequest {
                    path: path.to_string(),
                },
            )
            .await
    }

    async fn available_space(&self, path: &str) -> Result<u64> {
        self.rpc
            .call(
                "/space",
                &agent::PathRequest {
                    path: path.to_string(),
                },
            )
            .await
    }

    async fn add_service(&self, name: &str, params: &BTreeMap<String, String>) -> Result<()> {
        self.rpc
            .call(
                "/services/add",
                &agent::ServiceRequest {
                    name: name.to_string(),
                    params: params.clone(),
                },
            )
            .await
    }

    async fn start_service(&self, name: &str) -> Result<()> {
        self.service_call("/services/start", name).await
    }

    async fn stop_service(&self, name: &str) -> Result<()> {
        self.service_call("/services/stop", name).await
    }

    async fn remove_service(&self, name: &str) -> Result<()> {
        self.service_call("/services/remove", name).await
    }

    async fn has_service(&self, name: &str) -> Result<bool> {
        self.service_call("/services/exists", name).await
    }

    async fn service_identity(&self, name: &str) -> Result<Option<ProcessIdentity>> {
        self.service_call("/services/identity", name).await
    }

    async fn worker_identity(&self) -> Result<ProcessIdentity> {
        self.rpc.call("/worker/identity", &json!({})).await
    }

    async fn startup_counter(&self, name: &str) -> Result<u64> {
        self.service_call("/services/startup-counter", name).await
    }
}

/// Builds HTTP clients; every host agent listens on the same port
pub struct HttpClientFactory {
    agent_port: u16,
    agent_timeout: Duration,
}

impl HttpClientFactory {
    pub fn new(agent_port: u16, agent_timeout: Duration) -> Self {
        Self {
            agent_port,
            agent_timeout,
        }
    }
}

impl ClientFactory for HttpClientFactory {
    fn mds_client(&self, ip: &str, port: u16, timeout: Duration) -> Result<Arc<dyn MdsClient>> {
        Ok(Arc::new(HttpMdsClient::new(ip, port, timeout)?))
    }

    fn storagerouter_client(
        &self,
        target: &RouterTarget,
        timeout: Duration,
    ) -> Result<Arc<dyn StorageRouterClient>> {
        Ok(Arc::new(HttpStorageRouterClient::new(target, timeout)?))
    }

    fn backend_client(&self, backend: &BackendInfo) -> Result<Arc<dyn BackendClient>> {
        Ok(Arc::new(HttpBackendClient::new(backend, self.agent_timeout)?))
    }

    fn host_agent(&self, host: &StorageRouter) -> Result<Arc<dyn HostAgent>> {
        Ok(Arc::new(HttpHostAgent::new(
            &host.ip,
            self.agent_port,
            self.agent_timeout,
        )?))
    }
}
