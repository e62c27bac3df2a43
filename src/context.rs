//! Collaborators shared by every controller

use crate::ccs::Configuration;
use crate::clients::{ClientFactory, ClientPool, RouterTarget, StorageRouterClient};
use crate::common::{ControllerConfig, Result};
use crate::dal::{Dal, StorageDriver, StorageRouter, StorageRouterId, Tables, VPoolId};
use std::sync::Arc;
use std::time::Duration;

/// Timing knobs of the controllers
#[derive(Debug, Clone)]
pub struct Tunables {
    /// Polls of the volume router startup counter after a start
    pub startup_poll_attempts: u32,
    pub startup_poll_interval: Duration,
    /// Timeout of `update_cluster_node_configs` on sibling routers
    pub registry_update_timeout: Duration,
    /// How long to wait for a named CCS mutex
    pub lock_wait: Duration,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            startup_poll_attempts: 60,
            startup_poll_interval: Duration::from_secs(1),
            registry_update_timeout: Duration::from_secs(10),
            lock_wait: Duration::from_secs(60),
        }
    }
}

#[derive(Clone)]
pub struct Context {
    pub dal: Arc<Dal>,
    pub ccs: Configuration,
    pub clients: Arc<ClientPool>,
    /// Machine id of the host this controller runs on
    pub machine_id: String,
    pub tunables: Tunables,
}

impl Context {
    pub fn new(
        dal: Arc<Dal>,
        ccs: Configuration,
        clients: Arc<ClientPool>,
        machine_id: impl Into<String>,
    ) -> Self {
        Self {
            dal,
            ccs,
            clients,
            machine_id: machine_id.into(),
            tunables: Tunables::default(),
        }
    }

    pub fn from_config(
        config: &ControllerConfig,
        dal: Arc<Dal>,
        ccs: Configuration,
        factory: Arc<dyn ClientFactory>,
    ) -> Self {
        let clients = Arc::new(ClientPool::new(factory, config.reachability_timeout()));
        let mut ctx = Self::new(dal, ccs, clients, config.machine_id.clone());
        ctx.tunables.startup_poll_attempts = config.startup_poll_attempts;
        ctx
    }

    pub fn with_tunables(mut self, tunables: Tunables) -> Self {
        self.tunables = tunables;
        self
    }

    /// Host row of this controller, once the node is initialised
    pub fn local_storagerouter(&self) -> Result<StorageRouter> {
        self.dal.read(|t| {
            t.storagerouter_by_machine_id(&self.machine_id)
                .cloned()
                .ok_or_else(|| {
                    crate::Error::PreconditionFailed(format!(
                        "host {} is not initialised",
                        self.machine_id
                    ))
                })
        })
    }

    /// Client on the volume router of one StorageDriver
    pub fn router_for_storagedriver(
        &self,
        tables: &Tables,
        storagedriver: &StorageDriver,
        timeout: Duration,
    ) -> Result<Arc<dyn StorageRouterClient>> {
        let vpool = tables.vpool(storagedriver.vpool)?;
        let target = RouterTarget {
            vpool: vpool.id,
            vpool_name: vpool.name.clone(),
            router_id: storagedriver.storagedriver_id.clone(),
            ip: storagedriver.cluster_ip.clone(),
            port: storagedriver.ports.xmlrpc,
        };
        self.clients.router(&target, timeout)
    }

    /// Client on the volume router cluster of a vPool, through the
    /// StorageDriver on `prefer` when there is one.
    pub fn router_for_vpool(
        &self,
        tables: &Tables,
        vpool: VPoolId,
        prefer: Option<StorageRouterId>,
        timeout: Duration,
    ) -> Result<Arc<dyn StorageRouterClient>> {
        let storagedrivers = tables.storagedrivers_of_vpool(vpool);
        let storagedriver = prefer
            .and_then(|host| storagedrivers.iter().find(|sd| sd.storagerouter == host))
            .or_else(|| storagedrivers.first())
            .ok_or_else(|| {
                crate::Error::PreconditionFailed(format!("vPool {} has no StorageDrivers", vpool))
            })?;
        self.router_for_storagedriver(tables, storagedriver, timeout)
    }
}
