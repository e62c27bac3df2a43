//! Controller daemon

use crate::ccs::Configuration;
use crate::clients::http::HttpClientFactory;
use crate::clients::sim::SimCluster;
use crate::clients::{ClientFactory, HostAgent};
use crate::common::{Cancellation, ControllerConfig, Result};
use crate::controller::agent::LocalHostAgent;
use crate::controller::http::{create_router, AdminState};
use crate::dal::{Dal, NodeType, StorageRouter, StorageRouterId};
use crate::dtl::{dtl_checkup, DtlScope};
use crate::ops::mds_checkup;
use crate::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Timeout of host agent calls made by this controller
const AGENT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
enum Checkup {
    Mds,
    Dtl,
}

impl Checkup {
    fn name(self) -> &'static str {
        match self {
            Checkup::Mds => "MDS",
            Checkup::Dtl => "DTL",
        }
    }

    async fn run(self, ctx: &Context, cancel: &Cancellation) -> Result<usize> {
        match self {
            Checkup::Mds => mds_checkup(ctx, None, cancel).await.map(|r| r.errors.len()),
            Checkup::Dtl => dtl_checkup(ctx, DtlScope::All, cancel)
                .await
                .map(|r| r.errors.len()),
        }
    }
}

fn spawn_checkup(
    checkup: Checkup,
    every_secs: u64,
    ctx: Context,
    shutdown: Cancellation,
) -> Option<JoinHandle<()>> {
    if every_secs == 0 {
        tracing::info!("Periodic {} checkup disabled", checkup.name());
        return None;
    }
    let every = Duration::from_secs(every_secs);
    Some(tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if shutdown.is_cancelled() {
                break;
            }
            tracing::info!("Starting periodic {} checkup", checkup.name());
            match checkup.run(&ctx, &shutdown).await {
                Ok(0) => {}
                Ok(errors) => {
                    tracing::warn!(errors, "Periodic {} checkup finished with errors", checkup.name())
                }
                Err(crate::Error::Cancelled) => break,
                Err(e) => tracing::error!("Periodic {} checkup failed: {}", checkup.name(), e),
            }
        }
    }))
}

pub struct Controller {
    config: ControllerConfig,
    simulation: Option<SimCluster>,
}

impl Controller {
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            config,
            simulation: None,
        }
    }

    /// Controller whose RPC peers are an in-process simulated cluster. It
    /// always serves the admin API, on an in-memory DAL unless a path is set.
    pub fn simulated(config: ControllerConfig, sim: SimCluster) -> Self {
        Self {
            config,
            simulation: Some(sim),
        }
    }

    fn local_host(&self) -> StorageRouter {
        StorageRouter {
            id: StorageRouterId::new(),
            name: self.config.machine_id.clone(),
            ip: self.config.ip.clone(),
            machine_id: self.config.machine_id.clone(),
            node_type: NodeType::Master,
        }
    }

    pub async fn serve(self) -> Result<()> {
        let config = &self.config;
        tracing::info!("Starting controller: {}", config.machine_id);
        tracing::info!("  HTTP API: {}", config.bind_addr);
        tracing::info!("  Agent port: {}", config.agent_port);
        tracing::info!("  CCS: {:?}", config.ccs);
        if let Some(path) = &config.dal_path {
            tracing::info!("  DAL path: {}", path.display());
        }

        let ccs = Configuration::open(&config.ccs)?;
        let (factory, agent): (Arc<dyn ClientFactory>, Arc<dyn HostAgent>) = match &self.simulation {
            Some(sim) => {
                tracing::warn!("Running against a simulated cluster");
                sim.add_host(&config.ip);
                let factory = sim.factory();
                let agent = factory.host_agent(&self.local_host())?;
                (factory, agent)
            }
            None => (
                Arc::new(HttpClientFactory::new(config.agent_port, AGENT_TIMEOUT)),
                Arc::new(LocalHostAgent::default()),
            ),
        };

        let shutdown = Cancellation::new();
        let mut checkups = Vec::new();
        let admin = if config.is_master() || self.simulation.is_some() {
            let dal = match &config.dal_path {
                Some(path) => Dal::open(path)?,
                None => Dal::in_memory(),
            };
            let ctx = Context::from_config(config, Arc::new(dal), ccs, factory);
            checkups.extend(spawn_checkup(
                Checkup::Mds,
                config.mds_checkup_interval_secs,
                ctx.clone(),
                shutdown.clone(),
            ));
            checkups.extend(spawn_checkup(
                Checkup::Dtl,
                config.dtl_checkup_interval_secs,
                ctx.clone(),
                shutdown.clone(),
            ));
            Some(AdminState {
                ctx,
                shutdown: shutdown.clone(),
            })
        } else {
            tracing::info!("No DAL configured, serving the host agent only");
            None
        };

        let router = create_router(admin, agent);
        let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
        tracing::info!("Controller ready");

        let signal = shutdown.clone();
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("Listening for ctrl-c failed: {}", e);
                }
                tracing::info!("Shutting down");
                signal.cancel();
            })
            .await;

        shutdown.cancel();
        for handle in checkups {
            handle.abort();
        }
        if let Err(e) = served {
            tracing::error!("HTTP server error: {}", e);
            return Err(e.into());
        }
        Ok(())
    }
}
