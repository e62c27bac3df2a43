//! MDS catch-up coordination
//!
//! Slaves that fall `mds_tlogs` or more behind their master are caught up,
//! at most once concurrently per vdisk across the cluster. The registry of
//! running catch-ups is a list of [`CatchUpContext`] records stored under
//! `/ovs/jobs/catchup/<vdisk>` and only ever changed with compare-and-set.
//! A record whose worker or volume router process no longer exists is
//! dropped on the next write, so a dead owner never blocks others.

use crate::ccs::{keys, Configuration};
use crate::clients::MdsNodeConfig;
use crate::common::{ProcessIdentity, Result};
use crate::dal::{StorageRouter, StorageRouterId, VDisk, VDiskId};
use crate::mds::MdsConfig;
use crate::Context;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use uuid::Uuid;

const MAX_CAS_RETRIES: usize = 20;
const MAX_BACKOFF_MS: u64 = 250;

/// Identity of a catch-up owner and of the volume router it depends on.
/// Callers in one process share the identities; `token` tells their
/// registrations apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatchUpContext {
    pub token: Uuid,
    pub storagerouter_id: StorageRouterId,
    pub worker_pid: u32,
    pub worker_start: u64,
    pub volumedriver_pid: u32,
    pub volumedriver_start: u64,
}

impl CatchUpContext {
    pub fn new(
        storagerouter_id: StorageRouterId,
        worker: ProcessIdentity,
        volumedriver: ProcessIdentity,
    ) -> Self {
        Self {
            token: Uuid::new_v4(),
            storagerouter_id,
            worker_pid: worker.pid,
            worker_start: worker.start,
            volumedriver_pid: volumedriver.pid,
            volumedriver_start: volumedriver.start,
        }
    }

    fn worker(&self) -> ProcessIdentity {
        ProcessIdentity::new(self.worker_pid, self.worker_start)
    }

    fn volumedriver(&self) -> ProcessIdentity {
        ProcessIdentity::new(self.volumedriver_pid, self.volumedriver_start)
    }
}

#[derive(Debug, Default)]
pub struct CatchUpReport {
    pub slaves_checked: usize,
    pub slaves_behind: usize,
    pub caught_up: usize,
    /// Skipped because another worker is already catching up
    pub busy: usize,
    /// Catch-ups handed to a background task
    pub spawned: usize,
    pub errors: Vec<String>,
}

/// Process identities a registration may refer to
struct Relevance {
    workers: BTreeSet<ProcessIdentity>,
    volumedrivers: BTreeSet<ProcessIdentity>,
}

impl Relevance {
    fn is_current(&self, context: &CatchUpContext) -> bool {
        self.workers.contains(&context.worker())
            && self.volumedrivers.contains(&context.volumedriver())
    }
}

/// Live workers of every reachable host, and the live volume routers of the
/// hosts running an MDS of the vdisk
async fn relevance(ctx: &Context, vdisk: VDiskId, vpool_name: &str) -> Result<Relevance> {
    let tables = ctx.dal.snapshot();
    let mut workers = BTreeSet::new();
    for host in tables.storagerouters.values() {
        if !ctx.clients.is_reachable(host).await {
            continue;
        }
        match ctx.clients.agent(host)?.worker_identity().await {
            Ok(identity) => {
                workers.insert(identity);
            }
            Err(e) => tracing::warn!(storagerouter = %host.name, "No worker identity: {}", e),
        }
    }

    let mut hosts = BTreeSet::new();
    for junction in tables.mds_junctions_of(vdisk) {
        let (host, _, _) = tables.mds_socket(junction.mds_service)?;
        hosts.insert(host);
    }
    let mut volumedrivers = BTreeSet::new();
    for host in hosts {
        let host = tables.storagerouter(host)?;
        match ctx.clients.volumedriver_identity(host, vpool_name).await {
            Ok(Some(identity)) => {
                volumedrivers.insert(identity);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(
                storagerouter = %host.name,
                "No volume router identity: {}",
                e
            ),
        }
    }
    Ok(Relevance {
        workers,
        volumedrivers,
    })
}

/// Read the registration list, drop stale records, apply `change` and write
/// it back with compare-and-set. Returns the list as written.
async fn update_registrations(
    ctx: &Context,
    vdisk: VDiskId,
    vpool_name: &str,
    change: impl Fn(&mut Vec<CatchUpContext>),
) -> Result<Vec<CatchUpContext>> {
    let key = keys::catchup(vdisk);
    let relevance = relevance(ctx, vdisk, vpool_name).await?;
    for attempt in 0..MAX_CAS_RETRIES {
        let (stored, raw) = ctx.ccs.get_with_raw::<Vec<CatchUpContext>>(&key)?;
        let stored = stored.unwrap_or_default();
        let mut list: Vec<CatchUpContext> = stored
            .iter()
            .filter(|c| relevance.is_current(c))
            .copied()
            .collect();
        if list.len() < stored.len() {
            tracing::info!(
                %vdisk,
                "Dropping {} stale catch-up registrations",
                stored.len() - list.len()
            );
        }
        change(&mut list);
        let new = Configuration::serialize(&list)?;
        if ctx.ccs.compare_and_set_raw(&key, raw.as_deref(), Some(new))? {
            return Ok(list);
        }
        let backoff = rand::thread_rng().gen_range(0..=MAX_BACKOFF_MS);
        tracing::debug!(%vdisk, attempt, backoff, "Catch-up registry changed, retrying");
        tokio::time::sleep(Duration::from_millis(backoff)).await;
    }
    Err(crate::Error::LockContention(key))
}

/// One registered catch-up, owned so it can move to a background task
struct CatchUpJob {
    ctx: Context,
    vdisk: VDisk,
    vpool_name: String,
    socket: MdsNodeConfig,
    host: StorageRouter,
    own: CatchUpContext,
    timeout: Duration,
}

impl CatchUpJob {
    async fn run(self) -> Result<()> {
        tracing::info!(vdisk = %self.vdisk.name, "Catching up MDS slave {}", self.socket);
        let caught_up: Result<u64> = async {
            self.ctx
                .clients
                .mds(&self.socket.ip, self.socket.port, self.timeout)?
                .catch_up(&self.vdisk.volume_id, false)
                .await
        }
        .await;
        if let Err(e) = &caught_up {
            tracing::error!(
                vdisk = %self.vdisk.name,
                "Catch-up of {} failed: {}",
                self.socket,
                e
            );
            if e.is_upstream() {
                self.ctx
                    .clients
                    .invalidate_volumedriver_identity(self.host.id, &self.vpool_name);
            }
        }
        let token = self.own.token;
        let unregistered =
            update_registrations(&self.ctx, self.vdisk.id, &self.vpool_name, |list| {
                list.retain(|c| c.token != token)
            })
            .await;
        caught_up?;
        unregistered?;
        Ok(())
    }
}

/// Catch up the slaves of a vdisk that lag `mds_tlogs` or more behind.
/// With `background` the catch-up itself runs on a spawned task once
/// registered, so the caller only waits for the registration.
pub async fn mds_catchup(ctx: &Context, vdisk: VDiskId, background: bool) -> Result<CatchUpReport> {
    let tables = ctx.dal.snapshot();
    let vdisk = tables.vdisk(vdisk)?.clone();
    let vpool_name = tables.vpool(vdisk.vpool)?.name.clone();
    let config = MdsConfig::load(&ctx.ccs, vdisk.vpool)?;
    let local = ctx.local_storagerouter()?;
    let worker = ctx.clients.agent(&local)?.worker_identity().await?;
    let mut report = CatchUpReport::default();

    for junction in tables.mds_junctions_of(vdisk.id) {
        if junction.is_master {
            continue;
        }
        report.slaves_checked += 1;
        let (host_id, ip, port) = tables.mds_socket(junction.mds_service)?;
        let socket = MdsNodeConfig::new(ip, port);
        let client = ctx.clients.mds(&socket.ip, socket.port, config.mds_timeout())?;
        let behind = match client.catch_up(&vdisk.volume_id, true).await {
            Ok(behind) => behind,
            Err(e) => {
                report.errors.push(format!("{}: {}", socket, e));
                continue;
            }
        };
        if behind < config.mds_tlogs {
            continue;
        }
        report.slaves_behind += 1;

        let host = tables.storagerouter(host_id)?.clone();
        let volumedriver = match ctx.clients.volumedriver_identity(&host, &vpool_name).await? {
            Some(identity) => identity,
            None => {
                tracing::warn!(
                    vdisk = %vdisk.name,
                    storagerouter = %host.name,
                    "Volume router is not running, cannot catch up {}",
                    socket
                );
                continue;
            }
        };
        let own = CatchUpContext::new(local.id, worker, volumedriver);
        let registered =
            update_registrations(ctx, vdisk.id, &vpool_name, |list| list.push(own)).await?;
        if registered.len() > 1 {
            tracing::info!(
                vdisk = %vdisk.name,
                "Catch-up already running elsewhere, backing out"
            );
            update_registrations(ctx, vdisk.id, &vpool_name, |list| {
                list.retain(|c| c.token != own.token)
            })
            .await?;
            report.busy += 1;
            continue;
        }

        let job = CatchUpJob {
            ctx: ctx.clone(),
            vdisk: vdisk.clone(),
            vpool_name: vpool_name.clone(),
            socket: socket.clone(),
            host,
            own,
            timeout: config.mds_timeout(),
        };
        if background {
            tokio::spawn(async move {
                if let Err(e) = job.run().await {
                    tracing::error!("Background catch-up failed: {}", e);
                }
            });
            report.spawned += 1;
        } else {
            match job.run().await {
                Ok(()) => report.caught_up += 1,
                Err(e) => report.errors.push(format!("{}: {}", socket, e)),
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_wire_format() {
        let sr = StorageRouterId::new();
        let context =
            CatchUpContext::new(sr, ProcessIdentity::new(10, 20), ProcessIdentity::new(30, 40));
        let json = serde_json::to_value(context).unwrap();
        assert_eq!(json["worker_pid"], 10);
        assert_eq!(json["worker_start"], 20);
        assert_eq!(json["volumedriver_pid"], 30);
        assert_eq!(json["volumedriver_start"], 40);
        assert_eq!(json["storagerouter_id"], sr.to_string());
        assert_eq!(json["token"], context.token.to_string());
    }

    #[test]
    fn test_registrations_of_one_process_differ() {
        let sr = StorageRouterId::new();
        let worker = ProcessIdentity::new(1, 1);
        let volumedriver = ProcessIdentity::new(2, 2);
        let first = CatchUpContext::new(sr, worker, volumedriver);
        let second = CatchUpContext::new(sr, worker, volumedriver);
        assert_ne!(first, second);

        let mut list = vec![first, second];
        list.retain(|c| c.token != second.token);
        assert_eq!(list, vec![first]);
    }

    #[test]
    fn test_relevance_requires_both_identities() {
        let worker = ProcessIdentity::new(1, 1);
        let volumedriver = ProcessIdentity::new(2, 2);
        let relevance = Relevance {
            workers: [worker].into_iter().collect(),
            volumedrivers: [volumedriver].into_iter().collect(),
        };
        let sr = StorageRouterId::new();
        assert!(relevance.is_current(&CatchUpContext::new(sr, worker, volumedriver)));
        assert!(!relevance.is_current(&CatchUpContext::new(
            sr,
            ProcessIdentity::new(1, 99),
            volumedriver
        )));
        assert!(!relevance.is_current(&CatchUpContext::new(
            sr,
            worker,
            ProcessIdentity::new(2, 99)
        )));
    }
}
