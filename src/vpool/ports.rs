//! Port ranges and free port selection on one host

use crate::ccs::{keys, Configuration, VolatileMutex, VolatileMutexGuard};
use crate::common::Result;
use crate::dal::{StorageDriverPorts, StorageRouter};
use crate::Context;
use std::collections::BTreeSet;

pub const DEFAULT_STORAGEDRIVER_RANGE: [u16; 2] = [26200, 26299];
pub const DEFAULT_MDS_RANGE: [u16; 2] = [26300, 26399];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    StorageDriver,
    Mds,
}

impl PortKind {
    fn field(self) -> &'static str {
        match self {
            PortKind::StorageDriver => "storagedriver",
            PortKind::Mds => "mds",
        }
    }

    fn default_range(self) -> [u16; 2] {
        match self {
            PortKind::StorageDriver => DEFAULT_STORAGEDRIVER_RANGE,
            PortKind::Mds => DEFAULT_MDS_RANGE,
        }
    }
}

/// Inclusive port range of a host, defaults when none is configured
pub fn port_range(ccs: &Configuration, machine_id: &str, kind: PortKind) -> Result<[u16; 2]> {
    let key = format!("{}|{}", keys::host_ports(machine_id), kind.field());
    let range: [u16; 2] = ccs.get_or(&key, kind.default_range())?;
    if range[0] > range[1] {
        return Err(crate::Error::InvalidConfig(format!(
            "port range {} of host {} is empty: {:?}",
            kind.field(),
            machine_id,
            range
        )));
    }
    Ok(range)
}

/// First `count` ports of `range` not in `used`, in ascending order
pub fn pick_free_ports(range: [u16; 2], used: &BTreeSet<u16>, count: usize) -> Result<Vec<u16>> {
    let ports: Vec<u16> = (range[0]..=range[1])
        .filter(|p| !used.contains(p))
        .take(count)
        .collect();
    if ports.len() < count {
        return Err(crate::Error::PreconditionFailed(format!(
            "only {} of {} ports free in range {}-{}",
            ports.len(),
            count,
            range[0],
            range[1]
        )));
    }
    Ok(ports)
}

/// Ports of a new StorageDriver and its proxies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatedPorts {
    pub storagedriver: StorageDriverPorts,
    pub proxies: Vec<u16>,
}

impl AllocatedPorts {
    /// `[management, xmlrpc, dtl, edge, proxy0, proxy1, ...]`
    pub fn from_list(ports: &[u16]) -> Result<Self> {
        if ports.len() < 4 {
            return Err(crate::Error::Internal(format!(
                "need at least 4 ports, got {}",
                ports.len()
            )));
        }
        Ok(Self {
            storagedriver: StorageDriverPorts {
                management: ports[0],
                xmlrpc: ports[1],
                dtl: ports[2],
                edge: ports[3],
            },
            proxies: ports[4..].to_vec(),
        })
    }
}

/// Pick the ports of a new StorageDriver on `host`. The returned guard keeps
/// the allocation mutex until the caller has recorded the ports in the DAL.
pub async fn allocate_storagedriver_ports(
    ctx: &Context,
    host: &StorageRouter,
    proxies: usize,
) -> Result<(AllocatedPorts, VolatileMutexGuard)> {
    let guard = VolatileMutex::new(
        &ctx.ccs,
        format!("add_vpool_get_free_ports_{}", host.machine_id),
    )
    .acquire(ctx.tunables.lock_wait)
    .await?;
    let range = port_range(&ctx.ccs, &host.machine_id, PortKind::StorageDriver)?;
    let used = ctx.dal.read(|t| t.used_ports(host.id));
    let ports = pick_free_ports(range, &used, 4 + proxies)?;
    tracing::debug!(storagerouter = %host.name, ?ports, "Allocated StorageDriver ports");
    Ok((AllocatedPorts::from_list(&ports)?, guard))
}
