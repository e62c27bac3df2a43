//! Node bootstrap: host keys in the CCS, StorageRouter registration and
//! domain membership

use crate::ccs::keys;
use crate::common::{validate_ipv4, Result};
use crate::dal::{
    DiskPartition, DiskPartitionId, DiskRole, Domain, DomainId, NodeType, StorageRouter,
    StorageRouterDomain, StorageRouterDomainId, StorageRouterId, Tables,
};
use crate::vpool::ports::{DEFAULT_MDS_RANGE, DEFAULT_STORAGEDRIVER_RANGE};
use crate::Context;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::str::FromStr;

/// Mountpoints of regular host partitions live below this prefix
const MOUNT_PREFIX: &str = "/mnt/";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallNodeOptions {
    pub machine_id: String,
    pub ip: String,
    /// Wipe the previous keys of the host first
    #[serde(default)]
    pub clean: bool,
    /// Allow partitions that are not mounted below `/mnt`
    #[serde(default)]
    pub extra_filesystems: bool,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct HostSetup {
    extra_filesystems: bool,
}

/// Record a host in the CCS: ip, port ranges, setup options and version
pub async fn install_node(ctx: &Context, options: &InstallNodeOptions) -> Result<()> {
    validate_ipv4(&options.ip)?;
    let ccs = &ctx.ccs;
    let machine_id = options.machine_id.as_str();
    if options.clean {
        tracing::info!(machine_id, "Removing previous host configuration");
        ccs.delete(&keys::host_root(machine_id), true)?;
    } else if let Some(ip) = ccs.get::<String>(&keys::host_ip(machine_id))? {
        if ip != options.ip {
            return Err(crate::Error::PreconditionFailed(format!(
                "host {} is installed with ip {}, reinstall with --clean",
                machine_id, ip
            )));
        }
    }

    ccs.set(&keys::host_ip(machine_id), &options.ip)?;
    if !ccs.exists(&keys::host_ports(machine_id))? {
        ccs.set(
            &keys::host_ports(machine_id),
            &json!({
                "storagedriver": DEFAULT_STORAGEDRIVER_RANGE,
                "mds": DEFAULT_MDS_RANGE,
            }),
        )?;
    }
    ccs.set(
        &keys::host_setup(machine_id),
        &HostSetup {
            extra_filesystems: options.extra_filesystems,
        },
    )?;
    if let Some(version) = &options.version {
        ccs.set(&keys::host_version(machine_id), version)?;
    }
    tracing::info!(machine_id, ip = %options.ip, "Host installed");
    Ok(())
}

/// A host partition as given on the command line: `<mountpoint>:<ROLE[,ROLE]>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSpec {
    pub mountpoint: String,
    pub roles: Vec<DiskRole>,
}

impl FromStr for PartitionSpec {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (mountpoint, roles) = s.split_once(':').ok_or_else(|| {
            crate::Error::InvalidParameter(format!(
                "partition '{}' is not of the form <mountpoint>:<ROLE[,ROLE]>",
                s
            ))
        })?;
        if !mountpoint.starts_with('/') {
            return Err(crate::Error::InvalidParameter(format!(
                "mountpoint '{}' is not absolute",
                mountpoint
            )));
        }
        let roles = roles
            .split(',')
            .filter(|r| !r.is_empty())
            .map(DiskRole::from_str)
            .collect::<Result<Vec<_>>>()?;
        if roles.is_empty() {
            return Err(crate::Error::InvalidParameter(format!(
                "partition {} has no roles",
                mountpoint
            )));
        }
        Ok(Self {
            mountpoint: mountpoint.trim_end_matches('/').to_string(),
            roles,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitNodeOptions {
    pub machine_id: String,
    pub ip: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub join_masters: bool,
    #[serde(default)]
    pub partitions: Vec<PartitionSpec>,
}

/// Register an installed host as a StorageRouter with its partitions,
/// probing their sizes through the host agent
pub async fn init_node(ctx: &Context, options: &InitNodeOptions) -> Result<StorageRouterId> {
    let installed: Option<String> = ctx.ccs.get(&keys::host_ip(&options.machine_id))?;
    if installed.as_deref() != Some(options.ip.as_str()) {
        return Err(crate::Error::PreconditionFailed(format!(
            "host {} is not installed with ip {}",
            options.machine_id, options.ip
        )));
    }
    let setup: HostSetup = ctx
        .ccs
        .get_or(&keys::host_setup(&options.machine_id), HostSetup::default())?;
    if !setup.extra_filesystems {
        if let Some(p) = options
            .partitions
            .iter()
            .find(|p| !p.mountpoint.starts_with(MOUNT_PREFIX))
        {
            return Err(crate::Error::InvalidParameter(format!(
                "{} is not below {}, install the host with --extra-filesystems",
                p.mountpoint, MOUNT_PREFIX
            )));
        }
    }

    let sr = StorageRouter {
        id: StorageRouterId::new(),
        name: options
            .name
            .clone()
            .unwrap_or_else(|| options.machine_id.clone()),
        ip: options.ip.clone(),
        machine_id: options.machine_id.clone(),
        node_type: if options.join_masters {
            NodeType::Master
        } else {
            NodeType::Extra
        },
    };
    ctx.dal.write(|t| {
        if t.storagerouter_by_machine_id(&sr.machine_id).is_some()
            || t.storagerouter_by_ip(&sr.ip).is_some()
        {
            return Err(crate::Error::PreconditionFailed(format!(
                "host {} ({}) is already initialised",
                sr.machine_id, sr.ip
            )));
        }
        t.storagerouters.insert(sr.id, sr.clone());
        Ok(())
    })?;

    let scanned: Result<Vec<DiskPartition>> = async {
        let agent = ctx.clients.agent(&sr)?;
        let mut partitions = Vec::with_capacity(options.partitions.len());
        for spec in &options.partitions {
            partitions.push(DiskPartition {
                id: DiskPartitionId::new(),
                storagerouter: sr.id,
                mountpoint: spec.mountpoint.clone(),
                size: agent.available_space(&spec.mountpoint).await?,
                roles: spec.roles.clone(),
            });
        }
        Ok(partitions)
    }
    .await;

    let partitions = match scanned {
        Ok(partitions) => partitions,
        Err(e) => {
            ctx.dal.write(|t| {
                t.storagerouters.remove(&sr.id);
                Ok(())
            })?;
            return Err(e);
        }
    };
    ctx.dal.write(|t| {
        for partition in partitions {
            t.disk_partitions.insert(partition.id, partition);
        }
        Ok(())
    })?;
    tracing::info!(
        storagerouter = %sr.name,
        node_type = ?sr.node_type,
        partitions = options.partitions.len(),
        "Host initialised"
    );
    Ok(sr.id)
}

fn find_storagerouter(t: &Tables, host: &str) -> Option<StorageRouterId> {
    t.storagerouter_by_ip(host)
        .or_else(|| t.storagerouters.values().find(|sr| sr.name == host))
        .or_else(|| t.storagerouter_by_machine_id(host))
        .map(|sr| sr.id)
}

/// Put a host in a domain, as a regular member or as a backup. The domain
/// is created on first use.
pub fn add_domain(
    ctx: &Context,
    host: &str,
    domain: &str,
    backup: bool,
) -> Result<StorageRouterDomainId> {
    if domain.trim().is_empty() {
        return Err(crate::Error::InvalidParameter("domain name is empty".into()));
    }
    ctx.dal.write(|t| {
        let sr = find_storagerouter(t, host)
            .ok_or_else(|| crate::Error::NotFound(format!("StorageRouter {}", host)))?;
        let domain_id = match t.domain_by_name(domain) {
            Some(d) => d.id,
            None => {
                let d = Domain {
                    id: DomainId::new(),
                    name: domain.to_string(),
                };
                let id = d.id;
                t.domains.insert(id, d);
                id
            }
        };
        if let Some(existing) = t
            .storagerouter_domains
            .values_mut()
            .find(|j| j.storagerouter == sr && j.domain == domain_id)
        {
            existing.backup = backup;
            return Ok(existing.id);
        }
        let junction = StorageRouterDomain {
            id: StorageRouterDomainId::new(),
            storagerouter: sr,
            domain: domain_id,
            backup,
        };
        let id = junction.id;
        t.storagerouter_domains.insert(id, junction);
        tracing::info!(host, domain, backup, "Host added to domain");
        Ok(id)
    })
}
