//! Shared fixture: a simulated cluster with a DAL and a CCS

#![allow(dead_code)]

use ovs_control::ccs::arakoon::ArakoonNode;
use ovs_control::ccs::{keys, ArakoonConfig, Configuration};
use ovs_control::clients::sim::SimCluster;
use ovs_control::clients::{AlbaNode, ClientPool, MdsNodeConfig};
use ovs_control::dal::*;
use ovs_control::mds::MdsConfig;
use ovs_control::ops::{init_node, install_node, InitNodeOptions, InstallNodeOptions};
use ovs_control::vpool::VPoolParameters;
use ovs_control::{Context, Tunables};
use std::sync::Arc;
use std::time::Duration;

pub const BACKEND_ID: &str = "backend-1";
pub const VOLDRV_CLUSTER: &str = "voldrv";
pub const MDS_PORT: u16 = 26300;

pub fn ip(n: usize) -> String {
    format!("10.0.0.{}", n)
}

pub fn backend() -> BackendInfo {
    BackendInfo {
        backend_id: BACKEND_ID.into(),
        name: "alba".into(),
        preset: "default".into(),
        connection: BackendConnection {
            host: "10.0.0.100".into(),
            port: 443,
            local: true,
        },
    }
}

pub struct Cluster {
    pub sim: SimCluster,
    pub dal: Arc<Dal>,
    pub ccs: Configuration,
}

impl Cluster {
    pub fn new() -> Self {
        let sim = SimCluster::new();
        let ccs = Configuration::in_memory();
        ccs.set(keys::ARAKOON_VOLDRV, &VOLDRV_CLUSTER.to_string())
            .unwrap();
        ArakoonConfig::new(
            VOLDRV_CLUSTER,
            &[ArakoonNode {
                name: "arakoon1".into(),
                ip: ip(1),
                client_port: 26400,
            }],
        )
        .save_cluster(&ccs, VOLDRV_CLUSTER)
        .unwrap();
        sim.add_backend(
            BACKEND_ID,
            ArakoonConfig::new(
                "backend-abm",
                &[ArakoonNode {
                    name: "abm1".into(),
                    ip: ip(1),
                    client_port: 26402,
                }],
            ),
            vec![AlbaNode {
                node_id: "asd-node-1".into(),
                ip: ip(1),
            }],
        );
        Self {
            sim,
            dal: Arc::new(Dal::in_memory()),
            ccs,
        }
    }

    /// Controller context of the host with `machine_id`; all contexts of a
    /// cluster share the DAL, the CCS and the simulation
    pub fn context(&self, machine_id: &str) -> Context {
        let clients = ClientPool::new(self.sim.factory(), Duration::from_millis(200));
        Context::new(
            self.dal.clone(),
            self.ccs.clone(),
            Arc::new(clients),
            machine_id,
        )
        .with_tunables(Tunables {
            startup_poll_attempts: 5,
            startup_poll_interval: Duration::from_millis(10),
            registry_update_timeout: Duration::from_secs(1),
            lock_wait: Duration::from_secs(5),
        })
    }

    // === Direct rows ===

    pub fn add_host(&self, n: usize) -> StorageRouter {
        self.sim.add_host(&ip(n));
        let sr = StorageRouter {
            id: StorageRouterId::new(),
            name: format!("node{}", n),
            ip: ip(n),
            machine_id: format!("m{}", n),
            node_type: NodeType::Master,
        };
        self.dal
            .write(|t| {
                t.storagerouters.insert(sr.id, sr.clone());
                Ok(())
            })
            .unwrap();
        sr
    }

    pub fn add_vpool(&self, name: &str) -> VPoolId {
        let vpool = VPool {
            id: VPoolId::new(),
            name: name.into(),
            status: VPoolStatus::Running,
            metadata_store_bits: 5,
            backend: backend(),
            caching_info: Default::default(),
            configuration: VPoolConfiguration::default(),
        };
        let id = vpool.id;
        self.dal
            .write(|t| {
                t.vpools.insert(id, vpool);
                Ok(())
            })
            .unwrap();
        id
    }

    pub fn set_mds_config(&self, vpool: VPoolId, safety: usize, tlogs: u64) {
        MdsConfig {
            mds_safety: safety,
            mds_tlogs: tlogs,
            ..MdsConfig::default()
        }
        .save(&self.ccs, vpool)
        .unwrap();
    }

    /// StorageDriver of `vpool` on `host`, with its volume router running
    pub fn add_storagedriver(&self, vpool: VPoolId, host: &StorageRouter) -> StorageDriver {
        let vpool_name = self.dal.read(|t| t.vpool(vpool).unwrap().name.clone());
        let sd = StorageDriver {
            id: StorageDriverId::new(),
            vpool,
            storagerouter: host.id,
            storagedriver_id: format!("{}{}", vpool_name, host.machine_id),
            cluster_ip: host.ip.clone(),
            storage_ip: host.ip.clone(),
            ports: StorageDriverPorts {
                management: 26200,
                xmlrpc: 26201,
                dtl: 26202,
                edge: 26203,
            },
            mountpoint: format!("/mnt/{}", vpool_name),
        };
        self.dal
            .write(|t| {
                t.storagedrivers.insert(sd.id, sd.clone());
                Ok(())
            })
            .unwrap();
        self.sim.start_volumedriver(&host.ip, &vpool_name);
        sd
    }

    pub fn add_mds(&self, vpool: VPoolId, host: &StorageRouter, port: u16) -> MdsNodeConfig {
        let vpool_name = self.dal.read(|t| t.vpool(vpool).unwrap().name.clone());
        self.dal
            .write(|t| {
                let number = t.mds_services_on(vpool, host.id).len() as u32;
                let service = Service {
                    id: ServiceId::new(),
                    name: format!("metadataserver_{}_{}", vpool_name, number),
                    service_type: ServiceType::MetadataServer,
                    storagerouter: host.id,
                    ports: vec![port],
                };
                let mds = MdsService {
                    id: MdsServiceId::new(),
                    vpool,
                    number,
                    service: service.id,
                    capacity: MdsService::DEFAULT_CAPACITY,
                };
                t.services.insert(service.id, service);
                t.mds_services.insert(mds.id, mds);
                Ok(())
            })
            .unwrap();
        MdsNodeConfig::new(host.ip.clone(), port)
    }

    /// Running vdisk owned by the StorageDriver of `vpool` on `host`
    pub fn add_vdisk(
        &self,
        vpool: VPoolId,
        host: &StorageRouter,
        name: &str,
        config: Vec<MdsNodeConfig>,
    ) -> VDiskId {
        let owner = self.dal.read(|t| {
            t.storagedriver_for(vpool, host.id)
                .unwrap()
                .storagedriver_id
                .clone()
        });
        let vdisk = VDisk {
            id: VDiskId::new(),
            name: name.into(),
            volume_id: name.into(),
            vpool,
            storagerouter: Some(host.id),
            has_manual_dtl: false,
        };
        let id = vdisk.id;
        self.dal
            .write(|t| {
                t.vdisks.insert(id, vdisk);
                Ok(())
            })
            .unwrap();
        self.sim.add_volume(vpool, name, &owner, config);
        id
    }

    pub fn add_partition(&self, host: &StorageRouter, mountpoint: &str, roles: &[DiskRole]) {
        let partition = DiskPartition {
            id: DiskPartitionId::new(),
            storagerouter: host.id,
            mountpoint: mountpoint.into(),
            size: 100 * 1024 * 1024 * 1024,
            roles: roles.to_vec(),
        };
        self.dal
            .write(|t| {
                t.disk_partitions.insert(partition.id, partition);
                Ok(())
            })
            .unwrap();
    }

    pub fn join_domain(&self, host: &StorageRouter, domain: &str, backup: bool) {
        ovs_control::ops::add_domain(&self.context(&host.machine_id), &host.ip, domain, backup)
            .unwrap();
    }

    /// MDS sockets of a vdisk as recorded in the DAL junctions
    pub fn junctions(&self, vdisk: VDiskId) -> Vec<MdsNodeConfig> {
        self.dal.read(|t| {
            t.mds_junctions_of(vdisk)
                .iter()
                .map(|j| {
                    let (_, ip, port) = t.mds_socket(j.mds_service).unwrap();
                    MdsNodeConfig::new(ip, port)
                })
                .collect()
        })
    }

    // === Bootstrap through the node operations ===

    /// Install and initialise host `n` with one partition carrying every role
    pub async fn bootstrap_host(&self, n: usize) -> StorageRouter {
        self.sim.add_host(&ip(n));
        let ctx = self.context(&format!("m{}", n));
        install_node(
            &ctx,
            &InstallNodeOptions {
                machine_id: format!("m{}", n),
                ip: ip(n),
                clean: false,
                extra_filesystems: false,
                version: None,
            },
        )
        .await
        .unwrap();
        let id = init_node(
            &ctx,
            &InitNodeOptions {
                machine_id: format!("m{}", n),
                ip: ip(n),
                name: Some(format!("node{}", n)),
                join_masters: true,
                partitions: vec!["/mnt/ssd1:DB,WRITE,DTL,SCRUB".parse().unwrap()],
            },
        )
        .await
        .unwrap();
        self.dal.read(|t| t.storagerouter(id).unwrap().clone())
    }

    pub fn vpool_parameters(&self, name: &str, host: &StorageRouter) -> VPoolParameters {
        VPoolParameters::new(name, host.ip.clone(), backend())
    }
}
