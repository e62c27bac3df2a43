//! RocksDB persistence for the DAL
//!
//! One column family per table, rows keyed by id and bincode-encoded.
//! A commit writes only the rows that changed, in a single batch.

use crate::common::Result;
use crate::dal::Tables;
use rocksdb::{ColumnFamily, Options, WriteBatch, DB};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;

const CF_VPOOLS: &str = "vpools";
const CF_STORAGEROUTERS: &str = "storagerouters";
const CF_DOMAINS: &str = "domains";
const CF_STORAGEROUTER_DOMAINS: &str = "storagerouter_domains";
const CF_STORAGEDRIVERS: &str = "storagedrivers";
const CF_VDISKS: &str = "vdisks";
const CF_VDISK_DOMAINS: &str = "vdisk_domains";
const CF_SERVICES: &str = "services";
const CF_MDS_SERVICES: &str = "mds_services";
const CF_MDS_SERVICE_VDISKS: &str = "mds_service_vdisks";
const CF_DISK_PARTITIONS: &str = "disk_partitions";
const CF_STORAGEDRIVER_PARTITIONS: &str = "storagedriver_partitions";
const CF_ALBA_PROXIES: &str = "alba_proxies";

const ALL_CFS: &[&str] = &[
    CF_VPOOLS,
    CF_STORAGEROUTERS,
    CF_DOMAINS,
    CF_STORAGEROUTER_DOMAINS,
    CF_STORAGEDRIVERS,
    CF_VDISKS,
    CF_VDISK_DOMAINS,
    CF_SERVICES,
    CF_MDS_SERVICES,
    CF_MDS_SERVICE_VDISKS,
    CF_DISK_PARTITIONS,
    CF_STORAGEDRIVER_PARTITIONS,
    CF_ALBA_PROXIES,
];

pub struct DalPersistence {
    db: DB,
}

impl DalPersistence {
    /// Open or create the database
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(&opts, path, ALL_CFS.iter().copied())?;
        Ok(Self { db })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| crate::Error::Internal(format!("missing column family {}", name)))
    }

    fn load_table<K, V>(&self, name: &str) -> Result<BTreeMap<K, V>>
    where
        K: FromStr<Err = crate::Error> + Ord,
        V: DeserializeOwned,
    {
        let cf = self.cf(name)?;
        let mut rows = BTreeMap::new();
        for item in self.db.iterator_cf(cf, rocksdb::IteratorMode::Start) {
            let (key, value) = item?;
            let key = std::str::from_utf8(&key)
                .map_err(|_| crate::Error::Serialization(format!("non UTF-8 key in {}", name)))?;
            rows.insert(key.parse()?, bincode::deserialize(&value)?);
        }
        Ok(rows)
    }

    /// Read every table
    pub fn load(&self) -> Result<Tables> {
        Ok(Tables {
            vpools: self.load_table(CF_VPOOLS)?,
            storagerouters: self.load_table(CF_STORAGEROUTERS)?,
            domains: self.load_table(CF_DOMAINS)?,
            storagerouter_domains: self.load_table(CF_STORAGEROUTER_DOMAINS)?,
            storagedrivers: self.load_table(CF_STORAGEDRIVERS)?,
            vdisks: self.load_table(CF_VDISKS)?,
            vdisk_domains: self.load_table(CF_VDISK_DOMAINS)?,
            services: self.load_table(CF_SERVICES)?,
            mds_services: self.load_table(CF_MDS_SERVICES)?,
            mds_service_vdisks: self.load_table(CF_MDS_SERVICE_VDISKS)?,
            disk_partitions: self.load_table(CF_DISK_PARTITIONS)?,
            storagedriver_partitions: self.load_table(CF_STORAGEDRIVER_PARTITIONS)?,
            alba_proxies: self.load_table(CF_ALBA_PROXIES)?,
        })
    }

    fn diff_table<K, V>(
        &self,
        batch: &mut WriteBatch,
        name: &str,
        before: &BTreeMap<K, V>,
        after: &BTreeMap<K, V>,
    ) -> Result<()>
    where
        K: Display + Ord,
        V: Serialize + PartialEq,
    {
        let cf = self.cf(name)?;
        for (id, row) in after {
            if before.get(id) != Some(row) {
                batch.put_cf(cf, id.to_string().as_bytes(), bincode::serialize(row)?);
            }
        }
        for id in before.keys().filter(|id| !after.contains_key(id)) {
            batch.delete_cf(cf, id.to_string().as_bytes());
        }
        Ok(())
    }

    /// Persist the difference between two states
    pub fn sync(&self, before: &Tables, after: &Tables) -> Result<()> {
        let mut batch = WriteBatch::default();
        self.diff_table(&mut batch, CF_VPOOLS, &before.vpools, &after.vpools)?;
        self.diff_table(
            &mut batch,
            CF_STORAGEROUTERS,
            &before.storagerouters,
            &after.storagerouters,
        )?;
        self.diff_table(&mut batch, CF_DOMAINS, &before.domains, &after.domains)?;
        self.diff_table(
            &mut batch,
            CF_STORAGEROUTER_DOMAINS,
            &before.storagerouter_domains,
            &after.storagerouter_domains,
        )?;
        self.diff_table(
            &mut batch,
            CF_STORAGEDRIVERS,
            &before.storagedrivers,
            &after.storagedrivers,
        )?;
        self.diff_table(&mut batch, CF_VDISKS, &before.vdisks, &after.vdisks)?;
        self.diff_table(
            &mut batch,
            CF_VDISK_DOMAINS,
            &before.vdisk_domains,
            &after.vdisk_domains,
        )?;
        self.diff_table(&mut batch, CF_SERVICES, &before.services, &after.services)?;
        self.diff_table(
            &mut batch,
            CF_MDS_SERVICES,
            &before.mds_services,
            &after.mds_services,
        )?;
        self.diff_table(
            &mut batch,
            CF_MDS_SERVICE_VDISKS,
            &before.mds_service_vdisks,
            &after.mds_service_vdisks,
        )?;
        self.diff_table(
            &mut batch,
            CF_DISK_PARTITIONS,
            &before.disk_partitions,
            &after.disk_partitions,
        )?;
        self.diff_table(
            &mut batch,
            CF_STORAGEDRIVER_PARTITIONS,
            &before.storagedriver_partitions,
            &after.storagedriver_partitions,
        )?;
        self.diff_table(
            &mut batch,
            CF_ALBA_PROXIES,
            &before.alba_proxies,
            &after.alba_proxies,
        )?;
        self.db.write(batch)?;
        Ok(())
    }

    /// Flush to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dal::{Dal, NodeType, StorageRouter, StorageRouterId};
    use tempfile::tempdir;

    #[test]
    fn test_rows_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dal");
        let sr = StorageRouter {
            id: StorageRouterId::new(),
            name: "node1".into(),
            ip: "10.100.1.1".into(),
            machine_id: "m1".into(),
            node_type: NodeType::Master,
        };

        {
            let dal = Dal::open(&path).unwrap();
            dal.write(|t| {
                t.storagerouters.insert(sr.id, sr.clone());
                Ok(())
            })
            .unwrap();
        }
        {
            let dal = Dal::open(&path).unwrap();
            assert_eq!(dal.read(|t| t.storagerouter(sr.id).cloned()).unwrap(), sr);
            dal.write(|t| {
                t.storagerouters.remove(&sr.id);
                Ok(())
            })
            .unwrap();
        }
        let dal = Dal::open(&path).unwrap();
        assert!(dal.read(|t| t.storagerouters.is_empty()));
    }
}
