//! Arakoon cluster configurations
//!
//! Kept in the CCS twice: as a JSON dict and as the INI file Arakoon
//! clients read. Both forms are rewritten together.

use crate::ccs::{keys, Configuration};
use crate::common::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArakoonConfig {
    pub sections: BTreeMap<String, BTreeMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArakoonNode {
    pub name: String,
    pub ip: String,
    pub client_port: u16,
}

impl ArakoonConfig {
    /// Build a config with a `[global]` section and one section per node.
    pub fn new(cluster_id: &str, nodes: &[ArakoonNode]) -> Self {
        let mut sections = BTreeMap::new();
        let mut global = BTreeMap::new();
        global.insert("cluster_id".to_string(), cluster_id.to_string());
        global.insert(
            "cluster".to_string(),
            nodes
                .iter()
                .map(|n| n.name.as_str())
                .collect::<Vec<_>>()
                .join(","),
        );
        sections.insert("global".to_string(), global);
        for node in nodes {
            let mut section = BTreeMap::new();
            section.insert("name".to_string(), node.name.clone());
            section.insert("ip".to_string(), node.ip.clone());
            section.insert("client_port".to_string(), node.client_port.to_string());
            sections.insert(node.name.clone(), section);
        }
        Self { sections }
    }

    pub fn cluster_id(&self) -> Option<&str> {
        self.sections
            .get("global")
            .and_then(|g| g.get("cluster_id"))
            .map(String::as_str)
    }

    pub fn nodes(&self) -> Vec<ArakoonNode> {
        let names = match self.sections.get("global").and_then(|g| g.get("cluster")) {
            Some(names) => names,
            None => return Vec::new(),
        };
        names
            .split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .filter_map(|name| {
                let section = self.sections.get(name)?;
                Some(ArakoonNode {
                    name: name.to_string(),
                    ip: section.get("ip")?.clone(),
                    client_port: section.get("client_port")?.parse().ok()?,
                })
            })
            .collect()
    }

    /// INI rendering, `[global]` first and keys sorted
    pub fn to_ini(&self) -> String {
        let mut out = String::new();
        let ordered = self
            .sections
            .get_key_value("global")
            .into_iter()
            .chain(self.sections.iter().filter(|(name, _)| *name != "global"));
        for (name, entries) in ordered {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&format!("[{}]\n", name));
            for (key, value) in entries {
                out.push_str(&format!("{} = {}\n", key, value));
            }
        }
        out
    }

    pub fn from_ini(text: &str) -> Result<Self> {
        let mut sections: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        let mut current: Option<String> = None;
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                sections.entry(name.to_string()).or_default();
                current = Some(name.to_string());
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                crate::Error::Serialization(format!("line {}: expected key = value", lineno + 1))
            })?;
            let section = current.as_ref().ok_or_else(|| {
                crate::Error::Serialization(format!("line {}: entry outside a section", lineno + 1))
            })?;
            sections
                .entry(section.clone())
                .or_default()
                .insert(key.trim().to_string(), value.trim().to_string());
        }
        Ok(Self { sections })
    }

    /// Load the config of an ALBA backend
    pub fn load(ccs: &Configuration, alba_id: &str) -> Result<Option<Self>> {
        ccs.get(&keys::alba_backend_config(alba_id))
    }

    /// Store both the dict and the INI form of an ALBA backend config
    pub fn save(&self, ccs: &Configuration, alba_id: &str) -> Result<()> {
        ccs.set(&keys::alba_backend_config(alba_id), self)?;
        ccs.set_raw(
            &keys::alba_backend_config_ini(alba_id),
            self.to_ini().into_bytes(),
        )
    }

    /// Config of a framework-managed cluster such as `voldrv`
    pub fn load_cluster(ccs: &Configuration, cluster_id: &str) -> Result<Option<Self>> {
        ccs.get(&keys::arakoon_cluster_config(cluster_id))
    }

    pub fn save_cluster(&self, ccs: &Configuration, cluster_id: &str) -> Result<()> {
        ccs.set(&keys::arakoon_cluster_config(cluster_id), self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ArakoonConfig {
        ArakoonConfig::new(
            "backend-abm",
            &[
                ArakoonNode {
                    name: "n1".into(),
                    ip: "10.100.1.1".into(),
                    client_port: 26400,
                },
                ArakoonNode {
                    name: "n2".into(),
                    ip: "10.100.1.2".into(),
                    client_port: 26400,
                },
            ],
        )
    }

    #[test]
    fn test_ini_rendering_puts_global_first() {
        let ini = sample().to_ini();
        assert!(ini.starts_with("[global]\ncluster = n1,n2\ncluster_id = backend-abm\n"));
        assert!(ini.contains("[n2]\nclient_port = 26400\nip = 10.100.1.2\nname = n2\n"));
        assert_eq!(ArakoonConfig::from_ini(&ini).unwrap(), sample());
    }

    #[test]
    fn test_nodes_follow_cluster_order() {
        let nodes = sample().nodes();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].name, "n1");
        assert_eq!(sample().cluster_id(), Some("backend-abm"));
    }

    #[test]
    fn test_save_writes_both_forms() {
        let ccs = Configuration::in_memory();
        sample().save(&ccs, "alba1").unwrap();
        assert_eq!(ArakoonConfig::load(&ccs, "alba1").unwrap(), Some(sample()));
        let ini = ccs
            .get_raw(&keys::alba_backend_config_ini("alba1"))
            .unwrap()
            .unwrap();
        assert!(String::from_utf8(ini).unwrap().starts_with("[global]"));
    }
}
