//! ALBA proxy configurations

use crate::ccs::{keys, Configuration};
use crate::clients::AlbaNode;
use crate::common::Result;
use crate::dal::{BackendInfo, CacheSettings, StorageRouter, Tables, VPoolId};
use serde_json::{json, Value};

const MANIFEST_CACHE_SIZE: u64 = 16 * 1024 * 1024;
const SCRUB_IP: &str = "127.0.0.1";

/// ALBA nodes to read from first: those on `host`, then those on hosts
/// sharing a regular domain with it
pub fn read_preference(tables: &Tables, host: &StorageRouter, nodes: &[AlbaNode]) -> Vec<String> {
    let domains = tables.domains_of(host.id, false);
    let mut local = Vec::new();
    let mut near = Vec::new();
    for node in nodes {
        if node.ip == host.ip {
            local.push(node.node_id.clone());
            continue;
        }
        let shares_domain = tables
            .storagerouter_by_ip(&node.ip)
            .map(|sr| !tables.domains_of(sr.id, false).is_disjoint(&domains))
            .unwrap_or(false);
        if shares_domain && !domains.is_empty() {
            near.push(node.node_id.clone());
        }
    }
    local.extend(near);
    local
}

fn backend_config_url(backend: &BackendInfo) -> String {
    Configuration::configuration_url(&keys::alba_backend_config(&backend.backend_id))
}

/// Cache sub-config of a proxy: none, a local directory or another backend
pub fn cache_config(
    settings: &CacheSettings,
    vpool: VPoolId,
    local: Option<(&str, u64)>,
) -> Value {
    if !settings.is_enabled() {
        return json!(["none"]);
    }
    match (&settings.backend, local) {
        (Some(backend), _) => json!([
            "alba",
            {
                "albamgr_cfg_url": backend_config_url(backend),
                "bucket_strategy": ["1-to-1", {"prefix": vpool.to_string(), "preset": backend.preset}],
                "manifest_cache_size": MANIFEST_CACHE_SIZE,
                "cache_on_read": settings.cache_on_read,
                "cache_on_write": settings.cache_on_write,
            }
        ]),
        (None, Some((path, size))) if settings.local => json!([
            "local",
            {
                "path": path,
                "max_size": size,
                "cache_on_read": settings.cache_on_read,
                "cache_on_write": settings.cache_on_write,
            }
        ]),
        _ => json!(["none"]),
    }
}

/// Everything a main proxy config is built from
pub struct ProxySpec<'a> {
    pub vpool: VPoolId,
    pub backend: &'a BackendInfo,
    pub storage_ip: &'a str,
    pub port: u16,
    pub read_preference: Vec<String>,
    pub fragment_cache: Value,
    pub block_cache: Value,
}

pub fn main_config(spec: &ProxySpec<'_>) -> Value {
    json!({
        "log_level": "info",
        "port": spec.port,
        "ips": [spec.storage_ip],
        "transport": "tcp",
        "albamgr_cfg_url": backend_config_url(spec.backend),
        "manifest_cache_size": MANIFEST_CACHE_SIZE,
        "fragment_cache": spec.fragment_cache,
        "block_cache": spec.block_cache,
        "read_preference": spec.read_preference,
    })
}

/// Scrubbing variant of a main config: loopback, ephemeral port, and caches
/// that are never warmed by reads
pub fn scrub_config(main: &Value) -> Value {
    let mut scrub = main.clone();
    if let Some(object) = scrub.as_object_mut() {
        object.insert("port".into(), json!(0));
        object.insert("ips".into(), json!([SCRUB_IP]));
        for cache in ["fragment_cache", "block_cache"] {
            if let Some(settings) = object
                .get_mut(cache)
                .and_then(|c| c.get_mut(1))
                .and_then(Value::as_object_mut)
            {
                if settings.contains_key("cache_on_read") {
                    settings.insert("cache_on_read".into(), json!(false));
                }
            }
        }
    }
    scrub
}

pub fn save_main_config(
    ccs: &Configuration,
    vpool: VPoolId,
    proxy: impl std::fmt::Display,
    config: &Value,
) -> Result<()> {
    ccs.set(&keys::proxy_main(vpool, proxy), config)
}

pub fn save_scrub_config(ccs: &Configuration, vpool: VPoolId, config: &Value) -> Result<()> {
    ccs.set(&keys::scrub_proxy(vpool), config)
}
