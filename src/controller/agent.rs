//! Host agent backed by the local machine
//!
//! Directories are plain filesystem operations, free space comes from
//! `statvfs`, services are systemd units rendered from a small template per
//! service kind. Parameters passed at creation land in an environment file
//! next to the unit.

use crate::clients::HostAgent;
use crate::common::{ProcessIdentity, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;

pub const DEFAULT_UNIT_DIR: &str = "/lib/systemd/system";
pub const DEFAULT_ENV_DIR: &str = "/etc/ovs/services";

/// Command line of a service, by name prefix
fn exec_start(name: &str) -> Result<&'static str> {
    const KINDS: [(&str, &str); 4] = [
        (
            "ovs-volumedriver_",
            "/usr/bin/volumedriver_fs.sh -f --config ${CONFIG_PATH} --lock-file /var/lock/voldrv_${VPOOL_NAME}.lock --mountpoint ${VPOOL_MOUNTPOINT} -o big_writes -o sync_read -o allow_other",
        ),
        (
            "ovs-dtl_",
            "/usr/bin/failovercache --path ${DTL_PATH} --address ${DTL_ADDRESS} --port ${DTL_PORT} --transport ${DTL_TRANSPORT}",
        ),
        ("ovs-albaproxy_", "/usr/bin/alba proxy-start --config ${CONFIG_PATH}"),
        ("ovs-watcher-volumedriver", "/usr/bin/ovs-watcher volumedriver"),
    ];
    KINDS
        .iter()
        .find(|(prefix, _)| name.starts_with(prefix))
        .map(|(_, exec)| *exec)
        .ok_or_else(|| crate::Error::InvalidParameter(format!("unknown service kind '{}'", name)))
}

fn render_unit(name: &str, env_file: &Path) -> Result<String> {
    Ok(format!(
        "[Unit]\nDescription=Open vStorage {name}\nAfter=network-online.target\n\n\
         [Service]\nType=simple\nEnvironmentFile={env}\nExecStart={exec}\n\
         Restart=on-failure\nRestartSec=5\nLimitNOFILE=8192\n\n\
         [Install]\nWantedBy=multi-user.target\n",
        name = name,
        env = env_file.display(),
        exec = exec_start(name)?,
    ))
}

fn render_env(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"\n", k, v.replace('"', "\\\"")))
        .collect()
}

pub struct LocalHostAgent {
    unit_dir: PathBuf,
    env_dir: PathBuf,
}

impl Default for LocalHostAgent {
    fn default() -> Self {
        Self::new(DEFAULT_UNIT_DIR, DEFAULT_ENV_DIR)
    }
}

impl LocalHostAgent {
    pub fn new(unit_dir: impl Into<PathBuf>, env_dir: impl Into<PathBuf>) -> Self {
        Self {
            unit_dir: unit_dir.into(),
            env_dir: env_dir.into(),
        }
    }

    fn unit_file(&self, name: &str) -> PathBuf {
        self.unit_dir.join(format!("{}.service", name))
    }

    fn env_file(&self, name: &str) -> PathBuf {
        self.env_dir.join(format!("{}.env", name))
    }

    async fn systemctl(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("systemctl").args(args).output().await?;
        if !output.status.success() {
            return Err(crate::Error::UpstreamError(format!(
                "systemctl {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn show(&self, name: &str, property: &str) -> Result<String> {
        self.systemctl(&["show", "-p", property, "--value", name])
            .await
    }

    async fn require_unit(&self, name: &str) -> Result<()> {
        if tokio::fs::try_exists(self.unit_file(name)).await? {
            Ok(())
        } else {
            Err(crate::Error::NotFound(format!("service {}", name)))
        }
    }
}

#[async_trait]
impl HostAgent for LocalHostAgent {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn create_dirs(&self, paths: &[String]) -> Result<()> {
        for path in paths {
            tokio::fs::create_dir_all(path).await?;
        }
        Ok(())
    }

    async fn remove_dirs(&self, paths: &[String]) -> Result<()> {
        for path in paths {
            match tokio::fs::remove_dir_all(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn dir_exists(&self, path: &str) -> Result<bool> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn available_space(&self, path: &str) -> Result<u64> {
        let path = path.to_string();
        tokio::task::spawn_blocking(move || {
            let stat = nix::sys::statvfs::statvfs(path.as_str())
                .map_err(|e| crate::Error::Io(std::io::Error::from(e)))?;
            Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
        })
        .await
        .map_err(|e| crate::Error::Internal(e.to_string()))?
    }

    async fn add_service(&self, name: &str, params: &BTreeMap<String, String>) -> Result<()> {
        let env_file = self.env_file(name);
        let unit = render_unit(name, &env_file)?;
        tokio::fs::create_dir_all(&self.env_dir).await?;
        tokio::fs::write(&env_file, render_env(params)).await?;
        tokio::fs::write(self.unit_file(name), unit).await?;
        self.systemctl(&["daemon-reload"]).await?;
        tracing::info!(service = name, "Service added");
        Ok(())
    }

    async fn start_service(&self, name: &str) -> Result<()> {
        self.require_unit(name).await?;
        self.systemctl(&["start", name]).await.map(|_| ())
    }

    async fn stop_service(&self, name: &str) -> Result<()> {
        self.require_unit(name).await?;
        self.systemctl(&["stop", name]).await.map(|_| ())
    }

    async fn remove_service(&self, name: &str) -> Result<()> {
        let unit_file = self.unit_file(name);
        if !tokio::fs::try_exists(&unit_file).await? {
            return Ok(());
        }
        if let Err(e) = self.systemctl(&["stop", name]).await {
            tracing::warn!(service = name, "Stopping before removal failed: {}", e);
        }
        tokio::fs::remove_file(&unit_file).await?;
        match tokio::fs::remove_file(self.env_file(name)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.systemctl(&["daemon-reload"]).await?;
        tracing::info!(service = name, "Service removed");
        Ok(())
    }

    async fn has_service(&self, name: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.unit_file(name)).await?)
    }

    async fn service_identity(&self, name: &str) -> Result<Option<ProcessIdentity>> {
        self.require_unit(name).await?;
        let pid: u32 = self
            .show(name, "MainPID")
            .await?
            .parse()
            .map_err(|e| crate::Error::UpstreamError(format!("MainPID of {}: {}", name, e)))?;
        if pid == 0 {
            return Ok(None);
        }
        ProcessIdentity::of_pid(pid).map(Some)
    }

    async fn worker_identity(&self) -> Result<ProcessIdentity> {
        ProcessIdentity::current()
    }

    /// Monotonic timestamp of the last start; grows with every start and is
    /// 0 for a service that never ran since boot
    async fn startup_counter(&self, name: &str) -> Result<u64> {
        self.require_unit(name).await?;
        let value = self.show(name, "ExecMainStartTimestampMonotonic").await?;
        value.parse().map_err(|e| {
            crate::Error::UpstreamError(format!("start timestamp of {}: {}", name, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_rendering() {
        let unit = render_unit("ovs-dtl_pool", Path::new("/etc/ovs/services/ovs-dtl_pool.env")).unwrap();
        assert!(unit.contains("EnvironmentFile=/etc/ovs/services/ovs-dtl_pool.env"));
        assert!(unit.contains("ExecStart=/usr/bin/failovercache --path ${DTL_PATH}"));
        assert!(render_unit("ovs-unknown", Path::new("/tmp/x.env")).is_err());

        let params: BTreeMap<String, String> =
            [("VPOOL_NAME".to_string(), "pool".to_string())].into_iter().collect();
        assert_eq!(render_env(&params), "VPOOL_NAME=\"pool\"\n");
    }

    #[tokio::test]
    async fn test_directories_and_space() {
        let dir = tempfile::tempdir().unwrap();
        let agent = LocalHostAgent::new(dir.path().join("units"), dir.path().join("env"));
        let nested = dir.path().join("a/b").display().to_string();

        agent.create_dirs(&[nested.clone()]).await.unwrap();
        assert!(agent.dir_exists(&nested).await.unwrap());
        assert!(agent.available_space(&nested).await.unwrap() > 0);

        agent
            .remove_dirs(&[nested.clone(), dir.path().join("missing").display().to_string()])
            .await
            .unwrap();
        assert!(!agent.dir_exists(&nested).await.unwrap());
        assert!(!agent.has_service("ovs-dtl_pool").await.unwrap());
        assert!(matches!(
            agent.startup_counter("ovs-dtl_pool").await,
            Err(crate::Error::NotFound(_))
        ));
    }
}
