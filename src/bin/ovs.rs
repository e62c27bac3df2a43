//! CLI for cluster operations, talking to the admin API of the controller

use anyhow::{bail, Context as _};
use clap::{Args, Parser, Subcommand};
use ovs_control::clients::http::Envelope;
use ovs_control::dal::{
    BackendConnection, BackendInfo, CacheSettings, DtlMode, DtlTransport, StorageRouterId, VDiskId,
    VPoolId,
};
use ovs_control::ops::{InitNodeOptions, InstallNodeOptions, PartitionSpec};
use ovs_control::vpool::VPoolParameters;
use serde_json::{json, Value};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ovs")]
#[command(about = "Open vStorage control plane CLI")]
#[command(version)]
struct Cli {
    /// Admin API of the master controller
    #[arg(long, env = "OVS_CONTROLLER", default_value = "http://localhost:7070")]
    controller: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a host in the cluster configuration
    InstallNode {
        #[arg(long)]
        machine_id: String,
        #[arg(long)]
        ip: String,
        /// Wipe the previous configuration of the host first
        #[arg(long)]
        clean: bool,
        /// Allow partitions outside /mnt
        #[arg(long)]
        extra_filesystems: bool,
        /// Installed framework version
        #[arg(long)]
        version: Option<String>,
    },

    /// Register an installed host as a StorageRouter
    InitNode {
        #[arg(long)]
        machine_id: String,
        #[arg(long)]
        ip: String,
        #[arg(long)]
        name: Option<String>,
        /// Join the cluster as a master node
        #[arg(long)]
        join_masters: bool,
        /// Host partition, `<mountpoint>:<ROLE[,ROLE]>` (repeatable)
        #[arg(long = "partition")]
        partitions: Vec<PartitionSpec>,
    },

    /// Create a vPool, or extend it to another host
    InitVpool(InitVpoolArgs),

    /// Remove a StorageDriver; the vPool goes with its last one
    RemoveVpool {
        /// StorageDriver id
        storagedriver: String,
    },

    /// Domain membership
    Domain {
        #[command(subcommand)]
        command: DomainCommands,
    },

    /// Run a checkup now
    Checkup {
        #[command(subcommand)]
        command: CheckupCommands,
    },

    /// Per-vdisk operations
    Vdisk {
        #[command(subcommand)]
        command: VdiskCommands,
    },
}

#[derive(Args)]
struct InitVpoolArgs {
    /// Ip of the host receiving the StorageDriver
    #[arg(long)]
    ip: String,
    #[arg(long)]
    name: String,
    /// JSON file with the full parameter set; flags override it
    #[arg(long)]
    params: Option<PathBuf>,
    #[arg(long)]
    storage_ip: Option<String>,
    #[arg(long)]
    backend_id: Option<String>,
    #[arg(long)]
    backend_name: Option<String>,
    #[arg(long, default_value = "default")]
    preset: String,
    #[arg(long)]
    backend_host: Option<String>,
    #[arg(long, default_value = "443")]
    backend_port: u16,
    #[arg(long)]
    proxies: Option<usize>,
    /// SCO size in MiB
    #[arg(long)]
    sco_size: Option<u32>,
    /// Cluster size in KiB
    #[arg(long)]
    cluster_size: Option<u32>,
    /// Write buffer in MiB
    #[arg(long)]
    write_buffer: Option<u32>,
    #[arg(long)]
    dtl_mode: Option<DtlMode>,
    #[arg(long)]
    dtl_transport: Option<DtlTransport>,
    /// Disable the local fragment cache
    #[arg(long)]
    no_fragment_cache: bool,
}

#[derive(Subcommand)]
enum DomainCommands {
    /// Put a host (ip, name or machine id) in a domain
    Add {
        host: String,
        domain: String,
        /// Membership as a recovery (backup) domain
        #[arg(long)]
        backup: bool,
    },
}

#[derive(Subcommand)]
enum CheckupCommands {
    Mds {
        #[arg(long)]
        vpool: Option<VPoolId>,
    },
    Dtl {
        #[arg(long)]
        vpool: Option<VPoolId>,
        #[arg(long)]
        vdisk: Option<VDiskId>,
    },
    CatchUp {
        #[arg(long)]
        vpool: Option<VPoolId>,
    },
}

#[derive(Subcommand)]
enum VdiskCommands {
    EnsureSafety {
        vdisk: VDiskId,
        /// Hosts not to place MDS copies on
        #[arg(long)]
        exclude: Vec<StorageRouterId>,
    },
    CatchUp {
        vdisk: VDiskId,
        #[arg(long)]
        background: bool,
    },
    Dtl {
        vdisk: VDiskId,
    },
    SetManualDtl {
        vdisk: VDiskId,
        /// Host of the DTL; none removes the DTL
        #[arg(long)]
        target: Option<StorageRouterId>,
        #[arg(long)]
        mode: Option<DtlMode>,
    },
    ClearManualDtl {
        vdisk: VDiskId,
    },
}

struct AdminClient {
    http: reqwest::Client,
    base: String,
}

impl AdminClient {
    fn new(base: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.trim_end_matches('/').to_string(),
        }
    }

    async fn send(&self, method: reqwest::Method, path: &str, body: Value) -> anyhow::Result<Value> {
        let url = format!("{}{}", self.base, path);
        let response = self
            .http
            .request(method, &url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("calling {}", url))?;
        let envelope: Envelope<Value> = response
            .json()
            .await
            .with_context(|| format!("decoding the answer of {}", url))?;
        match envelope {
            Envelope::Ok(value) => Ok(value),
            Envelope::Error(e) => bail!("{} ({})", e.message, e.kind),
        }
    }

    async fn post(&self, path: &str, body: Value) -> anyhow::Result<Value> {
        self.send(reqwest::Method::POST, path, body).await
    }
}

fn vpool_parameters(args: InitVpoolArgs) -> anyhow::Result<VPoolParameters> {
    let mut params = match &args.params {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str::<VPoolParameters>(&raw)
                .with_context(|| format!("parsing {}", path.display()))?
        }
        None => {
            let (Some(backend_id), Some(backend_host)) = (&args.backend_id, &args.backend_host)
            else {
                bail!("--backend-id and --backend-host are required without --params");
            };
            VPoolParameters::new(
                args.name.clone(),
                args.ip.clone(),
                BackendInfo {
                    backend_id: backend_id.clone(),
                    name: args.backend_name.clone().unwrap_or_else(|| backend_id.clone()),
                    preset: args.preset.clone(),
                    connection: BackendConnection {
                        host: backend_host.clone(),
                        port: args.backend_port,
                        local: true,
                    },
                },
            )
        }
    };
    params.vpool_name = args.name;
    params.storagerouter_ip = args.ip;
    params.storage_ip = args.storage_ip.unwrap_or_else(|| params.storagerouter_ip.clone());
    if let Some(proxies) = args.proxies {
        params.proxies = proxies;
    }
    params.sco_size = args.sco_size.or(params.sco_size);
    params.cluster_size = args.cluster_size.or(params.cluster_size);
    params.write_buffer = args.write_buffer.or(params.write_buffer);
    params.dtl_mode = args.dtl_mode.or(params.dtl_mode);
    params.dtl_transport = args.dtl_transport.or(params.dtl_transport);
    if args.no_fragment_cache {
        params.caching.fragment_cache = CacheSettings::disabled();
    }
    params.validate(None)?;
    Ok(params)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let client = AdminClient::new(&cli.controller);

    let result = match cli.command {
        Commands::InstallNode {
            machine_id,
            ip,
            clean,
            extra_filesystems,
            version,
        } => {
            let options = InstallNodeOptions {
                machine_id,
                ip,
                clean,
                extra_filesystems,
                version,
            };
            client.post("/nodes/install", serde_json::to_value(&options)?).await?
        }

        Commands::InitNode {
            machine_id,
            ip,
            name,
            join_masters,
            partitions,
        } => {
            let options = InitNodeOptions {
                machine_id,
                ip,
                name,
                join_masters,
                partitions,
            };
            client.post("/nodes/init", serde_json::to_value(&options)?).await?
        }

        Commands::InitVpool(args) => {
            let params = vpool_parameters(args)?;
            client.post("/vpools", serde_json::to_value(&params)?).await?
        }

        Commands::RemoveVpool { storagedriver } => {
            let report = client
                .send(
                    reqwest::Method::DELETE,
                    &format!("/storagedrivers/{}", storagedriver),
                    json!({}),
                )
                .await?;
            if report["errors_found"] == true {
                eprintln!("StorageDriver removed with errors:");
                if let Some(errors) = report["errors"].as_array() {
                    for e in errors {
                        eprintln!("  {}", e.as_str().unwrap_or_default());
                    }
                }
                std::process::exit(1);
            }
            report
        }

        Commands::Domain {
            command: DomainCommands::Add {
                host,
                domain,
                backup,
            },
        } => {
            client
                .post(
                    "/domains",
                    json!({ "host": host, "domain": domain, "backup": backup }),
                )
                .await?
        }

        Commands::Checkup { command } => match command {
            CheckupCommands::Mds { vpool } => {
                client.post("/checkups/mds", json!({ "vpool": vpool })).await?
            }
            CheckupCommands::Dtl { vpool, vdisk } => {
                client
                    .post("/checkups/dtl", json!({ "vpool": vpool, "vdisk": vdisk }))
                    .await?
            }
            CheckupCommands::CatchUp { vpool } => {
                client
                    .post("/checkups/catch-up", json!({ "vpool": vpool }))
                    .await?
            }
        },

        Commands::Vdisk { command } => match command {
            VdiskCommands::EnsureSafety { vdisk, exclude } => {
                client
                    .post(
                        &format!("/vdisks/{}/ensure-safety", vdisk),
                        json!({ "excluded": exclude }),
                    )
                    .await?
            }
            VdiskCommands::CatchUp { vdisk, background } => {
                client
                    .post(
                        &format!("/vdisks/{}/catch-up?background={}", vdisk, background),
                        json!({}),
                    )
                    .await?
            }
            VdiskCommands::Dtl { vdisk } => {
                client
                    .post(&format!("/vdisks/{}/dtl-checkup", vdisk), json!({}))
                    .await?
            }
            VdiskCommands::SetManualDtl {
                vdisk,
                target,
                mode,
            } => {
                client
                    .post(
                        &format!("/vdisks/{}/manual-dtl", vdisk),
                        json!({ "target": target, "mode": mode }),
                    )
                    .await?
            }
            VdiskCommands::ClearManualDtl { vdisk } => {
                client
                    .send(
                        reqwest::Method::DELETE,
                        &format!("/vdisks/{}/manual-dtl", vdisk),
                        json!({}),
                    )
                    .await?
            }
        },
    };

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_controller_address_from_environment() {
        let command = Cli::command();
        let controller = command
            .get_arguments()
            .find(|arg| arg.get_id() == "controller")
            .unwrap();
        assert_eq!(
            controller.get_env().and_then(|name| name.to_str()),
            Some("OVS_CONTROLLER")
        );

        let args = ["ovs", "--controller", "http://10.0.0.1:7070", "checkup", "mds"];
        let cli = Cli::try_parse_from(args).unwrap();
        assert_eq!(cli.controller, "http://10.0.0.1:7070");
    }
}
