use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use gcp_migrate::{
    client::{CloudClient, ListFilter, auth::Credentials, rest::RestApi},
    config::{CloudArgs, ExportConfig},
    errors::{CloudError, ResourceKind},
    models::{image::Image, network::Network, vm::{Instance, VmRef}},
    services::export_service::ImageExporter,
};
use serde::Serialize;
use std::{env, sync::Arc};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "gcp-export",
    version,
    about = "Export Compute Engine boot disks to bucket storage"
)]
struct Cli {
    #[command(flatten)]
    cloud: CloudArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Power off each VM, image its boot disk and export the image
    Export {
        /// VM names, or numeric instance ids
        #[arg(required = true)]
        vms: Vec<String>,
    },
    /// List resources of a kind (instances, images, networks)
    List {
        kind: String,
        /// Only names starting with this prefix
        #[arg(long)]
        prefix: Option<String>,
    },
    /// Delete the migration images of the given VMs
    Finalize {
        #[arg(required = true)]
        vms: Vec<String>,
    },
    /// Start source VMs again
    PowerOn {
        #[arg(required = true)]
        vms: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    if let Err(err) = run(Cli::parse()).await {
        tracing::error!("gcp-export failed: {:#}", err);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let cfg = ExportConfig::from_args(cli.cloud, |key| env::var(key).ok())?;
    tracing::debug!("Starting gcp-export with config: {:?}", cfg);

    let credentials = Credentials::from_file(&cfg.auth_path)
        .await
        .with_context(|| format!("loading credentials from {}", cfg.auth_path.display()))?;
    let project = cfg
        .project
        .clone()
        .or_else(|| credentials.project_id().map(str::to_string))
        .context("--project is required when the credentials name no project")?;
    let api = RestApi::new(credentials, cfg.operation_poll)?;
    let client = CloudClient::new(Arc::new(api), project.clone(), cfg.bucket.clone());
    let exporter = ImageExporter::new(client.clone(), cfg.options.clone());

    match cli.command {
        Command::Export { vms } => {
            let vms = vm_refs(&vms, &project, cfg.zone.as_deref())?;
            let mut failed = 0;
            for result in exporter.export_all(vms).await {
                match result {
                    Ok(outcome) => print_json(&outcome)?,
                    Err(err) => {
                        failed += 1;
                        tracing::error!("{}: {}", err, err.source);
                    }
                }
            }
            if failed > 0 {
                return Err(anyhow!("{} export(s) failed", failed));
            }
        }
        Command::List { kind, prefix } => {
            let filter = ListFilter {
                name_prefix: prefix,
            };
            match kind.parse::<ResourceKind>()? {
                ResourceKind::Instance => print_json(&client.list::<Instance>(&filter).await?)?,
                ResourceKind::Image => print_json(&client.list::<Image>(&filter).await?)?,
                ResourceKind::Network => print_json(&client.list::<Network>(&filter).await?)?,
                other => return Err(CloudError::UnsupportedType(format!("list of {}", other)).into()),
            }
        }
        Command::Finalize { vms } => {
            let vms = vm_refs(&vms, &project, cfg.zone.as_deref())?;
            let deleted = exporter.finalize(&vms).await;
            tracing::info!(deleted, "finalize complete");
        }
        Command::PowerOn { vms } => {
            for vm in vm_refs(&vms, &project, cfg.zone.as_deref())? {
                exporter
                    .power_on(&vm)
                    .await
                    .with_context(|| format!("starting {}", vm))?;
            }
        }
    }
    Ok(())
}

/// Instance names always start with a letter, so an all-digit value is an id.
fn vm_refs(values: &[String], project: &str, zone: Option<&str>) -> Result<Vec<VmRef>> {
    let zone = zone.context("--zone is required for VM operations")?;
    Ok(values
        .iter()
        .map(|value| {
            if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
                VmRef::new("", project, zone).with_id(value.as_str())
            } else {
                VmRef::new(value.as_str(), project, zone)
            }
        })
        .collect())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
