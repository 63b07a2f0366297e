use crate::{
    models::image::ImageFormat, poll::PollPolicy, services::export_service::ExportOptions,
    services::transfer_service::DEFAULT_REPORT_INTERVAL,
};
use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser};
use std::{env, path::PathBuf, str::FromStr, time::Duration};

pub const CREDENTIALS_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";
pub const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:2112";

/// Populator configuration. Every transfer coordinate is required.
#[derive(Debug, Clone, PartialEq)]
pub struct PopulatorConfig {
    pub auth_path: PathBuf,
    pub bucket: String,
    pub object: String,
    pub volume_path: PathBuf,
    pub cr_name: String,
    pub cr_namespace: String,
    pub metrics_addr: String,
    pub report_interval: Duration,
}

/// Command-line + environment configuration for the volume populator.
#[derive(Parser, Debug, Default)]
#[command(
    name = "gcp-populator",
    version,
    about = "Fill a volume from a disk image exported to bucket storage"
)]
pub struct PopulatorArgs {
    /// Credentials file (overrides GOOGLE_APPLICATION_CREDENTIALS)
    #[arg(long)]
    pub google_auth_path: Option<String>,

    /// Bucket holding the exported image
    #[arg(long)]
    pub bucket_name: Option<String>,

    /// Object key of the exported image
    #[arg(long)]
    pub object_name: Option<String>,

    /// Destination volume: a block device or a `disk.img` file
    #[arg(long)]
    pub volume_path: Option<String>,

    /// Name of the populator custom resource
    #[arg(long)]
    pub cr_name: Option<String>,

    /// Namespace of the populator custom resource
    #[arg(long)]
    pub cr_namespace: Option<String>,

    /// Metrics listen address (overrides POPULATOR_METRICS_ADDR)
    #[arg(long)]
    pub metrics_addr: Option<String>,

    /// Seconds between progress reports (overrides POPULATOR_REPORT_INTERVAL_SECS)
    #[arg(long)]
    pub report_interval_secs: Option<u64>,
}

impl PopulatorConfig {
    pub fn from_env_and_args() -> Result<Self> {
        Self::from_args(PopulatorArgs::parse(), |key| env::var(key).ok())
    }

    /// Merge parsed flags with environment fallbacks looked up via `env`.
    pub fn from_args(args: PopulatorArgs, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let report_interval = match args.report_interval_secs {
            Some(secs) => Duration::from_secs(secs),
            None => parse_env(&env, "POPULATOR_REPORT_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_REPORT_INTERVAL),
        };
        if report_interval.is_zero() {
            return Err(anyhow!("report interval must be at least one second"));
        }

        Ok(Self {
            auth_path: required(
                args.google_auth_path.or_else(|| env(CREDENTIALS_ENV)),
                "--google-auth-path",
            )?
            .into(),
            bucket: required(args.bucket_name, "--bucket-name")?,
            object: required(args.object_name, "--object-name")?,
            volume_path: required(args.volume_path, "--volume-path")?.into(),
            cr_name: required(args.cr_name, "--cr-name")?,
            cr_namespace: required(args.cr_namespace, "--cr-namespace")?,
            metrics_addr: args
                .metrics_addr
                .or_else(|| env("POPULATOR_METRICS_ADDR"))
                .unwrap_or_else(|| DEFAULT_METRICS_ADDR.into()),
            report_interval,
        })
    }
}

/// Cloud connection and export tuning shared by the export CLI subcommands.
#[derive(Args, Debug, Clone, Default)]
pub struct CloudArgs {
    /// Project to operate in (overrides GCP_EXPORT_PROJECT; defaults to the credentials' project)
    #[arg(long, global = true)]
    pub project: Option<String>,

    /// Zone of the source VMs (overrides GCP_EXPORT_ZONE)
    #[arg(long, global = true)]
    pub zone: Option<String>,

    /// Credentials file (overrides GOOGLE_APPLICATION_CREDENTIALS)
    #[arg(long, global = true)]
    pub google_auth_path: Option<String>,

    /// Export bucket; created on first export when unset (overrides GCP_EXPORT_BUCKET)
    #[arg(long, global = true)]
    pub bucket: Option<String>,

    /// Exported disk format (overrides GCP_EXPORT_FORMAT)
    #[arg(long, global = true)]
    pub format: Option<String>,

    /// Create images even from disks of running instances
    #[arg(long, global = true)]
    pub force_create: bool,

    /// Seconds between status polls
    #[arg(long, global = true)]
    pub poll_interval_secs: Option<u64>,

    /// Seconds to wait for a VM to power off
    #[arg(long, global = true)]
    pub power_timeout_secs: Option<u64>,

    /// Seconds to wait for an image to become ready
    #[arg(long, global = true)]
    pub image_timeout_secs: Option<u64>,

    /// Seconds to wait for one export job
    #[arg(long, global = true)]
    pub export_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ExportConfig {
    pub auth_path: PathBuf,
    /// `None` means "use the project named in the credentials".
    pub project: Option<String>,
    pub zone: Option<String>,
    pub bucket: Option<String>,
    /// Interval and timeout for compute and build operation waits.
    pub operation_poll: PollPolicy,
    pub options: ExportOptions,
}

impl ExportConfig {
    pub fn from_args(args: CloudArgs, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = ExportOptions::default();
        let format = match args.format.or_else(|| env("GCP_EXPORT_FORMAT")) {
            Some(raw) => ImageFormat::from_str(&raw).map_err(|err| anyhow!(err))?,
            None => defaults.format,
        };
        let interval = args
            .poll_interval_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.power_poll.interval);
        if interval.is_zero() {
            return Err(anyhow!("poll interval must be at least one second"));
        }
        let secs = |value: Option<u64>, default: Duration| value.map(Duration::from_secs).unwrap_or(default);
        let export_timeout = secs(args.export_timeout_secs, defaults.export_timeout);

        Ok(Self {
            auth_path: required(
                args.google_auth_path.or_else(|| env(CREDENTIALS_ENV)),
                "--google-auth-path",
            )?
            .into(),
            project: non_empty(args.project.or_else(|| env("GCP_EXPORT_PROJECT"))),
            zone: non_empty(args.zone.or_else(|| env("GCP_EXPORT_ZONE"))),
            bucket: non_empty(args.bucket.or_else(|| env("GCP_EXPORT_BUCKET"))),
            operation_poll: PollPolicy::new(interval, export_timeout),
            options: ExportOptions {
                format,
                force_create: args.force_create,
                power_poll: PollPolicy::new(
                    interval,
                    secs(args.power_timeout_secs, defaults.power_poll.timeout),
                ),
                image_poll: PollPolicy::new(
                    interval,
                    secs(args.image_timeout_secs, defaults.image_poll.timeout),
                ),
                export_timeout,
            },
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn required(value: Option<String>, flag: &str) -> Result<String> {
    non_empty(value).with_context(|| format!("{} is required", flag))
}

fn parse_env<T: FromStr>(env: impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env(key)
        .map(|value| {
            value
                .parse::<T>()
                .with_context(|| format!("parsing {} value `{}`", key, value))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_args() -> PopulatorArgs {
        PopulatorArgs {
            google_auth_path: Some("/etc/gcp/creds.json".into()),
            bucket_name: Some("forklift-20260101000000".into()),
            object_name: Some("vm1-forklift.qcow2".into()),
            volume_path: Some("/dev/block".into()),
            cr_name: Some("vm1-populator".into()),
            cr_namespace: Some("migrations".into()),
            ..Default::default()
        }
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn populator_defaults() {
        let cfg = PopulatorConfig::from_args(full_args(), no_env).unwrap();
        assert_eq!(cfg.metrics_addr, DEFAULT_METRICS_ADDR);
        assert_eq!(cfg.report_interval, DEFAULT_REPORT_INTERVAL);
        assert_eq!(cfg.volume_path, PathBuf::from("/dev/block"));
    }

    #[test]
    fn missing_coordinate_is_fatal() {
        let args = PopulatorArgs {
            object_name: None,
            ..full_args()
        };
        let err = PopulatorConfig::from_args(args, no_env).unwrap_err();
        assert!(err.to_string().contains("--object-name"));

        let args = PopulatorArgs {
            bucket_name: Some("  ".into()),
            ..full_args()
        };
        assert!(PopulatorConfig::from_args(args, no_env).is_err());
    }

    #[test]
    fn credentials_fall_back_to_environment() {
        let args = PopulatorArgs {
            google_auth_path: None,
            ..full_args()
        };
        let env = |key: &str| match key {
            CREDENTIALS_ENV => Some("/var/run/creds.json".to_string()),
            "POPULATOR_METRICS_ADDR" => Some("127.0.0.1:9000".to_string()),
            "POPULATOR_REPORT_INTERVAL_SECS" => Some("10".to_string()),
            _ => None,
        };
        let cfg = PopulatorConfig::from_args(args, env).unwrap();
        assert_eq!(cfg.auth_path, PathBuf::from("/var/run/creds.json"));
        assert_eq!(cfg.metrics_addr, "127.0.0.1:9000");
        assert_eq!(cfg.report_interval, Duration::from_secs(10));
    }

    #[test]
    fn bad_interval_is_rejected() {
        let env = |key: &str| (key == "POPULATOR_REPORT_INTERVAL_SECS").then(|| "soon".to_string());
        assert!(PopulatorConfig::from_args(full_args(), env).is_err());

        let args = PopulatorArgs {
            report_interval_secs: Some(0),
            ..full_args()
        };
        assert!(PopulatorConfig::from_args(args, no_env).is_err());
    }

    #[test]
    fn export_config_merges_flags_and_environment() {
        let args = CloudArgs {
            google_auth_path: Some("creds.json".into()),
            zone: Some("us-central1-a".into()),
            poll_interval_secs: Some(2),
            export_timeout_secs: Some(60),
            ..Default::default()
        };
        let env = |key: &str| match key {
            "GCP_EXPORT_PROJECT" => Some("proj".to_string()),
            "GCP_EXPORT_FORMAT" => Some("vmdk".to_string()),
            "GCP_EXPORT_BUCKET" => Some(String::new()),
            _ => None,
        };
        let cfg = ExportConfig::from_args(args, env).unwrap();
        assert_eq!(cfg.project.as_deref(), Some("proj"));
        assert_eq!(cfg.bucket, None);
        assert_eq!(cfg.options.format, ImageFormat::Vmdk);
        assert_eq!(cfg.options.power_poll.interval, Duration::from_secs(2));
        assert_eq!(cfg.options.export_timeout, Duration::from_secs(60));
        assert_eq!(cfg.operation_poll.timeout, Duration::from_secs(60));
    }

    #[test]
    fn unknown_format_is_rejected() {
        let args = CloudArgs {
            google_auth_path: Some("creds.json".into()),
            format: Some("raw".into()),
            ..Default::default()
        };
        assert!(ExportConfig::from_args(args, no_env).is_err());
    }
}
