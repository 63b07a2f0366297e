//! Error types shared by the cloud client, the export orchestrator and the
//! transfer engine.

use std::{fmt, io, time::Duration};
use thiserror::Error;

/// Remote resource kinds, used to label lookups and failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Instance,
    Disk,
    Image,
    Network,
    Bucket,
    Object,
    Operation,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Instance => "instance",
            ResourceKind::Disk => "disk",
            ResourceKind::Image => "image",
            ResourceKind::Network => "network",
            ResourceKind::Bucket => "bucket",
            ResourceKind::Object => "object",
            ResourceKind::Operation => "operation",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = CloudError;

    /// Parse a kind name as typed on a command line. Unknown kinds are
    /// rejected with [`CloudError::UnsupportedType`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "instance" | "instances" | "vm" | "vms" => Ok(ResourceKind::Instance),
            "disk" | "disks" => Ok(ResourceKind::Disk),
            "image" | "images" => Ok(ResourceKind::Image),
            "network" | "networks" => Ok(ResourceKind::Network),
            "bucket" | "buckets" => Ok(ResourceKind::Bucket),
            "object" | "objects" => Ok(ResourceKind::Object),
            other => Err(CloudError::UnsupportedType(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("{kind} `{id}` not found")]
    NotFound { kind: ResourceKind, id: String },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{what}: expected status {expected}, found {actual}")]
    UnexpectedState {
        what: String,
        expected: String,
        actual: String,
    },
    #[error("image `{image}` reported status FAILED")]
    ImageCreationFailed { image: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("unsupported type `{0}`")]
    UnsupportedType(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("{operation} did not complete within {after:?}")]
    Timeout { operation: String, after: Duration },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl CloudError {
    pub fn not_found(kind: ResourceKind, id: impl Into<String>) -> Self {
        CloudError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::NotFound { .. })
    }
}

pub type CloudResult<T> = Result<T, CloudError>;

/// Orchestration step that failed, used to label [`ExportError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportStep {
    VmLookup,
    PowerOff,
    ImageCreation,
    ImageExport,
}

impl fmt::Display for ExportStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExportStep::VmLookup => "vm lookup",
            ExportStep::PowerOff => "power off",
            ExportStep::ImageCreation => "image creation",
            ExportStep::ImageExport => "image export",
        };
        f.write_str(s)
    }
}

/// A failed export, carrying the VM and the step that failed. The underlying
/// [`CloudError`] is kept as the error source.
#[derive(Debug, Error)]
#[error("vm `{vm}`: {step} failed")]
pub struct ExportError {
    pub vm: String,
    pub step: ExportStep,
    #[source]
    pub source: CloudError,
}

impl ExportError {
    pub fn new(vm: impl Into<String>, step: ExportStep, source: CloudError) -> Self {
        Self {
            vm: vm.into(),
            step,
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("destination `{path}`: {source}")]
    Destination {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("copy aborted after {transferred} bytes: {source}")]
    Copy {
        transferred: u64,
        #[source]
        source: io::Error,
    },
    #[error("checksum mismatch: object md5 {expected}, transferred md5 {actual}")]
    Checksum { expected: String, actual: String },
    #[error("progress reporter failed: {0}")]
    Reporter(String),
    #[error("source object: {0}")]
    Source(#[from] CloudError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_parse_from_command_line_names() {
        assert_eq!("vms".parse::<ResourceKind>().unwrap(), ResourceKind::Instance);
        assert_eq!(" Images ".parse::<ResourceKind>().unwrap(), ResourceKind::Image);
        assert_eq!("network".parse::<ResourceKind>().unwrap(), ResourceKind::Network);
    }

    #[test]
    fn unknown_kind_is_unsupported() {
        let err = "bogus".parse::<ResourceKind>().unwrap_err();
        assert!(matches!(err, CloudError::UnsupportedType(ref kind) if kind == "bogus"));
    }

    #[test]
    fn export_error_keeps_cause() {
        use std::error::Error as _;
        let err = ExportError::new(
            "p/z/vm1",
            ExportStep::PowerOff,
            CloudError::Transport("boom".into()),
        );
        assert_eq!(err.to_string(), "vm `p/z/vm1`: power off failed");
        assert!(err.source().is_some());
    }
}
