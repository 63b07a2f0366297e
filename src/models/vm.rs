//! Represents source virtual machines and their disks.

use crate::errors::{CloudError, CloudResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical reference to a source VM.
///
/// Carries every field any backend call may need; each operation picks the
/// fields it requires. Either `name` or `id` must be set.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct VmRef {
    pub name: String,
    pub id: String,
    pub project: String,
    pub zone: String,
}

impl VmRef {
    pub fn new(
        name: impl Into<String>,
        project: impl Into<String>,
        zone: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            id: String::new(),
            project: project.into(),
            zone: zone.into(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Fails with `InvalidArgument` when neither name nor id is set.
    pub fn validate(&self) -> CloudResult<()> {
        if self.name.is_empty() && self.id.is_empty() {
            return Err(CloudError::InvalidArgument("id or name is required".into()));
        }
        if self.project.is_empty() || self.zone.is_empty() {
            return Err(CloudError::InvalidArgument(format!(
                "vm `{}` needs both project and zone",
                self
            )));
        }
        Ok(())
    }

    /// Name-or-id key accepted by the instance get endpoint.
    pub fn lookup_key(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

impl fmt::Display for VmRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.name.is_empty(), self.id.is_empty()) {
            (false, false) => write!(f, "{}/{}/{} ({})", self.project, self.zone, self.name, self.id),
            (false, true) => write!(f, "{}/{}/{}", self.project, self.zone, self.name),
            _ => write!(f, "{}/{}/id:{}", self.project, self.zone, self.id),
        }
    }
}

/// Instance lifecycle status as reported by the compute service.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Provisioning,
    Staging,
    Running,
    Stopping,
    Stopped,
    Suspending,
    Suspended,
    Terminated,
    Repairing,
    #[default]
    #[serde(other)]
    Unknown,
}

impl InstanceStatus {
    /// `TERMINATED` is what the compute API reports for a stopped instance;
    /// `STOPPED` is accepted as well.
    pub fn is_powered_off(&self) -> bool {
        matches!(self, InstanceStatus::Terminated | InstanceStatus::Stopped)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceStatus::Provisioning => "PROVISIONING",
            InstanceStatus::Staging => "STAGING",
            InstanceStatus::Running => "RUNNING",
            InstanceStatus::Stopping => "STOPPING",
            InstanceStatus::Stopped => "STOPPED",
            InstanceStatus::Suspending => "SUSPENDING",
            InstanceStatus::Suspended => "SUSPENDED",
            InstanceStatus::Terminated => "TERMINATED",
            InstanceStatus::Repairing => "REPAIRING",
            InstanceStatus::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// A compute instance.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub status: InstanceStatus,
    /// Zone URL, e.g. `.../projects/p/zones/us-central1-a`.
    pub zone: String,
    pub self_link: Option<String>,
    pub disks: Vec<AttachedDisk>,
    pub network_interfaces: Vec<NetworkInterface>,
}

impl Instance {
    /// The attached disk flagged as boot disk, if any.
    pub fn boot_disk(&self) -> Option<&AttachedDisk> {
        self.disks.iter().find(|d| d.boot)
    }

    /// Short zone name taken from the zone URL.
    pub fn zone_name(&self) -> &str {
        last_segment(&self.zone)
    }
}

/// A disk attached to an instance.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AttachedDisk {
    pub boot: bool,
    pub device_name: String,
    /// URL of the backing persistent disk.
    pub source: String,
    pub disk_size_gb: Option<String>,
}

impl AttachedDisk {
    /// Name of the backing disk resource. Falls back to the device name when
    /// the source URL is missing.
    pub fn disk_name(&self) -> &str {
        if self.source.is_empty() {
            &self.device_name
        } else {
            last_segment(&self.source)
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkInterface {
    pub name: String,
    pub network: String,
    #[serde(rename = "networkIP")]
    pub network_ip: Option<String>,
}

/// A persistent disk resource.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Disk {
    pub id: String,
    pub name: String,
    pub self_link: String,
    pub size_gb: Option<String>,
}

/// Last `/`-separated segment of a resource URL.
pub fn last_segment(url: &str) -> &str {
    url.rsplit('/').next().unwrap_or(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_json_finds_boot_disk() {
        let json = r#"{
            "id": "123",
            "name": "vm1",
            "status": "RUNNING",
            "zone": "https://www.googleapis.com/compute/v1/projects/p/zones/us-central1-a",
            "disks": [
                {"boot": false, "deviceName": "data", "source": ".../zones/us-central1-a/disks/vm1-data"},
                {"boot": true, "deviceName": "persistent-disk-0", "source": ".../zones/us-central1-a/disks/vm1"}
            ]
        }"#;
        let vm: Instance = serde_json::from_str(json).unwrap();
        assert_eq!(vm.status, InstanceStatus::Running);
        assert_eq!(vm.zone_name(), "us-central1-a");
        assert_eq!(vm.boot_disk().map(|d| d.disk_name()), Some("vm1"));
    }

    #[test]
    fn unknown_status_does_not_fail_parsing() {
        let vm: Instance = serde_json::from_str(r#"{"name":"x","status":"HIBERNATING"}"#).unwrap();
        assert_eq!(vm.status, InstanceStatus::Unknown);
        assert!(!vm.status.is_powered_off());
    }

    #[test]
    fn validate_requires_name_or_id() {
        let vm = VmRef::new("", "p", "z");
        assert!(matches!(vm.validate(), Err(CloudError::InvalidArgument(_))));
        assert!(VmRef::new("", "p", "z").with_id("42").validate().is_ok());
    }
}
