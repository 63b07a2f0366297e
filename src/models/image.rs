//! Represents disk images created from a VM's boot disk.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Suffix appended to the VM name to form the migration image name.
pub const IMAGE_NAME_SUFFIX: &str = "forklift";

/// Deterministic image name for a VM, e.g. `vm1-forklift`. Retries after a
/// crash find the image from the earlier attempt under the same name.
pub fn image_name_for(vm_name: &str) -> String {
    format!("{}-{}", vm_name, IMAGE_NAME_SUFFIX)
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImageStatus {
    #[default]
    Pending,
    Ready,
    Failed,
    Deleting,
}

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ImageStatus::Pending => "PENDING",
            ImageStatus::Ready => "READY",
            ImageStatus::Failed => "FAILED",
            ImageStatus::Deleting => "DELETING",
        };
        f.write_str(s)
    }
}

/// A read-only snapshot of a disk.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Image {
    pub id: String,
    pub name: String,
    pub status: ImageStatus,
    /// URL of the disk this image was created from.
    pub source_disk: Option<String>,
    pub storage_locations: Vec<String>,
    pub disk_size_gb: Option<String>,
    pub archive_size_bytes: Option<String>,
}

/// Request body for creating an image from a disk.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageInsert {
    pub name: String,
    pub source_disk: String,
    /// Empty lets the platform pick the location closest to the source.
    pub storage_locations: Vec<String>,
    /// Proceed even when the disk is attached to a running instance.
    #[serde(skip)]
    pub force_create: bool,
}

/// Portable disk formats the export job can produce.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Qcow2,
    Vmdk,
    Vhdx,
    Vpc,
}

impl ImageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Qcow2 => "qcow2",
            ImageFormat::Vmdk => "vmdk",
            ImageFormat::Vhdx => "vhdx",
            ImageFormat::Vpc => "vpc",
        }
    }

    /// Object key an image is exported under, e.g. `vm1-forklift.qcow2`.
    pub fn object_key(&self, image_name: &str) -> String {
        format!("{}.{}", image_name, self.extension())
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ImageFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "qcow2" => Ok(ImageFormat::Qcow2),
            "vmdk" => Ok(ImageFormat::Vmdk),
            "vhdx" => Ok(ImageFormat::Vhdx),
            "vpc" => Ok(ImageFormat::Vpc),
            other => Err(format!("unknown image format `{}`", other)),
        }
    }
}
