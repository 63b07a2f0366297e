//! The transport seam between [`CloudClient`](super::CloudClient) and the
//! platform. One method per remote call; blocking semantics (waiting on
//! long-running operations) belong to the implementation.

use crate::{
    errors::CloudResult,
    models::{
        bucket::Bucket,
        image::{Image, ImageFormat, ImageInsert},
        network::Network,
        object::ObjectMetadata,
        vm::{Disk, Instance, VmRef},
    },
};
use async_trait::async_trait;
use std::fmt;
use tokio::io::AsyncRead;

/// Readable payload of an object.
pub type ObjectStream = Box<dyn AsyncRead + Send + Unpin>;

/// Service handles that authenticate independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    Compute,
    Disks,
    Images,
    Networks,
    Storage,
    Build,
}

impl Service {
    pub const ALL: [Service; 6] = [
        Service::Compute,
        Service::Disks,
        Service::Images,
        Service::Networks,
        Service::Storage,
        Service::Build,
    ];

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Service::Compute => "compute",
            Service::Disks => "disks",
            Service::Images => "images",
            Service::Networks => "networks",
            Service::Storage => "storage",
            Service::Build => "build",
        };
        f.write_str(s)
    }
}

/// One page of a list call.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_page_token: Option<String>,
}

/// Parameters of an image export job.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportJob {
    pub project: String,
    pub image: String,
    pub format: ImageFormat,
    /// `gs://bucket/key`
    pub destination_uri: String,
}

/// Container image that performs the conversion.
pub const EXPORT_BUILDER_IMAGE: &str = "gcr.io/compute-image-tools/gce_vm_image_export:release";

impl ExportJob {
    /// Arguments passed to [`EXPORT_BUILDER_IMAGE`].
    pub fn builder_args(&self) -> Vec<String> {
        vec![
            "--timeout=7000s".to_string(),
            format!("--source_image={}", self.image),
            "--client_id=api".to_string(),
            format!("--format={}", self.format),
            format!("--destination_uri={}", self.destination_uri),
        ]
    }
}

#[async_trait]
pub trait CloudApi: Send + Sync {
    /// Verify credentials for a service handle.
    async fn authenticate(&self, service: Service) -> CloudResult<()>;

    async fn get_instance(&self, vm: &VmRef) -> CloudResult<Instance>;
    /// Instances across all zones of a project.
    async fn list_instances(
        &self,
        project: &str,
        page_token: Option<String>,
    ) -> CloudResult<Page<Instance>>;
    /// Start an instance and wait for the operation to finish.
    async fn start_instance(&self, vm: &VmRef) -> CloudResult<()>;
    /// Stop an instance and wait for the operation to finish.
    async fn stop_instance(&self, vm: &VmRef) -> CloudResult<()>;

    async fn get_disk(&self, project: &str, zone: &str, name: &str) -> CloudResult<Disk>;

    async fn get_image(&self, project: &str, name: &str) -> CloudResult<Image>;
    async fn list_images(
        &self,
        project: &str,
        page_token: Option<String>,
    ) -> CloudResult<Page<Image>>;
    /// Create an image and wait for the insert operation to finish.
    async fn insert_image(&self, project: &str, image: &ImageInsert) -> CloudResult<()>;
    async fn delete_image(&self, project: &str, name: &str) -> CloudResult<()>;

    async fn get_network(&self, project: &str, name: &str) -> CloudResult<Network>;
    async fn list_networks(
        &self,
        project: &str,
        page_token: Option<String>,
    ) -> CloudResult<Page<Network>>;

    async fn create_bucket(&self, project: &str, name: &str) -> CloudResult<Bucket>;
    async fn get_object(&self, bucket: &str, key: &str) -> CloudResult<ObjectMetadata>;
    async fn read_object(&self, bucket: &str, key: &str) -> CloudResult<ObjectStream>;

    /// Submit an export job and wait until it finishes.
    async fn run_export(&self, job: &ExportJob) -> CloudResult<()>;
}
