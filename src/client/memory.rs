//! In-memory platform backend.
//!
//! Behaves like the real services closely enough to drive the whole pipeline
//! without network access: instances stop after a configurable number of
//! status reads, images turn `READY` (or `FAILED`) after a number of polls,
//! and export jobs write a payload into the destination bucket. Every
//! mutating call is counted so callers can assert idempotence.

use super::api::{CloudApi, ExportJob, ObjectStream, Page, Service};
use crate::{
    errors::{CloudError, CloudResult, ResourceKind},
    models::{
        bucket::Bucket,
        image::{Image, ImageInsert, ImageStatus},
        network::Network,
        object::{ObjectMetadata, parse_object_uri},
        vm::{AttachedDisk, Disk, Instance, InstanceStatus, VmRef},
    },
};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use std::{collections::BTreeMap, io::Cursor, sync::Arc};

/// Counters for calls made against a [`MemoryCloud`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Calls {
    pub auth: usize,
    pub list_pages: usize,
    pub start_requests: usize,
    pub stop_requests: usize,
    pub image_inserts: usize,
    pub image_deletes: usize,
    pub buckets_created: usize,
    pub exports: Vec<ExportJob>,
}

#[derive(Default)]
struct State {
    instances: BTreeMap<(String, String, String), Instance>,
    stopping_reads: BTreeMap<String, u32>,
    disks: BTreeMap<(String, String, String), Disk>,
    images: BTreeMap<(String, String), Image>,
    image_polls: BTreeMap<String, u32>,
    networks: BTreeMap<(String, String), Network>,
    buckets: BTreeMap<String, BTreeMap<String, Bytes>>,
    next_id: u64,
    page_size: Option<usize>,
    stop_delay: u32,
    image_ready_after: u32,
    image_outcome: Option<ImageStatus>,
    restart: Option<(u32, InstanceStatus)>,
    export_payload: Bytes,
    fail_auth: bool,
    fail_export: Option<String>,
    calls: Calls,
}

#[derive(Clone, Default)]
pub struct MemoryCloud {
    state: Arc<Mutex<State>>,
}

impl MemoryCloud {
    pub fn new() -> Self {
        let cloud = Self::default();
        cloud.state.lock().export_payload = Bytes::from_static(b"QFI\xfb exported image");
        cloud
    }

    /// Split list results into pages of `size` items.
    pub fn with_page_size(self, size: usize) -> Self {
        self.state.lock().page_size = Some(size.max(1));
        self
    }

    /// Number of status reads an instance reports `STOPPING` after a stop.
    pub fn with_stop_delay(self, reads: u32) -> Self {
        self.state.lock().stop_delay = reads;
        self
    }

    /// Number of reads a new image reports `PENDING` before settling.
    pub fn with_image_ready_after(self, polls: u32) -> Self {
        self.state.lock().image_ready_after = polls;
        self
    }

    /// After `reads` instance reads, the next read finds the instance in
    /// `status`, as if someone restarted it behind the pipeline's back.
    pub fn with_restart_after_reads(self, reads: u32, status: InstanceStatus) -> Self {
        self.state.lock().restart = Some((reads, status));
        self
    }

    /// New images settle as `FAILED` instead of `READY`.
    pub fn with_failing_images(self) -> Self {
        self.state.lock().image_outcome = Some(ImageStatus::Failed);
        self
    }

    /// Bytes every export job writes to its destination object.
    pub fn with_export_payload(self, payload: impl Into<Bytes>) -> Self {
        self.state.lock().export_payload = payload.into();
        self
    }

    pub fn fail_auth(&self, fail: bool) {
        self.state.lock().fail_auth = fail;
    }

    pub fn fail_exports(&self, message: impl Into<String>) {
        self.state.lock().fail_export = Some(message.into());
    }

    /// Add a running instance with a boot disk named after it.
    pub fn add_running_vm(&self, project: &str, zone: &str, name: &str) -> VmRef {
        self.add_vm(project, zone, name, InstanceStatus::Running)
    }

    pub fn add_vm(&self, project: &str, zone: &str, name: &str, status: InstanceStatus) -> VmRef {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = format!("{}", 1000 + state.next_id);
        let disk_link = format!(
            "https://www.googleapis.com/compute/v1/projects/{}/zones/{}/disks/{}",
            project, zone, name
        );
        let instance = Instance {
            id: id.clone(),
            name: name.to_string(),
            status,
            zone: format!(
                "https://www.googleapis.com/compute/v1/projects/{}/zones/{}",
                project, zone
            ),
            self_link: None,
            disks: vec![AttachedDisk {
                boot: true,
                device_name: "persistent-disk-0".into(),
                source: disk_link.clone(),
                disk_size_gb: Some("10".into()),
            }],
            network_interfaces: Vec::new(),
        };
        state.instances.insert(
            (project.to_string(), zone.to_string(), name.to_string()),
            instance,
        );
        state.disks.insert(
            (project.to_string(), zone.to_string(), name.to_string()),
            Disk {
                id: format!("d{}", id),
                name: name.to_string(),
                self_link: disk_link,
                size_gb: Some("10".into()),
            },
        );
        VmRef::new(name, project, zone).with_id(id)
    }

    pub fn add_image(&self, project: &str, image: Image) {
        self.state
            .lock()
            .images
            .insert((project.to_string(), image.name.clone()), image);
    }

    pub fn add_network(&self, project: &str, network: Network) {
        self.state
            .lock()
            .networks
            .insert((project.to_string(), network.name.clone()), network);
    }

    pub fn add_bucket(&self, name: &str) {
        self.state.lock().buckets.entry(name.to_string()).or_default();
    }

    pub fn put_object(&self, bucket: &str, key: &str, payload: impl Into<Bytes>) {
        self.state
            .lock()
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), payload.into());
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.state.lock().buckets.get(bucket)?.get(key).cloned()
    }

    pub fn image(&self, project: &str, name: &str) -> Option<Image> {
        self.state
            .lock()
            .images
            .get(&(project.to_string(), name.to_string()))
            .cloned()
    }

    pub fn instance_status(&self, vm: &VmRef) -> Option<InstanceStatus> {
        self.state
            .lock()
            .instances
            .get(&(vm.project.clone(), vm.zone.clone(), vm.name.clone()))
            .map(|i| i.status)
    }

    pub fn calls(&self) -> Calls {
        self.state.lock().calls.clone()
    }
}

impl State {
    fn page<T: Clone>(&mut self, items: Vec<T>, page_token: Option<String>) -> CloudResult<Page<T>> {
        self.calls.list_pages += 1;
        let start = match page_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| CloudError::InvalidArgument(format!("bad page token `{}`", token)))?,
            None => 0,
        };
        let size = self.page_size.unwrap_or(usize::MAX);
        let end = start.saturating_add(size).min(items.len());
        let next_page_token = (end < items.len()).then(|| end.to_string());
        Ok(Page {
            items: items.get(start..end).map(<[T]>::to_vec).unwrap_or_default(),
            next_page_token,
        })
    }

    fn instance_key(&self, vm: &VmRef) -> Option<(String, String, String)> {
        self.instances
            .iter()
            .find(|((project, zone, name), instance)| {
                project == &vm.project
                    && zone == &vm.zone
                    && (name == vm.lookup_key() || instance.id == vm.lookup_key())
            })
            .map(|(key, _)| key.clone())
    }
}

#[async_trait]
impl CloudApi for MemoryCloud {
    async fn authenticate(&self, service: Service) -> CloudResult<()> {
        let mut state = self.state.lock();
        state.calls.auth += 1;
        if state.fail_auth {
            return Err(CloudError::Auth(format!("{} credentials rejected", service)));
        }
        Ok(())
    }

    async fn get_instance(&self, vm: &VmRef) -> CloudResult<Instance> {
        let mut state = self.state.lock();
        let key = state
            .instance_key(vm)
            .ok_or_else(|| CloudError::not_found(ResourceKind::Instance, vm.to_string()))?;
        let name = key.2.clone();
        let settled = match state.stopping_reads.get_mut(&name) {
            Some(0) => true,
            Some(reads) => {
                *reads -= 1;
                false
            }
            None => false,
        };
        if settled {
            state.stopping_reads.remove(&name);
        }
        let restarted = match state.restart.as_mut() {
            Some((0, status)) => Some(*status),
            Some((reads, _)) => {
                *reads -= 1;
                None
            }
            None => None,
        };
        if restarted.is_some() {
            state.restart = None;
        }
        let instance = state
            .instances
            .get_mut(&key)
            .ok_or_else(|| CloudError::not_found(ResourceKind::Instance, vm.to_string()))?;
        if settled && instance.status == InstanceStatus::Stopping {
            instance.status = InstanceStatus::Terminated;
        }
        if let Some(status) = restarted {
            instance.status = status;
        }
        Ok(instance.clone())
    }

    async fn list_instances(
        &self,
        project: &str,
        page_token: Option<String>,
    ) -> CloudResult<Page<Instance>> {
        let mut state = self.state.lock();
        let items: Vec<Instance> = state
            .instances
            .iter()
            .filter(|((p, _, _), _)| p == project)
            .map(|(_, i)| i.clone())
            .collect();
        state.page(items, page_token)
    }

    async fn start_instance(&self, vm: &VmRef) -> CloudResult<()> {
        let mut state = self.state.lock();
        state.calls.start_requests += 1;
        let key = state
            .instance_key(vm)
            .ok_or_else(|| CloudError::not_found(ResourceKind::Instance, vm.to_string()))?;
        state.stopping_reads.remove(&key.2);
        if let Some(instance) = state.instances.get_mut(&key) {
            instance.status = InstanceStatus::Running;
        }
        Ok(())
    }

    async fn stop_instance(&self, vm: &VmRef) -> CloudResult<()> {
        let mut state = self.state.lock();
        state.calls.stop_requests += 1;
        let key = state
            .instance_key(vm)
            .ok_or_else(|| CloudError::not_found(ResourceKind::Instance, vm.to_string()))?;
        let delay = state.stop_delay;
        if delay > 0 {
            state.stopping_reads.insert(key.2.clone(), delay);
        }
        if let Some(instance) = state.instances.get_mut(&key) {
            instance.status = if delay > 0 {
                InstanceStatus::Stopping
            } else {
                InstanceStatus::Terminated
            };
        }
        Ok(())
    }

    async fn get_disk(&self, project: &str, zone: &str, name: &str) -> CloudResult<Disk> {
        self.state
            .lock()
            .disks
            .get(&(project.to_string(), zone.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| CloudError::not_found(ResourceKind::Disk, name))
    }

    async fn get_image(&self, project: &str, name: &str) -> CloudResult<Image> {
        let mut state = self.state.lock();
        let outcome = state.image_outcome.unwrap_or(ImageStatus::Ready);
        let settled = match state.image_polls.get_mut(name) {
            Some(0) => true,
            Some(polls) => {
                *polls -= 1;
                false
            }
            None => false,
        };
        if settled {
            state.image_polls.remove(name);
        }
        let image = state
            .images
            .get_mut(&(project.to_string(), name.to_string()))
            .ok_or_else(|| CloudError::not_found(ResourceKind::Image, name))?;
        if settled && image.status == ImageStatus::Pending {
            image.status = outcome;
        }
        Ok(image.clone())
    }

    async fn list_images(
        &self,
        project: &str,
        page_token: Option<String>,
    ) -> CloudResult<Page<Image>> {
        let mut state = self.state.lock();
        let items: Vec<Image> = state
            .images
            .iter()
            .filter(|((p, _), _)| p == project)
            .map(|(_, i)| i.clone())
            .collect();
        state.page(items, page_token)
    }

    async fn insert_image(&self, project: &str, image: &ImageInsert) -> CloudResult<()> {
        let mut state = self.state.lock();
        state.calls.image_inserts += 1;
        let key = (project.to_string(), image.name.clone());
        if state.images.contains_key(&key) {
            return Err(CloudError::Transport(format!(
                "image `{}` already exists",
                image.name
            )));
        }
        state.next_id += 1;
        let id = state.next_id.to_string();
        let polls = state.image_ready_after;
        state.image_polls.insert(image.name.clone(), polls);
        state.images.insert(
            key,
            Image {
                id,
                name: image.name.clone(),
                status: ImageStatus::Pending,
                source_disk: Some(image.source_disk.clone()),
                storage_locations: image.storage_locations.clone(),
                disk_size_gb: Some("10".into()),
                archive_size_bytes: None,
            },
        );
        Ok(())
    }

    async fn delete_image(&self, project: &str, name: &str) -> CloudResult<()> {
        let mut state = self.state.lock();
        state.calls.image_deletes += 1;
        state.image_polls.remove(name);
        state
            .images
            .remove(&(project.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| CloudError::not_found(ResourceKind::Image, name))
    }

    async fn get_network(&self, project: &str, name: &str) -> CloudResult<Network> {
        self.state
            .lock()
            .networks
            .get(&(project.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| CloudError::not_found(ResourceKind::Network, name))
    }

    async fn list_networks(
        &self,
        project: &str,
        page_token: Option<String>,
    ) -> CloudResult<Page<Network>> {
        let mut state = self.state.lock();
        let items: Vec<Network> = state
            .networks
            .iter()
            .filter(|((p, _), _)| p == project)
            .map(|(_, n)| n.clone())
            .collect();
        state.page(items, page_token)
    }

    async fn create_bucket(&self, _project: &str, name: &str) -> CloudResult<Bucket> {
        let mut state = self.state.lock();
        state.calls.buckets_created += 1;
        if state.buckets.contains_key(name) {
            return Err(CloudError::Transport(format!("bucket `{}` already exists", name)));
        }
        state.buckets.insert(name.to_string(), BTreeMap::new());
        Ok(Bucket {
            name: name.to_string(),
            location: Some("US".into()),
            time_created: Some(Utc::now()),
        })
    }

    async fn get_object(&self, bucket: &str, key: &str) -> CloudResult<ObjectMetadata> {
        let state = self.state.lock();
        let payload = state
            .buckets
            .get(bucket)
            .ok_or_else(|| CloudError::not_found(ResourceKind::Bucket, bucket))?
            .get(key)
            .ok_or_else(|| CloudError::not_found(ResourceKind::Object, key))?;
        Ok(ObjectMetadata {
            bucket: bucket.to_string(),
            name: key.to_string(),
            size: payload.len() as u64,
            md5_hash: Some(general_purpose::STANDARD.encode(md5::compute(payload).0)),
            content_type: Some("application/octet-stream".into()),
        })
    }

    async fn read_object(&self, bucket: &str, key: &str) -> CloudResult<ObjectStream> {
        let payload = self
            .object(bucket, key)
            .ok_or_else(|| CloudError::not_found(ResourceKind::Object, format!("{}/{}", bucket, key)))?;
        Ok(Box::new(Cursor::new(payload)))
    }

    async fn run_export(&self, job: &ExportJob) -> CloudResult<()> {
        let mut state = self.state.lock();
        state.calls.exports.push(job.clone());
        if let Some(message) = state.fail_export.clone() {
            return Err(CloudError::Transport(message));
        }
        let status = state
            .images
            .get(&(job.project.clone(), job.image.clone()))
            .map(|i| i.status)
            .ok_or_else(|| CloudError::not_found(ResourceKind::Image, job.image.clone()))?;
        if status != ImageStatus::Ready {
            return Err(CloudError::UnexpectedState {
                what: format!("image `{}`", job.image),
                expected: ImageStatus::Ready.to_string(),
                actual: status.to_string(),
            });
        }
        let (bucket, key) = parse_object_uri(&job.destination_uri).ok_or_else(|| {
            CloudError::InvalidArgument(format!("bad destination `{}`", job.destination_uri))
        })?;
        let payload = state.export_payload.clone();
        state
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| CloudError::not_found(ResourceKind::Bucket, bucket))?
            .insert(key.to_string(), payload);
        Ok(())
    }
}
