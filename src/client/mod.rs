//! Cloud Resource Client.
//!
//! [`CloudClient`] wraps a [`CloudApi`] backend and adds what every caller
//! needs on top of the raw calls:
//! - lazy, cached authentication per service handle
//! - static dispatch over resource kinds through [`Remote`]
//! - fully drained pagination
//! - boot-disk image creation, bucket selection and image export
//!
//! The client is cheap to clone; clones share sessions and the bucket cache.

pub mod api;
pub mod auth;
pub mod memory;
pub mod rest;

use crate::{
    errors::{CloudError, CloudResult, ResourceKind},
    models::{
        bucket::default_bucket_name,
        image::{Image, ImageFormat, ImageInsert, image_name_for},
        network::Network,
        object::{ObjectMetadata, object_uri},
        vm::{AttachedDisk, Instance, InstanceStatus, VmRef},
    },
};
use api::{CloudApi, ExportJob, ObjectStream, Page, Service};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Project and zone a resource lookup runs in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scope {
    pub project: String,
    pub zone: Option<String>,
}

impl Scope {
    pub fn project(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            zone: None,
        }
    }

    pub fn zonal(project: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            zone: Some(zone.into()),
        }
    }

    fn require_zone(&self, kind: ResourceKind) -> CloudResult<&str> {
        self.zone
            .as_deref()
            .filter(|z| !z.is_empty())
            .ok_or_else(|| CloudError::InvalidArgument(format!("{} lookup needs a zone", kind)))
    }
}

/// Client-side filter applied after pagination is drained.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub name_prefix: Option<String>,
}

impl ListFilter {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            name_prefix: Some(prefix.into()),
        }
    }

    fn matches(&self, name: &str) -> bool {
        self.name_prefix
            .as_deref()
            .is_none_or(|prefix| name.starts_with(prefix))
    }
}

/// A remote resource kind reachable through [`CloudClient::get`],
/// [`CloudClient::list`] and [`CloudClient::delete`].
#[async_trait]
pub trait Remote: Sized + Send + 'static {
    const KIND: ResourceKind;
    const SERVICE: Service;

    async fn fetch(api: &dyn CloudApi, scope: &Scope, id: &str) -> CloudResult<Self>;

    async fn list_page(
        api: &dyn CloudApi,
        scope: &Scope,
        page_token: Option<String>,
    ) -> CloudResult<Page<Self>>;

    /// Kinds the pipeline never deletes keep this default.
    async fn remove(_api: &dyn CloudApi, _scope: &Scope, id: &str) -> CloudResult<()> {
        Err(CloudError::UnsupportedType(format!(
            "delete of {} `{}`",
            Self::KIND,
            id
        )))
    }

    fn name(&self) -> &str;
}

#[async_trait]
impl Remote for Instance {
    const KIND: ResourceKind = ResourceKind::Instance;
    const SERVICE: Service = Service::Compute;

    async fn fetch(api: &dyn CloudApi, scope: &Scope, id: &str) -> CloudResult<Self> {
        let zone = scope.require_zone(Self::KIND)?;
        api.get_instance(&VmRef::new(id, scope.project.clone(), zone))
            .await
    }

    async fn list_page(
        api: &dyn CloudApi,
        scope: &Scope,
        page_token: Option<String>,
    ) -> CloudResult<Page<Self>> {
        api.list_instances(&scope.project, page_token).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Remote for Image {
    const KIND: ResourceKind = ResourceKind::Image;
    const SERVICE: Service = Service::Images;

    async fn fetch(api: &dyn CloudApi, scope: &Scope, id: &str) -> CloudResult<Self> {
        api.get_image(&scope.project, id).await
    }

    async fn list_page(
        api: &dyn CloudApi,
        scope: &Scope,
        page_token: Option<String>,
    ) -> CloudResult<Page<Self>> {
        api.list_images(&scope.project, page_token).await
    }

    async fn remove(api: &dyn CloudApi, scope: &Scope, id: &str) -> CloudResult<()> {
        api.delete_image(&scope.project, id).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Remote for Network {
    const KIND: ResourceKind = ResourceKind::Network;
    const SERVICE: Service = Service::Networks;

    async fn fetch(api: &dyn CloudApi, scope: &Scope, id: &str) -> CloudResult<Self> {
        api.get_network(&scope.project, id).await
    }

    async fn list_page(
        api: &dyn CloudApi,
        scope: &Scope,
        page_token: Option<String>,
    ) -> CloudResult<Page<Self>> {
        api.list_networks(&scope.project, page_token).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

struct ClientInner {
    api: Arc<dyn CloudApi>,
    project: String,
    sessions: [OnceCell<()>; Service::ALL.len()],
    configured_bucket: Option<String>,
    created_bucket: OnceCell<String>,
}

#[derive(Clone)]
pub struct CloudClient {
    inner: Arc<ClientInner>,
}

impl CloudClient {
    /// `project` is the default scope for lookups and bucket creation.
    /// `bucket` is the export bucket; when `None`, one is created on first
    /// export and reused afterwards.
    pub fn new(api: Arc<dyn CloudApi>, project: impl Into<String>, bucket: Option<String>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                api,
                project: project.into(),
                sessions: Default::default(),
                configured_bucket: bucket.filter(|b| !b.is_empty()),
                created_bucket: OnceCell::new(),
            }),
        }
    }

    pub fn project(&self) -> &str {
        &self.inner.project
    }

    /// Authenticate a service handle once. Success is cached for the life of
    /// the client; a failure aborts the caller and is retried next time.
    async fn session(&self, service: Service) -> CloudResult<&dyn CloudApi> {
        let api = self.inner.api.as_ref();
        self.inner.sessions[service.index()]
            .get_or_try_init(|| async {
                debug!(%service, "authenticating service handle");
                api.authenticate(service).await.map_err(|err| match err {
                    CloudError::Auth(_) => err,
                    other => CloudError::Auth(format!("{}: {}", service, other)),
                })
            })
            .await?;
        Ok(api)
    }

    /// Fetch one resource by name or id in the default project. Zonal kinds
    /// need [`get_in`](Self::get_in).
    pub async fn get<R: Remote>(&self, id: &str) -> CloudResult<R> {
        self.get_in(&Scope::project(self.project()), id).await
    }

    pub async fn get_in<R: Remote>(&self, scope: &Scope, id: &str) -> CloudResult<R> {
        let api = self.session(R::SERVICE).await?;
        R::fetch(api, scope, id).await
    }

    /// List every resource of a kind in the default project.
    pub async fn list<R: Remote>(&self, filter: &ListFilter) -> CloudResult<Vec<R>> {
        let scope = Scope::project(self.project());
        let api = self.session(R::SERVICE).await?;
        let mut items = Vec::new();
        let mut page_token = None;
        loop {
            let page = R::list_page(api, &scope, page_token).await?;
            items.extend(page.items.into_iter().filter(|r| filter.matches(r.name())));
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        debug!(kind = %R::KIND, count = items.len(), "listed resources");
        Ok(items)
    }

    pub async fn delete<R: Remote>(&self, id: &str) -> CloudResult<()> {
        let api = self.session(R::SERVICE).await?;
        R::remove(api, &Scope::project(self.project()), id).await
    }

    /// Resolve a VM reference to the live instance.
    pub async fn get_vm(&self, vm: &VmRef) -> CloudResult<Instance> {
        vm.validate()?;
        let api = self.session(Service::Compute).await?;
        api.get_instance(vm).await
    }

    pub async fn power_state(&self, vm: &VmRef) -> CloudResult<InstanceStatus> {
        Ok(self.get_vm(vm).await?.status)
    }

    pub async fn powered_off(&self, vm: &VmRef) -> CloudResult<bool> {
        Ok(self.power_state(vm).await?.is_powered_off())
    }

    pub async fn power_on(&self, vm: &VmRef) -> CloudResult<()> {
        vm.validate()?;
        let api = self.session(Service::Compute).await?;
        info!(vm = %vm, "starting instance");
        api.start_instance(vm).await
    }

    pub async fn power_off(&self, vm: &VmRef) -> CloudResult<()> {
        vm.validate()?;
        let api = self.session(Service::Compute).await?;
        info!(vm = %vm, "stopping instance");
        api.stop_instance(vm).await
    }

    pub async fn boot_disk(&self, vm: &VmRef) -> CloudResult<AttachedDisk> {
        let instance = self.get_vm(vm).await?;
        instance
            .boot_disk()
            .cloned()
            .ok_or_else(|| CloudError::not_found(ResourceKind::Disk, format!("boot disk of {}", vm)))
    }

    /// Create the migration image from the VM's boot disk and wait for the
    /// insert operation. Returns the image name.
    pub async fn create_image_from_disk(&self, vm: &VmRef, force: bool) -> CloudResult<String> {
        let instance = self.get_vm(vm).await?;
        let boot = instance
            .boot_disk()
            .ok_or_else(|| CloudError::not_found(ResourceKind::Disk, format!("boot disk of {}", vm)))?;

        let disks = self.session(Service::Disks).await?;
        let disk = disks.get_disk(&vm.project, &vm.zone, boot.disk_name()).await?;

        let image_name = image_name_for(&instance.name);
        let request = ImageInsert {
            name: image_name.clone(),
            source_disk: disk.self_link,
            storage_locations: Vec::new(),
            force_create: force,
        };
        let images = self.session(Service::Images).await?;
        info!(vm = %vm, image = %image_name, disk = %disk.name, "creating image from boot disk");
        images.insert_image(&vm.project, &request).await?;
        Ok(image_name)
    }

    /// Look up an image; `NotFound` becomes `None`.
    pub async fn find_image(&self, project: &str, name: &str) -> CloudResult<Option<Image>> {
        match self.get_in::<Image>(&Scope::project(project), name).await {
            Ok(image) => Ok(Some(image)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn delete_image(&self, project: &str, name: &str) -> CloudResult<()> {
        let api = self.session(Service::Images).await?;
        Image::remove(api, &Scope::project(project), name).await
    }

    /// Bucket exports go to: the configured one, or one created on first use
    /// and cached for every later export through this client.
    pub async fn ensure_bucket(&self) -> CloudResult<String> {
        if let Some(bucket) = &self.inner.configured_bucket {
            return Ok(bucket.clone());
        }
        let name = self
            .inner
            .created_bucket
            .get_or_try_init(|| async {
                let api = self.session(Service::Storage).await?;
                let name = default_bucket_name(Utc::now());
                api.create_bucket(self.project(), &name).await?;
                info!(bucket = %name, "created export bucket");
                Ok::<_, CloudError>(name)
            })
            .await?;
        Ok(name.clone())
    }

    pub async fn object_metadata(&self, bucket: &str, key: &str) -> CloudResult<ObjectMetadata> {
        let api = self.session(Service::Storage).await?;
        api.get_object(bucket, key).await
    }

    /// `NotFound` is a negative answer, not an error.
    pub async fn object_exists(&self, bucket: &str, key: &str) -> CloudResult<bool> {
        match self.object_metadata(bucket, key).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub async fn download_object(&self, bucket: &str, key: &str) -> CloudResult<ObjectStream> {
        let api = self.session(Service::Storage).await?;
        api.read_object(bucket, key).await
    }

    /// Submit the conversion job for `image` and wait for it to finish.
    pub async fn export_image(
        &self,
        project: &str,
        image: &str,
        format: ImageFormat,
        bucket: &str,
        key: &str,
    ) -> CloudResult<()> {
        let api = self.session(Service::Build).await?;
        let job = ExportJob {
            project: project.to_string(),
            image: image.to_string(),
            format,
            destination_uri: object_uri(bucket, key),
        };
        info!(image = %image, destination = %job.destination_uri, "submitting export job");
        api.run_export(&job).await
    }
}
