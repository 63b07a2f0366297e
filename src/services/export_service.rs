//! src/services/export_service.rs
//!
//! Source-side export of a VM's boot disk into bucket storage.
//!
//! One [`ExportRun`] per VM walks
//! `Init → VmLocated → PoweredOff → ImageCreated → ImageReady → Exported → Ready`
//! and lands in `Failed` on the first error. Every step is safe to repeat:
//! a stopped VM is not stopped again, an image left by an earlier attempt is
//! reused (or replaced when it failed), and an object already in the bucket
//! is not exported twice. Nothing
//! is rolled back on failure; the image stays around for the next attempt
//! until [`ImageExporter::finalize`] removes it.

use crate::{
    client::CloudClient,
    errors::{CloudError, ExportError, ExportStep, ResourceKind},
    models::{
        image::{ImageFormat, ImageStatus, image_name_for},
        vm::{Instance, InstanceStatus, VmRef},
    },
    poll::{PollPolicy, within},
};
use futures::future::join_all;
use serde::Serialize;
use std::{fmt, time::Duration};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportState {
    Init,
    VmLocated,
    PoweredOff,
    ImageCreated,
    ImageReady,
    Exported,
    Ready,
    Failed,
}

impl ExportState {
    /// The only state reachable from `self` other than `Failed`.
    pub fn successor(self) -> Option<ExportState> {
        match self {
            ExportState::Init => Some(ExportState::VmLocated),
            ExportState::VmLocated => Some(ExportState::PoweredOff),
            ExportState::PoweredOff => Some(ExportState::ImageCreated),
            ExportState::ImageCreated => Some(ExportState::ImageReady),
            ExportState::ImageReady => Some(ExportState::Exported),
            ExportState::Exported => Some(ExportState::Ready),
            ExportState::Ready | ExportState::Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ExportState::Ready | ExportState::Failed)
    }
}

impl fmt::Display for ExportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub format: ImageFormat,
    /// Create the image even if the disk is attached to a running instance.
    pub force_create: bool,
    pub power_poll: PollPolicy,
    pub image_poll: PollPolicy,
    /// Upper bound on one export job.
    pub export_timeout: Duration,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            format: ImageFormat::Qcow2,
            force_create: false,
            power_poll: PollPolicy::new(Duration::from_secs(5), Duration::from_secs(10 * 60)),
            image_poll: PollPolicy::new(Duration::from_secs(10), Duration::from_secs(30 * 60)),
            export_timeout: Duration::from_secs(2 * 60 * 60),
        }
    }
}

/// What a finished run produced. The populator needs `bucket` and `object`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportOutcome {
    pub vm: VmRef,
    pub image: String,
    pub bucket: String,
    pub object: String,
    /// `false` when the object was already present and no job was submitted.
    pub exported: bool,
}

#[derive(Clone)]
pub struct ImageExporter {
    client: CloudClient,
    options: ExportOptions,
}

impl ImageExporter {
    pub fn new(client: CloudClient, options: ExportOptions) -> Self {
        Self { client, options }
    }

    pub fn client(&self) -> &CloudClient {
        &self.client
    }

    /// A fresh run for one VM, starting in `Init`.
    pub fn start(&self, vm: VmRef) -> ExportRun {
        ExportRun {
            client: self.client.clone(),
            options: self.options.clone(),
            vm,
            state: ExportState::Init,
            history: vec![ExportState::Init],
        }
    }

    pub async fn export(&self, vm: VmRef) -> Result<ExportOutcome, ExportError> {
        self.start(vm).run().await
    }

    /// Export several VMs concurrently. Each VM gets its own run; one
    /// failure does not stop the others.
    pub async fn export_all(&self, vms: Vec<VmRef>) -> Vec<Result<ExportOutcome, ExportError>> {
        join_all(vms.into_iter().map(|vm| self.export(vm))).await
    }

    /// Delete the migration image of each VM. Missing images are skipped;
    /// other failures are logged and the remaining VMs are still processed.
    /// Returns the number of images deleted.
    pub async fn finalize(&self, vms: &[VmRef]) -> usize {
        let mut deleted = 0;
        for vm in vms {
            let name = match self.resolve_name(vm).await {
                Ok(name) => name,
                Err(err) => {
                    warn!(vm = %vm, error = %err, "failed to find vm");
                    continue;
                }
            };
            let image = image_name_for(&name);
            match self.client.delete_image(&vm.project, &image).await {
                Ok(()) => {
                    info!(vm = %vm, image = %image, "deleted migration image");
                    deleted += 1;
                }
                Err(err) if err.is_not_found() => {
                    debug!(vm = %vm, image = %image, "no migration image to delete");
                }
                Err(err) => warn!(vm = %vm, image = %image, error = %err, "failed to delete image"),
            }
        }
        deleted
    }

    /// Export reads the image, not the live disk, so nothing is detached.
    pub async fn detach_disks(&self, vm: &VmRef) -> Result<(), ExportError> {
        vm.validate()
            .map_err(|err| ExportError::new(vm.to_string(), ExportStep::VmLookup, err))?;
        debug!(vm = %vm, "disks stay attached to the source vm");
        Ok(())
    }

    /// Restart the source VM, e.g. after a cancelled migration.
    pub async fn power_on(&self, vm: &VmRef) -> Result<(), CloudError> {
        if self.client.power_state(vm).await? == InstanceStatus::Running {
            return Ok(());
        }
        self.client.power_on(vm).await
    }

    async fn resolve_name(&self, vm: &VmRef) -> Result<String, CloudError> {
        if !vm.name.is_empty() {
            return Ok(vm.name.clone());
        }
        Ok(self.client.get_vm(vm).await?.name)
    }
}

/// One VM's export, tracking the state it is in and the states it passed.
pub struct ExportRun {
    client: CloudClient,
    options: ExportOptions,
    vm: VmRef,
    state: ExportState,
    history: Vec<ExportState>,
}

impl ExportRun {
    pub fn state(&self) -> ExportState {
        self.state
    }

    pub fn history(&self) -> &[ExportState] {
        &self.history
    }

    pub fn vm(&self) -> &VmRef {
        &self.vm
    }

    /// Drive the run to `Ready` or `Failed`. A finished run cannot be run
    /// again; start a new one to retry.
    pub async fn run(&mut self) -> Result<ExportOutcome, ExportError> {
        if self.state != ExportState::Init {
            return Err(self.error(
                ExportStep::VmLookup,
                CloudError::InvalidArgument(format!("export run already in state {}", self.state)),
            ));
        }
        match self.drive().await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                warn!(vm = %self.vm, step = %err.step, error = %err.source, "export failed");
                self.enter(ExportState::Failed);
                Err(err)
            }
        }
    }

    async fn drive(&mut self) -> Result<ExportOutcome, ExportError> {
        let instance = self.locate_vm().await?;
        self.ensure_powered_off(&instance).await?;
        let image = self.create_image().await?;
        self.wait_image_ready(&image).await?;
        let (bucket, object, exported) = self.export_image(&image).await?;
        self.enter(ExportState::Ready);
        info!(vm = %self.vm, %bucket, %object, exported, "export ready");
        Ok(ExportOutcome {
            vm: self.vm.clone(),
            image,
            bucket,
            object,
            exported,
        })
    }

    async fn locate_vm(&mut self) -> Result<Instance, ExportError> {
        let instance = self
            .client
            .get_vm(&self.vm)
            .await
            .map_err(|err| self.error(ExportStep::VmLookup, err))?;
        // Later steps need both the name and the id.
        self.vm.name = instance.name.clone();
        self.vm.id = instance.id.clone();
        self.enter(ExportState::VmLocated);
        Ok(instance)
    }

    async fn ensure_powered_off(&mut self, instance: &Instance) -> Result<(), ExportError> {
        if instance.status.is_powered_off() {
            debug!(vm = %self.vm, status = %instance.status, "vm already powered off");
            self.enter(ExportState::PoweredOff);
            return Ok(());
        }
        if instance.status != InstanceStatus::Stopping {
            self.client
                .power_off(&self.vm)
                .await
                .map_err(|err| self.error(ExportStep::PowerOff, err))?;
        }
        let client = &self.client;
        let vm = &self.vm;
        self.options
            .power_poll
            .until("vm power off", move || async move {
                Ok::<_, CloudError>(client.powered_off(vm).await?.then_some(()))
            })
            .await
            .map_err(|err| self.error(ExportStep::PowerOff, err))?;
        self.enter(ExportState::PoweredOff);
        Ok(())
    }

    async fn create_image(&mut self) -> Result<String, ExportError> {
        let name = image_name_for(&self.vm.name);
        let existing = self
            .client
            .find_image(&self.vm.project, &name)
            .await
            .map_err(|err| self.error(ExportStep::ImageCreation, err))?;

        match existing.map(|image| image.status) {
            Some(ImageStatus::Deleting) => {
                return Err(self.error(
                    ExportStep::ImageCreation,
                    CloudError::UnexpectedState {
                        what: format!("image `{}`", name),
                        expected: format!("{} or {}", ImageStatus::Pending, ImageStatus::Ready),
                        actual: ImageStatus::Deleting.to_string(),
                    },
                ));
            }
            Some(ImageStatus::Failed) => {
                warn!(vm = %self.vm, image = %name, "replacing failed image from earlier attempt");
                self.client
                    .delete_image(&self.vm.project, &name)
                    .await
                    .map_err(|err| self.error(ExportStep::ImageCreation, err))?;
                self.insert_image(&name).await?;
            }
            Some(status) => {
                info!(vm = %self.vm, image = %name, %status, "reusing image from earlier attempt");
            }
            None => self.insert_image(&name).await?,
        }
        self.enter(ExportState::ImageCreated);
        Ok(name)
    }

    async fn insert_image(&self, name: &str) -> Result<(), ExportError> {
        // The VM may have been restarted since it was stopped.
        let status = self
            .client
            .power_state(&self.vm)
            .await
            .map_err(|err| self.error(ExportStep::ImageCreation, err))?;
        if !status.is_powered_off() {
            return Err(self.error(
                ExportStep::ImageCreation,
                CloudError::UnexpectedState {
                    what: format!("vm `{}`", self.vm.name),
                    expected: InstanceStatus::Terminated.to_string(),
                    actual: status.to_string(),
                },
            ));
        }
        let created = self
            .client
            .create_image_from_disk(&self.vm, self.options.force_create)
            .await
            .map_err(|err| self.error(ExportStep::ImageCreation, err))?;
        debug_assert_eq!(created, name);
        Ok(())
    }

    async fn wait_image_ready(&mut self, image: &str) -> Result<(), ExportError> {
        let client = &self.client;
        let project = &self.vm.project;
        self.options
            .image_poll
            .until(&format!("image {} ready", image), move || async move {
                let current = client
                    .find_image(project, image)
                    .await?
                    .ok_or_else(|| CloudError::not_found(ResourceKind::Image, image))?;
                match current.status {
                    ImageStatus::Ready => Ok(Some(())),
                    ImageStatus::Pending => Ok(None),
                    ImageStatus::Failed => Err(CloudError::ImageCreationFailed {
                        image: image.to_string(),
                    }),
                    ImageStatus::Deleting => Err(CloudError::UnexpectedState {
                        what: format!("image `{}`", image),
                        expected: ImageStatus::Ready.to_string(),
                        actual: current.status.to_string(),
                    }),
                }
            })
            .await
            .map_err(|err| self.error(ExportStep::ImageCreation, err))?;
        self.enter(ExportState::ImageReady);
        Ok(())
    }

    async fn export_image(&mut self, image: &str) -> Result<(String, String, bool), ExportError> {
        let bucket = self
            .client
            .ensure_bucket()
            .await
            .map_err(|err| self.error(ExportStep::ImageExport, err))?;
        let object = self.options.format.object_key(image);

        let present = self
            .client
            .object_exists(&bucket, &object)
            .await
            .map_err(|err| self.error(ExportStep::ImageExport, err))?;
        if present {
            info!(vm = %self.vm, %bucket, %object, "object already exported, skipping export job");
        } else {
            within(
                "image export",
                self.options.export_timeout,
                self.client.export_image(
                    &self.vm.project,
                    image,
                    self.options.format,
                    &bucket,
                    &object,
                ),
            )
            .await
                .map_err(|err| self.error(ExportStep::ImageExport, err))?;
        }
        self.enter(ExportState::Exported);
        Ok((bucket, object, !present))
    }

    fn enter(&mut self, next: ExportState) {
        debug_assert!(
            next == ExportState::Failed || self.state.successor() == Some(next),
            "illegal export transition {} -> {}",
            self.state,
            next
        );
        debug!(vm = %self.vm, from = %self.state, to = %next, "export state");
        self.state = next;
        self.history.push(next);
    }

    fn error(&self, step: ExportStep, source: CloudError) -> ExportError {
        ExportError::new(self.vm.to_string(), step, source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::MemoryCloud;
    use std::sync::Arc;

    const PROJECT: &str = "proj";
    const ZONE: &str = "us-central1-a";

    fn fast_options() -> ExportOptions {
        let poll = PollPolicy::new(Duration::from_millis(1), Duration::from_secs(5));
        ExportOptions {
            power_poll: poll,
            image_poll: poll,
            export_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    fn exporter(cloud: &MemoryCloud, bucket: Option<&str>) -> ImageExporter {
        let client = CloudClient::new(
            Arc::new(cloud.clone()),
            PROJECT,
            bucket.map(str::to_string),
        );
        ImageExporter::new(client, fast_options())
    }

    #[test]
    fn successors_form_a_single_chain() {
        let mut state = ExportState::Init;
        let mut seen = vec![state];
        while let Some(next) = state.successor() {
            seen.push(next);
            state = next;
        }
        assert_eq!(seen.last(), Some(&ExportState::Ready));
        assert_eq!(seen.len(), 7);
        assert!(!seen.contains(&ExportState::Failed));
    }

    #[tokio::test]
    async fn already_stopped_vm_is_not_stopped_again() {
        let cloud = MemoryCloud::new();
        let vm = cloud.add_vm(PROJECT, ZONE, "vm1", InstanceStatus::Terminated);
        cloud.add_bucket("b");
        exporter(&cloud, Some("b")).export(vm).await.unwrap();
        assert_eq!(cloud.calls().stop_requests, 0);
    }

    #[tokio::test]
    async fn stopping_vm_is_awaited_without_new_request() {
        let cloud = MemoryCloud::new().with_stop_delay(3);
        let vm = cloud.add_running_vm(PROJECT, ZONE, "vm1");
        cloud.add_bucket("b");
        let exporter = exporter(&cloud, Some("b"));
        exporter.client().power_off(&vm).await.unwrap();
        assert_eq!(cloud.instance_status(&vm), Some(InstanceStatus::Stopping));

        exporter.export(vm).await.unwrap();
        assert_eq!(cloud.calls().stop_requests, 1);
    }

    #[tokio::test]
    async fn lookup_by_id_fills_in_name() {
        let cloud = MemoryCloud::new();
        let vm = cloud.add_running_vm(PROJECT, ZONE, "vm1");
        cloud.add_bucket("b");
        let by_id = VmRef::new("", PROJECT, ZONE).with_id(vm.id.clone());
        let outcome = exporter(&cloud, Some("b")).export(by_id).await.unwrap();
        assert_eq!(outcome.vm.name, "vm1");
        assert_eq!(outcome.image, "vm1-forklift");
    }

    #[tokio::test]
    async fn missing_vm_fails_lookup() {
        let cloud = MemoryCloud::new();
        let exporter = exporter(&cloud, None);
        let mut run = exporter.start(VmRef::new("ghost", PROJECT, ZONE));
        let err = run.run().await.unwrap_err();
        assert_eq!(err.step, ExportStep::VmLookup);
        assert!(err.source.is_not_found());
        assert_eq!(run.history(), [ExportState::Init, ExportState::Failed]);
    }

    #[tokio::test]
    async fn reference_without_name_or_id_is_invalid() {
        let cloud = MemoryCloud::new();
        let err = exporter(&cloud, None)
            .export(VmRef::new("", PROJECT, ZONE))
            .await
            .unwrap_err();
        assert!(matches!(err.source, CloudError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn deleting_image_is_unexpected() {
        let cloud = MemoryCloud::new();
        let vm = cloud.add_running_vm(PROJECT, ZONE, "vm1");
        cloud.add_image(
            PROJECT,
            crate::models::image::Image {
                name: "vm1-forklift".into(),
                status: ImageStatus::Deleting,
                ..Default::default()
            },
        );
        let err = exporter(&cloud, None).export(vm).await.unwrap_err();
        assert_eq!(err.step, ExportStep::ImageCreation);
        assert!(matches!(err.source, CloudError::UnexpectedState { .. }));
        assert_eq!(cloud.calls().image_inserts, 0);
    }

    #[tokio::test]
    async fn failed_image_is_replaced_on_retry() {
        let cloud = MemoryCloud::new();
        let vm = cloud.add_vm(PROJECT, ZONE, "vm1", InstanceStatus::Terminated);
        cloud.add_bucket("b");
        cloud.add_image(
            PROJECT,
            crate::models::image::Image {
                name: "vm1-forklift".into(),
                status: ImageStatus::Failed,
                ..Default::default()
            },
        );

        let outcome = exporter(&cloud, Some("b")).export(vm).await.unwrap();
        assert!(outcome.exported);
        let calls = cloud.calls();
        assert_eq!(calls.image_deletes, 1);
        assert_eq!(calls.image_inserts, 1);
        assert_eq!(
            cloud.image(PROJECT, "vm1-forklift").map(|i| i.status),
            Some(ImageStatus::Ready)
        );
    }

    #[tokio::test]
    async fn restarted_vm_is_not_imaged() {
        let cloud = MemoryCloud::new().with_restart_after_reads(1, InstanceStatus::Staging);
        let vm = cloud.add_vm(PROJECT, ZONE, "vm1", InstanceStatus::Terminated);
        let err = exporter(&cloud, None).export(vm).await.unwrap_err();
        assert_eq!(err.step, ExportStep::ImageCreation);
        assert!(matches!(
            err.source,
            CloudError::UnexpectedState { ref actual, .. } if actual == "STAGING"
        ));
        assert_eq!(cloud.calls().image_inserts, 0);
    }

    #[tokio::test]
    async fn stuck_image_times_out() {
        let cloud = MemoryCloud::new().with_image_ready_after(u32::MAX);
        let vm = cloud.add_running_vm(PROJECT, ZONE, "vm1");
        let client = CloudClient::new(Arc::new(cloud.clone()), PROJECT, None);
        let options = ExportOptions {
            image_poll: PollPolicy::new(Duration::from_millis(1), Duration::from_millis(20)),
            ..fast_options()
        };
        let err = ImageExporter::new(client, options).export(vm).await.unwrap_err();
        assert_eq!(err.step, ExportStep::ImageCreation);
        assert!(matches!(err.source, CloudError::Timeout { .. }));
        assert!(cloud.calls().exports.is_empty());
    }

    #[tokio::test]
    async fn failed_export_job_is_reported() {
        let cloud = MemoryCloud::new();
        let vm = cloud.add_running_vm(PROJECT, ZONE, "vm1");
        cloud.add_bucket("b");
        cloud.fail_exports("build FAILURE");
        let mut run = exporter(&cloud, Some("b")).start(vm);
        let err = run.run().await.unwrap_err();
        assert_eq!(err.step, ExportStep::ImageExport);
        assert_eq!(run.state(), ExportState::Failed);
        assert!(run.history().contains(&ExportState::ImageReady));
        assert!(!run.history().contains(&ExportState::Exported));
    }

    #[tokio::test]
    async fn finished_run_cannot_be_rerun() {
        let cloud = MemoryCloud::new();
        let vm = cloud.add_running_vm(PROJECT, ZONE, "vm1");
        cloud.add_bucket("b");
        let mut run = exporter(&cloud, Some("b")).start(vm);
        run.run().await.unwrap();
        assert!(run.run().await.is_err());
        assert_eq!(cloud.calls().exports.len(), 1);
    }

    #[tokio::test]
    async fn finalize_deletes_images_and_skips_missing() {
        let cloud = MemoryCloud::new();
        let vm1 = cloud.add_running_vm(PROJECT, ZONE, "vm1");
        let vm2 = cloud.add_running_vm(PROJECT, ZONE, "vm2");
        cloud.add_bucket("b");
        let exporter = exporter(&cloud, Some("b"));
        exporter.export(vm1.clone()).await.unwrap();

        assert_eq!(exporter.finalize(&[vm1, vm2]).await, 1);
        assert!(cloud.image(PROJECT, "vm1-forklift").is_none());
        assert_eq!(cloud.calls().image_deletes, 2);
    }

    #[tokio::test]
    async fn power_on_restarts_stopped_vm_once() {
        let cloud = MemoryCloud::new();
        let vm = cloud.add_vm(PROJECT, ZONE, "vm1", InstanceStatus::Terminated);
        let exporter = exporter(&cloud, None);
        exporter.power_on(&vm).await.unwrap();
        exporter.power_on(&vm).await.unwrap();
        assert_eq!(cloud.calls().start_requests, 1);
        assert_eq!(cloud.instance_status(&vm), Some(InstanceStatus::Running));
    }

    #[tokio::test]
    async fn detach_disks_is_a_no_op() {
        let cloud = MemoryCloud::new();
        let vm = cloud.add_running_vm(PROJECT, ZONE, "vm1");
        exporter(&cloud, None).detach_disks(&vm).await.unwrap();
        assert_eq!(cloud.calls(), Default::default());
    }
}
