//! REST backend for the compute, storage and build services.
//!
//! Long-running operations are waited on here, so every [`CloudApi`] call
//! returns only once the remote side has finished (or failed).

use super::{
    api::{CloudApi, EXPORT_BUILDER_IMAGE, ExportJob, ObjectStream, Page, Service},
    auth::{Credentials, TokenSource},
};
use crate::{
    errors::{CloudError, CloudResult, ResourceKind},
    models::{
        bucket::Bucket,
        image::{Image, ImageInsert},
        network::Network,
        object::ObjectMetadata,
        vm::{Disk, Instance, VmRef},
    },
    poll::PollPolicy,
};
use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::json;
use std::{collections::BTreeMap, io, time::Duration};
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

/// Service base URLs. Overridable so a local stand-in can be used.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub compute: String,
    pub storage: String,
    pub build: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            compute: "https://compute.googleapis.com/compute/v1/".into(),
            storage: "https://storage.googleapis.com/storage/v1/".into(),
            build: "https://cloudbuild.googleapis.com/v1/".into(),
        }
    }
}

pub struct RestApi {
    http: Client,
    tokens: TokenSource,
    endpoints: Endpoints,
    poll: PollPolicy,
}

impl RestApi {
    pub fn new(credentials: Credentials, poll: PollPolicy) -> CloudResult<Self> {
        // No overall request timeout: object downloads run for as long as
        // the image takes to stream.
        let http = Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            tokens: TokenSource::new(http.clone(), credentials),
            http,
            endpoints: Endpoints::default(),
            poll,
        })
    }

    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn credentials(&self) -> &Credentials {
        self.tokens.credentials()
    }

    async fn send(
        &self,
        request: RequestBuilder,
        kind: ResourceKind,
        id: &str,
    ) -> CloudResult<Response> {
        let token = self.tokens.token().await?;
        let response = request.bearer_auth(token).send().await?;
        check_status(response, kind, id).await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: Url,
        kind: ResourceKind,
        id: &str,
    ) -> CloudResult<T> {
        debug!(%url, "GET");
        let response = self.send(self.http.get(url), kind, id).await?;
        Ok(response.json().await?)
    }

    /// Wait on a compute operation until it reports `DONE`.
    async fn wait_compute_operation(
        &self,
        op: ComputeOperation,
        wait_url: impl Fn(&str) -> CloudResult<Url>,
    ) -> CloudResult<()> {
        let mut op = op;
        if !op.is_done() {
            let owned_name = op.name.clone();
            let name = owned_name.as_str();
            let wait_url = &wait_url;
            op = self
                .poll
                .until(&format!("operation {}", name), move || async move {
                    let url = wait_url(name)?;
                    let current: ComputeOperation = self
                        .send(self.http.post(url), ResourceKind::Operation, name)
                        .await?
                        .json()
                        .await?;
                    Ok::<_, CloudError>(current.is_done().then_some(current))
                })
                .await?;
        }
        op.into_result()
    }

    fn zone_operation_url(&self, project: &str, zone: &str, name: &str) -> CloudResult<Url> {
        endpoint(
            &self.endpoints.compute,
            &["projects", project, "zones", zone, "operations", name, "wait"],
        )
    }

    fn global_operation_url(&self, project: &str, name: &str) -> CloudResult<Url> {
        endpoint(
            &self.endpoints.compute,
            &["projects", project, "global", "operations", name, "wait"],
        )
    }

    async fn instance_action(&self, vm: &VmRef, action: &str) -> CloudResult<()> {
        let url = endpoint(
            &self.endpoints.compute,
            &[
                "projects",
                &vm.project,
                "zones",
                &vm.zone,
                "instances",
                vm.lookup_key(),
                action,
            ],
        )?;
        let op: ComputeOperation = self
            .send(self.http.post(url), ResourceKind::Instance, vm.lookup_key())
            .await?
            .json()
            .await?;
        self.wait_compute_operation(op, |name| {
            self.zone_operation_url(&vm.project, &vm.zone, name)
        })
        .await
    }

    async fn list_page<T: DeserializeOwned>(
        &self,
        mut url: Url,
        kind: ResourceKind,
        page_token: Option<String>,
    ) -> CloudResult<Page<T>> {
        if let Some(token) = page_token {
            url.query_pairs_mut().append_pair("pageToken", &token);
        }
        let list: ListResponse<T> = self.get_json(url, kind, "list").await?;
        Ok(Page {
            items: list.items,
            next_page_token: list.next_page_token,
        })
    }
}

#[async_trait]
impl CloudApi for RestApi {
    async fn authenticate(&self, service: Service) -> CloudResult<()> {
        debug!(%service, "checking credentials");
        self.tokens.token().await.map(|_| ())
    }

    async fn get_instance(&self, vm: &VmRef) -> CloudResult<Instance> {
        let url = endpoint(
            &self.endpoints.compute,
            &[
                "projects",
                &vm.project,
                "zones",
                &vm.zone,
                "instances",
                vm.lookup_key(),
            ],
        )?;
        self.get_json(url, ResourceKind::Instance, vm.lookup_key())
            .await
    }

    async fn list_instances(
        &self,
        project: &str,
        page_token: Option<String>,
    ) -> CloudResult<Page<Instance>> {
        let mut url = endpoint(
            &self.endpoints.compute,
            &["projects", project, "aggregated", "instances"],
        )?;
        url.query_pairs_mut().append_pair("maxResults", "500");
        if let Some(token) = page_token {
            url.query_pairs_mut().append_pair("pageToken", &token);
        }
        let list: AggregatedInstances = self
            .get_json(url, ResourceKind::Instance, "aggregated")
            .await?;
        Ok(Page {
            items: list
                .items
                .into_values()
                .flat_map(|scoped| scoped.instances)
                .collect(),
            next_page_token: list.next_page_token,
        })
    }

    async fn start_instance(&self, vm: &VmRef) -> CloudResult<()> {
        self.instance_action(vm, "start").await
    }

    async fn stop_instance(&self, vm: &VmRef) -> CloudResult<()> {
        self.instance_action(vm, "stop").await
    }

    async fn get_disk(&self, project: &str, zone: &str, name: &str) -> CloudResult<Disk> {
        let url = endpoint(
            &self.endpoints.compute,
            &["projects", project, "zones", zone, "disks", name],
        )?;
        self.get_json(url, ResourceKind::Disk, name).await
    }

    async fn get_image(&self, project: &str, name: &str) -> CloudResult<Image> {
        let url = endpoint(
            &self.endpoints.compute,
            &["projects", project, "global", "images", name],
        )?;
        self.get_json(url, ResourceKind::Image, name).await
    }

    async fn list_images(
        &self,
        project: &str,
        page_token: Option<String>,
    ) -> CloudResult<Page<Image>> {
        let url = endpoint(
            &self.endpoints.compute,
            &["projects", project, "global", "images"],
        )?;
        self.list_page(url, ResourceKind::Image, page_token).await
    }

    async fn insert_image(&self, project: &str, image: &ImageInsert) -> CloudResult<()> {
        let mut url = endpoint(
            &self.endpoints.compute,
            &["projects", project, "global", "images"],
        )?;
        if image.force_create {
            url.query_pairs_mut().append_pair("forceCreate", "true");
        }
        let op: ComputeOperation = self
            .send(self.http.post(url).json(image), ResourceKind::Image, &image.name)
            .await?
            .json()
            .await?;
        self.wait_compute_operation(op, |name| self.global_operation_url(project, name))
            .await
    }

    async fn delete_image(&self, project: &str, name: &str) -> CloudResult<()> {
        let url = endpoint(
            &self.endpoints.compute,
            &["projects", project, "global", "images", name],
        )?;
        let op: ComputeOperation = self
            .send(self.http.delete(url), ResourceKind::Image, name)
            .await?
            .json()
            .await?;
        self.wait_compute_operation(op, |op_name| {
            self.global_operation_url(project, op_name)
        })
        .await
    }

    async fn get_network(&self, project: &str, name: &str) -> CloudResult<Network> {
        let url = endpoint(
            &self.endpoints.compute,
            &["projects", project, "global", "networks", name],
        )?;
        self.get_json(url, ResourceKind::Network, name).await
    }

    async fn list_networks(
        &self,
        project: &str,
        page_token: Option<String>,
    ) -> CloudResult<Page<Network>> {
        let url = endpoint(
            &self.endpoints.compute,
            &["projects", project, "global", "networks"],
        )?;
        self.list_page(url, ResourceKind::Network, page_token).await
    }

    async fn create_bucket(&self, project: &str, name: &str) -> CloudResult<Bucket> {
        let mut url = endpoint(&self.endpoints.storage, &["b"])?;
        url.query_pairs_mut().append_pair("project", project);
        let response = self
            .send(
                self.http.post(url).json(&json!({ "name": name })),
                ResourceKind::Bucket,
                name,
            )
            .await?;
        Ok(response.json().await?)
    }

    async fn get_object(&self, bucket: &str, key: &str) -> CloudResult<ObjectMetadata> {
        let url = endpoint(&self.endpoints.storage, &["b", bucket, "o", key])?;
        self.get_json(url, ResourceKind::Object, key).await
    }

    async fn read_object(&self, bucket: &str, key: &str) -> CloudResult<ObjectStream> {
        let mut url = endpoint(&self.endpoints.storage, &["b", bucket, "o", key])?;
        url.query_pairs_mut().append_pair("alt", "media");
        let response = self
            .send(self.http.get(url), ResourceKind::Object, key)
            .await?;
        let stream = Box::pin(response.bytes_stream().map_err(io::Error::other));
        Ok(Box::new(StreamReader::new(stream)))
    }

    async fn run_export(&self, job: &ExportJob) -> CloudResult<()> {
        let url = endpoint(&self.endpoints.build, &["projects", &job.project, "builds"])?;
        let body = json!({
            "steps": [{
                "name": EXPORT_BUILDER_IMAGE,
                "args": job.builder_args(),
            }],
            "timeout": "7200s",
        });
        let submitted: BuildOperation = self
            .send(self.http.post(url).json(&body), ResourceKind::Operation, &job.image)
            .await?
            .json()
            .await?;
        let name = submitted.name.clone();
        let op_name = name.as_str();
        let op = if submitted.done {
            submitted
        } else {
            self.poll
                .until(&format!("export build {}", name), move || async move {
                    let url = parse_base(&self.endpoints.build)?
                        .join(op_name)
                        .map_err(|err| {
                            CloudError::InvalidArgument(format!("operation `{}`: {}", op_name, err))
                        })?;
                    let current: BuildOperation = self
                        .send(self.http.get(url), ResourceKind::Operation, op_name)
                        .await?
                        .json()
                        .await?;
                    Ok::<_, CloudError>(current.done.then_some(current))
                })
                .await?
        };

        if let Some(err) = op.error {
            return Err(CloudError::Transport(format!(
                "export build {} failed: {}",
                name, err.message
            )));
        }
        let status = op
            .metadata
            .and_then(|m| m.build)
            .map(|b| b.status)
            .unwrap_or_default();
        if status != "SUCCESS" {
            warn!(operation = %name, %status, "export build did not succeed");
            return Err(CloudError::UnexpectedState {
                what: format!("export build {}", name),
                expected: "SUCCESS".into(),
                actual: status,
            });
        }
        Ok(())
    }
}

fn parse_base(base: &str) -> CloudResult<Url> {
    Url::parse(base)
        .map_err(|err| CloudError::InvalidArgument(format!("endpoint `{}`: {}", base, err)))
}

/// Append path segments (percent-encoded) to a base URL.
fn endpoint(base: &str, segments: &[&str]) -> CloudResult<Url> {
    let mut url = parse_base(base)?;
    url.path_segments_mut()
        .map_err(|_| CloudError::InvalidArgument(format!("`{}` cannot be a base url", base)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Map a non-success response to a typed error.
async fn check_status(response: Response, kind: ResourceKind, id: &str) -> CloudResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .map(|b| b.error.message)
        .unwrap_or(body);
    Err(match status {
        StatusCode::NOT_FOUND => CloudError::not_found(kind, id),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            CloudError::Auth(format!("{} `{}`: {}", kind, id, message))
        }
        _ => CloudError::Transport(format!("{} `{}`: {} {}", kind, id, status, message)),
    })
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct ErrorDetail {
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AggregatedInstances {
    #[serde(default)]
    items: BTreeMap<String, ScopedInstances>,
    next_page_token: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ScopedInstances {
    instances: Vec<Instance>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
struct ComputeOperation {
    name: String,
    status: String,
    error: Option<OperationErrors>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct OperationErrors {
    errors: Vec<OperationErrorItem>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct OperationErrorItem {
    code: String,
    message: String,
}

impl ComputeOperation {
    fn is_done(&self) -> bool {
        self.status == "DONE"
    }

    fn into_result(self) -> CloudResult<()> {
        match self.error {
            Some(errors) if !errors.errors.is_empty() => {
                let detail = errors
                    .errors
                    .iter()
                    .map(|e| format!("{}: {}", e.code, e.message))
                    .collect::<Vec<_>>()
                    .join("; ");
                Err(CloudError::Transport(format!(
                    "operation {} failed: {}",
                    self.name, detail
                )))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct BuildOperation {
    name: String,
    done: bool,
    error: Option<ErrorDetail>,
    metadata: Option<BuildMetadata>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct BuildMetadata {
    build: Option<BuildStatus>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct BuildStatus {
    status: String,
}
