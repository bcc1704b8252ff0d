//! Compute API data model and client seam.
//!
//! The REST client is deliberately thin: every call is one authenticated
//! round trip returning a typed payload. The [`ComputeService`] trait is
//! the seam the lifecycle code is written against, so tests drive the
//! orchestration with scripted fakes instead of a transport override.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::auth::{ServiceAccountKey, TokenSource};
use super::error::{ConfigError, GceError};

const DEFAULT_BASE_URL: &str = "https://www.googleapis.com/compute/v1";

/// Operation status reported once a zone operation has terminated.
pub const OPERATION_DONE: &str = "DONE";

/// A zone, as returned by `zones.get`.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Zone {
    pub name: String,
    pub self_link: String,
}

/// A machine type, as returned by `machineTypes.get`.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MachineType {
    pub name: String,
    pub self_link: String,
}

/// A network, as returned by `networks.get`.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Network {
    pub name: String,
    pub self_link: String,
}

/// A boot image, as returned by `images.list`.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Image {
    pub name: String,
    pub self_link: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(super) struct ImageList {
    pub items: Vec<Image>,
}

/// One entry in a terminal operation error payload.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OperationErrorItem {
    pub code: String,
    pub location: String,
    pub message: String,
}

/// Error payload attached to a failed zone operation.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OperationError {
    pub errors: Vec<OperationErrorItem>,
}

/// An asynchronous zone operation.
///
/// Operations progress `PENDING → RUNNING → DONE`; a populated `error`
/// field is terminal regardless of `status`.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Operation {
    pub name: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationError>,
}

/// Boot disk initialization parameters.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InitializeParams {
    pub source_image: String,
    pub disk_type: String,
    pub disk_size_gb: i64,
}

/// A disk attached to an instance.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AttachedDisk {
    #[serde(rename = "type")]
    pub disk_type: String,
    pub mode: String,
    pub boot: bool,
    pub auto_delete: bool,
    pub initialize_params: InitializeParams,
}

/// Instance scheduling options.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Scheduling {
    pub preemptible: bool,
}

/// One instance metadata entry.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MetadataItem {
    pub key: String,
    pub value: String,
}

/// Instance metadata key/value store.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Metadata {
    pub items: Vec<MetadataItem>,
}

/// External access configuration for a network interface.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AccessConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub config_type: String,
    #[serde(rename = "natIP")]
    pub nat_ip: String,
}

/// A network interface attached to an instance.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NetworkInterface {
    pub network: String,
    pub access_configs: Vec<AccessConfig>,
}

/// Service account bound to an instance.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServiceAccount {
    pub email: String,
    pub scopes: Vec<String>,
}

/// Network tags applied to an instance.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Tags {
    pub items: Vec<String>,
}

/// A compute instance, both as inserted and as read back.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Instance {
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub self_link: String,
    pub machine_type: String,
    pub disks: Vec<AttachedDisk>,
    pub scheduling: Scheduling,
    pub metadata: Metadata,
    pub network_interfaces: Vec<NetworkInterface>,
    pub service_accounts: Vec<ServiceAccount>,
    pub tags: Tags,
}

impl Instance {
    /// First non-empty NAT address across all interfaces, if any.
    #[must_use]
    pub fn nat_ip(&self) -> Option<&str> {
        self.network_interfaces
            .iter()
            .flat_map(|interface| interface.access_configs.iter())
            .map(|config| config.nat_ip.as_str())
            .find(|ip| !ip.is_empty())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InstanceReference<'a> {
    instance: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AddInstancesRequest<'a> {
    instances: Vec<InstanceReference<'a>>,
}

/// Zonal compute control plane, as consumed by the GCE backend.
#[async_trait]
pub trait ComputeService: Send + Sync {
    /// Fetches a zone by name.
    async fn get_zone(&self, zone: &str) -> Result<Zone, GceError>;

    /// Fetches a machine type by zone and name.
    async fn get_machine_type(&self, zone: &str, name: &str) -> Result<MachineType, GceError>;

    /// Fetches a global network by name.
    async fn get_network(&self, name: &str) -> Result<Network, GceError>;

    /// Lists project images matching a server-side `filter` expression.
    async fn list_images(&self, filter: &str) -> Result<Vec<Image>, GceError>;

    /// Inserts an instance, returning the pending zone operation.
    async fn insert_instance(&self, zone: &str, spec: &Instance) -> Result<Operation, GceError>;

    /// Fetches the current state of an instance.
    async fn get_instance(&self, zone: &str, name: &str) -> Result<Instance, GceError>;

    /// Deletes an instance, returning the pending zone operation.
    async fn delete_instance(&self, zone: &str, name: &str) -> Result<Operation, GceError>;

    /// Adds an instance (by self link) to an instance group.
    async fn add_to_instance_group(
        &self,
        zone: &str,
        group: &str,
        instance_link: &str,
    ) -> Result<Operation, GceError>;

    /// Fetches a zone operation by name.
    async fn get_zone_operation(&self, zone: &str, name: &str) -> Result<Operation, GceError>;
}

/// REST implementation of [`ComputeService`] over the public compute API.
#[derive(Debug)]
pub struct RestComputeService {
    http: reqwest::Client,
    token: TokenSource,
    project: String,
    base_url: String,
}

impl RestComputeService {
    /// Builds a client authenticating as `account` against `project`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::AccountJson`] when the account's private key
    /// cannot be used for request signing.
    pub fn new(account: ServiceAccountKey, project: impl Into<String>) -> Result<Self, ConfigError> {
        let http = reqwest::Client::new();
        let token = TokenSource::new(&account, http.clone())?;
        Ok(Self {
            http,
            token,
            project: project.into(),
            base_url: String::from(DEFAULT_BASE_URL),
        })
    }

    /// Overrides the API base URL. Intended for tests against a local stub.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn project_url(&self, suffix: &str) -> String {
        format!("{}/projects/{}/{suffix}", self.base_url, self.project)
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, GceError> {
        let bearer = self.token.bearer().await?;
        let response = request
            .bearer_auth(bearer)
            .send()
            .await
            .map_err(|err| GceError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(GceError::Api {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|err| GceError::Transport(err.to_string()))
    }
}

#[async_trait]
impl ComputeService for RestComputeService {
    async fn get_zone(&self, zone: &str) -> Result<Zone, GceError> {
        let url = self.project_url(&format!("zones/{zone}"));
        self.execute(self.http.get(url)).await
    }

    async fn get_machine_type(&self, zone: &str, name: &str) -> Result<MachineType, GceError> {
        let url = self.project_url(&format!("zones/{zone}/machineTypes/{name}"));
        self.execute(self.http.get(url)).await
    }

    async fn get_network(&self, name: &str) -> Result<Network, GceError> {
        let url = self.project_url(&format!("global/networks/{name}"));
        self.execute(self.http.get(url)).await
    }

    async fn list_images(&self, filter: &str) -> Result<Vec<Image>, GceError> {
        let url = self.project_url("global/images");
        let list: ImageList = self
            .execute(self.http.get(url).query(&[("filter", filter)]))
            .await?;
        Ok(list.items)
    }

    async fn insert_instance(&self, zone: &str, spec: &Instance) -> Result<Operation, GceError> {
        let url = self.project_url(&format!("zones/{zone}/instances"));
        self.execute(self.http.post(url).json(spec)).await
    }

    async fn get_instance(&self, zone: &str, name: &str) -> Result<Instance, GceError> {
        let url = self.project_url(&format!("zones/{zone}/instances/{name}"));
        self.execute(self.http.get(url)).await
    }

    async fn delete_instance(&self, zone: &str, name: &str) -> Result<Operation, GceError> {
        let url = self.project_url(&format!("zones/{zone}/instances/{name}"));
        self.execute(self.http.delete(url)).await
    }

    async fn add_to_instance_group(
        &self,
        zone: &str,
        group: &str,
        instance_link: &str,
    ) -> Result<Operation, GceError> {
        let url = self.project_url(&format!("zones/{zone}/instanceGroups/{group}/addInstances"));
        let body = AddInstancesRequest {
            instances: vec![InstanceReference {
                instance: instance_link,
            }],
        };
        self.execute(self.http.post(url).json(&body)).await
    }

    async fn get_zone_operation(&self, zone: &str, name: &str) -> Result<Operation, GceError> {
        let url = self.project_url(&format!("zones/{zone}/operations/{name}"));
        self.execute(self.http.get(url)).await
    }
}
