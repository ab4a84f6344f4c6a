// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Clients for the services the control plane coordinates with
//!
//! Each collaborator is reached through a trait so that the simulated
//! implementations in [`crate::sim`] can stand in for tests and development.
//! The HTTP clients live in the submodules here.  Every outbound call takes
//! a [`CallContext`] so the originating `x-request-id` propagates.

use crate::db::model::FirewallRule;
use crate::db::model::Nic;
use crate::db::model::NicState;
use crate::db::model::VmState;
use crate::errors::Error;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

pub mod cnapi;
pub mod fwapi;
pub mod imgapi;
pub mod napi;
pub mod papi;
pub mod volapi;
pub mod wfapi;

/// Per-call context propagated on every outbound request
#[derive(Clone, Debug)]
pub struct CallContext {
    pub request_id: String,
}

impl CallContext {
    pub fn new(request_id: &str) -> CallContext {
        CallContext { request_id: request_id.to_string() }
    }
}

/// A network (or pool) record as NAPI reports it
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Network {
    pub uuid: Uuid,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_uuid: Option<Uuid>,
    /// Tenant-overlay network whose egress requires a dedicated NAT zone
    #[serde(default)]
    pub fabric: bool,
    pub nic_tag: String,
    #[serde(default)]
    pub resolvers: Vec<String>,
    #[serde(default)]
    pub routes: BTreeMap<String, String>,
}

/// The authoritative NIC record owned by NAPI
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NicRecord {
    pub mac: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    pub nic_tag: String,
    pub network_uuid: Uuid,
    pub belongs_to_uuid: Uuid,
    pub belongs_to_type: String,
    pub primary: bool,
    pub state: NicState,
}

impl NicRecord {
    /// The denormalized copy carried on the VM object for read paths.
    pub fn to_vm_nic(&self) -> Nic {
        Nic {
            mac: self.mac.clone(),
            ip: self.ip.clone(),
            nic_tag: self.nic_tag.clone(),
            network_uuid: self.network_uuid,
            primary: self.primary,
            state: self.state,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NicProvisionRequest {
    pub owner_uuid: Uuid,
    pub belongs_to_uuid: Uuid,
    pub belongs_to_type: String,
    pub network_uuid: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    pub primary: bool,
}

/// Placement constraints for server allocation
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Locality {
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub near: Vec<Uuid>,
    #[serde(default)]
    pub far: Vec<Uuid>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ServerCapacity {
    pub server_uuid: Uuid,
    /// advertised unreserved RAM in MiB; may go negative on oversubscribed
    /// servers
    pub unreserved_ram: i64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MachineStatus {
    pub state: VmState,
}

/// Payload handed to the compute-node agent to create a zone
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CnapiProvisionPayload {
    pub uuid: Uuid,
    pub owner_uuid: Uuid,
    pub brand: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_uuid: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    pub ram: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_cap: Option<u64>,
    pub autoboot: bool,
    pub nics: Vec<NicRecord>,
    pub resolvers: Vec<String>,
    pub routes: BTreeMap<String, String>,
    /// zones are archived rather than deleted outright on destroy
    pub archive_on_delete: bool,
    pub customer_metadata: BTreeMap<String, String>,
    pub internal_metadata: BTreeMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disks: Option<Vec<crate::db::model::VmDisk>>,
}

/// A task-based RPC against the agent of a specific compute node
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum MachineAction {
    Start,
    Stop,
    Reboot,
    Destroy,
    Update { payload: serde_json::Value },
    Reprovision { image_uuid: Uuid },
    CreateSnapshot { name: String },
    RollbackSnapshot { name: String },
    DeleteSnapshot { name: String },
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Image {
    pub uuid: Uuid,
    pub name: String,
    /// whether provisioning should generate passwords for the image's users
    #[serde(default)]
    pub generate_passwords: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Package {
    pub uuid: Uuid,
    pub name: String,
    /// RAM in MiB
    pub max_physical_memory: u64,
    /// quota in GiB
    pub quota: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_cap: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_swap: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_lwps: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zfs_io_priority: Option<u64>,
    /// bhyve packages must be flexible-disk to allow disk resize
    #[serde(default)]
    pub flexible_disk: bool,
}

/// CRUD on NIC records (NAPI)
#[async_trait]
pub trait NetworkApi: Send + Sync {
    async fn network_get(
        &self,
        ctx: &CallContext,
        uuid: Uuid,
    ) -> Result<Option<Network>, Error>;

    /// Name lookup is restricted to owner-visible or global networks.
    async fn network_by_name(
        &self,
        ctx: &CallContext,
        name: &str,
        owner: Uuid,
    ) -> Result<Option<Network>, Error>;

    /// Returns the NIC currently holding `ip` on `network`, if any.
    async fn ip_usage(
        &self,
        ctx: &CallContext,
        network: Uuid,
        ip: &str,
    ) -> Result<Option<NicRecord>, Error>;

    async fn provision_nic(
        &self,
        ctx: &CallContext,
        request: &NicProvisionRequest,
    ) -> Result<NicRecord, Error>;

    async fn nics_for_vm(
        &self,
        ctx: &CallContext,
        belongs_to: Uuid,
    ) -> Result<Vec<NicRecord>, Error>;

    async fn delete_nic(&self, ctx: &CallContext, mac: &str)
        -> Result<(), Error>;

    async fn reserve_ip(
        &self,
        ctx: &CallContext,
        network: Uuid,
        ip: &str,
    ) -> Result<(), Error>;

    async fn unreserve_ip(
        &self,
        ctx: &CallContext,
        network: Uuid,
        ip: &str,
    ) -> Result<(), Error>;
}

/// Task-based VM agent RPC (CNAPI)
#[async_trait]
pub trait ComputeApi: Send + Sync {
    async fn allocate_server(
        &self,
        ctx: &CallContext,
        ram: u64,
        locality: Option<&Locality>,
    ) -> Result<Uuid, Error>;

    async fn server_capacity(
        &self,
        ctx: &CallContext,
        server: Uuid,
    ) -> Result<ServerCapacity, Error>;

    async fn provision_vm(
        &self,
        ctx: &CallContext,
        server: Uuid,
        payload: &CnapiProvisionPayload,
    ) -> Result<String, Error>;

    async fn machine_action(
        &self,
        ctx: &CallContext,
        server: Uuid,
        vm: Uuid,
        action: &MachineAction,
    ) -> Result<String, Error>;

    /// Waits for a previously started agent task; an error is the task's
    /// failure.
    async fn wait_task(
        &self,
        ctx: &CallContext,
        task_id: &str,
    ) -> Result<(), Error>;

    async fn vm_status(
        &self,
        ctx: &CallContext,
        server: Uuid,
        vm: Uuid,
    ) -> Result<Option<MachineStatus>, Error>;

    async fn filesystem_details(
        &self,
        ctx: &CallContext,
        server: Uuid,
        vm: Uuid,
    ) -> Result<serde_json::Value, Error>;

    async fn set_do_not_inventory(
        &self,
        ctx: &CallContext,
        server: Uuid,
        vm: Uuid,
        flag: bool,
    ) -> Result<(), Error>;

    async fn remove_quota(
        &self,
        ctx: &CallContext,
        server: Uuid,
        vm: Uuid,
    ) -> Result<(), Error>;
}

/// Rule sync (FWAPI)
#[async_trait]
pub trait FirewallApi: Send + Sync {
    async fn add_rules(
        &self,
        ctx: &CallContext,
        rules: &[FirewallRule],
    ) -> Result<(), Error>;

    /// Pushes the VM's current tags so its rules re-resolve.
    async fn sync_vm(
        &self,
        ctx: &CallContext,
        vm: Uuid,
        owner: Uuid,
        tags: Vec<String>,
    ) -> Result<(), Error>;
}

/// Image availability (IMGAPI)
#[async_trait]
pub trait ImageApi: Send + Sync {
    async fn image_get(
        &self,
        ctx: &CallContext,
        uuid: Uuid,
    ) -> Result<Option<Image>, Error>;

    async fn ensure_image(
        &self,
        ctx: &CallContext,
        server: Uuid,
        image: Uuid,
    ) -> Result<String, Error>;

    async fn wait_image(
        &self,
        ctx: &CallContext,
        task_id: &str,
    ) -> Result<(), Error>;
}

/// Package catalog (PAPI)
#[async_trait]
pub trait PackageApi: Send + Sync {
    async fn package_get(
        &self,
        ctx: &CallContext,
        uuid: Uuid,
    ) -> Result<Option<Package>, Error>;
}

/// Volume reservation and reference counting (VOLAPI)
#[async_trait]
pub trait VolumeApi: Send + Sync {
    async fn add_reference(
        &self,
        ctx: &CallContext,
        volume: &str,
        owner: Uuid,
        vm: Uuid,
    ) -> Result<(), Error>;

    async fn remove_references(
        &self,
        ctx: &CallContext,
        vm: Uuid,
    ) -> Result<(), Error>;
}

/// Maps a transport-level failure talking to a collaborator into the
/// retryable service-unavailable bucket.
pub(crate) fn service_error(service: &str, error: reqwest::Error) -> Error {
    Error::unavail(&format!("error communicating with {}: {}", service, error))
}

/// The dependency-injected bundle of collaborators, passed from the
/// composition root.  Workflow tasks receive it via their task context.
#[derive(Clone)]
pub struct Collaborators {
    pub napi: Arc<dyn NetworkApi>,
    pub cnapi: Arc<dyn ComputeApi>,
    pub fwapi: Arc<dyn FirewallApi>,
    pub imgapi: Arc<dyn ImageApi>,
    pub papi: Arc<dyn PackageApi>,
    pub volapi: Arc<dyn VolumeApi>,
}
