// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Records persisted in (or correlated with) the VM store

use chrono::DateTime;
use chrono::Utc;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// The zero uuid stands for "no package" in `billing_id`.
pub const ZERO_UUID: Uuid = Uuid::nil();

/// VM lifecycle state
///
/// Transitions follow the lifecycle graph: `provisioning` moves to `running`
/// or `failed`, `running` and `stopped` cycle through the lifecycle actions,
/// and `destroyed` is terminal.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    Provisioning,
    Running,
    Stopped,
    Failed,
    Destroyed,
}

impl VmState {
    /// Whether the VM counts as "active" for search purposes
    /// (`state=active` ⇔ neither destroyed nor failed).
    pub fn active(&self) -> bool {
        !matches!(self, VmState::Destroyed | VmState::Failed)
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VmState::Provisioning => "provisioning",
            VmState::Running => "running",
            VmState::Stopped => "stopped",
            VmState::Failed => "failed",
            VmState::Destroyed => "destroyed",
        })
    }
}

impl std::str::FromStr for VmState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provisioning" => Ok(VmState::Provisioning),
            "running" => Ok(VmState::Running),
            "stopped" => Ok(VmState::Stopped),
            "failed" => Ok(VmState::Failed),
            "destroyed" => Ok(VmState::Destroyed),
            _ => Err(format!("unknown VM state: {:?}", s)),
        }
    }
}

/// The execution model of a VM
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
pub enum Brand {
    #[serde(rename = "joyent-minimal")]
    JoyentMinimal,
    #[serde(rename = "joyent")]
    Joyent,
    #[serde(rename = "lx")]
    Lx,
    #[serde(rename = "bhyve")]
    Bhyve,
    #[serde(rename = "kvm")]
    Kvm,
}

impl Brand {
    /// Hardware-virtualized brands carry `disks` instead of `quota`.
    pub fn is_hvm(&self) -> bool {
        matches!(self, Brand::Bhyve | Brand::Kvm)
    }
}

impl fmt::Display for Brand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Brand::JoyentMinimal => "joyent-minimal",
            Brand::Joyent => "joyent",
            Brand::Lx => "lx",
            Brand::Bhyve => "bhyve",
            Brand::Kvm => "kvm",
        })
    }
}

impl std::str::FromStr for Brand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "joyent-minimal" => Ok(Brand::JoyentMinimal),
            "joyent" => Ok(Brand::Joyent),
            "lx" => Ok(Brand::Lx),
            "bhyve" => Ok(Brand::Bhyve),
            "kvm" => Ok(Brand::Kvm),
            _ => Err(format!("unknown brand: {:?}", s)),
        }
    }
}

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum NicState {
    Provisioning,
    Running,
    Stopped,
}

/// Denormalized view of a NIC record owned by the network API
///
/// The authoritative record lives in NAPI (looked up by `belongs_to_uuid`
/// on write paths); this copy serves read paths on the VM object.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct Nic {
    pub mac: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    pub nic_tag: String,
    pub network_uuid: Uuid,
    pub primary: bool,
    pub state: NicState,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct VmSnapshot {
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// One virtual disk of a bhyve/kvm VM; `size` is in MiB.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct VmDisk {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_uuid: Option<Uuid>,
    pub size: u64,
    #[serde(default)]
    pub boot: bool,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct FirewallRule {
    pub uuid: Uuid,
    pub rule: String,
    pub owner_uuid: Uuid,
    pub enabled: bool,
}

/// A provisioned compute instance (zone or virtual machine)
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct Vm {
    pub uuid: Uuid,
    pub owner_uuid: Uuid,
    pub brand: Brand,
    pub state: VmState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    pub billing_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_uuid: Option<Uuid>,
    /// RAM in MiB; always equal to `max_physical_memory`
    pub ram: u64,
    pub max_physical_memory: u64,
    /// quota in GiB; null once the VM is destroyed (unknown after destroy)
    pub quota: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_cap: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_shares: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_swap: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_lwps: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zfs_io_priority: Option<u64>,
    pub create_timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_uuid: Option<Uuid>,
    pub autoboot: bool,
    pub nics: Vec<Nic>,
    pub tags: BTreeMap<String, serde_json::Value>,
    pub customer_metadata: BTreeMap<String, String>,
    pub internal_metadata: BTreeMap<String, serde_json::Value>,
    pub firewall_rules: Vec<FirewallRule>,
    pub snapshots: Vec<VmSnapshot>,
    /// bhyve/kvm only; replaces `quota` for those brands
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disks: Option<Vec<VmDisk>>,
}

impl Vm {
    /// Whether the VM was provisioned as a docker container.  Docker VMs
    /// carry the marker in `internal_metadata` at provision time; the
    /// reserved-tag policy keys off it.
    pub fn is_docker(&self) -> bool {
        matches!(
            self.internal_metadata.get("docker"),
            Some(serde_json::Value::Bool(true))
        )
    }

    /// `billing_id == zero-uuid` means "no package".
    pub fn has_package(&self) -> bool {
        self.billing_id != ZERO_UUID
    }
}

/// The long-running workflow behind a single mutation
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
pub enum VmTask {
    #[serde(rename = "provision")]
    Provision,
    #[serde(rename = "start")]
    Start,
    #[serde(rename = "stop")]
    Stop,
    #[serde(rename = "reboot")]
    Reboot,
    #[serde(rename = "update")]
    Update,
    #[serde(rename = "add-nics")]
    AddNics,
    #[serde(rename = "remove-nic")]
    RemoveNics,
    #[serde(rename = "snapshot")]
    Snapshot,
    #[serde(rename = "rollback")]
    RollbackSnapshot,
    #[serde(rename = "delete-snapshot")]
    DeleteSnapshot,
    #[serde(rename = "reprovision")]
    Reprovision,
    #[serde(rename = "destroy")]
    Destroy,
    #[serde(rename = "migrate-begin")]
    MigrateBegin,
    #[serde(rename = "migrate-sync")]
    MigrateSync,
    #[serde(rename = "migrate-switch")]
    MigrateSwitch,
    #[serde(rename = "migrate-abort")]
    MigrateAbort,
}

impl fmt::Display for VmTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VmTask::Provision => "provision",
            VmTask::Start => "start",
            VmTask::Stop => "stop",
            VmTask::Reboot => "reboot",
            VmTask::Update => "update",
            VmTask::AddNics => "add-nics",
            VmTask::RemoveNics => "remove-nic",
            VmTask::Snapshot => "snapshot",
            VmTask::RollbackSnapshot => "rollback",
            VmTask::DeleteSnapshot => "delete-snapshot",
            VmTask::Reprovision => "reprovision",
            VmTask::Destroy => "destroy",
            VmTask::MigrateBegin => "migrate-begin",
            VmTask::MigrateSync => "migrate-sync",
            VmTask::MigrateSwitch => "migrate-switch",
            VmTask::MigrateAbort => "migrate-abort",
        })
    }
}

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum JobExecution {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl JobExecution {
    pub fn terminal(&self) -> bool {
        matches!(
            self,
            JobExecution::Succeeded
                | JobExecution::Failed
                | JobExecution::Canceled
        )
    }
}

/// The caller recorded at API time, carried by the `x-context` header
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct JobCaller {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(rename = "keyId", skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
}

impl Default for JobCaller {
    fn default() -> JobCaller {
        JobCaller { kind: "unknown".to_string(), ip: None, key_id: None }
    }
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct JobContext {
    #[serde(default)]
    pub caller: JobCaller,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Parameters a job was submitted with.  `payload` carries the normalized
/// per-action record; `context` carries the caller recorded at API time.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct JobParams {
    pub context: JobContext,
    pub payload: serde_json::Value,
}

/// Outcome of one task in a job's chain
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct TaskResult {
    pub task: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// A workflow job.  Jobs are append-only from the control plane's view:
/// the executor owns progression, the control plane reads and correlates.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct Job {
    pub uuid: Uuid,
    pub name: String,
    pub execution: JobExecution,
    pub params: JobParams,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm_uuid: Option<Uuid>,
    pub task: VmTask,
    /// Whether a failure of this job should mark the VM `failed` and clean
    /// up pre-created NIC records.  Cleared once the point of no return
    /// (physical zone creation) is reached.
    pub mark_as_failed_on_error: bool,
    pub chain_results: Vec<TaskResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TicketScope {
    Vm,
    Allocation,
}

impl fmt::Display for TicketScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TicketScope::Vm => "vm",
            TicketScope::Allocation => "allocation",
        })
    }
}

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TicketState {
    Queued,
    Active,
    Released,
    Expired,
}

/// A FIFO lease serializing work on a shared resource (a VM or a server)
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct Ticket {
    pub id: Uuid,
    pub scope: TicketScope,
    pub key: String,
    pub state: TicketState,
    /// the job holding or waiting on this ticket
    pub holder: Uuid,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acquired_at: Option<DateTime<Utc>>,
}

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum MigrationPhase {
    Begin,
    Sync,
    Switch,
    Abort,
}

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum MigrationState {
    Running,
    Successful,
    Failed,
}

/// One phase record in the `vm_migrations` bucket
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct Migration {
    pub id: Uuid,
    pub vm_uuid: Uuid,
    pub phase: MigrationPhase,
    pub state: MigrationState,
    pub source_server_uuid: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_server_uuid: Option<Uuid>,
    pub automatic: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_details: Option<serde_json::Value>,
}

#[cfg(test)]
mod test {
    use super::Brand;
    use super::VmState;
    use super::VmTask;

    #[test]
    fn test_state_round_trip() {
        for state in [
            VmState::Provisioning,
            VmState::Running,
            VmState::Stopped,
            VmState::Failed,
            VmState::Destroyed,
        ] {
            let parsed: VmState = state.to_string().parse().unwrap();
            assert_eq!(parsed, state);
        }
        assert!("halted".parse::<VmState>().is_err());
    }

    #[test]
    fn test_active_states() {
        assert!(VmState::Provisioning.active());
        assert!(VmState::Running.active());
        assert!(VmState::Stopped.active());
        assert!(!VmState::Failed.active());
        assert!(!VmState::Destroyed.active());
    }

    #[test]
    fn test_brand_serialization() {
        let brand: Brand = serde_json::from_str("\"joyent-minimal\"").unwrap();
        assert_eq!(brand, Brand::JoyentMinimal);
        assert!(Brand::Bhyve.is_hvm());
        assert!(!Brand::Lx.is_hvm());
    }

    #[test]
    fn test_task_names() {
        assert_eq!(
            serde_json::to_value(VmTask::AddNics).unwrap(),
            serde_json::json!("add-nics")
        );
        assert_eq!(VmTask::RollbackSnapshot.to_string(), "rollback");
    }
}
