// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Synchronous request validation
//!
//! Every mutation is validated before any workflow is created, producing
//! either a normalized parameter record (the job payload) or an error with
//! the full list of offending fields.

pub mod firewall;
pub mod tags;

use crate::clients::CallContext;
use crate::clients::Collaborators;
use crate::clients::Locality;
use crate::clients::Network;
use crate::clients::Package;
use crate::db::model::Brand;
use crate::db::model::FirewallRule;
use crate::db::model::MigrationPhase;
use crate::db::model::MigrationState;
use crate::db::model::Vm;
use crate::db::model::VmDisk;
use crate::db::model::VmState;
use crate::db::model::VmTask;
use crate::db::model::ZERO_UUID;
use crate::errors::Error;
use crate::errors::FieldError;
use crate::external_api::params::AddNicsParams;
use crate::external_api::params::MigrateParams;
use crate::external_api::params::ProvisionParams;
use crate::external_api::params::RemoveNicsParams;
use crate::external_api::params::ReprovisionParams;
use crate::external_api::params::SnapshotParams;
use crate::external_api::params::UpdateParams;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// A network reference resolved against NAPI
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ResolvedNetwork {
    pub network: Network,
    pub requested_ip: Option<String>,
    pub primary: bool,
}

/// Normalized provision record; the payload of a provision job
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NormalizedProvision {
    pub vm_uuid: Uuid,
    pub owner_uuid: Uuid,
    pub brand: Brand,
    pub image_uuid: Option<Uuid>,
    pub generate_passwords: bool,
    pub networks: Vec<ResolvedNetwork>,
    pub ram: u64,
    pub quota: Option<u64>,
    pub billing_id: Uuid,
    pub package: Option<Package>,
    pub alias: Option<String>,
    pub autoboot: bool,
    pub cpu_cap: Option<u64>,
    pub cpu_shares: Option<u64>,
    pub max_swap: Option<u64>,
    pub max_lwps: Option<u64>,
    pub zfs_io_priority: Option<u64>,
    pub tags: BTreeMap<String, Value>,
    pub customer_metadata: BTreeMap<String, String>,
    pub internal_metadata: BTreeMap<String, Value>,
    pub firewall_rules: Vec<FirewallRule>,
    pub locality: Option<Locality>,
    pub disks: Option<Vec<VmDisk>>,
    pub volumes: Vec<String>,
    /// operator-pinned placement; skips allocation when set
    pub server_uuid: Option<Uuid>,
}

/// Normalized update record; also the payload tag operations ride on
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct NormalizedUpdate {
    pub alias: Option<String>,
    pub autoboot: Option<bool>,
    pub owner_uuid: Option<Uuid>,
    pub billing_id: Option<Uuid>,
    pub package: Option<Package>,
    /// package RAM grew; placement capacity was consulted
    pub resize_up: bool,
    pub set_tags: Option<BTreeMap<String, Value>>,
    pub add_tags: Option<BTreeMap<String, Value>>,
    pub remove_tags: Option<Vec<String>>,
    pub remove_all_tags: bool,
    pub customer_metadata: Option<BTreeMap<String, String>>,
    pub internal_metadata: Option<BTreeMap<String, Value>>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NormalizedAddNics {
    pub networks: Vec<ResolvedNetwork>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NormalizedRemoveNics {
    pub macs: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NormalizedSnapshot {
    pub name: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NormalizedReprovision {
    pub image_uuid: Uuid,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NormalizedMigrate {
    pub phase: MigrationPhase,
    pub automatic: bool,
}

pub(crate) fn display_tag_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_uuid_field(field: &str, value: &str) -> Result<Uuid, Error> {
    Uuid::parse_str(value).map_err(|_| {
        Error::invalid_field(
            field,
            "Invalid",
            &format!("{} is not a UUID: {:?}", field, value),
        )
    })
}

/// Locality is an object with optional `strict` and `near`/`far`, each a
/// UUID or an array of UUIDs.
pub fn parse_locality(value: &Value) -> Result<Locality, Error> {
    let malformed = || {
        Error::invalid_field(
            "locality",
            "Invalid",
            "locality contains malformed UUID",
        )
    };
    let Some(object) = value.as_object() else {
        return Err(Error::invalid_field(
            "locality",
            "Invalid",
            "locality must be an object",
        ));
    };
    let mut locality = Locality::default();
    locality.strict =
        object.get("strict").and_then(Value::as_bool).unwrap_or(false);
    for (key, target) in [("near", true), ("far", false)] {
        let Some(value) = object.get(key) else { continue };
        let raw: Vec<&str> = match value {
            Value::String(s) => vec![s.as_str()],
            Value::Array(items) => items
                .iter()
                .map(|v| v.as_str().ok_or(()))
                .collect::<Result<_, _>>()
                .map_err(|_| malformed())?,
            _ => return Err(malformed()),
        };
        let uuids = raw
            .into_iter()
            .map(|s| Uuid::parse_str(s).map_err(|_| malformed()))
            .collect::<Result<Vec<_>, _>>()?;
        if target {
            locality.near = uuids;
        } else {
            locality.far = uuids;
        }
    }
    Ok(locality)
}

/// Resolves the `networks` parameter: each entry is a uuid string or a
/// `{uuid}` / `{name}` object, optionally with `ipv4_ips`.  Unknown
/// references are 422s; a requested IP already held by another VM surfaces
/// the holder.
async fn resolve_networks(
    call: &CallContext,
    collab: &Collaborators,
    owner_uuid: Uuid,
    vm_uuid: Uuid,
    value: &Value,
) -> Result<Vec<ResolvedNetwork>, Error> {
    let Some(entries) = value.as_array() else {
        return Err(Error::invalid_field(
            "networks",
            "Invalid",
            "networks must be an array",
        ));
    };
    let mut resolved = Vec::with_capacity(entries.len());
    for (i, entry) in entries.iter().enumerate() {
        let (reference, requested_ip, primary) = match entry {
            Value::String(s) => (s.clone(), None, None),
            Value::Object(object) => {
                let reference = object
                    .get("uuid")
                    .or_else(|| object.get("name"))
                    .and_then(Value::as_str)
                    .map(String::from)
                    .ok_or_else(|| {
                        Error::invalid_field(
                            "networks",
                            "Invalid",
                            "network reference requires a uuid or name",
                        )
                    })?;
                let ip = object
                    .get("ipv4_ips")
                    .and_then(Value::as_array)
                    .and_then(|ips| ips.first())
                    .and_then(Value::as_str)
                    .map(String::from);
                let primary =
                    object.get("primary").and_then(Value::as_bool);
                (reference, ip, primary)
            }
            _ => {
                return Err(Error::invalid_field(
                    "networks",
                    "Invalid",
                    "network reference must be a uuid or an object",
                ));
            }
        };

        let network = match Uuid::parse_str(&reference) {
            Ok(uuid) => collab.napi.network_get(call, uuid).await?,
            Err(_) => {
                collab.napi.network_by_name(call, &reference, owner_uuid).await?
            }
        }
        .ok_or_else(|| Error::no_such_network(&reference))?;

        if let Some(ip) = &requested_ip {
            if let Some(holder) =
                collab.napi.ip_usage(call, network.uuid, ip).await?
            {
                if holder.belongs_to_uuid != vm_uuid {
                    return Err(Error::ip_used_by(holder.belongs_to_uuid));
                }
            }
        }

        resolved.push(ResolvedNetwork {
            network,
            requested_ip,
            primary: primary.unwrap_or(i == 0),
        });
    }
    Ok(resolved)
}

/// Validates a provision request and produces the provision job payload.
pub async fn validate_provision(
    call: &CallContext,
    collab: &Collaborators,
    params: &ProvisionParams,
) -> Result<NormalizedProvision, Error> {
    let mut missing: Vec<FieldError> = Vec::new();

    let owner_uuid = match &params.owner_uuid {
        Some(s) if !s.is_empty() => Some(parse_uuid_field("owner_uuid", s)?),
        _ => {
            missing.push(FieldError::missing("owner_uuid"));
            None
        }
    };
    let brand = match &params.brand {
        Some(s) => Some(s.parse::<Brand>().map_err(|e| {
            Error::invalid_field("brand", "Invalid", &e)
        })?),
        None => {
            missing.push(FieldError::missing("brand"));
            None
        }
    };
    if params.ram.is_none() {
        missing.push(FieldError::missing("ram"));
    }
    let billing_id = match &params.billing_id {
        Some(s) => Some(parse_uuid_field("billing_id", s)?),
        None => {
            missing.push(FieldError::missing("billing_id"));
            None
        }
    };
    let networks_present = params
        .networks
        .as_ref()
        .map(|v| !matches!(v, Value::Array(a) if a.is_empty()))
        .unwrap_or(false);
    if !networks_present {
        missing.push(FieldError::missing("networks"));
    }
    // For bhyve/kvm the boot image rides on the first disk.
    let image_ref = match brand {
        Some(brand) if brand.is_hvm() => params
            .disks
            .as_ref()
            .and_then(|disks| disks.first())
            .and_then(|disk| disk.image_uuid),
        _ => match &params.image_uuid {
            Some(s) => Some(parse_uuid_field("image_uuid", s)?),
            None => None,
        },
    };
    if image_ref.is_none() {
        missing.push(FieldError::missing("image_uuid"));
    }
    if !missing.is_empty() {
        return Err(Error::validation("Invalid VM parameters", missing));
    }
    let (owner_uuid, brand, billing_id) =
        (owner_uuid.unwrap(), brand.unwrap(), billing_id.unwrap());

    let locality = match &params.locality {
        Some(value) => Some(parse_locality(value)?),
        None => None,
    };

    let docker = params.docker == Some(true);
    let tags = params.tags.clone().unwrap_or_default();
    tags::validate_vm_tags(&tags, docker)?;

    let firewall_rules = match &params.firewall_rules {
        Some(value) => firewall::validate_firewall_rules(value)?,
        None => Vec::new(),
    };

    let package = if billing_id == ZERO_UUID {
        None
    } else {
        Some(collab.papi.package_get(call, billing_id).await?.ok_or_else(
            || {
                Error::invalid_field(
                    "billing_id",
                    "Invalid",
                    &format!("package {} does not exist", billing_id),
                )
            },
        )?)
    };

    let image_uuid = image_ref.unwrap();
    let image =
        collab.imgapi.image_get(call, image_uuid).await?.ok_or_else(|| {
            Error::invalid_field(
                "image_uuid",
                "Invalid",
                &format!("image {} does not exist", image_uuid),
            )
        })?;

    let vm_uuid = match &params.uuid {
        Some(s) => parse_uuid_field("uuid", s)?,
        None => Uuid::new_v4(),
    };
    let server_uuid = match &params.server_uuid {
        Some(s) => Some(parse_uuid_field("server_uuid", s)?),
        None => None,
    };

    let networks = resolve_networks(
        call,
        collab,
        owner_uuid,
        vm_uuid,
        params.networks.as_ref().unwrap(),
    )
    .await?;

    // The package is authoritative for the resource envelope.
    let ram = package
        .as_ref()
        .map(|p| p.max_physical_memory)
        .or(params.ram)
        .unwrap();
    let quota = if brand.is_hvm() {
        None
    } else {
        params.quota.or(package.as_ref().map(|p| p.quota))
    };
    let mut internal_metadata = params.internal_metadata.clone().unwrap_or_default();
    if docker {
        internal_metadata.insert("docker".to_string(), Value::Bool(true));
    }

    Ok(NormalizedProvision {
        vm_uuid,
        owner_uuid,
        brand,
        image_uuid: Some(image.uuid),
        generate_passwords: image.generate_passwords,
        networks,
        ram,
        quota,
        billing_id,
        package,
        alias: params.alias.clone(),
        autoboot: params.autoboot.unwrap_or(true),
        cpu_cap: params.cpu_cap,
        cpu_shares: params.cpu_shares,
        max_swap: params.max_swap,
        max_lwps: params.max_lwps,
        zfs_io_priority: params.zfs_io_priority,
        tags,
        customer_metadata: params.customer_metadata.clone().unwrap_or_default(),
        internal_metadata,
        firewall_rules,
        locality,
        disks: params.disks.clone(),
        volumes: params.volumes.clone().unwrap_or_default(),
        server_uuid,
    })
}

/// Validates an update request.  Resize-up consults the server's advertised
/// capacity; resize-down is always permitted.
pub async fn validate_update(
    call: &CallContext,
    collab: &Collaborators,
    vm: &Vm,
    params: &UpdateParams,
) -> Result<NormalizedUpdate, Error> {
    let owner_uuid = match &params.owner_uuid {
        Some(s) if s.is_empty() => {
            return Err(Error::invalid_field(
                "owner_uuid",
                "Invalid",
                "owner_uuid must not be empty",
            ));
        }
        Some(s) => Some(parse_uuid_field("owner_uuid", s)?),
        None => None,
    };

    if let Some(tags) = &params.tags {
        tags::validate_vm_tags(tags, false)?;
        for key in vm.tags.keys() {
            if tags::is_reserved_tag(key) && !tags.contains_key(key) {
                tags::validate_tag_deletion(key, vm.is_docker())?;
            }
        }
    }

    let mut normalized = NormalizedUpdate {
        alias: params.alias.clone(),
        autoboot: params.autoboot,
        owner_uuid,
        set_tags: params.tags.clone(),
        customer_metadata: params.customer_metadata.clone(),
        internal_metadata: params.internal_metadata.clone(),
        ..Default::default()
    };

    let Some(billing_id) = &params.billing_id else {
        return Ok(normalized);
    };
    let billing_id = parse_uuid_field("billing_id", billing_id)?;
    if billing_id == vm.billing_id {
        return Ok(normalized);
    }
    let package =
        collab.papi.package_get(call, billing_id).await?.ok_or_else(|| {
            Error::invalid_field(
                "billing_id",
                "Invalid",
                &format!("package {} does not exist", billing_id),
            )
        })?;

    if vm.brand.is_hvm() {
        if !package.flexible_disk {
            return Err(Error::VmWithoutFlexibleDiskSize {
                message: format!(
                    "package {} does not use flexible disk sizing",
                    package.uuid
                ),
            });
        }
        let disk_mib: u64 = vm
            .disks
            .as_ref()
            .map(|disks| disks.iter().map(|d| d.size).sum())
            .unwrap_or(0);
        if disk_mib > package.quota * 1024 {
            return Err(Error::InsufficientDiskSpace {
                message: format!(
                    "VM disks use {} MiB but package {} allows {} MiB",
                    disk_mib,
                    package.uuid,
                    package.quota * 1024
                ),
            });
        }
    }

    if package.max_physical_memory > vm.ram {
        let required = package.max_physical_memory - vm.ram;
        let server = vm.server_uuid.ok_or_else(|| Error::UnallocatedVm {
            message: format!("VM {} is not allocated to a server", vm.uuid),
        })?;
        let capacity = collab.cnapi.server_capacity(call, server).await?;
        if i64::try_from(required).unwrap_or(i64::MAX)
            > capacity.unreserved_ram
        {
            return Err(Error::ValidationFailed {
                message: "Invalid VM update parameters".to_string(),
                errors: vec![FieldError {
                    field: "ram".to_string(),
                    code: "InsufficientCapacity".to_string(),
                    message: Some(format!(
                        "Required additional RAM ({}) exceeds the server's \
                         available RAM ({})",
                        required, capacity.unreserved_ram
                    )),
                    kind: None,
                    id: None,
                }],
            });
        }
        normalized.resize_up = true;
    }
    normalized.billing_id = Some(billing_id);
    normalized.package = Some(package);
    Ok(normalized)
}

pub async fn validate_add_nics(
    call: &CallContext,
    collab: &Collaborators,
    vm: &Vm,
    params: &AddNicsParams,
) -> Result<NormalizedAddNics, Error> {
    let Some(networks) = &params.networks else {
        return Err(Error::missing_parameters(&["networks"]));
    };
    let resolved =
        resolve_networks(call, collab, vm.owner_uuid, vm.uuid, networks)
            .await?;
    if resolved.is_empty() {
        return Err(Error::missing_parameters(&["networks"]));
    }
    Ok(NormalizedAddNics { networks: resolved })
}

pub fn validate_remove_nics(
    vm: &Vm,
    params: &RemoveNicsParams,
) -> Result<NormalizedRemoveNics, Error> {
    let Some(macs) = &params.macs else {
        return Err(Error::missing_parameters(&["macs"]));
    };
    if macs.is_empty() {
        return Err(Error::missing_parameters(&["macs"]));
    }
    for mac in macs {
        if !vm.nics.iter().any(|nic| &nic.mac == mac) {
            return Err(Error::invalid_field(
                "macs",
                "Invalid",
                &format!("VM has no NIC with MAC address {}", mac),
            ));
        }
    }
    Ok(NormalizedRemoveNics { macs: macs.clone() })
}

pub fn validate_snapshot(
    vm: &Vm,
    params: &SnapshotParams,
    task: VmTask,
) -> Result<NormalizedSnapshot, Error> {
    let name = match &params.snapshot_name {
        Some(name) => {
            let well_formed = !name.is_empty()
                && name.len() <= 64
                && name.chars().all(|c| {
                    c.is_ascii_alphanumeric() || c == '-' || c == '_'
                });
            if !well_formed {
                return Err(Error::invalid_field(
                    "snapshot_name",
                    "Invalid",
                    &format!("invalid snapshot name {:?}", name),
                ));
            }
            name.clone()
        }
        None => match task {
            VmTask::Snapshot => {
                format!("snapshot-{}", chrono::Utc::now().timestamp())
            }
            _ => {
                return Err(Error::missing_parameters(&["snapshot_name"]));
            }
        },
    };
    if matches!(task, VmTask::RollbackSnapshot | VmTask::DeleteSnapshot)
        && !vm.snapshots.iter().any(|s| s.name == name)
    {
        return Err(Error::invalid_field(
            "snapshot_name",
            "Invalid",
            &format!("VM has no snapshot {:?}", name),
        ));
    }
    Ok(NormalizedSnapshot { name })
}

pub async fn validate_reprovision(
    call: &CallContext,
    collab: &Collaborators,
    vm: &Vm,
    params: &ReprovisionParams,
) -> Result<NormalizedReprovision, Error> {
    if vm.brand.is_hvm() {
        return Err(Error::BrandNotSupported {
            message: format!(
                "reprovision is not supported for brand \"{}\"",
                vm.brand
            ),
        });
    }
    let Some(image_uuid) = &params.image_uuid else {
        return Err(Error::missing_parameters(&["image_uuid"]));
    };
    let image_uuid = parse_uuid_field("image_uuid", image_uuid)?;
    collab.imgapi.image_get(call, image_uuid).await?.ok_or_else(|| {
        Error::invalid_field(
            "image_uuid",
            "Invalid",
            &format!("image {} does not exist", image_uuid),
        )
    })?;
    Ok(NormalizedReprovision { image_uuid })
}

/// Validates a migrate request against the VM's latest migration record.
pub fn validate_migrate(
    vm: &Vm,
    params: &MigrateParams,
    latest: Option<&crate::db::model::Migration>,
) -> Result<NormalizedMigrate, Error> {
    let Some(action) = &params.migration_action else {
        return Err(Error::missing_parameters(&["migration_action"]));
    };
    let phase = match action.as_str() {
        "begin" => MigrationPhase::Begin,
        "sync" => MigrationPhase::Sync,
        "switch" => MigrationPhase::Switch,
        "abort" => MigrationPhase::Abort,
        other => {
            return Err(Error::invalid_field(
                "migration_action",
                "Invalid",
                &format!("unknown migration action {:?}", other),
            ));
        }
    };
    let require_previous = |wanted: &[MigrationPhase]| match latest {
        Some(m)
            if m.state == MigrationState::Successful
                && wanted.contains(&m.phase) =>
        {
            Ok(())
        }
        _ => Err(Error::invalid_field(
            "migration_action",
            "Invalid",
            &format!(
                "VM {} is not in a state to run migration {:?}",
                vm.uuid, action
            ),
        )),
    };
    match phase {
        MigrationPhase::Begin => {
            if latest.map(|m| m.state == MigrationState::Running).unwrap_or(false)
            {
                return Err(Error::invalid_field(
                    "migration_action",
                    "Invalid",
                    "a migration is already running for this VM",
                ));
            }
        }
        MigrationPhase::Sync => {
            require_previous(&[MigrationPhase::Begin, MigrationPhase::Sync])?
        }
        MigrationPhase::Switch => require_previous(&[MigrationPhase::Sync])?,
        MigrationPhase::Abort => {
            if latest.is_none() {
                return Err(Error::invalid_field(
                    "migration_action",
                    "Invalid",
                    "VM has no migration to abort",
                ));
            }
        }
    }
    Ok(NormalizedMigrate {
        phase,
        automatic: params.automatic.unwrap_or(false),
    })
}

/// Gate for the lifecycle state machine: checks that `task` is legal given
/// the VM's current state.
pub fn validate_action_state(vm: &Vm, task: VmTask) -> Result<(), Error> {
    if vm.state == VmState::Destroyed {
        return Err(Error::validation(
            &format!("VM {} has already been destroyed", vm.uuid),
            vec![],
        ));
    }
    // While provisioning, destructive and boot-changing actions are
    // forbidden except destroy.
    if vm.state == VmState::Provisioning && task != VmTask::Destroy {
        return Err(Error::validation(
            &format!("VM {} is currently provisioning", vm.uuid),
            vec![],
        ));
    }
    if vm.server_uuid.is_none() && task != VmTask::Destroy {
        return Err(Error::UnallocatedVm {
            message: format!(
                "VM {} has never been allocated to a server",
                vm.uuid
            ),
        });
    }
    if vm.state == VmState::Failed && task != VmTask::Destroy {
        return Err(Error::validation(
            &format!("VM {} is in a failed state", vm.uuid),
            vec![],
        ));
    }
    match task {
        VmTask::Start => {
            if vm.state != VmState::Stopped {
                return Err(Error::VmNotStopped {
                    message: format!("VM {} is not stopped", vm.uuid),
                });
            }
        }
        VmTask::Stop | VmTask::Reboot | VmTask::MigrateBegin => {
            if vm.state != VmState::Running {
                return Err(Error::VmNotRunning {
                    message: format!("VM {} is not running", vm.uuid),
                });
            }
        }
        VmTask::Snapshot | VmTask::RollbackSnapshot | VmTask::DeleteSnapshot => {
            if vm.brand.is_hvm() {
                return Err(Error::BrandNotSupported {
                    message: format!(
                        "snapshots are not supported for brand \"{}\"",
                        vm.brand
                    ),
                });
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::db::model::Nic;
    use crate::db::model::NicState;
    use chrono::Utc;
    use serde_json::json;

    fn running_vm() -> Vm {
        Vm {
            uuid: Uuid::new_v4(),
            owner_uuid: Uuid::new_v4(),
            brand: Brand::JoyentMinimal,
            state: VmState::Running,
            alias: None,
            billing_id: ZERO_UUID,
            image_uuid: Some(Uuid::new_v4()),
            ram: 256,
            max_physical_memory: 256,
            quota: Some(10),
            cpu_cap: None,
            cpu_shares: None,
            max_swap: None,
            max_lwps: None,
            zfs_io_priority: None,
            create_timestamp: Utc::now(),
            server_uuid: Some(Uuid::new_v4()),
            autoboot: true,
            nics: vec![Nic {
                mac: "90:b8:d0:aa:bb:cc".to_string(),
                ip: Some("10.0.0.7".to_string()),
                nic_tag: "external".to_string(),
                network_uuid: Uuid::new_v4(),
                primary: true,
                state: NicState::Running,
            }],
            tags: Default::default(),
            customer_metadata: Default::default(),
            internal_metadata: Default::default(),
            firewall_rules: Vec::new(),
            snapshots: Vec::new(),
            disks: None,
        }
    }

    #[test]
    fn test_locality_parsing() {
        let near = Uuid::new_v4();
        let far = Uuid::new_v4();
        let locality = parse_locality(&json!({
            "strict": true,
            "near": near.to_string(),
            "far": [far.to_string()],
        }))
        .unwrap();
        assert!(locality.strict);
        assert_eq!(locality.near, vec![near]);
        assert_eq!(locality.far, vec![far]);

        let error =
            parse_locality(&json!({"near": "not-a-uuid"})).unwrap_err();
        let body = serde_json::to_value(&error).unwrap();
        assert_eq!(body["errors"][0]["field"], "locality");
        assert_eq!(body["errors"][0]["code"], "Invalid");
        assert_eq!(
            body["errors"][0]["message"],
            "locality contains malformed UUID"
        );
    }

    #[test]
    fn test_action_state_gates() {
        let mut vm = running_vm();
        assert!(validate_action_state(&vm, VmTask::Stop).is_ok());
        assert!(matches!(
            validate_action_state(&vm, VmTask::Start),
            Err(Error::VmNotStopped { .. })
        ));

        vm.state = VmState::Stopped;
        assert!(validate_action_state(&vm, VmTask::Start).is_ok());
        assert!(matches!(
            validate_action_state(&vm, VmTask::Reboot),
            Err(Error::VmNotRunning { .. })
        ));

        vm.state = VmState::Provisioning;
        assert!(validate_action_state(&vm, VmTask::Destroy).is_ok());
        assert!(validate_action_state(&vm, VmTask::Update).is_err());

        vm.state = VmState::Stopped;
        vm.server_uuid = None;
        assert!(matches!(
            validate_action_state(&vm, VmTask::Start),
            Err(Error::UnallocatedVm { .. })
        ));

        vm = running_vm();
        vm.brand = Brand::Bhyve;
        assert!(matches!(
            validate_action_state(&vm, VmTask::Snapshot),
            Err(Error::BrandNotSupported { .. })
        ));
    }

    #[test]
    fn test_remove_nics_requires_known_macs() {
        let vm = running_vm();
        let ok = validate_remove_nics(
            &vm,
            &RemoveNicsParams {
                macs: Some(vec!["90:b8:d0:aa:bb:cc".to_string()]),
            },
        );
        assert!(ok.is_ok());
        assert!(validate_remove_nics(
            &vm,
            &RemoveNicsParams { macs: Some(vec!["00:00:00:00:00:00".into()]) },
        )
        .is_err());
        assert!(
            validate_remove_nics(&vm, &RemoveNicsParams { macs: None })
                .is_err()
        );
    }

    #[test]
    fn test_snapshot_name_rules() {
        let mut vm = running_vm();
        vm.snapshots.push(crate::db::model::VmSnapshot {
            name: "nightly".to_string(),
            created_at: Utc::now(),
        });
        let normalized = validate_snapshot(
            &vm,
            &SnapshotParams { snapshot_name: None },
            VmTask::Snapshot,
        )
        .unwrap();
        assert!(normalized.name.starts_with("snapshot-"));

        assert!(validate_snapshot(
            &vm,
            &SnapshotParams { snapshot_name: Some("bad name!".into()) },
            VmTask::Snapshot,
        )
        .is_err());

        assert!(validate_snapshot(
            &vm,
            &SnapshotParams { snapshot_name: Some("nightly".into()) },
            VmTask::RollbackSnapshot,
        )
        .is_ok());
        assert!(validate_snapshot(
            &vm,
            &SnapshotParams { snapshot_name: Some("missing".into()) },
            VmTask::DeleteSnapshot,
        )
        .is_err());
    }

    #[test]
    fn test_migrate_phases() {
        let vm = running_vm();
        let begin = validate_migrate(
            &vm,
            &MigrateParams {
                migration_action: Some("begin".into()),
                automatic: None,
            },
            None,
        )
        .unwrap();
        assert_eq!(begin.phase, MigrationPhase::Begin);
        assert!(!begin.automatic);

        // sync without a successful begin is rejected
        assert!(validate_migrate(
            &vm,
            &MigrateParams {
                migration_action: Some("sync".into()),
                automatic: None,
            },
            None,
        )
        .is_err());

        let record = crate::db::model::Migration {
            id: Uuid::new_v4(),
            vm_uuid: vm.uuid,
            phase: MigrationPhase::Begin,
            state: MigrationState::Successful,
            source_server_uuid: vm.server_uuid.unwrap(),
            target_server_uuid: Some(Uuid::new_v4()),
            automatic: false,
            created_at: Utc::now(),
            finished_at: Some(Utc::now()),
            process_details: None,
        };
        assert!(validate_migrate(
            &vm,
            &MigrateParams {
                migration_action: Some("sync".into()),
                automatic: None,
            },
            Some(&record),
        )
        .is_ok());
    }
}
