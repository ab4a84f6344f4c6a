// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fabric NAT coordination
//!
//! A NIC on a tenant fabric needs that fabric's dedicated NAT zone (alias
//! `nat-<fabricUuid>`) up and running before the parent workflow proceeds.
//! The ensure task provisions one when absent, under a fabric-scoped
//! allocation ticket so concurrent provisions cannot create duplicates.
//! The NAT zone's lifecycle mirrors the fabric's last dependent VM: the
//! destroy pipeline reaps it when no user VM remains on the fabric.

use super::ActionError;
use super::ActionRegistry;
use super::NetworksPayload;
use super::TaskContext;
use crate::clients::CnapiProvisionPayload;
use crate::clients::MachineAction;
use crate::clients::Network;
use crate::clients::NicProvisionRequest;
use crate::db::filter::ListOptions;
use crate::db::filter::StateFilter;
use crate::db::filter::VmFilter;
use crate::db::model::Brand;
use crate::db::model::NicState;
use crate::db::model::TicketScope;
use crate::db::model::Vm;
use crate::db::model::VmState;
use crate::db::model::ZERO_UUID;
use chrono::Utc;
use std::time::Duration;
use uuid::Uuid;

/// Resource envelope of a NAT zone
const NAT_VM_RAM: u64 = 128;
const NAT_VM_QUOTA: u64 = 10;

pub fn nat_alias(fabric: Uuid) -> String {
    format!("nat-{}", fabric)
}

pub(super) fn register_actions(registry: &mut ActionRegistry) {
    registry.register("fabric.ensure_nat", |ctx| {
        Box::pin(wf_ensure_nat(ctx))
    });
    registry.register("fabric.reap_nat", |ctx| Box::pin(wf_reap_nat(ctx)));
}

async fn fabric_networks(
    ctx: &TaskContext,
) -> Result<Vec<Network>, ActionError> {
    let payload: NetworksPayload = ctx.payload()?;
    let vm = ctx.datastore.vm_fetch_required(ctx.vm_uuid()?).await?;
    let mut fabrics: Vec<Network> = Vec::new();
    for resolved in payload.networks {
        let network = resolved.network;
        if network.fabric
            && network.owner_uuid == Some(vm.owner_uuid)
            && !fabrics.iter().any(|n| n.uuid == network.uuid)
        {
            fabrics.push(network);
        }
    }
    Ok(fabrics)
}

async fn running_nat(
    ctx: &TaskContext,
    fabric: Uuid,
) -> Result<Option<Vm>, ActionError> {
    let filter = VmFilter {
        alias: Some(nat_alias(fabric)),
        state: Some(StateFilter::Active),
        ..Default::default()
    };
    let (docs, _) =
        ctx.datastore.vm_list(&filter, &ListOptions::default()).await?;
    let Some(doc) = docs.into_iter().next() else { return Ok(None) };
    let uuid = doc
        .get("uuid")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| ActionError::new("NAT VM document has no uuid"))?;
    Ok(ctx.datastore.vm_fetch(uuid).await?)
}

async fn wf_ensure_nat(ctx: &TaskContext) -> Result<(), ActionError> {
    for network in fabric_networks(ctx).await? {
        ensure_nat_for_fabric(ctx, &network).await?;
    }
    Ok(())
}

async fn ensure_nat_for_fabric(
    ctx: &TaskContext,
    network: &Network,
) -> Result<(), ActionError> {
    if let Some(nat) = running_nat(ctx, network.uuid).await? {
        if nat.state == VmState::Running {
            return Ok(());
        }
    }

    // The ticket makes sure only one of any concurrent provisions creates
    // the NAT zone for this fabric.
    let ticket = ctx
        .waitlist
        .acquire(
            TicketScope::Allocation,
            &nat_alias(network.uuid),
            ctx.job.id(),
        )
        .await;
    let result = ensure_nat_locked(ctx, network).await;
    ctx.waitlist.release(&ticket);
    result
}

async fn ensure_nat_locked(
    ctx: &TaskContext,
    network: &Network,
) -> Result<(), ActionError> {
    match running_nat(ctx, network.uuid).await? {
        Some(nat) if nat.state == VmState::Running => return Ok(()),
        Some(nat) => return wait_for_nat(ctx, nat.uuid).await,
        None => {}
    }

    let owner = network.owner_uuid.ok_or_else(|| {
        ActionError::new("fabric network has no owner to run NAT for")
    })?;
    let nat_uuid = Uuid::new_v4();
    info!(ctx.log, "provisioning fabric NAT zone";
        "fabric" => %network.uuid, "nat_vm" => %nat_uuid);

    ctx.datastore
        .vm_create(Vm {
            uuid: nat_uuid,
            owner_uuid: owner,
            brand: Brand::JoyentMinimal,
            state: VmState::Provisioning,
            alias: Some(nat_alias(network.uuid)),
            billing_id: ZERO_UUID,
            image_uuid: None,
            ram: NAT_VM_RAM,
            max_physical_memory: NAT_VM_RAM,
            quota: Some(NAT_VM_QUOTA),
            cpu_cap: None,
            cpu_shares: None,
            max_swap: None,
            max_lwps: None,
            zfs_io_priority: None,
            create_timestamp: Utc::now(),
            server_uuid: None,
            autoboot: true,
            nics: Vec::new(),
            tags: Default::default(),
            customer_metadata: Default::default(),
            internal_metadata: Default::default(),
            firewall_rules: Vec::new(),
            snapshots: Vec::new(),
            disks: None,
        })
        .await?;

    let nic = ctx
        .collab
        .napi
        .provision_nic(
            &ctx.call,
            &NicProvisionRequest {
                owner_uuid: owner,
                belongs_to_uuid: nat_uuid,
                belongs_to_type: "zone".to_string(),
                network_uuid: network.uuid,
                ip: None,
                primary: true,
            },
        )
        .await?;

    let server =
        ctx.collab.cnapi.allocate_server(&ctx.call, NAT_VM_RAM, None).await?;
    let payload = CnapiProvisionPayload {
        uuid: nat_uuid,
        owner_uuid: owner,
        brand: Brand::JoyentMinimal.to_string(),
        image_uuid: None,
        alias: Some(nat_alias(network.uuid)),
        ram: NAT_VM_RAM,
        quota: Some(NAT_VM_QUOTA),
        cpu_cap: None,
        autoboot: true,
        nics: vec![nic.clone()],
        resolvers: network.resolvers.clone(),
        routes: network.routes.clone(),
        archive_on_delete: true,
        customer_metadata: Default::default(),
        internal_metadata: Default::default(),
        disks: None,
    };
    let task_id =
        ctx.collab.cnapi.provision_vm(&ctx.call, server, &payload).await?;
    ctx.collab.cnapi.wait_task(&ctx.call, &task_id).await?;

    ctx.datastore
        .vm_apply(nat_uuid, |vm| {
            vm.server_uuid = Some(server);
            vm.state = VmState::Running;
            let mut nic = nic.to_vm_nic();
            nic.state = NicState::Running;
            vm.nics = vec![nic];
        })
        .await?;
    Ok(())
}

/// Another workflow already owns this NAT provision; wait for it to come
/// up (bounded by this task's timeout).
async fn wait_for_nat(
    ctx: &TaskContext,
    nat_uuid: Uuid,
) -> Result<(), ActionError> {
    loop {
        let nat = ctx.datastore.vm_fetch_required(nat_uuid).await?;
        match nat.state {
            VmState::Running => return Ok(()),
            VmState::Provisioning => {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            other => {
                return Err(ActionError::new(&format!(
                    "fabric NAT zone {} is in state {}",
                    nat_uuid, other
                )));
            }
        }
    }
}

/// Destroy-pipeline task: when the VM being destroyed was the fabric's
/// last dependent, destroy the fabric's NAT zone too.
async fn wf_reap_nat(ctx: &TaskContext) -> Result<(), ActionError> {
    let vm_uuid = ctx.vm_uuid()?;
    let vm = ctx.datastore.vm_fetch_required(vm_uuid).await?;
    for nic in &vm.nics {
        let Some(network) =
            ctx.collab.napi.network_get(&ctx.call, nic.network_uuid).await?
        else {
            continue;
        };
        if !network.fabric || network.owner_uuid != Some(vm.owner_uuid) {
            continue;
        }
        reap_fabric(ctx, &vm, network.uuid).await?;
    }
    Ok(())
}

async fn reap_fabric(
    ctx: &TaskContext,
    destroyed: &Vm,
    fabric: Uuid,
) -> Result<(), ActionError> {
    let alias = nat_alias(fabric);
    let filter =
        VmFilter { state: Some(StateFilter::Active), ..Default::default() };
    let (docs, _) =
        ctx.datastore.vm_list(&filter, &ListOptions::default()).await?;
    let fabric_str = fabric.to_string();
    let has_dependents = docs.iter().any(|doc| {
        let uuid = doc.get("uuid").and_then(|v| v.as_str());
        if uuid == Some(destroyed.uuid.to_string().as_str()) {
            return false;
        }
        if doc.get("alias").and_then(|v| v.as_str()) == Some(alias.as_str()) {
            return false;
        }
        doc.get("nics")
            .and_then(|v| v.as_array())
            .map(|nics| {
                nics.iter().any(|nic| {
                    nic.get("network_uuid").and_then(|v| v.as_str())
                        == Some(fabric_str.as_str())
                })
            })
            .unwrap_or(false)
    });
    if has_dependents {
        return Ok(());
    }

    let Some(nat) = running_nat(ctx, fabric).await? else { return Ok(()) };
    info!(ctx.log, "reaping fabric NAT zone";
        "fabric" => %fabric, "nat_vm" => %nat.uuid);
    if let Some(server) = nat.server_uuid {
        let task_id = ctx
            .collab
            .cnapi
            .machine_action(
                &ctx.call,
                server,
                nat.uuid,
                &MachineAction::Destroy,
            )
            .await?;
        ctx.collab.cnapi.wait_task(&ctx.call, &task_id).await?;
    }
    let records = ctx.collab.napi.nics_for_vm(&ctx.call, nat.uuid).await?;
    for record in records {
        ctx.collab.napi.delete_nic(&ctx.call, &record.mac).await?;
    }
    ctx.datastore
        .vm_apply(nat.uuid, |vm| {
            vm.state = VmState::Destroyed;
            vm.quota = None;
        })
        .await?;
    Ok(())
}
