// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The provision pipeline
//!
//! validate → generate passwords → fabric NAT → pre-create NICs → allocate
//! a server under the allocation ticket → ensure the image on the chosen
//! CN → prepare the agent payload → provision under the VM ticket → record
//! volumes → put the VM → sync firewall → release.  The agent-provision
//! task clears `mark_as_failed_on_error` once zone creation has started;
//! the error branch only removes pre-created NICs while that flag is set.

use super::ActionError;
use super::ActionRegistry;
use super::ImagePayload;
use super::NetworksPayload;
use super::Task;
use super::TaskContext;
use super::WorkflowBuilder;
use super::CNAPI_WAIT_TASK_TIMEOUT_SECS;
use super::DEFAULT_TASK_TIMEOUT_SECS;
use super::KEY_CNAPI_TASK;
use super::KEY_NIC_MACS;
use super::KEY_SERVER_UUID;
use super::NAPI_CLEANUP_NICS_TIMEOUT_SECS;
use super::PROVISION_WORKFLOW_TIMEOUT_SECS;
use crate::app::validate::NormalizedProvision;
use crate::clients::CnapiProvisionPayload;
use crate::clients::NicProvisionRequest;
use crate::db::model::NicState;
use crate::db::model::VmState;
use crate::app::workflows::Workflow;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::Value;
use uuid::Uuid;

const KEY_IMGAPI_TASK: &str = "imgapi_task_id";
const KEY_CNAPI_PAYLOAD: &str = "cnapi_payload";

pub fn workflow() -> Workflow {
    WorkflowBuilder::new("provision")
        .timeout(PROVISION_WORKFLOW_TIMEOUT_SECS)
        .append(Task::new("common.validate_params", DEFAULT_TASK_TIMEOUT_SECS, 1))
        .append(Task::new(
            "provision.generate_passwords",
            DEFAULT_TASK_TIMEOUT_SECS,
            1,
        ))
        .append(Task::new("fabric.ensure_nat", 1200, 1))
        .append(Task::new("napi.provision_nics", 60, 2))
        .append(Task::new("waitlist.acquire_allocation_ticket", 600, 1))
        .append(Task::new("cnapi.allocate_server", 60, 1))
        .append(Task::new(
            "waitlist.release_allocation_ticket",
            DEFAULT_TASK_TIMEOUT_SECS,
            1,
        ))
        .append(Task::new("imgapi.ensure_image", 300, 1))
        .append(Task::new("imgapi.wait_image", 600, 1))
        .append(Task::new(
            "provision.prepare_payload",
            DEFAULT_TASK_TIMEOUT_SECS,
            1,
        ))
        .append(Task::new("waitlist.acquire_vm_ticket", 600, 1))
        .append(Task::new("cnapi.provision", 300, 1))
        .append(Task::new("cnapi.wait_task", CNAPI_WAIT_TASK_TIMEOUT_SECS, 1))
        .append(Task::new("volapi.add_references", 60, 2))
        .append(Task::new("vmapi.put_vm", 60, 2))
        .append(Task::new("fwapi.add_rules", 60, 2))
        .append(Task::new("fwapi.update_firewall", 60, 2))
        .append(Task::new(
            "waitlist.release_vm_ticket",
            DEFAULT_TASK_TIMEOUT_SECS,
            1,
        ))
        .on_error(Task::new(
            "napi.cleanup_nics",
            NAPI_CLEANUP_NICS_TIMEOUT_SECS,
            1,
        ))
        .on_error(Task::new(
            "waitlist.release_tickets",
            DEFAULT_TASK_TIMEOUT_SECS,
            1,
        ))
        .on_cancel(Task::new(
            "napi.cleanup_nics",
            NAPI_CLEANUP_NICS_TIMEOUT_SECS,
            1,
        ))
        .on_cancel(Task::new(
            "waitlist.release_tickets",
            DEFAULT_TASK_TIMEOUT_SECS,
            1,
        ))
        .build()
}

pub(super) fn register_actions(registry: &mut ActionRegistry) {
    registry.register("provision.generate_passwords", |ctx| {
        Box::pin(wf_generate_passwords(ctx))
    });
    registry.register("napi.provision_nics", |ctx| {
        Box::pin(wf_provision_nics(ctx))
    });
    registry.register("cnapi.allocate_server", |ctx| {
        Box::pin(wf_allocate_server(ctx))
    });
    registry.register("imgapi.ensure_image", |ctx| {
        Box::pin(wf_ensure_image(ctx))
    });
    registry.register("imgapi.wait_image", |ctx| Box::pin(wf_wait_image(ctx)));
    registry.register("provision.prepare_payload", |ctx| {
        Box::pin(wf_prepare_payload(ctx))
    });
    registry.register("cnapi.provision", |ctx| Box::pin(wf_cn_provision(ctx)));
    registry.register("volapi.add_references", |ctx| {
        Box::pin(wf_add_volume_references(ctx))
    });
    registry.register("vmapi.put_vm", |ctx| Box::pin(wf_put_vm(ctx)));
    registry.register("fwapi.add_rules", |ctx| Box::pin(wf_add_rules(ctx)));
    registry.register("napi.cleanup_nics", |ctx| {
        Box::pin(wf_cleanup_nics(ctx))
    });
}

/// Images that declare `generate_passwords` get credentials minted into
/// `internal_metadata` before the zone boots.
async fn wf_generate_passwords(ctx: &TaskContext) -> Result<(), ActionError> {
    let payload: NormalizedProvision = ctx.payload()?;
    if !payload.generate_passwords {
        return Ok(());
    }
    let vm_uuid = ctx.vm_uuid()?;
    let mint = || {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect::<String>()
    };
    let root_pw = mint();
    let admin_pw = mint();
    ctx.datastore
        .vm_apply(vm_uuid, |vm| {
            vm.internal_metadata
                .entry("root_pw".to_string())
                .or_insert_with(|| Value::String(root_pw.clone()));
            vm.internal_metadata
                .entry("admin_pw".to_string())
                .or_insert_with(|| Value::String(admin_pw.clone()));
        })
        .await?;
    Ok(())
}

/// Pre-creates the NIC records in NAPI.  Idempotent: networks that already
/// have a NIC for this VM are left alone.
async fn wf_provision_nics(ctx: &TaskContext) -> Result<(), ActionError> {
    let payload: NetworksPayload = ctx.payload()?;
    let vm_uuid = ctx.vm_uuid()?;
    let vm = ctx.datastore.vm_fetch_required(vm_uuid).await?;
    let existing = ctx.collab.napi.nics_for_vm(&ctx.call, vm_uuid).await?;

    let mut created = Vec::new();
    for resolved in &payload.networks {
        if existing
            .iter()
            .any(|nic| nic.network_uuid == resolved.network.uuid)
        {
            continue;
        }
        let record = ctx
            .collab
            .napi
            .provision_nic(
                &ctx.call,
                &NicProvisionRequest {
                    owner_uuid: vm.owner_uuid,
                    belongs_to_uuid: vm_uuid,
                    belongs_to_type: "zone".to_string(),
                    network_uuid: resolved.network.uuid,
                    ip: resolved.requested_ip.clone(),
                    primary: resolved.primary,
                },
            )
            .await?;
        created.push(record.mac.clone());
    }
    ctx.store(KEY_NIC_MACS, &created);

    let records = ctx.collab.napi.nics_for_vm(&ctx.call, vm_uuid).await?;
    ctx.datastore
        .vm_apply(vm_uuid, |vm| {
            vm.nics = records.iter().map(|r| r.to_vm_nic()).collect();
        })
        .await?;
    Ok(())
}

async fn wf_allocate_server(ctx: &TaskContext) -> Result<(), ActionError> {
    let payload: NormalizedProvision = ctx.payload()?;
    let vm_uuid = ctx.vm_uuid()?;
    let vm = ctx.datastore.vm_fetch_required(vm_uuid).await?;
    let server = match vm.server_uuid.or(payload.server_uuid) {
        Some(server) => server,
        None => {
            ctx.collab
                .cnapi
                .allocate_server(
                    &ctx.call,
                    payload.ram,
                    payload.locality.as_ref(),
                )
                .await?
        }
    };
    ctx.store(KEY_SERVER_UUID, &server);
    ctx.datastore
        .vm_apply(vm_uuid, |vm| vm.server_uuid = Some(server))
        .await?;
    Ok(())
}

async fn wf_ensure_image(ctx: &TaskContext) -> Result<(), ActionError> {
    let payload: ImagePayload = ctx.payload()?;
    let Some(image_uuid) = payload.image_uuid else { return Ok(()) };
    let server = match ctx.maybe_lookup::<Uuid>(KEY_SERVER_UUID)? {
        Some(server) => server,
        None => {
            let vm = ctx.datastore.vm_fetch_required(ctx.vm_uuid()?).await?;
            vm.server_uuid
                .ok_or_else(|| ActionError::new("VM has no server"))?
        }
    };
    let task_id =
        ctx.collab.imgapi.ensure_image(&ctx.call, server, image_uuid).await?;
    ctx.store(KEY_IMGAPI_TASK, &task_id);
    Ok(())
}

async fn wf_wait_image(ctx: &TaskContext) -> Result<(), ActionError> {
    let Some(task_id) = ctx.maybe_lookup::<String>(KEY_IMGAPI_TASK)? else {
        return Ok(());
    };
    ctx.collab.imgapi.wait_image(&ctx.call, &task_id).await?;
    ctx.take(KEY_IMGAPI_TASK);
    Ok(())
}

/// Assembles the agent payload: resolvers and routes from the NIC set,
/// `archive_on_delete` applied, `internal_metadata.set_resolvers=false`
/// honored.
async fn wf_prepare_payload(ctx: &TaskContext) -> Result<(), ActionError> {
    let payload: NormalizedProvision = ctx.payload()?;
    let vm_uuid = ctx.vm_uuid()?;
    let vm = ctx.datastore.vm_fetch_required(vm_uuid).await?;

    let set_resolvers = !matches!(
        payload.internal_metadata.get("set_resolvers"),
        Some(Value::Bool(false))
    );
    let mut resolvers = Vec::new();
    let mut routes = std::collections::BTreeMap::new();
    for resolved in &payload.networks {
        if set_resolvers {
            for resolver in &resolved.network.resolvers {
                if !resolvers.contains(resolver) {
                    resolvers.push(resolver.clone());
                }
            }
        }
        routes.extend(resolved.network.routes.clone());
    }

    let nics = ctx.collab.napi.nics_for_vm(&ctx.call, vm_uuid).await?;
    let cn_payload = CnapiProvisionPayload {
        uuid: vm_uuid,
        owner_uuid: payload.owner_uuid,
        brand: payload.brand.to_string(),
        image_uuid: payload.image_uuid,
        alias: payload.alias.clone(),
        ram: payload.ram,
        quota: payload.quota,
        cpu_cap: payload.cpu_cap,
        autoboot: payload.autoboot,
        nics,
        resolvers,
        routes,
        archive_on_delete: true,
        customer_metadata: payload.customer_metadata.clone(),
        internal_metadata: vm.internal_metadata.clone(),
        disks: payload.disks.clone(),
    };
    ctx.store(KEY_CNAPI_PAYLOAD, &cn_payload);
    Ok(())
}

async fn wf_cn_provision(ctx: &TaskContext) -> Result<(), ActionError> {
    let cn_payload: CnapiProvisionPayload = ctx.lookup(KEY_CNAPI_PAYLOAD)?;
    let server: Uuid = ctx.lookup(KEY_SERVER_UUID)?;
    let task_id =
        ctx.collab.cnapi.provision_vm(&ctx.call, server, &cn_payload).await?;
    // Physical zone creation has started: a failure past this point must
    // not tear down NIC records behind the zone's back.
    ctx.job.update(|job| job.mark_as_failed_on_error = false);
    ctx.store(KEY_CNAPI_TASK, &task_id);
    Ok(())
}

async fn wf_add_volume_references(ctx: &TaskContext) -> Result<(), ActionError> {
    let payload: NormalizedProvision = ctx.payload()?;
    for volume in &payload.volumes {
        ctx.collab
            .volapi
            .add_reference(
                &ctx.call,
                volume,
                payload.owner_uuid,
                payload.vm_uuid,
            )
            .await?;
    }
    Ok(())
}

/// Finalizes the stored VM: the zone exists, NICs are live, and the state
/// reflects `autoboot`.
async fn wf_put_vm(ctx: &TaskContext) -> Result<(), ActionError> {
    let payload: NormalizedProvision = ctx.payload()?;
    let vm_uuid = ctx.vm_uuid()?;
    let records = ctx.collab.napi.nics_for_vm(&ctx.call, vm_uuid).await?;
    ctx.datastore
        .vm_apply(vm_uuid, |vm| {
            vm.state = if payload.autoboot {
                VmState::Running
            } else {
                VmState::Stopped
            };
            vm.nics = records
                .iter()
                .map(|r| {
                    let mut nic = r.to_vm_nic();
                    nic.state = NicState::Running;
                    nic
                })
                .collect();
            vm.firewall_rules = payload.firewall_rules.clone();
        })
        .await?;
    Ok(())
}

async fn wf_add_rules(ctx: &TaskContext) -> Result<(), ActionError> {
    let payload: NormalizedProvision = ctx.payload()?;
    if payload.firewall_rules.is_empty() {
        return Ok(());
    }
    ctx.collab
        .fwapi
        .add_rules(&ctx.call, &payload.firewall_rules)
        .await?;
    Ok(())
}

/// Error-branch cleanup: remove the NIC records pre-created in NAPI, but
/// only while the job may still be marked failed.  Once the physical zone
/// exists the NICs stay for a later sync to reconcile.
async fn wf_cleanup_nics(ctx: &TaskContext) -> Result<(), ActionError> {
    if !ctx.job.snapshot().mark_as_failed_on_error {
        return Ok(());
    }
    let vm_uuid = ctx.vm_uuid()?;
    let records = ctx.collab.napi.nics_for_vm(&ctx.call, vm_uuid).await?;
    for record in records {
        ctx.collab.napi.delete_nic(&ctx.call, &record.mac).await?;
    }
    ctx.datastore.vm_apply(vm_uuid, |vm| vm.nics.clear()).await?;
    Ok(())
}
