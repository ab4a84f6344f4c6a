// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! add-nics / remove-nics pipelines
//!
//! Adding NICs pre-creates the records in NAPI before the compute node
//! learns about them; the error branch therefore removes exactly the NICs
//! this job created, never the VM's preexisting ones.

use super::ActionError;
use super::ActionRegistry;
use super::NetworksPayload;
use super::Task;
use super::TaskContext;
use super::Workflow;
use super::WorkflowBuilder;
use super::DEFAULT_TASK_TIMEOUT_SECS;
use super::KEY_CNAPI_TASK;
use super::KEY_NIC_MACS;
use super::LIFECYCLE_WORKFLOW_TIMEOUT_SECS;
use super::NAPI_CLEANUP_NICS_TIMEOUT_SECS;
use crate::app::validate::NormalizedRemoveNics;
use crate::clients::MachineAction;
use crate::db::model::NicState;
use serde_json::json;
use serde_json::Value;

pub fn add_workflow() -> Workflow {
    WorkflowBuilder::new("add-nics")
        .timeout(LIFECYCLE_WORKFLOW_TIMEOUT_SECS + 1200)
        .append(Task::new("common.validate_params", DEFAULT_TASK_TIMEOUT_SECS, 1))
        .append(Task::new("fabric.ensure_nat", 1200, 1))
        .append(Task::new("napi.provision_nics", 60, 2))
        .append(Task::new("waitlist.acquire_vm_ticket", 120, 1))
        .append(Task::new("cnapi.add_nics", 60, 1))
        .append(Task::new("cnapi.wait_task", 120, 1))
        .append(Task::new("nics.verify_update", DEFAULT_TASK_TIMEOUT_SECS, 3))
        .append(Task::new("vmapi.put_vm_nics", DEFAULT_TASK_TIMEOUT_SECS, 2))
        .append(Task::new("fwapi.update_firewall", 60, 2))
        .append(Task::new(
            "waitlist.release_vm_ticket",
            DEFAULT_TASK_TIMEOUT_SECS,
            1,
        ))
        .on_error(Task::new(
            "napi.cleanup_added_nics",
            NAPI_CLEANUP_NICS_TIMEOUT_SECS,
            1,
        ))
        .on_error(Task::new(
            "waitlist.release_tickets",
            DEFAULT_TASK_TIMEOUT_SECS,
            1,
        ))
        .on_cancel(Task::new(
            "napi.cleanup_added_nics",
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

pub fn remove_workflow() -> Workflow {
    WorkflowBuilder::new("remove-nic")
        .timeout(LIFECYCLE_WORKFLOW_TIMEOUT_SECS)
        .append(Task::new("common.validate_params", DEFAULT_TASK_TIMEOUT_SECS, 1))
        .append(Task::new("waitlist.acquire_vm_ticket", 120, 1))
        .append(Task::new("cnapi.remove_nics", 60, 1))
        .append(Task::new("cnapi.wait_task", 120, 1))
        .append(Task::new("napi.delete_removed_nics", 60, 2))
        .append(Task::new("vmapi.put_vm_nics", DEFAULT_TASK_TIMEOUT_SECS, 2))
        .append(Task::new("fwapi.update_firewall", 60, 2))
        .append(Task::new(
            "waitlist.release_vm_ticket",
            DEFAULT_TASK_TIMEOUT_SECS,
            1,
        ))
        .on_error(Task::new(
            "waitlist.release_tickets",
            DEFAULT_TASK_TIMEOUT_SECS,
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
    registry.register("cnapi.add_nics", |ctx| Box::pin(wf_cn_add_nics(ctx)));
    registry.register("cnapi.remove_nics", |ctx| {
        Box::pin(wf_cn_remove_nics(ctx))
    });
    registry.register("nics.verify_update", |ctx| {
        Box::pin(wf_verify_update(ctx))
    });
    registry.register("vmapi.put_vm_nics", |ctx| {
        Box::pin(wf_put_vm_nics(ctx))
    });
    registry.register("napi.delete_removed_nics", |ctx| {
        Box::pin(wf_delete_removed_nics(ctx))
    });
    registry.register("napi.cleanup_added_nics", |ctx| {
        Box::pin(wf_cleanup_added_nics(ctx))
    });
}

async fn cn_update_nics(
    ctx: &TaskContext,
    nics: Value,
) -> Result<(), ActionError> {
    let vm_uuid = ctx.vm_uuid()?;
    let vm = ctx.datastore.vm_fetch_required(vm_uuid).await?;
    let server = vm
        .server_uuid
        .ok_or_else(|| ActionError::new("VM has no server"))?;
    let task_id = ctx
        .collab
        .cnapi
        .machine_action(
            &ctx.call,
            server,
            vm_uuid,
            &MachineAction::Update { payload: json!({ "nics": nics }) },
        )
        .await?;
    ctx.store(KEY_CNAPI_TASK, &task_id);
    Ok(())
}

async fn wf_cn_add_nics(ctx: &TaskContext) -> Result<(), ActionError> {
    let records =
        ctx.collab.napi.nics_for_vm(&ctx.call, ctx.vm_uuid()?).await?;
    cn_update_nics(ctx, serde_json::to_value(&records).unwrap_or(Value::Null))
        .await
}

async fn wf_cn_remove_nics(ctx: &TaskContext) -> Result<(), ActionError> {
    let payload: NormalizedRemoveNics = ctx.payload()?;
    cn_update_nics(ctx, json!({ "remove": payload.macs })).await
}

/// The agent reported success; confirm NAPI now shows a NIC on every
/// requested network.
async fn wf_verify_update(ctx: &TaskContext) -> Result<(), ActionError> {
    let payload: NetworksPayload = ctx.payload()?;
    let records =
        ctx.collab.napi.nics_for_vm(&ctx.call, ctx.vm_uuid()?).await?;
    for resolved in &payload.networks {
        if !records
            .iter()
            .any(|nic| nic.network_uuid == resolved.network.uuid)
        {
            return Err(ActionError::new(&format!(
                "NIC on network {} has not appeared",
                resolved.network.uuid
            )));
        }
    }
    Ok(())
}

/// Refreshes the denormalized NIC set on the VM from the authoritative
/// NAPI records.
async fn wf_put_vm_nics(ctx: &TaskContext) -> Result<(), ActionError> {
    let vm_uuid = ctx.vm_uuid()?;
    let records = ctx.collab.napi.nics_for_vm(&ctx.call, vm_uuid).await?;
    ctx.datastore
        .vm_apply(vm_uuid, |vm| {
            vm.nics = records
                .iter()
                .map(|r| {
                    let mut nic = r.to_vm_nic();
                    nic.state = NicState::Running;
                    nic
                })
                .collect();
        })
        .await?;
    Ok(())
}

async fn wf_delete_removed_nics(ctx: &TaskContext) -> Result<(), ActionError> {
    let payload: NormalizedRemoveNics = ctx.payload()?;
    for mac in &payload.macs {
        ctx.collab.napi.delete_nic(&ctx.call, mac).await?;
    }
    Ok(())
}

/// Error-branch cleanup for add-nics: remove only the records this job
/// pre-created.
async fn wf_cleanup_added_nics(ctx: &TaskContext) -> Result<(), ActionError> {
    let Some(macs) = ctx.maybe_lookup::<Vec<String>>(KEY_NIC_MACS)? else {
        return Ok(());
    };
    for mac in &macs {
        ctx.collab.napi.delete_nic(&ctx.call, mac).await?;
    }
    let vm_uuid = ctx.vm_uuid()?;
    let records = ctx.collab.napi.nics_for_vm(&ctx.call, vm_uuid).await?;
    ctx.datastore
        .vm_apply(vm_uuid, |vm| {
            vm.nics = records.iter().map(|r| r.to_vm_nic()).collect();
        })
        .await?;
    Ok(())
}
