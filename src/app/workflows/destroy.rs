// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The destroy pipeline
//!
//! `destroyed` is terminal: the record stays retrievable by uuid but drops
//! out of active searches, and `quota` becomes null (unknown after
//! destroy).  Destroying the last VM on a fabric also reaps the fabric's
//! NAT zone.

use super::ActionError;
use super::ActionRegistry;
use super::Task;
use super::TaskContext;
use super::Workflow;
use super::WorkflowBuilder;
use super::DEFAULT_TASK_TIMEOUT_SECS;
use super::KEY_CNAPI_TASK;
use super::LIFECYCLE_WORKFLOW_TIMEOUT_SECS;
use crate::clients::MachineAction;
use crate::db::model::VmState;

pub fn workflow() -> Workflow {
    WorkflowBuilder::new("destroy")
        .timeout(LIFECYCLE_WORKFLOW_TIMEOUT_SECS + 600)
        .append(Task::new("common.validate_params", DEFAULT_TASK_TIMEOUT_SECS, 1))
        .append(Task::new("waitlist.acquire_vm_ticket", 120, 1))
        .append(Task::new("cnapi.destroy", 60, 1))
        .append(Task::new("cnapi.wait_task", 120, 1))
        .append(Task::new("napi.delete_nics", 60, 2))
        .append(Task::new("vmapi.mark_destroyed", DEFAULT_TASK_TIMEOUT_SECS, 2))
        .append(Task::new("fabric.reap_nat", 600, 1))
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
    registry.register("cnapi.destroy", |ctx| Box::pin(wf_cn_destroy(ctx)));
    registry.register("napi.delete_nics", |ctx| {
        Box::pin(wf_delete_nics(ctx))
    });
    registry.register("vmapi.mark_destroyed", |ctx| {
        Box::pin(wf_mark_destroyed(ctx))
    });
}

async fn wf_cn_destroy(ctx: &TaskContext) -> Result<(), ActionError> {
    let vm_uuid = ctx.vm_uuid()?;
    let vm = ctx.datastore.vm_fetch_required(vm_uuid).await?;
    // A VM that never reached a server has nothing to tear down.
    let Some(server) = vm.server_uuid else { return Ok(()) };
    let task_id = ctx
        .collab
        .cnapi
        .machine_action(&ctx.call, server, vm_uuid, &MachineAction::Destroy)
        .await?;
    ctx.store(KEY_CNAPI_TASK, &task_id);
    Ok(())
}

/// Every NIC with `belongs_to_uuid` = this VM is removed from NAPI.
async fn wf_delete_nics(ctx: &TaskContext) -> Result<(), ActionError> {
    let vm_uuid = ctx.vm_uuid()?;
    let records = ctx.collab.napi.nics_for_vm(&ctx.call, vm_uuid).await?;
    for record in records {
        ctx.collab.napi.delete_nic(&ctx.call, &record.mac).await?;
    }
    Ok(())
}

async fn wf_mark_destroyed(ctx: &TaskContext) -> Result<(), ActionError> {
    let vm_uuid = ctx.vm_uuid()?;
    ctx.datastore
        .vm_apply(vm_uuid, |vm| {
            vm.state = VmState::Destroyed;
            // Unknown after destroy.
            vm.quota = None;
        })
        .await?;
    ctx.datastore.role_tags_put(vm_uuid, Vec::new()).await?;
    Ok(())
}
