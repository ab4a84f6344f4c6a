// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The reprovision pipeline: replace the VM's image in place

use super::ActionError;
use super::ActionRegistry;
use super::Task;
use super::TaskContext;
use super::Workflow;
use super::WorkflowBuilder;
use super::DEFAULT_TASK_TIMEOUT_SECS;
use super::KEY_CNAPI_TASK;
use crate::app::validate::NormalizedReprovision;
use crate::clients::MachineAction;

pub fn workflow() -> Workflow {
    WorkflowBuilder::new("reprovision")
        .timeout(900)
        .append(Task::new("common.validate_params", DEFAULT_TASK_TIMEOUT_SECS, 1))
        .append(Task::new("waitlist.acquire_vm_ticket", 120, 1))
        .append(Task::new("imgapi.ensure_image", 300, 1))
        .append(Task::new("imgapi.wait_image", 600, 1))
        .append(Task::new("cnapi.reprovision", 60, 1))
        .append(Task::new("cnapi.wait_task", 600, 1))
        .append(Task::new(
            "reprovision.update_vm",
            DEFAULT_TASK_TIMEOUT_SECS,
            2,
        ))
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
        .on_cancel(Task::new("vmapi.refresh_vm", 60, 1))
        .on_cancel(Task::new(
            "waitlist.release_tickets",
            DEFAULT_TASK_TIMEOUT_SECS,
            1,
        ))
        .build()
}

pub(super) fn register_actions(registry: &mut ActionRegistry) {
    registry.register("cnapi.reprovision", |ctx| {
        Box::pin(wf_cn_reprovision(ctx))
    });
    registry.register("reprovision.update_vm", |ctx| {
        Box::pin(wf_update_vm(ctx))
    });
}

async fn wf_cn_reprovision(ctx: &TaskContext) -> Result<(), ActionError> {
    let payload: NormalizedReprovision = ctx.payload()?;
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
            &MachineAction::Reprovision { image_uuid: payload.image_uuid },
        )
        .await?;
    ctx.store(KEY_CNAPI_TASK, &task_id);
    Ok(())
}

async fn wf_update_vm(ctx: &TaskContext) -> Result<(), ActionError> {
    let payload: NormalizedReprovision = ctx.payload()?;
    ctx.datastore
        .vm_apply(ctx.vm_uuid()?, |vm| {
            vm.image_uuid = Some(payload.image_uuid);
        })
        .await?;
    Ok(())
}
