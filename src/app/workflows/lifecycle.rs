// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! start / stop / reboot pipelines

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
use crate::db::model::VmTask;

pub fn workflow(task: VmTask) -> Workflow {
    let (name, action) = match task {
        VmTask::Start => ("start", "cnapi.start"),
        VmTask::Stop => ("stop", "cnapi.stop"),
        VmTask::Reboot => ("reboot", "cnapi.reboot"),
        other => panic!("not a lifecycle task: {}", other),
    };
    WorkflowBuilder::new(name)
        .timeout(LIFECYCLE_WORKFLOW_TIMEOUT_SECS)
        .append(Task::new("common.validate_params", DEFAULT_TASK_TIMEOUT_SECS, 1))
        .append(Task::new("waitlist.acquire_vm_ticket", 120, 1))
        .append(Task::new(action, 60, 1))
        .append(Task::new("cnapi.wait_task", 120, 1))
        .append(Task::new("lifecycle.update_vm", DEFAULT_TASK_TIMEOUT_SECS, 2))
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
    registry.register("cnapi.start", |ctx| {
        Box::pin(wf_machine_action(ctx, MachineAction::Start))
    });
    registry.register("cnapi.stop", |ctx| {
        Box::pin(wf_machine_action(ctx, MachineAction::Stop))
    });
    registry.register("cnapi.reboot", |ctx| {
        Box::pin(wf_machine_action(ctx, MachineAction::Reboot))
    });
    registry.register("lifecycle.update_vm", |ctx| {
        Box::pin(wf_update_vm(ctx))
    });
}

async fn wf_machine_action(
    ctx: &TaskContext,
    action: MachineAction,
) -> Result<(), ActionError> {
    let vm_uuid = ctx.vm_uuid()?;
    let vm = ctx.datastore.vm_fetch_required(vm_uuid).await?;
    let server = vm
        .server_uuid
        .ok_or_else(|| ActionError::new("VM has no server"))?;
    let task_id = ctx
        .collab
        .cnapi
        .machine_action(&ctx.call, server, vm_uuid, &action)
        .await?;
    ctx.store(KEY_CNAPI_TASK, &task_id);
    Ok(())
}

async fn wf_update_vm(ctx: &TaskContext) -> Result<(), ActionError> {
    let vm_uuid = ctx.vm_uuid()?;
    let state = match ctx.job.snapshot().task {
        VmTask::Stop => VmState::Stopped,
        _ => VmState::Running,
    };
    ctx.datastore.vm_apply(vm_uuid, |vm| vm.state = state).await?;
    Ok(())
}
