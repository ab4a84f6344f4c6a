// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! create / rollback / delete snapshot pipelines

use super::ActionError;
use super::ActionRegistry;
use super::Task;
use super::TaskContext;
use super::Workflow;
use super::WorkflowBuilder;
use super::DEFAULT_TASK_TIMEOUT_SECS;
use super::KEY_CNAPI_TASK;
use super::LIFECYCLE_WORKFLOW_TIMEOUT_SECS;
use crate::app::validate::NormalizedSnapshot;
use crate::clients::MachineAction;
use crate::db::model::VmSnapshot;
use crate::db::model::VmTask;
use chrono::Utc;

pub fn workflow(task: VmTask) -> Workflow {
    let (name, action) = match task {
        VmTask::Snapshot => ("snapshot", "cnapi.create_snapshot"),
        VmTask::RollbackSnapshot => ("rollback", "cnapi.rollback_snapshot"),
        VmTask::DeleteSnapshot => {
            ("delete-snapshot", "cnapi.delete_snapshot")
        }
        other => panic!("not a snapshot task: {}", other),
    };
    WorkflowBuilder::new(name)
        .timeout(LIFECYCLE_WORKFLOW_TIMEOUT_SECS)
        .append(Task::new("common.validate_params", DEFAULT_TASK_TIMEOUT_SECS, 1))
        .append(Task::new("waitlist.acquire_vm_ticket", 120, 1))
        .append(Task::new(action, 60, 1))
        .append(Task::new("cnapi.wait_task", 120, 1))
        .append(Task::new("snapshot.update_vm", DEFAULT_TASK_TIMEOUT_SECS, 2))
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
    registry.register("cnapi.create_snapshot", |ctx| {
        Box::pin(wf_snapshot_action(ctx))
    });
    registry.register("cnapi.rollback_snapshot", |ctx| {
        Box::pin(wf_snapshot_action(ctx))
    });
    registry.register("cnapi.delete_snapshot", |ctx| {
        Box::pin(wf_snapshot_action(ctx))
    });
    registry.register("snapshot.update_vm", |ctx| {
        Box::pin(wf_update_vm(ctx))
    });
}

async fn wf_snapshot_action(ctx: &TaskContext) -> Result<(), ActionError> {
    let payload: NormalizedSnapshot = ctx.payload()?;
    let vm_uuid = ctx.vm_uuid()?;
    let vm = ctx.datastore.vm_fetch_required(vm_uuid).await?;
    let server = vm
        .server_uuid
        .ok_or_else(|| ActionError::new("VM has no server"))?;
    let action = match ctx.job.snapshot().task {
        VmTask::Snapshot => {
            MachineAction::CreateSnapshot { name: payload.name.clone() }
        }
        VmTask::RollbackSnapshot => {
            MachineAction::RollbackSnapshot { name: payload.name.clone() }
        }
        VmTask::DeleteSnapshot => {
            MachineAction::DeleteSnapshot { name: payload.name.clone() }
        }
        other => {
            return Err(ActionError::new(&format!(
                "not a snapshot task: {}",
                other
            )));
        }
    };
    let task_id = ctx
        .collab
        .cnapi
        .machine_action(&ctx.call, server, vm_uuid, &action)
        .await?;
    ctx.store(KEY_CNAPI_TASK, &task_id);
    Ok(())
}

async fn wf_update_vm(ctx: &TaskContext) -> Result<(), ActionError> {
    let payload: NormalizedSnapshot = ctx.payload()?;
    let vm_uuid = ctx.vm_uuid()?;
    let task = ctx.job.snapshot().task;
    ctx.datastore
        .vm_apply(vm_uuid, |vm| match task {
            VmTask::Snapshot => {
                if !vm.snapshots.iter().any(|s| s.name == payload.name) {
                    vm.snapshots.push(VmSnapshot {
                        name: payload.name.clone(),
                        created_at: Utc::now(),
                    });
                }
            }
            VmTask::DeleteSnapshot => {
                vm.snapshots.retain(|s| s.name != payload.name);
            }
            // Rollback leaves the snapshot list as it was.
            _ => {}
        })
        .await?;
    Ok(())
}
