// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The update pipeline: package resize, alias/autoboot/owner changes, tag
//! and metadata writes.  Tag subresource mutations ride this pipeline with
//! payloads built by the tag operations.

use super::ActionError;
use super::ActionRegistry;
use super::Task;
use super::TaskContext;
use super::Workflow;
use super::WorkflowBuilder;
use super::DEFAULT_TASK_TIMEOUT_SECS;
use super::KEY_ALLOCATION_TICKET;
use super::KEY_CNAPI_TASK;
use super::LIFECYCLE_WORKFLOW_TIMEOUT_SECS;
use crate::app::validate::NormalizedUpdate;
use crate::clients::MachineAction;
use crate::db::model::TicketScope;
use serde_json::Value;

pub fn workflow() -> Workflow {
    WorkflowBuilder::new("update")
        .timeout(LIFECYCLE_WORKFLOW_TIMEOUT_SECS)
        .append(Task::new("common.validate_params", DEFAULT_TASK_TIMEOUT_SECS, 1))
        .append(Task::new("update.acquire_allocation_ticket", 600, 1))
        .append(Task::new("waitlist.acquire_vm_ticket", 120, 1))
        .append(Task::new("cnapi.update", 60, 1))
        .append(Task::new("cnapi.wait_task", 120, 1))
        .append(Task::new("vmapi.apply_update", DEFAULT_TASK_TIMEOUT_SECS, 2))
        .append(Task::new("fwapi.update_firewall", 60, 2))
        .append(Task::new(
            "waitlist.release_allocation_ticket",
            DEFAULT_TASK_TIMEOUT_SECS,
            1,
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
    registry.register("update.acquire_allocation_ticket", |ctx| {
        Box::pin(wf_acquire_allocation_ticket(ctx))
    });
    registry.register("cnapi.update", |ctx| Box::pin(wf_cn_update(ctx)));
    registry.register("vmapi.apply_update", |ctx| {
        Box::pin(wf_apply_update(ctx))
    });
}

/// Resize-up packs more RAM onto the VM's current server; serialize the
/// capacity decision against concurrent placements on that server.
async fn wf_acquire_allocation_ticket(
    ctx: &TaskContext,
) -> Result<(), ActionError> {
    let payload: NormalizedUpdate = ctx.payload()?;
    if !payload.resize_up {
        return Ok(());
    }
    let vm = ctx.datastore.vm_fetch_required(ctx.vm_uuid()?).await?;
    let server = vm
        .server_uuid
        .ok_or_else(|| ActionError::new("VM has no server"))?;
    if ctx
        .maybe_lookup::<crate::db::model::Ticket>(KEY_ALLOCATION_TICKET)?
        .is_some()
    {
        return Ok(());
    }
    let ticket = ctx
        .waitlist
        .acquire(TicketScope::Allocation, &server.to_string(), ctx.job.id())
        .await;
    ctx.store(KEY_ALLOCATION_TICKET, &ticket);
    Ok(())
}

async fn wf_cn_update(ctx: &TaskContext) -> Result<(), ActionError> {
    let payload: NormalizedUpdate = ctx.payload()?;
    let vm_uuid = ctx.vm_uuid()?;
    let vm = ctx.datastore.vm_fetch_required(vm_uuid).await?;
    let Some(server) = vm.server_uuid else { return Ok(()) };

    let mut changes = serde_json::Map::new();
    if let Some(package) = &payload.package {
        changes.insert(
            "max_physical_memory".to_string(),
            Value::from(package.max_physical_memory),
        );
        changes.insert("quota".to_string(), Value::from(package.quota));
    }
    if let Some(autoboot) = payload.autoboot {
        changes.insert("autoboot".to_string(), Value::Bool(autoboot));
    }
    if let Some(alias) = &payload.alias {
        changes.insert("alias".to_string(), Value::String(alias.clone()));
    }
    if changes.is_empty() {
        return Ok(());
    }
    let task_id = ctx
        .collab
        .cnapi
        .machine_action(
            &ctx.call,
            server,
            vm_uuid,
            &MachineAction::Update { payload: Value::Object(changes) },
        )
        .await?;
    ctx.store(KEY_CNAPI_TASK, &task_id);
    Ok(())
}

/// Applies the normalized update to the stored VM, including the tag
/// operations, and refreshes the role-tag bucket.
async fn wf_apply_update(ctx: &TaskContext) -> Result<(), ActionError> {
    let payload: NormalizedUpdate = ctx.payload()?;
    let vm_uuid = ctx.vm_uuid()?;
    let updated = ctx
        .datastore
        .vm_apply(vm_uuid, |vm| {
            if let Some(alias) = &payload.alias {
                vm.alias = Some(alias.clone());
            }
            if let Some(autoboot) = payload.autoboot {
                vm.autoboot = autoboot;
            }
            if let Some(owner) = payload.owner_uuid {
                vm.owner_uuid = owner;
            }
            if let Some(billing_id) = payload.billing_id {
                vm.billing_id = billing_id;
            }
            if let Some(package) = &payload.package {
                vm.ram = package.max_physical_memory;
                vm.max_physical_memory = package.max_physical_memory;
                if !vm.brand.is_hvm() {
                    vm.quota = Some(package.quota);
                }
                vm.cpu_cap = package.cpu_cap.or(vm.cpu_cap);
                vm.max_swap = package.max_swap.or(vm.max_swap);
                vm.max_lwps = package.max_lwps.or(vm.max_lwps);
                vm.zfs_io_priority =
                    package.zfs_io_priority.or(vm.zfs_io_priority);
            }
            if payload.remove_all_tags {
                vm.tags.clear();
            }
            if let Some(tags) = &payload.set_tags {
                vm.tags = tags.clone();
            }
            if let Some(tags) = &payload.add_tags {
                vm.tags.extend(tags.clone());
            }
            if let Some(keys) = &payload.remove_tags {
                for key in keys {
                    vm.tags.remove(key);
                }
            }
            if let Some(metadata) = &payload.customer_metadata {
                vm.customer_metadata = metadata.clone();
            }
            if let Some(metadata) = &payload.internal_metadata {
                vm.internal_metadata = metadata.clone();
            }
        })
        .await?;

    let role_tags = updated
        .tags
        .get("role")
        .map(crate::db::filter::value_to_string)
        .map(|role| vec![role])
        .unwrap_or_default();
    ctx.datastore.role_tags_put(vm_uuid, role_tags).await?;
    Ok(())
}
