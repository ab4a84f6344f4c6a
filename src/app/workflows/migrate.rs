// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! migrate-begin / migrate-sync / migrate-switch / migrate-abort pipelines
//!
//! Begin reserves a target and provisions the target zone while the VM
//! keeps serving (the VM ticket is released right after the initial
//! migration record lands, so other operations may proceed during the
//! copy).  Sync drives the incremental replication processes.  Switch
//! stops the source, reserves the network addresses on the target, swaps
//! `server_uuid`, and starts the target.

use super::ActionError;
use super::ActionRegistry;
use super::Task;
use super::TaskContext;
use super::Workflow;
use super::WorkflowBuilder;
use super::DEFAULT_TASK_TIMEOUT_SECS;
use super::KEY_CNAPI_TASK;
use super::KEY_SERVER_UUID;
use crate::app::validate::NormalizedMigrate;
use crate::clients::CnapiProvisionPayload;
use crate::clients::MachineAction;
use crate::db::model::Migration;
use crate::db::model::MigrationPhase;
use crate::db::model::MigrationState;
use crate::db::model::VmState;
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

const KEY_MIGRATION_ID: &str = "migration_id";
const KEY_TARGET_PAYLOAD: &str = "target_payload";

pub fn begin_workflow() -> Workflow {
    WorkflowBuilder::new("migrate-begin")
        .timeout(3810)
        .append(Task::new("common.validate_params", DEFAULT_TASK_TIMEOUT_SECS, 1))
        .append(Task::new("migrate.source_filesystem_details", 60, 2))
        .append(Task::new(
            "migrate.create_target_payload",
            DEFAULT_TASK_TIMEOUT_SECS,
            1,
        ))
        .append(Task::new("waitlist.acquire_allocation_ticket", 600, 1))
        .append(Task::new("cnapi.allocate_target", 60, 1))
        .append(Task::new(
            "waitlist.release_allocation_ticket",
            DEFAULT_TASK_TIMEOUT_SECS,
            1,
        ))
        .append(Task::new("waitlist.acquire_vm_ticket", 600, 1))
        .append(Task::new(
            "migrate.store_initial_record",
            DEFAULT_TASK_TIMEOUT_SECS,
            2,
        ))
        // Concurrent VM operations are permitted during the long copy.
        .append(Task::new(
            "waitlist.release_vm_ticket",
            DEFAULT_TASK_TIMEOUT_SECS,
            1,
        ))
        .append(Task::new("cnapi.provision_target", 300, 1))
        .append(Task::new("cnapi.wait_task", 3600, 1))
        .append(Task::new(
            "migrate.set_create_timestamp",
            DEFAULT_TASK_TIMEOUT_SECS,
            1,
        ))
        .append(Task::new("migrate.target_filesystem_details", 60, 2))
        .append(Task::new("migrate.remove_quotas", 60, 1))
        .append(Task::new("migrate.store_success", DEFAULT_TASK_TIMEOUT_SECS, 2))
        .on_error(Task::new(
            "migrate.store_failure",
            DEFAULT_TASK_TIMEOUT_SECS,
            1,
        ))
        .on_error(Task::new(
            "waitlist.release_tickets",
            DEFAULT_TASK_TIMEOUT_SECS,
            1,
        ))
        .on_cancel(Task::new(
            "migrate.store_failure",
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

pub fn sync_workflow() -> Workflow {
    WorkflowBuilder::new("migrate-sync")
        .timeout(3810)
        .append(Task::new("common.validate_params", DEFAULT_TASK_TIMEOUT_SECS, 1))
        .append(Task::new("waitlist.acquire_vm_ticket", 600, 1))
        .append(Task::new("migrate.cleanup_stale_sync", 60, 1))
        .append(Task::new(
            "migrate.store_initial_record",
            DEFAULT_TASK_TIMEOUT_SECS,
            2,
        ))
        .append(Task::new(
            "waitlist.release_vm_ticket",
            DEFAULT_TASK_TIMEOUT_SECS,
            1,
        ))
        .append(Task::new("migrate.start_source_process", 60, 2))
        .append(Task::new("migrate.start_target_process", 60, 2))
        .append(Task::new(
            "migrate.record_process_details",
            DEFAULT_TASK_TIMEOUT_SECS,
            2,
        ))
        .append(Task::new("migrate.run_sync", 3600, 1))
        .append(Task::new("migrate.store_success", DEFAULT_TASK_TIMEOUT_SECS, 2))
        .on_error(Task::new(
            "migrate.store_failure",
            DEFAULT_TASK_TIMEOUT_SECS,
            1,
        ))
        .on_error(Task::new(
            "waitlist.release_tickets",
            DEFAULT_TASK_TIMEOUT_SECS,
            1,
        ))
        .on_cancel(Task::new(
            "migrate.store_failure",
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

pub fn switch_workflow() -> Workflow {
    WorkflowBuilder::new("migrate-switch")
        .timeout(1800)
        .append(Task::new("common.validate_params", DEFAULT_TASK_TIMEOUT_SECS, 1))
        .append(Task::new("migrate.stop_source", 120, 1))
        .append(Task::new("migrate.final_sync", 600, 1))
        .append(Task::new("waitlist.acquire_vm_ticket", 600, 1))
        .append(Task::new(
            "migrate.store_initial_record",
            DEFAULT_TASK_TIMEOUT_SECS,
            2,
        ))
        .append(Task::new("migrate.ensure_stopped", 120, 1))
        .append(Task::new("napi.reserve_target_ips", 60, 2))
        .append(Task::new(
            "migrate.store_reservation",
            DEFAULT_TASK_TIMEOUT_SECS,
            2,
        ))
        .append(Task::new("migrate.copy_core_filesystem", 600, 1))
        .append(Task::new("migrate.setup_target_filesystem", 120, 1))
        .append(Task::new("migrate.set_target_autoboot", 60, 1))
        .append(Task::new("migrate.set_source_dni", 60, 1))
        .append(Task::new(
            "vmapi.swap_server_uuid",
            DEFAULT_TASK_TIMEOUT_SECS,
            2,
        ))
        .append(Task::new("migrate.clear_target_dni", 60, 1))
        .append(Task::new("migrate.store_success", DEFAULT_TASK_TIMEOUT_SECS, 2))
        .append(Task::new(
            "waitlist.release_vm_ticket",
            DEFAULT_TASK_TIMEOUT_SECS,
            1,
        ))
        .append(Task::new("migrate.start_target", 120, 1))
        .on_error(Task::new(
            "migrate.store_failure",
            DEFAULT_TASK_TIMEOUT_SECS,
            1,
        ))
        .on_error(Task::new("napi.unreserve_ips", 60, 1))
        .on_error(Task::new("migrate.restart_source", 120, 1))
        .on_error(Task::new(
            "waitlist.release_tickets",
            DEFAULT_TASK_TIMEOUT_SECS,
            1,
        ))
        .on_cancel(Task::new(
            "migrate.store_failure",
            DEFAULT_TASK_TIMEOUT_SECS,
            1,
        ))
        .on_cancel(Task::new("napi.unreserve_ips", 60, 1))
        .on_cancel(Task::new("migrate.restart_source", 120, 1))
        .on_cancel(Task::new(
            "waitlist.release_tickets",
            DEFAULT_TASK_TIMEOUT_SECS,
            1,
        ))
        .build()
}

pub fn abort_workflow() -> Workflow {
    WorkflowBuilder::new("migrate-abort")
        .timeout(900)
        .append(Task::new("common.validate_params", DEFAULT_TASK_TIMEOUT_SECS, 1))
        .append(Task::new("waitlist.acquire_vm_ticket", 600, 1))
        .append(Task::new(
            "migrate.store_initial_record",
            DEFAULT_TASK_TIMEOUT_SECS,
            2,
        ))
        .append(Task::new("migrate.restart_source", 120, 1))
        .append(Task::new("migrate.store_success", DEFAULT_TASK_TIMEOUT_SECS, 2))
        .append(Task::new(
            "waitlist.release_vm_ticket",
            DEFAULT_TASK_TIMEOUT_SECS,
            1,
        ))
        .on_error(Task::new(
            "migrate.store_failure",
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
    registry.register("migrate.source_filesystem_details", |ctx| {
        Box::pin(wf_source_filesystem_details(ctx))
    });
    registry.register("migrate.create_target_payload", |ctx| {
        Box::pin(wf_create_target_payload(ctx))
    });
    registry.register("cnapi.allocate_target", |ctx| {
        Box::pin(wf_allocate_target(ctx))
    });
    registry.register("migrate.store_initial_record", |ctx| {
        Box::pin(wf_store_initial_record(ctx))
    });
    registry.register("cnapi.provision_target", |ctx| {
        Box::pin(wf_provision_target(ctx))
    });
    registry.register("migrate.set_create_timestamp", |ctx| {
        Box::pin(wf_set_create_timestamp(ctx))
    });
    registry.register("migrate.target_filesystem_details", |ctx| {
        Box::pin(wf_target_filesystem_details(ctx))
    });
    registry.register("migrate.remove_quotas", |ctx| {
        Box::pin(wf_remove_quotas(ctx))
    });
    registry.register("migrate.store_success", |ctx| {
        Box::pin(wf_store_success(ctx))
    });
    registry.register("migrate.store_failure", |ctx| {
        Box::pin(wf_store_failure(ctx))
    });
    registry.register("migrate.cleanup_stale_sync", |ctx| {
        Box::pin(wf_cleanup_stale_sync(ctx))
    });
    registry.register("migrate.start_source_process", |ctx| {
        Box::pin(wf_start_source_process(ctx))
    });
    registry.register("migrate.start_target_process", |ctx| {
        Box::pin(wf_start_target_process(ctx))
    });
    registry.register("migrate.record_process_details", |ctx| {
        Box::pin(wf_record_process_details(ctx))
    });
    registry.register("migrate.run_sync", |ctx| Box::pin(wf_run_sync(ctx)));
    registry.register("migrate.stop_source", |ctx| {
        Box::pin(wf_stop_source(ctx))
    });
    registry.register("migrate.final_sync", |ctx| Box::pin(wf_run_sync(ctx)));
    registry.register("migrate.ensure_stopped", |ctx| {
        Box::pin(wf_ensure_stopped(ctx))
    });
    registry.register("napi.reserve_target_ips", |ctx| {
        Box::pin(wf_reserve_target_ips(ctx))
    });
    registry.register("migrate.store_reservation", |ctx| {
        Box::pin(wf_store_reservation(ctx))
    });
    registry.register("migrate.copy_core_filesystem", |ctx| {
        Box::pin(wf_copy_core_filesystem(ctx))
    });
    registry.register("migrate.setup_target_filesystem", |ctx| {
        Box::pin(wf_setup_target_filesystem(ctx))
    });
    registry.register("migrate.set_target_autoboot", |ctx| {
        Box::pin(wf_set_target_autoboot(ctx))
    });
    registry.register("migrate.set_source_dni", |ctx| {
        Box::pin(wf_set_source_dni(ctx))
    });
    registry.register("vmapi.swap_server_uuid", |ctx| {
        Box::pin(wf_swap_server_uuid(ctx))
    });
    registry.register("migrate.clear_target_dni", |ctx| {
        Box::pin(wf_clear_target_dni(ctx))
    });
    registry.register("migrate.start_target", |ctx| {
        Box::pin(wf_start_target(ctx))
    });
    registry.register("napi.unreserve_ips", |ctx| {
        Box::pin(wf_unreserve_ips(ctx))
    });
    registry.register("migrate.restart_source", |ctx| {
        Box::pin(wf_restart_source(ctx))
    });
}

/// The most recent migration record for this VM, which later phases read
/// their source/target placement from.
async fn latest_migration(
    ctx: &TaskContext,
) -> Result<Option<Migration>, ActionError> {
    let records =
        ctx.datastore.migrations_for_vm(ctx.vm_uuid()?).await?;
    Ok(records.into_iter().max_by_key(|m| m.created_at))
}

async fn required_migration(ctx: &TaskContext) -> Result<Migration, ActionError> {
    latest_migration(ctx)
        .await?
        .ok_or_else(|| ActionError::new("VM has no migration record"))
}

async fn source_server(ctx: &TaskContext) -> Result<Uuid, ActionError> {
    required_migration(ctx).await.map(|m| m.source_server_uuid)
}

async fn target_server(ctx: &TaskContext) -> Result<Uuid, ActionError> {
    let migration = required_migration(ctx).await?;
    migration
        .target_server_uuid
        .ok_or_else(|| ActionError::new("migration has no target server"))
}

async fn machine_task(
    ctx: &TaskContext,
    server: Uuid,
    action: MachineAction,
) -> Result<(), ActionError> {
    let task_id = ctx
        .collab
        .cnapi
        .machine_action(&ctx.call, server, ctx.vm_uuid()?, &action)
        .await?;
    ctx.collab.cnapi.wait_task(&ctx.call, &task_id).await?;
    Ok(())
}

async fn wf_source_filesystem_details(
    ctx: &TaskContext,
) -> Result<(), ActionError> {
    let vm_uuid = ctx.vm_uuid()?;
    let vm = ctx.datastore.vm_fetch_required(vm_uuid).await?;
    let server = vm
        .server_uuid
        .ok_or_else(|| ActionError::new("VM has no server"))?;
    let details =
        ctx.collab.cnapi.filesystem_details(&ctx.call, server, vm_uuid).await?;
    ctx.store("source_filesystem", &details);
    Ok(())
}

async fn wf_create_target_payload(ctx: &TaskContext) -> Result<(), ActionError> {
    let vm_uuid = ctx.vm_uuid()?;
    let vm = ctx.datastore.vm_fetch_required(vm_uuid).await?;
    let nics = ctx.collab.napi.nics_for_vm(&ctx.call, vm_uuid).await?;
    let payload = CnapiProvisionPayload {
        uuid: vm.uuid,
        owner_uuid: vm.owner_uuid,
        brand: vm.brand.to_string(),
        image_uuid: vm.image_uuid,
        alias: vm.alias.clone(),
        ram: vm.ram,
        quota: vm.quota,
        cpu_cap: vm.cpu_cap,
        // The target must not boot until the switch phase.
        autoboot: false,
        nics,
        resolvers: Vec::new(),
        routes: Default::default(),
        archive_on_delete: true,
        customer_metadata: vm.customer_metadata.clone(),
        internal_metadata: vm.internal_metadata.clone(),
        disks: vm.disks.clone(),
    };
    ctx.store(KEY_TARGET_PAYLOAD, &payload);
    Ok(())
}

async fn wf_allocate_target(ctx: &TaskContext) -> Result<(), ActionError> {
    let vm = ctx.datastore.vm_fetch_required(ctx.vm_uuid()?).await?;
    // Keep the target off the source server.
    let locality = crate::clients::Locality {
        strict: true,
        near: Vec::new(),
        far: vm.server_uuid.into_iter().collect(),
    };
    let server = ctx
        .collab
        .cnapi
        .allocate_server(&ctx.call, vm.ram, Some(&locality))
        .await?;
    ctx.store(KEY_SERVER_UUID, &server);
    Ok(())
}

async fn wf_store_initial_record(ctx: &TaskContext) -> Result<(), ActionError> {
    let payload: NormalizedMigrate = ctx.payload()?;
    let vm_uuid = ctx.vm_uuid()?;
    let vm = ctx.datastore.vm_fetch_required(vm_uuid).await?;
    // Idempotent under retry.
    if ctx.maybe_lookup::<Uuid>(KEY_MIGRATION_ID)?.is_some() {
        return Ok(());
    }
    let (source, target) = match payload.phase {
        MigrationPhase::Begin => (
            vm.server_uuid
                .ok_or_else(|| ActionError::new("VM has no server"))?,
            ctx.maybe_lookup::<Uuid>(KEY_SERVER_UUID)?,
        ),
        _ => {
            let previous = required_migration(ctx).await?;
            (previous.source_server_uuid, previous.target_server_uuid)
        }
    };
    let migration = Migration {
        id: Uuid::new_v4(),
        vm_uuid,
        phase: payload.phase,
        state: MigrationState::Running,
        source_server_uuid: source,
        target_server_uuid: target,
        automatic: payload.automatic,
        created_at: Utc::now(),
        finished_at: None,
        process_details: None,
    };
    ctx.store(KEY_MIGRATION_ID, &migration.id);
    ctx.datastore.migration_insert(migration).await?;
    Ok(())
}

async fn update_migration<F>(
    ctx: &TaskContext,
    update: F,
) -> Result<(), ActionError>
where
    F: FnOnce(&mut Migration),
{
    let mut migration = required_migration(ctx).await?;
    update(&mut migration);
    ctx.datastore.migration_update(migration).await?;
    Ok(())
}

async fn wf_provision_target(ctx: &TaskContext) -> Result<(), ActionError> {
    let payload: CnapiProvisionPayload = ctx.lookup(KEY_TARGET_PAYLOAD)?;
    let server = target_server(ctx).await?;
    let task_id =
        ctx.collab.cnapi.provision_vm(&ctx.call, server, &payload).await?;
    ctx.store(KEY_CNAPI_TASK, &task_id);
    Ok(())
}

async fn wf_set_create_timestamp(ctx: &TaskContext) -> Result<(), ActionError> {
    // The target zone must present the same create time as the source.
    let vm = ctx.datastore.vm_fetch_required(ctx.vm_uuid()?).await?;
    ctx.store("target_create_timestamp", &vm.create_timestamp);
    Ok(())
}

async fn wf_target_filesystem_details(
    ctx: &TaskContext,
) -> Result<(), ActionError> {
    let server = target_server(ctx).await?;
    let details = ctx
        .collab
        .cnapi
        .filesystem_details(&ctx.call, server, ctx.vm_uuid()?)
        .await?;
    ctx.store("target_filesystem", &details);
    Ok(())
}

/// Replication must not trip over filesystem quotas on either side.
async fn wf_remove_quotas(ctx: &TaskContext) -> Result<(), ActionError> {
    let vm_uuid = ctx.vm_uuid()?;
    let source = source_server(ctx).await?;
    ctx.collab.cnapi.remove_quota(&ctx.call, source, vm_uuid).await?;
    let target = target_server(ctx).await?;
    ctx.collab.cnapi.remove_quota(&ctx.call, target, vm_uuid).await?;
    Ok(())
}

async fn wf_store_success(ctx: &TaskContext) -> Result<(), ActionError> {
    update_migration(ctx, |migration| {
        migration.state = MigrationState::Successful;
        migration.finished_at = Some(Utc::now());
    })
    .await
}

async fn wf_store_failure(ctx: &TaskContext) -> Result<(), ActionError> {
    // Branch task; the record may not exist if validation failed early.
    if latest_migration(ctx).await?.is_none() {
        return Ok(());
    }
    update_migration(ctx, |migration| {
        if migration.state == MigrationState::Running {
            migration.state = MigrationState::Failed;
            migration.finished_at = Some(Utc::now());
        }
    })
    .await
}

async fn wf_cleanup_stale_sync(ctx: &TaskContext) -> Result<(), ActionError> {
    // Any replication processes left over from an interrupted sync die
    // with this marker; the agents tear down by process details.
    update_migration(ctx, |migration| {
        migration.process_details = None;
    })
    .await
}

async fn wf_start_source_process(ctx: &TaskContext) -> Result<(), ActionError> {
    let server = source_server(ctx).await?;
    let details =
        ctx.collab.cnapi.filesystem_details(&ctx.call, server, ctx.vm_uuid()?).await?;
    ctx.store("source_process", &json!({ "server": server, "fs": details }));
    Ok(())
}

async fn wf_start_target_process(ctx: &TaskContext) -> Result<(), ActionError> {
    let server = target_server(ctx).await?;
    let details =
        ctx.collab.cnapi.filesystem_details(&ctx.call, server, ctx.vm_uuid()?).await?;
    ctx.store("target_process", &json!({ "server": server, "fs": details }));
    Ok(())
}

async fn wf_record_process_details(ctx: &TaskContext) -> Result<(), ActionError> {
    let source: serde_json::Value = ctx.lookup("source_process")?;
    let target: serde_json::Value = ctx.lookup("target_process")?;
    update_migration(ctx, |migration| {
        migration.process_details =
            Some(json!({ "source": source, "target": target }));
    })
    .await
}

async fn wf_run_sync(ctx: &TaskContext) -> Result<(), ActionError> {
    let vm_uuid = ctx.vm_uuid()?;
    let source = source_server(ctx).await?;
    let target = target_server(ctx).await?;
    // The replication runs between the two agents; both must stay
    // reachable for the duration.
    ctx.collab.cnapi.filesystem_details(&ctx.call, source, vm_uuid).await?;
    ctx.collab.cnapi.filesystem_details(&ctx.call, target, vm_uuid).await?;
    Ok(())
}

async fn wf_stop_source(ctx: &TaskContext) -> Result<(), ActionError> {
    let source = source_server(ctx).await?;
    machine_task(ctx, source, MachineAction::Stop).await?;
    ctx.datastore
        .vm_apply(ctx.vm_uuid()?, |vm| vm.state = VmState::Stopped)
        .await?;
    Ok(())
}

async fn wf_ensure_stopped(ctx: &TaskContext) -> Result<(), ActionError> {
    let vm_uuid = ctx.vm_uuid()?;
    let source = source_server(ctx).await?;
    if let Some(status) =
        ctx.collab.cnapi.vm_status(&ctx.call, source, vm_uuid).await?
    {
        if status.state != VmState::Stopped {
            machine_task(ctx, source, MachineAction::Stop).await?;
        }
    }
    Ok(())
}

async fn wf_reserve_target_ips(ctx: &TaskContext) -> Result<(), ActionError> {
    let vm = ctx.datastore.vm_fetch_required(ctx.vm_uuid()?).await?;
    for nic in &vm.nics {
        if let Some(ip) = &nic.ip {
            ctx.collab
                .napi
                .reserve_ip(&ctx.call, nic.network_uuid, ip)
                .await?;
        }
    }
    Ok(())
}

async fn wf_store_reservation(ctx: &TaskContext) -> Result<(), ActionError> {
    let vm = ctx.datastore.vm_fetch_required(ctx.vm_uuid()?).await?;
    let ips: Vec<String> =
        vm.nics.iter().filter_map(|nic| nic.ip.clone()).collect();
    update_migration(ctx, |migration| {
        let mut details =
            migration.process_details.take().unwrap_or_else(|| json!({}));
        details["reserved_ips"] = json!(ips);
        migration.process_details = Some(details);
    })
    .await
}

async fn wf_copy_core_filesystem(ctx: &TaskContext) -> Result<(), ActionError> {
    let target = target_server(ctx).await?;
    ctx.collab
        .cnapi
        .filesystem_details(&ctx.call, target, ctx.vm_uuid()?)
        .await?;
    Ok(())
}

async fn wf_setup_target_filesystem(
    ctx: &TaskContext,
) -> Result<(), ActionError> {
    let target = target_server(ctx).await?;
    ctx.collab
        .cnapi
        .filesystem_details(&ctx.call, target, ctx.vm_uuid()?)
        .await?;
    Ok(())
}

async fn wf_set_target_autoboot(ctx: &TaskContext) -> Result<(), ActionError> {
    let vm = ctx.datastore.vm_fetch_required(ctx.vm_uuid()?).await?;
    let target = target_server(ctx).await?;
    machine_task(
        ctx,
        target,
        MachineAction::Update { payload: json!({ "autoboot": vm.autoboot }) },
    )
    .await
}

async fn wf_set_source_dni(ctx: &TaskContext) -> Result<(), ActionError> {
    let source = source_server(ctx).await?;
    ctx.collab
        .cnapi
        .set_do_not_inventory(&ctx.call, source, ctx.vm_uuid()?, true)
        .await?;
    Ok(())
}

async fn wf_swap_server_uuid(ctx: &TaskContext) -> Result<(), ActionError> {
    let target = target_server(ctx).await?;
    ctx.datastore
        .vm_apply(ctx.vm_uuid()?, |vm| vm.server_uuid = Some(target))
        .await?;
    Ok(())
}

async fn wf_clear_target_dni(ctx: &TaskContext) -> Result<(), ActionError> {
    let target = target_server(ctx).await?;
    ctx.collab
        .cnapi
        .set_do_not_inventory(&ctx.call, target, ctx.vm_uuid()?, false)
        .await?;
    Ok(())
}

async fn wf_start_target(ctx: &TaskContext) -> Result<(), ActionError> {
    let target = target_server(ctx).await?;
    machine_task(ctx, target, MachineAction::Start).await?;
    ctx.datastore
        .vm_apply(ctx.vm_uuid()?, |vm| vm.state = VmState::Running)
        .await?;
    Ok(())
}

async fn wf_unreserve_ips(ctx: &TaskContext) -> Result<(), ActionError> {
    let vm = ctx.datastore.vm_fetch_required(ctx.vm_uuid()?).await?;
    for nic in &vm.nics {
        if let Some(ip) = &nic.ip {
            ctx.collab
                .napi
                .unreserve_ip(&ctx.call, nic.network_uuid, ip)
                .await?;
        }
    }
    Ok(())
}

/// Bring the source back: clear do-not-inventory and start it if it was
/// stopped by an interrupted switch.
async fn wf_restart_source(ctx: &TaskContext) -> Result<(), ActionError> {
    let vm_uuid = ctx.vm_uuid()?;
    let Some(migration) = latest_migration(ctx).await? else {
        return Ok(());
    };
    let source = migration.source_server_uuid;
    ctx.collab
        .cnapi
        .set_do_not_inventory(&ctx.call, source, vm_uuid, false)
        .await?;
    if let Some(status) =
        ctx.collab.cnapi.vm_status(&ctx.call, source, vm_uuid).await?
    {
        if status.state != VmState::Running {
            machine_task(ctx, source, MachineAction::Start).await?;
            ctx.datastore
                .vm_apply(vm_uuid, |vm| {
                    vm.state = VmState::Running;
                    vm.server_uuid = Some(source);
                })
                .await?;
        }
    }
    Ok(())
}
