// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! VM operations: list, fetch, provision, action dispatch, destroy
//!
//! Every mutation follows the same path: validate synchronously, persist
//! intent, compose the pipeline, submit it to the executor, and hand the
//! job back for the 202 response.

use crate::app::validate;
use crate::app::workflow::NewJob;
use crate::app::workflows;
use crate::app::Vmapi;
use crate::clients::CallContext;
use crate::db::filter::ListOptions;
use crate::db::filter::VmFilter;
use crate::db::model::Job;
use crate::db::model::JobContext;
use crate::db::model::Migration;
use crate::db::model::Vm;
use crate::db::model::VmState;
use crate::db::model::VmTask;
use crate::errors::Error;
use crate::external_api::params;
use crate::external_api::params::ProvisionParams;
use serde_json::Value;
use uuid::Uuid;

impl Vmapi {
    pub async fn vm_list(
        &self,
        filter: &VmFilter,
        options: &ListOptions,
    ) -> Result<(Vec<Value>, usize), Error> {
        self.datastore.vm_list(filter, options).await
    }

    pub async fn vm_fetch(&self, uuid: Uuid) -> Result<Vm, Error> {
        self.datastore.vm_fetch_required(uuid).await
    }

    /// Validates a provision request, persists the new VM in state
    /// `provisioning`, and submits the provision pipeline.
    pub async fn vm_provision(
        &self,
        call: &CallContext,
        context: JobContext,
        params: ProvisionParams,
    ) -> Result<Job, Error> {
        self.datastore.check_ready()?;
        let normalized =
            validate::validate_provision(call, &self.collab, &params).await?;
        if self.datastore.vm_fetch(normalized.vm_uuid).await?.is_some() {
            return Err(Error::invalid_field(
                "uuid",
                "Duplicate",
                &format!("VM {} already exists", normalized.vm_uuid),
            ));
        }

        let vm = Vm {
            uuid: normalized.vm_uuid,
            owner_uuid: normalized.owner_uuid,
            brand: normalized.brand,
            state: VmState::Provisioning,
            alias: normalized.alias.clone(),
            billing_id: normalized.billing_id,
            image_uuid: normalized.image_uuid,
            ram: normalized.ram,
            max_physical_memory: normalized.ram,
            quota: normalized.quota,
            cpu_cap: normalized.cpu_cap,
            cpu_shares: normalized.cpu_shares,
            max_swap: normalized.max_swap,
            max_lwps: normalized.max_lwps,
            zfs_io_priority: normalized.zfs_io_priority,
            create_timestamp: chrono::Utc::now(),
            server_uuid: normalized.server_uuid,
            autoboot: normalized.autoboot,
            nics: Vec::new(),
            tags: normalized.tags.clone(),
            customer_metadata: normalized.customer_metadata.clone(),
            internal_metadata: normalized.internal_metadata.clone(),
            firewall_rules: Vec::new(),
            snapshots: Vec::new(),
            disks: normalized.disks.clone(),
        };
        self.datastore.vm_create(vm).await?;

        info!(self.log, "accepted provision";
            "vm" => %normalized.vm_uuid,
            "owner" => %normalized.owner_uuid,
            "brand" => %normalized.brand);
        self.submit_job(
            workflows::provision::workflow(),
            NewJob {
                task: VmTask::Provision,
                vm_uuid: Some(normalized.vm_uuid),
                context,
                payload: serde_json::to_value(&normalized)
                    .map_err(|e| Error::internal_error(&e.to_string()))?,
                request_id: call.request_id.clone(),
                mark_as_failed_on_error: true,
            },
        )
        .await
    }

    /// Dispatches a `POST /vms/:uuid` action body to its pipeline.
    pub async fn vm_action(
        &self,
        call: &CallContext,
        context: JobContext,
        uuid: Uuid,
        body: Value,
    ) -> Result<Job, Error> {
        self.datastore.check_ready()?;
        let vm = self.datastore.vm_fetch_required(uuid).await?;
        let Some(action) = body.get("action").and_then(Value::as_str) else {
            return Err(Error::validation(
                "The action parameter is required",
                vec![],
            ));
        };

        let (task, workflow, payload) = match action {
            "start" | "stop" | "reboot" => {
                let task = match action {
                    "start" => VmTask::Start,
                    "stop" => VmTask::Stop,
                    _ => VmTask::Reboot,
                };
                validate::validate_action_state(&vm, task)?;
                (task, workflows::lifecycle::workflow(task), Value::Null)
            }
            "update" => {
                validate::validate_action_state(&vm, VmTask::Update)?;
                let update_params: params::UpdateParams =
                    params::action_params(&body)?;
                let normalized = validate::validate_update(
                    call,
                    &self.collab,
                    &vm,
                    &update_params,
                )
                .await?;
                (
                    VmTask::Update,
                    workflows::update::workflow(),
                    serde_json::to_value(&normalized)
                        .map_err(|e| Error::internal_error(&e.to_string()))?,
                )
            }
            "add_nics" => {
                validate::validate_action_state(&vm, VmTask::AddNics)?;
                let nic_params: params::AddNicsParams =
                    params::action_params(&body)?;
                let normalized = validate::validate_add_nics(
                    call,
                    &self.collab,
                    &vm,
                    &nic_params,
                )
                .await?;
                (
                    VmTask::AddNics,
                    workflows::nics::add_workflow(),
                    serde_json::to_value(&normalized)
                        .map_err(|e| Error::internal_error(&e.to_string()))?,
                )
            }
            "remove_nics" => {
                validate::validate_action_state(&vm, VmTask::RemoveNics)?;
                let nic_params: params::RemoveNicsParams =
                    params::action_params(&body)?;
                let normalized =
                    validate::validate_remove_nics(&vm, &nic_params)?;
                (
                    VmTask::RemoveNics,
                    workflows::nics::remove_workflow(),
                    serde_json::to_value(&normalized)
                        .map_err(|e| Error::internal_error(&e.to_string()))?,
                )
            }
            "create_snapshot" | "rollback_snapshot" | "delete_snapshot" => {
                let task = match action {
                    "create_snapshot" => VmTask::Snapshot,
                    "rollback_snapshot" => VmTask::RollbackSnapshot,
                    _ => VmTask::DeleteSnapshot,
                };
                validate::validate_action_state(&vm, task)?;
                let snapshot_params: params::SnapshotParams =
                    params::action_params(&body)?;
                let normalized =
                    validate::validate_snapshot(&vm, &snapshot_params, task)?;
                (
                    task,
                    workflows::snapshot::workflow(task),
                    serde_json::to_value(&normalized)
                        .map_err(|e| Error::internal_error(&e.to_string()))?,
                )
            }
            "reprovision" => {
                validate::validate_action_state(&vm, VmTask::Reprovision)?;
                let reprovision_params: params::ReprovisionParams =
                    params::action_params(&body)?;
                let normalized = validate::validate_reprovision(
                    call,
                    &self.collab,
                    &vm,
                    &reprovision_params,
                )
                .await?;
                (
                    VmTask::Reprovision,
                    workflows::reprovision::workflow(),
                    serde_json::to_value(&normalized)
                        .map_err(|e| Error::internal_error(&e.to_string()))?,
                )
            }
            "migrate" => {
                let migrate_params: params::MigrateParams =
                    params::action_params(&body)?;
                let latest = self.latest_migration(uuid).await?;
                let normalized = validate::validate_migrate(
                    &vm,
                    &migrate_params,
                    latest.as_ref(),
                )?;
                let task = match normalized.phase {
                    crate::db::model::MigrationPhase::Begin => {
                        VmTask::MigrateBegin
                    }
                    crate::db::model::MigrationPhase::Sync => {
                        VmTask::MigrateSync
                    }
                    crate::db::model::MigrationPhase::Switch => {
                        VmTask::MigrateSwitch
                    }
                    crate::db::model::MigrationPhase::Abort => {
                        VmTask::MigrateAbort
                    }
                };
                validate::validate_action_state(&vm, task)?;
                let workflow = match task {
                    VmTask::MigrateBegin => {
                        workflows::migrate::begin_workflow()
                    }
                    VmTask::MigrateSync => workflows::migrate::sync_workflow(),
                    VmTask::MigrateSwitch => {
                        workflows::migrate::switch_workflow()
                    }
                    _ => workflows::migrate::abort_workflow(),
                };
                (
                    task,
                    workflow,
                    serde_json::to_value(&normalized)
                        .map_err(|e| Error::internal_error(&e.to_string()))?,
                )
            }
            other => {
                return Err(Error::validation(
                    &format!("Unknown action: {:?}", other),
                    vec![],
                ));
            }
        };

        info!(self.log, "accepted action";
            "vm" => %uuid, "task" => %task);
        self.submit_job(
            workflow,
            NewJob {
                task,
                vm_uuid: Some(uuid),
                context,
                payload,
                request_id: call.request_id.clone(),
                mark_as_failed_on_error: false,
            },
        )
        .await
    }

    pub async fn vm_destroy(
        &self,
        call: &CallContext,
        context: JobContext,
        uuid: Uuid,
    ) -> Result<Job, Error> {
        self.datastore.check_ready()?;
        let vm = self.datastore.vm_fetch_required(uuid).await?;
        validate::validate_action_state(&vm, VmTask::Destroy)?;
        info!(self.log, "accepted destroy"; "vm" => %uuid);
        self.submit_job(
            workflows::destroy::workflow(),
            NewJob {
                task: VmTask::Destroy,
                vm_uuid: Some(uuid),
                context,
                payload: Value::Null,
                request_id: call.request_id.clone(),
                mark_as_failed_on_error: false,
            },
        )
        .await
    }

    pub(crate) async fn latest_migration(
        &self,
        vm: Uuid,
    ) -> Result<Option<Migration>, Error> {
        let records = self.datastore.migrations_for_vm(vm).await?;
        Ok(records.into_iter().max_by_key(|m| m.created_at))
    }

    async fn submit_job(
        &self,
        workflow: crate::app::workflows::Workflow,
        new_job: NewJob,
    ) -> Result<Job, Error> {
        self.executor.submit(workflow, new_job).await
    }
}
