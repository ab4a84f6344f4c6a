// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Post-execution reconciliation
//!
//! On terminal workflow state: `succeeded` releases any remaining tickets
//! (and chains automatic migration phases); `failed` cleans up NIC records
//! pre-created for the provision (when the job may still be marked failed)
//! and marks the VM `failed`; `canceled` refreshes the VM from the
//! compute node.  Completions normally arrive over the executor's channel;
//! a periodic sweep catches anything the channel missed.

use crate::app::background::BackgroundTask;
use crate::app::validate::NormalizedMigrate;
use crate::app::waitlist::Waitlist;
use crate::app::workflow::JobCompletion;
use crate::app::workflow::JobExecutor;
use crate::app::workflow::JobsFilter;
use crate::app::workflow::NewJob;
use crate::app::workflows;
use crate::clients::CallContext;
use crate::clients::Collaborators;
use crate::db::model::Job;
use crate::db::model::JobExecution;
use crate::db::model::MigrationPhase;
use crate::db::model::VmState;
use crate::db::model::VmTask;
use crate::db::Datastore;
use crate::errors::Error;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::json;
use slog::Logger;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

pub struct Reconciler {
    log: Logger,
    datastore: Arc<Datastore>,
    collab: Arc<Collaborators>,
    executor: Arc<dyn JobExecutor>,
    waitlist: Arc<Waitlist>,
    reconciled: Mutex<HashSet<Uuid>>,
}

impl Reconciler {
    pub fn new(
        log: Logger,
        datastore: Arc<Datastore>,
        collab: Arc<Collaborators>,
        executor: Arc<dyn JobExecutor>,
        waitlist: Arc<Waitlist>,
    ) -> Reconciler {
        Reconciler {
            log,
            datastore,
            collab,
            executor,
            waitlist,
            reconciled: Mutex::new(HashSet::new()),
        }
    }

    /// Consumes the executor's completion channel so terminal jobs are
    /// reconciled as soon as they finish.
    pub fn spawn_listener(
        self: &Arc<Self>,
        mut receiver: UnboundedReceiver<JobCompletion>,
    ) -> tokio::task::JoinHandle<()> {
        let reconciler = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(completion) = receiver.recv().await {
                reconciler.reconcile(&completion.job).await;
            }
        })
    }

    pub async fn reconcile(&self, job: &Job) {
        if !job.execution.terminal() {
            return;
        }
        if !self.reconciled.lock().unwrap().insert(job.uuid) {
            return;
        }
        if let Err(error) = self.reconcile_inner(job).await {
            warn!(self.log, "reconciliation failed";
                "job" => %job.uuid, "error" => %error);
        }
    }

    async fn reconcile_inner(&self, job: &Job) -> Result<(), Error> {
        debug!(self.log, "reconciling job";
            "job" => %job.uuid,
            "task" => %job.task,
            "execution" => ?job.execution);
        match job.execution {
            JobExecution::Succeeded => {
                self.waitlist.release_for_job(job.uuid);
                self.maybe_chain_migration(job).await;
            }
            JobExecution::Failed => {
                if job.task == VmTask::Provision {
                    self.reconcile_failed_provision(job).await?;
                } else {
                    self.refresh_from_compute_node(job).await?;
                }
                self.waitlist.release_for_job(job.uuid);
            }
            JobExecution::Canceled => {
                self.refresh_from_compute_node(job).await?;
                self.waitlist.release_for_job(job.uuid);
            }
            JobExecution::Queued | JobExecution::Running => {}
        }
        Ok(())
    }

    /// A failed provision marks the VM `failed`.  While the job may still
    /// be marked failed (the zone never started to exist), any pre-created
    /// NIC records are removed; past the point of no return they are left
    /// for a later sync to reconcile.
    async fn reconcile_failed_provision(&self, job: &Job) -> Result<(), Error> {
        let Some(vm_uuid) = job.vm_uuid else { return Ok(()) };
        let call = self.call_context();
        if job.mark_as_failed_on_error {
            let records =
                self.collab.napi.nics_for_vm(&call, vm_uuid).await?;
            for record in records {
                self.collab.napi.delete_nic(&call, &record.mac).await?;
            }
        }
        match self
            .datastore
            .vm_apply(vm_uuid, |vm| {
                // destroyed is terminal; a racing destroy wins.
                if vm.state != VmState::Destroyed {
                    vm.state = VmState::Failed;
                }
                if job.mark_as_failed_on_error {
                    vm.nics.clear();
                }
            })
            .await
        {
            Ok(_) => {}
            Err(Error::NotFound { .. }) => {}
            Err(error) => return Err(error),
        }
        Ok(())
    }

    /// For canceled jobs (and failed non-provision jobs) the compute node
    /// is the authority on where the machine landed.
    async fn refresh_from_compute_node(&self, job: &Job) -> Result<(), Error> {
        let Some(vm_uuid) = job.vm_uuid else { return Ok(()) };
        let Some(vm) = self.datastore.vm_fetch(vm_uuid).await? else {
            return Ok(());
        };
        let Some(server) = vm.server_uuid else { return Ok(()) };
        let call = self.call_context();
        if let Some(status) =
            self.collab.cnapi.vm_status(&call, server, vm_uuid).await?
        {
            self.datastore
                .vm_apply(vm_uuid, |vm| {
                    if vm.state != VmState::Destroyed {
                        vm.state = status.state;
                    }
                })
                .await?;
        }
        Ok(())
    }

    /// Automatic migrations chain begin → sync → switch; the next phase is
    /// submitted when the previous one lands.
    async fn maybe_chain_migration(&self, job: &Job) {
        let next = match job.task {
            VmTask::MigrateBegin => MigrationPhase::Sync,
            VmTask::MigrateSync => MigrationPhase::Switch,
            _ => return,
        };
        let Ok(payload) = serde_json::from_value::<NormalizedMigrate>(
            job.params.payload.clone(),
        ) else {
            return;
        };
        if !payload.automatic {
            return;
        }
        let (task, workflow) = match next {
            MigrationPhase::Sync => {
                (VmTask::MigrateSync, workflows::migrate::sync_workflow())
            }
            _ => {
                (VmTask::MigrateSwitch, workflows::migrate::switch_workflow())
            }
        };
        info!(self.log, "chaining automatic migration phase";
            "vm" => ?job.vm_uuid, "next" => %task);
        let new_job = NewJob {
            task,
            vm_uuid: job.vm_uuid,
            context: job.params.context.clone(),
            payload: serde_json::to_value(NormalizedMigrate {
                phase: next,
                automatic: true,
            })
            .unwrap_or(serde_json::Value::Null),
            request_id: Uuid::new_v4().to_string(),
            mark_as_failed_on_error: false,
        };
        if let Err(error) = self.executor.submit(workflow, new_job).await {
            warn!(self.log, "failed to chain migration phase";
                "job" => %job.uuid, "error" => %error);
        }
    }

    fn call_context(&self) -> CallContext {
        CallContext::new(&Uuid::new_v4().to_string())
    }
}

impl BackgroundTask for Reconciler {
    fn activate<'a>(&'a self) -> BoxFuture<'a, serde_json::Value> {
        async {
            let mut swept = 0;
            for execution in [
                JobExecution::Succeeded,
                JobExecution::Failed,
                JobExecution::Canceled,
            ] {
                let filter =
                    JobsFilter { execution: Some(execution), ..Default::default() };
                let jobs = match self.executor.jobs_list(&filter).await {
                    Ok(jobs) => jobs,
                    Err(error) => {
                        return json!({
                            "error": format!("listing jobs: {}", error),
                        });
                    }
                };
                for job in &jobs {
                    let already =
                        self.reconciled.lock().unwrap().contains(&job.uuid);
                    if !already {
                        self.reconcile(job).await;
                        swept += 1;
                    }
                }
            }
            json!({ "swept": swept })
        }
        .boxed()
    }
}
