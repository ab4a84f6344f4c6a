// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Workflow composition
//!
//! Each mutation type composes a declarative [`Workflow`]: an ordered chain
//! of [`Task`]s with `onerror` and `oncancel` branches.  A task references
//! an action in the [`ActionRegistry`] by name; the executor (never the
//! composer) invokes action bodies against a [`TaskContext`].  All bodies
//! must be idempotent under retry.

pub mod destroy;
pub mod fabric_nat;
pub mod lifecycle;
pub mod migrate;
pub mod nics;
pub mod provision;
pub mod reprovision;
pub mod snapshot;
pub mod update;

use crate::app::waitlist::Waitlist;
use crate::app::workflow::JobHandle;
use crate::clients::CallContext;
use crate::clients::Collaborators;
use crate::db::model::Ticket;
use crate::db::model::TicketScope;
use crate::db::model::VmState;
use crate::db::Datastore;
use crate::errors::Error;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use slog::Logger;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;

/// Version stamped into job names (`provision-7.0.0`, …)
pub const WORKFLOW_VERSION: &str = "7.0.0";

/// Wall-clock budget for the whole provision pipeline
pub const PROVISION_WORKFLOW_TIMEOUT_SECS: u64 = 3810;
/// Budget for a compute-node agent task to settle
pub const CNAPI_WAIT_TASK_TIMEOUT_SECS: u64 = 3600;
/// Budget for removing pre-created NIC records on the error branch
pub const NAPI_CLEANUP_NICS_TIMEOUT_SECS: u64 = 10;
/// Budget for start/stop/reboot and other short pipelines
pub const LIFECYCLE_WORKFLOW_TIMEOUT_SECS: u64 = 180;
/// Default per-task budget where nothing longer is warranted
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 30;

/// State keys shared between tasks of one job
pub(crate) const KEY_VM_TICKET: &str = "vm_ticket";
pub(crate) const KEY_ALLOCATION_TICKET: &str = "allocation_ticket";
pub(crate) const KEY_CNAPI_TASK: &str = "cnapi_task_id";
pub(crate) const KEY_SERVER_UUID: &str = "server_uuid";
pub(crate) const KEY_NIC_MACS: &str = "nic_macs";

#[derive(Clone, Debug)]
pub struct Task {
    pub action: &'static str,
    pub timeout_secs: u64,
    pub retry: u32,
}

impl Task {
    pub fn new(action: &'static str, timeout_secs: u64, retry: u32) -> Task {
        Task { action, timeout_secs, retry }
    }
}

/// A composed pipeline, ready for submission to the executor
#[derive(Clone, Debug)]
pub struct Workflow {
    pub name: String,
    pub timeout_secs: u64,
    pub chain: Vec<Task>,
    pub onerror: Vec<Task>,
    pub oncancel: Vec<Task>,
}

pub struct WorkflowBuilder {
    name: String,
    timeout_secs: u64,
    chain: Vec<Task>,
    onerror: Vec<Task>,
    oncancel: Vec<Task>,
}

impl WorkflowBuilder {
    pub fn new(name: &str) -> WorkflowBuilder {
        WorkflowBuilder {
            name: name.to_string(),
            timeout_secs: LIFECYCLE_WORKFLOW_TIMEOUT_SECS,
            chain: Vec::new(),
            onerror: Vec::new(),
            oncancel: Vec::new(),
        }
    }

    pub fn timeout(mut self, timeout_secs: u64) -> WorkflowBuilder {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn append(mut self, task: Task) -> WorkflowBuilder {
        self.chain.push(task);
        self
    }

    pub fn on_error(mut self, task: Task) -> WorkflowBuilder {
        self.onerror.push(task);
        self
    }

    pub fn on_cancel(mut self, task: Task) -> WorkflowBuilder {
        self.oncancel.push(task);
        self
    }

    pub fn build(self) -> Workflow {
        Workflow {
            name: self.name,
            timeout_secs: self.timeout_secs,
            chain: self.chain,
            onerror: self.onerror,
            oncancel: self.oncancel,
        }
    }
}

/// An action failure; carries only a message because the executor reports
/// task outcomes through the job record.
#[derive(Clone, Debug)]
pub struct ActionError {
    pub message: String,
}

impl ActionError {
    pub fn new(message: &str) -> ActionError {
        ActionError { message: message.to_string() }
    }
}

impl From<Error> for ActionError {
    fn from(error: Error) -> ActionError {
        ActionError { message: error.to_string() }
    }
}

impl std::fmt::Display for ActionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

pub type ActionFunc =
    for<'a> fn(&'a TaskContext) -> BoxFuture<'a, Result<(), ActionError>>;

/// Named actions the executor resolves task references against
pub struct ActionRegistry {
    actions: BTreeMap<&'static str, ActionFunc>,
}

impl ActionRegistry {
    pub fn new() -> ActionRegistry {
        ActionRegistry { actions: BTreeMap::new() }
    }

    pub fn register(&mut self, name: &'static str, func: ActionFunc) {
        if self.actions.insert(name, func).is_some() {
            panic!("action registered twice: {:?}", name);
        }
    }

    pub fn lookup(&self, name: &str) -> Option<ActionFunc> {
        self.actions.get(name).copied()
    }
}

/// Builds the registry holding every workflow action in the system.
pub fn action_registry() -> ActionRegistry {
    let mut registry = ActionRegistry::new();
    register_common_actions(&mut registry);
    provision::register_actions(&mut registry);
    lifecycle::register_actions(&mut registry);
    update::register_actions(&mut registry);
    nics::register_actions(&mut registry);
    snapshot::register_actions(&mut registry);
    reprovision::register_actions(&mut registry);
    destroy::register_actions(&mut registry);
    migrate::register_actions(&mut registry);
    fabric_nat::register_actions(&mut registry);
    registry
}

/// Minimal payload view for actions shared by pipelines whose payloads all
/// carry resolved networks (provision, add-nics).
#[derive(serde::Deserialize)]
pub(crate) struct NetworksPayload {
    pub networks: Vec<crate::app::validate::ResolvedNetwork>,
}

/// Minimal payload view for actions that only need the image reference.
#[derive(serde::Deserialize)]
pub(crate) struct ImagePayload {
    pub image_uuid: Option<uuid::Uuid>,
}

/// Everything an action body may touch: the job record, the collaborators
/// bundle, the store, the waitlist, and a scratch state map shared by the
/// tasks of one run.
pub struct TaskContext {
    pub log: Logger,
    pub job: JobHandle,
    pub datastore: Arc<Datastore>,
    pub collab: Arc<Collaborators>,
    pub waitlist: Arc<Waitlist>,
    pub call: CallContext,
    state: Mutex<Map<String, Value>>,
}

impl TaskContext {
    pub fn new(
        log: Logger,
        job: JobHandle,
        datastore: Arc<Datastore>,
        collab: Arc<Collaborators>,
        waitlist: Arc<Waitlist>,
        call: CallContext,
    ) -> TaskContext {
        TaskContext {
            log,
            job,
            datastore,
            collab,
            waitlist,
            call,
            state: Mutex::new(Map::new()),
        }
    }

    /// The normalized per-action parameter record the job was submitted with.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, ActionError> {
        let payload = self.job.snapshot().params.payload;
        serde_json::from_value(payload).map_err(|e| {
            ActionError::new(&format!("malformed job payload: {}", e))
        })
    }

    pub fn store<T: Serialize>(&self, key: &str, value: &T) {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.state.lock().unwrap().insert(key.to_string(), value);
    }

    pub fn lookup<T: DeserializeOwned>(&self, key: &str) -> Result<T, ActionError> {
        self.maybe_lookup(key)?.ok_or_else(|| {
            ActionError::new(&format!("no state stored under {:?}", key))
        })
    }

    pub fn maybe_lookup<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, ActionError> {
        let state = self.state.lock().unwrap();
        match state.get(key) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| {
                    ActionError::new(&format!(
                        "state under {:?} has unexpected shape: {}",
                        key, e
                    ))
                }),
        }
    }

    pub fn take(&self, key: &str) -> Option<Value> {
        self.state.lock().unwrap().remove(key)
    }

    /// The uuid of the VM this job operates on.
    pub fn vm_uuid(&self) -> Result<uuid::Uuid, ActionError> {
        self.job
            .snapshot()
            .vm_uuid
            .ok_or_else(|| ActionError::new("job has no vm_uuid"))
    }
}

fn register_common_actions(registry: &mut ActionRegistry) {
    registry.register("common.validate_params", |ctx| {
        Box::pin(wf_validate_params(ctx))
    });
    registry.register("waitlist.acquire_vm_ticket", |ctx| {
        Box::pin(wf_acquire_vm_ticket(ctx))
    });
    registry.register("waitlist.release_vm_ticket", |ctx| {
        Box::pin(wf_release_vm_ticket(ctx))
    });
    registry.register("waitlist.acquire_allocation_ticket", |ctx| {
        Box::pin(wf_acquire_allocation_ticket(ctx))
    });
    registry.register("waitlist.release_allocation_ticket", |ctx| {
        Box::pin(wf_release_allocation_ticket(ctx))
    });
    registry.register("waitlist.release_tickets", |ctx| {
        Box::pin(wf_release_tickets(ctx))
    });
    registry.register("cnapi.wait_task", |ctx| Box::pin(wf_cnapi_wait_task(ctx)));
    registry.register("vmapi.refresh_vm", |ctx| Box::pin(wf_refresh_vm(ctx)));
    registry.register("fwapi.update_firewall", |ctx| {
        Box::pin(wf_update_firewall(ctx))
    });
}

/// First task of every pipeline: the VM record must still be present and,
/// unless this is the destroy pipeline, not already destroyed.
async fn wf_validate_params(ctx: &TaskContext) -> Result<(), ActionError> {
    let job = ctx.job.snapshot();
    let Some(vm_uuid) = job.vm_uuid else {
        return Err(ActionError::new("job has no vm_uuid"));
    };
    let vm = ctx.datastore.vm_fetch_required(vm_uuid).await?;
    if vm.state == VmState::Destroyed
        && job.task != crate::db::model::VmTask::Destroy
    {
        return Err(ActionError::new("VM has been destroyed"));
    }
    Ok(())
}

async fn wf_acquire_vm_ticket(ctx: &TaskContext) -> Result<(), ActionError> {
    let vm_uuid = ctx.vm_uuid()?;
    // Idempotent under retry: a ticket we already hold is reused.
    if ctx.maybe_lookup::<Ticket>(KEY_VM_TICKET)?.is_some() {
        return Ok(());
    }
    let ticket = ctx
        .waitlist
        .acquire(TicketScope::Vm, &vm_uuid.to_string(), ctx.job.id())
        .await;
    ctx.store(KEY_VM_TICKET, &ticket);
    Ok(())
}

async fn wf_release_vm_ticket(ctx: &TaskContext) -> Result<(), ActionError> {
    if let Some(ticket) = ctx.maybe_lookup::<Ticket>(KEY_VM_TICKET)? {
        ctx.waitlist.release(&ticket);
        ctx.take(KEY_VM_TICKET);
    }
    Ok(())
}

/// Serializes a placement decision.  The key is the target server when it
/// is already known (resize), otherwise the shared allocation queue.
async fn wf_acquire_allocation_ticket(
    ctx: &TaskContext,
) -> Result<(), ActionError> {
    if ctx.maybe_lookup::<Ticket>(KEY_ALLOCATION_TICKET)?.is_some() {
        return Ok(());
    }
    let key = match ctx.maybe_lookup::<uuid::Uuid>(KEY_SERVER_UUID)? {
        Some(server) => server.to_string(),
        None => "default".to_string(),
    };
    let ticket = ctx
        .waitlist
        .acquire(TicketScope::Allocation, &key, ctx.job.id())
        .await;
    ctx.store(KEY_ALLOCATION_TICKET, &ticket);
    Ok(())
}

async fn wf_release_allocation_ticket(
    ctx: &TaskContext,
) -> Result<(), ActionError> {
    if let Some(ticket) = ctx.maybe_lookup::<Ticket>(KEY_ALLOCATION_TICKET)? {
        ctx.waitlist.release(&ticket);
        ctx.take(KEY_ALLOCATION_TICKET);
    }
    Ok(())
}

/// Error/cancel-branch backstop: drop every ticket this job holds.
async fn wf_release_tickets(ctx: &TaskContext) -> Result<(), ActionError> {
    let released = ctx.waitlist.release_for_job(ctx.job.id());
    if released > 0 {
        debug!(ctx.log, "released tickets on branch path";
            "job" => %ctx.job.id(), "count" => released);
    }
    ctx.take(KEY_VM_TICKET);
    ctx.take(KEY_ALLOCATION_TICKET);
    Ok(())
}

/// Waits for the agent task the previous step started, consuming its id so
/// a later wait in the same chain cannot observe a stale task.  A chain
/// whose previous step had nothing to do waits on nothing.
async fn wf_cnapi_wait_task(ctx: &TaskContext) -> Result<(), ActionError> {
    let Some(task_id) = ctx.maybe_lookup::<String>(KEY_CNAPI_TASK)? else {
        return Ok(());
    };
    ctx.collab.cnapi.wait_task(&ctx.call, &task_id).await?;
    ctx.take(KEY_CNAPI_TASK);
    Ok(())
}

/// Re-reads the machine state from the compute node and stores it.
async fn wf_refresh_vm(ctx: &TaskContext) -> Result<(), ActionError> {
    let vm_uuid = ctx.vm_uuid()?;
    let vm = ctx.datastore.vm_fetch_required(vm_uuid).await?;
    let Some(server) = vm.server_uuid else { return Ok(()) };
    if let Some(status) =
        ctx.collab.cnapi.vm_status(&ctx.call, server, vm_uuid).await?
    {
        ctx.datastore
            .vm_apply(vm_uuid, |vm| {
                if vm.state != VmState::Destroyed {
                    vm.state = status.state;
                }
            })
            .await?;
    }
    Ok(())
}

async fn wf_update_firewall(ctx: &TaskContext) -> Result<(), ActionError> {
    let vm_uuid = ctx.vm_uuid()?;
    let vm = ctx.datastore.vm_fetch_required(vm_uuid).await?;
    let tags = vm.tags.keys().cloned().collect();
    ctx.collab.fwapi.sync_vm(&ctx.call, vm.uuid, vm.owner_uuid, tags).await?;
    Ok(())
}
