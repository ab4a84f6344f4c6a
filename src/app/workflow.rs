// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Workflow submission and the job executor
//!
//! The composer never executes tasks in the request path: it hands the
//! composed [`Workflow`] to a [`JobExecutor`] and stores the returned job.
//! The in-process [`WorkflowEngine`] here walks the chain with per-task
//! timeout and retry, takes the `onerror` branch on failure and `oncancel`
//! on cancellation, and reports terminal executions to the reconciler over
//! a channel.  Deployments with a remote executor submit through
//! [`crate::clients::wfapi::Client`] instead.

use crate::app::waitlist::Waitlist;
use crate::app::workflows::ActionError;
use crate::app::workflows::ActionRegistry;
use crate::app::workflows::Task;
use crate::app::workflows::TaskContext;
use crate::app::workflows::Workflow;
use crate::app::workflows::WORKFLOW_VERSION;
use crate::clients::CallContext;
use crate::clients::Collaborators;
use crate::db::model::Job;
use crate::db::model::JobContext;
use crate::db::model::JobExecution;
use crate::db::model::JobParams;
use crate::db::model::TaskResult;
use crate::db::model::VmTask;
use crate::db::Datastore;
use crate::errors::Error;
use async_trait::async_trait;
use chrono::Utc;
use slog::Logger;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A job to be registered with the executor
#[derive(Clone, Debug)]
pub struct NewJob {
    pub task: VmTask,
    pub vm_uuid: Option<Uuid>,
    pub context: JobContext,
    pub payload: serde_json::Value,
    pub request_id: String,
    /// see [`Job::mark_as_failed_on_error`]
    pub mark_as_failed_on_error: bool,
}

#[derive(Clone, Debug, Default)]
pub struct JobsFilter {
    pub vm_uuid: Option<Uuid>,
    pub task: Option<VmTask>,
    pub execution: Option<JobExecution>,
}

/// Emitted once per job when it reaches a terminal execution
#[derive(Clone, Debug)]
pub struct JobCompletion {
    pub job: Job,
}

/// The contract with the workflow executor: submit a composed pipeline,
/// then observe job state; the executor owns progression.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn submit(
        &self,
        workflow: Workflow,
        new_job: NewJob,
    ) -> Result<Job, Error>;

    async fn job_fetch(&self, id: Uuid) -> Result<Option<Job>, Error>;

    /// Jobs matching the filter, in reverse creation order.
    async fn jobs_list(&self, filter: &JobsFilter) -> Result<Vec<Job>, Error>;

    async fn job_cancel(&self, id: Uuid) -> Result<(), Error>;
}

/// Shared handle to one job's record, given to action bodies so that task
/// outcomes and the point-of-no-return marker land in the job.
#[derive(Clone)]
pub struct JobHandle {
    id: Uuid,
    jobs: Arc<Mutex<BTreeMap<Uuid, Job>>>,
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn snapshot(&self) -> Job {
        let jobs = self.jobs.lock().unwrap();
        jobs.get(&self.id).expect("job record exists for its handle").clone()
    }

    pub fn update<F: FnOnce(&mut Job)>(&self, update: F) {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&self.id).expect("job record exists");
        update(job);
        job.updated_at = Utc::now();
    }
}

enum ChainEnd {
    Failed(String),
    Canceled,
}

struct EngineCore {
    log: Logger,
    registry: ActionRegistry,
    datastore: Arc<Datastore>,
    collab: Arc<Collaborators>,
    waitlist: Arc<Waitlist>,
    jobs: Arc<Mutex<BTreeMap<Uuid, Job>>>,
    cancels: Mutex<HashMap<Uuid, CancellationToken>>,
    completions: mpsc::UnboundedSender<JobCompletion>,
}

#[derive(Clone)]
pub struct WorkflowEngine {
    core: Arc<EngineCore>,
}

impl WorkflowEngine {
    pub fn new(
        log: Logger,
        registry: ActionRegistry,
        datastore: Arc<Datastore>,
        collab: Arc<Collaborators>,
        waitlist: Arc<Waitlist>,
    ) -> (WorkflowEngine, mpsc::UnboundedReceiver<JobCompletion>) {
        let (completions, receiver) = mpsc::unbounded_channel();
        let engine = WorkflowEngine {
            core: Arc::new(EngineCore {
                log,
                registry,
                datastore,
                collab,
                waitlist,
                jobs: Arc::new(Mutex::new(BTreeMap::new())),
                cancels: Mutex::new(HashMap::new()),
                completions,
            }),
        };
        (engine, receiver)
    }

    fn handle(&self, id: Uuid) -> JobHandle {
        JobHandle { id, jobs: Arc::clone(&self.core.jobs) }
    }

    async fn run(
        self,
        workflow: Workflow,
        job_id: Uuid,
        request_id: String,
        token: CancellationToken,
    ) {
        let handle = self.handle(job_id);
        handle.update(|job| job.execution = JobExecution::Running);
        let log = self.core.log.new(o!(
            "job" => job_id.to_string(),
            "workflow" => workflow.name.clone(),
        ));
        info!(log, "workflow started");

        let ctx = TaskContext::new(
            log.clone(),
            handle.clone(),
            Arc::clone(&self.core.datastore),
            Arc::clone(&self.core.collab),
            Arc::clone(&self.core.waitlist),
            CallContext::new(&request_id),
        );

        let deadline = Duration::from_secs(workflow.timeout_secs);
        let chain_result = match tokio::time::timeout(
            deadline,
            self.run_chain(&workflow.chain, &ctx, &token),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ChainEnd::Failed(format!(
                "workflow timed out after {}s",
                workflow.timeout_secs
            ))),
        };

        let execution = match chain_result {
            Ok(()) => JobExecution::Succeeded,
            Err(ChainEnd::Failed(message)) => {
                warn!(log, "workflow failed"; "error" => &message);
                self.run_branch(&workflow.onerror, &ctx).await;
                JobExecution::Failed
            }
            Err(ChainEnd::Canceled) => {
                info!(log, "workflow canceled");
                self.run_branch(&workflow.oncancel, &ctx).await;
                JobExecution::Canceled
            }
        };

        handle.update(|job| job.execution = execution);
        self.core.cancels.lock().unwrap().remove(&job_id);
        info!(log, "workflow finished"; "execution" => ?execution);
        // The reconciler may already be gone during shutdown.
        let _ = self
            .core
            .completions
            .send(JobCompletion { job: handle.snapshot() });
    }

    async fn run_chain(
        &self,
        chain: &[Task],
        ctx: &TaskContext,
        token: &CancellationToken,
    ) -> Result<(), ChainEnd> {
        for task in chain {
            if token.is_cancelled() {
                return Err(ChainEnd::Canceled);
            }
            self.run_task(task, ctx, Some(token)).await?;
        }
        Ok(())
    }

    /// Branch tasks run to completion even when one of them fails; a broken
    /// cleanup step must not keep the rest from running.
    async fn run_branch(&self, branch: &[Task], ctx: &TaskContext) {
        for task in branch {
            if let Err(ChainEnd::Failed(message)) =
                self.run_task(task, ctx, None).await
            {
                warn!(ctx.log, "branch task failed";
                    "task" => task.action, "error" => message);
            }
        }
    }

    async fn run_task(
        &self,
        task: &Task,
        ctx: &TaskContext,
        token: Option<&CancellationToken>,
    ) -> Result<(), ChainEnd> {
        let Some(action) = self.core.registry.lookup(task.action) else {
            return Err(ChainEnd::Failed(format!(
                "no such action: {:?}",
                task.action
            )));
        };
        let attempts = task.retry.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            let started_at = Utc::now();
            let timeout = Duration::from_secs(task.timeout_secs);
            let outcome = match token {
                Some(token) => tokio::select! {
                    _ = token.cancelled() => return Err(ChainEnd::Canceled),
                    result = tokio::time::timeout(timeout, action(ctx)) => {
                        result
                    }
                },
                None => tokio::time::timeout(timeout, action(ctx)).await,
            };
            let result = match outcome {
                Err(_) => Err(ActionError::new(&format!(
                    "task timed out after {}s",
                    task.timeout_secs
                ))),
                Ok(result) => result,
            };
            let error = result.as_ref().err().map(|e| e.to_string());
            ctx.job.update(|job| {
                job.chain_results.push(TaskResult {
                    task: task.action.to_string(),
                    error: error.clone(),
                    started_at,
                    finished_at: Utc::now(),
                })
            });
            match result {
                Ok(()) => return Ok(()),
                Err(error) => {
                    debug!(ctx.log, "task attempt failed";
                        "task" => task.action,
                        "attempt" => attempt,
                        "error" => %error);
                    last_error = error.message;
                }
            }
        }
        Err(ChainEnd::Failed(format!(
            "task {:?} failed: {}",
            task.action, last_error
        )))
    }
}

#[async_trait]
impl JobExecutor for WorkflowEngine {
    async fn submit(
        &self,
        workflow: Workflow,
        new_job: NewJob,
    ) -> Result<Job, Error> {
        let now = Utc::now();
        let job = Job {
            uuid: Uuid::new_v4(),
            name: format!("{}-{}", workflow.name, WORKFLOW_VERSION),
            execution: JobExecution::Queued,
            params: JobParams {
                context: new_job.context,
                payload: new_job.payload,
            },
            vm_uuid: new_job.vm_uuid,
            task: new_job.task,
            mark_as_failed_on_error: new_job.mark_as_failed_on_error,
            chain_results: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        let job_id = job.uuid;
        self.core.jobs.lock().unwrap().insert(job_id, job.clone());
        let token = CancellationToken::new();
        self.core.cancels.lock().unwrap().insert(job_id, token.clone());

        // Submission returns as soon as the job is registered; the pipeline
        // runs on its own task.
        tokio::spawn(self.clone().run(
            workflow,
            job_id,
            new_job.request_id,
            token,
        ));
        Ok(job)
    }

    async fn job_fetch(&self, id: Uuid) -> Result<Option<Job>, Error> {
        Ok(self.core.jobs.lock().unwrap().get(&id).cloned())
    }

    async fn jobs_list(&self, filter: &JobsFilter) -> Result<Vec<Job>, Error> {
        let jobs = self.core.jobs.lock().unwrap();
        let mut matching: Vec<Job> = jobs
            .values()
            .filter(|job| {
                filter.vm_uuid.map(|vm| job.vm_uuid == Some(vm)).unwrap_or(true)
                    && filter.task.map(|t| job.task == t).unwrap_or(true)
                    && filter
                        .execution
                        .map(|e| job.execution == e)
                        .unwrap_or(true)
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matching)
    }

    async fn job_cancel(&self, id: Uuid) -> Result<(), Error> {
        let Some(job) = self.job_fetch(id).await? else {
            return Err(Error::job_not_found(&id));
        };
        if job.execution.terminal() {
            return Err(Error::validation(
                &format!("job {} has already finished", id),
                vec![],
            ));
        }
        if let Some(token) = self.core.cancels.lock().unwrap().get(&id) {
            token.cancel();
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::app::workflows::ActionError;
    use crate::app::workflows::WorkflowBuilder;
    use dropshot::ConfigLogging;
    use dropshot::ConfigLoggingLevel;
    use serde_json::Value;

    async fn action_noop(_ctx: &TaskContext) -> Result<(), ActionError> {
        Ok(())
    }

    async fn action_flaky(ctx: &TaskContext) -> Result<(), ActionError> {
        if ctx.maybe_lookup::<bool>("flaky_attempted")?.is_none() {
            ctx.store("flaky_attempted", &true);
            return Err(ActionError::new("first attempt fails"));
        }
        Ok(())
    }

    async fn action_fail(_ctx: &TaskContext) -> Result<(), ActionError> {
        Err(ActionError::new("doomed"))
    }

    async fn action_block(_ctx: &TaskContext) -> Result<(), ActionError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    }

    fn test_engine(
        name: &'static str,
    ) -> (WorkflowEngine, mpsc::UnboundedReceiver<JobCompletion>) {
        let log = ConfigLogging::StderrTerminal {
            level: ConfigLoggingLevel::Error,
        }
        .to_logger(name)
        .unwrap();
        let mut registry = ActionRegistry::new();
        registry.register("test.noop", |ctx| Box::pin(action_noop(ctx)));
        registry.register("test.flaky", |ctx| Box::pin(action_flaky(ctx)));
        registry.register("test.fail", |ctx| Box::pin(action_fail(ctx)));
        registry.register("test.block", |ctx| Box::pin(action_block(ctx)));
        // Stand-in for the shared release action the branches name.
        registry
            .register("waitlist.release_tickets", |ctx| Box::pin(action_noop(ctx)));
        let datastore = Arc::new(crate::db::Datastore::new(log.clone()));
        datastore.setup_buckets();
        let (collab, _sim) = crate::sim::collaborators();
        let waitlist = Arc::new(
            crate::app::waitlist::Waitlist::new(
                log.clone(),
                Duration::from_secs(600),
            ),
        );
        WorkflowEngine::new(log, registry, datastore, collab, waitlist)
    }

    fn test_job() -> NewJob {
        NewJob {
            task: VmTask::Update,
            vm_uuid: None,
            context: JobContext::default(),
            payload: Value::Null,
            request_id: "test-request".to_string(),
            mark_as_failed_on_error: false,
        }
    }

    async fn wait_terminal(engine: &WorkflowEngine, id: Uuid) -> Job {
        for _ in 0..400 {
            let job = engine.job_fetch(id).await.unwrap().unwrap();
            if job.execution.terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never settled", id);
    }

    #[tokio::test]
    async fn test_chain_runs_in_order() {
        let (engine, _completions) = test_engine("chain_runs_in_order");
        let workflow = WorkflowBuilder::new("unit")
            .append(crate::app::workflows::Task::new("test.noop", 5, 1))
            .append(crate::app::workflows::Task::new("test.flaky", 5, 2))
            .build();
        let job = engine.submit(workflow, test_job()).await.unwrap();
        let job = wait_terminal(&engine, job.uuid).await;
        assert_eq!(job.execution, JobExecution::Succeeded);
        let tasks: Vec<&str> =
            job.chain_results.iter().map(|r| r.task.as_str()).collect();
        // The flaky task fails once and is retried.
        assert_eq!(tasks, vec!["test.noop", "test.flaky", "test.flaky"]);
        assert!(job.chain_results[1].error.is_some());
        assert!(job.chain_results[2].error.is_none());
    }

    #[tokio::test]
    async fn test_failure_takes_error_branch() {
        let (engine, mut completions) =
            test_engine("failure_takes_error_branch");
        let workflow = WorkflowBuilder::new("unit")
            .append(crate::app::workflows::Task::new("test.fail", 5, 1))
            .append(crate::app::workflows::Task::new("test.noop", 5, 1))
            .on_error(crate::app::workflows::Task::new(
                "waitlist.release_tickets",
                5,
                1,
            ))
            .build();
        let job = engine.submit(workflow, test_job()).await.unwrap();
        let job = wait_terminal(&engine, job.uuid).await;
        assert_eq!(job.execution, JobExecution::Failed);
        let tasks: Vec<&str> =
            job.chain_results.iter().map(|r| r.task.as_str()).collect();
        // The rest of the chain is skipped; the error branch runs.
        assert_eq!(tasks, vec!["test.fail", "waitlist.release_tickets"]);

        let completion = completions.recv().await.unwrap();
        assert_eq!(completion.job.uuid, job.uuid);
        assert_eq!(completion.job.execution, JobExecution::Failed);
    }

    #[tokio::test]
    async fn test_task_timeout_fails_the_job() {
        let (engine, _completions) = test_engine("task_timeout");
        let workflow = WorkflowBuilder::new("unit")
            .append(crate::app::workflows::Task::new("test.block", 1, 1))
            .build();
        let job = engine.submit(workflow, test_job()).await.unwrap();
        let job = wait_terminal(&engine, job.uuid).await;
        assert_eq!(job.execution, JobExecution::Failed);
        assert!(job.chain_results[0]
            .error
            .as_ref()
            .unwrap()
            .contains("timed out"));
    }

    #[tokio::test]
    async fn test_cancel_takes_cancel_branch() {
        let (engine, _completions) = test_engine("cancel_branch");
        let workflow = WorkflowBuilder::new("unit")
            .append(crate::app::workflows::Task::new("test.noop", 5, 1))
            .append(crate::app::workflows::Task::new("test.block", 60, 1))
            .on_cancel(crate::app::workflows::Task::new(
                "waitlist.release_tickets",
                5,
                1,
            ))
            .build();
        let job = engine.submit(workflow, test_job()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.job_cancel(job.uuid).await.unwrap();
        let job = wait_terminal(&engine, job.uuid).await;
        assert_eq!(job.execution, JobExecution::Canceled);
        assert_eq!(
            job.chain_results.last().unwrap().task,
            "waitlist.release_tickets"
        );

        // Canceling a settled job is rejected.
        let error = engine.job_cancel(job.uuid).await.unwrap_err();
        assert_eq!(error.code(), "ValidationFailed");
    }
}

