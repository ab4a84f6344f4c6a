// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The VM mutation engine
//!
//! [`Vmapi`] is the composition root: it owns the store, the waitlist, the
//! collaborators bundle, and the job executor, and exposes the operations
//! the HTTP entrypoints call.

pub mod background;
pub mod tag;
pub mod validate;
pub mod vm;
pub mod waitlist;
pub mod workflow;
pub mod workflows;

use crate::app::background::reconciler::Reconciler;
use crate::app::waitlist::Waitlist;
use crate::app::workflow::JobCompletion;
use crate::app::workflow::JobExecutor;
use crate::app::workflow::JobsFilter;
use crate::app::workflow::WorkflowEngine;
use crate::clients::wfapi;
use crate::clients::Collaborators;
use crate::config::Config;
use crate::config::Tunables;
use crate::db::model::Job;
use crate::db::Datastore;
use crate::errors::Error;
use slog::Logger;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

pub struct Vmapi {
    pub log: Logger,
    pub(crate) datastore: Arc<Datastore>,
    pub(crate) collab: Arc<Collaborators>,
    pub(crate) executor: Arc<dyn JobExecutor>,
    pub(crate) waitlist: Arc<Waitlist>,
    pub(crate) tunables: Tunables,
    workflow_api_url: String,
    completions: Mutex<Option<UnboundedReceiver<JobCompletion>>>,
    background: Mutex<Option<background::Driver>>,
}

impl Vmapi {
    /// Creates the engine.  The collaborators bundle is injected by the
    /// caller: HTTP clients in production, the simulated ones in tests.
    pub fn new(
        log: Logger,
        config: &Config,
        collab: Arc<Collaborators>,
    ) -> Arc<Vmapi> {
        let datastore = Arc::new(Datastore::new(
            log.new(o!("component" => "datastore")),
        ));
        datastore.setup_buckets();
        let waitlist = Arc::new(Waitlist::new(
            log.new(o!("component" => "waitlist")),
            Duration::from_secs(config.tunables.ticket_lease_secs),
        ));

        let remote_executor = config
            .collaborators
            .as_ref()
            .and_then(|c| c.wfapi_url.clone());
        let (executor, completions): (
            Arc<dyn JobExecutor>,
            Option<UnboundedReceiver<JobCompletion>>,
        ) = match remote_executor {
            Some(url) => {
                info!(log, "using remote workflow executor"; "url" => &url);
                (
                    Arc::new(wfapi::Client::new(
                        &url,
                        log.new(o!("component" => "WfapiClient")),
                    )),
                    None,
                )
            }
            None => {
                let (engine, receiver) = WorkflowEngine::new(
                    log.new(o!("component" => "WorkflowEngine")),
                    workflows::action_registry(),
                    Arc::clone(&datastore),
                    Arc::clone(&collab),
                    Arc::clone(&waitlist),
                );
                (Arc::new(engine), Some(receiver))
            }
        };

        Arc::new(Vmapi {
            log,
            datastore,
            collab,
            executor,
            waitlist,
            tunables: config.tunables.clone(),
            workflow_api_url: config.workflow_api_url.clone(),
            completions: Mutex::new(completions),
            background: Mutex::new(None),
        })
    }

    /// Starts the reconciler: the completion-channel listener plus the
    /// periodic sweep backstop.
    pub fn start_background_tasks(self: &Arc<Self>) {
        let reconciler = Arc::new(Reconciler::new(
            self.log.new(o!("component" => "reconciler")),
            Arc::clone(&self.datastore),
            Arc::clone(&self.collab),
            Arc::clone(&self.executor),
            Arc::clone(&self.waitlist),
        ));
        if let Some(receiver) = self.completions.lock().unwrap().take() {
            reconciler.spawn_listener(receiver);
        }
        let mut driver = background::Driver::new(self.log.clone());
        driver.register(
            "reconciler_sweep",
            Duration::from_secs(self.tunables.reconciler_period_secs),
            reconciler,
        );
        *self.background.lock().unwrap() = Some(driver);
    }

    pub fn workflow_api_url(&self) -> &str {
        &self.workflow_api_url
    }

    pub async fn job_fetch(&self, uuid: Uuid) -> Result<Job, Error> {
        self.executor
            .job_fetch(uuid)
            .await?
            .ok_or_else(|| Error::job_not_found(&uuid))
    }

    pub async fn jobs_list(
        &self,
        filter: &JobsFilter,
    ) -> Result<Vec<Job>, Error> {
        self.executor.jobs_list(filter).await
    }

    pub async fn job_cancel(&self, uuid: Uuid) -> Result<Job, Error> {
        self.executor.job_cancel(uuid).await?;
        self.job_fetch(uuid).await
    }

    /// Liveness: the store must be ready and the executor reachable.
    pub async fn ping(&self) -> crate::external_api::views::Ping {
        let store = match self.datastore.check_ready() {
            Ok(()) => "ok",
            Err(_) => "offline",
        };
        let executor = match self.executor.jobs_list(&JobsFilter::default()).await
        {
            Ok(_) => "ok",
            Err(_) => "offline",
        };
        crate::external_api::views::Ping {
            ping: "pong".to_string(),
            store: store.to_string(),
            workflow_executor: executor.to_string(),
        }
    }
}
