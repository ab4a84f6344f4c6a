// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP client for a remote workflow executor
//!
//! Pipelines are pre-loaded in the executor under their workflow names; a
//! submission names the workflow and carries the job parameters.  The
//! executor owns job progression; this client only submits and observes.

use crate::app::workflow::JobExecutor;
use crate::app::workflow::JobsFilter;
use crate::app::workflow::NewJob;
use crate::app::workflows::Workflow;
use crate::clients::service_error;
use crate::db::model::Job;
use crate::errors::Error;
use async_trait::async_trait;
use slog::Logger;
use uuid::Uuid;

pub struct Client {
    base_url: String,
    client: reqwest::Client,
    log: Logger,
}

impl Client {
    pub fn new(base_url: &str, log: Logger) -> Client {
        Client {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            log,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl JobExecutor for Client {
    async fn submit(
        &self,
        workflow: Workflow,
        new_job: NewJob,
    ) -> Result<Job, Error> {
        debug!(self.log, "submitting workflow";
            "workflow" => &workflow.name,
            "vm" => ?new_job.vm_uuid);
        let body = serde_json::json!({
            "workflow": workflow.name,
            "task": new_job.task,
            "vm_uuid": new_job.vm_uuid,
            "mark_as_failed_on_error": new_job.mark_as_failed_on_error,
            "params": {
                "context": new_job.context,
                "payload": new_job.payload,
            },
        });
        self.client
            .post(self.url("/jobs"))
            .header("x-request-id", &new_job.request_id)
            .json(&body)
            .send()
            .await
            .map_err(|e| service_error("wfapi", e))?
            .error_for_status()
            .map_err(|e| service_error("wfapi", e))?
            .json()
            .await
            .map_err(|e| service_error("wfapi", e))
    }

    async fn job_fetch(&self, id: Uuid) -> Result<Option<Job>, Error> {
        let response = self
            .client
            .get(self.url(&format!("/jobs/{}", id)))
            .send()
            .await
            .map_err(|e| service_error("wfapi", e))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let job = response
            .error_for_status()
            .map_err(|e| service_error("wfapi", e))?
            .json()
            .await
            .map_err(|e| service_error("wfapi", e))?;
        Ok(Some(job))
    }

    async fn jobs_list(&self, filter: &JobsFilter) -> Result<Vec<Job>, Error> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(vm) = filter.vm_uuid {
            query.push(("vm_uuid", vm.to_string()));
        }
        if let Some(task) = filter.task {
            query.push(("task", task.to_string()));
        }
        if let Some(execution) = filter.execution {
            query.push((
                "execution",
                serde_json::to_value(execution)
                    .ok()
                    .and_then(|v| v.as_str().map(String::from))
                    .unwrap_or_default(),
            ));
        }
        self.client
            .get(self.url("/jobs"))
            .query(&query)
            .send()
            .await
            .map_err(|e| service_error("wfapi", e))?
            .error_for_status()
            .map_err(|e| service_error("wfapi", e))?
            .json()
            .await
            .map_err(|e| service_error("wfapi", e))
    }

    async fn job_cancel(&self, id: Uuid) -> Result<(), Error> {
        self.client
            .post(self.url(&format!("/jobs/{}/cancel", id)))
            .send()
            .await
            .map_err(|e| service_error("wfapi", e))?
            .error_for_status()
            .map_err(|e| service_error("wfapi", e))?;
        Ok(())
    }
}
