// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP client for the compute-node API

use crate::clients::service_error;
use crate::clients::CallContext;
use crate::clients::CnapiProvisionPayload;
use crate::clients::ComputeApi;
use crate::clients::Locality;
use crate::clients::MachineAction;
use crate::clients::MachineStatus;
use crate::clients::ServerCapacity;
use crate::errors::Error;
use async_trait::async_trait;
use serde::Deserialize;
use slog::Logger;
use uuid::Uuid;

pub struct Client {
    base_url: String,
    client: reqwest::Client,
    log: Logger,
}

#[derive(Deserialize)]
struct TaskRef {
    id: String,
}

#[derive(Deserialize)]
struct TaskStatus {
    status: String,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct AllocationResult {
    server_uuid: Uuid,
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

    async fn post_task<B: serde::Serialize>(
        &self,
        ctx: &CallContext,
        path: &str,
        body: &B,
    ) -> Result<String, Error> {
        let task: TaskRef = self
            .client
            .post(self.url(path))
            .header("x-request-id", &ctx.request_id)
            .json(body)
            .send()
            .await
            .map_err(|e| service_error("cnapi", e))?
            .error_for_status()
            .map_err(|e| service_error("cnapi", e))?
            .json()
            .await
            .map_err(|e| service_error("cnapi", e))?;
        Ok(task.id)
    }
}

#[async_trait]
impl ComputeApi for Client {
    async fn allocate_server(
        &self,
        ctx: &CallContext,
        ram: u64,
        locality: Option<&Locality>,
    ) -> Result<Uuid, Error> {
        let body = serde_json::json!({ "ram": ram, "locality": locality });
        let allocation: AllocationResult = self
            .client
            .post(self.url("/allocate"))
            .header("x-request-id", &ctx.request_id)
            .json(&body)
            .send()
            .await
            .map_err(|e| service_error("cnapi", e))?
            .error_for_status()
            .map_err(|e| service_error("cnapi", e))?
            .json()
            .await
            .map_err(|e| service_error("cnapi", e))?;
        debug!(self.log, "allocated server";
            "server" => %allocation.server_uuid, "ram" => ram);
        Ok(allocation.server_uuid)
    }

    async fn server_capacity(
        &self,
        ctx: &CallContext,
        server: Uuid,
    ) -> Result<ServerCapacity, Error> {
        self.client
            .get(self.url(&format!("/servers/{}/capacity", server)))
            .header("x-request-id", &ctx.request_id)
            .send()
            .await
            .map_err(|e| service_error("cnapi", e))?
            .error_for_status()
            .map_err(|e| service_error("cnapi", e))?
            .json()
            .await
            .map_err(|e| service_error("cnapi", e))
    }

    async fn provision_vm(
        &self,
        ctx: &CallContext,
        server: Uuid,
        payload: &CnapiProvisionPayload,
    ) -> Result<String, Error> {
        self.post_task(ctx, &format!("/servers/{}/vms", server), payload).await
    }

    async fn machine_action(
        &self,
        ctx: &CallContext,
        server: Uuid,
        vm: Uuid,
        action: &MachineAction,
    ) -> Result<String, Error> {
        self.post_task(
            ctx,
            &format!("/servers/{}/vms/{}/tasks", server, vm),
            action,
        )
        .await
    }

    async fn wait_task(
        &self,
        ctx: &CallContext,
        task_id: &str,
    ) -> Result<(), Error> {
        // The agent holds the request open until the task settles.
        let status: TaskStatus = self
            .client
            .get(self.url(&format!("/tasks/{}/wait", task_id)))
            .header("x-request-id", &ctx.request_id)
            .send()
            .await
            .map_err(|e| service_error("cnapi", e))?
            .error_for_status()
            .map_err(|e| service_error("cnapi", e))?
            .json()
            .await
            .map_err(|e| service_error("cnapi", e))?;
        if status.status == "complete" {
            Ok(())
        } else {
            Err(Error::internal_error(&format!(
                "compute node task {} failed: {}",
                task_id,
                status.error.as_deref().unwrap_or("no details")
            )))
        }
    }

    async fn vm_status(
        &self,
        ctx: &CallContext,
        server: Uuid,
        vm: Uuid,
    ) -> Result<Option<MachineStatus>, Error> {
        let response = self
            .client
            .get(self.url(&format!("/servers/{}/vms/{}", server, vm)))
            .header("x-request-id", &ctx.request_id)
            .send()
            .await
            .map_err(|e| service_error("cnapi", e))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let status = response
            .error_for_status()
            .map_err(|e| service_error("cnapi", e))?
            .json()
            .await
            .map_err(|e| service_error("cnapi", e))?;
        Ok(Some(status))
    }

    async fn filesystem_details(
        &self,
        ctx: &CallContext,
        server: Uuid,
        vm: Uuid,
    ) -> Result<serde_json::Value, Error> {
        self.client
            .get(self.url(&format!("/servers/{}/vms/{}/filesystem", server, vm)))
            .header("x-request-id", &ctx.request_id)
            .send()
            .await
            .map_err(|e| service_error("cnapi", e))?
            .error_for_status()
            .map_err(|e| service_error("cnapi", e))?
            .json()
            .await
            .map_err(|e| service_error("cnapi", e))
    }

    async fn set_do_not_inventory(
        &self,
        ctx: &CallContext,
        server: Uuid,
        vm: Uuid,
        flag: bool,
    ) -> Result<(), Error> {
        self.client
            .put(self.url(&format!("/servers/{}/vms/{}/inventory", server, vm)))
            .header("x-request-id", &ctx.request_id)
            .json(&serde_json::json!({ "do_not_inventory": flag }))
            .send()
            .await
            .map_err(|e| service_error("cnapi", e))?
            .error_for_status()
            .map_err(|e| service_error("cnapi", e))?;
        Ok(())
    }

    async fn remove_quota(
        &self,
        ctx: &CallContext,
        server: Uuid,
        vm: Uuid,
    ) -> Result<(), Error> {
        self.client
            .delete(self.url(&format!("/servers/{}/vms/{}/quota", server, vm)))
            .header("x-request-id", &ctx.request_id)
            .send()
            .await
            .map_err(|e| service_error("cnapi", e))?
            .error_for_status()
            .map_err(|e| service_error("cnapi", e))?;
        Ok(())
    }
}
