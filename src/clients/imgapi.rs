// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP client for the image API

use crate::clients::service_error;
use crate::clients::CallContext;
use crate::clients::Image;
use crate::clients::ImageApi;
use crate::errors::Error;
use async_trait::async_trait;
use serde::Deserialize;
use slog::Logger;
use uuid::Uuid;

pub struct Client {
    base_url: String,
    client: reqwest::Client,
    #[allow(dead_code)]
    log: Logger,
}

#[derive(Deserialize)]
struct EnsureTask {
    id: String,
}

#[derive(Deserialize)]
struct EnsureStatus {
    state: String,
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
impl ImageApi for Client {
    async fn image_get(
        &self,
        ctx: &CallContext,
        uuid: Uuid,
    ) -> Result<Option<Image>, Error> {
        let response = self
            .client
            .get(self.url(&format!("/images/{}", uuid)))
            .header("x-request-id", &ctx.request_id)
            .send()
            .await
            .map_err(|e| service_error("imgapi", e))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let image = response
            .error_for_status()
            .map_err(|e| service_error("imgapi", e))?
            .json()
            .await
            .map_err(|e| service_error("imgapi", e))?;
        Ok(Some(image))
    }

    async fn ensure_image(
        &self,
        ctx: &CallContext,
        server: Uuid,
        image: Uuid,
    ) -> Result<String, Error> {
        let task: EnsureTask = self
            .client
            .post(self.url(&format!("/images/{}/ensure", image)))
            .header("x-request-id", &ctx.request_id)
            .json(&serde_json::json!({ "server_uuid": server }))
            .send()
            .await
            .map_err(|e| service_error("imgapi", e))?
            .error_for_status()
            .map_err(|e| service_error("imgapi", e))?
            .json()
            .await
            .map_err(|e| service_error("imgapi", e))?;
        Ok(task.id)
    }

    async fn wait_image(
        &self,
        ctx: &CallContext,
        task_id: &str,
    ) -> Result<(), Error> {
        let status: EnsureStatus = self
            .client
            .get(self.url(&format!("/tasks/{}/wait", task_id)))
            .header("x-request-id", &ctx.request_id)
            .send()
            .await
            .map_err(|e| service_error("imgapi", e))?
            .error_for_status()
            .map_err(|e| service_error("imgapi", e))?
            .json()
            .await
            .map_err(|e| service_error("imgapi", e))?;
        if status.state == "ready" {
            Ok(())
        } else {
            Err(Error::internal_error(&format!(
                "image ensure task {} ended in state {:?}",
                task_id, status.state
            )))
        }
    }
}
