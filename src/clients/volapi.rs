// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP client for the volume API

use crate::clients::service_error;
use crate::clients::CallContext;
use crate::clients::VolumeApi;
use crate::errors::Error;
use async_trait::async_trait;
use slog::Logger;
use uuid::Uuid;

pub struct Client {
    base_url: String,
    client: reqwest::Client,
    #[allow(dead_code)]
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
}

#[async_trait]
impl VolumeApi for Client {
    async fn add_reference(
        &self,
        ctx: &CallContext,
        volume: &str,
        owner: Uuid,
        vm: Uuid,
    ) -> Result<(), Error> {
        self.client
            .post(format!("{}/volumes/{}/references", self.base_url, volume))
            .header("x-request-id", &ctx.request_id)
            .json(&serde_json::json!({ "owner_uuid": owner, "vm_uuid": vm }))
            .send()
            .await
            .map_err(|e| service_error("volapi", e))?
            .error_for_status()
            .map_err(|e| service_error("volapi", e))?;
        Ok(())
    }

    async fn remove_references(
        &self,
        ctx: &CallContext,
        vm: Uuid,
    ) -> Result<(), Error> {
        self.client
            .delete(format!("{}/references/{}", self.base_url, vm))
            .header("x-request-id", &ctx.request_id)
            .send()
            .await
            .map_err(|e| service_error("volapi", e))?
            .error_for_status()
            .map_err(|e| service_error("volapi", e))?;
        Ok(())
    }
}
