// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP client for the package catalog

use crate::clients::service_error;
use crate::clients::CallContext;
use crate::clients::Package;
use crate::clients::PackageApi;
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
impl PackageApi for Client {
    async fn package_get(
        &self,
        ctx: &CallContext,
        uuid: Uuid,
    ) -> Result<Option<Package>, Error> {
        let response = self
            .client
            .get(format!("{}/packages/{}", self.base_url, uuid))
            .header("x-request-id", &ctx.request_id)
            .send()
            .await
            .map_err(|e| service_error("papi", e))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let package = response
            .error_for_status()
            .map_err(|e| service_error("papi", e))?
            .json()
            .await
            .map_err(|e| service_error("papi", e))?;
        Ok(Some(package))
    }
}
