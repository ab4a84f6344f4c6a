// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP client for the firewall API

use crate::clients::service_error;
use crate::clients::CallContext;
use crate::clients::FirewallApi;
use crate::db::model::FirewallRule;
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
impl FirewallApi for Client {
    async fn add_rules(
        &self,
        ctx: &CallContext,
        rules: &[FirewallRule],
    ) -> Result<(), Error> {
        for rule in rules {
            debug!(self.log, "adding firewall rule"; "rule" => %rule.uuid);
            self.client
                .post(self.url("/rules"))
                .header("x-request-id", &ctx.request_id)
                .json(rule)
                .send()
                .await
                .map_err(|e| service_error("fwapi", e))?
                .error_for_status()
                .map_err(|e| service_error("fwapi", e))?;
        }
        Ok(())
    }

    async fn sync_vm(
        &self,
        ctx: &CallContext,
        vm: Uuid,
        owner: Uuid,
        tags: Vec<String>,
    ) -> Result<(), Error> {
        self.client
            .post(self.url(&format!("/firewalls/vms/{}", vm)))
            .header("x-request-id", &ctx.request_id)
            .json(&serde_json::json!({ "owner_uuid": owner, "tags": tags }))
            .send()
            .await
            .map_err(|e| service_error("fwapi", e))?
            .error_for_status()
            .map_err(|e| service_error("fwapi", e))?;
        Ok(())
    }
}
