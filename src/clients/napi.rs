// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP client for the network API

use crate::clients::service_error;
use crate::clients::CallContext;
use crate::clients::Network;
use crate::clients::NetworkApi;
use crate::clients::NicProvisionRequest;
use crate::clients::NicRecord;
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
impl NetworkApi for Client {
    async fn network_get(
        &self,
        ctx: &CallContext,
        uuid: Uuid,
    ) -> Result<Option<Network>, Error> {
        let response = self
            .client
            .get(self.url(&format!("/networks/{}", uuid)))
            .header("x-request-id", &ctx.request_id)
            .send()
            .await
            .map_err(|e| service_error("napi", e))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let network = response
            .error_for_status()
            .map_err(|e| service_error("napi", e))?
            .json()
            .await
            .map_err(|e| service_error("napi", e))?;
        Ok(Some(network))
    }

    async fn network_by_name(
        &self,
        ctx: &CallContext,
        name: &str,
        owner: Uuid,
    ) -> Result<Option<Network>, Error> {
        let networks: Vec<Network> = self
            .client
            .get(self.url("/networks"))
            .query(&[("name", name), ("provisionable_by", &owner.to_string())])
            .header("x-request-id", &ctx.request_id)
            .send()
            .await
            .map_err(|e| service_error("napi", e))?
            .error_for_status()
            .map_err(|e| service_error("napi", e))?
            .json()
            .await
            .map_err(|e| service_error("napi", e))?;
        Ok(networks.into_iter().next())
    }

    async fn ip_usage(
        &self,
        ctx: &CallContext,
        network: Uuid,
        ip: &str,
    ) -> Result<Option<NicRecord>, Error> {
        let response = self
            .client
            .get(self.url(&format!("/networks/{}/ips/{}", network, ip)))
            .header("x-request-id", &ctx.request_id)
            .send()
            .await
            .map_err(|e| service_error("napi", e))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let record = response
            .error_for_status()
            .map_err(|e| service_error("napi", e))?
            .json()
            .await
            .map_err(|e| service_error("napi", e))?;
        Ok(Some(record))
    }

    async fn provision_nic(
        &self,
        ctx: &CallContext,
        request: &NicProvisionRequest,
    ) -> Result<NicRecord, Error> {
        debug!(self.log, "provisioning NIC";
            "vm" => %request.belongs_to_uuid,
            "network" => %request.network_uuid);
        self.client
            .post(self.url("/nics"))
            .header("x-request-id", &ctx.request_id)
            .json(request)
            .send()
            .await
            .map_err(|e| service_error("napi", e))?
            .error_for_status()
            .map_err(|e| service_error("napi", e))?
            .json()
            .await
            .map_err(|e| service_error("napi", e))
    }

    async fn nics_for_vm(
        &self,
        ctx: &CallContext,
        belongs_to: Uuid,
    ) -> Result<Vec<NicRecord>, Error> {
        self.client
            .get(self.url("/nics"))
            .query(&[("belongs_to_uuid", belongs_to.to_string())])
            .header("x-request-id", &ctx.request_id)
            .send()
            .await
            .map_err(|e| service_error("napi", e))?
            .error_for_status()
            .map_err(|e| service_error("napi", e))?
            .json()
            .await
            .map_err(|e| service_error("napi", e))
    }

    async fn delete_nic(
        &self,
        ctx: &CallContext,
        mac: &str,
    ) -> Result<(), Error> {
        let response = self
            .client
            .delete(self.url(&format!("/nics/{}", mac.replace(':', ""))))
            .header("x-request-id", &ctx.request_id)
            .send()
            .await
            .map_err(|e| service_error("napi", e))?;
        // A NIC already gone is not an error on the cleanup paths.
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        response.error_for_status().map_err(|e| service_error("napi", e))?;
        Ok(())
    }

    async fn reserve_ip(
        &self,
        ctx: &CallContext,
        network: Uuid,
        ip: &str,
    ) -> Result<(), Error> {
        self.client
            .put(self.url(&format!("/networks/{}/ips/{}", network, ip)))
            .header("x-request-id", &ctx.request_id)
            .json(&serde_json::json!({ "reserved": true }))
            .send()
            .await
            .map_err(|e| service_error("napi", e))?
            .error_for_status()
            .map_err(|e| service_error("napi", e))?;
        Ok(())
    }

    async fn unreserve_ip(
        &self,
        ctx: &CallContext,
        network: Uuid,
        ip: &str,
    ) -> Result<(), Error> {
        self.client
            .put(self.url(&format!("/networks/{}/ips/{}", network, ip)))
            .header("x-request-id", &ctx.request_id)
            .json(&serde_json::json!({ "reserved": false }))
            .send()
            .await
            .map_err(|e| service_error("napi", e))?
            .error_for_status()
            .map_err(|e| service_error("napi", e))?;
        Ok(())
    }
}
