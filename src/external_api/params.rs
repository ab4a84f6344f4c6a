// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Params define the request bodies and query parameters of the API.
//!
//! Mutation bodies deserialize into one named record per action; the
//! validator turns these raw records into normalized payloads.

use crate::db::model::VmDisk;
use crate::errors::Error;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Create-time parameters for a VM (`POST /vms`)
///
/// Everything is optional at this layer; the validator owns the required
/// field policy so that it can report every missing field at once.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, Serialize)]
pub struct ProvisionParams {
    pub uuid: Option<String>,
    pub owner_uuid: Option<String>,
    pub brand: Option<String>,
    pub image_uuid: Option<String>,
    /// network references: uuid strings or `{uuid}` / `{name}` objects,
    /// optionally carrying `ipv4_ips`
    pub networks: Option<Value>,
    pub ram: Option<u64>,
    pub billing_id: Option<String>,
    pub alias: Option<String>,
    pub autoboot: Option<bool>,
    pub quota: Option<u64>,
    pub cpu_cap: Option<u64>,
    pub cpu_shares: Option<u64>,
    pub max_swap: Option<u64>,
    pub max_lwps: Option<u64>,
    pub zfs_io_priority: Option<u64>,
    pub tags: Option<BTreeMap<String, Value>>,
    pub customer_metadata: Option<BTreeMap<String, String>>,
    pub internal_metadata: Option<BTreeMap<String, Value>>,
    pub firewall_rules: Option<Value>,
    pub locality: Option<Value>,
    pub disks: Option<Vec<VmDisk>>,
    pub volumes: Option<Vec<String>>,
    /// docker-brand provision; unlocks the reserved docker tags
    pub docker: Option<bool>,
    /// operator-pinned placement, bypassing allocation
    pub server_uuid: Option<String>,
}

/// Updateable properties of a VM (`POST /vms/:uuid` with `action=update`)
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, Serialize)]
pub struct UpdateParams {
    pub owner_uuid: Option<String>,
    pub alias: Option<String>,
    pub autoboot: Option<bool>,
    /// package change; resize-up consults server capacity
    pub billing_id: Option<String>,
    /// replaces the whole tag set
    pub tags: Option<BTreeMap<String, Value>>,
    pub customer_metadata: Option<BTreeMap<String, String>>,
    pub internal_metadata: Option<BTreeMap<String, Value>>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, Serialize)]
pub struct AddNicsParams {
    pub networks: Option<Value>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, Serialize)]
pub struct RemoveNicsParams {
    pub macs: Option<Vec<String>>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, Serialize)]
pub struct SnapshotParams {
    pub snapshot_name: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, Serialize)]
pub struct ReprovisionParams {
    pub image_uuid: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, Serialize)]
pub struct MigrateParams {
    pub migration_action: Option<String>,
    /// chain begin → sync → switch without further requests
    pub automatic: Option<bool>,
}

/// Parses the per-action parameters out of a `POST /vms/:uuid` body.
pub fn action_params<T: DeserializeOwned>(body: &Value) -> Result<T, Error> {
    serde_json::from_value(body.clone()).map_err(|e| {
        Error::invalid_field("params", "Invalid", &e.to_string())
    })
}

/// Query parameters accepted by `GET /vms` and `HEAD /vms`
///
/// `tag.<key>` filters are collected from the raw query string by the
/// handler since their names are not known statically.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema)]
pub struct ListVmsQuery {
    pub uuid: Option<String>,
    pub owner_uuid: Option<String>,
    pub brand: Option<String>,
    pub state: Option<String>,
    pub alias: Option<String>,
    pub ram: Option<u64>,
    pub server_uuid: Option<String>,
    pub billing_id: Option<String>,
    /// LDAP-style filter string
    pub query: Option<String>,
    /// JSON predicate tree
    pub predicate: Option<String>,
    /// comma-separated field projection
    pub fields: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    /// `<field>.<asc|desc>`
    pub sort: Option<String>,
}

/// Query parameters accepted by the job listing endpoints
#[derive(Clone, Debug, Default, Deserialize, JsonSchema)]
pub struct ListJobsQuery {
    pub vm_uuid: Option<String>,
    pub task: Option<String>,
    pub execution: Option<String>,
}

#[derive(Deserialize, JsonSchema)]
pub struct VmPathParam {
    /// The VM's unique ID.
    pub uuid: String,
}

#[derive(Deserialize, JsonSchema)]
pub struct JobPathParam {
    /// The job's unique ID.
    pub uuid: String,
}

#[derive(Deserialize, JsonSchema)]
pub struct TagPathParam {
    pub uuid: String,
    pub key: String,
}
