// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Views are response bodies that are not themselves stored records.

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

/// Body of the 202 returned for every asynchronous mutation
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct JobLocation {
    pub vm_uuid: Uuid,
    pub job_uuid: Uuid,
}

/// Body of `GET /ping`
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct Ping {
    pub ping: String,
    pub store: String,
    pub workflow_executor: String,
}
