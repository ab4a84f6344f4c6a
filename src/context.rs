// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared state used by API request handlers

use crate::app::Vmapi;
use crate::clients::CallContext;
use crate::clients::Collaborators;
use crate::config::Config;
use crate::db::model::JobContext;
use dropshot::RequestContext;
use slog::Logger;
use std::sync::Arc;

/// Shared state available to all API request handlers
pub struct ServerContext {
    /// reference to the underlying engine
    pub vmapi: Arc<Vmapi>,
    /// debug log
    pub log: Logger,
}

impl ServerContext {
    /// Create a new context.  This creates the underlying engine as well;
    /// the collaborators bundle comes from the composition root.
    pub fn new(
        log: Logger,
        config: &Config,
        collab: Arc<Collaborators>,
    ) -> Arc<ServerContext> {
        let vmapi =
            Vmapi::new(log.new(o!("component" => "vmapi")), config, collab);
        vmapi.start_background_tasks();
        Arc::new(ServerContext { vmapi, log })
    }
}

/// Extracts the per-request caller context.
///
/// `x-request-id` is honored when the caller supplies one (and propagated
/// on every outbound call); otherwise the server-assigned request id is
/// used.  `x-context` carries the JSON caller record that ends up in each
/// job's `params.context`.
pub fn caller_context(
    rqctx: &RequestContext<Arc<ServerContext>>,
) -> (CallContext, JobContext) {
    let headers = rqctx.request.headers();
    let request_id = headers
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| rqctx.request_id.clone());
    let context = headers
        .get("x-context")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| serde_json::from_str::<JobContext>(value).ok())
        .unwrap_or_default();
    (CallContext::new(&request_id), context)
}
