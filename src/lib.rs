// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Library interface to vmapi, the control-plane API for virtual-machine
//! lifecycle

pub mod app;
pub mod clients;
pub mod config;
pub mod context;
pub mod db;
pub mod errors;
pub mod external_api;
pub mod sim;

pub use app::Vmapi;
pub use config::Config;
pub use context::ServerContext;
use clients::Collaborators;
use external_api::http_entrypoints::external_api;
use slog::Logger;
use std::sync::Arc;

#[macro_use]
extern crate slog;

/// Packages up a running vmapi server
pub struct Server {
    /// shared state used by API request handlers
    pub apictx: Arc<ServerContext>,
    /// dropshot server for the external API
    pub http_server: dropshot::HttpServer<Arc<ServerContext>>,
}

impl Server {
    /// Starts a server with the given collaborators bundle (HTTP clients
    /// in production, simulated ones in tests).
    pub async fn start(
        config: &Config,
        log: &Logger,
        collab: Arc<Collaborators>,
    ) -> Result<Server, String> {
        info!(log, "setting up vmapi server");
        let apictx = ServerContext::new(
            log.new(o!("component" => "ServerContext")),
            config,
            collab,
        );
        let http_server = dropshot::ServerBuilder::new(
            external_api(),
            Arc::clone(&apictx),
            log.new(o!("component" => "dropshot_external")),
        )
        .config(config.dropshot_external.clone())
        .start()
        .map_err(|error| format!("initializing http server: {}", error))?;
        Ok(Server { apictx, http_server })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.http_server.local_addr()
    }

    /// Wait for the server to shut down
    ///
    /// Note that this doesn't initiate a graceful shutdown; it blocks
    /// until something else does.
    pub async fn wait_for_finish(self) -> Result<(), String> {
        self.http_server.await
    }
}

/// Builds the HTTP collaborator clients named in the configuration.
fn http_collaborators(
    config: &Config,
    log: &Logger,
) -> Result<Arc<Collaborators>, String> {
    let urls = config
        .collaborators
        .as_ref()
        .ok_or_else(|| "config has no [collaborators] section".to_string())?;
    let client_log = |name: &'static str| log.new(o!("component" => name));
    Ok(Arc::new(Collaborators {
        napi: Arc::new(clients::napi::Client::new(
            &urls.napi_url,
            client_log("NapiClient"),
        )),
        cnapi: Arc::new(clients::cnapi::Client::new(
            &urls.cnapi_url,
            client_log("CnapiClient"),
        )),
        fwapi: Arc::new(clients::fwapi::Client::new(
            &urls.fwapi_url,
            client_log("FwapiClient"),
        )),
        imgapi: Arc::new(clients::imgapi::Client::new(
            &urls.imgapi_url,
            client_log("ImgapiClient"),
        )),
        papi: Arc::new(clients::papi::Client::new(
            &urls.papi_url,
            client_log("PapiClient"),
        )),
        volapi: Arc::new(clients::volapi::Client::new(
            &urls.volapi_url,
            client_log("VolapiClient"),
        )),
    }))
}

/// Run an instance of the [`Server`].
pub async fn run_server(config: &Config) -> Result<(), String> {
    let log = config
        .log
        .to_logger("vmapi")
        .map_err(|message| format!("initializing logger: {}", message))?;
    let collab = http_collaborators(config, &log)?;
    let server = Server::start(config, &log, collab).await?;
    info!(log, "vmapi running"; "local_addr" => %server.local_addr());
    server.wait_for_finish().await
}
