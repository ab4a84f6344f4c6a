// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for parsing configuration files and working with the server
//! configuration

use dropshot::ConfigDropshot;
use dropshot::ConfigLogging;
use serde::Deserialize;
use serde::Serialize;
use std::path::Path;

/// Default (and cap) for the `limit` list parameter
pub const DEFAULT_LIST_LIMIT: usize = 1000;

/// Tunable parameters, intended for test environments and other situations
/// in which experimentation is valuable.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Tunables {
    /// server-side cap on the `limit` list parameter
    #[serde(default = "Tunables::default_max_list_limit")]
    pub max_list_limit: usize,
    /// how long a waitlist ticket may stay active before it can be expired
    #[serde(default = "Tunables::default_ticket_lease_secs")]
    pub ticket_lease_secs: u64,
    /// period of the reconciler's sweep over terminal jobs
    #[serde(default = "Tunables::default_reconciler_period_secs")]
    pub reconciler_period_secs: u64,
}

impl Tunables {
    fn default_max_list_limit() -> usize {
        DEFAULT_LIST_LIMIT
    }

    fn default_ticket_lease_secs() -> u64 {
        600
    }

    fn default_reconciler_period_secs() -> u64 {
        5
    }
}

impl Default for Tunables {
    fn default() -> Tunables {
        Tunables {
            max_list_limit: Tunables::default_max_list_limit(),
            ticket_lease_secs: Tunables::default_ticket_lease_secs(),
            reconciler_period_secs: Tunables::default_reconciler_period_secs(),
        }
    }
}

/// Where to reach the collaborating services
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct CollaboratorsConfig {
    pub napi_url: String,
    pub cnapi_url: String,
    pub fwapi_url: String,
    pub imgapi_url: String,
    pub papi_url: String,
    pub volapi_url: String,
    /// remote workflow executor; when absent, the in-process engine runs
    /// the pipelines
    #[serde(default)]
    pub wfapi_url: Option<String>,
}

/// Configuration for a vmapi server
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Config {
    /// Dropshot configuration for the API server
    pub dropshot_external: ConfigDropshot,
    /// Server-wide logging configuration
    pub log: ConfigLogging,
    /// Advertised in the `workflow-api` header of mutation responses
    pub workflow_api_url: String,
    #[serde(default)]
    pub tunables: Tunables,
    #[serde(default)]
    pub collaborators: Option<CollaboratorsConfig>,
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("read \"{path}\": {err}")]
    Io { path: String, err: std::io::Error },
    #[error("parse \"{path}\": {err}")]
    Parse { path: String, err: toml::de::Error },
}

impl Config {
    /// Load a `Config` from the given TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Config, LoadError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|err| {
            LoadError::Io { path: path.display().to_string(), err }
        })?;
        toml::from_str(&contents).map_err(|err| LoadError::Parse {
            path: path.display().to_string(),
            err,
        })
    }
}

#[cfg(test)]
mod test {
    use super::Config;
    use super::DEFAULT_LIST_LIMIT;

    #[test]
    fn test_parse_config() {
        let config: Config = toml::from_str(
            r#"
            workflow_api_url = "http://workflow.example.com"

            [dropshot_external]
            bind_address = "127.0.0.1:8080"

            [log]
            mode = "stderr-terminal"
            level = "info"

            [collaborators]
            napi_url = "http://napi.example.com"
            cnapi_url = "http://cnapi.example.com"
            fwapi_url = "http://fwapi.example.com"
            imgapi_url = "http://imgapi.example.com"
            papi_url = "http://papi.example.com"
            volapi_url = "http://volapi.example.com"
            "#,
        )
        .unwrap();
        assert_eq!(config.tunables.max_list_limit, DEFAULT_LIST_LIMIT);
        assert_eq!(config.tunables.ticket_lease_secs, 600);
        let collaborators = config.collaborators.unwrap();
        assert!(collaborators.wfapi_url.is_none());
        assert_eq!(collaborators.napi_url, "http://napi.example.com");
    }

    #[test]
    fn test_tunables_override() {
        let config: Config = toml::from_str(
            r#"
            workflow_api_url = "http://workflow.example.com"

            [dropshot_external]
            bind_address = "127.0.0.1:0"

            [log]
            mode = "stderr-terminal"
            level = "error"

            [tunables]
            max_list_limit = 50
            ticket_lease_secs = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.tunables.max_list_limit, 50);
        assert_eq!(config.tunables.ticket_lease_secs, 10);
        assert_eq!(config.tunables.reconciler_period_secs, 5);
    }
}
