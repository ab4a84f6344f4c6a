// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared test harness: a vmapi server over simulated collaborators

use dropshot::ConfigDropshot;
use dropshot::ConfigLogging;
use dropshot::ConfigLoggingLevel;
use serde_json::json;
use serde_json::Value;
use std::time::Duration;
use std::time::Instant;
use uuid::Uuid;
use vmapi::clients::Image;
use vmapi::clients::Network;
use vmapi::clients::Package;
use vmapi::config::Config;
use vmapi::config::Tunables;
use vmapi::sim;
use vmapi::sim::SimHandles;

pub struct TestContext {
    pub server: vmapi::Server,
    pub client: reqwest::Client,
    pub base_url: String,
    pub sim: SimHandles,
    pub owner: Uuid,
    pub image: Uuid,
    pub network: Uuid,
    pub fabric_network: Uuid,
    pub package_small: Uuid,
    pub package_huge: Uuid,
    pub servers: Vec<Uuid>,
}

pub async fn setup(name: &str) -> TestContext {
    let log_config =
        ConfigLogging::StderrTerminal { level: ConfigLoggingLevel::Error };
    let log = log_config.to_logger(name.to_string()).unwrap();
    let config = Config {
        dropshot_external: ConfigDropshot {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        },
        log: log_config,
        workflow_api_url: "http://workflow.test.example.com".to_string(),
        tunables: Tunables {
            reconciler_period_secs: 1,
            ..Default::default()
        },
        collaborators: None,
    };

    let (collab, sim) = sim::collaborators();
    let owner = Uuid::new_v4();
    let network = Uuid::new_v4();
    let fabric_network = Uuid::new_v4();
    let image = Uuid::new_v4();
    let package_small = Uuid::new_v4();
    let package_huge = Uuid::new_v4();
    let servers = vec![Uuid::new_v4(), Uuid::new_v4()];

    sim.napi.add_network(Network {
        uuid: network,
        name: "external".to_string(),
        owner_uuid: None,
        fabric: false,
        nic_tag: "external".to_string(),
        resolvers: vec!["8.8.8.8".to_string()],
        routes: Default::default(),
    });
    sim.napi.add_network(Network {
        uuid: fabric_network,
        name: "customer-fabric".to_string(),
        owner_uuid: Some(owner),
        fabric: true,
        nic_tag: "sdc_overlay".to_string(),
        resolvers: Vec::new(),
        routes: Default::default(),
    });
    sim.imgapi.add_image(Image {
        uuid: image,
        name: "base-64-lts".to_string(),
        generate_passwords: false,
    });
    sim.papi.add_package(Package {
        uuid: package_small,
        name: "sample-256M".to_string(),
        max_physical_memory: 256,
        quota: 10,
        cpu_cap: Some(100),
        max_swap: Some(512),
        max_lwps: Some(2000),
        zfs_io_priority: Some(100),
        flexible_disk: false,
    });
    // Absurdly large, so resize-up can never fit.
    sim.papi.add_package(Package {
        uuid: package_huge,
        name: "sample-huge".to_string(),
        max_physical_memory: 10 * (1u64 << 40),
        quota: 100,
        cpu_cap: None,
        max_swap: None,
        max_lwps: None,
        zfs_io_priority: None,
        flexible_disk: false,
    });
    for server in &servers {
        sim.cnapi.add_server(*server, 8192);
    }

    let server = vmapi::Server::start(&config, &log, collab).await.unwrap();
    let base_url = format!("http://{}", server.local_addr());
    TestContext {
        server,
        client: reqwest::Client::new(),
        base_url,
        sim,
        owner,
        image,
        network,
        fabric_network,
        package_small,
        package_huge,
        servers,
    }
}

impl TestContext {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client.get(self.url(path)).send().await.unwrap()
    }

    pub async fn get_json(&self, path: &str) -> Value {
        let response = self.get(path).await;
        assert!(
            response.status().is_success(),
            "GET {} failed: {}",
            path,
            response.status()
        );
        response.json().await.unwrap()
    }

    pub async fn post(&self, path: &str, body: &Value) -> reqwest::Response {
        self.client.post(self.url(path)).json(body).send().await.unwrap()
    }

    /// A minimal valid provision body against the seeded fixtures.
    pub fn provision_body(&self) -> Value {
        json!({
            "owner_uuid": self.owner.to_string(),
            "brand": "joyent-minimal",
            "image_uuid": self.image.to_string(),
            "billing_id": self.package_small.to_string(),
            "ram": 256,
            "networks": [{"uuid": self.network.to_string()}],
        })
    }

    /// Provisions a VM and returns `(vm_uuid, job_uuid)` without waiting.
    pub async fn provision(&self, body: &Value) -> (Uuid, Uuid) {
        let response = self.post("/vms", body).await;
        assert_eq!(
            response.status(),
            reqwest::StatusCode::ACCEPTED,
            "provision rejected: {}",
            response.text().await.unwrap_or_default()
        );
        let accepted: Value = response.json().await.unwrap();
        (
            accepted["vm_uuid"].as_str().unwrap().parse().unwrap(),
            accepted["job_uuid"].as_str().unwrap().parse().unwrap(),
        )
    }

    /// Provisions a VM and waits for the pipeline to succeed.
    pub async fn provision_and_wait(&self, body: &Value) -> Uuid {
        let (vm, job) = self.provision(body).await;
        let job = self.wait_job(job).await;
        assert_eq!(job["execution"], "succeeded", "provision job: {}", job);
        vm
    }

    /// Submits an action body and returns the job uuid from the 202.
    pub async fn action(&self, vm: Uuid, body: &Value) -> Uuid {
        let response = self.post(&format!("/vms/{}", vm), body).await;
        assert_eq!(
            response.status(),
            reqwest::StatusCode::ACCEPTED,
            "action rejected: {}",
            response.text().await.unwrap_or_default()
        );
        let accepted: Value = response.json().await.unwrap();
        accepted["job_uuid"].as_str().unwrap().parse().unwrap()
    }

    pub async fn action_and_wait(&self, vm: Uuid, body: &Value) -> Value {
        let job = self.action(vm, body).await;
        let job = self.wait_job(job).await;
        assert_eq!(job["execution"], "succeeded", "job: {}", job);
        job
    }

    /// Polls a job until it reaches a terminal execution.
    pub async fn wait_job(&self, job: Uuid) -> Value {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let record = self.get_json(&format!("/jobs/{}", job)).await;
            match record["execution"].as_str().unwrap() {
                "succeeded" | "failed" | "canceled" => return record,
                _ => {}
            }
            assert!(
                Instant::now() < deadline,
                "job {} did not settle: {}",
                job,
                record
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Polls a VM until it reports the wanted state (reconciliation is
    /// asynchronous).
    pub async fn wait_vm_state(&self, vm: Uuid, state: &str) -> Value {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let record = self.get_json(&format!("/vms/{}", vm)).await;
            if record["state"] == state {
                return record;
            }
            assert!(
                Instant::now() < deadline,
                "VM {} never reached {}: {}",
                vm,
                state,
                record
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}
