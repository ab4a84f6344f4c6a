// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated collaborators
//!
//! In-memory implementations of the collaborator traits for tests and
//! development, with seeding and failure injection.  These model just
//! enough behavior for the control plane to be exercised end to end:
//! NAPI hands out addresses and tracks NIC records, CNAPI tracks per-server
//! capacity and always-succeeding agent tasks (unless told to fail), and
//! the rest acknowledge.

use crate::clients::CallContext;
use crate::clients::CnapiProvisionPayload;
use crate::clients::Collaborators;
use crate::clients::ComputeApi;
use crate::clients::FirewallApi;
use crate::clients::Image;
use crate::clients::ImageApi;
use crate::clients::Locality;
use crate::clients::MachineAction;
use crate::clients::MachineStatus;
use crate::clients::Network;
use crate::clients::NetworkApi;
use crate::clients::NicProvisionRequest;
use crate::clients::NicRecord;
use crate::clients::Package;
use crate::clients::PackageApi;
use crate::clients::ServerCapacity;
use crate::clients::VolumeApi;
use crate::db::model::FirewallRule;
use crate::db::model::NicState;
use crate::db::model::VmState;
use crate::errors::Error;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use uuid::Uuid;

/// Simulated network API
pub struct SimNapi {
    networks: Mutex<Vec<Network>>,
    nics: Mutex<Vec<NicRecord>>,
    used_ips: Mutex<HashMap<(Uuid, String), Uuid>>,
    reserved_ips: Mutex<Vec<(Uuid, String)>>,
    next_ip: AtomicU64,
    next_mac: AtomicU64,
}

impl SimNapi {
    pub fn new() -> SimNapi {
        SimNapi {
            networks: Mutex::new(Vec::new()),
            nics: Mutex::new(Vec::new()),
            used_ips: Mutex::new(HashMap::new()),
            reserved_ips: Mutex::new(Vec::new()),
            next_ip: AtomicU64::new(10),
            next_mac: AtomicU64::new(1),
        }
    }

    pub fn add_network(&self, network: Network) {
        self.networks.lock().unwrap().push(network);
    }

    /// Marks `ip` as held by `vm` on `network`, as if another VM's NIC
    /// owned it.
    pub fn claim_ip(&self, network: Uuid, ip: &str, vm: Uuid) {
        self.used_ips
            .lock()
            .unwrap()
            .insert((network, ip.to_string()), vm);
    }

    pub fn nic_count(&self, belongs_to: Uuid) -> usize {
        self.nics
            .lock()
            .unwrap()
            .iter()
            .filter(|nic| nic.belongs_to_uuid == belongs_to)
            .count()
    }

    pub fn reserved_ips(&self) -> Vec<(Uuid, String)> {
        self.reserved_ips.lock().unwrap().clone()
    }

    fn mint_mac(&self) -> String {
        let n = self.next_mac.fetch_add(1, Ordering::SeqCst);
        format!(
            "90:b8:d0:{:02x}:{:02x}:{:02x}",
            (n >> 16) & 0xff,
            (n >> 8) & 0xff,
            n & 0xff
        )
    }

    fn mint_ip(&self) -> String {
        let n = self.next_ip.fetch_add(1, Ordering::SeqCst);
        format!("10.0.{}.{}", (n >> 8) & 0xff, n & 0xff)
    }
}

#[async_trait]
impl NetworkApi for SimNapi {
    async fn network_get(
        &self,
        _ctx: &CallContext,
        uuid: Uuid,
    ) -> Result<Option<Network>, Error> {
        Ok(self
            .networks
            .lock()
            .unwrap()
            .iter()
            .find(|n| n.uuid == uuid)
            .cloned())
    }

    async fn network_by_name(
        &self,
        _ctx: &CallContext,
        name: &str,
        owner: Uuid,
    ) -> Result<Option<Network>, Error> {
        Ok(self
            .networks
            .lock()
            .unwrap()
            .iter()
            .find(|n| {
                n.name == name
                    && (n.owner_uuid.is_none() || n.owner_uuid == Some(owner))
            })
            .cloned())
    }

    async fn ip_usage(
        &self,
        _ctx: &CallContext,
        network: Uuid,
        ip: &str,
    ) -> Result<Option<NicRecord>, Error> {
        if let Some(vm) =
            self.used_ips.lock().unwrap().get(&(network, ip.to_string()))
        {
            return Ok(Some(NicRecord {
                mac: "00:00:5e:00:53:01".to_string(),
                ip: Some(ip.to_string()),
                nic_tag: "external".to_string(),
                network_uuid: network,
                belongs_to_uuid: *vm,
                belongs_to_type: "zone".to_string(),
                primary: true,
                state: NicState::Running,
            }));
        }
        Ok(self
            .nics
            .lock()
            .unwrap()
            .iter()
            .find(|nic| {
                nic.network_uuid == network && nic.ip.as_deref() == Some(ip)
            })
            .cloned())
    }

    async fn provision_nic(
        &self,
        _ctx: &CallContext,
        request: &NicProvisionRequest,
    ) -> Result<NicRecord, Error> {
        let network = self
            .networks
            .lock()
            .unwrap()
            .iter()
            .find(|n| n.uuid == request.network_uuid)
            .cloned()
            .ok_or_else(|| {
                Error::no_such_network(&request.network_uuid.to_string())
            })?;
        let record = NicRecord {
            mac: self.mint_mac(),
            ip: Some(
                request.ip.clone().unwrap_or_else(|| self.mint_ip()),
            ),
            nic_tag: network.nic_tag.clone(),
            network_uuid: network.uuid,
            belongs_to_uuid: request.belongs_to_uuid,
            belongs_to_type: request.belongs_to_type.clone(),
            primary: request.primary,
            state: NicState::Provisioning,
        };
        self.nics.lock().unwrap().push(record.clone());
        Ok(record)
    }

    async fn nics_for_vm(
        &self,
        _ctx: &CallContext,
        belongs_to: Uuid,
    ) -> Result<Vec<NicRecord>, Error> {
        Ok(self
            .nics
            .lock()
            .unwrap()
            .iter()
            .filter(|nic| nic.belongs_to_uuid == belongs_to)
            .cloned()
            .collect())
    }

    async fn delete_nic(
        &self,
        _ctx: &CallContext,
        mac: &str,
    ) -> Result<(), Error> {
        self.nics.lock().unwrap().retain(|nic| nic.mac != mac);
        Ok(())
    }

    async fn reserve_ip(
        &self,
        _ctx: &CallContext,
        network: Uuid,
        ip: &str,
    ) -> Result<(), Error> {
        self.reserved_ips.lock().unwrap().push((network, ip.to_string()));
        Ok(())
    }

    async fn unreserve_ip(
        &self,
        _ctx: &CallContext,
        network: Uuid,
        ip: &str,
    ) -> Result<(), Error> {
        self.reserved_ips
            .lock()
            .unwrap()
            .retain(|(n, i)| !(*n == network && i == ip));
        Ok(())
    }
}

struct SimServer {
    uuid: Uuid,
    ram_total: i64,
    ram_used: i64,
}

/// Simulated compute-node API
pub struct SimCnapi {
    servers: Mutex<Vec<SimServer>>,
    machines: Mutex<BTreeMap<Uuid, VmState>>,
    tasks: Mutex<HashMap<String, Result<(), String>>>,
    next_task: AtomicU64,
    fail_provision: AtomicBool,
}

impl SimCnapi {
    pub fn new() -> SimCnapi {
        SimCnapi {
            servers: Mutex::new(Vec::new()),
            machines: Mutex::new(BTreeMap::new()),
            tasks: Mutex::new(HashMap::new()),
            next_task: AtomicU64::new(1),
            fail_provision: AtomicBool::new(false),
        }
    }

    pub fn add_server(&self, uuid: Uuid, ram_total: i64) {
        self.servers.lock().unwrap().push(SimServer {
            uuid,
            ram_total,
            ram_used: 0,
        });
    }

    /// The next agent provision task will fail (after the zone creation
    /// has nominally started).
    pub fn fail_next_provision(&self) {
        self.fail_provision.store(true, Ordering::SeqCst);
    }

    pub fn machine_state(&self, vm: Uuid) -> Option<VmState> {
        self.machines.lock().unwrap().get(&vm).copied()
    }

    fn mint_task(&self, result: Result<(), String>) -> String {
        let id = format!("task-{}", self.next_task.fetch_add(1, Ordering::SeqCst));
        self.tasks.lock().unwrap().insert(id.clone(), result);
        id
    }
}

#[async_trait]
impl ComputeApi for SimCnapi {
    async fn allocate_server(
        &self,
        _ctx: &CallContext,
        ram: u64,
        locality: Option<&Locality>,
    ) -> Result<Uuid, Error> {
        let mut servers = self.servers.lock().unwrap();
        let far: Vec<Uuid> =
            locality.map(|l| l.far.clone()).unwrap_or_default();
        let server = servers
            .iter_mut()
            .find(|s| {
                !far.contains(&s.uuid)
                    && s.ram_total - s.ram_used >= ram as i64
            })
            .ok_or_else(|| {
                Error::unavail("no server with sufficient capacity")
            })?;
        server.ram_used += ram as i64;
        Ok(server.uuid)
    }

    async fn server_capacity(
        &self,
        _ctx: &CallContext,
        server: Uuid,
    ) -> Result<ServerCapacity, Error> {
        let servers = self.servers.lock().unwrap();
        let server_record = servers
            .iter()
            .find(|s| s.uuid == server)
            .ok_or_else(|| Error::unavail("no such server"))?;
        Ok(ServerCapacity {
            server_uuid: server,
            unreserved_ram: server_record.ram_total - server_record.ram_used,
        })
    }

    async fn provision_vm(
        &self,
        _ctx: &CallContext,
        _server: Uuid,
        payload: &CnapiProvisionPayload,
    ) -> Result<String, Error> {
        if self.fail_provision.swap(false, Ordering::SeqCst) {
            return Ok(
                self.mint_task(Err("zone dataset creation failed".to_string()))
            );
        }
        self.machines.lock().unwrap().insert(
            payload.uuid,
            if payload.autoboot { VmState::Running } else { VmState::Stopped },
        );
        Ok(self.mint_task(Ok(())))
    }

    async fn machine_action(
        &self,
        _ctx: &CallContext,
        _server: Uuid,
        vm: Uuid,
        action: &MachineAction,
    ) -> Result<String, Error> {
        let mut machines = self.machines.lock().unwrap();
        match action {
            MachineAction::Start => {
                machines.insert(vm, VmState::Running);
            }
            MachineAction::Stop => {
                machines.insert(vm, VmState::Stopped);
            }
            MachineAction::Reboot => {
                machines.insert(vm, VmState::Running);
            }
            MachineAction::Destroy => {
                machines.remove(&vm);
            }
            MachineAction::Update { .. }
            | MachineAction::Reprovision { .. }
            | MachineAction::CreateSnapshot { .. }
            | MachineAction::RollbackSnapshot { .. }
            | MachineAction::DeleteSnapshot { .. } => {}
        }
        Ok(self.mint_task(Ok(())))
    }

    async fn wait_task(
        &self,
        _ctx: &CallContext,
        task_id: &str,
    ) -> Result<(), Error> {
        match self.tasks.lock().unwrap().get(task_id) {
            Some(Ok(())) => Ok(()),
            Some(Err(message)) => Err(Error::internal_error(&format!(
                "compute node task {} failed: {}",
                task_id, message
            ))),
            None => Err(Error::internal_error(&format!(
                "no such compute node task: {}",
                task_id
            ))),
        }
    }

    async fn vm_status(
        &self,
        _ctx: &CallContext,
        _server: Uuid,
        vm: Uuid,
    ) -> Result<Option<MachineStatus>, Error> {
        Ok(self
            .machines
            .lock()
            .unwrap()
            .get(&vm)
            .map(|state| MachineStatus { state: *state }))
    }

    async fn filesystem_details(
        &self,
        _ctx: &CallContext,
        server: Uuid,
        vm: Uuid,
    ) -> Result<serde_json::Value, Error> {
        Ok(serde_json::json!({
            "server": server,
            "zfs_filesystem": format!("zones/{}", vm),
        }))
    }

    async fn set_do_not_inventory(
        &self,
        _ctx: &CallContext,
        _server: Uuid,
        _vm: Uuid,
        _flag: bool,
    ) -> Result<(), Error> {
        Ok(())
    }

    async fn remove_quota(
        &self,
        _ctx: &CallContext,
        _server: Uuid,
        _vm: Uuid,
    ) -> Result<(), Error> {
        Ok(())
    }
}

/// Simulated firewall API
pub struct SimFwapi {
    rules: Mutex<Vec<FirewallRule>>,
    synced: Mutex<Vec<Uuid>>,
}

impl SimFwapi {
    pub fn new() -> SimFwapi {
        SimFwapi { rules: Mutex::new(Vec::new()), synced: Mutex::new(Vec::new()) }
    }

    pub fn rules(&self) -> Vec<FirewallRule> {
        self.rules.lock().unwrap().clone()
    }
}

#[async_trait]
impl FirewallApi for SimFwapi {
    async fn add_rules(
        &self,
        _ctx: &CallContext,
        rules: &[FirewallRule],
    ) -> Result<(), Error> {
        self.rules.lock().unwrap().extend_from_slice(rules);
        Ok(())
    }

    async fn sync_vm(
        &self,
        _ctx: &CallContext,
        vm: Uuid,
        _owner: Uuid,
        _tags: Vec<String>,
    ) -> Result<(), Error> {
        self.synced.lock().unwrap().push(vm);
        Ok(())
    }
}

/// Simulated image API
pub struct SimImgapi {
    images: Mutex<Vec<Image>>,
    fail_ensure: AtomicBool,
    next_task: AtomicU64,
    failed_tasks: Mutex<Vec<String>>,
}

impl SimImgapi {
    pub fn new() -> SimImgapi {
        SimImgapi {
            images: Mutex::new(Vec::new()),
            fail_ensure: AtomicBool::new(false),
            next_task: AtomicU64::new(1),
            failed_tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn add_image(&self, image: Image) {
        self.images.lock().unwrap().push(image);
    }

    /// The next image-ensure task will fail, before any zone creation
    /// begins.
    pub fn fail_next_ensure(&self) {
        self.fail_ensure.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ImageApi for SimImgapi {
    async fn image_get(
        &self,
        _ctx: &CallContext,
        uuid: Uuid,
    ) -> Result<Option<Image>, Error> {
        Ok(self
            .images
            .lock()
            .unwrap()
            .iter()
            .find(|i| i.uuid == uuid)
            .cloned())
    }

    async fn ensure_image(
        &self,
        _ctx: &CallContext,
        _server: Uuid,
        _image: Uuid,
    ) -> Result<String, Error> {
        let id = format!(
            "imgtask-{}",
            self.next_task.fetch_add(1, Ordering::SeqCst)
        );
        if self.fail_ensure.swap(false, Ordering::SeqCst) {
            self.failed_tasks.lock().unwrap().push(id.clone());
        }
        Ok(id)
    }

    async fn wait_image(
        &self,
        _ctx: &CallContext,
        task_id: &str,
    ) -> Result<(), Error> {
        if self.failed_tasks.lock().unwrap().iter().any(|t| t == task_id) {
            return Err(Error::internal_error(
                "image could not be installed on the compute node",
            ));
        }
        Ok(())
    }
}

/// Simulated package catalog
pub struct SimPapi {
    packages: Mutex<Vec<Package>>,
}

impl SimPapi {
    pub fn new() -> SimPapi {
        SimPapi { packages: Mutex::new(Vec::new()) }
    }

    pub fn add_package(&self, package: Package) {
        self.packages.lock().unwrap().push(package);
    }
}

#[async_trait]
impl PackageApi for SimPapi {
    async fn package_get(
        &self,
        _ctx: &CallContext,
        uuid: Uuid,
    ) -> Result<Option<Package>, Error> {
        Ok(self
            .packages
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.uuid == uuid)
            .cloned())
    }
}

/// Simulated volume API
pub struct SimVolapi {
    references: Mutex<Vec<(String, Uuid)>>,
}

impl SimVolapi {
    pub fn new() -> SimVolapi {
        SimVolapi { references: Mutex::new(Vec::new()) }
    }

    pub fn references_for(&self, vm: Uuid) -> Vec<String> {
        self.references
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, v)| *v == vm)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

#[async_trait]
impl VolumeApi for SimVolapi {
    async fn add_reference(
        &self,
        _ctx: &CallContext,
        volume: &str,
        _owner: Uuid,
        vm: Uuid,
    ) -> Result<(), Error> {
        self.references.lock().unwrap().push((volume.to_string(), vm));
        Ok(())
    }

    async fn remove_references(
        &self,
        _ctx: &CallContext,
        vm: Uuid,
    ) -> Result<(), Error> {
        self.references.lock().unwrap().retain(|(_, v)| *v != vm);
        Ok(())
    }
}

/// Handles for seeding and failure injection, kept by tests alongside the
/// [`Collaborators`] bundle handed to the server.
#[derive(Clone)]
pub struct SimHandles {
    pub napi: Arc<SimNapi>,
    pub cnapi: Arc<SimCnapi>,
    pub fwapi: Arc<SimFwapi>,
    pub imgapi: Arc<SimImgapi>,
    pub papi: Arc<SimPapi>,
    pub volapi: Arc<SimVolapi>,
}

/// Builds a simulated collaborators bundle.
pub fn collaborators() -> (Arc<Collaborators>, SimHandles) {
    let handles = SimHandles {
        napi: Arc::new(SimNapi::new()),
        cnapi: Arc::new(SimCnapi::new()),
        fwapi: Arc::new(SimFwapi::new()),
        imgapi: Arc::new(SimImgapi::new()),
        papi: Arc::new(SimPapi::new()),
        volapi: Arc::new(SimVolapi::new()),
    };
    let collaborators = Arc::new(Collaborators {
        napi: handles.napi.clone(),
        cnapi: handles.cnapi.clone(),
        fwapi: handles.fwapi.clone(),
        imgapi: handles.imgapi.clone(),
        papi: handles.papi.clone(),
        volapi: handles.volapi.clone(),
    });
    (collaborators, handles)
}
