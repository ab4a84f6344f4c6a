// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Primary control-plane interface to the VM store
//!
//! The store presents three buckets (`vms`, `vm_role_tags`, `vm_migrations`)
//! keyed by uuid.  Writes are optimistic: every record carries a
//! monotonically increasing revision, and a writer that loses the race
//! re-reads and re-applies.

use crate::db::filter::project;
use crate::db::filter::vm_document;
use crate::db::filter::ListOptions;
use crate::db::filter::VmFilter;
use crate::db::model::Migration;
use crate::db::model::Vm;
use crate::errors::Error;
use serde_json::Value;
use slog::Logger;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Mutex;
use uuid::Uuid;

struct Versioned {
    revision: u64,
    record: Vm,
}

#[derive(Default)]
struct Buckets {
    vms: BTreeMap<Uuid, Versioned>,
    role_tags: BTreeMap<Uuid, Vec<String>>,
    migrations: BTreeMap<Uuid, Vec<Migration>>,
}

pub struct Datastore {
    log: Logger,
    buckets: Mutex<Buckets>,
    buckets_ready: AtomicBool,
    schema_current: AtomicBool,
}

impl Datastore {
    pub fn new(log: Logger) -> Datastore {
        Datastore {
            log,
            buckets: Mutex::new(Buckets::default()),
            buckets_ready: AtomicBool::new(false),
            schema_current: AtomicBool::new(true),
        }
    }

    /// Creates the buckets.  Requests arriving before this completes are
    /// answered with 503 `MorayBucketsNotSetup`.
    pub fn setup_buckets(&self) {
        self.buckets_ready.store(true, AtomicOrdering::SeqCst);
        info!(self.log, "store buckets ready";
            "buckets" => "vms, vm_role_tags, vm_migrations");
    }

    /// Marks a schema migration as pending; writes then fail with 503
    /// `DataVersion` until it completes.
    pub fn set_schema_pending(&self, pending: bool) {
        self.schema_current.store(!pending, AtomicOrdering::SeqCst);
    }

    pub fn check_ready(&self) -> Result<(), Error> {
        if !self.buckets_ready.load(AtomicOrdering::SeqCst) {
            return Err(Error::MorayBucketsNotSetup);
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<(), Error> {
        self.check_ready()?;
        if !self.schema_current.load(AtomicOrdering::SeqCst) {
            return Err(Error::DataVersion);
        }
        Ok(())
    }

    pub async fn vm_create(&self, vm: Vm) -> Result<(), Error> {
        self.check_writable()?;
        let mut buckets = self.buckets.lock().unwrap();
        if buckets.vms.contains_key(&vm.uuid) {
            return Err(Error::internal_error(&format!(
                "VM already exists: {}",
                vm.uuid
            )));
        }
        debug!(self.log, "storing new VM"; "vm" => %vm.uuid);
        buckets.vms.insert(vm.uuid, Versioned { revision: 1, record: vm });
        Ok(())
    }

    pub async fn vm_fetch(&self, uuid: Uuid) -> Result<Option<Vm>, Error> {
        self.check_ready()?;
        let buckets = self.buckets.lock().unwrap();
        Ok(buckets.vms.get(&uuid).map(|v| v.record.clone()))
    }

    pub async fn vm_fetch_required(&self, uuid: Uuid) -> Result<Vm, Error> {
        self.vm_fetch(uuid).await?.ok_or_else(|| Error::vm_not_found(&uuid))
    }

    pub async fn vm_fetch_versioned(
        &self,
        uuid: Uuid,
    ) -> Result<Option<(u64, Vm)>, Error> {
        self.check_ready()?;
        let buckets = self.buckets.lock().unwrap();
        Ok(buckets.vms.get(&uuid).map(|v| (v.revision, v.record.clone())))
    }

    /// Replaces the VM record if `expected_revision` still matches.
    pub async fn vm_update(
        &self,
        expected_revision: u64,
        vm: Vm,
    ) -> Result<(), Error> {
        self.check_writable()?;
        let mut buckets = self.buckets.lock().unwrap();
        let versioned = buckets
            .vms
            .get_mut(&vm.uuid)
            .ok_or_else(|| Error::vm_not_found(&vm.uuid))?;
        if versioned.revision != expected_revision {
            return Err(Error::unavail(&format!(
                "concurrent update of VM {} (revision {} != {})",
                vm.uuid, versioned.revision, expected_revision
            )));
        }
        versioned.revision += 1;
        versioned.record = vm;
        Ok(())
    }

    /// Read-modify-write with the optimistic retry loop: if the revisioned
    /// write loses a race, re-read and re-apply.
    pub async fn vm_apply<F>(&self, uuid: Uuid, mut apply: F) -> Result<Vm, Error>
    where
        F: FnMut(&mut Vm),
    {
        loop {
            let (revision, mut vm) = self
                .vm_fetch_versioned(uuid)
                .await?
                .ok_or_else(|| Error::vm_not_found(&uuid))?;
            apply(&mut vm);
            match self.vm_update(revision, vm.clone()).await {
                Ok(()) => return Ok(vm),
                Err(error) if error.retryable() => {
                    debug!(self.log, "lost optimistic update race; retrying";
                        "vm" => %uuid);
                    continue;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Lists VMs matching `filter`, sorted, paginated, and projected per
    /// `options`.  The second element of the returned pair is the total
    /// matching count ignoring `limit` and `offset`.
    pub async fn vm_list(
        &self,
        filter: &VmFilter,
        options: &ListOptions,
    ) -> Result<(Vec<Value>, usize), Error> {
        self.check_ready()?;
        let buckets = self.buckets.lock().unwrap();
        // Filters evaluate against the flattened index document; matching
        // rows are returned in their stored shape.
        let mut matching: Vec<_> = buckets
            .vms
            .values()
            .filter_map(|versioned| {
                let doc = vm_document(&versioned.record);
                if !filter.matches(&versioned.record, &doc) {
                    return None;
                }
                match serde_json::to_value(&versioned.record) {
                    Ok(Value::Object(map)) => Some(map),
                    _ => None,
                }
            })
            .collect();
        drop(buckets);
        let total = matching.len();
        matching.sort_by(|a, b| options.sort.compare(a, b));
        let page = matching
            .into_iter()
            .skip(options.offset)
            .take(options.limit)
            .map(|doc| match &options.fields {
                Some(fields) => Value::Object(project(doc, fields)),
                None => Value::Object(doc),
            })
            .collect();
        Ok((page, total))
    }

    pub async fn role_tags_put(
        &self,
        vm: Uuid,
        role_tags: Vec<String>,
    ) -> Result<(), Error> {
        self.check_writable()?;
        let mut buckets = self.buckets.lock().unwrap();
        if role_tags.is_empty() {
            buckets.role_tags.remove(&vm);
        } else {
            buckets.role_tags.insert(vm, role_tags);
        }
        Ok(())
    }

    pub async fn migration_insert(
        &self,
        migration: Migration,
    ) -> Result<(), Error> {
        self.check_writable()?;
        let mut buckets = self.buckets.lock().unwrap();
        buckets
            .migrations
            .entry(migration.vm_uuid)
            .or_default()
            .push(migration);
        Ok(())
    }

    pub async fn migration_update(
        &self,
        migration: Migration,
    ) -> Result<(), Error> {
        self.check_writable()?;
        let mut buckets = self.buckets.lock().unwrap();
        let records = buckets
            .migrations
            .get_mut(&migration.vm_uuid)
            .ok_or_else(|| {
                Error::internal_error("no migration records for VM")
            })?;
        let record = records
            .iter_mut()
            .find(|m| m.id == migration.id)
            .ok_or_else(|| Error::internal_error("no such migration record"))?;
        *record = migration;
        Ok(())
    }

    pub async fn migrations_for_vm(
        &self,
        vm: Uuid,
    ) -> Result<Vec<Migration>, Error> {
        self.check_ready()?;
        let buckets = self.buckets.lock().unwrap();
        Ok(buckets.migrations.get(&vm).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::db::model::Brand;
    use crate::db::model::VmState;
    use chrono::Utc;
    use dropshot::ConfigLogging;
    use dropshot::ConfigLoggingLevel;

    fn test_logger(name: &'static str) -> Logger {
        ConfigLogging::StderrTerminal { level: ConfigLoggingLevel::Error }
            .to_logger(name)
            .unwrap()
    }

    fn test_vm(alias: &str, ram: u64) -> Vm {
        Vm {
            uuid: Uuid::new_v4(),
            owner_uuid: Uuid::new_v4(),
            brand: Brand::JoyentMinimal,
            state: VmState::Running,
            alias: Some(alias.to_string()),
            billing_id: crate::db::model::ZERO_UUID,
            image_uuid: Some(Uuid::new_v4()),
            ram,
            max_physical_memory: ram,
            quota: Some(10),
            cpu_cap: None,
            cpu_shares: None,
            max_swap: None,
            max_lwps: None,
            zfs_io_priority: None,
            create_timestamp: Utc::now(),
            server_uuid: Some(Uuid::new_v4()),
            autoboot: true,
            nics: Vec::new(),
            tags: Default::default(),
            customer_metadata: Default::default(),
            internal_metadata: Default::default(),
            firewall_rules: Vec::new(),
            snapshots: Vec::new(),
            disks: None,
        }
    }

    #[tokio::test]
    async fn test_buckets_must_be_setup() {
        let datastore = Datastore::new(test_logger("buckets"));
        let error = datastore.vm_fetch(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(error, Error::MorayBucketsNotSetup);
        datastore.setup_buckets();
        assert_eq!(datastore.vm_fetch(Uuid::new_v4()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_optimistic_update() {
        let datastore = Datastore::new(test_logger("optimistic"));
        datastore.setup_buckets();
        let vm = test_vm("one", 256);
        let uuid = vm.uuid;
        datastore.vm_create(vm).await.unwrap();

        let (revision, mut stale) =
            datastore.vm_fetch_versioned(uuid).await.unwrap().unwrap();
        // Another writer gets there first.
        datastore
            .vm_apply(uuid, |vm| vm.state = VmState::Stopped)
            .await
            .unwrap();
        stale.alias = Some("two".to_string());
        let error = datastore.vm_update(revision, stale).await.unwrap_err();
        assert!(error.retryable());

        // vm_apply re-reads and re-applies, preserving the other write.
        let vm = datastore
            .vm_apply(uuid, |vm| vm.alias = Some("two".to_string()))
            .await
            .unwrap();
        assert_eq!(vm.state, VmState::Stopped);
        assert_eq!(vm.alias.as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn test_list_pagination_and_count() {
        let datastore = Datastore::new(test_logger("list"));
        datastore.setup_buckets();
        for i in 0..5 {
            datastore.vm_create(test_vm(&format!("vm{}", i), 128)).await.unwrap();
        }
        let filter = VmFilter::default();
        let mut options = ListOptions::default();
        options.sort = crate::db::filter::Sort::parse("alias.asc").unwrap();
        let (all, total) = datastore.vm_list(&filter, &options).await.unwrap();
        assert_eq!(total, 5);
        assert_eq!(all.len(), 5);

        options.limit = 2;
        options.offset = 3;
        let (page, total) = datastore.vm_list(&filter, &options).await.unwrap();
        assert_eq!(total, 5);
        let aliases: Vec<_> =
            page.iter().map(|v| v["alias"].as_str().unwrap().to_string()).collect();
        assert_eq!(aliases, vec!["vm3", "vm4"]);

        options.offset = 10;
        let (page, total) = datastore.vm_list(&filter, &options).await.unwrap();
        assert_eq!(total, 5);
        assert!(page.is_empty());
    }
}
