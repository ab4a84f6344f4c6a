// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tag operations
//!
//! Reads are served from the store; mutations ride the update pipeline
//! (merge, replace, delete-one, delete-all), each returning a 202 job.
//! The reserved-tag policy is enforced here, before any job is created.

use crate::app::validate::tags;
use crate::app::validate::NormalizedUpdate;
use crate::app::workflow::NewJob;
use crate::app::workflows;
use crate::app::Vmapi;
use crate::clients::CallContext;
use crate::db::model::Job;
use crate::db::model::JobContext;
use crate::db::model::Vm;
use crate::db::model::VmTask;
use crate::errors::Error;
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

impl Vmapi {
    pub async fn vm_tags_list(
        &self,
        uuid: Uuid,
    ) -> Result<BTreeMap<String, Value>, Error> {
        Ok(self.datastore.vm_fetch_required(uuid).await?.tags)
    }

    pub async fn vm_tag_get(
        &self,
        uuid: Uuid,
        key: &str,
    ) -> Result<Value, Error> {
        let vm = self.datastore.vm_fetch_required(uuid).await?;
        vm.tags.get(key).cloned().ok_or_else(|| Error::NotFound {
            message: format!("tag {:?} not found on VM {}", key, uuid),
        })
    }

    /// `POST /vms/:uuid/tags`: merges the given tags into the current set.
    pub async fn vm_tags_add(
        &self,
        call: &CallContext,
        context: JobContext,
        uuid: Uuid,
        new_tags: BTreeMap<String, Value>,
    ) -> Result<Job, Error> {
        let vm = self.tag_mutable_vm(uuid).await?;
        tags::validate_vm_tags(&new_tags, false)?;
        self.submit_tag_update(
            call,
            context,
            &vm,
            NormalizedUpdate {
                add_tags: Some(new_tags),
                ..Default::default()
            },
        )
        .await
    }

    /// `PUT /vms/:uuid/tags`: replaces the entire tag set.
    pub async fn vm_tags_set(
        &self,
        call: &CallContext,
        context: JobContext,
        uuid: Uuid,
        new_tags: BTreeMap<String, Value>,
    ) -> Result<Job, Error> {
        let vm = self.tag_mutable_vm(uuid).await?;
        tags::validate_vm_tags(&new_tags, false)?;
        // Replacement deletes every key not carried over.
        for key in vm.tags.keys() {
            if !new_tags.contains_key(key) {
                tags::validate_tag_deletion(key, vm.is_docker())?;
            }
        }
        self.submit_tag_update(
            call,
            context,
            &vm,
            NormalizedUpdate {
                set_tags: Some(new_tags),
                ..Default::default()
            },
        )
        .await
    }

    /// `DELETE /vms/:uuid/tags`: removes all tags.
    pub async fn vm_tags_delete_all(
        &self,
        call: &CallContext,
        context: JobContext,
        uuid: Uuid,
    ) -> Result<Job, Error> {
        let vm = self.tag_mutable_vm(uuid).await?;
        for key in vm.tags.keys() {
            tags::validate_tag_deletion(key, vm.is_docker())?;
        }
        self.submit_tag_update(
            call,
            context,
            &vm,
            NormalizedUpdate { remove_all_tags: true, ..Default::default() },
        )
        .await
    }

    /// `DELETE /vms/:uuid/tags/:key`: removes one tag.
    pub async fn vm_tag_delete(
        &self,
        call: &CallContext,
        context: JobContext,
        uuid: Uuid,
        key: &str,
    ) -> Result<Job, Error> {
        let vm = self.tag_mutable_vm(uuid).await?;
        if !vm.tags.contains_key(key) {
            return Err(Error::NotFound {
                message: format!("tag {:?} not found on VM {}", key, uuid),
            });
        }
        tags::validate_tag_deletion(key, vm.is_docker())?;
        self.submit_tag_update(
            call,
            context,
            &vm,
            NormalizedUpdate {
                remove_tags: Some(vec![key.to_string()]),
                ..Default::default()
            },
        )
        .await
    }

    async fn tag_mutable_vm(&self, uuid: Uuid) -> Result<Vm, Error> {
        self.datastore.check_ready()?;
        let vm = self.datastore.vm_fetch_required(uuid).await?;
        crate::app::validate::validate_action_state(&vm, VmTask::Update)?;
        Ok(vm)
    }

    async fn submit_tag_update(
        &self,
        call: &CallContext,
        context: JobContext,
        vm: &Vm,
        update: NormalizedUpdate,
    ) -> Result<Job, Error> {
        debug!(self.log, "accepted tag update"; "vm" => %vm.uuid);
        self.executor
            .submit(
                workflows::update::workflow(),
                NewJob {
                    task: VmTask::Update,
                    vm_uuid: Some(vm.uuid),
                    context,
                    payload: serde_json::to_value(&update)
                        .map_err(|e| Error::internal_error(&e.to_string()))?,
                    request_id: call.request_id.clone(),
                    mark_as_failed_on_error: false,
                },
            )
            .await
    }
}
