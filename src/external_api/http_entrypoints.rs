// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Handler functions (entrypoints) for the external HTTP API

use super::params::JobPathParam;
use super::params::ListJobsQuery;
use super::params::ListVmsQuery;
use super::params::ProvisionParams;
use super::params::TagPathParam;
use super::params::VmPathParam;
use super::views::JobLocation;
use super::views::Ping;
use crate::app::workflow::JobsFilter;
use crate::context::caller_context;
use crate::context::ServerContext;
use crate::db::filter::parse_ldap;
use crate::db::filter::parse_predicate;
use crate::db::filter::ListOptions;
use crate::db::filter::Sort;
use crate::db::filter::StateFilter;
use crate::db::filter::VmFilter;
use crate::db::model::Job;
use crate::db::model::Vm;
use crate::errors::Error;
use dropshot::endpoint;
use dropshot::ApiDescription;
use dropshot::HttpResponseAccepted;
use dropshot::HttpResponseHeaders;
use dropshot::HttpResponseOk;
use dropshot::Path;
use dropshot::Query;
use dropshot::RequestContext;
use dropshot::TypedBody;
use schemars::JsonSchema;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

type VmapiApiDescription = ApiDescription<Arc<ServerContext>>;

/// Returns a description of the external vmapi API
pub fn external_api() -> VmapiApiDescription {
    fn register_endpoints(
        api: &mut VmapiApiDescription,
    ) -> Result<(), String> {
        api.register(ping_get).map_err(|e| e.to_string())?;

        api.register(vms_get).map_err(|e| e.to_string())?;
        api.register(vms_head).map_err(|e| e.to_string())?;
        api.register(vms_post).map_err(|e| e.to_string())?;
        api.register(vms_get_vm).map_err(|e| e.to_string())?;
        api.register(vms_post_vm).map_err(|e| e.to_string())?;
        api.register(vms_delete_vm).map_err(|e| e.to_string())?;

        api.register(vm_tags_get).map_err(|e| e.to_string())?;
        api.register(vm_tags_post).map_err(|e| e.to_string())?;
        api.register(vm_tags_put).map_err(|e| e.to_string())?;
        api.register(vm_tags_delete).map_err(|e| e.to_string())?;
        api.register(vm_tags_get_tag).map_err(|e| e.to_string())?;
        api.register(vm_tags_delete_tag).map_err(|e| e.to_string())?;

        api.register(vm_jobs_get).map_err(|e| e.to_string())?;
        api.register(jobs_get).map_err(|e| e.to_string())?;
        api.register(jobs_get_job).map_err(|e| e.to_string())?;
        api.register(jobs_cancel_job).map_err(|e| e.to_string())?;

        Ok(())
    }

    let mut api = VmapiApiDescription::new();
    if let Err(err) = register_endpoints(&mut api) {
        panic!("failed to register entrypoints: {}", err);
    }
    api
}

/// `x-joyent-resource-count` carries the total matching count, ignoring
/// `limit` and `offset`.
#[derive(Serialize, JsonSchema)]
struct ResourceCountHeaders {
    #[serde(rename = "x-joyent-resource-count")]
    resource_count: String,
}

/// Mutation responses advertise the workflow executor so callers know
/// where job state lives.
#[derive(Serialize, JsonSchema)]
struct WorkflowHeaders {
    #[serde(rename = "workflow-api")]
    workflow_api: String,
}

fn parse_uuid(field: &str, value: &str) -> Result<Uuid, Error> {
    Uuid::parse_str(value).map_err(|_| {
        Error::invalid_field(
            field,
            "Invalid",
            &format!("{} is not a UUID: {:?}", field, value),
        )
    })
}

/// Minimal percent-decoding for query-string values.
fn url_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(bytes[i]);
                        i += 1;
                    }
                }
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// `tag.<key>=<value>` filters are collected from the raw query string
/// since their names are not known statically.
fn tag_filters(raw_query: Option<&str>) -> Vec<(String, String)> {
    let Some(raw) = raw_query else { return Vec::new() };
    raw.split('&')
        .filter_map(|pair| pair.split_once('='))
        .filter_map(|(key, value)| {
            let key = url_decode(key);
            key.strip_prefix("tag.").map(|tag_key| {
                (tag_key.to_string(), url_decode(value))
            })
        })
        .collect()
}

/// Compiles the list parameters into the store query: structured filters,
/// the LDAP `query=` string, and the JSON `predicate=` tree all intersect.
fn compile_list_query(
    apictx: &ServerContext,
    query: ListVmsQuery,
    raw_query: Option<&str>,
) -> Result<(VmFilter, ListOptions), Error> {
    let mut filter = VmFilter::default();
    if let Some(s) = &query.uuid {
        filter.uuid = Some(parse_uuid("uuid", s)?);
    }
    if let Some(s) = &query.owner_uuid {
        filter.owner_uuid = Some(parse_uuid("owner_uuid", s)?);
    }
    if let Some(s) = &query.server_uuid {
        filter.server_uuid = Some(parse_uuid("server_uuid", s)?);
    }
    if let Some(s) = &query.billing_id {
        filter.billing_id = Some(parse_uuid("billing_id", s)?);
    }
    filter.brand = query.brand.clone();
    filter.alias = query.alias.clone();
    filter.ram = query.ram;
    if let Some(s) = &query.state {
        filter.state = Some(StateFilter::parse(s).map_err(|e| {
            Error::invalid_field("state", "Invalid", &e)
        })?);
    }
    if let Some(s) = &query.query {
        filter.query = Some(parse_ldap(s).map_err(|e| {
            Error::invalid_field("query", "Invalid", &e)
        })?);
    }
    if let Some(s) = &query.predicate {
        let tree: Value = serde_json::from_str(s).map_err(|e| {
            Error::invalid_field("predicate", "Invalid", &e.to_string())
        })?;
        filter.predicate = Some(parse_predicate(&tree).map_err(|e| {
            Error::invalid_field("predicate", "Invalid", &e)
        })?);
    }
    filter.tags = tag_filters(raw_query);

    let max_limit = apictx.vmapi.tunables.max_list_limit;
    let mut options = ListOptions::default();
    options.limit = query.limit.unwrap_or(max_limit).min(max_limit);
    options.offset = query.offset.unwrap_or(0);
    if let Some(s) = &query.sort {
        options.sort = Sort::parse(s)
            .map_err(|e| Error::invalid_field("sort", "Invalid", &e))?;
    }
    options.fields = query.fields.as_ref().map(|fields| {
        fields.split(',').map(|f| f.trim().to_string()).collect()
    });
    Ok((filter, options))
}

fn accepted(
    apictx: &ServerContext,
    job: &Job,
) -> HttpResponseHeaders<HttpResponseAccepted<JobLocation>, WorkflowHeaders> {
    HttpResponseHeaders::new(
        HttpResponseAccepted(JobLocation {
            vm_uuid: job.vm_uuid.unwrap_or_else(Uuid::nil),
            job_uuid: job.uuid,
        }),
        WorkflowHeaders {
            workflow_api: apictx.vmapi.workflow_api_url().to_string(),
        },
    )
}

/// Liveness and dependency health.
#[endpoint {
    method = GET,
    path = "/ping",
}]
async fn ping_get(
    rqctx: RequestContext<Arc<ServerContext>>,
) -> Result<HttpResponseOk<Ping>, Error> {
    let apictx = rqctx.context();
    Ok(HttpResponseOk(apictx.vmapi.ping().await))
}

/// List VMs, with structured filters, `query=` LDAP filter strings, JSON
/// `predicate=` trees, field projection, and pagination.
#[endpoint {
    method = GET,
    path = "/vms",
}]
async fn vms_get(
    rqctx: RequestContext<Arc<ServerContext>>,
    query_params: Query<ListVmsQuery>,
) -> Result<
    HttpResponseHeaders<HttpResponseOk<Vec<Value>>, ResourceCountHeaders>,
    Error,
> {
    let apictx = rqctx.context();
    let (filter, options) = compile_list_query(
        apictx,
        query_params.into_inner(),
        rqctx.request.uri().query(),
    )?;
    let (vms, total) = apictx.vmapi.vm_list(&filter, &options).await?;
    Ok(HttpResponseHeaders::new(
        HttpResponseOk(vms),
        ResourceCountHeaders { resource_count: total.to_string() },
    ))
}

/// Same as listing VMs, headers only.
#[endpoint {
    method = HEAD,
    path = "/vms",
}]
async fn vms_head(
    rqctx: RequestContext<Arc<ServerContext>>,
    query_params: Query<ListVmsQuery>,
) -> Result<
    HttpResponseHeaders<HttpResponseOk<Vec<Value>>, ResourceCountHeaders>,
    Error,
> {
    let apictx = rqctx.context();
    let (filter, options) = compile_list_query(
        apictx,
        query_params.into_inner(),
        rqctx.request.uri().query(),
    )?;
    let (_, total) = apictx.vmapi.vm_list(&filter, &options).await?;
    Ok(HttpResponseHeaders::new(
        HttpResponseOk(Vec::new()),
        ResourceCountHeaders { resource_count: total.to_string() },
    ))
}

/// Provision a new VM.
#[endpoint {
    method = POST,
    path = "/vms",
}]
async fn vms_post(
    rqctx: RequestContext<Arc<ServerContext>>,
    body: TypedBody<ProvisionParams>,
) -> Result<
    HttpResponseHeaders<HttpResponseAccepted<JobLocation>, WorkflowHeaders>,
    Error,
> {
    let apictx = rqctx.context();
    let (call, context) = caller_context(&rqctx);
    let job = apictx
        .vmapi
        .vm_provision(&call, context, body.into_inner())
        .await?;
    Ok(accepted(apictx, &job))
}

/// Fetch a VM by uuid.
#[endpoint {
    method = GET,
    path = "/vms/{uuid}",
}]
async fn vms_get_vm(
    rqctx: RequestContext<Arc<ServerContext>>,
    path_params: Path<VmPathParam>,
) -> Result<HttpResponseOk<Vm>, Error> {
    let apictx = rqctx.context();
    let uuid = parse_uuid("uuid", &path_params.into_inner().uuid)?;
    Ok(HttpResponseOk(apictx.vmapi.vm_fetch(uuid).await?))
}

/// Perform an action on a VM: `start`, `stop`, `reboot`, `update`,
/// `add_nics`, `remove_nics`, `create_snapshot`, `rollback_snapshot`,
/// `delete_snapshot`, `reprovision`, or `migrate`.
#[endpoint {
    method = POST,
    path = "/vms/{uuid}",
}]
async fn vms_post_vm(
    rqctx: RequestContext<Arc<ServerContext>>,
    path_params: Path<VmPathParam>,
    body: TypedBody<Value>,
) -> Result<
    HttpResponseHeaders<HttpResponseAccepted<JobLocation>, WorkflowHeaders>,
    Error,
> {
    let apictx = rqctx.context();
    let (call, context) = caller_context(&rqctx);
    let uuid = parse_uuid("uuid", &path_params.into_inner().uuid)?;
    let job = apictx
        .vmapi
        .vm_action(&call, context, uuid, body.into_inner())
        .await?;
    Ok(accepted(apictx, &job))
}

/// Destroy a VM.
#[endpoint {
    method = DELETE,
    path = "/vms/{uuid}",
}]
async fn vms_delete_vm(
    rqctx: RequestContext<Arc<ServerContext>>,
    path_params: Path<VmPathParam>,
) -> Result<
    HttpResponseHeaders<HttpResponseAccepted<JobLocation>, WorkflowHeaders>,
    Error,
> {
    let apictx = rqctx.context();
    let (call, context) = caller_context(&rqctx);
    let uuid = parse_uuid("uuid", &path_params.into_inner().uuid)?;
    let job = apictx.vmapi.vm_destroy(&call, context, uuid).await?;
    Ok(accepted(apictx, &job))
}

/// List a VM's tags.
#[endpoint {
    method = GET,
    path = "/vms/{uuid}/tags",
}]
async fn vm_tags_get(
    rqctx: RequestContext<Arc<ServerContext>>,
    path_params: Path<VmPathParam>,
) -> Result<HttpResponseOk<BTreeMap<String, Value>>, Error> {
    let apictx = rqctx.context();
    let uuid = parse_uuid("uuid", &path_params.into_inner().uuid)?;
    Ok(HttpResponseOk(apictx.vmapi.vm_tags_list(uuid).await?))
}

/// Merge tags into a VM's tag set.
#[endpoint {
    method = POST,
    path = "/vms/{uuid}/tags",
}]
async fn vm_tags_post(
    rqctx: RequestContext<Arc<ServerContext>>,
    path_params: Path<VmPathParam>,
    body: TypedBody<BTreeMap<String, Value>>,
) -> Result<
    HttpResponseHeaders<HttpResponseAccepted<JobLocation>, WorkflowHeaders>,
    Error,
> {
    let apictx = rqctx.context();
    let (call, context) = caller_context(&rqctx);
    let uuid = parse_uuid("uuid", &path_params.into_inner().uuid)?;
    let job = apictx
        .vmapi
        .vm_tags_add(&call, context, uuid, body.into_inner())
        .await?;
    Ok(accepted(apictx, &job))
}

/// Replace a VM's entire tag set.
#[endpoint {
    method = PUT,
    path = "/vms/{uuid}/tags",
}]
async fn vm_tags_put(
    rqctx: RequestContext<Arc<ServerContext>>,
    path_params: Path<VmPathParam>,
    body: TypedBody<BTreeMap<String, Value>>,
) -> Result<
    HttpResponseHeaders<HttpResponseAccepted<JobLocation>, WorkflowHeaders>,
    Error,
> {
    let apictx = rqctx.context();
    let (call, context) = caller_context(&rqctx);
    let uuid = parse_uuid("uuid", &path_params.into_inner().uuid)?;
    let job = apictx
        .vmapi
        .vm_tags_set(&call, context, uuid, body.into_inner())
        .await?;
    Ok(accepted(apictx, &job))
}

/// Remove all of a VM's tags.
#[endpoint {
    method = DELETE,
    path = "/vms/{uuid}/tags",
}]
async fn vm_tags_delete(
    rqctx: RequestContext<Arc<ServerContext>>,
    path_params: Path<VmPathParam>,
) -> Result<
    HttpResponseHeaders<HttpResponseAccepted<JobLocation>, WorkflowHeaders>,
    Error,
> {
    let apictx = rqctx.context();
    let (call, context) = caller_context(&rqctx);
    let uuid = parse_uuid("uuid", &path_params.into_inner().uuid)?;
    let job =
        apictx.vmapi.vm_tags_delete_all(&call, context, uuid).await?;
    Ok(accepted(apictx, &job))
}

/// Fetch one tag value.
#[endpoint {
    method = GET,
    path = "/vms/{uuid}/tags/{key}",
}]
async fn vm_tags_get_tag(
    rqctx: RequestContext<Arc<ServerContext>>,
    path_params: Path<TagPathParam>,
) -> Result<HttpResponseOk<Value>, Error> {
    let apictx = rqctx.context();
    let path = path_params.into_inner();
    let uuid = parse_uuid("uuid", &path.uuid)?;
    Ok(HttpResponseOk(apictx.vmapi.vm_tag_get(uuid, &path.key).await?))
}

/// Delete one tag.
#[endpoint {
    method = DELETE,
    path = "/vms/{uuid}/tags/{key}",
}]
async fn vm_tags_delete_tag(
    rqctx: RequestContext<Arc<ServerContext>>,
    path_params: Path<TagPathParam>,
) -> Result<
    HttpResponseHeaders<HttpResponseAccepted<JobLocation>, WorkflowHeaders>,
    Error,
> {
    let apictx = rqctx.context();
    let (call, context) = caller_context(&rqctx);
    let path = path_params.into_inner();
    let uuid = parse_uuid("uuid", &path.uuid)?;
    let job = apictx
        .vmapi
        .vm_tag_delete(&call, context, uuid, &path.key)
        .await?;
    Ok(accepted(apictx, &job))
}

fn compile_jobs_query(query: &ListJobsQuery) -> Result<JobsFilter, Error> {
    let mut filter = JobsFilter::default();
    if let Some(s) = &query.vm_uuid {
        filter.vm_uuid = Some(parse_uuid("vm_uuid", s)?);
    }
    if let Some(s) = &query.task {
        filter.task = Some(
            serde_json::from_value(Value::String(s.clone())).map_err(|_| {
                Error::invalid_field(
                    "task",
                    "Invalid",
                    &format!("unknown task {:?}", s),
                )
            })?,
        );
    }
    if let Some(s) = &query.execution {
        filter.execution = Some(
            serde_json::from_value(Value::String(s.clone())).map_err(|_| {
                Error::invalid_field(
                    "execution",
                    "Invalid",
                    &format!("unknown execution {:?}", s),
                )
            })?,
        );
    }
    Ok(filter)
}

/// List jobs, newest first.
#[endpoint {
    method = GET,
    path = "/jobs",
}]
async fn jobs_get(
    rqctx: RequestContext<Arc<ServerContext>>,
    query_params: Query<ListJobsQuery>,
) -> Result<HttpResponseOk<Vec<Job>>, Error> {
    let apictx = rqctx.context();
    let filter = compile_jobs_query(&query_params.into_inner())?;
    Ok(HttpResponseOk(apictx.vmapi.jobs_list(&filter).await?))
}

/// List the jobs of one VM, newest first.
#[endpoint {
    method = GET,
    path = "/vms/{uuid}/jobs",
}]
async fn vm_jobs_get(
    rqctx: RequestContext<Arc<ServerContext>>,
    path_params: Path<VmPathParam>,
    query_params: Query<ListJobsQuery>,
) -> Result<HttpResponseOk<Vec<Job>>, Error> {
    let apictx = rqctx.context();
    let uuid = parse_uuid("uuid", &path_params.into_inner().uuid)?;
    let mut filter = compile_jobs_query(&query_params.into_inner())?;
    filter.vm_uuid = Some(uuid);
    Ok(HttpResponseOk(apictx.vmapi.jobs_list(&filter).await?))
}

/// Fetch a job by uuid.
#[endpoint {
    method = GET,
    path = "/jobs/{uuid}",
}]
async fn jobs_get_job(
    rqctx: RequestContext<Arc<ServerContext>>,
    path_params: Path<JobPathParam>,
) -> Result<HttpResponseOk<Job>, Error> {
    let apictx = rqctx.context();
    let uuid = parse_uuid("uuid", &path_params.into_inner().uuid)?;
    Ok(HttpResponseOk(apictx.vmapi.job_fetch(uuid).await?))
}

/// Cancel a running job.  The pipeline's cancel branch releases its
/// tickets; in-flight collaborator calls are allowed to finish.
#[endpoint {
    method = POST,
    path = "/jobs/{uuid}/cancel",
}]
async fn jobs_cancel_job(
    rqctx: RequestContext<Arc<ServerContext>>,
    path_params: Path<JobPathParam>,
) -> Result<HttpResponseOk<Job>, Error> {
    let apictx = rqctx.context();
    let uuid = parse_uuid("uuid", &path_params.into_inner().uuid)?;
    Ok(HttpResponseOk(apictx.vmapi.job_cancel(uuid).await?))
}

#[cfg(test)]
mod test {
    use super::tag_filters;
    use super::url_decode;

    #[test]
    fn test_url_decode() {
        assert_eq!(url_decode("plain"), "plain");
        assert_eq!(url_decode("a%20b+c"), "a b c");
        assert_eq!(url_decode("100%"), "100%");
        assert_eq!(url_decode("%2a"), "*");
    }

    #[test]
    fn test_tag_filters() {
        let raw = "owner_uuid=x&tag.role=database&tag.env=prod%20eu&limit=5";
        let tags = tag_filters(Some(raw));
        assert_eq!(
            tags,
            vec![
                ("role".to_string(), "database".to_string()),
                ("env".to_string(), "prod eu".to_string()),
            ]
        );
        assert!(tag_filters(None).is_empty());
    }
}
