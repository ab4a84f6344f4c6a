// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error handling facilities for the VM control plane
//!
//! Errors are represented internally with [`Error`] and converted into an
//! HTTP response as one of the last steps in processing a request, so most
//! of the system stays agnostic to the transport.  The wire body is always
//! `{code, message, errors?}`.

use dropshot::ErrorStatusCode;
use dropshot::HttpError;
use schemars::JsonSchema;
use serde::ser::SerializeStruct;
use serde::Deserialize;
use serde::Serialize;
use serde::Serializer;
use uuid::Uuid;

/// One element of an error's `errors[]` array, describing a single offending
/// parameter.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// kind of the object that owns the conflicting resource (e.g. "zone")
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// uuid of the object that owns the conflicting resource
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
}

impl FieldError {
    pub fn new(field: &str, code: &str, message: &str) -> FieldError {
        FieldError {
            field: field.to_string(),
            code: code.to_string(),
            message: Some(message.to_string()),
            kind: None,
            id: None,
        }
    }

    pub fn missing(field: &str) -> FieldError {
        FieldError::new(field, "MissingParameter", &format!("{} is required", field))
    }

    /// The element produced when a requested IP is already held by another
    /// VM: `{type: "zone", id: <owner vm>, code: "UsedBy", field: "ip"}`.
    pub fn used_by(owning_vm: Uuid) -> FieldError {
        FieldError {
            field: "ip".to_string(),
            code: "UsedBy".to_string(),
            message: None,
            kind: Some("zone".to_string()),
            id: Some(owning_vm),
        }
    }
}

/// An error that can be generated within the VM control plane
///
/// The variants map one-to-one onto the wire-visible `code` values; see
/// [`Error::code`] and [`Error::status_code`] for the mapping.
#[derive(Clone, Debug, thiserror::Error, PartialEq)]
pub enum Error {
    /// a parameter violates a schema rule
    #[error("{message}")]
    ValidationFailed { message: String, errors: Vec<FieldError> },
    /// a reference was rejected by an external service (e.g. IP in use)
    #[error("{message}")]
    InvalidParameters { message: String, errors: Vec<FieldError> },
    /// an unknown network or pool reference
    #[error("{message}")]
    UnprocessableEntity { message: String },
    /// an action was requested on a VM that never provisioned
    #[error("{message}")]
    UnallocatedVm { message: String },
    /// the action requires the VM to be running
    #[error("{message}")]
    VmNotRunning { message: String },
    /// the action requires the VM to be stopped
    #[error("{message}")]
    VmNotStopped { message: String },
    /// the action is not supported for the VM's brand
    #[error("{message}")]
    BrandNotSupported { message: String },
    /// disks cannot be resized without a flexible-disk package
    #[error("{message}")]
    VmWithoutFlexibleDiskSize { message: String },
    /// the disks requested exceed the package quota
    #[error("{message}")]
    InsufficientDiskSpace { message: String },
    /// the object store's buckets have not been set up
    #[error("Moray buckets are not setup")]
    MorayBucketsNotSetup,
    /// a data migration is pending and writes are suspended
    #[error("Pending data migration, object version is not up to date")]
    DataVersion,
    /// an object needed as part of this operation was not found
    #[error("{message}")]
    NotFound { message: String },
    /// the system encountered an unhandled operational error
    #[error("Internal Error: {message}")]
    Internal { message: String },
    /// the system (or part of it) is unavailable
    #[error("Service Unavailable: {message}")]
    Unavailable { message: String },
    /// an error produced by the HTTP framing itself, passed through
    #[error("{message}")]
    Framework { status: u16, code: Option<String>, message: String },
}

impl Error {
    pub fn validation(message: &str, errors: Vec<FieldError>) -> Error {
        Error::ValidationFailed { message: message.to_string(), errors }
    }

    /// A `ValidationFailed` error carrying a single field error; the outer
    /// message is the conventional "Invalid VM parameters".
    pub fn invalid_field(field: &str, code: &str, message: &str) -> Error {
        Error::ValidationFailed {
            message: "Invalid VM parameters".to_string(),
            errors: vec![FieldError::new(field, code, message)],
        }
    }

    pub fn missing_parameters(fields: &[&str]) -> Error {
        Error::ValidationFailed {
            message: "Invalid VM parameters".to_string(),
            errors: fields.iter().map(|f| FieldError::missing(f)).collect(),
        }
    }

    pub fn no_such_network(reference: &str) -> Error {
        Error::UnprocessableEntity {
            message: format!(
                "No such Network or Pool with id/name: \"{}\"",
                reference
            ),
        }
    }

    pub fn ip_used_by(owning_vm: Uuid) -> Error {
        Error::InvalidParameters {
            message: "Invalid VM parameters".to_string(),
            errors: vec![FieldError::used_by(owning_vm)],
        }
    }

    pub fn vm_not_found(uuid: &Uuid) -> Error {
        Error::NotFound { message: format!("VM not found: {}", uuid) }
    }

    pub fn job_not_found(uuid: &Uuid) -> Error {
        Error::NotFound { message: format!("Job not found: {}", uuid) }
    }

    pub fn internal_error(message: &str) -> Error {
        Error::Internal { message: message.to_string() }
    }

    pub fn unavail(message: &str) -> Error {
        Error::Unavailable { message: message.to_string() }
    }

    /// The wire-visible `code` for this error.
    pub fn code(&self) -> &str {
        match self {
            Error::ValidationFailed { .. } => "ValidationFailed",
            Error::InvalidParameters { .. } => "InvalidParameters",
            Error::UnprocessableEntity { .. } => "UnprocessableEntityError",
            Error::UnallocatedVm { .. } => "UnallocatedVM",
            Error::VmNotRunning { .. } => "VmNotRunning",
            Error::VmNotStopped { .. } => "VmNotStopped",
            Error::BrandNotSupported { .. } => "BrandNotSupported",
            Error::VmWithoutFlexibleDiskSize { .. } => {
                "VmWithoutFlexibleDiskSize"
            }
            Error::InsufficientDiskSpace { .. } => "InsufficientDiskSpace",
            Error::MorayBucketsNotSetup => "MorayBucketsNotSetup",
            Error::DataVersion => "DataVersion",
            Error::NotFound { .. } => "ResourceNotFound",
            Error::Internal { .. } => "InternalError",
            Error::Unavailable { .. } => "ServiceUnavailable",
            Error::Framework { code, .. } => {
                code.as_deref().unwrap_or("BadRequest")
            }
        }
    }

    fn field_errors(&self) -> &[FieldError] {
        match self {
            Error::ValidationFailed { errors, .. }
            | Error::InvalidParameters { errors, .. } => errors,
            _ => &[],
        }
    }

    /// Whether the error is likely transient and could reasonably be retried
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Error::Unavailable { .. }
                | Error::MorayBucketsNotSetup
                | Error::DataVersion
        )
    }
}

impl Serialize for Error {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let errors = self.field_errors();
        let nfields = if errors.is_empty() { 2 } else { 3 };
        let mut state = serializer.serialize_struct("Error", nfields)?;
        state.serialize_field("code", self.code())?;
        state.serialize_field("message", &self.to_string())?;
        if !errors.is_empty() {
            state.serialize_field("errors", errors)?;
        }
        state.end()
    }
}

impl JsonSchema for Error {
    fn schema_name() -> String {
        "Error".to_string()
    }

    fn json_schema(
        generator: &mut schemars::gen::SchemaGenerator,
    ) -> schemars::schema::Schema {
        #[derive(JsonSchema)]
        #[allow(dead_code)]
        struct ErrorBody {
            code: String,
            message: String,
            errors: Option<Vec<FieldError>>,
        }
        ErrorBody::json_schema(generator)
    }
}

impl From<HttpError> for Error {
    fn from(error: HttpError) -> Error {
        Error::Framework {
            status: error.status_code.as_u16(),
            code: error.error_code,
            message: error.external_message,
        }
    }
}

impl dropshot::HttpResponseError for Error {
    fn status_code(&self) -> ErrorStatusCode {
        match self {
            Error::ValidationFailed { .. }
            | Error::UnallocatedVm { .. }
            | Error::VmNotRunning { .. }
            | Error::VmNotStopped { .. }
            | Error::BrandNotSupported { .. }
            | Error::VmWithoutFlexibleDiskSize { .. }
            | Error::InsufficientDiskSpace { .. } => ErrorStatusCode::CONFLICT,
            Error::InvalidParameters { .. }
            | Error::UnprocessableEntity { .. } => {
                ErrorStatusCode::UNPROCESSABLE_ENTITY
            }
            Error::MorayBucketsNotSetup
            | Error::DataVersion
            | Error::Unavailable { .. } => ErrorStatusCode::SERVICE_UNAVAILABLE,
            Error::NotFound { .. } => ErrorStatusCode::NOT_FOUND,
            Error::Internal { .. } => ErrorStatusCode::INTERNAL_SERVER_ERROR,
            Error::Framework { status, .. } => {
                ErrorStatusCode::from_u16(*status)
                    .unwrap_or(ErrorStatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::Error;
    use super::FieldError;
    use uuid::Uuid;

    #[test]
    fn test_wire_shape() {
        let error = Error::missing_parameters(&["owner_uuid", "ram"]);
        let body = serde_json::to_value(&error).unwrap();
        assert_eq!(body["code"], "ValidationFailed");
        assert_eq!(body["message"], "Invalid VM parameters");
        assert_eq!(body["errors"][0]["field"], "owner_uuid");
        assert_eq!(body["errors"][0]["code"], "MissingParameter");
        assert_eq!(body["errors"][1]["field"], "ram");
    }

    #[test]
    fn test_errors_absent_when_empty() {
        let error = Error::no_such_network("mynet");
        let body = serde_json::to_value(&error).unwrap();
        assert_eq!(body["code"], "UnprocessableEntityError");
        assert_eq!(
            body["message"],
            "No such Network or Pool with id/name: \"mynet\""
        );
        assert!(body.get("errors").is_none());
    }

    #[test]
    fn test_used_by_element() {
        let vm = Uuid::new_v4();
        let body = serde_json::to_value(FieldError::used_by(vm)).unwrap();
        let object = body.as_object().unwrap();
        assert_eq!(object.len(), 4);
        assert_eq!(body["type"], "zone");
        assert_eq!(body["id"], vm.to_string());
        assert_eq!(body["code"], "UsedBy");
        assert_eq!(body["field"], "ip");
    }
}
