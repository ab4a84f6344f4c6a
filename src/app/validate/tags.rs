// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tag policy: the closed `triton.` tag set and the structurally reserved
//! docker tags

use crate::errors::Error;
use crate::errors::FieldError;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq)]
enum TagType {
    String,
    Boolean,
}

impl TagType {
    fn name(&self) -> &'static str {
        match self {
            TagType::String => "string",
            TagType::Boolean => "boolean",
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            TagType::String => value.is_string(),
            TagType::Boolean => value.is_boolean(),
        }
    }
}

/// The closed, typed set of recognized `triton.` tags.
const TRITON_TAGS: &[(&str, TagType)] = &[
    ("triton.cns.services", TagType::String),
    ("triton.cns.disable", TagType::Boolean),
    ("triton.cns.reverse_ptr", TagType::String),
    ("triton.placement.exclude_virtual_servers", TagType::Boolean),
];

fn actual_type(value: &Value) -> &'static str {
    match value {
        Value::String(_) => "string",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
        Value::Null => "null",
    }
}

/// Keys beginning `docker:label:com.docker.` or equal to `sdc_docker` are
/// structurally reserved.
pub fn is_reserved_tag(key: &str) -> bool {
    key.starts_with("docker:label:com.docker.") || key == "sdc_docker"
}

fn tag_error(message: String) -> Error {
    Error::ValidationFailed {
        message: "Invalid VM parameters".to_string(),
        errors: vec![FieldError {
            field: "tags".to_string(),
            code: "Invalid".to_string(),
            message: Some(message),
            kind: None,
            id: None,
        }],
    }
}

fn reserved_tag_error(message: String) -> Error {
    Error::ValidationFailed {
        message: message.clone(),
        errors: vec![FieldError {
            field: "tags".to_string(),
            code: "Invalid".to_string(),
            message: Some(message),
            kind: None,
            id: None,
        }],
    }
}

/// Validates a tag collection being created or written.
///
/// `docker_provision` is true only while provisioning a docker VM, the one
/// surface allowed to write the reserved docker tags.
pub fn validate_vm_tags(
    tags: &BTreeMap<String, Value>,
    docker_provision: bool,
) -> Result<(), Error> {
    for (key, value) in tags {
        if is_reserved_tag(key) {
            if !docker_provision {
                return Err(reserved_tag_error(format!(
                    "Special tag \"{}\" not supported",
                    key
                )));
            }
            continue;
        }
        if key.starts_with("triton.") {
            let Some((_, tag_type)) =
                TRITON_TAGS.iter().find(|(name, _)| name == key)
            else {
                return Err(tag_error(format!(
                    "Unrecognized special triton tag \"{}\"",
                    key
                )));
            };
            if !tag_type.matches(value) {
                return Err(tag_error(format!(
                    "Triton tag \"{}\" value must be a {}: {} ({})",
                    key,
                    tag_type.name(),
                    super::display_tag_value(value),
                    actual_type(value)
                )));
            }
            if key == "triton.cns.services" {
                validate_cns_services(value.as_str().unwrap_or_default())?;
            }
            continue;
        }
        if key.is_empty() {
            return Err(tag_error("tag keys must be non-empty".to_string()));
        }
        if !matches!(
            value,
            Value::String(_) | Value::Number(_) | Value::Bool(_)
        ) {
            return Err(tag_error(format!(
                "tag \"{}\" value must be a string, number or boolean",
                key
            )));
        }
    }
    Ok(())
}

/// Checks a tag deletion against the reserved-tag policy.
pub fn validate_tag_deletion(key: &str, docker_vm: bool) -> Result<(), Error> {
    if !is_reserved_tag(key) {
        return Ok(());
    }
    if docker_vm {
        Err(reserved_tag_error(format!(
            "Special tag \"{}\" may not be deleted",
            key
        )))
    } else {
        Err(reserved_tag_error(format!(
            "Special tag \"{}\" not supported",
            key
        )))
    }
}

/// `triton.cns.services` is a comma-separated list of DNS labels (each
/// optionally carrying a `:port` suffix).
fn validate_cns_services(value: &str) -> Result<(), Error> {
    for item in value.split(',') {
        let label = item.split(':').next().unwrap_or(item);
        if !valid_dns_label(label) {
            return Err(tag_error(format!(
                "invalid \"triton.cns.services\" tag: \
                 Expected DNS name but \"{}\" found.",
                item
            )));
        }
    }
    Ok(())
}

fn valid_dns_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= 63
        && label
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !label.starts_with('-')
        && !label.ends_with('-')
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn tags(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn first_message(error: Error) -> String {
        match error {
            Error::ValidationFailed { errors, .. } => {
                errors[0].message.clone().unwrap()
            }
            other => panic!("expected ValidationFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_plain_tags_pass() {
        let tags = tags(&[
            ("role", json!("database")),
            ("count", json!(3)),
            ("primary", json!(true)),
        ]);
        assert!(validate_vm_tags(&tags, false).is_ok());
    }

    #[test]
    fn test_unknown_triton_tag() {
        let error =
            validate_vm_tags(&tags(&[("triton.foo", json!(true))]), false)
                .unwrap_err();
        assert_eq!(
            first_message(error),
            "Unrecognized special triton tag \"triton.foo\""
        );
    }

    #[test]
    fn test_triton_tag_type_mismatch() {
        let error = validate_vm_tags(
            &tags(&[("triton.cns.disable", json!("yes"))]),
            false,
        )
        .unwrap_err();
        assert_eq!(
            first_message(error),
            "Triton tag \"triton.cns.disable\" value must be a boolean: \
             yes (string)"
        );
    }

    #[test]
    fn test_cns_services_labels() {
        assert!(validate_vm_tags(
            &tags(&[("triton.cns.services", json!("web,db:5432"))]),
            false
        )
        .is_ok());
        let error = validate_vm_tags(
            &tags(&[("triton.cns.services", json!("good,-bad-"))]),
            false,
        )
        .unwrap_err();
        assert_eq!(
            first_message(error),
            "invalid \"triton.cns.services\" tag: \
             Expected DNS name but \"-bad-\" found."
        );
    }

    #[test]
    fn test_reserved_docker_tags() {
        let reserved =
            tags(&[("docker:label:com.docker.blah", json!("baz"))]);
        let error = validate_vm_tags(&reserved, false).unwrap_err();
        assert_eq!(
            error.to_string(),
            "Special tag \"docker:label:com.docker.blah\" not supported"
        );
        // Allowed only at docker provision time.
        assert!(validate_vm_tags(&reserved, true).is_ok());

        let error = validate_tag_deletion("sdc_docker", true).unwrap_err();
        assert_eq!(
            error.to_string(),
            "Special tag \"sdc_docker\" may not be deleted"
        );
    }
}
