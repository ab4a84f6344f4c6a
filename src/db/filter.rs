// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Query compilation for the VM store
//!
//! Three query surfaces compile down to one [`Predicate`] tree evaluated
//! against a flattened VM document: structured filter parameters, LDAP-style
//! `query=` strings, and JSON `predicate=` trees.  When several are supplied
//! they are intersected.

use crate::db::model::Vm;
use crate::db::model::VmState;
use serde_json::Map;
use serde_json::Value;
use std::cmp::Ordering;

/// A compiled query predicate
///
/// String comparison values may contain `*` wildcards, which match any
/// substring (the LDAP substring-filter semantics).
#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    Eq(String, Value),
    Ne(String, Value),
    Gt(String, Value),
    Ge(String, Value),
    Lt(String, Value),
    Le(String, Value),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    Present(String),
}

impl Predicate {
    pub fn matches(&self, doc: &Map<String, Value>) -> bool {
        match self {
            Predicate::And(preds) => preds.iter().all(|p| p.matches(doc)),
            Predicate::Or(preds) => preds.iter().any(|p| p.matches(doc)),
            Predicate::Not(pred) => !pred.matches(doc),
            Predicate::Present(field) => {
                doc.get(field).map(|v| !v.is_null()).unwrap_or(false)
            }
            Predicate::Eq(field, value) => eq_value(doc.get(field), value),
            Predicate::Ne(field, value) => !eq_value(doc.get(field), value),
            Predicate::Gt(field, value) => {
                cmp_field(doc.get(field), value) == Some(Ordering::Greater)
            }
            Predicate::Ge(field, value) => matches!(
                cmp_field(doc.get(field), value),
                Some(Ordering::Greater) | Some(Ordering::Equal)
            ),
            Predicate::Lt(field, value) => {
                cmp_field(doc.get(field), value) == Some(Ordering::Less)
            }
            Predicate::Le(field, value) => matches!(
                cmp_field(doc.get(field), value),
                Some(Ordering::Less) | Some(Ordering::Equal)
            ),
        }
    }
}

fn eq_value(actual: Option<&Value>, expected: &Value) -> bool {
    let Some(actual) = actual else { return false };
    if let Value::String(pattern) = expected {
        if pattern.contains('*') {
            return wildcard_match(pattern, &value_to_string(actual));
        }
    }
    match (actual, expected) {
        (Value::String(a), Value::String(e)) => a == e,
        (Value::Bool(a), Value::Bool(e)) => a == e,
        // Numbers compare numerically whichever side arrives as a string
        // (LDAP filter values are always strings on the wire).
        _ => match (value_to_f64(actual), value_to_f64(expected)) {
            (Some(a), Some(e)) => a == e,
            _ => value_to_string(actual) == value_to_string(expected),
        },
    }
}

fn cmp_field(actual: Option<&Value>, expected: &Value) -> Option<Ordering> {
    let actual = actual?;
    if let (Some(a), Some(e)) = (value_to_f64(actual), value_to_f64(expected)) {
        return a.partial_cmp(&e);
    }
    Some(value_to_string(actual).cmp(&value_to_string(expected)))
}

fn value_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

pub(crate) fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Matches `pattern` (with `*` wildcards) against `input`.
fn wildcard_match(pattern: &str, input: &str) -> bool {
    let segments: Vec<&str> = pattern.split('*').collect();
    let anchored_start = !pattern.starts_with('*');
    let anchored_end = !pattern.ends_with('*');
    let mut rest = input;
    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            continue;
        }
        if i == 0 && anchored_start {
            match rest.strip_prefix(segment) {
                Some(r) => rest = r,
                None => return false,
            }
            continue;
        }
        if i == segments.len() - 1 && anchored_end {
            return rest.ends_with(segment);
        }
        match rest.find(segment) {
            Some(pos) => rest = &rest[pos + segment.len()..],
            None => return false,
        }
    }
    true
}

/// Parses an LDAP-style filter string, e.g.
/// `(&(ram>=128)(tags=*-smartdc_type=core-*))`.
pub fn parse_ldap(input: &str) -> Result<Predicate, String> {
    let mut parser = LdapParser { input: input.as_bytes(), pos: 0 };
    let predicate = parser.filter()?;
    parser.skip_whitespace();
    if parser.pos != parser.input.len() {
        return Err(format!(
            "trailing characters at offset {} in filter",
            parser.pos
        ));
    }
    Ok(predicate)
}

struct LdapParser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> LdapParser<'a> {
    fn skip_whitespace(&mut self) {
        while self.pos < self.input.len()
            && self.input[self.pos].is_ascii_whitespace()
        {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn expect(&mut self, c: u8) -> Result<(), String> {
        if self.peek() == Some(c) {
            self.pos += 1;
            Ok(())
        } else {
            Err(format!(
                "expected {:?} at offset {}",
                c as char, self.pos
            ))
        }
    }

    fn filter(&mut self) -> Result<Predicate, String> {
        self.skip_whitespace();
        self.expect(b'(')?;
        let predicate = match self.peek() {
            Some(b'&') => {
                self.pos += 1;
                Predicate::And(self.filter_list()?)
            }
            Some(b'|') => {
                self.pos += 1;
                Predicate::Or(self.filter_list()?)
            }
            Some(b'!') => {
                self.pos += 1;
                Predicate::Not(Box::new(self.filter()?))
            }
            _ => self.item()?,
        };
        self.skip_whitespace();
        self.expect(b')')?;
        Ok(predicate)
    }

    fn filter_list(&mut self) -> Result<Vec<Predicate>, String> {
        let mut filters = Vec::new();
        loop {
            self.skip_whitespace();
            if self.peek() != Some(b'(') {
                break;
            }
            filters.push(self.filter()?);
        }
        if filters.is_empty() {
            return Err(format!("empty filter list at offset {}", self.pos));
        }
        Ok(filters)
    }

    fn item(&mut self) -> Result<Predicate, String> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == b'=' || c == b'>' || c == b'<' || c == b')' {
                break;
            }
            self.pos += 1;
        }
        let attr = std::str::from_utf8(&self.input[start..self.pos])
            .map_err(|_| "filter is not valid UTF-8".to_string())?
            .trim()
            .to_string();
        if attr.is_empty() {
            return Err(format!("missing attribute at offset {}", start));
        }
        let op = match self.peek() {
            Some(b'=') => {
                self.pos += 1;
                b'='
            }
            Some(c @ (b'>' | b'<')) => {
                self.pos += 1;
                self.expect(b'=')?;
                c
            }
            _ => {
                return Err(format!(
                    "expected comparison operator at offset {}",
                    self.pos
                ));
            }
        };
        let vstart = self.pos;
        while let Some(c) = self.peek() {
            if c == b')' {
                break;
            }
            self.pos += 1;
        }
        let raw = std::str::from_utf8(&self.input[vstart..self.pos])
            .map_err(|_| "filter is not valid UTF-8".to_string())?
            .to_string();
        let value = Value::String(raw.clone());
        Ok(match op {
            b'=' if raw == "*" => Predicate::Present(attr),
            b'=' => Predicate::Eq(attr, value),
            b'>' => Predicate::Ge(attr, value),
            b'<' => Predicate::Le(attr, value),
            _ => unreachable!(),
        })
    }
}

/// Parses a JSON predicate tree:
/// `{eq: [field, value]} | {ne} | {gt} | {ge} | {lt} | {le} | {and: […]} |
/// {or: […]}`.
pub fn parse_predicate(value: &Value) -> Result<Predicate, String> {
    let object = value
        .as_object()
        .ok_or_else(|| "predicate must be an object".to_string())?;
    if object.len() != 1 {
        return Err("predicate must have exactly one key".to_string());
    }
    let (key, arg) = object.iter().next().unwrap();
    match key.as_str() {
        "and" | "or" => {
            let items = arg.as_array().ok_or_else(|| {
                format!("\"{}\" takes an array of predicates", key)
            })?;
            let parsed = items
                .iter()
                .map(parse_predicate)
                .collect::<Result<Vec<_>, _>>()?;
            if parsed.is_empty() {
                return Err(format!("\"{}\" requires at least one predicate", key));
            }
            Ok(if key == "and" {
                Predicate::And(parsed)
            } else {
                Predicate::Or(parsed)
            })
        }
        "eq" | "ne" | "gt" | "ge" | "lt" | "le" => {
            let pair = arg
                .as_array()
                .filter(|a| a.len() == 2)
                .ok_or_else(|| {
                    format!("\"{}\" takes a [field, value] pair", key)
                })?;
            let field = pair[0]
                .as_str()
                .ok_or_else(|| "predicate field must be a string".to_string())?
                .to_string();
            let value = pair[1].clone();
            Ok(match key.as_str() {
                "eq" => Predicate::Eq(field, value),
                "ne" => Predicate::Ne(field, value),
                "gt" => Predicate::Gt(field, value),
                "ge" => Predicate::Ge(field, value),
                "lt" => Predicate::Lt(field, value),
                _ => Predicate::Le(field, value),
            })
        }
        other => Err(format!("unknown predicate operation: \"{}\"", other)),
    }
}

/// State filter: either a literal state or the `active` shortcut
/// (neither destroyed nor failed).
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StateFilter {
    Is(VmState),
    Active,
}

impl StateFilter {
    pub fn parse(s: &str) -> Result<StateFilter, String> {
        if s == "active" {
            Ok(StateFilter::Active)
        } else {
            Ok(StateFilter::Is(s.parse()?))
        }
    }

    fn matches(&self, state: VmState) -> bool {
        match self {
            StateFilter::Is(wanted) => state == *wanted,
            StateFilter::Active => state.active(),
        }
    }
}

/// Structured filter parameters; all present constraints AND together,
/// further intersected with the `query` and `predicate` trees.
#[derive(Clone, Debug, Default)]
pub struct VmFilter {
    pub uuid: Option<uuid::Uuid>,
    pub owner_uuid: Option<uuid::Uuid>,
    pub brand: Option<String>,
    pub state: Option<StateFilter>,
    pub alias: Option<String>,
    pub ram: Option<u64>,
    pub server_uuid: Option<uuid::Uuid>,
    pub billing_id: Option<uuid::Uuid>,
    pub tags: Vec<(String, String)>,
    pub query: Option<Predicate>,
    pub predicate: Option<Predicate>,
}

impl VmFilter {
    pub fn matches(&self, vm: &Vm, doc: &Map<String, Value>) -> bool {
        if let Some(uuid) = &self.uuid {
            if vm.uuid != *uuid {
                return false;
            }
        }
        if let Some(owner) = &self.owner_uuid {
            if vm.owner_uuid != *owner {
                return false;
            }
        }
        if let Some(brand) = &self.brand {
            if vm.brand.to_string() != *brand {
                return false;
            }
        }
        if let Some(state) = &self.state {
            if !state.matches(vm.state) {
                return false;
            }
        }
        if let Some(alias) = &self.alias {
            if vm.alias.as_deref() != Some(alias.as_str()) {
                return false;
            }
        }
        if let Some(ram) = &self.ram {
            if vm.ram != *ram {
                return false;
            }
        }
        if let Some(server) = &self.server_uuid {
            if vm.server_uuid != Some(*server) {
                return false;
            }
        }
        if let Some(billing) = &self.billing_id {
            if vm.billing_id != *billing {
                return false;
            }
        }
        for (key, wanted) in &self.tags {
            match vm.tags.get(key) {
                Some(value) if value_to_string(value) == *wanted => {}
                _ => return false,
            }
        }
        if let Some(query) = &self.query {
            if !query.matches(doc) {
                return false;
            }
        }
        if let Some(predicate) = &self.predicate {
            if !predicate.matches(doc) {
                return false;
            }
        }
        true
    }
}

/// Builds the flattened document predicates evaluate against.  Tags are
/// additionally flattened to the store's `-key=value-` string convention so
/// that `tags=*-<key>=<value>-*` filters work.
pub fn vm_document(vm: &Vm) -> Map<String, Value> {
    let mut doc = match serde_json::to_value(vm) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };
    let mut flattened = String::from("-");
    for (key, value) in &vm.tags {
        flattened.push_str(key);
        flattened.push('=');
        flattened.push_str(&value_to_string(value));
        flattened.push('-');
    }
    doc.insert("tags".to_string(), Value::String(flattened));
    doc
}

#[derive(Clone, Debug, PartialEq)]
pub struct Sort {
    pub field: String,
    pub ascending: bool,
}

impl Default for Sort {
    fn default() -> Sort {
        Sort { field: "create_timestamp".to_string(), ascending: false }
    }
}

impl Sort {
    /// Parses `sort=<field>.<asc|desc>` (bare field sorts ascending).
    pub fn parse(s: &str) -> Result<Sort, String> {
        match s.rsplit_once('.') {
            Some((field, "asc")) => {
                Ok(Sort { field: field.to_string(), ascending: true })
            }
            Some((field, "desc")) => {
                Ok(Sort { field: field.to_string(), ascending: false })
            }
            Some((_, order)) => {
                Err(format!("unknown sort order: \"{}\"", order))
            }
            None => Ok(Sort { field: s.to_string(), ascending: true }),
        }
    }

    pub fn compare(
        &self,
        a: &Map<String, Value>,
        b: &Map<String, Value>,
    ) -> Ordering {
        let av = a.get(&self.field).unwrap_or(&Value::Null);
        let bv = b.get(&self.field).unwrap_or(&Value::Null);
        let ordering = cmp_field(Some(av), bv).unwrap_or(Ordering::Equal);
        if self.ascending { ordering } else { ordering.reverse() }
    }
}

/// Pagination and projection options for list queries
#[derive(Clone, Debug)]
pub struct ListOptions {
    pub limit: usize,
    pub offset: usize,
    pub sort: Sort,
    pub fields: Option<Vec<String>>,
}

impl Default for ListOptions {
    fn default() -> ListOptions {
        ListOptions {
            limit: crate::config::DEFAULT_LIST_LIMIT,
            offset: 0,
            sort: Sort::default(),
            fields: None,
        }
    }
}

/// Applies a `fields=` projection: unlisted fields are absent, not null.
pub fn project(doc: Map<String, Value>, fields: &[String]) -> Map<String, Value> {
    doc.into_iter().filter(|(k, _)| fields.iter().any(|f| f == k)).collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_parse_ldap_simple() {
        let predicate = parse_ldap("(ram>=128)").unwrap();
        assert_eq!(
            predicate,
            Predicate::Ge("ram".to_string(), json!("128"))
        );
        assert!(predicate.matches(&doc(json!({"ram": 256}))));
        assert!(predicate.matches(&doc(json!({"ram": 128}))));
        assert!(!predicate.matches(&doc(json!({"ram": 64}))));
    }

    #[test]
    fn test_parse_ldap_composite() {
        let predicate =
            parse_ldap("(&(ram>=128)(tags=*-smartdc_type=core-*))").unwrap();
        let d = doc(json!({"ram": 512, "tags": "-smartdc_type=core-role=db-"}));
        assert!(predicate.matches(&d));
        let d = doc(json!({"ram": 512, "tags": "-role=db-"}));
        assert!(!predicate.matches(&d));
    }

    #[test]
    fn test_parse_ldap_not_and_present() {
        let predicate = parse_ldap("(!(state=destroyed))").unwrap();
        assert!(predicate.matches(&doc(json!({"state": "running"}))));
        assert!(!predicate.matches(&doc(json!({"state": "destroyed"}))));

        let predicate = parse_ldap("(server_uuid=*)").unwrap();
        assert!(predicate.matches(&doc(json!({"server_uuid": "abc"}))));
        assert!(!predicate.matches(&doc(json!({"ram": 128}))));
    }

    #[test]
    fn test_parse_ldap_rejects_garbage() {
        assert!(parse_ldap("ram>=128").is_err());
        assert!(parse_ldap("(ram>=128").is_err());
        assert!(parse_ldap("(&)").is_err());
        assert!(parse_ldap("(ram>=128)x").is_err());
    }

    #[test]
    fn test_parse_json_predicate() {
        let predicate = parse_predicate(&json!({
            "and": [
                {"eq": ["brand", "lx"]},
                {"or": [{"gt": ["ram", 256]}, {"le": ["cpu_cap", 100]}]}
            ]
        }))
        .unwrap();
        assert!(predicate.matches(&doc(json!({"brand": "lx", "ram": 512}))));
        assert!(
            predicate.matches(&doc(json!({"brand": "lx", "ram": 64, "cpu_cap": 50})))
        );
        assert!(!predicate.matches(&doc(json!({"brand": "kvm", "ram": 512}))));
        assert!(parse_predicate(&json!({"between": ["ram", 1, 2]})).is_err());
        assert!(parse_predicate(&json!({"eq": ["ram"]})).is_err());
    }

    #[test]
    fn test_wildcards() {
        assert!(wildcard_match("web-*", "web-042"));
        assert!(!wildcard_match("web-*", "db-042"));
        assert!(wildcard_match("*-core-*", "x-core-y"));
        assert!(wildcard_match("a*c", "abbbc"));
        assert!(!wildcard_match("a*c", "abbb"));
    }

    #[test]
    fn test_sort() {
        let sort = Sort::parse("ram.desc").unwrap();
        let a = doc(json!({"ram": 128}));
        let b = doc(json!({"ram": 512}));
        assert_eq!(sort.compare(&a, &b), Ordering::Greater);
        assert!(Sort::parse("ram.sideways").is_err());
        assert!(Sort::parse("alias").unwrap().ascending);
    }

    #[test]
    fn test_projection() {
        let projected = project(
            doc(json!({"uuid": "u", "alias": "a", "ram": 64})),
            &["uuid".to_string(), "alias".to_string()],
        );
        assert_eq!(projected.len(), 2);
        assert!(projected.get("ram").is_none());
    }
}
