// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Firewall rule validation
//!
//! Rules arrive as objects (`uuid`, `rule`, `owner_uuid`, `enabled`) whose
//! `rule` string must parse under the firewall DSL:
//!
//! ```text
//! FROM <targets> TO <targets> (ALLOW|BLOCK) <protocol> <ports>
//! ```
//!
//! Targets are `any`, `all vms`, `ip <addr>`, `subnet <cidr>`, `vm <uuid>`,
//! or `tag <name>[ = <value>]`, singly or parenthesized with `OR`.

use crate::db::model::FirewallRule;
use crate::errors::Error;
use crate::errors::FieldError;
use serde_json::Value;
use std::net::IpAddr;
use uuid::Uuid;

/// Validates the `firewall_rules` parameter and returns the parsed records.
pub fn validate_firewall_rules(value: &Value) -> Result<Vec<FirewallRule>, Error> {
    let Some(items) = value.as_array() else {
        return Err(Error::invalid_field(
            "firewall_rules",
            "Invalid",
            "firewall_rules must be an array of objects",
        ));
    };
    let mut rules = Vec::with_capacity(items.len());
    for item in items {
        rules.push(validate_rule_object(item)?);
    }
    Ok(rules)
}

fn rule_error(message: String) -> Error {
    Error::ValidationFailed {
        message: "Invalid VM parameters".to_string(),
        errors: vec![FieldError {
            field: "firewall_rules".to_string(),
            code: "Invalid".to_string(),
            message: Some(message),
            kind: None,
            id: None,
        }],
    }
}

fn validate_rule_object(item: &Value) -> Result<FirewallRule, Error> {
    let Some(object) = item.as_object() else {
        return Err(rule_error(
            "firewall rule must be an object".to_string(),
        ));
    };
    if object.get("global").and_then(Value::as_bool) == Some(true) {
        return Err(rule_error(
            "global firewall rules may not be created here".to_string(),
        ));
    }
    let uuid = object
        .get("uuid")
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| rule_error("firewall rule requires a uuid".to_string()))?;
    let owner_uuid = object
        .get("owner_uuid")
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| {
            rule_error("firewall rule requires an owner_uuid".to_string())
        })?;
    let enabled = object
        .get("enabled")
        .and_then(Value::as_bool)
        .ok_or_else(|| {
            rule_error("firewall rule requires a boolean enabled".to_string())
        })?;
    let rule = object
        .get("rule")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            rule_error("firewall rule requires a rule string".to_string())
        })?;
    parse_rule(rule)
        .map_err(|detail| rule_error(format!("Invalid rule: {}", detail)))?;
    Ok(FirewallRule {
        uuid,
        rule: rule.to_string(),
        owner_uuid,
        enabled,
    })
}

/// Parses the rule DSL; `Err` carries the reason the rule is malformed.
pub fn parse_rule(rule: &str) -> Result<(), String> {
    let tokens = tokenize(rule)?;
    let mut parser = RuleParser { tokens, pos: 0 };
    parser.keyword("FROM")?;
    parser.target_list()?;
    parser.keyword("TO")?;
    parser.target_list()?;
    if !(parser.try_keyword("ALLOW") || parser.try_keyword("BLOCK")) {
        return Err(format!(
            "expected ALLOW or BLOCK, found {:?}",
            parser.peek_or_end()
        ));
    }
    parser.protocol()?;
    if parser.pos != parser.tokens.len() {
        return Err(format!("unexpected trailing {:?}", parser.peek_or_end()));
    }
    Ok(())
}

fn tokenize(rule: &str) -> Result<Vec<String>, String> {
    let mut tokens = Vec::new();
    let mut chars = rule.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => continue,
            '(' | ')' | '=' | ',' => tokens.push(c.to_string()),
            '"' => {
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some(c) => s.push(c),
                        None => return Err("unterminated string".to_string()),
                    }
                }
                tokens.push(s);
            }
            c => {
                let mut s = String::from(c);
                while let Some(&next) = chars.peek() {
                    if next.is_whitespace()
                        || matches!(next, '(' | ')' | '=' | ',')
                    {
                        break;
                    }
                    s.push(next);
                    chars.next();
                }
                tokens.push(s);
            }
        }
    }
    if tokens.is_empty() {
        return Err("rule is empty".to_string());
    }
    Ok(tokens)
}

struct RuleParser {
    tokens: Vec<String>,
    pos: usize,
}

impl RuleParser {
    fn peek(&self) -> Option<&str> {
        self.tokens.get(self.pos).map(String::as_str)
    }

    fn peek_or_end(&self) -> String {
        self.peek().unwrap_or("end of rule").to_string()
    }

    fn next(&mut self) -> Result<String, String> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| "unexpected end of rule".to_string())?;
        self.pos += 1;
        Ok(token)
    }

    fn try_keyword(&mut self, keyword: &str) -> bool {
        if self.peek().map(|t| t.eq_ignore_ascii_case(keyword)).unwrap_or(false)
        {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn keyword(&mut self, keyword: &str) -> Result<(), String> {
        if self.try_keyword(keyword) {
            Ok(())
        } else {
            Err(format!("expected {}, found {:?}", keyword, self.peek_or_end()))
        }
    }

    fn target_list(&mut self) -> Result<(), String> {
        if self.try_keyword("(") {
            self.target()?;
            while self.try_keyword("OR") {
                self.target()?;
            }
            return self.keyword(")");
        }
        self.target()
    }

    fn target(&mut self) -> Result<(), String> {
        if self.try_keyword("ANY") {
            return Ok(());
        }
        if self.try_keyword("ALL") {
            return self.keyword("VMS");
        }
        if self.try_keyword("IP") {
            let addr = self.next()?;
            return addr
                .parse::<IpAddr>()
                .map(|_| ())
                .map_err(|_| format!("invalid IP address {:?}", addr));
        }
        if self.try_keyword("SUBNET") {
            let cidr = self.next()?.to_string();
            return parse_cidr(&cidr);
        }
        if self.try_keyword("VM") {
            let uuid = self.next()?;
            return Uuid::parse_str(&uuid)
                .map(|_| ())
                .map_err(|_| format!("invalid VM uuid {:?}", uuid));
        }
        if self.try_keyword("TAG") {
            let tag = self.next()?.to_string();
            if tag.is_empty() {
                return Err("tag name must be non-empty".to_string());
            }
            if self.try_keyword("=") {
                self.next()?;
            }
            return Ok(());
        }
        Err(format!("expected a target, found {:?}", self.peek_or_end()))
    }

    fn protocol(&mut self) -> Result<(), String> {
        if self.try_keyword("TCP") || self.try_keyword("UDP") {
            return self.ports();
        }
        if self.try_keyword("ICMP") {
            self.keyword("TYPE")?;
            let t = self.next()?.to_string();
            parse_u8(&t, "ICMP type")?;
            if self.try_keyword("CODE") {
                let c = self.next()?.to_string();
                parse_u8(&c, "ICMP code")?;
            }
            return Ok(());
        }
        Err(format!("expected a protocol, found {:?}", self.peek_or_end()))
    }

    fn ports(&mut self) -> Result<(), String> {
        if self.try_keyword("PORT") {
            if self.try_keyword("ALL") {
                return Ok(());
            }
            let port = self.next()?.to_string();
            parse_port(&port)?;
            while self.try_keyword("AND") {
                self.keyword("PORT")?;
                let port = self.next()?.to_string();
                parse_port(&port)?;
            }
            return Ok(());
        }
        if self.try_keyword("PORTS") {
            let port = self.next()?.to_string();
            parse_port(&port)?;
            while self.try_keyword(",") {
                let port = self.next()?.to_string();
                parse_port(&port)?;
            }
            return Ok(());
        }
        Err(format!("expected PORT or PORTS, found {:?}", self.peek_or_end()))
    }
}

fn parse_port(token: &str) -> Result<(), String> {
    // A port may be a single number or an n-m range.
    for part in token.splitn(2, '-') {
        match part.parse::<u32>() {
            Ok(port) if (1..=65535).contains(&port) => {}
            _ => return Err(format!("invalid port {:?}", token)),
        }
    }
    Ok(())
}

fn parse_u8(token: &str, what: &str) -> Result<(), String> {
    token
        .parse::<u8>()
        .map(|_| ())
        .map_err(|_| format!("invalid {} {:?}", what, token))
}

fn parse_cidr(token: &str) -> Result<(), String> {
    let error = || format!("invalid subnet {:?}", token);
    let (addr, prefix) = token.split_once('/').ok_or_else(error)?;
    let addr = addr.parse::<IpAddr>().map_err(|_| error())?;
    let prefix = prefix.parse::<u8>().map_err(|_| error())?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    if prefix > max {
        return Err(error());
    }
    Ok(())
}
