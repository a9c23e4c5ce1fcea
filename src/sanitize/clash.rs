//! Clash configuration post-processing.
//!
//! Drops malformed proxies from converted YAML, then repairs the
//! references that removal breaks: proxy groups lose dangling member
//! names (and disappear entirely when emptied), and rules pointing at a
//! target that is neither a group nor a built-in policy are removed.
//!
//! Fail-soft contract: anything that is not parseable YAML (or not
//! YAML-shaped at all) passes through byte for byte. A broken converter
//! response is the client's problem to surface, not ours to mangle.

use regex::Regex;
use serde_yaml::Value;
use std::net::Ipv6Addr;
use std::sync::OnceLock;
use tracing::debug;

/// Built-in policies a group member or rule target may always name.
const SPECIAL_TARGETS: &[&str] = &["REJECT", "DIRECT", "REJECT-TINYGIF", "BLACKHOLE"];

/// Ciphers accepted for shadowsocks proxies.
const SUPPORTED_CIPHERS: &[&str] = &[
    "none",
    "auto",
    "dummy",
    "aes-128-gcm",
    "aes-192-gcm",
    "aes-256-gcm",
    "lea-128-gcm",
    "lea-192-gcm",
    "lea-256-gcm",
    "aes-128-gcm-siv",
    "aes-256-gcm-siv",
    "2022-blake3-aes-128-gcm",
    "2022-blake3-aes-256-gcm",
    "aes-128-cfb",
    "aes-192-cfb",
    "aes-256-cfb",
    "aes-128-ctr",
    "aes-192-ctr",
    "aes-256-ctr",
    "chacha20",
    "chacha20-ietf",
    "chacha20-ietf-poly1305",
    "2022-blake3-chacha20-poly1305",
    "rabbit128-poly1305",
    "xchacha20-ietf-poly1305",
    "xchacha20",
    "aegis-128l",
    "aegis-256",
    "aez-384",
    "deoxys-ii-256-128",
    "rc4-md5",
];

fn uuid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"(?i)^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$").unwrap()
    })
}

/// Sanitize a Clash YAML document. Returns the input unchanged when it
/// does not look like YAML or fails to parse.
pub fn process(content: &str) -> String {
    if !looks_like_yaml(content) {
        return content.to_string();
    }
    let Ok(mut doc) = serde_yaml::from_str::<Value>(content) else {
        debug!("Clash content failed to parse, passing through");
        return content.to_string();
    };
    if !doc.is_mapping() {
        return content.to_string();
    }

    let mut valid_proxy_names: Vec<String> = Vec::new();
    if let Some(Value::Sequence(proxies)) = doc.get_mut("proxies") {
        proxies.retain(|proxy| is_valid_proxy(proxy));
        for proxy in proxies.iter() {
            if let Some(name) = proxy.get("name").and_then(Value::as_str) {
                valid_proxy_names.push(name.to_string());
            }
        }
    }

    // All original group names stay referenceable from rules even if a
    // group ends up dropped for having no members.
    let mut group_names: Vec<String> = Vec::new();
    if let Some(Value::Sequence(groups)) = doc.get("proxy-groups") {
        for group in groups {
            if let Some(name) = group.get("name").and_then(Value::as_str) {
                group_names.push(name.to_string());
            }
        }
    }

    if let Some(Value::Sequence(groups)) = doc.get_mut("proxy-groups") {
        let member_ok = |name: &str| {
            valid_proxy_names.iter().any(|n| n == name)
                || group_names.iter().any(|n| n == name)
                || SPECIAL_TARGETS.contains(&name)
        };
        groups.retain_mut(|group| {
            if group.get("name").and_then(Value::as_str).is_none() {
                return false;
            }
            let Some(Value::Sequence(members)) = group.get_mut("proxies") else {
                return false;
            };
            members.retain(|member| member.as_str().is_some_and(member_ok));
            !members.is_empty()
        });
    }

    if let Some(Value::Sequence(rules)) = doc.get_mut("rules") {
        let target_ok = |name: &str| {
            group_names.iter().any(|n| n == name) || SPECIAL_TARGETS.contains(&name)
        };
        rules.retain(|rule| {
            let Some(text) = rule.as_str() else {
                return false;
            };
            let parts: Vec<&str> = text.split(',').collect();
            parts.len() > 1 && parts.last().is_some_and(|last| target_ok(last.trim()))
        });
    }

    match serde_yaml::to_string(&doc) {
        Ok(out) => out,
        Err(e) => {
            debug!(error = %e, "Failed to re-emit Clash YAML, passing through");
            content.to_string()
        }
    }
}

/// Cheap structural sniff so plain base64 or raw link lists pass
/// through untouched.
fn looks_like_yaml(content: &str) -> bool {
    content
        .trim()
        .lines()
        .any(|line| {
            line.starts_with("---")
                || line.starts_with("proxies:")
                || line.starts_with("port:")
                || line.starts_with("name:")
                || line.starts_with("server:")
        })
}

fn is_valid_proxy(proxy: &Value) -> bool {
    let Some(kind) = proxy.get("type").and_then(Value::as_str) else {
        return false;
    };
    if proxy.get("name").is_none() {
        return false;
    }
    for field in required_fields(kind) {
        if !field_present(proxy, field) {
            return false;
        }
    }
    // Bare IPv6 literals break downstream clients; hostnames and IPv4
    // stay. Only values that actually parse as IPv6 are rejected.
    if let Some(server) = proxy.get("server").and_then(Value::as_str) {
        if server.parse::<Ipv6Addr>().is_ok() {
            return false;
        }
    }
    match kind {
        "ss" => proxy
            .get("cipher")
            .and_then(Value::as_str)
            .is_some_and(|c| SUPPORTED_CIPHERS.contains(&c)),
        "vmess" => proxy
            .get("uuid")
            .and_then(Value::as_str)
            .is_some_and(|u| uuid_re().is_match(u)),
        _ => true,
    }
}

fn required_fields(kind: &str) -> &'static [&'static str] {
    match kind {
        "ss" => &["name", "type", "server", "port", "cipher", "password"],
        "vmess" => &["name", "type", "server", "port", "uuid"],
        "trojan" => &["name", "type", "server", "port", "password"],
        "snell" => &["name", "type", "server", "port", "psk"],
        _ => &["name", "type", "server", "port"],
    }
}

/// Present and non-empty: null, "", 0, and empty lists all count as
/// missing.
fn field_present(proxy: &Value, key: &str) -> bool {
    match proxy.get(key) {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::Sequence(s)) => !s.is_empty(),
        Some(Value::Bool(b)) => *b,
        Some(_) => true,
    }
}
