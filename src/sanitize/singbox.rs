//! Sing-box configuration post-processing.
//!
//! Upgrades sparse converter output with sane defaults (log level, DNS
//! servers, a direct outbound), clamps inbound ports, drops outbounds
//! with unsupported protocols or broken per-protocol settings, and
//! removes route rules whose outbound tag no longer exists.
//!
//! Same fail-soft contract as the Clash side: unparseable JSON passes
//! through untouched.

use serde_json::{json, Value};
use tracing::debug;

const SUPPORTED_NETWORKS: &[&str] = &[
    "tcp", "udp", "tcp+udp", "http", "https", "tls", "ws", "grpc",
];

const SUPPORTED_PROTOCOLS: &[&str] = &[
    "vmess",
    "vless",
    "trojan",
    "shadowsocks",
    "shadowtls",
    "socks",
    "http",
    "chain",
    "quic",
];

const SUPPORTED_ENCRYPTIONS: &[&str] = &[
    "none",
    "auto",
    "aes-128-gcm",
    "aes-192-gcm",
    "aes-256-gcm",
    "chacha20-poly1305",
    "chacha20-ietf-poly1305",
    "xchacha20-poly1305",
    "aes-128-cfb",
    "aes-192-cfb",
    "aes-256-cfb",
    "aes-128-ctr",
    "aes-192-ctr",
    "aes-256-ctr",
    "rc4-md5",
    "chacha20-ietf",
    "xchacha20",
];

/// Sanitize a sing-box JSON document. Returns the input unchanged when
/// it fails to parse as a JSON object.
pub fn process(content: &str) -> String {
    let Ok(mut doc) = serde_json::from_str::<Value>(content) else {
        debug!("Sing-box content failed to parse, passing through");
        return content.to_string();
    };
    if !doc.is_object() {
        return content.to_string();
    }

    clamp_inbound_ports(&mut doc);
    filter_outbounds(&mut doc);
    // Defaults go in after outbound filtering: the injected fallback
    // outbound is not on the protocol allowlist and must survive.
    apply_defaults(&mut doc);
    filter_route_rules(&mut doc);

    match serde_json::to_string_pretty(&doc) {
        Ok(out) => out,
        Err(e) => {
            debug!(error = %e, "Failed to re-emit sing-box JSON, passing through");
            content.to_string()
        }
    }
}

fn apply_defaults(doc: &mut Value) {
    if doc.pointer("/log/level").is_none() {
        match doc.get_mut("log") {
            Some(Value::Object(log)) => {
                log.insert("level".to_string(), json!("info"));
            }
            _ => {
                doc["log"] = json!({ "level": "info" });
            }
        }
    }
    if doc.pointer("/dns/servers").is_none() {
        match doc.get_mut("dns") {
            Some(Value::Object(dns)) => {
                dns.insert("servers".to_string(), json!(["https://1.1.1.1/dns-query"]));
            }
            _ => {
                doc["dns"] = json!({ "servers": ["https://1.1.1.1/dns-query"] });
            }
        }
    }
    if doc.get("outbounds").is_none() {
        doc["outbounds"] = json!([
            {
                "tag": "direct",
                "protocol": "freedom",
                "settings": { "domainStrategy": "UseIPv4" }
            }
        ]);
    }
}

fn clamp_inbound_ports(doc: &mut Value) {
    let Some(Value::Array(inbounds)) = doc.get_mut("inbounds") else {
        return;
    };
    for inbound in inbounds {
        let valid = inbound
            .get("port")
            .and_then(Value::as_i64)
            .is_some_and(|p| (1..=65535).contains(&p));
        if !valid {
            inbound["port"] = json!(1080);
        }
    }
}

fn filter_outbounds(doc: &mut Value) {
    let Some(Value::Array(outbounds)) = doc.get_mut("outbounds") else {
        return;
    };
    outbounds.retain_mut(|outbound| {
        if outbound.get("tag").is_none() {
            return false;
        }
        let Some(protocol) = outbound.get("protocol").and_then(Value::as_str) else {
            return false;
        };
        let protocol = protocol.to_lowercase();
        if !SUPPORTED_PROTOCOLS.contains(&protocol.as_str()) {
            return false;
        }

        if let Some(network) = outbound.get("network").and_then(Value::as_str) {
            let network = network.to_lowercase();
            if !SUPPORTED_NETWORKS.contains(&network.as_str()) {
                if network == "none" {
                    return false;
                }
                if let Some(obj) = outbound.as_object_mut() {
                    obj.remove("network");
                }
            }
        }

        match protocol.as_str() {
            "vmess" | "vless" => {
                outbound.pointer("/settings/vnext/0/address").is_some()
                    && outbound.pointer("/settings/vnext/0/port").is_some()
                    && outbound.pointer("/settings/vnext/0/users/0/id").is_some()
            }
            "trojan" => {
                outbound.pointer("/settings/servers/0/address").is_some()
                    && outbound.pointer("/settings/servers/0/port").is_some()
                    && outbound.pointer("/settings/servers/0/password").is_some()
            }
            "shadowsocks" => {
                let base = outbound.pointer("/settings/servers/0/address").is_some()
                    && outbound.pointer("/settings/servers/0/port").is_some()
                    && outbound.pointer("/settings/servers/0/password").is_some();
                base && outbound
                    .pointer("/settings/servers/0/method")
                    .and_then(Value::as_str)
                    .is_some_and(|m| {
                        SUPPORTED_ENCRYPTIONS.contains(&m.to_lowercase().as_str())
                    })
            }
            _ => true,
        }
    });
}

fn filter_route_rules(doc: &mut Value) {
    let tags: Vec<String> = doc
        .get("outbounds")
        .and_then(Value::as_array)
        .map(|outbounds| {
            outbounds
                .iter()
                .filter_map(|o| o.get("tag").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let Some(Value::Array(rules)) = doc.pointer_mut("/route/rules") else {
        return;
    };
    rules.retain(|rule| match rule.get("outbound").and_then(Value::as_str) {
        Some(tag) => tags.iter().any(|t| t == tag),
        None => true,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> String {
        json!({
            "inbounds": [
                { "type": "mixed", "port": 99999 },
                { "type": "mixed", "port": 1234 }
            ],
            "outbounds": [
                {
                    "tag": "vm-ok",
                    "protocol": "vmess",
                    "settings": { "vnext": [{ "address": "a.example", "port": 443,
                        "users": [{ "id": "u" }] }] }
                },
                {
                    "tag": "vm-broken",
                    "protocol": "vmess",
                    "settings": { "vnext": [{ "address": "b.example" }] }
                },
                { "tag": "weird", "protocol": "teleport" },
                {
                    "tag": "ss-bad-method",
                    "protocol": "shadowsocks",
                    "settings": { "servers": [{ "address": "c.example", "port": 1,
                        "method": "rot13", "password": "p" }] }
                },
                { "tag": "none-net", "protocol": "socks", "network": "none" },
                { "tag": "odd-net", "protocol": "socks", "network": "carrier-pigeon" }
            ],
            "route": {
                "rules": [
                    { "domain": ["x.example"], "outbound": "vm-ok" },
                    { "domain": ["y.example"], "outbound": "vm-broken" },
                    { "domain": ["z.example"] }
                ]
            }
        })
        .to_string()
    }

    fn processed() -> Value {
        serde_json::from_str(&process(&sample())).unwrap()
    }

    #[test]
    fn defaults_injected() {
        let doc = processed();
        assert_eq!(doc["log"]["level"], "info");
        assert_eq!(doc["dns"]["servers"][0], "https://1.1.1.1/dns-query");
    }

    #[test]
    fn missing_outbounds_get_direct_default() {
        let doc: Value = serde_json::from_str(&process("{}")).unwrap();
        assert_eq!(doc["outbounds"][0]["tag"], "direct");
        assert_eq!(doc["outbounds"][0]["protocol"], "freedom");
    }

    #[test]
    fn injected_default_satisfies_route_rules() {
        let input = json!({
            "route": { "rules": [{ "domain": ["x.example"], "outbound": "direct" }] }
        })
        .to_string();
        let doc: Value = serde_json::from_str(&process(&input)).unwrap();
        assert_eq!(doc["outbounds"][0]["tag"], "direct");
        assert_eq!(doc["route"]["rules"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn invalid_inbound_port_clamped() {
        let doc = processed();
        assert_eq!(doc["inbounds"][0]["port"], 1080);
        assert_eq!(doc["inbounds"][1]["port"], 1234);
    }

    #[test]
    fn broken_outbounds_removed() {
        let doc = processed();
        let tags: Vec<&str> = doc["outbounds"]
            .as_array()
            .unwrap()
            .iter()
            .map(|o| o["tag"].as_str().unwrap())
            .collect();
        assert_eq!(tags, vec!["vm-ok", "odd-net"]);
    }

    #[test]
    fn unknown_network_field_stripped() {
        let doc = processed();
        let odd = doc["outbounds"]
            .as_array()
            .unwrap()
            .iter()
            .find(|o| o["tag"] == "odd-net")
            .unwrap();
        assert!(odd.get("network").is_none());
    }

    #[test]
    fn route_rules_follow_surviving_tags() {
        let doc = processed();
        let rules = doc["route"]["rules"].as_array().unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0]["outbound"], "vm-ok");
        // Rules without an outbound are untouched
        assert!(rules[1].get("outbound").is_none());
    }

    #[test]
    fn invalid_json_passes_through() {
        assert_eq!(process("not json"), "not json");
        assert_eq!(process("[1,2,3]"), "[1,2,3]");
    }
}
