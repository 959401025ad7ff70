//! Tailscale membership facts, read from the local `tailscale` client.
//! Hosts without tailscale simply contribute nothing.

use std::process::Command;

use crate::value::{Value, ValueMap};

fn tailscale_status() -> Option<serde_json::Value> {
    let binary = which::which("tailscale").ok()?;
    let output = Command::new(binary)
        .args(["status", "-self", "-json"])
        .output()
        .ok()?;
    if !output.status.success() {
        info!("tailscale status call failed");
        return None;
    }

    serde_json::from_slice(&output.stdout).ok()
}

pub fn gather() -> Option<ValueMap> {
    let status = tailscale_status()?;
    let own = status.get("Self")?;

    let mut data = ValueMap::new();
    data.insert(
        "version".into(),
        Value::from_json(status.get("Version").unwrap_or(&serde_json::Value::Null)),
    );
    data.insert(
        "online".into(),
        Value::from_json(own.get("Online").unwrap_or(&serde_json::Value::Null)),
    );
    data.insert(
        "capabilities".into(),
        Value::from_json(own.get("Capabilities").unwrap_or(&serde_json::Value::Null)),
    );
    data.insert(
        "dns_name".into(),
        Value::from_json(own.get("DNSName").unwrap_or(&serde_json::Value::Null)),
    );
    data.insert(
        "addresses".into(),
        Value::from_json(own.get("TailscaleIPs").unwrap_or(&serde_json::Value::Null)),
    );

    let mut facts = ValueMap::new();
    facts.insert("tailscale".into(), Value::Map(data));
    Some(facts)
}
