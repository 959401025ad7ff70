//! Network interface and address facts.

use indexmap::IndexMap;
use nix::ifaddrs::getifaddrs;

use crate::value::{Value, ValueMap};

#[derive(Default)]
struct InterfaceAddrs {
    ipv4: Vec<Value>,
    ipv6: Vec<Value>,
}

pub fn gather() -> Option<ValueMap> {
    let addrs = match getifaddrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            debug!("cannot enumerate interfaces: {e}");
            return None;
        }
    };

    let mut interfaces: IndexMap<String, InterfaceAddrs> = IndexMap::new();
    for ifaddr in addrs {
        let entry = interfaces.entry(ifaddr.interface_name.clone()).or_default();
        let Some(address) = ifaddr.address else {
            continue;
        };

        if let Some(sin) = address.as_sockaddr_in() {
            let mut record = Value::map();
            record.insert("addr".into(), sin.ip().to_string().into());
            if let Some(mask) = ifaddr.netmask.as_ref().and_then(|m| m.as_sockaddr_in()) {
                record.insert("netmask".into(), mask.ip().to_string().into());
            }
            entry.ipv4.push(Value::Map(record));
        } else if let Some(sin6) = address.as_sockaddr_in6() {
            let mut record = Value::map();
            record.insert("addr".into(), sin6.ip().to_string().into());
            if let Some(mask) = ifaddr.netmask.as_ref().and_then(|m| m.as_sockaddr_in6()) {
                record.insert("netmask".into(), mask.ip().to_string().into());
            }
            entry.ipv6.push(Value::Map(record));
        }
    }

    let mut network = ValueMap::new();
    network.insert(
        "interfaces".into(),
        Value::List(
            interfaces
                .keys()
                .map(|name| Value::from(name.clone()))
                .collect(),
        ),
    );

    let mut per_iface = ValueMap::new();
    for (name, addrs) in interfaces {
        let mut families = Value::map();
        families.insert("ipv4".into(), Value::List(addrs.ipv4));
        families.insert("ipv6".into(), Value::List(addrs.ipv6));
        per_iface.insert(name, Value::Map(families));
    }
    network.insert("interface".into(), Value::Map(per_iface));

    debug!("gathered {} interface facts", network.len());
    let mut facts = ValueMap::new();
    facts.insert("network".into(), Value::Map(network));
    Some(facts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_families_for_every_interface() {
        // Every reasonable test machine has at least a loopback.
        let facts = gather().unwrap();
        let network = facts.get("network").unwrap();
        let names = network.get("interfaces").unwrap().as_list().unwrap();
        assert!(!names.is_empty());

        let per_iface = network.get("interface").unwrap().as_map().unwrap();
        for families in per_iface.values() {
            assert!(families.get("ipv4").is_some());
            assert!(families.get("ipv6").is_some());
        }
    }
}
