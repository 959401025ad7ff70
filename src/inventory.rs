//! The host inventory: a grouped collection of host descriptors loaded from
//! a directory tree of per-group YAML files.
//!
//! Descriptors keep their option bags as raw [`Value`] trees so that
//! late-binding tags survive loading untouched; [`Inventory::resolve_tags`]
//! produces the deep-copied, fully-evaluated inventory that is allowed to
//! travel to remotes.

use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};

use indexmap::IndexMap;

use crate::connection::{ConnectionMethod, MethodError};
use crate::errors::StreamError;
use crate::tags::{self, TagError, TagResolver};
use crate::transport::{Context, Router};
use crate::value::{FromValue, ToValue, Value, ValueError, ValueMap};

#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("cannot read inventory at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse inventory file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error(transparent)]
    Value(#[from] ValueError),

    #[error("connection method for host {0} is already set")]
    MethodAlreadySet(String),
}

/// Sudo policy attached to a host descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct SudoOptions(pub ValueMap);

impl Default for SudoOptions {
    fn default() -> Self {
        let mut map = Value::map();
        map.insert("username".into(), "root".into());
        SudoOptions(map)
    }
}

impl SudoOptions {
    pub fn username(&self) -> &str {
        self.0
            .get("username")
            .and_then(Value::as_str)
            .unwrap_or("root")
    }

    pub fn password(&self) -> Option<&str> {
        self.0.get("password").and_then(Value::as_str)
    }
}

/// A single entry in the inventory.
#[derive(Debug, Clone, PartialEq)]
pub struct HostSpec {
    /// Display name of the host.
    pub host: String,
    /// Connection method descriptor. Set exactly once; kept as a raw map so
    /// tagged secrets survive until resolution.
    connection: Option<Value>,
    /// Gateway host, forming a linear chain.
    pub jump_via: Option<Box<HostSpec>>,
    pub should_sudo: bool,
    pub sudo_options: SudoOptions,
    /// Host facts. Hand-set facts win over gathered ones.
    pub facts: ValueMap,
}

impl HostSpec {
    pub fn new(host: impl Into<String>) -> Self {
        HostSpec {
            host: host.into(),
            connection: None,
            jump_via: None,
            should_sudo: true,
            sudo_options: SudoOptions::default(),
            facts: ValueMap::new(),
        }
    }

    /// Attach the connection method. Reassignment is an error.
    pub fn set_connection(&mut self, method: ConnectionMethod) -> Result<(), InventoryError> {
        self.set_connection_raw(method.to_value())
    }

    fn set_connection_raw(&mut self, descriptor: Value) -> Result<(), InventoryError> {
        if self.connection.is_some() {
            return Err(InventoryError::MethodAlreadySet(self.host.clone()));
        }
        self.connection = Some(descriptor);
        Ok(())
    }

    pub fn connection_method(&self) -> Result<Option<ConnectionMethod>, MethodError> {
        self.connection
            .as_ref()
            .map(ConnectionMethod::load)
            .transpose()
    }

    /// Option inheritance from the enclosing group: a group-level
    /// `jump_via` applies only when the host does not define its own.
    pub fn inherits_options(&mut self, options: &Value) -> Result<(), InventoryError> {
        if self.jump_via.is_none() {
            if let Some(jump) = options.get("jump_via") {
                self.jump_via = Some(Box::new(HostSpec::from_value(jump)?));
            }
        }
        Ok(())
    }

    /// Merge a new set of gathered facts. Existing facts are written over
    /// the new set, so facts set by hand take precedence over gathered
    /// ones.
    pub fn update_facts(&mut self, gathered: ValueMap) {
        let mut merged = gathered;
        for (key, value) in std::mem::take(&mut self.facts) {
            merged.insert(key, value);
        }
        self.facts = merged;
    }

    /// Open the remote context for this host: the base transport (chasing
    /// the jump chain first), then the sudo wrapper on top when enabled.
    pub fn open_connection(&self, router: &Router) -> Result<Context, StreamError> {
        let via = match &self.jump_via {
            Some(jump) => Some(jump.open_connection(router)?),
            None => None,
        };

        let method = self
            .connection_method()
            .map_err(|err| StreamError::Protocol(err.to_string()))?
            .ok_or_else(|| {
                StreamError::Protocol(format!("host {} has no connection method", self.host))
            })?;

        let ctx = method.connect(router, via.as_ref())?;
        if self.should_sudo {
            return router.sudo(
                &ctx,
                self.sudo_options.username(),
                method.common().connect_timeout,
            );
        }

        Ok(ctx)
    }

    /// Structurally identical descriptor with every placeholder evaluated.
    pub fn resolve_tags(&self, resolver: &TagResolver) -> Result<HostSpec, TagError> {
        let resolved = tags::resolve(&self.to_value(), resolver)?;
        HostSpec::from_value(&resolved).map_err(|err| TagError::Malformed {
            tag: self.host.clone(),
            reason: format!("descriptor no longer parses after resolution: {err}"),
        })
    }
}

impl Display for HostSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.host)?;
        if let Some(via) = &self.jump_via {
            write!(f, " via {via}")?;
        }
        if self.should_sudo {
            write!(f, " as {}", self.sudo_options.username())?;
        }
        Ok(())
    }
}

impl ToValue for HostSpec {
    fn to_value(&self) -> Value {
        let mut out = Value::map();
        out.insert("host".into(), self.host.clone().into());
        if let Some(connection) = &self.connection {
            out.insert("connection_method".into(), connection.clone());
        }
        if let Some(jump) = &self.jump_via {
            out.insert("jump_via".into(), jump.to_value());
        }
        out.insert("should_sudo".into(), self.should_sudo.into());
        out.insert("sudo_options".into(), Value::Map(self.sudo_options.0.clone()));
        out.insert("facts".into(), Value::Map(self.facts.clone()));
        Value::Map(out)
    }
}

impl FromValue for HostSpec {
    fn from_value(value: &Value) -> Result<Self, ValueError> {
        let mut spec = HostSpec::new(value.get_req("host", "string", |v| {
            v.as_str().map(str::to_owned)
        })?);

        if let Some(connection) = value.get("connection_method") {
            // Validate the type tag eagerly so a bad method is a load-time
            // error, but keep the raw map until tags are resolved.
            ConnectionMethod::validate_type(connection)
                .map_err(|err| ValueError::UnsupportedYaml(err.to_string()))?;
            spec.connection = Some(connection.clone());
        }

        if let Some(jump) = value.get("jump_via") {
            spec.jump_via = Some(Box::new(HostSpec::from_value(jump)?));
        }

        spec.should_sudo = value
            .get_opt("should_sudo", "bool", Value::as_bool)?
            .unwrap_or(true);
        if let Some(sudo) = value.get_opt("sudo_options", "map", |v| v.as_map().cloned())? {
            spec.sudo_options = SudoOptions(sudo);
        }
        if let Some(facts) = value.get_opt("facts", "map", |v| v.as_map().cloned())? {
            spec.facts = facts;
        }

        Ok(spec)
    }
}

/// A collection of hosts, grouped by the inventory file they came from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inventory {
    groups: IndexMap<String, Vec<HostSpec>>,
    /// Where a selection was carved from. Observational only: never
    /// serialized, never traversed by the engine.
    parent: Option<Box<Inventory>>,
}

impl Inventory {
    /// Load every file under the given paths. Directories are scanned
    /// recursively; each file declares one group named after its stem.
    pub fn load(paths: &[PathBuf]) -> Result<Inventory, InventoryError> {
        let mut pending: Vec<PathBuf> = paths.to_vec();
        let mut loaded = Vec::new();

        while let Some(path) = pending.pop() {
            if path.is_dir() {
                let entries = std::fs::read_dir(&path)
                    .map_err(|source| InventoryError::Io { path: path.clone(), source })?;
                for entry in entries {
                    let entry =
                        entry.map_err(|source| InventoryError::Io { path: path.clone(), source })?;
                    pending.push(entry.path());
                }
            } else {
                loaded.push(Self::load_file(&path)?);
            }
        }

        Self::combine(loaded)
    }

    fn load_file(path: &Path) -> Result<(String, Value), InventoryError> {
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        let text = std::fs::read_to_string(path)
            .map_err(|source| InventoryError::Io { path: path.to_owned(), source })?;
        let node: serde_yaml::Value = serde_yaml::from_str(&text)
            .map_err(|source| InventoryError::Parse { path: path.to_owned(), source })?;
        Ok((name, Value::from_yaml(&node)?))
    }

    /// Merge per-group documents into one inventory, applying group option
    /// inheritance to every host.
    pub fn combine(documents: Vec<(String, Value)>) -> Result<Inventory, InventoryError> {
        let mut groups: IndexMap<String, Vec<HostSpec>> = IndexMap::new();

        for (group, document) in documents {
            let options = document.get("options").cloned().unwrap_or(Value::Null);
            let entry = groups.entry(group).or_default();

            if let Some(hosts) = document.get("hosts").and_then(Value::as_list) {
                for descriptor in hosts {
                    let mut host = HostSpec::from_value(descriptor)?;
                    host.inherits_options(&options)?;
                    entry.push(host);
                }
            }
        }

        Ok(Inventory { groups, parent: None })
    }

    pub fn from_groups(groups: IndexMap<String, Vec<HostSpec>>) -> Inventory {
        Inventory { groups, parent: None }
    }

    pub fn groups(&self) -> &IndexMap<String, Vec<HostSpec>> {
        &self.groups
    }

    /// All hosts, flattened in group insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &HostSpec> {
        self.groups.values().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut HostSpec> {
        self.groups.values_mut().flatten()
    }

    pub fn len(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subset of hosts whose name matches `criterion` exactly, preserving
    /// group structure. An empty criterion selects nothing.
    pub fn select(&self, criterion: &str) -> Inventory {
        let mut subset: IndexMap<String, Vec<HostSpec>> = IndexMap::new();
        for (group, hosts) in &self.groups {
            let selected = subset.entry(group.clone()).or_default();
            if !criterion.is_empty() {
                selected.extend(hosts.iter().filter(|h| h.host == criterion).cloned());
            }
        }

        Inventory {
            groups: subset,
            parent: Some(Box::new(self.clone())),
        }
    }

    /// Deep copy with every tagged placeholder evaluated.
    pub fn resolve_tags(&self, resolver: &TagResolver) -> Result<Inventory, TagError> {
        let mut groups = IndexMap::with_capacity(self.groups.len());
        for (name, hosts) in &self.groups {
            let hosts = hosts
                .iter()
                .map(|host| host.resolve_tags(resolver))
                .collect::<Result<Vec<_>, _>>()?;
            groups.insert(name.clone(), hosts);
        }
        Ok(Inventory { groups, parent: None })
    }
}

impl ToValue for Inventory {
    fn to_value(&self) -> Value {
        let mut groups = Value::map();
        for (name, hosts) in &self.groups {
            groups.insert(
                name.clone(),
                Value::List(hosts.iter().map(ToValue::to_value).collect()),
            );
        }
        let mut out = Value::map();
        out.insert("groups".into(), Value::Map(groups));
        Value::Map(out)
    }
}

impl FromValue for Inventory {
    fn from_value(value: &Value) -> Result<Self, ValueError> {
        let raw = value.get_req("groups", "map", |v| v.as_map().cloned())?;
        let mut groups = IndexMap::with_capacity(raw.len());
        for (name, hosts) in raw {
            let hosts = hosts
                .as_list()
                .ok_or(ValueError::WrongType { key: name.clone(), expected: "sequence" })?
                .iter()
                .map(HostSpec::from_value)
                .collect::<Result<Vec<_>, _>>()?;
            groups.insert(name, hosts);
        }
        Ok(Inventory { groups, parent: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(host: &str) -> Value {
        let mut options = Value::map();
        options.insert("hostname".into(), host.into());
        let mut method = Value::map();
        method.insert("type".into(), "ssh".into());
        method.insert("options".into(), Value::Map(options));
        let mut map = Value::map();
        map.insert("host".into(), host.into());
        map.insert("connection_method".into(), Value::Map(method));
        Value::Map(map)
    }

    fn group_doc(hosts: &[&str]) -> Value {
        let mut doc = Value::map();
        doc.insert(
            "hosts".into(),
            Value::List(hosts.iter().map(|h| descriptor(h)).collect()),
        );
        Value::Map(doc)
    }

    #[test]
    fn host_round_trip_with_jump_chain() {
        let mut host = HostSpec::from_value(&descriptor("web-n01.iad1.example.com")).unwrap();
        let mut bastion = HostSpec::from_value(&descriptor("bastion.iad1.example.com")).unwrap();
        bastion.should_sudo = false;
        host.jump_via = Some(Box::new(bastion));

        let rebuilt = HostSpec::from_value(&host.to_value()).unwrap();
        assert_eq!(rebuilt, host);
    }

    #[test]
    fn connection_method_set_exactly_once() {
        let mut host = HostSpec::new("h");
        let method = ConnectionMethod::from_value(&{
            let mut options = Value::map();
            options.insert("hostname".into(), "h".into());
            let mut map = Value::map();
            map.insert("type".into(), "ssh".into());
            map.insert("options".into(), Value::Map(options));
            Value::Map(map)
        })
        .unwrap();

        host.set_connection(method.clone()).unwrap();
        assert!(matches!(
            host.set_connection(method),
            Err(InventoryError::MethodAlreadySet(_))
        ));
    }

    #[test]
    fn update_facts_prefers_hand_set_values() {
        let mut host = HostSpec::new("h");
        host.facts.insert("region".into(), "iad".into());

        let mut gathered = Value::map();
        gathered.insert("region".into(), "lhr".into());
        gathered.insert("fqdn".into(), "h.example.com".into());
        host.update_facts(gathered);

        assert_eq!(host.facts.get("region"), Some(&Value::from("iad")));
        assert_eq!(host.facts.get("fqdn"), Some(&Value::from("h.example.com")));
    }

    #[test]
    fn group_options_inherit_shallowly() {
        let mut doc = group_doc(&["a", "b"]);
        if let Value::Map(map) = &mut doc {
            let mut options = Value::map();
            options.insert("jump_via".into(), descriptor("bastion"));
            map.insert("options".into(), Value::Map(options));
        }

        let inv = Inventory::combine(vec![("core".into(), doc)]).unwrap();
        for host in inv.iter() {
            assert_eq!(host.jump_via.as_ref().unwrap().host, "bastion");
        }
    }

    #[test]
    fn select_is_exact_and_subset() {
        let inv = Inventory::combine(vec![
            ("core".into(), group_doc(&["a", "b"])),
            ("edge".into(), group_doc(&["b", "c"])),
        ])
        .unwrap();

        let subset = inv.select("b");
        assert_eq!(subset.len(), 2);
        assert!(subset.iter().all(|h| h.host == "b"));
        // Group structure is preserved even for groups left empty.
        assert_eq!(subset.groups().len(), 2);

        assert_eq!(inv.select("").len(), 0);
        assert_eq!(inv.select("nope").len(), 0);
    }

    #[test]
    fn iteration_order_is_deterministic() {
        let inv = Inventory::combine(vec![
            ("core".into(), group_doc(&["a", "b"])),
            ("edge".into(), group_doc(&["c"])),
        ])
        .unwrap();
        let names: Vec<&str> = inv.iter().map(|h| h.host.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[test]
    fn inventory_round_trip_omits_parent() {
        let inv = Inventory::combine(vec![("core".into(), group_doc(&["a"]))]).unwrap();
        let subset = inv.select("a");
        let rebuilt = Inventory::from_value(&subset.to_value()).unwrap();
        assert_eq!(rebuilt.len(), 1);
        assert!(rebuilt.parent.is_none());
    }

    #[test]
    fn unknown_connection_type_is_load_error() {
        let mut method = Value::map();
        method.insert("type".into(), "unknown".into());
        let mut map = Value::map();
        map.insert("host".into(), "h".into());
        map.insert("connection_method".into(), Value::Map(method));

        assert!(HostSpec::from_value(&Value::Map(map)).is_err());
    }

    #[test]
    fn printable_identity_includes_via_and_sudo_target() {
        let mut host = HostSpec::new("web-n01");
        host.jump_via = Some(Box::new({
            let mut b = HostSpec::new("bastion");
            b.should_sudo = false;
            b
        }));
        assert_eq!(host.to_string(), "web-n01 via bastion as root");
    }
}
