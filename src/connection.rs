//! Connection methods: the tagged set of transport descriptors a host can
//! carry. Each variant knows how to open a remote execution context from
//! the transport router; sudo wrapping is applied on top by the host
//! descriptor itself, never here.

use std::fmt::{self, Debug, Formatter};
use std::time::Duration;

use crate::errors::{NameNotFound, StreamError};
use crate::transport::{Context, Router};
use crate::value::{FromValue, ToValue, Value, ValueError, ValueMap};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum MethodError {
    #[error(transparent)]
    UnknownType(#[from] NameNotFound),

    #[error(transparent)]
    Options(#[from] ValueError),
}

/// Options shared by every transport.
#[derive(Debug, Clone, PartialEq)]
pub struct CommonOptions {
    /// Display name to use for the remote context.
    pub remote_name: Option<String>,
    /// Path of a pre-installed agent on the remote. When unset the agent
    /// binary is shipped over the stream and cached by digest.
    pub agent_path: Option<String>,
    pub debug: bool,
    pub unidirectional: bool,
    pub connect_timeout: Duration,
}

impl Default for CommonOptions {
    fn default() -> Self {
        CommonOptions {
            remote_name: None,
            agent_path: None,
            debug: false,
            unidirectional: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostKeyPolicy {
    #[default]
    Enforce,
    AcceptNew,
    Ignore,
}

impl HostKeyPolicy {
    fn parse(s: &str) -> Option<HostKeyPolicy> {
        match s {
            "enforce" => Some(HostKeyPolicy::Enforce),
            "accept-new" => Some(HostKeyPolicy::AcceptNew),
            "ignore" => Some(HostKeyPolicy::Ignore),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            HostKeyPolicy::Enforce => "enforce",
            HostKeyPolicy::AcceptNew => "accept-new",
            HostKeyPolicy::Ignore => "ignore",
        }
    }
}

#[derive(Clone, PartialEq)]
pub struct SshOptions {
    pub common: CommonOptions,
    pub hostname: String,
    pub username: Option<String>,
    pub ssh_path: String,
    pub ssh_args: Vec<String>,
    pub port: Option<u16>,
    pub check_host_keys: HostKeyPolicy,
    pub password: Option<String>,
    pub identity_file: Option<String>,
    pub identities_only: bool,
    pub compression: bool,
    pub ssh_debug_level: u8,
}

impl Debug for SshOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Ssh");
        d.field("hostname", &self.hostname);
        if let Some(username) = &self.username {
            d.field("username", username);
        }
        if let Some(port) = self.port {
            d.field("port", &port);
        }
        if self.password.is_some() {
            d.field("password", &"REDACTED");
        }
        if let Some(identity_file) = &self.identity_file {
            d.field("identity_file", identity_file);
        }
        d.finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DockerOptions {
    pub common: CommonOptions,
    pub container: Option<String>,
    pub username: Option<String>,
    pub image: Option<String>,
    /// Binary name or path, resolved against PATH at connect time.
    pub binary: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalOptions {
    pub common: CommonOptions,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionMethod {
    Ssh(SshOptions),
    Docker(DockerOptions),
    /// Docker with the `podman` binary substituted.
    Podman(DockerOptions),
    Local(LocalOptions),
}

impl ConnectionMethod {
    /// Stable tag used in serialized descriptors.
    pub fn type_tag(&self) -> &'static str {
        match self {
            ConnectionMethod::Ssh(_) => "ssh",
            ConnectionMethod::Docker(_) => "docker",
            ConnectionMethod::Podman(_) => "podman",
            ConnectionMethod::Local(_) => "local",
        }
    }

    pub fn common(&self) -> &CommonOptions {
        match self {
            ConnectionMethod::Ssh(opts) => &opts.common,
            ConnectionMethod::Docker(opts) | ConnectionMethod::Podman(opts) => &opts.common,
            ConnectionMethod::Local(opts) => &opts.common,
        }
    }

    /// Check only the `type` discriminator of a descriptor map, leaving the
    /// option bag untouched (it may still hold unresolved tags).
    pub fn validate_type(value: &Value) -> Result<(), NameNotFound> {
        let tag = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("ssh")
            .to_lowercase();
        match tag.as_str() {
            "ssh" | "docker" | "podman" | "local" => Ok(()),
            other => Err(NameNotFound(format!("connection method `{other}`"))),
        }
    }

    /// Construct from a descriptor map: pops `type` (default `ssh`) and
    /// routes to the matching variant. Unknown types are a hard error;
    /// leftover option keys only warn.
    pub fn load(value: &Value) -> Result<ConnectionMethod, MethodError> {
        let type_tag = value
            .get_opt("type", "string", |v| v.as_str().map(str::to_owned))?
            .unwrap_or_else(|| "ssh".to_owned())
            .to_lowercase();

        let options = value
            .get("options")
            .and_then(Value::as_map)
            .cloned()
            .unwrap_or_default();
        let mut bag = Bag(options);

        let method = match type_tag.as_str() {
            "ssh" => ConnectionMethod::Ssh(SshOptions::from_bag(&mut bag)?),
            "docker" => {
                ConnectionMethod::Docker(DockerOptions::from_bag(&mut bag, "docker_path", "docker")?)
            }
            "podman" => {
                ConnectionMethod::Podman(DockerOptions::from_bag(&mut bag, "podman_path", "podman")?)
            }
            "local" => ConnectionMethod::Local(LocalOptions {
                common: CommonOptions::from_bag(&mut bag)?,
            }),
            other => return Err(NameNotFound(format!("connection method `{other}`")).into()),
        };

        bag.warn_leftovers(&type_tag);
        Ok(method)
    }

    /// Open the base remote context. `via` is the already-open context of
    /// the jump host, when the descriptor sits behind one.
    pub fn connect(&self, router: &Router, via: Option<&Context>) -> Result<Context, StreamError> {
        match self {
            ConnectionMethod::Ssh(opts) => router.ssh(opts, via),
            ConnectionMethod::Docker(opts) | ConnectionMethod::Podman(opts) => {
                router.docker(opts, via)
            }
            ConnectionMethod::Local(opts) => router.local(
                opts.common.agent_path.as_deref(),
                opts.common.connect_timeout,
                via,
            ),
        }
    }
}

impl ToValue for ConnectionMethod {
    fn to_value(&self) -> Value {
        let mut options = Value::map();
        let common = self.common();
        push_opt(&mut options, "remote_name", common.remote_name.clone());
        push_opt(&mut options, "agent_path", common.agent_path.clone());
        options.insert("debug".into(), common.debug.into());
        options.insert("unidirectional".into(), common.unidirectional.into());
        options.insert(
            "connect_timeout".into(),
            Value::Int(common.connect_timeout.as_secs() as i64),
        );

        match self {
            ConnectionMethod::Ssh(opts) => {
                options.insert("hostname".into(), opts.hostname.clone().into());
                push_opt(&mut options, "username", opts.username.clone());
                options.insert("ssh_path".into(), opts.ssh_path.clone().into());
                options.insert(
                    "ssh_args".into(),
                    Value::List(opts.ssh_args.iter().map(|a| Value::from(a.clone())).collect()),
                );
                push_opt(&mut options, "port", opts.port.map(|p| p as i64));
                options.insert(
                    "check_host_keys".into(),
                    opts.check_host_keys.as_str().into(),
                );
                push_opt(&mut options, "password", opts.password.clone());
                push_opt(&mut options, "identity_file", opts.identity_file.clone());
                options.insert("identities_only".into(), opts.identities_only.into());
                options.insert("compression".into(), opts.compression.into());
                options.insert(
                    "ssh_debug_level".into(),
                    Value::Int(opts.ssh_debug_level as i64),
                );
            }
            ConnectionMethod::Docker(opts) | ConnectionMethod::Podman(opts) => {
                push_opt(&mut options, "container", opts.container.clone());
                push_opt(&mut options, "username", opts.username.clone());
                push_opt(&mut options, "image", opts.image.clone());
                let key = match self {
                    ConnectionMethod::Podman(_) => "podman_path",
                    _ => "docker_path",
                };
                options.insert(key.into(), opts.binary.clone().into());
            }
            ConnectionMethod::Local(_) => {}
        }

        let mut out = Value::map();
        out.insert("type".into(), self.type_tag().into());
        out.insert("options".into(), Value::Map(options));
        Value::Map(out)
    }
}

impl FromValue for ConnectionMethod {
    fn from_value(value: &Value) -> Result<Self, ValueError> {
        ConnectionMethod::load(value).map_err(|err| match err {
            MethodError::Options(inner) => inner,
            MethodError::UnknownType(inner) => ValueError::UnsupportedYaml(inner.to_string()),
        })
    }
}

impl CommonOptions {
    fn from_bag(bag: &mut Bag) -> Result<Self, ValueError> {
        Ok(CommonOptions {
            remote_name: bag.take_str("remote_name")?,
            agent_path: bag.take_str("agent_path")?,
            debug: bag.take_bool("debug")?.unwrap_or(false),
            unidirectional: bag.take_bool("unidirectional")?.unwrap_or(false),
            connect_timeout: bag
                .take_int("connect_timeout")?
                .map(|secs| Duration::from_secs(secs as u64))
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT),
        })
    }
}

impl SshOptions {
    fn from_bag(bag: &mut Bag) -> Result<Self, ValueError> {
        Ok(SshOptions {
            common: CommonOptions::from_bag(bag)?,
            hostname: bag
                .take_str("hostname")?
                .ok_or(ValueError::Missing("hostname".into()))?,
            username: bag.take_str("username")?,
            ssh_path: bag.take_str("ssh_path")?.unwrap_or_else(|| "ssh".into()),
            ssh_args: bag.take_str_list("ssh_args")?.unwrap_or_default(),
            port: bag.take_int("port")?.map(|p| p as u16),
            check_host_keys: match bag.take_str("check_host_keys")? {
                Some(raw) => HostKeyPolicy::parse(&raw).ok_or(ValueError::WrongType {
                    key: "check_host_keys".into(),
                    expected: "enforce|accept-new|ignore",
                })?,
                None => HostKeyPolicy::Enforce,
            },
            password: bag.take_str("password")?,
            identity_file: bag.take_str("identity_file")?,
            identities_only: bag.take_bool("identities_only")?.unwrap_or(false),
            compression: bag.take_bool("compression")?.unwrap_or(true),
            ssh_debug_level: bag.take_int("ssh_debug_level")?.unwrap_or(0) as u8,
        })
    }
}

impl DockerOptions {
    fn from_bag(bag: &mut Bag, binary_key: &str, default_binary: &str) -> Result<Self, ValueError> {
        Ok(DockerOptions {
            common: CommonOptions::from_bag(bag)?,
            container: bag.take_str("container")?,
            username: bag.take_str("username")?,
            image: bag.take_str("image")?,
            binary: bag
                .take_str(binary_key)?
                .unwrap_or_else(|| default_binary.to_owned()),
        })
    }
}

fn push_opt(map: &mut ValueMap, key: &str, value: impl Into<Value>) {
    let value = value.into();
    if !value.is_null() {
        map.insert(key.to_owned(), value);
    }
}

/// Option map consumed key by key, so anything left over can be reported.
struct Bag(ValueMap);

impl Bag {
    fn take_str(&mut self, key: &str) -> Result<Option<String>, ValueError> {
        self.take(key, "string", |v| v.as_str().map(str::to_owned))
    }

    fn take_bool(&mut self, key: &str) -> Result<Option<bool>, ValueError> {
        self.take(key, "bool", Value::as_bool)
    }

    fn take_int(&mut self, key: &str) -> Result<Option<i64>, ValueError> {
        self.take(key, "integer", Value::as_i64)
    }

    fn take_str_list(&mut self, key: &str) -> Result<Option<Vec<String>>, ValueError> {
        self.take(key, "sequence of strings", |v| {
            v.as_list()?
                .iter()
                .map(|item| item.as_str().map(str::to_owned))
                .collect::<Option<Vec<_>>>()
        })
    }

    fn take<T>(
        &mut self,
        key: &str,
        expected: &'static str,
        convert: impl FnOnce(&Value) -> Option<T>,
    ) -> Result<Option<T>, ValueError> {
        match self.0.shift_remove(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => convert(&value)
                .map(Some)
                .ok_or(ValueError::WrongType { key: key.to_owned(), expected }),
        }
    }

    fn warn_leftovers(&self, type_tag: &str) {
        if !self.0.is_empty() {
            let keys: Vec<&str> = self.0.keys().map(String::as_str).collect();
            warn!(
                "options left over after constructing {type_tag} connection method: {keys:?}"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ssh_descriptor() -> Value {
        let mut options = Value::map();
        options.insert("hostname".into(), "web-n01.iad1.example.com".into());
        options.insert("port".into(), Value::Int(2222));
        options.insert("username".into(), "deploy".into());
        options.insert("check_host_keys".into(), "accept-new".into());

        let mut map = Value::map();
        map.insert("type".into(), "ssh".into());
        map.insert("options".into(), Value::Map(options));
        Value::Map(map)
    }

    #[test]
    fn load_defaults_to_ssh() {
        let mut options = Value::map();
        options.insert("hostname".into(), "h".into());
        let mut map = Value::map();
        map.insert("options".into(), Value::Map(options));

        let method = ConnectionMethod::load(&Value::Map(map)).unwrap();
        assert_eq!(method.type_tag(), "ssh");
        assert_eq!(method.common().connect_timeout, DEFAULT_CONNECT_TIMEOUT);
    }

    #[test]
    fn load_rejects_unknown_type() {
        let mut map = Value::map();
        map.insert("type".into(), "unknown".into());
        let err = ConnectionMethod::load(&Value::Map(map)).unwrap_err();
        assert!(matches!(err, MethodError::UnknownType(_)));
    }

    #[test]
    fn podman_is_docker_with_another_binary() {
        let mut map = Value::map();
        map.insert("type".into(), "podman".into());
        let method = ConnectionMethod::load(&Value::Map(map)).unwrap();
        match &method {
            ConnectionMethod::Podman(opts) => assert_eq!(opts.binary, "podman"),
            other => panic!("unexpected method {other:?}"),
        }
    }

    #[test]
    fn option_bag_round_trip() {
        let method = ConnectionMethod::load(&ssh_descriptor()).unwrap();
        let rebuilt = ConnectionMethod::from_value(&method.to_value()).unwrap();
        assert_eq!(rebuilt, method);
    }

    #[test]
    fn debug_redacts_password() {
        let mut descriptor = ssh_descriptor();
        if let Value::Map(map) = &mut descriptor {
            if let Some(Value::Map(options)) = map.get_mut("options") {
                options.insert("password".into(), "hunter2".into());
            }
        }
        let method = ConnectionMethod::load(&descriptor).unwrap();
        let rendered = format!("{method:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("REDACTED"));
    }
}
