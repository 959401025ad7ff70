//! The resource registry: the dotted-name → operation table used on the
//! remote side, plus the typed call context every resource receives.
//!
//! Namespaces and their operations are fixed at compile time; `lookup` is a
//! two-level table walk and unregistered names are a hard error.

pub mod facts;
pub mod file;
pub mod test;

use crate::errors::{ExceptionInfo, NameNotFound};
use crate::inventory::{HostSpec, Inventory};
use crate::result::{ExecutionResult, ResultChain, ResultRecord};
use crate::transport::ContextId;
use crate::value::{Value, ValueMap};

/// Everything a resource may know about the call it is servicing. Built for
/// the scope of one `call_with_context` invocation and read-only to
/// resources.
pub struct CallContext {
    inventory: Inventory,
    host: HostSpec,
    self_addr: ContextId,
    parent_addr: ContextId,
}

impl CallContext {
    pub fn new(
        inventory: Inventory,
        host: HostSpec,
        self_addr: ContextId,
        parent_addr: ContextId,
    ) -> Self {
        CallContext { inventory, host, self_addr, parent_addr }
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    pub fn host(&self) -> &HostSpec {
        &self.host
    }

    pub fn self_address(&self) -> ContextId {
        self.self_addr
    }

    pub fn parent_address(&self) -> ContextId {
        self.parent_addr
    }

    /// Success envelope for the host this call runs against.
    pub fn ok(&self, fields: ValueMap) -> ExecutionResult {
        ExecutionResult::ok(self.host.clone(), fields)
    }

    pub fn fail(&self, exception: ExceptionInfo) -> ExecutionResult {
        ExecutionResult::fail(self.host.clone(), exception)
    }

    pub fn chain(&self) -> ResultChain {
        ResultChain::new(self.host.clone())
    }
}

pub type ResourceFn = fn(&CallContext, &Params) -> Result<ResultRecord, ExceptionInfo>;

pub struct Operation {
    pub name: &'static str,
    pub schema: ParamSchema,
    pub run: ResourceFn,
}

pub struct Namespace {
    pub name: &'static str,
    pub ops: &'static [Operation],
}

static NAMESPACES: &[Namespace] = &[facts::NAMESPACE, file::NAMESPACE, test::NAMESPACE];

/// Resolve `"ns.fn"`: the namespace before the first dot, the operation
/// after it. Pure table lookup, no side effects.
pub fn lookup(target: &str) -> Result<&'static Operation, NameNotFound> {
    let (namespace, op) = target
        .split_once('.')
        .ok_or_else(|| NameNotFound(format!("resource `{target}`")))?;

    NAMESPACES
        .iter()
        .find(|ns| ns.name == namespace)
        .and_then(|ns| ns.ops.iter().find(|o| o.name == op))
        .ok_or_else(|| NameNotFound(format!("resource `{target}`")))
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ParamError {
    #[error("{op} does not accept parameter `{key}`")]
    Unknown { op: String, key: String },

    #[error("{op} requires parameter `{key}`")]
    Required { op: String, key: String },

    #[error("parameter `{key}` of {op} is not a {expected}")]
    WrongType {
        op: String,
        key: String,
        expected: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamKind {
    Str,
    Int,
    Bool,
    Map,
}

#[derive(Debug, Clone, Copy)]
pub enum ParamDefault {
    None,
    Str(&'static str),
    Int(i64),
    Bool(bool),
}

pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub required: bool,
    pub default: ParamDefault,
}

impl ParamSpec {
    pub const fn required(name: &'static str, kind: ParamKind) -> Self {
        ParamSpec { name, kind, required: true, default: ParamDefault::None }
    }

    pub const fn optional(name: &'static str, kind: ParamKind) -> Self {
        ParamSpec { name, kind, required: false, default: ParamDefault::None }
    }

    pub const fn with_default(name: &'static str, kind: ParamKind, default: ParamDefault) -> Self {
        ParamSpec { name, kind, required: false, default }
    }
}

/// Declared parameter surface of one operation. Unknown keys are a hard
/// error unless the schema opts in to passthrough.
pub struct ParamSchema {
    pub params: &'static [ParamSpec],
    pub passthrough: bool,
}

pub const NO_PARAMS: ParamSchema = ParamSchema { params: &[], passthrough: false };

impl ParamSchema {
    /// Check `given` against the schema: reject unknown keys, demand
    /// required ones, coerce types and fill defaults.
    pub fn validate(&self, op: &str, given: &ValueMap) -> Result<Params, ParamError> {
        let mut out = Value::map();

        if !self.passthrough {
            for key in given.keys() {
                if !self.params.iter().any(|p| p.name == key) {
                    return Err(ParamError::Unknown {
                        op: op.to_owned(),
                        key: key.clone(),
                    });
                }
            }
        }

        for spec in self.params {
            match given.get(spec.name) {
                Some(value) => {
                    let coerced = coerce(value, spec.kind).ok_or(ParamError::WrongType {
                        op: op.to_owned(),
                        key: spec.name.to_owned(),
                        expected: match spec.kind {
                            ParamKind::Str => "string",
                            ParamKind::Int => "integer",
                            ParamKind::Bool => "bool",
                            ParamKind::Map => "map",
                        },
                    })?;
                    out.insert(spec.name.to_owned(), coerced);
                }
                None if spec.required => {
                    return Err(ParamError::Required {
                        op: op.to_owned(),
                        key: spec.name.to_owned(),
                    });
                }
                None => match spec.default {
                    ParamDefault::None => {}
                    ParamDefault::Str(s) => {
                        out.insert(spec.name.to_owned(), Value::from(s));
                    }
                    ParamDefault::Int(i) => {
                        out.insert(spec.name.to_owned(), Value::Int(i));
                    }
                    ParamDefault::Bool(b) => {
                        out.insert(spec.name.to_owned(), Value::Bool(b));
                    }
                },
            }
        }

        if self.passthrough {
            for (key, value) in given {
                out.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }

        Ok(Params(out))
    }
}

/// Parameters arrive as strings from the key=value surface; coerce them
/// into the declared kinds. Integers accept `0o`/`0x` prefixes so file
/// modes read naturally.
fn coerce(value: &Value, kind: ParamKind) -> Option<Value> {
    match (kind, value) {
        (ParamKind::Str, Value::Str(_)) => Some(value.clone()),
        (ParamKind::Int, Value::Int(_)) => Some(value.clone()),
        (ParamKind::Int, Value::Str(s)) => parse_int(s).map(Value::Int),
        (ParamKind::Bool, Value::Bool(_)) => Some(value.clone()),
        (ParamKind::Bool, Value::Str(s)) => match s.as_str() {
            "true" | "yes" | "1" => Some(Value::Bool(true)),
            "false" | "no" | "0" => Some(Value::Bool(false)),
            _ => None,
        },
        (ParamKind::Map, Value::Map(_)) => Some(value.clone()),
        _ => None,
    }
}

fn parse_int(s: &str) -> Option<i64> {
    if let Some(octal) = s.strip_prefix("0o") {
        i64::from_str_radix(octal, 8).ok()
    } else if let Some(hex) = s.strip_prefix("0x") {
        i64::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

/// Validated parameter bag handed to a resource.
#[derive(Debug, Clone, Default)]
pub struct Params(ValueMap);

impl Params {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn req_str(&self, key: &str) -> Result<&str, ExceptionInfo> {
        self.0
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| ExceptionInfo::new("ParamError", format!("missing parameter `{key}`")))
    }

    pub fn opt_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn opt_i64(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(Value::as_i64)
    }

    pub fn opt_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_finds_registered_operations() {
        assert!(lookup("test.ping").is_ok());
        assert!(lookup("facts.gather").is_ok());
        assert!(lookup("file.put").is_ok());
    }

    #[test]
    fn lookup_rejects_unknown_names() {
        assert!(lookup("nope.nothing").is_err());
        assert!(lookup("test.nothing").is_err());
        assert!(lookup("bare").is_err());
    }

    #[test]
    fn unknown_parameter_is_a_hard_error() {
        const SCHEMA: ParamSchema = ParamSchema {
            params: &[ParamSpec::optional("message", ParamKind::Str)],
            passthrough: false,
        };
        let schema = SCHEMA;
        let mut given = Value::map();
        given.insert("bogus".into(), Value::from("x"));
        assert!(matches!(
            schema.validate("test.ping", &given),
            Err(ParamError::Unknown { .. })
        ));
    }

    #[test]
    fn defaults_and_coercions_apply() {
        const SCHEMA: ParamSchema = ParamSchema {
            params: &[
                ParamSpec::required("path", ParamKind::Str),
                ParamSpec::with_default("mode", ParamKind::Int, ParamDefault::Int(0o600)),
                ParamSpec::with_default("overwrite", ParamKind::Bool, ParamDefault::Bool(false)),
            ],
            passthrough: false,
        };
        let schema = SCHEMA;

        let mut given = Value::map();
        given.insert("path".into(), Value::from("/tmp/x"));
        given.insert("mode".into(), Value::from("0o640"));
        let params = schema.validate("file.put", &given).unwrap();

        assert_eq!(params.opt_i64("mode"), Some(0o640));
        assert_eq!(params.opt_bool("overwrite"), Some(false));
        assert_eq!(params.req_str("path").unwrap(), "/tmp/x");
    }

    #[test]
    fn missing_required_parameter_is_reported() {
        const SCHEMA: ParamSchema = ParamSchema {
            params: &[ParamSpec::required("path", ParamKind::Str)],
            passthrough: false,
        };
        let schema = SCHEMA;
        assert!(matches!(
            schema.validate("file.stat", &Value::map()),
            Err(ParamError::Required { .. })
        ));
    }
}
