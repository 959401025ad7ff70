//! The result envelope: the one value type every execution returns and the
//! only shape that crosses the host/remote boundary in both directions.
//!
//! A leaf envelope is exactly one of success or failure; a chain aggregates
//! an ordered sequence of envelopes produced by a composite resource under
//! the same host. Deserialization dispatches on the presence of a `results`
//! key.

use crate::errors::ExceptionInfo;
use crate::inventory::HostSpec;
use crate::value::{FromValue, ToValue, Value, ValueError, ValueMap};

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(ValueMap),
    Failure {
        exception: ExceptionInfo,
        extra: ValueMap,
    },
}

/// Result of executing a resource against one host.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub host: HostSpec,
    outcome: Outcome,
}

impl ExecutionResult {
    pub fn ok(host: HostSpec, fields: ValueMap) -> Self {
        ExecutionResult { host, outcome: Outcome::Success(fields) }
    }

    pub fn fail(host: HostSpec, exception: ExceptionInfo) -> Self {
        Self::fail_with(host, exception, ValueMap::new())
    }

    pub fn fail_with(host: HostSpec, exception: ExceptionInfo, extra: ValueMap) -> Self {
        ExecutionResult { host, outcome: Outcome::Failure { exception, extra } }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success(_))
    }

    pub fn exception(&self) -> Option<&ExceptionInfo> {
        match &self.outcome {
            Outcome::Failure { exception, .. } => Some(exception),
            Outcome::Success(_) => None,
        }
    }

    /// The success or failure map, whichever is present.
    pub fn outcome(&self) -> ValueMap {
        match &self.outcome {
            Outcome::Success(fields) => fields.clone(),
            Outcome::Failure { exception, extra } => {
                let mut exc = Value::map();
                exc.insert("name".into(), Value::from(exception.name.clone()));
                exc.insert("repr".into(), Value::from(exception.repr.clone()));
                exc.insert("args".into(), Value::List(exception.args.clone()));

                let mut out = Value::map();
                out.insert("exception".into(), Value::Map(exc));
                out.extend(extra.clone());
                out
            }
        }
    }
}

impl ToValue for ExecutionResult {
    fn to_value(&self) -> Value {
        let mut out = Value::map();
        out.insert("host".into(), self.host.to_value());
        let key = if self.is_success() { "success" } else { "failure" };
        out.insert(key.into(), Value::Map(self.outcome()));
        Value::Map(out)
    }
}

impl FromValue for ExecutionResult {
    fn from_value(value: &Value) -> Result<Self, ValueError> {
        let host = HostSpec::from_value(
            value.get("host").ok_or(ValueError::Missing("host".into()))?,
        )?;

        let success = value.get("success").and_then(Value::as_map);
        let failure = value.get("failure").and_then(Value::as_map);
        match (success, failure) {
            (Some(fields), None) => Ok(ExecutionResult::ok(host, fields.clone())),
            (None, Some(fields)) => {
                let exception = fields
                    .get("exception")
                    .ok_or(ValueError::Missing("failure.exception".into()))?;
                let exception = ExceptionInfo {
                    name: exception.get_req("name", "string", |v| {
                        v.as_str().map(str::to_owned)
                    })?,
                    repr: exception.get_req("repr", "string", |v| {
                        v.as_str().map(str::to_owned)
                    })?,
                    args: exception
                        .get("args")
                        .and_then(Value::as_list)
                        .map(<[Value]>::to_vec)
                        .unwrap_or_default(),
                };
                let mut extra = fields.clone();
                extra.shift_remove("exception");
                Ok(ExecutionResult::fail_with(host, exception, extra))
            }
            // Either `success` or `failure` is required, never both.
            (Some(_), Some(_)) | (None, None) => Err(ValueError::WrongType {
                key: "success|failure".into(),
                expected: "exactly one of the two",
            }),
        }
    }
}

/// An ordered sequence of envelopes produced under a single host, used when
/// a resource is a composition of sub-resources.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultChain {
    pub host: HostSpec,
    pub results: Vec<ResultRecord>,
}

impl ResultChain {
    pub fn new(host: HostSpec) -> Self {
        ResultChain { host, results: Vec::new() }
    }

    pub fn chain(&mut self, result: ExecutionResult) {
        self.results.push(ResultRecord::Single(result));
    }
}

impl ToValue for ResultChain {
    fn to_value(&self) -> Value {
        let mut out = Value::map();
        out.insert("host".into(), self.host.to_value());
        out.insert(
            "results".into(),
            Value::List(self.results.iter().map(ToValue::to_value).collect()),
        );
        Value::Map(out)
    }
}

/// Leaf-or-chain envelope as it appears on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultRecord {
    Single(ExecutionResult),
    Chain(ResultChain),
}

impl ResultRecord {
    pub fn host(&self) -> &HostSpec {
        match self {
            ResultRecord::Single(result) => &result.host,
            ResultRecord::Chain(chain) => &chain.host,
        }
    }

    /// Flattened outcome maps. Non-empty for every well-formed record.
    pub fn as_list(&self) -> Vec<ValueMap> {
        match self {
            ResultRecord::Single(result) => vec![result.outcome()],
            ResultRecord::Chain(chain) => {
                chain.results.iter().flat_map(ResultRecord::as_list).collect()
            }
        }
    }

    pub fn is_success(&self) -> bool {
        match self {
            ResultRecord::Single(result) => result.is_success(),
            ResultRecord::Chain(chain) => chain.results.iter().all(ResultRecord::is_success),
        }
    }
}

impl ToValue for ResultRecord {
    fn to_value(&self) -> Value {
        match self {
            ResultRecord::Single(result) => result.to_value(),
            ResultRecord::Chain(chain) => chain.to_value(),
        }
    }
}

impl FromValue for ResultRecord {
    fn from_value(value: &Value) -> Result<Self, ValueError> {
        match value.get("results") {
            Some(results) => {
                let host = HostSpec::from_value(
                    value.get("host").ok_or(ValueError::Missing("host".into()))?,
                )?;
                let items = results.as_list().ok_or(ValueError::WrongType {
                    key: "results".into(),
                    expected: "sequence",
                })?;
                Ok(ResultRecord::Chain(ResultChain {
                    host,
                    results: items
                        .iter()
                        .map(ResultRecord::from_value)
                        .collect::<Result<_, _>>()?,
                }))
            }
            None => Ok(ResultRecord::Single(ExecutionResult::from_value(value)?)),
        }
    }
}
