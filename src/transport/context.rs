//! A handle to an addressable execution endpoint.

use std::fmt::{self, Display, Formatter};

use crate::errors::CallError;
use crate::remoteenv::Settings;
use crate::value::Value;

use super::frame::{CallRequest, ContextId, Message};
use super::router::Router;

/// An open remote (or local) execution endpoint. Cheap to clone; calls are
/// blocking RPCs serialized through the broker.
#[derive(Clone)]
pub struct Context {
    id: ContextId,
    name: String,
    router: Router,
}

impl Context {
    pub(crate) fn new(id: ContextId, name: String, router: Router) -> Self {
        Context { id, name, router }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke a resource on the remote through its `call_with_context`
    /// entry point. Blocks until the call returns, errors, or the stream
    /// dies.
    pub fn call(&self, request: CallRequest) -> Result<Value, CallError> {
        self.router
            .call(self.id, |call_id| Message::Call { call_id, request })
    }

    /// Provision the isolated environment on the remote; returns the
    /// interpreter path to layer the upgraded context on.
    pub fn bootstrap(&self, settings: Settings) -> Result<String, CallError> {
        let value = self
            .router
            .call(self.id, |call_id| Message::Bootstrap { call_id, settings })?;
        value
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| {
                CallError::Stream(crate::errors::StreamError::Protocol(format!(
                    "bootstrap returned a non-path value: {value}"
                )))
            })
    }
}

impl Display for Context {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "context#{}({})", self.id, self.name)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}
