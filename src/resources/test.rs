//! Diagnostic resources.

use crate::errors::ExceptionInfo;
use crate::result::ResultRecord;
use crate::value::Value;

use super::{
    CallContext, Namespace, Operation, ParamDefault, ParamKind, ParamSchema, ParamSpec, Params,
};

pub const NAMESPACE: Namespace = Namespace {
    name: "test",
    ops: &[Operation {
        name: "ping",
        schema: ParamSchema {
            params: &[ParamSpec::with_default(
                "message",
                ParamKind::Str,
                ParamDefault::Str("pong"),
            )],
            passthrough: false,
        },
        run: ping,
    }],
};

/// Dumb ping on a host.
fn ping(ctx: &CallContext, params: &Params) -> Result<ResultRecord, ExceptionInfo> {
    let mut fields = Value::map();
    fields.insert(
        "message".into(),
        params.opt_str("message").unwrap_or("pong").into(),
    );
    Ok(ResultRecord::Single(ctx.ok(fields)))
}
