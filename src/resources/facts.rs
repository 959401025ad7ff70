//! Fact-gathering resources.

use crate::errors::ExceptionInfo;
use crate::result::ResultRecord;
use crate::value::Value;

use super::{CallContext, Namespace, Operation, Params, NO_PARAMS};

pub const NAMESPACE: Namespace = Namespace {
    name: "facts",
    ops: &[
        Operation { name: "gather", schema: NO_PARAMS, run: gather },
        Operation { name: "show", schema: NO_PARAMS, run: show },
    ],
};

/// Gathers facts from the current host.
fn gather(ctx: &CallContext, _params: &Params) -> Result<ResultRecord, ExceptionInfo> {
    let report = crate::facts::gather(ctx);
    let mut fields = Value::map();
    fields.insert("facts".into(), Value::Map(report.facts));
    fields.insert("took_ms".into(), Value::Int(report.took_ms as i64));
    Ok(ResultRecord::Single(ctx.ok(fields)))
}

/// Display the facts already stored for the current host.
fn show(ctx: &CallContext, _params: &Params) -> Result<ResultRecord, ExceptionInfo> {
    let mut fields = Value::map();
    fields.insert("facts".into(), Value::Map(ctx.host().facts.clone()));
    Ok(ResultRecord::Single(ctx.ok(fields)))
}
