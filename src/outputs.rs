//! Output formatters: pure functions from a list of result records to a
//! string. The output is always a mapping from host name to outcome(s), so
//! a failed host shows up with its failure record instead of going
//! missing.

use comfy_table::{presets, Table};
use serde_json::json;

use crate::errors::NameNotFound;
use crate::result::ResultRecord;
use crate::value::Value;

pub type Formatter = fn(&[ResultRecord]) -> String;

/// Resolve a formatter by name. Unknown names are a hard error.
pub fn pick_formatter(name: &str) -> Result<Formatter, NameNotFound> {
    match name.to_lowercase().as_str() {
        "table" => Ok(as_table),
        "json" => Ok(as_json),
        "pretty-json" => Ok(as_pretty_json),
        "pprint" => Ok(as_pprint),
        other => Err(NameNotFound(format!("formatter `{other}`"))),
    }
}

fn outcome_json(record: &ResultRecord) -> serde_json::Value {
    let mut outcomes: Vec<serde_json::Value> = record
        .as_list()
        .into_iter()
        .map(|outcome| Value::Map(outcome).to_json())
        .collect();

    if outcomes.len() == 1 {
        outcomes.remove(0)
    } else {
        json!(outcomes)
    }
}

fn host_map(results: &[ResultRecord]) -> serde_json::Map<String, serde_json::Value> {
    let mut out = serde_json::Map::new();
    for record in results {
        out.insert(record.host().host.clone(), outcome_json(record));
    }
    out
}

pub fn as_json(results: &[ResultRecord]) -> String {
    serde_json::Value::Object(host_map(results)).to_string()
}

pub fn as_pretty_json(results: &[ResultRecord]) -> String {
    serde_json::to_string_pretty(&serde_json::Value::Object(host_map(results)))
        .unwrap_or_else(|_| "{}".into())
}

pub fn as_pprint(results: &[ResultRecord]) -> String {
    format!("{:#?}", host_map(results))
}

pub fn as_table(results: &[ResultRecord]) -> String {
    let mut table = Table::new();
    table.load_preset(presets::UTF8_HORIZONTAL_ONLY);
    table.set_header(["host", "response"]);

    for record in results {
        table.add_row([
            record.host().host.clone(),
            outcome_json(record).to_string(),
        ]);
    }

    table.to_string()
}

#[cfg(test)]
mod tests {
    use crate::errors::ExceptionInfo;
    use crate::inventory::HostSpec;
    use crate::result::ExecutionResult;
    use crate::value::ValueMap;

    use super::*;

    fn records() -> Vec<ResultRecord> {
        let mut fields = ValueMap::new();
        fields.insert("message".into(), "pong".into());
        vec![
            ResultRecord::Single(ExecutionResult::ok(HostSpec::new("h1"), fields)),
            ResultRecord::Single(ExecutionResult::fail(
                HostSpec::new("h2"),
                ExceptionInfo::new("ConnectionError", "no route"),
            )),
        ]
    }

    #[test]
    fn failed_hosts_are_not_omitted() {
        let rendered: serde_json::Value = serde_json::from_str(&as_json(&records())).unwrap();
        assert!(rendered.get("h1").is_some());
        assert_eq!(
            rendered["h2"]["exception"]["name"],
            serde_json::Value::from("ConnectionError")
        );
    }

    #[test]
    fn unknown_formatter_is_an_error() {
        assert!(pick_formatter("yamlish").is_err());
        assert!(pick_formatter("JSON").is_ok());
    }
}
