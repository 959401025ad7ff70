//! End-to-end runs over the local transport: every test spawns the real
//! agent binary, bootstraps an environment under a tempdir and issues real
//! calls through the multiplexer.

use frog::connection::ConnectionMethod;
use frog::fact_cache::FactCache;
use frog::prelude::*;
use frog::value::ValueMap;
use indexmap::IndexMap;

fn local_host(name: &str) -> HostSpec {
    local_host_with_agent(name, env!("CARGO_BIN_EXE_frog-agent"))
}

fn local_host_with_agent(name: &str, agent_path: &str) -> HostSpec {
    let mut options = Value::map();
    options.insert("agent_path".into(), agent_path.into());
    options.insert("connect_timeout".into(), Value::Int(20));
    let mut method = Value::map();
    method.insert("type".into(), "local".into());
    method.insert("options".into(), Value::Map(options));

    let mut host = HostSpec::new(name);
    host.should_sudo = false;
    host.set_connection(ConnectionMethod::load(&Value::Map(method)).unwrap())
        .unwrap();
    host
}

fn inventory_of(hosts: Vec<HostSpec>) -> Inventory {
    let mut groups = IndexMap::new();
    groups.insert("test".to_string(), hosts);
    Inventory::from_groups(groups)
}

fn runner_in(tmp: &tempfile::TempDir) -> Runner {
    Runner::with_settings(Settings::new(tmp.path().join("env"), false))
}

/// The remote envelope travels under `changed` in the worker's envelope.
fn remote_envelope(record: &ResultRecord) -> ResultRecord {
    let ResultRecord::Single(result) = record else {
        panic!("expected a leaf envelope, got {record:?}");
    };
    assert!(result.is_success(), "worker envelope failed: {result:?}");
    ResultRecord::from_value(result.outcome().get("changed").expect("changed field"))
        .expect("remote envelope decodes")
}

#[test]
fn ping_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    let mut runner = runner_in(&tmp);
    let inventory = inventory_of(vec![local_host("ping-h1")]);

    let mut params = ValueMap::new();
    params.insert("message".into(), "hi".into());
    let results = runner.execute(&inventory, "test.ping", &params).unwrap();
    assert_eq!(results.len(), 1);

    let remote = remote_envelope(&results[0]);
    let outcomes = remote.as_list();
    assert_eq!(outcomes[0].get("message"), Some(&Value::from("hi")));
    assert_eq!(remote.host().host, "ping-h1");

    runner.close();
}

#[test]
fn fan_out_failures_stay_isolated() {
    let tmp = tempfile::tempdir().unwrap();
    let mut runner = runner_in(&tmp);
    let inventory = inventory_of(vec![
        local_host("fan-h1"),
        local_host_with_agent("fan-h2", "/nonexistent/frog-agent"),
        local_host("fan-h3"),
    ]);

    let results = runner
        .execute(&inventory, "test.ping", &ValueMap::new())
        .unwrap();
    assert_eq!(results.len(), 3);

    for record in &results {
        let ResultRecord::Single(result) = record else {
            panic!("expected leaf envelopes");
        };
        if result.host.host == "fan-h2" {
            let exception = result.exception().expect("fan-h2 must fail");
            assert_eq!(exception.name, "ConnectionError");
        } else {
            assert!(result.is_success(), "{} failed: {result:?}", result.host.host);
        }
    }

    runner.close();
}

#[test]
fn unknown_target_reports_per_host() {
    let tmp = tempfile::tempdir().unwrap();
    let mut runner = runner_in(&tmp);
    let inventory = inventory_of(vec![local_host("t-h1"), local_host("t-h2")]);

    let results = runner
        .execute(&inventory, "nope.nothing", &ValueMap::new())
        .unwrap();
    assert_eq!(results.len(), 2);
    for record in &results {
        let ResultRecord::Single(result) = record else {
            panic!("expected leaf envelopes");
        };
        assert_eq!(result.exception().expect("must fail").name, "NameError");
    }

    runner.close();
}

#[test]
fn unknown_parameter_is_a_dispatch_error() {
    let tmp = tempfile::tempdir().unwrap();
    let mut runner = runner_in(&tmp);
    let inventory = inventory_of(vec![local_host("p-h1")]);

    let mut params = ValueMap::new();
    params.insert("bogus".into(), "1".into());
    assert!(runner.execute(&inventory, "test.ping", &params).is_err());

    runner.close();
}

#[test]
fn empty_selection_executes_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let mut runner = runner_in(&tmp);
    let inventory = inventory_of(vec![local_host("e-h1")]).select("not-there");
    assert_eq!(inventory.len(), 0);

    let results = runner
        .execute(&inventory, "test.ping", &ValueMap::new())
        .unwrap();
    assert!(results.is_empty());

    runner.close();
}

#[test]
fn fact_cache_miss_then_hit_skips_dispatch() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cache = FactCache::memory();

    let mut inventory = inventory_of(vec![local_host("facts-h1")]);
    let mut runner = runner_in(&tmp);
    let failures = runner.gather_facts(&mut inventory, Some(&mut cache));
    assert!(failures.is_empty(), "gather failed: {failures:?}");
    runner.close();

    let host = inventory.iter().next().unwrap();
    assert!(host.facts.contains_key("platform"));
    assert!(host.facts.contains_key("fqdn"));

    // Second sweep with a fresh runner: everything comes from the cache,
    // so no connection is ever opened.
    let mut inventory = inventory_of(vec![local_host("facts-h1")]);
    let mut second = runner_in(&tmp);
    let failures = second.gather_facts(&mut inventory, Some(&mut cache));
    assert!(failures.is_empty());
    assert_eq!(second.connection_count(), 0);
    assert!(inventory.iter().next().unwrap().facts.contains_key("platform"));
    second.close();
}

#[test]
fn hand_set_facts_survive_gathering() {
    let tmp = tempfile::tempdir().unwrap();
    let mut runner = runner_in(&tmp);

    let mut host = local_host("facts-h2");
    host.facts.insert("fqdn".into(), "pinned.example.com".into());
    let mut inventory = inventory_of(vec![host]);

    runner.gather_facts(&mut inventory, None);
    let host = inventory.iter().next().unwrap();
    assert_eq!(host.facts.get("fqdn"), Some(&Value::from("pinned.example.com")));
    assert!(host.facts.contains_key("platform"));

    runner.close();
}

#[test]
fn composite_resource_returns_a_chain() {
    let tmp = tempfile::tempdir().unwrap();
    let mut runner = runner_in(&tmp);
    let inventory = inventory_of(vec![local_host("file-h1")]);

    let target_file = tmp.path().join("payload.txt");
    let mut params = ValueMap::new();
    params.insert("path".into(), target_file.to_str().unwrap().into());
    params.insert("contents".into(), "from afar".into());
    params.insert("overwrite".into(), "true".into());

    let results = runner.execute(&inventory, "file.put", &params).unwrap();
    assert_eq!(results.len(), 1);

    let remote = remote_envelope(&results[0]);
    assert!(matches!(remote, ResultRecord::Chain(_)));
    assert!(remote.is_success());
    assert_eq!(remote.as_list().len(), 3);
    assert_eq!(std::fs::read_to_string(&target_file).unwrap(), "from afar");

    runner.close();
}

#[test]
fn connections_are_cached_per_host_identity() {
    let tmp = tempfile::tempdir().unwrap();
    let mut runner = runner_in(&tmp);
    let inventory = inventory_of(vec![local_host("cache-h1")]);

    runner
        .execute(&inventory, "test.ping", &ValueMap::new())
        .unwrap();
    assert_eq!(runner.connection_count(), 1);

    runner
        .execute(&inventory, "test.ping", &ValueMap::new())
        .unwrap();
    assert_eq!(runner.connection_count(), 1);

    runner.close();
}
