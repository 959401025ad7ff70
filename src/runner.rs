//! The execution engine: owns the transport multiplexer, the pool of live
//! remote contexts and the per-host dispatch. One worker thread per host,
//! fan-out then join; results are collected in completion order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::connection::DEFAULT_CONNECT_TIMEOUT;
use crate::errors::{CallError, ConnectionError, ExceptionInfo, StreamError};
use crate::fact_cache::FactCache;
use crate::inventory::{HostSpec, Inventory};
use crate::remoteenv::{Settings, REQUIREMENTS_PATH};
use crate::resources::{self, ParamError};
use crate::result::{ExecutionResult, ResultRecord};
use crate::transport::frame::CallRequest;
use crate::transport::{Broker, Context, Router};
use crate::value::{FromValue, ToValue, Value, ValueMap};

/// The poll slice of the worker join loop.
const JOIN_SLICE: Duration = Duration::from_secs(1);

type ConnectionSlot = Arc<Mutex<Option<Context>>>;

pub struct Runner {
    broker: Broker,
    router: Router,
    /// Live contexts keyed by the host descriptor's printable identity
    /// (which includes the via-chain and sudo target). Slots serialize
    /// concurrent misses for the same host.
    connections: Mutex<HashMap<String, ConnectionSlot>>,
    bootstrap_settings: Settings,
    fact_cache: Mutex<FactCache>,
    closed: bool,
}

impl Runner {
    pub fn new() -> Self {
        Self::with_settings(Settings::default())
    }

    pub fn with_settings(bootstrap_settings: Settings) -> Self {
        let broker = Broker::new();
        broker.file_service().register_virtual(
            REQUIREMENTS_PATH,
            include_bytes!("remoteenv/requirements.txt").to_vec(),
        );
        let router = Router::new(broker.clone());

        Runner {
            broker,
            router,
            connections: Mutex::new(HashMap::new()),
            bootstrap_settings,
            fact_cache: Mutex::new(FactCache::memory()),
            closed: false,
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Allow remotes to pull files under `prefix` during bootstrap.
    pub fn register_fs_prefix(&self, prefix: impl Into<std::path::PathBuf>) {
        self.broker.file_service().register_prefix(prefix);
    }

    /// Refresh facts for every host, pre-pass before an execution sweep.
    /// Hosts with a fresh cache entry are served from it; everyone else is
    /// gathered remotely. Gather failures are returned as failure
    /// envelopes and do not abort the sweep.
    pub fn gather_facts(
        &self,
        inventory: &mut Inventory,
        cache: Option<&mut FactCache>,
    ) -> Vec<ResultRecord> {
        let mut own_cache;
        let cache: &mut FactCache = match cache {
            Some(external) => external,
            None => {
                own_cache = self.fact_cache.lock();
                &mut own_cache
            }
        };
        debug!("gathering via {cache}");

        let mut names: Vec<String> = Vec::new();
        for host in inventory.iter() {
            if !names.contains(&host.host) {
                names.push(host.host.clone());
            }
        }

        let mut failures = Vec::new();
        for name in names {
            if let Some(facts) = cache.get(&name) {
                merge_facts(inventory, &name, &facts);
                continue;
            }
            debug!("host {name} fact cache data is invalid, updating");

            let subset = inventory.select(&name);
            let results = match self.execute(&subset, "facts.gather", &ValueMap::new()) {
                Ok(results) => results,
                Err(e) => {
                    // facts.gather takes no parameters; this cannot happen.
                    error!("fact gathering dispatch failed: {e}");
                    continue;
                }
            };

            for record in results {
                match extract_facts(&record) {
                    Some(facts) => {
                        merge_facts(inventory, &name, &facts);
                        cache.update(&name, &facts);
                    }
                    None => failures.push(record),
                }
            }
        }

        failures
    }

    /// Run `target` on every host concurrently. Results come back in
    /// completion order, one envelope per host (except hosts whose payload
    /// turned out to be unserializable, which are logged and suppressed).
    pub fn execute(
        &self,
        inventory: &Inventory,
        target: &str,
        params: &ValueMap,
    ) -> Result<Vec<ResultRecord>, ParamError> {
        let op = match resources::lookup(target) {
            Ok(op) => op,
            Err(err) => {
                // An unknown target is a per-host failure, not a dispatch
                // error: every selected host reports it.
                return Ok(inventory
                    .iter()
                    .map(|host| {
                        ResultRecord::Single(ExecutionResult::fail(
                            host.clone(),
                            ExceptionInfo::new("NameError", &err),
                        ))
                    })
                    .collect());
            }
        };
        op.schema.validate(target, params)?;

        let (sink_tx, sink_rx) = flume::unbounded::<ResultRecord>();

        std::thread::scope(|scope| {
            let mut pool = Vec::new();
            for host in inventory.iter() {
                info!("enqueue host {} to run {target}({params:?})", host.host);
                let sink_tx = sink_tx.clone();
                let handle = std::thread::Builder::new()
                    .name(format!("runner[{}]", host.host))
                    .spawn_scoped(scope, move || {
                        self.execute_on_host(&sink_tx, host, inventory, target, params);
                    })
                    .expect("failed to spawn host worker");
                pool.push(handle);
            }

            while !pool.is_empty() {
                let mut done = Vec::new();
                for (idx, handle) in pool.iter().enumerate() {
                    if handle.is_finished() {
                        done.push(idx);
                    }
                }
                for idx in done.into_iter().rev() {
                    if pool.remove(idx).join().is_err() {
                        error!("a host worker panicked");
                    }
                }
                if !pool.is_empty() {
                    std::thread::sleep(JOIN_SLICE);
                }
            }
        });
        drop(sink_tx);

        Ok(sink_rx.drain().collect())
    }

    /// One worker's whole lifecycle: context acquisition, the single
    /// remote call, and outcome mapping.
    fn execute_on_host(
        &self,
        sink: &flume::Sender<ResultRecord>,
        host: &HostSpec,
        inventory: &Inventory,
        target: &str,
        params: &ValueMap,
    ) {
        let ctx = match self.get_or_create_connection(host) {
            Ok(ctx) => ctx,
            Err(cause) => {
                let err = ConnectionError::new(&host.host, cause);
                error!("{err}");
                let info = ExceptionInfo::new("ConnectionError", &err)
                    .with_args(vec![host.host.clone().into()]);
                let _ = sink.send(ResultRecord::Single(ExecutionResult::fail(
                    host.clone(),
                    info,
                )));
                return;
            }
        };

        // Deep-copied, wire-checked snapshots. A failure here is a
        // programmer error: log it with the payload and emit nothing for
        // this host rather than corrupt the result stream.
        let inventory_snapshot = match inventory.to_value().to_wire() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("unserializable inventory snapshot (target={target}, host={host}): {e}");
                return;
            }
        };
        let host_snapshot = match host.to_value().to_wire() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("unserializable host snapshot (target={target}, host={host}): {e}");
                return;
            }
        };

        let request = CallRequest {
            target: target.to_owned(),
            inventory: inventory_snapshot,
            host: host_snapshot,
            parent: self.router.myself(),
            params: Value::Map(params.clone()),
        };

        match ctx.call(request) {
            Ok(changed) => {
                let mut fields = Value::map();
                fields.insert("changed".into(), changed);
                let _ = sink.send(ResultRecord::Single(ExecutionResult::ok(
                    host.clone(),
                    fields,
                )));
            }
            Err(err) if err.is_decode_defect() => {
                // Implementation defect, not a host failure.
                error!(
                    "undecodable payload (target={target}, host={host}, params={params:?}): {err}"
                );
            }
            Err(CallError::Remote(info)) => {
                let _ = sink.send(ResultRecord::Single(ExecutionResult::fail(
                    host.clone(),
                    info,
                )));
            }
            Err(CallError::Stream(e)) => {
                error!("unhandled stream failure during call to {host}: {e}");
                let info = ExceptionInfo::new("RemoteCallError", &e);
                let _ = sink.send(ResultRecord::Single(ExecutionResult::fail(
                    host.clone(),
                    info,
                )));
            }
        }
    }

    /// The cached, bootstrapped context for a host. Two concurrent misses
    /// for the same host serialize on the slot lock, so only one of them
    /// bootstraps.
    fn get_or_create_connection(&self, host: &HostSpec) -> Result<Context, StreamError> {
        let slot = {
            let mut connections = self.connections.lock();
            connections.entry(host.to_string()).or_default().clone()
        };

        let mut slot = slot.lock();
        if let Some(ctx) = slot.as_ref() {
            return Ok(ctx.clone());
        }

        let timeout = host
            .connection_method()
            .ok()
            .flatten()
            .map(|m| m.common().connect_timeout)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        let base = host.open_connection(&self.router)?;
        let upgraded = self.into_bootstrap(&base, timeout)?;
        *slot = Some(upgraded.clone());
        Ok(upgraded)
    }

    /// Wrap a base context in a context running inside the bootstrapped
    /// remote environment. If the environment is not available, it will be
    /// created.
    fn into_bootstrap(&self, ctx: &Context, timeout: Duration) -> Result<Context, StreamError> {
        let bin_path = ctx
            .bootstrap(self.bootstrap_settings.clone())
            .map_err(|err| match err {
                CallError::Remote(info) => StreamError::Protocol(info.to_string()),
                CallError::Stream(e) => e,
            })?;

        self.router.local(Some(&bin_path), timeout, Some(ctx))
    }

    /// Number of live cached contexts.
    pub fn connection_count(&self) -> usize {
        self.connections
            .lock()
            .values()
            .filter(|slot| slot.lock().is_some())
            .count()
    }

    /// Tear the multiplexer down: lingering workers are unblocked with
    /// stream errors. Safe to call more than once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.connections.lock().clear();
        self.broker.shutdown();
    }
}

impl Default for Runner {
    fn default() -> Self {
        Runner::new()
    }
}

impl Drop for Runner {
    fn drop(&mut self) {
        self.close();
    }
}

fn merge_facts(inventory: &mut Inventory, name: &str, facts: &ValueMap) {
    for host in inventory.iter_mut().filter(|h| h.host == name) {
        host.update_facts(facts.clone());
    }
}

/// Unwrap a `facts.gather` sweep result down to the gathered map: the
/// worker's envelope carries the remote envelope under `changed`, whose
/// success outcome carries `facts`.
fn extract_facts(record: &ResultRecord) -> Option<ValueMap> {
    let ResultRecord::Single(result) = record else {
        return None;
    };
    if !result.is_success() {
        return None;
    }

    let outcome = result.outcome();
    let inner = ResultRecord::from_value(outcome.get("changed")?).ok()?;
    match inner {
        ResultRecord::Single(remote) if remote.is_success() => remote
            .outcome()
            .get("facts")
            .and_then(Value::as_map)
            .cloned(),
        _ => None,
    }
}
