//! Host fact gathering. Runs on the remote: a fixed, ordered registry of
//! fact modules executed on a worker pool sized to the machine's CPU
//! count, merged as they complete.

pub mod host_meta;
pub mod network;
pub mod platform;
pub mod tailscale;

use std::time::Instant;

use crate::resources::CallContext;
use crate::value::ValueMap;

/// A fact module either contributes a map of facts or reports nothing.
type FactFn = fn() -> Option<ValueMap>;

static MODULES: &[(&str, FactFn)] = &[
    ("host_meta", host_meta::gather),
    ("network", network::gather),
    ("platform", platform::gather),
    ("tailscale", tailscale::gather),
];

pub struct GatherReport {
    pub facts: ValueMap,
    pub took_ms: u64,
}

/// Gather all facts for this host. Module outputs are merged in completion
/// order, later arrivals winning on key collisions; a module returning
/// nothing is skipped.
pub fn gather(ctx: &CallContext) -> GatherReport {
    let started = Instant::now();
    debug!("starting fact gathering on host {}", ctx.host().host);

    let workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .min(MODULES.len());

    let (task_tx, task_rx) = flume::unbounded::<(&'static str, FactFn)>();
    for module in MODULES {
        let _ = task_tx.send(*module);
    }
    drop(task_tx);

    let (done_tx, done_rx) = flume::unbounded();
    let facts = std::thread::scope(|scope| {
        for _ in 0..workers {
            let task_rx = task_rx.clone();
            let done_tx = done_tx.clone();
            scope.spawn(move || {
                for (name, gather_fn) in task_rx.iter() {
                    let _ = done_tx.send((name, gather_fn()));
                }
            });
        }
        drop(done_tx);

        let mut merged = ValueMap::new();
        for (name, outcome) in done_rx.iter() {
            match outcome {
                Some(map) => {
                    for (key, value) in map {
                        merged.insert(key, value);
                    }
                }
                None => debug!("fact module {name} had nothing to report"),
            }
        }
        merged
    });

    let took_ms = started.elapsed().as_millis() as u64;
    debug!(
        "done fact gathering on {}, took {took_ms}ms",
        ctx.host().host
    );

    GatherReport { facts, took_ms }
}

#[cfg(test)]
mod tests {
    use crate::inventory::{HostSpec, Inventory};

    use super::*;

    #[test]
    fn gather_merges_module_outputs() {
        let ctx = CallContext::new(Inventory::default(), HostSpec::new("test-host"), 1, 0);
        let report = gather(&ctx);
        // host_meta always reports at least the fqdn; platform always
        // reports the platform block.
        assert!(report.facts.contains_key("fqdn"));
        assert!(report.facts.contains_key("platform"));
    }
}
