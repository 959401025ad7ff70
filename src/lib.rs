/*!
# Frog

Home-grown infrastructure management tool.

Given an inventory of remote hosts and a named resource with keyword
parameters, frog connects to each host over a pluggable transport (ssh,
docker, podman), provisions a self-contained execution environment on the
remote, gathers a cached set of host facts, executes the resource on every
selected host concurrently, and aggregates typed result records for a
formatter to render.

The common layout of a run:

```no_run
use frog::prelude::*;

fn main() {
    let mut inventory = Inventory::load(&["./inventory".into()]).unwrap();
    let runner = Runner::new();

    runner.gather_facts(&mut inventory, None);
    let results = runner
        .execute(&inventory, "test.ping", &frog::kvparse::parse("message=hi"))
        .unwrap();

    for record in &results {
        println!("{}: {:?}", record.host().host, record.as_list());
    }
}
```

Remote execution ships a small agent to each host over the transport's own
stream, layers a bootstrapped environment on top, and issues one blocking
call per host; results travel back as serialized envelopes.
*/
#[macro_use]
extern crate tracing;

pub use errors::{BootstrapError, ConnectionError, NameNotFound};
pub use fact_cache::FactCache;
pub use inventory::{HostSpec, Inventory};
pub use result::{ExecutionResult, ResultChain, ResultRecord};
pub use runner::Runner;
pub use value::Value;

pub mod agent;
pub mod config;
pub mod connection;
pub mod errors;
pub mod fact_cache;
pub mod facts;
pub mod inventory;
pub mod kvparse;
pub mod outputs;
pub mod remoteenv;
pub mod resources;
pub mod result;
pub mod runner;
pub mod tags;
pub mod transport;
pub mod value;

/// Re-export of commonly used structs and traits
pub mod prelude {
    pub use super::fact_cache::FactCache;
    pub use super::inventory::{HostSpec, Inventory};
    pub use super::remoteenv::Settings;
    pub use super::result::{ExecutionResult, ResultChain, ResultRecord};
    pub use super::runner::Runner;
    pub use super::tags::TagResolver;
    pub use super::value::{FromValue, ToValue, Value};
}
