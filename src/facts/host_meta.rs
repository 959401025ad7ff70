//! Facts derived from the host's own name.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::value::{Value, ValueMap};

// Matches `<app>-n<NN>.<region><N?>.<domain>`, the fleet naming scheme.
static HOSTNAME_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)
        ^                               # beginning of string
            (?P<app>[a-z_-]+)           # matches the app name
            -                           # separator between app name and node num
            n(?P<node>\d{2,})           # match node num w/o leading `n`
            \.                          # next domain part
            (?P<datacenter>             # capture region + datacenter num
                (?P<region>[a-z]{3})    # nested capture region only
            \d?)                        # capture optional datacenter num
            \.                          # next domain part
            (?P<domain>.+)              # capture remaining chunk of domain
        $                               # end of string
    ",
    )
    .expect("hostname pattern is valid")
});

/// Parses out name to variables. Hostnames outside the naming scheme yield
/// nothing.
fn data_from_name(hostname: &str) -> ValueMap {
    let Some(captures) = HOSTNAME_PATTERN.captures(hostname) else {
        debug!("hostname is not in expected format, can't gather");
        return ValueMap::new();
    };

    let field = |name: &str| Value::from(&captures[name]);
    let mut data = ValueMap::new();
    data.insert("app".into(), field("app"));
    data.insert("node".into(), field("node"));
    data.insert("datacenter".into(), field("datacenter"));
    data.insert("region".into(), field("region"));
    data.insert("parent_domain".into(), field("domain"));
    data
}

pub fn gather() -> Option<ValueMap> {
    let hostname = nix::unistd::gethostname()
        .ok()?
        .to_string_lossy()
        .into_owned();

    let mut facts = ValueMap::new();
    facts.insert("fqdn".into(), hostname.clone().into());
    facts.extend(data_from_name(&hostname));
    debug!("gathered {} facts", facts.len());
    Some(facts)
}
