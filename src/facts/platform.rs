//! Architecture and operating system facts.

use nix::sys::utsname::uname;

use crate::value::{Value, ValueMap};

pub fn gather() -> Option<ValueMap> {
    let mut data = ValueMap::new();
    data.insert("architecture".into(), std::env::consts::ARCH.into());

    match uname() {
        Ok(uts) => {
            data.insert(
                "machine".into(),
                uts.machine().to_string_lossy().into_owned().into(),
            );
            data.insert(
                "processor".into(),
                uts.machine().to_string_lossy().into_owned().into(),
            );
            data.insert(
                "system".into(),
                uts.sysname().to_string_lossy().into_owned().into(),
            );
            data.insert(
                "release".into(),
                uts.release().to_string_lossy().into_owned().into(),
            );
        }
        Err(e) => {
            debug!("uname failed: {e}");
            data.insert("system".into(), std::env::consts::OS.into());
        }
    }

    let mut runtime = ValueMap::new();
    runtime.insert("implementation".into(), "frog-agent".into());
    runtime.insert("version".into(), env!("CARGO_PKG_VERSION").into());
    data.insert("runtime".into(), Value::Map(runtime));

    let mut facts = ValueMap::new();
    facts.insert("platform".into(), Value::Map(data));
    Some(facts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_block_is_always_present() {
        let facts = gather().unwrap();
        let platform = facts.get("platform").unwrap();
        assert!(platform.get("architecture").is_some());
        assert!(platform.get("system").is_some());
        assert_eq!(
            platform.get("runtime").unwrap().get("implementation"),
            Some(&Value::from("frog-agent"))
        );
    }
}
