//! Construction of the commands that start a remote agent, shared between
//! the controller's router and agents spawning children on behalf of a
//! via-chain.
//!
//! Transports that cannot assume the agent exists on the other side ship it
//! through stdin: the command is a small `sh` preamble that caches the
//! binary under a digest-keyed path and execs it, leaving the rest of the
//! stream for frame traffic.

use std::borrow::Cow;
use std::path::PathBuf;

use sha2::{Digest, Sha256};

use crate::connection::{DockerOptions, HostKeyPolicy, SshOptions};
use crate::errors::StreamError;

use super::frame::ContextId;

/// Placeholder an agent replaces with a stage0 preamble built from its own
/// executable when spawning the next hop of a via-chain. Contains a space
/// so shell quoting wraps it (and therefore the substituted script) in
/// single quotes.
pub const STAGE0_MARKER: &str = "{stage0 script}";

/// Placeholder replaced by the spawning agent's own executable path.
pub const AGENT_MARKER: &str = "{agent}";

/// Find the agent binary to ship to remotes: an explicit override, the
/// sibling of the running executable, or PATH.
pub fn agent_binary() -> Result<PathBuf, StreamError> {
    if let Ok(path) = std::env::var("FROG_AGENT_BIN") {
        return Ok(PathBuf::from(path));
    }

    if let Ok(me) = std::env::current_exe() {
        let sibling = me.with_file_name("frog-agent");
        if sibling.is_file() {
            return Ok(sibling);
        }
    }

    which::which("frog-agent").map_err(|_| {
        StreamError::Spawn {
            command: "frog-agent".into(),
            reason: "agent binary not found (set FROG_AGENT_BIN)".into(),
        }
    })
}

pub struct Preamble {
    /// The `sh` one-liner consuming the shipped binary and execing it.
    pub script: String,
    /// Bytes to stream ahead of the frame traffic.
    pub binary: Vec<u8>,
}

/// Build the stage0 preamble for `child`, shipping `binary`.
pub fn stage0_preamble(binary: Vec<u8>, child: ContextId) -> Preamble {
    let digest = Sha256::digest(&binary);
    let digest = format!("{digest:x}");
    let cache = format!("${{TMPDIR:-/tmp}}/frog-agent-{}", &digest[..16]);
    let size = binary.len();

    // `head -c` consumes exactly the shipped bytes whether or not the cache
    // is warm, so the frame stream stays aligned.
    let script = format!(
        "p=\"{cache}\"; if [ -x \"$p\" ]; then head -c {size} >/dev/null; \
         else head -c {size} >\"$p.t\" && chmod 0755 \"$p.t\" && mv \"$p.t\" \"$p\"; fi; \
         exec \"$p\" stage0 --id {child}"
    );

    Preamble { script, binary }
}

fn shell_quote(arg: &str) -> String {
    shell_escape::escape(Cow::Borrowed(arg)).into_owned()
}

/// Remote side of an ssh invocation running the stage0 preamble.
fn remote_shell_command(script: &str) -> String {
    format!("sh -c {}", shell_quote(script))
}

/// Argv for an ssh trunk. The option bag maps directly onto the stock ssh
/// client's flags.
pub fn ssh_command(opts: &SshOptions, script: &str) -> Vec<String> {
    let mut argv: Vec<String> = Vec::new();

    if let Some(password) = &opts.password {
        // The ssh client only takes passwords from a tty; delegate to
        // sshpass when it is available.
        if which::which("sshpass").is_ok() {
            argv.extend(["sshpass".into(), "-p".into(), password.clone()]);
        } else {
            warn!(
                "password set for {} but sshpass is not on PATH; falling back to key/agent auth",
                opts.hostname
            );
        }
    }

    argv.push(opts.ssh_path.clone());
    argv.extend(opts.ssh_args.iter().cloned());

    if opts.password.is_none() {
        argv.extend(["-o".into(), "BatchMode=yes".into()]);
    }
    argv.extend([
        "-o".into(),
        format!("ConnectTimeout={}", opts.common.connect_timeout.as_secs()),
    ]);

    match opts.check_host_keys {
        HostKeyPolicy::Enforce => {
            argv.extend(["-o".into(), "StrictHostKeyChecking=yes".into()]);
        }
        HostKeyPolicy::AcceptNew => {
            argv.extend(["-o".into(), "StrictHostKeyChecking=accept-new".into()]);
        }
        HostKeyPolicy::Ignore => {
            argv.extend([
                "-o".into(),
                "StrictHostKeyChecking=no".into(),
                "-o".into(),
                "UserKnownHostsFile=/dev/null".into(),
            ]);
        }
    }

    if let Some(port) = opts.port {
        argv.extend(["-p".into(), port.to_string()]);
    }
    // Defaulted to the local username when the descriptor has none.
    let username = opts.username.clone().unwrap_or_else(whoami::username);
    argv.extend(["-l".into(), username]);
    if let Some(identity) = &opts.identity_file {
        argv.extend(["-i".into(), identity.clone()]);
    }
    if opts.identities_only {
        argv.extend(["-o".into(), "IdentitiesOnly=yes".into()]);
    }
    if opts.compression {
        argv.push("-C".into());
    }
    for _ in 0..opts.ssh_debug_level {
        argv.push("-v".into());
    }

    argv.push(opts.hostname.clone());
    argv.push("--".into());
    argv.push(remote_shell_command(script));
    argv
}

/// Argv for a docker/podman trunk: `exec` into a running container or `run`
/// a throwaway one from an image.
pub fn docker_command(opts: &DockerOptions, script: &str) -> Result<Vec<String>, StreamError> {
    let binary = which::which(&opts.binary)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| opts.binary.clone());

    let mut argv = vec![binary];
    match (&opts.container, &opts.image) {
        (Some(container), _) => {
            argv.extend(["exec".into(), "-i".into()]);
            if let Some(username) = &opts.username {
                argv.extend(["-u".into(), username.clone()]);
            }
            argv.push(container.clone());
        }
        (None, Some(image)) => {
            argv.extend(["run".into(), "--rm".into(), "-i".into()]);
            if let Some(username) = &opts.username {
                argv.extend(["-u".into(), username.clone()]);
            }
            argv.push(image.clone());
        }
        (None, None) => {
            return Err(StreamError::Spawn {
                command: opts.binary.clone(),
                reason: "docker connection needs a container or an image".into(),
            });
        }
    }

    argv.extend(["sh".into(), "-c".into(), script.to_owned()]);
    Ok(argv)
}

/// Argv for a sudo wrapper spawned by the agent already running on the
/// host. `{agent}` is substituted by the spawning agent.
pub fn sudo_command(username: &str, child: ContextId) -> Vec<String> {
    vec![
        "sudo".into(),
        "-n".into(),
        "-u".into(),
        username.into(),
        "--".into(),
        AGENT_MARKER.into(),
        "stage0".into(),
        "--id".into(),
        child.to_string(),
    ]
}

/// Argv for an agent started from an explicit path (local transport and
/// bootstrapped interpreters).
pub fn direct_command(agent_path: &str, child: ContextId) -> Vec<String> {
    vec![
        agent_path.into(),
        "stage0".into(),
        "--id".into(),
        child.to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::connection::CommonOptions;

    use super::*;

    fn ssh_opts() -> SshOptions {
        SshOptions {
            common: CommonOptions {
                connect_timeout: Duration::from_secs(10),
                ..CommonOptions::default()
            },
            hostname: "web-n01.iad1.example.com".into(),
            username: Some("deploy".into()),
            ssh_path: "ssh".into(),
            ssh_args: vec!["-o".into(), "ServerAliveInterval=15".into()],
            port: Some(2222),
            check_host_keys: HostKeyPolicy::AcceptNew,
            password: None,
            identity_file: None,
            identities_only: false,
            compression: true,
            ssh_debug_level: 0,
        }
    }

    #[test]
    fn preamble_consumes_exact_byte_count() {
        let preamble = stage0_preamble(vec![0u8; 1234], 7);
        assert!(preamble.script.contains("head -c 1234"));
        assert!(preamble.script.contains("stage0 --id 7"));
    }

    #[test]
    fn identical_binaries_share_a_cache_path() {
        let a = stage0_preamble(b"agent".to_vec(), 1);
        let b = stage0_preamble(b"agent".to_vec(), 2);
        let path = |s: &str| s.split(';').next().unwrap().to_owned();
        assert_eq!(path(&a.script), path(&b.script));
    }

    #[test]
    fn ssh_argv_reflects_options() {
        let argv = ssh_command(&ssh_opts(), "exec agent");
        assert_eq!(argv[0], "ssh");
        assert!(argv.contains(&"-p".to_string()));
        assert!(argv.contains(&"2222".to_string()));
        assert!(argv.contains(&"StrictHostKeyChecking=accept-new".to_string()));
        assert!(argv.contains(&"-C".to_string()));
        assert!(argv.contains(&"web-n01.iad1.example.com".to_string()));
    }

    #[test]
    fn docker_needs_container_or_image() {
        let opts = DockerOptions {
            common: CommonOptions::default(),
            container: None,
            username: None,
            image: None,
            binary: "docker".into(),
        };
        assert!(docker_command(&opts, "exec agent").is_err());
    }
}
