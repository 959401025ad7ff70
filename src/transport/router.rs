//! The router: opens trunks and layered contexts on top of the broker.

use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::connection::{DockerOptions, SshOptions};
use crate::errors::{CallError, StreamError};
use crate::value::Value;

use super::broker::{Broker, BrokerCommand};
use super::context::Context;
use super::frame::{ContextId, Frame, Message, SpawnSpec, CONTROLLER};
use super::spawn;

#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    broker: Broker,
    next_context: AtomicU32,
    next_call: AtomicU64,
}

impl Router {
    pub fn new(broker: Broker) -> Router {
        Router {
            inner: Arc::new(RouterInner {
                broker,
                next_context: AtomicU32::new(1),
                next_call: AtomicU64::new(1),
            }),
        }
    }

    pub fn broker(&self) -> &Broker {
        &self.inner.broker
    }

    /// The controller's own context address.
    pub fn myself(&self) -> ContextId {
        CONTROLLER
    }

    fn alloc_context(&self) -> ContextId {
        self.inner.next_context.fetch_add(1, Ordering::Relaxed)
    }

    /// Open an ssh context, either as a direct trunk or through the given
    /// jump context.
    pub fn ssh(&self, opts: &SshOptions, via: Option<&Context>) -> Result<Context, StreamError> {
        let id = self.alloc_context();
        let name = opts
            .common
            .remote_name
            .clone()
            .unwrap_or_else(|| opts.hostname.clone());
        let timeout = opts.common.connect_timeout;

        match via {
            None => {
                let binary = std::fs::read(spawn::agent_binary()?)?;
                let preamble = spawn::stage0_preamble(binary, id);
                let argv = spawn::ssh_command(opts, &preamble.script);
                self.spawn_trunk(id, argv, Some(preamble.binary), timeout, name)
            }
            Some(via) => {
                let argv = spawn::ssh_command(opts, spawn::STAGE0_MARKER);
                let spec = SpawnSpec { command: argv, ship_binary: true };
                self.spawn_via(via, id, spec, timeout, name)
            }
        }
    }

    /// Open a docker or podman context.
    pub fn docker(
        &self,
        opts: &DockerOptions,
        via: Option<&Context>,
    ) -> Result<Context, StreamError> {
        let id = self.alloc_context();
        let name = opts
            .common
            .remote_name
            .clone()
            .or_else(|| opts.container.clone())
            .or_else(|| opts.image.clone())
            .unwrap_or_else(|| opts.binary.clone());
        let timeout = opts.common.connect_timeout;

        match via {
            None => {
                let binary = std::fs::read(spawn::agent_binary()?)?;
                let preamble = spawn::stage0_preamble(binary, id);
                let argv = spawn::docker_command(opts, &preamble.script)?;
                self.spawn_trunk(id, argv, Some(preamble.binary), timeout, name)
            }
            Some(via) => {
                let argv = spawn::docker_command(opts, spawn::STAGE0_MARKER)?;
                let spec = SpawnSpec { command: argv, ship_binary: true };
                self.spawn_via(via, id, spec, timeout, name)
            }
        }
    }

    /// Start an agent from an explicit path: directly on the controller
    /// host, or layered behind `via` (the bootstrapped-interpreter upgrade
    /// path).
    pub fn local(
        &self,
        agent_path: Option<&str>,
        timeout: Duration,
        via: Option<&Context>,
    ) -> Result<Context, StreamError> {
        let id = self.alloc_context();

        match via {
            None => {
                let path: PathBuf = match agent_path {
                    Some(path) => PathBuf::from(path),
                    None => spawn::agent_binary()?,
                };
                let argv = spawn::direct_command(&path.to_string_lossy(), id);
                self.spawn_trunk(id, argv, None, timeout, "local".into())
            }
            Some(via) => {
                let argv = spawn::direct_command(agent_path.unwrap_or(spawn::AGENT_MARKER), id);
                let spec = SpawnSpec { command: argv, ship_binary: false };
                let name = format!("{}+local", via.name());
                self.spawn_via(via, id, spec, timeout, name)
            }
        }
    }

    /// Wrap an open context in a sudo context for `username`.
    pub fn sudo(
        &self,
        via: &Context,
        username: &str,
        timeout: Duration,
    ) -> Result<Context, StreamError> {
        let id = self.alloc_context();
        let spec = SpawnSpec {
            command: spawn::sudo_command(username, id),
            ship_binary: false,
        };
        let name = format!("{}+sudo:{username}", via.name());
        self.spawn_via(via, id, spec, timeout, name)
    }

    /// Issue a request that expects a `CallResult` and block for the reply.
    pub(crate) fn call(
        &self,
        dst: ContextId,
        build: impl FnOnce(u64) -> Message,
    ) -> Result<Value, CallError> {
        let call_id = self.inner.next_call.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = flume::bounded(1);
        self.inner
            .broker
            .send(BrokerCommand::Call {
                dst,
                call_id,
                msg: build(call_id),
                reply: reply_tx,
            })
            .map_err(CallError::Stream)?;

        reply_rx
            .recv()
            .map_err(|_| CallError::Stream(StreamError::BrokerClosed))?
            // Restore what the wire cannot carry (set uniqueness).
            .map(Value::normalize)
    }

    /// Spawn a subprocess trunk and wait for the remote agent's greeting.
    fn spawn_trunk(
        &self,
        id: ContextId,
        argv: Vec<String>,
        ship: Option<Vec<u8>>,
        timeout: Duration,
        name: String,
    ) -> Result<Context, StreamError> {
        let rendered = argv.join(" ");
        debug!("opening trunk {id} ({name}): {rendered}");

        let (hello_tx, hello_rx) = flume::bounded(1);
        self.inner.broker.send(BrokerCommand::AwaitHello {
            id,
            notify: hello_tx,
        })?;

        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| StreamError::Spawn {
                command: rendered.clone(),
                reason: e.to_string(),
            })?;

        let stdin = child.stdin.take().expect("child stdin is piped");
        let stdout = child.stdout.take().expect("child stdout is piped");
        let stderr = child.stderr.take().expect("child stderr is piped");

        let (frame_tx, frame_rx) = flume::unbounded::<Frame>();
        self.inner.broker.send(BrokerCommand::RegisterTrunk {
            trunk: id,
            tx: frame_tx,
        })?;

        std::thread::Builder::new()
            .name(format!("trunk{id}-out"))
            .spawn(move || {
                let mut writer = BufWriter::new(stdin);
                if let Some(bytes) = ship {
                    if writer.write_all(&bytes).and_then(|_| writer.flush()).is_err() {
                        debug!("trunk {id}: failed to ship agent binary");
                        return;
                    }
                }
                for frame in frame_rx.iter() {
                    if super::frame::write_frame(&mut writer, &frame).is_err() {
                        break;
                    }
                }
            })
            .expect("failed to spawn trunk writer");

        let broker = self.inner.broker.clone();
        std::thread::Builder::new()
            .name(format!("trunk{id}-in"))
            .spawn(move || {
                let mut reader = BufReader::new(stdout);
                loop {
                    match super::frame::read_frame(&mut reader) {
                        Ok(Some(frame)) => {
                            if broker
                                .send(BrokerCommand::Inbound { trunk: id, frame })
                                .is_err()
                            {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            debug!("trunk {id}: read failed: {e}");
                            break;
                        }
                    }
                }
                let _ = broker.send(BrokerCommand::TrunkClosed { trunk: id });
                let _ = child.kill();
                let _ = child.wait();
            })
            .expect("failed to spawn trunk reader");

        std::thread::Builder::new()
            .name(format!("trunk{id}-err"))
            .spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                    debug!("[{id}] {line}");
                }
            })
            .expect("failed to spawn trunk logger");

        self.wait_hello(&hello_rx, timeout, id, name)
    }

    /// Ask the agent behind `via` to spawn a child context and proxy it.
    fn spawn_via(
        &self,
        via: &Context,
        id: ContextId,
        spec: SpawnSpec,
        timeout: Duration,
        name: String,
    ) -> Result<Context, StreamError> {
        debug!("spawning context {id} ({name}) via {via}");

        let (hello_tx, hello_rx) = flume::bounded(1);
        self.inner.broker.send(BrokerCommand::AwaitHello {
            id,
            notify: hello_tx,
        })?;

        let command = spec.command.join(" ");
        self.call(via.id(), |call_id| Message::Spawn {
            call_id,
            child: id,
            spec,
        })
        .map_err(|err| match err {
            CallError::Remote(info) => StreamError::Spawn {
                command,
                reason: info.to_string(),
            },
            CallError::Stream(e) => e,
        })?;

        self.wait_hello(&hello_rx, timeout, id, name)
    }

    fn wait_hello(
        &self,
        hello_rx: &flume::Receiver<Result<(), StreamError>>,
        timeout: Duration,
        id: ContextId,
        name: String,
    ) -> Result<Context, StreamError> {
        match hello_rx.recv_timeout(timeout) {
            Ok(Ok(())) => Ok(Context::new(id, name, self.clone())),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(StreamError::ConnectTimeout(timeout)),
        }
    }
}
