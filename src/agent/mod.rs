//! The remote-side agent: a serve loop speaking the frame protocol on its
//! stdio. Frames come in from the parent (stdin) and from any spawned
//! children; everything not addressed to this context is forwarded along
//! the tree. Logs go to stderr, which bubbles hop by hop up to the
//! controller's trunk logger.

use std::collections::HashMap;
use std::io::{BufReader, BufWriter};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::errors::ExceptionInfo;
use crate::inventory::{HostSpec, Inventory};
use crate::remoteenv::{Bootstrapper, Settings};
use crate::resources::{self, CallContext};
use crate::result::{ExecutionResult, ResultRecord};
use crate::transport::frame::{
    self, CallRequest, ContextId, FileChunk, Frame, Message, SpawnSpec, CONTROLLER,
};
use crate::transport::spawn::{stage0_preamble, AGENT_MARKER, STAGE0_MARKER};
use crate::value::{FromValue, ToValue, Value};

/// How long a remote waits for the controller to stream a requested file.
const FILE_FETCH_TIMEOUT: Duration = Duration::from_secs(120);

enum Event {
    FromParent(Frame),
    FromChild(ContextId, Frame),
    ChildGone(ContextId),
    ParentGone,
}

struct Shared {
    id: ContextId,
    /// Frames to the parent stream.
    out_tx: flume::Sender<Frame>,
    events_tx: flume::Sender<Event>,
    /// Child trunk writers, by the child's context id.
    children: Mutex<HashMap<ContextId, flume::Sender<Frame>>>,
    /// context id -> child carrying its subtree.
    routes: Mutex<HashMap<ContextId, ContextId>>,
    /// In-flight file requests awaiting chunks.
    files: Mutex<HashMap<u64, flume::Sender<Result<FileChunk, String>>>>,
    next_request: AtomicU64,
}

impl Shared {
    fn send_up(&self, msg: Message) {
        let frame = Frame { dst: CONTROLLER, src: self.id, msg };
        if self.out_tx.send(frame).is_err() {
            warn!("parent stream is gone");
        }
    }

    fn reply(&self, dst: ContextId, call_id: u64, result: Result<Value, ExceptionInfo>) {
        let frame = Frame {
            dst,
            src: self.id,
            msg: Message::CallResult { call_id, result },
        };
        let _ = self.out_tx.send(frame);
    }

    /// Pull a file from the controller's file service, re-assembling the
    /// chunked reply.
    fn fetch_file(&self, path: &str) -> Result<Vec<u8>, String> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = flume::unbounded();
        self.files.lock().insert(request_id, tx);
        self.send_up(Message::FileRequest { request_id, path: path.to_owned() });

        let mut buffer = Vec::new();
        let outcome = loop {
            match rx.recv_timeout(FILE_FETCH_TIMEOUT) {
                Ok(Ok(chunk)) => {
                    buffer.extend_from_slice(&chunk.bytes);
                    if chunk.eof {
                        break Ok(std::mem::take(&mut buffer));
                    }
                }
                Ok(Err(reason)) => break Err(reason),
                Err(_) => break Err(format!("timed out fetching {path}")),
            }
        };
        self.files.lock().remove(&request_id);
        outcome
    }
}

/// Run the agent serve loop on this process' stdio until the parent goes
/// away or asks for a shutdown.
pub fn serve(id: ContextId) {
    let (out_tx, out_rx) = flume::unbounded::<Frame>();
    let (events_tx, events_rx) = flume::unbounded();

    std::thread::Builder::new()
        .name("agent-out".into())
        .spawn(move || {
            let stdout = std::io::stdout();
            let mut writer = BufWriter::new(stdout.lock());
            for frame in out_rx.iter() {
                if frame::write_frame(&mut writer, &frame).is_err() {
                    break;
                }
            }
        })
        .expect("failed to spawn agent writer");

    {
        let events_tx = events_tx.clone();
        std::thread::Builder::new()
            .name("agent-in".into())
            .spawn(move || {
                let stdin = std::io::stdin();
                let mut reader = BufReader::new(stdin.lock());
                loop {
                    match frame::read_frame(&mut reader) {
                        Ok(Some(frame)) => {
                            if events_tx.send(Event::FromParent(frame)).is_err() {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!("parent stream read failed: {e}");
                            break;
                        }
                    }
                }
                let _ = events_tx.send(Event::ParentGone);
            })
            .expect("failed to spawn agent reader");
    }

    let shared = Arc::new(Shared {
        id,
        out_tx,
        events_tx,
        children: Mutex::new(HashMap::new()),
        routes: Mutex::new(HashMap::new()),
        files: Mutex::new(HashMap::new()),
        next_request: AtomicU64::new(1),
    });

    shared.send_up(Message::Hello { version: env!("CARGO_PKG_VERSION").into() });
    debug!("agent context {id} serving");

    for event in events_rx.iter() {
        match event {
            Event::FromParent(frame) => {
                if frame.dst == shared.id {
                    handle(&shared, frame);
                } else {
                    forward_down(&shared, frame);
                }
            }
            Event::FromChild(child, frame) => match &frame.msg {
                // Intercept route announcements on their way up so this
                // hop learns its own subtree.
                Message::RouteAdd { id } => {
                    shared.routes.lock().insert(*id, child);
                    let _ = shared.out_tx.send(frame);
                }
                Message::RouteDel { id } => {
                    shared.routes.lock().remove(id);
                    let _ = shared.out_tx.send(frame);
                }
                _ if frame.dst == shared.id => handle(&shared, frame),
                _ => {
                    let _ = shared.out_tx.send(frame);
                }
            },
            Event::ChildGone(child) => on_child_gone(&shared, child),
            Event::ParentGone => break,
        }
    }

    debug!("agent context {id} exiting");
}

fn forward_down(shared: &Arc<Shared>, frame: Frame) {
    let route = shared.routes.lock().get(&frame.dst).copied();
    match route.and_then(|child| shared.children.lock().get(&child).cloned()) {
        Some(tx) => {
            let _ = tx.send(frame);
        }
        None => warn!("dropping frame for unroutable context {}", frame.dst),
    }
}

fn handle(shared: &Arc<Shared>, frame: Frame) {
    let src = frame.src;
    match frame.msg {
        Message::Call { call_id, request } => {
            let shared = shared.clone();
            // Handlers run off-loop so the loop keeps pumping frames (a
            // bootstrap blocks on file chunks arriving through it).
            std::thread::spawn(move || {
                let result = call_with_context(&shared, request);
                shared.reply(src, call_id, result);
            });
        }
        Message::Bootstrap { call_id, settings } => {
            let shared = shared.clone();
            std::thread::spawn(move || {
                let result = run_bootstrap(&shared, &settings);
                shared.reply(src, call_id, result);
            });
        }
        Message::Spawn { call_id, child, spec } => {
            // Inline: the route announcement must precede the reply on the
            // parent stream.
            let result = handle_spawn(shared, child, spec).map(|_| Value::Null);
            shared.reply(src, call_id, result);
        }
        Message::FileData { request_id, chunk } => {
            let sender = shared.files.lock().get(&request_id).cloned();
            match sender {
                Some(tx) => {
                    let _ = tx.send(chunk);
                }
                None => warn!("file data for unknown request {request_id}"),
            }
        }
        Message::Shutdown => {
            debug!("shutdown requested");
            std::process::exit(0);
        }
        other => warn!("unexpected message for context {}: {other:?}", shared.id),
    }
}

/// The remote entry point: populate a per-call context, resolve the
/// target, invoke it and wrap the outcome in a serialized envelope.
fn call_with_context(shared: &Shared, request: CallRequest) -> Result<Value, ExceptionInfo> {
    let inventory = Inventory::from_value(&request.inventory).map_err(|e| {
        ExceptionInfo::new("DecodeError", format!("cannot decode inventory snapshot: {e}"))
    })?;
    let host = HostSpec::from_value(&request.host).map_err(|e| {
        ExceptionInfo::new("DecodeError", format!("cannot decode host snapshot: {e}"))
    })?;
    let params = request.params.as_map().cloned().unwrap_or_default();

    let op = resources::lookup(&request.target)
        .map_err(|e| ExceptionInfo::new("NameError", e))?;
    let params = op
        .schema
        .validate(&request.target, &params)
        .map_err(|e| ExceptionInfo::new("ParamError", e))?;

    info!("invoking {} on {}", request.target, host.host);
    let ctx = CallContext::new(inventory, host.clone(), shared.id, request.parent);
    let record = match (op.run)(&ctx, &params) {
        Ok(record) => record,
        // A resource that threw still produces an envelope; only
        // infrastructure failures surface as call errors.
        Err(exception) => ResultRecord::Single(ExecutionResult::fail(host, exception)),
    };

    record
        .to_value()
        .to_wire()
        .map_err(|e| ExceptionInfo::new("SerializationError", e))
}

fn run_bootstrap(shared: &Shared, settings: &Settings) -> Result<Value, ExceptionInfo> {
    let agent_source = std::env::current_exe()
        .map_err(|e| ExceptionInfo::new("BootstrapError", e))?;
    let fetch = |path: &str| shared.fetch_file(path);
    let bootstrapper = Bootstrapper { fetch: &fetch, agent_source, verify: true };

    bootstrapper
        .bootstrap(settings)
        .map(|path| Value::Str(path.to_string_lossy().into_owned()))
        .map_err(|e| ExceptionInfo::new("BootstrapError", e))
}

/// Spawn a child context on behalf of the controller and start proxying
/// its frames.
fn handle_spawn(
    shared: &Arc<Shared>,
    child: ContextId,
    spec: SpawnSpec,
) -> Result<(), ExceptionInfo> {
    let exe = std::env::current_exe()
        .map_err(|e| ExceptionInfo::new("SpawnError", e))?;
    let exe_str = exe.to_string_lossy().into_owned();

    let mut command: Vec<String> = spec
        .command
        .iter()
        .map(|arg| arg.replace(AGENT_MARKER, &exe_str))
        .collect();

    let mut preamble_bytes = None;
    if spec.ship_binary {
        let bytes = std::fs::read(&exe)
            .map_err(|e| ExceptionInfo::new("SpawnError", format!("cannot read own binary: {e}")))?;
        let preamble = stage0_preamble(bytes, child);
        command = command
            .iter()
            .map(|arg| arg.replace(STAGE0_MARKER, &preamble.script))
            .collect();
        preamble_bytes = Some(preamble.binary);
    }

    debug!("spawning child context {child}: {}", command.join(" "));
    let mut process = Command::new(&command[0])
        .args(&command[1..])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| ExceptionInfo::new("SpawnError", format!("{}: {e}", command[0])))?;

    let stdin = process.stdin.take().expect("child stdin is piped");
    let stdout = process.stdout.take().expect("child stdout is piped");

    let (frame_tx, frame_rx) = flume::unbounded::<Frame>();
    std::thread::Builder::new()
        .name(format!("child{child}-out"))
        .spawn(move || {
            use std::io::Write;
            let mut writer = BufWriter::new(stdin);
            if let Some(bytes) = preamble_bytes {
                if writer.write_all(&bytes).and_then(|_| writer.flush()).is_err() {
                    debug!("child {child}: failed to ship agent binary");
                    return;
                }
            }
            for frame in frame_rx.iter() {
                if frame::write_frame(&mut writer, &frame).is_err() {
                    break;
                }
            }
        })
        .map_err(|e| ExceptionInfo::new("SpawnError", e))?;

    let events_tx = shared.events_tx.clone();
    std::thread::Builder::new()
        .name(format!("child{child}-in"))
        .spawn(move || {
            let mut reader = BufReader::new(stdout);
            loop {
                match frame::read_frame(&mut reader) {
                    Ok(Some(frame)) => {
                        if events_tx.send(Event::FromChild(child, frame)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!("child {child}: read failed: {e}");
                        break;
                    }
                }
            }
            let _ = events_tx.send(Event::ChildGone(child));
            let _ = process.kill();
            let _ = process.wait();
        })
        .map_err(|e| ExceptionInfo::new("SpawnError", e))?;

    shared.children.lock().insert(child, frame_tx);
    shared.routes.lock().insert(child, child);
    shared.send_up(Message::RouteAdd { id: child });

    Ok(())
}

fn on_child_gone(shared: &Arc<Shared>, child: ContextId) {
    debug!("child context {child} went away");
    shared.children.lock().remove(&child);

    let mut lost: Vec<ContextId> = {
        let mut routes = shared.routes.lock();
        let lost: Vec<ContextId> = routes
            .iter()
            .filter(|(_, via)| **via == child)
            .map(|(id, _)| *id)
            .collect();
        for id in &lost {
            routes.remove(id);
        }
        lost
    };

    lost.sort_unstable();
    for id in lost {
        shared.send_up(Message::RouteDel { id });
    }
}
