//! The broker: a background event-loop thread that owns every trunk, the
//! context routing table and the map of in-flight calls. Host workers never
//! touch a stream directly; they enqueue commands and block on reply
//! channels.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::errors::{CallError, StreamError};
use crate::value::Value;

use super::file_service::{FileService, CHUNK_SIZE};
use super::frame::{ContextId, FileChunk, Frame, Message, CONTROLLER};

pub(crate) type CallReply = Result<Value, CallError>;
pub(crate) type HelloNotify = flume::Sender<Result<(), StreamError>>;

pub(crate) enum BrokerCommand {
    /// A new trunk stream is up; frames for its subtree go through `tx`.
    RegisterTrunk {
        trunk: ContextId,
        tx: flume::Sender<Frame>,
    },
    /// Ask to be notified when `id` greets us (or its trunk dies).
    AwaitHello { id: ContextId, notify: HelloNotify },
    /// A frame arrived from a trunk reader thread.
    Inbound { trunk: ContextId, frame: Frame },
    /// Issue a request that expects a `CallResult` for `call_id`.
    Call {
        dst: ContextId,
        call_id: u64,
        msg: Message,
        reply: flume::Sender<CallReply>,
    },
    /// The reader of a trunk saw end-of-stream.
    TrunkClosed { trunk: ContextId },
    Shutdown,
}

struct PendingCall {
    dst: ContextId,
    reply: flume::Sender<CallReply>,
}

/// Owner of the broker thread. Cloneable handle; shutdown is idempotent.
#[derive(Clone)]
pub struct Broker {
    tx: flume::Sender<BrokerCommand>,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
    file_service: Arc<FileService>,
}

impl Broker {
    pub fn new() -> Self {
        let file_service = Arc::new(FileService::new());
        let (tx, rx) = flume::unbounded();

        let state_files = file_service.clone();
        let thread = std::thread::Builder::new()
            .name("broker".into())
            .spawn(move || BrokerState::new(state_files).run(rx))
            .expect("failed to spawn broker thread");

        Broker {
            tx,
            thread: Arc::new(Mutex::new(Some(thread))),
            file_service,
        }
    }

    pub fn file_service(&self) -> &Arc<FileService> {
        &self.file_service
    }

    pub(crate) fn send(&self, command: BrokerCommand) -> Result<(), StreamError> {
        self.tx.send(command).map_err(|_| StreamError::BrokerClosed)
    }

    /// Stop the event loop and join its thread. Safe to call more than
    /// once; later calls are no-ops.
    pub fn shutdown(&self) {
        let _ = self.tx.send(BrokerCommand::Shutdown);
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                error!("broker thread panicked during shutdown");
            }
        }
    }
}

impl Default for Broker {
    fn default() -> Self {
        Broker::new()
    }
}

struct BrokerState {
    trunks: HashMap<ContextId, flume::Sender<Frame>>,
    /// context id -> trunk id carrying it.
    routes: HashMap<ContextId, ContextId>,
    pending: HashMap<u64, PendingCall>,
    hello_seen: HashSet<ContextId>,
    hello_waiters: HashMap<ContextId, Vec<HelloNotify>>,
    file_service: Arc<FileService>,
}

impl BrokerState {
    fn new(file_service: Arc<FileService>) -> Self {
        BrokerState {
            trunks: HashMap::new(),
            routes: HashMap::new(),
            pending: HashMap::new(),
            hello_seen: HashSet::new(),
            hello_waiters: HashMap::new(),
            file_service,
        }
    }

    fn run(mut self, rx: flume::Receiver<BrokerCommand>) {
        while let Ok(command) = rx.recv() {
            match command {
                BrokerCommand::RegisterTrunk { trunk, tx } => {
                    self.trunks.insert(trunk, tx);
                    self.routes.insert(trunk, trunk);
                }
                BrokerCommand::AwaitHello { id, notify } => {
                    if self.hello_seen.contains(&id) {
                        let _ = notify.send(Ok(()));
                    } else {
                        self.hello_waiters.entry(id).or_default().push(notify);
                    }
                }
                BrokerCommand::Inbound { trunk, frame } => self.on_inbound(trunk, frame),
                BrokerCommand::Call { dst, call_id, msg, reply } => {
                    match self.routes.get(&dst).and_then(|t| self.trunks.get(t)) {
                        Some(tx) => {
                            let frame = Frame { dst, src: CONTROLLER, msg };
                            if tx.send(frame).is_ok() {
                                self.pending.insert(call_id, PendingCall { dst, reply });
                            } else {
                                let _ = reply.send(Err(CallError::Stream(
                                    StreamError::Disconnected,
                                )));
                            }
                        }
                        None => {
                            let _ = reply.send(Err(CallError::Stream(StreamError::Protocol(
                                format!("no route to context {dst}"),
                            ))));
                        }
                    }
                }
                BrokerCommand::TrunkClosed { trunk } => self.on_trunk_closed(trunk),
                BrokerCommand::Shutdown => {
                    for (id, tx) in &self.trunks {
                        let frame = Frame {
                            dst: *id,
                            src: CONTROLLER,
                            msg: Message::Shutdown,
                        };
                        let _ = tx.send(frame);
                    }
                    // Dropping the trunk senders unblocks their writer
                    // threads; lingering workers observe stream errors.
                    for (_, pending) in self.pending.drain() {
                        let _ = pending
                            .reply
                            .send(Err(CallError::Stream(StreamError::BrokerClosed)));
                    }
                    break;
                }
            }
        }
    }

    fn on_inbound(&mut self, trunk: ContextId, frame: Frame) {
        if frame.dst != CONTROLLER {
            // The controller relays between trunks when asked to.
            match self.routes.get(&frame.dst).and_then(|t| self.trunks.get(t)) {
                Some(tx) => {
                    let _ = tx.send(frame);
                }
                None => warn!("dropping frame for unroutable context {}", frame.dst),
            }
            return;
        }

        match frame.msg {
            Message::Hello { version } => {
                debug!("context {} is up (agent {version})", frame.src);
                self.hello_seen.insert(frame.src);
                for notify in self.hello_waiters.remove(&frame.src).unwrap_or_default() {
                    let _ = notify.send(Ok(()));
                }
            }
            Message::CallResult { call_id, result } => match self.pending.remove(&call_id) {
                Some(pending) => {
                    let _ = pending.reply.send(result.map_err(CallError::Remote));
                }
                None => warn!("reply for unknown call {call_id} from {}", frame.src),
            },
            Message::RouteAdd { id } => {
                self.routes.insert(id, trunk);
            }
            Message::RouteDel { id } => {
                self.routes.remove(&id);
                self.hello_seen.remove(&id);
                self.fail_context(id, || StreamError::Disconnected);
            }
            Message::FileRequest { request_id, path } => {
                self.serve_file(trunk, frame.src, request_id, &path);
            }
            other => {
                warn!("unexpected message from context {}: {other:?}", frame.src);
            }
        }
    }

    fn serve_file(&mut self, trunk: ContextId, src: ContextId, request_id: u64, path: &str) {
        let Some(tx) = self.trunks.get(&trunk) else {
            return;
        };

        let reply_chunk = |chunk: Result<FileChunk, String>| Frame {
            dst: src,
            src: CONTROLLER,
            msg: Message::FileData { request_id, chunk },
        };

        match self.file_service.fetch(path) {
            Ok(bytes) => {
                debug!("serving {path} ({} bytes) to context {src}", bytes.len());
                let mut chunks = bytes.chunks(CHUNK_SIZE).peekable();
                if chunks.peek().is_none() {
                    let _ = tx.send(reply_chunk(Ok(FileChunk { bytes: Vec::new(), eof: true })));
                }
                while let Some(chunk) = chunks.next() {
                    let eof = chunks.peek().is_none();
                    let frame = reply_chunk(Ok(FileChunk { bytes: chunk.to_vec(), eof }));
                    if tx.send(frame).is_err() {
                        break;
                    }
                }
            }
            Err(reason) => {
                warn!("file request {path} from context {src} refused: {reason}");
                let _ = tx.send(reply_chunk(Err(reason)));
            }
        }
    }

    fn on_trunk_closed(&mut self, trunk: ContextId) {
        debug!("trunk {trunk} closed");
        self.trunks.remove(&trunk);
        let lost: Vec<ContextId> = self
            .routes
            .iter()
            .filter(|(_, via)| **via == trunk)
            .map(|(id, _)| *id)
            .collect();
        for id in lost {
            self.routes.remove(&id);
            self.hello_seen.remove(&id);
            self.fail_context(id, || StreamError::Disconnected);
        }
    }

    /// Fail every waiter attached to a context that just went away.
    fn fail_context(&mut self, id: ContextId, err: impl Fn() -> StreamError) {
        for notify in self.hello_waiters.remove(&id).unwrap_or_default() {
            let _ = notify.send(Err(err()));
        }
        let stale: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.dst == id)
            .map(|(call_id, _)| *call_id)
            .collect();
        for call_id in stale {
            if let Some(pending) = self.pending.remove(&call_id) {
                let _ = pending.reply.send(Err(CallError::Stream(err())));
            }
        }
    }
}
