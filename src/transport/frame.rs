//! Wire framing shared by the controller and the remote agent.
//!
//! The protocol works as follows:
//! - send a `FrameHeader` serialized with bincode with fixed-int encoding
//! - send the message body
//!
//! The header carries the body size and the source/destination context ids
//! so intermediate agents can forward frames without decoding the body.

use std::io::{ErrorKind, Read, Write};

use bincode::config::{
    FixintEncoding, RejectTrailing, WithOtherIntEncoding, WithOtherTrailing,
};
use bincode::{DefaultOptions, Options};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::errors::ExceptionInfo;
use crate::remoteenv::Settings;
use crate::value::Value;

/// Address of an execution endpoint. The controller is always id 0.
pub type ContextId = u32;

pub const CONTROLLER: ContextId = 0;

/// Configuration of the header serializer: the integers must have a fixed
/// length encoding.
static HEADER_CONFIG: Lazy<
    WithOtherTrailing<WithOtherIntEncoding<DefaultOptions, FixintEncoding>, RejectTrailing>,
> = Lazy::new(|| {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
});

static BODY_CONFIG: Lazy<DefaultOptions> = Lazy::new(bincode::DefaultOptions::new);

pub(crate) const HEADER_SIZE: usize = 12; // std::mem::size_of::<FrameHeader>();

/// Header of a message sent before the actual message.
#[derive(Serialize, Deserialize, Default)]
struct FrameHeader {
    /// The size of the actual message.
    size: u32,
    /// The context this message is for.
    dst: ContextId,
    /// The context that sent the message.
    src: ContextId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub dst: ContextId,
    pub src: ContextId,
    pub msg: Message,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// First message of every agent, emitted as soon as its serve loop is
    /// up. Context open blocks until this arrives.
    Hello { version: String },
    /// Invoke a resource through `call_with_context`.
    Call { call_id: u64, request: CallRequest },
    /// Provision the isolated remote environment.
    Bootstrap { call_id: u64, settings: Settings },
    /// Spawn a child context layered behind the receiving agent.
    Spawn {
        call_id: u64,
        child: ContextId,
        spec: SpawnSpec,
    },
    /// Reply to `Call`, `Bootstrap` or `Spawn`.
    CallResult {
        call_id: u64,
        result: Result<Value, ExceptionInfo>,
    },
    /// A context below the sender became reachable.
    RouteAdd { id: ContextId },
    /// A context below the sender went away.
    RouteDel { id: ContextId },
    /// Ask the controller's file service for a registered file.
    FileRequest { request_id: u64, path: String },
    FileData {
        request_id: u64,
        chunk: Result<FileChunk, String>,
    },
    Shutdown,
}

/// Payload of the single remote call issued per execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRequest {
    pub target: String,
    /// Serialized snapshot of the whole inventory.
    pub inventory: Value,
    /// Serialized snapshot of the host descriptor.
    pub host: Value,
    /// Context address of the controller.
    pub parent: ContextId,
    /// Resource parameters, a string-keyed map.
    pub params: Value,
}

/// Instructions for an agent to spawn a child context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnSpec {
    /// Argv of the child. The placeholder `{agent}` is replaced with the
    /// spawning agent's own executable path.
    pub command: Vec<String>,
    /// Stream the spawning agent's executable into the child's stdin ahead
    /// of the frame traffic (the stage0 preamble consumes it).
    pub ship_binary: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChunk {
    pub bytes: Vec<u8>,
    pub eof: bool,
}

/// Serialize and send a frame. The writer is flushed so a blocked reader on
/// the other side always makes progress.
pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> std::io::Result<()> {
    let body = BODY_CONFIG
        .serialize(&frame.msg)
        .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;
    let header = FrameHeader {
        size: body.len() as u32,
        dst: frame.dst,
        src: frame.src,
    };
    let header = HEADER_CONFIG
        .serialize(&header)
        .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;

    writer.write_all(&header)?;
    writer.write_all(&body)?;
    writer.flush()
}

/// Receive one frame. Returns `None` on a clean end-of-stream at a frame
/// boundary.
pub fn read_frame<R: Read>(reader: &mut R) -> std::io::Result<Option<Frame>> {
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let header: FrameHeader = HEADER_CONFIG
        .deserialize(&header)
        .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;

    let mut body = vec![0u8; header.size as usize];
    reader.read_exact(&mut body)?;
    let msg: Message = BODY_CONFIG
        .deserialize(&body)
        .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;

    Ok(Some(Frame { dst: header.dst, src: header.src, msg }))
}

#[cfg(test)]
mod tests {
    use bincode::Options;

    use super::*;

    #[test]
    fn header_size() {
        let computed_size = HEADER_CONFIG
            .serialized_size(&FrameHeader::default())
            .unwrap();

        assert_eq!(HEADER_SIZE as u64, computed_size);
    }

    #[test]
    fn frame_round_trip() {
        let frame = Frame {
            dst: 3,
            src: CONTROLLER,
            msg: Message::FileRequest {
                request_id: 7,
                path: "remoteenv/requirements.txt".into(),
            },
        };

        let mut buffer = Vec::new();
        write_frame(&mut buffer, &frame).unwrap();
        let decoded = read_frame(&mut buffer.as_slice()).unwrap().unwrap();
        assert_eq!(decoded.dst, frame.dst);
        assert_eq!(decoded.src, frame.src);
        assert!(matches!(
            decoded.msg,
            Message::FileRequest { request_id: 7, .. }
        ));
    }

    #[test]
    fn clean_eof_is_none() {
        let mut empty: &[u8] = &[];
        assert!(read_frame(&mut empty).unwrap().is_none());
    }
}
