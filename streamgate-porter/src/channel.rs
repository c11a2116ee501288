//! Porter control channel: JSON RPC plus in-band file descriptor
//! frames over one Unix stream socket.
//!
//! RPC messages are newline-delimited JSON. A descriptor handoff is an
//! `SCM_RIGHTS` ancillary message paired with an in-band frame:
//!
//! ```text
//! MAGIC(16 bytes) || payload_len(u32 LE) || payload
//! ```
//!
//! The receiver scans its byte stream for the magic; bytes before it
//! belong to the RPC parser, the framed payload is bound to the most
//! recently received descriptor. The payload itself carries the
//! request id and whatever bytes the porter already read from the
//! client socket.

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use tokio::io::Interest;
use tokio::net::UnixStream;
use tracing::{trace, warn};

use nix::sys::socket::{
    recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr,
};

/// In-band marker binding a received descriptor to its payload.
pub const FD_FRAME_MAGIC: [u8; 16] = [
    0xfd, 0xfc, 0x8e, 0x7f, 0x07, 0x47, 0xb9, 0xea, 0xa1, 0x75, 0xee, 0xd8, 0xdc, 0x36, 0xc8,
    0xa3,
];

const FRAME_HEADER_LEN: usize = FD_FRAME_MAGIC.len() + 4;
const READ_CHUNK: usize = 16 * 1024;

/// Requests a backend sends on the control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum ControlRequest {
    Login {
        avatar_id: String,
        username: Option<String>,
        password: Option<String>,
    },
    RegisterPath { path: String },
    DeregisterPath { path: String },
    RegisterPrefix { prefix: String },
    DeregisterPrefix { prefix: String },
    GetPort,
}

/// Responses the porter writes back, one per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "camelCase")]
pub enum ControlResponse {
    Ok,
    Port { port: u16 },
    Error { message: String },
}

/// One unit read from the channel.
#[derive(Debug)]
pub enum ChannelEvent {
    /// A complete RPC line (JSON, terminator stripped).
    Rpc(String),
    /// A descriptor frame. `fd` is None when no ancillary descriptor
    /// arrived with it, which a receiver should treat as a protocol
    /// error.
    Frame {
        fd: Option<OwnedFd>,
        payload: Vec<u8>,
    },
    Closed,
}

/// Encode a handoff payload: request id (length-prefixed) plus the
/// bytes already read from the client.
#[must_use]
pub fn encode_handoff_payload(request_id: Option<&str>, buffered: &[u8]) -> Vec<u8> {
    let id = request_id.unwrap_or("").as_bytes();
    debug_assert!(id.len() <= u8::MAX as usize);
    let mut payload = Vec::with_capacity(1 + id.len() + buffered.len());
    payload.push(id.len() as u8);
    payload.extend_from_slice(id);
    payload.extend_from_slice(buffered);
    payload
}

/// Split a handoff payload back into request id and buffered bytes.
#[must_use]
pub fn decode_handoff_payload(payload: &[u8]) -> (Option<String>, Vec<u8>) {
    let Some((&id_len, rest)) = payload.split_first() else {
        return (None, Vec::new());
    };
    let id_len = id_len as usize;
    if rest.len() < id_len {
        return (None, rest.to_vec());
    }
    let id = (id_len > 0)
        .then(|| String::from_utf8_lossy(&rest[..id_len]).into_owned());
    (id, rest[id_len..].to_vec())
}

/// Write raw bytes to the socket, waiting for writability as needed.
pub async fn write_all(stream: &UnixStream, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        stream.writable().await?;
        match stream.try_write(data) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Serialize one RPC message onto the channel.
pub async fn send_rpc<T: Serialize>(stream: &UnixStream, message: &T) -> io::Result<()> {
    let mut line = serde_json::to_string(message)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    line.push('\n');
    write_all(stream, line.as_bytes()).await
}

/// Send a descriptor with its framed payload. The descriptor rides as
/// `SCM_RIGHTS` ancillary data on the first chunk of the frame.
pub async fn send_fd_frame(stream: &UnixStream, fd: &OwnedFd, payload: &[u8]) -> io::Result<()> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&FD_FRAME_MAGIC);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);

    let raw = fd.as_raw_fd();
    let mut offset = 0usize;
    while offset < frame.len() {
        stream.writable().await?;
        let fds = [raw];
        let scm = [ControlMessage::ScmRights(&fds)];
        let attach_fd = offset == 0;
        let result = stream.try_io(Interest::WRITABLE, || {
            let iov = [IoSlice::new(&frame[offset..])];
            let cmsgs: &[ControlMessage<'_>] = if attach_fd { &scm } else { &[] };
            sendmsg::<UnixAddr>(
                stream.as_raw_fd(),
                &iov,
                cmsgs,
                MsgFlags::empty(),
                None,
            )
            .map_err(io::Error::from)
        });
        match result {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => offset += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Incremental reader for the interleaved RPC/frame stream.
#[derive(Default)]
pub struct ChannelReader {
    /// Unclassified bytes, scanned for the frame magic.
    buffer: BytesMut,
    /// Bytes already classified as RPC, split at newlines.
    rpc: BytesMut,
    /// Descriptors received but not yet bound to a frame.
    pending_fds: VecDeque<OwnedFd>,
    eof: bool,
}

impl ChannelReader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the next event, waiting for socket data as needed.
    pub async fn next_event(&mut self, stream: &UnixStream) -> io::Result<ChannelEvent> {
        loop {
            if let Some(event) = self.pop_event() {
                return Ok(event);
            }
            if self.eof {
                return Ok(ChannelEvent::Closed);
            }
            self.fill(stream).await?;
        }
    }

    #[allow(unsafe_code)] // SCM_RIGHTS yields raw descriptors we must own
    async fn fill(&mut self, stream: &UnixStream) -> io::Result<()> {
        loop {
            stream.readable().await?;
            let mut chunk = vec![0u8; READ_CHUNK];
            let mut cmsg_space = nix::cmsg_space!([RawFd; 8]);
            let result = stream.try_io(Interest::READABLE, || {
                let mut iov = [IoSliceMut::new(&mut chunk)];
                let msg = recvmsg::<UnixAddr>(
                    stream.as_raw_fd(),
                    &mut iov,
                    Some(&mut cmsg_space),
                    MsgFlags::empty(),
                )
                .map_err(io::Error::from)?;
                let mut fds = Vec::new();
                for cmsg in msg.cmsgs().map_err(io::Error::from)? {
                    if let ControlMessageOwned::ScmRights(received) = cmsg {
                        fds.extend(received);
                    }
                }
                Ok((msg.bytes, fds))
            });
            match result {
                Ok((0, fds)) if fds.is_empty() => {
                    self.eof = true;
                    return Ok(());
                }
                Ok((n, fds)) => {
                    for fd in fds {
                        // Safety: SCM_RIGHTS transfers ownership of the
                        // descriptor to this process.
                        self.pending_fds
                            .push_back(unsafe { OwnedFd::from_raw_fd(fd) });
                    }
                    self.buffer.extend_from_slice(&chunk[..n]);
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Classify buffered bytes and pop one complete event, if any.
    fn pop_event(&mut self) -> Option<ChannelEvent> {
        loop {
            if let Some(line) = self.pop_rpc_line() {
                return Some(ChannelEvent::Rpc(line));
            }
            match find(&self.buffer, &FD_FRAME_MAGIC) {
                Some(0) => {
                    if self.buffer.len() < FRAME_HEADER_LEN {
                        return None;
                    }
                    let len = u32::from_le_bytes(
                        self.buffer[FD_FRAME_MAGIC.len()..FRAME_HEADER_LEN]
                            .try_into()
                            .expect("slice is four bytes"),
                    ) as usize;
                    if self.buffer.len() < FRAME_HEADER_LEN + len {
                        return None;
                    }
                    self.buffer.advance(FRAME_HEADER_LEN);
                    let payload = self.buffer.split_to(len).to_vec();
                    let fd = self.pending_fds.pop_front();
                    if fd.is_none() {
                        warn!("descriptor frame without a pending descriptor");
                    }
                    trace!(payload_len = payload.len(), "descriptor frame");
                    return Some(ChannelEvent::Frame { fd, payload });
                }
                Some(pos) => {
                    let before = self.buffer.split_to(pos);
                    self.rpc.extend_from_slice(&before);
                }
                None => {
                    // Everything except a possible partial magic at the
                    // tail is RPC data.
                    let keep = partial_magic_suffix(&self.buffer);
                    let emit = self.buffer.len() - keep;
                    if emit == 0 {
                        return None;
                    }
                    let before = self.buffer.split_to(emit);
                    self.rpc.extend_from_slice(&before);
                }
            }
        }
    }

    fn pop_rpc_line(&mut self) -> Option<String> {
        let pos = find(&self.rpc, b"\n")?;
        let line = self.rpc.split_to(pos + 1);
        let line = String::from_utf8_lossy(&line[..pos]).into_owned();
        let line = line.trim_end_matches('\r').to_string();
        (!line.is_empty()).then_some(line).or_else(|| self.pop_rpc_line())
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Length of the longest proper prefix of the magic that the buffer
/// ends with.
fn partial_magic_suffix(buffer: &[u8]) -> usize {
    let max = (FD_FRAME_MAGIC.len() - 1).min(buffer.len());
    (1..=max)
        .rev()
        .find(|&k| buffer[buffer.len() - k..] == FD_FRAME_MAGIC[..k])
        .unwrap_or(0)
}
