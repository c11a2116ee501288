//! Public TCP acceptor: reads the first request line, routes it, and
//! hands the connection to a backend.

use bytes::BytesMut;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::channel::encode_handoff_payload;
use crate::porter::{Handoff, PorterShared};
use crate::protocol::{generate_request_id, split_first_line, WireProtocol};

/// First-line length cap; overruns drop the connection.
pub const MAX_FIRST_LINE: usize = 4096;

/// Clients get this long to produce a parsable first line. A normal
/// client is connected for a fraction of a second.
pub const PORTER_CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Accept loop over the public socket.
pub async fn run_public_listener(
    shared: Arc<PorterShared>,
    listener: TcpListener,
    protocol: WireProtocol,
    inject_request_id: bool,
) {
    loop {
        match listener.accept().await {
            Ok((stream, remote_addr)) => {
                debug!(%remote_addr, "accepted connection");
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    serve_client(shared, protocol, inject_request_id, stream).await;
                });
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
            }
        }
    }
}

async fn serve_client(
    shared: Arc<PorterShared>,
    protocol: WireProtocol,
    inject_request_id: bool,
    mut stream: TcpStream,
) {
    let first_line =
        tokio::time::timeout(PORTER_CLIENT_TIMEOUT, read_first_line(&mut stream)).await;
    let (line, delim, rest) = match first_line {
        Err(_) => {
            debug!("timing out porter client");
            return;
        }
        Ok(Err(e)) => {
            debug!(error = %e, "read failed");
            return;
        }
        Ok(Ok(None)) => return,
        Ok(Ok(Some(parts))) => parts,
    };

    let line_str = String::from_utf8_lossy(&line);
    let Some(mut parsed) = protocol.parse_line(&line_str) else {
        debug!(line = %line_str, "could not parse first line");
        return;
    };

    let request_id = inject_request_id.then(generate_request_id);
    let mut first_line = line.clone();
    if let Some(id) = &request_id {
        if parsed.inject_request_id(id) {
            first_line = parsed.unparse().into_bytes();
        }
    }

    let identifier = parsed.identifier().to_string();
    debug!(identifier, request_id = ?request_id, "routing request");

    let destination = {
        let router = shared.router.lock();
        router.find_destination(&identifier).cloned()
    };
    let sender = destination
        .as_ref()
        .and_then(|avatar| shared.avatars.lock().get(avatar).cloned());

    let Some(sender) = sender else {
        debug!(identifier, "no destination avatar found");
        let _ = stream
            .write_all(protocol.not_found_response().as_bytes())
            .await;
        return;
    };

    // The buffer handed over is everything read so far, with the
    // (possibly rewritten) first line back in front.
    let mut forward = Vec::with_capacity(first_line.len() + delim.len() + rest.len());
    forward.extend_from_slice(&first_line);
    forward.extend_from_slice(delim.as_bytes());
    forward.extend_from_slice(&rest);

    let std_stream = match stream.into_std() {
        Ok(std_stream) => std_stream,
        Err(e) => {
            warn!(error = %e, "could not detach client socket");
            return;
        }
    };
    let fd: OwnedFd = std_stream.into();
    let payload = encode_handoff_payload(request_id.as_deref(), &forward);
    let handoff = Handoff { fd, payload };

    match sender.try_send(handoff) {
        Ok(()) => {
            info!(
                identifier,
                avatar = destination.as_deref().unwrap_or(""),
                "connection handed off"
            );
            // The descriptor now belongs to the backend; our reference
            // was moved into the handoff and closes there without a
            // shutdown, leaving the TCP connection alive.
        }
        Err(e) => {
            warn!(identifier, "handoff failed: {e}");
            let handoff = match e {
                mpsc::error::TrySendError::Full(h) | mpsc::error::TrySendError::Closed(h) => h,
            };
            write_unavailable(handoff.fd, &protocol);
        }
    }
}

/// Tell a client we could not place it; we still own the descriptor
/// here, so a plain blocking write is safe.
fn write_unavailable(fd: OwnedFd, protocol: &WireProtocol) {
    use std::io::Write;
    let stream = std::net::TcpStream::from(fd);
    if stream.set_nonblocking(false).is_ok() {
        let mut stream = stream;
        let _ = stream.write_all(protocol.service_unavailable_response().as_bytes());
    }
}

/// Accumulate until a line terminator shows up. `None` means the
/// client is hopeless: EOF, or past the length cap with no line.
async fn read_first_line(
    stream: &mut TcpStream,
) -> std::io::Result<Option<(Vec<u8>, &'static str, Vec<u8>)>> {
    let mut buffer = BytesMut::with_capacity(1024);
    loop {
        if let Some((line, delim, rest)) = split_first_line(&buffer) {
            return Ok(Some((line.to_vec(), delim, rest.to_vec())));
        }
        if buffer.len() > MAX_FIRST_LINE {
            debug!("dropping, buffer exceeded");
            return Ok(None);
        }
        let n = stream.read_buf(&mut buffer).await?;
        if n == 0 {
            return Ok(None);
        }
    }
}
