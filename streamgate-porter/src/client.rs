//! Backend side of the control channel: log in to a porter, register
//! mounts, and re-materialize handed-off client sockets.

use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::path::Path;
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::channel::{
    decode_handoff_payload, send_rpc, ChannelEvent, ChannelReader, ControlRequest,
    ControlResponse,
};
use crate::{PorterError, Result};

/// A client connection received from the porter, ready to be served as
/// if it had been accepted locally.
pub struct IncomingConnection {
    pub stream: TcpStream,
    /// Bytes the porter already read; serve these before the socket.
    pub buffered: Vec<u8>,
    pub request_id: Option<String>,
    pub peer_addr: SocketAddr,
}

/// Control-channel client living inside a streamer.
pub struct PorterClient {
    stream: UnixStream,
    reader: ChannelReader,
    /// Frames that arrived while waiting for an RPC response.
    stashed: Vec<(Option<OwnedFd>, Vec<u8>)>,
}

impl PorterClient {
    /// Connect and log in. `username`/`password` may be None when the
    /// porter allows passwordless logins.
    pub async fn connect(
        path: &Path,
        avatar_id: &str,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<Self> {
        let stream = UnixStream::connect(path).await?;
        let mut client = Self {
            stream,
            reader: ChannelReader::new(),
            stashed: Vec::new(),
        };
        match client
            .call(ControlRequest::Login {
                avatar_id: avatar_id.to_string(),
                username: username.map(str::to_string),
                password: password.map(str::to_string),
            })
            .await?
        {
            ControlResponse::Ok => {
                info!(avatar_id, "logged into porter");
                Ok(client)
            }
            ControlResponse::Error { message } => Err(PorterError::LoginRefused(message)),
            other => Err(PorterError::Channel(format!(
                "unexpected login response: {other:?}"
            ))),
        }
    }

    async fn call(&mut self, request: ControlRequest) -> Result<ControlResponse> {
        send_rpc(&self.stream, &request).await?;
        loop {
            match self.reader.next_event(&self.stream).await? {
                ChannelEvent::Rpc(line) => {
                    return serde_json::from_str(&line)
                        .map_err(|e| PorterError::Channel(format!("bad response: {e}")));
                }
                ChannelEvent::Frame { fd, payload } => {
                    // A handoff can race an in-flight call; keep it.
                    self.stashed.push((fd, payload));
                }
                ChannelEvent::Closed => {
                    return Err(PorterError::Channel("porter closed channel".to_string()))
                }
            }
        }
    }

    fn expect_ok(response: ControlResponse) -> Result<()> {
        match response {
            ControlResponse::Ok => Ok(()),
            ControlResponse::Error { message } => Err(PorterError::Channel(message)),
            other => Err(PorterError::Channel(format!(
                "unexpected response: {other:?}"
            ))),
        }
    }

    pub async fn register_path(&mut self, path: &str) -> Result<()> {
        let response = self
            .call(ControlRequest::RegisterPath {
                path: path.to_string(),
            })
            .await?;
        Self::expect_ok(response)
    }

    pub async fn deregister_path(&mut self, path: &str) -> Result<()> {
        let response = self
            .call(ControlRequest::DeregisterPath {
                path: path.to_string(),
            })
            .await?;
        Self::expect_ok(response)
    }

    pub async fn register_prefix(&mut self, prefix: &str) -> Result<()> {
        let response = self
            .call(ControlRequest::RegisterPrefix {
                prefix: prefix.to_string(),
            })
            .await?;
        Self::expect_ok(response)
    }

    pub async fn deregister_prefix(&mut self, prefix: &str) -> Result<()> {
        let response = self
            .call(ControlRequest::DeregisterPrefix {
                prefix: prefix.to_string(),
            })
            .await?;
        Self::expect_ok(response)
    }

    /// The porter's advertised public port, for building URLs.
    pub async fn get_port(&mut self) -> Result<u16> {
        match self.call(ControlRequest::GetPort).await? {
            ControlResponse::Port { port } => Ok(port),
            ControlResponse::Error { message } => Err(PorterError::Channel(message)),
            other => Err(PorterError::Channel(format!(
                "unexpected response: {other:?}"
            ))),
        }
    }

    /// Receive handoffs forever, delivering re-materialized
    /// connections on `tx`. Returns when the porter goes away.
    pub async fn run(mut self, tx: mpsc::Sender<IncomingConnection>) -> Result<()> {
        for (fd, payload) in std::mem::take(&mut self.stashed) {
            Self::deliver(fd, payload, &tx).await;
        }
        loop {
            match self.reader.next_event(&self.stream).await? {
                ChannelEvent::Frame { fd, payload } => {
                    Self::deliver(fd, payload, &tx).await;
                }
                ChannelEvent::Rpc(line) => {
                    debug!(line, "unsolicited control message");
                }
                ChannelEvent::Closed => {
                    warn!("porter closed the control channel");
                    return Ok(());
                }
            }
        }
    }

    async fn deliver(
        fd: Option<OwnedFd>,
        payload: Vec<u8>,
        tx: &mpsc::Sender<IncomingConnection>,
    ) {
        let Some(fd) = fd else {
            warn!("frame without descriptor, dropping");
            return;
        };
        match materialize(fd, &payload) {
            Ok(connection) => {
                debug!(
                    peer = %connection.peer_addr,
                    request_id = ?connection.request_id,
                    buffered = connection.buffered.len(),
                    "received handed-off connection"
                );
                if tx.send(connection).await.is_err() {
                    warn!("connection sink closed, dropping handoff");
                }
            }
            Err(e) => warn!(error = %e, "could not materialize descriptor"),
        }
    }
}

/// Wrap a received descriptor back into a connected TCP stream.
fn materialize(fd: OwnedFd, payload: &[u8]) -> std::io::Result<IncomingConnection> {
    let std_stream = std::net::TcpStream::from(fd);
    std_stream.set_nonblocking(true)?;
    let peer_addr = std_stream.peer_addr()?;
    let stream = TcpStream::from_std(std_stream)?;
    let (request_id, buffered) = decode_handoff_payload(payload);
    Ok(IncomingConnection {
        stream,
        buffered,
        request_id,
        peer_addr,
    })
}
