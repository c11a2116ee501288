//! Porter assembly: the authenticated control socket where backends
//! log in and register their mounts, plus the public listener that
//! feeds them connections.

use parking_lot::Mutex;
use rand::RngExt;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::{TcpListener, UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use streamgate_core::config::PorterConfig;

use crate::channel::{
    send_fd_frame, send_rpc, ChannelEvent, ChannelReader, ControlRequest, ControlResponse,
};
use crate::listener::run_public_listener;
use crate::protocol::WireProtocol;
use crate::router::PathRouter;
use crate::{PorterError, Result};

/// Pending handoffs tolerated per backend before clients get 503.
const HANDOFF_QUEUE: usize = 64;

/// A client descriptor on its way to a backend, along with the bytes
/// the porter already consumed.
pub struct Handoff {
    pub fd: OwnedFd,
    pub payload: Vec<u8>,
}

/// State shared between the control side and the public listener.
pub struct PorterShared {
    pub router: Mutex<PathRouter>,
    pub avatars: Mutex<HashMap<String, mpsc::Sender<Handoff>>>,
    pub advertised_port: u16,
}

struct ControlAuth {
    username: Option<String>,
    password: Option<String>,
    require_password: bool,
}

impl ControlAuth {
    fn check(&self, username: Option<&str>, password: Option<&str>) -> bool {
        if !self.require_password {
            return true;
        }
        self.username.as_deref() == username && self.password.as_deref() == password
    }
}

pub struct Porter {
    shared: Arc<PorterShared>,
    control_listener: UnixListener,
    public_listener: TcpListener,
    socket_path: PathBuf,
    protocol: WireProtocol,
    inject_request_id: bool,
    auth: ControlAuth,
    username: String,
    password: String,
}

fn random_credential() -> String {
    const CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::rng();
    (0..12)
        .map(|_| CHARS[rng.random_range(0..CHARS.len())] as char)
        .collect()
}

fn generated_socket_path() -> PathBuf {
    std::env::temp_dir().join(format!("streamgate.porter.{}.sock", std::process::id()))
}

impl Porter {
    /// Bind the control socket and the public listener.
    pub async fn bind(config: &PorterConfig) -> Result<Self> {
        let protocol = match config.protocol.as_str() {
            "http" => WireProtocol::Http,
            "rtsp" => WireProtocol::Rtsp,
            other => {
                return Err(PorterError::Config(format!("unknown protocol '{other}'")))
            }
        };

        // Explicitly configured, or self-configured with random
        // credentials and a generated socket path.
        let (socket_path, username, password) = match &config.socket_path {
            Some(path) => (
                PathBuf::from(path),
                config.username.clone().unwrap_or_else(random_credential),
                config.password.clone().unwrap_or_else(random_credential),
            ),
            None => (
                generated_socket_path(),
                random_credential(),
                random_credential(),
            ),
        };

        if socket_path.exists() {
            let _ = std::fs::remove_file(&socket_path);
        }
        let control_listener = UnixListener::bind(&socket_path)?;
        std::fs::set_permissions(
            &socket_path,
            std::fs::Permissions::from_mode(config.socket_mode),
        )?;
        info!(path = %socket_path.display(), "listening on control socket");

        let public_listener = TcpListener::bind(config.bind.as_str()).await?;
        let local = public_listener.local_addr()?;
        info!(%local, "listening on public socket");

        let advertised_port = config.advertised_port.unwrap_or_else(|| local.port());

        Ok(Self {
            shared: Arc::new(PorterShared {
                router: Mutex::new(PathRouter::new()),
                avatars: Mutex::new(HashMap::new()),
                advertised_port,
            }),
            control_listener,
            public_listener,
            socket_path,
            protocol,
            inject_request_id: config.inject_request_id,
            auth: ControlAuth {
                username: Some(username.clone()),
                password: Some(password.clone()),
                require_password: config.require_password,
            },
            username,
            password,
        })
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.public_listener.local_addr()?)
    }

    /// Login credentials backends must present (when required).
    #[must_use]
    pub fn credentials(&self) -> (String, String) {
        (self.username.clone(), self.password.clone())
    }

    /// Serve until cancelled. The control socket file is removed when
    /// the future is dropped.
    pub async fn run(self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let auth = Arc::new(self.auth);
        let control = self.control_listener;
        let _guard = SocketGuard(self.socket_path.clone());

        let control_loop = {
            let shared = Arc::clone(&shared);
            async move {
                loop {
                    match control.accept().await {
                        Ok((stream, _)) => {
                            debug!("backend connected to control socket");
                            let shared = Arc::clone(&shared);
                            let auth = Arc::clone(&auth);
                            tokio::spawn(async move {
                                serve_backend(shared, auth, stream).await;
                            });
                        }
                        Err(e) => warn!(error = %e, "control accept failed"),
                    }
                }
            }
        };

        tokio::join!(
            control_loop,
            run_public_listener(
                shared,
                self.public_listener,
                self.protocol,
                self.inject_request_id,
            )
        );
        Ok(())
    }
}

struct SocketGuard(PathBuf);

impl Drop for SocketGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

/// One backend's control connection: login, registrations, handoffs.
async fn serve_backend(shared: Arc<PorterShared>, auth: Arc<ControlAuth>, stream: UnixStream) {
    let mut reader = ChannelReader::new();

    // Login phase; nothing else is accepted first.
    let avatar_id = loop {
        match reader.next_event(&stream).await {
            Ok(ChannelEvent::Rpc(line)) => match serde_json::from_str::<ControlRequest>(&line) {
                Ok(ControlRequest::Login {
                    avatar_id,
                    username,
                    password,
                }) => {
                    if auth.check(username.as_deref(), password.as_deref()) {
                        if send_rpc(&stream, &ControlResponse::Ok).await.is_err() {
                            return;
                        }
                        info!(avatar_id, "backend logged in");
                        break avatar_id;
                    }
                    warn!(avatar_id, "backend login refused");
                    let _ = send_rpc(
                        &stream,
                        &ControlResponse::Error {
                            message: "bad credentials".to_string(),
                        },
                    )
                    .await;
                    return;
                }
                Ok(_) => {
                    let _ = send_rpc(
                        &stream,
                        &ControlResponse::Error {
                            message: "login required".to_string(),
                        },
                    )
                    .await;
                    return;
                }
                Err(e) => {
                    debug!(error = %e, "unparsable control message");
                    return;
                }
            },
            Ok(ChannelEvent::Frame { .. }) => {
                debug!("unexpected frame before login");
                return;
            }
            Ok(ChannelEvent::Closed) | Err(_) => return,
        }
    };

    let (tx, mut rx) = mpsc::channel::<Handoff>(HANDOFF_QUEUE);
    if shared
        .avatars
        .lock()
        .insert(avatar_id.clone(), tx.clone())
        .is_some()
    {
        warn!(avatar_id, "replacing already attached avatar");
    }

    loop {
        tokio::select! {
            event = reader.next_event(&stream) => match event {
                Ok(ChannelEvent::Rpc(line)) => {
                    let response = match serde_json::from_str::<ControlRequest>(&line) {
                        Ok(request) => handle_request(&shared, &avatar_id, request),
                        Err(e) => ControlResponse::Error {
                            message: format!("bad request: {e}"),
                        },
                    };
                    if send_rpc(&stream, &response).await.is_err() {
                        break;
                    }
                }
                Ok(ChannelEvent::Frame { .. }) => {
                    debug!(avatar_id, "ignoring frame from backend");
                }
                Ok(ChannelEvent::Closed) | Err(_) => break,
            },
            handoff = rx.recv() => match handoff {
                Some(handoff) => {
                    if let Err(e) = send_fd_frame(&stream, &handoff.fd, &handoff.payload).await {
                        warn!(avatar_id, error = %e, "failed to send descriptor");
                        break;
                    }
                    debug!(avatar_id, "sent descriptor to backend");
                    // handoff.fd drops here: close without shutdown,
                    // the descriptor lives on in the backend.
                }
                None => break,
            },
        }
    }

    info!(avatar_id, "backend logging out");
    {
        let mut avatars = shared.avatars.lock();
        if avatars.get(&avatar_id).is_some_and(|s| s.same_channel(&tx)) {
            avatars.remove(&avatar_id);
        }
    }
    shared.router.lock().remove_avatar(&avatar_id);
}

fn handle_request(
    shared: &PorterShared,
    avatar_id: &str,
    request: ControlRequest,
) -> ControlResponse {
    match request {
        ControlRequest::Login { .. } => ControlResponse::Error {
            message: "already logged in".to_string(),
        },
        ControlRequest::RegisterPath { path } => {
            shared.router.lock().register_path(&path, avatar_id);
            ControlResponse::Ok
        }
        ControlRequest::DeregisterPath { path } => {
            shared.router.lock().deregister_path(&path, avatar_id);
            ControlResponse::Ok
        }
        ControlRequest::RegisterPrefix { prefix } => {
            shared.router.lock().register_prefix(&prefix, avatar_id);
            ControlResponse::Ok
        }
        ControlRequest::DeregisterPrefix { prefix } => {
            shared.router.lock().deregister_prefix(&prefix, avatar_id);
            ControlResponse::Ok
        }
        ControlRequest::GetPort => ControlResponse::Port {
            port: shared.advertised_port,
        },
    }
}
