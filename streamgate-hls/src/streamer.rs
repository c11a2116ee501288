//! HLS streamer assembly: shared state, client accounting, and the
//! two serving modes (standalone TCP listener or slaved to a porter).

use axum::Router;
use parking_lot::Mutex;
use rand::Rng;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use streamgate_core::bouncer::{self, KEYCARD_EXPIRE_INTERVAL};
use streamgate_core::httpauth::{ClientEjector, HttpAuth};
use streamgate_core::session::SessionStore;
use streamgate_core::{Config, Error, Result, TokenCodec};
use streamgate_porter::PorterClient;

use crate::feed::{self, FragmentSink};
use crate::handoff::{ClientAddr, HandoffListener};
use crate::playlist::PlaylistRenderer;
use crate::resource;
use crate::ring::FragmentRing;

/// Write-inactivity budget per request; on-demand serving only, the
/// fragment bodies themselves are small.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client and bandwidth accounting, mirrored into the overflow gate.
pub struct Stats {
    start: Instant,
    clients: AtomicUsize,
    peak_clients: AtomicUsize,
    clients_added: AtomicU64,
    clients_removed: AtomicU64,
    bytes_sent: AtomicU64,
}

impl Default for Stats {
    fn default() -> Self {
        Self {
            start: Instant::now(),
            clients: AtomicUsize::new(0),
            peak_clients: AtomicUsize::new(0),
            clients_added: AtomicU64::new(0),
            clients_removed: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        }
    }
}

impl Stats {
    pub fn client_added(&self) {
        let now = self.clients.fetch_add(1, Ordering::Relaxed) + 1;
        self.clients_added.fetch_add(1, Ordering::Relaxed);
        self.peak_clients.fetch_max(now, Ordering::Relaxed);
    }

    pub fn client_removed(&self) {
        self.clients.fetch_sub(1, Ordering::Relaxed);
        self.clients_removed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    #[must_use]
    pub fn clients(&self) -> usize {
        self.clients.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn peak_clients(&self) -> usize {
        self.peak_clients.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Average outgoing bitrate in bits per second since start.
    #[must_use]
    pub fn current_bitrate(&self) -> u64 {
        let uptime = self.start.elapsed().as_secs().max(1);
        self.bytes_sent() * 8 / uptime
    }
}

/// Everything the HTTP leaf needs, shared across connections.
pub struct HlsState {
    pub ring: Arc<Mutex<FragmentRing>>,
    pub renderer: PlaylistRenderer,
    pub sessions: SessionStore,
    pub auth: Arc<HttpAuth>,
    pub token: TokenCodec,
    pub stats: Arc<Stats>,
    pub mount_point: String,
    pub ready: Arc<AtomicBool>,
    pub max_clients: Option<usize>,
    pub bandwidth_limit: Option<u64>,
    pub redirect_on_overflow: Option<String>,
}

impl HlsState {
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Client or bandwidth cap reached.
    #[must_use]
    pub fn reached_server_limits(&self) -> bool {
        if let Some(max) = self.max_clients {
            if self.sessions.len() >= max {
                return true;
            }
        }
        if let Some(limit) = self.bandwidth_limit {
            if self.stats.current_bitrate() >= limit {
                return true;
            }
        }
        false
    }
}

/// Duration expiry ejects the client by revoking its session; the
/// session's expire hooks do the rest of the cleanup.
struct SessionEjector {
    sessions: SessionStore,
}

impl ClientEjector for SessionEjector {
    fn eject(&self, client_id: &str) {
        self.sessions.revoke(client_id);
    }
}

pub struct HlsStreamer {
    state: Arc<HlsState>,
    sink: Arc<FragmentSink>,
    config: Config,
}

impl HlsStreamer {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let mount_point = config.mount_point();

        let secret = match &config.session.secret {
            Some(hex_secret) => hex::decode(hex_secret)
                .map_err(|_| Error::Config("session.secret is not hex".to_string()))?,
            None => {
                warn!(
                    "no session secret configured; generating an ephemeral one \
                     (tokens will not survive a restart)"
                );
                let mut secret = [0u8; 32];
                rand::rng().fill_bytes(&mut secret);
                secret.to_vec()
            }
        };

        let bouncer = config
            .auth
            .bouncer
            .as_ref()
            .map(|recipe| bouncer::from_config("bouncer", recipe))
            .transpose()?;

        let requester_id = mount_point.clone();
        let auth = Arc::new(HttpAuth::new(&config.auth, &requester_id, bouncer.clone())?);

        let sessions = SessionStore::new(Duration::from_secs(config.session.timeout_secs));
        auth.set_ejector(Arc::new(SessionEjector {
            sessions: sessions.clone(),
        }));

        if let Some(bouncer) = &bouncer {
            let auth_for_expiry = Arc::clone(&auth);
            bouncer
                .registry()
                .start_expirer(KEYCARD_EXPIRE_INTERVAL, move |keycard| {
                    if let Some(id) = &keycard.id {
                        auth_for_expiry.expire_keycard(id);
                    }
                });
        }

        let ring = Arc::new(Mutex::new(FragmentRing::new(&config.hls)));
        let renderer = PlaylistRenderer::new(
            &config.hls,
            &format!("{}{}", config.streamer.hostname, mount_point),
            &config.streamer.description,
        );

        let ready = Arc::new(AtomicBool::new(false));
        let min_window = config.hls.min_window.unwrap_or(config.hls.window);
        let sink = Arc::new(FragmentSink::new(
            Arc::clone(&ring),
            Arc::clone(&ready),
            min_window,
        ));

        let state = Arc::new(HlsState {
            ring,
            renderer,
            sessions,
            auth,
            token: TokenCodec::new(&secret, &mount_point),
            stats: Arc::new(Stats::default()),
            mount_point,
            ready,
            max_clients: config.streamer.max_clients,
            bandwidth_limit: config.streamer.bandwidth_limit,
            redirect_on_overflow: config.streamer.redirect_on_overflow.clone(),
        });

        Ok(Self {
            state,
            sink,
            config,
        })
    }

    #[must_use]
    pub fn state(&self) -> Arc<HlsState> {
        Arc::clone(&self.state)
    }

    /// Handle for pushing fragments in-process, bypassing the feed.
    #[must_use]
    pub fn sink(&self) -> Arc<FragmentSink> {
        Arc::clone(&self.sink)
    }

    /// The HTTP surface, identical for both serving modes.
    #[must_use]
    pub fn router(&self) -> Router {
        Router::new()
            .fallback(resource::handle)
            .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&self.state))
    }

    /// Serve until cancelled.
    pub async fn run(self) -> anyhow::Result<()> {
        self.state.sessions.start_sweeper();
        self.state.auth.schedule_keep_alive();

        let feed_listener =
            tokio::net::TcpListener::bind(self.config.feed.bind.as_str()).await?;
        info!(bind = %self.config.feed.bind, "fragment feed listening");
        tokio::spawn(feed::run_feed(Arc::clone(&self.sink), feed_listener));

        let router = self.router();

        match self.config.streamer.mode.as_str() {
            "slave" => {
                let socket_path = self
                    .config
                    .streamer
                    .porter_socket_path
                    .clone()
                    .ok_or_else(|| {
                        anyhow::anyhow!("slave mode requires streamer.porter_socket_path")
                    })?;
                let mount = self.state.mount_point.clone();
                let mut client = PorterClient::connect(
                    &PathBuf::from(&socket_path),
                    &mount,
                    self.config.streamer.porter_username.as_deref(),
                    self.config.streamer.porter_password.as_deref(),
                )
                .await?;
                client.register_prefix(&mount).await?;
                let public_port = client.get_port().await.unwrap_or(0);
                info!(mount, public_port, "registered with porter");

                let (tx, rx) = mpsc::channel(64);
                tokio::spawn(async move {
                    if let Err(e) = client.run(tx).await {
                        warn!(error = %e, "porter client terminated");
                    }
                });

                let nominal: SocketAddr = ([0, 0, 0, 0], public_port).into();
                let listener = HandoffListener::new(rx, nominal);
                info!(mount = %self.state.mount_point, "serving porter handoffs");
                axum::serve(
                    listener,
                    router.into_make_service_with_connect_info::<ClientAddr>(),
                )
                .await?;
            }
            _ => {
                let listener =
                    tokio::net::TcpListener::bind(self.config.streamer.bind.as_str()).await?;
                info!(
                    bind = %self.config.streamer.bind,
                    mount = %self.state.mount_point,
                    "hls streamer listening"
                );
                axum::serve(
                    listener,
                    router.into_make_service_with_connect_info::<ClientAddr>(),
                )
                .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_accounting() {
        let stats = Stats::default();
        stats.client_added();
        stats.client_added();
        stats.client_removed();
        assert_eq!(stats.clients(), 1);
        assert_eq!(stats.peak_clients(), 2);
        stats.add_bytes(1000);
        assert_eq!(stats.bytes_sent(), 1000);
    }

    #[test]
    fn test_streamer_builds_from_defaults() {
        let streamer = HlsStreamer::new(Config::default()).expect("streamer builds");
        assert_eq!(streamer.state().mount_point, "/");
        assert!(!streamer.state().is_ready());
    }

    #[test]
    fn test_limits() {
        let mut config = Config::default();
        config.streamer.max_clients = Some(0);
        let streamer = HlsStreamer::new(config).expect("streamer builds");
        assert!(streamer.state().reached_server_limits());
    }
}
