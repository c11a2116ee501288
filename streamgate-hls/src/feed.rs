//! Upstream fragment feed.
//!
//! The media pipeline lives in another process; it delivers finished
//! fragments over a loopback TCP connection, one length-prefixed frame
//! per fragment:
//!
//! ```text
//! sequence(u64 LE) || duration_s(u32 LE) || body_len(u32 LE) || body
//! ```
//!
//! [`FragmentSink`] is the process-internal half: embedders can push
//! fragments directly without the socket.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::ring::{spawn_autofill, FragmentRing};

/// Upper bound on a single fragment body; a frame beyond this is a
/// corrupt feed.
const MAX_FRAGMENT_BYTES: u32 = 64 * 1024 * 1024;

pub struct FragmentSink {
    ring: Arc<Mutex<FragmentRing>>,
    ready: Arc<AtomicBool>,
    min_window: usize,
    fragments_seen: AtomicU64,
    last_sequence: AtomicU64,
    autofill: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl FragmentSink {
    #[must_use]
    pub fn new(ring: Arc<Mutex<FragmentRing>>, ready: Arc<AtomicBool>, min_window: usize) -> Self {
        Self {
            ring,
            ready,
            min_window,
            fragments_seen: AtomicU64::new(0),
            last_sequence: AtomicU64::new(0),
            autofill: Mutex::new(None),
        }
    }

    /// Add one fragment. A sequence running backwards means the
    /// upstream restarted; the ring is reset and refills before the
    /// streamer reports ready again.
    pub fn add_fragment(&self, body: Bytes, sequence: u64, duration: u32) -> String {
        let last = self.last_sequence.load(Ordering::Acquire);
        if sequence < last {
            warn!(
                last,
                sequence, "sequence ran backwards, soft restarting"
            );
            self.soft_restart();
        }
        self.last_sequence.store(sequence, Ordering::Release);

        let name = self.ring.lock().add(body, sequence, duration);

        let seen = self.fragments_seen.fetch_add(1, Ordering::AcqRel) + 1;
        if seen as usize == self.min_window {
            info!(fragments = seen, "initial window filled, streamer ready");
            self.ready.store(true, Ordering::Release);
        }

        // Re-arm the missing-fragment watcher from this add.
        let mut autofill = self.autofill.lock();
        if let Some(previous) = autofill.take() {
            previous.abort();
        }
        *autofill = spawn_autofill(Arc::clone(&self.ring), duration);

        name
    }

    /// Reset the playlist and wait for the window to refill.
    pub fn soft_restart(&self) {
        info!("soft restart, resetting playlist");
        self.ready.store(false, Ordering::Release);
        self.fragments_seen.store(0, Ordering::Release);
        self.last_sequence.store(0, Ordering::Release);
        if let Some(previous) = self.autofill.lock().take() {
            previous.abort();
        }
        self.ring.lock().reset();
    }
}

/// Accept loop for the fragment feed; one producer at a time.
pub async fn run_feed(sink: Arc<FragmentSink>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, remote_addr)) => {
                info!(%remote_addr, "fragment producer connected");
                if let Err(e) = serve_producer(&sink, stream).await {
                    debug!(error = %e, "fragment producer disconnected");
                }
            }
            Err(e) => warn!(error = %e, "feed accept failed"),
        }
    }
}

async fn serve_producer(sink: &Arc<FragmentSink>, mut stream: TcpStream) -> std::io::Result<()> {
    loop {
        let sequence = match stream.read_u64_le().await {
            Ok(sequence) => sequence,
            // Clean EOF between frames is a normal disconnect.
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        let duration = stream.read_u32_le().await?;
        let len = stream.read_u32_le().await?;
        if len > MAX_FRAGMENT_BYTES {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("fragment of {len} bytes exceeds limit"),
            ));
        }
        let mut body = vec![0u8; len as usize];
        stream.read_exact(&mut body).await?;
        let name = sink.add_fragment(Bytes::from(body), sequence, duration);
        debug!(name, sequence, duration, "fragment added");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamgate_core::config::HlsConfig;
    use tokio::io::AsyncWriteExt;

    fn sink_with_window(window: usize) -> (Arc<FragmentSink>, Arc<Mutex<FragmentRing>>, Arc<AtomicBool>) {
        let config = HlsConfig {
            window,
            ..HlsConfig::default()
        };
        let ring = Arc::new(Mutex::new(FragmentRing::new(&config)));
        let ready = Arc::new(AtomicBool::new(false));
        let sink = Arc::new(FragmentSink::new(
            Arc::clone(&ring),
            Arc::clone(&ready),
            window,
        ));
        (sink, ring, ready)
    }

    #[tokio::test]
    async fn test_ready_after_min_window() {
        let (sink, _, ready) = sink_with_window(3);
        sink.add_fragment(Bytes::new(), 0, 2);
        sink.add_fragment(Bytes::new(), 1, 2);
        assert!(!ready.load(Ordering::Acquire));
        sink.add_fragment(Bytes::new(), 2, 2);
        assert!(ready.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_backwards_sequence_soft_restarts() {
        let (sink, ring, ready) = sink_with_window(2);
        sink.add_fragment(Bytes::new(), 5, 2);
        sink.add_fragment(Bytes::new(), 6, 2);
        assert!(ready.load(Ordering::Acquire));

        sink.add_fragment(Bytes::new(), 0, 2);
        assert!(!ready.load(Ordering::Acquire));
        assert_eq!(ring.lock().len(), 1);

        sink.add_fragment(Bytes::new(), 1, 2);
        assert!(ready.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_feed_frames() {
        let (sink, ring, _) = sink_with_window(2);
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(run_feed(Arc::clone(&sink), listener));

        let mut producer = TcpStream::connect(addr).await.expect("connect");
        for (seq, body) in [(0u64, b"aaaa".as_slice()), (1, b"bb".as_slice())] {
            producer.write_u64_le(seq).await.expect("seq");
            producer.write_u32_le(2).await.expect("duration");
            producer
                .write_u32_le(body.len() as u32)
                .await
                .expect("len");
            producer.write_all(body).await.expect("body");
        }
        producer.flush().await.expect("flush");

        // Wait for both fragments to land.
        for _ in 0..100 {
            if ring.lock().len() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let ring = ring.lock();
        assert_eq!(ring.get("fragment-0.webm").expect("frag 0"), Bytes::from_static(b"aaaa"));
        assert_eq!(ring.get("fragment-1.webm").expect("frag 1"), Bytes::from_static(b"bb"));
    }
}
