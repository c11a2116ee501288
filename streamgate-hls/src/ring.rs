//! Sliding-window ring of media fragments.
//!
//! The ring holds the fragments backing the playlist plus a tail of
//! older ones for clients still downloading from a stale playlist.
//! Fragments are keyed by their synthetic filename
//! `<prefix>-<sequence>.<ext>`. Dummy fragments inserted by auto-fill
//! keep the advertised sequence contiguous but are never served.

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use streamgate_core::config::HlsConfig;

/// Encryption keys are raw AES-128 key material.
pub const KEY_LEN: usize = 16;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RingError {
    #[error("fragment not found")]
    FragmentNotFound,

    /// The name matches a dummy placeholder; the real fragment may
    /// still arrive, so the client can retry.
    #[error("fragment not available")]
    FragmentNotAvailable,

    #[error("playlist not found")]
    PlaylistNotFound,

    #[error("key not found")]
    KeyNotFound,
}

/// Playlist-visible fragment metadata.
#[derive(Debug, Clone, Copy)]
pub struct FragmentEntry {
    pub sequence: u64,
    pub duration: u32,
    pub encrypted: bool,
    pub discontinuity: bool,
}

pub struct FragmentRing {
    prefix: String,
    ext: String,
    window: usize,
    max_buffers: usize,
    tolerance: f64,
    key_interval: u64,
    entries: VecDeque<FragmentEntry>,
    bodies: HashMap<String, Bytes>,
    keys: HashMap<String, [u8; KEY_LEN]>,
    dummies: HashSet<String>,
    current_key: Option<[u8; KEY_LEN]>,
    /// Sequence expected next from upstream; 0 until the first add.
    next_expected: u64,
}

impl FragmentRing {
    #[must_use]
    pub fn new(config: &HlsConfig) -> Self {
        // The extra-buffer floor keeps fragments that just scrolled out
        // of the window retrievable for one more playlist period.
        let floor = config.window + 1;
        let max_extra = match config.max_extra_buffers {
            Some(extra) if extra < floor => {
                warn!(extra, floor, "max_extra_buffers raised to window + 1");
                floor
            }
            Some(extra) => extra,
            None => floor,
        };
        Self {
            prefix: config.fragment_prefix.clone(),
            ext: config.filename_ext.clone(),
            window: config.window,
            max_buffers: config.window + max_extra,
            tolerance: config.new_fragment_tolerance,
            key_interval: config.key_interval,
            entries: VecDeque::new(),
            bodies: HashMap::new(),
            keys: HashMap::new(),
            dummies: HashSet::new(),
            current_key: None,
            next_expected: 0,
        }
    }

    #[must_use]
    pub fn fragment_name(&self, sequence: u64) -> String {
        format!("{}-{}.{}", self.prefix, sequence, self.ext)
    }

    #[must_use]
    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    /// The sequence the ring expects next; 0 before the first add.
    #[must_use]
    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a fragment. A sequence already present is a silent
    /// no-op. Returns the playlist name for the fragment.
    pub fn add(&mut self, body: Bytes, sequence: u64, duration: u32) -> String {
        let name = self.fragment_name(sequence);
        if self.entries.iter().any(|e| e.sequence == sequence) {
            return name;
        }

        let encrypted = self.key_interval != 0;
        if encrypted && sequence % self.key_interval == 0 {
            let mut key = [0u8; KEY_LEN];
            rand::rng().fill_bytes(&mut key);
            self.current_key = Some(key);
            debug!(sequence, "rotated encryption key");
        }

        let discontinuity = sequence != self.next_expected && self.next_expected != 0;
        self.entries.push_back(FragmentEntry {
            sequence,
            duration,
            encrypted,
            discontinuity,
        });
        self.next_expected = sequence + 1;

        if let Some(key) = self.current_key {
            self.keys.insert(name.clone(), key);
        }
        self.bodies.insert(name.clone(), body);
        self.evict();
        name
    }

    /// Append a name-only placeholder to keep the playlist contiguous.
    /// Uses the previous fragment's duration.
    pub fn add_dummy(&mut self, sequence: u64) -> String {
        let duration = self.entries.back().map_or(0, |e| e.duration);
        let name = self.fragment_name(sequence);
        if self.entries.iter().any(|e| e.sequence == sequence) {
            return name;
        }
        debug!(sequence, "inserting dummy fragment");
        self.entries.push_back(FragmentEntry {
            sequence,
            duration,
            encrypted: false,
            discontinuity: false,
        });
        self.next_expected = sequence + 1;
        self.dummies.insert(name.clone());
        self.evict();
        name
    }

    fn evict(&mut self) {
        while self.entries.len() > self.max_buffers {
            if let Some(evicted) = self.entries.pop_front() {
                let name = self.fragment_name(evicted.sequence);
                self.bodies.remove(&name);
                self.keys.remove(&name);
                self.dummies.remove(&name);
            }
        }
    }

    /// Fetch a fragment body by playlist name.
    pub fn get(&self, name: &str) -> Result<Bytes, RingError> {
        if let Some(body) = self.bodies.get(name) {
            return Ok(body.clone());
        }
        if self.dummies.contains(name) {
            return Err(RingError::FragmentNotAvailable);
        }
        Err(RingError::FragmentNotFound)
    }

    /// Fetch the encryption key stamped on a fragment.
    pub fn get_key(&self, name: &str) -> Result<[u8; KEY_LEN], RingError> {
        self.keys.get(name).copied().ok_or(RingError::KeyNotFound)
    }

    /// Empty the ring and forget dummies and keys.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.bodies.clear();
        self.keys.clear();
        self.dummies.clear();
        self.current_key = None;
        self.next_expected = 0;
    }

    /// The fragments the playlist advertises: the newest up to
    /// `window` entries, oldest first.
    #[must_use]
    pub fn window_entries(&self) -> Vec<FragmentEntry> {
        let skip = self.entries.len().saturating_sub(self.window);
        self.entries.iter().skip(skip).copied().collect()
    }
}

/// Auto-fill: watch for the next expected sequence and insert a dummy
/// when it does not arrive within `duration * (1 + tolerance)`. After
/// a dummy, subsequent checks run at the plain duration.
pub fn spawn_autofill(
    ring: Arc<Mutex<FragmentRing>>,
    duration: u32,
) -> Option<tokio::task::JoinHandle<()>> {
    let (tolerance, expected) = {
        let ring = ring.lock();
        (ring.tolerance(), ring.next_expected())
    };
    if tolerance <= 0.0 || expected == 0 || duration == 0 {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut wait = f64::from(duration) * (1.0 + tolerance);
        let mut expected = expected;
        loop {
            tokio::time::sleep(std::time::Duration::from_secs_f64(wait)).await;
            {
                let mut ring = ring.lock();
                if ring.next_expected() != expected {
                    // A real fragment arrived; that add scheduled a
                    // fresh watcher.
                    return;
                }
                ring.add_dummy(expected);
                expected += 1;
            }
            wait = f64::from(duration);
        }
    }))
}
