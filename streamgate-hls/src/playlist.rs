//! M3U8 playlist rendering over the fragment ring.
//!
//! Both playlists are derived on demand and never persisted. URLs are
//! absolute, built from the configured hostname, with the request's
//! query arguments passed through (minus the porter's request id tag).

use streamgate_core::config::HlsConfig;

use crate::ring::{FragmentRing, RingError};

/// Query parameter the porter injects; never echoed back to clients.
const REQUEST_ID_PARAMETER: &str = "FLUREQID";

pub const M3U8_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

/// Normalize a hostname for URL building: no leading slash, an
/// explicit scheme, a trailing slash.
#[must_use]
pub fn normalize_hostname(hostname: &str) -> String {
    let mut hostname = hostname.strip_prefix('/').unwrap_or(hostname).to_string();
    if !hostname.starts_with("http://") && !hostname.starts_with("https://") {
        hostname = format!("http://{hostname}");
    }
    if !hostname.ends_with('/') {
        hostname.push('/');
    }
    hostname
}

#[derive(Debug, Clone)]
pub struct PlaylistRenderer {
    hostname: String,
    main_playlist: String,
    stream_playlist: String,
    stream_bitrate: u64,
    title: String,
    allow_cache: bool,
    keys_uri: String,
}

impl PlaylistRenderer {
    #[must_use]
    pub fn new(config: &HlsConfig, hostname: &str, title: &str) -> Self {
        let hostname = normalize_hostname(hostname);
        let keys_uri = config
            .keys_uri
            .clone()
            .unwrap_or_else(|| hostname.clone());
        Self {
            hostname,
            main_playlist: config.main_playlist.clone(),
            stream_playlist: config.stream_playlist.clone(),
            stream_bitrate: config.stream_bitrate,
            title: title.to_string(),
            allow_cache: config.allow_cache,
            keys_uri,
        }
    }

    #[must_use]
    pub fn is_playlist(&self, resource: &str) -> bool {
        resource == self.main_playlist || resource == self.stream_playlist
    }

    /// Render the named playlist, passing through query arguments.
    pub fn render(
        &self,
        ring: &FragmentRing,
        resource: &str,
        args: &[(String, String)],
    ) -> Result<String, RingError> {
        if resource == self.main_playlist {
            Ok(self.render_main(args))
        } else if resource == self.stream_playlist {
            self.render_stream(ring, args)
        } else {
            Err(RingError::PlaylistNotFound)
        }
    }

    fn render_args(args: &[(String, String)]) -> String {
        let kept: Vec<&(String, String)> = args
            .iter()
            .filter(|(key, _)| key != REQUEST_ID_PARAMETER)
            .collect();
        if kept.is_empty() {
            return String::new();
        }
        match serde_urlencoded::to_string(&kept) {
            Ok(encoded) => format!("?{encoded}"),
            Err(_) => String::new(),
        }
    }

    fn render_main(&self, args: &[(String, String)]) -> String {
        let mut lines = Vec::new();
        lines.push("#EXTM3U".to_string());
        // The bandwidth value is not significant for single bitrate.
        lines.push(format!(
            "#EXT-X-STREAM-INF:PROGRAM-ID=1,BANDWIDTH={}",
            self.stream_bitrate
        ));
        lines.push(format!(
            "{}{}{}",
            self.hostname,
            self.stream_playlist,
            Self::render_args(args)
        ));
        lines.push(String::new());
        lines.join("\n")
    }

    fn render_stream(
        &self,
        ring: &FragmentRing,
        args: &[(String, String)],
    ) -> Result<String, RingError> {
        let entries = ring.window_entries();
        let target_duration = entries
            .iter()
            .map(|e| e.duration)
            .min()
            .ok_or(RingError::PlaylistNotFound)?;
        let rendered_args = Self::render_args(args);

        let mut lines = Vec::new();
        lines.push("#EXTM3U".to_string());
        lines.push(format!(
            "#EXT-X-ALLOW-CACHE:{}",
            if self.allow_cache { "YES" } else { "NO" }
        ));
        lines.push(format!("#EXT-X-TARGETDURATION:{target_duration}"));
        lines.push(format!("#EXT-X-MEDIA-SEQUENCE:{}", entries[0].sequence));

        for entry in &entries {
            let name = ring.fragment_name(entry.sequence);
            if entry.discontinuity {
                lines.push("#EXT-X-DISCONTINUITY".to_string());
            }
            if entry.encrypted {
                lines.push(format!(
                    "#EXT-X-KEY:METHOD=AES-128,URI=\"{}?key={}\"",
                    self.keys_uri, name
                ));
            }
            lines.push(format!("#EXTINF:{},{}", entry.duration, self.title));
            lines.push(format!("{}{}{}", self.hostname, name, rendered_args));
        }

        lines.push(String::new());
        Ok(lines.join("\n"))
    }
}
