use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::{Error, Result};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub porter: PorterConfig,
    pub streamer: StreamerConfig,
    pub hls: HlsConfig,
    pub auth: AuthConfig,
    pub session: SessionConfig,
    pub feed: FeedConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PorterConfig {
    /// Public listening address, e.g. "0.0.0.0:8800"
    pub bind: String,
    /// Wire protocol accepted on the public socket: "http" or "rtsp"
    pub protocol: String,
    /// Control socket path; a temporary path is generated when unset
    pub socket_path: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub require_password: bool,
    /// Octal file mode for the control socket
    pub socket_mode: u32,
    /// Port advertised to backends via getPort; defaults to the bind port
    pub advertised_port: Option<u16>,
    /// Inject a FLUREQID request id into forwarded request lines
    pub inject_request_id: bool,
}

impl Default for PorterConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8800".to_string(),
            protocol: "http".to_string(),
            socket_path: None,
            username: None,
            password: None,
            require_password: true,
            socket_mode: 0o666,
            advertised_port: None,
            inject_request_id: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamerConfig {
    /// "standalone" (own TCP listener) or "slave" (behind a porter)
    pub mode: String,
    pub bind: String,
    /// Porter control socket, required in slave mode
    pub porter_socket_path: Option<String>,
    pub porter_username: Option<String>,
    pub porter_password: Option<String>,
    /// Public hostname used to build playlist URLs
    pub hostname: String,
    /// Mount point; normalized to begin and end with '/'
    pub mount_point: String,
    pub description: String,
    pub max_clients: Option<usize>,
    /// Average outgoing bitrate cap in bits per second
    pub bandwidth_limit: Option<u64>,
    /// Redirect clients here instead of responding 503 when caps are hit
    pub redirect_on_overflow: Option<String>,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            mode: "standalone".to_string(),
            bind: "0.0.0.0:8080".to_string(),
            porter_socket_path: None,
            porter_username: None,
            porter_password: None,
            hostname: "localhost:8080".to_string(),
            mount_point: "/".to_string(),
            description: "Streamgate Stream".to_string(),
            max_clients: None,
            bandwidth_limit: None,
            redirect_on_overflow: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HlsConfig {
    pub main_playlist: String,
    pub stream_playlist: String,
    pub stream_bitrate: u64,
    pub fragment_prefix: String,
    /// Fragment filename extension: "webm" or "ts"
    pub filename_ext: String,
    /// Number of fragments advertised in the playlist
    pub window: usize,
    /// Extra fragments retained beyond the window; defaults to window + 1
    pub max_extra_buffers: Option<usize>,
    /// Auto-fill tolerance; 0 disables dummy fragment insertion
    pub new_fragment_tolerance: f64,
    /// Fragments sharing one encryption key; 0 disables key rotation
    pub key_interval: u64,
    pub keys_uri: Option<String>,
    pub allow_cache: bool,
    /// Fragments required before the streamer reports ready; defaults to window
    pub min_window: Option<usize>,
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            main_playlist: "main.m3u8".to_string(),
            stream_playlist: "stream.m3u8".to_string(),
            stream_bitrate: 300_000,
            fragment_prefix: "fragment".to_string(),
            filename_ext: "webm".to_string(),
            window: 5,
            max_extra_buffers: None,
            new_fragment_tolerance: 0.0,
            key_interval: 0,
            keys_uri: None,
            allow_cache: true,
            min_window: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Keycard issuer: "generic", "basic" or "token"
    pub issuer: String,
    /// Realm used in HTTP auth challenges and stamped on keycards
    pub domain: Option<String>,
    /// Fallback keycard duration when the bouncer grants none
    pub default_duration_secs: Option<u64>,
    pub keepalive_interval_secs: u64,
    pub retry_interval_secs: u64,
    pub bouncer: Option<BouncerConfig>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            issuer: "generic".to_string(),
            domain: None,
            default_duration_secs: None,
            keepalive_interval_secs: 20 * 60,
            retry_interval_secs: 60,
            bouncer: None,
        }
    }
}

/// Bouncer construction recipe; `multi` nests named sub-bouncers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BouncerConfig {
    HtpasswdCrypt {
        file: Option<String>,
        data: Option<String>,
    },
    SaltSha256 {
        file: Option<String>,
        data: Option<String>,
    },
    Ip {
        #[serde(default)]
        allow: Vec<String>,
        #[serde(default)]
        deny: Vec<String>,
        #[serde(default)]
        deny_default: bool,
    },
    Ical {
        file: String,
        max_keycard_duration_secs: Option<u64>,
    },
    Token {
        token: String,
        allowed_ids: Option<Vec<String>>,
    },
    Multi {
        combination: String,
        bouncers: HashMap<String, BouncerConfig>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub timeout_secs: u64,
    /// Hex-encoded HMAC secret; generated at startup when unset.
    /// Must carry at least 128 bits of entropy when provided.
    pub secret: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 900,
            secret: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Upstream fragment feed listener; loopback by default
    pub bind: String,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8999".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from an optional file plus `STREAMGATE_` overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        } else {
            builder = builder.add_source(File::with_name("streamgate").required(false));
        }

        let settings = builder
            .add_source(Environment::with_prefix("STREAMGATE").separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Validate cross-field constraints not expressible in serde.
    pub fn validate(&self) -> Result<()> {
        if self.streamer.mode != "standalone" && self.streamer.mode != "slave" {
            return Err(Error::Config(format!(
                "unknown streamer mode '{}'",
                self.streamer.mode
            )));
        }
        if self.streamer.mode == "slave" && self.streamer.porter_socket_path.is_none() {
            return Err(Error::Config(
                "slave mode requires streamer.porter_socket_path".to_string(),
            ));
        }
        if self.porter.protocol != "http" && self.porter.protocol != "rtsp" {
            return Err(Error::Config(format!(
                "unknown porter protocol '{}'",
                self.porter.protocol
            )));
        }
        if let Some(secret) = &self.session.secret {
            let bytes = hex::decode(secret)
                .map_err(|_| Error::Config("session.secret is not hex".to_string()))?;
            if bytes.len() < 16 {
                return Err(Error::Config(
                    "session.secret must be at least 128 bits".to_string(),
                ));
            }
        }
        if let Some(issuer) = match self.auth.issuer.as_str() {
            "generic" | "basic" | "token" => None,
            other => Some(other),
        } {
            return Err(Error::Config(format!("unknown auth issuer '{issuer}'")));
        }
        Ok(())
    }

    /// Mount point normalized to begin and end with '/'.
    #[must_use]
    pub fn mount_point(&self) -> String {
        normalize_mount_point(&self.streamer.mount_point)
    }
}

/// Surround a mount point with '/' on both ends.
#[must_use]
pub fn normalize_mount_point(mount: &str) -> String {
    let mut mount = mount.to_string();
    if !mount.starts_with('/') {
        mount.insert(0, '/');
    }
    if !mount.ends_with('/') {
        mount.push('/');
    }
    mount
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.hls.window, 5);
        assert_eq!(config.auth.keepalive_interval_secs, 1200);
        assert_eq!(config.session.timeout_secs, 900);
    }

    #[test]
    fn test_mount_point_normalization() {
        assert_eq!(normalize_mount_point("live"), "/live/");
        assert_eq!(normalize_mount_point("/live"), "/live/");
        assert_eq!(normalize_mount_point("live/"), "/live/");
        assert_eq!(normalize_mount_point("/live/"), "/live/");
    }

    #[test]
    fn test_slave_mode_requires_socket() {
        let mut config = Config::default();
        config.streamer.mode = "slave".to_string();
        assert!(config.validate().is_err());
        config.streamer.porter_socket_path = Some("/tmp/porter.sock".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_short_secret_rejected() {
        let mut config = Config::default();
        config.session.secret = Some("abcd".to_string());
        assert!(config.validate().is_err());
        config.session.secret = Some("00112233445566778899aabbccddeeff".to_string());
        assert!(config.validate().is_ok());
    }
}
