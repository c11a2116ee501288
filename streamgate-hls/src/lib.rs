pub mod feed;
pub mod handoff;
pub mod playlist;
pub mod resource;
pub mod ring;
pub mod streamer;

pub use feed::FragmentSink;
pub use playlist::PlaylistRenderer;
pub use ring::{FragmentRing, RingError};
pub use streamer::HlsStreamer;
