pub mod bouncer;
pub mod config;
pub mod error;
pub mod httpauth;
pub mod keycard;
pub mod logging;
pub mod session;
pub mod token;

pub use config::Config;
pub use error::{Error, Result};
pub use keycard::{Credentials, Keycard, KeycardState};
pub use token::{CookieState, TokenCodec, COOKIE_NAME};
