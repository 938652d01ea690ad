//! Browser automation surface
//!
//! Thin wrapper around Chromium via the DevTools protocol. The rest of the
//! crate only consumes the narrow `BrowserSession` interface: navigate,
//! extract links, scroll, title, close.

mod errors;
mod session;

pub use errors::BrowserError;
pub use session::{BrowserSession, BrowserSessionConfig, USER_AGENTS};
