//! Browser-side session extraction over the Chrome DevTools Protocol.
//!
//! - `cdp`: WebSocket client for one target
//! - `launcher`: find, launch or attach to a debuggable browser
//! - `tokens`: login signal and HTML token parsing
//! - `extractor`: the end-to-end cookie and token harvest

pub mod cdp;
pub mod extractor;
pub mod launcher;
pub mod tokens;

pub use cdp::CdpClient;
pub use extractor::{BrowserSessionExtractor, ExtractionResult};
pub use launcher::{normalize_cdp_url, BrowserLease};
pub use tokens::LoginSignal;
