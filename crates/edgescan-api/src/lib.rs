//! EdgeScan REST surface
//!
//! Localhost-only HTTP API over the scan engine. No authentication is
//! performed; the listener binds 127.0.0.1 and the CLI refuses anything
//! else without an explicit override.
//!
//! - [`state`]: shared application state handed to every handler
//! - [`routes`]: the endpoint table and handlers
//! - [`export`]: base64 / Clash YAML / sing-box JSON encoders
//! - [`subscription`]: subscription URL fetching and decoding

pub mod export;
pub mod routes;
pub mod state;
pub mod subscription;

pub use routes::router;
pub use state::AppState;
