//! moustique_transport
//!
//! HTTP surface of the broker: the axum router and handlers, the decoded
//! parameter extractor, tenant resolution, the credential store, and the
//! peer allowlist. Every parameter value and every JSON response body passes
//! through the obfuscation codec from `moustique_utils`.

pub mod auth;
pub mod http;
pub mod security;

pub use auth::UserAuth;
pub use http::{build_router, file_version, serve, AppState, ServerOptions};
pub use security::PeerAllowlist;
