//! Ingest / metadata service.
//!
//! Accepts task submissions over HTTP, keeps the upstream API token fresh,
//! resolves link metadata asynchronously, and wakes the scheduler over
//! loopback UDP when a task becomes `ready`.

pub mod context;
pub mod error;
pub mod handlers;
pub mod metadata;
pub mod routes;
pub mod search_cache;
pub mod token;
pub mod wake;

pub use context::{AppState, IngestContext};
pub use error::HttpError;
pub use routes::create_router;
pub use token::TokenManager;
