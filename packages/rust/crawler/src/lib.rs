//! Canvas course crawler.
//!
//! - [`SourceApi`]: the API boundary; [`CanvasClient`] is the HTTP implementation
//! - [`Handler`]: one variant per resource kind, chosen by [`Handler::for_kind`]
//! - [`Crawler`]: course enumeration and retried per-resource fetching

pub mod client;
pub mod crawler;
pub mod handlers;
pub mod source;

pub use client::CanvasClient;
pub use crawler::{Crawler, FetchPolicy};
pub use handlers::Handler;
pub use source::{Download, SourceApi};
