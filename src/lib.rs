//! Caching and request-coalescing core of the TuneHub Subsonic gateway.
//!
//! The outward protocol layer builds a [`Gateway`] with its own
//! [`SourceNormalizer`] and calls it once per client request.

pub mod cache;
pub mod config;
pub mod error;
pub mod gateway;
pub mod refresh;
pub mod sources;
pub mod storage;
pub mod tasks;

pub use config::Config;
pub use error::{GatewayError, Result};
pub use gateway::{Gateway, StreamOutcome};
pub use refresh::RefreshReport;
pub use sources::{AudioFetcher, HttpAudioFetcher, SourceNormalizer};
