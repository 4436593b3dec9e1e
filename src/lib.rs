//! Request-interception cache layer.
//!
//! Every outbound read is classified, routed to a caching strategy for its
//! category, and answered from a named store, the network, or generated
//! offline content.

pub mod cache;
pub mod classify;
pub mod config;
pub mod control;
pub mod error;
pub mod fallback;
pub mod interceptor;
pub mod logging;
pub mod metrics;
pub mod network;
pub mod push;
pub mod request;
pub mod retry;
pub mod session;
pub mod strategy;

pub use classify::{Category, Classifier};
pub use config::Config;
pub use control::{ControlChannel, ControlCommand, ControlReply};
pub use error::{CommandError, FetchError};
pub use interceptor::Interceptor;
pub use request::RequestDescriptor;
pub use strategy::Strategy;
