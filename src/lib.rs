//! Client-side query cache and optimistic mutation core for a social-media
//! client backed by a managed document store.

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod mutation;
pub mod remote;
pub mod telemetry;

pub use client::SocialClient;
pub use error::{MutationError, Operation, RemoteError};
