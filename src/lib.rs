//! Passkey wallet host runtime.
//!
//! The host lives in an isolated context and talks to the embedding
//! application only through a [`channel::Port`]. Signing runs in worker
//! contexts that hold key material for the lifetime of one session; every
//! signature is gated by a confirmation surface bound to an intent digest.

pub mod channel;
pub mod client;
pub mod config;
pub mod confirm;
pub mod error;
pub mod host;
pub mod observability;
pub mod protocol;
pub mod webauthn;
pub mod worker;

pub use error::{Error, Result};
