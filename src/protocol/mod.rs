//! Wire protocol: app-facing envelopes and worker messages.

pub mod envelope;
pub mod transaction;
pub mod worker;

pub use envelope::{AppMessage, HostRequest, InboundEnvelope, PROTOCOL_VERSION, decode_envelope};
pub use transaction::{ActionArgs, SignedTransaction, TransactionInput};
