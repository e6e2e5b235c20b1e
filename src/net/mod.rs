//! Session transport: QUIC endpoints, framed links and the wire vocabulary
//! shared by the broker, clients, managers and workers.

pub mod endpoint;
pub mod error;
pub mod link;
pub mod wire;

pub use endpoint::Endpoint;
pub use link::{Link, LinkRx, LinkTx};
pub use wire::{Directive, Hello, SessionToken};
