pub mod client;
mod connection;
pub mod server;
pub mod transport;

pub use client::ClientTransport;
pub use server::ServerTransport;
pub use transport::{Transport, TransportListener, TransportRole};
