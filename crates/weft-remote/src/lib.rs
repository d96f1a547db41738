//! Remote delegation: an HTTP client that runs node types on a peer process,
//! and the server that peer runs.

pub mod client;
pub mod protocol;
pub mod routes;
pub mod server;
pub mod sse;
pub mod state;

pub use client::HttpPeer;
pub use protocol::{ExecuteRequest, EVENT_UPDATE};
pub use server::PeerServer;
pub use state::PeerState;
