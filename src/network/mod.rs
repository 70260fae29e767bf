//! Intra-cluster networking: wire messages, transport seam, framed-TCP
//! client/server, and the bounded broadcast helper.

pub mod bcast;
pub mod client;
pub mod msg;
pub mod server;
pub mod transport;

pub use bcast::{bcast, bcast_collect};
pub use client::TcpTransport;
pub use msg::{decode_message, encode_message, frame_message, ControlMsg, MAX_FRAME_SIZE};
pub use server::ControlServer;
pub use transport::{LoopbackTransport, MsgHandler, Transport};
