pub mod handshake;
mod message;

pub use handshake::{Handshake, HandshakeAction, RecvState, SendState};
pub use message::{HandshakeMessage, MESSAGE_SIZE, MessageKind, RegionDescriptor};
