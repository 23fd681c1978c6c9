pub mod bitfield;
pub mod error;
pub mod handshake;
pub mod message;
