pub mod handshake;
pub mod io;
pub mod keep_alive;
pub mod link;
pub mod listener;
pub mod tcp;
