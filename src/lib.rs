pub mod config;
pub mod torrent;
