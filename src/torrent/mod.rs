pub mod events;
pub mod metainfo;
pub mod orchestrator;
pub mod peer;
pub mod peers;
pub mod selection;
pub mod session;
pub mod state;
pub mod stats;
pub mod store;
pub mod tracker;
