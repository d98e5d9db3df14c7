//! Offline-first sync for LifeLock records.
//!
//! Reads are always served by the local cache ([`db::LocalCache`]). Writes go
//! through [`store::OfflineStore`], which applies them locally and queues an
//! action; [`orchestrator::Orchestrator`] replays the queue against a
//! [`remote::RemoteStore`] using the keys declared in [`sync_map`].

pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod remote;
pub mod store;
pub mod sync_map;
