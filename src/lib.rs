//! Boot-disk export and transfer for migrating Compute Engine VMs.
//!
//! [`services::export_service`] turns a VM's boot disk into an exported
//! image object in bucket storage; [`services::transfer_service`] streams
//! that object into a destination volume while [`metrics`] exposes the
//! progress.

pub mod client;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod poll;
pub mod routes;
pub mod services;
