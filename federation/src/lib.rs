//! Synchronises diagnosis keys between the local backend and the federation
//! gateway.
//!
//! [`handler::handle_upload`] publishes local submissions, and
//! [`handler::handle_download`] ingests keys published by other backends.
//! Both directions keep a checkpoint so that an interrupted invocation
//! resumes where the previous one stopped.

pub mod blob_store;
pub mod checkpoint;
pub mod client;
pub mod clock;
pub mod config;
pub mod context;
pub mod download;
pub mod events;
pub mod handler;
pub mod jws;
pub mod metrics_defs;
pub mod submissions;
pub mod types;
pub mod upload;
pub mod validation;

#[cfg(test)]
mod testutils;
