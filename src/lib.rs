#![forbid(unsafe_code)]

//! Server-side pieces of the tubevault video archive: configuration, the
//! downloader event model, download session plumbing, and metadata storage.
//! The `backend` binary wires these together into the HTTP API.

pub mod config;
pub mod events;
pub mod gc;
pub mod manager;
pub mod metadata;
pub mod registry;
pub mod security;
pub mod session;
