#![forbid(unsafe_code)]

//! Video hosting backend: upload lifecycle, metadata document, blob storage
//! and the HTTP API over them.
//!
//! The binaries (`backend`, `reconcile`) are thin wrappers around this crate.

pub mod api;
pub mod config;
pub mod error;
pub mod metadata;
pub mod reconcile;
pub mod storage;
pub mod thumbnail;
pub mod uploads;
pub mod videos;
