//! # Severus Core
//!
//! Shared, I/O-free logic for Severus: the satellite catalog, the remote
//! expression graph, index compositing, burn-severity derivation, text
//! chunking, and the embedding similarity search behind the assistant.
//!
//! This crate contains no tokio, HTTP client, or filesystem I/O. All raster
//! work is described as an [`expr::Expr`] graph and only evaluated through an
//! [`engine::Engine`]; the app crate ships the Earth Engine REST
//! implementation, and [`engine::memory::InMemoryEngine`] evaluates the same
//! graphs locally for tests.

pub mod catalog;
pub mod chunk;
pub mod composite;
pub mod embedding;
pub mod engine;
pub mod expr;
pub mod models;
pub mod search;
pub mod severity;
