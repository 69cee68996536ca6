//! # Severus
//!
//! Burn-severity mapping for Portuguese wildfires over Earth Engine imagery,
//! with a retrieval-augmented assistant answering questions from a local
//! document corpus.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌───────────────┐
//! │  HTTP (axum) │──▶│ GeoService   │──▶│ Engine        │
//! │  /severity-* │   │ catalog +    │   │ Earth Engine  │
//! │  /download   │   │ compositor + │   │ REST / memory │
//! └──────┬───────┘   │ severity     │   └───────────────┘
//!        │           └──────────────┘
//!        ▼
//! ┌──────────────┐   ┌──────────────┐   ┌───────────────┐
//! │  /chat       │──▶│ Retriever    │──▶│ embeddings    │
//! │  /rag/*      │   │ cosine top-k │   │ cache (JSON)  │
//! └──────┬───────┘   └──────────────┘   └───────▲───────┘
//!        ▼                                      │
//! ┌──────────────┐                      ┌───────┴───────┐
//! │ OpenRouter   │                      │ severus ingest│
//! └──────────────┘                      └───────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! severus ingest                 # extract, chunk and embed ./static/docs
//! severus search "o que é o dNBR?"
//! severus serve                  # start the HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`embedding`] | Embedding providers (OpenAI-compatible, Ollama, fastembed) |
//! | [`extract`] | PDF / DOCX / text extraction |
//! | [`ingest`] | Corpus ingestion into the embeddings cache |
//! | [`corpus`] | In-memory document cache and retrieval |
//! | [`chat`] | Retrieval-augmented chat with retry and fallback |
//! | [`gee`] | Earth Engine REST client |
//! | [`analysis`] | Geospatial request services |
//! | [`server`] | HTTP server |

pub mod analysis;
pub mod chat;
pub mod config;
pub mod corpus;
pub mod embedding;
pub mod extract;
pub mod gee;
pub mod ingest;
pub mod server;
