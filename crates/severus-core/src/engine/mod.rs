//! Evaluation boundary for expression graphs.
//!
//! Everything upstream of an [`Engine`] only builds [`Expr`] trees. The
//! engine is the single place where a description turns into numbers, map
//! tiles, or exported rasters.

pub mod memory;
mod geotiff;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Serialize;
use serde_json::Value;

use crate::expr::{Expr, Geometry, Image};

/// Chunked body of an exported raster.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, EngineError>>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The filtered collection had no images for the requested window.
    #[error("no images found between {start} and {end}")]
    NoImagesInRange { start: String, end: String },
    #[error("invalid expression: {0}")]
    InvalidExpression(String),
    #[error("imagery engine returned {status}: {message}")]
    Upstream { status: u16, message: String },
    #[error("imagery engine request failed: {0}")]
    Transport(String),
    #[error("unexpected imagery engine response: {0}")]
    Decode(String),
}

/// Linear stretch and color ramp for map tiles.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VisParams {
    pub min: f64,
    pub max: f64,
    pub palette: Vec<String>,
}

impl VisParams {
    pub fn new(min: f64, max: f64, palette: &[&str]) -> Self {
        Self {
            min,
            max,
            palette: palette.iter().map(|c| c.to_string()).collect(),
        }
    }
}

/// A backend able to evaluate expression graphs.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Evaluate an expression to plain JSON (numbers, lists, dictionaries,
    /// GeoJSON features).
    async fn compute_value(&self, expr: &Expr) -> Result<Value, EngineError>;

    /// Register a visualization and return an XYZ tile URL template
    /// containing `{z}`, `{x}` and `{y}` placeholders.
    async fn map_tile_url(&self, image: &Image, vis: &VisParams) -> Result<String, EngineError>;

    /// Export `image` over `region` at `scale` meters as a GeoTIFF.
    async fn download_geotiff(
        &self,
        image: &Image,
        region: &Geometry,
        scale: f64,
    ) -> Result<ByteStream, EngineError>;
}
