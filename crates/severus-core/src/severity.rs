//! Burn-severity derivation from pre- and post-fire NBR composites.
//!
//! The per-pixel formulas are expressed twice: as scalar functions used by
//! reports and tests, and as [`Image`] expressions evaluated by an engine.
//! Both follow the same breakpoints.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::engine::{EngineError, VisParams};
use crate::expr::{Expr, Geometry, Image, Reducer};

/// Upper bounds of classes 1 to 4; anything above the last is class 5.
pub const SEVERITY_BREAKS: [f64; 4] = [0.1, 0.27, 0.44, 0.66];

/// Offset added to the pre-fire index in the RBR denominator.
pub const RBR_OFFSET: f64 = 1.001;

/// Largest region `connectedPixelCount` can measure.
pub const MAX_CONNECTED_PIXELS: u32 = 1024;

const DELTA_PALETTE: [&str; 3] = ["b6cdff", "efcc4b", "c03838"];
const CLASS_PALETTE: [&str; 5] = ["3385ff", "ffff4d", "ff8000", "b30000", "330000"];

/// Severity class of a dNBR value, or `None` when it is undefined.
///
/// A value exactly on a breakpoint belongs to the lower class.
pub fn classify(delta: f64) -> Option<u8> {
    if delta.is_nan() {
        return None;
    }
    let above = SEVERITY_BREAKS.iter().filter(|b| delta > **b).count();
    Some(above as u8 + 1)
}

pub fn delta(pre: f64, post: f64) -> f64 {
    pre - post
}

/// Relativized dNBR. Unbounded as `pre` approaches zero.
pub fn rdnbr(pre: f64, post: f64) -> f64 {
    delta(pre, post) / pre.abs().sqrt()
}

/// Relative burn ratio.
pub fn rbr(pre: f64, post: f64) -> f64 {
    delta(pre, post) / (pre + RBR_OFFSET)
}

/// Denoising applied to the derived layers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentationParams {
    /// Focal median radius in pixels.
    #[serde(default = "default_kernel")]
    pub kernel: f64,
    /// Minimum smoothed dNBR.
    #[serde(default = "default_dnbr")]
    pub dnbr: f64,
    /// Minimum smoothed change-vector magnitude.
    #[serde(default = "default_cva")]
    pub cva: f64,
    /// Minimum patch size in pixels.
    #[serde(default = "default_min_pix")]
    pub min_pix: u32,
}

fn default_kernel() -> f64 {
    3.0
}

fn default_dnbr() -> f64 {
    0.1
}

fn default_cva() -> f64 {
    0.05
}

fn default_min_pix() -> u32 {
    100
}

impl Default for SegmentationParams {
    fn default() -> Self {
        Self {
            kernel: default_kernel(),
            dnbr: default_dnbr(),
            cva: default_cva(),
            min_pix: default_min_pix(),
        }
    }
}

impl SegmentationParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.kernel.is_finite() && self.kernel > 0.0) {
            bail!("segmentation kernel must be a positive number of pixels");
        }
        if !self.dnbr.is_finite() || !self.cva.is_finite() {
            bail!("segmentation thresholds must be finite numbers");
        }
        if self.min_pix == 0 {
            bail!("segmentation minPix must be at least 1");
        }
        Ok(())
    }
}

/// One of the four derived layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SeverityLayer {
    #[serde(rename = "dNBR")]
    Dnbr,
    #[serde(rename = "RdNBR")]
    Rdnbr,
    #[serde(rename = "RBR")]
    Rbr,
    Severity,
}

impl SeverityLayer {
    pub const ALL: [SeverityLayer; 4] = [
        SeverityLayer::Dnbr,
        SeverityLayer::Rdnbr,
        SeverityLayer::Rbr,
        SeverityLayer::Severity,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SeverityLayer::Dnbr => "dNBR",
            SeverityLayer::Rdnbr => "RdNBR",
            SeverityLayer::Rbr => "RBR",
            SeverityLayer::Severity => "Severity",
        }
    }

    pub fn vis_params(self) -> VisParams {
        match self {
            SeverityLayer::Dnbr => VisParams::new(0.0, 0.85, &DELTA_PALETTE),
            SeverityLayer::Rdnbr => VisParams::new(-0.5, 1.5, &DELTA_PALETTE),
            SeverityLayer::Rbr => VisParams::new(0.0, 0.6, &DELTA_PALETTE),
            SeverityLayer::Severity => VisParams::new(1.0, 5.0, &CLASS_PALETTE),
        }
    }
}

impl fmt::Display for SeverityLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SeverityLayer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        SeverityLayer::ALL
            .into_iter()
            .find(|layer| layer.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                anyhow::anyhow!("unknown layer type: {} (expected dNBR, RdNBR, RBR or Severity)", s)
            })
    }
}

/// The four co-registered severity rasters.
#[derive(Debug, Clone, PartialEq)]
pub struct SeverityLayers {
    pub dnbr: Image,
    pub rdnbr: Image,
    pub rbr: Image,
    pub severity: Image,
}

impl SeverityLayers {
    pub fn layer(&self, layer: SeverityLayer) -> &Image {
        match layer {
            SeverityLayer::Dnbr => &self.dnbr,
            SeverityLayer::Rdnbr => &self.rdnbr,
            SeverityLayer::Rbr => &self.rbr,
            SeverityLayer::Severity => &self.severity,
        }
    }

    fn map(self, f: impl Fn(Image) -> Image) -> Self {
        Self {
            dnbr: f(self.dnbr),
            rdnbr: f(self.rdnbr),
            rbr: f(self.rbr),
            severity: f(self.severity),
        }
    }
}

/// Classes 1 to 5 from a dNBR image, higher breakpoints applied last.
pub fn classify_image(dnbr: &Image) -> Image {
    let mut classes = dnbr.where_value(&dnbr.lte(SEVERITY_BREAKS[0]), 1.0);
    for (i, bound) in SEVERITY_BREAKS.iter().enumerate() {
        classes = classes.where_value(&dnbr.gt(*bound), (i + 2) as f64);
    }
    classes.rename(SeverityLayer::Severity.name()).to_int16()
}

/// Mask keeping changed patches of at least `min_pix` pixels.
///
/// Patch sizes saturate at [`MAX_CONNECTED_PIXELS`], so a larger `min_pix`
/// masks everything.
pub fn segmentation_mask(pre: &Image, post: &Image, dnbr: &Image, params: &SegmentationParams) -> Image {
    let delta_mask = dnbr.focal_median(params.kernel).gte(params.dnbr);
    let cva = pre
        .subtract(post)
        .pow(2.0)
        .reduce(Reducer::sum())
        .sqrt();
    let cva_mask = cva.focal_median(params.kernel).gte(params.cva);
    delta_mask
        .and(&cva_mask)
        .self_mask()
        .connected_pixel_count(params.min_pix.min(MAX_CONNECTED_PIXELS), true)
        .gte(f64::from(params.min_pix))
}

/// Derive dNBR, RdNBR, RBR and classes, optionally segmented, clipped to
/// `geometry`.
pub fn compute_severity(
    pre: &Image,
    post: &Image,
    geometry: &Geometry,
    segmentation: Option<&SegmentationParams>,
) -> SeverityLayers {
    let dnbr = pre.subtract(post).rename(SeverityLayer::Dnbr.name());
    let rdnbr = dnbr
        .divide(pre.abs().sqrt())
        .rename(SeverityLayer::Rdnbr.name());
    let rbr = dnbr
        .divide(pre.add(RBR_OFFSET))
        .rename(SeverityLayer::Rbr.name());
    let severity = classify_image(&dnbr);

    let mut layers = SeverityLayers {
        dnbr,
        rdnbr,
        rbr,
        severity,
    };
    if let Some(params) = segmentation {
        let mask = segmentation_mask(pre, post, &layers.dnbr, params);
        layers = layers.map(|img| img.update_mask(&mask));
    }
    layers.map(|img| img.clip(geometry))
}

/// Hectares per severity class over `geometry`.
pub fn class_area_expr(severity: &Image, geometry: &Geometry, scale: f64) -> Expr {
    Image::pixel_area()
        .divide(10_000.0)
        .add_bands(severity)
        .reduce_region(Reducer::sum().group(1, "class"), geometry, scale)
}

/// Pixel count per severity class over `geometry`.
pub fn class_count_expr(severity: &Image, geometry: &Geometry, scale: f64) -> Expr {
    Expr::dict_get(
        severity.reduce_region(Reducer::frequency_histogram(), geometry, scale),
        SeverityLayer::Severity.name(),
        Expr::dict(std::iter::empty::<(&str, Expr)>()),
    )
}

/// Area summary of a classified severity raster.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeverityStats {
    pub total_area: f64,
    pub class_totals: Map<String, Value>,
    pub max_class_total: f64,
    pub pixel_counts: Map<String, Value>,
}

impl SeverityStats {
    /// Build from the grouped area reduction and the class histogram.
    pub fn from_results(areas: &Value, counts: &Value) -> Result<Self, EngineError> {
        let groups = areas
            .get("groups")
            .and_then(Value::as_array)
            .ok_or_else(|| EngineError::Decode("class areas have no groups".into()))?;
        let mut class_totals = Map::new();
        let mut total_area = 0.0;
        let mut max_class_total: f64 = 0.0;
        for group in groups {
            let (Some(class), Some(area)) = (
                group.get("class").and_then(Value::as_f64),
                group.get("sum").and_then(Value::as_f64),
            ) else {
                continue;
            };
            class_totals.insert(format!("{}", class as i64), Value::from(area));
            total_area += area;
            max_class_total = max_class_total.max(area);
        }
        Ok(Self {
            total_area,
            class_totals,
            max_class_total,
            pixel_counts: counts.as_object().cloned().unwrap_or_default(),
        })
    }
}
