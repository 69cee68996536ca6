//! Index compositing: cloud-masked, rescaled, per-pixel temporal composites
//! of a spectral index, plus the per-image and per-window reductions built
//! on the same collection.

use std::fmt;

use anyhow::{bail, Result};
use chrono::{Duration, NaiveDate};
use serde::Serialize;
use serde_json::Value;

use crate::catalog::{CloudMask, Rescale, SatelliteProfile, SpectralIndex};
use crate::engine::{Engine, EngineError};
use crate::expr::{feature_without_geometry, Expr, Geometry, Image, ImageCollection, Reducer};

/// Half-open acquisition window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start >= end {
            bail!("date window must end after it starts ({} .. {})", start, end);
        }
        Ok(Self { start, end })
    }

    /// Parse two `YYYY-MM-DD` strings.
    pub fn parse(start: &str, end: &str) -> Result<Self> {
        let parse = |s: &str| {
            NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                .map_err(|_| anyhow::anyhow!("invalid date '{}' (expected YYYY-MM-DD)", s))
        };
        Self::new(parse(start)?, parse(end)?)
    }

    fn bounds(&self) -> (String, String) {
        (
            self.start.format("%Y-%m-%d").to_string(),
            self.end.format("%Y-%m-%d").to_string(),
        )
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Temporal reducer for a composite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reduction {
    #[default]
    Median,
    Mean,
}

/// Raw images of `profile` over `geometry` within `window`.
pub fn source_collection(
    profile: &SatelliteProfile,
    geometry: &Geometry,
    window: &DateWindow,
) -> ImageCollection {
    let (start, end) = window.bounds();
    ImageCollection::load(profile.collection_id)
        .filter_bounds(geometry)
        .filter_date(&start, &end)
}

/// Drop pixels flagged by the profile's quality band.
pub fn apply_cloud_mask(profile: &SatelliteProfile, image: &Image) -> Image {
    match profile.cloud_mask {
        Some(CloudMask::QaBits { band, bits }) => {
            let qa = image.select(&[band]);
            let clear = bits
                .iter()
                .map(|bit| qa.bitwise_and(f64::from(1u32 << bit)).eq(0.0))
                .reduce(|acc, flag| acc.and(&flag));
            match clear {
                Some(clear) => image.update_mask(&clear),
                None => image.clone(),
            }
        }
        None => image.clone(),
    }
}

/// Convert the index bands of `image` from stored values to reflectance.
pub fn apply_rescale(profile: &SatelliteProfile, index: SpectralIndex, image: &Image) -> Image {
    let bands = profile.bands(index).as_array();
    match profile.rescale {
        Some(Rescale::Linear { gain, offset }) => {
            let scaled = image.select(&bands).multiply(gain);
            if offset == 0.0 {
                scaled
            } else {
                scaled.add(offset)
            }
        }
        None => image.select(&bands),
    }
}

/// Mask, rescale, and reduce one raw image to its index band, keeping the
/// acquisition time.
pub fn index_image(profile: &SatelliteProfile, index: SpectralIndex, raw: &Image) -> Image {
    let masked = apply_cloud_mask(profile, raw);
    apply_rescale(profile, index, &masked)
        .normalized_difference(profile.bands(index).as_array())
        .rename(index.band_name())
        .copy_properties(raw, &["system:time_start"])
}

/// Per-image index rasters over the window.
pub fn index_collection(
    profile: &SatelliteProfile,
    index: SpectralIndex,
    geometry: &Geometry,
    window: &DateWindow,
) -> ImageCollection {
    source_collection(profile, geometry, window).map(|img| index_image(profile, index, &img))
}

/// Build the temporal median composite of `index`.
///
/// Fails with [`EngineError::NoImagesInRange`] when nothing was acquired in
/// the window, so callers can report it as an input problem.
pub async fn build_index_composite(
    engine: &dyn Engine,
    profile: &SatelliteProfile,
    index: SpectralIndex,
    geometry: &Geometry,
    window: &DateWindow,
) -> Result<Image, EngineError> {
    build_composite(engine, profile, index, geometry, window, Reduction::Median).await
}

pub async fn build_composite(
    engine: &dyn Engine,
    profile: &SatelliteProfile,
    index: SpectralIndex,
    geometry: &Geometry,
    window: &DateWindow,
    reduction: Reduction,
) -> Result<Image, EngineError> {
    let collection = index_collection(profile, index, geometry, window);
    ensure_not_empty(engine, &collection, window).await?;
    Ok(match reduction {
        Reduction::Median => collection.median(),
        Reduction::Mean => collection.mean(),
    })
}

/// Error unless the collection holds at least one image.
pub async fn ensure_not_empty(
    engine: &dyn Engine,
    collection: &ImageCollection,
    window: &DateWindow,
) -> Result<(), EngineError> {
    let size = engine.compute_value(&collection.size()).await?;
    let count = size
        .as_u64()
        .ok_or_else(|| EngineError::Decode(format!("collection size was {}", size)))?;
    if count == 0 {
        let (start, end) = window.bounds();
        return Err(EngineError::NoImagesInRange { start, end });
    }
    Ok(())
}

/// One regional mean per image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeseriesPoint {
    pub date: String,
    pub value: Option<f64>,
}

/// Features of `{time, value}` with the regional mean of every image.
pub fn timeseries_expr(
    profile: &SatelliteProfile,
    index: SpectralIndex,
    geometry: &Geometry,
    window: &DateWindow,
) -> Expr {
    let band = index.band_name();
    index_collection(profile, index, geometry, window)
        .map_to_features(|img| {
            let stats = img.reduce_region(Reducer::mean(), geometry, profile.pixel_scale);
            feature_without_geometry([
                ("time", img.get("system:time_start")),
                ("value", Expr::dict_get(stats, band, Expr::null())),
            ])
        })
        .expr()
        .clone()
}

/// Decode a computed timeseries into points sorted by acquisition time.
pub fn parse_timeseries(value: &Value) -> Result<Vec<TimeseriesPoint>, EngineError> {
    let features = value
        .get("features")
        .and_then(Value::as_array)
        .ok_or_else(|| EngineError::Decode("timeseries result has no features".into()))?;
    let mut points: Vec<(i64, Option<f64>)> = features
        .iter()
        .filter_map(|f| {
            let props = f.get("properties")?;
            let time = props.get("time")?.as_f64()? as i64;
            Some((time, props.get("value").and_then(Value::as_f64)))
        })
        .collect();
    points.sort_by_key(|(t, _)| *t);
    Ok(points
        .into_iter()
        .filter_map(|(t, value)| {
            let date = chrono::DateTime::from_timestamp_millis(t)?;
            Some(TimeseriesPoint {
                date: date.format("%Y-%m-%d").to_string(),
                value,
            })
        })
        .collect())
}

/// Largest number of rolling windows a trajectory may request.
pub const MAX_TRAJECTORY_WINDOWS: usize = 400;

/// Consecutive windows of `window_days`, starting one window before
/// `fire_date` and ending no later than `today`.
pub fn trajectory_windows(
    fire_date: NaiveDate,
    window_days: u32,
    today: NaiveDate,
) -> Result<Vec<DateWindow>> {
    if window_days == 0 {
        bail!("windowSize must be a positive number of days");
    }
    let step = Duration::days(i64::from(window_days));
    let mut windows = Vec::new();
    let mut start = fire_date - step;
    while start + step <= today {
        if windows.len() == MAX_TRAJECTORY_WINDOWS {
            bail!(
                "windowSize {} yields more than {} windows; use a larger window",
                window_days,
                MAX_TRAJECTORY_WINDOWS
            );
        }
        windows.push(DateWindow {
            start,
            end: start + step,
        });
        start += step;
    }
    if windows.is_empty() {
        bail!("no complete {}-day window between the fire date and today", window_days);
    }
    Ok(windows)
}

/// Regional median of the index composite for each window, as one list.
/// Windows without imagery evaluate to null.
pub fn trajectory_expr(
    profile: &SatelliteProfile,
    index: SpectralIndex,
    geometry: &Geometry,
    windows: &[DateWindow],
) -> Expr {
    Expr::Array(
        windows
            .iter()
            .map(|w| {
                let composite = index_collection(profile, index, geometry, w).median();
                let stats = composite.reduce_region(Reducer::median(), geometry, profile.pixel_scale);
                Expr::dict_get(stats, index.band_name(), Expr::null())
            })
            .collect(),
    )
}

/// Change of each window relative to the first one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trajectory {
    pub days: Vec<u64>,
    pub deltas: Vec<Option<f64>>,
}

pub fn trajectory_from_values(values: &[Option<f64>], window_days: u32) -> Trajectory {
    let base = values.first().copied().flatten();
    Trajectory {
        days: (1..=values.len() as u64)
            .map(|i| i * u64::from(window_days))
            .collect(),
        deltas: values
            .iter()
            .map(|v| match (v, base) {
                (Some(v), Some(b)) => Some(v - b),
                _ => None,
            })
            .collect(),
    }
}
