//! Geospatial request services.
//!
//! Each public method backs one HTTP endpoint: it validates the request,
//! resolves the satellite through the catalog, builds the expression graph
//! with `severus_core`, and evaluates it through the configured [`Engine`].
//! Request bodies use the web client's camelCase field names.

use chrono::{NaiveDate, Utc};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use severus_core::catalog::{self, SatelliteProfile, SpectralIndex};
use severus_core::composite::{
    build_composite, build_index_composite, parse_timeseries, source_collection, timeseries_expr,
    trajectory_expr, trajectory_from_values, trajectory_windows, DateWindow, Reduction,
    TimeseriesPoint, Trajectory,
};
use severus_core::engine::{ByteStream, Engine, EngineError, VisParams};
use severus_core::expr::{FeatureCollection, Geometry};
use severus_core::severity::{
    class_area_expr, class_count_expr, compute_severity, SegmentationParams, SeverityLayer,
    SeverityLayers, SeverityStats,
};

use crate::config::{BurnedAreaTable, EarthEngineConfig};

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    /// Missing or malformed request parameters.
    #[error("{0}")]
    InvalidInput(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

fn invalid(message: impl std::fmt::Display) -> AnalysisError {
    AnalysisError::InvalidInput(message.to_string())
}

fn required<'a, T>(value: &'a Option<T>, field: &str) -> Result<&'a T, AnalysisError> {
    value
        .as_ref()
        .ok_or_else(|| invalid(format!("missing parameter: {}", field)))
}

fn parse_satellite(label: &Option<String>) -> Result<&'static SatelliteProfile, AnalysisError> {
    let label = required(label, "satellite")?;
    catalog::lookup(label).ok_or_else(|| invalid(format!("unsupported satellite: {}", label)))
}

fn parse_index(index: &Option<String>) -> Result<SpectralIndex, AnalysisError> {
    required(index, "index")?.parse().map_err(invalid)
}

fn parse_window(start: &Option<String>, end: &Option<String>, names: [&str; 2]) -> Result<DateWindow, AnalysisError> {
    DateWindow::parse(required(start, names[0])?, required(end, names[1])?).map_err(invalid)
}

fn parse_geometry(value: &Option<Value>) -> Result<Geometry, AnalysisError> {
    Geometry::from_geojson(required(value, "geometry")?).map_err(invalid)
}

/// Accept `16` as well as `"16"`.
fn positive_integer(value: &Option<Value>, field: &str) -> Result<u32, AnalysisError> {
    let parsed = match required(value, field)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    parsed
        .and_then(|n| u32::try_from(n).ok())
        .filter(|n| *n > 0)
        .ok_or_else(|| invalid(format!("{} must be a positive integer", field)))
}

/// Integer years stay integers so they compare equal to numeric properties.
fn year_value(value: &Option<Value>) -> Result<Value, AnalysisError> {
    match required(value, "year")? {
        Value::Number(n) => Ok(Value::Number(n.clone())),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| invalid(format!("invalid year: {}", s))),
        other => Err(invalid(format!("invalid year: {}", other))),
    }
}

/// Pre/post windows shared by the severity endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeverityRequest {
    pub satellite: Option<String>,
    pub pre_start: Option<String>,
    pub pre_end: Option<String>,
    pub post_start: Option<String>,
    pub post_end: Option<String>,
    pub geometry: Option<Value>,
    #[serde(default)]
    pub apply_segmentation: bool,
    #[serde(default, rename = "segmentationParams", alias = "segmParams")]
    pub segmentation_params: Option<SegmentationParams>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MapLayer {
    pub name: String,
    pub tile_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SeverityMaps {
    pub maps: Vec<MapLayer>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrajectoryRequest {
    pub satellite: Option<String>,
    pub index: Option<String>,
    pub fire_date: Option<String>,
    pub window_size: Option<Value>,
    pub geometry: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexWindowRequest {
    pub satellite: Option<String>,
    pub index: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub geometry: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    #[serde(rename = "type")]
    pub layer: Option<String>,
    /// Exterior ring of `[lon, lat]` pairs, used when `geometry` is absent.
    pub region: Option<Vec<[f64; 2]>>,
    #[serde(flatten)]
    pub severity: SeverityRequest,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BurnedAreasRequest {
    pub dataset: Option<String>,
    pub year: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MapperRequest {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub dataset: Option<String>,
    pub year: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageList {
    pub pre_image_ids: Vec<String>,
    pub post_image_ids: Vec<String>,
}

pub struct GeoTiffDownload {
    pub filename: String,
    pub stream: ByteStream,
}

/// Palette and stretch for a single-index composite.
pub fn composite_vis(profile: &SatelliteProfile, index: SpectralIndex) -> VisParams {
    let stretch = profile.stretch(index);
    VisParams::new(stretch.min, stretch.max, stretch.palette)
}

pub struct GeoService {
    engine: Arc<dyn Engine>,
    config: EarthEngineConfig,
    today: Option<NaiveDate>,
}

impl GeoService {
    pub fn new(engine: Arc<dyn Engine>, config: EarthEngineConfig) -> Self {
        Self {
            engine,
            config,
            today: None,
        }
    }

    /// Pin "today" for trajectory windows.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| Utc::now().date_naive())
    }

    fn burned_area_table(&self, dataset: &Option<String>) -> Result<&BurnedAreaTable, AnalysisError> {
        let dataset = required(dataset, "dataset")?;
        match dataset.trim().to_ascii_uppercase().as_str() {
            "ICNF" => Ok(&self.config.burned_areas.icnf),
            "EFFIS" => Ok(&self.config.burned_areas.effis),
            _ => Err(invalid(format!("invalid dataset: {} (expected ICNF or EFFIS)", dataset))),
        }
    }

    async fn severity_layers(
        &self,
        req: &SeverityRequest,
        geometry: &Geometry,
    ) -> Result<(&'static SatelliteProfile, SeverityLayers), AnalysisError> {
        let profile = parse_satellite(&req.satellite)?;
        let pre_window = parse_window(&req.pre_start, &req.pre_end, ["preStart", "preEnd"])?;
        let post_window = parse_window(&req.post_start, &req.post_end, ["postStart", "postEnd"])?;
        let segmentation = if req.apply_segmentation {
            let params = req.segmentation_params.unwrap_or_default();
            params.validate().map_err(invalid)?;
            Some(params)
        } else {
            None
        };

        let engine = self.engine.as_ref();
        let pre = build_index_composite(engine, profile, SpectralIndex::Nbr, geometry, &pre_window).await?;
        let post = build_index_composite(engine, profile, SpectralIndex::Nbr, geometry, &post_window).await?;
        Ok((profile, compute_severity(&pre, &post, geometry, segmentation.as_ref())))
    }

    /// Tile URLs for dNBR, RdNBR, RBR and the severity classes.
    pub async fn severity_maps(&self, req: &SeverityRequest) -> Result<SeverityMaps, AnalysisError> {
        let geometry = parse_geometry(&req.geometry)?;
        let (profile, layers) = self.severity_layers(req, &geometry).await?;

        let maps = try_join_all(SeverityLayer::ALL.iter().map(|&layer| {
            let layers = &layers;
            async move {
                let tile_url = self
                    .engine
                    .map_tile_url(layers.layer(layer), &layer.vis_params())
                    .await?;
                Ok::<_, EngineError>(MapLayer {
                    name: layer.name().to_string(),
                    tile_url,
                })
            }
        }))
        .await?;

        tracing::info!(satellite = profile.key, segmented = req.apply_segmentation, "severity maps ready");
        Ok(SeverityMaps { maps })
    }

    /// Hectares per severity class.
    pub async fn severity_stats(&self, req: &SeverityRequest) -> Result<SeverityStats, AnalysisError> {
        let geometry = parse_geometry(&req.geometry)?;
        let (profile, layers) = self.severity_layers(req, &geometry).await?;
        let areas_expr = class_area_expr(&layers.severity, &geometry, profile.pixel_scale);
        let counts_expr = class_count_expr(&layers.severity, &geometry, profile.pixel_scale);
        let (areas, counts) = futures::try_join!(
            self.engine.compute_value(&areas_expr),
            self.engine.compute_value(&counts_expr)
        )?;
        Ok(SeverityStats::from_results(&areas, &counts)?)
    }

    /// Index change per rolling window since the fire.
    pub async fn severity_trajectory(&self, req: &TrajectoryRequest) -> Result<Trajectory, AnalysisError> {
        let profile = parse_satellite(&req.satellite)?;
        let index = parse_index(&req.index)?;
        let geometry = parse_geometry(&req.geometry)?;
        let window_days = positive_integer(&req.window_size, "windowSize")?;
        let fire_date = NaiveDate::parse_from_str(required(&req.fire_date, "fireDate")?.trim(), "%Y-%m-%d")
            .map_err(|_| invalid("fireDate must be YYYY-MM-DD"))?;
        let windows = trajectory_windows(fire_date, window_days, self.today()).map_err(invalid)?;

        let result = self
            .engine
            .compute_value(&trajectory_expr(profile, index, &geometry, &windows))
            .await?;
        let values: Vec<Option<f64>> = result
            .as_array()
            .ok_or_else(|| EngineError::Decode("trajectory result is not a list".to_string()))?
            .iter()
            .map(Value::as_f64)
            .collect();
        Ok(trajectory_from_values(&values, window_days))
    }

    /// Regional mean of the index for every image in the window.
    pub async fn timeseries(&self, req: &IndexWindowRequest) -> Result<Vec<TimeseriesPoint>, AnalysisError> {
        let profile = parse_satellite(&req.satellite)?;
        let index = parse_index(&req.index)?;
        let window = parse_window(&req.start_date, &req.end_date, ["startDate", "endDate"])?;
        let geometry = parse_geometry(&req.geometry)?;

        let result = self
            .engine
            .compute_value(&timeseries_expr(profile, index, &geometry, &window))
            .await?;
        Ok(parse_timeseries(&result)?)
    }

    /// Mean composite tile, clipped to the geometry or the default region.
    pub async fn composite_image(&self, req: &IndexWindowRequest) -> Result<String, AnalysisError> {
        let profile = parse_satellite(&req.satellite)?;
        let index = parse_index(&req.index)?;
        let window = parse_window(&req.start_date, &req.end_date, ["startDate", "endDate"])?;
        let geometry = match &req.geometry {
            Some(value) => Geometry::from_geojson(value).map_err(invalid)?,
            None => Geometry::polygon(&self.config.region_of_interest).map_err(invalid)?,
        };

        let composite = build_composite(
            self.engine.as_ref(),
            profile,
            index,
            &geometry,
            &window,
            Reduction::Mean,
        )
        .await?
        .clip(&geometry);
        Ok(self
            .engine
            .map_tile_url(&composite, &composite_vis(profile, index))
            .await?)
    }

    /// Distinct image ids in the pre and post windows.
    pub async fn image_list(&self, req: &SeverityRequest) -> Result<ImageList, AnalysisError> {
        let profile = parse_satellite(&req.satellite)?;
        let pre_window = parse_window(&req.pre_start, &req.pre_end, ["preStart", "preEnd"])?;
        let post_window = parse_window(&req.post_start, &req.post_end, ["postStart", "postEnd"])?;
        let geometry = parse_geometry(&req.geometry)?;

        let pre_expr = source_collection(profile, &geometry, &pre_window).aggregate_array("system:index");
        let post_expr = source_collection(profile, &geometry, &post_window).aggregate_array("system:index");
        let (pre, post) = futures::try_join!(
            self.engine.compute_value(&pre_expr),
            self.engine.compute_value(&post_expr)
        )?;
        Ok(ImageList {
            pre_image_ids: distinct_strings(&pre)?,
            post_image_ids: distinct_strings(&post)?,
        })
    }

    /// GeoTIFF export of one severity layer.
    pub async fn download(&self, req: &DownloadRequest) -> Result<GeoTiffDownload, AnalysisError> {
        let layer: SeverityLayer = required(&req.layer, "type")?.parse().map_err(invalid)?;
        let geometry = match (&req.severity.geometry, &req.region) {
            (Some(value), _) => Geometry::from_geojson(value).map_err(invalid)?,
            (None, Some(ring)) => Geometry::polygon(ring).map_err(invalid)?,
            (None, None) => return Err(invalid("missing parameter: geometry or region")),
        };
        let (profile, layers) = self.severity_layers(&req.severity, &geometry).await?;
        let stream = self
            .engine
            .download_geotiff(layers.layer(layer), &geometry, profile.pixel_scale)
            .await?;
        let filename = format!("{}_{}.tif", layer.name(), Utc::now().format("%Y%m%dT%H%M%SZ"));
        tracing::info!(%filename, satellite = profile.key, "GeoTIFF download");
        Ok(GeoTiffDownload { filename, stream })
    }

    /// Burned-area polygons of one dataset and year, as GeoJSON.
    pub async fn burned_areas(&self, req: &BurnedAreasRequest) -> Result<Value, AnalysisError> {
        let table = self.burned_area_table(&req.dataset)?;
        let year = year_value(&req.year)?;
        let collection = FeatureCollection::load(&table.asset).filter_eq(&table.year_field, year);
        Ok(self.engine.compute_value(collection.expr()).await?)
    }

    /// First burned-area feature containing the clicked point.
    pub async fn mapper(&self, req: &MapperRequest) -> Result<Value, AnalysisError> {
        let lat = *required(&req.lat, "lat")?;
        let lon = *required(&req.lon, "lon")?;
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
            return Err(invalid("lat/lon out of range"));
        }
        let table = self.burned_area_table(&req.dataset)?;
        let year = year_value(&req.year)?;
        let feature = self
            .engine
            .compute_value(
                &FeatureCollection::load(&table.asset)
                    .filter_eq(&table.year_field, year)
                    .filter_bounds(&Geometry::point(lon, lat))
                    .first(),
            )
            .await?;
        if feature.is_null() {
            return Err(AnalysisError::NotFound("Nenhuma área encontrada".to_string()));
        }
        Ok(feature)
    }
}

fn distinct_strings(value: &Value) -> Result<Vec<String>, EngineError> {
    let items = value
        .as_array()
        .ok_or_else(|| EngineError::Decode("expected a list of image ids".to_string()))?;
    let mut out: Vec<String> = Vec::with_capacity(items.len());
    for id in items.iter().filter_map(Value::as_str) {
        if !out.iter().any(|seen| seen == id) {
            out.push(id.to_string());
        }
    }
    Ok(out)
}
