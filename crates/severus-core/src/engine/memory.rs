//! In-memory [`Engine`] for testing and offline development.
//!
//! Evaluates the same expression graphs the Earth Engine REST client sends,
//! over small rasters registered per collection id. All rasters share one
//! lon/lat [`Grid`]; masked pixels are `NaN`. Only the algorithms the
//! compositor, the severity calculator, and the request services emit are
//! supported, with Earth Engine's argument names.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::RwLock;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime};
use futures::StreamExt;
use serde_json::{json, Map, Value};

use super::geotiff::{write_geotiff, GeoReference};
use super::{ByteStream, Engine, EngineError, VisParams};
use crate::chunk::content_hash;
use crate::expr::{Expr, Geometry, Image};

/// Regular lon/lat pixel grid; `origin` is the top-left corner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Grid {
    pub origin_lon: f64,
    pub origin_lat: f64,
    pub pixel_deg: f64,
    pub width: usize,
    pub height: usize,
}

impl Grid {
    pub fn new(origin_lon: f64, origin_lat: f64, pixel_deg: f64, width: usize, height: usize) -> Self {
        Self {
            origin_lon,
            origin_lat,
            pixel_deg,
            width,
            height,
        }
    }

    pub fn len(&self) -> usize {
        self.width * self.height
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `[lon, lat]` of the center of pixel `i` (row-major).
    pub fn center(&self, i: usize) -> [f64; 2] {
        let col = (i % self.width) as f64;
        let row = (i / self.width) as f64;
        [
            self.origin_lon + (col + 0.5) * self.pixel_deg,
            self.origin_lat - (row + 0.5) * self.pixel_deg,
        ]
    }

    fn bounds(&self) -> Bounds {
        Bounds {
            min_lon: self.origin_lon,
            max_lon: self.origin_lon + self.width as f64 * self.pixel_deg,
            min_lat: self.origin_lat - self.height as f64 * self.pixel_deg,
            max_lat: self.origin_lat,
        }
    }

    fn cell_contains(&self, i: usize, p: [f64; 2]) -> bool {
        let [lon, lat] = self.center(i);
        let half = self.pixel_deg / 2.0;
        (p[0] - lon).abs() <= half && (p[1] - lat).abs() <= half
    }

    fn pixel_area_m2(&self, i: usize) -> f64 {
        let lat = self.center(i)[1].to_radians();
        (self.pixel_deg * 111_320.0 * lat.cos()) * (self.pixel_deg * 110_540.0)
    }
}

#[derive(Debug, Clone, Copy)]
struct Bounds {
    min_lon: f64,
    max_lon: f64,
    min_lat: f64,
    max_lat: f64,
}

impl Bounds {
    fn overlaps(&self, other: &Bounds) -> bool {
        self.min_lon <= other.max_lon
            && other.min_lon <= self.max_lon
            && self.min_lat <= other.max_lat
            && other.min_lat <= self.max_lat
    }

    fn contains(&self, p: [f64; 2]) -> bool {
        p[0] >= self.min_lon && p[0] <= self.max_lon && p[1] >= self.min_lat && p[1] <= self.max_lat
    }
}

#[derive(Debug, Clone)]
struct Band {
    name: String,
    data: Vec<f64>,
}

/// An evaluated multi-band image.
#[derive(Debug, Clone)]
pub struct Raster {
    grid: Grid,
    bands: Vec<Band>,
    properties: Map<String, Value>,
}

impl Raster {
    fn empty(grid: Grid) -> Self {
        Self {
            grid,
            bands: Vec::new(),
            properties: Map::new(),
        }
    }

    fn single(grid: Grid, name: &str, data: Vec<f64>) -> Self {
        Self {
            grid,
            bands: vec![Band {
                name: name.to_string(),
                data,
            }],
            properties: Map::new(),
        }
    }

    pub fn band_names(&self) -> Vec<&str> {
        self.bands.iter().map(|b| b.name.as_str()).collect()
    }

    pub fn band(&self, name: &str) -> Option<&[f64]> {
        self.bands
            .iter()
            .find(|b| b.name == name)
            .map(|b| b.data.as_slice())
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    /// Pixels with at least one unmasked band.
    pub fn valid_pixels(&self) -> usize {
        (0..self.grid.len())
            .filter(|&i| self.bands.iter().any(|b| !b.data[i].is_nan()))
            .count()
    }

    pub fn is_fully_masked(&self) -> bool {
        self.valid_pixels() == 0
    }

    fn map_values(&self, f: impl Fn(f64) -> f64) -> Raster {
        Raster {
            grid: self.grid,
            bands: self
                .bands
                .iter()
                .map(|b| Band {
                    name: b.name.clone(),
                    data: b.data.iter().map(|&v| if v.is_nan() { v } else { f(v) }).collect(),
                })
                .collect(),
            properties: Map::new(),
        }
    }

    fn describe(&self) -> Value {
        json!({
            "type": "Image",
            "bands": self.band_names(),
            "properties": Value::Object(self.properties.clone()),
        })
    }
}

/// Combine two images band by band, broadcasting single-band operands.
fn zip_images(a: &Raster, b: &Raster, f: impl Fn(f64, f64) -> f64) -> Result<Raster, EngineError> {
    let (na, nb) = (a.bands.len(), b.bands.len());
    if na != nb && na != 1 && nb != 1 {
        return Err(EngineError::InvalidExpression(format!(
            "band count mismatch: {} vs {}",
            na, nb
        )));
    }
    let n = na.max(nb);
    let names_from = if na >= nb { a } else { b };
    let bands = (0..n)
        .map(|k| {
            let ba = &a.bands[if na == 1 { 0 } else { k }];
            let bb = &b.bands[if nb == 1 { 0 } else { k }];
            Band {
                name: names_from.bands[k].name.clone(),
                data: ba
                    .data
                    .iter()
                    .zip(&bb.data)
                    .map(|(&x, &y)| if x.is_nan() || y.is_nan() { f64::NAN } else { f(x, y) })
                    .collect(),
            }
        })
        .collect();
    Ok(Raster {
        grid: a.grid,
        bands,
        properties: Map::new(),
    })
}

fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    })
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

fn number(v: f64) -> Value {
    serde_json::Number::from_f64(v)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Histogram keys the way Earth Engine prints them (`"2"`, `"0.5"`).
fn histogram_key(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{}", v)
    }
}

#[derive(Debug, Clone)]
enum ReducerKind {
    Sum,
    Mean,
    Median,
    Histogram,
    Group {
        inner: Box<ReducerKind>,
        field: usize,
        name: String,
    },
}

impl ReducerKind {
    fn output_name(&self) -> &str {
        match self {
            ReducerKind::Sum => "sum",
            ReducerKind::Mean => "mean",
            ReducerKind::Median => "median",
            ReducerKind::Histogram => "histogram",
            ReducerKind::Group { .. } => "groups",
        }
    }

    fn reduce(&self, values: &mut [f64]) -> Value {
        match self {
            ReducerKind::Sum => number(values.iter().sum()),
            ReducerKind::Mean => mean(values).map(number).unwrap_or(Value::Null),
            ReducerKind::Median => median(values).map(number).unwrap_or(Value::Null),
            ReducerKind::Histogram => {
                let mut counts: BTreeMap<String, u64> = BTreeMap::new();
                for v in values.iter() {
                    *counts.entry(histogram_key(*v)).or_default() += 1;
                }
                json!(counts)
            }
            ReducerKind::Group { inner, .. } => inner.reduce(values),
        }
    }
}

#[derive(Debug, Clone)]
enum Filter {
    Intersects(Shape),
    DateRange(i64, i64),
    Equals(String, Value),
}

/// Parsed GeoJSON geometry.
#[derive(Debug, Clone)]
struct Shape {
    points: Vec<[f64; 2]>,
    lines: Vec<Vec<[f64; 2]>>,
    polygons: Vec<Vec<Vec<[f64; 2]>>>,
    geojson: Value,
}

fn position(v: &Value) -> Result<[f64; 2]> {
    match v.as_array().map(|a| a.as_slice()) {
        Some([x, y, ..]) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => Ok([x, y]),
            _ => bail!("position must hold numbers"),
        },
        _ => bail!("position must be [lon, lat]"),
    }
}

fn positions(v: &Value) -> Result<Vec<[f64; 2]>> {
    v.as_array()
        .ok_or_else(|| anyhow::anyhow!("expected an array of positions"))?
        .iter()
        .map(position)
        .collect()
}

fn array_of<T>(v: &Value, f: impl Fn(&Value) -> Result<T>) -> Result<Vec<T>> {
    v.as_array()
        .ok_or_else(|| anyhow::anyhow!("expected an array"))?
        .iter()
        .map(f)
        .collect()
}

impl Shape {
    fn parse(kind: &str, coordinates: &Value) -> Result<Shape> {
        let mut shape = Shape {
            points: Vec::new(),
            lines: Vec::new(),
            polygons: Vec::new(),
            geojson: json!({ "type": kind, "coordinates": coordinates }),
        };
        match kind {
            "Point" => shape.points.push(position(coordinates)?),
            "MultiPoint" => shape.points = positions(coordinates)?,
            "LineString" => shape.lines.push(positions(coordinates)?),
            "MultiLineString" => shape.lines = array_of(coordinates, positions)?,
            "Polygon" => shape.polygons.push(array_of(coordinates, positions)?),
            "MultiPolygon" => {
                shape.polygons = array_of(coordinates, |p| array_of(p, positions))?
            }
            other => bail!("unsupported geometry type: {}", other),
        }
        Ok(shape)
    }

    fn from_geojson(value: &Value) -> Result<Shape> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("geometry has no type"))?;
        let coordinates = value
            .get("coordinates")
            .ok_or_else(|| anyhow::anyhow!("geometry has no coordinates"))?;
        Shape::parse(kind, coordinates)
    }

    fn all_positions(&self) -> impl Iterator<Item = &[f64; 2]> {
        self.points
            .iter()
            .chain(self.lines.iter().flatten())
            .chain(self.polygons.iter().flatten().flatten())
    }

    fn bounds(&self) -> Bounds {
        let mut b = Bounds {
            min_lon: f64::INFINITY,
            max_lon: f64::NEG_INFINITY,
            min_lat: f64::INFINITY,
            max_lat: f64::NEG_INFINITY,
        };
        for p in self.all_positions() {
            b.min_lon = b.min_lon.min(p[0]);
            b.max_lon = b.max_lon.max(p[0]);
            b.min_lat = b.min_lat.min(p[1]);
            b.max_lat = b.max_lat.max(p[1]);
        }
        b
    }

    fn is_points_only(&self) -> bool {
        self.lines.is_empty() && self.polygons.is_empty()
    }

    fn contains(&self, p: [f64; 2]) -> bool {
        self.polygons.iter().any(|rings| {
            let mut rings = rings.iter();
            match rings.next() {
                Some(outer) => ring_contains(outer, p) && !rings.any(|hole| ring_contains(hole, p)),
                None => false,
            }
        })
    }

    fn covers_pixel(&self, grid: &Grid, i: usize) -> bool {
        self.contains(grid.center(i))
            || self.points.iter().any(|p| grid.cell_contains(i, *p))
            || self
                .lines
                .iter()
                .flatten()
                .any(|p| grid.cell_contains(i, *p))
    }

    fn intersects(&self, other: &Shape) -> bool {
        if self.is_points_only() {
            self.points.iter().any(|p| other.contains(*p))
        } else if other.is_points_only() {
            other.points.iter().any(|p| self.contains(*p))
        } else {
            self.bounds().overlaps(&other.bounds())
        }
    }

    fn intersects_bounds(&self, bounds: &Bounds) -> bool {
        if self.is_points_only() {
            self.points.iter().any(|p| bounds.contains(*p))
        } else {
            self.bounds().overlaps(bounds)
        }
    }
}

fn ring_contains(ring: &[[f64; 2]], p: [f64; 2]) -> bool {
    let mut inside = false;
    let n = ring.len();
    if n < 3 {
        return false;
    }
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = (ring[i][0], ring[i][1]);
        let (xj, yj) = (ring[j][0], ring[j][1]);
        if (yi > p[1]) != (yj > p[1]) && p[0] < (xj - xi) * (p[1] - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Evaluated value of an expression node.
#[derive(Debug, Clone)]
enum Val {
    Json(Value),
    Image(Raster),
    Images(Vec<Raster>),
    Feature(Value),
    Features(Vec<Value>),
    Geometry(Shape),
    Filter(Filter),
    Reducer(ReducerKind),
    DateRange(i64, i64),
    List(Vec<Val>),
    Dict(BTreeMap<String, Val>),
    Function(Vec<String>, Expr),
}

impl Val {
    fn kind(&self) -> &'static str {
        match self {
            Val::Json(_) => "value",
            Val::Image(_) => "Image",
            Val::Images(_) => "ImageCollection",
            Val::Feature(_) => "Feature",
            Val::Features(_) => "FeatureCollection",
            Val::Geometry(_) => "Geometry",
            Val::Filter(_) => "Filter",
            Val::Reducer(_) => "Reducer",
            Val::DateRange(..) => "DateRange",
            Val::List(_) => "List",
            Val::Dict(_) => "Dictionary",
            Val::Function(..) => "Function",
        }
    }

    fn to_json(&self) -> Result<Value, EngineError> {
        Ok(match self {
            Val::Json(v) => v.clone(),
            Val::List(items) => Value::Array(
                items
                    .iter()
                    .map(Val::to_json)
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            Val::Dict(entries) => {
                let mut out = Map::new();
                for (k, v) in entries {
                    out.insert(k.clone(), v.to_json()?);
                }
                Value::Object(out)
            }
            Val::Image(r) => r.describe(),
            Val::Images(rs) => json!({
                "type": "ImageCollection",
                "features": rs.iter().map(Raster::describe).collect::<Vec<_>>(),
            }),
            Val::Feature(f) => f.clone(),
            Val::Features(fs) => json!({ "type": "FeatureCollection", "features": fs }),
            Val::Geometry(s) => s.geojson.clone(),
            other => {
                return Err(EngineError::InvalidExpression(format!(
                    "cannot compute a {}",
                    other.kind()
                )))
            }
        })
    }
}

type Env = HashMap<String, Val>;

fn invalid(msg: impl Into<String>) -> EngineError {
    EngineError::InvalidExpression(msg.into())
}

fn property_matches(actual: Option<&Value>, expected: &Value) -> bool {
    match (actual, expected) {
        (Some(a), e) if a == e => true,
        (Some(a), e) => match (a.as_f64(), e.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => match (a.as_str(), e.as_str()) {
                (Some(s), _) => e.as_f64().is_some_and(|y| s.parse::<f64>().ok() == Some(y)),
                (_, Some(s)) => a.as_f64().is_some_and(|x| s.parse::<f64>().ok() == Some(x)),
                _ => false,
            },
        },
        (None, _) => false,
    }
}

fn parse_time(v: &Value) -> Result<i64, EngineError> {
    if let Some(ms) = v.as_f64() {
        return Ok(ms as i64);
    }
    let s = v.as_str().ok_or_else(|| invalid("date must be a string or millis"))?;
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(date.and_time(NaiveTime::default()).and_utc().timestamp_millis());
    }
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.timestamp_millis())
        .map_err(|_| invalid(format!("unparseable date: {}", s)))
}

/// In-memory imagery engine for testing and offline development.
pub struct InMemoryEngine {
    grid: Grid,
    collections: RwLock<HashMap<String, Vec<Raster>>>,
    tables: RwLock<HashMap<String, Vec<Value>>>,
    tiles: RwLock<TileStore>,
}

const TILE_PREFIX: &str = "memory://tiles/";

/// Registered tiles kept before the oldest is evicted.
pub const MAX_TILES: usize = 256;

/// Tile rasters keyed by a hash of expression and visualization, evicted
/// oldest first.
#[derive(Default)]
struct TileStore {
    rasters: HashMap<String, Raster>,
    order: VecDeque<String>,
}

impl TileStore {
    fn insert(&mut self, id: String, raster: Raster) {
        if self.rasters.insert(id.clone(), raster).is_some() {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > MAX_TILES {
            if let Some(oldest) = self.order.pop_front() {
                self.rasters.remove(&oldest);
            }
        }
    }
}

impl InMemoryEngine {
    pub fn new(grid: Grid) -> Self {
        Self {
            grid,
            collections: RwLock::new(HashMap::new()),
            tables: RwLock::new(HashMap::new()),
            tiles: RwLock::new(TileStore::default()),
        }
    }

    pub fn grid(&self) -> Grid {
        self.grid
    }

    /// Register an image acquired on `date` in `collection`.
    pub fn add_image(
        &self,
        collection: &str,
        system_index: &str,
        date: NaiveDate,
        bands: &[(&str, Vec<f64>)],
    ) -> Result<()> {
        for (name, data) in bands {
            if data.len() != self.grid.len() {
                bail!(
                    "band {} has {} pixels, grid has {}",
                    name,
                    data.len(),
                    self.grid.len()
                );
            }
        }
        let mut properties = Map::new();
        properties.insert("system:index".to_string(), json!(system_index));
        properties.insert(
            "system:time_start".to_string(),
            json!(date.and_time(NaiveTime::default()).and_utc().timestamp_millis()),
        );
        let raster = Raster {
            grid: self.grid,
            bands: bands
                .iter()
                .map(|(name, data)| Band {
                    name: name.to_string(),
                    data: data.clone(),
                })
                .collect(),
            properties,
        };
        self.collections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(collection.to_string())
            .or_default()
            .push(raster);
        Ok(())
    }

    /// Register a GeoJSON feature in a vector table.
    pub fn add_feature(&self, table: &str, feature: Value) {
        self.tables
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(table.to_string())
            .or_default()
            .push(feature);
    }

    /// Evaluate an image expression to pixels.
    pub fn evaluate_image(&self, image: &Image) -> Result<Raster, EngineError> {
        match self.eval(image.expr(), &Env::new())? {
            Val::Image(r) => Ok(r),
            other => Err(invalid(format!("expected an Image, got {}", other.kind()))),
        }
    }

    /// Pixels behind a tile URL returned by [`Engine::map_tile_url`], while
    /// it is among the last [`MAX_TILES`] registered.
    pub fn tile(&self, url: &str) -> Option<Raster> {
        let id = url.strip_prefix(TILE_PREFIX)?.split('/').next()?;
        self.tiles
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .rasters
            .get(id)
            .cloned()
    }

    fn eval(&self, expr: &Expr, env: &Env) -> Result<Val, EngineError> {
        match expr {
            Expr::Constant(v) => Ok(Val::Json(v.clone())),
            Expr::ArgRef(name) => env
                .get(name)
                .cloned()
                .ok_or_else(|| invalid(format!("unbound argument: {}", name))),
            Expr::Lambda { params, body } => Ok(Val::Function(params.clone(), (**body).clone())),
            Expr::Array(items) => Ok(Val::List(
                items
                    .iter()
                    .map(|i| self.eval(i, env))
                    .collect::<Result<_, _>>()?,
            )),
            Expr::Dict(entries) => {
                let mut out = BTreeMap::new();
                for (k, v) in entries {
                    out.insert(k.clone(), self.eval(v, env)?);
                }
                Ok(Val::Dict(out))
            }
            Expr::Call { function, args } => {
                let args = Args {
                    engine: self,
                    function,
                    args,
                    env,
                };
                self.call(function, &args)
            }
        }
    }

    fn call(&self, function: &str, a: &Args<'_>) -> Result<Val, EngineError> {
        let grid = self.grid;
        let val = match function {
            "ImageCollection.load" => {
                let id = a.string("id")?;
                let collections = self.collections.read().unwrap_or_else(|e| e.into_inner());
                let images = collections.get(&id).cloned().ok_or_else(|| EngineError::Upstream {
                    status: 400,
                    message: format!("ImageCollection asset '{}' not found", id),
                })?;
                Val::Images(images)
            }
            "Collection.loadTable" => {
                let id = a.string("tableId")?;
                let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
                let features = tables.get(&id).cloned().ok_or_else(|| EngineError::Upstream {
                    status: 400,
                    message: format!("Table asset '{}' not found", id),
                })?;
                Val::Features(features)
            }
            "Collection.filter" => {
                let filter = match a.val("filter")? {
                    Val::Filter(f) => f,
                    other => return Err(invalid(format!("expected a Filter, got {}", other.kind()))),
                };
                match a.val("collection")? {
                    Val::Images(rs) => Val::Images(
                        rs.into_iter()
                            .filter(|r| image_matches(r, &filter))
                            .collect(),
                    ),
                    Val::Features(fs) => Val::Features(
                        fs.into_iter()
                            .filter(|f| feature_matches(f, &filter))
                            .collect(),
                    ),
                    other => return Err(invalid(format!("cannot filter a {}", other.kind()))),
                }
            }
            "Filter.intersects" => Val::Filter(Filter::Intersects(a.geometry("rightValue")?)),
            "Filter.dateRangeContains" => match a.val("leftValue")? {
                Val::DateRange(start, end) => Val::Filter(Filter::DateRange(start, end)),
                other => return Err(invalid(format!("expected a DateRange, got {}", other.kind()))),
            },
            "Filter.equals" => Val::Filter(Filter::Equals(a.string("leftField")?, a.json("rightValue")?)),
            "DateRange" => Val::DateRange(parse_time(&a.json("start")?)?, parse_time(&a.json("end")?)?),
            "Collection.map" => {
                let (params, body) = match a.val("baseAlgorithm")? {
                    Val::Function(params, body) => (params, body),
                    other => return Err(invalid(format!("expected a Function, got {}", other.kind()))),
                };
                let param = params.first().cloned().ok_or_else(|| invalid("mapped function has no argument"))?;
                let items: Vec<Val> = match a.val("collection")? {
                    Val::Images(rs) => rs.into_iter().map(Val::Image).collect(),
                    Val::Features(fs) => fs.into_iter().map(Val::Feature).collect(),
                    other => return Err(invalid(format!("cannot map over a {}", other.kind()))),
                };
                let mut images = Vec::new();
                let mut features = Vec::new();
                for item in items {
                    let mut env = a.env.clone();
                    env.insert(param.clone(), item);
                    match self.eval(&body, &env)? {
                        Val::Image(r) => images.push(r),
                        Val::Feature(f) => features.push(f),
                        other => return Err(invalid(format!("mapped function returned a {}", other.kind()))),
                    }
                }
                if !features.is_empty() && !images.is_empty() {
                    return Err(invalid("mapped function returned mixed element types"));
                }
                if features.is_empty() {
                    Val::Images(images)
                } else {
                    Val::Features(features)
                }
            }
            "Collection.size" => match a.val("collection")? {
                Val::Images(rs) => Val::Json(json!(rs.len())),
                Val::Features(fs) => Val::Json(json!(fs.len())),
                other => return Err(invalid(format!("cannot size a {}", other.kind()))),
            },
            "Collection.first" => match a.val("collection")? {
                Val::Images(rs) => rs.into_iter().next().map(Val::Image).unwrap_or(Val::Json(Value::Null)),
                Val::Features(fs) => fs.into_iter().next().map(Val::Feature).unwrap_or(Val::Json(Value::Null)),
                other => return Err(invalid(format!("cannot take first of a {}", other.kind()))),
            },
            "AggregateFeatureCollection.array" => {
                let property = a.string("property")?;
                let values: Vec<Val> = match a.val("collection")? {
                    Val::Images(rs) => rs
                        .iter()
                        .filter_map(|r| r.properties.get(&property).cloned())
                        .map(Val::Json)
                        .collect(),
                    Val::Features(fs) => fs
                        .iter()
                        .filter_map(|f| f.get("properties").and_then(|p| p.get(&property)).cloned())
                        .map(Val::Json)
                        .collect(),
                    other => return Err(invalid(format!("cannot aggregate a {}", other.kind()))),
                };
                Val::List(values)
            }
            "reduce.median" | "reduce.mean" => {
                let rs = a.images("collection")?;
                let use_median = function == "reduce.median";
                Val::Image(composite(grid, &rs, use_median))
            }
            "Image.constant" => Val::Image(Raster::single(grid, "constant", vec![a.f64("value")?; grid.len()])),
            "Image.pixelArea" => Val::Image(Raster::single(
                grid,
                "area",
                (0..grid.len()).map(|i| grid.pixel_area_m2(i)).collect(),
            )),
            "Image.select" => {
                let r = a.image("input")?;
                let names = a.strings("bandSelectors")?;
                let mut bands = Vec::with_capacity(names.len());
                for name in &names {
                    let band = r.bands.iter().find(|b| &b.name == name).ok_or_else(|| {
                        invalid(format!("band '{}' not found; available: {:?}", name, r.band_names()))
                    })?;
                    bands.push(band.clone());
                }
                Val::Image(Raster {
                    grid,
                    bands,
                    properties: r.properties.clone(),
                })
            }
            "Image.normalizedDifference" => {
                let r = a.image("input")?;
                let names = a.strings("bandNames")?;
                let pick = |k: usize| -> Result<&Band, EngineError> {
                    match names.get(k) {
                        Some(n) => r.bands.iter().find(|b| &b.name == n).ok_or_else(|| invalid(format!("band '{}' not found", n))),
                        None => r.bands.get(k).ok_or_else(|| invalid("normalizedDifference needs two bands")),
                    }
                };
                let (x, y) = (pick(0)?, pick(1)?);
                let data = x
                    .data
                    .iter()
                    .zip(&y.data)
                    .map(|(&p, &q)| {
                        if p.is_nan() || q.is_nan() || p + q == 0.0 {
                            f64::NAN
                        } else {
                            (p - q) / (p + q)
                        }
                    })
                    .collect();
                Val::Image(Raster::single(grid, "nd", data))
            }
            "Image.rename" => {
                let mut r = a.image("input")?;
                let names = a.strings("names")?;
                if names.len() != r.bands.len() {
                    return Err(invalid(format!(
                        "rename needs {} names, got {}",
                        r.bands.len(),
                        names.len()
                    )));
                }
                for (band, name) in r.bands.iter_mut().zip(names) {
                    band.name = name;
                }
                Val::Image(r)
            }
            "Element.copyProperties" => {
                let source = a.val("source")?;
                let properties = a.strings("properties")?;
                let source_props = match &source {
                    Val::Image(r) => r.properties.clone(),
                    Val::Feature(f) => f.get("properties").and_then(Value::as_object).cloned().unwrap_or_default(),
                    other => return Err(invalid(format!("cannot copy properties from a {}", other.kind()))),
                };
                match a.val("destination")? {
                    Val::Image(mut r) => {
                        for p in properties {
                            if let Some(v) = source_props.get(&p) {
                                r.properties.insert(p, v.clone());
                            }
                        }
                        Val::Image(r)
                    }
                    other => return Err(invalid(format!("cannot copy properties to a {}", other.kind()))),
                }
            }
            "Element.get" => {
                let property = a.string("property")?;
                let value = match a.val("object")? {
                    Val::Image(r) => r.properties.get(&property).cloned(),
                    Val::Feature(f) => f.get("properties").and_then(|p| p.get(&property)).cloned(),
                    other => return Err(invalid(format!("cannot get a property of a {}", other.kind()))),
                };
                Val::Json(value.unwrap_or(Value::Null))
            }
            "Image.updateMask" => {
                let r = a.image("image")?;
                let mask = a.image("mask")?;
                Val::Image(mask_with(&r, &mask)?)
            }
            "Image.selfMask" => {
                let r = a.image("image")?;
                Val::Image(keep_properties(&r, r.map_values(|v| if v == 0.0 { f64::NAN } else { v })))
            }
            "Image.add" => self.binary(a, |x, y| x + y)?,
            "Image.subtract" => self.binary(a, |x, y| x - y)?,
            "Image.multiply" => self.binary(a, |x, y| x * y)?,
            "Image.divide" => self.binary(a, |x, y| x / y)?,
            "Image.pow" => self.binary(a, f64::powf)?,
            "Image.eq" => self.binary(a, |x, y| flag(x == y))?,
            "Image.and" => self.binary(a, |x, y| flag(x != 0.0 && y != 0.0))?,
            "Image.lte" => self.binary(a, |x, y| flag(x <= y))?,
            "Image.gt" => self.binary(a, |x, y| flag(x > y))?,
            "Image.gte" => self.binary(a, |x, y| flag(x >= y))?,
            "Image.bitwiseAnd" => self.binary(a, |x, y| ((x as i64) & (y as i64)) as f64)?,
            "Image.sqrt" => Val::Image(a.image("value")?.map_values(f64::sqrt)),
            "Image.abs" => Val::Image(a.image("value")?.map_values(f64::abs)),
            "Image.toInt16" => Val::Image(
                a.image("value")?
                    .map_values(|v| v.trunc().clamp(i16::MIN as f64, i16::MAX as f64)),
            ),
            "Image.where" => {
                let mut out = a.image("input")?;
                let test = a.image("test")?;
                let value = a.image("value")?;
                for (k, band) in out.bands.iter_mut().enumerate() {
                    let (Some(t), Some(v)) = (
                        test.bands.get(k).or(test.bands.first()),
                        value.bands.get(k).or(value.bands.first()),
                    ) else {
                        return Err(invalid("Image.where needs test and value bands"));
                    };
                    for i in 0..band.data.len() {
                        if !band.data[i].is_nan() && !t.data[i].is_nan() && t.data[i] != 0.0 {
                            band.data[i] = v.data[i];
                        }
                    }
                }
                Val::Image(out)
            }
            "Image.focal_median" => {
                let r = a.image("image")?;
                let radius = a.f64("radius")?;
                Val::Image(focal_median(&r, radius))
            }
            "Image.connectedPixelCount" => {
                let r = a.image("image")?;
                let max_size = a.f64("maxSize")?.max(1.0) as usize;
                let eight = a.opt_bool("eightConnected")?.unwrap_or(true);
                Val::Image(connected_pixel_count(&r, max_size, eight))
            }
            "Image.reduce" => {
                let r = a.image("image")?;
                let reducer = a.reducer("reducer")?;
                let data = (0..grid.len())
                    .map(|i| {
                        let mut values: Vec<f64> = r.bands.iter().map(|b| b.data[i]).filter(|v| !v.is_nan()).collect();
                        if values.is_empty() {
                            f64::NAN
                        } else {
                            reducer.reduce(&mut values).as_f64().unwrap_or(f64::NAN)
                        }
                    })
                    .collect();
                Val::Image(Raster::single(grid, reducer.output_name(), data))
            }
            "Image.addBands" => {
                let mut dst = a.image("dstImg")?;
                let src = a.image("srcImg")?;
                dst.bands.extend(src.bands);
                Val::Image(dst)
            }
            "Image.clip" | "Image.clipToBoundsAndScale" => {
                let mut r = a.image("input")?;
                let shape = a.geometry("geometry")?;
                for i in 0..grid.len() {
                    if !shape.covers_pixel(&grid, i) {
                        for band in r.bands.iter_mut() {
                            band.data[i] = f64::NAN;
                        }
                    }
                }
                Val::Image(r)
            }
            "Image.reduceRegion" => {
                let r = a.image("image")?;
                let reducer = a.reducer("reducer")?;
                let shape = a.geometry("geometry")?;
                let covered: Vec<usize> = (0..grid.len()).filter(|&i| shape.covers_pixel(&grid, i)).collect();
                Val::Dict(reduce_region(&r, &reducer, &covered)?)
            }
            "Dictionary.get" => {
                let key = a.string("key")?;
                let dict = match a.val("dictionary")? {
                    Val::Dict(d) => d,
                    Val::Json(Value::Object(m)) => m.into_iter().map(|(k, v)| (k, Val::Json(v))).collect(),
                    other => return Err(invalid(format!("expected a Dictionary, got {}", other.kind()))),
                };
                match dict.get(&key) {
                    Some(v) => v.clone(),
                    None => match a.opt("defaultValue")? {
                        Some(default) => default,
                        None => return Err(invalid(format!("dictionary has no key '{}'", key))),
                    },
                }
            }
            "Feature" => {
                let geometry = match a.opt("geometry")? {
                    Some(Val::Geometry(s)) => s.geojson,
                    _ => Value::Null,
                };
                let properties = match a.opt("metadata")? {
                    Some(v) => v.to_json()?,
                    None => json!({}),
                };
                Val::Feature(json!({ "type": "Feature", "geometry": geometry, "properties": properties }))
            }
            "Reducer.sum" => Val::Reducer(ReducerKind::Sum),
            "Reducer.mean" => Val::Reducer(ReducerKind::Mean),
            "Reducer.median" => Val::Reducer(ReducerKind::Median),
            "Reducer.frequencyHistogram" => Val::Reducer(ReducerKind::Histogram),
            "Reducer.group" => Val::Reducer(ReducerKind::Group {
                inner: Box::new(a.reducer("reducer")?),
                field: a.f64("groupField")? as usize,
                name: a.opt_string("groupName")?.unwrap_or_else(|| "group".to_string()),
            }),
            f if f.starts_with("GeometryConstructors.") => {
                let kind = &f["GeometryConstructors.".len()..];
                let coordinates = a.json("coordinates")?;
                Val::Geometry(Shape::parse(kind, &coordinates).map_err(|e| invalid(e.to_string()))?)
            }
            other => return Err(invalid(format!("unsupported algorithm: {}", other))),
        };
        Ok(val)
    }

    fn binary(&self, a: &Args<'_>, f: impl Fn(f64, f64) -> f64) -> Result<Val, EngineError> {
        let x = a.image("image1")?;
        let y = a.image("image2")?;
        Ok(Val::Image(zip_images(&x, &y, f)?))
    }
}

fn flag(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

fn keep_properties(source: &Raster, mut out: Raster) -> Raster {
    out.properties = source.properties.clone();
    out
}

fn mask_with(r: &Raster, mask: &Raster) -> Result<Raster, EngineError> {
    if mask.bands.len() != 1 && mask.bands.len() != r.bands.len() {
        return Err(invalid("mask band count must be 1 or match the image"));
    }
    let mut out = r.clone();
    for (k, band) in out.bands.iter_mut().enumerate() {
        let m = &mask.bands[if mask.bands.len() == 1 { 0 } else { k }].data;
        for (v, mv) in band.data.iter_mut().zip(m) {
            if mv.is_nan() || *mv == 0.0 {
                *v = f64::NAN;
            }
        }
    }
    Ok(out)
}

fn image_matches(r: &Raster, filter: &Filter) -> bool {
    match filter {
        Filter::Intersects(shape) => shape.intersects_bounds(&r.grid.bounds()),
        Filter::DateRange(start, end) => r
            .properties
            .get("system:time_start")
            .and_then(Value::as_i64)
            .is_some_and(|t| t >= *start && t < *end),
        Filter::Equals(field, value) => property_matches(r.properties.get(field), value),
    }
}

fn feature_matches(f: &Value, filter: &Filter) -> bool {
    match filter {
        Filter::Intersects(shape) => f
            .get("geometry")
            .and_then(|g| Shape::from_geojson(g).ok())
            .is_some_and(|g| g.intersects(shape)),
        Filter::DateRange(start, end) => f
            .get("properties")
            .and_then(|p| p.get("system:time_start"))
            .and_then(Value::as_i64)
            .is_some_and(|t| t >= *start && t < *end),
        Filter::Equals(field, value) => {
            property_matches(f.get("properties").and_then(|p| p.get(field)), value)
        }
    }
}

/// Per-pixel median or mean over a stack, ignoring masked observations.
fn composite(grid: Grid, rasters: &[Raster], use_median: bool) -> Raster {
    let Some(first) = rasters.first() else {
        return Raster::empty(grid);
    };
    let bands = first
        .bands
        .iter()
        .map(|band| {
            let stack: Vec<&[f64]> = rasters.iter().filter_map(|r| r.band(&band.name)).collect();
            let data = (0..grid.len())
                .map(|i| {
                    let mut values: Vec<f64> = stack.iter().map(|d| d[i]).filter(|v| !v.is_nan()).collect();
                    let reduced = if use_median { median(&mut values) } else { mean(&values) };
                    reduced.unwrap_or(f64::NAN)
                })
                .collect();
            Band {
                name: band.name.clone(),
                data,
            }
        })
        .collect();
    Raster {
        grid,
        bands,
        properties: Map::new(),
    }
}

fn focal_median(r: &Raster, radius: f64) -> Raster {
    let grid = r.grid;
    let reach = radius.floor().max(0.0) as i64;
    let (w, h) = (grid.width as i64, grid.height as i64);
    let bands = r
        .bands
        .iter()
        .map(|band| {
            let data = (0..grid.len())
                .map(|i| {
                    if band.data[i].is_nan() {
                        return f64::NAN;
                    }
                    let (col, row) = ((i % grid.width) as i64, (i / grid.width) as i64);
                    let mut window = Vec::new();
                    for dy in -reach..=reach {
                        for dx in -reach..=reach {
                            if ((dx * dx + dy * dy) as f64) > radius * radius {
                                continue;
                            }
                            let (x, y) = (col + dx, row + dy);
                            if x < 0 || y < 0 || x >= w || y >= h {
                                continue;
                            }
                            let v = band.data[(y * w + x) as usize];
                            if !v.is_nan() {
                                window.push(v);
                            }
                        }
                    }
                    median(&mut window).unwrap_or(f64::NAN)
                })
                .collect();
            Band {
                name: band.name.clone(),
                data,
            }
        })
        .collect();
    Raster {
        grid,
        bands,
        properties: r.properties.clone(),
    }
}

/// Label equal-valued regions of unmasked pixels and report each pixel's
/// region size, capped at `max_size`.
fn connected_pixel_count(r: &Raster, max_size: usize, eight_connected: bool) -> Raster {
    let grid = r.grid;
    let (w, h) = (grid.width as i64, grid.height as i64);
    let offsets: &[(i64, i64)] = if eight_connected {
        &[(-1, -1), (0, -1), (1, -1), (-1, 0), (1, 0), (-1, 1), (0, 1), (1, 1)]
    } else {
        &[(0, -1), (-1, 0), (1, 0), (0, 1)]
    };
    let bands = r
        .bands
        .iter()
        .map(|band| {
            let mut out = vec![f64::NAN; grid.len()];
            let mut visited = vec![false; grid.len()];
            for start in 0..grid.len() {
                if visited[start] || band.data[start].is_nan() {
                    continue;
                }
                let value = band.data[start];
                let mut region = Vec::new();
                let mut queue = VecDeque::from([start]);
                visited[start] = true;
                while let Some(i) = queue.pop_front() {
                    region.push(i);
                    let (col, row) = ((i % grid.width) as i64, (i / grid.width) as i64);
                    for (dx, dy) in offsets {
                        let (x, y) = (col + dx, row + dy);
                        if x < 0 || y < 0 || x >= w || y >= h {
                            continue;
                        }
                        let j = (y * w + x) as usize;
                        if !visited[j] && band.data[j] == value {
                            visited[j] = true;
                            queue.push_back(j);
                        }
                    }
                }
                let size = region.len().min(max_size) as f64;
                for i in region {
                    out[i] = size;
                }
            }
            Band {
                name: band.name.clone(),
                data: out,
            }
        })
        .collect();
    Raster {
        grid,
        bands,
        properties: Map::new(),
    }
}

fn reduce_region(
    r: &Raster,
    reducer: &ReducerKind,
    covered: &[usize],
) -> Result<BTreeMap<String, Val>, EngineError> {
    let mut out = BTreeMap::new();
    if let ReducerKind::Group { inner, field, name } = reducer {
        let group_band = r
            .bands
            .get(*field)
            .ok_or_else(|| invalid(format!("group field {} out of range", field)))?;
        let value_band = r
            .bands
            .iter()
            .enumerate()
            .find(|(k, _)| k != field)
            .map(|(_, b)| b)
            .ok_or_else(|| invalid("grouped reduction needs a value band"))?;
        let mut groups: BTreeMap<i64, Vec<f64>> = BTreeMap::new();
        for &i in covered {
            let (g, v) = (group_band.data[i], value_band.data[i]);
            if g.is_nan() || v.is_nan() {
                continue;
            }
            groups.entry(g as i64).or_default().push(v);
        }
        let list = groups
            .into_iter()
            .map(|(g, mut values)| {
                let mut entry = Map::new();
                entry.insert(name.clone(), json!(g));
                entry.insert(inner.output_name().to_string(), inner.reduce(&mut values));
                Value::Object(entry)
            })
            .collect::<Vec<_>>();
        out.insert("groups".to_string(), Val::Json(Value::Array(list)));
        return Ok(out);
    }
    for band in &r.bands {
        let mut values: Vec<f64> = covered
            .iter()
            .map(|&i| band.data[i])
            .filter(|v| !v.is_nan())
            .collect();
        out.insert(band.name.clone(), Val::Json(reducer.reduce(&mut values)));
    }
    Ok(out)
}

/// Lazily evaluated call arguments.
struct Args<'a> {
    engine: &'a InMemoryEngine,
    function: &'a str,
    args: &'a BTreeMap<String, Expr>,
    env: &'a Env,
}

impl Args<'_> {
    fn opt(&self, name: &str) -> Result<Option<Val>, EngineError> {
        self.args
            .get(name)
            .map(|e| self.engine.eval(e, self.env))
            .transpose()
    }

    fn val(&self, name: &str) -> Result<Val, EngineError> {
        self.opt(name)?
            .ok_or_else(|| invalid(format!("{}: missing argument '{}'", self.function, name)))
    }

    fn json(&self, name: &str) -> Result<Value, EngineError> {
        self.val(name)?.to_json()
    }

    fn f64(&self, name: &str) -> Result<f64, EngineError> {
        self.json(name)?
            .as_f64()
            .ok_or_else(|| invalid(format!("{}: '{}' must be a number", self.function, name)))
    }

    fn string(&self, name: &str) -> Result<String, EngineError> {
        match self.json(name)? {
            Value::String(s) => Ok(s),
            _ => Err(invalid(format!("{}: '{}' must be a string", self.function, name))),
        }
    }

    fn opt_string(&self, name: &str) -> Result<Option<String>, EngineError> {
        match self.opt(name)? {
            Some(v) => Ok(v.to_json()?.as_str().map(str::to_string)),
            None => Ok(None),
        }
    }

    fn opt_bool(&self, name: &str) -> Result<Option<bool>, EngineError> {
        match self.opt(name)? {
            Some(v) => Ok(v.to_json()?.as_bool()),
            None => Ok(None),
        }
    }

    fn strings(&self, name: &str) -> Result<Vec<String>, EngineError> {
        match self.json(name)? {
            Value::String(s) => Ok(vec![s]),
            Value::Array(items) => items
                .into_iter()
                .map(|v| match v {
                    Value::String(s) => Ok(s),
                    _ => Err(invalid(format!("{}: '{}' must hold strings", self.function, name))),
                })
                .collect(),
            _ => Err(invalid(format!("{}: '{}' must be a list of strings", self.function, name))),
        }
    }

    fn image(&self, name: &str) -> Result<Raster, EngineError> {
        match self.val(name)? {
            Val::Image(r) => Ok(r),
            Val::Json(v) => match v.as_f64() {
                Some(c) => Ok(Raster::single(self.engine.grid, "constant", vec![c; self.engine.grid.len()])),
                None => Err(invalid(format!("{}: '{}' must be an Image", self.function, name))),
            },
            other => Err(invalid(format!(
                "{}: '{}' must be an Image, got {}",
                self.function,
                name,
                other.kind()
            ))),
        }
    }

    fn images(&self, name: &str) -> Result<Vec<Raster>, EngineError> {
        match self.val(name)? {
            Val::Images(rs) => Ok(rs),
            other => Err(invalid(format!(
                "{}: '{}' must be an ImageCollection, got {}",
                self.function,
                name,
                other.kind()
            ))),
        }
    }

    fn geometry(&self, name: &str) -> Result<Shape, EngineError> {
        match self.val(name)? {
            Val::Geometry(s) => Ok(s),
            Val::Feature(f) => f
                .get("geometry")
                .ok_or_else(|| invalid("feature has no geometry"))
                .and_then(|g| Shape::from_geojson(g).map_err(|e| invalid(e.to_string()))),
            other => Err(invalid(format!(
                "{}: '{}' must be a Geometry, got {}",
                self.function,
                name,
                other.kind()
            ))),
        }
    }

    fn reducer(&self, name: &str) -> Result<ReducerKind, EngineError> {
        match self.val(name)? {
            Val::Reducer(r) => Ok(r),
            other => Err(invalid(format!(
                "{}: '{}' must be a Reducer, got {}",
                self.function,
                name,
                other.kind()
            ))),
        }
    }
}

#[async_trait]
impl Engine for InMemoryEngine {
    async fn compute_value(&self, expr: &Expr) -> Result<Value, EngineError> {
        self.eval(expr, &Env::new())?.to_json()
    }

    async fn map_tile_url(&self, image: &Image, vis: &VisParams) -> Result<String, EngineError> {
        let raster = self.evaluate_image(image)?;
        let key = format!(
            "{}|{}|{}|{}",
            image.expr().to_request_json(),
            vis.min,
            vis.max,
            vis.palette.join(",")
        );
        let id = content_hash(&key)[..16].to_string();
        let url = format!("{}{}/{{z}}/{{x}}/{{y}}", TILE_PREFIX, id);
        self.tiles
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, raster);
        Ok(url)
    }

    async fn download_geotiff(
        &self,
        image: &Image,
        region: &Geometry,
        scale: f64,
    ) -> Result<ByteStream, EngineError> {
        let clipped = image.clip_to_bounds_and_scale(region, scale);
        let raster = self.evaluate_image(&clipped)?;
        let band = raster
            .bands
            .first()
            .ok_or_else(|| invalid("image has no bands to export"))?;
        let data: Vec<f32> = band.data.iter().map(|&v| v as f32).collect();
        let bytes = write_geotiff(
            self.grid.width as u32,
            self.grid.height as u32,
            &data,
            GeoReference {
                origin_lon: self.grid.origin_lon,
                origin_lat: self.grid.origin_lat,
                pixel_deg: self.grid.pixel_deg,
            },
        )
        .map_err(|e| EngineError::Decode(format!("GeoTIFF encoding failed: {}", e)))?;
        Ok(futures::stream::iter(vec![Ok(bytes)]).boxed())
    }
}
