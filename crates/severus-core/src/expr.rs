//! Remote expression graph.
//!
//! Raster work is never done eagerly. Callers build an [`Expr`] tree through
//! the typed builders ([`Image`], [`ImageCollection`], [`FeatureCollection`],
//! [`Geometry`], [`Reducer`]) and hand it to an [`Engine`](crate::engine::Engine),
//! which evaluates it remotely (Earth Engine) or locally (in-memory).
//!
//! [`Expr::to_request_json`] encodes a tree in the Earth Engine REST
//! `Expression` format: a flat `values` table of nodes referencing each
//! other by id, with identical subtrees stored once.

use std::collections::{BTreeMap, HashMap};

use anyhow::{bail, Context, Result};
use serde_json::{json, Map, Value};

/// Name of the mapped element inside `Collection.map` bodies.
pub const MAP_VAR: &str = "_MAPPING_VAR_0_0";

/// One node of a lazy computation.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Constant(Value),
    Call {
        function: String,
        args: BTreeMap<String, Expr>,
    },
    ArgRef(String),
    Lambda {
        params: Vec<String>,
        body: Box<Expr>,
    },
    Array(Vec<Expr>),
    Dict(BTreeMap<String, Expr>),
}

impl Expr {
    pub fn constant(value: impl Into<Value>) -> Self {
        Expr::Constant(value.into())
    }

    pub fn null() -> Self {
        Expr::Constant(Value::Null)
    }

    pub fn strings(items: &[&str]) -> Self {
        Expr::Constant(json!(items))
    }

    pub fn call<'a>(function: &str, args: impl IntoIterator<Item = (&'a str, Expr)>) -> Self {
        Expr::Call {
            function: function.to_string(),
            args: args
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        }
    }

    /// Call with no arguments, e.g. `Reducer.sum()`.
    pub fn nullary(function: &str) -> Self {
        Expr::Call {
            function: function.to_string(),
            args: BTreeMap::new(),
        }
    }

    pub fn arg(name: &str) -> Self {
        Expr::ArgRef(name.to_string())
    }

    pub fn lambda(params: &[&str], body: Expr) -> Self {
        Expr::Lambda {
            params: params.iter().map(|p| p.to_string()).collect(),
            body: Box::new(body),
        }
    }

    pub fn dict<'a>(entries: impl IntoIterator<Item = (&'a str, Expr)>) -> Self {
        Expr::Dict(
            entries
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    /// `Element.get(object, property)`
    pub fn get_property(object: Expr, property: &str) -> Self {
        Expr::call(
            "Element.get",
            [("object", object), ("property", Expr::constant(property))],
        )
    }

    /// `Dictionary.get(dictionary, key, defaultValue)`
    pub fn dict_get(dictionary: Expr, key: &str, default: Expr) -> Self {
        Expr::call(
            "Dictionary.get",
            [
                ("dictionary", dictionary),
                ("key", Expr::constant(key)),
                ("defaultValue", default),
            ],
        )
    }

    pub fn function_name(&self) -> Option<&str> {
        match self {
            Expr::Call { function, .. } => Some(function),
            _ => None,
        }
    }

    /// Encode as an Earth Engine REST `Expression`.
    pub fn to_request_json(&self) -> Value {
        let mut encoder = Encoder::default();
        let result = encoder.encode(self);
        json!({ "result": result, "values": Value::Object(encoder.values) })
    }
}

#[derive(Default)]
struct Encoder {
    values: Map<String, Value>,
    seen: HashMap<String, String>,
}

impl Encoder {
    fn encode(&mut self, expr: &Expr) -> String {
        let node = match expr {
            Expr::Constant(v) => json!({ "constantValue": v }),
            Expr::Call { function, args } => {
                let mut arguments = Map::new();
                for (name, arg) in args {
                    arguments.insert(name.clone(), self.reference(arg));
                }
                json!({
                    "functionInvocationValue": {
                        "functionName": function,
                        "arguments": arguments,
                    }
                })
            }
            Expr::ArgRef(name) => json!({ "argumentReference": name }),
            Expr::Lambda { params, body } => json!({
                "functionDefinitionValue": {
                    "argumentNames": params,
                    "body": self.encode(body),
                }
            }),
            Expr::Array(items) => {
                let values: Vec<Value> = items.iter().map(|i| self.reference(i)).collect();
                json!({ "arrayValue": { "values": values } })
            }
            Expr::Dict(entries) => {
                let mut values = Map::new();
                for (k, v) in entries {
                    values.insert(k.clone(), self.reference(v));
                }
                json!({ "dictionaryValue": { "values": values } })
            }
        };

        let key = node.to_string();
        if let Some(id) = self.seen.get(&key) {
            return id.clone();
        }
        let id = self.values.len().to_string();
        self.values.insert(id.clone(), node);
        self.seen.insert(key, id.clone());
        id
    }

    fn reference(&mut self, expr: &Expr) -> Value {
        json!({ "valueReference": self.encode(expr) })
    }
}

/// Anything usable as the second operand of a per-pixel image operation.
pub trait IntoImage {
    fn into_image(self) -> Image;
}

impl IntoImage for Image {
    fn into_image(self) -> Image {
        self
    }
}

impl IntoImage for &Image {
    fn into_image(self) -> Image {
        self.clone()
    }
}

impl IntoImage for f64 {
    fn into_image(self) -> Image {
        Image::constant(self)
    }
}

/// Lazy handle on a multi-band raster.
#[derive(Debug, Clone, PartialEq)]
pub struct Image(Expr);

impl Image {
    pub fn from_expr(expr: Expr) -> Self {
        Image(expr)
    }

    pub fn expr(&self) -> &Expr {
        &self.0
    }

    pub fn into_expr(self) -> Expr {
        self.0
    }

    /// The element bound inside a `Collection.map` body.
    pub fn mapped() -> Self {
        Image(Expr::arg(MAP_VAR))
    }

    pub fn constant(value: f64) -> Self {
        Image(Expr::call("Image.constant", [("value", Expr::constant(value))]))
    }

    /// Area of each pixel in square meters.
    pub fn pixel_area() -> Self {
        Image(Expr::nullary("Image.pixelArea"))
    }

    fn unary(&self, function: &str) -> Image {
        Image(Expr::call(function, [("value", self.0.clone())]))
    }

    fn binary(&self, function: &str, other: impl IntoImage) -> Image {
        Image(Expr::call(
            function,
            [
                ("image1", self.0.clone()),
                ("image2", other.into_image().0),
            ],
        ))
    }

    pub fn select(&self, bands: &[&str]) -> Image {
        Image(Expr::call(
            "Image.select",
            [("input", self.0.clone()), ("bandSelectors", Expr::strings(bands))],
        ))
    }

    pub fn normalized_difference(&self, bands: [&str; 2]) -> Image {
        Image(Expr::call(
            "Image.normalizedDifference",
            [("input", self.0.clone()), ("bandNames", Expr::strings(&bands))],
        ))
    }

    pub fn rename(&self, name: &str) -> Image {
        Image(Expr::call(
            "Image.rename",
            [("input", self.0.clone()), ("names", Expr::strings(&[name]))],
        ))
    }

    pub fn copy_properties(&self, source: &Image, properties: &[&str]) -> Image {
        Image(Expr::call(
            "Element.copyProperties",
            [
                ("destination", self.0.clone()),
                ("source", source.0.clone()),
                ("properties", Expr::strings(properties)),
            ],
        ))
    }

    pub fn get(&self, property: &str) -> Expr {
        Expr::get_property(self.0.clone(), property)
    }

    pub fn update_mask(&self, mask: &Image) -> Image {
        Image(Expr::call(
            "Image.updateMask",
            [("image", self.0.clone()), ("mask", mask.0.clone())],
        ))
    }

    pub fn self_mask(&self) -> Image {
        Image(Expr::call("Image.selfMask", [("image", self.0.clone())]))
    }

    pub fn add(&self, other: impl IntoImage) -> Image {
        self.binary("Image.add", other)
    }

    pub fn subtract(&self, other: impl IntoImage) -> Image {
        self.binary("Image.subtract", other)
    }

    pub fn multiply(&self, other: impl IntoImage) -> Image {
        self.binary("Image.multiply", other)
    }

    pub fn divide(&self, other: impl IntoImage) -> Image {
        self.binary("Image.divide", other)
    }

    pub fn pow(&self, other: impl IntoImage) -> Image {
        self.binary("Image.pow", other)
    }

    pub fn eq(&self, other: impl IntoImage) -> Image {
        self.binary("Image.eq", other)
    }

    pub fn and(&self, other: impl IntoImage) -> Image {
        self.binary("Image.and", other)
    }

    pub fn lte(&self, other: impl IntoImage) -> Image {
        self.binary("Image.lte", other)
    }

    pub fn gt(&self, other: impl IntoImage) -> Image {
        self.binary("Image.gt", other)
    }

    pub fn gte(&self, other: impl IntoImage) -> Image {
        self.binary("Image.gte", other)
    }

    pub fn bitwise_and(&self, other: impl IntoImage) -> Image {
        self.binary("Image.bitwiseAnd", other)
    }

    pub fn sqrt(&self) -> Image {
        self.unary("Image.sqrt")
    }

    pub fn abs(&self) -> Image {
        self.unary("Image.abs")
    }

    pub fn to_int16(&self) -> Image {
        self.unary("Image.toInt16")
    }

    /// Replace pixels where `test` is non-zero with `value`.
    pub fn where_value(&self, test: &Image, value: f64) -> Image {
        Image(Expr::call(
            "Image.where",
            [
                ("input", self.0.clone()),
                ("test", test.0.clone()),
                ("value", Image::constant(value).0),
            ],
        ))
    }

    /// Circular median filter with a radius in pixels.
    pub fn focal_median(&self, radius: f64) -> Image {
        Image(Expr::call(
            "Image.focal_median",
            [
                ("image", self.0.clone()),
                ("radius", Expr::constant(radius)),
                ("kernelType", Expr::constant("circle")),
                ("units", Expr::constant("pixels")),
            ],
        ))
    }

    /// Size of the connected same-valued region around each pixel, capped at `max_size`.
    pub fn connected_pixel_count(&self, max_size: u32, eight_connected: bool) -> Image {
        Image(Expr::call(
            "Image.connectedPixelCount",
            [
                ("image", self.0.clone()),
                ("maxSize", Expr::constant(max_size)),
                ("eightConnected", Expr::constant(eight_connected)),
            ],
        ))
    }

    /// Reduce across bands, one output band per reducer output.
    pub fn reduce(&self, reducer: Reducer) -> Image {
        Image(Expr::call(
            "Image.reduce",
            [("image", self.0.clone()), ("reducer", reducer.0)],
        ))
    }

    pub fn add_bands(&self, other: &Image) -> Image {
        Image(Expr::call(
            "Image.addBands",
            [("dstImg", self.0.clone()), ("srcImg", other.0.clone())],
        ))
    }

    pub fn clip(&self, geometry: &Geometry) -> Image {
        Image(Expr::call(
            "Image.clip",
            [("input", self.0.clone()), ("geometry", geometry.0.clone())],
        ))
    }

    /// Spatial reduction over `geometry`; evaluates to a dictionary.
    pub fn reduce_region(&self, reducer: Reducer, geometry: &Geometry, scale: f64) -> Expr {
        Expr::call(
            "Image.reduceRegion",
            [
                ("image", self.0.clone()),
                ("reducer", reducer.0),
                ("geometry", geometry.0.clone()),
                ("scale", Expr::constant(scale)),
                ("maxPixels", Expr::constant(1e13)),
            ],
        )
    }

    pub fn visualize(&self, min: f64, max: f64, palette: &[String]) -> Image {
        Image(Expr::call(
            "Image.visualize",
            [
                ("image", self.0.clone()),
                ("min", Expr::constant(min)),
                ("max", Expr::constant(max)),
                ("palette", Expr::constant(json!(palette))),
            ],
        ))
    }

    /// Clip and resample for a GeoTIFF export.
    pub fn clip_to_bounds_and_scale(&self, geometry: &Geometry, scale: f64) -> Image {
        Image(Expr::call(
            "Image.clipToBoundsAndScale",
            [
                ("input", self.0.clone()),
                ("geometry", geometry.0.clone()),
                ("scale", Expr::constant(scale)),
            ],
        ))
    }
}

/// Lazy handle on a filtered image stack.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageCollection(Expr);

impl ImageCollection {
    pub fn load(id: &str) -> Self {
        ImageCollection(Expr::call(
            "ImageCollection.load",
            [("id", Expr::constant(id))],
        ))
    }

    pub fn expr(&self) -> &Expr {
        &self.0
    }

    fn filter(&self, filter: Expr) -> Self {
        ImageCollection(Expr::call(
            "Collection.filter",
            [("collection", self.0.clone()), ("filter", filter)],
        ))
    }

    pub fn filter_bounds(&self, geometry: &Geometry) -> Self {
        self.filter(intersects_filter(geometry))
    }

    /// Keep images acquired in `[start, end)`; dates are `YYYY-MM-DD`.
    pub fn filter_date(&self, start: &str, end: &str) -> Self {
        self.filter(Expr::call(
            "Filter.dateRangeContains",
            [
                (
                    "leftValue",
                    Expr::call(
                        "DateRange",
                        [("start", Expr::constant(start)), ("end", Expr::constant(end))],
                    ),
                ),
                ("rightField", Expr::constant("system:time_start")),
            ],
        ))
    }

    pub fn map(&self, f: impl FnOnce(Image) -> Image) -> Self {
        let body = f(Image::mapped()).0;
        ImageCollection(map_call(&self.0, body))
    }

    /// Map every image to a feature, producing a feature collection.
    pub fn map_to_features(&self, f: impl FnOnce(Image) -> Expr) -> FeatureCollection {
        let body = f(Image::mapped());
        FeatureCollection(map_call(&self.0, body))
    }

    pub fn median(&self) -> Image {
        Image(Expr::call("reduce.median", [("collection", self.0.clone())]))
    }

    pub fn mean(&self) -> Image {
        Image(Expr::call("reduce.mean", [("collection", self.0.clone())]))
    }

    pub fn size(&self) -> Expr {
        Expr::call("Collection.size", [("collection", self.0.clone())])
    }

    /// List of one property over all images.
    pub fn aggregate_array(&self, property: &str) -> Expr {
        Expr::call(
            "AggregateFeatureCollection.array",
            [
                ("collection", self.0.clone()),
                ("property", Expr::constant(property)),
            ],
        )
    }
}

fn map_call(collection: &Expr, body: Expr) -> Expr {
    Expr::call(
        "Collection.map",
        [
            ("collection", collection.clone()),
            ("baseAlgorithm", Expr::lambda(&[MAP_VAR], body)),
        ],
    )
}

fn intersects_filter(geometry: &Geometry) -> Expr {
    Expr::call(
        "Filter.intersects",
        [
            ("leftField", Expr::constant(".all")),
            ("rightValue", geometry.0.clone()),
        ],
    )
}

/// Lazy handle on a vector table.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureCollection(Expr);

impl FeatureCollection {
    pub fn load(table_id: &str) -> Self {
        FeatureCollection(Expr::call(
            "Collection.loadTable",
            [("tableId", Expr::constant(table_id))],
        ))
    }

    pub fn expr(&self) -> &Expr {
        &self.0
    }

    pub fn filter_eq(&self, field: &str, value: Value) -> Self {
        FeatureCollection(Expr::call(
            "Collection.filter",
            [
                ("collection", self.0.clone()),
                (
                    "filter",
                    Expr::call(
                        "Filter.equals",
                        [
                            ("leftField", Expr::constant(field)),
                            ("rightValue", Expr::Constant(value)),
                        ],
                    ),
                ),
            ],
        ))
    }

    pub fn filter_bounds(&self, geometry: &Geometry) -> Self {
        FeatureCollection(Expr::call(
            "Collection.filter",
            [
                ("collection", self.0.clone()),
                ("filter", intersects_filter(geometry)),
            ],
        ))
    }

    pub fn first(&self) -> Expr {
        Expr::call("Collection.first", [("collection", self.0.clone())])
    }
}

/// `Feature(geometry, metadata)` with no geometry.
pub fn feature_without_geometry<'a>(properties: impl IntoIterator<Item = (&'a str, Expr)>) -> Expr {
    Expr::call(
        "Feature",
        [("geometry", Expr::null()), ("metadata", Expr::dict(properties))],
    )
}

/// GeoJSON geometry types accepted as query regions.
const GEOMETRY_TYPES: [&str; 6] = [
    "Point",
    "MultiPoint",
    "LineString",
    "MultiLineString",
    "Polygon",
    "MultiPolygon",
];

/// Lazy handle on a geodesic geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct Geometry(Expr);

impl Geometry {
    pub fn expr(&self) -> &Expr {
        &self.0
    }

    /// Build from GeoJSON. A `Feature` contributes its `geometry`.
    pub fn from_geojson(value: &Value) -> Result<Self> {
        let geometry = match value.get("type").and_then(Value::as_str) {
            Some("Feature") => value
                .get("geometry")
                .context("feature has no geometry")?,
            _ => value,
        };
        let kind = geometry
            .get("type")
            .and_then(Value::as_str)
            .context("geometry has no type")?;
        if !GEOMETRY_TYPES.contains(&kind) {
            bail!("unsupported geometry type: {}", kind);
        }
        let coordinates = geometry
            .get("coordinates")
            .context("geometry has no coordinates")?;
        if !coordinates_are_valid(coordinates) {
            bail!("geometry coordinates must be non-empty arrays of finite numbers");
        }
        Ok(Geometry(Expr::call(
            &format!("GeometryConstructors.{}", kind),
            [("coordinates", Expr::Constant(coordinates.clone()))],
        )))
    }

    pub fn point(lon: f64, lat: f64) -> Self {
        Geometry(Expr::call(
            "GeometryConstructors.Point",
            [("coordinates", Expr::constant(json!([lon, lat])))],
        ))
    }

    /// Polygon from a single exterior ring of `[lon, lat]` pairs. The ring is
    /// closed if needed.
    pub fn polygon(ring: &[[f64; 2]]) -> Result<Self> {
        if ring.len() < 3 {
            bail!("a polygon ring needs at least 3 positions");
        }
        if ring.iter().flatten().any(|c| !c.is_finite()) {
            bail!("polygon coordinates must be finite");
        }
        let mut ring = ring.to_vec();
        if ring.first() != ring.last() {
            ring.push(ring[0]);
        }
        Ok(Geometry(Expr::call(
            "GeometryConstructors.Polygon",
            [("coordinates", Expr::constant(json!([ring])))],
        )))
    }
}

fn coordinates_are_valid(value: &Value) -> bool {
    match value {
        Value::Number(n) => n.as_f64().is_some_and(f64::is_finite),
        Value::Array(items) => !items.is_empty() && items.iter().all(coordinates_are_valid),
        _ => false,
    }
}

/// Lazy handle on a reducer.
#[derive(Debug, Clone, PartialEq)]
pub struct Reducer(Expr);

impl Reducer {
    pub fn sum() -> Self {
        Reducer(Expr::nullary("Reducer.sum"))
    }

    pub fn mean() -> Self {
        Reducer(Expr::nullary("Reducer.mean"))
    }

    pub fn median() -> Self {
        Reducer(Expr::nullary("Reducer.median"))
    }

    pub fn frequency_histogram() -> Self {
        Reducer(Expr::nullary("Reducer.frequencyHistogram"))
    }

    /// Group this reducer's output by the band at `group_field`.
    pub fn group(self, group_field: u32, group_name: &str) -> Self {
        Reducer(Expr::call(
            "Reducer.group",
            [
                ("reducer", self.0),
                ("groupField", Expr::constant(group_field)),
                ("groupName", Expr::constant(group_name)),
            ],
        ))
    }

    pub fn expr(&self) -> &Expr {
        &self.0
    }
}
