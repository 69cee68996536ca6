//! HTTP API tests against the in-memory imagery engine.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;

use severus::chat::CompletionClient;
use severus::config::Config;
use severus::corpus::write_cache_file;
use severus::server::{build_router, AppState};
use severus_core::catalog;
use severus_core::embedding::EmbeddingProvider;
use severus_core::engine::memory::{Grid, InMemoryEngine};
use severus_core::engine::Engine;
use severus_core::models::{Document, DocumentMetadata};

const ICNF_TABLE: &str = "users/joaofgo/severus_pt/AA_ICNF_2000_2021_PT_v2";

/// Every text embeds onto the same direction, so any cached chunk with that
/// vector is a perfect match.
struct FixedProvider;

#[async_trait]
impl EmbeddingProvider for FixedProvider {
    fn model_name(&self) -> &str {
        "fixed"
    }
    fn dims(&self) -> usize {
        2
    }
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
    }
}

fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

/// 4x4 grid burned uniformly between June and August 2024.
fn burned_engine() -> InMemoryEngine {
    let engine = InMemoryEngine::new(Grid::new(-8.0, 40.0, 0.001, 4, 4));
    let s2 = catalog::lookup("Sentinel-2/MSI").unwrap();
    // NBR 0.5 before, -0.5 after: dNBR 1.0, class 5 everywhere.
    engine
        .add_image(
            s2.collection_id,
            "20240610T112119_20240610T112117_T29TNE",
            date("2024-06-10"),
            &[("B8", vec![3000.0; 16]), ("B12", vec![1000.0; 16]), ("QA60", vec![0.0; 16])],
        )
        .unwrap();
    engine
        .add_image(
            s2.collection_id,
            "20240815T112119_20240815T112117_T29TNE",
            date("2024-08-15"),
            &[("B8", vec![1000.0; 16]), ("B12", vec![3000.0; 16]), ("QA60", vec![0.0; 16])],
        )
        .unwrap();
    engine.add_feature(
        ICNF_TABLE,
        json!({
            "type": "Feature",
            "geometry": {"type": "Polygon", "coordinates": [[[-8.0, 40.0], [-7.9, 40.0], [-7.9, 39.9], [-8.0, 39.9], [-8.0, 40.0]]]},
            "properties": {"Ano": 2017, "NCCO": "Pedrógão Grande"}
        }),
    );
    engine
}

fn grid_polygon() -> Value {
    json!({
        "type": "Polygon",
        "coordinates": [[[-8.0, 40.0], [-7.996, 40.0], [-7.996, 39.996], [-8.0, 39.996], [-8.0, 40.0]]]
    })
}

fn severity_body() -> Value {
    json!({
        "satellite": "Sentinel-2/MSI",
        "preStart": "2024-06-01",
        "preEnd": "2024-06-30",
        "postStart": "2024-08-01",
        "postEnd": "2024-08-31",
        "geometry": grid_polygon()
    })
}

struct TestApp {
    base: String,
    client: reqwest::Client,
    _tmp: TempDir,
}

impl TestApp {
    async fn post(&self, path: &str, body: Value) -> reqwest::Response {
        self.client
            .post(format!("{}{}", self.base, path))
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(format!("{}{}", self.base, path))
            .send()
            .await
            .unwrap()
    }
}

fn test_config(tmp: &TempDir) -> Config {
    let mut config = Config::minimal("127.0.0.1:0");
    config.rag.cache_path = tmp.path().join("embeddings_cache.json");
    config.rag.docs_root = tmp.path().join("docs");
    config.chat.max_retries = 0;
    config
}

async fn spawn_app(engine: Option<InMemoryEngine>, setup: impl FnOnce(&TempDir, &mut Config)) -> TestApp {
    spawn_app_shared(engine.map(Arc::new), setup).await
}

/// Like [`spawn_app`], keeping a handle on the engine to read tiles back.
async fn spawn_app_shared(
    engine: Option<Arc<InMemoryEngine>>,
    setup: impl FnOnce(&TempDir, &mut Config),
) -> TestApp {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(&tmp);
    setup(&tmp, &mut config);

    let completion = CompletionClient::with_api_key(&config.chat, None).unwrap();
    let engine = engine.map(|e| e as Arc<dyn Engine>);
    let state = AppState::new(config, engine, Arc::new(FixedProvider), completion);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, build_router(state)).await.unwrap();
    });

    TestApp {
        base: format!("http://{}", addr),
        client: reqwest::Client::new(),
        _tmp: tmp,
    }
}

fn cached_chunk(id: &str) -> Document {
    Document {
        id: id.to_string(),
        content: "O dNBR é a diferença entre o NBR pré-fogo e o NBR pós-fogo.".to_string(),
        metadata: DocumentMetadata {
            title: "guia (Parte 1)".to_string(),
            source: "Documentos SeverusPT".to_string(),
            category: "incendios_florestais".to_string(),
            date: Some("2024-09-01".to_string()),
        },
        embedding: Some(vec![1.0, 0.0]),
        hash: None,
    }
}

#[tokio::test]
async fn test_health() {
    let app = spawn_app(None, |_, _| {}).await;
    let resp = app.get("/health").await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_severity_maps_returns_four_layers() {
    let app = spawn_app(Some(burned_engine()), |_, _| {}).await;
    let resp = app.post("/severity-maps", severity_body()).await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    let maps = body["maps"].as_array().unwrap();
    let names: Vec<&str> = maps.iter().map(|m| m["name"].as_str().unwrap()).collect();
    assert_eq!(names, vec!["dNBR", "RdNBR", "RBR", "Severity"]);
    for map in maps {
        assert!(map["tileUrl"].as_str().unwrap().ends_with("/{z}/{x}/{y}"));
    }
}

#[tokio::test]
async fn test_severity_stats_reports_class_areas() {
    let app = spawn_app(Some(burned_engine()), |_, _| {}).await;
    let resp = app.post("/severity-stats", severity_body()).await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    let totals = body["classTotals"].as_object().unwrap();
    assert_eq!(totals.keys().collect::<Vec<_>>(), vec!["5"]);
    let high = totals["5"].as_f64().unwrap();
    assert!(high > 0.0);
    assert!((body["totalArea"].as_f64().unwrap() - high).abs() < 1e-9);
    assert!(body["pixelCounts"]["5"].as_f64().unwrap() > 0.0);
}

fn segmented_body(params_key: &str, min_pix: u32) -> Value {
    let mut body = severity_body();
    body["applySegmentation"] = json!(true);
    body[params_key] = json!({ "minPix": min_pix });
    body
}

#[tokio::test]
async fn test_segmentation_masks_patches_below_min_pix() {
    let engine = Arc::new(burned_engine());
    let app = spawn_app_shared(Some(engine.clone()), |_, _| {}).await;

    // The burned patch is 16 pixels.
    let resp = app
        .post("/severity-maps", segmented_body("segmentationParams", 17))
        .await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    let maps = body["maps"].as_array().unwrap();
    assert_eq!(maps.len(), 4);
    for map in maps {
        let url = map["tileUrl"].as_str().unwrap();
        let tile = engine.tile(url).unwrap();
        assert!(tile.is_fully_masked(), "{} has unmasked pixels", map["name"]);
    }

    let resp = app
        .post("/severity-stats", segmented_body("segmentationParams", 17))
        .await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert!(body["classTotals"].as_object().unwrap().is_empty());
    assert_eq!(body["totalArea"].as_f64().unwrap(), 0.0);
    assert_eq!(body["maxClassTotal"].as_f64().unwrap(), 0.0);
}

#[tokio::test]
async fn test_segmentation_keeps_large_enough_patches() {
    let engine = Arc::new(burned_engine());
    let app = spawn_app_shared(Some(engine.clone()), |_, _| {}).await;

    let resp = app
        .post("/severity-maps", segmented_body("segmentationParams", 4))
        .await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    let severity = body["maps"]
        .as_array()
        .unwrap()
        .iter()
        .find(|m| m["name"] == "Severity")
        .unwrap();
    let tile = engine.tile(severity["tileUrl"].as_str().unwrap()).unwrap();
    assert!(tile.valid_pixels() > 0);

    let resp = app
        .post("/severity-stats", segmented_body("segmentationParams", 4))
        .await;
    let body: Value = resp.json().await.unwrap();
    assert!(body["classTotals"]["5"].as_f64().unwrap() > 0.0);
}

#[tokio::test]
async fn test_segm_params_alias_is_accepted() {
    let app = spawn_app(Some(burned_engine()), |_, _| {}).await;

    let resp = app.post("/severity-stats", segmented_body("segmParams", 17)).await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert!(body["classTotals"].as_object().unwrap().is_empty());
    assert_eq!(body["totalArea"].as_f64().unwrap(), 0.0);

    let resp = app.post("/severity-stats", segmented_body("segmParams", 4)).await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["classTotals"].as_object().unwrap().len(), 1);
}

#[tokio::test]
async fn test_segmentation_flag_off_ignores_params() {
    let app = spawn_app(Some(burned_engine()), |_, _| {}).await;
    let mut body = segmented_body("segmentationParams", 17);
    body["applySegmentation"] = json!(false);
    let resp = app.post("/severity-stats", body).await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert!(body["totalArea"].as_f64().unwrap() > 0.0);
}

#[tokio::test]
async fn test_no_images_in_window_is_404() {
    let app = spawn_app(Some(burned_engine()), |_, _| {}).await;
    let mut body = severity_body();
    body["preStart"] = json!("2020-01-01");
    body["preEnd"] = json!("2020-02-01");
    let resp = app.post("/severity-maps", body).await;
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "no_images");
    let message = body["error"]["message"].as_str().unwrap();
    assert!(message.contains("2020-01-01"));
    assert!(message.contains("2020-02-01"));
}

#[tokio::test]
async fn test_missing_parameter_is_400() {
    let app = spawn_app(Some(burned_engine()), |_, _| {}).await;
    let mut body = severity_body();
    body.as_object_mut().unwrap().remove("satellite");
    let resp = app.post("/severity-maps", body).await;
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");
    assert!(body["error"]["message"].as_str().unwrap().contains("satellite"));
}

#[tokio::test]
async fn test_unknown_satellite_is_400() {
    let app = spawn_app(Some(burned_engine()), |_, _| {}).await;
    let mut body = severity_body();
    body["satellite"] = json!("Sentinel-3/OLCI");
    let resp = app.post("/severity-stats", body).await;
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_malformed_json_is_400() {
    let app = spawn_app(Some(burned_engine()), |_, _| {}).await;
    let resp = app
        .client
        .post(format!("{}/severity-maps", app.base))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_geospatial_routes_need_engine() {
    let app = spawn_app(None, |_, _| {}).await;
    let resp = app.post("/severity-maps", severity_body()).await;
    assert_eq!(resp.status(), 503);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "engine_unavailable");
}

#[tokio::test]
async fn test_image_list() {
    let app = spawn_app(Some(burned_engine()), |_, _| {}).await;
    let resp = app.post("/image-list", severity_body()).await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(
        body["preImageIds"],
        json!(["20240610T112119_20240610T112117_T29TNE"])
    );
    assert_eq!(
        body["postImageIds"],
        json!(["20240815T112119_20240815T112117_T29TNE"])
    );
}

#[tokio::test]
async fn test_timeseries_points() {
    let app = spawn_app(Some(burned_engine()), |_, _| {}).await;
    let resp = app
        .post(
            "/timeseries",
            json!({
                "satellite": "Sentinel-2/MSI",
                "index": "NBR",
                "startDate": "2024-01-01",
                "endDate": "2024-12-31",
                "geometry": grid_polygon()
            }),
        )
        .await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    let data = body["data"].as_array().unwrap();
    assert_eq!(data.len(), 2);
    assert_eq!(data[0]["date"], "2024-06-10");
    assert!((data[0]["value"].as_f64().unwrap() - 0.5).abs() < 1e-9);
    assert!((data[1]["value"].as_f64().unwrap() + 0.5).abs() < 1e-9);
}

#[tokio::test]
async fn test_download_streams_geotiff() {
    let app = spawn_app(Some(burned_engine()), |_, _| {}).await;
    let mut body = severity_body();
    body["type"] = json!("RBR");
    let resp = app.post("/download", body).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-type"], "image/tiff");
    let disposition = resp.headers()["content-disposition"].to_str().unwrap().to_string();
    assert!(disposition.starts_with("attachment; filename=\"RBR_"));
    assert!(disposition.ends_with(".tif\""));
    let bytes = resp.bytes().await.unwrap();
    assert_eq!(&bytes[..4], b"II*\0");
}

#[tokio::test]
async fn test_download_unknown_layer_is_400() {
    let app = spawn_app(Some(burned_engine()), |_, _| {}).await;
    let mut body = severity_body();
    body["type"] = json!("NDVI");
    let resp = app.post("/download", body).await;
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_burned_areas_by_year() {
    let app = spawn_app(Some(burned_engine()), |_, _| {}).await;
    let resp = app
        .post("/burned-areas", json!({"dataset": "ICNF", "year": "2017"}))
        .await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["type"], "FeatureCollection");
    assert_eq!(body["features"].as_array().unwrap().len(), 1);

    let resp = app
        .post("/burned-areas", json!({"dataset": "ICNF", "year": 2018}))
        .await;
    let body: Value = resp.json().await.unwrap();
    assert!(body["features"].as_array().unwrap().is_empty());

    let resp = app
        .post("/burned-areas", json!({"dataset": "MODIS", "year": 2017}))
        .await;
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_mapper_hit_miss_and_range() {
    let app = spawn_app(Some(burned_engine()), |_, _| {}).await;
    let resp = app
        .post("/mapper", json!({"lat": 39.95, "lon": -7.95, "dataset": "ICNF", "year": 2017}))
        .await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["properties"]["NCCO"], "Pedrógão Grande");

    let resp = app
        .post("/mapper", json!({"lat": 41.0, "lon": -7.95, "dataset": "ICNF", "year": 2017}))
        .await;
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["message"], "Nenhuma área encontrada");

    let resp = app
        .post("/mapper", json!({"lat": 95.0, "lon": -7.95, "dataset": "ICNF", "year": 2017}))
        .await;
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_rag_status_without_cache() {
    let app = spawn_app(None, |_, _| {}).await;
    let resp = app.get("/rag/status").await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["ready"], false);
    assert!(body.get("stats").is_none());
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn test_rag_status_with_cache() {
    let tmp = TempDir::new().unwrap();
    let cache_path = tmp.path().join("cache.json");
    write_cache_file(&cache_path, &[cached_chunk("guia.pdf_chunk_0"), cached_chunk("guia.pdf_chunk_1")])
        .await
        .unwrap();
    let app = spawn_app(None, move |_, config| config.rag.cache_path = cache_path).await;

    let body: Value = app.get("/rag/status").await.json().await.unwrap();
    assert_eq!(body["ready"], true);
    assert_eq!(body["stats"]["totalDocuments"], 1);
    assert_eq!(body["stats"]["totalChunks"], 2);
    assert_eq!(body["stats"]["hasEmbeddings"], true);
    drop(tmp);
}

#[tokio::test]
async fn test_chat_falls_back_without_api_key() {
    let app = spawn_app(None, |_, _| {}).await;
    let resp = app
        .post(
            "/chat",
            json!({"messages": [{"role": "user", "content": "O que é o RdNBR?"}]}),
        )
        .await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(
        body["reply"],
        "Erro temporário no serviço. Por favor, tente novamente."
    );
    // No cache file yet.
    assert_eq!(body["context"], "Contexto indisponível");
}

#[tokio::test]
async fn test_chat_rejects_non_user_last_message() {
    let app = spawn_app(None, |_, _| {}).await;
    let resp = app
        .post(
            "/chat",
            json!({"messages": [{"role": "assistant", "content": "Olá"}]}),
        )
        .await;
    assert_eq!(resp.status(), 400);

    let resp = app.post("/chat", json!({"messages": []})).await;
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_rag_init_then_chat_finds_context() {
    let app = spawn_app(None, |tmp, _| {
        let docs = tmp.path().join("docs");
        std::fs::create_dir_all(&docs).unwrap();
        std::fs::write(
            docs.join("severidade.txt"),
            "A severidade do fogo mede a perda de matéria orgânica.",
        )
        .unwrap();
    })
    .await;

    let resp = app.post("/rag/init", json!({})).await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["report"]["chunks"], 1);
    assert_eq!(body["report"]["embedded"], 1);

    let status: Value = app.get("/rag/status").await.json().await.unwrap();
    assert_eq!(status["ready"], true);

    let body: Value = app
        .post(
            "/chat",
            json!({"messages": [{"role": "user", "content": "O que é a severidade?"}]}),
        )
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(body["context"], "Contexto encontrado");
}
