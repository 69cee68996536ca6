//! Earth Engine REST v1 client.
//!
//! | Operation | Request |
//! |-----------|---------|
//! | `compute_value` | `POST {base}/projects/{p}/value:compute` |
//! | `map_tile_url` | `POST {base}/projects/{p}/maps`, tiles at `{base}/{name}/tiles/{z}/{x}/{y}` |
//! | `download_geotiff` | `POST {base}/projects/{p}/thumbnails`, then `GET {base}/{name}:getPixels` |
//!
//! Authentication is a bearer token. Acquiring and refreshing it is left to
//! the deployment: the token is read from `access_token_file` when set,
//! otherwise from the environment variable named by `access_token_env`, on
//! every request.

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;

use severus_core::engine::{ByteStream, Engine, EngineError, VisParams};
use severus_core::expr::{Expr, Geometry, Image};

use crate::config::EarthEngineConfig;

pub struct RestEngine {
    client: reqwest::Client,
    base_url: String,
    project: String,
    token_env: String,
    token_file: Option<PathBuf>,
}

impl RestEngine {
    pub fn new(config: &EarthEngineConfig) -> Result<Self> {
        let Some(project) = config.project.clone() else {
            bail!("earth_engine.project must be set to use the Earth Engine API");
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            project,
            token_env: config.access_token_env.clone(),
            token_file: config.access_token_file.clone(),
        })
    }

    /// Read per request so a refreshed token file takes effect.
    async fn token(&self) -> Result<String, EngineError> {
        let token = match &self.token_file {
            Some(path) => tokio::fs::read_to_string(path).await.map_err(|e| {
                EngineError::Transport(format!("cannot read token file {}: {}", path.display(), e))
            })?,
            None => std::env::var(&self.token_env)
                .map_err(|_| EngineError::Transport(format!("{} is not set", self.token_env)))?,
        };
        let token = token.trim().to_string();
        if token.is_empty() {
            return Err(EngineError::Transport("empty Earth Engine access token".to_string()));
        }
        Ok(token)
    }

    fn project_url(&self, method: &str) -> String {
        format!("{}/projects/{}/{}", self.base_url, self.project, method)
    }

    async fn post_json(&self, url: &str, body: &Value) -> Result<Value, EngineError> {
        let response = self
            .client
            .post(url)
            .bearer_auth(self.token().await?)
            .json(body)
            .send()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        let response = check_status(response).await?;
        response
            .json()
            .await
            .map_err(|e| EngineError::Decode(e.to_string()))
    }
}

/// Turn a non-2xx response into [`EngineError::Upstream`], keeping the
/// API's own `error.message` when there is one.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, EngineError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|v| v.pointer("/error/message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or(text);
    tracing::warn!(status = status.as_u16(), %message, "Earth Engine request failed");
    Err(EngineError::Upstream {
        status: status.as_u16(),
        message,
    })
}

fn name_of(response: &Value) -> Result<&str, EngineError> {
    response
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::Decode("response has no name".to_string()))
}

#[async_trait]
impl Engine for RestEngine {
    async fn compute_value(&self, expr: &Expr) -> Result<Value, EngineError> {
        tracing::debug!(function = ?expr.function_name(), "value:compute");
        let body = json!({ "expression": expr.to_request_json() });
        let mut response = self.post_json(&self.project_url("value:compute"), &body).await?;
        response
            .get_mut("result")
            .map(Value::take)
            .ok_or_else(|| EngineError::Decode("value:compute response has no result".to_string()))
    }

    async fn map_tile_url(&self, image: &Image, vis: &VisParams) -> Result<String, EngineError> {
        let visualized = image.visualize(vis.min, vis.max, &vis.palette);
        let body = json!({ "expression": visualized.expr().to_request_json() });
        let response = self.post_json(&self.project_url("maps"), &body).await?;
        Ok(format!("{}/{}/tiles/{{z}}/{{x}}/{{y}}", self.base_url, name_of(&response)?))
    }

    async fn download_geotiff(
        &self,
        image: &Image,
        region: &Geometry,
        scale: f64,
    ) -> Result<ByteStream, EngineError> {
        let clipped = image.clip_to_bounds_and_scale(region, scale);
        let body = json!({
            "expression": clipped.expr().to_request_json(),
            "fileFormat": "GEO_TIFF",
        });
        let thumbnail = self.post_json(&self.project_url("thumbnails"), &body).await?;
        let url = format!("{}/{}:getPixels", self.base_url, name_of(&thumbnail)?);

        let response = self
            .client
            .get(&url)
            .bearer_auth(self.token().await?)
            .send()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        let response = check_status(response).await?;
        tracing::info!(scale, "streaming GeoTIFF export");

        Ok(response
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(|e| EngineError::Transport(e.to_string()))
            })
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_project() {
        let config = EarthEngineConfig::default();
        let err = RestEngine::new(&config).err().unwrap();
        assert!(err.to_string().contains("earth_engine.project"));
    }

    #[tokio::test]
    async fn test_token_file_is_trimmed() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "ya29.abc\n").unwrap();
        let config = EarthEngineConfig {
            project: Some("demo".to_string()),
            access_token_file: Some(path),
            ..EarthEngineConfig::default()
        };
        let engine = RestEngine::new(&config).unwrap();
        assert_eq!(engine.token().await.unwrap(), "ya29.abc");
        assert_eq!(
            engine.project_url("maps"),
            "https://earthengine.googleapis.com/v1/projects/demo/maps"
        );
    }

    #[tokio::test]
    async fn test_token_file_refresh_and_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "ya29.first").unwrap();
        let config = EarthEngineConfig {
            project: Some("demo".to_string()),
            access_token_file: Some(path.clone()),
            ..EarthEngineConfig::default()
        };
        let engine = RestEngine::new(&config).unwrap();
        assert_eq!(engine.token().await.unwrap(), "ya29.first");

        std::fs::write(&path, "ya29.second\n").unwrap();
        assert_eq!(engine.token().await.unwrap(), "ya29.second");

        std::fs::write(&path, "  \n").unwrap();
        assert!(matches!(engine.token().await, Err(EngineError::Transport(_))));

        std::fs::remove_file(&path).unwrap();
        let err = engine.token().await.unwrap_err();
        assert!(err.to_string().contains("cannot read token file"));
    }
}
