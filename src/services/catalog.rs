//! Firmware catalog sources.
//!
//! The catalog document lists models, their model-family substrings and
//! known releases. It can come from an HTTP endpoint or a local JSON/TOML
//! file.

use crate::models::config::CatalogConfig;
use crate::models::firmware::CatalogDocument;
use crate::utils::fs::get_extension;
use crate::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

/// Where catalog documents come from.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Fetch the current document.
    async fn fetch(&self) -> Result<CatalogDocument>;

    /// Human readable location, for logs.
    fn describe(&self) -> String;
}

/// Catalog served over HTTP(S).
pub struct HttpCatalogSource {
    url: String,
    client: reqwest::Client,
}

impl HttpCatalogSource {
    pub fn new(url: &str, config: &CatalogConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .user_agent(concat!("lgtv_downgrade/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            url: url.to_string(),
            client,
        })
    }
}

#[async_trait]
impl CatalogSource for HttpCatalogSource {
    async fn fetch(&self) -> Result<CatalogDocument> {
        tracing::debug!("Fetching catalog from {}", self.url);

        let response = self.client.get(&self.url).send().await?;
        if !response.status().is_success() {
            return Err(crate::Error::CatalogUnavailable(format!(
                "{} returned {}",
                self.url,
                response.status()
            )));
        }

        let doc: CatalogDocument = response.json().await?;
        Ok(doc)
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

/// Catalog stored in a local JSON or TOML file.
pub struct FileCatalogSource {
    path: PathBuf,
}

impl FileCatalogSource {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl CatalogSource for FileCatalogSource {
    async fn fetch(&self) -> Result<CatalogDocument> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            crate::Error::CatalogUnavailable(format!("{}: {}", self.path.display(), e))
        })?;

        let doc = match get_extension(&self.path).as_deref() {
            Some("toml") => toml::from_str(&content)?,
            _ => serde_json::from_str(&content)?,
        };
        Ok(doc)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Build the configured source. A local file wins over a URL.
pub fn source_from_config(config: &CatalogConfig) -> Result<Option<Arc<dyn CatalogSource>>> {
    if let Some(path) = &config.file {
        return Ok(Some(Arc::new(FileCatalogSource::new(path.clone()))));
    }
    match config.effective_url() {
        Some(url) => Ok(Some(Arc::new(HttpCatalogSource::new(&url, config)?))),
        None => Ok(None),
    }
}
