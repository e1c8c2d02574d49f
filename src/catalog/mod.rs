//! Driver catalog collaborator
//!
//! Operators pick a driver before issuing `install_printer`; the server only
//! relays catalog metadata and never interprets it. The catalog is either a
//! static list from config or an upstream HTTP service.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::config::CatalogConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub manufacturer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub models: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("catalog returned HTTP {0}")]
    Status(u16),
}

#[async_trait::async_trait]
pub trait DriverCatalog: Send + Sync {
    async fn list(&self) -> Result<Vec<DriverInfo>, CatalogError>;

    async fn lookup(&self, driver_id: &str) -> Result<Option<DriverInfo>, CatalogError>;
}

/// Serves a fixed list.
#[derive(Debug, Clone, Default)]
pub struct StaticDriverCatalog {
    drivers: Vec<DriverInfo>,
}

impl StaticDriverCatalog {
    pub fn new(drivers: Vec<DriverInfo>) -> Self {
        Self { drivers }
    }
}

#[async_trait::async_trait]
impl DriverCatalog for StaticDriverCatalog {
    async fn list(&self) -> Result<Vec<DriverInfo>, CatalogError> {
        Ok(self.drivers.clone())
    }

    async fn lookup(&self, driver_id: &str) -> Result<Option<DriverInfo>, CatalogError> {
        Ok(self.drivers.iter().find(|d| d.id == driver_id).cloned())
    }
}

/// Proxies `GET {base}/api/drivers` and `GET {base}/api/drivers/{id}`.
#[derive(Debug, Clone)]
pub struct HttpDriverCatalog {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDriverCatalog {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, CatalogError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait::async_trait]
impl DriverCatalog for HttpDriverCatalog {
    async fn list(&self) -> Result<Vec<DriverInfo>, CatalogError> {
        let url = format!("{}/api/drivers", self.base_url);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(CatalogError::Status(response.status().as_u16()));
        }
        Ok(response.json().await?)
    }

    async fn lookup(&self, driver_id: &str) -> Result<Option<DriverInfo>, CatalogError> {
        let url = format!("{}/api/drivers/{}", self.base_url, driver_id);
        let response = self.client.get(&url).send().await?;
        match response.status() {
            reqwest::StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await?)),
            status => Err(CatalogError::Status(status.as_u16())),
        }
    }
}

/// Upstream when `catalog.url` is set, else the static list.
pub fn from_config(config: &CatalogConfig) -> Result<Box<dyn DriverCatalog>, CatalogError> {
    match config.url.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
        Some(url) => Ok(Box::new(HttpDriverCatalog::new(
            url,
            Duration::from_millis(config.timeout_ms),
        )?)),
        None => Ok(Box::new(StaticDriverCatalog::new(config.drivers.clone()))),
    }
}
