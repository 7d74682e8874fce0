//! Geocoding providers.
//!
//! The pipeline consumes geocoding as a black-box capability behind
//! [`GeocodeProvider`]; the shipped implementation speaks the common
//! Nominatim-style search API over HTTP.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::geometry::Coordinate;

/// Provider failure classification. Transient failures are retried with
/// backoff; permanent failures are recorded as not-found, never raised as a
/// pipeline fault.
#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("transient geocoder failure: {0}")]
    Transient(String),
    #[error("permanent geocoder failure: {0}")]
    Permanent(String),
}

#[async_trait]
pub trait GeocodeProvider: Send + Sync {
    /// Provider identity recorded on cache entries.
    fn name(&self) -> &str;

    /// Resolve a normalized address query to a coordinate. `Ok(None)` means
    /// the provider answered and found nothing.
    async fn lookup(&self, query: &str) -> Result<Option<Coordinate>, GeocodeError>;
}

/// Nominatim-style JSON hit.
#[derive(Debug, Deserialize)]
struct SearchHit {
    lat: String,
    lon: String,
}

/// HTTP geocoder against a Nominatim-shaped search endpoint.
pub struct HttpGeocoder {
    client: reqwest::Client,
    base_url: Url,
    name: String,
}

impl HttpGeocoder {
    pub fn new(base_url: &str, user_agent: &str) -> Result<Self, GeocodeError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| GeocodeError::Permanent(format!("bad geocoder URL {base_url:?}: {e}")))?;
        let name = base_url.host_str().unwrap_or("geocoder").to_string();
        let client = reqwest::Client::builder()
            .user_agent(user_agent.to_string())
            .build()
            .map_err(|e| GeocodeError::Permanent(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url,
            name,
        })
    }
}

#[async_trait]
impl GeocodeProvider for HttpGeocoder {
    fn name(&self) -> &str {
        &self.name
    }

    async fn lookup(&self, query: &str) -> Result<Option<Coordinate>, GeocodeError> {
        let mut url = self.base_url.clone();
        url.query_pairs_mut()
            .append_pair("q", query)
            .append_pair("format", "json")
            .append_pair("limit", "1");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| GeocodeError::Transient(format!("request failed: {e}")))?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(GeocodeError::Transient(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(GeocodeError::Permanent(format!("HTTP {status}")));
        }

        let hits: Vec<SearchHit> = response
            .json()
            .await
            .map_err(|e| GeocodeError::Permanent(format!("bad response body: {e}")))?;

        let Some(hit) = hits.into_iter().next() else {
            return Ok(None);
        };
        let latitude = hit
            .lat
            .parse::<f64>()
            .map_err(|_| GeocodeError::Permanent(format!("bad latitude {:?}", hit.lat)))?;
        let longitude = hit
            .lon
            .parse::<f64>()
            .map_err(|_| GeocodeError::Permanent(format!("bad longitude {:?}", hit.lon)))?;
        Ok(Some(Coordinate {
            latitude,
            longitude,
        }))
    }
}
