//! Market-data provider adapters.
//!
//! A source serves the provider's listing one page at a time as a raw
//! [`TabularResponse`]; conversion into records happens downstream.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, instrument};

use refsync_converter::{ConvertError, TabularResponse};

use crate::config::ProviderSettings;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Network trouble or a provider-side hiccup; asking again may work.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// The provider refused the request.
    #[error("provider rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error(transparent)]
    Payload(#[from] ConvertError),
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Unavailable(_))
    }
}

/// Paged access to a provider listing.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Rows `start..start + limit`; an empty page ends the listing.
    async fn fetch_page(&self, start: usize, limit: usize)
    -> Result<TabularResponse, SourceError>;
}

#[async_trait]
impl<T> MarketDataSource for std::sync::Arc<T>
where
    T: MarketDataSource + ?Sized,
{
    async fn fetch_page(
        &self,
        start: usize,
        limit: usize,
    ) -> Result<TabularResponse, SourceError> {
        (**self).fetch_page(start, limit).await
    }
}

/// Fixed in-memory listing, sliced into pages on request.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    response: TabularResponse,
}

impl StaticSource {
    pub fn new(response: TabularResponse) -> Self {
        Self { response }
    }
}

#[async_trait]
impl MarketDataSource for StaticSource {
    async fn fetch_page(
        &self,
        start: usize,
        limit: usize,
    ) -> Result<TabularResponse, SourceError> {
        let rows = self
            .response
            .rows
            .iter()
            .skip(start)
            .take(limit)
            .cloned()
            .collect();
        Ok(TabularResponse {
            columns: self.response.columns.clone(),
            column_metadata: self.response.column_metadata.clone(),
            rows,
        })
    }
}

/// MOEX ISS-style HTTP provider (`{base}/securities.json`).
#[derive(Debug, Clone)]
pub struct IssHttpSource {
    client: reqwest::Client,
    base_url: String,
    block: String,
}

impl IssHttpSource {
    pub fn new(settings: &ProviderSettings, timeout: Duration) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SourceError::Unavailable(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: settings.url.trim_end_matches('/').to_string(),
            block: refsync_securities::SECURITIES_BLOCK.to_string(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/{}.json", self.base_url, self.block)
    }
}

fn transport_error(e: reqwest::Error) -> SourceError {
    SourceError::Unavailable(e.to_string())
}

fn status_error(status: StatusCode, body: String) -> SourceError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        SourceError::Unavailable(format!("{status}: {body}"))
    } else {
        SourceError::Rejected {
            status: status.as_u16(),
            body,
        }
    }
}

#[async_trait]
impl MarketDataSource for IssHttpSource {
    #[instrument(skip(self), fields(url = %self.endpoint()), err)]
    async fn fetch_page(
        &self,
        start: usize,
        limit: usize,
    ) -> Result<TabularResponse, SourceError> {
        let response = self
            .client
            .get(self.endpoint())
            .query(&[
                ("iss.meta", "on".to_string()),
                ("start", start.to_string()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }

        let document: serde_json::Value = response.json().await.map_err(|e| {
            if e.is_decode() {
                SourceError::Payload(ConvertError::MalformedPayload(e.to_string()))
            } else {
                transport_error(e)
            }
        })?;
        let page = TabularResponse::from_json_block(&document, &self.block)?;
        debug!(rows = page.row_count(), "page fetched");
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn listing(rows: usize) -> TabularResponse {
        let document = json!({
            "securities": {
                "columns": ["secid"],
                "metadata": {"secid": {"type": "string"}},
                "data": (0..rows).map(|i| json!([format!("SEC{i}")])).collect::<Vec<_>>(),
            }
        });
        TabularResponse::from_json_block(&document, "securities").unwrap()
    }

    #[tokio::test]
    async fn static_source_pages_until_empty() {
        let source = StaticSource::new(listing(5));

        let first = source.fetch_page(0, 2).await.unwrap();
        assert_eq!(first.rows, vec![vec![json!("SEC0")], vec![json!("SEC1")]]);
        assert_eq!(first.columns, vec!["secid".to_string()]);

        assert_eq!(source.fetch_page(4, 2).await.unwrap().row_count(), 1);
        assert!(source.fetch_page(5, 2).await.unwrap().is_empty());
    }

    #[test]
    fn server_errors_and_throttling_are_transient() {
        assert!(status_error(StatusCode::BAD_GATEWAY, String::new()).is_transient());
        assert!(status_error(StatusCode::TOO_MANY_REQUESTS, String::new()).is_transient());
        assert!(!status_error(StatusCode::NOT_FOUND, "no such board".into()).is_transient());
    }

    #[test]
    fn endpoint_ignores_trailing_slash() {
        let settings = ProviderSettings {
            url: "https://iss.example.test/iss/".to_string(),
            page_size: 100,
        };
        let source = IssHttpSource::new(&settings, Duration::from_secs(5)).unwrap();
        assert_eq!(
            source.endpoint(),
            "https://iss.example.test/iss/securities.json"
        );
    }
}
