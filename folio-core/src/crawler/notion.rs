/*!
HTTP client for the Notion public API.
*/

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::{ApiPage, WorkspaceApi};
use crate::config::CrawlerConfig;
use crate::error::is_transient_status;
use crate::{FolioError, Result};

/// One page of a Notion list response
#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    results: Vec<Value>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    next_cursor: Option<String>,
}

impl From<ListResponse> for ApiPage {
    fn from(response: ListResponse) -> Self {
        ApiPage {
            results: response.results,
            next_cursor: response.next_cursor.filter(|_| response.has_more),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// [`WorkspaceApi`] backed by the Notion REST API
///
/// The access token is consumed as an already-decrypted opaque string.
#[derive(Debug, Clone)]
pub struct NotionApi {
    client: Client,
    base_url: String,
    version: String,
    token: String,
    page_size: u32,
}

impl NotionApi {
    pub fn new(token: impl Into<String>, config: &CrawlerConfig) -> Result<Self> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(FolioError::validation("workspace access token is empty"));
        }

        let client = Client::builder()
            .timeout(config.request_timeout())
            .user_agent(concat!("folio/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            version: config.api_version.clone(),
            token,
            page_size: config.effective_page_size(),
        })
    }

    fn paged_body(&self, cursor: Option<String>) -> Value {
        let mut body = Map::new();
        body.insert("page_size".to_string(), json!(self.page_size));
        if let Some(cursor) = cursor {
            body.insert("start_cursor".to_string(), Value::String(cursor));
        }
        Value::Object(body)
    }

    async fn send(&self, resource: &str, request: RequestBuilder) -> Result<ApiPage> {
        let response = request
            .bearer_auth(&self.token)
            .header("Notion-Version", &self.version)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_response(status.as_u16(), &body, resource));
        }

        let page: ApiPage = response.json::<ListResponse>().await?.into();
        debug!(resource, results = page.results.len(), more = page.next_cursor.is_some(), "fetched page");
        Ok(page)
    }
}

#[async_trait]
impl WorkspaceApi for NotionApi {
    async fn search(&self, cursor: Option<String>) -> Result<ApiPage> {
        let request = self
            .client
            .post(format!("{}/search", self.base_url))
            .json(&self.paged_body(cursor));
        self.send("search", request).await
    }

    async fn list_children(&self, block_id: String, cursor: Option<String>) -> Result<ApiPage> {
        let mut query = vec![("page_size", self.page_size.to_string())];
        if let Some(cursor) = cursor {
            query.push(("start_cursor", cursor));
        }
        let request = self
            .client
            .get(format!("{}/blocks/{block_id}/children", self.base_url))
            .query(&query);
        self.send(&format!("blocks/{block_id}"), request).await
    }

    async fn query_database(&self, database_id: String, cursor: Option<String>) -> Result<ApiPage> {
        let request = self
            .client
            .post(format!("{}/databases/{database_id}/query", self.base_url))
            .json(&self.paged_body(cursor));
        self.send(&format!("databases/{database_id}"), request).await
    }
}

/// Map a non-success HTTP response onto the error taxonomy
fn classify_response(status: u16, body: &str, resource: &str) -> FolioError {
    let parsed: Option<ErrorBody> = serde_json::from_str(body).ok();
    let message = parsed
        .as_ref()
        .and_then(|b| b.message.clone())
        .unwrap_or_else(|| body.chars().take(200).collect());
    let code = parsed.and_then(|b| b.code).unwrap_or_default();

    match status {
        404 => FolioError::not_found(format!("notion:{resource}")),
        401 | 403 => FolioError::Api {
            status: Some(status),
            message: format!("permission denied for {resource}: {message}"),
            transient: false,
        },
        _ => FolioError::Api {
            status: Some(status),
            message: if code.is_empty() { message } else { format!("{code}: {message}") },
            transient: is_transient_status(status),
        },
    }
}
