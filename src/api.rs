//! HTTP client for the portal's file-explorer endpoints.
//!
//! Listings and tree nodes ride an opaque version-tag protocol: the last
//! known tag goes out as `If-None-Match`, and the server either answers
//! 304 with no body or sends a full payload with a fresh `ETag`.

use std::sync::Arc;

use reqwest::{header, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::ExplorerError;
use crate::models::listing::{DirectoryListing, ListingQuery};
use crate::models::tree::TreeNode;

/// Supplies the bearer credential for each request. Session refresh is an
/// external collaborator; this layer only attaches what it is given.
pub type TokenSource = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// Result of a conditional fetch against a tagged resource.
#[derive(Debug, Clone, PartialEq)]
pub enum Conditional<T> {
    /// The held tag still matches; the server sent no body.
    NotModified,
    /// Full payload plus the tag that now represents it.
    Fresh { data: T, tag: Option<String> },
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    success: bool,
    message: Option<String>,
    data: Option<T>,
}

pub struct PortalApi {
    http: reqwest::Client,
    base_url: String,
    token_source: TokenSource,
}

impl PortalApi {
    pub fn new(base_url: impl Into<String>, token_source: TokenSource) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token_source,
        }
    }

    fn request(&self, method: Method, endpoint: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(method, format!("{}{}", self.base_url, endpoint));
        if let Some(token) = (self.token_source)() {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    pub async fn fetch_listing(
        &self,
        query: &ListingQuery,
        tag: Option<&str>,
    ) -> Result<Conditional<DirectoryListing>, ExplorerError> {
        let mut request = self.request(Method::GET, "/api/file-explorer/list").query(&[
            ("path", query.path.clone()),
            ("page", query.page.to_string()),
            ("pageSize", query.page_size.to_string()),
            ("sortBy", query.sort_by.to_string()),
            ("sortOrder", query.sort_order.to_string()),
        ]);
        if let Some(tag) = tag {
            request = request.header(header::IF_NONE_MATCH, tag);
        }

        let response = request.send().await?;
        match response.status() {
            StatusCode::NOT_MODIFIED => Ok(Conditional::NotModified),
            StatusCode::UNAUTHORIZED => Err(ExplorerError::Unauthorized),
            StatusCode::NOT_FOUND => Err(ExplorerError::NotFound(query.path.clone())),
            status if !status.is_success() => Err(envelope_error(status, response).await),
            _ => {
                let tag = response_tag(&response);
                let listing = decode_data(response).await?;
                Ok(Conditional::Fresh { data: listing, tag })
            }
        }
    }

    pub async fn fetch_tree(
        &self,
        path: &str,
        depth: u8,
        tag: Option<&str>,
    ) -> Result<Conditional<TreeNode>, ExplorerError> {
        let mut request = self.request(Method::GET, "/api/file-explorer/tree").query(&[
            ("path", path.to_string()),
            ("depth", depth.clamp(1, 3).to_string()),
        ]);
        if let Some(tag) = tag {
            request = request.header(header::IF_NONE_MATCH, tag);
        }

        let response = request.send().await?;
        match response.status() {
            StatusCode::NOT_MODIFIED => Ok(Conditional::NotModified),
            StatusCode::UNAUTHORIZED => Err(ExplorerError::Unauthorized),
            StatusCode::NOT_FOUND => Err(ExplorerError::NotFound(path.to_string())),
            status if !status.is_success() => Err(envelope_error(status, response).await),
            _ => {
                let tag = response_tag(&response);
                let node = decode_data(response).await?;
                Ok(Conditional::Fresh { data: node, tag })
            }
        }
    }

    /// Existence probe for a folder path: 2xx means it exists, a definitive
    /// 404 means it does not. Anything else is an error for the caller to
    /// interpret.
    pub async fn folder_exists(&self, path: &str) -> Result<bool, ExplorerError> {
        let response = self
            .request(Method::GET, "/api/file-explorer/exists")
            .query(&[("path", path)])
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            StatusCode::UNAUTHORIZED => Err(ExplorerError::Unauthorized),
            status if status.is_success() => Ok(true),
            status => Err(envelope_error(status, response).await),
        }
    }

    /// Existence probe for a file record in the authoritative store. A 404
    /// means the record itself is gone; a 2xx means the record exists even
    /// when the physical payload is missing on disk.
    pub async fn file_record_exists(&self, file_id: i64) -> Result<bool, ExplorerError> {
        let response = self
            .request(
                Method::GET,
                &format!("/api/file-explorer/files/{file_id}/metadata"),
            )
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            StatusCode::UNAUTHORIZED => Err(ExplorerError::Unauthorized),
            status if status.is_success() => Ok(true),
            status => Err(envelope_error(status, response).await),
        }
    }

    /// Ask the server to drop its own cached listings for a path. Best
    /// effort: every failure maps to `ServerCache` so call sites can log
    /// and move on.
    pub async fn refresh_server_cache(
        &self,
        path: &str,
        recursive: bool,
    ) -> Result<(), ExplorerError> {
        let result = self
            .request(Method::POST, "/api/file-explorer/refresh-cache")
            .query(&[("path", path.to_string()), ("recursive", recursive.to_string())])
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => Err(ExplorerError::ServerCache(format!(
                "status {}",
                response.status().as_u16()
            ))),
            Err(e) => Err(ExplorerError::ServerCache(e.to_string())),
        }
    }
}

fn response_tag(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get(header::ETAG)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

async fn decode_data<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ExplorerError> {
    let envelope: ApiEnvelope<T> = response.json().await?;
    if !envelope.success {
        return Err(ExplorerError::General(
            envelope
                .message
                .unwrap_or_else(|| "request failed".to_string()),
        ));
    }
    envelope
        .data
        .ok_or_else(|| ExplorerError::General("response body missing data".to_string()))
}

async fn envelope_error(status: StatusCode, response: reqwest::Response) -> ExplorerError {
    let fallback = || {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    };
    let message = match response.text().await {
        Ok(body) => serde_json::from_str::<ApiEnvelope<serde_json::Value>>(&body)
            .ok()
            .and_then(|envelope| envelope.message)
            .unwrap_or_else(fallback),
        Err(_) => fallback(),
    };
    ExplorerError::Server {
        status: status.as_u16(),
        message,
    }
}
