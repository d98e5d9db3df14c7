use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, Url};
use serde_json::Value;
use std::fmt;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::RemoteError;

pub mod model;

pub use model::{Filter, PostgrestError};

const REST_PATH: &str = "rest/v1/";

/// Remote row store. Passed in explicitly so tests and alternate
/// environments can supply their own.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// `INSERT ... ON CONFLICT (<conflict_key>) DO UPDATE`; returns the stored row.
    async fn upsert(
        &self,
        table: &str,
        row: &Value,
        conflict_key: &[&str],
    ) -> Result<Value, RemoteError>;

    async fn select(&self, table: &str, filters: &[Filter]) -> Result<Vec<Value>, RemoteError>;

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<(), RemoteError>;
}

/// PostgREST client for a Supabase project.
#[derive(Clone)]
pub struct SupabaseClient {
    http: Client,
    base_url: Url,
    api_key: String,
    bearer: Option<String>,
}

impl fmt::Debug for SupabaseClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupabaseClient")
            .field("base_url", &self.base_url)
            .field("authenticated", &self.bearer.is_some())
            .finish_non_exhaustive()
    }
}

impl SupabaseClient {
    /// `bearer` is the user's session token; without one requests run as the
    /// anon role.
    pub fn new(base_url: &str, api_key: String, bearer: Option<String>) -> Result<Self> {
        let mut base_url = Url::parse(base_url).context("invalid remote URL")?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let http = Client::builder()
            .user_agent("lifelock-sync/0.1")
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            api_key,
            bearer,
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        Self::new(&cfg.remote.url, cfg.remote.anon_key.clone(), cfg.bearer_token())
    }

    fn table_url(&self, table: &str, filters: &[Filter]) -> Result<Url, RemoteError> {
        let mut url = self
            .base_url
            .join(REST_PATH)
            .and_then(|u| u.join(table))
            .map_err(|err| RemoteError::Rejected {
                status: 0,
                message: format!("invalid table URL for {table}: {err}"),
            })?;
        if !filters.is_empty() {
            let mut query = url.query_pairs_mut();
            for filter in filters {
                query.append_pair(filter.column(), &filter.operand());
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        let bearer = self.bearer.as_deref().unwrap_or(&self.api_key);
        self.http
            .request(method, url)
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {bearer}"))
    }

    pub fn build_upsert_request(
        &self,
        table: &str,
        row: &Value,
        conflict_key: &[&str],
    ) -> Result<reqwest::Request, RemoteError> {
        let mut url = self.table_url(table, &[])?;
        url.query_pairs_mut()
            .append_pair("on_conflict", &conflict_key.join(","));
        self.request(Method::POST, url)
            .header("Prefer", "resolution=merge-duplicates,return=representation")
            .header("Content-Type", "application/json")
            .json(row)
            .build()
            .map_err(RemoteError::from)
    }

    pub fn build_select_request(
        &self,
        table: &str,
        filters: &[Filter],
    ) -> Result<reqwest::Request, RemoteError> {
        let mut url = self.table_url(table, filters)?;
        url.query_pairs_mut().append_pair("select", "*");
        self.request(Method::GET, url)
            .header("Accept", "application/json")
            .build()
            .map_err(RemoteError::from)
    }

    pub fn build_delete_request(
        &self,
        table: &str,
        filters: &[Filter],
    ) -> Result<reqwest::Request, RemoteError> {
        let url = self.table_url(table, filters)?;
        self.request(Method::DELETE, url)
            .header("Prefer", "return=minimal")
            .build()
            .map_err(RemoteError::from)
    }

    async fn execute(&self, table: &str, request: reqwest::Request) -> Result<String, RemoteError> {
        debug!(method = %request.method(), url = %request.url(), "sending remote request");
        let res = self.http.execute(request).await?;
        let status = res.status();
        let body = res.text().await?;
        if !status.is_success() {
            let err = PostgrestError::parse(&body);
            warn!(
                table,
                status = status.as_u16(),
                code = err.code.as_deref().unwrap_or(""),
                "remote request failed"
            );
            return Err(RemoteError::from_response(
                table,
                status.as_u16(),
                err.code.as_deref(),
                err.describe(),
            ));
        }
        Ok(body)
    }
}

#[async_trait]
impl RemoteStore for SupabaseClient {
    async fn upsert(
        &self,
        table: &str,
        row: &Value,
        conflict_key: &[&str],
    ) -> Result<Value, RemoteError> {
        let request = self.build_upsert_request(table, row, conflict_key)?;
        let body = self.execute(table, request).await?;
        let rows: Vec<Value> =
            serde_json::from_str(&body).map_err(|err| RemoteError::Decode(err.to_string()))?;
        rows.into_iter()
            .next()
            .ok_or_else(|| RemoteError::Decode(format!("upsert into {table} returned no row")))
    }

    async fn select(&self, table: &str, filters: &[Filter]) -> Result<Vec<Value>, RemoteError> {
        let request = self.build_select_request(table, filters)?;
        let body = self.execute(table, request).await?;
        serde_json::from_str(&body).map_err(|err| RemoteError::Decode(err.to_string()))
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<(), RemoteError> {
        if filters.is_empty() {
            // PostgREST would delete every visible row.
            return Err(RemoteError::Rejected {
                status: 0,
                message: format!("refusing unfiltered delete on {table}"),
            });
        }
        let request = self.build_delete_request(table, filters)?;
        self.execute(table, request).await?;
        Ok(())
    }
}
