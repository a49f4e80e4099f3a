//! Dropbox folder accessed through the HTTP API v2.
//!
//! Listing metadata carries Dropbox's own `content_hash`, which uses the same
//! block-hash scheme as [`crate::descriptor::Fingerprint`], so listed entries
//! arrive already fingerprinted and are only downloaded on explicit fetch.

use chrono::{DateTime, Utc};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::io::Read;
use std::time::Duration;
use tracing::{debug, trace};

use super::{relative_to_base, BackendKind, RawEntry, StorageBackend};
use crate::config::Secret;
use crate::error::BackendError;

const API_BASE: &str = "https://api.dropboxapi.com/2";
const CONTENT_BASE: &str = "https://content.dropboxapi.com/2";
const USER_AGENT: &str = concat!("filerecon/", env!("CARGO_PKG_VERSION"));
const MAX_PAGES: usize = 10_000;

pub struct CloudBackend {
    id: String,
    access_token: Secret,
    base_folder: String,
    timeout: Duration,
    api_base: String,
    content_base: String,
    page_limit: usize,
    http: Option<Client>,
}

#[derive(Debug, Deserialize)]
struct ListFolderPage {
    entries: Vec<CloudEntry>,
    cursor: String,
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct CloudEntry {
    #[serde(rename = ".tag")]
    tag: String,
    path_display: Option<String>,
    path_lower: Option<String>,
    size: Option<u64>,
    client_modified: Option<DateTime<Utc>>,
    content_hash: Option<String>,
}

impl CloudBackend {
    pub fn new(id: &str, access_token: Secret, base_folder: &str, timeout: Duration) -> Self {
        Self::with_base_url(
            id,
            access_token,
            base_folder,
            timeout,
            API_BASE.to_string(),
            CONTENT_BASE.to_string(),
        )
    }

    /// Point the RPC and content endpoints somewhere other than Dropbox.
    pub fn with_base_url(
        id: &str,
        access_token: Secret,
        base_folder: &str,
        timeout: Duration,
        api_base: String,
        content_base: String,
    ) -> Self {
        Self {
            id: id.to_string(),
            access_token,
            base_folder: base_folder.trim_matches('/').to_string(),
            timeout,
            api_base,
            content_base,
            page_limit: MAX_PAGES,
            http: None,
        }
    }

    /// Listings needing more pages than this fail instead of truncating.
    pub fn with_page_limit(mut self, pages: usize) -> Self {
        self.page_limit = pages.max(1);
        self
    }

    fn folder_path(&self) -> String {
        if self.base_folder.is_empty() {
            String::new()
        } else {
            format!("/{}", self.base_folder)
        }
    }

    fn client(&self) -> Result<&Client, BackendError> {
        self.http
            .as_ref()
            .ok_or_else(|| BackendError::unavailable(&self.id, "not connected"))
    }

    fn send(&self, request: RequestBuilder) -> Result<Response, BackendError> {
        request
            .bearer_auth(self.access_token.expose())
            .send()
            .map_err(|e| BackendError::unavailable(&self.id, e))
    }

    fn list_page(&self, url: &str, body: serde_json::Value) -> Result<ListFolderPage, BackendError> {
        let response = self.send(self.client()?.post(url).json(&body))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().unwrap_or_default();
            return Err(BackendError::unavailable(
                &self.id,
                format!("list_folder returned {}: {}", status, detail),
            ));
        }
        response
            .json::<ListFolderPage>()
            .map_err(|e| BackendError::unavailable(&self.id, e))
    }
}

impl StorageBackend for CloudBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Cloud
    }

    fn connect(&mut self) -> Result<(), BackendError> {
        if self.access_token.is_empty() {
            return Err(BackendError::connection(&self.id, "no access token configured"));
        }

        let http = Client::builder()
            .timeout(self.timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| BackendError::connection(&self.id, e))?;

        let response = http
            .post(format!("{}/check/user", self.api_base))
            .bearer_auth(self.access_token.expose())
            .json(&json!({ "query": "filerecon" }))
            .send()
            .map_err(|e| BackendError::connection(&self.id, e))?;

        match response.status() {
            status if status.is_success() => {
                debug!("Dropbox token accepted for {}", self.id);
                self.http = Some(http);
                Ok(())
            }
            StatusCode::UNAUTHORIZED => Err(BackendError::connection(
                &self.id,
                "access token rejected (expired or revoked)",
            )),
            status => Err(BackendError::connection(
                &self.id,
                format!("check/user returned {}", status),
            )),
        }
    }

    fn list(&mut self) -> Result<Vec<RawEntry>, BackendError> {
        let mut page = self.list_page(
            &format!("{}/files/list_folder", self.api_base),
            json!({ "path": self.folder_path(), "recursive": true }),
        )?;

        let mut entries = entries_from_page(&page.entries, &self.base_folder);
        let mut pages = 1;
        while page.has_more {
            if pages >= self.page_limit {
                return Err(BackendError::unavailable(
                    &self.id,
                    format!("listing still incomplete after {} pages", pages),
                ));
            }
            page = self.list_page(
                &format!("{}/files/list_folder/continue", self.api_base),
                json!({ "cursor": page.cursor }),
            )?;
            entries.extend(entries_from_page(&page.entries, &self.base_folder));
            pages += 1;
        }
        trace!("{} pages listed from {}", pages, self.id);

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    fn fetch(&mut self, entry: &RawEntry) -> Result<Box<dyn Read>, BackendError> {
        let remote = format!("{}/{}", self.folder_path(), entry.path);
        let arg = json!({ "path": remote }).to_string();
        let request = self
            .client()?
            .post(format!("{}/files/download", self.content_base))
            .header("Dropbox-API-Arg", arg);
        let response = self.send(request)?;

        match response.status() {
            status if status.is_success() => Ok(Box::new(response)),
            StatusCode::CONFLICT => {
                let detail = response.text().unwrap_or_default();
                if detail.contains("not_found") {
                    Err(BackendError::not_found(&self.id, &entry.path))
                } else {
                    Err(BackendError::unavailable(&self.id, detail))
                }
            }
            status => Err(BackendError::unavailable(
                &self.id,
                format!("download returned {}", status),
            )),
        }
    }

    fn close(&mut self) {
        self.http = None;
    }
}

fn entries_from_page(page: &[CloudEntry], base_folder: &str) -> Vec<RawEntry> {
    page.iter()
        .filter(|entry| entry.tag == "file")
        .filter_map(|entry| {
            let path = entry.path_display.as_ref().or(entry.path_lower.as_ref())?;
            let relative = relative_to_base(path, base_folder)?;
            Some(RawEntry {
                path: relative.to_string(),
                size: entry.size.unwrap_or(0),
                modified: entry.client_modified,
                content_hash: entry.content_hash.clone(),
            })
        })
        .collect()
}
