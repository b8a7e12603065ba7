//! REST client for the versioned-file service.
//!
//! API calls carry a bearer token; content PUTs and downloads go to signed
//! storage URLs and are sent without credentials.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use deltapush_protocol::constants::{CONTENT_DIGEST_HEADER, ETAG_HEADER};
use deltapush_protocol::{
    ComponentKind, CreateRecordRequest, CreateVersionRequest, FinishUploadRequest,
    RemoteFileRecord, UploadStatus, UploadUrlResponse,
};
use futures_util::StreamExt;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::header::CONTENT_LENGTH;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace};

use crate::api::{ByteProgress, RemoteFiles, RemoteFuture, Session};
use crate::config::RemoteConfig;
use crate::error::RemoteError;

/// Granularity of upload progress reports.
const PUT_SLICE_SIZE: usize = 256 * 1024;

/// HTTP implementation of [`RemoteFiles`] and [`Session`].
pub struct HttpRemoteFiles {
    api: reqwest::Client,
    storage: reqwest::Client,
    base_url: String,
    token: Option<String>,
    authenticated: AtomicBool,
}

impl HttpRemoteFiles {
    pub fn new(config: &RemoteConfig) -> Result<Self, RemoteError> {
        if config.base_url.trim().is_empty() {
            return Err(RemoteError::InvalidConfig("base_url is empty".into()));
        }

        let api = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .build()?;
        let storage = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .connect_timeout(config.connect_timeout())
            .build()?;

        Ok(Self {
            api,
            storage,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.auth_token.clone().filter(|t| !t.is_empty()),
            authenticated: AtomicBool::new(false),
        })
    }

    /// Sets a custom base URL (for testing).
    #[cfg(test)]
    pub(crate) fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url;
        self
    }

    fn record_url(&self, record_id: &str) -> String {
        let encoded = utf8_percent_encode(record_id, NON_ALPHANUMERIC);
        format!("{}/file/{encoded}", self.base_url)
    }

    fn component_url(
        &self,
        record_id: &str,
        version: u32,
        kind: ComponentKind,
        action: &str,
    ) -> String {
        format!(
            "{}/{version}/{}/{action}",
            self.record_url(record_id),
            kind.as_path()
        )
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    /// Sends an authenticated API request and decodes the JSON reply.
    async fn send_json<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, RemoteError> {
        let resp = check_status(self.authorize(req).send().await?).await?;
        let body = resp.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

/// Maps a non-success status to [`RemoteError::Api`].
async fn check_status(resp: Response) -> Result<Response, RemoteError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(RemoteError::Api {
            status: status.as_u16(),
            body,
        });
    }
    Ok(resp)
}

impl RemoteFiles for HttpRemoteFiles {
    fn create_record<'a>(
        &'a self,
        req: &'a CreateRecordRequest,
    ) -> RemoteFuture<'a, RemoteFileRecord> {
        Box::pin(async move {
            let url = format!("{}/file", self.base_url);
            debug!(name = %req.name, "creating record");
            self.send_json(self.api.post(url).json(req)).await
        })
    }

    fn fetch_record<'a>(&'a self, record_id: &'a str) -> RemoteFuture<'a, RemoteFileRecord> {
        Box::pin(async move {
            trace!(record = %record_id, "fetching record");
            self.send_json(self.api.get(self.record_url(record_id)))
                .await
        })
    }

    fn create_version<'a>(
        &'a self,
        record_id: &'a str,
        req: &'a CreateVersionRequest,
    ) -> RemoteFuture<'a, RemoteFileRecord> {
        Box::pin(async move {
            let url = format!("{}/versions", self.record_url(record_id));
            self.send_json(self.api.post(url).json(req)).await
        })
    }

    fn delete_version<'a>(
        &'a self,
        record_id: &'a str,
        version: u32,
    ) -> RemoteFuture<'a, RemoteFileRecord> {
        Box::pin(async move {
            let url = format!("{}/{version}", self.record_url(record_id));
            self.send_json(self.api.delete(url)).await
        })
    }

    fn request_upload_url<'a>(
        &'a self,
        record_id: &'a str,
        version: u32,
        kind: ComponentKind,
        part_number: Option<u32>,
    ) -> RemoteFuture<'a, String> {
        Box::pin(async move {
            let url = self.component_url(record_id, version, kind, "start");
            let mut req = self.api.post(url);
            if let Some(part) = part_number {
                req = req.query(&[("partNumber", part)]);
            }
            let resp: UploadUrlResponse = self.send_json(req).await?;
            Ok(resp.url)
        })
    }

    fn put_bytes<'a>(
        &'a self,
        url: &'a str,
        data: Vec<u8>,
        digest: Option<&'a str>,
        progress: ByteProgress,
    ) -> RemoteFuture<'a, Option<String>> {
        Box::pin(async move {
            let total = data.len() as u64;
            let body = Bytes::from(data);
            let slices: Vec<Bytes> = (0..body.len())
                .step_by(PUT_SLICE_SIZE)
                .map(|start| body.slice(start..(start + PUT_SLICE_SIZE).min(body.len())))
                .collect();

            let reporter = progress.clone();
            let mut sent = 0u64;
            let stream = futures_util::stream::iter(slices.into_iter().map(move |slice| {
                sent += slice.len() as u64;
                reporter(sent, total);
                Ok::<_, std::io::Error>(slice)
            }));

            let mut req = self
                .storage
                .put(url)
                .header(CONTENT_LENGTH, total)
                .body(reqwest::Body::wrap_stream(stream));
            if let Some(digest) = digest {
                req = req.header(CONTENT_DIGEST_HEADER, digest);
            }

            let resp = check_status(req.send().await?).await?;
            let etag = resp
                .headers()
                .get(ETAG_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            progress(total, total);
            trace!(bytes = total, etag = ?etag, "put complete");
            Ok(etag)
        })
    }

    fn finish_upload<'a>(
        &'a self,
        record_id: &'a str,
        version: u32,
        kind: ComponentKind,
        req: &'a FinishUploadRequest,
    ) -> RemoteFuture<'a, RemoteFileRecord> {
        Box::pin(async move {
            let url = self.component_url(record_id, version, kind, "finish");
            self.send_json(self.api.post(url).json(req)).await
        })
    }

    fn get_upload_status<'a>(
        &'a self,
        record_id: &'a str,
        version: u32,
        kind: ComponentKind,
    ) -> RemoteFuture<'a, Option<UploadStatus>> {
        Box::pin(async move {
            let url = self.component_url(record_id, version, kind, "status");
            let resp = self.authorize(self.api.get(url)).send().await?;
            if matches!(resp.status(), StatusCode::NOT_FOUND | StatusCode::NO_CONTENT) {
                return Ok(None);
            }
            let body = check_status(resp).await?.bytes().await?;
            Ok(Some(serde_json::from_slice(&body)?))
        })
    }

    fn download<'a>(&'a self, url: &'a str, dest: &'a Path) -> RemoteFuture<'a, u64> {
        Box::pin(async move {
            let resp = check_status(self.storage.get(url).send().await?).await?;
            let mut file = tokio::fs::File::create(dest).await?;
            let mut stream = resp.bytes_stream();
            let mut written = 0u64;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.flush().await?;
            debug!(path = %dest.display(), bytes = written, "download complete");
            Ok(written)
        })
    }
}

impl Session for HttpRemoteFiles {
    fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    fn login(&self) -> RemoteFuture<'_, ()> {
        Box::pin(async move {
            if self.token.is_none() {
                return Err(RemoteError::NotAuthenticated);
            }
            let url = format!("{}/auth/user", self.base_url);
            check_status(self.authorize(self.api.get(url)).send().await?).await?;
            self.authenticated.store(true, Ordering::Release);
            debug!("session authenticated");
            Ok(())
        })
    }
}
