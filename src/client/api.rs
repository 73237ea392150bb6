//! Transport for the upload protocol.

use crate::{
    client::error::{TransferError, TransferResult},
    protocol::{
        CHUNK_INDEX_HEADER, ChunkAck, ErrorBody, FinalizeResponse, InitRequest, InitResponse,
        ResetResponse, UPLOAD_ID_HEADER, UploadRef,
    },
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Url;
use serde::de::DeserializeOwned;
use std::time::Duration;
use uuid::Uuid;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// The four calls a client makes against an upload server.
#[async_trait]
pub trait TransferApi: Send + Sync {
    async fn init(&self, req: &InitRequest) -> TransferResult<InitResponse>;

    async fn send_chunk(&self, upload_id: Uuid, index: u64, bytes: Bytes)
    -> TransferResult<ChunkAck>;

    async fn finalize(&self, upload_id: Uuid) -> TransferResult<FinalizeResponse>;

    async fn reset(&self, upload_id: Uuid) -> TransferResult<()>;
}

/// [`TransferApi`] over HTTP.
#[derive(Clone)]
pub struct HttpTransferApi {
    http: reqwest::Client,
    init_url: Url,
    chunk_url: Url,
    finalize_url: Url,
    reset_url: Url,
}

impl HttpTransferApi {
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_timeouts(base_url, DEFAULT_CONNECT_TIMEOUT, DEFAULT_REQUEST_TIMEOUT)
    }

    /// A request that outlives `request_timeout` fails as a retryable
    /// transport error, so a silent server cannot pin a worker.
    pub fn with_timeouts(
        base_url: &str,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .context("failed to build HTTP client")?;
        let base_url = Url::parse(base_url).context("invalid server URL")?;
        let endpoint = |path: &str| {
            base_url
                .join(path)
                .with_context(|| format!("failed to build URL for {path}"))
        };
        Ok(Self {
            http,
            init_url: endpoint("/upload/init")?,
            chunk_url: endpoint("/upload/chunk")?,
            finalize_url: endpoint("/upload/finalize")?,
            reset_url: endpoint("/upload/reset")?,
        })
    }

    async fn send_json<T: DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> TransferResult<T> {
        let response = req.send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(match serde_json::from_slice::<ErrorBody>(&body) {
                Ok(err) => TransferError::from_body(err),
                Err(_) => TransferError::Rejected {
                    status: status.as_u16(),
                    code: String::new(),
                    message: String::from_utf8_lossy(&body).into_owned(),
                },
            });
        }
        serde_json::from_slice(&body)
            .map_err(|err| TransferError::Protocol(format!("decoding {} response: {}", status, err)))
    }
}

#[async_trait]
impl TransferApi for HttpTransferApi {
    async fn init(&self, req: &InitRequest) -> TransferResult<InitResponse> {
        self.send_json(self.http.post(self.init_url.clone()).json(req))
            .await
    }

    async fn send_chunk(
        &self,
        upload_id: Uuid,
        index: u64,
        bytes: Bytes,
    ) -> TransferResult<ChunkAck> {
        let req = self
            .http
            .post(self.chunk_url.clone())
            .header(UPLOAD_ID_HEADER, upload_id.to_string())
            .header(CHUNK_INDEX_HEADER, index.to_string())
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes);
        self.send_json(req).await
    }

    async fn finalize(&self, upload_id: Uuid) -> TransferResult<FinalizeResponse> {
        self.send_json(
            self.http
                .post(self.finalize_url.clone())
                .json(&UploadRef { upload_id }),
        )
        .await
    }

    async fn reset(&self, upload_id: Uuid) -> TransferResult<()> {
        let resp: ResetResponse = self
            .send_json(
                self.http
                    .post(self.reset_url.clone())
                    .json(&UploadRef { upload_id }),
            )
            .await?;
        if !resp.ok {
            return Err(TransferError::Protocol("reset not acknowledged".into()));
        }
        Ok(())
    }
}
