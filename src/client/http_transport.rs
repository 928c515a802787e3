//! reqwest-backed implementation of the scheduler's upload transport.
//!
//! Maps HTTP failures onto the scheduler's retry taxonomy: network
//! errors, 5xx and 429 are transient; every other rejection carries the
//! server's stable error kind and is terminal.

use crate::{
    client::scheduler::{TransportError, UploadTransport},
    models::wire::{
        CHUNK_CHECKSUM_HEADER, CHUNK_SIZE_HEADER, ChunkAck, CreateSessionRequest,
        CreateSessionResponse, FinalizeRequest, FinalizeResponse, IDEMPOTENCY_KEY_HEADER,
        SessionStatusResponse,
    },
};
use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    kind: String,
}

pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        response: Response,
    ) -> Result<T, TransportError> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|err| TransportError::Transient(format!("decoding response: {err}")));
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(TransportError::Transient(format!("server returned {status}")));
        }
        match response.json::<ErrorBody>().await {
            Ok(body) => Err(TransportError::Rejected {
                kind: body.kind,
                message: body.error,
            }),
            Err(_) => Err(TransportError::Rejected {
                kind: "unknown".into(),
                message: format!("server returned {status}"),
            }),
        }
    }
}

fn network_err(err: reqwest::Error) -> TransportError {
    TransportError::Transient(err.to_string())
}

#[async_trait]
impl UploadTransport for HttpTransport {
    async fn create_session(
        &self,
        req: &CreateSessionRequest,
    ) -> Result<CreateSessionResponse, TransportError> {
        let response = self
            .authorize(self.client.post(self.url("/api/upload/sessions")))
            .json(req)
            .send()
            .await
            .map_err(network_err)?;
        Self::read_json(response).await
    }

    async fn probe(&self, session: Uuid) -> Result<SessionStatusResponse, TransportError> {
        let response = self
            .authorize(
                self.client
                    .get(self.url(&format!("/api/upload/sessions/{session}"))),
            )
            .send()
            .await
            .map_err(network_err)?;
        Self::read_json(response).await
    }

    async fn put_chunk(
        &self,
        session: Uuid,
        index: u32,
        sha256: &str,
        idempotency_key: &str,
        bytes: Vec<u8>,
    ) -> Result<ChunkAck, TransportError> {
        let response = self
            .authorize(
                self.client
                    .put(self.url(&format!("/api/upload/sessions/{session}/chunk/{index}"))),
            )
            .header(CHUNK_SIZE_HEADER, bytes.len().to_string())
            .header(CHUNK_CHECKSUM_HEADER, sha256)
            .header(IDEMPOTENCY_KEY_HEADER, idempotency_key)
            .body(bytes)
            .send()
            .await
            .map_err(network_err)?;
        Self::read_json(response).await
    }

    async fn finalize(
        &self,
        session: Uuid,
        file_sha256: &str,
    ) -> Result<FinalizeResponse, TransportError> {
        let response = self
            .authorize(
                self.client
                    .post(self.url(&format!("/api/upload/sessions/{session}/finalize"))),
            )
            .json(&FinalizeRequest {
                file_sha256: file_sha256.to_string(),
            })
            .send()
            .await
            .map_err(network_err)?;
        Self::read_json(response).await
    }
}
