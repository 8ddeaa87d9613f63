//! S3 Client Module
//!
//! Plain HTTP client for S3-compatible object stores addressed path-style
//! (`{endpoint}/{bucket}/{key}`). Requests are unsigned; the endpoint is expected to be a
//! local gateway or a bucket policy that admits the proxy host.

use crate::config::StoreConfig;
use crate::error::{RemoteStoreError, StoreResult};
use crate::remote_store::{RemoteStore, UploadBody};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::{header, Method, Request, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::debug;

/// Request body type shared by empty requests and streamed uploads
type RequestBody = UnsyncBoxBody<Bytes, std::io::Error>;

const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Object store reached over plain HTTP
pub struct HttpObjectStore {
    client: Client<HttpConnector, RequestBody>,
    endpoint: String,
    request_timeout: Duration,
}

impl HttpObjectStore {
    pub fn new(config: &StoreConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(config.request_timeout));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .build(connector);

        debug!(
            "Creating object store client for {} (request timeout: {:?})",
            config.endpoint, config.request_timeout
        );

        Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            request_timeout: config.request_timeout,
        }
    }

    /// Path-style object URI. An empty key would address the bucket itself.
    fn object_uri(&self, bucket: &str, key: &str) -> StoreResult<Uri> {
        if key.is_empty() {
            return Err(RemoteStoreError::invalid_request(format!(
                "Empty object key for bucket {}",
                bucket
            )));
        }
        format!("{}/{}/{}", self.endpoint, bucket, key)
            .parse::<Uri>()
            .map_err(|e| RemoteStoreError::invalid_request(format!("Invalid object URI: {}", e)))
    }

    /// Send one request and buffer the response body.
    ///
    /// Non-2xx statuses are turned into errors carrying the response body as message.
    async fn send(&self, request: Request<RequestBody>) -> StoreResult<Bytes> {
        let method = request.method().clone();
        let uri = request.uri().clone();
        debug!("Sending {} request to {}", method, uri);

        let exchange = async {
            let response = self.client.request(request).await.map_err(|e| {
                RemoteStoreError::network(format!("Failed to send request: {}", e))
            })?;
            let (parts, body) = response.into_parts();
            let body = body
                .collect()
                .await
                .map_err(|e| {
                    RemoteStoreError::network(format!("Failed to read response body: {}", e))
                })?
                .to_bytes();
            Ok::<_, RemoteStoreError>((parts.status, body))
        };

        let (status, body) = tokio::time::timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| {
                RemoteStoreError::timeout(format!(
                    "{} {} did not complete within {:?}",
                    method, uri, self.request_timeout
                ))
            })??;

        debug!("{} {} returned {}", method, uri, status);

        if status.is_success() {
            return Ok(body);
        }

        let message = String::from_utf8_lossy(&body).trim().to_string();
        let message = if message.is_empty() {
            status.canonical_reason().unwrap_or("Unknown").to_string()
        } else {
            message
        };
        Err(RemoteStoreError::from_status(status, message))
    }

    fn empty_request(
        &self,
        method: Method,
        bucket: &str,
        key: &str,
    ) -> StoreResult<Request<RequestBody>> {
        Request::builder()
            .method(method)
            .uri(self.object_uri(bucket, key)?)
            .body(empty_body())
            .map_err(|e| {
                RemoteStoreError::invalid_request(format!("Failed to build request: {}", e))
            })
    }
}

#[async_trait]
impl RemoteStore for HttpObjectStore {
    async fn fetch(&self, bucket: &str, key: &str) -> StoreResult<Bytes> {
        let request = self.empty_request(Method::GET, bucket, key)?;
        self.send(request).await
    }

    async fn store(&self, bucket: &str, key: &str, body: UploadBody) -> StoreResult<()> {
        let request = Request::builder()
            .method(Method::PUT)
            .uri(self.object_uri(bucket, key)?)
            .header(header::CONTENT_LENGTH, body.size_bytes)
            .header("x-amz-acl", "bucket-owner-full-control")
            .body(file_body(body.file))
            .map_err(|e| {
                RemoteStoreError::invalid_request(format!("Failed to build request: {}", e))
            })?;
        self.send(request).await.map(|_| ())
    }

    async fn delete(&self, bucket: &str, key: &str) -> StoreResult<()> {
        let request = self.empty_request(Method::DELETE, bucket, key)?;
        self.send(request).await.map(|_| ())
    }

    async fn head_exists(&self, bucket: &str, key: &str) -> StoreResult<()> {
        let request = self.empty_request(Method::HEAD, bucket, key)?;
        self.send(request).await.map(|_| ())
    }
}

fn empty_body() -> RequestBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Stream a staged file as the request body in fixed-size chunks
fn file_body(file: File) -> RequestBody {
    let chunks = futures::stream::unfold(Some(file), |state| async move {
        let mut file = state?;
        let mut buffer = vec![0u8; UPLOAD_CHUNK_SIZE];
        match file.read(&mut buffer).await {
            Ok(0) => None,
            Ok(n) => {
                buffer.truncate(n);
                Some((Ok(Frame::data(Bytes::from(buffer))), Some(file)))
            }
            Err(e) => Some((Err(e), None)),
        }
    });
    StreamBody::new(chunks).boxed_unsync()
}
