//! Shared helpers for the integration tests: an in-memory remote store that counts calls
//! and can be scripted to fail or stall, plus request/response shortcuts.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, Response};
use s3_build_cache::config::Config;
use s3_build_cache::error::{RemoteStoreError, StoreResult};
use s3_build_cache::http_proxy::HttpProxy;
use s3_build_cache::logging::RequestLogLine;
use s3_build_cache::remote_store::{RemoteStore, UploadBody};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

pub const BUCKET: &str = "test-bucket";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Fetch,
    Store,
    Delete,
    Head,
}

/// In-memory remote store
#[derive(Default)]
pub struct MockStore {
    objects: Mutex<HashMap<String, Bytes>>,
    calls: Mutex<Vec<(StoreOp, String)>>,
    failure: Mutex<Option<RemoteStoreError>>,
    fetch_delay: Mutex<Option<Duration>>,
    upload_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl MockStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put_object(&self, key: &str, payload: impl Into<Bytes>) {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), payload.into());
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    /// Fail every call with `err` until cleared
    pub fn fail_with(&self, err: RemoteStoreError) {
        *self.failure.lock().unwrap() = Some(err);
    }

    pub fn clear_failure(&self) {
        *self.failure.lock().unwrap() = None;
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock().unwrap() = Some(delay);
    }

    /// Make uploads wait for a permit on the returned semaphore
    pub fn hold_uploads(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.upload_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn call_count(&self, op: StoreOp) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(call, _)| *call == op)
            .count()
    }

    pub fn calls_for(&self, op: StoreOp, key: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(call, k)| *call == op && k == key)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn record(&self, op: StoreOp, key: &str) -> StoreResult<()> {
        self.calls.lock().unwrap().push((op, key.to_string()));
        match self.failure.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn not_found(key: &str) -> RemoteStoreError {
        RemoteStoreError::from_status(hyper::StatusCode::NOT_FOUND, format!("{} not found", key))
    }
}

#[async_trait]
impl RemoteStore for MockStore {
    async fn fetch(&self, bucket: &str, key: &str) -> StoreResult<Bytes> {
        assert_eq!(bucket, BUCKET);
        let delay = *self.fetch_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.record(StoreOp::Fetch, key)?;
        self.object(key).ok_or_else(|| Self::not_found(key))
    }

    async fn store(&self, bucket: &str, key: &str, body: UploadBody) -> StoreResult<()> {
        assert_eq!(bucket, BUCKET);
        let gate = self.upload_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }
        self.record(StoreOp::Store, key)?;
        let size = body.size_bytes;
        let payload = body.into_bytes().await.unwrap();
        assert_eq!(payload.len() as u64, size);
        self.put_object(key, payload);
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> StoreResult<()> {
        assert_eq!(bucket, BUCKET);
        self.record(StoreOp::Delete, key)?;
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    async fn head_exists(&self, bucket: &str, key: &str) -> StoreResult<()> {
        assert_eq!(bucket, BUCKET);
        self.record(StoreOp::Head, key)?;
        match self.object(key) {
            Some(_) => Ok(()),
            None => Err(Self::not_found(key)),
        }
    }
}

/// Configuration with its staging directory below `root`
pub fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.store.bucket = BUCKET.to_string();
    config.async_upload.cache_dir = root.join("uploads");
    config.logging.log_dir = root.join("logs");
    config.server.idle_timeout = Duration::ZERO;
    config
}

pub fn proxy(config: Config, store: &Arc<MockStore>) -> HttpProxy {
    HttpProxy::new(Arc::new(config), Arc::clone(store) as Arc<dyn RemoteStore>)
}

pub fn request(method: Method, uri: &str, body: impl Into<Bytes>) -> Request<Full<Bytes>> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Full::new(body.into()))
        .unwrap()
}

pub async fn send(proxy: &HttpProxy, method: Method, uri: &str) -> Response<Full<Bytes>> {
    proxy.handle_request(request(method, uri, Bytes::new())).await
}

pub async fn put(proxy: &HttpProxy, uri: &str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    proxy.handle_request(request(Method::PUT, uri, body)).await
}

pub async fn body_bytes(response: Response<Full<Bytes>>) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

/// The request log line the proxy emitted for `response`
pub fn log_line(response: &Response<Full<Bytes>>) -> RequestLogLine {
    response
        .extensions()
        .get::<RequestLogLine>()
        .cloned()
        .expect("every response carries its log line")
}

pub fn retryable_error() -> RemoteStoreError {
    RemoteStoreError::network("connect ECONNREFUSED")
}

/// Poll `condition` until it holds, failing the test after a few seconds
pub async fn wait_for<F: Fn() -> bool>(condition: F) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}
