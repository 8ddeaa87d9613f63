//! HTTP Proxy Module
//!
//! Accepts HTTP/1.1 connections from the build tool and maps GET/HEAD/PUT/DELETE onto the
//! in-memory cache, the upload staging area and the remote store. Every response goes
//! through [`HttpProxy::respond`], which writes exactly one request log line.

use crate::config::Config;
use crate::error::{RemoteStoreError, StoreResult};
use crate::logging::RequestLogLine;
use crate::remote_store::{RemoteStore, UploadBody};
use crate::runtime_state::ServerRuntimeState;
use crate::shutdown::{ShutdownCoordinator, ShutdownSignal};
use crate::upload_staging::{BudgetCharge, UploadStaging};
use crate::{ProxyError, Result};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Body;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Payloads at most this long are inspected for gcc dependency listings
const GCC_DEPFILE_MAX_BYTES: usize = 100_000;
const GCC_DEPFILE_MARKER: &[u8] = b".o: \\";

/// Whether `payload` looks like a dependency listing written by `gcc -MD`
pub fn is_gcc_depfile(payload: &[u8]) -> bool {
    payload.len() <= GCC_DEPFILE_MAX_BYTES
        && payload
            .windows(GCC_DEPFILE_MARKER.len())
            .any(|window| window == GCC_DEPFILE_MARKER)
}

/// Per-request values recorded on arrival
struct RequestContext {
    method: Method,
    /// Path and query as sent, for the log line
    target: String,
    key: String,
    started: Instant,
}

impl RequestContext {
    fn new<B>(req: &Request<B>) -> Self {
        let target = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let path = req.uri().path();
        let key = path.strip_prefix('/').unwrap_or(path).to_string();
        Self {
            method: req.method().clone(),
            target,
            key,
            started: Instant::now(),
        }
    }
}

/// A response that has been decided but not yet emitted
#[derive(Debug)]
struct Outcome {
    status: StatusCode,
    body: Bytes,
    /// Length reported in the log line when it differs from the body length
    logged_length: Option<u64>,
    json: bool,
    from_cache: bool,
    blocked_depfile: bool,
    close_connection: bool,
}

impl Outcome {
    fn empty(status: StatusCode) -> Self {
        Self {
            status,
            body: Bytes::new(),
            logged_length: None,
            json: false,
            from_cache: false,
            blocked_depfile: false,
            close_connection: false,
        }
    }

    fn payload(body: Bytes) -> Self {
        Self {
            body,
            ..Self::empty(StatusCode::OK)
        }
    }

    fn text(body: &'static str) -> Self {
        Self::payload(Bytes::from_static(body.as_bytes()))
    }

    fn json_error(status: StatusCode, body: String) -> Self {
        Self {
            body: Bytes::from(body),
            json: true,
            ..Self::empty(status)
        }
    }

    /// Error body for a failure on the proxy side
    fn local_error(err: &ProxyError) -> Self {
        let body = serde_json::json!({
            "statusCode": StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            "retryable": false,
            "code": "InternalError",
            "message": err.to_string(),
        });
        Self::json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::to_string_pretty(&body).unwrap_or_default(),
        )
    }

    fn with_logged_length(mut self, length: u64) -> Self {
        self.logged_length = Some(length);
        self
    }

    fn from_cache(mut self) -> Self {
        self.from_cache = true;
        self
    }

    fn blocked_depfile(mut self) -> Self {
        self.blocked_depfile = true;
        self
    }

    fn close_connection(mut self) -> Self {
        self.close_connection = true;
        self
    }
}

/// HTTP front end of the cache
#[derive(Clone)]
pub struct HttpProxy {
    config: Arc<Config>,
    state: Arc<ServerRuntimeState>,
    store: Arc<dyn RemoteStore>,
    shutdown: Arc<ShutdownCoordinator>,
}

impl HttpProxy {
    /// Create the proxy. Uploads left behind by a previous instance are discarded.
    pub fn new(config: Arc<Config>, store: Arc<dyn RemoteStore>) -> Self {
        let state = Arc::new(ServerRuntimeState::from_config(&config));
        state.staging.clear();
        let shutdown = Arc::new(ShutdownCoordinator::new(state.staging.clone()));

        Self {
            config,
            state,
            store,
            shutdown,
        }
    }

    pub fn state(&self) -> &Arc<ServerRuntimeState> {
        &self.state
    }

    pub fn shutdown_coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Bind the configured listen address
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = (self.config.server.host.as_str(), self.config.server.port);
        TcpListener::bind(addr).await.map_err(|e| {
            ProxyError::IoError(format!(
                "{}:{}: {}",
                self.config.server.host, self.config.server.port, e
            ))
        })
    }

    /// Accept connections until shutdown is signalled
    pub async fn serve(&self, listener: TcpListener, mut shutdown_signal: ShutdownSignal) {
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            debug!("HTTP connection from {}", addr);

                            if let Err(e) = stream.set_nodelay(true) {
                                warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                            }

                            let proxy = self.clone();
                            tokio::spawn(async move {
                                proxy.serve_connection(stream, addr).await;
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept HTTP connection: {}", e);
                        }
                    }
                }
                _ = shutdown_signal.wait_for_shutdown() => {
                    info!("HTTP proxy received shutdown signal, stopping accept loop");
                    break;
                }
            }
        }
    }

    async fn serve_connection(self, stream: TcpStream, addr: SocketAddr) {
        let io = TokioIo::new(stream);

        let service = service_fn(move |req| {
            let proxy = self.clone();
            async move { Ok::<_, Infallible>(proxy.handle_request(req).await) }
        });

        if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
            let err_str = err.to_string();
            if err_str.contains("connection closed")
                || err_str.contains("broken pipe")
                || err_str.contains("reset by peer")
                || err.is_canceled()
                || err.is_incomplete_message()
            {
                debug!("Client disconnected from {}: {}", addr, err);
            } else {
                error!("Error serving HTTP connection from {}: {}", addr, err);
            }
        }
    }

    /// Request shutdown once no request has arrived for the idle timeout
    pub fn spawn_idle_watch(&self) -> Option<JoinHandle<()>> {
        let idle_timeout = self.state.idle_timer.idle_timeout()?;
        let state = Arc::clone(&self.state);
        let shutdown = Arc::clone(&self.shutdown);

        Some(tokio::spawn(async move {
            state.idle_timer.wait_until_idle().await;
            shutdown.request_shutdown(&format!(
                "Idle for {} minutes; terminating",
                idle_timeout.as_secs_f64() / 60.0
            ));
        }))
    }

    /// Handle a single HTTP request
    pub async fn handle_request<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Display + Send,
    {
        let ctx = RequestContext::new(&req);
        self.state.idle_timer.touch();

        if ctx.method == Method::GET && ctx.key == "shutdown" {
            let response = self.respond(&ctx, Outcome::text("shutting down"));
            self.shutdown
                .request_shutdown("Received 'GET /shutdown'; terminating");
            return response;
        }

        let outcome = match tokio::time::timeout(
            self.config.server.socket_timeout,
            self.dispatch(&ctx, req),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(
                    "Socket timeout reached for {} {}. Returning NotFound",
                    ctx.method, ctx.target
                );
                Outcome::empty(StatusCode::NOT_FOUND).close_connection()
            }
        };

        self.respond(&ctx, outcome)
    }

    async fn dispatch<B>(&self, ctx: &RequestContext, req: Request<B>) -> Outcome
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Display + Send,
    {
        match ctx.method {
            Method::GET => self.handle_get(ctx).await,
            Method::HEAD => self.handle_head(ctx).await,
            Method::PUT => self.handle_put(ctx, req.into_body()).await,
            Method::DELETE => self.handle_delete(ctx).await,
            _ => Outcome::empty(StatusCode::METHOD_NOT_ALLOWED),
        }
    }

    async fn handle_get(&self, ctx: &RequestContext) -> Outcome {
        if ctx.key == "ping" {
            return Outcome::text("pong");
        }
        if ctx.key.is_empty() {
            return Outcome::empty(StatusCode::NOT_FOUND);
        }

        let cached = self.state.cache.lock().unwrap().get(&ctx.key);
        if let Some(payload) = cached {
            return Outcome::payload(payload).from_cache();
        }

        if self.state.store_paused() {
            return Outcome::empty(StatusCode::NOT_FOUND);
        }

        let result = self.store.fetch(&self.config.store.bucket, &ctx.key).await;
        self.record_store_result(ctx, &result);

        match result {
            Ok(payload) => {
                if !self.config.allow_gcc_depfiles && is_gcc_depfile(&payload) {
                    return Outcome::empty(StatusCode::NOT_FOUND).blocked_depfile();
                }
                self.state
                    .cache
                    .lock()
                    .unwrap()
                    .maybe_add(&ctx.key, payload.clone());
                Outcome::payload(payload)
            }
            Err(err) => self.store_failure(err, StatusCode::NOT_FOUND),
        }
    }

    async fn handle_head(&self, ctx: &RequestContext) -> Outcome {
        if ctx.key.is_empty() {
            return Outcome::empty(StatusCode::NOT_FOUND);
        }
        if self.state.cache.lock().unwrap().contains(&ctx.key) {
            return Outcome::empty(StatusCode::OK).from_cache();
        }

        if self.state.store_paused() {
            return Outcome::empty(StatusCode::NOT_FOUND);
        }

        let result = self
            .store
            .head_exists(&self.config.store.bucket, &ctx.key)
            .await;
        self.record_store_result(ctx, &result);

        match result {
            Ok(()) => Outcome::empty(StatusCode::OK),
            Err(err) => self.store_failure(err, StatusCode::NOT_FOUND),
        }
    }

    async fn handle_delete(&self, ctx: &RequestContext) -> Outcome {
        // The bucket itself is never addressed
        if ctx.key.is_empty() {
            return Outcome::empty(StatusCode::FORBIDDEN);
        }
        self.state.cache.lock().unwrap().delete(&ctx.key);

        if self.state.store_paused() {
            return Outcome::empty(StatusCode::NOT_FOUND);
        }

        let result = self.store.delete(&self.config.store.bucket, &ctx.key).await;
        self.record_store_result(ctx, &result);

        match result {
            Ok(()) => Outcome::empty(StatusCode::OK),
            Err(err) => self.store_failure(err, StatusCode::OK),
        }
    }

    /// Stage the body and hand it to the store.
    ///
    /// The work runs in its own task so that a socket timeout, which drops this future,
    /// never interrupts staging or an upload that has already started.
    async fn handle_put<B>(&self, ctx: &RequestContext, body: B) -> Outcome
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Display + Send,
    {
        let path = match self.state.staging.staging_path(&ctx.key) {
            Some(path) => path,
            None => return Outcome::empty(StatusCode::FORBIDDEN),
        };

        let pipeline = tokio::spawn(self.clone().put_pipeline(ctx.key.clone(), path, body));
        match pipeline.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Upload task for {} failed: {}", ctx.key, e);
                Outcome::local_error(&ProxyError::InternalError(e.to_string()))
            }
        }
    }

    async fn put_pipeline<B>(self, key: String, path: PathBuf, body: B) -> Outcome
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Display + Send,
    {
        let staging = &self.state.staging;

        let file = match staging.create_staging_file(&path).await {
            Ok(Some(file)) => file,
            Ok(None) => {
                debug!("Upload of {} already in progress; not starting another", key);
                return Outcome::empty(StatusCode::OK);
            }
            Err(e) => {
                error!("Failed to stage upload of {}: {}", key, e);
                return Outcome::local_error(&e);
            }
        };

        if let Err(e) = UploadStaging::write_body(file, body).await {
            warn!("Failed to receive upload of {}: {}", key, e);
            staging.remove(&path).await;
            return Outcome::local_error(&e);
        }

        let size = match staging.staged_size(&path).await {
            Ok(size) => size,
            Err(e) => {
                error!("{}", e);
                staging.remove(&path).await;
                return Outcome::empty(StatusCode::OK);
            }
        };

        if self.state.store_paused() {
            staging.remove(&path).await;
            return Outcome::empty(StatusCode::OK);
        }

        let max_entry_size_bytes = self.config.max_entry_size_bytes;
        if max_entry_size_bytes != 0 && size > max_entry_size_bytes {
            info!(
                "Not uploading {}, because size {} exceeds max_entry_size_bytes {}",
                key, size, max_entry_size_bytes
            );
            staging.remove(&path).await;
            return Outcome::empty(StatusCode::OK).with_logged_length(size);
        }

        let charge = match self.state.budget.try_charge(size) {
            Some(charge) => charge,
            None => {
                info!(
                    "Not uploading {}, because there are already too many pending uploads",
                    key
                );
                staging.remove(&path).await;
                return Outcome::empty(StatusCode::OK).with_logged_length(size);
            }
        };

        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) => {
                error!("Failed to reopen staged upload {}: {}", path.display(), e);
                drop(charge);
                staging.remove(&path).await;
                return Outcome::local_error(&ProxyError::from(e));
            }
        };

        let upload = self
            .clone()
            .upload_staged(key, path, UploadBody::new(file, size), charge);

        if self.config.async_upload.enabled {
            tokio::spawn(async move {
                let _ = upload.await;
            });
            return Outcome::empty(StatusCode::OK).with_logged_length(size);
        }

        match upload.await {
            Ok(()) => Outcome::empty(StatusCode::OK).with_logged_length(size),
            Err(err) => self
                .store_failure(err, StatusCode::OK)
                .with_logged_length(size),
        }
    }

    /// Transfer a staged file, then release its budget charge and staging file
    async fn upload_staged(
        self,
        key: String,
        path: PathBuf,
        body: UploadBody,
        charge: BudgetCharge,
    ) -> StoreResult<()> {
        let result = self
            .store
            .store(&self.config.store.bucket, &key, body)
            .await;

        match &result {
            Ok(()) => {
                debug!("Uploaded {} ({} bytes)", key, charge.size());
                self.state.record_store_outcome(true);
            }
            Err(err) => {
                error!("PUT /{}: {}", key, err);
                self.state.record_store_outcome(err.is_not_found());
            }
        }

        drop(charge);
        self.state.staging.remove(&path).await;
        result
    }

    /// Feed a store result to the circuit breaker; not-found is a successful answer
    fn record_store_result<T>(&self, ctx: &RequestContext, result: &StoreResult<T>) {
        match result {
            Ok(_) => self.state.record_store_outcome(true),
            Err(err) if err.is_not_found() => self.state.record_store_outcome(true),
            Err(err) => {
                error!("{} {}: {}", ctx.method, ctx.target, err);
                self.state.record_store_outcome(false);
            }
        }
    }

    /// Response for a failed store call: hidden behind `status_if_ignored` when offline
    /// operation is allowed and the failure is transient, otherwise surfaced as JSON
    fn store_failure(&self, err: RemoteStoreError, status_if_ignored: StatusCode) -> Outcome {
        if err.is_ignorable(self.config.allow_offline) {
            debug!("Ignoring transient store error: {}", err);
            return Outcome::empty(status_if_ignored);
        }

        let body = serde_json::to_string_pretty(&err).unwrap_or_else(|_| err.to_string());
        Outcome::json_error(err.response_status(), body)
    }

    /// Log the request and build the HTTP response.
    ///
    /// The emitted [`RequestLogLine`] is also attached to the response as an extension.
    fn respond(&self, ctx: &RequestContext, outcome: Outcome) -> Response<Full<Bytes>> {
        let log_line = RequestLogLine {
            method: ctx.method.to_string(),
            path: ctx.target.clone(),
            status: outcome.status.as_u16(),
            length: outcome
                .logged_length
                .unwrap_or(outcome.body.len() as u64),
            elapsed: ctx.started.elapsed(),
            from_cache: outcome.from_cache,
            store_paused: self.state.store_paused(),
            blocked_depfile: outcome.blocked_depfile,
        };
        log_line.emit();

        let mut builder = Response::builder().status(outcome.status);
        if outcome.json {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
        }
        if outcome.from_cache {
            builder = builder.header("x-cache", "HIT");
        }
        if outcome.close_connection {
            builder = builder.header(header::CONNECTION, "close");
        }

        let status = outcome.status;
        let mut response = builder.body(Full::new(outcome.body)).unwrap_or_else(|e| {
            error!("Failed to build {} response: {}", status, e);
            let mut response = Response::new(Full::new(Bytes::new()));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        });
        response.extensions_mut().insert(log_line);
        response
    }
}
