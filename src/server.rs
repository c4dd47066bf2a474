// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! HTTP surface: health, configz and per-controller debug endpoints.

use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::controller::BoxFuture;
use crate::error::{Error, Result};
use crate::health::HealthzHandler;

/// Request with a fully buffered body.
pub type HttpRequest = Request<Bytes>;

/// Response produced by every handler.
pub type HttpResponse = Response<Full<Bytes>>;

/// Something that answers HTTP requests.
pub trait HttpHandler: Send + Sync + 'static {
    fn handle(&self, req: HttpRequest) -> BoxFuture<'static, HttpResponse>;
}

/// Handler a controller exposes under `/debug/controllers/<name>`.
pub type DebugHandler = Arc<dyn HttpHandler>;

/// Adapter for implementing [`HttpHandler`] with a function.
pub struct HandlerFn<F>(F);

impl<F, Fut> HttpHandler for HandlerFn<F>
where
    F: Fn(HttpRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HttpResponse> + Send + 'static,
{
    fn handle(&self, req: HttpRequest) -> BoxFuture<'static, HttpResponse> {
        Box::pin((self.0)(req))
    }
}

/// Wraps an async function into a [`DebugHandler`].
pub fn handler_fn<F, Fut>(f: F) -> DebugHandler
where
    F: Fn(HttpRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HttpResponse> + Send + 'static,
{
    Arc::new(HandlerFn(f))
}

/// Builds a plain text response.
pub fn text_response(status: StatusCode, body: impl Into<Bytes>) -> HttpResponse {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> HttpResponse {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            *response.status_mut() = status;
            response.headers_mut().insert(
                http::header::CONTENT_TYPE,
                http::HeaderValue::from_static("application/json"),
            );
            response
        }
        Err(err) => text_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

fn not_found() -> HttpResponse {
    text_response(StatusCode::NOT_FOUND, "404 page not found\n")
}

/// Serves `handler` with `prefix` removed from the request path.
pub fn strip_prefix(prefix: impl Into<String>, handler: DebugHandler) -> DebugHandler {
    let prefix = prefix.into();
    handler_fn(move |mut req: HttpRequest| {
        let handler = handler.clone();
        let rest = req
            .uri()
            .path()
            .strip_prefix(prefix.as_str())
            .map(|rest| if rest.is_empty() { "/" } else { rest }.to_string());
        let query = req.uri().query().map(|q| format!("?{q}")).unwrap_or_default();
        async move {
            let Some(rest) = rest else {
                return not_found();
            };
            match format!("{rest}{query}").parse::<Uri>() {
                Ok(uri) => {
                    *req.uri_mut() = uri;
                    handler.handle(req).await
                }
                Err(_) => not_found(),
            }
        }
    })
}

/// Path multiplexer for endpoints that are not listed on the index.
///
/// Exact paths win over prefixes; among prefixes the longest one wins.
#[derive(Clone, Default)]
pub struct DebugMux {
    exact: Arc<RwLock<BTreeMap<String, DebugHandler>>>,
    prefixes: Arc<RwLock<BTreeMap<String, DebugHandler>>>,
}

impl DebugMux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mounts `handler` at exactly `path`.
    pub async fn unlisted_handle(&self, path: impl Into<String>, handler: DebugHandler) {
        self.exact.write().await.insert(path.into(), handler);
    }

    /// Mounts `handler` for every path under `prefix`.
    pub async fn unlisted_handle_prefix(&self, prefix: impl Into<String>, handler: DebugHandler) {
        self.prefixes.write().await.insert(prefix.into(), handler);
    }

    /// Returns the handler for `path`, if one is mounted.
    pub async fn lookup(&self, path: &str) -> Option<DebugHandler> {
        if let Some(handler) = self.exact.read().await.get(path) {
            return Some(handler.clone());
        }
        self.prefixes
            .read()
            .await
            .iter()
            .filter(|(prefix, _)| path.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, handler)| handler.clone())
    }

    /// Returns every mounted path and prefix.
    pub async fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.exact.read().await.keys().cloned().collect();
        paths.extend(self.prefixes.read().await.keys().cloned());
        paths.sort();
        paths
    }
}

impl HttpHandler for DebugMux {
    fn handle(&self, req: HttpRequest) -> BoxFuture<'static, HttpResponse> {
        let mux = self.clone();
        Box::pin(async move {
            match mux.lookup(req.uri().path()).await {
                Some(handler) => handler.handle(req).await,
                None => not_found(),
            }
        })
    }
}

/// Registry of component configurations served on `/configz`.
#[derive(Clone, Default)]
pub struct Configz {
    sections: Arc<RwLock<BTreeMap<String, serde_json::Value>>>,
}

impl Configz {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `config` under `name`. A name may only be registered once.
    pub async fn register<T: Serialize>(&self, name: &str, config: &T) -> Result<()> {
        let value = serde_json::to_value(config)
            .map_err(|err| Error::InvalidConfig(format!("unable to serialize {name}: {err}")))?;
        let mut sections = self.sections.write().await;
        if sections.contains_key(name) {
            return Err(Error::InvalidConfig(format!(
                "configz section {name:?} is already registered"
            )));
        }
        sections.insert(name.to_string(), value);
        Ok(())
    }

    async fn snapshot(&self) -> BTreeMap<String, serde_json::Value> {
        self.sections.read().await.clone()
    }
}

/// The controller manager's base handler.
#[derive(Clone)]
pub struct BaseHandler {
    healthz: HealthzHandler,
    configz: Configz,
    debug: DebugMux,
}

impl BaseHandler {
    pub fn new(healthz: HealthzHandler, configz: Configz, debug: DebugMux) -> Self {
        Self {
            healthz,
            configz,
            debug,
        }
    }

    async fn route(self, req: HttpRequest) -> HttpResponse {
        let path = req.uri().path().to_string();
        let verbose = req
            .uri()
            .query()
            .is_some_and(|q| q.split('&').any(|kv| kv == "verbose" || kv.starts_with("verbose=")));

        match path.as_str() {
            "/healthz" | "/healthz/" => {
                let report = self.healthz.check_all().await;
                let status = if report.is_healthy() {
                    StatusCode::OK
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                };
                if verbose || !report.is_healthy() {
                    text_response(status, report.render())
                } else {
                    text_response(status, "ok")
                }
            }
            "/configz" => json_response(StatusCode::OK, &self.configz.snapshot().await),
            _ => {
                if let Some(name) = path.strip_prefix("/healthz/") {
                    return match self.healthz.check(name).await {
                        Some(Ok(())) => text_response(StatusCode::OK, "ok"),
                        Some(Err(err)) => text_response(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            format!("internal server error: {err}"),
                        ),
                        None => not_found(),
                    };
                }
                self.debug.handle(req).await
            }
        }
    }
}

impl HttpHandler for BaseHandler {
    fn handle(&self, req: HttpRequest) -> BoxFuture<'static, HttpResponse> {
        Box::pin(self.clone().route(req))
    }
}

/// Binds `addr` and serves `handler` until `token` is cancelled.
///
/// Binding happens before this returns so address conflicts surface as
/// startup errors.
pub async fn serve(
    addr: SocketAddr,
    handler: Arc<dyn HttpHandler>,
    token: CancellationToken,
) -> Result<JoinHandle<()>> {
    let listener = TcpListener::bind(addr).await.map_err(|source| Error::Serve {
        addr: addr.to_string(),
        source,
    })?;

    tracing::info!(%addr, "serving health and debug endpoints");

    Ok(tokio::spawn(async move {
        loop {
            let stream = tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to accept connection");
                        continue;
                    }
                },
            };

            let handler = handler.clone();
            let io = TokioIo::new(stream);
            tokio::spawn(async move {
                let http = hyper::server::conn::http1::Builder::new();
                let service = service_fn(move |req: Request<Incoming>| {
                    let handler = handler.clone();
                    async move {
                        let (parts, body) = req.into_parts();
                        let body = body.collect().await?.to_bytes();
                        Ok::<_, hyper::Error>(handler.handle(Request::from_parts(parts, body)).await)
                    }
                });

                if let Err(err) = http.serve_connection(io, service).await {
                    tracing::debug!(error = %err, "connection closed with error");
                }
            });
        }
        tracing::info!(%addr, "stopped serving");
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{FunctionHealthChecker, HealthChecker, PingChecker};

    fn get(path: &str) -> HttpRequest {
        Request::builder().uri(path).body(Bytes::new()).unwrap()
    }

    async fn body(response: HttpResponse) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn echo_path() -> DebugHandler {
        handler_fn(|req: HttpRequest| async move {
            text_response(StatusCode::OK, req.uri().to_string())
        })
    }

    #[tokio::test]
    async fn test_debug_mux_strip_prefix() {
        let mux = DebugMux::new();
        let base = "/debug/controllers/node";
        mux.unlisted_handle(base, strip_prefix(base, echo_path())).await;
        mux.unlisted_handle_prefix(format!("{base}/"), strip_prefix(base, echo_path()))
            .await;

        assert_eq!(body(mux.handle(get(base)).await).await, "/");
        assert_eq!(
            body(mux.handle(get("/debug/controllers/node/queue?depth=1")).await).await,
            "/queue?depth=1"
        );
        assert_eq!(
            mux.handle(get("/debug/controllers/foo")).await.status(),
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_base_handler_routes() {
        let healthz = HealthzHandler::new();
        healthz
            .add_health_checkers(vec![
                Arc::new(PingChecker::new("node")) as Arc<dyn HealthChecker>,
                Arc::new(FunctionHealthChecker::new("foo", || async {
                    Err::<(), _>(anyhow::anyhow!("not synced"))
                })),
            ])
            .await;
        let configz = Configz::new();
        configz
            .register("firefly-karmada-manager", &serde_json::json!({"karmadaName": "demo"}))
            .await
            .unwrap();
        let handler = BaseHandler::new(healthz, configz, DebugMux::new());

        let response = handler.handle(get("/healthz")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body(response).await.contains("[-]foo failed: not synced"));

        let response = handler.handle(get("/healthz/node")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body(response).await, "ok");

        assert_eq!(
            handler.handle(get("/healthz/missing")).await.status(),
            StatusCode::NOT_FOUND
        );

        let configz = body(handler.handle(get("/configz")).await).await;
        assert!(configz.contains("\"karmadaName\":\"demo\""));

        assert_eq!(handler.handle(get("/metrics")).await.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_configz_rejects_duplicates() {
        let configz = Configz::new();
        configz.register("a", &1).await.unwrap();
        assert!(configz.register("a", &2).await.is_err());
    }
}
