//! HTTP webhook receiver source.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};
use observability_deps::tracing::{error, info, warn};
use parking_lot::Mutex;
use river::RiverError;
use tokio_util::sync::CancellationToken;

use super::signature::SignatureVerifier;
use crate::source::{Source, SourceContext};
use crate::GroveError;

/// Configuration of a webhook receiver.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Address to listen on; port 0 picks a free one.
    pub bind: SocketAddr,
    /// Request path that accepts deliveries, e.g. `/hooks/github`.
    pub path: String,
    /// How inbound requests are authenticated.
    pub verifier: SignatureVerifier,
}

/// A source that accepts signed HTTP deliveries and flows the raw body into
/// the river.
#[derive(Debug)]
pub struct WebhookSource {
    name: String,
    config: WebhookConfig,
    running: AtomicBool,
    server: Mutex<Option<RunningServer>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

#[derive(Debug)]
struct RunningServer {
    token: CancellationToken,
    join: tokio::task::JoinHandle<()>,
}

impl WebhookSource {
    /// Build a webhook source.
    pub fn new(name: impl Into<String>, config: WebhookConfig) -> Self {
        Self {
            name: name.into(),
            config,
            running: AtomicBool::new(false),
            server: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// The address actually bound, once running. Useful with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }
}

struct RequestHandler {
    name: String,
    path: String,
    verifier: SignatureVerifier,
    ctx: SourceContext,
}

impl RequestHandler {
    async fn handle(&self, req: Request<Body>) -> Response<Body> {
        if req.method() != Method::POST {
            return status(StatusCode::METHOD_NOT_ALLOWED);
        }
        if req.uri().path() != self.path {
            return status(StatusCode::NOT_FOUND);
        }

        let (parts, body) = req.into_parts();
        let bytes = match hyper::body::to_bytes(body).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(source = %self.name, %e, "failed to read webhook body");
                return status(StatusCode::BAD_REQUEST);
            }
        };

        if let Err(e) = self.verifier.verify(&parts.headers, &bytes) {
            warn!(
                source = %self.name,
                scheme = self.verifier.scheme(),
                %e,
                "rejected webhook delivery"
            );
            return status(StatusCode::UNAUTHORIZED);
        }

        match self.ctx.flow(None, bytes.to_vec()).await {
            Ok(slot) => {
                info!(source = %self.name, %slot, "webhook delivery flowed");
                status(StatusCode::ACCEPTED)
            }
            Err(RiverError::InvalidInput(e)) => {
                warn!(source = %self.name, %e, "webhook delivery rejected by river");
                status(StatusCode::BAD_REQUEST)
            }
            Err(e) => {
                error!(source = %self.name, %e, "failed to flow webhook delivery");
                status(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

fn status(code: StatusCode) -> Response<Body> {
    Response::builder()
        .status(code)
        .body(Body::empty())
        .expect("static response")
}

#[async_trait]
impl Source for WebhookSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn source_type(&self) -> &str {
        "webhook"
    }

    async fn start(&self, ctx: SourceContext) -> Result<(), GroveError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(GroveError::AlreadyRunning);
        }

        let handler = Arc::new(RequestHandler {
            name: self.name.clone(),
            path: self.config.path.clone(),
            verifier: self.config.verifier.clone(),
            ctx,
        });

        let make_svc = make_service_fn(move |_conn| {
            let handler = Arc::clone(&handler);
            async move {
                Ok::<_, std::convert::Infallible>(service_fn(move |req| {
                    let handler = Arc::clone(&handler);
                    async move { Ok::<_, std::convert::Infallible>(handler.handle(req).await) }
                }))
            }
        });

        let builder = match hyper::Server::try_bind(&self.config.bind) {
            Ok(builder) => builder,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(GroveError::Transport(format!(
                    "failed to bind {}: {e}",
                    self.config.bind
                )));
            }
        };
        let server = builder.serve(make_svc);
        let local_addr = server.local_addr();
        *self.local_addr.lock() = Some(local_addr);

        let token = CancellationToken::new();
        let shutdown_token = token.clone();
        let graceful = server.with_graceful_shutdown(async move {
            shutdown_token.cancelled().await;
        });

        let name = self.name.clone();
        let join = tokio::spawn(async move {
            if let Err(e) = graceful.await {
                error!(source = %name, %e, "webhook server failed");
            }
        });

        *self.server.lock() = Some(RunningServer { token, join });
        info!(source = %self.name, addr = %local_addr, path = %self.config.path, "webhook listening");
        Ok(())
    }

    async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let server = self.server.lock().take();
        if let Some(server) = server {
            server.token.cancel();
            if let Err(e) = server.join.await {
                error!(source = %self.name, %e, "webhook server task panicked");
            }
        }
        *self.local_addr.lock() = None;
        info!(source = %self.name, "webhook stopped");
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for RequestHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandler")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forest_stream::memory::MemoryLog;
    use forest_time::{SystemProvider, TimeProvider};
    use forest_types::RiverData;
    use hmac::{Hmac, Mac};
    use river::{River, RiverConfig, RiverHandler};
    use sha2::Sha256;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn river() -> River {
        let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemProvider::new());
        let config = RiverConfig::default();
        let log = Arc::new(MemoryLog::new(config.retention, Arc::clone(&time_provider)));
        River::new(log, time_provider, config)
    }

    #[derive(Debug)]
    struct ForwardingHandler {
        tx: mpsc::UnboundedSender<RiverData>,
    }

    #[async_trait]
    impl RiverHandler for ForwardingHandler {
        async fn handle(
            &self,
            data: RiverData,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.tx.send(data)?;
            Ok(())
        }
    }

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[tokio::test]
    async fn signed_deliveries_flow_into_the_river() {
        test_helpers::maybe_start_logging();
        let river = river();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _observer = river
            .observe("river.hooks.>", Arc::new(ForwardingHandler { tx }))
            .await
            .unwrap();

        let source = WebhookSource::new(
            "github-hook",
            WebhookConfig {
                bind: "127.0.0.1:0".parse().unwrap(),
                path: "/hooks/github".to_string(),
                verifier: SignatureVerifier::HmacSha256 {
                    header: "x-signature".to_string(),
                    secret: "s3cret".to_string(),
                },
            },
        );
        source
            .start(SourceContext::new(river.clone(), "hooks.github"))
            .await
            .unwrap();
        assert!(source.is_running());
        let addr = source.local_addr().unwrap();

        let client = reqwest::Client::new();
        let body = br#"{"action":"push"}"#.to_vec();

        // Valid signature: accepted and flowed.
        let response = client
            .post(format!("http://{addr}/hooks/github"))
            .header("x-signature", sign("s3cret", &body))
            .body(body.clone())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 202);

        let delivered = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered.subject, "river.hooks.github");
        assert_eq!(delivered.data, body);

        // Bad signature: rejected, nothing flows.
        let response = client
            .post(format!("http://{addr}/hooks/github"))
            .header("x-signature", sign("wrong", &body))
            .body(body.clone())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 401);

        // Wrong path and method.
        let response = client
            .post(format!("http://{addr}/other"))
            .header("x-signature", sign("s3cret", &body))
            .body(body.clone())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 404);

        let response = client
            .get(format!("http://{addr}/hooks/github"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 405);

        source.stop().await;
        source.stop().await;
        assert!(!source.is_running());
    }
}
