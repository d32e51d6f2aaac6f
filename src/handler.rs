//! The per-request hook the proxy engine drives.
//!
//! The engine knows nothing about signing or verification. It hands every
//! parsed request to a [`RequestHandler`], which either lets it continue
//! (possibly mutated) or answers it directly.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use http::{Request, Response};
use tower::Service;

use crate::http::{Body, BoxError, HttpService};

/// What a handler decided for one request.
pub enum Outcome {
    /// Continue to the destination with this request.
    Forward(Request<Body>),
    /// Answer the client with this response; nothing is forwarded.
    Respond(Response<Body>),
}

/// A single-function request hook: `request -> request | early response`.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, req: Request<Body>) -> impl Future<Output = Outcome> + Send;
}

/// Tower layer running a [`RequestHandler`] in front of the inner service.
pub struct HandlerLayer<H> {
    handler: Arc<H>,
}

impl<H> HandlerLayer<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }
}

impl<H> Clone for HandlerLayer<H> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
        }
    }
}

impl<H: RequestHandler> tower::Layer<HttpService> for HandlerLayer<H> {
    type Service = HandlerService<H>;

    fn layer(&self, inner: HttpService) -> Self::Service {
        HandlerService {
            inner: Arc::new(tokio::sync::Mutex::new(inner)),
            handler: self.handler.clone(),
        }
    }
}

pub struct HandlerService<H> {
    inner: Arc<tokio::sync::Mutex<HttpService>>,
    handler: Arc<H>,
}

impl<H: RequestHandler> Service<Request<Body>> for HandlerService<H> {
    type Response = Response<Body>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Body>, BoxError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let inner = self.inner.clone();
        let handler = self.handler.clone();
        Box::pin(async move {
            match handler.handle(req).await {
                Outcome::Respond(resp) => Ok(resp),
                Outcome::Forward(req) => {
                    let fut = {
                        let mut svc = inner.lock().await;
                        std::future::poll_fn(|cx| svc.poll_ready(cx)).await?;
                        svc.call(req)
                    };
                    fut.await
                }
            }
        })
    }
}
