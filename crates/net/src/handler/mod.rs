//! Request handlers registered on the server side transfer manager.
//!
//! A handler gets the parsed request together with the id of the session it
//! arrived on and, for chunked uploads carrying a `Content-MD5` trailer, the
//! result of the digest check.
//!
//! ```
//! use micro_net::handler::{make_handler, RequestContext};
//! use micro_net::http::HttpResponse;
//! use std::error::Error;
//!
//! async fn echo(ctx: RequestContext) -> Result<HttpResponse, Box<dyn Error + Send + Sync>> {
//!     Ok(HttpResponse::text(http::StatusCode::OK, ctx.request.body().to_vec()))
//! }
//!
//! let handler = make_handler(echo);
//! ```

use async_trait::async_trait;
use std::error::Error;
use std::future::Future;

use crate::http::HttpRequest;
use crate::http::HttpResponse;
use crate::session::SessionId;

/// What a handler receives.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request: HttpRequest,
    pub connection_id: SessionId,
    /// `Some(true)` when a chunked body matched its `Content-MD5` trailer,
    /// `Some(false)` on a mismatch, `None` when there was nothing to check
    pub integrity: Option<bool>,
}

impl RequestContext {
    pub fn new(request: HttpRequest, connection_id: SessionId, integrity: Option<bool>) -> Self {
        Self { request, connection_id, integrity }
    }
}

#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn call(&self, ctx: RequestContext) -> Result<HttpResponse, Box<dyn Error + Send + Sync>>;
}

#[derive(Debug)]
pub struct HandlerFn<F> {
    f: F,
}

#[async_trait]
impl<Err, F, Fut> RequestHandler for HandlerFn<F>
where
    F: Fn(RequestContext) -> Fut + Send + Sync,
    Err: Into<Box<dyn Error + Send + Sync>>,
    Fut: Future<Output = Result<HttpResponse, Err>> + Send,
{
    async fn call(&self, ctx: RequestContext) -> Result<HttpResponse, Box<dyn Error + Send + Sync>> {
        (self.f)(ctx).await.map_err(Into::into)
    }
}

pub fn make_handler<F, Err, Ret>(f: F) -> HandlerFn<F>
where
    Err: Into<Box<dyn Error + Send + Sync>>,
    Ret: Future<Output = Result<HttpResponse, Err>>,
    F: Fn(RequestContext) -> Ret,
{
    HandlerFn { f }
}
