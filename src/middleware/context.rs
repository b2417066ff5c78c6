//! Request-scoped metadata and cancellation.
//!
//! Two values ride along in every request's extensions while it travels
//! through the pipeline:
//!
//! - [`RequestContext`]: a typed, publish-once store shared by all
//!   interceptors of one request. Because the handle is reference counted,
//!   a value published by an inner interceptor (e.g. the client address
//!   resolver) is still visible to an outer interceptor (e.g. the completion
//!   logger) after the inner call returns.
//! - [`RequestCancellation`]: the request's node in the cancellation tree.
//!   The deadline enforcer swaps in a child token; handlers observe whatever
//!   token they find.
//!
//! # Handler Usage
//!
//! ```rust,ignore
//! async fn whoami(ctx: RequestContext, cancel: RequestCancellation) -> String {
//!     tokio::select! {
//!         _ = cancel.cancelled() => String::new(),
//!         addr = lookup(ctx.client_addr()) => addr,
//!     }
//! }
//! ```

use std::convert::Infallible;
use std::sync::{Arc, Mutex, PoisonError};

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{Extensions, Request};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Well-known key holding the resolved originating client address.
///
/// Published by [`ClientAddrLayer`](super::ip::ClientAddrLayer). An empty
/// string means the address could not be determined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientAddr(pub String);

/// Per-request key/value store keyed by value type.
///
/// Publish-once: the first value published for a type wins and later
/// attempts are ignored. Reads clone the stored value out, so no lock is
/// ever held across an `.await`.
#[derive(Clone, Default)]
pub struct RequestContext {
    values: Arc<Mutex<Extensions>>,
}

impl RequestContext {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a value under its type.
    ///
    /// Returns `false` (leaving the stored value untouched) if a value of
    /// this type was already published for the request.
    pub fn publish<T>(&self, value: T) -> bool
    where
        T: Clone + Send + Sync + 'static,
    {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        if values.get::<T>().is_some() {
            return false;
        }
        values.insert(value);
        true
    }

    /// Read a published value.
    pub fn get<T>(&self) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get::<T>()
            .cloned()
    }

    /// Check whether a value of type `T` has been published.
    pub fn contains<T>(&self) -> bool
    where
        T: Send + Sync + 'static,
    {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get::<T>()
            .is_some()
    }

    /// The resolved client address, or `""` when it is unknown or not yet
    /// published.
    pub fn client_addr(&self) -> String {
        self.get::<ClientAddr>().map(|a| a.0).unwrap_or_default()
    }

    /// Fetch the store attached to `req`, attaching a fresh one if absent.
    pub fn ensure<B>(req: &mut Request<B>) -> Self {
        if let Some(ctx) = req.extensions().get::<Self>() {
            return ctx.clone();
        }
        let ctx = Self::new();
        req.extensions_mut().insert(ctx.clone());
        ctx
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("client_addr", &self.client_addr())
            .finish_non_exhaustive()
    }
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        // Outside a pipeline the handler still gets a (detached, empty) store.
        Ok(parts.extensions.get::<Self>().cloned().unwrap_or_default())
    }
}

/// The request's cancellation signal.
///
/// Fires when the deadline expires, when the pipeline scope ends (client
/// disconnect, completion) or when the server-wide shutdown token is
/// cancelled. Handlers are expected to observe it at safe points; nothing
/// preempts them.
#[derive(Debug, Clone, Default)]
pub struct RequestCancellation(CancellationToken);

impl RequestCancellation {
    pub fn new(token: CancellationToken) -> Self {
        Self(token)
    }

    pub fn token(&self) -> &CancellationToken {
        &self.0
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }

    /// Resolves once the signal fires.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.0.cancelled()
    }
}

impl<S> FromRequestParts<S> for RequestCancellation
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts.extensions.get::<Self>().cloned().unwrap_or_default())
    }
}

/// Extension trait for reading the request scope off a request.
pub trait RequestScopeExt {
    /// The attached context store, if the request went through a pipeline.
    fn request_context(&self) -> Option<RequestContext>;

    /// The current cancellation token, or a detached token that never fires.
    fn cancellation_token(&self) -> CancellationToken;
}

impl<B> RequestScopeExt for Request<B> {
    fn request_context(&self) -> Option<RequestContext> {
        self.extensions().get::<RequestContext>().cloned()
    }

    fn cancellation_token(&self) -> CancellationToken {
        self.extensions()
            .get::<RequestCancellation>()
            .map(|c| c.0.clone())
            .unwrap_or_default()
    }
}

/// Fetch the request's token, attaching a fresh root token if absent.
pub(crate) fn ensure_cancellation<B>(req: &mut Request<B>) -> CancellationToken {
    if let Some(cancel) = req.extensions().get::<RequestCancellation>() {
        return cancel.0.clone();
    }
    let token = CancellationToken::new();
    req.extensions_mut()
        .insert(RequestCancellation(token.clone()));
    token
}

/// Replace the request's token for the remainder of the chain.
pub(crate) fn replace_cancellation<B>(req: &mut Request<B>, token: CancellationToken) {
    req.extensions_mut().insert(RequestCancellation(token));
}
