//! The operation abstraction.
//!
//! A [`Func`] is a single-input, single-output pipeline stage. Calling it
//! yields exactly one of an output or an [`Error`]. A stage which takes
//! ownership of a closeable input and then fails closes that input before
//! returning, so pipelines never leak connections on partial failure.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tower::ServiceExt as _;

use crate::context::Context;
use crate::error::{BoxError, Error};

/// The input of stages which take no input.
pub type Unit = ();

/// A pipeline stage from `A` to [`Func::Output`].
pub trait Func<A>: Send + Sync {
    /// The value produced on success.
    type Output: Send + 'static;

    /// Run the stage.
    fn call<'a>(&'a self, ctx: &'a Context, input: A) -> BoxFuture<'a, Result<Self::Output, Error>>;
}

impl<A, F> Func<A> for Arc<F>
where
    F: Func<A> + ?Sized,
{
    type Output = F::Output;

    fn call<'a>(&'a self, ctx: &'a Context, input: A) -> BoxFuture<'a, Result<Self::Output, Error>> {
        (**self).call(ctx, input)
    }
}

impl<A, F> Func<A> for Box<F>
where
    F: Func<A> + ?Sized,
{
    type Output = F::Output;

    fn call<'a>(&'a self, ctx: &'a Context, input: A) -> BoxFuture<'a, Result<Self::Output, Error>> {
        (**self).call(ctx, input)
    }
}

/// Lifts an async function into a [`Func`], for ad-hoc pipeline stages.
///
/// The function receives its own clone of the [`Context`].
///
/// ```
/// # use netops::{Context, Func, FuncAdapter, Error};
/// # async fn run() -> Result<(), Error> {
/// let double = FuncAdapter::new(|_ctx: Context, n: u32| async move { Ok::<_, Error>(n * 2) });
/// assert_eq!(double.call(&Context::background(), 21).await?, 42);
/// # Ok(())
/// # }
/// ```
pub struct FuncAdapter<F, A> {
    f: F,
    _input: PhantomData<fn(A)>,
}

impl<F, A> FuncAdapter<F, A> {
    /// Wrap `f`.
    pub fn new(f: F) -> Self {
        Self {
            f,
            _input: PhantomData,
        }
    }
}

impl<F: Clone, A> Clone for FuncAdapter<F, A> {
    fn clone(&self) -> Self {
        Self::new(self.f.clone())
    }
}

impl<F, A> fmt::Debug for FuncAdapter<F, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FuncAdapter")
            .field("f", &std::any::type_name::<F>())
            .finish()
    }
}

impl<F, A, B, Fut> Func<A> for FuncAdapter<F, A>
where
    F: Fn(Context, A) -> Fut + Send + Sync,
    Fut: Future<Output = Result<B, Error>> + Send + 'static,
    B: Send + 'static,
{
    type Output = B;

    fn call<'a>(&'a self, ctx: &'a Context, input: A) -> BoxFuture<'a, Result<B, Error>> {
        Box::pin((self.f)(ctx.clone(), input))
    }
}

/// Lifts a [`tower::Service`] into a [`Func`].
///
/// The service is cloned for every call and driven to readiness before the
/// request is sent. Service errors are wrapped with [`Error::other`].
#[derive(Debug, Clone)]
pub struct ServiceFunc<S> {
    service: S,
}

impl<S> ServiceFunc<S> {
    /// Wrap `service`.
    pub fn new(service: S) -> Self {
        Self { service }
    }
}

impl<S, A> Func<A> for ServiceFunc<S>
where
    S: tower::Service<A> + Clone + Send + Sync + 'static,
    S::Response: Send + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send,
    A: Send + 'static,
{
    type Output = S::Response;

    fn call<'a>(&'a self, _ctx: &'a Context, input: A) -> BoxFuture<'a, Result<S::Response, Error>> {
        let service = self.service.clone();
        Box::pin(async move {
            service
                .oneshot(input)
                .await
                .map_err(|err| Error::other(err.into()))
        })
    }
}
