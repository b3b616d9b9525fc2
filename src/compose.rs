//! Chaining pipeline stages.
//!
//! [`compose2`] is the binary primitive: it runs the first stage and, only if
//! that succeeds, feeds its output to the second. Higher arities right-fold
//! it, so `compose3(a, b, c)` is `compose2(a, compose2(b, c))`.

use std::net::SocketAddr;

use futures_util::future::BoxFuture;

use crate::context::Context;
use crate::error::Error;
use crate::func::{Func, Unit};

/// Two stages run back to back. Built by [`compose2`].
#[derive(Debug, Clone)]
pub struct Compose2<F1, F2> {
    first: F1,
    second: F2,
}

impl<A, F1, F2> Func<A> for Compose2<F1, F2>
where
    A: Send + 'static,
    F1: Func<A>,
    F2: Func<F1::Output>,
{
    type Output = F2::Output;

    fn call<'a>(&'a self, ctx: &'a Context, input: A) -> BoxFuture<'a, Result<F2::Output, Error>> {
        Box::pin(async move {
            let intermediate = self.first.call(ctx, input).await?;
            self.second.call(ctx, intermediate).await
        })
    }
}

/// Run `first`, then `second` on its output. The first failure wins.
pub fn compose2<F1, F2>(first: F1, second: F2) -> Compose2<F1, F2> {
    Compose2 { first, second }
}

/// Chain three stages.
pub fn compose3<F1, F2, F3>(f1: F1, f2: F2, f3: F3) -> Compose2<F1, Compose2<F2, F3>> {
    compose2(f1, compose2(f2, f3))
}

/// Chain four stages.
pub fn compose4<F1, F2, F3, F4>(
    f1: F1,
    f2: F2,
    f3: F3,
    f4: F4,
) -> Compose2<F1, Compose2<F2, Compose2<F3, F4>>> {
    compose2(f1, compose3(f2, f3, f4))
}

/// Chain five stages.
pub fn compose5<F1, F2, F3, F4, F5>(
    f1: F1,
    f2: F2,
    f3: F3,
    f4: F4,
    f5: F5,
) -> Compose2<F1, Compose2<F2, Compose2<F3, Compose2<F4, F5>>>> {
    compose2(f1, compose4(f2, f3, f4, f5))
}

/// Chain six stages.
#[allow(clippy::type_complexity)]
pub fn compose6<F1, F2, F3, F4, F5, F6>(
    f1: F1,
    f2: F2,
    f3: F3,
    f4: F4,
    f5: F5,
    f6: F6,
) -> Compose2<F1, Compose2<F2, Compose2<F3, Compose2<F4, Compose2<F5, F6>>>>> {
    compose2(f1, compose5(f2, f3, f4, f5, f6))
}

/// Chain seven stages.
#[allow(clippy::type_complexity)]
pub fn compose7<F1, F2, F3, F4, F5, F6, F7>(
    f1: F1,
    f2: F2,
    f3: F3,
    f4: F4,
    f5: F5,
    f6: F6,
    f7: F7,
) -> Compose2<F1, Compose2<F2, Compose2<F3, Compose2<F4, Compose2<F5, Compose2<F6, F7>>>>>> {
    compose2(f1, compose6(f2, f3, f4, f5, f6, f7))
}

/// Chain eight stages.
#[allow(clippy::type_complexity, clippy::too_many_arguments)]
pub fn compose8<F1, F2, F3, F4, F5, F6, F7, F8>(
    f1: F1,
    f2: F2,
    f3: F3,
    f4: F4,
    f5: F5,
    f6: F6,
    f7: F7,
    f8: F8,
) -> Compose2<
    F1,
    Compose2<F2, Compose2<F3, Compose2<F4, Compose2<F5, Compose2<F6, Compose2<F7, F8>>>>>>,
> {
    compose2(f1, compose7(f2, f3, f4, f5, f6, f7, f8))
}

/// A stage which ignores its input and always yields a clone of a value.
#[derive(Debug, Clone)]
pub struct ConstFunc<B> {
    value: B,
}

impl<A, B> Func<A> for ConstFunc<B>
where
    B: Clone + Send + Sync + 'static,
{
    type Output = B;

    fn call<'a>(&'a self, _ctx: &'a Context, input: A) -> BoxFuture<'a, Result<B, Error>> {
        drop(input);
        let value = self.value.clone();
        Box::pin(async move { Ok(value) })
    }
}

/// Lift `value` into a stage that needs no input.
pub fn const_func<B>(value: B) -> ConstFunc<B> {
    ConstFunc { value }
}

/// Lift an endpoint into the head of a connection pipeline.
pub fn endpoint_func(endpoint: SocketAddr) -> ConstFunc<SocketAddr> {
    const_func(endpoint)
}

/// A stage with its input fixed in advance. Built by [`apply`].
#[derive(Debug, Clone)]
pub struct Apply<F, A> {
    func: F,
    input: A,
}

impl<F, A> Func<Unit> for Apply<F, A>
where
    F: Func<A>,
    A: Clone + Send + Sync,
{
    type Output = F::Output;

    fn call<'a>(&'a self, ctx: &'a Context, _input: Unit) -> BoxFuture<'a, Result<F::Output, Error>> {
        self.func.call(ctx, self.input.clone())
    }
}

/// Partially apply `input` to `func`, yielding a stage that needs no input.
pub fn apply<F, A>(func: F, input: A) -> Apply<F, A> {
    Apply { func, input }
}
