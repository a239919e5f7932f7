//! Deterministic select over workflow futures and channels
//!
//! Cases are evaluated in the order they were added; among simultaneously
//! ready cases the lowest-indexed one wins. The default case, when present,
//! fires only if no other case is ready. This ordering rule is mandatory for
//! replay determinism.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::de::DeserializeOwned;

use crate::workflow::channel::{Channel, SignalChannel};
use crate::workflow::futures::WorkflowFuture;
use crate::workflow::WorkflowError;

/// Start building a select over workflow cases.
///
/// # Example
///
/// ```ignore
/// let outcome = select()
///     .future(timer, |_| Outcome::TimedOut)
///     .signal(&approvals, |signal| Outcome::Approved(signal))
///     .await;
/// ```
pub fn select<'a, R>() -> Select<'a, R> {
    Select {
        arms: Vec::new(),
        default_arm: None,
    }
}

/// A pending select; completes when the first case is satisfied.
pub struct Select<'a, R> {
    arms: Vec<Box<dyn SelectArm<R> + 'a>>,
    default_arm: Option<Box<dyn FnOnce() -> R + 'a>>,
}

trait SelectArm<R> {
    fn try_resolve(&mut self, cx: &mut Context<'_>) -> Option<R>;
}

impl<'a, R> Select<'a, R> {
    /// Add a case that fires when the future completes
    pub fn future<T, F>(mut self, future: WorkflowFuture<T>, handler: F) -> Self
    where
        T: DeserializeOwned + 'a,
        F: FnOnce(Result<T, WorkflowError>) -> R + 'a,
    {
        self.arms.push(Box::new(FutureArm {
            future,
            handler: Some(handler),
        }));
        self
    }

    /// Add a case that fires when the channel has a value (or is closed)
    pub fn receive<T, F>(mut self, channel: &Channel<T>, handler: F) -> Self
    where
        T: 'a,
        F: FnOnce(Option<T>) -> R + 'a,
    {
        self.arms.push(Box::new(ReceiveArm {
            channel: channel.clone(),
            handler: Some(handler),
        }));
        self
    }

    /// Add a case that fires when a signal arrives on the channel
    pub fn signal<T, F>(mut self, channel: &SignalChannel<T>, handler: F) -> Self
    where
        T: DeserializeOwned + 'a,
        F: FnOnce(Result<T, WorkflowError>) -> R + 'a,
    {
        self.arms.push(Box::new(SignalArm {
            channel: channel.clone(),
            handler: Some(handler),
        }));
        self
    }

    /// Add a default case, fired when no other case is ready.
    ///
    /// Regardless of where it appears in the builder chain, the default is
    /// always evaluated after every other case.
    pub fn otherwise<F>(mut self, handler: F) -> Self
    where
        F: FnOnce() -> R + 'a,
    {
        self.default_arm = Some(Box::new(handler));
        self
    }
}

impl<R> Future for Select<'_, R> {
    type Output = R;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<R> {
        let this = self.get_mut();
        for arm in this.arms.iter_mut() {
            if let Some(result) = arm.try_resolve(cx) {
                return Poll::Ready(result);
            }
        }
        if let Some(default_arm) = this.default_arm.take() {
            return Poll::Ready(default_arm());
        }
        Poll::Pending
    }
}

struct FutureArm<T, F> {
    future: WorkflowFuture<T>,
    handler: Option<F>,
}

impl<T, F, R> SelectArm<R> for FutureArm<T, F>
where
    T: DeserializeOwned,
    F: FnOnce(Result<T, WorkflowError>) -> R,
{
    fn try_resolve(&mut self, cx: &mut Context<'_>) -> Option<R> {
        match Pin::new(&mut self.future).poll(cx) {
            Poll::Ready(result) => {
                let handler = self.handler.take().expect("select arm fired twice");
                Some(handler(result))
            }
            Poll::Pending => None,
        }
    }
}

struct ReceiveArm<T, F> {
    channel: Channel<T>,
    handler: Option<F>,
}

impl<T, F, R> SelectArm<R> for ReceiveArm<T, F>
where
    F: FnOnce(Option<T>) -> R,
{
    fn try_resolve(&mut self, _cx: &mut Context<'_>) -> Option<R> {
        match self.channel.poll_receive() {
            Poll::Ready(value) => {
                let handler = self.handler.take().expect("select arm fired twice");
                Some(handler(value))
            }
            Poll::Pending => None,
        }
    }
}

struct SignalArm<T, F> {
    channel: SignalChannel<T>,
    handler: Option<F>,
}

impl<T, F, R> SelectArm<R> for SignalArm<T, F>
where
    T: DeserializeOwned,
    F: FnOnce(Result<T, WorkflowError>) -> R,
{
    fn try_resolve(&mut self, _cx: &mut Context<'_>) -> Option<R> {
        match self.channel.poll_decoded() {
            Poll::Ready(result) => {
                let handler = self.handler.take().expect("select arm fired twice");
                Some(handler(result))
            }
            Poll::Pending => None,
        }
    }
}
