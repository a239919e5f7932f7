//! Durable workflow futures and cancel scopes

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::LocalBoxFuture;
use serde::de::DeserializeOwned;

use crate::payload::{decode, Converter, Payload};
use crate::scheduler::WakeSignal;
use crate::workflow::WorkflowError;

/// Single-assignment result cell shared between the executor (which resolves
/// it from history) and the awaiting coroutine.
pub(crate) struct FutureCell {
    value: RefCell<Option<Result<Payload, WorkflowError>>>,
    signal: WakeSignal,
}

impl FutureCell {
    pub(crate) fn new(signal: WakeSignal) -> Rc<Self> {
        Rc::new(Self {
            value: RefCell::new(None),
            signal,
        })
    }

    /// Assign the result. The first assignment wins; later ones are ignored.
    pub(crate) fn complete(&self, result: Result<Payload, WorkflowError>) {
        let mut value = self.value.borrow_mut();
        if value.is_none() {
            *value = Some(result);
            self.signal.set();
        }
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.value.borrow().is_some()
    }

    pub(crate) fn peek(&self) -> Option<Result<Payload, WorkflowError>> {
        self.value.borrow().clone()
    }
}

/// Cancellation scope propagated through a [`WorkflowContext`].
///
/// Canceling a scope rejects every pending future created under it (and
/// under its child scopes). Cancellation is observed as a rejected future,
/// never as a panic out of a suspension point.
///
/// [`WorkflowContext`]: crate::workflow::WorkflowContext
#[derive(Clone)]
pub struct CancelScope {
    inner: Rc<ScopeInner>,
}

struct ScopeInner {
    canceled: Cell<bool>,
    parent: Option<CancelScope>,
    signal: WakeSignal,
}

impl CancelScope {
    pub(crate) fn new_root(signal: WakeSignal) -> Self {
        Self {
            inner: Rc::new(ScopeInner {
                canceled: Cell::new(false),
                parent: None,
                signal,
            }),
        }
    }

    /// Create a child scope; canceling the parent cancels the child too
    pub(crate) fn child(&self) -> Self {
        Self {
            inner: Rc::new(ScopeInner {
                canceled: Cell::new(false),
                parent: Some(self.clone()),
                signal: self.inner.signal.clone(),
            }),
        }
    }

    /// Cancel this scope and everything beneath it
    pub fn cancel(&self) {
        self.inner.canceled.set(true);
        self.inner.signal.set();
    }

    /// Whether this scope or any ancestor has been canceled
    pub fn is_canceled(&self) -> bool {
        if self.inner.canceled.get() {
            return true;
        }
        match &self.inner.parent {
            Some(parent) => parent.is_canceled(),
            None => false,
        }
    }
}

/// A durable promise usable only from workflow code.
///
/// Futures either wrap a [`FutureCell`] resolved by the replay engine
/// (activities, timers, sub-workflows, side effects) or compose other
/// workflow futures (the retry decorator). Awaiting a pending future blocks
/// the current coroutine until the executor delivers the corresponding
/// result event.
pub struct WorkflowFuture<T> {
    kind: FutureKind<T>,
}

enum FutureKind<T> {
    Cell {
        cell: Rc<FutureCell>,
        schedule_event_id: i64,
        converter: Arc<dyn Converter>,
        scope: CancelScope,
        _marker: PhantomData<fn() -> T>,
    },
    Composed {
        future: LocalBoxFuture<'static, Result<T, WorkflowError>>,
    },
}

impl<T> WorkflowFuture<T> {
    pub(crate) fn from_cell(
        cell: Rc<FutureCell>,
        schedule_event_id: i64,
        converter: Arc<dyn Converter>,
        scope: CancelScope,
    ) -> Self {
        Self {
            kind: FutureKind::Cell {
                cell,
                schedule_event_id,
                converter,
                scope,
                _marker: PhantomData,
            },
        }
    }

    pub(crate) fn from_future(
        future: LocalBoxFuture<'static, Result<T, WorkflowError>>,
    ) -> Self {
        Self {
            kind: FutureKind::Composed { future },
        }
    }

    pub(crate) fn ready_err(error: WorkflowError) -> Self
    where
        T: 'static,
    {
        Self::from_future(Box::pin(async move { Err(error) }))
    }

    /// The command ID this future resolves from, when it maps to a single
    /// schedule event (composed futures do not)
    pub fn schedule_event_id(&self) -> Option<i64> {
        match &self.kind {
            FutureKind::Cell {
                schedule_event_id, ..
            } => Some(*schedule_event_id),
            FutureKind::Composed { .. } => None,
        }
    }
}

impl<T: DeserializeOwned> Future for WorkflowFuture<T> {
    type Output = Result<T, WorkflowError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.kind {
            FutureKind::Cell {
                cell,
                converter,
                scope,
                ..
            } => {
                if let Some(result) = cell.peek() {
                    return Poll::Ready(result.and_then(|payload| {
                        decode(&**converter, &payload).map_err(WorkflowError::from)
                    }));
                }
                if scope.is_canceled() {
                    // Record the rejection so other observers of the cell
                    // (cancel_timer, re-polls) see a completed future.
                    cell.complete(Err(WorkflowError::canceled()));
                    return Poll::Ready(Err(WorkflowError::canceled()));
                }
                Poll::Pending
            }
            FutureKind::Composed { future } => future.as_mut().poll(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{encode, JsonConverter};
    use futures::task::noop_waker_ref;

    fn poll_once<T: DeserializeOwned>(
        future: &mut WorkflowFuture<T>,
    ) -> Poll<Result<T, WorkflowError>> {
        let mut cx = Context::from_waker(noop_waker_ref());
        Pin::new(future).poll(&mut cx)
    }

    #[test]
    fn test_pending_until_resolved() {
        let signal = WakeSignal::default();
        let cell = FutureCell::new(signal.clone());
        let mut future: WorkflowFuture<i32> = WorkflowFuture::from_cell(
            Rc::clone(&cell),
            1,
            Arc::new(JsonConverter),
            CancelScope::new_root(signal.clone()),
        );

        assert!(poll_once(&mut future).is_pending());

        cell.complete(Ok(encode(&JsonConverter, &23).unwrap()));
        assert!(signal.take());

        match poll_once(&mut future) {
            Poll::Ready(Ok(v)) => assert_eq!(v, 23),
            other => panic!("expected resolved future, got {other:?}"),
        }
    }

    #[test]
    fn test_first_assignment_wins() {
        let signal = WakeSignal::default();
        let cell = FutureCell::new(signal);

        cell.complete(Ok(encode(&JsonConverter, &1).unwrap()));
        cell.complete(Ok(encode(&JsonConverter, &2).unwrap()));

        let payload = cell.peek().unwrap().unwrap();
        let value: i32 = decode(&JsonConverter, &payload).unwrap();
        assert_eq!(value, 1);
    }

    #[test]
    fn test_canceled_scope_rejects_pending_future() {
        let signal = WakeSignal::default();
        let cell = FutureCell::new(signal.clone());
        let scope = CancelScope::new_root(signal.clone());
        let mut future: WorkflowFuture<i32> =
            WorkflowFuture::from_cell(cell, 1, Arc::new(JsonConverter), scope.clone());

        assert!(poll_once(&mut future).is_pending());
        scope.cancel();

        match poll_once(&mut future) {
            Poll::Ready(Err(err)) => assert!(err.is_canceled()),
            other => panic!("expected canceled future, got {other:?}"),
        }
    }

    #[test]
    fn test_resolved_value_survives_cancellation() {
        let signal = WakeSignal::default();
        let cell = FutureCell::new(signal.clone());
        let scope = CancelScope::new_root(signal);
        let mut future: WorkflowFuture<i32> =
            WorkflowFuture::from_cell(Rc::clone(&cell), 1, Arc::new(JsonConverter), scope.clone());

        cell.complete(Ok(encode(&JsonConverter, &7).unwrap()));
        scope.cancel();

        match poll_once(&mut future) {
            Poll::Ready(Ok(v)) => assert_eq!(v, 7),
            other => panic!("expected resolved future, got {other:?}"),
        }
    }

    #[test]
    fn test_child_scope_cancellation_propagates() {
        let signal = WakeSignal::default();
        let root = CancelScope::new_root(signal);
        let child = root.child();

        assert!(!child.is_canceled());
        root.cancel();
        assert!(child.is_canceled());
    }

    #[test]
    fn test_child_cancel_leaves_parent_alone() {
        let signal = WakeSignal::default();
        let root = CancelScope::new_root(signal);
        let child = root.child();

        child.cancel();
        assert!(child.is_canceled());
        assert!(!root.is_canceled());
    }
}
