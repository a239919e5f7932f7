//! Workflow channels
//!
//! Unbounded FIFO channels usable only from workflow code. Sends never
//! block; receives block while the channel is empty and not closed. Signals
//! and sub-workflow result delivery are built on these.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll};

use serde::de::DeserializeOwned;

use crate::payload::{decode, Converter, Payload};
use crate::scheduler::WakeSignal;
use crate::workflow::WorkflowError;

struct ChannelInner<T> {
    queue: VecDeque<T>,
    closed: bool,
}

/// An unbounded typed FIFO for use inside a workflow.
pub struct Channel<T> {
    inner: Rc<RefCell<ChannelInner<T>>>,
    signal: WakeSignal,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
            signal: self.signal.clone(),
        }
    }
}

impl<T> Channel<T> {
    pub(crate) fn new(signal: WakeSignal) -> Self {
        Self {
            inner: Rc::new(RefCell::new(ChannelInner {
                queue: VecDeque::new(),
                closed: false,
            })),
            signal,
        }
    }

    /// Append a value; never blocks
    pub fn send(&self, value: T) {
        let mut inner = self.inner.borrow_mut();
        if inner.closed {
            return;
        }
        inner.queue.push_back(value);
        self.signal.set();
    }

    /// Close the channel; pending receives observe `None` once drained
    pub fn close(&self) {
        self.inner.borrow_mut().closed = true;
        self.signal.set();
    }

    /// Receive the next value, blocking the coroutine while empty.
    ///
    /// Resolves to `None` when the channel is closed and drained.
    pub fn receive(&self) -> ChannelReceive<T> {
        ChannelReceive {
            channel: self.clone(),
        }
    }

    /// Number of buffered values
    pub fn len(&self) -> usize {
        self.inner.borrow().queue.len()
    }

    /// Whether no values are buffered
    pub fn is_empty(&self) -> bool {
        self.inner.borrow().queue.is_empty()
    }

    /// Whether the channel has been closed
    pub fn is_closed(&self) -> bool {
        self.inner.borrow().closed
    }

    /// Non-blocking receive used by `receive` futures and select arms
    pub(crate) fn poll_receive(&self) -> Poll<Option<T>> {
        let mut inner = self.inner.borrow_mut();
        match inner.queue.pop_front() {
            Some(value) => Poll::Ready(Some(value)),
            None if inner.closed => Poll::Ready(None),
            None => Poll::Pending,
        }
    }
}

/// Future returned by [`Channel::receive`]
pub struct ChannelReceive<T> {
    channel: Channel<T>,
}

impl<T> Future for ChannelReceive<T> {
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.channel.poll_receive()
    }
}

/// A named, typed view over an instance's signal channel.
///
/// Obtained via [`WorkflowContext::signal_channel`]; repeated calls with the
/// same name return views over the same underlying channel. The executor
/// pushes raw payloads as `SignalReceived` events are delivered; receives
/// decode them on the way out.
///
/// [`WorkflowContext::signal_channel`]: crate::workflow::WorkflowContext::signal_channel
pub struct SignalChannel<T> {
    name: String,
    raw: Channel<Payload>,
    converter: Arc<dyn Converter>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for SignalChannel<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            raw: self.raw.clone(),
            converter: Arc::clone(&self.converter),
            _marker: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> SignalChannel<T> {
    pub(crate) fn new(name: String, raw: Channel<Payload>, converter: Arc<dyn Converter>) -> Self {
        Self {
            name,
            raw,
            converter,
            _marker: PhantomData,
        }
    }

    /// The signal name this channel receives
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Receive and decode the next signal, blocking while none is pending
    pub fn receive(&self) -> SignalReceive<T> {
        SignalReceive {
            channel: self.clone(),
        }
    }

    pub(crate) fn poll_decoded(&self) -> Poll<Result<T, WorkflowError>> {
        match self.raw.poll_receive() {
            Poll::Ready(Some(payload)) => {
                Poll::Ready(decode(&*self.converter, &payload).map_err(WorkflowError::from))
            }
            // Signal channels are never closed; treat a closed raw channel
            // as drained.
            Poll::Ready(None) | Poll::Pending => Poll::Pending,
        }
    }
}

/// Future returned by [`SignalChannel::receive`]
pub struct SignalReceive<T> {
    channel: SignalChannel<T>,
}

impl<T: DeserializeOwned> Future for SignalReceive<T> {
    type Output = Result<T, WorkflowError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.channel.poll_decoded()
    }
}
