//! Single-shot, renewable synchronization cell.
//!
//! A [`Signal`] is the firing half and a [`SignalWaiter`] the awaiting half of
//! one `tokio::sync::oneshot` slot. The slot fires at most once: later calls to
//! [`Signal::resolve`] or [`Signal::reject`] are no-ops. To signal again the
//! owner calls [`Signal::renew`], which swaps in a fresh slot and hands back its
//! waiter; the spent slot is never reused.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::{StreamError, StreamResult};

/// Create a fresh, unfired signal pair.
pub fn signal<V>() -> (Signal<V>, SignalWaiter<V>) {
    let (tx, rx) = oneshot::channel();
    (Signal { tx: Some(tx) }, SignalWaiter { rx })
}

/// Firing half of a signal
#[derive(Debug)]
pub struct Signal<V = ()> {
    tx: Option<oneshot::Sender<StreamResult<V>>>,
}

impl<V> Signal<V> {
    /// Fire with a value. Returns `false` if the slot had already fired.
    pub fn resolve(&mut self, value: V) -> bool {
        match self.tx.take() {
            Some(tx) => {
                // A dropped waiter just means nobody is listening anymore.
                let _ = tx.send(Ok(value));
                true
            }
            None => false,
        }
    }

    /// Fire with an error. Hands the error back if the slot had already fired.
    pub fn reject(&mut self, err: StreamError) -> Result<(), StreamError> {
        match self.tx.take() {
            Some(tx) => {
                let _ = tx.send(Err(err));
                Ok(())
            }
            None => Err(err),
        }
    }

    pub fn is_fired(&self) -> bool {
        self.tx.is_none()
    }

    /// Replace this slot with a fresh one and return the new waiter.
    ///
    /// An unfired old slot is dropped, so a waiter still holding it observes
    /// [`StreamError::Cancelled`].
    pub fn renew(&mut self) -> SignalWaiter<V> {
        let (fresh, waiter) = signal();
        *self = fresh;
        waiter
    }
}

/// Awaiting half of a signal
#[derive(Debug)]
pub struct SignalWaiter<V = ()> {
    rx: oneshot::Receiver<StreamResult<V>>,
}

impl<V> Future for SignalWaiter<V> {
    type Output = StreamResult<V>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(StreamError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}
