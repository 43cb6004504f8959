//! Push-to-pull bridge
//!
//! [`EventIterator`] runs a user callback as a detached task and hands it an
//! [`EventEmitter`]. The callback pushes items whenever it likes; the consumer
//! pulls them at its own pace. Pushing never blocks, so the queue between two
//! consumer wake-ups is unbounded. Use an [`IteratorPool`](crate::IteratorPool)
//! when the producer has to be held back.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use async_stream::stream;
use futures_core::Stream;
use futures_util::{FutureExt, StreamExt};

use crate::cancel::CancelToken;
use crate::config::{ProducerConfig, ProducerErrorPolicy};
use crate::error::{panic_message, StreamError, StreamResult};
use crate::signal::{signal, Signal, SignalWaiter};
use crate::source::{PullStream, Source};
use crate::stream::{AsyncStream, StreamIter};

struct EventState<T, R> {
    queue: Vec<T>,
    stopped: bool,
    result: Option<R>,
    failure: Option<StreamError>,
    signal: Signal<()>,
    /// Set once the consumer has seen the whole sequence
    ended: bool,
}

type Shared<T, R> = Arc<Mutex<EventState<T, R>>>;

fn lock<T, R>(shared: &Shared<T, R>) -> MutexGuard<'_, EventState<T, R>> {
    match shared.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Producer-side capabilities handed to the callback
pub struct EventEmitter<T, R = ()> {
    shared: Shared<T, R>,
    token: CancelToken,
}

impl<T, R> Clone for EventEmitter<T, R> {
    fn clone(&self) -> Self {
        EventEmitter {
            shared: Arc::clone(&self.shared),
            token: self.token.clone(),
        }
    }
}

impl<T, R> EventEmitter<T, R> {
    /// Queue an item for the consumer. Returns `false` (and drops the item)
    /// once the iterator was stopped or its consumer went away.
    pub fn push(&self, item: T) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        let mut state = lock(&self.shared);
        if state.stopped {
            return false;
        }
        state.queue.push(item);
        state.signal.resolve(());
        true
    }

    /// End the sequence with `result` as its terminal value. Items already
    /// pushed are still delivered; later pushes are ignored.
    pub fn stop(&self, result: R) {
        let mut state = lock(&self.shared);
        if state.stopped {
            return;
        }
        state.stopped = true;
        state.result = Some(result);
        state.signal.resolve(());
    }

    pub fn is_stopped(&self) -> bool {
        lock(&self.shared).stopped
    }

    /// Whether the consumer has closed or dropped the iterator, or has
    /// already drained the whole sequence.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the consumer has closed or dropped the iterator.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    fn fail(&self, err: StreamError) {
        let mut state = lock(&self.shared);
        if state.stopped {
            log::debug!("event producer failed after stop: {}", err);
            return;
        }
        state.stopped = true;
        if let Err(err) = state.signal.reject(err) {
            // The live signal already fired for pending items.
            state.failure = Some(err);
        }
    }
}

impl<T, R> fmt::Debug for EventEmitter<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("stopped", &self.is_stopped())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Pull sequence fed by a push-style callback
pub struct EventIterator<T, R = ()> {
    inner: StreamIter<T>,
    shared: Shared<T, R>,
}

impl<T, R> EventIterator<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    /// Spawn `callback` and return the consumer side.
    ///
    /// Must be called within a tokio runtime.
    pub fn new<F, Fut>(callback: F) -> Self
    where
        F: FnOnce(EventEmitter<T, R>) -> Fut,
        Fut: Future<Output = StreamResult<()>> + Send + 'static,
    {
        Self::with_config(ProducerConfig::default(), CancelToken::new(), callback)
    }

    pub fn with_config<F, Fut>(config: ProducerConfig, token: CancelToken, callback: F) -> Self
    where
        F: FnOnce(EventEmitter<T, R>) -> Fut,
        Fut: Future<Output = StreamResult<()>> + Send + 'static,
    {
        let (live, waiter) = signal();
        let shared = Arc::new(Mutex::new(EventState {
            queue: Vec::new(),
            stopped: false,
            result: None,
            failure: None,
            signal: live,
            ended: false,
        }));
        let emitter = EventEmitter {
            shared: Arc::clone(&shared),
            token: token.clone(),
        };

        let producer = AssertUnwindSafe(callback(emitter.clone())).catch_unwind();
        let producer_token = token.clone();
        let producer_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            log::debug!("event producer started");
            tokio::pin!(producer);
            let outcome = tokio::select! {
                outcome = &mut producer => outcome,
                _ = producer_token.cancelled() => {
                    // The token also fires when a drained sequence ends; only an
                    // abandoned consumer stops the callback.
                    if !lock(&producer_shared).ended {
                        log::debug!("event producer cancelled by consumer");
                        return;
                    }
                    producer.await
                }
            };
            match outcome {
                Ok(Ok(())) => log::debug!("event producer callback returned"),
                Ok(Err(e)) => emitter.fail(e),
                Err(panic) => emitter.fail(StreamError::producer(panic_message(panic.as_ref()))),
            }
        });

        let inner = consume(Arc::clone(&shared), waiter, config.error_policy);
        EventIterator {
            inner: StreamIter::new(inner, token),
            shared,
        }
    }

    pub async fn next(&mut self) -> Option<StreamResult<T>> {
        self.inner.next().await
    }

    /// Stop consuming; the producer observes cancellation unless the sequence
    /// already ended.
    pub fn close(&mut self) {
        self.inner.close();
    }

    /// Terminal value passed to [`EventEmitter::stop`], available once the
    /// sequence has ended.
    pub fn take_result(&mut self) -> Option<R> {
        if !self.inner.is_closed() {
            return None;
        }
        lock(&self.shared).result.take()
    }

    /// Drain the remaining items and return them with the terminal value.
    pub async fn into_result(mut self) -> StreamResult<(Vec<T>, Option<R>)> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item?);
        }
        let result = self.take_result();
        Ok((items, result))
    }
}

impl<T, R> Stream for EventIterator<T, R> {
    type Item = StreamResult<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl<T, R> fmt::Debug for EventIterator<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.shared);
        f.debug_struct("EventIterator")
            .field("queued", &state.queue.len())
            .field("stopped", &state.stopped)
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}

/// Consumer loop: wait for the live signal, swap the queue out, renew the
/// signal and yield the batch.
fn consume<T, R>(
    shared: Shared<T, R>,
    waiter: SignalWaiter<()>,
    policy: ProducerErrorPolicy,
) -> PullStream<T>
where
    T: Send + 'static,
    R: Send + 'static,
{
    stream! {
        let mut waiter = waiter;
        loop {
            let woke = waiter.await;
            let (batch, stopped, failure) = {
                let mut state = lock(&shared);
                let batch = std::mem::take(&mut state.queue);
                let failure = match woke {
                    Ok(()) => state.failure.take(),
                    Err(e) => Some(e),
                };
                waiter = state.signal.renew();
                (batch, state.stopped, failure)
            };
            for item in batch {
                yield Ok(item);
            }
            if let Some(e) = failure {
                lock(&shared).ended = true;
                match policy {
                    ProducerErrorPolicy::FailFast => yield Err(e),
                    ProducerErrorPolicy::LogAndContinue => {
                        log::error!("event producer failed, ending sequence: {}", e);
                    }
                }
                break;
            }
            if stopped {
                lock(&shared).ended = true;
                break;
            }
        }
    }
    .boxed()
}

/// Wrap a push-style callback as a multi-consumable [`AsyncStream`]; every
/// consumption runs `callback` afresh. The terminal value is discarded.
pub fn event_stream<T, R, F, Fut>(callback: F) -> AsyncStream<T>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(EventEmitter<T, R>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StreamResult<()>> + Send + 'static,
{
    event_stream_with_config(ProducerConfig::default(), callback)
}

pub fn event_stream_with_config<T, R, F, Fut>(config: ProducerConfig, callback: F) -> AsyncStream<T>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(EventEmitter<T, R>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StreamResult<()>> + Send + 'static,
{
    AsyncStream::from_factory_with_cancel(move |token| {
        let iter = EventIterator::<T, R>::with_config(config.clone(), token.child(), &callback);
        Source::Pull(iter.boxed())
    })
}
