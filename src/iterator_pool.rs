//! Bounded lookahead buffer
//!
//! An [`IteratorPool`] lets a detached producer run ahead of its consumer by
//! at most `size` items. Two signals coordinate the pair: the producer fires
//! *data-ready* after every append, and the consumer fires *drained* after it
//! swaps the whole buffer out. A producer that finds the buffer full arms a
//! fresh drained signal and waits on it, which is the backpressure.
//!
//! Items leave in source order. Dropping or closing the consumer cancels the
//! producer at its next suspension point.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use async_stream::stream;
use futures_core::Stream;
use futures_util::{FutureExt, StreamExt};

use crate::cancel::CancelToken;
use crate::config::{PoolConfig, ProducerErrorPolicy};
use crate::error::{panic_message, StreamError, StreamResult};
use crate::signal::{signal, Signal, SignalWaiter};
use crate::source::{PullStream, Source};
use crate::stream::{AsyncStream, StreamIter};

struct PoolState<T> {
    buffer: Vec<T>,
    done: bool,
    failure: Option<StreamError>,
    ready: Signal<()>,
    drained: Signal<()>,
    peak: usize,
    delivered: usize,
}

type Shared<T> = Arc<Mutex<PoolState<T>>>;

fn lock<T>(shared: &Shared<T>) -> MutexGuard<'_, PoolState<T>> {
    match shared.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Lookahead buffer over a source stream
pub struct IteratorPool<T> {
    source: AsyncStream<T>,
    config: PoolConfig,
}

impl<T> Clone for IteratorPool<T> {
    fn clone(&self) -> Self {
        IteratorPool {
            source: self.source.clone(),
            config: self.config.clone(),
        }
    }
}

impl<T> IteratorPool<T>
where
    T: Send + 'static,
{
    pub fn new(size: usize, source: impl Into<AsyncStream<T>>) -> Self {
        Self::with_config(PoolConfig::new(size), source)
    }

    pub fn with_config(config: PoolConfig, source: impl Into<AsyncStream<T>>) -> Self {
        IteratorPool {
            source: source.into(),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Start the producer and return the consumer side.
    ///
    /// Must be called within a tokio runtime. A factory-backed source yields a
    /// fresh run per call; a single-use source is only read by the first one.
    pub fn make_iter(&self) -> PoolIter<T> {
        self.make_iter_with(CancelToken::new())
    }

    pub fn make_iter_with(&self, token: CancelToken) -> PoolIter<T> {
        let capacity = self.config.effective_size();
        let (ready, ready_waiter) = signal();
        let (drained, _) = signal();
        let shared = Arc::new(Mutex::new(PoolState {
            buffer: Vec::new(),
            done: false,
            failure: None,
            ready,
            drained,
            peak: 0,
            delivered: 0,
        }));

        let upstream = self.source.iter_with(token.child());
        let producer = produce(Arc::clone(&shared), upstream, capacity, token.clone());
        let producer_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            log::debug!("pool producer started with capacity {}", capacity);
            if let Err(panic) = AssertUnwindSafe(producer).catch_unwind().await {
                let err = StreamError::producer(panic_message(panic.as_ref()));
                finish(&producer_shared, Some(err));
            }
        });

        let inner = consume(Arc::clone(&shared), ready_waiter, self.config.error_policy);
        PoolIter {
            inner: StreamIter::new(inner, token),
            shared,
            capacity,
        }
    }

    /// Wrap the pool as a stream; each consumption starts its own producer.
    pub fn into_stream(self) -> AsyncStream<T> {
        AsyncStream::from_factory_with_cancel(move |token| {
            Source::Pull(self.make_iter_with(token.child()).boxed())
        })
    }
}

impl<T> From<IteratorPool<T>> for AsyncStream<T>
where
    T: Send + 'static,
{
    fn from(pool: IteratorPool<T>) -> Self {
        pool.into_stream()
    }
}

impl<T> fmt::Debug for IteratorPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IteratorPool")
            .field("config", &self.config)
            .field("source", &self.source)
            .finish()
    }
}

/// Mark the producer as finished, handing `failure` to the consumer.
fn finish<T>(shared: &Shared<T>, failure: Option<StreamError>) {
    let mut state = lock(shared);
    if state.done {
        return;
    }
    state.done = true;
    match failure {
        Some(err) => {
            if let Err(err) = state.ready.reject(err) {
                state.failure = Some(err);
            }
        }
        None => {
            state.ready.resolve(());
        }
    }
}

async fn produce<T>(shared: Shared<T>, mut upstream: StreamIter<T>, capacity: usize, token: CancelToken)
where
    T: Send + 'static,
{
    loop {
        let next = tokio::select! {
            next = upstream.next() => next,
            _ = token.cancelled() => {
                log::debug!("pool producer cancelled by consumer");
                return;
            }
        };
        let value = match next {
            Some(Ok(value)) => value,
            Some(Err(e)) => {
                finish(&shared, Some(e));
                return;
            }
            None => {
                log::debug!("pool producer exhausted its source");
                finish(&shared, None);
                return;
            }
        };

        let drained = {
            let mut state = lock(&shared);
            if state.buffer.len() >= capacity {
                Some(state.drained.renew())
            } else {
                None
            }
        };
        if let Some(drained) = drained {
            tokio::select! {
                resumed = drained => {
                    if resumed.is_err() {
                        return;
                    }
                }
                _ = token.cancelled() => {
                    log::debug!("pool producer cancelled while waiting for drain");
                    return;
                }
            }
        }

        {
            let mut state = lock(&shared);
            state.buffer.push(value);
            state.peak = state.peak.max(state.buffer.len());
            state.ready.resolve(());
        }
    }
}

/// Consumer loop: wait for data-ready, swap the buffer out, release the
/// producer, yield the batch.
fn consume<T>(shared: Shared<T>, ready: SignalWaiter<()>, policy: ProducerErrorPolicy) -> PullStream<T>
where
    T: Send + 'static,
{
    stream! {
        let mut ready = ready;
        loop {
            let woke = ready.await;
            let (batch, done, failure) = {
                let mut state = lock(&shared);
                let batch = std::mem::take(&mut state.buffer);
                state.delivered += batch.len();
                let failure = match woke {
                    Ok(()) => state.failure.take(),
                    Err(e) => Some(e),
                };
                ready = state.ready.renew();
                state.drained.resolve(());
                (batch, state.done, failure)
            };
            for item in batch {
                yield Ok(item);
            }
            if let Some(e) = failure {
                match policy {
                    ProducerErrorPolicy::FailFast => yield Err(e),
                    ProducerErrorPolicy::LogAndContinue => {
                        log::error!("pool producer failed, ending sequence: {}", e);
                    }
                }
                break;
            }
            if done {
                break;
            }
        }
    }
    .boxed()
}

/// Consumer side of a running pool
pub struct PoolIter<T> {
    inner: StreamIter<T>,
    shared: Shared<T>,
    capacity: usize,
}

impl<T> PoolIter<T> {
    pub async fn next(&mut self) -> Option<StreamResult<T>> {
        self.inner.next().await
    }

    /// Stop consuming; the producer is cancelled at its next suspension point.
    pub fn close(&mut self) {
        self.inner.close();
    }

    pub fn stats(&self) -> PoolStats {
        let state = lock(&self.shared);
        PoolStats {
            buffered: state.buffer.len(),
            capacity: self.capacity,
            peak: state.peak,
            delivered: state.delivered,
            done: state.done,
        }
    }
}

impl<T> Stream for PoolIter<T> {
    type Item = StreamResult<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl<T> fmt::Debug for PoolIter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolIter")
            .field("stats", &self.stats())
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}

/// Pool occupancy snapshot for monitoring and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Items appended by the producer and not yet handed to the consumer
    pub buffered: usize,
    pub capacity: usize,
    /// Highest `buffered` value observed so far
    pub peak: usize,
    /// Items handed to the consumer
    pub delivered: usize,
    /// Whether the producer has finished
    pub done: bool,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pool({}/{}, peak {}, delivered {}{})",
            self.buffered,
            self.capacity,
            self.peak,
            self.delivered,
            if self.done { ", done" } else { "" }
        )
    }
}
