//! Bounded parallel executor
//!
//! `parallel_map` and `parallel_flat_map` keep a FIFO window of at most `N`
//! spawned transform invocations. The next upstream item is pulled first; if
//! the window is already full the oldest entry is dequeued (and yielded)
//! before the new transform starts, so at most `N` transforms ever overlap.
//! Results always leave the window oldest-first, which makes the output order
//! equal the input order whatever order the transforms settle in.
//!
//! The transform is invoked inside the spawned task, so a panic anywhere in
//! it surfaces as a [`StreamError::Transform`] item.
//!
//! When the stream terminates on an error every outstanding entry is awaited
//! without being yielded or re-raised, then the triggering error is yielded.
//! When the consumer abandons the stream, outstanding entries are aborted.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use async_stream::stream;
use futures_util::{FutureExt, StreamExt};
use tokio::task::JoinHandle;

use crate::cancel::CancelToken;
use crate::config::ParallelConfig;
use crate::error::{StreamError, StreamResult};
use crate::source::{PullStream, Source};
use crate::stream::{AsyncStream, StreamIter};

/// Ordered queue of in-flight transform tasks
struct Window<O> {
    slots: VecDeque<JoinHandle<StreamResult<O>>>,
    capacity: usize,
}

impl<O> Window<O>
where
    O: Send + 'static,
{
    fn new(capacity: usize) -> Self {
        Self {
            slots: VecDeque::new(),
            capacity,
        }
    }

    fn is_full(&self) -> bool {
        self.slots.len() >= self.capacity
    }

    fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn start<Fut>(&mut self, fut: Fut)
    where
        Fut: Future<Output = StreamResult<O>> + Send + 'static,
    {
        debug_assert!(!self.is_full());
        self.slots.push_back(tokio::spawn(fut));
    }

    /// Await the oldest entry. The handle stays in the window while it is
    /// awaited so an abandoned consumer still aborts it.
    async fn pop_oldest(&mut self) -> Option<StreamResult<O>> {
        let handle = self.slots.front_mut()?;
        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(join) => Err(StreamError::from_transform_join(join)),
        };
        self.slots.pop_front();
        Some(outcome)
    }

    /// Observe every outstanding entry, discarding results and failures.
    async fn sweep(&mut self) {
        if self.slots.is_empty() {
            return;
        }
        log::debug!("sweeping {} outstanding window entries", self.slots.len());
        while let Some(handle) = self.slots.front_mut() {
            let _ = handle.await;
            self.slots.pop_front();
        }
    }
}

impl<O> Drop for Window<O> {
    fn drop(&mut self) {
        for handle in self.slots.drain(..) {
            handle.abort();
        }
    }
}

/// Pull from upstream while keeping up to `capacity` transforms running.
/// Entries are dequeued in one place only, when the window is full or the
/// upstream is exhausted.
fn window_map<T, O, F, Fut>(
    mut upstream: StreamIter<T>,
    capacity: usize,
    f: Arc<F>,
) -> PullStream<O>
where
    T: Send + 'static,
    O: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StreamResult<O>> + Send + 'static,
{
    stream! {
        let mut window = Window::new(capacity);
        let mut exhausted = false;
        loop {
            let mut pending = None;
            if !exhausted {
                match upstream.next().await {
                    Some(Ok(value)) => pending = Some(value),
                    Some(Err(e)) => {
                        window.sweep().await;
                        yield Err(e);
                        return;
                    }
                    None => exhausted = true,
                }
            }
            if exhausted || window.is_full() {
                match window.pop_oldest().await {
                    Some(Ok(out)) => yield Ok(out),
                    Some(Err(e)) => {
                        upstream.close();
                        window.sweep().await;
                        yield Err(e);
                        return;
                    }
                    None => break,
                }
            }
            if let Some(value) = pending {
                let f = Arc::clone(&f);
                window.start(async move { f(value).await });
            }
        }
    }
    .boxed()
}

/// Same windowing as [`window_map`], but each entry produces a sub-sequence
/// that is drained in full when it is dequeued.
fn window_flat_map<T, R, F, Fut>(
    mut upstream: StreamIter<T>,
    capacity: usize,
    token: CancelToken,
    f: Arc<F>,
) -> PullStream<R>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StreamResult<Source<R>>> + Send + 'static,
{
    stream! {
        let mut window: Window<Source<R>> = Window::new(capacity);
        let mut exhausted = false;
        loop {
            let mut pending = None;
            if !exhausted {
                match upstream.next().await {
                    Some(Ok(value)) => pending = Some(value),
                    Some(Err(e)) => {
                        window.sweep().await;
                        yield Err(e);
                        return;
                    }
                    None => exhausted = true,
                }
            }
            if exhausted || window.is_full() {
                let failure = match window.pop_oldest().await {
                    Some(Ok(source)) => {
                        let inner_token = token.child();
                        let mut inner = StreamIter::new(source.into_pull(&inner_token), inner_token);
                        let mut failure = None;
                        while let Some(item) = inner.next().await {
                            match item {
                                Ok(value) => yield Ok(value),
                                Err(e) => {
                                    failure = Some(e);
                                    break;
                                }
                            }
                        }
                        failure
                    }
                    Some(Err(e)) => Some(e),
                    None => break,
                };
                if let Some(e) = failure {
                    upstream.close();
                    window.sweep().await;
                    yield Err(e);
                    return;
                }
            }
            if let Some(value) = pending {
                let f = Arc::clone(&f);
                window.start(async move { f(value).await });
            }
        }
        debug_assert!(window.is_empty());
    }
    .boxed()
}

impl<T> AsyncStream<T>
where
    T: Send + 'static,
{
    /// Transform items with at most `concurrency` overlapping invocations,
    /// yielding results in input order.
    pub fn parallel_map<R, F, Fut>(self, concurrency: usize, f: F) -> AsyncStream<R>
    where
        R: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        self.try_parallel_map(concurrency, move |value| f(value).map(Ok))
    }

    /// [`parallel_map`](Self::parallel_map) with one worker per CPU.
    pub fn parallel_map_auto<R, F, Fut>(self, f: F) -> AsyncStream<R>
    where
        R: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        self.try_parallel_map_with(ParallelConfig::default(), move |value| f(value).map(Ok))
    }

    pub fn try_parallel_map<R, F, Fut>(self, concurrency: usize, f: F) -> AsyncStream<R>
    where
        R: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StreamResult<R>> + Send + 'static,
    {
        self.try_parallel_map_with(ParallelConfig::new().concurrency(concurrency), f)
    }

    pub fn try_parallel_map_with<R, F, Fut>(self, config: ParallelConfig, f: F) -> AsyncStream<R>
    where
        R: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StreamResult<R>> + Send + 'static,
    {
        let capacity = config.effective_concurrency();
        let f = Arc::new(f);
        AsyncStream::from_factory_with_cancel(move |token| {
            let upstream = self.iter_with(token.child());
            Source::Pull(window_map(upstream, capacity, Arc::clone(&f)))
        })
    }

    /// Produce sub-sequences with at most `concurrency` overlapping
    /// invocations; flattening stays strictly sequential, in input order.
    pub fn parallel_flat_map<R, S, F, Fut>(self, concurrency: usize, f: F) -> AsyncStream<R>
    where
        R: Send + 'static,
        S: Into<Source<R>> + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = S> + Send + 'static,
    {
        self.try_parallel_flat_map(concurrency, move |value| f(value).map(Ok))
    }

    pub fn try_parallel_flat_map<R, S, F, Fut>(self, concurrency: usize, f: F) -> AsyncStream<R>
    where
        R: Send + 'static,
        S: Into<Source<R>> + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StreamResult<S>> + Send + 'static,
    {
        let capacity = ParallelConfig::new()
            .concurrency(concurrency)
            .effective_concurrency();
        let f = Arc::new(move |value: T| {
            f(value).map(|res: StreamResult<S>| -> StreamResult<Source<R>> { res.map(Into::into) })
        });
        AsyncStream::from_factory_with_cancel(move |token| {
            let upstream = self.iter_with(token.child());
            Source::Pull(window_flat_map(upstream, capacity, token, Arc::clone(&f)))
        })
    }

    /// Run `callback` over every item with at most `concurrency` overlapping
    /// invocations, stopping at the first failure.
    pub async fn parallel_each<F, Fut>(self, concurrency: usize, callback: F) -> StreamResult<()>
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut iter = self.parallel_map(concurrency, callback).iter();
        while let Some(item) = iter.next().await {
            item?;
        }
        Ok(())
    }
}
