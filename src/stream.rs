//! AsyncStream - a lazy, chainable sequence over a [`Source`]
//!
//! Constructing a stream does no work. Items are only pulled when a consumer
//! asks for them, through a [`StreamIter`] handle obtained from
//! [`AsyncStream::iter`]. Operators (`map`, `filter`, `flat_map`, the parallel
//! variants in [`crate::parallel`]) return new factory-backed streams, so a
//! chain is consumable again exactly when the stream at its root is.

use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_stream::stream;
use futures::future::BoxFuture;
use futures::stream;
use futures_core::Stream;
use futures_util::{FutureExt, StreamExt};

use crate::cancel::CancelToken;
use crate::error::StreamResult;
use crate::source::{PullStream, Source};

/// Lazy sequence over a normalized source
pub struct AsyncStream<T> {
    cell: Arc<Mutex<Option<Source<T>>>>,
}

impl<T> Clone for AsyncStream<T> {
    fn clone(&self) -> Self {
        AsyncStream {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T> fmt::Debug for AsyncStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.cell.lock() {
            Ok(guard) => match guard.as_ref() {
                Some(source) => format!("{:?}", source),
                None => "Consumed".to_string(),
            },
            Err(_) => "Poisoned".to_string(),
        };
        f.debug_struct("AsyncStream").field("source", &state).finish()
    }
}

impl<T> AsyncStream<T>
where
    T: Send + 'static,
{
    pub fn new(source: Source<T>) -> Self {
        AsyncStream {
            cell: Arc::new(Mutex::new(Some(source))),
        }
    }

    /// Build a stream over an already materialized sequence
    pub fn from_iter<I>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
    {
        Self::new(Source::snapshot(items))
    }

    /// Build a stream over a sequence that becomes available later
    pub fn from_future<F>(fut: F) -> Self
    where
        F: Future<Output = StreamResult<Vec<T>>> + Send + 'static,
    {
        Self::new(Source::deferred(fut))
    }

    pub fn from_stream<S>(s: S) -> Self
    where
        S: Stream<Item = T> + Send + 'static,
    {
        Self::new(Source::from_stream(s))
    }

    pub fn from_try_stream<S>(s: S) -> Self
    where
        S: Stream<Item = StreamResult<T>> + Send + 'static,
    {
        Self::new(Source::pull(s))
    }

    /// Build a multi-consumable stream: `f` runs once per consumption.
    pub fn from_factory<F>(f: F) -> Self
    where
        F: Fn() -> Source<T> + Send + Sync + 'static,
    {
        Self::new(Source::factory(f))
    }

    /// Like [`from_factory`](Self::from_factory), but `f` receives the
    /// cancellation token of the consumer it builds a source for.
    pub fn from_factory_with_cancel<F>(f: F) -> Self
    where
        F: Fn(CancelToken) -> Source<T> + Send + Sync + 'static,
    {
        Self::new(Source::factory_with_cancel(f))
    }

    /// Whether consuming this stream leaves it consumable again.
    pub fn is_reusable(&self) -> bool {
        match self.cell.lock() {
            Ok(guard) => guard.as_ref().map_or(false, Source::is_reusable),
            Err(_) => false,
        }
    }

    /// Hand out the source for one consumption. Factories stay in place,
    /// every other variant is moved out.
    pub(crate) fn take_source(&self) -> Option<Source<T>> {
        let mut guard = match self.cell.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match guard.as_ref() {
            Some(Source::Factory(factory)) => Some(Source::Factory(Arc::clone(factory))),
            _ => guard.take(),
        }
    }

    /// Start one consumption of the stream.
    pub fn iter(&self) -> StreamIter<T> {
        self.iter_with(CancelToken::new())
    }

    /// Start one consumption that is also cancelled when `token` is.
    pub fn iter_with(&self, token: CancelToken) -> StreamIter<T> {
        let inner = match self.take_source() {
            Some(source) => source.into_pull(&token),
            None => {
                log::debug!("single-use stream consumed again, yielding nothing");
                stream::empty().boxed()
            }
        };
        StreamIter::new(inner, token)
    }

    /// Drain every item into a vector, preserving emission order.
    pub fn collect(&self) -> impl Future<Output = StreamResult<Vec<T>>> + Send + 'static {
        let source = self.take_source();
        async move {
            let mut iter = match source {
                Some(Source::Snapshot(items)) => return Ok(items),
                Some(source) => {
                    let token = CancelToken::new();
                    StreamIter::new(source.into_pull(&token), token)
                }
                None => return Ok(Vec::new()),
            };
            let mut items = Vec::new();
            while let Some(item) = iter.next().await {
                items.push(item?);
            }
            Ok(items)
        }
    }

    /// Transform each item with an async function, one at a time.
    pub fn map<R, F, Fut>(self, f: F) -> AsyncStream<R>
    where
        R: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        self.try_map(move |value| f(value).map(Ok))
    }

    /// Fallible [`map`](Self::map); the first `Err` ends the stream.
    pub fn try_map<R, F, Fut>(self, f: F) -> AsyncStream<R>
    where
        R: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StreamResult<R>> + Send + 'static,
    {
        let f = Arc::new(f);
        AsyncStream::from_factory_with_cancel(move |token| {
            let mut upstream = self.iter_with(token.child());
            let f = Arc::clone(&f);
            Source::Pull(
                stream! {
                    while let Some(item) = upstream.next().await {
                        match item {
                            Ok(value) => match f(value).await {
                                Ok(out) => yield Ok(out),
                                Err(e) => {
                                    upstream.close();
                                    yield Err(e);
                                    break;
                                }
                            },
                            Err(e) => {
                                yield Err(e);
                                break;
                            }
                        }
                    }
                }
                .boxed(),
            )
        })
    }

    /// Keep the items for which the async predicate holds.
    pub fn filter<F, Fut>(self, predicate: F) -> AsyncStream<T>
    where
        F: Fn(&T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.try_filter(move |value| predicate(value).map(Ok))
    }

    pub fn try_filter<F, Fut>(self, predicate: F) -> AsyncStream<T>
    where
        F: Fn(&T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StreamResult<bool>> + Send + 'static,
    {
        let predicate = Arc::new(predicate);
        AsyncStream::from_factory_with_cancel(move |token| {
            let mut upstream = self.iter_with(token.child());
            let predicate = Arc::clone(&predicate);
            Source::Pull(
                stream! {
                    while let Some(item) = upstream.next().await {
                        match item {
                            Ok(value) => match predicate(&value).await {
                                Ok(true) => yield Ok(value),
                                Ok(false) => {}
                                Err(e) => {
                                    upstream.close();
                                    yield Err(e);
                                    break;
                                }
                            },
                            Err(e) => {
                                yield Err(e);
                                break;
                            }
                        }
                    }
                }
                .boxed(),
            )
        })
    }

    /// Replace each item by a sub-sequence and flatten, strictly in order.
    pub fn flat_map<R, S, F>(self, f: F) -> AsyncStream<R>
    where
        R: Send + 'static,
        S: Into<Source<R>> + Send + 'static,
        F: Fn(T) -> S + Send + Sync + 'static,
    {
        self.try_flat_map(move |value| Ok(f(value)))
    }

    pub fn try_flat_map<R, S, F>(self, f: F) -> AsyncStream<R>
    where
        R: Send + 'static,
        S: Into<Source<R>> + Send + 'static,
        F: Fn(T) -> StreamResult<S> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        AsyncStream::from_factory_with_cancel(move |token| {
            let mut upstream = self.iter_with(token.child());
            let f = Arc::clone(&f);
            Source::Pull(
                stream! {
                    while let Some(item) = upstream.next().await {
                        let value = match item {
                            Ok(value) => value,
                            Err(e) => {
                                yield Err(e);
                                break;
                            }
                        };
                        let source: Source<R> = match f(value) {
                            Ok(source) => source.into(),
                            Err(e) => {
                                upstream.close();
                                yield Err(e);
                                break;
                            }
                        };
                        let inner_token = token.child();
                        let mut inner = StreamIter::new(source.into_pull(&inner_token), inner_token);
                        let mut failed = false;
                        while let Some(sub) = inner.next().await {
                            if sub.is_err() {
                                failed = true;
                                yield sub;
                                break;
                            }
                            yield sub;
                        }
                        if failed {
                            inner.close();
                            upstream.close();
                            break;
                        }
                    }
                }
                .boxed(),
            )
        })
    }

    /// Drain sequentially, awaiting each callback before pulling the next item.
    pub async fn for_each<F, Fut>(self, mut f: F) -> StreamResult<()>
    where
        F: FnMut(T) -> Fut + Send,
        Fut: Future<Output = ()> + Send,
    {
        let mut iter = self.iter();
        while let Some(item) = iter.next().await {
            f(item?).await;
        }
        Ok(())
    }

    pub async fn try_for_each<F, Fut>(self, mut f: F) -> StreamResult<()>
    where
        F: FnMut(T) -> Fut + Send,
        Fut: Future<Output = StreamResult<()>> + Send,
    {
        let mut iter = self.iter();
        while let Some(item) = iter.next().await {
            if let Err(e) = f(item?).await {
                iter.close();
                return Err(e);
            }
        }
        Ok(())
    }
}

impl<T> From<Vec<T>> for AsyncStream<T>
where
    T: Send + 'static,
{
    fn from(items: Vec<T>) -> Self {
        AsyncStream::new(Source::Snapshot(items))
    }
}

impl<T> From<Source<T>> for AsyncStream<T>
where
    T: Send + 'static,
{
    fn from(source: Source<T>) -> Self {
        AsyncStream::new(source)
    }
}

impl<T> From<AsyncStream<T>> for Source<T>
where
    T: Send + 'static,
{
    fn from(stream: AsyncStream<T>) -> Self {
        stream.take_source().unwrap_or(Source::Snapshot(Vec::new()))
    }
}

/// `stream.await` drains the stream, like [`AsyncStream::collect`].
impl<T> IntoFuture for AsyncStream<T>
where
    T: Send + 'static,
{
    type Output = StreamResult<Vec<T>>;
    type IntoFuture = BoxFuture<'static, StreamResult<Vec<T>>>;

    fn into_future(self) -> Self::IntoFuture {
        self.collect().boxed()
    }
}

/// One consumption of an [`AsyncStream`].
///
/// Closing or dropping the handle, or reaching the end of the sequence,
/// cancels its token so producers feeding it can release their resources.
pub struct StreamIter<T> {
    inner: Option<PullStream<T>>,
    token: CancelToken,
}

impl<T> StreamIter<T> {
    pub(crate) fn new(inner: PullStream<T>, token: CancelToken) -> Self {
        StreamIter {
            inner: Some(inner),
            token,
        }
    }

    /// Pull the next item. `None` once the sequence is done, failed or closed.
    pub async fn next(&mut self) -> Option<StreamResult<T>> {
        StreamExt::next(self).await
    }

    /// Stop consuming early and release the underlying source.
    pub fn close(&mut self) {
        if self.inner.take().is_some() {
            log::debug!("stream consumer closed early");
        }
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Drain the remaining items, stopping at the first error.
    pub async fn collect_all(mut self) -> StreamResult<Vec<T>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item?);
        }
        Ok(items)
    }

    fn finish(&mut self) {
        self.inner = None;
        self.token.cancel();
    }
}

impl<T> Stream for StreamIter<T> {
    type Item = StreamResult<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.token.is_cancelled() {
            this.inner = None;
            return Poll::Ready(None);
        }
        let inner = match this.inner.as_mut() {
            Some(inner) => inner,
            None => return Poll::Ready(None),
        };
        match inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(item))) => Poll::Ready(Some(Ok(item))),
            Poll::Ready(Some(Err(e))) => {
                this.finish();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for StreamIter<T> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl<T> fmt::Debug for StreamIter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamIter")
            .field("closed", &self.is_closed())
            .field("token", &self.token)
            .finish()
    }
}

/// Drain any fallible stream into a vector, stopping at the first error.
pub async fn collect_all<T, S>(s: S) -> StreamResult<Vec<T>>
where
    S: Stream<Item = StreamResult<T>>,
{
    futures_util::pin_mut!(s);
    let mut items = Vec::new();
    while let Some(item) = s.next().await {
        items.push(item?);
    }
    Ok(items)
}
