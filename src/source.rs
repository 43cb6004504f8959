//! Source normalization
//!
//! [`Source`] is the tagged union of every producer shape a stream can be
//! built from. The variant is chosen once, at construction, and decides
//! whether the stream can be consumed more than once: only a
//! [`Source::Factory`] re-derives a fresh source per consumption, every other
//! variant is handed out to the first consumer and is gone afterwards.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_stream::stream;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use futures_core::Stream;
use futures_util::{FutureExt, StreamExt};

use crate::cancel::CancelToken;
use crate::error::StreamResult;

/// A boxed pull sequence; `None` means done and an `Err` item is terminal
pub type PullStream<T> = BoxStream<'static, StreamResult<T>>;

/// Re-invokable source constructor. It receives the cancellation token of the
/// consumption it is deriving a source for.
pub type SourceFactory<T> = Arc<dyn Fn(CancelToken) -> Source<T> + Send + Sync + 'static>;

pub enum Source<T> {
    /// An already materialized, ordered sequence
    Snapshot(Vec<T>),
    /// A pending computation yielding any other source
    Deferred(BoxFuture<'static, StreamResult<Source<T>>>),
    /// A resumable pull sequence, single-use
    Pull(PullStream<T>),
    /// A zero-argument constructor re-run on every consumption
    Factory(SourceFactory<T>),
}

impl<T> Source<T>
where
    T: Send + 'static,
{
    pub fn snapshot<I>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
    {
        Source::Snapshot(items.into_iter().collect())
    }

    /// A future resolving to a materialized sequence.
    pub fn deferred<F>(fut: F) -> Self
    where
        F: Future<Output = StreamResult<Vec<T>>> + Send + 'static,
    {
        Source::Deferred(fut.map(|res| res.map(Source::Snapshot)).boxed())
    }

    /// A future resolving to any other source.
    pub fn deferred_source<F>(fut: F) -> Self
    where
        F: Future<Output = StreamResult<Source<T>>> + Send + 'static,
    {
        Source::Deferred(fut.boxed())
    }

    /// A fallible pull sequence.
    pub fn pull<S>(s: S) -> Self
    where
        S: Stream<Item = StreamResult<T>> + Send + 'static,
    {
        Source::Pull(terminate_on_error(s.boxed()))
    }

    /// An infallible pull sequence.
    pub fn from_stream<S>(s: S) -> Self
    where
        S: Stream<Item = T> + Send + 'static,
    {
        Source::Pull(s.map(Ok).boxed())
    }

    pub fn factory<F>(f: F) -> Self
    where
        F: Fn() -> Source<T> + Send + Sync + 'static,
    {
        Source::Factory(Arc::new(move |_token: CancelToken| f()))
    }

    /// A factory that gets to observe the consumer's cancellation token.
    pub fn factory_with_cancel<F>(f: F) -> Self
    where
        F: Fn(CancelToken) -> Source<T> + Send + Sync + 'static,
    {
        Source::Factory(Arc::new(f))
    }

    /// Whether the source survives being consumed.
    pub fn is_reusable(&self) -> bool {
        matches!(self, Source::Factory(_))
    }

    /// Normalize into a single pull interface.
    pub fn into_pull(self, token: &CancelToken) -> PullStream<T> {
        match self {
            Source::Snapshot(items) => stream::iter(items.into_iter().map(Ok)).boxed(),
            Source::Pull(s) => s,
            Source::Factory(factory) => factory(token.clone()).into_pull(token),
            Source::Deferred(fut) => {
                let token = token.clone();
                stream! {
                    match fut.await {
                        Ok(source) => {
                            let mut inner = source.into_pull(&token);
                            while let Some(item) = inner.next().await {
                                yield item;
                            }
                        }
                        Err(e) => yield Err(e),
                    }
                }
                .boxed()
            }
        }
    }
}

impl<T> From<Vec<T>> for Source<T> {
    fn from(items: Vec<T>) -> Self {
        Source::Snapshot(items)
    }
}

impl<T> fmt::Debug for Source<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Snapshot(items) => f.debug_tuple("Snapshot").field(&items.len()).finish(),
            Source::Deferred(_) => f.write_str("Deferred"),
            Source::Pull(_) => f.write_str("Pull"),
            Source::Factory(_) => f.write_str("Factory"),
        }
    }
}

/// End a pull sequence right after its first error.
pub(crate) fn terminate_on_error<T>(s: PullStream<T>) -> PullStream<T>
where
    T: Send + 'static,
{
    stream! {
        let mut s = s;
        while let Some(item) = s.next().await {
            let failed = item.is_err();
            yield item;
            if failed {
                break;
            }
        }
    }
    .boxed()
}
