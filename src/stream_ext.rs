use futures_core::Stream;

use crate::error::StreamResult;
use crate::iterator_pool::IteratorPool;
use crate::stream::AsyncStream;

/// Extension trait lifting any `futures` stream into rs2-flow types
pub trait AsyncStreamExt: Stream + Sized + Send + 'static {
    /// Wrap an infallible stream as a single-use [`AsyncStream`]
    fn into_async_stream(self) -> AsyncStream<Self::Item>
    where
        Self::Item: Send + 'static,
    {
        AsyncStream::from_stream(self)
    }

    /// Let this stream run ahead of its consumer by at most `size` items
    fn pooled(self, size: usize) -> IteratorPool<Self::Item>
    where
        Self::Item: Send + 'static,
    {
        IteratorPool::new(size, self.into_async_stream())
    }
}

impl<S> AsyncStreamExt for S where S: Stream + Sized + Send + 'static {}

/// Extension trait for streams that already carry [`StreamResult`] items
pub trait TryAsyncStreamExt<T: Send + 'static>:
    Stream<Item = StreamResult<T>> + Sized + Send + 'static
{
    /// Wrap as a single-use [`AsyncStream`]; the first `Err` ends it
    fn try_into_async_stream(self) -> AsyncStream<T> {
        AsyncStream::from_try_stream(self)
    }
}

impl<T, S> TryAsyncStreamExt<T> for S
where
    T: Send + 'static,
    S: Stream<Item = StreamResult<T>> + Sized + Send + 'static,
{
}
