//! rs2-flow - lazy async sequences with bounded concurrency
//!
//! An [`AsyncStream`] unifies materialized vectors, deferred vectors, pull
//! streams and re-invokable factories behind one pull interface. On top of it
//! sit three coordination primitives:
//!
//! - [`AsyncStream::parallel_map`] / [`AsyncStream::parallel_flat_map`] overlap
//!   at most `N` transforms while preserving input order.
//! - [`EventIterator`] bridges a push-style callback into a pull sequence.
//! - [`IteratorPool`] lets a producer run ahead of its consumer by a bounded
//!   number of items.
//!
//! ```
//! use rs2_flow::AsyncStream;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let out = AsyncStream::from_iter(vec![1, 2, 3, 4, 5])
//!     .parallel_map(2, |v| async move { v + 1 })
//!     .await
//!     .unwrap();
//! assert_eq!(out, vec![2, 3, 4, 5, 6]);
//! # }
//! ```

pub mod cancel;
pub mod config;
pub mod error;
pub mod event_iterator;
pub mod iterator_pool;
pub mod parallel;
pub mod signal;
pub mod source;
pub mod stream;
pub mod stream_ext;

pub use cancel::CancelToken;
pub use config::{ParallelConfig, PoolConfig, ProducerConfig, ProducerErrorPolicy};
pub use error::{StreamError, StreamResult};
pub use event_iterator::{event_stream, event_stream_with_config, EventEmitter, EventIterator};
pub use iterator_pool::{IteratorPool, PoolIter, PoolStats};
pub use signal::{signal, Signal, SignalWaiter};
pub use source::{PullStream, Source, SourceFactory};
pub use stream::{collect_all, AsyncStream, StreamIter};
pub use stream_ext::{AsyncStreamExt, TryAsyncStreamExt};
