//! Type aliases for boxed futures and streams.
//!
//! Everything downstream of the engine is built out of async streams, and
//! writing the full `Pin<Box<dyn ...>>` types at every seam gets old fast.

use std::pin::Pin;

use futures::{Future, Stream};

/// A boxed future, caller-agnostic about the concrete type.
pub type BoxedFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// A boxed stream, caller-agnostic about the concrete type.
pub type BoxedStream<T> = Pin<Box<dyn Stream<Item = T> + Send + 'static>>;
