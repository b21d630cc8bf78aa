//! Inbound request handlers
//!
//! A channel holds exactly one handler, in one of four shapes: sync or
//! async, with or without reply bytes. All four reduce to "produce optional
//! reply bytes or fail"; the receive worker frames the outcome as a
//! response or error packet. Handler failures never kill the worker.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::warn;

/// Failure type handlers may return
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of a handler invocation
pub type HandlerResult<T> = std::result::Result<T, HandlerError>;

/// Future type returned by the async handler shapes
pub type BoxedHandlerFuture<T> = Pin<Box<dyn Future<Output = HandlerResult<T>> + Send>>;

type SyncVoidFn = dyn Fn(u64, &[u8]) -> HandlerResult<()> + Send + Sync;
type SyncBytesFn = dyn Fn(u64, &[u8]) -> HandlerResult<Vec<u8>> + Send + Sync;
type AsyncVoidFn = dyn Fn(u64, Vec<u8>) -> BoxedHandlerFuture<()> + Send + Sync;
type AsyncBytesFn = dyn Fn(u64, Vec<u8>) -> BoxedHandlerFuture<Vec<u8>> + Send + Sync;

/// The four handler shapes a channel can carry
#[derive(Clone)]
pub enum RpcHandler {
    SyncVoid(Arc<SyncVoidFn>),
    SyncBytes(Arc<SyncBytesFn>),
    AsyncVoid(Arc<AsyncVoidFn>),
    AsyncBytes(Arc<AsyncBytesFn>),
}

impl RpcHandler {
    /// Synchronous handler that produces no reply payload
    pub fn sync_void<F>(f: F) -> Self
    where
        F: Fn(u64, &[u8]) -> HandlerResult<()> + Send + Sync + 'static,
    {
        RpcHandler::SyncVoid(Arc::new(f))
    }

    /// Synchronous handler whose return value becomes the reply payload
    pub fn sync_bytes<F>(f: F) -> Self
    where
        F: Fn(u64, &[u8]) -> HandlerResult<Vec<u8>> + Send + Sync + 'static,
    {
        RpcHandler::SyncBytes(Arc::new(f))
    }

    /// Asynchronous handler that produces no reply payload
    pub fn async_void<F>(f: F) -> Self
    where
        F: Fn(u64, Vec<u8>) -> BoxedHandlerFuture<()> + Send + Sync + 'static,
    {
        RpcHandler::AsyncVoid(Arc::new(f))
    }

    /// Asynchronous handler whose output becomes the reply payload
    pub fn async_bytes<F>(f: F) -> Self
    where
        F: Fn(u64, Vec<u8>) -> BoxedHandlerFuture<Vec<u8>> + Send + Sync + 'static,
    {
        RpcHandler::AsyncBytes(Arc::new(f))
    }

    /// Invoke the handler for a fully assembled request
    ///
    /// Async shapes are driven to completion on `runtime`, which pins the
    /// calling worker for the duration; channels whose handlers issue nested
    /// requests must therefore run at least two receive workers. Panics are
    /// converted to failures so a misbehaving handler costs one error reply,
    /// not a worker.
    pub(crate) fn invoke(
        &self,
        msg_id: u64,
        payload: Vec<u8>,
        runtime: &Handle,
    ) -> HandlerResult<Vec<u8>> {
        let outcome = catch_unwind(AssertUnwindSafe(|| match self {
            RpcHandler::SyncVoid(f) => f(msg_id, &payload).map(|()| Vec::new()),
            RpcHandler::SyncBytes(f) => f(msg_id, &payload),
            RpcHandler::AsyncVoid(f) => {
                runtime.block_on(f(msg_id, payload)).map(|()| Vec::new())
            }
            RpcHandler::AsyncBytes(f) => runtime.block_on(f(msg_id, payload)),
        }));
        match outcome {
            Ok(result) => result,
            Err(panic) => {
                let what = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string());
                warn!(msg_id, panic = %what, "request handler panicked");
                Err(what.into())
            }
        }
    }
}

impl std::fmt::Debug for RpcHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shape = match self {
            RpcHandler::SyncVoid(_) => "SyncVoid",
            RpcHandler::SyncBytes(_) => "SyncBytes",
            RpcHandler::AsyncVoid(_) => "AsyncVoid",
            RpcHandler::AsyncBytes(_) => "AsyncBytes",
        };
        f.debug_tuple("RpcHandler").field(&shape).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn test_sync_shapes() {
        let rt = test_runtime();

        let void = RpcHandler::sync_void(|_, _| Ok(()));
        assert_eq!(void.invoke(1, vec![1, 2], rt.handle()).unwrap(), Vec::<u8>::new());

        let echo = RpcHandler::sync_bytes(|_, payload| Ok(payload.to_vec()));
        assert_eq!(echo.invoke(2, vec![9, 8], rt.handle()).unwrap(), vec![9, 8]);
    }

    #[test]
    fn test_async_shapes() {
        let rt = test_runtime();

        let double = RpcHandler::async_bytes(|_, payload| {
            Box::pin(async move { Ok(payload.iter().map(|b| b * 2).collect()) })
        });
        assert_eq!(
            double.invoke(3, vec![1, 2, 3], rt.handle()).unwrap(),
            vec![2, 4, 6]
        );

        let void = RpcHandler::async_void(|_, _| Box::pin(async { Ok(()) }));
        assert!(void.invoke(4, Vec::new(), rt.handle()).unwrap().is_empty());
    }

    #[test]
    fn test_failures_and_panics_are_contained() {
        let rt = test_runtime();

        let failing = RpcHandler::sync_bytes(|_, _| Err("nope".into()));
        assert!(failing.invoke(5, Vec::new(), rt.handle()).is_err());

        let panicking = RpcHandler::sync_void(|_, _| panic!("boom"));
        let err = panicking.invoke(6, Vec::new(), rt.handle()).unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
