//! Job handler port.
//!
//! A handler receives a claimed job and returns success or a
//! [`HandlerError`]; retry scheduling is the queue's job.

use std::future::Future;

use futures_util::future::BoxFuture;
use reportflow_types::error::HandlerError;
use reportflow_types::job::Job;

pub trait JobHandler: Send + Sync {
    fn handle(&self, job: Job) -> impl Future<Output = Result<(), HandlerError>> + Send;
}

/// Object-safe version of [`JobHandler`].
pub trait JobHandlerDyn: Send + Sync {
    fn handle_boxed(&self, job: Job) -> BoxFuture<'_, Result<(), HandlerError>>;
}

impl<T: JobHandler> JobHandlerDyn for T {
    fn handle_boxed(&self, job: Job) -> BoxFuture<'_, Result<(), HandlerError>> {
        Box::pin(self.handle(job))
    }
}

/// Type-erased handler, so one queue can hold heterogeneous workers.
pub struct BoxJobHandler {
    inner: Box<dyn JobHandlerDyn>,
}

impl BoxJobHandler {
    pub fn new<T: JobHandler + 'static>(handler: T) -> Self {
        Self {
            inner: Box::new(handler),
        }
    }

    pub async fn handle(&self, job: Job) -> Result<(), HandlerError> {
        self.inner.handle_boxed(job).await
    }
}

/// Adapts an async closure into a [`JobHandler`].
pub struct FnHandler<F>(pub F);

impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    fn handle(&self, job: Job) -> impl Future<Output = Result<(), HandlerError>> + Send {
        (self.0)(job)
    }
}
