//! Middleware chain around the terminal send handler.
//!
//! Middlewares compose outermost-first in the order the caller adds them;
//! each receives a [`Next`] continuation it may invoke zero or more times
//! (the retry middleware re-runs the rest of the chain).

use crate::{Context, Message, NotifyError, Receipt, Target};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;

pub mod logging;
pub mod metrics;
pub mod rate_limit;
pub mod retry;

pub use logging::LoggingMiddleware;
pub use metrics::MetricsMiddleware;
pub use rate_limit::RateLimitMiddleware;
pub use retry::{PlatformRetryStats, RetryMiddleware, RetryStats};

/// Terminal handler at the end of the chain: routes, dispatches, and
/// produces the receipt.
#[async_trait]
pub trait SendHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &Context,
        message: &Message,
        targets: &[Target],
    ) -> Result<Receipt, NotifyError>;
}

/// One layer of the chain.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(
        &self,
        ctx: &Context,
        message: &Message,
        targets: &[Target],
        next: Next<'_>,
    ) -> Result<Receipt, NotifyError>;
}

/// Continuation for the remainder of the chain. Copyable so a middleware
/// can invoke it more than once.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    middlewares: &'a [Arc<dyn Middleware>],
    terminal: &'a dyn SendHandler,
}

impl<'a> Next<'a> {
    pub fn run(
        self,
        ctx: &'a Context,
        message: &'a Message,
        targets: &'a [Target],
    ) -> BoxFuture<'a, Result<Receipt, NotifyError>> {
        Box::pin(async move {
            match self.middlewares.split_first() {
                Some((first, rest)) => {
                    let next = Next { middlewares: rest, terminal: self.terminal };
                    first.handle(ctx, message, targets, next).await
                }
                None => self.terminal.handle(ctx, message, targets).await,
            }
        })
    }
}

/// Ordered middleware composition.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn push(&mut self, middleware: Arc<dyn Middleware>) {
        self.middlewares.push(middleware);
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Run the chain down to `terminal`, outermost middleware first.
    pub async fn execute(
        &self,
        ctx: &Context,
        message: &Message,
        targets: &[Target],
        terminal: &dyn SendHandler,
    ) -> Result<Receipt, NotifyError> {
        Next { middlewares: &self.middlewares, terminal }.run(ctx, message, targets).await
    }
}
