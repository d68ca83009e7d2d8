//! Request logging around the send chain.

use super::{Middleware, Next};
use crate::{Context, Message, NotifyError, Receipt, ReceiptStatus, Target};
use async_trait::async_trait;
use std::time::Instant;

/// Logs start/end, duration, and outcome of every send.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn handle(
        &self,
        ctx: &Context,
        message: &Message,
        targets: &[Target],
        next: Next<'_>,
    ) -> Result<Receipt, NotifyError> {
        let started = Instant::now();
        tracing::info!(
            message_id = %message.id,
            targets = targets.len(),
            format = ?message.format,
            priority = ?message.priority,
            "send started"
        );

        let result = next.run(ctx, message, targets).await;
        let elapsed = started.elapsed();

        match &result {
            Ok(receipt) => {
                if receipt.status == ReceiptStatus::PartialFailed {
                    tracing::warn!(
                        message_id = %message.id,
                        successful = receipt.successful,
                        failed = receipt.failed,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "send partially failed"
                    );
                } else {
                    tracing::info!(
                        message_id = %message.id,
                        status = %receipt.status,
                        successful = receipt.successful,
                        failed = receipt.failed,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "send finished"
                    );
                }
                for result in &receipt.results {
                    tracing::debug!(
                        message_id = %message.id,
                        platform = %result.platform,
                        target = %result.target,
                        success = result.success,
                        error = %result.error,
                        "target outcome"
                    );
                }
            }
            Err(err) => {
                tracing::error!(
                    message_id = %message.id,
                    %err,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "send failed"
                );
            }
        }
        result
    }
}
