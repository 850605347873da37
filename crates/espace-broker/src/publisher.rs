//! AMQP publisher with per-message confirmation.

use std::time::Duration;

use lapin::options::{BasicPublishOptions, ConfirmSelectOptions};
use lapin::publisher_confirm::Confirmation;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long to wait for the broker to confirm one message before the
/// connection is torn down and rebuilt.
const CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Initial retry backoff.
const BACKOFF_START: Duration = Duration::from_secs(1);

/// Retry backoff cap.
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Connection settings for the publisher.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub url: String,
    pub exchange: String,
}

/// Errors surfaced by [`Publisher::publish`]. Transient broker faults are
/// retried internally and never escape.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The broker nacked the message. Not retried.
    #[error("message rejected by broker")]
    BrokerRejected,

    /// The caller's cancellation token fired before the message was
    /// confirmed.
    #[error("publish cancelled")]
    Cancelled,
}

enum AttemptError {
    Rejected,
    Transient(String),
}

/// Publisher with a lazily established connection and publisher confirms.
///
/// Safe to share between tasks: the broker round-trip is serialized behind a
/// mutex so there is never more than one outstanding message, and each
/// message's confirmation is awaited before the mutex is released. A
/// confirmation that does not arrive within [`CONFIRMATION_TIMEOUT`] forces
/// the connection closed so the next attempt rebuilds channel state instead
/// of inheriting a stale confirm queue.
pub struct Publisher {
    config: PublisherConfig,
    connection: Mutex<Option<(Connection, Channel)>>,
}

impl Publisher {
    pub fn new(config: PublisherConfig) -> Self {
        Self {
            config,
            connection: Mutex::new(None),
        }
    }

    /// Publish one message and wait for the broker to confirm it.
    ///
    /// Transient faults are retried with a capped exponential backoff until
    /// `token` is cancelled. A broker nack is surfaced as
    /// [`PublishError::BrokerRejected`] without retrying.
    pub async fn publish(
        &self,
        token: &CancellationToken,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), PublishError> {
        let mut backoff = BACKOFF_START;
        loop {
            if token.is_cancelled() {
                return Err(PublishError::Cancelled);
            }
            match self.try_publish(routing_key, body).await {
                Ok(()) => return Ok(()),
                Err(AttemptError::Rejected) => return Err(PublishError::BrokerRejected),
                Err(AttemptError::Transient(reason)) => {
                    warn!(%routing_key, %reason, "could not publish message, will retry");
                    tokio::select! {
                        _ = token.cancelled() => return Err(PublishError::Cancelled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = next_backoff(backoff);
                }
            }
        }
    }

    /// Close the connection. Any retrying publisher will reconnect on its
    /// next attempt; cancel its token to stop it for good.
    pub async fn close(&self) {
        let mut guard = self.connection.lock().await;
        if let Some((connection, _)) = guard.take() {
            let _ = connection.close(0, "shutting down").await;
        }
    }

    async fn try_publish(&self, routing_key: &str, body: &[u8]) -> Result<(), AttemptError> {
        // Held for the whole round trip: publish plus confirmation. This is
        // what keeps the channel to at most one in-flight message.
        let mut guard = self.connection.lock().await;
        self.ensure_connection(&mut guard).await?;
        let Some((_, channel)) = guard.as_ref() else {
            return Err(AttemptError::Transient("connection unavailable".to_string()));
        };

        let confirm = channel
            .basic_publish(
                &self.config.exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default(),
            )
            .await
            .map_err(|e| AttemptError::Transient(e.to_string()))?;

        match tokio::time::timeout(CONFIRMATION_TIMEOUT, confirm).await {
            Err(_) => {
                info!("forcibly closing broker connection, confirmation timed out");
                if let Some((connection, _)) = guard.take() {
                    let _ = connection.close(0, "confirmation timeout").await;
                }
                Err(AttemptError::Transient(
                    "timed out waiting for publisher confirmation".to_string(),
                ))
            }
            Ok(Err(e)) => Err(AttemptError::Transient(e.to_string())),
            Ok(Ok(Confirmation::Nack(_))) => Err(AttemptError::Rejected),
            Ok(Ok(_)) => Ok(()),
        }
    }

    /// Rebuild the connection and channel if absent or no longer connected,
    /// with publisher confirms enabled on the fresh channel.
    async fn ensure_connection(
        &self,
        guard: &mut Option<(Connection, Channel)>,
    ) -> Result<(), AttemptError> {
        let rebuild = match guard {
            Some((connection, _)) => !connection.status().connected(),
            None => true,
        };
        if !rebuild {
            return Ok(());
        }
        if let Some((connection, _)) = guard.take() {
            let _ = connection.close(0, "reconnecting").await;
        }

        info!(exchange = %self.config.exchange, "opening broker connection");
        let connection = Connection::connect(&self.config.url, ConnectionProperties::default())
            .await
            .map_err(|e| AttemptError::Transient(format!("broker connection failed: {e}")))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| AttemptError::Transient(format!("channel creation failed: {e}")))?;
        if let Err(e) = channel.confirm_select(ConfirmSelectOptions::default()).await {
            // Without confirms the publisher contract cannot hold.
            let _ = connection.close(0, "confirms unavailable").await;
            return Err(AttemptError::Transient(format!(
                "enabling publisher confirms failed: {e}"
            )));
        }
        *guard = Some((connection, channel));
        Ok(())
    }
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(BACKOFF_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        let mut backoff = BACKOFF_START;
        let mut seen = Vec::new();
        for _ in 0..8 {
            seen.push(backoff.as_secs());
            backoff = next_backoff(backoff);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[tokio::test]
    async fn cancelled_token_stops_publishing() {
        let publisher = Publisher::new(PublisherConfig {
            // Nothing listens here; the first attempt fails and the
            // cancelled token must stop the retry loop.
            url: "amqp://127.0.0.1:1".to_string(),
            exchange: "etos".to_string(),
        });
        let token = CancellationToken::new();
        token.cancel();

        let result = publisher.publish(&token, "abc.log.info", b"{}").await;
        assert!(matches!(result, Err(PublishError::Cancelled)));
    }
}
