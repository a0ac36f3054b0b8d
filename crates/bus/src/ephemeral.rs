//! Ephemeral RPC client
//!
//! Low-latency pub/sub and request/reply over core NATS. Reconnection is
//! handled by the underlying client with bounded attempts; subscriptions
//! survive reconnects. No retention: a message published with no subscriber
//! is gone.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_nats::connection::State;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use colloquy_core::{subjects, validate_subject, Envelope};

use crate::BusError;

/// How long `close()` waits for in-flight handlers before aborting.
const DRAIN_DEADLINE: Duration = Duration::from_secs(5);

/// Ephemeral bus configuration.
#[derive(Debug, Clone)]
pub struct EphemeralBusConfig {
    pub servers: Vec<String>,
    pub service_name: String,
    pub max_reconnect: usize,
}

impl Default for EphemeralBusConfig {
    fn default() -> Self {
        Self {
            servers: vec!["nats://localhost:4222".to_string()],
            service_name: "unknown".to_string(),
            max_reconnect: 10,
        }
    }
}

/// Client for the ephemeral request/reply fabric.
pub struct EphemeralBus {
    client: async_nats::Client,
    service_name: String,
    subscriber_tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl EphemeralBus {
    /// Connect to the bus. One connection per client; reconnection with
    /// bounded exponential backoff is automatic and outstanding subscribers
    /// are re-established by the underlying client.
    pub async fn connect(config: EphemeralBusConfig) -> Result<Self, BusError> {
        let servers = config.servers.join(",");
        tracing::info!(servers = %servers, service = %config.service_name, "Connecting to ephemeral bus");

        let client = async_nats::ConnectOptions::new()
            .name(&config.service_name)
            .max_reconnects(Some(config.max_reconnect))
            .connect(servers)
            .await
            .map_err(|e| BusError::ConnectionFailed(e.to_string()))?;

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            client,
            service_name: config.service_name,
            subscriber_tasks: Mutex::new(Vec::new()),
            shutdown_tx,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.client.connection_state() == State::Connected
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Publish a payload to a subject. Best-effort: does not wait for
    /// delivery confirmation.
    pub async fn publish(
        &self,
        subject: &str,
        payload: serde_json::Value,
        trace_id: Option<&str>,
        event_type: Option<&str>,
    ) -> Result<(), BusError> {
        validate_subject(subject)?;
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }

        let envelope = Envelope::wrap(payload, trace_id, event_type, &self.service_name);
        self.client
            .publish(subject.to_string(), envelope.to_bytes().into())
            .await
            .map_err(|_| BusError::NotConnected)?;

        tracing::debug!(
            subject = %subject,
            event_type = envelope.event_type.as_deref().unwrap_or("message"),
            "Published to ephemeral bus"
        );
        Ok(())
    }

    /// Synchronous request/reply with a mandatory timeout.
    pub async fn request(
        &self,
        subject: &str,
        payload: serde_json::Value,
        timeout: Duration,
        trace_id: Option<&str>,
    ) -> Result<Envelope, BusError> {
        validate_subject(subject)?;
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }

        let envelope = Envelope::wrap(payload, trace_id, None, &self.service_name);
        let response = tokio::time::timeout(
            timeout,
            self.client
                .request(subject.to_string(), envelope.to_bytes().into()),
        )
        .await
        .map_err(|_| BusError::Timeout)?
        .map_err(|e| match e.kind() {
            async_nats::RequestErrorKind::TimedOut => BusError::Timeout,
            async_nats::RequestErrorKind::NoResponders => BusError::NotConnected,
            _ => BusError::ConnectionFailed(e.to_string()),
        })?;

        let reply = Envelope::parse(&response.payload)?;
        if let Some(err) = reply.wire_error() {
            return Err(BusError::RemoteError(err));
        }
        Ok(reply)
    }

    /// Register a handler for a subject (or wildcard). A queue group enables
    /// competing-consumer load balancing. Handler failures are logged, never
    /// crash the subscriber; for request subjects the returned payload (or
    /// an error envelope) is sent to the reply inbox.
    pub async fn subscribe<F, Fut>(
        &self,
        subject: &str,
        queue: Option<&str>,
        handler: F,
    ) -> Result<(), BusError>
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<serde_json::Value>, BusError>> + Send + 'static,
    {
        validate_subject(subject)?;

        let mut subscriber = match queue {
            Some(q) => self
                .client
                .queue_subscribe(subject.to_string(), q.to_string())
                .await,
            None => self.client.subscribe(subject.to_string()).await,
        }
        .map_err(|e| BusError::ConnectionFailed(e.to_string()))?;

        tracing::info!(subject = %subject, queue = ?queue, "Subscribed on ephemeral bus");

        let client = self.client.clone();
        let service_name = self.service_name.clone();
        let handler = Arc::new(handler);
        let subject_owned = subject.to_string();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    maybe_msg = subscriber.next() => {
                        let Some(msg) = maybe_msg else { break };
                        let envelope = match Envelope::parse(&msg.payload) {
                            Ok(env) => env,
                            Err(e) => {
                                tracing::error!(subject = %subject_owned, error = %e, "Dropping malformed message");
                                metrics::counter!("errors_total", "kind" => "malformed_message").increment(1);
                                continue;
                            },
                        };

                        let trace_id = envelope.trace_id.clone();
                        let result = handler(envelope).await;

                        if let Some(reply_subject) = msg.reply {
                            let reply = match result {
                                Ok(Some(payload)) => {
                                    Envelope::wrap(payload, Some(&trace_id), None, &service_name)
                                },
                                Ok(None) => continue,
                                Err(ref e) => {
                                    tracing::warn!(subject = %subject_owned, error = %e, "Handler failed, replying with error envelope");
                                    Envelope::error(e.to_wire(), &trace_id, &service_name)
                                },
                            };
                            if let Err(e) = client
                                .publish(reply_subject, reply.to_bytes().into())
                                .await
                            {
                                tracing::warn!(subject = %subject_owned, error = %e, "Failed to send reply");
                            }
                        } else if let Err(e) = result {
                            tracing::error!(subject = %subject_owned, error = %e, "Handler failed");
                            metrics::counter!("errors_total", "kind" => "handler_failed").increment(1);
                        }
                    }
                }
            }
            tracing::debug!(subject = %subject_owned, "Subscriber task finished");
        });

        self.subscriber_tasks.lock().push(task);
        Ok(())
    }

    /// Publish a service heartbeat to `system.health.heartbeat`.
    pub async fn publish_heartbeat(
        &self,
        status: &str,
        metrics: serde_json::Value,
    ) -> Result<(), BusError> {
        self.publish(
            subjects::HEARTBEAT,
            serde_json::json!({
                "service": self.service_name,
                "status": status,
                "metrics": metrics,
            }),
            None,
            Some("heartbeat"),
        )
        .await
    }

    /// Drain in-flight handlers up to a bounded deadline, then abort.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.client.flush().await;

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.subscriber_tasks.lock());
        let aborts: Vec<_> = tasks.iter().map(|task| task.abort_handle()).collect();
        if tokio::time::timeout(DRAIN_DEADLINE, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            tracing::warn!("Ephemeral bus drain deadline exceeded, aborting subscribers");
            for abort in aborts {
                abort.abort();
            }
        }
        tracing::info!(service = %self.service_name, "Ephemeral bus closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = EphemeralBusConfig::default();
        assert_eq!(config.servers, vec!["nats://localhost:4222".to_string()]);
        assert_eq!(config.max_reconnect, 10);
    }

    #[test]
    fn test_invalid_subject_rejected_before_send() {
        // Subject validation happens before any network I/O, so it can be
        // exercised without a broker.
        assert!(validate_subject("foo.bar.baz").is_err());
        assert!(validate_subject("agent.voice.session.started").is_ok());
    }
}
