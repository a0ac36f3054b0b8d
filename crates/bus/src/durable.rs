//! Durable log client
//!
//! Keyed, persistent streaming over NATS JetStream. One stream per logical
//! namespace (`events`, `analytics`, `audit`); topics map to subjects within
//! the stream, so a topic's messages are totally ordered, which subsumes
//! the per-key ordering contract. Delivery is at-least-once; consumers must
//! tolerate redelivery. After `redeliver_max` failed deliveries a message is
//! forwarded to the companion `<topic>-dlq` topic and terminated.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, DeliverPolicy},
    stream::Config as StreamConfig,
    AckKind,
};
use futures::StreamExt;

use colloquy_core::{topics, validate_topic, Envelope};

use crate::BusError;

/// Durable log configuration.
#[derive(Debug, Clone)]
pub struct DurableLogConfig {
    pub url: String,
    pub service_name: String,
    /// Timeout for stream provisioning and publish acknowledgements.
    pub operation_timeout: Duration,
    /// Redeliveries before dead-lettering.
    pub redeliver_max: u32,
    /// Stream name prefix.
    pub stream_prefix: String,
}

impl Default for DurableLogConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            service_name: "unknown".to_string(),
            operation_timeout: Duration::from_secs(30),
            redeliver_max: 3,
            stream_prefix: "colloquy".to_string(),
        }
    }
}

/// Where a new subscription starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitialPosition {
    #[default]
    Latest,
    Earliest,
}

/// Handler verdict for a consumed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeAction {
    Ack,
    Nack,
}

/// Delivery metadata passed to consumers.
#[derive(Debug, Clone)]
pub struct MessageMeta {
    pub topic: String,
    /// Partition key the producer attached, if any.
    pub key: Option<String>,
    /// 1-based delivery attempt.
    pub delivery: u32,
}

/// Client for the durable, partitioned log.
pub struct DurableLog {
    js: jetstream::Context,
    config: DurableLogConfig,
}

impl DurableLog {
    /// Connect and provision the namespace streams. Idempotent: streams are
    /// created only when missing.
    pub async fn connect(config: DurableLogConfig) -> Result<Self, BusError> {
        tracing::info!(url = %config.url, service = %config.service_name, "Connecting to durable log");

        let client = async_nats::ConnectOptions::new()
            .name(format!("{}-durable", config.service_name))
            .connect(&config.url)
            .await
            .map_err(|e| BusError::ConnectionFailed(e.to_string()))?;

        let js = jetstream::new(client);
        let log = Self { js, config };
        log.ensure_streams().await?;

        tracing::info!("Durable log initialized");
        Ok(log)
    }

    async fn ensure_streams(&self) -> Result<(), BusError> {
        for namespace in [
            topics::NAMESPACE_EVENTS,
            topics::NAMESPACE_ANALYTICS,
            topics::NAMESPACE_AUDIT,
        ] {
            let stream_config = StreamConfig {
                name: format!("{}-{}", self.config.stream_prefix, namespace),
                subjects: vec![format!("{}.>", namespace)],
                ..Default::default()
            };
            tokio::time::timeout(
                self.config.operation_timeout,
                self.js.get_or_create_stream(stream_config),
            )
            .await
            .map_err(|_| BusError::ProducerError("stream provisioning timed out".to_string()))?
            .map_err(|e| BusError::ConnectionFailed(e.to_string()))?;
        }
        Ok(())
    }

    fn stream_name_for(&self, topic: &str) -> Result<String, BusError> {
        let namespace =
            topics::namespace(topic).ok_or_else(|| BusError::InvalidTopic(topic.to_string()))?;
        Ok(format!("{}-{}", self.config.stream_prefix, namespace))
    }

    /// Map a `namespace/name` topic to its stream subject.
    fn subject_for(topic: &str) -> String {
        topic.replace('/', ".")
    }

    /// Produce a message to a topic. The partition key, trace id, service
    /// and event type travel as message headers alongside the envelope.
    /// Returns the broker-assigned message id.
    pub async fn produce(
        &self,
        topic: &str,
        payload: serde_json::Value,
        key: Option<&str>,
        trace_id: Option<&str>,
        event_type: Option<&str>,
        properties: Option<HashMap<String, String>>,
    ) -> Result<String, BusError> {
        validate_topic(topic)?;

        let envelope = Envelope::wrap(payload, trace_id, event_type, &self.config.service_name);

        let mut headers = async_nats::HeaderMap::new();
        headers.insert("trace-id", envelope.trace_id.as_str());
        headers.insert("service", self.config.service_name.as_str());
        if let Some(event_type) = event_type {
            headers.insert("event-type", event_type);
        }
        if let Some(key) = key {
            headers.insert("partition-key", key);
        }
        for (name, value) in properties.unwrap_or_default() {
            headers.insert(name.as_str(), value.as_str());
        }

        let ack = tokio::time::timeout(
            self.config.operation_timeout,
            self.publish_ack(Self::subject_for(topic), headers, envelope.to_bytes()),
        )
        .await
        .map_err(|_| BusError::ProducerError("publish ack timed out".to_string()))??;

        tracing::debug!(
            topic = %topic,
            key = ?key,
            event_type = event_type.unwrap_or("message"),
            sequence = ack.1,
            "Produced to durable log"
        );
        Ok(format!("{}:{}", ack.0, ack.1))
    }

    async fn publish_ack(
        &self,
        subject: String,
        headers: async_nats::HeaderMap,
        payload: Vec<u8>,
    ) -> Result<(String, u64), BusError> {
        let ack = self
            .js
            .publish_with_headers(subject, headers, payload.into())
            .await
            .map_err(|e| BusError::ProducerError(e.to_string()))?
            .await
            .map_err(|e| BusError::ProducerError(e.to_string()))?;
        Ok((ack.stream, ack.sequence))
    }

    /// Consume a topic with a durable subscription. Blocks in a receive
    /// loop until the stream ends. The handler returns [`ConsumeAction`];
    /// handler errors count as `Nack`. A message that has exhausted
    /// `redeliver_max` deliveries is produced to `<topic>-dlq` and
    /// terminated.
    pub async fn consume<F, Fut>(
        &self,
        topic: &str,
        subscription: &str,
        handler: F,
        initial: InitialPosition,
    ) -> Result<(), BusError>
    where
        F: Fn(Envelope, MessageMeta) -> Fut + Send + Sync,
        Fut: Future<Output = Result<ConsumeAction, BusError>> + Send,
    {
        validate_topic(topic)?;

        let stream = self
            .js
            .get_stream(self.stream_name_for(topic)?)
            .await
            .map_err(|e| BusError::ConsumerError(e.to_string()))?;

        let consumer_config = pull::Config {
            durable_name: Some(subscription.to_string()),
            ack_policy: AckPolicy::Explicit,
            deliver_policy: match initial {
                InitialPosition::Latest => DeliverPolicy::New,
                InitialPosition::Earliest => DeliverPolicy::All,
            },
            filter_subject: Self::subject_for(topic),
            // One extra so the final failed delivery reaches us for DLQ routing
            max_deliver: self.config.redeliver_max as i64 + 1,
            ..Default::default()
        };

        let consumer = stream
            .get_or_create_consumer(subscription, consumer_config)
            .await
            .map_err(|e| BusError::ConsumerError(e.to_string()))?;

        tracing::info!(topic = %topic, subscription = %subscription, "Started durable consumer");

        let mut messages = consumer
            .messages()
            .await
            .map_err(|e| BusError::ConsumerError(e.to_string()))?;

        while let Some(next) = messages.next().await {
            let msg = match next {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::warn!(topic = %topic, error = %e, "Receive error on durable consumer");
                    continue;
                },
            };

            let delivery = msg.info().map(|i| i.delivered.max(1) as u32).unwrap_or(1);
            let key = msg
                .headers
                .as_ref()
                .and_then(|h| h.get("partition-key"))
                .map(|v| v.as_str().to_string());

            let envelope = match Envelope::parse(&msg.payload) {
                Ok(env) => env,
                Err(e) => {
                    tracing::error!(topic = %topic, error = %e, "Terminating malformed durable message");
                    metrics::counter!("errors_total", "kind" => "malformed_message").increment(1);
                    let _ = msg.ack_with(AckKind::Term).await;
                    continue;
                },
            };

            let meta = MessageMeta {
                topic: topic.to_string(),
                key: key.clone(),
                delivery,
            };
            let action = match handler(envelope.clone(), meta).await {
                Ok(action) => action,
                Err(e) => {
                    tracing::warn!(topic = %topic, error = %e, "Consumer handler failed");
                    ConsumeAction::Nack
                },
            };

            match action {
                ConsumeAction::Ack => {
                    if let Err(e) = msg.ack().await {
                        tracing::warn!(topic = %topic, error = %e, "Failed to ack");
                    }
                },
                ConsumeAction::Nack if delivery > self.config.redeliver_max => {
                    self.dead_letter(topic, &envelope, key.as_deref()).await;
                    let _ = msg.ack_with(AckKind::Term).await;
                },
                ConsumeAction::Nack => {
                    tracing::warn!(
                        topic = %topic,
                        delivery = delivery,
                        "Negative-ack, message will be redelivered"
                    );
                    let _ = msg.ack_with(AckKind::Nak(None)).await;
                },
            }
        }

        Ok(())
    }

    /// Forward an exhausted message to the companion dead-letter topic.
    async fn dead_letter(&self, topic: &str, envelope: &Envelope, key: Option<&str>) {
        let dlq_topic = topics::dlq(topic);
        tracing::error!(topic = %topic, dlq = %dlq_topic, trace_id = %envelope.trace_id, "Dead-lettering message");
        metrics::counter!("errors_total", "kind" => "dead_lettered").increment(1);

        let result = self
            .produce(
                &dlq_topic,
                serde_json::Value::Object(envelope.payload.clone()),
                key,
                Some(&envelope.trace_id),
                envelope.event_type.as_deref(),
                Some(HashMap::from([(
                    "dlq-source".to_string(),
                    topic.to_string(),
                )])),
            )
            .await;
        if let Err(e) = result {
            tracing::error!(dlq = %dlq_topic, error = %e, "Failed to dead-letter message");
        }
    }

    // Convenience producers for the well-known topics.

    /// Conversation event on `events/conversations`, keyed by session for
    /// per-session ordering.
    pub async fn produce_conversation_event(
        &self,
        session_id: &str,
        event_type: &str,
        data: serde_json::Value,
        trace_id: Option<&str>,
    ) -> Result<String, BusError> {
        self.produce(
            topics::CONVERSATIONS,
            data,
            Some(session_id),
            trace_id,
            Some(event_type),
            None,
        )
        .await
    }

    /// Analytics event on `analytics/<metric>`, unkeyed.
    pub async fn produce_analytics(
        &self,
        metric_type: &str,
        data: serde_json::Value,
        trace_id: Option<&str>,
    ) -> Result<String, BusError> {
        self.produce(
            &topics::analytics(metric_type),
            data,
            None,
            trace_id,
            Some(&format!("analytics_{}", metric_type.replace('-', "_"))),
            None,
        )
        .await
    }

    /// Audit entry on `audit/logs`, keyed by user for per-user ordering.
    pub async fn produce_audit(
        &self,
        user_id: &str,
        action: &str,
        resource: &str,
        mut data: serde_json::Value,
        trace_id: Option<&str>,
    ) -> Result<String, BusError> {
        if let Some(map) = data.as_object_mut() {
            map.insert("user_id".to_string(), user_id.into());
            map.insert("action".to_string(), action.into());
            map.insert("resource".to_string(), resource.into());
        }
        self.produce(
            topics::AUDIT_LOGS,
            data,
            Some(user_id),
            trace_id,
            Some("audit_log"),
            None,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_mapping() {
        assert_eq!(DurableLog::subject_for("events/conversations"), "events.conversations");
        assert_eq!(
            DurableLog::subject_for("analytics/latency-metrics"),
            "analytics.latency-metrics"
        );
        assert_eq!(
            DurableLog::subject_for("events/conversations-dlq"),
            "events.conversations-dlq"
        );
    }

    #[test]
    fn test_config_default() {
        let config = DurableLogConfig::default();
        assert_eq!(config.redeliver_max, 3);
        assert_eq!(config.operation_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_dlq_topic_stays_in_namespace() {
        // The DLQ companion must land in the same stream as its source topic
        let dlq = topics::dlq(topics::CONVERSATIONS);
        assert_eq!(topics::namespace(&dlq), Some("events"));
        assert!(validate_topic(&dlq).is_ok());
    }
}
