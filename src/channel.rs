// src/channel.rs
//
// Channel derivation with queue existence assurance. Every call opens a
// fresh channel on the shared default connection; channels are never
// pooled or shared by this crate. Queue channels probe for existence
// first so that a pre-existing queue is never re-declared, then fall
// back to an active declare when absent. Exchange channels rely on the
// broker's own declare idempotency instead.

use std::sync::Arc;

use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable},
    Channel, Connection, Error as LapinError, ExchangeKind,
};
use tracing::debug;

use crate::errors::Result;
use crate::registry::ConnectionRegistry;

/// Queue argument enabling priority ordering; fixed at queue creation time.
pub const MAX_PRIORITY_ARG: &str = "x-max-priority";

/// AMQP reply code for "queue does not exist".
const NOT_FOUND: u16 = 404;

/// Durability and auto-delete flags applied when a queue has to be created.
/// Defaults match the broker-client convention: durable, not auto-deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub auto_delete: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        QueueOptions {
            durable: true,
            auto_delete: false,
        }
    }
}

/// Exchange binding parameters, passed through to the broker unvalidated.
#[derive(Debug, Clone)]
pub struct ExchangeSpec {
    pub name: String,
    /// Exchange kind as an opaque string ("topic", "direct", "fanout", ...);
    /// kinds unknown to lapin pass through as custom.
    pub kind: String,
    pub routing_key: String,
    pub headers: FieldTable,
}

impl ExchangeSpec {
    pub fn new(
        name: impl Into<String>,
        kind: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        ExchangeSpec {
            name: name.into(),
            kind: kind.into(),
            routing_key: routing_key.into(),
            headers: FieldTable::default(),
        }
    }

    pub fn with_headers(mut self, headers: FieldTable) -> Self {
        self.headers = headers;
        self
    }

    fn exchange_kind(&self) -> ExchangeKind {
        match self.kind.as_str() {
            "direct" => ExchangeKind::Direct,
            "fanout" => ExchangeKind::Fanout,
            "headers" => ExchangeKind::Headers,
            "topic" => ExchangeKind::Topic,
            other => ExchangeKind::Custom(other.to_string()),
        }
    }
}

/// Derives per-operation channels from the registry's default connection.
pub struct ChannelFactory {
    registry: Arc<ConnectionRegistry>,
}

impl ChannelFactory {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        ChannelFactory { registry }
    }

    /// Returns a channel with `queue` guaranteed to exist. A pre-existing
    /// queue is left untouched regardless of `options`; an absent one is
    /// created with the requested flags.
    pub async fn queue_channel(&self, queue: &str, options: QueueOptions) -> Result<Channel> {
        self.assured_queue_channel(queue, options, None).await
    }

    /// Like [`queue_channel`](Self::queue_channel), but an absent queue is
    /// created as a priority queue with the given maximum level. The level
    /// only takes effect on first creation; a pre-existing queue's priority
    /// configuration is accepted as-is, mismatched or not.
    pub async fn priority_queue_channel(
        &self,
        queue: &str,
        max_priority: u8,
        options: QueueOptions,
    ) -> Result<Channel> {
        self.assured_queue_channel(queue, options, Some(max_priority))
            .await
    }

    /// Returns a channel with the exchange declared, `queue` declared, and
    /// the two bound by the spec's routing key and headers. Declarations are
    /// unconditional; the broker treats matching re-declares as no-ops and
    /// surfaces mismatches as failures, which propagate unmodified.
    pub async fn exchange_channel(
        &self,
        spec: &ExchangeSpec,
        queue: &str,
        options: QueueOptions,
    ) -> Result<Channel> {
        let connection = self.registry.default_connection().await?;
        let channel = connection.create_channel().await?;

        channel
            .exchange_declare(
                &spec.name,
                spec.exchange_kind(),
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_declare(queue, declare_options(options), FieldTable::default())
            .await?;
        channel
            .queue_bind(
                queue,
                &spec.name,
                &spec.routing_key,
                QueueBindOptions::default(),
                spec.headers.clone(),
            )
            .await?;

        Ok(channel)
    }

    async fn assured_queue_channel(
        &self,
        queue: &str,
        options: QueueOptions,
        max_priority: Option<u8>,
    ) -> Result<Channel> {
        let connection = self.registry.default_connection().await?;

        match probe_queue(&connection, queue).await? {
            Some(channel) => Ok(channel),
            None => {
                debug!(queue, "queue absent, declaring");
                let channel = connection.create_channel().await?;
                channel
                    .queue_declare(
                        queue,
                        declare_options(options),
                        queue_arguments(max_priority),
                    )
                    .await?;
                Ok(channel)
            }
        }
    }
}

/// Passive existence probe. Returns the probe channel itself when the queue
/// exists; `None` when the broker reports NOT_FOUND, in which case the probe
/// channel has been closed server-side and is discarded. Any other failure
/// propagates.
async fn probe_queue(connection: &Connection, queue: &str) -> Result<Option<Channel>> {
    let probe = connection.create_channel().await?;
    let passive = QueueDeclareOptions {
        passive: true,
        ..QueueDeclareOptions::default()
    };
    match probe.queue_declare(queue, passive, FieldTable::default()).await {
        Ok(_) => Ok(Some(probe)),
        Err(err) if is_not_found(&err) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn is_not_found(err: &LapinError) -> bool {
    matches!(err, LapinError::ProtocolError(amqp_err) if amqp_err.get_id() == NOT_FOUND)
}

fn declare_options(options: QueueOptions) -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: options.durable,
        auto_delete: options.auto_delete,
        ..QueueDeclareOptions::default()
    }
}

fn queue_arguments(max_priority: Option<u8>) -> FieldTable {
    let mut arguments = FieldTable::default();
    if let Some(level) = max_priority {
        arguments.insert(MAX_PRIORITY_ARG.into(), AMQPValue::ShortShortUInt(level));
    }
    arguments
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::protocol::AMQPError;
    use lapin::types::ShortString;

    #[test]
    fn test_queue_options_defaults() {
        let options = QueueOptions::default();
        assert!(options.durable);
        assert!(!options.auto_delete);
    }

    #[test]
    fn test_declare_options_mapping() {
        let options = declare_options(QueueOptions {
            durable: false,
            auto_delete: true,
        });
        assert!(!options.durable);
        assert!(options.auto_delete);
        assert!(!options.passive);
        assert!(!options.exclusive);
    }

    #[test]
    fn test_priority_argument_set_only_when_requested() {
        assert!(queue_arguments(None).inner().is_empty());

        let arguments = queue_arguments(Some(5));
        assert_eq!(
            arguments.inner().get(&ShortString::from(MAX_PRIORITY_ARG)),
            Some(&AMQPValue::ShortShortUInt(5))
        );
    }

    #[test]
    fn test_exchange_kind_mapping() {
        let kind = |k: &str| ExchangeSpec::new("orders", k, "created").exchange_kind();
        assert!(matches!(kind("topic"), ExchangeKind::Topic));
        assert!(matches!(kind("direct"), ExchangeKind::Direct));
        assert!(matches!(kind("fanout"), ExchangeKind::Fanout));
        assert!(matches!(kind("headers"), ExchangeKind::Headers));
        assert!(
            matches!(kind("x-delayed-message"), ExchangeKind::Custom(name) if name == "x-delayed-message")
        );
    }

    #[test]
    fn test_not_found_classification() {
        let not_found = LapinError::ProtocolError(
            AMQPError::from_id(404, "NOT_FOUND - no queue 'missing'".into()).unwrap(),
        );
        assert!(is_not_found(&not_found));

        let access_refused = LapinError::ProtocolError(
            AMQPError::from_id(403, "ACCESS_REFUSED".into()).unwrap(),
        );
        assert!(!is_not_found(&access_refused));

        let state = LapinError::InvalidConnectionState(lapin::ConnectionState::Closed);
        assert!(!is_not_found(&state));
    }
}
