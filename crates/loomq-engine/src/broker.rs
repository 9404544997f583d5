use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
};
use tokio::sync::Mutex as AsyncMutex;
use tracing::instrument;

/// Errors surfaced by a [`Broker`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The connection or channel could not be established (startup) or was lost (runtime).
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    /// A publish was rejected by the broker after exhausting the retry budget.
    #[error("publish failed: {0}")]
    PublishFailed(String),
    /// A queue depth query failed.
    #[error("failed to sample queue depth: {0}")]
    SampleFailed(String),
}

/// One delivered message, opaque beyond its body and the broker-specific ack handle.
pub struct Envelope {
    /// The raw message body as received from the broker.
    pub body: Vec<u8>,
    inner: EnvelopeInner,
}

enum EnvelopeInner {
    Amqp(Delivery),
    #[cfg(test)]
    Fake(u64),
}

/// Transport contract a worker needs: durable queue declaration, prefetch, consume, publish,
/// ack/nack, and a synchronous queue-depth query.
///
/// Implemented once per worker (connections are never shared across workers, per the
/// concurrency model) and once more, ad hoc, by the Supervisor purely to sample queue depth. The
/// Supervisor's sampling connection calls [`Broker::prepare`] but never [`Broker::start_consuming`]
/// — it must never register as a consumer on the input queue, or it would steal deliveries from
/// the worker pool without ever acking them.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declares the input/output/error queues as durable and sets prefetch to `prefetch_count`.
    async fn prepare(&self, prefetch_count: u16) -> Result<(), BrokerError>;

    /// Registers this connection as a consumer of the input queue. Must be called once, after
    /// [`Broker::prepare`], before the first [`Broker::consume_one`].
    async fn start_consuming(&self) -> Result<(), BrokerError>;

    /// Begins consuming from the input queue. Returns one [`Envelope`] per call; the caller
    /// drives the loop.
    async fn consume_one(&self) -> Result<Option<Envelope>, BrokerError>;

    /// Publishes `body` to `queue`, persistent delivery, with bounded retry.
    async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), BrokerError>;

    /// Acknowledges a previously consumed envelope.
    async fn ack(&self, envelope: Envelope) -> Result<(), BrokerError>;

    /// Rejects a previously consumed envelope and asks the broker to requeue it.
    async fn nack_requeue(&self, envelope: Envelope) -> Result<(), BrokerError>;

    /// Returns the current message count of `queue`.
    async fn message_count(&self, queue: &str) -> Result<u32, BrokerError>;

    /// Closes the underlying connection cleanly.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// AMQP 0-9-1 [`Broker`] backed by `lapin`.
pub struct AmqpBroker {
    connection: Connection,
    channel: Channel,
    input_queue: String,
    output_queue: String,
    error_queue: String,
    consumer_tag: String,
    consumer: AsyncMutex<Option<Consumer>>,
}

impl AmqpBroker {
    /// Opens a fresh connection and channel and declares the three durable queues.
    #[instrument(skip(uri, input_queue, output_queue, error_queue), fields(consumer_tag = %consumer_tag))]
    pub async fn connect(
        uri: &str,
        input_queue: &str,
        output_queue: &str,
        error_queue: &str,
        consumer_tag: &str,
    ) -> Result<Self, BrokerError> {
        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;

        Ok(Self {
            connection,
            channel,
            input_queue: input_queue.to_string(),
            output_queue: output_queue.to_string(),
            error_queue: error_queue.to_string(),
            consumer_tag: consumer_tag.to_string(),
            consumer: AsyncMutex::new(None),
        })
    }

    async fn declare_durable(&self, queue: &str) -> Result<(), BrokerError> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn prepare(&self, prefetch_count: u16) -> Result<(), BrokerError> {
        self.declare_durable(&self.input_queue).await?;
        self.declare_durable(&self.output_queue).await?;
        self.declare_durable(&self.error_queue).await?;
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn start_consuming(&self) -> Result<(), BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                &self.input_queue,
                &self.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;
        *self.consumer.lock().await = Some(consumer);
        Ok(())
    }

    async fn consume_one(&self) -> Result<Option<Envelope>, BrokerError> {
        let mut guard = self.consumer.lock().await;
        let Some(consumer) = guard.as_mut() else {
            unreachable!("consume_one called before start_consuming() established a consumer")
        };

        match consumer.next().await {
            Some(Ok(delivery)) => Ok(Some(Envelope {
                body: delivery.data.clone(),
                inner: EnvelopeInner::Amqp(delivery),
            })),
            Some(Err(e)) => Err(BrokerError::Unavailable(e.to_string())),
            None => Ok(None),
        }
    }

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), BrokerError> {
        self.channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await
            .map_err(|e| BrokerError::PublishFailed(e.to_string()))?
            .await
            .map_err(|e| BrokerError::PublishFailed(e.to_string()))?;
        Ok(())
    }

    async fn ack(&self, envelope: Envelope) -> Result<(), BrokerError> {
        let EnvelopeInner::Amqp(delivery) = envelope.inner else {
            unreachable!("AmqpBroker only ever produces EnvelopeInner::Amqp deliveries")
        };
        delivery
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))
    }

    async fn nack_requeue(&self, envelope: Envelope) -> Result<(), BrokerError> {
        let EnvelopeInner::Amqp(delivery) = envelope.inner else {
            unreachable!("AmqpBroker only ever produces EnvelopeInner::Amqp deliveries")
        };
        delivery
            .nack(BasicNackOptions {
                requeue: true,
                ..BasicNackOptions::default()
            })
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))
    }

    async fn message_count(&self, queue: &str) -> Result<u32, BrokerError> {
        let declared = self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::SampleFailed(e.to_string()))?;
        Ok(declared.message_count())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.channel
            .close(200, "worker draining")
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;
        self.connection
            .close(200, "worker draining")
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;
        Ok(())
    }
}
