//! Broker transport contracts plus the built-in backends.
//!
//! The traits mirror the AMQP 0-9-1 primitives the exchange needs (connect, open a channel,
//! declare/consume/delete queues, publish on the default exchange, acknowledge) and carry no
//! business semantics. [`MemoryBroker`] keeps everything in-process for tests and local
//! development; the `lapin` feature adds the RabbitMQ backend.

#[cfg(feature = "lapin")] pub mod amqp;
pub mod memory;
pub mod pool;

#[cfg(feature = "lapin")] pub use amqp::LapinConnector;
pub use memory::{MemoryBroker, MemoryStats};
pub use pool::{ConnectionPool, ReconnectPolicy};

// crates.io
use futures_util::Stream;
// self
use crate::{_prelude::*, error::TransportError, payload::CONTENT_TYPE_JSON};

/// Boxed future returned by every transport operation.
pub type TransportFuture<'a, T> =
	Pin<Box<dyn Future<Output = Result<T, TransportError>> + 'a + Send>>;

/// Stream of deliveries produced by [`Channel::consume`].
///
/// The stream ends when the consumer is cancelled, its queue is deleted, or the underlying
/// channel/connection goes away.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, TransportError>> + Send>>;

/// The nameless direct exchange that routes by queue name.
pub const DEFAULT_EXCHANGE: &str = "";

/// Opens broker connections.
pub trait Connector
where
	Self: Send + Sync,
{
	/// Establishes a new connection.
	fn connect(&self) -> TransportFuture<'_, Arc<dyn Connection>>;
}

/// A live broker connection multiplexing logical channels.
pub trait Connection
where
	Self: Send + Sync,
{
	/// Opens a new logical channel.
	fn create_channel(&self) -> TransportFuture<'_, Arc<dyn Channel>>;

	/// Whether the connection is still usable.
	fn is_open(&self) -> bool;

	/// Closes the connection; exclusive queues it owns disappear with it.
	fn close(&self) -> TransportFuture<'_, ()>;
}

/// A logical channel on a connection.
pub trait Channel
where
	Self: Send + Sync,
{
	/// Declares (or attaches to) a queue and returns its name.
	fn declare_queue<'a>(
		&'a self,
		name: &'a str,
		options: QueueOptions,
	) -> TransportFuture<'a, String>;

	/// Publishes a message to `exchange` with `routing_key`.
	fn publish<'a>(
		&'a self,
		exchange: &'a str,
		routing_key: &'a str,
		message: OutboundMessage,
	) -> TransportFuture<'a, ()>;

	/// Starts consuming `queue` under `consumer_tag`.
	fn consume<'a>(
		&'a self,
		queue: &'a str,
		consumer_tag: &'a str,
	) -> TransportFuture<'a, DeliveryStream>;

	/// Cancels the consumer registered under `consumer_tag`.
	fn cancel<'a>(&'a self, consumer_tag: &'a str) -> TransportFuture<'a, ()>;

	/// Deletes `queue`; deleting a missing queue succeeds.
	fn delete_queue<'a>(&'a self, queue: &'a str) -> TransportFuture<'a, ()>;

	/// Limits the number of unacknowledged deliveries in flight on this channel.
	fn set_prefetch(&self, count: u16) -> TransportFuture<'_, ()>;

	/// Closes the channel; unacknowledged deliveries return to their queues.
	fn close(&self) -> TransportFuture<'_, ()>;
}

/// Settles a single delivery.
pub trait Acker
where
	Self: Send + Sync,
{
	/// Positively acknowledges the delivery.
	fn ack(&self) -> TransportFuture<'_, ()>;

	/// Rejects the delivery, optionally returning it to its queue.
	fn nack(&self, requeue: bool) -> TransportFuture<'_, ()>;
}

/// Queue declaration flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueOptions {
	/// Survives broker restarts.
	pub durable: bool,
	/// Private to the declaring connection.
	pub exclusive: bool,
	/// Removed once its last consumer goes away.
	pub auto_delete: bool,
}
impl QueueOptions {
	/// Options for a shared work queue.
	pub const fn durable() -> Self {
		Self { durable: true, exclusive: false, auto_delete: false }
	}

	/// Options for a per-request private reply queue.
	pub const fn exclusive_reply() -> Self {
		Self { durable: false, exclusive: true, auto_delete: true }
	}
}

/// Message handed to [`Channel::publish`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
	/// Raw body.
	pub body: Vec<u8>,
	/// Correlation id property.
	pub correlation_id: Option<String>,
	/// Reply-to property naming the queue a reply should go to.
	pub reply_to: Option<String>,
	/// Content type property.
	pub content_type: Option<String>,
	/// Publish timestamp property.
	pub timestamp: Option<OffsetDateTime>,
}
impl OutboundMessage {
	/// Builds a JSON message stamped with the current time.
	pub fn json(body: Vec<u8>) -> Self {
		Self {
			body,
			correlation_id: None,
			reply_to: None,
			content_type: Some(CONTENT_TYPE_JSON.into()),
			timestamp: Some(OffsetDateTime::now_utc()),
		}
	}

	/// Sets the correlation id property.
	pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
		self.correlation_id = Some(id.into());

		self
	}

	/// Sets the reply-to property.
	pub fn with_reply_to(mut self, address: impl Into<String>) -> Self {
		self.reply_to = Some(address.into());

		self
	}
}

/// A message received from a queue, together with the handle that settles it.
pub struct Delivery {
	/// Raw body.
	pub body: Vec<u8>,
	/// Correlation id property, if the publisher set one.
	pub correlation_id: Option<String>,
	/// Reply-to property, if the publisher set one.
	pub reply_to: Option<String>,
	/// Whether the broker delivered this message before.
	pub redelivered: bool,
	/// Publish timestamp property.
	pub timestamp: Option<OffsetDateTime>,
	acker: Box<dyn Acker>,
}
impl Delivery {
	/// Wraps a received body and its settlement handle.
	pub fn new(body: Vec<u8>, acker: impl 'static + Acker) -> Self {
		Self {
			body,
			correlation_id: None,
			reply_to: None,
			redelivered: false,
			timestamp: None,
			acker: Box::new(acker),
		}
	}

	/// Positively acknowledges the delivery.
	pub async fn ack(self) -> Result<(), TransportError> {
		self.acker.ack().await
	}

	/// Rejects the delivery, optionally returning it to its queue.
	pub async fn nack(self, requeue: bool) -> Result<(), TransportError> {
		self.acker.nack(requeue).await
	}
}
impl Debug for Delivery {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("Delivery")
			.field("body_len", &self.body.len())
			.field("correlation_id", &self.correlation_id)
			.field("reply_to", &self.reply_to)
			.field("redelivered", &self.redelivered)
			.field("timestamp", &self.timestamp)
			.finish_non_exhaustive()
	}
}

/// A declared queue bound to the channel that declared it.
#[derive(Clone)]
pub struct QueueHandle {
	name: String,
	channel: Arc<dyn Channel>,
}
impl QueueHandle {
	/// Declares `name` on `channel` and keeps the pair together.
	pub async fn declare(
		channel: Arc<dyn Channel>,
		name: &str,
		options: QueueOptions,
	) -> Result<Self, TransportError> {
		let name = channel.declare_queue(name, options).await?;

		Ok(Self { name, channel })
	}

	/// Queue name as confirmed by the broker.
	pub fn name(&self) -> &str {
		&self.name
	}

	/// Channel the queue was declared on.
	pub fn channel(&self) -> &Arc<dyn Channel> {
		&self.channel
	}

	/// Starts consuming the queue under `consumer_tag`.
	pub async fn consume(&self, consumer_tag: &str) -> Result<DeliveryStream, TransportError> {
		self.channel.consume(&self.name, consumer_tag).await
	}

	/// Deletes the queue.
	pub async fn delete(&self) -> Result<(), TransportError> {
		self.channel.delete_queue(&self.name).await
	}
}
impl Debug for QueueHandle {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("QueueHandle").field("name", &self.name).finish_non_exhaustive()
	}
}
