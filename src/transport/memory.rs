//! In-process broker with AMQP queue semantics for local development and tests.
//!
//! Supports the subset the exchange relies on: default-exchange routing, durable/exclusive/
//! auto-delete queues, round-robin dispatch across consumers with per-channel prefetch,
//! ack/nack with requeue, and connection-scoped cleanup. Messages rejected without requeue
//! are kept per queue so tests can inspect them.

// crates.io
use tokio::sync::mpsc::{self, UnboundedSender};
// self
use crate::{
	_prelude::*,
	error::TransportError,
	transport::{
		Acker, Channel, Connection, Connector, DEFAULT_EXCHANGE, Delivery, DeliveryStream,
		OutboundMessage, QueueOptions, TransportFuture,
	},
};

type DeliverySender = UnboundedSender<Result<Delivery, TransportError>>;

/// Counters exposed for assertions about queue and message lifecycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
	/// Queues created by a declare call.
	pub queues_declared: u64,
	/// Queues removed explicitly, by auto-delete, or with their owning connection.
	pub queues_deleted: u64,
	/// Messages accepted by publish.
	pub published: u64,
	/// Messages published to a queue that does not exist.
	pub unroutable: u64,
	/// Messages rejected without requeue.
	pub dead_lettered: u64,
}

/// Thread-safe in-memory broker; clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryBroker(Arc<Mutex<BrokerState>>);
impl MemoryBroker {
	/// Creates an empty broker that accepts connections.
	pub fn new() -> Self {
		Self::default()
	}

	/// Whether `queue` currently exists.
	pub fn queue_exists(&self, queue: &str) -> bool {
		self.0.lock().queues.contains_key(queue)
	}

	/// Names of all existing queues, sorted.
	pub fn queue_names(&self) -> Vec<String> {
		let mut names = self.0.lock().queues.keys().cloned().collect::<Vec<_>>();

		names.sort();

		names
	}

	/// Messages waiting in `queue` that no consumer holds.
	pub fn ready_count(&self, queue: &str) -> usize {
		self.0.lock().queues.get(queue).map_or(0, |q| q.ready.len())
	}

	/// Active consumers on `queue`.
	pub fn consumer_count(&self, queue: &str) -> usize {
		self.0.lock().queues.get(queue).map_or(0, |q| q.consumers.len())
	}

	/// Deliveries handed out and not yet settled, across all queues.
	pub fn unacked_count(&self) -> usize {
		self.0.lock().unacked.len()
	}

	/// Bodies of messages rejected without requeue from `queue`, oldest first.
	pub fn dead_letters(&self, queue: &str) -> Vec<Vec<u8>> {
		self.0
			.lock()
			.dead_letters
			.get(queue)
			.map(|messages| messages.iter().map(|m| m.body.clone()).collect())
			.unwrap_or_default()
	}

	/// Snapshot of the lifecycle counters.
	pub fn stats(&self) -> MemoryStats {
		self.0.lock().stats
	}

	/// Number of open connections.
	pub fn open_connections(&self) -> usize {
		self.0.lock().connections.len()
	}

	/// Drops every open connection as if the broker restarted.
	pub fn disconnect_all(&self) {
		let mut state = self.0.lock();
		let ids = state.connections.iter().copied().collect::<Vec<_>>();

		for id in ids {
			self.close_connection(&mut *state, id);
		}
	}

	/// Toggles whether new connections are accepted.
	pub fn set_available(&self, available: bool) {
		self.0.lock().unavailable = !available;
	}

	fn close_connection(&self, state: &mut BrokerState, connection: u64) {
		if !state.connections.remove(&connection) {
			return;
		}

		let channels = state
			.channels
			.iter()
			.filter(|(_, ch)| ch.connection == connection)
			.map(|(id, _)| *id)
			.collect::<Vec<_>>();

		for channel in channels {
			self.close_channel(state, channel);
		}

		let owned = state
			.queues
			.iter()
			.filter(|(_, q)| q.owner == Some(connection))
			.map(|(name, _)| name.clone())
			.collect::<Vec<_>>();

		for name in owned {
			state.remove_queue(&name);
		}
	}

	fn close_channel(&self, state: &mut BrokerState, channel: u64) {
		if state.channels.remove(&channel).is_none() {
			return;
		}

		let mut touched = HashSet::new();

		for (name, queue) in state.queues.iter_mut() {
			let before = queue.consumers.len();

			queue.consumers.retain(|c| c.channel != channel);

			if queue.consumers.len() != before {
				touched.insert(name.clone());
			}
		}

		let tags = state
			.unacked
			.iter()
			.filter(|(_, u)| u.channel == channel)
			.map(|(tag, _)| *tag)
			.collect::<Vec<_>>();

		for tag in tags {
			if let Some(unacked) = state.unacked.remove(&tag) {
				touched.insert(unacked.queue.clone());
				state.requeue(unacked);
			}
		}

		for name in touched {
			state.auto_delete_if_idle(&name);
			self.dispatch(state, &name);
		}
	}

	fn dispatch(&self, state: &mut BrokerState, queue: &str) {
		loop {
			let Some(q) = state.queues.get(queue) else { return };

			if q.ready.is_empty() || q.consumers.is_empty() {
				return;
			}

			let count = q.consumers.len();
			let slot = (0..count).map(|i| (q.cursor + i) % count).find(|i| {
				state.channels.get(&q.consumers[*i].channel).is_some_and(ChannelState::has_capacity)
			});
			let Some(slot) = slot else { return };
			let Some(q) = state.queues.get_mut(queue) else { return };
			let Some(message) = q.ready.pop_front() else { return };
			let consumer = &q.consumers[slot];
			let channel = consumer.channel;
			let tag = state.next_delivery_tag;
			let mut delivery = Delivery::new(
				message.body.clone(),
				MemoryAcker { broker: self.clone(), delivery_tag: tag },
			);

			delivery.correlation_id = message.correlation_id.clone();
			delivery.reply_to = message.reply_to.clone();
			delivery.redelivered = message.redelivered;
			delivery.timestamp = message.timestamp;

			if consumer.sender.send(Ok(delivery)).is_err() {
				// Stream dropped without a cancel; forget the consumer and keep the message.
				q.consumers.remove(slot);
				q.ready.push_front(message);

				continue;
			}

			q.cursor = (slot + 1) % q.consumers.len().max(1);
			state.next_delivery_tag += 1;
			state.unacked.insert(tag, Unacked { queue: queue.to_owned(), channel, message });

			if let Some(ch) = state.channels.get_mut(&channel) {
				ch.unacked += 1;
			}
		}
	}

	fn settle(&self, delivery_tag: u64, requeue: Option<bool>) -> Result<(), TransportError> {
		let mut state = self.0.lock();
		let unacked = state.unacked.remove(&delivery_tag).ok_or(TransportError::ChannelClosed)?;

		if let Some(ch) = state.channels.get_mut(&unacked.channel) {
			ch.unacked = ch.unacked.saturating_sub(1);
		}

		let queue = unacked.queue.clone();

		match requeue {
			None => {},
			Some(true) => state.requeue(unacked),
			Some(false) => {
				state.stats.dead_lettered += 1;
				state.dead_letters.entry(unacked.queue).or_default().push(unacked.message);
			},
		}

		self.dispatch(&mut *state, &queue);

		Ok(())
	}

	fn open_channel(&self, connection: u64) -> Result<u64, TransportError> {
		let mut state = self.0.lock();

		if !state.connections.contains(&connection) {
			return Err(TransportError::ConnectionClosed);
		}

		let id = state.next_id();

		state.channels.insert(id, ChannelState { connection, prefetch: 0, unacked: 0 });

		Ok(id)
	}

	fn with_channel<T>(
		&self,
		channel: u64,
		f: impl FnOnce(&Self, &mut BrokerState, u64) -> Result<T, TransportError>,
	) -> Result<T, TransportError> {
		let mut state = self.0.lock();
		let connection =
			state.channels.get(&channel).ok_or(TransportError::ChannelClosed)?.connection;

		f(self, &mut *state, connection)
	}
}
impl Debug for MemoryBroker {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		let state = self.0.lock();

		f.debug_struct("MemoryBroker")
			.field("connections", &state.connections.len())
			.field("queues", &state.queues.len())
			.field("stats", &state.stats)
			.finish()
	}
}
impl Connector for MemoryBroker {
	fn connect(&self) -> TransportFuture<'_, Arc<dyn Connection>> {
		let broker = self.clone();

		Box::pin(async move {
			let mut state = broker.0.lock();

			if state.unavailable {
				return Err(TransportError::broker(
					"connect",
					std::io::Error::new(
						std::io::ErrorKind::ConnectionRefused,
						"memory broker is unavailable",
					),
				));
			}

			let id = state.next_id();

			state.connections.insert(id);
			drop(state);

			Ok(Arc::new(MemoryConnection { broker: broker.clone(), id }) as Arc<dyn Connection>)
		})
	}
}

#[derive(Default)]
struct BrokerState {
	unavailable: bool,
	next_id: u64,
	next_delivery_tag: u64,
	connections: HashSet<u64>,
	channels: HashMap<u64, ChannelState>,
	queues: HashMap<String, QueueState>,
	unacked: HashMap<u64, Unacked>,
	dead_letters: HashMap<String, Vec<StoredMessage>>,
	stats: MemoryStats,
}
impl BrokerState {
	fn next_id(&mut self) -> u64 {
		self.next_id += 1;

		self.next_id
	}

	fn requeue(&mut self, unacked: Unacked) {
		if let Some(queue) = self.queues.get_mut(&unacked.queue) {
			let mut message = unacked.message;

			message.redelivered = true;
			queue.ready.push_front(message);
		}
	}

	fn remove_queue(&mut self, name: &str) -> bool {
		if self.queues.remove(name).is_some() {
			self.stats.queues_deleted += 1;

			return true;
		}

		false
	}

	fn auto_delete_if_idle(&mut self, name: &str) {
		let idle = self
			.queues
			.get(name)
			.is_some_and(|q| q.options.auto_delete && q.had_consumer && q.consumers.is_empty());

		if idle {
			self.remove_queue(name);
		}
	}

	fn check_access(&self, name: &str, connection: u64) -> Result<(), TransportError> {
		match self.queues.get(name) {
			Some(q) if q.owner.is_some_and(|owner| owner != connection) =>
				Err(TransportError::ResourceLocked { queue: name.to_owned() }),
			_ => Ok(()),
		}
	}
}

struct ChannelState {
	connection: u64,
	prefetch: u16,
	unacked: usize,
}
impl ChannelState {
	fn has_capacity(&self) -> bool {
		self.prefetch == 0 || self.unacked < usize::from(self.prefetch)
	}
}

struct QueueState {
	options: QueueOptions,
	owner: Option<u64>,
	ready: VecDeque<StoredMessage>,
	consumers: Vec<ConsumerState>,
	cursor: usize,
	had_consumer: bool,
}

struct ConsumerState {
	tag: String,
	channel: u64,
	sender: DeliverySender,
}

#[derive(Clone)]
struct StoredMessage {
	body: Vec<u8>,
	correlation_id: Option<String>,
	reply_to: Option<String>,
	timestamp: Option<OffsetDateTime>,
	redelivered: bool,
}

struct Unacked {
	queue: String,
	channel: u64,
	message: StoredMessage,
}

struct MemoryConnection {
	broker: MemoryBroker,
	id: u64,
}
impl Connection for MemoryConnection {
	fn create_channel(&self) -> TransportFuture<'_, Arc<dyn Channel>> {
		Box::pin(async move {
			let id = self.broker.open_channel(self.id)?;

			Ok(Arc::new(MemoryChannel { broker: self.broker.clone(), id }) as Arc<dyn Channel>)
		})
	}

	fn is_open(&self) -> bool {
		self.broker.0.lock().connections.contains(&self.id)
	}

	fn close(&self) -> TransportFuture<'_, ()> {
		Box::pin(async move {
			let mut state = self.broker.0.lock();

			self.broker.close_connection(&mut *state, self.id);

			Ok(())
		})
	}
}

struct MemoryChannel {
	broker: MemoryBroker,
	id: u64,
}
impl Channel for MemoryChannel {
	fn declare_queue<'a>(
		&'a self,
		name: &'a str,
		options: QueueOptions,
	) -> TransportFuture<'a, String> {
		Box::pin(async move {
			self.broker.with_channel(self.id, |_, state, connection| {
				let name = if name.is_empty() {
					format!("amq.gen-{}", uuid::Uuid::new_v4())
				} else {
					name.to_owned()
				};

				state.check_access(&name, connection)?;

				if !state.queues.contains_key(&name) {
					state.stats.queues_declared += 1;
					state.queues.insert(
						name.clone(),
						QueueState {
							options,
							owner: options.exclusive.then_some(connection),
							ready: VecDeque::new(),
							consumers: Vec::new(),
							cursor: 0,
							had_consumer: false,
						},
					);
				}

				Ok(name)
			})
		})
	}

	fn publish<'a>(
		&'a self,
		exchange: &'a str,
		routing_key: &'a str,
		message: OutboundMessage,
	) -> TransportFuture<'a, ()> {
		Box::pin(async move {
			self.broker.with_channel(self.id, |broker, state, _| {
				if exchange != DEFAULT_EXCHANGE {
					return Err(TransportError::ExchangeNotFound { exchange: exchange.to_owned() });
				}

				state.stats.published += 1;

				let Some(queue) = state.queues.get_mut(routing_key) else {
					state.stats.unroutable += 1;

					return Ok(());
				};

				queue.ready.push_back(StoredMessage {
					body: message.body,
					correlation_id: message.correlation_id,
					reply_to: message.reply_to,
					timestamp: message.timestamp,
					redelivered: false,
				});
				broker.dispatch(state, routing_key);

				Ok(())
			})
		})
	}

	fn consume<'a>(
		&'a self,
		queue: &'a str,
		consumer_tag: &'a str,
	) -> TransportFuture<'a, DeliveryStream> {
		Box::pin(async move {
			let receiver = self.broker.with_channel(self.id, |broker, state, connection| {
				state.check_access(queue, connection)?;

				let (sender, receiver) = mpsc::unbounded_channel();
				let q = state
					.queues
					.get_mut(queue)
					.ok_or_else(|| TransportError::QueueNotFound { queue: queue.to_owned() })?;

				q.consumers.push(ConsumerState {
					tag: consumer_tag.to_owned(),
					channel: self.id,
					sender,
				});
				q.had_consumer = true;
				broker.dispatch(state, queue);

				Ok(receiver)
			})?;
			let stream = futures_util::stream::unfold(receiver, |mut receiver| async move {
				receiver.recv().await.map(|item| (item, receiver))
			});

			Ok(Box::pin(stream) as DeliveryStream)
		})
	}

	fn cancel<'a>(&'a self, consumer_tag: &'a str) -> TransportFuture<'a, ()> {
		Box::pin(async move {
			self.broker.with_channel(self.id, |_, state, _| {
				let owner = state.queues.iter_mut().find_map(|(name, q)| {
					let index = q
						.consumers
						.iter()
						.position(|c| c.channel == self.id && c.tag == consumer_tag)?;

					q.consumers.remove(index);
					q.cursor = 0;

					Some(name.clone())
				});

				if let Some(name) = owner {
					state.auto_delete_if_idle(&name);
				}

				Ok(())
			})
		})
	}

	fn delete_queue<'a>(&'a self, queue: &'a str) -> TransportFuture<'a, ()> {
		Box::pin(async move {
			self.broker.with_channel(self.id, |_, state, connection| {
				state.check_access(queue, connection)?;
				state.remove_queue(queue);

				Ok(())
			})
		})
	}

	fn set_prefetch(&self, count: u16) -> TransportFuture<'_, ()> {
		Box::pin(async move {
			self.broker.with_channel(self.id, |broker, state, _| {
				if let Some(ch) = state.channels.get_mut(&self.id) {
					ch.prefetch = count;
				}

				let names = state.queues.keys().cloned().collect::<Vec<_>>();

				for name in names {
					broker.dispatch(state, &name);
				}

				Ok(())
			})
		})
	}

	fn close(&self) -> TransportFuture<'_, ()> {
		Box::pin(async move {
			let mut state = self.broker.0.lock();

			self.broker.close_channel(&mut *state, self.id);

			Ok(())
		})
	}
}

struct MemoryAcker {
	broker: MemoryBroker,
	delivery_tag: u64,
}
impl Acker for MemoryAcker {
	fn ack(&self) -> TransportFuture<'_, ()> {
		Box::pin(async move { self.broker.settle(self.delivery_tag, None) })
	}

	fn nack(&self, requeue: bool) -> TransportFuture<'_, ()> {
		Box::pin(async move { self.broker.settle(self.delivery_tag, Some(requeue)) })
	}
}
