//! Requester side of the exchange.

// crates.io
use futures_util::StreamExt;
use tokio::sync::oneshot::Receiver;
// self
use crate::{
	_prelude::*,
	error::TransportError,
	id::{CorrelationId, ReplyAddress},
	obs::{self, RpcOutcome, RpcRole, RpcSpan},
	payload,
	rpc::pending::{Dispatch, PendingReplies},
	transport::{
		Channel, ConnectionPool, DEFAULT_EXCHANGE, Delivery, DeliveryStream, OutboundMessage,
		QueueOptions,
	},
};

/// Issues correlated requests over the shared connection.
///
/// Every call gets its own channel and its own exclusive, auto-delete reply queue named after
/// the call's correlation id. Replies read from any call's queue are routed through a table
/// shared by all calls of this client, so a reply can only ever complete the call whose
/// correlation id it carries. Cloning is cheap and clones share that table.
#[derive(Clone, Debug)]
pub struct RpcClient {
	pool: Arc<ConnectionPool>,
	pending: PendingReplies,
}
impl RpcClient {
	/// Creates a client on top of `pool`.
	pub fn new(pool: Arc<ConnectionPool>) -> Self {
		Self { pool, pending: PendingReplies::default() }
	}

	/// Connection pool the client opens channels on.
	pub fn pool(&self) -> &Arc<ConnectionPool> {
		&self.pool
	}

	/// Calls still waiting for their reply.
	pub fn in_flight(&self) -> usize {
		self.pending.len()
	}

	/// Publishes `request` to `destination` and waits up to `timeout` for the matching reply.
	///
	/// The reply queue, its consumer, and the call's channel are released on every exit path,
	/// including when the returned future is dropped. The call is never retried.
	///
	/// # Errors
	///
	/// - [`Error::DeadlineExceeded`] when no matching reply arrives in time.
	/// - [`Error::TransportLost`] when the connection drops while waiting.
	/// - [`Error::Transport`] when the channel, queue, or publish cannot be set up.
	/// - [`Error::MalformedPayload`] when the request cannot be encoded or the reply decoded.
	pub async fn call<Req, Resp>(
		&self,
		destination: &str,
		request: &Req,
		timeout: Duration,
	) -> Result<Resp>
	where
		Req: ?Sized + Serialize,
		Resp: DeserializeOwned,
	{
		let id = CorrelationId::generate();
		let span = RpcSpan::new(RpcRole::Client, destination);

		span.record_correlation_id(&id);
		obs::record_rpc_outcome(RpcRole::Client, RpcOutcome::Attempt);

		let result = span.instrument(self.call_once(destination, request, timeout, id)).await;
		let outcome = match &result {
			Ok(_) => RpcOutcome::Success,
			Err(Error::DeadlineExceeded { .. }) => RpcOutcome::Timeout,
			Err(_) => RpcOutcome::Failure,
		};

		obs::record_rpc_outcome(RpcRole::Client, outcome);

		result
	}

	async fn call_once<Req, Resp>(
		&self,
		destination: &str,
		request: &Req,
		timeout: Duration,
		id: CorrelationId,
	) -> Result<Resp>
	where
		Req: ?Sized + Serialize,
		Resp: DeserializeOwned,
	{
		let body = payload::encode(request)?;
		let channel = self.pool.open_channel().await?;
		let reply_queue = ReplyQueue::new(channel, id, self.pending.clone());
		let exchanged = self.exchange(&reply_queue, destination, body, timeout).await;

		reply_queue.release().await;

		Ok(payload::decode(&exchanged?)?)
	}

	async fn exchange(
		&self,
		reply_queue: &ReplyQueue,
		destination: &str,
		body: Vec<u8>,
		timeout: Duration,
	) -> Result<Vec<u8>> {
		// The deadline spans queue setup and publish as well as the wait.
		match tokio::time::timeout(timeout, self.round_trip(reply_queue, destination, body)).await {
			Ok(reply) => reply,
			Err(_) => {
				tracing::warn!(?timeout, "No reply received before the deadline.");

				Err(Error::DeadlineExceeded { queue: destination.to_owned(), timeout })
			},
		}
	}

	async fn round_trip(
		&self,
		reply_queue: &ReplyQueue,
		destination: &str,
		body: Vec<u8>,
	) -> Result<Vec<u8>> {
		let id = &reply_queue.correlation_id;
		let receiver = self.pending.register(id.clone());

		reply_queue.declare().await?;

		// Consume before publishing so a fast reply cannot be missed.
		let mut replies = reply_queue.consume().await?;
		let message = OutboundMessage::json(body)
			.with_correlation_id(id.as_str())
			.with_reply_to(reply_queue.address.as_str());

		reply_queue.channel.publish(DEFAULT_EXCHANGE, destination, message).await?;
		tracing::debug!("Request published; awaiting reply.");

		self.await_reply(id, receiver, &mut replies).await
	}

	async fn await_reply(
		&self,
		id: &CorrelationId,
		mut receiver: Receiver<Vec<u8>>,
		replies: &mut DeliveryStream,
	) -> Result<Vec<u8>> {
		let lost = || Error::TransportLost { correlation_id: id.to_string() };

		loop {
			tokio::select! {
				biased;
				reply = &mut receiver => return reply.map_err(|_| lost()),
				next = replies.next() => match next {
					Some(Ok(delivery)) => self.route(delivery).await,
					Some(Err(e)) => {
						tracing::warn!(error = %e, "Reply consumer failed.");

						return Err(lost());
					},
					None => {
						tracing::warn!("Reply consumer ended before a reply arrived.");

						return Err(lost());
					},
				},
			}
		}
	}

	async fn route(&self, mut delivery: Delivery) {
		let correlation_id = delivery.correlation_id.take();
		let body = std::mem::take(&mut delivery.body);

		if let Err(e) = delivery.ack().await {
			tracing::warn!(error = %e, "Failed to acknowledge reply.");
		}

		match correlation_id {
			Some(id) => match self.pending.dispatch(&id, body) {
				Dispatch::Delivered => tracing::debug!(reply_for = %id, "Reply matched."),
				Dispatch::Unmatched =>
					tracing::warn!(reply_for = %id, "Discarding reply for an unknown call."),
			},
			None => tracing::warn!("Discarding reply without a correlation id."),
		}
	}
}

/// Per-call reply queue; released exactly once, explicitly or on drop.
struct ReplyQueue {
	channel: Arc<dyn Channel>,
	correlation_id: CorrelationId,
	address: ReplyAddress,
	pending: PendingReplies,
	declared: AtomicBool,
	consuming: AtomicBool,
	released: AtomicBool,
}
impl ReplyQueue {
	fn new(
		channel: Arc<dyn Channel>,
		correlation_id: CorrelationId,
		pending: PendingReplies,
	) -> Self {
		let address = correlation_id.reply_address();

		Self {
			channel,
			correlation_id,
			address,
			pending,
			declared: AtomicBool::new(false),
			consuming: AtomicBool::new(false),
			released: AtomicBool::new(false),
		}
	}

	async fn declare(&self) -> Result<(), TransportError> {
		self.channel.declare_queue(self.address.as_str(), QueueOptions::exclusive_reply()).await?;
		self.declared.store(true, Ordering::Release);

		Ok(())
	}

	async fn consume(&self) -> Result<DeliveryStream, TransportError> {
		let stream = self.channel.consume(self.address.as_str(), self.address.as_str()).await?;

		self.consuming.store(true, Ordering::Release);

		Ok(stream)
	}

	/// Teardown runs on its own task, so dropping the caller mid-release cannot cut it short.
	async fn release(&self) {
		let Some(teardown) = self.take_teardown() else { return };

		if let Err(e) = tokio::spawn(teardown.run()).await {
			tracing::warn!(reply_queue = %self.address, error = %e, "Reply queue teardown failed.");
		}
	}

	fn take_teardown(&self) -> Option<Teardown> {
		if self.released.swap(true, Ordering::AcqRel) {
			return None;
		}

		self.pending.forget(self.correlation_id.as_str());

		Some(Teardown {
			channel: self.channel.clone(),
			address: self.address.clone(),
			consuming: self.consuming.load(Ordering::Acquire),
			declared: self.declared.load(Ordering::Acquire),
		})
	}
}
impl Drop for ReplyQueue {
	fn drop(&mut self) {
		let Some(teardown) = self.take_teardown() else { return };

		match tokio::runtime::Handle::try_current() {
			Ok(runtime) => {
				runtime.spawn(teardown.run());
			},
			Err(_) => tracing::warn!(
				reply_queue = %self.address,
				"No runtime left to release the reply queue; it goes away with the connection."
			),
		}
	}
}

struct Teardown {
	channel: Arc<dyn Channel>,
	address: ReplyAddress,
	consuming: bool,
	declared: bool,
}
impl Teardown {
	async fn run(self) {
		let queue = self.address.as_str();

		if self.consuming {
			if let Err(e) = self.channel.cancel(queue).await {
				tracing::debug!(reply_queue = queue, error = %e, "Failed to cancel consumer.");
			}
		}
		if self.declared {
			if let Err(e) = self.channel.delete_queue(queue).await {
				tracing::debug!(reply_queue = queue, error = %e, "Failed to delete reply queue.");
			}
		}
		if let Err(e) = self.channel.close().await {
			tracing::debug!(reply_queue = queue, error = %e, "Failed to close reply channel.");
		}

		tracing::debug!(reply_queue = queue, "Reply queue released.");
	}
}
