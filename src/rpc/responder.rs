//! Worker side of the exchange: consume a work queue, run a handler, reply when asked to.

// std
use std::marker::PhantomData;
// crates.io
use futures_util::StreamExt;
use tokio::task::JoinHandle;
// self
use crate::{
	_prelude::*,
	error::{BoxError, TransportError},
	id::CorrelationId,
	obs::{self, RpcOutcome, RpcRole, RpcSpan},
	payload,
	transport::{
		Channel, ConnectionPool, DEFAULT_EXCHANGE, Delivery, DeliveryStream, OutboundMessage,
		QueueHandle, QueueOptions,
	},
};

/// Error type handlers report failures with.
pub type HandlerError = BoxError;

/// Boxed future returned by [`Handler::handle`].
pub type HandlerFuture<'a, T> =
	Pin<Box<dyn Future<Output = Result<T, HandlerError>> + 'a + Send>>;

/// Business logic plugged into a [`Responder`].
pub trait Handler
where
	Self: 'static + Send + Sync,
{
	/// Decoded work message.
	type Request: DeserializeOwned + Send;
	/// Value published back to the requester.
	type Response: Serialize + Send;

	/// Processes one request; may perform further I/O.
	fn handle(&self, request: Self::Request) -> HandlerFuture<'_, Self::Response>;
}

/// [`Handler`] backed by an async closure; build it with [`handler_fn`].
pub struct HandlerFn<F, Req, Resp> {
	f: F,
	_marker: PhantomData<fn(Req) -> Resp>,
}
impl<F, Fut, Req, Resp> Handler for HandlerFn<F, Req, Resp>
where
	F: 'static + Send + Sync + Fn(Req) -> Fut,
	Fut: 'static + Send + Future<Output = Result<Resp, HandlerError>>,
	Req: 'static + DeserializeOwned + Send,
	Resp: 'static + Serialize + Send,
{
	type Request = Req;
	type Response = Resp;

	fn handle(&self, request: Req) -> HandlerFuture<'_, Resp> {
		Box::pin((self.f)(request))
	}
}
impl<F, Req, Resp> Debug for HandlerFn<F, Req, Resp> {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str("HandlerFn(..)")
	}
}

/// Wraps an async closure as a [`Handler`].
pub fn handler_fn<F, Fut, Req, Resp>(f: F) -> HandlerFn<F, Req, Resp>
where
	F: 'static + Send + Sync + Fn(Req) -> Fut,
	Fut: 'static + Send + Future<Output = Result<Resp, HandlerError>>,
	Req: 'static + DeserializeOwned + Send,
	Resp: 'static + Serialize + Send,
{
	HandlerFn { f, _marker: PhantomData }
}

/// What happens to a message whose handler or reply publish failed.
///
/// Messages that cannot be decoded are always dead-lettered; redelivering them cannot help.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailurePolicy {
	/// Reject without requeue so the broker drops or dead-letters the message.
	#[default]
	DeadLetter,
	/// Reject with requeue; the message is delivered again (at-least-once).
	Requeue,
}
impl FailurePolicy {
	fn requeue(self) -> bool {
		matches!(self, Self::Requeue)
	}
}

/// Long-lived consumer of a durable work queue.
///
/// Messages are processed one at a time. Several responders may consume the same queue from
/// separate channels; the broker hands each message to one of them.
pub struct Responder<H> {
	pool: Arc<ConnectionPool>,
	queue: String,
	handler: Arc<H>,
	policy: FailurePolicy,
	prefetch: u16,
}
impl<H> Responder<H>
where
	H: Handler,
{
	/// Default number of unacknowledged deliveries per worker.
	pub const DEFAULT_PREFETCH: u16 = 1;

	/// Creates a responder for `queue` backed by `handler`.
	pub fn new(pool: Arc<ConnectionPool>, queue: impl Into<String>, handler: Arc<H>) -> Self {
		Self {
			pool,
			queue: queue.into(),
			handler,
			policy: FailurePolicy::default(),
			prefetch: Self::DEFAULT_PREFETCH,
		}
	}

	/// Sets the failure policy applied to handler and reply failures.
	pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
		self.policy = policy;

		self
	}

	/// Sets the prefetch limit for the worker's channel.
	pub fn with_prefetch(mut self, prefetch: u16) -> Self {
		self.prefetch = prefetch;

		self
	}

	/// Work queue this responder consumes.
	pub fn queue(&self) -> &str {
		&self.queue
	}

	/// Runs until the connection cannot be re-established.
	pub async fn run(&self) -> Result<()> {
		self.run_until(std::future::pending()).await
	}

	/// Runs until `shutdown` resolves or the connection cannot be re-established.
	///
	/// A message already being processed when `shutdown` fires is finished and settled first.
	pub async fn run_until<S>(&self, shutdown: S) -> Result<()>
	where
		S: Future<Output = ()>,
	{
		let mut shutdown = std::pin::pin!(shutdown);

		tracing::info!(queue = %self.queue, "Responder started.");

		loop {
			match self.session(shutdown.as_mut()).await? {
				Session::Shutdown => break,
				Session::Detached => {
					tracing::warn!(queue = %self.queue, "Consumer detached; reattaching.");

					tokio::select! {
						biased;
						_ = shutdown.as_mut() => break,
						_ = tokio::time::sleep(self.pool.policy().initial_delay) => {},
					}
				},
			}
		}

		tracing::info!(queue = %self.queue, "Responder stopped.");

		Ok(())
	}

	/// Spawns [`run_until`](Self::run_until) onto the current runtime.
	pub fn spawn<S>(self, shutdown: S) -> JoinHandle<Result<()>>
	where
		S: 'static + Send + Future<Output = ()>,
	{
		tokio::spawn(async move { self.run_until(shutdown).await })
	}

	async fn session<S>(&self, mut shutdown: Pin<&mut S>) -> Result<Session>
	where
		S: Future<Output = ()>,
	{
		let consumer_tag = format!("{}.worker-{}", self.queue, uuid::Uuid::new_v4());
		let (queue, mut deliveries) = match self.attach(&consumer_tag).await {
			Ok(attached) => attached,
			Err(e @ Error::Transport(TransportError::ReconnectExhausted { .. })) => return Err(e),
			Err(e) if self.pool.is_closed() => return Err(e),
			Err(e) if !self.pool.is_connected() => {
				tracing::warn!(error = %e, "Failed to attach while the broker is unreachable.");

				return Ok(Session::Detached);
			},
			Err(e) => return Err(e),
		};
		let channel = queue.channel();

		tracing::debug!(queue = queue.name(), %consumer_tag, "Consuming work queue.");

		loop {
			let next = tokio::select! {
				biased;
				_ = shutdown.as_mut() => {
					self.detach(channel.as_ref(), &consumer_tag).await;

					return Ok(Session::Shutdown);
				},
				next = deliveries.next() => next,
			};

			match next {
				Some(Ok(delivery)) => self.process(channel.as_ref(), delivery).await,
				Some(Err(e)) => {
					tracing::warn!(error = %e, "Work queue consumer failed.");

					break;
				},
				None => break,
			}
		}

		self.detach(channel.as_ref(), &consumer_tag).await;

		Ok(Session::Detached)
	}

	async fn attach(&self, consumer_tag: &str) -> Result<(QueueHandle, DeliveryStream)> {
		let channel = self.pool.open_channel().await?;

		channel.set_prefetch(self.prefetch).await?;

		let queue = QueueHandle::declare(channel, &self.queue, QueueOptions::durable()).await?;
		let deliveries = queue.consume(consumer_tag).await?;

		Ok((queue, deliveries))
	}

	async fn detach(&self, channel: &dyn Channel, consumer_tag: &str) {
		if let Err(e) = channel.cancel(consumer_tag).await {
			tracing::debug!(error = %e, "Failed to cancel work queue consumer.");
		}
		if let Err(e) = channel.close().await {
			tracing::debug!(error = %e, "Failed to close worker channel.");
		}
	}

	async fn process(&self, channel: &dyn Channel, delivery: Delivery) {
		let span = RpcSpan::new(RpcRole::Responder, &self.queue);

		if let Some(id) = &delivery.correlation_id {
			span.record_correlation_id(&CorrelationId::from_wire(id.as_str()));
		}

		span.instrument(self.settle(channel, delivery)).await;
	}

	async fn settle(&self, channel: &dyn Channel, delivery: Delivery) {
		obs::record_rpc_outcome(RpcRole::Responder, RpcOutcome::Attempt);

		let request = match payload::decode::<H::Request>(&delivery.body) {
			Ok(request) => request,
			Err(e) => {
				tracing::warn!(
					error = %e,
					redelivered = delivery.redelivered,
					"Dropping malformed work message."
				);

				if let Err(e) = delivery.nack(false).await {
					tracing::warn!(error = %e, "Failed to reject malformed work message.");
				}

				obs::record_rpc_outcome(RpcRole::Responder, RpcOutcome::Failure);

				return;
			},
		};
		let reply_to = delivery.reply_to.as_deref().filter(|s| !s.is_empty());
		let correlation_id = delivery.correlation_id.as_deref().filter(|s| !s.is_empty());

		let answered = self.answer(channel, request, reply_to, correlation_id).await;

		match answered {
			Ok(()) => {
				if let Err(e) = delivery.ack().await {
					tracing::warn!(error = %e, "Failed to acknowledge work message.");
				}

				obs::record_rpc_outcome(RpcRole::Responder, RpcOutcome::Success);
			},
			Err(e) => {
				let requeue = self.policy.requeue();

				tracing::error!(error = %e, requeue, "Work message failed.");

				if let Err(e) = delivery.nack(requeue).await {
					tracing::warn!(error = %e, "Failed to reject work message.");
				}

				obs::record_rpc_outcome(RpcRole::Responder, RpcOutcome::Failure);
			},
		}
	}

	async fn answer(
		&self,
		channel: &dyn Channel,
		request: H::Request,
		reply_to: Option<&str>,
		correlation_id: Option<&str>,
	) -> Result<(), BoxError> {
		let response = self.handler.handle(request).await?;
		let (Some(reply_to), Some(correlation_id)) = (reply_to, correlation_id) else {
			tracing::debug!("Work message carries no reply metadata; not replying.");

			return Ok(());
		};
		let body = payload::encode(&response)?;
		let message = OutboundMessage::json(body).with_correlation_id(correlation_id);

		channel.publish(DEFAULT_EXCHANGE, reply_to, message).await?;
		tracing::debug!(reply_to, "Reply published.");

		Ok(())
	}
}
impl<H> Debug for Responder<H> {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("Responder")
			.field("queue", &self.queue)
			.field("policy", &self.policy)
			.field("prefetch", &self.prefetch)
			.finish_non_exhaustive()
	}
}

enum Session {
	Shutdown,
	Detached,
}
