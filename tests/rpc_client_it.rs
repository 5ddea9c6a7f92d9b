// crates.io
use futures_util::StreamExt;
use serde_json::{Value, json};
// self
use token_exchange_rpc::{
	_preludet::*,
	rpc::RpcClient,
	transport::{
		Channel, Connection, ConnectionPool, Connector, DEFAULT_EXCHANGE, Delivery,
		DeliveryStream, MemoryBroker, OutboundMessage, QueueOptions, TransportFuture,
	},
};

const WORK_QUEUE: &str = "rpc_it_work";

async fn setup() -> (MemoryBroker, Arc<ConnectionPool>, RpcClient) {
	let broker = MemoryBroker::new();
	let pool = memory_pool(&broker).await.expect("Memory pool should connect.");

	declare_work_queue(&pool, WORK_QUEUE).await.expect("Work queue should be declared.");

	let client = RpcClient::new(pool.clone());

	(broker, pool, client)
}

async fn take_requests(pool: &ConnectionPool, count: usize) -> (Arc<dyn Channel>, Vec<Delivery>) {
	let channel = pool.open_channel().await.expect("Worker channel should open.");
	let mut deliveries =
		channel.consume(WORK_QUEUE, "manual-worker").await.expect("Worker should consume.");
	let mut taken = Vec::with_capacity(count);

	while taken.len() < count {
		let delivery = deliveries
			.next()
			.await
			.expect("Worker stream should stay open.")
			.expect("Delivery should be valid.");

		taken.push(delivery);
	}

	channel.cancel("manual-worker").await.expect("Worker consumer should cancel.");

	(channel, taken)
}

async fn reply(channel: &dyn Channel, delivery: &Delivery, correlation_id: &str, body: &Value) {
	let reply_to = delivery.reply_to.as_deref().expect("Request should carry reply_to.");
	let body = serde_json::to_vec(body).expect("Reply body should encode.");
	let message = OutboundMessage::json(body).with_correlation_id(correlation_id);

	channel.publish(DEFAULT_EXCHANGE, reply_to, message).await.expect("Reply should publish.");
}

fn only_work_queue_left(broker: &MemoryBroker) -> bool {
	broker.queue_names() == [WORK_QUEUE]
}

/// Memory broker whose channels stall on selected operations.
#[derive(Clone, Copy, Default)]
struct Stalls {
	publish: Duration,
	cancel: Duration,
}

struct StallingBroker {
	broker: MemoryBroker,
	stalls: Stalls,
}
impl Connector for StallingBroker {
	fn connect(&self) -> TransportFuture<'_, Arc<dyn Connection>> {
		Box::pin(async move {
			let inner = self.broker.connect().await?;

			Ok(Arc::new(StallingConnection { inner, stalls: self.stalls }) as Arc<dyn Connection>)
		})
	}
}

struct StallingConnection {
	inner: Arc<dyn Connection>,
	stalls: Stalls,
}
impl Connection for StallingConnection {
	fn create_channel(&self) -> TransportFuture<'_, Arc<dyn Channel>> {
		Box::pin(async move {
			let inner = self.inner.create_channel().await?;

			Ok(Arc::new(StallingChannel { inner, stalls: self.stalls }) as Arc<dyn Channel>)
		})
	}

	fn is_open(&self) -> bool {
		self.inner.is_open()
	}

	fn close(&self) -> TransportFuture<'_, ()> {
		self.inner.close()
	}
}

struct StallingChannel {
	inner: Arc<dyn Channel>,
	stalls: Stalls,
}
impl Channel for StallingChannel {
	fn declare_queue<'a>(
		&'a self,
		name: &'a str,
		options: QueueOptions,
	) -> TransportFuture<'a, String> {
		self.inner.declare_queue(name, options)
	}

	fn publish<'a>(
		&'a self,
		exchange: &'a str,
		routing_key: &'a str,
		message: OutboundMessage,
	) -> TransportFuture<'a, ()> {
		Box::pin(async move {
			tokio::time::sleep(self.stalls.publish).await;

			self.inner.publish(exchange, routing_key, message).await
		})
	}

	fn consume<'a>(
		&'a self,
		queue: &'a str,
		consumer_tag: &'a str,
	) -> TransportFuture<'a, DeliveryStream> {
		self.inner.consume(queue, consumer_tag)
	}

	fn cancel<'a>(&'a self, consumer_tag: &'a str) -> TransportFuture<'a, ()> {
		Box::pin(async move {
			tokio::time::sleep(self.stalls.cancel).await;

			self.inner.cancel(consumer_tag).await
		})
	}

	fn delete_queue<'a>(&'a self, queue: &'a str) -> TransportFuture<'a, ()> {
		self.inner.delete_queue(queue)
	}

	fn set_prefetch(&self, count: u16) -> TransportFuture<'_, ()> {
		self.inner.set_prefetch(count)
	}

	fn close(&self) -> TransportFuture<'_, ()> {
		self.inner.close()
	}
}

async fn stalling_setup(stalls: Stalls) -> (MemoryBroker, RpcClient) {
	let broker = MemoryBroker::new();
	let connector: Arc<dyn Connector> = Arc::new(StallingBroker { broker: broker.clone(), stalls });
	let pool = ConnectionPool::connect(connector, fast_reconnect_policy())
		.await
		.expect("Stalling pool should connect.");

	declare_work_queue(&pool, WORK_QUEUE).await.expect("Work queue should be declared.");

	(broker, RpcClient::new(pool))
}

#[tokio::test]
async fn reply_is_returned_and_reply_queue_released() {
	let (broker, pool, client) = setup().await;
	let before = broker.stats();
	let request = json!({ "question": "ping" });
	let call = client.call::<_, Value>(WORK_QUEUE, &request, Duration::from_secs(5));
	let worker = async {
		let (channel, mut deliveries) = take_requests(&pool, 1).await;
		let delivery = deliveries.remove(0);
		let id = delivery.correlation_id.clone().expect("Request should carry a correlation id.");

		assert_eq!(
			delivery.reply_to.as_deref(),
			Some(format!("reply_queue_{id}").as_str()),
			"Reply queue should be named after the correlation id."
		);

		reply(channel.as_ref(), &delivery, &id, &json!({ "answer": "pong" })).await;
		delivery.ack().await.expect("Request should be acknowledged.");
	};
	let (reply, ()) = tokio::join!(call, worker);
	let after = broker.stats();

	assert_eq!(reply.expect("Call should succeed."), json!({ "answer": "pong" }));
	assert_eq!(after.queues_declared - before.queues_declared, 1);
	assert_eq!(after.queues_deleted - before.queues_deleted, 1);
	assert!(eventually(|| only_work_queue_left(&broker)).await);
	assert_eq!(client.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn missing_reply_times_out_after_the_deadline() {
	let (broker, _pool, client) = setup().await;
	let started = tokio::time::Instant::now();
	let err = client
		.call::<_, Value>(WORK_QUEUE, &json!({ "question": "ping" }), Duration::from_secs(2))
		.await
		.expect_err("Call without a responder should time out.");

	assert!(started.elapsed() >= Duration::from_secs(2));
	assert!(matches!(err, Error::DeadlineExceeded { ref queue, .. } if queue == WORK_QUEUE));
	assert_eq!(err.status_code(), 504);
	assert!(only_work_queue_left(&broker), "Reply queue must be gone after a timeout.");
	assert_eq!(broker.ready_count(WORK_QUEUE), 1, "The request itself stays queued.");
	assert_eq!(client.in_flight(), 0);
}

#[tokio::test]
async fn interleaved_replies_reach_their_own_callers() {
	let (broker, pool, client) = setup().await;
	let one = json!({ "n": 1 });
	let two = json!({ "n": 2 });
	let first = client.call::<_, Value>(WORK_QUEUE, &one, Duration::from_secs(5));
	let second = client.call::<_, Value>(WORK_QUEUE, &two, Duration::from_secs(5));
	let worker = async {
		let (channel, deliveries) = take_requests(&pool, 2).await;

		for delivery in deliveries.into_iter().rev() {
			let request: Value =
				serde_json::from_slice(&delivery.body).expect("Request body should be JSON.");
			let id =
				delivery.correlation_id.clone().expect("Request should carry a correlation id.");

			reply(channel.as_ref(), &delivery, &id, &json!({ "echo": request["n"] })).await;
			delivery.ack().await.expect("Request should be acknowledged.");
		}
	};
	let (first, second, ()) = tokio::join!(first, second, worker);

	assert_eq!(first.expect("First call should succeed."), json!({ "echo": 1 }));
	assert_eq!(second.expect("Second call should succeed."), json!({ "echo": 2 }));
	assert!(eventually(|| only_work_queue_left(&broker)).await);
}

#[tokio::test]
async fn correlation_ids_must_match_exactly() {
	let (_broker, pool, client) = setup().await;
	let request = json!({ "question": "ping" });
	let call = client.call::<_, Value>(WORK_QUEUE, &request, Duration::from_secs(5));
	let worker = async {
		let (channel, mut deliveries) = take_requests(&pool, 1).await;
		let delivery = deliveries.remove(0);
		let id = delivery.correlation_id.clone().expect("Request should carry a correlation id.");

		reply(channel.as_ref(), &delivery, &id[..8], &json!({ "answer": "prefix" })).await;
		reply(channel.as_ref(), &delivery, &format!("{id}0"), &json!({ "answer": "suffix" })).await;
		reply(channel.as_ref(), &delivery, &id, &json!({ "answer": "exact" })).await;
		delivery.ack().await.expect("Request should be acknowledged.");
	};
	let (reply, ()) = tokio::join!(call, worker);

	assert_eq!(reply.expect("Call should succeed."), json!({ "answer": "exact" }));
}

#[tokio::test]
async fn undecodable_reply_is_a_payload_error() {
	let (broker, pool, client) = setup().await;
	let request = json!({ "question": "ping" });
	let call = client.call::<_, Vec<u32>>(WORK_QUEUE, &request, Duration::from_secs(5));
	let worker = async {
		let (channel, mut deliveries) = take_requests(&pool, 1).await;
		let delivery = deliveries.remove(0);
		let id = delivery.correlation_id.clone().expect("Request should carry a correlation id.");

		reply(channel.as_ref(), &delivery, &id, &json!({ "not": "a list" })).await;
		delivery.ack().await.expect("Request should be acknowledged.");
	};
	let (reply, ()) = tokio::join!(call, worker);
	let err = reply.expect_err("Mismatched reply should fail to decode.");

	assert!(matches!(err, Error::MalformedPayload(_)));
	assert_eq!(err.status_code(), 500);
	assert!(eventually(|| only_work_queue_left(&broker)).await);
}

#[tokio::test]
async fn connection_loss_while_waiting_is_reported() {
	let (broker, _pool, client) = setup().await;
	let call = tokio::spawn({
		let client = client.clone();

		async move {
			client
				.call::<_, Value>(WORK_QUEUE, &json!({ "n": 1 }), Duration::from_secs(30))
				.await
		}
	});

	assert!(eventually(|| broker.queue_names().len() == 2).await, "Reply queue should appear.");

	broker.disconnect_all();

	let err = call
		.await
		.expect("Call task should not panic.")
		.expect_err("Call should fail when the connection drops.");

	assert!(matches!(err, Error::TransportLost { .. }));
	assert_eq!(err.status_code(), 502);
	assert!(only_work_queue_left(&broker), "Exclusive reply queue goes away with its connection.");
	assert_eq!(client.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn dropping_a_call_releases_its_reply_queue() {
	let (broker, _pool, client) = setup().await;
	let request = json!({ "question": "ping" });
	let abandoned = tokio::time::timeout(
		Duration::from_millis(10),
		client.call::<_, Value>(WORK_QUEUE, &request, Duration::from_secs(60)),
	)
	.await;

	assert!(abandoned.is_err(), "Outer timeout should drop the call first.");
	assert!(eventually(|| only_work_queue_left(&broker)).await);
	assert_eq!(client.in_flight(), 0);
}

#[tokio::test]
async fn unroutable_destination_times_out_without_leaking() {
	let (broker, _pool, client) = setup().await;
	let err = client
		.call::<_, Value>("no_such_queue", &json!({}), Duration::from_millis(20))
		.await
		.expect_err("Nobody consumes an undeclared queue.");

	assert!(matches!(err, Error::DeadlineExceeded { .. }));
	assert_eq!(broker.stats().unroutable, 1);
	assert!(only_work_queue_left(&broker));
}

#[tokio::test(start_paused = true)]
async fn abandoning_a_call_mid_release_still_releases_its_reply_queue() {
	let stalls = Stalls { cancel: Duration::from_millis(50), ..Stalls::default() };
	let (broker, client) = stalling_setup(stalls).await;
	let request = json!({ "question": "ping" });
	let abandoned = tokio::time::timeout(
		Duration::from_millis(30),
		client.call::<_, Value>(WORK_QUEUE, &request, Duration::from_millis(10)),
	)
	.await;

	assert!(abandoned.is_err(), "Call should be dropped while its consumer is being cancelled.");

	tokio::time::sleep(Duration::from_secs(5)).await;

	assert!(only_work_queue_left(&broker), "Reply queue must not outlive an abandoned call.");
	assert_eq!(client.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn stalled_publish_is_bounded_by_the_deadline() {
	let stalls = Stalls { publish: Duration::from_secs(60), ..Stalls::default() };
	let (broker, client) = stalling_setup(stalls).await;
	let started = tokio::time::Instant::now();
	let err = client
		.call::<_, Value>(WORK_QUEUE, &json!({ "question": "ping" }), Duration::from_secs(1))
		.await
		.expect_err("A publish that never completes should hit the deadline.");

	assert!(matches!(err, Error::DeadlineExceeded { .. }));
	assert!(started.elapsed() < Duration::from_secs(60));

	tokio::time::sleep(Duration::from_secs(5)).await;

	assert!(only_work_queue_left(&broker));
	assert_eq!(broker.ready_count(WORK_QUEUE), 0, "The stalled request never reached the queue.");
}
