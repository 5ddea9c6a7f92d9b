//! Explicitly owned broker connection with transparent reconnect.

// crates.io
use rand::Rng;
// self
use crate::{
	_prelude::*,
	error::TransportError,
	transport::{Channel, Connection, Connector},
};

/// Exponential backoff applied while re-establishing a lost connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
	/// Delay before the second attempt; doubles on each failure.
	pub initial_delay: Duration,
	/// Upper bound for a single delay.
	pub max_delay: Duration,
	/// Give up after this many failed attempts; `None` retries forever.
	pub max_attempts: Option<u32>,
}
impl ReconnectPolicy {
	/// Jittered delay to wait after failed attempt number `attempt` (1-based).
	///
	/// The result lies in `[d / 2, d]` where `d` is the capped exponential delay.
	pub fn delay_for(&self, attempt: u32) -> Duration {
		let exponent = attempt.saturating_sub(1).min(31);
		let capped = self.initial_delay.saturating_mul(1_u32 << exponent).min(self.max_delay);
		let ceiling = u64::try_from(capped.as_millis()).unwrap_or(u64::MAX);

		Duration::from_millis(rand::rng().random_range(ceiling / 2..=ceiling))
	}

	fn exhausted(&self, attempts: u32) -> bool {
		self.max_attempts.is_some_and(|max| attempts >= max)
	}
}
impl Default for ReconnectPolicy {
	fn default() -> Self {
		Self {
			initial_delay: Duration::from_millis(100),
			max_delay: Duration::from_secs(10),
			max_attempts: None,
		}
	}
}

/// Owns the shared broker connection; clients and responders open channels through it.
///
/// The initial [`connect`](Self::connect) fails fast. Afterwards a lost connection is
/// re-established lazily by the next caller that needs a channel; concurrent callers share a
/// single reconnect.
pub struct ConnectionPool {
	connector: Arc<dyn Connector>,
	policy: ReconnectPolicy,
	current: RwLock<Option<Arc<dyn Connection>>>,
	reconnect: AsyncMutex<()>,
	generation: AtomicU64,
	closed: AtomicBool,
}
impl ConnectionPool {
	/// Connects once and wraps the connection.
	pub async fn connect(
		connector: Arc<dyn Connector>,
		policy: ReconnectPolicy,
	) -> Result<Arc<Self>, TransportError> {
		let connection = connector.connect().await?;

		tracing::info!("Broker connection established.");

		Ok(Arc::new(Self {
			connector,
			policy,
			current: RwLock::new(Some(connection)),
			reconnect: AsyncMutex::new(()),
			generation: AtomicU64::new(1),
			closed: AtomicBool::new(false),
		}))
	}

	/// Returns the live connection, reconnecting first if it was lost.
	pub async fn connection(&self) -> Result<Arc<dyn Connection>, TransportError> {
		if let Some(connection) = self.live()? {
			return Ok(connection);
		}

		let _guard = self.reconnect.lock().await;

		// Another caller may have finished reconnecting while this one waited.
		if let Some(connection) = self.live()? {
			return Ok(connection);
		}

		self.reconnect_locked().await
	}

	/// Opens a fresh channel on the live connection.
	pub async fn open_channel(&self) -> Result<Arc<dyn Channel>, TransportError> {
		self.connection().await?.create_channel().await
	}

	/// Whether the current connection is open.
	pub fn is_connected(&self) -> bool {
		matches!(self.live(), Ok(Some(_)))
	}

	/// Whether [`close`](Self::close) was called.
	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::Acquire)
	}

	/// Number of connections established so far, starting at 1.
	pub fn generation(&self) -> u64 {
		self.generation.load(Ordering::Acquire)
	}

	/// Reconnect policy in effect.
	pub fn policy(&self) -> ReconnectPolicy {
		self.policy
	}

	/// Closes the connection; subsequent calls fail with [`TransportError::ConnectionClosed`].
	pub async fn close(&self) -> Result<(), TransportError> {
		self.closed.store(true, Ordering::Release);

		let current = self.current.write().take();

		match current {
			Some(connection) if connection.is_open() => connection.close().await,
			_ => Ok(()),
		}
	}

	fn live(&self) -> Result<Option<Arc<dyn Connection>>, TransportError> {
		if self.is_closed() {
			return Err(TransportError::ConnectionClosed);
		}

		Ok(self.current.read().as_ref().filter(|connection| connection.is_open()).cloned())
	}

	async fn reconnect_locked(&self) -> Result<Arc<dyn Connection>, TransportError> {
		let mut attempts = 0;

		loop {
			if self.is_closed() {
				return Err(TransportError::ConnectionClosed);
			}

			attempts += 1;

			match self.connector.connect().await {
				Ok(connection) => {
					*self.current.write() = Some(connection.clone());

					let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;

					tracing::info!(attempts, generation, "Broker connection re-established.");

					return Ok(connection);
				},
				Err(e) => {
					tracing::warn!(attempts, error = %e, "Broker reconnect attempt failed.");

					if self.policy.exhausted(attempts) {
						return Err(TransportError::ReconnectExhausted { attempts });
					}

					tokio::time::sleep(self.policy.delay_for(attempts)).await;
				},
			}
		}
	}
}
impl Debug for ConnectionPool {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("ConnectionPool")
			.field("policy", &self.policy)
			.field("generation", &self.generation())
			.field("closed", &self.closed.load(Ordering::Relaxed))
			.finish_non_exhaustive()
	}
}
