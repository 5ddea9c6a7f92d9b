//! Message-queue RPC token exchange: correlated AMQP request/reply over private reply queues,
//! long-lived responders with explicit failure policies, and a CRM fetch layer that spends the
//! tokens.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod config;
#[cfg(feature = "reqwest")] pub mod crm;
pub mod error;
pub mod id;
pub mod obs;
pub mod payload;
pub mod rpc;
pub mod token;
pub mod transport;
#[doc(hidden)]
pub mod _preludet {
	//! Convenience re-exports and helpers shared by unit and integration tests.

	pub use crate::_prelude::*;

	// self
	use crate::{
		error::TransportError,
		transport::{
			Connector, ConnectionPool, DEFAULT_EXCHANGE, MemoryBroker, OutboundMessage,
			QueueOptions, ReconnectPolicy,
		},
	};

	/// Reconnect policy with millisecond delays so reconnect tests finish quickly.
	pub fn fast_reconnect_policy() -> ReconnectPolicy {
		ReconnectPolicy {
			initial_delay: Duration::from_millis(1),
			max_delay: Duration::from_millis(5),
			max_attempts: Some(5),
		}
	}

	/// Opens a [`ConnectionPool`] against the provided in-memory broker.
	pub async fn memory_pool(broker: &MemoryBroker) -> Result<Arc<ConnectionPool>, TransportError> {
		let connector: Arc<dyn Connector> = Arc::new(broker.clone());

		ConnectionPool::connect(connector, fast_reconnect_policy()).await
	}

	/// Declares a durable work queue the way a deployed broker would have it pre-provisioned.
	pub async fn declare_work_queue(
		pool: &ConnectionPool,
		queue: &str,
	) -> Result<(), TransportError> {
		let channel = pool.open_channel().await?;

		channel.declare_queue(queue, QueueOptions::durable()).await?;
		channel.close().await
	}

	/// Publishes raw bytes to `queue` on the default exchange with optional reply metadata.
	pub async fn publish_raw(
		pool: &ConnectionPool,
		queue: &str,
		body: impl Into<Vec<u8>>,
		correlation_id: Option<&str>,
		reply_to: Option<&str>,
	) -> Result<(), TransportError> {
		let channel = pool.open_channel().await?;
		let mut message = OutboundMessage::json(body.into());

		if let Some(id) = correlation_id {
			message = message.with_correlation_id(id);
		}
		if let Some(address) = reply_to {
			message = message.with_reply_to(address);
		}

		channel.publish(DEFAULT_EXCHANGE, queue, message).await?;
		channel.close().await
	}

	/// Yields to the scheduler until `condition` holds; returns `false` if it never does.
	pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
		for _ in 0..1_000 {
			if condition() {
				return true;
			}

			tokio::task::yield_now().await;
		}

		condition()
	}
}

mod _prelude {
	pub use std::{
		collections::{HashMap, HashSet, VecDeque},
		error::Error as StdError,
		fmt::{Debug, Display, Formatter, Result as FmtResult},
		future::Future,
		pin::Pin,
		str::FromStr,
		sync::{
			Arc,
			atomic::{AtomicBool, AtomicU64, Ordering},
		},
		time::Duration,
	};

	pub use async_lock::Mutex as AsyncMutex;
	pub use parking_lot::{Mutex, RwLock};
	#[cfg(feature = "reqwest")]
	pub use reqwest::{Client as ReqwestClient, Error as ReqwestError};
	pub use serde::{Deserialize, Serialize, de::DeserializeOwned};
	pub use thiserror::Error as ThisError;
	pub use time::OffsetDateTime;
	pub use url::Url;

	pub use crate::error::{Error, Result};
}

#[cfg(feature = "lapin")] pub use lapin;
#[cfg(feature = "reqwest")] pub use reqwest;
pub use url;
#[cfg(test)]
use {color_eyre as _, dotenvy as _, httpmock as _, tracing_subscriber as _};
