//! Crate-level error types shared across the transport, RPC, token, and CRM layers.

// self
use crate::{_prelude::*, id::IdentifierError};

/// Crate-wide result type alias returning [`Error`] by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Boxed error used where the concrete failure comes from a pluggable component.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Canonical error exposed by public APIs.
///
/// Callers that front the exchange with HTTP map each variant through
/// [`Error::status_code`].
#[derive(Debug, ThisError)]
pub enum Error {
	/// Broker transport failure (connect, channel, declare, publish, consume).
	#[error(transparent)]
	Transport(#[from] TransportError),
	/// The broker connection dropped while a call was waiting for its reply.
	#[error("Broker connection was lost while waiting for reply {correlation_id}.")]
	TransportLost {
		/// Correlation id of the abandoned call.
		correlation_id: String,
	},
	/// No matching reply arrived before the deadline.
	#[error("No response received from `{queue}` within {timeout:?}.")]
	DeadlineExceeded {
		/// Destination queue the request was published to.
		queue: String,
		/// Deadline the caller configured.
		timeout: Duration,
	},
	/// Request or reply payload could not be encoded or decoded.
	#[error(transparent)]
	MalformedPayload(#[from] PayloadError),
	/// A reply arrived but did not carry a usable token pair.
	#[error("Token service returned an invalid token pair: {reason}.")]
	InvalidTokenPair {
		/// Which part of the pair was unusable.
		reason: &'static str,
	},
	/// Local configuration problem.
	#[error(transparent)]
	Config(#[from] ConfigError),
	/// CRM fetch failure.
	#[cfg(feature = "reqwest")]
	#[error(transparent)]
	Crm(#[from] crate::crm::CrmError),
}
impl Error {
	/// Gateway-style HTTP status a fronting service should answer with.
	pub fn status_code(&self) -> u16 {
		match self {
			Self::Transport(_) | Self::TransportLost { .. } => 502,
			Self::DeadlineExceeded { .. } => 504,
			Self::MalformedPayload(_) | Self::InvalidTokenPair { .. } | Self::Config(_) => 500,
			#[cfg(feature = "reqwest")]
			Self::Crm(e) => e.status_code(),
		}
	}

	/// Whether a caller may reasonably retry the same request.
	///
	/// The exchange itself never retries.
	pub fn is_retryable(&self) -> bool {
		matches!(
			self,
			Self::Transport(_) | Self::TransportLost { .. } | Self::DeadlineExceeded { .. }
		)
	}
}

/// Configuration and validation failures.
#[derive(Debug, ThisError)]
pub enum ConfigError {
	/// Broker or CRM URL cannot be parsed.
	#[error("URL is invalid.")]
	InvalidUrl {
		/// Underlying parsing failure.
		#[source]
		source: url::ParseError,
	},
	/// Broker URL uses a scheme other than `amqp`/`amqps`.
	#[error("Broker URL scheme `{scheme}` is not supported; expected amqp or amqps.")]
	UnsupportedScheme {
		/// Scheme found in the URL.
		scheme: String,
	},
	/// Credentials cannot be embedded into the broker URL.
	#[error("Broker credentials cannot be embedded into the connection URL.")]
	InvalidCredentials,
	/// The virtual host cannot be embedded into the broker URL.
	#[error("Broker virtual host cannot be embedded into the connection URL.")]
	InvalidVhost,
	/// Identifier from configuration failed validation.
	#[error(transparent)]
	InvalidIdentifier(#[from] IdentifierError),
}
impl From<url::ParseError> for ConfigError {
	fn from(source: url::ParseError) -> Self {
		Self::InvalidUrl { source }
	}
}

/// Broker transport failures.
#[derive(Debug, ThisError)]
pub enum TransportError {
	/// The broker client reported a failure for the named operation.
	#[error("Broker operation `{operation}` failed.")]
	Broker {
		/// Operation label (connect, publish, consume, ...).
		operation: &'static str,
		/// Backend-specific failure.
		#[source]
		source: BoxError,
	},
	/// The connection is closed or was lost.
	#[error("Broker connection is closed.")]
	ConnectionClosed,
	/// The channel was closed before the operation ran.
	#[error("Broker channel is closed.")]
	ChannelClosed,
	/// The connection pool gave up re-establishing the connection.
	#[error("Gave up reconnecting to the broker after {attempts} attempts.")]
	ReconnectExhausted {
		/// Number of connection attempts made.
		attempts: u32,
	},
	/// The queue does not exist.
	#[error("Queue `{queue}` does not exist.")]
	QueueNotFound {
		/// Queue name.
		queue: String,
	},
	/// The queue is exclusive to another connection.
	#[error("Queue `{queue}` is locked by another connection.")]
	ResourceLocked {
		/// Queue name.
		queue: String,
	},
	/// The exchange does not exist.
	#[error("Exchange `{exchange}` does not exist.")]
	ExchangeNotFound {
		/// Exchange name.
		exchange: String,
	},
}
impl TransportError {
	/// Wraps a backend failure for `operation`.
	pub fn broker(
		operation: &'static str,
		src: impl 'static + Send + Sync + std::error::Error,
	) -> Self {
		Self::Broker { operation, source: Box::new(src) }
	}
}

/// JSON payload encode/decode failures.
#[derive(Debug, ThisError)]
pub enum PayloadError {
	/// The value could not be serialized.
	#[error("Payload could not be encoded as JSON.")]
	Encode(#[source] serde_json::Error),
	/// The bytes do not match the expected shape.
	#[error("Payload is malformed at `{}`.", .source.path())]
	Decode {
		/// Structured parsing failure with the offending path.
		#[source]
		source: serde_path_to_error::Error<serde_json::Error>,
	},
	/// A valid document was followed by extra bytes.
	#[error("Payload has trailing data after the JSON document.")]
	TrailingData(#[source] serde_json::Error),
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn gateway_status_follows_taxonomy() {
		let transport = Error::from(TransportError::ConnectionClosed);
		let lost = Error::TransportLost { correlation_id: "abc".into() };
		let deadline =
			Error::DeadlineExceeded { queue: "tokens".into(), timeout: Duration::from_secs(2) };
		let invalid = Error::InvalidTokenPair { reason: "access_token is empty" };

		assert_eq!(transport.status_code(), 502);
		assert_eq!(lost.status_code(), 502);
		assert_eq!(deadline.status_code(), 504);
		assert_eq!(invalid.status_code(), 500);
		assert!(deadline.is_retryable());
		assert!(!invalid.is_retryable());
	}

	#[test]
	fn deadline_message_names_the_queue() {
		let err =
			Error::DeadlineExceeded { queue: "tokens".into(), timeout: Duration::from_secs(2) };

		assert_eq!(err.to_string(), "No response received from `tokens` within 2s.");
	}

	#[test]
	fn broker_error_exposes_source() {
		let io = std::io::Error::other("socket reset");
		let err = Error::from(TransportError::broker("publish", io));
		let source = StdError::source(&err).expect("Transport error should expose its source.");

		assert_eq!(err.to_string(), "Broker operation `publish` failed.");
		assert_eq!(source.to_string(), "socket reset");
	}
}
