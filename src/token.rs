//! Token-service facade over the RPC client.

// self
use crate::{
	_prelude::*,
	config::Config,
	error::ConfigError,
	id::{ClientId, Subdomain},
	rpc::RpcClient,
};

/// Redacted token secret wrapper keeping sensitive material out of logs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenSecret(String);
impl TokenSecret {
	/// Wraps a new secret string.
	pub fn new(value: impl Into<String>) -> Self {
		Self(value.into())
	}

	/// Returns the inner token value. Callers must avoid logging this string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}
impl AsRef<str> for TokenSecret {
	fn as_ref(&self) -> &str {
		self.expose()
	}
}
impl Debug for TokenSecret {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_tuple("TokenSecret").field(&"<redacted>").finish()
	}
}
impl Display for TokenSecret {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str("<redacted>")
	}
}

/// Access/refresh token pair issued by the token service.
///
/// Both secrets are guaranteed non-empty.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TokenReply")]
pub struct TokenPair {
	access_token: TokenSecret,
	refresh_token: TokenSecret,
}
impl TokenPair {
	/// Builds a pair, rejecting empty secrets.
	pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Result<Self> {
		Self::try_from(TokenReply {
			access_token: Some(TokenSecret::new(access_token)),
			refresh_token: Some(TokenSecret::new(refresh_token)),
		})
	}

	/// Bearer token for CRM calls.
	pub fn access_token(&self) -> &TokenSecret {
		&self.access_token
	}

	/// Token the issuing service uses to mint the next pair.
	pub fn refresh_token(&self) -> &TokenSecret {
		&self.refresh_token
	}
}
impl TryFrom<TokenReply> for TokenPair {
	type Error = Error;

	fn try_from(reply: TokenReply) -> Result<Self> {
		let access_token = reply
			.access_token
			.filter(|secret| !secret.is_empty())
			.ok_or(Error::InvalidTokenPair { reason: "access_token is missing or empty" })?;
		let refresh_token = reply
			.refresh_token
			.filter(|secret| !secret.is_empty())
			.ok_or(Error::InvalidTokenPair { reason: "refresh_token is missing or empty" })?;

		Ok(Self { access_token, refresh_token })
	}
}

/// Request body sent to the token queue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRequest {
	/// Integration asking for tokens.
	pub client_id: ClientId,
	/// CRM account the tokens are for.
	pub subdomain: Subdomain,
}

/// Reply body as the token service sends it, before validation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenReply {
	/// Access token, if present.
	pub access_token: Option<TokenSecret>,
	/// Refresh token, if present.
	pub refresh_token: Option<TokenSecret>,
}

/// Fetches CRM tokens from the token service over the broker.
#[derive(Clone, Debug)]
pub struct TokenClient {
	rpc: RpcClient,
	client_id: ClientId,
	queue: String,
	timeout: Duration,
}
impl TokenClient {
	/// Work queue the token service listens on.
	pub const DEFAULT_QUEUE: &'static str = "tokens_get_user";
	/// How long a fetch waits for the token service.
	pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

	/// Creates a client that identifies itself as `client_id`.
	pub fn new(rpc: RpcClient, client_id: ClientId) -> Self {
		Self {
			rpc,
			client_id,
			queue: Self::DEFAULT_QUEUE.to_owned(),
			timeout: Self::DEFAULT_TIMEOUT,
		}
	}

	/// Builds a client from the queue, timeout, and client id in `config`.
	pub fn from_config(rpc: RpcClient, config: &Config) -> Result<Self, ConfigError> {
		Ok(Self::new(rpc, config.client_id()?)
			.with_queue(config.token_queue.clone())
			.with_timeout(config.rpc_timeout()))
	}

	/// Overrides the token queue.
	pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
		self.queue = queue.into();

		self
	}

	/// Overrides the reply deadline.
	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = timeout;

		self
	}

	/// Asks the token service for a fresh pair for `subdomain`.
	///
	/// # Errors
	///
	/// Everything [`RpcClient::call`] reports, plus [`Error::InvalidTokenPair`] when the reply
	/// lacks either token.
	pub async fn fetch_tokens(&self, subdomain: &Subdomain) -> Result<TokenPair> {
		let request =
			TokenRequest { client_id: self.client_id.clone(), subdomain: subdomain.clone() };
		let reply = self.rpc.call::<_, TokenReply>(&self.queue, &request, self.timeout).await?;

		TokenPair::try_from(reply).inspect_err(|e| {
			tracing::warn!(%subdomain, error = %e, "Token service replied without usable tokens.");
		})
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn secret_formatters_redact() {
		let secret = TokenSecret::new("super-secret");

		assert_eq!(format!("{secret:?}"), "TokenSecret(\"<redacted>\")");
		assert_eq!(format!("{secret}"), "<redacted>");
	}

	#[test]
	fn pair_requires_both_tokens() {
		let pair = TokenPair::new("tok1", "ref1").expect("Complete pair should be valid.");

		assert_eq!(pair.access_token().expose(), "tok1");
		assert_eq!(pair.refresh_token().expose(), "ref1");
		assert!(!format!("{pair:?}").contains("tok1"));
		assert!(matches!(TokenPair::new("", "ref1"), Err(Error::InvalidTokenPair { .. })));
		assert!(matches!(TokenPair::new("tok1", ""), Err(Error::InvalidTokenPair { .. })));
		assert!(TokenPair::new("tok1", " ").is_ok(), "Only empty secrets are rejected.");
	}

	#[test]
	fn reply_decoding_tolerates_missing_fields() {
		let reply: TokenReply =
			serde_json::from_str(r#"{"access_token":"tok1","refresh_token":null}"#)
				.expect("Reply with a null field should decode.");
		let err = TokenPair::try_from(reply).expect_err("Null refresh token must be rejected.");

		assert_eq!(err.status_code(), 500);
		assert!(err.to_string().contains("refresh_token"));
	}

	#[test]
	fn pair_serializes_plain_strings() {
		let pair = TokenPair::new("tok1", "ref1").expect("Complete pair should be valid.");
		let json = serde_json::to_string(&pair).expect("Pair should serialize.");

		assert_eq!(json, r#"{"access_token":"tok1","refresh_token":"ref1"}"#);
		assert!(
			serde_json::from_str::<TokenPair>(r#"{"access_token":"","refresh_token":"r"}"#).is_err()
		);
	}

	#[test]
	fn request_matches_wire_shape() {
		let request = TokenRequest {
			client_id: ClientId::new("abc").expect("Client fixture should be valid."),
			subdomain: Subdomain::new("foo").expect("Subdomain fixture should be valid."),
		};

		assert_eq!(
			serde_json::to_value(&request).expect("Request should serialize."),
			serde_json::json!({ "client_id": "abc", "subdomain": "foo" })
		);
	}
}
