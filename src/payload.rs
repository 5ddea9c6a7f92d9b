//! JSON wire encoding shared by requests, replies, and work messages.

// self
use crate::{_prelude::*, error::PayloadError};

/// Content type stamped on every published message.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Serializes `value` into a JSON message body.
pub fn encode<T>(value: &T) -> Result<Vec<u8>, PayloadError>
where
	T: ?Sized + Serialize,
{
	serde_json::to_vec(value).map_err(PayloadError::Encode)
}

/// Deserializes a JSON message body, reporting the failing path on mismatch.
pub fn decode<T>(body: &[u8]) -> Result<T, PayloadError>
where
	T: DeserializeOwned,
{
	let mut de = serde_json::Deserializer::from_slice(body);
	let value = serde_path_to_error::deserialize(&mut de)
		.map_err(|source| PayloadError::Decode { source })?;

	de.end().map_err(PayloadError::TrailingData)?;

	Ok(value)
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[derive(Debug, PartialEq, Deserialize)]
	struct Pair {
		access_token: String,
		refresh_token: String,
	}

	#[test]
	fn decode_reports_failing_path() {
		let err = decode::<Pair>(br#"{"access_token":"tok1","refresh_token":7}"#)
			.expect_err("Numeric refresh token should fail to decode.");

		assert_eq!(err.to_string(), "Payload is malformed at `refresh_token`.");
	}

	#[test]
	fn decode_rejects_non_json_and_trailing_bytes() {
		assert!(matches!(decode::<Pair>(b"not json"), Err(PayloadError::Decode { .. })));
		assert!(matches!(
			decode::<Pair>(br#"{"access_token":"a","refresh_token":"b"} x"#),
			Err(PayloadError::TrailingData(_))
		));
	}

	#[test]
	fn encode_produces_compact_json() {
		let body = encode(&serde_json::json!({ "client_id": "abc", "subdomain": "foo" }))
			.expect("JSON value should encode.");
		let pair: Pair = decode(br#"{"access_token":"tok1","refresh_token":"ref1"}"#)
			.expect("Valid pair should decode.");

		assert_eq!(body, br#"{"client_id":"abc","subdomain":"foo"}"#);
		assert_eq!(pair, Pair { access_token: "tok1".into(), refresh_token: "ref1".into() });
	}
}
