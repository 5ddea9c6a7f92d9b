//! Strongly typed identifiers carried through the token exchange.

// std
use std::{borrow::Borrow, ops::Deref};
// self
use crate::_prelude::*;

macro_rules! def_id {
	($name:ident, $doc:literal, $kind:literal, $validate:ident) => {
		#[doc = $doc]
		#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
		#[serde(try_from = "String", into = "String")]
		pub struct $name(String);
		impl $name {
			/// Creates a new identifier after validation.
			pub fn new(value: impl AsRef<str>) -> Result<Self, IdentifierError> {
				let view = value.as_ref();

				$validate($kind, view)?;

				Ok(Self(view.to_owned()))
			}
		}
		impl Deref for $name {
			type Target = str;

			fn deref(&self) -> &Self::Target {
				&self.0
			}
		}
		impl AsRef<str> for $name {
			fn as_ref(&self) -> &str {
				&self.0
			}
		}
		impl From<$name> for String {
			fn from(value: $name) -> Self {
				value.0
			}
		}
		impl TryFrom<String> for $name {
			type Error = IdentifierError;

			fn try_from(value: String) -> Result<Self, Self::Error> {
				$validate($kind, &value)?;

				Ok(Self(value))
			}
		}
		impl Borrow<str> for $name {
			fn borrow(&self) -> &str {
				&self.0
			}
		}
		impl Debug for $name {
			fn fmt(&self, f: &mut Formatter) -> FmtResult {
				write!(f, concat!($kind, "({})"), self.0)
			}
		}
		impl Display for $name {
			fn fmt(&self, f: &mut Formatter) -> FmtResult {
				f.write_str(&self.0)
			}
		}
		impl FromStr for $name {
			type Err = IdentifierError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				Self::new(s)
			}
		}
	};
}

const IDENTIFIER_MAX_LEN: usize = 128;
const REPLY_QUEUE_PREFIX: &str = "reply_queue_";

/// Error returned when identifier validation fails.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, ThisError)]
pub enum IdentifierError {
	/// The identifier was empty.
	#[error("{kind} identifier cannot be empty.")]
	Empty {
		/// Kind of identifier (client, subdomain).
		kind: &'static str,
	},
	/// The identifier contains whitespace characters.
	#[error("{kind} identifier contains whitespace.")]
	ContainsWhitespace {
		/// Kind of identifier (client, subdomain).
		kind: &'static str,
	},
	/// The identifier exceeded the allowed character count.
	#[error("{kind} identifier exceeds {max} characters.")]
	TooLong {
		/// Kind of identifier (client, subdomain).
		kind: &'static str,
		/// Maximum permitted character count.
		max: usize,
	},
	/// The identifier contains a character outside its permitted alphabet.
	#[error("{kind} identifier contains invalid character {character:?}.")]
	InvalidCharacter {
		/// Kind of identifier (client, subdomain).
		kind: &'static str,
		/// First offending character.
		character: char,
	},
}

def_id! { ClientId, "Integration requesting CRM tokens.", "Client", validate_view }
def_id! { Subdomain, "CRM account the tokens are issued for.", "Subdomain", validate_subdomain }

fn validate_view(kind: &'static str, view: &str) -> Result<(), IdentifierError> {
	if view.is_empty() {
		return Err(IdentifierError::Empty { kind });
	}
	if view.chars().any(char::is_whitespace) {
		return Err(IdentifierError::ContainsWhitespace { kind });
	}
	if view.len() > IDENTIFIER_MAX_LEN {
		return Err(IdentifierError::TooLong { kind, max: IDENTIFIER_MAX_LEN });
	}

	Ok(())
}

fn validate_subdomain(kind: &'static str, view: &str) -> Result<(), IdentifierError> {
	validate_view(kind, view)?;

	match view.chars().find(|c| !(c.is_ascii_alphanumeric() || *c == '-')) {
		Some(character) => Err(IdentifierError::InvalidCharacter { kind, character }),
		None => Ok(()),
	}
}

/// Opaque token pairing a request with its reply.
///
/// Matching is exact string equality; the responder echoes the value untouched.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);
impl CorrelationId {
	/// Generates a fresh random (UUID v4) correlation id.
	pub fn generate() -> Self {
		Self(uuid::Uuid::new_v4().to_string())
	}

	/// Wraps a correlation id read from a delivered message.
	pub fn from_wire(value: impl Into<String>) -> Self {
		Self(value.into())
	}

	/// Returns the wire representation.
	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// Private reply queue name owned by the request carrying this id.
	pub fn reply_address(&self) -> ReplyAddress {
		ReplyAddress(format!("{REPLY_QUEUE_PREFIX}{}", self.0))
	}
}
impl Borrow<str> for CorrelationId {
	fn borrow(&self) -> &str {
		&self.0
	}
}
impl Debug for CorrelationId {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		write!(f, "CorrelationId({})", self.0)
	}
}
impl Display for CorrelationId {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(&self.0)
	}
}

/// Name of the exclusive queue a single request receives its reply on.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ReplyAddress(String);
impl ReplyAddress {
	/// Returns the queue name.
	pub fn as_str(&self) -> &str {
		&self.0
	}
}
impl AsRef<str> for ReplyAddress {
	fn as_ref(&self) -> &str {
		&self.0
	}
}
impl Display for ReplyAddress {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(&self.0)
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn identifiers_reject_whitespace_and_empty() {
		assert!(ClientId::new(" client-1").is_err(), "Leading whitespace must be rejected.");
		assert!(ClientId::new("client-1 ").is_err(), "Trailing whitespace must be rejected.");
		assert_eq!(ClientId::new(""), Err(IdentifierError::Empty { kind: "Client" }));

		let client = ClientId::new("abc").expect("Client fixture should be considered valid.");

		assert_eq!(client.as_ref(), "abc");
	}

	#[test]
	fn subdomain_alphabet_is_restricted() {
		Subdomain::new("foo-bar42").expect("Hyphenated subdomain should be valid.");

		assert_eq!(
			Subdomain::new("foo.evil.com"),
			Err(IdentifierError::InvalidCharacter { kind: "Subdomain", character: '.' })
		);
		assert!(Subdomain::new("foo/bar").is_err());
		assert!(ClientId::new("client.with.dots").is_ok(), "Client ids allow dots.");
	}

	#[test]
	fn serde_enforces_validation() {
		let subdomain: Subdomain =
			serde_json::from_str("\"foo\"").expect("Subdomain should deserialize successfully.");

		assert_eq!(subdomain.as_ref(), "foo");
		assert!(serde_json::from_str::<Subdomain>("\"with space\"").is_err());
		assert!(serde_json::from_str::<ClientId>("\"\"").is_err());
	}

	#[test]
	fn length_limit_applies() {
		ClientId::new("a".repeat(IDENTIFIER_MAX_LEN)).expect("Exact length should succeed.");

		assert!(ClientId::new("a".repeat(IDENTIFIER_MAX_LEN + 1)).is_err());
	}

	#[test]
	fn correlation_ids_are_unique_and_name_their_reply_queue() {
		let first = CorrelationId::generate();
		let second = CorrelationId::generate();

		assert_ne!(first, second);
		assert_eq!(first.as_str().len(), 36);
		assert_eq!(first.reply_address().as_str(), format!("reply_queue_{first}"));
	}

	#[test]
	fn correlation_lookup_is_exact() {
		let id = CorrelationId::from_wire("abc-123");
		let map: HashMap<CorrelationId, u8> = HashMap::from_iter([(id, 1_u8)]);

		assert_eq!(map.get("abc-123"), Some(&1));
		assert_eq!(map.get("abc-12"), None);
		assert_eq!(map.get("abc-1234"), None);
	}
}
