//! Observability helpers for the token exchange.
//!
//! # Feature Flags
//!
//! - Spans named `token_exchange.rpc` carry the `role` (client or responder), `queue`, and
//!   `correlation_id` fields. They are always emitted; install a subscriber to see them.
//! - Enable `metrics` to increment the `token_exchange_rpc_total` counter for every
//!   attempt/success/timeout/failure, labeled by `role` + `outcome`.

mod record;
mod span;

pub use record::*;
pub use span::*;

// self
use crate::_prelude::*;

/// Side of the exchange an event was observed on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RpcRole {
	/// Requester awaiting a correlated reply.
	Client,
	/// Worker consuming requests from a work queue.
	Responder,
}
impl RpcRole {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			RpcRole::Client => "client",
			RpcRole::Responder => "responder",
		}
	}
}
impl Display for RpcRole {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Outcome labels recorded for each call or processed message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RpcOutcome {
	/// A call was issued or a delivery was picked up.
	Attempt,
	/// The call returned a reply or the delivery was acknowledged.
	Success,
	/// No matching reply arrived before the deadline.
	Timeout,
	/// Any other failure surfaced to the caller or applied to the delivery.
	Failure,
}
impl RpcOutcome {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			RpcOutcome::Attempt => "attempt",
			RpcOutcome::Success => "success",
			RpcOutcome::Timeout => "timeout",
			RpcOutcome::Failure => "failure",
		}
	}
}
impl Display for RpcOutcome {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}
