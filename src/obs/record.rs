// self
use crate::obs::{RpcOutcome, RpcRole};

/// Counter incremented once per [`RpcOutcome`] when the `metrics` feature is enabled.
pub const RPC_COUNTER: &str = "token_exchange_rpc_total";

/// Counts one call or delivery event, labeled by role and outcome.
///
/// Without the `metrics` feature (or without an installed recorder) only a trace event is left.
pub fn record_rpc_outcome(role: RpcRole, outcome: RpcOutcome) {
	tracing::trace!(%role, %outcome, "RPC outcome recorded.");

	#[cfg(feature = "metrics")]
	metrics::counter!(RPC_COUNTER, "role" => role.as_str(), "outcome" => outcome.as_str())
		.increment(1);
}
