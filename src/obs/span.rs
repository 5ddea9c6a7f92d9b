// crates.io
use tracing::{Span, field, instrument::Instrumented};
// self
use crate::{_prelude::*, id::CorrelationId, obs::RpcRole};

/// A span builder shared by RPC clients and responders.
#[derive(Clone, Debug)]
pub struct RpcSpan {
	span: Span,
}
impl RpcSpan {
	/// Creates a new span tagged with the role and the queue it works against.
	pub fn new(role: RpcRole, queue: &str) -> Self {
		let span = tracing::info_span!(
			"token_exchange.rpc",
			role = role.as_str(),
			queue,
			correlation_id = field::Empty
		);

		Self { span }
	}

	/// Attaches the correlation id once it is known.
	pub fn record_correlation_id(&self, id: &CorrelationId) {
		self.span.record("correlation_id", id.as_str());
	}

	/// Instruments an async block without holding a guard across `.await` points.
	pub fn instrument<Fut>(&self, fut: Fut) -> Instrumented<Fut>
	where
		Fut: Future,
	{
		use tracing::Instrument;

		fut.instrument(self.span.clone())
	}
}
