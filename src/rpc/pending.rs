//! Table of calls waiting for their reply, keyed by correlation id.

// crates.io
use tokio::sync::oneshot::{self, Receiver, Sender};
// self
use crate::{_prelude::*, id::CorrelationId};

/// Result of routing a reply body into the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Dispatch {
	/// The waiting call received the body.
	Delivered,
	/// No call is waiting on that correlation id.
	Unmatched,
}

/// Shared between every call of one [`RpcClient`](crate::rpc::RpcClient).
#[derive(Clone, Default)]
pub(crate) struct PendingReplies(Arc<Mutex<HashMap<CorrelationId, Sender<Vec<u8>>>>>);
impl PendingReplies {
	pub(crate) fn register(&self, id: CorrelationId) -> Receiver<Vec<u8>> {
		let (sender, receiver) = oneshot::channel();

		self.0.lock().insert(id, sender);

		receiver
	}

	/// Hands `body` to the call registered under exactly `id`; first match wins.
	pub(crate) fn dispatch(&self, id: &str, body: Vec<u8>) -> Dispatch {
		let sender = self.0.lock().remove(id);

		match sender {
			Some(sender) => match sender.send(body) {
				Ok(()) => Dispatch::Delivered,
				Err(_) => Dispatch::Unmatched,
			},
			None => Dispatch::Unmatched,
		}
	}

	pub(crate) fn forget(&self, id: &str) {
		self.0.lock().remove(id);
	}

	pub(crate) fn len(&self) -> usize {
		self.0.lock().len()
	}
}
impl Debug for PendingReplies {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_tuple("PendingReplies").field(&self.len()).finish()
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[tokio::test]
	async fn dispatch_matches_exact_id_once() {
		let pending = PendingReplies::default();
		let id = CorrelationId::from_wire("abc-123");
		let receiver = pending.register(id);

		assert_eq!(pending.dispatch("abc-12", b"decoy".to_vec()), Dispatch::Unmatched);
		assert_eq!(pending.dispatch("abc-1234", b"decoy".to_vec()), Dispatch::Unmatched);
		assert_eq!(pending.dispatch("abc-123", b"reply".to_vec()), Dispatch::Delivered);
		assert_eq!(pending.dispatch("abc-123", b"late".to_vec()), Dispatch::Unmatched);
		assert_eq!(receiver.await.expect("Reply should be delivered."), b"reply");
		assert_eq!(pending.len(), 0);
	}

	#[test]
	fn forget_drops_waiting_entry() {
		let pending = PendingReplies::default();
		let receiver = pending.register(CorrelationId::from_wire("gone"));

		pending.forget("gone");

		assert_eq!(pending.len(), 0);
		drop(receiver);
		assert_eq!(pending.dispatch("gone", Vec::new()), Dispatch::Unmatched);
	}

	#[test]
	fn abandoned_receiver_is_unmatched() {
		let pending = PendingReplies::default();

		drop(pending.register(CorrelationId::from_wire("dropped")));

		assert_eq!(pending.dispatch("dropped", Vec::new()), Dispatch::Unmatched);
	}
}
