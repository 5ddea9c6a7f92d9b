//! Correlated request/reply over the broker.
//!
//! [`RpcClient`] issues one request per call on a private reply queue and waits for the
//! reply carrying the same correlation id. [`Responder`] is the long-lived worker on the other
//! side of a work queue.

pub mod client;
pub mod responder;

mod pending;

pub use client::RpcClient;
pub use responder::{
	FailurePolicy, Handler, HandlerError, HandlerFn, HandlerFuture, Responder, handler_fn,
};
