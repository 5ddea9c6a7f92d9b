//! Stand-in token service: answers every token request with a freshly minted pair until Ctrl-C.
//!
//! ```sh
//! cargo run --example token_responder
//! ```

// std
use std::sync::Arc;
// crates.io
use clap::Parser;
use color_eyre::Result;
use tracing_subscriber::EnvFilter;
// self
use token_exchange_rpc::{
	config::Config,
	rpc::{HandlerError, Responder, handler_fn},
	token::{TokenReply, TokenRequest, TokenSecret},
	transport::{ConnectionPool, LapinConnector},
};

#[tokio::main]
async fn main() -> Result<()> {
	color_eyre::install()?;

	let _ = dotenvy::dotenv();
	let config = Config::parse();

	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
		)
		.init();

	let connector = LapinConnector::new(config.connection_url()?);
	let pool = ConnectionPool::connect(Arc::new(connector), config.reconnect_policy()).await?;
	let handler = handler_fn(|request: TokenRequest| async move {
		tracing::info!(
			client_id = %request.client_id,
			subdomain = %request.subdomain,
			"Minting tokens."
		);

		Ok::<_, HandlerError>(TokenReply {
			access_token: Some(TokenSecret::new(format!("access-{}", uuid::Uuid::new_v4()))),
			refresh_token: Some(TokenSecret::new(format!("refresh-{}", uuid::Uuid::new_v4()))),
		})
	});
	let responder = Responder::new(pool.clone(), config.token_queue.clone(), Arc::new(handler))
		.with_prefetch(config.responder_prefetch);

	responder
		.run_until(async {
			let _ = tokio::signal::ctrl_c().await;
		})
		.await?;
	pool.close().await?;

	Ok(())
}
