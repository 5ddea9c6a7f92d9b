//! Asks the token service for a CRM token pair over RabbitMQ.
//!
//! Broker settings and `CLIENT_ID` come from flags, the environment, or a `.env` file. Run
//! `token_responder` against the same broker first, then:
//!
//! ```sh
//! CLIENT_ID=demo cargo run --example request_tokens -- --subdomain acme
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
	id::Subdomain,
	rpc::RpcClient,
	token::TokenClient,
	transport::{ConnectionPool, LapinConnector},
};

#[derive(Debug, Parser)]
struct Cli {
	#[command(flatten)]
	config: Config,

	/// CRM account to fetch tokens for.
	#[arg(long, env = "SUBDOMAIN")]
	subdomain: String,
}

#[tokio::main]
async fn main() -> Result<()> {
	color_eyre::install()?;

	let _ = dotenvy::dotenv();
	let Cli { config, subdomain } = Cli::parse();

	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
		)
		.init();

	let connector = LapinConnector::new(config.connection_url()?);
	let pool = ConnectionPool::connect(Arc::new(connector), config.reconnect_policy()).await?;
	let tokens = TokenClient::from_config(RpcClient::new(pool.clone()), &config)?;
	let pair = tokens.fetch_tokens(&Subdomain::new(subdomain)?).await;

	pool.close().await?;

	let pair = pair?;

	println!("Access token: {}.", pair.access_token().expose());
	println!("Refresh token: {}.", pair.refresh_token().expose());

	Ok(())
}
