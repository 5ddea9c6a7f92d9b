//! Spends a token pair on the CRM fetch layer, using a local mock server in place of the CRM.

// crates.io
use color_eyre::Result;
use httpmock::prelude::*;
use url::Url;
// self
use token_exchange_rpc::{
	crm::{CrmClient, LeadFilter},
	id::Subdomain,
	token::TokenPair,
};

#[tokio::main]
async fn main() -> Result<()> {
	color_eyre::install()?;

	let server = MockServer::start_async().await;
	let leads_mock = server
		.mock_async(|when, then| {
			when.method(GET)
				.path("/api/v4/leads")
				.header("authorization", "Bearer demo-access")
				.query_param("filter[pipeline_id]", "3");
			then.status(200).header("content-type", "application/hal+json").body(
				"{\"_embedded\":{\"leads\":[{\"id\":1,\"name\":\"Website order\",\"price\":1200,\
				 \"pipeline_id\":3,\"status_id\":142,\"_embedded\":{\"contacts\":[{\"id\":7,\
				 \"is_main\":true}]}}]}}",
			);
		})
		.await;
	let contact_mock = server
		.mock_async(|when, then| {
			when.method(GET).path("/api/v4/contacts/7");
			then.status(200)
				.header("content-type", "application/hal+json")
				.body("{\"id\":7,\"name\":\"Jane Doe\",\"responsible_user_id\":42}");
		})
		.await;
	let pair = TokenPair::new("demo-access", "demo-refresh")?;
	let account = Subdomain::new("acme")?;
	let crm = CrmClient::new().with_base_url(Url::parse(&server.url("/api/v4"))?);
	let leads = crm.leads(&account, pair.access_token(), &LeadFilter::pipeline(3)).await?;

	for lead in &leads {
		println!("Lead {} ({}): price {:?}.", lead.id, lead.name, lead.price);

		if let Some(contact_id) = lead.main_contact_id() {
			let contact = crm.contact(&account, pair.access_token(), contact_id).await?;

			println!("  Main contact: {} (owner {:?}).", contact.name, contact.responsible_user_id);
		}
	}

	leads_mock.assert_async().await;
	contact_mock.assert_async().await;

	Ok(())
}
