//! CRM fetch layer: bearer-authenticated reads against the CRM REST API using issued tokens.

pub mod model;

pub use model::*;

// crates.io
use reqwest::{
	StatusCode,
	header::{ACCEPT, HeaderValue},
};
// self
use crate::{_prelude::*, error::PayloadError, id::Subdomain, payload, token::TokenSecret};

/// Root domain CRM accounts live under.
pub const DEFAULT_CRM_DOMAIN: &str = "amocrm.ru";

const UPSTREAM_BODY_LIMIT: usize = 512;

/// CRM request failures.
#[derive(Debug, ThisError)]
pub enum CrmError {
	/// The CRM could not be reached or the response body could not be read.
	#[error("CRM request failed before a response was received.")]
	Network {
		/// Underlying HTTP client failure.
		#[source]
		source: ReqwestError,
	},
	/// The requested resource does not exist.
	#[error("CRM {resource} was not found.")]
	NotFound {
		/// Resource path relative to the API root.
		resource: String,
	},
	/// The CRM answered with an unexpected status.
	#[error("CRM responded with status {status}: {body}")]
	Upstream {
		/// HTTP status returned by the CRM.
		status: u16,
		/// Response body, truncated.
		body: String,
	},
	/// The response body does not match the expected shape.
	#[error("CRM response could not be parsed.")]
	Parse {
		/// Decode failure with the offending path.
		#[source]
		source: PayloadError,
	},
	/// The request URL could not be built.
	#[error("CRM request URL is invalid.")]
	InvalidUrl {
		/// Underlying parsing failure.
		#[source]
		source: url::ParseError,
	},
}
impl CrmError {
	/// Gateway-style HTTP status a fronting service should answer with.
	pub fn status_code(&self) -> u16 {
		match self {
			Self::Network { .. } => 502,
			Self::NotFound { .. } => 404,
			Self::Upstream { status, .. } => *status,
			Self::Parse { .. } | Self::InvalidUrl { .. } => 500,
		}
	}
}
impl From<ReqwestError> for CrmError {
	fn from(source: ReqwestError) -> Self {
		Self::Network { source }
	}
}
impl From<PayloadError> for CrmError {
	fn from(source: PayloadError) -> Self {
		Self::Parse { source }
	}
}
impl From<url::ParseError> for CrmError {
	fn from(source: url::ParseError) -> Self {
		Self::InvalidUrl { source }
	}
}

/// Where API requests are sent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CrmEndpoint {
	/// `https://{subdomain}.{domain}/api/v4/` per account.
	Subdomain {
		/// Root domain accounts live under.
		domain: String,
	},
	/// One fixed API root for every account, used for proxies and test servers.
	Fixed(Url),
}
impl CrmEndpoint {
	/// API root for `subdomain`, always ending in `/`.
	pub fn base_url(&self, subdomain: &Subdomain) -> Result<Url, CrmError> {
		match self {
			Self::Subdomain { domain } =>
				Ok(Url::parse(&format!("https://{subdomain}.{domain}/api/v4/"))?),
			Self::Fixed(url) if url.path().ends_with('/') => Ok(url.clone()),
			Self::Fixed(url) => {
				let mut url = url.clone();
				let path = format!("{}/", url.path());

				url.set_path(&path);

				Ok(url)
			},
		}
	}
}
impl Default for CrmEndpoint {
	fn default() -> Self {
		Self::Subdomain { domain: DEFAULT_CRM_DOMAIN.to_owned() }
	}
}

/// Reads leads, contacts, and companies on behalf of an account.
#[derive(Clone, Debug, Default)]
pub struct CrmClient {
	http: ReqwestClient,
	endpoint: CrmEndpoint,
}
impl CrmClient {
	/// Creates a client against the default CRM domain.
	pub fn new() -> Self {
		Self::default()
	}

	/// Uses a preconfigured HTTP client (timeouts, proxies, TLS roots).
	pub fn with_client(mut self, http: ReqwestClient) -> Self {
		self.http = http;

		self
	}

	/// Resolves accounts under `domain` instead of the default.
	pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
		self.endpoint = CrmEndpoint::Subdomain { domain: domain.into() };

		self
	}

	/// Sends every request to `base_url` regardless of account.
	pub fn with_base_url(mut self, base_url: Url) -> Self {
		self.endpoint = CrmEndpoint::Fixed(base_url);

		self
	}

	/// Endpoint requests are resolved against.
	pub fn endpoint(&self) -> &CrmEndpoint {
		&self.endpoint
	}

	/// Leads matching `filter`, with linked contacts; an empty result is not an error.
	pub async fn leads(
		&self,
		subdomain: &Subdomain,
		token: &TokenSecret,
		filter: &LeadFilter,
	) -> Result<Vec<Lead>, CrmError> {
		let page = self.get::<LeadPage>(subdomain, token, "leads", &filter.to_query()).await?;
		let leads = page.map(|page| page.embedded.leads).unwrap_or_default();

		if leads.is_empty() {
			tracing::warn!(
				%subdomain,
				pipeline_id = ?filter.pipeline_id,
				"No leads matched the filter."
			);
		}

		Ok(leads)
	}

	/// Single lead with linked contacts.
	pub async fn lead(
		&self,
		subdomain: &Subdomain,
		token: &TokenSecret,
		lead_id: u64,
	) -> Result<Lead, CrmError> {
		let query = [("with".to_owned(), "contacts".to_owned())];

		self.get_one(subdomain, token, &format!("leads/{lead_id}"), &query).await
	}

	/// Single contact.
	pub async fn contact(
		&self,
		subdomain: &Subdomain,
		token: &TokenSecret,
		contact_id: u64,
	) -> Result<Contact, CrmError> {
		self.get_one(subdomain, token, &format!("contacts/{contact_id}"), &[]).await
	}

	/// Every contact on the first page, reduced to its owner.
	pub async fn contacts(
		&self,
		subdomain: &Subdomain,
		token: &TokenSecret,
	) -> Result<Vec<ContactOwner>, CrmError> {
		let page = self.get::<ContactPage>(subdomain, token, "contacts", &[]).await?;

		Ok(page.map(|page| page.embedded.contacts).unwrap_or_default())
	}

	/// Single company.
	pub async fn company(
		&self,
		subdomain: &Subdomain,
		token: &TokenSecret,
		company_id: u64,
	) -> Result<Company, CrmError> {
		self.get_one(subdomain, token, &format!("companies/{company_id}"), &[]).await
	}

	async fn get_one<T>(
		&self,
		subdomain: &Subdomain,
		token: &TokenSecret,
		resource: &str,
		query: &[(String, String)],
	) -> Result<T, CrmError>
	where
		T: DeserializeOwned,
	{
		self.get(subdomain, token, resource, query)
			.await?
			.ok_or_else(|| CrmError::NotFound { resource: resource.to_owned() })
	}

	/// `Ok(None)` means the CRM answered 204.
	async fn get<T>(
		&self,
		subdomain: &Subdomain,
		token: &TokenSecret,
		resource: &str,
		query: &[(String, String)],
	) -> Result<Option<T>, CrmError>
	where
		T: DeserializeOwned,
	{
		let url = self.endpoint.base_url(subdomain)?.join(resource)?;

		tracing::debug!(%subdomain, resource, "Sending CRM request.");

		let response = self
			.http
			.get(url)
			.bearer_auth(token.expose())
			.header(ACCEPT, HeaderValue::from_static("application/json"))
			.query(query)
			.send()
			.await
			.inspect_err(|e| {
				tracing::error!(%subdomain, resource, error = %e, "CRM is unreachable.");
			})?;
		let status = response.status();

		match status {
			StatusCode::NO_CONTENT => Ok(None),
			StatusCode::NOT_FOUND => {
				tracing::warn!(%subdomain, resource, "CRM resource not found.");

				Err(CrmError::NotFound { resource: resource.to_owned() })
			},
			status if status.is_success() => {
				let body = response.bytes().await?;

				Ok(Some(payload::decode(&body).inspect_err(|e| {
					tracing::error!(%subdomain, resource, error = %e, "CRM response is malformed.");
				})?))
			},
			status => {
				let body = truncate(response.text().await.unwrap_or_default());

				tracing::error!(
					%subdomain,
					resource,
					status = status.as_u16(),
					%body,
					"CRM request failed."
				);

				Err(CrmError::Upstream { status: status.as_u16(), body })
			},
		}
	}
}

fn truncate(mut body: String) -> String {
	if body.len() > UPSTREAM_BODY_LIMIT {
		let mut end = UPSTREAM_BODY_LIMIT;

		while !body.is_char_boundary(end) {
			end -= 1;
		}

		body.truncate(end);
	}

	body
}
