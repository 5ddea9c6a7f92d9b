//! CRM resource shapes as the v4 REST API returns them.

// crates.io
use serde_json::{Map, Value};
// self
use crate::_prelude::*;

/// Deal record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Lead {
	/// Lead id.
	pub id: u64,
	/// Display name.
	#[serde(default)]
	pub name: String,
	/// Deal value.
	#[serde(default)]
	pub price: Option<i64>,
	/// Owning user.
	#[serde(default)]
	pub responsible_user_id: Option<u64>,
	/// Current pipeline stage.
	#[serde(default)]
	pub status_id: Option<u64>,
	/// Pipeline the lead belongs to.
	#[serde(default)]
	pub pipeline_id: Option<u64>,
	/// Creation time.
	#[serde(default, with = "time::serde::timestamp::option")]
	pub created_at: Option<OffsetDateTime>,
	/// Last modification time.
	#[serde(default, with = "time::serde::timestamp::option")]
	pub updated_at: Option<OffsetDateTime>,
	/// Linked contacts and companies, present when requested with `with=contacts`.
	#[serde(default, rename = "_embedded")]
	pub embedded: LeadEmbedded,
	/// Fields this crate does not model.
	#[serde(flatten)]
	pub extra: Map<String, Value>,
}
impl Lead {
	/// Id of the main contact, falling back to the first linked one.
	pub fn main_contact_id(&self) -> Option<u64> {
		let contacts = &self.embedded.contacts;

		contacts.iter().find(|c| c.is_main).or_else(|| contacts.first()).map(|c| c.id)
	}
}

/// Entities linked to a [`Lead`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeadEmbedded {
	/// Linked contacts.
	pub contacts: Vec<EmbeddedRef>,
	/// Linked companies.
	pub companies: Vec<EmbeddedRef>,
}

/// Reference to a linked entity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddedRef {
	/// Entity id.
	pub id: u64,
	/// Whether this is the primary link.
	#[serde(default)]
	pub is_main: bool,
}

/// Contact record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Contact {
	/// Contact id.
	pub id: u64,
	/// Display name.
	#[serde(default)]
	pub name: String,
	/// Owning user.
	#[serde(default)]
	pub responsible_user_id: Option<u64>,
	/// Fields this crate does not model.
	#[serde(flatten)]
	pub extra: Map<String, Value>,
}

/// Company record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Company {
	/// Company id.
	pub id: u64,
	/// Display name.
	#[serde(default)]
	pub name: String,
	/// Owning user.
	#[serde(default)]
	pub responsible_user_id: Option<u64>,
	/// Fields this crate does not model.
	#[serde(flatten)]
	pub extra: Map<String, Value>,
}

/// Contact id paired with its owner.
///
/// Listed by [`CrmClient::contacts`](super::CrmClient::contacts).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactOwner {
	/// Contact id.
	pub id: u64,
	/// Owning user.
	pub responsible_user_id: u64,
}

/// Query filter for [`CrmClient::leads`](super::CrmClient::leads).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LeadFilter {
	/// Restrict to one pipeline.
	pub pipeline_id: Option<u64>,
	/// Restrict to these stages.
	pub status_ids: Vec<u64>,
	/// Restrict to one owner.
	pub responsible_user_id: Option<u64>,
}
impl LeadFilter {
	/// Filter on a single pipeline.
	pub fn pipeline(pipeline_id: u64) -> Self {
		Self { pipeline_id: Some(pipeline_id), ..Default::default() }
	}

	/// Adds stage restrictions.
	pub fn with_statuses(mut self, status_ids: impl IntoIterator<Item = u64>) -> Self {
		self.status_ids.extend(status_ids);

		self
	}

	/// Adds an owner restriction.
	pub fn with_responsible_user(mut self, user_id: u64) -> Self {
		self.responsible_user_id = Some(user_id);

		self
	}

	/// Query pairs; linked contacts are always requested.
	pub fn to_query(&self) -> Vec<(String, String)> {
		let mut query = vec![("with".to_owned(), "contacts".to_owned())];

		if let Some(pipeline_id) = self.pipeline_id {
			query.push(("filter[pipeline_id]".to_owned(), pipeline_id.to_string()));
		}
		for (i, status_id) in self.status_ids.iter().enumerate() {
			query.push((format!("filter[status][{i}]"), status_id.to_string()));
		}
		if let Some(user_id) = self.responsible_user_id {
			query.push(("filter[responsible_user_id]".to_owned(), user_id.to_string()));
		}

		query
	}
}

#[derive(Debug, Deserialize)]
pub(crate) struct LeadPage {
	#[serde(default, rename = "_embedded")]
	pub(crate) embedded: LeadPageItems,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct LeadPageItems {
	pub(crate) leads: Vec<Lead>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ContactPage {
	#[serde(rename = "_embedded")]
	pub(crate) embedded: ContactPageItems,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ContactPageItems {
	pub(crate) contacts: Vec<ContactOwner>,
}
