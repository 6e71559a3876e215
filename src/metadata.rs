//! CodeMeta subset sent to the archive when a deposit is created

use serde::{Deserialize, Serialize};

use crate::error::DepositError;

/// Software metadata derived from a published record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DepositMetadata {
    pub title: String,
    #[serde(default)]
    pub authors: Vec<Person>,
    #[serde(default)]
    pub contributors: Vec<Person>,
    #[serde(default)]
    pub date_created: Option<String>,
    #[serde(default)]
    pub date_published: Option<String>,
    #[serde(default)]
    pub licenses: Vec<License>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub code_repository: Option<String>,
    #[serde(default)]
    pub programming_languages: Vec<String>,
    #[serde(default)]
    pub runtime_platforms: Vec<String>,
    #[serde(default)]
    pub operating_systems: Vec<String>,
    #[serde(default)]
    pub development_status: Option<String>,
    /// Landing page of the record, used as the archive origin
    #[serde(default)]
    pub origin_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub name: String,
    #[serde(default)]
    pub orcid: Option<String>,
    #[serde(default)]
    pub affiliations: Vec<String>,
}

impl Person {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn orcid_url(&self) -> Option<String> {
        self.orcid
            .as_deref()
            .filter(|id| !id.is_empty())
            .map(|id| format!("https://orcid.org/{}", id))
    }
}

/// License by SPDX identifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct License {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
}

impl License {
    pub fn url(&self) -> String {
        format!("http://spdx.org/licenses/{}", self.id)
    }

    pub fn name(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.id)
    }
}

impl DepositMetadata {
    pub fn new(title: impl Into<String>, authors: Vec<Person>) -> Self {
        Self {
            title: title.into(),
            authors,
            ..Default::default()
        }
    }

    /// The archive rejects entries without a title or an author
    pub fn validate(&self) -> Result<(), DepositError> {
        if self.title.trim().is_empty() {
            return Err(DepositError::InvalidRecord("A title is required.".into()));
        }
        if self.authors.is_empty() {
            return Err(DepositError::InvalidRecord(
                "At least one creator is required.".into(),
            ));
        }
        if let Some(i) = self.authors.iter().position(|a| a.name.trim().is_empty()) {
            return Err(DepositError::InvalidRecord(format!(
                "creator[{}] has no name",
                i
            )));
        }
        Ok(())
    }
}
