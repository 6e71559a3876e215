//! SWORD v2 client for the Software Heritage deposit API

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Method, RequestBuilder, Response};
use tracing::{debug, warn};
use url::Url;

use super::{atom, ArchiveClient, FileUpload, RawResponse};
use crate::config::ArchiveConfig;
use crate::error::DepositError;
use crate::metadata::DepositMetadata;

const ATOM_ENTRY: &str = "application/atom+xml;type=entry";
const SIMPLE_ZIP: &str = "http://purl.org/net/sword/package/SimpleZip";

/// HTTP client bound to one deposit collection
pub struct SwordClient {
    http: reqwest::Client,
    collection_iri: Url,
    username: String,
    password: Option<String>,
}

impl SwordClient {
    pub fn new(config: &ArchiveConfig) -> Result<Self, DepositError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| DepositError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            collection_iri: collection_url(&config.collection_iri)?,
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    pub fn collection_iri(&self) -> &Url {
        &self.collection_iri
    }

    /// Edit-Media IRI, target of file uploads
    pub fn edit_media_iri(&self, remote_id: &str) -> Result<Url, DepositError> {
        self.deposit_iri(remote_id, "media")
    }

    /// SWORD Edit IRI, target of metadata updates and completion
    pub fn se_iri(&self, remote_id: &str) -> Result<Url, DepositError> {
        self.deposit_iri(remote_id, "metadata")
    }

    pub fn status_iri(&self, remote_id: &str) -> Result<Url, DepositError> {
        self.deposit_iri(remote_id, "status")
    }

    fn deposit_iri(&self, remote_id: &str, suffix: &str) -> Result<Url, DepositError> {
        self.collection_iri
            .join(&format!("{}/{}/", remote_id, suffix))
            .map_err(|e| DepositError::Internal(format!("bad deposit IRI for {}: {}", remote_id, e)))
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http
            .request(method, url)
            .basic_auth(&self.username, self.password.as_deref())
    }

    /// Turn a response into a flattened entry, failing on any non-2xx
    async fn read_entry(response: Response, action: &str) -> Result<RawResponse, DepositError> {
        let status = response.status();
        let body = response.text().await.map_err(DepositError::from)?;

        if !status.is_success() {
            warn!(status = status.as_u16(), action = action, "Archive rejected request");
            debug!(body = %body, "Archive error body");
            return Err(DepositError::Client {
                status: status.as_u16(),
                message: format!("Failed to {}", action),
            });
        }

        atom::parse_entry(&body)
    }
}

fn collection_url(iri: &str) -> Result<Url, DepositError> {
    // join() replaces the last segment unless the base ends with '/'
    let normalized = if iri.ends_with('/') {
        iri.to_string()
    } else {
        format!("{}/", iri)
    };
    Url::parse(&normalized)
        .map_err(|e| DepositError::Config(format!("invalid collection IRI '{}': {}", iri, e)))
}

#[async_trait]
impl ArchiveClient for SwordClient {
    async fn create_deposit(&self, metadata: &DepositMetadata) -> Result<RawResponse, DepositError> {
        let entry = atom::encode_entry(metadata);
        debug!(collection = %self.collection_iri, "Creating deposit");

        let response = self
            .request(Method::POST, self.collection_iri.clone())
            .header(CONTENT_TYPE, ATOM_ENTRY)
            .header("In-Progress", "true")
            .body(entry)
            .send()
            .await?;

        Self::read_entry(response, "create deposit").await
    }

    async fn update_files(&self, remote_id: &str, upload: FileUpload) -> Result<RawResponse, DepositError> {
        let url = self.edit_media_iri(remote_id)?;
        debug!(remote_id = %remote_id, file = %upload.filename, size = upload.size, "Uploading deposit file");

        let mut request = self
            .request(Method::PUT, url)
            .header(CONTENT_TYPE, upload.content_type.as_str())
            .header(
                CONTENT_DISPOSITION,
                format!("attachment; filename={}", upload.filename),
            )
            .header("In-Progress", "true")
            .header("Packaging", SIMPLE_ZIP);
        if let Some(md5) = upload.md5_hex() {
            request = request.header("Content-MD5", md5);
        }

        let response = request.body(upload.body).send().await?;
        Self::read_entry(response, &format!("update deposit files {}", remote_id)).await
    }

    async fn complete_deposit(&self, remote_id: &str) -> Result<RawResponse, DepositError> {
        let url = self.se_iri(remote_id)?;
        debug!(remote_id = %remote_id, "Completing deposit");

        let response = self
            .request(Method::POST, url)
            .header(CONTENT_TYPE, ATOM_ENTRY)
            .header(CONTENT_LENGTH, 0)
            .header("In-Progress", "false")
            .send()
            .await?;

        Self::read_entry(response, &format!("complete deposit {}", remote_id)).await
    }

    async fn get_deposit_status(&self, remote_id: &str) -> Result<RawResponse, DepositError> {
        let url = self.status_iri(remote_id)?;

        let response = self.request(Method::GET, url).send().await?;
        Self::read_entry(response, &format!("fetch status of deposit {}", remote_id)).await
    }
}
