//! IdP metadata parsing, fetching and caching.

use anyhow::{anyhow, bail, Context, Result};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::binding::Binding;
use crate::error::{SamlError, SamlResult};
use crate::xml::{self, child, children, text_of, NS_DSIG, NS_METADATA};

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// An endpoint advertised in metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataEndpoint {
    pub binding: Binding,
    pub location: String,
    pub response_location: Option<String>,
}

/// What the SP needs from an IdP's `EntityDescriptor`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdpMetadata {
    pub entity_id: String,
    pub single_sign_on: Vec<MetadataEndpoint>,
    pub single_logout: Vec<MetadataEndpoint>,
    /// Signing certificates as bare base64 DER.
    pub signing_certificates: Vec<String>,
}

impl IdpMetadata {
    /// Parse an `EntityDescriptor`, or the first IdP inside an
    /// `EntitiesDescriptor`.
    pub fn parse(metadata_xml: &str) -> SamlResult<Self> {
        let doc = xml::parse(metadata_xml)?;
        let root = doc.root_element();

        let entity = if xml::is_element(root, NS_METADATA, "EntityDescriptor") {
            root
        } else if xml::is_element(root, NS_METADATA, "EntitiesDescriptor") {
            root.descendants()
                .filter(|n| xml::is_element(*n, NS_METADATA, "EntityDescriptor"))
                .find(|n| child(*n, NS_METADATA, "IDPSSODescriptor").is_some())
                .ok_or_else(|| malformed("no IdP entity in EntitiesDescriptor"))?
        } else {
            return Err(malformed("root element is not an EntityDescriptor"));
        };

        let entity_id = entity
            .attribute("entityID")
            .filter(|id| !id.is_empty())
            .ok_or_else(|| malformed("EntityDescriptor has no entityID"))?
            .to_string();

        let descriptor = child(entity, NS_METADATA, "IDPSSODescriptor")
            .ok_or_else(|| malformed("no IDPSSODescriptor"))?;

        let endpoints = |name: &str| -> Vec<MetadataEndpoint> {
            children(descriptor, NS_METADATA, name)
                .filter_map(|ep| {
                    // Bindings we cannot speak (SOAP, Artifact) are skipped.
                    let binding = Binding::from_uri(ep.attribute("Binding")?)?;
                    Some(MetadataEndpoint {
                        binding,
                        location: ep.attribute("Location")?.to_string(),
                        response_location: ep.attribute("ResponseLocation").map(str::to_string),
                    })
                })
                .collect()
        };
        let single_sign_on = endpoints("SingleSignOnService");
        let single_logout = endpoints("SingleLogoutService");

        let signing_certificates = children(descriptor, NS_METADATA, "KeyDescriptor")
            .filter(|kd| matches!(kd.attribute("use"), None | Some("signing")))
            .filter_map(|kd| child(kd, NS_DSIG, "KeyInfo"))
            .flat_map(|ki| children(ki, NS_DSIG, "X509Data"))
            .flat_map(|data| children(data, NS_DSIG, "X509Certificate"))
            .map(|cert| text_of(cert).split_whitespace().collect::<String>())
            .filter(|cert| !cert.is_empty())
            .collect();

        Ok(Self {
            entity_id,
            single_sign_on,
            single_logout,
            signing_certificates,
        })
    }

    /// The SSO endpoint for `preferred`, else the first usable one.
    pub fn sso_endpoint(&self, preferred: Binding) -> Option<&MetadataEndpoint> {
        pick(&self.single_sign_on, preferred)
    }

    /// The SLO endpoint for `preferred`, else the first usable one.
    pub fn slo_endpoint(&self, preferred: Binding) -> Option<&MetadataEndpoint> {
        pick(&self.single_logout, preferred)
    }
}

fn pick(endpoints: &[MetadataEndpoint], preferred: Binding) -> Option<&MetadataEndpoint> {
    endpoints
        .iter()
        .find(|ep| ep.binding == preferred)
        .or_else(|| endpoints.first())
}

fn malformed(msg: &str) -> SamlError {
    SamlError::Malformed(format!("IdP metadata: {msg}"))
}

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(FETCH_TIMEOUT)
        .build()
        .context("Failed to create HTTP client")
}

/// Download IdP metadata. The document is checked to parse before it is
/// returned.
pub async fn fetch_idp_metadata(url: &str) -> Result<String> {
    fetch_with(&http_client()?, url).await
}

async fn fetch_with(client: &reqwest::Client, url: &str) -> Result<String> {
    debug!(url = %url, "Fetching IdP metadata");

    let response = client
        .get(url)
        .send()
        .await
        .context("Failed to fetch IdP metadata")?;

    if !response.status().is_success() {
        bail!("IdP metadata endpoint returned status {}", response.status());
    }

    let body = response
        .text()
        .await
        .context("Failed to read IdP metadata body")?;
    IdpMetadata::parse(&body).map_err(|e| anyhow!("{e}"))?;
    Ok(body)
}

/// IdP metadata document with periodic refresh.
///
/// A refresh that fails or yields an unparsable document keeps the last
/// good copy.
pub struct IdpMetadataCache {
    url: String,
    current: RwLock<String>,
    last_refresh: RwLock<Instant>,
    refresh_interval: Duration,
    http_client: reqwest::Client,
}

impl IdpMetadataCache {
    /// Fetch the metadata once and build the cache around it.
    pub async fn new(url: String, refresh_secs: u64) -> Result<Self> {
        let http_client = http_client()?;
        let initial = fetch_with(&http_client, &url).await?;

        Ok(Self {
            url,
            current: RwLock::new(initial),
            last_refresh: RwLock::new(Instant::now()),
            refresh_interval: Duration::from_secs(refresh_secs),
            http_client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// The current metadata document.
    pub fn xml(&self) -> Result<String> {
        self.current
            .read()
            .map(|xml| xml.clone())
            .map_err(|_| anyhow!("Lock poisoned"))
    }

    /// Refresh if the interval has elapsed. Returns true if the document
    /// changed.
    pub async fn refresh_if_needed(&self) -> Result<bool> {
        let should_refresh = {
            let last = self.last_refresh.read().map_err(|_| anyhow!("Lock poisoned"))?;
            last.elapsed() >= self.refresh_interval
        };

        if should_refresh {
            self.refresh().await
        } else {
            Ok(false)
        }
    }

    /// Force a refresh. Returns true if the document changed.
    pub async fn refresh(&self) -> Result<bool> {
        {
            let mut last = self.last_refresh.write().map_err(|_| anyhow!("Lock poisoned"))?;
            *last = Instant::now();
        }

        let fetched = match fetch_with(&self.http_client, &self.url).await {
            Ok(xml) => xml,
            Err(e) => {
                warn!(url = %self.url, error = %e, "IdP metadata refresh failed, keeping cached copy");
                return Err(e);
            }
        };

        let mut current = self.current.write().map_err(|_| anyhow!("Lock poisoned"))?;
        if *current == fetched {
            debug!(url = %self.url, "IdP metadata unchanged");
            return Ok(false);
        }
        *current = fetched;
        info!(url = %self.url, "IdP metadata updated");
        Ok(true)
    }
}
