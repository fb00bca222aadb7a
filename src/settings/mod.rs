//! SP and IdP configuration.
//!
//! Settings are read once from a JSON file, validated as a whole and then
//! treated as immutable. Reloading means building a new [`Settings`] and
//! handing it to [`crate::sso::ServiceProvider::reconfigure`].

pub mod config;
pub mod idp_metadata;
pub mod metadata;
pub mod model;

pub use config::{RawSettings, SessionConfig};
pub use idp_metadata::{fetch_idp_metadata, IdpMetadata, IdpMetadataCache};
pub use metadata::{generate_sp_metadata, validate_sp_metadata};
pub use model::{IdentityProviderConfig, SecurityPolicy, ServiceProviderConfig, Settings, SloEndpoint};

use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;

/// Read a settings file.
///
/// When the IdP section names a `metadataUrl` and carries no inline
/// metadata, the document is fetched first. The returned raw settings hold
/// the fetched metadata so they can be rebuilt on refresh.
pub async fn load_settings_file(path: &Path) -> Result<(RawSettings, Settings)> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read settings file: {:?}", path))?;
    let mut raw: RawSettings = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse settings file: {:?}", path))?;

    if raw.idp.metadata_xml.is_none() {
        if let Some(url) = raw.idp.metadata_url.clone() {
            let xml = fetch_idp_metadata(&url).await?;
            info!(url = %url, "Fetched IdP metadata");
            raw.idp.metadata_xml = Some(xml);
        }
    }

    let settings = Settings::from_raw(&raw)?;
    Ok((raw, settings))
}

/// Rebuild settings with a fresh IdP metadata document.
pub fn with_idp_metadata(raw: &RawSettings, metadata_xml: String) -> Result<Settings> {
    let mut raw = raw.clone();
    raw.idp.metadata_xml = Some(metadata_xml);
    Ok(Settings::from_raw(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{idp_metadata_xml, raw_settings};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_load_settings_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, serde_json::to_string_pretty(&raw_settings()).unwrap()).unwrap();

        let (raw, settings) = load_settings_file(&path).await.unwrap();
        assert_eq!(raw.sp.entity_id, settings.sp.entity_id);
    }

    #[tokio::test]
    async fn test_load_settings_file_reports_problems() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut raw = raw_settings();
        raw.sp.entity_id = String::new();
        std::fs::write(&path, serde_json::to_string(&raw).unwrap()).unwrap();

        let err = load_settings_file(&path).await.unwrap_err();
        assert!(err.to_string().contains("sp.entityId"));

        assert!(load_settings_file(&dir.path().join("missing.json")).await.is_err());
    }

    #[test]
    fn test_with_idp_metadata_replaces_inline_document() {
        let mut raw = raw_settings();
        raw.idp = Default::default();
        let settings = with_idp_metadata(&raw, idp_metadata_xml()).unwrap();
        assert_eq!(settings.idp.entity_id, "https://idp.example.com/metadata");
    }
}
