//! SP metadata generation and validation.

use roxmltree::Node;

use super::Settings;
use crate::binding::Binding;
use crate::crypto::{generate_id, TrustedCertificate};
use crate::error::{SamlError, SamlResult};
use crate::xml::{
    self, child, children, dsig, escape_attr, escape_text, text_of, NS_DSIG, NS_METADATA,
    NS_PROTOCOL,
};

/// Metadata consumers may cache the document for a week.
const CACHE_DURATION: &str = "PT604800S";

/// Build the SP's `EntityDescriptor`, signed when `signMetadata` is set.
pub fn generate_sp_metadata(settings: &Settings) -> SamlResult<String> {
    let sp = &settings.sp;
    let security = &settings.security;
    let id = generate_id();

    let key_descriptor = sp
        .credentials
        .as_ref()
        .map(|creds| {
            format!(
                concat!(
                    r#"<md:KeyDescriptor use="signing">"#,
                    r#"<ds:KeyInfo xmlns:ds="{ns}"><ds:X509Data><ds:X509Certificate>{cert}</ds:X509Certificate></ds:X509Data></ds:KeyInfo>"#,
                    r#"</md:KeyDescriptor>"#,
                ),
                ns = NS_DSIG,
                cert = creds.certificate().to_base64(),
            )
        })
        .unwrap_or_default();

    let single_logout = sp
        .slo_url
        .as_deref()
        .map(|url| {
            format!(
                r#"<md:SingleLogoutService Binding="{}" Location="{}"/>"#,
                sp.slo_binding.uri(),
                escape_attr(url)
            )
        })
        .unwrap_or_default();

    let metadata = format!(
        concat!(
            r#"<md:EntityDescriptor xmlns:md="{md}" entityID="{entity_id}" ID="{id}" cacheDuration="{cache}">"#,
            r#"<md:SPSSODescriptor AuthnRequestsSigned="{authn_signed}" WantAssertionsSigned="{want_signed}" protocolSupportEnumeration="{protocol}">"#,
            "{key_descriptor}",
            "{single_logout}",
            "<md:NameIDFormat>{name_id_format}</md:NameIDFormat>",
            r#"<md:AssertionConsumerService Binding="{acs_binding}" Location="{acs_url}" index="1" isDefault="true"/>"#,
            "</md:SPSSODescriptor>",
            "</md:EntityDescriptor>",
        ),
        md = NS_METADATA,
        entity_id = escape_attr(&sp.entity_id),
        id = id,
        cache = CACHE_DURATION,
        authn_signed = security.authn_requests_signed,
        want_signed = security.want_assertions_signed,
        protocol = NS_PROTOCOL,
        key_descriptor = key_descriptor,
        single_logout = single_logout,
        name_id_format = escape_text(&sp.name_id_format),
        acs_binding = Binding::HttpPost.uri(),
        acs_url = escape_attr(&sp.acs_url),
    );

    match (&sp.credentials, security.sign_metadata) {
        (Some(creds), true) => {
            dsig::sign_enveloped(&metadata, &id, creds, security.signature_algorithm)
        }
        (None, true) => Err(SamlError::Internal(
            "metadata signing requested without SP credentials".to_string(),
        )),
        _ => Ok(metadata),
    }
}

/// Position of each allowed `SPSSODescriptor` child in schema order.
fn sp_child_rank(name: &str) -> Option<u8> {
    Some(match name {
        "Extensions" => 0,
        "KeyDescriptor" => 1,
        "Organization" => 2,
        "ContactPerson" => 3,
        "ArtifactResolutionService" => 4,
        "SingleLogoutService" => 5,
        "ManageNameIDService" => 6,
        "NameIDFormat" => 7,
        "AssertionConsumerService" => 8,
        "AttributeConsumingService" => 9,
        _ => return None,
    })
}

/// Check SP metadata against the metadata schema rules this SP relies on.
///
/// Every problem found is reported in one error.
pub fn validate_sp_metadata(metadata: &str) -> SamlResult<()> {
    let doc = xml::parse(metadata)?;
    let root = doc.root_element();
    let mut problems = Vec::new();

    if !xml::is_element(root, NS_METADATA, "EntityDescriptor") {
        return Err(SamlError::Malformed(
            "root element is not md:EntityDescriptor".to_string(),
        ));
    }
    match root.attribute("entityID") {
        Some(id) if url::Url::parse(id).is_ok() => {}
        _ => problems.push("entityID is missing or not a URI".to_string()),
    }

    let elements: Vec<Node<'_, '_>> = root.children().filter(|n| n.is_element()).collect();
    if let Some(pos) = elements.iter().position(|n| xml::is_element(*n, NS_DSIG, "Signature")) {
        if pos != 0 {
            problems.push("ds:Signature must be the first child of EntityDescriptor".to_string());
        }
    }

    let mut descriptors = children(root, NS_METADATA, "SPSSODescriptor");
    let Some(descriptor) = descriptors.next() else {
        problems.push("no md:SPSSODescriptor".to_string());
        return finish(problems);
    };
    if descriptors.next().is_some() {
        problems.push("more than one md:SPSSODescriptor".to_string());
    }

    let protocols = descriptor.attribute("protocolSupportEnumeration").unwrap_or("");
    if !protocols.split_whitespace().any(|p| p == NS_PROTOCOL) {
        problems.push("protocolSupportEnumeration does not list SAML 2.0".to_string());
    }
    for flag in ["AuthnRequestsSigned", "WantAssertionsSigned"] {
        if let Some(value) = descriptor.attribute(flag) {
            if !matches!(value, "true" | "false" | "1" | "0") {
                problems.push(format!("{flag} is not a boolean: {value}"));
            }
        }
    }

    let mut last_rank = 0;
    for node in descriptor.children().filter(|n| n.is_element()) {
        let name = node.tag_name().name();
        let rank = match node.tag_name().namespace() {
            Some(NS_METADATA) => sp_child_rank(name),
            _ => None,
        };
        match rank {
            Some(rank) if rank < last_rank => {
                problems.push(format!("md:{name} is out of schema order"));
            }
            Some(rank) => last_rank = rank,
            None => problems.push(format!("unexpected element {name} in SPSSODescriptor")),
        }
    }

    let mut signing_keys = 0;
    for kd in children(descriptor, NS_METADATA, "KeyDescriptor") {
        let cert = child(kd, NS_DSIG, "KeyInfo")
            .and_then(|ki| child(ki, NS_DSIG, "X509Data"))
            .and_then(|data| child(data, NS_DSIG, "X509Certificate"))
            .map(text_of);
        match cert {
            Some(cert) if TrustedCertificate::from_pem(&cert).is_ok() => {
                if matches!(kd.attribute("use"), None | Some("signing")) {
                    signing_keys += 1;
                }
            }
            _ => problems.push("KeyDescriptor without a valid X509Certificate".to_string()),
        }
    }
    let authn_signed = matches!(descriptor.attribute("AuthnRequestsSigned"), Some("true" | "1"));
    let metadata_signed = elements.iter().any(|n| xml::is_element(*n, NS_DSIG, "Signature"));
    if (authn_signed || metadata_signed) && signing_keys == 0 {
        problems.push("signing is enabled but no signing KeyDescriptor is present".to_string());
    }

    for slo in children(descriptor, NS_METADATA, "SingleLogoutService") {
        check_endpoint("SingleLogoutService", slo, &mut problems);
    }

    let mut acs_count = 0;
    for acs in children(descriptor, NS_METADATA, "AssertionConsumerService") {
        acs_count += 1;
        check_endpoint("AssertionConsumerService", acs, &mut problems);
        if acs.attribute("index").and_then(|i| i.parse::<u16>().ok()).is_none() {
            problems.push("AssertionConsumerService has no valid index".to_string());
        }
    }
    if acs_count == 0 {
        problems.push("no md:AssertionConsumerService".to_string());
    }

    finish(problems)
}

fn check_endpoint(name: &str, endpoint: Node<'_, '_>, problems: &mut Vec<String>) {
    if endpoint.attribute("Binding").filter(|b| !b.is_empty()).is_none() {
        problems.push(format!("{name} has no Binding"));
    }
    let absolute = endpoint
        .attribute("Location")
        .and_then(|l| url::Url::parse(l).ok())
        .is_some_and(|u| u.host_str().is_some());
    if !absolute {
        problems.push(format!("{name} Location is missing or not absolute"));
    }
}

fn finish(problems: Vec<String>) -> SamlResult<()> {
    if problems.is_empty() {
        Ok(())
    } else {
        Err(SamlError::Malformed(format!(
            "invalid SP metadata: {}",
            problems.join("; ")
        )))
    }
}
