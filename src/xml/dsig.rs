//! Enveloped XML signatures.
//!
//! Only the profile SAML uses is accepted: one `ds:Reference` pointing at
//! the element that carries the signature, the enveloped-signature and
//! exclusive C14N transforms, RSA PKCS#1 v1.5 with SHA-2.
//!
//! Verification re-resolves the referenced element by ID in the document
//! and requires it to be the signature's parent, so a signature cannot be
//! moved onto, or wrapped around, different content.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use roxmltree::{Document, Node};

use super::c14n::{canonicalize, EXC_C14N_URI};
use super::{child, children, find_by_id, parse, text_of, NS_ASSERTION, NS_DSIG};
use crate::crypto::{
    digests_equal, DigestAlgorithm, SignatureAlgorithm, SigningCredentials, TrustedCertificate,
};
use crate::error::{SamlError, SamlResult};

pub const ENVELOPED_SIGNATURE_URI: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";

/// The enveloped `ds:Signature` child of `element`, if any.
///
/// More than one signature on the same element is rejected.
pub fn signature_of<'a, 'input>(element: Node<'a, 'input>) -> SamlResult<Option<Node<'a, 'input>>> {
    let mut sigs = children(element, NS_DSIG, "Signature");
    let first = sigs.next();
    if sigs.next().is_some() {
        return Err(SamlError::Signature(
            "element carries more than one signature".to_string(),
        ));
    }
    Ok(first)
}

/// Verify the enveloped signature on `element` against the trusted
/// certificates. Returns the algorithm that verified.
pub fn verify_enveloped(
    doc: &Document<'_>,
    element: Node<'_, '_>,
    trusted: &[TrustedCertificate],
) -> SamlResult<SignatureAlgorithm> {
    let signature = signature_of(element)?
        .ok_or_else(|| SamlError::Signature("element is not signed".to_string()))?;
    let signed_info = child(signature, NS_DSIG, "SignedInfo")
        .ok_or_else(|| sig_err("Signature has no SignedInfo"))?;

    let c14n_method = child(signed_info, NS_DSIG, "CanonicalizationMethod")
        .ok_or_else(|| sig_err("SignedInfo has no CanonicalizationMethod"))?;
    if c14n_method.attribute("Algorithm") != Some(EXC_C14N_URI) {
        return Err(sig_err("unsupported canonicalization method"));
    }
    let signed_info_prefixes = inclusive_prefixes(c14n_method);

    let algorithm = child(signed_info, NS_DSIG, "SignatureMethod")
        .and_then(|m| m.attribute("Algorithm"))
        .and_then(SignatureAlgorithm::from_uri)
        .ok_or_else(|| sig_err("unsupported or missing signature method"))?;

    let mut references = children(signed_info, NS_DSIG, "Reference");
    let reference = references
        .next()
        .ok_or_else(|| sig_err("SignedInfo has no Reference"))?;
    if references.next().is_some() {
        return Err(sig_err("SignedInfo has more than one Reference"));
    }

    // The reference must name the signature's parent, and that ID must
    // resolve to exactly this element.
    let uri = reference.attribute("URI").unwrap_or("");
    let referenced_id = uri
        .strip_prefix('#')
        .filter(|id| !id.is_empty())
        .ok_or_else(|| sig_err("Reference URI is not a same-document ID reference"))?;
    if element.attribute("ID") != Some(referenced_id) {
        return Err(sig_err("Reference does not point at the signed element"));
    }
    let resolved = find_by_id(doc, referenced_id)
        .map_err(|e| SamlError::Signature(e.to_string()))?
        .ok_or_else(|| sig_err("referenced element not found"))?;
    if resolved.id() != element.id() {
        return Err(sig_err("referenced element is not the signed element"));
    }

    let mut enveloped = false;
    let mut reference_prefixes = Vec::new();
    if let Some(transforms) = child(reference, NS_DSIG, "Transforms") {
        for transform in children(transforms, NS_DSIG, "Transform") {
            match transform.attribute("Algorithm") {
                Some(ENVELOPED_SIGNATURE_URI) => enveloped = true,
                Some(EXC_C14N_URI) => reference_prefixes = inclusive_prefixes(transform),
                Some(other) => {
                    return Err(SamlError::Signature(format!("unsupported transform {other}")))
                }
                None => return Err(sig_err("Transform without Algorithm")),
            }
        }
    }
    if !enveloped {
        return Err(sig_err("Reference lacks the enveloped-signature transform"));
    }

    let digest_algorithm = child(reference, NS_DSIG, "DigestMethod")
        .and_then(|m| m.attribute("Algorithm"))
        .and_then(DigestAlgorithm::from_uri)
        .ok_or_else(|| sig_err("unsupported or missing digest method"))?;
    let expected_digest = decode_b64(
        &child(reference, NS_DSIG, "DigestValue")
            .map(text_of)
            .ok_or_else(|| sig_err("Reference has no DigestValue"))?,
    )?;

    let canonical = canonicalize(element, Some(signature.id()), &reference_prefixes);
    let actual_digest = digest_algorithm.digest(canonical.as_bytes());
    if !digests_equal(&actual_digest, &expected_digest) {
        return Err(sig_err("digest mismatch"));
    }

    let signature_value = decode_b64(
        &child(signature, NS_DSIG, "SignatureValue")
            .map(text_of)
            .ok_or_else(|| sig_err("Signature has no SignatureValue"))?,
    )?;
    let canonical_signed_info = canonicalize(signed_info, None, &signed_info_prefixes);

    if trusted
        .iter()
        .any(|cert| cert.verify(algorithm, canonical_signed_info.as_bytes(), &signature_value))
    {
        Ok(algorithm)
    } else {
        Err(sig_err("signature does not verify against any trusted certificate"))
    }
}

/// Sign the element carrying `ID="id"` with an enveloped signature.
///
/// The `ds:Signature` is placed right after the element's `saml:Issuer`
/// child, or first if there is none, as the SAML schemas require.
pub fn sign_enveloped(
    xml: &str,
    id: &str,
    credentials: &SigningCredentials,
    algorithm: SignatureAlgorithm,
) -> SamlResult<String> {
    let doc = parse(xml)?;
    let element = find_by_id(&doc, id)?
        .ok_or_else(|| SamlError::Internal(format!("no element with ID {id} to sign")))?;
    if signature_of(element)?.is_some() {
        return Err(SamlError::Internal(format!("element {id} is already signed")));
    }

    let digest_algorithm = algorithm.digest();
    let canonical = canonicalize(element, None, &[]);
    let digest = BASE64.encode(digest_algorithm.digest(canonical.as_bytes()));

    let signed_info_body = format!(
        concat!(
            r#"<ds:CanonicalizationMethod Algorithm="{c14n}"/>"#,
            r#"<ds:SignatureMethod Algorithm="{sig}"/>"#,
            r##"<ds:Reference URI="#{id}">"##,
            r#"<ds:Transforms>"#,
            r#"<ds:Transform Algorithm="{env}"/>"#,
            r#"<ds:Transform Algorithm="{c14n}"/>"#,
            r#"</ds:Transforms>"#,
            r#"<ds:DigestMethod Algorithm="{digest_alg}"/>"#,
            r#"<ds:DigestValue>{digest}</ds:DigestValue>"#,
            r#"</ds:Reference>"#,
        ),
        c14n = EXC_C14N_URI,
        sig = algorithm.uri(),
        id = id,
        env = ENVELOPED_SIGNATURE_URI,
        digest_alg = digest_algorithm.uri(),
        digest = digest,
    );

    // Exclusive C14N of SignedInfo does not depend on its ancestors beyond
    // the ds binding, so it can be computed standalone.
    let standalone = format!(
        r#"<ds:SignedInfo xmlns:ds="{NS_DSIG}">{signed_info_body}</ds:SignedInfo>"#
    );
    let standalone_doc = parse(&standalone)?;
    let canonical_signed_info = canonicalize(standalone_doc.root_element(), None, &[]);
    let signature_value = BASE64.encode(credentials.sign(algorithm, canonical_signed_info.as_bytes())?);

    let signature_xml = format!(
        concat!(
            r#"<ds:Signature xmlns:ds="{ns}">"#,
            r#"<ds:SignedInfo>{signed_info}</ds:SignedInfo>"#,
            r#"<ds:SignatureValue>{value}</ds:SignatureValue>"#,
            r#"<ds:KeyInfo><ds:X509Data><ds:X509Certificate>{cert}</ds:X509Certificate></ds:X509Data></ds:KeyInfo>"#,
            r#"</ds:Signature>"#,
        ),
        ns = NS_DSIG,
        signed_info = signed_info_body,
        value = signature_value,
        cert = credentials.certificate().to_base64(),
    );

    let offset = insertion_offset(&doc, element)?;
    let mut signed = String::with_capacity(xml.len() + signature_xml.len());
    signed.push_str(&xml[..offset]);
    signed.push_str(&signature_xml);
    signed.push_str(&xml[offset..]);
    Ok(signed)
}

/// Byte offset where the signature goes: after the Issuer's end tag, or
/// right after the element's start tag.
fn insertion_offset(doc: &Document<'_>, element: Node<'_, '_>) -> SamlResult<usize> {
    let input = doc.input_text();
    let element_tag_end = start_tag_end(input, element.range().start)
        .ok_or_else(|| SamlError::Internal("unterminated start tag".to_string()))?;
    if input[..element_tag_end].ends_with("/>") {
        return Err(SamlError::Internal("cannot sign an empty element".to_string()));
    }

    let issuer = element
        .first_element_child()
        .filter(|c| super::is_element(*c, NS_ASSERTION, "Issuer"));
    let Some(issuer) = issuer else {
        return Ok(element_tag_end);
    };

    let issuer_start = issuer.range().start;
    let issuer_tag_end = start_tag_end(input, issuer_start)
        .ok_or_else(|| SamlError::Internal("unterminated Issuer tag".to_string()))?;
    if input[..issuer_tag_end].ends_with("/>") {
        return Ok(issuer_tag_end);
    }
    let qname_end = input[issuer_start + 1..]
        .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
        .map(|i| issuer_start + 1 + i)
        .ok_or_else(|| SamlError::Internal("unterminated Issuer tag".to_string()))?;
    let closing = format!("</{}>", &input[issuer_start + 1..qname_end]);
    input[issuer_tag_end..]
        .find(&closing)
        .map(|i| issuer_tag_end + i + closing.len())
        .ok_or_else(|| SamlError::Internal("Issuer end tag not found".to_string()))
}

/// Offset just past the `>` closing the start tag that begins at `start`.
fn start_tag_end(input: &str, start: usize) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (i, ch) in input.get(start..)?.char_indices() {
        match (quote, ch) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"') | (None, '\'') => quote = Some(ch),
            (None, '>') => return Some(start + i + 1),
            (None, _) => {}
        }
    }
    None
}

const NS_EXC_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";

fn inclusive_prefixes(method: Node<'_, '_>) -> Vec<String> {
    child(method, NS_EXC_C14N, "InclusiveNamespaces")
        .and_then(|n| n.attribute("PrefixList"))
        .map(|list| list.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

fn decode_b64(value: &str) -> SamlResult<Vec<u8>> {
    let compact: String = value.split_whitespace().collect();
    BASE64
        .decode(compact.as_bytes())
        .map_err(|e| SamlError::Signature(format!("invalid base64 in signature: {e}")))
}

fn sig_err(msg: &str) -> SamlError {
    SamlError::Signature(msg.to_string())
}
