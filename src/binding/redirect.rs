//! HTTP-Redirect binding.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::io::{Read, Write};

use super::{malformed, Binding, DecodedMessage, MessageType, QuerySignature};
use crate::crypto::{SignatureAlgorithm, SigningCredentials, TrustedCertificate};
use crate::error::{SamlError, SamlResult};

/// Upper bound on an inflated message.
const MAX_INFLATED_BYTES: u64 = 1024 * 1024;

/// Key and algorithm used to sign a redirect query string.
#[derive(Debug, Clone, Copy)]
pub struct QuerySigner<'a> {
    pub credentials: &'a SigningCredentials,
    pub algorithm: SignatureAlgorithm,
}

/// Encode `xml` into a redirect URL for `destination`.
///
/// When a signer is given, `SigAlg` and `Signature` are appended and the
/// signature covers `SAMLRequest=…[&RelayState=…]&SigAlg=…` exactly as
/// it appears in the URL.
pub fn encode(
    xml: &str,
    message_type: MessageType,
    destination: &str,
    relay_state: Option<&str>,
    signer: Option<QuerySigner<'_>>,
) -> SamlResult<String> {
    let compressed = deflate_compress(xml.as_bytes())?;
    let encoded = BASE64.encode(compressed);

    let mut query = format!("{}={}", message_type.param(), urlencoding::encode(&encoded));
    if let Some(rs) = relay_state {
        query.push_str(&format!("&RelayState={}", urlencoding::encode(rs)));
    }
    if let Some(signer) = signer {
        query.push_str(&format!(
            "&SigAlg={}",
            urlencoding::encode(signer.algorithm.uri())
        ));
        let signature = signer.credentials.sign(signer.algorithm, query.as_bytes())?;
        query.push_str(&format!(
            "&Signature={}",
            urlencoding::encode(&BASE64.encode(signature))
        ));
    }

    let separator = if destination.contains('?') { '&' } else { '?' };
    Ok(format!("{destination}{separator}{query}"))
}

/// Decode a redirect-bound message from the raw query string.
///
/// Values are kept in their received encoding to rebuild the signed octets,
/// since re-encoding may not reproduce what the sender signed.
pub fn decode(raw_query: &str) -> SamlResult<DecodedMessage> {
    let raw: Vec<(&str, &str)> = raw_query
        .trim_start_matches('?')
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
        .collect();

    let request = unique_param(&raw, "SAMLRequest")?;
    let response = unique_param(&raw, "SAMLResponse")?;
    let (message_type, raw_message) = match (request, response) {
        (Some(v), None) => (MessageType::Request, v),
        (None, Some(v)) => (MessageType::Response, v),
        (Some(_), Some(_)) => {
            return Err(malformed("both SAMLRequest and SAMLResponse present"))
        }
        (None, None) => return Err(malformed("no SAMLRequest or SAMLResponse parameter")),
    };

    let compressed = BASE64
        .decode(form_decode(raw_message)?.as_bytes())
        .map_err(|e| malformed(format!("invalid base64: {e}")))?;
    let xml = String::from_utf8(deflate_decompress(&compressed)?)
        .map_err(|e| malformed(format!("message is not UTF-8: {e}")))?;

    let raw_relay_state = unique_param(&raw, "RelayState")?;
    let relay_state = raw_relay_state.map(form_decode).transpose()?;

    let query_signature = match (unique_param(&raw, "SigAlg")?, unique_param(&raw, "Signature")?) {
        (Some(sig_alg), Some(signature)) => {
            let mut signed_octets = format!("{}={}", message_type.param(), raw_message);
            if let Some(rs) = raw_relay_state {
                signed_octets.push_str("&RelayState=");
                signed_octets.push_str(rs);
            }
            signed_octets.push_str("&SigAlg=");
            signed_octets.push_str(sig_alg);

            let compact: String = form_decode(signature)?.split_whitespace().collect();
            let signature = BASE64
                .decode(compact.as_bytes())
                .map_err(|e| malformed(format!("invalid base64 in Signature: {e}")))?;
            Some(QuerySignature {
                sig_alg: form_decode(sig_alg)?,
                signature,
                signed_octets,
            })
        }
        (None, None) => None,
        _ => return Err(malformed("SigAlg and Signature must be sent together")),
    };

    Ok(DecodedMessage {
        xml,
        message_type,
        binding: Binding::HttpRedirect,
        relay_state,
        query_signature,
    })
}

/// Verify a redirect query signature against the trusted certificates.
pub fn verify_query_signature(
    signature: &QuerySignature,
    trusted: &[TrustedCertificate],
) -> SamlResult<SignatureAlgorithm> {
    let algorithm = SignatureAlgorithm::from_uri(&signature.sig_alg).ok_or_else(|| {
        SamlError::Signature(format!("unsupported SigAlg {}", signature.sig_alg))
    })?;
    if trusted.iter().any(|cert| {
        cert.verify(
            algorithm,
            signature.signed_octets.as_bytes(),
            &signature.signature,
        )
    }) {
        Ok(algorithm)
    } else {
        Err(SamlError::Signature(
            "query signature does not verify against any trusted certificate".to_string(),
        ))
    }
}

fn unique_param<'q>(raw: &[(&str, &'q str)], name: &str) -> SamlResult<Option<&'q str>> {
    let mut values = raw.iter().filter(|(k, _)| *k == name).map(|(_, v)| *v);
    let first = values.next();
    if values.next().is_some() {
        return Err(malformed(format!("parameter {name} repeated")));
    }
    Ok(first)
}

fn form_decode(value: &str) -> SamlResult<String> {
    urlencoding::decode(&value.replace('+', " "))
        .map(|v| v.into_owned())
        .map_err(|e| malformed(format!("invalid URL encoding: {e}")))
}

fn deflate_compress(data: &[u8]) -> SamlResult<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| SamlError::Internal(format!("compression error: {e}")))?;
    encoder
        .finish()
        .map_err(|e| SamlError::Internal(format!("compression error: {e}")))
}

fn deflate_decompress(data: &[u8]) -> SamlResult<Vec<u8>> {
    let mut decompressed = Vec::new();
    DeflateDecoder::new(data)
        .take(MAX_INFLATED_BYTES + 1)
        .read_to_end(&mut decompressed)
        .map_err(|e| malformed(format!("invalid DEFLATE data: {e}")))?;
    if decompressed.len() as u64 > MAX_INFLATED_BYTES {
        return Err(malformed("inflated message too large"));
    }
    Ok(decompressed)
}
