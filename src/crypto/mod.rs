//! Signature algorithms, key material and message ID generation.
//!
//! Only RSA PKCS#1 v1.5 with SHA-2 digests is supported. SHA-1 based
//! algorithms are refused both when configured and when received.

pub mod keys;

pub use keys::{format_certificate, SigningCredentials, TrustedCertificate};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha384, Sha512};

pub const RSA_SHA1_URI: &str = "http://www.w3.org/2000/09/xmldsig#rsa-sha1";
pub const RSA_SHA256_URI: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
pub const RSA_SHA384_URI: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha384";
pub const RSA_SHA512_URI: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha512";

pub const SHA1_URI: &str = "http://www.w3.org/2000/09/xmldsig#sha1";
pub const SHA256_URI: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
pub const SHA384_URI: &str = "http://www.w3.org/2001/04/xmldsig-more#sha384";
pub const SHA512_URI: &str = "http://www.w3.org/2001/04/xmlenc#sha512";

/// Signature algorithm used for XML and query-string signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SignatureAlgorithm {
    #[default]
    #[serde(rename = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256")]
    RsaSha256,
    #[serde(rename = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha384")]
    RsaSha384,
    #[serde(rename = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha512")]
    RsaSha512,
}

impl SignatureAlgorithm {
    pub const fn uri(&self) -> &'static str {
        match self {
            Self::RsaSha256 => RSA_SHA256_URI,
            Self::RsaSha384 => RSA_SHA384_URI,
            Self::RsaSha512 => RSA_SHA512_URI,
        }
    }

    /// Parse from an algorithm URI. SHA-1 and unknown URIs yield `None`.
    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri {
            RSA_SHA256_URI => Some(Self::RsaSha256),
            RSA_SHA384_URI => Some(Self::RsaSha384),
            RSA_SHA512_URI => Some(Self::RsaSha512),
            _ => None,
        }
    }

    /// Digest paired with this algorithm for XML references.
    pub const fn digest(&self) -> DigestAlgorithm {
        match self {
            Self::RsaSha256 => DigestAlgorithm::Sha256,
            Self::RsaSha384 => DigestAlgorithm::Sha384,
            Self::RsaSha512 => DigestAlgorithm::Sha512,
        }
    }
}

/// Digest algorithm for XML-DSig references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    pub const fn uri(&self) -> &'static str {
        match self {
            Self::Sha256 => SHA256_URI,
            Self::Sha384 => SHA384_URI,
            Self::Sha512 => SHA512_URI,
        }
    }

    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri {
            SHA256_URI => Some(Self::Sha256),
            SHA384_URI => Some(Self::Sha384),
            SHA512_URI => Some(Self::Sha512),
            _ => None,
        }
    }

    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha256 => Sha256::digest(data).to_vec(),
            Self::Sha384 => Sha384::digest(data).to_vec(),
            Self::Sha512 => Sha512::digest(data).to_vec(),
        }
    }
}

/// Generate a SAML message ID: `_` followed by 160 random bits in hex.
///
/// The leading underscore keeps the value a valid `xs:ID` (NCName).
pub fn generate_id() -> String {
    let bytes: [u8; 20] = rand::random();
    format!("_{}", hex::encode(bytes))
}

/// Constant-time comparison for digests.
pub(crate) fn digests_equal(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
