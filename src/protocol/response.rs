//! Pieces read out of IdP messages: NameID, status and attributes.

use chrono::{DateTime, Utc};
use roxmltree::Node;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::parse_instant;
use crate::error::ValidationError;
use crate::xml::{child, children, escape_attr, escape_text, text_of, NS_ASSERTION, NS_PROTOCOL, STATUS_SUCCESS};

/// A subject's `saml:NameID`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameId {
    pub value: String,
    pub format: Option<String>,
    pub name_qualifier: Option<String>,
    pub sp_name_qualifier: Option<String>,
}

impl NameId {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            format: None,
            name_qualifier: None,
            sp_name_qualifier: None,
        }
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    /// Read a `saml:NameID` element. An empty value is not a NameID.
    pub(crate) fn from_node(node: Node<'_, '_>) -> Option<Self> {
        let value = text_of(node);
        if value.is_empty() {
            return None;
        }
        Some(Self {
            value,
            format: node.attribute("Format").map(str::to_string),
            name_qualifier: node.attribute("NameQualifier").map(str::to_string),
            sp_name_qualifier: node.attribute("SPNameQualifier").map(str::to_string),
        })
    }

    pub(crate) fn to_xml(&self) -> String {
        let mut attrs = String::new();
        if let Some(format) = &self.format {
            attrs.push_str(&format!(r#" Format="{}""#, escape_attr(format)));
        }
        if let Some(qualifier) = &self.name_qualifier {
            attrs.push_str(&format!(r#" NameQualifier="{}""#, escape_attr(qualifier)));
        }
        if let Some(qualifier) = &self.sp_name_qualifier {
            attrs.push_str(&format!(r#" SPNameQualifier="{}""#, escape_attr(qualifier)));
        }
        format!("<saml:NameID{attrs}>{}</saml:NameID>", escape_text(&self.value))
    }
}

/// Top-level status of a protocol response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusInfo {
    pub code: String,
    pub sub_code: Option<String>,
    pub message: Option<String>,
}

impl StatusInfo {
    pub fn is_success(&self) -> bool {
        self.code == STATUS_SUCCESS
    }

    pub(crate) fn into_error(self) -> ValidationError {
        let code = match self.sub_code {
            Some(sub) => format!("{} / {}", self.code, sub),
            None => self.code,
        };
        ValidationError::Status {
            code,
            message: self.message,
        }
    }
}

/// Read `samlp:Status` from a response root. None if absent or codeless.
pub(crate) fn read_status(root: Node<'_, '_>) -> Option<StatusInfo> {
    let status = child(root, NS_PROTOCOL, "Status")?;
    let code_node = child(status, NS_PROTOCOL, "StatusCode")?;
    let code = code_node.attribute("Value")?.to_string();
    let sub_code = child(code_node, NS_PROTOCOL, "StatusCode")
        .and_then(|n| n.attribute("Value"))
        .map(str::to_string);
    let message = child(status, NS_PROTOCOL, "StatusMessage")
        .map(text_of)
        .filter(|m| !m.is_empty());
    Some(StatusInfo {
        code,
        sub_code,
        message,
    })
}

/// Collect `saml:Attribute` values from every AttributeStatement.
///
/// Repeated attribute names merge their values in document order.
pub(crate) fn extract_attributes(assertion: Node<'_, '_>) -> HashMap<String, Vec<String>> {
    let mut attributes: HashMap<String, Vec<String>> = HashMap::new();
    for statement in children(assertion, NS_ASSERTION, "AttributeStatement") {
        for attribute in children(statement, NS_ASSERTION, "Attribute") {
            let Some(name) = attribute.attribute("Name") else {
                continue;
            };
            let values = children(attribute, NS_ASSERTION, "AttributeValue").map(text_of);
            attributes.entry(name.to_string()).or_default().extend(values);
        }
    }
    attributes
}

/// Read an optional `xs:dateTime` attribute. Present but unparsable is malformed.
pub(crate) fn time_attribute(node: Node<'_, '_>, name: &str) -> Result<Option<DateTime<Utc>>, ValidationError> {
    match node.attribute(name) {
        None => Ok(None),
        Some(raw) => parse_instant(raw).map(Some).ok_or_else(|| {
            ValidationError::Malformed(format!(
                "{} has an invalid {name}: {raw}",
                node.tag_name().name()
            ))
        }),
    }
}
