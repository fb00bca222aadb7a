//! HTTP-POST binding.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use super::{malformed, Binding, DecodedMessage, MessageType};
use crate::error::SamlResult;

/// Render the self-submitting form carrying `xml` to `destination`.
pub fn encode(
    xml: &str,
    message_type: MessageType,
    destination: &str,
    relay_state: Option<&str>,
) -> String {
    let encoded = BASE64.encode(xml);

    let relay_state_input = relay_state
        .map(|rs| {
            format!(
                r#"<input type="hidden" name="RelayState" value="{}"/>"#,
                html_escape(rs)
            )
        })
        .unwrap_or_default();

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <title>Continue to sign in</title>
</head>
<body onload="document.forms[0].submit()">
    <form method="post" action="{action}">
        <input type="hidden" name="{param}" value="{encoded}"/>
        {relay_state_input}
        <noscript>
            <p>JavaScript is disabled. Click the button below to continue.</p>
            <input type="submit" value="Continue"/>
        </noscript>
    </form>
</body>
</html>"#,
        action = html_escape(destination),
        param = message_type.param(),
    )
}

/// Decode a POST-bound message from decoded form fields.
///
/// Whitespace inside the base64 payload is ignored; some IdPs wrap it.
pub fn decode(form: &[(String, String)]) -> SamlResult<DecodedMessage> {
    let field = |name: &str| -> SamlResult<Option<&str>> {
        let mut values = form.iter().filter(|(k, _)| k == name).map(|(_, v)| v.as_str());
        let first = values.next();
        if values.next().is_some() {
            return Err(malformed(format!("form field {name} repeated")));
        }
        Ok(first)
    };

    let (message_type, encoded) = match (field("SAMLRequest")?, field("SAMLResponse")?) {
        (Some(v), None) => (MessageType::Request, v),
        (None, Some(v)) => (MessageType::Response, v),
        (Some(_), Some(_)) => {
            return Err(malformed("both SAMLRequest and SAMLResponse present"))
        }
        (None, None) => return Err(malformed("no SAMLRequest or SAMLResponse field")),
    };

    let compact: String = encoded.split_whitespace().collect();
    let bytes = BASE64
        .decode(compact.as_bytes())
        .map_err(|e| malformed(format!("invalid base64: {e}")))?;
    let xml = String::from_utf8(bytes)
        .map_err(|e| malformed(format!("message is not UTF-8: {e}")))?;

    Ok(DecodedMessage {
        xml,
        message_type,
        binding: Binding::HttpPost,
        relay_state: field("RelayState")?.map(str::to_string),
        query_signature: None,
    })
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}
