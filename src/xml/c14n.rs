//! Exclusive XML Canonicalization 1.0, without comments.
//!
//! Algorithm URI: `http://www.w3.org/2001/10/xml-exc-c14n#`
//!
//! Only namespace declarations that are visibly utilized by an element (its
//! own prefix, its attributes' prefixes, or a prefix listed in the
//! `InclusiveNamespaces` PrefixList) are rendered, and only when an output
//! ancestor has not already rendered the same binding.

use roxmltree::{Node, NodeId, NodeType};
use std::collections::BTreeMap;

use super::NS_XML;

pub const EXC_C14N_URI: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";

/// Canonicalize the subtree rooted at `apex`.
///
/// `exclude` names one descendant element omitted with its subtree; this is
/// how the enveloped-signature transform drops `ds:Signature`.
pub fn canonicalize(apex: Node<'_, '_>, exclude: Option<NodeId>, inclusive_prefixes: &[String]) -> String {
    let mut out = String::new();
    let rendered = BTreeMap::new();
    render_element(apex, exclude, inclusive_prefixes, &rendered, &mut out);
    out
}

fn render_element(
    node: Node<'_, '_>,
    exclude: Option<NodeId>,
    inclusive_prefixes: &[String],
    rendered: &BTreeMap<String, String>,
    out: &mut String,
) {
    let elem_prefix = element_prefix(node);
    let qname = match elem_prefix {
        Some(prefix) => format!("{}:{}", prefix, node.tag_name().name()),
        None => node.tag_name().name().to_string(),
    };

    // Visibly utilized prefixes; "" is the default namespace.
    let mut utilized: Vec<String> = vec![elem_prefix.unwrap_or("").to_string()];
    for attr in node.attributes() {
        if let Some(uri) = attr.namespace() {
            if uri != NS_XML {
                if let Some(prefix) = attribute_prefix(node, uri) {
                    utilized.push(prefix.to_string());
                }
            }
        }
    }
    for prefix in inclusive_prefixes {
        if prefix == "#default" {
            utilized.push(String::new());
        } else {
            utilized.push(prefix.clone());
        }
    }
    utilized.sort();
    utilized.dedup();

    let mut now_rendered = rendered.clone();
    let mut decls: Vec<(String, String)> = Vec::new();
    for prefix in &utilized {
        if prefix == "xml" {
            continue;
        }
        let lookup = if prefix.is_empty() { None } else { Some(prefix.as_str()) };
        match node.lookup_namespace_uri(lookup) {
            Some(uri) => {
                if rendered.get(prefix).map(String::as_str) != Some(uri) {
                    decls.push((prefix.clone(), uri.to_string()));
                    now_rendered.insert(prefix.clone(), uri.to_string());
                }
            }
            None if prefix.is_empty() => {
                // Undeclare a default namespace rendered by an ancestor.
                if rendered.get("").is_some_and(|uri| !uri.is_empty()) {
                    decls.push((String::new(), String::new()));
                    now_rendered.insert(String::new(), String::new());
                }
            }
            None => {}
        }
    }
    // Sorted by prefix; the default namespace ("") sorts first.
    decls.sort();

    let mut attrs: Vec<(String, String, String, String)> = node
        .attributes()
        .map(|attr| {
            let ns = attr.namespace().unwrap_or("").to_string();
            let qname = match attr.namespace() {
                Some(NS_XML) => format!("xml:{}", attr.name()),
                Some(uri) => match attribute_prefix(node, uri) {
                    Some(prefix) => format!("{}:{}", prefix, attr.name()),
                    None => attr.name().to_string(),
                },
                None => attr.name().to_string(),
            };
            (ns, attr.name().to_string(), qname, attr.value().to_string())
        })
        .collect();
    // Unqualified attributes first (empty namespace URI), then by URI and
    // local name.
    attrs.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));

    out.push('<');
    out.push_str(&qname);
    for (prefix, uri) in &decls {
        if prefix.is_empty() {
            out.push_str(" xmlns=\"");
        } else {
            out.push_str(" xmlns:");
            out.push_str(prefix);
            out.push_str("=\"");
        }
        out.push_str(&escape_attr(uri));
        out.push('"');
    }
    for (_, _, qname, value) in &attrs {
        out.push(' ');
        out.push_str(qname);
        out.push_str("=\"");
        out.push_str(&escape_attr(value));
        out.push('"');
    }
    out.push('>');

    for child in node.children() {
        match child.node_type() {
            NodeType::Element => {
                if exclude == Some(child.id()) {
                    continue;
                }
                render_element(child, exclude, inclusive_prefixes, &now_rendered, out);
            }
            NodeType::Text => {
                if let Some(text) = child.text() {
                    out.push_str(&escape_text(text));
                }
            }
            NodeType::PI => {
                if let Some(pi) = child.pi() {
                    out.push_str("<?");
                    out.push_str(pi.target);
                    if let Some(value) = pi.value.filter(|v| !v.is_empty()) {
                        out.push(' ');
                        out.push_str(&value.replace('\r', "&#xD;"));
                    }
                    out.push_str("?>");
                }
            }
            NodeType::Comment | NodeType::Root => {}
        }
    }

    out.push_str("</");
    out.push_str(&qname);
    out.push('>');
}

/// The prefix an element was written with.
///
/// The parsed tree only keeps expanded names, so the qualified name is read
/// back from the source text at the element's start tag.
fn element_prefix<'a>(node: Node<'a, '_>) -> Option<&'a str> {
    let input = node.document().input_text();
    let start = node.range().start + 1;
    let tail = input.get(start..)?;
    let end = tail
        .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
        .unwrap_or(tail.len());
    let qname = &tail[..end];
    match qname.split_once(':') {
        Some((prefix, local)) if local == node.tag_name().name() => Some(prefix),
        Some(_) => None,
        None if qname == node.tag_name().name() => None,
        // Source position did not line up with the tag; fall back to the
        // namespace bindings in scope.
        None => node
            .tag_name()
            .namespace()
            .and_then(|uri| node.lookup_prefix(uri))
            .filter(|p| !p.is_empty()),
    }
}

/// A non-default prefix bound to `uri` in scope at `node`.
fn attribute_prefix<'a>(node: Node<'a, '_>, uri: &str) -> Option<&'a str> {
    node.namespaces()
        .find(|ns| ns.uri() == uri && ns.name().is_some())
        .and_then(|ns| ns.name())
}

fn escape_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(ch),
        }
    }
    out
}

fn escape_attr(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(ch),
        }
    }
    out
}
