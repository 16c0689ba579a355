//! Exclusive XML Canonicalization 1.0, without comments.
//!
//! Only namespace declarations that are visibly utilized by an output element
//! (its own prefix or the prefixes of its attributes) are rendered, plus the
//! prefixes named in an `InclusiveNamespaces` `PrefixList`.

use std::collections::BTreeMap;

use super::{Element, NamespaceScope, Node, escape_attr, escape_text};

/// Algorithm URI of exclusive canonicalization without comments.
pub const EXC_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";

/// Canonicalizes the subtree rooted at `apex`.
///
/// `inclusive_prefixes` uses `#default` for the default namespace. When
/// `exclude` is given, that element (compared by identity) and its subtree are
/// omitted, which is how the enveloped-signature transform is applied.
#[must_use]
pub fn canonicalize(
    apex: &Element,
    inclusive_prefixes: &[String],
    exclude: Option<&Element>,
) -> String {
    let inclusive: Vec<String> = inclusive_prefixes
        .iter()
        .map(|p| if p == "#default" { String::new() } else { p.clone() })
        .collect();

    let mut out = String::new();
    write_element(apex, &NamespaceScope::new(), &inclusive, exclude, &mut out);
    out
}

fn write_element(
    element: &Element,
    rendered: &NamespaceScope,
    inclusive: &[String],
    exclude: Option<&Element>,
    out: &mut String,
) {
    let scope = element.in_scope();

    let mut utilized: Vec<&str> = vec![element.prefix.as_deref().unwrap_or("")];
    utilized.extend(element.attributes.iter().filter_map(|a| a.prefix.as_deref()));

    let mut emit: BTreeMap<&str, &str> = BTreeMap::new();
    for prefix in utilized {
        if prefix == "xml" {
            continue;
        }
        let uri = scope.get(prefix).map(String::as_str).unwrap_or("");
        let current = rendered.get(prefix).map(String::as_str).unwrap_or("");
        if uri != current {
            emit.insert(prefix, uri);
        }
    }
    for prefix in inclusive {
        if prefix == "xml" {
            continue;
        }
        // Inclusive prefixes are only rendered when bound in scope.
        let Some(uri) = scope.get(prefix.as_str()) else {
            continue;
        };
        if rendered.get(prefix.as_str()) != Some(uri) {
            emit.insert(prefix.as_str(), uri.as_str());
        }
    }

    out.push('<');
    push_qname(out, element.prefix.as_deref(), &element.name);

    // Default namespace sorts first because "" is the smallest key.
    for (prefix, uri) in &emit {
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

    let mut attributes: Vec<_> = element.attributes.iter().collect();
    attributes.sort_by(|a, b| {
        let a_ns = a.namespace.as_deref().unwrap_or("");
        let b_ns = b.namespace.as_deref().unwrap_or("");
        a_ns.cmp(b_ns).then_with(|| a.name.cmp(&b.name))
    });
    for attr in attributes {
        out.push(' ');
        push_qname(out, attr.prefix.as_deref(), &attr.name);
        out.push_str("=\"");
        out.push_str(&escape_attr(&attr.value));
        out.push('"');
    }
    out.push('>');

    let mut child_rendered = rendered.clone();
    for (prefix, uri) in emit {
        child_rendered.insert(prefix.to_string(), uri.to_string());
    }

    for child in &element.children {
        match child {
            Node::Element(e) => {
                if exclude.is_some_and(|x| std::ptr::eq(x, e)) {
                    continue;
                }
                write_element(e, &child_rendered, inclusive, exclude, out);
            }
            Node::Text(t) => out.push_str(&escape_text(t)),
        }
    }

    out.push_str("</");
    push_qname(out, element.prefix.as_deref(), &element.name);
    out.push('>');
}

fn push_qname(out: &mut String, prefix: Option<&str>, name: &str) {
    if let Some(p) = prefix {
        out.push_str(p);
        out.push(':');
    }
    out.push_str(name);
}
