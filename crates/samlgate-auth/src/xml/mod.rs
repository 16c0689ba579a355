//! Minimal namespace-aware XML tree.
//!
//! SAML messages are small, so they are parsed into an owned tree that keeps
//! exactly what canonicalization and signature checks need: qualified names,
//! resolved namespaces, the namespace declarations made on each element and
//! the in-scope bindings. Comments and processing instructions are dropped,
//! and documents with a DOCTYPE are rejected outright.

pub mod c14n;
pub mod dsig;

use std::collections::BTreeMap;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

/// The `xml:` namespace, bound implicitly in every document.
pub const NS_XML: &str = "http://www.w3.org/XML/1998/namespace";

/// Nesting limit for parsed documents.
const MAX_DEPTH: usize = 128;

/// In-scope namespace bindings keyed by prefix (`""` is the default namespace).
pub type NamespaceScope = BTreeMap<String, String>;

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while parsing XML.
#[derive(Debug, thiserror::Error)]
pub enum XmlError {
    /// The document is not well-formed.
    #[error("XML syntax error: {message}")]
    Syntax {
        /// Parser message.
        message: String,
    },

    /// DOCTYPE declarations are not accepted.
    #[error("DOCTYPE is not allowed")]
    DoctypeForbidden,

    /// A prefix is used without being declared.
    #[error("Unbound namespace prefix: {prefix}")]
    UnboundPrefix {
        /// The undeclared prefix.
        prefix: String,
    },

    /// The document has no root element.
    #[error("Document has no root element")]
    NoRootElement,

    /// Content appears outside of the single root element.
    #[error("Unexpected content outside the root element")]
    ContentOutsideRoot,

    /// The document nests deeper than the parser allows.
    #[error("Document exceeds maximum nesting depth of {MAX_DEPTH}")]
    TooDeep,
}

impl XmlError {
    fn syntax(message: impl Into<String>) -> Self {
        Self::Syntax {
            message: message.into(),
        }
    }
}

impl From<quick_xml::Error> for XmlError {
    fn from(err: quick_xml::Error) -> Self {
        Self::syntax(err.to_string())
    }
}

// ============================================================================
// Tree
// ============================================================================

/// A node below an element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// Child element.
    Element(Element),
    /// Character data (entity references already expanded).
    Text(String),
}

/// An attribute that is not a namespace declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    /// Prefix as written, if any.
    pub prefix: Option<String>,
    /// Local name.
    pub name: String,
    /// Resolved namespace. Unprefixed attributes have none.
    pub namespace: Option<String>,
    /// Normalized value.
    pub value: String,
}

/// An XML element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    /// Prefix as written, if any.
    pub prefix: Option<String>,
    /// Local name.
    pub name: String,
    /// Resolved namespace URI.
    pub namespace: Option<String>,
    /// Namespace declarations written on this element, in document order.
    pub namespace_decls: Vec<(Option<String>, String)>,
    /// Attributes other than namespace declarations, in document order.
    pub attributes: Vec<Attribute>,
    /// Child nodes.
    pub children: Vec<Node>,
    scope: NamespaceScope,
}

impl Element {
    /// Creates an element in `namespace` with the given prefix.
    ///
    /// The in-scope bindings are filled in by [`Element::resolve_namespaces`].
    #[must_use]
    pub fn new(prefix: Option<&str>, name: &str, namespace: &str) -> Self {
        Self {
            prefix: prefix.map(str::to_string),
            name: name.to_string(),
            namespace: Some(namespace.to_string()),
            namespace_decls: Vec::new(),
            attributes: Vec::new(),
            children: Vec::new(),
            scope: NamespaceScope::new(),
        }
    }

    /// Adds a namespace declaration.
    #[must_use]
    pub fn with_namespace_decl(mut self, prefix: Option<&str>, uri: &str) -> Self {
        self.namespace_decls
            .push((prefix.map(str::to_string), uri.to_string()));
        self
    }

    /// Adds an unqualified attribute.
    #[must_use]
    pub fn with_attr(mut self, name: &str, value: &str) -> Self {
        self.set_attr(name, value);
        self
    }

    /// Appends a child element.
    #[must_use]
    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    /// Appends a text node.
    #[must_use]
    pub fn with_text(mut self, text: &str) -> Self {
        self.children.push(Node::Text(text.to_string()));
        self
    }

    /// Sets (or replaces) an unqualified attribute.
    pub fn set_attr(&mut self, name: &str, value: &str) {
        match self
            .attributes
            .iter_mut()
            .find(|a| a.prefix.is_none() && a.name == name)
        {
            Some(attr) => attr.value = value.to_string(),
            None => self.attributes.push(Attribute {
                prefix: None,
                name: name.to_string(),
                namespace: None,
                value: value.to_string(),
            }),
        }
    }

    /// Returns `true` if this element has the given namespace and local name.
    #[must_use]
    pub fn is(&self, namespace: &str, name: &str) -> bool {
        self.name == name && self.namespace.as_deref() == Some(namespace)
    }

    /// Returns the value of an unqualified attribute.
    #[must_use]
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.namespace.is_none() && a.name == name)
            .map(|a| a.value.as_str())
    }

    /// Iterates over the child elements.
    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    /// Iterates over the child elements with the given name.
    pub fn children_named<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> impl Iterator<Item = &'a Element> + 'a {
        self.elements().filter(move |e| e.is(namespace, name))
    }

    /// Returns the first child element with the given name.
    #[must_use]
    pub fn child(&self, namespace: &str, name: &str) -> Option<&Element> {
        self.elements().find(|e| e.is(namespace, name))
    }

    /// Returns the first child element with the given name, mutably.
    pub fn child_mut(&mut self, namespace: &str, name: &str) -> Option<&mut Element> {
        self.children.iter_mut().find_map(|n| match n {
            Node::Element(e) if e.is(namespace, name) => Some(e),
            _ => None,
        })
    }

    /// Concatenated direct text content.
    #[must_use]
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|n| match n {
                Node::Text(t) => Some(t.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    /// Namespace bindings in scope at this element.
    #[must_use]
    pub fn in_scope(&self) -> &NamespaceScope {
        &self.scope
    }

    /// Visits this element and all of its descendants in document order.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a Element)) {
        visit(self);
        for child in self.elements() {
            child.walk(visit);
        }
    }

    /// Resolves prefixes against `inherited` plus the declarations made on
    /// this element, recursively.
    ///
    /// # Errors
    /// Returns [`XmlError::UnboundPrefix`] for an undeclared prefix.
    pub fn resolve_namespaces(&mut self, inherited: &NamespaceScope) -> Result<(), XmlError> {
        let mut scope = inherited.clone();
        for (prefix, uri) in &self.namespace_decls {
            scope.insert(prefix.clone().unwrap_or_default(), uri.clone());
        }

        self.namespace = match &self.prefix {
            Some(p) => Some(lookup(&scope, p)?),
            None => scope.get("").filter(|u| !u.is_empty()).cloned(),
        };
        for attr in &mut self.attributes {
            attr.namespace = match &attr.prefix {
                Some(p) => Some(lookup(&scope, p)?),
                None => None,
            };
        }
        for child in &mut self.children {
            if let Node::Element(e) = child {
                e.resolve_namespaces(&scope)?;
            }
        }

        self.scope = scope;
        Ok(())
    }

    /// Serializes the element, writing namespace declarations where they were
    /// declared.
    #[must_use]
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_xml(&mut out);
        out
    }

    fn write_xml(&self, out: &mut String) {
        out.push('<');
        push_qname(out, self.prefix.as_deref(), &self.name);
        for (prefix, uri) in &self.namespace_decls {
            match prefix {
                Some(p) => {
                    out.push_str(" xmlns:");
                    out.push_str(p);
                }
                None => out.push_str(" xmlns"),
            }
            out.push_str("=\"");
            out.push_str(&escape_attr(uri));
            out.push('"');
        }
        for attr in &self.attributes {
            out.push(' ');
            push_qname(out, attr.prefix.as_deref(), &attr.name);
            out.push_str("=\"");
            out.push_str(&escape_attr(&attr.value));
            out.push('"');
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for child in &self.children {
            match child {
                Node::Element(e) => e.write_xml(out),
                Node::Text(t) => out.push_str(&escape_text(t)),
            }
        }
        out.push_str("</");
        push_qname(out, self.prefix.as_deref(), &self.name);
        out.push('>');
    }
}

fn lookup(scope: &NamespaceScope, prefix: &str) -> Result<String, XmlError> {
    scope
        .get(prefix)
        .filter(|u| !u.is_empty())
        .cloned()
        .ok_or_else(|| XmlError::UnboundPrefix {
            prefix: prefix.to_string(),
        })
}

fn push_qname(out: &mut String, prefix: Option<&str>, name: &str) {
    if let Some(p) = prefix {
        out.push_str(p);
        out.push(':');
    }
    out.push_str(name);
}

/// The bindings every document starts with.
#[must_use]
pub fn root_scope() -> NamespaceScope {
    let mut scope = NamespaceScope::new();
    scope.insert("xml".to_string(), NS_XML.to_string());
    scope
}

/// Escapes text for use inside an attribute value, as canonical XML does.
#[must_use]
pub fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(c),
        }
    }
    out
}

/// Escapes character data, as canonical XML does.
#[must_use]
pub fn escape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(c),
        }
    }
    out
}

// ============================================================================
// Parsing
// ============================================================================

/// Parses a document and returns its root element.
///
/// # Errors
/// Returns an error for malformed documents, DOCTYPE declarations, undeclared
/// prefixes, text outside the root and excessive nesting.
pub fn parse(input: &str) -> Result<Element, XmlError> {
    // Line ending normalization (XML 1.0 section 2.11).
    let normalized = input.replace("\r\n", "\n").replace('\r', "\n");

    let mut reader = Reader::from_str(&normalized);
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        match reader.read_event()? {
            Event::DocType(_) => return Err(XmlError::DoctypeForbidden),
            Event::Start(start) => {
                if root.is_some() {
                    return Err(XmlError::ContentOutsideRoot);
                }
                if stack.len() >= MAX_DEPTH {
                    return Err(XmlError::TooDeep);
                }
                stack.push(start_element(&start)?);
            }
            Event::Empty(start) => {
                if root.is_some() {
                    return Err(XmlError::ContentOutsideRoot);
                }
                let element = start_element(&start)?;
                close_element(&mut stack, &mut root, element);
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| XmlError::syntax("unexpected end tag"))?;
                close_element(&mut stack, &mut root, element);
            }
            Event::Text(text) => {
                let text = text.unescape()?;
                push_text(&mut stack, &text)?;
            }
            Event::CData(data) => {
                let bytes = data.into_inner();
                let text = std::str::from_utf8(&bytes)
                    .map_err(|e| XmlError::syntax(e.to_string()))?;
                push_text(&mut stack, text)?;
            }
            Event::Decl(_) | Event::PI(_) | Event::Comment(_) => {}
            Event::Eof => break,
        }
    }

    if !stack.is_empty() {
        return Err(XmlError::syntax("unclosed element at end of input"));
    }
    let mut root = root.ok_or(XmlError::NoRootElement)?;
    root.resolve_namespaces(&root_scope())?;
    Ok(root)
}

fn close_element(stack: &mut Vec<Element>, root: &mut Option<Element>, element: Element) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(Node::Element(element)),
        None => *root = Some(element),
    }
}

fn push_text(stack: &mut [Element], text: &str) -> Result<(), XmlError> {
    let Some(parent) = stack.last_mut() else {
        if text.trim().is_empty() {
            return Ok(());
        }
        return Err(XmlError::ContentOutsideRoot);
    };
    if text.is_empty() {
        return Ok(());
    }
    match parent.children.last_mut() {
        Some(Node::Text(existing)) => existing.push_str(text),
        _ => parent.children.push(Node::Text(text.to_string())),
    }
    Ok(())
}

fn split_qname(raw: &[u8]) -> Result<(Option<String>, String), XmlError> {
    let name = std::str::from_utf8(raw).map_err(|e| XmlError::syntax(e.to_string()))?;
    match name.split_once(':') {
        Some((prefix, local)) if !prefix.is_empty() && !local.is_empty() => {
            Ok((Some(prefix.to_string()), local.to_string()))
        }
        Some(_) => Err(XmlError::syntax(format!("invalid qualified name: {name}"))),
        None => Ok((None, name.to_string())),
    }
}

fn start_element(start: &BytesStart<'_>) -> Result<Element, XmlError> {
    let (prefix, name) = split_qname(start.name().as_ref())?;
    let mut element = Element {
        prefix,
        name,
        namespace: None,
        namespace_decls: Vec::new(),
        attributes: Vec::new(),
        children: Vec::new(),
        scope: NamespaceScope::new(),
    };

    for attr in start.attributes() {
        let attr = attr.map_err(|e| XmlError::syntax(e.to_string()))?;
        let raw = std::str::from_utf8(&attr.value).map_err(|e| XmlError::syntax(e.to_string()))?;
        // Attribute-value normalization: literal whitespace becomes a space,
        // character references are preserved.
        let raw = raw.replace(['\t', '\n'], " ");
        let value = quick_xml::escape::unescape(&raw)
            .map_err(|e| XmlError::syntax(e.to_string()))?
            .into_owned();

        let (attr_prefix, attr_name) = split_qname(attr.key.as_ref())?;
        match (attr_prefix.as_deref(), attr_name.as_str()) {
            (None, "xmlns") => element.namespace_decls.push((None, value)),
            (Some("xmlns"), declared) => {
                if value.is_empty() {
                    return Err(XmlError::syntax(format!(
                        "prefix {declared} cannot be undeclared"
                    )));
                }
                element
                    .namespace_decls
                    .push((Some(declared.to_string()), value));
            }
            _ => element.attributes.push(Attribute {
                prefix: attr_prefix,
                name: attr_name,
                namespace: None,
                value,
            }),
        }
    }

    Ok(element)
}
