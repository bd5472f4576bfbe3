//! RESTXML call-flow documents: parsing, the element contract and the registry
//!
//! A document is a `Response` root whose children are elements from a closed,
//! registered vocabulary. Parsing happens in two passes: every top-level tag is
//! checked against the registry first, then elements are instantiated and their
//! nested children validated against each element's allow-list. A rejected
//! document instantiates nothing.

mod elements;

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use async_trait::async_trait;
use quick_xml::events::Event as XmlEvent;
use quick_xml::Reader;

use crate::error::{CallResult, RestXmlError};
use crate::http::HttpMethod;
use crate::session::CallControl;

pub use elements::{Hangup, Play, PreAnswer, Redirect, Speak, Wait};

/// Root tag every document must carry.
pub const ROOT_TAG: &str = "Response";

/// Elements that never trigger the implicit answer of an inbound call.
pub const NO_ANSWER_ELEMENTS: &[&str] = &["Wait", "PreAnswer", "Dial", "Hangup"];

/// A parsed XML element before it is bound to an [`Element`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlNode {
    pub tag: String,
    pub attributes: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<XmlNode>,
}

impl XmlNode {
    fn new(tag: String) -> Self {
        Self {
            tag,
            ..Default::default()
        }
    }

    /// Attribute value by exact name.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Text content, trimmed.
    pub fn text(&self) -> &str {
        self.text
            .trim()
    }
}

/// How executing an element (or a whole document) ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    /// Continue with the next element.
    Completed,
    /// Stop and fetch a new document.
    Redirect(RedirectTarget),
    /// The channel hung up while the element ran.
    HungUp,
}

/// Where a redirect sends the session next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectTarget {
    pub url: String,
    pub method: HttpMethod,
    pub params: BTreeMap<String, String>,
}

/// One instruction of a call-flow document.
#[async_trait]
pub trait Element: Send + Sync + fmt::Debug {
    /// Tag name this element is registered under.
    fn tag(&self) -> &'static str;

    /// Tags accepted as nested children. Empty means no children at all.
    fn nestables(&self) -> &'static [&'static str] {
        &[]
    }

    /// Read attributes and text from `node`. Relative URLs resolve against `target_url`.
    fn parse_element(&mut self, node: &XmlNode, target_url: &str) -> Result<(), RestXmlError>;

    /// Take ownership of a validated nested child.
    fn attach_child(&mut self, _child: Box<dyn Element>) -> Result<(), RestXmlError> {
        Err(RestXmlError::Format(format!(
            "{} cannot have any children!",
            self.tag()
        )))
    }

    /// Work done before the answer decision, e.g. prefetching media.
    async fn prepare(&mut self) -> CallResult<()> {
        Ok(())
    }

    /// Drive the channel.
    async fn run(&self, control: &CallControl) -> CallResult<Flow>;
}

/// Builds a fresh, unparsed element.
pub type ElementFactory = fn() -> Box<dyn Element>;

/// Tag name to element factory.
#[derive(Clone, Default)]
pub struct ElementRegistry {
    factories: HashMap<&'static str, ElementFactory>,
}

impl fmt::Debug for ElementRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<_> = self
            .factories
            .keys()
            .collect();
        tags.sort();
        f.debug_struct("ElementRegistry")
            .field("tags", &tags)
            .finish()
    }
}

impl ElementRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the shipped vocabulary.
    pub fn builtin() -> Self {
        Self::new()
            .register("Speak", || Box::new(Speak::default()))
            .register("Play", || Box::new(Play::default()))
            .register("Wait", || Box::new(Wait::default()))
            .register("PreAnswer", || Box::new(PreAnswer::default()))
            .register("Hangup", || Box::new(Hangup::default()))
            .register("Redirect", || Box::new(Redirect::default()))
    }

    /// Add or replace the factory for `tag`.
    pub fn register(mut self, tag: &'static str, factory: ElementFactory) -> Self {
        self.factories
            .insert(tag, factory);
        self
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.factories
            .contains_key(tag)
    }

    /// New element for `tag`, if registered.
    pub fn create(&self, tag: &str) -> Option<Box<dyn Element>> {
        self.factories
            .get(tag)
            .map(|factory| factory())
    }
}

/// Parse a document into its top-level elements, in document order.
pub fn parse_document(
    text: &str,
    registry: &ElementRegistry,
    target_url: &str,
) -> Result<Vec<Box<dyn Element>>, RestXmlError> {
    let collapsed = text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let root = parse_xml(&collapsed)?;
    if root.tag != ROOT_TAG {
        return Err(RestXmlError::Format("No Response Tag Present".into()));
    }

    if let Some(unknown) = root
        .children
        .iter()
        .find(|child| !registry.contains(&child.tag))
    {
        return Err(RestXmlError::UnrecognizedElement(
            unknown
                .tag
                .clone(),
        ));
    }

    root.children
        .iter()
        .map(|node| build_element(node, registry, target_url))
        .collect()
}

fn build_element(
    node: &XmlNode,
    registry: &ElementRegistry,
    target_url: &str,
) -> Result<Box<dyn Element>, RestXmlError> {
    let mut element = registry
        .create(&node.tag)
        .ok_or_else(|| RestXmlError::UnrecognizedElement(node.tag.clone()))?;
    element.parse_element(node, target_url)?;

    if node
        .children
        .is_empty()
    {
        return Ok(element);
    }
    let nestables = element.nestables();
    if nestables.is_empty() {
        return Err(RestXmlError::Format(format!(
            "{} cannot have any children!",
            element.tag()
        )));
    }
    for child in &node.children {
        if !nestables.contains(&child.tag.as_str()) {
            return Err(RestXmlError::Format(format!(
                "{} is not nestable inside {}",
                child.tag,
                element.tag()
            )));
        }
        let child = build_element(child, registry, target_url)?;
        element.attach_child(child)?;
    }
    Ok(element)
}

/// Build the element tree of `text`. Only the first root element is kept.
fn parse_xml(text: &str) -> Result<XmlNode, RestXmlError> {
    let mut reader = Reader::from_str(text);
    reader
        .config_mut()
        .trim_text(true);

    let mut stack: Vec<XmlNode> = Vec::new();
    let mut root: Option<XmlNode> = None;

    loop {
        let event = match reader.read_event() {
            Ok(event) => event,
            Err(e) => return Err(syntax_error(&reader, e)),
        };
        match event {
            XmlEvent::Start(start) => {
                stack.push(open_node(&start)?);
            }
            XmlEvent::Empty(start) => {
                let node = open_node(&start)?;
                close_node(&mut stack, &mut root, node);
            }
            XmlEvent::End(_) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| RestXmlError::Syntax("unexpected closing tag".into()))?;
                close_node(&mut stack, &mut root, node);
            }
            XmlEvent::Text(text) => {
                let text = text
                    .unescape()
                    .map_err(|e| RestXmlError::Syntax(e.to_string()))?;
                append_text(&mut stack, &text);
            }
            XmlEvent::CData(data) => {
                let raw = data.into_inner();
                append_text(&mut stack, &String::from_utf8_lossy(&raw));
            }
            XmlEvent::Eof => break,
            _ => {}
        }
    }

    if let Some(open) = stack.last() {
        return Err(RestXmlError::Syntax(format!("unclosed element {}", open.tag)));
    }
    root.ok_or_else(|| RestXmlError::Syntax("no root element".into()))
}

fn syntax_error(reader: &Reader<&[u8]>, err: quick_xml::Error) -> RestXmlError {
    RestXmlError::Syntax(format!(
        "Invalid RESTXML Response Syntax: {} at position {}",
        err,
        reader.buffer_position()
    ))
}

fn open_node(start: &quick_xml::events::BytesStart<'_>) -> Result<XmlNode, RestXmlError> {
    let tag = String::from_utf8_lossy(
        start
            .name()
            .as_ref(),
    )
    .into_owned();
    let mut node = XmlNode::new(tag);
    for attr in start.attributes() {
        let attr = attr.map_err(|e| RestXmlError::Syntax(e.to_string()))?;
        let key = String::from_utf8_lossy(
            attr.key
                .as_ref(),
        )
        .into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| RestXmlError::Syntax(e.to_string()))?
            .into_owned();
        node.attributes
            .push((key, value));
    }
    Ok(node)
}

fn close_node(stack: &mut Vec<XmlNode>, root: &mut Option<XmlNode>, node: XmlNode) {
    match stack.last_mut() {
        Some(parent) => parent
            .children
            .push(node),
        None => {
            if root.is_none() {
                *root = Some(node);
            }
        }
    }
}

fn append_text(stack: &mut [XmlNode], text: &str) {
    if let Some(node) = stack.last_mut() {
        node.text
            .push_str(text);
    }
}
