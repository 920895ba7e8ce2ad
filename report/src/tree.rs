//! In-memory XML tree for read-modify-write of scan reports.
//!
//! Text and attribute values are stored exactly as they appear on the wire
//! (still escaped). Nothing is unescaped and re-escaped on the way through,
//! so a subtree nobody modified is written back byte-for-byte. Values set
//! through [`Element::set_attribute`] are escaped on the way in.

use std::borrow::Cow;
use std::str::FromStr;

use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::escape::escape;
use quick_xml::events::attributes::Attribute;
use quick_xml::events::{BytesCData, BytesDecl, BytesEnd, BytesPI, BytesStart, BytesText, Event};
use quick_xml::name::QName;

use crate::error::ReportError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
    CData(String),
    Comment(String),
    /// Content between `<?` and `?>` of the XML declaration.
    Decl(String),
    ProcessingInstruction(String),
    DocType(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, name: &str, value: &str) -> Self {
        self.set_attribute(name, value);
        self
    }

    /// Attribute value in its escaped wire form.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn set_attribute(&mut self, name: &str, value: &str) {
        let escaped: String = escape(value).into_owned();
        match self.attributes.iter_mut().find(|(key, _)| key == name) {
            Some(slot) => slot.1 = escaped,
            None => self.attributes.push((name.to_string(), escaped)),
        }
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(element) => Some(element),
            _ => None,
        })
    }

    pub fn child_elements_mut(&mut self) -> impl Iterator<Item = &mut Element> {
        self.children.iter_mut().filter_map(|node| match node {
            Node::Element(element) => Some(element),
            _ => None,
        })
    }

    pub fn elements_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.child_elements().filter(move |element| element.name == name)
    }

    pub fn elements_named_mut<'a>(
        &'a mut self,
        name: &'a str,
    ) -> impl Iterator<Item = &'a mut Element> {
        self.child_elements_mut()
            .filter(move |element| element.name == name)
    }

    /// First direct child element called `name`.
    pub fn find(&self, name: &str) -> Option<&Element> {
        self.child_elements().find(|element| element.name == name)
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut Element> {
        self.child_elements_mut().find(|element| element.name == name)
    }

    /// Drops direct child elements for which `keep` returns false. Non-element nodes stay.
    pub fn retain_elements(&mut self, mut keep: impl FnMut(&Element) -> bool) {
        self.children.retain(|node| match node {
            Node::Element(element) => keep(element),
            _ => true,
        });
    }

    pub fn push_element(&mut self, element: Element) {
        self.children.push(Node::Element(element));
    }

    /// Inserts `element` right after the last direct child called `anchor`,
    /// or at the front when there is none.
    pub fn insert_after_last(&mut self, anchor: &str, element: Element) {
        let position: usize = self
            .children
            .iter()
            .rposition(|node| matches!(node, Node::Element(e) if e.name == anchor))
            .map(|idx| idx + 1)
            .unwrap_or(0);
        self.children.insert(position, Node::Element(element));
    }
}

/// A whole XML document: everything before the root, the root, everything after.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub prolog: Vec<Node>,
    pub root: Element,
    pub epilog: Vec<Node>,
}

impl Document {
    pub fn parse(xml: &str) -> Result<Self, ReportError> {
        let mut reader = Reader::from_str(xml);
        let mut stack: Vec<Element> = Vec::new();
        let mut prolog: Vec<Node> = Vec::new();
        let mut epilog: Vec<Node> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            let node: Node = match reader.read_event()? {
                Event::Start(start) => {
                    stack.push(element_from(&start)?);
                    continue;
                }
                Event::End(end) => match stack.pop() {
                    Some(element) => Node::Element(element),
                    None => {
                        let name = String::from_utf8_lossy(end.name().as_ref()).into_owned();
                        return Err(ReportError::Unbalanced(name));
                    }
                },
                Event::Empty(start) => Node::Element(element_from(&start)?),
                Event::Text(text) => Node::Text(lossy(&text)),
                Event::CData(data) => Node::CData(lossy(&data)),
                Event::Comment(comment) => Node::Comment(lossy(&comment)),
                Event::Decl(decl) => Node::Decl(lossy(&decl)),
                Event::PI(pi) => Node::ProcessingInstruction(lossy(&pi)),
                Event::DocType(doctype) => Node::DocType(lossy(&doctype).trim_start().to_string()),
                Event::Eof => break,
                #[allow(unreachable_patterns)]
                _ => continue,
            };

            match stack.last_mut() {
                Some(parent) => parent.children.push(node),
                None => match node {
                    Node::Element(element) if root.is_none() => root = Some(element),
                    other if root.is_none() => prolog.push(other),
                    other => epilog.push(other),
                },
            }
        }

        if let Some(open) = stack.pop() {
            return Err(ReportError::Unbalanced(open.name));
        }

        Ok(Self {
            prolog,
            root: root.ok_or(ReportError::NoRoot)?,
            epilog,
        })
    }

    pub fn to_xml(&self) -> Result<String, ReportError> {
        let mut writer: Writer<Vec<u8>> = Writer::new(Vec::new());

        for node in &self.prolog {
            write_node(&mut writer, node)?;
        }
        write_element(&mut writer, &self.root)?;
        for node in &self.epilog {
            write_node(&mut writer, node)?;
        }

        Ok(String::from_utf8_lossy(&writer.into_inner()).into_owned())
    }
}

impl FromStr for Document {
    type Err = ReportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Document::parse(s)
    }
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn element_from(start: &BytesStart<'_>) -> Result<Element, ReportError> {
    let mut element = Element::new(lossy(start.name().as_ref()));
    for attr in start.attributes() {
        let attr: Attribute<'_> = attr?;
        element
            .attributes
            .push((lossy(attr.key.as_ref()), lossy(&attr.value)));
    }
    Ok(element)
}

fn write_node(writer: &mut Writer<Vec<u8>>, node: &Node) -> Result<(), ReportError> {
    let event: Event<'_> = match node {
        Node::Element(element) => return write_element(writer, element),
        Node::Text(text) => Event::Text(BytesText::from_escaped(text.as_str())),
        Node::CData(data) => Event::CData(BytesCData::new(data.as_str())),
        Node::Comment(comment) => Event::Comment(BytesText::from_escaped(comment.as_str())),
        Node::Decl(decl) => {
            // "xml version=..." is parsed as a start tag named "xml"
            Event::Decl(BytesDecl::from_start(BytesStart::from_content(decl.as_str(), 3)))
        }
        Node::ProcessingInstruction(pi) => Event::PI(BytesPI::new(pi.as_str())),
        Node::DocType(doctype) => Event::DocType(BytesText::from_escaped(doctype.as_str())),
    };
    writer.write_event(event)?;
    Ok(())
}

fn write_element(writer: &mut Writer<Vec<u8>>, element: &Element) -> Result<(), ReportError> {
    let mut start = BytesStart::new(element.name.as_str());
    for (key, value) in &element.attributes {
        // Pushed as a raw Attribute: the value is already escaped.
        start.push_attribute(Attribute {
            key: QName(key.as_bytes()),
            value: Cow::Borrowed(value.as_bytes()),
        });
    }

    if element.children.is_empty() {
        writer.write_event(Event::Empty(start))?;
        return Ok(());
    }

    writer.write_event(Event::Start(start))?;
    for child in &element.children {
        write_node(writer, child)?;
    }
    writer.write_event(Event::End(BytesEnd::new(element.name.as_str())))?;
    Ok(())
}
