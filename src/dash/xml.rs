//! Minimal arena XML tree for MPD surgery.
//!
//! The rewriter moves, reorders, and deletes elements across the whole
//! document, which is awkward through a streaming reader and lossy through
//! a typed model. Nodes live in one arena and refer to each other by index;
//! detaching never invalidates other indices. quick-xml does the actual
//! reading and escaping.
//!
//! Limitations (fine for MPDs): comments are dropped, and a node's text is
//! written before its element children.

use crate::error::{ProxyError, Result};
use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::Event;

pub type NodeId = usize;

#[derive(Debug, Clone)]
pub struct Node {
    /// Qualified name as written in the source (`cenc:pssh`).
    pub name: String,
    /// Attributes in source order, qualified names preserved.
    pub attrs: Vec<(String, String)>,
    pub text: Option<String>,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
}

impl Node {
    fn new(name: String) -> Self {
        Self {
            name,
            attrs: Vec::new(),
            text: None,
            parent: None,
            children: Vec::new(),
        }
    }

    /// Local part of the element name (`pssh` for `cenc:pssh`).
    pub fn local_name(&self) -> &str {
        self.name.rsplit(':').next().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone)]
pub struct XmlTree {
    nodes: Vec<Node>,
    root: NodeId,
    declaration: Option<String>,
}

fn local(name: &str) -> &str {
    name.rsplit(':').next().unwrap_or(name)
}

impl XmlTree {
    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut nodes: Vec<Node> = Vec::new();
        let mut stack: Vec<NodeId> = Vec::new();
        let mut root: Option<NodeId> = None;
        let mut declaration = None;
        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Decl(d)) => {
                    declaration = Some(format!("<?{}?>", String::from_utf8_lossy(&d)));
                }
                Ok(Event::Start(e)) => {
                    let id = open_element(&e, reader.decoder(), &mut nodes, &stack, &mut root)?;
                    stack.push(id);
                }
                // Self-closing element: opened but never pushed (no End follows).
                Ok(Event::Empty(e)) => {
                    open_element(&e, reader.decoder(), &mut nodes, &stack, &mut root)?;
                }
                Ok(Event::Text(t)) => {
                    if let Some(&current) = stack.last() {
                        let decoded = t
                            .unescape()
                            .map_err(|e| ProxyError::Parse(format!("bad text: {e}")))?;
                        let text = nodes[current].text.get_or_insert_with(String::new);
                        text.push_str(&decoded);
                    }
                }
                Ok(Event::CData(c)) => {
                    if let Some(&current) = stack.last() {
                        let text = nodes[current].text.get_or_insert_with(String::new);
                        text.push_str(&String::from_utf8_lossy(&c));
                    }
                }
                Ok(Event::End(_)) => {
                    stack.pop();
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => return Err(ProxyError::Parse(format!("malformed XML: {e}"))),
            }
            buf.clear();
        }

        let root = root.ok_or_else(|| ProxyError::Parse("empty XML document".into()))?;
        Ok(Self {
            nodes,
            root,
            declaration,
        })
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    /// Attribute lookup by local name (prefix-insensitive).
    pub fn attr(&self, id: NodeId, name: &str) -> Option<&str> {
        self.nodes[id]
            .attrs
            .iter()
            .find(|(k, _)| local(k).eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Set an attribute, replacing by local name; appends when absent.
    pub fn set_attr(&mut self, id: NodeId, name: &str, value: &str) {
        let node = &mut self.nodes[id];
        for (k, v) in &mut node.attrs {
            if local(k).eq_ignore_ascii_case(name) {
                *v = value.to_string();
                return;
            }
        }
        node.attrs.push((name.to_string(), value.to_string()));
    }

    pub fn remove_attr(&mut self, id: NodeId, name: &str) -> bool {
        let node = &mut self.nodes[id];
        let before = node.attrs.len();
        node.attrs.retain(|(k, _)| !local(k).eq_ignore_ascii_case(name));
        node.attrs.len() != before
    }

    /// Direct children with the given local name.
    pub fn children_named(&self, id: NodeId, name: &str) -> Vec<NodeId> {
        self.nodes[id]
            .children
            .iter()
            .copied()
            .filter(|&c| self.nodes[c].local_name().eq_ignore_ascii_case(name))
            .collect()
    }

    /// First direct child with the given local name.
    pub fn child_named(&self, id: NodeId, name: &str) -> Option<NodeId> {
        self.children_named(id, name).into_iter().next()
    }

    /// All descendants (depth-first) with the given local name.
    pub fn descendants_named(&self, id: NodeId, name: &str) -> Vec<NodeId> {
        let mut found = Vec::new();
        let mut stack: Vec<NodeId> = self.nodes[id].children.iter().rev().copied().collect();
        while let Some(current) = stack.pop() {
            if self.nodes[current].local_name().eq_ignore_ascii_case(name) {
                found.push(current);
            }
            stack.extend(self.nodes[current].children.iter().rev().copied());
        }
        found
    }

    /// Create a detached element.
    pub fn create(&mut self, name: &str) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node::new(name.to_string()));
        id
    }

    /// Attach `child` at the end of `parent`'s children.
    pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
        self.detach(child);
        self.nodes[child].parent = Some(parent);
        self.nodes[parent].children.push(child);
    }

    /// Insert `child` under `parent` immediately after `sibling`.
    pub fn insert_after(&mut self, parent: NodeId, sibling: NodeId, child: NodeId) {
        self.detach(child);
        self.nodes[child].parent = Some(parent);
        let pos = self.nodes[parent]
            .children
            .iter()
            .position(|&c| c == sibling)
            .map(|p| p + 1)
            .unwrap_or(self.nodes[parent].children.len());
        self.nodes[parent].children.insert(pos, child);
    }

    /// Deep-copy a subtree; the copy is detached until appended somewhere.
    pub fn clone_subtree(&mut self, id: NodeId) -> NodeId {
        let source = self.nodes[id].clone();
        let copy = self.nodes.len();
        self.nodes.push(Node {
            name: source.name,
            attrs: source.attrs,
            text: source.text,
            parent: None,
            children: Vec::new(),
        });
        for child in source.children {
            let child_copy = self.clone_subtree(child);
            self.nodes[child_copy].parent = Some(copy);
            self.nodes[copy].children.push(child_copy);
        }
        copy
    }

    /// Remove the node from its parent. The arena slot survives (indices
    /// stay valid) but the node no longer serializes.
    pub fn detach(&mut self, id: NodeId) {
        if let Some(parent) = self.nodes[id].parent.take() {
            self.nodes[parent].children.retain(|&c| c != id);
        }
    }

    /// Replace a parent's child list (used for reordering). Every id must
    /// already be a child of `parent`.
    pub fn set_children(&mut self, parent: NodeId, children: Vec<NodeId>) {
        debug_assert_eq!(
            {
                let mut a = self.nodes[parent].children.clone();
                a.sort_unstable();
                a
            },
            {
                let mut b = children.clone();
                b.sort_unstable();
                b
            },
            "set_children must be a permutation"
        );
        self.nodes[parent].children = children;
    }

    pub fn serialize(&self) -> String {
        let mut out = String::new();
        if let Some(decl) = &self.declaration {
            out.push_str(decl);
            out.push('\n');
        }
        self.write_node(self.root, &mut out);
        out
    }

    fn write_node(&self, id: NodeId, out: &mut String) {
        let node = &self.nodes[id];
        out.push('<');
        out.push_str(&node.name);
        for (k, v) in &node.attrs {
            out.push(' ');
            out.push_str(k);
            out.push_str("=\"");
            out.push_str(&escape(v.as_str()));
            out.push('"');
        }
        let has_text = node.text.as_deref().is_some_and(|t| !t.is_empty());
        if node.children.is_empty() && !has_text {
            out.push_str("/>");
            return;
        }
        out.push('>');
        if let Some(text) = &node.text {
            out.push_str(&escape(text.as_str()));
        }
        for &child in &node.children {
            self.write_node(child, out);
        }
        out.push_str("</");
        out.push_str(&node.name);
        out.push('>');
    }
}

/// Materialize a start/empty tag into the arena and link it to the current
/// stack top (or make it the root).
fn open_element(
    e: &quick_xml::events::BytesStart<'_>,
    decoder: quick_xml::Decoder,
    nodes: &mut Vec<Node>,
    stack: &[NodeId],
    root: &mut Option<NodeId>,
) -> Result<NodeId> {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut node = Node::new(name);
    for attr in e.attributes() {
        let attr = attr.map_err(|err| ProxyError::Parse(format!("bad attribute: {err}")))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .decode_and_unescape_value(decoder)
            .map_err(|err| ProxyError::Parse(format!("bad attribute: {err}")))?
            .into_owned();
        node.attrs.push((key, value));
    }
    node.parent = stack.last().copied();
    let id = nodes.len();
    nodes.push(node);
    if let Some(&parent) = stack.last() {
        nodes[parent].children.push(id);
    } else if root.is_none() {
        *root = Some(id);
    }
    Ok(id)
}
