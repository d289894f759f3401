use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type Attrs = BTreeMap<String, String>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NodeContent {
    #[default]
    Empty,
    Nodes(Vec<Node>),
    Bytes(Vec<u8>),
}

/// Generic tagged tree exchanged with the transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub tag: String,
    pub attrs: Attrs,
    pub content: NodeContent,
}

impl Node {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attrs: Attrs::new(),
            content: NodeContent::Empty,
        }
    }

    pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    pub fn attrs(mut self, attrs: &Attrs) -> Self {
        for (k, v) in attrs.iter() {
            self.attrs.insert(k.clone(), v.clone());
        }
        self
    }

    pub fn children(mut self, children: Vec<Node>) -> Self {
        self.content = NodeContent::Nodes(children);
        self
    }

    pub fn bytes(mut self, bytes: Vec<u8>) -> Self {
        self.content = NodeContent::Bytes(bytes);
        self
    }

    pub fn get_attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(|v| v.as_str())
    }

    pub fn child_nodes(&self) -> &[Node] {
        match &self.content {
            NodeContent::Nodes(nodes) => nodes,
            _ => &[],
        }
    }

    pub fn child(&self, tag: &str) -> Option<&Node> {
        self.child_nodes().iter().find(|n| n.tag == tag)
    }

    pub fn children_by_tag<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.child_nodes().iter().filter(move |n| n.tag == tag)
    }

    pub fn content_bytes(&self) -> Option<&[u8]> {
        match &self.content {
            NodeContent::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Appends a child, turning empty content into a child list.
    pub fn push_child(&mut self, child: Node) {
        match &mut self.content {
            NodeContent::Nodes(nodes) => nodes.push(child),
            _ => self.content = NodeContent::Nodes(vec![child]),
        }
    }
}
