//! In-memory element tree implementing [`HostTree`].
//!
//! Used by the CLI driver to load captured page fixtures and by tests to
//! simulate a host that re-renders its playlist underneath the engine.

use std::collections::BTreeMap;

use crate::tree::HostTree;

/// Arena index of an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

/// Serializable description of an element subtree.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ElementSpec {
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ElementSpec>,
}

impl ElementSpec {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_ascii_lowercase(),
            ..Self::default()
        }
    }

    pub fn id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn class(mut self, class: &str) -> Self {
        self.class = Some(class.to_string());
        self
    }

    pub fn attr(mut self, name: &str, value: &str) -> Self {
        self.attrs.insert(name.to_string(), value.to_string());
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.text = text.to_string();
        self
    }

    pub fn child(mut self, child: ElementSpec) -> Self {
        self.children.push(child);
        self
    }

    pub fn children(mut self, children: impl IntoIterator<Item = ElementSpec>) -> Self {
        self.children.extend(children);
        self
    }
}

#[derive(Debug, Clone)]
struct NodeData {
    tag: String,
    attributes: BTreeMap<String, String>,
    text: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

/// Arena-backed element tree. Detached nodes stay in the arena.
#[derive(Debug, Clone)]
pub struct DocumentTree {
    nodes: Vec<NodeData>,
    root: NodeId,
}

impl DocumentTree {
    pub fn new(root: &ElementSpec) -> Self {
        let mut tree = Self {
            nodes: Vec::new(),
            root: NodeId(0),
        };
        tree.root = tree.build(root, None);
        tree
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let spec: ElementSpec = serde_json::from_str(json)?;
        Ok(Self::new(&spec))
    }

    /// Builds `spec` and appends it as the last child of `parent`.
    pub fn append_spec(&mut self, parent: NodeId, spec: &ElementSpec) -> NodeId {
        let node = self.build(spec, None);
        self.insert_children(parent, None, &[node]);
        node
    }

    /// Replaces every child of `parent` with freshly built `specs`, the way
    /// a host regenerates a list on navigation.
    pub fn replace_children(&mut self, parent: NodeId, specs: &[ElementSpec]) -> Vec<NodeId> {
        for child in self.children(parent) {
            self.detach(child);
        }
        let built: Vec<NodeId> = specs.iter().map(|spec| self.build(spec, None)).collect();
        self.insert_children(parent, None, &built);
        built
    }

    /// First connected element with the given `id` attribute.
    pub fn element_by_id(&self, id: &str) -> Option<NodeId> {
        let mut pending = vec![self.root];
        while let Some(node) = pending.pop() {
            if self.attribute(node, "id").as_deref() == Some(id) {
                return Some(node);
            }
            pending.extend(self.children(node).into_iter().rev());
        }
        None
    }

    fn build(&mut self, spec: &ElementSpec, parent: Option<NodeId>) -> NodeId {
        let mut attributes = spec.attrs.clone();
        if let Some(id) = &spec.id {
            attributes.insert("id".to_string(), id.clone());
        }
        if let Some(class) = &spec.class {
            attributes.insert("class".to_string(), class.clone());
        }
        let node = NodeId(self.nodes.len());
        self.nodes.push(NodeData {
            tag: spec.tag.to_ascii_lowercase(),
            attributes,
            text: spec.text.clone(),
            parent,
            children: Vec::new(),
        });
        for child in &spec.children {
            let child_node = self.build(child, Some(node));
            self.nodes[node.0].children.push(child_node);
        }
        node
    }

    fn data(&self, node: NodeId) -> Option<&NodeData> {
        self.nodes.get(node.0)
    }
}

impl HostTree for DocumentTree {
    type Node = NodeId;

    fn root(&self) -> NodeId {
        self.root
    }

    fn children(&self, node: NodeId) -> Vec<NodeId> {
        self.data(node)
            .map(|data| data.children.clone())
            .unwrap_or_default()
    }

    fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.data(node).and_then(|data| data.parent)
    }

    fn tag_name(&self, node: NodeId) -> String {
        self.data(node)
            .map(|data| data.tag.clone())
            .unwrap_or_default()
    }

    fn attribute(&self, node: NodeId, name: &str) -> Option<String> {
        self.data(node)
            .and_then(|data| data.attributes.get(name).cloned())
    }

    fn own_text(&self, node: NodeId) -> String {
        self.data(node)
            .map(|data| data.text.clone())
            .unwrap_or_default()
    }

    fn detach(&mut self, node: NodeId) {
        let Some(parent) = self.parent(node) else {
            return;
        };
        self.nodes[parent.0].children.retain(|child| *child != node);
        self.nodes[node.0].parent = None;
    }

    fn insert_children(&mut self, parent: NodeId, before: Option<NodeId>, nodes: &[NodeId]) {
        if self.data(parent).is_none() {
            return;
        }
        for node in nodes {
            self.detach(*node);
        }
        let siblings = &self.nodes[parent.0].children;
        let at = before
            .and_then(|anchor| siblings.iter().position(|child| *child == anchor))
            .unwrap_or(siblings.len());
        self.nodes[parent.0]
            .children
            .splice(at..at, nodes.iter().copied());
        for node in nodes {
            self.nodes[node.0].parent = Some(parent);
        }
    }

    fn clone_subtree(&mut self, node: NodeId) -> NodeId {
        let Some(data) = self.data(node).cloned() else {
            return node;
        };
        let copy = NodeId(self.nodes.len());
        self.nodes.push(NodeData {
            parent: None,
            children: Vec::new(),
            ..data.clone()
        });
        for child in data.children {
            let child_copy = self.clone_subtree(child);
            self.nodes[child_copy.0].parent = Some(copy);
            self.nodes[copy.0].children.push(child_copy);
        }
        copy
    }
}
