//! The program model: a tree of instruction nodes produced by the [`compiler`](crate::compiler).
//!
//! Every node owns its children and its `next` successor, so any tree reachable from a root is
//! acyclic and single-owner by construction. Bracket markers only exist while the compiler is
//! matching them; a finished [`Program`] never contains one.

use std::sync::atomic::{AtomicU64, Ordering};

use compact_str::CompactString;
use monostate::MustBeU64;
use serde::{Serialize, Serializer, Deserialize, Deserializer};
use serde::ser::SerializeStruct;
use serde::de::{Error as _, IgnoredAny};

use crate::grid::{GridPos, Origin};
use crate::runtime::Value;
use crate::vecmap::VecMap;

/// Version tag of the persisted program format.
pub const FORMAT_VERSION: u64 = 1;

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

/// A process-unique node identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct NodeId(u64);
impl NodeId {
    /// Allocates a new identity.
    pub fn fresh() -> Self {
        Self(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
    }
    pub fn get(self) -> u64 {
        self.0
    }
}
impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let id = u64::deserialize(deserializer)?;
        let next = id.checked_add(1).ok_or_else(|| D::Error::custom("node id out of range"))?;
        NEXT_NODE_ID.fetch_max(next, Ordering::Relaxed); // restored ids must never be handed out again
        Ok(Self(id))
    }
}

/// The role a symbol plays, as declared by the catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Entry point of an event-triggered program.
    Event,
    /// Header of a function definition.
    Function,
    /// A plain action with side effects.
    Action,
    /// A variable operation.
    Variable,
    /// An `if` whose children are the guarded branch.
    Condition,
    /// An `else` (no action) or `else if` (condition action) following a condition.
    Else,
    /// A loop whose children are the body.
    Loop,
    /// Flow control: wait, break, continue, stop, return.
    Control,
    /// A function call.
    Call,
    /// A bracket marker.
    Bracket,
}
impl Category {
    /// Checks if nodes of this category take the nodes between a following bracket pair as children.
    pub fn is_container(self) -> bool {
        matches!(self, Category::Condition | Category::Else | Category::Loop)
    }
    /// Checks if nodes of this category start a program.
    pub fn is_entry(self) -> bool {
        matches!(self, Category::Event | Category::Function)
    }
}

/// Bracket role of a symbol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BracketRole {
    #[default]
    None,
    Open,
    Close,
}

/// One instruction unit.
///
/// Persisted as a json object whose `next` field is the flat list of successors,
/// so the nesting depth of the serialized form only grows with bracket nesting.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub symbol: CompactString,
    pub category: Category,
    /// The action this node performs; [`None`] means the action was left unset and the node is a no-op.
    pub action: Option<CompactString>,
    pub params: VecMap<CompactString, Value, false>,
    pub children: Vec<Node>,
    pub next: Option<Box<Node>>,
    pub bracket: BracketRole,
    /// Grid cell the node was compiled from, for diagnostics.
    pub pos: Option<GridPos>,
}

struct Link<'a> {
    node: &'a Node,
    chain: bool,
}
impl Serialize for Link<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let node = self.node;
        let mut res = serializer.serialize_struct("Node", 9)?;
        res.serialize_field("id", &node.id)?;
        res.serialize_field("symbol", &node.symbol)?;
        res.serialize_field("category", &node.category)?;
        if let Some(action) = &node.action {
            res.serialize_field("action", action)?;
        }
        if !node.params.is_empty() {
            res.serialize_field("params", &node.params)?;
        }
        if !node.children.is_empty() {
            res.serialize_field("children", &node.children)?;
        }
        if node.bracket != BracketRole::None {
            res.serialize_field("bracket", &node.bracket)?;
        }
        if let Some(pos) = &node.pos {
            res.serialize_field("pos", pos)?;
        }
        if let (true, Some(next)) = (self.chain, node.next.as_deref()) {
            res.serialize_field("next", &Successors(next))?;
        }
        res.end()
    }
}

struct Successors<'a>(&'a Node);
impl Serialize for Successors<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.iter_chain().map(|node| Link { node, chain: false }))
    }
}

impl Serialize for Node {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        Link { node: self, chain: true }.serialize(serializer)
    }
}

#[derive(Deserialize)]
struct Repr<N> {
    id: NodeId,
    symbol: CompactString,
    category: Category,
    #[serde(default)] action: Option<CompactString>,
    #[serde(default)] params: VecMap<CompactString, Value, false>,
    #[serde(default)] children: Vec<Node>,
    #[serde(default)] bracket: BracketRole,
    #[serde(default)] pos: Option<GridPos>,
    #[serde(default = "Vec::new")] next: Vec<N>,
}
impl<N> Repr<N> {
    fn split(self) -> (Node, Vec<N>) {
        let node = Node {
            id: self.id,
            symbol: self.symbol,
            category: self.category,
            action: self.action,
            params: self.params,
            children: self.children,
            next: None,
            bracket: self.bracket,
            pos: self.pos,
        };
        (node, self.next)
    }
}

impl<'de> Deserialize<'de> for Node {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // successors never carry a chain of their own
        let (mut head, rest) = Repr::<Repr<IgnoredAny>>::deserialize(deserializer)?.split();
        head.next = Node::chain(rest.into_iter().map(|x| x.split().0)).map(Box::new);
        Ok(head)
    }
}

impl Node {
    pub fn new(symbol: &str, category: Category) -> Self {
        Self {
            id: NodeId::fresh(),
            symbol: symbol.into(),
            category,
            action: None,
            params: Default::default(),
            children: vec![],
            next: None,
            bracket: BracketRole::None,
            pos: None,
        }
    }
    pub fn with_action(mut self, action: &str) -> Self {
        self.action = Some(action.into());
        self
    }
    pub fn with_param<V: Into<Value>>(mut self, name: &str, value: V) -> Self {
        self.set_param(name, value.into());
        self
    }
    pub fn with_children<I: IntoIterator<Item = Node>>(mut self, children: I) -> Self {
        self.children.extend(children);
        self
    }
    /// Appends an owned child.
    pub fn add_child(&mut self, child: Node) {
        self.children.push(child);
    }
    /// Replaces this node's successor, returning the displaced one.
    pub fn set_next(&mut self, next: Option<Node>) -> Option<Node> {
        std::mem::replace(&mut self.next, next.map(Box::new)).map(|x| *x)
    }
    /// Links a list of nodes into a `next` chain, returning its head.
    pub fn chain<I: IntoIterator<Item = Node>>(nodes: I) -> Option<Node> where I::IntoIter: DoubleEndedIterator {
        let mut head: Option<Node> = None;
        for mut node in nodes.into_iter().rev() {
            node.next = head.map(Box::new);
            head = Some(node);
        }
        head
    }
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }
    pub fn set_param(&mut self, name: &str, value: Value) -> Option<Value> {
        self.params.insert(name.into(), value)
    }
    /// Iterates over this node and its `next` successors.
    pub fn iter_chain(&self) -> impl Iterator<Item = &Node> {
        std::iter::successors(Some(self), |x| x.next.as_deref())
    }
    /// Visits every node in the owned structure (pre-order: node, children, then successor).
    pub fn walk<F: FnMut(&Node)>(&self, f: &mut F) {
        for node in self.iter_chain() {
            f(node);
            for child in node.children.iter() {
                child.walk(f);
            }
        }
    }
    /// Counts every node in the owned structure.
    pub fn count(&self) -> usize {
        let mut res = 0;
        self.walk(&mut |_| res += 1);
        res
    }
    /// Copies the full owned structure (children and `next` chain) under fresh identities.
    pub fn deep_clone(&self) -> Node {
        let mut copies = self.iter_chain().map(|node| Node {
            id: NodeId::fresh(),
            symbol: node.symbol.clone(),
            category: node.category,
            action: node.action.clone(),
            params: node.params.iter().map(|(k, v)| (k.clone(), v.copy())).collect(),
            children: node.children.iter().map(Node::deep_clone).collect(),
            next: None,
            bracket: node.bracket,
            pos: node.pos,
        }).collect::<Vec<_>>();
        let mut head = copies.remove(0);
        if let Some(rest) = Node::chain(copies) {
            head.next = Some(Box::new(rest));
        }
        head
    }
    /// Compares two structures while ignoring identities and source positions.
    pub fn structurally_eq(&self, other: &Node) -> bool {
        let mut a = self.iter_chain();
        let mut b = other.iter_chain();
        loop {
            match (a.next(), b.next()) {
                (None, None) => return true,
                (Some(x), Some(y)) => {
                    let same = x.symbol == y.symbol
                        && x.category == y.category
                        && x.action == y.action
                        && x.params == y.params
                        && x.bracket == y.bracket
                        && x.children.len() == y.children.len()
                        && x.children.iter().zip(y.children.iter()).all(|(c, d)| c.structurally_eq(d));
                    if !same { return false }
                }
                _ => return false,
            }
        }
    }
}
impl Drop for Node {
    fn drop(&mut self) {
        // unlink long `next` chains iteratively so dropping a long program cannot overflow the stack
        let mut next = self.next.take();
        while let Some(mut node) = next {
            next = node.next.take();
        }
    }
}

/// What a compiled program is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProgramKind {
    /// Runs when the named event fires.
    Event { event: CompactString },
    /// Defines the named function.
    Function { name: CompactString },
}

/// A compiled program: an entry node and everything reachable from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    #[allow(dead_code)] tag: MustBeU64<FORMAT_VERSION>,

    pub kind: ProgramKind,
    pub root: Node,
    pub origin: Origin,
    /// Version of the catalogue the program was compiled against.
    pub catalogue_version: u64,
}
impl Program {
    pub fn new(kind: ProgramKind, root: Node, origin: Origin, catalogue_version: u64) -> Self {
        Self { tag: Default::default(), kind, root, origin, catalogue_version }
    }
    /// Creates an event program directly from a hand-built tree.
    pub fn event(event: &str, root: Node, origin: Origin) -> Self {
        Self::new(ProgramKind::Event { event: event.into() }, root, origin, 0)
    }
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
    pub fn from_json(src: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(src)
    }
    /// Compares two programs while ignoring node identities.
    pub fn structurally_eq(&self, other: &Program) -> bool {
        self.kind == other.kind && self.origin == other.origin && self.root.structurally_eq(&other.root)
    }
}
