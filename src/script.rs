//! Tools for linking a [`Program`] tree into an executable [`Script`].
//!
//! A script is a flat array of [`Op`]s addressed by index: each op knows the first op of its body
//! (the node's children, in order) and the op that follows it. Runs hold indices into a shared
//! script, so suspending and resuming a run never touches the program tree itself.

use std::sync::Arc;

use compact_str::{CompactString, format_compact};

use crate::ast::*;
use crate::expr::{self, Env, Expr};
use crate::grid::{GridPos, Origin};
use crate::runtime::{ErrorCause, Value};
use crate::vecmap::VecMap;

/// A linked parameter.
#[derive(Debug, Clone)]
pub enum Arg {
    Const(Value),
    /// A formula, parsed once at link time.
    Expr { src: CompactString, expr: Arc<Expr> },
    /// A formula that failed to parse; evaluating it always fails.
    Invalid { src: CompactString, msg: CompactString },
}
impl Arg {
    /// Links a parameter value: text starting with `=` is a formula, anything else is a constant.
    pub fn link(value: &Value) -> Arg {
        match value {
            Value::Text(text) if text.starts_with('=') => match expr::parse(&text[1..]) {
                Ok(expr) => Arg::Expr { src: text.clone(), expr: Arc::new(expr) },
                Err(e) => Arg::Invalid { src: text.clone(), msg: format_compact!("{e}") },
            }
            x => Arg::Const(x.clone()),
        }
    }
    pub fn eval(&self, env: &mut dyn Env) -> Result<Value, ErrorCause> {
        match self {
            Arg::Const(x) => Ok(x.clone()),
            Arg::Expr { expr, .. } => expr.eval(env),
            Arg::Invalid { src, msg } => Err(ErrorCause::BadFormula { formula: src.clone(), msg: msg.clone() }),
        }
    }
}

/// One executable node.
#[derive(Debug, Clone)]
pub struct Op {
    pub id: NodeId,
    pub symbol: CompactString,
    pub category: Category,
    pub action: Option<CompactString>,
    pub args: VecMap<CompactString, Arg, false>,
    /// First op of this node's children.
    pub body: Option<usize>,
    /// The op that follows this one.
    pub next: Option<usize>,
    pub pos: Option<GridPos>,
}

/// An immutable, linked program body.
#[derive(Debug)]
pub struct Script {
    /// A name for diagnostics: the event or function name.
    pub name: CompactString,
    pub origin: Origin,
    pub ops: Vec<Op>,
    /// First op to run, or [`None`] for an empty body.
    pub entry: Option<usize>,
}
impl Script {
    /// Links everything after the root (entry) node of a program.
    pub fn link(program: &Program) -> Arc<Script> {
        let name = match &program.kind {
            ProgramKind::Event { event } => event.clone(),
            ProgramKind::Function { name } => name.clone(),
        };
        Self::link_body(name, program.origin.clone(), program.root.next.as_deref())
    }
    /// Links a bare node chain, e.g. a function body.
    pub fn link_body(name: CompactString, origin: Origin, body: Option<&Node>) -> Arc<Script> {
        let mut ops = vec![];
        let entry = link_chain(&mut ops, body).map(|(first, _)| first);
        Arc::new(Script { name, origin, ops, entry })
    }
    pub fn op(&self, pos: usize) -> Option<&Op> {
        self.ops.get(pos)
    }
}

/// Links a `next` chain, returning the indices of its first and last ops.
fn link_chain(ops: &mut Vec<Op>, head: Option<&Node>) -> Option<(usize, usize)> {
    let mut bounds: Option<(usize, usize)> = None;
    for node in head.into_iter().flat_map(Node::iter_chain) {
        let pos = ops.len();
        ops.push(Op {
            id: node.id,
            symbol: node.symbol.clone(),
            category: node.category,
            action: node.action.clone(),
            args: node.params.iter().map(|(k, v)| (k.clone(), Arg::link(v))).collect(),
            body: None,
            next: None,
            pos: node.pos,
        });
        ops[pos].body = link_children(ops, &node.children);
        bounds = match bounds {
            None => Some((pos, pos)),
            Some((first, last)) => {
                ops[last].next = Some(pos);
                Some((first, pos))
            }
        };
    }
    bounds
}

/// Links a node's children into a single chain. A child's own `next` chain runs before the following child.
fn link_children(ops: &mut Vec<Op>, children: &[Node]) -> Option<usize> {
    let mut bounds: Option<(usize, usize)> = None;
    for child in children {
        if let Some((first, last)) = link_chain(ops, Some(child)) {
            bounds = match bounds {
                None => Some((first, last)),
                Some((head, tail)) => {
                    ops[tail].next = Some(first);
                    Some((head, last))
                }
            };
        }
    }
    bounds.map(|(first, _)| first)
}

#[test]
fn test_link_layout() {
    let body = Node::chain([
        Node::new("action", Category::Action).with_action("log").with_param("text", "a"),
        Node::new("loop", Category::Loop).with_action("repeat").with_param("times", 2).with_children([
            Node::new("action", Category::Action).with_action("log").with_param("text", "=1 + 1"),
            Node::new("control", Category::Control).with_action("break"),
        ]),
        Node::new("action", Category::Action).with_action("log").with_param("text", "=("),
    ]);
    let mut root = Node::new("event", Category::Event).with_action("on_trigger");
    root.set_next(body);
    let program = Program::event("on_trigger", root, Origin::default());
    let script = Script::link(&program);

    assert_eq!(script.ops.len(), 5);
    let entry = script.entry.unwrap();
    let looped = script.ops[entry].next.unwrap();
    assert_eq!(script.ops[looped].action.as_deref(), Some("repeat"));
    let first = script.ops[looped].body.unwrap();
    assert!(matches!(script.ops[first].args.get("text"), Some(Arg::Expr { .. })));
    let second = script.ops[first].next.unwrap();
    assert_eq!(script.ops[second].action.as_deref(), Some("break"));
    assert_eq!(script.ops[second].next, None);
    let last = script.ops[looped].next.unwrap();
    assert!(matches!(script.ops[last].args.get("text"), Some(Arg::Invalid { .. })));
    assert_eq!(script.ops[last].next, None);
}
