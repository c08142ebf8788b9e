//! The spatial compiler: turns a line of symbols placed in the grid into a [`Program`].
//!
//! A code line starts at an entry symbol (an event or a function header) and continues along
//! [`Layout::direction`] every [`Layout::stride`] cells until the first empty cell, the next entry
//! symbol, or [`Layout::max_line_len`]. Each symbol's action comes from the label next to it, and its
//! parameters from the container next to it. Bracket symbols nest the nodes between them under the
//! container node (condition, else, loop) placed right before the opening bracket.
//!
//! Malformed pieces never abort a scan. An unknown symbol is dropped on its own; a bracket without a
//! container before it, or one that is never closed, drops everything it encloses; a stray closing
//! bracket is ignored. Each of these produces a [`Diagnostic`].

use std::collections::BTreeMap;
use std::sync::Arc;

use compact_str::{CompactString, ToCompactString};
use serde::{Serialize, Deserialize};
use thiserror::Error;

use crate::ast::*;
use crate::catalogue::*;
use crate::functions::ParameterSpec;
use crate::grid::*;
use crate::runtime::{Value, ValueKind};
use crate::util::{is_decorative, is_identifier, strip_formatting};
use crate::vecmap::VecMap;

/// Where labels and containers sit relative to their symbol, and how code lines run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Layout {
    /// Direction code lines run in (default `+x`).
    pub direction: GridPos,
    /// Distance between consecutive symbols of a line (default `2`).
    pub stride: i32,
    /// Label position relative to its symbol (default one cell towards `-z`).
    pub label_offset: GridPos,
    /// Container position relative to its symbol (default one cell up).
    pub container_offset: GridPos,
    /// Maximum number of symbols in a line, entry included (default `128`).
    pub max_line_len: usize,
}
impl Default for Layout {
    fn default() -> Self {
        Self {
            direction: GridPos::new(1, 0, 0),
            stride: 2,
            label_offset: GridPos::new(0, 0, -1),
            container_offset: GridPos::new(0, 1, 0),
            max_line_len: 128,
        }
    }
}
impl Layout {
    /// The cell of the `index`-th symbol of the line starting at `entry`.
    pub fn cell(&self, entry: GridPos, index: usize) -> GridPos {
        entry + self.direction.scale(self.stride * index as i32)
    }
    pub fn label(&self, pos: GridPos) -> GridPos {
        pos + self.label_offset
    }
    pub fn container(&self, pos: GridPos) -> GridPos {
        pos + self.container_offset
    }
}

/// A problem found while compiling.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("no symbol at {pos}")]
    NoSymbol { pos: GridPos },
    #[error("unknown symbol `{symbol}` at {pos}")]
    UnknownSymbol { symbol: CompactString, pos: GridPos },
    #[error("`{symbol}` at {pos} does not start a program")]
    NotAnEntry { symbol: CompactString, pos: GridPos },
    #[error("no action of `{symbol}` at {pos} matches label {label:?}")]
    UnresolvedAction { symbol: CompactString, pos: GridPos, label: Option<CompactString> },
    #[error("slot {slot} of the container at {pos}: {msg}")]
    BadSlot { pos: GridPos, slot: usize, msg: CompactString },
    #[error("opening bracket at {pos} does not follow a condition or loop")]
    OrphanOpen { pos: GridPos },
    #[error("closing bracket at {pos} has no opening bracket")]
    UnmatchedClose { pos: GridPos },
    #[error("opening bracket at {pos} is never closed")]
    UnclosedOpen { pos: GridPos },
    #[error("function header at {pos} needs a name label")]
    MissingFunctionName { pos: GridPos },
    #[error("bad parameter `{text}` on function header at {pos}")]
    BadParameterSpec { pos: GridPos, text: CompactString },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Something was left out of a program, but the program itself compiled.
    Warning,
    /// A whole program could not be compiled.
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub error: CompileError,
}

/// The result of compiling a region: every program that compiled, plus everything worth reporting.
#[derive(Debug, Clone, Default)]
pub struct CompileReport {
    pub programs: Vec<Program>,
    pub diagnostics: Vec<Diagnostic>,
}

enum Token {
    Node(Node),
    Open(GridPos),
    Close(GridPos),
}

struct Scope {
    /// The container node receiving this scope's nodes as children; [`None`] for orphaned brackets.
    owner: Option<Node>,
    open: GridPos,
    items: Vec<Node>,
}

struct Compiler<'a, G: Grid + ?Sized> {
    grid: &'a G,
    catalogue: &'a Catalogue,
    layout: &'a Layout,
    diagnostics: Vec<Diagnostic>,
}
impl<'a, G: Grid + ?Sized> Compiler<'a, G> {
    fn warn(&mut self, error: CompileError) {
        tracing::warn!(world = self.grid.world(), "{error}");
        self.diagnostics.push(Diagnostic { severity: Severity::Warning, error });
    }

    fn entry(&mut self, pos: GridPos) -> Result<(ProgramKind, Node), CompileError> {
        let symbol = self.grid.symbol_at(pos).ok_or(CompileError::NoSymbol { pos })?;
        let spec = self.catalogue.symbol(symbol).ok_or_else(|| CompileError::UnknownSymbol { symbol: symbol.into(), pos })?;
        match spec.category {
            Category::Event if spec.bracket == BracketRole::None => {
                let node = self.node(pos, symbol, spec);
                let event = node.action.clone().unwrap_or_default();
                Ok((ProgramKind::Event { event }, node))
            }
            Category::Function => self.function_header(pos, symbol, spec),
            _ => Err(CompileError::NotAnEntry { symbol: symbol.into(), pos }),
        }
    }

    /// A function header is named by its label; container slots hold parameter specs such as `count:number?=1`,
    /// and an optional second label line such as `-> number` declares the return kind.
    fn function_header(&mut self, pos: GridPos, symbol: &str, spec: &SymbolSpec) -> Result<(ProgramKind, Node), CompileError> {
        let mut lines = self.grid.label_at(self.layout.label(pos)).unwrap_or_default().iter()
            .filter(|x| !is_decorative(x))
            .map(|x| CompactString::from(strip_formatting(x).trim()));
        let name = match lines.next() {
            Some(name) if is_identifier(&name) => name,
            _ => return Err(CompileError::MissingFunctionName { pos }),
        };
        let returns = lines.next().and_then(|x| ValueKind::parse(x.trim_start_matches("->").trim_start_matches("returns")));

        let mut node = Node::new(symbol, Category::Function);
        node.pos = Some(pos);
        node.action = spec.default_action.clone();
        node.set_param("name", Value::Text(name.clone()));
        if let Some(returns) = returns {
            node.set_param("returns", Value::Text(returns.to_compact_string()));
        }

        let mut params = vec![];
        for item in self.grid.container_at(self.layout.container(pos)).unwrap_or_default().iter().flatten() {
            let text = item.name.as_deref().unwrap_or_default().trim();
            match ParameterSpec::parse(text) {
                Ok(_) => params.push(Value::from(text)),
                Err(_) => self.warn(CompileError::BadParameterSpec { pos, text: text.into() }),
            }
        }
        node.set_param("params", Value::from(params));
        Ok((ProgramKind::Function { name }, node))
    }

    fn node(&mut self, pos: GridPos, symbol: &str, spec: &SymbolSpec) -> Node {
        let mut node = Node::new(symbol, spec.category);
        node.pos = Some(pos);
        match self.catalogue.resolve_action(spec, self.grid.label_at(self.layout.label(pos))) {
            Resolution::Resolved(action) => node.action = Some(action.into()),
            Resolution::Unset { label } => self.warn(CompileError::UnresolvedAction { symbol: symbol.into(), pos, label }),
        }
        if let Some(action) = node.action.as_deref().and_then(|x| spec.actions.get(x)) {
            self.read_params(&mut node, pos, action);
        }
        node
    }

    fn read_params(&mut self, node: &mut Node, pos: GridPos, action: &ActionSpec) {
        let slots = match self.grid.container_at(self.layout.container(pos)) {
            Some(x) => x,
            None => return,
        };
        let mut lists: VecMap<CompactString, Vec<Value>, false> = Default::default();
        for (slot, (binding, item)) in action.slots.iter().zip(slots.iter()).enumerate() {
            let (name, item) = match (binding, item) {
                (Some(name), Some(item)) => (name, item),
                _ => continue,
            };
            match self.catalogue.convert_slot(item, self.grid.world()) {
                Ok(value) if action.is_list_param(name) => match lists.get_mut(name.as_str()) {
                    Some(list) => list.push(value),
                    None => { lists.insert(name.clone(), vec![value]); }
                }
                Ok(value) => { node.set_param(name, value); }
                Err(cause) => self.warn(CompileError::BadSlot { pos, slot, msg: cause.to_compact_string() }),
            }
        }
        for (name, values) in lists {
            node.set_param(&name, Value::from(values));
        }
    }

    fn scan(&mut self, entry: GridPos) -> Vec<Token> {
        let mut tokens = vec![];
        for i in 1..self.layout.max_line_len {
            let pos = self.layout.cell(entry, i);
            let symbol = match self.grid.symbol_at(pos) {
                Some(x) => x,
                None => break,
            };
            let spec = match self.catalogue.symbol(symbol) {
                Some(x) => x,
                None => {
                    self.warn(CompileError::UnknownSymbol { symbol: symbol.into(), pos });
                    continue;
                }
            };
            match spec.bracket {
                BracketRole::Open => tokens.push(Token::Open(pos)),
                BracketRole::Close => tokens.push(Token::Close(pos)),
                BracketRole::None if spec.category.is_entry() => break,
                BracketRole::None => tokens.push(Token::Node(self.node(pos, symbol, spec))),
            }
        }
        tokens
    }

    /// Matches brackets left to right, each closing bracket ending the nearest unmatched opening one.
    fn nest(&mut self, tokens: Vec<Token>) -> Vec<Node> {
        let mut line = vec![];
        let mut stack: Vec<Scope> = vec![];
        for token in tokens {
            let items = match stack.last_mut() {
                Some(scope) => &mut scope.items,
                None => &mut line,
            };
            match token {
                Token::Node(node) => items.push(node),
                Token::Open(pos) => {
                    let owner = match items.last() {
                        Some(prev) if prev.category.is_container() => items.pop(),
                        _ => None,
                    };
                    if owner.is_none() {
                        self.warn(CompileError::OrphanOpen { pos });
                    }
                    stack.push(Scope { owner, open: pos, items: vec![] });
                }
                Token::Close(pos) => match stack.pop() {
                    None => self.warn(CompileError::UnmatchedClose { pos }),
                    Some(scope) => if let Some(mut owner) = scope.owner {
                        for item in scope.items {
                            owner.add_child(item);
                        }
                        match stack.last_mut() {
                            Some(parent) => parent.items.push(owner),
                            None => line.push(owner),
                        }
                    }
                }
            }
        }
        for scope in stack.into_iter().rev() {
            self.warn(CompileError::UnclosedOpen { pos: scope.open });
        }
        line
    }
}

/// Compiles the code line starting at `entry`, which must hold an event or function header symbol.
/// Returns the program along with any warnings about pieces that were left out.
pub fn compile_line<G: Grid + ?Sized>(grid: &G, catalogue: &Catalogue, layout: &Layout, entry: GridPos) -> Result<(Program, Vec<Diagnostic>), CompileError> {
    let mut compiler = Compiler { grid, catalogue, layout, diagnostics: vec![] };
    let (kind, mut root) = compiler.entry(entry)?;
    let tokens = compiler.scan(entry);
    let body = compiler.nest(tokens);
    root.set_next(Node::chain(body));

    let program = Program::new(kind, root, Origin::new(grid.world(), entry), catalogue.version());
    Ok((program, compiler.diagnostics))
}

/// Compiles every program whose entry symbol lies inside the region, in `(z, y, x)` order of entries.
/// A program that fails to compile is reported and skipped; it never affects the others.
pub fn compile_region<G: Grid + ?Sized>(grid: &G, catalogue: &Catalogue, layout: &Layout, region: Region) -> CompileReport {
    let mut entries = grid.symbols_in(region).into_iter()
        .filter(|(_, symbol)| catalogue.symbol(symbol).is_some_and(|x| x.category.is_entry() && x.bracket == BracketRole::None))
        .map(|(pos, _)| pos)
        .collect::<Vec<_>>();
    entries.sort_by_key(|x| x.scan_order());

    let mut report = CompileReport::default();
    for entry in entries {
        match compile_line(grid, catalogue, layout, entry) {
            Ok((program, diagnostics)) => {
                report.programs.push(program);
                report.diagnostics.extend(diagnostics);
            }
            Err(error) => {
                tracing::warn!(world = grid.world(), "{error}");
                report.diagnostics.push(Diagnostic { severity: Severity::Error, error });
            }
        }
    }
    report
}

struct Cached<T> {
    revision: u64,
    catalogue_version: u64,
    value: T,
}
impl<T> Cached<T> {
    fn is_fresh<G: Grid + ?Sized>(&self, grid: &G, catalogue: &Catalogue) -> bool {
        self.revision == grid.revision() && self.catalogue_version == catalogue.version()
    }
}

/// Caches compiled programs until the grid revision or the catalogue version changes.
#[derive(Default)]
pub struct ProgramCache {
    lines: BTreeMap<(CompactString, GridPos), Cached<Result<Arc<Program>, CompileError>>>,
    regions: BTreeMap<(CompactString, Region), Cached<Arc<CompileReport>>>,
}
impl ProgramCache {
    /// Gets the program starting at `entry`, compiling it only if needed.
    pub fn line<G: Grid + ?Sized>(&mut self, grid: &G, catalogue: &Catalogue, layout: &Layout, entry: GridPos) -> Result<Arc<Program>, CompileError> {
        let key = (CompactString::from(grid.world()), entry);
        if let Some(cached) = self.lines.get(&key) {
            if cached.is_fresh(grid, catalogue) {
                return cached.value.clone();
            }
        }
        let value = compile_line(grid, catalogue, layout, entry).map(|(program, _)| Arc::new(program));
        self.lines.insert(key, Cached { revision: grid.revision(), catalogue_version: catalogue.version(), value: value.clone() });
        value
    }
    /// Gets the programs inside `region`, compiling them only if needed.
    pub fn region<G: Grid + ?Sized>(&mut self, grid: &G, catalogue: &Catalogue, layout: &Layout, region: Region) -> Arc<CompileReport> {
        let key = (CompactString::from(grid.world()), region);
        if let Some(cached) = self.regions.get(&key) {
            if cached.is_fresh(grid, catalogue) {
                return cached.value.clone();
            }
        }
        let value = Arc::new(compile_region(grid, catalogue, layout, region));
        self.regions.insert(key, Cached { revision: grid.revision(), catalogue_version: catalogue.version(), value: value.clone() });
        value
    }
    /// Drops everything cached for the given world.
    pub fn invalidate_world(&mut self, world: &str) {
        self.lines.retain(|(w, _), _| w != world);
        self.regions.retain(|(w, _), _| w != world);
    }
    pub fn clear(&mut self) {
        self.lines.clear();
        self.regions.clear();
    }
    pub fn len(&self) -> usize {
        self.lines.len() + self.regions.len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
