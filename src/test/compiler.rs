use crate::compiler::*;
use crate::functions::{FunctionDefinition, FunctionScope, ParameterSpec};

use super::*;

const ENTRY: GridPos = GridPos::new(0, 64, 0);

/// Lays out code lines symbol by symbol.
struct Builder {
    grid: MemoryGrid,
    layout: Layout,
    catalogue: Catalogue,
}
impl Builder {
    fn new() -> Self {
        Self { grid: MemoryGrid::new("overworld"), layout: Layout::default(), catalogue: Catalogue::standard().unwrap() }
    }
    /// Places the `index`-th symbol of the line starting at `entry`.
    fn put(&mut self, entry: GridPos, index: usize, symbol: &str, label: &[&str], slots: Vec<Option<Item>>) -> &mut Self {
        let pos = self.layout.cell(entry, index);
        self.grid.place(pos, symbol);
        if !label.is_empty() {
            self.grid.set_label(self.layout.label(pos), label.iter().copied());
        }
        if !slots.is_empty() {
            self.grid.set_container(self.layout.container(pos), slots);
        }
        self
    }
    fn line(&mut self, entry: GridPos, symbols: &[(&str, &[&str], Vec<Option<Item>>)]) -> &mut Self {
        for (i, (symbol, label, slots)) in symbols.iter().enumerate() {
            self.put(entry, i, symbol, label, slots.clone());
        }
        self
    }
    fn compile(&self, entry: GridPos) -> (Program, Vec<Diagnostic>) {
        compile_line(&self.grid, &self.catalogue, &self.layout, entry).unwrap()
    }
}

fn paper(text: &str) -> Option<Item> {
    Some(Item::named("paper", text))
}
fn nugget(n: u32) -> Option<Item> {
    Some(Item::new("gold_nugget", n))
}
fn body(program: &Program) -> Vec<&Node> {
    program.root.next.as_deref().map(|x| x.iter_chain().collect()).unwrap_or_default()
}
fn warnings(diagnostics: &[Diagnostic]) -> Vec<&CompileError> {
    diagnostics.iter().filter(|x| x.severity == Severity::Warning).map(|x| &x.error).collect()
}

#[test]
fn test_compile_straight_line() {
    let mut b = Builder::new();
    b.line(ENTRY, &[
        ("event", &["on trigger"], vec![]),
        ("variable", &["set"], vec![paper("x"), nugget(5)]),
        ("variable", &["&aSet"], vec![paper("y"), paper("=x + 1")]),
        ("action", &["say"], vec![paper("=y")]),
    ]);
    let (program, diagnostics) = b.compile(ENTRY);
    assert!(diagnostics.is_empty(), "{diagnostics:?}");
    assert_eq!(program.kind, ProgramKind::Event { event: "on_trigger".into() });
    assert_eq!(program.origin, Origin::new("overworld", ENTRY));

    let nodes = body(&program);
    assert_eq!(nodes.len(), 3);
    assert_eq!(nodes[0].action.as_deref(), Some("set"));
    assert_eq!(nodes[0].param("name"), Some(&Value::from("x")));
    assert_eq!(nodes[0].param("value"), Some(&Value::from(5)));
    assert_eq!(nodes[1].param("value"), Some(&Value::from("=x + 1")));
    assert_eq!(nodes[2].action.as_deref(), Some("log"));
    assert_eq!(nodes[2].pos, Some(b.layout.cell(ENTRY, 3)));
}

#[test]
fn test_compile_brackets() {
    let mut b = Builder::new();
    b.line(ENTRY, &[
        ("event", &[], vec![]),
        ("condition", &["compare"], vec![paper("=x"), paper(">"), nugget(3)]),
        ("bracket_open", &[], vec![]),
        ("action", &["log"], vec![paper("big")]),
        ("loop", &["repeat"], vec![nugget(2)]),
        ("bracket_open", &[], vec![]),
        ("action", &["log"], vec![paper("again")]),
        ("bracket_close", &[], vec![]),
        ("bracket_close", &[], vec![]),
        ("else", &[], vec![]),
        ("bracket_open", &[], vec![]),
        ("action", &["log"], vec![paper("small")]),
        ("bracket_close", &[], vec![]),
        ("action", &["log"], vec![paper("done")]),
    ]);
    let (program, diagnostics) = b.compile(ENTRY);
    assert!(diagnostics.is_empty(), "{diagnostics:?}");

    let nodes = body(&program);
    assert_eq!(nodes.len(), 3);
    let (cond, other, last) = (nodes[0], nodes[1], nodes[2]);
    assert_eq!(cond.category, Category::Condition);
    assert_eq!(cond.children.len(), 2);
    assert_eq!(cond.children[1].category, Category::Loop);
    assert_eq!(cond.children[1].children.len(), 1);
    assert_eq!(cond.children[1].children[0].param("text"), Some(&Value::from("again")));
    assert_eq!(other.category, Category::Else);
    assert_eq!(other.action.as_deref(), Some("else"));
    assert_eq!(other.children.len(), 1);
    assert_eq!(last.param("text"), Some(&Value::from("done")));
    assert!(program.root.count() >= 7);
}

#[test]
fn test_malformed_pieces_are_excluded() {
    let mut b = Builder::new();
    b.line(ENTRY, &[
        ("event", &[], vec![]),
        ("mystery", &[], vec![]),
        ("action", &["log"], vec![paper("a")]),
        ("bracket_open", &[], vec![]),
        ("action", &["log"], vec![paper("orphaned")]),
        ("bracket_close", &[], vec![]),
        ("bracket_close", &[], vec![]),
        ("variable", &["frobnicate"], vec![paper("x")]),
        ("action", &["log"], vec![paper("b")]),
    ]);
    let (program, diagnostics) = b.compile(ENTRY);
    let cell = |i| b.layout.cell(ENTRY, i);
    assert_eq!(warnings(&diagnostics), [
        &CompileError::UnknownSymbol { symbol: "mystery".into(), pos: cell(1) },
        &CompileError::UnresolvedAction { symbol: "variable".into(), pos: cell(7), label: Some("frobnicate".into()) },
        &CompileError::OrphanOpen { pos: cell(3) },
        &CompileError::UnmatchedClose { pos: cell(6) },
    ]);

    let nodes = body(&program);
    assert_eq!(nodes.len(), 3);
    assert_eq!(nodes[0].param("text"), Some(&Value::from("a")));
    assert_eq!(nodes[1].action, None);
    assert_eq!(nodes[2].param("text"), Some(&Value::from("b")));
}

#[test]
fn test_unclosed_bracket_drops_its_owner() {
    let mut b = Builder::new();
    b.line(ENTRY, &[
        ("event", &[], vec![]),
        ("action", &["log"], vec![paper("kept")]),
        ("loop", &["forever"], vec![]),
        ("bracket_open", &[], vec![]),
        ("action", &["log"], vec![paper("lost")]),
    ]);
    let (program, diagnostics) = b.compile(ENTRY);
    assert_eq!(warnings(&diagnostics), [&CompileError::UnclosedOpen { pos: b.layout.cell(ENTRY, 3) }]);
    let nodes = body(&program);
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].param("text"), Some(&Value::from("kept")));
}

#[test]
fn test_line_ends() {
    let mut b = Builder::new();
    b.line(ENTRY, &[
        ("event", &[], vec![]),
        ("action", &["log"], vec![paper("one")]),
        ("event", &["on join"], vec![]),
        ("action", &["log"], vec![paper("other program")]),
    ]);
    assert_eq!(body(&b.compile(ENTRY).0).len(), 1);

    b.grid.clear(b.layout.cell(ENTRY, 2));
    assert_eq!(body(&b.compile(ENTRY).0).len(), 1);

    let mut short = Builder::new();
    short.layout.max_line_len = 2;
    short.line(ENTRY, &[("event", &[], vec![]), ("action", &["log"], vec![]), ("action", &["log"], vec![])]);
    assert_eq!(body(&short.compile(ENTRY).0).len(), 1);
}

#[test]
fn test_bad_slots_and_list_params() {
    let mut b = Builder::new();
    b.line(ENTRY, &[
        ("event", &[], vec![]),
        ("call", &[], vec![paper("double"), paper("r"), nugget(1), None, nugget(2)]),
        ("loop", &["repeat"], vec![Some(Item::named("gold_nugget", "lots")), nugget(1)]),
    ]);
    let (program, diagnostics) = b.compile(ENTRY);
    assert_eq!(warnings(&diagnostics).len(), 1);
    assert!(matches!(warnings(&diagnostics)[0], CompileError::BadSlot { slot: 0, .. }));

    let nodes = body(&program);
    assert_eq!(nodes[0].param("args"), Some(&Value::from(vec![Value::from(1), Value::from(2)])));
    assert_eq!(nodes[1].param("times"), None);
    assert_eq!(nodes[1].param("delay"), Some(&Value::from(1)));
}

#[test]
fn test_entry_errors() {
    let mut b = Builder::new();
    b.put(ENTRY, 0, "action", &["log"], vec![]);
    assert!(matches!(compile_line(&b.grid, &b.catalogue, &b.layout, ENTRY), Err(CompileError::NotAnEntry { .. })));
    assert_eq!(compile_line(&b.grid, &b.catalogue, &b.layout, GridPos::new(9, 9, 9)).err(), Some(CompileError::NoSymbol { pos: GridPos::new(9, 9, 9) }));
    b.grid.clear(b.layout.label(ENTRY));
    b.put(ENTRY, 0, "function", &[], vec![]);
    assert_eq!(compile_line(&b.grid, &b.catalogue, &b.layout, ENTRY).err(), Some(CompileError::MissingFunctionName { pos: ENTRY }));
}

#[test]
fn test_function_header() {
    let mut b = Builder::new();
    b.put(ENTRY, 0, "function", &["double", "-> number"], vec![paper("n:number"), paper("x:nonsense"), paper("scale:number=2")]);
    b.put(ENTRY, 1, "variable", &["set"], vec![paper("return"), paper("=n * scale")]);
    let (program, diagnostics) = b.compile(ENTRY);
    assert_eq!(warnings(&diagnostics), [&CompileError::BadParameterSpec { pos: ENTRY, text: "x:nonsense".into() }]);
    assert_eq!(program.kind, ProgramKind::Function { name: "double".into() });

    let def = FunctionDefinition::from_program(&program, actor("alex"), FunctionScope::OwnerPrivate).unwrap();
    assert_eq!(def.name, "double");
    assert_eq!(def.returns, ValueKind::Number);
    assert_eq!(def.params, [ParameterSpec::required("n", ValueKind::Number), ParameterSpec::optional("scale", ValueKind::Number, Value::from(2))]);
    assert_eq!(def.body.as_ref().map(Node::count), Some(1));
    def.validate().unwrap();
}

#[test]
fn test_compilation_is_idempotent() {
    let mut b = Builder::new();
    b.line(ENTRY, &[
        ("event", &[], vec![]),
        ("condition", &["is empty"], vec![paper("=x")]),
        ("bracket_open", &[], vec![]),
        ("variable", &["set"], vec![paper("x"), nugget(1)]),
        ("bracket_close", &[], vec![]),
    ]);
    let (first, _) = b.compile(ENTRY);
    let (second, _) = b.compile(ENTRY);
    assert!(first.structurally_eq(&second));
    assert_ne!(first.root.id, second.root.id);

    let restored = Program::from_json(&first.to_json().unwrap()).unwrap();
    assert!(restored.structurally_eq(&first));
    assert_eq!(restored.catalogue_version, first.catalogue_version);
    assert!(Program::from_json(&first.to_json().unwrap().replace("\"tag\":1", "\"tag\":2")).is_err());
}

#[test]
fn test_long_program_persists() {
    let mut inner = vec![compare("=x", ">", 1).with_children(Node::chain((0..130).map(|i| set("y", i))))];
    inner.extend((0..40).map(|i| set("z", i)));
    let mut body = (0..200).map(|i| set("x", i)).collect::<Vec<_>>();
    body.insert(10, looped("repeat").with_param("times", 2).with_children(Node::chain(inner)));
    let original = program(body);

    let json = original.to_json().unwrap();
    let restored = Program::from_json(&json).unwrap();
    assert!(restored.structurally_eq(&original));
    assert_eq!(restored.root.count(), 1 + 201 + 1 + 130 + 40);
    let ids = |program: &Program| {
        let mut res = vec![];
        program.root.walk(&mut |x| res.push(x.id));
        res
    };
    assert_eq!(ids(&restored), ids(&original));

    let tree: serde_json::Value = serde_json::from_str(&json).unwrap();
    let successors = tree["root"]["next"].as_array().unwrap();
    assert_eq!(successors.len(), 201);
    assert!(successors.iter().all(|x| x.get("next").is_none()));
    assert_eq!(successors[10]["children"][0]["next"].as_array().map(Vec::len), Some(40));
    assert_eq!(successors[10]["children"][0]["children"][0]["next"].as_array().map(Vec::len), Some(129));
}

#[test]
fn test_restored_ids_stay_unique() {
    let json = serde_json::json!({ "id": u64::MAX, "symbol": "action", "category": "action" });
    assert!(serde_json::from_value::<Node>(json).is_err());

    let json = serde_json::json!({ "id": 1, "symbol": "action", "category": "action", "action": "log" });
    let node = serde_json::from_value::<Node>(json).unwrap();
    assert_eq!(node.action.as_deref(), Some("log"));
    assert!(node.next.is_none() && node.children.is_empty());
    assert!(NodeId::fresh() > node.id);
}

#[test]
fn test_compile_region() {
    let mut b = Builder::new();
    let (a, c, bad) = (GridPos::new(0, 64, 4), GridPos::new(10, 60, 0), GridPos::new(0, 64, 8));
    b.line(a, &[("event", &["on join"], vec![]), ("action", &["log"], vec![paper("a")])]);
    b.line(c, &[("event", &[], vec![]), ("action", &["log"], vec![paper("c")])]);
    b.line(bad, &[("function", &[], vec![]), ("action", &["log"], vec![])]);
    b.put(GridPos::new(50, 64, 0), 0, "event", &[], vec![]);

    let region = Region::new(GridPos::new(-5, 50, -5), GridPos::new(20, 70, 10));
    let report = compile_region(&b.grid, &b.catalogue, &b.layout, region);
    let origins = report.programs.iter().map(|x| x.origin.pos).collect::<Vec<_>>();
    assert_eq!(origins, [c, a]);
    assert_eq!(report.diagnostics, [Diagnostic { severity: Severity::Error, error: CompileError::MissingFunctionName { pos: bad } }]);
}

#[test]
fn test_program_cache() {
    let mut b = Builder::new();
    b.line(ENTRY, &[("event", &[], vec![]), ("action", &["log"], vec![paper("a")])]);
    let mut cache = ProgramCache::default();

    let first = cache.line(&b.grid, &b.catalogue, &b.layout, ENTRY).unwrap();
    let again = cache.line(&b.grid, &b.catalogue, &b.layout, ENTRY).unwrap();
    assert!(Arc::ptr_eq(&first, &again));

    b.put(ENTRY, 2, "action", &["log"], vec![paper("b")]);
    let edited = cache.line(&b.grid, &b.catalogue, &b.layout, ENTRY).unwrap();
    assert!(!Arc::ptr_eq(&first, &edited));
    assert_eq!(body(&edited).len(), 2);

    let reloaded = Catalogue::standard().unwrap();
    b.catalogue.reload(reloaded);
    let recompiled = cache.line(&b.grid, &b.catalogue, &b.layout, ENTRY).unwrap();
    assert!(!Arc::ptr_eq(&edited, &recompiled));
    assert_eq!(recompiled.catalogue_version, 2);

    assert_eq!(cache.len(), 1);
    cache.invalidate_world("overworld");
    assert!(cache.is_empty());
}
