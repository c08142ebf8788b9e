use std::sync::Arc;

use compact_str::{CompactString, format_compact};

use crate::ast::*;
use crate::catalogue::Catalogue;
use crate::compiler::Layout;
use crate::engine::*;
use crate::grid::*;
use crate::runtime::*;
use crate::services::Services;
use crate::std_util::ManualClock;

mod compiler;
mod functions;

/// A host that records everything programs ask of it.
#[derive(Default)]
struct TestHost {
    offline: Vec<ActorId>,
    /// Host actions in the order they were performed, as `action(k=v, ...)`.
    performed: Vec<CompactString>,
    printed: Vec<CompactString>,
}
impl TestHost {
    fn effects(&self) -> Vec<&str> {
        self.performed.iter().map(|x| x.as_str()).collect()
    }
}
impl Host for TestHost {
    fn is_connected(&self, actor: &ActorId) -> bool {
        !self.offline.contains(actor)
    }
    fn perform_action(&mut self, request: ActionRequest<'_>) -> Result<Option<Value>, ErrorCause> {
        let args = request.args.iter().map(|(k, v)| format_compact!("{k}={v}")).collect::<Vec<_>>().join(", ");
        match request.action {
            "explode" => Err(ErrorCause::Host { msg: "boom".into() }),
            "roll" => {
                self.performed.push(format_compact!("roll({args})"));
                Ok(Some(Value::from(4)))
            }
            action => {
                self.performed.push(format_compact!("{action}({args})"));
                Ok(None)
            }
        }
    }
    fn check_condition(&mut self, request: ActionRequest<'_>) -> Result<bool, ErrorCause> {
        match request.action {
            "has_item" => Ok(request.args.get("item").is_some_and(|x| !x.is_empty())),
            action => Err(ErrorCause::NotSupported { action: action.into() }),
        }
    }
    fn print(&mut self, _: &ActorId, text: &str) {
        self.printed.push(text.into());
    }
}

fn actor(name: &str) -> ActorId {
    ActorId::new(name)
}

fn services(settings: Settings) -> (Arc<Services>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1_000));
    let settings = Settings { rng_seed: Some(7), ..settings };
    (Services::init(settings, clock.clone()), clock)
}

fn engine(settings: Settings) -> (Engine, Arc<ManualClock>) {
    let (services, clock) = services(settings);
    (Engine::new(services, Catalogue::standard().unwrap(), Layout::default()), clock)
}

fn action(name: &str) -> Node {
    Node::new("action", Category::Action).with_action(name)
}
fn variable(name: &str) -> Node {
    Node::new("variable", Category::Variable).with_action(name)
}
fn set(var: &str, value: impl Into<Value>) -> Node {
    variable("set").with_param("name", var).with_param("value", value)
}
fn condition(name: &str) -> Node {
    Node::new("condition", Category::Condition).with_action(name)
}
fn compare(left: impl Into<Value>, op: &str, right: impl Into<Value>) -> Node {
    condition("compare").with_param("left", left).with_param("op", op).with_param("right", right)
}
fn otherwise() -> Node {
    Node::new("else", Category::Else).with_action("else")
}
fn looped(name: &str) -> Node {
    Node::new("loop", Category::Loop).with_action(name)
}
fn control(name: &str) -> Node {
    Node::new("control", Category::Control).with_action(name)
}
fn call(function: &str) -> Node {
    Node::new("call", Category::Call).with_action("call").with_param("function", function)
}

/// Builds an event program whose body is the given chain.
fn program(body: Vec<Node>) -> Program {
    let mut root = Node::new("event", Category::Event).with_action("on_trigger");
    root.set_next(Node::chain(body));
    Program::event("on_trigger", root, Origin::new("overworld", GridPos::new(0, 64, 0)))
}

/// Runs a program to completion, ticking as often as needed.
fn run(engine: &mut Engine, host: &mut TestHost, body: Vec<Node>) -> RunReport {
    let program = program(body);
    let origin = program.origin.clone();
    match engine.execute(host, &program, &actor("alex"), &origin) {
        Execution::Finished(report) => report,
        Execution::Suspended(key) => run_until_done(engine, host, key),
    }
}

fn run_until_done(engine: &mut Engine, host: &mut TestHost, key: RunKey) -> RunReport {
    for _ in 0..1_000 {
        if let Some(report) = engine.tick(host).into_iter().find(|x| x.key == key) {
            return report;
        }
    }
    panic!("run {key:?} never finished");
}

fn local<'a>(report: &'a RunReport, name: &str) -> Option<&'a Value> {
    report.locals.lookup(name)
}
