//! The execution state machine of a single run.
//!
//! A [`Process`] executes one linked [`Script`] against an [`ExecutionContext`], one node per [`Process::step`].
//! Function calls push a new activation with its own fresh context; returning pops it and hands the
//! `return` variable back to the caller. Nothing ever blocks: waits and loop delays surface as
//! [`ProcessStep::Suspend`] and the scheduler decides when to step the process again.
//!
//! Failures are contained as close to their source as possible. An ordinary action that fails is
//! logged and skipped. A condition that fails counts as false. Only validation errors and resource
//! limits end the whole run.

use std::sync::Arc;
use std::mem;

use compact_str::CompactString;
use rand::{Rng, RngCore};

use crate::ast::Category;
use crate::expr::Env;
use crate::functions::*;
use crate::grid::Origin;
use crate::runtime::*;
use crate::script::*;
use crate::services::Services;
use crate::vecmap::VecMap;

/// Pending loop control requests of a context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopFlags {
    pub break_requested: bool,
    pub continue_requested: bool,
}

/// The state visible to the nodes of one invocation: a top-level trigger or a single function call.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub actor: ActorId,
    pub origin: Origin,
    pub locals: SymbolTable,
    pub flags: LoopFlags,
}
impl ExecutionContext {
    pub fn new(actor: ActorId, origin: Origin) -> Self {
        Self { actor, origin, locals: Default::default(), flags: Default::default() }
    }
    pub fn with_locals(mut self, locals: SymbolTable) -> Self {
        self.locals = locals;
        self
    }
}

struct Formulas<'a> {
    locals: &'a SymbolTable,
    rng: &'a mut dyn RngCore,
}
impl Env for Formulas<'_> {
    fn lookup(&self, var: &str) -> Option<Value> {
        self.locals.lookup(var).cloned()
    }
    fn random(&mut self) -> f64 {
        self.rng.gen()
    }
}

/// What a built-in action handler asks the process to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Suspend { ticks: u64 },
    Stop,
}

/// Everything a handler may touch while executing one node.
pub struct HandlerCtx<'a> {
    pub op: &'a Op,
    pub context: &'a mut ExecutionContext,
    pub host: &'a mut dyn Host,
    pub rng: &'a mut dyn RngCore,
}
impl HandlerCtx<'_> {
    /// Evaluates a parameter, if present.
    pub fn opt_arg(&mut self, name: &str) -> Result<Option<Value>, ErrorCause> {
        let op = self.op;
        match op.args.get(name) {
            None => Ok(None),
            Some(arg) => arg.eval(&mut Formulas { locals: &self.context.locals, rng: &mut *self.rng }).map(Some),
        }
    }
    /// Evaluates a parameter that must be present.
    pub fn arg(&mut self, name: &str) -> Result<Value, ErrorCause> {
        self.opt_arg(name)?.ok_or_else(|| ErrorCause::MissingParameter { name: name.into() })
    }
    /// Evaluates every parameter.
    pub fn args(&mut self) -> Result<VecMap<CompactString, Value, false>, ErrorCause> {
        let op = self.op;
        let mut res = VecMap::with_capacity(op.args.len());
        for (name, arg) in op.args.iter() {
            res.insert(name.clone(), arg.eval(&mut Formulas { locals: &self.context.locals, rng: &mut *self.rng })?);
        }
        Ok(res)
    }
    /// Evaluates a parameter holding a variable name.
    pub fn var_name(&mut self, name: &str) -> Result<CompactString, ErrorCause> {
        Ok(self.arg(name)?.as_text().into_owned())
    }
    fn flag(&mut self, name: &str) -> Result<bool, ErrorCause> {
        Ok(match self.opt_arg(name)? {
            Some(x) => x.as_bool()?,
            None => false,
        })
    }
}

pub type ActionHandler = fn(&mut HandlerCtx<'_>) -> Result<Flow, ErrorCause>;
pub type ConditionHandler = fn(&mut HandlerCtx<'_>) -> Result<bool, ErrorCause>;

/// Built-in handlers keyed by action id. Actions missing from the table go to [`Host::perform_action`]
/// and conditions to [`Host::check_condition`].
#[derive(Clone)]
pub struct ActionTable {
    actions: VecMap<CompactString, ActionHandler, true>,
    conditions: VecMap<CompactString, ConditionHandler, true>,
}
impl ActionTable {
    /// A table with no handlers; everything is delegated to the host.
    pub fn empty() -> Self {
        Self { actions: Default::default(), conditions: Default::default() }
    }
    pub fn standard() -> Self {
        let mut res = Self::empty();
        res.set_action("set", set_var);
        res.set_action("add", add_var);
        res.set_action("append", append_var);
        res.set_action("put", put_var);
        res.set_action("remove", remove_var);
        res.set_action("log", log);
        res.set_action("wait", wait);
        res.set_action("stop", |_| Ok(Flow::Stop));
        res.set_condition("compare", compare);
        res.set_condition("is_empty", |ctx| Ok(ctx.arg("value")?.is_empty()));
        res.set_condition("exists", |ctx| {
            let name = ctx.var_name("name")?;
            Ok(ctx.context.locals.lookup(&name).is_some())
        });
        res.set_condition("formula", |ctx| Ok(ctx.arg("value")?.as_bool()?));
        res.set_condition("actor_online", |ctx| {
            let actor = ctx.arg("actor")?.as_actor()?;
            Ok(ctx.host.is_connected(&actor))
        });
        res
    }
    /// Installs or replaces an action handler, returning the previous one.
    pub fn set_action(&mut self, action: &str, handler: ActionHandler) -> Option<ActionHandler> {
        self.actions.insert(action.into(), handler)
    }
    /// Installs or replaces a condition handler, returning the previous one.
    pub fn set_condition(&mut self, action: &str, handler: ConditionHandler) -> Option<ConditionHandler> {
        self.conditions.insert(action.into(), handler)
    }
    pub fn action(&self, action: &str) -> Option<ActionHandler> {
        self.actions.get(action).copied()
    }
    pub fn condition(&self, action: &str) -> Option<ConditionHandler> {
        self.conditions.get(action).copied()
    }
}
impl Default for ActionTable {
    fn default() -> Self {
        Self::standard()
    }
}
impl std::fmt::Debug for ActionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionTable")
            .field("actions", &self.actions.keys().collect::<Vec<_>>())
            .field("conditions", &self.conditions.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn count(value: &Value) -> Result<u64, ErrorCause> {
    let n = value.as_number()?;
    n.as_count().ok_or(ErrorCause::InvalidCount { value: n.get() })
}

fn set_var(ctx: &mut HandlerCtx<'_>) -> Result<Flow, ErrorCause> {
    let name = ctx.var_name("name")?;
    let value = ctx.arg("value")?;
    ctx.context.locals.define_or_redefine(&name, value);
    Ok(Flow::Continue)
}
fn add_var(ctx: &mut HandlerCtx<'_>) -> Result<Flow, ErrorCause> {
    let name = ctx.var_name("name")?;
    let amount = match ctx.opt_arg("amount")? {
        Some(x) => x.as_number()?,
        None => Number::from(1),
    };
    let current = match ctx.context.locals.lookup(&name) {
        Some(x) => x.as_number()?,
        None => Number::default(),
    };
    ctx.context.locals.define_or_redefine(&name, Value::Number(Number::new(current.get() + amount.get())?));
    Ok(Flow::Continue)
}
fn append_var(ctx: &mut HandlerCtx<'_>) -> Result<Flow, ErrorCause> {
    let name = ctx.var_name("name")?;
    let value = ctx.arg("value")?;
    match ctx.context.locals.lookup_mut(&name) {
        Some(Value::List(list)) => Arc::make_mut(list).push(value),
        Some(x) => return Err(ConversionError { got: x.kind(), expected: ValueKind::List }.into()),
        None => ctx.context.locals.define_or_redefine(&name, Value::from(vec![value])),
    }
    Ok(Flow::Continue)
}
fn put_var(ctx: &mut HandlerCtx<'_>) -> Result<Flow, ErrorCause> {
    let name = ctx.var_name("name")?;
    let key = ctx.arg("key")?.as_text().into_owned();
    let value = ctx.arg("value")?;
    match ctx.context.locals.lookup_mut(&name) {
        Some(Value::Map(map)) => { Arc::make_mut(map).insert(key, value); }
        Some(x) => return Err(ConversionError { got: x.kind(), expected: ValueKind::Map }.into()),
        None => ctx.context.locals.define_or_redefine(&name, Value::from(VecMap::<CompactString, Value, true>::from_iter([(key, value)]))),
    }
    Ok(Flow::Continue)
}
fn remove_var(ctx: &mut HandlerCtx<'_>) -> Result<Flow, ErrorCause> {
    let name = ctx.var_name("name")?;
    ctx.context.locals.remove(&name);
    Ok(Flow::Continue)
}
fn log(ctx: &mut HandlerCtx<'_>) -> Result<Flow, ErrorCause> {
    let text = ctx.arg("text")?;
    let text = text.as_text();
    tracing::debug!(actor = %ctx.context.actor, "log: {}", &*text);
    ctx.host.print(&ctx.context.actor, &text);
    Ok(Flow::Continue)
}
fn wait(ctx: &mut HandlerCtx<'_>) -> Result<Flow, ErrorCause> {
    let ticks = match ctx.opt_arg("ticks")? {
        Some(x) => count(&x)?,
        None => 1,
    };
    Ok(if ticks == 0 { Flow::Continue } else { Flow::Suspend { ticks } })
}
fn compare(ctx: &mut HandlerCtx<'_>) -> Result<bool, ErrorCause> {
    let left = ctx.arg("left")?;
    let right = ctx.arg("right")?;
    // `==` and `=` look like formulas, so operators that do not parse are taken literally
    let op = match ctx.op.args.get("op") {
        None => "==".into(),
        Some(Arg::Invalid { src, .. }) => src.clone(),
        Some(_) => ctx.arg("op")?.as_text().into_owned(),
    };
    Ok(match op.trim() {
        "==" | "=" | "eq" | "equals" => left.loose_eq(&right),
        "!=" | "<>" | "ne" => !left.loose_eq(&right),
        "<" | "lt" => left.compare(&right)?.is_lt(),
        "<=" | "le" => left.compare(&right)?.is_le(),
        ">" | "gt" => left.compare(&right)?.is_gt(),
        ">=" | "ge" => left.compare(&right)?.is_ge(),
        "contains" => match &left {
            Value::List(items) => items.iter().any(|x| x.loose_eq(&right)),
            Value::Map(map) => map.contains_key(&*right.as_text()),
            x => x.as_text().to_lowercase().contains(&right.as_text().to_lowercase()),
        }
        _ => return Err(ErrorCause::UnknownOperator { op }),
    })
}

fn host_action(ctx: &mut HandlerCtx<'_>, action: &str) -> Result<Flow, ErrorCause> {
    let args = ctx.args()?;
    let value = ctx.host.perform_action(ActionRequest { actor: &ctx.context.actor, origin: &ctx.context.origin, action, args: &args })?;
    if let (Some(value), Some(var)) = (value, args.get("result")) {
        ctx.context.locals.define_or_redefine(&var.as_text(), value);
    }
    Ok(Flow::Continue)
}
fn host_condition(ctx: &mut HandlerCtx<'_>, action: &str) -> Result<bool, ErrorCause> {
    let args = ctx.args()?;
    ctx.host.check_condition(ActionRequest { actor: &ctx.context.actor, origin: &ctx.context.origin, action, args: &args })
}

/// The collaborators a process needs while stepping.
pub struct StepEnv<'a> {
    pub host: &'a mut dyn Host,
    pub services: &'a Arc<Services>,
    pub actions: &'a ActionTable,
    pub rng: &'a mut dyn RngCore,
}

/// Result of stepping through a [`Process`].
#[derive(Debug)]
pub enum ProcessStep {
    /// The process was not running.
    Idle,
    /// The process executed one node (or one piece of control bookkeeping) and can keep going.
    Normal,
    /// The process is waiting; step it again after the given number of ticks.
    Suspend { ticks: u64 },
    /// An `async` loop was split off into a new process of the same actor, which should be scheduled alongside this one.
    Fork { process: Box<Process> },
    /// The process finished. `result` holds the value of the `return` variable, if any.
    Terminate { result: Option<Value> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Root,
    Branch,
    LoopBody,
}
#[derive(Debug)]
struct Block {
    next: Option<usize>,
    kind: BlockKind,
    /// Set right after a condition that did not run its branch, so a following else can.
    else_armed: bool,
}

#[derive(Debug)]
enum LoopKind {
    Repeat { times: u64, counter: Option<CompactString> },
    While { limit: u64 },
    ForEach { items: Arc<Vec<Value>>, var: CompactString },
    Forever,
}
#[derive(Debug)]
struct LoopFrame {
    op: usize,
    body: Option<usize>,
    kind: LoopKind,
    iteration: u64,
    delay: u64,
    waited: bool,
}

#[derive(Debug)]
enum Frame {
    Block(Block),
    Loop(LoopFrame),
}

#[derive(Debug)]
struct CallInfo {
    guard: CallGuard,
    /// Caller variable receiving the return value.
    result: Option<CompactString>,
}

#[derive(Debug)]
struct Activation {
    script: Arc<Script>,
    context: ExecutionContext,
    frames: Vec<Frame>,
    call: Option<CallInfo>,
}
impl Activation {
    fn new(script: Arc<Script>, context: ExecutionContext, call: Option<CallInfo>) -> Self {
        let frames = vec![Frame::Block(Block { next: script.entry, kind: BlockKind::Root, else_armed: false })];
        Self { script, context, frames, call }
    }
    fn enter(&mut self, body: Option<usize>, kind: BlockKind) {
        self.frames.push(Frame::Block(Block { next: body, kind, else_armed: false }));
    }
    fn arm_else(&mut self) {
        if let Some(Frame::Block(block)) = self.frames.last_mut() {
            block.else_armed = true;
        }
    }
}

enum Next {
    Finish,
    PopBlock,
    Boundary,
    Exec { pos: usize, armed: bool },
}

struct PreparedCall {
    function: CompactString,
    result: Option<CompactString>,
    named: VecMap<CompactString, Value, false>,
    positional: Vec<Value>,
}
fn prepare_call(ctx: &mut HandlerCtx<'_>) -> Result<PreparedCall, ErrorCause> {
    let function = ctx.arg("function")?.as_text().into_owned();
    let result = ctx.opt_arg("result")?.map(|x| x.as_text().into_owned()).filter(|x| !x.is_empty());
    let positional = match ctx.opt_arg("args")? {
        None => vec![],
        Some(Value::List(x)) => x.as_ref().clone(),
        Some(x) => vec![x],
    };
    let op = ctx.op;
    let mut named = VecMap::new();
    for (name, _) in op.args.iter() {
        if matches!(name.as_str(), "function" | "result" | "args") { continue }
        named.insert(name.clone(), ctx.arg(name)?);
    }
    Ok(PreparedCall { function, result, named, positional })
}

fn check_condition(context: &mut ExecutionContext, env: &mut StepEnv<'_>, op: &Op, action: &str) -> bool {
    let mut ctx = HandlerCtx { op, context, host: &mut *env.host, rng: &mut *env.rng };
    let res = match env.actions.condition(action) {
        Some(handler) => handler(&mut ctx),
        None => host_condition(&mut ctx, action),
    };
    match res.and_then(|x| Ok(x != ctx.flag("negate")?)) {
        Ok(x) => x,
        Err(cause) => {
            tracing::warn!(actor = %ctx.context.actor, node = op.id.get(), "condition treated as false: {}", ExecError { cause, action: action.into() });
            false
        }
    }
}

fn setup_loop(ctx: &mut HandlerCtx<'_>, action: &str, settings: &Settings) -> Result<(LoopKind, u64, bool), ErrorCause> {
    let delay = match ctx.opt_arg("delay")? {
        Some(x) => count(&x)?,
        None => 0,
    };
    let fork = ctx.flag("async")?;
    let kind = match action {
        "repeat" => LoopKind::Repeat {
            times: count(&ctx.arg("times")?)?,
            counter: ctx.opt_arg("counter")?.map(|x| x.as_text().into_owned()),
        },
        "while" => LoopKind::While {
            limit: match ctx.opt_arg("limit")? {
                Some(x) => count(&x)?,
                None => settings.max_loop_iterations,
            },
        },
        "for_each" => LoopKind::ForEach {
            items: ctx.arg("list")?.as_list()?.clone(),
            var: ctx.opt_arg("var")?.map(|x| x.as_text().into_owned()).unwrap_or_else(|| "item".into()),
        },
        "forever" => LoopKind::Forever,
        _ => return Err(ErrorCause::NotSupported { action: action.into() }),
    };
    Ok((kind, delay, fork))
}

/// The state of one run: a stack of activations, innermost last.
#[derive(Debug)]
pub struct Process {
    stack: Vec<Activation>,
    final_locals: Option<SymbolTable>,
}
impl Process {
    /// Creates a process that runs `script` from its entry.
    pub fn new(script: Arc<Script>, context: ExecutionContext) -> Self {
        Self { stack: vec![Activation::new(script, context, None)], final_locals: None }
    }
    /// Creates a process whose outermost activation is an already accepted function call.
    /// The call's return value becomes the process result.
    pub fn for_call(guard: CallGuard, context: ExecutionContext) -> Self {
        let script = guard.entry().script.clone();
        Self { stack: vec![Activation::new(script, context, Some(CallInfo { guard, result: None }))], final_locals: None }
    }
    pub fn is_running(&self) -> bool {
        !self.stack.is_empty()
    }
    /// Number of function calls currently on the stack.
    pub fn call_depth(&self) -> usize {
        self.stack.iter().filter(|x| x.call.is_some()).count()
    }
    /// The innermost context, while running.
    pub fn context(&self) -> Option<&ExecutionContext> {
        self.stack.last().map(|x| &x.context)
    }
    /// The locals of the outermost activation: live while running, final once finished.
    pub fn locals(&self) -> Option<&SymbolTable> {
        match self.stack.first() {
            Some(x) => Some(&x.context.locals),
            None => self.final_locals.as_ref(),
        }
    }
    pub fn take_locals(&mut self) -> SymbolTable {
        match self.stack.first() {
            Some(x) => x.context.locals.clone(),
            None => self.final_locals.take().unwrap_or_default(),
        }
    }
    /// Describes what the process is doing right now (never a terminal state).
    pub fn state(&self) -> RunState {
        let act = match self.stack.last() {
            Some(x) => x,
            None => return RunState::Idle,
        };
        for frame in act.frames.iter().rev() {
            match frame {
                Frame::Loop(_) | Frame::Block(Block { kind: BlockKind::LoopBody, .. }) => return RunState::Looping,
                Frame::Block(Block { kind: BlockKind::Branch, .. }) => return RunState::Branching,
                Frame::Block(Block { kind: BlockKind::Root, .. }) => (),
            }
        }
        RunState::Running
    }
    /// Ends the process from the outside. Active calls are recorded as cancelled.
    pub fn cancel(&mut self) {
        self.release(0, CallOutcome::Cancelled);
    }
    /// Ends the process after a failure detected outside of it, such as an exhausted step budget.
    pub fn fail(&mut self) {
        self.release(0, CallOutcome::Failure);
    }

    /// Pops every activation at or above `from`, recording `outcome` for the calls among them.
    fn release(&mut self, from: usize, outcome: CallOutcome) {
        if from == 0 {
            if let Some(bottom) = self.stack.first() {
                self.final_locals = Some(bottom.context.locals.clone());
            }
        }
        while self.stack.len() > from {
            if let Some(Activation { call: Some(mut call), .. }) = self.stack.pop() {
                call.guard.set_outcome(outcome);
            }
        }
    }

    /// Fails the process if any of its active calls is past its deadline.
    /// The expired call is recorded as timed out and every other active call as failed.
    pub fn check_deadlines(&mut self, services: &Services) -> Result<(), Error> {
        let now = services.now_ms();
        let expired = self.stack.iter().enumerate().find_map(|(i, act)| match &act.call {
            Some(call) if now > call.guard.deadline_ms() => Some((i, call.guard.entry().def.name.clone(), call.guard.time_limit_ms())),
            _ => None,
        });
        match expired {
            None => Ok(()),
            Some((i, function, limit_ms)) => {
                tracing::warn!(function = %function, limit_ms, "call timed out");
                self.release(i, CallOutcome::Timeout);
                self.release(0, CallOutcome::Failure);
                Err(ResourceLimitError::Timeout { function, limit_ms }.into())
            }
        }
    }

    /// Executes a single node or control transition.
    /// An error means the run failed as a whole; the process is no longer running afterwards.
    pub fn step(&mut self, env: &mut StepEnv<'_>) -> Result<ProcessStep, Error> {
        if self.stack.is_empty() {
            return Ok(ProcessStep::Idle);
        }
        self.check_deadlines(env.services)?;
        let res = self.step_inner(env);
        if res.is_err() {
            self.release(0, CallOutcome::Failure);
        }
        res
    }

    fn step_inner(&mut self, env: &mut StepEnv<'_>) -> Result<ProcessStep, Error> {
        let next = match self.stack.last_mut() {
            None => return Ok(ProcessStep::Idle),
            Some(act) => match act.frames.last_mut() {
                None => Next::Finish,
                Some(Frame::Loop(_)) => Next::Boundary,
                Some(Frame::Block(block)) => match block.next {
                    None => Next::PopBlock,
                    Some(pos) => {
                        block.next = act.script.op(pos).and_then(|x| x.next);
                        Next::Exec { pos, armed: mem::take(&mut block.else_armed) }
                    }
                }
            }
        };
        match next {
            Next::Finish => self.finish_activation(),
            Next::PopBlock => {
                if let Some(act) = self.stack.last_mut() {
                    act.frames.pop();
                }
                Ok(ProcessStep::Normal)
            }
            Next::Boundary => self.loop_boundary(env),
            Next::Exec { pos, armed } => self.exec(env, pos, armed),
        }
    }

    fn exec(&mut self, env: &mut StepEnv<'_>, pos: usize, armed: bool) -> Result<ProcessStep, Error> {
        let act = match self.stack.last_mut() {
            Some(x) => x,
            None => return Ok(ProcessStep::Idle),
        };
        let script = act.script.clone();
        let op = match script.op(pos) {
            Some(x) => x,
            None => return Ok(ProcessStep::Normal),
        };
        let action = match (op.category, op.action.as_deref()) {
            (Category::Else, None | Some("else")) => {
                if armed {
                    act.enter(op.body, BlockKind::Branch);
                }
                return Ok(ProcessStep::Normal);
            }
            (_, None) => return Ok(ProcessStep::Normal), // unset action: no-op
            (_, Some(action)) => action,
        };

        match op.category {
            Category::Event | Category::Function | Category::Bracket => Ok(ProcessStep::Normal),
            Category::Condition | Category::Else => {
                if op.category == Category::Else && !armed {
                    return Ok(ProcessStep::Normal);
                }
                if check_condition(&mut act.context, env, op, action) {
                    act.enter(op.body, BlockKind::Branch);
                } else {
                    act.arm_else();
                }
                Ok(ProcessStep::Normal)
            }
            Category::Loop => self.enter_loop(env, pos, op, action),
            Category::Call => self.call(env, op),
            Category::Control => match action {
                "break" => self.request_loop_exit(true),
                "continue" => self.request_loop_exit(false),
                "return" => self.do_return(env, op),
                _ => self.perform(env, op, action),
            }
            Category::Action | Category::Variable => self.perform(env, op, action),
        }
    }

    fn perform(&mut self, env: &mut StepEnv<'_>, op: &Op, action: &str) -> Result<ProcessStep, Error> {
        let act = match self.stack.last_mut() {
            Some(x) => x,
            None => return Ok(ProcessStep::Idle),
        };
        let mut ctx = HandlerCtx { op, context: &mut act.context, host: &mut *env.host, rng: &mut *env.rng };
        let res = match env.actions.action(action) {
            Some(handler) => handler(&mut ctx),
            None => host_action(&mut ctx, action),
        };
        match res {
            Ok(Flow::Continue) => Ok(ProcessStep::Normal),
            Ok(Flow::Suspend { ticks }) => Ok(ProcessStep::Suspend { ticks }),
            Ok(Flow::Stop) => {
                self.release(0, CallOutcome::Success);
                Ok(ProcessStep::Terminate { result: None })
            }
            Err(cause) => {
                tracing::warn!(actor = %act.context.actor, node = op.id.get(), "{}", ExecError { cause, action: action.into() });
                Ok(ProcessStep::Normal)
            }
        }
    }

    fn enter_loop(&mut self, env: &mut StepEnv<'_>, pos: usize, op: &Op, action: &str) -> Result<ProcessStep, Error> {
        let act = match self.stack.last_mut() {
            Some(x) => x,
            None => return Ok(ProcessStep::Idle),
        };
        let mut ctx = HandlerCtx { op, context: &mut act.context, host: &mut *env.host, rng: &mut *env.rng };
        let (kind, delay, fork) = match setup_loop(&mut ctx, action, env.services.settings()) {
            Ok(x) => x,
            Err(cause) => {
                tracing::warn!(actor = %act.context.actor, node = op.id.get(), "loop skipped: {}", ExecError { cause, action: action.into() });
                return Ok(ProcessStep::Normal);
            }
        };
        let frame = Frame::Loop(LoopFrame { op: pos, body: op.body, kind, iteration: 0, delay, waited: false });

        if fork {
            let context = ExecutionContext::new(act.context.actor.clone(), act.context.origin.clone()).with_locals(act.context.locals.clone());
            let forked = Activation { script: act.script.clone(), context, frames: vec![frame], call: None };
            return Ok(ProcessStep::Fork { process: Box::new(Process { stack: vec![forked], final_locals: None }) });
        }
        act.frames.push(frame);
        Ok(ProcessStep::Normal)
    }

    fn loop_boundary(&mut self, env: &mut StepEnv<'_>) -> Result<ProcessStep, Error> {
        let act = match self.stack.last_mut() {
            Some(x) => x,
            None => return Ok(ProcessStep::Idle),
        };
        let flags = mem::take(&mut act.context.flags);
        let script = act.script.clone();
        let frame = match act.frames.last_mut() {
            Some(Frame::Loop(x)) => x,
            _ => return Ok(ProcessStep::Normal),
        };
        if flags.break_requested {
            act.frames.pop();
            return Ok(ProcessStep::Normal);
        }

        let more = match &frame.kind {
            LoopKind::Repeat { times, .. } => frame.iteration < *times,
            LoopKind::ForEach { items, .. } => (frame.iteration as usize) < items.len(),
            LoopKind::Forever => true,
            LoopKind::While { limit } => {
                if frame.iteration >= *limit {
                    tracing::warn!(actor = %act.context.actor, limit = *limit, "while loop stopped at its iteration limit");
                }
                frame.iteration < *limit
            }
        };
        if !more {
            act.frames.pop();
            return Ok(ProcessStep::Normal);
        }
        if frame.iteration > 0 && frame.delay > 0 && !frame.waited {
            frame.waited = true;
            return Ok(ProcessStep::Suspend { ticks: frame.delay });
        }
        frame.waited = false;

        if let LoopKind::While { .. } = frame.kind {
            let condition = script.op(frame.op).and_then(|x| x.args.get("condition"));
            let keep = match condition {
                None => Err(ErrorCause::MissingParameter { name: "condition".into() }),
                Some(arg) => arg.eval(&mut Formulas { locals: &act.context.locals, rng: &mut *env.rng }).and_then(|x| Ok(x.as_bool()?)),
            };
            let keep = match keep {
                Ok(x) => x,
                Err(cause) => {
                    tracing::warn!(actor = %act.context.actor, "loop condition treated as false: {}", ExecError { cause, action: "while".into() });
                    false
                }
            };
            if !keep {
                act.frames.pop();
                return Ok(ProcessStep::Normal);
            }
        }

        frame.iteration += 1;
        let (iteration, body) = (frame.iteration, frame.body);
        match &frame.kind {
            LoopKind::Repeat { counter: Some(counter), .. } => {
                if let Ok(n) = Number::new(iteration as f64) {
                    act.context.locals.define_or_redefine(counter, Value::Number(n));
                }
            }
            LoopKind::ForEach { items, var } => {
                if let Some(item) = items.get(iteration as usize - 1) {
                    act.context.locals.define_or_redefine(var, item.clone());
                }
            }
            _ => (),
        }
        act.enter(body, BlockKind::LoopBody);
        Ok(ProcessStep::Normal)
    }

    /// Handles `break` (`true`) and `continue` (`false`) by unwinding to the nearest loop of the current activation.
    fn request_loop_exit(&mut self, is_break: bool) -> Result<ProcessStep, Error> {
        let act = match self.stack.last_mut() {
            Some(x) => x,
            None => return Ok(ProcessStep::Idle),
        };
        match act.frames.iter().rposition(|x| matches!(x, Frame::Loop(_))) {
            None => tracing::warn!(actor = %act.context.actor, "`{}` outside of a loop has no effect", if is_break { "break" } else { "continue" }),
            Some(i) => {
                act.frames.truncate(i + 1);
                if is_break {
                    act.context.flags.break_requested = true;
                } else {
                    act.context.flags.continue_requested = true;
                }
            }
        }
        Ok(ProcessStep::Normal)
    }

    fn do_return(&mut self, env: &mut StepEnv<'_>, op: &Op) -> Result<ProcessStep, Error> {
        let act = match self.stack.last_mut() {
            Some(x) => x,
            None => return Ok(ProcessStep::Idle),
        };
        let mut ctx = HandlerCtx { op, context: &mut act.context, host: &mut *env.host, rng: &mut *env.rng };
        match ctx.opt_arg("value") {
            Ok(Some(value)) => act.context.locals.define_or_redefine(RETURN_VAR, value),
            Ok(None) => (),
            Err(cause) => tracing::warn!(actor = %act.context.actor, node = op.id.get(), "return value dropped: {}", ExecError { cause, action: "return".into() }),
        }
        act.frames.clear();
        Ok(ProcessStep::Normal)
    }

    fn finish_activation(&mut self) -> Result<ProcessStep, Error> {
        let Activation { context, call, .. } = match self.stack.pop() {
            Some(x) => x,
            None => return Ok(ProcessStep::Idle),
        };
        let mut value = context.locals.lookup(RETURN_VAR).cloned();
        if let Some(mut call) = call {
            let def = &call.guard.entry().def;
            value = match value.map(|x| x.coerce(def.returns)) {
                None => None,
                Some(Ok(x)) => Some(x),
                Some(Err(e)) => {
                    tracing::warn!(function = %def.name, "return value dropped: {}", ErrorCause::from(e));
                    None
                }
            };
            call.guard.set_outcome(CallOutcome::Success);
            if let Some(caller) = self.stack.last_mut() {
                if let (Some(var), Some(value)) = (&call.result, &value) {
                    caller.context.locals.define_or_redefine(var, value.clone());
                }
                return Ok(ProcessStep::Normal);
            }
        }
        self.final_locals = Some(context.locals);
        Ok(ProcessStep::Terminate { result: value })
    }

    fn call(&mut self, env: &mut StepEnv<'_>, op: &Op) -> Result<ProcessStep, Error> {
        let act = match self.stack.last_mut() {
            Some(x) => x,
            None => return Ok(ProcessStep::Idle),
        };
        let mut ctx = HandlerCtx { op, context: &mut act.context, host: &mut *env.host, rng: &mut *env.rng };
        let prepared = match prepare_call(&mut ctx) {
            Ok(x) => x,
            Err(cause) => {
                tracing::warn!(actor = %act.context.actor, node = op.id.get(), "call skipped: {}", ExecError { cause, action: "call".into() });
                return Ok(ProcessStep::Normal);
            }
        };

        let (actor, origin) = (act.context.actor.clone(), act.context.origin.clone());
        let entry = env.services.registry().lookup(&prepared.function, &actor, &origin.world)
            .ok_or_else(|| ValidationError::UnknownFunction { name: prepared.function.clone() })?;
        let locals = match entry.def.bind_args(prepared.named, prepared.positional) {
            Ok(x) => x,
            Err(e) => {
                entry.stats.record_rejection();
                return Err(e.into());
            }
        };
        let guard = CallGuard::acquire(env.services, &entry, &actor)?;
        tracing::debug!(function = %entry.def.name, actor = %actor, depth = env.services.call_depth(&actor), "call");

        let context = ExecutionContext::new(actor, origin).with_locals(locals);
        self.stack.push(Activation::new(entry.script.clone(), context, Some(CallInfo { guard, result: prepared.result })));
        Ok(ProcessStep::Normal)
    }
}
