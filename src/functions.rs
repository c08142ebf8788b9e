//! Named, reusable program bodies that other programs can call.
//!
//! Functions live in a [`FunctionRegistry`] partitioned by scope. A call resolves the name
//! through the tiers in order (the caller's private functions, shared functions the caller may use,
//! functions of the caller's world, then global functions) and the first match wins.
//!
//! Every accepted call holds a [`CallGuard`] for its whole lifetime, which may span many ticks.
//! The guard owns the caller's depth slot and one unit of the global call budget, and records the
//! call's outcome and latency in the function's [`FunctionStats`] when dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use compact_str::CompactString;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Serialize, Deserialize};

use crate::ast::*;
use crate::grid::Origin;
use crate::runtime::*;
use crate::script::Script;
use crate::services::Services;
use crate::util::is_identifier;
use crate::vecmap::VecMap;

/// One declared parameter of a function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: CompactString,
    pub kind: ValueKind,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}
impl ParameterSpec {
    pub fn required(name: &str, kind: ValueKind) -> Self {
        Self { name: name.into(), kind, required: true, default: None }
    }
    pub fn optional(name: &str, kind: ValueKind, default: Value) -> Self {
        Self { name: name.into(), kind, required: false, default: Some(default) }
    }
    /// Parses the text form `name[:kind][?][=default]`, e.g. `target:actor` or `count:number?=1`.
    /// The kind defaults to `any`; a `?` or a default makes the parameter optional.
    /// Defaults are converted to the declared kind.
    pub fn parse(text: &str) -> Result<Self, ValidationError> {
        let bad = || ValidationError::BadParameterSpec { text: text.into() };
        let (head, default) = match text.split_once('=') {
            Some((head, default)) => (head.trim(), Some(default.trim())),
            None => (text.trim(), None),
        };
        let (head, optional) = match head.strip_suffix('?') {
            Some(head) => (head.trim_end(), true),
            None => (head, default.is_some()),
        };
        let (name, kind) = match head.split_once(':') {
            Some((name, kind)) => (name.trim(), ValueKind::parse(kind.trim()).ok_or_else(bad)?),
            None => (head, ValueKind::Any),
        };
        if name.is_empty() {
            return Err(bad());
        }
        let default = match default {
            None => None,
            Some(raw) => Some(Value::from(raw).coerce(kind).map_err(|e| ValidationError::DefaultKind { name: name.into(), expected: kind, got: e.got })?),
        };
        Ok(Self { name: name.into(), kind, required: !optional, default })
    }
}

/// Visibility tier of a function.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "tier", content = "world", rename_all = "snake_case")]
pub enum FunctionScope {
    /// Callable by everyone.
    Global,
    /// Callable by programs running in the given world.
    World(CompactString),
    /// Callable only by the owner.
    OwnerPrivate,
    /// Callable by the owner and by the actors in [`FunctionDefinition::shared_with`].
    Shared,
}

/// A registered function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: CompactString,
    #[serde(default)]
    pub params: Vec<ParameterSpec>,
    #[serde(default = "any_kind")]
    pub returns: ValueKind,
    pub owner: ActorId,
    pub scope: FunctionScope,
    #[serde(default)]
    pub origin: Origin,
    #[serde(default)]
    pub body: Option<Node>,
    /// Overrides [`Settings::max_call_depth`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<usize>,
    /// Overrides [`Settings::call_timeout_ms`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shared_with: Vec<ActorId>,
}
fn any_kind() -> ValueKind {
    ValueKind::Any
}

impl FunctionDefinition {
    pub fn new(name: &str, owner: ActorId, scope: FunctionScope, body: Option<Node>) -> Self {
        Self {
            name: name.into(),
            params: vec![],
            returns: ValueKind::Any,
            owner,
            scope,
            origin: Origin::default(),
            body,
            max_depth: None,
            max_time_ms: None,
            shared_with: vec![],
        }
    }
    pub fn with_param(mut self, param: ParameterSpec) -> Self {
        self.params.push(param);
        self
    }
    pub fn with_returns(mut self, kind: ValueKind) -> Self {
        self.returns = kind;
        self
    }
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }
    pub fn with_max_time_ms(mut self, ms: u64) -> Self {
        self.max_time_ms = Some(ms);
        self
    }
    pub fn share_with(mut self, actor: ActorId) -> Self {
        self.shared_with.push(actor);
        self
    }

    /// Builds a definition from a compiled function-header program.
    /// The header's `name`, `params` and `returns` parameters describe the signature; the rest of the line is the body.
    pub fn from_program(program: &Program, owner: ActorId, scope: FunctionScope) -> Result<Self, ValidationError> {
        let name = match &program.kind {
            ProgramKind::Function { name } => name.clone(),
            ProgramKind::Event { .. } => return Err(ValidationError::NotAFunction),
        };
        let mut def = Self::new(&name, owner, scope, program.root.next.as_deref().map(Node::deep_clone));
        def.origin = program.origin.clone();
        if let Some(Value::List(params)) = program.root.param("params") {
            for param in params.iter() {
                def.params.push(ParameterSpec::parse(&param.as_text())?);
            }
        }
        if let Some(returns) = program.root.param("returns").and_then(|x| ValueKind::parse(&x.as_text())) {
            def.returns = returns;
        }
        Ok(def)
    }

    /// Checks the signature rules every registered function must satisfy.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !is_identifier(&self.name) {
            return Err(ValidationError::InvalidName { name: self.name.clone() });
        }
        for (i, param) in self.params.iter().enumerate() {
            if !is_identifier(&param.name) {
                return Err(ValidationError::InvalidParameterName { name: param.name.clone() });
            }
            if self.params[..i].iter().any(|x| x.name == param.name) {
                return Err(ValidationError::DuplicateParameter { name: param.name.clone() });
            }
            match (param.required, &param.default) {
                (true, Some(_)) => return Err(ValidationError::RequiredWithDefault { name: param.name.clone() }),
                (false, None) => return Err(ValidationError::MissingDefault { name: param.name.clone() }),
                (false, Some(default)) if !param.kind.accepts(default.kind()) => {
                    return Err(ValidationError::DefaultKind { name: param.name.clone(), expected: param.kind, got: default.kind() });
                }
                _ => (),
            }
        }
        Ok(())
    }

    /// Binds call arguments to parameters, producing the callee's initial locals.
    /// Positional arguments fill parameters in declaration order; named arguments fill the rest.
    pub fn bind_args(&self, named: VecMap<CompactString, Value, false>, positional: Vec<Value>) -> Result<SymbolTable, ValidationError> {
        if positional.len() > self.params.len() {
            return Err(ValidationError::TooManyArguments { function: self.name.clone(), expected: self.params.len(), got: positional.len() });
        }
        if let Some(name) = named.keys().find(|name| !self.params.iter().any(|x| x.name == **name)) {
            return Err(ValidationError::UnexpectedArgument { function: self.name.clone(), name: name.clone() });
        }

        let mut locals = SymbolTable::default();
        let mut positional = positional.into_iter();
        for param in self.params.iter() {
            let value = match positional.next().or_else(|| named.get(param.name.as_str()).cloned()) {
                Some(value) => value.coerce(param.kind).map_err(|e| ValidationError::ArgumentKind { function: self.name.clone(), name: param.name.clone(), expected: param.kind, got: e.got })?,
                None => match &param.default {
                    Some(default) if !param.required => default.copy(),
                    _ => return Err(ValidationError::MissingArgument { function: self.name.clone(), name: param.name.clone() }),
                }
            };
            locals.define_or_redefine(&param.name, value);
        }
        Ok(locals)
    }

    fn tier_key(&self) -> TierKey {
        match &self.scope {
            FunctionScope::OwnerPrivate => TierKey { tier: Tier::Private, qualifier: self.owner.0.clone(), name: self.name.clone() },
            FunctionScope::Shared => TierKey { tier: Tier::Shared, qualifier: CompactString::default(), name: self.name.clone() },
            FunctionScope::World(world) => TierKey { tier: Tier::World, qualifier: world.clone(), name: self.name.clone() },
            FunctionScope::Global => TierKey { tier: Tier::Global, qualifier: CompactString::default(), name: self.name.clone() },
        }
    }
    /// Checks if the actor may call this (shared) function.
    pub fn is_shared_with(&self, actor: &ActorId) -> bool {
        self.owner == *actor || self.shared_with.contains(actor)
    }
}

/// How an accepted call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure,
    Timeout,
    Cancelled,
}

/// Running statistics of a function.
#[derive(Debug, Default)]
pub struct FunctionStats {
    calls: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    cancellations: AtomicU64,
    rejections: AtomicU64,
    total_latency_ms: AtomicU64,
}
impl FunctionStats {
    fn record_start(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
    }
    /// Records a call that was turned away before its body started.
    pub fn record_rejection(&self) {
        self.rejections.fetch_add(1, Ordering::Relaxed);
    }
    fn record_end(&self, outcome: CallOutcome, latency_ms: u64) {
        let counter = match outcome {
            CallOutcome::Success => &self.successes,
            CallOutcome::Failure => &self.failures,
            CallOutcome::Timeout => &self.timeouts,
            CallOutcome::Cancelled => &self.cancellations,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
    }
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            calls: self.calls.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            total_latency_ms: self.total_latency_ms.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`FunctionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Calls that entered the body.
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub cancellations: u64,
    /// Calls rejected before the body started (bad arguments, depth or concurrency limits).
    pub rejections: u64,
    pub total_latency_ms: u64,
}
impl StatsSnapshot {
    /// Number of calls that have ended.
    pub fn completed(&self) -> u64 {
        self.successes + self.failures + self.timeouts + self.cancellations
    }
    pub fn average_latency_ms(&self) -> f64 {
        match self.completed() {
            0 => 0.0,
            n => self.total_latency_ms as f64 / n as f64,
        }
    }
}

/// A registered function along with its linked body and statistics.
#[derive(Debug)]
pub struct FunctionEntry {
    pub def: FunctionDefinition,
    pub script: Arc<Script>,
    pub stats: FunctionStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Tier {
    Private,
    Shared,
    World,
    Global,
}
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct TierKey {
    tier: Tier,
    qualifier: CompactString,
    name: CompactString,
}

/// A serializable copy of every registered definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub functions: Vec<FunctionDefinition>,
}

/// The set of registered functions.
#[derive(Debug, Default)]
pub struct FunctionRegistry {
    functions: DashMap<TierKey, Arc<FunctionEntry>>,
}
impl FunctionRegistry {
    /// Validates and registers a function. Unless `replace` is set, the name must be free in its namespace.
    /// Only the owner of a registered function may replace it, whatever the scope.
    pub fn register(&self, def: FunctionDefinition, replace: bool) -> Result<Arc<FunctionEntry>, ValidationError> {
        def.validate()?;
        let key = def.tier_key();
        let script = Script::link_body(def.name.clone(), def.origin.clone(), def.body.as_ref());
        let entry = Arc::new(FunctionEntry { def, script, stats: Default::default() });
        match self.functions.entry(key) {
            Entry::Occupied(mut slot) => {
                let existing = &slot.get().def;
                if existing.owner != entry.def.owner {
                    let (name, owner) = (entry.def.name.clone(), existing.owner.clone());
                    return Err(match existing.scope {
                        FunctionScope::Shared => ValidationError::SharedNameTaken { name, owner },
                        _ => ValidationError::OwnedByOther { name, owner },
                    });
                }
                if !replace {
                    return Err(ValidationError::DuplicateFunction { name: entry.def.name.clone() });
                }
                slot.insert(entry.clone());
            }
            Entry::Vacant(slot) => { slot.insert(entry.clone()); }
        }
        tracing::debug!(function = %entry.def.name, owner = %entry.def.owner, "registered function");
        Ok(entry)
    }
    /// Removes a function, returning whether it existed.
    pub fn unregister(&self, name: &str, scope: &FunctionScope, owner: &ActorId) -> bool {
        let key = FunctionDefinition::new(name, owner.clone(), scope.clone(), None).tier_key();
        match self.functions.get(&key).map(|x| x.def.owner == *owner) {
            Some(true) => self.functions.remove(&key).is_some(),
            _ => false,
        }
    }
    /// Resolves a name for a caller running in `world`.
    pub fn lookup(&self, name: &str, caller: &ActorId, world: &str) -> Option<Arc<FunctionEntry>> {
        let key = |tier, qualifier: &str| TierKey { tier, qualifier: qualifier.into(), name: name.into() };
        if let Some(x) = self.functions.get(&key(Tier::Private, caller.as_str())) {
            return Some(x.clone());
        }
        if let Some(x) = self.functions.get(&key(Tier::Shared, "")) {
            if x.def.is_shared_with(caller) {
                return Some(x.clone());
            }
        }
        if let Some(x) = self.functions.get(&key(Tier::World, world)) {
            return Some(x.clone());
        }
        self.functions.get(&key(Tier::Global, "")).map(|x| x.clone())
    }
    /// Gets the statistics of the function `name` exactly as registered under `scope` and `owner`.
    pub fn stats(&self, name: &str, scope: &FunctionScope, owner: &ActorId) -> Option<StatsSnapshot> {
        let key = FunctionDefinition::new(name, owner.clone(), scope.clone(), None).tier_key();
        self.functions.get(&key).map(|x| x.stats.snapshot())
    }
    pub fn len(&self) -> usize {
        self.functions.len()
    }
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
    pub fn clear(&self) {
        self.functions.clear();
    }
    /// Copies every definition, in a stable order.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut entries = self.functions.iter().map(|x| (x.key().clone(), x.def.clone())).collect::<Vec<_>>();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        RegistrySnapshot { functions: entries.into_iter().map(|x| x.1).collect() }
    }
    /// Replaces the registry contents with a snapshot. Statistics start over.
    pub fn restore(&self, snapshot: RegistrySnapshot) -> Result<(), ValidationError> {
        self.clear();
        for def in snapshot.functions {
            self.register(def, false)?;
        }
        Ok(())
    }
}

/// Holds the resources of one accepted call until it ends.
#[derive(educe::Educe)]
#[educe(Debug)]
pub struct CallGuard {
    #[educe(Debug(ignore))]
    services: Arc<Services>,
    entry: Arc<FunctionEntry>,
    actor: ActorId,
    started_ms: u64,
    outcome: CallOutcome,
}
impl CallGuard {
    /// Takes a depth slot for `actor` and a unit of the global call budget, or explains why the call is rejected.
    /// Rejections are counted in the function's statistics.
    pub fn acquire(services: &Arc<Services>, entry: &Arc<FunctionEntry>, actor: &ActorId) -> Result<Self, ResourceLimitError> {
        let limit = entry.def.max_depth.unwrap_or(services.settings().max_call_depth);
        if let Err(e) = services.enter_call(actor, limit, &entry.def.name) {
            entry.stats.record_rejection();
            tracing::warn!(function = %entry.def.name, actor = %actor, "call rejected: {e}");
            return Err(e);
        }
        entry.stats.record_start();
        Ok(Self { services: services.clone(), entry: entry.clone(), actor: actor.clone(), started_ms: services.now_ms(), outcome: CallOutcome::Cancelled })
    }
    pub fn entry(&self) -> &Arc<FunctionEntry> {
        &self.entry
    }
    /// Sets the outcome recorded when the guard is dropped (default: cancelled).
    pub fn set_outcome(&mut self, outcome: CallOutcome) {
        self.outcome = outcome;
    }
    /// Wall-clock deadline of the call in milliseconds.
    pub fn deadline_ms(&self) -> u64 {
        self.started_ms.saturating_add(self.time_limit_ms())
    }
    pub fn time_limit_ms(&self) -> u64 {
        self.entry.def.max_time_ms.unwrap_or(self.services.settings().call_timeout_ms)
    }
}
impl Drop for CallGuard {
    fn drop(&mut self) {
        let latency = self.services.now_ms().saturating_sub(self.started_ms);
        self.entry.stats.record_end(self.outcome, latency);
        self.services.leave_call(&self.actor);
        tracing::debug!(function = %self.entry.def.name, actor = %self.actor, outcome = ?self.outcome, latency, "call ended");
    }
}
