//! The tick-driven scheduler that owns every run.
//!
//! An [`Engine`] starts runs for triggers and function calls, runs each one until it finishes or
//! suspends, and parks suspended runs until their due tick. The host drives time by calling
//! [`Engine::tick`] once per game tick; nothing in here ever sleeps or spawns threads.
//!
//! Runs are addressed by generational [`RunKey`]s. Stopping a run removes it from the slot map, so
//! a continuation that comes due afterwards finds nothing and is skipped: every parked run is either
//! resumed or cancelled, never both.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::mem;

use compact_str::CompactString;
use rand::SeedableRng;
use rand_chacha::ChaChaRng;
use unicase::UniCase;

use crate::ast::*;
use crate::catalogue::Catalogue;
use crate::compiler::{Layout, ProgramCache};
use crate::functions::*;
use crate::grid::*;
use crate::new_key;
use crate::process::*;
use crate::runtime::*;
use crate::script::Script;
use crate::services::Services;
use crate::slotmap::SlotMap;
use crate::vecmap::VecMap;

new_key! {
    pub struct RunKey;
}

struct Run {
    process: Process,
    actor: ActorId,
    origin: Origin,
    /// Nodes executed over the whole run.
    steps: u64,
    parked: bool,
}

/// The final word on a run.
#[derive(Debug)]
pub struct RunReport {
    pub key: RunKey,
    pub actor: ActorId,
    pub origin: Origin,
    /// One of the terminal states.
    pub state: RunState,
    /// The value of the `return` variable on success, or why the run did not complete.
    pub result: Result<Option<Value>, Error>,
    /// The top-level variables as they were when the run ended.
    pub locals: SymbolTable,
    pub steps: u64,
}

/// Result of starting a run.
#[derive(Debug)]
pub enum Execution {
    /// The run finished without suspending.
    Finished(RunReport),
    /// The run is parked; its report comes out of a later [`Engine::tick`].
    Suspended(RunKey),
}
impl Execution {
    pub fn report(&self) -> Option<&RunReport> {
        match self {
            Execution::Finished(x) => Some(x),
            Execution::Suspended(_) => None,
        }
    }
}

enum SliceEnd {
    Parked,
    Done(Result<Option<Value>, Error>),
}

pub struct Engine {
    services: Arc<Services>,
    catalogue: Catalogue,
    layout: Layout,
    actions: ActionTable,
    cache: ProgramCache,
    runs: SlotMap<RunKey, Run>,
    /// Parked runs by `(due tick, insertion order)`.
    sleeping: BTreeSet<(u64, u64, RunKey)>,
    /// Forked runs that have not had their first slice yet.
    ready: VecDeque<RunKey>,
    /// Reports of forked runs that ended outside of a tick, handed out by the next one.
    pending: Vec<RunReport>,
    tick: u64,
    seq: u64,
    rng: ChaChaRng,
}
impl Engine {
    pub fn new(services: Arc<Services>, catalogue: Catalogue, layout: Layout) -> Self {
        let seed = services.settings().rng_seed.unwrap_or_else(|| services.now_ms());
        Self {
            rng: ChaChaRng::seed_from_u64(seed),
            services,
            catalogue,
            layout,
            actions: ActionTable::standard(),
            cache: Default::default(),
            runs: Default::default(),
            sleeping: Default::default(),
            ready: Default::default(),
            pending: vec![],
            tick: 0,
            seq: 0,
        }
    }
    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }
    pub fn catalogue(&self) -> &Catalogue {
        &self.catalogue
    }
    pub fn layout(&self) -> &Layout {
        &self.layout
    }
    /// The built-in handler table, for hosts that add or override handlers.
    pub fn actions_mut(&mut self) -> &mut ActionTable {
        &mut self.actions
    }
    /// The current logical tick.
    pub fn current_tick(&self) -> u64 {
        self.tick
    }
    /// Number of runs that have not ended, parked or not.
    pub fn active_runs(&self) -> usize {
        self.runs.len()
    }
    /// Gets the state of a live run, or [`None`] if it has ended (or never existed).
    pub fn state(&self, key: RunKey) -> Option<RunState> {
        let run = self.runs.get(key)?;
        Some(if run.parked { RunState::Suspended } else { run.process.state() })
    }

    /// Replaces the symbol catalogue. Everything compiled against the old one is dropped.
    pub fn reload_catalogue(&mut self, catalogue: Catalogue) {
        self.catalogue.reload(catalogue);
        self.cache.clear();
        tracing::info!(version = self.catalogue.version(), "catalogue reloaded");
    }

    /// Starts running a compiled program for `actor` at `origin`.
    pub fn execute(&mut self, host: &mut dyn Host, program: &Program, actor: &ActorId, origin: &Origin) -> Execution {
        let context = ExecutionContext::new(actor.clone(), origin.clone());
        self.start(host, Process::new(Script::link(program), context), actor, origin)
    }
    /// Starts a run whose body is the function `name`, as resolved for `actor` in the world of `origin`.
    /// Bad arguments and resource limits are reported before anything runs.
    pub fn call_function(&mut self, host: &mut dyn Host, name: &str, actor: &ActorId, origin: &Origin, args: VecMap<CompactString, Value, false>) -> Result<Execution, Error> {
        let entry = self.services.registry().lookup(name, actor, &origin.world)
            .ok_or_else(|| ValidationError::UnknownFunction { name: name.into() })?;
        let locals = entry.def.bind_args(args, vec![]).map_err(|e| {
            entry.stats.record_rejection();
            e
        })?;
        let guard = CallGuard::acquire(&self.services, &entry, actor)?;
        let context = ExecutionContext::new(actor.clone(), origin.clone()).with_locals(locals);
        Ok(self.start(host, Process::for_call(guard, context), actor, origin))
    }
    /// Compiles (or reuses) the program starting at `entry` and runs it. Only event programs can be run this way.
    pub fn fire_line<G: Grid + ?Sized>(&mut self, host: &mut dyn Host, grid: &G, entry: GridPos, actor: &ActorId) -> Result<Execution, Error> {
        let program = self.cache.line(grid, &self.catalogue, &self.layout, entry)?;
        if !matches!(program.kind, ProgramKind::Event { .. }) {
            return Err(ValidationError::NotAnEvent.into());
        }
        Ok(self.execute(host, &program, actor, &program.origin))
    }
    /// Runs every program in the region that handles `event`, in scan order.
    /// Programs that fail to compile are skipped and do not affect the others.
    pub fn fire_event<G: Grid + ?Sized>(&mut self, host: &mut dyn Host, grid: &G, region: Region, event: &str, actor: &ActorId) -> Vec<Execution> {
        let report = self.cache.region(grid, &self.catalogue, &self.layout, region);
        let event = UniCase::new(event);
        let mut res = vec![];
        for program in report.programs.iter() {
            if let ProgramKind::Event { event: handles } = &program.kind {
                if UniCase::new(handles.as_str()) == event {
                    res.push(self.execute(host, program, actor, &program.origin));
                }
            }
        }
        tracing::debug!(world = grid.world(), event = %event, started = res.len(), "event fired");
        res
    }
    /// Registers every function header program in the region under `owner` and `scope`.
    pub fn register_region<G: Grid + ?Sized>(&mut self, grid: &G, region: Region, owner: &ActorId, scope: &FunctionScope, replace: bool) -> Vec<Result<Arc<FunctionEntry>, ValidationError>> {
        let report = self.cache.region(grid, &self.catalogue, &self.layout, region);
        report.programs.iter()
            .filter(|x| matches!(x.kind, ProgramKind::Function { .. }))
            .map(|x| self.register_compiled(x, owner, scope, replace))
            .collect()
    }
    /// Registers a compiled function header program.
    pub fn register_compiled(&self, program: &Program, owner: &ActorId, scope: &FunctionScope, replace: bool) -> Result<Arc<FunctionEntry>, ValidationError> {
        let def = FunctionDefinition::from_program(program, owner.clone(), scope.clone())?;
        self.services.registry().register(def, replace)
    }

    /// Advances the logical tick and resumes every run that is due, in due order.
    /// Returns the reports of runs that ended during this tick.
    pub fn tick(&mut self, host: &mut dyn Host) -> Vec<RunReport> {
        self.tick += 1;
        let mut reports = mem::take(&mut self.pending);
        self.expire_parked(&mut reports);
        while let Some(&(due, _, _)) = self.sleeping.first() {
            if due > self.tick {
                break;
            }
            let (_, _, key) = match self.sleeping.pop_first() {
                Some(x) => x,
                None => break,
            };
            let run = match self.runs.get_mut(key) {
                Some(x) => x,
                None => continue, // stopped while parked
            };
            run.parked = false;
            self.services.resume(&run.actor);
            if !host.is_connected(&run.actor) {
                let actor = run.actor.clone();
                reports.extend(self.cancel(key, CancelReason::Disconnected { actor }));
                continue;
            }
            tracing::debug!(run = ?key, actor = %run.actor, tick = self.tick, "resuming");
            reports.extend(self.run_slice(host, key));
        }
        self.drain_ready(host, &mut reports);
        reports
    }

    /// Stops a run. Its active calls are recorded as cancelled.
    pub fn stop(&mut self, key: RunKey) -> Option<RunReport> {
        self.cancel(key, CancelReason::Stopped)
    }
    /// Stops every run of an actor that went offline.
    pub fn disconnect(&mut self, actor: &ActorId) -> Vec<RunReport> {
        self.runs.keys_where(|x| x.actor == *actor).into_iter()
            .filter_map(|key| self.cancel(key, CancelReason::Disconnected { actor: actor.clone() }))
            .collect()
    }
    /// Stops every run.
    pub fn shutdown(&mut self) -> Vec<RunReport> {
        let res = self.runs.keys_where(|_| true).into_iter()
            .filter_map(|key| self.cancel(key, CancelReason::Shutdown))
            .collect();
        self.sleeping.clear();
        self.ready.clear();
        res
    }

    fn spawn(&mut self, process: Process, actor: ActorId, origin: Origin) -> RunKey {
        self.services.run_started();
        let key = self.runs.insert(Run { process, actor, origin, steps: 0, parked: false });
        tracing::debug!(run = ?key, "run started");
        key
    }
    fn start(&mut self, host: &mut dyn Host, process: Process, actor: &ActorId, origin: &Origin) -> Execution {
        let key = self.spawn(process, actor.clone(), origin.clone());
        let execution = match self.run_slice(host, key) {
            Some(report) => Execution::Finished(report),
            None => Execution::Suspended(key),
        };
        let mut forked = vec![];
        self.drain_ready(host, &mut forked);
        self.pending.extend(forked);
        execution
    }
    /// Fails parked runs whose active calls ran out of time, so their call slots free up without waiting for the due tick.
    fn expire_parked(&mut self, reports: &mut Vec<RunReport>) {
        for key in self.runs.keys_where(|x| x.parked) {
            let run = match self.runs.get_mut(key) {
                Some(x) => x,
                None => continue,
            };
            if let Err(e) = run.process.check_deadlines(&self.services) {
                run.parked = false;
                self.services.resume(&run.actor);
                reports.extend(self.finish(key, Err(e)));
            }
        }
    }
    fn drain_ready(&mut self, host: &mut dyn Host, reports: &mut Vec<RunReport>) {
        while let Some(key) = self.ready.pop_front() {
            reports.extend(self.run_slice(host, key));
        }
    }

    /// Runs a live run until it parks or ends, returning the report if it ended.
    fn run_slice(&mut self, host: &mut dyn Host, key: RunKey) -> Option<RunReport> {
        let limit = self.services.settings().max_steps_per_tick;
        let mut forks = vec![];
        let mut steps = 0u64;

        let run = self.runs.get_mut(key)?;
        let end = loop {
            if steps >= limit as u64 {
                run.process.fail();
                break SliceEnd::Done(Err(ResourceLimitError::Steps { limit }.into()));
            }
            let mut env = StepEnv { host: &mut *host, services: &self.services, actions: &self.actions, rng: &mut self.rng };
            let res = run.process.step(&mut env);
            steps += 1;
            match res {
                Ok(ProcessStep::Normal) => (),
                Ok(ProcessStep::Fork { process }) => forks.push(*process),
                Ok(ProcessStep::Idle) => break SliceEnd::Done(Ok(None)),
                Ok(ProcessStep::Terminate { result }) => break SliceEnd::Done(Ok(result)),
                Ok(ProcessStep::Suspend { ticks }) => match self.services.suspend(&run.actor) {
                    Ok(()) => {
                        let due = self.tick.saturating_add(ticks);
                        self.sleeping.insert((due, self.seq, key));
                        self.seq += 1;
                        run.parked = true;
                        tracing::debug!(run = ?key, actor = %run.actor, due, "suspended");
                        break SliceEnd::Parked;
                    }
                    Err(e) => {
                        run.process.fail();
                        break SliceEnd::Done(Err(e.into()));
                    }
                }
                Err(e) => break SliceEnd::Done(Err(e)),
            }
        };
        run.steps += steps;
        self.services.record_steps(&run.origin, steps);

        for process in forks {
            let context = match process.context() {
                Some(x) => (x.actor.clone(), x.origin.clone()),
                None => continue,
            };
            let fork = self.spawn(process, context.0, context.1);
            self.ready.push_back(fork);
        }
        match end {
            SliceEnd::Parked => None,
            SliceEnd::Done(result) => self.finish(key, result),
        }
    }

    fn cancel(&mut self, key: RunKey, reason: CancelReason) -> Option<RunReport> {
        let run = self.runs.get_mut(key)?;
        if run.parked {
            run.parked = false;
            self.services.resume(&run.actor);
        }
        run.process.cancel();
        self.finish(key, Err(reason.into()))
    }

    fn finish(&mut self, key: RunKey, result: Result<Option<Value>, Error>) -> Option<RunReport> {
        let mut run = self.runs.remove(key)?;
        self.services.run_ended();
        let state = match &result {
            Ok(_) => RunState::Completed,
            Err(Error::Cancelled(_)) => RunState::Cancelled,
            Err(_) => RunState::Failed,
        };
        let report = RunReport { key, state, result, locals: run.process.take_locals(), steps: run.steps, actor: run.actor, origin: run.origin };
        self.log_report(&report);
        Some(report)
    }
    fn log_report(&self, report: &RunReport) {
        match &report.result {
            Ok(_) => tracing::debug!(run = ?report.key, actor = %report.actor, origin = %report.origin, steps = report.steps, "run completed"),
            Err(e) => tracing::warn!(run = ?report.key, actor = %report.actor, origin = %report.origin, state = ?report.state, "run ended: {e}"),
        }
    }
}
impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
