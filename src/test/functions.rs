use crate::functions::*;
use crate::vecmap::VecMap;

use super::*;

fn server() -> ActorId {
    actor("server")
}
fn define(name: &str, body: Vec<Node>) -> FunctionDefinition {
    FunctionDefinition::new(name, server(), FunctionScope::Global, Node::chain(body))
}
fn args(entries: &[(&str, Value)]) -> VecMap<CompactString, Value, false> {
    entries.iter().map(|(k, v)| (CompactString::from(*k), v.clone())).collect()
}
fn stats(engine: &Engine, name: &str) -> StatsSnapshot {
    engine.services().registry().stats(name, &FunctionScope::Global, &server()).unwrap()
}
fn start(engine: &mut Engine, host: &mut TestHost, who: &str, body: Vec<Node>) -> Execution {
    let program = program(body);
    engine.execute(host, &program, &actor(who), &program.origin)
}

#[test]
fn test_parameter_spec_parse() {
    assert_eq!(ParameterSpec::parse("target:actor").unwrap(), ParameterSpec::required("target", ValueKind::Actor));
    assert_eq!(ParameterSpec::parse(" count : number ? = 1 ").unwrap(), ParameterSpec::optional("count", ValueKind::Number, Value::from(1)));
    assert_eq!(ParameterSpec::parse("note=hi").unwrap(), ParameterSpec::optional("note", ValueKind::Any, Value::from("hi")));
    assert_eq!(ParameterSpec::parse("x").unwrap(), ParameterSpec::required("x", ValueKind::Any));

    let bare = ParameterSpec::parse("x?").unwrap();
    assert!(!bare.required && bare.default.is_none());

    assert!(matches!(ParameterSpec::parse(":number"), Err(ValidationError::BadParameterSpec { .. })));
    assert!(matches!(ParameterSpec::parse("n:wat"), Err(ValidationError::BadParameterSpec { .. })));
    assert!(matches!(ParameterSpec::parse("n:number=abc"), Err(ValidationError::DefaultKind { expected: ValueKind::Number, got: ValueKind::Text, .. })));
}

#[test]
fn test_validate() {
    assert!(define("give_item", vec![]).with_param(ParameterSpec::required("target", ValueKind::Actor)).validate().is_ok());
    assert!(matches!(define("1st", vec![]).validate(), Err(ValidationError::InvalidName { .. })));
    assert!(matches!(define("", vec![]).validate(), Err(ValidationError::InvalidName { .. })));
    assert!(matches!(
        define("f", vec![]).with_param(ParameterSpec::required("bad name", ValueKind::Any)).validate(),
        Err(ValidationError::InvalidParameterName { .. })
    ));
    assert!(matches!(
        define("f", vec![]).with_param(ParameterSpec::required("n", ValueKind::Any)).with_param(ParameterSpec::required("n", ValueKind::Number)).validate(),
        Err(ValidationError::DuplicateParameter { .. })
    ));
    assert!(matches!(
        define("f", vec![]).with_param(ParameterSpec::parse("x?").unwrap()).validate(),
        Err(ValidationError::MissingDefault { .. })
    ));
    let required_with_default = ParameterSpec { required: true, ..ParameterSpec::optional("n", ValueKind::Number, Value::from(1)) };
    assert!(matches!(define("f", vec![]).with_param(required_with_default).validate(), Err(ValidationError::RequiredWithDefault { .. })));
    assert!(matches!(
        define("f", vec![]).with_param(ParameterSpec::optional("n", ValueKind::Number, Value::from("many"))).validate(),
        Err(ValidationError::DefaultKind { .. })
    ));
}

#[test]
fn test_bind_args() {
    let def = define("give", vec![])
        .with_param(ParameterSpec::required("target", ValueKind::Actor))
        .with_param(ParameterSpec::optional("count", ValueKind::Number, Value::from(1)));

    let locals = def.bind_args(args(&[]), vec![Value::from("sam")]).unwrap();
    assert_eq!(locals.lookup("target"), Some(&Value::from(actor("sam"))));
    assert_eq!(locals.lookup("count"), Some(&Value::from(1)));

    let locals = def.bind_args(args(&[("count", Value::from(" 3 "))]), vec![Value::from("sam")]).unwrap();
    assert_eq!(locals.lookup("count"), Some(&Value::from(3)));

    let locals = def.bind_args(args(&[("count", Value::from(2)), ("target", Value::from("kai"))]), vec![]).unwrap();
    assert_eq!(locals.lookup("target"), Some(&Value::from(actor("kai"))));
    assert_eq!(locals.len(), 2);

    assert!(matches!(def.bind_args(args(&[]), vec![]), Err(ValidationError::MissingArgument { name, .. }) if name == "target"));
    assert!(matches!(
        def.bind_args(args(&[]), vec![Value::from("a"), Value::from(1), Value::from(2)]),
        Err(ValidationError::TooManyArguments { expected: 2, got: 3, .. })
    ));
    assert!(matches!(
        def.bind_args(args(&[("target", Value::from("sam")), ("colour", Value::from("red"))]), vec![]),
        Err(ValidationError::UnexpectedArgument { name, .. }) if name == "colour"
    ));
    assert!(matches!(
        def.bind_args(args(&[("count", Value::from("lots"))]), vec![Value::from("sam")]),
        Err(ValidationError::ArgumentKind { expected: ValueKind::Number, got: ValueKind::Text, .. })
    ));
}

#[test]
fn test_defaults_are_not_shared() {
    let def = define("collect", vec![]).with_param(ParameterSpec::optional("items", ValueKind::List, Value::from(vec![Value::from(1)])));
    let mut first = def.bind_args(args(&[]), vec![]).unwrap();
    if let Some(Value::List(items)) = first.lookup_mut("items") {
        std::sync::Arc::make_mut(items).push(Value::from(2));
    }
    let second = def.bind_args(args(&[]), vec![]).unwrap();
    assert_eq!(second.lookup("items").map(|x| x.as_text().into_owned()), Some("[1]".into()));
}

#[test]
fn test_lookup_tiers() {
    let (services, _) = services(Settings::default());
    let registry = services.registry();
    let (alex, bob, carol) = (actor("alex"), actor("bob"), actor("carol"));
    registry.register(define("greet", vec![]), false).unwrap();
    registry.register(FunctionDefinition::new("greet", server(), FunctionScope::World("overworld".into()), None), false).unwrap();
    registry.register(FunctionDefinition::new("greet", bob.clone(), FunctionScope::Shared, None).share_with(alex.clone()), false).unwrap();
    registry.register(FunctionDefinition::new("greet", alex.clone(), FunctionScope::OwnerPrivate, None), false).unwrap();
    assert_eq!(registry.len(), 4);

    let scope = |caller: &ActorId, world: &str| registry.lookup("greet", caller, world).map(|x| x.def.scope.clone());
    assert_eq!(scope(&alex, "overworld"), Some(FunctionScope::OwnerPrivate));
    assert_eq!(scope(&bob, "overworld"), Some(FunctionScope::Shared));
    assert_eq!(scope(&carol, "overworld"), Some(FunctionScope::World("overworld".into())));
    assert_eq!(scope(&carol, "nether"), Some(FunctionScope::Global));

    assert!(!registry.unregister("greet", &FunctionScope::OwnerPrivate, &carol));
    assert!(!registry.unregister("greet", &FunctionScope::Shared, &alex));
    assert!(registry.unregister("greet", &FunctionScope::OwnerPrivate, &alex));
    assert_eq!(scope(&alex, "overworld"), Some(FunctionScope::Shared));
    assert!(registry.lookup("wave", &alex, "overworld").is_none());
}

#[test]
fn test_registration_conflicts() {
    let (services, _) = services(Settings::default());
    let registry = services.registry();
    registry.register(define("f", vec![]), false).unwrap();
    assert!(matches!(registry.register(define("f", vec![]), false), Err(ValidationError::DuplicateFunction { .. })));
    registry.register(define("f", vec![action("new")]), true).unwrap();
    assert_eq!(registry.len(), 1);

    let shared = |owner: &str| FunctionDefinition::new("s", actor(owner), FunctionScope::Shared, None);
    registry.register(shared("bob"), false).unwrap();
    assert!(matches!(registry.register(shared("alex"), true), Err(ValidationError::SharedNameTaken { owner, .. }) if owner == actor("bob")));
    registry.register(shared("bob"), true).unwrap();

    let heal = |owner: &str, scope: FunctionScope| FunctionDefinition::new("heal", actor(owner), scope, Node::chain([action(owner)]));
    registry.register(heal("alex", FunctionScope::Global), false).unwrap();
    assert!(matches!(registry.register(heal("mallory", FunctionScope::Global), true), Err(ValidationError::OwnedByOther { owner, .. }) if owner == actor("alex")));
    registry.register(heal("alex", FunctionScope::World("nether".into())), false).unwrap();
    assert!(matches!(registry.register(heal("mallory", FunctionScope::World("nether".into())), true), Err(ValidationError::OwnedByOther { .. })));
    assert_eq!(registry.lookup("heal", &actor("sam"), "overworld").map(|x| x.def.owner.clone()), Some(actor("alex")));
    assert_eq!(registry.lookup("heal", &actor("sam"), "nether").map(|x| x.def.owner.clone()), Some(actor("alex")));
    registry.register(heal("alex", FunctionScope::Global), true).unwrap();
    assert!(registry.unregister("heal", &FunctionScope::Global, &actor("alex")));
    assert!(registry.unregister("heal", &FunctionScope::World("nether".into()), &actor("alex")));

    for owner in ["alex", "bob"] {
        registry.register(FunctionDefinition::new("mine", actor(owner), FunctionScope::OwnerPrivate, None), false).unwrap();
    }
    assert_eq!(registry.len(), 4);
    assert!(matches!(registry.register(define("no way", vec![]), false), Err(ValidationError::InvalidName { .. })));
}

#[test]
fn test_call_returns_value() {
    let (mut engine, _) = engine(Settings::default());
    let mut host = TestHost::default();
    let def = define("double", vec![set("return", "=n * 2")]).with_param(ParameterSpec::required("n", ValueKind::Number)).with_returns(ValueKind::Number);
    engine.services().registry().register(def, false).unwrap();

    let report = run(&mut engine, &mut host, vec![
        call("double").with_param("args", 21).with_param("result", "r"),
        call("double").with_param("n", "5").with_param("result", "r2"),
        call("double").with_param("args", "=r2 + 1"),
    ]);
    assert_eq!(report.state, RunState::Completed);
    assert_eq!(local(&report, "r"), Some(&Value::from(42)));
    assert_eq!(local(&report, "r2"), Some(&Value::from(10)));
    assert_eq!(local(&report, "return"), None);
    let stats = stats(&engine, "double");
    assert_eq!((stats.calls, stats.successes, stats.rejections), (3, 3, 0));
    assert_eq!(engine.services().active_calls(), 0);
}

#[test]
fn test_call_contexts_are_isolated() {
    let (mut engine, _) = engine(Settings::default());
    let mut host = TestHost::default();
    engine.services().registry().register(define("peek", vec![set("return", "=x"), set("x", 99), set("mine", 1)]), false).unwrap();

    let report = run(&mut engine, &mut host, vec![set("x", 1), call("peek").with_param("result", "seen")]);
    assert_eq!(report.state, RunState::Completed);
    assert_eq!(local(&report, "x"), Some(&Value::from(1)));
    assert_eq!(local(&report, "seen"), None);
    assert_eq!(local(&report, "mine"), None);
}

#[test]
fn test_return_kind() {
    let (mut engine, _) = engine(Settings::default());
    let mut host = TestHost::default();
    let registry = engine.services().registry();
    registry.register(define("twelve", vec![set("return", "12")]).with_returns(ValueKind::Number), false).unwrap();
    registry.register(define("word", vec![set("return", "abc")]).with_returns(ValueKind::Number), false).unwrap();
    registry.register(define("early", vec![control("return").with_param("value", true), action("unreachable")]), false).unwrap();

    let report = run(&mut engine, &mut host, vec![
        call("twelve").with_param("result", "a"),
        call("word").with_param("result", "b"),
        call("early").with_param("result", "c"),
        action("after"),
    ]);
    assert_eq!(local(&report, "a"), Some(&Value::from(12)));
    assert_eq!(local(&report, "b"), None);
    assert_eq!(local(&report, "c"), Some(&Value::from(true)));
    assert_eq!(host.effects(), ["after()"]);
}

#[test]
fn test_missing_argument_rejects_call() {
    let (mut engine, _) = engine(Settings::default());
    let mut host = TestHost::default();
    engine.services().registry().register(define("needs", vec![action("side")]).with_param(ParameterSpec::required("n", ValueKind::Number)), false).unwrap();

    let report = run(&mut engine, &mut host, vec![call("needs"), action("after")]);
    assert_eq!(report.state, RunState::Failed);
    assert!(matches!(&report.result, Err(Error::Validation(ValidationError::MissingArgument { name, .. })) if name == "n"));
    assert!(host.performed.is_empty());
    let stats = stats(&engine, "needs");
    assert_eq!((stats.calls, stats.rejections), (0, 1));
    assert_eq!(engine.services().active_calls(), 0);

    let report = run(&mut engine, &mut host, vec![call("nope"), action("after")]);
    assert!(matches!(&report.result, Err(Error::Validation(ValidationError::UnknownFunction { name })) if name == "nope"));
    assert!(host.performed.is_empty());
}

#[test]
fn test_shared_access() {
    let (mut engine, _) = engine(Settings::default());
    let mut host = TestHost::default();
    let def = FunctionDefinition::new("wave", actor("bob"), FunctionScope::Shared, Node::chain([action("wave")])).share_with(actor("alex"));
    engine.services().registry().register(def, false).unwrap();

    let report = run(&mut engine, &mut host, vec![call("wave")]);
    assert_eq!(report.state, RunState::Completed);
    assert_eq!(host.effects(), ["wave()"]);

    let execution = start(&mut engine, &mut host, "carol", vec![call("wave")]);
    assert!(matches!(execution.report().map(|x| &x.result), Some(Err(Error::Validation(ValidationError::UnknownFunction { .. })))));
    assert_eq!(host.effects(), ["wave()"]);
}

#[test]
fn test_depth_limit() {
    let (mut engine, _) = engine(Settings::default());
    let mut host = TestHost::default();
    engine.services().registry().register(define("down", vec![action("enter"), call("down")]).with_max_depth(3), false).unwrap();

    let report = run(&mut engine, &mut host, vec![call("down")]);
    assert_eq!(report.state, RunState::Failed);
    assert!(matches!(&report.result, Err(Error::ResourceLimit(ResourceLimitError::CallDepth { function, limit: 3 })) if function == "down"));
    assert_eq!(host.effects(), ["enter()", "enter()", "enter()"]);

    let stats = stats(&engine, "down");
    assert_eq!((stats.calls, stats.rejections, stats.failures, stats.successes), (3, 1, 3, 0));
    assert_eq!(engine.services().call_depth(&actor("alex")), 0);
    assert_eq!(engine.services().active_calls(), 0);
}

#[test]
fn test_default_depth_limit() {
    let (mut engine, _) = engine(Settings { max_call_depth: 2, ..Default::default() });
    let mut host = TestHost::default();
    engine.services().registry().register(define("again", vec![call("again")]), false).unwrap();
    let report = run(&mut engine, &mut host, vec![call("again")]);
    assert!(matches!(&report.result, Err(Error::ResourceLimit(ResourceLimitError::CallDepth { limit: 2, .. }))));
}

#[test]
fn test_concurrency_limit() {
    let (mut engine, _) = engine(Settings { max_active_calls: 2, ..Default::default() });
    let mut host = TestHost::default();
    engine.services().registry().register(define("hold", vec![control("wait"), action("held")]), false).unwrap();

    let first = start(&mut engine, &mut host, "alex", vec![call("hold")]);
    let second = start(&mut engine, &mut host, "sam", vec![call("hold")]);
    assert!(matches!((&first, &second), (Execution::Suspended(_), Execution::Suspended(_))));
    assert_eq!(engine.services().active_calls(), 2);

    let third = start(&mut engine, &mut host, "kai", vec![call("hold")]);
    let report = third.report().unwrap();
    assert_eq!(report.state, RunState::Failed);
    let error = report.result.as_ref().unwrap_err();
    assert!(matches!(error, Error::ResourceLimit(ResourceLimitError::Concurrency { limit: 2 })));
    assert!(error.is_retryable());

    let stats_now = stats(&engine, "hold");
    assert_eq!((stats_now.calls, stats_now.rejections, stats_now.successes), (2, 1, 0));

    let reports = engine.tick(&mut host);
    assert_eq!(reports.iter().filter(|x| x.state == RunState::Completed).count(), 2);
    assert_eq!(host.effects(), ["held()", "held()"]);
    assert_eq!(stats(&engine, "hold").successes, 2);
    assert_eq!(engine.services().active_calls(), 0);

    assert!(matches!(start(&mut engine, &mut host, "kai", vec![call("hold")]), Execution::Suspended(_)));
}

#[test]
fn test_timeout() {
    let (mut engine, clock) = engine(Settings::default());
    let mut host = TestHost::default();
    engine.services().registry().register(define("slow", vec![control("wait"), action("late")]).with_max_time_ms(100), false).unwrap();

    let key = match start(&mut engine, &mut host, "alex", vec![call("slow"), action("after")]) {
        Execution::Suspended(key) => key,
        Execution::Finished(report) => panic!("finished early: {report:?}"),
    };
    clock.advance(500);
    let report = run_until_done(&mut engine, &mut host, key);
    assert_eq!(report.state, RunState::Failed);
    assert!(matches!(&report.result, Err(Error::ResourceLimit(ResourceLimitError::Timeout { function, limit_ms: 100 })) if function == "slow"));
    assert!(host.performed.is_empty());

    let stats = stats(&engine, "slow");
    assert_eq!((stats.calls, stats.timeouts, stats.failures), (1, 1, 0));
    assert_eq!(stats.total_latency_ms, 500);
    assert_eq!(engine.services().active_calls(), 0);
}

#[test]
fn test_timeout_while_parked() {
    let (mut engine, clock) = engine(Settings { max_active_calls: 1, ..Default::default() });
    let mut host = TestHost::default();
    engine.services().registry().register(define("slow", vec![control("wait").with_param("ticks", 1000), action("late")]).with_max_time_ms(100), false).unwrap();
    engine.services().registry().register(define("quick", vec![action("done")]), false).unwrap();

    let key = match start(&mut engine, &mut host, "alex", vec![call("slow")]) {
        Execution::Suspended(key) => key,
        Execution::Finished(report) => panic!("finished early: {report:?}"),
    };
    assert_eq!(engine.services().active_calls(), 1);
    assert!(start(&mut engine, &mut host, "sam", vec![call("quick")]).report().is_some_and(|x| x.state == RunState::Failed));

    clock.advance(10_000);
    let reports = engine.tick(&mut host);
    let report = reports.iter().find(|x| x.key == key).unwrap();
    assert!(matches!(&report.result, Err(Error::ResourceLimit(ResourceLimitError::Timeout { function, limit_ms: 100 })) if function == "slow"));
    assert_eq!(engine.state(key), None);
    assert_eq!(engine.services().active_calls(), 0);
    assert_eq!(engine.services().suspensions(&actor("alex")), 0);
    assert_eq!(stats(&engine, "slow").timeouts, 1);

    assert!(start(&mut engine, &mut host, "sam", vec![call("quick")]).report().is_some_and(|x| x.state == RunState::Completed));
    assert_eq!(host.effects(), ["done()"]);
    for _ in 0..3 {
        assert!(engine.tick(&mut host).is_empty());
    }
}

#[test]
fn test_latency() {
    let (mut engine, clock) = engine(Settings::default());
    let mut host = TestHost::default();
    engine.services().registry().register(define("pause", vec![control("wait")]), false).unwrap();

    for ms in [40, 60] {
        let key = match start(&mut engine, &mut host, "alex", vec![call("pause")]) {
            Execution::Suspended(key) => key,
            Execution::Finished(report) => panic!("finished early: {report:?}"),
        };
        clock.advance(ms);
        assert_eq!(run_until_done(&mut engine, &mut host, key).state, RunState::Completed);
    }
    let stats = stats(&engine, "pause");
    assert_eq!(stats.completed(), 2);
    assert_eq!(stats.average_latency_ms(), 50.0);
}

#[test]
fn test_call_function() {
    let (mut engine, _) = engine(Settings::default());
    let mut host = TestHost::default();
    let def = define("double", vec![set("return", "=n * 2")]).with_param(ParameterSpec::required("n", ValueKind::Number));
    engine.services().registry().register(def, false).unwrap();
    let origin = Origin::new("overworld", GridPos::new(0, 0, 0));

    let execution = engine.call_function(&mut host, "double", &actor("alex"), &origin, args(&[("n", Value::from(4))])).unwrap();
    let report = execution.report().unwrap();
    assert_eq!(report.state, RunState::Completed);
    assert!(matches!(&report.result, Ok(Some(x)) if *x == Value::from(8)));

    let res = engine.call_function(&mut host, "double", &actor("alex"), &origin, args(&[]));
    assert!(matches!(res, Err(Error::Validation(ValidationError::MissingArgument { .. }))));
    let res = engine.call_function(&mut host, "triple", &actor("alex"), &origin, args(&[]));
    assert!(matches!(res, Err(Error::Validation(ValidationError::UnknownFunction { .. }))));

    let stats = stats(&engine, "double");
    assert_eq!((stats.calls, stats.successes, stats.rejections), (1, 1, 1));
    assert_eq!(engine.services().active_runs(), 0);
}

#[test]
fn test_from_program() {
    let (mut engine, _) = engine(Settings::default());
    let mut host = TestHost::default();
    let params = Value::from(vec![Value::from("a:number"), Value::from("b:number?=1")]);
    let mut root = Node::new("function", Category::Function).with_action("define")
        .with_param("name", "add").with_param("params", params).with_param("returns", "number");
    root.set_next(Node::chain([set("return", "=a + b")]));
    let program = Program::new(ProgramKind::Function { name: "add".into() }, root, Origin::new("overworld", GridPos::new(4, 64, 4)), 0);

    let entry = engine.register_compiled(&program, &actor("alex"), &FunctionScope::OwnerPrivate, false).unwrap();
    assert_eq!(entry.def.params.len(), 2);
    assert_eq!(entry.def.returns, ValueKind::Number);
    assert_eq!(entry.def.origin, program.origin);

    let report = run(&mut engine, &mut host, vec![call("add").with_param("args", Value::from(vec![Value::from(2)])).with_param("result", "sum")]);
    assert_eq!(local(&report, "sum"), Some(&Value::from(3)));

    let event = super::program(vec![]);
    assert!(matches!(FunctionDefinition::from_program(&event, actor("alex"), FunctionScope::Global), Err(ValidationError::NotAFunction)));
}

#[test]
fn test_registry_snapshot() {
    let (services_a, _) = services(Settings::default());
    services_a.registry().register(define("double", vec![set("return", "=n * 2")]).with_param(ParameterSpec::required("n", ValueKind::Number)), false).unwrap();
    services_a.registry().register(FunctionDefinition::new("mine", actor("alex"), FunctionScope::OwnerPrivate, None).with_max_time_ms(10), false).unwrap();

    let json = serde_json::to_string(&services_a.registry().snapshot()).unwrap();
    let snapshot: RegistrySnapshot = serde_json::from_str(&json).unwrap();
    assert_eq!(snapshot.functions.len(), 2);

    let (services_b, _) = services(Settings::default());
    services_b.registry().register(define("stale", vec![]), false).unwrap();
    services_b.registry().restore(snapshot).unwrap();
    assert_eq!(services_b.registry().len(), 2);
    assert!(services_b.registry().lookup("stale", &actor("alex"), "overworld").is_none());

    let double = services_b.registry().lookup("double", &actor("alex"), "overworld").unwrap();
    assert_eq!(double.def.params, [ParameterSpec::required("n", ValueKind::Number)]);
    assert!(double.def.body.as_ref().is_some_and(|x| x.param("name") == Some(&Value::from("return"))));
    assert_eq!(double.stats.snapshot(), StatsSnapshot::default());
    assert_eq!(services_b.registry().lookup("mine", &actor("alex"), "overworld").and_then(|x| x.def.max_time_ms), Some(10));
}

#[test]
fn test_long_body_snapshot() {
    let (services_a, _) = services(Settings::default());
    services_a.registry().register(define("count_up", (0..300).map(|i| set("x", i)).collect()), false).unwrap();
    let json = serde_json::to_string(&services_a.registry().snapshot()).unwrap();

    let (mut engine, _) = engine(Settings::default());
    let mut host = TestHost::default();
    engine.services().registry().restore(serde_json::from_str(&json).unwrap()).unwrap();
    let entry = engine.services().registry().lookup("count_up", &actor("alex"), "overworld").unwrap();
    assert_eq!(entry.def.body.as_ref().map(Node::count), Some(300));

    let report = run(&mut engine, &mut host, vec![call("count_up")]);
    assert_eq!(report.state, RunState::Completed);
}
