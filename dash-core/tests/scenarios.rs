//! End-to-end dispatch scenarios
//!
//! Each test registers callbacks on a fresh `App` and drives them with the
//! request bodies the renderer would send.

use dash_core::callback::{dict, list};
use dash_core::error::InvalidCallbackReturnValue;
use dash_core::{
    callback_context, App, AppConfig, CallbackError, CallbackSpec, ComponentId, DispatchError, DispatchRequest,
    DispatchResponse, IdValue, Input, Output, State, MATCH,
};
use serde_json::{json, Value};

fn app() -> App {
    App::new(AppConfig::default()).unwrap()
}

/// Scenario 1: a single output echoes its input.
#[test]
fn single_output_echo() {
    let app = app();
    app.callback(
        CallbackSpec::new()
            .output(Output::new("out", "children"))
            .input(Input::new("in", "value")),
        |args| Ok(args.value(0)),
    )
    .unwrap();

    let reply = app
        .dispatch(
            DispatchRequest::new("out.children")
                .outputs(json!({"id": "out", "property": "children"}))
                .input("in", "value", json!("hello"))
                .changed("in.value"),
        )
        .unwrap();

    assert_eq!(reply.status, 200);
    let body: Value = serde_json::from_str(&reply.body_json().unwrap()).unwrap();
    assert_eq!(body, json!({"multi": false, "response": {"out": {"children": "hello"}}}));
}

/// Scenario 2: a dict of outputs is filled from a dict return value.
#[test]
fn dict_outputs_are_flattened() {
    let app = app();
    let registration = app
        .callback(
            CallbackSpec::new()
                .outputs(dict([("a", Output::new("x", "children")), ("b", Output::new("y", "children"))]))
                .input(Input::new("in", "value")),
            |_| Ok(json!({"a": 1, "b": 2})),
        )
        .unwrap();
    assert_eq!(registration.id, "..x.children...y.children..");

    let reply = app
        .dispatch(DispatchRequest::new(registration.id.clone()).input("in", "value", json!(0)))
        .unwrap();
    let update = reply.update().unwrap();
    assert!(update.multi);

    let pairs: Vec<(String, String, Value)> = update
        .response
        .iter()
        .flat_map(|(id, props)| props.iter().map(move |(prop, value)| (id.clone(), prop.clone(), value.clone())))
        .collect();
    assert_eq!(
        pairs,
        vec![
            ("x".to_string(), "children".to_string(), json!(1)),
            ("y".to_string(), "children".to_string(), json!(2)),
        ]
    );
}

/// Scenario 3: too few values for a list of outputs fails before any
/// response is produced.
#[test]
fn short_return_value_is_rejected() {
    let app = app();
    app.callback(
        CallbackSpec::new()
            .outputs(list([Output::new("a", "children"), Output::new("b", "children")]))
            .input(Input::new("in", "value")),
        |_| Ok(json!(["only one"])),
    )
    .unwrap();

    let err = app
        .dispatch(DispatchRequest::new("..a.children...b.children..").input("in", "value", json!(1)))
        .unwrap_err();
    match err {
        DispatchError::InvalidReturn(InvalidCallbackReturnValue::OutputCount { expected, received, .. }) => {
            assert_eq!((expected, received), (2, 1));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn nested_return_value_must_match_schema() {
    let app = app();
    app.callback(
        CallbackSpec::new()
            .outputs(list([
                Output::new("a", "children").into(),
                list([Output::new("b", "children"), Output::new("c", "children")]),
            ]))
            .input(Input::new("in", "value")),
        |_| Ok(json!([1, 2])),
    )
    .unwrap();

    let err = app
        .dispatch(DispatchRequest::new("..a.children...b.children...c.children..").input("in", "value", json!(1)))
        .unwrap_err();
    let DispatchError::InvalidReturn(InvalidCallbackReturnValue::Schema(schema)) = err else {
        panic!("expected a schema error");
    };
    assert!(schema.to_string().contains("Path: (1,)"));
}

#[test]
fn dict_inputs_arrive_as_keywords() {
    let app = app();
    app.callback(
        CallbackSpec::new()
            .output(Output::new("sum", "children"))
            .inputs(dict([("left", Input::new("l", "value")), ("right", Input::new("r", "value"))]))
            .states(dict([("scale", State::new("s", "value"))])),
        |args| {
            let ctx = callback_context().map_err(CallbackError::failed)?;
            assert!(ctx.using_args_grouping());
            let total: i64 = args.get_kw::<i64>("left")? + args.get_kw::<i64>("right")?;
            Ok(json!(total * args.get_kw::<i64>("scale")?))
        },
    )
    .unwrap();

    let reply = app
        .dispatch(
            DispatchRequest::new("sum.children")
                .input("l", "value", json!(2))
                .input("r", "value", json!(3))
                .state("s", "value", json!(10))
                .changed("l.value"),
        )
        .unwrap();
    assert_eq!(reply.update().unwrap().response["sum"]["children"], json!(50));
}

#[test]
fn match_pattern_targets_the_triggering_component() {
    let app = app();
    let pattern = |kind: &str| ComponentId::dict([("type", IdValue::from(kind)), ("index", IdValue::from(MATCH))]);
    let registration = app
        .callback(
            CallbackSpec::new()
                .output(Output::new(pattern("label"), "children"))
                .input(Input::new(pattern("button"), "n_clicks")),
            |args| {
                let ctx = callback_context().map_err(CallbackError::failed)?;
                let index = ctx
                    .triggered_id()
                    .and_then(|id| id.as_dict().and_then(|d| d.get("index").cloned()))
                    .map(|v| serde_json::to_value(v).unwrap_or(Value::Null));
                Ok(json!(format!("button {} clicked {} times", index.unwrap_or(Value::Null), args.value(0))))
            },
        )
        .unwrap();

    let button = ComponentId::dict([("type", IdValue::from("button")), ("index", IdValue::from(4_i64))]);
    let label = ComponentId::dict([("type", IdValue::from("label")), ("index", IdValue::from(4_i64))]);
    let reply = app
        .dispatch(
            DispatchRequest::new(registration.id.clone())
                .outputs(json!({"id": {"type": "label", "index": 4}, "property": "children"}))
                .input(button.clone(), "n_clicks", json!(3))
                .changed(format!("{}.n_clicks", button.stringify())),
        )
        .unwrap();
    assert_eq!(
        reply.update().unwrap().response[&label.stringify()]["children"],
        json!("button 4 clicked 3 times")
    );
}

#[test]
fn prevent_update_and_no_update_are_204() {
    let app = app();
    app.callback(
        CallbackSpec::new().output(Output::new("a", "children")).input(Input::new("in", "value")),
        |args| match args.get::<Option<String>>(0)? {
            None => Err(CallbackError::PreventUpdate),
            Some(_) => Ok(dash_core::no_update()),
        },
    )
    .unwrap();

    for value in [Value::Null, json!("x")] {
        let reply = app
            .dispatch(DispatchRequest::new("a.children").input("in", "value", value))
            .unwrap();
        assert_eq!(reply.status, 204);
        assert_eq!(reply.body, DispatchResponse::NoUpdate);
    }
}

#[test]
fn initial_call_without_trigger_sees_falsy_triggered() {
    let app = app();
    app.callback(
        CallbackSpec::new().output(Output::new("a", "children")).input(Input::new("in", "value")),
        |_| {
            let ctx = callback_context().map_err(CallbackError::failed)?;
            let triggered = ctx.triggered();
            Ok(json!({
                "truthy": triggered.as_bool(),
                "first": triggered[0].prop_id,
            }))
        },
    )
    .unwrap();

    let reply = app
        .dispatch(DispatchRequest::new("a.children").input("in", "value", json!(1)))
        .unwrap();
    assert_eq!(
        reply.update().unwrap().response["a"]["children"],
        json!({"truthy": false, "first": "."})
    );
}

#[test]
fn request_body_round_trips_through_json() {
    let app = app();
    app.callback(
        CallbackSpec::new()
            .output(Output::new("out", "children"))
            .input(Input::new("in", "value"))
            .state(State::new("st", "data")),
        |args| Ok(json!([args.value(0), args.value(1)])),
    )
    .unwrap();

    let body = r#"{
        "output": "out.children",
        "outputs": {"id": "out", "property": "children"},
        "inputs": [{"id": "in", "property": "value", "value": 7}],
        "state": [{"id": "st", "property": "data"}],
        "changedPropIds": ["in.value"]
    }"#;
    let request: DispatchRequest = serde_json::from_str(body).unwrap();
    let reply = app.dispatch(request).unwrap();
    assert_eq!(reply.update().unwrap().response["out"]["children"], json!([7, null]));
}
