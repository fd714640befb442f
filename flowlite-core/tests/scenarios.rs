//! End-to-end scenarios through the engine facade over a MemoryStore.

use chrono::{Duration as ChronoDuration, Utc};
use flowlite_core::error::EngineError;
use flowlite_core::types::{JobState, TimerStatus, Variables, WaitKey};
use flowlite_core::{Engine, InstanceState, MemoryStore, ProcessStore, TokenState};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

fn vars(value: serde_json::Value) -> Variables {
    value.as_object().cloned().unwrap_or_default()
}

fn new_engine() -> (Arc<Engine>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    (Arc::new(Engine::new(store.clone())), store)
}

fn noop_connector(result: serde_json::Value) -> Arc<dyn flowlite_core::executors::Connector> {
    Arc::new(
        move |_: &Variables| -> Result<Variables, EngineError> { Ok(vars(result.clone())) },
    )
}

/// Scenario 1 — Linear: Start → ServiceTask(connector "noop" → {x:1}) → End.
#[tokio::test]
async fn linear_process_completes_with_connector_variables() {
    let (engine, store) = new_engine();
    engine.connectors().register("noop", noop_connector(json!({"x": 1})));

    engine
        .register_process(
            "linear",
            vars(json!({
                "start": {"type": "startEvent", "outgoing": ["f1"]},
                "task": {"type": "serviceTask", "incoming": ["f1"], "outgoing": ["f2"],
                         "extension_elements": {"connector": "noop"}},
                "end": {"type": "endEvent", "incoming": ["f2"]},
                "f1": {"type": "sequenceFlow", "source": "start", "target": "task"},
                "f2": {"type": "sequenceFlow", "source": "task", "target": "end"}
            })),
        )
        .await
        .unwrap();

    let status = engine.start_instance("linear", vars(json!({}))).await.unwrap();
    assert_eq!(status.state, InstanceState::Completed);
    assert_eq!(status.variables["x"], json!(1));
    assert!(status.completed_at.is_some());

    let tokens = store
        .load_tokens_by_instance(status.instance_id)
        .await
        .unwrap();
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0].state, TokenState::Completed);
    assert_eq!(tokens[0].current_element_id, "end");
}

fn xor_elements() -> Variables {
    vars(json!({
        "start": {"type": "startEvent", "outgoing": ["f1"]},
        "gw": {"type": "exclusiveGateway", "incoming": ["f1"], "outgoing": ["to_pos", "to_other"]},
        "end_pos": {"type": "endEvent", "incoming": ["to_pos"]},
        "end_other": {"type": "endEvent", "incoming": ["to_other"]},
        "f1": {"type": "sequenceFlow", "source": "start", "target": "gw"},
        "to_pos": {"type": "sequenceFlow", "source": "gw", "target": "end_pos",
                   "condition_expression": "a > 0"},
        "to_other": {"type": "sequenceFlow", "source": "gw", "target": "end_other",
                     "is_default": true}
    }))
}

/// Scenario 2 — XOR: `a>0` versus default flow.
#[tokio::test]
async fn exclusive_gateway_routes_by_condition() {
    let cases = [
        (json!({"a": 5}), "end_pos"),
        (json!({"a": -1}), "end_other"),
        (json!({"a": 0}), "end_other"),
    ];
    for (input, expected_end) in cases {
        let (engine, store) = new_engine();
        engine.register_process("xor", xor_elements()).await.unwrap();
        let status = engine.start_instance("xor", vars(input.clone())).await.unwrap();
        assert_eq!(status.state, InstanceState::Completed, "input {input}");

        let tokens = store
            .load_tokens_by_instance(status.instance_id)
            .await
            .unwrap();
        assert_eq!(tokens[0].current_element_id, expected_end, "input {input}");
    }
}

/// Scenario 3 — Parallel split/join with last-writer-wins merge.
#[tokio::test]
async fn parallel_join_merges_overlays_last_writer_wins() {
    let (engine, store) = new_engine();
    engine.connectors().register("write_a", noop_connector(json!({"k": "A"})));
    engine.connectors().register("write_b", noop_connector(json!({"k": "B"})));

    engine
        .register_process(
            "par",
            vars(json!({
                "start": {"type": "startEvent", "outgoing": ["f1"]},
                "split": {"type": "parallelGateway", "incoming": ["f1"], "outgoing": ["fa", "fb"]},
                "task_a": {"type": "serviceTask", "incoming": ["fa"], "outgoing": ["fa2"],
                           "extension_elements": {"connector": "write_a"}},
                "task_b": {"type": "serviceTask", "incoming": ["fb"], "outgoing": ["fb2"],
                           "extension_elements": {"connector": "write_b"}},
                "join": {"type": "parallelGateway", "incoming": ["fa2", "fb2"], "outgoing": ["f_end"]},
                "end": {"type": "endEvent", "incoming": ["f_end"]},
                "f1": {"type": "sequenceFlow", "source": "start", "target": "split"},
                "fa": {"type": "sequenceFlow", "source": "split", "target": "task_a"},
                "fb": {"type": "sequenceFlow", "source": "split", "target": "task_b"},
                "fa2": {"type": "sequenceFlow", "source": "task_a", "target": "join"},
                "fb2": {"type": "sequenceFlow", "source": "task_b", "target": "join"},
                "f_end": {"type": "sequenceFlow", "source": "join", "target": "end"}
            })),
        )
        .await
        .unwrap();

    let status = engine.start_instance("par", vars(json!({}))).await.unwrap();
    assert_eq!(status.state, InstanceState::Completed);
    // task_a ran first (deterministic tie-break), task_b wrote later: B wins.
    assert_eq!(status.variables["k"], json!("B"));

    // Exactly K=2 siblings were consumed into one survivor.
    let tokens = store
        .load_tokens_by_instance(status.instance_id)
        .await
        .unwrap();
    assert_eq!(tokens.len(), 2);
    let completed: Vec<_> = tokens
        .iter()
        .filter(|t| t.state == TokenState::Completed)
        .collect();
    let cancelled: Vec<_> = tokens
        .iter()
        .filter(|t| t.state == TokenState::Cancelled)
        .collect();
    assert_eq!(completed.len(), 1);
    assert_eq!(cancelled.len(), 1);
    assert_eq!(completed[0].current_element_id, "end");
}

fn boundary_elements() -> Variables {
    vars(json!({
        "start": {"type": "startEvent", "outgoing": ["f1"]},
        "work": {"type": "serviceTask", "incoming": ["f1"], "outgoing": ["f2"],
                 "extension_elements": {"task_type": "work"}},
        "bnd": {"type": "boundaryEvent", "attached_to": "work", "interrupting": true,
                "outgoing": ["f_esc"],
                "extension_elements": {"timer_expression": "PT1S"}},
        "end_main": {"type": "endEvent", "incoming": ["f2"]},
        "end_timeout": {"type": "endEvent", "incoming": ["f_esc"]},
        "f1": {"type": "sequenceFlow", "source": "start", "target": "work"},
        "f2": {"type": "sequenceFlow", "source": "work", "target": "end_main"},
        "f_esc": {"type": "sequenceFlow", "source": "bnd", "target": "end_timeout"}
    }))
}

/// Scenario 4 — Interrupting boundary timer: the worker never completes the
/// job; after the timer the token sits at End_Timeout and the job is gone.
#[tokio::test]
async fn interrupting_boundary_timer_diverts_and_cancels_the_job() {
    let (engine, store) = new_engine();
    engine
        .register_process("bnd_proc", boundary_elements())
        .await
        .unwrap();

    let status = engine
        .start_instance("bnd_proc", vars(json!({})))
        .await
        .unwrap();
    assert_eq!(status.state, InstanceState::Active);

    let jobs = store.load_jobs_by_instance(status.instance_id).await.unwrap();
    assert_eq!(jobs.len(), 1);

    engine
        .tick(Utc::now() + ChronoDuration::seconds(2))
        .await
        .unwrap();

    let status = engine.get_instance(status.instance_id).await.unwrap();
    assert_eq!(status.state, InstanceState::Completed);

    let tokens = store
        .load_tokens_by_instance(status.instance_id)
        .await
        .unwrap();
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0].current_element_id, "end_timeout");

    let jobs = store.load_jobs_by_instance(status.instance_id).await.unwrap();
    assert_eq!(jobs[0].state, JobState::Cancelled);
}

/// The main path still wins when the worker is fast enough; the boundary
/// timer then fires into nothing and is dropped.
#[tokio::test]
async fn completed_job_beats_boundary_timer_and_stale_fire_is_noop() {
    let (engine, store) = new_engine();
    engine
        .register_process("bnd_proc", boundary_elements())
        .await
        .unwrap();

    let status = engine
        .start_instance("bnd_proc", vars(json!({})))
        .await
        .unwrap();
    let jobs = engine.activate_jobs("work", "w1", 1, None).await.unwrap();
    engine
        .complete_job(jobs[0].job_key, vars(json!({"done": true})))
        .await
        .unwrap();

    let done = engine.get_instance(status.instance_id).await.unwrap();
    assert_eq!(done.state, InstanceState::Completed);
    let tokens = store
        .load_tokens_by_instance(status.instance_id)
        .await
        .unwrap();
    assert_eq!(tokens[0].current_element_id, "end_main");

    // Boundary timer was cancelled when the token left the activity.
    let timers = store
        .load_timers_by_instance(status.instance_id)
        .await
        .unwrap();
    assert!(timers.iter().all(|t| t.status == TimerStatus::Cancelled));

    // Even a stale fire past the deadline changes nothing.
    engine
        .tick(Utc::now() + ChronoDuration::seconds(5))
        .await
        .unwrap();
    let after = engine.get_instance(status.instance_id).await.unwrap();
    assert_eq!(after.state, InstanceState::Completed);
    assert_eq!(after.variables, done.variables);
}

/// Scenario 5 — Message published before the subscription exists is
/// consumed on subscribe, within TTL, at most once.
#[tokio::test]
async fn buffered_message_is_consumed_by_later_subscription() {
    let (engine, _store) = new_engine();
    engine
        .register_process(
            "msg_proc",
            vars(json!({
                "start": {"type": "startEvent", "outgoing": ["f1"]},
                "wait_paid": {"type": "intermediateCatchEvent", "incoming": ["f1"], "outgoing": ["f2"],
                              "extension_elements": {"message_name": "m", "correlation_key": "=orderId"}},
                "end": {"type": "endEvent", "incoming": ["f2"]},
                "f1": {"type": "sequenceFlow", "source": "start", "target": "wait_paid"},
                "f2": {"type": "sequenceFlow", "source": "wait_paid", "target": "end"}
            })),
        )
        .await
        .unwrap();

    engine
        .publish_message("m", "o1", vars(json!({"paid": true})), Some(60))
        .await
        .unwrap();

    let status = engine
        .start_instance("msg_proc", vars(json!({"orderId": "o1"})))
        .await
        .unwrap();
    assert_eq!(status.state, InstanceState::Completed);
    assert_eq!(status.variables["orderId"], json!("o1"));
    assert_eq!(status.variables["paid"], json!(true));

    // The message was consumed exactly once: a second instance waits.
    let second = engine
        .start_instance("msg_proc", vars(json!({"orderId": "o1"})))
        .await
        .unwrap();
    assert_eq!(second.state, InstanceState::Active);
    assert_eq!(second.current_activity.as_deref(), Some("wait_paid"));
}

fn parent_child_elements() -> (Variables, Variables) {
    let parent = vars(json!({
        "start": {"type": "startEvent", "outgoing": ["f1"]},
        "call": {"type": "callActivity", "incoming": ["f1"], "outgoing": ["f2"],
                 "extension_elements": {"called_process_id": "child"}},
        "end": {"type": "endEvent", "incoming": ["f2"]},
        "f1": {"type": "sequenceFlow", "source": "start", "target": "call"},
        "f2": {"type": "sequenceFlow", "source": "call", "target": "end"}
    }));
    let child = vars(json!({
        "c_start": {"type": "startEvent", "outgoing": ["cf1"]},
        "c_task": {"type": "userTask", "incoming": ["cf1"], "outgoing": ["cf2"]},
        "c_end": {"type": "endEvent", "incoming": ["cf2"]},
        "cf1": {"type": "sequenceFlow", "source": "c_start", "target": "c_task"},
        "cf2": {"type": "sequenceFlow", "source": "c_task", "target": "c_end"}
    }));
    (parent, child)
}

/// Scenario 6 — Call activity: parent suspends on the child and resumes
/// with its variables when it completes.
#[tokio::test]
async fn call_activity_waits_for_child_and_merges_its_variables() {
    let (engine, store) = new_engine();
    let (parent, child) = parent_child_elements();
    engine.register_process("parent", parent).await.unwrap();
    engine.register_process("child", child).await.unwrap();

    let status = engine
        .start_instance("parent", vars(json!({"a": 1})))
        .await
        .unwrap();
    assert_eq!(status.state, InstanceState::Active);

    // The parent token is suspended on the child instance.
    let parent_tokens = store
        .load_tokens_by_instance(status.instance_id)
        .await
        .unwrap();
    let child_id = match &parent_tokens[0].waiting_for {
        Some(WaitKey::CallActivity(id)) => *id,
        other => panic!("expected call_activity wait, got {other:?}"),
    };
    let child_status = engine.get_instance(child_id).await.unwrap();
    assert_eq!(child_status.state, InstanceState::Active);
    assert_eq!(child_status.variables["a"], json!(1));

    // Complete the child's user task; child completes, parent follows.
    let jobs = engine.activate_jobs("user_task", "human", 1, None).await.unwrap();
    engine
        .complete_job(jobs[0].job_key, vars(json!({"approved": true})))
        .await
        .unwrap();

    let parent_done = engine.get_instance(status.instance_id).await.unwrap();
    assert_eq!(parent_done.state, InstanceState::Completed);
    assert_eq!(parent_done.variables["approved"], json!(true));
    assert_eq!(
        engine.get_instance(child_id).await.unwrap().state,
        InstanceState::Completed
    );
}

/// Cancelling the parent mid-flight cancels the running child, and
/// cancellation is idempotent.
#[tokio::test]
async fn cancelling_parent_cancels_child_and_is_idempotent() {
    let (engine, store) = new_engine();
    let (parent, child) = parent_child_elements();
    engine.register_process("parent", parent).await.unwrap();
    engine.register_process("child", child).await.unwrap();

    let status = engine
        .start_instance("parent", vars(json!({})))
        .await
        .unwrap();
    let parent_tokens = store
        .load_tokens_by_instance(status.instance_id)
        .await
        .unwrap();
    let Some(WaitKey::CallActivity(child_id)) = parent_tokens[0].waiting_for.clone() else {
        panic!("parent should wait on the child");
    };

    engine
        .cancel_instance(status.instance_id, "operator request")
        .await
        .unwrap();

    let parent_after = engine.get_instance(status.instance_id).await.unwrap();
    let child_after = engine.get_instance(child_id).await.unwrap();
    assert_eq!(parent_after.state, InstanceState::Cancelled);
    assert_eq!(child_after.state, InstanceState::Cancelled);
    assert!(parent_after.completed_at.is_some());

    // The child's job went with it.
    let child_jobs = store.load_jobs_by_instance(child_id).await.unwrap();
    assert!(child_jobs.iter().all(|j| j.state == JobState::Cancelled));

    // Cancel(I); Cancel(I) ≡ Cancel(I).
    engine
        .cancel_instance(status.instance_id, "again")
        .await
        .unwrap();
    let twice = engine.get_instance(status.instance_id).await.unwrap();
    assert_eq!(twice.state, InstanceState::Cancelled);
    assert_eq!(twice.completed_at, parent_after.completed_at);
}

/// Event-based gateway: a published message wins the race and the timer
/// arm is cancelled.
#[tokio::test]
async fn event_gateway_message_wins_and_cancels_timer_arm() {
    let (engine, store) = new_engine();
    engine
        .register_process(
            "race",
            vars(json!({
                "start": {"type": "startEvent", "outgoing": ["f1"]},
                "gw": {"type": "eventBasedGateway", "incoming": ["f1"], "outgoing": ["ft", "fm"]},
                "on_timeout": {"type": "intermediateCatchEvent", "incoming": ["ft"], "outgoing": ["f2"],
                               "extension_elements": {"timer_expression": "PT10S"}},
                "on_reply": {"type": "intermediateCatchEvent", "incoming": ["fm"], "outgoing": ["f3"],
                             "extension_elements": {"message_name": "reply", "correlation_key": "=orderId"}},
                "end_timeout": {"type": "endEvent", "incoming": ["f2"]},
                "end_reply": {"type": "endEvent", "incoming": ["f3"]},
                "f1": {"type": "sequenceFlow", "source": "start", "target": "gw"},
                "ft": {"type": "sequenceFlow", "source": "gw", "target": "on_timeout"},
                "fm": {"type": "sequenceFlow", "source": "gw", "target": "on_reply"},
                "f2": {"type": "sequenceFlow", "source": "on_timeout", "target": "end_timeout"},
                "f3": {"type": "sequenceFlow", "source": "on_reply", "target": "end_reply"}
            })),
        )
        .await
        .unwrap();

    let status = engine
        .start_instance("race", vars(json!({"orderId": "o1"})))
        .await
        .unwrap();
    assert_eq!(status.state, InstanceState::Active);

    engine
        .publish_message("reply", "o1", vars(json!({"answer": 42})), None)
        .await
        .unwrap();

    let done = engine.get_instance(status.instance_id).await.unwrap();
    assert_eq!(done.state, InstanceState::Completed);
    assert_eq!(done.variables["answer"], json!(42));

    let tokens = store
        .load_tokens_by_instance(status.instance_id)
        .await
        .unwrap();
    assert_eq!(tokens[0].current_element_id, "end_reply");

    // The timer arm lost the race and was cancelled.
    let timers = store
        .load_timers_by_instance(status.instance_id)
        .await
        .unwrap();
    assert_eq!(timers.len(), 1);
    assert_eq!(timers[0].status, TimerStatus::Cancelled);

    // The late deadline is a no-op.
    engine
        .tick(Utc::now() + ChronoDuration::seconds(15))
        .await
        .unwrap();
    assert_eq!(
        engine.get_instance(status.instance_id).await.unwrap().state,
        InstanceState::Completed
    );
}

/// Inclusive gateway: two of three branches taken, the join fires once no
/// further token can arrive.
#[tokio::test]
async fn inclusive_join_fires_when_no_token_can_still_arrive() {
    let (engine, store) = new_engine();
    engine.connectors().register("pass", noop_connector(json!({})));
    engine
        .register_process(
            "incl",
            vars(json!({
                "start": {"type": "startEvent", "outgoing": ["f1"]},
                "split": {"type": "inclusiveGateway", "incoming": ["f1"],
                          "outgoing": ["fa", "fb", "fc"]},
                "a": {"type": "serviceTask", "incoming": ["fa"], "outgoing": ["fa2"],
                      "extension_elements": {"connector": "pass"}},
                "b": {"type": "serviceTask", "incoming": ["fb"], "outgoing": ["fb2"],
                      "extension_elements": {"connector": "pass"}},
                "c": {"type": "serviceTask", "incoming": ["fc"], "outgoing": ["fc2"],
                      "extension_elements": {"connector": "pass"}},
                "join": {"type": "inclusiveGateway", "incoming": ["fa2", "fb2", "fc2"],
                         "outgoing": ["f_end"]},
                "end": {"type": "endEvent", "incoming": ["f_end"]},
                "f1": {"type": "sequenceFlow", "source": "start", "target": "split"},
                "fa": {"type": "sequenceFlow", "source": "split", "target": "a",
                       "condition_expression": "x > 1"},
                "fb": {"type": "sequenceFlow", "source": "split", "target": "b",
                       "condition_expression": "x > 5"},
                "fc": {"type": "sequenceFlow", "source": "split", "target": "c",
                       "condition_expression": "x > 100"},
                "fa2": {"type": "sequenceFlow", "source": "a", "target": "join"},
                "fb2": {"type": "sequenceFlow", "source": "b", "target": "join"},
                "fc2": {"type": "sequenceFlow", "source": "c", "target": "join"},
                "f_end": {"type": "sequenceFlow", "source": "join", "target": "end"}
            })),
        )
        .await
        .unwrap();

    // x=10 takes branches a and b but not c; the join must not wait for c.
    let status = engine
        .start_instance("incl", vars(json!({"x": 10})))
        .await
        .unwrap();
    assert_eq!(status.state, InstanceState::Completed);

    let tokens = store
        .load_tokens_by_instance(status.instance_id)
        .await
        .unwrap();
    assert_eq!(tokens.len(), 2);
    assert_eq!(
        tokens
            .iter()
            .filter(|t| t.state == TokenState::Completed)
            .count(),
        1
    );
}

/// Replay determinism: identical inputs produce the identical event-kind
/// sequence.
#[tokio::test]
async fn event_log_is_deterministic_for_identical_runs() {
    let mut logs = Vec::new();
    for _ in 0..2 {
        let (engine, _store) = new_engine();
        engine.connectors().register("write_a", noop_connector(json!({"k": "A"})));
        engine.connectors().register("write_b", noop_connector(json!({"k": "B"})));
        engine
            .register_process(
                "par",
                vars(json!({
                    "start": {"type": "startEvent", "outgoing": ["f1"]},
                    "split": {"type": "parallelGateway", "incoming": ["f1"], "outgoing": ["fa", "fb"]},
                    "task_a": {"type": "serviceTask", "incoming": ["fa"], "outgoing": ["fa2"],
                               "extension_elements": {"connector": "write_a"}},
                    "task_b": {"type": "serviceTask", "incoming": ["fb"], "outgoing": ["fb2"],
                               "extension_elements": {"connector": "write_b"}},
                    "join": {"type": "parallelGateway", "incoming": ["fa2", "fb2"], "outgoing": ["f_end"]},
                    "end": {"type": "endEvent", "incoming": ["f_end"]},
                    "f1": {"type": "sequenceFlow", "source": "start", "target": "split"},
                    "fa": {"type": "sequenceFlow", "source": "split", "target": "task_a"},
                    "fb": {"type": "sequenceFlow", "source": "split", "target": "task_b"},
                    "fa2": {"type": "sequenceFlow", "source": "task_a", "target": "join"},
                    "fb2": {"type": "sequenceFlow", "source": "task_b", "target": "join"},
                    "f_end": {"type": "sequenceFlow", "source": "join", "target": "end"}
                })),
            )
            .await
            .unwrap();
        let status = engine.start_instance("par", vars(json!({}))).await.unwrap();
        let events = engine.read_events(status.instance_id, 0).await.unwrap();
        let kinds: Vec<&'static str> = events.iter().map(|(_, e)| e.kind()).collect();
        logs.push(kinds);
    }
    assert_eq!(logs[0], logs[1]);
}

/// Embedded sub-process: runs through the lifted child definition.
#[tokio::test]
async fn embedded_subprocess_runs_to_completion() {
    let (engine, _store) = new_engine();
    engine.connectors().register("mark", noop_connector(json!({"seen": true})));
    engine
        .register_process(
            "outer",
            vars(json!({
                "start": {"type": "startEvent", "outgoing": ["f1"]},
                "sub": {"type": "subProcess", "incoming": ["f1"], "outgoing": ["f2"],
                        "elements": {
                            "s_start": {"type": "startEvent", "outgoing": ["sf1"]},
                            "s_task": {"type": "serviceTask", "incoming": ["sf1"], "outgoing": ["sf2"],
                                       "extension_elements": {"connector": "mark"}},
                            "s_end": {"type": "endEvent", "incoming": ["sf2"]},
                            "sf1": {"type": "sequenceFlow", "source": "s_start", "target": "s_task"},
                            "sf2": {"type": "sequenceFlow", "source": "s_task", "target": "s_end"}
                        }},
                "end": {"type": "endEvent", "incoming": ["f2"]},
                "f1": {"type": "sequenceFlow", "source": "start", "target": "sub"},
                "f2": {"type": "sequenceFlow", "source": "sub", "target": "end"}
            })),
        )
        .await
        .unwrap();

    let status = engine.start_instance("outer", vars(json!({}))).await.unwrap();
    assert_eq!(status.state, InstanceState::Completed);
    assert_eq!(status.variables["seen"], json!(true));
}

/// Unknown process keys surface PROCESS_NOT_FOUND; unknown instances
/// surface NOT_FOUND.
#[tokio::test]
async fn missing_process_and_instance_errors() {
    let (engine, _store) = new_engine();
    let err = engine
        .start_instance("ghost", vars(json!({})))
        .await
        .unwrap_err();
    let engine_err = err.downcast_ref::<EngineError>().unwrap();
    assert_eq!(engine_err.code(), "PROCESS_NOT_FOUND");

    let err = engine.get_instance(Uuid::now_v7()).await.unwrap_err();
    let engine_err = err.downcast_ref::<EngineError>().unwrap();
    assert_eq!(engine_err.code(), "INSTANCE_NOT_FOUND");
}

/// XOR with no truthy condition and no default raises a NO_DEFAULT_FLOW
/// incident and leaves the instance ACTIVE.
#[tokio::test]
async fn gateway_without_default_raises_incident() {
    let (engine, store) = new_engine();
    engine
        .register_process(
            "strict_xor",
            vars(json!({
                "start": {"type": "startEvent", "outgoing": ["f1"]},
                "gw": {"type": "exclusiveGateway", "incoming": ["f1"], "outgoing": ["to_pos"]},
                "end_pos": {"type": "endEvent", "incoming": ["to_pos"]},
                "f1": {"type": "sequenceFlow", "source": "start", "target": "gw"},
                "to_pos": {"type": "sequenceFlow", "source": "gw", "target": "end_pos",
                           "condition_expression": "a > 0"}
            })),
        )
        .await
        .unwrap();

    let status = engine
        .start_instance("strict_xor", vars(json!({"a": -5})))
        .await
        .unwrap();
    assert_eq!(status.state, InstanceState::Active);

    let incidents = engine.incidents(status.instance_id).await.unwrap();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].kind, "NO_DEFAULT_FLOW");

    let tokens = store
        .load_tokens_by_instance(status.instance_id)
        .await
        .unwrap();
    assert_eq!(
        tokens[0].waiting_for,
        Some(WaitKey::Incident(incidents[0].incident_id))
    );

    // Escalation fails the instance.
    engine
        .escalate_incident(incidents[0].incident_id)
        .await
        .unwrap();
    assert_eq!(
        engine.get_instance(status.instance_id).await.unwrap().state,
        InstanceState::Failed
    );
}
