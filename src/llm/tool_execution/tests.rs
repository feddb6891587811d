use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use schemars::JsonSchema;
use serde::Deserialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::llm::events::{ChatEvent, EventReceiver, event_channel};
use crate::llm::stream::{ChatBackend, DeltaStream, StreamDelta, ToolCallDelta, ToolCallFunctionDelta};
use crate::llm::types::{ChatMessage, ChatRequest, Role};
use crate::session::{Conversation, HistoryStore, StalenessPolicy};
use crate::tools::{ToolRegistry, TypedTool};

enum Round {
    Deltas(Vec<Result<StreamDelta>>),
    OpenError(&'static str),
}

/// Replays canned rounds and records every request it receives.
struct ScriptedBackend {
    rounds: Mutex<VecDeque<Round>>,
    requests: Mutex<Vec<ChatRequest>>,
    watch: Option<PathBuf>,
    snapshots: Mutex<Vec<Option<String>>>,
}

impl ScriptedBackend {
    fn new(rounds: Vec<Round>) -> Self {
        Self {
            rounds: Mutex::new(rounds.into()),
            requests: Mutex::new(Vec::new()),
            watch: None,
            snapshots: Mutex::new(Vec::new()),
        }
    }

    /// Capture the contents of `path` each time a stream is opened.
    fn watching(mut self, path: PathBuf) -> Self {
        self.watch = Some(path);
        self
    }

    fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn open_stream(
        &self,
        request: ChatRequest,
        _cancel: CancellationToken,
    ) -> Result<DeltaStream> {
        self.requests.lock().unwrap().push(request);
        if let Some(path) = &self.watch {
            let snap = std::fs::read_to_string(path).ok();
            self.snapshots.lock().unwrap().push(snap);
        }
        let next = self.rounds.lock().unwrap().pop_front();
        match next {
            Some(Round::Deltas(items)) => Ok(Box::pin(futures::stream::iter(items))),
            Some(Round::OpenError(msg)) => Err(anyhow!(msg)),
            None => Err(anyhow!("no scripted round left")),
        }
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct WeatherArgs {
    city: String,
}

struct Weather;

#[async_trait]
impl TypedTool for Weather {
    type Args = WeatherArgs;

    fn name(&self) -> &str {
        "getWeather"
    }

    fn description(&self) -> &str {
        "Current weather for a city"
    }

    async fn call(&self, args: WeatherArgs) -> Result<String> {
        assert_eq!(args.city, "Paris");
        Ok("22C".into())
    }
}

fn text(s: &str) -> Result<StreamDelta> {
    Ok(StreamDelta::Text(s.into()))
}

fn tool_delta(id: Option<&str>, name: Option<&str>, args: &str) -> Result<StreamDelta> {
    indexed_tool_delta(0, id, name, args)
}

fn indexed_tool_delta(
    index: usize,
    id: Option<&str>,
    name: Option<&str>,
    args: &str,
) -> Result<StreamDelta> {
    Ok(StreamDelta::ToolCalls(vec![ToolCallDelta {
        index: Some(index),
        id: id.map(str::to_string),
        kind: id.map(|_| "function".to_string()),
        function: Some(ToolCallFunctionDelta {
            name: name.map(str::to_string),
            arguments: Some(args.into()),
        }),
    }]))
}

fn weather_call_round() -> Round {
    Round::Deltas(vec![
        tool_delta(Some("call_1"), Some("getWeather"), ""),
        tool_delta(None, None, "{\"city\":"),
        tool_delta(None, None, "\"Paris\"}"),
    ])
}

struct Harness {
    _dir: TempDir,
    backend: Arc<ScriptedBackend>,
    engine: ChatEngine,
}

fn harness(rounds: Vec<Round>, configure: impl FnOnce(&mut EngineOptions)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = HistoryStore::new(dir.path().join("history"), "chat");
    let backend = Arc::new(ScriptedBackend::new(rounds).watching(store.path()));
    let mut registry = ToolRegistry::new();
    registry.register_typed(Weather).unwrap();
    let mut options = EngineOptions::new("test-model");
    configure(&mut options);
    let engine = ChatEngine::new(backend.clone(), Arc::new(registry), store, options);
    Harness {
        _dir: dir,
        backend,
        engine,
    }
}

fn drain(mut rx: EventReceiver) -> Vec<ChatEvent> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}

fn assert_ends_once(events: &[ChatEvent]) {
    let ends = events
        .iter()
        .filter(|e| matches!(e, ChatEvent::TurnEnded))
        .count();
    assert_eq!(ends, 1, "events: {events:?}");
    assert_eq!(events.last(), Some(&ChatEvent::TurnEnded));
}

async fn run(h: &Harness, session: &mut Conversation, input: &str) -> (TurnOutcome, Vec<ChatEvent>) {
    let (tx, rx) = event_channel();
    let outcome = h
        .engine
        .run_turn(
            session,
            vec![ChatMessage::user(input)],
            &tx,
            CancellationToken::new(),
        )
        .await;
    drop(tx);
    (outcome, drain(rx))
}

#[tokio::test]
async fn plain_answer_streams_and_finishes() {
    let h = harness(vec![Round::Deltas(vec![text("Hel"), text("lo")])], |_| {});
    let mut session = Conversation::new("sys");

    let (outcome, events) = run(&h, &mut session, "hi").await;

    assert_eq!(outcome, TurnOutcome::Completed { rounds: 1 });
    assert_eq!(
        events,
        vec![
            ChatEvent::TextDelta("Hel".into()),
            ChatEvent::TextDelta("lo".into()),
            ChatEvent::TurnEnded,
        ]
    );
    let last = session.messages().last().unwrap();
    assert_eq!(last, &ChatMessage::assistant("Hello"));
    assert!(last.tool_calls.is_empty());
    assert_eq!(session.len(), 3);
    assert_eq!(h.engine.store().load().unwrap(), session.messages());
}

#[tokio::test]
async fn tool_round_feeds_result_into_second_request() {
    let h = harness(
        vec![
            weather_call_round(),
            Round::Deltas(vec![text("It is 22C in Paris")]),
        ],
        |_| {},
    );
    let mut session = Conversation::new("sys");

    let (outcome, events) = run(&h, &mut session, "weather in Paris?").await;

    assert_eq!(outcome, TurnOutcome::Completed { rounds: 2 });
    assert_ends_once(&events);
    assert_eq!(
        events[..2],
        [
            ChatEvent::ToolInvoked {
                name: "getWeather".into()
            },
            ChatEvent::ToolCompleted {
                name: "getWeather".into(),
                result: "22C".into()
            },
        ]
    );

    let requests = h.backend.requests();
    assert_eq!(requests.len(), 2);
    let first_tools = requests[0].tools.as_ref().unwrap();
    assert_eq!(first_tools[0].function.name, "getWeather");
    assert_eq!(requests[0].stream, Some(true));

    let second = &requests[1].messages;
    let roles: Vec<Role> = second.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant, Role::Tool]);
    assert_eq!(second[2].tool_calls[0].function.arguments, "{\"city\":\"Paris\"}");
    assert_eq!(second[3], ChatMessage::tool_result("call_1", "22C"));

    assert_eq!(session.len(), 5);
    assert_eq!(session.messages().last().unwrap().content, "It is 22C in Paris");
}

#[tokio::test]
async fn history_is_written_before_the_next_round() {
    let h = harness(
        vec![weather_call_round(), Round::Deltas(vec![text("done")])],
        |_| {},
    );
    let mut session = Conversation::new("sys");

    run(&h, &mut session, "go").await;

    let snaps = h.backend.snapshots.lock().unwrap().clone();
    assert_eq!(snaps.len(), 2);
    assert!(snaps[0].is_none());
    let between = snaps[1].as_deref().unwrap();
    assert!(between.contains("22C"));
    assert!(!between.contains("done"));
}

#[tokio::test]
async fn unknown_function_is_reported_to_the_model() {
    let h = harness(
        vec![
            Round::Deltas(vec![tool_delta(Some("call_x"), Some("unknownFn"), "{}")]),
            Round::Deltas(vec![text("sorry")]),
        ],
        |_| {},
    );
    let mut session = Conversation::new("sys");

    let (outcome, events) = run(&h, &mut session, "x").await;

    assert_eq!(outcome, TurnOutcome::Completed { rounds: 2 });
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, ChatEvent::ToolInvoked { .. }))
    );
    let tool_msg = &session.messages()[3];
    assert_eq!(tool_msg.role, Role::Tool);
    assert_eq!(tool_msg.tool_call_id.as_deref(), Some("call_x"));
    assert_eq!(tool_msg.content, "Function unknownFn not found");
}

#[tokio::test]
async fn mid_stream_failure_ends_turn_without_recursion() {
    let h = harness(
        vec![
            Round::Deltas(vec![text("par"), Err(anyhow!("connection reset"))]),
            Round::Deltas(vec![text("never")]),
        ],
        |_| {},
    );
    let mut session = Conversation::new("sys");

    let (outcome, events) = run(&h, &mut session, "hi").await;

    assert!(matches!(outcome, TurnOutcome::Failed { ref message } if message.contains("connection reset")));
    assert_ends_once(&events);
    assert_eq!(events[0], ChatEvent::TextDelta("par".into()));
    match &events[1] {
        ChatEvent::TextDelta(t) => assert!(t.starts_with("Error:"), "{t}"),
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(h.backend.requests().len(), 1);
    // The partial answer is not recorded.
    assert_eq!(session.messages().last().unwrap().role, Role::User);
    assert_eq!(h.engine.store().load().unwrap(), session.messages());
}

#[tokio::test]
async fn open_failure_is_reported() {
    let h = harness(vec![Round::OpenError("chat error: 401 Unauthorized")], |_| {});
    let mut session = Conversation::new("sys");

    let (outcome, events) = run(&h, &mut session, "hi").await;

    assert!(matches!(outcome, TurnOutcome::Failed { .. }));
    assert_ends_once(&events);
    assert_eq!(
        events[0],
        ChatEvent::TextDelta("Error: chat error: 401 Unauthorized".into())
    );
}

#[tokio::test]
async fn round_limit_stops_runaway_tool_loops() {
    let h = harness(
        vec![weather_call_round(), weather_call_round(), weather_call_round()],
        |o| o.max_tool_rounds = 2,
    );
    let mut session = Conversation::new("sys");

    let (outcome, events) = run(&h, &mut session, "loop").await;

    assert_eq!(
        outcome,
        TurnOutcome::Failed {
            message: "maximum tool rounds (2) exceeded".into()
        }
    );
    assert_ends_once(&events);
    assert_eq!(h.backend.requests().len(), 2);
    // Calls requested by the final round are not executed.
    let invoked = events
        .iter()
        .filter(|e| matches!(e, ChatEvent::ToolInvoked { .. }))
        .count();
    assert_eq!(invoked, 1);
    let tool_messages = session
        .messages()
        .iter()
        .filter(|m| m.role == Role::Tool)
        .count();
    assert_eq!(tool_messages, 1);
    assert_eq!(session.messages().last().unwrap().role, Role::Tool);
}

#[tokio::test]
async fn interleaved_calls_yield_one_result_each_in_call_order() {
    let h = harness(
        vec![
            Round::Deltas(vec![
                indexed_tool_delta(1, Some("call_b"), Some("getWeather"), "{\"city\":"),
                indexed_tool_delta(0, Some("call_a"), Some("getWeather"), "{\"city\":\"Paris\"}"),
                indexed_tool_delta(1, None, None, "\"Paris\"}"),
            ]),
            Round::Deltas(vec![text("Both say 22C")]),
        ],
        |_| {},
    );
    let mut session = Conversation::new("sys");

    let (outcome, events) = run(&h, &mut session, "twice").await;

    assert_eq!(outcome, TurnOutcome::Completed { rounds: 2 });
    assert_ends_once(&events);

    let msgs = session.messages();
    assert_eq!(msgs.len(), 6);
    let ids: Vec<&str> = msgs[2].tool_calls.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["call_a", "call_b"]);
    assert_eq!(msgs[3], ChatMessage::tool_result("call_a", "22C"));
    assert_eq!(msgs[4], ChatMessage::tool_result("call_b", "22C"));
    assert_eq!(msgs[5], ChatMessage::assistant("Both say 22C"));

    let second = &h.backend.requests()[1].messages;
    assert_eq!(second.len(), 5);
    assert_eq!(&second[2..], &msgs[2..5]);
}

#[tokio::test]
async fn stale_conversation_is_reset_before_the_turn() {
    let h = harness(vec![Round::Deltas(vec![text("fresh")])], |o| {
        o.staleness = StalenessPolicy::idle_secs(3600)
    });
    let mut session = Conversation::new("sys");
    session.push(ChatMessage::user("old question"));
    session.push(ChatMessage::assistant("old answer"));
    session.touch_at(Utc::now() - Duration::hours(2));

    run(&h, &mut session, "new question").await;

    let sent = &h.backend.requests()[0].messages;
    assert_eq!(
        sent,
        &vec![ChatMessage::system("sys"), ChatMessage::user("new question")]
    );
    assert_eq!(session.len(), 3);
}

#[tokio::test]
async fn recent_conversation_is_kept() {
    let h = harness(vec![Round::Deltas(vec![text("ok")])], |o| {
        o.staleness = StalenessPolicy::idle_secs(3600)
    });
    let mut session = Conversation::new("sys");
    session.push(ChatMessage::user("earlier"));
    session.push(ChatMessage::assistant("reply"));

    run(&h, &mut session, "again").await;

    assert_eq!(h.backend.requests()[0].messages.len(), 4);
}

#[tokio::test]
async fn tools_are_not_advertised_when_disabled() {
    let h = harness(vec![Round::Deltas(vec![text("ok")])], |o| {
        o.enable_tools = false
    });
    let mut session = Conversation::new("sys");

    run(&h, &mut session, "hi").await;

    assert!(h.backend.requests()[0].tools.is_none());
}

#[tokio::test]
async fn thinking_is_surfaced_but_not_recorded() {
    let h = harness(
        vec![Round::Deltas(vec![
            Ok(StreamDelta::Thinking("pondering".into())),
            text("answer"),
        ])],
        |_| {},
    );
    let mut session = Conversation::new("sys");

    let (_, events) = run(&h, &mut session, "q").await;

    assert_eq!(events[0], ChatEvent::Thinking("pondering".into()));
    assert_eq!(session.messages().last().unwrap().content, "answer");
}

#[tokio::test]
async fn cancelled_turn_fails_and_still_ends() {
    let h = harness(vec![Round::Deltas(vec![text("late")])], |_| {});
    let mut session = Conversation::new("sys");
    let (tx, rx) = event_channel();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = h
        .engine
        .run_turn(&mut session, vec![ChatMessage::user("hi")], &tx, cancel)
        .await;
    drop(tx);
    let events = drain(rx);

    assert_eq!(
        outcome,
        TurnOutcome::Failed {
            message: "request cancelled".into()
        }
    );
    assert_ends_once(&events);
    assert!(!events.contains(&ChatEvent::TextDelta("late".into())));
}
