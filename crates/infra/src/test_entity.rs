//! Small entity used by the runtime's unit tests.
//!
//! Elements are added in one of two modes. Append mode upper-cases and
//! appends; prepend mode lower-cases and inserts at the start of the segment
//! added since the switch into prepend mode.

use serde::{Deserialize, Serialize};

use keel_core::{Behavior, Effect, Kind, PersistentEntity};
use keel_events::{AggregateEventShards, AggregateEventTagger, Event};

pub const ENTITY_TYPE: &str = "test";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Mode {
    #[default]
    Append,
    Prepend,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestCommand {
    Add { element: String, times: u32 },
    ChangeMode(Mode),
    Get,
    Panic,
}

impl TestCommand {
    pub fn add(element: impl Into<String>) -> Self {
        Self::add_times(element, 1)
    }

    pub fn add_times(element: impl Into<String>, times: u32) -> Self {
        Self::Add {
            element: element.into(),
            times,
        }
    }
}

impl Kind for TestCommand {
    fn kind(&self) -> &'static str {
        match self {
            Self::Add { .. } => "Add",
            Self::ChangeMode(_) => "ChangeMode",
            Self::Get => "Get",
            Self::Panic => "Panic",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestEvent {
    Appended(String),
    Prepended(String),
    InAppendMode,
    InPrependMode,
}

impl Kind for TestEvent {
    fn kind(&self) -> &'static str {
        match self {
            Self::Appended(_) => "Appended",
            Self::Prepended(_) => "Prepended",
            Self::InAppendMode => "InAppendMode",
            Self::InPrependMode => "InPrependMode",
        }
    }
}

impl Event for TestEvent {
    fn aggregate_tagger() -> AggregateEventTagger {
        match AggregateEventShards::new("TestEvent", 4) {
            Ok(shards) => shards.into(),
            Err(err) => unreachable!("static shard config is valid: {err}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TestState {
    pub elements: Vec<String>,
    pub mode: Mode,
    /// Index where the current mode's segment begins.
    pub mode_start: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestReply {
    Added(String),
    Done,
    State(TestState),
}

pub struct TestEntity;

impl PersistentEntity for TestEntity {
    type Command = TestCommand;
    type Event = TestEvent;
    type State = TestState;
    type Reply = TestReply;

    const ENTITY_TYPE: &'static str = ENTITY_TYPE;

    fn initial_behavior(snapshot: Option<TestState>) -> Behavior<Self> {
        behavior(snapshot.unwrap_or_default())
    }
}

fn behavior(state: TestState) -> Behavior<TestEntity> {
    let mode = state.mode;
    Behavior::<TestEntity>::builder(state)
        .set_command_handler("Add", move |cmd, _ctx| match cmd {
            TestCommand::Add { element, .. } if element.is_empty() => Effect::reject("element must not be empty"),
            TestCommand::Add { element, times } => {
                let (event, shown) = match mode {
                    Mode::Append => {
                        let e = element.to_uppercase();
                        (TestEvent::Appended(e.clone()), e)
                    }
                    Mode::Prepend => {
                        let e = element.to_lowercase();
                        (TestEvent::Prepended(e.clone()), e)
                    }
                };
                let events = vec![event; (*times).max(1) as usize];
                Effect::persist_all(events, move |_state: &TestState| TestReply::Added(shown))
            }
            other => Effect::unhandled(other),
        })
        .set_command_handler("ChangeMode", move |cmd, _ctx| match cmd {
            TestCommand::ChangeMode(next) if *next == mode => Effect::reply(TestReply::Done),
            TestCommand::ChangeMode(Mode::Append) => Effect::persist(TestEvent::InAppendMode, |_: &TestState| TestReply::Done),
            TestCommand::ChangeMode(Mode::Prepend) => {
                Effect::persist(TestEvent::InPrependMode, |_: &TestState| TestReply::Done)
            }
            other => Effect::unhandled(other),
        })
        .set_read_only_command_handler("Get", |_cmd, ctx| Ok(TestReply::State(ctx.state().clone())))
        .set_command_handler("Panic", |_cmd, _ctx| panic!("test entity asked to panic"))
        .set_event_handler("Appended", |evt, state| {
            let mut next = state.clone();
            if let TestEvent::Appended(e) = evt {
                next.elements.push(e.clone());
            }
            next
        })
        .set_event_handler("Prepended", |evt, state| {
            let mut next = state.clone();
            if let TestEvent::Prepended(e) = evt {
                next.elements.insert(next.mode_start, e.clone());
            }
            next
        })
        .set_event_handler_changing_behavior("InAppendMode", |_evt, b| switch(b.state(), Mode::Append))
        .set_event_handler_changing_behavior("InPrependMode", |_evt, b| switch(b.state(), Mode::Prepend))
        .build()
}

fn switch(state: &TestState, mode: Mode) -> Behavior<TestEntity> {
    behavior(TestState {
        elements: state.elements.clone(),
        mode,
        mode_start: state.elements.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::EntityId;

    #[test]
    fn mode_switch_scenario_ends_with_upper_a_then_b() {
        let id = EntityId::new("1").unwrap();
        let commands = [
            TestCommand::ChangeMode(Mode::Append),
            TestCommand::add("a"),
            TestCommand::ChangeMode(Mode::Prepend),
            TestCommand::add("b"),
        ];
        let mut b = TestEntity::initial_behavior(None);
        for command in &commands {
            if let Effect::Persist { events, .. } = b.handle_command(&id, command) {
                b = b.replay(&events);
            }
        }
        assert_eq!(b.state().elements, vec!["A", "b"]);
    }

    #[test]
    fn append_then_prepend_keeps_segments() {
        let id = EntityId::new("1").unwrap();
        let events = [
            TestEvent::Appended("A".into()),
            TestEvent::InPrependMode,
            TestEvent::Prepended("b".into()),
            TestEvent::Prepended("c".into()),
        ];
        let b = TestEntity::initial_behavior(None).replay(&events);
        assert_eq!(b.state().elements, vec!["A", "c", "b"]);
        assert_eq!(b.state().mode, Mode::Prepend);
        assert!(matches!(
            b.handle_command(&id, &TestCommand::ChangeMode(Mode::Prepend)),
            Effect::Reply(TestReply::Done)
        ));
    }
}
