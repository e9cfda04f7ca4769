//! Entity behavior as an explicit value.
//!
//! A [`Behavior`] bundles the current state with the command handler table
//! and the event handler table that are active for that state. Switching
//! behavior (e.g. `open` → `checked out`) is done by an event handler that
//! returns a whole new `Behavior`; nothing is subclassed or mutated in place.

use std::collections::HashMap;
use std::sync::Arc;

use crate::entity::PersistentEntity;
use crate::error::DomainError;
use crate::id::EntityId;

/// Stable discriminant used to route commands and events to handlers.
pub trait Kind {
    fn kind(&self) -> &'static str;
}

/// What a command handler sees while deciding.
pub struct CommandContext<'a, E: PersistentEntity> {
    entity_id: &'a EntityId,
    state: &'a E::State,
}

impl<'a, E: PersistentEntity> CommandContext<'a, E> {
    pub fn new(entity_id: &'a EntityId, state: &'a E::State) -> Self {
        Self { entity_id, state }
    }

    pub fn entity_id(&self) -> &'a EntityId {
        self.entity_id
    }

    pub fn state(&self) -> &'a E::State {
        self.state
    }
}

type AfterPersist<E> =
    Box<dyn FnOnce(&<E as PersistentEntity>::State) -> <E as PersistentEntity>::Reply + Send>;

/// Outcome of a command handler.
pub enum Effect<E: PersistentEntity> {
    /// Reply without persisting anything.
    Reply(E::Reply),
    /// Reject the command (`InvalidCommand`); no persistence, no state change.
    Reject(String),
    /// Fail the command with a domain error; no persistence, no state change.
    Fail(DomainError),
    /// Persist all events atomically, then reply from the post-apply state.
    Persist {
        events: Vec<E::Event>,
        after: AfterPersist<E>,
    },
}

impl<E: PersistentEntity> Effect<E> {
    pub fn reply(reply: E::Reply) -> Self {
        Self::Reply(reply)
    }

    pub fn reject(msg: impl Into<String>) -> Self {
        Self::Reject(msg.into())
    }

    pub fn fail(err: DomainError) -> Self {
        Self::Fail(err)
    }

    /// Failure for a command that reached a handler registered for another kind.
    pub fn unhandled(command: &E::Command) -> Self {
        Self::Fail(DomainError::unhandled(E::ENTITY_TYPE, command.kind()))
    }

    pub fn persist<F>(event: E::Event, after: F) -> Self
    where
        F: FnOnce(&E::State) -> E::Reply + Send + 'static,
    {
        Self::persist_all(vec![event], after)
    }

    pub fn persist_all<F>(events: Vec<E::Event>, after: F) -> Self
    where
        F: FnOnce(&E::State) -> E::Reply + Send + 'static,
    {
        Self::Persist {
            events,
            after: Box::new(after),
        }
    }

    pub fn is_persist(&self) -> bool {
        matches!(self, Self::Persist { .. })
    }
}

impl<E: PersistentEntity> core::fmt::Debug for Effect<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Reply(r) => f.debug_tuple("Reply").field(r).finish(),
            Self::Reject(msg) => f.debug_tuple("Reject").field(msg).finish(),
            Self::Fail(err) => f.debug_tuple("Fail").field(err).finish(),
            Self::Persist { events, .. } => f.debug_struct("Persist").field("events", events).finish(),
        }
    }
}

type CommandHandlerFn<E> = Arc<
    dyn Fn(&<E as PersistentEntity>::Command, &CommandContext<'_, E>) -> Effect<E> + Send + Sync,
>;

enum EventHandler<E: PersistentEntity> {
    Evolve(Arc<dyn Fn(&E::Event, &E::State) -> E::State + Send + Sync>),
    Transition(Arc<dyn Fn(&E::Event, &Behavior<E>) -> Behavior<E> + Send + Sync>),
}

impl<E: PersistentEntity> Clone for EventHandler<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Evolve(f) => Self::Evolve(f.clone()),
            Self::Transition(f) => Self::Transition(f.clone()),
        }
    }
}

/// State plus the handler tables active for it.
pub struct Behavior<E: PersistentEntity> {
    state: E::State,
    command_handlers: Arc<HashMap<&'static str, CommandHandlerFn<E>>>,
    event_handlers: Arc<HashMap<&'static str, EventHandler<E>>>,
}

impl<E: PersistentEntity> Clone for Behavior<E> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            command_handlers: self.command_handlers.clone(),
            event_handlers: self.event_handlers.clone(),
        }
    }
}

impl<E: PersistentEntity> core::fmt::Debug for Behavior<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut commands: Vec<_> = self.command_handlers.keys().collect();
        commands.sort();
        let mut events: Vec<_> = self.event_handlers.keys().collect();
        events.sort();
        f.debug_struct("Behavior")
            .field("state", &self.state)
            .field("commands", &commands)
            .field("events", &events)
            .finish()
    }
}

impl<E: PersistentEntity> Behavior<E> {
    pub fn builder(state: E::State) -> BehaviorBuilder<E> {
        BehaviorBuilder {
            state,
            command_handlers: HashMap::new(),
            event_handlers: HashMap::new(),
        }
    }

    pub fn state(&self) -> &E::State {
        &self.state
    }

    pub fn into_state(self) -> E::State {
        self.state
    }

    /// Same handler tables, new state.
    pub fn with_state(&self, state: E::State) -> Self {
        Self {
            state,
            command_handlers: self.command_handlers.clone(),
            event_handlers: self.event_handlers.clone(),
        }
    }

    /// Builder seeded with this behavior's state and handler tables.
    pub fn to_builder(&self) -> BehaviorBuilder<E> {
        BehaviorBuilder {
            state: self.state.clone(),
            command_handlers: (*self.command_handlers).clone(),
            event_handlers: (*self.event_handlers).clone(),
        }
    }

    pub fn handles_command(&self, kind: &str) -> bool {
        self.command_handlers.contains_key(kind)
    }

    pub fn handles_event(&self, kind: &str) -> bool {
        self.event_handlers.contains_key(kind)
    }

    /// Decide what to do with a command. Never mutates the behavior.
    pub fn handle_command(&self, entity_id: &EntityId, command: &E::Command) -> Effect<E> {
        match self.command_handlers.get(command.kind()) {
            Some(handler) => handler(command, &CommandContext::new(entity_id, &self.state)),
            None => Effect::unhandled(command),
        }
    }

    /// Fold one event into the behavior.
    ///
    /// Events without a handler leave the behavior untouched.
    pub fn apply_event(self, event: &E::Event) -> Self {
        match self.event_handlers.get(event.kind()).cloned() {
            Some(EventHandler::Evolve(f)) => {
                let state = f(event, &self.state);
                Self { state, ..self }
            }
            Some(EventHandler::Transition(f)) => f(event, &self),
            None => self,
        }
    }

    /// Fold a sequence of events in order.
    pub fn replay<'a, I>(self, events: I) -> Self
    where
        I: IntoIterator<Item = &'a E::Event>,
        E::Event: 'a,
    {
        events.into_iter().fold(self, Behavior::apply_event)
    }
}

/// Assembles the handler tables of a [`Behavior`].
pub struct BehaviorBuilder<E: PersistentEntity> {
    state: E::State,
    command_handlers: HashMap<&'static str, CommandHandlerFn<E>>,
    event_handlers: HashMap<&'static str, EventHandler<E>>,
}

impl<E: PersistentEntity> BehaviorBuilder<E> {
    pub fn set_command_handler<F>(mut self, kind: &'static str, handler: F) -> Self
    where
        F: Fn(&E::Command, &CommandContext<'_, E>) -> Effect<E> + Send + Sync + 'static,
    {
        self.command_handlers.insert(kind, Arc::new(handler));
        self
    }

    /// Handler that may only reply (or fail); it can never persist.
    pub fn set_read_only_command_handler<F>(self, kind: &'static str, handler: F) -> Self
    where
        F: Fn(&E::Command, &CommandContext<'_, E>) -> Result<E::Reply, DomainError>
            + Send
            + Sync
            + 'static,
    {
        self.set_command_handler(kind, move |cmd, ctx| match handler(cmd, ctx) {
            Ok(reply) => Effect::Reply(reply),
            Err(err) => Effect::Fail(err),
        })
    }

    pub fn remove_command_handler(mut self, kind: &str) -> Self {
        self.command_handlers.remove(kind);
        self
    }

    pub fn set_event_handler<F>(mut self, kind: &'static str, handler: F) -> Self
    where
        F: Fn(&E::Event, &E::State) -> E::State + Send + Sync + 'static,
    {
        self.event_handlers
            .insert(kind, EventHandler::Evolve(Arc::new(handler)));
        self
    }

    /// Event handler that returns the next behavior as a whole.
    pub fn set_event_handler_changing_behavior<F>(mut self, kind: &'static str, handler: F) -> Self
    where
        F: Fn(&E::Event, &Behavior<E>) -> Behavior<E> + Send + Sync + 'static,
    {
        self.event_handlers
            .insert(kind, EventHandler::Transition(Arc::new(handler)));
        self
    }

    pub fn build(self) -> Behavior<E> {
        Behavior {
            state: self.state,
            command_handlers: Arc::new(self.command_handlers),
            event_handlers: Arc::new(self.event_handlers),
        }
    }
}
