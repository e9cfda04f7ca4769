use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use keel_core::{Behavior, Effect, Kind, PersistentEntity};
use keel_events::{AggregateEventShards, AggregateEventTagger, Event};

/// Tags cart events are spread over.
pub const NUM_SHARDS: u32 = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CartCommand {
    /// Set the quantity of a product; `0` removes it.
    UpdateItem { product_id: String, quantity: i32 },
    Checkout,
    Get,
}

impl CartCommand {
    pub fn update_item(product_id: impl Into<String>, quantity: i32) -> Self {
        Self::UpdateItem {
            product_id: product_id.into(),
            quantity,
        }
    }
}

impl Kind for CartCommand {
    fn kind(&self) -> &'static str {
        match self {
            Self::UpdateItem { .. } => "UpdateItem",
            Self::Checkout => "Checkout",
            Self::Get => "Get",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CartEvent {
    ItemUpdated { product_id: String, quantity: u32 },
    CheckedOut,
}

impl Kind for CartEvent {
    fn kind(&self) -> &'static str {
        match self {
            Self::ItemUpdated { .. } => "ItemUpdated",
            Self::CheckedOut => "CheckedOut",
        }
    }
}

impl Event for CartEvent {
    fn aggregate_tagger() -> AggregateEventTagger {
        match AggregateEventShards::new("CartEvent", NUM_SHARDS) {
            Ok(shards) => shards.into(),
            Err(err) => unreachable!("static shard config is valid: {err}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CartState {
    pub items: BTreeMap<String, u32>,
    pub checked_out: bool,
}

impl CartState {
    fn update_item(&self, product_id: &str, quantity: u32) -> Self {
        let mut items = self.items.clone();
        if quantity == 0 {
            items.remove(product_id);
        } else {
            items.insert(product_id.to_string(), quantity);
        }
        Self {
            items,
            checked_out: self.checked_out,
        }
    }

    fn checkout(&self) -> Self {
        Self {
            items: self.items.clone(),
            checked_out: true,
        }
    }

    pub fn summary(&self) -> CartSummary {
        CartSummary {
            items: self.items.clone(),
            checked_out: self.checked_out,
        }
    }
}

/// Reply to every cart command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartSummary {
    pub items: BTreeMap<String, u32>,
    pub checked_out: bool,
}

pub struct ShoppingCart;

impl PersistentEntity for ShoppingCart {
    type Command = CartCommand;
    type Event = CartEvent;
    type State = CartState;
    type Reply = CartSummary;

    const ENTITY_TYPE: &'static str = "shopping-cart";

    fn initial_behavior(snapshot: Option<CartState>) -> Behavior<Self> {
        let state = snapshot.unwrap_or_default();
        if state.checked_out { checked_out(state) } else { open(state) }
    }
}

fn open(state: CartState) -> Behavior<ShoppingCart> {
    Behavior::<ShoppingCart>::builder(state)
        .set_command_handler("UpdateItem", |cmd, ctx| match cmd {
            CartCommand::UpdateItem { quantity, .. } if *quantity < 0 => {
                Effect::reject("Quantity must be greater than zero")
            }
            CartCommand::UpdateItem { product_id, quantity: 0 } if !ctx.state().items.contains_key(product_id) => {
                Effect::reject("Cannot delete item that is not already in cart")
            }
            CartCommand::UpdateItem { product_id, quantity } => Effect::persist(
                CartEvent::ItemUpdated {
                    product_id: product_id.clone(),
                    quantity: (*quantity).unsigned_abs(),
                },
                CartState::summary,
            ),
            other => Effect::unhandled(other),
        })
        .set_command_handler("Checkout", |_cmd, ctx| {
            if ctx.state().items.is_empty() {
                Effect::reject("Cannot checkout empty cart")
            } else {
                Effect::persist(CartEvent::CheckedOut, CartState::summary)
            }
        })
        .set_read_only_command_handler("Get", |_cmd, ctx| Ok(ctx.state().summary()))
        .set_event_handler("ItemUpdated", |evt, state| match evt {
            CartEvent::ItemUpdated { product_id, quantity } => state.update_item(product_id, *quantity),
            CartEvent::CheckedOut => state.clone(),
        })
        .set_event_handler_changing_behavior("CheckedOut", |_evt, b| checked_out(b.state().checkout()))
        .build()
}

fn checked_out(state: CartState) -> Behavior<ShoppingCart> {
    Behavior::<ShoppingCart>::builder(state)
        .set_command_handler("UpdateItem", |_cmd, _ctx| {
            Effect::reject("Can't update item on already checked out shopping cart")
        })
        .set_command_handler("Checkout", |_cmd, _ctx| {
            Effect::reject("Can't checkout on already checked out shopping cart")
        })
        .set_read_only_command_handler("Get", |_cmd, ctx| Ok(ctx.state().summary()))
        .build()
}
