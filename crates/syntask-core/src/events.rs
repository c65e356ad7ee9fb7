// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run events and event subscriptions.
//!
//! Events are named notifications about a resource, e.g.
//! `syntask.task-run.Completed` about resource `syntask.task-run.<uuid>`.
//! Consumers subscribe with an [`EventFilter`] and receive an ordered stream.
//! Delivery guarantees are those of the [`EventSubscriber`] implementation;
//! [`InMemoryEventBus`] drops events for subscribers that fall too far behind.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::persistence::RunRecord;
use crate::states::State;

/// Label holding a resource's id.
pub const RESOURCE_ID_LABEL: &str = "syntask.resource.id";

/// Label holding a resource's display name.
pub const RESOURCE_NAME_LABEL: &str = "syntask.resource.name";

/// Errors from event subscriptions.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EventError {
    /// The filter cannot be used for a subscription.
    #[error("Invalid event filter: {0}")]
    InvalidFilter(String),

    /// Opening the subscription failed.
    #[error("Failed to subscribe to events: {0}")]
    Subscribe(String),

    /// The event source is gone.
    #[error("Event source closed")]
    Closed,

    /// An event could not be interpreted.
    #[error("Malformed event '{event}': {reason}")]
    Malformed {
        /// Event name.
        event: String,
        /// What was wrong with it.
        reason: String,
    },
}

/// Labels identifying the subject of an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resource(BTreeMap<String, String>);

impl Resource {
    /// A resource with the given id.
    pub fn new(id: impl Into<String>) -> Self {
        Self::default().with_label(RESOURCE_ID_LABEL, id)
    }

    /// Set a label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// The resource id, if labelled.
    pub fn id(&self) -> Option<&str> {
        self.get(RESOURCE_ID_LABEL)
    }

    /// A label's value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

/// A named notification about a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event id.
    pub id: Uuid,
    /// When the event happened.
    pub occurred: DateTime<Utc>,
    /// Event name, e.g. `syntask.flow-run.Completed`.
    pub event: String,
    /// The subject.
    pub resource: Resource,
    /// Event-specific data.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Event {
    /// A new event about `resource`, occurring now.
    pub fn new(event: impl Into<String>, resource: Resource) -> Self {
        Self {
            id: Uuid::new_v4(),
            occurred: Utc::now(),
            event: event.into(),
            resource,
            payload: serde_json::Value::Null,
        }
    }

    /// Set the payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Event for a run having entered `run.state`, named after the state,
    /// e.g. `syntask.flow-run.Late`.
    pub fn run_state_changed(run: &RunRecord, previous: &State) -> Self {
        let prefix = run.kind.resource_prefix();
        let state = &run.state;
        let resource = Resource::new(format!("{prefix}{}", run.id))
            .with_label(RESOURCE_NAME_LABEL, run.name.clone())
            .with_label("syntask.state-type", state.state_type.as_str())
            .with_label("syntask.state-name", state.name.clone());

        Self {
            occurred: state.timestamp,
            ..Self::new(format!("{prefix}{}", state.name), resource)
        }
        .with_payload(serde_json::json!({
            "intended": {
                "from": previous.state_type,
                "to": state.state_type,
            },
            "initial_state": {
                "type": previous.state_type,
                "name": previous.name,
            },
            "validated_state": {
                "type": state.state_type,
                "name": state.name,
                "message": state.message,
            },
        }))
    }
}

/// Event-name patterns a subscription is interested in.
///
/// A pattern ending in `*` matches by prefix; any other pattern must match the
/// name exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    names: Vec<String>,
}

impl EventFilter {
    /// Filter matching any of `names`.
    pub fn names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// The configured patterns.
    pub fn patterns(&self) -> &[String] {
        &self.names
    }

    /// Whether `event` matches any pattern.
    pub fn matches(&self, event: &str) -> bool {
        self.names.iter().any(|pattern| match pattern.strip_suffix('*') {
            Some(prefix) => event.starts_with(prefix),
            None => event == pattern,
        })
    }
}

/// Ordered stream of matching events.
pub type EventStream = BoxStream<'static, Result<Event, EventError>>;

/// Source of event subscriptions.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    /// Open a subscription for events matching `filter`.
    async fn subscribe(&self, filter: EventFilter) -> Result<EventStream, EventError>;
}

/// Sink for events produced by this crate.
pub trait EventPublisher: Send + Sync {
    /// Publish an event. Never blocks; delivery is best effort.
    fn publish(&self, event: Event);
}

/// In-process event bus backed by a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct InMemoryEventBus {
    sender: broadcast::Sender<Event>,
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl InMemoryEventBus {
    /// A bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Send an event to every current subscriber. Returns how many received it.
    pub fn emit(&self, event: Event) -> usize {
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(broadcast::error::SendError(event)) => {
                debug!(event = %event.event, "No subscribers for event");
                0
            }
        }
    }

    /// Number of open subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl EventPublisher for InMemoryEventBus {
    fn publish(&self, event: Event) {
        self.emit(event);
    }
}

#[async_trait]
impl EventSubscriber for InMemoryEventBus {
    async fn subscribe(&self, filter: EventFilter) -> Result<EventStream, EventError> {
        if filter.patterns().is_empty() {
            return Err(EventError::InvalidFilter(
                "at least one event name is required".to_string(),
            ));
        }

        let receiver = self.sender.subscribe();
        let stream = futures::stream::unfold((receiver, filter), |(mut receiver, filter)| {
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(event) if filter.matches(&event.event) => {
                            return Some((Ok(event), (receiver, filter)));
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Event subscriber lagged, events were dropped");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(stream.boxed())
    }
}
