//! Caller identity and topic set, replayed after every (re)connection.

use serde_json::Value;

use crate::stream::proto::Message;

/// Principal and ordered topic list supplied to `connect`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub principal: String,
    pub topics: Vec<String>,
}

impl Identity {
    pub fn new<I, S>(principal: impl Into<String>, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            principal: principal.into(),
            topics: topics.into_iter().map(Into::into).collect(),
        }
    }
}

/// Remembers the active identity for the lifetime of one logical session.
#[derive(Clone, Debug)]
pub(crate) struct SubscriptionRegistry {
    kind: String,
    identity: Option<Identity>,
}

impl SubscriptionRegistry {
    pub(crate) fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            identity: None,
        }
    }

    pub(crate) fn remember(&mut self, identity: Identity) {
        self.identity = Some(identity);
    }

    pub(crate) fn forget(&mut self) {
        self.identity = None;
    }

    pub(crate) fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// `["subscribe:<kind>", [topics...], "<principal>"]`, or `None` before
    /// `connect` / after `disconnect`.
    pub(crate) fn subscribe_message(&self) -> Option<Message> {
        let identity = self.identity.as_ref()?;
        let topics = identity
            .topics
            .iter()
            .cloned()
            .map(Value::String)
            .collect::<Vec<_>>();
        Some(Message::event(
            format!("subscribe:{}", self.kind),
            vec![
                Value::Array(topics),
                Value::String(identity.principal.clone()),
            ],
        ))
    }
}
