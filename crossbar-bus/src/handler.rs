// Copyright 2024-Present Crossbar contributors
// SPDX-License-Identifier: Apache-2.0

//! Handler traits and the relay indirection.
//!
//! A handler is matched by message name (empty matches everything) and an
//! optional parameter filter, and dispatched in ascending priority. A
//! relay is a handler that forwards into a receiver identified by an
//! integer id, holding it weakly: the receiver owns the relay, never the
//! other way around, so a dying receiver cannot be resurrected by
//! in-flight dispatches.

use std::sync::{Arc, Weak};

use regex::Regex;

use crate::message::Message;

/// Parameter filter attached to a handler: the named parameter must
/// exist and match the value.
pub struct MessageFilter {
    name: String,
    value: FilterValue,
}

pub enum FilterValue {
    Exact(String),
    Regex(Regex),
}

impl MessageFilter {
    pub fn exact(name: impl Into<String>, value: impl Into<String>) -> Self {
        MessageFilter {
            name: name.into(),
            value: FilterValue::Exact(value.into()),
        }
    }

    pub fn regex(name: impl Into<String>, value: Regex) -> Self {
        MessageFilter {
            name: name.into(),
            value: FilterValue::Regex(value),
        }
    }

    pub fn matches(&self, msg: &Message) -> bool {
        let Some(param) = msg.get_param(&self.name) else {
            return false;
        };
        match &self.value {
            FilterValue::Exact(v) => param == v,
            FilterValue::Regex(re) => re.is_match(param),
        }
    }
}

pub trait MessageHandler: Send + Sync {
    /// Message name this handler matches; empty matches every message.
    fn name(&self) -> &str;

    fn priority(&self) -> u32 {
        100
    }

    fn filter(&self) -> Option<&MessageFilter> {
        None
    }

    /// Name recorded in the message's `handlers` parameter, empty to
    /// stay untracked.
    fn track_name(&self) -> &str {
        ""
    }

    fn received(&self, msg: &mut Message) -> bool;
}

/// Target of a [`MessageRelay`].
pub trait MessageReceiver: Send + Sync {
    fn received(&self, msg: &mut Message, id: u32) -> bool;
}

/// A handler that trampolines into a weakly held receiver, letting one
/// object serve many message names under distinct ids.
pub struct MessageRelay {
    name: String,
    priority: u32,
    receiver: Weak<dyn MessageReceiver>,
    id: u32,
    filter: Option<MessageFilter>,
    track_name: String,
}

impl MessageRelay {
    pub fn new(
        name: impl Into<String>,
        receiver: Weak<dyn MessageReceiver>,
        id: u32,
        priority: u32,
        track_name: impl Into<String>,
    ) -> Self {
        MessageRelay {
            name: name.into(),
            priority,
            receiver,
            id,
            filter: None,
            track_name: track_name.into(),
        }
    }

    pub fn with_filter(mut self, filter: MessageFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn id(&self) -> u32 {
        self.id
    }
}

impl MessageHandler for MessageRelay {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    fn filter(&self) -> Option<&MessageFilter> {
        self.filter.as_ref()
    }

    fn track_name(&self) -> &str {
        &self.track_name
    }

    fn received(&self, msg: &mut Message) -> bool {
        match self.receiver.upgrade() {
            Some(receiver) => receiver.received(msg, self.id),
            None => false,
        }
    }
}

/// Invoked after every dispatch with the message and its outcome.
pub trait MessagePostHook: Send + Sync {
    fn dispatched(&self, msg: &Message, handled: bool);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_matching() {
        let mut m = Message::new("call.execute");
        m.append("callto", "external/nodata/run.sh");
        let f = MessageFilter::exact("callto", "external/nodata/run.sh");
        assert!(f.matches(&m));
        let f = MessageFilter::regex("callto", Regex::new("^external/").unwrap());
        assert!(f.matches(&m));
        let f = MessageFilter::exact("missing", "x");
        assert!(!f.matches(&m));
    }

    #[test]
    fn relay_drops_dead_receiver() {
        struct Recv;
        impl MessageReceiver for Recv {
            fn received(&self, _msg: &mut Message, id: u32) -> bool {
                id == 7
            }
        }
        let receiver: Arc<dyn MessageReceiver> = Arc::new(Recv);
        let relay = MessageRelay::new("test", Arc::downgrade(&receiver), 7, 50, "");
        let mut m = Message::new("test");
        assert!(relay.received(&mut m));
        drop(receiver);
        assert!(!relay.received(&mut m));
    }
}
