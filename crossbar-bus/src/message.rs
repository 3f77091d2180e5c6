// Copyright 2024-Present Crossbar contributors
// SPDX-License-Identifier: Apache-2.0

//! Messages and their single-line wire form.
//!
//! A message is an ordered parameter list plus a name, a return value, a
//! microsecond timestamp and bookkeeping the bus and the external-module
//! bridge need: a broadcast flag, opaque user data, a trace id, the id of
//! the bridge that originated it (for reentrance checks), the wire id it
//! arrived under (mirrored by watchers) and a process-wide serial that
//! stands in for object identity.
//!
//! Both directions of message traffic share one line shape:
//!
//! ```text
//! %%<message:<id>:<time-us|handled>:<name>:<retvalue>[:<key>=<value>]*
//! ```
//!
//! The second field carries the timestamp on requests and new messages,
//! and the handled flag on replies; [`WireMessage`] keeps it raw and
//! offers both readings.

use std::any::Any;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crossbar_core::escape::{msg_escape, msg_unescape, str_bool};
use crossbar_core::namedlist::NamedList;

const PREFIX: &str = "%%<message:";

static SERIAL: AtomicU64 = AtomicU64::new(1);

/// Microseconds since the epoch.
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[derive(Clone)]
pub struct Message {
    params: NamedList,
    retvalue: String,
    time_us: u64,
    broadcast: bool,
    user_data: Option<Arc<dyn Any + Send + Sync>>,
    trace_id: String,
    origin: u64,
    wire_id: Option<String>,
    serial: u64,
    accepted: bool,
}

impl Message {
    pub fn new(name: impl Into<String>) -> Self {
        Message::new_at(name, now_us())
    }

    /// A message with an explicit timestamp (0 = unset).
    pub fn new_at(name: impl Into<String>, time_us: u64) -> Self {
        Message {
            params: NamedList::new(name),
            retvalue: String::new(),
            time_us,
            broadcast: false,
            user_data: None,
            trace_id: String::new(),
            origin: 0,
            wire_id: None,
            serial: SERIAL.fetch_add(1, Ordering::Relaxed),
            accepted: false,
        }
    }

    pub fn name(&self) -> &str {
        self.params.name()
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.params.set_name(name);
    }

    pub fn retvalue(&self) -> &str {
        &self.retvalue
    }

    pub fn retvalue_mut(&mut self) -> &mut String {
        &mut self.retvalue
    }

    pub fn set_retvalue(&mut self, v: impl Into<String>) {
        self.retvalue = v.into();
    }

    pub fn time_us(&self) -> u64 {
        self.time_us
    }

    pub fn set_time_us(&mut self, t: u64) {
        self.time_us = t;
    }

    pub fn broadcast(&self) -> bool {
        self.broadcast
    }

    pub fn set_broadcast(&mut self, b: bool) {
        self.broadcast = b;
    }

    pub fn user_data(&self) -> Option<&Arc<dyn Any + Send + Sync>> {
        self.user_data.as_ref()
    }

    pub fn set_user_data(&mut self, data: Option<Arc<dyn Any + Send + Sync>>) {
        self.user_data = data;
    }

    /// Downcast the user data to a concrete type.
    pub fn user_object<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.user_data.clone().and_then(|d| d.downcast::<T>().ok())
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn set_trace_id(&mut self, id: impl Into<String>) {
        self.trace_id = id.into();
    }

    /// Id of the bridge this message entered through; 0 for none.
    pub fn origin(&self) -> u64 {
        self.origin
    }

    pub fn set_origin(&mut self, origin: u64) {
        self.origin = origin;
    }

    /// The id the peer assigned when it originated this message.
    pub fn wire_id(&self) -> Option<&str> {
        self.wire_id.as_deref()
    }

    pub fn set_wire_id(&mut self, id: Option<String>) {
        self.wire_id = id;
    }

    /// Process-wide identity, stable across clones of the same message.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Outcome of the last dispatch.
    pub fn accepted(&self) -> bool {
        self.accepted
    }

    pub(crate) fn set_accepted(&mut self, accepted: bool) {
        self.accepted = accepted;
    }

    /// Serialise for delivery to a peer under the request id `id`.
    pub fn encode(&self, id: &str) -> String {
        self.encode_with_flag(id, &self.time_us.to_string())
    }

    /// Serialise a dispatch result (reply or watcher mirror).
    pub fn encode_result(&self, id: &str, handled: bool) -> String {
        self.encode_with_flag(id, if handled { "true" } else { "false" })
    }

    fn encode_with_flag(&self, id: &str, flag: &str) -> String {
        let mut out = String::with_capacity(64);
        out.push_str(PREFIX);
        out.push_str(&msg_escape(id, None));
        out.push(':');
        out.push_str(flag);
        out.push(':');
        out.push_str(&msg_escape(self.name(), None));
        out.push(':');
        out.push_str(&msg_escape(&self.retvalue, None));
        for p in self.params.iter() {
            out.push(':');
            out.push_str(&msg_escape(&p.name, Some('=')));
            out.push('=');
            out.push_str(&msg_escape(&p.value, None));
        }
        out
    }
}

impl Deref for Message {
    type Target = NamedList;

    fn deref(&self) -> &NamedList {
        &self.params
    }
}

impl DerefMut for Message {
    fn deref_mut(&mut self) -> &mut NamedList {
        &mut self.params
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("name", &self.name())
            .field("time_us", &self.time_us)
            .field("params", &self.params.len())
            .field("origin", &self.origin)
            .finish()
    }
}

/// A parsed `%%<message:` line, fields unescaped but otherwise raw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub id: String,
    pub flag: String,
    pub name: String,
    pub retvalue: String,
    pub params: Vec<(String, String)>,
}

impl WireMessage {
    /// Parse a wire line. The error is the byte offset of the first
    /// malformed character (0 when the prefix itself is wrong).
    pub fn parse(line: &str) -> Result<WireMessage, usize> {
        let body = line.strip_prefix(PREFIX).ok_or(0usize)?;
        let base = PREFIX.len();

        let mut fields: Vec<(usize, &str)> = Vec::new();
        let mut start = 0usize;
        for (i, b) in body.bytes().enumerate() {
            if b == b':' {
                fields.push((base + start, &body[start..i]));
                start = i + 1;
            }
        }
        fields.push((base + start, &body[start..]));

        if fields.len() < 3 {
            return Err(line.len());
        }
        let unesc = |idx: usize, extra: Option<char>| -> Result<String, usize> {
            let (offs, raw) = fields[idx];
            msg_unescape(raw, extra).map_err(|e| offs + e)
        };

        let id = unesc(0, None)?;
        let flag = unesc(1, None)?;
        let name = unesc(2, None)?;
        if name.is_empty() {
            return Err(fields[2].0);
        }
        let retvalue = if fields.len() > 3 { unesc(3, None)? } else { String::new() };

        let mut params = Vec::new();
        for idx in 4..fields.len() {
            let (offs, raw) = fields[idx];
            let (pname, pvalue) = match raw.find('=') {
                Some(eq) => {
                    let pname = msg_unescape(&raw[..eq], Some('=')).map_err(|e| offs + e)?;
                    let pvalue =
                        msg_unescape(&raw[eq + 1..], None).map_err(|e| offs + eq + 1 + e)?;
                    (pname, pvalue)
                }
                None => (msg_unescape(raw, Some('=')).map_err(|e| offs + e)?, String::new()),
            };
            if !pname.is_empty() {
                params.push((pname, pvalue));
            }
        }

        Ok(WireMessage {
            id,
            flag,
            name,
            retvalue,
            params,
        })
    }

    /// The second field read as a reply's handled flag.
    pub fn handled(&self) -> bool {
        str_bool(&self.flag).unwrap_or(false)
    }

    /// The second field read as a timestamp.
    pub fn time_us(&self) -> u64 {
        self.flag.trim().parse().unwrap_or(0)
    }

    /// Build a fresh message (peer-originated traffic).
    pub fn into_message(self) -> Message {
        let mut msg = Message::new_at(self.name, self.flag.trim().parse().unwrap_or(0));
        msg.set_retvalue(self.retvalue);
        for (n, v) in self.params {
            msg.append(n, v);
        }
        msg
    }

    /// Merge a reply into the original message: parameters are set in
    /// order, the return value is taken over and a non-empty name
    /// replaces the original.
    pub fn apply_to(&self, msg: &mut Message) {
        if !self.name.is_empty() && self.name != msg.name() {
            msg.set_name(self.name.clone());
        }
        msg.set_retvalue(self.retvalue.clone());
        for (n, v) in &self.params {
            msg.set_param(n, v.clone(), false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn encode_decode_round_trip() {
        let mut m = Message::new_at("call.route", 1700000000123456);
        m.set_retvalue("sip/alice");
        m.append("caller", "alice");
        m.append("called", "bob:with:colons");
        m.append("note", "50% off");
        let line = m.encode("x");
        let w = WireMessage::parse(&line).unwrap();
        assert_eq!(w.id, "x");
        assert_eq!(w.time_us(), 1700000000123456);
        assert_eq!(w.name, "call.route");
        assert_eq!(w.retvalue, "sip/alice");
        assert_eq!(
            w.params,
            vec![
                ("caller".into(), "alice".into()),
                ("called".into(), "bob:with:colons".into()),
                ("note".into(), "50% off".into()),
            ]
        );
    }

    #[test]
    fn encode_result_carries_handled_flag() {
        let mut m = Message::new_at("engine.timer", 0);
        m.append("time", "1700000000");
        let line = m.encode_result("id7", true);
        assert!(line.starts_with("%%<message:id7:true:engine.timer:"));
        let w = WireMessage::parse(&line).unwrap();
        assert!(w.handled());
        assert!(!WireMessage::parse(&m.encode_result("id7", false))
            .unwrap()
            .handled());
    }

    #[test]
    fn parse_rejects_malformed() {
        assert_eq!(WireMessage::parse("%%>install:50:x"), Err(0));
        assert_eq!(WireMessage::parse("%%<message:onlyid"), Err(17));
        // empty name field
        let line = "%%<message:id:0::ret";
        assert!(WireMessage::parse(line).is_err());
        // bad escape in a parameter value reports its offset
        let line = "%%<message:id:0:n:r:k=%q";
        let off = WireMessage::parse(line).unwrap_err();
        assert_eq!(&line[off..off + 1], "q");
    }

    #[test]
    fn reply_merges_into_original() {
        let mut m = Message::new_at("call.route", 5);
        m.append("caller", "alice");
        let reply = WireMessage::parse("%%<message:id:true:call.route:sip/bob:caller=carol:extra=1")
            .unwrap();
        reply.apply_to(&mut m);
        assert_eq!(m.retvalue(), "sip/bob");
        assert_eq!(m.get_param("caller"), Some("carol"));
        assert_eq!(m.get_param("extra"), Some("1"));
    }

    #[test]
    fn into_message_builds_new() {
        let w = WireMessage::parse("%%<message:peer1:0:call.drop::id=ext/1").unwrap();
        let m = w.into_message();
        assert_eq!(m.name(), "call.drop");
        assert_eq!(m.time_us(), 0);
        assert_eq!(m.get_param("id"), Some("ext/1"));
    }

    #[test]
    fn param_without_value_is_empty() {
        let w = WireMessage::parse("%%<message:i:0:n:r:bare").unwrap();
        assert_eq!(w.params, vec![("bare".into(), String::new())]);
    }

    #[test]
    fn serials_are_unique() {
        assert_ne!(Message::new("a").serial(), Message::new("a").serial());
    }
}
