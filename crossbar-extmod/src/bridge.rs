// Copyright 2024-Present Crossbar contributors
// SPDX-License-Identifier: Apache-2.0

//! One bridge per external endpoint: a spawned child process or an
//! adopted socket. A dedicated worker thread reads protocol lines; bus
//! dispatch threads call in through the installed relays and block on a
//! pending-request future until the peer answers or the timeout runs
//! out. `die()` is idempotent and leaves every later call failing fast.
//!
//! Locking: `state` guards the protocol state (role, relays, watcher,
//! pending requests, channel, read side, line buffer). The write side
//! has its own mutex so a slow peer only ever stalls writers, bounded by
//! the configured timeout. Nothing holds `state` while blocking on the
//! peer.

use std::any::Any;
use std::io::{Read, Write};
use std::process::Child;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicI8, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, Weak};
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};

use crossbar_bus::{
    Engine, Message, MessageFilter, MessageHandler, MessagePostHook, MessageReceiver,
    MessageRelay, WireMessage,
};
use crossbar_core::datablock::DataBlock;
use crossbar_core::escape::{msg_unescape, str_bool, str_int, str_int_clamped};
use crossbar_core::sync::{idle, idle_intervals, lock_timeout, plock};

use crate::chan::{CallEndpoint, EndpointRef, ExtModChan};
use crate::module::ExtModule;
use crate::protocol::{self, PeerLine};
use crate::spawn::{self, AudioChildFds};
use crate::stream::{retryable, ReadHalf, WriteHalf};

/// Bounds of the incoming line buffer.
pub(crate) const MIN_INCOMING_LINE: usize = 2048;
pub(crate) const DEF_INCOMING_LINE: usize = 8192;
pub(crate) const MAX_INCOMING_LINE: usize = 65536;

/// Upper bound on queued (outstanding) messages per bridge.
pub(crate) const MAX_MAXQUEUE: i64 = 10000;

static BRIDGE_SEQ: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Unknown,
    Global,
    Channel,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Unknown => "Unknown",
            Role::Global => "Global",
            Role::Channel => "Channel",
        }
    }
}

/// Per-bridge options, adjustable through `setlocal`.
pub(crate) struct Settings {
    pub timebomb: bool,
    pub settime: bool,
    pub setdata: bool,
    pub reenter: bool,
    pub self_watch: bool,
    pub restart: bool,
    pub max_queue: i64,
    pub track_name: String,
    pub reason: String,
    pub debug_name: String,
    pub debug_level: i64,
}

/// An outstanding request written to the peer, waiting for its reply.
struct Pending {
    id: String,
    serial: u64,
    user_data: Option<Arc<dyn Any + Send + Sync>>,
    tx: mpsc::Sender<WireMessage>,
}

struct State {
    role: Role,
    running: bool,
    io_in: Option<ReadHalf>,
    buffer: DataBlock,
    chan: Option<Arc<ExtModChan>>,
    relays: Vec<Arc<MessageRelay>>,
    watcher: Option<Arc<MsgWatcher>>,
    pending: Vec<Pending>,
    q_len: usize,
    settings: Settings,
}

pub struct Bridge {
    id: u64,
    desc: String,
    script: String,
    args: String,
    scripted: bool,
    engine: Arc<Engine>,
    module: Weak<ExtModule>,
    dead: AtomicBool,
    quit: AtomicBool,
    /// -1 while the worker is starting, 0 failed, 1 running.
    init: AtomicI8,
    timeout_ms: AtomicI64,
    id_seq: AtomicU64,
    state: Mutex<State>,
    out: Mutex<Option<WriteHalf>>,
    child: Mutex<Option<Child>>,
    pending_audio: Mutex<Option<AudioChildFds>>,
}

impl Bridge {
    fn alloc(
        module: &Arc<ExtModule>,
        desc: String,
        script: String,
        args: String,
        scripted: bool,
        role: Role,
        chan: Option<Arc<ExtModChan>>,
        io: Option<(ReadHalf, WriteHalf)>,
        audio: Option<AudioChildFds>,
    ) -> Arc<Bridge> {
        let defaults = module.settings();
        let (io_in, io_out) = match io {
            Some((r, w)) => (Some(r), Some(w)),
            None => (None, None),
        };
        Arc::new(Bridge {
            id: BRIDGE_SEQ.fetch_add(1, Ordering::Relaxed),
            desc,
            script,
            args,
            scripted,
            engine: module.engine().clone(),
            module: Arc::downgrade(module),
            dead: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            init: AtomicI8::new(-1),
            timeout_ms: AtomicI64::new(defaults.timeout_ms),
            id_seq: AtomicU64::new(1),
            state: Mutex::new(State {
                role,
                running: false,
                io_in,
                buffer: DataBlock::zeroed(DEF_INCOMING_LINE),
                chan,
                relays: Vec::new(),
                watcher: None,
                pending: Vec::new(),
                q_len: 0,
                settings: Settings {
                    timebomb: defaults.timebomb,
                    settime: defaults.settime,
                    setdata: true,
                    reenter: false,
                    self_watch: false,
                    restart: false,
                    max_queue: defaults.max_queue,
                    track_name: defaults.track_name.clone(),
                    reason: String::new(),
                    debug_name: String::new(),
                    debug_level: 10,
                },
            }),
            out: Mutex::new(io_out),
            child: Mutex::new(None),
            pending_audio: Mutex::new(audio),
        })
    }

    /// Spawn `script` as a child process bridge. Returns the running
    /// bridge or nothing when the spawn or worker startup failed.
    pub(crate) fn build_script(
        module: &Arc<ExtModule>,
        script: &str,
        args: &str,
        chan: Option<Arc<ExtModChan>>,
        audio: AudioChildFds,
    ) -> Option<Arc<Bridge>> {
        let script = script.trim().to_owned();
        let args = args.trim().to_owned();
        let role = if chan.is_some() { Role::Channel } else { Role::Global };
        let desc = format!("ExtMod[{script}]");
        let bridge = Bridge::alloc(
            module,
            desc,
            script,
            args,
            true,
            role,
            chan,
            None,
            Some(audio),
        );
        debug!("{} args='{}' created", bridge.desc, bridge.args);
        module.register_bridge(&bridge);
        bridge.start(module)
    }

    /// Adopt an accepted connection as a bridge named after its
    /// listener, with the peer address as the connection info.
    pub(crate) fn build_stream(
        module: &Arc<ExtModule>,
        name: &str,
        io: (ReadHalf, WriteHalf),
        chan: Option<Arc<ExtModChan>>,
        role: Role,
        conn: &str,
    ) -> Option<Arc<Bridge>> {
        let role = if chan.is_some() { Role::Channel } else { role };
        let desc = format!("ExtModChan[{name}]");
        let bridge = Bridge::alloc(
            module,
            desc,
            name.trim().to_owned(),
            conn.trim().to_owned(),
            false,
            role,
            chan,
            Some(io),
            None,
        );
        debug!("{} conn='{}' created", bridge.desc, bridge.args);
        module.register_bridge(&bridge);
        bridge.start(module)
    }

    fn start(self: Arc<Bridge>, module: &Arc<ExtModule>) -> Option<Arc<Bridge>> {
        let worker = self.clone();
        let started = std::thread::Builder::new()
            .name("ExtMod Receiver".into())
            .spawn(move || {
                worker.run();
                worker.cleanup();
                worker.die(true);
            });
        if started.is_err() {
            warn!("{} failed to start worker thread", self.desc);
            module.remove_bridge(self.id);
            return None;
        }
        while self.init.load(Ordering::Acquire) < 0 {
            std::thread::yield_now();
        }
        if self.init.load(Ordering::Acquire) > 0 {
            Some(self)
        } else {
            None
        }
    }

    pub fn bridge_id(&self) -> u64 {
        self.id
    }

    pub fn desc(&self) -> &str {
        &self.desc
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    pub fn args(&self) -> &str {
        &self.args
    }

    pub fn role(&self) -> Role {
        plock(&self.state).role
    }

    pub fn dead(&self) -> bool {
        self.dead.load(Ordering::Acquire) || self.quit.load(Ordering::Acquire)
    }

    pub fn set_restart(&self, restart: bool) {
        plock(&self.state).settings.restart = restart;
    }

    fn timeout(&self) -> Option<Duration> {
        let ms = self.timeout_ms.load(Ordering::Acquire);
        (ms > 0).then(|| Duration::from_millis(ms as u64))
    }

    fn timebomb(&self) -> bool {
        plock(&self.state).settings.timebomb
    }

    fn child_alive(&self) -> bool {
        plock(&self.child).is_some()
    }

    fn tuning(&self) -> crate::module::Tuning {
        self.module
            .upgrade()
            .map(|m| m.tuning())
            .unwrap_or_default()
    }

    fn new_wire_id(&self) -> String {
        let seq = self.id_seq.fetch_add(1, Ordering::Relaxed);
        format!(
            "{:x}.{:x}.{:x}",
            self.id,
            seq,
            rand::thread_rng().gen::<u32>()
        )
    }

    /// Describe this bridge for the `external info` listing.
    pub fn describe(&self, out: &mut String) {
        let st = plock(&self.state);
        out.push('\t');
        out.push_str(st.role.as_str());
        if self.dead() {
            out.push_str(", dead");
        }
        if st.chan.is_some() {
            out.push_str(", has channel");
        }
        if st.settings.restart {
            out.push_str(", autorestart");
        }
        drop(st);
        if let Some(child) = plock(&self.child).as_ref() {
            out.push_str(&format!(", pid={}", child.id()));
        }
        out.push_str("\r\n");
    }

    // ---- writer ----------------------------------------------------

    /// Write one line, exclusively, appending the newline. Fails after
    /// the configured timeout waiting for the writer or the peer.
    pub(crate) fn output_line(&self, line: &str) -> bool {
        if line.is_empty() {
            return true;
        }
        if self.dead.load(Ordering::Acquire) {
            return false;
        }
        let timeout = self.timeout();
        let Some(mut guard) = lock_timeout(&self.out, timeout) else {
            if !self.quit.load(Ordering::Acquire) {
                self.engine.alarm(
                    "performance",
                    &format!(
                        "{} timeout waiting to write {} characters",
                        self.desc,
                        line.len()
                    ),
                );
            }
            return false;
        };
        let Some(out) = guard.as_mut() else {
            return false;
        };
        debug!("{} outputLine '{line}'", self.desc);
        for chunk in [line.as_bytes(), b"\n".as_slice()] {
            let mut buf = chunk;
            while !buf.is_empty() {
                if self.dead.load(Ordering::Acquire) {
                    return false;
                }
                match out.write(buf) {
                    Ok(0) => return false,
                    Ok(n) => buf = &buf[n..],
                    Err(e) if retryable(&e) => idle(),
                    Err(_) => return false,
                }
            }
        }
        true
    }

    fn report_error(&self, line: &str) {
        warn!("{} error: '{line}'", self.desc);
        self.output_line(&protocol::connect_error(line));
    }

    /// Send a dispatch result or watcher mirror back to the peer.
    pub(crate) fn return_msg(&self, msg: &Message, id: &str, accepted: bool) {
        let line = msg.encode_result(id, accepted);
        if !self.output_line(&line) && self.timebomb() {
            self.die(true);
        }
    }

    fn close_out(&self) {
        if let Some(half) = plock(&self.out).take() {
            half.close();
        }
    }

    fn close_in(&self) {
        if let Some(half) = plock(&self.state).io_in.take() {
            half.close();
        }
    }

    // ---- watcher ---------------------------------------------------

    pub(crate) fn add_watched(self: &Arc<Bridge>, name: &str) -> bool {
        let mut st = plock(&self.state);
        if self.dead.load(Ordering::Acquire) {
            return false;
        }
        let watcher = match st.watcher.as_ref() {
            Some(watcher) => watcher.clone(),
            None => {
                let watcher = Arc::new(MsgWatcher::new(Arc::downgrade(self)));
                self.engine.set_hook(watcher.clone());
                st.watcher = Some(watcher.clone());
                watcher
            }
        };
        watcher.add_watched(name)
    }

    pub(crate) fn del_watched(&self, name: &str) -> bool {
        let st = plock(&self.state);
        if self.dead.load(Ordering::Acquire) {
            return false;
        }
        match st.watcher.as_ref() {
            Some(w) => w.del_watched(name),
            None => false,
        }
    }

    // ---- lifecycle -------------------------------------------------

    /// Release the watcher, the relays and every pending request, then
    /// give in-flight dispatches a short drain window.
    fn flush(&self) -> bool {
        let mut need_wait;
        let mut flushed = false;
        let (watcher, relays) = {
            let mut st = plock(&self.state);
            let watcher = st.watcher.take();
            let relays = std::mem::take(&mut st.relays);
            need_wait = watcher.is_some() || !relays.is_empty();
            if !st.pending.is_empty() {
                info!(
                    "{} releasing {} pending messages",
                    self.desc, st.q_len
                );
                // Dropping the senders wakes every waiting dispatcher
                // with a failure.
                st.pending.clear();
                st.q_len = 0;
                need_wait = true;
                flushed = true;
            }
            (watcher, relays)
        };
        if let Some(watcher) = watcher {
            let hook: Arc<dyn MessagePostHook> = watcher.clone();
            self.engine.remove_hook(&hook);
            watcher.clear();
        }
        for relay in relays {
            let handler: Arc<dyn MessageHandler> = relay;
            self.engine.uninstall(&handler);
        }
        if need_wait {
            let mut ms = self.tuning().wait_flush_ms;
            if self.engine.exiting() {
                ms = ms.min(crate::module::WAIT_FLUSH_DEF_MS);
            }
            std::thread::sleep(Duration::from_millis(ms));
        }
        flushed
    }

    /// Terminate the bridge. Idempotent: the first caller wins, later
    /// and concurrent calls return immediately.
    pub fn die(&self, clear_chan: bool) {
        if self.dead.swap(true, Ordering::AcqRel) {
            debug!("{} die() is already dead", self.desc);
            return;
        }
        self.quit.store(true, Ordering::Release);
        debug!("{} die()", self.desc);

        let (chan, role, restart) = {
            let mut st = plock(&self.state);
            st.running = false;
            (st.chan.take(), st.role, st.settings.restart)
        };
        if let Some(chan) = &chan {
            chan.set_receiver(None);
        }
        if self.scripted && role == Role::Global {
            self.engine.output(&format!(
                "Unloading external module '{}' '{}'",
                self.script, self.args
            ));
        }

        // Close the peer's stdin first so it can exit gracefully.
        self.close_out();
        if self.child_alive() {
            debug!("{} die() waiting for child to exit", self.desc);
            for _ in 0..idle_intervals(self.tuning().recv_die_waitpid_ms) {
                if !self.child_alive() {
                    break;
                }
                idle();
            }
            if self.child_alive() {
                info!("{} die() child did not exit?", self.desc);
            }
        }
        self.close_in();
        // No confirmation can be received anymore.
        self.flush();
        if let Some(child) = plock(&self.child).as_ref() {
            spawn::terminate(child);
        }
        let reason = plock(&self.state).settings.reason.clone();
        if clear_chan {
            if let Some(chan) = &chan {
                chan.disconnect(&reason);
            }
        }
        if let Some(module) = self.module.upgrade() {
            if restart && !self.engine.exiting() {
                warn!(
                    "Restarting external '{}' '{}'",
                    self.script, self.args
                );
                module.start_script(&self.script, &self.args);
            }
            module.remove_bridge(self.id);
        }
    }

    /// Runs on the worker thread after the read loop ends: reap the
    /// child, escalating to SIGTERM when closing stdin was not enough.
    fn cleanup(&self) {
        if !self.child_alive() {
            return;
        }
        self.close_out();
        let wait = self.tuning().recv_cleanup_waitpid_ms;
        if wait > 0 {
            std::thread::sleep(Duration::from_millis(wait));
        } else {
            std::thread::yield_now();
        }
        let mut guard = plock(&self.child);
        if let Some(child) = guard.as_mut() {
            let pid = child.id();
            if !spawn::try_reap(child) {
                warn!(
                    "{} process {pid} has not exited on closing stdin - we'll kill it",
                    self.desc
                );
                spawn::terminate(child);
                std::thread::yield_now();
                if !spawn::try_reap(child) {
                    warn!("{} process {pid} has still not exited yet?", self.desc);
                }
            }
        }
        *guard = None;
    }

    // ---- reader ----------------------------------------------------

    fn run(self: &Arc<Bridge>) {
        if self.scripted {
            let audio = plock(&self.pending_audio).take().unwrap_or_default();
            let role = plock(&self.state).role;
            match spawn::spawn_script(&self.script, &self.args, audio) {
                Ok(spawned) => {
                    if role == Role::Global {
                        self.engine.output(&format!(
                            "Loading external module '{}' '{}'",
                            self.script, self.args
                        ));
                    }
                    *plock(&self.child) = Some(spawned.child);
                    *plock(&self.out) = Some(spawned.write);
                    let mut st = plock(&self.state);
                    st.io_in = Some(spawned.read);
                    st.running = true;
                    drop(st);
                    self.init.store(1, Ordering::Release);
                }
                Err(e) => {
                    warn!("{} failed to start: {e:#}", self.desc);
                    self.init.store(0, Ordering::Release);
                    return;
                }
            }
        } else {
            plock(&self.state).running = true;
            self.init.store(1, Ordering::Release);
        }

        let mut pos_in_buf = 0usize;
        let mut invalid = true;
        debug!("{} entering read loop", self.desc);
        loop {
            if self.dead.load(Ordering::Acquire) {
                return;
            }
            enum Outcome {
                Data(usize),
                Eof,
                Retry,
                Fatal(std::io::Error),
                Overflow,
            }
            let outcome = {
                let mut st = plock(&self.state);
                let State { io_in, buffer, .. } = &mut *st;
                let buflen = buffer.len();
                let bufspace = buflen.saturating_sub(pos_in_buf + 1);
                if bufspace == 0 {
                    Outcome::Overflow
                } else {
                    match io_in.as_mut() {
                        None => Outcome::Eof,
                        Some(io) => {
                            match io.read(&mut buffer.data_mut()[pos_in_buf..pos_in_buf + bufspace])
                            {
                                Ok(0) => Outcome::Eof,
                                Ok(n) => Outcome::Data(n),
                                Err(e) if retryable(&e) => Outcome::Retry,
                                Err(e) => Outcome::Fatal(e),
                            }
                        }
                    }
                }
            };
            match outcome {
                Outcome::Overflow => {
                    warn!(
                        "{} overflow reading in buffer, closing",
                        self.desc
                    );
                    return;
                }
                Outcome::Retry => {
                    idle();
                    continue;
                }
                Outcome::Eof => {
                    info!("{} read EOF", self.desc);
                    self.close_in();
                    self.flush();
                    if invalid {
                        warn!(
                            "{} terminating args='{}'. Never got anything",
                            self.desc, self.args
                        );
                    }
                    let chan_running =
                        plock(&self.state).chan.as_ref().map(|c| c.running()).unwrap_or(false);
                    if chan_running {
                        std::thread::sleep(Duration::from_secs(1));
                    }
                    return;
                }
                Outcome::Fatal(e) => {
                    if !self.quit.load(Ordering::Acquire) {
                        warn!("{} read error: {e}", self.desc);
                    }
                    return;
                }
                Outcome::Data(n) => {
                    let mut total = pos_in_buf + n;
                    if total >= plock(&self.state).buffer.len() {
                        warn!("{} overflow reading in buffer, closing", self.desc);
                        return;
                    }
                    loop {
                        let line_end = {
                            let st = plock(&self.state);
                            let data = &st.buffer.data()[..total];
                            match data.iter().position(|&b| b == b'\n' || b == b'\0') {
                                None => None,
                                Some(eol) => {
                                    let mut end = eol;
                                    if end > 0 && data[end - 1] == b'\r' {
                                        end -= 1;
                                    }
                                    Some((
                                        eol,
                                        String::from_utf8_lossy(&data[..end]).into_owned(),
                                    ))
                                }
                            }
                        };
                        let Some((eol, line)) = line_end else {
                            break;
                        };
                        let consumed = eol + 1;
                        if !line.is_empty() {
                            invalid = invalid && !line.starts_with("%%");
                            let quit_now = self.process_line(&line);
                            if quit_now || self.dead.load(Ordering::Acquire) {
                                return;
                            }
                            if total >= plock(&self.state).buffer.len() {
                                warn!(
                                    "{} lost data shrinking read buffer, closing",
                                    self.desc
                                );
                                return;
                            }
                        }
                        let mut st = plock(&self.state);
                        st.buffer.data_mut().copy_within(consumed..total, 0);
                        drop(st);
                        total -= consumed;
                    }
                    pos_in_buf = total;
                }
            }
        }
    }

    // ---- protocol --------------------------------------------------

    /// Handle one complete line; true terminates the worker.
    fn process_line(self: &Arc<Bridge>, line: &str) -> bool {
        if self.dead.load(Ordering::Acquire) {
            return false;
        }
        if self.quit.load(Ordering::Acquire) {
            return true;
        }
        debug!("{} processLine '{line}'", self.desc);

        if plock(&self.state).role == Role::Unknown {
            return match PeerLine::parse(line) {
                PeerLine::Connect { role, chan, kind } => {
                    debug!("{} role '{role}' chan '{chan}' type '{kind}'", self.desc);
                    let new_role = match role {
                        "global" => Some(Role::Global),
                        "channel" => Some(Role::Channel),
                        _ => None,
                    };
                    match new_role {
                        Some(r) => {
                            plock(&self.state).role = r;
                            false
                        }
                        None => {
                            warn!("{} unknown role '{role}' received", self.desc);
                            true
                        }
                    }
                }
                _ => {
                    warn!("{} expecting %%>connect, received '{line}'", self.desc);
                    true
                }
            };
        }

        match PeerLine::parse(line) {
            PeerLine::MessageLine => {
                self.process_message_line(line);
                false
            }
            PeerLine::Install {
                priority,
                name,
                filter,
            } => {
                let mut relay = None;
                let ok = {
                    let mut st = plock(&self.state);
                    let ok = !name.is_empty()
                        && !self.dead.load(Ordering::Acquire)
                        && !st.relays.iter().any(|r| r.name() == name);
                    if ok {
                        let mut r = MessageRelay::new(
                            name,
                            Arc::downgrade(self) as Weak<dyn MessageReceiver>,
                            0,
                            priority,
                            st.settings.track_name.clone(),
                        );
                        if let Some((fname, fvalue)) = filter {
                            if !fname.is_empty() {
                                let fvalue =
                                    msg_unescape(fvalue, None).unwrap_or_else(|_| fvalue.into());
                                r = r.with_filter(MessageFilter::exact(fname, fvalue));
                            }
                        }
                        let r = Arc::new(r);
                        st.relays.push(r.clone());
                        relay = Some(r);
                    }
                    ok
                };
                if let Some(relay) = relay {
                    self.engine.install(relay);
                }
                self.log_inst_result(ok, "install", name);
                self.output_line(&protocol::install_reply(priority, name, ok));
                false
            }
            PeerLine::Uninstall { name } => {
                let mut priority = 0;
                let mut removed = None;
                {
                    let mut st = plock(&self.state);
                    if let Some(pos) = st.relays.iter().position(|r| r.name() == name) {
                        let relay = st.relays.remove(pos);
                        priority = relay.priority();
                        removed = Some(relay);
                    }
                }
                let ok = removed.is_some();
                if let Some(relay) = removed {
                    let handler: Arc<dyn MessageHandler> = relay;
                    self.engine.uninstall(&handler);
                }
                self.log_inst_result(ok, "uninstall", name);
                self.output_line(&protocol::uninstall_reply(priority, name, ok));
                false
            }
            PeerLine::Watch { name } => {
                let ok = self.add_watched(name);
                self.log_inst_result(ok, "watch", name);
                self.output_line(&protocol::watch_reply(name, ok));
                false
            }
            PeerLine::Unwatch { name } => {
                let ok = self.del_watched(name);
                self.log_inst_result(ok, "unwatch", name);
                self.output_line(&protocol::unwatch_reply(name, ok));
                false
            }
            PeerLine::Output { text } => {
                self.engine.output(text.trim());
                false
            }
            PeerLine::Debug { level, text } => {
                let level = level.clamp(1, 10);
                let text = msg_unescape(text, None).unwrap_or_else(|_| text.into());
                if level <= 5 {
                    info!("{} [{level}] {text}", self.desc);
                } else {
                    debug!("{} [{level}] {text}", self.desc);
                }
                false
            }
            PeerLine::SetLocal { key, value } => self.setlocal(key, value.trim()),
            PeerLine::Quit => {
                self.quit.store(true, Ordering::Release);
                self.output_line(protocol::QUIT_REPLY);
                true
            }
            PeerLine::Connect { .. } | PeerLine::Unknown => {
                self.report_error(line);
                false
            }
        }
    }

    /// `%%<message:` traffic: match a pending request, else treat the
    /// line as a peer-originated message.
    fn process_message_line(self: &Arc<Bridge>, line: &str) {
        let wire = match WireMessage::parse(line) {
            Ok(w) => w,
            Err(_) => {
                self.report_error(line);
                return;
            }
        };

        {
            let mut st = plock(&self.state);
            if let Some(pos) = st.pending.iter().position(|p| p.id == wire.id) {
                let pending = st.pending.remove(pos);
                st.q_len = st.q_len.saturating_sub(1);
                if let Some(chan) = &st.chan {
                    if chan.wait_serial() == pending.serial {
                        debug!("{} entering wait mode on channel", self.desc);
                        chan.clear_wait();
                        chan.set_waiting(true);
                    }
                }
                let _ = pending.tx.send(wire);
                return;
            }
        }

        if wire.id.is_empty() {
            // Reply to a watcher mirror: watchers are read-only.
            debug!("{} ignoring reply with no matching request", self.desc);
            return;
        }
        // Unknown id: a message the peer originates toward the bus.
        info!("{} unmatched message taken as new: '{}'", self.desc, wire.name);
        self.enqueue_peer_message(wire);
    }

    fn enqueue_peer_message(self: &Arc<Bridge>, wire: WireMessage) {
        let id = wire.id.clone();
        let mut msg = wire.into_message();

        // Hold peer traffic while the bound channel waits for its own
        // call.execute to return.
        let mut note = true;
        loop {
            {
                let st = plock(&self.state);
                let waiting = st.chan.as_ref().map(|c| c.waiting()).unwrap_or(false);
                if !waiting {
                    break;
                }
            }
            if note {
                note = false;
                debug!(
                    "{} waiting before enqueueing new message '{}'",
                    self.desc,
                    msg.name()
                );
            }
            if self.dead.load(Ordering::Acquire) {
                return;
            }
            std::thread::yield_now();
        }

        {
            let mut st = plock(&self.state);
            if self.dead.load(Ordering::Acquire) {
                return;
            }
            let mut fresh_chan = false;
            if st.role == Role::Channel
                && st.chan.is_none()
                && st.settings.setdata
                && msg.name() == "call.execute"
            {
                if let Some(module) = self.module.upgrade() {
                    // Channel creation was delayed until there was
                    // something to bind it to.
                    let chan = ExtModChan::new_bound(&module, self);
                    msg.set_param("id", chan.id(), false);
                    st.chan = Some(chan);
                    fresh_chan = true;
                }
            }
            if st.settings.setdata {
                msg.set_user_data(st.chan.clone().map(|c| {
                    Arc::new(EndpointRef(c as Arc<dyn CallEndpoint>)) as Arc<dyn Any + Send + Sync>
                }));
            }
            if !id.is_empty() && !fresh_chan {
                if let Some(p) = st.pending.iter().find(|p| p.id == id) {
                    if let Some(ud) = &p.user_data {
                        debug!("{} copying data pointer from pending '{id}'", self.desc);
                        msg.set_user_data(Some(ud.clone()));
                    }
                }
            }
            if st.settings.settime || msg.time_us() == 0 {
                msg.set_time_us(crossbar_bus::message::now_us());
            }
        }

        msg.set_origin(self.id);
        if !id.is_empty() {
            msg.set_wire_id(Some(id.clone()));
        }
        let bridge = self.clone();
        self.engine.enqueue_notify(
            msg,
            Box::new(move |m, handled| {
                if !id.is_empty() {
                    bridge.return_msg(m, &id, handled);
                }
            }),
        );
    }

    fn log_inst_result(&self, ok: bool, oper: &str, name: &str) {
        if ok {
            debug!("{} {oper} '{name}'", self.desc);
        } else {
            info!("{} failed {oper} '{name}'", self.desc);
        }
    }

    /// `%%>setlocal:` handling; returns true to terminate (never does).
    fn setlocal(self: &Arc<Bridge>, key: &str, value: &str) -> bool {
        let mut st = plock(&self.state);
        if self.dead.load(Ordering::Acquire) {
            return false;
        }
        let chan = st.chan.clone();
        let mut ok = true;
        let mut val = value.to_string();
        match key {
            "id" if chan.is_some() => {
                #[allow(clippy::unwrap_used)]
                let chan = chan.unwrap();
                if value.is_empty() {
                    val = chan.id();
                } else {
                    chan.set_id(value);
                }
            }
            "disconnected" if chan.is_some() => {
                #[allow(clippy::unwrap_used)]
                let chan = chan.unwrap();
                chan.set_disconn(str_bool(value).unwrap_or(chan.disconn()));
                val = chan.disconn().to_string();
            }
            "trackparam" => {
                if value.is_empty() {
                    val = st.settings.track_name.clone();
                } else {
                    st.settings.track_name = value.to_owned();
                }
            }
            "reason" => {
                st.settings.reason = value.to_owned();
            }
            "timeout" => {
                let cur = self.timeout_ms.load(Ordering::Acquire);
                let t = str_int(value).unwrap_or(cur);
                self.timeout_ms.store(t, Ordering::Release);
                val = t.to_string();
            }
            "timebomb" => {
                st.settings.timebomb = str_bool(value).unwrap_or(st.settings.timebomb);
                val = st.settings.timebomb.to_string();
            }
            "maxqueue" => {
                st.settings.max_queue =
                    str_int_clamped(value, st.settings.max_queue, 0, MAX_MAXQUEUE);
                val = st.settings.max_queue.to_string();
            }
            "bufsize" => {
                let cur = st.buffer.len() as i64;
                let len = str_int_clamped(
                    value,
                    cur,
                    MIN_INCOMING_LINE as i64,
                    MAX_INCOMING_LINE as i64,
                ) as usize;
                st.buffer.resize(len);
                val = st.buffer.len().to_string();
            }
            "restart" => {
                st.settings.restart = self.scripted
                    && st.role == Role::Global
                    && str_bool(value).unwrap_or(st.settings.restart);
                val = st.settings.restart.to_string();
            }
            "reenter" => {
                st.settings.reenter = str_bool(value).unwrap_or(st.settings.reenter);
                val = st.settings.reenter.to_string();
            }
            "setdata" => {
                st.settings.setdata = str_bool(value).unwrap_or(st.settings.setdata);
                val = st.settings.setdata.to_string();
            }
            "settime" => {
                st.settings.settime = str_bool(value).unwrap_or(st.settings.settime);
                val = st.settings.settime.to_string();
            }
            "selfwatch" => {
                st.settings.self_watch = str_bool(value).unwrap_or(st.settings.self_watch);
                val = st.settings.self_watch.to_string();
            }
            "debuglevel" => {
                if !value.is_empty() {
                    st.settings.debug_level = str_int_clamped(value, st.settings.debug_level, 1, 10);
                }
                val = st.settings.debug_level.to_string();
            }
            "debugname" => {
                if !value.is_empty() && st.settings.debug_name.is_empty() {
                    st.settings.debug_name = value.to_owned();
                } else {
                    val = st.settings.debug_name.clone();
                }
            }
            "runid" => {
                ok = value.is_empty();
                val = self.engine.run_id().to_string();
            }
            _ if key.starts_with("engine.") => {
                let param = self.engine.run_param(&key["engine.".len()..]);
                ok = value.is_empty() && param.is_some();
                val = param.unwrap_or_default();
            }
            _ if key.starts_with("config.") => {
                ok = value.is_empty();
                let rest = &key["config.".len()..];
                match rest.split_once('.') {
                    Some((sect, param)) => {
                        match self.engine.config_value(sect.trim(), param.trim()) {
                            Some(v) => val = v,
                            None => {
                                val.clear();
                                ok = false;
                            }
                        }
                    }
                    None => {
                        ok = ok && self.engine.config_has_section(rest.trim());
                        val.clear();
                    }
                }
            }
            _ if key.starts_with("loaded.") => {
                ok = value.is_empty();
                val = self
                    .engine
                    .module_loaded(&key["loaded.".len()..])
                    .to_string();
            }
            _ => ok = false,
        }
        drop(st);
        debug!(
            "{} set '{key}'='{val}' {}",
            self.desc,
            if ok { "ok" } else { "failed" }
        );
        self.output_line(&protocol::setlocal_reply(key, &val, ok));
        false
    }
}

impl MessageReceiver for Bridge {
    /// Relay entry: serialise the message to the peer and wait for the
    /// matching reply.
    fn received(&self, msg: &mut Message, _id: u32) -> bool {
        if self.dead() {
            return false;
        }
        let timeout = self.timeout();
        let Some(mut st) = lock_timeout(&self.state, timeout) else {
            self.engine.alarm(
                "performance",
                &format!(
                    "{} failed to lock to queue message '{}'",
                    self.desc,
                    msg.name()
                ),
            );
            return false;
        };

        let mut ok = st.running && !self.dead() && st.io_in.is_some();
        if ok && !st.settings.reenter && msg.origin() == self.id {
            // Generated by our own peer: avoid reentrance.
            ok = false;
        }
        if ok && st.settings.max_queue > 0 && st.q_len as i64 >= st.settings.max_queue {
            warn!("{} already having {} queued messages", self.desc, st.q_len);
            ok = false;
        }
        if !ok {
            return false;
        }

        let id = self.new_wire_id();
        let line = msg.encode(&id);
        let (tx, rx) = mpsc::channel();
        st.pending.push(Pending {
            id: id.clone(),
            serial: msg.serial(),
            user_data: msg.user_data().cloned(),
            tx,
        });
        st.q_len += 1;
        drop(st);

        let mut handled = false;
        let mut fail = false;
        if self.output_line(&line) {
            let reply = match timeout {
                Some(t) => rx.recv_timeout(t),
                None => rx.recv().map_err(|_| mpsc::RecvTimeoutError::Disconnected),
            };
            match reply {
                Ok(wire) => {
                    wire.apply_to(msg);
                    handled = wire.handled();
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    self.engine.alarm(
                        "performance",
                        &format!(
                            "{} message '{}' did not return in {} msec",
                            self.desc,
                            msg.name(),
                            self.timeout_ms.load(Ordering::Acquire)
                        ),
                    );
                    let mut st = plock(&self.state);
                    if let Some(pos) = st.pending.iter().position(|p| p.id == id) {
                        st.pending.remove(pos);
                        st.q_len = st.q_len.saturating_sub(1);
                    }
                    fail = true;
                }
                // The bridge died and flushed its pending list.
                Err(mpsc::RecvTimeoutError::Disconnected) => {}
            }
        } else {
            warn!("{} could not queue message '{}'", self.desc, msg.name());
            let mut st = plock(&self.state);
            if let Some(pos) = st.pending.iter().position(|p| p.id == id) {
                st.pending.remove(pos);
                st.q_len = st.q_len.saturating_sub(1);
            }
            drop(st);
            fail = true;
        }
        if fail && self.timebomb() {
            self.die(true);
        }
        handled
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        debug!("{} args='{}' destroyed", self.desc, self.args);
    }
}

/// Global post-dispatch hook mirroring matching messages to the peer.
/// Holds the bridge weakly; the bridge owns the watcher.
pub(crate) struct MsgWatcher {
    bridge: Mutex<Weak<Bridge>>,
    watched: Mutex<Vec<String>>,
}

impl MsgWatcher {
    fn new(bridge: Weak<Bridge>) -> Self {
        MsgWatcher {
            bridge: Mutex::new(bridge),
            watched: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn add_watched(&self, name: &str) -> bool {
        let mut watched = plock(&self.watched);
        if watched.iter().any(|w| w == name) {
            return false;
        }
        if name.is_empty() {
            // Wildcard watches go first for match speed.
            watched.insert(0, String::new());
        } else {
            watched.push(name.to_owned());
        }
        true
    }

    pub(crate) fn del_watched(&self, name: &str) -> bool {
        let mut watched = plock(&self.watched);
        match watched.iter().position(|w| w == name) {
            Some(pos) => {
                watched.remove(pos);
                true
            }
            None => false,
        }
    }

    pub(crate) fn clear(&self) {
        *plock(&self.bridge) = Weak::new();
    }
}

impl MessagePostHook for MsgWatcher {
    fn dispatched(&self, msg: &Message, handled: bool) {
        let Some(bridge) = plock(&self.bridge).upgrade() else {
            return;
        };
        if bridge.dead() {
            return;
        }
        let self_watch = plock(&bridge.state).settings.self_watch;
        if !self_watch && msg.origin() == bridge.id {
            // Generated by our own peer: avoid reentrance.
            return;
        }
        let matched = {
            let watched = plock(&self.watched);
            watched.iter().any(|w| w.is_empty() || w == msg.name())
        };
        if matched {
            bridge.return_msg(msg, msg.wire_id().unwrap_or(""), handled);
        }
    }
}

