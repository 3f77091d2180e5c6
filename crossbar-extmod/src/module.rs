// Copyright 2024-Present Crossbar contributors
// SPDX-License-Identifier: Apache-2.0

//! The module shell: configuration intake, the bus handlers
//! (`call.execute` routing, the `external` command, status, help, halt
//! cleanup), the bridge and channel registries, and the bootstrap of
//! listeners, scripts and detached programs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};

use regex::Regex;
use tracing::{error, info, warn};

use crossbar_bus::{Engine, Message, MessageFilter, MessageHandler};
use crossbar_core::config::Configuration;
use crossbar_core::sync::{plock, IDLE_MSEC};

use crate::bridge::Bridge;
use crate::chan::{connect_endpoints, CallEndpoint, ChanData, EndpointRef, ExtModChan};
use crate::listener::ExtListener;
use crate::spawn::{run_program, AudioChildFds};

pub(crate) const WAIT_FLUSH_DEF_MS: u64 = 5;

const HELP_EXTERNAL_CMD: &str = "  external [info] [stop scriptname] [[start|restart] scriptname [parameter]] [execute progname [parameter]]\r\n";
const HELP_EXTERNAL_INFO: &str = "List, (re)start and stop scripts or execute an external program\r\n";

const COMMANDS: &[&str] = &["info", "start", "stop", "restart", "execute"];

/// Routing targets: `external/<type>/<script>[ <args>]`.
fn callto_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::unwrap_used)]
    RE.get_or_init(|| Regex::new("^external/([^/]*)/([^ ]*)(.*)$").unwrap())
}

/// Module-wide defaults picked up by new bridges.
#[derive(Clone)]
pub(crate) struct ModuleSettings {
    pub max_queue: i64,
    pub timeout_ms: i64,
    pub timebomb: bool,
    pub settime: bool,
    pub track_name: String,
}

impl Default for ModuleSettings {
    fn default() -> Self {
        ModuleSettings {
            max_queue: 1000,
            timeout_ms: 10000,
            timebomb: false,
            settime: false,
            track_name: String::new(),
        }
    }
}

/// Teardown timing knobs shared by every bridge.
#[derive(Clone, Copy)]
pub(crate) struct Tuning {
    pub wait_flush_ms: u64,
    pub recv_cleanup_waitpid_ms: u64,
    pub recv_die_waitpid_ms: u64,
}

impl Default for Tuning {
    fn default() -> Self {
        Tuning {
            wait_flush_ms: WAIT_FLUSH_DEF_MS,
            recv_cleanup_waitpid_ms: 30,
            recv_die_waitpid_ms: 60,
        }
    }
}

pub struct ExtModule {
    engine: Arc<Engine>,
    settings: RwLock<ModuleSettings>,
    tuning: RwLock<Tuning>,
    exec_printf: AtomicBool,
    bridges: Mutex<Vec<Arc<Bridge>>>,
    chans: Mutex<Vec<Weak<ExtModChan>>>,
    listeners: Mutex<Vec<ExtListener>>,
    initialized: AtomicBool,
    halted: AtomicBool,
}

impl ExtModule {
    pub fn create(engine: Arc<Engine>) -> Arc<ExtModule> {
        engine.output("Loaded module ExtModule");
        engine.register_module("extmodule");
        Arc::new(ExtModule {
            engine,
            settings: RwLock::new(ModuleSettings::default()),
            tuning: RwLock::new(Tuning::default()),
            exec_printf: AtomicBool::new(false),
            bridges: Mutex::new(Vec::new()),
            chans: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            initialized: AtomicBool::new(false),
            halted: AtomicBool::new(false),
        })
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Apply configuration; handlers, listeners and scripts start on the
    /// first call, later calls only refresh the tunables.
    pub fn initialize(self: &Arc<Self>, cfg: &Configuration) {
        self.engine.output("Initializing module ExtModule");
        let default_general = crossbar_core::namedlist::NamedList::new("general");
        let gen = cfg.section("general").unwrap_or(&default_general);

        {
            let mut s = self.settings.write().unwrap_or_else(|e| e.into_inner());
            s.max_queue = gen.get_int_value_clamped("maxqueue", 1000, 0, 10000);
            s.timeout_ms = gen.get_int_value("timeout", 10000);
            s.timebomb = gen.get_bool_value("timebomb", false);
            s.settime = gen.get_bool_value("settime", false);
            s.track_name = if gen.get_bool_value("trackparam", false) {
                "extmodule".to_owned()
            } else {
                String::new()
            };
        }
        {
            let mut t = self.tuning.write().unwrap_or_else(|e| e.into_inner());
            t.wait_flush_ms = gen.get_int_value_clamped("waitflush", WAIT_FLUSH_DEF_MS as i64, 1, 100) as u64;
            let cleanup = gen.get_int_value_clamped("recv_cleanup_waitpid", 30, 0, 100) as u64;
            let mut die = gen.get_int_value_clamped("recv_die_waitpid", 60, 0, 200) as u64;
            if die > 0 && die <= cleanup {
                die = cleanup + IDLE_MSEC;
            }
            t.recv_cleanup_waitpid_ms = cleanup;
            t.recv_die_waitpid_ms = die;
        }
        self.exec_printf
            .store(gen.get_bool_value("exec_use_printf", false), Ordering::Release);

        if self.initialized.swap(true, Ordering::AcqRel) {
            return;
        }

        let priority = gen.get_int_value("priority", 100).clamp(1, u32::MAX as i64) as u32;
        let filter = gen
            .get_bool_value("execute_use_filter", true)
            .then(|| MessageFilter::regex("callto", callto_regex().clone()));
        self.engine.install(Arc::new(CalltoHandler {
            module: Arc::downgrade(self),
            priority,
            filter,
        }));
        self.engine.install(Arc::new(CommandHandler {
            module: Arc::downgrade(self),
        }));
        self.engine.install(Arc::new(StatusHandler {
            module: Arc::downgrade(self),
        }));
        self.engine.install(Arc::new(HelpHandler));
        if gen.get_bool_value("halt_cleanup", true) {
            let halt_priority = gen.get_int_value("halt_priority", 1000).max(100) as u32;
            self.engine.install(Arc::new(HaltHandler {
                module: Arc::downgrade(self),
                priority: halt_priority,
            }));
        }

        for sect in cfg.sections() {
            if let Some(name) = sect.name().strip_prefix("listener ") {
                let name = name.trim();
                if name.is_empty() {
                    continue;
                }
                match ExtListener::build(self, name, sect) {
                    Ok(listener) => plock(&self.listeners).push(listener),
                    Err(e) => self
                        .engine
                        .alarm("config", &format!("could not start listener '{name}': {e:#}")),
                }
            }
        }
        // Start scripts only after the listeners.
        if let Some(scripts) = cfg.section("scripts") {
            for p in scripts.iter() {
                let args = self.engine.replace_run_params(&p.value);
                self.start_script(&p.name, &args);
            }
        }
        // And now the detached programs.
        if let Some(execute) = cfg.section("execute") {
            for p in execute.iter() {
                if !p.name.is_empty() {
                    let args = self.engine.replace_run_params(&p.value);
                    run_program(&p.name, &args, self.exec_printf.load(Ordering::Acquire));
                }
            }
        }
    }

    pub(crate) fn settings(&self) -> ModuleSettings {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn tuning(&self) -> Tuning {
        *self.tuning.read().unwrap_or_else(|e| e.into_inner())
    }

    // ---- registries ------------------------------------------------

    pub(crate) fn register_bridge(&self, bridge: &Arc<Bridge>) {
        plock(&self.bridges).push(bridge.clone());
    }

    pub(crate) fn remove_bridge(&self, id: u64) {
        plock(&self.bridges).retain(|b| b.bridge_id() != id);
    }

    pub(crate) fn register_chan(&self, chan: &Arc<ExtModChan>) {
        plock(&self.chans).push(Arc::downgrade(chan));
    }

    pub(crate) fn prune_chans(&self) {
        plock(&self.chans).retain(|c| c.strong_count() > 0);
    }

    pub fn bridge_count(&self) -> usize {
        plock(&self.bridges).len()
    }

    pub fn chan_count(&self) -> usize {
        plock(&self.chans)
            .iter()
            .filter(|c| c.strong_count() > 0)
            .count()
    }

    /// Whether any channels are still alive (engine busy check).
    pub fn is_busy(&self) -> bool {
        self.chan_count() != 0
    }

    // ---- operations ------------------------------------------------

    /// Launch a global script bridge.
    pub fn start_script(self: &Arc<Self>, script: &str, args: &str) -> bool {
        Bridge::build_script(self, script, args, None, AudioChildFds::default()).is_some()
    }

    /// Adopt an already connected UNIX socket as a bridge peer.
    pub fn adopt_unix_stream(
        self: &Arc<Self>,
        name: &str,
        stream: std::os::unix::net::UnixStream,
        role: crate::bridge::Role,
        conn: &str,
    ) -> Option<Arc<Bridge>> {
        match crate::stream::unix_halves(stream) {
            Ok(io) => Bridge::build_stream(self, name, io, None, role, conn),
            Err(e) => {
                warn!("could not prepare unix stream for '{name}': {e}");
                None
            }
        }
    }

    /// Adopt an already connected TCP socket as a bridge peer.
    pub fn adopt_tcp_stream(
        self: &Arc<Self>,
        name: &str,
        stream: std::net::TcpStream,
        role: crate::bridge::Role,
        conn: &str,
    ) -> Option<Arc<Bridge>> {
        match crate::stream::tcp_halves(stream) {
            Ok(io) => Bridge::build_stream(self, name, io, None, role, conn),
            Err(e) => {
                warn!("could not prepare tcp stream for '{name}': {e}");
                None
            }
        }
    }

    fn find_bridge(&self, script: &str, arg: &str) -> Option<Arc<Bridge>> {
        plock(&self.bridges)
            .iter()
            .find(|b| b.script() == script && (arg.is_empty() || b.args() == arg))
            .cloned()
    }

    /// Stop listeners and ask every bridge to exit, newest first.
    pub fn cleanup(&self) {
        self.halted.store(true, Ordering::Release);
        let listeners: Vec<ExtListener> = plock(&self.listeners).drain(..).collect();
        for listener in listeners {
            listener.shutdown();
        }
        let bridges: Vec<Arc<Bridge>> = std::mem::take(&mut *plock(&self.bridges));
        for bridge in bridges.iter().rev() {
            bridge.die(true);
        }
        plock(&self.chans).clear();
    }

    pub fn halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    // ---- call.execute ----------------------------------------------

    fn handle_execute(self: &Arc<Self>, msg: &mut Message) -> bool {
        let Some(dest) = msg.get_param("callto").map(str::to_owned) else {
            return false;
        };
        let Some(caps) = callto_regex().captures(&dest) else {
            return false;
        };
        let kind = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        let script = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        let args = caps.get(3).map(|m| m.as_str().trim()).unwrap_or("");

        let data = match kind {
            "nochan" => {
                let Some(bridge) =
                    Bridge::build_script(self, script, args, None, AudioChildFds::default())
                else {
                    return false;
                };
                return crossbar_bus::MessageReceiver::received(&*bridge, msg, 1);
            }
            "nodata" => ChanData::None,
            "play" => ChanData::Read,
            "record" => ChanData::Write,
            "playrec" => ChanData::Both,
            _ => {
                info!(
                    "invalid method '{kind}', use 'nochan', 'nodata', 'play', 'record' or 'playrec'"
                );
                return false;
            }
        };

        let Some(chan) = ExtModChan::build(self, script, args, data) else {
            error!("failed to create ExtMod for '{script}'");
            return false;
        };
        let caller = msg.user_object::<EndpointRef>();
        if caller.is_some() {
            // New peer messages must be held until this one returns.
            chan.set_wait_serial(msg.serial());
        }
        let handled = match chan.receiver() {
            Some(recv) => crossbar_bus::MessageReceiver::received(&*recv, msg, 1),
            None => false,
        };
        if !handled {
            chan.clear_wait();
            if msg.get_param("error").is_some() || msg.get_param("reason").is_some() {
                info!("ExtMod '{script}' did not handle call message");
            } else {
                warn!("ExtMod '{script}' did not handle call message");
            }
            chan.set_waiting(false);
            return false;
        }
        if let Some(caller) = caller {
            chan.clear_wait();
            connect_endpoints(caller.0.clone(), chan.clone() as Arc<dyn CallEndpoint>);
            chan.set_waiting(false);
        }
        true
    }

    // ---- the `external` command ------------------------------------

    /// Execute an `external ...` command line; `None` when the line is
    /// not ours or incomplete.
    pub fn command_execute(self: &Arc<Self>, line: &str) -> Option<String> {
        let rest = line.strip_prefix("external")?;
        if !rest.is_empty() && !rest.starts_with(' ') {
            return None;
        }
        let line = rest.trim();

        if line.is_empty() || line == "info" {
            let detailed = !line.is_empty();
            let mut out = String::new();
            let bridges: Vec<Arc<Bridge>> = plock(&self.bridges).clone();
            for (n, bridge) in bridges.iter().enumerate() {
                out.push_str(&format!("{}. {} {}\r\n", n + 1, bridge.script(), bridge.args()));
                if detailed {
                    bridge.describe(&mut out);
                }
            }
            return Some(out);
        }

        let (word, tail) = match line.split_once(' ') {
            Some((w, t)) => (w, t.trim()),
            None => (line, ""),
        };
        match word {
            "start" | "restart" | "stop" => {
                if tail.is_empty() {
                    return None;
                }
                let (script, arg) = match tail.split_once(' ') {
                    Some((s, a)) => (s, a.trim()),
                    None => (tail, ""),
                };
                let found = self.find_bridge(script, arg);
                match (word, found) {
                    ("start", Some(_)) => Some("External already running\r\n".to_owned()),
                    ("stop", Some(bridge)) => {
                        bridge.set_restart(false);
                        bridge.die(true);
                        Some("External command stopped\r\n".to_owned())
                    }
                    ("stop", None) => Some("External not running\r\n".to_owned()),
                    (_, found) => {
                        // restart (always), or start of a script not yet
                        // running
                        if let Some(bridge) = found {
                            bridge.set_restart(false);
                            bridge.die(true);
                        }
                        Some(if self.start_script(script, arg) {
                            "External start attempt\r\n".to_owned()
                        } else {
                            "External command failed\r\n".to_owned()
                        })
                    }
                }
            }
            "execute" => {
                if tail.is_empty() {
                    return None;
                }
                let (prog, args) = match tail.split_once(' ') {
                    Some((p, a)) => (p, a.trim()),
                    None => (tail, ""),
                };
                let ok = run_program(prog, args, self.exec_printf.load(Ordering::Acquire));
                Some(if ok {
                    "External exec attempt\r\n".to_owned()
                } else {
                    "External exec failed\r\n".to_owned()
                })
            }
            _ => {
                // Bare `external <script> [args]` starts the script.
                let (script, args) = match line.split_once(' ') {
                    Some((s, a)) => (s, a.trim()),
                    None => (line, ""),
                };
                Some(if self.start_script(script, args) {
                    "External start attempt\r\n".to_owned()
                } else {
                    "External command failed\r\n".to_owned()
                })
            }
        }
    }

    /// Command completion for partial `external` lines.
    fn command_complete(&self, msg: &mut Message) -> bool {
        let partline = msg.get_param("partline").unwrap_or("").to_owned();
        let partword = msg.get_param("partword").unwrap_or("").to_owned();
        if partline.is_empty() && partword.is_empty() {
            return false;
        }
        let mut items: Vec<String> = Vec::new();
        if partline.is_empty() {
            items.push("external".to_owned());
        } else if partline == "debug" || partline == "status" {
            items.push("extmodule".to_owned());
        } else if partline == "help" {
            items.push("external".to_owned());
        } else if partline == "external" {
            items.extend(COMMANDS.iter().map(|s| s.to_string()));
        } else if partline == "external restart" || partline == "external stop" {
            let bridges = plock(&self.bridges);
            for bridge in bridges.iter() {
                let script = bridge.script().to_owned();
                if !items.contains(&script) {
                    items.push(script);
                }
            }
        } else if let Some(rest) = partline.strip_prefix("external ") {
            // `external restart <script>` / `external stop <script>`:
            // complete the argument of a known script.
            let (verb, script) = match rest.split_once(' ') {
                Some((v, s)) => (v, s.trim()),
                None => return false,
            };
            if (verb != "restart" && verb != "stop") || script.is_empty() || script.contains(' ') {
                return false;
            }
            let bridges = plock(&self.bridges);
            for bridge in bridges.iter() {
                if bridge.script() != script || bridge.args().is_empty() {
                    continue;
                }
                let arg = bridge.args().to_owned();
                if !items.contains(&arg) {
                    items.push(arg);
                }
            }
        } else {
            return false;
        }
        let full = partline == "external";
        for item in items {
            if item.starts_with(&partword) {
                let ret = msg.retvalue_mut();
                if !ret.is_empty() {
                    ret.push('\t');
                }
                ret.push_str(&item);
            }
        }
        full
    }

    fn status(&self, msg: &mut Message) -> bool {
        let module = msg.get_param("module").unwrap_or("").to_owned();
        if !module.is_empty() && module != "external" {
            return false;
        }
        let line = format!(
            "name=external,type=misc;scripts={},chans={}\r\n",
            self.bridge_count(),
            self.chan_count()
        );
        msg.retvalue_mut().push_str(&line);
        !module.is_empty()
    }
}

// ---- handlers -------------------------------------------------------

struct CalltoHandler {
    module: Weak<ExtModule>,
    priority: u32,
    filter: Option<MessageFilter>,
}

impl MessageHandler for CalltoHandler {
    fn name(&self) -> &str {
        "call.execute"
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    fn filter(&self) -> Option<&MessageFilter> {
        self.filter.as_ref()
    }

    fn received(&self, msg: &mut Message) -> bool {
        match self.module.upgrade() {
            Some(module) => module.handle_execute(msg),
            None => false,
        }
    }
}

struct CommandHandler {
    module: Weak<ExtModule>,
}

impl MessageHandler for CommandHandler {
    fn name(&self) -> &str {
        "engine.command"
    }

    fn received(&self, msg: &mut Message) -> bool {
        let Some(module) = self.module.upgrade() else {
            return false;
        };
        let line = msg.get_param("line").unwrap_or("").to_owned();
        if line.is_empty() {
            return module.command_complete(msg);
        }
        match module.command_execute(&line) {
            Some(result) => {
                msg.retvalue_mut().push_str(&result);
                true
            }
            None => false,
        }
    }
}

struct StatusHandler {
    module: Weak<ExtModule>,
}

impl MessageHandler for StatusHandler {
    fn name(&self) -> &str {
        "engine.status"
    }

    fn priority(&self) -> u32 {
        110
    }

    fn received(&self, msg: &mut Message) -> bool {
        match self.module.upgrade() {
            Some(module) => module.status(msg),
            None => false,
        }
    }
}

struct HelpHandler;

impl MessageHandler for HelpHandler {
    fn name(&self) -> &str {
        "engine.help"
    }

    fn received(&self, msg: &mut Message) -> bool {
        let line = msg.get_param("line").unwrap_or("").to_owned();
        if !line.is_empty() && line != "external" {
            return false;
        }
        msg.retvalue_mut().push_str(HELP_EXTERNAL_CMD);
        if !line.is_empty() {
            msg.retvalue_mut().push_str(HELP_EXTERNAL_INFO);
        }
        !line.is_empty()
    }
}

struct HaltHandler {
    module: Weak<ExtModule>,
    priority: u32,
}

impl MessageHandler for HaltHandler {
    fn name(&self) -> &str {
        "engine.halt"
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    fn received(&self, _msg: &mut Message) -> bool {
        if let Some(module) = self.module.upgrade() {
            module.cleanup();
        }
        false
    }
}
