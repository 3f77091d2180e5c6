// Copyright 2024-Present Crossbar contributors
// SPDX-License-Identifier: Apache-2.0

//! The bus engine: prioritised synchronous dispatch, queued dispatch on
//! worker threads, post-dispatch hooks, and the handful of process-level
//! facts (run parameters, run id, loaded modules, configuration) that
//! peers may query through `setlocal`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use rand::Rng;
use tracing::{debug, error, info, warn};

use crossbar_core::config::Configuration;
use crossbar_core::namedlist::NamedList;
use crossbar_core::sync::plock;

use crate::handler::{MessageHandler, MessagePostHook};
use crate::message::Message;

/// Completion callback of a queued dispatch.
pub type EnqueueNotify = Box<dyn FnOnce(&Message, bool) + Send>;

struct Queued {
    msg: Message,
    notify: Option<EnqueueNotify>,
}

type AlarmHook = Box<dyn Fn(&str, &str) + Send + Sync>;

pub struct Engine {
    handlers: RwLock<Vec<Arc<dyn MessageHandler>>>,
    hooks: RwLock<Vec<Arc<dyn MessagePostHook>>>,
    queue: Mutex<Option<mpsc::Sender<Queued>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    exiting: AtomicBool,
    run_params: RwLock<NamedList>,
    run_id: u64,
    config: RwLock<Configuration>,
    modules: RwLock<Vec<String>>,
    alarm_hook: RwLock<Option<AlarmHook>>,
}

impl Engine {
    /// Build the engine and start `workers` queue threads (at least one).
    pub fn start(workers: usize) -> Arc<Engine> {
        let (tx, rx) = mpsc::channel::<Queued>();
        let engine = Arc::new(Engine {
            handlers: RwLock::new(Vec::new()),
            hooks: RwLock::new(Vec::new()),
            queue: Mutex::new(Some(tx)),
            workers: Mutex::new(Vec::new()),
            exiting: AtomicBool::new(false),
            run_params: RwLock::new(NamedList::new("engine")),
            run_id: rand::thread_rng().gen(),
            config: RwLock::new(Configuration::new()),
            modules: RwLock::new(Vec::new()),
            alarm_hook: RwLock::new(None),
        });
        let rx = Arc::new(Mutex::new(rx));
        let mut handles = plock(&engine.workers);
        for n in 0..workers.max(1) {
            let engine = engine.clone();
            let rx = rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("Engine Worker {n}"))
                .spawn(move || loop {
                    let queued = {
                        let rx = plock(&rx);
                        rx.recv()
                    };
                    let Ok(mut queued) = queued else {
                        return;
                    };
                    let handled = engine.dispatch(&mut queued.msg);
                    if let Some(notify) = queued.notify.take() {
                        notify(&queued.msg, handled);
                    }
                });
            match handle {
                Ok(h) => handles.push(h),
                Err(e) => error!("failed to start engine worker: {e}"),
            }
        }
        drop(handles);
        engine
    }

    /// Register a handler; dispatch order is ascending priority, ties
    /// kept in installation order.
    pub fn install(&self, handler: Arc<dyn MessageHandler>) {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        let pos = handlers.partition_point(|h| h.priority() <= handler.priority());
        debug!(
            name = handler.name(),
            priority = handler.priority(),
            "installing handler"
        );
        handlers.insert(pos, handler);
    }

    /// Remove a handler by identity. In-flight dispatches finish with
    /// their own reference.
    pub fn uninstall(&self, handler: &Arc<dyn MessageHandler>) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        let before = handlers.len();
        handlers.retain(|h| !Arc::ptr_eq(h, handler));
        before != handlers.len()
    }

    pub fn set_hook(&self, hook: Arc<dyn MessagePostHook>) {
        let mut hooks = self.hooks.write().unwrap_or_else(|e| e.into_inner());
        hooks.push(hook);
    }

    pub fn remove_hook(&self, hook: &Arc<dyn MessagePostHook>) -> bool {
        let mut hooks = self.hooks.write().unwrap_or_else(|e| e.into_inner());
        let before = hooks.len();
        hooks.retain(|h| !Arc::ptr_eq(h, hook));
        before != hooks.len()
    }

    /// Synchronous dispatch. Stops at the first handler returning true
    /// unless the message is flagged broadcast; post hooks always run,
    /// on the dispatching thread.
    pub fn dispatch(&self, msg: &mut Message) -> bool {
        let matching: Vec<Arc<dyn MessageHandler>> = {
            let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            handlers
                .iter()
                .filter(|h| h.name().is_empty() || h.name() == msg.name())
                .cloned()
                .collect()
        };
        let mut handled = false;
        for handler in matching {
            if let Some(filter) = handler.filter() {
                if !filter.matches(msg) {
                    continue;
                }
            }
            let track = handler.track_name();
            if !track.is_empty() {
                let entry = format!("{}:{}", track, handler.priority());
                let merged = match msg.get_param("handlers") {
                    Some(prev) if !prev.is_empty() => format!("{prev},{entry}"),
                    _ => entry,
                };
                msg.set_param("handlers", merged, false);
            }
            if handler.received(msg) {
                handled = true;
                if !msg.broadcast() {
                    break;
                }
            }
        }
        msg.set_accepted(handled);
        let hooks: Vec<Arc<dyn MessagePostHook>> = {
            let hooks = self.hooks.read().unwrap_or_else(|e| e.into_inner());
            hooks.clone()
        };
        for hook in hooks {
            hook.dispatched(msg, handled);
        }
        handled
    }

    /// Queue a message for dispatch on a worker thread.
    pub fn enqueue(&self, msg: Message) -> bool {
        self.enqueue_opt(msg, None)
    }

    /// Queue a message and run `notify` with the dispatched message and
    /// its outcome once the worker is done with it.
    pub fn enqueue_notify(&self, msg: Message, notify: EnqueueNotify) -> bool {
        self.enqueue_opt(msg, Some(notify))
    }

    fn enqueue_opt(&self, msg: Message, notify: Option<EnqueueNotify>) -> bool {
        let queue = plock(&self.queue);
        match queue.as_ref() {
            Some(tx) => tx.send(Queued { msg, notify }).is_ok(),
            None => {
                warn!("enqueue after shutdown dropped");
                false
            }
        }
    }

    pub fn exiting(&self) -> bool {
        self.exiting.load(Ordering::Acquire)
    }

    pub fn set_exiting(&self) {
        self.exiting.store(true, Ordering::Release);
    }

    /// Stop accepting queued messages, drain the workers and join them.
    pub fn shutdown(&self) {
        self.set_exiting();
        plock(&self.queue).take();
        let handles: Vec<_> = plock(&self.workers).drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Console-style output channel (peer `%%>output` lands here).
    pub fn output(&self, text: &str) {
        info!(target: "crossbar::output", "{text}");
    }

    /// Raise an alarm; forwarded to the single installed hook.
    pub fn alarm(&self, component: &str, text: &str) {
        error!(target: "crossbar::alarm", component, "{text}");
        let hook = self.alarm_hook.read().unwrap_or_else(|e| e.into_inner());
        if let Some(hook) = hook.as_ref() {
            hook(component, text);
        }
    }

    pub fn set_alarm_hook(&self, hook: AlarmHook) {
        *self.alarm_hook.write().unwrap_or_else(|e| e.into_inner()) = Some(hook);
    }

    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    pub fn run_param(&self, name: &str) -> Option<String> {
        let params = self.run_params.read().unwrap_or_else(|e| e.into_inner());
        params.get_param(name).map(str::to_owned)
    }

    pub fn set_run_param(&self, name: &str, value: &str) {
        let mut params = self.run_params.write().unwrap_or_else(|e| e.into_inner());
        params.set_param(name, value, true);
    }

    /// Substitute run parameters into `text` (`${name}` form).
    pub fn replace_run_params(&self, text: &str) -> String {
        let params = self.run_params.read().unwrap_or_else(|e| e.into_inner());
        match params.replace_params(text, false) {
            Ok((out, _)) => out,
            Err(e) => {
                warn!("bad parameter reference in '{text}': {e}");
                text.to_owned()
            }
        }
    }

    pub fn set_config(&self, config: Configuration) {
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = config;
    }

    pub fn config_value(&self, sect: &str, key: &str) -> Option<String> {
        let config = self.config.read().unwrap_or_else(|e| e.into_inner());
        config.section(sect).and_then(|s| s.get_param(key)).map(str::to_owned)
    }

    pub fn config_has_section(&self, sect: &str) -> bool {
        let config = self.config.read().unwrap_or_else(|e| e.into_inner());
        config.section(sect).is_some()
    }

    /// Record a loaded module name (backs `setlocal loaded.<name>`).
    pub fn register_module(&self, name: &str) {
        let mut modules = self.modules.write().unwrap_or_else(|e| e.into_inner());
        if !modules.iter().any(|m| m == name) {
            modules.push(name.to_owned());
        }
    }

    pub fn module_loaded(&self, name: &str) -> bool {
        let modules = self.modules.read().unwrap_or_else(|e| e.into_inner());
        modules.iter().any(|m| m == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::MessageFilter;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Probe {
        name: &'static str,
        priority: u32,
        filter: Option<MessageFilter>,
        hits: Arc<Mutex<Vec<&'static str>>>,
        label: &'static str,
        answer: bool,
    }

    impl MessageHandler for Probe {
        fn name(&self) -> &str {
            self.name
        }
        fn priority(&self) -> u32 {
            self.priority
        }
        fn filter(&self) -> Option<&MessageFilter> {
            self.filter.as_ref()
        }
        fn received(&self, _msg: &mut Message) -> bool {
            plock(&self.hits).push(self.label);
            self.answer
        }
    }

    fn probe(
        name: &'static str,
        priority: u32,
        label: &'static str,
        answer: bool,
        hits: &Arc<Mutex<Vec<&'static str>>>,
    ) -> Arc<dyn MessageHandler> {
        Arc::new(Probe {
            name,
            priority,
            filter: None,
            hits: hits.clone(),
            label,
            answer,
        })
    }

    #[test]
    fn dispatch_orders_by_priority_stably() {
        let engine = Engine::start(1);
        let hits = Arc::new(Mutex::new(Vec::new()));
        engine.install(probe("t", 100, "b1", false, &hits));
        engine.install(probe("t", 50, "a", false, &hits));
        engine.install(probe("t", 100, "b2", false, &hits));
        engine.install(probe("other", 10, "x", false, &hits));
        let mut m = Message::new("t");
        assert!(!engine.dispatch(&mut m));
        assert_eq!(*plock(&hits), ["a", "b1", "b2"]);
        engine.shutdown();
    }

    #[test]
    fn dispatch_stops_at_first_true_unless_broadcast() {
        let engine = Engine::start(1);
        let hits = Arc::new(Mutex::new(Vec::new()));
        engine.install(probe("t", 10, "first", true, &hits));
        engine.install(probe("t", 20, "second", true, &hits));
        let mut m = Message::new("t");
        assert!(engine.dispatch(&mut m));
        assert!(m.accepted());
        assert_eq!(*plock(&hits), ["first"]);

        plock(&hits).clear();
        let mut m = Message::new("t");
        m.set_broadcast(true);
        assert!(engine.dispatch(&mut m));
        assert_eq!(*plock(&hits), ["first", "second"]);
        engine.shutdown();
    }

    #[test]
    fn empty_name_matches_everything() {
        let engine = Engine::start(1);
        let hits = Arc::new(Mutex::new(Vec::new()));
        engine.install(probe("", 10, "wild", false, &hits));
        let mut m = Message::new("anything.at.all");
        engine.dispatch(&mut m);
        assert_eq!(*plock(&hits), ["wild"]);
        engine.shutdown();
    }

    #[test]
    fn uninstall_removes() {
        let engine = Engine::start(1);
        let hits = Arc::new(Mutex::new(Vec::new()));
        let h = probe("t", 10, "h", true, &hits);
        engine.install(h.clone());
        assert!(engine.uninstall(&h));
        assert!(!engine.uninstall(&h));
        let mut m = Message::new("t");
        assert!(!engine.dispatch(&mut m));
        engine.shutdown();
    }

    #[test]
    fn hooks_see_every_dispatch() {
        struct Hook(AtomicUsize, AtomicUsize);
        impl MessagePostHook for Hook {
            fn dispatched(&self, _msg: &Message, handled: bool) {
                self.0.fetch_add(1, Ordering::SeqCst);
                if handled {
                    self.1.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
        let engine = Engine::start(1);
        let hits = Arc::new(Mutex::new(Vec::new()));
        engine.install(probe("t", 10, "h", true, &hits));
        let hook = Arc::new(Hook(AtomicUsize::new(0), AtomicUsize::new(0)));
        let as_hook: Arc<dyn MessagePostHook> = hook.clone();
        engine.set_hook(as_hook.clone());
        engine.dispatch(&mut Message::new("t"));
        engine.dispatch(&mut Message::new("miss"));
        assert_eq!(hook.0.load(Ordering::SeqCst), 2);
        assert_eq!(hook.1.load(Ordering::SeqCst), 1);
        assert!(engine.remove_hook(&as_hook));
        engine.dispatch(&mut Message::new("t"));
        assert_eq!(hook.0.load(Ordering::SeqCst), 2);
        engine.shutdown();
    }

    #[test]
    fn enqueue_dispatches_and_notifies() {
        let engine = Engine::start(2);
        let hits = Arc::new(Mutex::new(Vec::new()));
        engine.install(probe("q", 10, "q", true, &hits));
        let (tx, rx) = mpsc::channel();
        let msg = Message::new("q");
        assert!(engine.enqueue_notify(
            msg,
            Box::new(move |m, handled| {
                let _ = tx.send((m.name().to_owned(), handled));
            })
        ));
        let (name, handled) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name, "q");
        assert!(handled);
        engine.shutdown();
    }

    #[test]
    fn run_params_and_modules() {
        let engine = Engine::start(1);
        engine.set_run_param("sharedpath", "/usr/share");
        assert_eq!(engine.run_param("sharedpath").as_deref(), Some("/usr/share"));
        assert_eq!(
            engine.replace_run_params("${sharedpath}/scripts"),
            "/usr/share/scripts"
        );
        engine.register_module("extmodule");
        assert!(engine.module_loaded("extmodule"));
        assert!(!engine.module_loaded("other"));
        engine.shutdown();
    }
}
