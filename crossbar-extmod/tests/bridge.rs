// Copyright 2024-Present Crossbar contributors
// SPDX-License-Identifier: Apache-2.0

//! End-to-end bridge tests over socketpairs: the protocol handshake,
//! relay installation and dispatch round trips, setlocal, reentrance,
//! watchers, timeouts, buffer overflow and teardown.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbar_bus::{Engine, Message, MessageReceiver, WireMessage};
use crossbar_core::config::Configuration;
use crossbar_extmod::{Bridge, ExtModule, Role};

struct Peer {
    writer: UnixStream,
    reader: BufReader<UnixStream>,
}

impl Peer {
    fn new(stream: UnixStream) -> Peer {
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let writer = stream.try_clone().unwrap();
        Peer {
            writer,
            reader: BufReader::new(stream),
        }
    }

    fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).unwrap();
        self.writer.write_all(b"\n").unwrap();
    }

    fn read_line(&mut self) -> String {
        let mut s = String::new();
        let n = self.reader.read_line(&mut s).expect("peer read");
        assert!(n > 0, "peer saw EOF while expecting a line");
        s.trim_end().to_owned()
    }

    /// None on timeout or EOF.
    fn try_read_line(&mut self) -> Option<String> {
        let mut s = String::new();
        match self.reader.read_line(&mut s) {
            Ok(0) => None,
            Ok(_) => Some(s.trim_end().to_owned()),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                None
            }
            Err(e) => panic!("peer read error: {e}"),
        }
    }
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn setup() -> (Arc<Engine>, Arc<ExtModule>, Arc<Bridge>, Peer) {
    init_logging();
    let engine = Engine::start(2);
    let module = ExtModule::create(engine.clone());
    module.initialize(&Configuration::new());
    let (ours, theirs) = UnixStream::pair().unwrap();
    let bridge = module
        .adopt_unix_stream("test", ours, Role::Unknown, "pair")
        .expect("bridge");
    (engine, module, bridge, Peer::new(theirs))
}

fn wait_until(mut cond: impl FnMut() -> bool, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn connect_install_dispatch_reply() {
    let (engine, _module, _bridge, mut peer) = setup();
    peer.send("%%>connect:global");
    peer.send("%%>install:50:engine.timer");
    assert_eq!(peer.read_line(), "%%<install:50:engine.timer:true");

    let eng = engine.clone();
    let dispatcher = std::thread::spawn(move || {
        let mut msg = Message::new_at("engine.timer", 0);
        msg.append("time", "1700000000");
        let handled = eng.dispatch(&mut msg);
        (handled, msg)
    });

    let line = peer.read_line();
    let wire = WireMessage::parse(&line).unwrap();
    assert_eq!(wire.name, "engine.timer");
    assert_eq!(
        wire.params,
        vec![("time".to_owned(), "1700000000".to_owned())]
    );
    peer.send(&format!(
        "%%<message:{}:true:engine.timer:ok:time=1700000000",
        wire.id
    ));

    let (handled, msg) = dispatcher.join().unwrap();
    assert!(handled);
    assert_eq!(msg.retvalue(), "ok");
    assert_eq!(msg.get_param("time"), Some("1700000000"));
    engine.shutdown();
}

#[test]
fn duplicate_install_is_rejected() {
    let (engine, _module, _bridge, mut peer) = setup();
    peer.send("%%>connect:global");
    peer.send("%%>install:50:engine.timer");
    assert_eq!(peer.read_line(), "%%<install:50:engine.timer:true");
    peer.send("%%>install:50:engine.timer");
    assert_eq!(peer.read_line(), "%%<install:50:engine.timer:false");
    engine.shutdown();
}

#[test]
fn setlocal_timeout_applies_and_pending_is_cleared() {
    let (engine, _module, _bridge, mut peer) = setup();
    peer.send("%%>connect:global");
    peer.send("%%>install:50:test.timeout");
    assert_eq!(peer.read_line(), "%%<install:50:test.timeout:true");
    peer.send("%%>setlocal:timeout:500");
    assert_eq!(peer.read_line(), "%%<setlocal:timeout:500:true");

    let eng = engine.clone();
    let dispatcher = std::thread::spawn(move || {
        let start = Instant::now();
        let mut msg = Message::new("test.timeout");
        let handled = eng.dispatch(&mut msg);
        (handled, start.elapsed())
    });

    let line = peer.read_line();
    let wire = WireMessage::parse(&line).unwrap();
    assert_eq!(wire.name, "test.timeout");
    // Never reply; the dispatcher must give up after ~500 ms.
    let (handled, elapsed) = dispatcher.join().unwrap();
    assert!(!handled);
    assert!(
        elapsed >= Duration::from_millis(400) && elapsed <= Duration::from_millis(2000),
        "timeout took {elapsed:?}"
    );

    // The pending entry is gone: a late reply is taken as a fresh
    // peer message and acknowledged as unhandled.
    peer.send(&format!("%%<message:{}:0:test.timeout", wire.id));
    let ack = WireMessage::parse(&peer.read_line()).unwrap();
    assert_eq!(ack.id, wire.id);
    assert!(!ack.handled());
    engine.shutdown();
}

#[test]
fn quit_closes_without_restart() {
    let (engine, module, bridge, mut peer) = setup();
    peer.send("%%>connect:global");
    peer.send("%%>quit");
    assert_eq!(peer.read_line(), "%%<quit");
    // Our side closes; the peer observes EOF.
    let mut rest = String::new();
    wait_until(
        || match peer.reader.read_line(&mut rest) {
            Ok(0) => true,
            Ok(_) => false,
            Err(_) => false,
        },
        "EOF from closed bridge",
    );
    wait_until(|| bridge.dead(), "bridge death");
    wait_until(|| module.bridge_count() == 0, "registry cleanup");
    engine.shutdown();
}

#[test]
fn reentrance_skips_own_relay_unless_enabled() {
    let (engine, _module, _bridge, mut peer) = setup();
    peer.send("%%>connect:global");
    peer.send("%%>install:50:test.event");
    assert_eq!(peer.read_line(), "%%<install:50:test.event:true");

    // A message our own peer originates is not relayed back to it: the
    // only line coming back is the acknowledgment.
    peer.send("%%<message:req1:0:test.event::x=1");
    let ack = WireMessage::parse(&peer.read_line()).unwrap();
    assert_eq!(ack.id, "req1");
    assert!(!ack.handled());

    peer.send("%%>setlocal:reenter:true");
    assert_eq!(peer.read_line(), "%%<setlocal:reenter:true:true");

    peer.send("%%<message:req2:0:test.event::x=2");
    let request = WireMessage::parse(&peer.read_line()).unwrap();
    assert_ne!(request.id, "req2");
    assert_eq!(request.name, "test.event");
    assert_eq!(request.params, vec![("x".to_owned(), "2".to_owned())]);
    peer.send(&format!("%%<message:{}:true:test.event:done", request.id));
    let ack = WireMessage::parse(&peer.read_line()).unwrap();
    assert_eq!(ack.id, "req2");
    assert!(ack.handled());
    assert_eq!(ack.retvalue, "done");
    engine.shutdown();
}

#[test]
fn watcher_mirrors_all_dispatches_and_is_read_only() {
    let (engine, _module, bridge, mut peer) = setup();
    peer.send("%%>connect:global");
    peer.send("%%>watch:");
    assert_eq!(peer.read_line(), "%%<watch::true");

    let mut msg = Message::new("call.route");
    msg.append("name", "alice");
    let handled = engine.dispatch(&mut msg);
    assert!(!handled);

    let mirror = WireMessage::parse(&peer.read_line()).unwrap();
    assert_eq!(mirror.id, "");
    assert!(!mirror.handled());
    assert_eq!(mirror.name, "call.route");
    assert!(mirror
        .params
        .contains(&("name".to_owned(), "alice".to_owned())));

    // Watchers are read-only: replying to the mirror does nothing.
    peer.send("%%<message::true:call.route");
    std::thread::sleep(Duration::from_millis(100));
    assert!(!bridge.dead());
    assert!(peer.try_read_line().is_none());
    engine.shutdown();
}

#[test]
fn watcher_by_name_only_matches_that_name() {
    let (engine, _module, _bridge, mut peer) = setup();
    peer.send("%%>connect:global");
    peer.send("%%>watch:call.route");
    assert_eq!(peer.read_line(), "%%<watch:call.route:true");

    engine.dispatch(&mut Message::new("engine.timer"));
    engine.dispatch(&mut Message::new("call.route"));
    let mirror = WireMessage::parse(&peer.read_line()).unwrap();
    assert_eq!(mirror.name, "call.route");

    peer.send("%%>unwatch:call.route");
    assert_eq!(peer.read_line(), "%%<unwatch:call.route:true");
    engine.dispatch(&mut Message::new("call.route"));
    assert!(peer.try_read_line().is_none());
    engine.shutdown();
}

#[test]
fn die_is_idempotent_and_final() {
    let (engine, module, bridge, mut peer) = setup();
    peer.send("%%>connect:global");
    peer.send("%%>install:50:test.die");
    assert_eq!(peer.read_line(), "%%<install:50:test.die:true");

    let mut workers = Vec::new();
    for _ in 0..8 {
        let b = bridge.clone();
        workers.push(std::thread::spawn(move || b.die(true)));
    }
    for w in workers {
        w.join().unwrap();
    }
    assert!(bridge.dead());
    assert_eq!(module.bridge_count(), 0);

    // Every subsequent delivery fails immediately.
    let start = Instant::now();
    let mut msg = Message::new("test.die");
    assert!(!MessageReceiver::received(&*bridge, &mut msg, 0));
    assert!(start.elapsed() < Duration::from_secs(1));
    engine.shutdown();
}

#[test]
fn buffer_overflow_is_fatal() {
    let (engine, _module, bridge, mut peer) = setup();
    peer.send("%%>connect:global");
    peer.send("%%>setlocal:bufsize:2048");
    assert_eq!(peer.read_line(), "%%<setlocal:bufsize:2048:true");

    let blob = vec![b'a'; 2049];
    peer.writer.write_all(&blob).unwrap();
    wait_until(|| bridge.dead(), "overflow to kill the bridge");
    engine.shutdown();
}

#[test]
fn bad_role_terminates_connection() {
    let (engine, module, bridge, mut peer) = setup();
    peer.send("%%>connect:sideways");
    wait_until(|| bridge.dead(), "bad role to kill the bridge");
    wait_until(|| module.bridge_count() == 0, "registry cleanup");
    engine.shutdown();
}

#[test]
fn malformed_lines_are_reported_but_not_fatal() {
    let (engine, _module, bridge, mut peer) = setup();
    peer.send("%%>connect:global");
    peer.send("whatever this is");
    assert_eq!(peer.read_line(), "Error in: whatever this is");
    assert!(!bridge.dead());
    engine.shutdown();
}

#[test]
fn setlocal_queries_engine_facts() {
    let (engine, _module, _bridge, mut peer) = setup();
    engine.set_run_param("version", "7.1");
    let mut cfg = Configuration::new();
    cfg.create_section("modules").append("autoload", "yes");
    engine.set_config(cfg);

    peer.send("%%>connect:global");
    peer.send("%%>setlocal:engine.version:");
    assert_eq!(peer.read_line(), "%%<setlocal:engine.version:7.1:true");
    peer.send("%%>setlocal:engine.missing:");
    assert_eq!(peer.read_line(), "%%<setlocal:engine.missing::false");
    peer.send("%%>setlocal:config.modules.autoload:");
    assert_eq!(
        peer.read_line(),
        "%%<setlocal:config.modules.autoload:yes:true"
    );
    peer.send("%%>setlocal:config.modules:");
    assert_eq!(peer.read_line(), "%%<setlocal:config.modules::true");
    peer.send("%%>setlocal:config.nothere:");
    assert_eq!(peer.read_line(), "%%<setlocal:config.nothere::false");
    peer.send("%%>setlocal:loaded.extmodule:");
    assert_eq!(peer.read_line(), "%%<setlocal:loaded.extmodule:true:true");
    peer.send("%%>setlocal:runid:");
    let line = peer.read_line();
    assert!(line.starts_with("%%<setlocal:runid:"));
    assert!(line.ends_with(":true"));
    engine.shutdown();
}

#[test]
fn uninstall_reports_actual_priority() {
    let (engine, _module, _bridge, mut peer) = setup();
    peer.send("%%>connect:global");
    peer.send("%%>install:37:test.prio");
    assert_eq!(peer.read_line(), "%%<install:37:test.prio:true");
    peer.send("%%>uninstall:test.prio");
    assert_eq!(peer.read_line(), "%%<uninstall:37:test.prio:true");
    peer.send("%%>uninstall:test.prio");
    assert_eq!(peer.read_line(), "%%<uninstall:0:test.prio:false");
    // After uninstalling, dispatches no longer reach the peer.
    let mut msg = Message::new("test.prio");
    assert!(!engine.dispatch(&mut msg));
    assert!(peer.try_read_line().is_none());
    engine.shutdown();
}

#[test]
fn spawned_script_lifecycle() {
    use std::os::unix::fs::PermissionsExt;
    let engine = Engine::start(1);
    let module = ExtModule::create(engine.clone());
    module.initialize(&Configuration::new());

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hello.sh");
    std::fs::write(
        &path,
        "#!/bin/sh\necho '%%>setlocal:restart:false'\nread l1\necho '%%>quit'\nread l2\nexit 0\n",
    )
    .unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

    assert!(module.start_script(path.to_str().unwrap(), ""));
    // The script quits on its own; the bridge reaps it and unregisters.
    wait_until(|| module.bridge_count() == 0, "script to finish");
    engine.shutdown();
}

#[test]
fn spawn_failure_never_registers() {
    let engine = Engine::start(1);
    let module = ExtModule::create(engine.clone());
    module.initialize(&Configuration::new());
    assert!(!module.start_script("/nonexistent/script.sh", ""));
    assert_eq!(module.bridge_count(), 0);
    assert_eq!(
        module.command_execute("external stop /nonexistent/script.sh"),
        Some("External not running\r\n".to_owned())
    );
    engine.shutdown();
}

#[test]
fn unix_listener_accepts_peers() {
    let engine = Engine::start(1);
    let module = ExtModule::create(engine.clone());
    let dir = tempfile::tempdir().unwrap();
    let sock = dir.path().join("ext.sock");

    let mut cfg = Configuration::new();
    {
        let sect = cfg.create_section("listener ext");
        sect.append("type", "unix");
        sect.append("path", sock.to_str().unwrap());
        sect.append("role", "global");
    }
    module.initialize(&cfg);

    let stream = UnixStream::connect(&sock).unwrap();
    let mut peer = Peer::new(stream);
    // Role came from the listener config: no connect handshake needed.
    peer.send("%%>install:42:listener.test");
    assert_eq!(peer.read_line(), "%%<install:42:listener.test:true");
    wait_until(|| module.bridge_count() == 1, "bridge registration");

    module.cleanup();
    assert_eq!(module.bridge_count(), 0);
    engine.shutdown();
}

#[test]
fn command_status_help_handlers() {
    let engine = Engine::start(1);
    let module = ExtModule::create(engine.clone());
    module.initialize(&Configuration::new());

    let mut msg = Message::new("engine.command");
    msg.append("line", "external");
    assert!(engine.dispatch(&mut msg));
    assert_eq!(msg.retvalue(), "");

    let mut msg = Message::new("engine.command");
    msg.append("partline", "external");
    msg.append("partword", "st");
    engine.dispatch(&mut msg);
    assert_eq!(msg.retvalue(), "start\tstop");

    let mut msg = Message::new("engine.status");
    msg.append("module", "external");
    assert!(engine.dispatch(&mut msg));
    assert!(msg
        .retvalue()
        .starts_with("name=external,type=misc;scripts=0,chans=0"));

    let mut msg = Message::new("engine.help");
    msg.append("line", "external");
    assert!(engine.dispatch(&mut msg));
    assert!(msg.retvalue().contains("external [info]"));

    assert!(module.command_execute("status").is_none());
    engine.shutdown();
}
