// Copyright 2024-Present Crossbar contributors
// SPDX-License-Identifier: Apache-2.0

//! Channel endpoints bound to bridges, and the audio pipes a channel
//! script talks through.
//!
//! The endpoint model here is the minimum the bridge needs: two
//! endpoints can be connected as peers, and disconnecting notifies the
//! other side. Richer call control lives in the telephony modules.

use std::any::Any;
use std::fs::File;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crossbar_bus::{Engine, Message};
use crossbar_core::datablock::DataBlock;
use crossbar_core::sync::plock;

use crate::bridge::Bridge;
use crate::module::ExtModule;
use crate::spawn::{cloexec_pipe, fd_file, AudioChildFds};

/// Minimal call endpoint: an id, a peer slot and a disconnect
/// notification.
pub trait CallEndpoint: Any + Send + Sync {
    fn endpoint_id(&self) -> String;
    fn peer(&self) -> Option<Arc<dyn CallEndpoint>>;
    fn set_peer_slot(&self, peer: Option<Arc<dyn CallEndpoint>>);
    /// Invoked after the peer link was torn down.
    fn disconnected(&self, reason: &str);
}

/// Typed wrapper so an endpoint can travel as message user data.
pub struct EndpointRef(pub Arc<dyn CallEndpoint>);

/// Link two endpoints as peers.
pub fn connect_endpoints(a: Arc<dyn CallEndpoint>, b: Arc<dyn CallEndpoint>) {
    a.set_peer_slot(Some(b.clone()));
    b.set_peer_slot(Some(a));
}

/// Tear down an endpoint's peer link (if any) and notify both sides.
pub fn disconnect_endpoint(ep: &Arc<dyn CallEndpoint>, reason: &str) {
    if let Some(peer) = ep.peer() {
        ep.set_peer_slot(None);
        peer.set_peer_slot(None);
        peer.disconnected(reason);
    }
    ep.disconnected(reason);
}

/// Data handling requested through the `callto` target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChanData {
    None,
    Read,
    Write,
    Both,
}

static CHAN_SEQ: AtomicU64 = AtomicU64::new(1);

type AudioSinkFn = Box<dyn FnMut(&[u8], u64) + Send>;

pub struct ExtModChan {
    id: Mutex<String>,
    engine: Arc<Engine>,
    module: Weak<ExtModule>,
    recv: Mutex<Weak<Bridge>>,
    peer: Mutex<Option<Arc<dyn CallEndpoint>>>,
    wait_serial: AtomicU64,
    waiting: AtomicBool,
    running: AtomicBool,
    disconn: AtomicBool,
    consumer: Mutex<Option<ExtModConsumer>>,
    audio_sink: Arc<Mutex<Option<AudioSinkFn>>>,
}

impl ExtModChan {
    fn new(engine: Arc<Engine>, module: Weak<ExtModule>) -> Arc<ExtModChan> {
        let id = format!("external/{}", CHAN_SEQ.fetch_add(1, Ordering::Relaxed));
        debug!("ExtModChan '{id}' created");
        Arc::new(ExtModChan {
            id: Mutex::new(id),
            engine,
            module,
            recv: Mutex::new(Weak::new()),
            peer: Mutex::new(None),
            wait_serial: AtomicU64::new(0),
            waiting: AtomicBool::new(false),
            running: AtomicBool::new(false),
            disconn: AtomicBool::new(false),
            consumer: Mutex::new(None),
            audio_sink: Arc::new(Mutex::new(None)),
        })
    }

    /// Channel bound to an already running bridge (lazy creation on the
    /// first `call.execute` a channel peer originates).
    pub(crate) fn new_bound(
        module: &Arc<ExtModule>,
        bridge: &Arc<Bridge>,
    ) -> Arc<ExtModChan> {
        let chan = ExtModChan::new(module.engine().clone(), Arc::downgrade(module));
        chan.set_receiver(Some(bridge));
        module.register_chan(&chan);
        chan
    }

    /// Spawn `file` as a channel script with audio pipes per `data`.
    /// Returns the channel with its bridge attached, or nothing when the
    /// spawn failed.
    pub(crate) fn build(
        module: &Arc<ExtModule>,
        file: &str,
        args: &str,
        data: ChanData,
    ) -> Option<Arc<ExtModChan>> {
        let chan = ExtModChan::new(module.engine().clone(), Arc::downgrade(module));
        let mut audio = AudioChildFds::default();

        if matches!(data, ChanData::Write | ChanData::Both) {
            match cloexec_pipe() {
                Ok((read, write)) => {
                    audio.to_child = Some(read);
                    *plock(&chan.consumer) = Some(ExtModConsumer::new(fd_file(write)));
                }
                Err(e) => warn!("unable to create engine-to-child audio pipe: {e}"),
            }
        }
        if matches!(data, ChanData::Read | ChanData::Both) {
            match cloexec_pipe() {
                Ok((read, write)) => {
                    audio.from_child = Some(write);
                    chan.start_source(fd_file(read));
                }
                Err(e) => warn!("unable to create child-to-engine audio pipe: {e}"),
            }
        }

        module.register_chan(&chan);
        let bridge = Bridge::build_script(module, file, args, Some(chan.clone()), audio)?;
        chan.set_receiver(Some(&bridge));
        Some(chan)
    }

    pub fn id(&self) -> String {
        plock(&self.id).clone()
    }

    pub fn set_id(&self, id: &str) {
        *plock(&self.id) = id.to_owned();
    }

    pub(crate) fn receiver(&self) -> Option<Arc<Bridge>> {
        plock(&self.recv).upgrade()
    }

    pub(crate) fn set_receiver(&self, bridge: Option<&Arc<Bridge>>) {
        *plock(&self.recv) = match bridge {
            Some(b) => Arc::downgrade(b),
            None => Weak::new(),
        };
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub fn disconn(&self) -> bool {
        self.disconn.load(Ordering::Acquire)
    }

    pub fn set_disconn(&self, disconn: bool) {
        self.disconn.store(disconn, Ordering::Release);
    }

    pub fn waiting(&self) -> bool {
        self.waiting.load(Ordering::Acquire)
    }

    pub fn set_waiting(&self, waiting: bool) {
        self.waiting.store(waiting, Ordering::Release);
    }

    /// Serial of the message whose reply flips this channel into the
    /// waiting state; 0 for none.
    pub fn wait_serial(&self) -> u64 {
        self.wait_serial.load(Ordering::Acquire)
    }

    pub fn set_wait_serial(&self, serial: u64) {
        self.wait_serial.store(serial, Ordering::Release);
    }

    pub fn clear_wait(&self) {
        self.wait_serial.store(0, Ordering::Release);
    }

    /// Install the consumer of child-originated audio.
    pub fn set_audio_sink(&self, sink: AudioSinkFn) {
        *plock(&self.audio_sink) = Some(sink);
    }

    /// Feed engine-side audio toward the child (the channel's sink).
    pub fn consume_audio(&self, data: &DataBlock) -> bool {
        let mut consumer = plock(&self.consumer);
        match consumer.as_mut() {
            Some(c) => c.consume(data),
            None => false,
        }
    }

    fn start_source(self: &Arc<Self>, file: File) {
        self.set_running(true);
        let chan = self.clone();
        let sink = self.audio_sink.clone();
        let res = std::thread::Builder::new()
            .name("ExtMod Source".into())
            .spawn(move || source_loop(file, &chan, &sink));
        if res.is_err() {
            warn!("failed to start audio source thread");
            self.set_running(false);
        }
    }

    /// Tear down the peer link with `reason`.
    pub(crate) fn disconnect(self: &Arc<Self>, reason: &str) {
        let ep: Arc<dyn CallEndpoint> = self.clone();
        disconnect_endpoint(&ep, reason);
    }
}

impl CallEndpoint for ExtModChan {
    fn endpoint_id(&self) -> String {
        self.id()
    }

    fn peer(&self) -> Option<Arc<dyn CallEndpoint>> {
        plock(&self.peer).clone()
    }

    fn set_peer_slot(&self, peer: Option<Arc<dyn CallEndpoint>>) {
        *plock(&self.peer) = peer;
    }

    fn disconnected(&self, reason: &str) {
        debug!("ExtModChan '{}' disconnected '{reason}'", self.id());
        if self.engine.exiting() || !self.disconn() {
            return;
        }
        let mut m = Message::new("chan.disconnected");
        m.append("id", self.id());
        m.append("module", "external");
        if let Some(recv) = self.receiver() {
            m.append("address", recv.script().to_owned());
        }
        if !reason.is_empty() {
            m.append("reason", reason.to_owned());
        }
        if let Some(peer) = self.peer() {
            m.append("peerid", peer.endpoint_id());
        }
        self.engine.enqueue(m);
    }
}

impl Drop for ExtModChan {
    fn drop(&mut self) {
        let id = plock(&self.id).clone();
        debug!("ExtModChan '{id}' destroyed");
        if let Some(module) = self.module.upgrade() {
            module.prune_chans();
        }
        if let Some(recv) = plock(&self.recv).upgrade() {
            recv.die(false);
        }
    }
}

/// Nominal audio rate: 8 kHz, 16-bit mono.
const AUDIO_BYTE_RATE: u64 = 16000;

/// Pull audio from the child pipe at the nominal rate, pacing against
/// the wall clock, and forward it to the installed sink.
fn source_loop(mut file: File, chan: &Arc<ExtModChan>, sink: &Arc<Mutex<Option<AudioSinkFn>>>) {
    let mut data = [0u8; 320];
    let mut total: u64 = 0;
    let mut tpos = Instant::now();
    loop {
        let got = match file.read(&mut data) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        };
        let now = Instant::now();
        if tpos > now {
            std::thread::sleep(tpos - now);
        }
        {
            let mut sink = plock(sink);
            if let Some(forward) = sink.as_mut() {
                forward(&data[..got], total / 2);
            }
        }
        total += got as u64;
        tpos += Duration::from_micros(got as u64 * 1_000_000 / AUDIO_BYTE_RATE);
    }
    info!("audio source for '{}' end of data, total={total}", chan.id());
    chan.set_running(false);
}

/// Writes engine-side audio into the child's fd 3 pipe.
pub(crate) struct ExtModConsumer {
    file: File,
    total: u64,
}

impl ExtModConsumer {
    fn new(file: File) -> Self {
        ExtModConsumer { file, total: 0 }
    }

    fn consume(&mut self, data: &DataBlock) -> bool {
        if data.is_empty() {
            return false;
        }
        match self.file.write_all(data.data()) {
            Ok(()) => {
                self.total += data.len() as u64;
                true
            }
            Err(_) => false,
        }
    }
}

impl Drop for ExtModConsumer {
    fn drop(&mut self) {
        debug!("audio consumer closed, total={}", self.total);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct TestEp {
        id: String,
        peer: Mutex<Option<Arc<dyn CallEndpoint>>>,
        gone: Arc<Mutex<Vec<String>>>,
    }

    impl CallEndpoint for TestEp {
        fn endpoint_id(&self) -> String {
            self.id.clone()
        }
        fn peer(&self) -> Option<Arc<dyn CallEndpoint>> {
            plock(&self.peer).clone()
        }
        fn set_peer_slot(&self, peer: Option<Arc<dyn CallEndpoint>>) {
            *plock(&self.peer) = peer;
        }
        fn disconnected(&self, reason: &str) {
            plock(&self.gone).push(format!("{}:{}", self.id, reason));
        }
    }

    #[test]
    fn connect_and_disconnect_notify_both_sides() {
        let gone = Arc::new(Mutex::new(Vec::new()));
        let a: Arc<dyn CallEndpoint> = Arc::new(TestEp {
            id: "a".into(),
            peer: Mutex::new(None),
            gone: gone.clone(),
        });
        let b: Arc<dyn CallEndpoint> = Arc::new(TestEp {
            id: "b".into(),
            peer: Mutex::new(None),
            gone: gone.clone(),
        });
        connect_endpoints(a.clone(), b.clone());
        assert_eq!(a.peer().unwrap().endpoint_id(), "b");
        assert_eq!(b.peer().unwrap().endpoint_id(), "a");
        disconnect_endpoint(&a, "hangup");
        assert!(a.peer().is_none());
        assert!(b.peer().is_none());
        assert_eq!(*plock(&gone), ["b:hangup", "a:hangup"]);
    }

    #[test]
    fn consumer_writes_to_pipe() {
        let engine = Engine::start(1);
        let chan = ExtModChan::new(engine.clone(), Weak::new());
        let (read, write) = cloexec_pipe().unwrap();
        *plock(&chan.consumer) = Some(ExtModConsumer::new(fd_file(write)));
        assert!(chan.consume_audio(&DataBlock::from_slice(b"abcd")));
        assert!(!chan.consume_audio(&DataBlock::new()));
        let mut got = [0u8; 4];
        fd_file(read).read_exact(&mut got).unwrap();
        assert_eq!(&got, b"abcd");
        engine.shutdown();
    }

    #[test]
    fn source_forwards_frames_and_stops_on_eof() {
        let engine = Engine::start(1);
        let chan = ExtModChan::new(engine.clone(), Weak::new());
        let (tx, rx) = std::sync::mpsc::channel();
        chan.set_audio_sink(Box::new(move |data, ts| {
            let _ = tx.send((data.to_vec(), ts));
        }));
        let (read, write) = cloexec_pipe().unwrap();
        chan.start_source(fd_file(read));
        assert!(chan.running());
        let mut feeder = fd_file(write);
        feeder.write_all(&[1u8; 320]).unwrap();
        let (frame, tstamp) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(frame.len(), 320);
        assert_eq!(tstamp, 0);
        drop(feeder);
        let deadline = Instant::now() + Duration::from_secs(5);
        while chan.running() {
            assert!(Instant::now() < deadline, "source did not stop on EOF");
            std::thread::sleep(Duration::from_millis(10));
        }
        engine.shutdown();
    }
}
