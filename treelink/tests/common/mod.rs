//! Loopback stand-ins for a tree server: a discovery responder, a framed TCP
//! service and a time-sync responder, plus helpers that drive the owner
//! thread's callback loop.
#![allow(dead_code)]

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use minstant::Instant;
use parking_lot::Mutex;

use treelink::CallbackMechanism;
use treelink::connector::clock::wall_micros;
use treelink::connector::framing::{self, FrameDecoder, Keepalive};
use treelink::connector::timesync::TimeSyncPacket;
use treelink::discovery::protocol::{DiscoveryBody, DiscoveryPacket, advertisement, field};
use treelink::gateway::wire::{TreeCommand, TreeReply};
use treelink::message::Message;

static INIT_TRACING: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        treelink::init_tracing();
    });
}

pub const POLL_STEP: Duration = Duration::from_millis(10);

/// Waits for and dispatches callbacks until `done` holds or `timeout`
/// passes. Returns whether `done` held.
pub fn pump_until(
    mechanism: &CallbackMechanism,
    timeout: Duration,
    mut done: impl FnMut() -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        mechanism.dispatch_callbacks();
        if done() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        mechanism.wait(Some((deadline - now).min(POLL_STEP)));
    }
}

/// Dispatches callbacks for `span` regardless of what arrives.
pub fn pump_for(mechanism: &CallbackMechanism, span: Duration) {
    pump_until(mechanism, span, || false);
}

/// Answers every discovery probe with `advert`, unless silenced.
pub struct FakeDiscoveryServer {
    pub addr: SocketAddr,
    advert: Arc<Mutex<Message>>,
    silent: Arc<AtomicBool>,
    probes: Arc<AtomicUsize>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FakeDiscoveryServer {
    pub fn spawn(advert: Message) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").expect("bind discovery responder");
        socket
            .set_read_timeout(Some(POLL_STEP))
            .expect("set read timeout");
        let addr = socket.local_addr().expect("local addr");

        let advert = Arc::new(Mutex::new(advert));
        let silent = Arc::new(AtomicBool::new(false));
        let probes = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let advert = Arc::clone(&advert);
            let silent = Arc::clone(&silent);
            let probes = Arc::clone(&probes);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("fake-discovery".into())
                .spawn(move || {
                    let mut buf = [0u8; 4096];
                    let mut out = Vec::new();
                    while !stop.load(Ordering::Relaxed) {
                        let (n, from) = match socket.recv_from(&mut buf) {
                            Ok(received) => received,
                            Err(_) => continue,
                        };
                        let Ok(DiscoveryPacket {
                            body: DiscoveryBody::Probe { tag, .. },
                            ..
                        }) = DiscoveryPacket::decode(&buf[..n])
                        else {
                            continue;
                        };
                        probes.fetch_add(1, Ordering::Relaxed);
                        if silent.load(Ordering::Relaxed) {
                            continue;
                        }
                        let mut payload = advert.lock().clone();
                        if let Some(tag) = tag {
                            payload.set(field::TAG, tag);
                        }
                        if DiscoveryPacket::reply(payload).encode_into(&mut out).is_ok() {
                            let _ = socket.send_to(&out, from);
                        }
                    }
                })
                .expect("spawn discovery responder")
        };

        Self {
            addr,
            advert,
            silent,
            probes,
            stop,
            handle: Some(handle),
        }
    }

    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::Relaxed);
    }

    pub fn set_advert(&self, advert: Message) {
        *self.advert.lock() = advert;
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::Relaxed)
    }
}

impl Drop for FakeDiscoveryServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// What the fake TCP service does with incoming frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpMode {
    /// Answer keep-alive pings and echo application messages with
    /// `what + 1`.
    Echo,
    /// Read everything, answer nothing.
    Mute,
    /// Answer keep-alives and play a minimal tree server: subscriptions get
    /// one node update, pings get a pong.
    Tree,
}

/// Accepts framed connections one at a time.
pub struct FakeTcpServer {
    pub addr: SocketAddr,
    mode: Arc<Mutex<TcpMode>>,
    accepted: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<Message>>>,
    outgoing: Arc<Mutex<Vec<Message>>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FakeTcpServer {
    pub fn spawn(mode: TcpMode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind tcp service");
        listener.set_nonblocking(true).expect("set nonblocking");
        let addr = listener.local_addr().expect("local addr");

        let mode = Arc::new(Mutex::new(mode));
        let accepted = Arc::new(AtomicUsize::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));
        let outgoing = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let mode = Arc::clone(&mode);
            let accepted = Arc::clone(&accepted);
            let received = Arc::clone(&received);
            let outgoing = Arc::clone(&outgoing);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("fake-tcp".into())
                .spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        match listener.accept() {
                            Ok((stream, _)) => {
                                accepted.fetch_add(1, Ordering::Relaxed);
                                serve(stream, &mode, &received, &outgoing, &stop);
                            }
                            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                                thread::sleep(POLL_STEP);
                            }
                            Err(_) => break,
                        }
                    }
                })
                .expect("spawn tcp service")
        };

        Self {
            addr,
            mode,
            accepted,
            received,
            outgoing,
            stop,
            handle: Some(handle),
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn set_mode(&self, mode: TcpMode) {
        *self.mode.lock() = mode;
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Application messages received so far (keep-alives excluded).
    pub fn received(&self) -> Vec<Message> {
        self.received.lock().clone()
    }

    /// Queues a message for the current connection.
    pub fn push(&self, msg: Message) {
        self.outgoing.lock().push(msg);
    }
}

impl Drop for FakeTcpServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn serve(
    mut stream: TcpStream,
    mode: &Mutex<TcpMode>,
    received: &Mutex<Vec<Message>>,
    outgoing: &Mutex<Vec<Message>>,
    stop: &AtomicBool,
) {
    // Accepted sockets inherit the listener's non-blocking flag on some platforms.
    let _ = stream.set_nonblocking(false);
    let _ = stream.set_read_timeout(Some(POLL_STEP));
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 4096];
    while !stop.load(Ordering::Relaxed) {
        let mut out = Vec::new();
        for msg in outgoing.lock().drain(..) {
            let _ = framing::encode_frame(&msg, &mut out);
        }

        match stream.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => decoder.extend(&buf[..n]),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(_) => return,
        }

        let mode = *mode.lock();
        while let Ok(Some(msg)) = decoder.next_frame() {
            match framing::classify(&msg) {
                Keepalive::Ping => {
                    if mode != TcpMode::Mute {
                        let _ = framing::encode_frame(&framing::keepalive_reply(), &mut out);
                    }
                }
                Keepalive::Reply => {}
                Keepalive::None => {
                    match mode {
                        TcpMode::Echo => {
                            let mut echo = msg.clone();
                            echo.what += 1;
                            let _ = framing::encode_frame(&echo, &mut out);
                        }
                        TcpMode::Tree => {
                            if let Some(reply) = tree_reply(&msg) {
                                let _ = framing::encode_frame(&reply, &mut out);
                            }
                        }
                        TcpMode::Mute => {}
                    }
                    received.lock().push(msg);
                }
            }
        }

        if !out.is_empty() && stream.write_all(&out).is_err() {
            return;
        }
    }
}

fn tree_reply(msg: &Message) -> Option<Message> {
    let replies = match TreeCommand::from_message(msg).ok()? {
        TreeCommand::Subscribe { path, .. } => vec![TreeReply::NodeUpdated {
            payload: Some(Message::new(0).with("value", path.len() as i64)),
            path,
        }],
        TreeCommand::RequestNodeValues { paths, .. } => paths
            .into_iter()
            .map(|path| TreeReply::NodeUpdated {
                path,
                payload: Some(Message::new(0).with("value", 1i64)),
            })
            .collect(),
        TreeCommand::PingLocalPeer { tag } | TreeCommand::PingSeniorPeer { tag } => {
            vec![TreeReply::Pong { tag }]
        }
        _ => return None,
    };
    TreeReply::batch_to_message(&replies).ok()
}

/// Answers time-sync pings with a clock running `offset_micros` ahead of
/// ours.
pub struct FakeTimeSyncServer {
    pub addr: SocketAddr,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FakeTimeSyncServer {
    pub fn spawn(offset_micros: i64) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").expect("bind time-sync responder");
        socket
            .set_read_timeout(Some(POLL_STEP))
            .expect("set read timeout");
        let addr = socket.local_addr().expect("local addr");
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("fake-timesync".into())
                .spawn(move || {
                    let mut buf = [0u8; 64];
                    let mut out = Vec::new();
                    while !stop.load(Ordering::Relaxed) {
                        let Ok((n, from)) = socket.recv_from(&mut buf) else {
                            continue;
                        };
                        let Ok(ping) = TimeSyncPacket::decode(&buf[..n]) else {
                            continue;
                        };
                        if let Some(pong) = TimeSyncPacket::pong_for(&ping, wall_micros() + offset_micros) {
                            pong.encode(&mut out);
                            let _ = socket.send_to(&out, from);
                        }
                    }
                })
                .expect("spawn time-sync responder")
        };

        Self {
            addr,
            stop,
            handle: Some(handle),
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

impl Drop for FakeTimeSyncServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// The reserved part of a server's discovery reply.
pub fn server_advert(system: &str, peer_id: u64, tcp_port: Option<u16>, time_sync_port: Option<u16>) -> Message {
    let mut advert = advertisement("tree-server-1", system, peer_id);
    if let Some(port) = tcp_port {
        advert.set(field::TCP_PORT, i64::from(port));
    }
    if let Some(port) = time_sync_port {
        advert.set(field::TIME_SYNC_PORT, i64::from(port));
    }
    advert
}
