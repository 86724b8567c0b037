// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Scriptable connections, sinks, clocks, and allocators for exercising
//! the engine without real transport machinery behind it.

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    net::SocketAddr,
    rc::Rc,
};

use enumset::EnumSet;
use qmux_common::{qtrace, Clock, Ecn, Role, Time};
use qmux_engine::{
    ConnectionId, ConnectionOps, DatagramSink, EncryptOutcome, Engine, EngineSettings, OutSpec,
    PacketBufs, PacketIn, PacketOut, PeerCtx, TickFlag, Version, ENC_EXPANSION,
};

/// Initialize logging for a test run.
pub fn init() {
    qmux_common::log::init();
}

#[must_use]
pub fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

#[must_use]
pub fn addr6(port: u16) -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0, 0, 0, 0, 1], port))
}

#[must_use]
pub fn cid(bytes: &[u8]) -> ConnectionId {
    ConnectionId::from(bytes)
}

/// Engine settings the fixtures agree on.
#[must_use]
pub fn default_settings() -> EngineSettings {
    EngineSettings::default()
}

/// A client engine wired to the given fixtures.
///
/// # Panics
/// When the default settings are rejected, which would be a bug.
#[must_use]
pub fn client_engine(clock: &ManualClock, sink: &VecSink, bufs: &CountingBufs) -> Engine {
    Engine::with_clock(
        Role::Client,
        default_settings(),
        sink.boxed(),
        bufs.boxed(),
        Box::new(clock.clone()),
    )
    .expect("default settings are valid")
}

/// An IETF Initial-shaped packet padded out to `total_len` bytes.
///
/// # Panics
/// When `total_len` leaves no room for the header.
#[must_use]
pub fn initial_packet(dcid: &ConnectionId, total_len: usize) -> Vec<u8> {
    let mut p = vec![0xc0];
    p.extend_from_slice(&1_u32.to_be_bytes());
    p.push(u8::try_from(dcid.len()).expect("CIDs are short"));
    p.extend_from_slice(dcid);
    p.push(0); // no SCID
    p.push(0); // empty token
    let hdr = p.len() + 2; // two-byte length varint
    assert!(total_len > hdr);
    let payload = total_len - hdr;
    assert!(payload < (1 << 14));
    p.push(0x40 | u8::try_from(payload >> 8).expect("payload fits"));
    p.push(u8::try_from(payload & 0xff).expect("masked"));
    p.resize(total_len, 0);
    p
}

/// An IETF short-header packet padded out to `total_len` bytes.
///
/// # Panics
/// When `total_len` leaves no room for the header.
#[must_use]
pub fn short_packet(dcid: &ConnectionId, total_len: usize) -> Vec<u8> {
    let mut p = vec![0x41];
    p.extend_from_slice(dcid);
    assert!(total_len >= p.len());
    p.resize(total_len, 0);
    p
}

/// A settable time source shared between a test and its engine.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    us: Rc<Cell<u64>>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start_us: u64) -> Self {
        let clock = Self::default();
        clock.set(start_us);
        clock
    }

    pub fn set(&self, us: u64) {
        self.us.set(us);
    }

    pub fn advance(&self, us: u64) {
        self.us.set(self.us.get() + us);
    }

    #[must_use]
    pub fn now_us(&self) -> u64 {
        self.us.get()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Time {
        Time::from_micros(self.us.get())
    }
}

/// Shared record of the order in which connections were ticked.
#[derive(Clone, Debug, Default)]
pub struct TickLog(Rc<RefCell<Vec<ConnectionId>>>);

impl TickLog {
    #[must_use]
    pub fn order(&self) -> Vec<ConnectionId> {
        self.0.borrow().clone()
    }
}

/// How [`TestConn::encrypt_packet`] behaves for one packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncryptScript {
    Normal,
    NoMem,
    BadCrypt,
}

#[derive(Debug)]
struct TestConnInner {
    cid: ConnectionId,
    version: Version,
    echo: bool,
    to_send: VecDeque<PacketOut>,
    tick_script: VecDeque<EnumSet<TickFlag>>,
    encrypt_script: VecDeque<EncryptScript>,
    tickable: bool,
    /// Keep asking for ticks instead of going quiet after one.
    keep_tickable: bool,
    /// Microseconds after the last tick at which the next one is
    /// requested; `None` models a connection with no next tick time.
    tick_interval: Option<u64>,
    last_now: Time,
    ticks: usize,
    sent: Vec<usize>,
    not_sent: Vec<usize>,
    received: Vec<usize>,
    reset: bool,
    destroyed: bool,
    tick_log: Option<TickLog>,
}

/// A scriptable stand-in for a connection state machine. Clones share
/// state, so tests keep one handle while the engine owns the other.
#[derive(Clone, Debug)]
pub struct TestConn {
    inner: Rc<RefCell<TestConnInner>>,
}

impl TestConn {
    #[must_use]
    pub fn new(cid: ConnectionId) -> Self {
        Self {
            inner: Rc::new(RefCell::new(TestConnInner {
                cid,
                version: Version::V1,
                echo: false,
                to_send: VecDeque::new(),
                tick_script: VecDeque::new(),
                encrypt_script: VecDeque::new(),
                tickable: false,
                keep_tickable: false,
                tick_interval: Some(25_000),
                last_now: Time::ZERO,
                ticks: 0,
                sent: Vec::new(),
                not_sent: Vec::new(),
                received: Vec::new(),
                reset: false,
                destroyed: false,
                tick_log: None,
            })),
        }
    }

    /// The handle to give to [`Engine::connect`].
    #[must_use]
    pub fn boxed(&self) -> Box<dyn ConnectionOps> {
        Box::new(self.clone())
    }

    /// Echo every received payload length back as an outgoing packet.
    pub fn set_echo(&self, on: bool) {
        self.inner.borrow_mut().echo = on;
    }

    pub fn set_version(&self, version: Version) {
        self.inner.borrow_mut().version = version;
    }

    pub fn set_tickable(&self, on: bool) {
        self.inner.borrow_mut().tickable = on;
    }

    /// Report as tickable even right after a tick.
    pub fn keep_tickable(&self, on: bool) {
        let mut inner = self.inner.borrow_mut();
        inner.keep_tickable = on;
        inner.tickable = on;
    }

    pub fn set_tick_interval(&self, us: Option<u64>) {
        self.inner.borrow_mut().tick_interval = us;
    }

    pub fn log_ticks(&self, log: &TickLog) {
        self.inner.borrow_mut().tick_log = Some(log.clone());
    }

    /// Queue an outgoing packet of `len` zero bytes.
    pub fn queue_send(&self, len: usize) {
        self.inner
            .borrow_mut()
            .to_send
            .push_back(PacketOut::new(vec![0; len], Ecn::NotEct));
    }

    /// Force the result of the next tick (scripts stack up in order).
    pub fn script_tick(&self, flags: EnumSet<TickFlag>) {
        self.inner.borrow_mut().tick_script.push_back(flags);
    }

    /// Force the behavior of the next encryption (scripts stack up).
    pub fn script_encrypt(&self, what: EncryptScript) {
        self.inner.borrow_mut().encrypt_script.push_back(what);
    }

    #[must_use]
    pub fn ticks(&self) -> usize {
        self.inner.borrow().ticks
    }

    #[must_use]
    pub fn sent(&self) -> Vec<usize> {
        self.inner.borrow().sent.clone()
    }

    #[must_use]
    pub fn not_sent(&self) -> Vec<usize> {
        self.inner.borrow().not_sent.clone()
    }

    #[must_use]
    pub fn received(&self) -> Vec<usize> {
        self.inner.borrow().received.clone()
    }

    #[must_use]
    pub fn queued(&self) -> usize {
        self.inner.borrow().to_send.len()
    }

    #[must_use]
    pub fn was_reset(&self) -> bool {
        self.inner.borrow().reset
    }

    #[must_use]
    pub fn was_destroyed(&self) -> bool {
        self.inner.borrow().destroyed
    }
}

impl ConnectionOps for TestConn {
    fn tick(&mut self, now: Time) -> EnumSet<TickFlag> {
        let mut inner = self.inner.borrow_mut();
        inner.last_now = now;
        inner.ticks += 1;
        inner.tickable = inner.keep_tickable;
        if let Some(log) = &inner.tick_log {
            log.0.borrow_mut().push(inner.cid);
        }
        if let Some(flags) = inner.tick_script.pop_front() {
            return flags;
        }
        if inner.to_send.is_empty() {
            EnumSet::empty()
        } else {
            TickFlag::Send.into()
        }
    }

    fn next_packet_to_send(&mut self) -> Option<PacketOut> {
        self.inner.borrow_mut().to_send.pop_front()
    }

    fn packet_sent(&mut self, packet: PacketOut) {
        qtrace!("test conn sent {} bytes", packet.data().len());
        self.inner.borrow_mut().sent.push(packet.data().len());
    }

    fn packet_not_sent(&mut self, packet: PacketOut) {
        let mut inner = self.inner.borrow_mut();
        inner.not_sent.push(packet.data().len());
        // The engine returns these newest-first; putting each at the
        // head restores transmit order.
        inner.to_send.push_front(packet);
    }

    fn packet_in(&mut self, packet: &PacketIn<'_>) {
        let mut inner = self.inner.borrow_mut();
        let len = packet.data().len();
        inner.received.push(len);
        if inner.echo {
            inner
                .to_send
                .push_back(PacketOut::new(vec![0; len], packet.ecn()));
        }
    }

    fn is_tickable(&self) -> bool {
        self.inner.borrow().tickable
    }

    fn next_tick_time(&self) -> Option<Time> {
        let inner = self.inner.borrow();
        inner.tick_interval.map(|us| inner.last_now + us)
    }

    fn stateless_reset(&mut self) {
        self.inner.borrow_mut().reset = true;
    }

    fn destroy(&mut self) {
        self.inner.borrow_mut().destroyed = true;
    }

    fn encrypt_packet(&mut self, packet: &PacketOut, dst: &mut [u8]) -> EncryptOutcome {
        let mut inner = self.inner.borrow_mut();
        match inner.encrypt_script.pop_front().unwrap_or(EncryptScript::Normal) {
            EncryptScript::Normal => {
                let data = packet.data();
                dst[..data.len()].copy_from_slice(data);
                // The "tag" is whatever the buffer holds.
                EncryptOutcome::Ok(data.len() + ENC_EXPANSION)
            }
            EncryptScript::NoMem => EncryptOutcome::NoMem,
            EncryptScript::BadCrypt => EncryptOutcome::BadCrypt,
        }
    }

    fn primary_cid(&self) -> ConnectionId {
        self.inner.borrow().cid
    }

    fn negotiated_version(&self) -> Version {
        self.inner.borrow().version
    }
}

#[derive(Debug, Default)]
struct SinkInner {
    accept_script: VecDeque<isize>,
    delay: Option<(u64, ManualClock)>,
    batches: Vec<Vec<usize>>,
}

/// A recording sink. Accepts everything unless told otherwise.
#[derive(Clone, Debug, Default)]
pub struct VecSink {
    inner: Rc<RefCell<SinkInner>>,
}

impl VecSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn boxed(&self) -> Box<dyn DatagramSink> {
        Box::new(self.clone())
    }

    /// Script the return value of the next send call (stacks up).
    pub fn accept_next(&self, n: isize) {
        self.inner.borrow_mut().accept_script.push_back(n);
    }

    /// Advance `clock` by `us` on every send, simulating a sink that
    /// blocks.
    pub fn set_delay(&self, us: u64, clock: &ManualClock) {
        self.inner.borrow_mut().delay = Some((us, clock.clone()));
    }

    #[must_use]
    pub fn calls(&self) -> usize {
        self.inner.borrow().batches.len()
    }

    /// Datagram count of each send call.
    #[must_use]
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.inner.borrow().batches.iter().map(Vec::len).collect()
    }

    /// Lengths of every datagram handed over, in order.
    #[must_use]
    pub fn datagrams(&self) -> Vec<usize> {
        self.inner.borrow().batches.iter().flatten().copied().collect()
    }
}

impl DatagramSink for VecSink {
    fn send(&mut self, batch: &[OutSpec<'_>]) -> isize {
        let mut inner = self.inner.borrow_mut();
        inner
            .batches
            .push(batch.iter().map(|s| s.data.len()).collect());
        if let Some((us, clock)) = &inner.delay {
            clock.advance(*us);
        }
        inner
            .accept_script
            .pop_front()
            .unwrap_or_else(|| isize::try_from(batch.len()).expect("batch fits"))
    }
}

#[derive(Debug, Default)]
struct BufsInner {
    allocated: usize,
    released: usize,
    reclaimed: usize,
    fail_next: usize,
}

/// A heap allocator that keeps score.
#[derive(Clone, Debug, Default)]
pub struct CountingBufs {
    inner: Rc<RefCell<BufsInner>>,
}

impl CountingBufs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn boxed(&self) -> Box<dyn PacketBufs> {
        Box::new(self.clone())
    }

    /// Make the next `n` allocations fail.
    pub fn fail_next(&self, n: usize) {
        self.inner.borrow_mut().fail_next = n;
    }

    #[must_use]
    pub fn allocated(&self) -> usize {
        self.inner.borrow().allocated
    }

    #[must_use]
    pub fn released(&self) -> usize {
        self.inner.borrow().released
    }

    #[must_use]
    pub fn reclaimed(&self) -> usize {
        self.inner.borrow().reclaimed
    }

    /// Buffers currently out with the engine.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        let inner = self.inner.borrow();
        inner.allocated - inner.released - inner.reclaimed
    }
}

impl PacketBufs for CountingBufs {
    fn allocate(&mut self, _peer_ctx: PeerCtx, size: usize, _is_ipv6: bool) -> Option<Box<[u8]>> {
        let mut inner = self.inner.borrow_mut();
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return None;
        }
        inner.allocated += 1;
        Some(vec![0; size].into_boxed_slice())
    }

    fn release(&mut self, _peer_ctx: PeerCtx, _buf: Box<[u8]>, _is_ipv6: bool) {
        self.inner.borrow_mut().released += 1;
    }

    fn reclaim(&mut self, _peer_ctx: PeerCtx, _buf: Box<[u8]>, _is_ipv6: bool) {
        self.inner.borrow_mut().reclaimed += 1;
    }
}
