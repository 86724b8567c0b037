// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

// This file implements the engine that multiplexes connections: the
// registry, the reference-flag manager, the ingress dispatcher, and the
// process loop. The egress batcher lives in egress.rs.

use std::{collections::HashMap, fmt, net::SocketAddr};

use enumset::{EnumSet, EnumSetType};
use qmux_common::{
    hex, qdebug, qinfo, qtrace, qwarn, Clock, Datagram, Role, StdClock, Time,
};
use slab::Slab;
use static_assertions::const_assert;

use crate::{
    attq::Attq,
    cid::ConnectionId,
    conn::{ConnectionOps, DatagramSink, PacketBufs, PeerCtx, ResetToken, TickFlag},
    heap::ConnHeap,
    packet::{
        parser_for_version, HeaderKind, HeaderParser, PacketIn, ParsedHeader, SniffingParser,
        MIN_STATELESS_RESET_SIZE,
    },
    settings::EngineSettings,
    version::Version,
    Error, Res,
};

pub(crate) const MIN_OUT_BATCH_SIZE: usize = 4;
pub(crate) const INITIAL_OUT_BATCH_SIZE: usize = 32;
pub(crate) const MAX_OUT_BATCH_SIZE: usize = 1024;
const_assert!(MIN_OUT_BATCH_SIZE <= INITIAL_OUT_BATCH_SIZE);
const_assert!(INITIAL_OUT_BATCH_SIZE <= MAX_OUT_BATCH_SIZE);

/// How long sending stays paused after sink backpressure before the
/// engine re-arms itself, absent any external prod.
pub(crate) const RESUME_SEND_TIMEOUT: u64 = 1_000_000;

/// CID entries a single connection may publish.
const MAX_CID_ENTRIES: usize = 8;

/// Stable identifier of a connection inside its engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(pub(crate) usize);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Queue-membership flags. Each flag is one logical reference; the
/// connection is destroyed the moment its set becomes empty.
#[derive(Debug, EnumSetType)]
pub(crate) enum ConnFlag {
    /// Published in the registry.
    Hashed,
    /// Known to the outgoing queue (the heap, or the live egress
    /// iteration).
    HasOutgoing,
    /// Present in the tickable heap.
    Tickable,
    /// Held by the current round's ticked set.
    Ticked,
    /// Held by the current round's closing set.
    Closing,
    /// Scheduled on the advisory tick-time queue.
    Attq,
}

/// Where a connection currently sits in an egress iteration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CoiState {
    /// Not part of an iteration.
    Out,
    /// In rotation: may still have packets.
    Active,
    /// Drained for this round.
    Inactive,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct CidEntry {
    pub(crate) cid: ConnectionId,
    pub(crate) published: bool,
}

/// Engine-side bookkeeping for one connection; the state machine itself
/// is behind `ops`.
pub(crate) struct Conn {
    pub(crate) ops: Box<dyn ConnectionOps>,
    pub(crate) flags: EnumSet<ConnFlag>,
    /// Latched during destruction so nothing re-inserts the connection.
    pub(crate) never_tickable: bool,
    pub(crate) coi: CoiState,
    pub(crate) cids: Vec<CidEntry>,
    pub(crate) tokens: Vec<ResetToken>,
    pub(crate) local: SocketAddr,
    pub(crate) peer: SocketAddr,
    pub(crate) peer_ctx: PeerCtx,
    pub(crate) last_ticked: Time,
    pub(crate) last_sent: Time,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum RegistryKey {
    Cid(ConnectionId),
    /// Address-keyed (TCID0) mode: the local port stands in for a CID.
    Port(u16),
}

/// Outcome of [`Engine::packet_in`] when the datagram parsed cleanly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Incoming {
    /// At least one packet reached a connection.
    Delivered,
    /// The datagram was handled, but no connection consumed a packet.
    Unclaimed,
}

/// The connection multiplexer.
///
/// Owns every live connection, routes datagrams to them, ticks them in
/// priority order, and batches their packets onto the sink. Not safe
/// for concurrent use; callers serialize externally, and re-entry from
/// callbacks is an error.
pub struct Engine {
    role: Role,
    pub(crate) settings: EngineSettings,
    hash_by_addr: bool,
    pub(crate) conns: Slab<Conn>,
    n_conns: usize,
    registry: HashMap<RegistryKey, ConnectionHandle>,
    reset_tokens: HashMap<ResetToken, ConnectionHandle>,
    attq: Attq,
    tickable: ConnHeap,
    pub(crate) outgoing: ConnHeap,
    pub(crate) sink: Box<dyn DatagramSink>,
    pub(crate) bufs: Box<dyn PacketBufs>,
    pub(crate) clock: Box<dyn Clock>,
    pub(crate) batch_size: usize,
    pub(crate) can_send: bool,
    pub(crate) resume_sending_at: Time,
    pub(crate) past_deadline: bool,
    /// Engine-wide send stamp; newly created connections start below it
    /// so they get the first turn once they have something to send.
    pub(crate) last_sent: Time,
    processing: bool,
}

impl Engine {
    /// Build an engine that samples the process monotonic clock.
    ///
    /// # Errors
    /// [`Error::BadSettings`] when `settings` fail validation.
    pub fn new(
        role: Role,
        settings: EngineSettings,
        sink: Box<dyn DatagramSink>,
        bufs: Box<dyn PacketBufs>,
    ) -> Res<Self> {
        Self::with_clock(role, settings, sink, bufs, Box::new(StdClock::default()))
    }

    /// Build an engine with an explicit time source.
    ///
    /// # Errors
    /// [`Error::BadSettings`] when `settings` fail validation.
    pub fn with_clock(
        role: Role,
        settings: EngineSettings,
        sink: Box<dyn DatagramSink>,
        bufs: Box<dyn PacketBufs>,
        clock: Box<dyn Clock>,
    ) -> Res<Self> {
        settings.validate(role)?;
        let hash_by_addr = settings.hashes_by_address();
        Ok(Self {
            role,
            settings,
            hash_by_addr,
            conns: Slab::new(),
            n_conns: 0,
            registry: HashMap::new(),
            reset_tokens: HashMap::new(),
            attq: Attq::new(),
            tickable: ConnHeap::new(),
            outgoing: ConnHeap::new(),
            sink,
            bufs,
            clock,
            batch_size: INITIAL_OUT_BATCH_SIZE,
            can_send: true,
            resume_sending_at: Time::ZERO,
            past_deadline: false,
            last_sent: Time::ZERO,
            processing: false,
        })
    }

    /// The versions this engine will offer, restricted to what it
    /// supports.
    #[must_use]
    pub fn quic_versions(&self) -> EnumSet<Version> {
        self.settings.versions & Version::SUPPORTED
    }

    #[must_use]
    pub fn conn_count(&self) -> usize {
        self.n_conns
    }

    /// Current egress batch size; adapts within fixed bounds.
    #[must_use]
    pub const fn out_batch_size(&self) -> usize {
        self.batch_size
    }

    fn enter(&mut self) {
        assert!(!self.processing, "re-entrant engine call");
        self.processing = true;
    }

    fn leave(&mut self) {
        self.processing = false;
    }

    // Reference-flag management. Every queue holds exactly one flag;
    // clearing the last one destroys the connection.

    pub(crate) fn incref(&mut self, conn: ConnectionHandle, flag: ConnFlag) {
        let c = &mut self.conns[conn.0];
        assert!(!c.flags.contains(flag), "{conn} already holds {flag:?}");
        c.flags.insert(flag);
    }

    /// Returns `true` when this dropped the last reference and the
    /// connection was destroyed.
    pub(crate) fn decref(&mut self, conn: ConnectionHandle, flag: ConnFlag) -> bool {
        let c = &mut self.conns[conn.0];
        assert!(c.flags.contains(flag), "{conn} does not hold {flag:?}");
        c.flags.remove(flag);
        if c.flags.is_empty() {
            self.destroy_conn(conn);
            true
        } else {
            false
        }
    }

    fn destroy_conn(&mut self, conn: ConnectionHandle) {
        qinfo!([self], "destroying {conn}");
        self.conns[conn.0].never_tickable = true;
        self.n_conns -= 1;
        let tokens = std::mem::take(&mut self.conns[conn.0].tokens);
        for token in tokens {
            self.reset_tokens.remove(&token);
        }
        let mut c = self.conns.remove(conn.0);
        c.ops.destroy();
    }

    // Registry.

    /// Publish all of the connection's CID entries (or its port, in
    /// address-keyed mode). On conflict nothing is left behind.
    fn insert_all_cids(&mut self, conn: ConnectionHandle) -> Res<()> {
        if self.hash_by_addr {
            let port = self.conns[conn.0].local.port();
            if self.registry.contains_key(&RegistryKey::Port(port)) {
                qwarn!([self], "local port {port} already has a connection");
                return Err(Error::DuplicatePort);
            }
            self.registry.insert(RegistryKey::Port(port), conn);
            return Ok(());
        }
        for idx in 0..self.conns[conn.0].cids.len() {
            let CidEntry { cid, published } = self.conns[conn.0].cids[idx];
            if !published {
                continue;
            }
            if self.registry.contains_key(&RegistryKey::Cid(cid)) {
                for j in 0..idx {
                    let CidEntry { cid, published } = self.conns[conn.0].cids[j];
                    if published {
                        self.registry.remove(&RegistryKey::Cid(cid));
                    }
                }
                return Err(Error::DuplicateCid);
            }
            self.registry.insert(RegistryKey::Cid(cid), conn);
        }
        Ok(())
    }

    fn remove_all_cids(&mut self, conn: ConnectionHandle) {
        if self.hash_by_addr {
            let port = self.conns[conn.0].local.port();
            self.registry.remove(&RegistryKey::Port(port));
            return;
        }
        for idx in 0..self.conns[conn.0].cids.len() {
            let CidEntry { cid, published } = self.conns[conn.0].cids[idx];
            if published {
                self.registry.remove(&RegistryKey::Cid(cid));
                self.conns[conn.0].cids[idx].published = false;
            }
        }
    }

    /// Pull the connection out of the registry and drop its reference.
    pub(crate) fn unhash_conn(&mut self, conn: ConnectionHandle) {
        if self.conns[conn.0].flags.contains(ConnFlag::Hashed) {
            self.remove_all_cids(conn);
            self.decref(conn, ConnFlag::Hashed);
        }
    }

    fn find_conn(
        &self,
        dcid: Option<&ConnectionId>,
        local: SocketAddr,
    ) -> Option<ConnectionHandle> {
        if self.hash_by_addr {
            let conn = *self.registry.get(&RegistryKey::Port(local.port()))?;
            // The datagram may still carry a CID; it has to agree.
            if let Some(cid) = dcid {
                if !cid.is_empty() && self.conns[conn.0].ops.primary_cid() != *cid {
                    return None;
                }
            }
            Some(conn)
        } else {
            self.registry.get(&RegistryKey::Cid(*dcid?)).copied()
        }
    }

    /// Register a new locally initiated connection.
    ///
    /// The engine owns the connection from here on; on error it is
    /// destroyed before this returns.
    ///
    /// # Errors
    /// [`Error::DuplicatePort`] in address-keyed mode when the local
    /// port is taken; [`Error::DuplicateCid`] when the connection's
    /// primary CID is.
    pub fn connect(
        &mut self,
        conn: Box<dyn ConnectionOps>,
        local: SocketAddr,
        peer: SocketAddr,
        peer_ctx: PeerCtx,
    ) -> Res<ConnectionHandle> {
        self.enter();
        let res = self.connect_inner(conn, local, peer, peer_ctx);
        self.leave();
        res
    }

    fn connect_inner(
        &mut self,
        conn: Box<dyn ConnectionOps>,
        local: SocketAddr,
        peer: SocketAddr,
        peer_ctx: PeerCtx,
    ) -> Res<ConnectionHandle> {
        let primary = conn.primary_cid();
        let mut cids = Vec::new();
        if !self.hash_by_addr && !primary.is_empty() {
            cids.push(CidEntry {
                cid: primary,
                published: true,
            });
        }
        let entry = self.conns.vacant_entry();
        let handle = ConnectionHandle(entry.key());
        entry.insert(Conn {
            ops: conn,
            flags: EnumSet::empty(),
            never_tickable: false,
            coi: CoiState::Out,
            cids,
            tokens: Vec::new(),
            local,
            peer,
            peer_ctx,
            last_ticked: Time::ZERO,
            // Below the engine-wide stamp, so the first send wins the
            // outgoing heap over established connections.
            last_sent: Time::ZERO,
        });
        self.n_conns += 1;
        if let Err(e) = self.insert_all_cids(handle) {
            self.n_conns -= 1;
            let mut c = self.conns.remove(handle.0);
            c.ops.destroy();
            return Err(e);
        }
        self.incref(handle, ConnFlag::Hashed);
        self.enqueue_tickable(handle);
        qinfo!([self], "{handle} connected, {local} -> {peer}");
        Ok(handle)
    }

    /// Publish an additional CID for `conn`; the returned index can be
    /// passed to [`Engine::retire_cid`].
    ///
    /// # Errors
    /// [`Error::TooManyCids`], [`Error::DuplicateCid`].
    ///
    /// # Panics
    /// On a stale handle, or in address-keyed mode.
    pub fn add_cid(&mut self, conn: ConnectionHandle, cid: ConnectionId) -> Res<usize> {
        assert!(!self.hash_by_addr, "no CIDs to publish in address-keyed mode");
        if self.conns[conn.0].cids.len() >= MAX_CID_ENTRIES {
            return Err(Error::TooManyCids);
        }
        if self.registry.contains_key(&RegistryKey::Cid(cid)) {
            return Err(Error::DuplicateCid);
        }
        self.registry.insert(RegistryKey::Cid(cid), conn);
        let idx = self.conns[conn.0].cids.len();
        self.conns[conn.0].cids.push(CidEntry {
            cid,
            published: true,
        });
        qdebug!([self], "{conn} published CID {cid}");
        Ok(idx)
    }

    /// Withdraw one of the connection's published CIDs.
    ///
    /// # Panics
    /// On a stale handle or index.
    pub fn retire_cid(&mut self, conn: ConnectionHandle, idx: usize) {
        let CidEntry { cid, published } = self.conns[conn.0].cids[idx];
        if published {
            self.conns[conn.0].cids[idx].published = false;
            self.registry.remove(&RegistryKey::Cid(cid));
            qdebug!([self], "{conn} retired CID {cid}");
        }
    }

    /// Register the stateless-reset token the peer agreed to for
    /// `conn`.
    ///
    /// # Panics
    /// On a stale handle.
    pub fn add_reset_token(&mut self, conn: ConnectionHandle, token: ResetToken) {
        if let Some(old) = self.reset_tokens.insert(token, conn) {
            qwarn!([self], "reset token moved from {old} to {conn}");
            if self.conns.contains(old.0) {
                self.conns[old.0].tokens.retain(|t| *t != token);
            }
        }
        self.conns[conn.0].tokens.push(token);
    }

    // Scheduling.

    /// Drop the connection's ATTQ entry and its reference, if it has
    /// one.
    pub(crate) fn remove_from_attq(&mut self, conn: ConnectionHandle) {
        if self.attq.remove(conn) {
            self.decref(conn, ConnFlag::Attq);
        }
    }

    pub(crate) fn enqueue_tickable(&mut self, conn: ConnectionHandle) {
        let c = &self.conns[conn.0];
        if c.never_tickable || c.flags.contains(ConnFlag::Tickable) {
            return;
        }
        let key = c.last_ticked;
        self.incref(conn, ConnFlag::Tickable);
        self.tickable.insert(key, conn);
        qtrace!([self], "{conn} is now tickable");
    }

    // Ingress.

    /// Dispatch an incoming datagram, which may hold several coalesced
    /// packets. Owning connections become tickable; the caller should
    /// follow up with [`Engine::process_conns`].
    ///
    /// # Errors
    /// [`Error::InvalidPacket`] when any packet fails to parse (packets
    /// before it were still delivered); [`Error::UnknownConnection`] in
    /// address-keyed mode when nothing owns the local address.
    pub fn packet_in(&mut self, dgram: &Datagram, peer_ctx: PeerCtx) -> Res<Incoming> {
        self.enter();
        let res = self.dispatch_datagram(dgram, peer_ctx);
        self.leave();
        res
    }

    fn dispatch_datagram(&mut self, dgram: &Datagram, peer_ctx: PeerCtx) -> Res<Incoming> {
        qtrace!([self], "datagram in ({} bytes): {}", dgram.len(), hex(&dgram[..]));
        let now = self.clock.now();
        let parser: &dyn HeaderParser = if self.hash_by_addr {
            // The owner's negotiated version selects the header layout.
            let conn = self
                .find_conn(None, dgram.destination())
                .ok_or(Error::UnknownConnection)?;
            parser_for_version(self.conns[conn.0].ops.negotiated_version())
        } else {
            &SniffingParser {}
        };

        let mut buf: &[u8] = &dgram[..];
        let mut delivered = 0_usize;
        while !buf.is_empty() {
            let hdr = parser.parse(buf, self.settings.scid_len)?;
            debug_assert!(hdr.len > 0 && hdr.len <= buf.len());
            let packet = PacketIn::new(&buf[..hdr.len], hdr.dcid, dgram.ecn(), now);
            if self.process_packet_in(&packet, &hdr, dgram, peer_ctx) {
                delivered += 1;
            }
            buf = &buf[hdr.len..];
        }
        if delivered > 0 {
            Ok(Incoming::Delivered)
        } else {
            Ok(Incoming::Unclaimed)
        }
    }

    /// Route one parsed packet. Returns whether a connection took it.
    fn process_packet_in(
        &mut self,
        packet: &PacketIn<'_>,
        hdr: &ParsedHeader,
        dgram: &Datagram,
        peer_ctx: PeerCtx,
    ) -> bool {
        if hdr.kind == HeaderKind::PublicReset && !self.settings.honor_prst {
            qdebug!([self], "public reset ignored");
            return false;
        }
        let Some(conn) = self.find_conn(hdr.dcid.as_ref(), dgram.destination()) else {
            self.match_stateless_reset(packet);
            qtrace!([self], "no connection for packet");
            return false;
        };
        self.enqueue_tickable(conn);
        let c = &mut self.conns[conn.0];
        c.local = dgram.destination();
        c.peer = dgram.source();
        c.peer_ctx = peer_ctx;
        c.ops.packet_in(packet);
        true
    }

    /// A short-header-shaped datagram for no known connection might be
    /// a stateless reset; the trailing 16 bytes are the lookup key.
    fn match_stateless_reset(&mut self, packet: &PacketIn<'_>) {
        let data = packet.data();
        if !self.settings.honor_prst
            || data.len() < MIN_STATELESS_RESET_SIZE
            || data[0] & 0xc0 != 0x40
        {
            return;
        }
        let token = ResetToken::from_suffix(data);
        if let Some(conn) = self.reset_tokens.get(&token).copied() {
            qinfo!([self], "stateless reset for {conn}");
            self.conns[conn.0].ops.stateless_reset();
            self.enqueue_tickable(conn);
        }
    }

    // The process loop.

    /// Run one processing round: promote due ATTQ entries, tick every
    /// tickable connection in last-ticked order, drive egress, then
    /// reschedule or destroy what was ticked.
    pub fn process_conns(&mut self) {
        self.enter();
        let now = self.clock.now();
        qtrace!([self], "process connections, t={}", now.as_micros());
        while let Some(conn) = self.attq.pop_due(now) {
            // Tickable first so the ATTQ reference is never the last.
            self.enqueue_tickable(conn);
            self.decref(conn, ConnFlag::Attq);
        }
        if !self.can_send && now > self.resume_sending_at {
            qdebug!([self], "failsafe re-arms sending");
            self.can_send = true;
        }
        self.process_tickable(now);
        self.leave();
    }

    fn process_tickable(&mut self, now: Time) {
        self.past_deadline = false;
        let deadline = (self.settings.proc_time_thresh > 0)
            .then(|| now + self.settings.proc_time_thresh);
        let mut closed: Vec<ConnectionHandle> = Vec::new();
        let mut ticked: Vec<ConnectionHandle> = Vec::new();
        let mut i = 0_u64;
        while let Some((_, conn)) = self.tickable.pop() {
            self.remove_from_attq(conn);
            let flags = self.conns[conn.0].ops.tick(now);
            // The +i offset keeps this round's relative order even
            // though every tick shares one clock sample.
            self.conns[conn.0].last_ticked = now + i;
            i += 1;
            qtrace!([self], "ticked {conn}: {flags:?}");
            if flags.contains(TickFlag::Send)
                && !self.conns[conn.0].flags.contains(ConnFlag::HasOutgoing)
            {
                self.incref(conn, ConnFlag::HasOutgoing);
                let key = self.conns[conn.0].last_sent;
                self.outgoing.insert(key, conn);
            }
            if flags.contains(TickFlag::Close) {
                self.incref(conn, ConnFlag::Closing);
                self.unhash_conn(conn);
                closed.push(conn);
            } else {
                self.incref(conn, ConnFlag::Ticked);
                ticked.push(conn);
            }
            self.decref(conn, ConnFlag::Tickable);
        }

        if self.can_send && !self.outgoing.is_empty() {
            self.send_packets(now, deadline, &mut closed);
        }

        // Destruction was deferred while iterators were live; now it is
        // safe.
        for conn in closed {
            self.decref(conn, ConnFlag::Closing);
        }
        for conn in ticked {
            if !self.conns.contains(conn.0)
                || !self.conns[conn.0].flags.contains(ConnFlag::Ticked)
            {
                // De-ticked during egress (it is being closed).
                continue;
            }
            if self.conns[conn.0].ops.is_tickable() {
                self.enqueue_tickable(conn);
            } else if let Some(when) = self.conns[conn.0].ops.next_tick_time() {
                self.incref(conn, ConnFlag::Attq);
                self.attq.add(conn, when);
            } else {
                debug_assert!(false, "{conn} reported no next tick time");
                qwarn!([self], "{conn} went dormant without a tick time");
            }
            self.decref(conn, ConnFlag::Ticked);
        }
    }

    /// Flush whatever is queued without waiting for the next processing
    /// round. This is the "sink is writable again" entry point, so it
    /// also re-arms sending.
    pub fn send_unsent_packets(&mut self) {
        self.enter();
        let now = self.clock.now();
        self.can_send = true;
        self.past_deadline = false;
        let deadline = (self.settings.proc_time_thresh > 0)
            .then(|| now + self.settings.proc_time_thresh);
        let mut closed = Vec::new();
        if !self.outgoing.is_empty() {
            self.send_packets(now, deadline, &mut closed);
        }
        for conn in closed {
            self.decref(conn, ConnFlag::Closing);
        }
        self.leave();
    }

    #[must_use]
    pub fn has_unsent_packets(&self) -> bool {
        !self.outgoing.is_empty()
    }

    /// Microseconds until the engine next wants [`Engine::process_conns`]
    /// called, or `None` when it is fully dormant. Zero means now.
    #[must_use]
    pub fn earliest_adv_tick(&self) -> Option<i64> {
        if self.past_deadline && !self.outgoing.is_empty() {
            return Some(0);
        }
        if !self.tickable.is_empty() {
            return Some(0);
        }
        let now = self.clock.now();
        let mut next = self.attq.min_time().map(|t| t.delta(now));
        if !self.can_send {
            let resume = self.resume_sending_at.delta(now);
            next = Some(next.map_or(resume, |n| n.min(resume)));
        }
        next.map(|d| d.max(0))
    }

    /// Number of connections whose advisory tick time falls within
    /// `from_now` microseconds of now.
    #[must_use]
    pub fn count_attq(&self, from_now: i64) -> usize {
        let cutoff = self.clock.now().offset(from_now);
        self.attq.count_before(cutoff)
    }

    /// Audit the flag/queue agreement invariants. Cheap enough for
    /// tests to call after every public operation.
    ///
    /// # Panics
    /// When an invariant does not hold.
    pub fn sanity_check(&self) {
        assert!(!self.processing);
        assert!((MIN_OUT_BATCH_SIZE..=MAX_OUT_BATCH_SIZE).contains(&self.batch_size));
        assert_eq!(self.n_conns, self.conns.len());
        let count = |handles: &mut dyn Iterator<Item = ConnectionHandle>,
                     conn: ConnectionHandle| {
            handles.filter(|h| *h == conn).count()
        };
        for (key, c) in &self.conns {
            let conn = ConnectionHandle(key);
            assert!(!c.flags.is_empty(), "{conn} is alive but unreferenced");
            assert!(
                (c.flags & (ConnFlag::Ticked | ConnFlag::Closing)).is_empty(),
                "{conn} holds a transient flag outside a processing round"
            );
            assert_eq!(c.coi, CoiState::Out);
            assert_eq!(
                count(&mut self.tickable.handles(), conn),
                usize::from(c.flags.contains(ConnFlag::Tickable)),
                "{conn} tickable flag does not match the heap"
            );
            assert_eq!(
                count(&mut self.outgoing.handles(), conn),
                usize::from(c.flags.contains(ConnFlag::HasOutgoing)),
                "{conn} outgoing flag does not match the heap"
            );
            assert_eq!(
                count(&mut self.attq.handles(), conn),
                usize::from(c.flags.contains(ConnFlag::Attq)),
                "{conn} attq flag does not match the queue"
            );
        }
        for conn in self.registry.values() {
            assert!(self.conns.contains(conn.0));
            assert!(self.conns[conn.0].flags.contains(ConnFlag::Hashed));
        }
        for conn in self.reset_tokens.values() {
            assert!(self.conns.contains(conn.0));
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        for (_, c) in &mut self.conns {
            c.never_tickable = true;
            c.ops.destroy();
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} engine", self.role)
    }
}
