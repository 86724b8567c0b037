// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The egress batcher: drains the outgoing heap round-robin, encrypts,
//! batches datagrams onto the sink, and absorbs backpressure.

use std::collections::VecDeque;

use qmux_common::{qdebug, qerror, qwarn, Ecn, Time};
use slab::Slab;

use crate::{
    conn::{EncData, EncryptOutcome, OutSpec, PacketOut, ENC_EXPANSION},
    engine::{
        Conn, ConnFlag, ConnectionHandle, CoiState, Engine, MAX_OUT_BATCH_SIZE,
        MIN_OUT_BATCH_SIZE, RESUME_SEND_TIMEOUT,
    },
    heap::ConnHeap,
};

struct BatchedPacket {
    conn: ConnectionHandle,
    packet: PacketOut,
}

/// One egress round's iteration state: a snapshot of the outgoing heap
/// plus the active/inactive rotation. Cycling the active list after the
/// heap drains is what keeps one busy connection from monopolizing a
/// batch.
struct OutIter {
    heap: ConnHeap,
    active: VecDeque<ConnectionHandle>,
    inactive: Vec<ConnectionHandle>,
}

impl OutIter {
    fn new(heap: ConnHeap) -> Self {
        Self {
            heap,
            active: VecDeque::new(),
            inactive: Vec::new(),
        }
    }

    /// The next connection to take a packet from: heap order first
    /// (oldest last-sent), then round-robin over whatever stayed
    /// active.
    fn next(&mut self, conns: &mut Slab<Conn>) -> Option<ConnectionHandle> {
        if let Some((_, conn)) = self.heap.pop() {
            conns[conn.0].coi = CoiState::Active;
            self.active.push_back(conn);
            return Some(conn);
        }
        while let Some(conn) = self.active.pop_front() {
            // Entries deactivated or dropped mid-round are skipped here.
            if conns.contains(conn.0) && conns[conn.0].coi == CoiState::Active {
                self.active.push_back(conn);
                return Some(conn);
            }
        }
        None
    }

    /// The connection has nothing more to send this round.
    fn deactivate(&mut self, conns: &mut Slab<Conn>, conn: ConnectionHandle) {
        self.active.retain(|c| *c != conn);
        conns[conn.0].coi = CoiState::Inactive;
        self.inactive.push(conn);
    }

    /// An unsent packet came back: the connection has something to send
    /// after all.
    fn reactivate(&mut self, conns: &mut Slab<Conn>, conn: ConnectionHandle) {
        if conns[conn.0].coi == CoiState::Inactive {
            self.inactive.retain(|c| *c != conn);
            conns[conn.0].coi = CoiState::Active;
            self.active.push_back(conn);
        }
    }

    /// Take the connection out of the iteration entirely (it is being
    /// closed).
    fn remove(&mut self, conns: &mut Slab<Conn>, conn: ConnectionHandle) {
        if conns[conn.0].coi == CoiState::Inactive {
            self.inactive.retain(|c| *c != conn);
        }
        conns[conn.0].coi = CoiState::Out;
    }
}

enum EncResult {
    Ok,
    NoMem,
    BadCrypt,
}

impl Engine {
    /// One egress round over the outgoing heap.
    ///
    /// Connections freshly closed in here are pushed onto `closed`; the
    /// caller drains that set once its iterators are gone.
    pub(crate) fn send_packets(
        &mut self,
        now: Time,
        deadline: Option<Time>,
        closed: &mut Vec<ConnectionHandle>,
    ) {
        qdebug!(
            [self],
            "sending queued packets from {} conns, batch size {}",
            self.outgoing.len(),
            self.batch_size
        );
        let mut iter = OutIter::new(std::mem::take(&mut self.outgoing));
        let mut batch: Vec<BatchedPacket> = Vec::with_capacity(self.batch_size);
        let mut full_batches = 0_usize;
        let mut shrink = false;

        while let Some(conn) = iter.next(&mut self.conns) {
            let Some(mut packet) = self.conns[conn.0].ops.next_packet_to_send() else {
                iter.deactivate(&mut self.conns, conn);
                continue;
            };
            let ipv6 = self.conns[conn.0].peer.is_ipv6();
            if let Some(enc) = packet.enc.take_if(|e| e.ipv6 != ipv6) {
                qdebug!([self], "{conn} switched address family, re-encrypting");
                let ctx = self.conns[conn.0].peer_ctx;
                self.bufs.reclaim(ctx, enc.buf, enc.ipv6);
            }
            if !packet.is_encrypted() {
                match self.encrypt_packet(conn, &mut packet, ipv6) {
                    EncResult::Ok => {}
                    EncResult::NoMem => {
                        qwarn!([self], "out of packet buffers, flushing early");
                        self.conns[conn.0].ops.packet_not_sent(packet);
                        if !batch.is_empty() {
                            let asked = batch.len();
                            if self.send_batch(&mut iter, &mut batch, now) < asked {
                                shrink = true;
                            }
                        }
                        break;
                    }
                    EncResult::BadCrypt => {
                        qwarn!([self], "cannot encrypt, tearing down {conn}");
                        self.conns[conn.0].ops.packet_not_sent(packet);
                        self.close_on_badcrypt(conn, closed, &mut iter);
                        continue;
                    }
                }
            }
            batch.push(BatchedPacket { conn, packet });
            if batch.len() >= self.batch_size {
                let asked = batch.len();
                let sent = self.send_batch(&mut iter, &mut batch, now);
                if sent < asked {
                    shrink = true;
                    break;
                }
                full_batches += 1;
                if let Some(d) = deadline {
                    if self.clock.now() > d {
                        qdebug!([self], "past processing deadline, pausing egress");
                        self.past_deadline = true;
                        break;
                    }
                }
            }
        }

        if !batch.is_empty() {
            let asked = batch.len();
            let sent = self.send_batch(&mut iter, &mut batch, now);
            if sent < asked {
                shrink = true;
            }
        }

        if shrink {
            self.batch_size = std::cmp::max(MIN_OUT_BATCH_SIZE, self.batch_size >> 1);
            qdebug!([self], "batch size down to {}", self.batch_size);
        } else if full_batches >= 2 && !self.past_deadline {
            self.batch_size = std::cmp::min(MAX_OUT_BATCH_SIZE, self.batch_size << 1);
            qdebug!([self], "batch size up to {}", self.batch_size);
        }

        self.reheap(iter);
    }

    fn encrypt_packet(
        &mut self,
        conn: ConnectionHandle,
        packet: &mut PacketOut,
        ipv6: bool,
    ) -> EncResult {
        let size = packet.data().len() + ENC_EXPANSION;
        let ctx = self.conns[conn.0].peer_ctx;
        let Some(mut buf) = self.bufs.allocate(ctx, size, ipv6) else {
            return EncResult::NoMem;
        };
        match self.conns[conn.0].ops.encrypt_packet(packet, &mut buf) {
            EncryptOutcome::Ok(len) => {
                debug_assert!(len <= buf.len());
                packet.enc = Some(EncData { buf, len, ipv6 });
                EncResult::Ok
            }
            EncryptOutcome::NoMem => {
                self.bufs.reclaim(ctx, buf, ipv6);
                EncResult::NoMem
            }
            EncryptOutcome::BadCrypt => {
                self.bufs.reclaim(ctx, buf, ipv6);
                EncResult::BadCrypt
            }
        }
    }

    /// Broken keys: close the connection right here, without giving the
    /// rest of the round up.
    fn close_on_badcrypt(
        &mut self,
        conn: ConnectionHandle,
        closed: &mut Vec<ConnectionHandle>,
        iter: &mut OutIter,
    ) {
        if !self.conns[conn.0].flags.contains(ConnFlag::Closing) {
            self.incref(conn, ConnFlag::Closing);
            self.unhash_conn(conn);
            closed.push(conn);
        }
        // The connection may be parked on the ATTQ from an earlier
        // round; the closing reference must end up being the last one.
        self.remove_from_attq(conn);
        iter.remove(&mut self.conns, conn);
        self.decref(conn, ConnFlag::HasOutgoing);
        if self.conns[conn.0].flags.contains(ConnFlag::Ticked) {
            self.decref(conn, ConnFlag::Ticked);
        }
    }

    /// Flush the batch. Returns how many datagrams the sink accepted.
    fn send_batch(
        &mut self,
        iter: &mut OutIter,
        batch: &mut Vec<BatchedPacket>,
        now: Time,
    ) -> usize {
        // Sent times go on before the sink call so a blocking sink
        // cannot make the measured RTT shorter than it is.
        for bp in batch.iter_mut() {
            bp.packet.sent_time = now;
        }
        let ecn_on = self.settings.ecn;
        let ret = {
            let conns = &self.conns;
            let specs: Vec<OutSpec<'_>> = batch
                .iter()
                .map(|bp| {
                    let c = &conns[bp.conn.0];
                    OutSpec {
                        data: bp.packet.enc_bytes(),
                        ecn: if ecn_on { bp.packet.ecn() } else { Ecn::NotEct },
                        peer_ctx: c.peer_ctx,
                        local: c.local,
                        peer: c.peer,
                    }
                })
                .collect();
            self.sink.send(&specs)
        };
        let asked = batch.len();
        if ret < 0 {
            qerror!([self], "sink error {ret}, treating as nothing sent");
        }
        let n_sent = usize::try_from(ret).unwrap_or(0).min(asked);
        if n_sent < asked {
            self.can_send = false;
            self.resume_sending_at = now + RESUME_SEND_TIMEOUT;
            qdebug!([self], "sink took {n_sent} of {asked}, sending paused");
        }
        // The engine-wide stamp carries the order across batches that
        // share one clock sample.
        let base = std::cmp::max(now, self.last_sent);
        if n_sent > 0 {
            self.last_sent = base + n_sent as u64;
        }

        let unsent = batch.split_off(n_sent);
        for (i, mut bp) in batch.drain(..).enumerate() {
            let conn = bp.conn;
            // The +i offset keeps the batch order visible in the heap
            // keys even though the whole batch shares one timestamp.
            self.conns[conn.0].last_sent = base + i as u64;
            let enc = bp.packet.enc.take();
            self.conns[conn.0].ops.packet_sent(bp.packet);
            if let Some(e) = enc {
                let ctx = self.conns[conn.0].peer_ctx;
                self.bufs.release(ctx, e.buf, e.ipv6);
            }
        }
        // Unsent packets go back last-first, so each connection sees
        // them again in transmit order on the retry.
        for bp in unsent.into_iter().rev() {
            let conn = bp.conn;
            self.conns[conn.0].ops.packet_not_sent(bp.packet);
            iter.reactivate(&mut self.conns, conn);
        }
        n_sent
    }

    /// Put everything the round touched back where it belongs:
    /// still-active connections rejoin the outgoing heap under their
    /// new last-sent key, drained ones lose their outgoing reference.
    fn reheap(&mut self, mut iter: OutIter) {
        while let Some(conn) = iter.active.pop_front() {
            if !self.conns.contains(conn.0) || self.conns[conn.0].coi != CoiState::Active {
                continue;
            }
            self.conns[conn.0].coi = CoiState::Out;
            let key = self.conns[conn.0].last_sent;
            self.outgoing.insert(key, conn);
        }
        for conn in std::mem::take(&mut iter.inactive) {
            if !self.conns.contains(conn.0) || self.conns[conn.0].coi != CoiState::Inactive {
                continue;
            }
            self.conns[conn.0].coi = CoiState::Out;
            self.decref(conn, ConnFlag::HasOutgoing);
        }
        // Connections the round never reached keep their old keys.
        while let Some((key, conn)) = iter.heap.pop() {
            self.outgoing.insert(key, conn);
        }
    }
}
