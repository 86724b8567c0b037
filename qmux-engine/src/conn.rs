// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The contracts the engine consumes: the per-connection state machine,
//! the packet buffer allocator, and the datagram sink.

use std::net::SocketAddr;

use enumset::{EnumSet, EnumSetType};
use qmux_common::{Ecn, Time};

use crate::{cid::ConnectionId, packet::PacketIn, version::Version};

/// Worst-case growth of a packet when it is encrypted (the AEAD tag).
/// Buffers handed to [`ConnectionOps::encrypt_packet`] are sized
/// payload plus this.
pub const ENC_EXPANSION: usize = 16;

pub const RESET_TOKEN_LEN: usize = 16;

/// The 16-byte token that closes out a stateless reset datagram.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ResetToken(pub [u8; RESET_TOKEN_LEN]);

impl ResetToken {
    /// Read a token off the tail of a datagram.
    ///
    /// # Panics
    /// When `data` is shorter than [`RESET_TOKEN_LEN`].
    #[must_use]
    pub fn from_suffix(data: &[u8]) -> Self {
        let mut token = [0; RESET_TOKEN_LEN];
        token.copy_from_slice(&data[data.len() - RESET_TOKEN_LEN..]);
        Self(token)
    }
}

/// Opaque per-peer token the caller attaches to a connection; it rides
/// along to the sink and the buffer allocator unchanged.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PeerCtx(pub u64);

/// What a connection wants after a tick.
#[derive(Debug, EnumSetType)]
pub enum TickFlag {
    /// The connection has packets to send.
    Send,
    /// The connection is done and should be destroyed after its packets
    /// get one chance to go out.
    Close,
}

/// Result of [`ConnectionOps::encrypt_packet`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncryptOutcome {
    /// Encrypted into the destination buffer; the value is the number
    /// of bytes written.
    Ok(usize),
    /// Transient resource shortage; the packet will be retried.
    NoMem,
    /// Keys are broken; the connection is torn down.
    BadCrypt,
}

#[derive(Debug)]
pub(crate) struct EncData {
    pub(crate) buf: Box<[u8]>,
    pub(crate) len: usize,
    /// Address family the buffer was allocated for; a mismatch with the
    /// connection's current peer forces re-encryption.
    pub(crate) ipv6: bool,
}

/// One outgoing packet, owned by the engine from
/// [`ConnectionOps::next_packet_to_send`] until it is handed back via
/// `packet_sent` or `packet_not_sent`.
#[derive(Debug)]
pub struct PacketOut {
    data: Vec<u8>,
    ecn: Ecn,
    pub(crate) enc: Option<EncData>,
    pub(crate) sent_time: Time,
}

impl PacketOut {
    #[must_use]
    pub fn new(data: Vec<u8>, ecn: Ecn) -> Self {
        Self {
            data,
            ecn,
            enc: None,
            sent_time: Time::ZERO,
        }
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub const fn ecn(&self) -> Ecn {
        self.ecn
    }

    /// When the packet was last given to the sink. Stamped just before
    /// the sink call, so a blocking sink cannot shorten the apparent
    /// RTT. [`Time::ZERO`] until then.
    #[must_use]
    pub const fn sent_time(&self) -> Time {
        self.sent_time
    }

    #[must_use]
    pub const fn is_encrypted(&self) -> bool {
        self.enc.is_some()
    }

    pub(crate) fn enc_bytes(&self) -> &[u8] {
        self.enc.as_ref().map_or(&[], |e| &e.buf[..e.len])
    }
}

/// The per-connection state machine, as the engine sees it.
///
/// Implementations carry the handshake, streams, ACK and congestion
/// logic; the engine only schedules them and moves their packets.
pub trait ConnectionOps {
    /// Advance the connection's state machine.
    fn tick(&mut self, now: Time) -> EnumSet<TickFlag>;

    /// The next packet the connection wants on the wire, or `None` if
    /// it is drained for this round.
    fn next_packet_to_send(&mut self) -> Option<PacketOut>;

    /// The packet was accepted by the sink.
    fn packet_sent(&mut self, packet: PacketOut);

    /// The packet did not go out; it should be offered again, in the
    /// same order, on the next round.
    fn packet_not_sent(&mut self, packet: PacketOut);

    /// An incoming packet routed to this connection.
    fn packet_in(&mut self, packet: &PacketIn<'_>);

    /// Whether the connection wants a tick in the next loop iteration.
    fn is_tickable(&self) -> bool;

    /// When the connection next wants to be ticked. A connection that
    /// is not tickable is expected to name a time here.
    fn next_tick_time(&self) -> Option<Time>;

    /// A stateless reset matching this connection's token arrived.
    fn stateless_reset(&mut self);

    /// The engine is releasing the connection. Called exactly once.
    fn destroy(&mut self) {}

    /// Protect `packet` into `dst`, which holds
    /// `packet.data().len() + ENC_EXPANSION` bytes.
    fn encrypt_packet(&mut self, packet: &PacketOut, dst: &mut [u8]) -> EncryptOutcome;

    /// The CID the peer currently addresses this connection by.
    fn primary_cid(&self) -> ConnectionId;

    fn negotiated_version(&self) -> Version;
}

/// Allocator for the buffers encrypted packets are written into. Lets
/// embedders hand out registered or aligned memory for zero-copy I/O.
pub trait PacketBufs {
    /// `None` signals allocation failure; the engine unwinds the packet
    /// and retries later.
    fn allocate(&mut self, peer_ctx: PeerCtx, size: usize, is_ipv6: bool) -> Option<Box<[u8]>>;

    /// The buffer's datagram was handed to the sink.
    fn release(&mut self, peer_ctx: PeerCtx, buf: Box<[u8]>, is_ipv6: bool);

    /// The buffer is coming back without ever reaching the sink (for
    /// example, when an address-family change forces re-encryption).
    fn reclaim(&mut self, peer_ctx: PeerCtx, buf: Box<[u8]>, is_ipv6: bool);
}

/// Plain heap-backed [`PacketBufs`].
#[derive(Clone, Copy, Debug, Default)]
pub struct HeapBufs {}

impl PacketBufs for HeapBufs {
    fn allocate(&mut self, _peer_ctx: PeerCtx, size: usize, _is_ipv6: bool) -> Option<Box<[u8]>> {
        Some(vec![0; size].into_boxed_slice())
    }

    fn release(&mut self, _peer_ctx: PeerCtx, _buf: Box<[u8]>, _is_ipv6: bool) {}

    fn reclaim(&mut self, _peer_ctx: PeerCtx, _buf: Box<[u8]>, _is_ipv6: bool) {}
}

/// One datagram within a batch handed to the sink.
#[derive(Debug)]
pub struct OutSpec<'a> {
    pub data: &'a [u8],
    pub ecn: Ecn,
    pub peer_ctx: PeerCtx,
    pub local: SocketAddr,
    pub peer: SocketAddr,
}

/// Where outgoing datagrams go.
pub trait DatagramSink {
    /// Send a batch. The return value is the number of datagrams
    /// actually sent: equal to `batch.len()` for a full drain, fewer
    /// for backpressure, negative for an error (treated as zero sent).
    fn send(&mut self, batch: &[OutSpec<'_>]) -> isize;
}
