// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! End-to-end engine behavior, driven through scriptable connections.

use enumset::enum_set;
use qmux_common::{Datagram, Ecn, Role};
use qmux_engine::{
    ConnectionId, Engine, EngineSettings, Error, Incoming, PeerCtx, ResetToken, TickFlag, Version,
    ENC_EXPANSION,
};
use test_fixture::{
    addr, addr6, cid, client_engine, default_settings, initial_packet, short_packet, CountingBufs,
    EncryptScript, ManualClock, TestConn, TickLog, VecSink,
};

const START: u64 = 1_000_000;

fn fixtures() -> (ManualClock, VecSink, CountingBufs, Engine) {
    test_fixture::init();
    let clock = ManualClock::new(START);
    let sink = VecSink::new();
    let bufs = CountingBufs::new();
    let engine = client_engine(&clock, &sink, &bufs);
    (clock, sink, bufs, engine)
}

fn engine_with(
    settings: EngineSettings,
    clock: &ManualClock,
    sink: &VecSink,
    bufs: &CountingBufs,
) -> Engine {
    test_fixture::init();
    Engine::with_clock(
        Role::Client,
        settings,
        sink.boxed(),
        bufs.boxed(),
        Box::new(clock.clone()),
    )
    .expect("settings are valid")
}

fn dgram(payload: Vec<u8>) -> Datagram {
    Datagram::new(addr(4433), addr(443), Ecn::NotEct, payload)
}

/// An echo connection sees a 1200-byte Initial and answers with one
/// datagram within a single processing round.
#[test]
fn singleton_round_trip() {
    let (_clock, sink, bufs, mut engine) = fixtures();
    let client_cid = cid(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
    let conn = TestConn::new(client_cid);
    conn.set_echo(true);
    let _h = engine
        .connect(conn.boxed(), addr(443), addr(4433), PeerCtx(7))
        .unwrap();
    engine.sanity_check();

    let packet = initial_packet(&client_cid, 1200);
    assert_eq!(
        engine.packet_in(&dgram(packet), PeerCtx(7)),
        Ok(Incoming::Delivered)
    );
    engine.sanity_check();
    assert_eq!(conn.received(), vec![1200]);

    engine.process_conns();
    engine.sanity_check();

    assert_eq!(sink.calls(), 1);
    assert_eq!(sink.datagrams(), vec![1200 + ENC_EXPANSION]);
    assert_eq!(conn.sent(), vec![1200]);
    assert_eq!(bufs.outstanding(), 0);

    // The connection parked itself on the advisory queue with a finite
    // tick time.
    assert_eq!(engine.count_attq(25_000), 1);
    assert_eq!(engine.count_attq(24_999), 0);
    assert_eq!(engine.earliest_adv_tick(), Some(25_000));

    // Idempotence: nothing new came in, so nothing more goes out.
    engine.process_conns();
    engine.process_conns();
    engine.sanity_check();
    assert_eq!(sink.calls(), 1);
    assert_eq!(conn.sent(), vec![1200]);
}

/// The sink takes 3 of 5 datagrams: sending pauses, the batch size
/// shrinks, and the leftovers come back in reverse so retry order is
/// preserved.
#[test]
fn backpressure_pauses_sending() {
    let (clock, sink, bufs, mut engine) = fixtures();
    let conn = TestConn::new(cid(&[1; 8]));
    for len in 1001..=1005 {
        conn.queue_send(len);
    }
    engine
        .connect(conn.boxed(), addr(443), addr(4433), PeerCtx(0))
        .unwrap();
    sink.accept_next(3);

    engine.process_conns();
    engine.sanity_check();

    assert_eq!(sink.batch_sizes(), vec![5]);
    assert_eq!(conn.sent(), vec![1001, 1002, 1003]);
    assert_eq!(conn.not_sent(), vec![1005, 1004]);
    assert_eq!(engine.out_batch_size(), 16);
    assert!(engine.has_unsent_packets());

    // Exactly at the resume time the engine stays paused...
    clock.set(START + 1_000_000);
    engine.process_conns();
    engine.sanity_check();
    assert_eq!(sink.calls(), 1);
    assert!(engine.has_unsent_packets());

    // ...one microsecond later the failsafe re-arms it.
    clock.advance(1);
    engine.process_conns();
    engine.sanity_check();
    assert_eq!(sink.batch_sizes(), vec![5, 2]);
    assert_eq!(conn.sent(), vec![1001, 1002, 1003, 1004, 1005]);
    assert!(!engine.has_unsent_packets());
    assert_eq!(bufs.outstanding(), 0);
}

/// Two coalesced packets, the second truncated: the first is delivered,
/// the call reports a parse error.
#[test]
fn partial_parse_delivers_then_errors() {
    let (_clock, _sink, _bufs, mut engine) = fixtures();
    let conn = TestConn::new(cid(&[1; 8]));
    engine
        .connect(conn.boxed(), addr(443), addr(4433), PeerCtx(0))
        .unwrap();

    let mut buf = initial_packet(&cid(&[1; 8]), 200);
    let mut second = initial_packet(&cid(&[1; 8]), 300);
    second.truncate(150);
    buf.extend_from_slice(&second);

    assert_eq!(
        engine.packet_in(&dgram(buf), PeerCtx(0)),
        Err(Error::InvalidPacket)
    );
    engine.sanity_check();
    assert_eq!(conn.received(), vec![200]);
}

/// A short-header datagram for no known connection whose tail matches a
/// registered token resets that connection and makes it tickable.
#[test]
fn stateless_reset_matches_token() {
    let clock = ManualClock::new(START);
    let sink = VecSink::new();
    let bufs = CountingBufs::new();
    let settings = EngineSettings {
        honor_prst: true,
        ..default_settings()
    };
    let mut engine = engine_with(settings, &clock, &sink, &bufs);
    let conn = TestConn::new(cid(&[1; 8]));
    let h = engine
        .connect(conn.boxed(), addr(443), addr(4433), PeerCtx(0))
        .unwrap();
    let token = ResetToken([0xaa; 16]);
    engine.add_reset_token(h, token);
    engine.process_conns();
    engine.sanity_check();
    assert_eq!(conn.ticks(), 1);

    // Unknown DCID, correct trailing token.
    let mut packet = short_packet(&cid(&[9; 8]), 64);
    let tail = packet.len() - 16;
    packet[tail..].copy_from_slice(&token.0);
    assert_eq!(
        engine.packet_in(&dgram(packet), PeerCtx(0)),
        Ok(Incoming::Unclaimed)
    );
    engine.sanity_check();
    assert!(conn.was_reset());
    assert!(conn.received().is_empty());

    // The reset connection got queued for an immediate tick.
    assert_eq!(engine.earliest_adv_tick(), Some(0));
    engine.process_conns();
    engine.sanity_check();
    assert_eq!(conn.ticks(), 2);
}

/// Without `honor_prst`, the same datagram does nothing.
#[test]
fn stateless_reset_needs_honor_prst() {
    let (_clock, _sink, _bufs, mut engine) = fixtures();
    let conn = TestConn::new(cid(&[1; 8]));
    let h = engine
        .connect(conn.boxed(), addr(443), addr(4433), PeerCtx(0))
        .unwrap();
    let token = ResetToken([0xaa; 16]);
    engine.add_reset_token(h, token);

    let mut packet = short_packet(&cid(&[9; 8]), 64);
    let tail = packet.len() - 16;
    packet[tail..].copy_from_slice(&token.0);
    assert_eq!(
        engine.packet_in(&dgram(packet), PeerCtx(0)),
        Ok(Incoming::Unclaimed)
    );
    assert!(!conn.was_reset());
    engine.sanity_check();
}

/// A 1 microsecond processing deadline and a sink that takes 2: egress
/// stops after the first batch and advertises immediate work.
#[test]
fn deadline_stops_egress() {
    let clock = ManualClock::new(START);
    let sink = VecSink::new();
    let bufs = CountingBufs::new();
    let settings = EngineSettings {
        proc_time_thresh: 1,
        ..default_settings()
    };
    let mut engine = engine_with(settings, &clock, &sink, &bufs);
    let conn = TestConn::new(cid(&[1; 8]));
    for _ in 0..40 {
        conn.queue_send(100);
    }
    engine
        .connect(conn.boxed(), addr(443), addr(4433), PeerCtx(0))
        .unwrap();
    sink.set_delay(2, &clock);

    engine.process_conns();
    engine.sanity_check();

    assert_eq!(sink.batch_sizes(), vec![32]);
    assert!(engine.has_unsent_packets());
    assert_eq!(engine.earliest_adv_tick(), Some(0));

    // The next round starts a fresh deadline and drains the rest.
    engine.process_conns();
    engine.sanity_check();
    assert_eq!(sink.batch_sizes(), vec![32, 8]);
    assert!(!engine.has_unsent_packets());
}

/// Address-keyed mode allows one connection per local port.
#[test]
fn one_connection_per_port_in_cidless_mode() {
    let clock = ManualClock::new(START);
    let sink = VecSink::new();
    let bufs = CountingBufs::new();
    let settings = EngineSettings {
        scid_len: 0,
        ..default_settings()
    };
    let mut engine = engine_with(settings, &clock, &sink, &bufs);

    let first = TestConn::new(ConnectionId::EMPTY);
    engine
        .connect(first.boxed(), addr(7000), addr(8000), PeerCtx(0))
        .unwrap();
    engine.sanity_check();

    let second = TestConn::new(ConnectionId::EMPTY);
    let err = engine
        .connect(second.boxed(), addr(7000), addr(9000), PeerCtx(0))
        .unwrap_err();
    assert_eq!(err, Error::DuplicatePort);
    assert_eq!(
        err.to_string(),
        "cannot have more than one connection on the same port"
    );
    assert!(second.was_destroyed());
    assert_eq!(engine.conn_count(), 1);
    engine.sanity_check();
}

/// A tick that reports both SEND and CLOSE: the packets get one egress
/// chance, then the connection is destroyed at the end of the round.
#[test]
fn send_and_close_in_one_tick() {
    let (_clock, sink, _bufs, mut engine) = fixtures();
    let conn = TestConn::new(cid(&[1; 8]));
    conn.queue_send(500);
    conn.script_tick(enum_set!(TickFlag::Send | TickFlag::Close));
    engine
        .connect(conn.boxed(), addr(443), addr(4433), PeerCtx(0))
        .unwrap();

    engine.process_conns();
    engine.sanity_check();

    assert_eq!(conn.sent(), vec![500]);
    assert_eq!(sink.datagrams(), vec![500 + ENC_EXPANSION]);
    assert!(conn.was_destroyed());
    assert_eq!(engine.conn_count(), 0);
}

/// BADCRYPT tears down just the offending connection; the engine keeps
/// going.
#[test]
fn badcrypt_closes_connection() {
    let (_clock, sink, bufs, mut engine) = fixtures();
    let bad = TestConn::new(cid(&[1; 8]));
    bad.queue_send(100);
    bad.script_encrypt(EncryptScript::BadCrypt);
    let good = TestConn::new(cid(&[2; 8]));
    good.queue_send(200);
    engine
        .connect(bad.boxed(), addr(443), addr(4433), PeerCtx(0))
        .unwrap();
    engine
        .connect(good.boxed(), addr(444), addr(4434), PeerCtx(0))
        .unwrap();

    engine.process_conns();
    engine.sanity_check();

    assert!(bad.was_destroyed());
    assert_eq!(bad.not_sent(), vec![100]);
    assert!(!good.was_destroyed());
    assert_eq!(good.sent(), vec![200]);
    assert_eq!(sink.datagrams(), vec![200 + ENC_EXPANSION]);
    assert_eq!(bufs.reclaimed(), 1);
    assert_eq!(engine.conn_count(), 1);
}

/// BADCRYPT on a connection that was parked on the advisory queue in an
/// earlier round: the ATTQ reference must fall with the others, or the
/// connection lingers undestroyed.
#[test]
fn badcrypt_clears_attq_reference() {
    let (_clock, sink, _bufs, mut engine) = fixtures();

    // One backpressured connection first, so sending is paused and the
    // victim's first round ends without an egress attempt.
    let other = TestConn::new(cid(&[2; 8]));
    other.queue_send(50);
    engine
        .connect(other.boxed(), addr(444), addr(4434), PeerCtx(0))
        .unwrap();
    sink.accept_next(0);
    engine.process_conns();
    engine.sanity_check();

    let victim = TestConn::new(cid(&[1; 8]));
    victim.queue_send(100);
    victim.script_encrypt(EncryptScript::BadCrypt);
    engine
        .connect(victim.boxed(), addr(443), addr(4433), PeerCtx(0))
        .unwrap();
    // Sending is still paused, so this round only ticks the victim and
    // parks it on the ATTQ with its packet still queued.
    engine.process_conns();
    engine.sanity_check();
    assert_eq!(engine.count_attq(25_000), 2);
    assert!(engine.has_unsent_packets());

    // A later egress round, well before the ATTQ entry comes due.
    engine.send_unsent_packets();
    engine.sanity_check();

    assert!(victim.was_destroyed());
    assert_eq!(victim.not_sent(), vec![100]);
    assert_eq!(engine.conn_count(), 1);
    assert_eq!(engine.count_attq(25_000), 1);
    assert_eq!(other.sent(), vec![50]);
}

/// Buffer exhaustion unwinds the packet and retries on the next call.
#[test]
fn alloc_failure_retries_later() {
    let (_clock, sink, bufs, mut engine) = fixtures();
    let conn = TestConn::new(cid(&[1; 8]));
    conn.queue_send(100);
    engine
        .connect(conn.boxed(), addr(443), addr(4433), PeerCtx(0))
        .unwrap();
    bufs.fail_next(1);

    engine.process_conns();
    engine.sanity_check();
    assert_eq!(sink.calls(), 0);
    assert_eq!(conn.not_sent(), vec![100]);
    assert!(engine.has_unsent_packets());

    engine.send_unsent_packets();
    engine.sanity_check();
    assert_eq!(conn.sent(), vec![100]);
    assert!(!engine.has_unsent_packets());
    assert_eq!(bufs.outstanding(), 0);
}

/// A peer that moves to another address family invalidates buffers that
/// were already encrypted; they are returned and the packets redone.
#[test]
fn family_change_forces_reencryption() {
    let (_clock, sink, bufs, mut engine) = fixtures();
    let conn = TestConn::new(cid(&[1; 8]));
    conn.queue_send(300);
    conn.queue_send(301);
    engine
        .connect(conn.boxed(), addr(443), addr(4433), PeerCtx(0))
        .unwrap();
    sink.accept_next(0);

    engine.process_conns();
    engine.sanity_check();
    assert_eq!(conn.not_sent(), vec![301, 300]);
    assert_eq!(bufs.outstanding(), 2);

    // The peer shows up from an IPv6 address.
    let moved = Datagram::new(addr6(4433), addr6(443), Ecn::NotEct, short_packet(&cid(&[1; 8]), 64));
    assert_eq!(engine.packet_in(&moved, PeerCtx(0)), Ok(Incoming::Delivered));

    engine.send_unsent_packets();
    engine.sanity_check();
    assert_eq!(bufs.reclaimed(), 2);
    assert_eq!(conn.sent(), vec![300, 301]);
    assert_eq!(bufs.outstanding(), 0);
}

/// Full batches under the deadline grow the batch size; it never leaves
/// its bounds.
#[test]
fn batch_size_grows_and_clamps() {
    let (_clock, sink, _bufs, mut engine) = fixtures();
    let conn = TestConn::new(cid(&[1; 8]));
    conn.keep_tickable(true);
    engine
        .connect(conn.boxed(), addr(443), addr(4433), PeerCtx(0))
        .unwrap();

    // Two full batches plus change per round doubles the size, up to
    // the cap.
    let mut expect = 32;
    while expect < 1024 {
        for _ in 0..2 * engine.out_batch_size() + 1 {
            conn.queue_send(10);
        }
        engine.process_conns();
        engine.sanity_check();
        expect *= 2;
        assert_eq!(engine.out_batch_size(), expect);
    }
    for _ in 0..2 * engine.out_batch_size() + 1 {
        conn.queue_send(10);
    }
    engine.process_conns();
    engine.sanity_check();
    assert_eq!(engine.out_batch_size(), 1024);
    assert!(sink.calls() > 0);
}

/// Refused batches shrink the batch size down to its floor, not past
/// it.
#[test]
fn batch_size_shrinks_to_floor() {
    let (_clock, sink, _bufs, mut engine) = fixtures();
    let conn = TestConn::new(cid(&[1; 8]));
    conn.queue_send(100);
    engine
        .connect(conn.boxed(), addr(443), addr(4433), PeerCtx(0))
        .unwrap();
    // Refuse everything; the unsent packet keeps the outgoing queue
    // primed for the next round.
    sink.accept_next(0);
    engine.process_conns();
    engine.sanity_check();
    assert_eq!(engine.out_batch_size(), 16);

    let sizes: Vec<usize> = (0..4)
        .map(|_| {
            sink.accept_next(0);
            engine.send_unsent_packets();
            engine.sanity_check();
            engine.out_batch_size()
        })
        .collect();
    assert_eq!(sizes, vec![8, 4, 4, 4]);
}

/// Ticks happen oldest-last-ticked first, and that order is stable
/// across rounds.
#[test]
fn tick_order_is_stable() {
    let (_clock, _sink, _bufs, mut engine) = fixtures();
    let log = TickLog::default();
    let conns: Vec<TestConn> = (1..=3_u8)
        .map(|i| {
            let conn = TestConn::new(cid(&[i; 8]));
            conn.keep_tickable(true);
            conn.log_ticks(&log);
            engine
                .connect(conn.boxed(), addr(1000 + u16::from(i)), addr(4433), PeerCtx(0))
                .unwrap();
            conn
        })
        .collect();

    engine.process_conns();
    engine.sanity_check();
    let first = log.order();
    assert_eq!(first.len(), 3);

    engine.process_conns();
    engine.process_conns();
    engine.sanity_check();
    let all = log.order();
    assert_eq!(all.len(), 9);
    assert_eq!(&all[3..6], &first[..]);
    assert_eq!(&all[6..9], &first[..]);
    for conn in &conns {
        assert_eq!(conn.ticks(), 3);
    }
}

/// In address-keyed mode, a CID carried by the packet must agree with
/// the connection it routes to.
#[test]
fn address_mode_verifies_cid() {
    let clock = ManualClock::new(START);
    let sink = VecSink::new();
    let bufs = CountingBufs::new();
    let settings = EngineSettings {
        scid_len: 0,
        versions: enum_set!(Version::Q043 | Version::V1),
        ..default_settings()
    };
    let mut engine = engine_with(settings, &clock, &sink, &bufs);
    let conn = TestConn::new(cid(&[3; 8]));
    conn.set_version(Version::Q043);
    engine
        .connect(conn.boxed(), addr(443), addr(4433), PeerCtx(0))
        .unwrap();

    let gquic = |c: &[u8]| {
        let mut p = vec![0x09];
        p.extend_from_slice(c);
        p.extend_from_slice(&0x5130_3433_u32.to_be_bytes());
        p.resize(80, 0);
        p
    };
    assert_eq!(
        engine.packet_in(&dgram(gquic(&[3; 8])), PeerCtx(0)),
        Ok(Incoming::Delivered)
    );
    assert_eq!(
        engine.packet_in(&dgram(gquic(&[4; 8])), PeerCtx(0)),
        Ok(Incoming::Unclaimed)
    );
    assert_eq!(conn.received(), vec![80]);

    // No connection on the local address at all: that is an error.
    let stray = Datagram::new(addr(4433), addr(9999), Ecn::NotEct, gquic(&[3; 8]));
    assert_eq!(
        engine.packet_in(&stray, PeerCtx(0)),
        Err(Error::UnknownConnection)
    );
    engine.sanity_check();
}

/// Legacy public resets are dropped unless the engine honors them.
#[test]
fn public_reset_honoring() {
    let clock = ManualClock::new(START);
    let sink = VecSink::new();
    let bufs = CountingBufs::new();
    let base = EngineSettings {
        scid_len: 0,
        versions: enum_set!(Version::Q043 | Version::V1),
        ..default_settings()
    };

    let reset = {
        let mut p = vec![0x0a];
        p.extend_from_slice(&[3; 8]);
        p.resize(64, 0);
        p
    };

    let mut ignoring = engine_with(base.clone(), &clock, &sink, &bufs);
    let conn = TestConn::new(cid(&[3; 8]));
    conn.set_version(Version::Q043);
    ignoring
        .connect(conn.boxed(), addr(443), addr(4433), PeerCtx(0))
        .unwrap();
    assert_eq!(
        ignoring.packet_in(&dgram(reset.clone()), PeerCtx(0)),
        Ok(Incoming::Unclaimed)
    );
    assert!(conn.received().is_empty());

    let settings = EngineSettings {
        honor_prst: true,
        ..base
    };
    let mut honoring = engine_with(settings, &clock, &sink, &bufs);
    let conn = TestConn::new(cid(&[3; 8]));
    conn.set_version(Version::Q043);
    honoring
        .connect(conn.boxed(), addr(443), addr(4433), PeerCtx(0))
        .unwrap();
    assert_eq!(
        honoring.packet_in(&dgram(reset), PeerCtx(0)),
        Ok(Incoming::Delivered)
    );
    assert_eq!(conn.received(), vec![64]);
}

/// The engine advertises the supported subset of its configured
/// versions.
#[test]
fn quic_versions_reports_offered_set() {
    let (_clock, _sink, _bufs, engine) = fixtures();
    assert_eq!(engine.quic_versions(), enum_set!(Version::V1));
}
