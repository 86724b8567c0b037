// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The qmux engine: connection multiplexing and packet dispatch for QUIC.
//!
//! The engine owns every live connection in one address space. Datagrams
//! come in through [`Engine::packet_in`], connections are ticked by
//! [`Engine::process_conns`], and outgoing packets leave in batches
//! through the caller-supplied [`DatagramSink`]. Per-connection state
//! machines, cryptography, and sockets all live on the far side of the
//! [`ConnectionOps`], [`PacketBufs`], and [`DatagramSink`] traits.

mod attq;
mod cid;
mod conn;
mod egress;
mod engine;
mod heap;
mod packet;
mod settings;
mod version;

use std::fmt;

pub use self::{
    cid::{ConnectionId, MAX_CID_LEN},
    conn::{
        ConnectionOps, DatagramSink, EncryptOutcome, HeapBufs, OutSpec, PacketBufs, PacketOut,
        PeerCtx, ResetToken, TickFlag, ENC_EXPANSION, RESET_TOKEN_LEN,
    },
    engine::{ConnectionHandle, Engine, Incoming},
    packet::{
        parser_for_version, GquicParser, HeaderKind, HeaderParser, IetfParser, PacketIn,
        ParsedHeader, Q046Parser, SniffingParser, MIN_STATELESS_RESET_SIZE,
    },
    settings::{EngineSettings, MAX_IDLE_TIMEOUT, MAX_SCID_LEN, MIN_FLOW_CONTROL_WINDOW, MIN_SCID_LEN},
    version::Version,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// Settings rejected at engine construction.
    BadSettings(String),
    /// The connection ID is already claimed by another connection.
    DuplicateCid,
    /// In address-keyed mode, only one connection may use a local port.
    DuplicatePort,
    /// A datagram could not be parsed.
    InvalidPacket,
    /// The connection ID entry limit was reached.
    TooManyCids,
    /// No connection owns the datagram's local address.
    UnknownConnection,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::BadSettings(msg) => write!(f, "invalid engine settings: {msg}"),
            Self::DuplicateCid => write!(f, "connection ID is already in use"),
            Self::DuplicatePort => {
                write!(f, "cannot have more than one connection on the same port")
            }
            Self::InvalidPacket => write!(f, "unparseable packet"),
            Self::TooManyCids => write!(f, "connection ID entry limit reached"),
            Self::UnknownConnection => write!(f, "no connection for datagram"),
        }
    }
}

impl std::error::Error for Error {}

pub type Res<T> = Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn error_display() {
        assert_eq!(
            Error::DuplicatePort.to_string(),
            "cannot have more than one connection on the same port"
        );
        assert_eq!(
            Error::BadSettings("x".into()).to_string(),
            "invalid engine settings: x"
        );
    }
}
