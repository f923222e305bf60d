//! A one-byte accept/reject handshake layered on the raw transport stream, run immediately after a
//! 5-tuple is established and before the (opaque, externally-implemented) Noise_IK handshake
//! begins.
//!
//! [`crate::rpc::HandshakeCipher::initiate`]/`respond` never touch the transport stream themselves
//! — the real Noise_IK exchange they stand in for is out of scope for this crate — so a
//! server-side router veto has no way to reach the connecting peer unless something at this layer
//! carries it. This sentinel is that something: one byte of protocol this crate owns on the wire
//! before handing the stream off to whatever cipher an embedder plugs in.

use crate::{error::Result, rpc::ReadHalf, socket::WriteHalf};
use bytes::Bytes;

const ADMIT: u8 = 1;
const REJECT: u8 = 0;

pub(crate) async fn write_decision(write_half: &mut dyn WriteHalf, admit: bool) -> Result<()> {
    let byte = if admit { ADMIT } else { REJECT };
    write_half.write(Bytes::copy_from_slice(&[byte])).await
}

/// `Ok(false)` means the peer's router hook vetoed the connection. A stream closed before any
/// byte arrives is treated the same way: a peer that drops the connection outright is
/// indistinguishable from one that explicitly declined.
pub(crate) async fn read_decision(read_half: &mut dyn ReadHalf) -> Result<bool> {
    match read_half.read().await? {
        Some(bytes) => Ok(bytes.first() == Some(&ADMIT)),
        None => Ok(false),
    }
}
