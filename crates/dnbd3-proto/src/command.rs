//! Protocol command codes.

use binrw::prelude::*;

/// DNBD3 command codes.
///
/// `GetSize` (legacy, protocol version 1) and `SelectImage` share the wire
/// value `2`; this implementation's minimum supported protocol version is
/// [`crate::PROTOCOL_MIN_VERSION`], so the encoder only ever emits
/// `SelectImage` for that code, but the decoder accepts either name for a
/// peer announcing protocol version 1 (see `DESIGN.md`).
#[derive(BinRead, BinWrite, Debug, Clone, Copy, PartialEq, Eq)]
#[brw(repr(u16))]
pub enum Command {
    GetBlock = 1,
    SelectImage = 2,
    GetServers = 3,
    Error = 4,
    Keepalive = 5,
    LatestRid = 6,
    SetClientMode = 7,
    GetCrc32 = 8,
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::GetBlock => "GET_BLOCK",
            Command::SelectImage => "SELECT_IMAGE",
            Command::GetServers => "GET_SERVERS",
            Command::Error => "ERROR",
            Command::Keepalive => "KEEPALIVE",
            Command::LatestRid => "LATEST_RID",
            Command::SetClientMode => "SET_CLIENT_MODE",
            Command::GetCrc32 => "GET_CRC32",
        };
        write!(f, "{name} ({:#x})", *self as u16)
    }
}
