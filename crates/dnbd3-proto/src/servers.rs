//! `GET_SERVERS` reply entries.

use binrw::prelude::*;

use crate::host::Host;

/// One entry in a `GET_SERVERS` reply: 19 bytes total (16-byte address + a
/// 2-byte port + a 1-byte fail-count hint). Unlike a [`Host`], the wire form
/// here carries no family tag — see [`Host::from_wire`] for how the family
/// is recovered.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerEntry {
    addr: [u8; 16],
    port: u16,
    pub fail_hint: u8,
}

impl ServerEntry {
    pub const WIRE_SIZE: usize = 19;

    pub fn new(host: Host, fail_hint: u8) -> Self {
        ServerEntry {
            addr: host.to_wire_addr(),
            port: host.port(),
            fail_hint,
        }
    }

    pub fn host(&self) -> Host {
        Host::from_wire(self.addr, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Host;
    use binrw::io::Cursor;
    use std::net::Ipv4Addr;

    #[test]
    fn server_entry_roundtrip() {
        let host = Host::new_v4(Ipv4Addr::new(10, 0, 0, 1), 5003);
        let entry = ServerEntry::new(host, 2);

        let mut buf = Cursor::new(Vec::new());
        entry.write(&mut buf).unwrap();
        let bytes = buf.into_inner();
        assert_eq!(bytes.len(), ServerEntry::WIRE_SIZE);

        let decoded = ServerEntry::read(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(decoded.host(), host);
        assert_eq!(decoded.fail_hint, 2);
    }
}
