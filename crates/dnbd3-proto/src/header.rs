//! Fixed-size request/reply headers.
//!
//! All multi-byte fields are little-endian on the wire. The magic value is
//! the two ASCII bytes `"rs"` (`0x73 0x72`), transmitted low byte first.

use binrw::prelude::*;

use crate::command::Command;
use crate::constants::MAGIC;
use crate::error::Error;

/// 24-byte request header.
///
/// The offset and hop count share one 8-byte little-endian word: the low 56
/// bits carry the byte offset, the top byte carries the hop count. This is
/// modeled as a raw `u64` plus accessor methods rather than a bitfield type
/// — a raw `u64` plus two shift/mask accessors read just as clearly as a
/// bitfield type and avoid pulling in another derive macro for one field.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    magic: u16,
    pub cmd: Command,
    pub size: u32,
    offset_and_hops: u64,
    pub handle: u64,
}

impl RequestHeader {
    pub const STRUCT_SIZE: usize = 24;

    pub fn new(cmd: Command, offset: u64, size: u32, hops: u8, handle: u64) -> Self {
        RequestHeader {
            magic: MAGIC,
            cmd,
            size,
            offset_and_hops: (offset & 0x00FF_FFFF_FFFF_FFFF) | ((hops as u64) << 56),
            handle,
        }
    }

    pub fn magic(&self) -> u16 {
        self.magic
    }

    pub fn check_magic(&self) -> Result<(), Error> {
        if self.magic != MAGIC {
            Err(Error::BadMagic {
                expected: MAGIC,
                actual: self.magic,
            })
        } else {
            Ok(())
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset_and_hops & 0x00FF_FFFF_FFFF_FFFF
    }

    pub fn hops(&self) -> u8 {
        (self.offset_and_hops >> 56) as u8
    }

    /// Returns a copy of this header with the hop count incremented,
    /// as every proxy forwarding a request must do.
    pub fn with_incremented_hops(&self) -> Self {
        let mut next = *self;
        next.offset_and_hops =
            (next.offset_and_hops & 0x00FF_FFFF_FFFF_FFFF) | (((self.hops() + 1) as u64) << 56);
        next
    }
}

/// 16-byte reply header.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyHeader {
    magic: u16,
    pub cmd: Command,
    pub size: u32,
    pub handle: u64,
}

impl ReplyHeader {
    pub const STRUCT_SIZE: usize = 16;

    pub fn new(cmd: Command, size: u32, handle: u64) -> Self {
        ReplyHeader {
            magic: MAGIC,
            cmd,
            size,
            handle,
        }
    }

    pub fn magic(&self) -> u16 {
        self.magic
    }

    pub fn check_magic(&self) -> Result<(), Error> {
        if self.magic != MAGIC {
            Err(Error::BadMagic {
                expected: MAGIC,
                actual: self.magic,
            })
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use binrw::io::Cursor;

    #[test]
    fn request_header_roundtrip() {
        let header = RequestHeader::new(Command::GetBlock, 0x00AA_BBCC_DDEE_FF, 4096, 3, 0x1122_3344_5566_7788);
        let mut buf = Cursor::new(Vec::new());
        header.write(&mut buf).unwrap();
        let bytes = buf.into_inner();
        assert_eq!(bytes.len(), RequestHeader::STRUCT_SIZE);

        let decoded = RequestHeader::read(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.offset(), 0x00AA_BBCC_DDEE_FF);
        assert_eq!(decoded.hops(), 3);
        assert_eq!(decoded.handle, 0x1122_3344_5566_7788);
    }

    #[test]
    fn request_header_hops_increment_preserves_offset() {
        let header = RequestHeader::new(Command::GetBlock, 4096, 4096, 0, 1);
        let bumped = header.with_incremented_hops();
        assert_eq!(bumped.hops(), 1);
        assert_eq!(bumped.offset(), 4096);
    }

    #[test]
    fn reply_header_roundtrip() {
        let header = ReplyHeader::new(Command::GetBlock, 4096, 42);
        let mut buf = Cursor::new(Vec::new());
        header.write(&mut buf).unwrap();
        let bytes = buf.into_inner();
        assert_eq!(bytes.len(), ReplyHeader::STRUCT_SIZE);

        let decoded = ReplyHeader::read(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut header = ReplyHeader::new(Command::GetBlock, 0, 0);
        header.magic = 0xdead;
        assert!(header.check_magic().is_err());
    }
}
