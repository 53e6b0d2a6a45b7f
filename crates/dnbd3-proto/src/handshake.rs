//! `SELECT_IMAGE` handshake payloads.

use binrw::prelude::*;

use crate::error::Error;

/// Client → server: "give me this image at this revision (0 = latest)".
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectImageRequest {
    pub flags: u8,
    #[bw(try_calc(u16::try_from(name_bytes.len())))]
    name_len: u16,
    #[br(count = name_len)]
    name_bytes: Vec<u8>,
    pub requested_rid: u16,
}

impl SelectImageRequest {
    pub fn new(name: &str, requested_rid: u16, flags: u8) -> Result<Self, Error> {
        if name.len() > u16::MAX as usize {
            return Err(Error::NameTooLong(name.len()));
        }
        Ok(SelectImageRequest {
            flags,
            name_bytes: name.as_bytes().to_vec(),
            requested_rid,
        })
    }

    pub fn name(&self) -> &str {
        std::str::from_utf8(&self.name_bytes).unwrap_or_default()
    }
}

/// Server → client: the geometry of the image that was actually selected.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectImageReply {
    pub protocol_version: u16,
    #[bw(try_calc(u16::try_from(name_bytes.len())))]
    name_len: u16,
    #[br(count = name_len)]
    name_bytes: Vec<u8>,
    pub rid: u16,
    pub size: u64,
}

impl SelectImageReply {
    pub fn new(protocol_version: u16, name: &str, rid: u16, size: u64) -> Result<Self, Error> {
        if name.len() > u16::MAX as usize {
            return Err(Error::NameTooLong(name.len()));
        }
        Ok(SelectImageReply {
            protocol_version,
            name_bytes: name.as_bytes().to_vec(),
            rid,
            size,
        })
    }

    pub fn name(&self) -> &str {
        std::str::from_utf8(&self.name_bytes).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use binrw::io::Cursor;

    #[test]
    fn select_image_request_roundtrip() {
        let req = SelectImageRequest::new("img/a", 0, 0).unwrap();
        let mut buf = Cursor::new(Vec::new());
        req.write(&mut buf).unwrap();
        let bytes = buf.into_inner();

        let decoded = SelectImageRequest::read(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(decoded.name(), "img/a");
        assert_eq!(decoded.requested_rid, 0);
    }

    #[test]
    fn select_image_reply_roundtrip() {
        let reply = SelectImageReply::new(2, "img/a", 7, 8 * 1024 * 1024).unwrap();
        let mut buf = Cursor::new(Vec::new());
        reply.write(&mut buf).unwrap();
        let bytes = buf.into_inner();

        let decoded = SelectImageReply::read(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(decoded.name(), "img/a");
        assert_eq!(decoded.rid, 7);
        assert_eq!(decoded.size, 8 * 1024 * 1024);
    }
}
