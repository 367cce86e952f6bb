//! Low-level byte builder used by the encoder.

use super::attr::{NLA_HDRLEN, NlAttr, nla_align};
use super::error::{Error, Result};
use super::message::{NLMSG_HDRLEN, NlMsgHdr, nlmsg_align};

/// Token returned when opening a length-prefixed region.
///
/// Both attributes and `rtnexthop` records start with a native-endian
/// `u16` length, so one token type covers both.
#[derive(Debug, Clone, Copy)]
pub struct NestToken {
    offset: usize,
}

/// Builder for netlink message bytes.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    buf: Vec<u8>,
    /// Offset of the first region too long for its `u16` length.
    oversized: Option<usize>,
}

impl MessageBuilder {
    /// Create a builder from an existing header. Length is fixed up in `finish`.
    pub fn with_header(header: NlMsgHdr) -> Self {
        let mut buf = vec![0u8; NLMSG_HDRLEN];
        buf[..std::mem::size_of::<NlMsgHdr>()].copy_from_slice(header.as_bytes());
        Self {
            buf,
            oversized: None,
        }
    }

    /// Create a new message builder with the given type and flags.
    pub fn new(msg_type: u16, flags: u16) -> Self {
        Self::with_header(NlMsgHdr::new(msg_type, flags))
    }

    /// Get the current message length.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Check if the message is empty (header only).
    pub fn is_empty(&self) -> bool {
        self.buf.len() == NLMSG_HDRLEN
    }

    /// Append raw bytes without padding.
    pub fn append_raw(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pad the buffer with zeroes to the next 4-byte boundary.
    pub fn align(&mut self) {
        let aligned = nlmsg_align(self.buf.len());
        self.buf.resize(aligned, 0);
    }

    /// Append raw bytes followed by alignment padding.
    pub fn append_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        self.align();
    }

    /// Append an attribute. `attr_type` carries any flag bits verbatim.
    pub fn append_attr(&mut self, attr_type: u16, data: &[u8]) {
        if data.len() + NLA_HDRLEN > usize::from(u16::MAX) {
            self.oversized.get_or_insert(self.buf.len());
        }
        let attr = NlAttr::new(attr_type, data.len());
        self.buf.extend_from_slice(attr.as_bytes());
        self.buf.extend_from_slice(data);
        let aligned = nla_align(self.buf.len());
        self.buf.resize(aligned, 0);
    }

    /// Start an attribute whose payload is written by subsequent calls.
    pub fn nest_start(&mut self, attr_type: u16) -> NestToken {
        let offset = self.buf.len();
        let attr = NlAttr::new(attr_type, 0);
        self.buf.extend_from_slice(attr.as_bytes());
        NestToken { offset }
    }

    /// End an attribute started with `nest_start`, back-patching its length.
    pub fn nest_end(&mut self, token: NestToken) {
        self.patch_len(token);
        let aligned = nla_align(self.buf.len());
        self.buf.resize(aligned, 0);
    }

    /// Start a record whose first field is its own `u16` length.
    pub fn record_start(&mut self) -> NestToken {
        NestToken {
            offset: self.buf.len(),
        }
    }

    /// End a record started with `record_start`.
    pub fn record_end(&mut self, token: NestToken) {
        self.patch_len(token);
        self.align();
    }

    fn patch_len(&mut self, token: NestToken) {
        let len = u16::try_from(self.buf.len() - token.offset).unwrap_or_else(|_| {
            self.oversized.get_or_insert(token.offset);
            u16::MAX
        });
        self.buf[token.offset..token.offset + 2].copy_from_slice(&len.to_ne_bytes());
    }

    /// Set the sequence number.
    pub fn set_seq(&mut self, seq: u32) {
        self.buf[8..12].copy_from_slice(&seq.to_ne_bytes());
    }

    /// Set the port ID.
    pub fn set_pid(&mut self, pid: u32) {
        self.buf[12..16].copy_from_slice(&pid.to_ne_bytes());
    }

    /// Finalize, failing when an attribute or record outgrew its length
    /// field.
    pub fn try_finish(self) -> Result<Vec<u8>> {
        if let Some(offset) = self.oversized {
            return Err(Error::InvalidMessage(format!(
                "attribute at offset {offset} exceeds {} bytes",
                u16::MAX
            )));
        }
        Ok(self.finish())
    }

    /// Finalize and return the message bytes.
    pub fn finish(mut self) -> Vec<u8> {
        let len = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&len.to_ne_bytes());
        self.buf
    }

    /// Get the current buffer for inspection.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}
