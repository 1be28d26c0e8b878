//! Version-1 object headers.
//!
//! Only what the group layer needs: a header is a list of typed messages plus
//! the hard-link count. The symbol-table message is what makes an object a
//! group.

#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

use log::trace;

use crate::codec::{align8, Reader, Sizes, Writer};
use crate::error::FormatError;
use crate::storage::Storage;

/// Bytes before the first message (12-byte prefix padded to 16).
pub const PREFIX_SIZE: usize = 16;

/// Byte position of the link count inside the prefix.
const LINK_COUNT_POS: u64 = 4;

/// Header message types this crate interprets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Nil,
    Dataspace,
    Datatype,
    DataLayout,
    SymbolTable,
    /// Unknown message type with its raw type ID.
    Unknown(u16),
}

impl MessageType {
    pub fn from_u16(val: u16) -> MessageType {
        match val {
            0x0000 => MessageType::Nil,
            0x0001 => MessageType::Dataspace,
            0x0003 => MessageType::Datatype,
            0x0008 => MessageType::DataLayout,
            0x0011 => MessageType::SymbolTable,
            other => MessageType::Unknown(other),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            MessageType::Nil => 0x0000,
            MessageType::Dataspace => 0x0001,
            MessageType::Datatype => 0x0003,
            MessageType::DataLayout => 0x0008,
            MessageType::SymbolTable => 0x0011,
            MessageType::Unknown(v) => v,
        }
    }
}

/// One header message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderMessage {
    pub msg_type: MessageType,
    pub flags: u8,
    pub data: Vec<u8>,
}

impl HeaderMessage {
    pub fn new(msg_type: MessageType, data: Vec<u8>) -> Self {
        HeaderMessage {
            msg_type,
            flags: 0,
            data,
        }
    }
}

/// Symbol table message body: where a group's index and heap live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolTableMessage {
    pub btree_address: u64,
    pub local_heap_address: u64,
}

impl SymbolTableMessage {
    pub fn encode(&self, sizes: Sizes) -> Vec<u8> {
        let mut w = Writer::with_capacity(sizes, 2 * sizes.os());
        w.address(Some(self.btree_address));
        w.address(Some(self.local_heap_address));
        w.finish()
    }

    pub fn decode(data: &[u8], sizes: Sizes) -> Result<SymbolTableMessage, FormatError> {
        let mut r = Reader::new(data, sizes);
        Ok(SymbolTableMessage {
            btree_address: r.defined_address("symbol table B-tree")?,
            local_heap_address: r.defined_address("symbol table heap")?,
        })
    }

    pub fn to_message(&self, sizes: Sizes) -> HeaderMessage {
        HeaderMessage::new(MessageType::SymbolTable, self.encode(sizes))
    }
}

/// A decoded version-1 object header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHeader {
    /// Hard links pointing at this object.
    pub link_count: u32,
    /// Non-nil messages in header order.
    pub messages: Vec<HeaderMessage>,
}

impl ObjectHeader {
    pub fn new(messages: Vec<HeaderMessage>) -> Self {
        ObjectHeader {
            link_count: 0,
            messages,
        }
    }

    fn data_size(&self) -> usize {
        self.messages
            .iter()
            .map(|m| 8 + align8(m.data.len() as u64) as usize)
            .sum()
    }

    /// Total encoded size.
    pub fn encoded_size(&self) -> usize {
        PREFIX_SIZE + self.data_size()
    }

    pub fn encode(&self, sizes: Sizes) -> Vec<u8> {
        let mut w = Writer::with_capacity(sizes, self.encoded_size());
        w.u8(1);
        w.u8(0);
        w.u16(self.messages.len() as u16);
        w.u32(self.link_count);
        w.u32(self.data_size() as u32);
        w.zeros(4);
        for m in &self.messages {
            let padded = align8(m.data.len() as u64) as usize;
            w.u16(m.msg_type.to_u16());
            w.u16(padded as u16);
            w.u8(m.flags);
            w.zeros(3);
            let start = w.len();
            w.bytes(&m.data);
            w.pad_to(start + padded);
        }
        w.finish()
    }

    /// Decode a header from a buffer holding at least the whole header.
    pub fn decode(raw: &[u8], sizes: Sizes) -> Result<ObjectHeader, FormatError> {
        let mut r = Reader::new(raw, sizes);
        let version = r.u8()?;
        if version != 1 {
            return Err(FormatError::InvalidObjectHeaderVersion(version));
        }
        r.skip(1)?;
        let count = r.u16()?;
        let link_count = r.u32()?;
        let data_size = r.u32()? as usize;
        r.skip(4)?;
        let body = r.bytes(data_size)?;

        let mut r = Reader::new(body, sizes);
        let mut messages = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let msg_type = MessageType::from_u16(r.u16()?);
            let size = r.u16()? as usize;
            let flags = r.u8()?;
            r.skip(3)?;
            let data = r.bytes(size)?.to_vec();
            if msg_type != MessageType::Nil {
                messages.push(HeaderMessage {
                    msg_type,
                    flags,
                    data,
                });
            }
        }
        Ok(ObjectHeader {
            link_count,
            messages,
        })
    }

    /// Allocate and write a header, returning its address.
    pub fn create(&self, store: &mut dyn Storage, sizes: Sizes) -> Result<u64, FormatError> {
        let raw = self.encode(sizes);
        let addr = store.alloc(raw.len() as u64)?;
        store.write(addr, &raw)?;
        trace!("object header at {addr:#x} ({} messages)", self.messages.len());
        Ok(addr)
    }

    pub fn load(store: &dyn Storage, sizes: Sizes, addr: u64) -> Result<ObjectHeader, FormatError> {
        let prefix = store.read(addr, PREFIX_SIZE)?;
        let data_size = Reader::new(&prefix[8..12], sizes).u32()? as usize;
        let raw = store.read(addr, PREFIX_SIZE + data_size)?;
        Self::decode(raw, sizes)
    }

    /// First message of the given type.
    pub fn message(&self, msg_type: MessageType) -> Option<&HeaderMessage> {
        self.messages.iter().find(|m| m.msg_type == msg_type)
    }

    pub fn has_message(&self, msg_type: MessageType) -> bool {
        self.message(msg_type).is_some()
    }

    /// The decoded symbol-table message, when this object is a group.
    pub fn symbol_table(&self, sizes: Sizes) -> Result<Option<SymbolTableMessage>, FormatError> {
        self.message(MessageType::SymbolTable)
            .map(|m| SymbolTableMessage::decode(&m.data, sizes))
            .transpose()
    }
}

/// Add `delta` to the hard-link count of the header at `addr`, in place.
///
/// Returns the new count.
pub fn adjust_link_count(
    store: &mut dyn Storage,
    sizes: Sizes,
    addr: u64,
    delta: i32,
) -> Result<u32, FormatError> {
    let raw = store.read(addr, PREFIX_SIZE)?;
    if raw[0] != 1 {
        return Err(FormatError::InvalidObjectHeaderVersion(raw[0]));
    }
    let current = Reader::new(&raw[4..8], sizes).u32()?;
    let next = current.checked_add_signed(delta).ok_or_else(|| {
        FormatError::CorruptIndex(format!(
            "link count of {addr:#x} would leave range ({current} {delta:+})"
        ))
    })?;
    store.write(addr + LINK_COUNT_POS, &next.to_le_bytes())?;
    trace!("object {addr:#x} link count {current} -> {next}");
    Ok(next)
}
