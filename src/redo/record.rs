//! Redo record types and their byte encoding.
//!
//! Every record starts with a type byte. The low seven bits select an entry
//! in the record-type table; the high bit (`SINGLE_REC_FLAG`) marks a record
//! that makes up a whole mini-transaction on its own. A mini-transaction of
//! several records carries no flag and is closed by a one-byte `MultiRecEnd`
//! record instead, so a reader always knows where each mini-transaction ends
//! from the byte stream alone.
//!
//! Page records continue with the compressed space id and page number;
//! `FileName` carries a u16 length-prefixed path, and `Checkpoint` an 8-byte LSN.

use byteorder::{BigEndian, ReadBytesExt};
use bytes::BufMut;
use std::io::{self, Cursor};

use super::error::{RedoError, RedoResult};
use super::Lsn;
use crate::storage::{PageId, SpaceId};

/// Set on the type byte of a record that is its mini-transaction's only record.
pub const SINGLE_REC_FLAG: u8 = 0x80;

/// Bits of the type byte holding the record type.
pub const TYPE_MASK: u8 = 0x7F;

/// Byte that closes a multi-record mini-transaction.
pub const MULTI_REC_END: u8 = RecordType::MultiRecEnd as u8;

/// Largest encoded record a mini-transaction accepts.
pub const MAX_RECORD_SIZE: usize = 8192;

/// Redo record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordType {
    /// Write 1 byte into a page.
    Write1 = 1,
    /// Write 2 bytes into a page.
    Write2 = 2,
    /// Write 4 bytes into a page.
    Write4 = 4,
    /// Write 8 bytes into a page.
    Write8 = 8,
    /// Write a byte string into a page.
    WriteString = 30,
    /// End of a multi-record mini-transaction.
    MultiRecEnd = 31,
    /// Padding; carries nothing.
    Dummy = 32,
    /// Maps a tablespace id to its file path.
    FileName = 34,
    /// Checkpoint marker.
    Checkpoint = 56,
}

impl RecordType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b & TYPE_MASK {
            1 => Some(Self::Write1),
            2 => Some(Self::Write2),
            4 => Some(Self::Write4),
            8 => Some(Self::Write8),
            30 => Some(Self::WriteString),
            31 => Some(Self::MultiRecEnd),
            32 => Some(Self::Dummy),
            34 => Some(Self::FileName),
            56 => Some(Self::Checkpoint),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A decoded redo record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    Write1 {
        page_id: PageId,
        offset: u16,
        value: u8,
    },
    Write2 {
        page_id: PageId,
        offset: u16,
        value: u16,
    },
    Write4 {
        page_id: PageId,
        offset: u16,
        value: u32,
    },
    Write8 {
        page_id: PageId,
        offset: u16,
        value: u64,
    },
    WriteString {
        page_id: PageId,
        offset: u16,
        data: Vec<u8>,
    },
    FileName {
        space: SpaceId,
        name: String,
    },
    Checkpoint {
        lsn: Lsn,
    },
    Dummy,
}

impl LogRecord {
    pub fn record_type(&self) -> RecordType {
        match self {
            Self::Write1 { .. } => RecordType::Write1,
            Self::Write2 { .. } => RecordType::Write2,
            Self::Write4 { .. } => RecordType::Write4,
            Self::Write8 { .. } => RecordType::Write8,
            Self::WriteString { .. } => RecordType::WriteString,
            Self::FileName { .. } => RecordType::FileName,
            Self::Checkpoint { .. } => RecordType::Checkpoint,
            Self::Dummy => RecordType::Dummy,
        }
    }

    pub fn page_id(&self) -> Option<PageId> {
        match self {
            Self::Write1 { page_id, .. }
            | Self::Write2 { page_id, .. }
            | Self::Write4 { page_id, .. }
            | Self::Write8 { page_id, .. }
            | Self::WriteString { page_id, .. } => Some(*page_id),
            _ => None,
        }
    }

    /// Page, offset and bytes this record applies to a page image.
    pub fn page_write(&self) -> Option<(PageId, usize, Vec<u8>)> {
        let (page_id, offset, bytes) = match self {
            Self::Write1 {
                page_id,
                offset,
                value,
            } => (*page_id, *offset, vec![*value]),
            Self::Write2 {
                page_id,
                offset,
                value,
            } => (*page_id, *offset, value.to_be_bytes().to_vec()),
            Self::Write4 {
                page_id,
                offset,
                value,
            } => (*page_id, *offset, value.to_be_bytes().to_vec()),
            Self::Write8 {
                page_id,
                offset,
                value,
            } => (*page_id, *offset, value.to_be_bytes().to_vec()),
            Self::WriteString {
                page_id,
                offset,
                data,
            } => (*page_id, *offset, data.clone()),
            _ => return None,
        };
        Some((page_id, offset as usize, bytes))
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.record_type().as_byte());
        match self {
            Self::Write1 {
                page_id,
                offset,
                value,
            } => {
                put_page_id(buf, *page_id);
                buf.put_u16(*offset);
                buf.put_u8(*value);
            }
            Self::Write2 {
                page_id,
                offset,
                value,
            } => {
                put_page_id(buf, *page_id);
                buf.put_u16(*offset);
                buf.put_u16(*value);
            }
            Self::Write4 {
                page_id,
                offset,
                value,
            } => {
                put_page_id(buf, *page_id);
                buf.put_u16(*offset);
                buf.put_u32(*value);
            }
            Self::Write8 {
                page_id,
                offset,
                value,
            } => {
                put_page_id(buf, *page_id);
                buf.put_u16(*offset);
                buf.put_u64(*value);
            }
            Self::WriteString {
                page_id,
                offset,
                data,
            } => {
                put_page_id(buf, *page_id);
                buf.put_u16(*offset);
                debug_assert!(data.len() <= u16::MAX as usize);
                buf.put_u16(data.len() as u16);
                buf.put_slice(data);
            }
            Self::FileName { space, name } => {
                put_page_id(
                    buf,
                    PageId {
                        space: *space,
                        page_no: 0,
                    },
                );
                debug_assert!(name.len() <= u16::MAX as usize);
                buf.put_u16(name.len() as u16);
                buf.put_slice(name.as_bytes());
            }
            Self::Checkpoint { lsn } => buf.put_u64(lsn.0),
            Self::Dummy => {}
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        self.encode(&mut buf);
        buf
    }

    /// Decode the record starting at `bytes[0]`, ignoring the single-record
    /// flag. Returns the record and its encoded length.
    pub fn decode(bytes: &[u8]) -> RedoResult<(LogRecord, usize)> {
        let mut cursor = Cursor::new(bytes);
        let record = decode_body(&mut cursor).map_err(|e| match e {
            DecodeError::Io(_) => RedoError::Corrupt {
                offset: cursor.position() as usize,
                reason: "record truncated".to_string(),
            },
            DecodeError::Redo(e) => e,
        })?;
        Ok((record, cursor.position() as usize))
    }
}

enum DecodeError {
    Io(io::Error),
    Redo(RedoError),
}

impl From<io::Error> for DecodeError {
    fn from(e: io::Error) -> Self {
        DecodeError::Io(e)
    }
}

fn decode_body(cursor: &mut Cursor<&[u8]>) -> Result<LogRecord, DecodeError> {
    let type_byte = cursor.read_u8()?;
    let record_type = RecordType::from_byte(type_byte)
        .ok_or(DecodeError::Redo(RedoError::UnknownRecordType(type_byte)))?;

    let record = match record_type {
        RecordType::Write1 => {
            let page_id = read_page_id(cursor)?;
            let offset = cursor.read_u16::<BigEndian>()?;
            LogRecord::Write1 {
                page_id,
                offset,
                value: cursor.read_u8()?,
            }
        }
        RecordType::Write2 => {
            let page_id = read_page_id(cursor)?;
            let offset = cursor.read_u16::<BigEndian>()?;
            LogRecord::Write2 {
                page_id,
                offset,
                value: cursor.read_u16::<BigEndian>()?,
            }
        }
        RecordType::Write4 => {
            let page_id = read_page_id(cursor)?;
            let offset = cursor.read_u16::<BigEndian>()?;
            LogRecord::Write4 {
                page_id,
                offset,
                value: cursor.read_u32::<BigEndian>()?,
            }
        }
        RecordType::Write8 => {
            let page_id = read_page_id(cursor)?;
            let offset = cursor.read_u16::<BigEndian>()?;
            LogRecord::Write8 {
                page_id,
                offset,
                value: cursor.read_u64::<BigEndian>()?,
            }
        }
        RecordType::WriteString => {
            let page_id = read_page_id(cursor)?;
            let offset = cursor.read_u16::<BigEndian>()?;
            let len = cursor.read_u16::<BigEndian>()? as usize;
            LogRecord::WriteString {
                page_id,
                offset,
                data: read_exact_vec(cursor, len)?,
            }
        }
        RecordType::FileName => {
            let page_id = read_page_id(cursor)?;
            let len = cursor.read_u16::<BigEndian>()? as usize;
            let name = String::from_utf8(read_exact_vec(cursor, len)?).map_err(|_| {
                DecodeError::Redo(RedoError::Corrupt {
                    offset: cursor.position() as usize,
                    reason: "file name is not UTF-8".to_string(),
                })
            })?;
            LogRecord::FileName {
                space: page_id.space,
                name,
            }
        }
        RecordType::Checkpoint => LogRecord::Checkpoint {
            lsn: Lsn(cursor.read_u64::<BigEndian>()?),
        },
        RecordType::Dummy => LogRecord::Dummy,
        RecordType::MultiRecEnd => {
            return Err(DecodeError::Redo(RedoError::Corrupt {
                offset: 0,
                reason: "end marker is not a record".to_string(),
            }))
        }
    };
    Ok(record)
}

fn read_exact_vec(cursor: &mut Cursor<&[u8]>, len: usize) -> io::Result<Vec<u8>> {
    let mut data = vec![0u8; len];
    io::Read::read_exact(cursor, &mut data)?;
    Ok(data)
}

fn put_page_id(buf: &mut impl BufMut, page_id: PageId) {
    put_compressed(buf, page_id.space.0);
    put_compressed(buf, page_id.page_no);
}

fn read_page_id(cursor: &mut Cursor<&[u8]>) -> io::Result<PageId> {
    let space = read_compressed(cursor)?;
    let page_no = read_compressed(cursor)?;
    Ok(PageId::new(space, page_no))
}

/// Write `n` in 1 to 5 bytes; the leading bits of the first byte give the width.
pub fn put_compressed(buf: &mut impl BufMut, n: u32) {
    if n < 0x80 {
        buf.put_u8(n as u8);
    } else if n < 0x4000 {
        buf.put_u16(0x8000 | n as u16);
    } else if n < 0x20_0000 {
        let v = 0xC0_0000 | n;
        buf.put_u8((v >> 16) as u8);
        buf.put_u16(v as u16);
    } else if n < 0x1000_0000 {
        buf.put_u32(0xE000_0000 | n);
    } else {
        buf.put_u8(0xF0);
        buf.put_u32(n);
    }
}

pub fn read_compressed(cursor: &mut Cursor<&[u8]>) -> io::Result<u32> {
    let first = cursor.read_u8()?;
    let n = if first < 0x80 {
        first as u32
    } else if first < 0xC0 {
        ((first as u32 & 0x3F) << 8) | cursor.read_u8()? as u32
    } else if first < 0xE0 {
        ((first as u32 & 0x1F) << 16) | cursor.read_u16::<BigEndian>()? as u32
    } else if first < 0xF0 {
        ((first as u32 & 0x0F) << 24) | cursor.read_u24::<BigEndian>()?
    } else {
        cursor.read_u32::<BigEndian>()?
    };
    Ok(n)
}

/// A record located in a redo stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRecord {
    pub record: LogRecord,
    /// Offset of the type byte within the parsed stream.
    pub offset: usize,
    /// True if this record is the last of its mini-transaction.
    pub last_in_mtr: bool,
}

/// Split a redo stream into records.
///
/// The stream must start on a mini-transaction boundary. A record carrying
/// `SINGLE_REC_FLAG` is a whole mini-transaction; otherwise records run until
/// the next `MULTI_REC_END` byte.
pub fn parse_records(bytes: &[u8]) -> RedoResult<Vec<ParsedRecord>> {
    let mut records = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        if bytes[pos] & SINGLE_REC_FLAG != 0 {
            if bytes[pos] & TYPE_MASK == MULTI_REC_END {
                return Err(corrupt(pos, "end marker flagged as single record"));
            }
            let (record, len) = decode_at(bytes, pos)?;
            records.push(ParsedRecord {
                record,
                offset: pos,
                last_in_mtr: true,
            });
            pos += len;
            continue;
        }

        let group_start = pos;
        let mut group: Vec<ParsedRecord> = Vec::new();
        loop {
            if pos >= bytes.len() {
                return Err(corrupt(group_start, "mini-transaction without end marker"));
            }
            if bytes[pos] == MULTI_REC_END {
                pos += 1;
                break;
            }
            if bytes[pos] & SINGLE_REC_FLAG != 0 {
                return Err(corrupt(pos, "single record inside a multi-record group"));
            }
            let (record, len) = decode_at(bytes, pos)?;
            group.push(ParsedRecord {
                record,
                offset: pos,
                last_in_mtr: false,
            });
            pos += len;
        }

        match group.last_mut() {
            Some(last) => last.last_in_mtr = true,
            None => return Err(corrupt(group_start, "empty mini-transaction")),
        }
        records.extend(group);
    }

    Ok(records)
}

/// Split a redo stream into per-mini-transaction groups of records.
pub fn parse_groups(bytes: &[u8]) -> RedoResult<Vec<Vec<LogRecord>>> {
    let mut groups = Vec::new();
    let mut current = Vec::new();
    for parsed in parse_records(bytes)? {
        current.push(parsed.record);
        if parsed.last_in_mtr {
            groups.push(std::mem::take(&mut current));
        }
    }
    Ok(groups)
}

fn decode_at(bytes: &[u8], pos: usize) -> RedoResult<(LogRecord, usize)> {
    LogRecord::decode(&bytes[pos..]).map_err(|e| match e {
        RedoError::Corrupt { offset, reason } => RedoError::Corrupt {
            offset: pos + offset,
            reason,
        },
        other => other,
    })
}

fn corrupt(offset: usize, reason: &str) -> RedoError {
    RedoError::Corrupt {
        offset,
        reason: reason.to_string(),
    }
}
