use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use serde::Serialize;

use crate::error::{Error, Result};

/// Magic tag opening every chunk.
pub const MAGIC: &[u8; 8] = b"GOBEARS!";
/// Format version written by this crate.
pub const VERSION: u32 = 1;
/// Written verbatim; a reader on a mismatching byte order sees it scrambled.
pub const BYTE_ORDER_CHECK: u32 = 0x6244_5371;
/// Number of shards every key is distributed over.
pub const SHARD_COUNT: usize = 256;

/// Size of one `(offset, capacity)` table reference.
pub const TABLE_REF_SIZE: usize = 8;
/// Size of one `(hash, offset)` slot.
pub const SLOT_SIZE: usize = 8;
/// Bytes needed to learn the chunk size: magic plus total size.
pub const PREFIX_SIZE: usize = MAGIC.len() + 4;
/// Full header size; the record data region starts right after it.
pub const HEADER_SIZE: usize = MAGIC.len() + 3 * 4 + SHARD_COUNT * TABLE_REF_SIZE;

/// Location of one shard table inside the chunk. `offset == 0` marks an empty shard.
#[derive(Serialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TableRef {
    /// Absolute offset of the first slot.
    pub offset: u32,
    /// Number of slots, twice the number of entries.
    pub capacity: u32,
}

impl TableRef {
    pub fn is_empty(&self) -> bool {
        self.offset == 0
    }

    /// Length in bytes of the serialized table.
    pub fn byte_len(&self) -> u64 {
        self.capacity as u64 * SLOT_SIZE as u64
    }

    fn validate(&self, shard: usize, total_size: u32) -> Result<()> {
        if self.is_empty() {
            if self.capacity != 0 {
                return Err(Error::corruption(format!(
                    "shard {shard}: empty table with capacity {}",
                    self.capacity
                )));
            }
            return Ok(());
        }
        if self.capacity == 0 || self.capacity % 2 != 0 {
            return Err(Error::corruption(format!(
                "shard {shard}: invalid capacity {}",
                self.capacity
            )));
        }
        let end = self.offset as u64 + self.byte_len();
        if (self.offset as usize) < HEADER_SIZE || end > total_size as u64 {
            return Err(Error::corruption(format!(
                "shard {shard}: table {}..{end} outside chunk",
                self.offset
            )));
        }
        Ok(())
    }
}

/// One cell of a shard table. `offset == 0` marks an empty slot, since offset 0
/// always falls inside the header.
#[derive(Serialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub hash: u32,
    pub offset: u32,
}

impl Slot {
    pub fn is_empty(&self) -> bool {
        self.offset == 0
    }

    pub(crate) fn decode(data: &[u8]) -> Self {
        Slot {
            hash: LittleEndian::read_u32(&data[0..4]),
            offset: LittleEndian::read_u32(&data[4..8]),
        }
    }

    pub(crate) fn encode<W: std::io::Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_u32::<LittleEndian>(self.hash)?;
        w.write_u32::<LittleEndian>(self.offset)
    }
}

/// A decoded `[u32 key_len][key][u32 value_len][value]` record borrowing from the chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record<'a> {
    pub key: &'a [u8],
    pub value: &'a [u8],
}

impl<'a> Record<'a> {
    /// Serialized length of a record with the given key and value lengths.
    pub fn encoded_len(key_len: usize, value_len: usize) -> u64 {
        8 + key_len as u64 + value_len as u64
    }

    /// Decodes the record starting at `offset`, never reading past `limit`.
    pub(crate) fn decode(data: &'a [u8], offset: usize, limit: usize) -> Result<Self> {
        let data = &data[..limit.min(data.len())];
        let (key, rest) = read_prefixed(data, offset)
            .ok_or_else(|| Error::corruption(format!("record key at {offset} out of bounds")))?;
        let (value, _) = read_prefixed(data, rest)
            .ok_or_else(|| Error::corruption(format!("record value at {offset} out of bounds")))?;
        Ok(Record { key, value })
    }

    pub fn encoded_size(&self) -> u64 {
        Self::encoded_len(self.key.len(), self.value.len())
    }

    pub(crate) fn encode<W: std::io::Write>(
        key: &[u8],
        value: &[u8],
        w: &mut W,
    ) -> std::io::Result<()> {
        w.write_u32::<LittleEndian>(key.len() as u32)?;
        w.write_all(key)?;
        w.write_u32::<LittleEndian>(value.len() as u32)?;
        w.write_all(value)
    }
}

fn read_prefixed(data: &[u8], offset: usize) -> Option<(&[u8], usize)> {
    let start = offset.checked_add(4)?;
    let len = LittleEndian::read_u32(data.get(offset..start)?) as usize;
    let end = start.checked_add(len)?;
    Some((data.get(start..end)?, end))
}

/// Fixed header at offset 0 of every chunk.
///
/// ```text
/// 0     magic             8
/// 8     total_size        4
/// 12    version           4
/// 16    byte-order check  4
/// 20    256 x (table offset u32, table capacity u32)
/// 2068  record data, then shard tables
/// ```
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ShardMapHeader {
    /// Size of the whole chunk: header, records and tables.
    pub total_size: u32,
    pub version: u32,
    pub byte_order: u32,
    pub tables: Vec<TableRef>,
}

impl ShardMapHeader {
    pub const SIZE: usize = HEADER_SIZE;

    pub fn new(total_size: u32, tables: Vec<TableRef>) -> Self {
        ShardMapHeader {
            total_size,
            version: VERSION,
            byte_order: BYTE_ORDER_CHECK,
            tables,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(MAGIC);
        for field in [self.total_size, self.version, self.byte_order] {
            buf.extend_from_slice(&field.to_le_bytes());
        }
        for table in &self.tables {
            buf.extend_from_slice(&table.offset.to_le_bytes());
            buf.extend_from_slice(&table.capacity.to_le_bytes());
        }
        buf
    }

    /// Reads the total chunk size from the first [`PREFIX_SIZE`] bytes.
    pub fn parse_prefix(buf: &[u8]) -> Result<u32> {
        if buf.len() < PREFIX_SIZE {
            return Err(Error::corruption(format!(
                "chunk prefix too small: {} bytes",
                buf.len()
            )));
        }
        if &buf[..MAGIC.len()] != MAGIC {
            return Err(Error::corruption("bad magic"));
        }
        Ok(LittleEndian::read_u32(&buf[8..12]))
    }

    /// Validates and decodes the header of an in-memory chunk.
    ///
    /// Every table reference is checked against the declared chunk size, so
    /// callers can slice tables out of `buf` without further bounds checks.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::corruption(format!(
                "chunk smaller than header: {} bytes",
                buf.len()
            )));
        }
        let total_size = Self::parse_prefix(buf)?;
        let version = LittleEndian::read_u32(&buf[12..16]);
        let byte_order = LittleEndian::read_u32(&buf[16..20]);
        if byte_order != BYTE_ORDER_CHECK {
            return Err(Error::corruption(format!(
                "inconsistent byte order: {byte_order:#010x}"
            )));
        }
        if version != VERSION {
            return Err(Error::NotSupported(format!("format version {version}")));
        }
        if (total_size as usize) < Self::SIZE {
            return Err(Error::corruption(format!(
                "declared chunk size {total_size} smaller than header"
            )));
        }
        if buf.len() < total_size as usize {
            return Err(Error::corruption(format!(
                "chunk truncated: {} of {total_size} bytes",
                buf.len()
            )));
        }

        let tables = buf[20..Self::SIZE]
            .chunks_exact(TABLE_REF_SIZE)
            .enumerate()
            .map(|(shard, data)| {
                let table = TableRef {
                    offset: LittleEndian::read_u32(&data[0..4]),
                    capacity: LittleEndian::read_u32(&data[4..8]),
                };
                table.validate(shard, total_size).map(|_| table)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(ShardMapHeader {
            total_size,
            version,
            byte_order,
            tables,
        })
    }
}


/// Summary of a chunk, returned by the builder and by [`ShardMap::info`](crate::ShardMap::info).
#[derive(Serialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct ShardMapInfo {
    /// Total chunk size in bytes.
    pub total_size: u64,
    /// Number of index entries, duplicates included.
    pub entry_count: u64,
    pub shard_count: usize,
    pub occupied_shards: usize,
    pub empty_shards: usize,
    /// Bytes of record data following the header.
    pub data_length: u64,
    /// Bytes of serialized shard tables.
    pub table_length: u64,
    pub version: u32,
}

impl ShardMapInfo {
    pub(crate) fn from_header(header: &ShardMapHeader) -> Self {
        let occupied_shards = header.tables.iter().filter(|t| !t.is_empty()).count();
        let table_length: u64 = header.tables.iter().map(|t| t.byte_len()).sum();
        let entry_count = header.tables.iter().map(|t| t.capacity as u64 / 2).sum();
        let total_size = header.total_size as u64;
        ShardMapInfo {
            total_size,
            entry_count,
            shard_count: header.tables.len(),
            occupied_shards,
            empty_shards: header.tables.len() - occupied_shards,
            data_length: total_size.saturating_sub(HEADER_SIZE as u64 + table_length),
            table_length,
            version: header.version,
        }
    }
}
