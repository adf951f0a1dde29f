use std::borrow::Borrow;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::Path;

use tracing::{debug, error, trace};

use crate::error::{Error, Result};
use crate::hasher::{hash_key, probe_start, shard_index};
use crate::meta::{Record, ShardMapHeader, ShardMapInfo, Slot, TableRef};
use crate::meta::{HEADER_SIZE, SHARD_COUNT, SLOT_SIZE};
use crate::ShardMapWriter;

/// Builder type holding the write options of a shardmap session.
///
/// Use [`create`](Self::create) or [`session`](Self::session) to start
/// appending records, or [`build`](Self::build) to serialize an iterator in
/// one call.
#[derive(Debug, Clone)]
pub struct ShardMapBuilder {
    writer_buffer_size: usize,
    chunk_size_limit: u64,
    sync: bool,
    error_if_exists: bool,
}

impl Default for ShardMapBuilder {
    fn default() -> Self {
        Self {
            writer_buffer_size: 16 << 20, // 16 MiB
            chunk_size_limit: u32::MAX as u64,
            sync: false,
            error_if_exists: false,
        }
    }
}

impl ShardMapBuilder {
    /// Adjusts the capacity of the buffered writer used while streaming data.
    pub fn with_writer_buffer_size(mut self, size: usize) -> Self {
        self.writer_buffer_size = size;
        self
    }

    /// Sets a hard cap on the total chunk size in bytes.
    ///
    /// Offsets are 32-bit, so the limit is clamped to `u32::MAX`. Records that
    /// would push the chunk past the limit are rejected with
    /// [`Error::InvalidArgument`].
    pub fn with_chunk_size_limit(mut self, limit: u64) -> Self {
        self.chunk_size_limit = limit.min(u32::MAX as u64);
        self
    }

    /// Syncs the writer to durable storage once the header is written.
    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    /// Makes [`create`](Self::create) fail if the target file already exists.
    pub fn with_error_if_exists(mut self, value: bool) -> Self {
        self.error_if_exists = value;
        self
    }

    /// Creates (or truncates) the file at `path` and starts a session on it.
    pub fn create(self, path: impl AsRef<Path>) -> Result<ShardMapSession<File>> {
        let path = path.as_ref();
        let mut options = OpenOptions::new();
        options.write(true);
        if self.error_if_exists {
            options.create_new(true);
        } else {
            options.create(true).truncate(true);
        }
        let file = options.open(path).map_err(|e| match e.kind() {
            ErrorKind::AlreadyExists => {
                Error::InvalidArgument(format!("{} already exists", path.display()))
            }
            _ => Error::Io(e),
        })?;
        debug!(path = %path.display(), "creating shardmap");
        Ok(self.session(file))
    }

    /// Starts a write session on any positional writer.
    ///
    /// Nothing is written below the data region until the session finishes.
    pub fn session<W: ShardMapWriter>(self, writer: W) -> ShardMapSession<W> {
        ShardMapSession {
            buf_writer: BufWriter::with_capacity(
                self.writer_buffer_size,
                ShardMapWriterWrapper {
                    inner: writer,
                    offset: HEADER_SIZE as u64,
                },
            ),
            cursor: HEADER_SIZE as u64,
            shards: vec![Vec::new(); SHARD_COUNT],
            entry_count: 0,
            chunk_size_limit: self.chunk_size_limit,
            sync: self.sync,
            finished: false,
        }
    }

    /// Consumes the builder and writes a shardmap to `writer` from `entries`.
    ///
    /// Records are laid out in iteration order. If any record is rejected the
    /// session is aborted and no header is written.
    ///
    /// # Examples
    ///
    /// ```
    /// use shardmap::ShardMapBuilder;
    ///
    /// # fn main() -> shardmap::Result<()> {
    /// let dir = tempfile::tempdir()?;
    /// let file = std::fs::File::create(dir.path().join("example.shardmap"))?;
    /// let data = [("it", "1"), ("works", "2")];
    /// let info = ShardMapBuilder::default().build(&file, data.iter())?;
    /// assert_eq!(info.entry_count, 2);
    /// # Ok(())
    /// # }
    /// ```
    pub fn build<W, K, V>(
        self,
        writer: W,
        entries: impl IntoIterator<Item = impl Borrow<(K, V)>>,
    ) -> Result<ShardMapInfo>
    where
        W: ShardMapWriter,
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        let mut session = self.session(writer);
        for entry in entries {
            let (key, value) = entry.borrow();
            if let Err(e) = session.put(key, value) {
                session.abort();
                return Err(e);
            }
        }
        session.finish()
    }
}

/// One write session: records are appended with [`put`](Self::put) and the
/// index is laid out by [`finish`](Self::finish).
///
/// Dropping an unfinished session finalizes it; errors from that path can
/// only be logged.
pub struct ShardMapSession<W: ShardMapWriter> {
    buf_writer: BufWriter<ShardMapWriterWrapper<W>>,
    /// Offset at which the next record starts.
    cursor: u64,
    shards: Vec<Vec<Slot>>,
    entry_count: u64,
    chunk_size_limit: u64,
    sync: bool,
    finished: bool,
}

impl<W: ShardMapWriter> ShardMapSession<W> {
    /// Appends a record and remembers its index entry.
    ///
    /// Duplicate keys are stored as separate records.
    pub fn put(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        let (key, value) = (key.as_ref(), value.as_ref());
        if key.len() > u32::MAX as usize || value.len() > u32::MAX as usize {
            return Err(Error::InvalidArgument(format!(
                "record lengths {}/{} exceed u32",
                key.len(),
                value.len()
            )));
        }
        let end = self.cursor + Record::encoded_len(key.len(), value.len());
        if end > self.chunk_size_limit {
            return Err(Error::InvalidArgument(format!(
                "record ending at {end} exceeds chunk size limit {}",
                self.chunk_size_limit
            )));
        }

        Record::encode(key, value, &mut self.buf_writer)?;
        let hash = hash_key(key);
        self.shards[shard_index(hash)].push(Slot {
            hash,
            offset: self.cursor as u32,
        });
        self.cursor = end;
        self.entry_count += 1;
        Ok(())
    }

    /// Number of records put so far.
    pub fn len(&self) -> u64 {
        self.entry_count
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    /// Builds the shard tables, writes them after the records and backpatches
    /// the header.
    pub fn finish(mut self) -> Result<ShardMapInfo> {
        self.finalize()
    }

    /// Drops the session without writing a header, leaving an unreadable file.
    pub fn abort(mut self) {
        self.finished = true;
        debug!(entries = self.entry_count, "shardmap session aborted");
    }

    fn position(&self) -> u64 {
        self.buf_writer.get_ref().offset + self.buf_writer.buffer().len() as u64
    }

    fn check_position(&self, expected: u64) -> Result<()> {
        let actual = self.position();
        if actual != expected {
            return Err(Error::InconsistentOffset { expected, actual });
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<ShardMapInfo> {
        self.finished = true;
        self.check_position(self.cursor)?;
        let shards = std::mem::take(&mut self.shards);

        let table_length: u64 = shards
            .iter()
            .map(|entries| entries.len() as u64 * 2 * SLOT_SIZE as u64)
            .sum();
        let total_size = self.cursor + table_length;
        if total_size > self.chunk_size_limit {
            return Err(Error::InvalidArgument(format!(
                "chunk of {total_size} bytes exceeds chunk size limit {}",
                self.chunk_size_limit
            )));
        }

        let mut tables = Vec::with_capacity(SHARD_COUNT);
        let mut offset = self.cursor;
        for entries in &shards {
            if entries.is_empty() {
                tables.push(TableRef::default());
                continue;
            }
            let table = TableRef {
                offset: offset as u32,
                capacity: entries.len() as u32 * 2,
            };
            offset += table.byte_len();
            tables.push(table);
        }

        for (shard, (entries, table)) in shards.iter().zip(&tables).enumerate() {
            if table.is_empty() {
                continue;
            }
            self.check_position(table.offset as u64)?;
            trace!(shard, offset = table.offset, capacity = table.capacity, "writing shard table");
            for slot in build_table(entries) {
                slot.encode(&mut self.buf_writer)?;
            }
        }
        self.check_position(total_size)?;
        self.buf_writer.flush()?;

        let header = ShardMapHeader::new(total_size as u32, tables);
        let writer = &self.buf_writer.get_ref().inner;
        writer.write_at(&header.serialize(), 0)?;
        if self.sync {
            writer.sync()?;
        }

        let info = ShardMapInfo::from_header(&header);
        debug!(
            entries = info.entry_count,
            occupied_shards = info.occupied_shards,
            total_size = info.total_size,
            "shardmap finalized"
        );
        Ok(info)
    }
}

impl<W: ShardMapWriter> Drop for ShardMapSession<W> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        debug!(entries = self.entry_count, "finalizing shardmap on drop");
        if let Err(e) = self.finalize() {
            error!(error = %e, "failed to finalize shardmap");
        }
    }
}

/// Lays out one shard's entries in a table of twice their count, using linear
/// probing. Earlier entries win earlier probe positions.
fn build_table(entries: &[Slot]) -> Vec<Slot> {
    let capacity = entries.len() as u32 * 2;
    let mut slots = vec![Slot::default(); capacity as usize];
    for entry in entries {
        let mut k = probe_start(entry.hash, capacity);
        while !slots[k as usize].is_empty() {
            k = (k + 1) % capacity;
        }
        slots[k as usize] = *entry;
    }
    slots
}

/// Thin wrapper implementing [`std::io::Write`] in terms of [`ShardMapWriter`].
///
/// Each write lands at the tracked offset, which then advances by the bytes
/// written.
struct ShardMapWriterWrapper<W: ShardMapWriter> {
    inner: W,
    offset: u64,
}

impl<W: ShardMapWriter> Write for ShardMapWriterWrapper<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write_at(buf, self.offset)?;
        self.offset += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
