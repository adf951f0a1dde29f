use std::fmt;
use std::path::Path;

use tracing::debug;

use crate::error::{Error, Result};
use crate::hasher::{hash_key, probe_start, shard_index};
use crate::meta::{Record, ShardMapHeader, ShardMapInfo, Slot};
use crate::meta::{HEADER_SIZE, PREFIX_SIZE, SHARD_COUNT, SLOT_SIZE};
use crate::ShardMapReader;

/// Options applied when a chunk is loaded.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
    /// Run [`ShardMap::verify`] before serving queries.
    pub verify: bool,
}

/// Immutable hash map over one loaded shardmap chunk.
///
/// The whole chunk is held in memory; shard tables, keys and values are read
/// in place. Lookups hash the key, pick one of the 256 shards, and linearly
/// probe that shard's table.
///
/// `B` is the buffer holding the chunk: an owned `Vec<u8>` when opened from a
/// file, or any borrowed byte slice passed to [`load`](Self::load).
pub struct ShardMap<B: AsRef<[u8]> = Vec<u8>> {
    header: ShardMapHeader,
    /// End of the record data region, where the first shard table starts.
    data_end: usize,
    buffer: B,
}

impl ShardMap<Vec<u8>> {
    /// Opens the chunk stored at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] when the file is missing or shorter than the size
    /// it declares, and [`Error::Corruption`] when the header is invalid.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, ReadOptions::default())
    }

    pub fn open_with_options(path: impl AsRef<Path>, options: ReadOptions) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        Self::load_from(&file, options)
    }

    /// Reads a chunk through a [`ShardMapReader`].
    ///
    /// The magic tag and total size are read first, then exactly that many
    /// bytes from offset 0. Bytes past the declared size are never read.
    pub fn load_from<R>(reader: &R, options: ReadOptions) -> Result<Self>
    where
        R: ShardMapReader + ?Sized,
    {
        let prefix = reader.read_exact_range(0, PREFIX_SIZE as u64)?;
        let total_size = ShardMapHeader::parse_prefix(&prefix)?;
        let buffer = reader.read_exact_range(0, total_size as u64)?;
        Self::load_with_options(buffer, options)
    }
}

impl<B: AsRef<[u8]>> ShardMap<B> {
    /// Validates `buffer` and builds views over its shard tables.
    ///
    /// Only the declared chunk is interpreted; trailing bytes are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corruption`] when the magic tag or byte-order check
    /// mismatch, the buffer is shorter than the declared size, or a table
    /// reference points outside the chunk. Returns [`Error::NotSupported`] for
    /// unknown format versions.
    pub fn load(buffer: B) -> Result<Self> {
        Self::load_with_options(buffer, ReadOptions::default())
    }

    pub fn load_with_options(buffer: B, options: ReadOptions) -> Result<Self> {
        let header = ShardMapHeader::parse(buffer.as_ref())?;
        let data_end = header
            .tables
            .iter()
            .filter(|t| !t.is_empty())
            .map(|t| t.offset)
            .min()
            .unwrap_or(header.total_size) as usize;

        let map = ShardMap {
            header,
            data_end,
            buffer,
        };
        if options.verify {
            map.verify()?;
        }
        debug!(
            total_size = map.header.total_size,
            entries = map.len(),
            verified = options.verify,
            "shardmap loaded"
        );
        Ok(map)
    }

    pub fn header(&self) -> &ShardMapHeader {
        &self.header
    }

    pub fn info(&self) -> ShardMapInfo {
        ShardMapInfo::from_header(&self.header)
    }

    /// Returns the number of index entries, duplicate keys included.
    pub fn len(&self) -> u64 {
        self.header
            .tables
            .iter()
            .map(|t| t.capacity as u64 / 2)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a view over the table of `shard`.
    ///
    /// # Panics
    ///
    /// Panics if `shard` is not below [`SHARD_COUNT`].
    pub fn shard_table(&self, shard: usize) -> ShardTable<'_> {
        let table = self.header.tables[shard];
        if table.is_empty() {
            return ShardTable { slots: &[] };
        }
        let start = table.offset as usize;
        let end = start + table.byte_len() as usize;
        ShardTable {
            slots: &self.chunk()[start..end],
        }
    }

    /// Looks up `key` and returns its value as a view into the chunk.
    ///
    /// When a key was written more than once, which record is returned is
    /// unspecified.
    pub fn get_ref(&self, key: impl AsRef<[u8]>) -> Result<Option<&[u8]>> {
        let key = key.as_ref();
        let hash = hash_key(key);
        let table = self.shard_table(shard_index(hash));
        let capacity = table.capacity();
        if capacity == 0 {
            return Ok(None);
        }

        let mut k = probe_start(hash, capacity);
        for _ in 0..capacity {
            let slot = table.slot(k);
            if slot.is_empty() {
                return Ok(None);
            }
            if slot.hash == hash {
                let record = self.record_at(slot.offset)?;
                if record.key == key {
                    return Ok(Some(record.value));
                }
            }
            k = (k + 1) % capacity;
        }
        Ok(None)
    }

    /// Looks up `key` and copies its value out.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corruption`] if a probed slot points at a record that
    /// does not fit in the data region.
    pub fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>> {
        Ok(self.get_ref(key)?.map(<[u8]>::to_vec))
    }

    pub fn contains_key(&self, key: impl AsRef<[u8]>) -> Result<bool> {
        Ok(self.get_ref(key)?.is_some())
    }

    /// Performs multiple lookups. Results preserve the order of `keys`.
    pub fn batch_get(
        &self,
        keys: impl IntoIterator<Item = impl AsRef<[u8]>>,
    ) -> Result<Vec<Option<Vec<u8>>>> {
        keys.into_iter().map(|key| self.get(key)).collect()
    }

    /// Iterates over every record in write order, duplicates included.
    ///
    /// # Examples
    ///
    /// ```
    /// use shardmap::{ShardMap, ShardMapBuilder};
    ///
    /// # fn main() -> shardmap::Result<()> {
    /// let dir = tempfile::tempdir()?;
    /// let path = dir.path().join("iter.shardmap");
    /// let file = std::fs::File::create(&path)?;
    /// ShardMapBuilder::default().build(&file, [("a", "1"), ("b", "2"), ("c", "3")].iter())?;
    ///
    /// let map = ShardMap::open(&path)?;
    /// let keys = map
    ///     .iter()
    ///     .map(|record| record.map(|r| r.key.to_vec()))
    ///     .collect::<shardmap::Result<Vec<_>>>()?;
    /// assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    /// # Ok(())
    /// # }
    /// ```
    pub fn iter(&self) -> ShardMapIter<'_> {
        ShardMapIter {
            chunk: self.chunk(),
            offset: HEADER_SIZE,
            end: self.data_end,
        }
    }

    /// Checks every populated slot against the record it points to.
    ///
    /// Each slot must sit in the shard its hash selects, point at a record
    /// inside the data region whose key hashes to the stored hash, and be
    /// reachable from its probe start without crossing an empty slot. Each
    /// table must hold exactly half its capacity.
    pub fn verify(&self) -> Result<()> {
        for shard in 0..SHARD_COUNT {
            let table = self.shard_table(shard);
            let capacity = table.capacity();
            let mut entries = 0u32;
            for (index, slot) in table.slots().enumerate() {
                if slot.is_empty() {
                    continue;
                }
                entries += 1;
                if shard_index(slot.hash) != shard {
                    return Err(Error::corruption(format!(
                        "shard {shard}: slot {index} holds hash {:#010x} of shard {}",
                        slot.hash,
                        shard_index(slot.hash)
                    )));
                }
                let record = self.record_at(slot.offset)?;
                if hash_key(record.key) != slot.hash {
                    return Err(Error::corruption(format!(
                        "shard {shard}: record at {} does not match its hash",
                        slot.offset
                    )));
                }
                let mut k = probe_start(slot.hash, capacity);
                while k as usize != index {
                    if table.slot(k).is_empty() {
                        return Err(Error::corruption(format!(
                            "shard {shard}: slot {index} unreachable from probe start"
                        )));
                    }
                    k = (k + 1) % capacity;
                }
            }
            if entries * 2 != capacity {
                return Err(Error::corruption(format!(
                    "shard {shard}: {entries} entries in {capacity} slots"
                )));
            }
        }
        Ok(())
    }

    fn chunk(&self) -> &[u8] {
        &self.buffer.as_ref()[..self.header.total_size as usize]
    }

    fn record_at(&self, offset: u32) -> Result<Record<'_>> {
        let offset = offset as usize;
        if offset < HEADER_SIZE || offset >= self.data_end {
            return Err(Error::corruption(format!(
                "record offset {offset} outside data region"
            )));
        }
        Record::decode(self.chunk(), offset, self.data_end)
    }
}

impl<B: AsRef<[u8]>> fmt::Debug for ShardMap<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardMap")
            .field("total_size", &self.header.total_size)
            .field("data_end", &self.data_end)
            .field("len", &self.len())
            .finish()
    }
}

/// Non-owning view over one shard's `(hash, offset)` slots.
#[derive(Debug, Clone, Copy)]
pub struct ShardTable<'a> {
    slots: &'a [u8],
}

impl<'a> ShardTable<'a> {
    pub fn capacity(&self) -> u32 {
        (self.slots.len() / SLOT_SIZE) as u32
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Decodes slot `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not below [`capacity`](Self::capacity).
    pub fn slot(&self, index: u32) -> Slot {
        let start = index as usize * SLOT_SIZE;
        Slot::decode(&self.slots[start..start + SLOT_SIZE])
    }

    pub fn slots(&self) -> impl Iterator<Item = Slot> + 'a {
        let slots: &'a [u8] = self.slots;
        slots.chunks_exact(SLOT_SIZE).map(Slot::decode)
    }
}

/// Iterator over the records of a [`ShardMap`] in write order.
pub struct ShardMapIter<'a> {
    chunk: &'a [u8],
    offset: usize,
    end: usize,
}

impl<'a> Iterator for ShardMapIter<'a> {
    type Item = Result<Record<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.end {
            return None;
        }
        match Record::decode(self.chunk, self.offset, self.end) {
            Ok(record) => {
                self.offset += record.encoded_size() as usize;
                Some(Ok(record))
            }
            Err(e) => {
                self.offset = self.end;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::builder::tests::{build_in_memory, MemoryWriter};
    use crate::meta::{BYTE_ORDER_CHECK, MAGIC};
    use crate::ShardMapBuilder;

    fn scenario() -> Vec<u8> {
        build_in_memory([("wow", "3"), ("pancake", "7"), ("oyster", "6")])
    }

    fn key_in_shard(shard: usize, exclude: &[u8]) -> String {
        (0..)
            .map(|i| format!("probe-{i}"))
            .find(|k| shard_index(hash_key(k.as_bytes())) == shard && k.as_bytes() != exclude)
            .unwrap()
    }

    #[test]
    fn test_basic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shardmap.bin");
        let writer = std::fs::File::create(&path).unwrap();
        let entries = vec![
            ("apple", "1"),
            ("banana", "2"),
            ("cherry", "3"),
            ("date", "4"),
            ("elderberry", "5"),
        ];
        let info = ShardMapBuilder::default()
            .with_writer_buffer_size(8 << 20) // 8 MiB
            .build(&writer, entries.iter())
            .unwrap();
        assert_eq!(info.entry_count, 5);
        assert_eq!(info.total_size, writer.metadata().unwrap().len());

        let map = ShardMap::open(&path).unwrap();
        assert_eq!(map.len(), 5);
        assert_eq!(map.info(), info);
        assert_eq!(map.get("apple").unwrap(), Some(b"1".to_vec()));
        assert_eq!(map.get_ref(b"banana").unwrap(), Some(&b"2"[..]));
        assert!(map.contains_key("elderberry").unwrap());
        assert_eq!(map.get("steins").unwrap(), None);
        assert_eq!(map.get("gate").unwrap(), None);

        let keys = ["cherry", "date", "fig", "elderberry", "steins"];
        let results = map.batch_get(keys).unwrap();
        assert_eq!(
            results,
            vec![
                Some(b"3".to_vec()),
                Some(b"4".to_vec()),
                None,
                Some(b"5".to_vec()),
                None
            ]
        );
    }

    #[test]
    fn test_scenario() {
        let map = ShardMap::load(scenario()).unwrap();
        assert_eq!(map.get("pancake").unwrap(), Some(b"7".to_vec()));
        assert_eq!(map.get("wow").unwrap(), Some(b"3".to_vec()));
        assert_eq!(map.get("oyster").unwrap(), Some(b"6".to_vec()));
        assert_eq!(map.get("banana").unwrap(), None);
        assert_eq!(map.info().occupied_shards, 3);
        assert_eq!(map.info().data_length, 43);
    }

    #[test]
    fn test_random_roundtrip() {
        const N: usize = 20_000;
        let mut rng = StdRng::seed_from_u64(42);
        let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..N)
            .map(|i| {
                let mut key = format!("{i}:").into_bytes();
                key.extend((0..rng.gen_range(0..24)).map(|_| rng.gen::<u8>()));
                let value = (0..rng.gen_range(0..64)).map(|_| rng.gen::<u8>()).collect();
                (key, value)
            })
            .collect();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("random.shardmap");
        let mut session = ShardMapBuilder::default().create(&path).unwrap();
        for (key, value) in &entries {
            session.put(key, value).unwrap();
        }
        session.finish().unwrap();

        let map = ShardMap::open_with_options(&path, ReadOptions { verify: true }).unwrap();
        assert_eq!(map.len(), N as u64);
        let map = Arc::new(map);
        let entries = Arc::new(entries);

        let threads: Vec<_> = (0..4)
            .map(|t| {
                let map = map.clone();
                let entries = entries.clone();
                std::thread::spawn(move || {
                    for (key, value) in entries.iter().skip(t).step_by(4) {
                        assert_eq!(map.get_ref(key).unwrap(), Some(value.as_slice()));
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        for i in 0..1000 {
            let key = format!("absent-{}", rng.gen::<u64>() ^ i);
            assert_eq!(map.get(key).unwrap(), None);
        }
    }

    #[test]
    fn test_corrupted_magic_and_byte_order() {
        let bytes = scenario();
        let fields = (0..MAGIC.len()).chain(16..20);
        for index in fields {
            let mut corrupted = bytes.clone();
            corrupted[index] ^= 0x20;
            let err = ShardMap::load(corrupted.as_slice()).unwrap_err();
            assert!(err.is_corruption(), "byte {index}: {err}");
        }
        assert_eq!(&bytes[16..20], &BYTE_ORDER_CHECK.to_le_bytes());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupted.shardmap");
        let mut corrupted = bytes.clone();
        corrupted[0] = b'X';
        std::fs::write(&path, &corrupted).unwrap();
        assert!(ShardMap::open(&path).unwrap_err().is_corruption());

        let mut corrupted = bytes.clone();
        corrupted[16..20].copy_from_slice(&BYTE_ORDER_CHECK.to_be_bytes());
        std::fs::write(&path, &corrupted).unwrap();
        assert!(ShardMap::open(&path).unwrap_err().is_corruption());
    }

    #[test]
    fn test_truncated_chunk() {
        let bytes = scenario();
        let err = ShardMap::load(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(err.is_corruption(), "{err}");
        let err = ShardMap::load(&bytes[..100]).unwrap_err();
        assert!(err.is_corruption(), "{err}");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("truncated.shardmap");
        std::fs::write(&path, &bytes[..bytes.len() - 1]).unwrap();
        assert!(ShardMap::open(&path).unwrap_err().is_io());

        std::fs::write(&path, &bytes[..8]).unwrap();
        assert!(ShardMap::open(&path).unwrap_err().is_io());

        std::fs::write(&path, b"").unwrap();
        assert!(ShardMap::open(&path).unwrap_err().is_io());

        let missing = dir.path().join("missing.shardmap");
        assert!(ShardMap::open(&missing).unwrap_err().is_io());
    }

    #[test]
    fn test_trailing_garbage() {
        let mut bytes = scenario();
        bytes.extend_from_slice(b"trailing garbage");

        let map = ShardMap::load(bytes.as_slice()).unwrap();
        assert_eq!(map.get("oyster").unwrap(), Some(b"6".to_vec()));

        let writer = MemoryWriter::new(u64::MAX);
        crate::ShardMapWriter::write_at(&writer, &bytes, 0).unwrap();
        let map = ShardMap::load_from(&writer, ReadOptions { verify: true }).unwrap();
        assert_eq!(map.header().total_size as usize, bytes.len() - 16);
        assert_eq!(map.get("wow").unwrap(), Some(b"3".to_vec()));
    }

    #[test]
    fn test_unsupported_version() {
        let mut bytes = scenario();
        bytes[12..16].copy_from_slice(&2u32.to_le_bytes());
        let err = ShardMap::load(bytes).unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)), "{err}");
    }

    #[test]
    fn test_corrupted_slot_offset() {
        let mut bytes = scenario();
        // Slot 1 of shard 153 holds "wow"; point it past the data region.
        bytes[2123..2127].copy_from_slice(&0xffff_fff0u32.to_le_bytes());
        let map = ShardMap::load(bytes.as_slice()).unwrap();
        assert!(map.get("wow").unwrap_err().is_corruption());
        assert_eq!(map.get("pancake").unwrap(), Some(b"7".to_vec()));

        let err = ShardMap::load_with_options(bytes.as_slice(), ReadOptions { verify: true })
            .unwrap_err();
        assert!(err.is_corruption(), "{err}");

        let mut bytes = scenario();
        // Record length of "wow" overruns the data region.
        bytes[2068..2072].copy_from_slice(&1000u32.to_le_bytes());
        let map = ShardMap::load(bytes.as_slice()).unwrap();
        assert!(map.get("wow").unwrap_err().is_corruption());
        let last = map.iter().last().unwrap();
        assert!(last.unwrap_err().is_corruption());
    }

    #[test]
    fn test_verify_detects_mismatched_records() {
        let bytes = scenario();
        ShardMap::load_with_options(bytes.as_slice(), ReadOptions { verify: true }).unwrap();

        let mut corrupted = bytes.clone();
        // Key byte of "wow" no longer matches the stored hash.
        corrupted[2072] = b'W';
        let map = ShardMap::load(corrupted.as_slice()).unwrap();
        assert_eq!(map.get("wow").unwrap(), None);
        assert!(map.verify().unwrap_err().is_corruption());

        let mut corrupted = bytes.clone();
        // Move "wow" to slot 0, leaving its probe start empty.
        corrupted.copy_within(2119..2127, 2111);
        corrupted[2119..2127].fill(0);
        ShardMap::load(corrupted.as_slice()).unwrap().verify().unwrap_err();
    }

    #[test]
    fn test_full_table_terminates() {
        let mut bytes = scenario();
        // Fill the empty slot of shard 153 so its table has no free slot.
        bytes[2111..2115].copy_from_slice(&1u32.to_le_bytes());
        bytes[2115..2119].copy_from_slice(&2068u32.to_le_bytes());
        let map = ShardMap::load(bytes).unwrap();

        let key = key_in_shard(153, b"wow");
        assert_eq!(map.get(&key).unwrap(), None);
        assert_eq!(map.get("wow").unwrap(), Some(b"3".to_vec()));
    }

    #[test]
    fn test_iterator_order() {
        let bytes = build_in_memory([("b", "1"), ("a", "2"), ("b", "3"), ("", "empty")]);
        let map = ShardMap::load(bytes).unwrap();
        assert_eq!(map.len(), 4);

        let records = map.iter().collect::<Result<Vec<_>>>().unwrap();
        let pairs: Vec<(&[u8], &[u8])> = records.iter().map(|r| (r.key, r.value)).collect();
        assert_eq!(
            pairs,
            vec![
                (&b"b"[..], &b"1"[..]),
                (&b"a"[..], &b"2"[..]),
                (&b"b"[..], &b"3"[..]),
                (&b""[..], &b"empty"[..]),
            ]
        );

        assert_eq!(map.get("").unwrap(), Some(b"empty".to_vec()));
        let value = map.get("b").unwrap().unwrap();
        assert!(value == b"1" || value == b"3");
    }

    #[test]
    fn test_empty_map() {
        let bytes = build_in_memory(Vec::<(&str, &str)>::new());
        assert_eq!(bytes.len(), HEADER_SIZE);
        let map = ShardMap::load_with_options(bytes, ReadOptions { verify: true }).unwrap();
        assert!(map.is_empty());
        assert_eq!(map.get("anything").unwrap(), None);
        assert_eq!(map.iter().count(), 0);
        assert!(map.shard_table(0).is_empty());
        assert_eq!(map.info().empty_shards, SHARD_COUNT);
    }
}
