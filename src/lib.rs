//! Immutable, sharded, hash-indexed key-value chunks.
//!
//! A `shardmap` chunk is written once by a single [`ShardMapSession`] and is
//! read-only afterwards. Records are stored back to back as length-prefixed
//! byte strings; every key is hashed into one of 256 shards, and each shard
//! gets an open-addressed table sized at twice its entry count. The header at
//! offset 0 is backpatched last with the chunk size and the location of every
//! shard table.
//!
//! Readers load the whole chunk into memory with [`ShardMap`], validate the
//! header, and answer point lookups by linear probing, returning views into
//! the loaded buffer.
//!
//! ```
//! use shardmap::{ShardMap, ShardMapBuilder};
//!
//! # fn main() -> shardmap::Result<()> {
//! let dir = tempfile::tempdir()?;
//! let path = dir.path().join("words.shardmap");
//!
//! let mut session = ShardMapBuilder::default().create(&path)?;
//! session.put("wow", "3")?;
//! session.put("pancake", "7")?;
//! session.put("oyster", "6")?;
//! session.finish()?;
//!
//! let map = ShardMap::open(&path)?;
//! assert_eq!(map.get("pancake")?, Some(b"7".to_vec()));
//! assert_eq!(map.get("banana")?, None);
//! # Ok(())
//! # }
//! ```

mod error;
pub use error::{Error, Result};

mod hasher;
pub use hasher::{hash_key, murmur3_32, HASH_SEED};

mod meta;
pub use meta::{Record, ShardMapHeader, ShardMapInfo, Slot, TableRef};
pub use meta::{BYTE_ORDER_CHECK, HEADER_SIZE, MAGIC, SHARD_COUNT, VERSION};

mod reader;
pub use reader::ShardMapReader;

mod writer;
pub use writer::ShardMapWriter;

mod shardmap;
pub use shardmap::{ReadOptions, ShardMap, ShardMapIter, ShardTable};

mod builder;
pub use builder::{ShardMapBuilder, ShardMapSession};
