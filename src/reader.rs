use std::io::Result;

/// Trait abstracting read access to shardmap files.
///
/// Implementations must support positional reads without mutating shared state.
pub trait ShardMapReader {
    /// Reads exactly `length` bytes starting at `offset`.
    ///
    /// Implementations should return an error whenever the requested range
    /// cannot be satisfied in full.
    fn read_exact_range(&self, offset: u64, length: u64) -> Result<Vec<u8>>;
}

impl<T: ShardMapReader + ?Sized> ShardMapReader for &T {
    fn read_exact_range(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        (**self).read_exact_range(offset, length)
    }
}

#[cfg(unix)]
impl ShardMapReader for std::fs::File {
    fn read_exact_range(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; length as usize];
        std::os::unix::fs::FileExt::read_exact_at(self, &mut buffer, offset)?;
        Ok(buffer)
    }
}

#[cfg(windows)]
impl ShardMapReader for std::fs::File {
    fn read_exact_range(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        use std::os::windows::fs::FileExt;
        let mut buffer = vec![0u8; length as usize];
        let mut filled = 0;
        while filled < buffer.len() {
            let bytes = self.seek_read(&mut buffer[filled..], offset + filled as u64)?;
            if bytes == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "Failed to read enough bytes",
                ));
            }
            filled += bytes;
        }
        Ok(buffer)
    }
}
