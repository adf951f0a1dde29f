use std::io::Result;

/// Trait representing positional writers suitable for shardmap serialization.
///
/// Records and tables are streamed at increasing offsets, then the header is
/// backpatched at offset 0, so writers must support random-access writes.
pub trait ShardMapWriter {
    /// Writes all of `data` at the given absolute `offset`.
    fn write_at(&self, data: &[u8], offset: u64) -> Result<()>;

    /// Flushes written bytes to durable storage.
    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

impl<T: ShardMapWriter + ?Sized> ShardMapWriter for &T {
    fn write_at(&self, data: &[u8], offset: u64) -> Result<()> {
        (**self).write_at(data, offset)
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}

#[cfg(unix)]
impl ShardMapWriter for std::fs::File {
    fn write_at(&self, data: &[u8], offset: u64) -> Result<()> {
        std::os::unix::fs::FileExt::write_all_at(self, data, offset)
    }

    fn sync(&self) -> Result<()> {
        self.sync_all()
    }
}

#[cfg(windows)]
impl ShardMapWriter for std::fs::File {
    fn write_at(&self, mut data: &[u8], mut offset: u64) -> Result<()> {
        use std::os::windows::fs::FileExt;
        while !data.is_empty() {
            let written = self.seek_write(data, offset)?;
            if written == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "failed to write whole buffer",
                ));
            }
            data = &data[written..];
            offset += written as u64;
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.sync_all()
    }
}
