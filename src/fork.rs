//! Reading a fork's logical bytes through its extent list.

use crate::error::HFSPError;
use crate::fs;
use crate::volume::ExtentDescriptor;
use log::debug;
use std::cmp;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::{Mutex, MutexGuard};

/// A seekable stream shared by every reader of one volume. Each seek and read
/// happens under the lock, and the stream's cursor is tracked so that readers
/// can tell whether somebody else moved it.
#[derive(Debug)]
pub struct SharedStream<F> {
    inner: Mutex<TrackedStream<F>>,
}

#[derive(Debug)]
pub struct TrackedStream<F> {
    stream: F,
    position: Option<u64>,
    seeks: u64,
}

impl<F> TrackedStream<F>
where
    F: Read + Seek,
{
    pub fn position(&self) -> Option<u64> {
        self.position
    }

    pub fn seek_to(&mut self, offset: u64) -> io::Result<()> {
        self.seeks += 1;
        match self.stream.seek(SeekFrom::Start(offset)) {
            Ok(position) => {
                self.position = Some(position);
                Ok(())
            }
            Err(error) => {
                self.position = None;
                Err(error)
            }
        }
    }

    pub fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        match self.stream.read(buffer) {
            Ok(read) => {
                self.position = self.position.map(|p| p + read as u64);
                Ok(read)
            }
            Err(error) => {
                self.position = None;
                Err(error)
            }
        }
    }

    pub fn read_exact_at(&mut self, offset: u64, buffer: &mut [u8]) -> io::Result<()> {
        self.seek_to(offset)?;
        let result = self.stream.read_exact(buffer);
        self.position = match result {
            Ok(()) => Some(offset + buffer.len() as u64),
            Err(_) => None,
        };
        result
    }
}

impl<F> SharedStream<F>
where
    F: Read + Seek,
{
    pub fn new(stream: F) -> SharedStream<F> {
        SharedStream {
            inner: Mutex::new(TrackedStream {
                stream,
                position: None,
                seeks: 0,
            }),
        }
    }

    pub fn lock(&self) -> io::Result<MutexGuard<'_, TrackedStream<F>>> {
        self.inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "backing stream lock poisoned"))
    }

    pub fn read_exact_at(&self, offset: u64, buffer: &mut [u8]) -> io::Result<()> {
        self.lock()?.read_exact_at(offset, buffer)
    }

    pub fn length(&self) -> io::Result<u64> {
        let mut stream = self.lock()?;
        stream.position = None;
        stream.stream.seek(SeekFrom::End(0))
    }

    pub fn seek_count(&self) -> u64 {
        self.lock().map(|stream| stream.seeks).unwrap_or(0)
    }

    pub fn into_inner(self) -> io::Result<F> {
        self.inner
            .into_inner()
            .map(|tracked| tracked.stream)
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "backing stream lock poisoned"))
    }
}

/// A fork's contents as a `Read + Seek` stream. Seeking only records the
/// new position; the backing stream is repositioned on the next read, and
/// only when its cursor is not already where the read must start.
#[derive(Debug)]
pub struct HFSFile<'a, F> {
    stream: &'a SharedStream<F>,
    extents: Vec<ExtentDescriptor>,
    block_size: u64,
    length: u64,
    position: u64,
    last_logical: Option<u64>,
    last_physical: Option<u64>,
}

impl<'a, F> HFSFile<'a, F>
where
    F: Read + Seek,
{
    pub fn new(
        stream: &'a SharedStream<F>,
        extents: Vec<ExtentDescriptor>,
        block_size: u32,
        length: u64,
    ) -> fs::Result<HFSFile<'a, F>> {
        let block_size = block_size as u64;
        let mut allocated = 0u64;
        for extent in &extents {
            let bytes = extent.block_count as u64 * block_size;
            let end = (extent.start_block as u64 + extent.block_count as u64).checked_mul(block_size);
            allocated = match (allocated.checked_add(bytes), end) {
                (Some(total), Some(_)) => total,
                _ => {
                    return Err(HFSPError::corrupt(format!(
                        "extent ({}, {}) overflows a 64-bit fork at block size {}",
                        extent.start_block, extent.block_count, block_size
                    )))
                }
            };
        }
        if length > allocated {
            return Err(HFSPError::inconsistent(format!(
                "fork of {} bytes has only {} bytes allocated",
                length, allocated
            )));
        }
        Ok(HFSFile {
            stream,
            extents,
            block_size,
            length,
            position: 0,
            last_logical: None,
            last_physical: None,
        })
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn extents(&self) -> &[ExtentDescriptor] {
        &self.extents
    }

    /// Physical offset of logical byte `logical` and the bytes left in its
    /// extent.
    fn map(&self, logical: u64) -> Option<(u64, u64)> {
        let mut extent_start = 0;
        for extent in &self.extents {
            let extent_length = extent.block_count as u64 * self.block_size;
            if logical < extent_start + extent_length {
                let within = logical - extent_start;
                return Some((extent.start_block as u64 * self.block_size + within, extent_length - within));
            }
            extent_start += extent_length;
        }
        None
    }
}

impl<'a, F> Read for HFSFile<'a, F>
where
    F: Read + Seek,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.position >= self.length {
            return Ok(0);
        }
        let wanted = cmp::min(buf.len() as u64, self.length - self.position) as usize;
        let mut stream = self.stream.lock()?;
        let mut done = 0;
        while done < wanted {
            let (physical, run) = match self.map(self.position) {
                Some(mapped) => mapped,
                None => break,
            };
            let chunk = cmp::min(run, (wanted - done) as u64) as usize;
            let in_place = self.last_logical == Some(self.position)
                && self.last_physical == Some(physical)
                && stream.position() == Some(physical);
            if !in_place {
                debug!("Seeking backing stream to {} for fork offset {}", physical, self.position);
                stream.seek_to(physical)?;
            }
            let read = stream.read(&mut buf[done..done + chunk])?;
            if read == 0 {
                break;
            }
            done += read;
            self.position += read as u64;
            self.last_logical = Some(self.position);
            self.last_physical = Some(physical + read as u64);
            if read < chunk {
                break;
            }
        }
        Ok(done)
    }
}

impl<'a, F> Seek for HFSFile<'a, F> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            SeekFrom::End(delta) => self.length.checked_add_signed(delta),
        };
        self.position = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of fork")
        })?;
        Ok(self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn disk() -> Vec<u8> {
        (0..16 * 512).map(|i| (i % 251) as u8).collect()
    }

    fn extent(start_block: u32, block_count: u32) -> ExtentDescriptor {
        ExtentDescriptor { start_block, block_count }
    }

    #[test]
    fn test_read_spans_extents() {
        let data = disk();
        let stream = SharedStream::new(Cursor::new(data.clone()));
        let mut fork = HFSFile::new(&stream, vec![extent(0, 2), extent(10, 1)], 512, 1536).unwrap();
        fork.seek(SeekFrom::Start(900)).unwrap();
        let mut buffer = vec![0u8; 600];
        fork.read_exact(&mut buffer).unwrap();

        let mut expected = data[900..1024].to_vec();
        expected.extend_from_slice(&data[10 * 512..10 * 512 + 476]);
        assert_eq!(buffer, expected);
    }

    #[test]
    fn test_reads_clamp_to_logical_length() {
        let data = disk();
        let stream = SharedStream::new(Cursor::new(data.clone()));
        let mut fork = HFSFile::new(&stream, vec![extent(4, 2)], 512, 700).unwrap();
        let mut contents = Vec::new();
        fork.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, data[2048..2748].to_vec());

        fork.seek(SeekFrom::Start(5000)).unwrap();
        let mut buffer = [0u8; 16];
        assert_eq!(fork.read(&mut buffer).unwrap(), 0);
        assert_eq!(fork.seek(SeekFrom::End(-100)).unwrap(), 600);
        assert_eq!(fork.read(&mut [0u8; 400]).unwrap(), 100);
    }

    #[test]
    fn test_seek_does_no_io() {
        let stream = SharedStream::new(Cursor::new(disk()));
        let mut fork = HFSFile::new(&stream, vec![extent(1, 4)], 512, 2048).unwrap();
        fork.seek(SeekFrom::Start(100)).unwrap();
        fork.seek(SeekFrom::Current(50)).unwrap();
        assert_eq!(stream.seek_count(), 0);
        assert!(fork.seek(SeekFrom::Current(-1000)).is_err());
    }

    #[test]
    fn test_sequential_reads_reuse_stream_position() {
        let stream = SharedStream::new(Cursor::new(disk()));
        let mut fork = HFSFile::new(&stream, vec![extent(1, 4)], 512, 2048).unwrap();
        let mut buffer = [0u8; 100];
        for _ in 0..5 {
            fork.read_exact(&mut buffer).unwrap();
        }
        assert_eq!(stream.seek_count(), 1);
    }

    #[test]
    fn test_reseeks_after_other_reader_moves_stream() {
        let data = disk();
        let stream = SharedStream::new(Cursor::new(data.clone()));
        let mut first = HFSFile::new(&stream, vec![extent(1, 2)], 512, 1024).unwrap();
        let mut second = HFSFile::new(&stream, vec![extent(8, 2)], 512, 1024).unwrap();
        let mut a = [0u8; 10];
        let mut b = [0u8; 10];
        first.read_exact(&mut a).unwrap();
        second.read_exact(&mut b).unwrap();
        first.read_exact(&mut a).unwrap();
        assert_eq!(&a[..], &data[522..532]);
        assert_eq!(&b[..], &data[4096..4106]);
        assert_eq!(stream.seek_count(), 3);
    }

    #[test]
    fn test_short_underlying_stream_returns_partial_count() {
        let stream = SharedStream::new(Cursor::new(vec![7u8; 1200]));
        let mut fork = HFSFile::new(&stream, vec![extent(2, 1)], 512, 512).unwrap();
        let mut buffer = [0u8; 512];
        assert_eq!(fork.read(&mut buffer).unwrap(), 176);
    }

    #[test]
    fn test_oversized_extents_are_corrupt() {
        let stream = SharedStream::new(Cursor::new(disk()));
        let result = HFSFile::new(&stream, vec![extent(0, u32::MAX); 3], 1 << 31, 10);
        assert!(matches!(result, Err(HFSPError::CorruptStructure(_))));
        let result = HFSFile::new(&stream, vec![extent(u32::MAX, u32::MAX)], 1 << 31, 10);
        assert!(matches!(result, Err(HFSPError::CorruptStructure(_))));
    }

    #[test]
    fn test_logical_size_beyond_allocation_is_inconsistent() {
        let stream = SharedStream::new(Cursor::new(disk()));
        let result = HFSFile::new(&stream, vec![extent(1, 1)], 512, 513);
        assert!(matches!(result, Err(HFSPError::Inconsistent(_))));
    }
}
