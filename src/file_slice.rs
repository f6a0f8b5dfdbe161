use crate::error::HFSPError;
use crate::fs;
use std::cmp;
use std::io::{self, Read, Seek, SeekFrom};

/// A window `[offset, offset + length)` onto a seekable stream. Positions are
/// relative to the start of the window and reads never cross its end.
#[derive(Debug)]
pub struct FileSlice<F> {
    offset: u64,
    length: u64,
    position: u64,
    file: F,
}

impl<F> FileSlice<F>
where
    F: Seek,
{
    pub fn new(mut file: F, offset: u64, length: Option<u64>) -> fs::Result<FileSlice<F>> {
        let file_length = file.seek(SeekFrom::End(0))?;
        if file_length < offset {
            return Err(HFSPError::InvalidFileView);
        }
        let length = match length {
            None => file_length - offset,
            Some(length) => match offset.checked_add(length) {
                Some(end) if end <= file_length => length,
                _ => return Err(HFSPError::InvalidFileView),
            },
        };
        file.seek(SeekFrom::Start(offset))?;
        Ok(FileSlice {
            offset,
            length,
            position: 0,
            file,
        })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn into_inner(self) -> F {
        self.file
    }
}

impl<F> Read for FileSlice<F>
where
    F: Read + Seek,
{
    fn read(&mut self, data: &mut [u8]) -> io::Result<usize> {
        if self.position >= self.length {
            return Ok(0);
        }
        let wanted = cmp::min(data.len() as u64, self.length - self.position) as usize;
        let read = self.file.read(&mut data[..wanted])?;
        self.position += read as u64;
        Ok(read)
    }
}

impl<F> Seek for FileSlice<F>
where
    F: Seek,
{
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            SeekFrom::End(delta) => self.length.checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of slice")
        })?;
        self.file.seek(SeekFrom::Start(self.offset + target))?;
        self.position = target;
        Ok(target)
    }
}
