//! Chunked blob streaming.
//!
//! A [Blob] owns a pool-allocated working buffer of one chunk. Readers
//! refill it chunk by chunk; writers flush it every time it fills and
//! once more at [Blob::finalize], which also drops any chunk of a
//! previous incarnation surviving past the new end. A writer discarded
//! without finalization leaves the blob invalid and the holder deletes
//! it when the lock is released.

use log::error;

use std::cmp;

use crate::storage::access::BlobAccess;
use crate::storage::CHUNK_SIZE;
use crate::{err_at, Error, Result};

pub struct Blob<'a> {
    access: &'a mut BlobAccess,
    buffer: Vec<u8>,
    writable: bool,
    /// Chunk the buffer holds (reader) or the next chunk to flush
    /// (writer).
    seq: u64,
    /// Read offset within the buffer.
    chunk_pos: usize,
    loaded: bool,
    /// Logical byte position: bytes streamed so far.
    pos: u64,
    /// Total size of the blob; meaningful for readers.
    size: u64,
}

impl<'a> Drop for Blob<'a> {
    fn drop(&mut self) {
        let buffer = std::mem::replace(&mut self.buffer, vec![]);
        self.access.return_buffer(buffer);
    }
}

impl<'a> Blob<'a> {
    pub(crate) fn reader(access: &'a mut BlobAccess) -> Blob<'a> {
        let buffer = access.take_buffer();
        let size = access.get_blob_size();
        Blob {
            access,
            buffer,
            writable: false,
            seq: 0,
            chunk_pos: 0,
            loaded: false,
            pos: 0,
            size,
        }
    }

    pub(crate) fn writer(access: &'a mut BlobAccess) -> Blob<'a> {
        let buffer = access.take_buffer();
        Blob {
            access,
            buffer,
            writable: true,
            seq: 0,
            chunk_pos: 0,
            loaded: false,
            pos: 0,
            size: 0,
        }
    }

    /// Whether this blob handle accepts writes.
    #[inline]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Whether [Blob::finalize] has committed the written data.
    #[inline]
    pub fn is_finalized(&self) -> bool {
        self.access.is_finalized()
    }

    /// Logical position, bytes read or written so far.
    #[inline]
    pub fn to_pos(&self) -> u64 {
        self.pos
    }

    /// Read from the current chunk, fetching the next chunk when the
    /// buffer is exhausted. Returns the count of bytes copied into
    /// `buf`; 0 at end of blob.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.writable {
            return err_at!(Fatal, msg: "read on a write handle");
        }
        let mut n = 0;
        while n < buf.len() && self.pos < self.size {
            if !self.loaded || self.chunk_pos == self.buffer.len() {
                if self.loaded {
                    self.seq += 1;
                }
                self.fetch_chunk()?;
            }
            let m = cmp::min(buf.len() - n, self.buffer.len() - self.chunk_pos);
            buf[n..n + m].copy_from_slice(&self.buffer[self.chunk_pos..self.chunk_pos + m]);
            self.chunk_pos += m;
            self.pos += m as u64;
            n += m;
        }
        if n > 0 {
            self.access.mark_touched();
        }
        Ok(n)
    }

    fn fetch_chunk(&mut self) -> Result<()> {
        match self.access.read_chunk(self.seq) {
            Ok(chunk) => {
                self.buffer = chunk;
                self.chunk_pos = 0;
                self.loaded = true;
                Ok(())
            }
            Err(err) => {
                // inconsistent chunk data; the blob is reclassified as
                // non-existent once the lock goes back.
                error!(target: "ncache", "blob chunk fetch: {}", err);
                self.access.mark_corrupted();
                Err(err)
            }
        }
    }

    /// Append `data`, flushing a full chunk to disk whenever the buffer
    /// fills.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if !self.writable {
            return err_at!(Fatal, msg: "write on a read handle");
        }
        if self.access.is_finalized() {
            return err_at!(Fatal, msg: "write after finalize");
        }
        match self.access.max_blob_size() {
            0 => (),
            max if self.pos + (data.len() as u64) > max => {
                return err_at!(
                    TooBigBlob,
                    msg: "blob size exceeds the maximum of {} bytes", max
                );
            }
            _ => (),
        }

        let mut off = 0;
        while off < data.len() {
            let m = cmp::min(data.len() - off, CHUNK_SIZE - self.buffer.len());
            self.buffer.extend_from_slice(&data[off..off + m]);
            off += m;
            if self.buffer.len() == CHUNK_SIZE {
                self.flush_chunk()?;
            }
        }
        self.pos += data.len() as u64;
        Ok(())
    }

    fn flush_chunk(&mut self) -> Result<()> {
        self.access.put_chunk(self.seq, &self.buffer)?;
        self.seq += 1;
        self.buffer.clear();
        Ok(())
    }

    /// Commit the written data: flush the last partial chunk, drop any
    /// surviving chunks past the new end and mark the blob valid. The
    /// blob becomes visible to readers when the lock is released.
    pub fn finalize(&mut self) -> Result<()> {
        if !self.writable {
            return err_at!(Fatal, msg: "finalize on a read handle");
        }
        if self.access.is_finalized() {
            return err_at!(Fatal, msg: "blob already finalized");
        }
        if !self.buffer.is_empty() {
            self.flush_chunk()?;
        }
        self.access.trunc_chunks(self.seq)?;
        self.access.mark_finalized(self.pos);
        Ok(())
    }
}
