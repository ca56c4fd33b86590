//! Chunked upload driver
//!
//! Providers with resumable upload sessions receive the payload as a series of
//! byte ranges: full slices are appended while more than one slice remains, and
//! the final (possibly partial) slice is sent with the commit.

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;

/// One byte range of an upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slice {
    /// Offset of the first byte
    pub offset: usize,
    /// Number of bytes in this slice
    pub len: usize,
    /// Total payload size
    pub total: usize,
    /// Whether this slice is sent with the commit
    pub last: bool,
}

impl Slice {
    /// Offset one past the last byte
    pub fn end(&self) -> usize {
        self.offset + self.len
    }

    /// `Content-Range` header value (`bytes first-last/total`), `None` when empty
    pub fn content_range(&self) -> Option<String> {
        if self.len == 0 {
            return None;
        }
        Some(format!(
            "bytes {}-{}/{}",
            self.offset,
            self.end() - 1,
            self.total
        ))
    }
}

/// Split `total` bytes into upload slices of at most `slice_size` bytes.
///
/// Always yields at least one slice (the commit), so an empty payload becomes a
/// single zero-length commit at offset 0.
pub fn plan_slices(total: usize, slice_size: usize) -> Vec<Slice> {
    let slice_size = slice_size.max(1);
    let mut slices = Vec::with_capacity(total / slice_size + 1);
    let mut offset = 0;

    while total - offset > slice_size {
        slices.push(Slice {
            offset,
            len: slice_size,
            total,
            last: false,
        });
        offset += slice_size;
    }

    slices.push(Slice {
        offset,
        len: total - offset,
        total,
        last: true,
    });
    slices
}

/// Destination of a chunked upload, bound to an already opened session
#[async_trait]
pub trait SliceSink: Send {
    type Output: Send;

    /// Send a full intermediate slice
    async fn append(&mut self, slice: Slice, bytes: &[u8]) -> Result<()>;

    /// Send the final slice and commit the upload
    async fn commit(&mut self, slice: Slice, bytes: &[u8]) -> Result<Self::Output>;
}

/// Drive `sink` through every slice of `data`
pub async fn send_slices<S: SliceSink>(
    sink: &mut S,
    data: &[u8],
    slice_size: usize,
) -> Result<S::Output> {
    let slices = plan_slices(data.len(), slice_size);
    let count = slices.len();

    for slice in slices {
        let bytes = &data[slice.offset..slice.end()];
        if slice.last {
            debug!(offset = slice.offset, len = slice.len, slices = count, "Committing upload");
            return sink.commit(slice, bytes).await;
        }
        debug!(offset = slice.offset, len = slice.len, "Appending upload slice");
        sink.append(slice, bytes).await?;
    }

    unreachable!("plan_slices always ends with a commit slice")
}
