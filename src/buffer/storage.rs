//! Node-local host storage for buffer contents.
//!
//! Elements are laid out row-major with dimension 0 varying slowest. Boxes are
//! copied in contiguous runs along dimension 2.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::{BufferId, BufferInfo};
use crate::error::{Error, Result};
use crate::grid::{GridBox, MAX_DIMS};

#[derive(Debug, Clone)]
pub struct HostBuffer {
    extent: [usize; MAX_DIMS],
    elem_size: usize,
    data: Vec<u8>,
}

impl HostBuffer {
    /// Allocate a zeroed buffer, or adopt `initial` when given.
    pub fn new(info: &BufferInfo, initial: Option<Vec<u8>>) -> Result<Self> {
        let data = match initial {
            Some(bytes) => {
                if bytes.len() != info.byte_size() {
                    return Err(Error::Validation(format!(
                        "buffer {} expects {} initial bytes, got {}",
                        info.id,
                        info.byte_size(),
                        bytes.len()
                    )));
                }
                bytes
            }
            None => vec![0; info.byte_size()],
        };
        Ok(Self {
            extent: info.extent,
            elem_size: info.elem_size,
            data,
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Copy the elements of `b` out of the buffer.
    pub fn read_box(&self, b: &GridBox) -> Result<Vec<u8>> {
        self.check_bounds(b)?;
        let mut out = Vec::with_capacity(b.area() * self.elem_size);
        for (start, len) in self.runs(b) {
            out.extend_from_slice(&self.data[start..start + len]);
        }
        Ok(out)
    }

    /// Overwrite the elements of `b` with `bytes`, laid out like `read_box`.
    pub fn write_box(&mut self, b: &GridBox, bytes: &[u8]) -> Result<()> {
        self.check_bounds(b)?;
        let expected = b.area() * self.elem_size;
        if bytes.len() != expected {
            return Err(Error::Validation(format!(
                "box {} needs {} bytes, got {}",
                b,
                expected,
                bytes.len()
            )));
        }
        let mut offset = 0;
        for (start, len) in self.runs(b) {
            self.data[start..start + len].copy_from_slice(&bytes[offset..offset + len]);
            offset += len;
        }
        Ok(())
    }

    fn check_bounds(&self, b: &GridBox) -> Result<()> {
        if !GridBox::from_extent(self.extent).contains(b) {
            return Err(Error::InvalidRegion(format!(
                "box {} exceeds buffer extent {:?}",
                b, self.extent
            )));
        }
        Ok(())
    }

    // (byte offset, byte length) of each contiguous run in `b`.
    fn runs(&self, b: &GridBox) -> Vec<(usize, usize)> {
        if b.is_empty() {
            return Vec::new();
        }
        let (min, max) = (b.lower(), b.upper());
        let run = (max[2] - min[2]) * self.elem_size;
        let mut runs = Vec::with_capacity((max[0] - min[0]) * (max[1] - min[1]));
        for i in min[0]..max[0] {
            for j in min[1]..max[1] {
                let elem = (i * self.extent[1] + j) * self.extent[2] + min[2];
                runs.push((elem * self.elem_size, run));
            }
        }
        runs
    }
}

/// Shared handle to the host buffers of one node.
#[derive(Debug, Clone, Default)]
pub struct BufferManager {
    buffers: Arc<RwLock<HashMap<BufferId, HostBuffer>>>,
}

impl BufferManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, info: &BufferInfo, initial: Option<Vec<u8>>) -> Result<()> {
        let buffer = HostBuffer::new(info, initial)?;
        self.buffers
            .write()
            .map_err(|e| Error::LockPoisoned(e.to_string()))?
            .insert(info.id, buffer);
        Ok(())
    }

    pub fn read(&self, buffer: BufferId, b: &GridBox) -> Result<Vec<u8>> {
        let guard = self
            .buffers
            .read()
            .map_err(|e| Error::LockPoisoned(e.to_string()))?;
        guard
            .get(&buffer)
            .ok_or(Error::UnknownBuffer(buffer))?
            .read_box(b)
    }

    pub fn write(&self, buffer: BufferId, b: &GridBox, bytes: &[u8]) -> Result<()> {
        let mut guard = self
            .buffers
            .write()
            .map_err(|e| Error::LockPoisoned(e.to_string()))?;
        guard
            .get_mut(&buffer)
            .ok_or(Error::UnknownBuffer(buffer))?
            .write_box(b, bytes)
    }

    /// Full contents of a buffer as stored on this node.
    pub fn snapshot(&self, buffer: BufferId) -> Result<Vec<u8>> {
        let guard = self
            .buffers
            .read()
            .map_err(|e| Error::LockPoisoned(e.to_string()))?;
        Ok(guard
            .get(&buffer)
            .ok_or(Error::UnknownBuffer(buffer))?
            .data()
            .to_vec())
    }
}
