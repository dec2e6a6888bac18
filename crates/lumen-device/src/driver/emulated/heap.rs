use std::collections::BTreeMap;

use crate::driver::{DevicePtr, DriverError};

const HEAP_BASE: u64 = 0x1_0000_0000;
const HEAP_ALIGN: u64 = 256;

/// Byte-addressed host memory standing in for device memory.
///
/// Allocations are spaced apart so that pointers never alias, and any
/// address inside an allocation (an interior pointer) resolves to it.
#[derive(Debug)]
pub(crate) struct HostHeap {
    blocks: BTreeMap<u64, Vec<u8>>,
    next: u64,
    used: usize,
    capacity: usize,
}

impl HostHeap {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            blocks: BTreeMap::new(),
            next: HEAP_BASE,
            used: 0,
            capacity,
        }
    }

    pub(crate) fn used(&self) -> usize {
        self.used
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn alloc(&mut self, bytes: usize) -> Result<DevicePtr, DriverError> {
        if bytes == 0 {
            return Err(DriverError::InvalidValue("zero-sized allocation".into()));
        }
        if self.used + bytes > self.capacity {
            return Err(DriverError::OutOfMemory { requested: bytes });
        }

        let base = self.next;
        let span = (bytes as u64).div_ceil(HEAP_ALIGN) * HEAP_ALIGN;
        self.next += span + HEAP_ALIGN;
        self.blocks.insert(base, vec![0; bytes]);
        self.used += bytes;

        DevicePtr::new(base).ok_or(DriverError::InvalidValue("null allocation".into()))
    }

    pub(crate) fn free(&mut self, ptr: DevicePtr) -> Result<(), DriverError> {
        match self.blocks.remove(&ptr.addr()) {
            Some(block) => {
                self.used -= block.len();
                Ok(())
            }
            None => Err(DriverError::InvalidValue(format!("{ptr:?} is not an allocation base"))),
        }
    }

    /// Allocation base and offset of `ptr` within it.
    fn locate(&self, ptr: DevicePtr) -> Result<(u64, usize), DriverError> {
        let addr = ptr.addr();
        let (&base, block) = self
            .blocks
            .range(..=addr)
            .next_back()
            .ok_or_else(|| DriverError::InvalidValue(format!("{ptr:?} is not mapped")))?;

        let offset = (addr - base) as usize;
        if offset > block.len() {
            return Err(DriverError::InvalidValue(format!("{ptr:?} is not mapped")));
        }
        Ok((base, offset))
    }

    pub(crate) fn bytes(&self, ptr: DevicePtr, len: usize) -> Result<&[u8], DriverError> {
        let (base, offset) = self.locate(ptr)?;
        let block = &self.blocks[&base];
        block
            .get(offset..offset + len)
            .ok_or_else(|| out_of_bounds(ptr, len))
    }

    pub(crate) fn bytes_mut(&mut self, ptr: DevicePtr, len: usize) -> Result<&mut [u8], DriverError> {
        let (base, offset) = self.locate(ptr)?;
        self.blocks
            .get_mut(&base)
            .and_then(|block| block.get_mut(offset..offset + len))
            .ok_or_else(|| out_of_bounds(ptr, len))
    }

    /// Everything from `ptr` to the end of its allocation.
    pub(crate) fn tail(&self, ptr: DevicePtr) -> Result<&[u8], DriverError> {
        let (base, offset) = self.locate(ptr)?;
        Ok(&self.blocks[&base][offset..])
    }
}

fn out_of_bounds(ptr: DevicePtr, len: usize) -> DriverError {
    DriverError::InvalidValue(format!("access of {len} bytes at {ptr:?} is out of bounds"))
}
