use std::collections::HashMap;

use bytemuck::Pod;

use super::heap::HostHeap;
use crate::driver::{DevicePtr, Dim3, DriverError, KernelArg, Occupancy};

/// Host function standing in for a compiled kernel.
pub type KernelFn = fn(&mut KernelContext<'_>) -> Result<(), DriverError>;

/// A loadable module for the emulated driver: named kernels, globals and
/// texture references.
///
/// Images are registered with the driver by name; loading a module whose
/// image bytes spell that name instantiates it.
#[derive(Clone)]
pub struct ModuleImage {
    pub(crate) name: String,
    pub(crate) kernels: HashMap<String, KernelFn>,
    pub(crate) globals: Vec<(String, usize)>,
    pub(crate) texture_refs: Vec<String>,
    pub(crate) max_threads: u32,
    pub(crate) occupancy: Option<Occupancy>,
}

impl ModuleImage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kernels: HashMap::new(),
            globals: Vec::new(),
            texture_refs: Vec::new(),
            max_threads: 1024,
            occupancy: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kernel(mut self, name: impl Into<String>, f: KernelFn) -> Self {
        self.kernels.insert(name.into(), f);
        self
    }

    pub fn global(mut self, name: impl Into<String>, bytes: usize) -> Self {
        self.globals.push((name.into(), bytes));
        self
    }

    pub fn texture_ref(mut self, name: impl Into<String>) -> Self {
        self.texture_refs.push(name.into());
        self
    }

    /// Per-function thread limit reported for every kernel of the image.
    pub fn max_threads(mut self, threads: u32) -> Self {
        self.max_threads = threads;
        self
    }

    /// Overrides the device's occupancy hint for kernels of this image.
    pub fn occupancy(mut self, occupancy: Occupancy) -> Self {
        self.occupancy = Some(occupancy);
        self
    }
}

impl std::fmt::Debug for ModuleImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kernels: Vec<_> = self.kernels.keys().collect();
        kernels.sort();
        f.debug_struct("ModuleImage")
            .field("name", &self.name)
            .field("kernels", &kernels)
            .field("globals", &self.globals)
            .field("texture_refs", &self.texture_refs.len())
            .finish()
    }
}

/// What a kernel sees while it runs: its arguments, launch shape and memory.
pub struct KernelContext<'a> {
    heap: &'a mut HostHeap,
    args: &'a [KernelArg],
    pub grid: Dim3,
    pub block: Dim3,
}

impl<'a> KernelContext<'a> {
    pub(crate) fn new(heap: &'a mut HostHeap, args: &'a [KernelArg], grid: Dim3, block: Dim3) -> Self {
        Self { heap, args, grid, block }
    }

    /// Total threads launched.
    pub fn num_threads(&self) -> u64 {
        self.grid.volume() * self.block.volume()
    }

    // ── arguments ───────────────────────────────────────────────────────────

    fn arg(&self, index: usize) -> Result<KernelArg, DriverError> {
        self.args
            .get(index)
            .copied()
            .ok_or_else(|| DriverError::LaunchFailed(format!("missing argument {index}")))
    }

    pub fn arg_opt_ptr(&self, index: usize) -> Result<Option<DevicePtr>, DriverError> {
        match self.arg(index)? {
            KernelArg::Ptr(p) => Ok(p),
            other => Err(mismatch(index, "pointer", other)),
        }
    }

    pub fn arg_ptr(&self, index: usize) -> Result<DevicePtr, DriverError> {
        self.arg_opt_ptr(index)?
            .ok_or_else(|| DriverError::LaunchFailed(format!("argument {index} is a null pointer")))
    }

    pub fn arg_i32(&self, index: usize) -> Result<i32, DriverError> {
        match self.arg(index)? {
            KernelArg::I32(v) => Ok(v),
            other => Err(mismatch(index, "i32", other)),
        }
    }

    pub fn arg_u32(&self, index: usize) -> Result<u32, DriverError> {
        match self.arg(index)? {
            KernelArg::U32(v) => Ok(v),
            other => Err(mismatch(index, "u32", other)),
        }
    }

    pub fn arg_f32(&self, index: usize) -> Result<f32, DriverError> {
        match self.arg(index)? {
            KernelArg::F32(v) => Ok(v),
            other => Err(mismatch(index, "f32", other)),
        }
    }

    pub fn arg_int4(&self, index: usize) -> Result<[i32; 4], DriverError> {
        match self.arg(index)? {
            KernelArg::Int4(v) => Ok(v),
            other => Err(mismatch(index, "int4", other)),
        }
    }

    // ── memory ──────────────────────────────────────────────────────────────

    /// Reads element `index` of a `T` array at `ptr`.
    pub fn read<T: Pod>(&self, ptr: DevicePtr, index: usize) -> Result<T, DriverError> {
        let size = size_of::<T>();
        let bytes = self.heap.bytes(ptr.offset((index * size) as u64), size)?;
        Ok(bytemuck::pod_read_unaligned(bytes))
    }

    pub fn write<T: Pod>(&mut self, ptr: DevicePtr, index: usize, value: T) -> Result<(), DriverError> {
        let size = size_of::<T>();
        let bytes = self.heap.bytes_mut(ptr.offset((index * size) as u64), size)?;
        bytes.copy_from_slice(bytemuck::bytes_of(&value));
        Ok(())
    }

    /// Copies the floats from `ptr` to the end of its allocation.
    pub fn read_f32s(&self, ptr: DevicePtr) -> Result<Vec<f32>, DriverError> {
        let tail = self.heap.tail(ptr)?;
        let whole = tail.len() / 4 * 4;
        Ok(bytemuck::pod_collect_to_vec(&tail[..whole]))
    }

    pub fn write_f32s(&mut self, ptr: DevicePtr, values: &[f32]) -> Result<(), DriverError> {
        let bytes: &[u8] = bytemuck::cast_slice(values);
        self.heap.bytes_mut(ptr, bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    pub fn read_bytes(&self, ptr: DevicePtr, len: usize) -> Result<Vec<u8>, DriverError> {
        Ok(self.heap.bytes(ptr, len)?.to_vec())
    }

    pub fn write_bytes(&mut self, ptr: DevicePtr, bytes: &[u8]) -> Result<(), DriverError> {
        self.heap.bytes_mut(ptr, bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }
}

fn mismatch(index: usize, expected: &str, got: KernelArg) -> DriverError {
    DriverError::LaunchFailed(format!("argument {index}: expected {expected}, got {got:?}"))
}
