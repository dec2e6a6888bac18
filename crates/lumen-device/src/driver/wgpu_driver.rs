//! Compute-only [`Driver`] over wgpu.
//!
//! Module images are WGSL source. A module declares its globals with header
//! lines of the form `// lumen:global <name> <bytes>`; the driver backs each
//! with its own buffer. Kernels are `@compute` entry points and receive their
//! launch arguments through a fixed binding convention:
//!
//! - `@group(0) @binding(0) var<uniform> args: array<vec4<u32>, 32>` holds one
//!   slot per argument. Scalars sit in `.x` (as raw bits), `int4` arguments
//!   fill the slot, pointer arguments carry their byte offset in `.x` and 1 in
//!   `.y` when present.
//! - `@group(0) @binding(1 + i)` is the storage buffer behind pointer
//!   argument `i`.
//!
//! Device pointers encode a buffer id in the upper 32 bits and a byte offset
//! in the lower 32, so interior pointers survive the round trip through the
//! backend. Textures and display interop are not available.

use std::borrow::Cow;
use std::collections::HashMap;
use std::num::NonZeroU64;
use std::sync::mpsc;
use std::sync::{Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use super::{
    ArrayDesc, ArrayHandle, ContextFlags, ContextHandle, DeviceAttributes, DevicePtr, Dim3, Driver,
    DriverError, FunctionHandle, GraphicsResource, KernelArg, MemInfo, ModuleHandle, Occupancy, Sampling,
    TextureObject,
};

/// Argument slots in the uniform block.
pub const MAX_ARGS: usize = 32;

/// Memory reported when the platform exposes no budget.
const DEFAULT_MEMORY_BUDGET: usize = 2 << 30;

const GLOBAL_DIRECTIVE: &str = "// lumen:global";

// ── state ───────────────────────────────────────────────────────────────────

struct Context {
    device: wgpu::Device,
    queue: wgpu::Queue,
    limits: wgpu::Limits,
    allocated: usize,
}

struct Allocation {
    ctx: ContextHandle,
    buffer: wgpu::Buffer,
    size: usize,
}

struct Entry {
    name: String,
    workgroup: [u32; 3],
}

struct Module {
    ctx: ContextHandle,
    shader: wgpu::ShaderModule,
    entries: Vec<Entry>,
    globals: HashMap<String, (DevicePtr, usize)>,
}

struct Function {
    module: ModuleHandle,
    entry: usize,
}

struct Pipeline {
    layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
}

#[derive(Default)]
struct State {
    next_handle: u64,
    next_buffer: u32,
    contexts: HashMap<ContextHandle, Context>,
    stacks: HashMap<ThreadId, Vec<ContextHandle>>,
    buffers: HashMap<u32, Allocation>,
    modules: HashMap<ModuleHandle, Module>,
    functions: HashMap<FunctionHandle, Function>,
    /// Keyed by function and the mask of pointer argument slots.
    pipelines: HashMap<(FunctionHandle, u32), Pipeline>,
}

impl State {
    fn handle(&mut self) -> NonZeroU64 {
        self.next_handle += 1;
        NonZeroU64::new(self.next_handle).unwrap_or(NonZeroU64::MIN)
    }

    fn current(&self) -> Result<ContextHandle, DriverError> {
        self.stacks
            .get(&thread::current().id())
            .and_then(|stack| stack.last().copied())
            .ok_or(DriverError::NoCurrentContext)
    }

    fn context(&self) -> Result<(ContextHandle, &Context), DriverError> {
        let handle = self.current()?;
        let ctx = self.contexts.get(&handle).ok_or(DriverError::InvalidContext)?;
        Ok((handle, ctx))
    }

    /// Buffer and byte offset behind `ptr`, checked against `len` bytes.
    fn resolve(&self, ptr: DevicePtr, len: usize) -> Result<(&Allocation, u64), DriverError> {
        let (id, offset) = split_ptr(ptr);
        let alloc = self.buffers.get(&id).ok_or(DriverError::InvalidHandle)?;
        if offset as usize + len > alloc.size {
            return Err(DriverError::InvalidValue(format!(
                "{len} bytes at offset {offset} exceed a {} byte allocation",
                alloc.size
            )));
        }
        Ok((alloc, offset))
    }

    fn alloc(&mut self, ctx: ContextHandle, bytes: usize, label: &str) -> Result<DevicePtr, DriverError> {
        let context = self.contexts.get_mut(&ctx).ok_or(DriverError::InvalidContext)?;
        if bytes as u64 > context.limits.max_buffer_size || bytes > u32::MAX as usize {
            return Err(DriverError::OutOfMemory { requested: bytes });
        }

        let buffer = context.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: align4(bytes.max(4)) as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        context.allocated += bytes;

        self.next_buffer += 1;
        let id = self.next_buffer;
        self.buffers.insert(id, Allocation { ctx, buffer, size: bytes });
        join_ptr(id, 0).ok_or(DriverError::InvalidHandle)
    }

    fn free(&mut self, id: u32) -> Result<(), DriverError> {
        let alloc = self.buffers.remove(&id).ok_or(DriverError::InvalidHandle)?;
        if let Some(context) = self.contexts.get_mut(&alloc.ctx) {
            context.allocated = context.allocated.saturating_sub(alloc.size);
        }
        alloc.buffer.destroy();
        Ok(())
    }
}

/// `None` only for buffer id 0, which is never handed out.
fn join_ptr(id: u32, offset: u32) -> Option<DevicePtr> {
    DevicePtr::new(((id as u64) << 32) | offset as u64)
}

fn split_ptr(ptr: DevicePtr) -> (u32, u64) {
    ((ptr.addr() >> 32) as u32, ptr.addr() & 0xffff_ffff)
}

fn align4(n: usize) -> usize {
    n.div_ceil(4) * 4
}

fn wait(device: &wgpu::Device) -> Result<(), DriverError> {
    device
        .poll(wgpu::PollType::wait_indefinitely())
        .map(|_| ())
        .map_err(|e| DriverError::LaunchFailed(e.to_string()))
}

/// Reads `len` bytes at `offset` of `buffer` through a staging buffer.
fn read_buffer(ctx: &Context, buffer: &wgpu::Buffer, offset: u64, len: usize) -> Result<Vec<u8>, DriverError> {
    let start = offset & !3;
    let end = align4((offset as usize) + len) as u64;
    let size = end - start;

    let staging = ctx.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("lumen readback"),
        size,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    let mut encoder = ctx
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("lumen readback") });
    encoder.copy_buffer_to_buffer(buffer, start, &staging, 0, size);
    ctx.queue.submit(Some(encoder.finish()));

    let slice = staging.slice(..);
    let (tx, rx) = mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |r| {
        let _ = tx.send(r);
    });
    wait(&ctx.device)?;
    rx.recv()
        .map_err(|e| DriverError::LaunchFailed(e.to_string()))?
        .map_err(|e| DriverError::LaunchFailed(e.to_string()))?;

    let skip = (offset - start) as usize;
    let bytes = slice.get_mapped_range()[skip..skip + len].to_vec();
    staging.unmap();
    Ok(bytes)
}

/// Writes `data` at `offset`, patching unaligned edges from a readback.
fn write_buffer(ctx: &Context, buffer: &wgpu::Buffer, offset: u64, data: &[u8]) -> Result<(), DriverError> {
    if data.is_empty() {
        return Ok(());
    }
    if offset % 4 == 0 && data.len() % 4 == 0 {
        ctx.queue.write_buffer(buffer, offset, data);
        return Ok(());
    }

    let start = offset & !3;
    let end = align4(offset as usize + data.len()) as u64;
    let mut patch = read_buffer(ctx, buffer, start, (end - start) as usize)?;
    let skip = (offset - start) as usize;
    patch[skip..skip + data.len()].copy_from_slice(data);
    ctx.queue.write_buffer(buffer, start, &patch);
    Ok(())
}

// ── module parsing ──────────────────────────────────────────────────────────

fn parse_globals(source: &str) -> Result<Vec<(String, usize)>, DriverError> {
    source
        .lines()
        .filter_map(|line| line.trim().strip_prefix(GLOBAL_DIRECTIVE))
        .map(|rest| {
            let mut parts = rest.split_whitespace();
            match (parts.next(), parts.next().and_then(|s| s.parse().ok())) {
                (Some(name), Some(bytes)) => Ok((name.to_string(), bytes)),
                _ => Err(DriverError::InvalidImage(format!("malformed global directive \"{}\"", rest.trim()))),
            }
        })
        .collect()
}

/// `@compute` entry points and their workgroup sizes.
fn parse_entries(source: &str) -> Vec<Entry> {
    let mut entries = Vec::new();
    let mut rest = source;
    while let Some(at) = rest.find("@compute") {
        rest = &rest[at + "@compute".len()..];
        let Some(fn_at) = rest.find("fn ") else { break };
        let attrs = &rest[..fn_at];
        let name: String = rest[fn_at + 3..]
            .trim_start()
            .chars()
            .take_while(|c| c.is_alphanumeric() || *c == '_')
            .collect();
        if !name.is_empty() {
            entries.push(Entry {
                name,
                workgroup: parse_workgroup(attrs),
            });
        }
        rest = &rest[fn_at..];
    }
    entries
}

fn parse_workgroup(attrs: &str) -> [u32; 3] {
    let mut size = [1; 3];
    if let Some(open) = attrs.find("@workgroup_size(") {
        let args = &attrs[open + "@workgroup_size(".len()..];
        let args = args.split(')').next().unwrap_or_default();
        for (slot, value) in size.iter_mut().zip(args.split(',')) {
            *slot = value.trim().trim_end_matches('u').parse().unwrap_or(1);
        }
    }
    size
}

fn pack_args(args: &[KernelArg]) -> Result<([u32; MAX_ARGS * 4], u32), DriverError> {
    if args.len() > MAX_ARGS {
        return Err(DriverError::InvalidValue(format!("{} arguments exceed {MAX_ARGS}", args.len())));
    }
    let mut slots = [0u32; MAX_ARGS * 4];
    let mut pointers = 0u32;
    for (i, arg) in args.iter().enumerate() {
        let slot = &mut slots[i * 4..i * 4 + 4];
        match *arg {
            KernelArg::Ptr(ptr) => {
                pointers |= 1 << i;
                if let Some(ptr) = ptr {
                    slot[0] = split_ptr(ptr).1 as u32;
                    slot[1] = 1;
                }
            }
            KernelArg::I32(v) => slot[0] = v as u32,
            KernelArg::U32(v) => slot[0] = v,
            KernelArg::F32(v) => slot[0] = v.to_bits(),
            KernelArg::Int4(v) => {
                for (dst, src) in slot.iter_mut().zip(v) {
                    *dst = src as u32;
                }
            }
        }
    }
    Ok((slots, pointers))
}

// ── driver ──────────────────────────────────────────────────────────────────

/// wgpu-backed driver over every adapter the instance exposes.
pub struct WgpuDriver {
    instance: wgpu::Instance,
    adapters: Vec<wgpu::Adapter>,
    state: Mutex<State>,
}

impl WgpuDriver {
    /// Opens the high-performance adapter of any available backend.
    pub fn new() -> Result<Self, DriverError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|_| DriverError::NotInitialized)?;

        let info = adapter.get_info();
        log::info!("wgpu adapter: {} ({:?})", info.name, info.backend);

        Ok(Self {
            instance,
            adapters: vec![adapter],
            state: Mutex::new(State::default()),
        })
    }

    pub fn instance(&self) -> &wgpu::Instance {
        &self.instance
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn adapter(&self, ordinal: usize) -> Result<&wgpu::Adapter, DriverError> {
        self.adapters.get(ordinal).ok_or(DriverError::InvalidDevice(ordinal))
    }
}

impl Driver for WgpuDriver {
    fn name(&self) -> &str {
        "wgpu"
    }

    fn device_count(&self) -> Result<usize, DriverError> {
        Ok(self.adapters.len())
    }

    fn device_attributes(&self, ordinal: usize) -> Result<DeviceAttributes, DriverError> {
        let adapter = self.adapter(ordinal)?;
        let info = adapter.get_info();
        let limits = adapter.limits();
        Ok(DeviceAttributes {
            name: info.name,
            // Storage buffers and compute shaders, no bindless sampling.
            compute_major: 2,
            compute_minor: 0,
            pci_domain: 0,
            pci_bus: info.vendor,
            pci_device: info.device,
            kernel_exec_timeout: info.device_type != wgpu::DeviceType::Cpu,
            compute_preemption: false,
            multiprocessor_count: 1,
            max_threads_per_block: limits.max_compute_invocations_per_workgroup,
            warp_size: 32,
            max_shared_memory_per_block: limits.max_compute_workgroup_storage_size as usize,
            clock_rate_khz: 0,
            total_memory: DEFAULT_MEMORY_BUDGET,
        })
    }

    fn context_create(&self, ordinal: usize, flags: ContextFlags) -> Result<ContextHandle, DriverError> {
        if flags.display_sharing {
            return Err(DriverError::InteropUnavailable);
        }
        let adapter = self.adapter(ordinal)?;
        let limits = adapter.limits();
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("lumen-device"),
            required_features: wgpu::Features::empty(),
            required_limits: limits.clone(),
            experimental_features: wgpu::ExperimentalFeatures::disabled(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::Off,
        }))
        .map_err(|e| DriverError::InvalidValue(e.to_string()))?;

        let mut state = self.lock();
        let handle = ContextHandle::from_raw(state.handle());
        state.contexts.insert(
            handle,
            Context {
                device,
                queue,
                limits,
                allocated: 0,
            },
        );
        Ok(handle)
    }

    fn context_destroy(&self, ctx: ContextHandle) -> Result<(), DriverError> {
        let mut state = self.lock();
        state.contexts.remove(&ctx).ok_or(DriverError::InvalidContext)?;

        let owned: Vec<u32> = state.buffers.iter().filter(|(_, a)| a.ctx == ctx).map(|(id, _)| *id).collect();
        for id in owned {
            state.buffers.remove(&id);
        }
        let modules: Vec<ModuleHandle> =
            state.modules.iter().filter(|(_, m)| m.ctx == ctx).map(|(h, _)| *h).collect();
        for module in modules {
            state.modules.remove(&module);
        }
        let State {
            functions, modules, pipelines, ..
        } = &mut *state;
        functions.retain(|_, f| modules.contains_key(&f.module));
        pipelines.retain(|(func, _), _| functions.contains_key(func));
        Ok(())
    }

    fn context_push(&self, ctx: ContextHandle) -> Result<(), DriverError> {
        let mut state = self.lock();
        if !state.contexts.contains_key(&ctx) {
            return Err(DriverError::InvalidContext);
        }
        state.stacks.entry(thread::current().id()).or_default().push(ctx);
        Ok(())
    }

    fn context_pop(&self) -> Result<ContextHandle, DriverError> {
        let mut state = self.lock();
        state
            .stacks
            .get_mut(&thread::current().id())
            .and_then(|stack| stack.pop())
            .ok_or(DriverError::NoCurrentContext)
    }

    fn synchronize(&self) -> Result<(), DriverError> {
        let state = self.lock();
        let (_, ctx) = state.context()?;
        wait(&ctx.device)
    }

    fn mem_alloc(&self, bytes: usize) -> Result<DevicePtr, DriverError> {
        let mut state = self.lock();
        let ctx = state.current()?;
        state.alloc(ctx, bytes, "lumen buffer")
    }

    fn mem_free(&self, ptr: DevicePtr) -> Result<(), DriverError> {
        let (id, offset) = split_ptr(ptr);
        if offset != 0 {
            return Err(DriverError::InvalidValue("freeing an interior pointer".into()));
        }
        self.lock().free(id)
    }

    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> Result<(), DriverError> {
        let state = self.lock();
        let (_, ctx) = state.context()?;
        let (alloc, offset) = state.resolve(dst, src.len())?;
        write_buffer(ctx, &alloc.buffer, offset, src)
    }

    fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> Result<(), DriverError> {
        let state = self.lock();
        let (_, ctx) = state.context()?;
        let (alloc, offset) = state.resolve(src, dst.len())?;
        let bytes = read_buffer(ctx, &alloc.buffer, offset, dst.len())?;
        dst.copy_from_slice(&bytes);
        Ok(())
    }

    fn memset_d8(&self, dst: DevicePtr, value: u8, bytes: usize) -> Result<(), DriverError> {
        let state = self.lock();
        let (_, ctx) = state.context()?;
        let (alloc, offset) = state.resolve(dst, bytes)?;
        write_buffer(ctx, &alloc.buffer, offset, &vec![value; bytes])
    }

    fn mem_info(&self) -> Result<MemInfo, DriverError> {
        let state = self.lock();
        let (_, ctx) = state.context()?;
        Ok(MemInfo {
            free: DEFAULT_MEMORY_BUDGET.saturating_sub(ctx.allocated),
            total: DEFAULT_MEMORY_BUDGET,
        })
    }

    fn module_load(&self, image: &[u8]) -> Result<ModuleHandle, DriverError> {
        let source = std::str::from_utf8(image).map_err(|e| DriverError::InvalidImage(e.to_string()))?;
        let globals = parse_globals(source)?;
        let entries = parse_entries(source);
        if entries.is_empty() {
            return Err(DriverError::InvalidImage("no @compute entry points".into()));
        }

        let mut state = self.lock();
        let (ctx_handle, ctx) = state.context()?;
        let shader = ctx.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("lumen kernels"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(source)),
        });

        let mut bound = HashMap::new();
        for (name, bytes) in globals {
            let ptr = state.alloc(ctx_handle, bytes, &name)?;
            bound.insert(name, (ptr, bytes));
        }

        let handle = ModuleHandle::from_raw(state.handle());
        log::debug!("wgpu module loaded: {} kernels, {} globals", entries.len(), bound.len());
        state.modules.insert(
            handle,
            Module {
                ctx: ctx_handle,
                shader,
                entries,
                globals: bound,
            },
        );
        Ok(handle)
    }

    fn module_unload(&self, module: ModuleHandle) -> Result<(), DriverError> {
        let mut state = self.lock();
        let removed = state.modules.remove(&module).ok_or(DriverError::InvalidHandle)?;
        for (ptr, _) in removed.globals.values() {
            state.free(split_ptr(*ptr).0)?;
        }
        let State { functions, pipelines, .. } = &mut *state;
        functions.retain(|_, f| f.module != module);
        pipelines.retain(|(func, _), _| functions.contains_key(func));
        Ok(())
    }

    fn module_function(&self, module: ModuleHandle, name: &str) -> Result<FunctionHandle, DriverError> {
        let mut state = self.lock();
        let entry = state
            .modules
            .get(&module)
            .ok_or(DriverError::InvalidHandle)?
            .entries
            .iter()
            .position(|e| e.name == name)
            .ok_or_else(|| DriverError::NotFound(name.to_string()))?;

        let handle = FunctionHandle::from_raw(state.handle());
        state.functions.insert(handle, Function { module, entry });
        Ok(handle)
    }

    fn module_global(&self, module: ModuleHandle, name: &str) -> Result<(DevicePtr, usize), DriverError> {
        let state = self.lock();
        let module = state.modules.get(&module).ok_or(DriverError::InvalidHandle)?;
        module
            .globals
            .get(name)
            .copied()
            .ok_or_else(|| DriverError::NotFound(name.to_string()))
    }

    fn function_max_threads(&self, func: FunctionHandle) -> Result<u32, DriverError> {
        let state = self.lock();
        let function = state.functions.get(&func).ok_or(DriverError::InvalidHandle)?;
        let module = state.modules.get(&function.module).ok_or(DriverError::InvalidHandle)?;
        Ok(module.entries[function.entry].workgroup.iter().product())
    }

    fn occupancy(&self, func: FunctionHandle) -> Result<Occupancy, DriverError> {
        let block_size = self.function_max_threads(func)?;
        Ok(Occupancy {
            min_grid_blocks: 1,
            block_size,
        })
    }

    fn launch(&self, func: FunctionHandle, grid: Dim3, block: Dim3, args: &[KernelArg]) -> Result<(), DriverError> {
        let (slots, pointers) = pack_args(args)?;

        let mut guard = self.lock();
        let state = &mut *guard;
        let current = state.current()?;
        let ctx = state.contexts.get(&current).ok_or(DriverError::InvalidContext)?;
        let function = state.functions.get(&func).ok_or(DriverError::InvalidHandle)?;
        let module = state.modules.get(&function.module).ok_or(DriverError::InvalidHandle)?;
        let entry = &module.entries[function.entry];
        let workgroup = Dim3 {
            x: entry.workgroup[0],
            y: entry.workgroup[1],
            z: entry.workgroup[2],
        };
        if block.volume() != workgroup.volume() {
            return Err(DriverError::LaunchFailed(format!(
                "{}: block {block:?} does not match workgroup {workgroup:?}",
                entry.name
            )));
        }

        let pipeline = &*state
            .pipelines
            .entry((func, pointers))
            .or_insert_with(|| build_pipeline(ctx, module, entry, pointers));

        let uniform = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("lumen args"),
            size: (MAX_ARGS * 16) as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        ctx.queue.write_buffer(&uniform, 0, bytemuck::cast_slice(&slots));

        // Absent pointers still need a buffer behind their binding.
        let placeholder = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("lumen null"),
            size: 4,
            usage: wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        });

        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: uniform.as_entire_binding(),
        }];
        for (i, arg) in args.iter().enumerate() {
            if let KernelArg::Ptr(ptr) = arg {
                let buffer = match ptr {
                    Some(ptr) => {
                        let (id, _) = split_ptr(*ptr);
                        &state.buffers.get(&id).ok_or(DriverError::InvalidHandle)?.buffer
                    }
                    None => &placeholder,
                };
                entries.push(wgpu::BindGroupEntry {
                    binding: 1 + i as u32,
                    resource: buffer.as_entire_binding(),
                });
            }
        }
        let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("lumen launch"),
            layout: &pipeline.layout,
            entries: &entries,
        });

        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("lumen launch") });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(entry.name.as_str()),
                timestamp_writes: None,
            });
            pass.set_pipeline(&pipeline.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(grid.x, grid.y, grid.z);
        }
        ctx.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn array_create(&self, _desc: &ArrayDesc) -> Result<ArrayHandle, DriverError> {
        Err(DriverError::NotSupported("texture arrays"))
    }

    fn array_upload(&self, _array: ArrayHandle, _src: &[u8]) -> Result<(), DriverError> {
        Err(DriverError::NotSupported("texture arrays"))
    }

    fn array_destroy(&self, _array: ArrayHandle) -> Result<(), DriverError> {
        Err(DriverError::NotSupported("texture arrays"))
    }

    fn texture_object_create(&self, _array: ArrayHandle, _sampling: Sampling) -> Result<TextureObject, DriverError> {
        Err(DriverError::NotSupported("texture objects"))
    }

    fn texture_object_destroy(&self, _tex: TextureObject) -> Result<(), DriverError> {
        Err(DriverError::NotSupported("texture objects"))
    }

    fn texture_ref_bind(
        &self,
        _module: ModuleHandle,
        _name: &str,
        _array: ArrayHandle,
        _sampling: Sampling,
    ) -> Result<(), DriverError> {
        Err(DriverError::NotSupported("texture references"))
    }

    fn graphics_register_buffer(&self, _display_buffer: u32, _bytes: usize) -> Result<GraphicsResource, DriverError> {
        Err(DriverError::InteropUnavailable)
    }

    fn graphics_map(&self, _res: GraphicsResource) -> Result<DevicePtr, DriverError> {
        Err(DriverError::InteropUnavailable)
    }

    fn graphics_unmap(&self, _res: GraphicsResource) -> Result<(), DriverError> {
        Err(DriverError::InteropUnavailable)
    }

    fn graphics_unregister(&self, _res: GraphicsResource) -> Result<(), DriverError> {
        Err(DriverError::InteropUnavailable)
    }
}

fn build_pipeline(ctx: &Context, module: &Module, entry: &Entry, pointers: u32) -> Pipeline {
    let mut layout_entries = vec![wgpu::BindGroupLayoutEntry {
        binding: 0,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }];
    for i in (0..MAX_ARGS as u32).filter(|i| pointers & (1 << i) != 0) {
        layout_entries.push(wgpu::BindGroupLayoutEntry {
            binding: 1 + i,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only: false },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        });
    }

    let layout = ctx.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("lumen args layout"),
        entries: &layout_entries,
    });
    let pipeline_layout = ctx.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("lumen pipeline layout"),
        bind_group_layouts: &[&layout],
        immediate_size: 0,
    });
    let pipeline = ctx.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(entry.name.as_str()),
        layout: Some(&pipeline_layout),
        module: &module.shader,
        entry_point: Some(entry.name.as_str()),
        compilation_options: Default::default(),
        cache: None,
    });

    Pipeline { layout, pipeline }
}
