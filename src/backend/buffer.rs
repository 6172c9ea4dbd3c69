// Typed GPU buffers backed by gpu-allocator
//
// Buffer kind decides usage flags and memory residency: staging and uniform
// buffers live in host-visible, persistently mapped memory; vertex and
// index buffers are device-local and filled through a staging copy.
//
// The allocator is a capability object created after the device context and
// destroyed before it; buffers free themselves on drop through it.

use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::sync::Arc;

use super::DeviceContext;
use crate::error::{RenderError, RenderResult};

/// The closed set of buffer roles. Adding a kind is a one-place change:
/// the match arms below are checked exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    Staging,
    Vertex,
    Index,
    Uniform,
}

impl BufferKind {
    /// Usage flags for this kind. Device-local kinds carry TRANSFER_SRC as
    /// well so their contents can be read back through a staging buffer.
    pub fn usage(self) -> vk::BufferUsageFlags {
        match self {
            BufferKind::Staging => {
                vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST
            }
            BufferKind::Vertex => {
                vk::BufferUsageFlags::VERTEX_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_DST
                    | vk::BufferUsageFlags::TRANSFER_SRC
            }
            BufferKind::Index => {
                vk::BufferUsageFlags::INDEX_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_DST
                    | vk::BufferUsageFlags::TRANSFER_SRC
            }
            BufferKind::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
        }
    }

    pub fn location(self) -> MemoryLocation {
        match self {
            BufferKind::Staging | BufferKind::Uniform => MemoryLocation::CpuToGpu,
            BufferKind::Vertex | BufferKind::Index => MemoryLocation::GpuOnly,
        }
    }

    pub fn host_visible(self) -> bool {
        matches!(self, BufferKind::Staging | BufferKind::Uniform)
    }

    fn label(self) -> &'static str {
        match self {
            BufferKind::Staging => "staging",
            BufferKind::Vertex => "vertex",
            BufferKind::Index => "index",
            BufferKind::Uniform => "uniform",
        }
    }
}

/// Capability object wrapping the gpu-allocator instance.
///
/// Holds an `Arc<DeviceContext>` so the device outlives every allocation.
pub struct BufferAllocator {
    device: Arc<DeviceContext>,
    allocator: Mutex<Allocator>,
}

impl BufferAllocator {
    pub fn new(device: Arc<DeviceContext>) -> RenderResult<Arc<Self>> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: device.instance.clone(),
            device: device.device.clone(),
            physical_device: device.physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })?;

        Ok(Arc::new(Self {
            device,
            allocator: Mutex::new(allocator),
        }))
    }

    /// Allocate a buffer of `byte_size` bytes holding `element_count`
    /// elements, with usage and residency decided by `kind`.
    pub fn create_buffer(
        self: &Arc<Self>,
        kind: BufferKind,
        byte_size: vk::DeviceSize,
        element_count: u32,
    ) -> RenderResult<GpuBuffer> {
        if byte_size == 0 {
            return Err(RenderError::BufferMisuse(
                "cannot create a zero-sized buffer".to_string(),
            ));
        }

        let buffer_info = vk::BufferCreateInfo::default()
            .size(byte_size)
            .usage(kind.usage())
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.device.create_buffer(&buffer_info, None) }?;
        let requirements =
            unsafe { self.device.device.get_buffer_memory_requirements(buffer) };

        let allocation = self.allocator.lock().allocate(&AllocationCreateDesc {
            name: kind.label(),
            requirements,
            location: kind.location(),
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.device.destroy_buffer(buffer, None) };
                return Err(e.into());
            }
        };

        if let Err(e) = unsafe {
            self.device.device.bind_buffer_memory(
                buffer,
                allocation.memory(),
                allocation.offset(),
            )
        } {
            let _ = self.allocator.lock().free(allocation);
            unsafe { self.device.device.destroy_buffer(buffer, None) };
            return Err(e.into());
        }

        log::debug!("Created {} buffer, {} bytes", kind.label(), byte_size);

        Ok(GpuBuffer {
            buffer,
            allocation: Some(allocation),
            size: byte_size,
            element_count,
            kind,
            allocator: self.clone(),
        })
    }

    fn release(&self, buffer: vk::Buffer, allocation: Allocation) {
        if let Err(e) = self.allocator.lock().free(allocation) {
            log::error!("Failed to free buffer allocation: {e}");
        }
        unsafe { self.device.device.destroy_buffer(buffer, None) };
    }
}

/// An owned GPU buffer: handle, backing allocation, byte size, element
/// count, and kind. Freed automatically on drop.
pub struct GpuBuffer {
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: vk::DeviceSize,
    element_count: u32,
    kind: BufferKind,
    allocator: Arc<BufferAllocator>,
}

impl GpuBuffer {
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn element_count(&self) -> u32 {
        self.element_count
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    /// Write `data` into a mapped host-visible buffer at `offset`.
    ///
    /// Fails with a misuse error, writing nothing, if the buffer is not
    /// host-visible or the write would run past its capacity.
    pub fn write(&mut self, data: &[u8], offset: vk::DeviceSize) -> RenderResult<()> {
        if !self.kind.host_visible() {
            return Err(RenderError::BufferMisuse(format!(
                "cannot map a {} buffer for writing",
                self.kind.label()
            )));
        }
        check_write_bounds(offset, data.len(), self.size)?;

        let allocation = self.allocation.as_mut().ok_or_else(|| {
            RenderError::BufferMisuse("buffer has no backing allocation".to_string())
        })?;
        let mapped = allocation.mapped_slice_mut().ok_or_else(|| {
            RenderError::BufferMisuse("buffer memory is not mapped".to_string())
        })?;

        let start = offset as usize;
        mapped[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Read back the mapped contents of a host-visible buffer.
    pub fn mapped_bytes(&self) -> RenderResult<&[u8]> {
        if !self.kind.host_visible() {
            return Err(RenderError::BufferMisuse(format!(
                "cannot map a {} buffer for reading",
                self.kind.label()
            )));
        }
        let allocation = self.allocation.as_ref().ok_or_else(|| {
            RenderError::BufferMisuse("buffer has no backing allocation".to_string())
        })?;
        let mapped = allocation.mapped_slice().ok_or_else(|| {
            RenderError::BufferMisuse("buffer memory is not mapped".to_string())
        })?;
        // The allocation may be padded past the requested size
        Ok(&mapped[..self.size as usize])
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            self.allocator.release(self.buffer, allocation);
        }
    }
}

fn check_write_bounds(
    offset: vk::DeviceSize,
    len: usize,
    capacity: vk::DeviceSize,
) -> RenderResult<()> {
    let end = offset.checked_add(len as vk::DeviceSize).ok_or_else(|| {
        RenderError::BufferMisuse(format!("write range overflows: offset {offset} + {len}"))
    })?;
    if end > capacity {
        return Err(RenderError::BufferMisuse(format!(
            "write of {len} bytes at offset {offset} exceeds buffer capacity {capacity}"
        )));
    }
    Ok(())
}

/// Copy `src` into `dst` with a one-time command buffer, synchronously.
///
/// Requires equal byte sizes. Stalls the graphics queue until the copy
/// completes, so this belongs on the upload path, never in the frame loop.
pub fn copy_buffer(
    device: &DeviceContext,
    command_pool: vk::CommandPool,
    src: &GpuBuffer,
    dst: &GpuBuffer,
) -> RenderResult<()> {
    if src.size() != dst.size() {
        return Err(RenderError::BufferMisuse(format!(
            "copy between buffers of different sizes: {} != {}",
            src.size(),
            dst.size()
        )));
    }

    let alloc_info = vk::CommandBufferAllocateInfo::default()
        .command_pool(command_pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);

    let command_buffer = unsafe { device.device.allocate_command_buffers(&alloc_info) }?[0];

    let result = (|| -> RenderResult<()> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            device.device.begin_command_buffer(command_buffer, &begin_info)?;
            let region = vk::BufferCopy::default().size(src.size());
            device
                .device
                .cmd_copy_buffer(command_buffer, src.handle(), dst.handle(), &[region]);
            device.device.end_command_buffer(command_buffer)?;

            let command_buffers = [command_buffer];
            let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
            device.device.queue_submit(
                device.graphics_queue,
                &[submit_info],
                vk::Fence::null(),
            )?;
            device.device.queue_wait_idle(device.graphics_queue)?;
        }
        Ok(())
    })();

    unsafe {
        device
            .device
            .free_command_buffers(command_pool, &[command_buffer]);
    }

    result
}

/// Upload `bytes` into a fresh device-local buffer of the given kind by
/// staging: create a staging buffer, write it, copy across, drop it.
pub fn upload_to_device_local(
    allocator: &Arc<BufferAllocator>,
    device: &DeviceContext,
    command_pool: vk::CommandPool,
    kind: BufferKind,
    bytes: &[u8],
    element_count: u32,
) -> RenderResult<GpuBuffer> {
    let size = bytes.len() as vk::DeviceSize;

    let mut staging = allocator.create_buffer(BufferKind::Staging, size, element_count)?;
    staging.write(bytes, 0)?;

    let dst = allocator.create_buffer(kind, size, element_count)?;
    copy_buffer(device, command_pool, &staging, &dst)?;

    log::info!(
        "Uploaded {} bytes ({} elements) to a {} buffer",
        size,
        element_count,
        kind.label()
    );

    Ok(dst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_table_matches_residency_policy() {
        assert!(BufferKind::Staging
            .usage()
            .contains(vk::BufferUsageFlags::TRANSFER_SRC));
        assert_eq!(BufferKind::Staging.location(), MemoryLocation::CpuToGpu);
        assert!(BufferKind::Staging.host_visible());

        assert!(BufferKind::Vertex
            .usage()
            .contains(vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST));
        assert_eq!(BufferKind::Vertex.location(), MemoryLocation::GpuOnly);
        assert!(!BufferKind::Vertex.host_visible());

        assert!(BufferKind::Index
            .usage()
            .contains(vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST));
        assert_eq!(BufferKind::Index.location(), MemoryLocation::GpuOnly);
        assert!(!BufferKind::Index.host_visible());

        assert!(BufferKind::Uniform
            .usage()
            .contains(vk::BufferUsageFlags::UNIFORM_BUFFER));
        assert!(BufferKind::Uniform.host_visible());
    }

    #[test]
    fn write_bounds_reject_overrun() {
        assert!(check_write_bounds(0, 16, 16).is_ok());
        assert!(check_write_bounds(8, 8, 16).is_ok());
        assert!(check_write_bounds(8, 9, 16).is_err());
        assert!(check_write_bounds(17, 0, 16).is_err());
        assert!(check_write_bounds(u64::MAX, 1, 16).is_err());
    }

    // GPU-dependent tests below skip when no Vulkan implementation is
    // available (e.g. CI machines without a driver).

    fn gpu_fixture() -> Option<(Arc<DeviceContext>, Arc<BufferAllocator>, vk::CommandPool)> {
        let device = DeviceContext::headless_for_tests()?;
        let allocator = BufferAllocator::new(device.clone()).ok()?;
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(device.graphics_queue_family);
        let pool =
            unsafe { device.device.create_command_pool(&pool_info, None) }.ok()?;
        Some((device, allocator, pool))
    }

    #[test]
    fn staging_write_out_of_bounds_leaves_buffer_untouched() {
        let Some((device, allocator, pool)) = gpu_fixture() else {
            eprintln!("no Vulkan device available, skipping");
            return;
        };

        let mut staging = allocator
            .create_buffer(BufferKind::Staging, 16, 16)
            .unwrap();
        staging.write(&[0xAA; 16], 0).unwrap();

        let err = staging.write(&[0xBB; 8], 12).unwrap_err();
        assert!(matches!(err, RenderError::BufferMisuse(_)));
        assert_eq!(staging.mapped_bytes().unwrap(), &[0xAA; 16]);

        drop(staging);
        unsafe { device.device.destroy_command_pool(pool, None) };
    }

    #[test]
    fn device_local_round_trip_is_byte_identical() {
        let Some((device, allocator, pool)) = gpu_fixture() else {
            eprintln!("no Vulkan device available, skipping");
            return;
        };

        let payload: Vec<u8> = (0..64u8).collect();

        let mut src = allocator
            .create_buffer(BufferKind::Staging, 64, 64)
            .unwrap();
        src.write(&payload, 0).unwrap();

        let gpu_local = allocator.create_buffer(BufferKind::Vertex, 64, 64).unwrap();
        copy_buffer(&device, pool, &src, &gpu_local).unwrap();

        let readback = allocator
            .create_buffer(BufferKind::Staging, 64, 64)
            .unwrap();
        copy_buffer(&device, pool, &gpu_local, &readback).unwrap();

        assert_eq!(readback.mapped_bytes().unwrap(), payload.as_slice());

        drop((src, gpu_local, readback));
        unsafe { device.device.destroy_command_pool(pool, None) };
    }

    #[test]
    fn copy_requires_equal_sizes() {
        let Some((device, allocator, pool)) = gpu_fixture() else {
            eprintln!("no Vulkan device available, skipping");
            return;
        };

        let small = allocator.create_buffer(BufferKind::Staging, 16, 16).unwrap();
        let large = allocator.create_buffer(BufferKind::Vertex, 32, 32).unwrap();
        let err = copy_buffer(&device, pool, &small, &large).unwrap_err();
        assert!(matches!(err, RenderError::BufferMisuse(_)));

        drop((small, large));
        unsafe { device.device.destroy_command_pool(pool, None) };
    }
}
