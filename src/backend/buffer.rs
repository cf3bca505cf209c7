// Buffer utilities for vertex, index, uniform and staging buffers
//
// Memory comes from gpu-allocator; the buffer owns its allocation and
// returns it on drop.

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::Pod;
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::MemoryLocation;
use std::sync::Arc;
use super::VulkanDevice;

/// A `vk::Buffer` bound to its own allocation
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub size: vk::DeviceSize,
    allocation: Option<Allocation>,
    device: Arc<VulkanDevice>,
}

impl GpuBuffer {
    /// Create a buffer with the given usage in the given memory location
    pub fn new(
        device: &Arc<VulkanDevice>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            device.device.create_buffer(&buffer_info, None)
                .with_context(|| format!("Failed to create buffer {}", name))?
        };

        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let allocation = match device.allocate(name, requirements, location, true) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        if let Err(e) = unsafe {
            device
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            device.free(allocation);
            unsafe { device.device.destroy_buffer(buffer, None) };
            return Err(e).context("Failed to bind buffer memory");
        }

        Ok(Self {
            buffer,
            size,
            allocation: Some(allocation),
            device: device.clone(),
        })
    }

    /// Create a host-visible buffer and fill it with data
    pub fn with_data<T: Pod>(
        device: &Arc<VulkanDevice>,
        usage: vk::BufferUsageFlags,
        data: &[T],
        name: &str,
    ) -> Result<Self> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let mut buffer = Self::new(
            device,
            bytes.len().max(1) as vk::DeviceSize,
            usage,
            MemoryLocation::CpuToGpu,
            name,
        )?;
        buffer.write(data)?;
        Ok(buffer)
    }

    /// Transient upload source for image copies
    pub fn staging(device: &Arc<VulkanDevice>, bytes: &[u8]) -> Result<Self> {
        Self::with_data(device, vk::BufferUsageFlags::TRANSFER_SRC, bytes, "staging")
    }

    /// Copy data into the start of a mapped buffer
    pub fn write<T: Pod>(&mut self, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if bytes.len() as vk::DeviceSize > self.size {
            anyhow::bail!(
                "Write of {} bytes exceeds buffer size {}",
                bytes.len(),
                self.size
            );
        }

        let mapped = self
            .allocation
            .as_mut()
            .and_then(|a| a.mapped_slice_mut())
            .context("Buffer is not host visible")?;
        mapped[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_buffer(self.buffer, None);
        }
        if let Some(allocation) = self.allocation.take() {
            self.device.free(allocation);
        }
    }
}
