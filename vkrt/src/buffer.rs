//! Device allocations with a linear device address.
//!
//! Every buffer the ray tracing core touches (geometry inputs, acceleration structure storage,
//! scratch memory, instance arrays, shader binding table regions, uniform buffers) is created
//! through [`Buffer`]. A buffer owns both its `VkBuffer` and the `VkDeviceMemory` bound to it,
//! and releases them together when dropped.
//!
//! Host access goes through [`Buffer::map`] and [`Buffer::write`]. Only host-visible,
//! host-coherent memory can be mapped, so writes are visible to the device without an explicit
//! flush.

use crate::{
    device::{Device, DeviceOwned, RawBuffer},
    DeviceAddress, DeviceSize, NonExhaustive, Validated, ValidationError, VulkanError,
    VulkanObject,
};
use ash::vk;
pub use ash::vk::{BufferUsageFlags as BufferUsage, MemoryPropertyFlags};
use parking_lot::Mutex;
use std::{fmt::Debug, ptr::NonNull, sync::Arc};

/// Parameters to create a new [`Buffer`].
#[derive(Clone, Debug)]
pub struct BufferCreateInfo {
    /// The size in bytes of the buffer.
    ///
    /// The default value is `0`, which must be overridden.
    pub size: DeviceSize,

    /// How the buffer is going to be used.
    ///
    /// The default value is empty, which must be overridden.
    pub usage: BufferUsage,

    /// The properties the memory backing the buffer must have.
    ///
    /// The default value is `DEVICE_LOCAL`.
    pub memory_properties: MemoryPropertyFlags,

    pub _ne: NonExhaustive,
}

impl Default for BufferCreateInfo {
    #[inline]
    fn default() -> Self {
        Self {
            size: 0,
            usage: BufferUsage::empty(),
            memory_properties: MemoryPropertyFlags::DEVICE_LOCAL,
            _ne: NonExhaustive(()),
        }
    }
}

impl BufferCreateInfo {
    /// Returns a `BufferCreateInfo` for host-visible, host-coherent memory, which can be written
    /// through [`Buffer::write`].
    #[inline]
    pub fn host_visible(size: DeviceSize, usage: BufferUsage) -> Self {
        Self {
            size,
            usage,
            memory_properties: MemoryPropertyFlags::HOST_VISIBLE
                | MemoryPropertyFlags::HOST_COHERENT,
            ..Default::default()
        }
    }

    /// Returns a `BufferCreateInfo` for device-local memory.
    #[inline]
    pub fn device_local(size: DeviceSize, usage: BufferUsage) -> Self {
        Self {
            size,
            usage,
            ..Default::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<(), Box<ValidationError>> {
        if self.size == 0 {
            return Err(Box::new(ValidationError {
                context: "size".into(),
                problem: "is zero".into(),
                vuids: &["VUID-VkBufferCreateInfo-size-00912"],
            }));
        }

        if self.usage.is_empty() {
            return Err(Box::new(ValidationError {
                context: "usage".into(),
                problem: "is empty".into(),
                vuids: &["VUID-VkBufferCreateInfo-usage-requiredbitmask"],
            }));
        }

        Ok(())
    }
}

/// A buffer and the memory bound to it.
#[derive(Debug)]
pub struct Buffer {
    raw: RawBuffer,
    device: Arc<dyn Device>,

    size: DeviceSize,
    usage: BufferUsage,
    memory_properties: MemoryPropertyFlags,
    device_address: Option<DeviceAddress>,
    mapped: Mutex<Option<NonNull<u8>>>,
}

impl Buffer {
    /// Creates a new `Buffer` and allocates memory for it.
    ///
    /// If `usage` contains `SHADER_DEVICE_ADDRESS`, the device address is queried right away and
    /// cached.
    pub fn new(
        device: Arc<dyn Device>,
        create_info: BufferCreateInfo,
    ) -> Result<Buffer, Validated<VulkanError>> {
        create_info
            .validate()
            .map_err(|err| err.add_context("create_info"))?;

        let raw = unsafe { device.create_buffer(&create_info) }?;
        let device_address = create_info
            .usage
            .contains(BufferUsage::SHADER_DEVICE_ADDRESS)
            .then(|| unsafe { device.buffer_device_address(raw.handle) });

        let BufferCreateInfo {
            size,
            usage,
            memory_properties,
            _ne: _,
        } = create_info;

        Ok(Buffer {
            raw,
            device,
            size,
            usage,
            memory_properties,
            device_address,
            mapped: Mutex::new(None),
        })
    }

    /// Creates a host-visible buffer holding a copy of `data`.
    ///
    /// The buffer stays mapped, so it can be written again later.
    pub fn from_slice<T>(
        device: Arc<dyn Device>,
        usage: BufferUsage,
        data: &[T],
    ) -> Result<Buffer, Validated<VulkanError>>
    where
        T: bytemuck::Pod,
    {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let buffer = Buffer::new(
            device,
            BufferCreateInfo::host_visible(bytes.len() as DeviceSize, usage),
        )?;
        buffer.map()?;
        buffer.write(0, bytes)?;

        Ok(buffer)
    }

    /// Returns the size in bytes of the buffer.
    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.size
    }

    /// Returns the usage the buffer was created with.
    #[inline]
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    /// Returns the properties of the memory backing the buffer.
    #[inline]
    pub fn memory_properties(&self) -> MemoryPropertyFlags {
        self.memory_properties
    }

    /// Returns the device address of the buffer.
    pub fn device_address(&self) -> Result<DeviceAddress, Box<ValidationError>> {
        self.device_address.ok_or_else(|| {
            Box::new(ValidationError {
                context: "self.usage()".into(),
                problem: "does not contain `BufferUsage::SHADER_DEVICE_ADDRESS`".into(),
                vuids: &["VUID-vkGetBufferDeviceAddress-bufferDeviceAddress-03324"],
            })
        })
    }

    /// Returns whether the memory of the buffer is host-visible and host-coherent, so that
    /// [`map`](Self::map) can succeed.
    #[inline]
    pub fn is_mappable(&self) -> bool {
        self.memory_properties
            .contains(MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT)
    }

    /// Returns whether the memory of the buffer is currently mapped.
    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.mapped.lock().is_some()
    }

    /// Maps the whole memory of the buffer into host address space. Does nothing if it is
    /// already mapped.
    pub fn map(&self) -> Result<(), Validated<VulkanError>> {
        if !self.is_mappable() {
            return Err(Box::new(ValidationError {
                context: "self.memory_properties()".into(),
                problem: "does not contain both `MemoryPropertyFlags::HOST_VISIBLE` and \
                    `MemoryPropertyFlags::HOST_COHERENT`"
                    .into(),
                vuids: &["VUID-vkMapMemory-memory-00682"],
            })
            .into());
        }

        let mut mapped = self.mapped.lock();

        if mapped.is_none() {
            *mapped = Some(unsafe { self.device.map_memory(self.raw.memory, self.size) }?);
        }

        Ok(())
    }

    /// Unmaps the memory of the buffer. Does nothing if it is not mapped.
    pub fn unmap(&self) {
        if self.mapped.lock().take().is_some() {
            unsafe { self.device.unmap_memory(self.raw.memory) };
        }
    }

    /// Copies `data` into the mapped memory, starting `offset` bytes into the buffer.
    pub fn write(&self, offset: DeviceSize, data: &[u8]) -> Result<(), Box<ValidationError>> {
        let mapped = self.mapped.lock();

        let Some(ptr) = *mapped else {
            return Err(Box::new(ValidationError {
                problem: "the memory of the buffer is not mapped".into(),
                ..Default::default()
            }));
        };

        let end = offset.checked_add(data.len() as DeviceSize);
        if end.is_none_or(|end| end > self.size) {
            return Err(Box::new(ValidationError {
                context: "offset".into(),
                problem: format!(
                    "plus the length of the data ({}) is greater than the size of the buffer ({})",
                    data.len(),
                    self.size,
                )
                .into(),
                ..Default::default()
            }));
        }

        // SAFETY: The range was checked against the size of the mapping above, and the mapping
        // stays alive while the lock is held.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                ptr.as_ptr().add(offset as usize),
                data.len(),
            );
        }

        Ok(())
    }

    /// Returns a descriptor write covering the whole buffer.
    #[inline]
    pub fn descriptor_info(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: self.raw.handle,
            offset: 0,
            range: self.size,
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe {
            if self.mapped.get_mut().take().is_some() {
                self.device.unmap_memory(self.raw.memory);
            }

            self.device.destroy_buffer(self.raw);
        }
    }
}

unsafe impl VulkanObject for Buffer {
    type Handle = vk::Buffer;

    #[inline]
    fn handle(&self) -> Self::Handle {
        self.raw.handle
    }
}

unsafe impl DeviceOwned for Buffer {
    #[inline]
    fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }
}

// The mapped pointer is only dereferenced while `mapped` is locked.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}
