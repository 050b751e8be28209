#![cfg(test)]

//! A host-side [`Device`] for unit tests, and helpers around it.
//!
//! The mock keeps every object it hands out in a table and checks the calls made on them: using
//! a destroyed object, destroying a buffer that still backs an acceleration structure, or
//! building a top-level structure over unbuilt bottom-level ones all panic. Buffer memory is
//! real host memory, so mapped writes can be read back through device addresses.

use crate::{
    acceleration_structure::{AccelerationStructureInstance, Mesh, Vertex},
    buffer::{BufferCreateInfo, BufferUsage, MemoryPropertyFlags},
    device::{Device, RawBuffer, RayTracingProperties},
    shader::ShaderModule,
    DeviceAddress, DeviceSize, VulkanError, VulkanObject,
};
use ash::vk::{self, Handle};
use foldhash::{HashMap, HashSet};
use parking_lot::Mutex;
use std::{
    ffi::{CStr, CString},
    fmt::{Debug, Error as FmtError, Formatter},
    mem::size_of,
    ptr::NonNull,
    slice,
    sync::Arc,
};

/// Creates a [`MockDevice`], returning it along with the same object as `Arc<dyn Device>`.
macro_rules! mock_device {
    () => {
        mock_device!(properties: $crate::tests::MockDevice::DEFAULT_PROPERTIES)
    };
    (max_ray_recursion_depth: $depth:expr) => {
        mock_device!(properties: $crate::device::RayTracingProperties {
            max_ray_recursion_depth: $depth,
            ..$crate::tests::MockDevice::DEFAULT_PROPERTIES
        })
    };
    (properties: $properties:expr) => {{
        $crate::tests::init_logging();
        $crate::tests::MockDevice::new($properties)
    }};
}

pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A mesh with a single triangle.
pub(crate) fn triangle_mesh(device: &Arc<dyn Device>) -> Mesh {
    Mesh::new(
        device.clone(),
        vec![
            Vertex::new(1.0, 1.0, 0.0),
            Vertex::new(-1.0, 1.0, 0.0),
            Vertex::new(0.0, -1.0, 0.0),
        ],
        vec![0, 1, 2],
    )
    .unwrap()
}

/// Raygen, miss and closest-hit modules, in that order.
pub(crate) fn shader_modules(device: &Arc<dyn Device>) -> [Arc<ShaderModule>; 3] {
    [0, 1, 2].map(|index| {
        ShaderModule::from_words(device.clone(), &[0x0723_0203, 0x0001_0600, 0, index, 0])
            .unwrap()
    })
}

/// A device entry point that can be made to fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MockCall {
    CreateBuffer,
    MapMemory,
    CreateAccelerationStructure,
    BeginSingleTimeCommands,
    EndSingleTimeCommands,
    CreateShaderModule,
    CreateDescriptorSetLayout,
    CreatePipelineLayout,
    CreateRayTracingPipeline,
    ShaderGroupHandles,
    CreateDescriptorPool,
    AllocateDescriptorSet,
}

/// Calls whose relative order tests care about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MockEvent {
    BuildSizes(vk::AccelerationStructureTypeKHR),
    /// A one-time submission containing a build of this type completed.
    Submitted(vk::AccelerationStructureTypeKHR),
    UpdateDescriptorSets,
    CreateRayTracingPipeline,
    ShaderGroupHandles,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum MockCommand {
    BindPipeline(vk::Pipeline),
    BindDescriptorSets(vk::PipelineLayout, Vec<vk::DescriptorSet>),
    TraceRays {
        raygen: DeviceAddress,
        miss: DeviceAddress,
        hit: DeviceAddress,
        width: u32,
        height: u32,
        depth: u32,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MockDescriptor {
    AccelerationStructure(vk::AccelerationStructureKHR),
    StorageImage(vk::ImageView),
    UniformBuffer(vk::Buffer),
}

#[derive(Clone, Debug)]
pub(crate) struct MockAccelerationStructure {
    pub(crate) ty: vk::AccelerationStructureTypeKHR,
    pub(crate) buffer: vk::Buffer,
    pub(crate) address: DeviceAddress,
    pub(crate) built: bool,
    pub(crate) build: Option<MockBuild>,
}

/// What the build command of an acceleration structure was recorded with.
#[derive(Clone, Debug)]
pub(crate) struct MockBuild {
    pub(crate) scratch_address: DeviceAddress,
    pub(crate) primitive_count: u32,
    pub(crate) geometry_type: vk::GeometryTypeKHR,
    pub(crate) vertex_address: DeviceAddress,
    pub(crate) max_vertex: u32,
    /// The contents of the instance buffer when the build was recorded.
    pub(crate) instances: Vec<AccelerationStructureInstance>,
}

/// Binding number, type and stages of a descriptor set layout binding.
pub(crate) type MockBinding = (u32, vk::DescriptorType, vk::ShaderStageFlags);

#[derive(Clone, Debug)]
pub(crate) struct MockPipeline {
    pub(crate) stages: Vec<(vk::ShaderStageFlags, CString)>,
    /// Type, general, closest hit, any hit and intersection shader of each group.
    pub(crate) groups: Vec<(vk::RayTracingShaderGroupTypeKHR, u32, u32, u32, u32)>,
    pub(crate) layout: vk::PipelineLayout,
    pub(crate) max_recursion_depth: u32,
}

struct MockBuffer {
    memory: vk::DeviceMemory,
    usage: BufferUsage,
    memory_properties: MemoryPropertyFlags,
    address: DeviceAddress,
    data: Box<[u8]>,
}

struct MockDescriptorSet {
    pool: vk::DescriptorPool,
    descriptors: HashMap<u32, MockDescriptor>,
}

struct State {
    next_handle: u64,
    next_buffer_address: DeviceAddress,
    next_acceleration_structure_address: DeviceAddress,
    failures: Vec<(MockCall, usize, VulkanError)>,
    events: Vec<MockEvent>,

    buffers: HashMap<vk::Buffer, MockBuffer>,
    mapped: HashSet<vk::DeviceMemory>,
    acceleration_structures: HashMap<vk::AccelerationStructureKHR, MockAccelerationStructure>,
    pending_builds: HashMap<vk::CommandBuffer, Vec<(vk::AccelerationStructureKHR, MockBuild)>>,
    commands: HashMap<vk::CommandBuffer, Vec<MockCommand>>,
    shader_modules: HashMap<vk::ShaderModule, Vec<u32>>,
    set_layouts: HashMap<vk::DescriptorSetLayout, Vec<MockBinding>>,
    pipeline_layouts: HashMap<vk::PipelineLayout, Vec<vk::DescriptorSetLayout>>,
    pipelines: HashMap<vk::Pipeline, MockPipeline>,
    descriptor_pools: HashMap<vk::DescriptorPool, u32>,
    last_pool_max_sets: Option<u32>,
    descriptor_sets: HashMap<vk::DescriptorSet, MockDescriptorSet>,
}

impl State {
    fn next_handle<T: Handle>(&mut self) -> T {
        self.next_handle += 1;
        T::from_raw(self.next_handle)
    }

    fn check(&mut self, call: MockCall) -> Result<(), VulkanError> {
        let mut triggered = None;

        for (index, (failing_call, countdown, err)) in self.failures.iter_mut().enumerate() {
            if *failing_call != call {
                continue;
            }

            if *countdown == 0 {
                triggered = Some((index, *err));
                break;
            }

            *countdown -= 1;
        }

        match triggered {
            Some((index, err)) => {
                self.failures.remove(index);
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn buffer_at(&self, address: DeviceAddress) -> (&MockBuffer, usize) {
        self.buffers
            .values()
            .find(|buffer| {
                address >= buffer.address
                    && address < buffer.address + buffer.data.len() as DeviceAddress
            })
            .map(|buffer| (buffer, (address - buffer.address) as usize))
            .unwrap_or_else(|| panic!("no live buffer contains address {address:#x}"))
    }

    fn read(&self, address: DeviceAddress, len: usize) -> Vec<u8> {
        let (buffer, offset) = self.buffer_at(address);
        assert!(
            offset + len <= buffer.data.len(),
            "read past the end of a buffer",
        );

        buffer.data[offset..offset + len].to_vec()
    }

    fn read_instances(
        &self,
        address: DeviceAddress,
        count: u32,
    ) -> Vec<AccelerationStructureInstance> {
        if count == 0 {
            return Vec::new();
        }

        let stride = size_of::<AccelerationStructureInstance>();
        self.read(address, count as usize * stride)
            .chunks_exact(stride)
            .map(bytemuck::pod_read_unaligned)
            .collect()
    }
}

/// Sizes reported for a build over `primitive_count` primitives.
fn build_sizes(primitive_count: u32) -> (DeviceSize, DeviceSize) {
    (
        256 + 64 * primitive_count as DeviceSize,
        128 + 32 * primitive_count as DeviceSize,
    )
}

pub(crate) struct MockDevice {
    properties: RayTracingProperties,
    state: Mutex<State>,
}

impl MockDevice {
    pub(crate) const DEFAULT_PROPERTIES: RayTracingProperties = RayTracingProperties {
        shader_group_handle_size: 32,
        shader_group_handle_alignment: 32,
        shader_group_base_alignment: 64,
        max_ray_recursion_depth: 1,
        min_acceleration_structure_scratch_offset_alignment: 128,
    };

    pub(crate) fn new(properties: RayTracingProperties) -> (Arc<MockDevice>, Arc<dyn Device>) {
        let mock = Arc::new(MockDevice {
            properties,
            state: Mutex::new(State {
                next_handle: 0,
                next_buffer_address: 0x1_0000,
                next_acceleration_structure_address: 0x8000_0000_0000,
                failures: Vec::new(),
                events: Vec::new(),
                buffers: HashMap::default(),
                mapped: HashSet::default(),
                acceleration_structures: HashMap::default(),
                pending_builds: HashMap::default(),
                commands: HashMap::default(),
                shader_modules: HashMap::default(),
                set_layouts: HashMap::default(),
                pipeline_layouts: HashMap::default(),
                pipelines: HashMap::default(),
                descriptor_pools: HashMap::default(),
                last_pool_max_sets: None,
                descriptor_sets: HashMap::default(),
            }),
        });
        let device: Arc<dyn Device> = mock.clone();

        (mock, device)
    }

    pub(crate) fn properties(&self) -> RayTracingProperties {
        self.properties
    }

    /// Makes the next call to `call` fail with `err`.
    pub(crate) fn fail_next(&self, call: MockCall, err: VulkanError) {
        self.fail_nth(call, 0, err);
    }

    /// Lets `n` calls to `call` succeed, then makes the following one fail with `err`.
    pub(crate) fn fail_nth(&self, call: MockCall, n: usize, err: VulkanError) {
        self.state.lock().failures.push((call, n, err));
    }

    pub(crate) fn events(&self) -> Vec<MockEvent> {
        self.state.lock().events.clone()
    }

    pub(crate) fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    /// Counts every object that has been created and not yet destroyed.
    pub(crate) fn live_objects(&self) -> usize {
        let state = self.state.lock();

        state.buffers.len()
            + state.acceleration_structures.len()
            + state.shader_modules.len()
            + state.set_layouts.len()
            + state.pipeline_layouts.len()
            + state.pipelines.len()
            + state.descriptor_pools.len()
    }

    pub(crate) fn live_acceleration_structures(&self) -> usize {
        self.state.lock().acceleration_structures.len()
    }

    pub(crate) fn live_pipelines(&self) -> usize {
        self.state.lock().pipelines.len()
    }

    pub(crate) fn mapped_count(&self) -> usize {
        self.state.lock().mapped.len()
    }

    pub(crate) fn buffer_contents(&self, buffer: vk::Buffer) -> Vec<u8> {
        self.state.lock().buffers[&buffer].data.to_vec()
    }

    pub(crate) fn read_device_memory(&self, address: DeviceAddress, len: usize) -> Vec<u8> {
        self.state.lock().read(address, len)
    }

    pub(crate) fn acceleration_structure(
        &self,
        handle: vk::AccelerationStructureKHR,
    ) -> MockAccelerationStructure {
        self.state.lock().acceleration_structures[&handle].clone()
    }

    pub(crate) fn shader_module_code(&self, module: &ShaderModule) -> Vec<u32> {
        self.state.lock().shader_modules[&module.handle()].clone()
    }

    pub(crate) fn descriptor_set_layout_bindings(
        &self,
        set_layout: vk::DescriptorSetLayout,
    ) -> Vec<MockBinding> {
        self.state.lock().set_layouts[&set_layout].clone()
    }

    pub(crate) fn pipeline_layout_set_layouts(
        &self,
        pipeline_layout: vk::PipelineLayout,
    ) -> Vec<vk::DescriptorSetLayout> {
        self.state.lock().pipeline_layouts[&pipeline_layout].clone()
    }

    pub(crate) fn pipeline(&self, pipeline: vk::Pipeline) -> MockPipeline {
        self.state.lock().pipelines[&pipeline].clone()
    }

    pub(crate) fn descriptors(&self, set: vk::DescriptorSet) -> HashMap<u32, MockDescriptor> {
        self.state.lock().descriptor_sets[&set].descriptors.clone()
    }

    /// Returns `maxSets` of the most recently created descriptor pool.
    pub(crate) fn descriptor_pool_max_sets(&self) -> Option<u32> {
        self.state.lock().last_pool_max_sets
    }

    pub(crate) fn recorded_commands(&self, command_buffer: vk::CommandBuffer) -> Vec<MockCommand> {
        self.state
            .lock()
            .commands
            .get(&command_buffer)
            .cloned()
            .unwrap_or_default()
    }
}

impl Debug for MockDevice {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("MockDevice")
            .field("properties", &self.properties)
            .finish_non_exhaustive()
    }
}

unsafe impl Device for MockDevice {
    fn ray_tracing_properties(&self) -> &RayTracingProperties {
        &self.properties
    }

    unsafe fn create_buffer(
        &self,
        create_info: &BufferCreateInfo,
    ) -> Result<RawBuffer, VulkanError> {
        let mut state = self.state.lock();
        state.check(MockCall::CreateBuffer)?;

        let handle = state.next_handle();
        let memory = state.next_handle();
        // Never aligned to more than 16 bytes, so callers have to align addresses themselves.
        let address = state.next_buffer_address + 0x10;
        state.next_buffer_address += (create_info.size + 0x10).next_multiple_of(0x1000) + 0x1000;

        state.buffers.insert(
            handle,
            MockBuffer {
                memory,
                usage: create_info.usage,
                memory_properties: create_info.memory_properties,
                address,
                data: vec![0; create_info.size as usize].into_boxed_slice(),
            },
        );

        Ok(RawBuffer { handle, memory })
    }

    unsafe fn destroy_buffer(&self, buffer: RawBuffer) {
        let mut state = self.state.lock();

        assert!(
            !state.mapped.contains(&buffer.memory),
            "buffer destroyed while mapped",
        );
        assert!(
            state
                .acceleration_structures
                .values()
                .all(|structure| structure.buffer != buffer.handle),
            "buffer destroyed while an acceleration structure lives in it",
        );
        state
            .buffers
            .remove(&buffer.handle)
            .expect("destroyed a buffer that is not alive");
    }

    unsafe fn buffer_device_address(&self, buffer: vk::Buffer) -> DeviceAddress {
        let state = self.state.lock();
        let buffer = &state.buffers[&buffer];
        assert!(buffer.usage.contains(BufferUsage::SHADER_DEVICE_ADDRESS));

        buffer.address
    }

    unsafe fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        size: DeviceSize,
    ) -> Result<NonNull<u8>, VulkanError> {
        let mut state = self.state.lock();
        state.check(MockCall::MapMemory)?;
        assert!(state.mapped.insert(memory), "memory mapped twice");

        let buffer = state
            .buffers
            .values_mut()
            .find(|buffer| buffer.memory == memory)
            .expect("mapped memory that is not alive");
        assert!(buffer
            .memory_properties
            .contains(MemoryPropertyFlags::HOST_VISIBLE));
        assert!(size <= buffer.data.len() as DeviceSize);

        Ok(NonNull::new(buffer.data.as_mut_ptr()).unwrap())
    }

    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory) {
        assert!(
            self.state.lock().mapped.remove(&memory),
            "memory was not mapped",
        );
    }

    unsafe fn acceleration_structure_build_sizes(
        &self,
        build_info: &vk::AccelerationStructureBuildGeometryInfoKHR<'_>,
        max_primitive_counts: &[u32],
    ) -> vk::AccelerationStructureBuildSizesInfoKHR<'static> {
        let mut state = self.state.lock();
        assert_eq!(
            build_info.geometry_count as usize,
            max_primitive_counts.len(),
        );
        state.events.push(MockEvent::BuildSizes(build_info.ty));

        if build_info.ty == vk::AccelerationStructureTypeKHR::TOP_LEVEL {
            let geometry = unsafe { &*build_info.p_geometries };
            let address = unsafe { geometry.geometry.instances.data.device_address };

            for instance in state.read_instances(address, max_primitive_counts[0]) {
                assert!(
                    state.acceleration_structures.values().any(|structure| {
                        structure.address == instance.acceleration_structure_reference
                            && structure.built
                    }),
                    "instance refers to a bottom-level structure that is not built",
                );
            }
        }

        let (size, scratch_size) = build_sizes(max_primitive_counts[0]);

        vk::AccelerationStructureBuildSizesInfoKHR::default()
            .acceleration_structure_size(size)
            .build_scratch_size(scratch_size)
    }

    unsafe fn create_acceleration_structure(
        &self,
        create_info: &vk::AccelerationStructureCreateInfoKHR<'_>,
    ) -> Result<vk::AccelerationStructureKHR, VulkanError> {
        let mut state = self.state.lock();
        state.check(MockCall::CreateAccelerationStructure)?;

        let buffer = &state.buffers[&create_info.buffer];
        assert!(buffer
            .usage
            .contains(BufferUsage::ACCELERATION_STRUCTURE_STORAGE_KHR));
        assert!(create_info.offset + create_info.size <= buffer.data.len() as DeviceSize);

        let handle = state.next_handle();
        let address = state.next_acceleration_structure_address;
        state.next_acceleration_structure_address += 0x1_0000;
        state.acceleration_structures.insert(
            handle,
            MockAccelerationStructure {
                ty: create_info.ty,
                buffer: create_info.buffer,
                address,
                built: false,
                build: None,
            },
        );

        Ok(handle)
    }

    unsafe fn destroy_acceleration_structure(
        &self,
        acceleration_structure: vk::AccelerationStructureKHR,
    ) {
        self.state
            .lock()
            .acceleration_structures
            .remove(&acceleration_structure)
            .expect("destroyed an acceleration structure that is not alive");
    }

    unsafe fn acceleration_structure_device_address(
        &self,
        acceleration_structure: vk::AccelerationStructureKHR,
    ) -> DeviceAddress {
        let state = self.state.lock();
        let structure = &state.acceleration_structures[&acceleration_structure];
        assert!(
            structure.built,
            "address of an acceleration structure queried before its build",
        );

        structure.address
    }

    unsafe fn begin_single_time_commands(&self) -> Result<vk::CommandBuffer, VulkanError> {
        let mut state = self.state.lock();
        state.check(MockCall::BeginSingleTimeCommands)?;

        let command_buffer = state.next_handle();
        state.pending_builds.insert(command_buffer, Vec::new());

        Ok(command_buffer)
    }

    unsafe fn end_single_time_commands(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), VulkanError> {
        let mut state = self.state.lock();
        let builds = state
            .pending_builds
            .remove(&command_buffer)
            .expect("ended a command buffer that was not begun");
        state.check(MockCall::EndSingleTimeCommands)?;

        for (handle, build) in builds {
            let structure = state
                .acceleration_structures
                .get_mut(&handle)
                .expect("acceleration structure destroyed before its build was submitted");
            structure.built = true;
            structure.build = Some(build);

            let ty = structure.ty;
            state.events.push(MockEvent::Submitted(ty));
        }

        Ok(())
    }

    unsafe fn cmd_build_acceleration_structures(
        &self,
        command_buffer: vk::CommandBuffer,
        infos: &[vk::AccelerationStructureBuildGeometryInfoKHR<'_>],
        build_range_infos: &[&[vk::AccelerationStructureBuildRangeInfoKHR]],
    ) {
        let mut state = self.state.lock();
        assert_eq!(infos.len(), build_range_infos.len());

        let mut builds = Vec::with_capacity(infos.len());
        for (info, ranges) in infos.iter().zip(build_range_infos) {
            assert_eq!(info.geometry_count, 1);
            let geometry = unsafe { &*info.p_geometries };
            let primitive_count = ranges[0].primitive_count;

            let structure = &state.acceleration_structures[&info.dst_acceleration_structure];
            assert_eq!(structure.ty, info.ty);
            assert!(!structure.built);

            let scratch_address = unsafe { info.scratch_data.device_address };
            let (scratch_buffer, scratch_offset) = state.buffer_at(scratch_address);
            assert!(scratch_buffer.usage.contains(BufferUsage::STORAGE_BUFFER));
            assert!(
                scratch_offset as DeviceSize + build_sizes(primitive_count).1
                    <= scratch_buffer.data.len() as DeviceSize,
                "scratch buffer too small",
            );

            let mut build = MockBuild {
                scratch_address,
                primitive_count,
                geometry_type: geometry.geometry_type,
                vertex_address: 0,
                max_vertex: 0,
                instances: Vec::new(),
            };

            match geometry.geometry_type {
                vk::GeometryTypeKHR::TRIANGLES => {
                    let triangles = unsafe { geometry.geometry.triangles };
                    build.vertex_address = unsafe { triangles.vertex_data.device_address };
                    build.max_vertex = triangles.max_vertex;
                }
                vk::GeometryTypeKHR::INSTANCES => {
                    let address = unsafe { geometry.geometry.instances.data.device_address };
                    build.instances = state.read_instances(address, primitive_count);
                }
                other => panic!("unexpected geometry type {other:?}"),
            }

            builds.push((info.dst_acceleration_structure, build));
        }

        state
            .pending_builds
            .get_mut(&command_buffer)
            .expect("recorded into a command buffer that was not begun")
            .extend(builds);
    }

    unsafe fn cmd_bind_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        pipeline_bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        let mut state = self.state.lock();
        assert_eq!(pipeline_bind_point, vk::PipelineBindPoint::RAY_TRACING_KHR);
        assert!(state.pipelines.contains_key(&pipeline));

        state
            .commands
            .entry(command_buffer)
            .or_default()
            .push(MockCommand::BindPipeline(pipeline));
    }

    unsafe fn cmd_bind_descriptor_sets(
        &self,
        command_buffer: vk::CommandBuffer,
        pipeline_bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        descriptor_sets: &[vk::DescriptorSet],
    ) {
        let mut state = self.state.lock();
        assert_eq!(pipeline_bind_point, vk::PipelineBindPoint::RAY_TRACING_KHR);
        assert_eq!(first_set, 0);
        assert!(state.pipeline_layouts.contains_key(&layout));
        assert!(descriptor_sets
            .iter()
            .all(|set| state.descriptor_sets.contains_key(set)));

        state
            .commands
            .entry(command_buffer)
            .or_default()
            .push(MockCommand::BindDescriptorSets(layout, descriptor_sets.to_vec()));
    }

    unsafe fn cmd_trace_rays(
        &self,
        command_buffer: vk::CommandBuffer,
        raygen_shader_binding_table: &vk::StridedDeviceAddressRegionKHR,
        miss_shader_binding_table: &vk::StridedDeviceAddressRegionKHR,
        hit_shader_binding_table: &vk::StridedDeviceAddressRegionKHR,
        callable_shader_binding_table: &vk::StridedDeviceAddressRegionKHR,
        width: u32,
        height: u32,
        depth: u32,
    ) {
        let base_alignment = self.properties.shader_group_base_alignment as DeviceAddress;
        assert_eq!(
            raygen_shader_binding_table.size,
            raygen_shader_binding_table.stride,
        );
        for region in [
            raygen_shader_binding_table,
            miss_shader_binding_table,
            hit_shader_binding_table,
        ] {
            assert_eq!(region.device_address % base_alignment, 0);
        }
        assert_eq!(callable_shader_binding_table.size, 0);

        self.state
            .lock()
            .commands
            .entry(command_buffer)
            .or_default()
            .push(MockCommand::TraceRays {
                raygen: raygen_shader_binding_table.device_address,
                miss: miss_shader_binding_table.device_address,
                hit: hit_shader_binding_table.device_address,
                width,
                height,
                depth,
            });
    }

    unsafe fn create_shader_module(&self, code: &[u32]) -> Result<vk::ShaderModule, VulkanError> {
        let mut state = self.state.lock();
        state.check(MockCall::CreateShaderModule)?;

        let handle = state.next_handle();
        state.shader_modules.insert(handle, code.to_vec());

        Ok(handle)
    }

    unsafe fn destroy_shader_module(&self, shader_module: vk::ShaderModule) {
        self.state
            .lock()
            .shader_modules
            .remove(&shader_module)
            .expect("destroyed a shader module that is not alive");
    }

    unsafe fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> Result<vk::DescriptorSetLayout, VulkanError> {
        let mut state = self.state.lock();
        state.check(MockCall::CreateDescriptorSetLayout)?;

        let handle = state.next_handle();
        let bindings = bindings
            .iter()
            .map(|b| (b.binding, b.descriptor_type, b.stage_flags))
            .collect();
        state.set_layouts.insert(handle, bindings);

        Ok(handle)
    }

    unsafe fn destroy_descriptor_set_layout(&self, descriptor_set_layout: vk::DescriptorSetLayout) {
        self.state
            .lock()
            .set_layouts
            .remove(&descriptor_set_layout)
            .expect("destroyed a descriptor set layout that is not alive");
    }

    unsafe fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> Result<vk::PipelineLayout, VulkanError> {
        let mut state = self.state.lock();
        state.check(MockCall::CreatePipelineLayout)?;
        assert!(set_layouts
            .iter()
            .all(|set_layout| state.set_layouts.contains_key(set_layout)));

        let handle = state.next_handle();
        state.pipeline_layouts.insert(handle, set_layouts.to_vec());

        Ok(handle)
    }

    unsafe fn destroy_pipeline_layout(&self, pipeline_layout: vk::PipelineLayout) {
        self.state
            .lock()
            .pipeline_layouts
            .remove(&pipeline_layout)
            .expect("destroyed a pipeline layout that is not alive");
    }

    unsafe fn create_ray_tracing_pipeline(
        &self,
        create_info: &vk::RayTracingPipelineCreateInfoKHR<'_>,
    ) -> Result<vk::Pipeline, VulkanError> {
        let mut state = self.state.lock();
        state.check(MockCall::CreateRayTracingPipeline)?;
        assert!(state.pipeline_layouts.contains_key(&create_info.layout));

        let stages_vk = unsafe {
            slice::from_raw_parts(create_info.p_stages, create_info.stage_count as usize)
        };
        let groups_vk = unsafe {
            slice::from_raw_parts(create_info.p_groups, create_info.group_count as usize)
        };

        let stages = stages_vk
            .iter()
            .map(|stage| {
                assert!(state.shader_modules.contains_key(&stage.module));
                let name = unsafe { CStr::from_ptr(stage.p_name) };
                (stage.stage, name.to_owned())
            })
            .collect();
        let groups = groups_vk
            .iter()
            .map(|group| {
                (
                    group.ty,
                    group.general_shader,
                    group.closest_hit_shader,
                    group.any_hit_shader,
                    group.intersection_shader,
                )
            })
            .collect();

        let handle = state.next_handle();
        state.pipelines.insert(
            handle,
            MockPipeline {
                stages,
                groups,
                layout: create_info.layout,
                max_recursion_depth: create_info.max_pipeline_ray_recursion_depth,
            },
        );
        state.events.push(MockEvent::CreateRayTracingPipeline);

        Ok(handle)
    }

    unsafe fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.state
            .lock()
            .pipelines
            .remove(&pipeline)
            .expect("destroyed a pipeline that is not alive");
    }

    unsafe fn ray_tracing_shader_group_handles(
        &self,
        pipeline: vk::Pipeline,
        first_group: u32,
        group_count: u32,
        data_size: usize,
    ) -> Result<Vec<u8>, VulkanError> {
        let mut state = self.state.lock();
        state.check(MockCall::ShaderGroupHandles)?;

        let handle_size = self.properties.shader_group_handle_size as usize;
        let pipeline_groups = state.pipelines[&pipeline].groups.len() as u32;
        assert!(first_group + group_count <= pipeline_groups);
        assert_eq!(data_size, group_count as usize * handle_size);
        state.events.push(MockEvent::ShaderGroupHandles);

        // Group `k` gets a handle filled with the byte `k + 1`.
        Ok((first_group..first_group + group_count)
            .flat_map(|group| std::iter::repeat_n(group as u8 + 1, handle_size))
            .collect())
    }

    unsafe fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool, VulkanError> {
        let mut state = self.state.lock();
        state.check(MockCall::CreateDescriptorPool)?;
        assert!(!pool_sizes.is_empty());

        let handle = state.next_handle();
        state.descriptor_pools.insert(handle, max_sets);
        state.last_pool_max_sets = Some(max_sets);

        Ok(handle)
    }

    unsafe fn destroy_descriptor_pool(&self, descriptor_pool: vk::DescriptorPool) {
        let mut state = self.state.lock();
        state
            .descriptor_pools
            .remove(&descriptor_pool)
            .expect("destroyed a descriptor pool that is not alive");
        state
            .descriptor_sets
            .retain(|_, set| set.pool != descriptor_pool);
    }

    unsafe fn allocate_descriptor_set(
        &self,
        descriptor_pool: vk::DescriptorPool,
        set_layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet, VulkanError> {
        let mut state = self.state.lock();
        state.check(MockCall::AllocateDescriptorSet)?;
        assert!(state.set_layouts.contains_key(&set_layout));

        let max_sets = state.descriptor_pools[&descriptor_pool];
        let allocated = state
            .descriptor_sets
            .values()
            .filter(|set| set.pool == descriptor_pool)
            .count() as u32;
        if allocated >= max_sets {
            return Err(VulkanError::OutOfPoolMemory);
        }

        let handle = state.next_handle();
        state.descriptor_sets.insert(
            handle,
            MockDescriptorSet {
                pool: descriptor_pool,
                descriptors: HashMap::default(),
            },
        );

        Ok(handle)
    }

    unsafe fn update_descriptor_sets(&self, descriptor_writes: &[vk::WriteDescriptorSet<'_>]) {
        let mut state = self.state.lock();
        state.events.push(MockEvent::UpdateDescriptorSets);

        for write in descriptor_writes {
            let descriptor = match write.descriptor_type {
                vk::DescriptorType::ACCELERATION_STRUCTURE_KHR => {
                    assert_eq!(write.descriptor_count, 1);
                    let acceleration_structure_write = unsafe {
                        &*write
                            .p_next
                            .cast::<vk::WriteDescriptorSetAccelerationStructureKHR<'_>>()
                    };
                    assert_eq!(
                        acceleration_structure_write.s_type,
                        vk::StructureType::WRITE_DESCRIPTOR_SET_ACCELERATION_STRUCTURE_KHR,
                    );
                    let handle = unsafe { *acceleration_structure_write.p_acceleration_structures };
                    assert!(state.acceleration_structures[&handle].built);
                    MockDescriptor::AccelerationStructure(handle)
                }
                vk::DescriptorType::STORAGE_IMAGE => {
                    let image_info = unsafe { &*write.p_image_info };
                    assert_eq!(image_info.image_layout, vk::ImageLayout::GENERAL);
                    MockDescriptor::StorageImage(image_info.image_view)
                }
                vk::DescriptorType::UNIFORM_BUFFER => {
                    let buffer_info = unsafe { &*write.p_buffer_info };
                    assert!(state.buffers[&buffer_info.buffer]
                        .usage
                        .contains(BufferUsage::UNIFORM_BUFFER));
                    MockDescriptor::UniformBuffer(buffer_info.buffer)
                }
                other => panic!("unexpected descriptor type {other:?}"),
            };

            state
                .descriptor_sets
                .get_mut(&write.dst_set)
                .expect("wrote to a descriptor set that is not alive")
                .descriptors
                .insert(write.dst_binding, descriptor);
        }
    }
}
