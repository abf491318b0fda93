//! In-memory render device
//!
//! `CommandRecorder` implements every host contract by keeping resources as
//! plain byte vectors and logging driver calls. Headless tools use it to run
//! the landscape without a GPU; tests inspect the recorded command stream.

use std::collections::{HashMap, HashSet};

use crate::core::types::Mat4;
use crate::math::Rect;
use super::driver::*;

/// Kind of resource held by the recorder
#[derive(Clone, Debug, PartialEq)]
pub enum ResourceKind {
    VertexBuffer { stride: u32 },
    IndexBuffer,
    ConstantBuffer,
    Texture(TextureDesc),
    Sampler(SamplerDesc),
    DepthStencil(DepthStencilDesc),
    Rasterizer(RasterizerDesc),
    Blend(BlendDesc),
}

#[derive(Debug)]
struct RecordedResource {
    kind: ResourceKind,
    data: Vec<u8>,
}

/// A driver call captured by the recorder
#[derive(Clone, Debug, PartialEq)]
pub enum RecordedCommand {
    StreamSource { stream: u32, buffer: ResourceHandle, stride: u32 },
    Indices(ResourceHandle),
    VertexFormat { stride: u32 },
    WorldTransform(Mat4),
    DrawIndexed {
        topology: PrimitiveTopology,
        base_vertex: i32,
        min_vertex: u32,
        vertex_count: u32,
        start_index: u32,
        primitive_count: u32,
    },
    ScreenQuad,
    DepthStencilState(ResourceHandle),
    BlendState(ResourceHandle),
    RasterizerState(ResourceHandle),
    Sampler { slot: u32, sampler: ResourceHandle, texture: Option<ResourceHandle> },
    ConstantBuffer(ResourceHandle),
    VertexShader { name: String, args: Vec<PermutationArg> },
    PixelShader { name: String, args: Vec<PermutationArg> },
}

/// Recording implementation of [`ResourceProvider`], [`RenderDriver`] and [`ShaderSelector`]
#[derive(Debug, Default)]
pub struct CommandRecorder {
    resources: HashMap<ResourceHandle, RecordedResource>,
    locked: HashSet<ResourceHandle>,
    next_handle: u32,
    commands: Vec<RecordedCommand>,
    /// Remaining successful allocations before every create call fails
    allocation_budget: Option<usize>,
    /// Shader names that fail selection
    missing_shaders: HashSet<String>,
}

impl CommandRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let only `count` more allocations succeed
    pub fn limit_allocations(&mut self, count: usize) {
        self.allocation_budget = Some(count);
    }

    /// Make selection of the named shader fail
    pub fn remove_shader(&mut self, name: &str) {
        self.missing_shaders.insert(name.to_string());
    }

    pub fn commands(&self) -> &[RecordedCommand] {
        &self.commands
    }

    pub fn clear_commands(&mut self) {
        self.commands.clear();
    }

    /// Number of indexed draw calls recorded so far
    pub fn draw_call_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| matches!(c, RecordedCommand::DrawIndexed { .. }))
            .count()
    }

    /// Number of resources created and not yet released
    pub fn live_resources(&self) -> usize {
        self.resources.len()
    }

    pub fn resource_kind(&self, handle: ResourceHandle) -> Option<&ResourceKind> {
        self.resources.get(&handle).map(|r| &r.kind)
    }

    /// Current contents of a buffer or texture
    pub fn contents(&self, handle: ResourceHandle) -> Option<&[u8]> {
        self.resources.get(&handle).map(|r| r.data.as_slice())
    }

    pub fn is_locked(&self, handle: ResourceHandle) -> bool {
        self.locked.contains(&handle)
    }

    fn allocate(&mut self, kind: ResourceKind, size: usize) -> Option<ResourceHandle> {
        if let Some(budget) = self.allocation_budget.as_mut() {
            if *budget == 0 {
                return None;
            }
            *budget -= 1;
        }
        self.next_handle += 1;
        let handle = ResourceHandle(self.next_handle);
        self.resources.insert(handle, RecordedResource { kind, data: vec![0; size] });
        Some(handle)
    }
}

impl ResourceProvider for CommandRecorder {
    fn create_vertex_buffer(&mut self, size: usize, stride: u32) -> Option<ResourceHandle> {
        self.allocate(ResourceKind::VertexBuffer { stride }, size)
    }

    fn create_index_buffer(&mut self, size: usize) -> Option<ResourceHandle> {
        self.allocate(ResourceKind::IndexBuffer, size)
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Option<ResourceHandle> {
        let size = desc.width as usize * desc.height as usize * desc.format.bytes_per_pixel();
        self.allocate(ResourceKind::Texture(*desc), size)
    }

    fn create_constant_buffer(&mut self, size: usize) -> Option<ResourceHandle> {
        self.allocate(ResourceKind::ConstantBuffer, size)
    }

    fn create_sampler_state(&mut self, desc: &SamplerDesc) -> Option<ResourceHandle> {
        self.allocate(ResourceKind::Sampler(*desc), 0)
    }

    fn create_depth_stencil_state(&mut self, desc: &DepthStencilDesc) -> Option<ResourceHandle> {
        self.allocate(ResourceKind::DepthStencil(*desc), 0)
    }

    fn create_rasterizer_state(&mut self, desc: &RasterizerDesc) -> Option<ResourceHandle> {
        self.allocate(ResourceKind::Rasterizer(*desc), 0)
    }

    fn create_blend_state(&mut self, desc: &BlendDesc) -> Option<ResourceHandle> {
        self.allocate(ResourceKind::Blend(*desc), 0)
    }

    fn lock(&mut self, handle: ResourceHandle, region: Option<Rect>, _usage: LockUsage) -> Option<LockedRegion<'_>> {
        if self.locked.contains(&handle) {
            return None;
        }
        let resource = self.resources.get_mut(&handle)?;
        let (offset, pitch) = match (&resource.kind, region) {
            (ResourceKind::Texture(desc), Some(rect)) => {
                let bpp = desc.format.bytes_per_pixel();
                let bounds = Rect::new(0, 0, desc.width as i32, desc.height as i32);
                if rect.is_empty() || rect.intersect(&bounds) != Some(rect) {
                    return None;
                }
                let pitch = desc.width as usize * bpp;
                (rect.top as usize * pitch + rect.left as usize * bpp, pitch)
            }
            (ResourceKind::Texture(desc), None) => (0, desc.width as usize * desc.format.bytes_per_pixel()),
            (_, _) => (0, resource.data.len()),
        };
        self.locked.insert(handle);
        Some(LockedRegion {
            data: &mut resource.data[offset..],
            pitch,
        })
    }

    fn unlock(&mut self, handle: ResourceHandle) {
        self.locked.remove(&handle);
    }

    fn release(&mut self, handle: ResourceHandle) {
        self.locked.remove(&handle);
        self.resources.remove(&handle);
    }
}

impl ShaderSelector for CommandRecorder {
    fn select_vertex_shader(&mut self, name: &str, args: &[PermutationArg]) -> bool {
        if self.missing_shaders.contains(name) {
            return false;
        }
        self.commands.push(RecordedCommand::VertexShader { name: name.to_string(), args: args.to_vec() });
        true
    }

    fn select_pixel_shader(&mut self, name: &str, args: &[PermutationArg]) -> bool {
        if self.missing_shaders.contains(name) {
            return false;
        }
        self.commands.push(RecordedCommand::PixelShader { name: name.to_string(), args: args.to_vec() });
        true
    }
}

impl RenderDriver for CommandRecorder {
    fn set_stream_source(&mut self, stream: u32, buffer: ResourceHandle, stride: u32) {
        self.commands.push(RecordedCommand::StreamSource { stream, buffer, stride });
    }

    fn set_indices(&mut self, buffer: ResourceHandle) {
        self.commands.push(RecordedCommand::Indices(buffer));
    }

    fn set_vertex_format(&mut self, format: &VertexFormat) {
        self.commands.push(RecordedCommand::VertexFormat { stride: format.stride });
    }

    fn set_world_transform(&mut self, transform: &Mat4) {
        self.commands.push(RecordedCommand::WorldTransform(*transform));
    }

    fn draw_indexed_primitive(
        &mut self,
        topology: PrimitiveTopology,
        base_vertex: i32,
        min_vertex: u32,
        vertex_count: u32,
        start_index: u32,
        primitive_count: u32,
    ) {
        self.commands.push(RecordedCommand::DrawIndexed {
            topology,
            base_vertex,
            min_vertex,
            vertex_count,
            start_index,
            primitive_count,
        });
    }

    fn draw_screen_quad(&mut self) {
        self.commands.push(RecordedCommand::ScreenQuad);
    }

    fn set_depth_stencil_state(&mut self, state: ResourceHandle) {
        self.commands.push(RecordedCommand::DepthStencilState(state));
    }

    fn set_blend_state(&mut self, state: ResourceHandle) {
        self.commands.push(RecordedCommand::BlendState(state));
    }

    fn set_rasterizer_state(&mut self, state: ResourceHandle) {
        self.commands.push(RecordedCommand::RasterizerState(state));
    }

    fn set_sampler(&mut self, slot: u32, sampler: ResourceHandle, texture: Option<ResourceHandle>) {
        self.commands.push(RecordedCommand::Sampler { slot, sampler, texture });
    }

    fn set_constant_buffer_auto(&mut self, buffer: ResourceHandle) {
        self.commands.push(RecordedCommand::ConstantBuffer(buffer));
    }

    fn update_constant_buffer(&mut self, buffer: ResourceHandle, data: &[u8]) -> bool {
        write_buffer(self, buffer, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_budget() {
        let mut recorder = CommandRecorder::new();
        recorder.limit_allocations(1);
        assert!(recorder.create_index_buffer(16).is_some());
        assert!(recorder.create_index_buffer(16).is_none());
    }

    #[test]
    fn test_write_buffer_roundtrip() {
        let mut recorder = CommandRecorder::new();
        let handle = recorder.create_vertex_buffer(8, 4).unwrap();
        assert!(write_buffer(&mut recorder, handle, &[1, 2, 3, 4]));
        assert_eq!(&recorder.contents(handle).unwrap()[..4], &[1, 2, 3, 4]);
        assert!(!recorder.is_locked(handle));
        assert!(!write_buffer(&mut recorder, handle, &[0; 9]));
    }

    #[test]
    fn test_texture_rect_lock_uses_pitch() {
        let mut recorder = CommandRecorder::new();
        let desc = TextureDesc { width: 4, height: 4, format: TextureFormat::R8, dynamic: true };
        let handle = recorder.create_texture(&desc).unwrap();
        assert!(write_texture_rect(&mut recorder, handle, Rect::new(1, 1, 3, 3), 1, &[9, 9, 9, 9]));

        let data = recorder.contents(handle).unwrap();
        assert_eq!(data[5], 9);
        assert_eq!(data[6], 9);
        assert_eq!(data[9], 9);
        assert_eq!(data[10], 9);
        assert_eq!(data.iter().filter(|b| **b == 9).count(), 4);
    }

    #[test]
    fn test_out_of_bounds_rect_lock_fails() {
        let mut recorder = CommandRecorder::new();
        let desc = TextureDesc { width: 2, height: 2, format: TextureFormat::Rgba8, dynamic: true };
        let handle = recorder.create_texture(&desc).unwrap();
        assert!(recorder.lock(handle, Some(Rect::new(0, 0, 3, 1)), LockUsage::WriteOnly).is_none());
    }

    #[test]
    fn test_double_lock_rejected() {
        let mut recorder = CommandRecorder::new();
        let handle = recorder.create_constant_buffer(16).unwrap();
        assert!(recorder.lock(handle, None, LockUsage::WriteOnly).is_some());
        assert!(recorder.lock(handle, None, LockUsage::WriteOnly).is_none());
        recorder.unlock(handle);
        assert!(recorder.lock(handle, None, LockUsage::WriteOnly).is_some());
    }

    #[test]
    fn test_missing_shader_fails_selection() {
        let mut recorder = CommandRecorder::new();
        recorder.remove_shader("TerrainPainted");
        assert!(!recorder.select_pixel_shader("TerrainPainted", &[]));
        assert!(recorder.select_vertex_shader("TerrainVertex", &[PermutationArg::Int(2)]));
        assert_eq!(recorder.commands().len(), 1);
    }
}
