//! Host render-device contracts
//!
//! The landscape never talks to a graphics API directly. It allocates
//! resources through a [`ResourceProvider`], submits state changes and draws
//! through a [`RenderDriver`], and picks shader permutations through a
//! [`ShaderSelector`]. Handles are opaque ids owned by the host.

use crate::core::types::Mat4;
use crate::math::Rect;

/// Opaque id of a host-owned buffer, texture or state object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceHandle(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextureFormat {
    Rgba8,
    R8,
}

impl TextureFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            TextureFormat::Rgba8 => 4,
            TextureFormat::R8 => 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    /// Written from the CPU after creation
    pub dynamic: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum AddressMode {
    #[default]
    Wrap,
    Clamp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FilterMode {
    Point,
    #[default]
    Linear,
    Anisotropic,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct SamplerDesc {
    pub address: AddressMode,
    pub filter: FilterMode,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CompareFunction {
    Always,
    #[default]
    LessEqual,
    Equal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DepthStencilDesc {
    pub depth_test: bool,
    pub depth_write: bool,
    pub compare: CompareFunction,
    /// Mark written pixels in the stencil buffer
    pub stencil_write: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlendFactor {
    Zero,
    One,
    SrcAlpha,
    InvSrcAlpha,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlendDesc {
    pub enabled: bool,
    pub src: BlendFactor,
    pub dst: BlendFactor,
    /// RGBA write mask, one bit per channel
    pub write_mask: u8,
}

impl BlendDesc {
    pub const OPAQUE: BlendDesc = BlendDesc {
        enabled: false,
        src: BlendFactor::One,
        dst: BlendFactor::Zero,
        write_mask: 0xF,
    };

    pub const ADDITIVE: BlendDesc = BlendDesc {
        enabled: true,
        src: BlendFactor::One,
        dst: BlendFactor::One,
        write_mask: 0xF,
    };

    pub const COLOR_DISABLED: BlendDesc = BlendDesc {
        enabled: false,
        src: BlendFactor::One,
        dst: BlendFactor::Zero,
        write_mask: 0,
    };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CullMode {
    None,
    #[default]
    Back,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct RasterizerDesc {
    pub cull: CullMode,
    pub wireframe: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockUsage {
    ReadOnly,
    WriteOnly,
    ReadWrite,
    /// Previous contents may be thrown away
    Discard,
}

/// CPU-visible window onto a locked resource.
///
/// `data` starts at the first byte of the locked rectangle; rows are
/// `pitch` bytes apart.
pub struct LockedRegion<'a> {
    pub data: &'a mut [u8],
    pub pitch: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrimitiveTopology {
    TriangleList,
    TriangleStrip,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VertexSemantic {
    Position,
    Normal,
    Color,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElementFormat {
    Float3,
    Unorm4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexElement {
    pub offset: u32,
    pub format: ElementFormat,
    pub semantic: VertexSemantic,
}

/// Layout of one vertex stream
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexFormat {
    pub stride: u32,
    pub elements: &'static [VertexElement],
}

/// One typed value selecting a shader variant
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PermutationArg {
    Int(i32),
    Bool(bool),
}

/// Allocation and CPU access for buffers, textures and state objects
pub trait ResourceProvider {
    fn create_vertex_buffer(&mut self, size: usize, stride: u32) -> Option<ResourceHandle>;
    fn create_index_buffer(&mut self, size: usize) -> Option<ResourceHandle>;
    fn create_texture(&mut self, desc: &TextureDesc) -> Option<ResourceHandle>;
    fn create_constant_buffer(&mut self, size: usize) -> Option<ResourceHandle>;
    fn create_sampler_state(&mut self, desc: &SamplerDesc) -> Option<ResourceHandle>;
    fn create_depth_stencil_state(&mut self, desc: &DepthStencilDesc) -> Option<ResourceHandle>;
    fn create_rasterizer_state(&mut self, desc: &RasterizerDesc) -> Option<ResourceHandle>;
    fn create_blend_state(&mut self, desc: &BlendDesc) -> Option<ResourceHandle>;

    /// Lock a resource (or a texel rectangle of a texture) for CPU access.
    /// Every successful lock must be paired with `unlock` before the
    /// resource is used again.
    fn lock(&mut self, handle: ResourceHandle, region: Option<Rect>, usage: LockUsage) -> Option<LockedRegion<'_>>;
    fn unlock(&mut self, handle: ResourceHandle);

    fn release(&mut self, handle: ResourceHandle);
}

/// Shader permutation lookup
pub trait ShaderSelector {
    fn select_vertex_shader(&mut self, name: &str, args: &[PermutationArg]) -> bool;
    fn select_pixel_shader(&mut self, name: &str, args: &[PermutationArg]) -> bool;
}

/// Draw submission and device state binding
pub trait RenderDriver: ResourceProvider + ShaderSelector {
    fn set_stream_source(&mut self, stream: u32, buffer: ResourceHandle, stride: u32);
    fn set_indices(&mut self, buffer: ResourceHandle);
    fn set_vertex_format(&mut self, format: &VertexFormat);
    fn set_world_transform(&mut self, transform: &Mat4);

    fn draw_indexed_primitive(
        &mut self,
        topology: PrimitiveTopology,
        base_vertex: i32,
        min_vertex: u32,
        vertex_count: u32,
        start_index: u32,
        primitive_count: u32,
    );
    fn draw_screen_quad(&mut self);

    fn set_depth_stencil_state(&mut self, state: ResourceHandle);
    fn set_blend_state(&mut self, state: ResourceHandle);
    fn set_rasterizer_state(&mut self, state: ResourceHandle);
    fn set_sampler(&mut self, slot: u32, sampler: ResourceHandle, texture: Option<ResourceHandle>);

    /// Bind a constant buffer to the slot its shader declaration names
    fn set_constant_buffer_auto(&mut self, buffer: ResourceHandle);
    fn update_constant_buffer(&mut self, buffer: ResourceHandle, data: &[u8]) -> bool;
}

/// Write `bytes` into a buffer through a lock/unlock pair
pub fn write_buffer(provider: &mut dyn ResourceProvider, handle: ResourceHandle, bytes: &[u8]) -> bool {
    let written = match provider.lock(handle, None, LockUsage::Discard) {
        Some(region) if region.data.len() >= bytes.len() => {
            region.data[..bytes.len()].copy_from_slice(bytes);
            true
        }
        Some(_) => false,
        None => return false,
    };
    provider.unlock(handle);
    written
}

/// Copy a tightly packed texel rectangle into a texture
pub fn write_texture_rect(
    provider: &mut dyn ResourceProvider,
    handle: ResourceHandle,
    rect: Rect,
    bytes_per_pixel: usize,
    texels: &[u8],
) -> bool {
    let row_bytes = rect.width() as usize * bytes_per_pixel;
    let rows = rect.height() as usize;
    if rect.is_empty() || texels.len() < row_bytes * rows {
        return false;
    }

    let written = match provider.lock(handle, Some(rect), LockUsage::WriteOnly) {
        Some(region) => {
            let mut ok = true;
            for row in 0..rows {
                let dst = row * region.pitch;
                let src = row * row_bytes;
                match region.data.get_mut(dst..dst + row_bytes) {
                    Some(target) => target.copy_from_slice(&texels[src..src + row_bytes]),
                    None => {
                        ok = false;
                        break;
                    }
                }
            }
            ok
        }
        None => return false,
    };
    provider.unlock(handle);
    written
}
