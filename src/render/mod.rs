//! Host rendering contracts and an in-memory implementation

pub mod driver;
pub mod recorder;

pub use driver::{
    ResourceHandle, ResourceProvider, RenderDriver, ShaderSelector,
    PermutationArg, PrimitiveTopology, LockUsage, LockedRegion,
    TextureDesc, TextureFormat, SamplerDesc, DepthStencilDesc, BlendDesc, RasterizerDesc,
    VertexFormat, VertexElement, VertexSemantic, ElementFormat,
    AddressMode, FilterMode, CompareFunction, CullMode, BlendFactor,
    write_buffer, write_texture_rect,
};
pub use recorder::{CommandRecorder, RecordedCommand};
