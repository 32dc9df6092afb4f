use windows::Win32::Graphics::Direct3D12::{
    ID3D12PipelineState, ID3D12Resource, ID3D12RootSignature, D3D12_CPU_DESCRIPTOR_HANDLE,
};

use crate::renderer::pipeline::{PipelineLayout, PipelineObject};
use crate::renderer::resource::{BufferObject, FramebufferObject};

/// 外部构建的管线状态对象和根签名
pub struct Dx12Pipeline {
    pipeline_state: ID3D12PipelineState,
    root_signature: ID3D12RootSignature,
    layout: PipelineLayout,
}

unsafe impl Send for Dx12Pipeline {}
unsafe impl Sync for Dx12Pipeline {}

impl Dx12Pipeline {
    pub fn new(
        pipeline_state: ID3D12PipelineState,
        root_signature: ID3D12RootSignature,
        layout: PipelineLayout,
    ) -> Self {
        Self {
            pipeline_state,
            root_signature,
            layout,
        }
    }

    pub fn raw(&self) -> &ID3D12PipelineState {
        &self.pipeline_state
    }

    pub fn root_signature(&self) -> &ID3D12RootSignature {
        &self.root_signature
    }
}

impl PipelineObject for Dx12Pipeline {
    fn layout(&self) -> &PipelineLayout {
        &self.layout
    }
}

/// 外部分配的缓冲区资源
pub struct Dx12Buffer {
    resource: ID3D12Resource,
    size: u64,
}

unsafe impl Send for Dx12Buffer {}
unsafe impl Sync for Dx12Buffer {}

impl Dx12Buffer {
    pub fn new(resource: ID3D12Resource, size: u64) -> Self {
        Self { resource, size }
    }

    pub fn raw(&self) -> &ID3D12Resource {
        &self.resource
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl BufferObject for Dx12Buffer {
    fn size_in_bytes(&self) -> u64 {
        self.size
    }
}

/// 渲染目标和深度模板视图的描述符
pub struct Dx12Framebuffer {
    render_targets: Vec<D3D12_CPU_DESCRIPTOR_HANDLE>,
    depth_stencil: Option<D3D12_CPU_DESCRIPTOR_HANDLE>,
    width: u32,
    height: u32,
}

impl Dx12Framebuffer {
    pub fn new(
        render_targets: Vec<D3D12_CPU_DESCRIPTOR_HANDLE>,
        depth_stencil: Option<D3D12_CPU_DESCRIPTOR_HANDLE>,
        width: u32,
        height: u32,
    ) -> Self {
        Self {
            render_targets,
            depth_stencil,
            width,
            height,
        }
    }

    pub fn render_targets(&self) -> &[D3D12_CPU_DESCRIPTOR_HANDLE] {
        &self.render_targets
    }

    pub fn depth_stencil(&self) -> Option<D3D12_CPU_DESCRIPTOR_HANDLE> {
        self.depth_stencil
    }
}

impl FramebufferObject for Dx12Framebuffer {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn has_depth(&self) -> bool {
        self.depth_stencil.is_some()
    }
}
