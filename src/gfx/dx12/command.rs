use std::mem::ManuallyDrop;

use windows::Win32::Foundation::RECT;
use windows::Win32::Graphics::Direct3D::D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::{DXGI_FORMAT_R16_UINT, DXGI_FORMAT_R32_UINT};

use super::{native_error, Dx12Device};
use crate::core::error::Result;
use crate::gfx::backend::{Command, NativeAllocator, NativeCommandList};
use crate::renderer::resource::{IndexFormat, ResourceState};

/// D3D12 命令分配器
pub struct Dx12Allocator {
    allocator: ID3D12CommandAllocator,
}

unsafe impl Send for Dx12Allocator {}

impl Dx12Allocator {
    pub(crate) fn new(allocator: ID3D12CommandAllocator) -> Self {
        Self { allocator }
    }

    pub(crate) fn raw(&self) -> &ID3D12CommandAllocator {
        &self.allocator
    }
}

impl NativeAllocator for Dx12Allocator {
    fn reset(&mut self) -> Result<()> {
        unsafe { self.allocator.Reset() }.map_err(|err| native_error("ID3D12CommandAllocator::Reset", err))
    }
}

/// 当前绑定的帧缓冲描述符
struct BoundTargets {
    render_targets: Vec<D3D12_CPU_DESCRIPTOR_HANDLE>,
    depth_stencil: Option<D3D12_CPU_DESCRIPTOR_HANDLE>,
}

/// D3D12 图形命令列表
pub struct Dx12CommandList {
    list: ID3D12GraphicsCommandList,
    targets: Option<BoundTargets>,
}

unsafe impl Send for Dx12CommandList {}

impl Dx12CommandList {
    pub(crate) fn new(list: ID3D12GraphicsCommandList) -> Self {
        Self { list, targets: None }
    }

    /// 底层命令列表
    pub fn raw(&self) -> &ID3D12GraphicsCommandList {
        &self.list
    }
}

impl NativeCommandList<Dx12Device> for Dx12CommandList {
    fn reset(&mut self, allocator: &Dx12Allocator) -> Result<()> {
        self.targets = None;
        unsafe { self.list.Reset(allocator.raw(), None::<&ID3D12PipelineState>) }
            .map_err(|err| native_error("ID3D12GraphicsCommandList::Reset", err))
    }

    fn close(&mut self) -> Result<()> {
        unsafe { self.list.Close() }.map_err(|err| native_error("ID3D12GraphicsCommandList::Close", err))
    }

    fn record(&mut self, command: Command<'_, Dx12Device>) -> Result<()> {
        unsafe {
            match command {
                Command::CopyBuffer { dst, src } => {
                    self.list.CopyResource(dst.raw(), src.raw());
                }
                Command::CopyBufferRegion {
                    dst,
                    dst_offset,
                    src,
                    src_offset,
                    size,
                } => {
                    self.list
                        .CopyBufferRegion(dst.raw(), dst_offset, src.raw(), src_offset, size);
                }
                Command::Transition {
                    buffer,
                    before,
                    after,
                } => {
                    let barrier = D3D12_RESOURCE_BARRIER {
                        Type: D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
                        Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
                        Anonymous: D3D12_RESOURCE_BARRIER_0 {
                            Transition: ManuallyDrop::new(D3D12_RESOURCE_TRANSITION_BARRIER {
                                pResource: ManuallyDrop::new(Some(buffer.raw().clone())),
                                Subresource: D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
                                StateBefore: resource_state(before),
                                StateAfter: resource_state(after),
                            }),
                        },
                    };
                    let barriers = [barrier];
                    self.list.ResourceBarrier(&barriers);

                    // 释放屏障持有的资源引用
                    let [barrier] = barriers;
                    let transition = ManuallyDrop::into_inner(barrier.Anonymous.Transition);
                    drop(ManuallyDrop::into_inner(transition.pResource));
                }
                Command::SetPipeline(pipeline) => {
                    self.list.SetPipelineState(pipeline.raw());
                    self.list.SetGraphicsRootSignature(pipeline.root_signature());
                }
                Command::SetPushConstant {
                    parameter_index,
                    data,
                } => {
                    let words = (data.len() / 4) as u32;
                    self.list.SetGraphicsRoot32BitConstants(
                        parameter_index,
                        words,
                        data.as_ptr().cast(),
                        0,
                    );
                }
                Command::SetFramebuffer(framebuffer) => {
                    let render_targets = framebuffer.render_targets().to_vec();
                    let depth_stencil = framebuffer.depth_stencil();
                    self.list.OMSetRenderTargets(
                        render_targets.len() as u32,
                        Some(render_targets.as_ptr()),
                        false,
                        depth_stencil.as_ref().map(|handle| handle as *const _),
                    );
                    self.targets = Some(BoundTargets {
                        render_targets,
                        depth_stencil,
                    });
                }
                Command::SetViewport(viewport) => {
                    self.list.RSSetViewports(&[D3D12_VIEWPORT {
                        TopLeftX: viewport.x,
                        TopLeftY: viewport.y,
                        Width: viewport.width,
                        Height: viewport.height,
                        MinDepth: viewport.min_depth,
                        MaxDepth: viewport.max_depth,
                    }]);
                }
                Command::SetScissor(scissor) => {
                    self.list.RSSetScissorRects(&[RECT {
                        left: scissor.left,
                        top: scissor.top,
                        right: scissor.right,
                        bottom: scissor.bottom,
                    }]);
                }
                Command::ClearRenderTargets(color) => {
                    if let Some(targets) = &self.targets {
                        for handle in &targets.render_targets {
                            self.list.ClearRenderTargetView(*handle, &color, None);
                        }
                    }
                }
                Command::ClearDepth(depth) => {
                    if let Some(handle) = self.targets.as_ref().and_then(|t| t.depth_stencil) {
                        self.list
                            .ClearDepthStencilView(handle, D3D12_CLEAR_FLAG_DEPTH, depth, 0, None);
                    }
                }
                Command::SetIndexBuffer { buffer, format } => {
                    let view = D3D12_INDEX_BUFFER_VIEW {
                        BufferLocation: buffer.raw().GetGPUVirtualAddress(),
                        SizeInBytes: buffer.size() as u32,
                        Format: match format {
                            IndexFormat::Uint16 => DXGI_FORMAT_R16_UINT,
                            IndexFormat::Uint32 => DXGI_FORMAT_R32_UINT,
                        },
                    };
                    self.list.IASetIndexBuffer(Some(&view));
                }
                Command::SetVertexBuffer {
                    slot,
                    buffer,
                    stride,
                } => {
                    let view = D3D12_VERTEX_BUFFER_VIEW {
                        BufferLocation: buffer.raw().GetGPUVirtualAddress(),
                        SizeInBytes: buffer.size() as u32,
                        StrideInBytes: stride,
                    };
                    self.list.IASetVertexBuffers(slot, Some(&[view]));
                }
                Command::Draw {
                    first_vertex,
                    vertex_count,
                } => {
                    self.list
                        .IASetPrimitiveTopology(D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST);
                    self.list.DrawInstanced(vertex_count, 1, first_vertex, 0);
                }
                Command::DrawIndexed {
                    first_index,
                    index_count,
                } => {
                    self.list
                        .IASetPrimitiveTopology(D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST);
                    self.list.DrawIndexedInstanced(index_count, 1, first_index, 0, 0);
                }
            }
        }
        Ok(())
    }
}

fn resource_state(state: ResourceState) -> D3D12_RESOURCE_STATES {
    match state {
        ResourceState::Common => D3D12_RESOURCE_STATE_COMMON,
        ResourceState::VertexAndConstantBuffer => D3D12_RESOURCE_STATE_VERTEX_AND_CONSTANT_BUFFER,
        ResourceState::IndexBuffer => D3D12_RESOURCE_STATE_INDEX_BUFFER,
        ResourceState::CopyDest => D3D12_RESOURCE_STATE_COPY_DEST,
        ResourceState::CopySource => D3D12_RESOURCE_STATE_COPY_SOURCE,
        ResourceState::RenderTarget => D3D12_RESOURCE_STATE_RENDER_TARGET,
        ResourceState::ShaderResource => D3D12_RESOURCE_STATE_ALL_SHADER_RESOURCE,
        ResourceState::UnorderedAccess => D3D12_RESOURCE_STATE_UNORDERED_ACCESS,
    }
}
