use tracing::{debug, info, warn};
use windows::Win32::Graphics::Direct3D::D3D_FEATURE_LEVEL_11_0;
use windows::Win32::Graphics::Direct3D12::*;

use super::{list_type, native_error};
use super::{
    Dx12Allocator, Dx12Buffer, Dx12CommandList, Dx12Fence, Dx12Framebuffer, Dx12Pipeline,
    Dx12Queue,
};
use crate::check_native;
use crate::core::error::{DistQueueError, Result};
use crate::gfx::backend::{Device, QueueKind};

/// D3D12 设备
pub struct Dx12Device {
    device: ID3D12Device,
}

// D3D12 设备是自由线程的
unsafe impl Send for Dx12Device {}
unsafe impl Sync for Dx12Device {}

impl Dx12Device {
    /// 在默认适配器上创建设备
    ///
    /// `debug_layer` 为 true 时先尝试启用 D3D12 调试层，失败只输出警告。
    pub fn new(debug_layer: bool) -> Result<Self> {
        unsafe {
            if debug_layer {
                let mut debug: Option<ID3D12Debug> = None;
                match D3D12GetDebugInterface(&mut debug) {
                    Ok(()) => {
                        if let Some(debug) = debug {
                            debug.EnableDebugLayer();
                            debug!("DX12 Debug Layer enabled");
                        }
                    }
                    Err(err) => warn!(error = %err, "Failed to enable DX12 Debug Layer"),
                }
            }

            let mut device: Option<ID3D12Device> = None;
            check_native!(D3D12CreateDevice(None, D3D_FEATURE_LEVEL_11_0, &mut device)
                .map_err(|err| native_error("D3D12CreateDevice", err)))?;
            let device = device.ok_or_else(|| {
                DistQueueError::device("D3D12CreateDevice returned no device")
            })?;

            info!("D3D12 Device created");
            Ok(Self { device })
        }
    }

    /// 包装一个已经创建的设备
    pub fn from_raw(device: ID3D12Device) -> Self {
        Self { device }
    }

    /// 底层设备，用于在核心之外创建资源和管线
    pub fn raw(&self) -> &ID3D12Device {
        &self.device
    }
}

impl Device for Dx12Device {
    type Queue = Dx12Queue;
    type Fence = Dx12Fence;
    type Allocator = Dx12Allocator;
    type CommandList = Dx12CommandList;
    type Pipeline = Dx12Pipeline;
    type Buffer = Dx12Buffer;
    type Framebuffer = Dx12Framebuffer;

    fn backend_name(&self) -> &str {
        "DirectX 12"
    }

    fn create_command_queue(&self, kind: QueueKind) -> Result<Dx12Queue> {
        let desc = D3D12_COMMAND_QUEUE_DESC {
            Type: list_type(kind),
            Flags: D3D12_COMMAND_QUEUE_FLAG_NONE,
            ..Default::default()
        };
        let queue: ID3D12CommandQueue = unsafe { self.device.CreateCommandQueue(&desc) }
            .map_err(|err| native_error("CreateCommandQueue", err))?;
        Ok(Dx12Queue::new(queue))
    }

    fn create_fence(&self, initial_value: u64) -> Result<Dx12Fence> {
        let fence: ID3D12Fence = unsafe { self.device.CreateFence(initial_value, D3D12_FENCE_FLAG_NONE) }
            .map_err(|err| native_error("CreateFence", err))?;
        Ok(Dx12Fence::new(fence))
    }

    fn create_command_allocator(&self, kind: QueueKind) -> Result<Dx12Allocator> {
        let allocator: ID3D12CommandAllocator =
            unsafe { self.device.CreateCommandAllocator(list_type(kind)) }
                .map_err(|err| native_error("CreateCommandAllocator", err))?;
        Ok(Dx12Allocator::new(allocator))
    }

    fn create_command_list(
        &self,
        kind: QueueKind,
        allocator: &Dx12Allocator,
    ) -> Result<Dx12CommandList> {
        unsafe {
            let list: ID3D12GraphicsCommandList = self
                .device
                .CreateCommandList(0, list_type(kind), allocator.raw(), None::<&ID3D12PipelineState>)
                .map_err(|err| native_error("CreateCommandList", err))?;

            // 新建的命令列表处于打开状态
            list.Close().map_err(|err| native_error("Close", err))?;
            Ok(Dx12CommandList::new(list))
        }
    }
}
