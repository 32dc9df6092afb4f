//! DirectX 12 后端
//!
//! 本模块包含了所有 DirectX 12 相关的代码：
//! - Device: D3D12 设备，创建命令队列、Fence、命令分配器和命令列表
//! - Queue: 命令队列和 Fence（事件驱动的 CPU 等待）
//! - Command: 命令分配器和把已校验命令编码进 `ID3D12GraphicsCommandList` 的命令列表
//! - Resource: 外部创建的管线、缓冲区和帧缓冲句柄

mod command;
mod device;
mod queue;
mod resource;

pub use command::{Dx12Allocator, Dx12CommandList};
pub use device::Dx12Device;
pub use queue::{Dx12Fence, Dx12Queue};
pub use resource::{Dx12Buffer, Dx12Framebuffer, Dx12Pipeline};

use windows::Win32::Foundation::E_OUTOFMEMORY;
use windows::Win32::Graphics::Direct3D12::{
    D3D12_COMMAND_LIST_TYPE, D3D12_COMMAND_LIST_TYPE_COPY, D3D12_COMMAND_LIST_TYPE_DIRECT,
};

use crate::core::error::DistQueueError;
use crate::gfx::backend::QueueKind;

/// 把 D3D12 调用失败转换为核心的错误类型
pub(crate) fn native_error(call: &str, err: windows::core::Error) -> DistQueueError {
    if err.code() == E_OUTOFMEMORY {
        DistQueueError::OutOfMemory(format!("{}: {}", call, err))
    } else {
        DistQueueError::GenericDevice(format!("{} failed: {}", call, err))
    }
}

pub(crate) fn list_type(kind: QueueKind) -> D3D12_COMMAND_LIST_TYPE {
    match kind {
        QueueKind::Direct => D3D12_COMMAND_LIST_TYPE_DIRECT,
        QueueKind::Copy => D3D12_COMMAND_LIST_TYPE_COPY,
    }
}
