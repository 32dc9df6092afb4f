use std::time::Duration;

use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT};
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::System::Threading::{CreateEventA, WaitForSingleObject, INFINITE};

use super::{native_error, Dx12CommandList, Dx12Device};
use crate::core::error::{DistQueueError, Result};
use crate::gfx::backend::{NativeFence, NativeQueue};

/// D3D12 命令队列
pub struct Dx12Queue {
    queue: ID3D12CommandQueue,
}

unsafe impl Send for Dx12Queue {}
unsafe impl Sync for Dx12Queue {}

impl Dx12Queue {
    pub(crate) fn new(queue: ID3D12CommandQueue) -> Self {
        Self { queue }
    }

    /// 底层命令队列，例如用于创建交换链
    pub fn raw(&self) -> &ID3D12CommandQueue {
        &self.queue
    }
}

impl NativeQueue<Dx12Device> for Dx12Queue {
    fn execute_command_list(&self, list: &Dx12CommandList) -> Result<()> {
        let lists = [Some(list.raw().clone().into())];
        unsafe { self.queue.ExecuteCommandLists(&lists) };
        Ok(())
    }

    fn signal(&self, fence: &Dx12Fence, value: u64) -> Result<()> {
        unsafe { self.queue.Signal(&fence.fence, value) }.map_err(|err| native_error("Signal", err))
    }

    fn wait(&self, fence: &Dx12Fence, value: u64) -> Result<()> {
        unsafe { self.queue.Wait(&fence.fence, value) }.map_err(|err| native_error("Wait", err))
    }
}

/// D3D12 Fence
///
/// 每次阻塞等待创建一个独立的事件，多个线程可以同时等待同一个 Fence。
pub struct Dx12Fence {
    fence: ID3D12Fence,
}

unsafe impl Send for Dx12Fence {}
unsafe impl Sync for Dx12Fence {}

impl Dx12Fence {
    pub(crate) fn new(fence: ID3D12Fence) -> Self {
        Self { fence }
    }

    /// 底层 Fence
    pub fn raw(&self) -> &ID3D12Fence {
        &self.fence
    }

    /// 注册完成事件并等待，返回是否在超时前完成
    fn wait_with(&self, value: u64, milliseconds: u32) -> Result<bool> {
        unsafe {
            let event = CreateEventA(None, false, false, None)
                .map_err(|err| native_error("CreateEvent", err))?;
            let result = self.wait_on_event(event, value, milliseconds);
            // 事件句柄在任何情况下都要关闭
            let _ = CloseHandle(event);
            result
        }
    }

    unsafe fn wait_on_event(&self, event: HANDLE, value: u64, milliseconds: u32) -> Result<bool> {
        self.fence
            .SetEventOnCompletion(value, event)
            .map_err(|err| native_error("SetEventOnCompletion", err))?;

        let status = WaitForSingleObject(event, milliseconds);
        if status == WAIT_OBJECT_0 {
            Ok(true)
        } else if status == WAIT_TIMEOUT {
            Ok(self.fence.GetCompletedValue() >= value)
        } else {
            Err(DistQueueError::device(format!(
                "WaitForSingleObject returned {:?}",
                status
            )))
        }
    }
}

impl NativeFence for Dx12Fence {
    fn completed_value(&self) -> u64 {
        unsafe { self.fence.GetCompletedValue() }
    }

    fn wait_for_value(&self, value: u64) -> Result<()> {
        self.wait_with(value, INFINITE).map(|_| ())
    }

    fn wait_for_value_timeout(&self, value: u64, timeout: Duration) -> Result<bool> {
        // INFINITE 是保留值
        let milliseconds = timeout.as_millis().min(u128::from(INFINITE - 1)) as u32;
        self.wait_with(value, milliseconds)
    }
}
