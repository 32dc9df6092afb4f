//! 设备上下文
//!
//! 持有设备和它的命令队列。上下文是显式创建、显式传递的普通对象，
//! 同一进程可以同时存在多个上下文，没有全局状态。

use std::sync::Arc;

use crate::core::config::QueueConfig;
use crate::core::error::Result;
use crate::engine_info;
use crate::gfx::backend::{Device, QueueKind};
use crate::renderer::queue::CommandQueue;

/// 设备上下文
pub struct Context<D: Device> {
    present_queue: CommandQueue<D>,
    copy_queue: Option<CommandQueue<D>>,
    device: Arc<D>,
}

impl<D: Device> Context<D> {
    /// 在 `device` 上创建图形队列，以及按配置创建拷贝队列
    pub fn new(device: Arc<D>, config: &QueueConfig) -> Result<Self> {
        let present_queue = CommandQueue::new(Arc::clone(&device), QueueKind::Direct, config)?;
        let copy_queue = if config.enable_copy_queue {
            Some(CommandQueue::new(Arc::clone(&device), QueueKind::Copy, config)?)
        } else {
            None
        };

        engine_info!(
            backend = device.backend_name(),
            copy_queue = copy_queue.is_some(),
            "Context initialized"
        );

        Ok(Self {
            present_queue,
            copy_queue,
            device,
        })
    }

    /// 设备
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// 图形（呈现）队列
    pub fn present_queue(&self) -> &CommandQueue<D> {
        &self.present_queue
    }

    /// 拷贝队列
    pub fn copy_queue(&self) -> Option<&CommandQueue<D>> {
        self.copy_queue.as_ref()
    }

    /// 等待所有队列完成已提交的工作
    pub fn flush_all(&self) -> Result<()> {
        if let Some(copy_queue) = &self.copy_queue {
            copy_queue.flush()?;
        }
        self.present_queue.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::ExecutionMode;
    use crate::gfx::software::{SoftwareBuffer, SoftwareDevice};
    use crate::renderer::resource::ResourceState;
    use crate::renderer::sync::GpuFence;

    #[test]
    fn test_context_queues() {
        let device = Arc::new(SoftwareDevice::new(ExecutionMode::Immediate));
        let context = Context::new(Arc::clone(&device), &QueueConfig::with_capacity(4)).unwrap();

        assert_eq!(context.present_queue().kind(), QueueKind::Direct);
        assert_eq!(context.copy_queue().map(|queue| queue.kind()), Some(QueueKind::Copy));
        assert_ne!(
            context.present_queue().id(),
            context.copy_queue().map(|queue| queue.id()).unwrap_or_default()
        );

        let config = QueueConfig {
            enable_copy_queue: false,
            ..QueueConfig::with_capacity(4)
        };
        let context = Context::new(device, &config).unwrap();
        assert!(context.copy_queue().is_none());
    }

    #[test]
    fn test_multiple_contexts_coexist() {
        let a = Context::new(
            Arc::new(SoftwareDevice::new(ExecutionMode::Immediate)),
            &QueueConfig::with_capacity(2),
        )
        .unwrap();
        let b = Context::new(
            Arc::new(SoftwareDevice::new(ExecutionMode::Immediate)),
            &QueueConfig::with_capacity(2),
        )
        .unwrap();

        a.flush_all().unwrap();
        b.flush_all().unwrap();
        assert_ne!(a.present_queue().id(), b.present_queue().id());
    }

    #[test]
    fn test_upload_then_draw() {
        let device = Arc::new(SoftwareDevice::new(ExecutionMode::Manual));
        let context = Context::new(Arc::clone(&device), &QueueConfig::with_capacity(4)).unwrap();
        let Some(copy_queue) = context.copy_queue() else {
            panic!("copy queue disabled");
        };
        let staging = SoftwareBuffer::new(1024);
        let vertices = SoftwareBuffer::new(1024);

        let mut upload = copy_queue.begin_command_list_recording().unwrap();
        upload.copy_buffer_to_buffer(&vertices, 0, &staging, 0, 1024).unwrap();
        upload
            .transition(&vertices, ResourceState::CopyDest, ResourceState::VertexAndConstantBuffer)
            .unwrap();
        copy_queue.execute_command_list(upload).unwrap();

        let mut uploaded = GpuFence::new();
        copy_queue.signal_on_gpu(&mut uploaded).unwrap();
        context.present_queue().wait_on_gpu(&uploaded).unwrap();

        device.set_mode(ExecutionMode::Immediate);
        context.flush_all().unwrap();
        assert!(uploaded.is_signaled().unwrap());
        assert_eq!(device.executed_lists().len(), 1);
    }
}
