//! Software 后端
//!
//! 在进程内模拟 GPU 时间线，实现与 DirectX 12 后端相同的 trait。
//! 它遵循 DX12 的使用规则并把违规行为记录下来：
//!
//! - 命令列表必须关闭后才能提交，打开状态下不能再次 `reset`
//! - 命令分配器在其命令列表仍在 GPU 上执行时不能 `reset` 或释放
//!
//! 没有 DX12 的平台上它是默认后端，测试也用它精确控制 Fence 的完成时机。

mod timeline;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::core::config::ExecutionMode;
use crate::core::error::{DistQueueError, Result};
use crate::gfx::backend::{
    Command, Device, NativeAllocator, NativeCommandList, NativeFence, NativeQueue, QueueKind,
};
use crate::renderer::pipeline::{PipelineLayout, PipelineObject};
use crate::renderer::resource::{
    BufferObject, FramebufferObject, IndexFormat, ResourceState, ScissorRect, Viewport,
};

pub use timeline::ExecutedList;
use timeline::{AllocatorUsage, FenceCell, GpuOp, Timeline};

/// 可以注入一次性失败的底层调用
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePoint {
    CreateCommandAllocator,
    CreateCommandList,
    AllocatorReset,
    ListReset,
    ListClose,
    Execute,
    Signal,
}

/// 设备及其创建的所有对象共享的故障注入表
#[derive(Default)]
struct Faults(Mutex<Vec<FailurePoint>>);

impl Faults {
    fn push(&self, point: FailurePoint) {
        self.0.lock().push(point);
    }

    fn take(&self, point: FailurePoint) -> Result<()> {
        let mut faults = self.0.lock();
        match faults.iter().position(|p| *p == point) {
            Some(idx) => {
                faults.remove(idx);
                Err(DistQueueError::device(format!("injected failure at {:?}", point)))
            }
            None => Ok(()),
        }
    }
}

/// 记录在 software 命令列表中的命令
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    CopyBuffer { size: u64 },
    CopyBufferRegion { dst_offset: u64, src_offset: u64, size: u64 },
    Transition { before: ResourceState, after: ResourceState },
    SetPipeline,
    SetPushConstant { parameter_index: u32, data: Vec<u8> },
    SetFramebuffer { width: u32, height: u32 },
    SetViewport(Viewport),
    SetScissor(ScissorRect),
    ClearRenderTargets([f32; 4]),
    ClearDepth(f32),
    SetIndexBuffer { format: IndexFormat },
    SetVertexBuffer { slot: u32, stride: u32 },
    Draw { first_vertex: u32, vertex_count: u32 },
    DrawIndexed { first_index: u32, index_count: u32 },
}

/// Software 设备
pub struct SoftwareDevice {
    timeline: Arc<Timeline>,
    faults: Arc<Faults>,
    next_list_id: AtomicU64,
    allocators_created: AtomicU64,
}

impl SoftwareDevice {
    /// 创建新的 software 设备
    pub fn new(mode: ExecutionMode) -> Self {
        debug!(?mode, "Software device created");
        Self {
            timeline: Arc::new(Timeline::new(mode)),
            faults: Arc::new(Faults::default()),
            next_list_id: AtomicU64::new(0),
            allocators_created: AtomicU64::new(0),
        }
    }

    /// 执行方式
    pub fn mode(&self) -> ExecutionMode {
        self.timeline.mode()
    }

    /// 切换执行方式，切到 `Immediate` 时执行所有积压的操作
    pub fn set_mode(&self, mode: ExecutionMode) {
        self.timeline.set_mode(mode);
    }

    /// 在模拟 GPU 上执行一个操作（`Manual` 模式）
    pub fn step(&self) -> bool {
        self.timeline.step()
    }

    /// 执行所有可执行的操作（`Manual` 模式）
    pub fn run_until_idle(&self) -> usize {
        self.timeline.run_until_idle()
    }

    /// 尚未执行的操作数量
    pub fn pending_ops(&self) -> usize {
        self.timeline.pending_ops()
    }

    /// 已执行的命令列表
    pub fn executed_lists(&self) -> Vec<ExecutedList> {
        self.timeline.executed()
    }

    /// 检测到的 DX12 使用规则违规
    pub fn violations(&self) -> Vec<String> {
        self.timeline.violations()
    }

    /// 创建过的命令分配器数量
    pub fn allocators_created(&self) -> u64 {
        self.allocators_created.load(Ordering::Acquire)
    }

    /// 让下一次对应的底层调用失败
    pub fn inject_failure(&self, point: FailurePoint) {
        self.faults.push(point);
    }
}

impl Device for SoftwareDevice {
    type Queue = SoftwareQueue;
    type Fence = SoftwareFence;
    type Allocator = SoftwareAllocator;
    type CommandList = SoftwareCommandList;
    type Pipeline = SoftwarePipeline;
    type Buffer = SoftwareBuffer;
    type Framebuffer = SoftwareFramebuffer;

    fn backend_name(&self) -> &str {
        "Software"
    }

    fn create_command_queue(&self, kind: QueueKind) -> Result<SoftwareQueue> {
        Ok(SoftwareQueue {
            index: self.timeline.register_queue(),
            kind,
            timeline: Arc::clone(&self.timeline),
            faults: Arc::clone(&self.faults),
        })
    }

    fn create_fence(&self, initial_value: u64) -> Result<SoftwareFence> {
        Ok(SoftwareFence {
            cell: Arc::new(FenceCell::new(initial_value)),
            timeline: Arc::clone(&self.timeline),
        })
    }

    fn create_command_allocator(&self, kind: QueueKind) -> Result<SoftwareAllocator> {
        self.faults.take(FailurePoint::CreateCommandAllocator)?;
        self.allocators_created.fetch_add(1, Ordering::AcqRel);
        Ok(SoftwareAllocator {
            kind,
            usage: Arc::new(AllocatorUsage::default()),
            timeline: Arc::clone(&self.timeline),
            faults: Arc::clone(&self.faults),
        })
    }

    fn create_command_list(
        &self,
        kind: QueueKind,
        allocator: &SoftwareAllocator,
    ) -> Result<SoftwareCommandList> {
        self.faults.take(FailurePoint::CreateCommandList)?;
        if allocator.kind != kind {
            return Err(DistQueueError::invalid_argument(format!(
                "{} allocator cannot back a {} command list",
                allocator.kind.name(),
                kind.name()
            )));
        }
        Ok(SoftwareCommandList {
            id: self.next_list_id.fetch_add(1, Ordering::AcqRel),
            kind,
            open: false,
            allocator: Arc::clone(&allocator.usage),
            commands: Vec::new(),
            faults: Arc::clone(&self.faults),
        })
    }
}

/// Software 命令队列
pub struct SoftwareQueue {
    index: usize,
    kind: QueueKind,
    timeline: Arc<Timeline>,
    faults: Arc<Faults>,
}

impl SoftwareQueue {
    /// 队列在时间线上的序号
    pub fn index(&self) -> usize {
        self.index
    }

    /// 队列类型
    pub fn kind(&self) -> QueueKind {
        self.kind
    }
}

impl NativeQueue<SoftwareDevice> for SoftwareQueue {
    fn execute_command_list(&self, list: &SoftwareCommandList) -> Result<()> {
        self.faults.take(FailurePoint::Execute)?;
        if list.open {
            return Err(DistQueueError::device("ExecuteCommandLists called with an open command list"));
        }
        if list.kind != self.kind {
            return Err(DistQueueError::invalid_argument(format!(
                "{} command list submitted to a {} queue",
                list.kind.name(),
                self.kind.name()
            )));
        }
        self.timeline.submit(
            self.index,
            GpuOp::Execute {
                list_id: list.id,
                commands: list.commands.clone(),
                allocator: Arc::clone(&list.allocator),
            },
        );
        Ok(())
    }

    fn signal(&self, fence: &SoftwareFence, value: u64) -> Result<()> {
        self.faults.take(FailurePoint::Signal)?;
        self.timeline.submit(
            self.index,
            GpuOp::Signal {
                fence: Arc::clone(&fence.cell),
                value,
            },
        );
        Ok(())
    }

    fn wait(&self, fence: &SoftwareFence, value: u64) -> Result<()> {
        self.timeline.submit(
            self.index,
            GpuOp::Wait {
                fence: Arc::clone(&fence.cell),
                value,
            },
        );
        Ok(())
    }
}

/// Software Fence
pub struct SoftwareFence {
    cell: Arc<FenceCell>,
    timeline: Arc<Timeline>,
}

impl NativeFence for SoftwareFence {
    fn completed_value(&self) -> u64 {
        self.cell.load()
    }

    fn wait_for_value(&self, value: u64) -> Result<()> {
        self.timeline.wait(&self.cell, value);
        Ok(())
    }

    fn wait_for_value_timeout(&self, value: u64, timeout: Duration) -> Result<bool> {
        Ok(self.timeline.wait_timeout(&self.cell, value, timeout))
    }
}

/// Software 命令分配器
pub struct SoftwareAllocator {
    kind: QueueKind,
    usage: Arc<AllocatorUsage>,
    timeline: Arc<Timeline>,
    faults: Arc<Faults>,
}

impl NativeAllocator for SoftwareAllocator {
    fn reset(&mut self) -> Result<()> {
        self.faults.take(FailurePoint::AllocatorReset)?;
        let pending = self.usage.pending();
        if pending > 0 {
            let message = format!(
                "command allocator reset while {} submission(s) using it are still in flight",
                pending
            );
            self.timeline.record_violation(message.clone());
            return Err(DistQueueError::device(message));
        }
        Ok(())
    }
}

impl Drop for SoftwareAllocator {
    fn drop(&mut self) {
        let pending = self.usage.pending();
        if pending > 0 {
            self.timeline.record_violation(format!(
                "command allocator released while {} submission(s) using it are still in flight",
                pending
            ));
        }
    }
}

/// Software 命令列表
pub struct SoftwareCommandList {
    id: u64,
    kind: QueueKind,
    open: bool,
    allocator: Arc<AllocatorUsage>,
    commands: Vec<RecordedCommand>,
    faults: Arc<Faults>,
}

impl SoftwareCommandList {
    /// 命令列表 ID，在设备内唯一
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 是否处于记录状态
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// 当前记录的命令
    pub fn commands(&self) -> &[RecordedCommand] {
        &self.commands
    }
}

impl NativeCommandList<SoftwareDevice> for SoftwareCommandList {
    fn reset(&mut self, allocator: &SoftwareAllocator) -> Result<()> {
        self.faults.take(FailurePoint::ListReset)?;
        if self.open {
            return Err(DistQueueError::device("Reset called on a command list that is still open"));
        }
        self.allocator = Arc::clone(&allocator.usage);
        self.commands.clear();
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.faults.take(FailurePoint::ListClose)?;
        if !self.open {
            return Err(DistQueueError::device("Close called on a command list that is already closed"));
        }
        self.open = false;
        Ok(())
    }

    fn record(&mut self, command: Command<'_, SoftwareDevice>) -> Result<()> {
        if !self.open {
            return Err(DistQueueError::device(format!(
                "{} recorded into a closed command list",
                command.name()
            )));
        }

        let recorded = match command {
            Command::CopyBuffer { dst, .. } => RecordedCommand::CopyBuffer { size: dst.size },
            Command::CopyBufferRegion { dst_offset, src_offset, size, .. } => {
                RecordedCommand::CopyBufferRegion { dst_offset, src_offset, size }
            }
            Command::Transition { before, after, .. } => RecordedCommand::Transition { before, after },
            Command::SetPipeline(_) => RecordedCommand::SetPipeline,
            Command::SetPushConstant { parameter_index, data } => RecordedCommand::SetPushConstant {
                parameter_index,
                data: data.to_vec(),
            },
            Command::SetFramebuffer(framebuffer) => RecordedCommand::SetFramebuffer {
                width: framebuffer.width,
                height: framebuffer.height,
            },
            Command::SetViewport(viewport) => RecordedCommand::SetViewport(viewport),
            Command::SetScissor(scissor) => RecordedCommand::SetScissor(scissor),
            Command::ClearRenderTargets(color) => RecordedCommand::ClearRenderTargets(color),
            Command::ClearDepth(depth) => RecordedCommand::ClearDepth(depth),
            Command::SetIndexBuffer { format, .. } => RecordedCommand::SetIndexBuffer { format },
            Command::SetVertexBuffer { slot, stride, .. } => {
                RecordedCommand::SetVertexBuffer { slot, stride }
            }
            Command::Draw { first_vertex, vertex_count } => {
                RecordedCommand::Draw { first_vertex, vertex_count }
            }
            Command::DrawIndexed { first_index, index_count } => {
                RecordedCommand::DrawIndexed { first_index, index_count }
            }
        };
        self.commands.push(recorded);
        Ok(())
    }
}

/// Software 缓冲区
#[derive(Debug)]
pub struct SoftwareBuffer {
    size: u64,
}

impl SoftwareBuffer {
    pub fn new(size: u64) -> Self {
        Self { size }
    }
}

impl BufferObject for SoftwareBuffer {
    fn size_in_bytes(&self) -> u64 {
        self.size
    }
}

/// Software 管线
#[derive(Debug)]
pub struct SoftwarePipeline {
    layout: PipelineLayout,
}

impl SoftwarePipeline {
    pub fn new(layout: PipelineLayout) -> Self {
        Self { layout }
    }
}

impl PipelineObject for SoftwarePipeline {
    fn layout(&self) -> &PipelineLayout {
        &self.layout
    }
}

/// Software 帧缓冲
#[derive(Debug)]
pub struct SoftwareFramebuffer {
    width: u32,
    height: u32,
    depth: bool,
}

impl SoftwareFramebuffer {
    pub fn new(width: u32, height: u32, depth: bool) -> Self {
        Self { width, height, depth }
    }
}

impl FramebufferObject for SoftwareFramebuffer {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn has_depth(&self) -> bool {
        self.depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manual_device() -> SoftwareDevice {
        SoftwareDevice::new(ExecutionMode::Manual)
    }

    #[test]
    fn test_signal_completes_in_queue_order() {
        let device = manual_device();
        let queue = device.create_command_queue(QueueKind::Direct).unwrap();
        let fence = device.create_fence(0).unwrap();

        queue.signal(&fence, 1).unwrap();
        queue.signal(&fence, 2).unwrap();
        assert_eq!(fence.completed_value(), 0);
        assert_eq!(device.pending_ops(), 2);

        assert!(device.step());
        assert_eq!(fence.completed_value(), 1);

        assert_eq!(device.run_until_idle(), 1);
        assert_eq!(fence.completed_value(), 2);
        assert!(!device.step());
    }

    #[test]
    fn test_gpu_wait_blocks_queue_until_other_queue_signals() {
        let device = manual_device();
        let copy = device.create_command_queue(QueueKind::Copy).unwrap();
        let direct = device.create_command_queue(QueueKind::Direct).unwrap();
        let copy_fence = device.create_fence(0).unwrap();
        let direct_fence = device.create_fence(0).unwrap();

        direct.wait(&copy_fence, 1).unwrap();
        direct.signal(&direct_fence, 1).unwrap();
        device.run_until_idle();
        assert_eq!(direct_fence.completed_value(), 0);

        copy.signal(&copy_fence, 1).unwrap();
        device.run_until_idle();
        assert_eq!(direct_fence.completed_value(), 1);
    }

    #[test]
    fn test_list_state_rules() {
        let device = manual_device();
        let queue = device.create_command_queue(QueueKind::Direct).unwrap();
        let allocator = device.create_command_allocator(QueueKind::Direct).unwrap();
        let mut list = device.create_command_list(QueueKind::Direct, &allocator).unwrap();

        // 新建的列表是关闭的
        assert!(!list.is_open());
        assert!(list.close().is_err());

        list.reset(&allocator).unwrap();
        assert!(list.reset(&allocator).is_err());
        assert!(queue.execute_command_list(&list).is_err());

        list.record(Command::Draw { first_vertex: 0, vertex_count: 3 }).unwrap();
        list.close().unwrap();
        assert!(list.record(Command::ClearDepth(1.0)).is_err());
        queue.execute_command_list(&list).unwrap();
    }

    #[test]
    fn test_allocator_reset_while_in_flight_is_a_violation() {
        let device = manual_device();
        let queue = device.create_command_queue(QueueKind::Direct).unwrap();
        let mut allocator = device.create_command_allocator(QueueKind::Direct).unwrap();
        let mut list = device.create_command_list(QueueKind::Direct, &allocator).unwrap();

        list.reset(&allocator).unwrap();
        list.close().unwrap();
        queue.execute_command_list(&list).unwrap();

        assert!(allocator.reset().is_err());
        assert_eq!(device.violations().len(), 1);

        device.run_until_idle();
        allocator.reset().unwrap();
        assert_eq!(device.executed_lists().len(), 1);
    }

    #[test]
    fn test_wait_timeout() {
        let device = manual_device();
        let fence = device.create_fence(0).unwrap();
        assert!(!fence.wait_for_value_timeout(1, Duration::from_millis(10)).unwrap());
        assert!(fence.wait_for_value_timeout(0, Duration::from_millis(10)).unwrap());
    }

    #[test]
    fn test_injected_failure_is_one_shot() {
        let device = manual_device();
        device.inject_failure(FailurePoint::CreateCommandAllocator);
        assert!(device.create_command_allocator(QueueKind::Direct).is_err());
        assert!(device.create_command_allocator(QueueKind::Direct).is_ok());
        assert_eq!(device.allocators_created(), 1);
    }
}
