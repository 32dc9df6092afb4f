//! 命令记录器
//!
//! [`CommandRecorder`] 把一个命令分配器和一个命令列表组成可复用的单元，
//! 并记录标记其完成的 fence 值。记录接口在把命令交给原生命令列表之前完成全部校验，
//! 校验失败的命令不会到达原生层。
//!
//! [`CommandList`] 是 `CommandQueue::begin_command_list_recording` 借出的句柄，
//! 在借出期间独占记录器，必须交回 `CommandQueue::execute_command_list`。
//! 未执行就被丢弃时按队列配置的 `AbandonPolicy` 处理。

use std::fmt;
use std::ops::{Deref, DerefMut};

use bytemuck::Pod;
use tracing::debug;

use crate::check_native;
use crate::core::error::{DistQueueError, Result};
use crate::gfx::backend::{Command, Device, NativeAllocator, NativeCommandList, QueueKind};
use crate::renderer::pipeline::{PipelineLayout, PipelineObject};
use crate::renderer::queue::CommandQueue;
use crate::renderer::resource::{
    BufferObject, FramebufferObject, IndexFormat, ResourceState, ScissorRect, Viewport,
};

#[derive(Debug, Clone, Copy)]
struct FramebufferInfo {
    has_depth: bool,
}

/// 一次记录期间绑定的状态，重新借出时清空
#[derive(Debug, Default)]
struct BoundState {
    pipeline: Option<PipelineLayout>,
    framebuffer: Option<FramebufferInfo>,
}

/// 命令记录器
pub struct CommandRecorder<D: Device> {
    slot: usize,
    kind: QueueKind,
    allocator: D::Allocator,
    list: D::CommandList,
    completion_fence: u64,
    bound: BoundState,
}

impl<D: Device> CommandRecorder<D> {
    /// 创建新的记录器，命令列表处于关闭状态
    pub(crate) fn new(device: &D, kind: QueueKind, slot: usize) -> Result<Self> {
        let allocator = check_native!(device.create_command_allocator(kind))?;
        let list = check_native!(device.create_command_list(kind, &allocator))?;
        debug!(slot, kind = kind.name(), "Command recorder created");

        Ok(Self {
            slot,
            kind,
            allocator,
            list,
            completion_fence: 0,
            bound: BoundState::default(),
        })
    }

    /// 重置分配器并重新打开命令列表
    ///
    /// 关闭的命令列表不能直接重新打开，必须从已重置的分配器重新初始化。
    pub(crate) fn begin(&mut self) -> Result<()> {
        check_native!(self.allocator.reset())?;
        check_native!(self.list.reset(&self.allocator))?;
        self.bound = BoundState::default();
        Ok(())
    }

    pub(crate) fn close(&mut self) -> Result<()> {
        check_native!(self.list.close())
    }

    pub(crate) fn set_completion_fence(&mut self, value: u64) {
        self.completion_fence = value;
    }

    /// 在池中的槽位
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// 命令列表类型
    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// 标记上一次提交完成的 fence 值
    pub fn completion_fence(&self) -> u64 {
        self.completion_fence
    }

    /// 原生命令列表
    pub fn native(&self) -> &D::CommandList {
        &self.list
    }

    /// 拷贝缓冲区
    ///
    /// 两个缓冲区大小相同且拷贝整个缓冲区时下发整体拷贝，否则下发区域拷贝。
    pub fn copy_buffer_to_buffer(
        &mut self,
        dst: &D::Buffer,
        dst_offset: u64,
        src: &D::Buffer,
        src_offset: u64,
        size: u64,
    ) -> Result<()> {
        if std::ptr::eq(dst, src) {
            return Err(DistQueueError::invalid_argument(
                "source and destination are the same buffer",
            ));
        }
        check_range("destination", dst_offset, size, dst.size_in_bytes())?;
        check_range("source", src_offset, size, src.size_in_bytes())?;

        let whole_buffer = dst.size_in_bytes() == src.size_in_bytes()
            && size == dst.size_in_bytes()
            && dst_offset == 0
            && src_offset == 0;

        let command = if whole_buffer {
            Command::CopyBuffer { dst, src }
        } else {
            Command::CopyBufferRegion {
                dst,
                dst_offset,
                src,
                src_offset,
                size,
            }
        };
        self.encode(command)
    }

    /// 调用方声明的资源状态转换，`before == after` 时什么也不做
    pub fn transition(
        &mut self,
        buffer: &D::Buffer,
        before: ResourceState,
        after: ResourceState,
    ) -> Result<()> {
        if before == after {
            return Ok(());
        }
        self.encode(Command::Transition {
            buffer,
            before,
            after,
        })
    }

    /// 绑定管线，每次记录只允许一次
    pub fn set_pipeline(&mut self, pipeline: &D::Pipeline) -> Result<()> {
        if self.bound.pipeline.is_some() {
            return Err(DistQueueError::invalid_state(
                "a pipeline is already bound to this command list",
            ));
        }
        self.encode(Command::SetPipeline(pipeline))?;
        self.bound.pipeline = Some(pipeline.layout().clone());
        Ok(())
    }

    /// 设置推送常量
    ///
    /// `value` 的大小必须与管线布局中该参数声明的字数一致。
    pub fn set_push_constant<T: Pod>(&mut self, parameter_index: u32, value: &T) -> Result<()> {
        let words = {
            let layout = self.bound_pipeline("set_push_constant")?;
            layout
                .push_constant_words
                .get(parameter_index as usize)
                .copied()
                .ok_or_else(|| {
                    DistQueueError::invalid_argument(format!(
                        "push constant index {} out of range ({} parameters)",
                        parameter_index,
                        layout.num_push_constants()
                    ))
                })?
        };

        let data = bytemuck::bytes_of(value);
        if data.len() != words as usize * 4 {
            return Err(DistQueueError::invalid_argument(format!(
                "push constant {} expects {} bytes, got {}",
                parameter_index,
                words * 4,
                data.len()
            )));
        }

        self.encode(Command::SetPushConstant {
            parameter_index,
            data,
        })
    }

    /// 绑定帧缓冲，每次记录只允许一次
    ///
    /// 没有给出视口时使用覆盖整个帧缓冲的视口（深度 0..1），没有给出裁剪矩形时不裁剪。
    pub fn set_framebuffer(
        &mut self,
        framebuffer: &D::Framebuffer,
        viewport: Option<Viewport>,
        scissor: Option<ScissorRect>,
    ) -> Result<()> {
        if self.bound.framebuffer.is_some() {
            return Err(DistQueueError::invalid_state(
                "a framebuffer is already bound to this command list",
            ));
        }

        let (width, height) = (framebuffer.width(), framebuffer.height());
        self.encode(Command::SetFramebuffer(framebuffer))?;
        self.encode(Command::SetViewport(
            viewport.unwrap_or_else(|| Viewport::full(width, height)),
        ))?;
        self.encode(Command::SetScissor(
            scissor.unwrap_or_else(ScissorRect::unbounded),
        ))?;

        self.bound.framebuffer = Some(FramebufferInfo {
            has_depth: framebuffer.has_depth(),
        });
        Ok(())
    }

    /// 设置视口
    pub fn set_viewport(&mut self, viewport: Viewport) -> Result<()> {
        self.bound_framebuffer("set_viewport")?;
        self.encode(Command::SetViewport(viewport))
    }

    /// 设置裁剪矩形
    pub fn set_scissor(&mut self, scissor: ScissorRect) -> Result<()> {
        self.bound_framebuffer("set_scissor")?;
        self.encode(Command::SetScissor(scissor))
    }

    /// 清除帧缓冲的渲染目标
    pub fn clear_render_targets(&mut self, color: [f32; 4]) -> Result<()> {
        self.bound_framebuffer("clear_render_targets")?;
        self.encode(Command::ClearRenderTargets(color))
    }

    /// 清除深度缓冲
    pub fn clear_depth(&mut self, depth: f32) -> Result<()> {
        if !self.bound_framebuffer("clear_depth")?.has_depth {
            return Err(DistQueueError::invalid_state(
                "the bound framebuffer has no depth attachment",
            ));
        }
        self.encode(Command::ClearDepth(depth))
    }

    /// 绑定索引缓冲区
    pub fn set_index_buffer(&mut self, buffer: &D::Buffer, format: IndexFormat) -> Result<()> {
        self.encode(Command::SetIndexBuffer { buffer, format })
    }

    /// 绑定顶点缓冲区，步长取自已绑定管线的布局
    pub fn set_vertex_buffer(&mut self, slot: u32, buffer: &D::Buffer) -> Result<()> {
        let stride = {
            let layout = self.bound_pipeline("set_vertex_buffer")?;
            layout
                .vertex_buffer_strides
                .get(slot as usize)
                .copied()
                .ok_or_else(|| {
                    DistQueueError::invalid_state(format!(
                        "vertex buffer slot {} out of range ({} slots)",
                        slot,
                        layout.num_vertex_buffer_slots()
                    ))
                })?
        };
        self.encode(Command::SetVertexBuffer {
            slot,
            buffer,
            stride,
        })
    }

    /// 绘制三角形列表
    pub fn draw_triangles(&mut self, first_vertex: u32, vertex_count: u32) -> Result<()> {
        self.bound_pipeline("draw_triangles")?;
        self.encode(Command::Draw {
            first_vertex,
            vertex_count,
        })
    }

    /// 带索引绘制 `triangle_count` 个三角形
    pub fn draw_triangles_indexed(&mut self, first_index: u32, triangle_count: u32) -> Result<()> {
        self.bound_pipeline("draw_triangles_indexed")?;
        let index_count = triangle_count.checked_mul(3).ok_or_else(|| {
            DistQueueError::invalid_argument(format!(
                "triangle count {} overflows the index count",
                triangle_count
            ))
        })?;
        self.encode(Command::DrawIndexed {
            first_index,
            index_count,
        })
    }

    fn bound_pipeline(&self, operation: &str) -> Result<&PipelineLayout> {
        self.bound.pipeline.as_ref().ok_or_else(|| {
            DistQueueError::invalid_state(format!("{} requires a bound pipeline", operation))
        })
    }

    fn bound_framebuffer(&self, operation: &str) -> Result<FramebufferInfo> {
        self.bound.framebuffer.ok_or_else(|| {
            DistQueueError::invalid_state(format!("{} requires a bound framebuffer", operation))
        })
    }

    fn encode(&mut self, command: Command<'_, D>) -> Result<()> {
        // 拷贝队列只接受拷贝和资源转换
        if self.kind == QueueKind::Copy
            && !matches!(
                command,
                Command::CopyBuffer { .. }
                    | Command::CopyBufferRegion { .. }
                    | Command::Transition { .. }
            )
        {
            return Err(DistQueueError::invalid_state(format!(
                "{} is not supported on a copy command list",
                command.name()
            )));
        }
        check_native!(self.list.record(command))
    }
}

impl<D: Device> fmt::Debug for CommandRecorder<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRecorder")
            .field("slot", &self.slot)
            .field("kind", &self.kind)
            .field("completion_fence", &self.completion_fence)
            .field("bound", &self.bound)
            .finish_non_exhaustive()
    }
}

fn check_range(which: &str, offset: u64, size: u64, buffer_size: u64) -> Result<()> {
    match offset.checked_add(size) {
        Some(end) if end <= buffer_size => Ok(()),
        _ => Err(DistQueueError::invalid_argument(format!(
            "{} range {}..+{} exceeds buffer size {}",
            which, offset, size, buffer_size
        ))),
    }
}

/// 借出的命令列表
///
/// 通过 `Deref` 使用 [`CommandRecorder`] 的记录接口。
pub struct CommandList<'q, D: Device> {
    queue: &'q CommandQueue<D>,
    recorder: Option<CommandRecorder<D>>,
}

impl<'q, D: Device> CommandList<'q, D> {
    pub(crate) fn new(queue: &'q CommandQueue<D>, recorder: CommandRecorder<D>) -> Self {
        Self {
            queue,
            recorder: Some(recorder),
        }
    }

    /// 借出它的队列 ID
    pub fn queue_id(&self) -> u64 {
        self.queue.id()
    }

    pub(crate) fn queue(&self) -> &'q CommandQueue<D> {
        self.queue
    }

    /// 取回记录器，之后 `Drop` 不再做任何事
    pub(crate) fn into_recorder(mut self) -> CommandRecorder<D> {
        match self.recorder.take() {
            Some(recorder) => recorder,
            None => unreachable!("command list used after it was returned to its queue"),
        }
    }
}

impl<D: Device> fmt::Debug for CommandList<'_, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandList")
            .field("queue", &self.queue.id())
            .field("recorder", &self.recorder)
            .finish()
    }
}

impl<D: Device> Deref for CommandList<'_, D> {
    type Target = CommandRecorder<D>;

    fn deref(&self) -> &Self::Target {
        match &self.recorder {
            Some(recorder) => recorder,
            None => unreachable!("command list used after it was returned to its queue"),
        }
    }
}

impl<D: Device> DerefMut for CommandList<'_, D> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.recorder {
            Some(recorder) => recorder,
            None => unreachable!("command list used after it was returned to its queue"),
        }
    }
}

impl<D: Device> Drop for CommandList<'_, D> {
    fn drop(&mut self) {
        if let Some(recorder) = self.recorder.take() {
            self.queue.abandon(recorder);
        }
    }
}
