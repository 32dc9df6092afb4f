//! 图形后端的统一抽象接口
//!
//! 命令提交核心只通过这里的 trait 接触底层图形 API：
//! 创建命令分配器、命令列表和 Fence，向原生队列提交、signal 和 wait。
//! DirectX 12 和 software 后端都实现这些接口。

use std::time::Duration;

use crate::core::error::Result;
use crate::renderer::pipeline::PipelineObject;
use crate::renderer::resource::{
    BufferObject, FramebufferObject, IndexFormat, ResourceState, ScissorRect, Viewport,
};

/// 队列类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// 图形队列（支持图形、计算、拷贝，也用于呈现）
    Direct,
    /// 拷贝专用队列
    Copy,
}

impl QueueKind {
    /// 获取队列名称
    pub fn name(&self) -> &'static str {
        match self {
            QueueKind::Direct => "direct",
            QueueKind::Copy => "copy",
        }
    }
}

/// 原生设备
///
/// 关联类型把同一个后端的对象绑定在一起，避免把 DX12 的命令列表提交到
/// 其它后端的队列上。
pub trait Device: Send + Sync + Sized + 'static {
    /// 原生命令队列
    type Queue: NativeQueue<Self>;
    /// 原生 Fence
    type Fence: NativeFence;
    /// 原生命令分配器
    type Allocator: NativeAllocator;
    /// 原生命令列表
    type CommandList: NativeCommandList<Self>;
    /// 管线句柄
    type Pipeline: PipelineObject;
    /// 缓冲区句柄
    type Buffer: BufferObject;
    /// 帧缓冲句柄
    type Framebuffer: FramebufferObject;

    /// 后端名称
    fn backend_name(&self) -> &str;

    /// 创建原生命令队列
    fn create_command_queue(&self, kind: QueueKind) -> Result<Self::Queue>;

    /// 创建初始值为 `initial_value` 的 Fence
    fn create_fence(&self, initial_value: u64) -> Result<Self::Fence>;

    /// 创建命令分配器
    fn create_command_allocator(&self, kind: QueueKind) -> Result<Self::Allocator>;

    /// 创建命令列表
    ///
    /// 返回的列表处于关闭状态，必须先 `reset` 才能记录。
    fn create_command_list(
        &self,
        kind: QueueKind,
        allocator: &Self::Allocator,
    ) -> Result<Self::CommandList>;
}

/// 原生命令队列
pub trait NativeQueue<D: Device>: Send + Sync {
    /// 提交一个已关闭的命令列表
    fn execute_command_list(&self, list: &D::CommandList) -> Result<()>;

    /// 在队列执行到此处时把 `fence` 设置为 `value`
    fn signal(&self, fence: &D::Fence, value: u64) -> Result<()>;

    /// 队列在 `fence` 达到 `value` 之前不再执行后续工作（不阻塞 CPU）
    fn wait(&self, fence: &D::Fence, value: u64) -> Result<()>;
}

/// 原生 Fence
pub trait NativeFence: Send + Sync {
    /// GPU 已完成的值
    fn completed_value(&self) -> u64;

    /// 阻塞调用线程直到 GPU 完成 `value`
    ///
    /// 必须使用操作系统的等待原语，不能忙等。
    fn wait_for_value(&self, value: u64) -> Result<()>;

    /// 带超时的阻塞等待，超时返回 `Ok(false)`
    fn wait_for_value_timeout(&self, value: u64, timeout: Duration) -> Result<bool>;
}

/// 原生命令分配器
pub trait NativeAllocator: Send {
    /// 回收分配器的全部内存
    ///
    /// 只能在使用它的所有命令列表都已在 GPU 上执行完毕后调用。
    fn reset(&mut self) -> Result<()>;
}

/// 原生命令列表
pub trait NativeCommandList<D: Device>: Send {
    /// 从已重置的分配器重新打开命令列表
    fn reset(&mut self, allocator: &D::Allocator) -> Result<()>;

    /// 结束记录
    fn close(&mut self) -> Result<()>;

    /// 编码一条已校验过的命令
    fn record(&mut self, command: Command<'_, D>) -> Result<()>;
}

/// 已校验、可直接下发给原生命令列表的命令
pub enum Command<'a, D: Device> {
    /// 拷贝整个缓冲区
    CopyBuffer {
        dst: &'a D::Buffer,
        src: &'a D::Buffer,
    },
    /// 拷贝缓冲区的一段
    CopyBufferRegion {
        dst: &'a D::Buffer,
        dst_offset: u64,
        src: &'a D::Buffer,
        src_offset: u64,
        size: u64,
    },
    /// 调用方声明的资源状态转换
    Transition {
        buffer: &'a D::Buffer,
        before: ResourceState,
        after: ResourceState,
    },
    /// 绑定管线
    SetPipeline(&'a D::Pipeline),
    /// 设置推送常量
    SetPushConstant {
        parameter_index: u32,
        data: &'a [u8],
    },
    /// 绑定帧缓冲
    SetFramebuffer(&'a D::Framebuffer),
    /// 设置视口
    SetViewport(Viewport),
    /// 设置裁剪矩形
    SetScissor(ScissorRect),
    /// 清除帧缓冲的所有渲染目标
    ClearRenderTargets([f32; 4]),
    /// 清除深度缓冲
    ClearDepth(f32),
    /// 绑定索引缓冲区
    SetIndexBuffer {
        buffer: &'a D::Buffer,
        format: IndexFormat,
    },
    /// 绑定顶点缓冲区
    SetVertexBuffer {
        slot: u32,
        buffer: &'a D::Buffer,
        stride: u32,
    },
    /// 绘制三角形列表
    Draw {
        first_vertex: u32,
        vertex_count: u32,
    },
    /// 带索引绘制三角形列表
    DrawIndexed {
        first_index: u32,
        index_count: u32,
    },
}

impl<D: Device> Command<'_, D> {
    /// 命令名称，用于日志
    pub fn name(&self) -> &'static str {
        match self {
            Command::CopyBuffer { .. } => "CopyBuffer",
            Command::CopyBufferRegion { .. } => "CopyBufferRegion",
            Command::Transition { .. } => "Transition",
            Command::SetPipeline(_) => "SetPipeline",
            Command::SetPushConstant { .. } => "SetPushConstant",
            Command::SetFramebuffer(_) => "SetFramebuffer",
            Command::SetViewport(_) => "SetViewport",
            Command::SetScissor(_) => "SetScissor",
            Command::ClearRenderTargets(_) => "ClearRenderTargets",
            Command::ClearDepth(_) => "ClearDepth",
            Command::SetIndexBuffer { .. } => "SetIndexBuffer",
            Command::SetVertexBuffer { .. } => "SetVertexBuffer",
            Command::Draw { .. } => "Draw",
            Command::DrawIndexed { .. } => "DrawIndexed",
        }
    }
}
