//! 外部资源句柄
//!
//! 缓冲区和帧缓冲的内存分配策略不属于命令提交核心，由后端在外部创建。
//! 核心只通过这里的 trait 读取校验命令所需的少量元数据（大小、尺寸），
//! 不跟踪资源的驻留状态和生命周期，只转发引用。

/// 缓冲区句柄需要暴露的信息
pub trait BufferObject: Send + Sync {
    /// 缓冲区大小（字节）
    fn size_in_bytes(&self) -> u64;
}

/// 帧缓冲句柄需要暴露的信息
pub trait FramebufferObject: Send + Sync {
    /// 宽度（像素）
    fn width(&self) -> u32;
    /// 高度（像素）
    fn height(&self) -> u32;
    /// 是否带有深度附件
    fn has_depth(&self) -> bool;
}

/// 资源状态
///
/// 用于调用方显式声明的状态转换，核心不做自动追踪。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    /// 通用状态（也用于上传堆）
    Common,
    /// 顶点或常量缓冲区读取
    VertexAndConstantBuffer,
    /// 索引缓冲区读取
    IndexBuffer,
    /// 拷贝目标
    CopyDest,
    /// 拷贝源
    CopySource,
    /// 渲染目标
    RenderTarget,
    /// 着色器资源
    ShaderResource,
    /// 无序访问
    UnorderedAccess,
}

/// 索引格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexFormat {
    Uint16,
    Uint32,
}

impl IndexFormat {
    /// 每个索引的字节数
    pub fn size_in_bytes(&self) -> u32 {
        match self {
            IndexFormat::Uint16 => 2,
            IndexFormat::Uint32 => 4,
        }
    }
}

/// 视口
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    /// 覆盖整个帧缓冲的视口
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

/// 裁剪矩形
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScissorRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl ScissorRect {
    /// 由左上角和尺寸构造
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            left: x,
            top: y,
            right: x.saturating_add(width as i32),
            bottom: y.saturating_add(height as i32),
        }
    }

    /// 不做任何裁剪
    pub fn unbounded() -> Self {
        Self {
            left: 0,
            top: 0,
            right: i32::MAX,
            bottom: i32::MAX,
        }
    }
}
