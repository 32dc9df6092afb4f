//! 管线对象边界
//!
//! 管线状态对象（根签名、光栅化/混合/深度状态、着色器）的构建不属于命令提交核心。
//! 核心只把管线当作外部管理生命周期的不可变句柄，在记录时绑定进命令列表，
//! 并读取 [`PipelineLayout`] 来校验推送常量和顶点缓冲区绑定。

/// 管线绑定时需要的布局信息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineLayout {
    /// 每个推送常量参数的大小（32 位字）
    pub push_constant_words: Vec<u32>,
    /// 每个顶点缓冲区槽位的步长（字节）
    pub vertex_buffer_strides: Vec<u32>,
}

impl PipelineLayout {
    /// 创建新的布局
    pub fn new(push_constant_words: Vec<u32>, vertex_buffer_strides: Vec<u32>) -> Self {
        Self {
            push_constant_words,
            vertex_buffer_strides,
        }
    }

    /// 推送常量参数数量
    pub fn num_push_constants(&self) -> u32 {
        self.push_constant_words.len() as u32
    }

    /// 顶点缓冲区槽位数量
    pub fn num_vertex_buffer_slots(&self) -> u32 {
        self.vertex_buffer_strides.len() as u32
    }
}

/// 管线句柄需要暴露的信息
pub trait PipelineObject: Send + Sync {
    /// 管线布局
    fn layout(&self) -> &PipelineLayout;
}
