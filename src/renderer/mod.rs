//! 命令提交核心
//!
//! 与具体图形 API 无关的部分：Fence、命令记录器及其池、命令队列和设备上下文。
//! 底层调用全部通过 [`crate::gfx::backend`] 中的 trait 完成。
//!
//! # 模块组织
//!
//! - `sync`：队列 Fence 和调用方持有的 `GpuFence`
//! - `command`：命令记录器和借出的命令列表句柄
//! - `pool`：固定容量的记录器池和在途 FIFO
//! - `queue`：命令队列，提交和同步的公开接口
//! - `context`：设备上下文
//! - `pipeline` / `resource`：外部管理的管线和资源句柄

pub mod command;
pub mod context;
pub mod pipeline;
pub mod pool;
pub mod queue;
pub mod resource;
pub mod sync;

pub use command::{CommandList, CommandRecorder};
pub use context::Context;
pub use pool::{CommandRecorderPool, RecorderState};
pub use queue::{CommandQueue, QueueStats};
pub use sync::{Fence, GpuFence};
