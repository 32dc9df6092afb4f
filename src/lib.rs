//! DistQueue - GPU 命令提交与同步核心
//!
//! 管理固定容量的可复用命令记录器池，按单调递增的 fence 值跟踪它们在 GPU 上的执行，
//! 并提供 CPU-GPU 和跨队列的同步原语。DirectX 12 是具体后端，
//! software 后端在任何平台上模拟同样的行为。
//!
//! # 模块结构
//!
//! - `core`: 核心功能模块（日志、配置、错误处理）
//! - `gfx`: 图形后端（DirectX 12、Software）
//! - `renderer`: 命令提交核心（Fence、记录器池、命令队列、上下文）
//!
//! # 使用示例
//!
//! ```no_run
//! use std::sync::Arc;
//! use dist_queue::core::config::{ExecutionMode, QueueConfig};
//! use dist_queue::gfx::SoftwareDevice;
//! use dist_queue::renderer::Context;
//!
//! let device = Arc::new(SoftwareDevice::new(ExecutionMode::Immediate));
//! let context = Context::new(device, &QueueConfig::default())?;
//!
//! let queue = context.present_queue();
//! let list = queue.begin_command_list_recording()?;
//! queue.execute_command_list(list)?;
//! context.flush_all()?;
//! # Ok::<(), dist_queue::core::DistQueueError>(())
//! ```

pub mod core;
pub mod gfx;
pub mod renderer;
