//! 图形后端模块
//!
//! 本模块封装了不同图形 API 的底层实现，包括：
//! - DirectX 12：Windows 平台的图形 API
//! - Software：进程内模拟的 GPU 时间线，用于没有 DX12 的平台和测试
//!
//! 所有后端都实现了 [`backend`] 中的 trait，命令提交核心只依赖这些 trait。

pub mod backend;
#[cfg(target_os = "windows")]
pub mod dx12;
pub mod software;

pub use backend::{Device, QueueKind};
#[cfg(target_os = "windows")]
pub use dx12::Dx12Device;
pub use software::SoftwareDevice;
