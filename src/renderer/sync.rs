//! GPU 同步机制模块
//!
//! 提供 CPU-GPU 和 GPU-GPU 之间的同步原语。
//!
//! - [`Fence`]：每个命令队列独占一个，分配单调递增的 fence 值并让 GPU 在执行到
//!   对应位置时 signal
//! - [`GpuFence`]：调用方持有的 fence，由某个队列 signal 后可以在 CPU 上等待，
//!   或让另一个队列在 GPU 上等待（跨队列依赖，例如拷贝队列完成后才开始绘制）
//!
//! # 值的约定
//!
//! 原生 fence 以 0 创建，第一次 signal 的值为 1，因此 0 永远视为"已完成"。
//! CPU 侧的下一个值总是大于 GPU 已报告完成的任何值。

use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use crate::check_native;
use crate::core::error::{DistQueueError, Result};
use crate::gfx::backend::{Device, NativeFence, NativeQueue};

/// 命令队列的 Fence
///
/// `signal` 需要 `&mut self`：值的分配和原生 `Signal` 必须相对其它提交者原子，
/// 所以 Fence 只存放在队列的提交锁内部。完成状态的查询和等待通过
/// [`Fence::native`] 的共享引用进行，不需要持有锁。
pub struct Fence<D: Device> {
    native: Arc<D::Fence>,
    /// 下一个要 signal 的值
    next_value: u64,
    /// 最近一次成功 signal 的值
    last_signaled: u64,
}

impl<D: Device> Fence<D> {
    /// 创建新的 Fence
    pub fn new(device: &D) -> Result<Self> {
        let native = check_native!(device.create_fence(0))?;
        Ok(Self {
            native: Arc::new(native),
            next_value: 1,
            last_signaled: 0,
        })
    }

    /// 分配下一个值并让 `queue` 在执行到此处时 signal 它
    ///
    /// 原生调用失败时不消耗该值。
    pub fn signal(&mut self, queue: &D::Queue) -> Result<u64> {
        let value = self.next_value;
        check_native!(queue.signal(&self.native, value))?;
        self.next_value = value + 1;
        self.last_signaled = value;
        trace!(value, "Fence signaled");
        Ok(value)
    }

    /// 最近一次 signal 的值，从未 signal 过时为 0
    pub fn last_signaled(&self) -> u64 {
        self.last_signaled
    }

    /// 下一次 signal 将使用的值
    pub fn next_value(&self) -> u64 {
        self.next_value
    }

    /// 原生 fence 的共享引用
    pub fn native(&self) -> &Arc<D::Fence> {
        &self.native
    }

    /// 非阻塞地检查 `value` 是否已在 GPU 上完成
    pub fn is_done(&self, value: u64) -> bool {
        is_value_done::<D>(&self.native, value)
    }

    /// 阻塞直到 `value` 完成
    pub fn wait_blocking(&self, value: u64) -> Result<()> {
        wait_value_blocking::<D>(&self.native, value)
    }
}

pub(crate) fn is_value_done<D: Device>(native: &D::Fence, value: u64) -> bool {
    native.completed_value() >= value
}

pub(crate) fn wait_value_blocking<D: Device>(native: &D::Fence, value: u64) -> Result<()> {
    if is_value_done::<D>(native, value) {
        return Ok(());
    }
    check_native!(native.wait_for_value(value))
}

pub(crate) fn wait_value_timeout<D: Device>(
    native: &D::Fence,
    value: u64,
    timeout: Duration,
) -> Result<bool> {
    if is_value_done::<D>(native, value) {
        return Ok(true);
    }
    check_native!(native.wait_for_value_timeout(value, timeout))
}

/// `GpuFence` 最近一次被 signal 时记录的目标
struct FenceTarget<D: Device> {
    queue_id: u64,
    fence: Arc<D::Fence>,
    value: u64,
}

/// 调用方持有的 GPU fence
///
/// 新建时不指向任何 signal。通过 `CommandQueue::signal_on_gpu` 盖章后，
/// 它记录了签发队列的 fence 和值，可以：
///
/// - 在 CPU 上查询或等待
/// - 传给另一个队列的 `CommandQueue::wait_on_gpu`
pub struct GpuFence<D: Device> {
    target: Option<FenceTarget<D>>,
}

impl<D: Device> GpuFence<D> {
    /// 创建未 signal 的 fence
    pub fn new() -> Self {
        Self { target: None }
    }

    /// 清除记录的 signal
    pub fn reset(&mut self) {
        self.target = None;
    }

    /// 最近一次 signal 的值
    pub fn value(&self) -> Option<u64> {
        self.target.as_ref().map(|target| target.value)
    }

    /// 签发它的队列 ID
    pub fn queue_id(&self) -> Option<u64> {
        self.target.as_ref().map(|target| target.queue_id)
    }

    /// GPU 是否已执行到 signal 点，从未 signal 过时返回 `false`
    pub fn is_signaled(&self) -> Result<bool> {
        Ok(self
            .target
            .as_ref()
            .map_or(false, |target| is_value_done::<D>(&target.fence, target.value)))
    }

    /// 阻塞直到 GPU 执行到 signal 点
    pub fn wait_on_cpu_blocking(&self) -> Result<()> {
        let target = self.stamped("wait_on_cpu_blocking")?;
        wait_value_blocking::<D>(&target.fence, target.value)
    }

    /// 带超时的阻塞等待，超时返回 `Ok(false)`
    pub fn wait_on_cpu_timeout(&self, timeout: Duration) -> Result<bool> {
        let target = self.stamped("wait_on_cpu_timeout")?;
        wait_value_timeout::<D>(&target.fence, target.value, timeout)
    }

    pub(crate) fn stamp(&mut self, queue_id: u64, fence: Arc<D::Fence>, value: u64) {
        self.target = Some(FenceTarget {
            queue_id,
            fence,
            value,
        });
    }

    /// 原生 fence 和值
    pub(crate) fn target(&self) -> Option<(&D::Fence, u64)> {
        self.target
            .as_ref()
            .map(|target| (target.fence.as_ref(), target.value))
    }

    fn stamped(&self, operation: &str) -> Result<&FenceTarget<D>> {
        self.target.as_ref().ok_or_else(|| {
            DistQueueError::invalid_argument(format!(
                "{} called on a fence that has never been signaled",
                operation
            ))
        })
    }
}

impl<D: Device> Default for GpuFence<D> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::ExecutionMode;
    use crate::gfx::backend::QueueKind;
    use crate::gfx::software::{FailurePoint, SoftwareDevice};

    #[test]
    fn test_fence_values_are_monotonic() {
        let device = SoftwareDevice::new(ExecutionMode::Manual);
        let queue = device.create_command_queue(QueueKind::Direct).unwrap();
        let mut fence = Fence::new(&device).unwrap();

        assert_eq!(fence.last_signaled(), 0);
        assert!(fence.is_done(0));

        let v1 = fence.signal(&queue).unwrap();
        let v2 = fence.signal(&queue).unwrap();
        assert_eq!((v1, v2), (1, 2));
        assert_eq!(fence.last_signaled(), 2);
        assert!(!fence.is_done(v1));

        device.step();
        assert!(fence.is_done(v1));
        assert!(!fence.is_done(v2));

        device.run_until_idle();
        fence.wait_blocking(v2).unwrap();
        assert!(fence.is_done(v2));
    }

    #[test]
    fn test_failed_signal_does_not_consume_value() {
        let device = SoftwareDevice::new(ExecutionMode::Immediate);
        let queue = device.create_command_queue(QueueKind::Direct).unwrap();
        let mut fence = Fence::new(&device).unwrap();

        device.inject_failure(FailurePoint::Signal);
        assert!(fence.signal(&queue).is_err());
        assert_eq!(fence.last_signaled(), 0);

        assert_eq!(fence.signal(&queue).unwrap(), 1);
    }

    #[test]
    fn test_unsignaled_gpu_fence() {
        let fence = GpuFence::<SoftwareDevice>::new();
        assert!(!fence.is_signaled().unwrap());
        assert_eq!(fence.value(), None);

        let err = fence.wait_on_cpu_blocking().unwrap_err();
        assert!(matches!(err, DistQueueError::InvalidArgument(_)));
        assert!(fence.wait_on_cpu_timeout(Duration::from_millis(1)).is_err());
    }

    #[test]
    fn test_gpu_fence_tracks_stamped_value() {
        let device = SoftwareDevice::new(ExecutionMode::Manual);
        let queue = device.create_command_queue(QueueKind::Direct).unwrap();
        let mut queue_fence = Fence::new(&device).unwrap();

        let value = queue_fence.signal(&queue).unwrap();
        let mut fence = GpuFence::<SoftwareDevice>::new();
        fence.stamp(7, Arc::clone(queue_fence.native()), value);

        assert_eq!(fence.queue_id(), Some(7));
        assert!(!fence.is_signaled().unwrap());
        assert!(!fence.wait_on_cpu_timeout(Duration::from_millis(5)).unwrap());

        device.run_until_idle();
        assert!(fence.is_signaled().unwrap());
        fence.wait_on_cpu_blocking().unwrap();

        fence.reset();
        assert!(!fence.is_signaled().unwrap());
    }
}
