//! 命令队列
//!
//! 命令提交的公开接口。每个队列独占一个 [`Fence`] 和一个 [`CommandRecorderPool`]，
//! 二者放在同一把提交锁里：fence 值的分配、原生 `Signal` 和 FIFO 的入队必须全局有序，
//! FIFO 队首才总是最早完成的提交。
//!
//! 提交锁只在簿记期间短暂持有。`flush` 在锁内 signal，释放锁之后才阻塞等待，
//! 长时间的等待不会阻塞其它线程的 `begin_command_list_recording` 和 `execute_command_list`。
//! 完成状态的查询直接读取原生 fence，不需要锁。
//!
//! # 使用示例
//!
//! ```no_run
//! use std::sync::Arc;
//! use dist_queue::core::config::{ExecutionMode, QueueConfig};
//! use dist_queue::gfx::backend::QueueKind;
//! use dist_queue::gfx::software::SoftwareDevice;
//! use dist_queue::renderer::queue::CommandQueue;
//!
//! let device = Arc::new(SoftwareDevice::new(ExecutionMode::Immediate));
//! let queue = CommandQueue::new(device, QueueKind::Direct, &QueueConfig::default())?;
//!
//! let mut list = queue.begin_command_list_recording()?;
//! list.clear_render_targets([0.0, 0.0, 0.0, 1.0]).ok();
//! queue.execute_command_list(list)?;
//! queue.flush()?;
//! # Ok::<(), dist_queue::core::error::DistQueueError>(())
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::check_native;
use crate::core::config::{AbandonPolicy, QueueConfig};
use crate::core::error::{DistQueueError, Result};
use crate::gfx::backend::{Device, NativeQueue, QueueKind};
use crate::renderer::command::{CommandList, CommandRecorder};
use crate::renderer::pool::{CommandRecorderPool, PoolStats};
use crate::renderer::sync::{self, Fence, GpuFence};
use crate::{engine_error, engine_info, engine_warn};

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// 队列统计信息
pub type QueueStats = PoolStats;

/// 提交锁保护的状态
struct SubmitState<D: Device> {
    fence: Fence<D>,
    pool: CommandRecorderPool<D>,
}

/// 命令队列
pub struct CommandQueue<D: Device> {
    id: u64,
    kind: QueueKind,
    abandon_policy: AbandonPolicy,
    device: Arc<D>,
    native: D::Queue,
    /// 与 `state.fence` 共享的原生 fence，用于无锁查询和等待
    completion: Arc<D::Fence>,
    state: Mutex<SubmitState<D>>,
}

impl<D: Device> CommandQueue<D> {
    /// 创建命令队列
    pub fn new(device: Arc<D>, kind: QueueKind, config: &QueueConfig) -> Result<Self> {
        if config.max_command_lists == 0 {
            return Err(DistQueueError::invalid_argument(
                "max_command_lists must be at least 1",
            ));
        }

        let native = check_native!(device.create_command_queue(kind))?;
        let fence = Fence::new(device.as_ref())?;
        let completion = Arc::clone(fence.native());
        let id = NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed);

        engine_info!(
            queue = id,
            kind = kind.name(),
            backend = device.backend_name(),
            capacity = config.max_command_lists,
            "Command queue created"
        );

        Ok(Self {
            id,
            kind,
            abandon_policy: config.abandon_policy,
            device,
            native,
            completion,
            state: Mutex::new(SubmitState {
                fence,
                pool: CommandRecorderPool::new(kind, config.max_command_lists),
            }),
        })
    }

    /// 队列 ID，在进程内唯一
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 队列类型
    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// 创建队列的设备
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// 原生队列
    pub fn native(&self) -> &D::Queue {
        &self.native
    }

    /// 借出一个已打开的命令列表
    ///
    /// 池已满且 FIFO 队首尚未完成时返回 `OutOfCommandLists`，调用方可以 `flush` 后重试。
    pub fn begin_command_list_recording(&self) -> Result<CommandList<'_, D>> {
        let mut state = self.state.lock();
        let SubmitState { fence, pool } = &mut *state;
        let recorder = pool.acquire(self.device.as_ref(), |value| fence.is_done(value))?;
        Ok(CommandList::new(self, recorder))
    }

    /// 关闭并提交命令列表
    ///
    /// 无论成功与否，命令列表都会交还给队列：
    ///
    /// - 关闭失败：记录器退役
    /// - 提交失败：记录器未被 GPU 引用，直接回到空闲状态
    /// - signal 失败：工作已提交，记录器以下一次 signal 的值入队
    pub fn execute_command_list(&self, list: CommandList<'_, D>) -> Result<()> {
        if list.queue_id() != self.id {
            // 调用方的错误，不按丢弃策略处理
            let owner = list.queue();
            owner.reclaim(list.into_recorder());
            return Err(DistQueueError::invalid_state(format!(
                "command list belongs to queue {}, not queue {}",
                owner.id(),
                self.id
            )));
        }
        let mut recorder = list.into_recorder();

        let mut state = self.state.lock();
        let SubmitState { fence, pool } = &mut *state;

        if let Err(err) = recorder.close() {
            pool.retire(recorder);
            return Err(err);
        }

        if let Err(err) = check_native!(self.native.execute_command_list(recorder.native())) {
            pool.return_free(recorder);
            return Err(err);
        }

        match fence.signal(&self.native) {
            Ok(value) => {
                pool.release(recorder, value);
                Ok(())
            }
            Err(err) => {
                pool.release(recorder, fence.next_value());
                Err(err)
            }
        }
    }

    /// 在队列中插入一个 signal，返回其 fence 值
    pub fn signal_on_gpu_internal(&self) -> Result<u64> {
        self.state.lock().fence.signal(&self.native)
    }

    /// 在队列中插入一个 signal，并把 `fence` 指向它
    pub fn signal_on_gpu(&self, fence: &mut GpuFence<D>) -> Result<u64> {
        let value = self.signal_on_gpu_internal()?;
        fence.stamp(self.id, Arc::clone(&self.completion), value);
        Ok(value)
    }

    /// 让队列在 GPU 上等待 `fence`，不阻塞 CPU
    pub fn wait_on_gpu(&self, fence: &GpuFence<D>) -> Result<()> {
        let (native, value) = fence.target().ok_or_else(|| {
            DistQueueError::invalid_argument("wait_on_gpu called on a fence that has never been signaled")
        })?;
        let _state = self.state.lock();
        check_native!(self.native.wait(native, value))
    }

    /// 阻塞直到本队列的 `value` 完成
    pub fn wait_on_cpu(&self, value: u64) -> Result<()> {
        self.check_signaled(value)?;
        sync::wait_value_blocking::<D>(&self.completion, value)
    }

    /// 带超时的阻塞等待，超时返回 `Ok(false)`
    pub fn wait_on_cpu_timeout(&self, value: u64, timeout: Duration) -> Result<bool> {
        self.check_signaled(value)?;
        sync::wait_value_timeout::<D>(&self.completion, value, timeout)
    }

    /// 非阻塞地检查 `value` 是否已完成
    pub fn is_fence_value_done(&self, value: u64) -> bool {
        sync::is_value_done::<D>(&self.completion, value)
    }

    /// 最近一次 signal 的值
    pub fn last_signaled_value(&self) -> u64 {
        self.state.lock().fence.last_signaled()
    }

    /// 等待此前提交的所有工作完成
    pub fn flush(&self) -> Result<()> {
        let value = self.signal_on_gpu_internal()?;
        debug!(queue = self.id, value, "Flushing command queue");
        sync::wait_value_blocking::<D>(&self.completion, value)
    }

    /// 统计信息
    pub fn stats(&self) -> QueueStats {
        self.state.lock().pool.stats()
    }

    /// 处理未执行就被丢弃的命令列表
    pub(crate) fn abandon(&self, recorder: CommandRecorder<D>) {
        let slot = recorder.slot();
        self.reclaim(recorder);

        match self.abandon_policy {
            AbandonPolicy::Reclaim => {
                engine_warn!(queue = self.id, slot, "Command list dropped without being executed");
            }
            AbandonPolicy::Panic => {
                if !std::thread::panicking() {
                    panic!(
                        "command list (queue {}, slot {}) dropped without being executed",
                        self.id, slot
                    );
                }
            }
        }
    }

    /// 交还一个没有提交的记录器，关闭失败时退役
    fn reclaim(&self, mut recorder: CommandRecorder<D>) {
        let mut state = self.state.lock();
        match recorder.close() {
            Ok(()) => state.pool.return_free(recorder),
            Err(_) => state.pool.retire(recorder),
        }
    }

    fn check_signaled(&self, value: u64) -> Result<()> {
        let last = self.last_signaled_value();
        if value > last {
            return Err(DistQueueError::invalid_argument(format!(
                "fence value {} has not been signaled yet (last signaled {})",
                value, last
            )));
        }
        Ok(())
    }
}

impl<D: Device> Drop for CommandQueue<D> {
    fn drop(&mut self) {
        // 释放记录器之前必须等待 GPU 完成所有引用它们的工作
        if let Err(err) = self.flush() {
            engine_error!(queue = self.id, error = %err, "Failed to flush command queue on drop");
        }
        debug!(queue = self.id, "Command queue destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::ExecutionMode;
    use crate::gfx::software::{FailurePoint, SoftwareBuffer, SoftwareDevice};
    use std::sync::atomic::AtomicBool;
    use std::thread;

    fn setup(
        mode: ExecutionMode,
        capacity: usize,
    ) -> (Arc<SoftwareDevice>, CommandQueue<SoftwareDevice>) {
        let device = Arc::new(SoftwareDevice::new(mode));
        let config = QueueConfig::with_capacity(capacity).with_abandon_policy(AbandonPolicy::Reclaim);
        let queue = CommandQueue::new(Arc::clone(&device), QueueKind::Direct, &config).unwrap();
        (device, queue)
    }

    /// 让剩余的 GPU 工作完成，队列 drop 时的 flush 不会阻塞
    fn finish(device: &SoftwareDevice) {
        device.set_mode(ExecutionMode::Immediate);
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        let device = Arc::new(SoftwareDevice::new(ExecutionMode::Immediate));
        let result = CommandQueue::new(device, QueueKind::Direct, &QueueConfig::with_capacity(0));
        assert!(matches!(result, Err(DistQueueError::InvalidArgument(_))));
    }

    #[test]
    fn test_exhaustion_then_recovery() {
        let (device, queue) = setup(ExecutionMode::Manual, 3);

        let lists: Vec<_> = (0..3)
            .map(|_| queue.begin_command_list_recording().unwrap())
            .collect();
        let err = queue.begin_command_list_recording().unwrap_err();
        assert!(matches!(err, DistQueueError::OutOfCommandLists));
        assert!(err.is_recoverable());

        for list in lists {
            queue.execute_command_list(list).unwrap();
        }
        assert!(queue.begin_command_list_recording().is_err());

        device.run_until_idle();
        let created = device.allocators_created();
        let list = queue.begin_command_list_recording().unwrap();
        assert_eq!(device.allocators_created(), created);
        assert_eq!(queue.stats().created, 3);
        queue.execute_command_list(list).unwrap();

        finish(&device);
    }

    #[test]
    fn test_reuses_first_submission_while_second_is_pending() {
        let (device, queue) = setup(ExecutionMode::Manual, 2);

        let r1 = queue.begin_command_list_recording().unwrap();
        let r1_slot = r1.slot();
        queue.execute_command_list(r1).unwrap();
        let r2 = queue.begin_command_list_recording().unwrap();
        queue.execute_command_list(r2).unwrap();
        assert_eq!(queue.last_signaled_value(), 2);

        // 执行 r1 和 signal 1
        device.step();
        device.step();
        assert!(queue.is_fence_value_done(1));
        assert!(!queue.is_fence_value_done(2));

        let reused = queue.begin_command_list_recording().unwrap();
        assert_eq!(reused.slot(), r1_slot);
        queue.execute_command_list(reused).unwrap();
        assert!(device.violations().is_empty());

        finish(&device);
    }

    #[test]
    fn test_capacity_invariant_holds() {
        let (device, queue) = setup(ExecutionMode::Manual, 4);

        for round in 0..20 {
            match queue.begin_command_list_recording() {
                Ok(list) => queue.execute_command_list(list).unwrap(),
                Err(DistQueueError::OutOfCommandLists) => {
                    device.step();
                }
                Err(err) => panic!("unexpected error: {}", err),
            }
            if round % 3 == 0 {
                device.step();
            }

            let stats = queue.stats();
            assert!(stats.in_flight <= stats.live);
            assert!(stats.live <= stats.capacity);
        }

        finish(&device);
        assert!(device.violations().is_empty());
    }

    #[test]
    fn test_flush_is_a_full_barrier() {
        let (device, queue) = setup(ExecutionMode::Immediate, 8);
        let buffer_a = SoftwareBuffer::new(64);
        let buffer_b = SoftwareBuffer::new(64);

        for _ in 0..5 {
            let mut list = queue.begin_command_list_recording().unwrap();
            list.copy_buffer_to_buffer(&buffer_a, 0, &buffer_b, 0, 64).unwrap();
            queue.execute_command_list(list).unwrap();
        }
        let before = queue.last_signaled_value();
        queue.flush().unwrap();

        for value in 1..=before {
            assert!(queue.is_fence_value_done(value));
        }
        assert_eq!(device.executed_lists().len(), 5);
    }

    #[test]
    fn test_flush_does_not_block_other_submitters() {
        let (device, queue) = setup(ExecutionMode::Manual, 4);

        thread::scope(|scope| {
            let flusher = scope.spawn(|| queue.flush());

            // 等 flush 在锁内完成 signal
            while queue.last_signaled_value() == 0 {
                thread::yield_now();
            }

            // flush 阻塞期间仍然可以借出和提交
            let list = queue.begin_command_list_recording().unwrap();
            queue.execute_command_list(list).unwrap();
            assert_eq!(queue.last_signaled_value(), 2);

            device.run_until_idle();
            flusher.join().unwrap().unwrap();
        });

        finish(&device);
    }

    #[test]
    fn test_concurrent_submission() {
        let (device, queue) = setup(ExecutionMode::Immediate, 8);

        thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..50 {
                        let list = loop {
                            match queue.begin_command_list_recording() {
                                Ok(list) => break list,
                                Err(DistQueueError::OutOfCommandLists) => queue.flush().unwrap(),
                                Err(err) => panic!("unexpected error: {}", err),
                            }
                        };
                        queue.execute_command_list(list).unwrap();
                    }
                });
            }
        });

        queue.flush().unwrap();
        let stats = queue.stats();
        assert!(stats.live <= 8);
        assert_eq!(stats.lent, 0);
        assert_eq!(device.executed_lists().len(), 200);
        assert!(device.violations().is_empty());
    }

    #[test]
    fn test_drop_flushes_in_flight_work() {
        let device = Arc::new(SoftwareDevice::new(ExecutionMode::Manual));
        let queue =
            CommandQueue::new(Arc::clone(&device), QueueKind::Direct, &QueueConfig::with_capacity(2))
                .unwrap();
        let list = queue.begin_command_list_recording().unwrap();
        queue.execute_command_list(list).unwrap();
        assert!(device.pending_ops() > 0);

        let dropped = AtomicBool::new(false);
        thread::scope(|scope| {
            scope.spawn(|| {
                // 推迟执行，drop 开始时工作仍在途
                thread::sleep(Duration::from_millis(20));
                while !dropped.load(Ordering::Acquire) {
                    if device.run_until_idle() == 0 {
                        thread::sleep(Duration::from_millis(1));
                    }
                }
            });

            // drop 阻塞在 flush 上，直到 GPU 线程执行完所有工作
            drop(queue);
            dropped.store(true, Ordering::Release);
        });

        assert_eq!(device.pending_ops(), 0);
        assert!(device.violations().is_empty());
    }

    #[test]
    fn test_execute_on_wrong_queue_is_an_error_not_a_panic() {
        let device = Arc::new(SoftwareDevice::new(ExecutionMode::Immediate));
        let config = QueueConfig::with_capacity(2).with_abandon_policy(AbandonPolicy::Panic);
        let a = CommandQueue::new(Arc::clone(&device), QueueKind::Direct, &config).unwrap();
        let b = CommandQueue::new(Arc::clone(&device), QueueKind::Direct, &config).unwrap();

        let list = a.begin_command_list_recording().unwrap();
        let err = b.execute_command_list(list).unwrap_err();
        assert!(matches!(err, DistQueueError::InvalidCommandListState(_)));

        // 列表回到了原队列
        let stats = a.stats();
        assert_eq!(stats.lent, 0);
        assert_eq!(stats.free, 1);
        assert_eq!(b.stats().live, 0);

        // 回收的记录器可以在原队列上正常使用
        let list = a.begin_command_list_recording().unwrap();
        a.execute_command_list(list).unwrap();
        assert_eq!(a.stats().created, 1);
    }

    #[test]
    fn test_abandon_reclaims_recorder() {
        let (device, queue) = setup(ExecutionMode::Immediate, 1);
        {
            let mut list = queue.begin_command_list_recording().unwrap();
            list.draw_triangles(0, 3).ok();
        }
        assert_eq!(queue.stats().free, 1);

        let list = queue.begin_command_list_recording().unwrap();
        queue.execute_command_list(list).unwrap();
        assert_eq!(device.allocators_created(), 1);
        assert_eq!(queue.stats().in_flight, 1);
    }

    #[test]
    #[should_panic(expected = "dropped without being executed")]
    fn test_abandon_panics_under_panic_policy() {
        let device = Arc::new(SoftwareDevice::new(ExecutionMode::Immediate));
        let config = QueueConfig::with_capacity(1).with_abandon_policy(AbandonPolicy::Panic);
        let queue = CommandQueue::new(device, QueueKind::Direct, &config).unwrap();
        let list = queue.begin_command_list_recording().unwrap();
        drop(list);
    }

    #[test]
    fn test_close_failure_retires_recorder() {
        let (device, queue) = setup(ExecutionMode::Immediate, 1);
        device.inject_failure(FailurePoint::ListClose);

        let list = queue.begin_command_list_recording().unwrap();
        assert!(matches!(
            queue.execute_command_list(list),
            Err(DistQueueError::GenericDevice(_))
        ));
        assert_eq!(queue.stats().live, 0);

        let list = queue.begin_command_list_recording().unwrap();
        queue.execute_command_list(list).unwrap();
        assert_eq!(queue.stats().created, 2);
    }

    #[test]
    fn test_submit_failure_returns_recorder_to_pool() {
        let (device, queue) = setup(ExecutionMode::Immediate, 1);
        device.inject_failure(FailurePoint::Execute);

        let list = queue.begin_command_list_recording().unwrap();
        assert!(queue.execute_command_list(list).is_err());
        assert_eq!(queue.stats().free, 1);
        assert_eq!(queue.last_signaled_value(), 0);
    }

    #[test]
    fn test_signal_failure_tags_with_next_value() {
        let (device, queue) = setup(ExecutionMode::Manual, 1);
        device.inject_failure(FailurePoint::Signal);

        let list = queue.begin_command_list_recording().unwrap();
        assert!(queue.execute_command_list(list).is_err());
        assert_eq!(queue.stats().in_flight, 1);

        // 在下一次 signal 完成之前不能回收
        device.run_until_idle();
        assert!(matches!(
            queue.begin_command_list_recording(),
            Err(DistQueueError::OutOfCommandLists)
        ));

        assert_eq!(queue.signal_on_gpu_internal().unwrap(), 1);
        device.run_until_idle();
        let list = queue.begin_command_list_recording().unwrap();
        queue.execute_command_list(list).unwrap();
        assert!(device.violations().is_empty());

        finish(&device);
    }

    #[test]
    fn test_wait_on_cpu() {
        let (device, queue) = setup(ExecutionMode::Manual, 1);

        assert!(queue.wait_on_cpu(1).is_err());
        let value = queue.signal_on_gpu_internal().unwrap();
        assert!(!queue.wait_on_cpu_timeout(value, Duration::from_millis(10)).unwrap());

        device.run_until_idle();
        assert!(queue.wait_on_cpu_timeout(value, Duration::from_millis(10)).unwrap());
        queue.wait_on_cpu(value).unwrap();

        finish(&device);
    }

    #[test]
    fn test_cross_queue_gpu_wait() {
        let device = Arc::new(SoftwareDevice::new(ExecutionMode::Manual));
        let config = QueueConfig::with_capacity(2);
        let copy = CommandQueue::new(Arc::clone(&device), QueueKind::Copy, &config).unwrap();
        let direct = CommandQueue::new(Arc::clone(&device), QueueKind::Direct, &config).unwrap();

        let mut uploaded = GpuFence::new();
        assert!(matches!(
            direct.wait_on_gpu(&uploaded),
            Err(DistQueueError::InvalidArgument(_))
        ));

        // 拷贝队列的 signal 还没执行，图形队列的工作被挡住
        copy.signal_on_gpu(&mut uploaded).unwrap();
        direct.wait_on_gpu(&uploaded).unwrap();
        let mut drawn = GpuFence::new();
        direct.signal_on_gpu(&mut drawn).unwrap();
        assert_eq!(uploaded.queue_id(), Some(copy.id()));

        assert!(!drawn.is_signaled().unwrap());
        device.run_until_idle();
        assert!(uploaded.is_signaled().unwrap());
        assert!(drawn.is_signaled().unwrap());

        finish(&device);
    }
}
