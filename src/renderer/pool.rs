//! 命令记录器池
//!
//! 固定容量的记录器存储，加上一个按提交顺序排列的在途 FIFO。
//!
//! 记录器按槽位序号存放，每个槽位带显式状态：
//!
//! ```text
//! Free ──acquire──▶ Recording ──release──▶ Submitted ──(fence 完成后 acquire)──▶ Recording
//!   ▲                   │
//!   └────return_free────┘        任意状态 ──retire──▶ Retired（槽位可再次增长）
//! ```
//!
//! fence 值按提交顺序单调分配，GPU 也按提交顺序执行，所以 FIFO 队首总是最早完成的，
//! `acquire` 只需检查队首：队首未完成时后面的也不可能完成。

use std::collections::VecDeque;

use tracing::{trace, warn};

use crate::core::error::{DistQueueError, Result};
use crate::gfx::backend::{Device, QueueKind};
use crate::renderer::command::CommandRecorder;

/// 槽位状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    /// 空闲，可以直接重置复用
    Free,
    /// 已借出，正在记录
    Recording,
    /// 已提交给 GPU，等待 fence 完成
    Submitted,
    /// 原生对象已释放，槽位可用于创建新的记录器
    Retired,
}

struct RecorderSlot<D: Device> {
    state: RecorderState,
    completion_fence: u64,
    /// 借出或退役时为 `None`
    recorder: Option<CommandRecorder<D>>,
}

/// 池的统计信息
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// 最大记录器数量
    pub capacity: usize,
    /// 存活（未退役）的记录器数量
    pub live: usize,
    /// 在途记录器数量
    pub in_flight: usize,
    /// 已借出的记录器数量
    pub lent: usize,
    /// 空闲记录器数量
    pub free: usize,
    /// 累计创建的记录器数量
    pub created: u64,
}

/// 命令记录器池
pub struct CommandRecorderPool<D: Device> {
    kind: QueueKind,
    capacity: usize,
    slots: Vec<RecorderSlot<D>>,
    in_flight: VecDeque<usize>,
    free: Vec<usize>,
    created: u64,
}

impl<D: Device> CommandRecorderPool<D> {
    /// 创建空池，记录器按需创建
    pub fn new(kind: QueueKind, capacity: usize) -> Self {
        Self {
            kind,
            capacity,
            slots: Vec::new(),
            in_flight: VecDeque::new(),
            free: Vec::new(),
            created: 0,
        }
    }

    /// 最大记录器数量
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 存活的记录器数量
    pub fn live(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state != RecorderState::Retired)
            .count()
    }

    /// 在途记录器数量
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// 槽位状态
    pub fn state(&self, slot: usize) -> Option<RecorderState> {
        self.slots.get(slot).map(|slot| slot.state)
    }

    /// 统计信息
    pub fn stats(&self) -> PoolStats {
        let count = |state| self.slots.iter().filter(|slot| slot.state == state).count();
        PoolStats {
            capacity: self.capacity,
            live: self.live(),
            in_flight: self.in_flight.len(),
            lent: count(RecorderState::Recording),
            free: count(RecorderState::Free),
            created: self.created,
        }
    }

    /// 借出一个已打开的记录器
    ///
    /// 依次尝试：
    ///
    /// 1. FIFO 队首的 fence 已完成时回收它
    /// 2. 复用空闲的记录器
    /// 3. 未达到容量时创建新的记录器
    /// 4. 否则返回 `OutOfCommandLists`，从不阻塞等待 GPU
    ///
    /// 重置失败的记录器会被退役，错误原样返回。
    pub fn acquire(
        &mut self,
        device: &D,
        is_done: impl Fn(u64) -> bool,
    ) -> Result<CommandRecorder<D>> {
        if let Some(&front) = self.in_flight.front() {
            let value = self.slots[front].completion_fence;
            if is_done(value) {
                self.in_flight.pop_front();
                trace!(slot = front, value, "Reclaimed completed command recorder");
                return self.lend(front);
            }
        }

        if let Some(idx) = self.free.pop() {
            return self.lend(idx);
        }

        if self.live() < self.capacity {
            return self.grow(device);
        }

        warn!(
            capacity = self.capacity,
            in_flight = self.in_flight.len(),
            kind = self.kind.name(),
            "Command recorder pool exhausted"
        );
        Err(DistQueueError::OutOfCommandLists)
    }

    /// 提交成功后交还记录器，标记为 `value` 并加入 FIFO 队尾
    pub fn release(&mut self, mut recorder: CommandRecorder<D>, value: u64) {
        let idx = recorder.slot();
        debug_assert_eq!(self.slots[idx].state, RecorderState::Recording);
        debug_assert!(self
            .in_flight
            .back()
            .map_or(true, |&back| self.slots[back].completion_fence <= value));

        recorder.set_completion_fence(value);
        let slot = &mut self.slots[idx];
        slot.state = RecorderState::Submitted;
        slot.completion_fence = value;
        slot.recorder = Some(recorder);
        self.in_flight.push_back(idx);
    }

    /// 交还一个没有提交给 GPU 的记录器，它可以立即复用
    pub fn return_free(&mut self, recorder: CommandRecorder<D>) {
        let idx = recorder.slot();
        debug_assert_eq!(self.slots[idx].state, RecorderState::Recording);

        let slot = &mut self.slots[idx];
        slot.state = RecorderState::Free;
        slot.recorder = Some(recorder);
        self.free.push(idx);
    }

    /// 退役一个借出的记录器，释放其原生对象
    ///
    /// 只能用于没有被 GPU 引用的记录器。
    pub fn retire(&mut self, recorder: CommandRecorder<D>) {
        let idx = recorder.slot();
        debug_assert_eq!(self.slots[idx].state, RecorderState::Recording);
        self.retire_slot(idx);
        drop(recorder);
    }

    fn lend(&mut self, idx: usize) -> Result<CommandRecorder<D>> {
        let Some(mut recorder) = self.slots[idx].recorder.take() else {
            return Err(DistQueueError::invalid_state(format!(
                "command recorder slot {} holds no recorder",
                idx
            )));
        };

        if let Err(err) = recorder.begin() {
            self.retire_slot(idx);
            return Err(err);
        }
        self.slots[idx].state = RecorderState::Recording;
        Ok(recorder)
    }

    fn grow(&mut self, device: &D) -> Result<CommandRecorder<D>> {
        let idx = self
            .slots
            .iter()
            .position(|slot| slot.state == RecorderState::Retired)
            .unwrap_or(self.slots.len());

        let mut recorder = CommandRecorder::new(device, self.kind, idx)?;
        recorder.begin()?;
        self.created += 1;

        let slot = RecorderSlot {
            state: RecorderState::Recording,
            completion_fence: 0,
            recorder: None,
        };
        if idx == self.slots.len() {
            self.slots.push(slot);
        } else {
            self.slots[idx] = slot;
        }
        Ok(recorder)
    }

    fn retire_slot(&mut self, idx: usize) {
        warn!(slot = idx, kind = self.kind.name(), "Command recorder retired");
        let slot = &mut self.slots[idx];
        slot.state = RecorderState::Retired;
        slot.completion_fence = 0;
        slot.recorder = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::ExecutionMode;
    use crate::gfx::backend::NativeQueue;
    use crate::gfx::software::{FailurePoint, SoftwareDevice};
    use crate::renderer::sync::Fence;

    struct Harness {
        device: SoftwareDevice,
        queue: <SoftwareDevice as Device>::Queue,
        fence: Fence<SoftwareDevice>,
        pool: CommandRecorderPool<SoftwareDevice>,
    }

    impl Harness {
        fn new(capacity: usize) -> Self {
            let device = SoftwareDevice::new(ExecutionMode::Manual);
            let queue = device.create_command_queue(QueueKind::Direct).unwrap();
            let fence = Fence::new(&device).unwrap();
            Self {
                device,
                queue,
                fence,
                pool: CommandRecorderPool::new(QueueKind::Direct, capacity),
            }
        }

        fn acquire(&mut self) -> Result<CommandRecorder<SoftwareDevice>> {
            let fence = &self.fence;
            self.pool.acquire(&self.device, |value| fence.is_done(value))
        }

        fn submit(&mut self, mut recorder: CommandRecorder<SoftwareDevice>) -> u64 {
            recorder.close().unwrap();
            self.queue.execute_command_list(recorder.native()).unwrap();
            let value = self.fence.signal(&self.queue).unwrap();
            self.pool.release(recorder, value);
            value
        }

        fn check_invariant(&self) {
            assert!(self.pool.in_flight() <= self.pool.live());
            assert!(self.pool.live() <= self.pool.capacity());
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.device.run_until_idle();
        }
    }

    #[test]
    fn test_grows_until_capacity() {
        let mut h = Harness::new(3);
        let a = h.acquire().unwrap();
        let b = h.acquire().unwrap();
        let c = h.acquire().unwrap();
        h.check_invariant();

        assert!(matches!(h.acquire(), Err(DistQueueError::OutOfCommandLists)));
        assert_eq!(h.pool.stats().lent, 3);
        assert_eq!(h.device.allocators_created(), 3);

        for recorder in [a, b, c] {
            h.submit(recorder);
            h.check_invariant();
        }
        assert_eq!(h.pool.in_flight(), 3);
    }

    #[test]
    fn test_reclaims_fifo_front_only_when_done() {
        let mut h = Harness::new(2);
        let r1 = h.acquire().unwrap();
        let r1_slot = r1.slot();
        let v1 = h.submit(r1);
        let r2 = h.acquire().unwrap();
        let v2 = h.submit(r2);
        assert_eq!((v1, v2), (1, 2));

        assert!(matches!(h.acquire(), Err(DistQueueError::OutOfCommandLists)));

        // 执行 r1 和 signal 1，r2 仍在途
        h.device.step();
        h.device.step();
        assert!(h.fence.is_done(v1));
        assert!(!h.fence.is_done(v2));

        let reused = h.acquire().unwrap();
        assert_eq!(reused.slot(), r1_slot);
        assert_eq!(reused.completion_fence(), v1);
        assert_eq!(h.pool.state(r1_slot), Some(RecorderState::Recording));
        assert_eq!(h.pool.in_flight(), 1);
        assert_eq!(h.device.allocators_created(), 2);
        assert!(h.device.violations().is_empty());

        h.submit(reused);
    }

    #[test]
    fn test_free_recorder_is_reused_before_growing() {
        let mut h = Harness::new(4);
        let mut recorder = h.acquire().unwrap();
        let slot = recorder.slot();
        recorder.close().unwrap();
        h.pool.return_free(recorder);
        assert_eq!(h.pool.stats().free, 1);

        let again = h.acquire().unwrap();
        assert_eq!(again.slot(), slot);
        assert_eq!(h.pool.stats().created, 1);
        h.submit(again);
    }

    #[test]
    fn test_reset_failure_retires_slot() {
        let mut h = Harness::new(1);
        let recorder = h.acquire().unwrap();
        h.submit(recorder);
        h.device.run_until_idle();

        h.device.inject_failure(FailurePoint::AllocatorReset);
        let err = h.acquire().unwrap_err();
        assert!(matches!(err, DistQueueError::GenericDevice(_)));
        assert_eq!(h.pool.state(0), Some(RecorderState::Retired));
        assert_eq!(h.pool.live(), 0);
        assert_eq!(h.pool.in_flight(), 0);

        // 退役的槽位可以重新增长
        let fresh = h.acquire().unwrap();
        assert_eq!(fresh.slot(), 0);
        assert_eq!(h.pool.stats().created, 2);
        h.submit(fresh);
    }

    #[test]
    fn test_creation_failure_leaves_pool_unchanged() {
        let mut h = Harness::new(2);
        h.device.inject_failure(FailurePoint::CreateCommandList);
        assert!(matches!(h.acquire(), Err(DistQueueError::GenericDevice(_))));
        assert_eq!(h.pool.live(), 0);
        assert_eq!(h.pool.stats().created, 0);

        let recorder = h.acquire().unwrap();
        h.submit(recorder);
    }
}
