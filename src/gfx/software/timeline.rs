//! 模拟的 GPU 时间线
//!
//! 每个队列是一条按提交顺序执行的操作序列（执行命令列表、signal、wait）。
//! `Immediate` 模式下每次提交后立即推进；`Manual` 模式下只有调用
//! [`Timeline::step`] / [`Timeline::run_until_idle`] 时才推进，
//! 测试由此精确控制 Fence 何时完成。切回 `Immediate` 会立即执行所有积压的操作。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::core::config::ExecutionMode;
use super::RecordedCommand;

/// Fence 在模拟 GPU 上的完成值
#[derive(Debug, Default)]
pub(crate) struct FenceCell {
    completed: AtomicU64,
}

impl FenceCell {
    pub(crate) fn new(initial_value: u64) -> Self {
        Self {
            completed: AtomicU64::new(initial_value),
        }
    }

    pub(crate) fn load(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }
}

/// 命令分配器被在途命令列表引用的次数
#[derive(Debug, Default)]
pub(crate) struct AllocatorUsage {
    pending: AtomicUsize,
}

impl AllocatorUsage {
    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

/// 已在模拟 GPU 上执行完毕的命令列表
#[derive(Debug, Clone)]
pub struct ExecutedList {
    /// 提交所在的队列序号
    pub queue: usize,
    /// 命令列表 ID
    pub list_id: u64,
    /// 记录的命令
    pub commands: Vec<RecordedCommand>,
}

pub(crate) enum GpuOp {
    Execute {
        list_id: u64,
        commands: Vec<RecordedCommand>,
        allocator: Arc<AllocatorUsage>,
    },
    Signal {
        fence: Arc<FenceCell>,
        value: u64,
    },
    Wait {
        fence: Arc<FenceCell>,
        value: u64,
    },
}

struct TimelineState {
    mode: ExecutionMode,
    queues: Vec<VecDeque<GpuOp>>,
    executed: Vec<ExecutedList>,
    violations: Vec<String>,
}

pub(crate) struct Timeline {
    state: Mutex<TimelineState>,
    completion: Condvar,
}

impl Timeline {
    pub(crate) fn new(mode: ExecutionMode) -> Self {
        Self {
            state: Mutex::new(TimelineState {
                mode,
                queues: Vec::new(),
                executed: Vec::new(),
                violations: Vec::new(),
            }),
            completion: Condvar::new(),
        }
    }

    pub(crate) fn mode(&self) -> ExecutionMode {
        self.state.lock().mode
    }

    pub(crate) fn set_mode(&self, mode: ExecutionMode) {
        let mut state = self.state.lock();
        state.mode = mode;
        if mode == ExecutionMode::Immediate {
            self.pump(&mut state, usize::MAX);
        }
    }

    /// 注册一条新的队列，返回队列序号
    pub(crate) fn register_queue(&self) -> usize {
        let mut state = self.state.lock();
        state.queues.push(VecDeque::new());
        state.queues.len() - 1
    }

    pub(crate) fn submit(&self, queue: usize, op: GpuOp) {
        let mut state = self.state.lock();
        if let GpuOp::Execute { allocator, .. } = &op {
            allocator.pending.fetch_add(1, Ordering::AcqRel);
        }
        state.queues[queue].push_back(op);

        if state.mode == ExecutionMode::Immediate {
            self.pump(&mut state, usize::MAX);
        }
    }

    /// 执行一个可执行的操作，没有可执行的操作时返回 `false`
    pub(crate) fn step(&self) -> bool {
        let mut state = self.state.lock();
        self.pump(&mut state, 1) == 1
    }

    /// 一直执行到所有队列为空或全部阻塞在 GPU wait 上，返回执行的操作数
    pub(crate) fn run_until_idle(&self) -> usize {
        let mut state = self.state.lock();
        self.pump(&mut state, usize::MAX)
    }

    pub(crate) fn pending_ops(&self) -> usize {
        self.state.lock().queues.iter().map(VecDeque::len).sum()
    }

    pub(crate) fn executed(&self) -> Vec<ExecutedList> {
        self.state.lock().executed.clone()
    }

    pub(crate) fn record_violation(&self, message: String) {
        tracing::error!(target: "dist_queue::software", %message, "GPU usage violation");
        self.state.lock().violations.push(message);
    }

    pub(crate) fn violations(&self) -> Vec<String> {
        self.state.lock().violations.clone()
    }

    /// 阻塞直到 `fence` 达到 `value`
    pub(crate) fn wait(&self, fence: &FenceCell, value: u64) {
        let mut state = self.state.lock();
        while fence.load() < value {
            self.completion.wait(&mut state);
        }
    }

    /// 带超时的阻塞等待
    pub(crate) fn wait_timeout(&self, fence: &FenceCell, value: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while fence.load() < value {
            if self.completion.wait_until(&mut state, deadline).timed_out() {
                return fence.load() >= value;
            }
        }
        true
    }

    fn pump(&self, state: &mut TimelineState, budget: usize) -> usize {
        let mut processed = 0;
        let mut signaled = false;

        'outer: loop {
            let mut progress = false;
            for queue in 0..state.queues.len() {
                while processed < budget {
                    let runnable = match state.queues[queue].front() {
                        Some(GpuOp::Wait { fence, value }) => fence.load() >= *value,
                        Some(_) => true,
                        None => false,
                    };
                    if !runnable {
                        break;
                    }
                    let Some(op) = state.queues[queue].pop_front() else {
                        break;
                    };

                    match op {
                        GpuOp::Execute { list_id, commands, allocator } => {
                            allocator.pending.fetch_sub(1, Ordering::AcqRel);
                            trace!(queue, list_id, commands = commands.len(), "GPU executed command list");
                            state.executed.push(ExecutedList { queue, list_id, commands });
                        }
                        GpuOp::Signal { fence, value } => {
                            fence.completed.store(value, Ordering::Release);
                            trace!(queue, value, "GPU signaled fence");
                            signaled = true;
                        }
                        GpuOp::Wait { .. } => {}
                    }

                    processed += 1;
                    progress = true;
                }
                if processed >= budget {
                    break 'outer;
                }
            }
            if !progress {
                break;
            }
        }

        if signaled {
            self.completion.notify_all();
        }
        processed
    }
}
