//! DistQueue - 命令提交演示程序
//!
//! 在配置的后端上创建设备上下文，多个线程并发地向同一个图形队列提交命令列表，
//! 拷贝队列上传数据并通过 GpuFence 让图形队列在 GPU 上等待，最后输出队列统计信息。
//!
//! # 使用方法
//!
//! ```bash
//! # 使用配置文件
//! cargo run
//!
//! # 使用 software 后端，每个队列最多 16 个命令列表
//! cargo run -- --software --max-command-lists 16
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use tracing::{info, warn};

use dist_queue::core::config::{BackendKind, Config, ExecutionMode};
use dist_queue::core::log;
use dist_queue::core::DistQueueError;
use dist_queue::gfx::backend::Device;
use dist_queue::gfx::software::SoftwareBuffer;
use dist_queue::gfx::SoftwareDevice;
use dist_queue::renderer::resource::ResourceState;
use dist_queue::renderer::{CommandQueue, Context, GpuFence};

const SUBMIT_THREADS: usize = 4;
const LISTS_PER_THREAD: usize = 64;
const UPLOAD_SIZE: u64 = 64 * 1024;

fn main() -> Result<()> {
    // 1. 加载配置（在初始化日志之前）
    let mut config = Config::from_file_or_default("config.toml");
    config.apply_args(std::env::args());
    config.validate().context("Invalid configuration")?;

    // 2. 初始化日志系统
    let log_file = config
        .logging
        .file_output
        .then_some(config.logging.log_file.as_str());
    log::init_logger(config.logging.level, config.logging.file_output, log_file);
    info!(version = env!("CARGO_PKG_VERSION"), "DistQueue starting...");
    info!(
        backend = config.device.backend.name(),
        max_command_lists = config.queues.max_command_lists,
        abandon_policy = ?config.queues.abandon_policy,
        "Queue configuration"
    );

    // 3. 按后端运行
    match config.device.backend {
        BackendKind::Software => run_software(&config),
        #[cfg(target_os = "windows")]
        BackendKind::Dx12 => {
            let device = Arc::new(dist_queue::gfx::Dx12Device::new(config.device.debug_layer)?);
            let context = Context::new(device, &config.queues)?;
            submit_concurrently(context.present_queue())?;
            context.flush_all()?;
            report(&context);
            Ok(())
        }
        #[cfg(not(target_os = "windows"))]
        BackendKind::Dx12 => anyhow::bail!("DirectX 12 backend is only available on Windows"),
    }
}

fn run_software(config: &Config) -> Result<()> {
    let device = Arc::new(SoftwareDevice::new(config.device.execution));
    let context = Context::new(Arc::clone(&device), &config.queues)?;

    // Manual 模式下由一个线程扮演 GPU
    let running = Arc::new(AtomicBool::new(true));
    let gpu = (device.mode() == ExecutionMode::Manual).then(|| {
        let device = Arc::clone(&device);
        let running = Arc::clone(&running);
        thread::spawn(move || {
            while running.load(Ordering::Acquire) {
                if device.run_until_idle() == 0 {
                    thread::sleep(Duration::from_micros(200));
                }
            }
        })
    });

    upload_then_draw(&context)?;
    submit_concurrently(context.present_queue())?;
    context.flush_all()?;
    report(&context);

    running.store(false, Ordering::Release);
    if let Some(gpu) = gpu {
        // 剩余工作在切换到 Immediate 时执行完
        let joined = join_gpu_pump(gpu);
        device.set_mode(ExecutionMode::Immediate);
        joined?;
    }

    let violations = device.violations();
    if !violations.is_empty() {
        anyhow::bail!("GPU usage violations detected: {:?}", violations);
    }
    info!(
        executed = device.executed_lists().len(),
        allocators = device.allocators_created(),
        "Software device finished"
    );
    Ok(())
}

/// 等待 GPU 线程退出，线程 panic 时返回错误
fn join_gpu_pump(gpu: thread::JoinHandle<()>) -> Result<()> {
    gpu.join()
        .map_err(|_| anyhow::anyhow!("GPU pump thread panicked"))
}

/// 在拷贝队列上传数据，图形队列在 GPU 上等待上传完成后再使用
fn upload_then_draw(context: &Context<SoftwareDevice>) -> Result<()> {
    let Some(copy_queue) = context.copy_queue() else {
        warn!("Copy queue disabled, skipping upload");
        return Ok(());
    };

    let staging = SoftwareBuffer::new(UPLOAD_SIZE);
    let vertices = SoftwareBuffer::new(UPLOAD_SIZE);

    let mut upload = copy_queue.begin_command_list_recording()?;
    upload.copy_buffer_to_buffer(&vertices, 0, &staging, 0, UPLOAD_SIZE)?;
    upload.transition(
        &vertices,
        ResourceState::CopyDest,
        ResourceState::VertexAndConstantBuffer,
    )?;
    copy_queue.execute_command_list(upload)?;

    let mut uploaded = GpuFence::new();
    copy_queue.signal_on_gpu(&mut uploaded)?;
    context.present_queue().wait_on_gpu(&uploaded)?;

    uploaded.wait_on_cpu_blocking()?;
    info!(bytes = UPLOAD_SIZE, "Upload complete");
    Ok(())
}

/// 多个线程并发提交，池耗尽时 flush 后重试
fn submit_concurrently<D: Device>(queue: &CommandQueue<D>) -> Result<()> {
    let start = Instant::now();

    thread::scope(|scope| -> Result<()> {
        let workers: Vec<_> = (0..SUBMIT_THREADS)
            .map(|_| {
                scope.spawn(|| -> Result<usize> {
                    let mut retries = 0;
                    for _ in 0..LISTS_PER_THREAD {
                        let list = loop {
                            match queue.begin_command_list_recording() {
                                Ok(list) => break list,
                                Err(DistQueueError::OutOfCommandLists) => {
                                    retries += 1;
                                    queue.flush()?;
                                }
                                Err(err) => return Err(err.into()),
                            }
                        };
                        queue.execute_command_list(list)?;
                    }
                    Ok(retries)
                })
            })
            .collect();

        let mut retries = 0;
        for worker in workers {
            retries += worker
                .join()
                .map_err(|_| anyhow::anyhow!("submit thread panicked"))??;
        }
        info!(
            threads = SUBMIT_THREADS,
            lists = SUBMIT_THREADS * LISTS_PER_THREAD,
            retries,
            elapsed = ?start.elapsed(),
            "Concurrent submission finished"
        );
        Ok(())
    })
}

fn report<D: Device>(context: &Context<D>) {
    let queues = std::iter::once(context.present_queue()).chain(context.copy_queue());
    for queue in queues {
        let stats = queue.stats();
        info!(
            queue = queue.id(),
            kind = queue.kind().name(),
            last_signaled = queue.last_signaled_value(),
            capacity = stats.capacity,
            live = stats.live,
            in_flight = stats.in_flight,
            created = stats.created,
            "Queue statistics"
        );
    }
}
