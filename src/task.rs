// 该文件是 Biaozhu （标注） 项目的一部分。
// src/task.rs - 后台推理线程
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{
  Arc,
  atomic::{AtomicU64, Ordering},
  mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError},
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use image::RgbImage;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
  catalog::ClassSelection,
  model::Model,
  pipeline::{PipelineError, Progress, annotate, preview_one},
};

/// 连续预览请求的合并窗口
pub const PREVIEW_DEBOUNCE: Duration = Duration::from_millis(150);

#[derive(Error, Debug)]
pub enum WorkerError {
  #[error("后台推理线程已退出")]
  Disconnected,
}

/// 一次批量标注任务，提交时即固定全部参数
#[derive(Debug, Clone)]
pub struct BatchJob {
  pub image_dir: PathBuf,
  pub label_dir: PathBuf,
  pub confidence: f32,
  pub selection: Option<ClassSelection>,
}

#[derive(Debug, Clone)]
pub struct PreviewJob {
  pub image: PathBuf,
  pub confidence: f32,
  pub selection: Option<ClassSelection>,
}

enum Job {
  Batch(BatchJob),
  Preview { generation: u64, job: PreviewJob },
}

#[derive(Debug)]
pub enum WorkerEvent {
  Progress(Progress),
  BatchFinished {
    processed: usize,
    total: usize,
    skipped: usize,
  },
  BatchFailed(PipelineError),
  PreviewReady {
    generation: u64,
    image: PathBuf,
    preview: Option<RgbImage>,
  },
  PreviewFailed {
    generation: u64,
    image: PathBuf,
    error: PipelineError,
  },
}

impl WorkerEvent {
  fn generation(&self) -> Option<u64> {
    match self {
      WorkerEvent::PreviewReady { generation, .. } | WorkerEvent::PreviewFailed { generation, .. } => {
        Some(*generation)
      }
      _ => None,
    }
  }
}

/// 持有模型的唯一后台线程。
///
/// 所有推理（批量或预览）都在这个线程上串行执行；结果以 [`WorkerEvent`] 消息返回。
/// 预览遵循"最新请求优先"：每次请求递增代数，过期代数的结果会被丢弃。
pub struct Worker {
  jobs: Option<Sender<Job>>,
  events: Receiver<WorkerEvent>,
  generation: Arc<AtomicU64>,
  handle: Option<JoinHandle<()>>,
}

impl Worker {
  pub fn spawn<M: Model + Send + 'static>(model: M) -> Self {
    Self::with_debounce(model, PREVIEW_DEBOUNCE)
  }

  pub fn with_debounce<M: Model + Send + 'static>(model: M, debounce: Duration) -> Self {
    let (job_tx, job_rx) = mpsc::channel();
    let (event_tx, event_rx) = mpsc::channel();
    let generation = Arc::new(AtomicU64::new(0));

    let current = generation.clone();
    let handle = thread::spawn(move || {
      WorkerLoop {
        model,
        jobs: job_rx,
        events: event_tx,
        generation: current,
        debounce,
        pending: VecDeque::new(),
      }
      .run()
    });

    Self {
      jobs: Some(job_tx),
      events: event_rx,
      generation,
      handle: Some(handle),
    }
  }

  fn send(&self, job: Job) -> Result<(), WorkerError> {
    self
      .jobs
      .as_ref()
      .ok_or(WorkerError::Disconnected)?
      .send(job)
      .map_err(|_| WorkerError::Disconnected)
  }

  pub fn submit_batch(&self, job: BatchJob) -> Result<(), WorkerError> {
    info!(
      "提交批量标注: {} → {}",
      job.image_dir.display(),
      job.label_dir.display()
    );
    self.send(Job::Batch(job))
  }

  /// 请求预览，返回这次请求的代数
  pub fn request_preview(&self, job: PreviewJob) -> Result<u64, WorkerError> {
    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
    debug!("预览请求 #{}: {}", generation, job.image.display());
    self.send(Job::Preview { generation, job })?;
    Ok(generation)
  }

  pub fn current_generation(&self) -> u64 {
    self.generation.load(Ordering::SeqCst)
  }

  fn is_stale(&self, event: &WorkerEvent) -> bool {
    match event.generation() {
      Some(generation) if generation != self.current_generation() => {
        debug!("丢弃过期的预览结果 #{}", generation);
        true
      }
      _ => false,
    }
  }

  /// 阻塞等待下一个事件；后台线程退出后返回 `None`
  pub fn recv(&self) -> Option<WorkerEvent> {
    loop {
      let event = self.events.recv().ok()?;
      if !self.is_stale(&event) {
        return Some(event);
      }
    }
  }

  pub fn recv_timeout(&self, timeout: Duration) -> Option<WorkerEvent> {
    let deadline = Instant::now() + timeout;
    loop {
      let left = deadline.saturating_duration_since(Instant::now());
      let event = self.events.recv_timeout(left).ok()?;
      if !self.is_stale(&event) {
        return Some(event);
      }
    }
  }

  /// 不阻塞地取出一个事件
  pub fn try_recv(&self) -> Option<WorkerEvent> {
    loop {
      let event = match self.events.try_recv() {
        Ok(event) => event,
        Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return None,
      };
      if !self.is_stale(&event) {
        return Some(event);
      }
    }
  }
}

impl Drop for Worker {
  fn drop(&mut self) {
    // 关闭任务通道，后台线程处理完已提交的任务后退出
    self.jobs.take();
    if let Some(handle) = self.handle.take()
      && handle.join().is_err()
    {
      error!("后台推理线程异常退出");
    }
  }
}

struct WorkerLoop<M> {
  model: M,
  jobs: Receiver<Job>,
  events: Sender<WorkerEvent>,
  generation: Arc<AtomicU64>,
  debounce: Duration,
  pending: VecDeque<Job>,
}

impl<M: Model> WorkerLoop<M> {
  fn run(mut self) {
    info!("后台推理线程启动");
    loop {
      let job = match self.pending.pop_front() {
        Some(job) => job,
        None => match self.jobs.recv() {
          Ok(job) => job,
          Err(_) => break,
        },
      };
      let delivered = match job {
        Job::Batch(batch) => self.run_batch(batch),
        Job::Preview { generation, job } => {
          let (generation, job) = self.coalesce_previews(generation, job);
          self.run_preview(generation, job)
        }
      };
      if !delivered {
        warn!("事件接收方已关闭，停止后台线程");
        break;
      }
    }
    info!("后台推理线程退出");
  }

  // 等待窗口内没有新的预览请求为止，期间到达的批量任务排队
  fn coalesce_previews(&mut self, mut generation: u64, mut job: PreviewJob) -> (u64, PreviewJob) {
    let mut deadline = Instant::now() + self.debounce;
    loop {
      let left = deadline.saturating_duration_since(Instant::now());
      if left.is_zero() {
        break;
      }
      match self.jobs.recv_timeout(left) {
        Ok(Job::Preview {
          generation: newer,
          job: newer_job,
        }) => {
          debug!("合并预览请求 #{} → #{}", generation, newer);
          generation = newer;
          job = newer_job;
          deadline = Instant::now() + self.debounce;
        }
        Ok(other) => self.pending.push_back(other),
        Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
      }
    }
    (generation, job)
  }

  fn run_preview(&self, generation: u64, job: PreviewJob) -> bool {
    if generation != self.generation.load(Ordering::SeqCst) {
      debug!("预览请求 #{} 已过期，跳过推理", generation);
      return true;
    }
    let event = match preview_one(
      &self.model,
      &job.image,
      job.confidence,
      job.selection.as_ref(),
    ) {
      Ok(preview) => WorkerEvent::PreviewReady {
        generation,
        image: job.image,
        preview,
      },
      Err(error) => {
        error!("预览失败: {}", error);
        WorkerEvent::PreviewFailed {
          generation,
          image: job.image,
          error,
        }
      }
    };
    self.events.send(event).is_ok()
  }

  fn run_batch(&self, job: BatchJob) -> bool {
    let mut annotate = match annotate(
      &self.model,
      &job.image_dir,
      &job.label_dir,
      job.confidence,
      job.selection,
    ) {
      Ok(annotate) => annotate,
      Err(e) => {
        error!("批量标注准备失败: {}", e);
        return self.events.send(WorkerEvent::BatchFailed(e)).is_ok();
      }
    };

    for step in annotate.by_ref() {
      match step {
        Ok(progress) => {
          info!("进度: {}/{}", progress.processed, progress.total);
          if self.events.send(WorkerEvent::Progress(progress)).is_err() {
            return false;
          }
        }
        Err(e) => {
          error!("批量标注中止: {}", e);
          return self.events.send(WorkerEvent::BatchFailed(e)).is_ok();
        }
      }
    }

    info!(
      "批量标注完成: 处理 {} 张，跳过 {} 张",
      annotate.processed(),
      annotate.skipped()
    );
    self
      .events
      .send(WorkerEvent::BatchFinished {
        processed: annotate.processed(),
        total: annotate.total(),
        skipped: annotate.skipped(),
      })
      .is_ok()
  }
}
