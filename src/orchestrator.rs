// 该文件是 Jingtou （镜头） 项目的一部分。
// src/orchestrator.rs - 视觉请求编排
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

//! # 请求编排
//!
//! 每个 [`Orchestrator`] 同一时间最多只有一个原生请求在途。
//! 在途期间到达的帧直接丢弃而不排队：相机每帧都会产生新的候选，
//! 而被复用的缓冲区在下一帧可能已被覆盖。
//!
//! 原生回调可能在任意线程到达，结果映射后在该线程上同步通知监听器。

use std::{
  sync::{
    Arc, Mutex, MutexGuard, Weak,
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
  },
  time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
  buffer::BufferDescriptor,
  mapper::{MalformedResultError, map_classifications, map_rectangles},
  native::{
    AllocationHandle, Completion, CompletionSink, NativeAnalyzer, NativeError, NativeOutcome,
    RawOutput, RequestId,
  },
  notify::{NotificationBus, PublishReport},
  observation::{self, Classification, Orientation, RectangleObservation},
  request::{AnalysisKind, ConfigurationError, RequestConfiguration},
};

mod watchdog;
use self::watchdog::{Expire, Watchdog};

#[derive(Error, Debug)]
pub enum ConfigureError {
  #[error("配置错误: {0}")]
  Configuration(#[from] ConfigurationError),
  #[error("原生资源分配失败: {0}")]
  NativeAllocation(#[source] NativeError),
  #[error("无法启动超时监视线程: {0}")]
  Watchdog(#[source] std::io::Error),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EvaluateError {
  #[error("尚未配置请求")]
  NotConfigured,
}

/// 通过失败通知送达的错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
  #[error("原生结果格式错误: {0}")]
  MalformedResult(#[from] MalformedResultError),
  #[error("原生分析失败: {0}")]
  NativeEvaluation(#[from] NativeError),
  #[error("原生分析超时 ({0:?})")]
  Timeout(Duration),
}

#[derive(Debug, Clone)]
pub struct ClassificationsCompleted {
  pub request: RequestId,
  pub observations: Vec<Classification>,
  pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RectanglesRecognized {
  pub request: RequestId,
  pub rectangles: Vec<RectangleObservation>,
  pub orientation: Orientation,
  pub completed_at: DateTime<Utc>,
}

impl RectanglesRecognized {
  pub fn largest(&self) -> Option<&RectangleObservation> {
    observation::largest(&self.rectangles)
  }
}

#[derive(Debug, Clone)]
pub struct EvaluationFailed {
  pub request: RequestId,
  pub error: EvaluationError,
  pub failed_at: DateTime<Utc>,
}

/// `evaluate` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
  Accepted(RequestId),
  /// 已有请求在途，本帧被丢弃
  Dropped,
}

impl Submission {
  pub fn is_accepted(&self) -> bool {
    matches!(self, Submission::Accepted(_))
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Diagnostics {
  pub accepted: usize,
  pub dropped: usize,
  pub completed: usize,
  pub failed: usize,
  pub timed_out: usize,
  pub listener_failures: usize,
}

#[derive(Default)]
struct Counters {
  accepted: AtomicUsize,
  dropped: AtomicUsize,
  completed: AtomicUsize,
  failed: AtomicUsize,
  timed_out: AtomicUsize,
  listener_failures: AtomicUsize,
}

fn bump(counter: &AtomicUsize) {
  counter.fetch_add(1, Ordering::Relaxed);
}

struct Active {
  config: RequestConfiguration,
  allocation: AllocationHandle,
}

struct Pending {
  request: RequestId,
  kind: AnalysisKind,
  max_observations: u32,
  orientation: Orientation,
  timeout: Option<Duration>,
  submitted_at: Instant,
}

#[derive(Default)]
struct State {
  active: Option<Active>,
  orientation: Orientation,
  pending: Option<Pending>,
  watchdog: Option<Watchdog>,
}

enum Mapped {
  Classifications(Vec<Classification>),
  Rectangles(Vec<RectangleObservation>),
}

struct Shared<A: NativeAnalyzer> {
  analyzer: A,
  in_flight: AtomicBool,
  next_request: AtomicU64,
  state: Mutex<State>,
  counters: Counters,
  classifications: NotificationBus<ClassificationsCompleted>,
  rectangles: NotificationBus<RectanglesRecognized>,
  failures: NotificationBus<EvaluationFailed>,
}

impl<A: NativeAnalyzer> Shared<A> {
  fn state(&self) -> MutexGuard<'_, State> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// 取出与 `request` 匹配的在途请求并清除在途标志
  fn take_pending(&self, request: RequestId) -> Option<Pending> {
    let mut state = self.state();
    if state.pending.as_ref().map(|p| p.request) != Some(request) {
      return None;
    }
    if let Some(watchdog) = state.watchdog.as_ref() {
      watchdog.disarm(request);
    }
    self.in_flight.store(false, Ordering::Release);
    state.pending.take()
  }

  fn map_output(&self, pending: &Pending, output: RawOutput) -> Result<Mapped, EvaluationError> {
    match (pending.kind, output) {
      (
        AnalysisKind::Classification,
        RawOutput::Classifications {
          labels,
          confidences,
        },
      ) => Ok(Mapped::Classifications(map_classifications(
        &labels,
        &confidences,
        pending.max_observations as usize,
      )?)),
      (AnalysisKind::RectangleDetection, RawOutput::Points(points)) => Ok(Mapped::Rectangles(
        map_rectangles(&points, pending.orientation)?,
      )),
      (kind, output) => Err(
        MalformedResultError::UnexpectedOutput {
          expected: match kind {
            AnalysisKind::Classification => "分类",
            AnalysisKind::RectangleDetection => "矩形点",
          },
          actual: output.describe(),
        }
        .into(),
      ),
    }
  }

  fn note_delivery(&self, report: PublishReport) {
    if !report.is_clean() {
      self
        .counters
        .listener_failures
        .fetch_add(report.failures.len(), Ordering::Relaxed);
    }
  }

  fn report_failure(&self, request: RequestId, error: EvaluationError) {
    warn!("请求 {} 失败: {}", request, error);
    let event = EvaluationFailed {
      request,
      error,
      failed_at: Utc::now(),
    };
    let report = self.failures.publish(&event);
    self.note_delivery(report);
  }
}

impl<A: NativeAnalyzer> CompletionSink for Shared<A> {
  fn resolve(&self, request: RequestId, outcome: NativeOutcome) {
    let Some(pending) = self.take_pending(request) else {
      warn!("忽略过期的原生回调 {}", request);
      return;
    };
    debug!(
      "请求 {} 完成, 耗时: {:.2?}",
      request,
      pending.submitted_at.elapsed()
    );

    let mapped = outcome
      .map_err(EvaluationError::from)
      .and_then(|output| self.map_output(&pending, output));

    match mapped {
      Ok(Mapped::Classifications(observations)) => {
        bump(&self.counters.completed);
        let event = ClassificationsCompleted {
          request,
          observations,
          completed_at: Utc::now(),
        };
        let report = self.classifications.publish(&event);
        self.note_delivery(report);
      }
      Ok(Mapped::Rectangles(rectangles)) => {
        bump(&self.counters.completed);
        let event = RectanglesRecognized {
          request,
          rectangles,
          orientation: pending.orientation,
          completed_at: Utc::now(),
        };
        let report = self.rectangles.publish(&event);
        self.note_delivery(report);
      }
      Err(error) => {
        bump(&self.counters.failed);
        self.report_failure(request, error);
      }
    }
  }
}

impl<A: NativeAnalyzer> Expire for Shared<A> {
  fn expire(&self, request: RequestId) {
    let Some(pending) = self.take_pending(request) else {
      return;
    };
    let waited = pending.submitted_at.elapsed();
    error!("请求 {} 超时, 已等待 {:.2?}", request, waited);
    self.analyzer.cancel(request);
    bump(&self.counters.timed_out);
    self.report_failure(
      request,
      EvaluationError::Timeout(pending.timeout.unwrap_or(waited)),
    );
  }
}

impl<A: NativeAnalyzer> Drop for Shared<A> {
  fn drop(&mut self) {
    let active = self
      .state
      .get_mut()
      .unwrap_or_else(|e| e.into_inner())
      .active
      .take();
    if let Some(active) = active {
      self.analyzer.release(active.allocation);
    }
  }
}

/// 视觉请求编排器
///
/// 调用方应当只从一个逐帧驱动的位置调用 [`Orchestrator::evaluate`]；
/// 回调线程与调用线程之间的同步由编排器负责。
pub struct Orchestrator<A: NativeAnalyzer + 'static> {
  shared: Arc<Shared<A>>,
}

impl<A: NativeAnalyzer + 'static> Clone for Orchestrator<A> {
  fn clone(&self) -> Self {
    Self {
      shared: Arc::clone(&self.shared),
    }
  }
}

impl<A: NativeAnalyzer + 'static> Orchestrator<A> {
  pub fn new(analyzer: A) -> Self {
    Self {
      shared: Arc::new(Shared {
        analyzer,
        in_flight: AtomicBool::new(false),
        next_request: AtomicU64::new(1),
        state: Mutex::new(State::default()),
        counters: Counters::default(),
        classifications: NotificationBus::new(),
        rectangles: NotificationBus::new(),
        failures: NotificationBus::new(),
      }),
    }
  }

  pub fn analyzer(&self) -> &A {
    &self.shared.analyzer
  }

  /// 分配（或重新分配）原生请求对象
  ///
  /// 失败时保留之前的配置。
  pub fn configure(&self, config: RequestConfiguration) -> Result<(), ConfigureError> {
    let shared = &self.shared;
    let kind = config.kind();
    if !shared.analyzer.supports(kind) {
      return Err(ConfigurationError::UnsupportedKind(kind.to_string()).into());
    }

    info!(
      "分配原生请求: {} (最大观测数 {})",
      kind,
      config.max_observations()
    );
    let allocation = shared
      .analyzer
      .configure(kind, config.max_observations())
      .map_err(|e| {
        error!("原生资源分配失败: {}", e);
        ConfigureError::NativeAllocation(e)
      })?;

    let previous = {
      let mut state = shared.state();
      if config.timeout().is_some() && state.watchdog.is_none() {
        let shared_weak: Weak<Shared<A>> = Arc::downgrade(shared);
        let sink: Weak<dyn Expire> = shared_weak;
        match Watchdog::spawn(sink) {
          Ok(watchdog) => state.watchdog = Some(watchdog),
          Err(e) => {
            drop(state);
            shared.analyzer.release(allocation);
            return Err(ConfigureError::Watchdog(e));
          }
        }
      }
      state.active.replace(Active { config, allocation })
    };

    if let Some(previous) = previous {
      debug!("释放之前的原生请求 {:?}", previous.allocation);
      shared.analyzer.release(previous.allocation);
    }
    Ok(())
  }

  pub fn configuration(&self) -> Option<RequestConfiguration> {
    self.shared.state().active.as_ref().map(|a| a.config)
  }

  pub fn is_in_progress(&self) -> bool {
    self.shared.in_flight.load(Ordering::Acquire)
  }

  /// 设备方向在提交时记录，用于该请求的坐标变换
  pub fn set_orientation(&self, orientation: Orientation) {
    self.shared.state().orientation = orientation;
  }

  pub fn orientation(&self) -> Orientation {
    self.shared.state().orientation
  }

  /// 提交一帧进行分析，不等待结果
  ///
  /// 已有请求在途时直接丢弃本帧并返回 [`Submission::Dropped`]。
  pub fn evaluate(&self, buffer: BufferDescriptor<'_>) -> Result<Submission, EvaluateError> {
    let shared = &self.shared;
    let (request, allocation) = {
      let mut state = shared.state();
      let Some(active) = state.active.as_ref() else {
        return Err(EvaluateError::NotConfigured);
      };

      if shared
        .in_flight
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
      {
        bump(&shared.counters.dropped);
        debug!("已有请求在途, 丢弃缓冲区 {}", buffer.handle());
        return Ok(Submission::Dropped);
      }

      let request = RequestId(shared.next_request.fetch_add(1, Ordering::Relaxed));
      let allocation = active.allocation;
      let kind = active.config.kind();
      let max_observations = active.config.max_observations();
      let timeout = active.config.timeout();
      let orientation = state.orientation;
      let submitted_at = Instant::now();

      if let (Some(timeout), Some(watchdog)) = (timeout, state.watchdog.as_ref()) {
        watchdog.arm(request, submitted_at + timeout);
      }
      state.pending = Some(Pending {
        request,
        kind,
        max_observations,
        orientation,
        timeout,
        submitted_at,
      });
      (request, allocation)
    };

    bump(&shared.counters.accepted);
    debug!(
      "提交请求 {}: 缓冲区 {} ({})",
      request,
      buffer.handle(),
      buffer.kind()
    );

    // 原生端可能在当前线程上同步回调，此处不能持有锁
    let shared_weak: Weak<Shared<A>> = Arc::downgrade(shared);
    let sink: Weak<dyn CompletionSink> = shared_weak;
    shared
      .analyzer
      .evaluate(allocation, buffer, Completion::new(request, sink));

    Ok(Submission::Accepted(request))
  }

  pub fn classifications(&self) -> &NotificationBus<ClassificationsCompleted> {
    &self.shared.classifications
  }

  pub fn rectangles(&self) -> &NotificationBus<RectanglesRecognized> {
    &self.shared.rectangles
  }

  pub fn failures(&self) -> &NotificationBus<EvaluationFailed> {
    &self.shared.failures
  }

  pub fn diagnostics(&self) -> Diagnostics {
    let c = &self.shared.counters;
    Diagnostics {
      accepted: c.accepted.load(Ordering::Relaxed),
      dropped: c.dropped.load(Ordering::Relaxed),
      completed: c.completed.load(Ordering::Relaxed),
      failed: c.failed.load(Ordering::Relaxed),
      timed_out: c.timed_out.load(Ordering::Relaxed),
      listener_failures: c.listener_failures.load(Ordering::Relaxed),
    }
  }
}
