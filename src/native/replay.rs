// 该文件是 Jingtou （镜头） 项目的一部分。
// src/native/replay.rs - 录制结果回放分析器
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

//! # 回放分析器
//!
//! 在宿主引擎之外运行编排器时，用录制好的原生结果代替真实的视觉框架。
//! 结果在独立的工作线程上按脚本顺序循环回放，与原生队列的行为一致：
//! `evaluate` 立即返回，回调稍后在另一个线程上到达。
//!
//! 脚本为 JSON 格式：
//!
//! ```json
//! {
//!   "latency_ms": 30,
//!   "outcomes": [
//!     { "points": [[0.1, 0.1], [0.9, 0.1], [0.9, 0.8], [0.1, 0.8]] },
//!     { "classifications": [["dog", 0.92], ["cat", 0.05]] },
//!     { "error": "analyzer busy" },
//!     "stall"
//!   ]
//! }
//! ```
//!
//! `stall` 表示该请求永远不会回调，用于验证超时处理。

use std::{
  collections::{HashMap, HashSet},
  path::Path,
  sync::{
    Arc, Mutex, MutexGuard,
    atomic::{AtomicU64, AtomicUsize, Ordering},
    mpsc::{self, Sender},
  },
  thread::{self, JoinHandle},
  time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  buffer::{BufferDescriptor, BufferKind},
  native::{AllocationHandle, Completion, NativeAnalyzer, NativeError, RawOutput, RequestId},
  request::AnalysisKind,
};

#[derive(Error, Debug)]
pub enum ReplayError {
  #[error("读取回放脚本失败: {0}")]
  Io(#[from] std::io::Error),
  #[error("回放脚本格式错误: {0}")]
  Json(#[from] serde_json::Error),
  #[error("回放脚本为空")]
  EmptyScript,
  #[error("无法启动回放线程: {0}")]
  Spawn(std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptedOutcome {
  Classifications(Vec<(String, f32)>),
  Points(Vec<[f32; 2]>),
  Error(String),
  Stall,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayScript {
  #[serde(default)]
  pub latency_ms: u64,
  pub outcomes: Vec<ScriptedOutcome>,
}

impl ReplayScript {
  pub fn from_json(json: &str) -> Result<Self, ReplayError> {
    let script: ReplayScript = serde_json::from_str(json)?;
    if script.outcomes.is_empty() {
      return Err(ReplayError::EmptyScript);
    }
    Ok(script)
  }

  pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ReplayError> {
    info!("加载回放脚本: {}", path.as_ref().display());
    let json = std::fs::read_to_string(path)?;
    Self::from_json(&json)
  }
}

struct Job {
  completion: Completion,
  outcome: ScriptedOutcome,
}

/// 回放线程与 `cancel` 共享的请求记录
#[derive(Default)]
struct Ledger {
  /// 已发送给回放线程但尚未取出的请求
  queued: HashSet<RequestId>,
  /// 在队列中时被取消的请求
  cancelled: HashSet<RequestId>,
  /// 按脚本挂起、等待取消的请求
  stalled: HashMap<RequestId, Completion>,
}

fn lock_ledger(ledger: &Mutex<Ledger>) -> MutexGuard<'_, Ledger> {
  ledger.lock().unwrap_or_else(|e| e.into_inner())
}

fn replay_job(ledger: &Mutex<Ledger>, job: Job) {
  let Job {
    completion,
    outcome,
  } = job;
  let request = completion.request_id();

  let mut guard = lock_ledger(ledger);
  guard.queued.remove(&request);
  if guard.cancelled.remove(&request) {
    drop(guard);
    debug!("请求 {} 已取消, 丢弃回放结果", request);
    completion.discard();
    return;
  }
  if outcome == ScriptedOutcome::Stall {
    debug!("请求 {} 按脚本挂起", request);
    guard.stalled.insert(request, completion);
    return;
  }
  drop(guard);

  match outcome {
    ScriptedOutcome::Classifications(items) => {
      completion.succeed(RawOutput::classifications(items))
    }
    ScriptedOutcome::Points(points) => completion.succeed(RawOutput::points(points)),
    ScriptedOutcome::Error(message) => completion.fail(NativeError::Analyzer(message)),
    ScriptedOutcome::Stall => {}
  }
}

pub struct ReplayAnalyzer {
  outcomes: Vec<ScriptedOutcome>,
  cursor: AtomicUsize,
  next_allocation: AtomicU64,
  rejected_kinds: HashSet<BufferKind>,
  ledger: Arc<Mutex<Ledger>>,
  sender: Mutex<Option<Sender<Job>>>,
  worker: Option<JoinHandle<()>>,
}

impl ReplayAnalyzer {
  pub fn new(script: ReplayScript) -> Result<Self, ReplayError> {
    if script.outcomes.is_empty() {
      return Err(ReplayError::EmptyScript);
    }

    let latency = Duration::from_millis(script.latency_ms);
    let ledger = Arc::new(Mutex::new(Ledger::default()));
    let (tx, rx) = mpsc::channel::<Job>();

    let worker_ledger = Arc::clone(&ledger);
    let worker = thread::Builder::new()
      .name("jingtou-replay".to_string())
      .spawn(move || {
        debug!("回放线程启动");
        for job in rx {
          if !latency.is_zero() {
            thread::sleep(latency);
          }
          replay_job(&worker_ledger, job);
        }
        // 挂起的请求不再回调
        let stalled: Vec<Completion> = lock_ledger(&worker_ledger)
          .stalled
          .drain()
          .map(|(_, completion)| completion)
          .collect();
        stalled.into_iter().for_each(Completion::discard);
        debug!("回放线程退出");
      })
      .map_err(ReplayError::Spawn)?;

    Ok(Self {
      outcomes: script.outcomes,
      cursor: AtomicUsize::new(0),
      next_allocation: AtomicU64::new(1),
      rejected_kinds: HashSet::new(),
      ledger,
      sender: Mutex::new(Some(tx)),
      worker: Some(worker),
    })
  }

  /// 模拟原生端拒绝某种缓冲区
  pub fn rejecting(mut self, kind: BufferKind) -> Self {
    self.rejected_kinds.insert(kind);
    self
  }

  fn next_outcome(&self) -> ScriptedOutcome {
    let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.outcomes.len();
    self.outcomes[index].clone()
  }
}

impl NativeAnalyzer for ReplayAnalyzer {
  fn configure(
    &self,
    kind: AnalysisKind,
    max_observations: u32,
  ) -> Result<AllocationHandle, NativeError> {
    let handle = AllocationHandle(self.next_allocation.fetch_add(1, Ordering::Relaxed));
    debug!(
      "回放分析器分配 {:?}: {} (最大观测数 {})",
      handle, kind, max_observations
    );
    Ok(handle)
  }

  fn evaluate(
    &self,
    allocation: AllocationHandle,
    buffer: BufferDescriptor<'_>,
    completion: Completion,
  ) {
    if self.rejected_kinds.contains(&buffer.kind()) {
      completion.fail(NativeError::UnsupportedBufferKind(buffer.kind()));
      return;
    }

    debug!(
      "回放请求 {} ({:?}, 缓冲区 {} {})",
      completion.request_id(),
      allocation,
      buffer.kind(),
      buffer.handle()
    );
    let request = completion.request_id();
    let job = Job {
      completion,
      outcome: self.next_outcome(),
    };
    lock_ledger(&self.ledger).queued.insert(request);
    let sender = self
      .sender
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .clone();
    match sender {
      Some(sender) => {
        if let Err(mpsc::SendError(job)) = sender.send(job) {
          lock_ledger(&self.ledger).queued.remove(&request);
          job.completion.fail(NativeError::Analyzer("回放线程已退出".to_string()));
        }
      }
      None => {
        lock_ledger(&self.ledger).queued.remove(&request);
        job
          .completion
          .fail(NativeError::Analyzer("回放分析器已关闭".to_string()));
      }
    }
  }

  fn release(&self, allocation: AllocationHandle) {
    debug!("回放分析器释放 {:?}", allocation);
  }

  /// 只记录仍在队列中的请求；已挂起的请求直接丢弃
  fn cancel(&self, request: RequestId) {
    let stalled = {
      let mut ledger = lock_ledger(&self.ledger);
      if ledger.queued.contains(&request) {
        ledger.cancelled.insert(request);
      }
      ledger.stalled.remove(&request)
    };
    if let Some(completion) = stalled {
      debug!("释放挂起的请求 {}", request);
      completion.discard();
    }
  }
}

impl Drop for ReplayAnalyzer {
  fn drop(&mut self) {
    self
      .sender
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .take();
    if let Some(worker) = self.worker.take() {
      // 最后一个引用可能在回放线程内释放
      if worker.thread().id() == thread::current().id() {
        return;
      }
      if worker.join().is_err() {
        warn!("回放线程异常退出");
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_script_json() {
    let script = ReplayScript::from_json(
      r#"{
        "latency_ms": 5,
        "outcomes": [
          { "points": [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]] },
          { "classifications": [["dog", 0.92]] },
          { "error": "busy" },
          "stall"
        ]
      }"#,
    )
    .unwrap();
    assert_eq!(script.latency_ms, 5);
    assert_eq!(script.outcomes.len(), 4);
    assert_eq!(
      script.outcomes[1],
      ScriptedOutcome::Classifications(vec![("dog".to_string(), 0.92)])
    );
    assert_eq!(script.outcomes[3], ScriptedOutcome::Stall);
  }

  #[test]
  fn empty_script_is_rejected() {
    assert!(matches!(
      ReplayScript::from_json(r#"{ "outcomes": [] }"#),
      Err(ReplayError::EmptyScript)
    ));
  }

  #[test]
  fn outcomes_cycle() {
    let analyzer = ReplayAnalyzer::new(ReplayScript {
      latency_ms: 0,
      outcomes: vec![ScriptedOutcome::Stall, ScriptedOutcome::Error("x".into())],
    })
    .unwrap();
    assert_eq!(analyzer.next_outcome(), ScriptedOutcome::Stall);
    assert_eq!(analyzer.next_outcome(), ScriptedOutcome::Error("x".into()));
    assert_eq!(analyzer.next_outcome(), ScriptedOutcome::Stall);
  }

  fn ledger_is_empty(analyzer: &ReplayAnalyzer) -> bool {
    let ledger = lock_ledger(&analyzer.ledger);
    ledger.queued.is_empty() && ledger.cancelled.is_empty() && ledger.stalled.is_empty()
  }

  fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let start = std::time::Instant::now();
    while !condition() {
      if start.elapsed() >= Duration::from_secs(2) {
        return false;
      }
      thread::sleep(Duration::from_millis(1));
    }
    true
  }

  #[test]
  fn timed_out_stalls_are_released() {
    use crate::{
      buffer::{BufferDescriptor, BufferHandle},
      orchestrator::Orchestrator,
      request::RequestConfiguration,
    };

    let analyzer = ReplayAnalyzer::new(ReplayScript {
      latency_ms: 0,
      outcomes: vec![ScriptedOutcome::Stall],
    })
    .unwrap();
    let orchestrator = Orchestrator::new(analyzer);
    orchestrator
      .configure(
        RequestConfiguration::rectangles(1)
          .unwrap()
          .with_timeout(Duration::from_millis(2))
          .unwrap(),
      )
      .unwrap();

    for round in 1..=20 {
      let frame = BufferDescriptor::new(
        BufferHandle::from_raw(round << 4).unwrap(),
        BufferKind::FrameBacked,
      );
      assert!(orchestrator.evaluate(frame).unwrap().is_accepted());
      assert!(wait_until(|| orchestrator.diagnostics().timed_out == round));
      assert!(wait_until(|| ledger_is_empty(orchestrator.analyzer())));
    }
    assert!(!orchestrator.is_in_progress());
  }

  #[test]
  fn cancel_of_finished_request_is_not_recorded() {
    let analyzer = ReplayAnalyzer::new(ReplayScript {
      latency_ms: 0,
      outcomes: vec![ScriptedOutcome::Error("busy".into())],
    })
    .unwrap();
    analyzer.cancel(RequestId(42));
    assert!(ledger_is_empty(&analyzer));
  }
}
