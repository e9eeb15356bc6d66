// 该文件是 Jingtou （镜头） 项目的一部分。
// src/native.rs - 原生分析器接口
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

use std::{fmt, sync::Weak};

use thiserror::Error;
use tracing::warn;

use crate::{
  buffer::{BufferDescriptor, BufferKind},
  observation::Point,
  request::AnalysisKind,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NativeError {
  #[error("原生资源分配失败: {0}")]
  Allocation(String),
  #[error("缓冲区句柄无效")]
  InvalidHandle,
  #[error("不支持的缓冲区类型: {0}")]
  UnsupportedBufferKind(BufferKind),
  #[error("分析器错误: {0}")]
  Analyzer(String),
  #[error("原生回调未被调用")]
  Abandoned,
}

/// 原生请求对象的分配句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocationHandle(pub u64);

/// 单个 evaluate 请求的编号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "#{}", self.0)
  }
}

/// 原生分析器返回的原始结果
#[derive(Debug, Clone, PartialEq)]
pub enum RawOutput {
  Classifications {
    labels: Vec<String>,
    confidences: Vec<f32>,
  },
  Points(Vec<Point>),
}

impl RawOutput {
  pub fn classifications<S: Into<String>>(items: impl IntoIterator<Item = (S, f32)>) -> Self {
    let (labels, confidences) = items
      .into_iter()
      .map(|(label, confidence)| (label.into(), confidence))
      .unzip();
    RawOutput::Classifications {
      labels,
      confidences,
    }
  }

  pub fn points(points: impl IntoIterator<Item = [f32; 2]>) -> Self {
    RawOutput::Points(points.into_iter().map(Point::from).collect())
  }

  pub fn describe(&self) -> &'static str {
    match self {
      RawOutput::Classifications { .. } => "分类",
      RawOutput::Points(_) => "矩形点",
    }
  }
}

pub type NativeOutcome = Result<RawOutput, NativeError>;

/// 原生视觉分析器
///
/// `evaluate` 必须立即返回，结果稍后通过 `completion` 送达，且只送达一次。
pub trait NativeAnalyzer: Send + Sync {
  fn supports(&self, _kind: AnalysisKind) -> bool {
    true
  }

  fn configure(
    &self,
    kind: AnalysisKind,
    max_observations: u32,
  ) -> Result<AllocationHandle, NativeError>;

  fn evaluate(
    &self,
    allocation: AllocationHandle,
    buffer: BufferDescriptor<'_>,
    completion: Completion,
  );

  fn release(&self, _allocation: AllocationHandle) {}

  /// 超时后调用，之后该请求的回调会被忽略
  fn cancel(&self, _request: RequestId) {}
}

pub(crate) trait CompletionSink: Send + Sync {
  fn resolve(&self, request: RequestId, outcome: NativeOutcome);
}

/// 原生回调令牌，只能使用一次
///
/// 未调用就被丢弃时，请求以 [`NativeError::Abandoned`] 结束。
pub struct Completion {
  request: RequestId,
  sink: Option<Weak<dyn CompletionSink>>,
}

impl Completion {
  pub(crate) fn new(request: RequestId, sink: Weak<dyn CompletionSink>) -> Self {
    Self {
      request,
      sink: Some(sink),
    }
  }

  pub fn request_id(&self) -> RequestId {
    self.request
  }

  pub fn complete(mut self, outcome: NativeOutcome) {
    self.deliver(outcome);
  }

  pub fn succeed(self, output: RawOutput) {
    self.complete(Ok(output));
  }

  pub fn fail(self, error: NativeError) {
    self.complete(Err(error));
  }

  /// 丢弃令牌且不回调
  pub(crate) fn discard(mut self) {
    self.sink = None;
  }

  fn deliver(&mut self, outcome: NativeOutcome) {
    let Some(sink) = self.sink.take() else {
      return;
    };
    match sink.upgrade() {
      Some(sink) => sink.resolve(self.request, outcome),
      None => warn!("请求 {} 完成时编排器已释放", self.request),
    }
  }
}

impl fmt::Debug for Completion {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Completion")
      .field("request", &self.request)
      .field("pending", &self.sink.is_some())
      .finish()
  }
}

impl Drop for Completion {
  fn drop(&mut self) {
    if self.sink.is_some() {
      warn!("请求 {} 的回调令牌未使用即被丢弃", self.request);
      self.deliver(Err(NativeError::Abandoned));
    }
  }
}

mod replay;
pub use self::replay::{ReplayAnalyzer, ReplayError, ReplayScript, ScriptedOutcome};
