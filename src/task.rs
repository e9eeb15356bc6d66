// 该文件是 Jingtou （镜头） 项目的一部分。
// src/task.rs - 逐帧驱动任务
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

use std::{
  sync::mpsc,
  thread,
  time::{Duration, Instant},
};

use anyhow::Context;
use tracing::{debug, info, warn};

use crate::{
  buffer::{BufferDescriptor, NativeBuffer},
  native::NativeAnalyzer,
  orchestrator::{Orchestrator, Submission},
};

const SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(1);

pub trait Task<I, A: NativeAnalyzer + 'static>: Sized {
  type Error;
  fn run_task(self, input: I, orchestrator: &Orchestrator<A>) -> Result<TaskSummary, Self::Error>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskSummary {
  pub frames: usize,
  pub accepted: usize,
  pub dropped: usize,
  /// 结束时仍有请求在途
  pub unsettled: bool,
}

/// 等待在途请求结束，超过 `limit` 返回 false
fn wait_settled<A: NativeAnalyzer + 'static>(
  orchestrator: &Orchestrator<A>,
  limit: Duration,
) -> bool {
  let start = Instant::now();
  while orchestrator.is_in_progress() {
    if start.elapsed() >= limit {
      return false;
    }
    thread::sleep(SETTLE_POLL_INTERVAL);
  }
  true
}

/// 只提交第一帧，并等待其结果
#[derive(Debug)]
pub struct OneShotTask {
  wait: Duration,
}

impl Default for OneShotTask {
  fn default() -> Self {
    Self {
      wait: Duration::from_secs(5),
    }
  }
}

impl OneShotTask {
  pub fn with_wait(mut self, wait: Duration) -> Self {
    self.wait = wait;
    self
  }
}

impl<F, I, A> Task<I, A> for OneShotTask
where
  F: NativeBuffer,
  I: Iterator<Item = F>,
  A: NativeAnalyzer + 'static,
{
  type Error = anyhow::Error;

  fn run_task(
    self,
    mut input: I,
    orchestrator: &Orchestrator<A>,
  ) -> Result<TaskSummary, Self::Error> {
    info!("开始任务...");
    let frame = input.next().ok_or_else(|| anyhow::anyhow!("没有输入帧"))?;
    let now = Instant::now();
    let submission = orchestrator.evaluate(BufferDescriptor::borrow(&frame))?;
    let settled = wait_settled(orchestrator, self.wait);
    info!("分析完成，耗时: {:.2?}", now.elapsed());

    Ok(TaskSummary {
      frames: 1,
      accepted: usize::from(submission.is_accepted()),
      dropped: usize::from(!submission.is_accepted()),
      unsettled: !settled,
    })
  }
}

/// 逐帧提交，在途期间的帧被丢弃
#[derive(Default, Debug)]
pub struct ContinuousTask {
  frame_number: Option<usize>,
  frame_interval: Option<Duration>,
  settle: Option<Duration>,
  interruptible: bool,
}

impl ContinuousTask {
  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }

  /// 模拟相机帧间隔
  pub fn with_frame_interval(mut self, frame_interval: Option<Duration>) -> Self {
    self.frame_interval = frame_interval;
    self
  }

  /// 输入结束后等待最后一个请求完成的时长
  pub fn with_settle(mut self, settle: Option<Duration>) -> Self {
    self.settle = settle;
    self
  }

  /// 响应 Ctrl-C，每个进程只能启用一次
  pub fn with_interrupt(mut self, interruptible: bool) -> Self {
    self.interruptible = interruptible;
    self
  }
}

impl<F, I, A> Task<I, A> for ContinuousTask
where
  F: NativeBuffer,
  I: Iterator<Item = F>,
  A: NativeAnalyzer + 'static,
{
  type Error = anyhow::Error;

  fn run_task(self, input: I, orchestrator: &Orchestrator<A>) -> Result<TaskSummary, Self::Error> {
    info!("开始任务...");
    let (tx, rx) = mpsc::channel();

    if self.interruptible {
      ctrlc::set_handler(move || {
        info!("收到中断信号，准备退出...");
        let _ = tx.send(());
      })
      .context("无法设置 Ctrl-C 处理")?;
    }

    let mut summary = TaskSummary::default();
    for frame in input {
      let tick = Instant::now();
      summary.frames += 1;
      match orchestrator.evaluate(BufferDescriptor::borrow(&frame))? {
        Submission::Accepted(request) => {
          summary.accepted += 1;
          debug!("第 {} 帧已提交为请求 {}", summary.frames, request);
        }
        Submission::Dropped => summary.dropped += 1,
      }
      // 帧在此处释放，原生端不得继续持有

      if self.frame_number.is_some_and(|n| summary.frames >= n) {
        info!("达到指定帧数 {}, 退出任务循环", summary.frames);
        break;
      }
      if rx.try_recv().is_ok() {
        warn!("中断信号接收，退出任务循环");
        break;
      }
      if let Some(interval) = self.frame_interval {
        let elapsed = tick.elapsed();
        if elapsed < interval {
          thread::sleep(interval - elapsed);
        }
      }
    }

    if let Some(settle) = self.settle {
      summary.unsettled = !wait_settled(orchestrator, settle);
    } else {
      summary.unsettled = orchestrator.is_in_progress();
    }

    info!(
      "任务完成: {} 帧, 提交 {}, 丢弃 {}",
      summary.frames, summary.accepted, summary.dropped
    );
    Ok(summary)
  }
}
