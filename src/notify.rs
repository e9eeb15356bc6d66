// 该文件是 Jingtou （镜头） 项目的一部分。
// src/notify.rs - 结果通知
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
  any::Any,
  panic::{AssertUnwindSafe, catch_unwind},
  sync::{Arc, Mutex},
};

use thiserror::Error;
use tracing::{debug, error};

pub type ListenerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// 事件监听器
pub trait Listener<E>: Send + Sync {
  fn notify(&self, event: &E) -> Result<(), ListenerError>;
}

impl<E, F> Listener<E> for F
where
  F: Fn(&E) -> Result<(), ListenerError> + Send + Sync,
{
  fn notify(&self, event: &E) -> Result<(), ListenerError> {
    self(event)
  }
}

#[derive(Error, Debug)]
pub enum ListenerFailure {
  #[error("监听器 {index} 返回错误: {source}")]
  Failed {
    index: usize,
    #[source]
    source: ListenerError,
  },
  #[error("监听器 {index} 发生 panic: {message}")]
  Panicked { index: usize, message: String },
}

/// 一次发布的投递情况
#[derive(Debug, Default)]
pub struct PublishReport {
  pub delivered: usize,
  pub failures: Vec<ListenerFailure>,
}

impl PublishReport {
  pub fn is_clean(&self) -> bool {
    self.failures.is_empty()
  }
}

/// 多订阅者通知总线
///
/// 以监听器的指针身份去重；发布时按订阅顺序同步调用。
pub struct NotificationBus<E> {
  listeners: Mutex<Vec<Arc<dyn Listener<E>>>>,
}

impl<E> Default for NotificationBus<E> {
  fn default() -> Self {
    Self {
      listeners: Mutex::new(Vec::new()),
    }
  }
}

fn same_listener<E>(a: &Arc<dyn Listener<E>>, b: &Arc<dyn Listener<E>>) -> bool {
  std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    s.to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "未知 panic".to_string()
  }
}

impl<E> NotificationBus<E> {
  pub fn new() -> Self {
    Self::default()
  }

  /// 重复订阅同一个监听器不会产生新的订阅，返回是否新增
  pub fn subscribe(&self, listener: Arc<dyn Listener<E>>) -> bool {
    let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
    if listeners.iter().any(|l| same_listener(l, &listener)) {
      return false;
    }
    listeners.push(listener);
    true
  }

  /// 返回是否确实移除
  pub fn unsubscribe(&self, listener: &Arc<dyn Listener<E>>) -> bool {
    let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
    let before = listeners.len();
    listeners.retain(|l| !same_listener(l, listener));
    listeners.len() != before
  }

  pub fn len(&self) -> usize {
    self.listeners.lock().unwrap_or_else(|e| e.into_inner()).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// 在当前线程上依次调用所有监听器
  ///
  /// 单个监听器失败不会中断后续投递。
  pub fn publish(&self, event: &E) -> PublishReport {
    // 快照，允许监听器在回调中增删订阅
    let snapshot: Vec<Arc<dyn Listener<E>>> = self
      .listeners
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .clone();

    let mut report = PublishReport::default();
    for (index, listener) in snapshot.iter().enumerate() {
      match catch_unwind(AssertUnwindSafe(|| listener.notify(event))) {
        Ok(Ok(())) => report.delivered += 1,
        Ok(Err(source)) => {
          error!("监听器 {} 处理事件失败: {}", index, source);
          report
            .failures
            .push(ListenerFailure::Failed { index, source });
        }
        Err(payload) => {
          let message = panic_message(payload);
          error!("监听器 {} 发生 panic: {}", index, message);
          report
            .failures
            .push(ListenerFailure::Panicked { index, message });
        }
      }
    }
    debug!(
      "事件已投递给 {} 个监听器, 失败 {} 个",
      report.delivered,
      report.failures.len()
    );
    report
  }
}
