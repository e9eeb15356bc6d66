// 该文件是 Jingtou （镜头） 项目的一部分。
// src/orchestrator/watchdog.rs - 请求超时监视
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
  sync::{
    Weak,
    mpsc::{self, Receiver, RecvTimeoutError, Sender},
  },
  thread,
  time::Instant,
};

use tracing::{debug, warn};

use crate::native::RequestId;

pub(crate) trait Expire: Send + Sync {
  fn expire(&self, request: RequestId);
}

enum Command {
  Arm { request: RequestId, deadline: Instant },
  Disarm(RequestId),
}

/// 同一时间最多只有一个请求在途，因此只需一个截止时间
pub(crate) struct Watchdog {
  sender: Sender<Command>,
}

impl Watchdog {
  pub(crate) fn spawn(sink: Weak<dyn Expire>) -> std::io::Result<Self> {
    let (sender, receiver) = mpsc::channel();
    thread::Builder::new()
      .name("jingtou-watchdog".to_string())
      .spawn(move || run(receiver, sink))?;
    Ok(Self { sender })
  }

  pub(crate) fn arm(&self, request: RequestId, deadline: Instant) {
    if self.sender.send(Command::Arm { request, deadline }).is_err() {
      warn!("超时监视线程已退出, 请求 {} 不受超时保护", request);
    }
  }

  pub(crate) fn disarm(&self, request: RequestId) {
    let _ = self.sender.send(Command::Disarm(request));
  }
}

fn run(receiver: Receiver<Command>, sink: Weak<dyn Expire>) {
  debug!("超时监视线程启动");
  let mut armed: Option<(RequestId, Instant)> = None;
  loop {
    let command = match armed {
      Some((_, deadline)) => {
        receiver.recv_timeout(deadline.saturating_duration_since(Instant::now()))
      }
      None => receiver.recv().map_err(|_| RecvTimeoutError::Disconnected),
    };

    match command {
      Ok(Command::Arm { request, deadline }) => armed = Some((request, deadline)),
      Ok(Command::Disarm(request)) => {
        if armed.is_some_and(|(current, _)| current == request) {
          armed = None;
        }
      }
      Err(RecvTimeoutError::Timeout) => {
        let Some((request, _)) = armed.take() else {
          continue;
        };
        match sink.upgrade() {
          Some(sink) => sink.expire(request),
          None => break,
        }
      }
      Err(RecvTimeoutError::Disconnected) => break,
    }
  }
  debug!("超时监视线程退出");
}
