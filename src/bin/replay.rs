// 该文件是 Jingtou （镜头） 项目的一部分。
// src/bin/replay.rs - 回放原生结果的演示程序
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

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use url::Url;

use jingtou::{
  FromUrl,
  buffer::{BufferHandle, BufferKind, NativeBuffer},
  native::{ReplayAnalyzer, ReplayScript},
  notify::{Listener, ListenerError},
  observation::Orientation,
  orchestrator::{ClassificationsCompleted, EvaluationFailed, Orchestrator, RectanglesRecognized},
  request::RequestConfiguration,
  task::{ContinuousTask, Task},
};

/// Jingtou 回放参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 请求配置，例如 vision://rectangles?max_observations=1&timeout_ms=500
  #[arg(long, value_name = "CONFIG")]
  pub config: Url,
  /// 回放脚本（JSON）
  #[arg(long, value_name = "SCRIPT")]
  pub script: PathBuf,
  /// 最大帧数
  #[arg(long, value_name = "FRAME_NUMBER")]
  pub frame_number: Option<usize>,
  /// 模拟帧率
  #[arg(long, default_value = "30", value_name = "FPS")]
  pub fps: u32,
  /// 设备方向: portrait, portrait_upside_down, landscape_left, landscape_right
  #[arg(long, default_value = "portrait", value_name = "ORIENTATION")]
  pub orientation: Orientation,
  /// 缓冲区类型: texture, pixel_buffer, frame
  #[arg(long, default_value = "frame", value_name = "KIND")]
  pub buffer_kind: BufferKind,
  /// 屏幕尺寸，用于输出屏幕坐标
  #[arg(long, default_value = "1920", value_name = "WIDTH")]
  pub screen_width: f32,
  #[arg(long, default_value = "1080", value_name = "HEIGHT")]
  pub screen_height: f32,
}

struct SyntheticFrame {
  handle: BufferHandle,
  kind: BufferKind,
}

impl NativeBuffer for SyntheticFrame {
  fn native_handle(&self) -> BufferHandle {
    self.handle
  }

  fn buffer_kind(&self) -> BufferKind {
    self.kind
  }
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("请求配置: {}", args.config);
  info!("回放脚本: {}", args.script.display());
  info!("设备方向: {:?}", args.orientation);

  let config = RequestConfiguration::from_url(&args.config)?;
  let script = ReplayScript::from_path(&args.script)?;
  let orchestrator = Orchestrator::new(ReplayAnalyzer::new(script)?);
  orchestrator.configure(config)?;
  orchestrator.set_orientation(args.orientation);

  let on_classifications: Arc<dyn Listener<ClassificationsCompleted>> =
    Arc::new(|event: &ClassificationsCompleted| -> Result<(), ListenerError> {
      for item in &event.observations {
        info!(
          "请求 {}: {} {:.2}%",
          event.request,
          item.identifier,
          item.confidence * 100.0
        );
      }
      Ok(())
    });
  orchestrator.classifications().subscribe(on_classifications);

  let (width, height) = (args.screen_width, args.screen_height);
  let on_rectangles: Arc<dyn Listener<RectanglesRecognized>> =
    Arc::new(move |event: &RectanglesRecognized| -> Result<(), ListenerError> {
      info!("请求 {}: 检测到 {} 个矩形", event.request, event.rectangles.len());
      if let Some(rect) = event.largest() {
        let screen = rect.to_screen(width, height);
        info!(
          "  最大矩形 左上 ({:.0}, {:.0}) 右上 ({:.0}, {:.0}) 右下 ({:.0}, {:.0}) 左下 ({:.0}, {:.0}) 面积 {:.0}",
          screen.top_left.x,
          screen.top_left.y,
          screen.top_right.x,
          screen.top_right.y,
          screen.bottom_right.x,
          screen.bottom_right.y,
          screen.bottom_left.x,
          screen.bottom_left.y,
          screen.area
        );
      }
      Ok(())
    });
  orchestrator.rectangles().subscribe(on_rectangles);

  let on_failure: Arc<dyn Listener<EvaluationFailed>> =
    Arc::new(|event: &EvaluationFailed| -> Result<(), ListenerError> {
      warn!("请求 {} 失败: {}", event.request, event.error);
      Ok(())
    });
  orchestrator.failures().subscribe(on_failure);

  let kind = args.buffer_kind;
  let frames = (1usize..).filter_map(move |raw| {
    BufferHandle::from_raw(raw << 4).map(|handle| SyntheticFrame { handle, kind })
  });

  let interval = Duration::from_secs_f64(1.0 / f64::from(args.fps.max(1)));
  let summary = ContinuousTask::default()
    .with_frame_number(args.frame_number)
    .with_frame_interval(Some(interval))
    .with_settle(Some(Duration::from_secs(5)))
    .with_interrupt(true)
    .run_task(frames, &orchestrator)?;

  let diagnostics = orchestrator.diagnostics();
  info!("处理完成!");
  info!(
    "总帧数: {}, 提交: {}, 丢弃: {}",
    summary.frames, summary.accepted, summary.dropped
  );
  info!(
    "完成: {}, 失败: {}, 超时: {}",
    diagnostics.completed, diagnostics.failed, diagnostics.timed_out
  );

  Ok(())
}
