// 该文件是 Jingtou （镜头） 项目的一部分。
// src/mapper.rs - 原生输出后处理
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

use std::cmp::Ordering;

use thiserror::Error;
use tracing::{debug, error};

use crate::observation::{Classification, Orientation, Point, RectangleObservation};

const CORNERS_PER_RECTANGLE: usize = 4;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MalformedResultError {
  #[error("点的数量 {0} 不是 4 的倍数")]
  PointCount(usize),
  #[error("标签数量 {labels} 与置信度数量 {confidences} 不一致")]
  LengthMismatch { labels: usize, confidences: usize },
  #[error("第 {index} 个置信度无效: {value}")]
  InvalidConfidence { index: usize, value: f32 },
  #[error("第 {index} 个点坐标无效: ({x}, {y})")]
  NonFiniteCoordinate { index: usize, x: f32, y: f32 },
  #[error("期望 {expected} 结果, 实际收到 {actual}")]
  UnexpectedOutput {
    expected: &'static str,
    actual: &'static str,
  },
}

/// 将原生分类输出映射为按置信度降序的结果，并截断到 `max_observations`
///
/// 置信度相同时保持原生返回顺序。
pub fn map_classifications(
  labels: &[String],
  confidences: &[f32],
  max_observations: usize,
) -> Result<Vec<Classification>, MalformedResultError> {
  if labels.len() != confidences.len() {
    error!(
      "分类输出长度不一致: 标签 {}, 置信度 {}",
      labels.len(),
      confidences.len()
    );
    return Err(MalformedResultError::LengthMismatch {
      labels: labels.len(),
      confidences: confidences.len(),
    });
  }

  if let Some((index, &value)) = confidences
    .iter()
    .enumerate()
    .find(|(_, c)| !(0.0..=1.0).contains(*c))
  {
    return Err(MalformedResultError::InvalidConfidence { index, value });
  }

  let mut items: Vec<Classification> = labels
    .iter()
    .zip(confidences)
    .map(|(label, &confidence)| Classification {
      identifier: label.clone(),
      confidence,
    })
    .collect();
  // sort_by 是稳定排序
  items.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
  items.truncate(max_observations);

  debug!("分类结果: {:?}", items);
  Ok(items)
}

/// 将原生检测器返回的扁平点列表映射为矩形
///
/// 任何一组不完整都会使整个调用失败，不会返回部分结果。
pub fn map_rectangles(
  points: &[Point],
  orientation: Orientation,
) -> Result<Vec<RectangleObservation>, MalformedResultError> {
  if points.len() % CORNERS_PER_RECTANGLE != 0 {
    error!("矩形点数量 {} 不是 4 的倍数", points.len());
    return Err(MalformedResultError::PointCount(points.len()));
  }

  if let Some((index, p)) = points.iter().enumerate().find(|(_, p)| !p.is_finite()) {
    return Err(MalformedResultError::NonFiniteCoordinate {
      index,
      x: p.x,
      y: p.y,
    });
  }

  let rectangles: Vec<RectangleObservation> = points
    .chunks_exact(CORNERS_PER_RECTANGLE)
    .map(|group| {
      let corners = [
        orientation.transform(group[0]),
        orientation.transform(group[1]),
        orientation.transform(group[2]),
        orientation.transform(group[3]),
      ];
      assign_corners(corners)
    })
    .collect();

  debug!(
    "检测到 {} 个矩形 (方向: {:?})",
    rectangles.len(),
    orientation
  );
  Ok(rectangles)
}

fn by_x_then_y(a: &Point, b: &Point) -> Ordering {
  a.x.total_cmp(&b.x).then(a.y.total_cmp(&b.y))
}

/// 原生返回的角点顺序随方向变化，不可依赖，因此按坐标分量重新确定角点
fn assign_corners(mut corners: [Point; 4]) -> RectangleObservation {
  corners.sort_by(by_x_then_y);
  let [l0, l1, r0, r1] = corners;

  // y 轴向上，y 大者为上。排序后 y 相同的一对中第二个点 y 不小于第一个
  let (top_left, bottom_left) = if l0.y > l1.y { (l0, l1) } else { (l1, l0) };
  let (top_right, bottom_right) = if r0.y > r1.y { (r0, r1) } else { (r1, r0) };

  RectangleObservation::from_corners(top_left, top_right, bottom_right, bottom_left)
}
