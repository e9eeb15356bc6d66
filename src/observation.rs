// 该文件是 Jingtou （镜头） 项目的一部分。
// src/observation.rs - 识别结果定义
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

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 二维点，归一化坐标下 y 轴向上
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
  pub x: f32,
  pub y: f32,
}

impl Point {
  pub const fn new(x: f32, y: f32) -> Self {
    Self { x, y }
  }

  /// 关于单位正方形中心的点对称：`(1, 1) - p`
  pub fn reflect(self) -> Self {
    Self {
      x: 1.0 - self.x,
      y: 1.0 - self.y,
    }
  }

  pub fn scale(self, width: f32, height: f32) -> Self {
    Self {
      x: self.x * width,
      y: self.y * height,
    }
  }

  pub fn is_finite(&self) -> bool {
    self.x.is_finite() && self.y.is_finite()
  }
}

impl From<[f32; 2]> for Point {
  fn from([x, y]: [f32; 2]) -> Self {
    Self { x, y }
  }
}

/// 设备方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
  #[default]
  Portrait,
  PortraitUpsideDown,
  LandscapeLeft,
  LandscapeRight,
}

impl Orientation {
  /// 原生检测器的坐标不随设备旋转，只有横屏向右时需要点对称变换
  pub fn transform(&self, point: Point) -> Point {
    match self {
      Orientation::LandscapeRight => point.reflect(),
      _ => point,
    }
  }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("未知的设备方向: {0}")]
pub struct UnknownOrientation(pub String);

impl FromStr for Orientation {
  type Err = UnknownOrientation;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "portrait" => Ok(Orientation::Portrait),
      "portrait_upside_down" => Ok(Orientation::PortraitUpsideDown),
      "landscape_left" => Ok(Orientation::LandscapeLeft),
      "landscape_right" => Ok(Orientation::LandscapeRight),
      other => Err(UnknownOrientation(other.to_string())),
    }
  }
}

/// 图像分类结果
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
  pub identifier: String,
  pub confidence: f32,
}

/// 矩形识别结果，角点顺时针排列：左上、右上、右下、左下
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RectangleObservation {
  pub top_left: Point,
  pub top_right: Point,
  pub bottom_left: Point,
  pub bottom_right: Point,
  pub area: f32,
}

impl RectangleObservation {
  pub fn from_corners(
    top_left: Point,
    top_right: Point,
    bottom_right: Point,
    bottom_left: Point,
  ) -> Self {
    let area = shoelace_area(&[top_left, top_right, bottom_right, bottom_left]).abs();
    Self {
      top_left,
      top_right,
      bottom_left,
      bottom_right,
      area,
    }
  }

  pub fn corners(&self) -> [Point; 4] {
    [
      self.top_left,
      self.top_right,
      self.bottom_right,
      self.bottom_left,
    ]
  }

  /// 将归一化坐标映射到屏幕坐标
  pub fn to_screen(&self, width: f32, height: f32) -> Self {
    Self {
      top_left: self.top_left.scale(width, height),
      top_right: self.top_right.scale(width, height),
      bottom_left: self.bottom_left.scale(width, height),
      bottom_right: self.bottom_right.scale(width, height),
      area: self.area * width * height,
    }
  }
}

/// 鞋带公式计算的有向面积，顶点逆时针为正
pub fn shoelace_area(vertices: &[Point]) -> f32 {
  let n = vertices.len();
  if n < 3 {
    return 0.0;
  }
  let twice: f32 = (0..n)
    .map(|i| {
      let a = vertices[i];
      let b = vertices[(i + 1) % n];
      a.x * b.y - b.x * a.y
    })
    .sum();
  twice / 2.0
}

/// 按面积取最大的矩形
pub fn largest(rectangles: &[RectangleObservation]) -> Option<&RectangleObservation> {
  rectangles
    .iter()
    .max_by(|a, b| a.area.total_cmp(&b.area))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn unit_square() -> RectangleObservation {
    RectangleObservation::from_corners(
      Point::new(0.0, 1.0),
      Point::new(1.0, 1.0),
      Point::new(1.0, 0.0),
      Point::new(0.0, 0.0),
    )
  }

  #[test]
  fn shoelace_sign_follows_winding() {
    let ccw = [
      Point::new(0.0, 0.0),
      Point::new(1.0, 0.0),
      Point::new(1.0, 1.0),
      Point::new(0.0, 1.0),
    ];
    let mut cw = ccw;
    cw.reverse();
    assert_eq!(shoelace_area(&ccw), 1.0);
    assert_eq!(shoelace_area(&cw), -1.0);
    // 起点不同，面积不变
    let rotated = [ccw[2], ccw[3], ccw[0], ccw[1]];
    assert_eq!(shoelace_area(&rotated), 1.0);
  }

  #[test]
  fn degenerate_polygon_has_no_area() {
    assert_eq!(shoelace_area(&[Point::new(0.0, 0.0), Point::new(1.0, 1.0)]), 0.0);
  }

  #[test]
  fn observation_area_is_non_negative() {
    assert_eq!(unit_square().area, 1.0);
  }

  #[test]
  fn screen_projection_scales_corners_and_area() {
    let screen = unit_square().to_screen(1920.0, 1080.0);
    assert_eq!(screen.top_right, Point::new(1920.0, 1080.0));
    assert_eq!(screen.bottom_left, Point::new(0.0, 0.0));
    assert_eq!(screen.area, 1920.0 * 1080.0);
  }

  #[test]
  fn only_landscape_right_reflects() {
    let p = Point::new(0.25, 0.75);
    assert_eq!(Orientation::Portrait.transform(p), p);
    assert_eq!(Orientation::LandscapeLeft.transform(p), p);
    assert_eq!(Orientation::LandscapeRight.transform(p), Point::new(0.75, 0.25));
  }

  #[test]
  fn largest_picks_max_area() {
    let small = unit_square().to_screen(0.5, 0.5);
    let big = unit_square();
    let rects = [small, big];
    assert_eq!(largest(&rects), Some(&big));
    assert_eq!(largest(&[]), None);
  }
}
