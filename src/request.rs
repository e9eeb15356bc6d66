// 该文件是 Jingtou （镜头） 项目的一部分。
// src/request.rs - 视觉请求配置
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

use std::{fmt, num::NonZeroU32, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
  #[error("最大观测数量必须为正数, 实际为 {0}")]
  NonPositiveMaxObservations(i64),
  #[error("不支持的分析类型: {0}")]
  UnsupportedKind(String),
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("缺少分析类型")]
  MissingKind,
  #[error("参数 {name} 无效: {value}")]
  InvalidParameter { name: String, value: String },
  #[error("超时时长必须大于零")]
  ZeroTimeout,
}

/// 分析类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisKind {
  Classification,
  RectangleDetection,
}

impl AnalysisKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      AnalysisKind::Classification => "classification",
      AnalysisKind::RectangleDetection => "rectangles",
    }
  }
}

impl fmt::Display for AnalysisKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for AnalysisKind {
  type Err = ConfigurationError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "classification" | "classify" => Ok(AnalysisKind::Classification),
      "rectangles" | "rectangle_detection" | "rectangle" => Ok(AnalysisKind::RectangleDetection),
      other => Err(ConfigurationError::UnsupportedKind(other.to_string())),
    }
  }
}

/// 请求配置
///
/// 对于分类请求，`max_observations` 表示保留的候选数量；
/// 对于矩形检测，表示一次最多识别的矩形数量。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestConfiguration {
  kind: AnalysisKind,
  max_observations: NonZeroU32,
  timeout: Option<Duration>,
}

impl RequestConfiguration {
  pub fn new(kind: AnalysisKind, max_observations: u32) -> Result<Self, ConfigurationError> {
    let max_observations = NonZeroU32::new(max_observations)
      .ok_or(ConfigurationError::NonPositiveMaxObservations(0))?;
    Ok(Self {
      kind,
      max_observations,
      timeout: None,
    })
  }

  pub fn classification(max_observations: u32) -> Result<Self, ConfigurationError> {
    Self::new(AnalysisKind::Classification, max_observations)
  }

  pub fn rectangles(max_observations: u32) -> Result<Self, ConfigurationError> {
    Self::new(AnalysisKind::RectangleDetection, max_observations)
  }

  /// 原生调用超过该时长未完成时强制结束
  pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, ConfigurationError> {
    if timeout.is_zero() {
      return Err(ConfigurationError::ZeroTimeout);
    }
    self.timeout = Some(timeout);
    Ok(self)
  }

  pub fn kind(&self) -> AnalysisKind {
    self.kind
  }

  pub fn max_observations(&self) -> u32 {
    self.max_observations.get()
  }

  pub fn timeout(&self) -> Option<Duration> {
    self.timeout
  }
}

impl FromUrlWithScheme for RequestConfiguration {
  const SCHEME: &'static str = "vision";
}

fn invalid(name: &str, value: &str) -> ConfigurationError {
  ConfigurationError::InvalidParameter {
    name: name.to_string(),
    value: value.to_string(),
  }
}

impl FromUrl for RequestConfiguration {
  type Error = ConfigurationError;

  /// 例如 `vision://rectangles?max_observations=1&timeout_ms=500`
  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ConfigurationError::SchemeMismatch);
    }

    let kind: AnalysisKind = url
      .host_str()
      .filter(|host| !host.is_empty())
      .ok_or(ConfigurationError::MissingKind)?
      .parse()?;

    let mut max_observations: i64 = 1;
    let mut timeout = None;
    for (k, v) in url.query_pairs() {
      match k.as_ref() {
        "max_observations" | "max" => {
          max_observations = v.parse().map_err(|_| invalid(&k, &v))?;
        }
        "timeout_ms" => {
          let ms: u64 = v
            .parse()
            .ok()
            .filter(|ms| *ms > 0)
            .ok_or_else(|| invalid(&k, &v))?;
          timeout = Some(Duration::from_millis(ms));
        }
        _ => return Err(invalid(&k, &v)),
      }
    }

    if max_observations <= 0 {
      return Err(ConfigurationError::NonPositiveMaxObservations(
        max_observations,
      ));
    }
    let max_observations = u32::try_from(max_observations)
      .map_err(|_| invalid("max_observations", &max_observations.to_string()))?;

    let config = Self::new(kind, max_observations)?;
    match timeout {
      Some(timeout) => config.with_timeout(timeout),
      None => Ok(config),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn parse(s: &str) -> Result<RequestConfiguration, ConfigurationError> {
    RequestConfiguration::from_url(&Url::parse(s).unwrap())
  }

  #[test]
  fn zero_max_observations_is_rejected() {
    assert_eq!(
      RequestConfiguration::classification(0),
      Err(ConfigurationError::NonPositiveMaxObservations(0))
    );
  }

  #[test]
  fn parses_rectangle_url_with_timeout() {
    let config = parse("vision://rectangles?max_observations=2&timeout_ms=250").unwrap();
    assert_eq!(config.kind(), AnalysisKind::RectangleDetection);
    assert_eq!(config.max_observations(), 2);
    assert_eq!(config.timeout(), Some(Duration::from_millis(250)));
  }

  #[test]
  fn zero_timeout_is_rejected() {
    assert_eq!(
      parse("vision://rectangles?timeout_ms=0"),
      Err(ConfigurationError::InvalidParameter {
        name: "timeout_ms".to_string(),
        value: "0".to_string(),
      })
    );
    assert_eq!(
      RequestConfiguration::rectangles(1)
        .unwrap()
        .with_timeout(Duration::ZERO),
      Err(ConfigurationError::ZeroTimeout)
    );
  }

  #[test]
  fn max_observations_defaults_to_one() {
    let config = parse("vision://classification").unwrap();
    assert_eq!(config.kind(), AnalysisKind::Classification);
    assert_eq!(config.max_observations(), 1);
    assert_eq!(config.timeout(), None);
  }

  #[test]
  fn negative_max_observations_is_rejected() {
    assert_eq!(
      parse("vision://classification?max=-3"),
      Err(ConfigurationError::NonPositiveMaxObservations(-3))
    );
  }

  #[test]
  fn wrong_scheme_and_unknown_kind() {
    assert_eq!(
      parse("gst://classification"),
      Err(ConfigurationError::SchemeMismatch)
    );
    assert_eq!(
      parse("vision://faces"),
      Err(ConfigurationError::UnsupportedKind("faces".to_string()))
    );
    assert!(matches!(
      parse("vision://rectangles?fps=30"),
      Err(ConfigurationError::InvalidParameter { .. })
    ));
  }
}
