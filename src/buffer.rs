// 该文件是 Jingtou （镜头） 项目的一部分。
// src/buffer.rs - 原生图像缓冲区描述
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

use std::{fmt, marker::PhantomData, num::NonZeroUsize, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 缓冲区的内存类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferKind {
  /// 纹理内存（例如 Metal 纹理）
  TextureBacked,
  /// 像素缓冲区（例如 CVPixelBuffer）
  PixelBufferBacked,
  /// 相机帧（例如 ARFrame）
  FrameBacked,
}

impl BufferKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      BufferKind::TextureBacked => "texture",
      BufferKind::PixelBufferBacked => "pixel_buffer",
      BufferKind::FrameBacked => "frame",
    }
  }
}

impl fmt::Display for BufferKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("未知的缓冲区类型: {0}")]
pub struct UnknownBufferKind(pub String);

impl FromStr for BufferKind {
  type Err = UnknownBufferKind;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "texture" | "texture_backed" => Ok(BufferKind::TextureBacked),
      "pixel_buffer" | "pixel_buffer_backed" => Ok(BufferKind::PixelBufferBacked),
      "frame" | "frame_backed" => Ok(BufferKind::FrameBacked),
      other => Err(UnknownBufferKind(other.to_string())),
    }
  }
}

/// 不透明的原生缓冲区句柄
///
/// 只是一个令牌，调用方无法通过它访问底层内存。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(NonZeroUsize);

impl BufferHandle {
  /// 空句柄返回 `None`
  pub fn from_raw(raw: usize) -> Option<Self> {
    NonZeroUsize::new(raw).map(BufferHandle)
  }

  pub fn as_raw(&self) -> usize {
    self.0.get()
  }
}

impl fmt::Display for BufferHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:#x}", self.0)
  }
}

/// 可以交给原生分析器的图像缓冲区
pub trait NativeBuffer {
  fn native_handle(&self) -> BufferHandle;
  fn buffer_kind(&self) -> BufferKind;
}

/// 借用的缓冲区描述，仅在一次 `evaluate` 调用期间有效
///
/// 生命周期 `'a` 绑定到生产者持有的缓冲区，描述本身不能被保存到调用之外。
#[derive(Debug)]
pub struct BufferDescriptor<'a> {
  handle: BufferHandle,
  kind: BufferKind,
  _borrow: PhantomData<&'a ()>,
}

impl<'a> BufferDescriptor<'a> {
  pub fn new(handle: BufferHandle, kind: BufferKind) -> Self {
    Self {
      handle,
      kind,
      _borrow: PhantomData,
    }
  }

  pub fn borrow<B: NativeBuffer + ?Sized>(buffer: &'a B) -> Self {
    Self::new(buffer.native_handle(), buffer.buffer_kind())
  }

  pub fn handle(&self) -> BufferHandle {
    self.handle
  }

  pub fn kind(&self) -> BufferKind {
    self.kind
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  struct FakeFrame(usize);

  impl NativeBuffer for FakeFrame {
    fn native_handle(&self) -> BufferHandle {
      BufferHandle::from_raw(self.0).unwrap()
    }

    fn buffer_kind(&self) -> BufferKind {
      BufferKind::FrameBacked
    }
  }

  #[test]
  fn null_handle_is_rejected() {
    assert!(BufferHandle::from_raw(0).is_none());
    assert_eq!(BufferHandle::from_raw(0x10).unwrap().as_raw(), 0x10);
  }

  #[test]
  fn descriptor_borrows_handle_and_kind() {
    let frame = FakeFrame(0xbeef);
    let descriptor = BufferDescriptor::borrow(&frame);
    assert_eq!(descriptor.handle().as_raw(), 0xbeef);
    assert_eq!(descriptor.kind(), BufferKind::FrameBacked);
  }

  #[test]
  fn buffer_kind_parses_short_and_long_names() {
    assert_eq!("texture".parse(), Ok(BufferKind::TextureBacked));
    assert_eq!("pixel_buffer_backed".parse(), Ok(BufferKind::PixelBufferBacked));
    assert_eq!(
      "metal".parse::<BufferKind>(),
      Err(UnknownBufferKind("metal".to_string()))
    );
  }
}
