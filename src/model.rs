// 该文件是 Fenjian （分拣） 项目的一部分。
// src/model.rs - 模型
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

use std::collections::BTreeSet;
use std::sync::Arc;

use image::RgbImage;

/// 检测模型
///
/// 模型在启动时构建一次，之后由所有请求共享，因此推理只借用 `&self`。
/// 置信度过滤由模型自身完成，低于阈值的结果不会出现在输出中。
pub trait Model: Send + Sync {
  type Label: WithLabel;
  type Error: std::error::Error + Send + Sync + 'static;

  fn infer(
    &self,
    image: &RgbImage,
    confidence: f32,
  ) -> Result<DetectResult<Self::Label>, Self::Error>;
}

#[derive(Debug, Clone)]
pub struct DetectItem<T> {
  pub kind: T,
  pub score: f32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]，归一化坐标
}

#[derive(Debug, Clone)]
pub struct DetectResult<T> {
  pub items: Box<[DetectItem<T>]>,
}

impl<T> Default for DetectResult<T> {
  fn default() -> Self {
    Self {
      items: Box::new([]),
    }
  }
}

impl<T> From<Vec<DetectItem<T>>> for DetectResult<T> {
  fn from(items: Vec<DetectItem<T>>) -> Self {
    Self {
      items: items.into_boxed_slice(),
    }
  }
}

impl<T: WithLabel> DetectResult<T> {
  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  /// 所有检测结果中出现过的标签（去重）
  pub fn labels(&self) -> BTreeSet<String> {
    self
      .items
      .iter()
      .map(|item| item.kind.to_label_str())
      .collect()
  }
}

pub trait WithLabel: Sized + std::fmt::Debug {
  fn to_label_str(&self) -> String;
  fn to_label_id(&self) -> u32;
}

/// 模型类别：类别编号与名称
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassLabel {
  pub id: u32,
  pub name: Arc<str>,
}

impl ClassLabel {
  pub fn new(id: u32, name: impl Into<Arc<str>>) -> Self {
    Self {
      id,
      name: name.into(),
    }
  }
}

impl WithLabel for ClassLabel {
  fn to_label_str(&self) -> String {
    self.name.to_string()
  }

  fn to_label_id(&self) -> u32 {
    self.id
  }
}

#[cfg(feature = "model_yolov8")]
mod yolov8;
#[cfg(feature = "model_yolov8")]
pub use self::yolov8::{Yolov8, Yolov8Builder, Yolov8Error};
