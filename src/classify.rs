// 该文件是 Fenjian （分拣） 项目的一部分。
// src/classify.rs - 垃圾分类
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
use std::fmt;

use serde::Serialize;
use thiserror::Error;

pub const DEFAULT_RECYCLABLE: [&str; 3] = ["Plastic Bottle", "Can", "Cardboard"];
pub const DEFAULT_NON_RECYCLABLE: [&str; 2] = ["Plastic Bag", "Food Wrapper"];

/// 垃圾处理类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WasteCategory {
  Recyclable,
  NonRecyclable,
  Hazardous,
}

impl fmt::Display for WasteCategory {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      WasteCategory::Recyclable => "recyclable",
      WasteCategory::NonRecyclable => "non_recyclable",
      WasteCategory::Hazardous => "hazardous",
    };
    f.write_str(name)
  }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CategoryTableError {
  #[error("标签 '{label}' 同时属于 {first} 和 {second}")]
  Overlap {
    label: String,
    first: WasteCategory,
    second: WasteCategory,
  },
}

/// 分类表：三个互不相交的标签集合，启动时构建，之后只读
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryTable {
  recyclable: BTreeSet<String>,
  non_recyclable: BTreeSet<String>,
  hazardous: BTreeSet<String>,
}

impl Default for CategoryTable {
  fn default() -> Self {
    Self {
      recyclable: DEFAULT_RECYCLABLE.iter().map(|s| s.to_string()).collect(),
      non_recyclable: DEFAULT_NON_RECYCLABLE
        .iter()
        .map(|s| s.to_string())
        .collect(),
      hazardous: BTreeSet::new(),
    }
  }
}

impl CategoryTable {
  pub fn new<R, N, H>(recyclable: R, non_recyclable: N, hazardous: H) -> Result<Self, CategoryTableError>
  where
    R: IntoIterator,
    R::Item: Into<String>,
    N: IntoIterator,
    N::Item: Into<String>,
    H: IntoIterator,
    H::Item: Into<String>,
  {
    let table = Self {
      recyclable: recyclable.into_iter().map(Into::into).collect(),
      non_recyclable: non_recyclable.into_iter().map(Into::into).collect(),
      hazardous: hazardous.into_iter().map(Into::into).collect(),
    };
    table.check_disjoint()?;
    Ok(table)
  }

  fn check_disjoint(&self) -> Result<(), CategoryTableError> {
    let pairs = [
      (
        &self.recyclable,
        WasteCategory::Recyclable,
        &self.non_recyclable,
        WasteCategory::NonRecyclable,
      ),
      (
        &self.recyclable,
        WasteCategory::Recyclable,
        &self.hazardous,
        WasteCategory::Hazardous,
      ),
      (
        &self.non_recyclable,
        WasteCategory::NonRecyclable,
        &self.hazardous,
        WasteCategory::Hazardous,
      ),
    ];

    for (a, first, b, second) in pairs {
      if let Some(label) = a.intersection(b).next() {
        return Err(CategoryTableError::Overlap {
          label: label.clone(),
          first,
          second,
        });
      }
    }
    Ok(())
  }

  /// 单个标签的类别。未在可回收与不可回收表中出现的标签一律视为有害。
  pub fn category_of(&self, label: &str) -> WasteCategory {
    if self.recyclable.contains(label) {
      WasteCategory::Recyclable
    } else if self.non_recyclable.contains(label) {
      WasteCategory::NonRecyclable
    } else {
      WasteCategory::Hazardous
    }
  }

  /// 标签是否出现在任一分类表中
  pub fn is_listed(&self, label: &str) -> bool {
    self.recyclable.contains(label)
      || self.non_recyclable.contains(label)
      || self.hazardous.contains(label)
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Classification {
  pub recyclable: Vec<String>,
  pub non_recyclable: Vec<String>,
  pub hazardous: Vec<String>,
}

/// 将检测到的标签集合划分为三个类别列表
pub fn classify(table: &CategoryTable, labels: &BTreeSet<String>) -> Classification {
  let mut classification = Classification::default();
  for label in labels {
    let bucket = match table.category_of(label) {
      WasteCategory::Recyclable => &mut classification.recyclable,
      WasteCategory::NonRecyclable => &mut classification.non_recyclable,
      WasteCategory::Hazardous => &mut classification.hazardous,
    };
    bucket.push(label.clone());
  }
  classification
}
