// 该文件是 Fenjian （分拣） 项目的一部分。
// src/storage.rs - 图像文件存储
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

use std::path::{Path, PathBuf};

use image::RgbImage;
use thiserror::Error;
use tracing::{debug, info};

/// 标注结果文件名前缀
pub const RESULT_PREFIX: &str = "result_";
/// 图像目录对外暴露的 URL 前缀
pub const PUBLIC_PREFIX: &str = "/images";

#[derive(Error, Debug)]
pub enum ImageStoreError {
  #[error("I/O error on {path}: {source}")]
  IoError {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("failed to encode {path}: {source}")]
  ImageError {
    path: PathBuf,
    #[source]
    source: image::ImageError,
  },
}

/// 已写入存储目录的文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredImage {
  pub name: String,
  pub path: PathBuf,
}

/// 扁平目录存储：上传原图与标注结果放在同一目录，同名覆盖，从不删除
#[derive(Debug, Clone)]
pub struct ImageStore {
  root: PathBuf,
}

impl ImageStore {
  pub fn open(root: impl Into<PathBuf>) -> Result<Self, ImageStoreError> {
    let root = root.into();
    std::fs::create_dir_all(&root).map_err(|source| ImageStoreError::IoError {
      path: root.clone(),
      source,
    })?;
    info!("图像存储目录: {}", root.display());
    Ok(Self { root })
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// 从客户端提供的文件名中取出最后一个路径分量
  pub fn file_name(original: &str) -> Option<String> {
    Path::new(original.trim())
      .file_name()
      .and_then(|name| name.to_str())
      .filter(|name| !name.is_empty())
      .map(str::to_owned)
  }

  pub fn result_name(name: &str) -> String {
    format!("{RESULT_PREFIX}{name}")
  }

  /// 文件对应的访问路径，例如 `/images/result_a.jpg`
  pub fn public_path(name: &str) -> String {
    format!("{PUBLIC_PREFIX}/{}", urlencoding::encode(name))
  }

  pub fn path_of(&self, name: &str) -> PathBuf {
    self.root.join(name)
  }

  pub fn save_upload(&self, name: &str, bytes: &[u8]) -> Result<StoredImage, ImageStoreError> {
    let path = self.path_of(name);
    std::fs::write(&path, bytes).map_err(|source| ImageStoreError::IoError {
      path: path.clone(),
      source,
    })?;
    debug!("保存上传文件: {} ({} 字节)", path.display(), bytes.len());
    Ok(StoredImage {
      name: name.to_string(),
      path,
    })
  }

  /// 保存标注后的图像，编码格式由扩展名决定
  pub fn save_annotated(&self, name: &str, image: &RgbImage) -> Result<StoredImage, ImageStoreError> {
    let name = Self::result_name(name);
    let path = self.path_of(&name);
    image
      .save(&path)
      .map_err(|source| ImageStoreError::ImageError {
        path: path.clone(),
        source,
      })?;
    Ok(StoredImage { name, path })
  }
}
