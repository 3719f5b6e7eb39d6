// 该文件是 Fenjian （分拣） 项目的一部分。
// src/service.rs - 检测请求处理
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

use std::time::Instant;

use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::{
  classify::{CategoryTable, classify},
  config::Config,
  model::Model,
  output::{Draw, DrawDetectionOnImage},
  storage::{ImageStore, ImageStoreError},
};

pub const SUCCESS_MESSAGE: &str = "Image processed successfully";

/// 检测成功后的响应
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectResponse {
  pub detected_items: Vec<String>,
  pub recyclable: Vec<String>,
  pub non_recyclable: Vec<String>,
  pub hazardous: Vec<String>,
  pub message: String,
  pub saved_image: String,
}

#[derive(Error, Debug)]
pub enum DetectError {
  #[error("Invalid image file")]
  InvalidImage(String),
  #[error("No file uploaded")]
  MissingFile,
  #[error("Invalid upload: {0}")]
  Upload(String),
  #[error("{0}")]
  Storage(#[from] ImageStoreError),
  #[error("{0}")]
  Model(#[source] Box<dyn std::error::Error + Send + Sync>),
  #[error("{0}")]
  Join(String),
}

impl DetectError {
  /// 调用方的问题（4xx），其余都是服务端失败（5xx）
  pub fn is_client_error(&self) -> bool {
    matches!(
      self,
      DetectError::InvalidImage(_) | DetectError::MissingFile | DetectError::Upload(_)
    )
  }
}

/// 将上传内容解码为 RGB 图像
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, DetectError> {
  if bytes.is_empty() {
    return Err(DetectError::InvalidImage("empty payload".to_string()));
  }
  let image = image::load_from_memory(bytes)
    .map_err(|e| DetectError::InvalidImage(e.to_string()))?
    .into_rgb8();
  if image.width() == 0 || image.height() == 0 {
    return Err(DetectError::InvalidImage("zero-sized image".to_string()));
  }
  Ok(image)
}

/// 检测服务：持有启动时加载的模型，逐个处理上传的图像
pub struct DetectService<M> {
  model: M,
  categories: CategoryTable,
  store: ImageStore,
  draw: Draw,
  confidence: f32,
}

impl<M: Model> DetectService<M> {
  pub fn new(model: M, categories: CategoryTable, store: ImageStore, draw: Draw) -> Self {
    Self {
      model,
      categories,
      store,
      draw,
      confidence: 0.6,
    }
  }

  /// 按配置组装服务：打开存储目录，配置了字体时替换内置字体
  pub fn from_config(model: M, config: &Config) -> anyhow::Result<Self> {
    let store = ImageStore::open(&config.storage.images_dir)?;
    let mut draw = Draw::default().with_font_size(config.draw.font_size);
    if let Some(font) = &config.draw.font {
      draw = draw.with_font_file(font)?;
    }
    Ok(Self::new(model, config.categories.clone(), store, draw).with_confidence(config.model.confidence))
  }

  pub fn with_confidence(mut self, confidence: f32) -> Self {
    self.confidence = confidence;
    self
  }

  pub fn store(&self) -> &ImageStore {
    &self.store
  }

  /// 处理一次上传：解码、保存原图、推理、分类、保存标注图
  ///
  /// 任何一步失败都会终止整个请求，已写入的文件不会被清理。
  #[instrument(skip(self, bytes), fields(size = bytes.len()))]
  pub fn detect(&self, bytes: &[u8], original_filename: &str) -> Result<DetectResponse, DetectError> {
    let name = ImageStore::file_name(original_filename).ok_or(DetectError::MissingFile)?;

    let image = decode_image(bytes)?;
    debug!("图像解码完成: {}x{}", image.width(), image.height());

    self.store.save_upload(&name, bytes)?;

    let now = Instant::now();
    let result = self
      .model
      .infer(&image, self.confidence)
      .map_err(|e| DetectError::Model(Box::new(e)))?;
    info!(
      "推理完成，耗时: {:.2?}，检测到 {} 个对象",
      now.elapsed(),
      result.len()
    );

    let labels = result.labels();
    for label in labels.iter().filter(|l| !self.categories.is_listed(l)) {
      warn!("标签 '{}' 不在任何分类表中，按有害垃圾处理", label);
    }
    let classification = classify(&self.categories, &labels);

    let annotated = self.draw.draw_detection(&image, &result);
    let stored = self.store.save_annotated(&name, &annotated)?;
    info!("标注图像已保存: {}", stored.path.display());

    Ok(DetectResponse {
      detected_items: labels.into_iter().collect(),
      recyclable: classification.recyclable,
      non_recyclable: classification.non_recyclable,
      hazardous: classification.hazardous,
      message: SUCCESS_MESSAGE.to_string(),
      saved_image: ImageStore::public_path(&stored.name),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  use std::io::Cursor;

  use crate::model::{ClassLabel, DetectItem, DetectResult};

  struct FixedModel(Vec<(u32, &'static str, f32)>);

  impl Model for FixedModel {
    type Label = ClassLabel;
    type Error = std::io::Error;

    fn infer(&self, _image: &RgbImage, confidence: f32) -> Result<DetectResult<ClassLabel>, Self::Error> {
      Ok(
        self
          .0
          .iter()
          .filter(|(_, _, score)| *score >= confidence)
          .map(|(id, name, score)| DetectItem {
            kind: ClassLabel::new(*id, *name),
            score: *score,
            bbox: [0.25, 0.25, 0.75, 0.75],
          })
          .collect::<Vec<_>>()
          .into(),
      )
    }
  }

  fn png_bytes() -> Vec<u8> {
    let image = RgbImage::from_pixel(16, 16, image::Rgb([200, 200, 200]));
    let mut buf = Vec::new();
    image
      .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
      .unwrap();
    buf
  }

  fn service(model: FixedModel, dir: &std::path::Path) -> DetectService<FixedModel> {
    DetectService::new(
      model,
      CategoryTable::default(),
      ImageStore::open(dir).unwrap(),
      Draw::default(),
    )
  }

  #[test]
  fn decode_rejects_garbage_and_empty_payloads() {
    assert!(matches!(decode_image(b""), Err(DetectError::InvalidImage(_))));
    assert!(matches!(
      decode_image(b"just some notes"),
      Err(DetectError::InvalidImage(_))
    ));
    assert_eq!(decode_image(&png_bytes()).unwrap().dimensions(), (16, 16));
  }

  #[test]
  fn classifies_and_writes_both_files() {
    let dir = tempfile::tempdir().unwrap();
    let svc = service(
      FixedModel(vec![
        (0, "Plastic Bottle", 0.9),
        (0, "Plastic Bottle", 0.8),
        (3, "Plastic Bag", 0.7),
        (5, "Battery", 0.65),
        (1, "Can", 0.3),
      ]),
      dir.path(),
    );

    let response = svc.detect(&png_bytes(), "bin.png").unwrap();

    assert_eq!(
      response.detected_items,
      vec!["Battery", "Plastic Bag", "Plastic Bottle"]
    );
    assert_eq!(response.recyclable, vec!["Plastic Bottle"]);
    assert_eq!(response.non_recyclable, vec!["Plastic Bag"]);
    assert_eq!(response.hazardous, vec!["Battery"]);
    assert_eq!(response.message, SUCCESS_MESSAGE);
    assert_eq!(response.saved_image, "/images/result_bin.png");

    assert!(dir.path().join("bin.png").exists());
    assert!(dir.path().join("result_bin.png").exists());
  }

  #[test]
  fn invalid_image_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let svc = service(FixedModel(vec![]), dir.path());

    let err = svc.detect(b"plain text", "notes.txt").unwrap_err();
    assert!(err.is_client_error());
    assert_eq!(err.to_string(), "Invalid image file");
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
  }

  #[test]
  fn threshold_is_passed_to_the_model() {
    let dir = tempfile::tempdir().unwrap();
    let svc = service(FixedModel(vec![(1, "Can", 0.5)]), dir.path());

    let strict = svc.detect(&png_bytes(), "a.png").unwrap();
    assert!(strict.detected_items.is_empty());

    let svc = svc.with_confidence(0.4);
    let loose = svc.detect(&png_bytes(), "a.png").unwrap();
    assert_eq!(loose.recyclable, vec!["Can"]);
  }

  #[test]
  fn client_filename_cannot_escape_store() {
    let dir = tempfile::tempdir().unwrap();
    let images = dir.path().join("images");
    let svc = service(FixedModel(vec![]), &images);

    let response = svc.detect(&png_bytes(), "../escape.png").unwrap();
    assert_eq!(response.saved_image, "/images/result_escape.png");
    assert!(images.join("escape.png").exists());
    assert!(!dir.path().join("escape.png").exists());
  }

  #[test]
  fn empty_filename_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let svc = service(FixedModel(vec![]), dir.path());
    assert!(matches!(
      svc.detect(&png_bytes(), ""),
      Err(DetectError::MissingFile)
    ));
  }
}
