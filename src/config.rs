// 该文件是 Fenjian （分拣） 项目的一部分。
// src/config.rs - 配置文件
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

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::args::CommonArgs;
use crate::classify::{CategoryTable, CategoryTableError, DEFAULT_NON_RECYCLABLE, DEFAULT_RECYCLABLE};

const DEFAULT_LISTEN: &str = "0.0.0.0:8000";
const DEFAULT_MODEL: &str = "yolov8:weights/best.onnx";
const DEFAULT_CONFIDENCE: f32 = 0.6;
const DEFAULT_IMAGES_DIR: &str = "images";
const DEFAULT_MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;
const DEFAULT_FONT_SIZE: f32 = 20.0;

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("无法读取配置文件 {path}: {source}")]
  ReadError {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("配置文件格式错误: {0}")]
  ParseError(#[from] toml::de::Error),
  #[error("无效的监听地址 '{0}'")]
  InvalidListen(String),
  #[error("无效的模型地址 '{0}': {1}")]
  InvalidModelUrl(String, url::ParseError),
  #[error("置信度阈值必须位于 0.0 - 1.0 之间，实际为 {0}")]
  InvalidConfidence(f32),
  #[error("上传大小上限不能为 0")]
  InvalidUploadLimit,
  #[error("分类表错误: {0}")]
  CategoryError(#[from] CategoryTableError),
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
  server: Option<ServerConfigFile>,
  model: Option<ModelConfigFile>,
  storage: Option<StorageConfigFile>,
  categories: Option<CategoriesConfigFile>,
  draw: Option<DrawConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ServerConfigFile {
  listen: Option<String>,
  max_upload_bytes: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ModelConfigFile {
  url: Option<String>,
  confidence: Option<f32>,
  iou: Option<f32>,
  input_size: Option<u32>,
  labels: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct StorageConfigFile {
  images_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CategoriesConfigFile {
  recyclable: Option<Vec<String>>,
  non_recyclable: Option<Vec<String>>,
  hazardous: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DrawConfigFile {
  font: Option<PathBuf>,
  font_size: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
  pub listen: SocketAddr,
  pub max_upload_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct ModelSettings {
  pub url: Url,
  pub confidence: f32,
  pub iou: Option<f32>,
  pub input_size: Option<u32>,
  pub labels: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
  pub images_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct DrawSettings {
  pub font: Option<PathBuf>,
  pub font_size: f32,
}

#[derive(Debug, Clone)]
pub struct Config {
  pub server: ServerSettings,
  pub model: ModelSettings,
  pub storage: StorageSettings,
  pub categories: CategoryTable,
  pub draw: DrawSettings,
}

impl Default for Config {
  fn default() -> Self {
    let file = ConfigFile::default();
    // 内置默认值总是合法的
    match Self::from_file(file) {
      Ok(config) => config,
      Err(e) => unreachable!("默认配置无效: {e}"),
    }
  }
}

impl Config {
  /// 读取配置：命令行参数 > 配置文件 > 内置默认值
  pub fn load(args: &CommonArgs) -> Result<Self, ConfigError> {
    let file = match args.config.as_deref() {
      Some(path) => read_config_file(path)?,
      None => ConfigFile::default(),
    };
    let mut config = Self::from_file(file)?;
    config.apply_args(args);
    config.validate()?;
    Ok(config)
  }

  pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
    let file: ConfigFile = toml::from_str(text)?;
    let config = Self::from_file(file)?;
    config.validate()?;
    Ok(config)
  }

  fn from_file(file: ConfigFile) -> Result<Self, ConfigError> {
    let server = file.server.unwrap_or_default();
    let model = file.model.unwrap_or_default();
    let storage = file.storage.unwrap_or_default();
    let categories = file.categories.unwrap_or_default();
    let draw = file.draw.unwrap_or_default();

    let listen = server.listen.as_deref().unwrap_or(DEFAULT_LISTEN);
    let listen = listen
      .parse()
      .map_err(|_| ConfigError::InvalidListen(listen.to_string()))?;

    let url = model.url.as_deref().unwrap_or(DEFAULT_MODEL);
    let url = Url::parse(url).map_err(|e| ConfigError::InvalidModelUrl(url.to_string(), e))?;

    let categories = CategoryTable::new(
      categories
        .recyclable
        .unwrap_or_else(|| DEFAULT_RECYCLABLE.iter().map(|s| s.to_string()).collect()),
      categories
        .non_recyclable
        .unwrap_or_else(|| DEFAULT_NON_RECYCLABLE.iter().map(|s| s.to_string()).collect()),
      categories.hazardous.unwrap_or_default(),
    )?;

    Ok(Self {
      server: ServerSettings {
        listen,
        max_upload_bytes: server.max_upload_bytes.unwrap_or(DEFAULT_MAX_UPLOAD_BYTES),
      },
      model: ModelSettings {
        url,
        confidence: model.confidence.unwrap_or(DEFAULT_CONFIDENCE),
        iou: model.iou,
        input_size: model.input_size,
        labels: model.labels,
      },
      storage: StorageSettings {
        images_dir: storage
          .images_dir
          .unwrap_or_else(|| PathBuf::from(DEFAULT_IMAGES_DIR)),
      },
      categories,
      draw: DrawSettings {
        font: draw.font,
        font_size: draw.font_size.unwrap_or(DEFAULT_FONT_SIZE),
      },
    })
  }

  fn apply_args(&mut self, args: &CommonArgs) {
    if let Some(model) = &args.model {
      self.model.url = model.clone();
    }
    if let Some(images) = &args.images {
      self.storage.images_dir = images.clone();
    }
    if let Some(confidence) = args.confidence {
      self.model.confidence = confidence;
    }
    if let Some(font) = &args.font {
      self.draw.font = Some(font.clone());
    }
  }

  fn validate(&self) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&self.model.confidence) {
      return Err(ConfigError::InvalidConfidence(self.model.confidence));
    }
    if self.server.max_upload_bytes == 0 {
      return Err(ConfigError::InvalidUploadLimit);
    }
    Ok(())
  }
}

fn read_config_file(path: &Path) -> Result<ConfigFile, ConfigError> {
  debug!("读取配置文件: {}", path.display());
  let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
    path: path.to_path_buf(),
    source,
  })?;
  Ok(toml::from_str(&text)?)
}
