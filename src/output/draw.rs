// 该文件是 Fenjian （分拣） 项目的一部分。
// src/output/draw.rs - 目标检测结果可视化
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

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use thiserror::Error;
use tracing::info;

use crate::model::{DetectItem, DetectResult, WithLabel};

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 20.0;
const LABEL_TEXT_VERTICAL_PADDING: i32 = 2;
const LABEL_TEXT_HORIZONTAL_PADDING: i32 = 4;
const LABEL_TEXT_COLOR: [u8; 3] = [255, 255, 255]; // 白色
const BOX_THICKNESS: i32 = 2;

// 按类别编号循环取色
const PALETTE: [[u8; 3]; 20] = [
  [0xFF, 0x38, 0x38],
  [0xFF, 0x9D, 0x97],
  [0xFF, 0x70, 0x1F],
  [0xFF, 0xB2, 0x1D],
  [0xCF, 0xD2, 0x31],
  [0x48, 0xF9, 0x0A],
  [0x92, 0xCC, 0x17],
  [0x3D, 0xDB, 0x86],
  [0x1A, 0x93, 0x34],
  [0x00, 0xD4, 0xBB],
  [0x2C, 0x99, 0xA8],
  [0x00, 0xC2, 0xFF],
  [0x34, 0x45, 0x93],
  [0x64, 0x73, 0xFF],
  [0x00, 0x18, 0xEC],
  [0x84, 0x38, 0xFF],
  [0x52, 0x00, 0x85],
  [0xCB, 0x38, 0xFF],
  [0xFF, 0x95, 0xC8],
  [0xFF, 0x37, 0xC7],
];

#[derive(Error, Debug)]
pub enum DrawError {
  #[error("无法读取字体文件 {0}: {1}")]
  FontReadError(PathBuf, std::io::Error),
  #[error("字体文件无效: {0}")]
  InvalidFont(PathBuf),
}

// 内置字体 (DejaVu Sans)
const DEFAULT_FONT: &[u8] = include_bytes!("../../assets/font.ttf");

/// 标注绘制器
///
/// 默认使用内置字体渲染标签，可通过 `with_font_file` 替换。
pub struct Draw {
  font: FontArc,
  font_size: f32,
  label_text_vertical_padding: i32,
  label_text_horizontal_padding: i32,
  text_color: [u8; 3],
}

impl Default for Draw {
  fn default() -> Self {
    let font = FontArc::try_from_slice(DEFAULT_FONT).expect("无法加载嵌入的字体文件");

    Self {
      font,
      font_size: LABEL_FONT_SIZE,
      label_text_vertical_padding: LABEL_TEXT_VERTICAL_PADDING,
      label_text_horizontal_padding: LABEL_TEXT_HORIZONTAL_PADDING,
      text_color: LABEL_TEXT_COLOR,
    }
  }
}

impl Draw {
  pub fn with_font_file(mut self, path: &Path) -> Result<Self, DrawError> {
    let data =
      std::fs::read(path).map_err(|e| DrawError::FontReadError(path.to_path_buf(), e))?;
    let font = FontArc::try_from_vec(data).map_err(|_| DrawError::InvalidFont(path.to_path_buf()))?;
    info!("加载标注字体: {}", path.display());
    self.font = font;
    Ok(self)
  }

  pub fn with_font_size(mut self, font_size: f32) -> Self {
    self.font_size = font_size;
    self
  }

  pub fn color_of(class_id: u32) -> [u8; 3] {
    PALETTE[class_id as usize % PALETTE.len()]
  }

  /// 将归一化坐标 [x_min, y_min, x_max, y_max] 换算为像素坐标，
  /// 超出图像的部分会被截断；框退化时返回 None
  fn pixel_box(bbox: &[f32; 4], width: u32, height: u32) -> Option<(i32, i32, i32, i32)> {
    if width == 0 || height == 0 {
      return None;
    }
    let (w, h) = (width as f32, height as f32);
    let (max_x, max_y) = (width as i32 - 1, height as i32 - 1);

    let x_min = ((bbox[0] * w).floor() as i32).clamp(0, max_x);
    let y_min = ((bbox[1] * h).floor() as i32).clamp(0, max_y);
    let x_max = ((bbox[2] * w).ceil() as i32).clamp(0, max_x);
    let y_max = ((bbox[3] * h).ceil() as i32).clamp(0, max_y);

    if x_min >= x_max || y_min >= y_max {
      None
    } else {
      Some((x_min, y_min, x_max, y_max))
    }
  }

  fn draw_bbox_with_label<T: WithLabel>(&self, image: &mut RgbImage, item: &DetectItem<T>) {
    let Some((x_min, y_min, x_max, y_max)) =
      Self::pixel_box(&item.bbox, image.width(), image.height())
    else {
      return;
    };
    let color = Rgb(Self::color_of(item.kind.to_label_id()));

    // 由外向内逐像素加粗边框
    for t in 0..BOX_THICKNESS {
      let width = x_max - x_min + 1 - 2 * t;
      let height = y_max - y_min + 1 - 2 * t;
      if width <= 0 || height <= 0 {
        break;
      }
      let rect = Rect::at(x_min + t, y_min + t).of_size(width as u32, height as u32);
      draw_hollow_rect_mut(image, rect, color);
    }

    let font = &self.font;
    let label = format!("{} {:.2}", item.kind.to_label_str(), item.score);
    let scale = PxScale::from(self.font_size);
    let (text_width, text_height) = text_size(scale, font, &label);

    let label_width = text_width as i32 + 2 * self.label_text_horizontal_padding;
    let label_height = text_height as i32 + 2 * self.label_text_vertical_padding;

    // 标签放在边框上方，放不下时贴着图像上沿
    let label_x = x_min;
    let label_y = (y_min - label_height).max(0);

    let label_width = label_width.min(image.width() as i32 - label_x);
    if label_width <= 0 || label_height <= 0 {
      return;
    }

    let rect = Rect::at(label_x, label_y).of_size(label_width as u32, label_height as u32);
    draw_filled_rect_mut(image, rect, color);
    draw_text_mut(
      image,
      Rgb(self.text_color),
      label_x + self.label_text_horizontal_padding,
      label_y + self.label_text_vertical_padding,
      scale,
      font,
      &label,
    );
  }
}

pub trait DrawDetectionOnImage<T: WithLabel> {
  fn draw_detections_on_image(&self, image: &mut RgbImage, result: &DetectResult<T>);

  fn draw_detection(&self, image: &RgbImage, result: &DetectResult<T>) -> RgbImage {
    let mut image = image.clone();
    self.draw_detections_on_image(&mut image, result);
    image
  }
}

impl<T: WithLabel> DrawDetectionOnImage<T> for Draw {
  fn draw_detections_on_image(&self, image: &mut RgbImage, result: &DetectResult<T>) {
    for item in result.items.iter() {
      self.draw_bbox_with_label(image, item);
    }
  }
}
