// 该文件是 Fenjian （分拣） 项目的一部分。
// src/model/yolov8.rs - YOLOv8 ONNX 模型
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

use std::collections::BTreeMap;
use std::sync::Arc;

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use thiserror::Error;
use tracing::{debug, info, warn};
use tract_onnx::prelude::*;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  config::ModelSettings,
  model::{ClassLabel, DetectItem, DetectResult, Model},
};

const YOLOV8_BOX_CHANNELS: usize = 4;
const YOLOV8_DEFAULT_INPUT_SIZE: u32 = 640;
const YOLOV8_DEFAULT_IOU_THRESH: f32 = 0.7;
const YOLOV8_MAX_DETECTIONS: usize = 300;
const YOLOV8_NAMES_KEY: &str = "names";
const YOLOV8_LETTERBOX_FILL: u8 = 114;

type Plan = TypedRunnableModel<TypedModel>;

#[derive(Error, Debug)]
pub enum Yolov8Error {
  #[error("模型加载错误: {0}")]
  ModelLoadError(TractError),
  #[error("推理错误: {0}")]
  InferenceError(TractError),
  #[error("模型路径错误: {0}")]
  ModelPathError(String),
  #[error("模型缺少类别名称，请在配置中提供 labels")]
  MissingLabels,
  #[error("模型输出形状 {shape:?} 与 {classes} 个类别不匹配")]
  OutputShapeMismatch { shape: Vec<usize>, classes: usize },
}

/// YOLOv8 检测模型
///
/// 输入图像被缩放到 `input_size x input_size`，输出为 `[1, 4 + 类别数, 锚点数]`
/// （也接受转置后的 `[1, 锚点数, 4 + 类别数]`）。
pub struct Yolov8 {
  plan: Plan,
  labels: Box<[ClassLabel]>,
  input_size: u32,
  iou_threshold: f32,
}

pub struct Yolov8Builder {
  model_path: String,
  input_size: u32,
  iou_threshold: f32,
  labels: Option<Vec<String>>,
}

impl FromUrlWithScheme for Yolov8Builder {
  const SCHEME: &'static str = "yolov8";
}

impl FromUrl for Yolov8Builder {
  type Error = Yolov8Error;

  /// `yolov8:///abs/best.onnx?size=640&iou=0.7` 或 `yolov8:weights/best.onnx`
  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(Yolov8Error::ModelPathError(format!(
        "模型路径必须使用 {} 方案，实际为 '{}'",
        Self::SCHEME,
        url.scheme()
      )));
    }

    let model_path = urlencoding::decode(url.path())
      .map_err(|e| Yolov8Error::ModelPathError(e.to_string()))?
      .into_owned();
    if model_path.is_empty() {
      return Err(Yolov8Error::ModelPathError("模型路径为空".to_string()));
    }

    let mut builder = Yolov8Builder {
      model_path,
      input_size: YOLOV8_DEFAULT_INPUT_SIZE,
      iou_threshold: YOLOV8_DEFAULT_IOU_THRESH,
      labels: None,
    };

    for (k, v) in url.query_pairs() {
      match k.as_ref() {
        "size" => {
          builder.input_size = v
            .parse()
            .map_err(|_| Yolov8Error::ModelPathError(format!("无效的输入尺寸: {v}")))?
        }
        "iou" => {
          builder.iou_threshold = v
            .parse()
            .map_err(|_| Yolov8Error::ModelPathError(format!("无效的 IoU 阈值: {v}")))?
        }
        other => warn!("忽略未知的模型参数: {}", other),
      }
    }

    Ok(builder)
  }
}

impl Yolov8Builder {
  /// 由模型地址构建，再应用配置中显式给出的参数
  pub fn from_settings(settings: &ModelSettings) -> Result<Self, Yolov8Error> {
    let mut builder = Self::from_url(&settings.url)?;
    if let Some(size) = settings.input_size {
      builder = builder.input_size(size);
    }
    if let Some(iou) = settings.iou {
      builder = builder.iou_threshold(iou);
    }
    if let Some(labels) = settings.labels.clone() {
      builder = builder.labels(labels);
    }
    Ok(builder)
  }

  pub fn model_path(&self) -> &str {
    &self.model_path
  }

  pub fn input_size(mut self, input_size: u32) -> Self {
    self.input_size = input_size;
    self
  }

  pub fn iou_threshold(mut self, iou_threshold: f32) -> Self {
    self.iou_threshold = iou_threshold;
    self
  }

  /// 覆盖模型元数据中的类别名称
  pub fn labels(mut self, labels: Vec<String>) -> Self {
    self.labels = Some(labels);
    self
  }

  pub fn build(self) -> Result<Yolov8, Yolov8Error> {
    info!("加载模型文件: {}", self.model_path);
    let onnx = tract_onnx::onnx();
    let proto = onnx
      .proto_model_for_path(&self.model_path)
      .map_err(Yolov8Error::ModelLoadError)?;

    let names = match self.labels {
      Some(labels) => labels,
      None => proto
        .metadata_props
        .iter()
        .find(|prop| prop.key == YOLOV8_NAMES_KEY)
        .and_then(|prop| parse_names(&prop.value))
        .ok_or(Yolov8Error::MissingLabels)?,
    };
    debug!("模型类别: {:?}", names);

    let size = self.input_size as usize;
    let model = onnx
      .model_for_proto_model(&proto)
      .and_then(|model| {
        model.with_input_fact(
          0,
          InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size)),
        )
      })
      .and_then(|model| model.into_optimized())
      .map_err(Yolov8Error::ModelLoadError)?;

    // 类别数与输出通道不符时在启动阶段报错
    let output_shape = model
      .output_fact(0)
      .map_err(Yolov8Error::ModelLoadError)?
      .shape
      .as_concrete()
      .map(<[usize]>::to_vec);
    if let Some(shape) = output_shape {
      output_layout(&shape, names.len())?;
    }

    let plan = model.into_runnable().map_err(Yolov8Error::ModelLoadError)?;
    info!("模型加载完成，类别数: {}", names.len());

    let labels = names
      .into_iter()
      .enumerate()
      .map(|(id, name)| ClassLabel::new(id as u32, Arc::<str>::from(name)))
      .collect();

    Ok(Yolov8 {
      plan,
      labels,
      input_size: self.input_size,
      iou_threshold: self.iou_threshold,
    })
  }
}

impl Yolov8 {
  fn build_input(&self, letterboxed: &RgbImage) -> Tensor {
    let size = self.input_size as usize;
    tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |(_, channel, y, x)| {
      letterboxed.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0
    })
    .into_tensor()
  }
}

/// 保持长宽比缩放到 `size x size`，空余部分居中填充灰色
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Letterbox {
  size: u32,
  width: u32,
  height: u32,
  pad_x: u32,
  pad_y: u32,
}

impl Letterbox {
  fn new(image_width: u32, image_height: u32, size: u32) -> Self {
    let scale = (size as f32 / image_width as f32).min(size as f32 / image_height as f32);
    let width = ((image_width as f32 * scale).round() as u32).clamp(1, size);
    let height = ((image_height as f32 * scale).round() as u32).clamp(1, size);
    Self {
      size,
      width,
      height,
      pad_x: (size - width) / 2,
      pad_y: (size - height) / 2,
    }
  }

  fn apply(&self, image: &RgbImage) -> RgbImage {
    let resized = imageops::resize(image, self.width, self.height, FilterType::Triangle);
    let mut canvas = RgbImage::from_pixel(self.size, self.size, Rgb([YOLOV8_LETTERBOX_FILL; 3]));
    imageops::replace(&mut canvas, &resized, self.pad_x as i64, self.pad_y as i64);
    canvas
  }

  /// 模型输入上的像素坐标换算为原图上的归一化坐标
  fn normalize(&self, x: f32, y: f32) -> (f32, f32) {
    (
      ((x - self.pad_x as f32) / self.width as f32).clamp(0.0, 1.0),
      ((y - self.pad_y as f32) / self.height as f32).clamp(0.0, 1.0),
    )
  }
}

impl Model for Yolov8 {
  type Label = ClassLabel;
  type Error = Yolov8Error;

  fn infer(&self, image: &RgbImage, confidence: f32) -> Result<DetectResult<ClassLabel>, Yolov8Error> {
    debug!("设置模型输入: {}x{}", image.width(), image.height());
    let letterbox = Letterbox::new(image.width(), image.height(), self.input_size);
    let input = self.build_input(&letterbox.apply(image));

    debug!("执行模型推理");
    let outputs = self
      .plan
      .run(tvec!(input.into()))
      .map_err(Yolov8Error::InferenceError)?;

    let output = outputs
      .first()
      .ok_or_else(|| Yolov8Error::InferenceError(TractError::msg("模型没有输出")))?;
    let view = output
      .to_array_view::<f32>()
      .map_err(Yolov8Error::InferenceError)?;
    let shape = view.shape().to_vec();

    let layout = output_layout(&shape, self.labels.len())?;
    let data: Vec<f32> = view.iter().copied().collect();

    let items = decode_output(
      &data,
      layout,
      &self.labels,
      &letterbox,
      confidence,
      self.iou_threshold,
    );
    debug!("检测到 {} 个物体", items.len());

    Ok(items.into())
  }
}

/// 输出张量的排布
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OutputLayout {
  anchors: usize,
  classes: usize,
  transposed: bool,
}

impl OutputLayout {
  fn from_shape(shape: &[usize], classes: usize) -> Option<Self> {
    let channels = YOLOV8_BOX_CHANNELS + classes;
    match *shape {
      [1, c, anchors] if c == channels => Some(Self {
        anchors,
        classes,
        transposed: false,
      }),
      [1, anchors, c] if c == channels => Some(Self {
        anchors,
        classes,
        transposed: true,
      }),
      _ => None,
    }
  }

  fn value(&self, data: &[f32], channel: usize, anchor: usize) -> f32 {
    if self.transposed {
      data[anchor * (YOLOV8_BOX_CHANNELS + self.classes) + channel]
    } else {
      data[channel * self.anchors + anchor]
    }
  }
}

fn output_layout(shape: &[usize], classes: usize) -> Result<OutputLayout, Yolov8Error> {
  OutputLayout::from_shape(shape, classes).ok_or_else(|| Yolov8Error::OutputShapeMismatch {
    shape: shape.to_vec(),
    classes,
  })
}

/// 将原始输出解码为检测结果：置信度过滤、按类别 NMS，坐标归一化到 0..1
fn decode_output(
  data: &[f32],
  layout: OutputLayout,
  labels: &[ClassLabel],
  letterbox: &Letterbox,
  confidence: f32,
  iou_threshold: f32,
) -> Vec<DetectItem<ClassLabel>> {
  let mut candidates = Vec::new();

  for anchor in 0..layout.anchors {
    let (class_idx, score) = (0..layout.classes)
      .map(|c| (c, layout.value(data, YOLOV8_BOX_CHANNELS + c, anchor)))
      .fold((0usize, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });

    if score < confidence {
      continue;
    }

    let cx = layout.value(data, 0, anchor);
    let cy = layout.value(data, 1, anchor);
    let w = layout.value(data, 2, anchor);
    let h = layout.value(data, 3, anchor);

    let (x_min, y_min) = letterbox.normalize(cx - w / 2.0, cy - h / 2.0);
    let (x_max, y_max) = letterbox.normalize(cx + w / 2.0, cy + h / 2.0);
    let bbox = [x_min, y_min, x_max, y_max];

    candidates.push(DetectItem {
      kind: labels[class_idx].clone(),
      score,
      bbox,
    });
  }

  nms(candidates, iou_threshold)
}

/// 非极大值抑制，仅在同类别之间进行
fn nms(mut items: Vec<DetectItem<ClassLabel>>, iou_threshold: f32) -> Vec<DetectItem<ClassLabel>> {
  items.sort_by(|a, b| b.score.total_cmp(&a.score));

  let mut kept: Vec<DetectItem<ClassLabel>> = Vec::new();
  for item in items {
    let suppressed = kept
      .iter()
      .any(|k| k.kind.id == item.kind.id && iou(&k.bbox, &item.bbox) > iou_threshold);
    if !suppressed {
      kept.push(item);
      if kept.len() >= YOLOV8_MAX_DETECTIONS {
        break;
      }
    }
  }
  kept
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let x1 = a[0].max(b[0]);
  let y1 = a[1].max(b[1]);
  let x2 = a[2].min(b[2]);
  let y2 = a[3].min(b[3]);

  let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
  let area_a = (a[2] - a[0]) * (a[3] - a[1]);
  let area_b = (b[2] - b[0]) * (b[3] - b[1]);
  let union = area_a + area_b - intersection;

  if union > 0.0 { intersection / union } else { 0.0 }
}

/// 解析 Ultralytics 导出时写入的类别表，例如 `{0: 'Plastic Bottle', 1: 'Can'}`。
/// 类别编号必须从 0 开始连续。
fn parse_names(raw: &str) -> Option<Vec<String>> {
  let body = raw.trim().strip_prefix('{')?.strip_suffix('}')?;
  let mut names = BTreeMap::new();
  let mut rest = body;

  loop {
    rest = rest.trim_start_matches([',', ' ', '\n']);
    if rest.is_empty() {
      break;
    }
    let (id, tail) = rest.split_once(':')?;
    let id: u32 = id.trim().parse().ok()?;
    let tail = tail.trim_start();
    let quote = tail.chars().next().filter(|c| *c == '\'' || *c == '"')?;
    let tail = &tail[1..];
    let end = tail.find(quote)?;
    names.insert(id, tail[..end].to_string());
    rest = &tail[end + 1..];
  }

  let contiguous = names.keys().enumerate().all(|(i, id)| i as u32 == *id);
  if names.is_empty() || !contiguous {
    return None;
  }
  Some(names.into_values().collect())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn labels() -> Vec<ClassLabel> {
    vec![ClassLabel::new(0, "Plastic Bottle"), ClassLabel::new(1, "Can")]
  }

  fn square() -> Letterbox {
    Letterbox::new(640, 640, 640)
  }

  /// 按 [通道, 锚点] 排布构造输出
  fn channel_major(anchors: &[[f32; 6]]) -> Vec<f32> {
    let mut data = vec![0.0; 6 * anchors.len()];
    for (a, values) in anchors.iter().enumerate() {
      for (c, v) in values.iter().enumerate() {
        data[c * anchors.len() + a] = *v;
      }
    }
    data
  }

  #[test]
  fn parses_ultralytics_names() {
    assert_eq!(
      parse_names("{0: 'Plastic Bottle', 1: 'Can', 2: \"Food Wrapper\"}"),
      Some(vec![
        "Plastic Bottle".to_string(),
        "Can".to_string(),
        "Food Wrapper".to_string()
      ])
    );
    assert_eq!(parse_names("{0: 'a, b'}"), Some(vec!["a, b".to_string()]));
    assert_eq!(parse_names("{1: 'Can'}"), None);
    assert_eq!(parse_names("{}"), None);
    assert_eq!(parse_names("not a dict"), None);
  }

  #[test]
  fn layout_accepts_both_orientations() {
    assert_eq!(
      OutputLayout::from_shape(&[1, 6, 8400], 2),
      Some(OutputLayout {
        anchors: 8400,
        classes: 2,
        transposed: false
      })
    );
    assert_eq!(
      OutputLayout::from_shape(&[1, 8400, 6], 2),
      Some(OutputLayout {
        anchors: 8400,
        classes: 2,
        transposed: true
      })
    );
    assert_eq!(OutputLayout::from_shape(&[1, 7, 8400], 2), None);
  }

  #[test]
  fn decodes_filters_and_suppresses() {
    let anchors = [
      // cx, cy, w, h, bottle, can
      [100.0, 100.0, 40.0, 40.0, 0.9, 0.1],
      // 与第一个框几乎重合，同类别，被抑制
      [102.0, 100.0, 40.0, 40.0, 0.8, 0.1],
      // 同一位置但不同类别，保留
      [100.0, 100.0, 40.0, 40.0, 0.1, 0.7],
      // 低于阈值
      [300.0, 300.0, 20.0, 20.0, 0.5, 0.2],
    ];
    let data = channel_major(&anchors);
    let layout = OutputLayout::from_shape(&[1, 6, anchors.len()], 2).unwrap();

    let items = decode_output(&data, layout, &labels(), &square(), 0.6, 0.7);

    assert_eq!(items.len(), 2);
    assert_eq!(&*items[0].kind.name, "Plastic Bottle");
    assert!((items[0].score - 0.9).abs() < 1e-6);
    assert_eq!(&*items[1].kind.name, "Can");

    let expected = [80.0 / 640.0, 80.0 / 640.0, 120.0 / 640.0, 120.0 / 640.0];
    for (got, want) in items[0].bbox.iter().zip(expected) {
      assert!((got - want).abs() < 1e-6);
    }
  }

  #[test]
  fn transposed_output_decodes_the_same() {
    let anchors = [[320.0, 320.0, 64.0, 64.0, 0.2, 0.95]];
    let data: Vec<f32> = anchors.iter().flatten().copied().collect();
    let layout = OutputLayout::from_shape(&[1, 1, 6], 2).unwrap();

    let items = decode_output(&data, layout, &labels(), &square(), 0.6, 0.7);
    assert_eq!(items.len(), 1);
    assert_eq!(&*items[0].kind.name, "Can");
  }

  #[test]
  fn boxes_are_clamped_to_unit_range() {
    let anchors = [[0.0, 0.0, 100.0, 100.0, 0.9, 0.0]];
    let data = channel_major(&anchors);
    let layout = OutputLayout::from_shape(&[1, 6, 1], 2).unwrap();

    let items = decode_output(&data, layout, &labels(), &square(), 0.6, 0.7);
    assert_eq!(items[0].bbox[0], 0.0);
    assert_eq!(items[0].bbox[1], 0.0);
  }

  #[test]
  fn wide_image_is_padded_vertically() {
    let letterbox = Letterbox::new(1280, 640, 640);
    assert_eq!(
      letterbox,
      Letterbox {
        size: 640,
        width: 640,
        height: 320,
        pad_x: 0,
        pad_y: 160,
      }
    );

    let image = RgbImage::from_pixel(1280, 640, Rgb([200, 10, 10]));
    let canvas = letterbox.apply(&image);
    assert_eq!(canvas.dimensions(), (640, 640));
    assert_eq!(*canvas.get_pixel(320, 10), Rgb([YOLOV8_LETTERBOX_FILL; 3]));
    assert_eq!(*canvas.get_pixel(320, 320), Rgb([200, 10, 10]));
    assert_eq!(*canvas.get_pixel(320, 630), Rgb([YOLOV8_LETTERBOX_FILL; 3]));
  }

  #[test]
  fn boxes_are_mapped_back_through_padding() {
    let anchors = [[320.0, 320.0, 64.0, 64.0, 0.9, 0.0]];
    let data = channel_major(&anchors);
    let layout = OutputLayout::from_shape(&[1, 6, 1], 2).unwrap();
    let letterbox = Letterbox::new(1280, 640, 640);

    let items = decode_output(&data, layout, &labels(), &letterbox, 0.6, 0.7);

    let expected = [0.45, 0.4, 0.55, 0.6];
    for (got, want) in items[0].bbox.iter().zip(expected) {
      assert!((got - want).abs() < 1e-6, "{got} != {want}");
    }
  }

  #[test]
  fn label_count_must_match_output_channels() {
    assert!(output_layout(&[1, 6, 8400], 2).is_ok());
    let err = output_layout(&[1, 84, 8400], 2).unwrap_err();
    assert!(matches!(
      err,
      Yolov8Error::OutputShapeMismatch { classes: 2, .. }
    ));
  }

  #[test]
  fn iou_of_disjoint_and_identical_boxes() {
    let a = [0.0, 0.0, 0.5, 0.5];
    let b = [0.5, 0.5, 1.0, 1.0];
    assert_eq!(iou(&a, &b), 0.0);
    assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
  }

  #[test]
  fn builder_reads_url_parameters() {
    let url = Url::parse("yolov8:///opt/weights/best.onnx?size=320&iou=0.5").unwrap();
    let builder = Yolov8Builder::from_url(&url).unwrap();
    assert_eq!(builder.model_path(), "/opt/weights/best.onnx");
    assert_eq!(builder.input_size, 320);
    assert_eq!(builder.iou_threshold, 0.5);

    let relative = Url::parse("yolov8:weights/best.onnx").unwrap();
    assert_eq!(
      Yolov8Builder::from_url(&relative).unwrap().model_path(),
      "weights/best.onnx"
    );
  }

  #[test]
  fn settings_override_url_parameters() {
    let settings = ModelSettings {
      url: Url::parse("yolov8:best.onnx?size=320").unwrap(),
      confidence: 0.6,
      iou: Some(0.45),
      input_size: Some(480),
      labels: Some(vec!["Can".to_string()]),
    };
    let builder = Yolov8Builder::from_settings(&settings).unwrap();
    assert_eq!(builder.input_size, 480);
    assert_eq!(builder.iou_threshold, 0.45);
    assert_eq!(builder.labels, Some(vec!["Can".to_string()]));
  }

  #[test]
  fn builder_rejects_other_schemes() {
    let url = Url::parse("file:///opt/weights/best.onnx").unwrap();
    assert!(matches!(
      Yolov8Builder::from_url(&url),
      Err(Yolov8Error::ModelPathError(_))
    ));
  }
}
