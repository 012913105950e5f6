// 该文件是 Biaozhu （标注） 项目的一部分。
// src/model/yolo.rs - YOLO 前处理与后处理
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

use image::{Rgb, RgbImage, imageops::FilterType};
use thiserror::Error;
use tracing::debug;

use crate::model::{DetectItem, DetectResult, InferOptions};

pub const YOLO_INPUT_SIZE: u32 = 640;
pub const YOLO_IOU_THRESH: f32 = 0.45;
pub const YOLO_MAX_DETECTIONS: usize = 300;
const LETTERBOX_FILL: u8 = 114;
// 允许 sigmoid 输出的浮点误差
const SCORE_TOLERANCE: f32 = 1.0 + 1e-3;

/// 等比缩放并居中填充时的几何参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
  pub scale: f32,
  pub pad_x: f32,
  pub pad_y: f32,
  pub src_width: u32,
  pub src_height: u32,
}

impl Letterbox {
  pub fn new(src_width: u32, src_height: u32, size: u32) -> Self {
    let scale = (size as f32 / src_width as f32).min(size as f32 / src_height as f32);
    let new_w = (src_width as f32 * scale).round();
    let new_h = (src_height as f32 * scale).round();
    Self {
      scale,
      pad_x: ((size as f32 - new_w) / 2.0).floor(),
      pad_y: ((size as f32 - new_h) / 2.0).floor(),
      src_width,
      src_height,
    }
  }

  /// 网络输入坐标 → 原图归一化坐标
  pub fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
    let x = ((x - self.pad_x) / self.scale).clamp(0.0, self.src_width as f32);
    let y = ((y - self.pad_y) / self.scale).clamp(0.0, self.src_height as f32);
    (x / self.src_width as f32, y / self.src_height as f32)
  }
}

/// 预处理为 NCHW 的 f32 张量数据，取值 [0, 1]
pub fn preprocess(image: &RgbImage, size: u32) -> (Vec<f32>, Letterbox) {
  let letterbox = Letterbox::new(image.width(), image.height(), size);
  let new_w = ((image.width() as f32 * letterbox.scale).round() as u32).max(1);
  let new_h = ((image.height() as f32 * letterbox.scale).round() as u32).max(1);
  let resized = image::imageops::resize(image, new_w, new_h, FilterType::Triangle);

  let mut canvas = RgbImage::from_pixel(size, size, Rgb([LETTERBOX_FILL; 3]));
  image::imageops::replace(
    &mut canvas,
    &resized,
    letterbox.pad_x as i64,
    letterbox.pad_y as i64,
  );

  let plane = (size * size) as usize;
  let mut data = vec![0f32; plane * 3];
  for (x, y, pixel) in canvas.enumerate_pixels() {
    let idx = (y * size + x) as usize;
    for c in 0..3 {
      data[c * plane + idx] = pixel[c] as f32 / 255.0;
    }
  }
  (data, letterbox)
}

#[derive(Error, Debug)]
pub enum YoloOutputError {
  #[error("无法识别的输出形状 {0:?}，需要 [1, 4 + nc, N] 或 [1, N, 4 + nc]")]
  UnsupportedShape(Vec<usize>),
  #[error("输出形状 {shape:?} 与类别数不符，需要一维为 {expected}")]
  ClassCountMismatch { shape: Vec<usize>, expected: usize },
  #[error("输出数据长度 {len} 与形状 {shape:?} 不符")]
  SizeMismatch { shape: Vec<usize>, len: usize },
  #[error("类别分数 {0} 超出 [0, 1]，输出可能不是 YOLO 检测头")]
  ScoreOutOfRange(f32),
}

/// 输出张量的布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputLayout {
  pub channels: usize,
  pub anchors: usize,
  pub transposed: bool,
}

impl OutputLayout {
  pub fn num_classes(&self) -> usize {
    self.channels - 4
  }
}

/// 判断输出布局。已知类别数时要求某一维恰为 `4 + nc`；
/// 未知时把较短的一维当作通道。
pub fn output_layout(
  shape: &[usize],
  num_classes: Option<usize>,
) -> Result<OutputLayout, YoloOutputError> {
  let &[1, a, b] = shape else {
    return Err(YoloOutputError::UnsupportedShape(shape.to_vec()));
  };
  let layout = match num_classes {
    Some(nc) if a == 4 + nc => OutputLayout {
      channels: a,
      anchors: b,
      transposed: false,
    },
    Some(nc) if b == 4 + nc => OutputLayout {
      channels: b,
      anchors: a,
      transposed: true,
    },
    Some(nc) => {
      return Err(YoloOutputError::ClassCountMismatch {
        shape: shape.to_vec(),
        expected: 4 + nc,
      });
    }
    None if a <= b => OutputLayout {
      channels: a,
      anchors: b,
      transposed: false,
    },
    None => OutputLayout {
      channels: b,
      anchors: a,
      transposed: true,
    },
  };
  if layout.channels <= 4 || layout.anchors == 0 {
    return Err(YoloOutputError::UnsupportedShape(shape.to_vec()));
  }
  Ok(layout)
}

/// 解码 `[1, 4 + nc, N]`（或转置的 `[1, N, 4 + nc]`）输出
pub fn postprocess(
  output: &[f32],
  shape: &[usize],
  num_classes: Option<usize>,
  letterbox: &Letterbox,
  options: &InferOptions,
  iou_threshold: f32,
) -> Result<DetectResult, YoloOutputError> {
  let layout = output_layout(shape, num_classes)?;
  let OutputLayout {
    channels,
    anchors,
    transposed,
  } = layout;
  if output.len() != channels * anchors {
    return Err(YoloOutputError::SizeMismatch {
      shape: shape.to_vec(),
      len: output.len(),
    });
  }
  let at = |anchor: usize, channel: usize| {
    if transposed {
      output[anchor * channels + channel]
    } else {
      output[channel * anchors + anchor]
    }
  };

  let mut items = Vec::new();
  for anchor in 0..anchors {
    let mut best: Option<(usize, f32)> = None;
    for class_id in 0..layout.num_classes() {
      if !options.allows(class_id) {
        continue;
      }
      let score = at(anchor, 4 + class_id);
      if best.is_none_or(|(_, s)| score > s) {
        best = Some((class_id, score));
      }
    }
    let Some((class_id, score)) = best else {
      continue;
    };
    if !(0.0..=SCORE_TOLERANCE).contains(&score) {
      return Err(YoloOutputError::ScoreOutOfRange(score));
    }
    if score < options.confidence {
      continue;
    }

    let (cx, cy, w, h) = (
      at(anchor, 0),
      at(anchor, 1),
      at(anchor, 2),
      at(anchor, 3),
    );
    let (x_min, y_min) = letterbox.unmap(cx - w / 2.0, cy - h / 2.0);
    let (x_max, y_max) = letterbox.unmap(cx + w / 2.0, cy + h / 2.0);
    if x_max <= x_min || y_max <= y_min {
      continue;
    }
    items.push(DetectItem {
      class_id: class_id as u32,
      score,
      bbox: [x_min, y_min, x_max, y_max],
    });
  }

  let mut items = nms(items, iou_threshold);
  items.truncate(YOLO_MAX_DETECTIONS);
  debug!("检测到 {} 个物体", items.len());
  Ok(DetectResult::from(items))
}

/// 按类别做非极大值抑制，结果按分数降序
pub fn nms(mut items: Vec<DetectItem>, iou_threshold: f32) -> Vec<DetectItem> {
  items.sort_by(|a, b| b.score.total_cmp(&a.score));

  let mut kept: Vec<DetectItem> = Vec::with_capacity(items.len());
  for item in items {
    let suppressed = kept
      .iter()
      .any(|k| k.class_id == item.class_id && iou(&k.bbox, &item.bbox) >= iou_threshold);
    if !suppressed {
      kept.push(item);
    }
  }
  kept
}

pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
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
