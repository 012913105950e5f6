// 该文件是 Biaozhu （标注） 项目的一部分。
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

use std::path::Path;

use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
  drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
  rect::Rect,
};
use tracing::debug;

use crate::{
  model::{DetectItem, DetectResult},
  output::OutputError,
};

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 20.0;
const LABEL_TEXT_VERTICAL_PADDING: i32 = 2;
const BOX_THICKNESS: i32 = 2;

// 按类别索引循环取色
const PALETTE: [[u8; 3]; 10] = [
  [255, 56, 56],
  [255, 157, 151],
  [255, 112, 31],
  [255, 178, 29],
  [207, 210, 49],
  [72, 249, 10],
  [26, 147, 52],
  [0, 212, 187],
  [0, 194, 255],
  [52, 69, 147],
];

pub fn class_color(class_id: u32) -> [u8; 3] {
  PALETTE[class_id as usize % PALETTE.len()]
}

pub struct Draw {
  names: Vec<String>,
  font: Option<FontVec>,
  font_size: f32,
}

impl Draw {
  /// 只画边框；配置字体后才绘制 `类别 分数` 标签
  pub fn new(names: Vec<String>) -> Self {
    Self {
      names,
      font: None,
      font_size: LABEL_FONT_SIZE,
    }
  }

  pub fn with_font_file(mut self, path: &Path) -> Result<Self, OutputError> {
    let data = std::fs::read(path).map_err(|e| OutputError::FontError(e.to_string()))?;
    let font = FontVec::try_from_vec(data).map_err(|e| OutputError::FontError(e.to_string()))?;
    debug!("加载字体: {}", path.display());
    self.font = Some(font);
    Ok(self)
  }

  pub fn with_font_size(mut self, font_size: f32) -> Self {
    self.font_size = font_size;
    self
  }

  fn label_of(&self, item: &DetectItem) -> String {
    let name = self
      .names
      .get(item.class_id as usize)
      .cloned()
      .unwrap_or_else(|| item.class_id.to_string());
    format!("{} {:.2}", name, item.score)
  }

  pub fn draw(&self, image: &RgbImage, result: &DetectResult) -> RgbImage {
    let mut canvas = image.clone();
    for item in result.items.iter() {
      self.draw_item(&mut canvas, item);
    }
    canvas
  }

  // bbox 为归一化坐标 [x_min, y_min, x_max, y_max]
  fn draw_item(&self, image: &mut RgbImage, item: &DetectItem) {
    let (w, h) = (image.width() as f32, image.height() as f32);
    if w < 1.0 || h < 1.0 {
      return;
    }

    let x_min = ((item.bbox[0] * w).floor() as i32).clamp(0, w as i32 - 1);
    let y_min = ((item.bbox[1] * h).floor() as i32).clamp(0, h as i32 - 1);
    let x_max = ((item.bbox[2] * w).ceil() as i32).clamp(0, w as i32 - 1);
    let y_max = ((item.bbox[3] * h).ceil() as i32).clamp(0, h as i32 - 1);

    if x_min >= x_max || y_min >= y_max {
      return;
    }

    let color = Rgb(class_color(item.class_id));
    for t in 0..BOX_THICKNESS {
      let width = x_max - x_min - 2 * t;
      let height = y_max - y_min - 2 * t;
      if width <= 0 || height <= 0 {
        break;
      }
      let rect = Rect::at(x_min + t, y_min + t).of_size(width as u32 + 1, height as u32 + 1);
      draw_hollow_rect_mut(image, rect, color);
    }

    let Some(font) = &self.font else {
      return;
    };

    let label = self.label_of(item);
    let scale = PxScale::from(self.font_size);
    let (text_w, text_h) = text_size(scale, font, &label);
    let label_h = text_h as i32 + 2 * LABEL_TEXT_VERTICAL_PADDING;

    // 标签放在边框上方，空间不够时放在框内
    let label_x = x_min;
    let label_y = if y_min >= label_h { y_min - label_h } else { y_min };
    let label_w = (text_w as i32 + 2).min(w as i32 - label_x);
    if label_w <= 0 {
      return;
    }

    let rect = Rect::at(label_x, label_y).of_size(label_w as u32, label_h as u32);
    draw_filled_rect_mut(image, rect, color);
    draw_text_mut(
      image,
      Rgb([255u8, 255u8, 255u8]),
      label_x + 1,
      label_y + LABEL_TEXT_VERTICAL_PADDING,
      scale,
      font,
      &label,
    );
  }
}
