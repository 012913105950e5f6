// 该文件是 Biaozhu （标注） 项目的一部分。
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

use std::path::{Path, PathBuf};

use image::RgbImage;
use tracing::{debug, info};

use crate::catalog::{CatalogError, ClassNames};

/// 可以读取类别元数据的模型制品
pub trait ModelArtifact {
  /// 直接挂在模型上的类别名
  fn names(&self) -> Result<Option<ClassNames>, CatalogError>;

  /// 嵌套一层的子对象
  fn inner(&self) -> Option<&dyn ModelArtifact> {
    None
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InferOptions {
  pub confidence: f32,
  /// 只保留这些原始类别索引，`None` 表示不限制
  pub classes: Option<Vec<usize>>,
}

impl InferOptions {
  pub fn new(confidence: f32) -> Self {
    Self {
      confidence,
      classes: None,
    }
  }

  pub fn with_classes(mut self, classes: Option<Vec<usize>>) -> Self {
    self.classes = classes;
    self
  }

  pub fn allows(&self, class_id: usize) -> bool {
    self
      .classes
      .as_ref()
      .is_none_or(|classes| classes.contains(&class_id))
  }
}

pub trait Model: ModelArtifact {
  type Error: std::error::Error + Send + Sync + 'static;

  fn infer(&self, image: &RgbImage, options: &InferOptions) -> Result<DetectResult, Self::Error>;

  /// 把检测结果画到原图上
  fn plot(&self, image: &RgbImage, result: &DetectResult) -> RgbImage;
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectItem {
  pub class_id: u32,
  pub score: f32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]
}

impl DetectItem {
  /// 归一化的 [cx, cy, w, h]
  pub fn xywhn(&self) -> [f32; 4] {
    let [x_min, y_min, x_max, y_max] = self.bbox;
    [
      (x_min + x_max) / 2.0,
      (y_min + y_max) / 2.0,
      x_max - x_min,
      y_max - y_min,
    ]
  }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectResult {
  pub items: Box<[DetectItem]>,
}

impl DetectResult {
  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }
}

impl From<Vec<DetectItem>> for DetectResult {
  fn from(items: Vec<DetectItem>) -> Self {
    Self {
      items: items.into_boxed_slice(),
    }
  }
}

/// 模型目录中可识别的文件扩展名
pub const MODEL_EXTENSIONS: [&str; 2] = ["onnx", "json"];

/// 列出模型目录下的模型文件，目录不存在时创建空目录
pub fn discover_models(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
  if !dir.exists() {
    info!("模型目录不存在，创建: {}", dir.display());
    std::fs::create_dir_all(dir)?;
    return Ok(Vec::new());
  }

  let mut models = Vec::new();
  for entry in std::fs::read_dir(dir)? {
    let path = entry?.path();
    if !path.is_file() {
      continue;
    }
    let known = path
      .extension()
      .and_then(|ext| ext.to_str())
      .is_some_and(|ext| {
        MODEL_EXTENSIONS
          .iter()
          .any(|known| ext.eq_ignore_ascii_case(known))
      });
    if known {
      models.push(path);
    }
  }
  models.sort();
  debug!("发现 {} 个模型文件", models.len());
  Ok(models)
}

pub mod card;
pub mod yolo;
pub use self::card::{ModelCard, ModelCardError};

#[cfg(feature = "model_onnx")]
mod onnx;
#[cfg(feature = "model_onnx")]
pub use self::onnx::{OnnxYolo, OnnxYoloBuilder, OnnxYoloError};
