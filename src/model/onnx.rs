// 该文件是 Biaozhu （标注） 项目的一部分。
// src/model/onnx.rs - ONNX YOLO 检测模型
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

use std::path::PathBuf;
use std::sync::Mutex;

use image::RgbImage;
use ort::{
  session::{Session, builder::GraphOptimizationLevel},
  value::Tensor,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  catalog::{CatalogError, ClassNames, resolve},
  model::{
    DetectResult, InferOptions, Model, ModelArtifact, ModelCard, ModelCardError,
    yolo::{YOLO_INPUT_SIZE, YOLO_IOU_THRESH, YoloOutputError, output_layout, postprocess, preprocess},
  },
  output::{OutputError, draw::Draw},
  url_file_path,
};

/// ONNX 元数据中保存类别名的键
const NAMES_METADATA_KEY: &str = "names";

#[derive(Error, Debug)]
pub enum OnnxYoloError {
  #[error("模型路径错误: {0}")]
  ModelPathError(String),
  #[error("ONNX Runtime 错误: {0}")]
  OrtError(String),
  #[error("参数 {0} 无效: {1}")]
  InvalidParam(&'static str, String),
  #[error("模型无效: {0}")]
  InvalidModel(#[from] YoloOutputError),
  #[error("模型卡片错误: {0}")]
  CardError(#[from] ModelCardError),
  #[error("绘制错误: {0}")]
  DrawError(#[from] OutputError),
  #[error("推理会话被并发访问破坏")]
  SessionPoisoned,
}

fn ort_err(e: impl std::fmt::Display) -> OnnxYoloError {
  OnnxYoloError::OrtError(e.to_string())
}

fn parse_param<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, OnnxYoloError> {
  value
    .parse()
    .map_err(|_| OnnxYoloError::InvalidParam(key, value.to_string()))
}

pub struct OnnxYoloBuilder {
  model_path: PathBuf,
  input_size: u32,
  iou_threshold: f32,
  font: Option<PathBuf>,
  font_size: Option<f32>,
}

impl FromUrlWithScheme for OnnxYoloBuilder {
  const SCHEME: &'static str = "onnx";
}

impl FromUrl for OnnxYoloBuilder {
  type Error = OnnxYoloError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(OnnxYoloError::ModelPathError(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    let mut builder = OnnxYoloBuilder::new(url_file_path(url));
    for (key, value) in url.query_pairs() {
      builder = match key.as_ref() {
        "imgsz" => builder.input_size(parse_param("imgsz", &value)?),
        "iou" => builder.iou_threshold(parse_param("iou", &value)?),
        "font" => builder.font(Some(PathBuf::from(value.as_ref()))),
        "font_size" => builder.font_size(parse_param("font_size", &value)?),
        other => {
          warn!("忽略未知参数: {}", other);
          builder
        }
      };
    }
    Ok(builder)
  }
}

impl OnnxYoloBuilder {
  pub fn new(model_path: PathBuf) -> Self {
    Self {
      model_path,
      input_size: YOLO_INPUT_SIZE,
      iou_threshold: YOLO_IOU_THRESH,
      font: None,
      font_size: None,
    }
  }

  pub fn input_size(mut self, input_size: u32) -> Self {
    self.input_size = input_size;
    self
  }

  pub fn iou_threshold(mut self, iou_threshold: f32) -> Self {
    self.iou_threshold = iou_threshold;
    self
  }

  pub fn font(mut self, font: Option<PathBuf>) -> Self {
    self.font = font;
    self
  }

  pub fn font_size(mut self, font_size: f32) -> Self {
    self.font_size = Some(font_size);
    self
  }

  pub fn build(self) -> Result<OnnxYolo, OnnxYoloError> {
    if self.input_size == 0 {
      return Err(OnnxYoloError::InvalidParam("imgsz", "0".to_string()));
    }

    info!("加载模型文件: {}", self.model_path.display());
    let session = Session::builder()
      .map_err(ort_err)?
      .with_optimization_level(GraphOptimizationLevel::Level3)
      .map_err(ort_err)?
      .commit_from_file(&self.model_path)
      .map_err(ort_err)?;

    let names = session
      .metadata()
      .map_err(ort_err)?
      .custom(NAMES_METADATA_KEY)
      .map_err(ort_err)?;
    debug!("模型元数据 names: {:?}", names);

    // 同名 .json 作为附带的模型卡片
    let card_path = self.model_path.with_extension("json");
    let sidecar = if card_path.is_file() {
      debug!("读取附带的模型卡片: {}", card_path.display());
      Some(ModelCard::open(&card_path)?)
    } else {
      None
    };
    let metadata = OnnxMetadata { names, sidecar };

    // 兜底类别不代表模型真实的类别数
    let (labels, num_classes) = match resolve(&metadata) {
      Ok(catalog) if catalog.is_fallback() => (catalog.names().to_vec(), None),
      Ok(catalog) => (catalog.names().to_vec(), Some(catalog.len())),
      Err(e) => {
        warn!("无法解析类别名，可视化时使用数字索引: {}", e);
        (Vec::new(), None)
      }
    };

    let mut draw = Draw::new(labels);
    if let Some(font) = &self.font {
      draw = draw.with_font_file(font)?;
    }
    if let Some(font_size) = self.font_size {
      draw = draw.with_font_size(font_size);
    }

    let model = OnnxYolo {
      session: Mutex::new(session),
      input_size: self.input_size,
      iou_threshold: self.iou_threshold,
      num_classes,
      metadata,
      draw,
    };

    // 用一次空白输入确认输出布局可以解码
    let size = self.input_size as usize;
    let (shape, _) = model.forward(vec![0f32; 3 * size * size])?;
    let layout = output_layout(&shape, num_classes).inspect_err(|e| {
      error!("模型输出无法解码: {}", e);
    })?;
    debug!("模型输出布局: {:?}", layout);

    info!("模型加载完成");
    Ok(model)
  }
}

/// 模型自带的类别信息：ONNX 元数据和附带的模型卡片
struct OnnxMetadata {
  names: Option<String>,
  sidecar: Option<ModelCard>,
}

impl ModelArtifact for OnnxMetadata {
  fn names(&self) -> Result<Option<ClassNames>, CatalogError> {
    self
      .names
      .as_deref()
      .map(ClassNames::from_literal)
      .transpose()
  }

  fn inner(&self) -> Option<&dyn ModelArtifact> {
    self.sidecar.as_ref().map(|card| card as &dyn ModelArtifact)
  }
}

pub struct OnnxYolo {
  session: Mutex<Session>,
  input_size: u32,
  iou_threshold: f32,
  num_classes: Option<usize>,
  metadata: OnnxMetadata,
  draw: Draw,
}

impl OnnxYolo {
  // 执行一次推理，返回第一个输出的形状和数据
  fn forward(&self, data: Vec<f32>) -> Result<(Vec<usize>, Vec<f32>), OnnxYoloError> {
    let size = self.input_size as usize;
    let input = Tensor::from_array(([1usize, 3, size, size], data)).map_err(ort_err)?;

    let mut session = self
      .session
      .lock()
      .map_err(|_| OnnxYoloError::SessionPoisoned)?;
    let outputs = session.run(ort::inputs![input]).map_err(ort_err)?;
    let (shape, output) = outputs[0].try_extract_tensor::<f32>().map_err(ort_err)?;
    let shape: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
    debug!("模型输出形状: {:?}", shape);
    Ok((shape, output.to_vec()))
  }
}

impl ModelArtifact for OnnxYolo {
  fn names(&self) -> Result<Option<ClassNames>, CatalogError> {
    self.metadata.names()
  }

  fn inner(&self) -> Option<&dyn ModelArtifact> {
    self.metadata.inner()
  }
}

impl Model for OnnxYolo {
  type Error = OnnxYoloError;

  fn infer(&self, image: &RgbImage, options: &InferOptions) -> Result<DetectResult, Self::Error> {
    let (data, letterbox) = preprocess(image, self.input_size);
    debug!("执行模型推理");
    let (shape, output) = self.forward(data)?;

    Ok(postprocess(
      &output,
      &shape,
      self.num_classes,
      &letterbox,
      options,
      self.iou_threshold,
    )?)
  }

  fn plot(&self, image: &RgbImage, result: &DetectResult) -> RgbImage {
    self.draw.draw(image, result)
  }
}
