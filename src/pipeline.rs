// 该文件是 Biaozhu （标注） 项目的一部分。
// src/pipeline.rs - 批量标注与单张预览
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
use tracing::{debug, info, warn};

use crate::{
  catalog::{CatalogError, ClassCatalog, ClassSelection, RemapTable, resolve},
  input::{InputError, list_images, read_image},
  model::{InferOptions, Model},
  output::{LabelDirectory, OutputError},
};

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("类别解析错误: {0}")]
  CatalogError(#[from] CatalogError),
  #[error("输入错误: {0}")]
  InputError(#[from] InputError),
  #[error("输出错误: {0}")]
  OutputError(#[from] OutputError),
  #[error("推理错误 ({path}): {source}")]
  InferError {
    path: PathBuf,
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
  },
}

/// 批量标注的进度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
  pub processed: usize,
  pub total: usize,
}

/// 逐张处理图像的惰性迭代器，由 [`annotate`] 创建。
///
/// 每次 `next()` 处理一张成功解码的图像并产出一次进度；无法解码的图像被跳过，
/// 不产出进度。遇到其他错误时产出 `Err`，之后迭代结束。
pub struct Annotate<'m, M: Model> {
  model: &'m M,
  images: std::vec::IntoIter<PathBuf>,
  labels: LabelDirectory,
  remap: RemapTable,
  options: InferOptions,
  total: usize,
  processed: usize,
  skipped: usize,
  failed: bool,
}

/// 准备一次批量标注：创建标签目录、扫描图像、解析类别、写入 `classes.txt`。
///
/// `selection` 为 `None` 时标注全部类别，为空集合时不标注任何类别
/// （仍然为每张图像写入空标签文件）。
pub fn annotate<'m, M: Model>(
  model: &'m M,
  image_dir: &Path,
  label_dir: &Path,
  confidence: f32,
  selection: Option<ClassSelection>,
) -> Result<Annotate<'m, M>, PipelineError> {
  let labels = LabelDirectory::create(label_dir)?;
  let images = list_images(image_dir)?;

  let catalog = resolve(model)?;
  info!("模型类别 (共 {} 个): {:?}", catalog.len(), catalog.names());

  let remap = RemapTable::build(&catalog, selection.as_ref());
  if remap.is_empty() {
    warn!("没有选中任何有效类别，将生成空标签");
  }
  info!("最终标注类别: {:?}", remap.names());

  let manifest = labels.write_manifest(&remap)?;
  debug!("已写入 {}", manifest.display());

  let total = images.len();
  info!("共 {} 张图像待处理", total);
  Ok(Annotate {
    model,
    images: images.into_iter(),
    labels,
    remap,
    options: InferOptions::new(confidence),
    total,
    processed: 0,
    skipped: 0,
    failed: false,
  })
}

impl<M: Model> Annotate<'_, M> {
  pub fn total(&self) -> usize {
    self.total
  }

  pub fn processed(&self) -> usize {
    self.processed
  }

  /// 因无法解码而跳过的图像数量
  pub fn skipped(&self) -> usize {
    self.skipped
  }

  fn process(&mut self, path: &Path, image: &RgbImage) -> Result<Progress, PipelineError> {
    let result = self
      .model
      .infer(image, &self.options)
      .map_err(|e| PipelineError::InferError {
        path: path.to_path_buf(),
        source: Box::new(e),
      })?;
    let kept = self.labels.write_labels(path, &result, &self.remap)?;
    self.processed += 1;
    debug!(
      "{}: 检测 {} 个，保留 {} 个",
      path.display(),
      result.len(),
      kept
    );
    Ok(Progress {
      processed: self.processed,
      total: self.total,
    })
  }
}

impl<M: Model> Iterator for Annotate<'_, M> {
  type Item = Result<Progress, PipelineError>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.failed {
      return None;
    }
    loop {
      let path = self.images.next()?;
      let image = match read_image(&path) {
        Ok(image) => image,
        Err(e) => {
          warn!("跳过无法读取的图像 {}: {}", path.display(), e);
          self.skipped += 1;
          continue;
        }
      };
      let result = self.process(&path, &image);
      if result.is_err() {
        self.failed = true;
      }
      return Some(result);
    }
  }
}

/// 对单张图像运行推理并返回绘制了检测框的图像；图像无法解码时返回 `None`。
///
/// 给出 `selection` 时，只允许推理后端输出选中的类别（使用原始索引，不做重映射）。
pub fn preview_one<M: Model>(
  model: &M,
  image_path: &Path,
  confidence: f32,
  selection: Option<&ClassSelection>,
) -> Result<Option<RgbImage>, PipelineError> {
  let image = match read_image(image_path) {
    Ok(image) => image,
    Err(e) => {
      warn!("预览图像无法读取 {}: {}", image_path.display(), e);
      return Ok(None);
    }
  };

  let classes = match selection {
    Some(selection) => {
      let catalog: ClassCatalog = resolve(model)?;
      let keep = catalog.indices_of(selection);
      debug!("预览限定类别索引: {:?}", keep);
      Some(keep)
    }
    None => None,
  };
  let options = InferOptions::new(confidence).with_classes(classes);

  let result = model
    .infer(&image, &options)
    .map_err(|e| PipelineError::InferError {
      path: image_path.to_path_buf(),
      source: Box::new(e),
    })?;
  Ok(Some(model.plot(&image, &result)))
}
