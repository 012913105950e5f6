// 该文件是 Biaozhu （标注） 项目的一部分。
// src/input.rs - 图像目录输入
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

use image::{ImageReader, RgbImage};
use thiserror::Error;
use tracing::debug;

/// 可处理的图像扩展名（不区分大小写）
pub const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "tiff"];

#[derive(Error, Debug)]
pub enum InputError {
  #[error("图像目录不存在或不是目录: {0}")]
  NotADirectory(PathBuf),
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("Image loading error: {0}")]
  ImageLoadError(#[from] image::ImageError),
}

pub fn is_image_file(path: &Path) -> bool {
  path
    .extension()
    .and_then(|ext| ext.to_str())
    .is_some_and(|ext| {
      IMAGE_EXTENSIONS
        .iter()
        .any(|known| ext.eq_ignore_ascii_case(known))
    })
}

/// 非递归地列出目录下的图像文件，按文件名排序
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>, InputError> {
  if !dir.is_dir() {
    return Err(InputError::NotADirectory(dir.to_path_buf()));
  }

  let mut images = Vec::new();
  for entry in std::fs::read_dir(dir)? {
    let entry = entry?;
    let path = entry.path();
    if entry.file_type()?.is_dir() {
      continue;
    }
    if is_image_file(&path) {
      images.push(path);
    }
  }
  images.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
  debug!("目录 {} 中找到 {} 张图像", dir.display(), images.len());
  Ok(images)
}

/// 读取并解码为 RGB 图像，格式按内容猜测
pub fn read_image(path: &Path) -> Result<RgbImage, InputError> {
  let image = ImageReader::open(path)?.with_guessed_format()?.decode()?;
  Ok(image.into_rgb8())
}
