// 该文件是 Biaozhu （标注） 项目的一部分。
// src/output/label_directory.rs - YOLO 标签目录输出
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

use tracing::{debug, trace};

use crate::{
  catalog::RemapTable,
  model::{DetectItem, DetectResult},
  output::OutputError,
};

pub const MANIFEST_FILE_NAME: &str = "classes.txt";

/// `<id> <cx> <cy> <w> <h>`，坐标保留 6 位小数
pub fn format_label_line(class_id: usize, item: &DetectItem) -> String {
  let [cx, cy, w, h] = item.xywhn();
  format!("{} {:.6} {:.6} {:.6} {:.6}\n", class_id, cx, cy, w, h)
}

/// 存放 `classes.txt` 和每张图像标签文件的目录
#[derive(Debug, Clone)]
pub struct LabelDirectory {
  directory: PathBuf,
}

impl LabelDirectory {
  /// 目录不存在时递归创建
  pub fn create(directory: &Path) -> Result<Self, OutputError> {
    std::fs::create_dir_all(directory).map_err(|source| OutputError::CreateDirError {
      path: directory.to_path_buf(),
      source,
    })?;
    Ok(Self {
      directory: directory.to_path_buf(),
    })
  }

  pub fn path(&self) -> &Path {
    &self.directory
  }

  pub fn manifest_path(&self) -> PathBuf {
    self.directory.join(MANIFEST_FILE_NAME)
  }

  /// 每行一个类别名，按输出索引排列，覆盖已有文件
  pub fn write_manifest(&self, remap: &RemapTable) -> Result<PathBuf, OutputError> {
    let path = self.manifest_path();
    let content: String = remap.names().iter().map(|name| format!("{}\n", name)).collect();
    write_file(&path, &content)?;
    debug!("写入 {}: {} 个类别", path.display(), remap.len());
    Ok(path)
  }

  /// 图像对应的标签文件：去掉原扩展名，统一使用 `.txt`
  pub fn label_path(&self, image: &Path) -> Result<PathBuf, OutputError> {
    let stem = image
      .file_stem()
      .ok_or_else(|| OutputError::NoFileName(image.to_path_buf()))?;
    let mut name = stem.to_os_string();
    name.push(".txt");
    Ok(self.directory.join(name))
  }

  /// 写入一张图像的标签，返回保留下来的检测框数量。
  ///
  /// 未被选中的类别会被丢弃；没有任何检测框时仍然写入空文件。
  pub fn write_labels(
    &self,
    image: &Path,
    result: &DetectResult,
    remap: &RemapTable,
  ) -> Result<usize, OutputError> {
    let path = self.label_path(image)?;
    let mut content = String::new();
    let mut kept = 0;
    for item in result.items.iter() {
      let Some(new_id) = remap.remap(item.class_id as usize) else {
        trace!("跳过未选中的类别: {}", item.class_id);
        continue;
      };
      content.push_str(&format_label_line(new_id, item));
      kept += 1;
    }
    write_file(&path, &content)?;
    Ok(kept)
  }
}

fn write_file(path: &Path, content: &str) -> Result<(), OutputError> {
  std::fs::write(path, content).map_err(|source| OutputError::WriteError {
    path: path.to_path_buf(),
    source,
  })
}
