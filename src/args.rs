// 该文件是 Biaozhu （标注） 项目的一部分。
// src/args.rs - 项目参数配置
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

use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use url::Url;

use biaozhu::catalog::{ClassCatalog, ClassSelection};

/// Biaozhu 自动标注工具
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  #[command(subcommand)]
  pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
  /// 列出模型目录中的模型文件
  Models {
    /// 模型目录，不存在时自动创建
    #[arg(long, default_value = "models", value_name = "DIR")]
    dir: PathBuf,
  },
  /// 显示模型的类别列表
  Classes {
    /// 模型地址，例如 onnx:///path/yolo.onnx 或 card:///path/model.json
    #[arg(long, value_name = "MODEL")]
    model: String,
  },
  /// 批量标注图像目录
  Annotate {
    /// 模型地址
    #[arg(long, value_name = "MODEL")]
    model: String,
    /// 图像目录
    #[arg(long, value_name = "DIR")]
    images: PathBuf,
    /// 标签输出目录
    #[arg(long, value_name = "DIR")]
    labels: PathBuf,
    /// 置信度阈值 (0.0 - 1.0)
    #[arg(long, default_value = "0.25", value_name = "THRESHOLD", value_parser = parse_confidence)]
    confidence: f32,
    #[command(flatten)]
    selection: SelectionArgs,
  },
  /// 预览单张图像的检测结果
  Preview {
    /// 模型地址
    #[arg(long, value_name = "MODEL")]
    model: String,
    /// 输入图像
    #[arg(long, value_name = "FILE")]
    image: PathBuf,
    /// 保存绘制结果的路径
    #[arg(long, value_name = "FILE")]
    output: PathBuf,
    /// 置信度阈值 (0.0 - 1.0)
    #[arg(long, default_value = "0.25", value_name = "THRESHOLD", value_parser = parse_confidence)]
    confidence: f32,
    #[command(flatten)]
    selection: SelectionArgs,
  },
}

#[derive(clap::Args, Debug, Clone)]
pub struct SelectionArgs {
  /// 只保留这些类别（逗号分隔），默认全部类别
  #[arg(long, value_delimiter = ',', value_name = "NAMES", conflicts_with = "no_classes")]
  pub classes: Option<Vec<String>>,
  /// 不保留任何类别
  #[arg(long)]
  pub no_classes: bool,
  /// 对选择取反
  #[arg(long)]
  pub invert: bool,
}

impl SelectionArgs {
  /// `None` 表示全部类别
  pub fn resolve(&self, catalog: &ClassCatalog) -> Option<ClassSelection> {
    let selection = if self.no_classes {
      Some(ClassSelection::empty())
    } else {
      self
        .classes
        .as_ref()
        .map(|names| names.iter().map(|n| n.trim().to_string()).collect())
    };

    if self.invert {
      let base = selection.unwrap_or_else(|| ClassSelection::all(catalog));
      return Some(base.inverted(catalog));
    }
    selection
  }
}

fn parse_confidence(raw: &str) -> Result<f32, String> {
  let value: f32 = raw.parse().map_err(|_| format!("不是数字: {}", raw))?;
  if (0.0..=1.0).contains(&value) {
    Ok(value)
  } else {
    Err(format!("置信度必须在 0.0 - 1.0 之间: {}", value))
  }
}

/// 解析模型地址；普通文件路径按扩展名推断方案
pub fn model_url(raw: &str) -> Result<Url> {
  if let Ok(url) = Url::parse(raw)
    && url.scheme().len() > 1
  {
    return Ok(url);
  }

  let path = std::path::absolute(raw)?;
  let scheme = match path.extension().and_then(|e| e.to_str()) {
    Some(ext) if ext.eq_ignore_ascii_case("onnx") => "onnx",
    Some(ext) if ext.eq_ignore_ascii_case("json") => "card",
    _ => return Err(anyhow!("无法从文件扩展名推断模型类型: {}", raw)),
  };
  let file_url =
    Url::from_file_path(&path).map_err(|_| anyhow!("无效的模型路径: {}", path.display()))?;
  Ok(Url::parse(&format!("{}://{}", scheme, file_url.path()))?)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn catalog() -> ClassCatalog {
    ClassCatalog::new(vec!["cat".into(), "dog".into(), "bird".into()])
  }

  fn annotate_selection(extra: &[&str]) -> SelectionArgs {
    let mut argv = vec![
      "biaozhu", "annotate", "--model", "m.onnx", "--images", "in", "--labels", "out",
    ];
    argv.extend_from_slice(extra);
    match Args::try_parse_from(argv).unwrap().command {
      Command::Annotate { selection, .. } => selection,
      other => panic!("意外的子命令: {:?}", other),
    }
  }

  fn names(selection: Option<ClassSelection>) -> Option<Vec<String>> {
    selection.map(|s| s.iter().map(str::to_string).collect())
  }

  #[test]
  fn no_flags_select_everything() {
    assert_eq!(annotate_selection(&[]).resolve(&catalog()), None);
  }

  #[test]
  fn class_list_is_trimmed() {
    let selection = annotate_selection(&["--classes", "dog, bird"]);
    assert_eq!(
      names(selection.resolve(&catalog())),
      Some(vec!["bird".to_string(), "dog".to_string()])
    );
  }

  #[test]
  fn no_classes_is_an_empty_selection() {
    let selection = annotate_selection(&["--no-classes"]);
    assert_eq!(
      selection.resolve(&catalog()),
      Some(ClassSelection::empty())
    );
  }

  #[test]
  fn invert_flips_the_selection() {
    let only_dog = annotate_selection(&["--classes", "dog", "--invert"]);
    assert_eq!(
      names(only_dog.resolve(&catalog())),
      Some(vec!["bird".to_string(), "cat".to_string()])
    );

    // 没有 --classes 时从全选取反
    let all = annotate_selection(&["--invert"]);
    assert_eq!(all.resolve(&catalog()), Some(ClassSelection::empty()));

    let none = annotate_selection(&["--no-classes", "--invert"]);
    assert_eq!(none.resolve(&catalog()), Some(ClassSelection::all(&catalog())));
  }

  #[test]
  fn conflicting_or_invalid_flags_are_rejected() {
    let base = [
      "biaozhu", "annotate", "--model", "m.onnx", "--images", "in", "--labels", "out",
    ];
    let with = |extra: &[&'static str]| {
      Args::try_parse_from(base.iter().chain(extra.iter()).copied())
    };
    assert!(with(&["--classes", "cat", "--no-classes"]).is_err());
    assert!(with(&["--confidence", "1.5"]).is_err());
    assert!(with(&["--confidence", "abc"]).is_err());
    assert!(with(&["--confidence", "0.6"]).is_ok());
  }

  #[test]
  fn bare_paths_get_a_scheme_from_the_extension() -> Result<()> {
    let onnx = model_url("weights/my yolo.onnx")?;
    assert_eq!(onnx.scheme(), "onnx");
    assert!(biaozhu::url_file_path(&onnx).ends_with("weights/my yolo.onnx"));
    assert!(biaozhu::url_file_path(&onnx).is_absolute());

    let card = model_url("cards/coco.JSON")?;
    assert_eq!(card.scheme(), "card");
    assert!(biaozhu::url_file_path(&card).ends_with("cards/coco.JSON"));

    assert!(model_url("weights/yolo.pt").is_err());
    assert!(model_url("weights/yolo").is_err());
    Ok(())
  }

  #[test]
  fn explicit_urls_pass_through() -> Result<()> {
    let url = model_url("onnx:///models/yolo.onnx?imgsz=320")?;
    assert_eq!(url.scheme(), "onnx");
    assert_eq!(url.path(), "/models/yolo.onnx");
    assert_eq!(url.query(), Some("imgsz=320"));
    Ok(())
  }
}
