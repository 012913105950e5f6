// 该文件是 Biaozhu （标注） 项目的一部分。
// src/main.rs - 项目主程序
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

mod args;

use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow, bail};
use clap::Parser;
use tracing::{info, warn};
use url::Url;

use biaozhu::{
  FromUrl, FromUrlWithScheme,
  catalog::{ClassCatalog, resolve},
  model::{ModelCard, discover_models},
  task::{BatchJob, PreviewJob, Worker, WorkerError, WorkerEvent},
};

use args::{Args, Command, SelectionArgs, model_url};

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  match args.command {
    Command::Models { dir } => list_models(&dir),
    Command::Classes { model } => show_classes(&model_url(&model)?),
    Command::Annotate {
      model,
      images,
      labels,
      confidence,
      selection,
    } => run_annotate(&model_url(&model)?, images, labels, confidence, &selection),
    Command::Preview {
      model,
      image,
      output,
      confidence,
      selection,
    } => run_preview(&model_url(&model)?, image, &output, confidence, &selection),
  }
}

/// 加载可推理的模型并启动后台线程
fn spawn_worker(url: &Url) -> Result<(Worker, ClassCatalog)> {
  info!("模型地址: {}", url);

  #[cfg(feature = "model_onnx")]
  {
    use biaozhu::model::OnnxYoloBuilder;
    if url.scheme() == OnnxYoloBuilder::SCHEME {
      let model = OnnxYoloBuilder::from_url(url)?.build()?;
      let catalog = resolve(&model)?;
      return Ok((Worker::spawn(model), catalog));
    }
  }

  Err(unsupported(url))
}

fn load_catalog(url: &Url) -> Result<ClassCatalog> {
  if url.scheme() == ModelCard::SCHEME {
    let card = ModelCard::from_url(url)?;
    return Ok(resolve(&card)?);
  }

  #[cfg(feature = "model_onnx")]
  {
    use biaozhu::model::OnnxYoloBuilder;
    if url.scheme() == OnnxYoloBuilder::SCHEME {
      let model = OnnxYoloBuilder::from_url(url)?.build()?;
      return Ok(resolve(&model)?);
    }
  }

  Err(unsupported(url))
}

fn unsupported(url: &Url) -> anyhow::Error {
  if url.scheme() == ModelCard::SCHEME {
    anyhow!("模型卡片只包含类别信息，不能用于推理: {}", url)
  } else {
    anyhow!("不支持的模型类型: {}", url.scheme())
  }
}

fn list_models(dir: &Path) -> Result<()> {
  let models = discover_models(dir)?;
  if models.is_empty() {
    warn!("{} 中没有模型文件", dir.display());
  }
  for model in models {
    println!("{}", model.display());
  }
  Ok(())
}

fn show_classes(url: &Url) -> Result<()> {
  let catalog = load_catalog(url)?;
  if catalog.is_fallback() {
    warn!("模型没有类别信息，使用默认类别");
  }
  for (index, name) in catalog.names().iter().enumerate() {
    println!("{}: {}", index, name);
  }
  Ok(())
}

fn run_annotate(
  url: &Url,
  image_dir: PathBuf,
  label_dir: PathBuf,
  confidence: f32,
  selection: &SelectionArgs,
) -> Result<()> {
  let (worker, catalog) = spawn_worker(url)?;
  let selection = selection.resolve(&catalog);

  info!("置信度阈值: {}", confidence);
  let now = std::time::Instant::now();
  worker.submit_batch(BatchJob {
    image_dir,
    label_dir,
    confidence,
    selection,
  })?;

  while let Some(event) = worker.recv() {
    match event {
      WorkerEvent::Progress(progress) => {
        let percent = if progress.total > 0 {
          progress.processed * 100 / progress.total
        } else {
          100
        };
        info!(
          "已处理 {}/{} ({}%)",
          progress.processed, progress.total, percent
        );
      }
      WorkerEvent::BatchFinished {
        processed,
        total,
        skipped,
      } => {
        info!(
          "标注完成: {}/{} 张，跳过 {} 张，耗时 {:.2?}",
          processed,
          total,
          skipped,
          now.elapsed()
        );
        return Ok(());
      }
      WorkerEvent::BatchFailed(e) => return Err(e.into()),
      _ => {}
    }
  }
  Err(WorkerError::Disconnected.into())
}

fn run_preview(
  url: &Url,
  image: PathBuf,
  output: &Path,
  confidence: f32,
  selection: &SelectionArgs,
) -> Result<()> {
  let (worker, catalog) = spawn_worker(url)?;
  let selection = selection.resolve(&catalog);

  let generation = worker.request_preview(PreviewJob {
    image,
    confidence,
    selection,
  })?;

  while let Some(event) = worker.recv() {
    match event {
      WorkerEvent::PreviewReady {
        generation: g,
        image,
        preview,
      } if g == generation => {
        let Some(preview) = preview else {
          bail!("无法读取图像: {}", image.display());
        };
        preview.save(output)?;
        info!("预览已保存: {}", output.display());
        return Ok(());
      }
      WorkerEvent::PreviewFailed { error, .. } => return Err(error.into()),
      _ => {}
    }
  }
  Err(WorkerError::Disconnected.into())
}
