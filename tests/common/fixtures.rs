use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use biaozhu::{
  catalog::{CatalogError, ClassNames},
  model::{DetectItem, DetectResult, InferOptions, Model, ModelArtifact},
  output::draw::Draw,
};
use image::{ImageBuffer, Rgb, RgbImage};

#[derive(Debug, thiserror::Error)]
#[error("模拟的推理失败")]
pub struct FakeError;

/// 对每张图像都返回同一组检测结果的模型。
///
/// 和真实后端一样遵守 `InferOptions`：先限定类别，再按置信度过滤。
pub struct FakeModel {
  names: Option<ClassNames>,
  nested: Option<Box<FakeModel>>,
  detections: Vec<DetectItem>,
  fail_on_width: Option<u32>,
  delay: Duration,
  calls: Mutex<Vec<InferOptions>>,
}

impl FakeModel {
  pub fn new(names: &[&str]) -> Self {
    Self::with_names(Some(ClassNames::Sequence(
      names.iter().map(|n| n.to_string()).collect(),
    )))
  }

  pub fn with_names(names: Option<ClassNames>) -> Self {
    Self {
      names,
      nested: None,
      detections: Vec::new(),
      fail_on_width: None,
      delay: Duration::ZERO,
      calls: Mutex::new(Vec::new()),
    }
  }

  /// 类别名只在嵌套的内层模型上
  pub fn wrapping(inner: FakeModel) -> Self {
    let mut outer = Self::with_names(None);
    outer.nested = Some(Box::new(inner));
    outer
  }

  pub fn detections(mut self, detections: Vec<DetectItem>) -> Self {
    self.detections = detections;
    self
  }

  /// 图像宽度恰好等于该值时推理失败
  pub fn fail_on_width(mut self, width: u32) -> Self {
    self.fail_on_width = Some(width);
    self
  }

  pub fn delay(mut self, delay: Duration) -> Self {
    self.delay = delay;
    self
  }

  pub fn calls(&self) -> Vec<InferOptions> {
    self.calls.lock().unwrap().clone()
  }
}

impl ModelArtifact for FakeModel {
  fn names(&self) -> Result<Option<ClassNames>, CatalogError> {
    Ok(self.names.clone())
  }

  fn inner(&self) -> Option<&dyn ModelArtifact> {
    self.nested.as_deref().map(|m| m as &dyn ModelArtifact)
  }
}

impl Model for FakeModel {
  type Error = FakeError;

  fn infer(&self, image: &RgbImage, options: &InferOptions) -> Result<DetectResult, FakeError> {
    self.calls.lock().unwrap().push(options.clone());
    if !self.delay.is_zero() {
      std::thread::sleep(self.delay);
    }
    if self.fail_on_width == Some(image.width()) {
      return Err(FakeError);
    }
    let items: Vec<DetectItem> = self
      .detections
      .iter()
      .filter(|item| options.allows(item.class_id as usize) && item.score >= options.confidence)
      .cloned()
      .collect();
    Ok(DetectResult::from(items))
  }

  fn plot(&self, image: &RgbImage, result: &DetectResult) -> RgbImage {
    Draw::new(Vec::new()).draw(image, result)
  }
}

pub fn item(class_id: u32, score: f32, bbox: [f32; 4]) -> DetectItem {
  DetectItem {
    class_id,
    score,
    bbox,
  }
}

/// 写入指定尺寸的纯灰色 PNG
pub fn write_image(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
  let img: RgbImage = ImageBuffer::from_fn(width, height, |_, _| Rgb([128u8, 128u8, 128u8]));
  let path = dir.join(name);
  img
    .save_with_format(&path, image::ImageFormat::Png)
    .expect("无法保存测试图像");
  path
}

/// 写入扩展名像图像但无法解码的文件
pub fn write_corrupt_image(dir: &Path, name: &str) -> PathBuf {
  let path = dir.join(name);
  std::fs::write(&path, b"definitely not an image").expect("无法写入损坏的图像");
  path
}

pub fn read_to_string(path: &Path) -> String {
  std::fs::read_to_string(path)
    .unwrap_or_else(|e| panic!("无法读取 {}: {}", path.display(), e))
}

/// 模型交给后台线程后，测试仍可查看它的调用记录
pub struct SharedModel(pub std::sync::Arc<FakeModel>);

impl ModelArtifact for SharedModel {
  fn names(&self) -> Result<Option<ClassNames>, CatalogError> {
    self.0.names()
  }

  fn inner(&self) -> Option<&dyn ModelArtifact> {
    self.0.inner()
  }
}

impl Model for SharedModel {
  type Error = FakeError;

  fn infer(&self, image: &RgbImage, options: &InferOptions) -> Result<DetectResult, FakeError> {
    self.0.infer(image, options)
  }

  fn plot(&self, image: &RgbImage, result: &DetectResult) -> RgbImage {
    self.0.plot(image, result)
  }
}
