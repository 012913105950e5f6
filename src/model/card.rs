// 该文件是 Biaozhu （标注） 项目的一部分。
// src/model/card.rs - JSON 模型卡片
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

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  catalog::{CatalogError, ClassNames},
  model::ModelArtifact,
  url_file_path,
};

#[derive(Error, Debug)]
pub enum ModelCardError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 解析错误: {0}")]
  JsonError(#[from] serde_json::Error),
}

/// 以 JSON 描述的模型元数据。
///
/// 类别名可以放在顶层 `names`，也可以放在 `model.names`；
/// 取值为字符串数组或以整数字符串为键的对象。
#[derive(Debug, Clone)]
pub struct ModelCard {
  names: Option<Value>,
  nested: Option<Box<ModelCard>>,
}

impl ModelCard {
  pub fn open(path: &Path) -> Result<Self, ModelCardError> {
    debug!("读取模型卡片: {}", path.display());
    let text = std::fs::read_to_string(path)?;
    Self::parse(&text)
  }

  pub fn parse(text: &str) -> Result<Self, ModelCardError> {
    let value: Value = serde_json::from_str(text)?;
    Ok(Self::from_value(value))
  }

  pub fn from_value(mut value: Value) -> Self {
    let Some(object) = value.as_object_mut() else {
      return Self {
        names: None,
        nested: None,
      };
    };
    let names = object.remove("names");
    let nested = object
      .remove("model")
      .filter(Value::is_object)
      .map(|inner| {
        let mut inner = Self::from_value(inner);
        // 只向下查看一层
        inner.nested = None;
        Box::new(inner)
      });
    Self { names, nested }
  }
}

fn names_from_value(value: &Value) -> Result<Option<ClassNames>, CatalogError> {
  match value {
    Value::Null => Ok(None),
    Value::Array(items) => items
      .iter()
      .map(|item| match item {
        Value::String(name) => Ok(name.clone()),
        other => Err(CatalogError::UnrecognizedShape(format!(
          "类别名必须是字符串: {}",
          other
        ))),
      })
      .collect::<Result<Vec<_>, _>>()
      .map(|names| Some(ClassNames::Sequence(names))),
    Value::Object(map) => {
      let mut indexed = BTreeMap::new();
      for (key, name) in map {
        let index = key
          .trim()
          .parse::<usize>()
          .map_err(|_| CatalogError::InvalidIndex(key.clone()))?;
        let Value::String(name) = name else {
          return Err(CatalogError::UnrecognizedShape(format!(
            "类别名必须是字符串: {}",
            name
          )));
        };
        indexed.insert(index, name.clone());
      }
      Ok(Some(ClassNames::Indexed(indexed)))
    }
    // 导出工具有时把字典写成字符串
    Value::String(text) => ClassNames::from_literal(text).map(Some),
    other => Err(CatalogError::UnrecognizedShape(other.to_string())),
  }
}

impl ModelArtifact for ModelCard {
  fn names(&self) -> Result<Option<ClassNames>, CatalogError> {
    match &self.names {
      Some(value) => names_from_value(value),
      None => Ok(None),
    }
  }

  fn inner(&self) -> Option<&dyn ModelArtifact> {
    self.nested.as_deref().map(|card| card as &dyn ModelArtifact)
  }
}

impl FromUrlWithScheme for ModelCard {
  const SCHEME: &'static str = "card";
}

impl FromUrl for ModelCard {
  type Error = ModelCardError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ModelCardError::SchemeMismatch(format!(
        "期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      )));
    }
    Self::open(&url_file_path(url))
  }
}
