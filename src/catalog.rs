// 该文件是 Biaozhu （标注） 项目的一部分。
// src/catalog.rs - 类别目录解析与重映射
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

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;
use tracing::{debug, warn};

use crate::model::ModelArtifact;

/// 模型没有任何类别信息时使用的占位目录
pub const FALLBACK_CLASSES: [&str; 2] = ["class_0", "class_1"];

#[derive(Error, Debug)]
pub enum CatalogError {
  #[error("无法识别的类别元数据形态: {0}")]
  UnrecognizedShape(String),
  #[error("类别索引不是非负整数: {0}")]
  InvalidIndex(String),
  #[error("类别索引不连续，缺少索引 {missing} (最大索引 {max})")]
  IndexGap { missing: usize, max: usize },
  #[error("类别字面量解析错误: {0}")]
  Literal(String),
}

/// 模型携带的原始类别名形态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassNames {
  /// 有序序列，下标即类别索引
  Sequence(Vec<String>),
  /// 以整数为键的映射
  Indexed(BTreeMap<usize, String>),
}

impl ClassNames {
  /// 规整为下标稳定的序列
  pub fn into_ordered(self) -> Result<Vec<String>, CatalogError> {
    match self {
      ClassNames::Sequence(names) => Ok(names),
      ClassNames::Indexed(map) => {
        let Some(&max) = map.keys().next_back() else {
          return Ok(Vec::new());
        };
        let mut names = Vec::with_capacity(max + 1);
        for (expected, (key, name)) in map.into_iter().enumerate() {
          if key != expected {
            return Err(CatalogError::IndexGap {
              missing: expected,
              max,
            });
          }
          names.push(name);
        }
        Ok(names)
      }
    }
  }

  /// 解析模型元数据里常见的文本形式:
  /// `{0: 'person', 1: 'bicycle'}` 或 `['person', 'bicycle']`
  pub fn from_literal(text: &str) -> Result<Self, CatalogError> {
    let mut parser = LiteralParser::new(text);
    parser.skip_ws();
    let names = match parser.peek() {
      Some('{') => ClassNames::Indexed(parser.dict()?),
      Some('[') | Some('(') => ClassNames::Sequence(parser.list()?),
      _ => {
        return Err(CatalogError::UnrecognizedShape(truncate(text)));
      }
    };
    parser.skip_ws();
    if parser.peek().is_some() {
      return Err(CatalogError::Literal(format!(
        "多余的字符，位置 {}",
        parser.pos
      )));
    }
    Ok(names)
  }
}

fn truncate(text: &str) -> String {
  text.chars().take(32).collect()
}

struct LiteralParser {
  chars: Vec<char>,
  pos: usize,
}

impl LiteralParser {
  fn new(text: &str) -> Self {
    Self {
      chars: text.chars().collect(),
      pos: 0,
    }
  }

  fn peek(&self) -> Option<char> {
    self.chars.get(self.pos).copied()
  }

  fn bump(&mut self) -> Option<char> {
    let c = self.peek()?;
    self.pos += 1;
    Some(c)
  }

  fn skip_ws(&mut self) {
    while self.peek().is_some_and(char::is_whitespace) {
      self.pos += 1;
    }
  }

  fn expect(&mut self, want: char) -> Result<(), CatalogError> {
    self.skip_ws();
    match self.bump() {
      Some(c) if c == want => Ok(()),
      Some(c) => Err(CatalogError::Literal(format!(
        "期望 '{}'，实际 '{}'，位置 {}",
        want,
        c,
        self.pos - 1
      ))),
      None => Err(CatalogError::Literal(format!("期望 '{}'，但已到结尾", want))),
    }
  }

  fn string(&mut self) -> Result<String, CatalogError> {
    self.skip_ws();
    let quote = match self.bump() {
      Some(q @ ('\'' | '"')) => q,
      other => {
        return Err(CatalogError::UnrecognizedShape(format!(
          "类别名必须是字符串，位置 {}: {:?}",
          self.pos.saturating_sub(1),
          other
        )));
      }
    };
    let mut out = String::new();
    loop {
      match self.bump() {
        Some('\\') => match self.bump() {
          Some(c) => out.push(c),
          None => break,
        },
        Some(c) if c == quote => return Ok(out),
        Some(c) => out.push(c),
        None => break,
      }
    }
    Err(CatalogError::Literal("字符串未闭合".to_string()))
  }

  fn index(&mut self) -> Result<usize, CatalogError> {
    self.skip_ws();
    let start = self.pos;
    while self
      .peek()
      .is_some_and(|c| !c.is_whitespace() && c != ':')
    {
      self.pos += 1;
    }
    let raw: String = self.chars[start..self.pos].iter().collect();
    let raw = raw.trim_matches(|c| c == '\'' || c == '"');
    raw
      .parse::<usize>()
      .map_err(|_| CatalogError::InvalidIndex(raw.to_string()))
  }

  fn dict(&mut self) -> Result<BTreeMap<usize, String>, CatalogError> {
    self.expect('{')?;
    let mut map = BTreeMap::new();
    loop {
      self.skip_ws();
      if self.peek() == Some('}') {
        self.pos += 1;
        return Ok(map);
      }
      let key = self.index()?;
      self.expect(':')?;
      let name = self.string()?;
      map.insert(key, name);
      self.skip_ws();
      match self.bump() {
        Some(',') => continue,
        Some('}') => return Ok(map),
        _ => return Err(CatalogError::Literal("字典项之间缺少 ','".to_string())),
      }
    }
  }

  fn list(&mut self) -> Result<Vec<String>, CatalogError> {
    self.skip_ws();
    let close = match self.bump() {
      Some('[') => ']',
      Some('(') => ')',
      _ => return Err(CatalogError::Literal("期望列表".to_string())),
    };
    let mut names = Vec::new();
    loop {
      self.skip_ws();
      if self.peek() == Some(close) {
        self.pos += 1;
        return Ok(names);
      }
      names.push(self.string()?);
      self.skip_ws();
      match self.bump() {
        Some(',') => continue,
        Some(c) if c == close => return Ok(names),
        _ => return Err(CatalogError::Literal("列表项之间缺少 ','".to_string())),
      }
    }
  }
}

/// 类别目录的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogSource {
  Model,
  Fallback,
}

/// 有序、下标稳定的类别目录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassCatalog {
  names: Vec<String>,
  source: CatalogSource,
}

impl ClassCatalog {
  pub fn new(names: Vec<String>) -> Self {
    Self {
      names,
      source: CatalogSource::Model,
    }
  }

  pub fn fallback() -> Self {
    Self {
      names: FALLBACK_CLASSES.iter().map(|s| s.to_string()).collect(),
      source: CatalogSource::Fallback,
    }
  }

  pub fn names(&self) -> &[String] {
    &self.names
  }

  pub fn len(&self) -> usize {
    self.names.len()
  }

  pub fn is_empty(&self) -> bool {
    self.names.is_empty()
  }

  pub fn source(&self) -> CatalogSource {
    self.source
  }

  pub fn is_fallback(&self) -> bool {
    self.source == CatalogSource::Fallback
  }

  /// 名称出现在选择集中的原始索引，按目录顺序
  pub fn indices_of(&self, selection: &ClassSelection) -> Vec<usize> {
    self
      .names
      .iter()
      .enumerate()
      .filter(|(_, name)| selection.contains(name))
      .map(|(i, _)| i)
      .collect()
  }
}

/// 从模型元数据解析类别目录。
///
/// 先查看模型自身的类别名，再查看嵌套一层的子对象；两处都没有时返回
/// [`ClassCatalog::fallback`]。元数据存在但形态错误时返回错误。
pub fn resolve(artifact: &dyn ModelArtifact) -> Result<ClassCatalog, CatalogError> {
  let names = match artifact.names()? {
    Some(names) => Some(names),
    None => match artifact.inner() {
      Some(inner) => {
        debug!("模型本身没有类别信息，查看嵌套对象");
        inner.names()?
      }
      None => None,
    },
  };

  match names {
    Some(names) => {
      let names = names.into_ordered()?;
      debug!("解析到 {} 个类别", names.len());
      Ok(ClassCatalog::new(names))
    }
    None => {
      warn!("未找到类别信息，使用默认类别 {:?}", FALLBACK_CLASSES);
      Ok(ClassCatalog::fallback())
    }
  }
}

/// 用户选择的类别名集合；`Option<ClassSelection>` 为 `None` 时表示全部类别
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassSelection {
  names: BTreeSet<String>,
}

impl ClassSelection {
  pub fn empty() -> Self {
    Self::default()
  }

  /// 全选
  pub fn all(catalog: &ClassCatalog) -> Self {
    catalog.names().iter().cloned().collect()
  }

  /// 反选
  pub fn inverted(&self, catalog: &ClassCatalog) -> Self {
    catalog
      .names()
      .iter()
      .filter(|name| !self.contains(name))
      .cloned()
      .collect()
  }

  pub fn toggle(&mut self, name: &str) {
    if !self.names.remove(name) {
      self.names.insert(name.to_string());
    }
  }

  pub fn contains(&self, name: &str) -> bool {
    self.names.contains(name)
  }

  pub fn len(&self) -> usize {
    self.names.len()
  }

  pub fn is_empty(&self) -> bool {
    self.names.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = &str> {
    self.names.iter().map(String::as_str)
  }
}

impl<S: Into<String>> FromIterator<S> for ClassSelection {
  fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
    Self {
      names: iter.into_iter().map(Into::into).collect(),
    }
  }
}

/// 原始类别索引到压缩输出索引的映射
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemapTable {
  mapping: BTreeMap<usize, usize>,
  names: Vec<String>,
}

impl RemapTable {
  /// 按目录顺序为选中的类别分配连续的输出索引
  pub fn build(catalog: &ClassCatalog, selection: Option<&ClassSelection>) -> Self {
    let mut mapping = BTreeMap::new();
    let mut names = Vec::new();
    for (old_id, name) in catalog.names().iter().enumerate() {
      if selection.is_none_or(|s| s.contains(name)) {
        let new_id = names.len();
        debug!("映射: 原索引 {}({}) → 新索引 {}", old_id, name, new_id);
        mapping.insert(old_id, new_id);
        names.push(name.clone());
      }
    }
    Self { mapping, names }
  }

  pub fn remap(&self, old_id: usize) -> Option<usize> {
    self.mapping.get(&old_id).copied()
  }

  /// 输出索引顺序下的类别名，即 `classes.txt` 的内容
  pub fn names(&self) -> &[String] {
    &self.names
  }

  pub fn len(&self) -> usize {
    self.names.len()
  }

  pub fn is_empty(&self) -> bool {
    self.names.is_empty()
  }
}
