mod fixtures;
pub use fixtures::*;

pub use biaozhu::{
  catalog::{ClassNames, ClassSelection},
  model::{DetectItem, DetectResult, InferOptions, Model, ModelArtifact},
};
