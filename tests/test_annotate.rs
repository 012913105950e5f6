mod common;

use std::collections::BTreeMap;

use biaozhu::{
  catalog::CatalogError,
  pipeline::{PipelineError, Progress, annotate},
};
use common::*;

fn cat_dog_bird() -> FakeModel {
  FakeModel::new(&["cat", "dog", "bird"]).detections(vec![
    item(0, 0.9, [0.0, 0.0, 1.0, 1.0]),
    item(1, 0.8, [0.25, 0.25, 0.75, 0.5]),
    item(2, 0.7, [0.0, 0.0, 0.5, 0.5]),
    item(1, 0.2, [0.5, 0.5, 1.0, 1.0]),
  ])
}

#[test]
fn selected_classes_are_remapped() -> anyhow::Result<()> {
  let images = tempfile::TempDir::new()?;
  let labels = tempfile::TempDir::new()?;
  write_image(images.path(), "a.png", 16, 16);

  let model = cat_dog_bird();
  let selection: ClassSelection = ["dog", "bird"].into_iter().collect();
  let steps: Vec<Progress> = annotate(&model, images.path(), labels.path(), 0.25, Some(selection))?
    .collect::<Result<_, _>>()?;

  assert_eq!(
    steps,
    vec![Progress {
      processed: 1,
      total: 1
    }]
  );
  assert_eq!(
    read_to_string(&labels.path().join("classes.txt")),
    "dog\nbird\n"
  );
  assert_eq!(
    read_to_string(&labels.path().join("a.txt")),
    "0 0.500000 0.375000 0.500000 0.250000\n1 0.250000 0.250000 0.500000 0.500000\n"
  );
  Ok(())
}

#[test]
fn absent_selection_keeps_every_class() -> anyhow::Result<()> {
  let images = tempfile::TempDir::new()?;
  let labels = tempfile::TempDir::new()?;
  write_image(images.path(), "a.png", 16, 16);

  let model = cat_dog_bird();
  annotate(&model, images.path(), labels.path(), 0.25, None)?.collect::<Result<Vec<_>, _>>()?;

  assert_eq!(
    read_to_string(&labels.path().join("classes.txt")),
    "cat\ndog\nbird\n"
  );
  let lines: Vec<String> = read_to_string(&labels.path().join("a.txt"))
    .lines()
    .map(str::to_string)
    .collect();
  // 分数低于阈值的检测不会出现
  assert_eq!(lines.len(), 3);
  assert!(lines[0].starts_with("0 "));
  assert!(lines[1].starts_with("1 "));
  assert!(lines[2].starts_with("2 "));
  assert!(model.calls().iter().all(|o| o.classes.is_none()));
  Ok(())
}

#[test]
fn empty_selection_writes_empty_files() -> anyhow::Result<()> {
  let images = tempfile::TempDir::new()?;
  let labels = tempfile::TempDir::new()?;
  write_image(images.path(), "a.png", 16, 16);
  write_image(images.path(), "b.png", 16, 16);

  let model = cat_dog_bird();
  let steps: Vec<Progress> =
    annotate(&model, images.path(), labels.path(), 0.25, Some(ClassSelection::empty()))?
      .collect::<Result<_, _>>()?;

  assert_eq!(steps.len(), 2);
  assert_eq!(read_to_string(&labels.path().join("classes.txt")), "");
  assert_eq!(read_to_string(&labels.path().join("a.txt")), "");
  assert_eq!(read_to_string(&labels.path().join("b.txt")), "");
  Ok(())
}

#[test]
fn image_without_detections_gets_empty_file() -> anyhow::Result<()> {
  let images = tempfile::TempDir::new()?;
  let labels = tempfile::TempDir::new()?;
  write_image(images.path(), "empty.jpg", 16, 16);

  let model = FakeModel::new(&["cat"]);
  annotate(&model, images.path(), labels.path(), 0.25, None)?.collect::<Result<Vec<_>, _>>()?;

  assert_eq!(read_to_string(&labels.path().join("empty.txt")), "");
  Ok(())
}

#[test]
fn undecodable_images_are_skipped() -> anyhow::Result<()> {
  let images = tempfile::TempDir::new()?;
  let labels = tempfile::TempDir::new()?;
  write_image(images.path(), "a.png", 16, 16);
  write_image(images.path(), "b.png", 16, 16);
  write_corrupt_image(images.path(), "bad.jpg");
  write_image(images.path(), "c.png", 16, 16);

  let model = cat_dog_bird();
  let mut run = annotate(&model, images.path(), labels.path(), 0.25, None)?;
  assert_eq!(run.total(), 4);
  let steps: Vec<Progress> = run.by_ref().collect::<Result<_, _>>()?;

  let processed: Vec<(usize, usize)> = steps.iter().map(|p| (p.processed, p.total)).collect();
  assert_eq!(processed, vec![(1, 4), (2, 4), (3, 4)]);
  assert!(steps.iter().all(|p| p.processed <= p.total));
  assert_eq!(run.processed(), 3);
  assert_eq!(run.skipped(), 1);

  assert!(labels.path().join("a.txt").is_file());
  assert!(labels.path().join("c.txt").is_file());
  assert!(!labels.path().join("bad.txt").exists());
  Ok(())
}

#[test]
fn inference_failure_ends_the_run() -> anyhow::Result<()> {
  let images = tempfile::TempDir::new()?;
  let labels = tempfile::TempDir::new()?;
  write_image(images.path(), "a.png", 8, 8);
  write_image(images.path(), "b.png", 13, 8);
  write_image(images.path(), "c.png", 8, 8);

  let model = cat_dog_bird().fail_on_width(13);
  let mut run = annotate(&model, images.path(), labels.path(), 0.25, None)?;

  assert!(matches!(
    run.next(),
    Some(Ok(Progress {
      processed: 1,
      total: 3
    }))
  ));
  assert!(matches!(run.next(), Some(Err(PipelineError::InferError { .. }))));
  assert!(run.next().is_none());

  assert!(labels.path().join("a.txt").is_file());
  assert!(!labels.path().join("b.txt").exists());
  assert!(!labels.path().join("c.txt").exists());
  Ok(())
}

#[test]
fn rerun_produces_identical_output() -> anyhow::Result<()> {
  let images = tempfile::TempDir::new()?;
  let labels = tempfile::TempDir::new()?;
  write_image(images.path(), "a.png", 16, 16);
  write_image(images.path(), "b.bmp", 16, 16);

  let model = cat_dog_bird();
  let snapshot = || -> anyhow::Result<BTreeMap<String, String>> {
    let mut files = BTreeMap::new();
    for entry in std::fs::read_dir(labels.path())? {
      let path = entry?.path();
      files.insert(
        path.file_name().unwrap().to_string_lossy().into_owned(),
        read_to_string(&path),
      );
    }
    Ok(files)
  };

  let selection: ClassSelection = ["cat", "bird"].into_iter().collect();
  annotate(&model, images.path(), labels.path(), 0.25, Some(selection.clone()))?
    .collect::<Result<Vec<_>, _>>()?;
  let first = snapshot()?;
  annotate(&model, images.path(), labels.path(), 0.25, Some(selection))?
    .collect::<Result<Vec<_>, _>>()?;
  let second = snapshot()?;

  assert_eq!(first.len(), 3);
  assert_eq!(first, second);
  Ok(())
}

#[test]
fn listing_is_flat_and_filtered() -> anyhow::Result<()> {
  let images = tempfile::TempDir::new()?;
  let labels = tempfile::TempDir::new()?;
  write_image(images.path(), "upper.PNG", 16, 16);
  write_image(images.path(), "photo.jpeg", 16, 16);
  std::fs::write(images.path().join("notes.txt"), "hello")?;
  let nested = images.path().join("nested");
  std::fs::create_dir(&nested)?;
  write_image(&nested, "deep.png", 16, 16);

  let model = FakeModel::new(&["cat"]);
  let run = annotate(&model, images.path(), labels.path(), 0.25, None)?;
  assert_eq!(run.total(), 2);
  run.collect::<Result<Vec<_>, _>>()?;

  assert!(labels.path().join("upper.txt").is_file());
  assert!(labels.path().join("photo.txt").is_file());
  assert!(!labels.path().join("deep.txt").exists());
  assert!(!labels.path().join("notes.txt").exists());
  Ok(())
}

#[test]
fn missing_names_fall_back_to_placeholders() -> anyhow::Result<()> {
  let images = tempfile::TempDir::new()?;
  let labels = tempfile::TempDir::new()?;

  let model = FakeModel::with_names(None);
  let run = annotate(&model, images.path(), labels.path(), 0.25, None)?;
  assert_eq!(run.total(), 0);
  assert_eq!(run.count(), 0);

  assert_eq!(
    read_to_string(&labels.path().join("classes.txt")),
    "class_0\nclass_1\n"
  );
  Ok(())
}

#[test]
fn names_found_on_wrapped_model() -> anyhow::Result<()> {
  let images = tempfile::TempDir::new()?;
  let labels = tempfile::TempDir::new()?;

  let model = FakeModel::wrapping(FakeModel::new(&["person", "car"]));
  annotate(&model, images.path(), labels.path(), 0.25, None)?.for_each(drop);

  assert_eq!(
    read_to_string(&labels.path().join("classes.txt")),
    "person\ncar\n"
  );
  Ok(())
}

#[test]
fn label_directory_is_created() -> anyhow::Result<()> {
  let images = tempfile::TempDir::new()?;
  let root = tempfile::TempDir::new()?;
  let labels = root.path().join("out").join("labels");
  write_image(images.path(), "a.png", 16, 16);

  let model = cat_dog_bird();
  annotate(&model, images.path(), &labels, 0.25, None)?.collect::<Result<Vec<_>, _>>()?;

  assert!(labels.join("classes.txt").is_file());
  assert!(labels.join("a.txt").is_file());
  Ok(())
}

#[test]
fn setup_errors_are_reported_before_iteration() -> anyhow::Result<()> {
  let root = tempfile::TempDir::new()?;
  let labels = root.path().join("labels");

  let model = cat_dog_bird();
  let missing = root.path().join("no-such-dir");
  assert!(matches!(
    annotate(&model, &missing, &labels, 0.25, None),
    Err(PipelineError::InputError(_))
  ));

  let gap = FakeModel::with_names(Some(ClassNames::Indexed(BTreeMap::from([
    (0, "a".to_string()),
    (2, "c".to_string()),
  ]))));
  assert!(matches!(
    annotate(&gap, root.path(), &labels, 0.25, None),
    Err(PipelineError::CatalogError(CatalogError::IndexGap {
      missing: 1,
      max: 2
    }))
  ));
  Ok(())
}
