use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// File extensions the indexer treats as images.
pub const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "ppm"];

/// A reference to raw image data plus its class label.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Sample {
    pub path: PathBuf,
    pub label: usize,
}

/// Ordered samples of one domain, indexed from a class-per-folder layout.
#[derive(Clone, Debug)]
pub struct DomainCorpus {
    pub root: PathBuf,
    /// Class folder names; the label of a sample is its folder's position here.
    pub class_names: Vec<String>,
    pub samples: Vec<Sample>,
}

impl DomainCorpus {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// File references, parallel to [`DomainCorpus::labels`].
    pub fn paths(&self) -> Vec<PathBuf> {
        self.samples.iter().map(|sample| sample.path.clone()).collect()
    }

    pub fn labels(&self) -> Vec<usize> {
        self.samples.iter().map(|sample| sample.label).collect()
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }
}

/// Scan `root` and index one sample per image file, labelled by class folder.
///
/// Class folders are sorted by name so labels are deterministic across runs and
/// line up between domains that share folder names.
pub fn index_domain(root: &Path) -> Result<DomainCorpus> {
    if !root.is_dir() {
        return Err(Error::Indexing {
            root: root.to_path_buf(),
            reason: "directory does not exist".to_string(),
        });
    }

    let mut class_dirs = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            class_dirs.push(entry.path());
        }
    }
    class_dirs.sort();

    let mut class_names = Vec::with_capacity(class_dirs.len());
    let mut samples = Vec::new();
    for (label, class_dir) in class_dirs.iter().enumerate() {
        let name = class_dir
            .file_name()
            .and_then(|s| s.to_str())
            .ok_or_else(|| Error::Indexing {
                root: root.to_path_buf(),
                reason: format!("class folder {} is not valid UTF-8", class_dir.display()),
            })?;
        class_names.push(name.to_string());

        let pattern = format!("{}/*", glob::Pattern::escape(&class_dir.to_string_lossy()));
        let mut files: Vec<PathBuf> = glob::glob(&pattern)
            .map_err(|err| Error::Indexing {
                root: root.to_path_buf(),
                reason: err.to_string(),
            })?
            .filter_map(std::result::Result::ok)
            .filter(|path| path.is_file() && is_image(path))
            .collect();
        files.sort();
        debug!(class = name, label, files = files.len(), "indexed class folder");
        samples.extend(files.into_iter().map(|path| Sample { path, label }));
    }

    if samples.is_empty() {
        return Err(Error::Indexing {
            root: root.to_path_buf(),
            reason: "no recognised image files".to_string(),
        });
    }

    Ok(DomainCorpus {
        root: root.to_path_buf(),
        class_names,
        samples,
    })
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
        .unwrap_or(false)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    /// Write `per_class` small PNGs into each of `classes` folders under `root`.
    pub(crate) fn write_domain(root: &Path, classes: &[&str], per_class: usize) {
        for (label, class) in classes.iter().enumerate() {
            let dir = root.join(class);
            std::fs::create_dir_all(&dir).unwrap();
            for i in 0..per_class {
                let shade = (label * 40 + i * 7) as u8;
                let img = RgbImage::from_pixel(6, 6, Rgb([shade, 255 - shade, 90]));
                img.save(dir.join(format!("{i:03}.png"))).unwrap();
            }
        }
    }

    #[test]
    fn labels_follow_sorted_class_folders() {
        let dir = tempfile::tempdir().unwrap();
        write_domain(dir.path(), &["mug", "bike", "chair"], 2);
        std::fs::write(dir.path().join("bike").join("notes.txt"), b"skip me").unwrap();

        let corpus = index_domain(dir.path()).unwrap();
        assert_eq!(corpus.class_names, vec!["bike", "chair", "mug"]);
        assert_eq!(corpus.len(), 6);
        assert_eq!(corpus.labels(), vec![0, 0, 1, 1, 2, 2]);
        assert_eq!(corpus.paths().len(), corpus.labels().len());
        assert!(corpus.paths()[0].ends_with("bike/000.png"));
    }

    #[test]
    fn missing_root_is_an_indexing_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = index_domain(&dir.path().join("nowhere")).unwrap_err();
        assert!(matches!(err, Error::Indexing { .. }));
    }

    #[test]
    fn root_without_images_is_an_indexing_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("empty_class")).unwrap();
        let err = index_domain(dir.path()).unwrap_err();
        assert!(matches!(err, Error::Indexing { .. }));
    }
}
