//! Cyclic, optionally shuffled iteration over the files of a directory.

use crate::error::{Error, Result};
use crate::io::list_files;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::path::{Path, PathBuf};

/// One position of a [`FileCycle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleStep {
    /// Cycle index in `[0, cycle_length)`.
    pub index: usize,
    /// File name at this index.
    pub file: String,
    /// Full path of the file.
    pub path: PathBuf,
    /// The index wrapped to 0 (also true on the very first advance).
    pub starts_cycle: bool,
    /// This is the last index of the cycle.
    pub ends_cycle: bool,
}

/// Ordered file list walked in a repeating cycle of configurable length.
///
/// Cycle index `i` addresses `files[i % file_count]`, so a cycle shorter than
/// the listing never visits the tail and a longer one revisits files.
#[derive(Debug, Clone)]
pub struct FileCycle {
    directory: PathBuf,
    files: Vec<String>,
    cycle_length: usize,
    index: Option<usize>,
}

impl FileCycle {
    /// List `directory` for names ending in `extension`, sorted, then
    /// permuted once by a ChaCha8 generator when `seed` is given.
    pub fn create<P: AsRef<Path>>(
        directory: P,
        extension: &str,
        seed: Option<u64>,
    ) -> Result<Self> {
        let directory = directory.as_ref();
        let mut files = list_files(directory, extension)?;
        if files.is_empty() {
            return Err(Error::EmptyDirectory {
                directory: directory.to_path_buf(),
                extension: extension.to_string(),
            });
        }
        if let Some(seed) = seed {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            files.shuffle(&mut rng);
        }
        Self::from_files(directory, files)
    }

    /// Cycle over an explicit, already ordered list. The list must not be
    /// empty.
    pub fn from_files<P: AsRef<Path>>(directory: P, files: Vec<String>) -> Result<Self> {
        let directory = directory.as_ref();
        if files.is_empty() {
            return Err(Error::config(format!(
                "no files to cycle over in {}",
                directory.display()
            )));
        }
        let cycle_length = files.len();
        Ok(Self {
            directory: directory.to_path_buf(),
            files,
            cycle_length,
            index: None,
        })
    }

    /// Set the cycle length (default: the file count).
    pub fn with_cycle_length(mut self, cycle_length: usize) -> Result<Self> {
        if cycle_length == 0 {
            return Err(Error::config("restart cycle length must be at least 1"));
        }
        self.cycle_length = cycle_length;
        Ok(self)
    }

    /// Move to the next index and describe it.
    pub fn advance(&mut self) -> CycleStep {
        let index = match self.index {
            Some(prev) => (prev + 1) % self.cycle_length,
            None => 0,
        };
        self.index = Some(index);
        let file = self.files[index % self.files.len()].clone();
        CycleStep {
            index,
            path: self.directory.join(&file),
            file,
            starts_cycle: index == 0,
            ends_cycle: index + 1 == self.cycle_length,
        }
    }

    /// Return to the state before the first advance.
    pub fn reset(&mut self) {
        self.index = None;
    }

    /// Current index, `None` before the first advance.
    pub fn index(&self) -> Option<usize> {
        self.index
    }

    /// Ordered file names.
    pub fn files(&self) -> &[String] {
        &self.files
    }

    /// Number of listed files.
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Steps per cycle.
    pub fn cycle_length(&self) -> usize {
        self.cycle_length
    }

    /// Listed directory.
    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    fn populated(names: &[&str]) -> TempDir {
        let dir = tempdir().unwrap();
        for name in names {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        dir
    }

    #[test]
    fn test_sorted_listing() {
        let dir = populated(&["b.npz", "a.npz", "c.npz", "notes.txt"]);
        let cycle = FileCycle::create(dir.path(), ".npz", None).unwrap();
        assert_eq!(cycle.files(), &["a.npz", "b.npz", "c.npz"]);
        assert_eq!(cycle.cycle_length(), 3);
    }

    #[test]
    fn test_seeded_permutation_reproducible() {
        let names: Vec<String> = (0..20).map(|i| format!("vol{:02}.npz", i)).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let dir = populated(&refs);

        let a = FileCycle::create(dir.path(), ".npz", Some(7)).unwrap();
        let b = FileCycle::create(dir.path(), ".npz", Some(7)).unwrap();
        assert_eq!(a.files(), b.files());
        assert_ne!(a.files(), names.as_slice());

        let mut sorted = a.files().to_vec();
        sorted.sort();
        assert_eq!(sorted, names);
    }

    #[test]
    fn test_empty_directory() {
        let dir = populated(&["a.nii"]);
        assert!(matches!(
            FileCycle::create(dir.path(), ".npz", None),
            Err(Error::EmptyDirectory { .. })
        ));
    }

    #[test]
    fn test_explicit_list() {
        assert!(matches!(
            FileCycle::from_files("/data", Vec::new()),
            Err(Error::Configuration(_))
        ));

        let files = vec!["b.npz".to_string(), "a.npz".to_string()];
        let mut cycle = FileCycle::from_files("/data", files).unwrap();
        assert_eq!(cycle.cycle_length(), 2);
        let step = cycle.advance();
        assert_eq!(step.file, "b.npz");
        assert_eq!(step.path, Path::new("/data").join("b.npz"));
        assert!(cycle.advance().ends_cycle);
    }

    #[test]
    fn test_wraparound_and_boundary_signal() {
        let dir = populated(&["a.npz", "b.npz", "c.npz", "d.npz"]);
        let mut cycle = FileCycle::create(dir.path(), ".npz", None)
            .unwrap()
            .with_cycle_length(3)
            .unwrap();

        let first = cycle.advance();
        assert_eq!(first.index, 0);
        assert!(first.starts_cycle);

        let mut starts = 0;
        let mut ends = 0;
        for _ in 0..9 {
            let step = cycle.advance();
            starts += usize::from(step.starts_cycle);
            ends += usize::from(step.ends_cycle);
        }
        assert_eq!(starts, 3);
        assert_eq!(ends, 3);
        assert_eq!(cycle.index(), Some(0));
    }

    #[test]
    fn test_long_cycle_revisits_files() {
        let dir = populated(&["a.npz", "b.npz"]);
        let mut cycle = FileCycle::create(dir.path(), ".npz", None)
            .unwrap()
            .with_cycle_length(5)
            .unwrap();
        let files: Vec<String> = (0..5).map(|_| cycle.advance().file).collect();
        assert_eq!(files, vec!["a.npz", "b.npz", "a.npz", "b.npz", "a.npz"]);
        let step = cycle.advance();
        assert!(step.starts_cycle);
        assert_eq!(step.path, dir.path().join("a.npz"));
    }

    #[test]
    fn test_zero_cycle_length_rejected_and_reset() {
        let dir = populated(&["a.npz"]);
        let cycle = FileCycle::create(dir.path(), ".npz", None).unwrap();
        assert!(cycle.clone().with_cycle_length(0).is_err());

        let mut cycle = cycle;
        cycle.advance();
        cycle.reset();
        assert_eq!(cycle.index(), None);
        assert!(cycle.advance().starts_cycle);
    }
}
