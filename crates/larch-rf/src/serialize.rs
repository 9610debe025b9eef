//! Per-tree persistence: one gzip-compressed bincode file per tree.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, info, instrument};

use crate::error::ForestError;
use crate::forest::{Forest, TreeStorage};
use crate::tree::Tree;

/// Current tree file format version.
const FORMAT_VERSION: u32 = 1;

/// Extension of tree files inside a forest directory.
pub const TREE_FILE_EXTENSION: &str = "tree";

/// File recording how many trees have been written into a forest directory.
pub const TREE_COUNT_FILE: &str = "tree-count";

/// Versioned envelope written for each tree.
#[derive(Serialize)]
struct TreeEnvelopeRef<'a, O> {
    format_version: u32,
    /// Position of the tree within its forest.
    tree_index: usize,
    tree: &'a Tree<O>,
}

#[derive(serde::Deserialize)]
struct TreeEnvelope<O> {
    format_version: u32,
    tree_index: usize,
    tree: Tree<O>,
}

/// Leading field of every envelope, read before the full tree.
#[derive(serde::Deserialize)]
struct EnvelopeHeader {
    format_version: u32,
}

/// File name of tree `index`; zero padding keeps name order equal to index order.
#[must_use]
pub fn tree_file_name(index: usize) -> String {
    format!("tree-{index:06}.{TREE_FILE_EXTENSION}")
}

/// Write tree `index` into `directory`, returning the file's path.
pub(crate) fn write_tree<O: Serialize>(
    directory: &Path,
    index: usize,
    tree: &Tree<O>,
) -> Result<PathBuf, ForestError> {
    let envelope = TreeEnvelopeRef {
        format_version: FORMAT_VERSION,
        tree_index: index,
        tree,
    };
    let bytes = bincode::serialize(&envelope).map_err(|source| ForestError::SerializeTree {
        tree_index: index,
        source,
    })?;

    let path = directory.join(tree_file_name(index));
    let write_error = |source| ForestError::WriteTree {
        path: path.clone(),
        source,
    };
    let file = File::create(&path).map_err(write_error)?;
    let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    encoder.write_all(&bytes).map_err(write_error)?;
    encoder
        .finish()
        .map_err(write_error)?
        .flush()
        .map_err(write_error)?;

    debug!(tree_index = index, size_bytes = bytes.len(), path = %path.display(), "tree written");
    Ok(path)
}

/// Read one tree file.
///
/// # Errors
///
/// | Variant | When |
/// |---|---|
/// | [`ForestError::ReadTree`] | the file cannot be opened or decompressed |
/// | [`ForestError::DeserializeTree`] | bincode decoding failed |
/// | [`ForestError::IncompatibleTreeVersion`] | format version mismatch |
pub fn read_tree<O: DeserializeOwned>(path: impl AsRef<Path>) -> Result<Tree<O>, ForestError> {
    let path = path.as_ref();
    let read_error = |source| ForestError::ReadTree {
        path: path.to_path_buf(),
        source,
    };
    let deserialize_error = |source| ForestError::DeserializeTree {
        path: path.to_path_buf(),
        source,
    };

    let file = File::open(path).map_err(read_error)?;
    let mut bytes = Vec::new();
    GzDecoder::new(BufReader::new(file))
        .read_to_end(&mut bytes)
        .map_err(read_error)?;

    let header: EnvelopeHeader = bincode::deserialize(&bytes).map_err(deserialize_error)?;
    if header.format_version != FORMAT_VERSION {
        return Err(ForestError::IncompatibleTreeVersion {
            expected: FORMAT_VERSION,
            found: header.format_version,
            path: path.to_path_buf(),
        });
    }

    let envelope: TreeEnvelope<O> = bincode::deserialize(&bytes).map_err(deserialize_error)?;
    debug!(
        format_version = envelope.format_version,
        tree_index = envelope.tree_index,
        n_nodes = envelope.tree.n_nodes(),
        "tree read"
    );
    Ok(envelope.tree)
}

/// Record that `count` trees have been written into `directory`.
pub(crate) fn write_tree_count(directory: &Path, count: usize) -> Result<(), ForestError> {
    let path = directory.join(TREE_COUNT_FILE);
    std::fs::write(&path, format!("{count}\n"))
        .map_err(|source| ForestError::WriteTree { path, source })
}

/// Read the number of trees recorded in `directory`, if a record exists.
///
/// # Errors
///
/// Returns [`ForestError::ReadTree`] if the record exists but cannot be read or parsed.
pub fn read_tree_count(directory: impl AsRef<Path>) -> Result<Option<usize>, ForestError> {
    let path = directory.as_ref().join(TREE_COUNT_FILE);
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(ForestError::ReadTree { path, source }),
    };
    text.trim().parse().map(Some).map_err(|e| ForestError::ReadTree {
        path,
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
    })
}

/// Tree files directly inside `directory`, sorted by file name.
pub(crate) fn list_tree_files(directory: &Path) -> Result<Vec<PathBuf>, ForestError> {
    let read_error = |source| ForestError::ReadTree {
        path: directory.to_path_buf(),
        source,
    };
    let mut files = Vec::new();
    for entry in std::fs::read_dir(directory).map_err(read_error)? {
        let path = entry.map_err(read_error)?.path();
        if path.is_file() && path.extension().is_some_and(|e| e == TREE_FILE_EXTENSION) {
            files.push(path);
        }
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

/// A directory of tree files, listed once when opened.
#[derive(Debug, Clone)]
pub struct TreeDirectory {
    path: PathBuf,
    files: Vec<PathBuf>,
}

impl TreeDirectory {
    /// List the tree files in `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ForestError::ReadTree`] if the directory cannot be listed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ForestError> {
        let path = path.as_ref().to_path_buf();
        let files = list_tree_files(&path)?;
        Ok(Self { path, files })
    }

    /// Return the directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Return the tree files in load order.
    #[must_use]
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Return the number of tree files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Return `true` if the directory held no tree files.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Read the trees one at a time, in file name order.
    pub fn iter<O: DeserializeOwned>(&self) -> impl Iterator<Item = Result<Tree<O>, ForestError>> + '_ {
        self.files.iter().map(|path| read_tree(path))
    }
}

impl<O, C> Forest<O, C> {
    /// Wrap the tree files of `directory` without loading them.
    ///
    /// Trees are read from disk each time the forest is evaluated.
    ///
    /// # Errors
    ///
    /// Returns [`ForestError::ReadTree`] if the directory cannot be listed.
    #[instrument(skip_all, fields(path = %directory.as_ref().display()))]
    pub fn open_directory(directory: impl AsRef<Path>, combiner: C) -> Result<Self, ForestError> {
        let directory = TreeDirectory::open(directory)?;
        debug!(n_trees = directory.len(), "tree directory opened");
        Ok(Self {
            storage: TreeStorage::OnDisk(directory),
            combiner,
        })
    }
}

impl<O: DeserializeOwned, C> Forest<O, C> {
    /// Load every tree of `directory` into memory.
    ///
    /// # Errors
    ///
    /// Any error from [`TreeDirectory::open`] or [`read_tree`].
    #[instrument(skip_all, fields(path = %directory.as_ref().display()))]
    pub fn load_directory(directory: impl AsRef<Path>, combiner: C) -> Result<Self, ForestError> {
        let directory = TreeDirectory::open(directory)?;
        let trees = directory.iter().collect::<Result<Vec<Tree<O>>, _>>()?;
        info!(n_trees = trees.len(), "forest loaded");
        Ok(Self::from_trees(trees, combiner))
    }
}

impl<O: Serialize + DeserializeOwned + Clone, C> Forest<O, C> {
    /// Write every tree into `directory`, one file per tree.
    ///
    /// # Errors
    ///
    /// | Variant | When |
    /// |---|---|
    /// | [`ForestError::CreateDirectory`] | `directory` cannot be created |
    /// | [`ForestError::TreeDirectoryNotEmpty`] | `directory` already holds tree files |
    /// | [`ForestError::SerializeTree`] | bincode encoding failed |
    /// | [`ForestError::WriteTree`] | a file write failed |
    #[instrument(skip_all, fields(path = %directory.as_ref().display()))]
    pub fn save_to_directory(&self, directory: impl AsRef<Path>) -> Result<(), ForestError> {
        let directory = directory.as_ref();
        std::fs::create_dir_all(directory).map_err(|source| ForestError::CreateDirectory {
            path: directory.to_path_buf(),
            source,
        })?;
        let found = list_tree_files(directory)?.len();
        if found > 0 {
            return Err(ForestError::TreeDirectoryNotEmpty {
                path: directory.to_path_buf(),
                found,
            });
        }

        for (index, tree) in self.trees().enumerate() {
            write_tree(directory, index, &*tree?)?;
        }
        write_tree_count(directory, self.n_trees())?;

        info!(n_trees = self.n_trees(), "forest saved");
        Ok(())
    }
}
