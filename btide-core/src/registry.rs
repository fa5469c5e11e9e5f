//! Package registry: managed packages keyed by identity.
//!
//! The registry lives behind one shared async mutex ([`SharedRegistry`]). Hold
//! it only to look up, insert or remove entries; clone the [`Package`] out and
//! release the guard before touching its file.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::completion::{self, CompletedChunks};
use crate::manifest::{Manifest, ManifestError};
use crate::merkle::MerkleTree;

/// Shortest identity prefix accepted when removing a package.
pub const MIN_IDENT_PREFIX: usize = 20;

/// The registry guard shared by console, requester and responder.
pub type SharedRegistry = Arc<Mutex<Registry>>;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("malformed manifest: {0}")]
    Manifest(#[from] ManifestError),
    #[error("target file {path}: {source}")]
    Target {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("package {0} is already managed")]
    Duplicate(String),
    #[error("{path} is already the data file of package {owner}")]
    SharedDataFile { path: PathBuf, owner: String },
    #[error("identifier prefix is {len} characters, need at least 20")]
    PrefixTooShort { len: usize },
    #[error("no managed package matches {0}")]
    NotFound(String),
    #[error("package task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Whether `add` found the target file or had to create it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetStatus {
    Existed,
    Created,
}

/// A managed package: its manifest, verification tree and backing file.
/// Cheap to clone; clones share the per-package write lock.
#[derive(Debug, Clone)]
pub struct Package {
    manifest: Arc<Manifest>,
    tree: Arc<MerkleTree>,
    descriptor_path: PathBuf,
    data_path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl Package {
    /// Load the descriptor, make sure `directory/filename` exists with the
    /// declared size, and build the tree. Blocking.
    pub fn open(descriptor: &Path, directory: &Path) -> Result<(Self, TargetStatus), RegistryError> {
        let manifest = Manifest::load(descriptor)?;
        let data_path = directory.join(manifest.filename());
        let status = ensure_target(&data_path, manifest.size()).map_err(|source| {
            RegistryError::Target {
                path: data_path.clone(),
                source,
            }
        })?;
        let tree = MerkleTree::from_manifest(&manifest);
        let mismatched = tree.mismatched_nodes().len();
        if mismatched > 0 {
            tracing::warn!(
                ident = manifest.ident(),
                mismatched,
                "internal hash list disagrees with the rebuilt tree"
            );
        }
        let package = Self {
            manifest: Arc::new(manifest),
            tree: Arc::new(tree),
            descriptor_path: descriptor.to_path_buf(),
            data_path,
            write_lock: Arc::new(Mutex::new(())),
        };
        Ok((package, status))
    }

    pub fn ident(&self) -> &str {
        self.manifest.ident()
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn tree(&self) -> &MerkleTree {
        &self.tree
    }

    pub fn descriptor_path(&self) -> &Path {
        &self.descriptor_path
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    /// Serialises writes into this package's file.
    pub fn write_lock(&self) -> &Arc<Mutex<()>> {
        &self.write_lock
    }

    /// Hash the backing file against the manifest. Blocking.
    pub fn scan(&self) -> std::io::Result<CompletedChunks> {
        completion::scan_file(&self.manifest, &self.data_path)
    }
}

/// Create `path` sized to `size` bytes unless it already exists.
pub fn ensure_target(path: &Path, size: u32) -> std::io::Result<TargetStatus> {
    if path.exists() {
        return Ok(TargetStatus::Existed);
    }
    let file = std::fs::File::create(path)?;
    file.set_len(u64::from(size))?;
    Ok(TargetStatus::Created)
}

/// Managed packages, keyed and listed by identity.
#[derive(Debug, Default)]
pub struct Registry {
    packages: BTreeMap<String, Package>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self) -> SharedRegistry {
        Arc::new(Mutex::new(self))
    }

    pub fn insert(&mut self, package: Package) -> Result<(), RegistryError> {
        let ident = package.ident().to_string();
        if self.packages.contains_key(&ident) {
            return Err(RegistryError::Duplicate(ident));
        }
        if let Some(owner) = self
            .packages
            .values()
            .find(|p| p.data_path() == package.data_path())
        {
            return Err(RegistryError::SharedDataFile {
                path: package.data_path().to_path_buf(),
                owner: owner.ident().to_string(),
            });
        }
        self.packages.insert(ident, package);
        Ok(())
    }

    /// Exact identity lookup.
    pub fn get(&self, ident: &str) -> Option<&Package> {
        self.packages.get(ident)
    }

    /// Exact match, else the first package (by identity order) that starts with `prefix`.
    pub fn find(&self, prefix: &str) -> Option<&Package> {
        if prefix.is_empty() {
            return None;
        }
        if let Some(p) = self.packages.get(prefix) {
            return Some(p);
        }
        self.packages
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .next()
            .filter(|(ident, _)| ident.starts_with(prefix))
            .map(|(_, p)| p)
    }

    /// Remove the package matched by `prefix` (at least [`MIN_IDENT_PREFIX`] characters).
    pub fn remove(&mut self, prefix: &str) -> Result<Package, RegistryError> {
        if prefix.chars().count() < MIN_IDENT_PREFIX {
            return Err(RegistryError::PrefixTooShort {
                len: prefix.chars().count(),
            });
        }
        let ident = self
            .find(prefix)
            .map(|p| p.ident().to_string())
            .ok_or_else(|| RegistryError::NotFound(prefix.to_string()))?;
        self.packages
            .remove(&ident)
            .ok_or(RegistryError::NotFound(ident))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Package> {
        self.packages.values()
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

/// Outcome of [`add_package`].
#[derive(Debug, Clone)]
pub struct AddedPackage {
    pub package: Package,
    pub target: TargetStatus,
    pub completed: CompletedChunks,
}

impl AddedPackage {
    pub fn is_complete(&self) -> bool {
        self.completed.covers(self.package.manifest())
    }
}

/// Load a descriptor, prepare its target file under `directory`, scan it and
/// register it. File work happens before the registry guard is taken.
pub async fn add_package(
    registry: &SharedRegistry,
    descriptor: &Path,
    directory: &Path,
) -> Result<AddedPackage, RegistryError> {
    let descriptor = descriptor.to_path_buf();
    let directory = directory.to_path_buf();
    let (package, target, completed) = tokio::task::spawn_blocking(move || {
        let (package, target) = Package::open(&descriptor, &directory)?;
        let completed = package.scan().map_err(|source| RegistryError::Target {
            path: package.data_path().to_path_buf(),
            source,
        })?;
        Ok::<_, RegistryError>((package, target, completed))
    })
    .await??;

    registry.lock().await.insert(package.clone())?;
    tracing::info!(
        ident = package.ident(),
        path = %package.data_path().display(),
        completed = completed.len(),
        chunks = package.manifest().chunks().len(),
        "package added"
    );
    Ok(AddedPackage {
        package,
        target,
        completed,
    })
}

/// Stop managing the package matched by `prefix`. The data file is left in place.
pub async fn remove_package(registry: &SharedRegistry, prefix: &str) -> Result<Package, RegistryError> {
    let removed = registry.lock().await.remove(prefix)?;
    tracing::info!(ident = removed.ident(), "package removed");
    Ok(removed)
}
