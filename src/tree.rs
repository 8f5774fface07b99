//! An in-memory path tree.
//!
//! Both the directory resolver and the image model index files into a [`FileTree`]: a tree of
//! [`Directory`] and [`Leaf`] nodes keyed by name, where each node carries a [`FileRef`] pointing
//! at the owner's metadata catalog.  The tree knows nothing about metadata or content; its job is
//! path lookup, including symlink resolution, and the overlay operations needed to stack image
//! layers.
//!
//! All paths are '/'-separated and are cleaned and made absolute before use, so "a/b", "/a/b" and
//! "/a/./c/../b/" all name the same node.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::{archive::glob::Pattern, util::clean_path};

/// The number of symlinks that may be traversed while resolving a single path, like `ELOOP`.
pub const MAX_LINK_DEPTH: usize = 40;

/// A reference to one indexed file: the index into the owner's catalog and the path under which
/// the file was indexed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileRef {
    pub id: u64,
    pub real_path: String,
}

impl FileRef {
    pub fn new(id: u64, real_path: impl Into<String>) -> Self {
        FileRef {
            id,
            real_path: real_path.into(),
        }
    }
}

/// What kind of non-directory node a leaf is, as far as path resolution cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeafKind {
    /// Regular files and special files.
    File,
    /// A symbolic link with its target, verbatim.
    Symlink(String),
    /// A hard link with its (absolute) target.
    Hardlink(String),
}

/// A non-directory node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leaf {
    pub reference: FileRef,
    pub kind: LeafKind,
}

/// A directory node.  Directories created implicitly (because a child was added before its
/// parent) carry no reference.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Directory {
    pub reference: Option<FileRef>,
    entries: BTreeMap<String, Inode>,
}

/// A node in the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inode {
    Directory(Box<Directory>),
    Leaf(Leaf),
}

/// Errors that can occur when modifying a tree.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TreeError {
    /// The path does not name anything that can be added (e.g. a leaf at "/").
    #[error("Invalid filename {0:?}")]
    InvalidFilename(String),
    /// Nothing exists at the path.
    #[error("No such file or directory {0:?}")]
    NotFound(String),
    /// A path component that needs to be a directory is a leaf.
    #[error("Directory entry {0:?} is not a subdirectory")]
    NotADirectory(String),
}

/// How to treat a symlink in the final component of a looked-up path.  Symlinks in all other
/// components are always followed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPolicy {
    /// Return the link itself.
    NoFollowBasename,
    /// Follow the link; a dead link resolves to nothing.
    FollowBasename,
    /// Follow the link; a dead link resolves to the link itself.
    FollowBasenameKeepDead,
}

impl Inode {
    pub fn reference(&self) -> Option<&FileRef> {
        match self {
            Inode::Directory(dir) => dir.reference.as_ref(),
            Inode::Leaf(leaf) => Some(&leaf.reference),
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Inode::Directory(..))
    }

    pub fn leaf(reference: FileRef, kind: LeafKind) -> Self {
        Inode::Leaf(Leaf { reference, kind })
    }

    pub fn directory(reference: Option<FileRef>) -> Self {
        Inode::Directory(Box::new(Directory::new(reference)))
    }
}

impl Directory {
    pub fn new(reference: Option<FileRef>) -> Self {
        Directory {
            reference,
            entries: BTreeMap::new(),
        }
    }

    /// Iterates over all entries in the current directory, in asciibetical order of name.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &Inode)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get(&self, name: &str) -> Option<&Inode> {
        self.entries.get(name)
    }

    fn get_directory_mut_opt(&mut self, dirname: &str) -> Option<&mut Directory> {
        let mut dir = self;
        for name in dirname.split('/').filter(|n| !n.is_empty()) {
            dir = match dir.entries.get_mut(name) {
                Some(Inode::Directory(subdir)) => subdir,
                _ => return None,
            };
        }
        Some(dir)
    }

    /// Like `get_directory_mut_opt()`, but missing directories are created (without a reference).
    fn get_directory_mut_create(&mut self, dirname: &str) -> Result<&mut Directory, TreeError> {
        let mut dir = self;
        for name in dirname.split('/').filter(|n| !n.is_empty()) {
            dir = match dir
                .entries
                .entry(name.to_string())
                .or_insert_with(|| Inode::directory(None))
            {
                Inode::Directory(subdir) => subdir,
                Inode::Leaf(..) => return Err(TreeError::NotADirectory(name.to_string())),
            };
        }
        Ok(dir)
    }

    /// Adds `inode` under `filename`.  A directory placed on top of an existing directory only
    /// updates the reference and keeps the existing entries; anything else replaces what was
    /// there before.
    pub fn merge(&mut self, filename: &str, inode: Inode) {
        if let Inode::Directory(new_dir) = inode {
            if let Some(Inode::Directory(old_dir)) = self.entries.get_mut(filename) {
                old_dir.reference = new_dir.reference;
            } else {
                self.insert(filename, Inode::Directory(new_dir));
            }
        } else {
            self.insert(filename, inode);
        }
    }

    /// Inserts `inode`, completely replacing anything previously stored under `filename`.
    pub fn insert(&mut self, filename: &str, inode: Inode) {
        self.entries.insert(filename.to_string(), inode);
    }

    /// Removes the named entry, if it exists.
    pub fn remove(&mut self, filename: &str) {
        self.entries.remove(filename);
    }

    /// Removes all entries.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Splits a clean absolute path into its directory and final component.
fn split(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((dirname, filename)) => (dirname, filename),
        None => ("", path),
    }
}

fn absolute(path: &str) -> String {
    match path.starts_with('/') {
        true => clean_path(path),
        false => clean_path(&format!("/{path}")),
    }
}

fn child_path(dir: &str, name: &str) -> String {
    match dir {
        "/" => format!("/{name}"),
        _ => format!("{dir}/{name}"),
    }
}

/// A rooted tree of files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTree {
    root: Inode,
}

impl Default for FileTree {
    fn default() -> Self {
        FileTree {
            root: Inode::directory(None),
        }
    }
}

impl FileTree {
    pub fn new() -> Self {
        Self::default()
    }

    fn root_dir_mut(&mut self) -> Result<&mut Directory, TreeError> {
        match &mut self.root {
            Inode::Directory(dir) => Ok(dir),
            Inode::Leaf(..) => Err(TreeError::NotADirectory(String::from("/"))),
        }
    }

    /// Adds `inode` at `path`, creating missing parent directories and merging directories the
    /// way [`Directory::merge()`] does.
    pub fn add(&mut self, path: &str, inode: Inode) -> Result<(), TreeError> {
        let path = absolute(path);
        if path == "/" {
            let Inode::Directory(dir) = inode else {
                return Err(TreeError::InvalidFilename(path));
            };
            self.root_dir_mut()?.reference = dir.reference;
            return Ok(());
        }

        let (dirname, filename) = split(&path);
        self.root_dir_mut()?
            .get_directory_mut_create(dirname)?
            .merge(filename, inode);
        Ok(())
    }

    /// Removes whatever is at `path`.  Missing paths are a no-op.
    pub fn remove(&mut self, path: &str) {
        let path = absolute(path);
        let (dirname, filename) = split(&path);
        let Ok(root) = self.root_dir_mut() else {
            return;
        };
        if let Some(dir) = root.get_directory_mut_opt(dirname) {
            dir.remove(filename);
        }
    }

    /// Removes all entries of the directory at `path`.
    pub fn clear_directory(&mut self, path: &str) -> Result<(), TreeError> {
        let path = absolute(path);
        match self.root_dir_mut()?.get_directory_mut_opt(&path) {
            Some(dir) => {
                dir.clear();
                Ok(())
            }
            None => match self.node(&path) {
                Some(..) => Err(TreeError::NotADirectory(path)),
                None => Err(TreeError::NotFound(path)),
            },
        }
    }

    /// Looks up `path` without following any symlinks.
    pub fn node(&self, path: &str) -> Option<&Inode> {
        let path = absolute(path);
        let mut inode = &self.root;
        for name in path.split('/').filter(|n| !n.is_empty()) {
            let Inode::Directory(dir) = inode else {
                return None;
            };
            inode = dir.entries.get(name)?;
        }
        Some(inode)
    }

    /// Looks up `path`, following symlinks in every directory component and treating the final
    /// component according to `policy`.  Returns the resolved node with its real path.
    pub fn resolve(&self, path: &str, policy: LinkPolicy) -> Option<(String, &Inode)> {
        let mut hops = 0;
        self.resolve_inner(&absolute(path), policy, &mut hops)
    }

    fn resolve_inner(
        &self,
        path: &str,
        policy: LinkPolicy,
        hops: &mut usize,
    ) -> Option<(String, &Inode)> {
        let names: Vec<&str> = path.split('/').filter(|n| !n.is_empty()).collect();
        let mut current_path = String::from("/");
        let mut current = &self.root;

        for (idx, name) in names.iter().enumerate() {
            let Inode::Directory(dir) = current else {
                return None;
            };
            let child = dir.entries.get(*name)?;
            let is_basename = idx + 1 == names.len();

            let target = match child {
                Inode::Leaf(Leaf {
                    kind: LeafKind::Symlink(target),
                    ..
                }) if !is_basename || policy != LinkPolicy::NoFollowBasename => target,
                _ => {
                    current_path = child_path(&current_path, name);
                    current = child;
                    continue;
                }
            };

            *hops += 1;
            if *hops > MAX_LINK_DEPTH {
                log::debug!("too many levels of symbolic links resolving {path:?}");
                return None;
            }

            let target_path = match target.starts_with('/') {
                true => clean_path(target),
                false => clean_path(&format!("{current_path}/{target}")),
            };
            match self.resolve_inner(&target_path, LinkPolicy::FollowBasename, hops) {
                Some((resolved_path, resolved)) => {
                    current_path = resolved_path;
                    current = resolved;
                }
                None if is_basename && policy == LinkPolicy::FollowBasenameKeepDead => {
                    return Some((child_path(&current_path, name), child));
                }
                None => return None,
            }
        }

        Some((current_path, current))
    }

    /// Whether `path` exists, following symlinks in directory components only.
    pub fn has_path(&self, path: &str) -> bool {
        self.resolve(path, LinkPolicy::NoFollowBasename).is_some()
    }

    /// A lazy pre-order walk over every node, in sorted order, starting at "/".
    pub fn walk(&self) -> Walk<'_> {
        Walk {
            stack: vec![(String::from("/"), &self.root)],
        }
    }

    /// All (non-root) paths matching `pattern`, with their nodes.  No links are followed.
    pub fn glob<'a>(
        &'a self,
        pattern: &'a Pattern,
    ) -> impl Iterator<Item = (String, &'a Inode)> + 'a {
        self.walk()
            .skip(1)
            .filter(move |(path, _)| pattern.matches(path))
    }

    /// Iterates lazily over every leaf (non-directory node), in sorted depth-first order.
    pub fn leaves(&self) -> impl Iterator<Item = (String, &Leaf)> + '_ {
        self.walk().filter_map(|(path, inode)| match inode {
            Inode::Leaf(leaf) => Some((path, leaf)),
            Inode::Directory(..) => None,
        })
    }
}

/// See [`FileTree::walk()`].
pub struct Walk<'a> {
    stack: Vec<(String, &'a Inode)>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = (String, &'a Inode);

    fn next(&mut self) -> Option<Self::Item> {
        let (path, inode) = self.stack.pop()?;
        if let Inode::Directory(dir) = inode {
            for (name, child) in dir.entries.iter().rev() {
                self.stack.push((child_path(&path, name), child));
            }
        }
        Some((path, inode))
    }
}
