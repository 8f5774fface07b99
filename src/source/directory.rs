use std::{
    collections::{BTreeMap, HashSet, VecDeque},
    fmt,
    fs::{self, File, Metadata},
    io::Read,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use walkdir::WalkDir;

use super::{mime, FileMetadata, FileResolver, FileType, Location};
use crate::{
    archive::glob::Pattern,
    tree::{FileRef, FileTree, Inode, LeafKind, LinkPolicy},
    util::{clean_path, parent_path},
};

/// OS runtime pseudo-filesystems that are never indexed.
const UNIX_SYSTEM_RUNTIME_PREFIXES: [&str; 3] = ["/proc", "/dev", "/sys"];

/// Decides whether a host path is left out of the index.  Returning `true` skips the path (and,
/// for directories, everything below it).
pub type PathFilter = Box<dyn Fn(&Path, &Metadata) -> bool>;

/// Matches root-relative paths, so a root that itself lives below one of the prefixes is still
/// indexed.
fn is_unix_system_runtime_path(path: &str) -> bool {
    UNIX_SYSTEM_RUNTIME_PREFIXES
        .iter()
        .any(|prefix| Path::new(path).starts_with(prefix))
}

fn is_unallowable_file_type(_: &Path, metadata: &Metadata) -> bool {
    matches!(
        FileType::from_mode(metadata.mode()),
        FileType::CharacterDevice
            | FileType::BlockDevice
            | FileType::Fifo
            | FileType::Socket
            | FileType::Irregular
    )
}

/// Resolves paths in a directory on the host.
///
/// The directory is indexed once, up front.  Paths in requests and results are absolute and
/// relative to the root: the root itself is "/".  Symlinks are resolved inside the root, the way
/// they would be after a `chroot`, so an absolute link target never escapes to the host.
pub struct DirectoryResolver {
    root: PathBuf,
    tree: FileTree,
    metadata: Vec<FileMetadata>,
    refs_by_mime_type: BTreeMap<String, Vec<FileRef>>,
    filters: Vec<PathFilter>,
    errors: BTreeMap<PathBuf, String>,
}

impl fmt::Debug for DirectoryResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryResolver")
            .field("root", &self.root)
            .field("files", &self.metadata.len())
            .field("errors", &self.errors.len())
            .finish()
    }
}

impl DirectoryResolver {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        Self::with_filters(root, vec![])
    }

    /// Indexes `root`, skipping devices, sockets, FIFOs, the OS runtime paths and anything
    /// rejected by one of `filters`.
    pub fn with_filters(root: impl AsRef<Path>, filters: Vec<PathFilter>) -> Result<Self> {
        let root = root.as_ref();
        let root = fs::canonicalize(root)
            .with_context(|| format!("Could not evaluate root {root:?}"))?;

        let mut all_filters: Vec<PathFilter> = vec![Box::new(is_unallowable_file_type)];
        all_filters.extend(filters);

        let mut resolver = DirectoryResolver {
            root,
            tree: FileTree::new(),
            metadata: vec![],
            refs_by_mime_type: BTreeMap::new(),
            filters: all_filters,
            errors: BTreeMap::new(),
        };
        resolver.index_all_roots();
        Ok(resolver)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Host paths that could not be indexed, with the reason.
    pub fn errors(&self) -> impl Iterator<Item = (&Path, &str)> {
        self.errors.iter().map(|(k, v)| (k.as_path(), v.as_str()))
    }

    /// Indexes the root, then every symlink target discovered on the way, each exactly once.
    fn index_all_roots(&mut self) {
        let mut queue = VecDeque::from([String::from("/")]);
        let mut queued = HashSet::from([String::from("/")]);

        while let Some(start) = queue.pop_front() {
            for new_root in self.index_tree(&start) {
                if queued.insert(new_root.clone()) {
                    queue.push_back(new_root);
                }
            }
        }
    }

    fn host_path(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    fn response_path(&self, host_path: &Path) -> String {
        match host_path.strip_prefix(&self.root) {
            Ok(relative) => clean_path(&format!("/{}", relative.to_string_lossy())),
            Err(..) => clean_path(&host_path.to_string_lossy()),
        }
    }

    fn has_been_indexed(&self, path: &str) -> bool {
        self.tree
            .node(path)
            .and_then(Inode::reference)
            .is_some()
    }

    fn record_error(&mut self, path: PathBuf, error: String) {
        log::debug!("unable to index {path:?}: {error}");
        self.errors.insert(path, error);
    }

    /// Walks the tree below `start`, returning the symlink targets found.
    fn index_tree(&mut self, start: &str) -> Vec<String> {
        log::debug!("indexing filesystem path {start:?} in {:?}", self.root);
        let mut roots = vec![];
        let mut walker = WalkDir::new(self.host_path(start))
            .follow_root_links(false)
            .sort_by_file_name()
            .into_iter();

        while let Some(entry) = walker.next() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                    self.record_error(path, e.to_string());
                    continue;
                }
            };

            let path = self.response_path(entry.path());
            let is_dir = entry.file_type().is_dir();
            if self.has_been_indexed(&path) {
                if is_dir {
                    walker.skip_current_dir();
                }
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) => {
                    self.record_error(entry.path().to_path_buf(), e.to_string());
                    continue;
                }
            };
            if is_unix_system_runtime_path(&path)
                || self.filters.iter().any(|filter| filter(entry.path(), &metadata))
            {
                log::trace!("filtered {:?}", entry.path());
                if is_dir {
                    walker.skip_current_dir();
                }
                continue;
            }

            match self.add_path_to_index(entry.path(), &path, &metadata) {
                Ok(Some(new_root)) => roots.push(new_root),
                Ok(None) => {}
                Err(e) => self.record_error(entry.path().to_path_buf(), format!("{e:#}")),
            }
        }

        roots
    }

    fn add_path_to_index(
        &mut self,
        host_path: &Path,
        path: &str,
        stat: &Metadata,
    ) -> Result<Option<String>> {
        let mut metadata = FileMetadata {
            mode: stat.mode() & 0o7777,
            file_type: FileType::from_mode(stat.mode()),
            user_id: stat.uid(),
            group_id: stat.gid(),
            link_destination: String::new(),
            size: stat.len(),
            mime_type: String::new(),
        };

        let (kind, new_root) = match metadata.file_type {
            FileType::Directory => (None, None),
            FileType::RegularFile => {
                match File::open(host_path).and_then(|mut file| mime::sniff_reader(&mut file)) {
                    Ok(mime_type) => metadata.mime_type = mime_type.to_string(),
                    Err(e) => log::debug!("unable to sniff MIME type of {host_path:?}: {e}"),
                }
                (Some(LeafKind::File), None)
            }
            FileType::SymbolicLink => {
                let target = fs::read_link(host_path)
                    .with_context(|| format!("Unable to readlink {host_path:?}"))?;
                let target = target.to_string_lossy();
                let target = match target.starts_with('/') {
                    true => clean_path(&target),
                    false => clean_path(&format!("{}/{target}", parent_path(path))),
                };
                metadata.link_destination = target.clone();
                (Some(LeafKind::Symlink(target.clone())), Some(target))
            }
            other => bail!("Unsupported file type: {other}"),
        };

        let reference = FileRef::new(self.metadata.len() as u64, path);
        if !metadata.mime_type.is_empty() {
            self.refs_by_mime_type
                .entry(metadata.mime_type.clone())
                .or_default()
                .push(reference.clone());
        }
        let inode = match kind {
            Some(kind) => Inode::leaf(reference, kind),
            None => Inode::directory(Some(reference)),
        };
        self.tree.add(path, inode)?;
        self.metadata.push(metadata);

        Ok(new_root)
    }

    fn location(&self, virtual_path: &str, reference: &FileRef) -> Location {
        Location::from_directory(reference.real_path.clone(), reference.clone())
            .with_virtual_path(virtual_path)
    }

    fn resolve(&self, path: &str) -> Option<Location> {
        let request = clean_path(&format!("/{path}"));
        let (_, inode) = self.tree.resolve(&request, LinkPolicy::FollowBasename)?;
        if inode.is_dir() {
            return None;
        }
        Some(self.location(&request, inode.reference()?))
    }
}

impl FileResolver for DirectoryResolver {
    fn has_path(&self, path: &str) -> bool {
        self.tree.has_path(path)
    }

    fn files_by_path(&self, paths: &[&str]) -> Result<Vec<Location>> {
        Ok(paths.iter().filter_map(|path| self.resolve(path)).collect())
    }

    fn files_by_glob(&self, patterns: &[&str]) -> Result<Vec<Location>> {
        let mut seen = HashSet::new();
        let mut locations = vec![];

        for pattern in patterns {
            let pattern = Pattern::new(pattern)?;
            for (path, inode) in self.tree.glob(&pattern) {
                if inode.is_dir() {
                    continue;
                }
                if let Some(location) = self.resolve(&path) {
                    if location.reference.as_ref().is_some_and(|r| seen.insert(r.id)) {
                        locations.push(location);
                    }
                }
            }
        }

        Ok(locations)
    }

    fn files_by_mime_type(&self, types: &[&str]) -> Result<Vec<Location>> {
        Ok(types
            .iter()
            .filter_map(|ty| self.refs_by_mime_type.get(*ty))
            .flatten()
            .map(|reference| self.location(&reference.real_path, reference))
            .collect())
    }

    fn relative_file_by_path(&self, _from: &Location, path: &str) -> Option<Location> {
        self.resolve(path)
    }

    fn file_contents_by_location(&self, location: &Location) -> Result<Box<dyn Read + '_>> {
        let Some(reference) = &location.reference else {
            bail!("Empty path given");
        };
        let Some((real_path, inode)) =
            self.tree.resolve(&reference.real_path, LinkPolicy::FollowBasename)
        else {
            bail!("File content is inaccessible for {location}");
        };
        if inode.is_dir() {
            bail!("{location} is a directory");
        }

        let host_path = self.host_path(&real_path);
        let file = File::open(&host_path).with_context(|| format!("Failed to open {host_path:?}"))?;
        Ok(Box::new(file))
    }

    fn file_metadata_by_location(&self, location: &Location) -> Result<FileMetadata> {
        location
            .reference
            .as_ref()
            .and_then(|reference| usize::try_from(reference.id).ok())
            .and_then(|idx| self.metadata.get(idx))
            .cloned()
            .with_context(|| format!("{location}: no such file or directory"))
    }

    fn all_locations(&self) -> Box<dyn Iterator<Item = Location> + '_> {
        Box::new(
            self.tree
                .leaves()
                .map(|(path, leaf)| Location::from_directory(path, leaf.reference.clone())),
        )
    }
}
