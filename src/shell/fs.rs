//! File access for shell commands.
//!
//! Commands only see virtual, absolute paths (`/`, `/docs/readme`). A [`FileSystem`] maps
//! them onto whatever actually stores the files; [`LocalFileSystem`] confines them to one
//! host directory, symlinks included.
use std::{
    fs, io,
    path::{Component, Path, PathBuf},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub len: u64,
}

/// Opaque file access used by commands.
pub trait FileSystem: Send + Sync {
    fn is_dir(&self, path: &Path) -> bool;

    fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>>;

    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// The virtual path `path` names when typed in directory `cwd`.
    fn canonical(&self, cwd: &Path, path: &Path) -> PathBuf {
        normalize(cwd, path)
    }
}

/// Serves a host directory as `/`.
#[derive(Debug, Clone)]
pub struct LocalFileSystem {
    root: PathBuf,
}

impl LocalFileSystem {
    pub fn new(root: PathBuf) -> Self {
        let root = root.canonicalize().unwrap_or(root);
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The host file `path` names, with symlinks resolved. Fails if it lies outside the root.
    fn host(&self, path: &Path) -> io::Result<PathBuf> {
        let relative = normalize(Path::new("/"), path);
        let joined = match relative.strip_prefix("/") {
            Ok(relative) => self.root.join(relative),
            Err(_) => self.root.clone(),
        };

        let host = joined.canonicalize()?;
        if !host.starts_with(&self.root) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "outside the served directory",
            ));
        }
        Ok(host)
    }
}

impl FileSystem for LocalFileSystem {
    fn is_dir(&self, path: &Path) -> bool {
        self.host(path).is_ok_and(|host| host.is_dir())
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.host(path)?)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: metadata.is_dir(),
                len: metadata.len(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(self.host(path)?)
    }
}

/// Resolve `path` against the virtual directory `cwd`, lexically. `..` never climbs above `/`.
pub fn normalize(cwd: &Path, path: &Path) -> PathBuf {
    let mut resolved = if path.has_root() {
        PathBuf::from("/")
    } else {
        normalize_absolute(cwd)
    };

    for component in path.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::ParentDir => {
                resolved.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    resolved
}

fn normalize_absolute(path: &Path) -> PathBuf {
    if path.has_root() {
        normalize(Path::new("/"), path)
    } else {
        let mut rooted = PathBuf::from("/");
        rooted.push(path);
        normalize(Path::new("/"), &rooted)
    }
}
