//! 外部协作者：文件存储、制品解析与部署命名。
//!
//! # 教案式说明
//! - **意图 (Why)**：隔离层只需要“按路径创建/读取/重命名”“枚举目录”和“坐标换文件集”三种能力，
//!   以 trait 表达后，宿主可以换成任何存储或仓库客户端；
//! - **契约 (What)**：路径一律相对存储根；`list` 只返回直接子项，按路径排序。

use core::fmt;
use core::str::FromStr;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use spark_container::BoxError;
use thiserror::Error;

/// 目录枚举结果中的一项。
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct FolderEntry {
    pub path: PathBuf,
    pub is_dir: bool,
}

/// 字节级文件存储。
pub trait FileStore: Send + Sync {
    fn read(&self, path: &Path) -> io::Result<Bytes>;

    /// 写入文件，必要时创建父目录；已存在则覆盖。
    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()>;

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// 枚举 `dir` 的直接子项。
    fn list(&self, dir: &Path) -> io::Result<Vec<FolderEntry>>;
}

/// 以本地目录为根的文件存储。
#[derive(Clone, Debug)]
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }
}

impl FileStore for LocalFileStore {
    fn read(&self, path: &Path) -> io::Result<Bytes> {
        fs::read(self.resolve(path)).map(Bytes::from)
    }

    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        let target = self.resolve(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(target, contents)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(self.resolve(from), self.resolve(to))
    }

    fn list(&self, dir: &Path) -> io::Result<Vec<FolderEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.resolve(dir))? {
            let entry = entry?;
            entries.push(FolderEntry {
                path: dir.join(entry.file_name()),
                is_dir: entry.file_type()?.is_dir(),
            });
        }
        entries.sort();
        Ok(entries)
    }
}

/// 内存文件存储，目录由文件路径隐式构成。
#[derive(Debug, Default)]
pub struct InMemoryFileStore {
    files: RwLock<BTreeMap<PathBuf, Bytes>>,
}

impl InMemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 链式写入，便于测试装配。
    pub fn with_file(self, path: impl Into<PathBuf>, contents: impl Into<Bytes>) -> Self {
        self.files.write().insert(path.into(), contents.into());
        self
    }

    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("`{}` does not exist", path.display()),
    )
}

impl FileStore for InMemoryFileStore {
    fn read(&self, path: &Path) -> io::Result<Bytes> {
        self.files
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| not_found(path))
    }

    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        self.files
            .write()
            .insert(path.to_path_buf(), Bytes::copy_from_slice(contents));
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        let mut files = self.files.write();
        let contents = files.remove(from).ok_or_else(|| not_found(from))?;
        files.insert(to.to_path_buf(), contents);
        Ok(())
    }

    fn list(&self, dir: &Path) -> io::Result<Vec<FolderEntry>> {
        let files = self.files.read();
        let mut children: BTreeMap<PathBuf, bool> = BTreeMap::new();
        for path in files.keys() {
            let Ok(relative) = path.strip_prefix(dir) else {
                continue;
            };
            let mut components = relative.components();
            let Some(first) = components.next() else {
                continue;
            };
            let is_dir = components.next().is_some();
            let child = children.entry(dir.join(first)).or_insert(is_dir);
            *child |= is_dir;
        }
        if children.is_empty() && !dir.as_os_str().is_empty() {
            return Err(not_found(dir));
        }
        Ok(children
            .into_iter()
            .map(|(path, is_dir)| FolderEntry { path, is_dir })
            .collect())
    }
}

/// 制品坐标格式错误。
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("artifact coordinates `{input}` must be `group:artifact:version[:extension]`")]
pub struct InvalidCoordinates {
    pub input: String,
}

/// 制品坐标，部署名默认取其 `group:artifact:version:extension` 形式。
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactCoordinates {
    pub group: String,
    pub artifact: String,
    pub version: String,
    pub extension: String,
}

impl ArtifactCoordinates {
    pub const DEFAULT_EXTENSION: &'static str = "zip";

    pub fn new(
        group: impl Into<String>,
        artifact: impl Into<String>,
        version: impl Into<String>,
        extension: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            artifact: artifact.into(),
            version: version.into(),
            extension: extension.into(),
        }
    }

    pub fn deployment_name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ArtifactCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.group, self.artifact, self.version, self.extension
        )
    }
}

impl FromStr for ArtifactCoordinates {
    type Err = InvalidCoordinates;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = input.split(':').map(str::trim).collect();
        let invalid = || InvalidCoordinates {
            input: input.to_owned(),
        };
        if parts.iter().any(|part| part.is_empty()) {
            return Err(invalid());
        }
        match parts.as_slice() {
            [group, artifact, version] => Ok(Self::new(
                *group,
                *artifact,
                *version,
                Self::DEFAULT_EXTENSION,
            )),
            [group, artifact, version, extension] => {
                Ok(Self::new(*group, *artifact, *version, *extension))
            }
            _ => Err(invalid()),
        }
    }
}

/// 包解析服务：坐标进，文件集出。
pub trait ArtifactResolver: Send + Sync {
    /// 返回的路径相对于配套的 [`FileStore`]。
    fn resolve(&self, coordinates: &ArtifactCoordinates) -> Result<Vec<PathBuf>, BoxError>;
}

/// 以目录名作为部署名；路径没有末级名称时返回 `None`。
pub fn deployment_name_from_folder(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .map(str::to_owned)
}
