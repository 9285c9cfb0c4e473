//! Small typed readers for the line- and key/value-oriented file formats
//! found under `/sys` and `/proc`.

use std::{io, path::Path, path::PathBuf, str::FromStr};

use resmgr_idset::IdSet;
use snafu::{OptionExt, ResultExt, Snafu};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read {}", path.display()))]
    ReadFile { source: io::Error, path: PathBuf },

    #[snafu(display("failed to parse {value:?} from {}: {reason}", path.display()))]
    ParseValue {
        path: PathBuf,
        value: String,
        reason: String,
    },

    #[snafu(display("missing {key:?} entry in {}", path.display()))]
    MissingKey { path: PathBuf, key: String },

    #[snafu(display("unknown unit {unit:?} in {}", path.display()))]
    UnknownUnit { path: PathBuf, unit: String },
}

impl Error {
    /// Whether the underlying cause is a missing file. Callers use this to
    /// tell "not present on this hardware" from real parse failures.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ReadFile { source, .. } if source.kind() == io::ErrorKind::NotFound
        )
    }
}

/// Reads a file and returns its contents with surrounding whitespace
/// trimmed. sysfs values carry a trailing newline.
pub fn read_string(root: &Path, rel: impl AsRef<Path>) -> Result<String> {
    let path = root.join(rel.as_ref());
    let raw = std::fs::read_to_string(&path).context(ReadFileSnafu { path: &path })?;
    Ok(raw.trim().to_owned())
}

/// Reads a single-value file and parses it.
pub fn read_value<T>(root: &Path, rel: impl AsRef<Path>) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let path = root.join(rel.as_ref());
    let value = read_string(root, rel)?;
    value.parse().map_err(|err: T::Err| Error::ParseValue {
        path,
        value,
        reason: err.to_string(),
    })
}

/// Like [`read_value`], but a missing file yields `None` instead of an
/// error. Parse failures still surface.
pub fn read_optional_value<T>(root: &Path, rel: impl AsRef<Path>) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match read_value(root, rel) {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err),
    }
}

/// Reads a list file in Linux list syntax (`cpulist`, `isolated`,
/// `thread_siblings_list`).
pub fn read_idset(root: &Path, rel: impl AsRef<Path>) -> Result<IdSet> {
    read_value(root, rel)
}

/// Reads a NUMA `distance` file: one whitespace-separated integer per
/// node, indexed by node id.
pub fn read_distances(root: &Path, rel: impl AsRef<Path>) -> Result<Vec<usize>> {
    let path = root.join(rel.as_ref());
    let line = read_string(root, rel)?;
    line.split_whitespace()
        .map(|part| {
            part.parse().map_err(|err: std::num::ParseIntError| {
                Error::ParseValue {
                    path: path.clone(),
                    value: part.to_owned(),
                    reason: err.to_string(),
                }
            })
        })
        .collect()
}

/// Memory totals in bytes, as reported by a `meminfo` file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemInfo {
    pub total: u64,
    pub free: u64,
}

/// Reads a `meminfo`-format file and extracts `MemTotal` and `MemFree`.
///
/// Handles both the `/proc/meminfo` format (`MemTotal:  16384 kB`) and
/// the per-node format (`Node 0 MemTotal:  16384 kB`). Values without a
/// unit are taken as bytes.
pub fn read_meminfo(root: &Path, rel: impl AsRef<Path>) -> Result<MemInfo> {
    let path = root.join(rel.as_ref());
    let raw = std::fs::read_to_string(&path).context(ReadFileSnafu { path: &path })?;

    let mut total = None;
    let mut free = None;
    for line in raw.lines() {
        let Some((keys, value)) = line.split_once(':') else {
            continue;
        };
        // The node format prefixes every key with "Node <id>".
        let Some(key) = keys.split_whitespace().last() else {
            continue;
        };
        let slot = match key {
            "MemTotal" => &mut total,
            "MemFree" => &mut free,
            _ => continue,
        };
        *slot = Some(parse_size(&path, value.trim())?);
    }

    Ok(MemInfo {
        total: total.context(MissingKeySnafu { path: &path, key: "MemTotal" })?,
        free: free.context(MissingKeySnafu { path: &path, key: "MemFree" })?,
    })
}

/// Parses a size with an optional unit suffix into bytes. meminfo uses
/// `kB`; cache size files use single-letter binary suffixes (`32K`).
pub fn parse_size(path: &Path, value: &str) -> Result<u64> {
    let split = value.find(|c: char| !c.is_ascii_digit()).unwrap_or(value.len());
    let (number, unit) = value.split_at(split);

    let number: u64 = number.parse().map_err(|err: std::num::ParseIntError| {
        Error::ParseValue {
            path: path.to_owned(),
            value: value.to_owned(),
            reason: err.to_string(),
        }
    })?;

    let factor = match unit.trim() {
        "" => 1,
        "kB" | "K" => 1 << 10,
        "M" => 1 << 20,
        "G" => 1 << 30,
        unit => {
            return UnknownUnitSnafu { path, unit }.fail();
        }
    };

    Ok(number * factor)
}

/// Enumerates the numeric suffixes of directory entries matching
/// `<prefix><id>`, e.g. the `N` in `cpu/cpuN` or `node/nodeN`. Ids come
/// back sorted.
pub fn enumerate(root: &Path, rel: impl AsRef<Path>, prefix: &str) -> Result<Vec<usize>> {
    let path = root.join(rel.as_ref());
    let entries = std::fs::read_dir(&path).context(ReadFileSnafu { path: &path })?;

    let mut ids = Vec::new();
    for entry in entries {
        let entry = entry.context(ReadFileSnafu { path: &path })?;
        let name = entry.file_name();
        let Some(suffix) = name.to_string_lossy().strip_prefix(prefix).map(String::from) else {
            continue;
        };
        if let Ok(id) = suffix.parse() {
            ids.push(id);
        }
    }

    ids.sort_unstable();
    Ok(ids)
}

/// A throwaway mock `/sys` tree for tests.
#[cfg(test)]
pub mod tests_support {
    use std::path::Path;

    pub struct MockSys {
        dir: tempfile::TempDir,
    }

    impl MockSys {
        pub fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
            }
        }

        pub fn root(&self) -> &Path {
            self.dir.path()
        }

        pub fn write(&self, rel: &str, contents: &str) {
            let path = self.root().join(rel);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(path, contents).unwrap();
        }

        /// Lays out the sysfs files of one online CPU, including the
        /// `nodeN` directory entry that binds it to its NUMA node.
        pub fn add_cpu(
            &self,
            id: usize,
            package: usize,
            die: usize,
            core: usize,
            siblings: &str,
            node: usize,
        ) {
            let base = format!("devices/system/cpu/cpu{id}");
            self.write(
                &format!("{base}/topology/physical_package_id"),
                &format!("{package}\n"),
            );
            self.write(&format!("{base}/topology/die_id"), &format!("{die}\n"));
            self.write(&format!("{base}/topology/core_id"), &format!("{core}\n"));
            self.write(
                &format!("{base}/topology/thread_siblings_list"),
                &format!("{siblings}\n"),
            );
            std::fs::create_dir_all(self.root().join(format!("{base}/node{node}"))).unwrap();
        }

        /// Lays out the sysfs files of one NUMA node.
        pub fn add_node(&self, id: usize, cpulist: &str, distance: &str, total: u64, free: u64) {
            let base = format!("devices/system/node/node{id}");
            self.write(&format!("{base}/cpulist"), &format!("{cpulist}\n"));
            self.write(&format!("{base}/distance"), &format!("{distance}\n"));
            self.write(
                &format!("{base}/meminfo"),
                &format!(
                    "Node {id} MemTotal: {} kB\nNode {id} MemFree: {} kB\n",
                    total >> 10,
                    free >> 10
                ),
            );
        }
    }
}
