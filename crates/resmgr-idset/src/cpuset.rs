use std::{
    fmt::Display,
    ops::{Deref, DerefMut},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::idset::{Error, IdSet};

/// A set of CPU ids in kernel `cpuset` list syntax.
///
/// Thin wrapper around [`IdSet`]. Like the inner set it serializes as its
/// list string (`"0-3,7"`), which is the form cgroups, sysfs and the
/// cache snapshot all use.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct CpuSet(IdSet);

impl CpuSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_inner(self) -> IdSet {
        self.0
    }
}

impl Deref for CpuSet {
    type Target = IdSet;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for CpuSet {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<IdSet> for CpuSet {
    fn from(ids: IdSet) -> Self {
        Self(ids)
    }
}

impl From<CpuSet> for IdSet {
    fn from(cpus: CpuSet) -> Self {
        cpus.0
    }
}

impl FromIterator<usize> for CpuSet {
    fn from_iter<T: IntoIterator<Item = usize>>(iter: T) -> Self {
        Self(IdSet::from_iter(iter))
    }
}

impl Display for CpuSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for CpuSet {
    type Err = Error;

    fn from_str(list: &str) -> Result<Self, Self::Err> {
        IdSet::from_str(list).map(Self)
    }
}
