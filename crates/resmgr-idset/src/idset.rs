use std::{collections::BTreeSet, fmt::Display, fmt::Write, str::FromStr};

use serde::{Deserialize, Serialize, de::Visitor};
use snafu::{ResultExt, Snafu, ensure};

#[derive(Debug, PartialEq, Snafu)]
pub enum Error {
    #[snafu(display("invalid id {value:?} in list {list:?}"))]
    InvalidId {
        source: std::num::ParseIntError,
        value: String,
        list: String,
    },

    #[snafu(display("invalid range {range:?} in list {list:?}: missing bound"))]
    MissingBound { range: String, list: String },

    #[snafu(display(
        "invalid range {range:?} in list {list:?}: start must not be greater than end"
    ))]
    ReversedRange { range: String, list: String },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// An ordered set of small integer ids (CPU, NUMA node, package, die or
/// core numbers).
///
/// Renders to and parses from the Linux list syntax, where consecutive
/// runs collapse into ranges:
///
/// ```
/// # use resmgr_idset::IdSet;
/// let ids: IdSet = "0-3,7".parse().unwrap();
/// assert!(ids.contains(2));
/// assert_eq!(ids.to_string(), "0-3,7");
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IdSet {
    ids: BTreeSet<usize>,
}

impl IdSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, id: usize) -> bool {
        self.ids.insert(id)
    }

    pub fn remove(&mut self, id: usize) -> bool {
        self.ids.remove(&id)
    }

    pub fn contains(&self, id: usize) -> bool {
        self.ids.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Iterates over the member ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.ids.iter().copied()
    }

    /// Returns the member ids as a sorted vector.
    pub fn members(&self) -> Vec<usize> {
        self.ids.iter().copied().collect()
    }

    /// Returns the smallest member id, if any.
    pub fn first(&self) -> Option<usize> {
        self.ids.first().copied()
    }

    pub fn union(&self, other: &Self) -> Self {
        Self {
            ids: self.ids.union(&other.ids).copied().collect(),
        }
    }

    pub fn intersection(&self, other: &Self) -> Self {
        Self {
            ids: self.ids.intersection(&other.ids).copied().collect(),
        }
    }

    pub fn difference(&self, other: &Self) -> Self {
        Self {
            ids: self.ids.difference(&other.ids).copied().collect(),
        }
    }
}

impl FromIterator<usize> for IdSet {
    fn from_iter<T: IntoIterator<Item = usize>>(iter: T) -> Self {
        Self {
            ids: iter.into_iter().collect(),
        }
    }
}

impl Extend<usize> for IdSet {
    fn extend<T: IntoIterator<Item = usize>>(&mut self, iter: T) {
        self.ids.extend(iter);
    }
}

impl IntoIterator for IdSet {
    type Item = usize;
    type IntoIter = std::collections::btree_set::IntoIter<usize>;

    fn into_iter(self) -> Self::IntoIter {
        self.ids.into_iter()
    }
}

impl Display for IdSet {
    /// Renders the set in list syntax, collapsing runs of consecutive ids
    /// into `start-end` ranges. The empty set renders as the empty string.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids = self.ids.iter().copied();
        let Some(mut start) = ids.next() else {
            return Ok(());
        };

        let mut out = String::new();
        let mut end = start;
        let mut flush = |start: usize, end: usize, out: &mut String| -> std::fmt::Result {
            if !out.is_empty() {
                out.push(',');
            }
            match start == end {
                true => write!(out, "{start}"),
                false => write!(out, "{start}-{end}"),
            }
        };

        for id in ids {
            if id == end + 1 {
                end = id;
            } else {
                flush(start, end, &mut out)?;
                start = id;
                end = id;
            }
        }
        flush(start, end, &mut out)?;

        f.write_str(&out)
    }
}

impl FromStr for IdSet {
    type Err = Error;

    /// Parses the Linux list syntax: comma-separated ids and `start-end`
    /// ranges. Whitespace around separators is tolerated, as sysfs list
    /// files carry a trailing newline.
    fn from_str(list: &str) -> Result<Self> {
        let mut ids = BTreeSet::new();

        for part in list.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            match part.split_once('-') {
                Some((start, end)) => {
                    ensure!(
                        !start.is_empty() && !end.is_empty(),
                        MissingBoundSnafu { range: part, list }
                    );
                    let start: usize = start.parse().context(InvalidIdSnafu {
                        value: start,
                        list,
                    })?;
                    let end: usize = end.parse().context(InvalidIdSnafu { value: end, list })?;
                    ensure!(start <= end, ReversedRangeSnafu { range: part, list });
                    ids.extend(start..=end);
                }
                None => {
                    ids.insert(part.parse().context(InvalidIdSnafu { value: part, list })?);
                }
            }
        }

        Ok(Self { ids })
    }
}

impl Serialize for IdSet {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for IdSet {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct IdSetVisitor;

        impl Visitor<'_> for IdSetVisitor {
            type Value = IdSet;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("an id list like \"0-3,7\"")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                IdSet::from_str(v).map_err(serde::de::Error::custom)
            }
        }

        deserializer.deserialize_str(IdSetVisitor)
    }
}
