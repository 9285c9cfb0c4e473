//! Ordered integer-set primitives shared by the topology model and the
//! resource cache.
//!
//! Both types speak the Linux list syntax used throughout sysfs and
//! cgroups (`0-3,7`): [`IdSet`] is the plain ordered set, [`CpuSet`] the
//! specialization used for `cpuset.cpus`/`cpuset.mems` style data, with a
//! string codec on serde so sets survive JSON snapshots in their list
//! form.

mod cpuset;
mod idset;

pub use cpuset::CpuSet;
pub use idset::{Error, IdSet};

pub type Result<T, E = Error> = std::result::Result<T, E>;
