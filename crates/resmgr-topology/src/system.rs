//! Discovery of the hardware tree `Package → Die → NUMA node → CPU` from
//! the `devices/system` sysfs subtrees.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    str::FromStr,
};

use resmgr_idset::{CpuSet, IdSet};
use snafu::{ResultExt, Snafu, ensure};
use tracing::debug;

use crate::sysfs;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to enumerate {what}"))]
    Enumerate {
        source: sysfs::Error,
        what: &'static str,
    },

    #[snafu(display("failed to discover CPU {id}"))]
    DiscoverCpu { source: sysfs::Error, id: usize },

    #[snafu(display("failed to discover NUMA node {id}"))]
    DiscoverNode { source: sysfs::Error, id: usize },

    #[snafu(display("node {id} reports MemFree ({free}) greater than MemTotal ({total})"))]
    MemFreeExceedsTotal { id: usize, free: u64, total: u64 },

    #[snafu(display("cannot classify node memory types: no node with both CPUs and memory"))]
    NoDramNodes,
}

/// Energy Performance Preference of a CPU, as exposed by the `cpufreq`
/// `energy_performance_preference` file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, strum::Display, strum::EnumString)]
pub enum Epp {
    #[strum(serialize = "performance")]
    Performance,

    #[strum(serialize = "balance_performance")]
    BalancePerformance,

    #[strum(serialize = "balance_power")]
    BalancePower,

    #[strum(serialize = "power")]
    Power,

    #[default]
    #[strum(serialize = "unknown")]
    Unknown,
}

/// Kind of memory attached to a NUMA node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::EnumString)]
pub enum MemType {
    #[strum(serialize = "DRAM")]
    Dram,

    #[strum(serialize = "PMEM")]
    Pmem,

    #[strum(serialize = "HBM")]
    Hbm,
}

/// Type of a discovered CPU cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::EnumString)]
pub enum CpuCacheType {
    Data,
    Instruction,
    Unified,
}

/// A single cache level of a CPU, from `cpuN/cache/indexM`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CpuCache {
    pub level: u32,
    pub kind: CpuCacheType,
    pub size: u64,
    pub shared_cpus: IdSet,
}

/// A logical CPU.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cpu {
    pub id: usize,
    pub package_id: usize,
    pub die_id: usize,
    pub node_id: usize,
    pub core_id: usize,
    pub thread_siblings: IdSet,
    /// Frequencies in kHz; zero when the corresponding cpufreq file is
    /// not present.
    pub base_freq: u64,
    pub min_freq: u64,
    pub max_freq: u64,
    pub epp: Epp,
    pub online: bool,
    pub isolated: bool,
    /// SST-CP class of service, when core-power prioritization is
    /// configured.
    pub clos: Option<usize>,
    /// Populated only when cache discovery is enabled in
    /// [`DiscoverOpts`].
    pub caches: Vec<CpuCache>,
}

/// A NUMA node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    pub id: usize,
    pub package_id: usize,
    pub die_id: usize,
    pub cpus: CpuSet,
    /// Distance vector indexed by node id.
    pub distances: Vec<usize>,
    pub mem_type: MemType,
    pub has_memory: bool,
    pub normal_memory: bool,
    pub mem_total: u64,
    pub mem_free: u64,
}

/// A die within a package.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Die {
    pub id: usize,
    pub cpus: CpuSet,
    pub nodes: IdSet,
}

/// A physical CPU package.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Package {
    pub id: usize,
    pub cpus: CpuSet,
    pub nodes: IdSet,
    pub dies: BTreeMap<usize, Die>,
}

/// Options controlling what [`System::discover_with`] reads.
#[derive(Clone, Copy, Debug, Default)]
pub struct DiscoverOpts {
    /// Also read per-CPU cache topology (`cpuN/cache/indexM`). Off by
    /// default; policies that do not partition caches never need it.
    pub cpu_cache: bool,
}

/// The discovered hardware topology of one node. Immutable once built.
#[derive(Clone, Debug, Default)]
pub struct System {
    path: PathBuf,
    cpus: BTreeMap<usize, Cpu>,
    nodes: BTreeMap<usize, Node>,
    packages: BTreeMap<usize, Package>,
    isolated: CpuSet,
}

impl System {
    /// Discovers the topology under `sys_root` (`/sys` on a live system).
    pub fn discover(sys_root: &Path) -> Result<Self> {
        Self::discover_with(sys_root, DiscoverOpts::default())
    }

    pub fn discover_with(sys_root: &Path, opts: DiscoverOpts) -> Result<Self> {
        let mut system = Self {
            path: sys_root.to_owned(),
            ..Self::default()
        };

        system.isolated = sysfs::read_optional_value(sys_root, "devices/system/cpu/isolated")
            .context(EnumerateSnafu { what: "isolated CPUs" })?
            .unwrap_or_default();

        system.discover_nodes(sys_root)?;
        system.discover_cpus(sys_root, opts)?;
        system.assign_node_locality();
        system.build_packages();
        system.classify_node_memory()?;

        debug!(
            cpus = system.cpus.len(),
            nodes = system.nodes.len(),
            packages = system.packages.len(),
            "topology discovered"
        );

        Ok(system)
    }

    pub fn cpu(&self, id: usize) -> Option<&Cpu> {
        self.cpus.get(&id)
    }

    pub fn node(&self, id: usize) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn package(&self, id: usize) -> Option<&Package> {
        self.packages.get(&id)
    }

    pub fn cpus(&self) -> impl Iterator<Item = &Cpu> {
        self.cpus.values()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn packages(&self) -> impl Iterator<Item = &Package> {
        self.packages.values()
    }

    pub fn isolated_cpus(&self) -> &CpuSet {
        &self.isolated
    }

    pub fn online_cpus(&self) -> CpuSet {
        self.cpus
            .values()
            .filter(|cpu| cpu.online)
            .map(|cpu| cpu.id)
            .collect()
    }

    /// NUMA distance between two nodes, when both are known and the
    /// distance matrix covers them.
    pub fn node_distance(&self, from: usize, to: usize) -> Option<usize> {
        self.nodes.get(&from)?.distances.get(to).copied()
    }

    /// CPUs of one package, empty for unknown packages.
    pub fn package_cpus(&self, package_id: usize) -> CpuSet {
        self.packages
            .get(&package_id)
            .map(|package| package.cpus.clone())
            .unwrap_or_default()
    }

    /// Nodes carrying a given memory type, in id order.
    pub fn nodes_with_mem_type(&self, mem_type: MemType) -> Vec<&Node> {
        self.nodes
            .values()
            .filter(|node| node.mem_type == mem_type)
            .collect()
    }

    /// The sysfs root this topology was discovered from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn discover_nodes(&mut self, root: &Path) -> Result<()> {
        let ids = sysfs::enumerate(root, "devices/system/node", "node")
            .context(EnumerateSnafu { what: "NUMA nodes" })?;

        let with_memory: Option<IdSet> =
            sysfs::read_optional_value(root, "devices/system/node/has_memory")
                .context(EnumerateSnafu { what: "nodes with memory" })?;
        let with_normal_memory: Option<IdSet> =
            sysfs::read_optional_value(root, "devices/system/node/has_normal_memory")
                .context(EnumerateSnafu { what: "nodes with normal memory" })?;

        for id in ids {
            let base = format!("devices/system/node/node{id}");

            let cpus: CpuSet = sysfs::read_value(root, format!("{base}/cpulist"))
                .context(DiscoverNodeSnafu { id })?;
            let distances = sysfs::read_distances(root, format!("{base}/distance"))
                .context(DiscoverNodeSnafu { id })?;
            let meminfo = sysfs::read_meminfo(root, format!("{base}/meminfo"))
                .context(DiscoverNodeSnafu { id })?;

            ensure!(
                meminfo.free <= meminfo.total,
                MemFreeExceedsTotalSnafu {
                    id,
                    free: meminfo.free,
                    total: meminfo.total,
                }
            );

            let has_memory = match &with_memory {
                Some(listed) => listed.contains(id) || meminfo.total > 0,
                None => meminfo.total > 0,
            };
            let normal_memory = match &with_normal_memory {
                Some(listed) => listed.contains(id),
                None => has_memory,
            };

            self.nodes.insert(
                id,
                Node {
                    id,
                    package_id: 0,
                    die_id: 0,
                    cpus,
                    distances,
                    // Placeholder until classification below.
                    mem_type: MemType::Dram,
                    has_memory,
                    normal_memory,
                    mem_total: meminfo.total,
                    mem_free: meminfo.free,
                },
            );
        }

        Ok(())
    }

    fn discover_cpus(&mut self, root: &Path, opts: DiscoverOpts) -> Result<()> {
        let ids = sysfs::enumerate(root, "devices/system/cpu", "cpu")
            .context(EnumerateSnafu { what: "CPUs" })?;

        for id in ids {
            let cpu = self
                .discover_cpu(root, id, opts)
                .context(DiscoverCpuSnafu { id })?;
            self.cpus.insert(id, cpu);
        }

        if let Err(err) = self.discover_sst(root) {
            // SST support is best-effort: any failure downgrades to "not
            // supported" without failing discovery.
            debug!(error = %err, "SST discovery failed, marking SST as unsupported");
            for cpu in self.cpus.values_mut() {
                cpu.clos = None;
            }
        }

        Ok(())
    }

    fn discover_cpu(&self, root: &Path, id: usize, opts: DiscoverOpts) -> sysfs::Result<Cpu> {
        let base = format!("devices/system/cpu/cpu{id}");

        // cpu0 has no online file on most systems; a missing file means
        // the CPU cannot be offlined.
        let online = sysfs::read_optional_value::<u8>(root, format!("{base}/online"))?
            .is_none_or(|v| v != 0);

        let mut cpu = Cpu {
            id,
            package_id: 0,
            die_id: 0,
            node_id: 0,
            core_id: 0,
            thread_siblings: IdSet::new(),
            base_freq: 0,
            min_freq: 0,
            max_freq: 0,
            epp: Epp::Unknown,
            online,
            isolated: self.isolated.contains(id),
            clos: None,
            caches: Vec::new(),
        };

        // Offline CPUs expose no topology directory.
        if !online {
            return Ok(cpu);
        }

        cpu.package_id = sysfs::read_value(root, format!("{base}/topology/physical_package_id"))?;
        cpu.die_id =
            sysfs::read_optional_value(root, format!("{base}/topology/die_id"))?.unwrap_or(0);
        cpu.core_id = sysfs::read_value(root, format!("{base}/topology/core_id"))?;
        cpu.thread_siblings =
            sysfs::read_idset(root, format!("{base}/topology/thread_siblings_list"))?;

        cpu.base_freq = sysfs::read_optional_value(root, format!("{base}/cpufreq/base_frequency"))?
            .unwrap_or(0);
        cpu.min_freq =
            sysfs::read_optional_value(root, format!("{base}/cpufreq/cpuinfo_min_freq"))?
                .unwrap_or(0);
        cpu.max_freq =
            sysfs::read_optional_value(root, format!("{base}/cpufreq/cpuinfo_max_freq"))?
                .unwrap_or(0);

        cpu.epp = sysfs::read_optional_value::<String>(
            root,
            format!("{base}/cpufreq/energy_performance_preference"),
        )?
        .map(|raw| Epp::from_str(&raw).unwrap_or(Epp::Unknown))
        .unwrap_or(Epp::Unknown);

        cpu.node_id = self.cpu_node_id(root, &base, id)?;

        if opts.cpu_cache {
            cpu.caches = discover_caches(root, &base)?;
        }

        Ok(cpu)
    }

    /// Binds a CPU to its NUMA node: first via the `nodeN` entry in the
    /// CPU's sysfs directory, falling back to a scan of node cpulists.
    fn cpu_node_id(&self, root: &Path, base: &str, cpu: usize) -> sysfs::Result<usize> {
        if let Some(id) = sysfs::enumerate(root, base, "node")?.into_iter().next() {
            return Ok(id);
        }
        Ok(self
            .nodes
            .values()
            .find(|node| node.cpus.contains(cpu))
            .map_or(0, |node| node.id))
    }

    /// Reads per-CPU SST-CP class-of-service indices, exposed by the ISST
    /// driver when core-power prioritization is configured. A missing
    /// file just means no CLOS for that CPU.
    fn discover_sst(&mut self, root: &Path) -> sysfs::Result<()> {
        for cpu in self.cpus.values_mut() {
            cpu.clos =
                sysfs::read_optional_value(root, format!("devices/system/cpu/cpu{}/sst/clos", cpu.id))?;
        }
        Ok(())
    }

    /// Attaches package and die ids to nodes. CPU-less memory nodes
    /// inherit locality from the nearest node that has CPUs.
    fn assign_node_locality(&mut self) {
        let mut located: BTreeMap<usize, (usize, usize)> = BTreeMap::new();
        for node in self.nodes.values() {
            if let Some(cpu) = node.cpus.first().and_then(|id| self.cpus.get(&id)) {
                located.insert(node.id, (cpu.package_id, cpu.die_id));
            }
        }

        for node in self.nodes.values_mut() {
            if let Some(&(package, die)) = located.get(&node.id) {
                (node.package_id, node.die_id) = (package, die);
                continue;
            }
            let nearest = located
                .keys()
                .copied()
                .min_by_key(|peer| node.distances.get(*peer).copied().unwrap_or(usize::MAX));
            if let Some(peer) = nearest {
                (node.package_id, node.die_id) = located[&peer];
            }
        }
    }

    fn build_packages(&mut self) {
        for cpu in self.cpus.values() {
            if !cpu.online {
                continue;
            }
            let package = self.packages.entry(cpu.package_id).or_insert_with(|| Package {
                id: cpu.package_id,
                ..Package::default()
            });
            package.cpus.add(cpu.id);
            let die = package.dies.entry(cpu.die_id).or_insert_with(|| Die {
                id: cpu.die_id,
                ..Die::default()
            });
            die.cpus.add(cpu.id);
        }

        for node in self.nodes.values() {
            if let Some(package) = self.packages.get_mut(&node.package_id) {
                package.nodes.add(node.id);
                if let Some(die) = package.dies.get_mut(&node.die_id) {
                    die.nodes.add(node.id);
                }
            }
        }
    }

    /// Partitions nodes into memory types: nodes with CPUs are DRAM;
    /// CPU-less nodes with memory are HBM when smaller than the DRAM
    /// average, PMEM otherwise.
    fn classify_node_memory(&mut self) -> Result<()> {
        let dram_total: u64 = self
            .nodes
            .values()
            .filter(|node| !node.cpus.is_empty())
            .map(|node| node.mem_total)
            .sum();
        let dram_count = self
            .nodes
            .values()
            .filter(|node| !node.cpus.is_empty())
            .count() as u64;

        ensure!(dram_count > 0 && dram_total > 0, NoDramNodesSnafu);
        let dram_avg = dram_total / dram_count;

        for node in self.nodes.values_mut() {
            node.mem_type = if !node.cpus.is_empty() || !node.has_memory {
                MemType::Dram
            } else if node.mem_total < dram_avg {
                MemType::Hbm
            } else {
                MemType::Pmem
            };
        }

        Ok(())
    }
}

fn discover_caches(root: &Path, base: &str) -> sysfs::Result<Vec<CpuCache>> {
    let cache_dir = format!("{base}/cache");
    let mut caches = Vec::new();

    let indices = match sysfs::enumerate(root, &cache_dir, "index") {
        Ok(indices) => indices,
        Err(err) if err.is_not_found() => return Ok(caches),
        Err(err) => return Err(err),
    };

    for index in indices {
        let index_dir = format!("{cache_dir}/index{index}");
        let level = sysfs::read_value(root, format!("{index_dir}/level"))?;
        let kind = sysfs::read_value(root, format!("{index_dir}/type"))?;
        let size = sysfs::read_string(root, format!("{index_dir}/size"))
            .and_then(|raw| sysfs::parse_size(Path::new(&index_dir), &raw))?;
        let shared_cpus = sysfs::read_idset(root, format!("{index_dir}/shared_cpu_list"))?;

        caches.push(CpuCache {
            level,
            kind,
            size,
            shared_cpus,
        });
    }

    Ok(caches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sysfs::tests_support::MockSys;

    fn two_package_system() -> MockSys {
        let mock = MockSys::new();
        for cpu in 0..4 {
            let package = cpu / 2;
            mock.add_cpu(cpu, package, 0, cpu % 2, &format!("{cpu}"), package);
        }
        mock.add_node(0, "0-1", "10 21", 16 << 30, 8 << 30);
        mock.add_node(1, "2-3", "21 10", 16 << 30, 8 << 30);
        mock
    }

    #[test]
    fn discovers_cpus_nodes_packages() {
        let mock = two_package_system();
        let system = System::discover(mock.root()).unwrap();

        assert_eq!(system.cpus().count(), 4);
        assert_eq!(system.nodes().count(), 2);
        assert_eq!(system.packages().count(), 2);

        let cpu2 = system.cpu(2).unwrap();
        assert_eq!(cpu2.package_id, 1);
        assert_eq!(cpu2.node_id, 1);
        assert!(cpu2.online);

        let node1 = system.node(1).unwrap();
        assert_eq!(node1.cpus.to_string(), "2-3");
        assert_eq!(node1.distances, vec![21, 10]);
        assert_eq!(node1.package_id, 1);
    }

    #[test]
    fn node_distance_and_package_lookup() {
        let mock = two_package_system();
        let system = System::discover(mock.root()).unwrap();

        assert_eq!(system.node_distance(0, 1), Some(21));
        assert_eq!(system.node_distance(0, 0), Some(10));
        assert_eq!(system.node_distance(0, 9), None);
        assert_eq!(system.node_distance(9, 0), None);

        assert_eq!(system.package_cpus(1).to_string(), "2-3");
        assert!(system.package_cpus(9).is_empty());
    }

    #[test]
    fn nodes_by_memory_type() {
        let mock = two_package_system();
        let system = System::discover(mock.root()).unwrap();
        assert_eq!(system.nodes_with_mem_type(MemType::Dram).len(), 2);
        assert!(system.nodes_with_mem_type(MemType::Pmem).is_empty());
    }

    #[test]
    fn isolated_cpus_flagged() {
        let mock = two_package_system();
        mock.write("devices/system/cpu/isolated", "1,3\n");

        let system = System::discover(mock.root()).unwrap();
        assert!(system.cpu(1).unwrap().isolated);
        assert!(!system.cpu(2).unwrap().isolated);
        assert_eq!(system.isolated_cpus().to_string(), "1,3");
    }

    #[test]
    fn offline_cpu_has_no_topology() {
        let mock = two_package_system();
        mock.write("devices/system/cpu/cpu3/online", "0\n");

        let system = System::discover(mock.root()).unwrap();
        let cpu3 = system.cpu(3).unwrap();
        assert!(!cpu3.online);
        assert_eq!(system.online_cpus().to_string(), "0-2");
    }

    #[test]
    fn missing_cpufreq_defaults_to_zero() {
        let mock = two_package_system();
        let system = System::discover(mock.root()).unwrap();
        let cpu = system.cpu(0).unwrap();
        assert_eq!((cpu.base_freq, cpu.min_freq, cpu.max_freq), (0, 0, 0));
        assert_eq!(cpu.epp, Epp::Unknown);
    }

    #[test]
    fn cpufreq_and_epp_read_when_present() {
        let mock = two_package_system();
        mock.write("devices/system/cpu/cpu0/cpufreq/base_frequency", "2000000\n");
        mock.write("devices/system/cpu/cpu0/cpufreq/cpuinfo_min_freq", "800000\n");
        mock.write("devices/system/cpu/cpu0/cpufreq/cpuinfo_max_freq", "3600000\n");
        mock.write(
            "devices/system/cpu/cpu0/cpufreq/energy_performance_preference",
            "balance_performance\n",
        );

        let system = System::discover(mock.root()).unwrap();
        let cpu = system.cpu(0).unwrap();
        assert_eq!(cpu.base_freq, 2_000_000);
        assert_eq!(cpu.epp, Epp::BalancePerformance);
    }

    #[test]
    fn memfree_above_memtotal_is_fatal() {
        let mock = two_package_system();
        mock.add_node(2, "", "21 21 10", 1 << 30, 2 << 30);

        let err = System::discover(mock.root()).unwrap_err();
        assert!(matches!(err, Error::MemFreeExceedsTotal { id: 2, .. }));
    }

    #[test]
    fn memory_classification() {
        let mock = two_package_system();
        // CPU-less small node → HBM, CPU-less large node → PMEM. Node 2
        // sits closer to node 1 than to node 0.
        mock.add_node(2, "", "30 21 10 21", 1 << 30, 1 << 29);
        mock.add_node(3, "", "21 30 21 10", 64 << 30, 32 << 30);

        let system = System::discover(mock.root()).unwrap();
        assert_eq!(system.node(0).unwrap().mem_type, MemType::Dram);
        assert_eq!(system.node(2).unwrap().mem_type, MemType::Hbm);
        assert_eq!(system.node(3).unwrap().mem_type, MemType::Pmem);
        // Memory-only nodes inherit locality from the nearest CPU node.
        assert_eq!(system.node(2).unwrap().package_id, 1);
    }

    #[test]
    fn all_cpuless_nodes_fail_classification() {
        let mock = MockSys::new();
        mock.add_cpu(0, 0, 0, 0, "0", 0);
        mock.add_node(0, "", "10", 16 << 30, 8 << 30);

        let err = System::discover(mock.root()).unwrap_err();
        assert!(matches!(err, Error::NoDramNodes));
    }

    #[test]
    fn sst_clos_read_per_cpu() {
        let mock = two_package_system();
        mock.write("devices/system/cpu/cpu0/sst/clos", "2\n");

        let system = System::discover(mock.root()).unwrap();
        assert_eq!(system.cpu(0).unwrap().clos, Some(2));
        assert_eq!(system.cpu(1).unwrap().clos, None);
    }

    #[test]
    fn sst_parse_failure_downgrades_to_unsupported() {
        let mock = two_package_system();
        mock.write("devices/system/cpu/cpu0/sst/clos", "1\n");
        mock.write("devices/system/cpu/cpu2/sst/clos", "bogus\n");

        let system = System::discover(mock.root()).unwrap();
        assert!(system.cpus().all(|cpu| cpu.clos.is_none()));
    }

    #[test]
    fn cache_discovery_is_opt_in() {
        let mock = two_package_system();
        mock.write("devices/system/cpu/cpu0/cache/index0/level", "1\n");
        mock.write("devices/system/cpu/cpu0/cache/index0/type", "Data\n");
        mock.write("devices/system/cpu/cpu0/cache/index0/size", "32K\n");
        mock.write("devices/system/cpu/cpu0/cache/index0/shared_cpu_list", "0-1\n");

        let system = System::discover(mock.root()).unwrap();
        assert!(system.cpu(0).unwrap().caches.is_empty());

        let system =
            System::discover_with(mock.root(), DiscoverOpts { cpu_cache: true }).unwrap();
        let caches = &system.cpu(0).unwrap().caches;
        assert_eq!(caches.len(), 1);
        assert_eq!(caches[0].kind, CpuCacheType::Data);
        assert_eq!(caches[0].size, 32 << 10);
        assert_eq!(caches[0].shared_cpus.to_string(), "0-1");
    }
}
