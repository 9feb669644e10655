// ============================================================================
// STOCK METRIC DESCRIPTORS
// ============================================================================
// kstat-style metrics every instrumenter can offer. Each descriptor reads
// samples whose key starts with its class prefix:
//
//   cpu:<n>            cpu_nsec_kernel, cpu_nsec_user           attr instance
//   zone:<name>        nsec_sys, nsec_user, nsec_waitrq,
//                      avenrun_1min                             attr zonename
//   disk:<name>        reads, writes, nread, nwritten, rtime    attr name
//   nic:<name>         ipackets64, opackets64, rbytes64, obytes64
//                                                               attr name, zonename (VNICs)
//   tcp:<n>            inSegs, outSegs, error counters          attr instance
//   zone_vfs:<zone>    reads, writes, nread, nwritten           attr zonename
//   memory_cap:<zone>  rss, physcap, swap, swapcap, pagedout,
//                      pgpgin                                   attr zonename
//   kvm:<vcpu>         exits, *-exits                           attr name, zonename
//   arcstats:<n>       hits, misses
// ============================================================================

use std::time::Duration;

use crate::agent::{InstrumenterAgent, SampleFeed};
use crate::error::MetricResult;
use crate::metric::{Bucketizer, FieldMap, FieldSpec, FieldValue, MetricDescriptor, Sample};

pub const CPU_PREFIX: &str = "cpu:";
pub const ZONE_PREFIX: &str = "zone:";
pub const DISK_PREFIX: &str = "disk:";
pub const NIC_PREFIX: &str = "nic:";
pub const TCP_PREFIX: &str = "tcp:";
pub const VFS_PREFIX: &str = "zone_vfs:";
pub const MEMORY_PREFIX: &str = "memory_cap:";
pub const KVM_PREFIX: &str = "kvm:";
pub const ARC_PREFIX: &str = "arcstats:";

/// Fixed-point scale of the kernel load averages
const FSCALE: f64 = 256.0;

/// Modules the stock metrics live under, with their labels
pub const MODULES: &[(&str, &str)] = &[
    ("cpu", "CPU"),
    ("disk", "Disk I/O"),
    ("nic", "Network interfaces"),
    ("tcp", "TCP"),
    ("fs", "Filesystem"),
    ("memory", "Memory"),
    ("vm", "Virtual machines"),
    ("zfs", "ZFS"),
];

/// Percentage of `interval` spent, floored
fn percent_of(nanos: f64, interval: Duration) -> f64 {
    let total = interval.as_nanos() as f64;
    if total <= 0.0 {
        return 0.0;
    }
    (100.0 * nanos / total).floor()
}

/// Sum of several counter deltas
fn delta_of(names: &'static [&'static str]) -> impl Fn(&Sample, &Sample, Duration) -> Vec<FieldValue> {
    move |cur, prev, _| {
        let total: f64 = names.iter().map(|n| cur.delta(prev, n)).sum();
        vec![FieldValue::from(total)]
    }
}

/// Counter delta picked by a discrete field: `first.1` when the field equals
/// `first.0`, `second` otherwise
fn keyed_delta(
    field: &'static str,
    first: (&'static str, &'static str),
    second: &'static str,
) -> impl Fn(&FieldMap, &Sample, &Sample, Duration) -> Option<f64> {
    move |point, cur, prev, _| {
        let counter = if point.get(field)?.as_str()? == first.0 {
            first.1
        } else {
            second
        };
        Some(cur.delta(prev, counter))
    }
}

fn zonename() -> FieldSpec {
    FieldSpec::attr("zonename", "zone name", "zonename")
}

// ----------------------------------------------------------------------------
// CPU
// ----------------------------------------------------------------------------

pub fn cpu_cpus() -> MetricDescriptor {
    MetricDescriptor::new("cpu", "cpus", "CPUs", "cpus")
        .field(FieldSpec::discrete("cpu", "CPU identifier", |cur, _, _| {
            cur.attr("instance")
                .map(|i| vec![FieldValue::from(format!("cpu{}", i))])
                .unwrap_or_default()
        }))
        .field(FieldSpec::numeric(
            "utilization",
            "utilization",
            Bucketizer::linear(1.0),
            |cur, prev, interval| {
                let busy = cur.delta(prev, "cpu_nsec_kernel") + cur.delta(prev, "cpu_nsec_user");
                vec![FieldValue::from(percent_of(busy, interval))]
            },
        ))
}

pub fn cpu_usage() -> MetricDescriptor {
    MetricDescriptor::new("cpu", "usage", "aggregated CPU usage", "percent")
        .field(zonename())
        .field(FieldSpec::fixed("cpumode", "CPU mode", &["kernel", "user"]))
        .with_extract(&["cpumode"], |point, cur, prev, interval| {
            let counter = match point.get("cpumode")?.as_str()? {
                "kernel" => "nsec_sys",
                _ => "nsec_user",
            };
            Some(percent_of(cur.delta(prev, counter), interval))
        })
}

pub fn cpu_waittime() -> MetricDescriptor {
    MetricDescriptor::new("cpu", "waittime", "CPU wait time", "time")
        .field(zonename())
        .with_extract(&[], |_, cur, prev, _| Some(cur.delta(prev, "nsec_waitrq")))
}

pub fn cpu_loadavg1() -> MetricDescriptor {
    MetricDescriptor::new("cpu", "loadavg1", "1-minute load average", "number")
        .field(zonename())
        .with_extract(&[], |_, cur, _, _| Some(cur.counter("avenrun_1min") / FSCALE))
}

// ----------------------------------------------------------------------------
// Disk
// ----------------------------------------------------------------------------

pub fn disk_disks() -> MetricDescriptor {
    MetricDescriptor::new("disk", "disks", "disks", "disks")
        .field(FieldSpec::attr("disk", "device name", "name"))
        .field(FieldSpec::numeric(
            "iops",
            "number of I/O operations",
            Bucketizer::log_linear(10.0, 0, 11, 100),
            delta_of(&["reads", "writes"]),
        ))
        .field(FieldSpec::numeric(
            "bytes",
            "total bytes transferred",
            Bucketizer::log_linear(10.0, 2, 11, 100),
            delta_of(&["nread", "nwritten"]),
        ))
        .field(FieldSpec::numeric(
            "busytime",
            "percent busy time",
            Bucketizer::linear(1.0),
            |cur, prev, interval| vec![FieldValue::from(percent_of(cur.delta(prev, "rtime"), interval))],
        ))
}

pub fn disk_physio_ops() -> MetricDescriptor {
    MetricDescriptor::new("disk", "physio_ops", "I/O operations", "ops")
        .field(FieldSpec::attr("disk", "device name", "name"))
        .field(FieldSpec::fixed("optype", "type", &["read", "write"]))
        .with_extract(&["optype"], keyed_delta("optype", ("read", "reads"), "writes"))
}

pub fn disk_physio_bytes() -> MetricDescriptor {
    MetricDescriptor::new("disk", "physio_bytes", "bytes read and written", "size")
        .field(FieldSpec::attr("disk", "device name", "name"))
        .field(FieldSpec::fixed("optype", "type", &["read", "write"]))
        .with_extract(&["optype"], keyed_delta("optype", ("read", "nread"), "nwritten"))
}

// ----------------------------------------------------------------------------
// Network
// ----------------------------------------------------------------------------

pub fn nic_nics() -> MetricDescriptor {
    MetricDescriptor::new("nic", "nics", "NICs", "nics")
        .field(FieldSpec::attr("nic", "NIC name", "name"))
        .field(FieldSpec::numeric(
            "packets",
            "packets sent and received",
            Bucketizer::log_linear(10.0, 0, 11, 100),
            delta_of(&["ipackets64", "opackets64"]),
        ))
        .field(FieldSpec::numeric(
            "bytes",
            "bytes sent and received",
            Bucketizer::log_linear(10.0, 2, 11, 100),
            delta_of(&["rbytes64", "obytes64"]),
        ))
}

pub fn nic_bytes() -> MetricDescriptor {
    MetricDescriptor::new("nic", "bytes", "bytes sent and received", "size")
        .field(FieldSpec::attr("nic", "NIC name", "name"))
        .field(FieldSpec::fixed("direction", "sent/received", &["sent", "received"]))
        .with_extract(&["direction"], keyed_delta("direction", ("sent", "obytes64"), "rbytes64"))
}

pub fn nic_packets() -> MetricDescriptor {
    MetricDescriptor::new("nic", "packets", "packets sent and received", "packets")
        .field(FieldSpec::attr("nic", "NIC name", "name"))
        .field(FieldSpec::fixed("direction", "sent/received", &["sent", "received"]))
        .with_extract(&["direction"], keyed_delta("direction", ("sent", "opackets64"), "ipackets64"))
}

/// Zone of a VNIC; global-zone links have none
fn vnic_zone() -> FieldSpec {
    FieldSpec::discrete("zonename", "zone name", |cur, _, _| match cur.attr("zonename") {
        Some(zone) if zone != "global" => vec![FieldValue::from(zone)],
        _ => Vec::new(),
    })
}

pub fn nic_vnic_bytes() -> MetricDescriptor {
    MetricDescriptor::new("nic", "vnic_bytes", "VNIC bytes sent and received", "size")
        .field(vnic_zone())
        .field(FieldSpec::fixed("direction", "sent/received", &["sent", "received"]))
        .with_extract(
            &["direction", "zonename"],
            keyed_delta("direction", ("sent", "obytes64"), "rbytes64"),
        )
}

pub fn nic_vnic_packets() -> MetricDescriptor {
    MetricDescriptor::new("nic", "vnic_packets", "VNIC packets sent and received", "packets")
        .field(vnic_zone())
        .field(FieldSpec::fixed("direction", "sent/received", &["sent", "received"]))
        .with_extract(
            &["direction", "zonename"],
            keyed_delta("direction", ("sent", "opackets64"), "ipackets64"),
        )
}

// ----------------------------------------------------------------------------
// TCP
// ----------------------------------------------------------------------------

/// Error counters and the label each is reported under
const TCP_ERRORS: &[(&str, &str)] = &[
    ("attemptFails", "failed connection attempt"),
    ("retransSegs", "retransmitted segment"),
    ("inDupAck", "duplicate ACK"),
    ("listenDrop", "connection refused because backlog full"),
    ("listenDropQ0", "connection refused from full half-open queue"),
    ("halfOpenDrop", "connection dropped from a full half-open queue"),
    ("timRetransDrop", "connection dropped due to retransmit timeout"),
];

fn tcpstack() -> FieldSpec {
    FieldSpec::discrete("tcpstack", "TCP instance", |cur, _, _| {
        cur.attr("instance")
            .map(|i| vec![FieldValue::from(format!("tcp{}", i))])
            .unwrap_or_default()
    })
}

pub fn tcp_segments() -> MetricDescriptor {
    MetricDescriptor::new("tcp", "segments", "segments", "segments")
        .field(tcpstack())
        .field(FieldSpec::fixed("direction", "sent/received", &["sent", "received"]))
        .with_extract(&["direction"], keyed_delta("direction", ("sent", "outSegs"), "inSegs"))
}

pub fn tcp_errors() -> MetricDescriptor {
    let labels: Vec<&str> = TCP_ERRORS.iter().map(|(_, label)| *label).collect();
    MetricDescriptor::new("tcp", "errors", "errors", "errors")
        .field(tcpstack())
        .field(FieldSpec::fixed("errtype", "error type", &labels))
        .with_extract(&["errtype"], |point, cur, prev, _| {
            let label = point.get("errtype")?.as_str()?;
            let (counter, _) = TCP_ERRORS.iter().find(|(_, l)| *l == label)?;
            Some(cur.delta(prev, counter))
        })
}

// ----------------------------------------------------------------------------
// Filesystem
// ----------------------------------------------------------------------------

pub fn fs_logical_rwops() -> MetricDescriptor {
    MetricDescriptor::new("fs", "logical_rwops", "logical read/write operations", "ops")
        .field(zonename())
        .field(FieldSpec::fixed("optype", "type", &["read", "write"]))
        .with_extract(&["optype"], keyed_delta("optype", ("read", "reads"), "writes"))
}

pub fn fs_logical_rwbytes() -> MetricDescriptor {
    MetricDescriptor::new("fs", "logical_rwbytes", "logical bytes read/written", "size")
        .field(zonename())
        .field(FieldSpec::fixed("optype", "type", &["read", "write"]))
        .with_extract(&["optype"], keyed_delta("optype", ("read", "nread"), "nwritten"))
}

// ----------------------------------------------------------------------------
// Memory
// ----------------------------------------------------------------------------

pub fn memory_rss() -> MetricDescriptor {
    MetricDescriptor::new("memory", "rss", "resident set size", "size")
        .field(zonename())
        .with_extract(&[], |_, cur, _, _| Some(cur.counter("rss")))
}

/// A cap of zero or 2^64 means unlimited
fn memory_limit(value: f64) -> Option<f64> {
    if value == 0.0 || value >= 18_446_744_073_709_551_615.0 {
        None
    } else {
        Some(value)
    }
}

pub fn memory_rss_limit() -> MetricDescriptor {
    MetricDescriptor::new("memory", "rss_limit", "maximum resident set size", "size")
        .field(zonename())
        .with_extract(&[], |_, cur, _, _| memory_limit(cur.counter("physcap")))
}

pub fn memory_swap() -> MetricDescriptor {
    MetricDescriptor::new("memory", "swap", "swap used", "size")
        .field(zonename())
        .with_extract(&[], |_, cur, _, _| Some(cur.counter("swap")))
}

pub fn memory_swap_limit() -> MetricDescriptor {
    MetricDescriptor::new("memory", "swap_limit", "maximum swap used", "size")
        .field(zonename())
        .with_extract(&[], |_, cur, _, _| memory_limit(cur.counter("swapcap")))
}

pub fn memory_reclaimed_bytes() -> MetricDescriptor {
    MetricDescriptor::new("memory", "reclaimed_bytes", "excess memory reclaimed", "size")
        .field(zonename())
        .with_extract(&[], |_, cur, prev, _| Some(cur.delta(prev, "pagedout")))
}

pub fn memory_pageins() -> MetricDescriptor {
    MetricDescriptor::new("memory", "pageins", "pages paged in", "pages")
        .field(zonename())
        .with_extract(&[], |_, cur, prev, _| Some(cur.delta(prev, "pgpgin")))
}

// ----------------------------------------------------------------------------
// Virtual machines & ZFS
// ----------------------------------------------------------------------------

const VM_EXITS: &[(&str, &str)] = &[
    ("haltx", "halt-exits"),
    ("irqx", "irq-exits"),
    ("irqwx", "irq-window-exits"),
    ("iox", "io-exits"),
    ("mmiox", "mmio-exits"),
];

/// Exits not covered by any named reason
fn other_exits(sample: &Sample) -> f64 {
    VM_EXITS
        .iter()
        .fold(sample.counter("exits"), |acc, (_, counter)| acc - sample.counter(counter))
}

pub fn vm_exits() -> MetricDescriptor {
    MetricDescriptor::new("vm", "exits", "virtual machine exits", "exits")
        .field(zonename())
        .field(FieldSpec::fixed(
            "vleavereason",
            "VM exit reason",
            &["haltx", "irqx", "irqwx", "iox", "mmiox", "other"],
        ))
        // The per-VM summary shares the class with the vCPU samples
        .field(FieldSpec::discrete("vcpuid", "virtual CPU", |cur, _, _| match cur.attr("name") {
            Some(name) if name != "vm" => vec![FieldValue::from(name)],
            _ => Vec::new(),
        }))
        .with_extract(&["vleavereason", "vcpuid"], |point, cur, prev, _| {
            let reason = point.get("vleavereason")?.as_str()?;
            if reason == "other" {
                return Some(other_exits(cur) - other_exits(prev));
            }
            let (_, counter) = VM_EXITS.iter().find(|(r, _)| *r == reason)?;
            Some(cur.delta(prev, counter))
        })
}

pub fn zfs_arc_ops() -> MetricDescriptor {
    MetricDescriptor::new("zfs", "arc_ops", "ARC accesses", "ops")
        .field(FieldSpec::fixed("optype", "hit/miss", &["hit", "miss"]))
        .with_extract(&["optype"], keyed_delta("optype", ("hit", "hits"), "misses"))
}

// ----------------------------------------------------------------------------
// Registration
// ----------------------------------------------------------------------------

/// Every stock descriptor with the sample prefix it reads
pub fn stock_metrics() -> Vec<(&'static str, MetricDescriptor)> {
    vec![
        (CPU_PREFIX, cpu_cpus()),
        (ZONE_PREFIX, cpu_usage()),
        (ZONE_PREFIX, cpu_waittime()),
        (ZONE_PREFIX, cpu_loadavg1()),
        (DISK_PREFIX, disk_disks()),
        (DISK_PREFIX, disk_physio_ops()),
        (DISK_PREFIX, disk_physio_bytes()),
        (NIC_PREFIX, nic_nics()),
        (NIC_PREFIX, nic_bytes()),
        (NIC_PREFIX, nic_packets()),
        (NIC_PREFIX, nic_vnic_bytes()),
        (NIC_PREFIX, nic_vnic_packets()),
        (TCP_PREFIX, tcp_segments()),
        (TCP_PREFIX, tcp_errors()),
        (VFS_PREFIX, fs_logical_rwops()),
        (VFS_PREFIX, fs_logical_rwbytes()),
        (MEMORY_PREFIX, memory_rss()),
        (MEMORY_PREFIX, memory_rss_limit()),
        (MEMORY_PREFIX, memory_swap()),
        (MEMORY_PREFIX, memory_swap_limit()),
        (MEMORY_PREFIX, memory_reclaimed_bytes()),
        (MEMORY_PREFIX, memory_pageins()),
        (KVM_PREFIX, vm_exits()),
        (ARC_PREFIX, zfs_arc_ops()),
    ]
}

/// Register the stock modules and metrics, all reading from `feed`
pub fn register_stock(agent: &mut InstrumenterAgent, feed: &SampleFeed) -> MetricResult<()> {
    for (name, label) in MODULES {
        agent.register_module(*name, *label);
    }
    for (prefix, descriptor) in stock_metrics() {
        agent.register_metric(descriptor, feed.scoped_factory(prefix))?;
    }
    Ok(())
}
