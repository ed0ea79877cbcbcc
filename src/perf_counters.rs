use crate::flags::Flags;
use crate::kernel_metadata::signal_name;
use crate::log::LogLevel::{LogDebug, LogInfo, LogWarn};
use crate::perf_event::{
    f_owner_ex, perf_event_attr, F_OWNER_TID, F_SETOWN_EX, F_SETSIG, PERF_COUNT_HW_CPU_CYCLES,
    PERF_COUNT_SW_PAGE_FAULTS, PERF_EVENT_IOC_DISABLE, PERF_EVENT_IOC_ENABLE,
    PERF_EVENT_IOC_PERIOD, PERF_EVENT_IOC_RESET, PERF_TYPE_HARDWARE, PERF_TYPE_RAW,
    PERF_TYPE_SOFTWARE,
};
use crate::scoped_fd::ScopedFd;
use crate::task::ReplayTask;
use crate::ticks::Ticks;
use crate::util::running_under_retrace;
use libc::{c_ulong, fcntl, ioctl, pid_t, F_SETFL, O_ASYNC};
use nix::errno::errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::unistd::read;
use raw_cpuid::CpuId;
use std::io::{stderr, Write};
use std::mem::size_of;
use std::os::unix::io::RawFd;
use std::sync::Mutex;

lazy_static! {
    static ref PROBE_BRANCHES_SINK: Mutex<u32> = Mutex::new(0);
    static ref PMU_ATTRIBUTES: PmuAttributes = init_attributes();
    static ref PMU_BUGS: PmuBugs = check_for_bugs();
}

/// Force the one-time PMU detection and quirk probes to run now, so any
/// environment error surfaces before a tracee is touched, and keep the
/// overflow signal out of our own threads.
pub fn init_pmu() {
    block_time_slice_signal();
    let recreate = always_recreate_counters();
    log!(
        LogDebug,
        "PMU initialized: {} (always_recreate_counters={})",
        PMU_ATTRIBUTES.profile.name,
        recreate
    );
}

/// TIME_SLICE_SIGNAL is only ever consumed via ptrace when the traced
/// thread stops; no handler exists, so it must never interrupt our own
/// threads. (nix's Signal type can't name realtime signals, hence libc.)
fn block_time_slice_signal() {
    unsafe {
        let mut mask: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut mask);
        libc::sigaddset(&mut mask, TIME_SLICE_SIGNAL);
        if libc::pthread_sigmask(libc::SIG_BLOCK, &mask, std::ptr::null_mut()) != 0 {
            fatal!("Failed to block {}", signal_name(TIME_SLICE_SIGNAL));
        }
    }
}

const NUM_BRANCHES: u64 = 500;

/// The signal the kernel delivers when the ticks counter overflows its
/// programmed period. A realtime signal (SIGRTMAX - 6 = 58), agreed between
/// recorder and replayer and reserved for this alone.
pub const TIME_SLICE_SIGNAL: i32 = 58;

/// Count only inside transactions (bit 32 of the raw event config),
/// respectively outside aborted ones (bit 33).
const IN_TX: u64 = 1 << 32;
const IN_TXCP: u64 = 1 << 33;

/// Find out the cpu model using the cpuid instruction.
/// Full list of CPUIDs at http://sandpile.org/x86/cpuid.htm
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CpuMicroarch {
    UnknownCpu,
    IntelMerom,
    IntelPenryn,
    IntelNehalem,
    IntelWestmere,
    IntelSandyBridge,
    IntelIvyBridge,
    IntelHaswell,
    IntelBroadwell,
    IntelSkylake,
    IntelSilvermont,
    IntelKabylake,
}

use CpuMicroarch::*;

/// The raw PMU event encodings for one microarchitecture. Immutable,
/// selected once at process start.
pub struct PmuProfile {
    pub uarch: CpuMicroarch,
    pub name: &'static str,
    /// Retired conditional branches: the "ticks" event.
    pub rcb_cntr_event: u64,
    /// Retired instructions.
    pub rinsn_cntr_event: u64,
    /// Hardware interrupts received.
    pub hw_intr_cntr_event: u64,
    pub supported: bool,
    /// Some CPUs turn off the whole PMU when there are no remaining events
    /// scheduled (perhaps as a power consumption optimization). This can be
    /// a very expensive operation, and is thus best avoided. For those cpus
    /// we keep a cycles counter (a fixed-function counter, so no
    /// programmable PMC is lost) that we don't otherwise use, but keeps the
    /// PMU active.
    pub benefits_from_useless_counter: bool,
}

/// XXX please only edit this if you really know what you're doing.
/// event = 0x5101c4:
/// - 51 = generic PMU
/// - 01 = umask for event BR_INST_RETIRED.CONDITIONAL
/// - c4 = eventsel for event BR_INST_RETIRED.CONDITIONAL
/// See Intel 64 and IA32 Architectures Performance Monitoring Events.
pub static PMU_PROFILES: [PmuProfile; 11] = [
    PmuProfile {
        uarch: IntelKabylake,
        name: "Intel Kabylake",
        rcb_cntr_event: 0x5101c4,
        rinsn_cntr_event: 0x5100c0,
        hw_intr_cntr_event: 0x5301cb,
        supported: true,
        benefits_from_useless_counter: false,
    },
    PmuProfile {
        uarch: IntelSilvermont,
        name: "Intel Silvermont",
        rcb_cntr_event: 0x517ec4,
        rinsn_cntr_event: 0x5100c0,
        hw_intr_cntr_event: 0x5301cb,
        supported: true,
        benefits_from_useless_counter: true,
    },
    PmuProfile {
        uarch: IntelSkylake,
        name: "Intel Skylake",
        rcb_cntr_event: 0x5101c4,
        rinsn_cntr_event: 0x5100c0,
        hw_intr_cntr_event: 0x5301cb,
        supported: true,
        benefits_from_useless_counter: false,
    },
    PmuProfile {
        uarch: IntelBroadwell,
        name: "Intel Broadwell",
        rcb_cntr_event: 0x5101c4,
        rinsn_cntr_event: 0x5100c0,
        hw_intr_cntr_event: 0x5301cb,
        supported: true,
        benefits_from_useless_counter: false,
    },
    PmuProfile {
        uarch: IntelHaswell,
        name: "Intel Haswell",
        rcb_cntr_event: 0x5101c4,
        rinsn_cntr_event: 0x5100c0,
        hw_intr_cntr_event: 0x5301cb,
        supported: true,
        benefits_from_useless_counter: false,
    },
    PmuProfile {
        uarch: IntelIvyBridge,
        name: "Intel Ivy Bridge",
        rcb_cntr_event: 0x5101c4,
        rinsn_cntr_event: 0x5100c0,
        hw_intr_cntr_event: 0x5301cb,
        supported: true,
        benefits_from_useless_counter: false,
    },
    PmuProfile {
        uarch: IntelSandyBridge,
        name: "Intel Sandy Bridge",
        rcb_cntr_event: 0x5101c4,
        rinsn_cntr_event: 0x5100c0,
        hw_intr_cntr_event: 0x5301cb,
        supported: true,
        benefits_from_useless_counter: false,
    },
    PmuProfile {
        uarch: IntelNehalem,
        name: "Intel Nehalem",
        rcb_cntr_event: 0x5101c4,
        rinsn_cntr_event: 0x5100c0,
        hw_intr_cntr_event: 0x50011d,
        supported: true,
        benefits_from_useless_counter: false,
    },
    PmuProfile {
        uarch: IntelWestmere,
        name: "Intel Westmere",
        rcb_cntr_event: 0x5101c4,
        rinsn_cntr_event: 0x5100c0,
        hw_intr_cntr_event: 0x50011d,
        supported: true,
        benefits_from_useless_counter: false,
    },
    PmuProfile {
        uarch: IntelPenryn,
        name: "Intel Penryn",
        rcb_cntr_event: 0,
        rinsn_cntr_event: 0,
        hw_intr_cntr_event: 0,
        supported: false,
        benefits_from_useless_counter: false,
    },
    PmuProfile {
        uarch: IntelMerom,
        name: "Intel Merom",
        rcb_cntr_event: 0,
        rinsn_cntr_event: 0,
        hw_intr_cntr_event: 0,
        supported: false,
        benefits_from_useless_counter: false,
    },
];

/// First profile whose display name contains `forced` (case-insensitive).
fn forced_uarch_lookup(forced: &str) -> Option<&'static PmuProfile> {
    let forced_lower = forced.to_lowercase();
    PMU_PROFILES
        .iter()
        .find(|pmu| pmu.name.to_lowercase().contains(&forced_lower))
}

fn profile_for(uarch: CpuMicroarch) -> &'static PmuProfile {
    match PMU_PROFILES.iter().find(|pmu| pmu.uarch == uarch) {
        Some(profile) => profile,
        None => {
            clean_fatal!("No PMU profile for detected microarch {:?}", uarch);
        }
    }
}

/// Return the detected, known microarchitecture of this CPU, or don't
/// return; i.e. never return UnknownCpu.
fn compute_cpu_microarch() -> CpuMicroarch {
    let cpuid = CpuId::new();
    let cpuid_data = match cpuid.get_feature_info() {
        Some(info) => info,
        None => {
            clean_fatal!("CPUID leaf 1 unavailable; cannot identify CPU");
        }
    };
    // Reassemble eax & 0xF0FF0 from the decoded fields.
    let cpu_type: u32 = ((cpuid_data.model_id() as u32) << 4)
        + ((cpuid_data.family_id() as u32) << 8)
        + ((cpuid_data.extended_model_id() as u32) << 16);
    match cpu_type {
        0x006F0 | 0x10660 => IntelMerom,
        0x10670 | 0x106D0 => IntelPenryn,
        0x106A0 | 0x106E0 | 0x206E0 => IntelNehalem,
        0x20650 | 0x206C0 | 0x206F0 => IntelWestmere,
        0x206A0 | 0x206D0 | 0x306e0 => IntelSandyBridge,
        0x306A0 => IntelIvyBridge,
        0x306C0 | 0x306F0 | 0x40650 | 0x40660 => IntelHaswell,
        0x306D0 | 0x406F0 | 0x50660 => IntelBroadwell,
        0x406e0 | 0x506e0 => IntelSkylake,
        0x50670 => IntelSilvermont,
        0x806e0 | 0x906e0 => IntelKabylake,
        _ => {
            clean_fatal!("CPU {:#x} unknown", cpu_type);
        }
    }
}

/// Select the PMU profile, honoring the forced-uarch override. A matched
/// but unsupported profile is a fatal environment error.
fn get_pmu_profile() -> &'static PmuProfile {
    let flags = Flags::get();
    let profile = match flags.forced_uarch {
        Some(ref forced) => match forced_uarch_lookup(forced) {
            Some(profile) => {
                log!(LogInfo, "Using forced uarch {}", profile.name);
                profile
            }
            None => {
                clean_fatal!("Forced uarch {} isn't known", forced);
            }
        },
        None => profile_for(compute_cpu_microarch()),
    };

    if !profile.supported {
        clean_fatal!(
            "Microarchitecture `{}' currently unsupported.",
            profile.name
        );
    }
    profile
}

fn new_perf_event_attr(type_id: u32, config: u64) -> perf_event_attr {
    let mut attr = perf_event_attr::default();
    attr.type_ = type_id;
    attr.size = size_of::<perf_event_attr>() as u32;
    attr.config = config;
    // Events must count userspace tracee code only.
    attr.set_exclude_kernel(true);
    attr.set_exclude_guest(true);
    attr
}

/// One-time-initialized counter attribute templates; read-only afterwards.
struct PmuAttributes {
    profile: &'static PmuProfile,
    ticks_attr: perf_event_attr,
    cycles_attr: perf_event_attr,
    instructions_retired_attr: perf_event_attr,
    hw_interrupts_attr: perf_event_attr,
    page_faults_attr: perf_event_attr,
}

fn init_attributes() -> PmuAttributes {
    let profile = get_pmu_profile();

    let ticks_attr = new_perf_event_attr(PERF_TYPE_RAW, profile.rcb_cntr_event);
    let cycles_attr = new_perf_event_attr(PERF_TYPE_HARDWARE, PERF_COUNT_HW_CPU_CYCLES);
    let instructions_retired_attr = new_perf_event_attr(PERF_TYPE_RAW, profile.rinsn_cntr_event);
    let mut hw_interrupts_attr = new_perf_event_attr(PERF_TYPE_RAW, profile.hw_intr_cntr_event);
    // libpfm encodes the event with this bit set, so we'll do the
    // same thing.  Unclear if necessary.
    hw_interrupts_attr.set_exclude_hv(true);
    let page_faults_attr = new_perf_event_attr(PERF_TYPE_SOFTWARE, PERF_COUNT_SW_PAGE_FAULTS);

    PmuAttributes {
        profile,
        ticks_attr,
        cycles_attr,
        instructions_retired_attr,
        hw_interrupts_attr,
        page_faults_attr,
    }
}

/// Results of the once-per-process kernel/hardware defect probes.
struct PmuBugs {
    has_ioc_period_bug: bool,
    has_kvm_in_txcp_bug: bool,
    activate_useless_counter: bool,
}

fn check_for_bugs() -> PmuBugs {
    if running_under_retrace() {
        // The outer instance emulates an idealized performance counter, so
        // neither probe result matters; and its probe counters would eat
        // PMCs we don't have to spare. Just say we don't have the bugs.
        return PmuBugs {
            has_ioc_period_bug: false,
            has_kvm_in_txcp_bug: false,
            activate_useless_counter: false,
        };
    }

    let has_ioc_period_bug = probe_ioc_period_bug();
    let has_kvm_in_txcp_bug = probe_kvm_in_txcp_bug();
    // For maintainability, and since it doesn't impact performance when not
    // needed, we always activate this. If it ever turns out to be a
    // problem, this can be gated on profile.benefits_from_useless_counter
    // instead.
    let activate_useless_counter = has_ioc_period_bug;
    PmuBugs {
        has_ioc_period_bug,
        has_kvm_in_txcp_bug,
        activate_useless_counter,
    }
}

/// Some versions of the kernel fail to re-arm a sampling counter when its
/// period is shortened via PERF_EVENT_IOC_PERIOD: open a counter with a
/// huge period, shrink it to 1, and see whether poll() observes the
/// overflow that must follow.
fn probe_ioc_period_bug() -> bool {
    let mut attr = PMU_ATTRIBUTES.ticks_attr;
    attr.sample_period = 0xffffffff;
    attr.set_exclude_kernel(true);
    let (bug_fd, _) = start_counter(0, -1, &mut attr);

    let new_period: u64 = 1;
    if perf_ioctl(&bug_fd, PERF_EVENT_IOC_PERIOD, &new_period as *const u64) != 0 {
        fatal!("ioctl(PERF_EVENT_IOC_PERIOD) failed");
    }

    let mut poll_bug_fd = [PollFd::new(bug_fd.as_raw(), PollFlags::POLLIN)];
    poll(&mut poll_bug_fd, 0).unwrap();

    let has_ioc_period_bug = poll_bug_fd[0].revents().is_none();
    log!(LogDebug, "has_ioc_period_bug={}", has_ioc_period_bug);
    has_ioc_period_bug
}

/// KVM's virtualized PMU undercounts with IN_TXCP set: count a known number
/// of conditional branches and compare. A counter that never counted at all
/// (no IN_TXCP support) is not this bug.
fn probe_kvm_in_txcp_bug() -> bool {
    let mut count: u64 = 0;
    let mut attr = PMU_ATTRIBUTES.ticks_attr;
    attr.config |= IN_TXCP;
    attr.sample_period = 0;
    let (fd, disabled_txcp) = start_counter(0, -1, &mut attr);
    if fd.is_open() && !disabled_txcp {
        perf_ioctl_null(&fd, PERF_EVENT_IOC_DISABLE);
        perf_ioctl_null(&fd, PERF_EVENT_IOC_ENABLE);
        do_branches();
        count = read_counter(&fd);
    }

    let has_kvm_in_txcp_bug = count > 0 && count < NUM_BRANCHES;
    log!(
        LogDebug,
        "has_kvm_in_txcp_bug={} count={}",
        has_kvm_in_txcp_bug,
        count
    );
    has_kvm_in_txcp_bug
}

fn always_recreate_counters() -> bool {
    // When we have the KVM IN_TXCP bug, reenabling the TXCP counter after
    // disabling it does not work. And PERF_EVENT_IOC_PERIOD is unusable
    // under the period bug.
    PMU_BUGS.has_ioc_period_bug || PMU_BUGS.has_kvm_in_txcp_bug
}

/// `ticks_period` of 0 means "never interrupt"; the kernel won't let a
/// counter switch between sampling and non-sampling via the period ioctl,
/// so it becomes a period that will never be reached instead. Under the
/// quirks the counters are recreated each time anyway, so 0 can stand.
fn effective_period(requested: Ticks, always_recreate: bool) -> Ticks {
    if requested == 0 && !always_recreate {
        1 << 60
    } else {
        requested
    }
}

fn do_branches() {
    // Do NUM_BRANCHES conditional branches that can't be optimized out.
    // 'accumulator' is always odd and can't be zero.
    let mut accumulator: u32 = rand::random::<u32>().wrapping_mul(2).wrapping_add(1);
    for _ in 0..NUM_BRANCHES {
        if accumulator == 0 {
            break;
        }
        accumulator = accumulator.wrapping_mul(7).wrapping_add(2) & 0xffffff;
    }

    *PROBE_BRANCHES_SINK.lock().unwrap() = accumulator;
}

fn read_counter(fd: &ScopedFd) -> u64 {
    let mut buf = [0u8; size_of::<u64>()];
    match read(fd.as_raw(), &mut buf) {
        Ok(nread) if nread == size_of::<u64>() => u64::from_le_bytes(buf),
        _ => {
            fatal!("Failed to read perf counter");
        }
    }
}

fn start_counter(tid: pid_t, group_fd: RawFd, attr: &mut perf_event_attr) -> (ScopedFd, bool) {
    let mut disabled_txcp = false;

    let mut fd: RawFd = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            attr as *mut perf_event_attr,
            tid,
            -1,
            group_fd,
            0,
        ) as RawFd
    };
    if 0 >= fd && errno() == libc::EINVAL && attr.type_ == PERF_TYPE_RAW && (attr.config & IN_TXCP != 0)
    {
        // The kernel might not support IN_TXCP, so try again without it.
        let mut tmp_attr: perf_event_attr = *attr;
        tmp_attr.config &= !IN_TXCP;
        fd = unsafe {
            libc::syscall(
                libc::SYS_perf_event_open,
                &mut tmp_attr as *mut perf_event_attr,
                tid,
                -1,
                group_fd,
                0,
            ) as RawFd
        };
        if fd >= 0 {
            disabled_txcp = true;

            log!(LogWarn, "kernel does not support IN_TXCP");
            if cpu_has_hle() && !Flags::get().suppress_environment_warnings {
                write!(
                    stderr(),
                    "Your CPU supports Hardware Lock Elision but your kernel does\n\
                     not support setting the IN_TXCP PMU flag. Record and replay\n\
                     of code that uses HLE will fail unless you update your\n\
                     kernel.\n"
                )
                .unwrap();
            }
        }
    }

    if 0 >= fd {
        if errno() == libc::EACCES {
            fatal!(
                "Permission denied to use 'perf_event_open'; are perf events \n\
                 enabled? Try 'perf record'."
            );
        }
        if errno() == libc::ENOENT {
            fatal!(
                "Unable to open performance counter with 'perf_event_open'; \n\
                 are perf events enabled? Try 'perf record'."
            );
        }
        fatal!("Failed to initialize counter");
    }

    (ScopedFd::from_raw(fd), disabled_txcp)
}

fn cpu_has_hle() -> bool {
    CpuId::new()
        .get_extended_feature_info()
        .map_or(false, |info| info.has_hle())
}

fn perf_ioctl(fd: &ScopedFd, request: c_ulong, arg: *const u64) -> i32 {
    unsafe { ioctl(fd.as_raw(), request, arg) }
}

/// Same as perf_ioctl() except the third argument is always 0.
fn perf_ioctl_null(fd: &ScopedFd, request: c_ulong) -> i32 {
    unsafe { ioctl(fd.as_raw(), request, 0) }
}

fn make_counter_async(fd: &ScopedFd, signal: i32) {
    if unsafe {
        fcntl(fd.as_raw(), F_SETFL, O_ASYNC) != 0 || fcntl(fd.as_raw(), F_SETSIG, signal) != 0
    } {
        fatal!(
            "Failed to make ticks counter ASYNC with {}",
            signal_name(signal)
        );
    }
}

fn reset_and_enable(fd: &ScopedFd) {
    if perf_ioctl_null(fd, PERF_EVENT_IOC_RESET) != 0 {
        fatal!("ioctl(PERF_EVENT_IOC_RESET) failed");
    }
    if perf_ioctl_null(fd, PERF_EVENT_IOC_ENABLE) != 0 {
        fatal!("ioctl(PERF_EVENT_IOC_ENABLE) failed");
    }
}

/// The ticks a window really took: IN_TXCP counters sometimes report
/// spurious extra events, in which case the sampling counter's value is the
/// truth. `interrupt_val > measure_val` on its own is legal (HLE in use)
/// and must not be flagged.
fn reconcile_ticks(interrupt_val: u64, measure_val: u64) -> Ticks {
    if measure_val > interrupt_val {
        log!(
            LogDebug,
            "Measured too many ticks; measure={}, interrupt={}",
            measure_val,
            interrupt_val
        );
        interrupt_val
    } else {
        measure_val
    }
}

/// Whether an observed in-transaction tick count is tolerable. Any nonzero
/// count under the KVM bug means HLE ran and the replay cannot be trusted,
/// unless the user forced the issue.
fn transaction_ticks_allowed(transaction_ticks: u64, force: bool) -> bool {
    transaction_ticks == 0 || force
}

/// Extended counter values from `read_extra`. All zero while the group is
/// stopped.
#[derive(Copy, Clone, Default, Debug, Eq, PartialEq)]
pub struct ExtraCounterValues {
    pub page_faults: u64,
    pub hw_interrupts: u64,
    pub instructions_retired: u64,
}

/// A group of kernel performance counters bound to one task. The interrupt
/// counter is the group leader and the only sampling member: it raises
/// TIME_SLICE_SIGNAL after the programmed tick period. A second,
/// non-sampling member reads back the precise count (IN_TXCP); under the
/// KVM bug it instead counts only in-transaction ticks (IN_TX) so their use
/// can be detected.
pub struct PerfCounters {
    tid: pid_t,
    // We use separate fds for counting ticks and for generating interrupts.
    // The former ignores ticks in aborted transactions, and does not
    // support sample_period; the latter does not ignore ticks in aborted
    // transactions, but does support sample_period.
    fd_ticks_interrupt: ScopedFd,
    fd_ticks_measure: ScopedFd,
    fd_ticks_in_transaction: ScopedFd,
    fd_useless_counter: ScopedFd,
    fd_hw_interrupts: ScopedFd,
    fd_instructions_retired: ScopedFd,
    fd_page_faults: ScopedFd,
    started: bool,
    counting: bool,
}

impl PerfCounters {
    pub fn new(tid: pid_t) -> Self {
        PerfCounters {
            tid,
            fd_ticks_interrupt: ScopedFd::new(),
            fd_ticks_measure: ScopedFd::new(),
            fd_ticks_in_transaction: ScopedFd::new(),
            fd_useless_counter: ScopedFd::new(),
            fd_hw_interrupts: ScopedFd::new(),
            fd_instructions_retired: ScopedFd::new(),
            fd_page_faults: ScopedFd::new(),
            started: false,
            counting: false,
        }
    }

    /// Change the task these counters are bound to. Stops the counters; the
    /// next reset re-opens them on the new thread.
    pub fn set_tid(&mut self, tid: pid_t) {
        self.stop();
        self.tid = tid;
    }

    /// Reset all counter values to 0 and program the counters to send
    /// TIME_SLICE_SIGNAL when `ticks_period` tick events have elapsed. (In
    /// reality the hardware triggers its interrupt some time after that.)
    /// Must be called while the task is stopped, before it runs again.
    /// A period of zero means don't interrupt at all.
    pub fn reset(&mut self, ticks_period: Ticks) {
        let always_recreate = always_recreate_counters();
        if self.started && always_recreate {
            // PERF_EVENT_IOC_PERIOD misbehaves on this host; tear the group
            // down and build it afresh.
            self.stop();
        }
        let ticks_period = effective_period(ticks_period, always_recreate);

        if !self.started {
            log!(
                LogDebug,
                "Recreating counters with period {} ({:#x})",
                ticks_period,
                ticks_period
            );

            let mut attr = PMU_ATTRIBUTES.ticks_attr;
            attr.sample_period = ticks_period;
            self.fd_ticks_interrupt = start_counter(self.tid, -1, &mut attr).0;

            if PMU_BUGS.has_kvm_in_txcp_bug {
                // IN_TXCP isn't going to work reliably. Assume that HLE/RTM
                // are not used, and check that.
                attr.sample_period = 0;
                attr.config |= IN_TX;
                self.fd_ticks_in_transaction =
                    start_counter(self.tid, self.fd_ticks_interrupt.as_raw(), &mut attr).0;
            } else {
                // Set up a separate counter for measuring ticks, which does
                // not have a sample period and does not count events during
                // aborted transactions. We have to use two separate counters
                // here because the kernel does not support setting a
                // sample_period with IN_TXCP, apparently for reasons related
                // to this Intel note on IA32_PERFEVTSEL2:
                // ``When IN_TXCP=1 & IN_TX=1 and in sampling, spurious PMI
                // may occur and transactions may continuously abort near
                // overflow conditions. Software should favor using IN_TXCP
                // for counting over sampling.''
                attr.sample_period = 0;
                attr.config |= IN_TXCP;
                self.fd_ticks_measure =
                    start_counter(self.tid, self.fd_ticks_interrupt.as_raw(), &mut attr).0;
            }

            if PMU_BUGS.activate_useless_counter && !self.fd_useless_counter.is_open() {
                // N.B.: This is deliberately not in the same group as the
                // other counters since we want to keep it scheduled at all
                // times.
                let mut cycles_attr = PMU_ATTRIBUTES.cycles_attr;
                self.fd_useless_counter = start_counter(self.tid, -1, &mut cycles_attr).0;
            }

            let own = f_owner_ex {
                type_: F_OWNER_TID,
                pid: self.tid,
            };
            if unsafe {
                fcntl(
                    self.fd_ticks_interrupt.as_raw(),
                    F_SETOWN_EX,
                    &own as *const f_owner_ex,
                )
            } != 0
            {
                fatal!("Failed to SETOWN_EX ticks event fd");
            }
            make_counter_async(&self.fd_ticks_interrupt, TIME_SLICE_SIGNAL);

            if Flags::get().extra_perf_counters {
                let group_leader = self.fd_ticks_interrupt.as_raw();
                let mut hw_attr = PMU_ATTRIBUTES.hw_interrupts_attr;
                self.fd_hw_interrupts = start_counter(self.tid, group_leader, &mut hw_attr).0;
                let mut rinsn_attr = PMU_ATTRIBUTES.instructions_retired_attr;
                self.fd_instructions_retired =
                    start_counter(self.tid, group_leader, &mut rinsn_attr).0;
                let mut pf_attr = PMU_ATTRIBUTES.page_faults_attr;
                self.fd_page_faults = start_counter(self.tid, group_leader, &mut pf_attr).0;
            }
        } else {
            log!(
                LogDebug,
                "Resetting counters with period {} ({:#x})",
                ticks_period,
                ticks_period
            );

            if perf_ioctl_null(&self.fd_ticks_interrupt, PERF_EVENT_IOC_RESET) != 0 {
                fatal!("ioctl(PERF_EVENT_IOC_RESET) failed");
            }
            if perf_ioctl(
                &self.fd_ticks_interrupt,
                PERF_EVENT_IOC_PERIOD,
                &ticks_period,
            ) != 0
            {
                fatal!(
                    "ioctl(PERF_EVENT_IOC_PERIOD) failed with period {}",
                    ticks_period
                );
            }
            if perf_ioctl_null(&self.fd_ticks_interrupt, PERF_EVENT_IOC_ENABLE) != 0 {
                fatal!("ioctl(PERF_EVENT_IOC_ENABLE) failed");
            }
            if self.fd_ticks_measure.is_open() {
                reset_and_enable(&self.fd_ticks_measure);
            }
            if self.fd_ticks_in_transaction.is_open() {
                reset_and_enable(&self.fd_ticks_in_transaction);
            }
        }

        self.started = true;
        self.counting = true;
    }

    /// Close the kernel handles. They will be automatically reopened
    /// if/when reset is called again.
    pub fn stop(&mut self) {
        if !self.started {
            return;
        }
        self.started = false;
        self.counting = false;

        self.fd_ticks_interrupt.close();
        self.fd_ticks_measure.close();
        self.fd_ticks_in_transaction.close();
        self.fd_useless_counter.close();
        self.fd_hw_interrupts.close();
        self.fd_instructions_retired.close();
        self.fd_page_faults.close();
    }

    /// Suspend counting until the next reset. This may or may not actually
    /// stop the performance counters, depending on whether or not this is
    /// required for correctness on this kernel version.
    pub fn stop_counting(&mut self) {
        if !self.counting {
            return;
        }

        self.counting = false;
        if always_recreate_counters() {
            self.stop();
        } else {
            perf_ioctl_null(&self.fd_ticks_interrupt, PERF_EVENT_IOC_DISABLE);
            if self.fd_ticks_measure.is_open() {
                perf_ioctl_null(&self.fd_ticks_measure, PERF_EVENT_IOC_DISABLE);
            }
            if self.fd_ticks_in_transaction.is_open() {
                perf_ioctl_null(&self.fd_ticks_in_transaction, PERF_EVENT_IOC_DISABLE);
            }
        }
    }

    /// Read the current value of the ticks counter, reconciling the
    /// interrupt and measurement counters. `t` identifies the task in
    /// diagnostics.
    pub fn read_ticks(&self, t: &ReplayTask) -> Ticks {
        if !self.started || !self.counting {
            return 0;
        }

        if self.fd_ticks_in_transaction.is_open() {
            let transaction_ticks = read_counter(&self.fd_ticks_in_transaction);
            if transaction_ticks > 0 {
                log!(LogDebug, "{} IN_TX ticks detected", transaction_ticks);
                ed_assert!(
                    t,
                    transaction_ticks_allowed(transaction_ticks, Flags::get().force_things),
                    "{} IN_TX ticks detected while HLE not supported due to KVM PMU\n\
                     virtualization bug. See \
                     http://marc.info/?l=linux-kernel&m=148582794808419&w=2\n\
                     Aborting. Retry with the force override, but it will probably\n\
                     fail.",
                    transaction_ticks
                );
            }
        }

        let interrupt_val = read_counter(&self.fd_ticks_interrupt);
        if !self.fd_ticks_measure.is_open() {
            return interrupt_val;
        }

        let measure_val = read_counter(&self.fd_ticks_measure);
        reconcile_ticks(interrupt_val, measure_val)
    }

    /// The extended counters, when enabled by configuration. All zeros
    /// while the group is stopped or when the extra counters were never
    /// requested.
    pub fn read_extra(&self) -> ExtraCounterValues {
        // The three handles are opened together, so checking one suffices.
        if self.started && self.fd_page_faults.is_open() {
            ExtraCounterValues {
                page_faults: read_counter(&self.fd_page_faults),
                hw_interrupts: read_counter(&self.fd_hw_interrupts),
                instructions_retired: read_counter(&self.fd_instructions_retired),
            }
        } else {
            ExtraCounterValues::default()
        }
    }

    /// Whether `attr` is the ticks event, regardless of sample period or
    /// the IN_TXCP bit. Assumes nothing else in the process opens a counter
    /// with the same raw event code.
    pub fn is_ticks_attr(attr: &perf_event_attr) -> bool {
        let mut tmp_attr = *attr;
        tmp_attr.sample_period = 0;
        tmp_attr.config &= !IN_TXCP;
        tmp_attr == PMU_ATTRIBUTES.ticks_attr
    }
}

impl Drop for PerfCounters {
    fn drop(&mut self) {
        self.stop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn forced_uarch_substring_match() {
        let profile = forced_uarch_lookup("haswell").unwrap();
        assert_eq!(IntelHaswell, profile.uarch);
        assert_eq!(0x5101c4, profile.rcb_cntr_event);
        assert_eq!(0x5100c0, profile.rinsn_cntr_event);
        assert_eq!(0x5301cb, profile.hw_intr_cntr_event);
        assert!(profile.supported);

        // Case-insensitive, and a substring is enough.
        assert_eq!(
            IntelHaswell,
            forced_uarch_lookup("HaSwElL").unwrap().uarch
        );
        assert_eq!(IntelSkylake, forced_uarch_lookup("sky").unwrap().uarch);
    }

    #[test]
    fn forced_uarch_unsupported_profile() {
        let profile = forced_uarch_lookup("penryn").unwrap();
        assert_eq!(IntelPenryn, profile.uarch);
        assert!(!profile.supported);
    }

    #[test]
    fn forced_uarch_unknown_name() {
        assert!(forced_uarch_lookup("not a real uarch").is_none());
    }

    #[test]
    fn profile_lookup_is_stable() {
        let a = profile_for(IntelHaswell);
        let b = profile_for(IntelHaswell);
        assert!(std::ptr::eq(a, b));
    }

    #[test]
    fn zero_period_rewrite() {
        assert_eq!(1 << 60, effective_period(0, false));
        // Under the quirks the group is recreated, so zero stays zero.
        assert_eq!(0, effective_period(0, true));
        assert_eq!(100, effective_period(100, false));
        assert_eq!(100, effective_period(100, true));
    }

    #[test]
    fn spurious_extra_ticks_are_squashed() {
        assert_eq!(100, reconcile_ticks(100, 120));
        assert_eq!(80, reconcile_ticks(100, 80));
        assert_eq!(100, reconcile_ticks(100, 100));
    }

    #[test]
    fn in_transaction_ticks_fail_without_force() {
        assert!(transaction_ticks_allowed(0, false));
        assert!(!transaction_ticks_allowed(5, false));
        assert!(transaction_ticks_allowed(5, true));
    }

    #[test]
    fn stopped_counters_read_zero() {
        let t = ReplayTask::new(1, 1);
        let counters = PerfCounters::new(1);
        // Never started: both reads take the zeroed path without touching
        // any kernel handle.
        assert_eq!(0, counters.read_ticks(&t));
        assert_eq!(ExtraCounterValues::default(), counters.read_extra());
    }

    #[test]
    fn lifecycle_operations_are_noops_when_stopped() {
        let t = ReplayTask::new(1, 1);
        let mut counters = PerfCounters::new(1);
        // Not counting: returns before any ioctl.
        counters.stop_counting();
        // set_tid stops first; stopping a never-started group does nothing.
        counters.set_tid(2);
        counters.stop();
        assert_eq!(0, counters.read_ticks(&t));
        assert_eq!(ExtraCounterValues::default(), counters.read_extra());
    }

    #[test]
    fn nested_replay_reports_no_bugs() {
        env::set_var("RUNNING_UNDER_RETRACE", "1");
        let bugs = check_for_bugs();
        env::remove_var("RUNNING_UNDER_RETRACE");
        assert!(!bugs.has_ioc_period_bug);
        assert!(!bugs.has_kvm_in_txcp_bug);
        assert!(!bugs.activate_useless_counter);
    }

    #[test]
    fn time_slice_signal_is_realtime() {
        assert!(TIME_SLICE_SIGNAL >= 34 && TIME_SLICE_SIGNAL <= 64);
    }
}
