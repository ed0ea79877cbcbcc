//! The slice of the kernel perf-event and fcntl ABI the counter code needs.
//! Declared by hand rather than generated: one struct, four ioctls and the
//! signal-routing fcntls.

#![allow(non_camel_case_types)]

use libc::{c_ulong, pid_t};
use std::mem::size_of;

pub const PERF_TYPE_HARDWARE: u32 = 0;
pub const PERF_TYPE_SOFTWARE: u32 = 1;
pub const PERF_TYPE_RAW: u32 = 4;

pub const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;
pub const PERF_COUNT_SW_PAGE_FAULTS: u64 = 2;

pub const PERF_EVENT_IOC_ENABLE: c_ulong = 0x2400;
pub const PERF_EVENT_IOC_DISABLE: c_ulong = 0x2401;
pub const PERF_EVENT_IOC_RESET: c_ulong = 0x2403;
pub const PERF_EVENT_IOC_PERIOD: c_ulong = 0x4008_2404;

pub const F_SETSIG: i32 = 10;
pub const F_SETOWN_EX: i32 = 15;
pub const F_OWNER_TID: i32 = 0;

#[repr(C)]
pub struct f_owner_ex {
    pub type_: i32,
    pub pid: pid_t,
}

/// `struct perf_event_attr`, ABI version 5. The anonymous unions collapse
/// to the members we use; flag bits are accessed through the setters below.
#[repr(C)]
#[derive(Copy, Clone, Default, PartialEq)]
pub struct perf_event_attr {
    pub type_: u32,
    pub size: u32,
    pub config: u64,
    /// Union with sample_freq, which we never use.
    pub sample_period: u64,
    pub sample_type: u64,
    pub read_format: u64,
    flags: u64,
    pub wakeup_events: u32,
    pub bp_type: u32,
    pub config1: u64,
    pub config2: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    __reserved_2: u16,
}

const EXCLUDE_KERNEL_BIT: u64 = 1 << 5;
const EXCLUDE_HV_BIT: u64 = 1 << 6;
const EXCLUDE_GUEST_BIT: u64 = 1 << 20;

impl perf_event_attr {
    fn set_flag(&mut self, bit: u64, value: bool) {
        if value {
            self.flags |= bit;
        } else {
            self.flags &= !bit;
        }
    }

    pub fn set_exclude_kernel(&mut self, value: bool) {
        self.set_flag(EXCLUDE_KERNEL_BIT, value);
    }

    pub fn set_exclude_hv(&mut self, value: bool) {
        self.set_flag(EXCLUDE_HV_BIT, value);
    }

    pub fn set_exclude_guest(&mut self, value: bool) {
        self.set_flag(EXCLUDE_GUEST_BIT, value);
    }
}

// PERF_ATTR_SIZE_VER5; the kernel rejects sizes it doesn't recognize.
const_assert_eq!(size_of::<perf_event_attr>(), 112);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_setters() {
        let mut attr = perf_event_attr::default();
        attr.set_exclude_kernel(true);
        attr.set_exclude_guest(true);
        assert_eq!(EXCLUDE_KERNEL_BIT | EXCLUDE_GUEST_BIT, attr.flags);
        attr.set_exclude_guest(false);
        assert_eq!(EXCLUDE_KERNEL_BIT, attr.flags);
    }
}
