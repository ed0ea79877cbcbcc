use crate::dbg_register::*;
use crate::log::LogLevel::LogWarn;
use crate::remote_ptr::RemotePtr;
use std::fmt::{self, Debug, Formatter};
use std::mem::zeroed;

const X86_RESERVED_FLAG: u64 = 1 << 1;
const X86_RF_FLAG: u64 = 1 << 16;

/// A possibly-undefined register value, as reported to the debugger.
/// Registers outside the general-purpose block carry `defined = false`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DbgRegisterValue {
    pub regno: DbgRegister,
    pub value: u64,
    pub defined: bool,
}

/// The x86-64 general-purpose register file of a tracee, in the layout
/// PTRACE_GETREGS/PTRACE_SETREGS use.
#[derive(Copy, Clone)]
pub struct Registers {
    inner: libc::user_regs_struct,
}

macro_rules! reg_accessors {
    ($get:ident, $set:ident, $field:ident) => {
        pub fn $get(&self) -> u64 {
            self.inner.$field
        }
        pub fn $set(&mut self, value: u64) {
            self.inner.$field = value;
        }
    };
}

impl Registers {
    pub fn from_ptrace(inner: libc::user_regs_struct) -> Registers {
        Registers { inner }
    }

    pub fn ptrace_regs(&self) -> &libc::user_regs_struct {
        &self.inner
    }

    pub fn ptrace_regs_mut(&mut self) -> &mut libc::user_regs_struct {
        &mut self.inner
    }

    pub fn ip(&self) -> RemotePtr<u8> {
        RemotePtr::from_val(self.inner.rip as usize)
    }

    pub fn set_ip(&mut self, ip: RemotePtr<u8>) {
        self.inner.rip = ip.as_usize() as u64;
    }

    pub fn sp(&self) -> RemotePtr<u8> {
        RemotePtr::from_val(self.inner.rsp as usize)
    }

    /// The syscall number at a syscall entry, before the kernel overwrites
    /// rax with ENOSYS.
    pub fn original_syscallno(&self) -> i64 {
        self.inner.orig_rax as i64
    }

    pub fn set_original_syscallno(&mut self, no: i64) {
        self.inner.orig_rax = no as u64;
    }

    pub fn syscallno(&self) -> i64 {
        self.inner.rax as i64
    }

    pub fn set_syscallno(&mut self, no: i64) {
        self.inner.rax = no as u64;
    }

    pub fn syscall_result(&self) -> usize {
        self.inner.rax as usize
    }

    pub fn syscall_result_signed(&self) -> i64 {
        self.inner.rax as i64
    }

    pub fn set_syscall_result(&mut self, result: usize) {
        self.inner.rax = result as u64;
    }

    pub fn set_syscall_result_signed(&mut self, result: i64) {
        self.inner.rax = result as u64;
    }

    reg_accessors!(arg1, set_arg1, rdi);
    reg_accessors!(arg2, set_arg2, rsi);
    reg_accessors!(arg3, set_arg3, rdx);
    reg_accessors!(arg4, set_arg4, r10);
    reg_accessors!(arg5, set_arg5, r8);
    reg_accessors!(arg6, set_arg6, r9);

    /// Project one register for the debugger. Numbers outside the
    /// general-purpose block come back with `defined = false`.
    pub fn read_reg(&self, regno: DbgRegister) -> DbgRegisterValue {
        let r = &self.inner;
        let value = match regno {
            DREG_RAX => Some(r.rax),
            DREG_RBX => Some(r.rbx),
            DREG_RCX => Some(r.rcx),
            DREG_RDX => Some(r.rdx),
            DREG_RSI => Some(r.rsi),
            DREG_RDI => Some(r.rdi),
            DREG_RBP => Some(r.rbp),
            DREG_RSP => Some(r.rsp),
            DREG_R8 => Some(r.r8),
            DREG_R9 => Some(r.r9),
            DREG_R10 => Some(r.r10),
            DREG_R11 => Some(r.r11),
            DREG_R12 => Some(r.r12),
            DREG_R13 => Some(r.r13),
            DREG_R14 => Some(r.r14),
            DREG_R15 => Some(r.r15),
            DREG_RIP => Some(r.rip),
            DREG_EFLAGS => Some(r.eflags),
            DREG_CS => Some(r.cs),
            DREG_SS => Some(r.ss),
            DREG_DS => Some(r.ds),
            DREG_ES => Some(r.es),
            DREG_FS => Some(r.fs),
            DREG_GS => Some(r.gs),
            DREG_ORIG_RAX => Some(r.orig_rax),
            _ => None,
        };
        match value {
            Some(v) => DbgRegisterValue {
                regno,
                value: v,
                defined: true,
            },
            None => DbgRegisterValue {
                regno,
                value: 0,
                defined: false,
            },
        }
    }

    /// The full register-file projection sent for a get-all-registers
    /// request: the general-purpose block plus orig_rax.
    pub fn dbg_regfile(&self) -> Vec<DbgRegisterValue> {
        let mut file: Vec<DbgRegisterValue> =
            (0..DREG_NUM_USER_REGS).map(|r| self.read_reg(r)).collect();
        file.push(self.read_reg(DREG_ORIG_RAX));
        file
    }
}

impl Default for Registers {
    fn default() -> Self {
        Registers {
            // Plain data; an all-zero register file is the natural blank.
            inner: unsafe { zeroed() },
        }
    }
}

impl Debug for Registers {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ ip: {}, sp: {}, rax: {:#x}, orig_rax: {:#x} }}",
            self.ip(),
            self.sp(),
            self.inner.rax,
            self.inner.orig_rax
        )
    }
}

/// User-visible eflags bits only: the reserved bit and RF change under
/// ptrace without the tracee's involvement.
fn clean_eflags(eflags: u64) -> u64 {
    (eflags | X86_RESERVED_FLAG) & !X86_RF_FLAG
}

/// Compare two register files, logging every differing register. Returns
/// true when the files match. `name1`/`name2` label the two sides in the
/// log output ("live" vs "recorded", typically).
pub fn compare_register_files(
    name1: &str,
    regs1: &Registers,
    name2: &str,
    regs2: &Registers,
) -> bool {
    let mut mismatches = 0u32;
    let mut check = |regname: &str, v1: u64, v2: u64| {
        if v1 != v2 {
            log!(
                LogWarn,
                "{} {:#x} != {:#x} ({} vs. {})",
                regname,
                v1,
                v2,
                name1,
                name2
            );
            mismatches += 1;
        }
    };

    let (r1, r2) = (&regs1.inner, &regs2.inner);
    check("rax", r1.rax, r2.rax);
    check("rbx", r1.rbx, r2.rbx);
    check("rcx", r1.rcx, r2.rcx);
    check("rdx", r1.rdx, r2.rdx);
    check("rsi", r1.rsi, r2.rsi);
    check("rdi", r1.rdi, r2.rdi);
    check("rbp", r1.rbp, r2.rbp);
    check("rsp", r1.rsp, r2.rsp);
    check("r8", r1.r8, r2.r8);
    check("r9", r1.r9, r2.r9);
    check("r10", r1.r10, r2.r10);
    check("r11", r1.r11, r2.r11);
    check("r12", r1.r12, r2.r12);
    check("r13", r1.r13, r2.r13);
    check("r14", r1.r14, r2.r14);
    check("r15", r1.r15, r2.r15);
    check("rip", r1.rip, r2.rip);
    check("orig_rax", r1.orig_rax, r2.orig_rax);
    check("eflags", clean_eflags(r1.eflags), clean_eflags(r2.eflags));

    mismatches == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_files_match() {
        let mut a = Registers::default();
        a.set_ip(RemotePtr::from_val(0x1000));
        a.set_syscall_result(42);
        let b = a;
        assert!(compare_register_files("live", &a, "recorded", &b));
    }

    #[test]
    fn differing_files_mismatch() {
        let a = Registers::default();
        let mut b = Registers::default();
        b.set_arg1(7);
        b.set_ip(RemotePtr::from_val(0x2000));
        assert!(!compare_register_files("live", &a, "recorded", &b));
    }

    #[test]
    fn eflags_volatile_bits_are_ignored() {
        let mut a = Registers::default();
        let mut b = Registers::default();
        a.ptrace_regs_mut().eflags = X86_RESERVED_FLAG;
        b.ptrace_regs_mut().eflags = X86_RF_FLAG;
        assert!(compare_register_files("live", &a, "recorded", &b));
    }

    #[test]
    fn reg_projection() {
        let mut regs = Registers::default();
        regs.set_ip(RemotePtr::from_val(0xdead));
        let ip = regs.read_reg(DREG_RIP);
        assert!(ip.defined);
        assert_eq!(0xdead, ip.value);

        // An x87 register: present in the id space, undefined here.
        let st0 = regs.read_reg(24);
        assert!(!st0.defined);

        let file = regs.dbg_regfile();
        assert_eq!(DREG_NUM_USER_REGS as usize + 1, file.len());
        assert_eq!(DREG_ORIG_RAX, file.last().unwrap().regno);
    }
}
