use crate::log::LogLevel::LogWarn;
use crate::remote_ptr::RemotePtr;

pub const MAX_BREAKPOINTS: usize = 128;

/// The x86 software-breakpoint instruction, `int3`.
const INT_3_INSN: u8 = 0xCC;

/// Reading and writing single bytes of a tracee's memory. The replay task
/// implements this over ptrace; tests substitute a plain buffer.
pub trait TraceeMem {
    fn read_byte(&mut self, addr: RemotePtr<u8>) -> u8;
    fn write_byte(&mut self, addr: RemotePtr<u8>, value: u8);
}

#[derive(Copy, Clone, Default)]
struct Breakpoint {
    /// Null means the slot is unused.
    addr: RemotePtr<u8>,
    /// The byte the breakpoint instruction displaced.
    overwritten_data: u8,
}

/// Process-wide software breakpoint table: a flat, fixed-capacity map from
/// tracee address to displaced byte. The dispatch loop installs entries;
/// they are cleared when the last task exits.
pub struct BreakpointTable {
    table: [Breakpoint; MAX_BREAKPOINTS],
}

impl Default for BreakpointTable {
    fn default() -> Self {
        Self::new()
    }
}

impl BreakpointTable {
    pub fn new() -> BreakpointTable {
        BreakpointTable {
            table: [Breakpoint::default(); MAX_BREAKPOINTS],
        }
    }

    fn find(&self, addr: RemotePtr<u8>) -> Option<usize> {
        self.table.iter().position(|bp| bp.addr == addr)
    }

    /// Patch a breakpoint instruction over `addr`, remembering the
    /// displaced byte. Each address may be registered once; running out of
    /// slots is fatal.
    pub fn set(&mut self, mem: &mut dyn TraceeMem, addr: RemotePtr<u8>) {
        debug_assert!(!addr.is_null());
        if self.find(addr).is_some() {
            fatal!("Breakpoint already set at {}", addr);
        }
        let slot = match self.find(RemotePtr::null()) {
            Some(slot) => slot,
            None => {
                fatal!("Sorry, ran out of breakpoints (all {} in use)", MAX_BREAKPOINTS);
            }
        };

        let overwritten_data = mem.read_byte(addr);
        self.table[slot] = Breakpoint {
            addr,
            overwritten_data,
        };
        mem.write_byte(addr, INT_3_INSN);
    }

    /// Restore the displaced byte and free the slot. Removing an address
    /// that isn't registered only warns: the client may retract breakpoints
    /// it never managed to set.
    pub fn remove(&mut self, mem: &mut dyn TraceeMem, addr: RemotePtr<u8>) {
        let slot = match self.find(addr) {
            Some(slot) => slot,
            None => {
                log!(LogWarn, "Couldn't find breakpoint {} to remove", addr);
                return;
            }
        };
        mem.write_byte(addr, self.table[slot].overwritten_data);
        self.table[slot] = Breakpoint::default();
    }

    /// Whether a trap at `ip` came from one of our breakpoints. x86 reports
    /// the address of the byte after the `int3`.
    pub fn ip_is_breakpoint(&self, ip: RemotePtr<u8>) -> bool {
        if ip.is_null() {
            return false;
        }
        self.find(ip - 1usize).is_some()
    }

    /// Drop all entries without touching tracee memory; used when the
    /// tracees are already gone.
    pub fn clear(&mut self) {
        self.table = [Breakpoint::default(); MAX_BREAKPOINTS];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeMem {
        bytes: HashMap<usize, u8>,
    }

    impl TraceeMem for FakeMem {
        fn read_byte(&mut self, addr: RemotePtr<u8>) -> u8 {
            *self.bytes.get(&addr.as_usize()).unwrap_or(&0)
        }
        fn write_byte(&mut self, addr: RemotePtr<u8>, value: u8) {
            self.bytes.insert(addr.as_usize(), value);
        }
    }

    #[test]
    fn set_remove_round_trip() {
        let mut mem = FakeMem::default();
        let addr = RemotePtr::<u8>::from_val(0x1000);
        mem.write_byte(addr, 0x55);

        let mut table = BreakpointTable::new();
        table.set(&mut mem, addr);
        assert_eq!(0xCC, mem.read_byte(addr));
        assert!(table.ip_is_breakpoint(addr + 1));
        assert!(!table.ip_is_breakpoint(addr));

        table.remove(&mut mem, addr);
        assert_eq!(0x55, mem.read_byte(addr));
        assert!(!table.ip_is_breakpoint(addr + 1));
    }

    #[test]
    fn remove_of_absent_address_warns_and_returns() {
        let mut mem = FakeMem::default();
        let mut table = BreakpointTable::new();
        // Must not abort or touch memory.
        table.remove(&mut mem, RemotePtr::from_val(0x2000));
        assert!(mem.bytes.is_empty());
    }

    #[test]
    fn many_breakpoints() {
        let mut mem = FakeMem::default();
        let mut table = BreakpointTable::new();
        for i in 0..MAX_BREAKPOINTS {
            let addr = RemotePtr::<u8>::from_val(0x1000 + i);
            mem.write_byte(addr, i as u8);
            table.set(&mut mem, addr);
        }
        for i in 0..MAX_BREAKPOINTS {
            let addr = RemotePtr::<u8>::from_val(0x1000 + i);
            assert!(table.ip_is_breakpoint(addr + 1));
            table.remove(&mut mem, addr);
            assert_eq!(i as u8, mem.read_byte(addr));
        }
    }

    #[test]
    fn clear_forgets_everything() {
        let mut mem = FakeMem::default();
        let addr = RemotePtr::<u8>::from_val(0x3000);
        let mut table = BreakpointTable::new();
        table.set(&mut mem, addr);
        table.clear();
        assert!(!table.ip_is_breakpoint(addr + 1));
        // The 0xCC byte stays; the tracees it was written into are gone.
        assert_eq!(0xCC, mem.read_byte(addr));
    }
}
