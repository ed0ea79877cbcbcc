//! GDB's x86-64 register numbering, as used in debugger get-register
//! requests and the register-file projection.

pub type DbgRegister = u32;

pub const DREG_RAX: DbgRegister = 0;
pub const DREG_RBX: DbgRegister = 1;
pub const DREG_RCX: DbgRegister = 2;
pub const DREG_RDX: DbgRegister = 3;
pub const DREG_RSI: DbgRegister = 4;
pub const DREG_RDI: DbgRegister = 5;
pub const DREG_RBP: DbgRegister = 6;
pub const DREG_RSP: DbgRegister = 7;
pub const DREG_R8: DbgRegister = 8;
pub const DREG_R9: DbgRegister = 9;
pub const DREG_R10: DbgRegister = 10;
pub const DREG_R11: DbgRegister = 11;
pub const DREG_R12: DbgRegister = 12;
pub const DREG_R13: DbgRegister = 13;
pub const DREG_R14: DbgRegister = 14;
pub const DREG_R15: DbgRegister = 15;
pub const DREG_RIP: DbgRegister = 16;
pub const DREG_EFLAGS: DbgRegister = 17;
pub const DREG_CS: DbgRegister = 18;
pub const DREG_SS: DbgRegister = 19;
pub const DREG_DS: DbgRegister = 20;
pub const DREG_ES: DbgRegister = 21;
pub const DREG_FS: DbgRegister = 22;
pub const DREG_GS: DbgRegister = 23;
/// End of the general-purpose block; 24..=56 are x87/SSE state we leave
/// undefined.
pub const DREG_NUM_USER_REGS: DbgRegister = 24;
pub const DREG_ORIG_RAX: DbgRegister = 57;
