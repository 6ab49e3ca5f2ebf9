//! ARM register file and breakpoint encodings.
//!
//! The register order and widths here must stay in sync with
//! [`TARGET_XML`], which is what the client uses to interpret `g`/`G`
//! payloads and `p`/`P` register numbers.

/// Number of bytes in a serialized [`ArmCoreRegs`] (16 core registers +
/// CPSR).
pub const ARM_REGFILE_LEN: usize = 17 * 4;

/// Target description served via `qXfer:features:read:target.xml`.
///
/// Source: <https://github.com/bminor/binutils-gdb/blob/master/gdb/features/arm/arm-core.xml>
pub const TARGET_XML: &str = r#"<?xml version="1.0"?>
<!DOCTYPE target SYSTEM "gdb-target.dtd">
<target version="1.0">
  <architecture>arm</architecture>
  <feature name="org.gnu.gdb.arm.core">
    <reg name="r0" bitsize="32"/>
    <reg name="r1" bitsize="32"/>
    <reg name="r2" bitsize="32"/>
    <reg name="r3" bitsize="32"/>
    <reg name="r4" bitsize="32"/>
    <reg name="r5" bitsize="32"/>
    <reg name="r6" bitsize="32"/>
    <reg name="r7" bitsize="32"/>
    <reg name="r8" bitsize="32"/>
    <reg name="r9" bitsize="32"/>
    <reg name="r10" bitsize="32"/>
    <reg name="r11" bitsize="32"/>
    <reg name="r12" bitsize="32"/>
    <reg name="sp" bitsize="32" type="data_ptr"/>
    <reg name="lr" bitsize="32"/>
    <reg name="pc" bitsize="32" type="code_ptr"/>
    <reg name="cpsr" bitsize="32" regnum="25"/>
  </feature>
</target>
"#;

/// Permanently-undefined ARM instruction, used as the software breakpoint
/// trap (the kernel reports executing it as an undefined-instruction
/// exception).
pub const ARM_BREAK_INSN: u32 = 0xe7ff_defe;

/// Thumb counterpart of [`ARM_BREAK_INSN`].
pub const THUMB_BREAK_INSN: u16 = 0xdefe;

/// ARM-specific breakpoint kinds, as carried by `Z0`/`z0` packets.
///
/// Extracted from the GDB documentation at
/// [E.5.1.1 ARM Breakpoint Kinds](https://sourceware.org/gdb/current/onlinedocs/gdb/ARM-Breakpoint-Kinds.html)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmBreakpointKind {
    /// 16-bit Thumb mode breakpoint.
    Thumb16,
    /// 32-bit ARM mode breakpoint.
    Arm32,
}

impl ArmBreakpointKind {
    pub fn from_kind(kind: u32) -> Option<Self> {
        match kind {
            2 => Some(ArmBreakpointKind::Thumb16),
            4 => Some(ArmBreakpointKind::Arm32),
            _ => None,
        }
    }

    /// Width of the patched instruction in bytes.
    pub fn len(self) -> usize {
        match self {
            ArmBreakpointKind::Thumb16 => 2,
            ArmBreakpointKind::Arm32 => 4,
        }
    }

    /// The trap instruction for this kind, little-endian, `len()` bytes.
    pub fn trap_bytes(self) -> [u8; 4] {
        match self {
            ArmBreakpointKind::Thumb16 => {
                let b = THUMB_BREAK_INSN.to_le_bytes();
                [b[0], b[1], 0, 0]
            }
            ArmBreakpointKind::Arm32 => ARM_BREAK_INSN.to_le_bytes(),
        }
    }
}

/// 32-bit ARM core registers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ArmCoreRegs {
    /// General purpose registers (R0-R12)
    pub r: [u32; 13],
    /// Stack Pointer (R13)
    pub sp: u32,
    /// Link Register (R14)
    pub lr: u32,
    /// Program Counter (R15)
    pub pc: u32,
    /// Current Program Status Register
    pub cpsr: u32,
}

/// ARM core register identifier, keyed by the GDB register number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmRegId {
    /// General purpose registers (R0-R12)
    Gpr(u8),
    /// Stack Pointer (R13)
    Sp,
    /// Link Register (R14)
    Lr,
    /// Program Counter (R15)
    Pc,
    /// Current Program Status Register
    Cpsr,
}

impl ArmRegId {
    pub fn from_raw_id(id: u32) -> Option<ArmRegId> {
        let reg = match id {
            0..=12 => ArmRegId::Gpr(id as u8),
            13 => ArmRegId::Sp,
            14 => ArmRegId::Lr,
            15 => ArmRegId::Pc,
            25 => ArmRegId::Cpsr,
            _ => return None,
        };
        Some(reg)
    }
}

impl ArmCoreRegs {
    /// Serialize in `target.xml` order, little-endian.
    pub fn to_bytes(&self) -> [u8; ARM_REGFILE_LEN] {
        let mut out = [0; ARM_REGFILE_LEN];
        let regs = self
            .r
            .iter()
            .copied()
            .chain([self.sp, self.lr, self.pc, self.cpsr]);

        for (chunk, reg) in out.chunks_exact_mut(4).zip(regs) {
            chunk.copy_from_slice(&reg.to_le_bytes());
        }

        out
    }

    /// Deserialize a full `G` payload. The length must match exactly.
    pub fn from_bytes(mut bytes: &[u8]) -> Result<ArmCoreRegs, ()> {
        if bytes.len() != ARM_REGFILE_LEN {
            return Err(());
        }

        let mut next_reg = || {
            let (next, rest) = bytes.split_at(4);
            bytes = rest;
            let mut b = [0; 4];
            b.copy_from_slice(next);
            u32::from_le_bytes(b)
        };

        let mut regs = ArmCoreRegs::default();
        for reg in regs.r.iter_mut() {
            *reg = next_reg();
        }
        regs.sp = next_reg();
        regs.lr = next_reg();
        regs.pc = next_reg();
        regs.cpsr = next_reg();

        Ok(regs)
    }

    /// Read a single register by [`ArmRegId`].
    pub fn reg(&self, id: ArmRegId) -> u32 {
        match id {
            ArmRegId::Gpr(n) => self.r[n as usize],
            ArmRegId::Sp => self.sp,
            ArmRegId::Lr => self.lr,
            ArmRegId::Pc => self.pc,
            ArmRegId::Cpsr => self.cpsr,
        }
    }

    /// Write a single register by [`ArmRegId`].
    pub fn set_reg(&mut self, id: ArmRegId, val: u32) {
        match id {
            ArmRegId::Gpr(n) => self.r[n as usize] = val,
            ArmRegId::Sp => self.sp = val,
            ArmRegId::Lr => self.lr = val,
            ArmRegId::Pc => self.pc = val,
            ArmRegId::Cpsr => self.cpsr = val,
        }
    }
}
