// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Hardware definitions for the MFNIC multi-function RDMA/Ethernet adapter.
//!
//! Everything in this crate is a direct transcription of the device's
//! register and DMA layouts; no driver logic lives here.

#![forbid(unsafe_code)]

use bitfield_struct::bitfield;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SIZE32: u32 = 4096;
pub const PAGE_SIZE64: u64 = 4096;

/// Register map at the start of BAR0.
#[repr(C)]
#[derive(Debug, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct RegMap {
    pub fw_micro_version: u16,
    pub fw_minor_version: u8,
    pub fw_major_version: u8,
    pub reserved: u32,
    /// Offset of the hardware command register block in BAR0.
    pub hcr_offset: u64,
    /// Offset of the communication-channel doorbell array in BAR0. One
    /// [`COMM_CHANNEL_STRIDE`]-sized `{write, read}` pair per function.
    pub comm_channel_offset: u64,
    /// Offset of the event-queue consumer doorbell array in BAR0, 4 bytes
    /// per event queue.
    pub eq_doorbell_offset: u64,
    /// Number of virtual functions supported by this device.
    pub max_functions: u16,
    pub reserved2: u16,
    pub reserved3: u32,
}

// HCR word offsets, relative to `RegMap::hcr_offset`. Seven 32-bit words;
// the dispatch word doubles as the status word on read-back.
pub const HCR_IN_PARAM_HI: usize = 0x00;
pub const HCR_IN_PARAM_LO: usize = 0x04;
pub const HCR_IN_MODIFIER: usize = 0x08;
pub const HCR_OUT_PARAM_HI: usize = 0x0c;
pub const HCR_OUT_PARAM_LO: usize = 0x10;
pub const HCR_TOKEN: usize = 0x14;
pub const HCR_DISPATCH: usize = 0x18;
pub const HCR_SIZE: usize = 0x1c;

/// Token word layout: the 16-bit command token lives in the high half.
pub const HCR_TOKEN_SHIFT: u32 = 16;

/// HCR word 6. Written to launch a command; read back to poll for
/// completion. `status` is only meaningful once `go` has cleared and
/// `toggle` echoes the value written with the command.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct HcrDispatch {
    #[bits(12)]
    pub opcode: u16,
    #[bits(4)]
    pub op_modifier: u8,
    #[bits(5)]
    pub reserved: u8,
    pub toggle: bool,
    pub event: bool,
    pub go: bool,
    pub status: u8,
}

/// Firmware command opcodes (12 bits on the wire).
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct CmdOpcode(pub u16);

impl CmdOpcode {
    pub const NOP: Self = Self(0x031);
    pub const QUERY_FW: Self = Self(0x004);
    pub const QUERY_FUNC: Self = Self(0x056);
    pub const MAP_EQ: Self = Self(0x012);
    pub const QUERY_PORT: Self = Self(0x043);
    pub const SET_PORT: Self = Self(0x00c);
    pub const GEN_EQE: Self = Self(0x058);
    pub const ALLOC_RES: Self = Self(0xf00);
    pub const FREE_RES: Self = Self(0xf01);
}

impl std::fmt::Debug for CmdOpcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match *self {
            Self::NOP => "NOP",
            Self::QUERY_FW => "QUERY_FW",
            Self::QUERY_FUNC => "QUERY_FUNC",
            Self::MAP_EQ => "MAP_EQ",
            Self::QUERY_PORT => "QUERY_PORT",
            Self::SET_PORT => "SET_PORT",
            Self::GEN_EQE => "GEN_EQE",
            Self::ALLOC_RES => "ALLOC_RES",
            Self::FREE_RES => "FREE_RES",
            _ => return write!(f, "CmdOpcode({:#x})", self.0),
        };
        f.write_str(name)
    }
}

/// 8-bit firmware status codes returned in the HCR status byte, the
/// command-completion EQE, and the VHCR `err` field.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct FwStatus(pub u8);

impl FwStatus {
    pub const OK: Self = Self(0x00);
    pub const INTERNAL_ERR: Self = Self(0x01);
    pub const BAD_OP: Self = Self(0x02);
    pub const BAD_PARAM: Self = Self(0x03);
    pub const BAD_SYS_STATE: Self = Self(0x04);
    pub const BAD_RESOURCE: Self = Self(0x05);
    pub const RESOURCE_BUSY: Self = Self(0x06);
    pub const EXCEED_LIM: Self = Self(0x08);
    pub const BAD_RES_STATE: Self = Self(0x09);
    pub const BAD_INDEX: Self = Self(0x0a);
    pub const BAD_NVMEM: Self = Self(0x0b);
    pub const ICM_ERROR: Self = Self(0x0c);
    pub const BAD_QP_STATE: Self = Self(0x10);
    pub const BAD_SEG_PARAM: Self = Self(0x20);
    pub const REG_BOUND: Self = Self(0x21);
    pub const LAM_NOT_PRE: Self = Self(0x22);
    pub const BAD_PKT: Self = Self(0x30);
    pub const BAD_SIZE: Self = Self(0x40);
    pub const MULTI_FUNC_REQ: Self = Self(0x50);
}

impl std::fmt::Debug for FwStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match *self {
            Self::OK => "OK",
            Self::INTERNAL_ERR => "INTERNAL_ERR",
            Self::BAD_OP => "BAD_OP",
            Self::BAD_PARAM => "BAD_PARAM",
            Self::BAD_SYS_STATE => "BAD_SYS_STATE",
            Self::BAD_RESOURCE => "BAD_RESOURCE",
            Self::RESOURCE_BUSY => "RESOURCE_BUSY",
            Self::EXCEED_LIM => "EXCEED_LIM",
            Self::BAD_RES_STATE => "BAD_RES_STATE",
            Self::BAD_INDEX => "BAD_INDEX",
            Self::BAD_NVMEM => "BAD_NVMEM",
            Self::ICM_ERROR => "ICM_ERROR",
            Self::BAD_QP_STATE => "BAD_QP_STATE",
            Self::BAD_SEG_PARAM => "BAD_SEG_PARAM",
            Self::REG_BOUND => "REG_BOUND",
            Self::LAM_NOT_PRE => "LAM_NOT_PRE",
            Self::BAD_PKT => "BAD_PKT",
            Self::BAD_SIZE => "BAD_SIZE",
            Self::MULTI_FUNC_REQ => "MULTI_FUNC_REQ",
            _ => return write!(f, "FwStatus({:#x})", self.0),
        };
        f.write_str(name)
    }
}

/// The virtual hardware command register, DMA-resident in slave memory.
/// The master copies it in before executing a posted command and copies
/// the result fields back out afterwards.
#[repr(C)]
#[derive(Debug, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Vhcr {
    pub in_param: u64,
    pub out_param: u64,
    pub in_modifier: u32,
    pub timeout_ms: u32,
    pub op: CmdOpcode,
    pub token: u16,
    pub op_modifier: u8,
    pub reserved: [u8; 3],
    pub err: i32,
    pub reserved2: u32,
}

pub const VHCR_SIZE: usize = size_of::<Vhcr>();

/// VHCR `err` values written back by the master. Zero means the embedded
/// firmware status (also zero on success) tells the whole story.
pub const VHCR_EGENERAL: i32 = -1;
pub const VHCR_EPERM: i32 = -2;
pub const VHCR_ENOSYS: i32 = -3;

// Communication channel: one 8-byte doorbell pair per function in BAR0,
// `write` (slave to master) at +0 and `read` (master's toggle ack) at +4.
pub const COMM_CHANNEL_STRIDE: usize = 8;
pub const COMM_CHANNEL_WRITE: usize = 0;
pub const COMM_CHANNEL_READ: usize = 4;

/// Layout of a slave's `write` doorbell. The two toggle bits carry the
/// 1-2-1 sequence counter; toggle 0 is only ever seen on a reset post.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct CommDoorbell {
    pub param: u16,
    pub opcode: u8,
    #[bits(6)]
    pub reserved: u8,
    #[bits(2)]
    pub toggle: u8,
}

/// Master's `read` doorbell: echoes the most recently handled toggle in
/// the same bit positions as [`CommDoorbell`].
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct CommAck {
    #[bits(30)]
    pub reserved: u32,
    #[bits(2)]
    pub toggle: u8,
}

/// Communication-channel command opcodes, posted through the `write`
/// doorbell's `opcode` field.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct CommCmd(pub u8);

impl CommCmd {
    pub const RESET: Self = Self(0);
    pub const VHCR0: Self = Self(1);
    pub const VHCR1: Self = Self(2);
    pub const VHCR2: Self = Self(3);
    pub const VHCR_EN: Self = Self(4);
    pub const VHCR_POST: Self = Self(5);
}

impl std::fmt::Debug for CommCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match *self {
            Self::RESET => "RESET",
            Self::VHCR0 => "VHCR0",
            Self::VHCR1 => "VHCR1",
            Self::VHCR2 => "VHCR2",
            Self::VHCR_EN => "VHCR_EN",
            Self::VHCR_POST => "VHCR_POST",
            _ => return write!(f, "CommCmd({:#x})", self.0),
        };
        f.write_str(name)
    }
}

/// A 32-byte event queue entry, consumed in place from the EQ ring.
/// Ownership alternates between hardware and software each time the
/// producer wraps; an entry belongs to software when `owner != 0` equals
/// the consumer index's wrap-generation parity.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Eqe {
    pub reserved1: u8,
    pub ty: u8,
    pub reserved2: u8,
    pub subtype: u8,
    pub data: [u8; 24],
    pub reserved3: [u8; 3],
    pub owner: u8,
}

pub const EQE_SIZE: usize = size_of::<Eqe>();

// Event types.
pub const EQE_TYPE_COMP: u8 = 0x00;
pub const EQE_TYPE_QP_FATAL: u8 = 0x05;
pub const EQE_TYPE_SQ_DRAINED: u8 = 0x03;
pub const EQE_TYPE_WQ_ACCESS_ERROR: u8 = 0x07;
pub const EQE_TYPE_CQ_ERROR: u8 = 0x04;
pub const EQE_TYPE_PORT_CHANGE: u8 = 0x09;
pub const EQE_TYPE_CMD: u8 = 0x0a;
pub const EQE_TYPE_COMM_CHANNEL: u8 = 0x18;
pub const EQE_TYPE_VEP_UPDATE: u8 = 0x19;
pub const EQE_TYPE_OP_REQUIRED: u8 = 0x1a;
pub const EQE_TYPE_SLAVE_SHUTDOWN: u8 = 0x1c;

// Port-change subtypes.
pub const PORT_CHANGE_SUBTYPE_DOWN: u8 = 0x01;
pub const PORT_CHANGE_SUBTYPE_ACTIVE: u8 = 0x04;

/// Payload of a command-completion event ([`EQE_TYPE_CMD`]).
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct EqeCmdCompletion {
    pub token: u16,
    pub reserved: u16,
    pub status: FwStatus,
    pub reserved2: [u8; 3],
    pub out_param: u64,
}

/// Payload of a port-state-change event ([`EQE_TYPE_PORT_CHANGE`]).
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct EqePortChange {
    pub reserved: u32,
    pub port: u32,
}

/// Payload of a completion-queue event ([`EQE_TYPE_COMP`]) or CQ error.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct EqeCq {
    pub cqn: u32,
    pub syndrome: u32,
}

/// Payload of a QP/WQ error class event.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct EqeQp {
    pub qpn: u32,
    pub syndrome: u32,
}

/// Payload of a comm-channel-armed event: a bit per slave with a pending
/// doorbell, 128 slaves max.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct EqeCommChannel {
    pub bit_vec: [u8; 16],
}

/// Payload of a VEP/MAC configuration update event.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct EqeVepUpdate {
    pub vep_config: u32,
    pub function: u16,
    pub reserved: u16,
}

/// Payload of a slave-shutdown ("prepare to be removed") event.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct EqeSlaveShutdown {
    pub function: u16,
    pub reserved: u16,
}

/// Value written to an EQ's consumer doorbell: the low 24 bits of the
/// consumer index, plus a request to re-arm the interrupt.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct EqDoorbellValue {
    #[bits(24)]
    pub consumer_index: u32,
    #[bits(7)]
    pub reserved: u8,
    pub arm: bool,
}
