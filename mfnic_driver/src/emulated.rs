// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An emulated device with a small firmware model, for driver tests
//! without hardware.
//!
//! The model completes commands synchronously inside the register
//! write that launches them, posts event queue entries with the real
//! ownership protocol, and exposes failure knobs (dropped commands,
//! forced statuses, failing resets) so the driver's recovery paths can
//! be exercised deterministically.

use crate::device::DeviceBacking;
use crate::device::DeviceRegisterIo;
use crate::device::DmaClient;
use crate::device::DmaError;
use crate::device::DmaSpace;
use crate::interrupt::DeviceInterrupt;
use crate::memory::DmaTarget;
use crate::memory::MemoryBlock;
use crate::memory::PAGE_SIZE;
use mfnic_defs::CmdOpcode;
use mfnic_defs::Eqe;
use mfnic_defs::EqeCmdCompletion;
use mfnic_defs::EqeCommChannel;
use mfnic_defs::FwStatus;
use mfnic_defs::HcrDispatch;
use mfnic_defs::RegMap;
use mfnic_defs::COMM_CHANNEL_STRIDE;
use mfnic_defs::COMM_CHANNEL_WRITE;
use mfnic_defs::EQE_SIZE;
use mfnic_defs::EQE_TYPE_CMD;
use mfnic_defs::EQE_TYPE_COMM_CHANNEL;
use mfnic_defs::HCR_DISPATCH;
use mfnic_defs::HCR_IN_MODIFIER;
use mfnic_defs::HCR_IN_PARAM_HI;
use mfnic_defs::HCR_IN_PARAM_LO;
use mfnic_defs::HCR_OUT_PARAM_HI;
use mfnic_defs::HCR_OUT_PARAM_LO;
use mfnic_defs::HCR_TOKEN;
use mfnic_defs::HCR_TOKEN_SHIFT;
use parking_lot::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

const BAR_LEN: usize = 0x1000;
const HCR_OFFSET: usize = 0x80;
const COMM_OFFSET: usize = 0x100;
const EQ_DB_OFFSET: usize = 0x200;

/// Device address of the first byte of shared memory.
const DMA_BASE: u64 = 0x10_0000;

struct SharedMem {
    mem: Vec<AtomicU8>,
    next: Mutex<usize>,
    fail_dma: AtomicBool,
}

impl DmaTarget for SharedMem {
    fn as_slice(&self) -> &[AtomicU8] {
        &self.mem
    }

    fn dma_address(&self) -> u64 {
        DMA_BASE
    }
}

/// Memory shared between the emulated device and the driver: a DMA
/// allocator, a [`DmaSpace`] keyed by device address, and the backing
/// store the firmware model itself reads and writes.
#[derive(Clone)]
pub struct DeviceSharedMemory {
    inner: Arc<SharedMem>,
}

impl DeviceSharedMemory {
    pub fn new(len: usize) -> Self {
        assert!(len % PAGE_SIZE == 0);
        let mut mem = Vec::new();
        mem.resize_with(len, || AtomicU8::new(0));
        Self {
            inner: Arc::new(SharedMem {
                mem,
                next: Mutex::new(0),
                fail_dma: AtomicBool::new(false),
            }),
        }
    }

    /// A view of the raw backing store, bypassing the allocator.
    pub fn block(&self, offset: usize, len: usize) -> MemoryBlock {
        MemoryBlock::new(self.inner.clone(), offset, len)
    }

    /// Fails the next [`DmaSpace`] access.
    pub fn fail_next_dma(&self) {
        self.inner.fail_dma.store(true, Relaxed);
    }

    fn range(&self, addr: u64, len: usize) -> Result<usize, DmaError> {
        let err = DmaError { addr, len };
        if self.inner.fail_dma.swap(false, Relaxed) {
            return Err(err);
        }
        let offset = addr.checked_sub(DMA_BASE).ok_or(DmaError { addr, len })? as usize;
        if offset
            .checked_add(len)
            .map_or(true, |end| end > self.inner.mem.len())
        {
            return Err(err);
        }
        Ok(offset)
    }
}

impl DmaClient for DeviceSharedMemory {
    fn allocate_dma_buffer(&self, len: usize) -> anyhow::Result<MemoryBlock> {
        let len = len.next_multiple_of(PAGE_SIZE);
        let mut next = self.inner.next.lock();
        if *next + len > self.inner.mem.len() {
            anyhow::bail!("out of shared device memory");
        }
        let offset = *next;
        *next += len;
        Ok(MemoryBlock::new(self.inner.clone(), offset, len))
    }
}

impl DmaSpace for DeviceSharedMemory {
    fn read(&self, addr: u64, data: &mut [u8]) -> Result<(), DmaError> {
        let len = data.len();
        let offset = self.range(addr, len)?;
        for (d, s) in data.iter_mut().zip(&self.inner.mem[offset..][..len]) {
            *d = s.load(Relaxed);
        }
        Ok(())
    }

    fn write(&self, addr: u64, data: &[u8]) -> Result<(), DmaError> {
        let offset = self.range(addr, data.len())?;
        for (d, s) in self.inner.mem[offset..][..data.len()].iter().zip(data) {
            d.store(*s, Relaxed);
        }
        Ok(())
    }
}

struct FwEq {
    addr: u64,
    len: u32,
    pi: u32,
}

enum WriteEffect {
    None,
    Command,
    CommDoorbell(u16),
}

/// The firmware model behind the register file.
pub struct FirmwareModel {
    mem: DeviceSharedMemory,
    regs: Mutex<Vec<u32>>,
    accesses: AtomicU64,
    max_functions: u16,
    eqs: Mutex<Vec<Option<FwEq>>>,
    interrupts: Mutex<Vec<Option<DeviceInterrupt>>>,
    /// Swallow this many commands, leaving `go` set.
    drop_commands: AtomicU32,
    /// Complete the next command with this status.
    fail_next: Mutex<Option<u8>>,
    fail_reset: AtomicBool,
    resets: AtomicU32,
    gen_eqes: Mutex<Vec<(u16, Eqe)>>,
    set_ports: Mutex<Vec<(u32, u64)>>,
}

impl FirmwareModel {
    fn new(max_functions: u16, mem: DeviceSharedMemory) -> Self {
        let map = RegMap {
            fw_micro_version: 0x0500,
            fw_minor_version: 11,
            fw_major_version: 2,
            reserved: 0,
            hcr_offset: HCR_OFFSET as u64,
            comm_channel_offset: COMM_OFFSET as u64,
            eq_doorbell_offset: EQ_DB_OFFSET as u64,
            max_functions,
            reserved2: 0,
            reserved3: 0,
        };
        let mut regs = vec![0u32; BAR_LEN / 4];
        for (i, chunk) in map.as_bytes().chunks(4).enumerate() {
            let mut word = [0; 4];
            word.copy_from_slice(chunk);
            regs[i] = u32::from_ne_bytes(word);
        }
        Self {
            mem,
            regs: Mutex::new(regs),
            accesses: AtomicU64::new(0),
            max_functions,
            eqs: Mutex::new(Vec::new()),
            interrupts: Mutex::new(Vec::new()),
            drop_commands: AtomicU32::new(0),
            fail_next: Mutex::new(None),
            fail_reset: AtomicBool::new(false),
            resets: AtomicU32::new(0),
            gen_eqes: Mutex::new(Vec::new()),
            set_ports: Mutex::new(Vec::new()),
        }
    }

    // Test knobs and observers.

    /// Swallows the next `count` commands so they time out.
    pub fn drop_commands(&self, count: u32) {
        self.drop_commands.store(count, Relaxed);
    }

    /// Completes the next command with `status`.
    pub fn fail_next_status(&self, status: FwStatus) {
        *self.fail_next.lock() = Some(status.0);
    }

    /// Makes device resets fail.
    pub fn fail_reset(&self) {
        self.fail_reset.store(true, Relaxed);
    }

    /// Total register reads and writes, for asserting the driver has
    /// stopped touching a barred device.
    pub fn register_accesses(&self) -> u64 {
        self.accesses.load(Relaxed)
    }

    pub fn resets(&self) -> u32 {
        self.resets.load(Relaxed)
    }

    /// The events injected into slaves via `GEN_EQE`, as
    /// `(function, eqe)` pairs.
    pub fn gen_eqes(&self) -> Vec<(u16, Eqe)> {
        self.gen_eqes.lock().clone()
    }

    /// The `(port, in_param)` pairs from `SET_PORT` commands.
    pub fn set_ports(&self) -> Vec<(u32, u64)> {
        self.set_ports.lock().clone()
    }

    /// Injects an event into event queue `index`, as the device would.
    pub fn post_event(&self, index: u32, ty: u8, subtype: u8, data: [u8; 24]) {
        self.post_eqe(
            index,
            Eqe {
                reserved1: 0,
                ty,
                reserved2: 0,
                subtype,
                data,
                reserved3: [0; 3],
                owner: 0,
            },
        );
    }

    fn map_interrupt(&self, index: u32) -> DeviceInterrupt {
        let mut interrupts = self.interrupts.lock();
        if interrupts.len() <= index as usize {
            interrupts.resize_with(index as usize + 1, || None);
        }
        let intr = DeviceInterrupt::new();
        interrupts[index as usize] = Some(intr.clone());
        intr
    }

    fn trigger_interrupt(&self, index: u32) {
        if let Some(Some(intr)) = self.interrupts.lock().get(index as usize) {
            intr.trigger();
        }
    }

    fn reset(&self) -> anyhow::Result<()> {
        if self.fail_reset.load(Relaxed) {
            anyhow::bail!("emulated reset failure");
        }
        self.resets.fetch_add(1, Relaxed);
        self.drop_commands.store(0, Relaxed);
        // Abandon any in-flight command.
        let mut regs = self.regs.lock();
        let hcr = (HCR_OFFSET + HCR_DISPATCH) / 4;
        regs[hcr] = HcrDispatch::from(regs[hcr]).with_go(false).into();
        Ok(())
    }

    fn read_u32(&self, offset: usize) -> u32 {
        self.accesses.fetch_add(1, Relaxed);
        self.regs.lock()[offset / 4]
    }

    fn write_u32(&self, offset: usize, value: u32) {
        self.accesses.fetch_add(1, Relaxed);
        let effect = {
            let mut regs = self.regs.lock();
            regs[offset / 4] = value;
            self.classify(offset, value)
        };
        match effect {
            WriteEffect::None => {}
            WriteEffect::Command => self.handle_command(),
            WriteEffect::CommDoorbell(function) => {
                let mut c = EqeCommChannel { bit_vec: [0; 16] };
                c.bit_vec[function as usize / 8] |= 1 << (function % 8);
                let mut data = [0; 24];
                data[..size_of::<EqeCommChannel>()].copy_from_slice(c.as_bytes());
                self.post_event(0, EQE_TYPE_COMM_CHANNEL, 0, data);
            }
        }
    }

    fn classify(&self, offset: usize, value: u32) -> WriteEffect {
        if offset == HCR_OFFSET + HCR_DISPATCH && HcrDispatch::from(value).go() {
            return WriteEffect::Command;
        }
        let comm_end = COMM_OFFSET + self.max_functions as usize * COMM_CHANNEL_STRIDE;
        if (COMM_OFFSET..comm_end).contains(&offset)
            && (offset - COMM_OFFSET) % COMM_CHANNEL_STRIDE == COMM_CHANNEL_WRITE
        {
            let function = ((offset - COMM_OFFSET) / COMM_CHANNEL_STRIDE) as u16;
            if function != 0 {
                return WriteEffect::CommDoorbell(function);
            }
        }
        WriteEffect::None
    }

    fn handle_command(&self) {
        if self
            .drop_commands
            .fetch_update(Relaxed, Relaxed, |n| n.checked_sub(1))
            .is_ok()
        {
            return;
        }

        let (in_param, in_modifier, out_param, token, dispatch) = {
            let regs = self.regs.lock();
            let word = |o: usize| regs[(HCR_OFFSET + o) / 4];
            (
                (word(HCR_IN_PARAM_HI) as u64) << 32 | word(HCR_IN_PARAM_LO) as u64,
                word(HCR_IN_MODIFIER),
                (word(HCR_OUT_PARAM_HI) as u64) << 32 | word(HCR_OUT_PARAM_LO) as u64,
                (word(HCR_TOKEN) >> HCR_TOKEN_SHIFT) as u16,
                HcrDispatch::from(word(HCR_DISPATCH)),
            )
        };

        let (mut status, imm) = self.run(
            CmdOpcode(dispatch.opcode()),
            dispatch.op_modifier(),
            in_param,
            in_modifier,
            out_param,
        );
        if let Some(forced) = self.fail_next.lock().take() {
            status = forced;
        }

        if dispatch.event() {
            // Free the HCR, then deliver the completion through EQ 0.
            {
                let mut regs = self.regs.lock();
                let hcr = (HCR_OFFSET + HCR_DISPATCH) / 4;
                regs[hcr] = dispatch.with_go(false).with_status(0).into();
            }
            let c = EqeCmdCompletion {
                token,
                reserved: 0,
                status: FwStatus(status),
                reserved2: [0; 3],
                out_param: imm.unwrap_or(0),
            };
            let mut data = [0; 24];
            data[..size_of::<EqeCmdCompletion>()].copy_from_slice(c.as_bytes());
            self.post_event(0, EQE_TYPE_CMD, 0, data);
        } else {
            let mut regs = self.regs.lock();
            if let Some(imm) = imm {
                regs[(HCR_OFFSET + HCR_OUT_PARAM_HI) / 4] = (imm >> 32) as u32;
                regs[(HCR_OFFSET + HCR_OUT_PARAM_LO) / 4] = imm as u32;
            }
            let hcr = (HCR_OFFSET + HCR_DISPATCH) / 4;
            regs[hcr] = dispatch.with_go(false).with_status(status).into();
        }
    }

    /// Executes one command against the model, returning the status and
    /// an immediate result.
    fn run(
        &self,
        opcode: CmdOpcode,
        op_modifier: u8,
        in_param: u64,
        in_modifier: u32,
        out_param: u64,
    ) -> (u8, Option<u64>) {
        match opcode {
            CmdOpcode::NOP => (0, None),
            CmdOpcode::QUERY_FW => {
                let info: [u8; 8] = [2, 11, 0x05, 0x00, 0, 0, 0, 0];
                match self.mem.write(out_param, &info) {
                    Ok(()) => (0, None),
                    Err(_) => (FwStatus::INTERNAL_ERR.0, None),
                }
            }
            // The physical port backing a function: odd functions on
            // port 2, even on port 1.
            CmdOpcode::QUERY_FUNC => (0, Some(((in_modifier & 1) + 1).into())),
            CmdOpcode::QUERY_PORT => (0, Some(0x1_0000 | in_modifier as u64)),
            CmdOpcode::SET_PORT => {
                self.set_ports.lock().push((in_modifier, in_param));
                (0, None)
            }
            CmdOpcode::MAP_EQ => {
                let index = in_modifier as usize;
                let mut eqs = self.eqs.lock();
                if eqs.len() <= index {
                    eqs.resize_with(index + 1, || None);
                }
                eqs[index] = Some(FwEq {
                    addr: in_param,
                    len: 1 << op_modifier,
                    pi: 0,
                });
                (0, None)
            }
            CmdOpcode::GEN_EQE => {
                let mut eqe = Eqe::new_zeroed();
                match self.mem.read(in_param, eqe.as_mut_bytes()) {
                    Ok(()) => {
                        self.gen_eqes.lock().push((in_modifier as u16, eqe));
                        (0, None)
                    }
                    Err(_) => (FwStatus::BAD_PARAM.0, None),
                }
            }
            CmdOpcode::ALLOC_RES => (0, Some(1)),
            CmdOpcode::FREE_RES => (0, Some(0)),
            _ => (FwStatus::BAD_OP.0, None),
        }
    }

    fn post_eqe(&self, index: u32, mut eqe: Eqe) {
        {
            let mut eqs = self.eqs.lock();
            let Some(Some(eq)) = eqs.get_mut(index as usize) else {
                return;
            };
            let slot = eq.pi & (eq.len - 1);
            eqe.owner = if eq.pi & eq.len != 0 { 0x80 } else { 0 };
            eq.pi = eq.pi.wrapping_add(1);
            if self
                .mem
                .write(eq.addr + slot as u64 * EQE_SIZE as u64, eqe.as_bytes())
                .is_err()
            {
                return;
            }
        }
        self.trigger_interrupt(index);
    }
}

/// Registers of the emulated device.
pub struct EmulatedRegisters {
    fw: Arc<FirmwareModel>,
}

impl EmulatedRegisters {
    pub fn new(fw: Arc<FirmwareModel>) -> Self {
        Self { fw }
    }
}

impl DeviceRegisterIo for EmulatedRegisters {
    fn len(&self) -> usize {
        BAR_LEN
    }

    fn read_u32(&self, offset: usize) -> u32 {
        self.fw.read_u32(offset)
    }

    fn write_u32(&self, offset: usize, value: u32) {
        self.fw.write_u32(offset, value)
    }
}

/// An emulated device function. Clones share the same firmware model
/// and memory, so a master and its slaves see one device.
#[derive(Clone)]
pub struct EmulatedDevice {
    fw: Arc<FirmwareModel>,
    mem: DeviceSharedMemory,
}

impl EmulatedDevice {
    pub fn new(max_functions: u16) -> Self {
        let mem = DeviceSharedMemory::new(1024 * PAGE_SIZE);
        let fw = Arc::new(FirmwareModel::new(max_functions, mem.clone()));
        Self { fw, mem }
    }

    pub fn firmware(&self) -> Arc<FirmwareModel> {
        self.fw.clone()
    }

    pub fn memory(&self) -> DeviceSharedMemory {
        self.mem.clone()
    }
}

impl DeviceBacking for EmulatedDevice {
    type Registers = EmulatedRegisters;

    fn map_bar0(&mut self) -> anyhow::Result<Self::Registers> {
        Ok(EmulatedRegisters::new(self.fw.clone()))
    }

    fn dma_client(&self) -> Arc<dyn DmaClient> {
        Arc::new(self.mem.clone())
    }

    fn map_interrupt(&mut self, index: u32) -> anyhow::Result<DeviceInterrupt> {
        Ok(self.fw.map_interrupt(index))
    }

    fn reset(&mut self) -> anyhow::Result<()> {
        self.fw.reset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dma_space_round_trip() {
        let mem = DeviceSharedMemory::new(4 * PAGE_SIZE);
        mem.write(DMA_BASE + 0x40, &[9, 8, 7]).unwrap();
        let mut buf = [0; 3];
        mem.read(DMA_BASE + 0x40, &mut buf).unwrap();
        assert_eq!(buf, [9, 8, 7]);
    }

    #[test]
    fn dma_space_rejects_out_of_range() {
        let mem = DeviceSharedMemory::new(PAGE_SIZE);
        let mut buf = [0; 8];
        assert!(mem.read(DMA_BASE - 8, &mut buf).is_err());
        assert!(mem.read(DMA_BASE + PAGE_SIZE as u64 - 4, &mut buf).is_err());
        mem.fail_next_dma();
        assert!(mem.read(DMA_BASE, &mut buf).is_err());
        assert!(mem.read(DMA_BASE, &mut buf).is_ok());
    }
}
