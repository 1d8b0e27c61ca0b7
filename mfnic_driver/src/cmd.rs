// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The command execution engine: submits opcoded commands to the
//! hardware command register (HCR) and retrieves their results, in poll
//! or event mode. On a slave function the same interface transparently
//! routes commands through the communication channel instead.

use anyhow::Context;

use crate::comm::SlaveChannel;
use crate::device::DeviceBacking;
use crate::device::DeviceControl;
use crate::device::DeviceRegisterIo;
use crate::device::DmaClient;
use crate::device::DmaError;
use crate::eq::EventQueue;
use crate::interrupt::DeviceInterrupt;
use crate::mailbox::Mailbox;
use crate::mailbox::MailboxPool;
use mfnic_defs::CmdOpcode;
use mfnic_defs::FwStatus;
use mfnic_defs::HcrDispatch;
use mfnic_defs::RegMap;
use mfnic_defs::EQE_SIZE;
use mfnic_defs::HCR_DISPATCH;
use mfnic_defs::HCR_IN_MODIFIER;
use mfnic_defs::HCR_IN_PARAM_HI;
use mfnic_defs::HCR_IN_PARAM_LO;
use mfnic_defs::HCR_OUT_PARAM_HI;
use mfnic_defs::HCR_OUT_PARAM_LO;
use mfnic_defs::HCR_SIZE;
use mfnic_defs::HCR_TOKEN;
use mfnic_defs::HCR_TOKEN_SHIFT;
use parking_lot::Condvar;
use parking_lot::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use thiserror::Error;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

/// The maximum number of concurrently outstanding event-mode commands.
pub const MAX_OUTSTANDING_CMDS: usize = 16;

/// Consecutive command timeouts before a device reset is attempted.
pub const RESET_AFTER_TIMEOUTS: u32 = 3;

/// Mailboxes carved out at startup.
const MAILBOX_POOL_SIZE: usize = 32;

const TOKEN_MASK: u16 = MAX_OUTSTANDING_CMDS as u16 - 1;
const TOKEN_STRIDE: u16 = TOKEN_MASK + 1;

/// An error executing a firmware command.
#[derive(Debug, Error)]
pub enum CmdError {
    /// The command did not complete within its timeout.
    #[error("firmware command timed out")]
    Timeout,
    /// The firmware reported a failure status.
    #[error("firmware error: {0:?}")]
    Firmware(FwStatus),
    /// The firmware reported a status this driver does not recognize.
    #[error("firmware i/o error (raw status {0:#x})")]
    Io(u8),
    /// The device is permanently disabled after repeated failures.
    #[error("device is barred")]
    Barred,
    /// The mailbox or command-context pool is exhausted.
    #[error("out of command resources")]
    OutOfMemory,
    /// A policy check rejected the command.
    #[error("permission denied")]
    PermissionDenied,
    /// A DMA copy failed.
    #[error(transparent)]
    Dma(#[from] DmaError),
    /// The command was lost in the virtualization channel.
    #[error("command failed in the virtualization channel")]
    Channel,
}

/// Maps an 8-bit firmware status to a command result.
///
/// `BAD_PKT` means the firmware intentionally dropped a malformed
/// management packet; that is a success as far as the caller is
/// concerned. `MULTI_FUNC_REQ` and `EXCEED_LIM` are real errors here;
/// callers that treat them as soft conditions match on the typed error.
pub(crate) fn check_fw_status(raw: u8) -> Result<(), CmdError> {
    let status = FwStatus(raw);
    match status {
        FwStatus::OK => Ok(()),
        FwStatus::BAD_PKT => {
            tracing::debug!("firmware dropped a malformed management packet");
            Ok(())
        }
        FwStatus::INTERNAL_ERR
        | FwStatus::BAD_OP
        | FwStatus::BAD_PARAM
        | FwStatus::BAD_SYS_STATE
        | FwStatus::BAD_RESOURCE
        | FwStatus::RESOURCE_BUSY
        | FwStatus::EXCEED_LIM
        | FwStatus::BAD_RES_STATE
        | FwStatus::BAD_INDEX
        | FwStatus::BAD_NVMEM
        | FwStatus::ICM_ERROR
        | FwStatus::BAD_QP_STATE
        | FwStatus::BAD_SEG_PARAM
        | FwStatus::REG_BOUND
        | FwStatus::LAM_NOT_PRE
        | FwStatus::BAD_SIZE
        | FwStatus::MULTI_FUNC_REQ => Err(CmdError::Firmware(status)),
        _ => Err(CmdError::Io(raw)),
    }
}

/// Process-wide failure flags, shared between the command engine and
/// the mailbox pool. Owned by the device object, not a global.
pub struct FaultState {
    barred: AtomicBool,
    reset_pending: AtomicBool,
    unloading: AtomicBool,
}

impl FaultState {
    /// Creates a clean fault state.
    pub fn new() -> Self {
        Self {
            barred: AtomicBool::new(false),
            reset_pending: AtomicBool::new(false),
            unloading: AtomicBool::new(false),
        }
    }

    /// True once the device has been permanently disabled.
    pub fn is_barred(&self) -> bool {
        self.barred.load(Relaxed)
    }

    /// Permanently disables the device.
    pub fn bar(&self) {
        if !self.barred.swap(true, Relaxed) {
            tracing::error!("device barred; all further commands will fail");
        }
    }

    /// Marks the device as unloading, so a concurrent timeout
    /// escalation bars instead of resetting.
    pub fn set_unloading(&self) {
        self.unloading.store(true, Relaxed);
    }

    fn is_unloading(&self) -> bool {
        self.unloading.load(Relaxed)
    }

    // At most one reset may be pending at a time.
    fn begin_reset(&self) -> bool {
        self.reset_pending
            .compare_exchange(false, true, Relaxed, Relaxed)
            .is_ok()
    }

    fn end_reset(&self) {
        self.reset_pending.store(false, Relaxed);
    }
}

impl Default for FaultState {
    fn default() -> Self {
        Self::new()
    }
}

/// How the engine retrieves command results. Chosen once at subsystem
/// start; the two modes are mutually exclusive.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CmdMode {
    /// Spin on the HCR status word; one command in flight at a time.
    Poll,
    /// Block on a completion signal raised by the event-queue processor;
    /// up to [`MAX_OUTSTANDING_CMDS`] commands in flight.
    Event,
}

/// One firmware command.
#[derive(Copy, Clone, Debug)]
pub struct CmdRequest {
    /// Immediate input or the device address of the input mailbox.
    pub in_param: u64,
    /// The device address of the output mailbox, or `None` for commands
    /// whose output (if any) is immediate.
    pub out_param: Option<u64>,
    /// The input modifier word.
    pub in_modifier: u32,
    /// The opcode modifier (4 bits).
    pub op_modifier: u8,
    /// The command opcode.
    pub opcode: CmdOpcode,
}

struct HcrState {
    toggle: bool,
}

struct CtxState {
    token: u16,
    busy: bool,
    done: Option<(u8, u64)>,
}

struct CtxSlot {
    state: Mutex<CtxState>,
    cond: Condvar,
}

struct CtxFreeList {
    free: Vec<usize>,
}

pub(crate) struct CommandEngine {
    regs: Arc<dyn DeviceRegisterIo>,
    hcr: usize,
    mode: CmdMode,
    fault: Arc<FaultState>,
    /// Binary semaphore in poll mode; register-access mutex in event
    /// mode (waiters block elsewhere, but the HCR write is serialized).
    hcr_lock: Mutex<HcrState>,
    pool: Mutex<CtxFreeList>,
    pool_cond: Condvar,
    contexts: Vec<CtxSlot>,
    timeouts: AtomicU32,
    device: Mutex<Box<dyn DeviceControl>>,
}

impl CommandEngine {
    fn new(
        regs: Arc<dyn DeviceRegisterIo>,
        hcr: usize,
        mode: CmdMode,
        fault: Arc<FaultState>,
        device: Box<dyn DeviceControl>,
    ) -> Self {
        let contexts = (0..MAX_OUTSTANDING_CMDS)
            .map(|i| CtxSlot {
                state: Mutex::new(CtxState {
                    token: i as u16,
                    busy: false,
                    done: None,
                }),
                cond: Condvar::new(),
            })
            .collect();
        Self {
            regs,
            hcr,
            mode,
            fault,
            hcr_lock: Mutex::new(HcrState { toggle: false }),
            pool: Mutex::new(CtxFreeList {
                free: (0..MAX_OUTSTANDING_CMDS).collect(),
            }),
            pool_cond: Condvar::new(),
            contexts,
            timeouts: AtomicU32::new(0),
            device: Mutex::new(device),
        }
    }

    pub(crate) fn execute(
        &self,
        req: CmdRequest,
        timeout: Duration,
    ) -> Result<Option<u64>, CmdError> {
        if self.fault.is_barred() {
            return Err(CmdError::Barred);
        }
        let r = match self.mode {
            CmdMode::Poll => self.execute_poll(&req, timeout),
            CmdMode::Event => self.execute_event(&req, timeout),
        };
        self.note_result(&r);
        r
    }

    /// Executes through the polled path regardless of mode. Used for
    /// setup commands that must run before the event queues exist.
    pub(crate) fn execute_polled(
        &self,
        req: CmdRequest,
        timeout: Duration,
    ) -> Result<Option<u64>, CmdError> {
        if self.fault.is_barred() {
            return Err(CmdError::Barred);
        }
        let r = self.execute_poll(&req, timeout);
        self.note_result(&r);
        r
    }

    fn post(&self, req: &CmdRequest, toggle: bool, event: bool, token: u16) {
        let r = &self.regs;
        let h = self.hcr;
        let out = req.out_param.unwrap_or(0);
        r.write_u32(h + HCR_IN_PARAM_HI, (req.in_param >> 32) as u32);
        r.write_u32(h + HCR_IN_PARAM_LO, req.in_param as u32);
        r.write_u32(h + HCR_IN_MODIFIER, req.in_modifier);
        r.write_u32(h + HCR_OUT_PARAM_HI, (out >> 32) as u32);
        r.write_u32(h + HCR_OUT_PARAM_LO, out as u32);
        r.write_u32(h + HCR_TOKEN, (token as u32) << HCR_TOKEN_SHIFT);
        // The dispatch word goes last; the go bit launches the command.
        r.write_u32(
            h + HCR_DISPATCH,
            HcrDispatch::new()
                .with_opcode(req.opcode.0)
                .with_op_modifier(req.op_modifier)
                .with_toggle(toggle)
                .with_event(event)
                .with_go(true)
                .into(),
        );
    }

    fn execute_poll(&self, req: &CmdRequest, timeout: Duration) -> Result<Option<u64>, CmdError> {
        let mut hcr = self.hcr_lock.lock();
        if self.fault.is_barred() {
            return Err(CmdError::Barred);
        }
        // The toggle flips each command so a ghost completion of a
        // previous (timed-out) command cannot be mistaken for this one.
        hcr.toggle = !hcr.toggle;
        let toggle = hcr.toggle;
        self.post(req, toggle, false, 0);
        let deadline = Instant::now() + timeout;
        loop {
            let disp = HcrDispatch::from(self.regs.read_u32(self.hcr + HCR_DISPATCH));
            if !disp.go() && disp.toggle() == toggle {
                check_fw_status(disp.status())?;
                let out = req.out_param.is_none().then(|| {
                    ((self.regs.read_u32(self.hcr + HCR_OUT_PARAM_HI) as u64) << 32)
                        | self.regs.read_u32(self.hcr + HCR_OUT_PARAM_LO) as u64
                });
                return Ok(out);
            }
            if Instant::now() >= deadline {
                tracing::warn!(opcode = ?req.opcode, "polled command timed out");
                return Err(CmdError::Timeout);
            }
            std::thread::yield_now();
        }
    }

    fn execute_event(&self, req: &CmdRequest, timeout: Duration) -> Result<Option<u64>, CmdError> {
        let idx = self.acquire_context(timeout)?;
        let token = {
            let mut st = self.contexts[idx].state.lock();
            // Stride the token so a context's successive uses never
            // collide, while `token & TOKEN_MASK` still recovers the
            // context index.
            st.token = st.token.wrapping_add(TOKEN_STRIDE);
            st.busy = true;
            st.done = None;
            st.token
        };
        {
            let mut hcr = self.hcr_lock.lock();
            if self.fault.is_barred() {
                self.abort_context(idx);
                return Err(CmdError::Barred);
            }
            // The previous post may still be latching in hardware; the
            // HCR words must not be overwritten while go is set.
            let deadline = Instant::now() + timeout;
            loop {
                let disp = HcrDispatch::from(self.regs.read_u32(self.hcr + HCR_DISPATCH));
                if !disp.go() {
                    break;
                }
                if Instant::now() >= deadline {
                    tracing::warn!(opcode = ?req.opcode, "hcr busy, command not posted");
                    self.abort_context(idx);
                    return Err(CmdError::Timeout);
                }
                std::thread::yield_now();
            }
            hcr.toggle = !hcr.toggle;
            let toggle = hcr.toggle;
            self.post(req, toggle, true, token);
        }

        let slot = &self.contexts[idx];
        let deadline = Instant::now() + timeout;
        let mut st = slot.state.lock();
        while st.done.is_none() {
            if slot.cond.wait_until(&mut st, deadline).timed_out() {
                break;
            }
        }
        let done = st.done.take();
        st.busy = false;
        drop(st);
        self.release_context(idx);

        match done {
            Some((raw, out)) => {
                check_fw_status(raw)?;
                Ok(req.out_param.is_none().then_some(out))
            }
            None => {
                tracing::warn!(opcode = ?req.opcode, token, "event-mode command timed out");
                Err(CmdError::Timeout)
            }
        }
    }

    fn acquire_context(&self, timeout: Duration) -> Result<usize, CmdError> {
        let deadline = Instant::now() + timeout;
        let mut pool = self.pool.lock();
        loop {
            if let Some(idx) = pool.free.pop() {
                return Ok(idx);
            }
            if self.pool_cond.wait_until(&mut pool, deadline).timed_out() {
                return Err(CmdError::OutOfMemory);
            }
        }
    }

    fn release_context(&self, idx: usize) {
        self.pool.lock().free.push(idx);
        self.pool_cond.notify_one();
    }

    /// Frees a context whose command was never posted.
    fn abort_context(&self, idx: usize) {
        self.contexts[idx].state.lock().busy = false;
        self.release_context(idx);
    }

    /// Completes the event-mode command holding `token`. A token that
    /// matches no in-flight command is a stale or ghost completion and
    /// is dropped without side effects.
    pub(crate) fn complete_by_token(&self, token: u16, status: u8, out_param: u64) {
        let idx = (token & TOKEN_MASK) as usize;
        let slot = &self.contexts[idx];
        let mut st = slot.state.lock();
        if !st.busy || st.token != token {
            tracing::warn!(token, "unexpected command completion token, ignoring");
            return;
        }
        st.done = Some((status, out_param));
        slot.cond.notify_one();
    }

    fn note_result(&self, r: &Result<Option<u64>, CmdError>) {
        match r {
            Err(CmdError::Timeout) => {
                let n = self.timeouts.fetch_add(1, Relaxed) + 1;
                if n >= RESET_AFTER_TIMEOUTS {
                    self.escalate_reset();
                }
            }
            _ => self.timeouts.store(0, Relaxed),
        }
    }

    fn escalate_reset(&self) {
        if self.fault.is_barred() || !self.fault.begin_reset() {
            return;
        }
        if self.fault.is_unloading() {
            tracing::error!("repeated command timeouts during unload");
            self.fault.bar();
        } else {
            match self.device.lock().reset_device() {
                Ok(()) => {
                    self.timeouts.store(0, Relaxed);
                    tracing::info!("device reset after repeated command timeouts");
                }
                Err(err) => {
                    tracing::error!(error = %err, "device reset failed");
                    self.fault.bar();
                }
            }
        }
        self.fault.end_reset();
    }

    pub(crate) fn fault(&self) -> &Arc<FaultState> {
        &self.fault
    }
}

enum CmdPath {
    /// This function owns the HCR.
    Hcr(Arc<CommandEngine>),
    /// This function is a slave; commands go through the
    /// communication channel.
    Channel(Arc<SlaveChannel>),
}

/// The command interface of one device function.
pub struct CommandInterface {
    regs: Arc<dyn DeviceRegisterIo>,
    map: RegMap,
    path: CmdPath,
    mailboxes: MailboxPool,
    dma_client: Arc<dyn DmaClient>,
    fault: Arc<FaultState>,
    interrupts: Vec<DeviceInterrupt>,
}

fn read_reg_map(bar0: &impl DeviceRegisterIo) -> anyhow::Result<RegMap> {
    if bar0.len() < size_of::<RegMap>() {
        anyhow::bail!("bar0 ({} bytes) too small for reg map", bar0.len());
    }
    let mut map = RegMap::new_zeroed();
    for i in 0..size_of::<RegMap>() / 4 {
        let v = bar0.read_u32(i * 4);
        // Unmapped device memory reads as all-ones; catch it on the
        // first word for a clear error early.
        if i == 0 && v == !0 {
            anyhow::bail!("bar0 read returned -1, device is not present");
        }
        map.as_mut_bytes()[i * 4..][..4].copy_from_slice(&v.to_ne_bytes());
    }
    tracing::debug!(?map, "register map");
    if (map.hcr_offset as usize).saturating_add(HCR_SIZE) > bar0.len() {
        anyhow::bail!("hcr at {:#x} outside bar0", map.hcr_offset);
    }
    Ok(map)
}

impl CommandInterface {
    /// Probes the device and builds the command interface for the
    /// HCR-owning (master or standalone) function, mapping `num_eqs`
    /// interrupt vectors for the caller's event queues.
    pub fn new(
        mut device: impl DeviceBacking,
        mode: CmdMode,
        num_eqs: u32,
    ) -> anyhow::Result<Self> {
        let bar0 = device.map_bar0()?;
        let map = read_reg_map(&bar0)?;
        let interrupts = (0..num_eqs)
            .map(|i| device.map_interrupt(i))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let dma_client = device.dma_client();
        let regs: Arc<dyn DeviceRegisterIo> = Arc::new(bar0);
        let fault = Arc::new(FaultState::new());
        let engine = Arc::new(CommandEngine::new(
            regs.clone(),
            map.hcr_offset as usize,
            mode,
            fault.clone(),
            Box::new(device),
        ));
        let mailboxes = MailboxPool::new(dma_client.as_ref(), MAILBOX_POOL_SIZE, fault.clone())?;
        Ok(Self {
            regs,
            map,
            path: CmdPath::Hcr(engine),
            mailboxes,
            dma_client,
            fault,
            interrupts,
        })
    }

    /// Probes the device and builds the command interface for slave
    /// function `function`, which has no HCR access. The caller must
    /// run [`Self::establish`] before executing commands.
    pub fn new_slave(mut device: impl DeviceBacking, function: u16) -> anyhow::Result<Self> {
        let bar0 = device.map_bar0()?;
        let map = read_reg_map(&bar0)?;
        if function == 0 || function >= map.max_functions {
            anyhow::bail!("function {function} out of range");
        }
        let dma_client = device.dma_client();
        let regs: Arc<dyn DeviceRegisterIo> = Arc::new(bar0);
        let fault = Arc::new(FaultState::new());
        let vhcr = dma_client
            .allocate_dma_buffer(crate::memory::PAGE_SIZE)
            .context("failed to allocate vhcr")?;
        let channel = Arc::new(SlaveChannel::new(
            regs.clone(),
            &map,
            function,
            vhcr,
            fault.clone(),
        ));
        let mailboxes = MailboxPool::new(dma_client.as_ref(), MAILBOX_POOL_SIZE, fault.clone())?;
        Ok(Self {
            regs,
            map,
            path: CmdPath::Channel(channel),
            mailboxes,
            dma_client,
            fault,
            interrupts: Vec::new(),
        })
    }

    /// Executes one firmware command, blocking until completion or
    /// `timeout`.
    pub fn execute(&self, req: CmdRequest, timeout: Duration) -> Result<Option<u64>, CmdError> {
        match &self.path {
            CmdPath::Hcr(engine) => engine.execute(req, timeout),
            CmdPath::Channel(channel) => channel.execute(req, timeout),
        }
    }

    /// Runs the slave-side channel handshake, registering this
    /// function's VHCR with the master.
    pub fn establish(&self, timeout: Duration) -> Result<(), CmdError> {
        match &self.path {
            CmdPath::Hcr(_) => Ok(()),
            CmdPath::Channel(channel) => channel.establish(timeout),
        }
    }

    /// Allocates an event queue ring and maps it into the device with
    /// `MAP_EQ`. Setup commands run polled; event delivery only starts
    /// once the event-queue processor takes over the returned queue.
    pub fn create_eq(&self, index: u32, entries: u32) -> anyhow::Result<EventQueue> {
        assert!(entries.is_power_of_two());
        let engine = match &self.path {
            CmdPath::Hcr(engine) => engine,
            CmdPath::Channel(_) => anyhow::bail!("slave functions do not own event queues"),
        };
        let ring = self
            .dma_client
            .allocate_dma_buffer(entries as usize * EQE_SIZE)
            .context("failed to allocate eq ring")?;
        let eq = EventQueue::new(ring, index);
        engine.execute_polled(
            CmdRequest {
                in_param: eq.ring_dma_address(),
                out_param: None,
                in_modifier: index,
                op_modifier: entries.trailing_zeros() as u8,
                opcode: CmdOpcode::MAP_EQ,
            },
            Duration::from_secs(10),
        )?;
        Ok(eq)
    }

    /// Leases a command mailbox.
    pub fn mailbox(&self) -> Result<Mailbox, CmdError> {
        self.mailboxes.alloc()
    }

    /// The mailbox pool, for components staging payloads on behalf of
    /// other functions.
    pub fn mailbox_pool(&self) -> &MailboxPool {
        &self.mailboxes
    }

    /// Takes the interrupt vector for event queue `index`.
    pub fn take_interrupt(&mut self, index: usize) -> DeviceInterrupt {
        self.interrupts[index].clone()
    }

    /// The probed register map.
    pub fn reg_map(&self) -> &RegMap {
        &self.map
    }

    /// The device's fault flags.
    pub fn fault(&self) -> &Arc<FaultState> {
        &self.fault
    }

    /// Marks the device as unloading; a timeout escalation after this
    /// point bars the device instead of resetting it.
    pub fn shutdown(&self) {
        self.fault.set_unloading();
    }

    pub(crate) fn regs(&self) -> &Arc<dyn DeviceRegisterIo> {
        &self.regs
    }

    pub(crate) fn hcr_engine(&self) -> Option<&Arc<CommandEngine>> {
        match &self.path {
            CmdPath::Hcr(engine) => Some(engine),
            CmdPath::Channel(_) => None,
        }
    }

    pub(crate) fn dma_client(&self) -> &Arc<dyn DmaClient> {
        &self.dma_client
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_table() {
        assert!(check_fw_status(0).is_ok());
        // Dropped management traffic is a documented firmware semantic,
        // not an error.
        assert!(check_fw_status(FwStatus::BAD_PKT.0).is_ok());
        assert!(matches!(
            check_fw_status(FwStatus::BAD_PARAM.0),
            Err(CmdError::Firmware(FwStatus::BAD_PARAM))
        ));
        assert!(matches!(
            check_fw_status(FwStatus::MULTI_FUNC_REQ.0),
            Err(CmdError::Firmware(FwStatus::MULTI_FUNC_REQ))
        ));
        // Unmapped nonzero codes degrade to a generic i/o error.
        assert!(matches!(check_fw_status(0x77), Err(CmdError::Io(0x77))));
    }

    #[test]
    fn busy_hcr_is_not_overwritten_by_a_second_post() {
        let dev = crate::emulated::EmulatedDevice::new(8);
        let fw = dev.firmware();
        let regs = Arc::new(crate::emulated::EmulatedRegisters::new(fw.clone()));
        let engine = Arc::new(CommandEngine::new(
            regs.clone(),
            0x80,
            CmdMode::Event,
            Arc::new(FaultState::new()),
            Box::new(dev),
        ));
        let nop = CmdRequest {
            in_param: 0,
            out_param: None,
            in_modifier: 0,
            op_modifier: 0,
            opcode: CmdOpcode::NOP,
        };

        // The device swallows the first command, leaving its go bit set
        // as if the hardware were still latching it.
        fw.drop_commands(1);
        let first = std::thread::spawn({
            let engine = engine.clone();
            move || engine.execute(nop, Duration::from_secs(1))
        });
        while !HcrDispatch::from(regs.read_u32(0x80 + HCR_DISPATCH)).go() {
            std::thread::yield_now();
        }
        let token_word = regs.read_u32(0x80 + HCR_TOKEN);

        // A second post must wait for go to clear, not clobber the
        // in-flight command's HCR words.
        let r = engine.execute(nop, Duration::from_millis(50));
        assert!(matches!(r, Err(CmdError::Timeout)));
        assert_eq!(regs.read_u32(0x80 + HCR_TOKEN), token_word);
        assert!(matches!(first.join().unwrap(), Err(CmdError::Timeout)));
    }

    #[test]
    fn tokens_are_unique_while_outstanding() {
        let dev = crate::emulated::EmulatedDevice::new(8);
        let fw = dev.firmware();
        let engine = CommandEngine::new(
            Arc::new(crate::emulated::EmulatedRegisters::new(fw)),
            0x80,
            CmdMode::Event,
            Arc::new(FaultState::new()),
            Box::new(dev),
        );

        let mut tokens = Vec::new();
        for _ in 0..MAX_OUTSTANDING_CMDS {
            let idx = engine.acquire_context(Duration::from_secs(1)).unwrap();
            let mut st = engine.contexts[idx].state.lock();
            st.token = st.token.wrapping_add(TOKEN_STRIDE);
            st.busy = true;
            tokens.push(st.token);
        }
        let unique: std::collections::HashSet<_> = tokens.iter().collect();
        assert_eq!(unique.len(), MAX_OUTSTANDING_CMDS);
        assert!(matches!(
            engine.acquire_context(Duration::from_millis(10)),
            Err(CmdError::OutOfMemory)
        ));
    }
}
