// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The communication channel between the HCR-owning master function and
//! the slave functions.
//!
//! Slaves cannot touch the HCR. Instead each slave registers a
//! DMA-resident virtual HCR (VHCR) with the master through a doorbell
//! handshake, then posts commands into it. The master proxies each
//! posted command: it copies the VHCR in, checks it against a
//! per-opcode policy, stages payloads through its own mailboxes, runs
//! the command on the real HCR (or emulates it entirely), and writes
//! the result back before acknowledging the slave's doorbell toggle.

use crate::bitmap::ResourceBitmap;
use crate::cmd::check_fw_status;
use crate::cmd::CmdError;
use crate::cmd::CmdRequest;
use crate::cmd::CommandEngine;
use crate::cmd::CommandInterface;
use crate::cmd::FaultState;
use crate::device::DeviceRegisterIo;
use crate::device::DmaSpace;
use crate::mailbox::MailboxPool;
use crate::mailbox::MAILBOX_SIZE;
use crate::memory::MemoryBlock;
use mfnic_defs::CmdOpcode;
use mfnic_defs::CommAck;
use mfnic_defs::CommCmd;
use mfnic_defs::CommDoorbell;
use mfnic_defs::Eqe;
use mfnic_defs::EqeCmdCompletion;
use mfnic_defs::FwStatus;
use mfnic_defs::EQE_TYPE_CMD;
use mfnic_defs::RegMap;
use mfnic_defs::Vhcr;
use mfnic_defs::COMM_CHANNEL_READ;
use mfnic_defs::COMM_CHANNEL_STRIDE;
use mfnic_defs::COMM_CHANNEL_WRITE;
use mfnic_defs::VHCR_ENOSYS;
use mfnic_defs::VHCR_EPERM;
use parking_lot::Mutex;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

/// Per-slave-command timeout bounds applied to the slave-requested
/// `timeout_ms` before the master runs the command on its behalf.
const SLAVE_CMD_TIMEOUT_MIN: Duration = Duration::from_secs(1);
const SLAVE_CMD_TIMEOUT_MAX: Duration = Duration::from_secs(60);

/// Work items for the channel's servicing thread.
pub(crate) enum CommWork {
    /// Service the slaves whose bit is set in the event's bit vector.
    Scan([u8; 16]),
    /// Service every slave.
    ScanAll,
    /// Forward an asynchronous event to every active slave.
    Broadcast(Eqe),
    /// Forward an asynchronous event to one slave.
    Forward(u16, Eqe),
    /// The firmware reported that a slave is going away; tear down its
    /// channel state and reclaim its resources.
    SlaveShutdown(u16),
    /// Reply once all previously queued work has been serviced.
    Sync(mpsc::Sender<()>),
    Shutdown,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum CommState {
    Reset,
    Vhcr0,
    Vhcr1,
    Vhcr2,
    VhcrEnabled,
}

struct SlaveState {
    state: CommState,
    /// Last acknowledged doorbell toggle. Zero only after a reset.
    comm_toggle: u8,
    active: bool,
    vhcr_address: u64,
    /// Physical port backing this function, from `QUERY_FUNC`.
    pf_port: u8,
    /// Hardware resources allocated on the slave's behalf.
    resources: Vec<u32>,
}

impl SlaveState {
    fn new() -> Self {
        Self {
            state: CommState::Reset,
            comm_toggle: 0,
            active: false,
            vhcr_address: 0,
            pf_port: 0,
            resources: Vec::new(),
        }
    }
}

pub(crate) struct CommInner {
    regs: Arc<dyn DeviceRegisterIo>,
    comm_offset: usize,
    engine: Arc<CommandEngine>,
    dma: Arc<dyn DmaSpace>,
    mailboxes: MailboxPool,
    /// Index 0 (the master itself) is present but never serviced.
    slaves: Vec<Mutex<SlaveState>>,
    resources: ResourceBitmap,
}

/// Per-opcode policy for commands posted by slaves. Opcodes without an
/// entry fail with `VHCR_ENOSYS` and are never forwarded to hardware.
struct CmdPolicy {
    opcode: CmdOpcode,
    /// `in_param` is the slave address of an input payload that must be
    /// staged through a master mailbox.
    has_inbox: bool,
    /// `out_param` is the slave address of an output payload.
    has_outbox: bool,
    /// The result is immediate and is written to the VHCR `out_param`.
    out_is_imm: bool,
    verify: Option<fn(u16, &SlaveState, &Vhcr) -> bool>,
    /// Runs instead of forwarding to the HCR; used for commands the
    /// master emulates or must rewrite.
    wrapper: Option<fn(&CommInner, u16, &mut SlaveState, &Vhcr) -> Result<Option<u64>, CmdError>>,
}

/// Slaves may only address the physical port backing their function.
fn verify_own_port(_function: u16, state: &SlaveState, vhcr: &Vhcr) -> bool {
    (vhcr.in_modifier & 0xff) as u8 == state.pf_port
}

/// `QUERY_FUNC` always describes the calling function, whatever the
/// slave put in the modifier.
fn wrap_query_func(
    inner: &CommInner,
    function: u16,
    _state: &mut SlaveState,
    vhcr: &Vhcr,
) -> Result<Option<u64>, CmdError> {
    inner.engine.execute(
        CmdRequest {
            in_param: 0,
            out_param: None,
            in_modifier: function.into(),
            op_modifier: vhcr.op_modifier,
            opcode: CmdOpcode::QUERY_FUNC,
        },
        slave_timeout(vhcr),
    )
}

fn wrap_alloc_res(
    inner: &CommInner,
    _function: u16,
    state: &mut SlaveState,
    _vhcr: &Vhcr,
) -> Result<Option<u64>, CmdError> {
    let index = inner
        .resources
        .alloc()
        .ok_or(CmdError::Firmware(FwStatus::EXCEED_LIM))?;
    state.resources.push(index);
    Ok(Some(index.into()))
}

fn wrap_free_res(
    inner: &CommInner,
    _function: u16,
    state: &mut SlaveState,
    vhcr: &Vhcr,
) -> Result<Option<u64>, CmdError> {
    let index = vhcr.in_modifier;
    let pos = state
        .resources
        .iter()
        .position(|&r| r == index)
        .ok_or(CmdError::Firmware(FwStatus::BAD_INDEX))?;
    state.resources.swap_remove(pos);
    inner.resources.free(index);
    Ok(Some(0))
}

static CMD_POLICY: &[CmdPolicy] = &[
    CmdPolicy {
        opcode: CmdOpcode::NOP,
        has_inbox: false,
        has_outbox: false,
        out_is_imm: false,
        verify: None,
        wrapper: None,
    },
    CmdPolicy {
        opcode: CmdOpcode::QUERY_FW,
        has_inbox: false,
        has_outbox: true,
        out_is_imm: false,
        verify: None,
        wrapper: None,
    },
    CmdPolicy {
        opcode: CmdOpcode::QUERY_FUNC,
        has_inbox: false,
        has_outbox: false,
        out_is_imm: true,
        verify: None,
        wrapper: Some(wrap_query_func),
    },
    CmdPolicy {
        opcode: CmdOpcode::QUERY_PORT,
        has_inbox: false,
        has_outbox: false,
        out_is_imm: true,
        verify: Some(verify_own_port),
        wrapper: None,
    },
    CmdPolicy {
        opcode: CmdOpcode::SET_PORT,
        has_inbox: true,
        has_outbox: false,
        out_is_imm: false,
        verify: Some(verify_own_port),
        wrapper: None,
    },
    CmdPolicy {
        opcode: CmdOpcode::ALLOC_RES,
        has_inbox: false,
        has_outbox: false,
        out_is_imm: true,
        verify: None,
        wrapper: Some(wrap_alloc_res),
    },
    CmdPolicy {
        opcode: CmdOpcode::FREE_RES,
        has_inbox: false,
        has_outbox: false,
        out_is_imm: true,
        verify: None,
        wrapper: Some(wrap_free_res),
    },
];

fn slave_timeout(vhcr: &Vhcr) -> Duration {
    if vhcr.timeout_ms == 0 {
        Duration::from_secs(10)
    } else {
        Duration::from_millis(vhcr.timeout_ms.into())
            .clamp(SLAVE_CMD_TIMEOUT_MIN, SLAVE_CMD_TIMEOUT_MAX)
    }
}

impl CommInner {
    fn doorbell(&self, function: u16) -> usize {
        self.comm_offset + function as usize * COMM_CHANNEL_STRIDE
    }

    /// Services one slave: if its write doorbell carries a toggle the
    /// master has not acknowledged yet, handle the posted command.
    fn poll_function(&self, function: u16) {
        let db = CommDoorbell::from(self.regs.read_u32(self.doorbell(function) + COMM_CHANNEL_WRITE));
        let mut slave = self.slaves[function as usize].lock();
        if db.toggle() == slave.comm_toggle {
            return;
        }
        self.handle_doorbell(function, &mut slave, db);
    }

    fn handle_doorbell(&self, function: u16, slave: &mut SlaveState, db: CommDoorbell) {
        let cmd = CommCmd(db.opcode());
        let expected_toggle = if cmd == CommCmd::RESET {
            0
        } else {
            match slave.comm_toggle {
                1 => 2,
                _ => 1,
            }
        };
        if db.toggle() != expected_toggle {
            tracing::warn!(
                function,
                toggle = db.toggle(),
                expected_toggle,
                "out-of-sequence channel doorbell, resetting slave"
            );
            self.slave_reset(function, slave);
            return;
        }

        let legal = match (cmd, slave.state) {
            (CommCmd::RESET, _) => true,
            (CommCmd::VHCR0, CommState::Reset) => true,
            (CommCmd::VHCR1, CommState::Vhcr0) => true,
            (CommCmd::VHCR2, CommState::Vhcr1) => true,
            (CommCmd::VHCR_EN, CommState::Vhcr2) => true,
            (CommCmd::VHCR_POST, CommState::VhcrEnabled) => true,
            _ => false,
        };
        if !legal {
            tracing::warn!(
                function,
                ?cmd,
                state = ?slave.state,
                "channel protocol violation, resetting slave"
            );
            self.slave_reset(function, slave);
            return;
        }

        let param: u64 = db.param().into();
        match cmd {
            CommCmd::RESET => {
                self.slave_reset(function, slave);
                return;
            }
            CommCmd::VHCR0 => {
                slave.vhcr_address = param << 48;
                slave.state = CommState::Vhcr0;
            }
            CommCmd::VHCR1 => {
                slave.vhcr_address |= param << 32;
                slave.state = CommState::Vhcr1;
            }
            CommCmd::VHCR2 => {
                slave.vhcr_address |= param << 16;
                slave.state = CommState::Vhcr2;
            }
            CommCmd::VHCR_EN => {
                slave.vhcr_address |= param;
                match self.engine.execute(
                    CmdRequest {
                        in_param: 0,
                        out_param: None,
                        in_modifier: function.into(),
                        op_modifier: 0,
                        opcode: CmdOpcode::QUERY_FUNC,
                    },
                    Duration::from_secs(10),
                ) {
                    Ok(out) => {
                        slave.pf_port = out.unwrap_or(0) as u8;
                        slave.state = CommState::VhcrEnabled;
                        slave.active = true;
                        tracing::info!(
                            function,
                            vhcr_address = slave.vhcr_address,
                            "slave channel established"
                        );
                    }
                    Err(err) => {
                        tracing::warn!(function, error = %err, "query_func failed, resetting slave");
                        self.slave_reset(function, slave);
                        return;
                    }
                }
            }
            CommCmd::VHCR_POST => {
                self.vhcr_post(function, slave);
            }
            _ => unreachable!(),
        }

        // A fatal error while handling the command reset the slave; the
        // reset ack already went out and must not be overwritten.
        if slave.state == CommState::Reset {
            return;
        }

        // Acknowledging the toggle is what completes the slave's post,
        // so it must come after the command has been fully handled.
        slave.comm_toggle = db.toggle();
        self.regs.write_u32(
            self.doorbell(function) + COMM_CHANNEL_READ,
            CommAck::new().with_toggle(db.toggle()).into(),
        );
    }

    /// Returns the slave to the reset state, reclaiming anything
    /// allocated on its behalf, and acknowledges with toggle zero.
    fn slave_reset(&self, function: u16, slave: &mut SlaveState) {
        for index in slave.resources.drain(..) {
            self.resources.free(index);
        }
        slave.state = CommState::Reset;
        slave.comm_toggle = 0;
        slave.active = false;
        slave.vhcr_address = 0;
        slave.pf_port = 0;
        self.regs.write_u32(
            self.doorbell(function) + COMM_CHANNEL_READ,
            CommAck::new().with_toggle(0).into(),
        );
    }

    /// Executes the command the slave posted into its VHCR.
    fn vhcr_post(&self, function: u16, slave: &mut SlaveState) {
        let mut vhcr = Vhcr::new_zeroed();
        if let Err(err) = self.dma.read(slave.vhcr_address, vhcr.as_mut_bytes()) {
            tracing::warn!(function, error = %err, "vhcr read failed, resetting slave");
            self.slave_reset(function, slave);
            return;
        }

        vhcr.err = match self.run_slave_command(function, slave, &mut vhcr) {
            Ok(()) => 0,
            Err(CmdError::Firmware(status)) => status.0.into(),
            Err(CmdError::Io(raw)) => raw.into(),
            Err(CmdError::PermissionDenied) => VHCR_EPERM,
            Err(CmdError::Dma(err)) => {
                tracing::warn!(function, error = %err, "slave payload dma failed, resetting slave");
                self.slave_reset(function, slave);
                return;
            }
            Err(err) => {
                tracing::warn!(function, opcode = ?vhcr.op, error = %err, "slave command failed");
                match err {
                    CmdError::Channel => VHCR_ENOSYS,
                    _ => mfnic_defs::VHCR_EGENERAL,
                }
            }
        };

        if let Err(err) = self.dma.write(slave.vhcr_address, vhcr.as_bytes()) {
            tracing::warn!(function, error = %err, "vhcr writeback failed, resetting slave");
            self.slave_reset(function, slave);
            return;
        }
        self.inject_cmd_done(function, &vhcr);
    }

    /// Best-effort command-done event toward the slave. The toggle ack
    /// is the authoritative completion signal for polling slaves; this
    /// event serves slaves that sleep on their own event queue.
    fn inject_cmd_done(&self, function: u16, vhcr: &Vhcr) {
        // Channel-level failures have negative codes with no firmware
        // status equivalent; the event still must not claim success.
        let status = u8::try_from(vhcr.err).unwrap_or(FwStatus::INTERNAL_ERR.0);
        let done = EqeCmdCompletion {
            token: vhcr.token,
            reserved: 0,
            status: FwStatus(status),
            reserved2: [0; 3],
            out_param: vhcr.out_param,
        };
        let mut eqe = Eqe {
            reserved1: 0,
            ty: EQE_TYPE_CMD,
            reserved2: 0,
            subtype: 0,
            data: [0; 24],
            reserved3: [0; 3],
            owner: 0,
        };
        let done = done.as_bytes();
        eqe.data[..done.len()].copy_from_slice(done);
        let r = self.mailboxes.alloc().and_then(|mbox| {
            mbox.write_obj(0, &eqe);
            self.engine
                .execute(
                    CmdRequest {
                        in_param: mbox.dma_address(),
                        out_param: None,
                        in_modifier: function.into(),
                        op_modifier: 0,
                        opcode: CmdOpcode::GEN_EQE,
                    },
                    Duration::from_secs(10),
                )
                .map(drop)
        });
        if let Err(err) = r {
            tracing::debug!(function, error = %err, "command-done event not delivered");
        }
    }

    /// Policy-checks and runs one slave command, updating the VHCR
    /// result fields in place.
    fn run_slave_command(
        &self,
        function: u16,
        slave: &mut SlaveState,
        vhcr: &mut Vhcr,
    ) -> Result<(), CmdError> {
        let Some(policy) = CMD_POLICY.iter().find(|p| p.opcode == vhcr.op) else {
            tracing::warn!(function, opcode = ?vhcr.op, "slave posted unsupported opcode");
            return Err(CmdError::Channel);
        };
        if let Some(verify) = policy.verify {
            if !verify(function, slave, vhcr) {
                tracing::warn!(function, opcode = ?vhcr.op, "slave command rejected by policy");
                return Err(CmdError::PermissionDenied);
            }
        }

        let result = if let Some(wrapper) = policy.wrapper {
            wrapper(self, function, slave, vhcr)?
        } else {
            // Stage payloads through master-owned mailboxes so the
            // hardware never sees slave addresses directly.
            let inbox = if policy.has_inbox {
                let mbox = self.mailboxes.alloc()?;
                let mut data = vec![0; MAILBOX_SIZE];
                self.dma.read(vhcr.in_param, &mut data)?;
                mbox.write_at(0, &data);
                Some(mbox)
            } else {
                None
            };
            let outbox = if policy.has_outbox {
                Some(self.mailboxes.alloc()?)
            } else {
                None
            };
            let imm = self.engine.execute(
                CmdRequest {
                    in_param: inbox
                        .as_ref()
                        .map_or(vhcr.in_param, |mbox| mbox.dma_address()),
                    out_param: outbox.as_ref().map(|mbox| mbox.dma_address()),
                    in_modifier: vhcr.in_modifier,
                    op_modifier: vhcr.op_modifier,
                    opcode: vhcr.op,
                },
                slave_timeout(vhcr),
            )?;
            if let Some(mbox) = &outbox {
                let mut data = vec![0; MAILBOX_SIZE];
                mbox.read_at(0, &mut data);
                self.dma.write(vhcr.out_param, &data)?;
            }
            imm
        };

        if policy.out_is_imm {
            vhcr.out_param = result.unwrap_or(0);
        }
        Ok(())
    }

    /// Delivers one event into the slave's event queue, if it is
    /// active.
    fn forward(&self, function: u16, eqe: &Eqe) {
        if !self.slaves[function as usize].lock().active {
            return;
        }
        let r = self.mailboxes.alloc().and_then(|mbox| {
            mbox.write_obj(0, eqe);
            self.engine
                .execute(
                    CmdRequest {
                        in_param: mbox.dma_address(),
                        out_param: None,
                        in_modifier: function.into(),
                        op_modifier: 0,
                        opcode: CmdOpcode::GEN_EQE,
                    },
                    Duration::from_secs(10),
                )
                .map(drop)
        });
        if let Err(err) = r {
            tracing::warn!(function, error = %err, "failed to forward event to slave");
        }
    }

    fn broadcast(&self, eqe: &Eqe) {
        for function in 1..self.slaves.len() as u16 {
            self.forward(function, eqe);
        }
    }
}

/// The master side of the communication channel. Owns a servicing
/// thread fed by the event-queue processor (or a manual kick).
pub struct CommChannel {
    tx: mpsc::Sender<CommWork>,
    worker: Option<JoinHandle<()>>,
    inner: Arc<CommInner>,
}

impl CommChannel {
    /// Builds the channel over the master's command interface. `dma`
    /// is the master's view of host memory, used to reach slave VHCRs
    /// and payload buffers. `resource_count` sizes the shared pool
    /// backing slave `ALLOC_RES` requests.
    pub fn new(
        cmd: &CommandInterface,
        dma: Arc<dyn DmaSpace>,
        resource_count: u32,
    ) -> anyhow::Result<Self> {
        let engine = cmd
            .hcr_engine()
            .ok_or_else(|| anyhow::anyhow!("communication channel requires the hcr owner"))?
            .clone();
        let map = cmd.reg_map();
        let regs = cmd.regs().clone();
        let end = map.comm_channel_offset as usize
            + map.max_functions as usize * COMM_CHANNEL_STRIDE;
        if end > regs.len() {
            anyhow::bail!("comm channel array at {:#x} outside bar0", map.comm_channel_offset);
        }
        let inner = Arc::new(CommInner {
            regs,
            comm_offset: map.comm_channel_offset as usize,
            engine,
            dma,
            mailboxes: cmd.mailbox_pool().clone(),
            slaves: (0..map.max_functions).map(|_| Mutex::new(SlaveState::new())).collect(),
            resources: ResourceBitmap::new(resource_count, 0, 0, 0),
        });
        let (tx, rx) = mpsc::channel();
        let worker = std::thread::Builder::new()
            .name("mfnic-comm".into())
            .spawn({
                let inner = inner.clone();
                move || comm_worker(inner, rx)
            })?;
        Ok(Self {
            tx,
            worker: Some(worker),
            inner,
        })
    }

    /// Queues a scan of every slave doorbell.
    pub fn scan_all(&self) {
        let _ = self.tx.send(CommWork::ScanAll);
    }

    /// Waits until all queued channel work has been serviced.
    pub fn sync(&self) {
        let (tx, rx) = mpsc::channel();
        if self.tx.send(CommWork::Sync(tx)).is_ok() {
            let _ = rx.recv();
        }
    }

    pub(crate) fn sender(&self) -> mpsc::Sender<CommWork> {
        self.tx.clone()
    }

    pub(crate) fn slave_active(&self, function: u16) -> bool {
        self.inner.slaves[function as usize].lock().active
    }

    pub(crate) fn slave_vhcr_address(&self, function: u16) -> u64 {
        self.inner.slaves[function as usize].lock().vhcr_address
    }
}

impl Drop for CommChannel {
    fn drop(&mut self) {
        let _ = self.tx.send(CommWork::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn comm_worker(inner: Arc<CommInner>, rx: mpsc::Receiver<CommWork>) {
    while let Ok(work) = rx.recv() {
        match work {
            CommWork::Scan(bit_vec) => {
                for function in 1..inner.slaves.len() as u16 {
                    let byte = bit_vec[function as usize / 8];
                    if byte & (1 << (function % 8)) != 0 {
                        inner.poll_function(function);
                    }
                }
            }
            CommWork::ScanAll => {
                for function in 1..inner.slaves.len() as u16 {
                    inner.poll_function(function);
                }
            }
            CommWork::Broadcast(eqe) => inner.broadcast(&eqe),
            CommWork::Forward(function, eqe) => {
                if (function as usize) < inner.slaves.len() {
                    inner.forward(function, &eqe);
                }
            }
            CommWork::SlaveShutdown(function) => {
                if (function as usize) < inner.slaves.len() {
                    tracing::info!(function, "slave shutdown");
                    let mut slave = inner.slaves[function as usize].lock();
                    inner.slave_reset(function, &mut slave);
                }
            }
            CommWork::Sync(tx) => drop(tx),
            CommWork::Shutdown => break,
        }
    }
}

struct SlaveChanState {
    toggle: u8,
}

/// The slave side of the channel: posts doorbells and waits for the
/// master's toggle acknowledgment.
pub(crate) struct SlaveChannel {
    regs: Arc<dyn DeviceRegisterIo>,
    doorbell: usize,
    vhcr: MemoryBlock,
    state: Mutex<SlaveChanState>,
    fault: Arc<FaultState>,
}

impl SlaveChannel {
    pub(crate) fn new(
        regs: Arc<dyn DeviceRegisterIo>,
        map: &RegMap,
        function: u16,
        vhcr: MemoryBlock,
        fault: Arc<FaultState>,
    ) -> Self {
        Self {
            regs,
            doorbell: map.comm_channel_offset as usize + function as usize * COMM_CHANNEL_STRIDE,
            vhcr,
            state: Mutex::new(SlaveChanState { toggle: 0 }),
            fault,
        }
    }

    /// Posts one doorbell and waits for the master to acknowledge the
    /// toggle. The toggle cycles 1, 2, 1, ...; zero only on reset.
    fn post(
        &self,
        state: &mut SlaveChanState,
        cmd: CommCmd,
        param: u16,
        timeout: Duration,
    ) -> Result<(), CmdError> {
        let toggle = if cmd == CommCmd::RESET {
            0
        } else {
            match state.toggle {
                1 => 2,
                _ => 1,
            }
        };
        self.regs.write_u32(
            self.doorbell + COMM_CHANNEL_WRITE,
            CommDoorbell::new()
                .with_param(param)
                .with_opcode(cmd.0)
                .with_toggle(toggle)
                .into(),
        );
        state.toggle = toggle;
        let deadline = Instant::now() + timeout;
        loop {
            let ack = CommAck::from(self.regs.read_u32(self.doorbell + COMM_CHANNEL_READ));
            if ack.toggle() == toggle {
                return Ok(());
            }
            if Instant::now() >= deadline {
                tracing::warn!(?cmd, "channel doorbell timed out");
                return Err(CmdError::Timeout);
            }
            std::thread::yield_now();
        }
    }

    /// Registers this function's VHCR with the master: a reset followed
    /// by the address in four 16-bit fragments, high to low.
    pub(crate) fn establish(&self, timeout: Duration) -> Result<(), CmdError> {
        if self.fault.is_barred() {
            return Err(CmdError::Barred);
        }
        let address = self.vhcr.dma_address();
        let mut state = self.state.lock();
        self.post(&mut state, CommCmd::RESET, 0, timeout)?;
        self.post(&mut state, CommCmd::VHCR0, (address >> 48) as u16, timeout)?;
        self.post(&mut state, CommCmd::VHCR1, (address >> 32) as u16, timeout)?;
        self.post(&mut state, CommCmd::VHCR2, (address >> 16) as u16, timeout)?;
        self.post(&mut state, CommCmd::VHCR_EN, address as u16, timeout)?;
        Ok(())
    }

    pub(crate) fn execute(
        &self,
        req: CmdRequest,
        timeout: Duration,
    ) -> Result<Option<u64>, CmdError> {
        if self.fault.is_barred() {
            return Err(CmdError::Barred);
        }
        let mut state = self.state.lock();
        self.vhcr.write_obj(
            0,
            &Vhcr {
                in_param: req.in_param,
                out_param: req.out_param.unwrap_or(0),
                in_modifier: req.in_modifier,
                timeout_ms: timeout.as_millis().try_into().unwrap_or(u32::MAX),
                op: req.opcode,
                token: 0,
                op_modifier: req.op_modifier,
                reserved: [0; 3],
                err: 0,
                reserved2: 0,
            },
        );
        self.post(&mut state, CommCmd::VHCR_POST, 0, timeout)?;
        let done: Vhcr = self.vhcr.read_obj(0);
        match done.err {
            0 => Ok(req.out_param.is_none().then_some(done.out_param)),
            err if err > 0 => {
                check_fw_status(err as u8)?;
                Ok(req.out_param.is_none().then_some(done.out_param))
            }
            VHCR_EPERM => Err(CmdError::PermissionDenied),
            VHCR_ENOSYS => Err(CmdError::Firmware(FwStatus::BAD_OP)),
            _ => Err(CmdError::Channel),
        }
    }
}
