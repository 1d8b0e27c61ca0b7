// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Event-queue processing.
//!
//! Each event queue is a power-of-two ring of 32-byte entries written
//! by the device. Ownership of an entry alternates every time the
//! producer wraps the ring, so the consumer never needs to clear
//! entries behind itself: an entry is software's when its owner bit
//! parity matches the wrap generation of the consumer index.

use crate::cmd::CommandEngine;
use crate::cmd::CommandInterface;
use crate::comm::CommChannel;
use crate::comm::CommWork;
use crate::device::DeviceRegisterIo;
use crate::interrupt::DeviceInterrupt;
use crate::memory::MemoryBlock;
use mfnic_defs::EqDoorbellValue;
use mfnic_defs::Eqe;
use mfnic_defs::EqeCmdCompletion;
use mfnic_defs::EqeCommChannel;
use mfnic_defs::EqeCq;
use mfnic_defs::EqePortChange;
use mfnic_defs::EqeQp;
use mfnic_defs::EqeSlaveShutdown;
use mfnic_defs::EqeVepUpdate;
use mfnic_defs::EQE_SIZE;
use mfnic_defs::EQE_TYPE_CMD;
use mfnic_defs::EQE_TYPE_COMM_CHANNEL;
use mfnic_defs::EQE_TYPE_COMP;
use mfnic_defs::EQE_TYPE_CQ_ERROR;
use mfnic_defs::EQE_TYPE_OP_REQUIRED;
use mfnic_defs::EQE_TYPE_PORT_CHANGE;
use mfnic_defs::EQE_TYPE_QP_FATAL;
use mfnic_defs::EQE_TYPE_SLAVE_SHUTDOWN;
use mfnic_defs::EQE_TYPE_SQ_DRAINED;
use mfnic_defs::EQE_TYPE_VEP_UPDATE;
use mfnic_defs::EQE_TYPE_WQ_ACCESS_ERROR;
use mfnic_defs::PORT_CHANGE_SUBTYPE_ACTIVE;
use parking_lot::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Consumer-index doorbell batching: update the device at least this
/// often while draining so it does not see the ring as full.
pub const EQ_UPDATE_BATCH: u32 = 32;

/// Entries drained per servicing pass before re-arming.
pub const EQ_POLL_BUDGET: u32 = 256;

/// Fallback poll period for missed interrupts.
const EQ_POLL_PERIOD: Duration = Duration::from_millis(100);

/// One event queue ring and its consumer index.
pub struct EventQueue {
    index: u32,
    ring: MemoryBlock,
    len: u32,
    /// Free-running; `ci & (len - 1)` is the ring slot and
    /// `ci & len` the wrap-generation parity.
    ci: u32,
}

impl EventQueue {
    pub(crate) fn new(ring: MemoryBlock, index: u32) -> Self {
        let len = (ring.len() / EQE_SIZE) as u32;
        assert!(len.is_power_of_two());
        // Every entry starts hardware-owned.
        ring.fill(0);
        for i in 0..len as usize {
            ring.write_at(i * EQE_SIZE + (EQE_SIZE - 1), &[0x80]);
        }
        Self {
            index,
            ring,
            len,
            ci: 0,
        }
    }

    pub(crate) fn ring_dma_address(&self) -> u64 {
        self.ring.dma_address()
    }

    /// The entry at the consumer index, if software owns it.
    fn next(&self) -> Option<Eqe> {
        let slot = (self.ci & (self.len - 1)) as usize;
        let eqe: Eqe = self.ring.read_obj(slot * EQE_SIZE);
        ((eqe.owner != 0) == (self.ci & self.len != 0)).then_some(eqe)
    }
}

/// Receiver for asynchronous device events. All methods default to
/// no-ops so consumers only override what they care about.
pub trait EventSink: Send + Sync {
    fn cq_completion(&self, _cqn: u32) {}
    fn cq_error(&self, _cqn: u32, _syndrome: u32) {}
    fn qp_event(&self, _ty: u8, _qpn: u32, _syndrome: u32) {}
    fn port_change(&self, _port: u32, _active: bool) {}
    fn vep_update(&self, _function: u16, _vep_config: u32) {}
    /// A firmware operation request; runs on a worker thread, off the
    /// event-queue servicing path.
    fn operation_required(&self, _data: &[u8; 24]) {}
}

/// A sink that drops everything.
pub struct NullSink;
impl EventSink for NullSink {}

struct EqInner {
    regs: Arc<dyn DeviceRegisterIo>,
    db_offset: usize,
    queues: Vec<Mutex<EventQueue>>,
    engine: Arc<CommandEngine>,
    comm: Option<mpsc::Sender<CommWork>>,
    sink: Arc<dyn EventSink>,
    /// Taken on shutdown to disconnect the deferred worker.
    deferred: Mutex<Option<mpsc::Sender<[u8; 24]>>>,
    running: AtomicBool,
}

fn payload<T: FromBytes + IntoBytes + Immutable + KnownLayout>(eqe: &Eqe) -> T {
    let mut value = T::new_zeroed();
    let len = value.as_bytes().len();
    value.as_mut_bytes().copy_from_slice(&eqe.data[..len]);
    value
}

impl EqInner {
    fn write_doorbell(&self, eq: &EventQueue, arm: bool) {
        self.regs.write_u32(
            self.db_offset + eq.index as usize * 4,
            EqDoorbellValue::new()
                .with_consumer_index(eq.ci & 0xff_ffff)
                .with_arm(arm)
                .into(),
        );
    }

    /// Drains up to [`EQ_POLL_BUDGET`] entries, re-arms, and rechecks.
    /// The recheck closes the race where an entry lands between the
    /// last poll and the arm and the interrupt for it was already
    /// consumed. Once the budget is spent the pass returns with work
    /// pending; the armed interrupt or the poll fallback re-enters.
    fn service(&self, eq: &mut EventQueue) {
        let mut count = 0;
        loop {
            while count < EQ_POLL_BUDGET {
                let Some(eqe) = eq.next() else { break };
                eq.ci = eq.ci.wrapping_add(1);
                count += 1;
                self.dispatch(&eqe);
                if count % EQ_UPDATE_BATCH == 0 {
                    self.write_doorbell(eq, false);
                }
            }
            self.write_doorbell(eq, true);
            if count >= EQ_POLL_BUDGET || eq.next().is_none() {
                break;
            }
        }
    }

    fn dispatch(&self, eqe: &Eqe) {
        match eqe.ty {
            EQE_TYPE_CMD => {
                let c: EqeCmdCompletion = payload(eqe);
                self.engine.complete_by_token(c.token, c.status.0, c.out_param);
            }
            EQE_TYPE_COMM_CHANNEL => {
                let c: EqeCommChannel = payload(eqe);
                if let Some(comm) = &self.comm {
                    let _ = comm.send(CommWork::Scan(c.bit_vec));
                }
            }
            EQE_TYPE_PORT_CHANGE => {
                let c: EqePortChange = payload(eqe);
                let active = eqe.subtype == PORT_CHANGE_SUBTYPE_ACTIVE;
                tracing::info!(port = c.port, active, "port state change");
                self.sink.port_change(c.port, active);
                if let Some(comm) = &self.comm {
                    let _ = comm.send(CommWork::Broadcast(*eqe));
                }
            }
            EQE_TYPE_COMP => {
                let c: EqeCq = payload(eqe);
                self.sink.cq_completion(c.cqn);
            }
            EQE_TYPE_CQ_ERROR => {
                let c: EqeCq = payload(eqe);
                tracing::warn!(cqn = c.cqn, syndrome = c.syndrome, "cq error");
                self.sink.cq_error(c.cqn, c.syndrome);
            }
            EQE_TYPE_QP_FATAL | EQE_TYPE_SQ_DRAINED | EQE_TYPE_WQ_ACCESS_ERROR => {
                let c: EqeQp = payload(eqe);
                self.sink.qp_event(eqe.ty, c.qpn, c.syndrome);
            }
            EQE_TYPE_VEP_UPDATE => {
                let c: EqeVepUpdate = payload(eqe);
                self.sink.vep_update(c.function, c.vep_config);
                // The update names one function; deliver it there only.
                if let Some(comm) = &self.comm {
                    let _ = comm.send(CommWork::Forward(c.function, *eqe));
                }
            }
            EQE_TYPE_OP_REQUIRED => {
                if let Some(deferred) = &*self.deferred.lock() {
                    let _ = deferred.send(eqe.data);
                }
            }
            EQE_TYPE_SLAVE_SHUTDOWN => {
                let c: EqeSlaveShutdown = payload(eqe);
                if let Some(comm) = &self.comm {
                    let _ = comm.send(CommWork::SlaveShutdown(c.function));
                }
            }
            ty => tracing::warn!(ty, "unhandled event type"),
        }
    }
}

/// Drives the device's event queues: one servicing thread per queue,
/// woken by that queue's interrupt with a periodic poll fallback, plus
/// a worker thread for deferred operation requests.
pub struct EqProcessor {
    inner: Arc<EqInner>,
    threads: Vec<JoinHandle<()>>,
    interrupts: Vec<DeviceInterrupt>,
}

impl EqProcessor {
    /// Takes over the given queues. `interrupts` pairs with `queues`
    /// by position. Event-mode command completions are delivered to
    /// `cmd`'s engine; channel events are forwarded to `comm`.
    pub fn new(
        cmd: &CommandInterface,
        queues: Vec<EventQueue>,
        interrupts: Vec<DeviceInterrupt>,
        comm: Option<&CommChannel>,
        sink: Arc<dyn EventSink>,
    ) -> anyhow::Result<Self> {
        assert_eq!(queues.len(), interrupts.len());
        let engine = cmd
            .hcr_engine()
            .ok_or_else(|| anyhow::anyhow!("slave functions do not own event queues"))?
            .clone();
        let map = cmd.reg_map();
        let regs = cmd.regs().clone();
        let db_end = map.eq_doorbell_offset as usize
            + queues.iter().map(|q| q.index as usize + 1).max().unwrap_or(0) * 4;
        if db_end > regs.len() {
            anyhow::bail!("eq doorbells at {:#x} outside bar0", map.eq_doorbell_offset);
        }

        let (deferred_tx, deferred_rx) = mpsc::channel::<[u8; 24]>();
        let inner = Arc::new(EqInner {
            regs,
            db_offset: map.eq_doorbell_offset as usize,
            queues: queues.into_iter().map(Mutex::new).collect(),
            engine,
            comm: comm.map(|c| c.sender()),
            sink,
            deferred: Mutex::new(Some(deferred_tx)),
            running: AtomicBool::new(true),
        });

        let mut threads = Vec::new();
        for (qi, intr) in interrupts.iter().enumerate() {
            let inner = inner.clone();
            let intr = intr.clone();
            threads.push(
                std::thread::Builder::new()
                    .name(format!("mfnic-eq{qi}"))
                    .spawn(move || {
                        // Initial arm; servicing re-arms after each pass.
                        {
                            let mut eq = inner.queues[qi].lock();
                            inner.service(&mut eq);
                        }
                        while inner.running.load(Relaxed) {
                            intr.wait_timeout(EQ_POLL_PERIOD);
                            let mut eq = inner.queues[qi].lock();
                            inner.service(&mut eq);
                        }
                    })?,
            );
        }
        {
            let sink = inner.sink.clone();
            threads.push(
                std::thread::Builder::new()
                    .name("mfnic-eq-deferred".into())
                    .spawn(move || {
                        while let Ok(data) = deferred_rx.recv() {
                            sink.operation_required(&data);
                        }
                    })?,
            );
        }
        Ok(Self {
            inner,
            threads,
            interrupts,
        })
    }

    /// Services every queue on the calling thread. Poll-mode setups
    /// call this instead of relying on the interrupt threads.
    pub fn poll(&self) {
        for queue in &self.inner.queues {
            let mut eq = queue.lock();
            self.inner.service(&mut eq);
        }
    }
}

impl Drop for EqProcessor {
    fn drop(&mut self) {
        self.inner.running.store(false, Relaxed);
        for intr in &self.interrupts {
            intr.trigger();
        }
        // Disconnect the deferred worker so its recv loop ends.
        self.inner.deferred.lock().take();
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulated::DeviceSharedMemory;
    use mfnic_defs::PAGE_SIZE;

    fn test_ring(entries: u32) -> EventQueue {
        let mem = DeviceSharedMemory::new(PAGE_SIZE);
        let ring = mem.block(0, entries as usize * EQE_SIZE);
        EventQueue::new(ring, 0)
    }

    fn produce(eq: &EventQueue, pi: u32, ty: u8) {
        let slot = (pi & (eq.len - 1)) as usize;
        let owner = if pi & eq.len != 0 { 0x80 } else { 0 };
        let eqe = Eqe {
            reserved1: 0,
            ty,
            reserved2: 0,
            subtype: 0,
            data: [0; 24],
            reserved3: [0; 3],
            owner,
        };
        eq.ring.write_obj(slot * EQE_SIZE, &eqe);
    }

    #[test]
    fn empty_ring_has_no_ready_entries() {
        let eq = test_ring(8);
        assert!(eq.next().is_none());
    }

    #[test]
    fn ownership_alternates_across_wrap_generations() {
        let mut eq = test_ring(8);
        // Produce two full laps plus a bit; at every point the number
        // of ready entries seen by the consumer matches what the
        // producer wrote, regardless of which generation it is in.
        for pi in 0..20 {
            produce(&eq, pi, EQE_TYPE_COMP);
            // Only the newly produced entry and nothing else is ready.
            assert!(eq.next().is_some(), "entry {pi} not visible");
            eq.ci = eq.ci.wrapping_add(1);
            assert!(eq.next().is_none(), "ghost entry after {pi}");
        }
    }

    #[test]
    fn consumer_stops_at_producer_index() {
        let mut eq = test_ring(8);
        for pi in 0..5 {
            produce(&eq, pi, EQE_TYPE_COMP);
        }
        let mut seen = 0;
        while eq.next().is_some() {
            eq.ci = eq.ci.wrapping_add(1);
            seen += 1;
        }
        assert_eq!(seen, 5);
    }

    struct CountingSink(std::sync::atomic::AtomicU32);

    impl EventSink for CountingSink {
        fn cq_completion(&self, _cqn: u32) {
            self.0.fetch_add(1, Relaxed);
        }
    }

    #[test]
    fn service_pass_is_bounded_by_budget() {
        let device = crate::emulated::EmulatedDevice::new(2);
        let cmd = CommandInterface::new(device, crate::cmd::CmdMode::Poll, 0).unwrap();
        let entries = 2 * EQ_POLL_BUDGET;
        let mem = DeviceSharedMemory::new((entries as usize * EQE_SIZE).next_multiple_of(PAGE_SIZE));
        let mut eq = EventQueue::new(mem.block(0, entries as usize * EQE_SIZE), 0);
        let backlog = EQ_POLL_BUDGET + 50;
        for pi in 0..backlog {
            produce(&eq, pi, EQE_TYPE_COMP);
        }
        let sink = Arc::new(CountingSink(std::sync::atomic::AtomicU32::new(0)));
        let inner = EqInner {
            regs: cmd.regs().clone(),
            db_offset: cmd.reg_map().eq_doorbell_offset as usize,
            queues: Vec::new(),
            engine: cmd.hcr_engine().unwrap().clone(),
            comm: None,
            sink: sink.clone(),
            deferred: Mutex::new(None),
            running: AtomicBool::new(true),
        };
        // One pass stops at the budget with work still pending.
        inner.service(&mut eq);
        assert_eq!(sink.0.load(Relaxed), EQ_POLL_BUDGET);
        assert!(eq.next().is_some());
        // The next pass finishes the backlog.
        inner.service(&mut eq);
        assert_eq!(sink.0.load(Relaxed), backlog);
        assert!(eq.next().is_none());
    }

    #[test]
    fn full_lap_is_exactly_ring_len() {
        let mut eq = test_ring(8);
        // Produce a full second-generation lap on top of a consumed
        // first lap and confirm exactly ring_len entries are ready.
        for pi in 0..8 {
            produce(&eq, pi, EQE_TYPE_COMP);
            eq.ci = eq.ci.wrapping_add(1);
        }
        for pi in 8..16 {
            produce(&eq, pi, EQE_TYPE_COMP);
        }
        let mut seen = 0;
        while eq.next().is_some() {
            eq.ci = eq.ci.wrapping_add(1);
            seen += 1;
        }
        assert_eq!(seen, 8);
    }
}
