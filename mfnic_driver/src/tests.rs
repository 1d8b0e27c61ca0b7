// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! End-to-end tests against the emulated device: command execution in
//! both modes, the channel handshake and proxying, event routing, and
//! the timeout recovery path.

use crate::cmd::CmdError;
use crate::cmd::CmdMode;
use crate::cmd::CmdRequest;
use crate::cmd::CommandInterface;
use crate::comm::CommChannel;
use crate::emulated::EmulatedDevice;
use crate::emulated::EmulatedRegisters;
use crate::eq::EqProcessor;
use crate::eq::EventSink;
use crate::eq::NullSink;
use mfnic_defs::CmdOpcode;
use mfnic_defs::CommAck;
use mfnic_defs::CommCmd;
use mfnic_defs::CommDoorbell;
use mfnic_defs::EqeCmdCompletion;
use mfnic_defs::EqePortChange;
use mfnic_defs::EqeVepUpdate;
use mfnic_defs::FwStatus;
use mfnic_defs::COMM_CHANNEL_READ;
use mfnic_defs::COMM_CHANNEL_STRIDE;
use mfnic_defs::EQE_TYPE_CMD;
use mfnic_defs::EQE_TYPE_PORT_CHANGE;
use mfnic_defs::EQE_TYPE_VEP_UPDATE;
use mfnic_defs::PORT_CHANGE_SUBTYPE_ACTIVE;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

const TIMEOUT: Duration = Duration::from_secs(5);

fn nop() -> CmdRequest {
    CmdRequest {
        in_param: 0,
        out_param: None,
        in_modifier: 0,
        op_modifier: 0,
        opcode: CmdOpcode::NOP,
    }
}

fn query_func(function: u16) -> CmdRequest {
    CmdRequest {
        in_param: 0,
        out_param: None,
        in_modifier: function.into(),
        op_modifier: 0,
        opcode: CmdOpcode::QUERY_FUNC,
    }
}

/// Polls `cond` until it holds or the deadline passes.
fn wait_for(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "condition did not hold in time");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn poll_mode_round_trip() {
    let device = EmulatedDevice::new(8);
    let master = CommandInterface::new(device, CmdMode::Poll, 0).unwrap();
    assert_eq!(master.execute(nop(), TIMEOUT).unwrap(), Some(0));
    // Odd functions sit on port 2, even on port 1.
    assert_eq!(master.execute(query_func(3), TIMEOUT).unwrap(), Some(2));
    assert_eq!(master.execute(query_func(4), TIMEOUT).unwrap(), Some(1));
}

#[test]
fn firmware_status_is_surfaced() {
    let device = EmulatedDevice::new(8);
    let fw = device.firmware();
    let master = CommandInterface::new(device, CmdMode::Poll, 0).unwrap();

    fw.fail_next_status(FwStatus::BAD_PARAM);
    assert!(matches!(
        master.execute(nop(), TIMEOUT),
        Err(CmdError::Firmware(FwStatus::BAD_PARAM))
    ));
    // A dropped management packet is reported as success.
    fw.fail_next_status(FwStatus::BAD_PKT);
    assert_eq!(master.execute(nop(), TIMEOUT).unwrap(), Some(0));
    // Recovery: the next command is clean.
    assert_eq!(master.execute(nop(), TIMEOUT).unwrap(), Some(0));
}

#[test]
fn event_mode_round_trip() {
    let device = EmulatedDevice::new(8);
    let mut master = CommandInterface::new(device, CmdMode::Event, 1).unwrap();
    let eq = master.create_eq(0, 32).unwrap();
    let intr = master.take_interrupt(0);
    let _eqp = EqProcessor::new(&master, vec![eq], vec![intr], None, Arc::new(NullSink)).unwrap();

    for function in 0..16u16 {
        let expected = u64::from((u32::from(function) & 1) + 1);
        assert_eq!(
            master.execute(query_func(function), TIMEOUT).unwrap(),
            Some(expected)
        );
    }
}

#[test]
fn repeated_timeouts_reset_the_device() {
    let device = EmulatedDevice::new(8);
    let fw = device.firmware();
    let master = CommandInterface::new(device, CmdMode::Poll, 0).unwrap();

    fw.drop_commands(crate::cmd::RESET_AFTER_TIMEOUTS);
    for _ in 0..crate::cmd::RESET_AFTER_TIMEOUTS {
        assert!(matches!(
            master.execute(nop(), Duration::from_millis(20)),
            Err(CmdError::Timeout)
        ));
    }
    assert_eq!(fw.resets(), 1);
    assert!(!master.fault().is_barred());
    assert_eq!(master.execute(nop(), TIMEOUT).unwrap(), Some(0));
}

#[test]
fn failed_reset_bars_the_device() {
    let device = EmulatedDevice::new(8);
    let fw = device.firmware();
    let master = CommandInterface::new(device, CmdMode::Poll, 0).unwrap();

    fw.fail_reset();
    fw.drop_commands(crate::cmd::RESET_AFTER_TIMEOUTS);
    for _ in 0..crate::cmd::RESET_AFTER_TIMEOUTS {
        assert!(matches!(
            master.execute(nop(), Duration::from_millis(20)),
            Err(CmdError::Timeout)
        ));
    }
    assert!(master.fault().is_barred());

    // A barred device is never touched again.
    let frozen = fw.register_accesses();
    assert!(matches!(master.execute(nop(), TIMEOUT), Err(CmdError::Barred)));
    assert!(matches!(master.mailbox(), Err(CmdError::Barred)));
    assert_eq!(fw.register_accesses(), frozen);
}

#[test]
fn unloading_timeouts_bar_without_reset() {
    let device = EmulatedDevice::new(8);
    let fw = device.firmware();
    let master = CommandInterface::new(device, CmdMode::Poll, 0).unwrap();

    master.shutdown();
    fw.drop_commands(crate::cmd::RESET_AFTER_TIMEOUTS);
    for _ in 0..crate::cmd::RESET_AFTER_TIMEOUTS {
        let _ = master.execute(nop(), Duration::from_millis(20));
    }
    assert!(master.fault().is_barred());
    assert_eq!(fw.resets(), 0);
}

fn raw_doorbell(regs: &EmulatedRegisters, function: u16, cmd: CommCmd, param: u16, toggle: u8) {
    use crate::device::DeviceRegisterIo;
    let map_offset = 0x100 + function as usize * COMM_CHANNEL_STRIDE;
    regs.write_u32(
        map_offset,
        CommDoorbell::new()
            .with_param(param)
            .with_opcode(cmd.0)
            .with_toggle(toggle)
            .into(),
    );
}

fn raw_ack(regs: &EmulatedRegisters, function: u16) -> u8 {
    use crate::device::DeviceRegisterIo;
    let offset = 0x100 + function as usize * COMM_CHANNEL_STRIDE + COMM_CHANNEL_READ;
    CommAck::from(regs.read_u32(offset)).toggle()
}

#[test]
fn handshake_assembles_vhcr_address() {
    let device = EmulatedDevice::new(8);
    let regs = EmulatedRegisters::new(device.firmware());
    let mem = device.memory();
    let master = CommandInterface::new(device, CmdMode::Poll, 0).unwrap();
    let comm = CommChannel::new(&master, Arc::new(mem), 64).unwrap();

    let posts = [
        (CommCmd::RESET, 0, 0),
        (CommCmd::VHCR0, 0x1234, 1),
        (CommCmd::VHCR1, 0x5678, 2),
        (CommCmd::VHCR2, 0x9a00, 1),
        (CommCmd::VHCR_EN, 0x00bc, 2),
    ];
    for (cmd, param, toggle) in posts {
        raw_doorbell(&regs, 2, cmd, param, toggle);
        comm.scan_all();
        comm.sync();
        assert_eq!(raw_ack(&regs, 2), toggle, "{cmd:?} not acknowledged");
    }
    assert!(comm.slave_active(2));
    assert_eq!(comm.slave_vhcr_address(2), 0x1234_5678_9a00_00bc);
}

#[test]
fn protocol_violation_resets_the_slave() {
    let device = EmulatedDevice::new(8);
    let regs = EmulatedRegisters::new(device.firmware());
    let mem = device.memory();
    let master = CommandInterface::new(device, CmdMode::Poll, 0).unwrap();
    let comm = CommChannel::new(&master, Arc::new(mem), 64).unwrap();

    raw_doorbell(&regs, 3, CommCmd::VHCR0, 0x1234, 1);
    comm.scan_all();
    comm.sync();
    assert_eq!(raw_ack(&regs, 3), 1);

    // VHCR2 out of order: the slave must be thrown back to reset, with
    // the partial address discarded and toggle zero acknowledged.
    raw_doorbell(&regs, 3, CommCmd::VHCR2, 0x9a00, 2);
    comm.scan_all();
    comm.sync();
    assert_eq!(raw_ack(&regs, 3), 0);
    assert!(!comm.slave_active(3));
    assert_eq!(comm.slave_vhcr_address(3), 0);
}

#[test]
fn out_of_sequence_toggle_resets_the_slave() {
    let device = EmulatedDevice::new(8);
    let regs = EmulatedRegisters::new(device.firmware());
    let mem = device.memory();
    let master = CommandInterface::new(device, CmdMode::Poll, 0).unwrap();
    let comm = CommChannel::new(&master, Arc::new(mem), 64).unwrap();

    raw_doorbell(&regs, 3, CommCmd::VHCR0, 0x1234, 1);
    comm.scan_all();
    comm.sync();
    // Toggle 3 instead of the expected 2.
    raw_doorbell(&regs, 3, CommCmd::VHCR1, 0x5678, 3);
    comm.scan_all();
    comm.sync();
    assert_eq!(raw_ack(&regs, 3), 0);
    assert_eq!(comm.slave_vhcr_address(3), 0);
}

/// Full master/slave stack over the emulated device: master in event
/// mode with the event-queue processor forwarding channel doorbells to
/// the channel worker.
struct Stack {
    master: CommandInterface,
    comm: CommChannel,
    _eqp: EqProcessor,
    device: EmulatedDevice,
}

fn stack(sink: Arc<dyn EventSink>) -> Stack {
    let device = EmulatedDevice::new(8);
    let mut master = CommandInterface::new(device.clone(), CmdMode::Event, 1).unwrap();
    let eq = master.create_eq(0, 32).unwrap();
    let intr = master.take_interrupt(0);
    let comm = CommChannel::new(&master, Arc::new(device.memory()), 64).unwrap();
    let eqp = EqProcessor::new(&master, vec![eq], vec![intr], Some(&comm), sink).unwrap();
    Stack {
        master,
        comm,
        _eqp: eqp,
        device,
    }
}

#[test]
fn slave_commands_run_through_the_channel() {
    let s = stack(Arc::new(NullSink));
    let slave = CommandInterface::new_slave(s.device.clone(), 1).unwrap();
    slave.establish(TIMEOUT).unwrap();
    assert!(s.comm.slave_active(1));

    // Master and slave command paths coexist.
    assert_eq!(s.master.execute(nop(), TIMEOUT).unwrap(), Some(0));
    assert_eq!(slave.execute(nop(), TIMEOUT).unwrap(), Some(0));
    // QUERY_FUNC is rewritten to describe the caller, whatever the
    // modifier says; function 1 sits on port 2.
    assert_eq!(slave.execute(query_func(5), TIMEOUT).unwrap(), Some(2));
}

#[test]
fn slave_port_access_is_policed() {
    let s = stack(Arc::new(NullSink));
    let slave = CommandInterface::new_slave(s.device.clone(), 1).unwrap();
    slave.establish(TIMEOUT).unwrap();

    let query_port = |port: u32| CmdRequest {
        in_param: 0,
        out_param: None,
        in_modifier: port,
        op_modifier: 0,
        opcode: CmdOpcode::QUERY_PORT,
    };
    // Function 1 owns port 2.
    assert_eq!(slave.execute(query_port(2), TIMEOUT).unwrap(), Some(0x1_0002));
    assert!(matches!(
        slave.execute(query_port(1), TIMEOUT),
        Err(CmdError::PermissionDenied)
    ));
}

#[test]
fn slave_set_port_payload_is_staged_through_master_mailboxes() {
    let s = stack(Arc::new(NullSink));
    let slave = CommandInterface::new_slave(s.device.clone(), 1).unwrap();
    slave.establish(TIMEOUT).unwrap();

    let inbox = slave.mailbox().unwrap();
    inbox.write_at(0, &[0xab; 64]);
    slave
        .execute(
            CmdRequest {
                in_param: inbox.dma_address(),
                out_param: None,
                in_modifier: 2,
                op_modifier: 0,
                opcode: CmdOpcode::SET_PORT,
            },
            TIMEOUT,
        )
        .unwrap();

    let fw = s.device.firmware();
    let set_ports = fw.set_ports();
    assert_eq!(set_ports.len(), 1);
    let (port, staged_addr) = set_ports[0];
    assert_eq!(port, 2);
    // The hardware saw a master mailbox, not the slave's buffer.
    assert_ne!(staged_addr, inbox.dma_address());
}

#[test]
fn slave_resources_are_tracked_and_reclaimed() {
    let s = stack(Arc::new(NullSink));
    let slave = CommandInterface::new_slave(s.device.clone(), 1).unwrap();
    slave.establish(TIMEOUT).unwrap();

    let alloc = CmdRequest {
        in_param: 0,
        out_param: None,
        in_modifier: 0,
        op_modifier: 0,
        opcode: CmdOpcode::ALLOC_RES,
    };
    let a = slave.execute(alloc, TIMEOUT).unwrap().unwrap();
    let b = slave.execute(alloc, TIMEOUT).unwrap().unwrap();
    assert_ne!(a, b);

    let free = |index: u64| CmdRequest {
        in_param: 0,
        out_param: None,
        in_modifier: index as u32,
        op_modifier: 0,
        opcode: CmdOpcode::FREE_RES,
    };
    slave.execute(free(a), TIMEOUT).unwrap();
    // Double free is caught by the master's tracking.
    assert!(matches!(
        slave.execute(free(a), TIMEOUT),
        Err(CmdError::Firmware(FwStatus::BAD_INDEX))
    ));

    // Re-registering the channel resets the slave and reclaims `b`.
    // With everything back in the pool, allocation restarts from the
    // lowest index.
    slave.establish(TIMEOUT).unwrap();
    assert_eq!(slave.execute(alloc, TIMEOUT).unwrap(), Some(a));
}

#[test]
fn unsupported_slave_opcode_is_rejected_without_hardware() {
    let s = stack(Arc::new(NullSink));
    let slave = CommandInterface::new_slave(s.device.clone(), 1).unwrap();
    slave.establish(TIMEOUT).unwrap();

    // GEN_EQE has no policy entry; the master refuses it outright.
    assert!(matches!(
        slave.execute(
            CmdRequest {
                in_param: 0,
                out_param: None,
                in_modifier: 1,
                op_modifier: 0,
                opcode: CmdOpcode::GEN_EQE,
            },
            TIMEOUT,
        ),
        Err(CmdError::Firmware(FwStatus::BAD_OP))
    ));
    // The only generated events are the master's own command-done
    // notifications; the slave's payload never reached the device.
    let fw = s.device.firmware();
    assert!(fw.gen_eqes().iter().all(|(_, eqe)| eqe.ty == EQE_TYPE_CMD));
}

#[test]
fn failed_slave_command_completion_event_is_not_success() {
    let s = stack(Arc::new(NullSink));
    let slave = CommandInterface::new_slave(s.device.clone(), 1).unwrap();
    slave.establish(TIMEOUT).unwrap();

    // Function 1 owns port 2; asking about port 1 is rejected.
    assert!(matches!(
        slave.execute(
            CmdRequest {
                in_param: 0,
                out_param: None,
                in_modifier: 1,
                op_modifier: 0,
                opcode: CmdOpcode::QUERY_PORT,
            },
            TIMEOUT,
        ),
        Err(CmdError::PermissionDenied)
    ));

    // The synthetic completion event for the rejected command carries a
    // failure status, not zero.
    let fw = s.device.firmware();
    let statuses: Vec<FwStatus> = fw
        .gen_eqes()
        .iter()
        .filter(|(function, eqe)| *function == 1 && eqe.ty == EQE_TYPE_CMD)
        .map(|(_, eqe)| EqeCmdCompletion::read_from_prefix(&eqe.data).unwrap().0.status)
        .collect();
    assert_eq!(statuses, [FwStatus::INTERNAL_ERR]);
}

#[test]
fn vep_update_reaches_only_the_named_function() {
    let s = stack(Arc::new(NullSink));
    let slave1 = CommandInterface::new_slave(s.device.clone(), 1).unwrap();
    slave1.establish(TIMEOUT).unwrap();
    let slave2 = CommandInterface::new_slave(s.device.clone(), 2).unwrap();
    slave2.establish(TIMEOUT).unwrap();

    let fw = s.device.firmware();
    let mut data = [0; 24];
    let payload = EqeVepUpdate {
        vep_config: 0x55,
        function: 2,
        reserved: 0,
    };
    data[..size_of::<EqeVepUpdate>()].copy_from_slice(payload.as_bytes());
    fw.post_event(0, EQE_TYPE_VEP_UPDATE, 0, data);

    wait_for(|| {
        fw.gen_eqes()
            .iter()
            .any(|(function, eqe)| *function == 2 && eqe.ty == EQE_TYPE_VEP_UPDATE)
    });
    // Deliveries are in order, so by now a stray copy for function 1
    // would already be visible.
    assert!(!fw
        .gen_eqes()
        .iter()
        .any(|(function, eqe)| *function == 1 && eqe.ty == EQE_TYPE_VEP_UPDATE));
    drop(s);
}

#[derive(Default)]
struct Recorder {
    ports: Mutex<Vec<(u32, bool)>>,
}

impl EventSink for Recorder {
    fn port_change(&self, port: u32, active: bool) {
        self.ports.lock().push((port, active));
    }
}

#[test]
fn port_change_reaches_sink_and_active_slaves() {
    let sink = Arc::new(Recorder::default());
    let s = stack(sink.clone());
    let slave = CommandInterface::new_slave(s.device.clone(), 1).unwrap();
    slave.establish(TIMEOUT).unwrap();

    let fw = s.device.firmware();
    let mut data = [0; 24];
    let payload = EqePortChange {
        reserved: 0,
        port: 2,
    };
    data[..size_of::<EqePortChange>()].copy_from_slice(payload.as_bytes());
    fw.post_event(0, EQE_TYPE_PORT_CHANGE, PORT_CHANGE_SUBTYPE_ACTIVE, data);

    wait_for(|| sink.ports.lock().contains(&(2, true)));
    // The master forwards the event to its one active slave.
    wait_for(|| {
        fw.gen_eqes()
            .iter()
            .any(|(function, eqe)| *function == 1 && eqe.ty == EQE_TYPE_PORT_CHANGE)
    });
    drop(s);
}
