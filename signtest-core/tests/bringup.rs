use std::collections::VecDeque;
use std::fs;
use std::time::{Duration, SystemTime};

use signtest_core::bitstream::BitstreamLoader;
use signtest_core::config::BringupConfig;
use signtest_core::machine::{
    BringupMachine, ManualClock, OperatorCommand, OperatorConsole, RunExit, TestState, TickOutcome,
};
use signtest_core::protocol::{DeviceMode, ProtocolError};
use signtest_core::sim::SimulatedBoard;
use signtest_core::transport::{Request, TransportError};
use tempfile::TempDir;

type Machine = BringupMachine<SimulatedBoard, ManualClock>;

fn machine(board: &SimulatedBoard) -> (Machine, ManualClock) {
    let clock = ManualClock::new();
    let machine = BringupMachine::new(board.clone(), clock.clone(), BringupConfig::new());
    (machine, clock)
}

/// Ticks until `target` is entered, returning every transition on the way.
fn run_until(machine: &mut Machine, target: TestState, max_ticks: usize) -> Vec<(TestState, TestState)> {
    let mut transitions = Vec::new();
    for _ in 0..max_ticks {
        match machine.tick() {
            TickOutcome::Transitioned { from, to } => {
                transitions.push((from, to));
                if to == target {
                    return transitions;
                }
            }
            TickOutcome::Steady(_) => {}
            TickOutcome::Faulted(err) => panic!("unexpected fault: {err}"),
        }
    }
    panic!("never reached {target}; transitions: {transitions:?}");
}

fn bitstream_file(dir: &TempDir, payload: &[u8]) -> std::path::PathBuf {
    let path = dir.path().join("sign.bin");
    fs::write(&path, payload).expect("write bitstream");
    path
}

fn sample_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

#[test]
fn stable_sense_enters_soft_on_on_fifth_tick() {
    let board = SimulatedBoard::new();
    let (mut machine, _) = machine(&board);
    board.insert();

    for tick in 1..5 {
        assert_eq!(
            machine.tick(),
            TickOutcome::Steady(TestState::WaitForDevice),
            "tick {tick} must not advance"
        );
    }
    assert_eq!(
        machine.tick(),
        TickOutcome::Transitioned {
            from: TestState::WaitForDevice,
            to: TestState::SoftOn
        }
    );
    assert_eq!(board.mode(), DeviceMode::SoftOn);
}

#[test]
fn half_seated_board_never_powers_up() {
    let board = SimulatedBoard::new();
    let (mut machine, _) = machine(&board);
    board.set_sense(true, false);

    for _ in 0..50 {
        machine.tick();
    }
    assert_eq!(machine.state(), TestState::WaitForDevice);
    assert_eq!(board.mode(), DeviceMode::Off);
}

#[test]
fn status_only_cycle_skips_flash_and_runs_smoke_test() {
    let board = SimulatedBoard::new();
    let (mut machine, clock) = machine(&board);
    board.insert();

    let transitions = run_until(&mut machine, TestState::WaitDeviceLeave, 40);
    let entered: Vec<_> = transitions.iter().map(|&(_, to)| to).collect();
    assert_eq!(
        entered,
        vec![
            TestState::SoftOn,
            TestState::PowerOn,
            TestState::CheckFlash,
            TestState::BootFpga,
            TestState::TestFpga,
            TestState::WaitDeviceLeave,
        ]
    );

    assert_eq!(board.count(Request::FlashRead), 0);
    assert_eq!(board.count(Request::FlashReadId), 1);
    assert_eq!(board.fpga_frames().len(), 32);
    assert_eq!(board.leds(), (true, false));
    assert_eq!(clock.elapsed(), BringupConfig::new().boot_settle);

    board.remove();
    run_until(&mut machine, TestState::WaitForDevice, 5);
    assert_eq!(board.mode(), DeviceMode::Off);
}

#[test]
fn check_flash_without_bitstream_goes_straight_to_boot() {
    let board = SimulatedBoard::new();
    let (mut machine, _) = machine(&board);
    board.insert();
    run_until(&mut machine, TestState::CheckFlash, 20);

    assert_eq!(
        machine.tick(),
        TickOutcome::Transitioned {
            from: TestState::CheckFlash,
            to: TestState::BootFpga
        }
    );
}

#[test]
fn stable_device_loss_overrides_any_state() {
    let board = SimulatedBoard::new();
    let (mut machine, _) = machine(&board);
    board.insert();
    board.set_power_fault(true);
    run_until(&mut machine, TestState::PowerOn, 20);

    board.remove();
    for tick in 1..10 {
        assert_eq!(
            machine.tick(),
            TickOutcome::Steady(TestState::PowerOn),
            "gone sample {tick} is inside the doubled run"
        );
    }
    assert_eq!(
        machine.tick(),
        TickOutcome::Transitioned {
            from: TestState::PowerOn,
            to: TestState::WaitForDevice
        }
    );
    assert_eq!(board.mode(), DeviceMode::Off);
}

#[test]
fn blank_flash_is_programmed_then_verified_on_next_insertion() {
    let dir = TempDir::new().unwrap();
    let payload = sample_payload(5000);
    let path = bitstream_file(&dir, &payload);

    let board = SimulatedBoard::new();
    let (machine, _) = machine(&board);
    let mut machine = machine.with_bitstream(BitstreamLoader::new(&path));
    board.insert();

    let transitions = run_until(&mut machine, TestState::WaitDeviceLeave, 40);
    assert!(transitions.contains(&(TestState::CheckFlash, TestState::ProgramFpga)));
    assert!(transitions.contains(&(TestState::ProgramFpga, TestState::BootFpga)));
    assert_eq!(board.flash_slice(0, payload.len()), payload);
    assert_eq!(board.count(Request::FlashEraseSector), 2);
    assert_eq!(board.count(Request::FlashProgram), 20);

    // Operator retry with the same board still seated.
    board.set_button(true);
    assert_eq!(
        machine.tick(),
        TickOutcome::Transitioned {
            from: TestState::WaitDeviceLeave,
            to: TestState::WaitForDevice
        }
    );
    board.set_button(false);
    board.clear_log();

    let transitions = run_until(&mut machine, TestState::WaitDeviceLeave, 40);
    assert!(transitions.contains(&(TestState::CheckFlash, TestState::BootFpga)));
    assert_eq!(board.count(Request::FlashProgram), 0);
    assert_eq!(board.count(Request::FlashEraseSector), 0);
}

#[test]
fn rebuilt_bitstream_is_picked_up_and_reprogrammed() {
    let dir = TempDir::new().unwrap();
    let old = sample_payload(600);
    let path = bitstream_file(&dir, &old);

    let board = SimulatedBoard::new();
    board.load_flash(0, &old);
    let (machine, _) = machine(&board);
    let mut machine = machine.with_bitstream(BitstreamLoader::new(&path));
    board.insert();

    let transitions = run_until(&mut machine, TestState::BootFpga, 40);
    assert!(transitions.contains(&(TestState::CheckFlash, TestState::BootFpga)));
    run_until(&mut machine, TestState::WaitDeviceLeave, 5);

    let mut new = old.clone();
    new[0] ^= 0xFF;
    fs::write(&path, &new).unwrap();
    let later = SystemTime::now() + Duration::from_secs(10);
    fs::File::options()
        .write(true)
        .open(&path)
        .unwrap()
        .set_modified(later)
        .unwrap();

    board.set_button(true);
    machine.tick();
    board.set_button(false);

    let transitions = run_until(&mut machine, TestState::BootFpga, 40);
    assert!(transitions.contains(&(TestState::CheckFlash, TestState::ProgramFpga)));
    assert_eq!(board.flash_slice(0, new.len()), new);
}

#[test]
fn fault_during_programming_resets_with_empty_history() {
    let dir = TempDir::new().unwrap();
    let path = bitstream_file(&dir, &sample_payload(1024));

    let board = SimulatedBoard::new();
    let (machine, clock) = machine(&board);
    let mut machine = machine.with_bitstream(BitstreamLoader::new(&path));
    board.insert();
    run_until(&mut machine, TestState::ProgramFpga, 40);
    assert!(!machine.history().is_empty());

    board.fail_request(Request::FlashProgram);
    let before = clock.elapsed();
    let outcome = machine.tick();

    assert_eq!(
        outcome,
        TickOutcome::Faulted(ProtocolError::Transport(TransportError::Stalled))
    );
    assert_eq!(machine.state(), TestState::WaitForDevice);
    assert!(machine.history().is_empty());
    assert_eq!(board.mode(), DeviceMode::Off);
    assert_eq!(board.leds(), (false, true));
    assert_eq!(clock.elapsed() - before, BringupConfig::new().fault_pause);

    board.clear_faults();
    for _ in 1..5 {
        assert_eq!(machine.tick(), TickOutcome::Steady(TestState::WaitForDevice));
    }
    assert_eq!(
        machine.tick(),
        TickOutcome::Transitioned {
            from: TestState::WaitForDevice,
            to: TestState::SoftOn
        }
    );
}

#[test]
fn failed_boot_lights_fault_and_waits_for_removal() {
    let board = SimulatedBoard::new();
    let (mut machine, _) = machine(&board);
    board.insert();
    run_until(&mut machine, TestState::BootFpga, 40);

    board.reject_next(Request::SetMode);
    assert_eq!(
        machine.tick(),
        TickOutcome::Transitioned {
            from: TestState::BootFpga,
            to: TestState::WaitDeviceLeave
        }
    );
    assert_eq!(board.leds(), (false, true));
    assert!(board.fpga_frames().is_empty());
}

#[test]
fn disconnect_is_survivable() {
    let board = SimulatedBoard::new();
    let (mut machine, _) = machine(&board);
    board.insert();
    run_until(&mut machine, TestState::SoftOn, 10);

    board.disconnect();
    assert!(matches!(
        machine.tick(),
        TickOutcome::Faulted(ProtocolError::Transport(TransportError::Disconnected))
    ));
    assert_eq!(machine.state(), TestState::WaitForDevice);

    board.reconnect();
    assert_eq!(machine.tick(), TickOutcome::Steady(TestState::WaitForDevice));
}

struct ScriptedConsole {
    script: VecDeque<Option<OperatorCommand>>,
    statuses: Vec<String>,
}

impl ScriptedConsole {
    fn new(script: impl IntoIterator<Item = Option<OperatorCommand>>) -> Self {
        Self {
            script: script.into_iter().collect(),
            statuses: Vec::new(),
        }
    }
}

impl OperatorConsole for ScriptedConsole {
    fn poll_command(&mut self) -> Option<OperatorCommand> {
        self.script
            .pop_front()
            .unwrap_or(Some(OperatorCommand::Exit))
    }

    fn show_status(&mut self, line: &str) {
        self.statuses.push(line.to_string());
    }
}

#[test]
fn exit_key_powers_off_and_returns() {
    let board = SimulatedBoard::new();
    let (mut machine, clock) = machine(&board);
    board.insert();
    let mut console = ScriptedConsole::new([None, None, Some(OperatorCommand::Help)]);

    assert_eq!(machine.run(&mut console), Ok(RunExit::Exit));
    assert_eq!(console.statuses.len(), 4);
    assert_eq!(clock.elapsed(), Duration::from_millis(300));
    assert_eq!(board.mode(), DeviceMode::Off);
    assert!(machine.history().is_empty());
}

#[test]
fn reprogram_key_sends_board_to_bootloader() {
    let board = SimulatedBoard::new();
    let (mut machine, _) = machine(&board);
    let mut console = ScriptedConsole::new([Some(OperatorCommand::Reprogram)]);

    assert_eq!(machine.run(&mut console), Ok(RunExit::Reprogram));
    assert!(board.reprogram_requested());
}

#[test]
fn reprogram_failure_surfaces_from_run() {
    let board = SimulatedBoard::new();
    let (mut machine, _) = machine(&board);
    board.fail_request(Request::Reprogram);
    let mut console = ScriptedConsole::new([Some(OperatorCommand::Reprogram)]);

    assert_eq!(
        machine.run(&mut console),
        Err(ProtocolError::Transport(TransportError::Stalled))
    );
}

#[test]
fn space_restarts_a_finished_board() {
    let board = SimulatedBoard::new();
    let (mut machine, _) = machine(&board);
    board.insert();
    run_until(&mut machine, TestState::WaitDeviceLeave, 40);

    let mut console = ScriptedConsole::new([]);
    assert_eq!(
        machine.handle_command(OperatorCommand::Reset, &mut console),
        Ok(None)
    );
    assert_eq!(machine.state(), TestState::WaitForDevice);
    assert_eq!(board.mode(), DeviceMode::Off);
    assert!(machine.history().is_empty());
}

#[test]
fn power_cycle_loop_toggles_until_a_key_arrives() {
    let board = SimulatedBoard::new();
    board.insert();
    let clock = ManualClock::new();
    let config = BringupConfig::new().with_stress_half_period(2).unwrap();
    let mut machine = BringupMachine::new(board.clone(), clock.clone(), config);
    let mut console = ScriptedConsole::new([None, None, None, Some(OperatorCommand::Other('q'))]);

    machine.power_cycle(&mut console);

    let modes: Vec<_> = board
        .requests()
        .iter()
        .filter(|record| record.request == Request::SetMode)
        .map(|record| DeviceMode::from_value(record.value))
        .collect();
    assert_eq!(
        modes,
        vec![
            Some(DeviceMode::On),
            Some(DeviceMode::FpgaActive),
            Some(DeviceMode::Off),
            Some(DeviceMode::Off),
        ]
    );
    assert_eq!(console.statuses.len(), 4);
    assert!(console.statuses[0].ends_with("Power On"));
    assert!(console.statuses[3].ends_with("Power Off"));
    assert_eq!(clock.elapsed(), Duration::from_millis(300));
    assert_eq!(machine.state(), TestState::WaitForDevice);
}

#[test]
fn restart_fpga_failure_is_logged_not_fatal() {
    let board = SimulatedBoard::new();
    let (mut machine, _) = machine(&board);
    let mut console = ScriptedConsole::new([Some(OperatorCommand::RestartFpga), None]);

    assert_eq!(machine.run(&mut console), Ok(RunExit::Exit));
    assert_eq!(board.count(Request::SetMode), 2);
}
