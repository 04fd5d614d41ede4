//! Integration tests for the protocol runner.
//!
//! All tests run on paused tokio time, so waits of several seconds complete
//! instantly while the virtual clock still advances by the full amount.

use ppc1_control::config::RunnerConfig;
use ppc1_control::experiment::{
    Instruction, Protocol, ProtocolRunner, RunProgress, RunSummary, RunnerEvent, RunnerState,
};
use ppc1_control::hardware::{Channel, Ppc1Device, SimulatedPpc1, Valve};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{sleep, Instant};

fn simulated_runner() -> (Arc<ProtocolRunner>, Arc<SimulatedPpc1>) {
    let simulator = Arc::new(SimulatedPpc1::default());
    let runner = ProtocolRunner::new(None, Arc::clone(&simulator), &RunnerConfig::default());
    (Arc::new(runner), simulator)
}

/// Runner driving `bench` as if it were the physical device.
fn bench_runner() -> (Arc<ProtocolRunner>, Arc<SimulatedPpc1>) {
    let bench = Arc::new(SimulatedPpc1::default());
    let config = RunnerConfig {
        simulation: false,
        ..RunnerConfig::default()
    };
    let runner = ProtocolRunner::new(
        Some(Arc::clone(&bench) as Arc<dyn Ppc1Device>),
        Arc::new(SimulatedPpc1::default()),
        &config,
    );
    assert!(!runner.is_simulation());
    (Arc::new(runner), bench)
}

fn eight_second_protocol() -> Protocol {
    Protocol::from_instructions(
        "eight seconds",
        [
            Instruction::SetChannel {
                channel: Channel::D,
                value: 100.0,
            },
            Instruction::Wait { seconds: 5.0 },
            Instruction::SetValve {
                valve: Valve::L,
                open: true,
            },
            Instruction::Wait { seconds: 3.0 },
            Instruction::SetValve {
                valve: Valve::L,
                open: false,
            },
        ],
    )
}

async fn collect_until_finished(
    events: &mut broadcast::Receiver<RunnerEvent>,
) -> (Vec<RunnerEvent>, RunSummary) {
    let mut seen = Vec::new();
    loop {
        match events.recv().await.unwrap() {
            RunnerEvent::Finished(summary) => return (seen, summary),
            event => seen.push(event),
        }
    }
}

/// Most recent progress report already published, draining the receiver.
fn latest_progress(events: &mut broadcast::Receiver<RunnerEvent>) -> Option<RunProgress> {
    let mut latest = None;
    while let Ok(event) = events.try_recv() {
        if let RunnerEvent::Progress(progress) = event {
            latest = Some(progress);
        }
    }
    latest
}

async fn wait_for_state(runner: &ProtocolRunner, state: RunnerState) {
    let mut states = runner.subscribe_state();
    states.wait_for(|s| *s == state).await.unwrap();
}

// =============================================================================
// Completion and progress
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_eight_second_protocol_completes() {
    let (runner, simulator) = simulated_runner();
    let mut events = runner.subscribe();

    let started = Instant::now();
    runner.start(eight_second_protocol()).unwrap();
    let (events, summary) = collect_until_finished(&mut events).await;
    let elapsed = started.elapsed();

    assert_eq!(summary.state, RunnerState::Completed);
    assert!(summary.simulation);
    assert_eq!(summary.steps_executed, 5);
    assert!(elapsed >= Duration::from_secs(8), "took {elapsed:?}");
    assert!(elapsed < Duration::from_millis(8500), "took {elapsed:?}");

    let percents: Vec<f64> = events
        .iter()
        .filter_map(|e| match e {
            RunnerEvent::Progress(p) => Some(p.percent),
            _ => None,
        })
        .collect();
    assert_eq!(percents.first().copied(), Some(0.0));
    assert_eq!(percents.last().copied(), Some(100.0));
    assert!(
        percents.windows(2).all(|w| w[0] <= w[1]),
        "progress went backwards: {percents:?}"
    );

    assert_eq!(
        simulator.journal().await,
        vec!["D100.000000", "l0", "l1"]
    );
    assert!(!simulator.valves().await.is_open(Valve::L));
    assert_eq!(runner.state(), RunnerState::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_at_four_seconds_applies_safety_action() {
    let (runner, simulator) = simulated_runner();
    runner.start(eight_second_protocol()).unwrap();

    sleep(Duration::from_secs(4)).await;
    assert_eq!(simulator.setpoints().await.get(Channel::D), 100.0);
    runner.cancel().unwrap();

    let summary = runner.join().await.unwrap();
    assert_eq!(summary.state, RunnerState::Cancelled);
    assert_eq!(runner.state(), RunnerState::Cancelled);
    assert!(!simulator.valves().await.is_open(Valve::L));
    assert_eq!(simulator.setpoints().await.get(Channel::D), 0.0);

    let journal = simulator.journal().await;
    assert_eq!(journal.last().map(String::as_str), Some("vF"));
    assert!(!journal.contains(&"l0".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_loop_repeats_the_block() {
    let (runner, simulator) = simulated_runner();
    let protocol = Protocol::from_instructions(
        "loop",
        [
            Instruction::SetChannel {
                channel: Channel::A,
                value: -100.0,
            },
            Instruction::Wait { seconds: 1.0 },
            Instruction::Loop { start: 0, count: 3 },
            Instruction::StatusMessage {
                text: "after loop".into(),
            },
        ],
    );
    let started = Instant::now();
    runner.start(protocol).unwrap();
    let summary = runner.join().await.unwrap();

    assert_eq!(summary.state, RunnerState::Completed);
    let writes = simulator
        .journal()
        .await
        .iter()
        .filter(|line| *line == "A-100.000000")
        .count();
    assert_eq!(writes, 4);
    assert_eq!(summary.steps_executed, 13);
    assert!(started.elapsed() >= Duration::from_secs(4));
}

#[tokio::test(start_paused = true)]
async fn test_serde_protocol_runs_each_step_once() {
    let (runner, simulator) = simulated_runner();
    let protocol: Protocol = serde_json::from_str(
        r#"{"name": "direct", "commands": [
            {"type": "set_channel", "channel": "D", "value": 100},
            {"type": "wait", "seconds": 1},
            {"type": "pumps_off"}
        ]}"#,
    )
    .unwrap();

    runner.start(protocol).unwrap();
    let summary = tokio::time::timeout(Duration::from_secs(60), runner.join())
        .await
        .expect("run did not finish")
        .unwrap();

    assert_eq!(summary.state, RunnerState::Completed);
    assert_eq!(summary.steps_executed, 3);
    let journal = simulator.journal().await;
    assert_eq!(
        journal.iter().filter(|c| *c == "D100.000000").count(),
        1,
        "{journal:?}"
    );
    assert_eq!(journal.last().map(String::as_str), Some("vF"));
}

#[tokio::test(start_paused = true)]
async fn test_rejected_step_is_skipped() {
    let (runner, simulator) = simulated_runner();
    let mut events = runner.subscribe();
    let protocol = Protocol::from_instructions(
        "rejected",
        [
            Instruction::SetChannel {
                channel: Channel::D,
                value: 999.0,
            },
            Instruction::SetChannel {
                channel: Channel::D,
                value: 10.0,
            },
        ],
    );
    runner.start(protocol).unwrap();
    let (events, summary) = collect_until_finished(&mut events).await;

    assert_eq!(summary.state, RunnerState::Completed);
    assert_eq!(summary.steps_rejected, 1);
    assert!(events
        .iter()
        .any(|e| matches!(e, RunnerEvent::CommandRejected { index: 0, .. })));
    assert_eq!(simulator.setpoints().await.get(Channel::D), 10.0);
}

// =============================================================================
// Pause, ask and cancel
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_pause_resumes_with_remaining_wait() {
    let (runner, _) = simulated_runner();
    let mut events = runner.subscribe();
    let protocol = Protocol::from_instructions("pause", [Instruction::Wait { seconds: 10.0 }]);

    let started = Instant::now();
    runner.start(protocol).unwrap();
    sleep(Duration::from_secs(2)).await;
    runner.pause().unwrap();
    assert!(runner.pause().is_err());
    wait_for_state(&runner, RunnerState::Paused).await;
    let at_pause = latest_progress(&mut events).expect("progress before pause");

    sleep(Duration::from_secs(5)).await;
    assert_eq!(runner.state(), RunnerState::Paused);
    assert!(latest_progress(&mut events).is_none());
    runner.resume().unwrap();
    assert!(runner.resume().is_err());

    let after_resume = loop {
        if let RunnerEvent::Progress(p) = events.recv().await.unwrap() {
            break p;
        }
    };
    assert!(after_resume.percent >= at_pause.percent);
    assert!(after_resume.elapsed > at_pause.elapsed);
    assert_eq!(
        after_resume.elapsed + after_resume.remaining_step,
        Duration::from_secs(10)
    );

    let summary = runner.join().await.unwrap();
    assert_eq!(summary.state, RunnerState::Completed);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(14_900), "took {elapsed:?}");
    assert!(elapsed < Duration::from_millis(15_200), "took {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn test_pause_during_ask_parks_before_next_step() {
    let (runner, simulator) = simulated_runner();
    let protocol = Protocol::from_instructions(
        "two asks",
        [
            Instruction::AskMessage {
                text: "first".into(),
            },
            Instruction::AskMessage {
                text: "second".into(),
            },
            Instruction::SetChannel {
                channel: Channel::D,
                value: 50.0,
            },
        ],
    );
    runner.start(protocol).unwrap();
    wait_for_state(&runner, RunnerState::AwaitingAck).await;

    runner.acknowledge().unwrap();
    assert!(runner.acknowledge().is_err());
    runner.pause().unwrap();
    wait_for_state(&runner, RunnerState::Paused).await;

    sleep(Duration::from_secs(5)).await;
    assert_eq!(runner.state(), RunnerState::Paused);
    assert!(runner.acknowledge().is_err());
    runner.resume().unwrap();
    wait_for_state(&runner, RunnerState::AwaitingAck).await;

    // A pause requested while an ask is pending can be withdrawn.
    runner.pause().unwrap();
    assert_eq!(runner.state(), RunnerState::AwaitingAck);
    runner.resume().unwrap();
    assert_eq!(simulator.setpoints().await.get(Channel::D), 0.0);

    runner.acknowledge().unwrap();
    let summary = runner.join().await.unwrap();
    assert_eq!(summary.state, RunnerState::Completed);
    assert_eq!(summary.steps_executed, 3);
    assert_eq!(simulator.setpoints().await.get(Channel::D), 50.0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_paused() {
    let (runner, simulator) = simulated_runner();
    runner.start(eight_second_protocol()).unwrap();
    sleep(Duration::from_secs(1)).await;
    runner.pause().unwrap();
    sleep(Duration::from_secs(1)).await;

    runner.cancel().unwrap();
    let summary = runner.join().await.unwrap();
    assert_eq!(summary.state, RunnerState::Cancelled);
    assert_eq!(simulator.setpoints().await.get(Channel::D), 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_ask_blocks_until_acknowledged() {
    let (runner, simulator) = simulated_runner();
    let mut events = runner.subscribe();
    let protocol = Protocol::from_instructions(
        "ask",
        [
            Instruction::AskMessage {
                text: "Pipette in position?".into(),
            },
            Instruction::SetChannel {
                channel: Channel::D,
                value: 50.0,
            },
        ],
    );
    runner.start(protocol).unwrap();

    loop {
        if let RunnerEvent::Ask { index, text } = events.recv().await.unwrap() {
            assert_eq!(index, 0);
            assert_eq!(text, "Pipette in position?");
            break;
        }
    }
    wait_for_state(&runner, RunnerState::AwaitingAck).await;

    // No timeout on ask steps.
    sleep(Duration::from_secs(600)).await;
    assert_eq!(runner.state(), RunnerState::AwaitingAck);
    assert_eq!(simulator.setpoints().await.get(Channel::D), 0.0);

    runner.acknowledge().unwrap();
    let summary = runner.join().await.unwrap();
    assert_eq!(summary.state, RunnerState::Completed);
    assert_eq!(simulator.setpoints().await.get(Channel::D), 50.0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_awaiting_ack() {
    let (runner, simulator) = simulated_runner();
    let protocol = Protocol::from_instructions(
        "ask",
        [
            Instruction::AskMessage { text: "go?".into() },
            Instruction::SetChannel {
                channel: Channel::D,
                value: 50.0,
            },
        ],
    );
    runner.start(protocol).unwrap();
    wait_for_state(&runner, RunnerState::AwaitingAck).await;

    runner.cancel().unwrap();
    let summary = runner.join().await.unwrap();
    assert_eq!(summary.state, RunnerState::Cancelled);
    assert!(!simulator.journal().await.contains(&"D50.000000".to_string()));
}

// =============================================================================
// Physical device paths
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_device_fault_aborts_run() {
    let (runner, bench) = bench_runner();
    let mut events = runner.subscribe();
    runner.start(eight_second_protocol()).unwrap();

    sleep(Duration::from_secs(2)).await;
    bench.inject_fault("serial link lost");

    let (events, summary) = collect_until_finished(&mut events).await;
    assert_eq!(summary.state, RunnerState::Faulted);
    assert!(!summary.simulation);
    assert!(summary.error.as_deref().unwrap_or("").contains("serial link lost"));
    assert!(events.iter().any(|e| matches!(e, RunnerEvent::Fault(_))));
    assert_eq!(bench.setpoints().await.get(Channel::D), 0.0);
    assert_eq!(runner.state(), RunnerState::Faulted);

    // Falls back to simulation; the operator re-selects the device explicitly.
    assert!(runner.is_simulation());
    bench.clear_fault();
    runner.set_simulation(false).unwrap();
    assert!(!runner.is_simulation());
}

#[tokio::test(start_paused = true)]
async fn test_wait_sync_follows_input_line() {
    let (runner, bench) = bench_runner();
    let protocol = Protocol::from_instructions(
        "sync",
        [
            Instruction::WaitSync,
            Instruction::SetChannel {
                channel: Channel::D,
                value: 40.0,
            },
        ],
    );
    runner.start(protocol).unwrap();

    sleep(Duration::from_secs(3)).await;
    assert_eq!(runner.state(), RunnerState::Running);
    assert_eq!(bench.setpoints().await.get(Channel::D), 0.0);

    bench.set_sync_input(true).await;
    let summary = runner.join().await.unwrap();
    assert_eq!(summary.state, RunnerState::Completed);
    assert_eq!(bench.setpoints().await.get(Channel::D), 40.0);
}

#[tokio::test(start_paused = true)]
async fn test_wait_sync_passes_in_simulation() {
    let (runner, simulator) = simulated_runner();
    let protocol = Protocol::from_instructions(
        "sync",
        [
            Instruction::WaitSync,
            Instruction::SetChannel {
                channel: Channel::D,
                value: 40.0,
            },
        ],
    );
    runner.start(protocol).unwrap();
    let summary = runner.join().await.unwrap();
    assert_eq!(summary.state, RunnerState::Completed);
    assert_eq!(simulator.setpoints().await.get(Channel::D), 40.0);
}

#[tokio::test(start_paused = true)]
async fn test_mode_switch_between_runs() {
    let (runner, bench) = bench_runner();
    runner.set_simulation(true).unwrap();
    runner.start(eight_second_protocol()).unwrap();
    assert!(runner.set_simulation(false).is_err());
    runner.join().await.unwrap();

    // The bench device saw nothing during the dry run.
    assert!(bench.journal().await.is_empty());
    runner.set_simulation(false).unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_demo_protocol_runs_in_simulation() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/demos/protocol.toml");
    let protocol = Protocol::load(path).unwrap();
    assert_eq!(protocol.name, "three pulses of solution 1");

    let (runner, simulator) = simulated_runner();
    runner.start(protocol).unwrap();
    wait_for_state(&runner, RunnerState::AwaitingAck).await;
    runner.acknowledge().unwrap();

    let summary = runner.join().await.unwrap();
    assert_eq!(summary.state, RunnerState::Completed);
    assert_eq!(summary.steps_rejected, 0);

    let journal = simulator.journal().await;
    assert_eq!(journal.iter().filter(|line| *line == "p50").count(), 3);
    assert_eq!(journal.last().map(String::as_str), Some("vF"));
}
