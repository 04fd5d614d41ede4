//! Translation of protocol instructions into device calls.

use super::protocol::Instruction;
use crate::error::{AppResult, Ppc1Error};
use crate::fluidics::flow::Solution;
use crate::hardware::device::Ppc1Device;
use std::time::Duration;

/// What the runner does after an instruction was applied.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Continue,
    Wait(Duration),
    AwaitAck(String),
    Status(String),
    Loop { start: usize, count: u32 },
    WaitSync,
}

/// Apply `instruction` to `device`.
///
/// Device errors are returned as is; the runner decides whether they are
/// fatal.
pub async fn interpret(device: &dyn Ppc1Device, instruction: &Instruction) -> AppResult<Step> {
    match instruction {
        Instruction::SetChannel { channel, value } => {
            device.set_channel(*channel, *value).await?;
        }
        Instruction::SetValve { valve, open } => device.set_valve(*valve, *open).await?,
        Instruction::SetValvesState { mask } => device.set_valves_state(*mask).await?,
        Instruction::Wait { seconds } => {
            let duration = Duration::try_from_secs_f64(*seconds)
                .map_err(|_| Ppc1Error::Validation(format!("invalid wait of {seconds} s")))?;
            return Ok(Step::Wait(duration));
        }
        Instruction::AskMessage { text } => return Ok(Step::AwaitAck(text.clone())),
        Instruction::StatusMessage { text } => return Ok(Step::Status(text.clone())),
        Instruction::Pulse { ms } | Instruction::SyncOut { ms } => device.pulse(*ms).await?,
        Instruction::Loop { start, count } => {
            return Ok(Step::Loop {
                start: *start,
                count: *count,
            })
        }
        Instruction::WaitSync => return Ok(Step::WaitSync),
        Instruction::DropletSize { percent } => device.set_droplet_size(*percent).await?,
        Instruction::FlowSpeed { percent } => device.set_flow_speed(*percent).await?,
        Instruction::VacuumPercentage { percent } => {
            device.set_vacuum_percentage(*percent).await?;
        }
        Instruction::Solution { slot, open } => {
            let solution = Solution::from_slot(*slot).ok_or_else(|| {
                Ppc1Error::Validation(format!("no solution slot {slot}, expected 1-4"))
            })?;
            device.set_solution(solution, *open).await?;
        }
        Instruction::AllValvesClosed => device.close_all_valves().await?,
        Instruction::PumpsOff => device.pumping_off().await?,
        Instruction::TtlState { high } => device.set_ttl_state(*high).await?,
    }
    Ok(Step::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::simulated::SimulatedPpc1;
    use crate::hardware::telemetry::{Channel, Valve};

    #[tokio::test]
    async fn device_instructions_continue() {
        let device = SimulatedPpc1::default();
        let step = interpret(
            &device,
            &Instruction::SetChannel {
                channel: Channel::C,
                value: 21.0,
            },
        )
        .await
        .unwrap();
        assert_eq!(step, Step::Continue);

        interpret(&device, &Instruction::Solution { slot: 1, open: true })
            .await
            .unwrap();
        interpret(&device, &Instruction::SyncOut { ms: 50 }).await.unwrap();

        assert_eq!(device.journal().await, vec!["C21.000000", "l0", "p50"]);
        assert!(device.valves().await.is_open(Valve::L));
    }

    #[tokio::test]
    async fn control_instructions_map_to_steps() {
        let device = SimulatedPpc1::default();
        assert_eq!(
            interpret(&device, &Instruction::Wait { seconds: 1.5 }).await.unwrap(),
            Step::Wait(Duration::from_millis(1500))
        );
        assert_eq!(
            interpret(&device, &Instruction::Loop { start: 0, count: 3 })
                .await
                .unwrap(),
            Step::Loop { start: 0, count: 3 }
        );
        assert_eq!(
            interpret(&device, &Instruction::AskMessage { text: "ok?".into() })
                .await
                .unwrap(),
            Step::AwaitAck("ok?".into())
        );
        assert!(device.journal().await.is_empty());
    }

    #[tokio::test]
    async fn invalid_requests_are_validation_errors() {
        let device = SimulatedPpc1::default();
        for instruction in [
            Instruction::SetChannel {
                channel: Channel::A,
                value: 5.0,
            },
            Instruction::Solution { slot: 9, open: true },
            Instruction::Wait { seconds: -1.0 },
            Instruction::Pulse { ms: 5 },
        ] {
            let err = interpret(&device, &instruction).await.unwrap_err();
            assert!(err.is_validation(), "{instruction}: {err}");
        }
    }
}
