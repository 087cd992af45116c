use crate::{DeployStage, GateDecision, PipelineError, RunState, StageDef, StageStatus};

/// Inputs that move a run through its state machine.
/// The imperative shell produces these from step results; the core stays pure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunEvent {
    Triggered,
    BuildSucceeded,
    ScanCompleted { passed: bool },
    PushedAndSigned,
    /// No stage matched the branch; the run ends after the push.
    NoStageSelected,
    ApprovalMissing(DeployStage),
    EnterStage(DeployStage),
    DeployFinished { ok: bool },
    StepFailed,
    Cancel,
}

pub fn transition(state: RunState, event: &RunEvent) -> Result<RunState, PipelineError> {
    use RunEvent as E;
    use RunState as S;

    if state.is_terminal() {
        return Err(invalid(state, event));
    }

    let next = match (state, event) {
        (_, E::Cancel) => S::Cancelled,
        (_, E::StepFailed) => S::Failed,
        (S::Pending, E::Triggered) => S::Building,
        (S::Building, E::BuildSucceeded) => S::Scanning,
        (S::Scanning, E::ScanCompleted { passed: true }) => S::Signing,
        (S::Scanning, E::ScanCompleted { passed: false }) => S::Failed,
        (S::Signing, E::PushedAndSigned) => S::Pushed,
        (S::Pushed, E::NoStageSelected) => S::Succeeded,
        (S::Pushed, E::ApprovalMissing(_)) => S::Pending,
        // Pending is re-entered when a run is resumed at an approval gate.
        (S::Pushed | S::Pending, E::EnterStage(stage)) => S::Deploying(*stage),
        (S::Pending, E::ApprovalMissing(_)) => S::Pending,
        (S::Deploying(_), E::DeployFinished { ok: true }) => S::Succeeded,
        (S::Deploying(_), E::DeployFinished { ok: false }) => S::Failed,
        _ => return Err(invalid(state, event)),
    };
    Ok(next)
}

fn invalid(state: RunState, event: &RunEvent) -> PipelineError {
    PipelineError::InvalidTransition {
        from: state.label(),
        event: format!("{event:?}"),
    }
}

/// Evaluate a deploy stage's gates in order: branch selection, prior stage, approval.
/// `prior` is the outcome of the latest deployment of the predecessor stage's release.
/// Signature re-verification happens afterwards, in the shell, under the namespace lock.
pub fn evaluate_gate(def: &StageDef, selected: bool, prior: Option<StageStatus>, approved: bool) -> GateDecision {
    if !selected {
        return GateDecision::Skip;
    }
    if let Some(dep) = def.depends_on {
        match prior {
            Some(status) if status.permits_successor() => {}
            Some(status) => {
                return GateDecision::Block {
                    reason: format!("prior stage {dep} last deployment is {status:?}"),
                }
            }
            None => {
                return GateDecision::Block {
                    reason: format!("prior stage {dep} has never been deployed"),
                }
            }
        }
    }
    if def.approval_required && !approved {
        return GateDecision::AwaitApproval;
    }
    GateDecision::Proceed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn walk(events: &[RunEvent]) -> Result<RunState, PipelineError> {
        events.iter().try_fold(RunState::Pending, transition)
    }

    #[test]
    fn happy_path_to_dev() {
        let state = walk(&[
            RunEvent::Triggered,
            RunEvent::BuildSucceeded,
            RunEvent::ScanCompleted { passed: true },
            RunEvent::PushedAndSigned,
            RunEvent::EnterStage(DeployStage::Dev),
            RunEvent::DeployFinished { ok: true },
        ])
        .unwrap();
        assert_eq!(state, RunState::Succeeded);
    }

    #[test]
    fn failed_scan_never_reaches_signing() {
        let state = walk(&[
            RunEvent::Triggered,
            RunEvent::BuildSucceeded,
            RunEvent::ScanCompleted { passed: false },
        ])
        .unwrap();
        assert_eq!(state, RunState::Failed);
        assert!(transition(state, &RunEvent::PushedAndSigned).is_err());
    }

    #[test]
    fn missing_approval_parks_run_in_pending() {
        let state = walk(&[
            RunEvent::Triggered,
            RunEvent::BuildSucceeded,
            RunEvent::ScanCompleted { passed: true },
            RunEvent::PushedAndSigned,
            RunEvent::ApprovalMissing(DeployStage::Prod),
        ])
        .unwrap();
        assert_eq!(state, RunState::Pending);
        let resumed = transition(state, &RunEvent::EnterStage(DeployStage::Prod)).unwrap();
        assert_eq!(resumed, RunState::Deploying(DeployStage::Prod));
    }

    #[test]
    fn cannot_skip_build() {
        assert!(transition(RunState::Pending, &RunEvent::BuildSucceeded).is_err());
        assert!(transition(RunState::Building, &RunEvent::PushedAndSigned).is_err());
    }

    #[test]
    fn terminal_states_reject_events() {
        assert!(transition(RunState::Succeeded, &RunEvent::Cancel).is_err());
        assert!(transition(RunState::Failed, &RunEvent::Triggered).is_err());
    }

    #[test]
    fn cancel_from_any_live_state() {
        for s in [RunState::Pending, RunState::Scanning, RunState::Deploying(DeployStage::Dev)] {
            assert_eq!(transition(s, &RunEvent::Cancel).unwrap(), RunState::Cancelled);
        }
    }

    #[test]
    fn gate_order() {
        let prod = StageDef::conventional(DeployStage::Prod, "app");
        assert_eq!(evaluate_gate(&prod, false, None, false), GateDecision::Skip);
        assert!(matches!(
            evaluate_gate(&prod, true, Some(StageStatus::Failed), true),
            GateDecision::Block { .. }
        ));
        assert!(matches!(evaluate_gate(&prod, true, None, true), GateDecision::Block { .. }));
        assert!(matches!(
            evaluate_gate(&prod, true, Some(StageStatus::Skipped), true),
            GateDecision::Block { .. }
        ));
        assert_eq!(
            evaluate_gate(&prod, true, Some(StageStatus::Succeeded), false),
            GateDecision::AwaitApproval
        );
        assert_eq!(
            evaluate_gate(&prod, true, Some(StageStatus::Succeeded), true),
            GateDecision::Proceed
        );

        let dev = StageDef::conventional(DeployStage::Dev, "app");
        assert_eq!(evaluate_gate(&dev, true, None, false), GateDecision::Proceed);
    }
}
