use crate::CoreError;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PipelineState {
    Init,
    LoadOrGenerateEnv,
    Expand,
    Reset,
    ReconcileDirs,
    RunHook,
    ValidateReferences,
    ProbeImages,
    Launch,
    PollHealth,
    PostLaunchHook,
    Done,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Init => "init",
            Self::LoadOrGenerateEnv => "load-or-generate-env",
            Self::Expand => "expand",
            Self::Reset => "reset",
            Self::ReconcileDirs => "reconcile-dirs",
            Self::RunHook => "run-hook",
            Self::ValidateReferences => "validate-references",
            Self::ProbeImages => "probe-images",
            Self::Launch => "launch",
            Self::PollHealth => "poll-health",
            Self::PostLaunchHook => "post-launch-hook",
            Self::Done => "done",
            Self::Failed => "failed",
        })
    }
}

pub fn validate_transition(from: PipelineState, to: PipelineState) -> Result<(), CoreError> {
    use PipelineState::{
        Done, Expand, Failed, Init, Launch, LoadOrGenerateEnv, PollHealth, PostLaunchHook,
        ProbeImages, ReconcileDirs, Reset, RunHook, ValidateReferences,
    };

    let valid = matches!(
        (from, to),
        (Init, LoadOrGenerateEnv)
            | (LoadOrGenerateEnv, Expand)
            | (Expand, Reset | ValidateReferences | Done)
            | (Reset, Init | ReconcileDirs)
            | (ReconcileDirs, RunHook)
            | (RunHook, ValidateReferences)
            | (ValidateReferences, ProbeImages | Launch | Done)
            | (ProbeImages, Launch | Done)
            | (Launch, PollHealth | PostLaunchHook)
            | (PollHealth, PostLaunchHook)
            | (PostLaunchHook, Done)
    ) || (to == Failed && !from.is_terminal());

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PipelineState::{
        Done, Expand, Failed, Init, Launch, LoadOrGenerateEnv, PollHealth, PostLaunchHook,
        ProbeImages, ReconcileDirs, Reset, RunHook, ValidateReferences,
    };

    #[test]
    fn full_up_path_is_valid() {
        let path = [
            Init,
            LoadOrGenerateEnv,
            Expand,
            Reset,
            ReconcileDirs,
            RunHook,
            ValidateReferences,
            ProbeImages,
            Launch,
            PollHealth,
            PostLaunchHook,
            Done,
        ];
        for pair in path.windows(2) {
            assert!(validate_transition(pair[0], pair[1]).is_ok(), "{pair:?}");
        }
    }

    #[test]
    fn reset_may_restart() {
        assert!(validate_transition(Reset, Init).is_ok());
    }

    #[test]
    fn any_live_state_may_fail() {
        assert!(validate_transition(ProbeImages, Failed).is_ok());
        assert!(validate_transition(Init, Failed).is_ok());
        assert!(validate_transition(Done, Failed).is_err());
        assert!(validate_transition(Failed, Failed).is_err());
    }

    #[test]
    fn invalid_transitions() {
        assert!(validate_transition(Init, Launch).is_err());
        assert!(validate_transition(Expand, Launch).is_err());
        assert!(validate_transition(Done, Init).is_err());
        assert!(validate_transition(RunHook, Reset).is_err());
        assert!(validate_transition(PollHealth, Launch).is_err());
    }
}
