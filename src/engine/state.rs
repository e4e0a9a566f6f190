//! Run lifecycle states.

use serde::{Deserialize, Serialize};

/// Where an engine is within one call to `run`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Nothing has happened yet in this invocation.
    #[default]
    NotStarted,
    /// Loading source rows and checking the store for prior data.
    Importing,
    /// The run has prior data; the import mode decides what to keep.
    AwaitingUserChoice,
    /// Querying the store for the next batch.
    Selecting,
    /// The processor is working on a batch.
    Processing,
    /// Outcomes of a batch are being written to the store.
    WritingBack,
    /// Nothing left to select, or the batch limit was reached.
    Done,
}

impl RunState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, to),
            (NotStarted, Importing)
                | (Importing, AwaitingUserChoice)
                | (Importing, Selecting)
                | (AwaitingUserChoice, Selecting)
                | (Selecting, Processing)
                | (Selecting, Done)         // empty selection or batch limit
                | (Processing, WritingBack)
                | (WritingBack, Selecting)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == RunState::Done
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::NotStarted => "not_started",
            RunState::Importing => "importing",
            RunState::AwaitingUserChoice => "awaiting_user_choice",
            RunState::Selecting => "selecting",
            RunState::Processing => "processing",
            RunState::WritingBack => "writing_back",
            RunState::Done => "done",
        };
        write!(f, "{s}")
    }
}
