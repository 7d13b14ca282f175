use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// What this process does in a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Role {
    /// Export on this machine only.
    Local,
    /// Partition work over discovered nodes and collect their results.
    Master,
    /// Process batches pushed by a master.
    Worker,
    /// Time a full catalogue export to obtain a performance index.
    Benchmark,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Dispatching,
    AwaitingResults,
    Finishing,
    Listening,
    Processing,
    Transferring,
}

/// Phase machine of one coordinator.
///
/// Local, master and benchmark runs go `Idle -> Dispatching -> AwaitingResults
/// -> Finishing -> Idle`, skipping `AwaitingResults` when there is nothing to
/// wait for. Workers go `Idle -> Listening -> Processing -> Transferring` and
/// back to `Listening` after every batch.
#[derive(Debug, Clone)]
pub struct CoordinatorState {
    role: Role,
    phase: Phase,
}

impl CoordinatorState {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            phase: Phase::Idle,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn can_advance(&self, to: Phase) -> bool {
        use Phase::*;

        match self.role {
            Role::Worker => matches!(
                (self.phase, to),
                (Idle, Listening)
                    | (Listening, Processing)
                    | (Processing, Transferring)
                    | (Transferring, Listening)
                    | (Transferring, Idle)
                    | (Listening, Idle)
            ),
            Role::Local | Role::Master | Role::Benchmark => matches!(
                (self.phase, to),
                (Idle, Dispatching)
                    | (Dispatching, AwaitingResults)
                    | (Dispatching, Finishing)
                    | (AwaitingResults, Finishing)
                    | (Finishing, Idle)
            ),
        }
    }

    pub fn advance(&mut self, to: Phase) -> anyhow::Result<()> {
        if !self.can_advance(to) {
            anyhow::bail!("{:?} coordinator cannot move from {:?} to {:?}", self.role, self.phase, to);
        }
        tracing::debug!("{:?} -> {:?}", self.phase, to);
        self.phase = to;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    /// Nothing selected, or nothing changed since the last export.
    NoChanges,
    /// The run could not start: no nodes, or every transfer leg failed.
    Reset,
    Cancelled,
}

/// Summary printed at the end of a run.
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub label: String,
    pub outcome: Outcome,
    pub elapsed: Duration,
    pub processed: usize,
    /// Source files that failed, locally or on a node whose leg was lost.
    pub errors: Vec<PathBuf>,
}

impl BatchReport {
    pub fn new(label: impl Into<String>, outcome: Outcome) -> Self {
        Self {
            label: label.into(),
            outcome,
            elapsed: Duration::ZERO,
            processed: 0,
            errors: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty() && !matches!(self.outcome, Outcome::Reset | Outcome::Cancelled)
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.outcome {
            Outcome::NoChanges | Outcome::Reset => return write!(f, "No Changes!"),
            Outcome::Cancelled => {
                return write!(f, "Job cancelled after {:.2} seconds", self.elapsed.as_secs_f64());
            }
            Outcome::Completed => {}
        }

        write!(f, "Job completed in {:.2} seconds", self.elapsed.as_secs_f64())?;
        if !self.errors.is_empty() {
            write!(f, "\nErrors in:")?;
            for file in &self.errors {
                write!(f, "\n{}", file.display())?;
            }
        }
        Ok(())
    }
}
