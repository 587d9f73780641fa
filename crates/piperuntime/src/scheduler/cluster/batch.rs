use crate::scheduler::TaskState;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// The batch systems a cluster scheduler can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchSystem {
    Slurm,
    Sge,
    Lsf,
    Pbs,
}

/// A batch system's job state, normalised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    /// A state string the mapping does not know.
    Unrecognized(String),
}

impl BatchSystem {
    pub const ALL: [BatchSystem; 4] = [
        BatchSystem::Slurm,
        BatchSystem::Sge,
        BatchSystem::Lsf,
        BatchSystem::Pbs,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BatchSystem::Slurm => "slurm",
            BatchSystem::Sge => "sge",
            BatchSystem::Lsf => "lsf",
            BatchSystem::Pbs => "pbs",
        }
    }

    /// File name of the wrapper script inside the wrapper directory.
    pub fn wrapper_name(self) -> &'static str {
        match self {
            BatchSystem::Slurm => "slurm_wrapper",
            BatchSystem::Sge => "sge_wrapper",
            BatchSystem::Lsf => "lsf_wrapper",
            BatchSystem::Pbs => "pbs_wrapper",
        }
    }

    /// Map the state string printed by `<wrapper> status`. Total: anything
    /// unknown becomes `Unrecognized`.
    pub fn parse_state(self, raw: &str) -> JobState {
        let raw = raw.trim();
        let mut tokens = raw.split_whitespace();
        let first = tokens.next().unwrap_or_default();

        let state = match self {
            // "CANCELLED by 1234" and similar carry a suffix
            BatchSystem::Slurm => match first.trim_end_matches('+').to_ascii_uppercase().as_str() {
                "PENDING" | "CONFIGURING" | "REQUEUED" | "REQUEUE_HOLD" | "REQUEUE_FED"
                | "RESV_DEL_HOLD" | "SUSPENDED" => Some(JobState::Queued),
                "RUNNING" | "COMPLETING" | "STAGE_OUT" | "SIGNALING" | "RESIZING" => {
                    Some(JobState::Running)
                }
                "COMPLETED" => Some(JobState::Completed),
                "FAILED" | "CANCELLED" | "TIMEOUT" | "NODE_FAIL" | "OUT_OF_MEMORY"
                | "PREEMPTED" | "BOOT_FAIL" | "DEADLINE" | "REVOKED" | "SPECIAL_EXIT" => {
                    Some(JobState::Failed)
                }
                _ => None,
            },
            BatchSystem::Sge => match first {
                "qw" | "hqw" | "hRwq" | "s" | "S" | "T" | "ts" => Some(JobState::Queued),
                "r" | "t" | "Rr" | "Rt" => Some(JobState::Running),
                "done" | "DONE" => Some(JobState::Completed),
                "Eqw" | "Ehqw" | "EhRqw" | "dr" | "dt" | "dRr" | "failed" | "FAILED" => {
                    Some(JobState::Failed)
                }
                _ => None,
            },
            BatchSystem::Lsf => match first.to_ascii_uppercase().as_str() {
                "PEND" | "PSUSP" | "WAIT" => Some(JobState::Queued),
                "RUN" | "USUSP" | "SSUSP" | "PROV" => Some(JobState::Running),
                "DONE" => Some(JobState::Completed),
                "EXIT" | "ZOMBI" => Some(JobState::Failed),
                _ => None,
            },
            // finished jobs report "F <exit status>" (or "C" on Torque)
            BatchSystem::Pbs => match first {
                "Q" | "H" | "W" | "T" | "S" | "M" => Some(JobState::Queued),
                "R" | "E" | "B" => Some(JobState::Running),
                "F" | "C" | "X" => match tokens.next().map(str::parse::<i64>) {
                    None | Some(Ok(0)) => Some(JobState::Completed),
                    Some(_) => Some(JobState::Failed),
                },
                _ => None,
            },
        };

        state.unwrap_or_else(|| JobState::Unrecognized(raw.to_string()))
    }
}

impl JobState {
    /// Task state for this job state.
    ///
    /// An unrecognized state counts as running while the job is within its
    /// expected lifetime (walltime plus `grace` since submission) and as
    /// failed afterwards. Jobs without a walltime never run out.
    pub fn task_state(&self, elapsed: Duration, walltime: Option<Duration>, grace: Duration) -> TaskState {
        match self {
            JobState::Queued => TaskState::Submitted,
            JobState::Running => TaskState::Running,
            JobState::Completed => TaskState::Succeeded,
            JobState::Failed => TaskState::Failed,
            JobState::Unrecognized(_) => match walltime {
                Some(walltime) if elapsed > walltime + grace => TaskState::Failed,
                _ => TaskState::Running,
            },
        }
    }
}

impl fmt::Display for BatchSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BatchSystem {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BatchSystem::ALL
            .into_iter()
            .find(|system| system.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown batch system '{}'", s))
    }
}
