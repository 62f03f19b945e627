use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a queued inference request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Allowed edges: queued -> processing -> {completed, failed}.
    ///
    /// There is deliberately no edge back from processing to queued; a job
    /// interrupted mid-processing is swept to failed at startup instead.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A scheduled inference request and its lifecycle.
///
/// Owned by the request store once enqueued; only the scheduler's worker
/// mutates the status, and `response` is written exactly once together with
/// the terminal transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub conversation_id: Option<String>,
    pub prompt: String,
    pub submitted_at: DateTime<Utc>,
    /// Predicted average draw while the job runs, in watts.
    pub estimated_power: f64,
    /// Earliest instant at which harvested power is expected to suffice.
    pub estimated_completion: DateTime<Utc>,
    pub status: JobStatus,
    pub response: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(JobStatus::Queued, JobStatus::Processing, true)]
    #[case(JobStatus::Processing, JobStatus::Completed, true)]
    #[case(JobStatus::Processing, JobStatus::Failed, true)]
    #[case(JobStatus::Queued, JobStatus::Completed, false)]
    #[case(JobStatus::Queued, JobStatus::Failed, false)]
    #[case(JobStatus::Processing, JobStatus::Queued, false)]
    #[case(JobStatus::Completed, JobStatus::Queued, false)]
    #[case(JobStatus::Completed, JobStatus::Failed, false)]
    #[case(JobStatus::Failed, JobStatus::Processing, false)]
    fn transition_edges(
        #[case] from: JobStatus,
        #[case] to: JobStatus,
        #[case] allowed: bool,
    ) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn terminal_states() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            let parsed: JobStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("paused".parse::<JobStatus>().is_err());
    }
}
