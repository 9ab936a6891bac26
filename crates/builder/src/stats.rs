use extract::{ExtractionOutcome, ExtractionStatus};
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;

/// Build counters. The persisted copy accumulates across resumed runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildStats {
    /// Chunks sent to the extractor (skipped chunks excluded)
    pub chunks_attempted: u64,
    pub chunks_succeeded: u64,
    /// Chunks that exhausted their retries
    pub chunks_errored: u64,
    /// Chunks below the minimum length
    pub chunks_skipped: u64,
    /// Provider calls beyond the first for each chunk
    pub retries: u64,
    /// Chunks that failed at least once and then succeeded
    pub successful_retries: u64,
    pub entities_extracted: u64,
    pub relationships_extracted: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

impl BuildStats {
    pub fn record(&mut self, outcome: &ExtractionOutcome) {
        match &outcome.status {
            ExtractionStatus::Skipped => {
                self.chunks_skipped += 1;
                return;
            }
            ExtractionStatus::Extracted(result) => {
                self.chunks_succeeded += 1;
                self.entities_extracted += result.entities.len() as u64;
                self.relationships_extracted += result.relationships.len() as u64;
                if outcome.succeeded_after_retry() {
                    self.successful_retries += 1;
                }
            }
            ExtractionStatus::Failed(_) => self.chunks_errored += 1,
        }

        self.chunks_attempted += 1;
        self.retries += u64::from(outcome.attempts.saturating_sub(1));
        self.input_tokens += outcome.usage.input_tokens;
        self.output_tokens += outcome.usage.output_tokens;
        self.cost_usd += outcome.cost_usd;
    }

    /// Succeeded / attempted, in percent.
    pub fn success_rate(&self) -> f64 {
        if self.chunks_attempted == 0 {
            return 0.0;
        }
        self.chunks_succeeded as f64 / self.chunks_attempted as f64 * 100.0
    }

    pub fn average_cost_per_chunk(&self) -> Option<f64> {
        (self.chunks_attempted > 0 && self.cost_usd > 0.0)
            .then(|| self.cost_usd / self.chunks_attempted as f64)
    }
}

impl AddAssign<&BuildStats> for BuildStats {
    fn add_assign(&mut self, other: &BuildStats) {
        self.chunks_attempted += other.chunks_attempted;
        self.chunks_succeeded += other.chunks_succeeded;
        self.chunks_errored += other.chunks_errored;
        self.chunks_skipped += other.chunks_skipped;
        self.retries += other.retries;
        self.successful_retries += other.successful_retries;
        self.entities_extracted += other.entities_extracted;
        self.relationships_extracted += other.relationships_extracted;
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cost_usd += other.cost_usd;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use extract::{ExtractionError, ExtractionResult, LlmError, TokenUsage};

    fn outcome(status: ExtractionStatus, attempts: u32) -> ExtractionOutcome {
        ExtractionOutcome {
            chunk_id: "c".into(),
            status,
            attempts,
            usage: TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
            },
            cost_usd: 0.01,
            strategy: None,
        }
    }

    #[test]
    fn test_record_counts_by_status() {
        let mut stats = BuildStats::default();
        stats.record(&outcome(ExtractionStatus::Extracted(ExtractionResult::default()), 1));
        stats.record(&outcome(ExtractionStatus::Extracted(ExtractionResult::default()), 3));
        stats.record(&outcome(
            ExtractionStatus::Failed(ExtractionError::Llm(LlmError::Transient("503".into()))),
            3,
        ));
        stats.record(&outcome(ExtractionStatus::Skipped, 0));

        assert_eq!(stats.chunks_attempted, 3);
        assert_eq!(stats.chunks_succeeded, 2);
        assert_eq!(stats.chunks_errored, 1);
        assert_eq!(stats.chunks_skipped, 1);
        assert_eq!(stats.retries, 4);
        assert_eq!(stats.successful_retries, 1);
        assert_eq!(stats.input_tokens, 30);
        assert!((stats.success_rate() - 66.666).abs() < 0.01);
    }

    #[test]
    fn test_add_assign_accumulates() {
        let mut total = BuildStats {
            chunks_errored: 2,
            ..BuildStats::default()
        };
        total += &BuildStats {
            chunks_errored: 1,
            cost_usd: 0.5,
            ..BuildStats::default()
        };
        assert_eq!(total.chunks_errored, 3);
        assert_eq!(total.average_cost_per_chunk(), None);
    }
}
