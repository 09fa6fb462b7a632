//! Per-turn analytics records and session aggregation.
//!
//! The dispatcher records every finished turn here and emits the record
//! on the signal bus; a session summary goes out at shutdown. Nothing in
//! this module is load-bearing for turn-taking; it only observes.

use crate::engine::events::EndReason;
use crate::engine::state::TurnMetrics;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};

/// Immutable record of one completed turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnRecord {
    pub turn_id: u64,
    pub end_reason: String,
    pub skipped: bool,
    pub interrupted: bool,
    pub duration_ms: u64,
    pub asr_latency_ms: Option<u64>,
    pub llm_latency_ms: Option<u64>,
    pub user_text: String,
    pub ai_text: String,
    pub completed_at: DateTime<Utc>,
}

impl TurnRecord {
    pub fn from_metrics(metrics: &TurnMetrics) -> Self {
        Self {
            turn_id: metrics.turn_id,
            end_reason: metrics
                .end_reason
                .map_or("completed", EndReason::as_str)
                .to_owned(),
            skipped: metrics.skipped,
            interrupted: metrics.interrupted,
            duration_ms: metrics.duration_ms(),
            asr_latency_ms: metrics.asr_latency_ms,
            llm_latency_ms: metrics.llm_latency_ms,
            user_text: metrics.user_text.clone(),
            ai_text: metrics.ai_text.clone(),
            completed_at: Utc::now(),
        }
    }
}

/// Running aggregates for one engine session.
pub struct SessionAnalytics {
    started_at: DateTime<Utc>,
    turns: u64,
    skipped: u64,
    interrupted: u64,
    errors: u64,
    talk_ms: u64,
    llm_latency_sum_ms: u64,
    llm_latency_samples: u64,
}

impl SessionAnalytics {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            turns: 0,
            skipped: 0,
            interrupted: 0,
            errors: 0,
            talk_ms: 0,
            llm_latency_sum_ms: 0,
            llm_latency_samples: 0,
        }
    }

    /// Fold one finished turn into the aggregates and return its record.
    pub fn record(&mut self, metrics: &TurnMetrics) -> TurnRecord {
        let record = TurnRecord::from_metrics(metrics);
        self.turns += 1;
        if record.skipped {
            self.skipped += 1;
        }
        if record.interrupted {
            self.interrupted += 1;
        }
        if metrics.end_reason == Some(EndReason::Error) {
            self.errors += 1;
        }
        self.talk_ms += record.duration_ms;
        if let Some(latency) = record.llm_latency_ms {
            self.llm_latency_sum_ms += latency;
            self.llm_latency_samples += 1;
        }
        record
    }

    /// Session summary payload, emitted at shutdown.
    pub fn summary(&self) -> Value {
        let avg_llm_latency_ms = if self.llm_latency_samples > 0 {
            self.llm_latency_sum_ms / self.llm_latency_samples
        } else {
            0
        };
        json!({
            "started_at": self.started_at.to_rfc3339(),
            "turns": self.turns,
            "skipped": self.skipped,
            "interrupted": self.interrupted,
            "errors": self.errors,
            "talk_ms": self.talk_ms,
            "avg_llm_latency_ms": avg_llm_latency_ms,
        })
    }
}

impl Default for SessionAnalytics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    fn metrics(turn_id: u64) -> TurnMetrics {
        TurnMetrics {
            turn_id,
            end_reason: Some(EndReason::Silence),
            started_ms: Some(1_000),
            completed_ms: Some(3_500),
            llm_latency_ms: Some(400),
            user_text: "hello".to_owned(),
            ai_text: "hi".to_owned(),
            ..TurnMetrics::default()
        }
    }

    #[test]
    fn records_feed_the_summary() {
        let mut analytics = SessionAnalytics::new();
        let record = analytics.record(&metrics(1));
        assert_eq!(record.turn_id, 1);
        assert_eq!(record.end_reason, "silence");
        assert_eq!(record.duration_ms, 2_500);

        let mut second = metrics(2);
        second.interrupted = true;
        second.end_reason = Some(EndReason::Interrupted);
        let _ = analytics.record(&second);

        let summary = analytics.summary();
        assert_eq!(summary["turns"], 2);
        assert_eq!(summary["interrupted"], 1);
        assert_eq!(summary["avg_llm_latency_ms"], 400);
    }

    #[test]
    fn error_turns_are_counted() {
        let mut analytics = SessionAnalytics::new();
        let mut failed = metrics(1);
        failed.end_reason = Some(EndReason::Error);
        failed.llm_latency_ms = None;
        let record = analytics.record(&failed);
        assert_eq!(record.end_reason, "error");
        assert_eq!(analytics.summary()["errors"], 1);
        assert_eq!(analytics.summary()["avg_llm_latency_ms"], 0);
    }
}
