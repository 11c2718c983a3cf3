//! Refresh counters
//!
//! - `chat_auth_refresh_total` (counter): labels `trigger`, `outcome`
//!
//! Recorded through the `metrics` facade; without an installed recorder
//! these are no-ops.

use crate::refresher::RefreshTrigger;

/// Outcome label for a refresh run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Success,
    Failure,
    /// No stored session, or the session was cleared mid-refresh
    NoSession,
}

impl RefreshOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RefreshOutcome::Success => "success",
            RefreshOutcome::Failure => "failure",
            RefreshOutcome::NoSession => "no_session",
        }
    }
}

pub fn record_refresh(trigger: RefreshTrigger, outcome: RefreshOutcome) {
    metrics::counter!(
        "chat_auth_refresh_total",
        "trigger" => trigger.label(),
        "outcome" => outcome.label()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};

    /// Recorder scoped to the current thread, so tests don't fight over the
    /// global one.
    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn record_without_recorder_is_noop() {
        record_refresh(RefreshTrigger::Reactive, RefreshOutcome::Success);
        record_refresh(RefreshTrigger::Proactive, RefreshOutcome::Failure);
    }

    #[test]
    fn record_refresh_carries_trigger_and_outcome() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_refresh(RefreshTrigger::Reactive, RefreshOutcome::Success);
        record_refresh(RefreshTrigger::Proactive, RefreshOutcome::NoSession);

        let output = handle.render();
        assert!(output.contains("chat_auth_refresh_total"));
        assert!(output.contains("trigger=\"reactive\""));
        assert!(output.contains("outcome=\"success\""));
        assert!(output.contains("trigger=\"proactive\""));
        assert!(output.contains("outcome=\"no_session\""));
    }

    #[test]
    fn labels_are_stable() {
        assert_eq!(RefreshTrigger::Proactive.label(), "proactive");
        assert_eq!(RefreshTrigger::Manual.label(), "manual");
        assert_eq!(RefreshOutcome::NoSession.label(), "no_session");
    }
}
