use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of one supervised run. Every state after `Running` is terminal
/// and absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Success,
    Failed,
    Stopped,
    TimedOut,
    Error,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunState::Pending | RunState::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::Running => "running",
            RunState::Success => "success",
            RunState::Failed => "failed",
            RunState::Stopped => "stopped",
            RunState::TimedOut => "timed_out",
            RunState::Error => "error",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub test_case: String,
    pub port: String,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    /// Structured payload printed by the test program, if any.
    pub result: Option<serde_json::Value>,
    pub stop_requested: bool,
    /// Number of log lines captured so far.
    #[serde(default)]
    pub log_lines: u64,
}

impl RunRecord {
    pub fn new(run_id: String, test_case: String, port: String) -> Self {
        Self {
            run_id,
            test_case,
            port,
            state: RunState::Pending,
            started_at: Utc::now(),
            ended_at: None,
            exit_code: None,
            result: None,
            stop_requested: false,
            log_lines: 0,
        }
    }

    pub fn mark_running(&mut self) {
        if self.state == RunState::Pending {
            self.state = RunState::Running;
        }
    }

    /// Move to a terminal state. Returns false if the run already ended.
    pub fn finish(&mut self, state: RunState) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = state;
        self.ended_at = Some(Utc::now());
        true
    }

    /// Record a stop request and end the run as `Stopped` right away.
    /// Fails with the current state when the run is already terminal.
    pub fn request_stop(&mut self) -> Result<(), RunState> {
        if self.state.is_terminal() {
            return Err(self.state);
        }
        self.stop_requested = true;
        self.finish(RunState::Stopped);
        Ok(())
    }
}

/// Outcome derived from a program's output after a clean exit.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadVerdict {
    Passed(serde_json::Value),
    Failed(serde_json::Value),
    Missing,
    Malformed(String),
}

impl PayloadVerdict {
    pub fn state(&self) -> RunState {
        match self {
            PayloadVerdict::Passed(_) => RunState::Success,
            PayloadVerdict::Failed(_) => RunState::Failed,
            PayloadVerdict::Missing | PayloadVerdict::Malformed(_) => RunState::Error,
        }
    }

    pub fn into_value(self) -> Option<serde_json::Value> {
        match self {
            PayloadVerdict::Passed(v) | PayloadVerdict::Failed(v) => Some(v),
            _ => None,
        }
    }
}

const FAILURE_STATUSES: &[&str] = &["fail", "failed", "failure", "error"];

/// Parse the structured result: the first stdout line starting with `{`
/// and every line after it must form a single JSON object.
pub fn parse_payload(stdout: &[String]) -> PayloadVerdict {
    let Some(start) = stdout.iter().position(|l| l.trim_start().starts_with('{')) else {
        return PayloadVerdict::Missing;
    };
    let text = stdout[start..].join("\n");

    let value: serde_json::Value = match serde_json::from_str(&text) {
        Ok(v) => v,
        Err(e) => return PayloadVerdict::Malformed(e.to_string()),
    };
    let Some(object) = value.as_object() else {
        return PayloadVerdict::Malformed("result payload is not an object".to_string());
    };

    let failed_status = object
        .get("status")
        .and_then(|s| s.as_str())
        .is_some_and(|s| FAILURE_STATUSES.contains(&s.to_ascii_lowercase().as_str()));
    let failed_flag = object.get("success").and_then(|s| s.as_bool()) == Some(false);

    if failed_status || failed_flag {
        PayloadVerdict::Failed(value)
    } else {
        PayloadVerdict::Passed(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(text: &str) -> Vec<String> {
        text.lines().map(str::to_string).collect()
    }

    #[test]
    fn terminal_states_are_absorbing() {
        let mut run = RunRecord::new("r1".into(), "a.sh".into(), "COM1".into());
        run.mark_running();
        assert_eq!(run.state, RunState::Running);

        assert!(run.finish(RunState::Success));
        assert!(!run.finish(RunState::Failed));
        assert_eq!(run.state, RunState::Success);
        assert_eq!(run.request_stop(), Err(RunState::Success));
        assert!(!run.stop_requested);
    }

    #[test]
    fn stop_ends_running_run() {
        let mut run = RunRecord::new("r1".into(), "a.sh".into(), "COM1".into());
        run.mark_running();
        assert!(run.request_stop().is_ok());
        assert!(run.stop_requested);
        assert_eq!(run.state, RunState::Stopped);
        assert!(run.ended_at.is_some());
    }

    #[test]
    fn payload_after_log_output() {
        let out = lines("step 1\nstep 2\n{\n  \"status\": \"pass\",\n  \"items\": 3\n}");
        let verdict = parse_payload(&out);
        assert_eq!(verdict.state(), RunState::Success);
        assert_eq!(verdict.into_value().unwrap()["items"], 3);
    }

    #[test]
    fn failing_payload() {
        assert_eq!(
            parse_payload(&lines(r#"{"status": "FAILED"}"#)).state(),
            RunState::Failed
        );
        assert_eq!(
            parse_payload(&lines(r#"{"success": false}"#)).state(),
            RunState::Failed
        );
    }

    #[test]
    fn missing_or_malformed_payload_is_error() {
        assert_eq!(parse_payload(&lines("done")), PayloadVerdict::Missing);
        assert!(matches!(
            parse_payload(&lines("{ not json")),
            PayloadVerdict::Malformed(_)
        ));
        assert_eq!(parse_payload(&lines("{oops\nmore")).state(), RunState::Error);
    }

    #[test]
    fn state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&RunState::TimedOut).unwrap(),
            "\"timed_out\""
        );
        assert_eq!(RunState::TimedOut.to_string(), "timed_out");
    }
}
