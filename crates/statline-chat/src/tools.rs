//! Tracking of backend tool invocations within the current turn

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::message::new_id;

/// Lifecycle of a tool invocation. Transitions only go out of `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Running,
    Success,
    Failed,
}

/// One invocation of a backend tool during an assistant turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExecution {
    /// Locally generated, the server never sees it
    pub id: String,
    pub tool_name: String,
    pub arguments: Map<String, Value>,
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<String>,
}

impl ToolExecution {
    fn running(tool_name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            id: new_id(),
            tool_name: tool_name.into(),
            arguments,
            status: ToolStatus::Running,
            result_summary: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == ToolStatus::Running
    }
}

/// How `tool_end` events are matched to running invocations.
///
/// The wire protocol does not echo an invocation id, so completions can only
/// be matched by tool name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
    /// Complete the oldest running invocation with the same name (FIFO per name)
    #[default]
    OldestByName,
    /// Complete only when exactly one invocation with that name is running
    Strict,
}

/// Tool invocations belonging to the current turn
#[derive(Debug, Clone, Default)]
pub struct ToolTracker {
    policy: MatchPolicy,
    active: Vec<ToolExecution>,
}

impl ToolTracker {
    pub fn new(policy: MatchPolicy) -> Self {
        Self {
            policy,
            active: Vec::new(),
        }
    }

    /// Invocations of the current turn, in start order
    pub fn active(&self) -> &[ToolExecution] {
        &self.active
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Number of invocations still running
    pub fn running_count(&self) -> usize {
        self.active.iter().filter(|t| t.is_running()).count()
    }

    /// Record a new running invocation
    pub fn start(&mut self, tool_name: &str, arguments: Map<String, Value>) -> &ToolExecution {
        self.active.push(ToolExecution::running(tool_name, arguments));
        &self.active[self.active.len() - 1]
    }

    /// Complete a running invocation of `tool_name`.
    ///
    /// Returns `None` when no invocation matches (or, under
    /// [`MatchPolicy::Strict`], when the match is ambiguous); the tracker is
    /// left untouched in that case.
    pub fn finish(
        &mut self,
        tool_name: &str,
        success: bool,
        result_summary: Option<String>,
    ) -> Option<&ToolExecution> {
        let mut running = self
            .active
            .iter()
            .enumerate()
            .filter(|(_, t)| t.is_running() && t.tool_name == tool_name)
            .map(|(idx, _)| idx);

        let idx = running.next()?;
        if self.policy == MatchPolicy::Strict && running.next().is_some() {
            tracing::warn!(
                tool = tool_name,
                "ambiguous completion for concurrently running tool, ignoring"
            );
            return None;
        }

        let tool = &mut self.active[idx];
        tool.status = if success {
            ToolStatus::Success
        } else {
            ToolStatus::Failed
        };
        tool.result_summary = result_summary;
        Some(tool)
    }

    /// Move all invocations out, leaving the tracker empty
    pub fn take(&mut self) -> Vec<ToolExecution> {
        std::mem::take(&mut self.active)
    }

    pub fn clear(&mut self) {
        self.active.clear();
    }
}
