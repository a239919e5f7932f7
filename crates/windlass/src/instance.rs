//! Workflow instance identity

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies one logical execution of a workflow.
///
/// The `(instance_id, execution_id)` pair is unique. A sub-workflow carries a
/// weak reference to its parent; the reference is set at creation and never
/// mutated. Instances never hold owning references to each other, and parent
/// lookups always go through the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// Caller-chosen identifier, unique among live instances
    pub instance_id: String,

    /// Identifier of this particular execution of the instance
    pub execution_id: Uuid,

    /// Present when this instance was started as a sub-workflow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentExecution>,
}

/// Weak reference from a sub-workflow back to the execution that scheduled it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentExecution {
    /// Parent instance identifier
    pub instance_id: String,

    /// Parent execution identifier
    pub execution_id: Uuid,

    /// The parent's `ScheduleSubWorkflow` command ID; completion messages to
    /// the parent reuse it as their `schedule_event_id`
    pub schedule_event_id: i64,
}

impl WorkflowInstance {
    /// Create a new top-level instance with a fresh execution ID
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            execution_id: Uuid::now_v7(),
            parent: None,
        }
    }

    /// Create a sub-workflow instance of the given parent
    pub fn sub_workflow(
        instance_id: impl Into<String>,
        parent: &WorkflowInstance,
        schedule_event_id: i64,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            execution_id: Uuid::now_v7(),
            parent: Some(ParentExecution {
                instance_id: parent.instance_id.clone(),
                execution_id: parent.execution_id,
                schedule_event_id,
            }),
        }
    }

    /// Whether this instance was started by another workflow
    pub fn is_sub_workflow(&self) -> bool {
        self.parent.is_some()
    }
}

impl std::fmt::Display for WorkflowInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.instance_id, self.execution_id)
    }
}
