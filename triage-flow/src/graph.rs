use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::{
    context::Context,
    error::{GraphError, Result},
    task::{NextAction, Task, TaskResult},
};

/// Type alias for edge condition functions
pub type EdgeCondition = Arc<dyn Fn(&Context) -> bool + Send + Sync>;

/// Where an edge leads once its source task asks to continue
#[derive(Clone)]
enum EdgeTarget {
    Always(String),
    Branch {
        condition: EdgeCondition,
        on_true: String,
        on_false: String,
    },
}

#[derive(Clone)]
struct Edge {
    from: String,
    target: EdgeTarget,
}

/// A graph of tasks that can be executed.
///
/// The graph is frozen once built: executions only read it, so one instance
/// can serve any number of concurrent executions.
pub struct Graph {
    pub id: String,
    tasks: HashMap<String, Arc<dyn Task>>,
    edges: Vec<Edge>,
    start_task_id: Option<String>,
}

impl Graph {
    /// Execute the graph from its start task until a task ends it.
    ///
    /// Tasks run strictly one after another; a task only starts once the
    /// previous one has returned.
    pub async fn execute(&self, context: Context) -> Result<ExecutionResult> {
        let mut current = self.start_task_id.clone().ok_or(GraphError::NoStartTask)?;
        let mut visited = Vec::new();
        // Every task may run at most once per execution.
        let step_limit = self.tasks.len();

        loop {
            if visited.len() >= step_limit {
                return Err(GraphError::StepLimitExceeded(step_limit));
            }

            let result = self.execute_single_task(&current, &context).await?;
            visited.push(current.clone());

            match result.next_action {
                NextAction::End => {
                    info!(graph = %self.id, task = %current, "Graph execution completed");
                    return Ok(ExecutionResult::new(result, visited));
                }
                NextAction::Continue => match self.find_next_task(&current, &context) {
                    Some(next) => {
                        debug!(graph = %self.id, from = %current, to = %next, "Following edge");
                        current = next;
                    }
                    None => {
                        info!(graph = %self.id, task = %current, "No outgoing edge, stopping");
                        return Ok(ExecutionResult::new(result, visited));
                    }
                },
            }
        }
    }

    /// Execute a single task, racing it against the context's cancellation
    async fn execute_single_task(&self, task_id: &str, context: &Context) -> Result<TaskResult> {
        let task = self
            .tasks
            .get(task_id)
            .ok_or_else(|| GraphError::TaskNotFound(task_id.to_string()))?;

        if context.is_cancelled() {
            return Err(GraphError::Cancelled);
        }

        debug!(graph = %self.id, task = %task_id, "Running task");
        tokio::select! {
            result = task.run(context.clone()) => result,
            _ = context.cancellation().cancelled() => Err(GraphError::Cancelled),
        }
    }

    /// Find the next task based on edges and conditions
    pub fn find_next_task(&self, current_task_id: &str, context: &Context) -> Option<String> {
        self.edges
            .iter()
            .find(|edge| edge.from == current_task_id)
            .map(|edge| match &edge.target {
                EdgeTarget::Always(to) => to.clone(),
                EdgeTarget::Branch {
                    condition,
                    on_true,
                    on_false,
                } => {
                    if condition(context) {
                        on_true.clone()
                    } else {
                        on_false.clone()
                    }
                }
            })
    }

    /// Get the start task ID
    pub fn start_task_id(&self) -> Option<&str> {
        self.start_task_id.as_deref()
    }

    /// Get a task by ID
    pub fn get_task(&self, task_id: &str) -> Option<Arc<dyn Task>> {
        self.tasks.get(task_id).cloned()
    }
}

/// Builder for creating graphs
pub struct GraphBuilder {
    id: String,
    tasks: HashMap<String, Arc<dyn Task>>,
    edges: Vec<Edge>,
    start_task_id: Option<String>,
}

impl GraphBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tasks: HashMap::new(),
            edges: Vec::new(),
            start_task_id: None,
        }
    }

    /// Add a task; the first task added becomes the start task
    pub fn add_task(mut self, task: Arc<dyn Task>) -> Self {
        let task_id = task.id().to_string();
        if self.start_task_id.is_none() {
            self.start_task_id = Some(task_id.clone());
        }
        self.tasks.insert(task_id, task);
        self
    }

    pub fn add_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push(Edge {
            from: from.into(),
            target: EdgeTarget::Always(to.into()),
        });
        self
    }

    /// Add a two-way branch: `on_true` when the condition holds, `on_false` otherwise
    pub fn add_conditional_edge<F>(
        mut self,
        from: impl Into<String>,
        condition: F,
        on_true: impl Into<String>,
        on_false: impl Into<String>,
    ) -> Self
    where
        F: Fn(&Context) -> bool + Send + Sync + 'static,
    {
        self.edges.push(Edge {
            from: from.into(),
            target: EdgeTarget::Branch {
                condition: Arc::new(condition),
                on_true: on_true.into(),
                on_false: on_false.into(),
            },
        });
        self
    }

    pub fn set_start_task(mut self, task_id: impl Into<String>) -> Self {
        let task_id = task_id.into();
        if self.tasks.contains_key(&task_id) {
            self.start_task_id = Some(task_id);
        }
        self
    }

    pub fn build(self) -> Graph {
        Graph {
            id: self.id,
            tasks: self.tasks,
            edges: self.edges,
            start_task_id: self.start_task_id,
        }
    }
}

/// Outcome of a completed graph execution
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub response: Option<String>,
    pub status_message: Option<String>,
    /// Task ids in the order they ran
    pub visited: Vec<String>,
}

impl ExecutionResult {
    fn new(result: TaskResult, visited: Vec<String>) -> Self {
        Self {
            response: result.response,
            status_message: result.status_message,
            visited,
        }
    }
}
