pub mod model;
pub mod topo;

pub use model::{
    GraphProgress, GraphStatus, OperationRecord, RollbackAction, Task, TaskGraph, TaskId,
    TaskOutput, TaskResult, TaskStatus, TaskType,
};
pub use topo::{execution_levels, sorted_ids, topological_sort, validate_graph, validate_tasks};
