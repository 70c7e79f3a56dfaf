//! Graphviz export of the task and command graphs.
//!
//! Both graphs are rendered as a single-line `digraph`. Order dependencies
//! are blue, anti dependencies lime green. In the command graph every node
//! gets its own font colour, task commands are grouped into one cluster per
//! task and each await-push is linked to its push by a dashed edge.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use tracing::info;

use crate::command::{Command, CommandGraph, CommandKind};
use crate::core::{DependencyKind, Task, TaskGraph, TaskId, TaskType};

const NODE_COLORS: [&str; 8] = [
    "black",
    "crimson",
    "dodgerblue4",
    "goldenrod",
    "maroon4",
    "springgreen2",
    "tan1",
    "chartreuse2",
];

fn dependency_style(kind: DependencyKind) -> &'static str {
    match kind {
        DependencyKind::Order => "color=blue",
        DependencyKind::Anti => "color=limegreen",
    }
}

/// Quote a label for DOT. Embedded `\n` sequences stay line breaks.
fn escape_label(label: &str) -> String {
    let mut out = String::with_capacity(label.len() + 2);
    out.push('"');
    for c in label.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

pub fn task_label(task: &Task) -> String {
    match task.task_type {
        TaskType::DeviceCompute => format!("Task {} ({})", task.id, task.debug_name),
        other => format!("Task {} ({})", task.id, other),
    }
}

/// Render the task graph. The init task is left out.
pub fn task_graph_to_dot(graph: &TaskGraph) -> String {
    let mut out = String::from("digraph G { ");
    for task in graph.all_tasks() {
        let id = task.id;
        if id == TaskId::INIT {
            continue;
        }
        let _ = write!(out, "{}[ label={}];", id, escape_label(&task_label(task)));
        for (dep, kind) in graph.get_dependencies(id) {
            if dep == TaskId::INIT {
                continue;
            }
            let _ = write!(out, "{} -> {} [{}];", dep, id, dependency_style(kind));
        }
    }
    out.push('}');
    out
}

fn command_label(command: &Command, tasks: &TaskGraph) -> String {
    let head = format!("[{}] Node {}:\\n", command.id, command.node);
    match &command.kind {
        CommandKind::Task { task, subrange } => {
            let name = tasks
                .get_task(*task)
                .map(|t| t.debug_name.as_str())
                .unwrap_or_default();
            format!("{}TASK {}\\n{}", head, subrange.to_box(), name)
        }
        CommandKind::Push {
            buffer,
            target,
            region,
        } => format!("{}PUSH {} to {}\\n {}", head, buffer, target, region),
        CommandKind::AwaitPush {
            buffer,
            source_node,
            region,
            ..
        } => format!("{}AWAIT PUSH {} from {}\\n {}", head, buffer, source_node, region),
        CommandKind::Horizon => format!("{}HORIZON", head),
        CommandKind::Nop => format!("{}NOP", head),
    }
}

fn write_vertex(out: &mut String, command: &Command, tasks: &TaskGraph) {
    let color = NODE_COLORS[command.node.0 % NODE_COLORS.len()];
    let _ = write!(
        out,
        "{}[ label={} fontcolor={}",
        command.id,
        escape_label(&command_label(command, tasks)),
        color
    );
    if matches!(command.kind, CommandKind::Task { .. }) {
        out.push_str(" shape=box");
    }
    out.push_str("];");
}

/// Render the command graph. Task names are looked up in `tasks`; nop
/// commands and edges from them are left out.
pub fn command_graph_to_dot(graph: &CommandGraph, tasks: &TaskGraph) -> String {
    let mut main = String::new();
    let mut clusters: BTreeMap<TaskId, String> = BTreeMap::new();

    for command in graph.all_commands() {
        if command.kind == CommandKind::Nop {
            continue;
        }
        if let CommandKind::Task { task, .. } = &command.kind {
            let cluster = clusters.entry(*task).or_insert_with(|| {
                format!("subgraph cluster_{} {{ label=\"Task {}\"; color=gray;", task, task)
            });
            write_vertex(cluster, command, tasks);
        } else {
            write_vertex(&mut main, command, tasks);
        }

        for (dep, kind) in graph.dependencies(command.id) {
            let from_nop = graph
                .get(dep)
                .map(|d| d.kind == CommandKind::Nop)
                .unwrap_or(true);
            if from_nop {
                continue;
            }
            let _ = write!(main, "{} -> {} [{}];", dep, command.id, dependency_style(kind));
        }

        if let CommandKind::AwaitPush { source, .. } = &command.kind {
            let _ = write!(main, "{} -> {} [style=dashed color=gray40];", source, command.id);
        }
    }

    let mut out = String::from("digraph G { ");
    for cluster in clusters.values() {
        out.push_str(cluster);
        out.push('}');
    }
    out.push_str(&main);
    out.push('}');
    out
}

/// Emit both graphs as structured events on the `tessera::graph` target.
pub fn log_graphs(tasks: &TaskGraph, commands: &CommandGraph) {
    info!(target: "tessera::graph", name = "TaskGraph", data = %task_graph_to_dot(tasks));
    info!(
        target: "tessera::graph",
        name = "CommandGraph",
        data = %command_graph_to_dot(commands, tasks)
    );
}
