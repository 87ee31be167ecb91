//! Human-readable output for the grnsctl CLI.
//!
//! `--json` bypasses all of this; these renderers cover the terminal case.

use grns_core::transfer::ImportReport;
use grns_core::{GitRef, Task};

/// Print confirmation after creating a task.
pub fn print_task_created(task: &Task) {
    println!("Created task: {}", task.id);
    println!("  Title:    {}", task.title);
    println!("  Type:     {}", task.task_type.as_str());
    println!("  Status:   {}", task.status.as_str());
    println!("  Priority: {}", task.priority);
    if !task.labels.is_empty() {
        println!("  Labels:   {}", task.labels.join(", "));
    }
}

/// Print a list of tasks in tabular format.
pub fn print_task_list(tasks: &[Task]) {
    if tasks.is_empty() {
        println!("No tasks found.");
        return;
    }

    println!(
        "{:<8}  {:<8}  {:<12}  {:<3}  {:<40}",
        "ID", "TYPE", "STATUS", "PRI", "TITLE"
    );
    println!("{}", "-".repeat(78));

    for task in tasks {
        println!(
            "{:<8}  {:<8}  {:<12}  {:<3}  {:<40}",
            task.id.as_str(),
            task.task_type.as_str(),
            task.status.as_str(),
            task.priority,
            truncate(&task.title, 40),
        );
    }

    println!();
    println!("{} task(s)", tasks.len());
}

/// Print detailed information about a task.
pub fn print_task_details(task: &Task) {
    println!("Task: {}", task.id);
    println!();
    println!("  Title:      {}", task.title);
    println!("  Type:       {}", task.task_type.as_str());
    println!("  Status:     {}", task.status.as_str());
    println!("  Priority:   {}", task.priority);
    if let Some(ref description) = task.description {
        println!("  Description: {description}");
    }
    if let Some(ref acceptance) = task.acceptance {
        println!("  Acceptance: {acceptance}");
    }
    if let Some(ref assignee) = task.assignee {
        println!("  Assignee:   {assignee}");
    }
    if let Some(ref parent) = task.parent {
        println!("  Parent:     {parent}");
    }
    if let Some(ref spec_id) = task.spec_id {
        println!("  Spec:       {spec_id}");
    }
    if let Some(ref repo) = task.source_repo {
        println!("  Repo:       {repo}");
    }
    if !task.labels.is_empty() {
        println!("  Labels:     {}", task.labels.join(", "));
    }
    if !task.custom.is_empty() {
        println!("  Custom:");
        for (key, value) in &task.custom {
            println!("    {key} = {value}");
        }
    }
    if !task.deps.is_empty() {
        println!("  Blocked by:");
        for dep in &task.deps {
            println!("    {}", dep.parent_id);
        }
    }
    println!("  Created:    {}", task.created_at.to_rfc3339());
    println!("  Updated:    {}", task.updated_at.to_rfc3339());
    if let Some(closed_at) = task.closed_at {
        println!("  Closed:     {}", closed_at.to_rfc3339());
    }
}

/// Print confirmation after attaching a git reference.
pub fn print_git_ref(git_ref: &GitRef) {
    println!("Attached git ref: {}", git_ref.id);
    println!("  Task:     {}", git_ref.task_id);
    println!("  Repo:     {}", git_ref.repo);
    println!("  Relation: {}", git_ref.relation);
    println!(
        "  Object:   {} {}",
        git_ref.object_type.as_str(),
        git_ref.object_value
    );
    if !git_ref.resolved_commit.is_empty() {
        println!("  Resolved: {}", git_ref.resolved_commit);
    }
    if let Some(ref note) = git_ref.note {
        println!("  Note:     {note}");
    }
}

/// Print an import report summary.
pub fn print_import_report(report: &ImportReport) {
    if report.dry_run {
        println!("Dry run (no changes committed):");
    }
    println!("  created: {}", report.created);
    println!("  skipped: {}", report.skipped);
    println!("  errors:  {}", report.errors);
    for message in &report.messages {
        println!("  - {message}");
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let prefix: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{prefix}...")
    }
}
