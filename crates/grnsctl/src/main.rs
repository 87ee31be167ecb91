//! grnsctl - CLI client for the grns task graph daemon.
//!
//! Thin front-end over the HTTP API: every subcommand maps to one or two
//! calls, with `--json` toggling machine-readable output.

mod client;
mod render;

use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use client::{AttachBody, Client, ClientError, CreateTaskBody, ImportParams, ListParams, UpdateTaskBody};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// CLI client for the grnsd task graph daemon.
#[derive(Parser)]
#[command(name = "grnsctl")]
#[command(about = "Task graph client for grnsd")]
#[command(version)]
struct Cli {
    /// Server address (default: http://127.0.0.1:7070)
    #[arg(long, global = true, env = "GRNS_API_URL")]
    api_url: Option<String>,

    /// Emit machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a task
    Create {
        /// Task title
        title: String,

        /// Task type: bug, feature, task, epic, or chore
        #[arg(short = 't', long = "type")]
        task_type: Option<String>,

        /// Priority 0-4
        #[arg(short = 'p', long)]
        priority: Option<i64>,

        /// Comma-separated labels
        #[arg(short = 'l', long, allow_hyphen_values = true)]
        labels: Option<String>,

        /// Description text
        #[arg(short = 'd', long)]
        description: Option<String>,

        /// Acceptance criteria text
        #[arg(long)]
        acceptance: Option<String>,

        /// Assignee
        #[arg(long)]
        assignee: Option<String>,

        /// Spec identifier
        #[arg(long)]
        spec_id: Option<String>,

        /// Source repository (URL, SCP form, or host/owner/name)
        #[arg(long)]
        source_repo: Option<String>,

        /// Explicit task id (otherwise generated)
        #[arg(long)]
        id: Option<String>,

        /// Comma-separated blocking parent ids
        #[arg(long)]
        deps: Option<String>,

        /// Custom field as key=value (repeatable)
        #[arg(long, value_parser = parse_key_val)]
        custom: Vec<(String, String)>,
    },

    /// Show one or more tasks (in the given order)
    Show {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Update fields on a task
    Update {
        id: String,

        #[arg(long)]
        title: Option<String>,

        #[arg(short = 't', long = "type")]
        task_type: Option<String>,

        #[arg(long)]
        status: Option<String>,

        #[arg(long)]
        priority: Option<i64>,

        #[arg(short = 'd', long)]
        description: Option<String>,

        #[arg(long)]
        acceptance: Option<String>,

        #[arg(long)]
        assignee: Option<String>,

        #[arg(long)]
        spec_id: Option<String>,

        #[arg(long)]
        source_repo: Option<String>,

        /// Replace the label set (comma-separated)
        #[arg(short = 'l', long, allow_hyphen_values = true)]
        labels: Option<String>,

        /// Custom field as key=value (repeatable, replaces the map)
        #[arg(long, value_parser = parse_key_val)]
        custom: Vec<(String, String)>,
    },

    /// Close one or more tasks
    Close {
        #[arg(required = true)]
        ids: Vec<String>,

        /// Annotate each task with this commit hash
        #[arg(long)]
        commit: Option<String>,

        /// Repository for the annotation (defaults to each task's source repo)
        #[arg(long)]
        repo: Option<String>,
    },

    /// Reopen one or more tasks
    Reopen {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// List tasks with filters
    List {
        /// Require all of these labels (comma-separated)
        #[arg(short = 'l', long, allow_hyphen_values = true)]
        label: Option<String>,

        /// Require any of these labels (comma-separated)
        #[arg(long, allow_hyphen_values = true)]
        label_any: Option<String>,

        /// Status set (comma-separated)
        #[arg(long)]
        status: Option<String>,

        /// Task type
        #[arg(short = 't', long = "type")]
        task_type: Option<String>,

        /// Regex over spec_id
        #[arg(long)]
        spec: Option<String>,

        /// Full-text search over title/description/acceptance
        #[arg(long)]
        search: Option<String>,

        /// Only tasks updated before this ISO date or timestamp
        #[arg(long)]
        updated_before: Option<String>,

        #[arg(long)]
        limit: Option<i64>,

        #[arg(long)]
        offset: Option<i64>,
    },

    /// List tasks that are open/in-progress with no unresolved blockers
    Ready {
        #[arg(long)]
        limit: Option<i64>,
    },

    /// List tasks untouched for a number of days
    Stale {
        /// Days threshold
        #[arg(long, default_value_t = 30)]
        days: i64,

        /// Status set (include closed explicitly to see closed tasks)
        #[arg(long)]
        status: Option<String>,
    },

    /// Manage dependency edges
    Dep {
        #[command(subcommand)]
        op: DepOp,
    },

    /// Manage labels
    Label {
        #[command(subcommand)]
        op: LabelOp,
    },

    /// Attach a git reference to a task
    Attach {
        id: String,

        /// Relation: design_doc, implements, fix_commit, closed_by,
        /// introduced_by, related, or x-<suffix>
        #[arg(long, default_value = "related")]
        relation: String,

        /// Object type: commit, tag, branch, path, blob, or tree
        #[arg(long = "type", default_value = "commit")]
        object_type: String,

        /// Object value (hash, ref name, or path)
        #[arg(long = "value")]
        object_value: String,

        /// Repository (defaults to the task's source repo)
        #[arg(long)]
        repo: Option<String>,

        /// Resolved commit hash
        #[arg(long)]
        resolved_commit: Option<String>,

        #[arg(long)]
        note: Option<String>,
    },

    /// Export the task graph as NDJSON
    Export {
        /// Output file (stdout when omitted)
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,
    },

    /// Import a task graph from NDJSON
    Import {
        /// Input file (stdin when omitted)
        #[arg(short = 'i', long)]
        input: Option<PathBuf>,

        /// Apply line by line instead of buffering the whole file
        #[arg(long)]
        stream: bool,

        /// Dedupe policy: skip, overwrite, or error
        #[arg(long)]
        dedupe: Option<String>,

        /// Orphan handling: strict or lenient
        #[arg(long)]
        orphan_handling: Option<String>,

        /// Compute counts without committing
        #[arg(long)]
        dry_run: bool,
    },

    /// Print client configuration
    Info,

    /// Check server health
    Srv,
}

#[derive(Subcommand)]
enum DepOp {
    /// Add a blocking edge: child depends on parent
    Add { child: String, parent: String },
    /// Remove a blocking edge
    Remove { child: String, parent: String },
}

#[derive(Subcommand)]
enum LabelOp {
    /// Add labels to a task
    Add {
        id: String,
        #[arg(required = true, allow_hyphen_values = true)]
        labels: Vec<String>,
    },
    /// Remove labels from a task
    Remove {
        id: String,
        #[arg(required = true, allow_hyphen_values = true)]
        labels: Vec<String>,
    },
}

fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))
}

fn split_csv(raw: Option<String>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(String::from)
            .collect()
    })
    .unwrap_or_default()
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("failed to serialize output: {e}"),
    }
}

const DEFAULT_API_URL: &str = "http://127.0.0.1:7070";

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let api_url = cli
        .api_url
        .clone()
        .unwrap_or_else(|| DEFAULT_API_URL.to_string());
    let client = Client::new(&api_url);

    if let Err(err) = run(&cli, &client).await {
        if cli.json {
            match serde_json::to_string(&err.body()) {
                Ok(body) => eprintln!("{body}"),
                Err(_) => eprintln!("{err}"),
            }
        } else {
            eprintln!("error: {err}");
        }
        std::process::exit(1);
    }
}

async fn run(cli: &Cli, client: &Client) -> Result<(), ClientError> {
    match &cli.command {
        Command::Create {
            title,
            task_type,
            priority,
            labels,
            description,
            acceptance,
            assignee,
            spec_id,
            source_repo,
            id,
            deps,
            custom,
        } => {
            let body = CreateTaskBody {
                id: id.clone(),
                title: title.clone(),
                task_type: task_type.clone(),
                status: None,
                priority: *priority,
                description: description.clone(),
                acceptance: acceptance.clone(),
                assignee: assignee.clone(),
                parent: None,
                spec_id: spec_id.clone(),
                source_repo: source_repo.clone(),
                labels: split_csv(labels.clone()),
                custom: custom.iter().cloned().collect::<BTreeMap<_, _>>(),
                deps: split_csv(deps.clone()),
            };
            let task = client.create_task(body).await?;
            if cli.json {
                print_json(&task);
            } else {
                render::print_task_created(&task);
            }
        }

        Command::Show { ids } => {
            let tasks = client.show_tasks(ids).await?;
            if cli.json {
                if tasks.len() == 1 {
                    print_json(&tasks[0]);
                } else {
                    print_json(&tasks);
                }
            } else {
                for task in &tasks {
                    render::print_task_details(task);
                    println!();
                }
            }
        }

        Command::Update {
            id,
            title,
            task_type,
            status,
            priority,
            description,
            acceptance,
            assignee,
            spec_id,
            source_repo,
            labels,
            custom,
        } => {
            let body = UpdateTaskBody {
                title: title.clone(),
                task_type: task_type.clone(),
                status: status.clone(),
                priority: *priority,
                description: description.clone(),
                acceptance: acceptance.clone(),
                assignee: assignee.clone(),
                spec_id: spec_id.clone(),
                source_repo: source_repo.clone(),
                labels: labels.clone().map(|l| split_csv(Some(l))),
                custom: if custom.is_empty() {
                    None
                } else {
                    Some(custom.iter().cloned().collect())
                },
            };
            let task = client.update_task(id, body).await?;
            if cli.json {
                print_json(&task);
            } else {
                render::print_task_details(&task);
            }
        }

        Command::Close { ids, commit, repo } => {
            let outcome = client
                .close_tasks(ids, commit.as_deref(), repo.as_deref())
                .await?;
            if cli.json {
                print_json(&outcome);
            } else {
                println!(
                    "Closed {} task(s), {} new annotation(s)",
                    outcome["closed"], outcome["annotated"]
                );
            }
        }

        Command::Reopen { ids } => {
            let outcome = client.reopen_tasks(ids).await?;
            if cli.json {
                print_json(&outcome);
            } else {
                println!("Reopened {} task(s)", outcome["reopened"]);
            }
        }

        Command::List {
            label,
            label_any,
            status,
            task_type,
            spec,
            search,
            updated_before,
            limit,
            offset,
        } => {
            let params = ListParams {
                label: label.clone(),
                label_any: label_any.clone(),
                status: status.clone(),
                task_type: task_type.clone(),
                spec: spec.clone(),
                search: search.clone(),
                updated_before: updated_before.clone(),
                limit: *limit,
                offset: *offset,
                ..Default::default()
            };
            let tasks = client.list_tasks(&params).await?;
            if cli.json {
                print_json(&tasks);
            } else {
                render::print_task_list(&tasks);
            }
        }

        Command::Ready { limit } => {
            let params = ListParams {
                ready: true,
                limit: *limit,
                ..Default::default()
            };
            let tasks = client.list_tasks(&params).await?;
            if cli.json {
                print_json(&tasks);
            } else {
                render::print_task_list(&tasks);
            }
        }

        Command::Stale { days, status } => {
            let params = ListParams {
                stale_days: Some(*days),
                status: status.clone(),
                ..Default::default()
            };
            let tasks = client.list_tasks(&params).await?;
            if cli.json {
                print_json(&tasks);
            } else {
                render::print_task_list(&tasks);
            }
        }

        Command::Dep { op } => {
            let task = match op {
                DepOp::Add { child, parent } => client.add_dep(child, parent).await?,
                DepOp::Remove { child, parent } => client.remove_dep(child, parent).await?,
            };
            if cli.json {
                print_json(&task);
            } else {
                render::print_task_details(&task);
            }
        }

        Command::Label { op } => {
            let task = match op {
                LabelOp::Add { id, labels } => client.add_labels(id, labels).await?,
                LabelOp::Remove { id, labels } => client.remove_labels(id, labels).await?,
            };
            if cli.json {
                print_json(&task);
            } else {
                render::print_task_details(&task);
            }
        }

        Command::Attach {
            id,
            relation,
            object_type,
            object_value,
            repo,
            resolved_commit,
            note,
        } => {
            let body = AttachBody {
                repo: repo.clone(),
                relation: relation.clone(),
                object_type: object_type.clone(),
                object_value: object_value.clone(),
                resolved_commit: resolved_commit.clone(),
                note: note.clone(),
            };
            let git_ref = client.attach_git_ref(id, body).await?;
            if cli.json {
                print_json(&git_ref);
            } else {
                render::print_git_ref(&git_ref);
            }
        }

        Command::Export { output } => {
            let ndjson = client.export().await?;
            match output {
                Some(path) => {
                    std::fs::write(path, &ndjson).map_err(|e| ClientError::Io(e.to_string()))?;
                    if !cli.json {
                        println!(
                            "Exported {} task(s) to {}",
                            ndjson.lines().count(),
                            path.display()
                        );
                    }
                }
                None => print!("{ndjson}"),
            }
        }

        Command::Import {
            input,
            stream,
            dedupe,
            orphan_handling,
            dry_run,
        } => {
            let ndjson = match input {
                Some(path) => std::fs::read_to_string(path)
                    .map_err(|e| ClientError::Io(e.to_string()))?,
                None => {
                    let mut buf = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buf)
                        .map_err(|e| ClientError::Io(e.to_string()))?;
                    buf
                }
            };
            let params = ImportParams {
                stream: *stream,
                dedupe: dedupe.clone(),
                orphan_handling: orphan_handling.clone(),
                dry_run: *dry_run,
            };
            let report = client.import(ndjson, &params).await?;
            if cli.json {
                print_json(&report);
            } else {
                render::print_import_report(&report);
            }
        }

        Command::Info => {
            let healthy = client.check_health().await.unwrap_or(false);
            let info = serde_json::json!({
                "api_url": client.addr(),
                "db": std::env::var("GRNS_DB").unwrap_or_default(),
                "healthy": healthy,
            });
            if cli.json {
                print_json(&info);
            } else {
                println!("api_url: {}", client.addr());
                println!("db:      {}", info["db"].as_str().unwrap_or_default());
                println!("healthy: {healthy}");
            }
        }

        Command::Srv => {
            let healthy = client.check_health().await?;
            if cli.json {
                print_json(&serde_json::json!({ "healthy": healthy }));
            } else if healthy {
                println!("server at {} is healthy", client.addr());
            } else {
                println!("server at {} responded unhealthy", client.addr());
            }
        }
    }
    Ok(())
}
