use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use clap::{Parser, Subcommand};
use serde_json::{Value, json};

use pim::crew::spawner::{ArtifactSink, PiRunner};
use pim::error::PimError;
use pim::output::{self, ActionResult, Format};
use pim::router;
use pim::session::Messenger;
use pim::store::inbox::{DeliveryDedup, InboxConsumer, InboxListener};
use pim::store::paths::CrewPaths;

#[derive(Parser)]
#[command(
    name = "pim",
    version,
    about = "File-based coordination mesh and crew orchestrator for pi agents"
)]
struct Cli {
    /// Output format
    #[arg(long, global = true, value_enum, default_value = "pretty")]
    format: Format,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register this agent in the mesh
    Join {
        /// Explicit agent name (no retry on collision)
        #[arg(long)]
        name: Option<String>,
        /// Model label shown to peers
        #[arg(long)]
        model: Option<String>,
        /// Spec path to announce for swarm work
        #[arg(long)]
        spec: Option<String>,
        /// Mark this agent as human-driven
        #[arg(long)]
        human: bool,
    },
    /// Unregister and clean up the inbox
    Leave,
    /// Show own registration and derived presence
    Status,
    /// List live agents with presence
    List,
    /// Show one agent in detail
    Whois { name: String },
    /// Show the shared activity feed
    Feed {
        /// Only the last N events
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Set (or clear) the free-text status message
    SetStatus { message: Option<String> },
    /// Reserve paths for exclusive writes
    Reserve {
        /// Paths; a trailing slash reserves the whole directory
        paths: Vec<String>,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Release reservations
    Release {
        paths: Vec<String>,
        /// Release everything held by this agent
        #[arg(long)]
        all: bool,
    },
    /// Check a path against peer reservations (write-enforcement hook)
    Guard { path: String },
    /// Take a new name, keeping the session inbox
    Rename { name: String },
    /// Send a message to one or more agents
    Send {
        /// Recipient names (comma-separated)
        #[arg(long, required = true, value_delimiter = ',')]
        to: Vec<String>,
        message: String,
        #[arg(long)]
        reply_to: Option<String>,
    },
    /// Send a message to every live peer
    Broadcast { message: String },
    /// Read and consume pending messages once
    Inbox,
    /// Watch the inbox and print messages as they arrive
    Listen,
    /// Show swarm claims and completions
    Swarm {
        #[arg(long)]
        spec: Option<String>,
    },
    /// Claim a task on a spec
    Claim {
        task: String,
        #[arg(long)]
        spec: Option<String>,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Drop an owned claim
    Unclaim {
        task: String,
        #[arg(long)]
        spec: Option<String>,
    },
    /// Complete an owned claim
    Complete {
        task: String,
        #[arg(long)]
        spec: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Show or set the announced spec path
    Spec { path: Option<String> },
    /// Record a host tool call (activity + feed hook)
    Track {
        #[arg(long)]
        tool: String,
        #[arg(long)]
        target: Option<String>,
        #[arg(long)]
        command: Option<String>,
        #[arg(long)]
        exit_code: Option<i32>,
        #[arg(long)]
        tokens: Option<u64>,
    },
    /// Manage autoRegisterPaths in the user config
    AutoRegisterPath {
        path: String,
        #[arg(long)]
        remove: bool,
    },
    /// Crew task store operations
    #[command(subcommand)]
    Task(TaskCommands),
    /// Plan the project's PRD into tasks
    Plan {
        #[arg(long)]
        prd: Option<String>,
    },
    /// Run a wave of workers over ready tasks
    Work {
        /// Keep scheduling waves until done, blocked, or the wave cap
        #[arg(long)]
        autonomous: bool,
        #[arg(long)]
        workers: Option<u32>,
    },
    /// Review the plan or a task's implementation
    Review {
        /// `task-N` for implementation review; omit for plan review
        target: Option<String>,
    },
    /// Generate clarifying interview questions
    Interview,
    /// Propagate a completed task's outcomes into dependent specs
    Sync { task: String },
    /// Crew maintenance
    #[command(subcommand)]
    Crew(CrewCommands),
    /// Raw action-router entry (host integration)
    Tool {
        #[arg(long)]
        action: String,
        /// JSON params object
        #[arg(long, default_value = "{}")]
        params: String,
    },
}

#[derive(Subcommand)]
enum TaskCommands {
    Create {
        title: String,
        #[arg(long)]
        spec: Option<String>,
        #[arg(long, value_delimiter = ',')]
        depends_on: Vec<String>,
    },
    Show { id: String },
    List,
    Start {
        id: String,
        #[arg(long)]
        agent: Option<String>,
    },
    Done {
        id: String,
        #[arg(long)]
        summary: Option<String>,
        #[arg(long = "commit")]
        commits: Vec<String>,
        #[arg(long = "test")]
        tests: Vec<String>,
        #[arg(long = "pr")]
        prs: Vec<String>,
    },
    Block { id: String, reason: String },
    Unblock { id: String },
    Ready,
    Reset {
        id: String,
        #[arg(long)]
        cascade: bool,
    },
}

#[derive(Subcommand)]
enum CrewCommands {
    Status,
    Agents,
    Validate,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let format = cli.format;

    let mut mx = match Messenger::new() {
        Ok(mx) => mx,
        Err(err) => {
            output::print_error(&err, format);
            std::process::exit(1);
        }
    };

    match run(&mut mx, cli.command, format) {
        Ok(result) => output::print_result(&result, format),
        Err(err) => {
            output::print_error(&err, format);
            std::process::exit(1);
        }
    }
}

fn run(
    mx: &mut Messenger,
    command: Commands,
    format: Format,
) -> pim::error::Result<ActionResult> {
    let (action, params): (&str, Value) = match command {
        Commands::Join {
            name,
            model,
            spec,
            human,
        } => (
            "join",
            json!({ "name": name, "model": model, "spec": spec, "human": human }),
        ),
        Commands::Leave => ("leave", json!({})),
        Commands::Status => ("status", json!({})),
        Commands::List => ("list", json!({})),
        Commands::Whois { name } => ("whois", json!({ "name": name })),
        Commands::Feed { limit } => ("feed", json!({ "limit": limit })),
        Commands::SetStatus { message } => ("set_status", json!({ "message": message })),
        Commands::Reserve { paths, reason } => {
            ("reserve", json!({ "paths": paths, "reason": reason }))
        }
        Commands::Release { paths, all } => {
            ("release", json!({ "paths": paths, "releaseAll": all }))
        }
        Commands::Guard { path } => ("guard", json!({ "path": path })),
        Commands::Rename { name } => ("rename", json!({ "name": name })),
        Commands::Send {
            to,
            message,
            reply_to,
        } => (
            "send",
            json!({ "to": to, "message": message, "replyTo": reply_to }),
        ),
        Commands::Broadcast { message } => ("broadcast", json!({ "message": message })),
        Commands::Inbox => ("inbox", json!({})),
        Commands::Listen => return listen(mx, format),
        Commands::Swarm { spec } => ("swarm", json!({ "spec": spec })),
        Commands::Claim { task, spec, reason } => (
            "claim",
            json!({ "task": task, "spec": spec, "reason": reason }),
        ),
        Commands::Unclaim { task, spec } => ("unclaim", json!({ "task": task, "spec": spec })),
        Commands::Complete { task, spec, notes } => (
            "complete",
            json!({ "task": task, "spec": spec, "notes": notes }),
        ),
        Commands::Spec { path } => ("spec", json!({ "path": path })),
        Commands::Track {
            tool,
            target,
            command,
            exit_code,
            tokens,
        } => (
            "track",
            json!({
                "tool": tool,
                "target": target,
                "command": command,
                "exitCode": exit_code,
                "tokens": tokens,
            }),
        ),
        Commands::AutoRegisterPath { path, remove } => (
            "autoRegisterPath",
            json!({ "path": path, "remove": remove }),
        ),
        Commands::Task(task) => return dispatch_task(mx, task),
        Commands::Plan { prd } => ("plan", json!({ "prd": prd })),
        Commands::Work {
            autonomous,
            workers,
        } => (
            "work",
            json!({ "autonomous": autonomous, "workers": workers }),
        ),
        Commands::Review { target } => ("review", json!({ "target": target })),
        Commands::Interview => ("interview", json!({})),
        Commands::Sync { task } => ("sync", json!({ "task": task })),
        Commands::Crew(crew) => {
            let op = match crew {
                CrewCommands::Status => "crew.status",
                CrewCommands::Agents => "crew.agents",
                CrewCommands::Validate => "crew.validate",
            };
            (op, json!({}))
        }
        Commands::Tool { action, params } => {
            let parsed: Value = serde_json::from_str(&params)
                .map_err(|err| PimError::InvalidParams(err.to_string()))?;
            let runner = make_runner(mx);
            return router::dispatch(mx, &runner, &action, &parsed);
        }
    };

    let runner = make_runner(mx);
    router::dispatch(mx, &runner, action, &params)
}

fn dispatch_task(mx: &mut Messenger, task: TaskCommands) -> pim::error::Result<ActionResult> {
    let (op, params) = match task {
        TaskCommands::Create {
            title,
            spec,
            depends_on,
        } => (
            "task.create",
            json!({ "title": title, "spec": spec, "dependsOn": depends_on }),
        ),
        TaskCommands::Show { id } => ("task.show", json!({ "id": id })),
        TaskCommands::List => ("task.list", json!({})),
        TaskCommands::Start { id, agent } => ("task.start", json!({ "id": id, "agent": agent })),
        TaskCommands::Done {
            id,
            summary,
            commits,
            tests,
            prs,
        } => (
            "task.done",
            json!({
                "id": id,
                "summary": summary,
                "commits": commits,
                "tests": tests,
                "prs": prs,
            }),
        ),
        TaskCommands::Block { id, reason } => {
            ("task.block", json!({ "id": id, "reason": reason }))
        }
        TaskCommands::Unblock { id } => ("task.unblock", json!({ "id": id })),
        TaskCommands::Ready => ("task.ready", json!({})),
        TaskCommands::Reset { id, cascade } => {
            ("task.reset", json!({ "id": id, "cascade": cascade }))
        }
    };
    let runner = make_runner(mx);
    router::dispatch(mx, &runner, op, &params)
}

fn make_runner(mx: &Messenger) -> PiRunner {
    let crew_paths = CrewPaths::for_project(&mx.cwd);
    let artifacts = mx.config.crew.artifacts.enabled.then(|| {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let run_id = format!(
            "run-{}-{}",
            chrono::Utc::now().format("%Y%m%d%H%M%S"),
            &token[..8]
        );
        ArtifactSink::new(crew_paths.run_dir(&run_id))
    });
    PiRunner::new(artifacts)
}

/// Blocking inbox loop. Each delivered message is rendered (with
/// first-contact cues) and printed as a steer line for the host turn loop.
fn listen(mx: &mut Messenger, format: Format) -> pim::error::Result<ActionResult> {
    let me = mx.resolve_identity()?;
    let consumer = InboxConsumer::new(&mx.paths, &me.session_id);
    let listener = InboxListener::new(consumer);
    let stop = Arc::new(AtomicBool::new(false));

    // The watcher thread owns delivery; the dedup keeps redelivered ids from
    // producing a second steer.
    let mx_cell = std::sync::Mutex::new(mx);
    let mut dedup = DeliveryDedup::default();
    let mut deliver = move |msg: &pim::store::inbox::Message| {
        if !dedup.first_delivery(&msg.id) {
            return;
        }
        let mut mx = mx_cell.lock().unwrap();
        let rendered = mx.render_delivery(msg);
        match format {
            Format::Json => println!(
                "{}",
                json!({ "steer": true, "message": msg, "rendered": rendered })
            ),
            Format::Pretty | Format::Minimal => println!("{rendered}"),
        }
    };

    listener.run(stop, &mut deliver)?;
    Ok(ActionResult::text_only("listener stopped"))
}
