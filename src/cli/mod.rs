//! SF-017: CLI subcommands: init, validate, preview, up, destroy, status, outputs.

use crate::core::context::{CancelToken, RunContext};
use crate::core::executor::{self, ApplyReport};
use crate::core::graph::Graph;
use crate::core::output::OutputResolver;
use crate::core::state::{FileStateStore, StateStore};
use crate::core::types::{Plan, StackFile};
use crate::core::{engine, parser, planner};
use crate::providers::memory::MemoryProvider;
use crate::providers::ProviderRegistry;
use crate::tripwire::eventlog::EventLog;
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(
    name = "stackform",
    version,
    about = "Declarative infrastructure stacks: resource graphs, lazy outputs, incremental BLAKE3 state"
)]
pub struct Cli {
    /// Log more (-v info, -vv debug); RUST_LOG overrides
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

/// Where a stack is declared and where its state lives.
#[derive(Args, Debug, Clone)]
pub struct StackArgs {
    /// Path to the stack file
    #[arg(short, long, default_value = "stack.yaml")]
    pub file: PathBuf,

    /// State directory
    #[arg(long, default_value = "state")]
    pub state_dir: PathBuf,

    /// Override a config value (repeatable)
    #[arg(short = 'c', long = "config", value_name = "KEY=VALUE", value_parser = parser::parse_override)]
    pub config: Vec<(String, String)>,

    /// Serve resource types that have no provider from an in-memory provider
    #[arg(long)]
    pub simulate: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new stack
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate a stack file without touching state or providers
    Validate {
        #[command(flatten)]
        stack: StackArgs,
    },

    /// Show the plan (desired vs last applied state)
    Preview {
        #[command(flatten)]
        stack: StackArgs,
    },

    /// Plan and apply
    Up {
        #[command(flatten)]
        stack: StackArgs,

        /// Apply without asking for confirmation
        #[arg(short, long)]
        yes: bool,

        /// Maximum concurrent provider calls (overrides policy.parallelism)
        #[arg(short, long)]
        parallel: Option<usize>,
    },

    /// Delete every resource of the stack
    Destroy {
        #[command(flatten)]
        stack: StackArgs,

        /// Destroy without asking for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Show recorded state
    Status {
        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// Only this stack
        #[arg(short, long)]
        stack: Option<String>,
    },

    /// Print a stack's exported outputs
    Outputs {
        /// Stack name
        stack: String,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Dispatch a CLI command. `cancel` is tripped by Ctrl-C.
pub async fn dispatch(cmd: Commands, cancel: CancelToken) -> Result<(), String> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Validate { stack } => cmd_validate(&stack),
        Commands::Preview { stack } => cmd_preview(&stack),
        Commands::Up {
            stack,
            yes,
            parallel,
        } => cmd_up(&stack, yes, parallel, cancel).await,
        Commands::Destroy { stack, yes } => cmd_destroy(&stack, yes, cancel).await,
        Commands::Status { state_dir, stack } => cmd_status(&state_dir, stack.as_deref()),
        Commands::Outputs {
            stack,
            state_dir,
            json,
        } => cmd_outputs(&state_dir, &stack, json),
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "stackform", &mut std::io::stdout());
            Ok(())
        }
    }
}

const INIT_TEMPLATE: &str = r#"version: "1.0"
name: my-stack
description: "Managed by stackform"

config:
  greeting: hello

resources:
  hello:
    type: command
    inputs:
      create: 'echo "{{config.greeting}} from stackform"'

outputs:
  message: "${hello.stdout}"

policy:
  parallelism: 4
  failure: continue_independent
  tripwire: true
"#;

fn cmd_init(path: &Path) -> Result<(), String> {
    let stack_path = path.join("stack.yaml");
    if stack_path.exists() {
        return Err(format!("{} already exists", stack_path.display()));
    }

    let state_dir = path.join("state");
    std::fs::create_dir_all(&state_dir).map_err(|e| format!("cannot create state dir: {}", e))?;
    std::fs::write(&stack_path, INIT_TEMPLATE)
        .map_err(|e| format!("cannot write {}: {}", stack_path.display(), e))?;

    println!("Initialized stack at {}", path.display());
    println!("  Created: {}", stack_path.display());
    println!("  Created: {}/", state_dir.display());
    Ok(())
}

/// A parsed, validated stack ready to plan.
struct Loaded {
    stack: StackFile,
    graph: Graph,
    ctx: RunContext,
}

fn registry(args: &StackArgs, store: Arc<dyn StateStore>) -> ProviderRegistry {
    let mut providers = ProviderRegistry::standard(store);
    if args.simulate {
        providers.set_fallback(Arc::new(MemoryProvider::new()));
    }
    providers
}

/// Parse and validate a stack file, printing every validation error.
fn parse_and_validate(
    args: &StackArgs,
    providers: &ProviderRegistry,
) -> Result<StackFile, String> {
    let mut stack = parser::parse_stack_file(&args.file).map_err(|e| e.to_string())?;
    parser::apply_config_overrides(&mut stack, &args.config);
    let errors = parser::validate_stack(&stack, providers);
    if errors.is_empty() {
        return Ok(stack);
    }
    for e in &errors {
        eprintln!("  ERROR: {}", e);
    }
    Err(format!("{} validation error(s)", errors.len()))
}

fn load(args: &StackArgs, cancel: CancelToken, parallel: Option<usize>) -> Result<Loaded, String> {
    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(args.state_dir.clone()));
    let providers = registry(args, Arc::clone(&store));
    let stack = parse_and_validate(args, &providers)?;

    let resolver = OutputResolver::new();
    let graph = parser::build_graph(&stack, &resolver).map_err(|e| e.to_string())?;

    let mut policy = stack.policy.clone();
    if let Some(n) = parallel {
        policy.parallelism = n.max(1);
    }
    let ctx = RunContext::builder(&stack.name, providers, store)
        .policy(policy)
        .resolver(resolver)
        .cancel(cancel)
        .events(EventLog::new(&args.state_dir, &stack.name))
        .build();
    Ok(Loaded { stack, graph, ctx })
}

fn cmd_validate(args: &StackArgs) -> Result<(), String> {
    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(args.state_dir.clone()));
    let providers = registry(args, store);
    let stack = parse_and_validate(args, &providers)?;
    let graph = parser::build_graph(&stack, &OutputResolver::new()).map_err(|e| e.to_string())?;
    println!(
        "OK: {} ({} resources, {} outputs)",
        stack.name,
        graph.len(),
        graph.exports().len()
    );
    Ok(())
}

fn cmd_preview(args: &StackArgs) -> Result<(), String> {
    let loaded = load(args, CancelToken::new(), None)?;
    let plan = engine::preview(&loaded.graph, &loaded.ctx).map_err(|e| e.to_string())?;
    println!("{}", plan);
    Ok(())
}

/// Ask on stdin; anything but y/yes declines.
fn confirm(question: &str) -> Result<bool, String> {
    print!("{} [y/N] ", question);
    std::io::stdout().flush().map_err(|e| e.to_string())?;
    let mut answer = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut answer)
        .map_err(|e| format!("cannot read confirmation: {}", e))?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

/// Plan against the stored snapshot, confirm, then apply that same plan.
async fn plan_and_apply(
    loaded: &Loaded,
    graph: &Graph,
    yes: bool,
    question: &str,
) -> Result<Option<ApplyReport>, String> {
    let snapshot = engine::load_snapshot(&loaded.ctx).map_err(|e| e.to_string())?;
    let plan: Plan = planner::plan(graph, &snapshot, &loaded.ctx).map_err(|e| e.to_string())?;
    println!("{}", plan);
    println!();

    if !yes && !plan.is_empty() && !confirm(question)? {
        println!("Cancelled; nothing applied.");
        return Ok(None);
    }
    Ok(Some(executor::apply(&plan, graph, snapshot, &loaded.ctx).await))
}

fn summarize(report: &ApplyReport) -> Result<(), String> {
    println!("{}", report);
    for (resource, error) in &report.errors {
        eprintln!("  ERROR: {}: {}", resource, error);
    }
    if report.succeeded() {
        return Ok(());
    }
    Err(format!(
        "{} failed, {} skipped, {} cancelled",
        report.failed(),
        report.skipped(),
        report.cancelled()
    ))
}

async fn cmd_up(
    args: &StackArgs,
    yes: bool,
    parallel: Option<usize>,
    cancel: CancelToken,
) -> Result<(), String> {
    let loaded = load(args, cancel, parallel)?;
    let question = format!("Apply these changes to '{}'?", loaded.stack.name);
    match plan_and_apply(&loaded, &loaded.graph, yes, &question).await? {
        Some(report) => summarize(&report),
        None => Ok(()),
    }
}

async fn cmd_destroy(args: &StackArgs, yes: bool, cancel: CancelToken) -> Result<(), String> {
    let loaded = load(args, cancel, None)?;
    let question = format!("Destroy every resource of '{}'?", loaded.stack.name);
    match plan_and_apply(&loaded, &Graph::empty(), yes, &question).await? {
        Some(report) => summarize(&report),
        None => Ok(()),
    }
}

fn cmd_status(state_dir: &Path, only: Option<&str>) -> Result<(), String> {
    let store = FileStateStore::new(state_dir);
    let stacks = store.stacks().map_err(|e| e.to_string())?;

    let mut found = false;
    for name in stacks.iter().filter(|s| only.is_none_or(|o| o == s.as_str())) {
        let Some(snapshot) = store.load(name).map_err(|e| e.to_string())? else {
            continue;
        };
        found = true;
        println!("Stack: {}", snapshot.stack);
        println!("  Generator: {}", snapshot.generator);
        println!("  Resources: {}", snapshot.resources.len());
        for (id, rs) in &snapshot.resources {
            let parent = rs
                .parent
                .as_deref()
                .map(|p| format!(" (parent: {})", p))
                .unwrap_or_default();
            println!("    {}: [{}] {}{}", id, rs.resource_type, short_hash(&rs.hash), parent);
        }
        if !snapshot.outputs.is_empty() {
            println!("  Outputs: {}", snapshot.outputs.len());
        }
    }

    if !found {
        println!("No state found in {}", state_dir.display());
    }
    Ok(())
}

fn short_hash(hash: &str) -> &str {
    let end = hash.len().min("blake3:".len() + 12);
    hash.get(..end).unwrap_or(hash)
}

fn cmd_outputs(state_dir: &Path, stack: &str, json: bool) -> Result<(), String> {
    let snapshot = FileStateStore::new(state_dir)
        .load(stack)
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("no state for stack '{}' in {}", stack, state_dir.display()))?;

    if json {
        let text = serde_json::to_string_pretty(&snapshot.outputs).map_err(|e| e.to_string())?;
        println!("{}", text);
        return Ok(());
    }
    for (name, value) in &snapshot.outputs {
        println!("{} = {}", name, value.render());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::state_file_path;
    use crate::core::types::Value;

    const STACK: &str = r#"
version: "1.0"
name: demo
config:
  ns: lb
resources:
  ns:
    type: command
    inputs:
      create: 'echo "{{config.ns}}"'
  role:
    type: aws:iam/Role
    inputs:
      namespace: "${ns.stdout}"
  sa:
    type: command
    inputs:
      create: 'echo "sa-for-$INPUT_ROLE"'
      role: "${role.id}"
outputs:
  namespace: "${ns.stdout}"
  account: "${sa.stdout}"
"#;

    fn write_stack(dir: &Path, yaml: &str) -> StackArgs {
        let file = dir.join("stack.yaml");
        std::fs::write(&file, yaml).unwrap();
        StackArgs {
            file,
            state_dir: dir.join("state"),
            config: vec![],
            simulate: true,
        }
    }

    #[test]
    fn test_sf017_init() {
        let dir = tempfile::tempdir().unwrap();
        cmd_init(dir.path()).unwrap();
        assert!(dir.path().join("stack.yaml").exists());
        assert!(dir.path().join("state").is_dir());

        let args = StackArgs {
            file: dir.path().join("stack.yaml"),
            state_dir: dir.path().join("state"),
            config: vec![],
            simulate: false,
        };
        cmd_validate(&args).unwrap();
    }

    #[test]
    fn test_sf017_init_already_exists() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stack.yaml"), "x").unwrap();
        assert!(cmd_init(dir.path()).unwrap_err().contains("already exists"));
    }

    #[test]
    fn test_sf017_validate_requires_providers() {
        let dir = tempfile::tempdir().unwrap();
        let mut args = write_stack(dir.path(), STACK);
        cmd_validate(&args).unwrap();
        args.simulate = false;
        assert!(cmd_validate(&args).unwrap_err().contains("validation error"));
    }

    #[test]
    fn test_sf017_preview_does_not_write_state() {
        let dir = tempfile::tempdir().unwrap();
        let args = write_stack(dir.path(), STACK);
        cmd_preview(&args).unwrap();
        assert!(!state_file_path(&args.state_dir, "demo").exists());
    }

    #[tokio::test]
    async fn test_sf017_up_status_outputs_destroy() {
        let dir = tempfile::tempdir().unwrap();
        let args = write_stack(dir.path(), STACK);

        cmd_up(&args, true, Some(2), CancelToken::new()).await.unwrap();
        let snapshot = FileStateStore::new(&args.state_dir).load("demo").unwrap().unwrap();
        assert_eq!(snapshot.resources.len(), 3);
        assert_eq!(snapshot.outputs["namespace"], Value::from("lb"));
        let role_id = snapshot.resources["role"].outputs["id"].render();
        assert_eq!(
            snapshot.outputs["account"],
            Value::from(format!("sa-for-{}", role_id))
        );
        assert!(EventLog::new(&args.state_dir, "demo").path().exists());

        cmd_status(&args.state_dir, None).unwrap();
        cmd_outputs(&args.state_dir, "demo", true).unwrap();

        cmd_up(&args, true, None, CancelToken::new()).await.unwrap();
        let again = FileStateStore::new(&args.state_dir).load("demo").unwrap().unwrap();
        assert_eq!(again, snapshot);

        cmd_destroy(&args, true, CancelToken::new()).await.unwrap();
        let gone = FileStateStore::new(&args.state_dir).load("demo").unwrap().unwrap();
        assert!(gone.resources.is_empty());
        assert!(gone.outputs.is_empty());
    }

    #[tokio::test]
    async fn test_sf017_up_config_override() {
        let dir = tempfile::tempdir().unwrap();
        let mut args = write_stack(dir.path(), STACK);
        args.config = vec![("ns".into(), "kube-system".into())];
        cmd_up(&args, true, None, CancelToken::new()).await.unwrap();
        let snapshot = FileStateStore::new(&args.state_dir).load("demo").unwrap().unwrap();
        assert_eq!(snapshot.outputs["namespace"], Value::from("kube-system"));
    }

    #[tokio::test]
    async fn test_sf017_up_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = r#"
version: "1.0"
name: broken
resources:
  bad:
    type: command
    inputs:
      create: "echo nope >&2; exit 4"
  after:
    type: command
    inputs:
      create: "echo ${bad.stdout}"
  fine:
    type: command
    inputs:
      create: "echo ok"
"#;
        let args = write_stack(dir.path(), yaml);
        let err = cmd_up(&args, true, None, CancelToken::new()).await.unwrap_err();
        assert_eq!(err, "1 failed, 1 skipped, 0 cancelled");
        let snapshot = FileStateStore::new(&args.state_dir).load("broken").unwrap().unwrap();
        assert!(snapshot.resources.contains_key("fine"));
        assert!(!snapshot.resources.contains_key("after"));
    }

    #[test]
    fn test_sf017_status_empty() {
        let dir = tempfile::tempdir().unwrap();
        cmd_status(dir.path(), None).unwrap();
        cmd_status(&dir.path().join("missing"), Some("x")).unwrap();
    }

    #[test]
    fn test_sf017_outputs_missing_stack() {
        let dir = tempfile::tempdir().unwrap();
        assert!(cmd_outputs(dir.path(), "nope", false)
            .unwrap_err()
            .contains("no state"));
    }

    #[test]
    fn test_sf017_short_hash() {
        assert_eq!(short_hash("blake3:0123456789abcdef"), "blake3:0123456789ab");
        assert_eq!(short_hash("x"), "x");
    }

    #[test]
    fn test_sf017_cli_parses_overrides() {
        let cli = Cli::try_parse_from([
            "stackform", "-v", "up", "--yes", "-p", "3", "-c", "ns=prod", "--simulate",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 1);
        match cli.command {
            Commands::Up {
                stack,
                yes,
                parallel,
            } => {
                assert!(yes);
                assert_eq!(parallel, Some(3));
                assert_eq!(stack.config, vec![("ns".to_string(), "prod".to_string())]);
                assert!(stack.simulate);
                assert_eq!(stack.file, PathBuf::from("stack.yaml"));
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert!(Cli::try_parse_from(["stackform", "up", "-c", "novalue"]).is_err());
    }
}
