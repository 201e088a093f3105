use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use convoy::pipeline::ExecContext;
use convoy::{
    BuiltinRepository, Environment, Error, Hostfile, Module, OrchestratorStore, Pipeline,
    PipelineOutcome, ResourceGraph, SshProbe,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "convoy")]
#[command(version = VERSION)]
#[command(about = "Deployment and lifecycle orchestration for multi-node pipelines")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pipeline lifecycle operations
    #[command(subcommand, visible_alias = "pipeline")]
    Ppl(PplCommand),
    /// Named environment management
    #[command(subcommand)]
    Env(EnvCommand),
    /// Module declaration files
    #[command(subcommand)]
    Mod(ModCommand),
    /// Resource graph discovery and queries
    #[command(subcommand, visible_alias = "graph")]
    Rg(RgCommand),
    /// Hostfile management
    #[command(subcommand)]
    Hostfile(HostfileCommand),
}

#[derive(Subcommand)]
enum PplCommand {
    /// Create an empty pipeline
    Create { name: String },
    /// List pipeline names
    List,
    /// Show a pipeline record
    Show { name: String },
    /// Append a package; trailing key=value tokens become its config
    Append {
        pipeline: String,
        package: String,
        #[arg(trailing_var_arg = true)]
        config: Vec<String>,
    },
    /// Remove the first package matching a name or ordinal
    Rm { pipeline: String, selector: String },
    /// Reference a named environment as the pipeline's global scope
    UseEnv { pipeline: String, env: String },
    /// Reference a named hostfile for placement
    UseHostfile { pipeline: String, hostfile: String },
    /// Apply configuration to every package
    Configure { name: String },
    /// Start packages in declared order
    Start { name: String },
    /// Configure where needed, then start
    Run { name: String },
    /// Graceful shutdown in reverse order
    Stop { name: String },
    /// Forced termination in reverse order
    Kill { name: String },
    /// Wipe runtime artifacts, keep config
    Clean { name: String },
    /// Re-apply configuration to configured or running packages
    Update { name: String },
    /// Probe liveness and report drift
    Status { name: String },
    /// Tear down and delete the pipeline record
    Destroy { name: String },
}

#[derive(Subcommand)]
enum EnvCommand {
    /// Snapshot the process environment plus KEY=value / module:<name> sources
    Build {
        name: String,
        sources: Vec<String>,
    },
    /// List environment names
    List,
    /// Render the merged environment
    Show { name: String },
    /// Duplicate an environment under a new name
    Copy {
        src: String,
        dst: String,
        #[arg(long)]
        overwrite: bool,
    },
    /// Prepend a value to a sequence variable
    Prepend {
        name: String,
        var: String,
        value: String,
    },
    /// Append a value to a sequence variable
    Append {
        name: String,
        var: String,
        value: String,
    },
    /// Delete an environment record
    Destroy { name: String },
}

#[derive(Subcommand)]
enum ModCommand {
    /// Create a module file from --prepend VAR=path and --setenv VAR=value
    Create {
        name: String,
        #[arg(long = "prepend", value_name = "VAR=PATH")]
        prepends: Vec<String>,
        #[arg(long = "setenv", value_name = "VAR=VALUE")]
        setenvs: Vec<String>,
    },
    /// List module names
    List,
}

#[derive(Subcommand)]
enum RgCommand {
    /// Probe targets (or a named hostfile) and persist the graph
    Build {
        targets: Vec<String>,
        #[arg(long)]
        hostfile: Option<String>,
    },
    /// Summary of the persisted graph
    Info,
    /// Nodes owning at least one device of the given type
    Filter { device_type: String },
    /// Dump the persisted graph
    Show,
}

#[derive(Subcommand)]
enum HostfileCommand {
    /// Parse a hostfile (bracket ranges expanded) and store it under a name
    Import { name: String, path: PathBuf },
    /// List stored hostfile names
    List,
    /// Show the expanded hosts of a stored hostfile
    Show { name: String },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(cli.command) {
        Ok(code) => code,
        Err(err) => {
            print_error(&err);
            ExitCode::FAILURE
        }
    }
}

fn dispatch(command: Commands) -> Result<ExitCode, Error> {
    match command {
        Commands::Ppl(cmd) => ppl(cmd),
        Commands::Env(cmd) => env(cmd),
        Commands::Mod(cmd) => module(cmd),
        Commands::Rg(cmd) => rg(cmd),
        Commands::Hostfile(cmd) => hostfile(cmd),
    }
}

fn ppl(cmd: PplCommand) -> Result<ExitCode, Error> {
    match cmd {
        PplCommand::Create { name } => {
            let pipeline = Pipeline::create(&name)?;
            print_json(&pipeline);
            Ok(ExitCode::SUCCESS)
        }
        PplCommand::List => {
            print_json(&Pipeline::list()?);
            Ok(ExitCode::SUCCESS)
        }
        PplCommand::Show { name } => {
            print_json(&Pipeline::load(&name)?);
            Ok(ExitCode::SUCCESS)
        }
        PplCommand::Append {
            pipeline,
            package,
            config,
        } => {
            let config = parse_config(&config)?;
            let mut ppl = Pipeline::load(&pipeline)?;
            ppl.append(&BuiltinRepository::new(), &package, config)?;
            print_json(&ppl);
            Ok(ExitCode::SUCCESS)
        }
        PplCommand::Rm { pipeline, selector } => {
            let mut ppl = Pipeline::load(&pipeline)?;
            let removed = ppl.rm(&selector)?;
            print_json(&removed);
            Ok(ExitCode::SUCCESS)
        }
        PplCommand::UseEnv { pipeline, env } => {
            Environment::load(&env)?;
            let mut ppl = Pipeline::load(&pipeline)?;
            ppl.environment_ref = Some(env);
            ppl.save()?;
            print_json(&ppl);
            Ok(ExitCode::SUCCESS)
        }
        PplCommand::UseHostfile { pipeline, hostfile } => {
            Hostfile::load_named(&hostfile)?;
            let mut ppl = Pipeline::load(&pipeline)?;
            ppl.hostfile_ref = Some(hostfile);
            ppl.save()?;
            print_json(&ppl);
            Ok(ExitCode::SUCCESS)
        }
        PplCommand::Configure { name } => lifecycle(&name, |ppl, ctx| ppl.configure(ctx)),
        PplCommand::Start { name } => lifecycle(&name, |ppl, ctx| ppl.start(ctx)),
        PplCommand::Run { name } => lifecycle(&name, |ppl, ctx| ppl.run(ctx)),
        PplCommand::Stop { name } => lifecycle(&name, |ppl, ctx| ppl.stop(ctx)),
        PplCommand::Kill { name } => lifecycle(&name, |ppl, ctx| ppl.kill(ctx)),
        PplCommand::Clean { name } => lifecycle(&name, |ppl, ctx| ppl.clean(ctx)),
        PplCommand::Update { name } => lifecycle(&name, |ppl, ctx| ppl.update(ctx)),
        PplCommand::Status { name } => {
            let store = OrchestratorStore::open()?;
            let guard = store.graph()?;
            let pipeline = Pipeline::load(&name)?;
            let repository = BuiltinRepository::new();
            let hosts = pipeline.placement(guard.as_ref())?;
            let ctx = ExecContext::new(&repository, hosts);
            let report = pipeline.status(&ctx)?;
            print_json(&report);
            Ok(ExitCode::SUCCESS)
        }
        PplCommand::Destroy { name } => {
            let store = OrchestratorStore::open()?;
            let guard = store.graph()?;
            let pipeline = Pipeline::load(&name)?;
            let repository = BuiltinRepository::new();
            let hosts = pipeline.placement(guard.as_ref())?;
            let ctx = ExecContext::new(&repository, hosts);
            let report = pipeline.destroy(&ctx)?;
            print_json(&report);
            Ok(outcome_exit(report.outcome))
        }
    }
}

fn lifecycle(
    name: &str,
    op: impl FnOnce(&mut Pipeline, &ExecContext) -> Result<convoy::PipelineReport, Error>,
) -> Result<ExitCode, Error> {
    let store = OrchestratorStore::open()?;
    // Holding the read guard for the whole command serializes against any
    // concurrent graph rebuild.
    let guard = store.graph()?;
    let mut pipeline = Pipeline::load(name)?;
    let repository = BuiltinRepository::new();
    let hosts = pipeline.placement(guard.as_ref())?;
    let ctx = ExecContext::new(&repository, hosts);
    let report = op(&mut pipeline, &ctx)?;
    print_json(&report);
    Ok(outcome_exit(report.outcome))
}

fn env(cmd: EnvCommand) -> Result<ExitCode, Error> {
    match cmd {
        EnvCommand::Build { name, sources } => {
            let env = Environment::build(&name, &sources)?;
            print_json(&env);
        }
        EnvCommand::List => print_json(&Environment::list()?),
        EnvCommand::Show { name } => print_json(&Environment::load(&name)?.show()),
        EnvCommand::Copy {
            src,
            dst,
            overwrite,
        } => print_json(&Environment::copy(&src, &dst, overwrite)?),
        EnvCommand::Prepend { name, var, value } => {
            let mut env = Environment::load(&name)?;
            env.prepend(&var, &value);
            env.save()?;
            print_json(&env);
        }
        EnvCommand::Append { name, var, value } => {
            let mut env = Environment::load(&name)?;
            env.append(&var, &value);
            env.save()?;
            print_json(&env);
        }
        EnvCommand::Destroy { name } => {
            Environment::delete(&name)?;
            print_json(&serde_json::json!({ "deleted": name }));
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn module(cmd: ModCommand) -> Result<ExitCode, Error> {
    match cmd {
        ModCommand::Create {
            name,
            prepends,
            setenvs,
        } => {
            let mut module = Module {
                name: name.clone(),
                ..Default::default()
            };
            for decl in &prepends {
                let (var, path) = split_pair(decl)?;
                module.prepends.entry(var).or_default().push(path);
            }
            for decl in &setenvs {
                let (var, value) = split_pair(decl)?;
                module.setenvs.insert(var, value);
            }
            module.save()?;
            print_json(&module);
        }
        ModCommand::List => print_json(&Module::list()?),
    }
    Ok(ExitCode::SUCCESS)
}

fn rg(cmd: RgCommand) -> Result<ExitCode, Error> {
    match cmd {
        RgCommand::Build { targets, hostfile } => {
            let targets = match hostfile {
                Some(name) => Hostfile::load_named(&name)?.hosts,
                None if targets.is_empty() => Hostfile::localhost().hosts,
                None => targets,
            };
            let store = OrchestratorStore::open()?;
            let graph = store.rebuild_graph(&targets, Arc::new(SshProbe))?;
            print_json(&graph.summary());
        }
        RgCommand::Info => {
            let graph = ResourceGraph::load(&ResourceGraph::path()?)?;
            print_json(&graph.summary());
        }
        RgCommand::Filter { device_type } => {
            let graph = ResourceGraph::load(&ResourceGraph::path()?)?;
            print_json(&graph.filter(&device_type));
        }
        RgCommand::Show => {
            let graph = ResourceGraph::load(&ResourceGraph::path()?)?;
            print_json(&graph);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn hostfile(cmd: HostfileCommand) -> Result<ExitCode, Error> {
    match cmd {
        HostfileCommand::Import { name, path } => {
            let hostfile = Hostfile::load(&path)?;
            hostfile.save_named(&name)?;
            print_json(&serde_json::json!({ "name": name, "hosts": hostfile.hosts }));
        }
        HostfileCommand::List => print_json(&Hostfile::list()?),
        HostfileCommand::Show { name } => {
            print_json(&Hostfile::load_named(&name)?.hosts);
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Trailing tokens pass through verbatim as key=value package config.
fn parse_config(tokens: &[String]) -> Result<BTreeMap<String, String>, Error> {
    let mut config = BTreeMap::new();
    for token in tokens {
        let (key, value) = split_pair(token)?;
        config.insert(key, value);
    }
    Ok(config)
}

fn split_pair(token: &str) -> Result<(String, String), Error> {
    match token.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(Error::validation_invalid_argument(
            "config",
            "Expected KEY=value",
            Some(token.to_string()),
            None,
        )),
    }
}

/// Partial failure still exits 0: something is live and the table says what.
fn outcome_exit(outcome: PipelineOutcome) -> ExitCode {
    match outcome {
        PipelineOutcome::Success | PipelineOutcome::PartialFailure => ExitCode::SUCCESS,
        PipelineOutcome::Failed => ExitCode::FAILURE,
    }
}

fn print_json(value: &impl serde::Serialize) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(err) => eprintln!("serialization error: {}", err),
    }
}

fn print_error(err: &Error) {
    let payload = serde_json::json!({
        "error": {
            "code": err.code.as_str(),
            "message": err.message,
            "details": err.details,
            "hints": err.hints,
        }
    });
    match serde_json::to_string_pretty(&payload) {
        Ok(json) => eprintln!("{}", json),
        Err(_) => eprintln!("{}", err.message),
    }
}
