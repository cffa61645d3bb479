//! CLI execution and command dispatch logic.
//!
//! Keeps `main` minimal: loads the rulefile, registers its stanzas, freezes
//! the graph, and hands the requested targets to the scheduler.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use tracing::debug;

use crate::cli::{BuildArgs, Cli, Commands};
use crate::exec::ExecMode;
use crate::graph::{BuildGraph, GraphBuilder};
use crate::rulefile;
use crate::schedule::{self, BuildOptions, Request};

/// Default rulefile name.
pub const RULEFILE_NAME: &str = "Kumadefile";

/// Execute the parsed [`Cli`] command.
///
/// # Errors
///
/// Returns an error when the rulefile cannot be loaded or translated; build
/// failures are reported through the exit code instead, after printing every
/// collected failure.
pub async fn run(cli: &Cli) -> Result<ExitCode> {
    let root = cli
        .directory
        .clone()
        .unwrap_or_else(|| Utf8PathBuf::from("."));
    let rulefile_path = root.join(&cli.file);
    let parsed = rulefile::load_path(&rulefile_path)
        .with_context(|| format!("loading rulefile {rulefile_path}"))?;

    let mut builder = GraphBuilder::new();
    rulefile::register(parsed, &root, &mut builder)
        .with_context(|| format!("registering rules from {rulefile_path}"))?;
    let graph = Arc::new(builder.freeze());
    debug!(targets = graph.target_count(), "graph frozen");

    let command = cli
        .command
        .clone()
        .unwrap_or_else(|| Commands::Build(BuildArgs::default()));
    match command {
        Commands::Graph => {
            print_graph(&graph);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Build(args) => build(cli, &graph, &root, &args).await,
    }
}

async fn build(
    cli: &Cli,
    graph: &Arc<BuildGraph>,
    root: &Utf8PathBuf,
    args: &BuildArgs,
) -> Result<ExitCode> {
    let requests = resolve_requests(graph, &args.targets);
    if requests.is_empty() {
        println!("nothing to build: no targets or aliases registered");
        return Ok(ExitCode::SUCCESS);
    }

    let mut options = BuildOptions {
        fail_fast: cli.fail_fast,
        ..BuildOptions::default()
    };
    if let Some(jobs) = cli.jobs {
        options.jobs = jobs;
    }
    if cli.sandbox {
        options.mode = ExecMode::Sandboxed;
    }

    let report = schedule::run(Arc::clone(graph), root.clone(), requests, &options).await;
    for failure in &report.failures {
        eprintln!("error: {}: {}", failure.request, failure.error);
    }
    for halted in &report.halted {
        eprintln!("halted: {halted} (not started after earlier failure)");
    }
    if report.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

/// Map requested names onto aliases (preferred) or file targets. With no
/// names given, build every alias, or every target when none is registered.
fn resolve_requests(graph: &BuildGraph, names: &[String]) -> Vec<Request> {
    if names.is_empty() {
        let aliases: Vec<Request> = graph
            .aliases()
            .map(|alias| Request::Alias(alias.id.name.clone()))
            .collect();
        if !aliases.is_empty() {
            return aliases;
        }
        return graph
            .targets()
            .map(|target| Request::Target(target.clone()))
            .collect();
    }
    names
        .iter()
        .map(|name| {
            if graph.find_alias(name).is_some() {
                Request::Alias(name.clone())
            } else {
                Request::Target(name.as_str().into())
            }
        })
        .collect()
}

fn print_graph(graph: &BuildGraph) {
    println!("targets:");
    for target in graph.targets() {
        println!("  {target}");
    }
    println!("aliases:");
    for alias in graph.aliases() {
        println!("  {}", alias.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::Action;
    use crate::expr::need_paths;
    use crate::graph::TargetSpec;
    use crate::path::{PathSet, path_set};

    fn sample_graph() -> BuildGraph {
        let mut builder = GraphBuilder::new();
        builder
            .register_rule(
                TargetSpec::Declared(path_set(["a.o"])),
                need_paths(PathSet::default()),
                Action::Command {
                    program: "touch".into(),
                    args: vec!["a.o".into()],
                },
            )
            .expect("register");
        builder.register_alias("all", ".", need_paths(path_set(["a.o"])), None);
        builder.freeze()
    }

    #[test]
    fn default_requests_prefer_aliases() {
        let graph = sample_graph();
        let requests = resolve_requests(&graph, &[]);
        assert_eq!(requests.len(), 1);
        assert!(matches!(requests.first(), Some(Request::Alias(name)) if name == "all"));
    }

    #[test]
    fn named_requests_distinguish_aliases_from_targets() {
        let graph = sample_graph();
        let requests = resolve_requests(&graph, &["all".to_owned(), "a.o".to_owned()]);
        assert!(matches!(requests.first(), Some(Request::Alias(_))));
        assert!(matches!(requests.get(1), Some(Request::Target(_))));
    }
}
