#![warn(missing_docs)]

//! sandpit command-line front end.
//!
//! Builds host documents, previews bundles in an isolated context and grades
//! submissions against question files.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sandpit_config::SandpitConfig;
use sandpit_sandbox::audit::{AuditLogger, JsonLinesAuditLogger, TracingAuditLogger};
use sandpit_sandbox::context::{LocalFileResolver, NoNetwork};
use sandpit_sandbox::document::RuntimeLibraries;
use sandpit_sandbox::{
    Capabilities, ConsoleAggregator, ContextConfig, ContextManager, DocumentBuilder,
    DocumentOptions, EvaluationConfig, ExecutionMode, Preview, Question, RunnerConfig,
    ScriptResolver, SourceBundle, TargetOrigin, TestRunner,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sandpit", version, about = "Run untrusted assessment code in isolated contexts")]
struct Cli {
    /// Config file (defaults to $SANDPIT_CONFIG, then ./sandpit.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug)]
struct BundleArgs {
    /// Script file.
    script: PathBuf,

    /// Markup file placed in the document body.
    #[arg(long)]
    markup: Option<PathBuf>,

    /// Stylesheet file.
    #[arg(long)]
    styles: Option<PathBuf>,

    /// vanilla-dom, react-component or pure-logic.
    #[arg(long, default_value = "vanilla-dom")]
    mode: ExecutionMode,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the host document for a bundle.
    Render {
        #[command(flatten)]
        bundle: BundleArgs,

        /// Wrap the document in a sandboxed iframe element.
        #[arg(long)]
        iframe: bool,

        /// Include the proctoring hooks.
        #[arg(long)]
        proctoring: bool,
    },
    /// Run a bundle in a preview context and print its events as JSON lines.
    Run {
        #[command(flatten)]
        bundle: BundleArgs,

        /// How long to keep the context alive, in milliseconds.
        #[arg(long, default_value_t = 1000)]
        wait_ms: u64,
    },
    /// Grade a submission against a question file.
    Test {
        /// Question JSON file.
        question: PathBuf,

        /// Submission source file.
        code: PathBuf,

        /// Print results as JSON.
        #[arg(long)]
        json: bool,

        /// Append audit entries as JSON lines to this file.
        #[arg(long)]
        audit_log: Option<PathBuf>,
    },
}

/// Everything built from the config file.
struct Settings {
    documents: DocumentOptions,
    contexts: ContextConfig,
    runner: RunnerConfig,
    resolver: Arc<dyn ScriptResolver>,
}

/// Locate the config file.
///
/// Search order:
/// 1. `--config`
/// 2. `SANDPIT_CONFIG` environment variable
/// 3. `./sandpit.toml` in the current directory
fn find_config_file(explicit: Option<PathBuf>) -> Option<PathBuf> {
    if explicit.is_some() {
        return explicit;
    }
    if let Ok(path) = std::env::var("SANDPIT_CONFIG") {
        let p = PathBuf::from(path);
        if p.exists() {
            return Some(p);
        }
    }
    let cwd = PathBuf::from("sandpit.toml");
    cwd.exists().then_some(cwd)
}

fn build_settings(config: &SandpitConfig) -> Settings {
    let sandbox = &config.sandbox;

    let mut evaluation = EvaluationConfig::default();
    let mut runner = RunnerConfig::default();
    if let Some(secs) = sandbox.test_timeout_secs {
        runner.test_timeout = Duration::from_secs(secs);
        evaluation.timeout = runner.test_timeout;
    }
    if let Some(kb) = sandbox.max_code_kb {
        evaluation.max_code_size = kb * 1024;
    }
    if let Some(parallelism) = sandbox.parallelism {
        runner.parallelism = parallelism;
    }

    let mut contexts = ContextConfig::default();
    if let Some(mb) = sandbox.max_heap_mb {
        contexts.max_heap_size = mb * 1024 * 1024;
        evaluation.max_heap_size = contexts.max_heap_size;
    }
    if let Some(max) = sandbox.max_live_contexts {
        contexts.max_live_contexts = max;
    }
    if let Some(ref origin) = config.relay.host_origin {
        contexts.host_origin = origin.clone();
    }
    runner.evaluation = evaluation;

    let mut documents = DocumentOptions {
        max_part_size: runner.evaluation.max_code_size,
        ..Default::default()
    };
    if let Some(ref target) = config.relay.target_origin {
        documents.target_origin = TargetOrigin::parse(target);
    }
    let runtime = &config.runtime;
    let defaults = RuntimeLibraries::default();
    documents.runtime = RuntimeLibraries {
        react_url: runtime.react_url.clone().unwrap_or(defaults.react_url),
        react_dom_url: runtime.react_dom_url.clone().unwrap_or(defaults.react_dom_url),
        babel_url: runtime.babel_url.clone().unwrap_or(defaults.babel_url),
    };

    let resolver: Arc<dyn ScriptResolver> = if runtime.local.is_empty() {
        Arc::new(NoNetwork)
    } else {
        Arc::new(LocalFileResolver::new(runtime.local.clone()))
    };

    Settings {
        documents,
        contexts,
        runner,
        resolver,
    }
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn load_bundle(args: &BundleArgs) -> Result<SourceBundle> {
    let mut bundle = SourceBundle::script(args.mode, read(&args.script)?);
    if let Some(ref markup) = args.markup {
        bundle = bundle.with_markup(read(markup)?);
    }
    if let Some(ref styles) = args.styles {
        bundle = bundle.with_styles(read(styles)?);
    }
    Ok(bundle)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match find_config_file(cli.config) {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading config");
            SandpitConfig::from_file_with_env(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))?
        }
        None => {
            tracing::debug!("no config file found, using defaults");
            SandpitConfig::default()
        }
    };
    let settings = build_settings(&config);
    let builder = DocumentBuilder::new(settings.documents.clone());
    let contexts = Arc::new(ContextManager::with_resolver(
        settings.contexts.clone(),
        settings.resolver.clone(),
    ));

    match cli.command {
        Command::Render {
            bundle,
            iframe,
            proctoring,
        } => {
            let bundle = load_bundle(&bundle)?;
            let caps = match bundle.mode {
                ExecutionMode::ReactComponent => Capabilities::react_preview(),
                _ => Capabilities::live_preview(),
            };
            let caps = if proctoring { caps.with_proctoring() } else { caps };
            let document = builder.build(&bundle, caps)?;
            if iframe {
                println!("{}", document.to_iframe("Preview"));
            } else {
                println!("{}", document.render());
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Run { bundle, wait_ms } => {
            let bundle = load_bundle(&bundle)?;
            let log = Arc::new(ConsoleAggregator::new());
            let mut preview = Preview::new(builder, contexts, log.clone());
            let session = preview.render(&bundle).await;
            tokio::time::sleep(Duration::from_millis(wait_ms)).await;
            preview.dispose();

            for entry in log.for_session(session) {
                println!("{}", serde_json::to_string(&entry)?);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Test {
            question,
            code,
            json,
            audit_log,
        } => {
            let question: Question = serde_json::from_str(&read(&question)?)
                .with_context(|| format!("invalid question file {}", question.display()))?;
            let code = read(&code)?;

            let audit: Arc<dyn AuditLogger> = match audit_log {
                Some(path) => {
                    let file = tokio::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&path)
                        .await
                        .with_context(|| format!("failed to open {}", path.display()))?;
                    Arc::new(JsonLinesAuditLogger::new(file))
                }
                None => Arc::new(TracingAuditLogger),
            };
            let runner = TestRunner::new(settings.runner, builder, contexts).with_audit_logger(audit);
            let results = runner.run_tests(&question, &code).await;

            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                for result in &results {
                    let verdict = if result.passed { "PASS" } else { "FAIL" };
                    match &result.error {
                        Some(error) => println!(
                            "{verdict} {} ({}ms): {error}",
                            result.test_case.id, result.duration_ms
                        ),
                        None => println!("{verdict} {} ({}ms)", result.test_case.id, result.duration_ms),
                    }
                }
            }

            let failed = results.iter().filter(|r| !r.passed).count();
            println!("{} passed, {failed} failed", results.len() - failed);
            Ok(if failed == 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_apply_overrides() {
        let config = SandpitConfig::from_toml(
            r#"
            [sandbox]
            test_timeout_secs = 5
            max_heap_mb = 32
            max_code_kb = 16
            max_live_contexts = 4
            parallelism = 2

            [relay]
            host_origin = "https://app.example.com"
            target_origin = "*"

            [runtime]
            react_url = "https://cdn.example.com/react.js"
            "#,
        )
        .unwrap();
        let settings = build_settings(&config);
        assert_eq!(settings.runner.test_timeout, Duration::from_secs(5));
        assert_eq!(settings.runner.evaluation.timeout, Duration::from_secs(5));
        assert_eq!(settings.runner.parallelism, 2);
        assert_eq!(settings.runner.evaluation.max_heap_size, 32 * 1024 * 1024);
        assert_eq!(settings.documents.max_part_size, 16 * 1024);
        assert_eq!(settings.documents.target_origin, TargetOrigin::Wildcard);
        assert_eq!(settings.documents.runtime.react_url, "https://cdn.example.com/react.js");
        assert_eq!(settings.contexts.max_live_contexts, 4);
        assert_eq!(settings.contexts.host_origin, "https://app.example.com");
    }

    #[test]
    fn settings_default_without_config() {
        let settings = build_settings(&SandpitConfig::default());
        assert_eq!(settings.runner.test_timeout, Duration::from_secs(10));
        assert_eq!(settings.runner.parallelism, 1);
        assert_eq!(settings.documents.runtime, RuntimeLibraries::default());
        assert_eq!(
            settings.contexts.max_live_contexts,
            sandpit_config::DEFAULT_MAX_LIVE_CONTEXTS
        );
    }

    #[test]
    fn cli_parses_test_command() {
        let cli = Cli::try_parse_from(["sandpit", "test", "q.json", "answer.js", "--json"]).unwrap();
        assert!(matches!(cli.command, Command::Test { json: true, .. }));
    }

    #[test]
    fn cli_parses_mode() {
        let cli = Cli::try_parse_from(["sandpit", "render", "app.jsx", "--mode", "react-component"])
            .unwrap();
        match cli.command {
            Command::Render { bundle, .. } => assert_eq!(bundle.mode, ExecutionMode::ReactComponent),
            other => panic!("unexpected {other:?}"),
        }
    }
}
