use anyhow::Result;
use clap::{Parser, Subcommand};
use cogito_agent::chain::{ReasoningConfig, StepKind};
use cogito_agent::clients::OpenAIClient;
use cogito_agent::core::ReasoningEngine;
use cogito_agent::tools::default_tools;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::io::{self, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "cogito-agent")]
#[command(version = "0.1.0")]
#[command(about = "ReAct reasoning agent with tool calling", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true)]
    api_key: Option<String>,

    #[arg(short, long, global = true, default_value = "gpt-4o")]
    model: String,

    #[arg(short, long, global = true, help = "Base URL for the LLM API")]
    base_url: Option<String>,

    #[arg(short, long, global = true, default_value = ".")]
    workdir: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Solve a single task")]
    Run {
        #[arg(short, long, help = "Task description")]
        task: String,

        #[arg(long, help = "Maximum reasoning iterations")]
        max_iterations: Option<usize>,

        #[arg(long, help = "Maximum tool calls per chain")]
        max_tool_calls: Option<usize>,

        #[arg(long, help = "Overall chain timeout in seconds")]
        timeout: Option<u64>,

        #[arg(long, help = "Print every step as it happens")]
        verbose: bool,
    },

    #[command(about = "Interactive mode")]
    Interactive {
        #[arg(long, help = "Maximum reasoning iterations")]
        max_iterations: Option<usize>,

        #[arg(long, help = "Print every step as it happens")]
        verbose: bool,
    },

    #[command(about = "List registered tools")]
    Tools,
}

fn get_api_key() -> Result<String> {
    std::env::var("OPENAI_API_KEY").map_err(|_| {
        anyhow::anyhow!(
            "API key not found. Set OPENAI_API_KEY or use the --api-key flag."
        )
    })
}

fn build_config(
    max_iterations: Option<usize>,
    max_tool_calls: Option<usize>,
    timeout: Option<u64>,
    verbose: bool,
) -> ReasoningConfig {
    let mut config = ReasoningConfig::default();
    if let Some(max_iterations) = max_iterations {
        config.max_iterations = max_iterations;
    }
    if let Some(max_tool_calls) = max_tool_calls {
        config.max_tool_calls = max_tool_calls;
    }
    if let Some(timeout) = timeout {
        config.timeout = Duration::from_secs(timeout);
    }
    config.verbose = verbose;
    config
}

fn build_engine(args: &Args, config: ReasoningConfig) -> Result<ReasoningEngine> {
    let api_key = match &args.api_key {
        Some(key) => key.clone(),
        None => get_api_key()?,
    };

    let client = OpenAIClient::new(api_key, args.model.clone(), args.base_url.clone());
    let registry = Arc::new(default_tools(args.workdir.clone()));

    let mut engine = ReasoningEngine::new(Box::new(client), registry, config);
    engine.set_step_callback(Arc::new(|step| {
        match &step.kind {
            StepKind::Thought { text } if !text.is_empty() => {
                println!("Thought: {text}");
            }
            StepKind::Thought { .. } => {}
            StepKind::ToolCall {
                tool_name,
                arguments,
                call_id,
            } => {
                println!("Action [{call_id}]: {tool_name} {arguments}");
            }
            StepKind::ToolResult {
                call_id,
                success,
                output,
                error,
                ..
            } => {
                if *success {
                    let output = output.as_ref().map(|v| v.to_string()).unwrap_or_default();
                    println!("Observation [{call_id}]: {output}");
                } else {
                    let error = error.clone().unwrap_or_default();
                    println!("Observation [{call_id}]: failed: {error}");
                }
            }
            StepKind::Observation { text } => println!("Observation: {text}"),
            StepKind::Answer { text } => println!("Answer: {text}"),
            StepKind::Error { text } => println!("Error: {text}"),
        }
    }));

    Ok(engine)
}

async fn solve_and_report(engine: &ReasoningEngine, task: &str) {
    let cancel = CancellationToken::new();
    let interrupt = CancellationToken::clone(&cancel);
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let result = engine.solve_with_cancellation(task, cancel).await;
    ctrl_c.abort();

    println!();
    if result.success {
        println!(
            "=== Completed in {} iterations, {} tool calls, {:.1}s ===",
            result.stats.iterations,
            result.stats.tool_calls,
            result.stats.elapsed.as_secs_f64()
        );
        if let Some(answer) = &result.final_answer {
            println!("{answer}");
        }
    } else {
        println!("=== Stopped: {:?} ===", result.stop_reason);
        if let Some(error) = &result.error {
            println!("{error}");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    match &args.command {
        Commands::Run {
            task,
            max_iterations,
            max_tool_calls,
            timeout,
            verbose,
        } => {
            let config = build_config(*max_iterations, *max_tool_calls, *timeout, *verbose);
            let engine = build_engine(&args, config)?;

            println!("Task: {task}");
            println!("Working directory: {:?}", args.workdir);
            println!("Press Ctrl+C to interrupt...\n");

            solve_and_report(&engine, task).await;
        }

        Commands::Interactive {
            max_iterations,
            verbose,
        } => {
            let config = build_config(*max_iterations, None, None, *verbose);
            let engine = build_engine(&args, config)?;

            println!("Interactive mode. Type 'exit' or 'quit' to end.");
            println!("Working directory: {:?}\n", args.workdir);

            let stdin = tokio::io::stdin();
            let mut reader = tokio::io::BufReader::new(stdin);
            let mut line = String::new();

            loop {
                print!("> ");
                io::stdout().flush().await?;

                line.clear();
                if reader.read_line(&mut line).await? == 0 {
                    break;
                }

                let input = line.trim();
                if input.is_empty() {
                    continue;
                }
                if input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit") {
                    println!("Goodbye!");
                    break;
                }

                solve_and_report(&engine, input).await;
                println!();
            }
        }

        Commands::Tools => {
            let registry = default_tools(args.workdir.clone());
            println!("{} registered tools:", registry.len());
            for definition in registry.definitions_for_model() {
                println!("  - {}: {}", definition.name, definition.description);
            }
        }
    }

    Ok(())
}
