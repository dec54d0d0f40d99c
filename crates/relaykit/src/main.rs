use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use relaykit::{
    AsyncFnHandler, CancellationToken, Feedback, ListenerConfig, ListenerPool, PipelineBuilder,
    ProcessStateToken, Pusher, version_line,
};

const USAGE: &str = "Usage: relaykit-demo <pool|feedback|pipeline|pause> [--parallelism N] [--items N]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Pool,
    Feedback,
    Pipeline,
    Pause,
}

#[derive(Debug)]
struct Args {
    command: Command,
    parallelism: Option<usize>,
    items: u64,
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("{}", version_line("relaykit-demo"));
        return;
    }

    let args = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            eprintln!();
            eprintln!("Commands:");
            eprintln!("  pool         Fan items out to a listener pool and sum them");
            eprintln!("  feedback     Stream values through a single-slot channel");
            eprintln!("  pipeline     Run a staged pipeline sync and async");
            eprintln!("  pause        Pause and resume a busy pool");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --parallelism <n>  Worker count [default: $RELAYKIT_PARALLELISM or CPUs]");
            eprintln!("  --items <n>        Number of items to process [default: 100]");
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(args).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

/// `RUST_LOG` wins; otherwise `RELAYKIT_LOG` picks the level for our targets.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("RELAYKIT_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("relaykit={level},relaykit_demo={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut command: Option<Command> = None;
    let mut parallelism = None;
    let mut items = 100;

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--parallelism" => {
                i += 1;
                let value = args.get(i).ok_or("--parallelism requires a value")?;
                parallelism = Some(
                    value
                        .parse()
                        .map_err(|_| format!("invalid --parallelism '{value}'"))?,
                );
            }
            "--items" => {
                i += 1;
                let value = args.get(i).ok_or("--items requires a value")?;
                items = value
                    .parse()
                    .map_err(|_| format!("invalid --items '{value}'"))?;
            }
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => {
                if command.is_some() {
                    return Err(format!("unexpected argument: {arg}"));
                }
                command = Some(match arg {
                    "pool" => Command::Pool,
                    "feedback" => Command::Feedback,
                    "pipeline" => Command::Pipeline,
                    "pause" => Command::Pause,
                    other => return Err(format!("unknown command '{other}'")),
                });
            }
        }
        i += 1;
    }

    let command = command.ok_or("missing required argument: <command>")?;
    Ok(Args {
        command,
        parallelism,
        items,
    })
}

fn pool_config(args: &Args, name: &str) -> ListenerConfig {
    let config = ListenerConfig::default().with_name(name);
    match args.parallelism {
        Some(n) => config.with_parallelism(n),
        None => config,
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    match args.command {
        Command::Pool => run_pool(&args).await,
        Command::Feedback => run_feedback(&args).await,
        Command::Pipeline => run_pipeline(&args).await,
        Command::Pause => run_pause(&args).await,
    }
}

async fn run_pool(args: &Args) -> anyhow::Result<()> {
    let sum = Arc::new(AtomicU64::new(0));
    let config = pool_config(args, "demo-pool").with_fault_sink(|fault| {
        tracing::info!(worker = fault.worker, "Fault sink received: {}", fault.message);
    });

    let pool = {
        let sum = Arc::clone(&sum);
        ListenerPool::with_config(
            config,
            AsyncFnHandler::new(move |item: u64, _state: ProcessStateToken| {
                let sum = Arc::clone(&sum);
                async move {
                    anyhow::ensure!(item % 17 != 0, "refusing multiple of 17: {item}");
                    sum.fetch_add(item, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )?
    };

    for item in 1..=args.items {
        pool.post(item)?;
    }

    let token = CancellationToken::new();
    anyhow::ensure!(pool.when_idle(&token).await, "pool stopped before draining");

    let load = pool.load();
    println!(
        "{}",
        serde_json::to_string_pretty(&load).context("failed to serialize pool load")?
    );
    println!("sum = {}", sum.load(Ordering::SeqCst));

    pool.shutdown().await;
    Ok(())
}

async fn run_feedback(args: &Args) -> anyhow::Result<()> {
    let count = args.items;
    let mut feedback = Feedback::new(move |pusher: Pusher<u64>| async move {
        for value in 0..count {
            if !pusher.push(value * value).await {
                break;
            }
        }
        Ok::<_, anyhow::Error>(())
    });

    let mut received = 0u64;
    while let Some(value) = feedback.next().await? {
        tracing::debug!(value, "Received");
        received += 1;
    }

    println!("received {received} values, producer {:?}", feedback.completion().await);
    Ok(())
}

async fn run_pipeline(args: &Args) -> anyhow::Result<()> {
    let pipeline = PipelineBuilder::<u64, u64>::new()
        .transform(|x| x + 1)
        .transform(|x| x * 2)
        .build_sync()?;

    let decorated = PipelineBuilder::<u64, u64>::new()
        .transform_async(|x| async move {
            tokio::task::yield_now().await;
            x * 3
        })
        .transform(|x| format!("value={x}"))
        .build();

    let token = CancellationToken::new();
    for input in 0..args.items.min(5) {
        let doubled = pipeline.run(input)?;
        let text = decorated.run_async(doubled, &token).await?;
        println!("{input} -> {doubled} -> {text}");
    }
    println!("stages: {:?}", decorated.stage_kinds());
    Ok(())
}

async fn run_pause(args: &Args) -> anyhow::Result<()> {
    let processed = Arc::new(AtomicU64::new(0));
    let pool = {
        let processed = Arc::clone(&processed);
        ListenerPool::with_config(
            pool_config(args, "demo-pause"),
            AsyncFnHandler::new(move |_: u64, _state: ProcessStateToken| {
                let processed = Arc::clone(&processed);
                async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    processed.fetch_add(1, Ordering::SeqCst);
                    anyhow::Ok(())
                }
            }),
        )?
    };

    for item in 0..args.items {
        pool.post(item)?;
    }

    if pool.pause(Duration::from_secs(1)).await {
        let frozen = processed.load(Ordering::SeqCst);
        println!("paused after {frozen} items, phase {:?}", pool.phase());
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.resume();
    } else {
        println!("pause not acknowledged");
    }

    let token = CancellationToken::new();
    pool.when_idle(&token).await;
    println!("processed {} items", processed.load(Ordering::SeqCst));
    pool.shutdown().await;
    Ok(())
}
