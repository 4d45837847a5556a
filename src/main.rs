use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use jobrun::cli::{Cli, Command, parse_env_pair};
use jobrun::config::JobrunConfig;
use jobrun::ui::JobProgress;
use jobrun::{JobEngine, JobParameters, JobStatus};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = JobrunConfig::load()?;

    let filter = if cli.verbose {
        "jobrun=debug".to_string()
    } else {
        config.log_filter.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let mut policy = config.retry_policy();
    if let Some(n) = cli.max_attempts {
        policy.max_attempts = n.max(1);
    }

    match cli.command {
        Command::Run {
            program,
            args,
            timeout,
            cwd,
            env,
            no_stdout,
            no_stderr,
        } => {
            let mut params = JobParameters::new(&program)
                .with_args(args)
                .with_timeout_secs(timeout);
            if let Some(dir) = cwd {
                params = params.with_working_dir(dir);
            }
            for pair in &env {
                match parse_env_pair(pair) {
                    Some((key, value)) => {
                        params = params.with_env(key, value);
                    }
                    None => bail!("invalid --env '{pair}', expected KEY=VALUE"),
                }
            }
            params.capture_stdout = !no_stdout;
            params.capture_stderr = !no_stderr;

            let engine = Arc::new(JobEngine::new(policy));
            let id = engine.submit(params).await?;

            // Ctrl+C turns into a cooperative cancellation request.
            let cancel_engine = Arc::clone(&engine);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel_engine.request_cancellation(&id).await;
                }
            });

            let progress = JobProgress::start(&program);
            engine.wait(&id).await;
            let job = engine
                .snapshot(&id)
                .await
                .context("job record disappeared")?;
            progress.complete(&job);

            if let Some(result) = &job.result {
                if !result.stdout.is_empty() {
                    println!("{}", result.stdout_text());
                }
                if !result.stderr.is_empty() {
                    eprintln!("{}", result.stderr_text());
                }
            }
            if cli.verbose {
                progress.print_report(&job);
            }

            let code = match job.status {
                JobStatus::Completed => job.result.as_ref().map(|r| r.exit_code).unwrap_or(0),
                JobStatus::Cancelled => 130,
                _ => 1,
            };
            std::process::exit(code);
        }
    }
}
