//! Send one transcript processing request to the work queue.

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use transcript_processor::{Config, ObjectPath, SqsWorkQueue, WorkQueue, WorkRequest};

#[derive(Parser, Debug)]
#[command(name = "enqueue", version, about = "Queue a transcript for processing")]
struct Args {
    /// Organization the transcript belongs to
    #[arg(long)]
    school: String,

    /// Category within the organization
    #[arg(long)]
    subject: String,

    /// Transcript location, e.g. s3://bucket/CIS/Science/16-09-2024_06-34-24_t.txt
    #[arg(long = "s3-path")]
    s3_path: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let args = Args::parse();

    let source: ObjectPath = args
        .s3_path
        .parse()
        .with_context(|| format!("Invalid --s3-path {}", args.s3_path))?;

    let config = Config::load().context("Failed to load configuration")?;
    let queue = SqsWorkQueue::new(&config.queue).await;

    let request = WorkRequest::new(args.school, args.subject, source.to_string());
    let message_id = queue
        .send(&request)
        .await
        .context("Failed to send work request")?;

    println!("{}", message_id);

    Ok(())
}
