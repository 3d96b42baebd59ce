use anyhow::Context;
use clap::Parser;
use futures::future::try_join_all;
use mq_publisher::broker::MemoryCluster;
use mq_publisher::{Config, TopicPublisher};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "mq-publisher")]
#[command(about = "Publish benchmark against an in-process broker cluster", long_about = None)]
struct Args {
    /// Number of messages to publish
    #[arg(short = 'n', default_value_t = 1000)]
    messages: usize,

    /// Number of concurrent producers
    #[arg(short = 'c', default_value_t = 4)]
    concurrency: usize,

    /// Partition count used when creating the topic
    #[arg(short = 'p', default_value_t = 6)]
    partitions: u32,

    #[arg(long, default_value = "test")]
    ns: String,

    #[arg(long, default_value = "test")]
    topic: String,

    /// Comma separated bootstrap broker addresses
    #[arg(long, value_delimiter = ',', default_value = "localhost:17777")]
    brokers: Vec<String>,

    /// Configuration file; overrides the topic and broker flags
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    let config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            Config::from_file(path)
                .with_context(|| format!("failed to load configuration from {:?}", path))?
        }
        None => {
            let mut config = Config::new(args.brokers.clone(), &args.ns, &args.topic);
            config.topic.create = true;
            config.topic.partition_count = args.partitions;
            config
        }
    };

    info!(
        brokers = ?config.brokers,
        topic = %config.topic(),
        partitions = config.topic.partition_count,
        messages = args.messages,
        concurrency = args.concurrency,
        "Configuration summary"
    );

    let addresses: Vec<&str> = config.brokers.iter().map(String::as_str).collect();
    let cluster = MemoryCluster::with_brokers(&addresses);
    let publisher = Arc::new(
        TopicPublisher::start(config, Arc::new(cluster.clone()))
            .await
            .context("failed to start publisher")?,
    );

    let concurrency = args.concurrency.max(1);
    let started = Instant::now();
    let producers = (0..concurrency).map(|producer| {
        let publisher = publisher.clone();
        let count = args.messages / concurrency + usize::from(producer < args.messages % concurrency);
        tokio::spawn(async move {
            for i in 0..count {
                publisher
                    .publish(format!("key-{producer}-{i}"), format!("value-{producer}-{i}"))
                    .await?;
            }
            Ok::<_, mq_publisher::Error>(count)
        })
    });
    let published: usize = try_join_all(producers)
        .await?
        .into_iter()
        .collect::<mq_publisher::Result<Vec<_>>>()?
        .into_iter()
        .sum();

    publisher.shutdown().await?;
    let elapsed = started.elapsed();

    let delivered = cluster.received_count(publisher.topic());
    info!(
        published,
        delivered,
        elapsed_ms = elapsed.as_millis() as u64,
        "Benchmark finished"
    );
    println!(
        "published {} messages in {:.3}s ({:.1} msg/s), {} delivered",
        published,
        elapsed.as_secs_f64(),
        published as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        delivered
    );

    Ok(())
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("mq_publisher=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("mq_publisher=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
