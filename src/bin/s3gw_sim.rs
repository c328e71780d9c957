//! s3gw Simulator
//!
//! Drives random PutObject/DeleteObject/DeleteObjects traffic through the
//! engine against the in-memory backend, optionally with injected write
//! faults, then runs one reaper pass and prints what happened.

use anyhow::{bail, Context};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use s3gw::{
    delete_object, delete_objects_batch, put_object, DeleteRequest, FaultPlan, FlowOutcome, GatewayConfig,
    GatewayContext, InMemoryBackend, KeyOutcome, PutRequest, Reaper, ShutdownSignal,
};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "s3gw-sim")]
#[command(about = "Run simulated S3 write/delete traffic against an in-memory backend")]
struct Args {
    /// TOML gateway configuration
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Number of requests to issue
    #[arg(short = 'n', long, default_value = "200")]
    requests: usize,

    /// Distinct object keys to spread requests over
    #[arg(short = 'k', long, default_value = "16")]
    keys: usize,

    /// Largest object body in bytes
    #[arg(long, default_value = "262144")]
    max_size: usize,

    /// Probability that any data write fails
    #[arg(short = 'f', long, default_value = "0.0")]
    fault_rate: f64,

    /// Backend completion threads
    #[arg(short = 'w', long, default_value = "4")]
    workers: usize,

    /// RNG seed
    #[arg(short = 's', long, default_value = "42")]
    seed: u64,

    /// Bucket name
    #[arg(short = 'b', long, default_value = "sim")]
    bucket: String,
}

#[derive(Debug, Default)]
struct Tally {
    puts: usize,
    deletes: usize,
    batch_deletes: usize,
    succeeded: usize,
    fragmented: usize,
    errors: BTreeMap<String, usize>,
}

impl Tally {
    fn record(&mut self, outcome: &FlowOutcome) {
        if outcome.succeeded() {
            self.succeeded += 1;
            if outcome.fragment_count > 1 {
                self.fragmented += 1;
            }
        } else if let Some(class) = outcome.error_class {
            *self.errors.entry(format!("{:?}", class)).or_default() += 1;
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    if args.keys == 0 {
        bail!("--keys must be at least 1");
    }
    if !(0.0..=1.0).contains(&args.fault_rate) {
        bail!("--fault-rate must be between 0 and 1");
    }

    let config = match &args.config {
        Some(path) => GatewayConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => GatewayConfig::default(),
    };

    info!("Starting s3gw simulation: {} requests over {} keys", args.requests, args.keys);
    info!(
        "Write fault rate {}, fragment after {} failures, at most {} fragments",
        args.fault_rate, config.write.failures_before_fragment, config.write.max_fragments
    );

    let backend = Arc::new(InMemoryBackend::new(args.workers));
    if args.fault_rate > 0.0 {
        backend.set_faults(FaultPlan::new().with_write_fault_rate(args.fault_rate));
    }
    let ctx = GatewayContext::new(config, backend.clone(), ShutdownSignal::new())?;

    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut tally = Tally::default();
    let key_name = |i: usize| format!("object-{:04}", i);

    for _ in 0..args.requests {
        let roll: f64 = rng.gen();
        if roll < 0.7 {
            let key = key_name(rng.gen_range(0..args.keys));
            let size = rng.gen_range(0..=args.max_size);
            let mut body = vec![0u8; size];
            rng.fill(&mut body[..]);
            let outcome = put_object(&ctx, PutRequest::new(args.bucket.clone(), key, body))?;
            tally.puts += 1;
            tally.record(&outcome);
        } else if roll < 0.9 {
            let key = key_name(rng.gen_range(0..args.keys));
            let outcome = delete_object(&ctx, DeleteRequest::new(args.bucket.clone(), key))?;
            tally.deletes += 1;
            tally.record(&outcome);
        } else {
            let count = rng.gen_range(1..=args.keys.min(8));
            let keys = (0..count).map(|_| key_name(rng.gen_range(0..args.keys))).collect();
            let (outcome, results) = delete_objects_batch(&ctx, &args.bucket, keys)?;
            tally.batch_deletes += 1;
            tally.record(&outcome);
            for (key, result) in results {
                if let KeyOutcome::Failed(class) = result {
                    warn!("Batch delete of {} failed: {:?}", key, class);
                }
            }
        }
    }

    backend.clear_faults();
    let leftover = backend.kv_entries(ctx.ledger.index()).len();
    let report = Reaper::new(ctx.clone()).run_pass(&HashSet::new())?;

    println!("requests:        {}", args.requests);
    println!("  puts:          {}", tally.puts);
    println!("  deletes:       {}", tally.deletes);
    println!("  batch deletes: {}", tally.batch_deletes);
    println!("succeeded:       {}", tally.succeeded);
    println!("fragmented puts: {}", tally.fragmented);
    for (class, count) in &tally.errors {
        println!("  {:<14} {}", format!("{}:", class), count);
    }
    println!("backend mutations: {}", backend.mutations());
    println!("objects stored:    {}", backend.object_count());
    println!("tombstones left:   {}", leftover);
    println!(
        "reaper: {} examined, {} skipped, {} deleted, {} retired, {} failed",
        report.examined, report.skipped, report.deleted, report.retired, report.failed
    );
    Ok(())
}
