//! mtr-stress - runs concurrent mini-transactions against one redo log and
//! buffer pool, then checks the flush list and the log stream.

use anyhow::{bail, Context, Result};
use clap::Parser as ClapParser;
use rand::Rng;
use redo_mtr::checkpoint::CheckpointManager;
use redo_mtr::mtr::MiniTransaction;
use redo_mtr::redo::file::RedoFile;
use redo_mtr::redo::{parse_groups, RedoLog, RedoLogConfig};
use redo_mtr::storage::{BufferPool, BufferPoolConfig, PageId, SpaceId, PAGE_SIZE};
use std::path::PathBuf;
use std::thread;
use std::time::Instant;

/// Concurrent mini-transaction stress runner
#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Worker threads
    #[arg(short, long, default_value = "4")]
    threads: usize,

    /// Mini-transactions per worker
    #[arg(short = 'n', long, default_value = "1000")]
    mtrs: usize,

    /// Pages per tablespace
    #[arg(short, long, default_value = "64")]
    pages: u32,

    /// User tablespaces; space 0 is the system tablespace
    #[arg(short, long, default_value = "4")]
    spaces: u32,

    /// Redo log capacity in bytes
    #[arg(long, default_value = "67108864")]
    capacity: u64,

    /// Redo log block size in bytes
    #[arg(long, default_value = "512")]
    block_size: usize,

    /// Write the redo log to this file
    #[arg(short, long)]
    log_file: Option<PathBuf>,

    /// Flush and checkpoint every N mini-transactions of worker 0 (0 disables)
    #[arg(short, long, default_value = "200")]
    checkpoint_interval: usize,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Debug, Default)]
struct WorkerReport {
    committed: usize,
    pages_written: usize,
    checkpoints: usize,
}

fn run_worker(
    worker: usize,
    args: &Args,
    log: &RedoLog,
    pool: &BufferPool,
    checkpoints: &CheckpointManager<'_>,
) -> Result<WorkerReport> {
    let mut rng = rand::thread_rng();
    let mut report = WorkerReport::default();

    for i in 0..args.mtrs {
        let space = rng.gen_range(0..=args.spaces);
        let mut pages: Vec<PageId> = (0..rng.gen_range(1..=4))
            .map(|_| PageId::new(space, rng.gen_range(0..args.pages)))
            .collect();
        // A global latch order keeps workers from deadlocking.
        pages.sort();
        pages.dedup();

        let mut mtr = MiniTransaction::start(log, pool, false, false);
        for &page in &pages {
            mtr.x_latch_page(page)
                .with_context(|| format!("worker {} failed to latch {}", worker, page))?;
        }
        for &page in &pages {
            let offset = rng.gen_range(0..(PAGE_SIZE - 8) as u16);
            mtr.write_u64(page, offset, ((worker as u64) << 32) | i as u64)?;
        }
        mtr.commit()
            .with_context(|| format!("worker {} failed to commit", worker))?;

        report.committed += 1;
        report.pages_written += pages.len();

        if worker == 0 && args.checkpoint_interval > 0 && (i + 1) % args.checkpoint_interval == 0 {
            checkpoints.flush_and_checkpoint()?;
            report.checkpoints += 1;
        }
    }
    Ok(report)
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    if args.pages == 0 || args.threads == 0 {
        bail!("--pages and --threads must be positive");
    }

    let log = RedoLog::new(RedoLogConfig {
        capacity: args.capacity,
        block_size: args.block_size,
        log_path: args.log_file.clone(),
        sync_on_write: false,
    })
    .context("Failed to create redo log")?;
    let max_pages = ((args.spaces as usize + 1) * args.pages as usize).max(1);
    let pool = BufferPool::new(BufferPoolConfig { max_pages });
    for space in 1..=args.spaces {
        log.register_tablespace(SpaceId(space), format!("./stress/space_{}.ibd", space))?;
    }
    let checkpoints = CheckpointManager::new(&log, &pool);

    println!(
        "Running {} workers x {} mini-transactions over {} pages",
        args.threads, args.mtrs, max_pages
    );
    let started = Instant::now();

    let reports: Vec<Result<WorkerReport>> = thread::scope(|s| {
        let handles: Vec<_> = (0..args.threads)
            .map(|worker| {
                let (args, log, pool, checkpoints) = (&args, &log, &pool, &checkpoints);
                s.spawn(move || run_worker(worker, args, log, pool, checkpoints))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| match h.join() {
                Ok(report) => report,
                Err(_) => Err(anyhow::anyhow!("worker panicked")),
            })
            .collect()
    });

    let elapsed = started.elapsed();
    let mut total = WorkerReport::default();
    for report in reports {
        let report = report?;
        total.committed += report.committed;
        total.pages_written += report.pages_written;
        total.checkpoints += report.checkpoints;
    }

    if !pool.is_flush_list_ordered() {
        bail!("flush list is not ordered by oldest modification");
    }

    let groups = parse_groups(&log.contents(log.checkpoint_lsn())?)
        .context("Redo log since the last checkpoint does not parse")?;

    if let Some(path) = &args.log_file {
        log.write_up_to(log.lsn())?;
        let on_disk = RedoFile::read_all(path)?;
        let all_groups = parse_groups(&on_disk).context("Redo log file does not parse")?;
        println!("Log file: {} ({} mini-transactions)", path.display(), all_groups.len());
    }

    let stats = log.stats();
    println!();
    println!("Committed:        {}", total.committed);
    println!("Pages written:    {}", total.pages_written);
    println!("Checkpoints:      {}", total.checkpoints);
    println!("Current LSN:      {}", log.lsn());
    println!("Checkpoint LSN:   {}", log.checkpoint_lsn());
    println!("Fast appends:     {}", stats.fast_appends);
    println!("Slow appends:     {}", stats.slow_appends);
    println!("Naming records:   {}", stats.file_name_records);
    println!("Groups since ckpt: {}", groups.len());
    println!("Dirty pages:      {}", pool.flush_list_snapshot().len());
    println!(
        "Elapsed:          {:.2?} ({:.0} mtr/s)",
        elapsed,
        total.committed as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    Ok(())
}
