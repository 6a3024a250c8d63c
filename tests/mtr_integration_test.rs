use parking_lot::Mutex;
use rand::Rng;
use redo_mtr::checkpoint::{make_checkpoint, CheckpointManager};
use redo_mtr::mtr::{MiniTransaction, MtrError, MtrState};
use redo_mtr::redo::file::RedoFile;
use redo_mtr::redo::{
    parse_groups, parse_records, LogRecord, Lsn, RedoError, RedoLog, RedoLogConfig,
};
use redo_mtr::storage::{BufferPool, BufferPoolConfig, PageId, RegistrationHook, SpaceId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn create_log() -> RedoLog {
    RedoLog::new(RedoLogConfig {
        sync_on_write: false,
        ..Default::default()
    })
    .unwrap()
}

fn commit_write(log: &RedoLog, pool: &BufferPool, page: PageId, value: u32) -> Lsn {
    let mut mtr = MiniTransaction::start(log, pool, false, false);
    mtr.x_latch_page(page).unwrap();
    mtr.write_u32(page, 0, value).unwrap();
    mtr.commit().unwrap();
    mtr.commit_lsn()
}

#[test]
fn test_flush_list_follows_lsn_order() {
    init_logging();
    let log = Arc::new(create_log());
    let pool = BufferPool::new(BufferPoolConfig::default());
    let first = PageId::new(0, 1);
    let second = PageId::new(0, 2);

    // Stall the first committer inside registration until a later
    // committer has appended its redo.
    let (tx, rx) = mpsc::channel();
    let overlapped = Arc::new(AtomicBool::new(false));
    {
        let log = log.clone();
        let overlapped = overlapped.clone();
        let tx = Mutex::new(tx);
        let hook: RegistrationHook = Arc::new(move |page_id: PageId| {
            if page_id != first {
                return;
            }
            let seen = log.lsn();
            let _ = tx.lock().send(());
            let deadline = Instant::now() + Duration::from_secs(5);
            while Instant::now() < deadline {
                if log.lsn() > seen {
                    overlapped.store(true, Ordering::SeqCst);
                    break;
                }
                thread::sleep(Duration::from_millis(1));
            }
        });
        pool.set_registration_hook(Some(hook));
    }

    let (first_end, second_end) = thread::scope(|s| {
        let a = s.spawn(|| commit_write(&log, &pool, first, 1));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let b = s.spawn(|| commit_write(&log, &pool, second, 2));
        (a.join().unwrap(), b.join().unwrap())
    });
    pool.set_registration_hook(None);

    assert!(overlapped.load(Ordering::SeqCst));
    assert!(first_end < second_end);

    let history = pool.registration_history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].page_id, first);
    assert_eq!(history[1].page_id, second);
    assert!(history[0].start_lsn < history[1].start_lsn);

    let order: Vec<PageId> = pool
        .flush_list_snapshot()
        .iter()
        .map(|e| e.page_id)
        .collect();
    assert_eq!(order, vec![first, second]);
    assert!(pool.is_flush_list_ordered());
}

/// Hook that parks the registration of `page` until the returned sender
/// fires, after signalling on the returned receiver.
fn stall_registration(page: PageId) -> (RegistrationHook, mpsc::Receiver<()>, mpsc::Sender<()>) {
    let (stalled_tx, stalled_rx) = mpsc::channel();
    let (resume_tx, resume_rx) = mpsc::channel::<()>();
    let stalled_tx = Mutex::new(stalled_tx);
    let resume_rx = Mutex::new(resume_rx);
    let hook: RegistrationHook = Arc::new(move |page_id: PageId| {
        if page_id != page {
            return;
        }
        let _ = stalled_tx.lock().send(());
        let _ = resume_rx.lock().recv_timeout(Duration::from_secs(5));
    });
    (hook, stalled_rx, resume_tx)
}

#[test]
fn test_fixed_page_stays_dirty_until_registered() {
    init_logging();
    let log = create_log();
    let pool = BufferPool::new(BufferPoolConfig::default());
    let page = PageId::new(0, 1);
    let other = PageId::new(0, 2);

    commit_write(&log, &pool, page, 1);
    let (oldest, _) = pool.page_lsn_range(page).unwrap();

    let (hook, stalled, resume) = stall_registration(page);
    let checkpoint = thread::scope(|s| {
        let committer = s.spawn(|| {
            let mut mtr = MiniTransaction::start(&log, &pool, false, false);
            mtr.buf_fix_page(page).unwrap();
            mtr.memo_modify_page(page);
            mtr.log_record(&LogRecord::Dummy);
            assert!(!mtr.made_dirty());

            // Everything the page carries is in the log, but the fix keeps
            // it out of reach of the flusher.
            log.write_up_to(log.lsn()).unwrap();
            assert_eq!(pool.flush_up_to(log.flushed_lsn()), 0);
            assert!(!pool.is_clean(page));

            pool.set_registration_hook(Some(hook));
            mtr.commit().unwrap();
            mtr.commit_lsn()
        });

        stalled.recv_timeout(Duration::from_secs(5)).unwrap();
        commit_write(&log, &pool, other, 2);
        let checkpoint = make_checkpoint(&log, &pool).unwrap();
        resume.send(()).unwrap();
        committer.join().unwrap();
        checkpoint
    });
    pool.set_registration_hook(None);

    assert_eq!(pool.page_lsn_range(page).map(|(o, _)| o), Some(oldest));
    assert!(checkpoint.checkpoint_lsn <= oldest);
    let order: Vec<PageId> = pool
        .flush_list_snapshot()
        .iter()
        .map(|e| e.page_id)
        .collect();
    assert_eq!(order, vec![page, other]);
    assert!(pool.is_flush_list_ordered());
}

#[test]
fn test_checkpoint_waits_for_stalled_registration() {
    init_logging();
    let log = create_log();
    let pool = BufferPool::new(BufferPoolConfig::default());
    let page = PageId::new(0, 3);

    let (hook, stalled, resume) = stall_registration(page);
    pool.set_registration_hook(Some(hook));
    let checkpoint = thread::scope(|s| {
        let committer = s.spawn(|| commit_write(&log, &pool, page, 1));
        stalled.recv_timeout(Duration::from_secs(5)).unwrap();

        // The committer has appended its redo and holds the flush-order
        // lock; the checkpoint cannot read the flush list until it lets go.
        let checkpointer = s.spawn(|| make_checkpoint(&log, &pool).unwrap());
        thread::sleep(Duration::from_millis(50));
        assert!(!checkpointer.is_finished());
        resume.send(()).unwrap();

        committer.join().unwrap();
        checkpointer.join().unwrap()
    });
    pool.set_registration_hook(None);

    let history = pool.registration_history();
    assert_eq!(history.len(), 1);
    assert!(history
        .iter()
        .all(|r| checkpoint.checkpoint_lsn <= r.start_lsn));
    assert_eq!(checkpoint.checkpoint_lsn, Lsn::START);
    assert_eq!(checkpoint.dirty_pages, 1);
}

#[test]
fn test_concurrent_writers_name_space_once() {
    init_logging();
    let log = create_log();
    let pool = BufferPool::new(BufferPoolConfig::default());
    let space = SpaceId(7);
    log.register_tablespace(space, "./db/t7.ibd").unwrap();
    let barrier = Barrier::new(8);

    thread::scope(|s| {
        for t in 0..8u32 {
            let (log, pool, barrier) = (&log, &pool, &barrier);
            s.spawn(move || {
                barrier.wait();
                commit_write(log, pool, PageId::new(space.0, t), t);
            });
        }
    });

    let groups = parse_groups(&log.contents(Lsn::START).unwrap()).unwrap();
    assert_eq!(groups.len(), 8);

    let is_naming =
        |r: &LogRecord| matches!(r, LogRecord::FileName { space: s, .. } if *s == space);
    let named: Vec<usize> = groups
        .iter()
        .enumerate()
        .filter(|(_, g)| g.iter().any(is_naming))
        .map(|(i, _)| i)
        .collect();
    // Only the first mini-transaction to reach the log names the space.
    assert_eq!(named, vec![0]);
    assert_eq!(log.stats().file_name_records, 1);
}

#[test]
fn test_checkpoint_marker_in_stream() {
    init_logging();
    let log = create_log();
    let pool = BufferPool::new(BufferPoolConfig::default());
    let page = PageId::new(3, 0);

    commit_write(&log, &pool, page, 1);
    let checkpoint = make_checkpoint(&log, &pool).unwrap();
    commit_write(&log, &pool, page, 2);

    let bytes = log.contents(Lsn::START).unwrap();
    let groups = parse_groups(&bytes).unwrap();
    assert_eq!(groups.len(), 3);
    assert_eq!(
        groups[1],
        vec![LogRecord::Checkpoint {
            lsn: checkpoint.checkpoint_lsn
        }]
    );
    // The page is still dirty, so the checkpoint did not move past it.
    assert_eq!(checkpoint.checkpoint_lsn, Lsn::START);
    assert_eq!(log.checkpoint_lsn(), Lsn::START);

    // Both writes to space 3 carry a naming record: the checkpoint reset it.
    for group in [&groups[0], &groups[2]] {
        assert!(group
            .iter()
            .any(|r| matches!(r, LogRecord::FileName { space, .. } if *space == SpaceId(3))));
    }

    // The marker is a group of its own ending at the reported LSN.
    let records = parse_records(&bytes).unwrap();
    let at = records
        .iter()
        .position(|r| matches!(r.record, LogRecord::Checkpoint { .. }))
        .unwrap();
    assert!(records[at].last_in_mtr);
    assert!(records[at - 1].last_in_mtr);
    assert_eq!(
        Lsn::START.advance(records[at + 1].offset),
        checkpoint.end_lsn
    );
}

#[test]
fn test_repeated_checkpoints() {
    let log = create_log();
    let pool = BufferPool::new(BufferPoolConfig::default());
    let manager = CheckpointManager::new(&log, &pool);

    // A caller holding the append lock can commit a marker directly.
    let mut guard = log.enter_append_lock();
    let mut mtr = MiniTransaction::start(&log, &pool, false, false);
    let direct_end = mtr.commit_checkpoint(&mut guard, Lsn::START).unwrap();
    drop(guard);

    let first = manager.create_checkpoint().unwrap();
    let second = manager.flush_and_checkpoint().unwrap();
    assert!(first.end_lsn > direct_end);
    assert!(second.end_lsn > first.end_lsn);
    assert!(second.checkpoint_lsn >= first.checkpoint_lsn);
    assert_eq!(manager.last_checkpoint(), Some(second));
    assert_eq!(log.stats().checkpoints, 2);
}

#[test]
fn test_sync_commit_reaches_file() {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("ib_logfile0");
    let log = RedoLog::new(RedoLogConfig {
        log_path: Some(path.clone()),
        sync_on_write: true,
        ..Default::default()
    })
    .unwrap();
    let pool = BufferPool::new(BufferPoolConfig::default());
    let page = PageId::new(0, 9);

    let mut mtr = MiniTransaction::start(&log, &pool, true, false);
    mtr.x_latch_page(page).unwrap();
    mtr.write_u16(page, 40, 0xBEEF).unwrap();
    mtr.commit().unwrap();
    assert_eq!(log.flushed_lsn(), mtr.commit_lsn());

    // A non-sync commit leaves the file behind the log.
    mtr.restart(false, false);
    mtr.x_latch_page(page).unwrap();
    mtr.write_u16(page, 42, 0xCAFE).unwrap();
    mtr.commit().unwrap();
    assert!(log.flushed_lsn() < mtr.commit_lsn());

    let on_disk = RedoFile::read_all(&path).unwrap();
    assert_eq!(
        parse_groups(&on_disk).unwrap(),
        vec![vec![LogRecord::Write2 {
            page_id: page,
            offset: 40,
            value: 0xBEEF
        }]]
    );
}

#[test]
fn test_log_full_halts_and_keeps_latches() {
    init_logging();
    let log = RedoLog::new(RedoLogConfig {
        capacity: 64,
        sync_on_write: false,
        ..Default::default()
    })
    .unwrap();
    let pool = BufferPool::new(BufferPoolConfig::default());
    let page = PageId::new(0, 1);

    let mut mtr = MiniTransaction::start(&log, &pool, false, false);
    mtr.x_latch_page(page).unwrap();
    mtr.write_string(page, 0, &[0xAB; 100]).unwrap();
    let err = mtr.commit().unwrap_err();
    assert!(matches!(err, MtrError::Redo(RedoError::LogFull { .. })));
    assert!(log.is_halted());
    assert_eq!(mtr.state(), MtrState::Committing);
    assert!(pool.is_latched(page));
    assert_eq!(log.lsn(), Lsn::START);

    // Every later append fails, even one that would fit.
    let other = PageId::new(0, 2);
    let mut next = MiniTransaction::start(&log, &pool, false, false);
    next.x_latch_page(other).unwrap();
    next.write_u8(other, 0, 1).unwrap();
    assert!(matches!(
        next.commit(),
        Err(MtrError::Redo(RedoError::Halted))
    ));
}

#[test]
fn test_concurrent_stress_keeps_invariants() {
    init_logging();
    let log = create_log();
    let pool = BufferPool::new(BufferPoolConfig::default());
    let threads = 8;
    let per_thread = 200;
    for space in 1..=3 {
        log.register_tablespace(SpaceId(space), format!("./db/s{}.ibd", space))
            .unwrap();
    }

    thread::scope(|s| {
        for t in 0..threads {
            let (log, pool) = (&log, &pool);
            s.spawn(move || {
                let mut rng = rand::thread_rng();
                for i in 0..per_thread {
                    let space = rng.gen_range(0..=3u32);
                    let mut pages: Vec<PageId> = (0..rng.gen_range(1..=3))
                        .map(|_| PageId::new(space, rng.gen_range(0..16)))
                        .collect();
                    pages.sort();
                    pages.dedup();

                    let mut mtr = MiniTransaction::start(log, pool, false, false);
                    for &page in &pages {
                        mtr.x_latch_page(page).unwrap();
                    }
                    for &page in &pages {
                        mtr.write_u64(page, rng.gen_range(0..4000), (t * 1000 + i) as u64)
                            .unwrap();
                    }
                    mtr.commit().unwrap();
                }
            });
        }
    });

    let bytes = log.contents(Lsn::START).unwrap();
    assert_eq!(log.lsn(), Lsn::START.advance(bytes.len()));
    assert_eq!(parse_groups(&bytes).unwrap().len(), threads * per_thread);

    assert!(pool.is_flush_list_ordered());
    let inserted: Vec<Lsn> = pool
        .registration_history()
        .iter()
        .filter(|r| r.inserted)
        .map(|r| r.start_lsn)
        .collect();
    assert!(inserted.windows(2).all(|w| w[0] <= w[1]));

    for space in 0..=3 {
        for page_no in 0..16 {
            let page = PageId::new(space, page_no);
            assert!(!pool.is_latched(page));
            assert_eq!(pool.fix_count(page), 0);
        }
    }
    assert!(log.stats().file_name_records <= 3);
}
