use console::style;
use ledger_crdt::clock::system_time_ms;
use ledger_crdt::Timestamp;
use ledger_store::{ClockStore, MessageLog, RowStore, SqliteStore};
use ledger_sync::{ReplicaState, SyncConfig, SyncEngine};
use tracing::{debug, info};

type Result<T = ()> = std::result::Result<T, Box<dyn std::error::Error>>;

/// Load the engine configuration, or the defaults when no file is given.
pub fn load_config(path: Option<&str>) -> Result<SyncConfig> {
    match path {
        Some(path) => {
            debug!(path, "loading sync config");
            Ok(SyncConfig::from_path(path)?)
        }
        None => Ok(SyncConfig::default()),
    }
}

/// `ledger status <db>`: clock, trie and row counts.
pub fn status(db_path: &str, config: &SyncConfig) -> Result {
    let store = SqliteStore::open(db_path)?;
    debug!(db = db_path, "opened replica");
    let size = store.file_size()?;
    let journal = store.journal_mode()?;

    println!("Replica: {db_path} (SQLite, {journal} mode)");
    println!("Size: {}", format_bytes(size));

    match store.load_clock()? {
        Some(record) => {
            let state = ReplicaState::from_record(&record, config, system_time_ms)?;
            println!("Node: {}", state.node());
            println!("Clock: {}", state.clock.last_timestamp());
            println!(
                "Trie: {} timestamps, hash {:08x}",
                format_num(state.trie.count()),
                state.trie.hash()
            );
        }
        None => println!("Clock: {}", style("(not initialized)").dim()),
    }
    println!("Messages: {}", format_num(store.message_count()?));
    println!();

    let mut counts = Vec::new();
    for dataset in store.datasets() {
        let rows = store.row_count(dataset)?;
        if rows > 0 {
            counts.push((dataset, rows));
        }
    }
    if counts.is_empty() {
        println!("  (no rows)");
        return Ok(());
    }

    println!("  {:<24} {:>10}", "Dataset", "Rows");
    println!("  {}", "-".repeat(35));
    for (dataset, rows) in &counts {
        println!("  {:<24} {:>10}", dataset.name(), format_num(*rows));
    }
    println!();
    Ok(())
}

/// `ledger messages <db>`: the tail of the message log.
pub fn messages(db_path: &str, since: Option<&str>, last: usize, json: bool) -> Result {
    let store = SqliteStore::open(db_path)?;
    let since = match since {
        Some(s) => Timestamp::parse(s)?,
        None => Timestamp::zero(),
    };

    let all = store.messages_since(&since)?;
    let total = all.len();
    debug!(db = db_path, %since, total, "read message log");
    let shown = &all[total.saturating_sub(last)..];

    if json {
        for msg in shown {
            println!("{}", serde_json::to_string(&msg.to_wire())?);
        }
        return Ok(());
    }

    if total == 0 {
        println!("  (no messages)");
        return Ok(());
    }

    println!(
        "Message log ({} of {} messages):",
        shown.len(),
        format_num(total as u64)
    );
    println!(
        "  {:<46}  {:<18}  {:<12}  {:<16}  Value",
        "Timestamp", "Dataset", "Row", "Column"
    );
    println!("  {}", "-".repeat(110));
    for msg in shown {
        println!(
            "  {:<46}  {:<18}  {:<12}  {:<16}  {}",
            msg.timestamp,
            msg.dataset.name(),
            truncate(&msg.row, 12),
            truncate(&msg.column, 16),
            truncate(&msg.value.encode(), 40),
        );
    }
    println!();
    Ok(())
}

/// `ledger verify <db>`: compare the persisted trie with the log.
pub fn verify(db_path: &str, config: SyncConfig, repair: bool) -> Result {
    let store = SqliteStore::open(db_path)?;
    if store.load_clock()?.is_none() {
        info!(db = db_path, "no clock record");
        println!("No clock record in {db_path}; nothing to verify.");
        return Ok(());
    }

    let mut engine = SyncEngine::builder(store).config(config).build()?;
    let report = engine.verify_trie()?;
    println!("Messages: {}", format_num(report.messages));
    println!("Persisted hash: {:08x}", report.current_hash);
    println!("Rebuilt hash:   {:08x}", report.rebuilt_hash);

    if report.matches() {
        println!("{}", style("Trie matches the message log.").green());
        return Ok(());
    }

    info!(db = db_path, repair, "trie mismatch");
    if !repair {
        println!("{}", style("Trie does not match the message log.").red());
        return Err("trie mismatch; run again with --repair to rebuild it".into());
    }

    let repaired = engine.repair_trie()?;
    info!(db = db_path, hash = repaired.current_hash, "trie repaired");
    println!(
        "{} hash is now {:08x}",
        style("Trie rebuilt:").yellow(),
        repaired.current_hash
    );
    Ok(())
}

// ── Helpers ──────────────────────────────────────────────────────────

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

fn format_num(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, ch) in s.chars().enumerate() {
        if i > 0 && (s.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(ch);
    }
    result
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}
