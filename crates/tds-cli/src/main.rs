//! tds: deduplicating storage client
//!
//! Commands:
//!   upload <file>...           - chunk, key, encrypt, and store files
//!   restore <name> <output>    - rebuild a stored file from its recipes
//!   keygen-sim [--count N]     - benchmark key exchange against tdsd
//!   config show                - display current configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use tds_chunks::{chunk_file, file_name_hash, ChunkSizes};
use tds_core::config::{StorageConfig, TdsConfig};
use tds_core::{PipelineItem, RecipeEntry, TdsError};
use tds_crypto::{decrypt_chunk, KeyRecipe};
use tds_keys::{FramedChannel, KeyClient};
use tds_storage::{FileSink, RestoreStats, Sender, StorageCore, UploadedFile};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "tds",
    version,
    about = "tds deduplicating storage client",
    long_about = "tds: upload and restore files through a popularity-aware key server"
)]
struct Cli {
    /// Path to tds.toml configuration file
    #[arg(long, short = 'c', env = "TDS_CONFIG", default_value = "/etc/tds/config.toml")]
    config: PathBuf,

    /// Log level for stderr diagnostics
    #[arg(long, env = "TDS_LOG", default_value = "warn")]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upload one or more files in a single key server session
    Upload {
        /// Files to upload; each is recorded under the name given here
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Restore a previously uploaded file
    Restore {
        /// Name the file was uploaded under
        name: String,

        /// Where to write the restored bytes
        output: PathBuf,
    },

    /// Drive synthetic chunks through key exchange and key derivation only
    KeygenSim {
        /// Number of synthetic chunks
        #[arg(long, default_value_t = 100_000)]
        count: u64,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log);

    let config = TdsConfig::load(&cli.config)
        .with_context(|| format!("loading config: {}", cli.config.display()))?;

    match cli.command {
        Commands::Upload { files } => cmd_upload(&config, &files).await,
        Commands::Restore { name, output } => cmd_restore(&config, &name, &output).await,
        Commands::KeygenSim { count } => cmd_keygen_sim(&config, count).await,
        Commands::Config { action: ConfigAction::Show } => cmd_config_show(&config, &cli.config),
    }
}

fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Expand `~` in path to the user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    match path.to_str().and_then(|s| s.strip_prefix("~/")) {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_default();
            PathBuf::from(home).join(rest)
        }
        None => path.to_path_buf(),
    }
}

/// Name a file is recorded under: the path exactly as given on the command line.
fn upload_name(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

async fn connect(addr: &str) -> Result<FramedChannel<TcpStream>> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connecting to key server at {addr}"))?;
    stream.set_nodelay(true).context("setting TCP_NODELAY")?;
    Ok(FramedChannel::new(stream))
}

// ── Progress bar helpers ──────────────────────────────────────────────────────

fn make_progress_bar(total: u64, prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::with_template(
        "{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("=>-");
    pb.set_style(style);
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn make_spinner(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{prefix:.bold} {spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

// ── `tds upload` ──────────────────────────────────────────────────────────────

async fn cmd_upload(config: &TdsConfig, files: &[PathBuf]) -> Result<()> {
    let sizes = ChunkSizes::from_config(&config.client)?;
    let client_cfg = config.client.clone();
    let key_dir = expand_tilde(&client_cfg.key_recipe_dir);

    let mut total = 0u64;
    for path in files {
        let meta = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("stat {}", path.display()))?;
        anyhow::ensure!(meta.is_file(), "not a regular file: {}", path.display());
        total += meta.len();
    }

    let channel = connect(&client_cfg.key_server).await?;

    let storage = config.storage.clone();
    let core = tokio::task::spawn_blocking(move || StorageCore::open(&storage))
        .await
        .context("storage open task panicked")?
        .context("opening storage")?;

    let (chunk_tx, chunk_rx) = mpsc::channel(client_cfg.queue_depth.max(1));
    let (enc_tx, enc_rx) = mpsc::channel(client_cfg.queue_depth.max(1));

    let store_batch = client_cfg.store_batch_size;
    let sink = key_recipe_sink(key_dir);
    let sender = tokio::task::spawn_blocking(move || {
        let mut sender = Sender::new(core, store_batch).on_file(sink);
        let result = sender.run_blocking(enc_rx);
        (result, sender.completed().len())
    });

    let (key_batch, mask_bits) = (client_cfg.key_batch_size, client_cfg.mask_bits);
    let key_client = tokio::spawn(async move {
        let mut client = KeyClient::new(channel, key_batch, mask_bits);
        client.run(chunk_rx, enc_tx).await?;
        client.shutdown().await
    });

    let pb = make_progress_bar(total, "upload");
    let started = Instant::now();
    let produced = produce(files, sizes, &chunk_tx, &pb).await;
    drop(chunk_tx);

    let client_result = key_client.await.context("key client task panicked")?;
    let (sender_result, completed) = sender.await.context("sender task panicked")?;
    if sender_result.is_err() || client_result.is_err() {
        pb.abandon();
        eprintln!("upload failed after {completed} complete file(s); their keys are saved");
    }
    // a failed sender closes its queue and the key client then fails too;
    // report the sender's error in that case
    let report = sender_result.context("storing chunks failed")?;
    let client_stats = client_result.context("key exchange failed")?;
    produced?;
    pb.finish_and_clear();

    let elapsed = started.elapsed();
    println!(
        "uploaded {} file(s), {} chunk(s) in {:.2}s",
        report.files.len(),
        client_stats.chunks,
        elapsed.as_secs_f64()
    );
    println!(
        "  stored: {}  duplicates: {}  written: {} bytes",
        report.stats.stored, report.stats.duplicates, report.stats.bytes_written
    );
    println!(
        "  key exchange: {} batch(es), {:.1} ms",
        client_stats.batches,
        client_stats.exchange_time.as_secs_f64() * 1000.0
    );
    Ok(())
}

/// Append a file's final keys to its local key recipe.
fn save_keys(dir: &Path, file: &UploadedFile) -> Result<PathBuf> {
    let mut keys = KeyRecipe::load_or_new(dir, &file.file_name_hash)?;
    keys.extend(file.keys.iter().cloned());
    keys.save(dir)
}

/// Persist keys as each file's recipe lands, so a later failure cannot orphan them.
fn key_recipe_sink(dir: PathBuf) -> FileSink {
    Box::new(move |file: &UploadedFile| {
        let path = save_keys(&dir, file).map_err(TdsError::from)?;
        tracing::debug!(file = %file.file_name_hash, path = %path.display(), "key recipe saved");
        Ok(())
    })
}

/// Chunk each file and feed its chunks, then its recipe, into the pipeline.
async fn produce(
    files: &[PathBuf],
    sizes: ChunkSizes,
    tx: &mpsc::Sender<PipelineItem>,
    pb: &ProgressBar,
) -> Result<()> {
    for path in files {
        let name = upload_name(path);
        pb.set_message(name.clone());

        let owned = path.clone();
        let (chunks, _) = tokio::task::spawn_blocking(move || chunk_file(&owned, sizes))
            .await
            .context("chunking task panicked")??;

        let entries: Vec<RecipeEntry> = chunks
            .iter()
            .map(|c| RecipeEntry {
                fingerprint: c.fingerprint,
                size: c.data.len() as u32,
                chunk_id: c.id,
            })
            .collect();

        for chunk in chunks {
            let len = chunk.data.len() as u64;
            if tx.send(PipelineItem::Chunk(chunk)).await.is_err() {
                anyhow::bail!("pipeline closed while uploading {name}");
            }
            pb.inc(len);
        }
        if tx
            .send(PipelineItem::Recipe {
                file_name_hash: file_name_hash(&name),
                entries,
            })
            .await
            .is_err()
        {
            anyhow::bail!("pipeline closed before the recipe for {name}");
        }
    }
    Ok(())
}

// ── `tds restore` ─────────────────────────────────────────────────────────────

async fn cmd_restore(config: &TdsConfig, name: &str, output: &Path) -> Result<()> {
    let storage = config.storage.clone();
    let key_dir = expand_tilde(&config.client.key_recipe_dir);
    let batch = config.client.store_batch_size;
    let (name, output) = (name.to_string(), output.to_path_buf());

    let started = Instant::now();
    let stats = tokio::task::spawn_blocking(move || {
        restore_file(&storage, &key_dir, &name, &output, batch)
    })
    .await
    .context("restore task panicked")??;

    println!(
        "restored {} chunk(s), {} bytes in {:.2}s (index {:.1} ms, read {:.1} ms)",
        stats.chunks,
        stats.bytes,
        started.elapsed().as_secs_f64(),
        stats.index_time.as_secs_f64() * 1000.0,
        stats.read_time.as_secs_f64() * 1000.0
    );
    Ok(())
}

fn restore_file(
    storage: &StorageConfig,
    key_dir: &Path,
    name: &str,
    output: &Path,
    batch: usize,
) -> Result<RestoreStats> {
    let file = file_name_hash(name);
    let mut core = StorageCore::open(storage).context("opening storage")?;
    let recipe = core
        .restore_recipe(&file)
        .with_context(|| format!("loading recipe for {name}"))?;
    let keys = KeyRecipe::load(&KeyRecipe::path_for(key_dir, &file))
        .with_context(|| format!("loading key recipe for {name}"))?;
    anyhow::ensure!(
        keys.len() == recipe.len(),
        "key recipe for {name} has {} key(s) but the recipe has {} chunk(s)",
        keys.len(),
        recipe.len()
    );

    let total: u64 = recipe.iter().map(|e| u64::from(e.size)).sum();
    let pb = make_progress_bar(total, "restore");
    pb.set_message(name.to_string());

    let out = std::fs::File::create(output)
        .with_context(|| format!("creating {}", output.display()))?;
    let mut out = std::io::BufWriter::new(out);

    let batch = batch.max(1);
    let mut start = 0;
    while start < recipe.len() {
        let end = (start + batch).min(recipe.len());
        let chunks = core.restore_chunks(&recipe, start, end)?;
        for (position, chunk) in (start..end).zip(&chunks) {
            let key = keys
                .get(position)
                .with_context(|| format!("no key for recipe position {position}"))?;
            let plain = decrypt_chunk(key, &chunk.data)
                .with_context(|| format!("decrypting chunk at position {position}"))?;
            out.write_all(&plain)
                .with_context(|| format!("writing {}", output.display()))?;
            pb.inc(chunk.data.len() as u64);
        }
        start = end;
    }
    out.flush()
        .with_context(|| format!("flushing {}", output.display()))?;
    pb.finish_and_clear();

    Ok(core.restore_stats().clone())
}

// ── `tds keygen-sim` ──────────────────────────────────────────────────────────

async fn cmd_keygen_sim(config: &TdsConfig, count: u64) -> Result<()> {
    let channel = connect(&config.client.key_server).await?;
    let mut client = KeyClient::new(
        channel,
        config.client.key_batch_size,
        config.client.mask_bits,
    );

    let spinner = make_spinner("keygen");
    spinner.set_message(format!("{count} synthetic chunks"));
    let started = Instant::now();
    client.simulate(count).await.context("key exchange failed")?;
    let elapsed = started.elapsed();
    let stats = client.shutdown().await?;
    spinner.finish_and_clear();

    let secs = elapsed.as_secs_f64();
    println!("keys:          {}", stats.chunks);
    println!("batches:       {}", stats.batches);
    println!("total:         {:.3} s", secs);
    println!(
        "key exchange:  {:.3} s",
        stats.exchange_time.as_secs_f64()
    );
    println!("derivation:    {:.3} s", stats.derive_time.as_secs_f64());
    if secs > 0.0 {
        println!("throughput:    {:.0} keys/s", stats.chunks as f64 / secs);
    }
    Ok(())
}

// ── `tds config show` ─────────────────────────────────────────────────────────

fn cmd_config_show(config: &TdsConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tds_core::types::ChunkKey;
    use tds_crypto::encrypt_chunk;
    use tds_storage::{ContainerManager, IndexBackend, ReadCache};

    #[test]
    fn tilde_expands_to_home() {
        let home = std::env::var("HOME").unwrap_or_default();
        assert_eq!(
            expand_tilde(Path::new("~/keys")),
            PathBuf::from(home).join("keys")
        );
        assert_eq!(expand_tilde(Path::new("/abs/keys")), PathBuf::from("/abs/keys"));
    }

    #[test]
    fn cli_parses_upload_and_restore() {
        let cli = Cli::try_parse_from(["tds", "upload", "a.txt", "b.txt"]).unwrap();
        assert!(matches!(cli.command, Commands::Upload { files } if files.len() == 2));

        let cli = Cli::try_parse_from(["tds", "restore", "a.txt", "/tmp/out"]).unwrap();
        assert!(matches!(cli.command, Commands::Restore { name, .. } if name == "a.txt"));

        assert!(Cli::try_parse_from(["tds", "upload"]).is_err());
    }

    fn storage_config(dir: &Path) -> StorageConfig {
        StorageConfig {
            container_dir: dir.join("containers"),
            recipe_dir: dir.join("recipes"),
            state_file: dir.join("state"),
            max_container_size: 64 * 1024,
            read_cache_containers: 1,
            chunk_index: dir.join("chunks.json"),
            filename_index: dir.join("files.json"),
        }
    }

    /// Stores already-encrypted chunks directly, bypassing the key server.
    fn store_encrypted(storage: &StorageConfig, key_dir: &Path, name: &str, parts: &[&[u8]]) {
        let file = file_name_hash(name);
        let mut chunks = Vec::new();
        let mut keys = KeyRecipe::new(file);
        for (i, part) in parts.iter().enumerate() {
            let key = ChunkKey::from_bytes([i as u8 + 1; 32]);
            let data = encrypt_chunk(&key, part).unwrap();
            chunks.push(tds_core::Chunk::new(
                i as u32,
                tds_chunks::fingerprint(&data),
                data,
            ));
            keys.push(key);
        }
        let entries: Vec<RecipeEntry> = chunks
            .iter()
            .map(|c| RecipeEntry {
                fingerprint: c.fingerprint,
                size: c.data.len() as u32,
                chunk_id: c.id,
            })
            .collect();

        let containers = ContainerManager::open(
            &storage.container_dir,
            &storage.state_file,
            storage.max_container_size as usize,
            ReadCache::new(1),
        )
        .unwrap();
        let mut core = StorageCore::new(
            containers,
            IndexBackend::open(&storage.chunk_index).unwrap(),
            IndexBackend::open(&storage.filename_index).unwrap(),
            &storage.recipe_dir,
        )
        .unwrap();
        core.store_chunks(&chunks).unwrap();
        core.store_recipe(&file, &entries).unwrap();
        drop(core);
        keys.save(key_dir).unwrap();
    }

    #[test]
    fn restore_writes_decrypted_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_config(dir.path());
        let key_dir = dir.path().join("keys");
        store_encrypted(&storage, &key_dir, "notes.txt", &[b"hello ", b"tds ", b"world"]);

        let output = dir.path().join("restored.txt");
        let stats = restore_file(&storage, &key_dir, "notes.txt", &output, 2).unwrap();
        assert_eq!(stats.chunks, 3);
        assert_eq!(std::fs::read(&output).unwrap(), b"hello tds world");
    }

    #[test]
    fn restore_without_key_recipe_fails() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_config(dir.path());
        let key_dir = dir.path().join("keys");
        store_encrypted(&storage, &key_dir, "a", &[b"abc"]);
        std::fs::remove_dir_all(&key_dir).unwrap();

        let output = dir.path().join("out");
        assert!(restore_file(&storage, &key_dir, "a", &output, 4).is_err());
    }

    #[test]
    fn restore_unknown_name_fails() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_config(dir.path());
        let output = dir.path().join("out");
        assert!(restore_file(&storage, &dir.path().join("keys"), "missing", &output, 4).is_err());
    }

    #[test]
    fn keys_of_stored_file_outlive_failed_upload() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_config(dir.path());
        let key_dir = dir.path().join("keys");

        let key = ChunkKey::from_bytes([9; 32]);
        let mut good = tds_core::Chunk::new(0, tds_chunks::fingerprint(b"x"), Vec::new());
        good.data = encrypt_chunk(&key, b"first file").unwrap();
        good.fingerprint = tds_chunks::fingerprint(&good.data);
        good.key = Some(key);
        let entry = RecipeEntry {
            fingerprint: good.fingerprint,
            size: good.data.len() as u32,
            chunk_id: 0,
        };

        let (tx, rx) = mpsc::channel(8);
        tx.try_send(PipelineItem::Chunk(good)).unwrap();
        tx.try_send(PipelineItem::Recipe {
            file_name_hash: file_name_hash("first"),
            entries: vec![entry],
        })
        .unwrap();
        // the second file's chunk never got a key
        tx.try_send(PipelineItem::Chunk(tds_core::Chunk::new(
            0,
            tds_chunks::fingerprint(b"y"),
            b"y".to_vec(),
        )))
        .unwrap();
        drop(tx);

        let core = StorageCore::open(&storage).unwrap();
        let mut sender = Sender::new(core, 4).on_file(key_recipe_sink(key_dir.clone()));
        assert!(sender.run_blocking(rx).is_err());
        drop(sender);

        let output = dir.path().join("first.out");
        restore_file(&storage, &key_dir, "first", &output, 4).unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), b"first file");
    }
}
