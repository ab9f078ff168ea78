use framecache::cli::Args;
use framecache::config::{self, CacheConfig, PathConfig};
use framecache::core::{FindFilters, FrameCacheRegistry, FrameError, FrameQuery, Workers};
use framecache::decoder::{BlockDecoder, RawRgbaCodec};
use framecache::entities::{
    BlockType, ChunkSource, ContextImageSource, Dimension, FrameDecoder, MetadataSource, SessionType,
};
use framecache::local::LocalJobStore;

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Instant;

fn init_logging(args: &Args, path_config: &PathConfig) -> Result<()> {
    // 0 (default) = warn, 1 (-v) = info, 2 (-vv) = debug, 3+ (-vvv) = trace
    let log_level = match args.verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    if let Some(log_path_opt) = &args.log_file {
        let log_path = log_path_opt
            .as_ref()
            .cloned()
            .unwrap_or_else(|| config::data_file(config::LOG_FILE, path_config));
        let file = std::fs::File::create(&log_path)
            .with_context(|| format!("Failed to create log file: {}", log_path.display()))?;

        env_logger::Builder::new()
            .filter_level(log_level)
            .format_timestamp_millis()
            .target(env_logger::Target::Pipe(Box::new(file)))
            .init();

        info!("Logging to file: {} (level: {:?})", log_path.display(), log_level);
    } else {
        // respects RUST_LOG if set
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level.as_str()))
            .format_timestamp_millis()
            .init();
    }
    Ok(())
}

fn raw_decoder(block_type: BlockType, blocks: usize, dimension: Dimension) -> Box<dyn FrameDecoder> {
    Box::new(BlockDecoder::new(RawRgbaCodec, block_type, blocks, dimension))
}

fn checksum(pixels: &[u8]) -> u32 {
    pixels
        .iter()
        .fold(0u32, |acc, &b| acc.wrapping_mul(31).wrapping_add(b as u32))
}

fn main() -> Result<()> {
    let args = Args::parse();

    let path_config = PathConfig::from_env_and_cli(args.config_dir.clone());
    if let Err(e) = config::ensure_dirs(&path_config) {
        eprintln!("Warning: Failed to create application directories: {}", e);
    }
    init_logging(&args, &path_config)?;
    debug!("Command-line args: {:?}", args);

    let config_path = config::config_file(config::CONFIG_FILE, &path_config);
    let mut cache_config = CacheConfig::load(&config_path)?;
    if args.workers.is_some() {
        cache_config.workers = args.workers;
    }
    info!("Config: {:?}", cache_config);

    let store = match args.generate {
        Some(frames) => {
            let store = LocalJobStore::create(&args.store)?;
            store
                .write_synthetic_job(args.job, frames, args.chunk_size, args.frame_size(), args.related_files)
                .context("Failed to generate job")?;
            store
        }
        None => LocalJobStore::open(&args.store)?,
    };
    let store = Arc::new(store);

    let workers = Arc::new(
        Workers::new(cache_config.worker_threads()).context("Failed to start worker threads")?,
    );
    let registry = FrameCacheRegistry::new(
        cache_config,
        Arc::clone(&store) as Arc<dyn MetadataSource>,
        Arc::clone(&store) as Arc<dyn ContextImageSource>,
        Arc::new(raw_decoder),
        workers,
    );
    let chunks: Arc<dyn ChunkSource> = Arc::new(store.chunks(args.job));

    let meta = registry.get_frames_meta(SessionType::Job, args.job, false)?;
    let (first, last, chunk_size) = {
        let meta = meta.read();
        let count = meta.frame_count() as i64;
        (0, count - 1, meta.chunk_size())
    };
    println!(
        "job {}: {} frames, chunk size {}, {} deleted",
        args.job,
        last + 1,
        chunk_size,
        meta.read().deleted_frames().len()
    );

    for &frame in &args.delete {
        registry.delete_frame(args.job, frame)?;
    }
    for &frame in &args.restore {
        registry.restore_frame(args.job, frame)?;
    }

    let (start, end) = args.frame_range(first, last);
    let step = args.step.max(1);
    let started = Instant::now();
    let mut frame = start;
    while frame <= end {
        let query = FrameQuery {
            chunk_size,
            is_playing: args.play,
            step,
            ..FrameQuery::new(args.job, frame)
        };
        let handle = registry.get_frame(&query, Arc::clone(&chunks))?;
        let mut fetched = false;
        match handle.data(|| fetched = true) {
            Ok(image) => println!(
                "frame {:>6}  {}x{}  {:<20} {:<8} {:08x}{}",
                frame,
                image.render_width,
                image.render_height,
                handle.name,
                if fetched { "fetched" } else { "cached" },
                checksum(image.image.pixels()),
                if handle.deleted { "  deleted" } else { "" }
            ),
            Err(FrameError::Stale(_)) => println!("frame {:>6}  stale", frame),
            Err(err) => {
                warn!("Frame {} failed: {}", frame, err);
                println!("frame {:>6}  error: {}", frame, err);
            }
        }

        if args.context && handle.related_files > 0 {
            let images = registry.get_context_image(args.job, frame)?;
            println!("             {} context images", images.len());
        }
        frame += step as i64;
    }
    info!("Walked frames {}..={} in {:.1?}", start, end, started.elapsed());

    if let Some(find) = &args.find {
        if let [from, to] = find[..] {
            let filters = FindFilters {
                offset: args.offset,
                not_deleted: args.not_deleted,
            };
            match registry.find_frame(args.job, from, to, filters)? {
                Some(found) => println!("found frame {}", found),
                None => println!("no frame found"),
            }
        }
    }

    if args.save {
        let saved = registry.patch_meta(args.job)?;
        println!("saved: {} deleted frames", saved.read().deleted_frames().len());
    }

    match registry.stats(args.job) {
        Ok(stats) => println!(
            "stats: {} hits, {} misses ({:.1}% hit rate), {} chunk fetches, {} prefetches, {} stale",
            stats.hits,
            stats.misses,
            stats.hit_rate() * 100.0,
            stats.chunk_fetches,
            stats.prefetches,
            stats.stale
        ),
        Err(err) => debug!("No cache stats: {}", err),
    }
    println!("cached chunks: {:?}", registry.get_cached_chunks(args.job));

    registry.clear(args.job);
    Ok(())
}
