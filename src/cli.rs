use clap::Parser;
use std::path::PathBuf;

/// Walk the frames of a locally stored job through the frame cache
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Store directory holding job metadata, chunks and context images
    #[arg(value_name = "STORE_DIR")]
    pub store: PathBuf,

    /// Job to open
    #[arg(short = 'j', long = "job", value_name = "ID", default_value_t = 1)]
    pub job: u64,

    /// Write a synthetic job with N frames into the store before walking it
    #[arg(short = 'g', long = "generate", value_name = "FRAMES")]
    pub generate: Option<usize>,

    /// Frames per chunk for --generate
    #[arg(long = "chunk-size", value_name = "N", default_value_t = 8)]
    pub chunk_size: usize,

    /// Frame size for --generate
    #[arg(long = "size", value_names = ["WIDTH", "HEIGHT"], num_args = 2, default_values_t = [64, 48])]
    pub size: Vec<u32>,

    /// Context images per frame for --generate
    #[arg(long = "related", value_name = "N", default_value_t = 0)]
    pub related_files: usize,

    /// First job frame to request
    #[arg(long = "start", value_name = "N")]
    pub range_start: Option<i64>,

    /// Last job frame to request
    #[arg(long = "end", value_name = "N")]
    pub range_end: Option<i64>,

    /// Frame range (shorthand for --start and --end)
    #[arg(long = "range", value_names = ["START", "END"], num_args = 2)]
    pub range: Option<Vec<i64>>,

    /// Request frames in playback mode
    #[arg(short = 'p', long = "play")]
    pub play: bool,

    /// Frame step while walking
    #[arg(short = 's', long = "step", value_name = "N", default_value_t = 1)]
    pub step: usize,

    /// Also load context images of every walked frame
    #[arg(long = "context")]
    pub context: bool,

    /// Mark frame deleted (can be specified multiple times)
    #[arg(short = 'd', long = "delete", value_name = "FRAME")]
    pub delete: Vec<i64>,

    /// Restore deleted frame (can be specified multiple times)
    #[arg(short = 'r', long = "restore", value_name = "FRAME")]
    pub restore: Vec<i64>,

    /// Persist deleted/restored frames to the store
    #[arg(long = "save")]
    pub save: bool,

    /// Find a frame between FROM and TO (direction follows the order)
    #[arg(long = "find", value_names = ["FROM", "TO"], num_args = 2)]
    pub find: Option<Vec<i64>>,

    /// Return the n-th match of --find
    #[arg(long = "offset", value_name = "N", default_value_t = 1)]
    pub offset: usize,

    /// Skip deleted frames in --find
    #[arg(long = "not-deleted")]
    pub not_deleted: bool,

    /// Enable debug logging to file (default: framecache.log)
    #[arg(short = 'l', long = "log", value_name = "LOG_FILE")]
    pub log_file: Option<Option<PathBuf>>,

    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,

    /// Custom configuration directory (overrides default platform paths)
    #[arg(short = 'c', long = "config-dir", value_name = "DIR")]
    pub config_dir: Option<PathBuf>,

    /// Worker threads (overrides the config file)
    #[arg(long = "workers", value_name = "N")]
    pub workers: Option<usize>,
}

impl Args {
    /// Requested frame range; open ends are filled from `[first, last]`
    pub fn frame_range(&self, first: i64, last: i64) -> (i64, i64) {
        if let Some(range) = &self.range {
            if let [start, end] = range[..] {
                return (start, end);
            }
        }
        (self.range_start.unwrap_or(first), self.range_end.unwrap_or(last))
    }

    /// Frame size for --generate
    pub fn frame_size(&self) -> (u32, u32) {
        match self.size[..] {
            [width, height] => (width, height),
            _ => (64, 48),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["framecache", "/tmp/store"]).unwrap();
        assert_eq!(args.job, 1);
        assert_eq!(args.step, 1);
        assert_eq!(args.frame_size(), (64, 48));
        assert_eq!(args.frame_range(0, 9), (0, 9));
        assert!(args.log_file.is_none());
    }

    #[test]
    fn test_range_shorthand_wins() {
        let args = Args::try_parse_from([
            "framecache", "store", "--start", "1", "--range", "4", "6", "-vv",
        ])
        .unwrap();
        assert_eq!(args.frame_range(0, 9), (4, 6));
        assert_eq!(args.verbosity, 2);
    }

    #[test]
    fn test_edits_and_log_flag() {
        let args = Args::try_parse_from([
            "framecache", "store", "-d", "3", "-d", "5", "-r", "1", "--save", "--log",
        ])
        .unwrap();
        assert_eq!(args.delete, vec![3, 5]);
        assert_eq!(args.restore, vec![1]);
        assert!(args.save);
        assert_eq!(args.log_file, Some(None));
    }
}
