//! Severity-filtered structured logging with per-subsystem contexts and
//! runtime-configurable sinks. Built on `slog`/`sloggers`, the way `flux::logging`
//! bootstraps its terminal logger, extended to multiple sinks with independent
//! per-context thresholds.

use serdeconv;
use slog::{self, Drain};
use sloggers::{Config as SloggersConfig, LoggerConfig};
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

pub const MAX_SINKS: usize = 8;

/// Closed set of subsystems. Order is stable; do not reorder without bumping the
/// config format, since `Config` files reference contexts by name.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum Context {
    Net = 0,
    Reactor = 1,
    Handle = 2,
    Tsvc = 3,
    Batch = 4,
    Udf = 5,
    Reply = 6,
    Ticker = 7,
    Hash = 8,
    Storage = 9,
    Config = 10,
}

impl Context {
    pub const COUNT: usize = 11;
    pub const ALL: [Context; Context::COUNT] = [
        Context::Net,
        Context::Reactor,
        Context::Handle,
        Context::Tsvc,
        Context::Batch,
        Context::Udf,
        Context::Reply,
        Context::Ticker,
        Context::Hash,
        Context::Storage,
        Context::Config,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Context::Net => "net",
            Context::Reactor => "reactor",
            Context::Handle => "handle",
            Context::Tsvc => "tsvc",
            Context::Batch => "batch",
            Context::Udf => "udf",
            Context::Reply => "reply",
            Context::Ticker => "ticker",
            Context::Hash => "hash",
            Context::Storage => "storage",
            Context::Config => "config",
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Severity {
    Critical = 0,
    Warning = 1,
    Info = 2,
    Debug = 3,
    Detail = 4,
}

impl Severity {
    fn from_u8(raw: u8) -> Severity {
        match raw {
            0 => Severity::Critical,
            1 => Severity::Warning,
            2 => Severity::Info,
            3 => Severity::Debug,
            _ => Severity::Detail,
        }
    }
}

/// Binary payload display style for `log_bytes`.
#[derive(Debug, Copy, Clone)]
pub enum DisplayStyle {
    HexDigest,
    HexSpaced,
    HexPacked,
    HexColumns,
    Base64,
    BitsSpaced,
    BitsColumns,
}

/// Lazily-rendered binary payload. Formatting only happens if the owning sink
/// actually accepts the record, so a filtered-out call never touches the bytes.
pub struct Hexy<'a> {
    bytes: &'a [u8],
    style: DisplayStyle,
}

impl<'a> Hexy<'a> {
    pub fn new(bytes: &'a [u8], style: DisplayStyle) -> Hexy<'a> {
        Hexy { bytes, style }
    }

    fn render(&self) -> String {
        match self.style {
            DisplayStyle::HexDigest | DisplayStyle::HexPacked => {
                self.bytes.iter().map(|b| format!("{:02x}", b)).collect()
            }
            DisplayStyle::HexSpaced => self
                .bytes
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect::<Vec<_>>()
                .join(" "),
            DisplayStyle::HexColumns => self
                .bytes
                .chunks(16)
                .map(|row| row.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(" "))
                .collect::<Vec<_>>()
                .join("\n"),
            DisplayStyle::Base64 => base64::encode(self.bytes),
            DisplayStyle::BitsSpaced => self
                .bytes
                .iter()
                .map(|b| format!("{:08b}", b))
                .collect::<Vec<_>>()
                .join(" "),
            DisplayStyle::BitsColumns => self
                .bytes
                .chunks(8)
                .map(|row| row.iter().map(|b| format!("{:08b}", b)).collect::<Vec<_>>().join(" "))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

impl<'a> slog::Value for Hexy<'a> {
    fn serialize(
        &self,
        _record: &slog::Record,
        key: slog::Key,
        serializer: &mut dyn slog::Serializer,
    ) -> slog::Result {
        serializer.emit_str(key, &self.render())
    }
}

struct SinkEntry {
    logger: slog::Logger,
    thresholds: Arc<Vec<AtomicU8>>,
    path: Option<PathBuf>,
}

/// The fault subsystem: owns up to `MAX_SINKS` sinks, each with its own
/// per-context severity threshold, plus a merged fast-path filter so hot call
/// sites can skip argument evaluation entirely when nothing would emit.
pub struct Fault {
    sinks: Vec<SinkEntry>,
    filter: Vec<AtomicU8>,
}

impl Fault {
    /// Default single-sink terminal logger at debug level, matching `flux::logging::init`'s
    /// bootstrap config.
    pub fn new() -> Fault {
        let config: LoggerConfig = serdeconv::from_toml_str(
            r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
        )
        .expect("default logger config must parse");

        let logger = config.build_logger().expect("default logger must build");

        let mut fault = Fault {
            sinks: Vec::with_capacity(MAX_SINKS),
            filter: Self::fresh_table(Severity::Critical),
        };
        fault.add_sink(logger, Severity::Debug, None);
        fault
    }

    fn fresh_table(default: Severity) -> Vec<AtomicU8> {
        (0..Context::COUNT).map(|_| AtomicU8::new(default as u8)).collect()
    }

    /// Registers a new sink with a uniform starting threshold across all contexts.
    /// `path` is recorded so `roll` can reopen file-backed sinks.
    pub fn add_sink(&mut self, logger: slog::Logger, default: Severity, path: Option<PathBuf>) {
        if self.sinks.len() >= MAX_SINKS {
            panic!("log sink capacity exceeded");
        }

        let thresholds = Arc::new(Self::fresh_table(default));

        for (ctx_idx, threshold) in thresholds.iter().enumerate() {
            let current = self.filter[ctx_idx].load(Ordering::Relaxed);
            let candidate = threshold.load(Ordering::Relaxed);
            if candidate > current {
                self.filter[ctx_idx].store(candidate, Ordering::Relaxed);
            }
        }

        self.sinks.push(SinkEntry { logger, thresholds, path });
    }

    /// Adjusts a single sink's threshold for one context and recomputes the fast filter.
    pub fn set_threshold(&self, sink_index: usize, context: Context, severity: Severity) {
        self.sinks[sink_index].thresholds[context as usize].store(severity as u8, Ordering::Relaxed);

        let mut max = 0u8;
        for sink in &self.sinks {
            let v = sink.thresholds[context as usize].load(Ordering::Relaxed);
            if v > max {
                max = v;
            }
        }
        self.filter[context as usize].store(max, Ordering::Relaxed);
    }

    /// Fast pre-filter: an atomic load, no locking. Call sites should guard expensive
    /// argument construction with this before calling `log`.
    #[inline]
    pub fn enabled(&self, context: Context, severity: Severity) -> bool {
        let threshold = self.filter[context as usize].load(Ordering::Relaxed);
        (severity as u8) <= threshold
    }

    pub fn log(&self, context: Context, severity: Severity, msg: &str) {
        if !self.enabled(context, severity) {
            return;
        }

        for sink in &self.sinks {
            let threshold = sink.thresholds[context as usize].load(Ordering::Relaxed);
            if (severity as u8) > threshold {
                continue;
            }

            match severity {
                Severity::Critical => slog::crit!(sink.logger, "{}", msg; "context" => context.name()),
                Severity::Warning => slog::warn!(sink.logger, "{}", msg; "context" => context.name()),
                Severity::Info => slog::info!(sink.logger, "{}", msg; "context" => context.name()),
                Severity::Debug => slog::debug!(sink.logger, "{}", msg; "context" => context.name()),
                Severity::Detail => slog::trace!(sink.logger, "{}", msg; "context" => context.name()),
            }
        }
    }

    /// Logs at critical severity, captures a backtrace, and terminates the
    /// process. Implemented as a panic rather than a direct abort so the
    /// composition root can choose `panic = "abort"` in its release profile
    /// while tests can still assert the failure with `#[should_panic]`.
    pub fn critical(&self, context: Context, msg: &str) -> ! {
        let bt = backtrace::Backtrace::new();
        self.log(context, Severity::Critical, &format!("{}\n{:?}", msg, bt));
        panic!("{}", msg.to_owned());
    }

    /// Same as `critical` but skips backtrace capture, for use inside the
    /// panic/signal handling path itself to avoid re-entrant unwinding.
    pub fn critical_no_stack(&self, context: Context, msg: &str) -> ! {
        self.log(context, Severity::Critical, msg);
        panic!("{}", msg.to_owned());
    }

    /// Reopens all file-backed sinks under their existing paths, to cooperate with
    /// external log rotation (e.g. logrotate's copytruncate).
    pub fn roll(&self) -> io::Result<()> {
        for sink in &self.sinks {
            if let Some(path) = &sink.path {
                OpenOptions::new().create(true).append(true).open(path)?;
            }
        }
        Ok(())
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    pub fn threshold(&self, sink_index: usize, context: Context) -> Severity {
        Severity::from_u8(self.sinks[sink_index].thresholds[context as usize].load(Ordering::Relaxed))
    }
}

/// Reopens every file-backed sink named by `path` for the default global fault
/// instance set up by the composition root. Kept as a free function so signal
/// handlers can call it without holding a reference cycle back into `Fault`.
pub fn reopen(path: &Path) -> io::Result<()> {
    OpenOptions::new().create(true).append(true).open(path)?;
    Ok(())
}
