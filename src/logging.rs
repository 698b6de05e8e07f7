use crate::Result;
use anyhow::Context;
use std::fs::OpenOptions;
use std::path::Path;
use tracing::{info, warn};
use tracing_appender::{non_blocking, non_blocking::WorkerGuard};
use tracing_subscriber::{fmt, prelude::*, registry, EnvFilter};

fn read_filter_file(logfilter_file: &Path) -> Option<String> {
  let filter = std::fs::read_to_string(logfilter_file).ok()?;
  let lines: Vec<_> = filter.lines()
    .map(|s| s.trim())
    .filter(|s| !s.is_empty() && !s.starts_with('#'))
    .collect();
  Some(lines.join(","))
}

fn build_and_set_global_subscriber(
  logfile: Option<&Path>,
  logfilter_file: Option<&Path>,
  is_test: bool,
) -> Result<Option<WorkerGuard>> {
  let filter_from_file = logfilter_file.and_then(read_filter_file);
  let filter_file_missing = logfilter_file.is_some() && filter_from_file.is_none();
  let using_filter_file = filter_from_file.is_some();

  let stderr_log = fmt::layer().with_target(false).without_time();
  let env_filter = filter_from_file.map(EnvFilter::new).unwrap_or_else(EnvFilter::from_default_env);
  let r = registry().with(stderr_log).with(env_filter);

  let flush_guard = match logfile {
    Some(p) => {
      let logfile = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(p)
        .with_context(|| format!("unable to open log file {:?}", p))?;
      let (writer, guard) = non_blocking::NonBlockingBuilder::default()
        .lossy(false)
        .finish(logfile);
      let json = fmt::layer()
        .json()
        .with_span_list(true)
        .with_current_span(false)
        .with_writer(writer);

      let r = r.with(json);
      if is_test { r.try_init().ok(); } else { r.try_init().context("global subscriber already set")?; }
      Some(guard)
    }
    None => {
      if is_test { r.try_init().ok(); } else { r.try_init().context("global subscriber already set")?; }
      None
    }
  };

  if let Some(filename) = logfilter_file {
    if using_filter_file {
      info!(?filename, "using log-filter file");
    } else if filter_file_missing {
      warn!(?filename, "unable to open log-filter file, falling back to RUST_LOG env var.");
    }
  }

  Ok(flush_guard)
}

/// Installs the global subscriber: human-readable output on stderr, and, if `logfile` is given,
/// newline-delimited JSON events in `logfile`.  The returned guard must be held until exit so the
/// file writer is flushed.
pub fn init_logging(logfile: Option<impl AsRef<Path>>, logfilter_file: Option<impl AsRef<Path>>) -> Result<Option<WorkerGuard>> {
  build_and_set_global_subscriber(
    logfile.as_ref().map(|p| p.as_ref()),
    logfilter_file.as_ref().map(|p| p.as_ref()),
    false,
  )
}

#[allow(dead_code)]
pub(crate) fn init_test_logging() {
  build_and_set_global_subscriber(None, None, true).ok();
}
