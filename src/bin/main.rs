use anyhow::{Context, Result};
use clap::Parser;
use evcsp::config::Config;
use evcsp::instance::Instance;
use evcsp::run::{self, Mode};
use evcsp::*;
use std::path::PathBuf;
use tracing::{error, info};

/// Integrated electric vehicle and crew scheduling.
#[derive(Debug, Parser)]
#[clap(name = "evcsp")]
struct Args {
  /// Instance in JSON form
  instance: PathBuf,

  #[clap(long, arg_enum, default_value = "integrated")]
  mode: Mode,

  /// `Field: Value` parameter file, e.g. the `config.txt` of an earlier run
  #[clap(long, value_name = "FILE")]
  config: Option<PathBuf>,

  #[clap(long, value_name = "N")]
  threads: Option<usize>,

  /// Time limit of every integral solve
  #[clap(long, value_name = "SECS")]
  timelimit: Option<f64>,

  #[clap(long)]
  seed: Option<u64>,

  /// Directory in which the run directory is created
  #[clap(long, default_value = "runs")]
  output_root: PathBuf,

  /// Log file filter, one directive per line
  #[clap(long, default_value = "evcsp.logfilter")]
  logfilter: PathBuf,

  /// Don't print the solution breakdown
  #[clap(short, long)]
  quiet: bool,
}

impl Args {
  fn config(&self) -> Result<Config> {
    let mut cfg = match &self.config {
      Some(p) => Config::from_dump_file(p)?,
      None => Config::default(),
    };
    if let Some(n) = self.threads {
      cfg.threads = n;
    }
    if let Some(t) = self.timelimit {
      cfg.vsp_solver_timeout_sec = t;
      cfg.csp_solver_timeout_sec = t;
      cfg.vcsp_solver_timeout_sec = t;
    }
    if let Some(s) = self.seed {
      cfg.seed = s;
    }
    cfg.validate()?;
    Ok(cfg)
  }
}

fn main() -> Result<()> {
  let args = Args::parse();
  let cfg = args.config()?;

  let dir = run::create_run_dir(&args.output_root)?;
  let _g = logging::init_logging(Some(dir.join("log.ndjson")), Some(&args.logfilter))?;
  info!(instance = ?args.instance, mode = ?args.mode, dir = ?dir, "starting");
  cfg.write_dump(dir.join("config.txt"))?;

  rayon::ThreadPoolBuilder::new()
    .num_threads(cfg.threads)
    .build_global()
    .context("unable to build the worker pool")?;

  let inst = Instance::from_json_file(&args.instance)?;
  info!(trips = inst.trips.len(), locations = inst.locations.len(), "instance loaded");
  let env = model::build_env(Some(&dir.join("gurobi.log")), &cfg)?;

  let (solution, info) = match run::execute(&env, &inst, &cfg, args.mode, &dir) {
    Ok(r) => r,
    Err(e) => {
      error!(err = %e, "run failed");
      return Err(e);
    }
  };

  solution.write_json(dir.join("solution.json"))?;
  info.write_json(dir.join("info.json"))?;
  if !args.quiet {
    solution.print_breakdown(&cfg);
    run::stopwatch::print_laps(&info.time);
  }
  Ok(())
}
