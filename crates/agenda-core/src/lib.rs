pub mod cli;
pub mod commands;
pub mod config;
pub mod datastore;
pub mod datetime;
pub mod filter;
pub mod render;
pub mod schedule;
pub mod store;
pub mod summary;

use std::ffi::OsString;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tracing::{
  debug,
  info
};

#[tracing::instrument(skip_all)]
pub fn run(
  raw_args: Vec<OsString>
) -> anyhow::Result<()> {
  let pre =
    cli::preprocess_args(&raw_args)?;
  let cli = cli::GlobalCli::parse_from(
    pre.cleaned_args
  );

  cli::init_tracing(
    cli.verbose,
    cli.quiet
  )?;

  info!(
    verbose = cli.verbose,
    quiet = cli.quiet,
    "starting agenda CLI"
  );
  debug!(?pre.rc_overrides, "preprocessed rc overrides");

  let mut cfg = config::Config::load(
    cli.agendarc.as_deref()
  )?;
  cfg.apply_overrides(
    pre.rc_overrides.into_iter().chain(
      cli
        .rc_overrides
        .into_iter()
        .map(|kv| (kv.key, kv.value))
    )
  );

  let data_dir =
    config::resolve_data_dir(
      &cfg,
      cli.data.as_deref()
    )
    .context(
      "failed to resolve data \
       directory"
    )?;

  let tz = datetime::resolve_timezone(
    cfg.get("timezone").as_deref()
  );
  debug!(timezone = %tz, "resolved timezone");

  let kv = datastore::FileKv::open(
    &data_dir
  )
  .with_context(|| {
    format!(
      "failed to open data directory \
       {}",
      data_dir.display()
    )
  })?;
  let gateway =
    datastore::StorageGateway::new(
      kv, tz
    )
    .with_keys(
      &cfg.schedule_key(),
      &cfg.filter_key()
    );
  let mut store =
    store::ScheduleStore::open(
      Box::new(gateway),
      tz
    );

  let mut renderer =
    render::Renderer::new(&cfg);
  let inv = cli::Invocation::parse(
    &cfg, cli.rest
  )?;

  commands::dispatch(
    &mut store,
    &mut renderer,
    inv,
    Utc::now()
  )?;

  info!("done");
  Ok(())
}
