use std::collections::HashMap;
use std::fs;
use std::path::{
  Path,
  PathBuf
};

use anyhow::{
  Context,
  anyhow
};
use tracing::{
  debug,
  info,
  trace,
  warn
};

use crate::datastore::{
  DEFAULT_FILTER_KEY,
  DEFAULT_SCHEDULE_KEY
};

const RC_ENV_VAR: &str = "AGENDARC";
const RC_FILE_NAME: &str = ".agendarc";
const DEFAULT_DATA_DIR: &str = ".agenda";

#[derive(Debug, Clone)]
pub struct Config {
  map: HashMap<String, String>,
  pub loaded_files: Vec<PathBuf>
}

impl Default for Config {
  fn default() -> Self {
    let mut map = HashMap::new();
    map.insert(
      "data.location".to_string(),
      format!("~/{DEFAULT_DATA_DIR}")
    );
    map.insert(
      "default.command".to_string(),
      "list".to_string()
    );
    map.insert(
      "color".to_string(),
      "on".to_string()
    );
    map.insert(
      "storage.key".to_string(),
      DEFAULT_SCHEDULE_KEY.to_string()
    );
    map.insert(
      "storage.filter_key".to_string(),
      DEFAULT_FILTER_KEY.to_string()
    );

    Self {
      map,
      loaded_files: vec![]
    }
  }
}

impl Config {
  #[tracing::instrument(skip(
    rc_override
  ))]
  pub fn load(
    rc_override: Option<&Path>
  ) -> anyhow::Result<Self> {
    let mut cfg = Config::default();

    let rc = resolve_rc_path(rc_override)?;
    if let Some(path) = rc {
      info!(agendarc = %path.display(), "loading agendarc");
      cfg.load_file(&path)?;
    } else {
      debug!(
        "no agendarc found; using \
         defaults"
      );
    }

    Ok(cfg)
  }

  #[tracing::instrument(skip(
    self, overrides
  ))]
  pub fn apply_overrides<I>(
    &mut self,
    overrides: I
  ) where
    I: IntoIterator<
      Item = (String, String)
    >
  {
    for (k, v) in overrides {
      let key = k
        .strip_prefix("rc.")
        .unwrap_or(&k)
        .to_string();
      debug!(key = %key, value = %v, "applying override");
      self.map.insert(key, v);
    }
  }

  pub fn get(
    &self,
    key: &str
  ) -> Option<String> {
    self.map.get(key).cloned()
  }

  pub fn get_bool(
    &self,
    key: &str
  ) -> Option<bool> {
    self
      .map
      .get(key)
      .map(|v| parse_bool(v))
  }

  pub fn schedule_key(&self) -> String {
    self
      .get("storage.key")
      .unwrap_or_else(|| {
        DEFAULT_SCHEDULE_KEY.to_string()
      })
  }

  pub fn filter_key(&self) -> String {
    self
      .get("storage.filter_key")
      .unwrap_or_else(|| {
        DEFAULT_FILTER_KEY.to_string()
      })
  }

  #[tracing::instrument(skip(self))]
  fn load_file(
    &mut self,
    path: &Path
  ) -> anyhow::Result<()> {
    let path = expand_tilde(path);
    if self.loaded_files.contains(&path)
    {
      return Err(anyhow!(
        "include cycle at {}",
        path.display()
      ));
    }

    let text =
      fs::read_to_string(&path)
        .with_context(|| {
          format!(
            "failed to read {}",
            path.display()
          )
        })?;
    self
      .loaded_files
      .push(path.clone());

    let base_dir = path
      .parent()
      .map(Path::to_path_buf)
      .unwrap_or_default();

    for (idx, raw_line) in
      text.lines().enumerate()
    {
      let line_num = idx + 1;
      match classify_line(raw_line) {
        | RcLine::Blank => {}
        | RcLine::Include(target) => {
          let include_path =
            resolve_include_path(
              &base_dir, target
            )?;
          if include_path.exists() {
            debug!(
              file = %path.display(),
              include = %include_path.display(),
              line = line_num,
              "processing include"
            );
            self
              .load_file(&include_path)?;
          } else {
            warn!(include = %include_path.display(), "include file does not exist; skipping");
          }
        }
        | RcLine::Setting(key, value) => {
          trace!(key, value, "loaded config key");
          self.map.insert(
            key.to_string(),
            value.to_string()
          );
        }
        | RcLine::Malformed => {
          return Err(anyhow!(
            "invalid config line \
             {}:{line_num}: {raw_line}",
            path.display()
          ));
        }
      }
    }

    Ok(())
  }
}

#[derive(Debug, PartialEq, Eq)]
enum RcLine<'a> {
  Blank,
  Include(&'a str),
  Setting(&'a str, &'a str),
  Malformed
}

/// `key = value`, `include <path>`,
/// with `#` starting a comment anywhere.
fn classify_line(raw: &str) -> RcLine<'_> {
  let line = raw
    .split_once('#')
    .map_or(raw, |(before, _)| before)
    .trim();

  if line.is_empty() {
    RcLine::Blank
  } else if let Some(target) =
    line.strip_prefix("include ")
  {
    RcLine::Include(target.trim())
  } else if let Some((k, v)) =
    line.split_once('=')
  {
    RcLine::Setting(k.trim(), v.trim())
  } else {
    RcLine::Malformed
  }
}

#[tracing::instrument(skip(
  cfg,
  override_dir
))]
pub fn resolve_data_dir(
  cfg: &Config,
  override_dir: Option<&Path>
) -> anyhow::Result<PathBuf> {
  let dir = if let Some(path) =
    override_dir
  {
    path.to_path_buf()
  } else if let Some(cfg_value) =
    cfg.get("data.location")
  {
    expand_tilde(Path::new(&cfg_value))
  } else {
    default_data_dir()?
  };

  if !dir.exists() {
    info!(dir = %dir.display(), "creating data directory");
    fs::create_dir_all(&dir)
      .with_context(|| {
        format!(
          "failed to create {}",
          dir.display()
        )
      })?;
  }

  Ok(dir)
}

/// `--agendarc`, then `AGENDARC`
/// (`/dev/null` disables the rc file),
/// then `~/.agendarc` when it exists.
#[tracing::instrument(skip(
  override_path
))]
fn resolve_rc_path(
  override_path: Option<&Path>
) -> anyhow::Result<Option<PathBuf>> {
  if let Some(path) = override_path {
    return Ok(Some(path.to_path_buf()));
  }

  match std::env::var_os(RC_ENV_VAR) {
    | Some(value) if value == "/dev/null" => {
      debug!("agendarc disabled by {RC_ENV_VAR}");
      Ok(None)
    }
    | Some(value) => {
      Ok(Some(PathBuf::from(value)))
    }
    | None => {
      let Some(home) = dirs::home_dir()
      else {
        warn!(
          "cannot determine home \
           directory; skipping agendarc"
        );
        return Ok(None);
      };
      let candidate =
        home.join(RC_FILE_NAME);
      Ok(
        candidate
          .exists()
          .then_some(candidate)
      )
    }
  }
}

fn default_data_dir()
-> anyhow::Result<PathBuf> {
  let home = dirs::home_dir()
    .ok_or_else(|| {
      anyhow!(
        "cannot determine home \
         directory"
      )
    })?;
  Ok(home.join(DEFAULT_DATA_DIR))
}

fn resolve_include_path(
  base_dir: &Path,
  include: &str
) -> anyhow::Result<PathBuf> {
  if include.trim().is_empty() {
    return Err(anyhow!(
      "include path cannot be empty"
    ));
  }

  let raw = PathBuf::from(include);
  let expanded = expand_tilde(&raw);
  if expanded.is_absolute() {
    Ok(expanded)
  } else {
    Ok(base_dir.join(expanded))
  }
}

fn expand_tilde(
  path: &Path
) -> PathBuf {
  let text = path.to_string_lossy();
  if let Some(rest) =
    text.strip_prefix("~/")
    && let Some(home) = dirs::home_dir()
  {
    return home.join(rest);
  }
  path.to_path_buf()
}

fn parse_bool(s: &str) -> bool {
  matches!(
    s.trim()
      .to_ascii_lowercase()
      .as_str(),
    "1" | "y" | "yes" | "on" | "true"
  )
}

#[cfg(test)]
mod tests {
  use std::fs;

  use tempfile::tempdir;

  use super::{
    Config,
    RcLine,
    classify_line
  };

  #[test]
  fn rc_file_with_include_and_overrides()
   {
    let temp =
      tempdir().expect("tempdir");
    let extra = temp.path().join("extra.rc");
    fs::write(
      &extra,
      "storage.key = work_schedules\n"
    )
    .expect("write include");
    let rc = temp.path().join("agendarc");
    fs::write(
      &rc,
      "# personal settings\n\
       color = off   # plain output\n\
       timezone = Asia/Shanghai\n\
       include extra.rc\n"
    )
    .expect("write rc");

    let mut cfg = Config::load(Some(&rc))
      .expect("load config");
    assert_eq!(cfg.get_bool("color"), Some(false));
    assert_eq!(
      cfg.get("timezone").as_deref(),
      Some("Asia/Shanghai")
    );
    assert_eq!(
      cfg.schedule_key(),
      "work_schedules"
    );
    assert_eq!(
      cfg.filter_key(),
      "schedule_filter"
    );
    assert_eq!(cfg.loaded_files.len(), 2);

    cfg.apply_overrides(vec![(
      "rc.color".to_string(),
      "on".to_string()
    )]);
    assert_eq!(cfg.get_bool("color"), Some(true));
  }

  #[test]
  fn malformed_line_is_an_error() {
    let temp =
      tempdir().expect("tempdir");
    let rc = temp.path().join("agendarc");
    fs::write(&rc, "color on\n")
      .expect("write rc");
    let err = Config::load(Some(&rc))
      .expect_err("line without '='");
    assert!(
      format!("{err:#}")
        .contains("invalid config line")
    );
  }

  #[test]
  fn lines_are_classified() {
    assert_eq!(
      classify_line("  # comment"),
      RcLine::Blank
    );
    assert_eq!(
      classify_line(
        "color = off # plain"
      ),
      RcLine::Setting("color", "off")
    );
    assert_eq!(
      classify_line("include ~/work.rc"),
      RcLine::Include("~/work.rc")
    );
    assert_eq!(
      classify_line("color on"),
      RcLine::Malformed
    );
  }

  #[test]
  fn include_cycle_is_an_error() {
    let temp =
      tempdir().expect("tempdir");
    let rc = temp.path().join("agendarc");
    fs::write(&rc, "include agendarc\n")
      .expect("write rc");
    let err = Config::load(Some(&rc))
      .expect_err("self include");
    assert!(
      format!("{err:#}")
        .contains("include cycle")
    );
  }
}
