//! `steadfast config` – print the effective configuration.

use anyhow::Result;
use std::path::Path;
use steadfast_core::config::{self, CoreConfig};

pub fn run_config(cfg: &CoreConfig, path_only: bool, explicit: Option<&Path>) -> Result<()> {
    if path_only {
        let path = match explicit {
            Some(p) => p.to_path_buf(),
            None => config::config_path()?,
        };
        println!("{}", path.display());
        return Ok(());
    }
    print!("{}", toml::to_string_pretty(cfg)?);
    Ok(())
}
