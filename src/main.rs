use std::fs;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use npu_umd::device::Device;
use npu_umd::ui::{make_device, make_setup, run, UmdArgs};

pub fn main() -> anyhow::Result<()> {
    env_logger::init();

    let argv = UmdArgs::parse();
    let config = fs::read_to_string(&argv.config_path)
        .with_context(|| format!("failed to read config file {}", argv.config_path.display()))?;
    let setup = make_setup(&config, Some(argv)).context("cannot parse config toml")?;

    let device: Arc<dyn Device> = make_device(&setup)?;
    let summary = run(&setup, device)?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
