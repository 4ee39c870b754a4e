use std::fs;
use std::sync::Arc;

use clap::Parser;

use super::common::TWO_SUBGRAPHS;
use crate::device::{Device, Qos};
use crate::ui::{make_device, make_setup, run, UmdArgs};

const CONFIG: &str = r#"
[sim]
arch = "X3_1304MP2"
tick_interval_us = 10
grid_latency = 2

[mem]
ddr_size = 0x100_0000

[job]
tasks_per_group = 2

[run]
graph = "model.toml"
runs = 1
"#;

#[test]
fn cli_overrides_config_sections() {
    let setup = make_setup(CONFIG, None).expect("config");
    assert_eq!("X3_1304MP2", setup.sim.arch);
    assert_eq!(0x100_0000, setup.mem.ddr_size);
    assert_eq!(2, setup.job.tasks_per_group);
    assert_eq!(Qos::Slow, setup.job.qos);
    assert_eq!(Some(10_000), setup.run.timeout_ms);

    let args = UmdArgs::parse_from(["npu-umd", "config.toml", "--qos", "fast", "--runs", "3", "--dump", "true"]);
    let setup = make_setup(CONFIG, Some(args)).expect("config");
    assert_eq!(Qos::Fast, setup.job.qos);
    assert_eq!(3, setup.run.runs);
    assert!(setup.dump.emulation);
    assert_eq!(2, setup.job.tasks_per_group);
}

#[test]
fn run_loads_schedules_and_writes_outputs() {
    let dir = std::env::temp_dir().join(format!("npu-umd-run-{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).expect("scratch dir");
    fs::write(dir.join("model.toml"), TWO_SUBGRAPHS).expect("graph");
    fs::write(dir.join("in0.bin"), vec![3u8; 1024]).expect("input");

    let mut setup = make_setup(CONFIG, None).expect("config");
    setup.run.graph = dir.join("model.toml");
    setup.run.inputs = vec![dir.join("in0.bin")];
    setup.run.output_dir = Some(dir.join("out"));
    setup.run.runs = 2;

    let device: Arc<dyn Device> = make_device(&setup).expect("device");
    let summary = run(&setup, Arc::clone(&device)).expect("run");
    assert_eq!(7, summary.tcb_count);
    assert_eq!("Centralized", summary.strategy);
    assert_eq!(2, summary.runs.len());
    assert!(summary.runs.iter().all(|r| r.state == "Done" && r.output_bytes == vec![2048]));
    assert_eq!(2048, fs::read(dir.join("out/output0.bin")).expect("output").len());
    let _ = fs::remove_dir_all(&dir);
}
