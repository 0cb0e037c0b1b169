//! CLI Commands
//!
//! File IO, configuration loading and progress reporting around the
//! `slothy-core` entry points.

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use slothy_core::arch::aarch64::AARCH64;
use slothy_core::arch::cortex_a55::CORTEX_A55;
use slothy_core::asm::pattern::AsmParser;
use slothy_core::config::Config;
use slothy_core::dfg::{Dfg, DfgConfig};
use slothy_core::Slothy;
use std::path::Path;
use std::time::Duration;

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        None => Ok(Config::default()),
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            let config: Config = serde_json::from_str(&text)
                .with_context(|| format!("failed to parse config {}", path.display()))?;
            Ok(config)
        }
    }
}

fn read_source(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))
}

fn write_output(path: Option<&Path>, text: &str) -> Result<()> {
    match path {
        None => {
            print!("{text}");
            Ok(())
        }
        Some(path) => std::fs::write(path, text)
            .with_context(|| format!("failed to write {}", path.display())),
    }
}

fn spinner(message: &'static str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner} {msg} [{elapsed}]")
            .expect("valid progress template"),
    );
    bar.set_message(message);
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}

/// Optimize a straight-line region.
pub fn optimize(
    input: &Path,
    output: Option<&Path>,
    start: Option<&str>,
    end: Option<&str>,
    config: Option<&Path>,
    stalls_first_attempt: Option<usize>,
    timeout: Option<u64>,
) -> Result<()> {
    let mut slothy = Slothy::new(&AARCH64, &CORTEX_A55);
    slothy.config = load_config(config)?;
    if let Some(stalls) = stalls_first_attempt {
        slothy.config.constraints.stalls_first_attempt = stalls;
    }
    if let Some(timeout) = timeout {
        slothy.config.timeout = Some(timeout);
    }

    slothy.load_source(&read_source(input)?);
    let bar = spinner("optimizing");
    let outcome = slothy.optimize(start, end);
    bar.finish_and_clear();
    outcome.context("optimization failed")?;

    write_output(output, &slothy.source_text())
}

/// Optimize a loop kernel.
pub fn optimize_loop(
    input: &Path,
    output: Option<&Path>,
    label: &str,
    config: Option<&Path>,
    sw_pipelining: bool,
    unroll: Option<usize>,
    timeout: Option<u64>,
) -> Result<()> {
    let mut slothy = Slothy::new(&AARCH64, &CORTEX_A55);
    slothy.config = load_config(config)?;
    if sw_pipelining {
        slothy.config.sw_pipelining.enabled = true;
        slothy.config.inputs_are_outputs = true;
    }
    if let Some(unroll) = unroll {
        slothy.config.sw_pipelining.unroll = unroll;
    }
    if let Some(timeout) = timeout {
        slothy.config.timeout = Some(timeout);
    }

    slothy.load_source(&read_source(input)?);
    let bar = spinner("optimizing loop");
    let outcome = slothy.optimize_loop(label);
    bar.finish_and_clear();
    outcome.with_context(|| format!("optimization of loop `{label}` failed"))?;

    write_output(output, &slothy.source_text())
}

/// Print the dataflow graph of a file's instructions.
pub fn dump_dfg(input: &Path, periodic: bool) -> Result<()> {
    let text = read_source(input)?;
    let lines = slothy_core::asm::split_source(&text);
    let instruction_lines = slothy_core::asm::instruction_lines(&lines);

    let parser = AsmParser::new(&AARCH64);
    let config = Config::default();
    let insts = parser
        .parse_body(&instruction_lines, &config.typing_hints)
        .context("failed to parse input")?;

    let mut dfg_cfg = DfgConfig::from_config(&config);
    if periodic {
        dfg_cfg = dfg_cfg.periodic();
    }
    let dfg = Dfg::build(insts, &dfg_cfg);

    for (i, node) in dfg.nodes.iter().enumerate() {
        println!("[{i:3}] depth {:2}  {}", node.depth, node.inst.render());
    }
    println!("inputs:  {:?}", dfg.inputs);
    println!("outputs: {:?}", dfg.outputs);
    Ok(())
}
