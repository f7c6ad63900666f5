//! xdna-pipeline: run the elementwise-add pipeline on the emulated driver.
//!
//! Usage: xdna-pipeline [--seed N] [--timeout-ms N] [--dump-program] [--stall] [--status]
//!        xdna-pipeline --sample-config

use std::env;
use std::sync::Arc;

use anyhow::{bail, Context};
use xdna_pipeline::config::Config;
use xdna_pipeline::design::ElementwiseDesign;
use xdna_pipeline::emu::Schedule;
use xdna_pipeline::host::{EmulatedDriver, EmulatorLowering, HostOrchestrator, Lowering};

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("warn")
    ).init();

    let args: Vec<String> = env::args().collect();
    let mut config = Config::get().clone();
    let mut dump_program = false;
    let mut stall = false;
    let mut show_status = false;

    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--seed" => {
                let value = iter.next().context("--seed needs a value")?;
                config.schedule_seed = Some(value.parse().with_context(|| format!("bad seed '{}'", value))?);
            }
            "--timeout-ms" => {
                let value = iter.next().context("--timeout-ms needs a value")?;
                config.wait_timeout_ms = value.parse().with_context(|| format!("bad timeout '{}'", value))?;
            }
            "--dump-program" => dump_program = true,
            "--stall" => stall = true,
            "--status" => show_status = true,
            "--sample-config" => {
                print!("{}", Config::sample_config());
                if let Some(path) = Config::user_config_path() {
                    eprintln!("(user config location: {})", path.display());
                }
                return Ok(());
            }
            other => bail!(
                "unknown argument '{}'\nUsage: {} [--seed N] [--timeout-ms N] [--dump-program] [--stall] [--status]",
                other,
                args[0]
            ),
        }
    }

    let design = ElementwiseDesign::default();
    let topology = Arc::new(design.topology().context("building pipeline topology")?);
    let program = if stall { design.starved_host_program()? } else { design.host_program()? };
    let binary = EmulatorLowering.lower(topology, &program, design.signature())?;

    println!("Pipeline: {} {} split {}x{}", design.kernel.name(), design.matrix, design.split.0, design.split.1);
    println!("Schedule: {:?}", config.schedule());
    println!("Host program: {} instructions, {} words", program.len(), binary.instructions.len());

    if dump_program {
        println!();
        for (i, instruction) in program.instructions().iter().enumerate() {
            println!("  [{:2}] {}", i, instruction);
        }
        println!();
        for (i, chunk) in binary.instructions.chunks(8).enumerate() {
            let words: Vec<String> = chunk.iter().map(|w| format!("{:08X}", w)).collect();
            println!("  {:04}: {}", i * 8, words.join(" "));
        }
    }

    let (a, b) = design.sample_inputs();
    let driver = EmulatedDriver::from_config(&config);
    let mut host = HostOrchestrator::new(driver, binary, config.wait_timeout());
    let result = host.execute(&[a.clone(), b.clone()]);

    if show_status {
        if let Some(engine) = host.driver().engine() {
            println!();
            engine.print_status();
        }
    }

    let outputs = result.context("running pipeline")?;
    let c = outputs.first().context("pipeline produced no output")?;

    println!();
    println!("C =");
    c.print();

    if *c != design.reference(&a, &b) {
        bail!("output does not match the host reference");
    }
    if config.schedule() == Schedule::InOrder {
        log::info!("Run with --seed N to shuffle executor order");
    }
    println!();
    println!("PASS");
    Ok(())
}
