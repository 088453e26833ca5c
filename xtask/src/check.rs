use anyhow::Result;
use colored::Colorize;
use std::time::Instant;

use crate::step::{cargo, OnFailure};

pub fn run() -> Result<()> {
    println!();
    println!("{}", "🔍 Checking builds...".cyan().bold());
    println!();

    let total_start = Instant::now();

    // The library must stay no_std; the simulator only exists behind `std`.
    cargo(
        "Checking lmc-training (no_std)",
        &["check", "-p", "lmc-training", "--no-default-features"],
        OnFailure::Fail,
    )?;
    cargo(
        "Checking lmc-training with defmt",
        &["check", "-p", "lmc-training", "--features", "defmt"],
        OnFailure::Fail,
    )?;
    cargo(
        "Checking lmc-training host build with tracing",
        &["check", "-p", "lmc-training", "--features", "std,tracing"],
        OnFailure::Fail,
    )?;
    cargo(
        "Running clippy",
        &["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"],
        OnFailure::Warn,
    )?;
    if cargo("Checking formatting", &["fmt", "--all", "--check"], OnFailure::Warn)?.is_none() {
        eprintln!("     Run 'cargo fmt --all' to fix");
    }

    println!(
        "{}",
        format!(
            "✓ All checks completed in {:.2}s",
            total_start.elapsed().as_secs_f64()
        )
        .green()
        .bold()
    );
    println!();

    Ok(())
}
