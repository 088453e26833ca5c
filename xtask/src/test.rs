use anyhow::Result;
use colored::Colorize;
use std::time::Instant;

use crate::step::{cargo, test_summary, OnFailure};

/// Simulator scenarios, one per file in crates/lmc-training/tests.
const SCENARIOS: [&str; 4] = ["bring_up", "deskew_properties", "rlevel_scenarios", "wlevel_vote"];

pub fn run(unit_only: bool, integration_only: bool) -> Result<()> {
    println!();
    println!("{}", "🧪 Running tests...".cyan().bold());
    println!();

    let total_start = Instant::now();

    if !integration_only {
        if let Some(out) = cargo(
            "Unit tests",
            &["test", "--lib", "--workspace"],
            OnFailure::Fail,
        )? {
            println!("    {}", test_summary(&out).dimmed());
        }
        cargo(
            "Register property tests",
            &["test", "-p", "lmc-hal", "--tests"],
            OnFailure::Fail,
        )?;
    }

    if !unit_only {
        for scenario in SCENARIOS {
            let label = format!("Scenario {scenario}");
            if let Some(out) = cargo(
                &label,
                &["test", "-p", "lmc-training", "--test", scenario],
                OnFailure::Fail,
            )? {
                println!("    {}", test_summary(&out).dimmed());
            }
        }
    }

    cargo("Doc tests", &["test", "--doc", "--workspace"], OnFailure::Warn)?;

    println!(
        "{}",
        format!(
            "✓ All tests completed in {:.2}s",
            total_start.elapsed().as_secs_f64()
        )
        .green()
        .bold()
    );
    println!();

    Ok(())
}
