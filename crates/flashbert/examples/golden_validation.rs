//! Golden embedding validation against reference vectors.
//!
//! The cases file is a JSON array of `GoldenCase` objects, each holding a
//! packed request and the expected per-sequence vectors.
//!
//!    cargo run -p flashbert --example golden_validation -- <model_dir> <golden_cases.json> [backend]

use anyhow::{Context, Result};
use flashbert::prelude::*;
use std::path::Path;
use std::time::Instant;

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: golden_validation <model_dir> <golden_cases.json> [fused_kernel|vectorized_extension|generic]");
        std::process::exit(1);
    }
    let model_dir = Path::new(&args[1]);
    let golden_path = Path::new(&args[2]);

    println!("Golden Embedding Validation");
    println!("===========================\n");

    let harness = GoldenTestHarness::from_json_file(golden_path)
        .with_context(|| format!("failed to read {}", golden_path.display()))?;
    println!("Loaded {} cases", harness.cases().len());
    for case in harness.cases() {
        println!(
            "  - {}: {} sequences, {} tokens, tolerance {}",
            case.name,
            case.request.num_sequences(),
            case.request.num_tokens(),
            case.tolerance
        );
    }

    let mut builder = FlashBert::builder().model_path(model_dir);
    if let Some(backend) = args.get(3) {
        builder = builder.backend(backend.parse()?);
    }

    let load_start = Instant::now();
    let model = builder.build()?;
    println!(
        "\nLoaded model in {:.2}s ({} backend)\n",
        load_start.elapsed().as_secs_f64(),
        model.backend()
    );

    let summary = harness.validate(model.model());
    println!("{}", summary);

    if !summary.all_passed() {
        println!("\n--- Failures ---\n");
        for result in summary.results.values().filter(|r| !r.passed) {
            println!("Case: {}", result.name);
            if let Some(ref err) = result.error {
                println!("  Error: {}", err);
            }
            if let Some((seq, dim)) = result.first_divergence {
                println!("  First divergence at sequence {seq}, component {dim}");
            }
            println!(
                "  max abs {:.3e}, max rel {:.3e}\n",
                result.max_abs_error, result.max_rel_error
            );
        }
        eprintln!("{} of {} cases failed", summary.failed, summary.total);
        std::process::exit(1);
    }

    println!("\nAll golden cases passed!");
    Ok(())
}
