//! Embedding example.
//!
//! Loads a model directory (or writes a small random one) and embeds a
//! handful of pre-tokenized sequences.
//!
//!    cargo run -p flashbert --example embed -- [model_dir] [float32|float16|bfloat16]

use anyhow::Result;
use flashbert::model::synthetic_checkpoint;
use flashbert::prelude::*;
use std::path::PathBuf;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

fn write_random_model(dir: &std::path::Path) -> Result<()> {
    let config = BertConfig {
        vocab_size: 1024,
        hidden_size: 128,
        num_hidden_layers: 2,
        num_attention_heads: 4,
        intermediate_size: 512,
        max_position_embeddings: 128,
        ..Default::default()
    };
    std::fs::write(dir.join("config.json"), serde_json::to_string_pretty(&config)?)?;
    let tensors = synthetic_checkpoint(&config, 7)?;
    candle_core::safetensors::save(&tensors, dir.join("model.safetensors"))?;
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    let scratch = tempfile::tempdir()?;
    let model_dir = match args.get(1) {
        Some(dir) => PathBuf::from(dir),
        None => {
            println!("No model directory given, using a random 2-layer model");
            write_random_model(scratch.path())?;
            scratch.path().to_path_buf()
        }
    };
    let dtype = args.get(2).map(String::as_str).unwrap_or("float32");

    let model = FlashBert::builder()
        .model_path(&model_dir)
        .dtype(dtype)
        .build()?;
    println!(
        "Loaded {} ({} backend, {} batches, hidden {})",
        model_dir.display(),
        model.backend(),
        model.batch_kind(),
        model.hidden_size()
    );

    let request = EmbedRequest::from_sequences(vec![
        (vec![101, 7, 42, 102], vec![0; 4]),
        (vec![101, 9, 102], vec![0; 3]),
        (vec![101, 3, 5, 8, 13, 21, 102], vec![0, 0, 0, 0, 1, 1, 1]),
    ]);

    let start = Instant::now();
    let batch = model.batch_from_request(&request)?;
    let embeddings = model.embed(&batch)?;
    println!("Embedded {} sequences in {:?}", embeddings.len(), start.elapsed());

    for (i, embedding) in embeddings.iter().enumerate() {
        let norm = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        println!(
            "  [{i}] norm {norm:.4}, head {:?}",
            &embedding[..embedding.len().min(4)]
        );
    }

    Ok(())
}
