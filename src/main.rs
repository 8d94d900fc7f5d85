use std::io::{BufRead, Write};
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use nano_chat::{
    CancellationToken, ExtendingMethod, GenerationConfig, Pipeline, SamplingConfig,
};

#[derive(Parser, Debug)]
#[command(name = "nano-chat")]
#[command(about = "Chat with a local language model")]
struct Args {
    /// Weight file
    #[arg(short, long)]
    model: PathBuf,

    /// System prompt
    #[arg(short, long)]
    system: Option<String>,

    /// Single prompt; without it, read turns from stdin
    #[arg(short, long)]
    prompt: Option<String>,

    /// Maximum tokens generated per turn
    #[arg(long, default_value = "2048")]
    max_length: usize,

    /// Context length kept in the cache
    #[arg(long, default_value = "512")]
    max_context_length: usize,

    /// What to do when the context is full: shift or restart
    #[arg(long, default_value = "restart")]
    extending: ExtendingMethod,

    /// Threads for the tensor backend (0 = all cores)
    #[arg(short, long, default_value = "0")]
    threads: usize,

    /// Sampling seed
    #[arg(long)]
    seed: Option<u64>,

    /// Sampling temperature (0 = greedy)
    #[arg(long, default_value = "0.7")]
    temp: f32,

    #[arg(long, default_value = "20")]
    top_k: usize,

    #[arg(long, default_value = "0.7")]
    top_p: f32,
}

fn main() -> nano_chat::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut pipeline = Pipeline::from_file(&args.model)?;
    pipeline.set_extending_method(args.extending);
    if let Some(system) = &args.system {
        pipeline.set_system_prompt(system.clone());
    }

    let gen_config = GenerationConfig {
        max_length: args.max_length,
        max_context_length: args.max_context_length,
        sampling: SamplingConfig {
            do_sample: args.temp > 0.0,
            temperature: args.temp,
            top_k: args.top_k,
            top_p: args.top_p,
            seed: args.seed,
        },
        num_threads: args.threads,
    };
    let cancel = CancellationToken::new();
    let mut streamer = pipeline.text_streamer(|text: &str| {
        print!("{text}");
        let _ = std::io::stdout().flush();
    });

    if let Some(prompt) = args.prompt {
        pipeline.chat(&[prompt], &gen_config, &mut streamer, &cancel)?;
        println!();
        return Ok(());
    }

    let mut history: Vec<String> = Vec::new();
    let stdin = std::io::stdin();
    print!("You  > ");
    let _ = std::io::stdout().flush();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            print!("You  > ");
            let _ = std::io::stdout().flush();
            continue;
        }
        history.push(line);
        print!("A.I. > ");
        let _ = std::io::stdout().flush();
        let output = pipeline.chat(&history, &gen_config, &mut streamer, &cancel)?;
        history.push(output.text);
        print!("\nYou  > ");
        let _ = std::io::stdout().flush();
    }
    println!();
    Ok(())
}
