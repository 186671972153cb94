//! `kiln generate` command implementation

use std::io::Write;
use std::path::Path;

use colored::Colorize;
use futures::StreamExt;

use crate::cli::RunArgs;
use crate::output::{OutputFormat, print_json};

/// Execute the `kiln generate` command
pub async fn run(
    config: Option<&Path>,
    format: OutputFormat,
    model: &Path,
    prompt: &str,
    run: &RunArgs,
) -> anyhow::Result<()> {
    let (runtime, handle) = super::runtime_with_model(config, model, run).await?;
    let router = runtime.router().clone();
    let generation = super::generation_config(run);

    let outcome = if run.stream && format == OutputFormat::Text {
        stream(&router, handle.id(), prompt, generation).await
    } else {
        match router.generate(handle.id(), prompt, generation).await {
            Ok(result) if format == OutputFormat::Json => print_json(&result),
            Ok(result) => {
                println!("{}", result.text);
                eprintln!(
                    "{}",
                    format!(
                        "{} tokens in {} ms on {} ({})",
                        result.tokens_generated, result.time_taken_ms, result.backend, result.finish_reason
                    )
                    .dimmed()
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    };

    super::shutdown(runtime).await?;
    outcome
}

async fn stream(
    router: &kiln_foundation::InferenceRouter,
    model_id: &str,
    prompt: &str,
    generation: kiln_kernel::engine::GenerationConfig,
) -> anyhow::Result<()> {
    let mut tokens = router.generate_stream(model_id, prompt, generation).await?;
    let backend = tokens.backend();
    let mut stdout = std::io::stdout();
    let mut count = 0u32;
    while let Some(chunk) = tokens.next().await {
        let chunk = chunk?;
        if let Some(reason) = chunk.finish_reason {
            writeln!(stdout)?;
            eprintln!("{}", format!("{count} tokens on {backend} ({reason})").dimmed());
            break;
        }
        write!(stdout, "{}", chunk.text)?;
        stdout.flush()?;
        count += 1;
    }
    Ok(())
}
