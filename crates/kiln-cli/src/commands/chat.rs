//! `kiln chat` command implementation

use std::io::Write;
use std::path::Path;

use colored::Colorize;
use futures::StreamExt;
use kiln_foundation::router::ChatResponse;
use kiln_kernel::chat::ChatMessage;

use crate::cli::RunArgs;
use crate::output::{OutputFormat, print_json};

/// Execute the `kiln chat` command
pub async fn run(
    config: Option<&Path>,
    format: OutputFormat,
    model: &Path,
    system: Option<String>,
    messages: Vec<String>,
    run: &RunArgs,
) -> anyhow::Result<()> {
    let transcript = transcript(system, messages);
    let (runtime, handle) = super::runtime_with_model(config, model, run).await?;
    let stream = run.stream && format == OutputFormat::Text;

    let outcome = match runtime
        .router()
        .chat_completion(handle.id(), &transcript, super::generation_config(run), stream)
        .await
    {
        Ok(ChatResponse::Complete(completion)) if format == OutputFormat::Json => print_json(&completion),
        Ok(ChatResponse::Complete(completion)) => {
            println!("{} {}", "assistant:".bold(), completion.message.content);
            eprintln!(
                "{}",
                format!(
                    "{} prompt + {} completion tokens ({})",
                    completion.usage.prompt_tokens, completion.usage.completion_tokens, completion.finish_reason
                )
                .dimmed()
            );
            Ok(())
        }
        Ok(ChatResponse::Stream(mut deltas)) => {
            let mut stdout = std::io::stdout();
            print!("{} ", "assistant:".bold());
            let mut result = Ok(());
            while let Some(delta) = deltas.next().await {
                let delta = match delta {
                    Ok(delta) => delta,
                    Err(e) => {
                        result = Err(e.into());
                        break;
                    }
                };
                if let Some(usage) = delta.usage {
                    println!();
                    eprintln!(
                        "{}",
                        format!("{} prompt + {} completion tokens", usage.prompt_tokens, usage.completion_tokens)
                            .dimmed()
                    );
                    break;
                }
                print!("{}", delta.content);
                stdout.flush()?;
            }
            result
        }
        Err(e) => Err(e.into()),
    };

    super::shutdown(runtime).await?;
    outcome
}

fn transcript(system: Option<String>, messages: Vec<String>) -> Vec<ChatMessage> {
    system
        .map(ChatMessage::system)
        .into_iter()
        .chain(messages.into_iter().map(ChatMessage::user))
        .collect()
}
