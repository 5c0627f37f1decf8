//! `report-chat ask`: answer one question on the terminal.

use anyhow::Result;
use std::io::Write;

use crate::chain::{ChatEvent, ChatPipeline};
use crate::config::Config;

/// Stream the answer to stdout as tokens arrive, then list the sources.
pub async fn run_ask(config: &Config, question: &str) -> Result<()> {
    let pipeline = ChatPipeline::from_config(config).await?;
    let mut stream = pipeline.stream_chat(question, Vec::new(), None).await?;

    let mut sources = Vec::new();
    let mut finished = false;
    let mut out = std::io::stdout();
    while let Some(event) = stream.events.recv().await {
        match event {
            ChatEvent::Sources(s) => sources = s,
            ChatEvent::Token(t) => {
                write!(out, "{}", t)?;
                out.flush()?;
            }
            ChatEvent::RunId(_) => finished = true,
        }
    }
    println!();

    if !finished {
        anyhow::bail!("answer stream ended early (run {})", stream.run_id);
    }

    if !sources.is_empty() {
        println!();
        println!("Sources:");
        for s in &sources {
            println!(
                "  {} (p.{}) {}",
                s.name.as_deref().unwrap_or(&s.file),
                page_of(&s.source).map(|p| (p + 1).to_string()).unwrap_or_else(|| "?".into()),
                [s.author.as_deref(), s.date_published.as_deref()]
                    .iter()
                    .flatten()
                    .copied()
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
    }
    println!("run: {}", stream.run_id);
    Ok(())
}

/// 0-based page number encoded in a `<file>_<page>` source id.
fn page_of(source_id: &str) -> Option<i64> {
    source_id.rsplit_once('_').and_then(|(_, p)| p.parse().ok())
}
