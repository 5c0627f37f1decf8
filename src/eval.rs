//! `report-chat eval`: run a question set through the pipeline.
//!
//! The CSV needs a `Question` column; `Correct Value (if number)` and
//! `Correct reference` are optional. Each question is answered without
//! history. A case passes its reference check when one of the cited reports
//! matches `Correct reference`, and its value check when the answer contains
//! `Correct Value (if number)` (ignoring case and thousands separators).

use anyhow::{Context, Result};
use serde::Deserialize;
use std::io::Read;
use std::path::Path;

use report_chat_core::models::SourceInfo;

use crate::chain::{Answer, ChatPipeline};
use crate::config::Config;

#[derive(Debug, Clone, Deserialize)]
pub struct EvalCase {
    #[serde(rename = "Question", default)]
    pub question: Option<String>,
    #[serde(rename = "Correct Value (if number)", default)]
    pub expected_value: Option<String>,
    #[serde(rename = "Correct reference", default)]
    pub expected_reference: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaseScore {
    /// `None` when the case names no expected value.
    pub value_hit: Option<bool>,
    /// `None` when the case names no expected reference.
    pub reference_hit: Option<bool>,
}

/// Parse cases, dropping rows without a question.
pub fn read_cases<R: Read>(reader: R) -> Result<Vec<EvalCase>> {
    let mut rdr = csv::Reader::from_reader(reader);
    let mut cases = Vec::new();
    for (i, row) in rdr.deserialize::<EvalCase>().enumerate() {
        let case = row.with_context(|| format!("Invalid eval row {}", i + 1))?;
        if case.question.as_deref().is_some_and(|q| !q.trim().is_empty()) {
            cases.push(case);
        }
    }
    Ok(cases)
}

fn normalize(s: &str) -> String {
    s.trim().to_lowercase().replace(',', "")
}

fn non_empty(s: &Option<String>) -> Option<&str> {
    s.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn reference_matches(source: &SourceInfo, reference: &str) -> bool {
    let reference = normalize(reference);
    let file = normalize(&source.file);
    let stem = file
        .rsplit('/')
        .next()
        .unwrap_or(&file)
        .trim_end_matches(".pdf")
        .to_string();
    file.contains(&reference)
        || (!stem.is_empty() && reference.contains(&stem))
        || source
            .name
            .as_deref()
            .is_some_and(|n| normalize(n) == reference)
}

pub fn score(case: &EvalCase, answer: &str, sources: &[SourceInfo]) -> CaseScore {
    CaseScore {
        value_hit: non_empty(&case.expected_value)
            .map(|v| normalize(answer).contains(&normalize(v))),
        reference_hit: non_empty(&case.expected_reference)
            .map(|r| sources.iter().any(|s| reference_matches(s, r))),
    }
}

#[derive(Debug, Default)]
struct Tally {
    hits: usize,
    checked: usize,
}

impl Tally {
    fn add(&mut self, hit: Option<bool>) {
        if let Some(hit) = hit {
            self.checked += 1;
            if hit {
                self.hits += 1;
            }
        }
    }
}

fn mark(hit: Option<bool>) -> &'static str {
    match hit {
        Some(true) => "yes",
        Some(false) => "no",
        None => "-",
    }
}

pub async fn run_eval(config: &Config, csv_path: &Path) -> Result<()> {
    let file = std::fs::File::open(csv_path)
        .with_context(|| format!("Failed to open eval set: {}", csv_path.display()))?;
    let cases = read_cases(file)?;
    let pipeline = ChatPipeline::from_config(config).await?;

    println!("eval {} ({} questions)", csv_path.display(), cases.len());
    let mut values = Tally::default();
    let mut references = Tally::default();
    let mut errors = 0usize;

    for (i, case) in cases.iter().enumerate() {
        let question = case.question.as_deref().unwrap_or_default();
        println!();
        println!("[{}] {}", i + 1, question);
        match pipeline.answer(question, Vec::new()).await {
            Ok(Answer { answer, sources, run_id }) => {
                let s = score(case, &answer, &sources);
                values.add(s.value_hit);
                references.add(s.reference_hit);
                println!("  answer: {}", answer.trim());
                println!(
                    "  value: {}  reference: {}  run: {}",
                    mark(s.value_hit),
                    mark(s.reference_hit),
                    run_id
                );
            }
            Err(e) => {
                errors += 1;
                tracing::error!(question, error = %e, "eval question failed");
                println!("  error: {}", e);
            }
        }
    }

    println!();
    println!("values matched:     {} / {}", values.hits, values.checked);
    println!("references matched: {} / {}", references.hits, references.checked);
    println!("errors:             {}", errors);
    Ok(())
}
