//! `mrag search`: raw vector store search, without answer generation.
//!
//! Useful to check what `file_search` will see for a query and whether
//! attribute filters match.

use anyhow::Result;
use serde_json::Value;

use crate::answer::filters_from_pairs;
use crate::config::Config;
use crate::text::truncate_chars;
use crate::vector_store::{SearchHit, VectorStoreClient};

const EXCERPT_CHARS: usize = 240;

pub async fn run_search(
    config: &Config,
    query: &str,
    filter_pairs: &[String],
    limit: Option<u32>,
    as_json: bool,
) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    let filters = filters_from_pairs(filter_pairs)?;
    let store = VectorStoreClient::from_env(&config.openai)?;
    let max_results = limit.unwrap_or(config.assistant.max_num_results).clamp(1, 50);

    let mut hits = store.search(query, max_results, filters.as_ref()).await?;
    sort_hits(&mut hits);

    if as_json {
        println!("{}", serde_json::to_string_pretty(&hits)?);
        return Ok(());
    }
    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, hit) in hits.iter().enumerate() {
        let title = [attr(hit, "subject"), attr(hit, "filename"), hit.filename.as_str()]
            .into_iter()
            .find(|s| !s.is_empty())
            .unwrap_or("(untitled)");

        println!("{}. [{:.2}] {} / {}", i + 1, hit.score, attr(hit, "type"), title);
        if !attr(hit, "date_modified").is_empty() {
            println!("    updated: {}", truncate_chars(attr(hit, "date_modified"), 10));
        }
        if !attr(hit, "source").is_empty() {
            println!("    source: {}", attr(hit, "source"));
        }
        println!(
            "    excerpt: \"{}\"",
            truncate_chars(hit.content.replace('\n', " ").trim(), EXCERPT_CHARS)
        );
        println!("    file: {}", hit.file_id);
        println!();
    }

    Ok(())
}

fn attr<'a>(hit: &'a SearchHit, key: &str) -> &'a str {
    hit.attributes.get(key).and_then(Value::as_str).unwrap_or("")
}

/// Score descending, then file id for a stable order.
fn sort_hits(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.file_id.cmp(&b.file_id))
    });
}
