use anyhow::{Context as _, Result};
use clap::Args;

use crate::cli::Context;
use crate::models::SearchQuery;

#[derive(Debug, Args)]
pub struct SearchArgs {
    #[arg(required = true, help = "Search query text")]
    pub query: String,

    #[arg(long = "top-k", short = 'k', help = "Maximum number of results to return")]
    pub top_k: Option<u32>,

    #[arg(long, short = 'p', help = "Only search columns of this project")]
    pub project: Option<String>,

    #[arg(long, help = "Minimum similarity score threshold (-1.0 to 1.0)")]
    pub min_score: Option<f32>,
}

pub async fn handle_search(args: SearchArgs, ctx: &Context) -> Result<()> {
    let query = args.query.trim();
    if query.is_empty() {
        anyhow::bail!("search query cannot be empty");
    }

    if let Some(score) = args.min_score
        && !(-1.0..=1.0).contains(&score)
    {
        anyhow::bail!("min_score must be between -1.0 and 1.0");
    }

    let mut search = SearchQuery::new(query);
    search.top_k = args.top_k;
    search.project_id = args.project;
    search.min_score = args.min_score;

    if ctx.verbose {
        eprintln!("Query: \"{query}\"");
        if let Some(top_k) = search.top_k {
            eprintln!("  Top k: {top_k}");
        }
        if let Some(ref project) = search.project_id {
            eprintln!("  Project: {project}");
        }
    }

    let results = ctx
        .client()
        .search(search)
        .await
        .context("search failed")?;

    if ctx.verbose {
        eprintln!("Search took {}ms", results.duration_ms);
        eprintln!();
    }

    print!("{}", ctx.formatter().format_search_results(&results));
    Ok(())
}
