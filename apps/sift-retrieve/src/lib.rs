use std::path::PathBuf;

use clap::Parser;
use color_eyre::eyre;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use sift_config::Config;
use sift_service::{DetailedChunk, RetrieveRequest, SiftService, TracingSink};
use sift_storage::db::Db;

#[derive(Debug, Parser)]
#[command(
	version = sift_cli::VERSION,
	rename_all = "kebab",
	styles = sift_cli::styles(),
)]
pub struct Args {
	#[arg(long, short = 'c', value_name = "FILE")]
	pub config: PathBuf,
	#[arg(long, short = 'i', value_name = "NAME")]
	pub index: String,
	#[arg(value_name = "QUERY", required_unless_present = "clear_cache")]
	pub query: Option<String>,
	#[arg(long, value_name = "N")]
	pub top_k: Option<u32>,
	#[arg(long, value_name = "N")]
	pub search_top_k: Option<u32>,
	/// JSON object merged into the index's configured metadata filters.
	#[arg(long, value_name = "JSON")]
	pub filters: Option<String>,
	#[arg(long)]
	pub no_cache: bool,
	/// Attach document name and source URI to each chunk.
	#[arg(long)]
	pub details: bool,
	/// Drop every cached query embedding and exit.
	#[arg(long)]
	pub clear_cache: bool,
}

#[derive(Debug, Serialize)]
struct RetrieveOutput {
	retrieve_id: Uuid,
	index: String,
	query: String,
	chunks: OutputChunks,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum OutputChunks {
	Plain(Vec<sift_service::Chunk>),
	Detailed(Vec<DetailedChunk>),
}

pub async fn run(args: Args) -> color_eyre::Result<()> {
	let config = sift_config::load(&args.config)?;

	init_tracing(&config);

	let filters = args.filters.as_deref().map(parse_filters).transpose()?;
	let index_names: Vec<String> = config.indexes.iter().map(|index| index.name.clone()).collect();
	let db = Db::connect(&config.storage.postgres).await?;

	db.ensure_schema(config.storage.vector_dim, &index_names).await?;

	let service = SiftService::new(config, db);

	if args.clear_cache {
		let dropped = service.clear_embedding_cache().await?;

		tracing::info!(dropped, "Embedding cache cleared.");

		return Ok(());
	}

	let query = args.query.ok_or_else(|| eyre::eyre!("A query is required."))?;
	let req = RetrieveRequest {
		index: args.index.clone(),
		query: query.clone(),
		top_k: args.top_k,
		search_top_k: args.search_top_k,
		filters,
		use_cache: args.no_cache.then_some(false),
	};
	let response = service.retrieve(req, &TracingSink).await?;
	let chunks = if args.details {
		OutputChunks::Detailed(service.extend_result_details(response.chunks).await?)
	} else {
		OutputChunks::Plain(response.chunks)
	};
	let output =
		RetrieveOutput { retrieve_id: response.retrieve_id, index: args.index, query, chunks };
	let json = serde_json::to_string_pretty(&output)?;

	println!("{json}");

	Ok(())
}

fn init_tracing(config: &Config) {
	let filter =
		EnvFilter::try_new(&config.service.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

	tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn parse_filters(raw: &str) -> color_eyre::Result<Map<String, Value>> {
	match serde_json::from_str::<Value>(raw)? {
		Value::Object(map) => Ok(map),
		_ => Err(eyre::eyre!("--filters must be a JSON object.")),
	}
}
