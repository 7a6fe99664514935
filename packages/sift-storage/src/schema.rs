use crate::{Error, Result};

pub fn render_schema() -> String {
	let init = include_str!("../../../sql/init.sql");

	expand_includes(init)
}

/// Renders the per-index chunk table. `index_name` must already be a valid identifier.
pub fn render_index_schema(index_name: &str, vector_dim: u32) -> Result<String> {
	if !sift_config::is_identifier(index_name) {
		return Err(Error::InvalidArgument(format!("{index_name:?} is not a valid index name.")));
	}
	if vector_dim == 0 {
		return Err(Error::InvalidArgument("vector_dim must be greater than zero.".to_string()));
	}

	let template = include_str!("../../../sql/tables/010_chunk_nodes.sql");

	Ok(template
		.replace("<INDEX_NAME>", index_name)
		.replace("<VECTOR_DIM>", &vector_dim.to_string()))
}

fn expand_includes(sql: &str) -> String {
	let mut out = String::new();

	for line in sql.lines() {
		let trimmed = line.trim();

		if let Some(path) = trimmed.strip_prefix("\\ir ") {
			match path.trim() {
				"00_extensions.sql" => out.push_str(include_str!("../../../sql/00_extensions.sql")),
				"tables/001_documents.sql" =>
					out.push_str(include_str!("../../../sql/tables/001_documents.sql")),
				"tables/002_document_nodes.sql" =>
					out.push_str(include_str!("../../../sql/tables/002_document_nodes.sql")),
				"tables/003_embedding_cache.sql" =>
					out.push_str(include_str!("../../../sql/tables/003_embedding_cache.sql")),
				_ => out.push_str(line),
			}
		} else {
			out.push_str(line);
		}

		out.push('\n');
	}

	out
}
