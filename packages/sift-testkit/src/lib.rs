mod error;

pub use error::{Error, Result};

use std::{env, str::FromStr};

use serde_json::Value;
use sqlx::{
	ConnectOptions, Connection, Executor, PgPool,
	postgres::{PgConnectOptions, PgConnection},
};
use uuid::Uuid;

use sift_config::Postgres;
use sift_storage::{db::Db, queries};

const ADMIN_DATABASES: [&str; 2] = ["postgres", "template1"];

/// A throwaway database on the server named by `SIFT_PG_DSN`. Call [`TestDatabase::cleanup`]
/// when done; nothing drops it implicitly.
pub struct TestDatabase {
	name: String,
	dsn: String,
	admin_options: PgConnectOptions,
}
impl TestDatabase {
	pub async fn new(base_dsn: &str) -> Result<Self> {
		let base_options = PgConnectOptions::from_str(base_dsn)
			.map_err(|err| Error::Message(format!("Failed to parse SIFT_PG_DSN: {err}.")))?;
		let (admin_options, mut admin_conn) = connect_admin(&base_options).await?;
		let name = format!("sift_test_{}", Uuid::new_v4().simple());

		admin_conn
			.execute(format!(r#"CREATE DATABASE "{name}""#).as_str())
			.await
			.map_err(|err| Error::Message(format!("Failed to create test database: {err}.")))?;

		let dsn = base_options.database(&name).to_url_lossy().to_string();

		Ok(Self { name, dsn, admin_options })
	}

	pub fn dsn(&self) -> &str {
		&self.dsn
	}

	pub fn postgres(&self) -> Postgres {
		Postgres { dsn: self.dsn.clone(), pool_max_conns: 2 }
	}

	/// Connects and bootstraps the shared tables plus a `vector_dim` chunk table for
	/// `index_name`.
	pub async fn seed_index(&self, index_name: &str, vector_dim: u32) -> Result<Db> {
		let db = Db::connect(&self.postgres()).await?;

		db.ensure_schema(vector_dim, &[index_name.to_string()]).await?;

		Ok(db)
	}

	pub async fn cleanup(self) -> Result<()> {
		let mut conn = PgConnection::connect_with(&self.admin_options).await.map_err(|err| {
			Error::Message(format!("Failed to connect to admin database for cleanup: {err}."))
		})?;
		let _ = sqlx::query(
			"\
SELECT pg_terminate_backend(pid)
FROM pg_stat_activity
WHERE datname = $1 AND pid <> pg_backend_pid()",
		)
		.bind(&self.name)
		.fetch_all(&mut conn)
		.await;

		conn.execute(format!(r#"DROP DATABASE IF EXISTS "{}""#, self.name).as_str())
			.await
			.map_err(|err| Error::Message(format!("Failed to drop test database: {err}.")))?;

		Ok(())
	}
}

/// One chunk row to insert under an index.
pub struct ChunkSeed<'a> {
	pub text: &'a str,
	pub embedding: &'a [f32],
	pub metadata: Value,
}

pub fn env_dsn() -> Option<String> {
	env::var("SIFT_PG_DSN").ok()
}

pub async fn insert_document(pool: &PgPool, name: &str, source_uri: Option<&str>) -> Result<Uuid> {
	let document_id = Uuid::new_v4();

	sqlx::query("INSERT INTO documents (document_id, name, source_uri) VALUES ($1, $2, $3)")
		.bind(document_id)
		.bind(name)
		.bind(source_uri)
		.execute(pool)
		.await?;

	Ok(document_id)
}

pub async fn insert_document_node(
	pool: &PgPool,
	document_id: Uuid,
	metadata: Value,
) -> Result<Uuid> {
	let node_id = Uuid::new_v4();

	sqlx::query("INSERT INTO document_nodes (node_id, document_id, metadata) VALUES ($1, $2, $3)")
		.bind(node_id)
		.bind(document_id)
		.bind(metadata)
		.execute(pool)
		.await?;

	Ok(node_id)
}

pub async fn insert_chunk(
	pool: &PgPool,
	index_name: &str,
	document_id: Uuid,
	seed: ChunkSeed<'_>,
) -> Result<Uuid> {
	let chunk_id = Uuid::new_v4();
	let sql = format!(
		"\
INSERT INTO {} (chunk_id, document_id, text, metadata, embedding)
VALUES ($1, $2, $3, $4, $5::text::vector)",
		queries::chunk_table(index_name)?
	);

	sqlx::query(&sql)
		.bind(chunk_id)
		.bind(document_id)
		.bind(seed.text)
		.bind(seed.metadata)
		.bind(queries::vector_to_pg(seed.embedding))
		.execute(pool)
		.await?;

	Ok(chunk_id)
}

async fn connect_admin(
	base_options: &PgConnectOptions,
) -> Result<(PgConnectOptions, PgConnection)> {
	let mut last_err = None;

	for database in ADMIN_DATABASES {
		let options = base_options.clone().database(database);

		match PgConnection::connect_with(&options).await {
			Ok(conn) => return Ok((options, conn)),
			Err(err) => last_err = Some(err),
		}
	}

	Err(Error::Message(format!("Failed to connect to an admin database: {last_err:?}.")))
}
