use clap::Parser;

use sift_retrieve::Args;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
	color_eyre::install()?;

	let args = Args::parse();

	sift_retrieve::run(args).await
}
