mod app;

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use llmux::config;
use llmux::telemetry;
use tracing::info;

#[derive(Parser)]
#[command(name = "llmux", about = "Multi-tenant gateway for OpenAI-compatible LLM traffic")]
struct Args {
	/// Path to the YAML configuration file.
	#[arg(short, long)]
	config: Option<PathBuf>,
	/// Override the configured listen address.
	#[arg(short, long)]
	listen: Option<SocketAddr>,
}

fn main() -> anyhow::Result<()> {
	let args = Args::parse();
	telemetry::log::setup("info");

	let mut cfg = match &args.config {
		Some(path) => {
			let contents = std::fs::read_to_string(path)?;
			config::parse_config(&contents)?
		},
		None => config::Config::default(),
	};
	if let Some(listen) = args.listen {
		cfg.listen = listen;
	}

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?
		.block_on(run(cfg))
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
	let listen = cfg.listen;
	let (router, state) = app::build(cfg).await?;

	let listener = tokio::net::TcpListener::bind(listen).await?;
	info!(%listen, "llmux listening");

	let shutdown = state.shutdown.clone();
	axum::serve(
		listener,
		router.into_make_service_with_connect_info::<SocketAddr>(),
	)
	.with_graceful_shutdown(async move {
		let _ = tokio::signal::ctrl_c().await;
		info!("shutting down");
		shutdown.cancel();
	})
	.await?;
	Ok(())
}
