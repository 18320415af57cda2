use anyhow::Context;
use clap::Parser;

use querybench_cli::{Args, init_tracing, run};

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing();

    let config = args.to_config();
    config.validate().context("invalid configuration")?;

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(io_threads) = config.io_threads {
        builder.worker_threads(io_threads);
    }
    let runtime = builder.build().context("failed to build tokio runtime")?;

    runtime.block_on(run(config, &args.input))
}
