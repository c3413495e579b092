mod cmd;
use clap::{Parser, Subcommand};
use cmd::report::ReportArgs;
use eyre::Result;
use tracing_subscriber::EnvFilter;

#[derive(Subcommand, Debug)]
pub enum MemprofSubcommand {
    #[command(about = "Render a tree dump saved by memprof as a table or JSON report")]
    Report(ReportArgs),
}

#[derive(Parser, Debug)]
#[command(
    version,
    about,
    long_about = "memprof CLI: inspect memory profiles written by memprof

https://github.com/memprof-rs/memprof"
)]
pub struct MemprofArgs {
    #[command(subcommand)]
    pub cmd: MemprofSubcommand,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let root_args = MemprofArgs::parse();

    match root_args.cmd {
        MemprofSubcommand::Report(args) => {
            args.run()?;
        }
    }

    Ok(())
}
