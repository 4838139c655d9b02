use clap::Parser;
use fieldreq::Cli;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    fieldreq::run(cli)?;
    Ok(())
}
