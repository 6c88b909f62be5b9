mod cli;

use clap::Parser;

fn main() {
    if let Err(err) = cli::dispatch(cli::Cli::parse()) {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}
