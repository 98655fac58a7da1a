use clap::Parser;
use elle_cli::cli::{self, Args, CliError};
use elle_compiler::diagnostics;

fn main() {
    let args = Args::parse();

    if let Err(err) = cli::run(&args) {
        match err {
            CliError::Compile(err) => eprintln!("{}", diagnostics::report(&err)),
            other => eprintln!("error: {other}"),
        }
        std::process::exit(1);
    }
}
