use clap::Parser;

fn main() {
    let cli = reliefctl::Cli::parse();
    if let Err(err) = reliefctl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
