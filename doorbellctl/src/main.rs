use clap::Parser;

fn main() {
    let cli = doorbellctl::Cli::parse();
    if let Err(err) = doorbellctl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
