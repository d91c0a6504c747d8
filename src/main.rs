use clap::Parser;
use smb_manager::{Cli, Config, Manager};

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // clap prints its own usage/help text; the spec's own CLI
            // convention treats any argument error, help included, as a
            // non-zero-exit usage path (§4.J).
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let config = match Config::resolve(cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e:#}");
            std::process::exit(1);
        }
    };

    let ready = match Manager::init(config) {
        Ok(ready) => ready,
        Err(e) => {
            eprintln!("{e:#}");
            std::process::exit(1);
        }
    };

    match Manager::serve(ready) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("{e:#}");
            std::process::exit(255);
        }
    }
}
