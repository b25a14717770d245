use clap::{CommandFactory, Parser};

use mimo_tx::{config::MimoFileArgs, driver, sdr};

fn main() {
    env_logger::init();
    ctrlc::set_handler(|| std::process::exit(0)).expect("failed to set Ctrl-C handler");

    let cfg = match MimoFileArgs::parse().into_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error: {e}");
            if e.is_usage() {
                eprintln!("{}", MimoFileArgs::command().render_help());
            }
            std::process::exit(1);
        }
    };

    match driver::run(&cfg, sdr::open_device) {
        Ok(_) => println!("End of Transmission"),
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }
}
