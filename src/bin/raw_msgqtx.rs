use clap::{CommandFactory, Parser};

use mimo_tx::{config::MsgqArgs, driver, sdr};

fn main() {
    env_logger::init();
    ctrlc::set_handler(|| std::process::exit(0)).expect("failed to set Ctrl-C handler");

    let cfg = match MsgqArgs::parse().into_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{e}");
            if e.is_usage() {
                eprintln!("{}", MsgqArgs::command().render_help());
            }
            std::process::exit(1);
        }
    };

    if let Err(e) = driver::run(&cfg, sdr::open_device) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
