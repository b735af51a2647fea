//! `delve` binary: parses arguments, installs logging and maps errors to exit codes

use delve_cli::{classify, cli, run, Exit};
use tracing_subscriber::EnvFilter;

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("log-json"));

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let exit = match run(&matches, &mut out) {
        Ok(exit) => exit,
        Err(err) => {
            let exit = classify(&err);
            if exit == Exit::NotFound {
                tracing::warn!("{err:#}");
            } else {
                tracing::error!("{err:#}");
            }
            eprintln!("delve: {err:#}");
            exit
        }
    };
    std::process::exit(exit.code());
}
