use anyhow::{Context, Result};
use clap::CommandFactory as _;

mod application_lifecycle;
mod auto_select;
mod bar;
mod command;
mod opts;
mod util;

fn main() {
    let opts: opts::Opt = opts::Opt::from_env();

    let log_level_filter = if opts.log_debug { log::LevelFilter::Debug } else { log::LevelFilter::Info };
    if std::env::var("RUST_LOG").is_ok() {
        pretty_env_logger::init_timed();
    } else {
        pretty_env_logger::formatted_timed_builder()
            .filter(Some("statusbar"), log_level_filter)
            .filter(Some("peer_registry"), log_level_filter)
            .init();
    }

    let result = match opts.action {
        opts::Action::ShellCompletions { shell } => {
            clap_complete::generate(shell, &mut opts::RawOpt::command(), "statusbar", &mut std::io::stdout());
            return;
        }
        opts::Action::Run(run_opts) => run(run_opts, opts.config),
    };

    if let Err(err) = result {
        log::error!("{:?}", err);
        std::process::exit(1);
    }
}

fn run(run_opts: opts::RunOpts, config: peer_registry::RegistryConfig) -> Result<()> {
    simple_signal::set_handler(&[simple_signal::Signal::Int, simple_signal::Signal::Term], move |_| {
        log::info!("Shutting down statusbar...");
        application_lifecycle::request_exit();
    });

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("statusbar")
        .build()
        .context("Failed to initialize tokio runtime")?;
    rt.block_on(bar::run(run_opts, config))
}
