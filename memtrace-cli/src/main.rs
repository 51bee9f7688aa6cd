//! `memtrace`: the CLI front-end for `memtrace-core`. Structured after
//! `examples/mstange-samply/samply/src/main.rs`'s `env_logger::init()` + `clap::Parser::parse()`
//! pairing.
//!
//! The dynamic instrumentation host that feeds live `AccessRecord`s into an [`Engine`] is a
//! separate, external component; what this binary owns end-to-end is flag parsing into an
//! `EngineConfig`, launching the target program, and propagating its exit code once the engine
//! has finalized and written its report. A real deployment links this crate's `Engine` into a
//! PIN-style shared object and drives it from `on_image_load`/`record_read`/... callbacks
//! instead of the stub `run` below.

mod cli;

use std::process::{Command, ExitCode};

use clap::Parser;
use memtrace_core::engine::Engine;
use memtrace_core::report::LoadedImage;

fn init_logging(opt: &cli::Opt) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(opt.log_level_filter());
    if opt.log_format == cli::LogFormatArg::Json {
        builder.format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                r#"{{"level":"{}","target":"{}","message":"{}"}}"#,
                record.level(),
                record.target(),
                record.args()
            )
        });
    }
    builder.init();
}

/// Runs the target program to completion under an (empty, un-instrumented) `Engine` and
/// writes the resulting report. Standing in for the PIN-driven callback loop that a real
/// instrumentation host would drive instead.
fn run(opt: &cli::Opt) -> Result<ExitCode, memtrace_core::error::EngineError> {
    let config = opt.to_engine_config();

    let (program, args) = opt
        .program_and_args
        .split_first()
        .expect("clap requires at least one trailing argument");

    log::info!("tracing {program} with {} argument(s)", args.len());

    let engine = Engine::new(config.clone(), 0, 0);

    let status = Command::new(program)
        .args(args)
        .status()
        .unwrap_or_else(|err| {
            log::error!("failed to launch {program}: {err}");
            std::process::exit(1);
        });

    let finalized = engine.finalize();
    Engine::write_report(&config, Vec::<LoadedImage>::new(), 0, &finalized)?;

    Ok(ExitCode::from(status.code().unwrap_or(1) as u8))
}

fn main() -> ExitCode {
    let opt = cli::Opt::parse();
    init_logging(&opt);

    match run(&opt) {
        Ok(code) => code,
        Err(err) => {
            log::error!("{err}");
            ExitCode::from(2)
        }
    }
}
