#![cfg(unix)]

use anyhow::{bail, Context, Result};
use clap::Parser;
use crossbeam::channel::Sender;
use log::warn;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracefold::record::Collapser;
use tracefold::run::{run_flamegraph, run_strace, TraceMode};
use tracefold::trace::{Call, TraceParser};

/// Run a command and render a flame chart of its process tree.
#[derive(Debug, Parser)]
struct Args {
    /// output basename (OUTPUT.strace, OUTPUT.folded, OUTPUT.svg)
    #[arg(long)]
    output_base: Option<PathBuf>,

    /// what operations to trace (io is slower but more detailed)
    #[arg(long, value_enum, default_value_t)]
    mode: TraceMode,

    /// additional flamegraph options (e.g. --inverted), whitespace-separated
    #[arg(long)]
    flamegraph_options: Option<String>,

    /// flamegraph script to invoke
    #[arg(long, default_value = "flamegraph.pl")]
    flamegraph: String,

    /// collapse an existing trace ("-" for stdin) to stdout instead of
    /// running a command
    #[arg(long)]
    input: Option<PathBuf>,

    /// fail on the first unparseable trace line instead of skipping it
    #[arg(long)]
    strict: bool,

    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    match run(&args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<ExitCode> {
    if let Some(input) = &args.input {
        let stdout = io::stdout().lock();
        if input == Path::new("-") {
            let stdin = BufReader::new(io::stdin());
            collapse(stdin, args.strict, stdout)?;
        } else {
            let file = File::open(input)
                .with_context(|| format!("failed to open {}", input.display()))?;
            collapse(BufReader::new(file), args.strict, stdout)?;
        }
        return Ok(ExitCode::SUCCESS);
    }

    if args.command.is_empty() {
        bail!("either a command or --input is required");
    }

    let base = match &args.output_base {
        Some(base) => base.clone(),
        None => default_output_base(&args.command[0]),
    };
    let strace_path = PathBuf::from(format!("{}.strace", base.display()));
    let folded_path = PathBuf::from(format!("{}.folded", base.display()));
    let svg_path = PathBuf::from(format!("{}.svg", base.display()));

    let start = Instant::now();
    let status = run_strace(args.mode, &args.command, &strace_path)?;
    println!(
        "Ran \"{}\" in {:.2}s",
        args.command.join(" "),
        start.elapsed().as_secs_f32()
    );

    let trace_file = File::open(&strace_path)
        .with_context(|| format!("failed to open {}", strace_path.display()))?;
    let folded_file = File::create(&folded_path)
        .with_context(|| format!("failed to create {}", folded_path.display()))?;
    collapse(
        BufReader::new(trace_file),
        args.strict,
        BufWriter::new(folded_file),
    )?;

    let extra = args
        .flamegraph_options
        .as_deref()
        .unwrap_or_default()
        .split_whitespace()
        .map(str::to_owned)
        .collect::<Vec<_>>();
    run_flamegraph(&args.flamegraph, &folded_path, &svg_path, &extra)?;

    println!("strace: {}", strace_path.display());
    println!("folded: {}", folded_path.display());
    println!("chart:  {}", svg_path.display());

    // relay the traced command's exit code
    match status.code() {
        Some(code) => Ok(ExitCode::from(code as u8)),
        None => Ok(ExitCode::FAILURE),
    }
}

/// Parse on one thread and collapse on this one, streaming calls through a
/// channel so an arbitrarily long trace never sits in memory at once.
fn collapse(reader: impl BufRead + Send, strict: bool, mut out: impl Write) -> Result<()> {
    let (call_tx, call_rx) = crossbeam::channel::bounded::<Call>(1024);

    let collapser = std::thread::scope(|scope| -> Result<Collapser> {
        let parser = scope.spawn(move || parse_lines(reader, strict, call_tx));

        let mut collapser = Collapser::new();
        for call in call_rx {
            collapser.record(&call);
        }

        parser.join().expect("parser thread panicked")?;
        Ok(collapser)
    })?;

    collapser.render(&mut out)?;
    out.flush()?;
    Ok(())
}

fn parse_lines(reader: impl BufRead, strict: bool, call_tx: Sender<Call>) -> Result<()> {
    let mut parser = TraceParser::new();
    for line in reader.lines() {
        let line = line.context("failed to read trace")?;
        match parser.parse_line(&line) {
            Ok(Some(call)) => {
                if call_tx.send(call).is_err() {
                    // collapser went away
                    break;
                }
            }
            Ok(None) => {}
            Err(e) if strict => return Err(e.into()),
            Err(e) => warn!("skipping trace line: {}", e),
        }
    }
    Ok(())
}

fn default_output_base(command: &str) -> PathBuf {
    let argv0 = Path::new(command)
        .file_name()
        .map_or_else(|| "trace".to_owned(), |name| name.to_string_lossy().into_owned());
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    std::env::temp_dir().join(format!("{}-{}.{:06}", argv0, now.as_secs(), now.subsec_micros()))
}
