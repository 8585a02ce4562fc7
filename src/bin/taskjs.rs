//! taskjs REPL
//!
//! Interactive JavaScript shell and script runner.
//!
//! ```text
//! taskjs [--civet] [-C dir] [file [args...]]
//! ```

use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use taskjs::{Dialect, EngineConfig, EvalFileOptions, EvalOptions, Interpreter};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Default)]
struct Args {
    dialect: Dialect,
    dir: Option<PathBuf>,
    file: Option<PathBuf>,
    script_args: Vec<String>,
}

fn parse_args(mut argv: impl Iterator<Item = String>) -> Result<Args, String> {
    let mut args = Args::default();
    while let Some(arg) = argv.next() {
        match arg.as_str() {
            "--civet" => args.dialect = Dialect::Civet,
            "-C" => {
                let dir = argv.next().ok_or("-C requires a directory")?;
                args.dir = Some(PathBuf::from(dir));
            }
            "-h" | "--help" => return Err(usage()),
            _ => {
                args.file = Some(PathBuf::from(arg));
                args.script_args = argv.collect();
                break;
            }
        }
    }
    Ok(args)
}

fn usage() -> String {
    "usage: taskjs [--civet] [-C dir] [file [args...]]".to_string()
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("TASKJS_LOG"))
        .with_writer(io::stderr)
        .init();

    let mut argv = std::env::args();
    let argv0 = argv.next().unwrap_or_else(|| "taskjs".to_string());
    let args = match parse_args(argv) {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{}", msg);
            return ExitCode::from(2);
        }
    };

    let interpreter = match EngineConfig::from_env().and_then(|config| Interpreter::new(&config)) {
        Ok(interpreter) => interpreter,
        Err(e) => {
            eprintln!("taskjs: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match args.file {
        Some(ref file) => run_file(&interpreter, &argv0, file, &args),
        None => run_repl(&interpreter, &args),
    }
}

fn run_file(interpreter: &Interpreter, argv0: &str, file: &PathBuf, args: &Args) -> ExitCode {
    let mut stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut stderr = io::stderr();

    let mut options = EvalFileOptions::new(file)
        .argv0(argv0)
        .args(args.script_args.iter().cloned())
        .dialect(args.dialect)
        .stdout(&mut stdout)
        .stderr(&mut stderr);
    if let Some(dir) = &args.dir {
        options = options.dir(dir);
    }
    // Input is read up front; a terminal would block until EOF
    if !stdin.is_terminal() {
        options = options.stdin(&mut stdin);
    }

    match interpreter.eval_file(options) {
        Ok(_) => ExitCode::SUCCESS,
        // Already written to stderr
        Err(e) if e.is_script_level() => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("taskjs: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run_repl(interpreter: &Interpreter, args: &Args) -> ExitCode {
    println!("taskjs - embedded QuickJS");
    println!("Each line runs as an async function body; use `return` for a value. Ctrl+D to exit.\n");

    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("taskjs: {}", e);
            return ExitCode::FAILURE;
        }
    };

    loop {
        match editor.readline("> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line);

                let mut stdout = io::stdout();
                let mut stderr = io::stderr();
                let mut options = EvalOptions::new(line)
                    .dialect(args.dialect)
                    .stdout(&mut stdout)
                    .stderr(&mut stderr);
                if let Some(dir) = &args.dir {
                    options = options.dir(dir);
                }
                if let Err(e) = interpreter.eval(options) {
                    if !e.is_script_level() {
                        eprintln!("taskjs: {}", e);
                    }
                }
                let _ = io::stdout().flush();
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => {
                println!();
                break;
            }
            Err(e) => {
                eprintln!("Error reading input: {}", e);
                return ExitCode::FAILURE;
            }
        }
    }
    ExitCode::SUCCESS
}
