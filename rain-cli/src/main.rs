use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use rain_playground::config::DEFAULT_LOCATABLE_MARKER;
use rain_playground::{BridgeConfig, CompileRequest, CompileSession, Diagnostic, GuardRegion};
use tracing::info;
use tracing_subscriber::filter::EnvFilter;
use walkdir::WalkDir;

/// Compile Rain sources with the prebuilt `rainc.wasm` compiler module.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(
        long,
        env = "RAINC_WASM",
        value_name = "PATH",
        default_value = "rainc.wasm",
        help = "Path to the compiler module"
    )]
    compiler: PathBuf,

    #[arg(short, long, conflicts_with = "input_dir", help = "Source file (reads stdin if omitted)")]
    input: Option<PathBuf>,

    #[arg(long, value_name = "DIR", help = "Compile every .rain file under DIR")]
    input_dir: Option<PathBuf>,

    #[arg(
        short,
        long,
        default_value = "out.wasm",
        help = "Output binary (a directory with --input-dir)"
    )]
    output: PathBuf,

    #[arg(long, value_name = "PATH", help = "Also write the LLVM IR")]
    emit_ir: Option<PathBuf>,

    #[arg(long, value_name = "PATH", help = "Also write the WAT disassembly")]
    emit_wat: Option<PathBuf>,

    #[arg(long)]
    optimize: bool,

    #[arg(
        long,
        value_name = "BYTES",
        default_value_t = GuardRegion::DEFAULT.bytes(),
        help = "Zeroed bytes appended after the source"
    )]
    guard: u32,

    #[arg(
        long,
        default_value = DEFAULT_LOCATABLE_MARKER,
        help = "File name the compiler uses for the source being compiled"
    )]
    marker: String,

    #[arg(long, value_enum, default_value_t = DiagnosticFormat::Human)]
    diagnostics: DiagnosticFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum DiagnosticFormat {
    Human,
    Json,
}

/// Where one compile writes its results.
struct Outputs {
    binary: PathBuf,
    ir: Option<PathBuf>,
    wat: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    execute(cli).await
}

async fn execute(cli: Cli) -> Result<()> {
    let config = BridgeConfig::default()
        .with_guard(GuardRegion::new(cli.guard))
        .with_locatable_marker(cli.marker.clone());
    let mut session = CompileSession::load(&cli.compiler, config, ())
        .await
        .with_context(|| format!("failed to load compiler module {}", cli.compiler.display()))?;

    match &cli.input_dir {
        Some(dir) => compile_dir(&cli, &mut session, dir),
        None => compile_single(&cli, &mut session),
    }
}

fn compile_single(cli: &Cli, session: &mut CompileSession) -> Result<()> {
    let (name, source) = match &cli.input {
        Some(path) => {
            let source = fs::read_to_string(path)
                .with_context(|| format!("failed to read input file {}", path.display()))?;
            (path.display().to_string(), source)
        }
        None => {
            let mut buffer = String::new();
            io::stdin()
                .read_to_string(&mut buffer)
                .context("failed to read source from stdin")?;
            ("<stdin>".to_string(), buffer)
        }
    };

    let outputs = Outputs {
        binary: cli.output.clone(),
        ir: cli.emit_ir.clone(),
        wat: cli.emit_wat.clone(),
    };
    if !compile_one(cli, session, &name, &source, &outputs)? {
        bail!("compilation of {name} failed");
    }
    Ok(())
}

fn compile_dir(cli: &Cli, session: &mut CompileSession, dir: &Path) -> Result<()> {
    let mut sources = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("failed to walk {}", dir.display()))?;
        let is_rain = entry.path().extension().is_some_and(|ext| ext == "rain");
        if entry.file_type().is_file() && is_rain {
            sources.push(entry.into_path());
        }
    }
    if sources.is_empty() {
        bail!("no .rain files found under {}", dir.display());
    }

    let mut failed = 0usize;
    for path in &sources {
        let relative = path.strip_prefix(dir).unwrap_or(path);
        let source = fs::read_to_string(path)
            .with_context(|| format!("failed to read input file {}", path.display()))?;
        // Outputs mirror the layout of the input directory.
        let outputs = Outputs {
            binary: cli.output.join(relative.with_extension("wasm")),
            ir: cli.emit_ir.as_ref().map(|root| root.join(relative.with_extension("ll"))),
            wat: cli.emit_wat.as_ref().map(|root| root.join(relative.with_extension("wat"))),
        };
        if !compile_one(cli, session, &path.display().to_string(), &source, &outputs)? {
            failed += 1;
        }
    }

    info!(compiled = sources.len() - failed, failed, "batch finished");
    if failed > 0 {
        bail!("{failed} of {} sources failed to compile", sources.len());
    }
    Ok(())
}

/// Compile one source and write its outputs. Returns `false` when the
/// compiler reported a diagnostic.
fn compile_one(
    cli: &Cli,
    session: &mut CompileSession,
    name: &str,
    source: &str,
    outputs: &Outputs,
) -> Result<bool> {
    let request = CompileRequest::new(source).optimized(cli.optimize);
    session
        .compile(&request)
        .with_context(|| format!("compiler failed on {name}"))?;

    let outcome = session.outcome();
    if let Some(diagnostic) = outcome.diagnostic() {
        report(cli.diagnostics, name, diagnostic)?;
        return Ok(false);
    }

    if let (Some(path), Some(ir)) = (&outputs.ir, outcome.ir()) {
        write_output(path, ir.as_bytes())?;
    }
    if let (Some(path), Some(wat)) = (&outputs.wat, outcome.disassembly()) {
        write_output(path, wat.as_bytes())?;
    }

    let artifact = session
        .artifact()
        .with_context(|| format!("compiler reported no binary for {name}"))?;
    let written = artifact
        .save(&outputs.binary)
        .with_context(|| format!("failed to write output file {}", outputs.binary.display()))?;
    println!("wrote {} ({})", written.display(), artifact.size_label());
    Ok(true)
}

fn report(format: DiagnosticFormat, name: &str, diagnostic: &Diagnostic) -> Result<()> {
    match format {
        DiagnosticFormat::Human => match &diagnostic.span {
            Some(span) => eprintln!(
                "error: {name}:{}:{}-{}: {}",
                span.line, span.column, span.end_column, diagnostic.message
            ),
            None => eprintln!("error: {name}: {}", diagnostic.message),
        },
        DiagnosticFormat::Json => {
            let value = serde_json::json!({
                "file": name,
                "message": diagnostic.message,
                "marker": diagnostic.marker(),
            });
            println!(
                "{}",
                serde_json::to_string(&value).context("failed to serialize diagnostic")?
            );
        }
    }
    Ok(())
}

fn write_output(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
    }
    fs::write(path, bytes)
        .with_context(|| format!("failed to write output file {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_cmd::Command;
    use predicates::prelude::*;
    use tempfile::{TempDir, tempdir};

    fn workspace() -> (TempDir, PathBuf) {
        let dir = tempdir().expect("tempdir");
        let compiler = dir.path().join("rainc.wasm");
        fs::write(&compiler, rainc_stub::stub_compiler()).expect("write stub compiler");
        (dir, compiler)
    }

    fn rain_cli(compiler: &Path) -> Command {
        let mut cmd = Command::cargo_bin("rain-cli").expect("binary exists");
        cmd.env_remove("RAINC_WASM").arg("--compiler").arg(compiler);
        cmd
    }

    #[test]
    fn compiles_single_file() {
        let (dir, compiler) = workspace();
        let input_path = dir.path().join("main.rain");
        fs::write(&input_path, "fn main() {}").expect("write input");
        let output_path = dir.path().join("build").join("main.wasm");

        rain_cli(&compiler)
            .arg("--input")
            .arg(&input_path)
            .arg("--output")
            .arg(&output_path)
            .assert()
            .success()
            .stdout(predicate::str::contains("wrote").and(predicate::str::contains("(15 bytes)")));

        let wasm = fs::read(&output_path).expect("read output");
        assert_eq!(wasm, rainc_stub::STUB_BINARY);
    }

    #[test]
    fn output_directory_gets_default_file_name() {
        let (dir, compiler) = workspace();
        let input_path = dir.path().join("main.rain");
        fs::write(&input_path, "fn main() {}").expect("write input");
        let out_dir = dir.path().join("dist");
        fs::create_dir_all(&out_dir).expect("create output dir");

        rain_cli(&compiler)
            .arg("--input")
            .arg(&input_path)
            .arg("--output")
            .arg(&out_dir)
            .assert()
            .success();

        assert_eq!(
            fs::read(out_dir.join("out.wasm")).expect("read output"),
            rainc_stub::STUB_BINARY
        );
    }

    #[test]
    fn emits_ir_and_wat() {
        let (dir, compiler) = workspace();
        let input_path = dir.path().join("main.rain");
        fs::write(&input_path, "fn main() {}").expect("write input");
        let ir_path = dir.path().join("main.ll");
        let wat_path = dir.path().join("main.wat");

        rain_cli(&compiler)
            .arg("--input")
            .arg(&input_path)
            .arg("--output")
            .arg(dir.path().join("out.wasm"))
            .arg("--emit-ir")
            .arg(&ir_path)
            .arg("--emit-wat")
            .arg(&wat_path)
            .arg("--optimize")
            .assert()
            .success();

        let ir = fs::read_to_string(&ir_path).expect("read ir");
        assert!(ir.contains("define i32 @main"));
        let wat = fs::read_to_string(&wat_path).expect("read wat");
        assert!(wat.starts_with("(module"));
    }

    #[test]
    fn reads_source_from_stdin() {
        let (dir, compiler) = workspace();
        let output_path = dir.path().join("out.wasm");

        rain_cli(&compiler)
            .arg("--output")
            .arg(&output_path)
            .write_stdin("fn main() {}")
            .assert()
            .success();

        assert!(output_path.exists(), "wasm output was not created");
    }

    #[test]
    fn compiler_path_from_environment() {
        let (dir, compiler) = workspace();
        let input_path = dir.path().join("main.rain");
        fs::write(&input_path, "fn main() {}").expect("write input");
        let output_path = dir.path().join("out.wasm");

        Command::cargo_bin("rain-cli")
            .expect("binary exists")
            .env("RAINC_WASM", &compiler)
            .arg("--input")
            .arg(&input_path)
            .arg("--output")
            .arg(&output_path)
            .assert()
            .success();

        assert!(output_path.exists(), "wasm output was not created");
    }

    #[test]
    fn reports_located_diagnostic() {
        let (dir, compiler) = workspace();
        let input_path = dir.path().join("bad.rain");
        fs::write(&input_path, "!fn main() {}").expect("write input");
        let output_path = dir.path().join("out.wasm");

        rain_cli(&compiler)
            .arg("--input")
            .arg(&input_path)
            .arg("--output")
            .arg(&output_path)
            .assert()
            .failure()
            .stderr(predicate::str::contains(format!(
                "error: {}:1:1-2: unexpected token '!'",
                input_path.display()
            )));

        assert!(!output_path.exists(), "no binary after a failed compile");
    }

    #[test]
    fn reports_diagnostic_as_json() {
        let (dir, compiler) = workspace();
        let input_path = dir.path().join("bad.rain");
        fs::write(&input_path, "!").expect("write input");

        let assert = rain_cli(&compiler)
            .arg("--input")
            .arg(&input_path)
            .arg("--output")
            .arg(dir.path().join("out.wasm"))
            .arg("--diagnostics")
            .arg("json")
            .assert()
            .failure();

        let stdout = String::from_utf8_lossy(&assert.get_output().stdout).into_owned();
        let value: serde_json::Value =
            serde_json::from_str(stdout.trim()).expect("one JSON diagnostic");
        assert_eq!(value["message"], "unexpected token '!'");
        assert_eq!(value["marker"]["startLineNumber"], 1);
        assert_eq!(value["marker"]["endColumn"], 2);
        assert_eq!(value["marker"]["severity"], 8);
    }

    #[test]
    fn unmatched_marker_reports_plain_message() {
        let (dir, compiler) = workspace();
        let input_path = dir.path().join("bad.rain");
        fs::write(&input_path, "!").expect("write input");

        rain_cli(&compiler)
            .arg("--input")
            .arg(&input_path)
            .arg("--output")
            .arg(dir.path().join("out.wasm"))
            .arg("--marker")
            .arg("main.rain")
            .assert()
            .failure()
            .stderr(predicate::str::contains(format!(
                "error: {}: <unknown>:1:1",
                input_path.display()
            )));
    }

    #[test]
    fn compiles_directory_in_batch() {
        let (dir, compiler) = workspace();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("nested")).expect("create source tree");
        fs::write(src.join("a.rain"), "fn main() {}").expect("write a");
        fs::write(src.join("nested").join("b.rain"), "fn main() {}").expect("write b");
        fs::write(src.join("notes.txt"), "not a source").expect("write notes");
        let out = dir.path().join("out");

        rain_cli(&compiler)
            .arg("--input-dir")
            .arg(&src)
            .arg("--output")
            .arg(&out)
            .assert()
            .success();

        assert_eq!(fs::read(out.join("a.wasm")).expect("a.wasm"), rainc_stub::STUB_BINARY);
        assert_eq!(
            fs::read(out.join("nested").join("b.wasm")).expect("b.wasm"),
            rainc_stub::STUB_BINARY
        );
        assert!(!out.join("notes.wasm").exists());
    }

    #[test]
    fn batch_keeps_going_after_a_failure() {
        let (dir, compiler) = workspace();
        let src = dir.path().join("src");
        fs::create_dir_all(&src).expect("create source dir");
        fs::write(src.join("bad.rain"), "!oops").expect("write bad");
        fs::write(src.join("good.rain"), "fn main() {}").expect("write good");
        let out = dir.path().join("out");

        rain_cli(&compiler)
            .arg("--input-dir")
            .arg(&src)
            .arg("--output")
            .arg(&out)
            .assert()
            .failure()
            .stderr(predicate::str::contains("1 of 2 sources failed to compile"));

        assert!(out.join("good.wasm").exists());
        assert!(!out.join("bad.wasm").exists());
    }

    #[test]
    fn reports_missing_compiler_module() {
        let dir = tempdir().expect("tempdir");
        let input_path = dir.path().join("main.rain");
        fs::write(&input_path, "fn main() {}").expect("write input");

        rain_cli(&dir.path().join("missing.wasm"))
            .arg("--input")
            .arg(&input_path)
            .assert()
            .failure()
            .stderr(predicate::str::contains("failed to load compiler module"));
    }

    #[test]
    fn reports_compiler_trap() {
        let (dir, compiler) = workspace();
        let input_path = dir.path().join("crash.rain");
        fs::write(&input_path, "#crash").expect("write input");

        rain_cli(&compiler)
            .arg("--input")
            .arg(&input_path)
            .arg("--output")
            .arg(dir.path().join("out.wasm"))
            .assert()
            .failure()
            .stderr(predicate::str::contains("compiler failed on"));
    }

    #[test]
    fn input_and_input_dir_conflict() {
        Cli::try_parse_from(["rain-cli", "--input", "a.rain", "--input-dir", "src"])
            .expect_err("flags conflict");
    }

    #[test]
    fn defaults() {
        let cli = Cli::try_parse_from(["rain-cli", "--compiler", "c.wasm"]).expect("parse");
        assert_eq!(cli.output, PathBuf::from("out.wasm"));
        assert_eq!(cli.guard, 16);
        assert_eq!(cli.marker, "<unknown>");
        assert_eq!(cli.diagnostics, DiagnosticFormat::Human);
        assert!(!cli.optimize);
    }
}
