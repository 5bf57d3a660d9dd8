//! sysfence CLI - inspect, export and apply seccomp policies

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use sysfence::{Action, Capabilities, Policy};

#[derive(Parser)]
#[command(name = "sysfence")]
#[command(author, version, about = "Seccomp syscall filters from JSON policies")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report the seccomp API level of the running kernel
    Check,

    /// Compile a policy and write it out
    Export {
        /// Policy file
        policy: PathBuf,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Pfc)]
        format: Format,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Load a policy, then exec a command under it
    Run {
        /// Policy file
        policy: PathBuf,

        /// Command and its arguments
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    /// Raw BPF program, 8 bytes per instruction
    Bpf,
    /// Human-readable pseudo filter code
    Pfc,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sysfence=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check => check(),
        Commands::Export {
            policy,
            format,
            output,
        } => export(&policy, format, output),
        Commands::Run { policy, command } => run(&policy, &command),
    }
}

fn check() -> Result<()> {
    let caps = Capabilities::detect().context("seccomp filter mode unavailable")?;
    match caps.kernel_version() {
        Some(version) => println!("seccomp API level {} (kernel {version})", caps.level()),
        None => println!("seccomp API level {}", caps.level()),
    }

    let yes_no = |on: bool| if on { "yes" } else { "no" };
    println!("  thread sync  {}", yes_no(caps.supports_tsync()));
    println!("  log          {}", yes_no(caps.supports_log()));
    println!("  ssb          {}", yes_no(caps.supports_ssb()));
    println!("  notify       {}", yes_no(caps.supports_notify()));
    Ok(())
}

fn export(path: &Path, format: Format, output: Option<PathBuf>) -> Result<()> {
    let policy = Policy::from_file(path)?;
    let filter = policy
        .build()
        .with_context(|| format!("building {}", path.display()))?;

    let out: Box<dyn Write> = match &output {
        Some(out) => Box::new(BufWriter::new(
            File::create(out).with_context(|| format!("creating {}", out.display()))?,
        )),
        None => Box::new(io::stdout().lock()),
    };
    match format {
        Format::Bpf => filter.export_bpf(out)?,
        Format::Pfc => filter.export_pfc(out)?,
    }

    tracing::info!(policy = %path.display(), ?format, "exported");
    Ok(())
}

fn run(path: &Path, command: &[String]) -> Result<()> {
    let policy = Policy::from_file(path)?;
    if uses_notify(&policy) {
        bail!(
            "{}: notify rules need a supervisor, which run does not provide",
            path.display()
        );
    }
    let Some((program, args)) = command.split_first() else {
        bail!("no command given");
    };

    let mut filter = policy
        .build()
        .with_context(|| format!("building {}", path.display()))?;
    filter.load().context("loading filter")?;
    tracing::info!(policy = %path.display(), %program, "filter loaded, executing");

    let err = Command::new(program).args(args).exec();
    Err(err).with_context(|| format!("executing {program}"))
}

fn uses_notify(policy: &Policy) -> bool {
    policy.default_action == Action::Notify
        || policy.rules.iter().any(|rule| rule.action == Action::Notify)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_export() {
        let cli = Cli::try_parse_from(["sysfence", "export", "-f", "bpf", "p.json", "-o", "p.bpf"])
            .unwrap();
        match cli.command {
            Commands::Export {
                policy,
                format,
                output,
            } => {
                assert_eq!(policy, PathBuf::from("p.json"));
                assert_eq!(format, Format::Bpf);
                assert_eq!(output, Some(PathBuf::from("p.bpf")));
            }
            _ => panic!("expected export"),
        }

        let cli = Cli::try_parse_from(["sysfence", "export", "p.json"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Export {
                format: Format::Pfc,
                output: None,
                ..
            }
        ));
    }

    #[test]
    fn run_takes_command_after_separator() {
        let cli = Cli::try_parse_from(["sysfence", "run", "p.json", "--", "ls", "-l", "/"]).unwrap();
        match cli.command {
            Commands::Run { command, .. } => assert_eq!(command, ["ls", "-l", "/"]),
            _ => panic!("expected run"),
        }

        assert!(Cli::try_parse_from(["sysfence", "run", "p.json"]).is_err());
    }

    #[test]
    fn notify_rules_are_detected() {
        let plain = Policy::from_json(
            r#"{ "default_action": "allow", "rules": [{ "syscall": "read", "action": "log" }] }"#,
        )
        .unwrap();
        assert!(!uses_notify(&plain));

        let notify = Policy::from_json(
            r#"{ "default_action": "allow", "rules": [{ "syscall": "chdir", "action": "notify" }] }"#,
        )
        .unwrap();
        assert!(uses_notify(&notify));
    }
}
