use std::num::NonZeroUsize;

use jobpool::config::parse_jobs;
use jobpool::{ImplicitSlot, JobServerConfig};

pub const USAGE: &str = "\
Usage: jobpool-run [options] < commands.txt

Runs one shell command per line of stdin, bounded by a make-compatible
jobserver. A jobserver advertised in MAKEFLAGS is joined unless -j or
--no-inherit says otherwise.

Options:
  -j, --jobs <N>      Run at most N commands at once [env: JOBPOOL_JOBS]
  --implicit-slot     Count this process's own slot toward N
  --no-inherit        Ignore a jobserver advertised by the parent
  --report json       Print a JSON summary to stdout when done
  --shell <path>      Shell used to run each line [default: sh]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Args {
    pub jobs: Option<NonZeroUsize>,
    pub implicit_slot: ImplicitSlot,
    pub inherit: bool,
    pub report: Option<ReportFormat>,
    pub shell: String,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            jobs: None,
            implicit_slot: ImplicitSlot::Excluded,
            inherit: true,
            report: None,
            shell: "sh".to_string(),
        }
    }
}

impl Args {
    /// Layer command-line choices over the environment configuration.
    pub fn apply(&self, mut config: JobServerConfig) -> JobServerConfig {
        if let Some(jobs) = self.jobs {
            config = config.with_jobs(jobs);
        }
        config
            .with_implicit_slot(self.implicit_slot)
            .with_inherit(self.inherit)
    }
}

/// Parse `argv`. An empty error message means help was requested.
pub fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut parsed = Args::default();

    let jobs = |value: &str| parse_jobs(value).map_err(|e| e.to_string());

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "-j" | "--jobs" => {
                i += 1;
                let value = args.get(i).ok_or("--jobs requires a value")?;
                parsed.jobs = Some(jobs(value.as_str())?);
            }
            "--implicit-slot" => parsed.implicit_slot = ImplicitSlot::Included,
            "--no-inherit" => parsed.inherit = false,
            "--report" => {
                i += 1;
                parsed.report = match args.get(i).map(String::as_str) {
                    Some("json") => Some(ReportFormat::Json),
                    Some(other) => return Err(format!("unknown report format: {other}")),
                    None => return Err("--report requires a value".to_string()),
                };
            }
            "--shell" => {
                i += 1;
                parsed.shell = args.get(i).ok_or("--shell requires a value")?.clone();
            }
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with("--jobs=") => {
                parsed.jobs = Some(jobs(&arg["--jobs=".len()..])?);
            }
            arg if arg.starts_with("-j") => {
                parsed.jobs = Some(jobs(&arg[2..])?);
            }
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        std::iter::once("jobpool-run")
            .chain(args.iter().copied())
            .map(String::from)
            .collect()
    }

    fn level(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[test]
    fn no_flags_uses_defaults() {
        assert_eq!(parse_args(&argv(&[])).unwrap(), Args::default());
    }

    #[test]
    fn job_count_spellings() {
        for flags in [
            &["-j", "4"][..],
            &["-j4"][..],
            &["--jobs", "4"][..],
            &["--jobs=4"][..],
        ] {
            assert_eq!(parse_args(&argv(flags)).unwrap().jobs, Some(level(4)), "{flags:?}");
        }
    }

    #[test]
    fn all_options() {
        let args = parse_args(&argv(&[
            "-j2",
            "--implicit-slot",
            "--no-inherit",
            "--report",
            "json",
            "--shell",
            "/bin/bash",
        ]))
        .unwrap();

        assert_eq!(
            args,
            Args {
                jobs: Some(level(2)),
                implicit_slot: ImplicitSlot::Included,
                inherit: false,
                report: Some(ReportFormat::Json),
                shell: "/bin/bash".to_string(),
            }
        );
    }

    #[test]
    fn rejects_bad_input() {
        insta::assert_snapshot!(
            parse_args(&argv(&["-j0"])).unwrap_err(),
            @"invalid job count '0': expected a positive integer"
        );
        insta::assert_snapshot!(
            parse_args(&argv(&["--report", "xml"])).unwrap_err(),
            @"unknown report format: xml"
        );
        insta::assert_snapshot!(
            parse_args(&argv(&["make"])).unwrap_err(),
            @"unexpected argument: make"
        );
        assert_eq!(parse_args(&argv(&["-j"])).unwrap_err(), "--jobs requires a value");
    }

    #[test]
    fn help_is_an_empty_error() {
        assert_eq!(parse_args(&argv(&["--help"])).unwrap_err(), "");
    }

    #[test]
    fn flags_override_environment_config() {
        let env = JobServerConfig::new().with_jobs(level(8));
        let config = parse_args(&argv(&["-j3", "--no-inherit"]))
            .unwrap()
            .apply(env.clone());
        assert_eq!(config.jobs, Some(level(3)));
        assert!(!config.inherit);

        let config = Args::default().apply(env);
        assert_eq!(config.jobs, Some(level(8)));
    }
}
