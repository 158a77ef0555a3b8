//! Jobserver auth strings as advertised by make in `MAKEFLAGS`.
//!
//! A parent jobserver tells its children where the token channel lives with
//! `--jobserver-auth=R,W` (a pipe whose descriptor numbers were inherited) or,
//! since GNU make 4.4, `--jobserver-auth=fifo:PATH`. Make before 4.2 spelled
//! the flag `--jobserver-fds=R,W`.
//!
//! Parsing lives here, away from the pools: constructing a pool never reads the
//! environment on its own.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Variables searched by [`from_env`], in priority order.
pub const MAKEFLAGS_VARS: [&str; 3] = ["CARGO_MAKEFLAGS", "MAKEFLAGS", "MFLAGS"];

const AUTH_FLAG: &str = "--jobserver-auth=";
const LEGACY_FDS_FLAG: &str = "--jobserver-fds=";
const FIFO_PREFIX: &str = "fifo:";

/// Where a parent's token channel can be found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobserverAuth {
    /// Inherited pipe descriptors.
    Pipe { read: i32, write: i32 },
    /// A named pipe opened by path.
    Fifo(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("invalid jobserver auth '{0}': expected R,W or fifo:PATH")]
    Malformed(String),
}

impl fmt::Display for JobserverAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pipe { read, write } => write!(f, "{read},{write}"),
            Self::Fifo(path) => write!(f, "{FIFO_PREFIX}{}", path.display()),
        }
    }
}

impl FromStr for JobserverAuth {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix(FIFO_PREFIX) {
            if path.is_empty() {
                return Err(AuthError::Malformed(s.to_string()));
            }
            return Ok(Self::Fifo(PathBuf::from(path)));
        }

        let (read, write) = s
            .split_once(',')
            .ok_or_else(|| AuthError::Malformed(s.to_string()))?;
        let parse = |fd: &str| {
            fd.parse::<i32>()
                .ok()
                .filter(|fd| *fd >= 0)
                .ok_or_else(|| AuthError::Malformed(s.to_string()))
        };

        Ok(Self::Pipe {
            read: parse(read)?,
            write: parse(write)?,
        })
    }
}

impl JobserverAuth {
    /// The `MAKEFLAGS` value that lets a child join this jobserver.
    pub fn to_makeflags(&self) -> String {
        match self {
            Self::Pipe { .. } => format!(" -j {AUTH_FLAG}{self} {LEGACY_FDS_FLAG}{self}"),
            Self::Fifo(_) => format!(" -j {AUTH_FLAG}{self}"),
        }
    }
}

/// Extract the jobserver auth from a make flags string.
///
/// The last `--jobserver-auth=` word wins, matching make. The legacy
/// `--jobserver-fds=` spelling is consulted only when the modern one is absent.
pub fn parse_makeflags(flags: &str) -> Result<Option<JobserverAuth>, AuthError> {
    let last_value = |flag: &str| {
        flags
            .split_ascii_whitespace()
            .filter_map(|word| word.strip_prefix(flag))
            .last()
    };

    match last_value(AUTH_FLAG).or_else(|| last_value(LEGACY_FDS_FLAG)) {
        Some(value) => value.parse().map(Some),
        None => Ok(None),
    }
}

/// Find a jobserver advertised by the parent process.
///
/// The first variable in [`MAKEFLAGS_VARS`] that names a jobserver wins.
pub fn from_env() -> Result<Option<JobserverAuth>, AuthError> {
    for var in MAKEFLAGS_VARS {
        let Some(flags) = env::var_os(var) else {
            continue;
        };
        if let Some(auth) = parse_makeflags(&flags.to_string_lossy())? {
            tracing::debug!(var, %auth, "Found jobserver auth");
            return Ok(Some(auth));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pipe_and_fifo_forms() {
        assert_eq!(
            "3,4".parse::<JobserverAuth>().unwrap(),
            JobserverAuth::Pipe { read: 3, write: 4 }
        );
        assert_eq!(
            "fifo:/tmp/GMfifo123".parse::<JobserverAuth>().unwrap(),
            JobserverAuth::Fifo(PathBuf::from("/tmp/GMfifo123"))
        );
    }

    #[test]
    fn rejects_malformed_auth() {
        for bad in ["", "3", "3,", ",4", "a,b", "-1,4", "fifo:"] {
            assert!(bad.parse::<JobserverAuth>().is_err(), "{bad:?} parsed");
        }
        insta::assert_snapshot!(
            "7".parse::<JobserverAuth>().unwrap_err().to_string(),
            @"invalid jobserver auth '7': expected R,W or fifo:PATH"
        );
    }

    #[test]
    fn makeflags_without_jobserver() {
        assert_eq!(parse_makeflags("").unwrap(), None);
        assert_eq!(parse_makeflags("kw -j").unwrap(), None);
    }

    #[test]
    fn makeflags_modern_and_legacy_flags() {
        assert_eq!(
            parse_makeflags("--jobserver-auth=1,2").unwrap(),
            Some(JobserverAuth::Pipe { read: 1, write: 2 })
        );
        assert_eq!(
            parse_makeflags("--jobserver-fds=1,2").unwrap(),
            Some(JobserverAuth::Pipe { read: 1, write: 2 })
        );
        assert_eq!(
            parse_makeflags("--jobserver-auth=3,4 --jobserver-fds=1,2").unwrap(),
            Some(JobserverAuth::Pipe { read: 3, write: 4 })
        );
        assert_eq!(
            parse_makeflags(" -j4 --jobserver-auth=fifo:/tmp/GMfifo9").unwrap(),
            Some(JobserverAuth::Fifo(PathBuf::from("/tmp/GMfifo9")))
        );
    }

    #[test]
    fn makeflags_last_auth_wins() {
        assert_eq!(
            parse_makeflags("-j --jobserver-auth=3,4 --jobserver-auth=5,6").unwrap(),
            Some(JobserverAuth::Pipe { read: 5, write: 6 })
        );
    }

    #[test]
    fn makeflags_with_bad_auth_is_an_error() {
        assert!(parse_makeflags("-j --jobserver-auth=oops").is_err());
    }

    #[test]
    fn renders_makeflags_for_children() {
        assert_eq!(
            JobserverAuth::Pipe { read: 5, write: 6 }.to_makeflags(),
            " -j --jobserver-auth=5,6 --jobserver-fds=5,6"
        );
        assert_eq!(
            JobserverAuth::Fifo(PathBuf::from("/tmp/jobs")).to_makeflags(),
            " -j --jobserver-auth=fifo:/tmp/jobs"
        );
    }

    #[test]
    fn display_round_trips_through_parse() {
        let auth = JobserverAuth::Pipe { read: 10, write: 11 };
        assert_eq!(auth.to_string().parse::<JobserverAuth>().unwrap(), auth);
    }
}
