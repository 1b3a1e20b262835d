//! Runtime configuration: command-line flags, each defaulting from an environment variable.
//! A `.env` file is folded into the environment before the flags are parsed.

use crate::client::DEFAULT_GUIDE_URL;
use crate::m3u::DEFAULT_SERVER_URL;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::ffi::OsString;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

pub const DEFAULT_HOST: &str = "hdhomerun.local";
pub const DEFAULT_EPG_FILE: &str = "output/epg.xml";
pub const DEFAULT_M3U_FILE: &str = "output/channels.m3u";
pub const DEFAULT_DAYS: u32 = 7;
pub const DEFAULT_HOURS: u32 = 3;
pub const DEFAULT_PORT: u16 = 8000;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "hdhomerun-xmltv",
    version,
    about = "Download the HDHomeRun guide and publish it as XMLTV plus a matching M3U playlist"
)]
pub struct Cli {
    /// Environment file loaded before anything else (default: ./.env when present).
    #[arg(long, global = true, value_name = "PATH")]
    pub env_file: Option<PathBuf>,

    #[command(flatten)]
    pub config: Config,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Fetch the guide and write the XMLTV file and the playlist (default).
    Generate,
    /// Rebuild the playlist from an existing XMLTV file.
    Playlist,
    /// Serve the generated files over HTTP.
    Serve,
    /// Generate, then serve; regenerates every --refresh-hours when set.
    Run,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DebugLevel {
    On,
    Full,
    Off,
}

impl DebugLevel {
    pub fn filter(self) -> &'static str {
        match self {
            DebugLevel::On => "info",
            DebugLevel::Full => "debug",
            DebugLevel::Off => "warn",
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct Config {
    /// Host name or IP address of the HDHomeRun tuner.
    #[arg(long, global = true, env = "HDHOMERUN_HOST", default_value = DEFAULT_HOST)]
    pub host: String,
    /// Path of the XMLTV file to write and serve.
    #[arg(long = "filename", global = true, env = "EPG_OUTPUT_FILE", default_value = DEFAULT_EPG_FILE)]
    pub epg_file: PathBuf,
    /// Path of the M3U playlist to write and serve.
    #[arg(long = "m3u-filename", global = true, env = "M3U_OUTPUT_FILE", default_value = DEFAULT_M3U_FILE)]
    pub m3u_file: PathBuf,
    /// Days of guide to fetch from now; the guide API caps this at about 14.
    #[arg(long, global = true, env = "EPG_DAYS", default_value_t = DEFAULT_DAYS,
          value_parser = clap::value_parser!(u32).range(1..))]
    pub days: u32,
    /// Hours to advance the start cursor between guide requests.
    #[arg(long, global = true, env = "EPG_HOURS", default_value_t = DEFAULT_HOURS,
          value_parser = clap::value_parser!(u32).range(1..))]
    pub hours: u32,
    /// Log verbosity: on, full or off. RUST_LOG takes precedence when set.
    #[arg(long, global = true, env = "DEBUG", value_enum, ignore_case = true, default_value = "on")]
    pub debug: DebugLevel,
    /// Base URL for playlist stream entries.
    #[arg(long, global = true, env = "M3U_SERVER_URL", default_value = DEFAULT_SERVER_URL)]
    pub server_url: String,
    /// Base URL of the remote guide API.
    #[arg(long, global = true, env = "HDHOMERUN_GUIDE_URL", default_value = DEFAULT_GUIDE_URL)]
    pub guide_url: String,
    /// Address the HTTP server binds to.
    #[arg(long, global = true, env = "HTTP_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind: IpAddr,
    /// Port the HTTP server listens on.
    #[arg(long, global = true, env = "HTTP_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,
    /// With `run`, regenerate the guide on this cadence while serving.
    #[arg(long, global = true, env = "EPG_REFRESH_HOURS", value_parser = clap::value_parser!(u32).range(1..))]
    pub refresh_hours: Option<u32>,
}

impl Config {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

#[derive(Debug)]
pub struct LoadedEnvFile {
    pub path: PathBuf,
    pub explicit: bool,
}

/// Find `--env-file` in the raw arguments and load that file, or `./.env` when the flag is
/// absent. Runs before clap so that the file can supply flag defaults.
pub fn load_env_file_from_args<I>(args: I) -> Result<Option<LoadedEnvFile>, String>
where
    I: IntoIterator<Item = OsString>,
{
    let mut args = args.into_iter().skip(1);
    let mut env_file: Option<PathBuf> = None;

    while let Some(arg) = args.next() {
        let Some(s) = arg.to_str() else { continue };
        let value = if s == "--env-file" {
            Some(args.next().ok_or_else(|| "`--env-file` requires a path argument".to_string())?)
        } else if let Some(path) = s.strip_prefix("--env-file=") {
            Some(OsString::from(path))
        } else if s == "--" {
            break;
        } else {
            None
        };

        if let Some(path) = value {
            if path.is_empty() {
                return Err("`--env-file` requires a path argument".to_string());
            }
            if env_file.is_some() {
                return Err("`--env-file` provided more than once".to_string());
            }
            env_file = Some(PathBuf::from(path));
        }
    }

    if let Some(path) = env_file {
        if !path.is_file() {
            return Err(format!("env file not found: {}", path.display()));
        }
        load_env_file(&path)?;
        return Ok(Some(LoadedEnvFile { path, explicit: true }));
    }

    let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
    let default_path = cwd.join(".env");
    if default_path.is_file() {
        load_env_file(&default_path)?;
        Ok(Some(LoadedEnvFile {
            path: default_path,
            explicit: false,
        }))
    } else {
        Ok(None)
    }
}

fn load_env_file(path: &Path) -> Result<(), String> {
    let contents = std::fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    for (key, value) in parse_env_file(&contents).map_err(|e| format!("{}:{}", path.display(), e))? {
        // Preserve any value that was already supplied via the process environment.
        if std::env::var_os(&key).is_none() {
            // Updating process-level environment variables is unsafe on some targets.
            unsafe {
                std::env::set_var(key, value);
            }
        }
    }
    Ok(())
}

/// Parse `KEY=value` lines. Supports `export`, `#` comments, and single or double quotes
/// (double quotes understand `\n`, `\r`, `\t`, `\\` and `\"`).
pub fn parse_env_file(contents: &str) -> Result<Vec<(String, String)>, String> {
    let mut vars = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let assignment = trimmed.strip_prefix("export ").map(str::trim_start).unwrap_or(trimmed);
        let (key, raw) = assignment
            .split_once('=')
            .ok_or_else(|| format!("{}: missing '=' in assignment", index + 1))?;
        let key = key.trim();
        if key.is_empty() || key.chars().any(char::is_whitespace) {
            return Err(format!("{}: invalid variable name {:?}", index + 1, key));
        }
        let value = parse_env_value(raw.trim()).map_err(|e| format!("{}: {}", index + 1, e))?;
        vars.push((key.to_string(), value));
    }
    Ok(vars)
}

fn parse_env_value(raw: &str) -> Result<String, String> {
    let (quote, body) = match raw.chars().next() {
        Some(q @ ('"' | '\'')) => (q, &raw[1..]),
        _ => return Ok(raw.split('#').next().unwrap_or_default().trim_end().to_string()),
    };

    let mut value = String::new();
    let mut chars = body.char_indices();
    while let Some((i, ch)) = chars.next() {
        if ch == quote {
            let remainder = body[i + 1..].trim();
            if remainder.is_empty() || remainder.starts_with('#') {
                return Ok(value);
            }
            return Err("unexpected characters after closing quote".to_string());
        }
        if ch == '\\' && quote == '"' {
            let (_, escaped) = chars.next().ok_or("unterminated escape sequence")?;
            value.push(match escaped {
                'n' => '\n',
                'r' => '\r',
                't' => '\t',
                other => other,
            });
            continue;
        }
        value.push(ch);
    }
    Err("unterminated quoted value".to_string())
}
