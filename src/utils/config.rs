#![forbid(unsafe_code)]

use anyhow::{Result, anyhow};
use log::{info, error, LevelFilter};
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Config as Log4rsConfig, Root};
use log4rs::encode::pattern::PatternEncoder;
use poem::http::HeaderValue;
use serde::Deserialize;
use std::{env, fs, path::Path};
use fs_mistrust::Mistrust;
use std::os::unix::fs::PermissionsExt;
use lazy_static::lazy_static;
use structopt::StructOpt;

// Oneshot Utilities
use crate::utils::{oneshot_utils, errors::Errors};

use super::oneshot_utils::get_absolute_path;

// ***************************************************************************
//                                Constants
// ***************************************************************************
// Directory and file locations. Unless otherwise noted, all files and directories
// are relative to the root directory.
const ENV_ONESHOT_ROOT_DIR : &str = "ONESHOT_ROOT_DIR";
const DEFAULT_ROOT_DIR     : &str = "~/.oneshot";
const CONFIG_DIR           : &str = "/config";
const LOGS_DIR             : &str = "/logs";
const CERTS_DIR            : &str = "/certs";
const LOG4RS_CONFIG_FILE   : &str = "/log4rs.yml";   // relative to config dir
const ENV_ONESHOT_LOGS_DIR : &str = "ONESHOT_LOGS_DIR"; // $ENV{..} in log4rs.yml
const ONESHOT_CONFIG_FILE  : &str = "/oneshot.toml"; // relative to config dir

// Networking.
const DEFAULT_HTTP_ADDR    : &str = "http://localhost";
const DEFAULT_HTTP_PORT    : u16  = 8000;

// Browser origins allowed to call the api when none are configured.
pub const DEFAULT_CORS_ORIGINS: [&str; 2] = ["http://localhost:3000", "http://localhost"];

// Fallback console logging when no log4rs file is installed.
const DEFAULT_LOG_PATTERN  : &str = "{d} {l} {t} - {m}{n}";

// ***************************************************************************
//                             Static Variables
// ***************************************************************************
// Assign the command line arguments BEFORE RUNTIME_CTX is initialized in main.
lazy_static! {
    pub static ref ONESHOT_ARGS: OneshotArgs = init_oneshot_args();
}

// Calculate the data directories BEFORE RUNTIME_CTX is initialized in main.
lazy_static! {
    pub static ref ONESHOT_DIRS: OneshotDirs = init_oneshot_dirs();
}

// ***************************************************************************
//                             Directory Structs
// ***************************************************************************
// ---------------------------------------------------------------------------
// OneshotDirs:
// ---------------------------------------------------------------------------
#[derive(Debug)]
#[allow(dead_code)]
pub struct OneshotDirs {
    pub root_dir: String,
    pub config_dir: String,
    pub logs_dir: String,
    pub certs_dir: String,
}

// ***************************************************************************
//                               Config Structs
// ***************************************************************************
// ---------------------------------------------------------------------------
// OneshotArgs:
// ---------------------------------------------------------------------------
#[derive(Debug, StructOpt)]
#[structopt(name = "oneshot_args", about = "Command line arguments for the Oneshot Server.")]
pub struct OneshotArgs {
    /// Specify the server's root data directory.
    ///
    /// This directory contains the configuration, log and certificate
    /// directories the server uses during execution.
    #[structopt(short, long)]
    pub root_dir: Option<String>,

    /// Create the data directories and then exit.
    ///
    /// The data directories will be rooted at a root directory calculated
    /// using the following priority order:
    ///
    ///   1. If set, the value of the ONESHOT_ROOT_DIR environment,
    ///
    ///   2. Otherwise, if set, the value of the --root-dir command line argument,
    ///
    ///   3. Otherwise, ~/.oneshot
    ///
    #[structopt(short, long)]
    pub create_dirs_only: bool,
}

// ---------------------------------------------------------------------------
// Parms:
// ---------------------------------------------------------------------------
#[derive(Debug)]
#[allow(dead_code)]
pub struct Parms {
    pub config_file: String,
    pub config: Config,
}

// ---------------------------------------------------------------------------
// RuntimeCtx:
// ---------------------------------------------------------------------------
#[derive(Debug)]
#[allow(dead_code)]
pub struct RuntimeCtx {
    pub parms: Parms,
    pub oneshot_args: &'static OneshotArgs,
    pub oneshot_dirs: &'static OneshotDirs,
}

// ---------------------------------------------------------------------------
// Config:
// ---------------------------------------------------------------------------
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub title: String,
    pub http_addr: String,
    pub http_port: u16,
    pub cors_allowed_origins: Vec<String>,
    pub enable_tls: bool,
}

impl Config {
    pub fn new() -> Self {
        Config::default()
    }

    /// Parse toml text, filling unspecified keys with their defaults.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would silently change the server's behavior.
    pub fn validate(&self) -> Result<()> {
        if self.cors_allowed_origins.is_empty() {
            return Err(Errors::CorsConfig(
                "cors_allowed_origins must list at least one origin".to_string()).into());
        }
        if let Some(o) = self.cors_allowed_origins.iter().find(|o| o.trim().is_empty()) {
            return Err(Errors::CorsConfig(format!("blank origin: {:?}", o)).into());
        }
        // The CORS middleware panics on origins that aren't legal header values.
        for o in &self.cors_allowed_origins {
            if HeaderValue::try_from(o.as_str()).is_err() {
                return Err(Errors::CorsConfig(format!("origin is not a valid header value: {:?}", o)).into());
            }
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            title: "Oneshot Server".to_string(),
            http_addr: DEFAULT_HTTP_ADDR.to_string(),
            http_port: DEFAULT_HTTP_PORT,
            cors_allowed_origins: DEFAULT_CORS_ORIGINS.iter().map(|s| s.to_string()).collect(),
            enable_tls: false,
        }
    }
}

// ***************************************************************************
//                            Directory Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// init_oneshot_args:
// ---------------------------------------------------------------------------
/** Get the command line arguments. */
fn init_oneshot_args() -> OneshotArgs {
    let args = OneshotArgs::from_args();
    println!("{:?}", args);
    args
}

// ---------------------------------------------------------------------------
// init_oneshot_dirs:
// ---------------------------------------------------------------------------
/** Calculate the external data directories. */
fn init_oneshot_dirs() -> OneshotDirs {
    let mistrust = get_mistrust();

    // Check that each path is absolute and is a directory with the
    // proper permission assign if it exists.  If it doesn't exist,
    // create it.
    let root_dir = get_root_dir();
    check_oneshot_dir(&root_dir, "root directory", &mistrust);

    let config_dir = root_dir.clone() + CONFIG_DIR;
    check_oneshot_dir(&config_dir, "config directory", &mistrust);

    let logs_dir = root_dir.clone() + LOGS_DIR;
    check_oneshot_dir(&logs_dir, "logs directory", &mistrust);

    let certs_dir = root_dir.clone() + CERTS_DIR;
    check_oneshot_dir(&certs_dir, "certs directory", &mistrust);

    OneshotDirs { root_dir, config_dir, logs_dir, certs_dir }
}

// ---------------------------------------------------------------------------
// check_oneshot_dir:
// ---------------------------------------------------------------------------
/** Check that the path is absolute and, if it exists, that is has 0o700
 * permissions.  If it doesn't exist, create it with those permissions.
 *
 * Any failure results in a panic.
 */
fn check_oneshot_dir(dir: &str, msgname: &str, mistrust: &Mistrust) {
    let path = Path::new(dir);
    if !path.is_absolute() {
        panic!("The oneshot {} path must be absolute: {}", msgname, dir);
    }
    if path.exists() {
        if !path.is_dir() {
            panic!("The oneshot {} path must be a directory: {}", msgname, dir);
        }

        let meta = path.metadata().unwrap_or_else(|_| panic!("Unable to read metadata for {}: {}", msgname, dir));
        let perm = meta.permissions().mode();
        if perm & 0o777 != 0o700 {
            panic!("The oneshot {} path must be have 0o700 permissions: {}", msgname, dir);
        }
    } else if let Err(e) = mistrust.make_directory(path) {
        panic!("Make directory error for {:?}: {}", path, &e.to_string());
    }
}

// ---------------------------------------------------------------------------
// get_mistrust:
// ---------------------------------------------------------------------------
/** Configure a new mistrust object for initial directory processing. */
fn get_mistrust() -> Mistrust {
    match Mistrust::builder()
        .ignore_prefix(get_absolute_path("~"))
        .trust_group(0)
        .build() {
            Ok(m) => m,
            Err(e) => panic!("Mistrust configuration error: {}", &e.to_string()),
        }
}

// ---------------------------------------------------------------------------
// get_root_dir:
// ---------------------------------------------------------------------------
fn get_root_dir() -> String {
    // Order of precedence:
    //  1. Environment variable
    //  2. Command line --root-dir argument
    //  3. Default location
    let root_dir = resolve_root_dir(env::var(ENV_ONESHOT_ROOT_DIR).ok(),
                                    ONESHOT_ARGS.root_dir.clone());
    get_absolute_path(&root_dir)
}

/** Apply the root directory precedence rules to the candidate values. */
pub fn resolve_root_dir(env_dir: Option<String>, arg_dir: Option<String>) -> String {
    env_dir.or(arg_dir).unwrap_or_else(|| DEFAULT_ROOT_DIR.to_string())
}

// ***************************************************************************
//                               Log Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// init_log:
// ---------------------------------------------------------------------------
/** Initialize log4rs from the installed configuration file or, when there
 * is none, from a console-only configuration.
 *
 * ONESHOT_LOGS_DIR is exported (unless already set) so that file appenders
 * can write under the resolved logs directory.  Call this before any other
 * threads are started.
 */
pub fn init_log() {
    if env::var_os(ENV_ONESHOT_LOGS_DIR).is_none() {
        env::set_var(ENV_ONESHOT_LOGS_DIR, &ONESHOT_DIRS.logs_dir);
    }

    let logconfig = init_log_config();
    if !Path::new(&logconfig).exists() {
        init_default_log();
        info!("No log4rs file at {}, logging to the console.", logconfig);
        return;
    }

    if let Err(e) = log4rs::init_file(logconfig.clone(), Default::default()) {
        println!("{}", e);
        panic!("{}", Errors::Log4rsInitialization(logconfig));
    }
    info!("Log4rs initialized using: {}", logconfig);
}

// ---------------------------------------------------------------------------
// init_default_log:
// ---------------------------------------------------------------------------
fn init_default_log() {
    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(DEFAULT_LOG_PATTERN)))
        .build();
    let config = Log4rsConfig::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .build(Root::builder().appender("stdout").build(LevelFilter::Info));

    let result = match config {
        Ok(c) => log4rs::init_config(c).map(|_| ()).map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };
    if let Err(e) = result {
        println!("{}", e);
        panic!("{}", Errors::Log4rsInitialization("<default console>".to_string()));
    }
}

// ---------------------------------------------------------------------------
// init_log_config:
// ---------------------------------------------------------------------------
fn init_log_config() -> String {
    ONESHOT_DIRS.config_dir.clone() + LOG4RS_CONFIG_FILE
}

// ***************************************************************************
//                             Parms Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// get_parms:
// ---------------------------------------------------------------------------
/** Retrieve the application parameters from the configuration file in the
 * config data directory.  If the file cannot be read, default values are used.
 */
fn get_parms() -> Result<Parms> {
    let config_file = ONESHOT_DIRS.config_dir.clone() + ONESHOT_CONFIG_FILE;

    let config_file_abs = oneshot_utils::get_absolute_path(&config_file);
    info!("{}", Errors::ReadingConfigFile(config_file_abs.clone()));
    let contents = match fs::read_to_string(&config_file_abs) {
        Ok(c) => c,
        Err(_) => {
            println!("Unable to read configuration at {}. Using default values.", config_file);
            return Ok(Parms { config_file: Default::default(), config: Config::new() });
        }
    };

    let config = match Config::from_toml(&contents) {
        Ok(c)  => c,
        Err(e) => {
            let msg = format!("{}\n   {}", Errors::TOMLParseError(config_file_abs), e);
            error!("{}", msg);
            return Result::Err(anyhow!(msg));
        }
    };

    Ok(Parms { config_file: config_file_abs, config })
}

// ***************************************************************************
//                             Config Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// init_runtime_context:
// ---------------------------------------------------------------------------
pub fn init_runtime_context() -> RuntimeCtx {
    // The application aborts if the configuration is unusable.
    let parms = get_parms().expect("FAILED to read configuration file.");
    RuntimeCtx {parms, oneshot_args: &ONESHOT_ARGS, oneshot_dirs: &ONESHOT_DIRS}
}

// ***************************************************************************
//                                  Tests
// ***************************************************************************
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::new();
        assert_eq!(config.http_port, 8000);
        assert_eq!(config.cors_allowed_origins, vec!["http://localhost:3000", "http://localhost"]);
        assert!(!config.enable_tls);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = Config::from_toml("http_port = 9090\n").unwrap();
        assert_eq!(config.http_port, 9090);
        assert_eq!(config.title, "Oneshot Server");
        assert_eq!(config.cors_allowed_origins.len(), 2);
    }

    #[test]
    fn toml_overrides_origins() {
        let config = Config::from_toml(
            "title = \"Table\"\ncors_allowed_origins = [\"https://play.example.org\"]\nenable_tls = true\n").unwrap();
        assert_eq!(config.title, "Table");
        assert_eq!(config.cors_allowed_origins, vec!["https://play.example.org"]);
        assert!(config.enable_tls);
    }

    #[test]
    fn empty_origin_list_rejected() {
        let err = Config::from_toml("cors_allowed_origins = []\n").unwrap_err();
        assert!(err.to_string().contains("Invalid CORS configuration"));
        assert!(Config::from_toml("cors_allowed_origins = [\"  \"]\n").is_err());
    }

    #[test]
    fn control_characters_in_origin_rejected() {
        let err = Config::from_toml("cors_allowed_origins = [\"http://bad\\u0001host\"]\n").unwrap_err();
        assert!(err.to_string().contains("not a valid header value"));

        let mut config = Config::new();
        config.cors_allowed_origins = vec!["http://localhost:3000".to_string(), "http://a\nb".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_toml_rejected() {
        assert!(Config::from_toml("http_port = \"eight thousand\"\n").is_err());
        assert!(Config::from_toml("title = \n").is_err());
    }

    #[test]
    fn sample_log_config_writes_under_logs_dir() {
        let yml = include_str!("../../resources/log4rs.yml");
        let var = format!("$ENV{{{}}}/", ENV_ONESHOT_LOGS_DIR);
        assert!(yml.contains(&(var.clone() + "oneshot.log")));
        assert!(yml.contains(&(var + "oneshot.{}.log")));
        assert!(!yml.contains("$ENV{HOME}"));
    }

    #[test]
    fn root_dir_precedence() {
        let env_dir = Some("/srv/oneshot".to_string());
        let arg_dir = Some("/opt/oneshot".to_string());
        assert_eq!(resolve_root_dir(env_dir.clone(), arg_dir.clone()), "/srv/oneshot");
        assert_eq!(resolve_root_dir(None, arg_dir), "/opt/oneshot");
        assert_eq!(resolve_root_dir(None, None), "~/.oneshot");
    }
}
