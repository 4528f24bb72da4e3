#![forbid(unsafe_code)]

use anyhow::Result;
use lazy_static::lazy_static;
use log::info;
use poem::listener::{Listener, RustlsCertificate, RustlsConfig};
use poem::{listener::TcpListener, Endpoint, EndpointExt, Route};
use poem_openapi::OpenApiService;

// Oneshot Utilities
use crate::v1::oneshot::generate_oneshot::GenerateOneshotApi;
use crate::v1::oneshot::version::VersionApi;
use crate::utils::config::{init_log, init_runtime_context, Config, RuntimeCtx, ONESHOT_ARGS, ONESHOT_DIRS};
use crate::utils::cors::CorsPolicy;
use crate::utils::errors::Errors;

// Modules
mod utils;
mod v1;

// ***************************************************************************
//                                Constants
// ***************************************************************************
const SERVER_NAME     : &str = "OneshotServer"; // for poem logging
const ONESHOT_VERSION : &str = env!("CARGO_PKG_VERSION");
const API_PREFIX      : &str = "/api";
const TLS_KEY_FILE    : &str = "/key.pem";  // relative to certs dir
const TLS_CERT_FILE   : &str = "/cert.pem"; // relative to certs dir

// ***************************************************************************
//                             Static Variables
// ***************************************************************************
// Lazily initialize the parameters variable so that is has a 'static lifetime.
// We exit if we can't read our parameters.
lazy_static! {
    static ref RUNTIME_CTX: RuntimeCtx = init_runtime_context();
}

// ---------------------------------------------------------------------------
// main:
// ---------------------------------------------------------------------------
fn main() -> Result<()> {
    // --------------- Initialize Oneshot -------------
    println!("Starting oneshot_server!");

    // Create the data directories and exit if that's all that was requested.
    if ONESHOT_ARGS.create_dirs_only {
        println!("Data directories created under {}", ONESHOT_DIRS.root_dir);
        return Ok(());
    }

    // Logging setup exports environment variables, so it runs before the
    // runtime's worker threads exist.
    oneshot_init();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(serve())
}

// ---------------------------------------------------------------------------
// serve:
// ---------------------------------------------------------------------------
async fn serve() -> Result<()> {
    // --------------- Main Loop Set Up ---------------
    let config = &RUNTIME_CTX.parms.config;
    let app = make_app(config);

    let addr = format!("{}{}", "0.0.0.0:", config.http_port);
    let listener = if config.enable_tls {
        TcpListener::bind(addr).rustls(make_rustls_config()?).boxed()
    } else {
        TcpListener::bind(addr).boxed()
    };

    // ------------------ Main Loop -------------------
    poem::Server::new(listener)
        .name(SERVER_NAME)
        .run(app)
        .await?;
    Ok(())
}

// ***************************************************************************
//                             Private Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// oneshot_init:
// ---------------------------------------------------------------------------
/** Initialize logging and force the reading of the configuration. */
fn oneshot_init() {
    init_log();

    info!("{}", Errors::InputParms(format!("{:#?}", *RUNTIME_CTX)));
    print_version_info();
}

// ---------------------------------------------------------------------------
// print_version_info:
// ---------------------------------------------------------------------------
fn print_version_info() {
    info!("\n*** Running ONESHOT={}, BRANCH={}, COMMIT={}, DIRTY={}, SRC_TS={}, RUSTC={}.",
          ONESHOT_VERSION,
          env!("GIT_BRANCH"),
          env!("GIT_COMMIT_SHORT"),
          env!("GIT_DIRTY"),
          env!("SOURCE_TIMESTAMP"),
          env!("RUSTC_VERSION"));
}

// ---------------------------------------------------------------------------
// make_app:
// ---------------------------------------------------------------------------
/** Assemble the api, its OpenAPI documents and the CORS policy into the
 * endpoint the server runs.
 */
fn make_app(config: &Config) -> impl Endpoint {
    let api_url = format!("{}:{}{}", config.http_addr, config.http_port, API_PREFIX);
    let endpoints = (GenerateOneshotApi, VersionApi::new(&config.title));
    let api_service =
        OpenApiService::new(endpoints, config.title.as_str(), ONESHOT_VERSION).server(api_url);

    // Allow the generated openapi specs to be retrieved from the server.
    let spec = api_service.spec_endpoint();
    let spec_yaml = api_service.spec_endpoint_yaml();
    let ui = api_service.swagger_ui();

    Route::new()
        .nest(API_PREFIX, api_service)
        .nest("/docs", ui)
        .at("/spec", spec)
        .at("/spec_yaml", spec_yaml)
        .with(CorsPolicy::new(&config.cors_allowed_origins))
}

// ---------------------------------------------------------------------------
// make_rustls_config:
// ---------------------------------------------------------------------------
fn make_rustls_config() -> Result<RustlsConfig> {
    let key_file = ONESHOT_DIRS.certs_dir.clone() + TLS_KEY_FILE;
    let cert_file = ONESHOT_DIRS.certs_dir.clone() + TLS_CERT_FILE;
    let key = std::fs::read(&key_file)
        .map_err(|e| Errors::TlsMaterial(format!("{}: {}", key_file, e)))?;
    let cert = std::fs::read(&cert_file)
        .map_err(|e| Errors::TlsMaterial(format!("{}: {}", cert_file, e)))?;

    Ok(RustlsConfig::new().fallback(RustlsCertificate::new().key(key).cert(cert)))
}
