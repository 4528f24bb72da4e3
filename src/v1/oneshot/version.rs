#![forbid(unsafe_code)]

use poem_openapi::{ OpenApi, payload::Json, Object };

const UNKNOWN: &str = "unknown";

// ***************************************************************************
//                          Request/Response Definiions
// ***************************************************************************
/// Serves build information for the server configured under `title`.
pub struct VersionApi {
    title: String,
}

#[derive(Object, Debug)]
struct RespVersion
{
    result_code: String,
    result_msg: String,
    /// The configured server title.
    title: String,
    oneshot_version: String,
    git_branch: String,
    git_commit: String,
    git_dirty: String,
    source_ts: String,
    rustc_version: String,
}

// ***************************************************************************
//                             OpenAPI Endpoint
// ***************************************************************************
#[OpenApi]
impl VersionApi {
    /// Report the server title, version and the build it came from.
    #[oai(path = "/version", method = "get")]
    async fn get_version(&self) -> Json<RespVersion> {
        Json(RespVersion::for_server(&self.title))
    }
}

impl VersionApi {
    pub fn new(title: &str) -> Self {
        Self { title: title.to_string() }
    }
}

// ***************************************************************************
//                          Request/Response Methods
// ***************************************************************************
impl RespVersion {
    /// Build metadata is fixed at compile time by build.rs.
    fn for_server(title: &str) -> Self {
        Self {
            result_code: "0".to_string(),
            result_msg: "success".to_string(),
            title: title.to_string(),
            oneshot_version: option_env!("CARGO_PKG_VERSION").unwrap_or(UNKNOWN).to_string(),
            git_branch: env!("GIT_BRANCH").to_string(),
            git_commit: env!("GIT_COMMIT_SHORT").to_string(),
            git_dirty: env!("GIT_DIRTY").to_string(),
            source_ts: env!("SOURCE_TIMESTAMP").to_string(),
            rustc_version: env!("RUSTC_VERSION").to_string(),
        }
    }
}
