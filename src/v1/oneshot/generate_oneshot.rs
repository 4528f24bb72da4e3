#![forbid(unsafe_code)]

use std::borrow::Cow;

use poem::Request;
use poem_openapi::{ OpenApi, payload::Json, Object, ApiResponse };
use poem_openapi::registry::MetaSchemaRef;
use poem_openapi::types::{ParseError, ParseFromJSON, ParseResult, ToJSON, Type};
use serde_json::Value;
use log::{error, info};

use crate::utils::errors::HttpResult;
use crate::utils::oneshot_utils::{self, RequestDebug};

// ***************************************************************************
//                                Constants
// ***************************************************************************
// Substituted into the details when the prompt has no words.
const DEFAULT_SETTING: &str = "depths";

const CHARACTERS: [&str; 3] = ["A grizzled warrior", "A nimble rogue", "A wise mage"];

// ***************************************************************************
//                          Request/Response Definiions
// ***************************************************************************
pub struct GenerateOneshotApi;

#[derive(Object, Debug)]
pub struct ReqGenerateOneshot
{
    /// The user's input prompt for generating a oneshot adventure.
    prompt: PromptText,
}

// ---------------------------------------------------------------------------
// PromptText:
// ---------------------------------------------------------------------------
/** The prompt as it appears in the request body.  Unlike String, which
 * poem-openapi fills from JSON numbers and booleans too, only a JSON string
 * is accepted.
 */
#[derive(Debug, Clone, PartialEq)]
pub struct PromptText(String);

impl PromptText {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Type for PromptText {
    const IS_REQUIRED: bool = true;

    type RawValueType = Self;

    type RawElementValueType = Self;

    fn name() -> Cow<'static, str> {
        <String as Type>::name()
    }

    fn schema_ref() -> MetaSchemaRef {
        <String as Type>::schema_ref()
    }

    fn as_raw_value(&self) -> Option<&Self::RawValueType> {
        Some(self)
    }

    fn raw_element_iter<'a>(
        &'a self,
    ) -> Box<dyn Iterator<Item = &'a Self::RawElementValueType> + 'a> {
        Box::new(self.as_raw_value().into_iter())
    }
}

impl ParseFromJSON for PromptText {
    fn parse_from_json(value: Option<Value>) -> ParseResult<Self> {
        match value {
            Some(Value::String(s)) => Ok(Self(s)),
            Some(v) => Err(ParseError::expected_type(v)),
            None => Err(ParseError::expected_input()),
        }
    }
}

impl ToJSON for PromptText {
    fn to_json(&self) -> Option<Value> {
        Some(Value::String(self.0.clone()))
    }
}

/// A generated tabletop RPG oneshot adventure.
#[derive(Object, Debug, PartialEq)]
pub struct RespGenerateOneshot
{
    /// The main concept for the oneshot adventure.
    idea: String,
    /// Expanded description of the adventure.
    details: String,
    /// Character archetypes or NPCs for the adventure.
    characters_involved: Vec<String>,
}

// Implement the debug record trait for logging.
impl RequestDebug for ReqGenerateOneshot {
    fn get_request_info(&self) -> String {
        let mut s = String::with_capacity(255);
        s.push_str("  Request body:");
        s.push_str("\n    prompt: ");
        s.push_str(self.prompt.as_str());
        s
    }
}

// ------------------- HTTP Status Codes -------------------
#[derive(Debug, ApiResponse)]
#[oai(bad_request_handler = "bad_request_handler")]
enum OneshotResponse {
    #[oai(status = 200)]
    Http200(Json<RespGenerateOneshot>),
    #[oai(status = 400)]
    Http400(Json<HttpResult>),
}

fn make_http_200(resp: RespGenerateOneshot) -> OneshotResponse {
    OneshotResponse::Http200(Json(resp))
}
fn make_http_400(msg: String) -> OneshotResponse {
    OneshotResponse::Http400(Json(HttpResult::new(400.to_string(), msg)))
}

// Request bodies that don't match ReqGenerateOneshot never reach the endpoint.
fn bad_request_handler(err: poem::Error) -> OneshotResponse {
    let msg = "ERROR: ".to_owned() + err.to_string().as_str();
    error!("{}", msg);
    make_http_400(msg)
}

// ***************************************************************************
//                             OpenAPI Endpoint
// ***************************************************************************
#[OpenApi]
impl GenerateOneshotApi {
    /// Generate a tabletop RPG oneshot adventure idea from a prompt.
    #[oai(path = "/generate-oneshot", method = "post")]
    async fn generate_oneshot(&self, http_req: &Request, req: Json<ReqGenerateOneshot>) -> OneshotResponse {
        RespGenerateOneshot::process(http_req, &req)
    }
}

// ***************************************************************************
//                          Request/Response Methods
// ***************************************************************************
impl RespGenerateOneshot {
    /// Create a new response.
    fn new(idea: String, details: String, characters_involved: Vec<String>) -> Self {
        Self {idea, details, characters_involved}
    }

    /// Process the request.
    fn process(http_req: &Request, req: &ReqGenerateOneshot) -> OneshotResponse {
        // Conditional logging depending on log level.
        oneshot_utils::debug_request(http_req, req);
        info!("Received prompt: {}", req.prompt.as_str());

        make_http_200(Self::from_prompt(req.prompt.as_str()))
    }

    /// Fill the adventure template from the prompt.  The result depends only
    /// on the prompt text.
    fn from_prompt(prompt: &str) -> Self {
        let idea = format!("A thrilling adventure based on: '{}'", prompt);
        let details = format!(
            "The adventurers must delve into a mysterious {} to recover a lost artifact. \
             They will face cunning traps, enigmatic puzzles, and a fearsome guardian.",
            setting_noun(prompt));
        let characters = CHARACTERS.iter().map(|c| c.to_string()).collect();
        Self::new(idea, details, characters)
    }
}

// ***************************************************************************
//                          Private Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// setting_noun:
// ---------------------------------------------------------------------------
/** The last whitespace-delimited word of the prompt, or the default setting
 * when the prompt is empty or all whitespace.
 */
fn setting_noun(prompt: &str) -> &str {
    prompt.split_whitespace().last().unwrap_or(DEFAULT_SETTING)
}

// ***************************************************************************
//                                  Tests
// ***************************************************************************
#[cfg(test)]
mod tests {
    use super::*;
    use poem::{http::StatusCode, test::TestClient, Route};
    use poem_openapi::OpenApiService;
    use serde_json::json;

    const PATH: &str = "/api/generate-oneshot";

    fn client() -> TestClient<Route> {
        let api_service = OpenApiService::new(GenerateOneshotApi, "Oneshot Server", "test");
        TestClient::new(Route::new().nest("/api", api_service))
    }

    #[test]
    fn idea_quotes_the_prompt() {
        for prompt in ["dragon", "haunted forest", "  spaced  out  ", "it's a 'trap'"] {
            let resp = RespGenerateOneshot::from_prompt(prompt);
            assert_eq!(resp.idea, "A thrilling adventure based on: '".to_owned() + prompt + "'");
        }
    }

    #[test]
    fn details_use_last_word() {
        assert_eq!(setting_noun("haunted forest"), "forest");
        assert_eq!(setting_noun("crypt"), "crypt");
        assert_eq!(setting_noun("sunken\tcity\n"), "city");
        assert_eq!(setting_noun("ruined keep   "), "keep");
        let resp = RespGenerateOneshot::from_prompt("the frozen tundra");
        assert!(resp.details.contains("mysterious tundra to recover"));
    }

    #[test]
    fn details_fall_back_without_words() {
        assert_eq!(setting_noun(""), "depths");
        assert_eq!(setting_noun("   "), "depths");
        let resp = RespGenerateOneshot::from_prompt("");
        assert!(resp.details.contains("mysterious depths to recover"));
        assert_eq!(resp.idea, "A thrilling adventure based on: ''");
    }

    #[test]
    fn characters_are_fixed() {
        for prompt in ["", "pirates", "a long prompt about space wizards"] {
            let resp = RespGenerateOneshot::from_prompt(prompt);
            assert_eq!(resp.characters_involved, vec!["A grizzled warrior", "A nimble rogue", "A wise mage"]);
        }
    }

    #[test]
    fn same_prompt_same_adventure() {
        let expected = RespGenerateOneshot::new(
            "A thrilling adventure based on: 'sunken city'".to_string(),
            "The adventurers must delve into a mysterious city to recover a lost artifact. \
             They will face cunning traps, enigmatic puzzles, and a fearsome guardian.".to_string(),
            CHARACTERS.iter().map(|c| c.to_string()).collect());
        assert_eq!(RespGenerateOneshot::from_prompt("sunken city"), expected);
        assert_eq!(RespGenerateOneshot::from_prompt("sunken city"),
                   RespGenerateOneshot::from_prompt("sunken city"));
        assert_ne!(RespGenerateOneshot::from_prompt("sunken city"),
                   RespGenerateOneshot::from_prompt("sunken crypt"));
    }

    #[test]
    fn prompt_text_only_parses_strings() {
        let parsed = PromptText::parse_from_json(Some(json!("haunted forest")));
        assert_eq!(parsed.ok(), Some(PromptText("haunted forest".to_string())));
        assert!(PromptText::parse_from_json(Some(json!(""))).is_ok());

        for value in [json!(42), json!(1.5), json!(true), json!(null), json!(["a"]), json!({"a": 1})] {
            assert!(PromptText::parse_from_json(Some(value)).is_err());
        }
        assert!(PromptText::parse_from_json(None).is_err());
    }

    #[tokio::test]
    async fn haunted_forest_scenario() {
        let resp = client()
            .post(PATH)
            .body_json(&json!({"prompt": "haunted forest"}))
            .send()
            .await;
        resp.assert_status_is_ok();
        resp.assert_json(json!({
            "idea": "A thrilling adventure based on: 'haunted forest'",
            "details": "The adventurers must delve into a mysterious forest to recover a lost artifact. They will face cunning traps, enigmatic puzzles, and a fearsome guardian.",
            "characters_involved": ["A grizzled warrior", "A nimble rogue", "A wise mage"],
        })).await;
    }

    #[tokio::test]
    async fn empty_prompt_is_accepted() {
        let resp = client()
            .post(PATH)
            .body_json(&json!({"prompt": ""}))
            .send()
            .await;
        resp.assert_status_is_ok();
        let json = resp.json().await;
        let details = json.value().object().get("details").string().to_string();
        assert!(details.contains("mysterious depths to recover"));
    }

    #[tokio::test]
    async fn missing_prompt_is_rejected() {
        let resp = client()
            .post(PATH)
            .body_json(&json!({"text": "haunted forest"}))
            .send()
            .await;
        resp.assert_status(StatusCode::BAD_REQUEST);
        let json = resp.json().await;
        json.value().object().get("result_code").assert_string("400");
    }

    #[tokio::test]
    async fn non_text_prompt_is_rejected() {
        for body in [json!({"prompt": 42}), json!({"prompt": 1.5}), json!({"prompt": true}),
                     json!({"prompt": null}), json!({"prompt": ["a"]}), json!({"prompt": {"text": "a"}})] {
            let resp = client().post(PATH).body_json(&body).send().await;
            resp.assert_status(StatusCode::BAD_REQUEST);
            let json = resp.json().await;
            json.value().object().get("result_code").assert_string("400");
        }
    }

    #[tokio::test]
    async fn malformed_body_is_rejected() {
        let resp = client()
            .post(PATH)
            .content_type("application/json")
            .body("{\"prompt\": ")
            .send()
            .await;
        resp.assert_status(StatusCode::BAD_REQUEST);
    }
}
