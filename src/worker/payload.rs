//! Substitute search result served when neither the network nor the data
//! store can answer.

use color_eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::http::Response;

/// Reserved identifier that marks the placeholder record.
pub const FALLBACK_ID: &str = "00000";

/// Search response envelope as the client application reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchPayload {
  pub drinks: Vec<DrinkRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrinkRecord {
  #[serde(rename = "idDrink")]
  pub id: String,
  #[serde(rename = "strDrink")]
  pub name: String,
  #[serde(rename = "strTags")]
  pub tags: String,
  #[serde(rename = "strCategory")]
  pub category: String,
  #[serde(rename = "strInstructions")]
  pub instructions: String,
  #[serde(rename = "strDrinkThumb")]
  pub thumbnail: String,
  #[serde(rename = "strIngredient1", skip_serializing_if = "Option::is_none")]
  pub ingredient1: Option<String>,
  #[serde(rename = "strIngredient2", skip_serializing_if = "Option::is_none")]
  pub ingredient2: Option<String>,
}

impl SearchPayload {
  /// The single-record "no data available" document.
  pub fn fallback() -> Self {
    Self {
      drinks: vec![DrinkRecord {
        id: FALLBACK_ID.to_string(),
        name: "Offline: no fresh data".to_string(),
        tags: "FALLBACK".to_string(),
        category: "Disconnected".to_string(),
        instructions: "We could not fetch results right now. This placeholder shows that \
                       the app keeps working without a connection. Try again once you are \
                       back online."
          .to_string(),
        thumbnail: "https://via.placeholder.com/200x300?text=OFFLINE".to_string(),
        ingredient1: Some("Service Worker".to_string()),
        ingredient2: Some("Fallback JSON".to_string()),
      }],
    }
  }
}

/// Status-200 JSON response carrying the fallback document.
pub fn fallback_response() -> Result<Response> {
  Response::json(200, &SearchPayload::fallback())
}

/// Whether a response carries the placeholder document rather than real
/// search results.
pub fn is_fallback(response: &Response) -> bool {
  let is_json = response
    .header("content-type")
    .is_some_and(|ct| ct.starts_with("application/json"));
  if !is_json {
    return false;
  }
  response
    .parse_json::<Value>()
    .map(|value| contains_sentinel(&value))
    .unwrap_or(false)
}

fn contains_sentinel(value: &Value) -> bool {
  value
    .get("drinks")
    .and_then(Value::as_array)
    .map(|drinks| {
      drinks
        .iter()
        .any(|d| d.get("idDrink").and_then(Value::as_str) == Some(FALLBACK_ID))
    })
    .unwrap_or(false)
}
