use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorDetails};

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub model_id: String,
    #[serde(default)]
    pub model_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    /// Provider-specific extras, passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_ext: Option<String>,
}

/// Per-run overrides for a prompt target, carried as a JSON string in the experiment.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct PromptRuntimeParam {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_config: Option<ModelConfig>,
}

impl PromptRuntimeParam {
    pub fn get_json_value(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn parse_from_json(raw: &str) -> Result<Self, Error> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(raw).map_err(|e| {
            Error::new(ErrorDetails::InvalidRequest {
                message: format!("Invalid prompt runtime param: {e}"),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_every_field() {
        let param = PromptRuntimeParam {
            model_config: Some(ModelConfig {
                model_id: "1001".to_string(),
                model_name: "doubao-pro".to_string(),
                temperature: Some(0.3),
                max_tokens: Some(512),
                top_p: Some(0.9),
                json_ext: Some(r#"{"reasoning":"high"}"#.to_string()),
            }),
        };
        let raw = param.get_json_value().unwrap();
        assert_eq!(PromptRuntimeParam::parse_from_json(&raw).unwrap(), param);
    }

    #[test]
    fn test_empty_and_invalid() {
        assert_eq!(
            PromptRuntimeParam::parse_from_json("").unwrap(),
            PromptRuntimeParam::default()
        );
        let err = PromptRuntimeParam::parse_from_json("{not json").unwrap_err();
        assert!(matches!(
            err.get_details(),
            ErrorDetails::InvalidRequest { .. }
        ));
    }
}
