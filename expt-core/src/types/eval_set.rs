use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    #[default]
    Text,
    Image,
    MultiPart,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Image {
    pub name: String,
    pub url: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Content {
    pub content_type: ContentType,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub image: Option<Image>,
    #[serde(default)]
    pub multi_part: Vec<Content>,
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content_type: ContentType::Text,
            text: Some(text.into()),
            image: None,
            multi_part: Vec::new(),
        }
    }

    /// Flattens the content into text, rendering images as their url.
    pub fn as_text(&self) -> String {
        match self.content_type {
            ContentType::Text => self.text.clone().unwrap_or_default(),
            ContentType::Image => self
                .image
                .as_ref()
                .map(|image| image.url.clone())
                .unwrap_or_default(),
            ContentType::MultiPart => self
                .multi_part
                .iter()
                .map(Content::as_text)
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// One named column value of a turn.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct FieldData {
    pub key: String,
    pub name: String,
    pub content: Content,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Turn {
    pub id: i64,
    pub field_data_list: Vec<FieldData>,
}

impl Turn {
    pub fn field(&self, name: &str) -> Option<&Content> {
        self.field_data_list
            .iter()
            .find(|field| field.name == name || field.key == name)
            .map(|field| &field.content)
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct EvalSetItem {
    pub id: i64,
    pub eval_set_id: i64,
    pub item_key: String,
    pub turns: Vec<Turn>,
}

impl EvalSetItem {
    /// Items always count as at least one turn for the stats counters.
    pub fn turn_cnt(&self) -> i32 {
        i32::try_from(self.turns.len()).unwrap_or(i32::MAX).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_as_text() {
        let content = Content {
            content_type: ContentType::MultiPart,
            multi_part: vec![
                Content::text("look at"),
                Content {
                    content_type: ContentType::Image,
                    image: Some(Image {
                        name: "cat".to_string(),
                        url: "https://img/cat.png".to_string(),
                    }),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        assert_eq!(content.as_text(), "look at\nhttps://img/cat.png");
    }

    #[test]
    fn test_turn_field_lookup() {
        let turn = Turn {
            id: 1,
            field_data_list: vec![FieldData {
                key: "k_input".to_string(),
                name: "input".to_string(),
                content: Content::text("hi"),
            }],
        };
        assert_eq!(turn.field("input").map(Content::as_text).as_deref(), Some("hi"));
        assert!(turn.field("k_input").is_some());
        assert!(turn.field("missing").is_none());
    }
}
