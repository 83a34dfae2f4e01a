use serde::{Deserialize, Serialize};

const MAX_PROMPT_CHARS: usize = 2000;

/// Body sent when creating a job.
pub trait JobRequest: Serialize + Send + Sync + 'static {
    /// Local checks run before anything is sent to the server.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// A design-generation request for a room or facade.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DesignRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_type: Option<String>,
}

impl DesignRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            style: None,
            room_type: None,
        }
    }

    pub fn with_style(mut self, style: impl Into<String>) -> Self {
        self.style = Some(style.into());
        self
    }

    pub fn with_room_type(mut self, room_type: impl Into<String>) -> Self {
        self.room_type = Some(room_type.into());
        self
    }
}

impl JobRequest for DesignRequest {
    fn validate(&self) -> Result<(), String> {
        let prompt = self.prompt.trim();
        if prompt.is_empty() {
            return Err("Prompt must not be empty".to_string());
        }
        if prompt.chars().count() > MAX_PROMPT_CHARS {
            return Err(format!("Prompt must be at most {} characters", MAX_PROMPT_CHARS));
        }
        Ok(())
    }
}
