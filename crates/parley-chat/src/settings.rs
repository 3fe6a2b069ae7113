use uuid::Uuid;

use parley_db::AssistantSettings;
use parley_types::api::{AssistantSettingsResponse, UpdateAssistantSettingsRequest};

use crate::{ChatError, ChatResult, ChatService};

const MAX_API_KEY_LEN: usize = 256;
const MAX_SYSTEM_PROMPT_LEN: usize = 4_000;

impl ChatService {
    pub fn assistant_settings(&self, user_id: Uuid) -> ChatResult<AssistantSettingsResponse> {
        let settings = self.db().get_assistant_settings(user_id)?.unwrap_or_default();
        Ok(to_response(&settings))
    }

    /// Merge the request into the stored row.
    pub fn update_assistant_settings(
        &self,
        user_id: Uuid,
        request: UpdateAssistantSettingsRequest,
    ) -> ChatResult<AssistantSettingsResponse> {
        let mut settings = self.db().get_assistant_settings(user_id)?.unwrap_or_default();

        if let Some(key) = request.api_key {
            let key = key.trim();
            if key.len() > MAX_API_KEY_LEN {
                return Err(ChatError::invalid("api key is too long"));
            }
            settings.api_key = (!key.is_empty()).then(|| key.to_string());
        }
        if let Some(prompt) = request.system_prompt {
            if prompt.chars().count() > MAX_SYSTEM_PROMPT_LEN {
                return Err(ChatError::invalid(format!(
                    "system prompt exceeds {} characters",
                    MAX_SYSTEM_PROMPT_LEN
                )));
            }
            settings.system_prompt = (!prompt.trim().is_empty()).then_some(prompt);
        }

        self.db().set_assistant_settings(user_id, &settings)?;
        Ok(to_response(&settings))
    }
}

fn to_response(settings: &AssistantSettings) -> AssistantSettingsResponse {
    AssistantSettingsResponse {
        has_api_key: settings.api_key.is_some(),
        system_prompt: settings.system_prompt.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::service;

    #[test]
    fn partial_updates_merge() {
        let chat = service();
        let user = Uuid::new_v4();
        assert!(!chat.assistant_settings(user).unwrap().has_api_key);

        chat.update_assistant_settings(
            user,
            UpdateAssistantSettingsRequest {
                api_key: Some(" sk-abc ".into()),
                system_prompt: Some("Be terse.".into()),
            },
        )
        .unwrap();
        let after = chat
            .update_assistant_settings(
                user,
                UpdateAssistantSettingsRequest {
                    api_key: None,
                    system_prompt: Some(String::new()),
                },
            )
            .unwrap();
        assert!(after.has_api_key);
        assert_eq!(after.system_prompt, None);

        let stored = chat.db().get_assistant_settings(user).unwrap().unwrap();
        assert_eq!(stored.api_key.as_deref(), Some("sk-abc"));
    }

    #[test]
    fn oversized_prompt_is_rejected() {
        let chat = service();
        let err = chat
            .update_assistant_settings(
                Uuid::new_v4(),
                UpdateAssistantSettingsRequest {
                    api_key: None,
                    system_prompt: Some("x".repeat(MAX_SYSTEM_PROMPT_LEN + 1)),
                },
            )
            .unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
    }
}
