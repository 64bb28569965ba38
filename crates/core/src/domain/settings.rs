use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::ApplicationError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    /// First contact: the bot has not spoken in this thread yet.
    Initial,
    SteadyState,
    /// At least one promise is open and the conversation may be about it.
    PromiseCheck,
}

impl PromptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::SteadyState => "steady_state",
            Self::PromiseCheck => "promise_check",
        }
    }
}

/// Named blobs in the config store that together make up [`Settings`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SettingKey {
    InitialPrompt,
    SystemPrompt,
    PromisePrompt,
    TopP,
    Temperature,
}

impl SettingKey {
    pub const ALL: [SettingKey; 5] =
        [Self::InitialPrompt, Self::SystemPrompt, Self::PromisePrompt, Self::TopP, Self::Temperature];

    pub fn blob_name(&self) -> &'static str {
        match self {
            Self::InitialPrompt => "initial-system-prompt.txt",
            Self::SystemPrompt => "system-prompt.txt",
            Self::PromisePrompt => "promise-prompt.txt",
            Self::TopP => "top-p.txt",
            Self::Temperature => "temperature.txt",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SettingsBlobs {
    pub initial_prompt: Option<String>,
    pub system_prompt: Option<String>,
    pub promise_prompt: Option<String>,
    pub top_p: Option<String>,
    pub temperature: Option<String>,
}

impl SettingsBlobs {
    pub fn set(&mut self, key: SettingKey, value: Option<String>) {
        let slot = match key {
            SettingKey::InitialPrompt => &mut self.initial_prompt,
            SettingKey::SystemPrompt => &mut self.system_prompt,
            SettingKey::PromisePrompt => &mut self.promise_prompt,
            SettingKey::TopP => &mut self.top_p,
            SettingKey::Temperature => &mut self.temperature,
        };
        *slot = value;
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub initial_prompt: String,
    pub system_prompt: String,
    pub promise_prompt: String,
    pub top_p: Decimal,
    pub temperature: Decimal,
}

impl Settings {
    pub fn default_top_p() -> Decimal {
        Decimal::ONE
    }

    pub fn default_temperature() -> Decimal {
        Decimal::new(7, 1)
    }

    /// Prompts are mandatory; sampling parameters fall back to defaults when
    /// absent but must parse when present.
    pub fn resolve(blobs: SettingsBlobs) -> Result<Self, ApplicationError> {
        let settings = Self {
            initial_prompt: required_prompt(blobs.initial_prompt, SettingKey::InitialPrompt)?,
            system_prompt: required_prompt(blobs.system_prompt, SettingKey::SystemPrompt)?,
            promise_prompt: required_prompt(blobs.promise_prompt, SettingKey::PromisePrompt)?,
            top_p: optional_decimal(blobs.top_p, SettingKey::TopP)?
                .unwrap_or_else(Self::default_top_p),
            temperature: optional_decimal(blobs.temperature, SettingKey::Temperature)?
                .unwrap_or_else(Self::default_temperature),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ApplicationError> {
        for key in [SettingKey::InitialPrompt, SettingKey::SystemPrompt, SettingKey::PromisePrompt]
        {
            if self.value_of(key).trim().is_empty() {
                return Err(ApplicationError::Configuration(format!(
                    "{} must not be empty",
                    key.blob_name()
                )));
            }
        }

        if self.top_p < Decimal::ZERO || self.top_p > Decimal::ONE {
            return Err(ApplicationError::Configuration(
                "top_p must be within 0..=1".to_string(),
            ));
        }
        if self.temperature < Decimal::ZERO || self.temperature > Decimal::TWO {
            return Err(ApplicationError::Configuration(
                "temperature must be within 0..=2".to_string(),
            ));
        }

        Ok(())
    }

    pub fn prompt(&self, kind: PromptKind) -> &str {
        match kind {
            PromptKind::Initial => &self.initial_prompt,
            PromptKind::SteadyState => &self.system_prompt,
            PromptKind::PromiseCheck => &self.promise_prompt,
        }
    }

    pub fn value_of(&self, key: SettingKey) -> String {
        match key {
            SettingKey::InitialPrompt => self.initial_prompt.clone(),
            SettingKey::SystemPrompt => self.system_prompt.clone(),
            SettingKey::PromisePrompt => self.promise_prompt.clone(),
            SettingKey::TopP => self.top_p.to_string(),
            SettingKey::Temperature => self.temperature.to_string(),
        }
    }
}

fn required_prompt(value: Option<String>, key: SettingKey) -> Result<String, ApplicationError> {
    value.filter(|prompt| !prompt.trim().is_empty()).ok_or_else(|| {
        ApplicationError::Configuration(format!("required prompt `{}` is missing", key.blob_name()))
    })
}

fn optional_decimal(value: Option<String>, key: SettingKey) -> Result<Option<Decimal>, ApplicationError> {
    match value.as_deref().map(str::trim).filter(|raw| !raw.is_empty()) {
        None => Ok(None),
        Some(raw) => Decimal::from_str(raw).map(Some).map_err(|_| {
            ApplicationError::Configuration(format!(
                "`{}` holds `{raw}`, which is not a decimal",
                key.blob_name()
            ))
        }),
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::{PromptKind, Settings, SettingsBlobs};
    use crate::errors::ApplicationError;

    fn blobs() -> SettingsBlobs {
        SettingsBlobs {
            initial_prompt: Some("Introduce yourself.".to_string()),
            system_prompt: Some("Track promises.".to_string()),
            promise_prompt: Some("Check open promises.".to_string()),
            top_p: None,
            temperature: Some("0.2".to_string()),
        }
    }

    #[test]
    fn sampling_parameters_default_when_absent() {
        let settings = Settings::resolve(blobs()).expect("settings");

        assert_eq!(settings.top_p, Decimal::ONE);
        assert_eq!(settings.temperature, Decimal::new(2, 1));
        assert_eq!(settings.prompt(PromptKind::PromiseCheck), "Check open promises.");
    }

    #[test]
    fn missing_prompt_is_a_configuration_error() {
        let error = Settings::resolve(SettingsBlobs { system_prompt: None, ..blobs() })
            .expect_err("missing prompt");

        assert!(matches!(error, ApplicationError::Configuration(ref message)
            if message.contains("system-prompt.txt")));
    }

    #[test]
    fn out_of_range_top_p_is_rejected() {
        let error = Settings::resolve(SettingsBlobs { top_p: Some("1.5".to_string()), ..blobs() })
            .expect_err("top_p > 1");

        assert!(matches!(error, ApplicationError::Configuration(_)));
    }
}
