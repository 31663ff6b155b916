//! Application settings persistence
//!
//! Settings are stored as JSON at `~/.config/voicelink/settings.json`.
//! A missing file means defaults; command-line flags override both.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::audio::capture::DEFAULT_BLOCK_SIZE;
use crate::session::protocol::{
    Content, FunctionDeclaration, GenerationConfig, Part, PrebuiltVoiceConfig, SetupConfig,
    SpeechConfig, ToolSet, VoiceConfig,
};
use crate::tools::display_document_declaration;

/// Default live endpoint
pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// User-facing configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub endpoint: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    pub model: String,
    pub voice: Option<String>,
    pub system_instruction: Option<String>,
    /// Samples per outbound audio frame
    pub block_size: usize,
    /// Outbound messages buffered before new ones are dropped
    pub outbound_queue: usize,
    pub tools: Vec<FunctionDeclaration>,
    /// Directory for WAV dumps of each session, if enabled
    pub record_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key_env: "GEMINI_API_KEY".to_string(),
            model: "models/gemini-2.0-flash-live-001".to_string(),
            voice: None,
            system_instruction: Some(
                "You are a helpful voice assistant. Keep answers short and conversational. \
                 When the user asks for details, call display_document to show them."
                    .to_string(),
            ),
            block_size: DEFAULT_BLOCK_SIZE,
            outbound_queue: 64,
            tools: vec![display_document_declaration()],
            record_dir: None,
        }
    }
}

impl Settings {
    /// Default settings path
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("voicelink")
            .join("settings.json")
    }

    /// Load settings from `path`, falling back to defaults if it is missing
    pub fn load(path: &Path) -> Result<Self, String> {
        if !path.exists() {
            debug!("No settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read settings {}: {}", path.display(), e))?;

        let settings: Settings = serde_json::from_str(&contents)
            .map_err(|e| format!("Failed to parse settings {}: {}", path.display(), e))?;

        info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Save settings to `path`, creating parent directories
    pub fn save(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create settings directory: {}", e))?;
        }

        let contents = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize settings: {}", e))?;

        fs::write(path, contents).map_err(|e| format!("Failed to write settings: {}", e))
    }

    /// Read the API key from the configured environment variable
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
    }

    /// Build the configuration bundle sent when the channel opens
    pub fn setup_config(&self) -> SetupConfig {
        SetupConfig {
            model: self.model.clone(),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: self.voice.as_ref().map(|voice| SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: voice.clone(),
                        },
                    },
                }),
            },
            system_instruction: self.system_instruction.as_ref().map(|text| Content {
                parts: vec![Part::text(text.clone())],
            }),
            tools: if self.tools.is_empty() {
                Vec::new()
            } else {
                vec![ToolSet {
                    function_declarations: self.tools.clone(),
                }]
            },
        }
    }
}
