//! Agent persona definitions.
//!
//! A persona selects the system prompt that opens every generation request
//! for a call. The gateway picks one by name through the `agent` metadata
//! field; unknown names fall back to the general assistant.

use serde::{Deserialize, Serialize};

/// Supported agent personas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Persona {
    /// General helpful assistant.
    #[default]
    General,
    /// Technical support, troubleshooting focused.
    Technical,
    /// Sales representative with product information.
    Sales,
}

impl Persona {
    /// Resolves a gateway-provided persona name. Never fails.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "technical" => Self::Technical,
            "sales" => Self::Sales,
            _ => Self::General,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Technical => "technical",
            Self::Sales => "sales",
        }
    }

    /// The system prompt sent as the first message of a generation request.
    pub fn system_prompt(self) -> &'static str {
        match self {
            Self::General => "You are a general helpful assistant.",
            Self::Technical => {
                "You are a technical support assistant specializing in troubleshooting."
            }
            Self::Sales => "You are a sales representative who provides product information.",
        }
    }
}
