use serde::{Deserialize, Serialize};
use std::fmt;

/// A wire representation of a chat/completion request or response.
///
/// Format chains are ordered lists of these; adapters are keyed by a
/// `(from, to)` pair of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dialect {
    #[serde(rename = "anthropic.messages")]
    AnthropicMessages,
    #[serde(rename = "openai.chat_completions")]
    OpenAIChat,
    #[serde(rename = "openai.responses")]
    OpenAIResponses,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::AnthropicMessages => "anthropic.messages",
            Dialect::OpenAIChat => "openai.chat_completions",
            Dialect::OpenAIResponses => "openai.responses",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "anthropic.messages" | "anthropic" => Some(Dialect::AnthropicMessages),
            "openai.chat_completions" | "openai" => Some(Dialect::OpenAIChat),
            "openai.responses" => Some(Dialect::OpenAIResponses),
            _ => None,
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_short_aliases() {
        assert_eq!(Dialect::parse("anthropic"), Some(Dialect::AnthropicMessages));
        assert_eq!(Dialect::parse("openai"), Some(Dialect::OpenAIChat));
        assert_eq!(Dialect::parse("gemini"), None);
    }

    #[test]
    fn display_round_trips_through_parse() {
        for dialect in [
            Dialect::AnthropicMessages,
            Dialect::OpenAIChat,
            Dialect::OpenAIResponses,
        ] {
            assert_eq!(Dialect::parse(dialect.as_str()), Some(dialect));
        }
    }
}
