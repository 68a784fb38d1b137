//! Host application boundary
//!
//! The chat application owns turns, the character card and the prompt. The
//! monitor only reads turns and the profile, writes named injections, and
//! receives typed `HostEvent`s. It never reaches into host UI state.

use serde::{Deserialize, Serialize};

pub const BASELINE_KEY: &str = "baseline";
pub const CORRECTION_KEY: &str = "correction";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorKind {
    User,
    Assistant,
    System,
}

impl AuthorKind {
    pub fn label(self) -> &'static str {
        match self {
            AuthorKind::User => "USER",
            AuthorKind::Assistant => "CHARACTER",
            AuthorKind::System => "NARRATOR",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub index: usize,
    pub author: AuthorKind,
    pub text: String,
}

impl Turn {
    pub fn new(index: usize, author: AuthorKind, text: &str) -> Self {
        Self {
            index,
            author,
            text: text.to_string(),
        }
    }

    /// Only non-empty assistant replies are scored.
    pub fn is_scorable(&self) -> bool {
        self.author == AuthorKind::Assistant && !self.text.trim().is_empty()
    }
}

/// Character card text, section by section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CharacterProfile {
    pub name: String,
    pub description: String,
    pub personality: String,
    pub scenario: String,
    pub examples: String,
    pub system_prompt: String,
    pub post_history_instructions: String,
}

impl CharacterProfile {
    /// All non-empty sections concatenated with headers. This is what gets
    /// hashed for calibration cache invalidation.
    pub fn full_text(&self) -> String {
        [
            ("Description", &self.description),
            ("Personality", &self.personality),
            ("Scenario", &self.scenario),
            ("Example dialogue", &self.examples),
            ("System instructions", &self.system_prompt),
            ("Post-history instructions", &self.post_history_instructions),
        ]
        .iter()
        .filter(|(_, text)| !text.trim().is_empty())
        .map(|(header, text)| format!("## {}\n{}", header, text.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
    }

    /// Cache key for calibrations.
    pub fn character_key(&self) -> String {
        self.name.trim().to_lowercase()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionPosition {
    /// Inside the chat history, `depth` messages from the end.
    InChat,
    BeforePrompt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionRole {
    System,
    User,
    Assistant,
}

pub trait TurnSource: Send + Sync {
    /// Chat the host is currently showing.
    fn current_chat_id(&self) -> Option<String>;

    /// All turns of the current chat, in order.
    fn turns(&self) -> Vec<Turn>;

    fn turn(&self, index: usize) -> Option<Turn> {
        self.turns().into_iter().find(|t| t.index == index)
    }

    fn turn_count(&self) -> usize {
        self.turns().len()
    }
}

pub trait ProfileSource: Send + Sync {
    fn profile(&self) -> Option<CharacterProfile>;

    /// Identity of the model currently generating replies.
    fn model_identity(&self) -> Option<String>;
}

pub trait InjectionSink: Send + Sync {
    fn set_injection(
        &self,
        key: &str,
        text: &str,
        position: InjectionPosition,
        depth: usize,
        role: InjectionRole,
    );

    fn clear_injection(&self, key: &str);
}

/// Everything the monitor needs from the host.
pub trait ChatHost: TurnSource + ProfileSource + InjectionSink {}

impl<T: TurnSource + ProfileSource + InjectionSink> ChatHost for T {}

/// Events pushed by the host into the monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostEvent {
    TurnRendered { index: usize },
    /// The turn at `index` was regenerated.
    TurnSwiped { index: usize },
    ChatChanged { chat_id: Option<String> },
    ModelChanged { model: String },
}
