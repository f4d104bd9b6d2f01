//! Per-turn transcript accumulation

/// Who said something
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    /// The local user
    User,
    /// The remote assistant
    Assistant,
}

/// One finished utterance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEntry {
    /// Who spoke
    pub speaker: Speaker,
    /// Transcribed text, trimmed
    pub text: String,
}

/// Collects partial transcriptions until the turn completes
#[derive(Debug, Default)]
pub struct TurnTranscript {
    user: String,
    assistant: String,
}

impl TurnTranscript {
    /// Append partial user transcription
    pub fn push_user(&mut self, text: &str) {
        self.user.push_str(text);
    }

    /// Append partial assistant transcription
    pub fn push_assistant(&mut self, text: &str) {
        self.assistant.push_str(text);
    }

    /// Finish the turn, returning its non-empty entries with the user first
    pub fn take(&mut self) -> Vec<TranscriptEntry> {
        let user = std::mem::take(&mut self.user);
        let assistant = std::mem::take(&mut self.assistant);

        [(Speaker::User, user), (Speaker::Assistant, assistant)]
            .into_iter()
            .filter_map(|(speaker, text)| {
                let text = text.trim();
                (!text.is_empty()).then(|| TranscriptEntry {
                    speaker,
                    text: text.to_string(),
                })
            })
            .collect()
    }

    /// Discard anything accumulated
    pub fn reset(&mut self) {
        self.user.clear();
        self.assistant.clear();
    }
}
