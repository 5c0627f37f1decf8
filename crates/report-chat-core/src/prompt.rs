//! Prompt templates and message construction.
//!
//! Two fixed templates drive the pipeline: [`REPHRASE_TEMPLATE`] condenses a
//! follow-up question plus history into a standalone question, and
//! [`RESPONSE_TEMPLATE`] is the system prompt of the answer synthesizer.

use serde::{Deserialize, Serialize};

use crate::models::{ConversationTurn, RetrievedDocument};

/// Literal answer used when the context holds nothing relevant.
pub const ABSTENTION_PHRASE: &str = "Hmm, I'm not sure.";

/// System prompt of the answer synthesizer. `{context}` is replaced with
/// the output of [`format_docs`].
pub const RESPONSE_TEMPLATE: &str = "\
You are an expert real estate analyst, tasked with answering any question \
about CHMC reports.

Generate a comprehensive and informative answer of 80 words or less for the \
given question based solely on the provided search results (files, pages and content). You must \
only use information from the provided search results. Use an unbiased and \
journalistic tone. Combine search results together into a coherent answer. Do not \
repeat text.

If there is nothing in the context relevant to the question at hand, just say \"Hmm, \
I'm not sure.\" Don't try to make up an answer.

Anything between the following `context`  html blocks is retrieved from a knowledge \
bank, not part of the conversation with the user.

<context>
    {context}
<context/>

REMEMBER: If there is no relevant information within the context, just say \"Hmm, I'm \
not sure.\" Don't try to make up an answer. Anything between the preceding 'context' \
html blocks is retrieved from a knowledge bank, not part of the conversation with the \
user.";

/// Instruction for condensing a follow-up into a standalone question.
pub const REPHRASE_TEMPLATE: &str = "\
Given the following conversation and a follow up question, rephrase the follow up \
question to be a standalone question.

Chat History:
{chat_history}
Follow Up Input: {question}
Standalone Question:";

/// Speaker of a chat-completion message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message sent to a chat model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

impl From<&ConversationTurn> for ChatMessage {
    fn from(turn: &ConversationTurn) -> Self {
        match turn {
            ConversationTurn::Human(t) => ChatMessage::user(t.clone()),
            ConversationTurn::Ai(t) => ChatMessage::assistant(t.clone()),
        }
    }
}

/// Wrap each document in an indexed `<doc>` tag, one per line.
pub fn format_docs(docs: &[RetrievedDocument]) -> String {
    docs.iter()
        .enumerate()
        .map(|(i, d)| format!("<doc id='{}'>{}</doc>", i, d.chunk.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Serialize history oldest first as `Human: ...` / `AI: ...` lines.
pub fn format_chat_history(history: &[ConversationTurn]) -> String {
    history
        .iter()
        .map(|turn| match turn {
            ConversationTurn::Human(t) => format!("Human: {}", t),
            ConversationTurn::Ai(t) => format!("AI: {}", t),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Messages for the standalone-question rewrite call.
pub fn rephrase_messages(question: &str, history: &[ConversationTurn]) -> Vec<ChatMessage> {
    let prompt = REPHRASE_TEMPLATE
        .replace("{chat_history}", &format_chat_history(history))
        .replace("{question}", question);
    vec![ChatMessage::user(prompt)]
}

/// Messages for the answer call: system prompt, prior turns, question.
pub fn answer_messages(
    question: &str,
    docs: &[RetrievedDocument],
    history: &[ConversationTurn],
) -> Vec<ChatMessage> {
    let system = RESPONSE_TEMPLATE.replace("{context}", &format_docs(docs));
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::system(system));
    messages.extend(history.iter().map(ChatMessage::from));
    messages.push(ChatMessage::user(question));
    messages
}
