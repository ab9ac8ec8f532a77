//! ChatML prompt assembly.
//!
//! The formatter is deterministic and applies no content escaping: marker
//! tokens inside message content are the tokenizer's concern, not ours.

use crate::conversation::Message;

pub(crate) const IM_START: &str = "<|im_start|>";
pub(crate) const IM_END: &str = "<|im_end|>";

/// Renders an ordered message list into a single ChatML prompt string,
/// ending with the assistant primer that opens the decode phase.
pub(crate) fn format_messages(messages: &[Message]) -> String {
    let mut prompt = String::new();

    for msg in messages {
        prompt.push_str(IM_START);
        prompt.push_str(msg.role.as_str());
        prompt.push('\n');
        prompt.push_str(&msg.content);
        prompt.push_str(IM_END);
        prompt.push('\n');
    }

    prompt.push_str(IM_START);
    prompt.push_str("assistant\n");

    prompt
}
