use std::sync::Arc;

use parking_lot::Mutex;
use tiktoken_rs::CoreBPE;

use crate::types::Message;

/// Model prefixes served by the o200k encoding; everything else falls back
/// to the len/4 heuristic.
const O200K_PREFIXES: &[&str] = &["gpt-4o", "gpt-4.1", "o1", "o3"];

fn bpe_for_model(model: &str) -> Option<Arc<Mutex<CoreBPE>>> {
    O200K_PREFIXES
        .iter()
        .any(|prefix| model.starts_with(prefix))
        .then(tiktoken_rs::o200k_base_singleton)
}

/// Estimates input tokens for a chat request, with the per-message framing
/// overhead the OpenAI chat format adds.
pub fn count_messages(model: &str, messages: &[Message]) -> u32 {
    let Some(bpe) = bpe_for_model(model) else {
        return quick_estimate(messages);
    };
    let bpe = bpe.lock();

    // Every message follows <|im_start|>{role}\n{content}<|im_end|>\n and
    // every reply is primed with <|im_start|>assistant<|message|>.
    let tokens_per_message = 3usize;
    let mut tokens = 3usize;
    for message in messages {
        tokens += tokens_per_message;
        tokens += bpe.encode_ordinary(&message.role).len();
        tokens += bpe.encode_ordinary(&message.content).len();
    }
    clamp_to_u32(tokens)
}

/// Fast len/4 heuristic used on the streaming path, where only a coarse
/// `X-Tokens-Input` header value is needed before upstream usage arrives.
pub fn quick_estimate(messages: &[Message]) -> u32 {
    let total: usize = messages.iter().map(|m| m.content.len() / 4).sum();
    clamp_to_u32(total)
}

fn clamp_to_u32(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quick_estimate_is_len_over_four() {
        let messages = vec![
            Message::new("user", "12345678"),
            Message::new("assistant", "1234"),
        ];
        assert_eq!(quick_estimate(&messages), 3);
        assert_eq!(quick_estimate(&[]), 0);
    }

    #[test]
    fn unknown_model_falls_back_to_heuristic() {
        let messages = vec![Message::new("user", "abcdefgh")];
        assert_eq!(count_messages("custom-model", &messages), 2);
    }

    #[test]
    fn known_model_counts_include_message_overhead() {
        let messages = vec![Message::new("user", "hello")];
        let tokens = count_messages("gpt-4o", &messages);
        // 3 (reply priming) + 3 (message framing) + role + content tokens.
        assert!(tokens >= 7, "got {tokens}");
    }
}
