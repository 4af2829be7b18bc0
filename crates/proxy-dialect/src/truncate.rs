use std::collections::HashSet;

use proxy_core::{Content, Message, Role};

/// Minimum number of messages a truncation pass will leave behind, regardless
/// of how far over budget the conversation is (§4.8.7).
const MIN_SURVIVING_MESSAGES: usize = 2;

/// Resolves the token budget a conversation must fit within: an explicit
/// `max_prompt_tokens` wins outright; otherwise the budget is the model's
/// context window minus a reserve held back for the response. The reserve is
/// the declared `max_output_tokens` when the client sent one (capped at 10%
/// of the context window), else `max(4096, 10% of context window)`.
pub fn resolve_token_budget(
    max_prompt_tokens: Option<u32>,
    max_context_window_tokens: u32,
    max_output_tokens: Option<u32>,
) -> u32 {
    if let Some(budget) = max_prompt_tokens {
        return budget;
    }
    let ten_pct = max_context_window_tokens / 10;
    let reserve = match max_output_tokens {
        Some(declared) => declared.min(ten_pct.max(1)),
        None => ten_pct.max(4096),
    };
    max_context_window_tokens.saturating_sub(reserve)
}

/// Estimates a message's token footprint. Tests exercise this as a cheap,
/// deterministic stand-in; the production token count would defer to the
/// dialect's own tokenizer, but this crate doesn't own one.
pub fn estimate_tokens(message: &Message) -> u32 {
    let chars = message.content_as_string().len() as u32;
    (chars / 4).max(1)
}

/// Truncates a message list down to `budget` tokens (§4.8.7). System and
/// developer messages are always preserved. The trailing tool-call turn (the
/// last assistant message with `tool_calls` plus its replies) is never
/// dropped, and at least `MIN_SURVIVING_MESSAGES` non-system messages always
/// survive. Oldest non-system messages are dropped first; dropping an
/// assistant message with `tool_calls` also drops its contiguous run of
/// tool-role replies. A final orphan sweep removes any tool-role message
/// whose `tool_call_id` no longer has a declaring assistant message, and
/// strips `tool_calls` from an assistant message whose replies got cut,
/// dropping the message entirely if nothing else remains in it.
pub fn truncate_messages(messages: &[Message], budget: u32) -> Vec<Message> {
    let mut total: u32 = messages.iter().map(estimate_tokens).sum();
    if total <= budget || messages.is_empty() {
        return messages.to_vec();
    }

    let protected_from = trailing_tool_turn_start(messages);
    let mut kept: Vec<bool> = vec![true; messages.len()];
    let mut removable_non_system_count = messages
        .iter()
        .enumerate()
        .filter(|(i, m)| !is_system(m) && *i < protected_from)
        .count();

    let mut cursor = 0;
    while total > budget && removable_non_system_count > 0 {
        // find the oldest still-kept, non-system, non-protected message
        while cursor < messages.len()
            && (!kept[cursor] || is_system(&messages[cursor]) || cursor >= protected_from)
        {
            cursor += 1;
        }
        if cursor >= messages.len() {
            break;
        }
        let surviving_after_drop = kept.iter().filter(|k| **k).count() - 1;
        if surviving_after_drop < MIN_SURVIVING_MESSAGES {
            break;
        }

        total -= estimate_tokens(&messages[cursor]);
        kept[cursor] = false;
        removable_non_system_count -= 1;

        // an assistant message with tool_calls drags its reply run with it
        if matches!(messages[cursor].role, Role::Assistant)
            && messages[cursor].tool_calls.as_ref().map(|t| !t.is_empty()).unwrap_or(false)
        {
            let mut j = cursor + 1;
            while j < messages.len() && matches!(messages[j].role, Role::Tool) && j < protected_from {
                if kept[j] {
                    total -= estimate_tokens(&messages[j]);
                    kept[j] = false;
                    removable_non_system_count = removable_non_system_count.saturating_sub(1);
                }
                j += 1;
            }
        }
        cursor += 1;
    }

    let survivors: Vec<Message> = messages
        .iter()
        .zip(kept.iter())
        .filter(|(_, keep)| **keep)
        .map(|(m, _)| m.clone())
        .collect();

    sweep_orphans(survivors)
}

fn is_system(message: &Message) -> bool {
    matches!(message.role, Role::System | Role::Developer)
}

/// Index where the trailing contiguous tool-call turn begins: the last
/// assistant message carrying `tool_calls`, if its replies run to the end of
/// the list. Everything from that index onward is exempt from truncation.
fn trailing_tool_turn_start(messages: &[Message]) -> usize {
    let mut i = messages.len();
    while i > 0 && matches!(messages[i - 1].role, Role::Tool) {
        i -= 1;
    }
    if i > 0
        && matches!(messages[i - 1].role, Role::Assistant)
        && messages[i - 1].tool_calls.as_ref().map(|t| !t.is_empty()).unwrap_or(false)
    {
        i - 1
    } else {
        messages.len()
    }
}

/// Drops tool-role messages referencing ids no longer declared by any
/// surviving assistant message, and strips `tool_calls` from assistant
/// messages whose replies are now missing (dropping the assistant message
/// entirely if it carries no other content).
fn sweep_orphans(mut messages: Vec<Message>) -> Vec<Message> {
    let declared: HashSet<String> = messages
        .iter()
        .filter_map(|m| m.tool_calls.as_ref())
        .flat_map(|calls| calls.iter().map(|c| c.id.clone()))
        .collect();

    let replied: HashSet<String> = messages
        .iter()
        .filter(|m| matches!(m.role, Role::Tool))
        .filter_map(|m| m.tool_call_id.clone())
        .collect();

    messages.retain(|m| {
        if matches!(m.role, Role::Tool) {
            m.tool_call_id.as_ref().map(|id| declared.contains(id)).unwrap_or(false)
        } else {
            true
        }
    });

    for m in messages.iter_mut() {
        if let Some(calls) = &m.tool_calls {
            let all_replied = calls.iter().all(|c| replied.contains(&c.id));
            if !all_replied {
                m.tool_calls = None;
            }
        }
    }

    messages.retain(|m| {
        if matches!(m.role, Role::Assistant) && m.tool_calls.is_none() {
            !matches!(m.content, Content::Null) && !m.content_as_string().is_empty()
        } else {
            true
        }
    });

    messages
}
