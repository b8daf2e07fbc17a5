//! Prompt templates for autonomous turns.

use crate::knowledge::Topic;

/// Characters of each related item quoted in a continuation prompt.
const RELATED_EXCERPT_CHARS: usize = 100;

/// Prompt asking the model to open a fresh topic.
pub fn new_topic_prompt(topic: &str) -> String {
    format!(
        "Nobody has commented for a while, so talk freely to your listeners about the \
         following topic:\n\
         \n\
         Topic: {topic}\n\
         \n\
         Share your thoughts or memories about it in about 200 characters.\n\
         Open with a short lead-in that suits starting a casual chat, but skip greetings \
         to the listeners."
    )
}

/// Prompt asking the model to deepen its previous response.
pub fn continuation_prompt(last_response: &str, related: &str) -> String {
    format!(
        "Last time you said:\n\
         \"{last_response}\"\n\
         {related}\n\
         Dig deeper into this topic in about 200 characters.\n\
         Keep the natural flow of conversation and add related memories or thoughts.\n\
         Do not preface it with phrases like \"continuing from earlier\"; go straight \
         into the content."
    )
}

/// Bulleted block of related past remarks, or empty when there are none.
pub fn related_context_block(results: &[Topic]) -> String {
    if results.is_empty() {
        return String::new();
    }
    let bullets: Vec<String> = results
        .iter()
        .map(|topic| format!("- {}", excerpt(&topic.content)))
        .collect();
    format!(
        "\n[Related things you have said before]\n{}\n",
        bullets.join("\n")
    )
}

fn excerpt(content: &str) -> String {
    let mut chars = content.chars();
    let head: String = chars.by_ref().take(RELATED_EXCERPT_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}
