//! Prompt assembly: memory blocks in label order, then retrieved context
//! blocks with a fixed delimiter.

use engram_memory::ScoredPassage;
use engram_schema::{Agent, MemoryBlock};

pub const CONTEXT_DELIMITER: &str = "---";

/// One retrieval result group, labeled with where it came from.
pub struct RetrievedContext {
    /// "archival" or "source:<name>"
    pub origin: String,
    pub passages: Vec<ScoredPassage>,
}

/// The system prompt: base instructions, memory blocks, then retrieved
/// context. Blocks arrive in label order from the store.
pub fn build_system_prompt(
    agent: &Agent,
    blocks: &[MemoryBlock],
    retrieved: &[RetrievedContext],
) -> String {
    let mut prompt = format!(
        "You are {}, a stateful agent with persistent memory. \
         Edit your core memory with the memory tools when you learn something worth keeping; \
         use archival memory for long-term facts.",
        agent.name
    );

    if !blocks.is_empty() {
        prompt.push_str("\n\n<memory_blocks>");
        for block in blocks {
            prompt.push_str(&format!("\n<{label}>\n{value}\n</{label}>", label = block.label, value = block.value));
        }
        prompt.push_str("\n</memory_blocks>");
    }

    for group in retrieved {
        if group.passages.is_empty() {
            continue;
        }
        prompt.push_str(&format!(
            "\n\n<retrieved_context origin=\"{}\">",
            group.origin
        ));
        for scored in &group.passages {
            prompt.push('\n');
            prompt.push_str(CONTEXT_DELIMITER);
            prompt.push('\n');
            prompt.push_str(&scored.passage.text);
        }
        prompt.push('\n');
        prompt.push_str("</retrieved_context>");
    }

    prompt
}
