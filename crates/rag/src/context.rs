use crate::store::ScoredChunk;

pub const CONTEXT_HEADER: &str = "Relevant knowledge from training material:";
const SEPARATOR: &str = "---";

/// A retrieved chunk with the labels of the corpus it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedChunk {
    pub content: String,
    pub tag: String,
    pub group: String,
    pub distance: f32,
}

impl From<ScoredChunk> for RankedChunk {
    fn from(chunk: ScoredChunk) -> Self {
        Self {
            content: chunk.content,
            tag: chunk.tag,
            group: chunk.group,
            distance: chunk.distance,
        }
    }
}

/// Formats ranked chunks, best first, into one text block for a prompt.
/// No input yields an empty string rather than a bare header.
pub fn assemble_context(ranked: &[RankedChunk]) -> String {
    if ranked.is_empty() {
        return String::new();
    }
    let mut output = String::from(CONTEXT_HEADER);
    output.push('\n');
    for (idx, item) in ranked.iter().enumerate() {
        output.push_str(&format!("[{}] {} - {}\n", idx + 1, item.tag, item.group));
        output.push_str(item.content.trim());
        output.push('\n');
        output.push_str(SEPARATOR);
        output.push('\n');
    }
    output
}
