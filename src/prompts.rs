//! Prompts for page transcription, figure description and narrative audit.
//!
//! Kept together so prompt changes are reviewable in one place and tests can
//! inspect them without a model.

/// System prompt for transcribing a rendered page image.
pub const PAGE_SYSTEM_PROMPT: &str = r#"You are an OCR engine. Transcribe the text of this document page image as Markdown.

Rules:

1. Preserve ALL text in natural reading order. Do not summarise or paraphrase.
2. Keep structure: # / ## / ### for headings, - or 1. for lists, GFM pipe tables for tables.
3. Render mathematical expressions as LaTeX: $inline$ and $$display$$.
4. Skip page numbers and running headers/footers.
5. For a figure or chart, write a one-line placeholder such as [Figure: bar chart of GDP growth] instead of describing it.
6. Output ONLY the Markdown. No ```markdown fences, no commentary."#;

/// System prompt for describing one cropped figure.
pub const FIGURE_SYSTEM_PROMPT: &str = r#"You describe figures cropped from documents for readers who cannot see them.

Respond with a single JSON object and nothing else:
{"figure_type": "chart" | "diagram" | "table" | "image" | "map" | "other", "description": "..."}

The description should state what is plotted or shown, axes and units, the main trend or takeaway, and any legible labels or numbers. Keep it under 200 words."#;

/// Build the user message for a figure description request.
///
/// `context` is surrounding page text; empty context is omitted.
pub fn figure_user_prompt(context: &str) -> String {
    if context.trim().is_empty() {
        "Describe this figure.".to_string()
    } else {
        format!(
            "Describe this figure. Text from the same page, for context:\n\n\"\"\"{}\"\"\"",
            context
        )
    }
}

/// Prompt template for the narrative auditor. `{text}` is replaced with the
/// (possibly truncated) page text.
pub const AUDIT_PROMPT: &str = r#"You are an OCR quality auditor. Analyze this extracted text and determine if it's acceptable quality.

<extracted_text>
{text}
</extracted_text>

Evaluate based on:
1. Readability: Can humans understand the text?
2. Completeness: Does it seem like a complete extraction (no obvious missing parts)?
3. Accuracy: Are there obvious OCR errors (garbled text, wrong characters)?
4. Structure: Is the structure preserved (headers, paragraphs, lists)?

Respond in JSON format:
{
    "verdict": "acceptable" | "needs_review" | "poor",
    "confidence": 0.0-1.0,
    "issues": ["list of specific issues found"],
    "suggestions": ["suggestions for improvement"],
    "reasoning": "brief explanation of your verdict"
}

Only respond with valid JSON, no other text."#;

pub fn audit_prompt(text: &str) -> String {
    AUDIT_PROMPT.replace("{text}", text)
}

/// Description stored for figures when the chosen backend cannot describe them.
pub const FIGURE_NOT_SUPPORTED: &str = "Figure description not supported by this engine";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audit_prompt_embeds_text_once() {
        let p = audit_prompt("hello world");
        assert_eq!(p.matches("hello world").count(), 1);
        assert!(!p.contains("{text}"));
        assert!(p.contains("\"verdict\""));
    }

    #[test]
    fn figure_prompt_omits_empty_context() {
        assert_eq!(figure_user_prompt("  "), "Describe this figure.");
        assert!(figure_user_prompt("Table 2 shows").contains("Table 2 shows"));
    }
}
