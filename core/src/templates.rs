/// Instruction used when a request does not carry its own
pub const DEFAULT_INSTRUCTION: &str =
    "Given a web search query, retrieve relevant passages that answer the query";

const QWEN3_PREFIX: &str = "<|im_start|>system\nJudge whether the Document meets the requirements based on the Query and the Instruct provided. Answer only \"yes\" or \"no\".<|im_end|>\n<|im_start|>user\n";
const QWEN3_SUFFIX: &str = "<|im_end|>\n<|im_start|>assistant\n<think>\n\n</think>\n\n";

/// Template formatter for models that require structured prompts.
///
/// A prompt is `prefix + format_rerank(..) + suffix`. The prefix and suffix never change, so
/// they are tokenized once and only the middle part is tokenized per document.
pub trait TemplateFormatter {
    fn prefix(&self) -> &str;

    fn suffix(&self) -> &str;

    /// Format a query-document pair for reranking
    fn format_rerank(&self, query: &str, document: &str, instruction: Option<&str>) -> String;
}

/// Qwen3 reranker template formatter
#[derive(Debug, Clone)]
pub struct Qwen3RerankerTemplate {
    default_instruction: String,
}

impl Qwen3RerankerTemplate {
    pub fn new(default_instruction: Option<String>) -> Self {
        Self {
            default_instruction: default_instruction
                .unwrap_or_else(|| DEFAULT_INSTRUCTION.to_string()),
        }
    }

    pub fn default_instruction(&self) -> &str {
        &self.default_instruction
    }
}

impl Default for Qwen3RerankerTemplate {
    fn default() -> Self {
        Self::new(None)
    }
}

impl TemplateFormatter for Qwen3RerankerTemplate {
    fn prefix(&self) -> &str {
        QWEN3_PREFIX
    }

    fn suffix(&self) -> &str {
        QWEN3_SUFFIX
    }

    fn format_rerank(&self, query: &str, document: &str, instruction: Option<&str>) -> String {
        let instruction = instruction.unwrap_or(&self.default_instruction);
        format!("<Instruct>: {instruction}\n<Query>: {query}\n<Document>: {document}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qwen3_template() {
        let template = Qwen3RerankerTemplate::default();
        let formatted = template.format_rerank(
            "What is Deep Learning?",
            "Deep Learning is a branch of machine learning",
            None,
        );

        assert_eq!(
            formatted,
            "<Instruct>: Given a web search query, retrieve relevant passages that answer the query\n<Query>: What is Deep Learning?\n<Document>: Deep Learning is a branch of machine learning"
        );
        assert!(template.prefix().starts_with("<|im_start|>system\n"));
        assert!(template.prefix().ends_with("<|im_start|>user\n"));
        assert!(template.suffix().contains("<think>\n\n</think>"));
    }

    #[test]
    fn test_custom_instruction() {
        let template = Qwen3RerankerTemplate::default();
        let formatted = template.format_rerank("test query", "test doc", Some("Custom instruction"));

        assert!(formatted.starts_with("<Instruct>: Custom instruction\n"));
    }

    #[test]
    fn test_omitted_instruction_matches_default() {
        let template = Qwen3RerankerTemplate::default();
        assert_eq!(
            template.format_rerank("q", "d", None),
            template.format_rerank("q", "d", Some(DEFAULT_INSTRUCTION))
        );
    }

    #[test]
    fn test_server_wide_instruction() {
        let template = Qwen3RerankerTemplate::new(Some("Find code snippets".to_string()));
        assert_eq!(template.default_instruction(), "Find code snippets");
        assert!(template
            .format_rerank("q", "d", None)
            .starts_with("<Instruct>: Find code snippets\n"));
    }
}
