//! Turning (prompt, context) into model input

use crate::engine::{ChatMessage, Model};
use crate::error::Error;

/// Placed between context and prompt when no chat template is configured
pub const DEFAULT_CONTEXT_SEPARATOR: &str = "\n\n";

/// Formatting policy shared by all workers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptFormat {
    /// `context + DEFAULT_CONTEXT_SEPARATOR + prompt`; context acts as a
    /// priming prefix
    Concat,
    /// Render through the model's chat template support
    ChatTemplate(String),
}

impl PromptFormat {
    pub fn from_template(template: Option<String>) -> Self {
        match template {
            Some(source) => PromptFormat::ChatTemplate(source),
            None => PromptFormat::Concat,
        }
    }

    pub fn format<M: Model>(&self, model: &M, prompt: &str, context: &str) -> Result<String, Error> {
        match self {
            PromptFormat::Concat => Ok(concat(prompt, context)),
            PromptFormat::ChatTemplate(template) => {
                let mut messages = Vec::with_capacity(2);
                if !context.is_empty() {
                    messages.push(ChatMessage::system(context));
                }
                messages.push(ChatMessage::user(prompt));
                model
                    .apply_chat_template(template, &messages)
                    .map_err(|e| Error::Template(e.to_string()))
            }
        }
    }
}

fn concat(prompt: &str, context: &str) -> String {
    if context.is_empty() {
        return prompt.to_string();
    }
    let mut input =
        String::with_capacity(context.len() + DEFAULT_CONTEXT_SEPARATOR.len() + prompt.len());
    input.push_str(context);
    input.push_str(DEFAULT_CONTEXT_SEPARATOR);
    input.push_str(prompt);
    input
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::scripted::ScriptedModel;

    #[test]
    fn test_concat_without_context() {
        let model = ScriptedModel::default();
        let input = PromptFormat::Concat.format(&model, "ni hao", "").unwrap();
        assert_eq!(input, "ni hao");
    }

    #[test]
    fn test_concat_with_context() {
        let model = ScriptedModel::default();
        let input = PromptFormat::Concat
            .format(&model, "fix typo", "feat: add parser")
            .unwrap();
        assert_eq!(input, "feat: add parser\n\nfix typo");
    }

    #[test]
    fn test_template_renders_system_and_user() {
        let model = ScriptedModel::default();
        let format = PromptFormat::from_template(Some("chatml".into()));
        let input = format.format(&model, "pinyin", "history").unwrap();
        assert_eq!(input, "[chatml]<system>history</system><user>pinyin</user>");

        let input = format.format(&model, "pinyin", "").unwrap();
        assert_eq!(input, "[chatml]<user>pinyin</user>");
    }

    #[test]
    fn test_malformed_template_is_template_error() {
        let model = ScriptedModel::default();
        let format = PromptFormat::ChatTemplate("{% broken".into());
        let err = format.format(&model, "p", "").unwrap_err();
        assert!(matches!(err, Error::Template(_)));
        assert!(err.to_string().starts_with("template failure: "));
    }
}
