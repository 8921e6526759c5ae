//! Per-step Manim code generation.

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::sanitize::{add_safeguards, clean_code, fallback_scene};
use crate::chunker::{ChunkKind, ContentChunk, group_by_step};
use crate::config::AnimationConfig;
use crate::llm::{ChatProvider, CompletionOptions, Message, TextGenerator};
use crate::store::AnimationSettings;

const CODE_SYSTEM_PROMPT: &str = "You are an expert at creating Manim animations.
Create a Manim Python script for the following text content.

Rules:
1. Start with \"from manim import *\"
2. Create a class called AutoScene(Scene)
3. Implement a construct() method
4. CRITICAL: Position ALL elements at the center of the screen using .move_to(ORIGIN)
5. CRITICAL: Use .scale() to ensure elements fit on screen (usually 0.5-0.8 scale)
6. Use only basic Manim features like Text, MathTex, Arrow, etc.
7. DO NOT use create_graph, Graph or any complex graphing features
8. DO NOT import any additional packages beyond manim
9. Make sure all MathTex expressions are valid LaTeX
10. Set the frame dimensions at module level: config.frame_width = 12 and config.frame_height = 8
11. Add self.wait(1) between animations for better pacing
12. For text, use the font_size parameter instead of scaling when possible
13. Group related elements together and position the group
14. Ensure ALL content stays within the frame boundaries

Your code must be compatible with Manim Community Edition 0.17.3.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeSource {
    Model,
    FineTuned,
    Fallback,
}

#[derive(Debug, Clone)]
pub struct StepCode {
    pub step: u32,
    pub code: String,
    pub source: CodeSource,
}

pub struct CodeGenerator {
    chat: Arc<dyn ChatProvider>,
    finetuned: Option<Arc<dyn TextGenerator>>,
    options: CompletionOptions,
}

pub fn step_prompt(step: u32, chunks: &[ContentChunk], style: &str) -> String {
    let chunks_text = chunks
        .iter()
        .map(|c| {
            let kind = match c.kind {
                ChunkKind::Text => "text",
                ChunkKind::Equation => "equation",
            };
            format!("Content: {}\nType: {}", c.content, kind)
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "Create a Manim animation for step {step} with the following content:\n\n\
         {chunks_text}\n\n\
         Animation Style: {style}\n\n\
         Return only the Python code without any additional explanation."
    )
}

fn finetuned_prompt(explanation: &str, style: &str) -> String {
    format!(
        "Create a Manim animation for the following content:\n\n\
         {explanation}\n\nAnimation Style: {style}"
    )
}

impl CodeGenerator {
    pub fn new(
        chat: Arc<dyn ChatProvider>,
        finetuned: Option<Arc<dyn TextGenerator>>,
        config: &AnimationConfig,
    ) -> Self {
        Self {
            chat,
            finetuned,
            options: CompletionOptions {
                temperature: config.code_temperature,
                max_tokens: config.code_max_tokens,
            },
        }
    }

    async fn generate_step(
        &self,
        step: u32,
        chunks: &[ContentChunk],
        style: &str,
    ) -> anyhow::Result<String> {
        let messages = [
            Message::system(CODE_SYSTEM_PROMPT),
            Message::user(step_prompt(step, chunks, style)),
        ];
        let raw = self.chat.complete(&messages, self.options).await?;
        Ok(add_safeguards(&clean_code(&raw)))
    }

    /// One scene per step, ascending. A step whose generation fails gets the
    /// fallback scene instead.
    pub async fn generate_steps(
        &self,
        chunks: &[ContentChunk],
        settings: &AnimationSettings,
    ) -> Vec<StepCode> {
        let steps = group_by_step(chunks);
        info!("Generating Manim code for {} steps", steps.len());

        let mut codes = Vec::with_capacity(steps.len());
        for (step, step_chunks) in steps {
            let code = match self.generate_step(step, &step_chunks, &settings.style).await {
                Ok(code) => {
                    debug!("Generated code for step {} ({} chars)", step, code.len());
                    StepCode {
                        step,
                        code,
                        source: CodeSource::Model,
                    }
                }
                Err(e) => {
                    warn!("Code generation failed for step {}: {:#}", step, e);
                    StepCode {
                        step,
                        code: fallback_scene(step, &step_chunks),
                        source: CodeSource::Fallback,
                    }
                }
            };
            codes.push(code);
        }
        codes
    }

    /// Single-step generation from the fine-tuned model, falling back to the
    /// chat model and then to the fallback scene.
    pub async fn generate_single(
        &self,
        explanation: &str,
        settings: &AnimationSettings,
    ) -> Vec<StepCode> {
        if let Some(ref finetuned) = self.finetuned {
            match finetuned
                .generate(&finetuned_prompt(explanation, &settings.style))
                .await
            {
                Ok(raw) => {
                    return vec![StepCode {
                        step: 1,
                        code: add_safeguards(&clean_code(&raw)),
                        source: CodeSource::FineTuned,
                    }];
                }
                Err(e) => warn!("Fine-tuned model failed, using chat model: {:#}", e),
            }
        }

        let single = [ContentChunk::new(explanation, ChunkKind::Text, 1)];
        self.generate_steps(&single, settings).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Scripted chat provider: pops one reply per call, recording prompts.
    pub struct ScriptedChat {
        pub replies: Mutex<Vec<Result<String>>>,
        pub prompts: Mutex<Vec<Vec<Message>>>,
    }

    impl ScriptedChat {
        pub fn new(replies: Vec<Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into_iter().rev().collect()),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ChatProvider for ScriptedChat {
        fn model(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            messages: &[Message],
            _options: CompletionOptions,
        ) -> Result<String> {
            self.prompts.lock().unwrap().push(messages.to_vec());
            self.replies
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(anyhow::anyhow!("no scripted reply")))
        }
    }

    struct FailingGenerator;

    #[async_trait]
    impl TextGenerator for FailingGenerator {
        async fn generate(&self, _prompt: &str) -> Result<String> {
            anyhow::bail!("endpoint down")
        }
    }

    struct FixedGenerator(&'static str);

    #[async_trait]
    impl TextGenerator for FixedGenerator {
        async fn generate(&self, _prompt: &str) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    fn chunks() -> Vec<ContentChunk> {
        vec![
            ContentChunk::new("Intro", ChunkKind::Text, 1),
            ContentChunk::new("$a^2 + b^2 = c^2$", ChunkKind::Equation, 2),
        ]
    }

    #[test]
    fn prompt_lists_chunks_and_style() {
        let prompt = step_prompt(2, &chunks()[1..], "standard");
        assert!(prompt.contains("step 2"));
        assert!(prompt.contains("Content: $a^2 + b^2 = c^2$\nType: equation"));
        assert!(prompt.contains("Animation Style: standard"));
    }

    #[tokio::test]
    async fn failed_step_gets_fallback() {
        let chat = ScriptedChat::new(vec![
            Ok(concat!(
                "```python\n",
                "class AutoScene(Scene):\n",
                "    def construct(self):\n",
                "        self.wait(1)\n",
                "```"
            )
            .to_string()),
            Err(anyhow::anyhow!("rate limited")),
        ]);
        let generator = CodeGenerator::new(chat.clone(), None, &AnimationConfig::default());

        let codes = generator
            .generate_steps(&chunks(), &AnimationSettings::default())
            .await;

        assert_eq!(codes.len(), 2);
        assert_eq!(codes[0].source, CodeSource::Model);
        assert!(codes[0].code.starts_with("from manim import *"));
        assert!(!codes[0].code.contains("```"));
        assert_eq!(codes[1].source, CodeSource::Fallback);
        assert!(codes[1].code.contains("Step 2"));
        assert_eq!(chat.prompts.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn finetuned_output_is_single_step() {
        let chat = ScriptedChat::new(vec![]);
        let generator = CodeGenerator::new(
            chat.clone(),
            Some(Arc::new(FixedGenerator("circle = Circle()"))),
            &AnimationConfig::default(),
        );

        let codes = generator
            .generate_single("Circles are round.", &AnimationSettings::default())
            .await;
        assert_eq!(codes.len(), 1);
        assert_eq!(codes[0].source, CodeSource::FineTuned);
        assert!(codes[0].code.contains("class AutoScene(Scene):"));
        assert!(chat.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn finetuned_failure_falls_back_twice() {
        let chat = ScriptedChat::new(vec![Err(anyhow::anyhow!("also down"))]);
        let generator = CodeGenerator::new(
            chat.clone(),
            Some(Arc::new(FailingGenerator)),
            &AnimationConfig::default(),
        );

        let codes = generator
            .generate_single("Circles are round.", &AnimationSettings::default())
            .await;
        assert_eq!(codes.len(), 1);
        assert_eq!(codes[0].source, CodeSource::Fallback);
        assert!(codes[0].code.contains("Circles are round."));
        assert_eq!(chat.prompts.lock().unwrap().len(), 1);
    }
}
